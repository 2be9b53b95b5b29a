//! Platform agent boundary.
//!
//! The daemon never touches the kernel FIB directly; it drives a
//! `PlatformAgent` implementation through this trait. All calls must be
//! idempotent, and `sync_*` replaces the whole table or reports an error.
//! Link and address events flow the other way through a regular component
//! queue owned by LinkMonitor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::network::IpPrefix;
use crate::types::{Label, NextHop};

/// One tracked interface as the platform sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub is_up: bool,
    /// Interface addresses in CIDR form.
    pub addresses: Vec<IpPrefix>,
}

impl InterfaceInfo {
    pub fn new(name: &str, is_up: bool, index: u32, addresses: Vec<IpPrefix>) -> Self {
        InterfaceInfo {
            name: name.to_string(),
            index,
            is_up,
            addresses,
        }
    }
}

/// Events pushed from the platform into LinkMonitor's queue.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    Link(InterfaceInfo),
    AddressAdded { iface: String, address: IpPrefix },
    AddressRemoved { iface: String, address: IpPrefix },
    /// The agent lost its state; Fib performs a full resync.
    AgentRestarted,
}

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    /// Worth retrying with backoff.
    #[error("transient platform error: {0}")]
    Transient(String),
    /// Retrying will not help; hold desired state and raise an alarm.
    #[error("permanent platform error: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicastRoute {
    pub prefix: IpPrefix,
    pub nexthops: BTreeSet<NextHop>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MplsRoute {
    pub label: Label,
    pub nexthops: BTreeSet<NextHop>,
}

/// The boundary the control plane depends on. Kernel or hardware
/// programming lives behind it.
#[async_trait]
pub trait PlatformAgent: Send + Sync {
    async fn get_interfaces(&self) -> Result<Vec<InterfaceInfo>, PlatformError>;

    async fn add_unicast_routes(&self, routes: Vec<UnicastRoute>) -> Result<(), PlatformError>;
    async fn delete_unicast_routes(&self, prefixes: Vec<IpPrefix>) -> Result<(), PlatformError>;
    /// Replace the entire unicast table atomically.
    async fn sync_unicast_routes(&self, routes: Vec<UnicastRoute>) -> Result<(), PlatformError>;

    async fn add_mpls_routes(&self, routes: Vec<MplsRoute>) -> Result<(), PlatformError>;
    async fn delete_mpls_routes(&self, labels: Vec<Label>) -> Result<(), PlatformError>;
    /// Replace the entire MPLS table atomically.
    async fn sync_mpls_routes(&self, routes: Vec<MplsRoute>) -> Result<(), PlatformError>;
}

/// In-memory agent used by tests and dry runs. Records programmed state
/// and can inject transient failures.
#[derive(Default)]
pub struct MockPlatform {
    interfaces: Mutex<Vec<InterfaceInfo>>,
    unicast: Mutex<BTreeMap<IpPrefix, BTreeSet<NextHop>>>,
    mpls: Mutex<BTreeMap<Label, BTreeSet<NextHop>>>,
    /// Each pending failure consumes one mutating call.
    fail_next: AtomicU32,
    write_ops: AtomicU64,
    sync_ops: AtomicU64,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(MockPlatform::default())
    }

    pub fn set_interfaces(&self, interfaces: Vec<InterfaceInfo>) {
        *self.interfaces.lock().unwrap() = interfaces;
    }

    /// Make the next `n` mutating calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn unicast_routes(&self) -> BTreeMap<IpPrefix, BTreeSet<NextHop>> {
        self.unicast.lock().unwrap().clone()
    }

    pub fn mpls_routes(&self) -> BTreeMap<Label, BTreeSet<NextHop>> {
        self.mpls.lock().unwrap().clone()
    }

    pub fn write_ops(&self) -> u64 {
        self.write_ops.load(Ordering::SeqCst)
    }

    pub fn sync_ops(&self) -> u64 {
        self.sync_ops.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), PlatformError> {
        let mut pending = self.fail_next.load(Ordering::SeqCst);
        while pending > 0 {
            match self.fail_next.compare_exchange(
                pending,
                pending - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(PlatformError::Transient("injected failure".to_string())),
                Err(actual) => pending = actual,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformAgent for MockPlatform {
    async fn get_interfaces(&self) -> Result<Vec<InterfaceInfo>, PlatformError> {
        Ok(self.interfaces.lock().unwrap().clone())
    }

    async fn add_unicast_routes(&self, routes: Vec<UnicastRoute>) -> Result<(), PlatformError> {
        self.gate()?;
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        let mut table = self.unicast.lock().unwrap();
        for route in routes {
            table.insert(route.prefix, route.nexthops);
        }
        Ok(())
    }

    async fn delete_unicast_routes(&self, prefixes: Vec<IpPrefix>) -> Result<(), PlatformError> {
        self.gate()?;
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        let mut table = self.unicast.lock().unwrap();
        for prefix in prefixes {
            table.remove(&prefix);
        }
        Ok(())
    }

    async fn sync_unicast_routes(&self, routes: Vec<UnicastRoute>) -> Result<(), PlatformError> {
        self.gate()?;
        self.sync_ops.fetch_add(1, Ordering::SeqCst);
        let mut table = self.unicast.lock().unwrap();
        table.clear();
        for route in routes {
            table.insert(route.prefix, route.nexthops);
        }
        Ok(())
    }

    async fn add_mpls_routes(&self, routes: Vec<MplsRoute>) -> Result<(), PlatformError> {
        self.gate()?;
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        let mut table = self.mpls.lock().unwrap();
        for route in routes {
            table.insert(route.label, route.nexthops);
        }
        Ok(())
    }

    async fn delete_mpls_routes(&self, labels: Vec<Label>) -> Result<(), PlatformError> {
        self.gate()?;
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        let mut table = self.mpls.lock().unwrap();
        for label in labels {
            table.remove(&label);
        }
        Ok(())
    }

    async fn sync_mpls_routes(&self, routes: Vec<MplsRoute>) -> Result<(), PlatformError> {
        self.gate()?;
        self.sync_ops.fetch_add(1, Ordering::SeqCst);
        let mut table = self.mpls.lock().unwrap();
        table.clear();
        for route in routes {
            table.insert(route.label, route.nexthops);
        }
        Ok(())
    }
}

/// Agent that only logs; the default when no platform is attached.
pub struct LoggingPlatform;

#[async_trait]
impl PlatformAgent for LoggingPlatform {
    async fn get_interfaces(&self) -> Result<Vec<InterfaceInfo>, PlatformError> {
        Ok(Vec::new())
    }

    async fn add_unicast_routes(&self, routes: Vec<UnicastRoute>) -> Result<(), PlatformError> {
        for route in &routes {
            tracing::info!(prefix = %route.prefix, nexthops = route.nexthops.len(), "add unicast route");
        }
        Ok(())
    }

    async fn delete_unicast_routes(&self, prefixes: Vec<IpPrefix>) -> Result<(), PlatformError> {
        for prefix in &prefixes {
            tracing::info!(prefix = %prefix, "delete unicast route");
        }
        Ok(())
    }

    async fn sync_unicast_routes(&self, routes: Vec<UnicastRoute>) -> Result<(), PlatformError> {
        tracing::info!(routes = routes.len(), "sync unicast routes");
        Ok(())
    }

    async fn add_mpls_routes(&self, routes: Vec<MplsRoute>) -> Result<(), PlatformError> {
        for route in &routes {
            tracing::info!(label = route.label, "add mpls route");
        }
        Ok(())
    }

    async fn delete_mpls_routes(&self, labels: Vec<Label>) -> Result<(), PlatformError> {
        for label in &labels {
            tracing::info!(label, "delete mpls route");
        }
        Ok(())
    }

    async fn sync_mpls_routes(&self, routes: Vec<MplsRoute>) -> Result<(), PlatformError> {
        tracing::info!(routes = routes.len(), "sync mpls routes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nexthop(addr: &str) -> NextHop {
        NextHop {
            address: addr.parse().unwrap(),
            iface: "eth0".to_string(),
            weight: 0,
            metric: 1,
            area: "0".to_string(),
            mpls_action: None,
            neighbor_node: None,
        }
    }

    #[tokio::test]
    async fn test_mock_platform_add_delete() {
        let platform = MockPlatform::new();
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        let mut nexthops = BTreeSet::new();
        nexthops.insert(nexthop("fe80::1"));

        platform
            .add_unicast_routes(vec![UnicastRoute {
                prefix,
                nexthops: nexthops.clone(),
            }])
            .await
            .unwrap();
        assert_eq!(platform.unicast_routes().len(), 1);

        // idempotent re-add
        platform
            .add_unicast_routes(vec![UnicastRoute { prefix, nexthops }])
            .await
            .unwrap();
        assert_eq!(platform.unicast_routes().len(), 1);

        platform.delete_unicast_routes(vec![prefix]).await.unwrap();
        assert!(platform.unicast_routes().is_empty());
    }

    #[tokio::test]
    async fn test_mock_platform_sync_replaces() {
        let platform = MockPlatform::new();
        let p1: IpPrefix = "10.0.1.0/24".parse().unwrap();
        let p2: IpPrefix = "10.0.2.0/24".parse().unwrap();
        let mut nexthops = BTreeSet::new();
        nexthops.insert(nexthop("fe80::1"));

        platform
            .add_unicast_routes(vec![UnicastRoute {
                prefix: p1,
                nexthops: nexthops.clone(),
            }])
            .await
            .unwrap();
        platform
            .sync_unicast_routes(vec![UnicastRoute {
                prefix: p2,
                nexthops,
            }])
            .await
            .unwrap();

        let table = platform.unicast_routes();
        assert!(!table.contains_key(&p1));
        assert!(table.contains_key(&p2));
    }

    #[tokio::test]
    async fn test_mock_platform_failure_injection() {
        let platform = MockPlatform::new();
        platform.fail_next(1);
        let err = platform.add_unicast_routes(vec![]).await;
        assert!(matches!(err, Err(PlatformError::Transient(_))));
        assert!(platform.add_unicast_routes(vec![]).await.is_ok());
    }
}
