//! Core routing data model.
//!
//! These types cross component boundaries by value; each has exactly one
//! owning component (LinkMonitor owns the AdjacencyDatabase, PrefixManager
//! the PrefixDatabase, Decision the RouteDatabase). Everything is `Ord` so
//! that databases iterate deterministically.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::network::IpPrefix;

pub type NodeName = String;
pub type AreaId = String;

/// MPLS label value. 0 means "no label assigned".
pub type Label = u32;

/// One established, bidirectional neighbor session on one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjacency {
    pub remote_node: NodeName,
    pub local_iface: String,
    pub remote_iface: String,
    pub v4_nexthop: Option<Ipv4Addr>,
    pub v6_nexthop: Option<Ipv6Addr>,
    pub metric: u32,
    pub adj_label: Label,
    pub weight: u32,
    /// Unix millis when the session last transitioned to ESTABLISHED.
    pub timestamp_ms: u64,
    pub is_overloaded: bool,
}

impl Adjacency {
    /// Nexthop address for the requested family, if the session carries one.
    pub fn nexthop(&self, v4: bool) -> Option<IpAddr> {
        if v4 {
            self.v4_nexthop.map(IpAddr::V4)
        } else {
            self.v6_nexthop.map(IpAddr::V6)
        }
    }
}

/// A node's published view of its adjacencies in one area.
///
/// `version` strictly increases on any observable change; consumers ignore
/// databases whose version does not advance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencyDatabase {
    pub node: NodeName,
    pub area: AreaId,
    pub node_label: Label,
    pub is_overloaded: bool,
    pub version: u64,
    pub adjacencies: Vec<Adjacency>,
}

impl AdjacencyDatabase {
    /// All adjacencies toward one remote node (parallel links allowed).
    pub fn adjacencies_to<'a>(
        &'a self,
        remote: &'a str,
    ) -> impl Iterator<Item = &'a Adjacency> + 'a {
        self.adjacencies.iter().filter(move |a| a.remote_node == remote)
    }
}

/// Where a prefix entry came from. Order is advertisement priority:
/// greater wins when the same prefix is originated by several sources.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PrefixType {
    Rib,
    Static,
    Loopback,
    Config,
    Bgp,
    Vip,
}

impl PrefixType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefixType::Rib => "rib",
            PrefixType::Static => "static",
            PrefixType::Loopback => "loopback",
            PrefixType::Config => "config",
            PrefixType::Bgp => "bgp",
            PrefixType::Vip => "vip",
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ForwardingType {
    #[default]
    Ip,
    SrMpls,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ForwardingAlgorithm {
    #[default]
    SpEcmp,
    Ksp2EdEcmp,
}

/// Route-selection metrics. Higher preference wins; lower distance wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrefixMetrics {
    pub path_preference: i32,
    pub source_preference: i32,
    pub distance: u32,
}

impl Default for PrefixMetrics {
    fn default() -> Self {
        PrefixMetrics {
            path_preference: 1000,
            source_preference: 100,
            distance: 0,
        }
    }
}

/// One originated prefix with its advertisement attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixEntry {
    pub prefix: IpPrefix,
    pub prefix_type: PrefixType,
    pub forwarding_type: ForwardingType,
    pub forwarding_algorithm: ForwardingAlgorithm,
    pub metrics: PrefixMetrics,
    pub tags: BTreeSet<String>,
    pub min_nexthops: Option<usize>,
    /// Areas the advertisement has crossed, most recent last.
    pub area_stack: Vec<AreaId>,
}

impl PrefixEntry {
    pub fn new(prefix: IpPrefix, prefix_type: PrefixType) -> Self {
        PrefixEntry {
            prefix: prefix.trimmed(),
            prefix_type,
            forwarding_type: ForwardingType::default(),
            forwarding_algorithm: ForwardingAlgorithm::default(),
            metrics: PrefixMetrics::default(),
            tags: BTreeSet::new(),
            min_nexthops: None,
            area_stack: Vec::new(),
        }
    }
}

/// A node's published set of originated prefixes in one area.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixDatabase {
    pub node: NodeName,
    pub area: AreaId,
    pub version: u64,
    pub entries: Vec<PrefixEntry>,
}

/// MPLS operation attached to a next hop.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MplsAction {
    Swap { label: Label },
    Php,
    PopAndLookup,
    Push { labels: Vec<Label> },
}

impl fmt::Display for MplsAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MplsAction::Swap { label } => write!(f, "swap {}", label),
            MplsAction::Php => write!(f, "php"),
            MplsAction::PopAndLookup => write!(f, "pop"),
            MplsAction::Push { labels } => {
                let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
                write!(f, "push {}", labels.join("/"))
            }
        }
    }
}

/// One way to reach a destination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NextHop {
    pub address: IpAddr,
    pub iface: String,
    pub weight: u32,
    pub metric: u32,
    pub area: AreaId,
    pub mpls_action: Option<MplsAction>,
    pub neighbor_node: Option<NodeName>,
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "via {} dev {} weight {} metric {}",
            self.address, self.iface, self.weight, self.metric
        )?;
        if let Some(action) = &self.mpls_action {
            write!(f, " mpls {}", action)?;
        }
        Ok(())
    }
}

/// Decision output: programmed reachability for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDatabase {
    pub unicast: BTreeMap<IpPrefix, BTreeSet<NextHop>>,
    pub mpls: BTreeMap<Label, BTreeSet<NextHop>>,
}

impl RouteDatabase {
    pub fn is_empty(&self) -> bool {
        self.unicast.is_empty() && self.mpls.is_empty()
    }
}

/// Static route injected via config or the runtime API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub prefix: IpPrefix,
    pub nexthops: BTreeSet<NextHop>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nexthop(addr: &str, iface: &str, metric: u32) -> NextHop {
        NextHop {
            address: addr.parse().unwrap(),
            iface: iface.to_string(),
            weight: 0,
            metric,
            area: "0".to_string(),
            mpls_action: None,
            neighbor_node: None,
        }
    }

    #[test]
    fn test_prefix_type_priority_order() {
        assert!(PrefixType::Vip > PrefixType::Bgp);
        assert!(PrefixType::Bgp > PrefixType::Config);
        assert!(PrefixType::Config > PrefixType::Loopback);
        assert!(PrefixType::Loopback > PrefixType::Static);
        assert!(PrefixType::Static > PrefixType::Rib);
    }

    #[test]
    fn test_prefix_entry_trims_host_bits() {
        let entry = PrefixEntry::new("10.1.2.3/24".parse().unwrap(), PrefixType::Config);
        assert_eq!(entry.prefix.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn test_nexthop_set_is_deterministic() {
        let mut a = BTreeSet::new();
        a.insert(nexthop("fe80::2", "1/2", 2));
        a.insert(nexthop("fe80::3", "1/3", 2));

        let mut b = BTreeSet::new();
        b.insert(nexthop("fe80::3", "1/3", 2));
        b.insert(nexthop("fe80::2", "1/2", 2));

        let va: Vec<_> = a.iter().collect();
        let vb: Vec<_> = b.iter().collect();
        assert_eq!(va, vb);
    }

    #[test]
    fn test_route_database_equality_ignores_insert_order() {
        let mut db1 = RouteDatabase::default();
        let mut db2 = RouteDatabase::default();
        let p: IpPrefix = "5502::/64".parse().unwrap();

        let mut set1 = BTreeSet::new();
        set1.insert(nexthop("fe80::2", "1/2", 2));
        set1.insert(nexthop("fe80::3", "1/3", 2));
        db1.unicast.insert(p, set1);

        let mut set2 = BTreeSet::new();
        set2.insert(nexthop("fe80::3", "1/3", 2));
        set2.insert(nexthop("fe80::2", "1/2", 2));
        db2.unicast.insert(p, set2);

        assert_eq!(db1, db2);
    }
}
