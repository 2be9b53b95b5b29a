//! Fib: converges the platform agent onto Decision's route database.
//!
//! Keeps a desired table (latest from Decision) and a believed-programmed
//! table, and drives the agent with deltas. Deletions wait out
//! `route_delete_delay_ms` so transient withdrawals never reach the
//! platform; transient agent errors retry with backoff against the desired
//! table, which makes replay idempotent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::messaging::{Inbox, Outbox};
use crate::network::IpPrefix;
use crate::platform::{MplsRoute, PlatformAgent, PlatformError, PlatformEvent, UnicastRoute};
use crate::types::{Label, RouteDatabase};
use crate::watchdog::Tick;

pub struct FibEngine {
    agent: Arc<dyn PlatformAgent>,
    delete_delay: Duration,
    gr_enabled: bool,
    desired: RouteDatabase,
    programmed: RouteDatabase,
    synced_once: bool,
    pending_unicast_deletes: BTreeMap<IpPrefix, Instant>,
    pending_mpls_deletes: BTreeMap<Label, Instant>,
    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
    consecutive_failures: u32,
}

impl FibEngine {
    pub fn new(config: &Config, agent: Arc<dyn PlatformAgent>) -> Self {
        FibEngine {
            agent,
            delete_delay: config.route_delete_delay(),
            gr_enabled: config.is_graceful_restart_enabled(),
            desired: RouteDatabase::default(),
            programmed: RouteDatabase::default(),
            synced_once: false,
            pending_unicast_deletes: BTreeMap::new(),
            pending_mpls_deletes: BTreeMap::new(),
            backoff: ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(8)),
            retry_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn set_desired(&mut self, routes: RouteDatabase) {
        self.desired = routes;
    }

    pub fn mark_agent_restarted(&mut self) {
        warn!("platform agent restarted, scheduling full resync");
        self.synced_once = false;
        self.programmed = RouteDatabase::default();
        self.pending_unicast_deletes.clear();
        self.pending_mpls_deletes.clear();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines: Vec<Instant> = Vec::new();
        deadlines.extend(self.retry_at);
        deadlines.extend(self.pending_unicast_deletes.values().copied());
        deadlines.extend(self.pending_mpls_deletes.values().copied());
        deadlines.into_iter().min()
    }

    /// Push the platform toward the desired table. Call on every desired
    /// change, platform event and deadline expiry.
    pub async fn reconcile(&mut self, now: Instant) {
        if let Some(at) = self.retry_at {
            if at > now {
                return;
            }
            self.retry_at = None;
        }

        let result = if self.synced_once {
            self.apply_delta(now).await
        } else {
            self.full_sync().await
        };
        match result {
            Ok(()) => {
                self.backoff.reset();
                self.consecutive_failures = 0;
            }
            Err(err) => {
                self.consecutive_failures += 1;
                let delay = self.backoff.bump(now);
                self.retry_at = Some(now + delay);
                match err {
                    PlatformError::Transient(msg) => warn!(
                        error = %msg,
                        retry_ms = delay.as_millis() as u64,
                        "transient platform failure, will retry"
                    ),
                    PlatformError::Permanent(msg) => error!(
                        error = %msg,
                        failures = self.consecutive_failures,
                        "persistent platform failure, holding desired routes"
                    ),
                }
            }
        }
    }

    async fn full_sync(&mut self) -> Result<(), PlatformError> {
        info!(
            unicast = self.desired.unicast.len(),
            mpls = self.desired.mpls.len(),
            "full route sync"
        );
        let unicast: Vec<UnicastRoute> = self
            .desired
            .unicast
            .iter()
            .map(|(prefix, nexthops)| UnicastRoute {
                prefix: *prefix,
                nexthops: nexthops.clone(),
            })
            .collect();
        self.agent.sync_unicast_routes(unicast).await?;
        let mpls: Vec<MplsRoute> = self
            .desired
            .mpls
            .iter()
            .map(|(label, nexthops)| MplsRoute {
                label: *label,
                nexthops: nexthops.clone(),
            })
            .collect();
        self.agent.sync_mpls_routes(mpls).await?;
        self.programmed = self.desired.clone();
        self.pending_unicast_deletes.clear();
        self.pending_mpls_deletes.clear();
        self.synced_once = true;
        Ok(())
    }

    async fn apply_delta(&mut self, now: Instant) -> Result<(), PlatformError> {
        // adds and modifications
        let mut unicast_updates = Vec::new();
        for (prefix, nexthops) in &self.desired.unicast {
            self.pending_unicast_deletes.remove(prefix);
            if self.programmed.unicast.get(prefix) != Some(nexthops) {
                unicast_updates.push(UnicastRoute {
                    prefix: *prefix,
                    nexthops: nexthops.clone(),
                });
            }
        }
        let mut mpls_updates = Vec::new();
        for (label, nexthops) in &self.desired.mpls {
            self.pending_mpls_deletes.remove(label);
            if self.programmed.mpls.get(label) != Some(nexthops) {
                mpls_updates.push(MplsRoute {
                    label: *label,
                    nexthops: nexthops.clone(),
                });
            }
        }

        // schedule deletions for withdrawn entries
        for prefix in self.programmed.unicast.keys() {
            if !self.desired.unicast.contains_key(prefix) {
                self.pending_unicast_deletes
                    .entry(*prefix)
                    .or_insert(now + self.delete_delay);
            }
        }
        for label in self.programmed.mpls.keys() {
            if !self.desired.mpls.contains_key(label) {
                self.pending_mpls_deletes
                    .entry(*label)
                    .or_insert(now + self.delete_delay);
            }
        }

        if !unicast_updates.is_empty() {
            debug!(routes = unicast_updates.len(), "programming unicast routes");
            self.agent.add_unicast_routes(unicast_updates.clone()).await?;
            for route in unicast_updates {
                self.programmed.unicast.insert(route.prefix, route.nexthops);
            }
        }
        if !mpls_updates.is_empty() {
            debug!(routes = mpls_updates.len(), "programming mpls routes");
            self.agent.add_mpls_routes(mpls_updates.clone()).await?;
            for route in mpls_updates {
                self.programmed.mpls.insert(route.label, route.nexthops);
            }
        }

        // fire deletions whose grace window has passed
        let due_unicast: Vec<IpPrefix> = self
            .pending_unicast_deletes
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(prefix, _)| *prefix)
            .collect();
        if !due_unicast.is_empty() {
            debug!(routes = due_unicast.len(), "deleting unicast routes");
            self.agent.delete_unicast_routes(due_unicast.clone()).await?;
            for prefix in due_unicast {
                self.pending_unicast_deletes.remove(&prefix);
                self.programmed.unicast.remove(&prefix);
            }
        }
        let due_mpls: Vec<Label> = self
            .pending_mpls_deletes
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(label, _)| *label)
            .collect();
        if !due_mpls.is_empty() {
            debug!(routes = due_mpls.len(), "deleting mpls routes");
            self.agent.delete_mpls_routes(due_mpls.clone()).await?;
            for label in due_mpls {
                self.pending_mpls_deletes.remove(&label);
                self.programmed.mpls.remove(&label);
            }
        }
        Ok(())
    }

    /// Orderly shutdown: with graceful restart the routes stay programmed
    /// for the restarting daemon to reclaim; without it they are removed.
    pub async fn shutdown(&mut self) {
        if self.gr_enabled {
            info!("leaving routes programmed for graceful restart");
            return;
        }
        info!("withdrawing all programmed routes");
        if let Err(err) = self.agent.sync_unicast_routes(Vec::new()).await {
            warn!(error = %err, "failed to withdraw unicast routes on shutdown");
        }
        if let Err(err) = self.agent.sync_mpls_routes(Vec::new()).await {
            warn!(error = %err, "failed to withdraw mpls routes on shutdown");
        }
    }
}

/// The Fib component task.
pub struct Fib {
    engine: FibEngine,
    routes_rx: Inbox<RouteDatabase>,
    platform_rx: Inbox<PlatformEvent>,
    watchdog: Outbox<Tick>,
}

impl Fib {
    pub fn new(
        engine: FibEngine,
        routes_rx: Inbox<RouteDatabase>,
        platform_rx: Inbox<PlatformEvent>,
        watchdog: Outbox<Tick>,
    ) -> Self {
        Fib {
            engine,
            routes_rx,
            platform_rx,
            watchdog,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let Fib {
            mut engine,
            mut routes_rx,
            mut platform_rx,
            watchdog,
        } = self;
        let mut liveness = tokio::time::interval(Duration::from_secs(1));

        loop {
            let deadline = engine
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = shutdown.recv() => break,
                routes = routes_rx.recv() => match routes {
                    Some(routes) => {
                        engine.set_desired(routes);
                        engine.reconcile(Instant::now()).await;
                    }
                    None => break,
                },
                event = platform_rx.recv() => match event {
                    Some(PlatformEvent::AgentRestarted) => {
                        engine.mark_agent_restarted();
                        engine.reconcile(Instant::now()).await;
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.into()) => {
                    engine.reconcile(Instant::now()).await;
                }
                _ = liveness.tick() => watchdog.send_lossy(Tick::new("fib")),
            }
        }
        engine.shutdown().await;
        info!("fib stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::basic_config;
    use crate::platform::MockPlatform;
    use crate::types::NextHop;
    use std::collections::BTreeSet;

    fn engine_with(delete_delay_ms: i64) -> (FibEngine, Arc<MockPlatform>) {
        let mut raw = basic_config("node-1");
        raw.route_delete_delay_ms = delete_delay_ms;
        let config = Config::new(raw).unwrap();
        let platform = MockPlatform::new();
        (FibEngine::new(&config, platform.clone()), platform)
    }

    fn routes_with(prefixes: &[&str]) -> RouteDatabase {
        let mut db = RouteDatabase::default();
        for p in prefixes {
            let mut set = BTreeSet::new();
            set.insert(NextHop {
                address: "fe80::2".parse().unwrap(),
                iface: "1/2".to_string(),
                weight: 0,
                metric: 1,
                area: "0".to_string(),
                mpls_action: None,
                neighbor_node: None,
            });
            db.unicast.insert(p.parse().unwrap(), set);
        }
        db
    }

    #[tokio::test]
    async fn test_first_reconcile_is_full_sync() {
        let (mut engine, platform) = engine_with(0);
        engine.set_desired(routes_with(&["fd00::1/64"]));
        engine.reconcile(Instant::now()).await;
        assert_eq!(platform.sync_ops(), 2);
        assert_eq!(platform.unicast_routes().len(), 1);
    }

    #[tokio::test]
    async fn test_converged_state_makes_no_calls() {
        let (mut engine, platform) = engine_with(0);
        engine.set_desired(routes_with(&["fd00::1/64"]));
        let now = Instant::now();
        engine.reconcile(now).await;
        let writes = platform.write_ops();
        let syncs = platform.sync_ops();

        // no input changes: platform state must stay fixed
        for i in 1..5 {
            engine.reconcile(now + Duration::from_millis(i)).await;
        }
        assert_eq!(platform.write_ops(), writes);
        assert_eq!(platform.sync_ops(), syncs);
    }

    #[tokio::test]
    async fn test_delete_waits_out_the_delay() {
        let (mut engine, platform) = engine_with(1000);
        let now = Instant::now();
        engine.set_desired(routes_with(&["fd00::1/64", "fd00::2/64"]));
        engine.reconcile(now).await;
        assert_eq!(platform.unicast_routes().len(), 2);

        engine.set_desired(routes_with(&["fd00::1/64"]));
        engine.reconcile(now + Duration::from_millis(10)).await;
        // still programmed: the grace window is open
        assert_eq!(platform.unicast_routes().len(), 2);
        assert!(engine.next_deadline().is_some());

        engine.reconcile(now + Duration::from_millis(1100)).await;
        assert_eq!(platform.unicast_routes().len(), 1);
    }

    #[tokio::test]
    async fn test_readd_cancels_pending_delete() {
        let (mut engine, platform) = engine_with(1000);
        let now = Instant::now();
        engine.set_desired(routes_with(&["fd00::1/64", "fd00::2/64"]));
        engine.reconcile(now).await;

        engine.set_desired(routes_with(&["fd00::1/64"]));
        engine.reconcile(now + Duration::from_millis(10)).await;
        engine.set_desired(routes_with(&["fd00::1/64", "fd00::2/64"]));
        engine.reconcile(now + Duration::from_millis(20)).await;

        // long after the delete would have fired
        engine.reconcile(now + Duration::from_millis(2000)).await;
        assert_eq!(platform.unicast_routes().len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_with_backoff() {
        let (mut engine, platform) = engine_with(0);
        let now = Instant::now();
        platform.fail_next(1);
        engine.set_desired(routes_with(&["fd00::1/64"]));
        engine.reconcile(now).await;
        assert!(platform.unicast_routes().is_empty());
        let retry_at = engine.next_deadline().expect("retry scheduled");
        assert!(retry_at > now);

        // before the retry deadline nothing happens
        engine.reconcile(now + Duration::from_millis(1)).await;
        assert!(platform.unicast_routes().is_empty());

        engine.reconcile(retry_at).await;
        assert_eq!(platform.unicast_routes().len(), 1);
    }

    #[tokio::test]
    async fn test_agent_restart_triggers_resync() {
        let (mut engine, platform) = engine_with(0);
        let now = Instant::now();
        engine.set_desired(routes_with(&["fd00::1/64"]));
        engine.reconcile(now).await;
        let syncs = platform.sync_ops();

        engine.mark_agent_restarted();
        engine.reconcile(now + Duration::from_millis(1)).await;
        assert_eq!(platform.sync_ops(), syncs + 2);
        assert_eq!(platform.unicast_routes().len(), 1);
    }
}
