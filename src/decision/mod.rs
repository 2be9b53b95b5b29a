//! Decision: consumes KvStore snapshots, runs SPF, emits the RouteDatabase.
//!
//! Recomputation is debounced: the first change after quiet schedules a
//! recompute after `debounce_min_ms`, and a burst of changes can push it
//! out no further than `debounce_max_ms` from the first.

pub mod spf;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::kvstore::Publication;
use crate::messaging::{Inbox, Outbox};
use crate::types::{
    AdjacencyDatabase, AreaId, NextHop, PrefixDatabase, RouteDatabase,
};
use crate::watchdog::Tick;

use spf::LinkState;

pub struct DecisionCore {
    config: Arc<Config>,
    states: BTreeMap<AreaId, LinkState>,
    routes_tx: Outbox<RouteDatabase>,
    last_routes: Option<RouteDatabase>,
    pending_since: Option<Instant>,
    last_change: Option<Instant>,
    dropped_records: u64,
}

impl DecisionCore {
    pub fn new(config: Arc<Config>, routes_tx: Outbox<RouteDatabase>) -> Self {
        let states = config
            .areas()
            .keys()
            .map(|a| (a.clone(), LinkState::default()))
            .collect();
        DecisionCore {
            config,
            states,
            routes_tx,
            last_routes: None,
            pending_since: None,
            last_change: None,
            dropped_records: 0,
        }
    }

    pub fn handle_publication(&mut self, publication: Publication, now: Instant) {
        let Publication {
            area,
            changed,
            expired,
        } = publication;
        let Some(state) = self.states.get_mut(&area) else {
            return;
        };
        let mut touched = false;

        for (key, kv) in changed {
            let Some(bytes) = kv.value else { continue };
            if let Some(node) = key.strip_prefix("adj:") {
                match bincode::deserialize::<AdjacencyDatabase>(&bytes) {
                    Ok(db) => {
                        if db.node != node {
                            self.dropped_records += 1;
                            warn!(
                                key = %key,
                                originator = %db.node,
                                "adjacency database under mismatched key, dropping"
                            );
                            continue;
                        }
                        state.adj_dbs.insert(node.to_string(), db);
                        touched = true;
                    }
                    Err(err) => {
                        self.dropped_records += 1;
                        warn!(key = %key, error = %err, "undecodable adjacency database");
                    }
                }
            } else if let Some(node) = key.strip_prefix("prefix:") {
                match bincode::deserialize::<PrefixDatabase>(&bytes) {
                    Ok(db) => {
                        if db.node != node {
                            self.dropped_records += 1;
                            warn!(
                                key = %key,
                                originator = %db.node,
                                "prefix database under mismatched key, dropping"
                            );
                            continue;
                        }
                        state.prefix_dbs.insert(node.to_string(), db);
                        touched = true;
                    }
                    Err(err) => {
                        self.dropped_records += 1;
                        warn!(key = %key, error = %err, "undecodable prefix database");
                    }
                }
            }
        }
        for key in expired {
            if let Some(node) = key.strip_prefix("adj:") {
                touched |= state.adj_dbs.remove(node).is_some();
            } else if let Some(node) = key.strip_prefix("prefix:") {
                touched |= state.prefix_dbs.remove(node).is_some();
            }
        }

        if touched {
            if self.pending_since.is_none() {
                self.pending_since = Some(now);
            }
            self.last_change = Some(now);
        }
    }

    /// When the debounced recompute should fire, if one is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        let first = self.pending_since?;
        let last = self.last_change.unwrap_or(first);
        let min = Duration::from_millis(self.config.decision().debounce_min_ms as u64);
        let max = Duration::from_millis(self.config.decision().debounce_max_ms as u64);
        Some((last + min).min(first + max))
    }

    pub fn recompute_if_due(&mut self, now: Instant) {
        match self.next_deadline() {
            Some(deadline) if deadline <= now => self.recompute(),
            _ => {}
        }
    }

    pub fn recompute(&mut self) {
        self.pending_since = None;
        self.last_change = None;
        let started = Instant::now();

        let mut merged = RouteDatabase::default();
        for (area, state) in &self.states {
            let routes = spf::compute_routes(area, self.config.node_name(), state);
            for (prefix, nexthops) in routes.unicast {
                merged.unicast.entry(prefix).or_insert(nexthops);
            }
            for (label, nexthops) in routes.mpls {
                merged.mpls.entry(label).or_insert(nexthops);
            }
        }
        self.add_static_routes(&mut merged);

        debug!(
            unicast = merged.unicast.len(),
            mpls = merged.mpls.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "spf run complete"
        );
        if self.last_routes.as_ref() == Some(&merged) {
            return;
        }
        info!(
            unicast = merged.unicast.len(),
            mpls = merged.mpls.len(),
            "route database changed"
        );
        self.last_routes = Some(merged.clone());
        self.routes_tx.send_lossy(merged);
    }

    fn add_static_routes(&self, routes: &mut RouteDatabase) {
        for route in self.config.static_routes() {
            let (Ok(prefix), Ok(address)) = (
                route.prefix.parse::<crate::network::IpPrefix>(),
                route.nexthop.parse::<std::net::IpAddr>(),
            ) else {
                continue;
            };
            routes.unicast.entry(prefix.trimmed()).or_insert_with(|| {
                let mut set = std::collections::BTreeSet::new();
                set.insert(NextHop {
                    address,
                    iface: route.iface.clone(),
                    weight: 0,
                    metric: route.metric,
                    area: "static".to_string(),
                    mpls_action: None,
                    neighbor_node: None,
                });
                set
            });
        }
    }
}

/// The Decision component task.
pub struct Decision {
    core: DecisionCore,
    inbox: Inbox<Publication>,
    watchdog: Outbox<Tick>,
}

impl Decision {
    pub fn new(core: DecisionCore, inbox: Inbox<Publication>, watchdog: Outbox<Tick>) -> Self {
        Decision {
            core,
            inbox,
            watchdog,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let Decision {
            mut core,
            mut inbox,
            watchdog,
        } = self;
        let mut liveness = tokio::time::interval(Duration::from_secs(1));

        loop {
            let deadline = core
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = shutdown.recv() => break,
                publication = inbox.recv() => match publication {
                    Some(publication) => {
                        core.handle_publication(publication, Instant::now());
                        core.recompute_if_due(Instant::now());
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.into()) => {
                    core.recompute_if_due(Instant::now());
                }
                _ = liveness.tick() => watchdog.send_lossy(Tick::new("decision")),
            }
        }
        info!("decision stopped");
    }
}
