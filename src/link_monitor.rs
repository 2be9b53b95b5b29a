//! LinkMonitor: bridges platform link state and Spark sessions into the
//! replicated AdjacencyDatabase.
//!
//! Owns the InterfaceDb and the node's adjacencies. Interface toggles are
//! flap-dampened: the AdjacencyDatabase publish is withheld by an
//! exponential backoff per interface, so a bouncing link produces a
//! bounded number of publications instead of one per transition.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::{Config, SrAdjLabelType};
use crate::kvstore::{self, KvStoreCommand};
use crate::messaging::{Inbox, Outbox};
use crate::network::{is_link_local_v6, IpPrefix};
use crate::persist::PersistentStore;
use crate::platform::{InterfaceInfo, PlatformEvent};
use crate::prefix_manager::PrefixManagerCommand;
use crate::spark::fsm::NeighborInfo;
use crate::spark::{NeighborEvent, NeighborEventKind, SparkCommand, TrackedInterface};
use crate::types::{Adjacency, AdjacencyDatabase, AreaId, Label, NodeName};
use crate::watchdog::Tick;

struct AdjEntry {
    info: NeighborInfo,
    rtt_us: Option<u64>,
    in_gr: bool,
    /// Session establishment time; kept stable so republishes only happen
    /// on real changes.
    since_ms: u64,
}

/// Everything but the event loop; synchronous and unit-testable.
pub struct LinkMonitorCore {
    config: Arc<Config>,
    spark_tx: Outbox<SparkCommand>,
    kvstore_tx: Outbox<KvStoreCommand>,
    prefix_tx: Outbox<PrefixManagerCommand>,
    interfaces: BTreeMap<String, InterfaceInfo>,
    adjacencies: BTreeMap<(AreaId, String), AdjEntry>,
    adj_db_version: u64,
    backoffs: HashMap<String, ExponentialBackoff>,
    /// Areas with a publish due, and the instant it may go out.
    pending: BTreeMap<AreaId, Instant>,
    last_published: BTreeMap<AreaId, Vec<Adjacency>>,
    persist: Option<PersistentStore>,
}

impl LinkMonitorCore {
    pub fn new(
        config: Arc<Config>,
        spark_tx: Outbox<SparkCommand>,
        kvstore_tx: Outbox<KvStoreCommand>,
        prefix_tx: Outbox<PrefixManagerCommand>,
    ) -> Self {
        LinkMonitorCore {
            config,
            spark_tx,
            kvstore_tx,
            prefix_tx,
            interfaces: BTreeMap::new(),
            adjacencies: BTreeMap::new(),
            adj_db_version: 0,
            backoffs: HashMap::new(),
            pending: BTreeMap::new(),
            last_published: BTreeMap::new(),
            persist: None,
        }
    }

    /// Attach the warm-restart snapshot; peer names are recorded as
    /// adjacencies come and go.
    pub fn with_persist(mut self, store: PersistentStore) -> Self {
        self.persist = Some(store);
        self
    }

    fn record_peers(&self) {
        let Some(persist) = &self.persist else {
            return;
        };
        let peers: std::collections::BTreeSet<NodeName> = self
            .adjacencies
            .values()
            .map(|e| e.info.node_name.clone())
            .collect();
        let mut state = persist.load();
        state.last_seen_peers = peers.into_iter().collect();
        if let Err(err) = persist.save(state) {
            debug!(error = %err, "failed to record peers in warm-restart state");
        }
    }

    /// First configured area claiming the interface.
    fn area_for_iface(&self, name: &str) -> Option<AreaId> {
        self.config
            .areas()
            .iter()
            .find(|(_, conf)| conf.should_discover_on_iface(name))
            .map(|(id, _)| id.clone())
    }

    fn should_redistribute(&self, name: &str) -> bool {
        self.config
            .areas()
            .values()
            .any(|conf| conf.should_redistribute_iface(name))
    }

    pub fn handle_platform_event(&mut self, event: PlatformEvent, now: Instant) {
        match event {
            PlatformEvent::Link(info) => self.apply_interface(info, now),
            PlatformEvent::AddressAdded { iface, address } => {
                if let Some(mut info) = self.interfaces.get(&iface).cloned() {
                    if !info.addresses.contains(&address) {
                        info.addresses.push(address);
                        self.apply_interface(info, now);
                    }
                }
            }
            PlatformEvent::AddressRemoved { iface, address } => {
                if let Some(mut info) = self.interfaces.get(&iface).cloned() {
                    info.addresses.retain(|a| *a != address);
                    self.apply_interface(info, now);
                }
            }
            // Fib handles agent restarts; nothing changes at link level
            PlatformEvent::AgentRestarted => {}
        }
    }

    fn apply_interface(&mut self, info: InterfaceInfo, now: Instant) {
        let name = info.name.clone();
        let prev = self.interfaces.insert(name.clone(), info.clone());
        let toggled = prev.as_ref().map(|p| p.is_up != info.is_up).unwrap_or(true);
        if toggled {
            let initial = self.config.link_monitor().linkflap_initial_backoff_ms;
            let max = self.config.link_monitor().linkflap_max_backoff_ms;
            let backoff = self
                .backoffs
                .entry(name.clone())
                .or_insert_with(|| {
                    ExponentialBackoff::new(
                        Duration::from_millis(initial as u64),
                        Duration::from_millis(max as u64),
                    )
                });
            let hold = backoff.bump(now);
            debug!(iface = %name, up = info.is_up, hold_ms = hold.as_millis() as u64, "interface toggled");
        }

        let area = self.area_for_iface(&name);
        if info.is_up {
            if let Some(area) = area {
                let link_local_v6 = info.addresses.iter().find_map(|p| match p.addr() {
                    IpAddr::V6(a) if is_link_local_v6(&IpAddr::V6(a)) => Some(a),
                    _ => None,
                });
                let v4_addr = info.addresses.iter().find_map(|p| match p.addr() {
                    IpAddr::V4(a) => Some(a),
                    _ => None,
                });
                let v6_addr = info.addresses.iter().find_map(|p| match p.addr() {
                    IpAddr::V6(a) if !is_link_local_v6(&IpAddr::V6(a)) => Some(a),
                    _ => None,
                });
                self.spark_tx.send_lossy(SparkCommand::TrackInterface {
                    area,
                    info: TrackedInterface {
                        name: name.clone(),
                        ifindex: info.index,
                        link_local_v6,
                        v4_addr,
                        v6_addr,
                    },
                });
            }
        } else {
            self.spark_tx.send_lossy(SparkCommand::UntrackInterface {
                iface: name.clone(),
            });
            // drop adjacencies on the dead interface without waiting for
            // the Spark events to come back around
            let dead: Vec<(AreaId, String)> = self
                .adjacencies
                .keys()
                .filter(|(_, iface)| *iface == name)
                .cloned()
                .collect();
            for key in dead {
                if let Some(entry) = self.adjacencies.remove(&key) {
                    self.after_adjacency_removed(&entry.info.node_name, &key.0, now);
                    self.request_publish(&key.0, &name, now);
                }
            }
        }

        self.update_redistribution(&name);
    }

    fn update_redistribution(&mut self, iface: &str) {
        let prefixes: Vec<IpPrefix> = match self.interfaces.get(iface) {
            Some(info) if info.is_up && self.should_redistribute(iface) => info
                .addresses
                .iter()
                .filter(|p| !is_link_local_v6(&p.addr()))
                .map(|p| p.trimmed())
                .collect(),
            _ => Vec::new(),
        };
        self.prefix_tx
            .send_lossy(PrefixManagerCommand::UpdateRedistributed {
                iface: iface.to_string(),
                prefixes,
            });
    }

    pub fn handle_neighbor_event(&mut self, event: NeighborEvent, now: Instant) {
        let NeighborEvent { area, iface, kind } = event;
        match kind {
            NeighborEventKind::Up(info) | NeighborEventKind::GrEnd(info) => {
                self.add_kv_peer(&info);
                let key = (area.clone(), iface.clone());
                let rtt_us = info.rtt_us;
                let was_gr = self
                    .adjacencies
                    .insert(
                        key,
                        AdjEntry {
                            info,
                            rtt_us,
                            in_gr: false,
                            since_ms: Utc::now().timestamp_millis() as u64,
                        },
                    )
                    .map(|e| e.in_gr)
                    .unwrap_or(false);
                if was_gr {
                    debug!(iface = %iface, area = %area, "adjacency recovered through graceful restart");
                }
                self.record_peers();
                self.request_publish(&area, &iface, now);
            }
            NeighborEventKind::Down { node_name } => {
                let key = (area.clone(), iface.clone());
                if self.adjacencies.remove(&key).is_some() {
                    self.after_adjacency_removed(&node_name, &area, now);
                    self.request_publish(&area, &iface, now);
                }
            }
            NeighborEventKind::GrStart { node_name } => {
                // routes stay programmed through the restart window
                info!(iface = %iface, neighbor = %node_name, "holding adjacency through graceful restart");
                if let Some(entry) = self.adjacencies.get_mut(&(area, iface)) {
                    entry.in_gr = true;
                }
            }
            NeighborEventKind::RttChange { node_name, rtt_us } => {
                let key = (area.clone(), iface.clone());
                if let Some(entry) = self.adjacencies.get_mut(&key) {
                    if entry.info.node_name == node_name {
                        entry.rtt_us = Some(rtt_us);
                        self.request_publish(&area, &iface, now);
                    }
                }
            }
        }
    }

    fn add_kv_peer(&self, info: &NeighborInfo) {
        let Some(addr) = kv_peer_addr(info) else {
            warn!(neighbor = %info.node_name, "no usable kvstore peer address");
            return;
        };
        self.kvstore_tx.send_lossy(KvStoreCommand::AddPeer {
            peer_name: info.node_name.clone(),
            addr,
        });
    }

    fn after_adjacency_removed(&mut self, node: &NodeName, _area: &str, _now: Instant) {
        let still_connected = self
            .adjacencies
            .values()
            .any(|e| e.info.node_name == *node);
        if !still_connected {
            self.kvstore_tx.send_lossy(KvStoreCommand::RemovePeer {
                peer_name: node.clone(),
            });
        }
        self.record_peers();
    }

    /// Queue a publish for the area, honoring the interface's flap hold.
    fn request_publish(&mut self, area: &str, iface: &str, now: Instant) {
        let not_before = self
            .backoffs
            .get(iface)
            .and_then(|b| b.hold_until())
            .map(|t| t.max(now))
            .unwrap_or(now);
        let entry = self.pending.entry(area.to_string()).or_insert(not_before);
        *entry = (*entry).max(not_before);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Publish every area whose hold has passed.
    pub fn flush_due(&mut self, now: Instant) {
        let due: Vec<AreaId> = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(area, _)| area.clone())
            .collect();
        for area in due {
            self.pending.remove(&area);
            self.publish_area(&area);
        }
    }

    fn publish_area(&mut self, area: &str) {
        let adjacencies = self.build_adjacencies(area);
        if self.last_published.get(area) == Some(&adjacencies) {
            return;
        }
        self.adj_db_version += 1;
        let db = AdjacencyDatabase {
            node: self.config.node_name().to_string(),
            area: area.to_string(),
            node_label: self.config.node_segment_label(area),
            is_overloaded: false,
            version: self.adj_db_version,
            adjacencies: adjacencies.clone(),
        };
        info!(
            area = %area,
            version = db.version,
            adjacencies = db.adjacencies.len(),
            "publishing adjacency database"
        );
        match bincode::serialize(&db) {
            Ok(bytes) => {
                self.kvstore_tx.send_lossy(KvStoreCommand::Set {
                    area: area.to_string(),
                    key: kvstore::adj_db_key(self.config.node_name()),
                    value: bytes,
                    version: None,
                });
                self.last_published.insert(area.to_string(), adjacencies);
            }
            Err(err) => warn!(error = %err, "failed to serialize adjacency database"),
        }
    }

    fn build_adjacencies(&self, area: &str) -> Vec<Adjacency> {
        let lm_conf = self.config.link_monitor();
        self.adjacencies
            .iter()
            .filter(|((a, _), _)| a == area)
            .map(|((_, iface), entry)| {
                let mut metric = lm_conf.default_link_metric;
                if lm_conf.enable_rtt_metric {
                    if let Some(rtt_us) = entry.rtt_us {
                        metric += (rtt_us / 100) as u32;
                    }
                }
                Adjacency {
                    remote_node: entry.info.node_name.clone(),
                    local_iface: iface.clone(),
                    remote_iface: entry.info.remote_iface.clone(),
                    v4_nexthop: entry.info.v4_addr,
                    v6_nexthop: entry.info.v6_addr,
                    metric,
                    adj_label: self.adj_label_for(area, iface),
                    weight: 0,
                    timestamp_ms: entry.since_ms,
                    is_overloaded: false,
                }
            })
            .collect()
    }

    fn adj_label_for(&self, area: &str, iface: &str) -> Label {
        let Some(area_conf) = self.config.areas().get(area) else {
            return 0;
        };
        let Some(adj_label) = &area_conf.sr_adj_label else {
            return 0;
        };
        match adj_label.label_type {
            SrAdjLabelType::Static => adj_label.static_label.unwrap_or(0),
            SrAdjLabelType::AutoIfindex => {
                let Some(range) = adj_label.adj_label_range else {
                    return 0;
                };
                let ifindex = self
                    .interfaces
                    .get(iface)
                    .map(|i| i.index as u64)
                    .unwrap_or(0);
                range.start_label + (ifindex % range.len()) as Label
            }
        }
    }

    #[cfg(test)]
    fn adjacency_count(&self) -> usize {
        self.adjacencies.len()
    }
}

fn kv_peer_addr(info: &NeighborInfo) -> Option<SocketAddr> {
    if info.kv_sync_port == 0 {
        return None;
    }
    let addr: Option<IpAddr> = info
        .v6_addr
        .map(IpAddr::V6)
        .or_else(|| info.v4_addr.map(IpAddr::V4))
        .or_else(|| info.transport_addrs.first().copied());
    addr.map(|a| SocketAddr::new(a, info.kv_sync_port))
}

/// The LinkMonitor component task.
pub struct LinkMonitor {
    core: LinkMonitorCore,
    platform_rx: Inbox<PlatformEvent>,
    neighbor_rx: Inbox<NeighborEvent>,
    watchdog: Outbox<Tick>,
}

impl LinkMonitor {
    pub fn new(
        core: LinkMonitorCore,
        platform_rx: Inbox<PlatformEvent>,
        neighbor_rx: Inbox<NeighborEvent>,
        watchdog: Outbox<Tick>,
    ) -> Self {
        LinkMonitor {
            core,
            platform_rx,
            neighbor_rx,
            watchdog,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let LinkMonitor {
            mut core,
            mut platform_rx,
            mut neighbor_rx,
            watchdog,
        } = self;
        let mut liveness = tokio::time::interval(Duration::from_secs(1));

        loop {
            let deadline = core
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = shutdown.recv() => break,
                event = platform_rx.recv() => match event {
                    Some(event) => {
                        core.handle_platform_event(event, Instant::now());
                        core.flush_due(Instant::now());
                    }
                    None => break,
                },
                event = neighbor_rx.recv() => match event {
                    Some(event) => {
                        core.handle_neighbor_event(event, Instant::now());
                        core.flush_due(Instant::now());
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.into()) => {
                    core.flush_due(Instant::now());
                }
                _ = liveness.tick() => watchdog.send_lossy(Tick::new("link-monitor")),
            }
        }
        info!("link monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::basic_config;
    use crate::messaging;

    struct Harness {
        core: LinkMonitorCore,
        spark_rx: Inbox<SparkCommand>,
        kv_rx: Inbox<KvStoreCommand>,
        prefix_rx: Inbox<PrefixManagerCommand>,
    }

    fn harness(initial_backoff_ms: i64, max_backoff_ms: i64) -> Harness {
        let mut raw = basic_config("node-1");
        raw.link_monitor_config.include_interface_regexes = vec![".*".to_string()];
        raw.link_monitor_config.redistribute_interface_regexes = vec!["lo.*".to_string()];
        raw.link_monitor_config.linkflap_initial_backoff_ms = initial_backoff_ms;
        raw.link_monitor_config.linkflap_max_backoff_ms = max_backoff_ms;
        let config = Arc::new(Config::new(raw).unwrap());
        let (spark_rx, spark_tx) = messaging::channel();
        let (kv_rx, kv_tx) = messaging::channel();
        let (prefix_rx, prefix_tx) = messaging::channel();
        Harness {
            core: LinkMonitorCore::new(config, spark_tx, kv_tx, prefix_tx),
            spark_rx,
            kv_rx,
            prefix_rx,
        }
    }

    fn iface(name: &str, index: u32, up: bool) -> InterfaceInfo {
        InterfaceInfo::new(
            name,
            up,
            index,
            vec![
                format!("fe80::{}/64", index).parse().unwrap(),
                "::1/128".parse().unwrap(),
            ],
        )
    }

    fn neighbor(name: &str, remote_iface: &str) -> NeighborInfo {
        NeighborInfo {
            node_name: name.to_string(),
            remote_iface: remote_iface.to_string(),
            v4_addr: None,
            v6_addr: Some("::1".parse().unwrap()),
            transport_addrs: vec![],
            kv_sync_port: 60004,
            rtt_us: None,
        }
    }

    fn up_event(area: &str, iface: &str, info: NeighborInfo) -> NeighborEvent {
        NeighborEvent {
            area: area.to_string(),
            iface: iface.to_string(),
            kind: NeighborEventKind::Up(info),
        }
    }

    #[test]
    fn test_iface_up_starts_discovery() {
        let mut h = harness(0, 0);
        let now = Instant::now();
        h.core
            .handle_platform_event(PlatformEvent::Link(iface("1/2", 12, true)), now);
        let cmds = h.spark_rx.drain();
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            SparkCommand::TrackInterface { area, info } => {
                assert_eq!(area, "0");
                assert_eq!(info.name, "1/2");
                assert!(info.link_local_v6.is_some());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_neighbor_up_publishes_adjacency_and_peer() {
        let mut h = harness(0, 0);
        let now = Instant::now();
        h.core
            .handle_platform_event(PlatformEvent::Link(iface("1/2", 12, true)), now);
        h.core
            .handle_neighbor_event(up_event("0", "1/2", neighbor("node-2", "2/1")), now);
        h.core.flush_due(now);

        let kv_cmds = h.kv_rx.drain();
        let mut saw_peer = false;
        let mut saw_set = false;
        for cmd in kv_cmds {
            match cmd {
                KvStoreCommand::AddPeer { peer_name, addr } => {
                    assert_eq!(peer_name, "node-2");
                    assert_eq!(addr.port(), 60004);
                    saw_peer = true;
                }
                KvStoreCommand::Set { area, key, value, .. } => {
                    assert_eq!(area, "0");
                    assert_eq!(key, "adj:node-1");
                    let db: AdjacencyDatabase = bincode::deserialize(&value).unwrap();
                    assert_eq!(db.node, "node-1");
                    assert_eq!(db.adjacencies.len(), 1);
                    assert_eq!(db.adjacencies[0].remote_node, "node-2");
                    assert_eq!(db.adjacencies[0].local_iface, "1/2");
                    assert_eq!(db.adjacencies[0].remote_iface, "2/1");
                    saw_set = true;
                }
                _ => {}
            }
        }
        assert!(saw_peer);
        assert!(saw_set);
    }

    #[test]
    fn test_down_removes_adjacency_and_peer() {
        let mut h = harness(0, 0);
        let now = Instant::now();
        h.core
            .handle_platform_event(PlatformEvent::Link(iface("1/2", 12, true)), now);
        h.core
            .handle_neighbor_event(up_event("0", "1/2", neighbor("node-2", "2/1")), now);
        h.core.flush_due(now);
        h.kv_rx.drain();

        h.core.handle_neighbor_event(
            NeighborEvent {
                area: "0".to_string(),
                iface: "1/2".to_string(),
                kind: NeighborEventKind::Down {
                    node_name: "node-2".to_string(),
                },
            },
            now,
        );
        h.core.flush_due(now);
        assert_eq!(h.core.adjacency_count(), 0);

        let kv_cmds = h.kv_rx.drain();
        let mut saw_remove = false;
        let mut saw_empty_db = false;
        for cmd in kv_cmds {
            match cmd {
                KvStoreCommand::RemovePeer { peer_name } => {
                    assert_eq!(peer_name, "node-2");
                    saw_remove = true;
                }
                KvStoreCommand::Set { value, .. } => {
                    let db: AdjacencyDatabase = bincode::deserialize(&value).unwrap();
                    assert!(db.adjacencies.is_empty());
                    saw_empty_db = true;
                }
                _ => {}
            }
        }
        assert!(saw_remove);
        assert!(saw_empty_db);
    }

    #[test]
    fn test_version_strictly_increases() {
        let mut h = harness(0, 0);
        let now = Instant::now();
        h.core
            .handle_platform_event(PlatformEvent::Link(iface("1/2", 12, true)), now);
        h.core
            .handle_neighbor_event(up_event("0", "1/2", neighbor("node-2", "2/1")), now);
        h.core.flush_due(now);

        h.core.handle_neighbor_event(
            NeighborEvent {
                area: "0".to_string(),
                iface: "1/2".to_string(),
                kind: NeighborEventKind::RttChange {
                    node_name: "node-2".to_string(),
                    rtt_us: 10_000,
                },
            },
            now,
        );
        h.core.flush_due(now);

        let versions: Vec<u64> = h
            .kv_rx
            .drain()
            .into_iter()
            .filter_map(|cmd| match cmd {
                KvStoreCommand::Set { value, .. } => {
                    Some(bincode::deserialize::<AdjacencyDatabase>(&value).unwrap().version)
                }
                _ => None,
            })
            .collect();
        assert_eq!(versions.len(), 2);
        assert!(versions[1] > versions[0]);
    }

    #[test]
    fn test_flap_damping_bounds_publications() {
        let mut h = harness(1, 8);
        let mut now = Instant::now();

        // 5 quick toggles with an established neighbor in between
        h.core
            .handle_platform_event(PlatformEvent::Link(iface("1/2", 12, true)), now);
        h.core
            .handle_neighbor_event(up_event("0", "1/2", neighbor("node-2", "2/1")), now);
        for _ in 0..5 {
            now += Duration::from_micros(100);
            h.core
                .handle_platform_event(PlatformEvent::Link(iface("1/2", 12, false)), now);
            now += Duration::from_micros(100);
            h.core
                .handle_platform_event(PlatformEvent::Link(iface("1/2", 12, true)), now);
            h.core.flush_due(now);
        }
        // let the final hold expire
        now += Duration::from_millis(50);
        h.core.flush_due(now);

        let publications = h
            .kv_rx
            .drain()
            .into_iter()
            .filter(|cmd| matches!(cmd, KvStoreCommand::Set { .. }))
            .count();
        assert!(
            publications <= 3,
            "expected at most 3 publications, saw {}",
            publications
        );
    }

    #[test]
    fn test_redistribution_follows_matchers() {
        let mut h = harness(0, 0);
        let now = Instant::now();
        let mut lo = iface("lo0", 1, true);
        lo.addresses = vec!["10.1.0.1/32".parse().unwrap()];
        h.core.handle_platform_event(PlatformEvent::Link(lo), now);

        let cmds = h.prefix_rx.drain();
        let PrefixManagerCommand::UpdateRedistributed {
            iface: redist_iface,
            prefixes,
        } = cmds
            .into_iter()
            .next()
            .expect("redistribution update expected")
        else {
            panic!("unexpected command");
        };
        assert_eq!(redist_iface, "lo0");
        assert_eq!(prefixes, vec!["10.1.0.1/32".parse::<IpPrefix>().unwrap()]);

        // non-matching interface advertises nothing
        h.core
            .handle_platform_event(PlatformEvent::Link(iface("1/2", 12, true)), now);
        let cmds = h.prefix_rx.drain();
        let PrefixManagerCommand::UpdateRedistributed { prefixes, .. } =
            cmds.into_iter().next().unwrap()
        else {
            panic!("unexpected command");
        };
        assert!(prefixes.is_empty());
    }
}
