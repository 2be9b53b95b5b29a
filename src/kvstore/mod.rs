//! KvStore: eventually-consistent replicated map over the peer mesh.
//!
//! Per area, a `key -> KvValue` map under a deterministic merge order:
//! higher `(version, originator, hash)` wins, which makes Merge commutative
//! and idempotent — two stores that saw the same set of updates hold
//! byte-identical maps regardless of arrival order.
//!
//! The sync-protocol and merge logic live in `KvCore`, synchronous and
//! socket-free; `KvStore::run` glues it to TCP peer sessions, the TTL
//! clock and the flood rate limiter.

pub mod flood;
pub mod peer;
pub mod wire;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::messaging::{self, Inbox, Outbox};
use crate::types::{AreaId, NodeName};
use crate::watchdog::Tick;

use flood::TokenBucket;
use peer::{DialerHandle, SessionEvent};
use wire::{KvSummaryEntry, KvWireMessage};

/// Key under which a node's AdjacencyDatabase is published.
pub fn adj_db_key(node: &str) -> String {
    format!("adj:{}", node)
}

/// Key under which a node's PrefixDatabase is published.
pub fn prefix_db_key(node: &str) -> String {
    format!("prefix:{}", node)
}

/// Key claimed by a node allocating index `idx` from the seed prefix.
pub fn alloc_prefix_key(idx: u32) -> String {
    format!("allocprefix:{}", idx)
}

/// One replicated value. `value` is absent on the wire for TTL refreshes;
/// stored values always carry their bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvValue {
    pub value: Option<Vec<u8>>,
    pub version: u64,
    pub originator: NodeName,
    pub ttl_ms: i64,
    pub ttl_version: u64,
    pub hash: i64,
}

impl KvValue {
    /// Merge-order rank; the lexicographically greater tuple wins.
    pub fn rank(&self) -> (u64, &str, i64) {
        (self.version, self.originator.as_str(), self.hash)
    }
}

/// Deterministic digest of value bytes + originator, identical on every
/// node that holds the same write.
pub fn value_hash(value: &[u8], originator: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(value);
    hasher.update(originator.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Incoming wins; replace.
    Newer,
    /// Same rank, fresher ttl_version; re-arm expiry only.
    TtlRefresh,
    /// Same rank and ttl_version; nothing to do.
    Identical,
    /// Existing wins; drop.
    Older,
}

pub fn compare_values(existing: &KvValue, incoming: &KvValue) -> MergeOutcome {
    match incoming.rank().cmp(&existing.rank()) {
        std::cmp::Ordering::Greater => MergeOutcome::Newer,
        std::cmp::Ordering::Less => MergeOutcome::Older,
        std::cmp::Ordering::Equal => {
            if incoming.ttl_version > existing.ttl_version {
                MergeOutcome::TtlRefresh
            } else {
                MergeOutcome::Identical
            }
        }
    }
}

/// Change notification delivered to subscribers (Decision, allocator).
#[derive(Debug, Clone)]
pub struct Publication {
    pub area: AreaId,
    pub changed: BTreeMap<String, KvValue>,
    pub expired: Vec<String>,
}

#[derive(Debug)]
pub enum KvStoreCommand {
    /// Local write under this node's name. Omitted version is derived:
    /// unchanged bytes are a no-op, changed bytes bump the version.
    Set {
        area: AreaId,
        key: String,
        value: Vec<u8>,
        version: Option<u64>,
    },
    /// Stop refreshing a self-originated key and let its TTL run out.
    Unset { area: AreaId, key: String },
    AddPeer {
        peer_name: NodeName,
        addr: SocketAddr,
    },
    RemovePeer { peer_name: NodeName },
    Subscribe { subscriber: Outbox<Publication> },
    Dump {
        area: AreaId,
        resp: tokio::sync::oneshot::Sender<BTreeMap<String, KvValue>>,
    },
}

#[derive(Debug)]
struct Stored {
    kv: KvValue,
    expires_at: Instant,
}

struct Session {
    peer_name: NodeName,
    outbox: UnboundedSender<KvWireMessage>,
}

struct KeyDamp {
    backoff: ExponentialBackoff,
    pending: Option<KvValue>,
    exclude: Option<u64>,
}

/// Synchronous store + protocol state.
pub struct KvCore {
    node_name: NodeName,
    ttl: Duration,
    damp_initial: Duration,
    damp_max: Duration,
    areas: BTreeMap<AreaId, BTreeMap<String, Stored>>,
    sessions: HashMap<u64, Session>,
    dialers: HashMap<NodeName, DialerHandle>,
    subscribers: Vec<Outbox<Publication>>,
    bucket: Option<TokenBucket>,
    flood_queue: VecDeque<(Option<u64>, AreaId, BTreeMap<String, KvValue>)>,
    damp: HashMap<(AreaId, String), KeyDamp>,
    /// Values this node actively originates; the TTL self-refresh and the
    /// stale-copy reclaim after a warm restart both key off this.
    self_values: HashMap<(AreaId, String), Vec<u8>>,
    domain_token: u64,
    session_tx: Outbox<SessionEvent>,
}

impl KvCore {
    pub fn new(config: &Config, session_tx: Outbox<SessionEvent>, now: Instant) -> Self {
        let kv_conf = config.kvstore();
        let areas = config
            .areas()
            .keys()
            .map(|a| (a.clone(), BTreeMap::new()))
            .collect();
        KvCore {
            node_name: config.node_name().to_string(),
            ttl: config.key_ttl(),
            damp_initial: Duration::from_millis(kv_conf.key_flap_initial_backoff_ms as u64),
            damp_max: Duration::from_millis(kv_conf.key_flap_max_backoff_ms as u64),
            areas,
            sessions: HashMap::new(),
            dialers: HashMap::new(),
            subscribers: Vec::new(),
            bucket: kv_conf
                .flood_rate
                .as_ref()
                .map(|r| TokenBucket::new(r.flood_msg_per_sec, r.flood_msg_burst_size, now)),
            flood_queue: VecDeque::new(),
            damp: HashMap::new(),
            self_values: HashMap::new(),
            domain_token: config.domain_token(),
            session_tx,
        }
    }

    pub fn handle_command(&mut self, cmd: KvStoreCommand, now: Instant) {
        match cmd {
            KvStoreCommand::Set {
                area,
                key,
                value,
                version,
            } => self.local_set(area, key, value, version, now),
            KvStoreCommand::Unset { area, key } => {
                debug!(area = %area, key = %key, "letting key expire");
                self.self_values.remove(&(area, key));
            }
            KvStoreCommand::AddPeer { peer_name, addr } => self.add_peer(peer_name, addr),
            KvStoreCommand::RemovePeer { peer_name } => self.remove_peer(&peer_name),
            KvStoreCommand::Subscribe { subscriber } => {
                for (area, map) in &self.areas {
                    let changed: BTreeMap<String, KvValue> =
                        map.iter().map(|(k, s)| (k.clone(), s.kv.clone())).collect();
                    subscriber.send_lossy(Publication {
                        area: area.clone(),
                        changed,
                        expired: Vec::new(),
                    });
                }
                self.subscribers.push(subscriber);
            }
            KvStoreCommand::Dump { area, resp } => {
                let map = self
                    .areas
                    .get(&area)
                    .map(|m| m.iter().map(|(k, s)| (k.clone(), s.kv.clone())).collect())
                    .unwrap_or_default();
                let _ = resp.send(map);
            }
        }
    }

    fn add_peer(&mut self, peer_name: NodeName, addr: SocketAddr) {
        // re-adding with a new address restarts the dialer
        self.dialers.remove(&peer_name);
        info!(peer = %peer_name, peer_addr = %addr, "adding kvstore peer");
        let handle = peer::spawn_dialer(
            peer_name.clone(),
            addr,
            self.node_name.clone(),
            self.domain_token,
            self.session_tx.clone(),
        );
        self.dialers.insert(peer_name, handle);
    }

    fn remove_peer(&mut self, peer_name: &str) {
        info!(peer = %peer_name, "removing kvstore peer");
        self.dialers.remove(peer_name);
        self.sessions.retain(|_, s| s.peer_name != peer_name);
    }

    fn local_set(
        &mut self,
        area: AreaId,
        key: String,
        value: Vec<u8>,
        version: Option<u64>,
        now: Instant,
    ) {
        let Some(map) = self.areas.get(&area) else {
            warn!(area = %area, key = %key, "set for unknown area dropped");
            return;
        };
        let existing = map.get(&key);
        let version = match version {
            Some(v) => v,
            None => match existing {
                Some(s) if s.kv.value.as_deref() == Some(value.as_slice()) => return,
                Some(s) => s.kv.version + 1,
                None => 1,
            },
        };
        let ttl_version = existing.map(|s| s.kv.ttl_version + 1).unwrap_or(1);
        let hash = value_hash(&value, &self.node_name);
        let kv = KvValue {
            value: Some(value.clone()),
            version,
            originator: self.node_name.clone(),
            ttl_ms: self.ttl.as_millis() as i64,
            ttl_version,
            hash,
        };
        self.self_values.insert((area.clone(), key.clone()), value);
        let mut entries = BTreeMap::new();
        entries.insert(key, kv);
        self.ingest(area, entries, None, now);
    }

    /// Merge a batch (local set, peer flood or sync delta) and propagate
    /// the winners.
    pub fn ingest(
        &mut self,
        area: AreaId,
        entries: BTreeMap<String, KvValue>,
        from: Option<u64>,
        now: Instant,
    ) {
        let Some(map) = self.areas.get_mut(&area) else {
            return;
        };
        let mut changed = BTreeMap::new();
        let mut to_flood = BTreeMap::new();
        for (key, incoming) in entries {
            match map.get_mut(&key) {
                None => {
                    if incoming.value.is_none() {
                        // refresh for a key we never held
                        continue;
                    }
                    map.insert(
                        key.clone(),
                        Stored {
                            kv: incoming.clone(),
                            expires_at: now + Duration::from_millis(incoming.ttl_ms.max(1) as u64),
                        },
                    );
                    changed.insert(key.clone(), incoming.clone());
                    to_flood.insert(key, incoming);
                }
                Some(stored) => match compare_values(&stored.kv, &incoming) {
                    MergeOutcome::Newer => {
                        if incoming.value.is_none() {
                            // newer version announced via a refresh; the
                            // full value will arrive by flood or sync
                            continue;
                        }
                        stored.kv = incoming.clone();
                        stored.expires_at =
                            now + Duration::from_millis(incoming.ttl_ms.max(1) as u64);
                        changed.insert(key.clone(), incoming.clone());
                        to_flood.insert(key, incoming);
                    }
                    MergeOutcome::TtlRefresh => {
                        stored.kv.ttl_version = incoming.ttl_version;
                        stored.expires_at =
                            now + Duration::from_millis(incoming.ttl_ms.max(1) as u64);
                        let mut fwd = stored.kv.clone();
                        fwd.value = None;
                        fwd.ttl_ms = incoming.ttl_ms;
                        to_flood.insert(key, fwd);
                    }
                    MergeOutcome::Identical | MergeOutcome::Older => {}
                },
            }
        }
        // a peer can hand us a stale copy of our own key (warm restart);
        // the live desire always wins by out-versioning it
        let mut reasserts = Vec::new();
        if from.is_some() {
            for (key, kv) in &changed {
                if kv.originator != self.node_name {
                    continue;
                }
                if let Some(desired) = self.self_values.get(&(area.clone(), key.clone())) {
                    if kv.value.as_deref() != Some(desired.as_slice()) {
                        reasserts.push((key.clone(), desired.clone(), kv.version + 1));
                    }
                }
            }
        }

        if !changed.is_empty() {
            self.publish(Publication {
                area: area.clone(),
                changed,
                expired: Vec::new(),
            });
        }
        if !to_flood.is_empty() {
            self.flood(area.clone(), to_flood, from, now);
        }
        for (key, value, version) in reasserts {
            debug!(area = %area, key = %key, version, "reclaiming self-originated key");
            self.local_set(area.clone(), key, value, Some(version), now);
        }
    }

    fn publish(&self, publication: Publication) {
        for subscriber in &self.subscribers {
            subscriber.send_lossy(publication.clone());
        }
    }

    fn flood(
        &mut self,
        area: AreaId,
        entries: BTreeMap<String, KvValue>,
        exclude: Option<u64>,
        now: Instant,
    ) {
        let mut immediate = BTreeMap::new();
        for (key, kv) in entries {
            let damp = self
                .damp
                .entry((area.clone(), key.clone()))
                .or_insert_with(|| KeyDamp {
                    backoff: ExponentialBackoff::new(self.damp_initial, self.damp_max),
                    pending: None,
                    exclude: None,
                });
            if damp.backoff.is_idle(now) {
                damp.backoff.bump(now);
                immediate.insert(key, kv);
            } else {
                // flapping key: hold the latest value until the window ends
                damp.pending = Some(kv);
                damp.exclude = exclude;
            }
        }
        if !immediate.is_empty() {
            self.send_update(area, immediate, exclude, now);
        }
    }

    fn send_update(
        &mut self,
        area: AreaId,
        entries: BTreeMap<String, KvValue>,
        exclude: Option<u64>,
        now: Instant,
    ) {
        if let Some(bucket) = &mut self.bucket {
            if !bucket.take(now) {
                self.flood_queue.push_back((exclude, area, entries));
                return;
            }
        }
        self.transmit(area, entries, exclude);
    }

    fn transmit(&self, area: AreaId, entries: BTreeMap<String, KvValue>, exclude: Option<u64>) {
        for (id, session) in &self.sessions {
            if Some(*id) == exclude {
                continue;
            }
            let _ = session.outbox.send(KvWireMessage::Update {
                area: area.clone(),
                entries: entries.clone(),
            });
        }
    }

    pub fn on_session_event(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Connected {
                session_id,
                peer_name,
                outbox,
                initiated,
            } => {
                debug!(peer = %peer_name, session_id, initiated, "kvstore session up");
                if initiated {
                    for area in self.areas.keys() {
                        let _ = outbox.send(KvWireMessage::Summary {
                            area: area.clone(),
                            entries: self.summarize(area),
                        });
                    }
                }
                self.sessions.insert(session_id, Session { peer_name, outbox });
            }
            SessionEvent::Message { session_id, msg } => match msg {
                KvWireMessage::Summary { area, entries } => {
                    let delta = self.winners(&area, &entries, now);
                    let summary = self.summarize(&area);
                    if let Some(session) = self.sessions.get(&session_id) {
                        let _ = session.outbox.send(KvWireMessage::SyncReply {
                            area,
                            delta,
                            summary,
                        });
                    }
                }
                KvWireMessage::SyncReply {
                    area,
                    delta,
                    summary,
                } => {
                    self.ingest(area.clone(), delta, Some(session_id), now);
                    let final_delta = self.winners(&area, &summary, now);
                    if !final_delta.is_empty() {
                        if let Some(session) = self.sessions.get(&session_id) {
                            let _ = session.outbox.send(KvWireMessage::Delta {
                                area,
                                entries: final_delta,
                            });
                        }
                    }
                }
                KvWireMessage::Delta { area, entries } | KvWireMessage::Update { area, entries } => {
                    self.ingest(area, entries, Some(session_id), now);
                }
                KvWireMessage::PeerHello { .. } => {}
            },
            SessionEvent::Disconnected { session_id } => {
                debug!(session_id, "kvstore session down");
                self.sessions.remove(&session_id);
            }
        }
    }

    fn summarize(&self, area: &str) -> BTreeMap<String, KvSummaryEntry> {
        self.areas
            .get(area)
            .map(|map| {
                map.iter()
                    .map(|(k, s)| {
                        (
                            k.clone(),
                            KvSummaryEntry {
                                version: s.kv.version,
                                originator: s.kv.originator.clone(),
                                hash: s.kv.hash,
                                ttl_version: s.kv.ttl_version,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Values we hold that beat (or are absent from) the remote summary.
    fn winners(
        &self,
        area: &str,
        remote: &BTreeMap<String, KvSummaryEntry>,
        now: Instant,
    ) -> BTreeMap<String, KvValue> {
        let Some(map) = self.areas.get(area) else {
            return BTreeMap::new();
        };
        map.iter()
            .filter(|(key, stored)| match remote.get(*key) {
                None => true,
                Some(r) => stored.kv.rank() > (r.version, r.originator.as_str(), r.hash),
            })
            .map(|(key, stored)| {
                let mut kv = stored.kv.clone();
                kv.ttl_ms = stored
                    .expires_at
                    .saturating_duration_since(now)
                    .as_millis()
                    .max(1) as i64;
                (key.clone(), kv)
            })
            .collect()
    }

    /// TTL eviction, self-refresh, damped-key flush, flood-queue drain.
    pub fn housekeeping(&mut self, now: Instant) {
        // flush keys whose dampening window ended
        let mut flushes = Vec::new();
        for ((area, key), damp) in self.damp.iter_mut() {
            if damp.backoff.is_idle(now) {
                if let Some(kv) = damp.pending.take() {
                    damp.backoff.bump(now);
                    flushes.push((area.clone(), key.clone(), kv, damp.exclude));
                }
            }
        }
        for (area, key, kv, exclude) in flushes {
            let mut entries = BTreeMap::new();
            entries.insert(key, kv);
            self.send_update(area, entries, exclude, now);
        }

        // drain queued floods as tokens come back
        loop {
            if self.flood_queue.is_empty() {
                break;
            }
            let allowed = match &mut self.bucket {
                Some(bucket) => bucket.take(now),
                None => true,
            };
            if !allowed {
                break;
            }
            if let Some((exclude, area, entries)) = self.flood_queue.pop_front() {
                self.transmit(area, entries, exclude);
            }
        }

        // expiry and self-refresh
        let ttl_ms = self.ttl.as_millis() as i64;
        let refresh_window = self.ttl / 3;
        let mut expired_out = Vec::new();
        let mut refresh_out = Vec::new();
        for (area, map) in self.areas.iter_mut() {
            let mut expired = Vec::new();
            let mut refreshes = BTreeMap::new();
            for (key, stored) in map.iter_mut() {
                if stored.expires_at <= now {
                    expired.push(key.clone());
                    continue;
                }
                if stored.kv.originator == self.node_name
                    && self.self_values.contains_key(&(area.clone(), key.clone()))
                    && stored.expires_at.saturating_duration_since(now) < refresh_window
                {
                    stored.kv.ttl_version += 1;
                    stored.expires_at = now + self.ttl;
                    let mut fwd = stored.kv.clone();
                    fwd.value = None;
                    fwd.ttl_ms = ttl_ms;
                    refreshes.insert(key.clone(), fwd);
                }
            }
            for key in &expired {
                map.remove(key);
                self.damp.remove(&(area.clone(), key.clone()));
            }
            if !expired.is_empty() {
                expired_out.push((area.clone(), expired));
            }
            if !refreshes.is_empty() {
                refresh_out.push((area.clone(), refreshes));
            }
        }
        for (area, expired) in expired_out {
            debug!(area = %area, count = expired.len(), "expired kvstore keys");
            self.publish(Publication {
                area,
                changed: BTreeMap::new(),
                expired,
            });
        }
        for (area, refreshes) in refresh_out {
            self.send_update(area, refreshes, None, now);
        }
    }

    #[cfg(test)]
    fn dump(&self, area: &str) -> BTreeMap<String, KvValue> {
        self.areas
            .get(area)
            .map(|m| m.iter().map(|(k, s)| (k.clone(), s.kv.clone())).collect())
            .unwrap_or_default()
    }
}

/// The KvStore component task.
pub struct KvStore {
    core: KvCore,
    inbox: Inbox<KvStoreCommand>,
    session_rx: Inbox<SessionEvent>,
    session_tx: Outbox<SessionEvent>,
    listener: Option<TcpListener>,
    node_name: NodeName,
    domain_token: u64,
    watchdog: Outbox<Tick>,
}

impl KvStore {
    /// Bind the sync listener and build the component. Returns the actual
    /// port so neighbors can be told where to sync from (handshakes).
    pub async fn bind(
        config: Arc<Config>,
        inbox: Inbox<KvStoreCommand>,
        watchdog: Outbox<Tick>,
    ) -> anyhow::Result<(Self, u16)> {
        let listener = TcpListener::bind(("::", config.kvstore().sync_port as u16)).await?;
        let port = listener.local_addr()?.port();
        let (session_rx, session_tx) = messaging::channel();
        let core = KvCore::new(&config, session_tx.clone(), Instant::now());
        Ok((
            KvStore {
                core,
                inbox,
                session_rx,
                session_tx,
                listener: Some(listener),
                node_name: config.node_name().to_string(),
                domain_token: config.domain_token(),
                watchdog,
            },
            port,
        ))
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let KvStore {
            mut core,
            mut inbox,
            mut session_rx,
            session_tx,
            listener,
            node_name,
            domain_token,
            watchdog,
        } = self;
        if let Some(listener) = listener {
            peer::spawn_acceptor(
                listener,
                node_name,
                domain_token,
                session_tx,
                shutdown.resubscribe(),
            );
        }
        let mut housekeeping = tokio::time::interval(Duration::from_millis(20));
        let mut liveness = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                cmd = inbox.recv() => match cmd {
                    Some(cmd) => core.handle_command(cmd, Instant::now()),
                    None => break,
                },
                event = session_rx.recv() => match event {
                    Some(event) => core.on_session_event(event, Instant::now()),
                    None => break,
                },
                _ = housekeeping.tick() => core.housekeeping(Instant::now()),
                _ = liveness.tick() => watchdog.send_lossy(Tick::new("kvstore")),
            }
        }
        // second drain phase: flush whatever the bucket still allows
        core.housekeeping(Instant::now());
        info!("kvstore stopped");
    }
}
