//! Prefix allocator: carves a per-node prefix out of a seed prefix, with
//! the KvStore as the coordination medium.
//!
//! The root node publishes the allocation parameters; every allocating
//! node then claims `allocprefix:<index>` with its own name. Collisions
//! are resolved by the KvStore merge order itself: the losing node sees a
//! winner other than itself, withdraws, and probes the next index. The
//! last allocation is persisted and re-claimed first across restarts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{Config, PrefixAllocationMode};
use crate::kvstore::{alloc_prefix_key, KvStoreCommand, Publication};
use crate::messaging::{Inbox, Outbox};
use crate::network::IpPrefix;
use crate::persist::PersistentStore;
use crate::prefix_manager::{PrefixManagerCommand, PrefixSource};
use crate::types::{PrefixEntry, PrefixType};
use crate::watchdog::Tick;

/// KvStore key carrying the seed parameters, published by the root.
pub const ALLOC_PARAMS_KEY: &str = "allocparams";

/// Probing gives up after this many occupied slots; a later publication
/// freeing a slot restarts it.
const MAX_PROBES: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocParams {
    pub seed: IpPrefix,
    pub alloc_len: u8,
}

impl AllocParams {
    pub fn subnet_count(&self) -> u32 {
        let bits = self.alloc_len.saturating_sub(self.seed.prefix_len());
        if bits >= 16 {
            1 << 16
        } else {
            1u32 << bits
        }
    }

    /// The `idx`-th sub-prefix of the seed.
    pub fn subnet_at(&self, idx: u32) -> Option<IpPrefix> {
        if idx >= self.subnet_count() {
            return None;
        }
        match self.seed {
            IpPrefix::V6(seed) => {
                let base = u128::from(seed.network());
                let shift = 128 - self.alloc_len as u32;
                let addr = base | (idx as u128) << shift;
                ipnet::Ipv6Net::new(addr.into(), self.alloc_len)
                    .ok()
                    .map(IpPrefix::V6)
            }
            IpPrefix::V4(seed) => {
                let base = u32::from(seed.network());
                let shift = 32 - self.alloc_len as u32;
                let addr = base | idx << shift;
                ipnet::Ipv4Net::new(addr.into(), self.alloc_len)
                    .ok()
                    .map(IpPrefix::V4)
            }
        }
    }

    /// Reverse of `subnet_at`, for re-claiming a persisted prefix.
    pub fn index_of(&self, prefix: &IpPrefix) -> Option<u32> {
        match (self.seed, prefix) {
            (IpPrefix::V6(seed), IpPrefix::V6(p)) if p.prefix_len() == self.alloc_len => {
                let base = u128::from(seed.network());
                let addr = u128::from(p.network());
                let shift = 128 - self.alloc_len as u32;
                let idx = (addr.checked_sub(base)?) >> shift;
                u32::try_from(idx).ok().filter(|i| *i < self.subnet_count())
            }
            (IpPrefix::V4(seed), IpPrefix::V4(p)) if p.prefix_len() == self.alloc_len => {
                let base = u32::from(seed.network());
                let addr = u32::from(p.network());
                let shift = 32 - self.alloc_len as u32;
                let idx = addr.checked_sub(base)? >> shift;
                Some(idx).filter(|i| *i < self.subnet_count())
            }
            _ => None,
        }
    }
}

pub struct AllocatorCore {
    config: Arc<Config>,
    area: String,
    kvstore_tx: Outbox<KvStoreCommand>,
    prefix_tx: Outbox<PrefixManagerCommand>,
    persist: PersistentStore,
    params: Option<AllocParams>,
    /// Winner per claim slot, as last observed from the store.
    claims: BTreeMap<u32, String>,
    my_index: Option<u32>,
    advertised: Option<IpPrefix>,
    probes: u32,
}

impl AllocatorCore {
    pub fn new(
        config: Arc<Config>,
        kvstore_tx: Outbox<KvStoreCommand>,
        prefix_tx: Outbox<PrefixManagerCommand>,
        persist: PersistentStore,
    ) -> Self {
        let area = config
            .areas()
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| crate::config::DEFAULT_AREA_ID.to_string());
        AllocatorCore {
            config,
            area,
            kvstore_tx,
            prefix_tx,
            persist,
            params: None,
            claims: BTreeMap::new(),
            my_index: None,
            advertised: None,
            probes: 0,
        }
    }

    pub fn start(&mut self) {
        let Some(alloc_conf) = self.config.prefix_allocation() else {
            return;
        };
        match alloc_conf.prefix_allocation_mode {
            PrefixAllocationMode::Static => {
                let Some(prefix) = &alloc_conf.static_prefix else {
                    return;
                };
                match prefix.parse::<IpPrefix>() {
                    Ok(prefix) => self.advertise(prefix),
                    Err(err) => warn!(error = %err, "unusable static allocation prefix"),
                }
            }
            PrefixAllocationMode::DynamicRootNode => {
                // config validation guarantees both fields
                let seed = alloc_conf
                    .seed_prefix
                    .as_deref()
                    .and_then(|s| s.parse::<IpPrefix>().ok());
                let alloc_len = alloc_conf.allocate_prefix_len;
                if let (Some(seed), Some(alloc_len)) = (seed, alloc_len) {
                    let params = AllocParams { seed, alloc_len };
                    match bincode::serialize(&params) {
                        Ok(bytes) => self.kvstore_tx.send_lossy(KvStoreCommand::Set {
                            area: self.area.clone(),
                            key: ALLOC_PARAMS_KEY.to_string(),
                            value: bytes,
                            version: None,
                        }),
                        Err(err) => warn!(error = %err, "failed to serialize alloc params"),
                    }
                    self.params = Some(params);
                    self.claim();
                }
            }
            PrefixAllocationMode::DynamicLeafNode => {
                // parameters arrive from the root via the store
            }
        }
    }

    pub fn handle_publication(&mut self, publication: Publication) {
        if publication.area != self.area {
            return;
        }
        let mut params_changed = false;
        let mut claims_changed = false;
        for (key, kv) in &publication.changed {
            if key == ALLOC_PARAMS_KEY {
                let Some(bytes) = &kv.value else { continue };
                match bincode::deserialize::<AllocParams>(bytes) {
                    Ok(params) => {
                        if self.params != Some(params) {
                            info!(seed = %params.seed, alloc_len = params.alloc_len, "learned allocation parameters");
                            self.params = Some(params);
                            params_changed = true;
                        }
                    }
                    Err(err) => warn!(error = %err, "undecodable allocation parameters"),
                }
            } else if let Some(idx) = key.strip_prefix("allocprefix:") {
                let (Ok(idx), Some(bytes)) = (idx.parse::<u32>(), &kv.value) else {
                    continue;
                };
                let owner = String::from_utf8_lossy(bytes).to_string();
                self.claims.insert(idx, owner);
                claims_changed = true;
            }
        }
        for key in &publication.expired {
            if let Some(idx) = key.strip_prefix("allocprefix:") {
                if let Ok(idx) = idx.parse::<u32>() {
                    self.claims.remove(&idx);
                    claims_changed = true;
                }
            }
        }

        if params_changed {
            self.my_index = None;
            self.probes = 0;
            self.claim();
        } else if claims_changed {
            self.check_claim();
        }
    }

    /// Did somebody out-rank us on our slot?
    fn check_claim(&mut self) {
        let Some(idx) = self.my_index else {
            if self.params.is_some() && self.advertised.is_none() {
                self.claim();
            }
            return;
        };
        let node = self.config.node_name();
        match self.claims.get(&idx) {
            Some(owner) if owner != node => {
                info!(index = idx, winner = %owner, "lost allocation slot, probing another");
                self.withdraw();
                self.my_index = None;
                self.probes += 1;
                self.claim();
            }
            _ => {}
        }
    }

    fn claim(&mut self) {
        let Some(params) = self.params else {
            return;
        };
        let count = params.subnet_count();
        let node = self.config.node_name().to_string();

        // persisted prefix first, then a stable hash of the node name
        let preferred = self
            .persist
            .load()
            .allocated_prefix
            .and_then(|p| p.parse::<IpPrefix>().ok())
            .and_then(|p| params.index_of(&p))
            .unwrap_or_else(|| (crate::config::stable_hash(node.as_bytes()) % count as u64) as u32);

        let mut candidate = None;
        for probe in 0..count.min(MAX_PROBES) {
            let idx = (preferred + self.probes + probe) % count;
            match self.claims.get(&idx) {
                Some(owner) if owner != &node => continue,
                _ => {
                    candidate = Some(idx);
                    break;
                }
            }
        }
        let Some(idx) = candidate else {
            warn!("no free allocation slot found");
            return;
        };

        debug!(index = idx, "claiming allocation slot");
        self.kvstore_tx.send_lossy(KvStoreCommand::Set {
            area: self.area.clone(),
            key: alloc_prefix_key(idx),
            value: node.clone().into_bytes(),
            version: None,
        });
        self.my_index = Some(idx);
        if let Some(prefix) = params.subnet_at(idx) {
            self.advertise(prefix);
        }
    }

    fn advertise(&mut self, prefix: IpPrefix) {
        if self.advertised == Some(prefix) {
            return;
        }
        self.withdraw();
        info!(prefix = %prefix, "advertising allocated prefix");
        self.prefix_tx.send_lossy(PrefixManagerCommand::Advertise {
            source: PrefixSource::Allocator,
            entries: vec![PrefixEntry::new(prefix, PrefixType::Config)],
        });
        self.advertised = Some(prefix);
        let mut state = self.persist.load();
        state.allocated_prefix = Some(prefix.to_string());
        state.node_label = self.config.node_segment_label(&self.area);
        if let Err(err) = self.persist.save(state) {
            warn!(error = %err, "failed to persist allocated prefix");
        }
    }

    fn withdraw(&mut self) {
        if let Some(prefix) = self.advertised.take() {
            self.prefix_tx.send_lossy(PrefixManagerCommand::Withdraw {
                source: PrefixSource::Allocator,
                prefixes: vec![prefix],
            });
        }
    }
}

/// The allocator component task.
pub struct Allocator {
    core: AllocatorCore,
    inbox: Inbox<Publication>,
    watchdog: Outbox<Tick>,
}

impl Allocator {
    pub fn new(core: AllocatorCore, inbox: Inbox<Publication>, watchdog: Outbox<Tick>) -> Self {
        Allocator {
            core,
            inbox,
            watchdog,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let Allocator {
            mut core,
            mut inbox,
            watchdog,
        } = self;
        core.start();
        let mut liveness = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                publication = inbox.recv() => match publication {
                    Some(publication) => core.handle_publication(publication),
                    None => break,
                },
                _ = liveness.tick() => watchdog.send_lossy(Tick::new("allocator")),
            }
        }
        info!("allocator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::basic_config;
    use crate::config::PrefixAllocationConfig;
    use crate::kvstore::{value_hash, KvValue};
    use crate::messaging;

    fn params() -> AllocParams {
        AllocParams {
            seed: "fc00:cafe:babe::/64".parse().unwrap(),
            alloc_len: 80,
        }
    }

    #[test]
    fn test_subnet_math_roundtrip() {
        let params = params();
        assert_eq!(params.subnet_count(), 1 << 16);
        let p0 = params.subnet_at(0).unwrap();
        assert_eq!(p0.to_string(), "fc00:cafe:babe::/80");
        let p5 = params.subnet_at(5).unwrap();
        assert_eq!(p5.to_string(), "fc00:cafe:babe:0:5::/80");
        assert_eq!(params.index_of(&p5), Some(5));
        assert_eq!(params.index_of(&p0), Some(0));
    }

    #[test]
    fn test_subnet_math_v4() {
        let params = AllocParams {
            seed: "10.0.0.0/16".parse().unwrap(),
            alloc_len: 24,
        };
        assert_eq!(params.subnet_count(), 256);
        assert_eq!(params.subnet_at(3).unwrap().to_string(), "10.0.3.0/24");
        assert_eq!(
            params.index_of(&"10.0.3.0/24".parse().unwrap()),
            Some(3)
        );
        assert_eq!(params.index_of(&"10.1.0.0/24".parse().unwrap()), None);
    }

    struct Harness {
        core: AllocatorCore,
        kv_rx: Inbox<KvStoreCommand>,
        prefix_rx: Inbox<PrefixManagerCommand>,
        _dir: tempfile::TempDir,
    }

    fn leaf_harness(node: &str) -> Harness {
        let mut raw = basic_config(node);
        raw.enable_prefix_allocation = true;
        raw.prefix_allocation_config = Some(PrefixAllocationConfig {
            prefix_allocation_mode: PrefixAllocationMode::DynamicLeafNode,
            seed_prefix: None,
            allocate_prefix_len: None,
            static_prefix: None,
        });
        let config = Arc::new(Config::new(raw).unwrap());
        let (kv_rx, kv_tx) = messaging::channel();
        let (prefix_rx, prefix_tx) = messaging::channel();
        let dir = tempfile::tempdir().unwrap();
        let persist = PersistentStore::new(dir.path().join("state.json"));
        Harness {
            core: AllocatorCore::new(config, kv_tx, prefix_tx, persist),
            kv_rx,
            prefix_rx,
            _dir: dir,
        }
    }

    fn params_publication() -> Publication {
        let bytes = bincode::serialize(&params()).unwrap();
        let mut changed = BTreeMap::new();
        changed.insert(
            ALLOC_PARAMS_KEY.to_string(),
            KvValue {
                value: Some(bytes.clone()),
                version: 1,
                originator: "root".to_string(),
                ttl_ms: 300_000,
                ttl_version: 1,
                hash: value_hash(&bytes, "root"),
            },
        );
        Publication {
            area: "0".to_string(),
            changed,
            expired: Vec::new(),
        }
    }

    fn claim_publication(idx: u32, owner: &str) -> Publication {
        let bytes = owner.as_bytes().to_vec();
        let mut changed = BTreeMap::new();
        changed.insert(
            alloc_prefix_key(idx),
            KvValue {
                value: Some(bytes.clone()),
                version: 1,
                originator: owner.to_string(),
                ttl_ms: 300_000,
                ttl_version: 1,
                hash: value_hash(&bytes, owner),
            },
        );
        Publication {
            area: "0".to_string(),
            changed,
            expired: Vec::new(),
        }
    }

    #[test]
    fn test_leaf_claims_after_learning_params() {
        let mut h = leaf_harness("node-1");
        h.core.start();
        assert!(h.kv_rx.drain().is_empty());

        h.core.handle_publication(params_publication());
        let claims: Vec<_> = h.kv_rx.drain();
        assert_eq!(claims.len(), 1);
        let KvStoreCommand::Set { key, value, .. } = &claims[0] else {
            panic!("expected a claim set");
        };
        assert!(key.starts_with("allocprefix:"));
        assert_eq!(value, b"node-1");

        // an advertisement went out optimistically
        let ads = h.prefix_rx.drain();
        assert!(ads
            .iter()
            .any(|c| matches!(c, PrefixManagerCommand::Advertise { .. })));
    }

    #[test]
    fn test_losing_claim_probes_next_slot() {
        let mut h = leaf_harness("node-1");
        h.core.start();
        h.core.handle_publication(params_publication());
        let first_idx = h.core.my_index.expect("claimed a slot");
        h.kv_rx.drain();
        h.prefix_rx.drain();

        // a better-ranked node took our slot
        h.core
            .handle_publication(claim_publication(first_idx, "node-9"));
        let second_idx = h.core.my_index.expect("re-claimed");
        assert_ne!(second_idx, first_idx);

        let cmds = h.prefix_rx.drain();
        assert!(cmds
            .iter()
            .any(|c| matches!(c, PrefixManagerCommand::Withdraw { .. })));
        assert!(cmds
            .iter()
            .any(|c| matches!(c, PrefixManagerCommand::Advertise { .. })));
    }

    #[test]
    fn test_persisted_prefix_reclaimed_first() {
        let mut h = leaf_harness("node-1");
        let state = crate::persist::WarmRestartState {
            allocated_prefix: Some("fc00:cafe:babe:0:7::/80".to_string()),
            ..Default::default()
        };
        h.core.persist.save(state).unwrap();

        h.core.start();
        h.core.handle_publication(params_publication());
        assert_eq!(h.core.my_index, Some(7));
    }
}
