//! PrefixManager: owns the prefixes this node originates.
//!
//! Prefixes arrive from independent sources (config, interface
//! redistribution, the allocator, BGP/VIP translation, the runtime API);
//! each source owns its contribution and can retract it at any time. The
//! published PrefixDatabase carries the deduplicated union: for one prefix
//! the highest-priority type wins and the remaining metadata merges field
//! by field.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::kvstore::{self, KvStoreCommand};
use crate::messaging::{Inbox, Outbox};
use crate::network::IpPrefix;
use crate::types::{ForwardingAlgorithm, ForwardingType, PrefixDatabase, PrefixEntry, PrefixType};
use crate::watchdog::Tick;

/// Who contributed an advertisement. Retraction is per-source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrefixSource {
    Config,
    Redistributed { iface: String },
    Allocator,
    Bgp,
    Vip,
    Api,
}

#[derive(Debug)]
pub enum PrefixManagerCommand {
    Advertise {
        source: PrefixSource,
        entries: Vec<PrefixEntry>,
    },
    Withdraw {
        source: PrefixSource,
        prefixes: Vec<IpPrefix>,
    },
    /// Replace an interface's redistributed address set wholesale.
    UpdateRedistributed {
        iface: String,
        prefixes: Vec<IpPrefix>,
    },
}

pub struct PrefixManagerCore {
    config: Arc<Config>,
    kvstore_tx: Outbox<KvStoreCommand>,
    by_source: BTreeMap<PrefixSource, BTreeMap<IpPrefix, PrefixEntry>>,
    db_version: u64,
    last_published: Option<Vec<PrefixEntry>>,
}

impl PrefixManagerCore {
    pub fn new(config: Arc<Config>, kvstore_tx: Outbox<KvStoreCommand>) -> Self {
        let mut core = PrefixManagerCore {
            config,
            kvstore_tx,
            by_source: BTreeMap::new(),
            db_version: 0,
            last_published: None,
        };
        core.load_config_prefixes();
        core
    }

    fn load_config_prefixes(&mut self) {
        match self.config.originated_prefixes() {
            Ok(prefixes) => {
                if prefixes.is_empty() {
                    return;
                }
                let entries = prefixes
                    .into_iter()
                    .map(|p| {
                        let mut entry = PrefixEntry::new(p, PrefixType::Config);
                        entry.forwarding_type = self.config.prefix_forwarding_type();
                        entry.forwarding_algorithm = self.config.prefix_forwarding_algorithm();
                        entry
                    })
                    .collect();
                self.apply(PrefixSource::Config, entries);
            }
            Err(err) => warn!(error = %err, "skipping malformed configured prefixes"),
        }
    }

    pub fn handle_command(&mut self, cmd: PrefixManagerCommand) {
        match cmd {
            PrefixManagerCommand::Advertise { source, entries } => {
                self.apply(source, entries);
                self.publish();
            }
            PrefixManagerCommand::Withdraw { source, prefixes } => {
                if let Some(owned) = self.by_source.get_mut(&source) {
                    for prefix in prefixes {
                        owned.remove(&prefix.trimmed());
                    }
                    if owned.is_empty() {
                        self.by_source.remove(&source);
                    }
                }
                self.publish();
            }
            PrefixManagerCommand::UpdateRedistributed { iface, prefixes } => {
                let source = PrefixSource::Redistributed { iface };
                if prefixes.is_empty() {
                    self.by_source.remove(&source);
                } else {
                    let entries = prefixes
                        .into_iter()
                        .map(|p| PrefixEntry::new(p, PrefixType::Loopback))
                        .collect();
                    self.apply(source, entries);
                }
                self.publish();
            }
        }
    }

    fn apply(&mut self, source: PrefixSource, entries: Vec<PrefixEntry>) {
        let owned = self.by_source.entry(source).or_default();
        owned.clear();
        for entry in entries {
            if entry.forwarding_algorithm == ForwardingAlgorithm::Ksp2EdEcmp
                && entry.forwarding_type != ForwardingType::SrMpls
            {
                warn!(prefix = %entry.prefix, "dropping entry: KSP2_ED_ECMP requires SR_MPLS");
                continue;
            }
            owned.insert(entry.prefix, entry);
        }
    }

    /// Deduplicate across sources: highest type wins, metadata merges.
    fn merged(&self) -> Vec<PrefixEntry> {
        let mut merged: BTreeMap<IpPrefix, PrefixEntry> = BTreeMap::new();
        for owned in self.by_source.values() {
            for (prefix, entry) in owned {
                match merged.get_mut(prefix) {
                    None => {
                        merged.insert(*prefix, entry.clone());
                    }
                    Some(existing) => {
                        let tags = existing
                            .tags
                            .union(&entry.tags)
                            .cloned()
                            .collect();
                        let min_nexthops = match (existing.min_nexthops, entry.min_nexthops) {
                            (Some(a), Some(b)) => Some(a.min(b)),
                            (a, b) => a.or(b),
                        };
                        if entry.prefix_type > existing.prefix_type {
                            let mut winner = entry.clone();
                            winner.tags = tags;
                            winner.min_nexthops = min_nexthops;
                            *existing = winner;
                        } else {
                            existing.tags = tags;
                            existing.min_nexthops = min_nexthops;
                        }
                    }
                }
            }
        }
        merged.into_values().collect()
    }

    /// Push the merged PrefixDatabase into every area.
    pub fn publish(&mut self) {
        let entries = self.merged();
        if self.last_published.as_ref() == Some(&entries) {
            return;
        }
        self.db_version += 1;
        let areas: Vec<String> = self.config.areas().keys().cloned().collect();
        for area in areas {
            let mut scoped = entries.clone();
            for entry in &mut scoped {
                entry.area_stack = vec![area.clone()];
            }
            let db = PrefixDatabase {
                node: self.config.node_name().to_string(),
                area: area.clone(),
                version: self.db_version,
                entries: scoped,
            };
            info!(
                area = %area,
                version = db.version,
                prefixes = db.entries.len(),
                "publishing prefix database"
            );
            match bincode::serialize(&db) {
                Ok(bytes) => self.kvstore_tx.send_lossy(KvStoreCommand::Set {
                    area,
                    key: kvstore::prefix_db_key(self.config.node_name()),
                    value: bytes,
                    version: None,
                }),
                Err(err) => warn!(error = %err, "failed to serialize prefix database"),
            }
        }
        self.last_published = Some(entries);
    }
}

/// The PrefixManager component task.
pub struct PrefixManager {
    core: PrefixManagerCore,
    inbox: Inbox<PrefixManagerCommand>,
    watchdog: Outbox<Tick>,
}

impl PrefixManager {
    pub fn new(
        core: PrefixManagerCore,
        inbox: Inbox<PrefixManagerCommand>,
        watchdog: Outbox<Tick>,
    ) -> Self {
        PrefixManager {
            core,
            inbox,
            watchdog,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let PrefixManager {
            mut core,
            mut inbox,
            watchdog,
        } = self;
        // initial publish of config-sourced prefixes
        core.publish();
        let mut liveness = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                cmd = inbox.recv() => match cmd {
                    Some(cmd) => core.handle_command(cmd),
                    None => break,
                },
                _ = liveness.tick() => watchdog.send_lossy(Tick::new("prefix-manager")),
            }
        }
        info!("prefix manager stopped");
    }
}
