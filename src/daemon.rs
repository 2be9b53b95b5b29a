//! Daemon assembly: builds every component, wires the queues, runs the
//! pipeline.
//!
//! The queue graph is a DAG; the LinkMonitor<->Spark cycle is two one-way
//! channels. Tests drive the same wiring with a mock platform and a
//! channel-backed neighbor transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::allocator::{Allocator, AllocatorCore};
use crate::config::Config;
use crate::decision::{Decision, DecisionCore};
use crate::fib::{Fib, FibEngine};
use crate::kvstore::{KvStore, KvStoreCommand};
use crate::link_monitor::{LinkMonitor, LinkMonitorCore};
use crate::messaging::{self, Outbox};
use crate::persist::PersistentStore;
use crate::platform::{PlatformAgent, PlatformEvent};
use crate::prefix_manager::{PrefixManager, PrefixManagerCommand, PrefixManagerCore};
use crate::spark::{NeighborIo, Spark};
use crate::types::RouteDatabase;
use crate::watchdog::{Watchdog, WatchdogState};

/// A running node and the handles to poke it with.
pub struct Daemon {
    pub config: Arc<Config>,
    /// Feed link/address events (netlink bridge or tests).
    pub platform_tx: Outbox<PlatformEvent>,
    /// Platform events relevant to Fib (agent restarts).
    pub fib_platform_tx: Outbox<PlatformEvent>,
    /// Direct store access (operational dumps, runtime writes).
    pub kvstore_tx: Outbox<KvStoreCommand>,
    /// Runtime prefix advertise/withdraw.
    pub prefix_tx: Outbox<PrefixManagerCommand>,
    /// Latest route database, as handed to Fib.
    pub routes: watch::Receiver<RouteDatabase>,
    /// Actual KvStore sync port (relevant when configured as 0).
    pub kv_sync_port: u16,
    pub watchdog_state: Arc<WatchdogState>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Build and start every component.
    pub async fn spawn(
        config: Arc<Config>,
        agent: Arc<dyn PlatformAgent>,
        neighbor_io: impl NeighborIo + 'static,
    ) -> Result<Daemon> {
        let (shutdown_tx, _) = broadcast::channel(8);
        let mut tasks = Vec::new();

        // watchdog first so everyone can tick it
        let (watchdog_rx, watchdog_tx) = messaging::channel();
        let (watchdog, watchdog_state) = Watchdog::new(
            config.is_watchdog_enabled().then(|| config.watchdog()).flatten(),
            watchdog_rx,
            shutdown_tx.clone(),
        );
        tasks.push(tokio::spawn(watchdog.run(shutdown_tx.subscribe())));

        // kvstore
        let (kv_cmd_rx, kvstore_tx) = messaging::channel();
        let (kvstore, kv_sync_port) =
            KvStore::bind(Arc::clone(&config), kv_cmd_rx, watchdog_tx.clone()).await?;
        tasks.push(tokio::spawn(kvstore.run(shutdown_tx.subscribe())));

        // spark
        let (spark_cmd_rx, spark_tx) = messaging::channel();
        let (neighbor_rx, neighbor_tx) = messaging::channel();
        let spark = Spark::new(
            Arc::clone(&config),
            kv_sync_port,
            neighbor_io,
            spark_cmd_rx,
            neighbor_tx,
            watchdog_tx.clone(),
        );
        tasks.push(tokio::spawn(spark.run(shutdown_tx.subscribe())));

        // prefix manager
        let (prefix_cmd_rx, prefix_tx) = messaging::channel();
        let prefix_manager = PrefixManager::new(
            PrefixManagerCore::new(Arc::clone(&config), kvstore_tx.clone()),
            prefix_cmd_rx,
            watchdog_tx.clone(),
        );
        tasks.push(tokio::spawn(prefix_manager.run(shutdown_tx.subscribe())));

        // link monitor
        let (platform_rx, platform_tx) = messaging::channel();
        let link_monitor = LinkMonitor::new(
            LinkMonitorCore::new(
                Arc::clone(&config),
                spark_tx.clone(),
                kvstore_tx.clone(),
                prefix_tx.clone(),
            )
            .with_persist(PersistentStore::new(config.persistent_store_path())),
            platform_rx,
            neighbor_rx,
            watchdog_tx.clone(),
        );
        tasks.push(tokio::spawn(link_monitor.run(shutdown_tx.subscribe())));

        // decision, subscribed to the store
        let (decision_pub_rx, decision_pub_tx) = messaging::channel();
        kvstore_tx
            .send(KvStoreCommand::Subscribe {
                subscriber: decision_pub_tx,
            })
            .ok();
        let (routes_rx, routes_tx) = messaging::channel();
        let decision = Decision::new(
            DecisionCore::new(Arc::clone(&config), routes_tx),
            decision_pub_rx,
            watchdog_tx.clone(),
        );
        tasks.push(tokio::spawn(decision.run(shutdown_tx.subscribe())));

        // tee decision output: fib + observers
        let (fib_routes_rx, fib_routes_tx) = messaging::channel();
        let (routes_watch_tx, routes_watch_rx) = watch::channel(RouteDatabase::default());
        tasks.push(tokio::spawn(tee_routes(
            routes_rx,
            fib_routes_tx,
            routes_watch_tx,
        )));

        // fib
        let (fib_platform_rx, fib_platform_tx) = messaging::channel();
        let fib = Fib::new(
            FibEngine::new(&config, agent.clone()),
            fib_routes_rx,
            fib_platform_rx,
            watchdog_tx.clone(),
        );
        tasks.push(tokio::spawn(fib.run(shutdown_tx.subscribe())));

        // allocator, second store subscriber
        if config.is_prefix_allocation_enabled() {
            let (alloc_pub_rx, alloc_pub_tx) = messaging::channel();
            kvstore_tx
                .send(KvStoreCommand::Subscribe {
                    subscriber: alloc_pub_tx,
                })
                .ok();
            let allocator = Allocator::new(
                AllocatorCore::new(
                    Arc::clone(&config),
                    kvstore_tx.clone(),
                    prefix_tx.clone(),
                    PersistentStore::new(config.persistent_store_path()),
                ),
                alloc_pub_rx,
                watchdog_tx.clone(),
            );
            tasks.push(tokio::spawn(allocator.run(shutdown_tx.subscribe())));
        }

        // seed the interface view from the platform
        match agent.get_interfaces().await {
            Ok(interfaces) => {
                for info in interfaces {
                    platform_tx.send_lossy(PlatformEvent::Link(info));
                }
            }
            Err(err) => warn!(error = %err, "initial interface fetch failed"),
        }

        info!(
            node = %config.node_name(),
            areas = config.areas().len(),
            kv_sync_port,
            "all components started"
        );
        Ok(Daemon {
            config,
            platform_tx,
            fib_platform_tx,
            kvstore_tx,
            prefix_tx,
            routes: routes_watch_rx,
            kv_sync_port,
            watchdog_state,
            shutdown_tx,
            tasks,
        })
    }

    /// Two-phase drain: signal every component, then wait them out with a
    /// deadline.
    pub async fn shutdown(self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("component did not drain within the shutdown deadline");
            }
        }
        info!("shutdown complete");
    }

    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Dump one area's store content (operational/test helper).
    pub async fn dump_kvstore(
        &self,
        area: &str,
    ) -> std::collections::BTreeMap<String, crate::kvstore::KvValue> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.kvstore_tx
            .send_lossy(KvStoreCommand::Dump {
                area: area.to_string(),
                resp: tx,
            });
        rx.await.unwrap_or_default()
    }
}

async fn tee_routes(
    mut routes_rx: crate::messaging::Inbox<RouteDatabase>,
    fib_tx: Outbox<RouteDatabase>,
    watch_tx: watch::Sender<RouteDatabase>,
) {
    while let Some(routes) = routes_rx.recv().await {
        let _ = watch_tx.send(routes.clone());
        fib_tx.send_lossy(routes);
    }
}
