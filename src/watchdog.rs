//! Watchdog: component liveness and memory-limit enforcement.
//!
//! Every component posts a `Tick` about once a second. The watchdog flags
//! components whose ticks stop and requests an orderly shutdown when a
//! stall persists. RSS is sampled on the same cadence; crossing the
//! configured limit sets a sticky flag that operators (and tests) observe.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::WatchdogConfig;
use crate::messaging::Inbox;

/// Liveness heartbeat from one component's event loop.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub component: &'static str,
}

impl Tick {
    pub fn new(component: &'static str) -> Self {
        Tick { component }
    }
}

/// Shared observable state.
#[derive(Debug, Default)]
pub struct WatchdogState {
    memory_limit_exceeded: AtomicBool,
}

impl WatchdogState {
    pub fn memory_limit_exceeded(&self) -> bool {
        self.memory_limit_exceeded.load(Ordering::SeqCst)
    }
}

pub struct Watchdog {
    conf: WatchdogConfig,
    enforce: bool,
    inbox: Inbox<Tick>,
    state: Arc<WatchdogState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Watchdog {
    pub fn new(
        conf: Option<&WatchdogConfig>,
        inbox: Inbox<Tick>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, Arc<WatchdogState>) {
        let state = Arc::new(WatchdogState::default());
        (
            Watchdog {
                conf: conf.cloned().unwrap_or_default(),
                enforce: conf.is_some(),
                inbox,
                state: Arc::clone(&state),
                shutdown_tx,
            },
            state,
        )
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.conf.interval_s.max(1) as u64);
        let stall_limit = Duration::from_secs(self.conf.thread_timeout_s.max(1) as u64);
        let mut check = tokio::time::interval(interval);
        let mut last_seen: BTreeMap<&'static str, Instant> = BTreeMap::new();
        let mut stalled_checks: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                tick = self.inbox.recv() => match tick {
                    Some(tick) => {
                        last_seen.insert(tick.component, Instant::now());
                    }
                    None => break,
                },
                _ = check.tick() => {
                    let now = Instant::now();
                    let stalled: Vec<&str> = last_seen
                        .iter()
                        .filter(|(_, seen)| now.saturating_duration_since(**seen) > stall_limit)
                        .map(|(name, _)| *name)
                        .collect();
                    if stalled.is_empty() {
                        stalled_checks = 0;
                    } else {
                        stalled_checks += 1;
                        warn!(components = ?stalled, checks = stalled_checks, "components missed liveness ticks");
                        if self.enforce && stalled_checks >= 3 {
                            error!(components = ?stalled, "liveness stall persisted, requesting shutdown");
                            let _ = self.shutdown_tx.send(());
                        }
                    }

                    if self.enforce && !self.state.memory_limit_exceeded() {
                        if let Some(rss_mb) = rss_mb() {
                            let limit = self.conf.max_memory_mb as u64;
                            if rss_mb > limit {
                                error!(rss_mb, limit_mb = limit, "memory limit exceeded");
                                self.state.memory_limit_exceeded.store(true, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }
        }
        info!("watchdog stopped");
    }
}

/// Resident set size in MB from /proc/self/statm.
fn rss_mb() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64 / (1024 * 1024))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging;

    #[test]
    fn test_rss_sampling_works_on_linux() {
        let rss = rss_mb().expect("statm should parse");
        assert!(rss > 0);
    }

    #[tokio::test]
    async fn test_ticks_keep_watchdog_quiet() {
        let (inbox, outbox) = messaging::channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let conf = WatchdogConfig {
            interval_s: 1,
            thread_timeout_s: 1,
            max_memory_mb: 1 << 20,
        };
        let (watchdog, state) = Watchdog::new(Some(&conf), inbox, shutdown_tx.clone());
        let handle = tokio::spawn(watchdog.run(shutdown_tx.subscribe()));

        outbox.send(Tick::new("test-component")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!state.memory_limit_exceeded());

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_tiny_memory_limit_sets_sticky_flag() {
        let (inbox, _outbox) = messaging::channel::<Tick>();
        let (shutdown_tx, _) = broadcast::channel(1);
        let conf = WatchdogConfig {
            interval_s: 1,
            thread_timeout_s: 300,
            max_memory_mb: 1,
        };
        let (watchdog, state) = Watchdog::new(Some(&conf), inbox, shutdown_tx.clone());
        let handle = tokio::spawn(watchdog.run(shutdown_tx.subscribe()));

        // first check tick fires immediately
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(state.memory_limit_exceeded());

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }
}
