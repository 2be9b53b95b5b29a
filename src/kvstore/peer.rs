//! KvStore peer session plumbing.
//!
//! Sessions are dumb pipes: they validate the hello exchange, then shuttle
//! frames between the socket and the KvStore task. All protocol decisions
//! (sync, merge, flood) happen in the KvStore task. Reader and writer run
//! as separate tasks so a torn frame can never be half-consumed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::messaging::Outbox;

use super::wire::{self, KvFrame, KvWireMessage};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session lifecycle and traffic, delivered into the KvStore task.
#[derive(Debug)]
pub enum SessionEvent {
    Connected {
        session_id: u64,
        peer_name: String,
        outbox: UnboundedSender<KvWireMessage>,
        initiated: bool,
    },
    Message {
        session_id: u64,
        msg: KvWireMessage,
    },
    Disconnected {
        session_id: u64,
    },
}

/// Kill switch for an outbound dialer.
pub struct DialerHandle {
    kill: watch::Sender<bool>,
}

impl DialerHandle {
    pub fn stop(&self) {
        let _ = self.kill.send(true);
    }
}

/// Accept inbound sessions until shutdown fires.
pub fn spawn_acceptor(
    listener: TcpListener,
    node_name: String,
    domain_token: u64,
    events: Outbox<SessionEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer_addr = %addr, "inbound kvstore session");
                        let node_name = node_name.clone();
                        let events = events.clone();
                        tokio::spawn(async move {
                            run_session(stream, node_name, domain_token, events, false).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "kvstore accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    });
}

/// Keep one outbound session alive toward a peer, reconnecting with
/// bounded backoff. The peer is never dropped on socket errors; only the
/// returned handle removes it.
pub fn spawn_dialer(
    peer_name: String,
    addr: SocketAddr,
    node_name: String,
    domain_token: u64,
    events: Outbox<SessionEvent>,
) -> DialerHandle {
    let (kill_tx, mut kill_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10));
        loop {
            if *kill_rx.borrow() {
                break;
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!(peer = %peer_name, peer_addr = %addr, "kvstore peer connected");
                    run_session(stream, node_name.clone(), domain_token, events.clone(), true)
                        .await;
                    debug!(peer = %peer_name, "kvstore peer session ended");
                }
                Err(err) => {
                    debug!(peer = %peer_name, error = %err, "kvstore peer connect failed");
                }
            }
            let delay = backoff.bump(Instant::now());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = kill_rx.changed() => {
                    if *kill_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    DialerHandle { kill: kill_tx }
}

impl Drop for DialerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_session(
    stream: TcpStream,
    node_name: String,
    domain_token: u64,
    events: Outbox<SessionEvent>,
    initiated: bool,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    // hello exchange, bounded
    let hello = KvFrame::new(domain_token, KvWireMessage::PeerHello { node_name });
    if wire::write_frame(&mut write_half, &hello).await.is_err() {
        return;
    }
    let first = match tokio::time::timeout(
        Duration::from_secs(10),
        wire::read_frame(&mut read_half, domain_token),
    )
    .await
    {
        Ok(Ok(frame)) => frame,
        Ok(Err(err)) => {
            debug!(error = %err, "kvstore session hello failed");
            return;
        }
        Err(_) => {
            debug!("kvstore session hello timed out");
            return;
        }
    };
    let peer_name = match first.msg {
        KvWireMessage::PeerHello { node_name } => node_name,
        other => {
            debug!(msg = ?other, "kvstore session started without hello");
            return;
        }
    };

    let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<KvWireMessage>();
    events.send_lossy(SessionEvent::Connected {
        session_id,
        peer_name: peer_name.clone(),
        outbox: tx,
        initiated,
    });

    let reader_events = events.clone();
    let mut reader = tokio::spawn(async move {
        loop {
            match wire::read_frame(&mut read_half, domain_token).await {
                Ok(frame) => reader_events.send_lossy(SessionEvent::Message {
                    session_id,
                    msg: frame.msg,
                }),
                Err(err) => {
                    debug!(error = %err, "kvstore session read ended");
                    break;
                }
            }
        }
    });
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = KvFrame::new(domain_token, msg);
            if let Err(err) = wire::write_frame(&mut write_half, &frame).await {
                debug!(error = %err, "kvstore session write ended");
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut reader => {}
        _ = &mut writer => {}
    }
    reader.abort();
    writer.abort();
    events.send_lossy(SessionEvent::Disconnected { session_id });
}
