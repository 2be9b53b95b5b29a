//! Spark: neighbor discovery over link-local multicast.
//!
//! The component owns one FSM per tracked interface plus the UDP socket.
//! LinkMonitor decides which interfaces participate (area regex filtering)
//! and feeds them in as commands; Spark feeds neighbor events back out.
//!
//! The packet/timer core (`SparkCore`) is synchronous; the `run` loop only
//! shuttles bytes between it and the `NeighborIo` transport, so the whole
//! protocol is testable without sockets.

pub mod fsm;
pub mod step_detector;
pub mod testing;
pub mod wire;

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV6};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::messaging::{Inbox, Outbox};
use crate::types::AreaId;
use crate::watchdog::Tick;

use fsm::{FsmOutput, FsmTimers, NeighborInfo, SparkFsm};
use step_detector::StepDetector;
use wire::{SparkFrame, SparkHandshake, SparkHeartbeat, SparkHello, SparkPacket};

/// Transport for spark datagrams, keyed by interface name.
#[async_trait]
pub trait NeighborIo: Send {
    async fn recv(&mut self) -> std::io::Result<(String, Vec<u8>)>;
    async fn send(&mut self, iface: &str, payload: &[u8]) -> std::io::Result<()>;
    fn register_iface(&mut self, _name: &str, _ifindex: u32) {}
    fn unregister_iface(&mut self, _name: &str) {}
}

/// Interface handed over by LinkMonitor after area filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedInterface {
    pub name: String,
    pub ifindex: u32,
    pub link_local_v6: Option<Ipv6Addr>,
    pub v4_addr: Option<Ipv4Addr>,
    pub v6_addr: Option<Ipv6Addr>,
}

#[derive(Debug, Clone)]
pub enum SparkCommand {
    TrackInterface { area: AreaId, info: TrackedInterface },
    UntrackInterface { iface: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NeighborEventKind {
    Up(NeighborInfo),
    Down { node_name: String },
    RttChange { node_name: String, rtt_us: u64 },
    GrStart { node_name: String },
    GrEnd(NeighborInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEvent {
    pub area: AreaId,
    pub iface: String,
    pub kind: NeighborEventKind,
}

struct IfaceState {
    area: AreaId,
    track: TrackedInterface,
    fsm: SparkFsm,
    step: StepDetector,
    hello_seq: u64,
}

#[derive(Debug, Default)]
struct SparkCounters {
    bad_frames: u64,
    area_mismatch_hellos: u64,
    foreign_handshakes: u64,
}

/// Synchronous protocol core: all state, no I/O.
pub struct SparkCore {
    config: Arc<Config>,
    restart_counter: u64,
    kv_sync_port: u16,
    ifaces: BTreeMap<String, IfaceState>,
    events: Outbox<NeighborEvent>,
    counters: SparkCounters,
}

/// Bytes to transmit, per interface.
type Sends = Vec<(String, Vec<u8>)>;

impl SparkCore {
    pub fn new(config: Arc<Config>, kv_sync_port: u16, events: Outbox<NeighborEvent>) -> Self {
        // monotone across process restarts, which is what GR detection needs
        let restart_counter = unix_micros();
        SparkCore {
            config,
            restart_counter,
            kv_sync_port,
            ifaces: BTreeMap::new(),
            events,
            counters: SparkCounters::default(),
        }
    }

    fn timers(&self) -> FsmTimers {
        let spark = self.config.spark();
        FsmTimers {
            hello: Duration::from_secs(spark.hello_time_s as u64),
            fastinit_hello: Duration::from_millis(spark.fastinit_hello_time_ms as u64),
            fastinit_window: Duration::from_secs(spark.fastinit_window_s as u64),
            keepalive: Duration::from_secs(spark.keepalive_time_s as u64),
            handshake_hold: Duration::from_secs(spark.hold_time_s as u64),
            rtt_probe: Duration::from_secs((spark.keepalive_time_s as u64) * 5),
        }
    }

    pub fn handle_command(&mut self, cmd: SparkCommand, now: Instant) -> Sends {
        match cmd {
            SparkCommand::TrackInterface { area, info } => self.track(area, info, now),
            SparkCommand::UntrackInterface { iface } => self.untrack(&iface, now),
        }
    }

    fn track(&mut self, area: AreaId, info: TrackedInterface, now: Instant) -> Sends {
        if info.link_local_v6.is_none() {
            debug!(iface = %info.name, "not tracking interface without a link-local v6 address");
            let name = info.name.clone();
            return self.untrack(&name, now);
        }
        if let Some(existing) = self.ifaces.get_mut(&info.name) {
            if existing.area == area {
                // address refresh only
                existing.track = info;
                return Vec::new();
            }
            // area changed: restart discovery from scratch
            let name = info.name.clone();
            let mut sends = self.untrack(&name, now);
            sends.extend(self.track(area, info, now));
            return sends;
        }

        info!(iface = %info.name, area = %area, "starting neighbor discovery");
        let name = info.name.clone();
        let mut state = IfaceState {
            area: area.clone(),
            fsm: SparkFsm::new(
                self.config.node_name().to_string(),
                area,
                name.clone(),
                self.timers(),
            ),
            step: StepDetector::new(&self.config.spark().step_detector_conf),
            track: info,
            hello_seq: 0,
        };
        let outputs = state.fsm.on_iface_up(now);
        self.ifaces.insert(name.clone(), state);
        self.process_outputs(&name, outputs)
    }

    fn untrack(&mut self, iface: &str, now: Instant) -> Sends {
        let outputs = match self.ifaces.get_mut(iface) {
            Some(state) => {
                info!(iface = %iface, "stopping neighbor discovery");
                state.fsm.on_iface_down(now)
            }
            None => return Vec::new(),
        };
        let sends = self.process_outputs(iface, outputs);
        self.ifaces.remove(iface);
        sends
    }

    pub fn handle_packet(&mut self, iface: &str, payload: &[u8], now: Instant) -> Sends {
        let frame = match wire::decode(payload, self.config.domain_token()) {
            Ok(frame) => frame,
            Err(err) => {
                self.counters.bad_frames += 1;
                debug!(iface = %iface, error = %err, dropped = self.counters.bad_frames, "dropping bad spark frame");
                return Vec::new();
            }
        };
        if frame.packet.node_name() == self.config.node_name() {
            return Vec::new();
        }
        let Some(state) = self.ifaces.get_mut(iface) else {
            return Vec::new();
        };

        let outputs = match &frame.packet {
            SparkPacket::Hello(hello) => {
                if hello.area_id != state.area {
                    self.counters.area_mismatch_hellos += 1;
                    debug!(iface = %iface, peer_area = %hello.area_id, "dropping hello from foreign area");
                    return Vec::new();
                }
                let Some(area_conf) = self.config.areas().get(&state.area) else {
                    return Vec::new();
                };
                if !area_conf.should_peer_with_neighbor(&hello.node_name) {
                    debug!(iface = %iface, peer = %hello.node_name, "peer rejected by area neighbor regexes");
                    return Vec::new();
                }
                state.fsm.on_hello(hello, now)
            }
            SparkPacket::Handshake(hs) => {
                if hs.neighbor_name != self.config.node_name() {
                    self.counters.foreign_handshakes += 1;
                    return Vec::new();
                }
                state.fsm.on_handshake(hs, now)
            }
            SparkPacket::Heartbeat(hb) => state.fsm.on_heartbeat(hb, now),
        };
        self.process_outputs(iface, outputs)
    }

    pub fn handle_timers(&mut self, now: Instant) -> Sends {
        let names: Vec<String> = self.ifaces.keys().cloned().collect();
        let mut sends = Vec::new();
        for name in names {
            let outputs = match self.ifaces.get_mut(&name) {
                Some(state) => state.fsm.on_timer(now),
                None => continue,
            };
            sends.extend(self.process_outputs(&name, outputs));
        }
        sends
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.ifaces.values().filter_map(|s| s.fsm.next_deadline()).min()
    }

    fn process_outputs(&mut self, iface: &str, outputs: Vec<FsmOutput>) -> Sends {
        let mut sends = Vec::new();
        for output in outputs {
            let Some(state) = self.ifaces.get_mut(iface) else {
                break;
            };
            match output {
                FsmOutput::SendHello { fastinit: _ } => {
                    state.hello_seq += 1;
                    let spark = self.config.spark();
                    let hello = SparkHello {
                        node_name: self.config.node_name().to_string(),
                        area_id: state.area.clone(),
                        neighbor_name: state.fsm.peer_name().map(|s| s.to_string()),
                        interface: iface.to_string(),
                        timestamp_us: unix_micros(),
                        seq: state.hello_seq,
                        restart_counter: self.restart_counter,
                        hold_time_s: spark.hold_time_s as u32,
                        keepalive_time_s: spark.keepalive_time_s as u32,
                        graceful_restart_time_s: spark.graceful_restart_time_s as u32,
                        supports_gr: self.config.is_graceful_restart_enabled(),
                    };
                    sends.push((iface.to_string(), self.encode(SparkPacket::Hello(hello))));
                }
                FsmOutput::SendHandshake => {
                    let Some(peer) = state.fsm.peer_name() else {
                        continue;
                    };
                    let hs = SparkHandshake {
                        node_name: self.config.node_name().to_string(),
                        neighbor_name: peer.to_string(),
                        v4_addr: state.track.v4_addr,
                        v6_addr: state.track.v6_addr.or(state.track.link_local_v6),
                        transport_addrs: state
                            .track
                            .link_local_v6
                            .map(|a| vec![a.into()])
                            .unwrap_or_default(),
                        open_port: 0,
                        kv_sync_port: self.kv_sync_port,
                    };
                    sends.push((iface.to_string(), self.encode(SparkPacket::Handshake(hs))));
                }
                FsmOutput::SendHeartbeat => {
                    let hb = SparkHeartbeat {
                        node_name: self.config.node_name().to_string(),
                        seq: state.fsm.heartbeat_seq(),
                        timestamp_us: unix_micros(),
                    };
                    sends.push((iface.to_string(), self.encode(SparkPacket::Heartbeat(hb))));
                }
                FsmOutput::NeighborUp(info) => {
                    info!(iface = %iface, neighbor = %info.node_name, area = %state.area, "neighbor up");
                    self.emit(iface, NeighborEventKind::Up(info));
                }
                FsmOutput::NeighborDown { node_name } => {
                    info!(iface = %iface, neighbor = %node_name, "neighbor down");
                    self.emit(iface, NeighborEventKind::Down { node_name });
                }
                FsmOutput::NeighborRestarting { node_name } => {
                    info!(iface = %iface, neighbor = %node_name, "neighbor entered graceful restart");
                    self.emit(iface, NeighborEventKind::GrStart { node_name });
                }
                FsmOutput::NeighborRestarted(info) => {
                    info!(iface = %iface, neighbor = %info.node_name, "neighbor completed graceful restart");
                    self.emit(iface, NeighborEventKind::GrEnd(info));
                }
                FsmOutput::RttSample { node_name, rtt_us } => {
                    if let Some(published) = state.step.add_sample(rtt_us) {
                        self.emit(
                            iface,
                            NeighborEventKind::RttChange {
                                node_name,
                                rtt_us: published,
                            },
                        );
                    }
                }
            }
        }
        sends
    }

    fn emit(&self, iface: &str, kind: NeighborEventKind) {
        let area = self
            .ifaces
            .get(iface)
            .map(|s| s.area.clone())
            .unwrap_or_default();
        self.events.send_lossy(NeighborEvent {
            area,
            iface: iface.to_string(),
            kind,
        });
    }

    fn encode(&self, packet: SparkPacket) -> Vec<u8> {
        wire::encode(&SparkFrame::new(self.config.domain_token(), packet))
    }
}

/// The Spark component task.
pub struct Spark<IO: NeighborIo> {
    core: SparkCore,
    io: IO,
    inbox: Inbox<SparkCommand>,
    watchdog: Outbox<Tick>,
}

impl<IO: NeighborIo> Spark<IO> {
    pub fn new(
        config: Arc<Config>,
        kv_sync_port: u16,
        io: IO,
        inbox: Inbox<SparkCommand>,
        events: Outbox<NeighborEvent>,
        watchdog: Outbox<Tick>,
    ) -> Self {
        Spark {
            core: SparkCore::new(config, kv_sync_port, events),
            io,
            inbox,
            watchdog,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let Spark {
            mut core,
            mut io,
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
                cmd = inbox.recv() => match cmd {
                    Some(cmd) => {
                        if let SparkCommand::TrackInterface { info, .. } = &cmd {
                            io.register_iface(&info.name, info.ifindex);
                        }
                        if let SparkCommand::UntrackInterface { iface } = &cmd {
                            io.unregister_iface(iface);
                        }
                        let sends = core.handle_command(cmd, Instant::now());
                        transmit(&mut io, sends).await;
                    }
                    None => break,
                },
                result = io.recv() => match result {
                    Ok((iface, payload)) => {
                        let sends = core.handle_packet(&iface, &payload, Instant::now());
                        transmit(&mut io, sends).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "spark socket error, continuing");
                    }
                },
                _ = tokio::time::sleep_until(deadline.into()) => {
                    let sends = core.handle_timers(Instant::now());
                    transmit(&mut io, sends).await;
                }
                _ = liveness.tick() => {
                    watchdog.send_lossy(Tick::new("spark"));
                }
            }
        }
        info!("spark stopped");
    }
}

async fn transmit<IO: NeighborIo>(io: &mut IO, sends: Sends) {
    for (iface, payload) in sends {
        if let Err(err) = io.send(&iface, &payload).await {
            debug!(iface = %iface, error = %err, "spark send failed");
        }
    }
}

/// Multicast group spark speaks on (all-nodes, link scope).
const SPARK_MCAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Real transport: one UDP socket, link-local multicast per interface.
pub struct UdpNeighborIo {
    socket: UdpSocket,
    port: u16,
    name_by_index: BTreeMap<u32, String>,
    index_by_name: BTreeMap<String, u32>,
}

impl UdpNeighborIo {
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("::", port)).await?;
        Ok(UdpNeighborIo {
            socket,
            port,
            name_by_index: BTreeMap::new(),
            index_by_name: BTreeMap::new(),
        })
    }
}

#[async_trait]
impl NeighborIo for UdpNeighborIo {
    async fn recv(&mut self) -> std::io::Result<(String, Vec<u8>)> {
        let mut buf = vec![0u8; 8192];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            let scope = match src {
                std::net::SocketAddr::V6(v6) => v6.scope_id(),
                std::net::SocketAddr::V4(_) => 0,
            };
            if let Some(name) = self.name_by_index.get(&scope) {
                return Ok((name.clone(), buf[..len].to_vec()));
            }
            // datagram from an untracked interface; keep reading
        }
    }

    async fn send(&mut self, iface: &str, payload: &[u8]) -> std::io::Result<()> {
        let Some(&ifindex) = self.index_by_name.get(iface) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("interface {} not registered", iface),
            ));
        };
        let dst = SocketAddrV6::new(SPARK_MCAST_GROUP, self.port, 0, ifindex);
        self.socket.send_to(payload, dst).await?;
        Ok(())
    }

    fn register_iface(&mut self, name: &str, ifindex: u32) {
        if self.index_by_name.contains_key(name) {
            return;
        }
        if let Err(err) = self.socket.join_multicast_v6(&SPARK_MCAST_GROUP, ifindex) {
            warn!(iface = %name, error = %err, "failed to join spark multicast group");
        }
        self.name_by_index.insert(ifindex, name.to_string());
        self.index_by_name.insert(name.to_string(), ifindex);
    }

    fn unregister_iface(&mut self, name: &str) {
        if let Some(ifindex) = self.index_by_name.remove(name) {
            let _ = self.socket.leave_multicast_v6(&SPARK_MCAST_GROUP, ifindex);
            self.name_by_index.remove(&ifindex);
        }
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
