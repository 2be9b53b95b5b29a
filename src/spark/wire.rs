//! Spark wire records.
//!
//! Every datagram is a bincode-encoded `SparkFrame`. The frame header pins
//! the schema version and the shared-key domain token; a mismatch on either
//! is counted and dropped, never fatal.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Bumped on any incompatible schema change.
pub const SPARK_WIRE_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkHello {
    pub node_name: String,
    pub area_id: String,
    /// Set once the sender has heard the receiver on this interface.
    pub neighbor_name: Option<String>,
    /// Sender's interface name.
    pub interface: String,
    pub timestamp_us: u64,
    pub seq: u64,
    /// Advances on every process restart; GR resumption is detected by a
    /// counter that moved.
    pub restart_counter: u64,
    pub hold_time_s: u32,
    pub keepalive_time_s: u32,
    pub graceful_restart_time_s: u32,
    pub supports_gr: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkHandshake {
    pub node_name: String,
    pub neighbor_name: String,
    pub v4_addr: Option<Ipv4Addr>,
    pub v6_addr: Option<Ipv6Addr>,
    pub transport_addrs: Vec<IpAddr>,
    pub open_port: u16,
    pub kv_sync_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkHeartbeat {
    pub node_name: String,
    pub seq: u64,
    pub timestamp_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SparkPacket {
    Hello(SparkHello),
    Handshake(SparkHandshake),
    Heartbeat(SparkHeartbeat),
}

impl SparkPacket {
    pub fn node_name(&self) -> &str {
        match self {
            SparkPacket::Hello(h) => &h.node_name,
            SparkPacket::Handshake(h) => &h.node_name,
            SparkPacket::Heartbeat(h) => &h.node_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkFrame {
    pub version: u16,
    pub domain_token: u64,
    pub packet: SparkPacket,
}

impl SparkFrame {
    pub fn new(domain_token: u64, packet: SparkPacket) -> Self {
        SparkFrame {
            version: SPARK_WIRE_VERSION,
            domain_token,
            packet,
        }
    }
}

pub fn encode(frame: &SparkFrame) -> Vec<u8> {
    // serializing our own frame cannot fail
    bincode::serialize(frame).unwrap_or_default()
}

pub fn decode(bytes: &[u8], expected_token: u64) -> Result<SparkFrame, Error> {
    let frame: SparkFrame = bincode::deserialize(bytes)
        .map_err(|e| Error::SchemaMismatch(format!("undecodable spark frame: {}", e)))?;
    if frame.version != SPARK_WIRE_VERSION {
        return Err(Error::SchemaMismatch(format!(
            "spark wire version {} != {}",
            frame.version, SPARK_WIRE_VERSION
        )));
    }
    if frame.domain_token != expected_token {
        return Err(Error::SchemaMismatch(format!(
            "domain token mismatch: {:#x}",
            frame.domain_token
        )));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> SparkHello {
        SparkHello {
            node_name: "node-1".to_string(),
            area_id: "0".to_string(),
            neighbor_name: Some("node-2".to_string()),
            interface: "1/2".to_string(),
            timestamp_us: 123_456,
            seq: 7,
            restart_counter: 99,
            hold_time_s: 10,
            keepalive_time_s: 2,
            graceful_restart_time_s: 30,
            supports_gr: true,
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = SparkFrame::new(0xdead_beef, SparkPacket::Hello(hello()));
        let bytes = encode(&frame);
        let decoded = decode(&bytes, 0xdead_beef).unwrap();
        match decoded.packet {
            SparkPacket::Hello(h) => {
                assert_eq!(h.node_name, "node-1");
                assert_eq!(h.seq, 7);
                assert_eq!(h.neighbor_name.as_deref(), Some("node-2"));
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_token_mismatch_rejected() {
        let frame = SparkFrame::new(1, SparkPacket::Hello(hello()));
        let bytes = encode(&frame);
        assert!(decode(&bytes, 2).is_err());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut frame = SparkFrame::new(0, SparkPacket::Hello(hello()));
        frame.version = SPARK_WIRE_VERSION + 1;
        let bytes = bincode::serialize(&frame).unwrap();
        assert!(decode(&bytes, 0).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode(&[0xff; 3], 0).is_err());
    }
}
