//! KvStore peer protocol: length-prefixed bincode frames over TCP.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::types::AreaId;

use super::KvValue;

pub const KV_WIRE_VERSION: u16 = 1;

/// Frames larger than this are treated as protocol corruption.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Compressed view of one stored value, enough to run the merge order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvSummaryEntry {
    pub version: u64,
    pub originator: String,
    pub hash: i64,
    pub ttl_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvWireMessage {
    /// First frame on every session, both directions.
    PeerHello { node_name: String },
    /// Full-sync request: everything the sender holds, summarized.
    Summary {
        area: AreaId,
        entries: BTreeMap<String, KvSummaryEntry>,
    },
    /// Full-sync response: values the requester lacks, plus the
    /// responder's own summary so the requester can send its delta back.
    SyncReply {
        area: AreaId,
        delta: BTreeMap<String, KvValue>,
        summary: BTreeMap<String, KvSummaryEntry>,
    },
    /// Final leg of a full sync.
    Delta {
        area: AreaId,
        entries: BTreeMap<String, KvValue>,
    },
    /// Regular flood. Values without bytes are TTL refreshes.
    Update {
        area: AreaId,
        entries: BTreeMap<String, KvValue>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvFrame {
    pub version: u16,
    pub domain_token: u64,
    pub msg: KvWireMessage,
}

impl KvFrame {
    pub fn new(domain_token: u64, msg: KvWireMessage) -> Self {
        KvFrame {
            version: KV_WIRE_VERSION,
            domain_token,
            msg,
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &KvFrame) -> Result<(), Error> {
    let bytes = bincode::serialize(frame)
        .map_err(|e| Error::SchemaMismatch(format!("unencodable kv frame: {}", e)))?;
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected_token: u64,
) -> Result<KvFrame, Error> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(Error::SchemaMismatch(format!(
            "kv frame length {} exceeds limit",
            len
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let frame: KvFrame = bincode::deserialize(&buf)
        .map_err(|e| Error::SchemaMismatch(format!("undecodable kv frame: {}", e)))?;
    if frame.version != KV_WIRE_VERSION {
        return Err(Error::SchemaMismatch(format!(
            "kv wire version {} != {}",
            frame.version, KV_WIRE_VERSION
        )));
    }
    if frame.domain_token != expected_token {
        return Err(Error::SchemaMismatch(format!(
            "kv domain token mismatch: {:#x}",
            frame.domain_token
        )));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = KvFrame::new(
            7,
            KvWireMessage::PeerHello {
                node_name: "node-1".to_string(),
            },
        );
        write_frame(&mut a, &frame).await.unwrap();
        let read = read_frame(&mut b, 7).await.unwrap();
        match read.msg {
            KvWireMessage::PeerHello { node_name } => assert_eq!(node_name, "node-1"),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_token_mismatch() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = KvFrame::new(
            7,
            KvWireMessage::PeerHello {
                node_name: "node-1".to_string(),
            },
        );
        write_frame(&mut a, &frame).await.unwrap();
        assert!(read_frame(&mut b, 8).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_u32(u32::MAX).await;
        });
        assert!(read_frame(&mut b, 0).await.is_err());
    }
}
