//! Channel-backed neighbor transport for multi-node tests.
//!
//! Plays the role the real link-local multicast plays in production: a
//! `Mesh` holds the (node, iface) -> (node, iface) connectivity, and each
//! node's `MeshIo` delivers datagrams over it. Links can be cut and
//! restored at runtime to simulate flaps and partitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::NeighborIo;

type Endpoint = (String, String);

#[derive(Default)]
struct MeshInner {
    links: HashMap<Endpoint, Vec<Endpoint>>,
    inboxes: HashMap<String, UnboundedSender<(String, Vec<u8>)>>,
}

/// Shared connectivity fabric.
#[derive(Clone, Default)]
pub struct Mesh {
    inner: Arc<Mutex<MeshInner>>,
}

impl Mesh {
    pub fn new() -> Self {
        Mesh::default()
    }

    /// Create the transport for one node. Call once per node.
    pub fn endpoint(&self, node: &str) -> MeshIo {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .inboxes
            .insert(node.to_string(), tx);
        MeshIo {
            node: node.to_string(),
            inner: Arc::clone(&self.inner),
            rx,
        }
    }

    /// Wire two interfaces together, both directions.
    pub fn connect(&self, a_node: &str, a_iface: &str, b_node: &str, b_iface: &str) {
        let mut inner = self.inner.lock().unwrap();
        let a = (a_node.to_string(), a_iface.to_string());
        let b = (b_node.to_string(), b_iface.to_string());
        inner.links.entry(a.clone()).or_default().push(b.clone());
        inner.links.entry(b).or_default().push(a);
    }

    /// Cut a link, both directions. Pending datagrams already delivered
    /// stay delivered; the link just stops carrying new ones.
    pub fn disconnect(&self, a_node: &str, a_iface: &str, b_node: &str, b_iface: &str) {
        let mut inner = self.inner.lock().unwrap();
        let a = (a_node.to_string(), a_iface.to_string());
        let b = (b_node.to_string(), b_iface.to_string());
        if let Some(peers) = inner.links.get_mut(&a) {
            peers.retain(|p| *p != b);
        }
        if let Some(peers) = inner.links.get_mut(&b) {
            peers.retain(|p| *p != a);
        }
    }
}

/// One node's view of the mesh.
pub struct MeshIo {
    node: String,
    inner: Arc<Mutex<MeshInner>>,
    rx: UnboundedReceiver<(String, Vec<u8>)>,
}

#[async_trait]
impl NeighborIo for MeshIo {
    async fn recv(&mut self) -> std::io::Result<(String, Vec<u8>)> {
        self.rx.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mesh torn down")
        })
    }

    async fn send(&mut self, iface: &str, payload: &[u8]) -> std::io::Result<()> {
        let inner = self.inner.lock().unwrap();
        let key = (self.node.clone(), iface.to_string());
        if let Some(peers) = inner.links.get(&key) {
            for (peer_node, peer_iface) in peers {
                if let Some(tx) = inner.inboxes.get(peer_node) {
                    let _ = tx.send((peer_iface.clone(), payload.to_vec()));
                }
            }
        }
        Ok(())
    }
}
