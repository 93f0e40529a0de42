//! Multi-address DHT manager: owns one [DhtNode] per local endpoint and
//! fans queries out across all of them, generalizing
//! `examples/Thoxy67-mainline/src/dht.rs`'s single-address `Dht` handle to
//! the multi-homed node described for the peer-discovery overlay.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as SyncMutex};

use tracing::warn;

use crate::dht_node::{Config as NodeConfig, DhtNode};
use crate::id::Id;
use crate::node::NodeContact;
use crate::sync_primitives::{SuccessCondition, WaitCondition};
use crate::{Error, LookupError, Result};

/// A [DhtNode] per locally-bound address, queried in parallel.
#[derive(Clone)]
pub struct MainlineDht {
    nodes: Vec<DhtNode>,
}

impl MainlineDht {
    /// Bind one [DhtNode] per address in `endpoints`, all sharing the same
    /// bootstrap list.
    pub async fn bind(endpoints: &[SocketAddr], bootstrap: Vec<String>) -> std::io::Result<Self> {
        let mut nodes = Vec::with_capacity(endpoints.len());
        for &addr in endpoints {
            let config = NodeConfig {
                bootstrap: bootstrap.clone(),
                bind_addr: addr,
                ..NodeConfig::default()
            };
            nodes.push(DhtNode::bind(config).await?);
        }
        Ok(Self { nodes })
    }

    pub fn local_endpoints(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|n| n.local_addr()).collect()
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }

    /// Swarm infohash for a named swarm (spec.md: "Swarm names map to
    /// infohashes by sha1(swarm_name)").
    pub fn swarm_infohash(name: &str) -> Id {
        crate::id::sha1(name.as_bytes())
    }

    pub async fn tracker_announce(&self, infohash: Id, port: Option<u16>) -> Result<()> {
        let condition = Arc::new(SuccessCondition::new());
        let last_err: Arc<SyncMutex<Option<Error>>> = Arc::new(SyncMutex::new(None));
        let mut handles = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let node = node.clone();
            let lock = condition.lock();
            let last_err = Arc::clone(&last_err);
            handles.push(tokio::spawn(async move {
                let addr = node.local_addr();
                match node.announce_peer(infohash, port).await {
                    Ok(()) => lock.release(true),
                    Err(err) => {
                        warn!(?err, ?addr, "announce failed on one local endpoint");
                        *last_err.lock().unwrap() = Some(err);
                        lock.release(false);
                    }
                }
            }));
        }

        let any_ok = condition.wait_for_success().await;
        for handle in handles {
            let _ = handle.await;
        }

        if any_ok {
            Ok(())
        } else {
            Err(last_err.lock().unwrap().take().unwrap_or(Error::NetworkUnreachable))
        }
    }

    pub async fn tracker_get_peers(&self, infohash: Id) -> std::result::Result<Vec<SocketAddr>, LookupError> {
        let condition = Arc::new(WaitCondition::new());
        let merged: Arc<SyncMutex<Vec<SocketAddr>>> = Arc::new(SyncMutex::new(Vec::new()));
        let any_reached: Arc<SyncMutex<bool>> = Arc::new(SyncMutex::new(false));
        let cancelled: Arc<SyncMutex<bool>> = Arc::new(SyncMutex::new(false));
        let mut handles = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let node = node.clone();
            let lock = condition.lock();
            let merged = Arc::clone(&merged);
            let any_reached = Arc::clone(&any_reached);
            let cancelled = Arc::clone(&cancelled);
            handles.push(tokio::spawn(async move {
                match node.get_peers(infohash).await {
                    Ok(peers) => {
                        *any_reached.lock().unwrap() = true;
                        merged.lock().unwrap().extend(peers);
                        lock.release(true);
                    }
                    Err(LookupError::NoPeersFound) => {
                        *any_reached.lock().unwrap() = true;
                        lock.release(false);
                    }
                    Err(LookupError::NoContactReached) => lock.release(false),
                    Err(LookupError::Cancelled) => {
                        *cancelled.lock().unwrap() = true;
                        lock.release(false);
                    }
                }
            }));
        }

        condition.wait_for_success().await;
        for handle in handles {
            let _ = handle.await;
        }

        if *cancelled.lock().unwrap() {
            return Err(LookupError::Cancelled);
        }

        let mut merged = merged.lock().unwrap().clone();
        merged.sort();
        merged.dedup();
        if !*any_reached.lock().unwrap() {
            Err(LookupError::NoContactReached)
        } else if merged.is_empty() {
            Err(LookupError::NoPeersFound)
        } else {
            Ok(merged)
        }
    }

    pub async fn immutable_put(&self, value: Vec<u8>) -> Result<Id> {
        let condition = Arc::new(SuccessCondition::new());
        let target: Arc<SyncMutex<Option<Id>>> = Arc::new(SyncMutex::new(None));
        let last_err: Arc<SyncMutex<Option<Error>>> = Arc::new(SyncMutex::new(None));
        let mut handles = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let node = node.clone();
            let value = value.clone();
            let lock = condition.lock();
            let target = Arc::clone(&target);
            let last_err = Arc::clone(&last_err);
            handles.push(tokio::spawn(async move {
                match node.put_immutable(value).await {
                    Ok(t) => {
                        *target.lock().unwrap() = Some(t);
                        lock.release(true);
                    }
                    Err(err) => {
                        *last_err.lock().unwrap() = Some(err);
                        lock.release(false);
                    }
                }
            }));
        }

        let succeeded = condition.wait_for_success().await;
        for handle in handles {
            let _ = handle.await;
        }

        if succeeded {
            Ok(target.lock().unwrap().expect("success implies a recorded target"))
        } else {
            Err(last_err.lock().unwrap().take().unwrap_or(Error::NetworkUnreachable))
        }
    }

    pub async fn immutable_get(&self, target: Id) -> Result<Option<Vec<u8>>> {
        let condition = Arc::new(SuccessCondition::new());
        let value: Arc<SyncMutex<Option<Vec<u8>>>> = Arc::new(SyncMutex::new(None));
        let mut handles = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let node = node.clone();
            let lock = condition.lock();
            let value = Arc::clone(&value);
            handles.push(tokio::spawn(async move {
                match node.get_immutable(target).await {
                    Ok(Some(v)) => {
                        *value.lock().unwrap() = Some(v);
                        lock.release(true);
                    }
                    _ => lock.release(false),
                }
            }));
        }

        condition.wait_for_success().await;
        for handle in handles {
            let _ = handle.await;
        }

        Ok(value.lock().unwrap().clone())
    }

    pub async fn mutable_put(&self, item: crate::mutable_item::MutableItem, cas: Option<i64>) -> Result<Id> {
        let condition = Arc::new(SuccessCondition::new());
        let target: Arc<SyncMutex<Option<Id>>> = Arc::new(SyncMutex::new(None));
        let last_err: Arc<SyncMutex<Option<Error>>> = Arc::new(SyncMutex::new(None));
        let mut handles = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let node = node.clone();
            let item = item.clone();
            let lock = condition.lock();
            let target = Arc::clone(&target);
            let last_err = Arc::clone(&last_err);
            handles.push(tokio::spawn(async move {
                match node.put_mutable(item, cas).await {
                    Ok(t) => {
                        *target.lock().unwrap() = Some(t);
                        lock.release(true);
                    }
                    Err(err) => {
                        *last_err.lock().unwrap() = Some(err);
                        lock.release(false);
                    }
                }
            }));
        }

        let succeeded = condition.wait_for_success().await;
        for handle in handles {
            let _ = handle.await;
        }

        if succeeded {
            Ok(target.lock().unwrap().expect("success implies a recorded target"))
        } else {
            Err(last_err.lock().unwrap().take().unwrap_or(Error::NetworkUnreachable))
        }
    }

    pub async fn mutable_get(
        &self,
        public_key: [u8; 32],
        salt: Option<Vec<u8>>,
    ) -> Result<Option<crate::mutable_item::MutableItem>> {
        let condition = Arc::new(WaitCondition::new());
        let best: Arc<SyncMutex<Option<crate::mutable_item::MutableItem>>> = Arc::new(SyncMutex::new(None));
        let mut handles = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let node = node.clone();
            let salt = salt.clone();
            let lock = condition.lock();
            let best = Arc::clone(&best);
            handles.push(tokio::spawn(async move {
                if let Ok(Some(item)) = node.get_mutable(public_key, salt).await {
                    let mut best = best.lock().unwrap();
                    if best.as_ref().map(|b| item.seq > b.seq).unwrap_or(true) {
                        *best = Some(item);
                    }
                    lock.release(true);
                } else {
                    lock.release(false);
                }
            }));
        }

        condition.wait_for_success().await;
        for handle in handles {
            let _ = handle.await;
        }

        Ok(best.lock().unwrap().clone())
    }

    pub async fn find_node(&self, target: Id) -> Result<Vec<NodeContact>> {
        let condition = Arc::new(WaitCondition::new());
        let merged: Arc<SyncMutex<HashMap<Id, NodeContact>>> = Arc::new(SyncMutex::new(HashMap::new()));
        let mut handles = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let node = node.clone();
            let lock = condition.lock();
            let merged = Arc::clone(&merged);
            handles.push(tokio::spawn(async move {
                if let Ok(contacts) = node.find_node(target).await {
                    let mut merged = merged.lock().unwrap();
                    for c in contacts {
                        merged.insert(c.id, c);
                    }
                    lock.release(true);
                } else {
                    lock.release(false);
                }
            }));
        }

        condition.wait_for_success().await;
        for handle in handles {
            let _ = handle.await;
        }

        Ok(merged.lock().unwrap().values().copied().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn bind_multiple_local_endpoints() {
        let addrs = ["127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap()];
        let dht = MainlineDht::bind(&addrs, vec![]).await.unwrap();
        assert_eq!(dht.local_endpoints().len(), 2);
    }

    #[test]
    fn swarm_infohash_is_deterministic() {
        let a = MainlineDht::swarm_infohash("injectors");
        let b = MainlineDht::swarm_infohash("injectors");
        assert_eq!(a, b);
    }
}
