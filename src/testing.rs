//! Local multi-node testnet harness, generalized from
//! `examples/Thoxy67-mainline/src/dht.rs`'s `Testnet` to bind several
//! [MainlineDht] nodes all bootstrapped off the first.

use crate::mainline::MainlineDht;

/// Installs a `tracing` subscriber for test binaries, if one isn't already
/// set. Safe to call from every test; only the first call takes effect.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A small mainline DHT network running entirely on loopback, for
/// integration tests instead of the public network.
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<MainlineDht>,
}

impl Testnet {
    pub async fn new(count: usize) -> std::io::Result<Self> {
        let mut nodes = Vec::with_capacity(count);
        let mut bootstrap = Vec::new();

        for i in 0..count {
            let endpoints = ["127.0.0.1:0".parse().unwrap()];
            let node = if i == 0 {
                MainlineDht::bind(&endpoints, vec![]).await?
            } else {
                MainlineDht::bind(&endpoints, bootstrap.clone()).await?
            };

            if i == 0 {
                let addr = node.local_endpoints()[0];
                bootstrap.push(format!("127.0.0.1:{}", addr.port()));
            }

            nodes.push(node);
        }

        Ok(Self { bootstrap, nodes })
    }
}

impl Drop for Testnet {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn testnet_boots_several_nodes() {
        let testnet = Testnet::new(3).await.unwrap();
        assert_eq!(testnet.nodes.len(), 3);
        assert_eq!(testnet.bootstrap.len(), 1);
    }
}
