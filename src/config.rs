//! Top-level configuration for the overlay node, generalizing
//! `examples/Thoxy67-mainline/src/dht.rs`'s `Config`/`DhtBuilder` to
//! multiple local endpoints and the Bep5 swarm/injector knobs.

use std::net::SocketAddr;
use std::time::Duration;

use crate::dht_node::DEFAULT_BOOTSTRAP_NODES;

/// Configuration for a [crate::mainline::MainlineDht] plus the Bep5
/// peer-discovery layer built on top of it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bootstrap hostnames, shared by every local [crate::dht_node::DhtNode].
    pub bootstrap: Vec<String>,
    /// Local UDP endpoints to bind, one DHT engine each.
    pub endpoints: Vec<SocketAddr>,
    /// Per-query UDP timeout.
    pub request_timeout: Duration,
    /// Swarm name for the injector swarm (spec.md: origin content publishers).
    pub injector_swarm_name: String,
    /// Swarm names this node also helps cache for.
    pub helper_swarm_names: Vec<String>,
    /// TCP port this node advertises in its own helper-swarm announces.
    pub announce_port: Option<u16>,
    /// UPnP port-mapping lease refresh interval.
    ///
    /// Not implemented: this node relies on bootstrap/relay-based
    /// reachability rather than UPnP (see Non-goals). The field is kept so
    /// a future implementation has a documented home for it instead of a
    /// breaking config change.
    pub upnp_lease_refresh: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            endpoints: vec!["0.0.0.0:0".parse().unwrap()],
            request_timeout: crate::dht_node::DEFAULT_REQUEST_TIMEOUT,
            injector_swarm_name: "injectors".to_string(),
            helper_swarm_names: Vec::new(),
            announce_port: None,
            upnp_lease_refresh: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn bootstrap(mut self, bootstrap: Vec<String>) -> Self {
        self.0.bootstrap = bootstrap;
        self
    }

    pub fn endpoints(mut self, endpoints: Vec<SocketAddr>) -> Self {
        self.0.endpoints = endpoints;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.0.request_timeout = timeout;
        self
    }

    pub fn injector_swarm_name(mut self, name: impl Into<String>) -> Self {
        self.0.injector_swarm_name = name.into();
        self
    }

    pub fn helper_swarm_names(mut self, names: Vec<String>) -> Self {
        self.0.helper_swarm_names = names;
        self
    }

    pub fn announce_port(mut self, port: u16) -> Self {
        self.0.announce_port = Some(port);
        self
    }

    pub fn build(self) -> Config {
        self.0
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::builder()
            .bootstrap(vec![])
            .injector_swarm_name("my-injectors")
            .build();
        assert!(config.bootstrap.is_empty());
        assert_eq!(config.injector_swarm_name, "my-injectors");
        assert_eq!(config.endpoints, Config::default().endpoints);
    }
}
