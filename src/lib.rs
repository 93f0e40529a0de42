//! Mainline Kademlia DHT node plus a Bep5-based peer-discovery and
//! connection overlay for signed HTTP content distribution.
//!
//! A [dht_node::DhtNode] speaks BEP5 (peer lookup) and BEP44
//! (mutable/immutable data) over UDP at one local address;
//! [mainline::MainlineDht] owns one or more of them and fans queries out
//! across all local endpoints. [bep5_client::Bep5Client] builds peer
//! discovery and connect-racing on top, treating the DHT purely as a
//! rendezvous mechanism for TCP peers.
//!
//! ## Feature flags
#![doc = document_features::document_features!()]

pub mod announcer;
pub mod bep5_client;
pub mod bucket;
pub mod config;
pub mod dht_node;
pub mod error;
pub mod id;
pub mod injector_pinger;
pub mod lookup;
pub mod mainline;
pub mod martian;
pub mod messages;
pub mod mutable_item;
pub mod node;
pub mod rate_counter;
pub mod routing_table;
pub mod scheduler;
pub mod socket;
pub mod store;
pub mod swarm;
pub mod sync_primitives;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod token;
pub mod tracker;
pub mod transaction;

pub use bep5_client::Bep5Client;
pub use config::Config;
pub use dht_node::DhtNode;
pub use error::{DhtPutError, Error, LookupError, Result};
pub use id::Id;
pub use mainline::MainlineDht;
pub use mutable_item::MutableItem;
pub use node::NodeContact;
