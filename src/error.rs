//! Crate-wide error taxonomy.

use std::net::SocketAddr;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the DHT engine and the bep5 peer-discovery layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bencode-encode or decode a message: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("id must be {ID_SIZE} bytes, got {0}", ID_SIZE = crate::id::ID_SIZE)]
    InvalidIdSize(usize),

    #[error("id is not valid hex")]
    InvalidIdEncoding,

    #[error("malformed KRPC message: {0}")]
    Protocol(&'static str),

    #[error("request to {0:?} timed out")]
    Timeout(Option<SocketAddr>),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("the dht node has shut down")]
    Shutdown,

    #[error("no bootstrap node responded")]
    BootstrapFailed,

    #[error("put rejected: we are not responsible for this key (error 201)")]
    NotResponsible,

    #[error("put rejected: invalid signature (error 206)")]
    InvalidSignature,

    #[error("put rejected: value too big, must be < 1000 bytes encoded (error 205)")]
    ValueTooBig,

    #[error("put rejected: salt too big, must be <= 64 bytes (error 207)")]
    SaltTooBig,

    #[error("put rejected: cas mismatch (error 301)")]
    CasMismatch,

    #[error("put rejected: sequence number did not increase (error 302)")]
    SequenceNotUpdated,

    #[error("no responsible node accepted the write")]
    PublicationFailed,

    #[error("peer responded with error {code}: {description}")]
    PeerError { code: i32, description: String },

    #[error("network is unreachable: no candidate peer could be connected to")]
    NetworkUnreachable,
}

/// Error returned by a lookup, distinguishing "we reached responsible
/// nodes but they have nothing" from "we couldn't reach anyone" (spec.md
/// §9 Open Question).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    #[error("the lookup completed but no peers/data were found")]
    NoPeersFound,

    #[error("the lookup could not reach any contact")]
    NoContactReached,

    #[error("the lookup was cancelled")]
    Cancelled,
}

/// Error returned by a BEP44/BEP5 publication (`put`, `announce_peer`).
#[derive(Error, Debug)]
pub enum DhtPutError {
    #[error(transparent)]
    Put(#[from] Error),

    #[error("the dht node has shut down")]
    Shutdown,
}
