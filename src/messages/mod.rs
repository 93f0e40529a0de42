//! KRPC wire protocol: bencoded queries/responses/errors correlated by
//! transaction id, per spec.md §4.2/§6.
//!
//! Grounded on `examples/Thoxy67-mainline/src/messages/internal.rs`
//! (`DHTMessage`/`DHTMessageVariant`/... naming and shape), extended with
//! the BEP44 `get`/`put` variants the teacher's partial source doesn't show
//! but `original_source/src/bittorrent/dht.cpp`'s query dispatch requires.

pub mod internal;

pub use internal::*;
