use serde::{Deserialize, Serialize};
use serde_bencode::value::Value as BValue;

use crate::{Error, Result};

/// One KRPC message: transaction id, optional client version, optional
/// read-only flag, and either a query, a response, or an error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(default)]
    #[serde(rename = "v", with = "serde_bytes")]
    pub version: Option<Vec<u8>>,

    #[serde(flatten)]
    pub variant: MessageVariant,

    #[serde(default)]
    #[serde(rename = "ro")]
    pub read_only: Option<i32>,
}

impl Message {
    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        serde_bencode::from_bytes(bytes).map_err(Error::Bencode)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(Error::Bencode)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only == Some(1)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum MessageVariant {
    #[serde(rename = "q")]
    Query(QuerySpecific),

    #[serde(rename = "r")]
    Response(ResponseSpecific),

    #[serde(rename = "e")]
    Error(ErrorSpecific),
}

// === Queries ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum QuerySpecific {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: PingArguments,
    },

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "a")]
        arguments: FindNodeArguments,
    },

    #[serde(rename = "get_peers")]
    GetPeers {
        #[serde(rename = "a")]
        arguments: GetPeersArguments,
    },

    #[serde(rename = "announce_peer")]
    AnnouncePeer {
        #[serde(rename = "a")]
        arguments: AnnouncePeerArguments,
    },

    #[serde(rename = "get")]
    Get {
        #[serde(rename = "a")]
        arguments: GetArguments,
    },

    #[serde(rename = "put")]
    Put {
        #[serde(rename = "a")]
        arguments: PutArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindNodeArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub target: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetPeersArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(rename = "info_hash")]
    #[serde(with = "serde_bytes")]
    pub info_hash: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnnouncePeerArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(rename = "info_hash")]
    #[serde(with = "serde_bytes")]
    pub info_hash: Vec<u8>,
    pub port: u16,
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
    #[serde(default)]
    pub implied_port: Option<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub target: Vec<u8>,
    #[serde(default)]
    pub seq: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PutArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub v: Vec<u8>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub k: Option<Vec<u8>>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub sig: Option<Vec<u8>>,
    #[serde(default)]
    pub seq: Option<i64>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub salt: Option<Vec<u8>>,
    #[serde(default)]
    pub cas: Option<i64>,
}

// === Responses ===
//
// Untagged: order matters, most-to-least detailed, matching teacher's
// `DHTResponseSpecific` so a `get`/`put` reply isn't misparsed as a plain
// `find_node` reply.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ResponseSpecific {
    Get {
        #[serde(rename = "r")]
        arguments: GetResponseArguments,
    },
    GetPeers {
        #[serde(rename = "r")]
        arguments: GetPeersResponseArguments,
    },
    FindNode {
        #[serde(rename = "r")]
        arguments: FindNodeResponseArguments,
    },
    Ping {
        #[serde(rename = "r")]
        arguments: PingResponseArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingResponseArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindNodeResponseArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub nodes: Option<Vec<u8>>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub nodes6: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetPeersResponseArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub nodes: Option<Vec<u8>>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub nodes6: Option<Vec<u8>>,
    #[serde(default)]
    pub values: Option<Vec<serde_bytes::ByteBuf>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetResponseArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub nodes: Option<Vec<u8>>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub nodes6: Option<Vec<u8>>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub v: Option<Vec<u8>>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub k: Option<Vec<u8>>,
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub sig: Option<Vec<u8>>,
    #[serde(default)]
    pub seq: Option<i64>,
}

// === Errors ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorSpecific {
    #[serde(rename = "e")]
    pub error_info: Vec<BValue>,
}

impl ErrorSpecific {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            error_info: vec![
                BValue::Int(code as i64),
                BValue::Bytes(description.into().into_bytes()),
            ],
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self.error_info.first() {
            Some(BValue::Int(i)) => Some(*i as i32),
            _ => None,
        }
    }

    pub fn description(&self) -> String {
        match self.error_info.get(1) {
            Some(BValue::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
            _ => String::new(),
        }
    }
}

/// Standard KRPC/BEP44 error codes (spec.md §6).
pub mod error_code {
    pub const NOT_RESPONSIBLE: i32 = 201;
    pub const PROTOCOL_ERROR: i32 = 203;
    pub const UNKNOWN_QUERY: i32 = 204;
    pub const VALUE_TOO_BIG: i32 = 205;
    pub const INVALID_SIGNATURE: i32 = 206;
    pub const SALT_TOO_BIG: i32 = 207;
    pub const CAS_MISMATCH: i32 = 301;
    pub const SEQUENCE_NOT_UPDATED: i32 = 302;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ping_query_roundtrip() {
        let msg = Message {
            transaction_id: vec![1, 2],
            version: None,
            read_only: None,
            variant: MessageVariant::Query(QuerySpecific::Ping {
                arguments: PingArguments { id: vec![0u8; 20] },
            }),
        };

        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn error_roundtrip() {
        let msg = Message {
            transaction_id: vec![9],
            version: None,
            read_only: None,
            variant: MessageVariant::Error(ErrorSpecific::new(203, "bad argument")),
        };
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        if let MessageVariant::Error(e) = decoded.variant {
            assert_eq!(e.code(), Some(203));
            assert_eq!(e.description(), "bad argument");
        } else {
            panic!("expected error variant");
        }
    }

    #[test]
    fn malformed_bencoding_is_rejected() {
        let garbage = b"not bencoding at all";
        assert!(Message::from_bytes(garbage).is_err());
    }
}
