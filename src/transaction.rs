//! Transaction id allocation and in-flight query correlation, grounded on
//! `examples/Thoxy67-mainline/src/dht.rs`'s `next_transaction_id` counter
//! and request map, generalized to the async engine with `tokio::sync`
//! oneshot replies instead of the teacher's synchronous callback slots.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::messages::Message;

/// Monotonically-increasing 16-bit transaction id generator. Wraps at
/// `u16::MAX`, matching BEP5's 2-byte `t` field.
#[derive(Default)]
pub struct TransactionIdAllocator(AtomicU16);

impl TransactionIdAllocator {
    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

struct Pending {
    reply: oneshot::Sender<Message>,
    to: SocketAddr,
}

/// Correlates outgoing queries with their eventual reply, by `(to, transaction_id)`.
#[derive(Default)]
pub struct TransactionTable {
    pending: Mutex<HashMap<(SocketAddr, u16), Pending>>,
}

impl TransactionTable {
    pub fn register(&self, to: SocketAddr, transaction_id: u16) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert((to, transaction_id), Pending { reply: tx, to });
        rx
    }

    /// Resolve a pending query if `message` is a reply/error matching `from`
    /// and the transaction id encoded in its `t` field. Returns false if no
    /// such transaction is outstanding (spurious or duplicate reply).
    pub fn resolve(&self, from: SocketAddr, message: Message) -> bool {
        let Some(transaction_id) = transaction_id_of(&message.transaction_id) else {
            return false;
        };

        let pending = self.pending.lock().unwrap().remove(&(from, transaction_id));
        match pending {
            Some(p) if p.to == from => {
                let _ = p.reply.send(message);
                true
            }
            Some(p) => {
                // Put it back; this datagram came from the wrong address.
                self.pending
                    .lock()
                    .unwrap()
                    .insert((p.to, transaction_id), p);
                false
            }
            None => false,
        }
    }

    pub fn cancel(&self, to: SocketAddr, transaction_id: u16) {
        self.pending.lock().unwrap().remove(&(to, transaction_id));
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn transaction_id_of(bytes: &[u8]) -> Option<u16> {
    match bytes.len() {
        1 => Some(bytes[0] as u16),
        2 => Some(u16::from_be_bytes([bytes[0], bytes[1]])),
        _ => None,
    }
}

pub fn encode_transaction_id(id: u16) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::{MessageVariant, PingResponseArguments, ResponseSpecific};

    fn reply(transaction_id: u16) -> Message {
        Message {
            transaction_id: encode_transaction_id(transaction_id),
            version: None,
            read_only: None,
            variant: MessageVariant::Response(ResponseSpecific::Ping {
                arguments: PingResponseArguments { id: vec![0u8; 20] },
            }),
        }
    }

    #[tokio::test]
    async fn register_then_resolve_delivers_reply() {
        let table = TransactionTable::default();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let rx = table.register(addr, 7);

        assert!(table.resolve(addr, reply(7)));
        let got = rx.await.unwrap();
        assert_eq!(got.transaction_id, encode_transaction_id(7));
    }

    #[test]
    fn resolve_from_wrong_address_is_rejected() {
        let table = TransactionTable::default();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let _rx = table.register(addr, 3);

        assert!(!table.resolve(other, reply(3)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unknown_transaction_is_ignored() {
        let table = TransactionTable::default();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        assert!(!table.resolve(addr, reply(42)));
    }
}
