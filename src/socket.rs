//! Rate-limited UDP transport, ported from
//! `original_source/src/bittorrent/udp_multiplexer.h`.
//!
//! The original multiplexes several logical senders over one socket and
//! throttles outgoing bytes against a ceiling shared by all of them. Here
//! that's a single [Socket] per [crate::dht_node::DhtNode], since each
//! engine already owns exactly one UDP endpoint.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::trace;

use crate::rate_counter::RateCounter;

/// Outgoing bandwidth ceiling, matching the original's default.
pub const DEFAULT_RATE_LIMIT_BYTES_PER_SEC: f32 = 500_000.0 / 8.0;

/// A UDP socket with an outgoing byte-rate ceiling.
pub struct Socket {
    inner: UdpSocket,
    rate_limit: f32,
    send_rate: Mutex<RateCounter>,
}

impl Socket {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(addr).await?;
        Ok(Self {
            inner,
            rate_limit: DEFAULT_RATE_LIMIT_BYTES_PER_SEC,
            send_rate: Mutex::new(RateCounter::new()),
        })
    }

    pub fn with_rate_limit(mut self, bytes_per_sec: f32) -> Self {
        self.rate_limit = bytes_per_sec;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// True if sending `len` more bytes right now would exceed the ceiling.
    /// Callers use this to defer low-priority traffic (token refreshes,
    /// opportunistic announces) without dropping higher-priority queries.
    pub fn would_exceed_rate(&self, len: usize) -> bool {
        self.send_rate.lock().unwrap().rate() + len as f32 > self.rate_limit
    }

    /// Send `buf`, then, if this pushed the outgoing rate over the ceiling,
    /// sleep `(ratio - 1)` seconds before returning — so the next queued
    /// datagram on this socket waits out the overage rather than piling on
    /// (spec.md §4.1).
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let n = self.inner.send_to(buf, target).await?;
        let ratio = {
            let mut rate = self.send_rate.lock().unwrap();
            rate.update(n as f32);
            rate.rate() / self.rate_limit
        };
        trace!(?target, bytes = n, "sent datagram");
        if ratio > 1.0 {
            tokio::time::sleep(Duration::from_secs_f32(ratio - 1.0)).await;
        }
        Ok(n)
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn bind_and_exchange() {
        let a = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let a_addr = a.local_addr().unwrap();
        b.send_to(b"hello", a_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _from) = a.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn rate_limit_trips_after_heavy_send() {
        let a = Socket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .with_rate_limit(10.0);
        let b_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let _ = a.send_to(&[0u8; 1000], b_addr).await;
        assert!(a.would_exceed_rate(1));
    }
}
