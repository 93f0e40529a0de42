//! Rotating-secret tokens handed out with `get_peers`/`get` and required
//! back on `announce_peer`/`put`, per spec.md §3/§4.4.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use sha1_smol::Sha1;

use crate::id::Id;

const ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Issues and verifies tokens bound to `(peer_ip, target)`, valid for the
/// current and previous 5-minute secret epoch.
pub struct TokenManager {
    current_secret: [u8; 20],
    previous_secret: [u8; 20],
    rotated_at: Instant,
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            current_secret: random_secret(),
            previous_secret: random_secret(),
            rotated_at: Instant::now(),
        }
    }

    /// Rotate the secret if the rotation interval has elapsed. Called from
    /// the owning node's periodic tick.
    pub fn maybe_rotate(&mut self) {
        if self.rotated_at.elapsed() >= ROTATE_INTERVAL {
            self.previous_secret = self.current_secret;
            self.current_secret = random_secret();
            self.rotated_at = Instant::now();
        }
    }

    pub fn generate(&self, peer_ip: IpAddr, target: Id) -> Vec<u8> {
        Self::compute(&self.current_secret, peer_ip, target)
    }

    pub fn verify(&self, peer_ip: IpAddr, target: Id, token: &[u8]) -> bool {
        token == Self::compute(&self.current_secret, peer_ip, target).as_slice()
            || token == Self::compute(&self.previous_secret, peer_ip, target).as_slice()
    }

    fn compute(secret: &[u8; 20], peer_ip: IpAddr, target: Id) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        match peer_ip {
            IpAddr::V4(ip) => hasher.update(&ip.octets()),
            IpAddr::V6(ip) => hasher.update(&ip.octets()),
        }
        hasher.update(target.as_bytes());
        hasher.digest().bytes()[..8].to_vec()
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> [u8; 20] {
    let mut bytes = [0u8; 20];
    getrandom::getrandom(&mut bytes).expect("getrandom should not fail");
    bytes
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn token_authenticity() {
        let mgr = TokenManager::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let target = Id::random();

        let token = mgr.generate(ip, target);
        assert!(mgr.verify(ip, target, &token));

        let other_ip: IpAddr = "198.51.100.9".parse().unwrap();
        assert!(!mgr.verify(other_ip, target, &token));
    }

    #[test]
    fn token_survives_one_rotation() {
        let mut mgr = TokenManager::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let target = Id::random();

        let token = mgr.generate(ip, target);

        // Force a rotation.
        mgr.rotated_at = Instant::now() - ROTATE_INTERVAL - Duration::from_secs(1);
        mgr.maybe_rotate();

        assert!(mgr.verify(ip, target, &token));

        // A second rotation should finally invalidate it.
        mgr.rotated_at = Instant::now() - ROTATE_INTERVAL - Duration::from_secs(1);
        mgr.maybe_rotate();

        assert!(!mgr.verify(ip, target, &token));
    }
}
