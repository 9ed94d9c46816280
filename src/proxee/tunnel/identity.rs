use rand::{RngExt, SeedableRng, rng, rngs::StdRng};

/// Identity this node advertises to the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    id: String,
}

impl PeerIdentity {
    /// Random identity from the thread RNG.
    pub fn generate() -> Self {
        Self::from_bytes(rng().random())
    }

    /// Same seed, same identity. Only for debugging: anyone who knows the seed
    /// can reproduce it.
    pub fn deterministic(seed: u64) -> Self {
        Self::from_bytes(StdRng::seed_from_u64(seed).random())
    }

    fn from_bytes(bytes: [u8; 32]) -> Self {
        let mut id = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            id.push_str(&format!("{b:02x}"));
        }
        Self { id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}
