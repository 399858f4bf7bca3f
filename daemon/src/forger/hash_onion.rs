use atoll_common::crypto::{hash, HASH_SIZE};
use zeroize::{Zeroize, ZeroizeOnDrop};

// Reverse hash chain used once per forged block to prove
// non-double-forging: h_0 is the secret seed, h_{i+1} = H(h_i), and the
// chain tip h_count is public. Forging in round r reveals the pre-image
// h_{count - r}; observers check H(reveal_r) == reveal_{r-1}. Revealing
// the same layer twice would prove a double forge, so the consumed index
// is persisted before any signature is produced.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HashOnion {
    seed: [u8; HASH_SIZE],
    #[zeroize(skip)]
    count: u64,
}

impl HashOnion {
    pub fn new(seed: [u8; HASH_SIZE], count: u64) -> Self {
        Self { seed, count }
    }

    pub fn get_count(&self) -> u64 {
        self.count
    }

    // Layer h_index, counted from the seed
    fn layer(&self, index: u64) -> [u8; HASH_SIZE] {
        let mut current = self.seed;
        for _ in 0..index {
            current = hash(&current).to_bytes();
        }
        current
    }

    // Pre-image revealed when forging in `round`; None once the chain
    // is exhausted. Rounds are 1-based.
    pub fn reveal_for_round(&self, round: u64) -> Option<[u8; HASH_SIZE]> {
        if round == 0 || round > self.count {
            return None;
        }

        Some(self.layer(self.count - round))
    }

    // Public tip of the chain, h_count
    pub fn public_tip(&self) -> [u8; HASH_SIZE] {
        self.layer(self.count)
    }
}

// Chain check between two consecutive reveals
pub fn verify_reveal(previous_reveal: &[u8; HASH_SIZE], reveal: &[u8; HASH_SIZE]) -> bool {
    hash(reveal).to_bytes() == *previous_reveal
}
