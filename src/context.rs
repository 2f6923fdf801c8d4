//! Process-wide random source.
//!
//! All random material (seeds, IVs, inner keys) comes from a single
//! entropy-mixed generator: each request hashes a private pool together with
//! a counter and fresh OS randomness. Random values read from database
//! headers are folded back into the pool as extra entropy.

use rand::prelude::*;
use sha2::{Digest as _, Sha256};
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::memutil;

/// Globals shared by every load/store session in the process.
pub struct Context {
    crypto_random: Mutex<CryptoRandom>,
}

impl Context {
    pub fn global() -> &'static Context {
        static CONTEXT: OnceLock<Context> = OnceLock::new();
        CONTEXT.get_or_init(|| Context {
            crypto_random: Mutex::new(CryptoRandom::new()),
        })
    }

    fn random(&self) -> MutexGuard<CryptoRandom> {
        // A poisoned pool is still a valid pool; the panic that poisoned it
        // cannot have left the state half-written in a way that matters here.
        match self.crypto_random.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fill `buf` with cryptographically strong random bytes.
    pub fn fill_random(&self, buf: &mut [u8]) {
        self.random().get_random_bytes(buf);
    }

    /// Mix additional entropy into the pool.
    pub fn add_entropy(&self, entropy: &[u8]) {
        self.random().add_entropy(entropy);
    }
}

struct CryptoRandom {
    entropy_pool: [u8; 32],
    counter: u64,
}

impl CryptoRandom {
    fn new() -> CryptoRandom {
        let mut seed = [0u8; 64];
        rand::thread_rng().fill(&mut seed[..]);

        let mut hasher = Sha256::new();
        hasher.input(&seed[..]);

        let mut entropy_pool = [0u8; 32];
        entropy_pool.copy_from_slice(&hasher.result());
        memutil::zero_slice(&mut seed);

        CryptoRandom {
            entropy_pool,
            counter: 0,
        }
    }

    fn add_entropy(&mut self, entropy: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.input(&self.entropy_pool);
        hasher.input(entropy);
        self.entropy_pool.copy_from_slice(&hasher.result());
    }

    fn generate_random_256(&mut self) -> [u8; 32] {
        self.counter = self.counter.wrapping_add(0x74D8_B29E_4D38_E161);

        let mut csp = [0u8; 32];
        rand::thread_rng().fill(&mut csp[..]);

        let mut hasher = Sha256::new();
        hasher.input(&self.entropy_pool);
        hasher.input(&memutil::u64_to_bytes(self.counter));
        hasher.input(&csp);
        memutil::zero_slice(&mut csp);

        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.result());
        out
    }

    fn get_random_bytes(&mut self, buf: &mut [u8]) {
        let mut offset = 0;
        while offset < buf.len() {
            let mut random256 = self.generate_random_256();
            let count = std::cmp::min(buf.len() - offset, random256.len());
            buf[offset..(offset + count)].copy_from_slice(&random256[0..count]);
            memutil::zero_slice(&mut random256);
            offset += count;
        }
    }
}

impl Drop for CryptoRandom {
    fn drop(&mut self) {
        memutil::zero_slice(&mut self.entropy_pool);
    }
}
