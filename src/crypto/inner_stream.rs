//! The inner random stream: a keystream that masks protected values inside
//! the XML document so they are never plaintext in a loaded tree.
//!
//! Both sides of a session consume the keystream strictly in document
//! order, so the masked chunks only line up if they are processed in the
//! order they were produced. An empty value consumes no keystream.

use sha2::{Digest as _, Sha256};

use crate::error::Error;
use crate::memutil;

/// The fixed Salsa20 nonce KeePass uses for the inner stream.
const KEEPASS_SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Number of warm-up bytes the ArcFour variant discards after keying.
const ARCFOUR_DROP: usize = 512;

/// Algorithms supported by [`CryptoRandomStream`], identified by the
/// u32 stored in the header.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CrsAlgorithm {
    /// No masking. Only valid for plain-XML documents.
    None = 0,

    /// A variant of the ARCFour algorithm (RC4 incompatible).
    /// Insecure; for backward compatibility only.
    ArcFourVariant = 1,

    /// Salsa20 stream cipher algorithm.
    Salsa20 = 2,
}

impl CrsAlgorithm {
    pub fn from_int(n: u32) -> Option<CrsAlgorithm> {
        match n {
            0 => Some(CrsAlgorithm::None),
            1 => Some(CrsAlgorithm::ArcFourVariant),
            2 => Some(CrsAlgorithm::Salsa20),
            _ => None,
        }
    }

    pub fn to_int(self) -> u32 {
        self as u32
    }
}

/// Keystream generator for protected values. Masking and unmasking are the
/// same XOR; both advance the shared position.
pub struct CryptoRandomStream {
    inner: CrsInner,
}

enum CrsInner {
    Null,
    ArcFour(ArcFourVariant),
    Salsa20(Salsa20),
}

impl CryptoRandomStream {
    pub fn new(algorithm: CrsAlgorithm, key: &[u8]) -> Result<CryptoRandomStream, Error> {
        let inner = match algorithm {
            CrsAlgorithm::None => CrsInner::Null,
            CrsAlgorithm::ArcFourVariant => CrsInner::ArcFour(ArcFourVariant::new(key)?),
            CrsAlgorithm::Salsa20 => {
                let mut hasher = Sha256::new();
                hasher.input(key);
                let digest = hasher.result();
                let mut key32 = [0u8; 32];
                key32.copy_from_slice(&digest);
                let salsa = Salsa20::new(&key32, &KEEPASS_SALSA20_NONCE);
                memutil::zero_slice(&mut key32);
                CrsInner::Salsa20(salsa)
            }
        };
        Ok(CryptoRandomStream { inner })
    }

    pub fn algorithm(&self) -> CrsAlgorithm {
        match &self.inner {
            CrsInner::Null => CrsAlgorithm::None,
            CrsInner::ArcFour(_) => CrsAlgorithm::ArcFourVariant,
            CrsInner::Salsa20(_) => CrsAlgorithm::Salsa20,
        }
    }

    /// Overwrite `buf` with the next keystream bytes.
    pub fn get_random_bytes(&mut self, buf: &mut [u8]) {
        memutil::zero_slice(buf);
        self.process_in_place(buf);
    }

    /// XOR `data` with the next keystream bytes. Mask and unmask in one.
    pub fn process_in_place(&mut self, data: &mut [u8]) {
        match &mut self.inner {
            CrsInner::Null => {}
            CrsInner::ArcFour(arcfour) => arcfour.apply_keystream(data),
            CrsInner::Salsa20(salsa) => salsa.apply_keystream(data),
        }
    }
}

/// Salsa20 with the 64-bit nonce layout. Produces 64-byte blocks; a cursor
/// hands out the remainder of the current block before the next is computed.
struct Salsa20 {
    state: [u32; 16],
    block: [u8; 64],
    cursor: usize,
}

const SIGMA: [u32; 4] = [0x61707865, 0x3320646E, 0x79622D32, 0x6B206574];

fn quarter_round(x: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    x[b] ^= x[a].wrapping_add(x[d]).rotate_left(7);
    x[c] ^= x[b].wrapping_add(x[a]).rotate_left(9);
    x[d] ^= x[c].wrapping_add(x[b]).rotate_left(13);
    x[a] ^= x[d].wrapping_add(x[c]).rotate_left(18);
}

impl Salsa20 {
    fn new(key: &[u8; 32], nonce: &[u8; 8]) -> Salsa20 {
        Salsa20 {
            state: [
                SIGMA[0],
                memutil::bytes_to_u32(&key[0..]),
                memutil::bytes_to_u32(&key[4..]),
                memutil::bytes_to_u32(&key[8..]),
                memutil::bytes_to_u32(&key[12..]),
                SIGMA[1],
                memutil::bytes_to_u32(&nonce[0..]),
                memutil::bytes_to_u32(&nonce[4..]),
                0,
                0, // block counter
                SIGMA[2],
                memutil::bytes_to_u32(&key[16..]),
                memutil::bytes_to_u32(&key[20..]),
                memutil::bytes_to_u32(&key[24..]),
                memutil::bytes_to_u32(&key[28..]),
                SIGMA[3],
            ],
            block: [0u8; 64],
            cursor: 64, // start exhausted
        }
    }

    fn next_block(&mut self) {
        let mut working = self.state;
        for _ in 0..10 {
            quarter_round(&mut working, 0, 4, 8, 12);
            quarter_round(&mut working, 5, 9, 13, 1);
            quarter_round(&mut working, 10, 14, 2, 6);
            quarter_round(&mut working, 15, 3, 7, 11);
            quarter_round(&mut working, 0, 1, 2, 3);
            quarter_round(&mut working, 5, 6, 7, 4);
            quarter_round(&mut working, 10, 11, 8, 9);
            quarter_round(&mut working, 15, 12, 13, 14);
        }

        for (idx, word) in working.iter().enumerate() {
            let sum = word.wrapping_add(self.state[idx]);
            self.block[(idx * 4)..(idx * 4 + 4)].copy_from_slice(&sum.to_le_bytes());
        }
        memutil::zero_slice(&mut working);

        let (counter, overflow) = self.state[8].overflowing_add(1);
        self.state[8] = counter;
        if overflow {
            self.state[9] = self.state[9].wrapping_add(1);
        }
        self.cursor = 0;
    }

    fn apply_keystream(&mut self, data: &mut [u8]) {
        let mut offset = 0;
        while offset < data.len() {
            if self.cursor >= self.block.len() {
                self.next_block();
            }
            let count = std::cmp::min(data.len() - offset, self.block.len() - self.cursor);
            memutil::xor_slices(
                &mut data[offset..(offset + count)],
                &self.block[self.cursor..(self.cursor + count)],
            );
            self.cursor += count;
            offset += count;
        }
    }
}

impl Drop for Salsa20 {
    fn drop(&mut self) {
        memutil::zero_slice(&mut self.state);
        memutil::zero_slice(&mut self.block);
    }
}

/// The KeePass flavor of ARCFour: a standard RC4 key schedule and generator
/// with the first 512 keystream bytes thrown away.
struct ArcFourVariant {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl ArcFourVariant {
    fn new(key: &[u8]) -> Result<ArcFourVariant, Error> {
        if key.is_empty() {
            return Err(Error::Primitive("ArcFour key must not be empty"));
        }

        let mut state = [0u8; 256];
        for (idx, cell) in state.iter_mut().enumerate() {
            *cell = idx as u8;
        }

        let mut j = 0u8;
        for idx in 0..256 {
            j = j
                .wrapping_add(state[idx])
                .wrapping_add(key[idx % key.len()]);
            state.swap(idx, j as usize);
        }

        let mut this = ArcFourVariant { state, i: 0, j: 0 };
        let mut drop = [0u8; ARCFOUR_DROP];
        this.apply_keystream(&mut drop);
        memutil::zero_slice(&mut drop);
        Ok(this)
    }

    fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let t = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
            *byte ^= self.state[t as usize];
        }
    }
}

impl Drop for ArcFourVariant {
    fn drop(&mut self) {
        memutil::zero_slice(&mut self.state);
    }
}
