//! The KDBX 3 key transformation: iterated AES-256-ECB as a work factor.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockCipher as _, NewBlockCipher as _};
use aes::Aes256;
use sha2::{Digest as _, Sha256};

use crate::error::Error;
use crate::memutil;
use crate::security::SafeBytes;

/// Encrypt `composite` with the seed-keyed cipher `rounds` times and hash
/// the result. The two 16-byte halves are independent ECB lanes, so they run
/// on separate threads and the transform overlaps a second core.
pub fn transform_key(composite: &[u8], seed: &[u8], rounds: u64) -> Result<SafeBytes, Error> {
    if composite.len() != 32 {
        return Err(Error::Generic("composite key must be 32 bytes"));
    }
    if seed.len() != 32 {
        return Err(Error::Generic("transform seed must be 32 bytes"));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(composite);

    let worker_result = {
        let (lower, upper) = key.split_at_mut(16);
        std::thread::scope(|scope| {
            let worker = scope.spawn(|| transform_half(upper, seed, rounds));
            transform_half(lower, seed, rounds);
            worker.join()
        })
    };
    if worker_result.is_err() {
        memutil::zero_slice(&mut key);
        return Err(Error::Primitive("key transform worker failed"));
    }

    let mut hasher = Sha256::new();
    hasher.input(&key[..]);
    let transformed = SafeBytes::from_slice(&hasher.result());
    memutil::zero_slice(&mut key);
    transformed
}

fn transform_half(half: &mut [u8], seed: &[u8], rounds: u64) {
    debug_assert!(half.len() == 16);
    let cipher = Aes256::new(GenericArray::from_slice(seed));
    let block = GenericArray::from_mut_slice(half);
    for _ in 0..rounds {
        cipher.encrypt_block(block);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// One AES-256 round over a reference block, to catch a miswired cipher.
    #[test]
    fn single_round_matches_reference() {
        let seed = [0u8; 32];
        let reference: [u8; 16] = [
            0x75, 0xD1, 0x1B, 0x0E, 0x3A, 0x68, 0xC4, 0x22,
            0x3D, 0x88, 0xDB, 0xF0, 0x17, 0x97, 0x7D, 0xD7,
        ];

        let mut half = [0u8; 16];
        half[0] = 0x04;
        transform_half(&mut half, &seed, 1);
        assert_eq!(half, reference);
    }

    /// The threaded transform must equal a serial one for any round count.
    #[test]
    fn parallel_halves_match_serial_reference() {
        let composite: Vec<u8> = (0u8..32).collect();
        let seed = [0x01u8; 32];
        let rounds = 6000;

        let transformed = transform_key(&composite, &seed, rounds).unwrap();

        let serial = {
            let mut key = [0u8; 32];
            key.copy_from_slice(&composite);
            for chunk in key.chunks_mut(16) {
                transform_half(chunk, &seed, rounds);
            }
            let mut hasher = Sha256::new();
            hasher.input(&key[..]);
            hasher.result()
        };

        assert_eq!(transformed.as_slice(), &serial[..]);
    }

    #[test]
    fn transform_is_deterministic() {
        let composite: Vec<u8> = (0u8..32).collect();
        let seed = [0x01u8; 32];

        let first = transform_key(&composite, &seed, 6000).unwrap();
        let second = transform_key(&composite, &seed, 6000).unwrap();
        assert_eq!(first, second);

        let different_rounds = transform_key(&composite, &seed, 6001).unwrap();
        assert_ne!(first, different_rounds);
    }

    #[test]
    fn zero_rounds_is_just_the_hash() {
        let composite = [0xABu8; 32];
        let seed = [0xCDu8; 32];

        let transformed = transform_key(&composite, &seed, 0).unwrap();

        let mut hasher = Sha256::new();
        hasher.input(&composite[..]);
        assert_eq!(transformed.as_slice(), &hasher.result()[..]);
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(transform_key(&[0u8; 31], &[0u8; 32], 1).is_err());
        assert!(transform_key(&[0u8; 32], &[0u8; 16], 1).is_err());
    }
}
