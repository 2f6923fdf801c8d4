use hmac::{Hmac, Mac};
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::Error;
use crate::memutil;

type HmacSha256 = Hmac<Sha256>;

/// Derive a key of arbitrary length from `src`. Up to 32 bytes this is a
/// truncated SHA-256, up to 64 a truncated SHA-512, and beyond that an
/// HMAC-SHA-256 counter expansion of the SHA-512 digest.
pub fn resize_key(src: &[u8], dst: &mut [u8]) -> Result<(), Error> {
    if dst.is_empty() {
        return Ok(());
    }

    if dst.len() <= 32 {
        let mut hasher = Sha256::new();
        hasher.input(src);
        dst.copy_from_slice(&hasher.result()[0..dst.len()]);
        return Ok(());
    }

    let mut hasher = Sha512::new();
    hasher.input(src);
    let hash_src = hasher.result();

    if dst.len() <= hash_src.len() {
        dst.copy_from_slice(&hash_src[0..dst.len()]);
        return Ok(());
    }

    let mut idx = 0usize;
    let mut counter = 0u64;
    while idx < dst.len() {
        let mut mac = HmacSha256::new_varkey(&hash_src)
            .map_err(|_| Error::Primitive("could not key HMAC-SHA256"))?;
        mac.input(&memutil::u64_to_bytes(counter));
        let part = mac.result().code();
        let copy_len = std::cmp::min(part.len(), dst.len() - idx);
        dst[idx..(idx + copy_len)].copy_from_slice(&part[0..copy_len]);
        idx += copy_len;
        counter += 1;
    }
    Ok(())
}
