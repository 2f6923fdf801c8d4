//! Secret-holding byte containers.
//!
//! Everything that transits the pipeline or holds key material lives in a
//! [`SafeBytes`]: its backing memory is zeroed with volatile writes before it
//! is returned to the allocator, and the allocation is (best effort) locked
//! against paging. Growth never reallocates in place; a fresh region is
//! allocated, the contents copied, and the old region scrubbed.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;
use crate::memutil;

static PAGE_LOCK_WARNED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
fn lock_region(ptr: *const u8, len: usize) -> bool {
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(unix)]
fn unlock_region(ptr: *const u8, len: usize) {
    unsafe {
        libc::munlock(ptr as *const libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn lock_region(_ptr: *const u8, _len: usize) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_region(_ptr: *const u8, _len: usize) {}

/// Attempt to pin an allocation into physical memory. Failure is non-fatal;
/// it is reported once per process to keep logs quiet under mlock rlimits.
fn try_lock(ptr: *const u8, len: usize) -> bool {
    if len == 0 {
        return false;
    }
    let locked = lock_region(ptr, len);
    if !locked && !PAGE_LOCK_WARNED.swap(true, Ordering::Relaxed) {
        log::warn!(
            "could not lock {} bytes of secret memory against paging; continuing unlocked",
            len
        );
    }
    locked
}

/// Volatile-zero the full capacity of a vector, unlock it, and leave it empty.
fn scrub_vec(buf: &mut Vec<u8>, locked: bool) {
    let cap = buf.capacity();
    if cap > 0 {
        unsafe {
            memutil::ptr_write_bytes_volatile(buf.as_mut_ptr(), 0, cap);
        }
        if locked {
            unlock_region(buf.as_ptr(), cap);
        }
    }
    buf.clear();
}

/// A byte buffer that is zeroed when released.
pub struct SafeBytes {
    buf: Vec<u8>,
    locked: bool,
}

impl SafeBytes {
    /// An empty buffer. Allocates nothing.
    pub fn new() -> SafeBytes {
        SafeBytes {
            buf: Vec::new(),
            locked: false,
        }
    }

    /// A buffer that can hold `cap` bytes without growing.
    pub fn with_capacity(cap: usize) -> Result<SafeBytes, Error> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(cap).map_err(|_| Error::OutOfMemory)?;
        let locked = try_lock(buf.as_ptr(), buf.capacity());
        Ok(SafeBytes { buf, locked })
    }

    /// A buffer of `len` zero bytes.
    pub fn zeroed(len: usize) -> Result<SafeBytes, Error> {
        let mut this = SafeBytes::with_capacity(len)?;
        this.buf.resize(len, 0);
        Ok(this)
    }

    /// A buffer holding a copy of `src`.
    pub fn from_slice(src: &[u8]) -> Result<SafeBytes, Error> {
        let mut this = SafeBytes::with_capacity(src.len())?;
        this.buf.extend_from_slice(src);
        Ok(this)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Append bytes, growing through a scrubbed reallocation if needed.
    pub fn extend_from_slice(&mut self, src: &[u8]) -> Result<(), Error> {
        let needed = self.buf.len() + src.len();
        if needed > self.buf.capacity() {
            self.grow(needed)?;
        }
        self.buf.extend_from_slice(src);
        Ok(())
    }

    /// Append `len` zero bytes.
    pub fn extend_zeroed(&mut self, len: usize) -> Result<(), Error> {
        let needed = self.buf.len() + len;
        if needed > self.buf.capacity() {
            self.grow(needed)?;
        }
        self.buf.resize(needed, 0);
        Ok(())
    }

    /// Shorten to `len` bytes, zeroing the cut-off tail.
    pub fn truncate(&mut self, len: usize) {
        if len < self.buf.len() {
            memutil::zero_slice(&mut self.buf[len..]);
            self.buf.truncate(len);
        }
    }

    /// Drop the first `n` bytes, shifting the remainder to the front. The
    /// vacated tail is zeroed.
    pub fn consume_front(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len(), "consume past end of buffer");
        let n = std::cmp::min(n, self.buf.len());
        let remaining = self.buf.len() - n;
        self.buf.copy_within(n.., 0);
        self.truncate(remaining);
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }

    pub fn try_clone(&self) -> Result<SafeBytes, Error> {
        SafeBytes::from_slice(&self.buf)
    }

    /// Never a plain `Vec` reallocation: live secret bytes would survive in
    /// the abandoned region. Allocate fresh, copy, scrub the old region.
    fn grow(&mut self, needed: usize) -> Result<(), Error> {
        let new_cap = std::cmp::max(needed, self.buf.capacity().saturating_mul(2));
        let mut next = Vec::new();
        next.try_reserve_exact(new_cap).map_err(|_| Error::OutOfMemory)?;
        let next_locked = try_lock(next.as_ptr(), next.capacity());
        next.extend_from_slice(&self.buf);

        let mut old = std::mem::replace(&mut self.buf, next);
        scrub_vec(&mut old, self.locked);
        self.locked = next_locked;
        Ok(())
    }
}

impl Drop for SafeBytes {
    fn drop(&mut self) {
        scrub_vec(&mut self.buf, self.locked);
    }
}

impl Default for SafeBytes {
    fn default() -> SafeBytes {
        SafeBytes::new()
    }
}

impl std::ops::Deref for SafeBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for SafeBytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl std::convert::AsRef<[u8]> for SafeBytes {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl PartialEq for SafeBytes {
    fn eq(&self, other: &SafeBytes) -> bool {
        self.buf == other.buf
    }
}

impl Eq for SafeBytes {}

impl std::fmt::Debug for SafeBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SafeBytes({} bytes)", self.buf.len())
    }
}

/// A value stored with a xor pad applied, followed by the pad itself. The
/// plaintext exists only in buffers the caller provides, so a memory dump of
/// a loaded database does not expose protected field values.
pub struct XorredBuffer {
    /// Masked data in the first half, pad in the second. Equal lengths.
    data: SafeBytes,
}

impl XorredBuffer {
    /// Pair masked bytes with the pad that unmasks them.
    pub fn new(masked: &[u8], xor_pad: &[u8]) -> Result<XorredBuffer, Error> {
        if masked.len() != xor_pad.len() {
            return Err(Error::Generic("xor pad length must match the data length"));
        }
        let mut data = SafeBytes::with_capacity(masked.len() * 2)?;
        data.extend_from_slice(masked)?;
        data.extend_from_slice(xor_pad)?;
        Ok(XorredBuffer { data })
    }

    /// Wrap an already interleaved buffer (data then pad, equal halves).
    pub fn wrap(data: SafeBytes) -> Result<XorredBuffer, Error> {
        if data.len() % 2 != 0 {
            return Err(Error::Generic("xorred buffer length must be even"));
        }
        Ok(XorredBuffer { data })
    }

    /// Length of the protected value.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / 2
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write the plaintext into `dest`, which must have exactly `len` bytes.
    pub fn plaintext(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() != self.len() {
            return Err(Error::Generic("destination length must match the value length"));
        }
        let masked = &self.data[0..self.len()];
        let pad = &self.data[self.len()..];
        for (idx, out) in dest.iter_mut().enumerate() {
            *out = masked[idx] ^ pad[idx];
        }
        Ok(())
    }

    /// The plaintext in a fresh scrubbed buffer.
    pub fn reveal(&self) -> Result<SafeBytes, Error> {
        let mut out = SafeBytes::zeroed(self.len())?;
        self.plaintext(out.as_mut_slice())?;
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extend_and_grow_preserve_contents() {
        let mut bytes = SafeBytes::with_capacity(4).unwrap();
        bytes.extend_from_slice(&[1, 2, 3, 4]).unwrap();
        bytes.extend_from_slice(&[5, 6, 7, 8, 9]).unwrap();
        assert_eq!(bytes.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn truncate_zeroes_tail() {
        let mut bytes = SafeBytes::from_slice(&[0xAA; 8]).unwrap();
        bytes.truncate(3);
        assert_eq!(bytes.len(), 3);
        assert_eq!(bytes.as_slice(), &[0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn consume_front_shifts_remainder() {
        let mut bytes = SafeBytes::from_slice(&[1, 2, 3, 4, 5]).unwrap();
        bytes.consume_front(2);
        assert_eq!(bytes.as_slice(), &[3, 4, 5]);
        bytes.consume_front(3);
        assert!(bytes.is_empty());
    }

    #[test]
    fn xorred_buffer_round_trip() {
        let pad = [0x5A, 0xC3, 0x99];
        let plain = b"abc";
        let masked: Vec<u8> = plain.iter().zip(pad.iter()).map(|(p, x)| p ^ x).collect();

        let buffer = XorredBuffer::new(&masked, &pad).unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.reveal().unwrap().as_slice(), b"abc");
    }

    #[test]
    fn xorred_buffer_rejects_odd_wrap() {
        let data = SafeBytes::from_slice(&[1, 2, 3]).unwrap();
        assert!(XorredBuffer::wrap(data).is_err());
    }
}
