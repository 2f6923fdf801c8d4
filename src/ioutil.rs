use crate::error::Error;
use crate::memutil;

/// A reader that stores all bytes read from its inner reader. Used to keep
/// the exact header image while parsing it, so the image can be hashed and
/// re-written verbatim later.
pub struct StoredReadRef<'r, R: std::io::Read> {
    inner: &'r mut R,
    store: Vec<u8>,
}

impl<'r, R: std::io::Read> StoredReadRef<'r, R> {
    pub fn new(read: &'r mut R) -> StoredReadRef<'r, R> {
        StoredReadRef {
            inner: read,
            store: Vec::new(),
        }
    }

    pub fn data(self) -> Vec<u8> {
        self.store
    }
}

impl<'r, R: std::io::Read> std::io::Read for StoredReadRef<'r, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.inner.read(buf)?;
        self.store.extend_from_slice(&buf[0..bytes_read]);
        Ok(bytes_read)
    }
}

pub fn io_read_u8<R: std::io::Read>(input: &mut R) -> Result<u8, Error> {
    let mut dest = [0u8; 1];
    input.read_exact(&mut dest).map_err(Error::Io)?;
    Ok(dest[0])
}

/// Reads 2 bytes in little-endian order from a reader into a u16.
#[inline]
pub fn io_read_u16<R: std::io::Read>(input: &mut R) -> Result<u16, Error> {
    let mut dest = [0u8; 2];
    input.read_exact(&mut dest).map_err(Error::Io)?;
    Ok(memutil::bytes_to_u16(&dest))
}

/// Reads 4 bytes in little-endian order from a reader into a u32.
#[inline]
pub fn io_read_u32<R: std::io::Read>(input: &mut R) -> Result<u32, Error> {
    let mut dest = [0u8; 4];
    input.read_exact(&mut dest).map_err(Error::Io)?;
    Ok(memutil::bytes_to_u32(&dest))
}
