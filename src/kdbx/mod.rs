//! The KDBX 3 container format: header codec and load/store orchestration.

pub mod header;
pub mod read;
pub mod write;
pub mod xml;

use crate::crypto::cipher;
use crate::cryptoutil;
use crate::error::Error;
use crate::keys::CompositeKey;
use crate::memutil;
use crate::security::SafeBytes;

/// File identifier for KeePass 2.x databases.
pub(crate) const FILE_SIGNATURE: (u32, u32) = (0x9AA2D903, 0xB54BFB67);
/// KeePass 2.x pre-release (alpha and beta) signature. Accepted when reading.
pub(crate) const FILE_SIGNATURE_PRE_RELEASE: (u32, u32) = (0x9AA2D903, 0xB54BFB66);
/// KeePass 1.x signature. A different format entirely.
pub(crate) const FILE_SIGNATURE_OLD: (u32, u32) = (0x9AA2D903, 0xB54BFB65);

/// Version written by this crate: format 3.1.
pub(crate) const FILE_VERSION_32_3: u32 = 0x0003_0001;
/// The upper 16 bits are critical; loading fails if they are too high.
pub(crate) const FILE_VERSION_CRITICAL_MASK: u32 = 0xFFFF_0000;

/// Outer header field ids, in the TLV order this crate writes them.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum HeaderFieldId {
    EndOfHeader = 0,
    Comment = 1,
    CipherId = 2,
    CompressionFlags = 3,
    MasterSeed = 4,
    TransformSeed = 5,
    TransformRounds = 6,
    EncryptionIv = 7,
    InnerRandomStreamKey = 8,
    StreamStartBytes = 9,
    InnerRandomStreamId = 10,
}

impl HeaderFieldId {
    pub fn from_u8(id: u8) -> Option<HeaderFieldId> {
        match id {
            0 => Some(HeaderFieldId::EndOfHeader),
            1 => Some(HeaderFieldId::Comment),
            2 => Some(HeaderFieldId::CipherId),
            3 => Some(HeaderFieldId::CompressionFlags),
            4 => Some(HeaderFieldId::MasterSeed),
            5 => Some(HeaderFieldId::TransformSeed),
            6 => Some(HeaderFieldId::TransformRounds),
            7 => Some(HeaderFieldId::EncryptionIv),
            8 => Some(HeaderFieldId::InnerRandomStreamKey),
            9 => Some(HeaderFieldId::StreamStartBytes),
            10 => Some(HeaderFieldId::InnerRandomStreamId),
            _ => None,
        }
    }
}

/// A 16-byte identifier as stored in KDBX headers.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PwUUID([u8; PwUUID::SIZE]);

impl PwUUID {
    pub const SIZE: usize = 16;

    pub const fn wrap(data: [u8; PwUUID::SIZE]) -> PwUUID {
        PwUUID(data)
    }

    pub fn from_slice(data: &[u8]) -> PwUUID {
        debug_assert!(data.len() == PwUUID::SIZE);
        let mut uuid = PwUUID::zero();
        uuid.0.copy_from_slice(data);
        uuid
    }

    pub const fn zero() -> PwUUID {
        PwUUID([0u8; PwUUID::SIZE])
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for PwUUID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", memutil::to_hex_string(&self.0))
    }
}

impl std::fmt::Debug for PwUUID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "PwUUID({})", self)
    }
}

/// Compression applied to the plaintext before framing.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PwCompressionAlgorithm {
    None = 0,
    GZip = 1,
}

impl PwCompressionAlgorithm {
    pub fn from_int(n: u32) -> Option<PwCompressionAlgorithm> {
        match n {
            0 => Some(PwCompressionAlgorithm::None),
            1 => Some(PwCompressionAlgorithm::GZip),
            _ => None,
        }
    }

    pub fn to_int(self) -> u32 {
        self as u32
    }
}

/// The outer cipher key: transform the composite key with the header's seed
/// and rounds, then stretch SHA-256(master seed || transformed key) to the
/// engine's key length.
pub(crate) fn derive_cipher_key(
    header: &header::KdbxHeader,
    key: &mut CompositeKey,
    key_len: usize,
) -> Result<SafeBytes, Error> {
    let transformed = key.generate_key_32(&header.transform_seed, header.transform_rounds)?;

    let mut concat = SafeBytes::with_capacity(header.master_seed.len() + transformed.len())?;
    concat.extend_from_slice(&header.master_seed)?;
    concat.extend_from_slice(&transformed)?;

    let mut cipher_key = SafeBytes::zeroed(key_len)?;
    cryptoutil::resize_key(&concat, cipher_key.as_mut_slice())?;
    Ok(cipher_key)
}

/// The engine for a header's cipher UUID. Headers are validated at parse
/// time, so a miss here means the header was built by hand with a bad UUID.
pub(crate) fn cipher_engine_for(
    header: &header::KdbxHeader,
) -> Result<&'static dyn cipher::CipherEngine, Error> {
    cipher::get_cipher_engine(&header.cipher_uuid)
        .ok_or(Error::MalformedHeader("no engine for the cipher UUID"))
}
