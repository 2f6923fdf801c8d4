//! The KDBX 3 outer header: signature, version and the TLV field block.
//!
//! Parsing keeps the exact byte image of the header. KDBX 3 stores the
//! SHA-256 of that image inside the encrypted XML (`<Meta><HeaderHash>`), so
//! the image must be preserved bit for bit to re-verify or re-write it.
//! Re-writing a parsed header reproduces the image verbatim, which also
//! preserves the TLV field order the file used; headers built fresh are
//! written in ascending field id order.

use sha2::{Digest as _, Sha256};
use std::io::Read;

use crate::constants;
use crate::context::Context;
use crate::crypto::cipher::{self, StandardAesEngine};
use crate::crypto::inner_stream::{CrsAlgorithm, CryptoRandomStream};
use crate::error::Error;
use crate::ioutil::{self, StoredReadRef};
use crate::memutil;
use crate::security::SafeBytes;

use super::*;

/// Value of the end-of-header field, matching what KeePass writes.
const END_OF_HEADER_VALUE: &[u8] = b"\r\n\r\n";

/// A complete, validated outer header.
pub struct KdbxHeader {
    pub(crate) signature: (u32, u32),
    pub(crate) version: u32,
    pub(crate) cipher_uuid: PwUUID,
    pub(crate) compression: PwCompressionAlgorithm,
    pub(crate) master_seed: SafeBytes,
    pub(crate) transform_seed: SafeBytes,
    pub(crate) transform_rounds: u64,
    pub(crate) encryption_iv: SafeBytes,
    pub(crate) inner_stream_key: SafeBytes,
    pub(crate) stream_start_bytes: SafeBytes,
    pub(crate) inner_stream_algorithm: CrsAlgorithm,
    /// The serialized header, exactly as read or as first written.
    image: Vec<u8>,
}

impl KdbxHeader {
    /// Parse a header from the start of a KDBX stream. On success the
    /// stream is positioned at the first ciphertext byte.
    pub fn read<R: Read>(input: &mut R) -> Result<KdbxHeader, Error> {
        let mut stored = StoredReadRef::new(input);
        let builder = parse_header(&mut stored)?;
        let image = stored.data();
        builder.finish(image)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn compression(&self) -> PwCompressionAlgorithm {
        self.compression
    }

    pub fn cipher_uuid(&self) -> PwUUID {
        self.cipher_uuid
    }

    pub fn transform_rounds(&self) -> u64 {
        self.transform_rounds
    }

    pub fn inner_stream_algorithm(&self) -> CrsAlgorithm {
        self.inner_stream_algorithm
    }

    /// The serialized header image.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// SHA-256 of the header image, for the `<HeaderHash>` cross-check.
    pub fn header_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.input(&self.image);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hasher.result());
        hash
    }

    /// The keystream cipher for this database's protected values.
    pub fn create_inner_stream(&self) -> Result<CryptoRandomStream, Error> {
        CryptoRandomStream::new(self.inner_stream_algorithm, &self.inner_stream_key)
    }
}

impl std::fmt::Debug for KdbxHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("KdbxHeader")
            .field("version", &format_args!("0x{:08X}", self.version))
            .field("compression", &self.compression)
            .field("transform_rounds", &self.transform_rounds)
            .field("inner_stream_algorithm", &self.inner_stream_algorithm)
            .finish()
    }
}

/// Builder for headers, used both by the parser and by callers preparing a
/// store. Fields left unset before [`KdbxHeaderBuilder::complete`] are
/// filled with fresh random values.
pub struct KdbxHeaderBuilder {
    cipher_uuid: PwUUID,
    compression: PwCompressionAlgorithm,
    master_seed: Option<SafeBytes>,
    transform_seed: Option<SafeBytes>,
    transform_rounds: u64,
    encryption_iv: Option<SafeBytes>,
    inner_stream_key: Option<SafeBytes>,
    stream_start_bytes: Option<SafeBytes>,
    inner_stream_algorithm: CrsAlgorithm,
}

impl KdbxHeaderBuilder {
    pub fn new() -> KdbxHeaderBuilder {
        KdbxHeaderBuilder {
            cipher_uuid: StandardAesEngine::UUID,
            compression: PwCompressionAlgorithm::GZip,
            master_seed: None,
            transform_seed: None,
            transform_rounds: constants::DEFAULT_KEY_ENCRYPTION_ROUNDS,
            encryption_iv: None,
            inner_stream_key: None,
            stream_start_bytes: None,
            inner_stream_algorithm: CrsAlgorithm::Salsa20,
        }
    }

    pub fn compression(mut self, compression: PwCompressionAlgorithm) -> KdbxHeaderBuilder {
        self.compression = compression;
        self
    }

    pub fn transform_rounds(mut self, rounds: u64) -> KdbxHeaderBuilder {
        self.transform_rounds = rounds;
        self
    }

    pub fn inner_stream_algorithm(mut self, algorithm: CrsAlgorithm) -> KdbxHeaderBuilder {
        self.inner_stream_algorithm = algorithm;
        self
    }

    /// Finish the header for writing: generate any seeds the caller did not
    /// pin down and serialize the image in canonical field order.
    pub fn complete(self) -> Result<KdbxHeader, Error> {
        fn filled(existing: Option<SafeBytes>, len: usize) -> Result<SafeBytes, Error> {
            match existing {
                Some(bytes) => Ok(bytes),
                None => {
                    let mut fresh = SafeBytes::zeroed(len)?;
                    Context::global().fill_random(fresh.as_mut_slice());
                    Ok(fresh)
                }
            }
        }

        let mut header = KdbxHeader {
            signature: FILE_SIGNATURE,
            version: FILE_VERSION_32_3,
            cipher_uuid: self.cipher_uuid,
            compression: self.compression,
            master_seed: filled(self.master_seed, 32)?,
            transform_seed: filled(self.transform_seed, 32)?,
            transform_rounds: self.transform_rounds,
            encryption_iv: filled(self.encryption_iv, 16)?,
            inner_stream_key: filled(self.inner_stream_key, 32)?,
            stream_start_bytes: filled(self.stream_start_bytes, 32)?,
            inner_stream_algorithm: self.inner_stream_algorithm,
            image: Vec::new(),
        };
        header.image = serialize_header(&header);
        Ok(header)
    }
}

impl Default for KdbxHeaderBuilder {
    fn default() -> KdbxHeaderBuilder {
        KdbxHeaderBuilder::new()
    }
}

/// Parser-side accumulator. Unlike the public builder this one records
/// which required fields actually appeared.
struct ParsedHeader {
    signature: (u32, u32),
    version: u32,
    cipher_uuid: Option<PwUUID>,
    compression: Option<PwCompressionAlgorithm>,
    master_seed: Option<SafeBytes>,
    transform_seed: Option<SafeBytes>,
    transform_rounds: Option<u64>,
    encryption_iv: Option<SafeBytes>,
    inner_stream_key: Option<SafeBytes>,
    stream_start_bytes: Option<SafeBytes>,
    inner_stream_algorithm: Option<CrsAlgorithm>,
}

impl ParsedHeader {
    fn finish(self, image: Vec<u8>) -> Result<KdbxHeader, Error> {
        let cipher_uuid = self
            .cipher_uuid
            .ok_or(Error::MalformedHeader("missing cipher UUID"))?;
        if cipher::get_cipher_engine(&cipher_uuid).is_none() {
            return Err(Error::MalformedHeader("unsupported cipher UUID"));
        }

        let master_seed = self
            .master_seed
            .ok_or(Error::MalformedHeader("missing master seed"))?;
        if master_seed.len() < 32 {
            return Err(Error::MalformedHeader("master seed is too short"));
        }

        let transform_seed = self
            .transform_seed
            .ok_or(Error::MalformedHeader("missing transform seed"))?;
        if transform_seed.len() != 32 {
            return Err(Error::MalformedHeader("transform seed must be 32 bytes"));
        }

        let encryption_iv = self
            .encryption_iv
            .ok_or(Error::MalformedHeader("missing encryption IV"))?;
        if encryption_iv.len() != 16 {
            return Err(Error::MalformedHeader("encryption IV must be 16 bytes"));
        }

        let inner_stream_key = self
            .inner_stream_key
            .ok_or(Error::MalformedHeader("missing inner stream key"))?;
        if inner_stream_key.len() != 32 {
            return Err(Error::MalformedHeader("inner stream key must be 32 bytes"));
        }

        let stream_start_bytes = self
            .stream_start_bytes
            .ok_or(Error::MalformedHeader("missing stream start bytes"))?;
        if stream_start_bytes.len() != 32 {
            return Err(Error::MalformedHeader("stream start bytes must be 32 bytes"));
        }

        Ok(KdbxHeader {
            signature: self.signature,
            version: self.version,
            cipher_uuid,
            compression: self
                .compression
                .ok_or(Error::MalformedHeader("missing compression flags"))?,
            master_seed,
            transform_seed,
            transform_rounds: self
                .transform_rounds
                .ok_or(Error::MalformedHeader("missing transform rounds"))?,
            encryption_iv,
            inner_stream_key,
            stream_start_bytes,
            inner_stream_algorithm: self
                .inner_stream_algorithm
                .ok_or(Error::MalformedHeader("missing inner stream cipher id"))?,
            image,
        })
    }
}

fn parse_header<R: Read>(input: &mut R) -> Result<ParsedHeader, Error> {
    let sig1 = ioutil::io_read_u32(input)?;
    let sig2 = ioutil::io_read_u32(input)?;
    let signature = (sig1, sig2);

    if signature != FILE_SIGNATURE && signature != FILE_SIGNATURE_PRE_RELEASE {
        if signature == FILE_SIGNATURE_OLD {
            log::debug!("rejecting a KeePass 1.x database");
        }
        return Err(Error::BadSignature(signature));
    }

    let version = ioutil::io_read_u32(input)?;
    if (version & FILE_VERSION_CRITICAL_MASK) != (FILE_VERSION_32_3 & FILE_VERSION_CRITICAL_MASK) {
        return Err(Error::UnsupportedVersion(version));
    }

    let mut parsed = ParsedHeader {
        signature,
        version,
        cipher_uuid: None,
        compression: None,
        master_seed: None,
        transform_seed: None,
        transform_rounds: None,
        encryption_iv: None,
        inner_stream_key: None,
        stream_start_bytes: None,
        inner_stream_algorithm: None,
    };

    loop {
        if !read_header_field(input, &mut parsed)? {
            break;
        }
    }

    Ok(parsed)
}

/// One TLV entry. Returns false on the terminator.
fn read_header_field<R: Read>(input: &mut R, parsed: &mut ParsedHeader) -> Result<bool, Error> {
    let field_id = ioutil::io_read_u8(input)?;
    let size = ioutil::io_read_u16(input)? as usize;

    let mut value = SafeBytes::zeroed(size)?;
    input.read_exact(value.as_mut_slice()).map_err(Error::Io)?;
    let data = value.as_slice();

    match HeaderFieldId::from_u8(field_id) {
        Some(HeaderFieldId::EndOfHeader) => return Ok(false),

        Some(HeaderFieldId::Comment) => {}

        Some(HeaderFieldId::CipherId) => {
            if data.len() != PwUUID::SIZE {
                return Err(Error::MalformedHeader("cipher UUID has a bad length"));
            }
            parsed.cipher_uuid = Some(PwUUID::from_slice(data));
        }

        Some(HeaderFieldId::CompressionFlags) => {
            if data.len() < 4 {
                return Err(Error::MalformedHeader("compression flags are truncated"));
            }
            let id = memutil::bytes_to_u32(data);
            parsed.compression = Some(
                PwCompressionAlgorithm::from_int(id)
                    .ok_or(Error::MalformedHeader("unknown compression algorithm"))?,
            );
        }

        Some(HeaderFieldId::MasterSeed) => {
            parsed.master_seed = Some(SafeBytes::from_slice(data)?);
            Context::global().add_entropy(data);
        }

        Some(HeaderFieldId::TransformSeed) => {
            parsed.transform_seed = Some(SafeBytes::from_slice(data)?);
            Context::global().add_entropy(data);
        }

        Some(HeaderFieldId::TransformRounds) => {
            if data.len() < 8 {
                return Err(Error::MalformedHeader("transform rounds are truncated"));
            }
            parsed.transform_rounds = Some(memutil::bytes_to_u64(data));
        }

        Some(HeaderFieldId::EncryptionIv) => {
            parsed.encryption_iv = Some(SafeBytes::from_slice(data)?);
        }

        Some(HeaderFieldId::InnerRandomStreamKey) => {
            parsed.inner_stream_key = Some(SafeBytes::from_slice(data)?);
            Context::global().add_entropy(data);
        }

        Some(HeaderFieldId::StreamStartBytes) => {
            parsed.stream_start_bytes = Some(SafeBytes::from_slice(data)?);
        }

        Some(HeaderFieldId::InnerRandomStreamId) => {
            if data.len() < 4 {
                return Err(Error::MalformedHeader("inner stream cipher id is truncated"));
            }
            let id = memutil::bytes_to_u32(data);
            parsed.inner_stream_algorithm = Some(
                CrsAlgorithm::from_int(id)
                    .ok_or(Error::MalformedHeader("unknown inner stream cipher"))?,
            );
        }

        None => {
            log::debug!("skipping unknown header field id {}", field_id);
        }
    }

    Ok(true)
}

fn push_field(out: &mut Vec<u8>, id: HeaderFieldId, value: &[u8]) {
    debug_assert!(value.len() <= u16::max_value() as usize);
    out.push(id as u8);
    out.extend_from_slice(&memutil::u16_to_bytes(value.len() as u16));
    out.extend_from_slice(value);
}

fn serialize_header(header: &KdbxHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&memutil::u32_to_bytes(header.signature.0));
    out.extend_from_slice(&memutil::u32_to_bytes(header.signature.1));
    out.extend_from_slice(&memutil::u32_to_bytes(header.version));

    push_field(&mut out, HeaderFieldId::CipherId, header.cipher_uuid.bytes());
    push_field(
        &mut out,
        HeaderFieldId::CompressionFlags,
        &memutil::u32_to_bytes(header.compression.to_int()),
    );
    push_field(&mut out, HeaderFieldId::MasterSeed, &header.master_seed);
    push_field(&mut out, HeaderFieldId::TransformSeed, &header.transform_seed);
    push_field(
        &mut out,
        HeaderFieldId::TransformRounds,
        &memutil::u64_to_bytes(header.transform_rounds),
    );
    push_field(&mut out, HeaderFieldId::EncryptionIv, &header.encryption_iv);
    push_field(
        &mut out,
        HeaderFieldId::InnerRandomStreamKey,
        &header.inner_stream_key,
    );
    push_field(
        &mut out,
        HeaderFieldId::StreamStartBytes,
        &header.stream_start_bytes,
    );
    push_field(
        &mut out,
        HeaderFieldId::InnerRandomStreamId,
        &memutil::u32_to_bytes(header.inner_stream_algorithm.to_int()),
    );
    push_field(&mut out, HeaderFieldId::EndOfHeader, END_OF_HEADER_VALUE);

    out
}
