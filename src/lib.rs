//! Streaming reader and writer for KeePass 2 KDBX 3.1 database files.
//!
//! A KDBX file is an encrypted, optionally compressed, integrity-framed XML
//! document. This crate implements the container layer: it turns the bytes of
//! a `.kdbx` file into the plaintext XML byte stream (and back) without ever
//! materializing the whole database in memory. The XML-to-entry binding is
//! the caller's concern; [`kdbx::xml`] provides the helpers it needs for
//! protected field values.
//!
//! Reading runs a staged pipeline, one thread per stage, linked by small
//! bounded buffers: header parse, AES-256-CBC decryption, stream-start-bytes
//! verification, hashed-block deframing and optional gzip inflation. Writing
//! runs the same stages in reverse.
//!
//! ```no_run
//! use kdbx3::{load_kdbx_file, CompositeKey, UserKey, KcpPassword};
//! use std::io::Read;
//!
//! # fn main() -> Result<(), kdbx3::Error> {
//! let mut key = CompositeKey::new();
//! key.add_user_key(UserKey::Password(KcpPassword::new("hunter2")))?;
//!
//! let (header, mut xml) = load_kdbx_file("passwords.kdbx", &mut key)?;
//! let mut document = Vec::new();
//! xml.read_to_end(&mut document).map_err(kdbx3::Error::from)?;
//! xml_binding::parse(&document, &header)?;
//! # Ok(())
//! # }
//! # mod xml_binding {
//! #     pub fn parse(_: &[u8], _: &kdbx3::KdbxHeader) -> Result<(), kdbx3::Error> { Ok(()) }
//! # }
//! ```

pub mod error;
pub mod constants;
mod memutil;
pub mod security;
mod ioutil;
pub mod context;
mod cryptoutil;
pub mod keys;
pub mod crypto;
pub mod pipe;
pub mod kdbx;

pub use crate::error::Error;
pub use crate::kdbx::header::{KdbxHeader, KdbxHeaderBuilder};
pub use crate::kdbx::read::{load_kdbx, load_kdbx_file, XmlByteStream};
pub use crate::kdbx::write::store_kdbx;
pub use crate::kdbx::{PwCompressionAlgorithm, PwUUID};
pub use crate::keys::{CompositeKey, KcpCustomKey, KcpKeyFile, KcpPassword, UserKey};
pub use crate::security::SafeBytes;
