//! Credential factors and the composite master key.
//!
//! Every factor contributes a 32-byte digest; the composite key is the
//! SHA-256 of the digests concatenated in the order the factors were added.

use sha2::{Digest as _, Sha256};
use std::io::Read;
use std::path::Path;
use xml::reader::{EventReader, ParserConfig, XmlEvent};

use crate::context::Context;
use crate::error::Error;
use crate::security::SafeBytes;
use crate::{crypto::kdf, memutil};

pub const USER_KEY_SIZE: usize = 32;

const KEY_FILE_ROOT: &str = "KeyFile";
const KEY_FILE_KEY: &str = "Key";
const KEY_FILE_DATA: &str = "Data";

/// Master password/passphrase as provided by the user.
pub struct KcpPassword {
    key_data: SafeBytes,
}

impl KcpPassword {
    pub fn new<S: AsRef<str>>(password: S) -> KcpPassword {
        let mut hasher = Sha256::new();
        hasher.input(password.as_ref().as_bytes());
        KcpPassword {
            key_data: digest_to_safe(&hasher.result()),
        }
    }
}

/// Key file in one of the forms KeePass accepts: the XML key file, a raw
/// 32-byte file, a 64-hex-character file, or any other file hashed whole.
pub struct KcpKeyFile {
    key_data: SafeBytes,
}

impl KcpKeyFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<KcpKeyFile, Error> {
        let mut raw = Vec::new();
        std::fs::File::open(path)
            .map_err(Error::Io)?
            .read_to_end(&mut raw)
            .map_err(Error::Io)?;
        let key_file = KcpKeyFile::from_bytes(&raw);
        memutil::zero_slice(&mut raw);
        key_file
    }

    pub fn from_bytes(raw: &[u8]) -> Result<KcpKeyFile, Error> {
        if let Some(mut key) = Self::load_xml_key_file(raw) {
            let key_data = SafeBytes::from_slice(&key)?;
            memutil::zero_slice(&mut key);
            return Ok(KcpKeyFile { key_data });
        }

        if raw.len() == USER_KEY_SIZE {
            return Ok(KcpKeyFile {
                key_data: SafeBytes::from_slice(raw)?,
            });
        }

        if raw.len() == USER_KEY_SIZE * 2 {
            if let Some(mut key) = memutil::hex_decode(raw) {
                let key_data = SafeBytes::from_slice(&key)?;
                memutil::zero_slice(&mut key);
                return Ok(KcpKeyFile { key_data });
            }
        }

        let mut hasher = Sha256::new();
        hasher.input(raw);
        Ok(KcpKeyFile {
            key_data: digest_to_safe(&hasher.result()),
        })
    }

    /// Write a fresh XML key file with 32 random bytes and return the key
    /// that now unlocks databases keyed with it.
    pub fn create_xml<W: std::io::Write>(mut out: W) -> Result<KcpKeyFile, Error> {
        let mut key = [0u8; USER_KEY_SIZE];
        Context::global().fill_random(&mut key);
        let encoded = base64::encode(&key[..]);

        // The fixed layout KeePass writes; no need for an XML emitter here.
        let document = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
             <KeyFile>\n\
             \t<Meta>\n\t\t<Version>1.00</Version>\n\t</Meta>\n\
             \t<Key>\n\t\t<Data>{}</Data>\n\t</Key>\n\
             </KeyFile>\n",
            encoded
        );
        out.write_all(document.as_bytes()).map_err(Error::Io)?;

        let key_data = SafeBytes::from_slice(&key)?;
        memutil::zero_slice(&mut key);
        Ok(KcpKeyFile { key_data })
    }

    /// `<KeyFile><Key><Data>` holding base64 of exactly 32 bytes. Anything
    /// else, including non-XML input, falls through to the other forms.
    fn load_xml_key_file(raw: &[u8]) -> Option<Vec<u8>> {
        let config = ParserConfig::new()
            .trim_whitespace(true)
            .ignore_comments(true)
            .coalesce_characters(true);
        let mut xml = EventReader::new_with_config(raw, config);

        let mut path: Vec<String> = Vec::new();
        let mut data: Option<String> = None;

        loop {
            match xml.next() {
                Ok(XmlEvent::StartElement { name, .. }) => {
                    path.push(name.local_name);
                }
                Ok(XmlEvent::EndElement { .. }) => {
                    path.pop();
                }
                Ok(XmlEvent::Characters(text)) => {
                    let at_data = path.len() == 3
                        && path[0] == KEY_FILE_ROOT
                        && path[1] == KEY_FILE_KEY
                        && path[2] == KEY_FILE_DATA;
                    if at_data {
                        data = Some(text);
                    }
                }
                Ok(XmlEvent::EndDocument) => break,
                Ok(_) => {}
                Err(_) => return None,
            }
        }

        let decoded = base64::decode(data?.trim().as_bytes()).ok()?;
        if decoded.len() == USER_KEY_SIZE {
            Some(decoded)
        } else {
            None
        }
    }
}

/// A 32-byte secret delivered by an external provider, e.g. a
/// challenge-response token. The response bytes are hashed so the provider
/// does not have to produce exactly 32 bytes.
pub struct KcpCustomKey {
    key_data: SafeBytes,
}

impl KcpCustomKey {
    pub fn new(secret: &[u8]) -> KcpCustomKey {
        let mut hasher = Sha256::new();
        hasher.input(secret);
        KcpCustomKey {
            key_data: digest_to_safe(&hasher.result()),
        }
    }
}

fn digest_to_safe(digest: &[u8]) -> SafeBytes {
    // 32 bytes; if this tiny allocation fails the process is beyond saving.
    SafeBytes::from_slice(digest).unwrap_or_else(|_| std::process::abort())
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UserKeyType {
    Password,
    KeyFile,
    Custom,
}

pub enum UserKey {
    Password(KcpPassword),
    KeyFile(KcpKeyFile),
    Custom(KcpCustomKey),
}

impl UserKey {
    pub fn key_data(&self) -> &[u8] {
        match self {
            UserKey::Password(password) => &password.key_data,
            UserKey::KeyFile(key_file) => &key_file.key_data,
            UserKey::Custom(custom) => &custom.key_data,
        }
    }

    pub fn kind(&self) -> UserKeyType {
        match self {
            UserKey::Password(_) => UserKeyType::Password,
            UserKey::KeyFile(_) => UserKeyType::KeyFile,
            UserKey::Custom(_) => UserKeyType::Custom,
        }
    }
}

/// The ordered set of credential factors for one database.
pub struct CompositeKey {
    user_keys: Vec<UserKey>,
    sealed: Option<SafeBytes>,
}

impl CompositeKey {
    pub fn new() -> CompositeKey {
        CompositeKey {
            user_keys: Vec::new(),
            sealed: None,
        }
    }

    /// Append a factor. The order of additions is part of the key.
    pub fn add_user_key(&mut self, user_key: UserKey) -> Result<(), Error> {
        if self.sealed.is_some() {
            return Err(Error::Generic("composite key is sealed"));
        }
        self.user_keys.push(user_key);
        Ok(())
    }

    pub fn contains_type(&self, kind: UserKeyType) -> bool {
        self.user_keys.iter().any(|key| key.kind() == kind)
    }

    /// SHA-256 over the concatenated factor digests. Idempotent; the first
    /// call fixes the value and later `add_user_key` calls are rejected.
    pub fn seal(&mut self) -> Result<&[u8], Error> {
        if self.sealed.is_none() {
            if self.user_keys.is_empty() {
                return Err(Error::Generic("composite key has no user keys"));
            }

            let mut hasher = Sha256::new();
            for user_key in self.user_keys.iter() {
                if user_key.key_data().len() != USER_KEY_SIZE {
                    return Err(Error::Generic("user key digest must be 32 bytes"));
                }
                hasher.input(user_key.key_data());
            }
            self.sealed = Some(digest_to_safe(&hasher.result()));
        }

        match &self.sealed {
            Some(sealed) => Ok(sealed.as_slice()),
            None => unreachable!(),
        }
    }

    /// The transformed 32-byte key for a database with the given transform
    /// seed and round count.
    pub fn generate_key_32(
        &mut self,
        transform_seed: &[u8],
        rounds: u64,
    ) -> Result<SafeBytes, Error> {
        self.seal()?;
        let composite = match &self.sealed {
            Some(sealed) => sealed.as_slice(),
            None => unreachable!(),
        };
        kdf::transform_key(composite, transform_seed, rounds)
    }
}

impl Default for CompositeKey {
    fn default() -> CompositeKey {
        CompositeKey::new()
    }
}
