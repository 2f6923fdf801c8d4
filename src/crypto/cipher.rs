//! Outer cipher engines and their pipeline stages.
//!
//! The engine registry is keyed by the cipher UUID stored in the header.
//! KDBX 3 databases in the wild use AES-256-CBC with PKCS#7 padding, which
//! is the one engine registered here. The CBC mode is driven by hand around
//! the AES block primitive so the stages can work chunk by chunk: an
//! encryptor may hold back up to 15 plaintext bytes, a decryptor holds back
//! the last full block until end of stream because it may carry padding.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockCipher as _, NewBlockCipher as _};
use aes::Aes256;
use block_modes::block_padding::{Padding as _, Pkcs7};

use crate::error::Error;
use crate::kdbx::PwUUID;
use crate::memutil;
use crate::pipe::{PipeReader, PipeStage, PipeWriter};
use crate::security::SafeBytes;

pub const AES_KEY_SIZE: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;

static ENGINE_STANDARD_AES: StandardAesEngine = StandardAesEngine;

pub fn get_cipher_engine(uuid: &PwUUID) -> Option<&'static dyn CipherEngine> {
    if *uuid == StandardAesEngine::UUID {
        Some(&ENGINE_STANDARD_AES)
    } else {
        None
    }
}

/// An outer block cipher, instantiated per direction as a pipeline stage.
pub trait CipherEngine: Sync {
    /// UUID of the engine as stored in the file header.
    fn cipher_uuid(&self) -> PwUUID;

    fn display_name(&self) -> &'static str;

    /// Length of the encryption key in bytes.
    fn key_length(&self) -> usize {
        32
    }

    /// Length of the initialization vector in bytes.
    fn iv_length(&self) -> usize {
        16
    }

    fn encrypt_stage(&self, key: &[u8], iv: &[u8]) -> Result<Box<dyn PipeStage>, Error>;
    fn decrypt_stage(&self, key: &[u8], iv: &[u8]) -> Result<Box<dyn PipeStage>, Error>;
}

pub struct StandardAesEngine;

impl StandardAesEngine {
    pub const UUID: PwUUID = PwUUID::wrap([
        0x31, 0xC1, 0xF2, 0xE6, 0xBF, 0x71, 0x43, 0x50,
        0xBE, 0x58, 0x05, 0x21, 0x6A, 0xFC, 0x5A, 0xFF,
    ]);

    pub const NAME: &'static str = "AES/Rijndael (256, FIPS 197)";

    fn new_cipher(key: &[u8]) -> Result<Aes256, Error> {
        Aes256::new_varkey(key).map_err(|_| Error::Primitive("invalid AES key length"))
    }

    fn check_iv(iv: &[u8]) -> Result<[u8; AES_BLOCK_SIZE], Error> {
        if iv.len() != AES_BLOCK_SIZE {
            return Err(Error::Primitive("invalid AES IV length"));
        }
        let mut out = [0u8; AES_BLOCK_SIZE];
        out.copy_from_slice(iv);
        Ok(out)
    }
}

impl CipherEngine for StandardAesEngine {
    fn cipher_uuid(&self) -> PwUUID {
        StandardAesEngine::UUID
    }

    fn display_name(&self) -> &'static str {
        StandardAesEngine::NAME
    }

    fn encrypt_stage(&self, key: &[u8], iv: &[u8]) -> Result<Box<dyn PipeStage>, Error> {
        Ok(Box::new(StandardAesEncrypt {
            aes: Self::new_cipher(key)?,
            iv: Self::check_iv(iv)?,
            carry: [0u8; AES_BLOCK_SIZE],
            carry_len: 0,
        }))
    }

    fn decrypt_stage(&self, key: &[u8], iv: &[u8]) -> Result<Box<dyn PipeStage>, Error> {
        Ok(Box::new(StandardAesDecrypt {
            aes: Self::new_cipher(key)?,
            iv: Self::check_iv(iv)?,
            pending: SafeBytes::new(),
        }))
    }
}

/// CBC encryption. Complete blocks are encrypted as they arrive; the final
/// partial block is padded at end of stream, so the ciphertext always ends
/// with a padding block.
struct StandardAesEncrypt {
    aes: Aes256,
    iv: [u8; AES_BLOCK_SIZE],
    carry: [u8; AES_BLOCK_SIZE],
    carry_len: usize,
}

impl StandardAesEncrypt {
    fn encrypt_block(&mut self, block: &[u8], out: &mut SafeBytes) -> Result<(), Error> {
        debug_assert!(block.len() == AES_BLOCK_SIZE);
        let mut buf = [0u8; AES_BLOCK_SIZE];
        buf.copy_from_slice(block);
        memutil::xor_slices(&mut buf, &self.iv);
        self.aes.encrypt_block(GenericArray::from_mut_slice(&mut buf));
        self.iv.copy_from_slice(&buf);
        out.extend_from_slice(&buf)
    }

    fn process_chunk(&mut self, chunk: &[u8]) -> Result<SafeBytes, Error> {
        let total = self.carry_len + chunk.len();
        let mut out = SafeBytes::with_capacity(total - total % AES_BLOCK_SIZE)?;

        let mut offset = 0;
        if self.carry_len > 0 {
            let take = std::cmp::min(AES_BLOCK_SIZE - self.carry_len, chunk.len());
            self.carry[self.carry_len..(self.carry_len + take)]
                .copy_from_slice(&chunk[0..take]);
            self.carry_len += take;
            offset = take;
            if self.carry_len == AES_BLOCK_SIZE {
                let block = self.carry;
                self.encrypt_block(&block, &mut out)?;
                self.carry_len = 0;
            }
        }

        let whole = (chunk.len() - offset) / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
        for block in chunk[offset..(offset + whole)].chunks(AES_BLOCK_SIZE) {
            let mut copy = [0u8; AES_BLOCK_SIZE];
            copy.copy_from_slice(block);
            self.encrypt_block(&copy, &mut out)?;
            memutil::zero_slice(&mut copy);
        }

        let rest = &chunk[(offset + whole)..];
        if !rest.is_empty() {
            // A non-empty tail implies the carry was flushed above.
            debug_assert!(self.carry_len == 0);
            self.carry[0..rest.len()].copy_from_slice(rest);
            self.carry_len = rest.len();
        }

        Ok(out)
    }

    fn finish(&mut self) -> Result<SafeBytes, Error> {
        let mut block = [0u8; AES_BLOCK_SIZE];
        block[0..self.carry_len].copy_from_slice(&self.carry[0..self.carry_len]);
        Pkcs7::pad_block(&mut block, self.carry_len)
            .map_err(|_| Error::Primitive("could not pad the final block"))?;

        let mut out = SafeBytes::with_capacity(AES_BLOCK_SIZE)?;
        self.encrypt_block(&block, &mut out)?;
        memutil::zero_slice(&mut block);
        memutil::zero_slice(&mut self.carry);
        self.carry_len = 0;
        Ok(out)
    }
}

impl PipeStage for StandardAesEncrypt {
    fn run(
        mut self: Box<Self>,
        input: &mut PipeReader,
        output: &mut PipeWriter,
    ) -> Result<(), Error> {
        while let Some(chunk) = input.pop()? {
            let out = self.process_chunk(&chunk)?;
            output.push(out)?;
        }
        let tail = self.finish()?;
        output.push(tail)?;
        Ok(())
    }
}

/// CBC decryption. The last full block is withheld until end of stream so
/// its padding can be stripped; a ciphertext that is empty or not a multiple
/// of the block size means the stream was tampered with or truncated.
struct StandardAesDecrypt {
    aes: Aes256,
    iv: [u8; AES_BLOCK_SIZE],
    pending: SafeBytes,
}

impl StandardAesDecrypt {
    fn decrypt_block(&mut self, block: &mut [u8]) {
        debug_assert!(block.len() == AES_BLOCK_SIZE);
        let mut next_iv = [0u8; AES_BLOCK_SIZE];
        next_iv.copy_from_slice(block);
        self.aes.decrypt_block(GenericArray::from_mut_slice(block));
        memutil::xor_slices(block, &self.iv);
        self.iv = next_iv;
    }

    /// Decrypt every settled block in `pending`. When the buffered length is
    /// an exact block multiple the final block stays pending, because only
    /// end of stream tells us whether it is the padding block.
    fn drain_settled(&mut self) -> Result<SafeBytes, Error> {
        let len = self.pending.len();
        let keep = if len % AES_BLOCK_SIZE == 0 {
            AES_BLOCK_SIZE
        } else {
            len % AES_BLOCK_SIZE
        };
        let process = len.saturating_sub(keep) / AES_BLOCK_SIZE * AES_BLOCK_SIZE;

        let mut out = SafeBytes::with_capacity(process)?;
        if process > 0 {
            for offset in (0..process).step_by(AES_BLOCK_SIZE) {
                let mut block = [0u8; AES_BLOCK_SIZE];
                block.copy_from_slice(&self.pending[offset..(offset + AES_BLOCK_SIZE)]);
                self.decrypt_block(&mut block);
                out.extend_from_slice(&block)?;
                memutil::zero_slice(&mut block);
            }
            self.pending.consume_front(process);
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<SafeBytes, Error> {
        if self.pending.is_empty() || self.pending.len() % AES_BLOCK_SIZE != 0 {
            return Err(Error::IntegrityFailure(
                "ciphertext does not end on a cipher block boundary",
            ));
        }
        debug_assert!(self.pending.len() == AES_BLOCK_SIZE);

        let mut block = [0u8; AES_BLOCK_SIZE];
        block.copy_from_slice(&self.pending[0..AES_BLOCK_SIZE]);
        self.pending.clear();
        self.decrypt_block(&mut block);

        let unpadded_len = match Pkcs7::unpad(&block) {
            Ok(plain) => plain.len(),
            Err(_) => {
                memutil::zero_slice(&mut block);
                return Err(Error::IntegrityFailure("invalid padding in the final block"));
            }
        };

        let out = SafeBytes::from_slice(&block[0..unpadded_len]);
        memutil::zero_slice(&mut block);
        out
    }
}

impl PipeStage for StandardAesDecrypt {
    fn run(
        mut self: Box<Self>,
        input: &mut PipeReader,
        output: &mut PipeWriter,
    ) -> Result<(), Error> {
        while let Some(chunk) = input.pop()? {
            self.pending.extend_from_slice(&chunk)?;
            let out = self.drain_settled()?;
            output.push(out)?;
        }
        let tail = self.finish()?;
        output.push(tail)?;
        Ok(())
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::memutil::hex_to_bytes;
    use crate::pipe;

    /// Run a stage over input split at the given chunk boundaries.
    fn run_stage(stage: Box<dyn PipeStage>, input: &[u8], split_at: usize) -> Result<Vec<u8>, Error> {
        let (mut in_writer, mut in_reader) = pipe::pipe(64);
        for chunk in input.chunks(split_at.max(1)) {
            in_writer.push(SafeBytes::from_slice(chunk)?)?;
        }
        drop(in_writer);

        let (mut out_writer, mut out_reader) = pipe::pipe(64);
        stage.run(&mut in_reader, &mut out_writer)?;
        drop(out_writer);

        let mut collected = Vec::new();
        while let Some(chunk) = out_reader.pop()? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected)
    }

    #[test]
    fn cbc_single_block_matches_reference() {
        let key = hex_to_bytes(b"603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4");
        let iv = hex_to_bytes(b"39F23369A9D9BACFA530E26304231461");
        let plaintext = hex_to_bytes(b"f69f2445df4f9b17ad2b417be66c3710");
        let ciphertext_padded =
            hex_to_bytes(b"B2EB05E2C39BE9FCDA6C19078C6A9D1B3F461796D6B0D6B2E0C2A72B4D80E644");

        let encrypt = ENGINE_STANDARD_AES.encrypt_stage(&key, &iv).unwrap();
        let encrypted = run_stage(encrypt, &plaintext, 16).unwrap();
        assert_eq!(encrypted, ciphertext_padded);

        let decrypt = ENGINE_STANDARD_AES.decrypt_stage(&key, &iv).unwrap();
        let decrypted = run_stage(decrypt, &ciphertext_padded, 16).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn cbc_round_trip_survives_odd_chunking() {
        let key = hex_to_bytes(b"603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4");
        let iv = hex_to_bytes(b"39F23369A9D9BACFA530E26304231461");

        // 44 bytes: several blocks plus a partial tail.
        let plaintext = hex_to_bytes(
            b"f69f2445df4f9b17ad2b417be66c37109da71b2378a854f670ed165bac3dbc4814f4da5f00a08772b63c6a04",
        );

        let mut reference = None;
        for split_at in [1usize, 7, 16, 19, 44].iter() {
            let encrypt = ENGINE_STANDARD_AES.encrypt_stage(&key, &iv).unwrap();
            let encrypted = run_stage(encrypt, &plaintext, *split_at).unwrap();

            match &reference {
                None => reference = Some(encrypted.clone()),
                Some(expected) => assert_eq!(&encrypted, expected, "split at {}", split_at),
            }

            let decrypt = ENGINE_STANDARD_AES.decrypt_stage(&key, &iv).unwrap();
            let decrypted = run_stage(decrypt, &encrypted, *split_at).unwrap();
            assert_eq!(decrypted, plaintext, "split at {}", split_at);
        }
    }

    #[test]
    fn exact_multiple_gains_a_padding_block() {
        let key = [0x42u8; 32];
        let iv = [0x24u8; 16];
        let plaintext = [0x11u8; 32];

        let encrypt = ENGINE_STANDARD_AES.encrypt_stage(&key, &iv).unwrap();
        let encrypted = run_stage(encrypt, &plaintext, 32).unwrap();
        assert_eq!(encrypted.len(), 48);

        let decrypt = ENGINE_STANDARD_AES.decrypt_stage(&key, &iv).unwrap();
        let decrypted = run_stage(decrypt, &encrypted, 48).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn truncated_ciphertext_is_an_integrity_failure() {
        let key = [0x42u8; 32];
        let iv = [0x24u8; 16];

        let decrypt = ENGINE_STANDARD_AES.decrypt_stage(&key, &iv).unwrap();
        match run_stage(decrypt, &[0u8; 17], 17) {
            Err(Error::IntegrityFailure(_)) => {}
            other => panic!("expected an integrity failure, got {:?}", other),
        }
    }

    #[test]
    fn unknown_cipher_uuid_has_no_engine() {
        assert!(get_cipher_engine(&PwUUID::zero()).is_none());
        let aes = get_cipher_engine(&StandardAesEngine::UUID).unwrap();
        assert_eq!(aes.key_length(), AES_KEY_SIZE);
        assert_eq!(aes.iv_length(), AES_BLOCK_SIZE);
    }
}
