//! Load orchestration: header parse, key derivation and the read pipeline.
//!
//! Stage order is source, AES-CBC decrypt, stream-start-bytes check,
//! hashed-block deframe, then gzip inflate for compressed databases. The
//! final pipe is handed to the caller as an [`XmlByteStream`].

use std::io::{BufReader, Read};
use std::path::Path;

use crate::constants;
use crate::crypto::compress::GzipInflate;
use crate::crypto::hashed_block::HashedBlockJoin;
use crate::error::Error;
use crate::keys::CompositeKey;
use crate::pipe::{self, PipeReader, PipeStage, PipeWriter, Pipeline};
use crate::security::SafeBytes;

use super::header::KdbxHeader;
use super::{cipher_engine_for, derive_cipher_key, PwCompressionAlgorithm};

/// Open and load a database file.
pub fn load_kdbx_file<P: AsRef<Path>>(
    path: P,
    key: &mut CompositeKey,
) -> Result<(KdbxHeader, XmlByteStream), Error> {
    let file = std::fs::File::open(path).map_err(Error::Io)?;
    load_kdbx(BufReader::new(file), key)
}

/// Parse the header, derive the master key and start the read pipeline.
///
/// Returns the header (as derivation and protection metadata) and a stream
/// of plaintext XML bytes. A wrong password or key file is detected before
/// this returns; corruption deeper in the file surfaces while reading, or
/// at [`XmlByteStream::close`] for failures near the end of the stream.
pub fn load_kdbx<R: Read + Send + 'static>(
    mut input: R,
    key: &mut CompositeKey,
) -> Result<(KdbxHeader, XmlByteStream), Error> {
    let header = KdbxHeader::read(&mut input)?;

    let engine = cipher_engine_for(&header)?;
    let cipher_key = derive_cipher_key(&header, key, engine.key_length())?;

    let chunk_size = constants::pipe_chunk_size();
    let mut pipeline = Pipeline::new();

    let (ciphertext_in, ciphertext_out) = pipe::pipe(constants::PIPE_DEPTH);
    pipeline.spawn_source("source", input, ciphertext_in, chunk_size)?;

    let (decrypted_in, decrypted_out) = pipe::pipe(constants::PIPE_DEPTH);
    pipeline.spawn_stage(
        "decrypt",
        engine.decrypt_stage(&cipher_key, &header.encryption_iv)?,
        ciphertext_out,
        decrypted_in,
    )?;

    let (checked_in, checked_out) = pipe::pipe(constants::PIPE_DEPTH);
    pipeline.spawn_stage(
        "start-bytes",
        Box::new(StartBytesCheck::new(&header.stream_start_bytes)?),
        decrypted_out,
        checked_in,
    )?;

    let (deframed_in, deframed_out) = pipe::pipe(constants::PIPE_DEPTH);
    pipeline.spawn_stage(
        "deframe",
        Box::new(HashedBlockJoin::new()),
        checked_out,
        deframed_in,
    )?;

    let tail = match header.compression {
        PwCompressionAlgorithm::None => deframed_out,
        PwCompressionAlgorithm::GZip => {
            let (inflated_in, inflated_out) = pipe::pipe(constants::PIPE_DEPTH);
            pipeline.spawn_stage("inflate", Box::new(GzipInflate), deframed_out, inflated_in)?;
            inflated_out
        }
    };

    let mut stream = XmlByteStream::new(tail, pipeline);
    stream.prime()?;
    Ok((header, stream))
}

/// Compares the first 32 decrypted bytes against the header copy. The only
/// plausible cause of a mismatch is a wrong master key, so the error is
/// `BadPassword` no matter which credential factor was wrong.
struct StartBytesCheck {
    expected: SafeBytes,
    seen: usize,
}

impl StartBytesCheck {
    fn new(expected: &SafeBytes) -> Result<StartBytesCheck, Error> {
        Ok(StartBytesCheck {
            expected: expected.try_clone()?,
            seen: 0,
        })
    }
}

impl PipeStage for StartBytesCheck {
    fn run(
        mut self: Box<Self>,
        input: &mut PipeReader,
        output: &mut PipeWriter,
    ) -> Result<(), Error> {
        while let Some(mut chunk) = input.pop()? {
            if self.seen < self.expected.len() {
                let compare = std::cmp::min(self.expected.len() - self.seen, chunk.len());
                if chunk[0..compare] != self.expected[self.seen..(self.seen + compare)] {
                    return Err(Error::BadPassword);
                }
                self.seen += compare;
                chunk.consume_front(compare);
            }
            output.push(chunk)?;
        }

        if self.seen < self.expected.len() {
            // Too short to even contain the start bytes.
            return Err(Error::BadPassword);
        }
        Ok(())
    }
}

/// The plaintext XML byte stream of a loading database.
///
/// Reading drains the pipeline; [`XmlByteStream::close`] joins it and
/// surfaces any failure found after the caller stopped reading, such as a
/// corrupt hashed block near the end of the file. Dropping the stream
/// without closing abandons the load and the stages unwind on their own.
pub struct XmlByteStream {
    reader: Option<PipeReader>,
    current: Option<SafeBytes>,
    offset: usize,
    saw_eos: bool,
    pipeline: Option<Pipeline>,
}

impl XmlByteStream {
    fn new(reader: PipeReader, pipeline: Pipeline) -> XmlByteStream {
        XmlByteStream {
            reader: Some(reader),
            current: None,
            offset: 0,
            saw_eos: false,
            pipeline: Some(pipeline),
        }
    }

    /// Pull the first chunk so early failures surface before the stream is
    /// handed out. The stream-start check sits two stages upstream, so a
    /// wrong key fails here and not on the first `read`.
    fn prime(&mut self) -> Result<(), Error> {
        self.advance()
    }

    /// Load the next chunk into `current`. No-op at end of stream.
    fn advance(&mut self) -> Result<(), Error> {
        if self.saw_eos || self.current.is_some() {
            return Ok(());
        }
        let reader = match &mut self.reader {
            Some(reader) => reader,
            None => return Ok(()),
        };
        match reader.pop()? {
            Some(chunk) => {
                self.current = Some(chunk);
                self.offset = 0;
            }
            None => {
                self.saw_eos = true;
            }
        }
        Ok(())
    }

    /// Finish the load. Returns the first pipeline error, or `Cancelled`
    /// when the stream was abandoned before end of stream.
    pub fn close(mut self) -> Result<(), Error> {
        drop(self.reader.take());
        let pipeline = match self.pipeline.take() {
            Some(pipeline) => pipeline,
            None => return Ok(()),
        };

        match pipeline.finish() {
            Ok(()) if self.saw_eos => Ok(()),
            Ok(()) => Err(Error::Cancelled),
            Err(err) => Err(err),
        }
    }
}

impl Read for XmlByteStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.advance().map_err(Error::into_io)?;

        let current = match &self.current {
            Some(current) => current,
            None => return Ok(0),
        };

        let count = std::cmp::min(buf.len(), current.len() - self.offset);
        buf[0..count].copy_from_slice(&current[self.offset..(self.offset + count)]);
        self.offset += count;
        if self.offset == current.len() {
            self.current = None;
        }
        Ok(count)
    }
}
