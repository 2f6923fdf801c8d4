//! Store orchestration: the write pipeline, mirroring the read side.
//!
//! Stage order is source, gzip deflate for compressed databases,
//! hashed-block framing, stream-start-bytes prefix, AES-CBC encrypt, sink.
//! The header image is written on the calling thread before the pipeline
//! starts, since every ciphertext byte depends on its seeds.

use std::io::{Read, Write};

use crate::constants;
use crate::crypto::compress::GzipDeflate;
use crate::crypto::hashed_block::HashedBlockSplit;
use crate::error::Error;
use crate::keys::CompositeKey;
use crate::pipe::{self, PipeReader, PipeStage, PipeWriter, Pipeline};
use crate::security::SafeBytes;

use super::header::KdbxHeader;
use super::{cipher_engine_for, derive_cipher_key, PwCompressionAlgorithm};

/// Encrypt the XML byte stream `xml` into `sink` under the given header.
///
/// The header comes from [`KdbxHeaderBuilder::complete`], which fills in
/// fresh random seeds; complete it first so the inner stream key is
/// available while masking protected values in the XML. Returns the sink
/// when the whole database, terminator frame included, has been written
/// and flushed.
///
/// [`KdbxHeaderBuilder::complete`]: super::header::KdbxHeaderBuilder::complete
pub fn store_kdbx<W, R>(
    mut sink: W,
    key: &mut CompositeKey,
    header: &KdbxHeader,
    xml: R,
) -> Result<W, Error>
where
    W: Write + Send + 'static,
    R: Read + Send + 'static,
{
    let engine = cipher_engine_for(header)?;
    let cipher_key = derive_cipher_key(header, key, engine.key_length())?;

    sink.write_all(header.image()).map_err(Error::Io)?;

    let chunk_size = constants::pipe_chunk_size();
    let mut pipeline = Pipeline::new();

    let (plaintext_in, plaintext_out) = pipe::pipe(constants::PIPE_DEPTH);
    pipeline.spawn_source("source", xml, plaintext_in, chunk_size)?;

    let framer_input = match header.compression {
        PwCompressionAlgorithm::None => plaintext_out,
        PwCompressionAlgorithm::GZip => {
            let (deflated_in, deflated_out) = pipe::pipe(constants::PIPE_DEPTH);
            pipeline.spawn_stage("deflate", Box::new(GzipDeflate), plaintext_out, deflated_in)?;
            deflated_out
        }
    };

    let (framed_in, framed_out) = pipe::pipe(constants::PIPE_DEPTH);
    pipeline.spawn_stage(
        "frame",
        Box::new(HashedBlockSplit::new(constants::DEFAULT_BLOCK_SIZE)),
        framer_input,
        framed_in,
    )?;

    let (prefixed_in, prefixed_out) = pipe::pipe(constants::PIPE_DEPTH);
    pipeline.spawn_stage(
        "start-bytes",
        Box::new(StartBytesEmit::new(&header.stream_start_bytes)?),
        framed_out,
        prefixed_in,
    )?;

    let (encrypted_in, encrypted_out) = pipe::pipe(constants::PIPE_DEPTH);
    pipeline.spawn_stage(
        "encrypt",
        engine.encrypt_stage(&cipher_key, &header.encryption_iv)?,
        prefixed_out,
        encrypted_in,
    )?;

    let sink_handle = std::thread::Builder::new()
        .name("kdbx-sink".into())
        .spawn(move || pump_sink(sink, encrypted_out))
        .map_err(Error::Io)?;

    let stage_result = pipeline.finish();
    let sink_result = match sink_handle.join() {
        Ok(result) => result,
        Err(_) => Err(Error::Generic("the sink stage panicked")),
    };

    match (stage_result, sink_result) {
        (Ok(()), Ok(sink)) => Ok(sink),
        // A failed sink cancels every stage upstream; its own error is the
        // one worth reporting.
        (Err(Error::Cancelled), Err(err)) => Err(err),
        (Err(err), _) => Err(err),
        (Ok(()), Err(err)) => Err(err),
    }
}

fn pump_sink<W: Write>(mut sink: W, mut input: PipeReader) -> Result<W, Error> {
    while let Some(chunk) = input.pop()? {
        sink.write_all(&chunk).map_err(Error::Io)?;
    }
    sink.flush().map_err(Error::Io)?;
    Ok(sink)
}

/// Prepends the header's stream start bytes to the plaintext, the exact
/// mirror of the check the read side performs.
struct StartBytesEmit {
    prefix: SafeBytes,
}

impl StartBytesEmit {
    fn new(prefix: &SafeBytes) -> Result<StartBytesEmit, Error> {
        Ok(StartBytesEmit {
            prefix: prefix.try_clone()?,
        })
    }
}

impl PipeStage for StartBytesEmit {
    fn run(
        self: Box<Self>,
        input: &mut PipeReader,
        output: &mut PipeWriter,
    ) -> Result<(), Error> {
        output.push(self.prefix)?;
        while let Some(chunk) = input.pop()? {
            output.push(chunk)?;
        }
        Ok(())
    }
}
