//! Gzip stages for compressed databases.
//!
//! Both stages lean on the `std::io` adapters over the pipes; zlib-level
//! stream errors are told apart from propagated pipeline errors by whether
//! the `io::Error` wraps one of ours.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::constants;
use crate::error::Error;
use crate::pipe::{PipeReadAdapter, PipeReader, PipeStage, PipeWriteAdapter, PipeWriter};
use crate::security::SafeBytes;

fn map_flate_error(err: std::io::Error) -> Error {
    if Error::is_wrapped(&err) {
        Error::from(err)
    } else {
        log::debug!("deflate stream error: {}", err);
        Error::Compression("invalid deflate stream")
    }
}

/// Inflates a gzip stream back into plaintext chunks.
pub struct GzipInflate;

impl PipeStage for GzipInflate {
    fn run(
        self: Box<Self>,
        input: &mut PipeReader,
        output: &mut PipeWriter,
    ) -> Result<(), Error> {
        let chunk_size = constants::pipe_chunk_size();
        let mut decoder = GzDecoder::new(PipeReadAdapter::new(input));

        loop {
            let mut chunk = SafeBytes::zeroed(chunk_size)?;
            let mut filled = 0;
            while filled < chunk.len() {
                match decoder.read(&mut chunk.as_mut_slice()[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(err) => return Err(map_flate_error(err)),
                }
            }
            if filled == 0 {
                return Ok(());
            }
            chunk.truncate(filled);
            output.push(chunk)?;
        }
    }
}

/// Deflates plaintext chunks into a gzip stream.
pub struct GzipDeflate;

impl PipeStage for GzipDeflate {
    fn run(
        self: Box<Self>,
        input: &mut PipeReader,
        output: &mut PipeWriter,
    ) -> Result<(), Error> {
        let chunk_size = constants::pipe_chunk_size();
        let mut encoder = GzEncoder::new(
            PipeWriteAdapter::new(output, chunk_size),
            Compression::default(),
        );

        while let Some(chunk) = input.pop()? {
            encoder.write_all(&chunk).map_err(map_flate_error)?;
        }

        let sink = encoder.finish().map_err(map_flate_error)?;
        sink.finish()
    }
}
