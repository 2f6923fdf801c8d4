//! Hashed-block framing of the inner plaintext stream.
//!
//! KDBX 3 authenticates content by splitting it into frames of the form
//! `(index: u32 LE, sha256: 32 B, length: u32 LE, payload)`. Indices count
//! up from zero and a zero-length frame with an all-zero hash terminates the
//! stream. Nothing may follow the terminator.

use sha2::{Digest as _, Sha256};
use std::io::Read;

use crate::constants;
use crate::error::Error;
use crate::memutil;
use crate::pipe::{PipeReadAdapter, PipeReader, PipeStage, PipeWriter};
use crate::security::SafeBytes;

const FRAME_HEADER_SIZE: usize = 4 + 32 + 4;

/// Splits a byte stream into hashed blocks.
pub struct HashedBlockSplit {
    block_size: usize,
    index: u32,
    buffer: SafeBytes,
}

impl HashedBlockSplit {
    pub fn new(block_size: usize) -> HashedBlockSplit {
        debug_assert!(block_size > 0 && block_size <= constants::MAX_BLOCK_SIZE);
        HashedBlockSplit {
            block_size,
            index: 0,
            buffer: SafeBytes::new(),
        }
    }

    fn emit_block(&mut self, output: &mut PipeWriter) -> Result<(), Error> {
        let payload = std::mem::replace(&mut self.buffer, SafeBytes::new());

        let mut hasher = Sha256::new();
        hasher.input(payload.as_slice());
        let hash = hasher.result();

        let mut frame = SafeBytes::with_capacity(FRAME_HEADER_SIZE + payload.len())?;
        frame.extend_from_slice(&memutil::u32_to_bytes(self.index))?;
        frame.extend_from_slice(&hash)?;
        frame.extend_from_slice(&memutil::u32_to_bytes(payload.len() as u32))?;
        frame.extend_from_slice(&payload)?;
        output.push(frame)?;

        self.index = self.index.checked_add(1).ok_or(Error::CorruptFrame(
            "block index overflow while writing",
        ))?;
        Ok(())
    }

    fn emit_terminator(&self, output: &mut PipeWriter) -> Result<(), Error> {
        let mut frame = SafeBytes::with_capacity(FRAME_HEADER_SIZE)?;
        frame.extend_from_slice(&memutil::u32_to_bytes(self.index))?;
        frame.extend_zeroed(32 + 4)?;
        output.push(frame)
    }
}

impl PipeStage for HashedBlockSplit {
    fn run(
        mut self: Box<Self>,
        input: &mut PipeReader,
        output: &mut PipeWriter,
    ) -> Result<(), Error> {
        while let Some(chunk) = input.pop()? {
            let mut offset = 0;
            while offset < chunk.len() {
                let room = self.block_size - self.buffer.len();
                let take = std::cmp::min(room, chunk.len() - offset);
                self.buffer.extend_from_slice(&chunk[offset..(offset + take)])?;
                offset += take;
                if self.buffer.len() == self.block_size {
                    self.emit_block(output)?;
                }
            }
        }

        if !self.buffer.is_empty() {
            self.emit_block(output)?;
        }
        self.emit_terminator(output)
    }
}

/// Verifies and strips hashed-block framing.
pub struct HashedBlockJoin {
    index: u32,
}

impl HashedBlockJoin {
    pub fn new() -> HashedBlockJoin {
        HashedBlockJoin { index: 0 }
    }

    /// Reads one frame. `Ok(None)` is the terminator.
    fn read_frame<R: Read>(&mut self, input: &mut R) -> Result<Option<SafeBytes>, Error> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        input
            .read_exact(&mut header)
            .map_err(map_truncation)?;

        let index = memutil::bytes_to_u32(&header[0..4]);
        if index != self.index {
            return Err(Error::CorruptFrame("unexpected block index"));
        }

        let expected_hash = &header[4..36];
        let len = memutil::bytes_to_u32(&header[36..40]) as usize;

        if len == 0 {
            if expected_hash.iter().any(|b| *b != 0) {
                return Err(Error::CorruptFrame("final block has a non-zero hash"));
            }
            return Ok(None);
        }

        if len > constants::MAX_BLOCK_SIZE {
            return Err(Error::CorruptFrame("block length out of range"));
        }

        let mut payload = SafeBytes::zeroed(len)?;
        input
            .read_exact(payload.as_mut_slice())
            .map_err(map_truncation)?;

        let mut hasher = Sha256::new();
        hasher.input(payload.as_slice());
        if &hasher.result()[..] != expected_hash {
            return Err(Error::IntegrityFailure("block hash mismatch"));
        }

        self.index += 1;
        Ok(Some(payload))
    }
}

impl PipeStage for HashedBlockJoin {
    fn run(
        mut self: Box<Self>,
        input: &mut PipeReader,
        output: &mut PipeWriter,
    ) -> Result<(), Error> {
        let mut source = PipeReadAdapter::new(input);
        loop {
            match self.read_frame(&mut source)? {
                Some(payload) => output.push(payload)?,
                None => break,
            }
        }

        // Anything after the terminator is not part of the stream.
        let mut trailing = [0u8; 1];
        match source.read(&mut trailing) {
            Ok(0) => Ok(()),
            Ok(_) => Err(Error::CorruptFrame("data after the final block")),
            Err(err) => Err(Error::from(err)),
        }
    }
}

/// Truncation inside a frame is corruption, not an IO condition.
fn map_truncation(err: std::io::Error) -> Error {
    if !Error::is_wrapped(&err) && err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::CorruptFrame("block stream ends inside a frame")
    } else {
        Error::from(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipe;

    fn run_stage(stage: Box<dyn PipeStage>, input: &[u8], chunk: usize) -> Result<Vec<u8>, Error> {
        let (mut in_writer, mut in_reader) = pipe::pipe(1024);
        for piece in input.chunks(chunk.max(1)) {
            in_writer.push(SafeBytes::from_slice(piece)?)?;
        }
        drop(in_writer);

        let (mut out_writer, mut out_reader) = pipe::pipe(1024);
        stage.run(&mut in_reader, &mut out_writer)?;
        drop(out_writer);

        let mut collected = Vec::new();
        while let Some(piece) = out_reader.pop()? {
            collected.extend_from_slice(&piece);
        }
        Ok(collected)
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut split = HashedBlockSplit::new(payload.len().max(1));
        split.buffer = SafeBytes::from_slice(payload).unwrap();
        let (mut writer, mut reader) = pipe::pipe(4);
        split.emit_block(&mut writer).unwrap();
        drop(writer);
        let chunk = reader.pop().unwrap().unwrap();
        chunk.to_vec()
    }

    #[test]
    fn split_then_join_round_trips() {
        let payload: Vec<u8> = (0..10_000u32).map(|n| (n % 251) as u8).collect();

        let split = Box::new(HashedBlockSplit::new(1024));
        let framed = run_stage(split, &payload, 700).unwrap();

        // 9 full blocks of 1024, a 784-byte tail, and the terminator.
        assert_eq!(framed.len(), 10 * FRAME_HEADER_SIZE + 10_000 + FRAME_HEADER_SIZE);

        let join = Box::new(HashedBlockJoin::new());
        let joined = run_stage(join, &framed, 333).unwrap();
        assert_eq!(joined, payload);
    }

    #[test]
    fn empty_stream_is_a_lone_terminator() {
        let split = Box::new(HashedBlockSplit::new(1024));
        let framed = run_stage(split, &[], 1).unwrap();
        assert_eq!(framed.len(), FRAME_HEADER_SIZE);
        assert!(framed[4..36].iter().all(|b| *b == 0));

        let join = Box::new(HashedBlockJoin::new());
        assert!(run_stage(join, &framed, 40).unwrap().is_empty());
    }

    #[test]
    fn flipped_payload_bit_is_an_integrity_failure() {
        let mut framed = frame(b"payload under test");
        let flip_at = FRAME_HEADER_SIZE + 5;
        framed[flip_at] ^= 0x10;
        // Terminator so the join would otherwise finish cleanly.
        let mut terminator = vec![0u8; FRAME_HEADER_SIZE];
        terminator[0] = 1;
        framed.extend_from_slice(&terminator);

        let join = Box::new(HashedBlockJoin::new());
        match run_stage(join, &framed, 17) {
            Err(Error::IntegrityFailure(_)) => {}
            other => panic!("expected an integrity failure, got {:?}", other),
        }
    }

    #[test]
    fn wrong_index_is_a_corrupt_frame() {
        let mut framed = frame(b"abc");
        framed[0] = 9;

        let join = Box::new(HashedBlockJoin::new());
        match run_stage(join, &framed, 64) {
            Err(Error::CorruptFrame(_)) => {}
            other => panic!("expected a corrupt frame, got {:?}", other),
        }
    }

    #[test]
    fn oversized_length_is_a_corrupt_frame() {
        let mut framed = frame(b"abc");
        // Length field claims far more than the cap.
        framed[36..40].copy_from_slice(&memutil::u32_to_bytes(0x7FFF_FFFF));

        let join = Box::new(HashedBlockJoin::new());
        match run_stage(join, &framed, 64) {
            Err(Error::CorruptFrame(_)) => {}
            other => panic!("expected a corrupt frame, got {:?}", other),
        }
    }

    #[test]
    fn truncated_frame_is_a_corrupt_frame() {
        let framed = frame(b"a longer payload that will be cut off");
        let cut = &framed[0..framed.len() - 4];

        let join = Box::new(HashedBlockJoin::new());
        match run_stage(join, cut, 64) {
            Err(Error::CorruptFrame(_)) => {}
            other => panic!("expected a corrupt frame, got {:?}", other),
        }
    }

    #[test]
    fn data_after_terminator_is_rejected() {
        let split = Box::new(HashedBlockSplit::new(1024));
        let mut framed = run_stage(split, b"tail", 4).unwrap();
        framed.push(0xFF);

        let join = Box::new(HashedBlockJoin::new());
        match run_stage(join, &framed, 64) {
            Err(Error::CorruptFrame(_)) => {}
            other => panic!("expected a corrupt frame, got {:?}", other),
        }
    }
}
