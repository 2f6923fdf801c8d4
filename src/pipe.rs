//! Bounded inter-stage buffers and the pipeline runner.
//!
//! A pipeline is a linear chain of stages, one OS thread each, linked by
//! bounded chunk queues. A queue carries [`SafeBytes`] chunks plus an
//! end-of-stream or error mark. Producers block while the queue is full,
//! consumers while it is empty, so a large database streams through a fixed
//! amount of memory with every stage working on a different part of it.
//!
//! A stage that fails marks its output queue with an error; downstream
//! stages observe it and exit. A consumer that goes away marks the queue
//! from the other side; the producer's next push fails with
//! [`Error::Cancelled`] and the cancellation ripples upstream, each stage
//! stopping at the end of the chunk it is processing.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::error::Error;
use crate::security::SafeBytes;

struct PipeState {
    queue: VecDeque<SafeBytes>,
    producer_done: bool,
    consumer_gone: bool,
    error: Option<Error>,
}

struct PipeShared {
    state: Mutex<PipeState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl PipeShared {
    fn lock(&self) -> MutexGuard<PipeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn wait<'m>(cond: &Condvar, guard: MutexGuard<'m, PipeState>) -> MutexGuard<'m, PipeState> {
    match cond.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A bounded link between two stages. `capacity` is counted in chunks.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    debug_assert!(capacity > 0, "a pipe needs room for at least one chunk");
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            queue: VecDeque::with_capacity(capacity),
            producer_done: false,
            consumer_gone: false,
            error: None,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
        capacity,
    });
    (
        PipeWriter {
            shared: Arc::clone(&shared),
        },
        PipeReader { shared },
    )
}

pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    /// Queue a chunk, blocking while the pipe is full. Empty chunks are
    /// dropped; an empty chunk is not a valid end-of-stream marker.
    pub fn push(&mut self, chunk: SafeBytes) -> Result<(), Error> {
        if chunk.is_empty() {
            return Ok(());
        }
        let mut state = self.shared.lock();
        loop {
            if state.consumer_gone {
                return Err(Error::Cancelled);
            }
            if state.queue.len() < self.shared.capacity {
                state.queue.push_back(chunk);
                self.shared.not_empty.notify_one();
                return Ok(());
            }
            state = wait(&self.shared.not_full, state);
        }
    }

    /// Mark the stream as failed. The reader observes the error after
    /// draining any chunks queued before it.
    pub fn fail(&mut self, error: Error) {
        let mut state = self.shared.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
        state.producer_done = true;
        self.shared.not_empty.notify_all();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.producer_done = true;
        self.shared.not_empty.notify_all();
    }
}

pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl PipeReader {
    /// Next chunk, blocking while the pipe is empty. `Ok(None)` is a clean
    /// end of stream; queued chunks are delivered before a failure is.
    pub fn pop(&mut self) -> Result<Option<SafeBytes>, Error> {
        let mut state = self.shared.lock();
        loop {
            if let Some(chunk) = state.queue.pop_front() {
                self.shared.not_full.notify_one();
                return Ok(Some(chunk));
            }
            if let Some(error) = &state.error {
                return Err(error.duplicate());
            }
            if state.producer_done {
                return Ok(None);
            }
            state = wait(&self.shared.not_empty, state);
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.consumer_gone = true;
        // Scrub anything still in flight right away.
        state.queue.clear();
        self.shared.not_full.notify_all();
    }
}

/// A single processing unit of a pipeline.
pub trait PipeStage: Send {
    fn run(self: Box<Self>, input: &mut PipeReader, output: &mut PipeWriter)
        -> Result<(), Error>;
}

/// `std::io::Read` view of a pipe, for stages built around byte-stream
/// consumers. Errors cross the trait boundary wrapped and are recovered by
/// `Error::from` on the other side.
pub struct PipeReadAdapter<'p> {
    pipe: &'p mut PipeReader,
    current: Option<SafeBytes>,
    offset: usize,
}

impl<'p> PipeReadAdapter<'p> {
    pub fn new(pipe: &'p mut PipeReader) -> PipeReadAdapter<'p> {
        PipeReadAdapter {
            pipe,
            current: None,
            offset: 0,
        }
    }
}

impl<'p> std::io::Read for PipeReadAdapter<'p> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(current) = &self.current {
                if self.offset < current.len() {
                    let count = std::cmp::min(buf.len(), current.len() - self.offset);
                    buf[0..count].copy_from_slice(&current[self.offset..(self.offset + count)]);
                    self.offset += count;
                    if self.offset == current.len() {
                        self.current = None;
                    }
                    return Ok(count);
                }
                self.current = None;
            }
            match self.pipe.pop() {
                Ok(Some(chunk)) => {
                    self.current = Some(chunk);
                    self.offset = 0;
                }
                Ok(None) => return Ok(0),
                Err(err) => return Err(err.into_io()),
            }
        }
    }
}

/// `std::io::Write` view of a pipe. Bytes are gathered into chunks of
/// `chunk_size` and pushed when full; call [`PipeWriteAdapter::finish`] to
/// flush the final partial chunk.
pub struct PipeWriteAdapter<'p> {
    pipe: &'p mut PipeWriter,
    chunk_size: usize,
    buffer: SafeBytes,
}

impl<'p> PipeWriteAdapter<'p> {
    pub fn new(pipe: &'p mut PipeWriter, chunk_size: usize) -> PipeWriteAdapter<'p> {
        debug_assert!(chunk_size > 0);
        PipeWriteAdapter {
            pipe,
            chunk_size,
            buffer: SafeBytes::new(),
        }
    }

    fn flush_chunk(&mut self) -> Result<(), Error> {
        if !self.buffer.is_empty() {
            let chunk = std::mem::replace(&mut self.buffer, SafeBytes::new());
            self.pipe.push(chunk)?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), Error> {
        self.flush_chunk()
    }
}

impl<'p> std::io::Write for PipeWriteAdapter<'p> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.buffer.len() == self.chunk_size {
                self.flush_chunk().map_err(Error::into_io)?;
            }
            let take = std::cmp::min(self.chunk_size - self.buffer.len(), buf.len() - written);
            self.buffer
                .extend_from_slice(&buf[written..(written + take)])
                .map_err(Error::into_io)?;
            written += take;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_chunk().map_err(Error::into_io)
    }
}

/// Owns the threads of a running pipeline.
pub struct Pipeline {
    handles: Vec<(&'static str, JoinHandle<Result<(), Error>>)>,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline {
            handles: Vec::new(),
        }
    }

    /// Run an arbitrary closure as a pipeline thread. Used for the endpoint
    /// pumps that only have a pipe on one side.
    pub fn spawn<F>(&mut self, name: &'static str, f: F) -> Result<(), Error>
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(format!("kdbx-{}", name))
            .spawn(f)
            .map_err(Error::Io)?;
        self.handles.push((name, handle));
        Ok(())
    }

    /// Run a stage between two pipes. On failure the output pipe is marked
    /// with the error so downstream stages stop, and the error itself is
    /// kept for [`Pipeline::finish`].
    pub fn spawn_stage(
        &mut self,
        name: &'static str,
        stage: Box<dyn PipeStage>,
        input: PipeReader,
        output: PipeWriter,
    ) -> Result<(), Error> {
        self.spawn(name, move || {
            let mut input = input;
            let mut output = output;
            match stage.run(&mut input, &mut output) {
                Ok(()) => Ok(()),
                Err(err) => {
                    output.fail(err.duplicate());
                    Err(err)
                }
            }
        })
    }

    /// Pump a `Read` into a pipe as the head of the chain.
    pub fn spawn_source<R>(
        &mut self,
        name: &'static str,
        mut input: R,
        mut output: PipeWriter,
        chunk_size: usize,
    ) -> Result<(), Error>
    where
        R: std::io::Read + Send + 'static,
    {
        self.spawn(name, move || {
            let result = pump_read(&mut input, &mut output, chunk_size);
            if let Err(err) = &result {
                output.fail(err.duplicate());
            }
            result
        })
    }

    /// Join every stage and report the first real failure. `Cancelled`
    /// results are only reported when no stage failed for a better reason,
    /// since every stage upstream of a failure cancels.
    pub fn finish(self) -> Result<(), Error> {
        let mut first: Option<Error> = None;
        let mut cancelled = false;

        for (name, handle) in self.handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(Error::Cancelled)) => {
                    cancelled = true;
                }
                Ok(Err(err)) => {
                    if first.is_none() {
                        first = Some(err);
                    }
                }
                Err(_) => {
                    log::error!("pipeline stage `{}` panicked", name);
                    if first.is_none() {
                        first = Some(Error::Generic("a pipeline stage panicked"));
                    }
                }
            }
        }

        match first {
            Some(err) => Err(err),
            None if cancelled => Err(Error::Cancelled),
            None => Ok(()),
        }
    }
}

fn pump_read<R: std::io::Read>(
    input: &mut R,
    output: &mut PipeWriter,
    chunk_size: usize,
) -> Result<(), Error> {
    loop {
        let mut chunk = SafeBytes::zeroed(chunk_size)?;
        let mut filled = 0;
        while filled < chunk.len() {
            match input.read(&mut chunk.as_mut_slice()[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }
        if filled == 0 {
            return Ok(());
        }
        chunk.truncate(filled);
        output.push(chunk)?;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read as _, Write as _};

    #[test]
    fn chunks_arrive_in_order() {
        let (mut writer, mut reader) = pipe(2);
        let feeder = std::thread::spawn(move || {
            for n in 0..10u8 {
                writer.push(SafeBytes::from_slice(&[n; 3]).unwrap()).unwrap();
            }
        });

        let mut seen = Vec::new();
        while let Some(chunk) = reader.pop().unwrap() {
            seen.push(chunk[0]);
        }
        feeder.join().unwrap();
        assert_eq!(seen, (0..10u8).collect::<Vec<_>>());
    }

    #[test]
    fn drop_of_writer_is_clean_eos() {
        let (writer, mut reader) = pipe(1);
        drop(writer);
        assert!(reader.pop().unwrap().is_none());
        assert!(reader.pop().unwrap().is_none());
    }

    #[test]
    fn error_surfaces_after_buffered_chunks() {
        let (mut writer, mut reader) = pipe(4);
        writer.push(SafeBytes::from_slice(&[1]).unwrap()).unwrap();
        writer.fail(Error::IntegrityFailure("boom"));
        drop(writer);

        assert!(reader.pop().unwrap().is_some());
        match reader.pop() {
            Err(Error::IntegrityFailure(_)) => {}
            other => panic!("expected an integrity failure, got {:?}", other.map(|_| ())),
        }
        // The error mark is sticky.
        assert!(reader.pop().is_err());
    }

    #[test]
    fn dropped_reader_cancels_producer() {
        let (mut writer, reader) = pipe(1);
        drop(reader);
        match writer.push(SafeBytes::from_slice(&[1]).unwrap()) {
            Err(Error::Cancelled) => {}
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[test]
    fn backpressure_blocks_until_consumed() {
        let (mut writer, mut reader) = pipe(1);
        writer.push(SafeBytes::from_slice(&[1]).unwrap()).unwrap();

        let feeder = std::thread::spawn(move || {
            // Blocks until the consumer makes room.
            writer.push(SafeBytes::from_slice(&[2]).unwrap()).unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(reader.pop().unwrap().unwrap()[0], 1);
        assert_eq!(reader.pop().unwrap().unwrap()[0], 2);
        assert!(reader.pop().unwrap().is_none());
        feeder.join().unwrap();
    }

    #[test]
    fn adapters_round_trip_across_chunk_boundaries() {
        let (mut writer, mut reader) = pipe(8);
        {
            let mut sink = PipeWriteAdapter::new(&mut writer, 4);
            sink.write_all(b"hello streaming world").unwrap();
            sink.finish().unwrap();
        }
        drop(writer);

        let mut source = PipeReadAdapter::new(&mut reader);
        let mut collected = Vec::new();
        source.read_to_end(&mut collected).unwrap();
        assert_eq!(collected, b"hello streaming world");
    }
}
