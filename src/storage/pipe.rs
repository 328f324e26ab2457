//! Bounded in-process pipe feeding streaming writes.
//!
//! The writer half is handed to the caller; the reader half is consumed by a
//! backend's `write_from` on another thread. A stream only counts as complete
//! when the writer is closed explicitly. Dropping the writer without closing
//! it makes the reader fail, so a half-fed object is never stored as if it
//! were whole.

use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use crate::path::StoragePath;
use crate::storage::{StorageError, StorageResult};

/// Largest chunk handed through the pipe in one message.
pub const CHUNK_SIZE: usize = 4096;

/// Number of chunks buffered before the writer blocks.
const PIPE_DEPTH: usize = 16;

enum Chunk {
    Data(Vec<u8>),
    End,
}

/// Create a connected writer/reader pair.
#[must_use]
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(PIPE_DEPTH);
    (
        PipeWriter { tx: Some(tx) },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            ended: false,
        },
    )
}

/// Sending half of a pipe.
pub struct PipeWriter {
    tx: Option<SyncSender<Chunk>>,
}

impl PipeWriter {
    /// Mark the stream complete.
    pub fn close(mut self) {
        if let Some(tx) = self.tx.take() {
            // a gone reader has already failed; nothing left to signal
            let _ = tx.send(Chunk::End);
        }
    }

    /// Copy all of `input` into the pipe.
    ///
    /// Returns `Ok(false)` if the reading side went away before the input was
    /// exhausted. Errors come only from `input`.
    ///
    /// # Errors
    ///
    /// Returns the error of a failed read from `input`.
    pub fn pump(&mut self, input: &mut dyn Read) -> io::Result<bool> {
        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            let n = match input.read(&mut buffer) {
                Ok(0) => return Ok(true),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if self.send(buffer[..n].to_vec()).is_err() {
                return Ok(false);
            }
        }
    }

    fn send(&self, data: Vec<u8>) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        tx.send(Chunk::Data(data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader is gone"))
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(CHUNK_SIZE);
        self.send(buf[..n].to_vec())?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Receiving half of a pipe.
pub struct PipeReader {
    rx: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
    ended: bool,
}

impl PipeReader {
    /// Consume and discard everything still in the pipe; returns the
    /// number of bytes discarded.
    pub fn drain(&mut self) -> u64 {
        let mut discarded = (self.current.len() - self.pos) as u64;
        self.current.clear();
        self.pos = 0;
        while !self.ended {
            match self.rx.recv() {
                Ok(Chunk::Data(data)) => discarded += data.len() as u64,
                Ok(Chunk::End) | Err(_) => self.ended = true,
            }
        }
        discarded
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            if self.ended || buf.is_empty() {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Chunk::Data(data)) => {
                    self.current = data;
                    self.pos = 0;
                }
                Ok(Chunk::End) => {
                    self.ended = true;
                    return Ok(0);
                }
                Err(_) => {
                    self.ended = true;
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed before completion",
                    ));
                }
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Caller side of a streaming write started by
/// [`ObjectStore::write_stream`](crate::storage::ObjectStore::write_stream).
///
/// Dropping it without calling [`finish`](Self::finish) aborts the write.
pub struct StreamWriter {
    pipe: Option<PipeWriter>,
    handle: Option<JoinHandle<StorageResult<u64>>>,
    path: StoragePath,
}

impl StreamWriter {
    pub(crate) fn new(
        pipe: PipeWriter,
        handle: JoinHandle<StorageResult<u64>>,
        path: StoragePath,
    ) -> Self {
        Self {
            pipe: Some(pipe),
            handle: Some(handle),
            path,
        }
    }

    /// Close the stream and wait until the object is stored.
    ///
    /// Returns the number of bytes stored.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the object could not be stored.
    pub fn finish(mut self) -> StorageResult<u64> {
        if let Some(pipe) = self.pipe.take() {
            pipe.close();
        }
        let handle = self
            .handle
            .take()
            .ok_or_else(|| StorageError::write(&self.path, "stream already finished"))?;
        handle
            .join()
            .map_err(|_| StorageError::write(&self.path, "stream writer thread panicked"))?
    }
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.pipe.as_mut() {
            Some(pipe) => pipe.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
