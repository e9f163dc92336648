/// Stream reader module
///
/// A per-consumer cursor into a [`SharedAudioStream`]. Each reader advances
/// independently; falling more than the stream capacity behind the writer is
/// reported as an overrun instead of silently skipping audio.

use crate::audio_format::AudioSample;
use crate::audio_stream::SharedAudioStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Unread data was overwritten. The reader has been moved to the writer position.
    #[error("Reader overrun: unread samples were overwritten")]
    Overrun,

    #[error("Reader closed")]
    Closed,

    #[error("Destination buffer is empty")]
    InvalidSize,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SeekError {
    #[error("Seek target {target} is older than the oldest retained sample {oldest}")]
    Expired { target: u64, oldest: u64 },

    #[error("Seek target before the start of the stream")]
    BeforeStart,

    #[error("Seek target beyond the largest stream index")]
    OutOfRange,

    #[error("Reader closed")]
    Closed,
}

/// What `read` does when no data is available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Wait (up to the timeout) for the writer
    Blocking,
    /// Return zero samples immediately
    NonBlocking,
}

/// Seek target, relative to a reference point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPosition {
    Absolute(u64),
    /// `n` samples before the writer cursor
    BeforeWriter(u64),
    /// `n` samples after this reader's cursor
    AfterReader(u64),
    /// `n` samples before this reader's cursor
    BeforeReader(u64),
}

/// Reader cursor into a shared audio stream
#[derive(Debug)]
pub struct StreamReader {
    stream: Arc<SharedAudioStream>,
    policy: ReadPolicy,
    cursor: u64,
    closed: bool,
}

impl StreamReader {
    pub(crate) fn new(stream: Arc<SharedAudioStream>, policy: ReadPolicy, cursor: u64) -> Self {
        Self {
            stream,
            policy,
            cursor,
            closed: false,
        }
    }

    /// Read up to `dest.len()` samples
    ///
    /// Returns `Ok(0)` when a blocking read timed out or a non-blocking read
    /// found nothing to read. Data still retained after the stream was closed
    /// is returned before `Closed` is reported.
    pub fn read(&mut self, dest: &mut [AudioSample], timeout: Duration) -> Result<usize, ReadError> {
        if self.closed {
            return Err(ReadError::Closed);
        }
        if dest.is_empty() {
            return Err(ReadError::InvalidSize);
        }

        let deadline = Instant::now() + timeout;
        let capacity = self.stream.capacity() as u64;

        loop {
            let write_index = self.stream.write_index();

            if write_index.saturating_sub(self.cursor) > capacity {
                return Err(self.overrun(write_index));
            }

            if write_index > self.cursor {
                let available = (write_index - self.cursor) as usize;
                let count = dest.len().min(available);

                if !self.stream.copy_from(self.cursor, &mut dest[..count]) {
                    return Err(self.overrun(self.stream.write_index()));
                }

                self.cursor += count as u64;
                return Ok(count);
            }

            if self.stream.is_closed() {
                return Err(ReadError::Closed);
            }

            match self.policy {
                ReadPolicy::NonBlocking => return Ok(0),
                ReadPolicy::Blocking => {
                    if !self.stream.wait_for_data(self.cursor, deadline) {
                        return Ok(0);
                    }
                }
            }
        }
    }

    /// Absolute index of the next sample to be read
    pub fn tell(&self) -> u64 {
        self.cursor
    }

    /// Move to an absolute index
    pub fn seek(&mut self, index: u64) -> Result<(), SeekError> {
        self.seek_to(StreamPosition::Absolute(index))
    }

    /// Move relative to the writer or to this reader
    ///
    /// Positions ahead of the writer are allowed; reads wait until the writer gets there.
    pub fn seek_to(&mut self, position: StreamPosition) -> Result<(), SeekError> {
        if self.closed {
            return Err(SeekError::Closed);
        }

        let target = match position {
            StreamPosition::Absolute(index) => index,
            StreamPosition::BeforeWriter(n) => self
                .stream
                .write_index()
                .checked_sub(n)
                .ok_or(SeekError::BeforeStart)?,
            StreamPosition::AfterReader(n) => {
                self.cursor.checked_add(n).ok_or(SeekError::OutOfRange)?
            }
            StreamPosition::BeforeReader(n) => {
                self.cursor.checked_sub(n).ok_or(SeekError::BeforeStart)?
            }
        };

        let oldest = self.stream.oldest_index();
        if target < oldest {
            return Err(SeekError::Expired { target, oldest });
        }

        debug!("Reader seek {} -> {}", self.cursor, target);
        self.cursor = target;
        Ok(())
    }

    /// Release the reader. Repeated calls return `Closed` and do nothing.
    pub fn close(&mut self) -> Result<(), ReadError> {
        if self.closed {
            return Err(ReadError::Closed);
        }

        self.closed = true;
        self.stream.release_reader();
        debug!("Reader closed at index {}", self.cursor);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn policy(&self) -> ReadPolicy {
        self.policy
    }

    pub fn stream(&self) -> &Arc<SharedAudioStream> {
        &self.stream
    }

    fn overrun(&mut self, write_index: u64) -> ReadError {
        warn!(
            "Reader overrun: cursor {} fell behind writer {}, skipping {} samples",
            self.cursor,
            write_index,
            write_index.saturating_sub(self.cursor)
        );
        self.cursor = write_index;
        ReadError::Overrun
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
