/// Shared audio stream module
///
/// A fixed-capacity circular buffer of 16-bit samples addressed by absolute,
/// monotonically increasing indices. One writer appends; any number of
/// readers consume independently, each through its own cursor.
///
/// Sample storage is lock-free. The writer announces the range it is about
/// to overwrite (`write_reserved`) before touching the buffer, and publishes
/// the new cursor (`write_index`) afterwards, so a reader can tell whether
/// the range it just copied was overwritten underneath it.

use crate::audio_format::{AudioFormat, AudioSample};
use crate::stream_reader::{ReadPolicy, StreamReader};
use cache_padded::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicI16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Default upper bound on simultaneously open readers
pub const DEFAULT_MAX_READERS: usize = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StreamError {
    #[error("Invalid buffer capacity: {0}")]
    InvalidCapacity(usize),

    #[error("A writer is already attached to this stream")]
    WriterAlreadyAttached,

    #[error("Too many readers: limit is {0}")]
    TooManyReaders(usize),

    #[error("Write of {0} samples exceeds buffer capacity of {1}")]
    WriteTooLarge(usize, usize),

    #[error("Stream closed")]
    Closed,
}

/// Multi-reader circular audio buffer
pub struct SharedAudioStream {
    format: AudioFormat,
    buffer: Box<[AtomicI16]>,
    max_readers: usize,

    /// End of the write in progress; samples below `write_reserved - capacity` may be gone
    write_reserved: CachePadded<AtomicU64>,

    /// End of the last completed write
    write_index: CachePadded<AtomicU64>,

    closed: AtomicBool,
    writer_attached: AtomicBool,
    reader_count: AtomicUsize,

    // Only used to park blocking readers, never to guard samples
    wait_lock: Mutex<()>,
    data_available: Condvar,
}

impl SharedAudioStream {
    /// Create a stream holding at most `capacity` samples
    pub fn new(format: AudioFormat, capacity: usize) -> Result<Arc<Self>, StreamError> {
        Self::with_max_readers(format, capacity, DEFAULT_MAX_READERS)
    }

    /// Create a stream with a custom reader limit
    pub fn with_max_readers(
        format: AudioFormat,
        capacity: usize,
        max_readers: usize,
    ) -> Result<Arc<Self>, StreamError> {
        if capacity == 0 {
            return Err(StreamError::InvalidCapacity(capacity));
        }

        debug!(
            "Creating shared audio stream: capacity={} samples, max_readers={}",
            capacity, max_readers
        );

        let buffer = (0..capacity).map(|_| AtomicI16::new(0)).collect();

        Ok(Arc::new(Self {
            format,
            buffer,
            max_readers,
            write_reserved: CachePadded::new(AtomicU64::new(0)),
            write_index: CachePadded::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            writer_attached: AtomicBool::new(false),
            reader_count: AtomicUsize::new(0),
            wait_lock: Mutex::new(()),
            data_available: Condvar::new(),
        }))
    }

    /// Attach the single producer
    pub fn create_writer(self: &Arc<Self>) -> Result<StreamWriter, StreamError> {
        if self
            .writer_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Rejected second writer");
            return Err(StreamError::WriterAlreadyAttached);
        }

        debug!("Writer attached");
        Ok(StreamWriter {
            stream: Arc::clone(self),
        })
    }

    /// Create a reader positioned at the writer (`start_with_new_data`) or at the oldest retained sample
    pub fn create_reader(
        self: &Arc<Self>,
        policy: ReadPolicy,
        start_with_new_data: bool,
    ) -> Result<StreamReader, StreamError> {
        let max = self.max_readers;
        self.reader_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .map_err(|_| StreamError::TooManyReaders(max))?;

        let start = if start_with_new_data {
            self.write_index()
        } else {
            self.oldest_index()
        };

        debug!("Created {:?} reader at index {}", policy, start);
        Ok(StreamReader::new(Arc::clone(self), policy, start))
    }

    /// Close the stream. Readers drain what is retained, then see `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Shared audio stream closed at index {}", self.write_index());
        self.wake_readers();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Absolute index one past the last written sample
    pub fn write_index(&self) -> u64 {
        self.write_index.load(Ordering::Acquire)
    }

    /// Absolute index of the oldest sample still retained
    pub fn oldest_index(&self) -> u64 {
        self.write_index().saturating_sub(self.capacity() as u64)
    }

    /// Number of open readers
    pub fn reader_count(&self) -> usize {
        self.reader_count.load(Ordering::Acquire)
    }

    fn write(&self, samples: &[AudioSample]) -> Result<usize, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }

        let capacity = self.capacity();
        if samples.len() > capacity {
            return Err(StreamError::WriteTooLarge(samples.len(), capacity));
        }
        if samples.is_empty() {
            return Ok(0);
        }

        // Only the attached writer moves the cursors
        let start = self.write_index.load(Ordering::Relaxed);
        let end = start + samples.len() as u64;

        self.write_reserved.store(end, Ordering::Relaxed);
        fence(Ordering::Release);

        for (offset, &sample) in samples.iter().enumerate() {
            let slot = self.slot(start + offset as u64);
            slot.store(sample, Ordering::Relaxed);
        }

        self.write_index.store(end, Ordering::Release);
        self.wake_readers();

        trace!("Wrote {} samples, write index now {}", samples.len(), end);
        Ok(samples.len())
    }

    /// Copy samples starting at absolute `index` into `dest`.
    ///
    /// Returns false if the writer overwrote any part of the range during the copy.
    pub(crate) fn copy_from(&self, index: u64, dest: &mut [AudioSample]) -> bool {
        for (offset, sample) in dest.iter_mut().enumerate() {
            *sample = self.slot(index + offset as u64).load(Ordering::Relaxed);
        }

        fence(Ordering::Acquire);
        let reserved = self.write_reserved.load(Ordering::Relaxed);
        reserved <= index + self.capacity() as u64
    }

    /// Park until the writer moves past `index`, the stream closes, or `deadline` passes.
    ///
    /// Returns false on timeout.
    pub(crate) fn wait_for_data(&self, index: u64, deadline: Instant) -> bool {
        let mut guard = self.wait_lock.lock();
        while self.write_index() <= index && !self.is_closed() {
            if self.data_available.wait_until(&mut guard, deadline).timed_out() {
                return self.write_index() > index || self.is_closed();
            }
        }
        true
    }

    pub(crate) fn release_reader(&self) {
        self.reader_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn slot(&self, index: u64) -> &AtomicI16 {
        &self.buffer[(index % self.buffer.len() as u64) as usize]
    }

    fn wake_readers(&self) {
        // Taking the lock orders the wakeup after any reader's condition check
        drop(self.wait_lock.lock());
        self.data_available.notify_all();
    }
}

impl fmt::Debug for SharedAudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAudioStream")
            .field("format", &self.format)
            .field("capacity", &self.capacity())
            .field("write_index", &self.write_index())
            .field("readers", &self.reader_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Producer handle for a [`SharedAudioStream`]
///
/// Writes never block: when the buffer is full the oldest samples are
/// overwritten, and readers that had not consumed them get an overrun.
#[derive(Debug)]
pub struct StreamWriter {
    stream: Arc<SharedAudioStream>,
}

impl StreamWriter {
    /// Append samples, returning how many were written
    pub fn write(&mut self, samples: &[AudioSample]) -> Result<usize, StreamError> {
        self.stream.write(samples)
    }

    /// Absolute index the next written sample will get
    pub fn tell(&self) -> u64 {
        self.stream.write_index()
    }

    /// Close the underlying stream
    pub fn close(&mut self) {
        self.stream.close();
    }

    pub fn stream(&self) -> &Arc<SharedAudioStream> {
        &self.stream
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.stream.writer_attached.store(false, Ordering::Release);
        debug!("Writer detached");
    }
}
