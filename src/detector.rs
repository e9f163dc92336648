/// Trigger-correlated wake detector
///
/// Reads the shared stream at a fixed cadence on a dedicated thread and
/// samples an external trigger once per chunk. A positive trigger is mapped
/// onto the stream as a keyword event covering the chunk just consumed plus a
/// configurable rewind window.

use crate::audio_format::{AudioFormat, AudioSample, FormatError};
use crate::audio_stream::{SharedAudioStream, StreamError};
use crate::observer::{
    DetectorObserverRegistry, DetectorState, KeywordEvent, KeywordObserver, StateObserver,
};
use crate::stream_reader::{ReadError, ReadPolicy, StreamReader};
use crate::trigger::{TriggerError, TriggerSource};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Label emitted with every keyword event unless configured otherwise
pub const DEFAULT_KEYWORD: &str = "alexa";

/// Number of chunks to rewind from the trigger point
pub const DEFAULT_REWIND_CHUNKS: u64 = 10;

/// Longest chunk a single loop iteration may consume
pub const MAX_MS_PER_ITERATION: u64 = 1000;

/// Upper bound on the per-iteration read buffer
pub const MAX_CHUNK_SAMPLES: usize = 192_000;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("No audio stream provided")]
    MissingStream,

    #[error("Audio format requires byte swapping, which is not supported")]
    EndianMismatch,

    #[error("Invalid audio format: {0}")]
    InvalidAudioFormat(#[from] FormatError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Trigger source initialization failed: {0}")]
    TriggerInit(#[from] TriggerError),

    #[error("Failed to create stream reader: {0}")]
    ReaderCreation(#[from] StreamError),

    #[error("Failed to spawn detection thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}

/// Configuration for the trigger detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Label carried by keyword events
    pub keyword: String,

    /// Audio consumed per loop iteration, in milliseconds
    pub ms_per_iteration: u64,

    /// Chunks of already-buffered audio to include before the trigger point
    pub rewind_chunks: u64,

    /// Upper bound on a single blocking read; also bounds shutdown latency
    pub read_timeout_ms: u64,

    /// Start reading at the writer instead of the oldest retained sample
    pub start_with_new_data: bool,

    /// The only format this detector accepts
    pub supported_format: AudioFormat,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            keyword: DEFAULT_KEYWORD.to_string(),
            ms_per_iteration: 10,
            rewind_chunks: DEFAULT_REWIND_CHUNKS,
            read_timeout_ms: 1000,
            start_with_new_data: false,
            supported_format: AudioFormat::default(),
        }
    }
}

impl DetectorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.keyword.is_empty() {
            return Err(DetectorError::InvalidConfig(
                "keyword must not be empty".to_string(),
            ));
        }

        if self.read_timeout_ms == 0 {
            return Err(DetectorError::InvalidConfig(
                "read_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.ms_per_iteration > MAX_MS_PER_ITERATION {
            return Err(DetectorError::InvalidConfig(format!(
                "ms_per_iteration must be at most {}, got {}",
                MAX_MS_PER_ITERATION, self.ms_per_iteration
            )));
        }

        let chunk_samples = self.chunk_samples();
        if chunk_samples == 0 {
            return Err(DetectorError::InvalidConfig(format!(
                "{}ms per iteration at {}Hz yields an empty chunk",
                self.ms_per_iteration, self.supported_format.sample_rate_hz
            )));
        }
        if chunk_samples > MAX_CHUNK_SAMPLES {
            return Err(DetectorError::InvalidConfig(format!(
                "{}ms per iteration at {}Hz yields {} samples, more than {}",
                self.ms_per_iteration,
                self.supported_format.sample_rate_hz,
                chunk_samples,
                MAX_CHUNK_SAMPLES
            )));
        }

        if (chunk_samples as u64).checked_mul(self.rewind_chunks).is_none() {
            return Err(DetectorError::InvalidConfig(format!(
                "rewind of {} chunks of {} samples overflows the stream index",
                self.rewind_chunks, chunk_samples
            )));
        }

        Ok(())
    }

    /// Samples read per loop iteration
    pub fn chunk_samples(&self) -> usize {
        self.supported_format.samples_per_ms(self.ms_per_iteration)
    }

    /// Samples included before the end of the triggering chunk
    pub fn rewind_samples(&self) -> u64 {
        (self.chunk_samples() as u64).saturating_mul(self.rewind_chunks)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Compute the `[begin, end)` window for a trigger seen when the reader is at `end`
///
/// The window never reaches before `reference`, the first index known to be
/// contiguous with what the reader has consumed.
pub fn rewind_window(end: u64, rewind: u64, reference: u64) -> (u64, u64) {
    let begin = end.saturating_sub(rewind).max(reference);
    (begin.min(end), end)
}

/// Detector statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub chunks_processed: u64,
    pub keywords_detected: u64,
    pub overruns: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    chunks_processed: AtomicU64,
    keywords_detected: AtomicU64,
    overruns: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> DetectorStats {
        DetectorStats {
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            keywords_detected: self.keywords_detected.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

/// State owned by the detection thread
struct DetectionLoop {
    stream: Arc<SharedAudioStream>,
    reader: StreamReader,
    trigger: Box<dyn TriggerSource>,
    registry: Arc<DetectorObserverRegistry>,
    counters: Arc<StatCounters>,
    shutdown: Arc<AtomicBool>,
    keyword: String,
    chunk_samples: usize,
    rewind_samples: u64,
    read_timeout: Duration,
}

impl DetectionLoop {
    fn run(mut self) {
        let mut reference_index = self.reader.tell();
        self.registry.notify_state_observers(DetectorState::Active);
        info!(
            "Detection loop started at index {} (chunk={} samples, rewind={} samples)",
            reference_index, self.chunk_samples, self.rewind_samples
        );

        let mut chunk: Vec<AudioSample> = vec![0; self.chunk_samples];

        while !self.shutdown.load(Ordering::Acquire) {
            match self.reader.read(&mut chunk, self.read_timeout) {
                Ok(0) => trace!("No audio within {:?}", self.read_timeout),
                Ok(count) => {
                    self.counters.chunks_processed.fetch_add(1, Ordering::Relaxed);
                    trace!("Read {} samples, reader at {}", count, self.reader.tell());

                    match self.trigger.sample() {
                        Ok(true) => self.emit(reference_index),
                        Ok(false) => {}
                        Err(e) => {
                            error!("Trigger sampling failed: {}", e);
                            self.registry.notify_state_observers(DetectorState::Error);
                            break;
                        }
                    }
                }
                Err(ReadError::Overrun) => {
                    // Indices emitted from now on are relative to the resynchronized position
                    reference_index = self.reader.tell();
                    self.counters.overruns.fetch_add(1, Ordering::Relaxed);
                    warn!("Stream overrun, new reference index {}", reference_index);
                }
                Err(ReadError::Closed) => {
                    info!("Audio stream closed, stopping detection");
                    self.registry
                        .notify_state_observers(DetectorState::StreamClosed);
                    break;
                }
                Err(e) => {
                    error!("Stream read failed: {}", e);
                    self.registry.notify_state_observers(DetectorState::Error);
                    break;
                }
            }
        }

        let _ = self.reader.close();
        debug!("Detection loop exited");
    }

    fn emit(&self, reference_index: u64) {
        let (begin_index, end_index) =
            rewind_window(self.reader.tell(), self.rewind_samples, reference_index);

        let event = KeywordEvent {
            stream: Arc::clone(&self.stream),
            keyword: self.keyword.clone(),
            begin_index,
            end_index,
        };

        self.counters.keywords_detected.fetch_add(1, Ordering::Relaxed);
        self.registry.notify_keyword_observers(&event);
    }
}

/// Wake detector driven by an external trigger
///
/// Dropping the detector stops the loop and waits for the thread to exit,
/// which takes at most one read timeout.
pub struct TriggerDetector {
    config: DetectorConfig,
    registry: Arc<DetectorObserverRegistry>,
    counters: Arc<StatCounters>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TriggerDetector {
    /// Validate inputs, initialize the trigger and start detecting
    ///
    /// No detector is returned if any step fails.
    pub fn create(
        stream: Option<Arc<SharedAudioStream>>,
        audio_format: AudioFormat,
        mut trigger: Box<dyn TriggerSource>,
        keyword_observers: Vec<Arc<dyn KeywordObserver>>,
        state_observers: Vec<Arc<dyn StateObserver>>,
        config: DetectorConfig,
    ) -> Result<Self, DetectorError> {
        let stream = stream.ok_or_else(|| {
            error!("Detector creation failed: no stream");
            DetectorError::MissingStream
        })?;

        if audio_format.is_byteswapping_required() {
            error!("Detector creation failed: endian mismatch");
            return Err(DetectorError::EndianMismatch);
        }

        audio_format.check_compatible(&config.supported_format)?;
        config.validate()?;

        trigger.init().map_err(|e| {
            error!("Detector creation failed: {}", e);
            e
        })?;

        let reader = stream.create_reader(ReadPolicy::Blocking, config.start_with_new_data)?;

        info!("Initializing trigger detector");
        info!("Keyword: {}", config.keyword);
        info!(
            "Chunk: {}ms ({} samples), rewind: {} chunks",
            config.ms_per_iteration,
            config.chunk_samples(),
            config.rewind_chunks
        );

        let registry = Arc::new(DetectorObserverRegistry::new(
            keyword_observers,
            state_observers,
        ));
        let counters = Arc::new(StatCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let detection = DetectionLoop {
            stream,
            reader,
            trigger,
            registry: Arc::clone(&registry),
            counters: Arc::clone(&counters),
            shutdown: Arc::clone(&shutdown),
            keyword: config.keyword.clone(),
            chunk_samples: config.chunk_samples(),
            rewind_samples: config.rewind_samples(),
            read_timeout: config.read_timeout(),
        };

        let thread = thread::Builder::new()
            .name("trigger-detector".to_string())
            .spawn(move || detection.run())
            .map_err(DetectorError::ThreadSpawn)?;

        Ok(Self {
            config,
            registry,
            counters,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn add_keyword_observer(&self, observer: Arc<dyn KeywordObserver>) -> bool {
        self.registry.add_keyword_observer(observer)
    }

    pub fn remove_keyword_observer(&self, observer: &Arc<dyn KeywordObserver>) -> bool {
        self.registry.remove_keyword_observer(observer)
    }

    pub fn add_state_observer(&self, observer: Arc<dyn StateObserver>) -> bool {
        self.registry.add_state_observer(observer)
    }

    pub fn remove_state_observer(&self, observer: &Arc<dyn StateObserver>) -> bool {
        self.registry.remove_state_observer(observer)
    }

    /// Current state, `None` until the loop has started
    pub fn state(&self) -> Option<DetectorState> {
        self.registry.state()
    }

    pub fn stats(&self) -> DetectorStats {
        self.counters.snapshot()
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn chunk_samples(&self) -> usize {
        self.config.chunk_samples()
    }

    /// Whether the detection thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for the detection thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Detection thread panicked");
            }
            info!("Trigger detector stopped");
        }
    }
}

impl Drop for TriggerDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_format::{Encoding, Endianness};
    use crate::audio_stream::StreamWriter;
    use crate::trigger::MockTriggerSource;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> DetectorConfig {
        DetectorConfig {
            ms_per_iteration: 100,
            read_timeout_ms: 50,
            ..Default::default()
        }
    }

    fn ready_mock() -> MockTriggerSource {
        let mut mock = MockTriggerSource::new();
        mock.expect_init().returning(|| Ok(()));
        mock
    }

    fn stream_with_writer(capacity: usize) -> (Arc<SharedAudioStream>, StreamWriter) {
        let stream = SharedAudioStream::new(AudioFormat::default(), capacity).unwrap();
        let writer = stream.create_writer().unwrap();
        (stream, writer)
    }

    fn keyword_channel() -> (Arc<dyn KeywordObserver>, mpsc::Receiver<(u64, u64)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let observer: Arc<dyn KeywordObserver> = Arc::new(move |event: &KeywordEvent| {
            let _ = tx.lock().send((event.begin_index, event.end_index));
        });
        (observer, rx)
    }

    fn state_channel() -> (Arc<dyn StateObserver>, mpsc::Receiver<DetectorState>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let observer: Arc<dyn StateObserver> = Arc::new(move |state: DetectorState| {
            let _ = tx.lock().send(state);
        });
        (observer, rx)
    }

    #[test]
    fn test_rewind_window_clamps() {
        assert_eq!(rewind_window(8000, 16000, 0), (0, 8000));
        assert_eq!(rewind_window(32000, 16000, 0), (16000, 32000));
        assert_eq!(rewind_window(32000, 16000, 20000), (20000, 32000));
        assert_eq!(rewind_window(100, 0, 0), (100, 100));
    }

    #[test]
    fn test_config_validation() {
        let mut config = DetectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_samples(), 160);
        assert_eq!(config.rewind_samples(), 1600);

        config.ms_per_iteration = 0;
        assert!(config.validate().is_err());

        config.ms_per_iteration = 10;
        config.read_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.read_timeout_ms = 1000;
        config.keyword = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_oversized_chunk() {
        let mut config = DetectorConfig {
            ms_per_iteration: u64::MAX / 4,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DetectorError::InvalidConfig(_))
        ));

        config.ms_per_iteration = MAX_MS_PER_ITERATION;
        assert!(config.validate().is_ok());

        // Within the time limit but too many samples at this rate
        config.supported_format.sample_rate_hz = 384_000;
        assert_eq!(config.chunk_samples(), 384_000);
        assert!(matches!(
            config.validate(),
            Err(DetectorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_overflowing_rewind() {
        let config: DetectorConfig =
            serde_json::from_str(r#"{"rewind_chunks": 18446744073709551615}"#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(DetectorError::InvalidConfig(_))
        ));
        assert_eq!(config.rewind_samples(), u64::MAX);
    }

    #[test]
    fn test_create_with_overflowing_rewind_fails() {
        let (stream, _writer) = stream_with_writer(1600);
        let config = DetectorConfig {
            rewind_chunks: u64::MAX,
            ..test_config()
        };

        let result = TriggerDetector::create(
            Some(stream.clone()),
            AudioFormat::default(),
            Box::new(ready_mock()),
            Vec::new(),
            Vec::new(),
            config,
        );
        assert!(matches!(result, Err(DetectorError::InvalidConfig(_))));
        assert_eq!(stream.reader_count(), 0);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: DetectorConfig =
            serde_json::from_str(r#"{"keyword": "computer", "rewind_chunks": 4}"#).unwrap();

        assert_eq!(config.keyword, "computer");
        assert_eq!(config.rewind_chunks, 4);
        assert_eq!(config.ms_per_iteration, 10);
        assert_eq!(config.supported_format, AudioFormat::default());
    }

    #[test]
    fn test_create_without_stream() {
        let result = TriggerDetector::create(
            None,
            AudioFormat::default(),
            Box::new(ready_mock()),
            Vec::new(),
            Vec::new(),
            test_config(),
        );
        assert!(matches!(result, Err(DetectorError::MissingStream)));
    }

    #[test]
    fn test_create_with_incompatible_format() {
        let (stream, _writer) = stream_with_writer(1600);
        let format = AudioFormat {
            encoding: Encoding::Opus,
            ..AudioFormat::default()
        };

        let result = TriggerDetector::create(
            Some(stream.clone()),
            format,
            Box::new(ready_mock()),
            Vec::new(),
            Vec::new(),
            test_config(),
        );
        assert!(matches!(result, Err(DetectorError::InvalidAudioFormat(_))));

        // No reader is left behind by a failed construction
        assert_eq!(stream.reader_count(), 0);
    }

    #[test]
    fn test_create_with_foreign_endianness() {
        let (stream, _writer) = stream_with_writer(1600);
        let foreign = match Endianness::native() {
            Endianness::Little => Endianness::Big,
            Endianness::Big => Endianness::Little,
        };
        let format = AudioFormat {
            endianness: foreign,
            ..AudioFormat::default()
        };

        let result = TriggerDetector::create(
            Some(stream),
            format,
            Box::new(ready_mock()),
            Vec::new(),
            Vec::new(),
            test_config(),
        );
        assert!(matches!(result, Err(DetectorError::EndianMismatch)));
    }

    #[test]
    fn test_create_with_failing_trigger() {
        let (stream, _writer) = stream_with_writer(1600);
        let mut mock = MockTriggerSource::new();
        mock.expect_init()
            .returning(|| Err(TriggerError::Init("pin unavailable".to_string())));

        let result = TriggerDetector::create(
            Some(stream.clone()),
            AudioFormat::default(),
            Box::new(mock),
            Vec::new(),
            Vec::new(),
            test_config(),
        );
        assert!(matches!(result, Err(DetectorError::TriggerInit(_))));
        assert_eq!(stream.reader_count(), 0);
    }

    #[test]
    fn test_trigger_sampled_once_per_chunk() {
        let (stream, mut writer) = stream_with_writer(16000);
        writer.write(&[0; 1600 * 3]).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut mock = ready_mock();
        mock.expect_sample().returning(move || {
            let _ = tx.send(());
            Ok(false)
        });

        let mut detector = TriggerDetector::create(
            Some(stream),
            AudioFormat::default(),
            Box::new(mock),
            Vec::new(),
            Vec::new(),
            test_config(),
        )
        .unwrap();

        for _ in 0..3 {
            rx.recv_timeout(WAIT).unwrap();
        }
        // Nothing else to read, so no further samples
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        detector.shutdown();
        assert_eq!(detector.stats().chunks_processed, 3);
        assert_eq!(detector.stats().keywords_detected, 0);
    }

    #[test]
    fn test_trigger_error_moves_to_error_state() {
        let (stream, mut writer) = stream_with_writer(16000);
        writer.write(&[0; 1600]).unwrap();

        let mut mock = ready_mock();
        mock.expect_sample().returning(|| {
            Err(TriggerError::InvalidPinValue {
                path: "value".into(),
                value: "x".to_string(),
            })
        });

        let (observer, states) = state_channel();
        let detector = TriggerDetector::create(
            Some(stream.clone()),
            AudioFormat::default(),
            Box::new(mock),
            Vec::new(),
            vec![observer],
            test_config(),
        )
        .unwrap();

        assert_eq!(states.recv_timeout(WAIT).unwrap(), DetectorState::Active);
        assert_eq!(states.recv_timeout(WAIT).unwrap(), DetectorState::Error);
        assert_eq!(detector.state(), Some(DetectorState::Error));

        let start = Instant::now();
        while detector.is_running() && start.elapsed() < WAIT {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!detector.is_running());
        assert_eq!(stream.reader_count(), 0);
    }

    #[test]
    fn test_observer_added_after_start() {
        let (stream, mut writer) = stream_with_writer(16000);

        let mut mock = ready_mock();
        mock.expect_sample().returning(|| Ok(true));

        let detector = TriggerDetector::create(
            Some(stream),
            AudioFormat::default(),
            Box::new(mock),
            Vec::new(),
            Vec::new(),
            test_config(),
        )
        .unwrap();

        let (observer, events) = keyword_channel();
        assert!(detector.add_keyword_observer(Arc::clone(&observer)));
        writer.write(&[0; 1600]).unwrap();

        let (begin, end) = events.recv_timeout(WAIT).unwrap();
        assert_eq!((begin, end), (0, 1600));

        assert!(detector.remove_keyword_observer(&observer));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (stream, _writer) = stream_with_writer(1600);

        let mut detector = TriggerDetector::create(
            Some(stream.clone()),
            AudioFormat::default(),
            Box::new(ready_mock()),
            Vec::new(),
            Vec::new(),
            test_config(),
        )
        .unwrap();

        detector.shutdown();
        detector.shutdown();
        assert!(!detector.is_running());
        assert_eq!(stream.reader_count(), 0);
    }
}
