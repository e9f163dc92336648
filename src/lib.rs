/// Trigger-correlated wake detection library
///
/// This library provides a multi-reader shared audio stream, per-consumer
/// stream readers, and a detector that maps an external trigger signal onto
/// absolute stream positions for downstream speech processing.

pub mod audio_format;
pub mod audio_stream;
pub mod detector;
pub mod observer;
pub mod stream_reader;
pub mod trigger;

// Re-export main types
pub use audio_format::{AudioFormat, AudioSample, Encoding, Endianness, FormatError, SAMPLE_RATE};
pub use audio_stream::{SharedAudioStream, StreamError, StreamWriter};
pub use detector::{DetectorConfig, DetectorError, DetectorStats, TriggerDetector};
pub use observer::{
    ChannelObserver, DetectorEvent, DetectorObserverRegistry, DetectorState, KeywordEvent,
    KeywordObserver, StateObserver,
};
pub use stream_reader::{ReadError, ReadPolicy, SeekError, StreamPosition, StreamReader};
pub use trigger::{
    InferenceTrigger, LatchedTrigger, PinTrigger, RisingEdge, TriggerError, TriggerHandle,
    TriggerSource,
};
