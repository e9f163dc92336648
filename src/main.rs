/// Wake trigger service binary
///
/// Feeds audio into a shared stream, watches a trigger source, and logs the
/// stream segment of every detected wake event.

use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use wake_trigger::{
    AudioFormat, AudioSample, ChannelObserver, DetectorConfig, DetectorEvent, DetectorState,
    KeywordObserver, LatchedTrigger, PinTrigger, RisingEdge, SharedAudioStream, StateObserver,
    StreamError, StreamWriter, TriggerDetector, TriggerHandle, TriggerSource,
};

/// Service options beyond the detector configuration
struct ServiceConfig {
    detector: DetectorConfig,
    pin_path: Option<PathBuf>,
    wav_path: Option<PathBuf>,
    /// Stream capacity in samples
    capacity: usize,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wake_trigger=debug".parse().expect("static directive")),
        )
        .init();

    if let Err(e) = run().await {
        error!("Wake trigger service failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("Starting wake trigger service");

    let config = load_config().context("Failed to load configuration")?;
    let format = config.detector.supported_format;
    let stream = SharedAudioStream::new(format, config.capacity)?;
    let writer = stream.create_writer()?;

    // Audio producer
    let chunk = config.detector.chunk_samples();
    let producer = match &config.wav_path {
        Some(path) => {
            let samples = load_wav(path, format)?;
            spawn_producer(writer, chunk, format, move |offset, out| {
                for (i, sample) in out.iter_mut().enumerate() {
                    *sample = samples.get(offset + i).copied().unwrap_or(0);
                }
            })?
        }
        None => spawn_producer(writer, chunk, format, |_, out| out.fill(0))?,
    };

    // Trigger source
    let trigger: Box<dyn TriggerSource> = match &config.pin_path {
        Some(path) => Box::new(RisingEdge::new(PinTrigger::from_path(path))),
        None => {
            let latched = LatchedTrigger::new();
            spawn_stdin_trigger(latched.handle())?;
            info!("No trigger pin configured; press Enter to fire the trigger");
            Box::new(latched)
        }
    };

    let (observer, mut events) = ChannelObserver::new();
    let detector = TriggerDetector::create(
        Some(Arc::clone(&stream)),
        format,
        trigger,
        vec![observer.clone() as Arc<dyn KeywordObserver>],
        vec![observer as Arc<dyn StateObserver>],
        config.detector.clone(),
    )
    .context("Failed to create detector")?;

    info!("Listening for '{}' triggers...", config.detector.keyword);

    // Event loop
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DetectorEvent::Keyword(event)) => {
                    let format = event.stream.format();
                    info!(
                        "Wake segment '{}': samples [{}, {}) = {:.2}s..{:.2}s",
                        event.keyword,
                        event.begin_index,
                        event.end_index,
                        format.duration_secs(event.begin_index),
                        format.duration_secs(event.end_index)
                    );
                }
                Some(DetectorEvent::State(state)) => {
                    info!("Detector state: {}", state);
                    if state != DetectorState::Active {
                        break;
                    }
                }
                None => {
                    info!("Event channel closed, shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    // Cleanup
    stream.close();
    drop(detector);
    if producer.join().is_err() {
        warn!("Producer thread panicked");
    }

    info!("Wake trigger service stopped");
    Ok(())
}

/// Load configuration from a JSON file or the environment
fn load_config() -> Result<ServiceConfig> {
    let mut detector = match std::env::var("WAKE_TRIGGER_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path))?;
            serde_json::from_str::<DetectorConfig>(&raw)
                .with_context(|| format!("Failed to parse config file {}", path))?
        }
        Err(_) => DetectorConfig::default(),
    };

    if let Ok(keyword) = std::env::var("WAKE_TRIGGER_KEYWORD") {
        detector.keyword = keyword;
    }
    if let Ok(ms) = std::env::var("WAKE_TRIGGER_MS_PER_ITERATION") {
        detector.ms_per_iteration = ms.parse().context("WAKE_TRIGGER_MS_PER_ITERATION")?;
    }
    if let Ok(chunks) = std::env::var("WAKE_TRIGGER_REWIND_CHUNKS") {
        detector.rewind_chunks = chunks.parse().context("WAKE_TRIGGER_REWIND_CHUNKS")?;
    }

    detector.validate()?;

    let buffer_secs = std::env::var("WAKE_TRIGGER_BUFFER_SECS")
        .unwrap_or_else(|_| "3".to_string())
        .parse::<u32>()
        .context("WAKE_TRIGGER_BUFFER_SECS")?;
    let capacity = stream_capacity(&detector, buffer_secs)?;

    Ok(ServiceConfig {
        detector,
        pin_path: std::env::var_os("WAKE_TRIGGER_PIN_PATH").map(PathBuf::from),
        wav_path: std::env::var_os("WAKE_TRIGGER_WAV").map(PathBuf::from),
        capacity,
    })
}

/// Stream capacity for `buffer_secs` of audio; every producer chunk must fit in it
fn stream_capacity(detector: &DetectorConfig, buffer_secs: u32) -> Result<usize> {
    if buffer_secs == 0 {
        bail!("WAKE_TRIGGER_BUFFER_SECS must be greater than 0");
    }

    let capacity = (detector.supported_format.sample_rate_hz as usize)
        .checked_mul(buffer_secs as usize)
        .context("WAKE_TRIGGER_BUFFER_SECS is too large")?;

    let chunk = detector.chunk_samples();
    if chunk > capacity {
        bail!(
            "{}ms chunks ({} samples) do not fit in a {}s buffer ({} samples)",
            detector.ms_per_iteration,
            chunk,
            buffer_secs,
            capacity
        );
    }

    Ok(capacity)
}

/// Read a WAV file that matches the stream format
fn load_wav(path: &Path, format: AudioFormat) -> Result<Vec<AudioSample>> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file {}", path.display()))?;

    let wav_format = AudioFormat::from_wav_spec(reader.spec());
    wav_format
        .check_compatible(&format)
        .with_context(|| format!("WAV file {} has an unsupported format", path.display()))?;

    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to decode WAV samples")?;

    info!(
        "Loaded {} samples ({:.1}s) from {}",
        samples.len(),
        format.duration_secs(samples.len() as u64),
        path.display()
    );
    Ok(samples)
}

/// Write `chunk` samples at a time, paced to real time, until the stream closes
fn spawn_producer<F>(
    mut writer: StreamWriter,
    chunk: usize,
    format: AudioFormat,
    mut fill: F,
) -> Result<thread::JoinHandle<()>>
where
    F: FnMut(usize, &mut [AudioSample]) + Send + 'static,
{
    let period = Duration::from_secs_f64(chunk as f64 / format.sample_rate_hz as f64);

    let handle = thread::Builder::new()
        .name("audio-producer".to_string())
        .spawn(move || {
            let mut buffer = vec![0; chunk];
            let mut offset = 0usize;
            let mut next = Instant::now();

            loop {
                fill(offset, &mut buffer);
                match writer.write(&buffer) {
                    Ok(written) => offset += written,
                    Err(StreamError::Closed) => {
                        debug!("Producer stopping: stream closed");
                        break;
                    }
                    Err(e) => {
                        error!("Producer stopping: {}", e);
                        break;
                    }
                }

                next += period;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
        })?;

    Ok(handle)
}

/// Fire the trigger on every line read from stdin
fn spawn_stdin_trigger(handle: TriggerHandle) -> Result<()> {
    // Plain thread: a blocking stdin read must not hold up runtime shutdown
    thread::Builder::new()
        .name("stdin-trigger".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if line.is_err() {
                    break;
                }
                debug!("Trigger fired from stdin");
                handle.fire();
            }
        })?;
    Ok(())
}
