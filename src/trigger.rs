/// Trigger source module
///
/// A trigger source is any external boolean signal that marks a candidate
/// wake event: a GPIO pin, a flag latched by a callback, or the score of a
/// model running elsewhere. The detector samples it once per audio chunk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Trigger initialization failed: {0}")]
    Init(String),

    #[error("Failed to read trigger pin {path}: {source}")]
    PinRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected pin value {value:?} in {path}")]
    InvalidPinValue { path: PathBuf, value: String },
}

/// Capability to sample the current trigger state
#[cfg_attr(test, mockall::automock)]
pub trait TriggerSource: Send {
    /// Prepare the source. Called once while the detector is being constructed.
    fn init(&mut self) -> Result<(), TriggerError> {
        Ok(())
    }

    /// Sample the trigger. `true` means a wake event is signalled right now.
    fn sample(&mut self) -> Result<bool, TriggerError>;
}

impl<T: TriggerSource + ?Sized> TriggerSource for Box<T> {
    fn init(&mut self) -> Result<(), TriggerError> {
        (**self).init()
    }

    fn sample(&mut self) -> Result<bool, TriggerError> {
        (**self).sample()
    }
}

/// Flag set from any thread, consumed by the next sample
#[derive(Debug, Default)]
pub struct LatchedTrigger {
    latch: Arc<AtomicBool>,
}

/// Cloneable handle that fires a [`LatchedTrigger`]
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    latch: Arc<AtomicBool>,
}

impl LatchedTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> TriggerHandle {
        TriggerHandle {
            latch: Arc::clone(&self.latch),
        }
    }
}

impl TriggerHandle {
    pub fn fire(&self) {
        self.latch.store(true, Ordering::Release);
    }
}

impl TriggerSource for LatchedTrigger {
    fn sample(&mut self) -> Result<bool, TriggerError> {
        Ok(self.latch.swap(false, Ordering::AcqRel))
    }
}

/// GPIO pin polled through its sysfs `value` file
#[derive(Debug, Clone)]
pub struct PinTrigger {
    path: PathBuf,
    active_low: bool,
}

impl PinTrigger {
    /// Pin exported at `/sys/class/gpio/gpio<pin>/value`
    pub fn sysfs(pin: u32) -> Self {
        Self::from_path(format!("/sys/class/gpio/gpio{}/value", pin))
    }

    /// Pin value file at an arbitrary path
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            active_low: false,
        }
    }

    /// Treat a low level as the active state
    pub fn active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_level(&self) -> Result<bool, TriggerError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| TriggerError::PinRead {
            path: self.path.clone(),
            source,
        })?;

        match raw.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(TriggerError::InvalidPinValue {
                path: self.path.clone(),
                value: other.to_string(),
            }),
        }
    }
}

impl TriggerSource for PinTrigger {
    fn init(&mut self) -> Result<(), TriggerError> {
        let level = self
            .read_level()
            .map_err(|e| TriggerError::Init(e.to_string()))?;
        info!(
            "Monitoring trigger pin {} (level={}, active_low={})",
            self.path.display(),
            level,
            self.active_low
        );
        Ok(())
    }

    fn sample(&mut self) -> Result<bool, TriggerError> {
        let level = self.read_level()?;
        Ok(level != self.active_low)
    }
}

/// Positive when an externally computed score reaches a threshold
///
/// `score` returns `None` while no new result is available.
pub struct InferenceTrigger<F> {
    score: F,
    threshold: f32,
}

impl<F> InferenceTrigger<F>
where
    F: FnMut() -> Option<f32> + Send,
{
    pub fn new(threshold: f32, score: F) -> Self {
        Self { score, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl<F> TriggerSource for InferenceTrigger<F>
where
    F: FnMut() -> Option<f32> + Send,
{
    fn init(&mut self) -> Result<(), TriggerError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(TriggerError::Init(format!(
                "threshold must be between 0.0 and 1.0, got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<bool, TriggerError> {
        Ok(match (self.score)() {
            Some(score) => {
                trace!("Inference score {:.3}", score);
                score >= self.threshold
            }
            None => false,
        })
    }
}

/// Reports only the false -> true transitions of the wrapped source
///
/// Useful for level-triggered pins that stay high for longer than a chunk.
#[derive(Debug)]
pub struct RisingEdge<T> {
    inner: T,
    last: bool,
}

impl<T: TriggerSource> RisingEdge<T> {
    pub fn new(inner: T) -> Self {
        Self { inner, last: false }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: TriggerSource> TriggerSource for RisingEdge<T> {
    fn init(&mut self) -> Result<(), TriggerError> {
        self.inner.init()
    }

    fn sample(&mut self) -> Result<bool, TriggerError> {
        let level = self.inner.sample()?;
        let edge = level && !self.last;
        if edge {
            debug!("Trigger rising edge");
        }
        self.last = level;
        Ok(edge)
    }
}
