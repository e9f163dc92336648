/// Audio format description
///
/// Describes the layout of samples flowing through a shared stream and checks
/// it against the single profile a detector is configured to accept.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::error;

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Sample rate of the default profile
pub const SAMPLE_RATE: u32 = 16000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Linear PCM
    Lpcm,
    /// IEEE float PCM
    Float,
    Opus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Byte order of the machine we are running on
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("Incompatible {field}: expected {expected}, got {actual}")]
    Incompatible {
        field: &'static str,
        expected: String,
        actual: String,
    },
}

/// Audio stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub endianness: Endianness,
    pub sample_rate_hz: u32,
    pub sample_size_in_bits: u16,
    pub num_channels: u16,
}

impl Default for AudioFormat {
    /// 16kHz, 16-bit, mono, little-endian LPCM
    fn default() -> Self {
        Self {
            encoding: Encoding::Lpcm,
            endianness: Endianness::Little,
            sample_rate_hz: SAMPLE_RATE,
            sample_size_in_bits: 16,
            num_channels: 1,
        }
    }
}

impl AudioFormat {
    /// Whether samples in this format must be byte swapped before use on this host
    pub fn is_byteswapping_required(&self) -> bool {
        self.sample_size_in_bits > 8 && self.endianness != Endianness::native()
    }

    /// Check that `self` exactly matches `profile`
    ///
    /// No negotiation is attempted: the first mismatching field is reported.
    pub fn check_compatible(&self, profile: &AudioFormat) -> Result<(), FormatError> {
        fn mismatch<T: fmt::Debug>(field: &'static str, expected: T, actual: T) -> FormatError {
            error!(
                "Audio format incompatible: field={}, expected={:?}, actual={:?}",
                field, expected, actual
            );
            FormatError::Incompatible {
                field,
                expected: format!("{:?}", expected),
                actual: format!("{:?}", actual),
            }
        }

        if self.encoding != profile.encoding {
            return Err(mismatch("encoding", profile.encoding, self.encoding));
        }
        if self.endianness != profile.endianness {
            return Err(mismatch("endianness", profile.endianness, self.endianness));
        }
        if self.sample_rate_hz != profile.sample_rate_hz {
            return Err(mismatch(
                "sample rate",
                profile.sample_rate_hz,
                self.sample_rate_hz,
            ));
        }
        if self.sample_size_in_bits != profile.sample_size_in_bits {
            return Err(mismatch(
                "sample size",
                profile.sample_size_in_bits,
                self.sample_size_in_bits,
            ));
        }
        if self.num_channels != profile.num_channels {
            return Err(mismatch(
                "channel count",
                profile.num_channels,
                self.num_channels,
            ));
        }
        Ok(())
    }

    /// Number of samples covering `ms` milliseconds at this sample rate
    ///
    /// Saturates at `usize::MAX` instead of overflowing.
    pub fn samples_per_ms(&self, ms: u64) -> usize {
        let samples = (self.sample_rate_hz as u64 / 1000).saturating_mul(ms);
        usize::try_from(samples).unwrap_or(usize::MAX)
    }

    /// Duration of `samples` samples (per channel) in seconds
    pub fn duration_secs(&self, samples: u64) -> f32 {
        samples as f32 / self.sample_rate_hz as f32
    }

    /// Map a WAV header onto a stream format. WAV data is always little-endian.
    pub fn from_wav_spec(spec: hound::WavSpec) -> Self {
        let encoding = match spec.sample_format {
            hound::SampleFormat::Int => Encoding::Lpcm,
            hound::SampleFormat::Float => Encoding::Float,
        };

        Self {
            encoding,
            endianness: Endianness::Little,
            sample_rate_hz: spec.sample_rate,
            sample_size_in_bits: spec.bits_per_sample,
            num_channels: spec.channels,
        }
    }
}
