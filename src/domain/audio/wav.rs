/// WAV file parsing and hold-audio validation
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Largest accepted upload
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;
pub const MIN_DURATION_SECS: f64 = 1.0;
pub const MAX_DURATION_SECS: f64 = 300.0;
pub const SUPPORTED_SAMPLE_RATES: [u32; 2] = [8000, 16000];
pub const SUPPORTED_BIT_DEPTHS: [u16; 2] = [8, 16];

const WAVE_FORMAT_PCM: u16 = 1;

/// Validation failure codes, one per violated constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WavErrorCode {
    InvalidFormat,
    UnsupportedCodec,
    InvalidSampleRate,
    InvalidBitDepth,
    InvalidChannels,
    FileTooLarge,
    FileTooShort,
    FileTooLong,
    CorruptFile,
}

impl WavErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WavErrorCode::InvalidFormat => "INVALID_FORMAT",
            WavErrorCode::UnsupportedCodec => "UNSUPPORTED_CODEC",
            WavErrorCode::InvalidSampleRate => "INVALID_SAMPLE_RATE",
            WavErrorCode::InvalidBitDepth => "INVALID_BIT_DEPTH",
            WavErrorCode::InvalidChannels => "INVALID_CHANNELS",
            WavErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            WavErrorCode::FileTooShort => "FILE_TOO_SHORT",
            WavErrorCode::FileTooLong => "FILE_TOO_LONG",
            WavErrorCode::CorruptFile => "CORRUPT_FILE",
        }
    }
}

impl fmt::Display for WavErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct WavValidationError {
    pub code: WavErrorCode,
    pub message: String,
}

impl WavValidationError {
    fn new(code: WavErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// WAV audio format
#[derive(Debug, Clone, PartialEq)]
pub struct WavFormat {
    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Bits per sample
    pub bits_per_sample: u16,
    /// Audio format code (1 = PCM)
    pub audio_format: u16,
}

impl WavFormat {
    /// Get bytes per sample
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample / 8) as usize
    }

    /// Get bytes per frame (all channels)
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// Calculate duration in seconds
    pub fn calculate_duration(&self, data_size: usize) -> f64 {
        let frame = self.bytes_per_frame();
        if frame == 0 || self.sample_rate == 0 {
            return 0.0;
        }
        (data_size / frame) as f64 / self.sample_rate as f64
    }
}

/// Result of a successful validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub duration_secs: f64,
    pub data_size: usize,
    /// Non-fatal notes (stereo, wideband)
    pub warnings: Vec<String>,
}

/// Validate a hold-audio asset
pub fn validate(bytes: &[u8]) -> Result<WavInfo, WavValidationError> {
    WavFile::from_bytes(bytes).map(|(_, info)| info)
}

/// Validated WAV file held in memory
#[derive(Debug, Clone)]
pub struct WavFile {
    pub format: WavFormat,
    /// Raw audio data (PCM samples)
    pub data: Arc<Vec<u8>>,
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl WavFile {
    /// Load and validate a WAV file from path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<(Self, WavInfo), WavValidationError> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| {
            WavValidationError::new(
                WavErrorCode::CorruptFile,
                format!("Cannot read {}: {}", path.display(), e),
            )
        })?;
        if metadata.len() > MAX_FILE_SIZE as u64 {
            return Err(WavValidationError::new(
                WavErrorCode::FileTooLarge,
                format!(
                    "File is {} bytes, maximum is {} bytes",
                    metadata.len(),
                    MAX_FILE_SIZE
                ),
            ));
        }
        let bytes = std::fs::read(path).map_err(|e| {
            WavValidationError::new(
                WavErrorCode::CorruptFile,
                format!("Cannot read {}: {}", path.display(), e),
            )
        })?;
        Self::from_bytes(&bytes)
    }

    /// Parse and validate an in-memory WAV file
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, WavInfo), WavValidationError> {
        use WavErrorCode::*;

        if bytes.len() > MAX_FILE_SIZE {
            return Err(WavValidationError::new(
                FileTooLarge,
                format!(
                    "File is {} bytes, maximum is {} bytes",
                    bytes.len(),
                    MAX_FILE_SIZE
                ),
            ));
        }

        // RIFF header
        if bytes.len() < 12 || &bytes[0..4] != b"RIFF" {
            return Err(WavValidationError::new(
                InvalidFormat,
                "Missing RIFF signature",
            ));
        }
        if &bytes[8..12] != b"WAVE" {
            return Err(WavValidationError::new(InvalidFormat, "Not a WAVE file"));
        }

        let mut format: Option<WavFormat> = None;
        let mut data: Option<(usize, usize)> = None;
        let mut pos = 12;

        while pos + 8 <= bytes.len() {
            let chunk_id = &bytes[pos..pos + 4];
            let chunk_size = read_u32(bytes, pos + 4) as usize;
            let body = pos + 8;

            match chunk_id {
                b"fmt " => {
                    if chunk_size < 16 || body + 16 > bytes.len() {
                        return Err(WavValidationError::new(
                            CorruptFile,
                            "fmt chunk is truncated",
                        ));
                    }
                    format = Some(Self::parse_fmt_chunk(&bytes[body..body + 16])?);
                }
                b"data" => {
                    // Declared size is kept even if the file is cut short
                    data = Some((body, chunk_size));
                    break;
                }
                _ => {}
            }

            // Chunks are word-aligned
            pos = body.saturating_add(chunk_size).saturating_add(chunk_size % 2);
        }

        let format =
            format.ok_or_else(|| WavValidationError::new(InvalidFormat, "Missing fmt chunk"))?;
        let (data_start, declared_size) =
            data.ok_or_else(|| WavValidationError::new(InvalidFormat, "Missing data chunk"))?;

        let duration = format.calculate_duration(declared_size);
        if duration > MAX_DURATION_SECS {
            return Err(WavValidationError::new(
                FileTooLong,
                format!(
                    "Duration {:.1}s exceeds maximum of {:.0}s",
                    duration, MAX_DURATION_SECS
                ),
            ));
        }
        if duration < MIN_DURATION_SECS {
            return Err(WavValidationError::new(
                FileTooShort,
                format!(
                    "Duration {:.2}s is below minimum of {:.0}s",
                    duration, MIN_DURATION_SECS
                ),
            ));
        }

        let available = bytes.len() - data_start;
        if declared_size > available {
            return Err(WavValidationError::new(
                CorruptFile,
                format!(
                    "data chunk declares {} bytes but only {} are present",
                    declared_size, available
                ),
            ));
        }

        let mut warnings = Vec::new();
        if format.channels == 2 {
            warnings.push("Stereo audio will be mixed down to mono for playback".to_string());
        }
        if format.sample_rate == 16000 {
            warnings.push(
                "16 kHz audio will be downsampled to 8 kHz for narrowband calls".to_string(),
            );
        }

        let info = WavInfo {
            sample_rate: format.sample_rate,
            channels: format.channels,
            bits_per_sample: format.bits_per_sample,
            duration_secs: duration,
            data_size: declared_size,
            warnings,
        };
        let wav = WavFile {
            format,
            data: Arc::new(bytes[data_start..data_start + declared_size].to_vec()),
        };
        Ok((wav, info))
    }

    /// Parse fmt chunk
    fn parse_fmt_chunk(fmt_data: &[u8]) -> Result<WavFormat, WavValidationError> {
        use WavErrorCode::*;

        let audio_format = read_u16(fmt_data, 0);
        let channels = read_u16(fmt_data, 2);
        let sample_rate = read_u32(fmt_data, 4);
        let block_align = read_u16(fmt_data, 12);
        let bits_per_sample = read_u16(fmt_data, 14);

        // Only support PCM format
        if audio_format != WAVE_FORMAT_PCM {
            return Err(WavValidationError::new(
                UnsupportedCodec,
                format!("Only PCM (format 1) is supported, got format {}", audio_format),
            ));
        }

        if channels != 1 && channels != 2 {
            return Err(WavValidationError::new(
                InvalidChannels,
                format!("Channels must be 1 or 2, got {}", channels),
            ));
        }

        if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
            return Err(WavValidationError::new(
                InvalidSampleRate,
                format!("Sample rate must be 8000 or 16000 Hz, got {}", sample_rate),
            ));
        }

        if !SUPPORTED_BIT_DEPTHS.contains(&bits_per_sample) {
            return Err(WavValidationError::new(
                InvalidBitDepth,
                format!("Bits per sample must be 8 or 16, got {}", bits_per_sample),
            ));
        }

        let format = WavFormat {
            channels,
            sample_rate,
            bits_per_sample,
            audio_format,
        };
        if block_align as usize != format.bytes_per_frame() {
            return Err(WavValidationError::new(
                CorruptFile,
                format!(
                    "Block align {} does not match {} channel(s) of {} bits",
                    block_align, channels, bits_per_sample
                ),
            ));
        }

        Ok(format)
    }

    /// Get audio duration in seconds
    pub fn duration(&self) -> f64 {
        self.format.calculate_duration(self.data.len())
    }

    /// Get audio data as signed 16-bit samples
    pub fn samples_i16(&self) -> Vec<i16> {
        match self.format.bits_per_sample {
            // 8-bit WAV is unsigned
            8 => self.data.iter().map(|&b| ((b as i16) - 128) * 256).collect(),
            _ => self
                .data
                .chunks_exact(2)
                .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
                .collect(),
        }
    }

    /// Mono 8 kHz samples for narrowband playback
    pub fn narrowband_samples(&self) -> Vec<i16> {
        let samples = self.samples_i16();
        let mono: Vec<i16> = if self.format.channels == 2 {
            samples
                .chunks_exact(2)
                .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
                .collect()
        } else {
            samples
        };

        if self.format.sample_rate == 16000 {
            // Average each pair before dropping to half rate
            mono.chunks_exact(2)
                .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
                .collect()
        } else {
            mono
        }
    }
}

/// Build a PCM WAV image; used by tests and tone rendering
pub fn encode_pcm(sample_rate: u32, channels: u16, bits_per_sample: u16, data: &[u8]) -> Vec<u8> {
    let block_align = channels * (bits_per_sample / 8);
    let byte_rate = sample_rate * block_align as u32;
    let mut out = Vec::with_capacity(44 + data.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&WAVE_FORMAT_PCM.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}
