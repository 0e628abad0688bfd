//! Music on Hold (MOH) implementation
//!
//! Holds the validated hold-audio asset and serves 20 ms narrowband frames
//! to every call currently on hold.

use crate::config::MohConfig;
use crate::domain::audio::{WavFile, WavInfo, WavValidationError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 20 ms at 8 kHz
pub const FRAME_SAMPLES: usize = 160;

/// Hold audio ready for playback
#[derive(Debug, Clone)]
pub struct HoldAsset {
    /// File path or upload name
    pub source: String,
    pub info: WavInfo,
    /// Mono 8 kHz PCM
    samples: Arc<Vec<i16>>,
    pub loaded_at: DateTime<Utc>,
}

/// Simple tone generator for MOH (as fallback)
/// Generates a simple sine wave tone
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    frequency: f32,
    sample_rate: u32,
    amplitude: f32,
    phase: f32,
}

impl ToneGenerator {
    pub fn new(frequency: f32, sample_rate: u32, amplitude: f32) -> Self {
        Self {
            frequency,
            sample_rate,
            amplitude,
            phase: 0.0,
        }
    }

    /// 440 Hz at 8 kHz, 0.3 amplitude
    pub fn default_tone() -> Self {
        Self::new(440.0, 8000, 0.3)
    }

    pub fn next_sample(&mut self) -> i16 {
        let sample = self.amplitude * (self.phase * 2.0 * std::f32::consts::PI).sin();

        self.phase += self.frequency / self.sample_rate as f32;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }

        (sample * 32767.0) as i16
    }

    pub fn fill(&mut self, frame: &mut [i16]) {
        for slot in frame.iter_mut() {
            *slot = self.next_sample();
        }
    }
}

#[derive(Debug, Clone)]
struct Playback {
    started_at: DateTime<Utc>,
    position: usize,
    tone: ToneGenerator,
}

/// MOH status for the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MohStatus {
    pub enabled: bool,
    pub source: Option<String>,
    pub asset: Option<WavInfo>,
    pub tone_fallback: bool,
    pub active_playbacks: usize,
}

pub struct MohManager {
    config: RwLock<MohConfig>,
    asset: RwLock<Option<Arc<HoldAsset>>>,
    playbacks: RwLock<HashMap<String, Playback>>,
}

impl MohManager {
    pub fn new(config: MohConfig) -> Self {
        Self {
            config: RwLock::new(config),
            asset: RwLock::new(None),
            playbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Load the asset named by `audio_path`, if any
    pub fn load_configured(&self) -> Result<Option<WavInfo>, WavValidationError> {
        let path = self.config.read().audio_path.clone();
        match path {
            Some(path) => self.load_file(&path).map(Some),
            None => Ok(None),
        }
    }

    pub fn load_file(&self, path: &Path) -> Result<WavInfo, WavValidationError> {
        let (wav, info) = WavFile::from_file(path)?;
        self.install(path.display().to_string(), wav, info.clone());
        Ok(info)
    }

    /// Validate and install uploaded bytes
    pub fn load_bytes(&self, name: &str, bytes: &[u8]) -> Result<WavInfo, WavValidationError> {
        let (wav, info) = WavFile::from_bytes(bytes)?;
        self.install(name.to_string(), wav, info.clone());
        Ok(info)
    }

    fn install(&self, source: String, wav: WavFile, info: WavInfo) {
        for warning in &info.warnings {
            warn!("Hold audio {}: {}", source, warning);
        }
        info!(
            "Hold audio {} loaded ({:.1}s, {} Hz, {} ch)",
            source, info.duration_secs, info.sample_rate, info.channels
        );

        let asset = HoldAsset {
            source,
            info,
            samples: Arc::new(wav.narrowband_samples()),
            loaded_at: Utc::now(),
        };
        *self.asset.write() = Some(Arc::new(asset));

        // Running playbacks restart at the top of the new asset
        for playback in self.playbacks.write().values_mut() {
            playback.position = 0;
        }
    }

    pub fn clear_asset(&self) {
        *self.asset.write() = None;
    }

    pub fn asset(&self) -> Option<Arc<HoldAsset>> {
        self.asset.read().clone()
    }

    /// Begin playback for a call; false if it was already playing
    pub fn start(&self, call_id: &str) -> bool {
        let mut playbacks = self.playbacks.write();
        if playbacks.contains_key(call_id) {
            return false;
        }
        playbacks.insert(
            call_id.to_string(),
            Playback {
                started_at: Utc::now(),
                position: 0,
                tone: ToneGenerator::default_tone(),
            },
        );
        debug!("MOH started for {}", call_id);
        true
    }

    pub fn stop(&self, call_id: &str) -> bool {
        let stopped = self.playbacks.write().remove(call_id).is_some();
        if stopped {
            debug!("MOH stopped for {}", call_id);
        }
        stopped
    }

    pub fn is_playing(&self, call_id: &str) -> bool {
        self.playbacks.read().contains_key(call_id)
    }

    pub fn playing_since(&self, call_id: &str) -> Option<DateTime<Utc>> {
        self.playbacks.read().get(call_id).map(|p| p.started_at)
    }

    pub fn active_count(&self) -> usize {
        self.playbacks.read().len()
    }

    /// Next 20 ms frame for a call on hold, looping the asset
    pub fn next_frame(&self, call_id: &str) -> Option<Vec<i16>> {
        let asset = self.asset();
        let tone_fallback = self.config.read().tone_fallback;

        let mut playbacks = self.playbacks.write();
        let playback = playbacks.get_mut(call_id)?;
        let mut frame = vec![0i16; FRAME_SAMPLES];

        match asset.as_ref().filter(|a| !a.samples.is_empty()) {
            Some(asset) => {
                let samples = &asset.samples;
                for slot in frame.iter_mut() {
                    *slot = samples[playback.position % samples.len()];
                    playback.position = (playback.position + 1) % samples.len();
                }
            }
            None if tone_fallback => playback.tone.fill(&mut frame),
            None => {}
        }

        Some(frame)
    }

    pub fn reload(&self, config: MohConfig) {
        let path_changed = self.config.read().audio_path != config.audio_path;
        *self.config.write() = config;

        if path_changed {
            match self.load_configured() {
                Ok(Some(_)) => {}
                Ok(None) => self.clear_asset(),
                // Keep serving the previous asset
                Err(e) => warn!("Hold audio reload rejected: {}", e),
            }
        }
    }

    pub fn status(&self) -> MohStatus {
        let config = self.config.read().clone();
        let asset = self.asset();
        MohStatus {
            enabled: config.enabled,
            source: asset.as_ref().map(|a| a.source.clone()),
            asset: asset.map(|a| a.info.clone()),
            tone_fallback: config.tone_fallback,
            active_playbacks: self.active_count(),
        }
    }
}
