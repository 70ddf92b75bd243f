//! Lokale Medien - Mikrofon Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Die Session ist reine
//! Sprachtelefonie, angefordert wird deshalb nur ein Audio-Gerät.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, Opus-Standard)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlay(String),
}

// ============================================================================
// MEDIA HANDLE
// ============================================================================

/// Handle auf das lokale Capture-Gerät plus Playback
///
/// Das Eingabegerät ist Pflicht: ohne Mikrofon schlägt `open()` sofort
/// fehl und der Anrufversuch endet, statt still ohne Ton zu laufen.
/// Playback ist Best-Effort.
///
/// Note: Stream ist nicht Send, daher wrappen wir in Send-fähige Container
pub struct MediaHandle {
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Ring-Buffer für zu spielendes Audio (decoded PCM)
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Enabled-Flag des Capture-Tracks (false = stumm)
    enabled: Arc<Mutex<bool>>,

    /// Audio Level (0.0 - 1.0) für Anzeige
    input_level: Arc<Mutex<f32>>,
    output_level: Arc<Mutex<f32>>,
}

// MediaHandle ist nicht automatisch Send wegen Stream
unsafe impl Send for MediaHandle {}

impl MediaHandle {
    /// Fordert das Audio-Gerät an und startet Capture und Playback
    pub fn open() -> Result<Self, MediaError> {
        let host = cpal::default_host();

        let input_device = host.default_input_device().ok_or(MediaError::NoInputDevice)?;
        let output_device = host.default_output_device();

        if output_device.is_none() {
            tracing::warn!("No audio output device found, playback disabled");
        }

        let mut handle = Self {
            input_stream: None,
            output_stream: None,
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            playback_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            enabled: Arc::new(Mutex::new(true)),
            input_level: Arc::new(Mutex::new(0.0)),
            output_level: Arc::new(Mutex::new(0.0)),
        };

        handle.start_capture(&input_device)?;

        if let Some(device) = output_device {
            if let Err(e) = handle.start_playback(&device) {
                tracing::warn!("Failed to start audio playback: {}", e);
            }
        }

        tracing::info!(
            "Media handle opened: {}Hz, {} channel(s)",
            SAMPLE_RATE,
            CHANNELS
        );

        Ok(handle)
    }

    /// Startet Audio Capture (Mikrofon)
    fn start_capture(&mut self, device: &Device) -> Result<(), MediaError> {
        let config = Self::find_best_input_config(device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let enabled = Arc::clone(&self.enabled);
        let input_level = Arc::clone(&self.input_level);
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Audio Level berechnen (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    // Bei deaktiviertem Track werden keine Samples geschrieben
                    if !*enabled.lock() {
                        return;
                    }

                    let samples = resample_linear(data, source_sample_rate, SAMPLE_RATE);

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::StreamPlay(e.to_string()))?;

        self.input_stream = Some(stream);
        Ok(())
    }

    /// Startet Audio Playback (Lautsprecher)
    fn start_playback(&mut self, device: &Device) -> Result<(), MediaError> {
        let config = Self::find_best_output_config(device)?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let output_level = Arc::clone(&self.output_level);
        let target_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = playback_buffer.lock();
                    let mut level_sum = 0.0f32;
                    let mut sample_count = 0;

                    let samples_needed = data.len() / channels;
                    let ratio = SAMPLE_RATE as f32 / target_sample_rate as f32;
                    let source_samples_needed = (samples_needed as f32 * ratio) as usize;

                    for i in 0..samples_needed {
                        let src_idx = (i as f32 * ratio) as usize;

                        let sample = if src_idx < source_samples_needed {
                            buffer.try_pop().unwrap_or(0.0)
                        } else {
                            0.0
                        };

                        level_sum += sample.abs();
                        sample_count += 1;

                        // Auf alle Kanäle verteilen
                        for c in 0..channels {
                            if let Some(s) = data.get_mut(i * channels + c) {
                                *s = sample;
                            }
                        }
                    }

                    if sample_count > 0 {
                        *output_level.lock() = (level_sum / sample_count as f32).min(1.0);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::StreamPlay(e.to_string()))?;

        self.output_stream = Some(stream);
        Ok(())
    }

    /// Gibt das Capture-Gerät und die Streams frei
    pub fn release(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
        tracing::info!("Media handle released");
    }

    /// Liest einen Frame von aufgenommenem Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    /// Schreibt empfangene Audio-Samples in den Playback-Buffer
    pub fn write_samples(&self, samples: &[f32]) {
        let mut buffer = self.playback_buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    /// Schaltet den Capture-Track ein oder aus
    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock() = enabled;
        tracing::debug!("Audio track enabled: {}", enabled);
    }

    /// Gibt zurück ob der Capture-Track aktiv ist
    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn levels(&self) -> (f32, f32) {
        (*self.input_level.lock(), *self.output_level.lock())
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Findet die beste Output-Konfiguration
    fn find_best_output_config(device: &Device) -> Result<StreamConfig, MediaError> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Wählt die beste Konfiguration aus einer Liste
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, MediaError> {
        // Priorität: 48kHz > andere Raten, F32 > andere Formate
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(MediaError::UnsupportedConfig(
            "No suitable audio configuration found".to_string(),
        ))
    }
}

/// Einfaches Linear-Resampling auf die Ziel-Rate
fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return data.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let data = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(resample_linear(&data, 48000, 48000), data);
    }

    #[test]
    fn test_resample_upsamples_length() {
        let data = vec![0.0; 441];
        let resampled = resample_linear(&data, 44100, 48000);
        // 441 Samples @ 44.1kHz entsprechen 480 Samples @ 48kHz
        assert_eq!(resampled.len(), 480);
    }

    #[test]
    fn test_resample_interpolates_between_samples() {
        // Verdoppelung der Rate: jeder zweite Wert liegt zwischen den Originalen
        let data = vec![0.0, 1.0];
        let resampled = resample_linear(&data, 100, 200);
        assert_eq!(resampled.len(), 4);
        assert!((resampled[0] - 0.0).abs() < f32::EPSILON);
        assert!((resampled[1] - 0.5).abs() < f32::EPSILON);
    }
}
