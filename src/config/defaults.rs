// SPDX-License-Identifier: MPL-2.0
//! Tuning parameters for the synchronization engine.
//!
//! These values encode tuned playback behavior rather than protocol
//! requirements, so they are plain named fields with documented defaults
//! that callers may override on `init`.

use serde::{Deserialize, Serialize};

/// Empirical sync and buffering constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// No A/V correction is done below this minimum threshold (seconds).
    pub sync_threshold_min: f64,
    /// No A/V correction is done above this maximum threshold (seconds).
    pub sync_threshold_max: f64,
    /// Nominal delays above this are duplicated instead of stretched (seconds).
    pub sync_framedup_threshold: f64,
    /// Beyond this A/V difference sync is abandoned and clocks snap (seconds).
    pub nosync_threshold: f64,
    /// Averaging window (in buffers) for the audio clock difference.
    pub audio_diff_avg_nb: u32,
    /// Maximum audio speed change per correction, as a fraction (0.1 = 10%).
    pub sample_correction_percent_max: f64,
    /// External clock speed is lowered below this queued-frame count.
    pub external_clock_min_frames: usize,
    /// External clock speed is raised above this queued-frame count.
    pub external_clock_max_frames: usize,
    /// Minimum external clock speed.
    pub external_clock_speed_min: f64,
    /// Maximum external clock speed.
    pub external_clock_speed_max: f64,
    /// External clock speed adjustment step.
    pub external_clock_speed_step: f64,
    /// Total queued compressed bytes across streams before the reader stalls.
    pub max_queue_bytes: usize,
    /// Per-stream packet count considered "enough" by the reader.
    pub min_frames: usize,
    /// Refresh loop poll interval while playing (seconds).
    pub refresh_interval: f64,
    /// Reader retry interval while queues are full (seconds).
    pub reader_wait_interval: f64,
    /// Video frame ring capacity.
    pub video_queue_size: usize,
    /// Subtitle ring capacity.
    pub subtitle_queue_size: usize,
    /// Audio sample-block ring capacity.
    pub sample_queue_size: usize,
    /// Completion is reported when position is within this of duration (ms).
    pub completion_epsilon_ms: i64,
    /// Window below the target used by an accurate seek (seconds).
    pub accurate_seek_window: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            sync_threshold_min: 0.04,
            sync_threshold_max: 0.1,
            sync_framedup_threshold: 0.1,
            nosync_threshold: 10.0,
            audio_diff_avg_nb: 20,
            sample_correction_percent_max: 0.10,
            external_clock_min_frames: 2,
            external_clock_max_frames: 10,
            external_clock_speed_min: 0.900,
            external_clock_speed_max: 1.010,
            external_clock_speed_step: 0.001,
            max_queue_bytes: 15 * 1024 * 1024,
            min_frames: 25,
            refresh_interval: 0.01,
            reader_wait_interval: 0.01,
            video_queue_size: 3,
            subtitle_queue_size: 16,
            sample_queue_size: 9,
            completion_epsilon_ms: 100,
            accurate_seek_window: 1.0,
        }
    }
}

impl Tuning {
    /// Exponential averaging coefficient derived from the window size, such
    /// that the oldest buffer in the window contributes about 1%.
    #[must_use]
    pub fn audio_diff_avg_coef(&self) -> f64 {
        (0.01f64.ln() / f64::from(self.audio_diff_avg_nb)).exp()
    }
}
