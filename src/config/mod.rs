// SPDX-License-Identifier: MPL-2.0
//! Engine configuration.
//!
//! [`PlayerConfig`] is accepted once on `init` and fixes session-wide policy
//! (master clock source, stream disables, frame-drop behavior). Per-media
//! knobs travel in [`MediaOptions`] on each `open`. Both derive serde so an
//! embedding application can keep them in a TOML file.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

mod defaults;
pub use defaults::Tuning;

/// Which clock drives synchronization decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterSyncKind {
    /// Follow the audio clock (default; falls back when no audio stream).
    #[default]
    Audio,
    /// Follow the video clock.
    Video,
    /// Follow the free-running external clock.
    External,
}

/// When the refresh loop may drop late frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDropPolicy {
    /// Drop only when video is not the master clock.
    #[default]
    Auto,
    Always,
    Never,
}

impl FrameDropPolicy {
    #[must_use]
    pub fn allows_drop(self, video_is_master: bool) -> bool {
        match self {
            FrameDropPolicy::Always => true,
            FrameDropPolicy::Never => false,
            FrameDropPolicy::Auto => !video_is_master,
        }
    }
}

/// Whether seeks address bytes instead of timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekByBytes {
    /// Decide from the container (no usable timestamps => bytes).
    #[default]
    Auto,
    On,
    Off,
}

/// How video frame timestamps are normalized after decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtsReorderPolicy {
    /// Use the codec's best-effort timestamp.
    #[default]
    BestEffort,
    /// Use the decode timestamp.
    DecodeTime,
    /// Leave timestamps as produced.
    Raw,
}

/// Session-wide configuration, accepted on `init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub sync: MasterSyncKind,
    pub disable_audio: bool,
    pub disable_video: bool,
    pub disable_subtitles: bool,
    /// Ask the demuxer to synthesize missing presentation timestamps.
    pub generate_missing_pts: bool,
    /// Probe stream info on open. The backend couples probing with open, so
    /// disabling this only suppresses the extra stream detail logging.
    pub find_stream_info: bool,
    pub frame_drop: FrameDropPolicy,
    pub seek_by_bytes: SeekByBytes,
    pub pts_reorder: PtsReorderPolicy,
    pub tuning: Tuning,
}

/// Per-media options, accepted on `open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaOptions {
    /// Initial volume, 0.0..=1.0.
    pub start_volume: Option<f32>,
    /// Start playback this far into the media (milliseconds).
    pub start_time_ms: Option<i64>,
    /// Stop playback after this much media time (milliseconds).
    pub play_duration_ms: Option<i64>,
    /// Number of passes through the media; 0 means loop forever.
    pub loop_count: u32,
    /// Raise a completion event and stop reading at end of media.
    pub auto_exit: bool,
    /// Explicit stream index per media type; `None` selects the best stream.
    pub audio_stream: Option<usize>,
    pub video_stream: Option<usize>,
    pub subtitle_stream: Option<usize>,
    /// Forced decoder names, overriding the container's codec ids.
    pub forced_audio_codec: Option<String>,
    pub forced_video_codec: Option<String>,
    pub forced_subtitle_codec: Option<String>,
    /// Hardware decode device type by name ("vaapi", "cuda", "videotoolbox",
    /// ...). Unknown or unavailable devices fall back to software decoding.
    pub hw_accel: Option<String>,
    /// Allow non-spec-compliant decoder speedups.
    pub fast_decode: bool,
    /// Override the automatic infinite-buffer decision for live sources.
    pub infinite_buffer: Option<bool>,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            start_volume: None,
            start_time_ms: None,
            play_duration_ms: None,
            loop_count: 1,
            auto_exit: false,
            audio_stream: None,
            video_stream: None,
            subtitle_stream: None,
            forced_audio_codec: None,
            forced_video_codec: None,
            forced_subtitle_codec: None,
            hw_accel: None,
            fast_decode: false,
            infinite_buffer: None,
        }
    }
}

impl MediaOptions {
    /// Validates ranges that cannot be expressed in the type system.
    pub fn validate(&self) -> Result<()> {
        use crate::error::Error;
        if let Some(v) = self.start_volume {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::InvalidParameter(format!(
                    "start_volume {} outside 0.0..=1.0",
                    v
                )));
            }
        }
        if let Some(t) = self.start_time_ms {
            if t < 0 {
                return Err(Error::InvalidParameter(format!(
                    "start_time_ms {} is negative",
                    t
                )));
            }
        }
        if let Some(d) = self.play_duration_ms {
            if d <= 0 {
                return Err(Error::InvalidParameter(format!(
                    "play_duration_ms {} is not positive",
                    d
                )));
            }
        }
        Ok(())
    }
}

pub fn load_from_path(path: &Path) -> Result<PlayerConfig> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content).unwrap_or_default())
}

pub fn save_to_path(config: &PlayerConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}
