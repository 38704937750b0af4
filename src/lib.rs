// SPDX-License-Identifier: MPL-2.0
//! `reelplay` is a reusable media playback engine.
//!
//! Given a URL or file it demultiplexes, decodes, synchronizes and presents
//! audio, video and subtitle streams with the usual transport controls
//! (play/pause/seek/stop/volume/loop/speed). Decoding is backed by FFmpeg,
//! audio output by cpal; video frames are delivered fully converted (packed
//! RGBA) to a [`VideoOutput`] implementation supplied by the embedding
//! application, so the engine never owns a window.
//!
//! The core is a chain of pipeline stages connected by serial-tagged packet
//! and frame queues, kept in lockstep by a three-clock (audio/video/external)
//! synchronization model. See [`Player`] for the public surface.

#![doc(html_root_url = "https://docs.rs/reelplay/0.1.0")]

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod player;
pub mod volume;

#[cfg(test)]
pub mod test_utils;

pub use config::{FrameDropPolicy, MasterSyncKind, MediaOptions, PlayerConfig, SeekByBytes, Tuning};
pub use engine::frames::{
    AudioSamples, Rotation, ScaleMode, SubtitleEntry, VideoPicture, VideoTransform,
};
pub use engine::refresh::VideoOutput;
pub use error::{Error, Result};
pub use logging::{LogLevel, LogSink, Logger};
pub use player::{Player, PlayerEvent, PlayerState};
pub use volume::Volume;
