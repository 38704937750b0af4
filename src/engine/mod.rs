// SPDX-License-Identifier: MPL-2.0
//! The playback pipeline.
//!
//! Stages (source/demux, three decode loops, process, audio render, video
//! render) are connected by serial-tagged packet and frame queues and share
//! one [`session::Session`]. The three presentation clocks in the session
//! keep audio and video aligned; the sync math lives in [`sync`].

pub mod audio_decode;
pub mod audio_output;
pub mod clock;
pub mod decoder;
pub mod demux;
pub mod frame_queue;
pub mod frames;
pub mod packet_queue;
pub mod refresh;
pub mod session;
pub mod stage;
pub mod subtitle_decode;
pub mod sync;
pub mod video_decode;

/// Queue generation counter. Incremented on every flush/restart; tags queued
/// packets, frames and clocks so stale data is detectable after a seek.
pub type Serial = i32;
