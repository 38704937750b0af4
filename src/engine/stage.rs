// SPDX-License-Identifier: MPL-2.0
//! The playback pipeline as an explicit chain of stages.
//!
//! A [`Chain`] owns an ordered list of [`Stage`]s. Opening and starting walk
//! the list front to back; stopping walks it back to front so downstream
//! consumers release before their producers. Each stage owns at most one
//! background thread and joins it in `stop` (the session is aborted first, so
//! joins are bounded).
//!
//! Stages communicate only through the [`ChainContext`]: the source stage
//! fills in the opened media, decode stages take their decoder halves out of
//! it, and the audio render stage publishes the negotiated device format
//! before the audio decode thread starts.

use super::audio_decode::{self, AudioDecodeParams};
use super::audio_output::AudioOutput;
use super::demux::{self, OpenedMedia, ReaderSetup};
use super::refresh::{self, VideoOutput};
use super::session::{SeekRequest, Session};
use super::subtitle_decode::{self, SubtitleDecodeParams};
use super::video_decode::{self, VideoDecodeParams};
use crate::config::{MediaOptions, PlayerConfig};
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::player::PlayerEvent;
use crate::volume::Volume;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Shared working state threaded through the chain.
pub struct ChainContext {
    pub session: Arc<Session>,
    pub config: PlayerConfig,
    pub options: MediaOptions,
    pub url: String,
    pub media: Option<OpenedMedia>,
    pub video_out: Option<Arc<dyn VideoOutput>>,
    /// `(sample_rate, channels)` once the output device is negotiated.
    pub device: Option<(u32, u16)>,
    pub logger: Logger,
}

pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Acquires resources. Runs front to back before any `start`.
    fn open(&mut self, _ctx: &mut ChainContext) -> Result<()> {
        Ok(())
    }

    /// Spawns the stage's background work.
    fn start(&mut self, _ctx: &mut ChainContext) -> Result<()> {
        Ok(())
    }

    fn pause(&mut self) {}
    fn resume(&mut self) {}

    /// Joins background work. The session is already aborted when called.
    fn stop(&mut self) {}
}

fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| Error::ResourceCreation(format!("thread {}: {}", name, e)))
}

// ---------------------------------------------------------------------------

/// Opens the container and publishes stream facts into the session.
pub struct SourceStage;

impl Stage for SourceStage {
    fn name(&self) -> &'static str {
        "source"
    }

    fn open(&mut self, ctx: &mut ChainContext) -> Result<()> {
        let media = demux::open_media(&ctx.url, &ctx.config, &ctx.options, &ctx.logger)?;
        let session = &ctx.session;
        session.has_audio.store(media.audio.is_some(), Ordering::Relaxed);
        session.has_video.store(media.video.is_some(), Ordering::Relaxed);
        session
            .has_subtitles
            .store(media.subtitle.is_some(), Ordering::Relaxed);
        session.realtime.store(media.realtime, Ordering::Relaxed);
        session.set_max_frame_duration(media.max_frame_duration);
        if let Some(duration) = media.duration_ms {
            session.set_duration_ms(duration);
        }
        let infinite = ctx.options.infinite_buffer.unwrap_or(media.realtime);
        session.infinite_buffer.store(infinite, Ordering::Relaxed);
        ctx.media = Some(media);
        session.fire_event(PlayerEvent::Opened);
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// Owns the reader thread that pulls packets out of the container.
pub struct DemuxStage {
    setup: Option<SetupFacts>,
    handle: Option<JoinHandle<()>>,
}

struct SetupFacts {
    audio: Option<demux::StreamBinding>,
    video: Option<demux::StreamBinding>,
    subtitle: Option<demux::StreamBinding>,
    seek_by_bytes: bool,
}

impl DemuxStage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            setup: None,
            handle: None,
        }
    }
}

impl Default for DemuxStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for DemuxStage {
    fn name(&self) -> &'static str {
        "demux"
    }

    fn open(&mut self, ctx: &mut ChainContext) -> Result<()> {
        let media = ctx
            .media
            .as_ref()
            .ok_or_else(|| Error::ResourceCreation("demux: no opened media".to_string()))?;
        self.setup = Some(SetupFacts {
            audio: media.audio.as_ref().map(|(b, _)| *b),
            video: media.video.as_ref().map(|(b, _)| *b),
            subtitle: media.subtitle.as_ref().map(|(b, _)| *b),
            seek_by_bytes: media.seek_by_bytes,
        });
        // Packet queues accept input from here on; starting also bumps the
        // generation so stale state from a previous run is invisible.
        let session = &ctx.session;
        session.audioq.start();
        session.videoq.start();
        session.subtitleq.start();
        Ok(())
    }

    fn start(&mut self, ctx: &mut ChainContext) -> Result<()> {
        let facts = self
            .setup
            .take()
            .ok_or_else(|| Error::ResourceCreation("demux: not opened".to_string()))?;
        let media = ctx
            .media
            .take()
            .ok_or_else(|| Error::ResourceCreation("demux: media already taken".to_string()))?;
        let setup = ReaderSetup {
            input: media.input,
            audio: facts.audio,
            video: facts.video,
            subtitle: facts.subtitle,
            seek_by_bytes: facts.seek_by_bytes,
            start_time_ms: ctx.session.start_time_ms.load(Ordering::Relaxed),
            play_duration_ms: ctx.options.play_duration_ms,
        };
        let session = Arc::clone(&ctx.session);
        let logger = ctx.logger.clone();
        self.handle = Some(spawn_named("reelplay-demux", move || {
            demux::run_reader(&session, setup, logger);
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------

pub struct AudioDecodeStage {
    taken: Option<(demux::StreamBinding, ffmpeg_next::decoder::Audio)>,
    handle: Option<JoinHandle<()>>,
}

impl AudioDecodeStage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            taken: None,
            handle: None,
        }
    }
}

impl Default for AudioDecodeStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for AudioDecodeStage {
    fn name(&self) -> &'static str {
        "audio-decode"
    }

    fn open(&mut self, ctx: &mut ChainContext) -> Result<()> {
        if let Some(media) = ctx.media.as_mut() {
            self.taken = media.audio.take();
        }
        Ok(())
    }

    fn start(&mut self, ctx: &mut ChainContext) -> Result<()> {
        let Some((binding, decoder)) = self.taken.take() else {
            return Ok(());
        };
        // No output device: the render stage already demoted audio.
        let Some((device_rate, device_channels)) = ctx.device else {
            return Ok(());
        };
        let params = AudioDecodeParams {
            binding,
            decoder,
            device_rate,
            device_channels,
        };
        let session = Arc::clone(&ctx.session);
        let logger = ctx.logger.clone();
        self.handle = Some(spawn_named("reelplay-audio-dec", move || {
            audio_decode::run(&session, params, logger);
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------

pub struct VideoDecodeStage {
    taken: Option<(demux::StreamBinding, ffmpeg_next::decoder::Video)>,
    handle: Option<JoinHandle<()>>,
}

impl VideoDecodeStage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            taken: None,
            handle: None,
        }
    }
}

impl Default for VideoDecodeStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for VideoDecodeStage {
    fn name(&self) -> &'static str {
        "video-decode"
    }

    fn open(&mut self, ctx: &mut ChainContext) -> Result<()> {
        if let Some(media) = ctx.media.as_mut() {
            self.taken = media.video.take();
        }
        Ok(())
    }

    fn start(&mut self, ctx: &mut ChainContext) -> Result<()> {
        let Some((binding, decoder)) = self.taken.take() else {
            return Ok(());
        };
        let params = VideoDecodeParams {
            binding,
            decoder,
            frame_drop: ctx.config.frame_drop,
            pts_policy: ctx.config.pts_reorder,
        };
        let session = Arc::clone(&ctx.session);
        let logger = ctx.logger.clone();
        self.handle = Some(spawn_named("reelplay-video-dec", move || {
            video_decode::run(&session, params, logger);
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------

pub struct SubtitleDecodeStage {
    taken: Option<(demux::StreamBinding, ffmpeg_next::decoder::Subtitle)>,
    handle: Option<JoinHandle<()>>,
}

impl SubtitleDecodeStage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            taken: None,
            handle: None,
        }
    }
}

impl Default for SubtitleDecodeStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for SubtitleDecodeStage {
    fn name(&self) -> &'static str {
        "subtitle-decode"
    }

    fn open(&mut self, ctx: &mut ChainContext) -> Result<()> {
        if let Some(media) = ctx.media.as_mut() {
            self.taken = media.subtitle.take();
        }
        Ok(())
    }

    fn start(&mut self, ctx: &mut ChainContext) -> Result<()> {
        let Some((binding, decoder)) = self.taken.take() else {
            return Ok(());
        };
        let params = SubtitleDecodeParams { binding, decoder };
        let session = Arc::clone(&ctx.session);
        let logger = ctx.logger.clone();
        self.handle = Some(spawn_named("reelplay-sub-dec", move || {
            subtitle_decode::run(&session, params, logger);
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------

/// Applies per-media options to the session before rendering starts.
pub struct ProcessStage;

impl Stage for ProcessStage {
    fn name(&self) -> &'static str {
        "process"
    }

    fn open(&mut self, ctx: &mut ChainContext) -> Result<()> {
        let session = &ctx.session;
        let options = &ctx.options;
        if let Some(volume) = options.start_volume {
            session.set_volume(Volume::new(volume));
        }
        session.set_loop_count(options.loop_count);
        session.auto_exit.store(options.auto_exit, Ordering::Relaxed);
        if let Some(start) = options.start_time_ms {
            session.start_time_ms.store(start, Ordering::Relaxed);
            if start > 0 {
                session.request_seek(SeekRequest {
                    target_ms: start,
                    accurate: false,
                });
            }
        }
        if let Some(duration) = options.play_duration_ms {
            session.play_duration_ms.store(duration, Ordering::Relaxed);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// Owns the audio device. Failure to open it demotes audio instead of
/// failing playback, so video-only machines still work.
pub struct AudioRenderStage {
    output: Option<AudioOutput>,
}

impl AudioRenderStage {
    #[must_use]
    pub fn new() -> Self {
        Self { output: None }
    }
}

impl Default for AudioRenderStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for AudioRenderStage {
    fn name(&self) -> &'static str {
        "audio-render"
    }

    fn open(&mut self, ctx: &mut ChainContext) -> Result<()> {
        if !ctx.session.has_audio.load(Ordering::Relaxed) {
            return Ok(());
        }
        match AudioOutput::new(Arc::clone(&ctx.session), ctx.logger.clone()) {
            Ok(output) => {
                ctx.device = Some((output.sample_rate(), output.channels()));
                self.output = Some(output);
            }
            Err(e) => {
                ctx.logger
                    .error(&format!("audio device unavailable, playing without audio: {}", e));
                ctx.session.has_audio.store(false, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(output) = &self.output {
            output.pause();
        }
    }

    fn resume(&mut self) {
        if let Some(output) = &self.output {
            output.resume();
        }
    }

    fn stop(&mut self) {
        // Dropping joins the device thread.
        self.output = None;
    }
}

// ---------------------------------------------------------------------------

/// Owns the refresh thread. Spawned even for audio-only media so position
/// reporting and completion detection keep running.
pub struct VideoRenderStage {
    handle: Option<JoinHandle<()>>,
}

impl VideoRenderStage {
    #[must_use]
    pub fn new() -> Self {
        Self { handle: None }
    }
}

impl Default for VideoRenderStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for VideoRenderStage {
    fn name(&self) -> &'static str {
        "video-render"
    }

    fn start(&mut self, ctx: &mut ChainContext) -> Result<()> {
        let session = Arc::clone(&ctx.session);
        let video_out = ctx.video_out.clone();
        let frame_drop = ctx.config.frame_drop;
        let logger = ctx.logger.clone();
        self.handle = Some(spawn_named("reelplay-refresh", move || {
            refresh::run(&session, video_out, frame_drop, logger);
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------

/// Ordered stage list with front-to-back startup and reverse teardown.
pub struct Chain {
    stages: Vec<Box<dyn Stage>>,
}

impl Chain {
    /// The standard playback chain.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            stages: vec![
                Box::new(SourceStage),
                Box::new(DemuxStage::new()),
                Box::new(AudioDecodeStage::new()),
                Box::new(VideoDecodeStage::new()),
                Box::new(SubtitleDecodeStage::new()),
                Box::new(ProcessStage),
                Box::new(AudioRenderStage::new()),
                Box::new(VideoRenderStage::new()),
            ],
        }
    }

    #[must_use]
    pub fn from_stages(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn open(&mut self, ctx: &mut ChainContext) -> Result<()> {
        for stage in &mut self.stages {
            stage
                .open(ctx)
                .map_err(|e| {
                    ctx.logger.error(&format!("{}: open failed: {}", stage.name(), e));
                    e
                })?;
        }
        Ok(())
    }

    pub fn start(&mut self, ctx: &mut ChainContext) -> Result<()> {
        for stage in &mut self.stages {
            stage.start(ctx)?;
        }
        Ok(())
    }

    pub fn pause(&mut self) {
        for stage in &mut self.stages {
            stage.pause();
        }
    }

    pub fn resume(&mut self) {
        for stage in &mut self.stages {
            stage.resume();
        }
    }

    /// Reverse-order teardown. The caller aborts the session first so every
    /// join is bounded.
    pub fn stop(&mut self) {
        for stage in self.stages.iter_mut().rev() {
            stage.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Stage for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        fn open(&mut self, _ctx: &mut ChainContext) -> Result<()> {
            self.log.lock().unwrap().push(format!("open {}", self.label));
            Ok(())
        }

        fn start(&mut self, _ctx: &mut ChainContext) -> Result<()> {
            self.log.lock().unwrap().push(format!("start {}", self.label));
            Ok(())
        }

        fn stop(&mut self) {
            self.log.lock().unwrap().push(format!("stop {}", self.label));
        }
    }

    fn context() -> ChainContext {
        let config = PlayerConfig::default();
        let session = Arc::new(Session::new(&config, Logger::none()));
        ChainContext {
            session,
            config,
            options: MediaOptions::default(),
            url: String::new(),
            media: None,
            video_out: None,
            device: None,
            logger: Logger::none(),
        }
    }

    #[test]
    fn chain_runs_forward_and_stops_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::from_stages(vec![
            Box::new(Recorder {
                label: "a",
                log: Arc::clone(&log),
            }),
            Box::new(Recorder {
                label: "b",
                log: Arc::clone(&log),
            }),
        ]);
        let mut ctx = context();
        chain.open(&mut ctx).unwrap();
        chain.start(&mut ctx).unwrap();
        chain.stop();

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec!["open a", "open b", "start a", "start b", "stop b", "stop a"]
        );
    }

    #[test]
    fn process_stage_applies_media_options() {
        let mut ctx = context();
        ctx.options.start_volume = Some(0.5);
        ctx.options.loop_count = 3;
        ctx.options.start_time_ms = Some(2000);
        ProcessStage.open(&mut ctx).unwrap();

        assert_eq!(ctx.session.mixer_level(), 64);
        assert!(ctx.session.is_looping());
        let seek = ctx.session.take_seek().unwrap();
        assert_eq!(seek.target_ms, 2000);
    }

    #[test]
    fn demux_stage_requires_opened_media() {
        let mut ctx = context();
        let mut stage = DemuxStage::new();
        assert!(stage.open(&mut ctx).is_err());
    }
}
