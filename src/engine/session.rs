// SPDX-License-Identifier: MPL-2.0
//! Shared playback session state.
//!
//! One [`Session`] exists per open media; every stage and background loop
//! holds an `Arc` to it. The queues and clocks serialize internally; the
//! remaining shared fields are atomics. Fields documented as reader-only
//! (`last_paused`, the seek mailbox consumption) are written by exactly one
//! thread.

use super::clock::{now_secs, Clock};
use super::frame_queue::FrameQueue;
use super::frames::{AudioSamples, SubtitleEntry, VideoPicture, VideoTransform};
use super::packet_queue::PacketQueue;
use super::Serial;
use crate::config::{MasterSyncKind, PlayerConfig, Tuning};
use crate::logging::Logger;
use crate::player::PlayerEvent;
use crate::volume::{Volume, MIXER_MAX};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Pending seek, produced by the public API and consumed by the demux reader.
#[derive(Debug, Clone, Copy)]
pub struct SeekRequest {
    pub target_ms: i64,
    /// Narrow the seek window instead of snapping to the previous keyframe.
    pub accurate: bool,
}

/// Callbacks wired into the running session. Kept behind a mutex so the
/// public API can re-register them mid-playback.
#[derive(Default)]
pub struct SessionHooks {
    pub on_event: Option<std::sync::Arc<dyn Fn(PlayerEvent) + Send + Sync>>,
    /// `(position_ms, duration_ms)`, raised from the refresh loop.
    pub on_position: Option<std::sync::Arc<dyn Fn(i64, i64) + Send + Sync>>,
    /// Raised once when playback completes (refresh loop detects drain).
    pub on_completed: Option<std::sync::Arc<dyn Fn() + Send + Sync>>,
}

pub struct Session {
    pub tuning: Tuning,
    pub sync_kind: MasterSyncKind,
    pub logger: Logger,

    // Lifecycle flags.
    abort: AtomicBool,
    paused: AtomicBool,
    /// Reader-only: pause state last propagated to the container reader.
    pub last_paused: AtomicBool,
    step: AtomicBool,
    eof: AtomicBool,

    // Transport settings.
    muted: AtomicBool,
    volume_level: AtomicU32,
    speed_bits: AtomicU64,
    loop_forever: AtomicBool,
    loops_remaining: AtomicI32,
    pub auto_exit: AtomicBool,
    pub infinite_buffer: AtomicBool,

    // Stream facts, fixed at open.
    pub has_audio: AtomicBool,
    pub has_video: AtomicBool,
    pub has_subtitles: AtomicBool,
    pub realtime: AtomicBool,
    duration_ms: AtomicI64,
    pub start_time_ms: AtomicI64,
    /// Play-range length in ms, -1 when unbounded.
    pub play_duration_ms: AtomicI64,
    max_frame_duration_bits: AtomicU64,

    // Queues.
    pub audioq: PacketQueue,
    pub videoq: PacketQueue,
    pub subtitleq: PacketQueue,
    pub sampq: FrameQueue<AudioSamples>,
    pub pictq: FrameQueue<VideoPicture>,
    pub subq: FrameQueue<SubtitleEntry>,

    // Clocks.
    pub audclk: Clock,
    pub vidclk: Clock,
    pub extclk: Clock,

    // Refresh-loop bookkeeping shared with pause toggling.
    frame_timer_bits: AtomicU64,
    pub frame_drops_early: AtomicU64,
    pub frame_drops_late: AtomicU64,

    // Decode-loop completion markers (serial at which the loop drained).
    pub audio_finished: AtomicI32,
    pub video_finished: AtomicI32,
    pub subtitle_finished: AtomicI32,

    // Seek mailbox + reader wakeup.
    seek: Mutex<Option<SeekRequest>>,
    pub seek_count: AtomicU32,
    read_wake: Mutex<bool>,
    read_wake_cond: Condvar,

    pub video_transform: Mutex<VideoTransform>,
    pub hooks: Mutex<SessionHooks>,
}

impl Session {
    #[must_use]
    pub fn new(config: &PlayerConfig, logger: Logger) -> Self {
        let tuning = config.tuning.clone();
        let audioq = PacketQueue::new();
        let videoq = PacketQueue::new();
        let subtitleq = PacketQueue::new();
        let audclk = Clock::new(audioq.live_serial_handle());
        let vidclk = Clock::new(videoq.live_serial_handle());
        let extclk = Clock::new_external();
        Self {
            sync_kind: config.sync,
            logger,
            abort: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            last_paused: AtomicBool::new(false),
            step: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            volume_level: AtomicU32::new(MIXER_MAX),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
            loop_forever: AtomicBool::new(false),
            loops_remaining: AtomicI32::new(1),
            auto_exit: AtomicBool::new(false),
            infinite_buffer: AtomicBool::new(false),
            has_audio: AtomicBool::new(false),
            has_video: AtomicBool::new(false),
            has_subtitles: AtomicBool::new(false),
            realtime: AtomicBool::new(false),
            duration_ms: AtomicI64::new(-1),
            start_time_ms: AtomicI64::new(0),
            play_duration_ms: AtomicI64::new(-1),
            max_frame_duration_bits: AtomicU64::new(3600.0f64.to_bits()),
            audioq,
            videoq,
            subtitleq,
            sampq: FrameQueue::new(tuning.sample_queue_size, false),
            pictq: FrameQueue::new(tuning.video_queue_size, true),
            subq: FrameQueue::new(tuning.subtitle_queue_size, false),
            audclk,
            vidclk,
            extclk,
            frame_timer_bits: AtomicU64::new(0.0f64.to_bits()),
            frame_drops_early: AtomicU64::new(0),
            frame_drops_late: AtomicU64::new(0),
            audio_finished: AtomicI32::new(0),
            video_finished: AtomicI32::new(0),
            subtitle_finished: AtomicI32::new(0),
            seek: Mutex::new(None),
            seek_count: AtomicU32::new(0),
            read_wake: Mutex::new(false),
            read_wake_cond: Condvar::new(),
            video_transform: Mutex::new(VideoTransform::default()),
            hooks: Mutex::new(SessionHooks::default()),
            tuning,
        }
    }

    // --- lifecycle -------------------------------------------------------

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Cancels the whole session: every blocked queue operation returns and
    /// every loop exits on its next wake.
    pub fn abort_all(&self) {
        self.abort.store(true, Ordering::Release);
        self.audioq.abort();
        self.videoq.abort();
        self.subtitleq.abort();
        self.sampq.abort();
        self.pictq.abort();
        self.subq.abort();
        self.wake_reader();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Toggles pause, keeping the clocks coherent: on resume the video clock
    /// is re-anchored so the pause gap does not count as elapsed time.
    pub fn toggle_pause(&self) {
        if self.is_paused() {
            let gap = now_secs() - self.vidclk.last_updated();
            self.set_frame_timer(self.frame_timer() + gap);
            self.vidclk.set_paused(false);
            self.vidclk.set(self.vidclk.get(), self.vidclk.serial());
        }
        self.extclk.set(self.extclk.get(), self.extclk.serial());
        let paused = !self.is_paused();
        self.paused.store(paused, Ordering::Release);
        self.audclk.set_paused(paused);
        self.vidclk.set_paused(paused);
        self.extclk.set_paused(paused);
        self.wake_reader();
    }

    /// Advances exactly one video frame while paused.
    pub fn step_to_next_frame(&self) {
        if self.is_paused() {
            self.toggle_pause();
        }
        self.step.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn step_pending(&self) -> bool {
        self.step.load(Ordering::Acquire)
    }

    pub fn clear_step(&self) {
        self.step.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    pub fn set_eof(&self, eof: bool) {
        self.eof.store(eof, Ordering::Release);
    }

    // --- transport -------------------------------------------------------

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    #[must_use]
    pub fn volume(&self) -> Volume {
        Volume::from_mixer_level(self.volume_level.load(Ordering::Relaxed))
    }

    /// Mixer level on the 0..=128 scale, read by the audio callback.
    #[must_use]
    pub fn mixer_level(&self) -> u32 {
        self.volume_level.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, volume: Volume) {
        self.volume_level.store(volume.mixer_level(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Relaxed))
    }

    pub fn set_speed(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::Relaxed);
        self.audclk.set_speed(speed);
        self.vidclk.set_speed(speed);
        self.extclk.set_speed(speed);
    }

    pub fn set_looping(&self, looping: bool) {
        self.loop_forever.store(looping, Ordering::Relaxed);
    }

    pub fn set_loop_count(&self, count: u32) {
        if count == 0 {
            self.loop_forever.store(true, Ordering::Relaxed);
        } else {
            self.loops_remaining.store(count as i32, Ordering::Relaxed);
        }
    }

    /// Called by the reader at end of media. True = seek back and go again.
    #[must_use]
    pub fn consume_loop(&self) -> bool {
        if self.loop_forever.load(Ordering::Relaxed) {
            return true;
        }
        let remaining = self.loops_remaining.fetch_sub(1, Ordering::Relaxed) - 1;
        remaining > 0
    }

    #[must_use]
    pub fn is_looping(&self) -> bool {
        self.loop_forever.load(Ordering::Relaxed) || self.loops_remaining.load(Ordering::Relaxed) > 1
    }

    // --- timing ----------------------------------------------------------

    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        let d = self.duration_ms.load(Ordering::Relaxed);
        (d >= 0).then_some(d)
    }

    pub fn set_duration_ms(&self, duration: i64) {
        self.duration_ms.store(duration, Ordering::Relaxed);
    }

    #[must_use]
    pub fn max_frame_duration(&self) -> f64 {
        f64::from_bits(self.max_frame_duration_bits.load(Ordering::Relaxed))
    }

    pub fn set_max_frame_duration(&self, value: f64) {
        self.max_frame_duration_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn frame_timer(&self) -> f64 {
        f64::from_bits(self.frame_timer_bits.load(Ordering::Relaxed))
    }

    pub fn set_frame_timer(&self, value: f64) {
        self.frame_timer_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Master clock selection with fallback when the preferred stream is
    /// absent: video master needs a video stream, audio master an audio
    /// stream, anything else follows the external clock.
    #[must_use]
    pub fn master_kind(&self) -> MasterSyncKind {
        match self.sync_kind {
            MasterSyncKind::Video => {
                if self.has_video.load(Ordering::Relaxed) {
                    MasterSyncKind::Video
                } else {
                    MasterSyncKind::Audio
                }
            }
            MasterSyncKind::Audio => {
                if self.has_audio.load(Ordering::Relaxed) {
                    MasterSyncKind::Audio
                } else {
                    MasterSyncKind::External
                }
            }
            MasterSyncKind::External => MasterSyncKind::External,
        }
    }

    #[must_use]
    pub fn master_clock(&self) -> f64 {
        match self.master_kind() {
            MasterSyncKind::Audio => self.audclk.get(),
            MasterSyncKind::Video => self.vidclk.get(),
            MasterSyncKind::External => self.extclk.get(),
        }
    }

    /// Current position in ms, clamped to the known duration.
    #[must_use]
    pub fn position_ms(&self) -> Option<i64> {
        let mut pos = self.master_clock();
        if pos.is_nan() {
            pos = self.extclk.get();
        }
        if pos.is_nan() {
            return None;
        }
        let mut ms = (pos * 1000.0) as i64;
        ms = ms.max(0);
        if let Some(duration) = self.duration_ms() {
            ms = ms.min(duration);
        }
        Some(ms)
    }

    // --- seek mailbox / reader wakeup ------------------------------------

    /// Queues a seek for the reader. A request already pending wins; this
    /// mirrors dropping redundant scrub events.
    pub fn request_seek(&self, request: SeekRequest) {
        let mut pending = self.seek.lock().unwrap();
        if pending.is_none() {
            *pending = Some(request);
        }
        drop(pending);
        self.wake_reader();
    }

    /// Reader-only: takes the pending seek, if any.
    #[must_use]
    pub fn take_seek(&self) -> Option<SeekRequest> {
        self.seek.lock().unwrap().take()
    }

    pub fn wake_reader(&self) {
        let mut flag = self.read_wake.lock().unwrap();
        *flag = true;
        self.read_wake_cond.notify_one();
    }

    /// Reader-only: timed wait used for backpressure and pause idling.
    pub fn reader_wait(&self, timeout: Duration) {
        let flag = self.read_wake.lock().unwrap();
        let (mut flag, _) = self
            .read_wake_cond
            .wait_timeout_while(flag, timeout, |woken| !*woken)
            .unwrap();
        *flag = false;
    }

    // --- backpressure ----------------------------------------------------

    /// Reader full condition: total queued bytes above the cap, or every
    /// active stream already has enough buffered. A cover-art video stream
    /// yields exactly one packet, so it always counts as satisfied.
    #[must_use]
    pub fn queues_full(
        &self,
        audio_tb: f64,
        video_tb: f64,
        subtitle_tb: f64,
        video_attached_pic: bool,
    ) -> bool {
        if self.infinite_buffer.load(Ordering::Relaxed) {
            return false;
        }
        let total = self.audioq.size() + self.videoq.size() + self.subtitleq.size();
        if total > self.tuning.max_queue_bytes {
            return true;
        }
        let enough = |active: bool, attached: bool, q: &PacketQueue, tb: f64| {
            !active || attached || {
                let queued_secs = q.duration() as f64 * tb;
                q.nb_packets() > self.tuning.min_frames && (queued_secs <= 0.0 || queued_secs > 1.0)
            }
        };
        enough(
            self.has_audio.load(Ordering::Relaxed),
            false,
            &self.audioq,
            audio_tb,
        ) && enough(
            self.has_video.load(Ordering::Relaxed),
            video_attached_pic,
            &self.videoq,
            video_tb,
        ) && enough(
            self.has_subtitles.load(Ordering::Relaxed),
            false,
            &self.subtitleq,
            subtitle_tb,
        )
    }

    // --- callbacks -------------------------------------------------------

    pub fn fire_event(&self, event: PlayerEvent) {
        let hook = self.hooks.lock().unwrap().on_event.clone();
        if let Some(hook) = hook {
            hook(event);
        }
    }

    pub fn fire_position(&self, position_ms: i64, duration_ms: i64) {
        let hook = self.hooks.lock().unwrap().on_position.clone();
        if let Some(hook) = hook {
            hook(position_ms, duration_ms);
        }
    }

    pub fn fire_completed(&self) {
        let hook = self.hooks.lock().unwrap().on_completed.clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    #[must_use]
    pub fn current_transform(&self) -> VideoTransform {
        *self.video_transform.lock().unwrap()
    }

    /// Decode-loop EOF marker: `finished` records the serial that drained so
    /// the refresh loop can tell drain from stall.
    #[must_use]
    pub fn all_decoders_finished(&self) -> bool {
        let done = |active: &AtomicBool, finished: &AtomicI32, serial: Serial| {
            !active.load(Ordering::Relaxed) || finished.load(Ordering::Acquire) == serial
        };
        done(&self.has_audio, &self.audio_finished, self.audioq.serial())
            && done(&self.has_video, &self.video_finished, self.videoq.serial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::assert_abs_diff_eq;

    fn session() -> Session {
        Session::new(&PlayerConfig::default(), Logger::none())
    }

    #[test]
    fn pause_toggle_round_trips() {
        let s = session();
        assert!(!s.is_paused());
        s.toggle_pause();
        assert!(s.is_paused());
        assert!(s.audclk.is_paused());
        s.toggle_pause();
        assert!(!s.is_paused());
        assert!(!s.vidclk.is_paused());
    }

    #[test]
    fn step_unpauses_and_flags() {
        let s = session();
        s.toggle_pause();
        s.step_to_next_frame();
        assert!(!s.is_paused());
        assert!(s.step_pending());
        s.clear_step();
        assert!(!s.step_pending());
    }

    #[test]
    fn master_kind_falls_back_when_stream_absent() {
        let s = session();
        // Default sync is audio but no audio stream is active yet.
        assert_eq!(s.master_kind(), MasterSyncKind::External);
        s.has_audio.store(true, Ordering::Relaxed);
        assert_eq!(s.master_kind(), MasterSyncKind::Audio);
    }

    #[test]
    fn volume_round_trips_through_mixer_scale() {
        let s = session();
        s.set_volume(Volume::new(0.8));
        assert!((s.volume().value() - 0.8).abs() <= 0.5 / MIXER_MAX as f32);
        assert_eq!(s.mixer_level(), 102);
    }

    #[test]
    fn seek_mailbox_keeps_first_request() {
        let s = session();
        s.request_seek(SeekRequest {
            target_ms: 1000,
            accurate: false,
        });
        s.request_seek(SeekRequest {
            target_ms: 9999,
            accurate: true,
        });
        let taken = s.take_seek().unwrap();
        assert_eq!(taken.target_ms, 1000);
        assert!(s.take_seek().is_none());
    }

    #[test]
    fn position_clamps_to_duration() {
        let s = session();
        s.set_duration_ms(5000);
        s.extclk.set(60.0, 1);
        assert_eq!(s.position_ms(), Some(5000));
    }

    #[test]
    fn loop_counting() {
        let s = session();
        s.set_loop_count(2);
        assert!(s.consume_loop());
        assert!(!s.consume_loop());

        s.set_looping(true);
        assert!(s.consume_loop());
        assert!(s.consume_loop());
    }

    #[test]
    fn abort_all_aborts_every_queue() {
        let s = session();
        s.audioq.start();
        s.abort_all();
        assert!(s.is_aborted());
        assert!(s.audioq.is_aborted());
        assert!(s.pictq.is_aborted());
        assert!(s.sampq.is_aborted());
    }

    #[test]
    fn queues_full_respects_infinite_buffer() {
        let s = session();
        s.infinite_buffer.store(true, Ordering::Relaxed);
        assert!(!s.queues_full(0.001, 0.001, 0.001, false));
    }

    #[test]
    fn queues_full_exempts_cover_art_video() {
        let s = session();
        s.has_audio.store(true, Ordering::Relaxed);
        s.has_video.store(true, Ordering::Relaxed);
        s.audioq.start();
        s.videoq.start();

        // Plenty of audio buffered; the video queue stays empty because the
        // cover art was consumed long ago.
        for _ in 0..30 {
            let mut packet = ffmpeg_next::Packet::empty();
            packet.set_duration(50);
            s.audioq.put(packet).unwrap();
        }

        assert!(!s.queues_full(0.001, 0.001, 0.001, false));
        assert!(s.queues_full(0.001, 0.001, 0.001, true));
    }

    #[test]
    fn speed_propagates_to_clocks() {
        let s = session();
        s.set_speed(1.5);
        assert_abs_diff_eq!(s.speed(), 1.5);
        assert_abs_diff_eq!(s.extclk.speed(), 1.5);
    }
}
