// SPDX-License-Identifier: MPL-2.0
//! Public playback API.
//!
//! [`Player`] is a thin state machine over the engine: it owns the stage
//! chain and the session for the currently open media and polices which
//! operations are legal in which state. All real work happens on the
//! engine's background threads; every method here returns quickly.
//!
//! The lifecycle is `Idle -> Initialized -> Prepared -> Playing <-> Paused`,
//! with `Stopped` and `Completed` as resting states that `play` leaves by
//! re-opening the remembered media. `Error` is entered only when `open`
//! fails; recovery is another `open`.

use crate::config::{MediaOptions, PlayerConfig};
use crate::engine::frames::{Rotation, ScaleMode, VideoTransform};
use crate::engine::refresh::VideoOutput;
use crate::engine::session::{SeekRequest, Session};
use crate::engine::stage::{Chain, ChainContext};
use crate::error::{Error, Result};
use crate::logging::{LogSink, Logger};
use crate::volume::Volume;
use std::sync::{Arc, Mutex};

/// Lifecycle state of a [`Player`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Initialized,
    Prepared,
    Playing,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl PlayerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PlayerState::Idle => "idle",
            PlayerState::Initialized => "initialized",
            PlayerState::Prepared => "prepared",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
            PlayerState::Stopped => "stopped",
            PlayerState::Completed => "completed",
            PlayerState::Error => "error",
        }
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine notifications delivered through the event callback.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Media opened and streams selected.
    Opened,
    /// Queues are refilling (after a seek landed).
    Buffering,
    /// Playback reached end of media.
    Completed,
    /// A background operation failed.
    Error { code: i32, message: String },
}

type StateCallback = Arc<dyn Fn(PlayerState) + Send + Sync>;
type EventCallback = Arc<dyn Fn(PlayerEvent) + Send + Sync>;
type PositionCallback = Arc<dyn Fn(i64, i64) + Send + Sync>;

/// Current state plus its change callback. Shared with the refresh thread,
/// which flips `Playing -> Completed`.
struct StateCell {
    state: Mutex<PlayerState>,
    on_state: Mutex<Option<StateCallback>>,
}

impl StateCell {
    fn new() -> Self {
        Self {
            state: Mutex::new(PlayerState::Idle),
            on_state: Mutex::new(None),
        }
    }

    fn get(&self) -> PlayerState {
        *self.state.lock().unwrap()
    }

    fn set(&self, next: PlayerState) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            let callback = self.on_state.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(next);
            }
        }
    }
}

struct Active {
    chain: Chain,
    ctx: ChainContext,
}

impl Active {
    fn session(&self) -> &Arc<Session> {
        &self.ctx.session
    }
}

pub struct Player {
    config: Option<PlayerConfig>,
    state: Arc<StateCell>,
    active: Option<Active>,
    /// Last successfully opened media, replayed by `play` after a stop.
    remembered: Option<(String, MediaOptions)>,
    video_out: Option<Arc<dyn VideoOutput>>,
    transform: VideoTransform,
    volume: Volume,
    muted: bool,
    looping: bool,
    speed: f64,
    logger: Logger,
    on_event: Option<EventCallback>,
    on_position: Option<PositionCallback>,
}

impl Default for Player {
    fn default() -> Self {
        Self::new()
    }
}

impl Player {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: None,
            state: Arc::new(StateCell::new()),
            active: None,
            remembered: None,
            video_out: None,
            transform: VideoTransform::default(),
            volume: Volume::default(),
            muted: false,
            looping: false,
            speed: 1.0,
            logger: Logger::none(),
            on_event: None,
            on_position: None,
        }
    }

    fn conflict(&self, operation: &'static str) -> Error {
        Error::StateConflict {
            operation,
            state: self.state.get().as_str(),
        }
    }

    fn active(&self) -> Result<&Active> {
        self.active.as_ref().ok_or(Error::NotInitialized)
    }

    // --- lifecycle -------------------------------------------------------

    /// Accepts the session-wide configuration. Legal only from `Idle`.
    pub fn init(&mut self, config: PlayerConfig) -> Result<()> {
        if self.state.get() != PlayerState::Idle {
            return Err(self.conflict("init"));
        }
        self.config = Some(config);
        self.state.set(PlayerState::Initialized);
        Ok(())
    }

    /// Releases everything and returns to `Idle`. Safe to call repeatedly.
    pub fn uninit(&mut self) {
        if self.active.is_some() {
            let _ = self.stop();
        }
        self.config = None;
        self.remembered = None;
        self.state.set(PlayerState::Idle);
    }

    /// Installs the render target for decoded video. Takes effect on the
    /// next `open`.
    pub fn set_video_output(&mut self, output: Option<Arc<dyn VideoOutput>>) {
        self.video_out = output;
    }

    /// Opens a media URL and prepares the pipeline without starting it.
    ///
    /// A failure moves the player to `Error`; another `open` recovers.
    pub fn open(&mut self, url: &str, options: MediaOptions) -> Result<()> {
        let config = self.config.clone().ok_or(Error::NotInitialized)?;
        match self.state.get() {
            PlayerState::Playing | PlayerState::Paused | PlayerState::Completed => {
                self.stop()?;
            }
            _ => {}
        }
        options.validate()?;

        let session = Arc::new(Session::new(&config, self.logger.clone()));
        *session.video_transform.lock().unwrap() = self.transform;
        session.set_volume(self.volume);
        session.set_muted(self.muted);
        session.set_looping(self.looping);
        session.set_speed(self.speed);
        {
            let mut hooks = session.hooks.lock().unwrap();
            hooks.on_event = self.on_event.clone();
            hooks.on_position = self.on_position.clone();
            let state = Arc::clone(&self.state);
            let on_event = self.on_event.clone();
            hooks.on_completed = Some(Arc::new(move || {
                state.set(PlayerState::Completed);
                if let Some(on_event) = &on_event {
                    on_event(PlayerEvent::Completed);
                }
            }));
        }

        let mut ctx = ChainContext {
            session,
            config,
            options: options.clone(),
            url: url.to_string(),
            media: None,
            video_out: self.video_out.clone(),
            device: None,
            logger: self.logger.clone(),
        };
        let mut chain = Chain::standard();
        if let Err(e) = chain.open(&mut ctx) {
            ctx.session.fire_event(PlayerEvent::Error {
                code: e.code(),
                message: e.to_string(),
            });
            self.state.set(PlayerState::Error);
            return Err(e);
        }

        self.remembered = Some((url.to_string(), options));
        self.active = Some(Active { chain, ctx });
        self.state.set(PlayerState::Prepared);
        Ok(())
    }

    fn start_prepared(&mut self) -> Result<()> {
        let active = self.active.as_mut().ok_or(Error::NotInitialized)?;
        active.chain.start(&mut active.ctx)?;
        self.state.set(PlayerState::Playing);
        Ok(())
    }

    /// Starts or resumes playback. From `Stopped` or `Completed` the
    /// remembered media is re-opened from the beginning.
    pub fn play(&mut self) -> Result<()> {
        match self.state.get() {
            PlayerState::Idle => Err(Error::NotInitialized),
            PlayerState::Prepared => self.start_prepared(),
            PlayerState::Playing => Ok(()),
            PlayerState::Paused => {
                let active = self.active.as_mut().ok_or(Error::NotInitialized)?;
                active.ctx.session.toggle_pause();
                active.chain.resume();
                self.state.set(PlayerState::Playing);
                Ok(())
            }
            PlayerState::Stopped | PlayerState::Completed => {
                if self.active.is_some() {
                    self.stop()?;
                }
                let (url, options) = self.remembered.clone().ok_or_else(|| self.conflict("play"))?;
                self.open(&url, options)?;
                self.start_prepared()
            }
            PlayerState::Initialized | PlayerState::Error => Err(self.conflict("play")),
        }
    }

    /// Toggles pause. Returns the new paused flag.
    pub fn pause(&mut self) -> Result<bool> {
        match self.state.get() {
            PlayerState::Playing => {
                let active = self.active.as_mut().ok_or(Error::NotInitialized)?;
                active.ctx.session.toggle_pause();
                active.chain.pause();
                self.state.set(PlayerState::Paused);
                Ok(true)
            }
            PlayerState::Paused => {
                self.play()?;
                Ok(false)
            }
            _ => Err(self.conflict("pause")),
        }
    }

    /// Tears the pipeline down. The media can be replayed with `play`.
    pub fn stop(&mut self) -> Result<()> {
        if self.state.get() == PlayerState::Idle {
            return Err(Error::NotInitialized);
        }
        let Some(mut active) = self.active.take() else {
            return Err(self.conflict("stop"));
        };
        active.ctx.session.abort_all();
        active.chain.stop();
        self.state.set(PlayerState::Stopped);
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> PlayerState {
        self.state.get()
    }

    // --- time ------------------------------------------------------------

    /// Total duration in milliseconds, `None` while unknown.
    pub fn duration_ms(&self) -> Result<Option<i64>> {
        Ok(self.active()?.session().duration_ms())
    }

    /// Current playback position in milliseconds, `None` before the clocks
    /// first tick.
    pub fn position_ms(&self) -> Result<Option<i64>> {
        Ok(self.active()?.session().position_ms())
    }

    /// Requests an asynchronous keyframe seek.
    pub fn seek_ms(&self, target_ms: i64) -> Result<()> {
        self.seek(target_ms, false)
    }

    /// Requests an asynchronous seek that lands on the requested position
    /// instead of the previous keyframe.
    pub fn seek_ms_accurate(&self, target_ms: i64) -> Result<()> {
        self.seek(target_ms, true)
    }

    fn seek(&self, target_ms: i64, accurate: bool) -> Result<()> {
        if target_ms < 0 {
            return Err(Error::InvalidParameter(format!(
                "seek target {} ms is negative",
                target_ms
            )));
        }
        match self.state.get() {
            PlayerState::Prepared
            | PlayerState::Playing
            | PlayerState::Paused
            | PlayerState::Completed => {
                let session = self.active()?.session();
                let target_ms = match session.duration_ms() {
                    Some(duration) => target_ms.min(duration),
                    None => target_ms,
                };
                session.request_seek(SeekRequest { target_ms, accurate });
                Ok(())
            }
            PlayerState::Idle => Err(Error::NotInitialized),
            _ => Err(self.conflict("seek")),
        }
    }

    // --- transport knobs -------------------------------------------------

    pub fn set_mute(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(active) = &self.active {
            active.session().set_muted(muted);
        }
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Restarts from the beginning at end of media instead of completing.
    pub fn set_loop(&mut self, looping: bool) {
        self.looping = looping;
        if let Some(active) = &self.active {
            active.session().set_looping(looping);
        }
    }

    /// Playback speed multiplier. Must be finite and positive.
    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "speed {} is not a positive finite value",
                speed
            )));
        }
        self.speed = speed;
        if let Some(active) = &self.active {
            active.session().set_speed(speed);
        }
        Ok(())
    }

    /// Volume in 0.0..=1.0.
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::InvalidParameter(format!(
                "volume {} outside 0.0..=1.0",
                volume
            )));
        }
        self.volume = Volume::new(volume);
        if let Some(active) = &self.active {
            active.session().set_volume(self.volume);
        }
        Ok(())
    }

    #[must_use]
    pub fn volume(&self) -> f32 {
        self.volume.value()
    }

    // --- video presentation ----------------------------------------------

    fn update_transform(&mut self, apply: impl FnOnce(&mut VideoTransform)) {
        apply(&mut self.transform);
        if let Some(active) = &self.active {
            *active.session().video_transform.lock().unwrap() = self.transform;
        }
    }

    pub fn set_scale_mode(&mut self, scale: ScaleMode) {
        self.update_transform(|t| t.scale = scale);
    }

    pub fn set_rotation(&mut self, rotation: Rotation) {
        self.update_transform(|t| t.rotation = rotation);
    }

    pub fn set_mirror(&mut self, horizontal: bool, vertical: bool) {
        self.update_transform(|t| {
            t.mirror_horizontal = horizontal;
            t.mirror_vertical = vertical;
        });
    }

    pub fn set_aspect_ratio(&mut self, aspect: Option<f32>) {
        self.update_transform(|t| t.aspect_ratio = aspect);
    }

    // --- callbacks -------------------------------------------------------

    /// Engine event callback. Takes effect immediately for the open media.
    pub fn on_event(&mut self, callback: EventCallback) {
        self.on_event = Some(Arc::clone(&callback));
        if let Some(active) = &self.active {
            active.session().hooks.lock().unwrap().on_event = Some(callback);
        }
    }

    /// State-transition callback.
    pub fn on_state(&mut self, callback: StateCallback) {
        *self.state.on_state.lock().unwrap() = Some(callback);
    }

    /// Position callback, `(position_ms, duration_ms)`, raised at roughly
    /// the refresh interval while playing.
    pub fn on_position(&mut self, callback: PositionCallback) {
        self.on_position = Some(Arc::clone(&callback));
        if let Some(active) = &self.active {
            active.session().hooks.lock().unwrap().on_position = Some(callback);
        }
    }

    /// Log sink for engine diagnostics. Takes effect on the next `open`.
    pub fn on_log(&mut self, sink: Arc<dyn LogSink>) {
        self.logger = Logger::new(sink);
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.uninit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn operations_require_init() {
        let mut player = Player::new();
        assert!(matches!(player.play(), Err(Error::NotInitialized)));
        assert!(matches!(player.stop(), Err(Error::NotInitialized)));
        assert!(matches!(
            player.open("/nope.mkv", MediaOptions::default()),
            Err(Error::NotInitialized)
        ));
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[test]
    fn double_init_is_a_state_conflict() {
        let mut player = Player::new();
        player.init(PlayerConfig::default()).unwrap();
        assert!(matches!(
            player.init(PlayerConfig::default()),
            Err(Error::StateConflict { .. })
        ));
    }

    #[test]
    fn play_without_open_is_a_state_conflict() {
        let mut player = Player::new();
        player.init(PlayerConfig::default()).unwrap();
        assert!(matches!(player.play(), Err(Error::StateConflict { .. })));
        assert!(matches!(player.pause(), Err(Error::StateConflict { .. })));
    }

    #[test]
    fn open_failure_enters_error_state() {
        let mut player = Player::new();
        player.init(PlayerConfig::default()).unwrap();
        let result = player.open("/no/such/file.mkv", MediaOptions::default());
        assert!(matches!(result, Err(Error::OpenFailure(_))));
        assert_eq!(player.state(), PlayerState::Error);
        // Play from the error state stays rejected.
        assert!(matches!(player.play(), Err(Error::StateConflict { .. })));
    }

    #[test]
    fn state_callback_fires_on_transitions() {
        let mut player = Player::new();
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        player.on_state(Arc::new(move |state| {
            seen.lock().unwrap().push(state);
        }));
        player.init(PlayerConfig::default()).unwrap();
        player.uninit();

        let transitions = transitions.lock().unwrap();
        assert_eq!(*transitions, vec![PlayerState::Initialized, PlayerState::Idle]);
    }

    #[test]
    fn volume_round_trips_and_validates() {
        let mut player = Player::new();
        player.set_volume(0.8).unwrap();
        assert!((player.volume() - 0.8).abs() < 0.01);
        assert!(matches!(
            player.set_volume(1.5),
            Err(Error::InvalidParameter(_))
        ));
        assert!((player.volume() - 0.8).abs() < 0.01);
    }

    #[test]
    fn speed_validates() {
        let mut player = Player::new();
        assert!(player.set_speed(1.5).is_ok());
        assert!(matches!(
            player.set_speed(0.0),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            player.set_speed(f64::NAN),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn negative_seek_is_invalid() {
        let player = Player::new();
        assert!(matches!(
            player.seek_ms(-5),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn transform_setters_accumulate() {
        let mut player = Player::new();
        player.set_rotation(Rotation::Clockwise90);
        player.set_mirror(true, false);
        player.set_scale_mode(ScaleMode::Fill);
        assert_eq!(player.transform.rotation, Rotation::Clockwise90);
        assert!(player.transform.mirror_horizontal);
        assert_eq!(player.transform.scale, ScaleMode::Fill);
    }

    #[test]
    fn uninit_is_idempotent() {
        let mut player = Player::new();
        player.uninit();
        player.init(PlayerConfig::default()).unwrap();
        player.uninit();
        player.uninit();
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[test]
    fn completion_hook_reaches_event_callback() {
        let mut player = Player::new();
        let events = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&events);
        player.on_event(Arc::new(move |event| {
            if event == PlayerEvent::Completed {
                seen.fetch_add(1, Ordering::Relaxed);
            }
        }));
        // Simulate what the refresh loop does at end of media.
        let cell = Arc::clone(&player.state);
        let on_event = player.on_event.clone().unwrap();
        cell.set(PlayerState::Completed);
        on_event(PlayerEvent::Completed);
        assert_eq!(events.load(Ordering::Relaxed), 1);
        assert_eq!(player.state(), PlayerState::Completed);
    }
}
