// SPDX-License-Identifier: MPL-2.0
//! Presentation clocks.
//!
//! Each clock extrapolates a presentation timestamp from the wall clock,
//! scaled by playback speed. A clock is bound to the serial of the packet
//! queue feeding it; after a flush the serials diverge and the clock reads
//! NaN until it is set again, which is how every consumer detects stale
//! time after a seek.
//!
//! Fields are plain atomics (f64 values stored as bits). Readers may observe
//! a set() in progress and get a value from a mix of old and new fields; the
//! consumers tolerate that the same way they tolerate ordinary jitter, and
//! the serial check filters out anything truly stale.

use super::Serial;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

static REFERENCE_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Monotonic wall-clock seconds since first use in this process.
#[must_use]
pub fn now_secs() -> f64 {
    REFERENCE_INSTANT
        .get_or_init(Instant::now)
        .elapsed()
        .as_secs_f64()
}

#[derive(Debug)]
pub struct Clock {
    pts_bits: AtomicU64,
    pts_drift_bits: AtomicU64,
    last_updated_bits: AtomicU64,
    speed_bits: AtomicU64,
    serial: AtomicI32,
    paused: AtomicBool,
    /// Serial of the queue this clock is slaved to. `None` makes the clock
    /// self-driven (the external clock), which never reads as stale.
    queue_serial: Option<Arc<AtomicI32>>,
}

impl Clock {
    /// A clock bound to a packet queue's live serial.
    #[must_use]
    pub fn new(queue_serial: Arc<AtomicI32>) -> Self {
        Self::with_source(Some(queue_serial))
    }

    /// A self-driven clock (used as the external clock).
    #[must_use]
    pub fn new_external() -> Self {
        Self::with_source(None)
    }

    fn with_source(queue_serial: Option<Arc<AtomicI32>>) -> Self {
        let clock = Self {
            pts_bits: AtomicU64::new(f64::NAN.to_bits()),
            pts_drift_bits: AtomicU64::new(f64::NAN.to_bits()),
            last_updated_bits: AtomicU64::new(now_secs().to_bits()),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
            serial: AtomicI32::new(-1),
            paused: AtomicBool::new(false),
            queue_serial,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    #[must_use]
    pub fn serial(&self) -> Serial {
        self.serial.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Last pts handed to `set`, without extrapolation.
    #[must_use]
    pub fn last_pts(&self) -> f64 {
        f64::from_bits(self.pts_bits.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn last_updated(&self) -> f64 {
        f64::from_bits(self.last_updated_bits.load(Ordering::Relaxed))
    }

    pub fn set_at(&self, pts: f64, serial: Serial, at: f64) {
        self.pts_bits.store(pts.to_bits(), Ordering::Relaxed);
        self.last_updated_bits.store(at.to_bits(), Ordering::Relaxed);
        self.pts_drift_bits
            .store((pts - at).to_bits(), Ordering::Relaxed);
        self.serial.store(serial, Ordering::Release);
    }

    pub fn set(&self, pts: f64, serial: Serial) {
        self.set_at(pts, serial, now_secs());
    }

    /// Changes extrapolation speed without letting the reading jump.
    pub fn set_speed(&self, speed: f64) {
        self.set(self.get(), self.serial());
        self.speed_bits.store(speed.to_bits(), Ordering::Relaxed);
    }

    /// Current presentation time, or NaN when the clock is stale.
    #[must_use]
    pub fn get(&self) -> f64 {
        self.get_at(now_secs())
    }

    /// `get` against an explicit wall time. Exposed for deterministic tests
    /// and benches.
    #[must_use]
    pub fn get_at(&self, time: f64) -> f64 {
        if let Some(queue_serial) = &self.queue_serial {
            if queue_serial.load(Ordering::Acquire) != self.serial() {
                return f64::NAN;
            }
        }
        if self.is_paused() {
            self.last_pts()
        } else {
            let drift = f64::from_bits(self.pts_drift_bits.load(Ordering::Relaxed));
            drift + time - (time - self.last_updated()) * (1.0 - self.speed())
        }
    }

    /// Adopts the slave's reading when this clock is stale or the two have
    /// drifted apart beyond `nosync_threshold`.
    pub fn sync_to_slave(&self, slave: &Clock, nosync_threshold: f64) {
        let own = self.get();
        let other = slave.get();
        if !other.is_nan() && (own.is_nan() || (own - other).abs() > nosync_threshold) {
            self.set(other, slave.serial());
        }
    }
}
