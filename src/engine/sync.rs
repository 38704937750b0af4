// SPDX-License-Identifier: MPL-2.0
//! Synchronization math.
//!
//! Pure functions and small state machines shared by the refresh loop and the
//! audio output path. Video corrects by stretching or shrinking the delay
//! before the next frame (down to dropping, up to doubling); audio corrects
//! by nudging the number of samples consumed per output buffer inside a
//! clamped band so the pitch shift stays inaudible. All thresholds come from
//! [`Tuning`].

use super::frame_queue::QueuedFrame;
use crate::config::Tuning;

/// Adjusts the nominal inter-frame delay by the video/master clock
/// difference. `diff` is `video_clock - master_clock`; a NaN or wildly
/// out-of-range difference leaves the delay untouched.
#[must_use]
pub fn compute_target_delay(delay: f64, diff: f64, max_frame_duration: f64, tuning: &Tuning) -> f64 {
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        return delay;
    }
    let threshold = delay.clamp(tuning.sync_threshold_min, tuning.sync_threshold_max);
    if diff <= -threshold {
        // Video is behind: shrink toward showing immediately.
        (delay + diff).max(0.0)
    } else if diff >= threshold && delay > tuning.sync_framedup_threshold {
        // Video is ahead and frames are long: stretch instead of doubling.
        delay + diff
    } else if diff >= threshold {
        2.0 * delay
    } else {
        delay
    }
}

/// Nominal display duration of `current`, taken from the pts gap to `next`
/// when both belong to the same generation and the gap is sane.
#[must_use]
pub fn frame_display_duration<T>(
    current: &QueuedFrame<T>,
    next: &QueuedFrame<T>,
    max_frame_duration: f64,
) -> f64 {
    if current.serial != next.serial {
        return 0.0;
    }
    let duration = next.pts - current.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        current.duration
    } else {
        duration
    }
}

/// Exponentially averaged audio/master clock difference, producing per-buffer
/// wanted sample counts.
///
/// The averaging hides one-buffer jitter: a correction only happens once the
/// average of roughly `audio_diff_avg_nb` buffers exceeds the threshold the
/// output device's own buffering imposes.
#[derive(Debug)]
pub struct AudioDiffTracker {
    cum: f64,
    coef: f64,
    count: u32,
    /// Differences below this are indistinguishable from device buffering.
    threshold: f64,
}

impl AudioDiffTracker {
    #[must_use]
    pub fn new(threshold: f64, tuning: &Tuning) -> Self {
        Self {
            cum: 0.0,
            coef: tuning.audio_diff_avg_coef(),
            count: 0,
            threshold,
        }
    }

    /// Resets the average (after a discontinuity).
    pub fn reset(&mut self) {
        self.cum = 0.0;
        self.count = 0;
    }

    /// Given the instantaneous clock difference (audio − master) and the
    /// size of the next sample block, returns how many sample frames should
    /// actually be consumed for it.
    #[must_use]
    pub fn wanted_samples(
        &mut self,
        diff: f64,
        nb_samples: usize,
        sample_rate: u32,
        tuning: &Tuning,
    ) -> usize {
        if diff.is_nan() || diff.abs() >= tuning.nosync_threshold {
            // Too far gone for gentle correction.
            self.reset();
            return nb_samples;
        }

        self.cum = diff + self.coef * self.cum;
        if self.count < tuning.audio_diff_avg_nb {
            self.count += 1;
            return nb_samples;
        }

        let avg_diff = self.cum * (1.0 - self.coef);
        if avg_diff.abs() < self.threshold {
            return nb_samples;
        }

        let wanted = nb_samples as f64 + avg_diff * f64::from(sample_rate);
        let band = tuning.sample_correction_percent_max;
        let min = nb_samples as f64 * (1.0 - band);
        let max = nb_samples as f64 * (1.0 + band);
        wanted.clamp(min, max) as usize
    }
}

/// Next external clock speed for realtime sources, from the current speed and
/// per-stream queued packet counts (`None` = stream absent).
#[must_use]
pub fn external_clock_speed(
    speed: f64,
    video_packets: Option<usize>,
    audio_packets: Option<usize>,
    tuning: &Tuning,
) -> f64 {
    let starving = |n: Option<usize>| n.is_some_and(|n| n < tuning.external_clock_min_frames);
    let overfull = |n: Option<usize>| n.map_or(true, |n| n > tuning.external_clock_max_frames);

    if starving(video_packets) || starving(audio_packets) {
        (speed - tuning.external_clock_speed_step).max(tuning.external_clock_speed_min)
    } else if overfull(video_packets) && overfull(audio_packets) {
        (speed + tuning.external_clock_speed_step).min(tuning.external_clock_speed_max)
    } else if speed != 1.0 {
        // Queue occupancy is in band: relax toward nominal speed.
        speed + (1.0 - speed).signum() * tuning.external_clock_speed_step
    } else {
        speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::assert_abs_diff_eq;
    use std::sync::Arc;

    fn tuning() -> Tuning {
        Tuning::default()
    }

    fn qf(pts: f64, duration: f64, serial: i32) -> QueuedFrame<u32> {
        QueuedFrame {
            payload: Arc::new(0),
            pts,
            duration,
            pos: -1,
            serial,
        }
    }

    #[test]
    fn target_delay_unchanged_within_threshold() {
        let t = tuning();
        // diff below the clamped threshold leaves the delay alone.
        assert_abs_diff_eq!(compute_target_delay(0.04, 0.01, 10.0, &t), 0.04);
        assert_abs_diff_eq!(compute_target_delay(0.04, -0.01, 10.0, &t), 0.04);
    }

    #[test]
    fn target_delay_shrinks_when_video_lags() {
        let t = tuning();
        // Video a full second behind: catch up as fast as possible.
        assert_abs_diff_eq!(compute_target_delay(0.04, -1.0, 10.0, &t), 0.0);
        // Moderate lag shrinks but does not go negative.
        assert_abs_diff_eq!(compute_target_delay(0.08, -0.06, 10.0, &t), 0.02, epsilon = 1e-12);
    }

    #[test]
    fn target_delay_doubles_when_video_leads() {
        let t = tuning();
        assert_abs_diff_eq!(compute_target_delay(0.04, 0.06, 10.0, &t), 0.08);
    }

    #[test]
    fn target_delay_stretches_long_frames_instead_of_doubling() {
        let t = tuning();
        // delay above the framedup threshold grows additively.
        assert_abs_diff_eq!(compute_target_delay(0.2, 0.15, 10.0, &t), 0.35, epsilon = 1e-12);
    }

    #[test]
    fn target_delay_ignores_nan_and_out_of_range_diff() {
        let t = tuning();
        assert_abs_diff_eq!(compute_target_delay(0.04, f64::NAN, 10.0, &t), 0.04);
        assert_abs_diff_eq!(compute_target_delay(0.04, 20.0, 10.0, &t), 0.04);
    }

    #[test]
    fn display_duration_uses_pts_gap_within_generation() {
        let a = qf(1.0, 0.04, 1);
        let b = qf(1.05, 0.04, 1);
        assert_abs_diff_eq!(frame_display_duration(&a, &b, 10.0), 0.05, epsilon = 1e-12);
    }

    #[test]
    fn display_duration_falls_back_across_generations_or_bad_gaps() {
        let a = qf(1.0, 0.04, 1);
        let stale = qf(0.0, 0.04, 2);
        assert_abs_diff_eq!(frame_display_duration(&a, &stale, 10.0), 0.0);

        let backwards = qf(0.5, 0.04, 1);
        assert_abs_diff_eq!(frame_display_duration(&a, &backwards, 10.0), 0.04);

        let huge_gap = qf(100.0, 0.04, 1);
        assert_abs_diff_eq!(frame_display_duration(&a, &huge_gap, 10.0), 0.04);
    }

    #[test]
    fn audio_tracker_warms_up_before_correcting() {
        let t = tuning();
        let mut tracker = AudioDiffTracker::new(0.02, &t);
        // During warmup every request passes through unchanged.
        for _ in 0..t.audio_diff_avg_nb {
            assert_eq!(tracker.wanted_samples(0.5, 1024, 48_000, &t), 1024);
        }
    }

    #[test]
    fn audio_tracker_corrects_within_band_after_warmup() {
        let t = tuning();
        let mut tracker = AudioDiffTracker::new(0.02, &t);
        let mut wanted = 1024;
        // Constant large positive diff (audio ahead): consumption must grow,
        // clamped to +10%.
        for _ in 0..(t.audio_diff_avg_nb + 10) {
            wanted = tracker.wanted_samples(0.5, 1024, 48_000, &t);
        }
        assert!(wanted > 1024);
        assert!(wanted <= (1024.0 * 1.1) as usize);
    }

    #[test]
    fn audio_tracker_resets_on_huge_diff() {
        let t = tuning();
        let mut tracker = AudioDiffTracker::new(0.02, &t);
        for _ in 0..(t.audio_diff_avg_nb + 5) {
            let _ = tracker.wanted_samples(0.5, 1024, 48_000, &t);
        }
        // A no-sync scale difference clears the average.
        assert_eq!(tracker.wanted_samples(30.0, 1024, 48_000, &t), 1024);
        assert_eq!(tracker.count, 0);
    }

    #[test]
    fn audio_tracker_small_avg_diff_is_ignored() {
        let t = tuning();
        let mut tracker = AudioDiffTracker::new(0.05, &t);
        for _ in 0..(t.audio_diff_avg_nb + 10) {
            assert_eq!(tracker.wanted_samples(0.001, 1024, 48_000, &t), 1024);
        }
    }

    #[test]
    fn external_speed_throttles_down_when_starving() {
        let t = tuning();
        let next = external_clock_speed(1.0, Some(1), Some(5), &t);
        assert_abs_diff_eq!(next, 1.0 - t.external_clock_speed_step, epsilon = 1e-12);
    }

    #[test]
    fn external_speed_throttles_up_when_overfull() {
        let t = tuning();
        let next = external_clock_speed(1.0, Some(20), Some(20), &t);
        assert_abs_diff_eq!(next, 1.0 + t.external_clock_speed_step, epsilon = 1e-12);
    }

    #[test]
    fn external_speed_relaxes_toward_nominal() {
        let t = tuning();
        let next = external_clock_speed(0.95, Some(5), Some(5), &t);
        assert!(next > 0.95);
        let next = external_clock_speed(1.005, Some(5), Some(5), &t);
        assert!(next < 1.005);
    }

    #[test]
    fn external_speed_respects_bounds() {
        let t = tuning();
        let floor = external_clock_speed(t.external_clock_speed_min, Some(0), Some(0), &t);
        assert_abs_diff_eq!(floor, t.external_clock_speed_min);
        let ceiling = external_clock_speed(t.external_clock_speed_max, Some(20), Some(20), &t);
        assert_abs_diff_eq!(ceiling, t.external_clock_speed_max);
    }
}
