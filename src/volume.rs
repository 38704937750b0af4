// SPDX-License-Identifier: MPL-2.0
//! Playback volume as a validated newtype.
//!
//! The public API speaks 0.0..=1.0; the audio mixer works on an integer
//! 0..=128 scale, so a round trip through the mixer level may lose up to
//! half a step of precision.

/// Maximum mixer level. Sample mixing scales by `level / MIXER_MAX`.
pub const MIXER_MAX: u32 = 128;

/// Volume in the range 0.0..=1.0, clamped on construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Volume(f32);

impl Volume {
    /// Creates a volume, clamping out-of-range input.
    #[must_use]
    pub fn new(value: f32) -> Self {
        let value = if value.is_nan() { 0.0 } else { value };
        Self(value.clamp(0.0, 1.0))
    }

    /// The raw 0.0..=1.0 value.
    #[must_use]
    pub fn value(self) -> f32 {
        self.0
    }

    /// Integer mixer level on the 0..=128 scale.
    #[must_use]
    pub fn mixer_level(self) -> u32 {
        (self.0 * MIXER_MAX as f32).round() as u32
    }

    /// Reconstructs a volume from a mixer level.
    #[must_use]
    pub fn from_mixer_level(level: u32) -> Self {
        Self::new(level.min(MIXER_MAX) as f32 / MIXER_MAX as f32)
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::assert_abs_diff_eq;

    #[test]
    fn clamps_out_of_range_values() {
        assert_abs_diff_eq!(Volume::new(-0.5).value(), 0.0);
        assert_abs_diff_eq!(Volume::new(1.5).value(), 1.0);
        assert_abs_diff_eq!(Volume::new(f32::NAN).value(), 0.0);
    }

    #[test]
    fn mixer_round_trip_stays_within_one_step() {
        let v = Volume::new(0.8);
        let back = Volume::from_mixer_level(v.mixer_level());
        assert!((back.value() - 0.8).abs() <= 0.5 / MIXER_MAX as f32);
    }

    #[test]
    fn mixer_endpoints_are_exact() {
        assert_eq!(Volume::new(0.0).mixer_level(), 0);
        assert_eq!(Volume::new(1.0).mixer_level(), MIXER_MAX);
        assert_abs_diff_eq!(Volume::from_mixer_level(MIXER_MAX).value(), 1.0);
    }

    #[test]
    fn from_mixer_level_clamps_overrange() {
        assert_abs_diff_eq!(Volume::from_mixer_level(500).value(), 1.0);
    }
}
