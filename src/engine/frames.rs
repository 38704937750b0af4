// SPDX-License-Identifier: MPL-2.0
//! Decoded presentation payloads.
//!
//! Everything that crosses a frame queue is plain data: pixels are already
//! converted to packed RGBA and samples to interleaved f32 at the output
//! device rate, so no decoder state ever leaves its decode thread.

/// Quarter-turn rotation applied at presentation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Rotate180,
    Counterclockwise90,
}

/// How the presentation backend should fit the picture into its surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    /// Letterbox, preserving aspect ratio.
    #[default]
    Fit,
    /// Crop, preserving aspect ratio.
    Fill,
    /// Ignore aspect ratio.
    Stretch,
    /// No scaling.
    Original,
}

/// Presentation-time geometry, carried on every [`VideoPicture`]. Presentation
/// is delegated to the embedding application, so this travels as metadata
/// rather than being baked into the pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VideoTransform {
    pub rotation: Rotation,
    pub mirror_horizontal: bool,
    pub mirror_vertical: bool,
    pub scale: ScaleMode,
    /// Display aspect ratio override (width / height).
    pub aspect_ratio: Option<f32>,
}

/// One decoded video frame, tightly packed RGBA.
#[derive(Debug, Clone)]
pub struct VideoPicture {
    /// `width * height * 4` bytes, no row padding.
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub transform: VideoTransform,
}

impl VideoPicture {
    /// Total pixel data size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.rgba.len()
    }
}

/// One block of decoded audio, interleaved f32 in [-1.0, 1.0] at the output
/// device's rate and channel count.
#[derive(Debug, Clone)]
pub struct AudioSamples {
    pub samples: Vec<f32>,
    pub rate: u32,
    pub channels: u16,
}

impl AudioSamples {
    /// Number of sample frames (samples per channel).
    #[must_use]
    pub fn nb_frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Duration of this block in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        if self.rate == 0 {
            0.0
        } else {
            self.nb_frames() as f64 / f64::from(self.rate)
        }
    }
}

/// One decoded subtitle cue.
#[derive(Debug, Clone)]
pub struct SubtitleEntry {
    /// Rendered text lines (plain text or raw ASS events).
    pub lines: Vec<String>,
    /// Display window start, seconds of media time.
    pub start: f64,
    /// Display window end, seconds of media time.
    pub end: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::assert_abs_diff_eq;

    #[test]
    fn audio_samples_frame_math() {
        let block = AudioSamples {
            samples: vec![0.0; 4800 * 2],
            rate: 48_000,
            channels: 2,
        };
        assert_eq!(block.nb_frames(), 4800);
        assert_abs_diff_eq!(block.duration_secs(), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn audio_samples_zero_channels_is_empty() {
        let block = AudioSamples {
            samples: vec![0.0; 16],
            rate: 0,
            channels: 0,
        };
        assert_eq!(block.nb_frames(), 0);
        assert_abs_diff_eq!(block.duration_secs(), 0.0);
    }

    #[test]
    fn video_picture_size() {
        let picture = VideoPicture {
            rgba: vec![0; 1920 * 1080 * 4],
            width: 1920,
            height: 1080,
            transform: VideoTransform::default(),
        };
        assert_eq!(picture.size_bytes(), 1920 * 1080 * 4);
    }
}
