// SPDX-License-Identifier: MPL-2.0
use std::fmt;

/// Engine error type.
///
/// Every variant maps to a stable numeric code (see [`Error::code`]) so that
/// bindings which cannot carry a Rust enum across their boundary can still
/// report a meaningful result.
#[derive(Debug, Clone)]
pub enum Error {
    /// Operation attempted before `init`/`open`.
    NotInitialized,
    /// Operation is invalid for the current playback state.
    StateConflict { operation: &'static str, state: &'static str },
    /// An output device, stream or codec could not be created.
    ResourceCreation(String),
    /// The container or its streams could not be opened.
    OpenFailure(String),
    /// A requested seek could not be performed.
    SeekFailure(String),
    /// A caller-supplied parameter is out of range or malformed.
    InvalidParameter(String),
    /// Error bubbled up from the FFmpeg backend.
    Backend(String),
    /// Configuration file could not be read or parsed.
    Config(String),
    /// A blocking queue operation was cancelled by shutdown.
    Aborted,
}

impl Error {
    /// Stable numeric result code for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Error::NotInitialized => -1,
            Error::StateConflict { .. } => -2,
            Error::ResourceCreation(_) => -3,
            Error::OpenFailure(_) => -4,
            Error::SeekFailure(_) => -5,
            Error::InvalidParameter(_) => -6,
            Error::Backend(_) => -7,
            Error::Config(_) => -8,
            Error::Aborted => -9,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => write!(f, "Player is not initialized"),
            Error::StateConflict { operation, state } => {
                write!(f, "Cannot {} while in state {}", operation, state)
            }
            Error::ResourceCreation(e) => write!(f, "Resource creation failed: {}", e),
            Error::OpenFailure(e) => write!(f, "Open failed: {}", e),
            Error::SeekFailure(e) => write!(f, "Seek failed: {}", e),
            Error::InvalidParameter(e) => write!(f, "Invalid parameter: {}", e),
            Error::Backend(e) => write!(f, "Backend error: {}", e),
            Error::Config(e) => write!(f, "Config error: {}", e),
            Error::Aborted => write!(f, "Operation aborted"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ffmpeg_next::Error> for Error {
    fn from(err: ffmpeg_next::Error) -> Self {
        Error::Backend(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::OpenFailure(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_state_conflict() {
        let err = Error::StateConflict {
            operation: "seek",
            state: "Idle",
        };
        assert_eq!(format!("{}", err), "Cannot seek while in state Idle");
    }

    #[test]
    fn from_io_error_produces_open_failure() {
        let io_error = std::io::Error::other("boom");
        let err: Error = io_error.into();
        match err {
            Error::OpenFailure(message) => assert!(message.contains("boom")),
            _ => panic!("expected OpenFailure variant"),
        }
    }

    #[test]
    fn from_backend_error() {
        let err: Error = ffmpeg_next::Error::InvalidData.into();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn codes_are_stable_and_distinct() {
        let errors = [
            Error::NotInitialized,
            Error::StateConflict {
                operation: "play",
                state: "Idle",
            },
            Error::ResourceCreation(String::new()),
            Error::OpenFailure(String::new()),
            Error::SeekFailure(String::new()),
            Error::InvalidParameter(String::new()),
            Error::Backend(String::new()),
            Error::Config(String::new()),
            Error::Aborted,
        ];
        let codes: Vec<i32> = errors.iter().map(Error::code).collect();
        assert_eq!(codes, vec![-1, -2, -3, -4, -5, -6, -7, -8, -9]);
    }

    #[test]
    fn config_error_formats_properly() {
        let err = Error::Config("bad field".into());
        assert_eq!(format!("{}", err), "Config error: bad field");
    }
}
