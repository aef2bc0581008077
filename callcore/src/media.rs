//! Local capture levels and device failure categories.

use serde::Serialize;

/// What to ask the capture devices for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// One rung of the capture fallback ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MediaLevel {
    AudioVideo,
    VideoOnly,
    AudioOnly,
}

impl MediaLevel {
    /// Tried in order until one succeeds.
    pub const LADDER: [MediaLevel; 3] = [Self::AudioVideo, Self::VideoOnly, Self::AudioOnly];

    pub fn constraints(self) -> MediaConstraints {
        match self {
            Self::AudioVideo => MediaConstraints {
                audio: true,
                video: true,
            },
            Self::VideoOnly => MediaConstraints {
                audio: false,
                video: true,
            },
            Self::AudioOnly => MediaConstraints {
                audio: true,
                video: false,
            },
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::AudioVideo => "audio+video",
            Self::VideoOnly => "video-only",
            Self::AudioOnly => "audio-only",
        }
    }
}

/// Underlying category of a capture failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceErrorKind {
    PermissionDenied,
    NotFound,
    InUse,
    Other,
}

impl DeviceErrorKind {
    pub fn user_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Camera and microphone access was denied. Allow access in your settings and try again."
            }
            Self::NotFound => "No camera or microphone was found. Connect a device and try again.",
            Self::InUse => {
                "Your camera or microphone is already in use by another application. Close it and try again."
            }
            Self::Other => "Could not access your camera or microphone.",
        }
    }
}
