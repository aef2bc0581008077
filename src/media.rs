//! Local media acquisition with graceful degradation.

use crate::error::DeviceError;
use crate::transport::{LocalStream, MediaDevices};
use callcore::media::MediaLevel;
use callcore::state::CallWarning;
use log::{info, warn};
use std::sync::Arc;

pub struct AcquiredMedia {
    pub stream: Arc<dyn LocalStream>,
    pub level: MediaLevel,
    /// Set when a richer level failed and a reduced one was used instead.
    pub warning: Option<CallWarning>,
}

impl std::fmt::Debug for AcquiredMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredMedia")
            .field("stream", &self.stream.id())
            .field("level", &self.level)
            .field("warning", &self.warning)
            .finish()
    }
}

/// Walks [`MediaLevel::LADDER`] until the devices grant a stream.
///
/// The degradation warning carries the category of the first failure, which
/// is what the user needs to fix to get the full experience back. When every
/// level fails the last error is returned.
pub async fn acquire_with_fallback(devices: &dyn MediaDevices) -> Result<AcquiredMedia, DeviceError> {
    let mut first_failure = None;
    let mut last_error = None;

    for level in MediaLevel::LADDER {
        match devices.acquire(level.constraints()).await {
            Ok(stream) => {
                let warning = first_failure.map(|cause| CallWarning::DegradedMedia { level, cause });
                if warning.is_some() {
                    warn!(target: "Call/Media", "Falling back to {} capture", level.describe());
                } else {
                    info!(target: "Call/Media", "Acquired {} capture", level.describe());
                }
                return Ok(AcquiredMedia {
                    stream,
                    level,
                    warning,
                });
            }
            Err(e) => {
                warn!(target: "Call/Media", "{} capture failed: {e}", level.describe());
                first_failure.get_or_insert(e.kind);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        DeviceError::new(
            callcore::media::DeviceErrorKind::Other,
            "no capture level available",
        )
    }))
}
