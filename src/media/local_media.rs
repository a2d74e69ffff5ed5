//! Capturing the player's own camera/microphone.
//!
//! What to capture comes from the settings (device ids) and two toggles.  Nothing
//! requested means no capture at all, which is a normal state and not an error.
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;

use crate::common::{box_error::BoxError, settings::Settings};
use crate::peer::transport::MediaStream;

/// preview size asked of the camera
pub const VIDEO_WIDTH: u32 = 150;
pub const VIDEO_HEIGHT: u32 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {} ({})", self.kind, self.label, self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioConstraint {
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoConstraint {
    pub device_id: Option<String>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraint>,
    pub video: Option<VideoConstraint>,
}

impl MediaConstraints {
    pub fn from_settings(settings: &Settings, camera_on: bool, microphone_on: bool) -> MediaConstraints {
        MediaConstraints {
            audio: microphone_on.then(|| AudioConstraint {
                device_id: settings.audio_id.clone(),
            }),
            video: camera_on.then(|| VideoConstraint {
                device_id: settings.video_id.clone(),
                width: VIDEO_WIDTH,
                height: VIDEO_HEIGHT,
            }),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// The platform's capture api.
pub trait MediaDevices {
    /// false when the platform has no capture support at all
    fn is_supported(&self) -> bool;
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, BoxError>;
    fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, BoxError>;
}

/// device list for the settings screen; failures just mean an empty list
pub fn list_devices(devices: &dyn MediaDevices) -> Vec<DeviceInfo> {
    if !devices.is_supported() {
        return vec![];
    }
    match devices.enumerate_devices() {
        Ok(list) => list,
        Err(e) => {
            warn!("cannot enumerate devices: {}", e);
            vec![]
        }
    }
}

/// Result of one capture attempt: a stream, an error, or neither.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalMedia {
    stream: Option<MediaStream>,
    error: Option<String>,
}

impl LocalMedia {
    pub fn acquire(devices: &dyn MediaDevices, constraints: &MediaConstraints) -> LocalMedia {
        if !devices.is_supported() {
            warn!("media devices not supported");
            return LocalMedia {
                stream: None,
                error: Some("media devices not supported".to_string()),
            };
        }
        if constraints.is_empty() {
            debug!("no media requested");
            return LocalMedia::default();
        }
        match devices.get_user_media(constraints) {
            Ok(stream) => {
                info!("captured local stream {}", stream.id);
                LocalMedia {
                    stream: Some(stream),
                    error: None,
                }
            }
            Err(e) => {
                warn!("getUserMedia failed: {}", e);
                LocalMedia {
                    stream: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
