use crate::error::{Result, ScanError};
use crate::sample::{CameraPose, Modality, Resolution};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Where one sample of a tick ended up: chunk file name and frame index inside it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameLocation {
    pub file_name: String,
    pub frame: u64,
    pub resolution: Resolution,
}

impl FrameLocation {
    pub fn new<S: Into<String>>(file_name: S, frame: u64, resolution: Resolution) -> Self {
        Self {
            file_name: file_name.into(),
            frame,
            resolution,
        }
    }
}

/// Manifest entry for one recorded tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    /// Seconds since the UNIX epoch
    pub timestamp: f64,
    pub camera_euler_angle: [f32; 3],
    pub camera_intrinsics: [[f32; 3]; 3],
    pub camera_transform: [[f32; 4]; 4],
    pub camera_view_matrix: [[f32; 4]; 4],
    pub camera_projection_matrix: [[f32; 4]; 4],
    pub world_mapping_status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rgb_video_frame: Option<FrameLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth_video_frame: Option<FrameLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_video_frame: Option<FrameLocation>,
}

impl FrameInfo {
    pub fn new(timestamp: SystemTime, pose: &CameraPose) -> Self {
        let timestamp = timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        Self {
            timestamp,
            camera_euler_angle: pose.euler_angle,
            camera_intrinsics: pose.intrinsics,
            camera_transform: pose.transform,
            camera_view_matrix: pose.view_matrix,
            camera_projection_matrix: pose.projection_matrix,
            world_mapping_status: pose.world_mapping_status,
            rgb_video_frame: None,
            depth_video_frame: None,
            confidence_video_frame: None,
        }
    }

    /// Record where a 2D modality stored its sample for this tick
    pub fn set_location(&mut self, modality: Modality, location: FrameLocation) {
        match modality {
            Modality::Rgb => self.rgb_video_frame = Some(location),
            Modality::Depth => self.depth_video_frame = Some(location),
            Modality::Confidence => self.confidence_video_frame = Some(location),
            Modality::Manifest | Modality::Points => {}
        }
    }

    pub fn location(&self, modality: Modality) -> Option<&FrameLocation> {
        match modality {
            Modality::Rgb => self.rgb_video_frame.as_ref(),
            Modality::Depth => self.depth_video_frame.as_ref(),
            Modality::Confidence => self.confidence_video_frame.as_ref(),
            Modality::Manifest | Modality::Points => None,
        }
    }

    pub fn any_location(&self) -> bool {
        self.rgb_video_frame.is_some()
            || self.depth_video_frame.is_some()
            || self.confidence_video_frame.is_some()
    }
}

/// A marker (QR code) located in world space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerCode {
    pub location: [f32; 3],
    pub message: String,
}

impl MarkerCode {
    pub fn new<S: Into<String>>(location: [f32; 3], message: S) -> Self {
        Self {
            location,
            message: message.into(),
        }
    }

    pub fn squared_distance_to(&self, other: &MarkerCode) -> f32 {
        self.location
            .iter()
            .zip(other.location.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/// Markers collected over a whole recording
///
/// A detection within one meter of a known marker is the same marker.
#[derive(Debug, Clone, Default)]
pub struct MarkerSet {
    codes: Vec<MarkerCode>,
}

impl MarkerSet {
    const SAME_MARKER_SQUARED_DISTANCE: f32 = 1.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an already known marker is that close; returns whether it was new
    pub fn insert(&mut self, code: MarkerCode) -> bool {
        let known = self
            .codes
            .iter()
            .any(|c| c.squared_distance_to(&code) < Self::SAME_MARKER_SQUARED_DISTANCE);
        if !known {
            self.codes.push(code);
        }
        !known
    }

    pub fn codes(&self) -> &[MarkerCode] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Contents of one manifest chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameCollection {
    pub frames: Vec<FrameInfo>,
    /// Opaque world snapshot provided by the tracking session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_map: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_codes: Option<Vec<MarkerCode>>,
}

impl FrameCollection {
    /// Load a manifest chunk from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ScanError::chunk_format(path.display().to_string(), format!("invalid manifest: {}", e))
        })
    }

    /// Names of all chunk files referenced by the frames
    pub fn referenced_files(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .frames
            .iter()
            .flat_map(|f| {
                [
                    f.rgb_video_frame.as_ref(),
                    f.depth_video_frame.as_ref(),
                    f.confidence_video_frame.as_ref(),
                ]
            })
            .flatten()
            .map(|l| l.file_name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}
