use crate::manifest::MarkerCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Pixel layout of a 2D sample plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Interleaved 8-bit RGB
    Rgb8,
    /// 32-bit float depth in meters
    Depth32F,
    /// 8-bit confidence level (0 = low, 2 = high)
    Confidence8,
}

impl SampleFormat {
    /// Get bytes per pixel for the format
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            SampleFormat::Rgb8 => 3,
            SampleFormat::Depth32F => 4,
            SampleFormat::Confidence8 => 1,
        }
    }
}

/// Output stream of a scan, one chunk family per variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Rgb,
    Depth,
    Confidence,
    Manifest,
    Points,
}

impl Modality {
    /// File name prefix of this stream's chunks
    pub fn prefix(&self) -> &'static str {
        match self {
            Modality::Rgb => "rgb",
            Modality::Depth => "depth",
            Modality::Confidence => "confidence",
            Modality::Manifest => "frameCollection",
            Modality::Points => "points",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        [
            Modality::Rgb,
            Modality::Depth,
            Modality::Confidence,
            Modality::Manifest,
            Modality::Points,
        ]
        .into_iter()
        .find(|m| m.prefix() == prefix)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Width and height of a sample stream, serialized as `[width, height]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(u32, u32)", into = "(u32, u32)")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(resolution: Resolution) -> Self {
        (resolution.width, resolution.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One 2D sample buffer (image, depth or confidence) of a sensor tick
#[derive(Debug, Clone)]
pub struct PlaneSample {
    /// Raw plane bytes, row-major (shared ownership, never mutated)
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes, may include padding
    pub bytes_per_row: usize,
    pub format: SampleFormat,
}

impl PlaneSample {
    /// Create a tightly packed plane
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: SampleFormat) -> Self {
        Self {
            data: Arc::new(data),
            width,
            height,
            bytes_per_row: width as usize * format.bytes_per_pixel(),
            format,
        }
    }

    /// Create a plane whose rows carry padding
    pub fn with_stride(
        data: Vec<u8>,
        width: u32,
        height: u32,
        bytes_per_row: usize,
        format: SampleFormat,
    ) -> Self {
        Self {
            data: Arc::new(data),
            width,
            height,
            bytes_per_row,
            format,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Bytes one frame of this plane occupies in a raw chunk
    pub fn frame_size(&self) -> usize {
        self.bytes_per_row * self.height as usize
    }

    /// Validate the data length against the declared layout
    pub fn validate_size(&self) -> bool {
        self.data.len() >= self.frame_size()
            && self.bytes_per_row >= self.width as usize * self.format.bytes_per_pixel()
    }

    /// Copy out the pixel rows without stride padding
    pub fn packed_rows(&self) -> Vec<u8> {
        let row_len = self.width as usize * self.format.bytes_per_pixel();
        if row_len == self.bytes_per_row {
            return self.data[..self.frame_size()].to_vec();
        }

        let mut packed = Vec::with_capacity(row_len * self.height as usize);
        for row in self.data.chunks(self.bytes_per_row).take(self.height as usize) {
            packed.extend_from_slice(&row[..row_len]);
        }
        packed
    }
}

/// Classification of a candidate point, assigned by the selection stage upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SelectionType {
    /// Lies on an edge of the luminance image
    EdgeSelected = 0,
    /// Randomly kept surface point
    SurfaceSelected = 1,
    /// Lies on a depth discontinuity
    DepthDeleted = 2,
    /// Randomly dropped surface point
    SurfaceDeleted = 3,
    /// Outside the accepted capture distance
    DistanceDeleted = 4,
}

impl SelectionType {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Whether the point passes a caller supplied confidence threshold
    pub fn is_confident(&self, threshold: u8) -> bool {
        self.code() <= threshold
    }
}

/// A classified 3D point candidate produced once per tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointCandidate {
    pub position: [f32; 3],
    /// RGB in 0.0..=1.0
    pub color: [f32; 3],
    pub confidence: f32,
    /// Milliseconds since application start
    pub timestamp: u32,
    pub selection: SelectionType,
    pub capture_distance: f32,
}

impl Default for PointCandidate {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            color: [0.0; 3],
            confidence: 0.0,
            timestamp: 0,
            selection: SelectionType::DistanceDeleted,
            capture_distance: 0.0,
        }
    }
}

/// Camera state at the time of a tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraPose {
    pub euler_angle: [f32; 3],
    /// Column-major 3x3
    pub intrinsics: [[f32; 3]; 3],
    /// Column-major 4x4 camera-to-world
    pub transform: [[f32; 4]; 4],
    pub view_matrix: [[f32; 4]; 4],
    pub projection_matrix: [[f32; 4]; 4],
    pub world_mapping_status: i32,
}

impl Default for CameraPose {
    fn default() -> Self {
        let identity = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        Self {
            euler_angle: [0.0; 3],
            intrinsics: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            transform: identity,
            view_matrix: identity,
            projection_matrix: identity,
            world_mapping_status: 0,
        }
    }
}

/// Everything the capture driver hands over for one tick
#[derive(Debug, Clone)]
pub struct SensorTick {
    pub timestamp: SystemTime,
    pub points: Arc<[PointCandidate]>,
    pub image: Option<PlaneSample>,
    pub depth: Option<PlaneSample>,
    pub confidence: Option<PlaneSample>,
    pub pose: CameraPose,
    /// Markers the upstream detector located in world space this tick
    pub markers: Vec<MarkerCode>,
}

impl SensorTick {
    /// Create a tick with no samples attached
    pub fn new(timestamp: SystemTime, pose: CameraPose) -> Self {
        Self {
            timestamp,
            points: Arc::from(Vec::new()),
            image: None,
            depth: None,
            confidence: None,
            pose,
            markers: Vec::new(),
        }
    }

    pub fn with_points(mut self, points: Vec<PointCandidate>) -> Self {
        self.points = Arc::from(points);
        self
    }

    pub fn with_image(mut self, plane: PlaneSample) -> Self {
        self.image = Some(plane);
        self
    }

    pub fn with_depth(mut self, plane: PlaneSample) -> Self {
        self.depth = Some(plane);
        self
    }

    pub fn with_confidence(mut self, plane: PlaneSample) -> Self {
        self.confidence = Some(plane);
        self
    }

    pub fn with_markers(mut self, markers: Vec<MarkerCode>) -> Self {
        self.markers = markers;
        self
    }

    /// Seconds since the UNIX epoch, truncated
    pub fn unix_seconds(&self) -> i64 {
        self.timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}
