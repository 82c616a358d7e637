use crate::config::RecordingConfig;
use crate::error::{Result, ScanError};
use crate::manifest::FrameCollection;
use crate::sample::Modality;
use crate::sequence::parse_chunk_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the per-project metadata file
pub const METADATA_FILE: &str = "metadata.json";

/// Where a scan was taken
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Scan-level metadata, written when recording starts and again when it stops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanMetadata {
    pub scan_id: String,
    pub project_name: String,
    pub scan_start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    pub rate: u32,
    pub sequence_seconds: u32,
    pub save_point_cloud: bool,
    #[serde(rename = "saveRGBVideo")]
    pub save_rgb_video: bool,
    pub rgb_quality: u8,
    pub save_depth_video: bool,
    pub save_confidence_video: bool,
    pub save_world_map_info: bool,
    #[serde(rename = "detectQRCodes")]
    pub detect_qr_codes: bool,
}

impl ScanMetadata {
    pub fn new(project_name: &str, recording: &RecordingConfig, location: Option<GeoLocation>) -> Self {
        Self {
            scan_id: uuid::Uuid::new_v4().to_string(),
            project_name: project_name.to_string(),
            scan_start: Utc::now(),
            scan_end: None,
            latitude: location.map(|l| l.latitude),
            longitude: location.map(|l| l.longitude),
            rate: recording.rate,
            sequence_seconds: recording.sequence_seconds,
            save_point_cloud: recording.record_points,
            save_rgb_video: recording.record_rgb,
            rgb_quality: recording.rgb_quality,
            save_depth_video: recording.record_depth,
            save_confidence_video: recording.record_confidence,
            save_world_map_info: recording.record_world_map,
            detect_qr_codes: recording.detect_markers,
        }
    }

    pub fn location(&self) -> Option<GeoLocation> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoLocation {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }

    /// Scan duration, if the scan has ended
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.scan_end.map(|end| end - self.scan_start)
    }
}

/// Root directory of one scan's chunk files and metadata
#[derive(Debug, Clone)]
pub struct Project {
    name: String,
    root: PathBuf,
}

impl Project {
    /// Create a fresh project directory under `base`
    ///
    /// Fails if the directory cannot be created or already holds a scan.
    pub fn create<P: AsRef<Path>>(base: P, name: &str) -> Result<Self> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ScanError::component(
                "project",
                format!("Invalid project name {:?}", name),
            ));
        }

        let root = base.as_ref().join(name);
        if root.join(METADATA_FILE).exists() {
            return Err(ScanError::component(
                "project",
                format!("Project {} already exists", root.display()),
            ));
        }

        fs::create_dir_all(&root).map_err(|e| {
            ScanError::component(
                "project",
                format!("Failed to create project directory {}: {}", root.display(), e),
            )
        })?;

        info!("Created project {} at {}", name, root.display());
        Ok(Self {
            name: name.to_string(),
            root,
        })
    }

    /// Open an existing project directory
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ScanError::component(
                "project",
                format!("{} is not a project directory", root.display()),
            ));
        }
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self { name, root })
    }

    /// Timestamped project name used when none is given
    pub fn default_name() -> String {
        format!("scan_{}", Utc::now().format("%Y%m%d_%H%M%S"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn write_metadata(&self, metadata: &ScanMetadata) -> Result<()> {
        let json = serde_json::to_vec_pretty(metadata)?;
        let path = self.metadata_path();
        fs::write(&path, json)?;
        debug!("Saved metadata to {}", path.display());
        Ok(())
    }

    pub fn load_metadata(&self) -> Result<ScanMetadata> {
        let data = fs::read(self.metadata_path())?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Chunk files of one modality, oldest first
    pub fn chunk_files(&self, modality: Modality) -> Result<Vec<PathBuf>> {
        let mut chunks = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let parsed = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_chunk_name);
            if let Some((found, stamp)) = parsed {
                if found == modality && path.is_file() {
                    chunks.push((stamp, path));
                }
            }
        }
        chunks.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(chunks.into_iter().map(|(_, path)| path).collect())
    }

    pub fn manifests(&self) -> Result<Vec<PathBuf>> {
        self.chunk_files(Modality::Manifest)
    }

    pub fn load_manifest<P: AsRef<Path>>(&self, path: P) -> Result<FrameCollection> {
        let path = path.as_ref();
        if path.is_absolute() {
            FrameCollection::load(path)
        } else {
            FrameCollection::load(self.root.join(path))
        }
    }

    /// Resolve a file name referenced from a manifest
    pub fn resolve(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FrameInfo;
    use crate::sample::CameraPose;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_reopen_project() {
        let temp_dir = TempDir::new().unwrap();
        let project = Project::create(temp_dir.path(), "hall").unwrap();
        assert!(project.root().is_dir());
        assert_eq!(project.name(), "hall");

        let mut metadata = ScanMetadata::new(
            "hall",
            &RecordingConfig::default(),
            Some(GeoLocation {
                latitude: 48.2,
                longitude: 16.37,
            }),
        );
        project.write_metadata(&metadata).unwrap();
        metadata.scan_end = Some(metadata.scan_start + chrono::Duration::seconds(42));
        project.write_metadata(&metadata).unwrap();

        let reopened = Project::open(project.root()).unwrap();
        let loaded = reopened.load_metadata().unwrap();
        assert_eq!(loaded, metadata);
        assert_eq!(loaded.duration(), Some(chrono::Duration::seconds(42)));
        assert_eq!(loaded.location().unwrap().latitude, 48.2);

        // The same project cannot be started twice
        assert!(Project::create(temp_dir.path(), "hall").is_err());
    }

    #[test]
    fn test_metadata_json_shape() {
        let metadata = ScanMetadata::new("hall", &RecordingConfig::default(), None);
        let json = serde_json::to_value(&metadata).unwrap();
        assert!(json.get("scanStart").is_some());
        assert!(json.get("saveRGBVideo").is_some());
        assert!(json.get("detectQRCodes").is_some());
        assert!(json.get("scanEnd").is_none());
        assert!(json.get("latitude").is_none());
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Project::create(temp_dir.path(), "").is_err());
        assert!(Project::create(temp_dir.path(), "../escape").is_err());
        assert!(Project::create(temp_dir.path(), "..").is_err());
    }

    #[test]
    fn test_chunk_listing_orders_by_stamp() {
        let temp_dir = TempDir::new().unwrap();
        let project = Project::create(temp_dir.path(), "walk").unwrap();

        for name in [
            "frameCollection@1700000010.000000.json",
            "frameCollection@1700000000.500000.json",
            "depth@1700000000.000000.raw",
            "depth@1700000000.000000.raw.partial",
            "notes.txt",
        ] {
            fs::write(project.resolve(name), b"{\"frames\":[]}").unwrap();
        }

        let manifests = project.manifests().unwrap();
        assert_eq!(manifests.len(), 2);
        assert!(manifests[0].ends_with("frameCollection@1700000000.500000.json"));
        assert_eq!(project.chunk_files(Modality::Depth).unwrap().len(), 1);
        assert!(project.chunk_files(Modality::Rgb).unwrap().is_empty());
    }

    #[test]
    fn test_load_manifest_relative_to_root() {
        let temp_dir = TempDir::new().unwrap();
        let project = Project::create(temp_dir.path(), "walk").unwrap();

        let collection = FrameCollection {
            frames: vec![FrameInfo::new(std::time::SystemTime::now(), &CameraPose::default())],
            world_map: None,
            qr_codes: None,
        };
        let name = "frameCollection@1700000000.000000.json";
        fs::write(project.resolve(name), serde_json::to_vec(&collection).unwrap()).unwrap();

        assert_eq!(project.load_manifest(name).unwrap(), collection);
    }
}
