use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ScanConfig {
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub points: PointsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

/// Per-scan recording options, fixed for the lifetime of a scan
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RecordingConfig {
    /// Expected sensor ticks per second
    #[serde(default = "default_rate")]
    pub rate: u32,

    /// Seconds of data per chunk before rotation
    #[serde(default = "default_sequence_seconds")]
    pub sequence_seconds: u32,

    /// Record the RGB image stream
    #[serde(default = "default_true")]
    pub record_rgb: bool,

    /// Record the depth stream
    #[serde(default = "default_true")]
    pub record_depth: bool,

    /// Record the depth confidence stream
    #[serde(default = "default_true")]
    pub record_confidence: bool,

    /// Capture a world snapshot before each manifest flush
    #[serde(default)]
    pub record_world_map: bool,

    /// Record thinned point candidates into LAS chunks
    #[serde(default = "default_true")]
    pub record_points: bool,

    /// Collect marker (QR code) detections into the manifest
    #[serde(default)]
    pub detect_markers: bool,

    /// Ticks between marker collection passes
    #[serde(default = "default_marker_interval")]
    pub marker_interval_ticks: u32,

    /// JPEG quality for RGB chunks (1-100)
    #[serde(default = "default_rgb_quality")]
    pub rgb_quality: u8,

    /// JPEG encoder threads per RGB chunk
    #[serde(default = "default_rgb_encode_workers")]
    pub rgb_encode_workers: usize,

    /// RGB frames waiting for an encoder before new frames are refused
    #[serde(default = "default_rgb_encode_backlog")]
    pub rgb_encode_backlog: usize,
}

impl RecordingConfig {
    /// Ticks accumulated before a coordinated rotation
    pub fn ticks_per_sequence(&self) -> u64 {
        self.rate as u64 * self.sequence_seconds as u64
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PointsConfig {
    /// Visualization and recording buffers kept in rotation
    #[serde(default = "default_buffers_in_flight")]
    pub buffers_in_flight: usize,

    /// Points per visualization buffer
    #[serde(default = "default_visual_capacity")]
    pub visual_capacity: usize,

    /// Points per recording buffer (one LAS chunk)
    #[serde(default = "default_recording_capacity")]
    pub recording_capacity: usize,

    /// Highest selection code treated as confident
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u8,

    /// Chance a confident point is shown
    #[serde(default = "default_visual_keep_probability")]
    pub visual_keep_probability: f64,

    /// Chance a confident point is recorded
    #[serde(default = "default_record_keep_probability")]
    pub record_keep_probability: f64,

    /// Fixed seed for the thinning generator, entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OutputConfig {
    /// Directory under which scan projects are created
    #[serde(default = "default_projects_path")]
    pub projects_path: String,

    #[serde(default = "default_rgb_extension")]
    pub rgb_extension: String,

    #[serde(default = "default_raw_extension")]
    pub depth_extension: String,

    #[serde(default = "default_raw_extension")]
    pub confidence_extension: String,

    #[serde(default = "default_manifest_extension")]
    pub manifest_extension: String,

    #[serde(default = "default_points_extension")]
    pub points_extension: String,
}

impl OutputConfig {
    pub fn projects_dir(&self) -> PathBuf {
        PathBuf::from(&self.projects_path)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Bytes of buffered and in-flight chunk data allowed before recording stops
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,

    /// Fraction of the memory limit treated as pressure
    #[serde(default = "default_memory_pressure_ratio")]
    pub memory_pressure_ratio: f64,

    /// Seconds to wait for outstanding chunk writes on shutdown
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

impl ScanConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("scanrec.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("recording.rate", default_rate())?
            .set_default("recording.sequence_seconds", default_sequence_seconds())?
            .set_default("recording.record_rgb", default_true())?
            .set_default("recording.record_depth", default_true())?
            .set_default("recording.record_confidence", default_true())?
            .set_default("recording.record_world_map", false)?
            .set_default("recording.record_points", default_true())?
            .set_default("recording.detect_markers", false)?
            .set_default(
                "recording.marker_interval_ticks",
                default_marker_interval(),
            )?
            .set_default("recording.rgb_quality", default_rgb_quality() as u64)?
            .set_default(
                "recording.rgb_encode_workers",
                default_rgb_encode_workers() as u64,
            )?
            .set_default(
                "recording.rgb_encode_backlog",
                default_rgb_encode_backlog() as u64,
            )?
            .set_default(
                "points.buffers_in_flight",
                default_buffers_in_flight() as u64,
            )?
            .set_default("points.visual_capacity", default_visual_capacity() as u64)?
            .set_default(
                "points.recording_capacity",
                default_recording_capacity() as u64,
            )?
            .set_default(
                "points.confidence_threshold",
                default_confidence_threshold() as u64,
            )?
            .set_default(
                "points.visual_keep_probability",
                default_visual_keep_probability(),
            )?
            .set_default(
                "points.record_keep_probability",
                default_record_keep_probability(),
            )?
            .set_default("output.projects_path", default_projects_path())?
            .set_default("output.rgb_extension", default_rgb_extension())?
            .set_default("output.depth_extension", default_raw_extension())?
            .set_default("output.confidence_extension", default_raw_extension())?
            .set_default("output.manifest_extension", default_manifest_extension())?
            .set_default("output.points_extension", default_points_extension())?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as u64,
            )?
            .set_default("system.memory_limit_bytes", default_memory_limit_bytes())?
            .set_default(
                "system.memory_pressure_ratio",
                default_memory_pressure_ratio(),
            )?
            .set_default(
                "system.shutdown_timeout_seconds",
                default_shutdown_timeout_seconds(),
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // SCANREC_RECORDING__RATE=30 etc; field names contain single underscores
            .add_source(
                Environment::with_prefix("SCANREC")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: ScanConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Render the configuration as TOML, the format `load_from_file` reads
    pub fn to_toml(&self) -> crate::error::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let recording = &self.recording;
        if recording.rate == 0 {
            return Err(ConfigError::Message(
                "Recording rate must be greater than 0".to_string(),
            ));
        }

        if recording.sequence_seconds == 0 {
            return Err(ConfigError::Message(
                "Recording sequence_seconds must be greater than 0".to_string(),
            ));
        }

        if recording.rgb_quality == 0 || recording.rgb_quality > 100 {
            return Err(ConfigError::Message(
                "Recording rgb_quality must be between 1 and 100".to_string(),
            ));
        }

        if recording.rgb_encode_workers == 0 || recording.rgb_encode_backlog == 0 {
            return Err(ConfigError::Message(
                "Recording needs at least one rgb encoder and a backlog of one frame".to_string(),
            ));
        }

        if recording.detect_markers && recording.marker_interval_ticks == 0 {
            return Err(ConfigError::Message(
                "Marker interval must be greater than 0".to_string(),
            ));
        }

        let points = &self.points;
        if points.buffers_in_flight == 0 {
            return Err(ConfigError::Message(
                "Points buffers_in_flight must be greater than 0".to_string(),
            ));
        }

        if points.visual_capacity < 2 || points.recording_capacity == 0 {
            return Err(ConfigError::Message(
                "Point buffer capacities are too small".to_string(),
            ));
        }

        for (name, p) in [
            ("visual_keep_probability", points.visual_keep_probability),
            ("record_keep_probability", points.record_keep_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Message(format!(
                    "Points {} must be within 0.0 and 1.0",
                    name
                )));
            }
        }

        let output = &self.output;
        if output.projects_path.trim().is_empty() {
            return Err(ConfigError::Message(
                "Output projects_path must not be empty".to_string(),
            ));
        }

        for ext in [
            &output.rgb_extension,
            &output.depth_extension,
            &output.confidence_extension,
            &output.manifest_extension,
            &output.points_extension,
        ] {
            if ext.is_empty() || ext.contains('.') || ext.contains('/') {
                return Err(ConfigError::Message(format!(
                    "Invalid file extension: {:?}",
                    ext
                )));
            }
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.system.memory_pressure_ratio)
            || self.system.memory_pressure_ratio == 0.0
        {
            return Err(ConfigError::Message(
                "Memory pressure ratio must be within (0.0, 1.0]".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            sequence_seconds: default_sequence_seconds(),
            record_rgb: true,
            record_depth: true,
            record_confidence: true,
            record_world_map: false,
            record_points: true,
            detect_markers: false,
            marker_interval_ticks: default_marker_interval(),
            rgb_quality: default_rgb_quality(),
            rgb_encode_workers: default_rgb_encode_workers(),
            rgb_encode_backlog: default_rgb_encode_backlog(),
        }
    }
}

impl Default for PointsConfig {
    fn default() -> Self {
        Self {
            buffers_in_flight: default_buffers_in_flight(),
            visual_capacity: default_visual_capacity(),
            recording_capacity: default_recording_capacity(),
            confidence_threshold: default_confidence_threshold(),
            visual_keep_probability: default_visual_keep_probability(),
            record_keep_probability: default_record_keep_probability(),
            seed: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            projects_path: default_projects_path(),
            rgb_extension: default_rgb_extension(),
            depth_extension: default_raw_extension(),
            confidence_extension: default_raw_extension(),
            manifest_extension: default_manifest_extension(),
            points_extension: default_points_extension(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            event_bus_capacity: default_event_bus_capacity(),
            memory_limit_bytes: default_memory_limit_bytes(),
            memory_pressure_ratio: default_memory_pressure_ratio(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

/// Documented default configuration, printed by `--print-config`
pub const DEFAULT_CONFIG_TOML: &str = r#"# scanrec configuration

[recording]
rate = 60                    # sensor ticks per second
sequence_seconds = 10        # seconds per chunk before rotation
record_rgb = true
record_depth = true
record_confidence = true
record_world_map = false
record_points = true
detect_markers = false
marker_interval_ticks = 6
rgb_quality = 50             # JPEG quality 1-100
rgb_encode_workers = 2       # JPEG encoder threads per rgb chunk
rgb_encode_backlog = 30      # frames waiting for an encoder before frames are dropped

[points]
buffers_in_flight = 3
visual_capacity = 250000
recording_capacity = 1000000
confidence_threshold = 1     # 0 = edge, 1 = surface
visual_keep_probability = 0.1
record_keep_probability = 1.0
# seed = 42                  # fixed thinning seed for reproducible runs

[output]
projects_path = "./projects"
rgb_extension = "mjpeg"
depth_extension = "raw"
confidence_extension = "raw"
manifest_extension = "json"
points_extension = "las"

[system]
event_bus_capacity = 100
memory_limit_bytes = 2147483648
memory_pressure_ratio = 0.9
shutdown_timeout_seconds = 30
"#;

// Default value functions
fn default_true() -> bool {
    true
}
fn default_rate() -> u32 {
    60
}
fn default_sequence_seconds() -> u32 {
    10
}
fn default_marker_interval() -> u32 {
    6
}
fn default_rgb_quality() -> u8 {
    50
}
fn default_rgb_encode_workers() -> usize {
    2
}
fn default_rgb_encode_backlog() -> usize {
    30
}

fn default_buffers_in_flight() -> usize {
    3
}
fn default_visual_capacity() -> usize {
    250_000
}
fn default_recording_capacity() -> usize {
    1_000_000
}
fn default_confidence_threshold() -> u8 {
    1
}
fn default_visual_keep_probability() -> f64 {
    0.1
}
fn default_record_keep_probability() -> f64 {
    1.0
}

fn default_projects_path() -> String {
    "./projects".to_string()
}
fn default_rgb_extension() -> String {
    "mjpeg".to_string()
}
fn default_raw_extension() -> String {
    "raw".to_string()
}
fn default_manifest_extension() -> String {
    "json".to_string()
}
fn default_points_extension() -> String {
    "las".to_string()
}

fn default_event_bus_capacity() -> usize {
    100
}
fn default_memory_limit_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}
fn default_memory_pressure_ratio() -> f64 {
    0.9
}
fn default_shutdown_timeout_seconds() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ScanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recording.ticks_per_sequence(), 600);
        assert_eq!(config.points.buffers_in_flight, 3);
        assert_eq!(config.output.rgb_extension, "mjpeg");
    }

    #[test]
    fn test_documented_defaults_match() {
        let parsed: ScanConfig = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        let defaults = ScanConfig::default();
        assert_eq!(parsed.recording, defaults.recording);
        assert_eq!(parsed.points, defaults.points);
        assert_eq!(parsed.output, defaults.output);
        assert_eq!(parsed.system, defaults.system);
    }

    #[test]
    fn test_effective_config_reloads() {
        let mut config = ScanConfig::default();
        config.recording.rate = 30;
        config.points.seed = Some(11);

        let rendered = config.to_toml().unwrap();
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        file.write_all(rendered.as_bytes()).unwrap();

        let loaded = ScanConfig::load_from_file(file.path()).unwrap();
        assert_eq!(loaded.recording, config.recording);
        assert_eq!(loaded.points, config.points);
        assert_eq!(loaded.system, config.system);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[recording]\nrate = 30\nrecord_depth = false\n\n[points]\nseed = 7\n"
        )
        .unwrap();

        let config = ScanConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.recording.rate, 30);
        assert!(!config.recording.record_depth);
        assert!(config.recording.record_rgb);
        assert_eq!(config.recording.sequence_seconds, 10);
        assert_eq!(config.points.seed, Some(7));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ScanConfig::load_from_file("/nonexistent/scanrec-config").unwrap();
        assert_eq!(config.recording.rate, 60);
        assert_eq!(config.points.seed, None);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ScanConfig::default();
        config.recording.rate = 0;
        assert!(config.validate().is_err());
        config.recording.rate = 60;

        config.points.visual_keep_probability = 1.5;
        assert!(config.validate().is_err());
        config.points.visual_keep_probability = 0.1;

        config.output.depth_extension = ".raw".to_string();
        assert!(config.validate().is_err());
        config.output.depth_extension = "raw".to_string();

        config.recording.rgb_quality = 0;
        assert!(config.validate().is_err());
        config.recording.rgb_quality = 90;

        config.recording.rgb_encode_backlog = 0;
        assert!(config.validate().is_err());
        config.recording.rgb_encode_backlog = 30;

        assert!(config.validate().is_ok());
    }
}
