use crate::sample::{Modality, Resolution};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Last stamp handed out, so two names generated in the same microsecond still differ
static LAST_STAMP_MICROS: AtomicI64 = AtomicI64::new(0);

fn next_stamp_micros() -> i64 {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_STAMP_MICROS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_STAMP_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Identity of one output stream and its current chunk file
#[derive(Debug, Clone)]
pub struct SequenceMetaInfo {
    modality: Modality,
    extension: String,
    rate: u32,
    resolution: Option<Resolution>,
    directory: PathBuf,
    file_name: String,
}

impl SequenceMetaInfo {
    pub fn new<P: Into<PathBuf>, E: Into<String>>(
        modality: Modality,
        extension: E,
        rate: u32,
        directory: P,
    ) -> Self {
        let mut meta = Self {
            modality,
            extension: extension.into(),
            rate,
            resolution: None,
            directory: directory.into(),
            file_name: String::new(),
        };
        meta.refresh_file_name();
        meta
    }

    /// Pick a new `prefix@<secs>.<micros>.<ext>` name
    pub fn refresh_file_name(&mut self) {
        let stamp = next_stamp_micros();
        self.file_name = format!(
            "{}@{}.{:06}.{}",
            self.modality.prefix(),
            stamp.div_euclid(1_000_000),
            stamp.rem_euclid(1_000_000),
            self.extension
        );
    }

    /// Latch the stream resolution; false if a different one was latched before
    pub fn latch_resolution(&mut self, resolution: Resolution) -> bool {
        match self.resolution {
            None => {
                self.resolution = Some(resolution);
                true
            }
            Some(latched) => latched == resolution,
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn prefix(&self) -> &'static str {
        self.modality.prefix()
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Presentation interval between two samples
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.rate.max(1) as u64)
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn full_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

/// Split a chunk file name into its modality and stamp (seconds since epoch)
pub fn parse_chunk_name(file_name: &str) -> Option<(Modality, f64)> {
    let (prefix, rest) = file_name.split_once('@')?;
    let modality = Modality::from_prefix(prefix)?;
    let (stamp, _extension) = rest.rsplit_once('.')?;
    let stamp = stamp.parse::<f64>().ok()?;
    Some((modality, stamp))
}
