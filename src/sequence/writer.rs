use crate::error::Result;
use crate::manifest::FrameLocation;
use crate::sample::Modality;
use crate::sequence::meta::SequenceMetaInfo;
use crate::stage::Stage;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Outcome of one chunk flush, handed to the writer delegate
#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub modality: Modality,
    pub path: PathBuf,
    pub frames: u64,
    /// In-memory bytes the flushed buffer held
    pub buffered_bytes: u64,
    /// Bytes written to disk, or the failure message
    pub result: std::result::Result<u64, String>,
}

impl ChunkReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Receives a completion signal for every flushed chunk, failed ones included
pub trait WriterDelegate: Send + Sync {
    /// A flush was handed to the blocking pool
    fn file_queued(&self, _modality: Modality) {}

    fn file_written(&self, report: ChunkReport);
}

/// Append-then-flush contract shared by every modality writer
///
/// A writer accepts samples while `Ready`; `seal` moves it to `Writing` for
/// good, after which appends are refused and the buffer belongs to the flush.
pub trait SequenceWriter: Send + 'static {
    type Sample;

    fn meta(&self) -> &SequenceMetaInfo;

    fn stage(&self) -> Stage;

    /// Append a sample; false (and no mutation) when writing or mismatched
    fn append(&mut self, sample: Self::Sample) -> bool;

    fn frames_written(&self) -> u64;

    /// Bytes currently held in memory
    fn buffered_bytes(&self) -> u64;

    /// Stop accepting samples
    fn seal(&mut self);

    /// Serialize the whole buffer to `path`, returning the bytes written
    fn write_chunk(&mut self, path: &Path) -> Result<u64>;

    fn is_writing(&self) -> bool {
        self.stage() == Stage::Writing
    }

    /// Location of the most recently accepted sample
    fn last_location(&self) -> Option<FrameLocation> {
        let frames = self.frames_written();
        if frames == 0 {
            return None;
        }
        let meta = self.meta();
        Some(FrameLocation::new(
            meta.file_name(),
            frames - 1,
            meta.resolution()?,
        ))
    }
}

/// Name a chunk carries while it is still being written
pub fn partial_path(path: &Path) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    PathBuf::from(partial)
}

/// Write a file under a `.partial` name and rename it into place once complete
pub fn write_atomically<F>(path: &Path, fill: F) -> Result<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let partial = partial_path(path);

    let outcome = (|| -> Result<u64> {
        let mut out = BufWriter::new(File::create(&partial)?);
        fill(&mut out)?;
        out.flush()?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        let written = file.metadata()?.len();
        fs::rename(&partial, path)?;
        Ok(written)
    })();

    if outcome.is_err() {
        let _ = fs::remove_file(&partial);
    }
    outcome
}

/// Seal the writer and serialize it on the blocking pool
///
/// Sealing happens on the caller, so chunks of one modality are handed over
/// in tick order. The writer is consumed; the delegate hears about the result
/// whether or not the write succeeded.
pub fn spawn_flush<W>(
    mut writer: W,
    handle: &Handle,
    delegate: Arc<dyn WriterDelegate>,
) -> JoinHandle<()>
where
    W: SequenceWriter,
{
    writer.seal();
    let modality = writer.meta().modality();
    let path = writer.meta().full_path();
    debug!("Queued {} flush to {}", modality, path.display());
    delegate.file_queued(modality);

    handle.spawn_blocking(move || {
        let started = Instant::now();
        let frames = writer.frames_written();
        let buffered_bytes = writer.buffered_bytes();

        let result = writer.write_chunk(&path).map_err(|e| e.to_string());
        match &result {
            Ok(bytes) => info!(
                "Wrote {} chunk {} ({} frames, {} bytes) in {:?}",
                modality,
                path.display(),
                frames,
                bytes,
                started.elapsed()
            ),
            Err(e) => error!("Failed to write {} chunk {}: {}", modality, path.display(), e),
        }

        // The writer is done for good, its buffer goes with it
        drop(writer);

        delegate.file_written(ChunkReport {
            modality,
            path,
            frames,
            buffered_bytes,
            result,
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomically_renames() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("depth@1.000000.raw");

        let written = write_atomically(&path, |out| {
            out.write_all(&[7u8; 64])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(written, 64);
        assert_eq!(fs::read(&path).unwrap(), vec![7u8; 64]);
        assert!(!temp_dir.path().join("depth@1.000000.raw.partial").exists());
    }

    #[test]
    fn test_write_atomically_cleans_up_on_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("depth@2.000000.raw");

        let result = write_atomically(&path, |out| {
            out.write_all(&[1u8; 8])?;
            Err(crate::error::ScanError::system("encoder gave up"))
        });

        assert!(result.is_err());
        assert!(!path.exists());
        assert!(!temp_dir.path().join("depth@2.000000.raw.partial").exists());
    }
}
