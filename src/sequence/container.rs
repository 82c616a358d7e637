use crate::error::{Result, ScanError};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Magic number for image chunk containers: "SRIC"
const CONTAINER_MAGIC: [u8; 4] = *b"SRIC";
const CONTAINER_VERSION: u32 = 1;
const CONTAINER_HEADER_SIZE: usize = 32;
const FRAME_COUNT_OFFSET: u64 = 20;

/// Header of an image chunk container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub width: u32,
    pub height: u32,
    pub rate: u32,
    pub frame_count: u32,
}

/// One encoded frame read back from a container
#[derive(Debug, Clone)]
pub struct ContainerFrame {
    /// Offset from the start of the chunk
    pub presentation_time: Duration,
    pub index: u32,
    pub data: Vec<u8>,
}

/// Writes length-prefixed encoded frames behind a fixed header
///
/// Layout: magic, version, width, height, rate, frame count, 8 reserved bytes;
/// then per frame: presentation time (u64 ns), index (u32), length (u32), bytes.
/// All integers are little endian.
pub struct ContainerWriter<W: Write + Seek> {
    out: W,
    header: ContainerHeader,
}

impl ContainerWriter<BufWriter<File>> {
    pub fn create(path: &Path, width: u32, height: u32, rate: u32) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            ScanError::component(
                "container",
                format!("Failed to create {}: {}", path.display(), e),
            )
        })?;
        Self::new(BufWriter::new(file), width, height, rate)
    }
}

impl<W: Write + Seek> ContainerWriter<W> {
    pub fn new(mut out: W, width: u32, height: u32, rate: u32) -> Result<Self> {
        let header = ContainerHeader {
            width,
            height,
            rate,
            frame_count: 0,
        };

        let mut bytes = Vec::with_capacity(CONTAINER_HEADER_SIZE);
        bytes.extend_from_slice(&CONTAINER_MAGIC);
        bytes.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
        bytes.extend_from_slice(&width.to_le_bytes());
        bytes.extend_from_slice(&height.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        // Frame count placeholder, patched on finish
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.resize(CONTAINER_HEADER_SIZE, 0);
        out.write_all(&bytes)?;

        Ok(Self { out, header })
    }

    /// Append one encoded frame
    pub fn append(&mut self, presentation_time: Duration, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| ScanError::component("container", "Frame larger than 4 GiB"))?;

        self.out
            .write_all(&(presentation_time.as_nanos() as u64).to_le_bytes())?;
        self.out.write_all(&self.header.frame_count.to_le_bytes())?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(data)?;
        self.header.frame_count += 1;
        Ok(())
    }

    pub fn frame_count(&self) -> u32 {
        self.header.frame_count
    }

    /// Patch the frame count into the header and hand back the sink
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(FRAME_COUNT_OFFSET))?;
        self.out.write_all(&self.header.frame_count.to_le_bytes())?;
        self.out.seek(SeekFrom::Start(end))?;
        self.out.flush()?;

        debug!("Finished container ({} frames)", self.header.frame_count);
        Ok(self.out)
    }
}

/// Streaming container reader
pub struct ContainerReader<R: Read> {
    input: R,
    header: ContainerHeader,
    path: PathBuf,
}

impl ContainerReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::new(BufReader::new(file), path.to_path_buf())
    }
}

impl<R: Read> ContainerReader<R> {
    pub fn new(mut input: R, path: PathBuf) -> Result<Self> {
        let display = path.display().to_string();
        let mut header = [0u8; CONTAINER_HEADER_SIZE];
        input
            .read_exact(&mut header)
            .map_err(|e| ScanError::chunk_format(&display, format!("short header: {}", e)))?;

        if header[0..4] != CONTAINER_MAGIC {
            return Err(ScanError::chunk_format(&display, "bad magic number"));
        }

        let word = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
        let version = word(4);
        if version != CONTAINER_VERSION {
            return Err(ScanError::chunk_format(
                &display,
                format!("unsupported version {}", version),
            ));
        }

        let header = ContainerHeader {
            width: word(8),
            height: word(12),
            rate: word(16),
            frame_count: word(20),
        };

        Ok(Self {
            input,
            header,
            path,
        })
    }

    pub fn header(&self) -> ContainerHeader {
        self.header
    }

    /// Read the next frame (None on clean EOF)
    pub fn next_frame(&mut self) -> Result<Option<ContainerFrame>> {
        let mut pts = [0u8; 8];
        match self.input.read_exact(&mut pts) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut word = [0u8; 4];
        self.input
            .read_exact(&mut word)
            .map_err(|e| self.truncated(e))?;
        let index = u32::from_le_bytes(word);
        self.input
            .read_exact(&mut word)
            .map_err(|e| self.truncated(e))?;
        let len = u32::from_le_bytes(word) as usize;

        let mut data = vec![0u8; len];
        self.input
            .read_exact(&mut data)
            .map_err(|e| self.truncated(e))?;

        Ok(Some(ContainerFrame {
            presentation_time: Duration::from_nanos(u64::from_le_bytes(pts)),
            index,
            data,
        }))
    }

    /// Read every remaining frame
    pub fn read_all(&mut self) -> Result<Vec<ContainerFrame>> {
        let mut frames = Vec::with_capacity(self.header.frame_count as usize);
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn truncated(&self, e: std::io::Error) -> ScanError {
        ScanError::chunk_format(self.path.display().to_string(), format!("truncated frame: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_container_write_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rgb@1.000000.mjpeg");

        let mut writer = ContainerWriter::create(&path, 640, 480, 60).unwrap();
        for i in 0..10u8 {
            let pts = Duration::from_nanos(16_666_666 * i as u64);
            writer.append(pts, &vec![i; 100 + i as usize]).unwrap();
        }
        assert_eq!(writer.frame_count(), 10);
        writer.finish().unwrap();

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(
            reader.header(),
            ContainerHeader {
                width: 640,
                height: 480,
                rate: 60,
                frame_count: 10
            }
        );

        let frames = reader.read_all().unwrap();
        assert_eq!(frames.len(), 10);
        assert_eq!(frames[3].index, 3);
        assert_eq!(frames[3].data, vec![3u8; 103]);
        assert_eq!(frames[9].presentation_time, Duration::from_nanos(16_666_666 * 9));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let bytes = vec![0u8; CONTAINER_HEADER_SIZE];
        let result = ContainerReader::new(Cursor::new(bytes), PathBuf::from("bogus"));
        assert!(matches!(result, Err(ScanError::ChunkFormat { .. })));
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut writer = ContainerWriter::new(Cursor::new(Vec::new()), 2, 2, 30).unwrap();
        writer.append(Duration::ZERO, &[1, 2, 3, 4]).unwrap();
        let mut bytes = writer.finish().unwrap().into_inner();
        bytes.truncate(bytes.len() - 2);

        let mut reader = ContainerReader::new(Cursor::new(bytes), PathBuf::from("cut")).unwrap();
        assert_eq!(reader.header().frame_count, 1);
        assert!(reader.next_frame().is_err());
    }
}
