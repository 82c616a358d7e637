use crate::error::Result;
use crate::sample::{PointCandidate, SelectionType};
use crate::sequence::partial_path;
use las::{Builder, Color, Point, Writer};
use std::fs;
use std::path::Path;

/// Write points as an uncompressed LAS 1.4 chunk (format 3: GPS time and color)
///
/// Intensity carries the confidence, user data the selection code and the
/// GPS time the capture timestamp in seconds. Points of a "deleted" class are
/// flagged withheld. The chunk is written under a partial name and renamed.
pub fn write_las_chunk(path: &Path, points: &[PointCandidate]) -> Result<u64> {
    let partial = partial_path(path);

    let outcome = (|| -> Result<u64> {
        let mut builder = Builder::from((1, 4));
        builder.point_format.has_color = true;
        builder.point_format.has_gps_time = true;
        builder.point_format.is_compressed = false;
        let header = builder.into_header()?;

        let mut writer = Writer::from_path(&partial, header)?;
        for candidate in points {
            writer.write_point(to_las_point(candidate))?;
        }
        writer.close()?;
        drop(writer);

        let written = fs::metadata(&partial)?.len();
        fs::rename(&partial, path)?;
        Ok(written)
    })();

    if outcome.is_err() {
        let _ = fs::remove_file(&partial);
    }
    outcome
}

fn to_las_point(candidate: &PointCandidate) -> Point {
    let channel = |c: f32| (c.clamp(0.0, 1.0) * u16::MAX as f32) as u16;

    let mut point = Point::default();
    point.x = candidate.position[0] as f64;
    point.y = candidate.position[1] as f64;
    point.z = candidate.position[2] as f64;
    point.intensity = (candidate.confidence.clamp(0.0, 1.0) * u16::MAX as f32) as u16;
    point.user_data = candidate.selection.code();
    point.gps_time = Some(candidate.timestamp as f64 / 1000.0);
    point.is_withheld = matches!(
        candidate.selection,
        SelectionType::DepthDeleted | SelectionType::SurfaceDeleted | SelectionType::DistanceDeleted
    );
    point.color = Some(Color::new(
        channel(candidate.color[0]),
        channel(candidate.color[1]),
        channel(candidate.color[2]),
    ));
    point
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const POINT_DATA_OFFSET_AT: usize = 96;
    const FORMAT_3_RECORD_LEN: u64 = 34;

    #[test]
    fn test_chunk_holds_every_point() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("points@1.000000.las");

        let points: Vec<PointCandidate> = (0..25)
            .map(|i| PointCandidate {
                position: [i as f32 * 0.01, 1.5, -0.25],
                color: [0.5, 0.25, 1.0],
                confidence: 0.75,
                timestamp: 1000 + i,
                selection: SelectionType::SurfaceSelected,
                capture_distance: 1.2,
            })
            .collect();

        let written = write_las_chunk(&path, &points).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(written, bytes.len() as u64);
        assert_eq!(&bytes[..4], b"LASF");

        let at = POINT_DATA_OFFSET_AT;
        let offset = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        assert_eq!(
            bytes.len() as u64 - offset as u64,
            points.len() as u64 * FORMAT_3_RECORD_LEN
        );
        assert!(!temp_dir.path().join("points@1.000000.las.partial").exists());
    }

    #[test]
    fn test_point_mapping() {
        let point = to_las_point(&PointCandidate {
            position: [1.0, 2.0, 3.0],
            color: [1.0, 0.0, 2.0],
            confidence: 1.0,
            timestamp: 2500,
            selection: SelectionType::DistanceDeleted,
            capture_distance: 4.0,
        });
        assert_eq!(point.z, 3.0);
        assert_eq!(point.user_data, 4);
        assert_eq!(point.gps_time, Some(2.5));
        assert!(point.is_withheld);
        assert_eq!(point.color, Some(Color::new(u16::MAX, 0, u16::MAX)));
    }
}
