use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use scanrec::{
    manifest::FrameLocation,
    project::Project,
    sample::{Modality, SampleFormat},
    sequence::{ContainerReader, RawChunkReader},
};
use serde::Serialize;
use tracing::{error, info, warn};

/// Inspect a recorded project and check its manifests against the chunk files.
#[derive(Parser, Debug)]
#[command(name = "chunktool")]
#[command(about = "Inspect and verify scanrec project directories")]
struct Args {
    /// Project directory (the one holding metadata.json)
    #[arg(short, long)]
    input: PathBuf,

    /// Extract the JPEG frames of every rgb chunk into this directory
    #[arg(long, value_name = "DIR")]
    extract_rgb: Option<PathBuf>,

    /// Print the JSON summary on one line
    #[arg(long)]
    compact: bool,
}

#[derive(Debug, Serialize, Default)]
struct ManifestSummary {
    file_name: String,
    frames: usize,
    has_world_map: bool,
    markers: usize,
    missing_files: Vec<String>,
    out_of_range: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ProjectSummary {
    project: String,
    scan_id: Option<String>,
    scan_start: Option<String>,
    scan_end: Option<String>,
    chunks: BTreeMap<String, usize>,
    manifests: Vec<ManifestSummary>,
    unchecked_files: Vec<String>,
    ok: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let project = Project::open(&args.input)
        .with_context(|| format!("Failed to open project {}", args.input.display()))?;

    let summary = inspect(&project)?;

    if let Some(dir) = &args.extract_rgb {
        let extracted = extract_rgb(&project, dir)?;
        info!("Extracted {} frames into {}", extracted, dir.display());
    }

    let json = if args.compact {
        serde_json::to_string(&summary)?
    } else {
        serde_json::to_string_pretty(&summary)?
    };
    println!("{}", json);

    if !summary.ok {
        return Err(anyhow!(
            "Project {} has unresolved frame references",
            project.root().display()
        ));
    }
    Ok(())
}

fn inspect(project: &Project) -> Result<ProjectSummary> {
    let metadata = match project.load_metadata() {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!("No readable metadata in {}: {}", project.root().display(), e);
            None
        }
    };

    let mut chunks = BTreeMap::new();
    for modality in [
        Modality::Rgb,
        Modality::Depth,
        Modality::Confidence,
        Modality::Manifest,
        Modality::Points,
    ] {
        chunks.insert(
            modality.prefix().to_string(),
            project.chunk_files(modality)?.len(),
        );
    }

    let mut counts = FrameCounts::default();
    let mut manifests = Vec::new();
    for path in project.manifests()? {
        let file_name = display_name(&path);
        let collection = match project.load_manifest(&path) {
            Ok(collection) => collection,
            Err(e) => {
                error!("Failed to read manifest {}: {}", file_name, e);
                manifests.push(ManifestSummary {
                    file_name: file_name.clone(),
                    missing_files: vec![file_name],
                    ..Default::default()
                });
                continue;
            }
        };

        let mut summary = ManifestSummary {
            file_name,
            frames: collection.frames.len(),
            has_world_map: collection.world_map.is_some(),
            markers: collection.qr_codes.as_ref().map_or(0, |codes| codes.len()),
            ..Default::default()
        };

        for frame in &collection.frames {
            for modality in [Modality::Rgb, Modality::Depth, Modality::Confidence] {
                if let Some(location) = frame.location(modality) {
                    check_location(project, modality, location, &mut counts, &mut summary);
                }
            }
        }
        summary.missing_files.sort();
        summary.missing_files.dedup();
        manifests.push(summary);
    }

    let ok = manifests
        .iter()
        .all(|m| m.missing_files.is_empty() && m.out_of_range.is_empty());

    Ok(ProjectSummary {
        project: project.name().to_string(),
        scan_id: metadata.as_ref().map(|m| m.scan_id.clone()),
        scan_start: metadata.as_ref().map(|m| m.scan_start.to_rfc3339()),
        scan_end: metadata
            .as_ref()
            .and_then(|m| m.scan_end)
            .map(|end| end.to_rfc3339()),
        chunks,
        manifests,
        unchecked_files: counts.unchecked,
        ok,
    })
}

/// Frame counts per chunk file, read once
#[derive(Default)]
struct FrameCounts {
    known: HashMap<String, Option<u64>>,
    unchecked: Vec<String>,
}

impl FrameCounts {
    fn get(&mut self, path: &Path, modality: Modality, location: &FrameLocation) -> Option<u64> {
        if let Some(count) = self.known.get(&location.file_name) {
            return *count;
        }

        let count = match frame_count(path, modality, location) {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Cannot count frames of {}: {}", location.file_name, e);
                self.unchecked.push(location.file_name.clone());
                None
            }
        };
        self.known.insert(location.file_name.clone(), count);
        count
    }
}

fn frame_count(path: &Path, modality: Modality, location: &FrameLocation) -> Result<u64> {
    let format = match modality {
        Modality::Rgb => {
            let reader = ContainerReader::open(path)?;
            return Ok(reader.header().frame_count as u64);
        }
        Modality::Depth => SampleFormat::Depth32F,
        Modality::Confidence => SampleFormat::Confidence8,
        other => return Err(anyhow!("{} chunks carry no frames", other)),
    };

    // Stride padding is not recorded in the manifest; padded chunks stay unchecked
    let frame_size = location.resolution.pixel_count() * format.bytes_per_pixel();
    let reader = RawChunkReader::open(path, frame_size)?;
    Ok(reader.frame_count())
}

fn check_location(
    project: &Project,
    modality: Modality,
    location: &FrameLocation,
    counts: &mut FrameCounts,
    summary: &mut ManifestSummary,
) {
    let path = project.resolve(&location.file_name);
    if !path.is_file() {
        summary.missing_files.push(location.file_name.clone());
        return;
    }

    if let Some(count) = counts.get(&path, modality, location) {
        if location.frame >= count {
            summary.out_of_range.push(format!(
                "{}#{} (of {})",
                location.file_name, location.frame, count
            ));
        }
    }
}

fn extract_rgb(project: &Project, output: &Path) -> Result<usize> {
    fs::create_dir_all(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let mut extracted = 0;
    for path in project.chunk_files(Modality::Rgb)? {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("rgb")
            .to_string();
        let mut reader = ContainerReader::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        while let Some(frame) = reader.next_frame()? {
            let target = output.join(format!("{}_{:05}.jpg", stem, frame.index));
            fs::write(&target, &frame.data)
                .with_context(|| format!("Failed to write {}", target.display()))?;
            extracted += 1;
        }
    }
    Ok(extracted)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
