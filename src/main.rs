use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scanrec::config::DEFAULT_CONFIG_TOML;
use scanrec::{
    CameraPose, EventBus, EventFilter, EventReceiver, GeoLocation, MarkerCode, PlaneSample,
    PointCandidate, ProgressSink, Project, SampleFormat, ScanConfig, ScanEvent, ScanRecorder,
    SelectionType, SensorTick, TickOutcome,
};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "scanrec")]
#[command(about = "Record multi-modal scanning sessions into chunked project directories")]
#[command(version)]
#[command(long_about = "Records point candidates, RGB, depth and confidence frames into a \
project directory of rotating chunk files with JSON manifests. Without a sensor attached \
the recorder is driven by a synthetic capture source.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "scanrec.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without recording")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Print the loaded configuration and exit
    #[arg(long, help = "Print the effective configuration (file, environment and defaults merged) and exit")]
    dump_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Stop after this many seconds of synthetic capture
    #[arg(long, value_name = "SECONDS", help = "Record synthetic ticks for this many seconds (default: until Ctrl+C)")]
    simulate_seconds: Option<u64>,

    /// Project name
    #[arg(short, long, help = "Project directory name (default: timestamped)")]
    project: Option<String>,

    /// Scan latitude
    #[arg(long, requires = "longitude", allow_negative_numbers = true)]
    latitude: Option<f64>,

    /// Scan longitude
    #[arg(long, requires = "latitude", allow_negative_numbers = true)]
    longitude: Option<f64>,

    /// Synthetic frame width
    #[arg(long, default_value_t = 64)]
    width: u32,

    /// Synthetic frame height
    #[arg(long, default_value_t = 48)]
    height: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", DEFAULT_CONFIG_TOML);
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting scanrec v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = ScanConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;

    if args.dump_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let location = match (args.latitude, args.longitude) {
        (Some(latitude), Some(longitude)) => Some(GeoLocation {
            latitude,
            longitude,
        }),
        _ => None,
    };
    let project_name = args.project.clone().unwrap_or_else(Project::default_name);

    let events = EventBus::new(config.system.event_bus_capacity);
    let monitor = tokio::spawn(monitor_events(EventReceiver::new(
        events.subscribe(),
        EventFilter::EventTypes(vec!["chunk_written", "points_skipped", "memory_pressure"]),
        "monitor".to_string(),
    )));

    let mut recorder =
        ScanRecorder::begin_recording(&config, &project_name, location, events, &Handle::current())
            .context("Failed to begin recording")?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received SIGINT signal (Ctrl+C)");
            signal_token.cancel();
        }
    });

    let limit = args.simulate_seconds.map(Duration::from_secs);
    let mut source = SyntheticSource::new(args.width, args.height, config.points.seed);
    let ticks = drive(&mut recorder, &mut source, config.recording.rate, limit, &token).await;

    let progress: Arc<dyn ProgressSink> =
        Arc::new(|p: f32| info!("Writing remaining chunks: {:.0}%", p * 100.0));
    recorder.stop_recording(Some(progress))?;
    let settled = recorder.shutdown().await;

    let stats = recorder.stats();
    info!(
        "Recorded {} ticks ({} driven), {} rotations, {} samples dropped, {} chunks written, {} failed",
        stats.ticks,
        ticks,
        stats.rotations,
        stats.samples_dropped,
        stats.flushes.finished,
        stats.flushes.failed
    );
    if let Some(points) = stats.points {
        info!(
            "Points: {} recorded, {} truncated, {} ticks skipped",
            points.points_recorded, points.points_truncated, points.ticks_skipped
        );
    }
    println!("{}", recorder.project().root().display());

    drop(recorder);
    monitor.abort();

    settled.context("Chunk writes did not settle")?;
    Ok(())
}

/// Feed synthetic ticks at the configured rate until cancelled, timed out or pressured
async fn drive(
    recorder: &mut ScanRecorder,
    source: &mut SyntheticSource,
    rate: u32,
    limit: Option<Duration>,
    token: &CancellationToken,
) -> u64 {
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / rate.max(1) as f64));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();
    let mut driven = 0u64;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        if limit.map_or(false, |limit| started.elapsed() >= limit) {
            info!("Simulation time elapsed");
            break;
        }

        let tick = source.next_tick();
        driven += 1;
        match recorder.tick(&tick) {
            TickOutcome::Recorded(report) => {
                if report.rotated {
                    debug!("Rotated chunks at tick {}", report.tick);
                }
            }
            TickOutcome::StopRequested => {
                warn!("Memory pressure, stopping the scan");
                break;
            }
            TickOutcome::Ignored => break,
        }
    }
    driven
}

async fn monitor_events(mut receiver: EventReceiver) {
    while let Ok(event) = receiver.recv().await {
        match event {
            ScanEvent::ChunkWritten {
                file_name,
                frames,
                ok: true,
                ..
            } => info!("Chunk {} written ({} frames)", file_name, frames),
            other => debug!("{}", other.description()),
        }
    }
}

/// Synthetic sensor: a camera walking along a corridor of colored points
struct SyntheticSource {
    width: u32,
    height: u32,
    rng: StdRng,
    tick: u64,
}

impl SyntheticSource {
    fn new(width: u32, height: u32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            width: width.max(1),
            height: height.max(1),
            rng,
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> SensorTick {
        let tick = self.tick;
        self.tick += 1;
        let walked = tick as f32 * 0.01;

        let mut pose = CameraPose::default();
        pose.transform[3][0] = walked;

        let pixels = (self.width * self.height) as usize;
        let shade = (tick % 256) as u8;
        let image: Vec<u8> = (0..pixels)
            .flat_map(|i| [shade, (i % 256) as u8, 255 - shade])
            .collect();
        let depth: Vec<u8> = (0..pixels)
            .flat_map(|i| (1.0f32 + (i % self.width as usize) as f32 * 0.01).to_le_bytes())
            .collect();
        let confidence: Vec<u8> = (0..pixels).map(|i| (i % 3) as u8).collect();

        let points: Vec<PointCandidate> = (0..256)
            .map(|i| {
                let angle = i as f32 / 256.0 * std::f32::consts::TAU;
                PointCandidate {
                    position: [walked, angle.cos(), angle.sin()],
                    color: [angle.cos().abs(), angle.sin().abs(), 0.5],
                    confidence: self.rng.gen_range(0.0..1.0),
                    timestamp: (tick * 1000 / 60) as u32,
                    selection: match self.rng.gen_range(0..10) {
                        0..=5 => SelectionType::EdgeSelected,
                        6..=7 => SelectionType::SurfaceSelected,
                        8 => SelectionType::DepthDeleted,
                        _ => SelectionType::DistanceDeleted,
                    },
                    capture_distance: 1.0,
                }
            })
            .collect();

        let mut sample = SensorTick::new(SystemTime::now(), pose)
            .with_points(points)
            .with_image(PlaneSample::new(image, self.width, self.height, SampleFormat::Rgb8))
            .with_depth(PlaneSample::new(depth, self.width, self.height, SampleFormat::Depth32F))
            .with_confidence(PlaneSample::new(
                confidence,
                self.width,
                self.height,
                SampleFormat::Confidence8,
            ));

        if tick % 120 == 0 {
            sample = sample.with_markers(vec![MarkerCode::new(
                [walked, 0.0, 1.5],
                format!("marker-{}", tick / 120),
            )]);
        }
        sample
    }
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("scanrec={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}
