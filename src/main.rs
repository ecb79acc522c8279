use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};

use roadtag_fusion::pipeline::{spawn_fusion, FusionInput};
use roadtag_fusion::sensor_fusion::FusionConfig;
use roadtag_fusion::storage::{self, CsvSink, SessionExport};
use roadtag_fusion::types::GpsFix;

#[derive(Parser, Debug)]
#[command(name = "roadtag")]
#[command(about = "Replay a recorded session through live fusion, then batch-correct it", long_about = None)]
struct Args {
    /// Session export (.json / .json.gz) or raw sensor log (.csv)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Extra GPS fixes as a JSON array (for raw sensor logs)
    #[arg(long)]
    gps: Option<PathBuf>,

    /// Fusion config JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Complementary filter weight on the propagated attitude
    #[arg(long)]
    alpha: Option<f64>,

    /// GPS position blend weight
    #[arg(long)]
    gps_alpha: Option<f64>,

    /// Magnetic declination in degrees
    #[arg(long)]
    declination_deg: Option<f64>,

    /// Minimum spacing of live output records (ms)
    #[arg(long)]
    output_interval_ms: Option<u64>,

    /// Write corrected output to its own file instead of replacing the live log
    #[arg(long, default_value_t = false)]
    keep_live: bool,

    /// Append roll,pitch,yaw columns to the corrected log
    #[arg(long, default_value_t = false)]
    with_orientation: bool,

    /// Also save the replayed session as a gzip export
    #[arg(long, default_value_t = false)]
    export: bool,

    /// Output directory
    #[arg(long, default_value = "roadtag_sessions")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = build_config(&args)?;

    println!("[{}] RoadTag fusion replay starting", ts_now());
    println!("  Input: {}", args.input.display());
    println!("  Alpha: {}  GPS alpha: {}", config.alpha, config.gps_alpha);

    let mut buffer = storage::load_session_buffer(&args.input)
        .with_context(|| format!("loading {}", args.input.display()))?;
    if let Some(gps_path) = &args.gps {
        let text = fs::read_to_string(gps_path).with_context(|| format!("reading {}", gps_path.display()))?;
        let fixes: Vec<GpsFix> = serde_json::from_str(&text).context("parsing GPS fixes")?;
        for fix in fixes {
            buffer.push_gps(fix)?;
        }
    }
    println!(
        "[{}] Loaded {} accel, {} gyro, {} mag samples and {} GPS fixes",
        ts_now(),
        buffer.accel().len(),
        buffer.gyro().len(),
        buffer.mag().len(),
        buffer.gps().len()
    );

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;
    let stamp = ts_now_clean();
    let live_path = args.output_dir.join(format!("imu_data_{}.csv", stamp));
    let mut sink = CsvSink::create(&live_path)?.with_orientation(args.with_orientation);
    if args.keep_live {
        sink = sink.corrected_to(args.output_dir.join(format!("imu_corrected_{}.csv", stamp)));
    }

    let handle = spawn_fusion(config, sink);
    handle.start().await?;
    for item in buffer.chronological() {
        handle.send(FusionInput::from(item)).await?;
    }
    handle.stop().await?;
    let outcome = handle.shutdown().await?;

    if args.export {
        let path = args.output_dir.join(format!("session_{}.json.gz", stamp));
        let metadata = outcome.sessions.first().map(|s| s.metadata.clone());
        storage::save_session_export(&path, &SessionExport::from_buffer(metadata, &buffer))?;
        println!("[{}] Session export saved to {}", ts_now(), path.display());
    }

    for report in &outcome.sessions {
        print_summary(report, &live_path);
    }
    Ok(())
}

fn build_config(args: &Args) -> Result<FusionConfig> {
    let mut config = match &args.config {
        Some(path) => FusionConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FusionConfig::default(),
    };
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    if let Some(gps_alpha) = args.gps_alpha {
        config.gps_alpha = gps_alpha;
    }
    if let Some(deg) = args.declination_deg {
        config.magnetic_declination_rad = deg.to_radians();
    }
    if let Some(interval) = args.output_interval_ms {
        config.output_interval_ms = interval;
    }
    config.validate()?;
    Ok(config)
}

fn print_summary(report: &roadtag_fusion::pipeline::SessionReport, live_path: &Path) {
    let meta = &report.metadata;
    println!("\n=== Session {} ===", meta.session_id);
    println!("Duration: {:.1} s", meta.duration_ms() as f64 / 1000.0);
    println!(
        "Samples: {} accel / {} gyro / {} mag",
        meta.accel_sample_count, meta.gyro_sample_count, meta.mag_sample_count
    );
    println!("GPS: {} accepted, {} rejected", meta.gps_accepted, meta.gps_rejected);
    println!("GPS distance (first to last fix): {:.1} m", meta.distance_meters);
    println!("Live records: {} -> {}", meta.records_emitted, live_path.display());
    if meta.sink_errors > 0 {
        println!("Sink write failures: {}", meta.sink_errors);
    }
    match &report.batch {
        Some(batch) => {
            println!("Yaw drift rate: {:.6} rad/sample", batch.drift_rate);
            if let Some(last) = batch.trajectory.last() {
                println!("Corrected end position: ({:.2}, {:.2}, {:.2}) m", last.x, last.y, last.z);
            }
        }
        None => println!("Batch correction cancelled"),
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
