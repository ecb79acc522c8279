use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use roadtag_fusion::batch::BatchRecompute;
use roadtag_fusion::sensor_fusion::FusionConfig;
use roadtag_fusion::storage;

/// Batch-only reprocessing of a recorded session (no live pass, no GPS).
#[derive(Parser, Debug)]
struct Args {
    /// Raw sensor log (.csv) or session export (.json / .json.gz)
    #[arg(long)]
    input: PathBuf,

    /// Corrected trajectory CSV
    #[arg(long, default_value = "imu_data.csv")]
    output: PathBuf,

    /// Fusion config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Complementary filter weight on the propagated attitude
    #[arg(long)]
    alpha: Option<f64>,

    /// Magnetic declination in degrees
    #[arg(long)]
    declination_deg: Option<f64>,

    /// Append roll,pitch,yaw columns
    #[arg(long, default_value_t = false)]
    with_orientation: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FusionConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FusionConfig::default(),
    };
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    if let Some(deg) = args.declination_deg {
        config.magnetic_declination_rad = deg.to_radians();
    }
    config.validate()?;

    let buffer = storage::load_session_buffer(&args.input)
        .with_context(|| format!("loading {}", args.input.display()))?;
    println!(
        "[{}] {} accel / {} gyro / {} mag samples from {}",
        ts_now(),
        buffer.accel().len(),
        buffer.gyro().len(),
        buffer.mag().len(),
        args.input.display()
    );
    if buffer.accel().is_empty() {
        anyhow::bail!("no accelerometer samples in {}", args.input.display());
    }

    let output = BatchRecompute::new(&config).run(&buffer);

    let file = File::create(&args.output).with_context(|| format!("creating {}", args.output.display()))?;
    storage::write_trajectory_csv(BufWriter::new(file), &output.trajectory, args.with_orientation)?;

    println!("[{}] Yaw drift rate: {:.6} rad/sample", ts_now(), output.drift_rate);
    if let Some(last) = output.trajectory.last() {
        println!(
            "[{}] End: pos=({:.2}, {:.2}, {:.2}) m  rpy=({:.1}, {:.1}, {:.1})°",
            ts_now(),
            last.x,
            last.y,
            last.z,
            last.roll.to_degrees(),
            last.pitch.to_degrees(),
            last.yaw.to_degrees()
        );
    }
    println!(
        "[{}] Wrote {} records to {}",
        ts_now(),
        output.trajectory.len(),
        args.output.display()
    );
    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
