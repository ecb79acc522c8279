//! On-disk formats: session exports (JSON, optionally gzip), the raw sensor
//! log and trajectory CSVs.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{FusionError, FusionResult};
use crate::pipeline::RecordSink;
use crate::session::{SessionBuffer, SessionMetadata};
use crate::types::{GpsFix, PositionRecord, SensorKind, SensorSample, TrajectoryRecord};

pub const RAW_SENSOR_HEADER: &str = "timestamp,sensor_type,value_x,value_y,value_z";
pub const POSITION_HEADER: &str = "timestamp,position_x,position_y,position_z";
const ORIENTATION_COLUMNS: &str = ",roll,pitch,yaw";

// ─── Session export ──────────────────────────────────────────────────────────

/// Everything captured during one recording, for replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionExport {
    #[serde(default)]
    pub metadata: Option<SessionMetadata>,
    #[serde(default)]
    pub accel: Vec<SensorSample>,
    #[serde(default)]
    pub gyro: Vec<SensorSample>,
    #[serde(default)]
    pub mag: Vec<SensorSample>,
    #[serde(default)]
    pub gps: Vec<GpsFix>,
}

impl SessionExport {
    pub fn from_buffer(metadata: Option<SessionMetadata>, buffer: &SessionBuffer) -> Self {
        Self {
            metadata,
            accel: buffer.accel().to_vec(),
            gyro: buffer.gyro().to_vec(),
            mag: buffer.mag().to_vec(),
            gps: buffer.gps().to_vec(),
        }
    }

    /// Rebuild the buffer, checking kinds per stream and ordering.
    pub fn to_buffer(&self) -> FusionResult<SessionBuffer> {
        let streams = [
            (SensorKind::Accel, &self.accel),
            (SensorKind::Gyro, &self.gyro),
            (SensorKind::Mag, &self.mag),
        ];
        for (kind, samples) in streams {
            if let Some(bad) = samples.iter().find(|s| s.kind != kind) {
                return Err(FusionError::InvalidMeasurement {
                    kind: bad.kind,
                    reason: format!("found in the {} stream at {}", kind, bad.timestamp),
                });
            }
        }
        SessionBuffer::from_samples(
            self.accel.iter().chain(&self.gyro).chain(&self.mag).copied(),
            self.gps.iter().copied(),
        )
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

pub fn save_session_export(path: &Path, export: &SessionExport) -> FusionResult<()> {
    let file = File::create(path)?;
    if is_gzip(path) {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, export)?;
        encoder.finish()?.flush()?;
    } else {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, export)?;
        writer.flush()?;
    }
    info!("[storage] saved session export to {}", path.display());
    Ok(())
}

pub fn load_session_export(path: &Path) -> FusionResult<SessionExport> {
    let file = File::open(path)?;
    let export = if is_gzip(path) {
        serde_json::from_reader(BufReader::new(GzDecoder::new(file)))?
    } else {
        serde_json::from_reader(BufReader::new(file))?
    };
    Ok(export)
}

/// Load a recorded session: `.csv` is read as a raw sensor log (no GPS),
/// anything else as a session export.
pub fn load_session_buffer(path: &Path) -> FusionResult<SessionBuffer> {
    if path.extension().map(|e| e == "csv").unwrap_or(false) {
        let samples = read_raw_sensor_csv(path)?;
        // Raw logs interleave kinds; each stream must still be ordered
        SessionBuffer::from_samples(samples, Vec::new())
    } else {
        load_session_export(path)?.to_buffer()
    }
}

// ─── Raw sensor log ──────────────────────────────────────────────────────────

/// Parse `timestamp,sensor_type,value_x,value_y,value_z` rows. The header is
/// required; blank lines are skipped. Errors name the 1-based line.
pub fn parse_raw_sensor_csv<R: BufRead>(reader: R) -> FusionResult<Vec<SensorSample>> {
    let mut samples = Vec::new();
    let mut header_seen = false;

    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !header_seen {
            if line != RAW_SENSOR_HEADER {
                return Err(FusionError::Parse {
                    line: line_no,
                    reason: format!("expected header '{}'", RAW_SENSOR_HEADER),
                });
            }
            header_seen = true;
            continue;
        }
        samples.push(parse_raw_row(line, line_no)?);
    }

    if !header_seen {
        return Err(FusionError::Parse { line: 1, reason: "missing header".to_string() });
    }
    Ok(samples)
}

fn parse_raw_row(line: &str, line_no: usize) -> FusionResult<SensorSample> {
    let parse_err = |reason: String| FusionError::Parse { line: line_no, reason };
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 5 {
        return Err(parse_err(format!("expected 5 fields, found {}", fields.len())));
    }
    let timestamp = fields[0]
        .parse::<u64>()
        .map_err(|e| parse_err(format!("bad timestamp '{}': {}", fields[0], e)))?;
    let kind = SensorKind::from_label(fields[1])
        .ok_or_else(|| parse_err(format!("unknown sensor type '{}'", fields[1])))?;
    let mut values = [0.0; 3];
    for (value, field) in values.iter_mut().zip(&fields[2..]) {
        *value = field
            .parse::<f64>()
            .map_err(|e| parse_err(format!("bad value '{}': {}", field, e)))?;
    }
    Ok(SensorSample::new(kind, timestamp, values[0], values[1], values[2]))
}

pub fn read_raw_sensor_csv(path: &Path) -> FusionResult<Vec<SensorSample>> {
    parse_raw_sensor_csv(BufReader::new(File::open(path)?))
}

pub fn write_raw_sensor_csv<W: Write>(mut writer: W, samples: &[SensorSample]) -> FusionResult<()> {
    writeln!(writer, "{}", RAW_SENSOR_HEADER)?;
    for s in samples {
        writeln!(writer, "{},{},{},{},{}", s.timestamp, s.kind.label(), s.x, s.y, s.z)?;
    }
    writer.flush()?;
    Ok(())
}

// ─── Trajectory logs ─────────────────────────────────────────────────────────

fn write_position_row<W: Write>(writer: &mut W, r: &PositionRecord) -> std::io::Result<()> {
    writeln!(writer, "{},{},{},{}", r.timestamp, r.x, r.y, r.z)
}

pub fn write_position_csv<W: Write>(mut writer: W, records: &[PositionRecord]) -> FusionResult<()> {
    writeln!(writer, "{}", POSITION_HEADER)?;
    for r in records {
        write_position_row(&mut writer, r)?;
    }
    writer.flush()?;
    Ok(())
}

/// Corrected trajectory, optionally with `roll,pitch,yaw` (radians) appended.
pub fn write_trajectory_csv<W: Write>(
    mut writer: W,
    records: &[TrajectoryRecord],
    with_orientation: bool,
) -> FusionResult<()> {
    if with_orientation {
        writeln!(writer, "{}{}", POSITION_HEADER, ORIENTATION_COLUMNS)?;
    } else {
        writeln!(writer, "{}", POSITION_HEADER)?;
    }
    for r in records {
        if with_orientation {
            writeln!(writer, "{},{},{},{},{},{},{}", r.timestamp, r.x, r.y, r.z, r.roll, r.pitch, r.yaw)?;
        } else {
            write_position_row(&mut writer, &r.position())?;
        }
    }
    writer.flush()?;
    Ok(())
}

// ─── CSV sink ────────────────────────────────────────────────────────────────

/// Streams live records to a CSV file. On `replace_all` the corrected
/// trajectory overwrites that file, or goes to a separate file if one was
/// configured.
pub struct CsvSink {
    live_path: PathBuf,
    corrected_path: Option<PathBuf>,
    with_orientation: bool,
    writer: Option<BufWriter<File>>,
}

impl CsvSink {
    pub fn create<P: Into<PathBuf>>(live_path: P) -> FusionResult<Self> {
        let live_path = live_path.into();
        let mut writer = BufWriter::new(File::create(&live_path)?);
        writeln!(writer, "{}", POSITION_HEADER)?;
        Ok(Self { live_path, corrected_path: None, with_orientation: false, writer: Some(writer) })
    }

    pub fn corrected_to<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.corrected_path = Some(path.into());
        self
    }

    pub fn with_orientation(mut self, enabled: bool) -> Self {
        self.with_orientation = enabled;
        self
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    pub fn flush(&mut self) -> FusionResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl RecordSink for CsvSink {
    fn append(&mut self, record: &PositionRecord) -> FusionResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| FusionError::Sink(format!("{} already replaced", self.live_path.display())))?;
        write_position_row(writer, record)?;
        Ok(())
    }

    fn replace_all(&mut self, trajectory: &[TrajectoryRecord]) -> FusionResult<()> {
        let target = match self.corrected_path.clone() {
            Some(path) => {
                self.flush()?;
                path
            }
            None => {
                // Live file is overwritten; close it first
                if let Some(mut writer) = self.writer.take() {
                    writer.flush()?;
                }
                self.live_path.clone()
            }
        };
        write_trajectory_csv(BufWriter::new(File::create(&target)?), trajectory, self.with_orientation)?;
        info!("[storage] wrote {} corrected records to {}", trajectory.len(), target.display());
        Ok(())
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Orientation, Vec3};
    use std::io::Cursor;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("roadtag_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_parse_raw_log() {
        let text = "timestamp,sensor_type,value_x,value_y,value_z\n\
                    1000,ACCEL,0.1,0.2,9.8\n\
                    \n\
                    1005,GYRO,0.0,0.0,0.01\n\
                    1010,MAG,20.5,-3.0,-40.0\n";
        let samples = parse_raw_sensor_csv(Cursor::new(text)).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], SensorSample::accel(1000, 0.1, 0.2, 9.8));
        assert_eq!(samples[2].kind, SensorKind::Mag);
    }

    #[test]
    fn test_parse_errors_name_line() {
        let missing_header = "1000,ACCEL,0,0,9.8\n";
        assert!(matches!(
            parse_raw_sensor_csv(Cursor::new(missing_header)),
            Err(FusionError::Parse { line: 1, .. })
        ));

        let bad_kind = format!("{}\n1,ACCEL,0,0,1\n2,BARO,0,0,1\n", RAW_SENSOR_HEADER);
        assert!(matches!(
            parse_raw_sensor_csv(Cursor::new(bad_kind)),
            Err(FusionError::Parse { line: 3, .. })
        ));

        let short_row = format!("{}\n1,ACCEL,0,0\n", RAW_SENSOR_HEADER);
        assert!(matches!(
            parse_raw_sensor_csv(Cursor::new(short_row)),
            Err(FusionError::Parse { line: 2, .. })
        ));

        assert!(matches!(parse_raw_sensor_csv(Cursor::new("")), Err(FusionError::Parse { .. })));
    }

    #[test]
    fn test_raw_log_written_readably() {
        let samples = vec![SensorSample::gyro(7, 0.5, -0.25, 1e-3), SensorSample::mag(9, 1.0, 2.0, 3.0)];
        let mut out = Vec::new();
        write_raw_sensor_csv(&mut out, &samples).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(RAW_SENSOR_HEADER));
        assert!(text.contains("7,GYRO,0.5,-0.25,0.001"));
        assert_eq!(parse_raw_sensor_csv(Cursor::new(text)).unwrap(), samples);
    }

    #[test]
    fn test_trajectory_csv_columns() {
        let record = TrajectoryRecord::new(42, &Vec3::new(1.0, 2.0, 3.0), &Orientation::identity());
        let mut plain = Vec::new();
        write_trajectory_csv(&mut plain, &[record], false).unwrap();
        assert_eq!(String::from_utf8(plain).unwrap(), format!("{}\n42,1,2,3\n", POSITION_HEADER));

        let mut full = Vec::new();
        write_trajectory_csv(&mut full, &[record], true).unwrap();
        let text = String::from_utf8(full).unwrap();
        assert!(text.starts_with("timestamp,position_x,position_y,position_z,roll,pitch,yaw\n"));
        assert_eq!(text.lines().nth(1).map(|l| l.split(',').count()), Some(7));
    }

    #[test]
    fn test_session_export_gzip() {
        let buffer = SessionBuffer::from_samples(
            vec![SensorSample::accel(0, 0.0, 0.0, 9.81), SensorSample::gyro(1, 0.0, 0.0, 0.1)],
            vec![GpsFix::new(2, 52.0, 13.0, 34.0).with_accuracy(4.0)],
        )
        .unwrap();
        let path = temp_path("export.json.gz");
        save_session_export(&path, &SessionExport::from_buffer(None, &buffer)).unwrap();
        let loaded = load_session_export(&path).unwrap().to_buffer().unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, buffer);
    }

    #[test]
    fn test_export_rejects_misfiled_sample() {
        let export = SessionExport {
            gyro: vec![SensorSample::accel(0, 0.0, 0.0, 9.81)],
            ..SessionExport::default()
        };
        assert!(matches!(export.to_buffer(), Err(FusionError::InvalidMeasurement { .. })));
    }

    #[test]
    fn test_csv_sink_overwrites_live_file() {
        let path = temp_path("live.csv");
        let mut sink = CsvSink::create(&path).unwrap();
        sink.append(&PositionRecord { timestamp: 1, x: 0.5, y: 0.0, z: 0.0 }).unwrap();
        sink.flush().unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("1,0.5,0,0"));

        let corrected = TrajectoryRecord::new(1, &Vec3::new(0.25, 0.0, 0.0), &Orientation::identity());
        sink.replace_all(&[corrected]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(text, format!("{}\n1,0.25,0,0\n", POSITION_HEADER));
        assert!(matches!(sink.append(&corrected.position()), Err(FusionError::Sink(_))));
    }

    #[test]
    fn test_csv_sink_keeps_live_file_with_corrected_path() {
        let live = temp_path("keep_live.csv");
        let corrected_path = temp_path("keep_corrected.csv");
        let mut sink = CsvSink::create(&live).unwrap().corrected_to(&corrected_path).with_orientation(true);
        sink.append(&PositionRecord { timestamp: 1, x: 0.5, y: 0.0, z: 0.0 }).unwrap();

        let corrected = TrajectoryRecord::new(1, &Vec3::new(0.25, 0.0, 0.0), &Orientation::identity());
        sink.replace_all(&[corrected]).unwrap();
        // Live log stays open for the next recording
        sink.append(&PositionRecord { timestamp: 2, x: 0.75, y: 0.0, z: 0.0 }).unwrap();
        sink.flush().unwrap();

        let live_text = std::fs::read_to_string(&live).unwrap();
        let corrected_text = std::fs::read_to_string(&corrected_path).unwrap();
        std::fs::remove_file(&live).ok();
        std::fs::remove_file(&corrected_path).ok();
        assert_eq!(live_text, format!("{}\n1,0.5,0,0\n2,0.75,0,0\n", POSITION_HEADER));
        assert!(corrected_text.starts_with("timestamp,position_x,position_y,position_z,roll,pitch,yaw\n1,0.25,0,0,"));
    }
}
