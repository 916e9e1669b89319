//! CSV export of in-memory sample logs
//!
//! One file per device on operator request: a `time_seconds` column
//! followed by one column per sensor in sensor-id order. Cells a batch did
//! not carry are left empty. The filename carries the device name and a
//! local timestamp so repeated dumps never collide.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::registry::SampleLog;

/// Write one device's sample log to `<dir>/<name>_<YYYYMMDD-HHMMSS>.csv`.
pub fn export_sample_log(
    device_name: &str,
    sensor_names: &[String],
    samples: &SampleLog,
    dir: &Path,
) -> anyhow::Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("{}_{}.csv", device_name, stamp));

    fs::create_dir_all(dir)
        .with_context(|| format!("cannot create export directory '{}'", dir.display()))?;
    let file = fs::File::create(&path)
        .with_context(|| format!("cannot create '{}'", path.display()))?;
    let mut out = BufWriter::new(file);

    write!(out, "time_seconds")?;
    for name in sensor_names {
        write!(out, ",{}", name)?;
    }
    writeln!(out)?;

    for index in 0..samples.len() {
        if let Some((t, values)) = samples.row(index) {
            write!(out, "{:.6}", t)?;
            for value in values {
                if value.is_nan() {
                    write!(out, ",")?;
                } else {
                    write!(out, ",{}", value)?;
                }
            }
            writeln!(out)?;
        }
    }
    out.flush()?;

    log::info!(
        "Exported {} rows for device '{}' to {}",
        samples.len(),
        device_name,
        path.display()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut samples = SampleLog::new(2, 16);
        samples.append_row(0.5, &[(0, 38.6), (1, 145.2)]);
        samples.append_row(0.6, &[(1, 146.0)]);

        let path = export_sample_log(
            "Stand",
            &["PT1".to_string(), "PT2".to_string()],
            &samples,
            dir.path(),
        )
        .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("time_seconds,PT1,PT2"));
        assert_eq!(lines.next(), Some("0.500000,38.6,145.2"));
        // PT1 missing from the second batch: empty cell
        assert_eq!(lines.next(), Some("0.600000,,146"));
        assert_eq!(lines.next(), None);

        let filename = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(filename.starts_with("Stand_"));
        assert!(filename.ends_with(".csv"));
    }

    #[test]
    fn test_export_of_empty_log_is_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let samples = SampleLog::new(1, 4);
        let path =
            export_sample_log("Stand", &["TC1".to_string()], &samples, dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "time_seconds,TC1\n");
    }
}
