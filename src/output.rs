//! Result output: log table, CSV export and the optional log file

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::probe::RankedResult;

const HEADER: [&str; 7] = [
    "IP",
    "sent",
    "received",
    "loss",
    "avg delay (ms)",
    "speed (MB/s)",
    "region",
];

/// Columns of one result row
fn row(result: &RankedResult) -> [String; 7] {
    [
        result.addr().to_string(),
        result.probe.sent.to_string(),
        result.probe.received.to_string(),
        format!("{:.2}", result.loss_rate()),
        format!(
            "{:.2}",
            result.probe.delay.map(|d| d.as_secs_f64() * 1000.0).unwrap_or(0.0)
        ),
        format!("{:.2}", result.throughput_mb()),
        result
            .probe
            .region
            .clone()
            .unwrap_or_else(|| "N/A".to_string()),
    ]
}

/// Log the top `limit` results as a table; 0 disables
pub fn print_results(results: &[RankedResult], limit: usize) {
    if limit == 0 {
        return;
    }
    if results.is_empty() {
        info!("No address met the configured conditions");
        return;
    }

    info!(
        "{:<40}{:<8}{:<10}{:<8}{:<16}{:<14}{}",
        HEADER[0], HEADER[1], HEADER[2], HEADER[3], HEADER[4], HEADER[5], HEADER[6]
    );
    for result in results.iter().take(limit) {
        let r = row(result);
        info!(
            "{:<40}{:<8}{:<10}{:<8}{:<16}{:<14}{}",
            r[0], r[1], r[2], r[3], r[4], r[5], r[6]
        );
    }
}

/// Write every result with a header row
pub fn export_csv(path: &Path, results: &[RankedResult]) -> Result<()> {
    if results.is_empty() {
        return Ok(());
    }
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", HEADER.join(","))?;
    for result in results {
        let fields: Vec<String> = row(result).iter().map(|f| csv_field(f)).collect();
        writeln!(out, "{}", fields.join(","))?;
    }
    out.flush()?;
    info!("Wrote {} results to {}", results.len(), path.display());
    Ok(())
}

fn csv_field(raw: &str) -> String {
    if raw.contains(&[',', '"', '\n'][..]) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Open `path` for appending log lines, creating it if needed
pub fn open_log_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// `result.csv` + `ipv4` -> `result_ipv4.csv`
pub fn filename_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}_{}", stem, suffix),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeResult;
    use std::time::Duration;

    fn sample() -> Vec<RankedResult> {
        vec![
            RankedResult::new(ProbeResult::from_trials(
                "104.16.1.7".parse().unwrap(),
                4,
                4,
                Duration::from_millis(4 * 150),
                Some("HKG".into()),
            ))
            .with_throughput(3.0 * 1024.0 * 1024.0),
            RankedResult::new(ProbeResult::from_trials(
                "2606:4700::1".parse().unwrap(),
                4,
                2,
                Duration::from_millis(2 * 90),
                None,
            )),
        ]
    }

    #[test]
    fn test_export_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.csv");
        export_csv(&path, &sample()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "IP,sent,received,loss,avg delay (ms),speed (MB/s),region");
        assert_eq!(lines[1], "104.16.1.7,4,4,0.00,150.00,3.00,HKG");
        assert_eq!(lines[2], "2606:4700::1,4,2,0.50,90.00,0.00,N/A");
    }

    #[test]
    fn test_export_nothing_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        export_csv(&path, &[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_filename_with_suffix() {
        assert_eq!(
            filename_with_suffix(Path::new("out/result.csv"), "ipv4"),
            PathBuf::from("out/result_ipv4.csv")
        );
        assert_eq!(
            filename_with_suffix(Path::new("result"), "ipv6"),
            PathBuf::from("result_ipv6")
        );
    }

    #[test]
    fn test_log_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgepick.log");
        writeln!(open_log_file(&path).unwrap(), "first").unwrap();
        writeln!(open_log_file(&path).unwrap(), "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        assert!(open_log_file(&dir.path().join("missing/edgepick.log")).is_err());
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("HKG"), "HKG");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
    }
}
