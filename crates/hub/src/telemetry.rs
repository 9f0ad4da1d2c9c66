//! Append-only telemetry log in long format: one `date,value,type` row per
//! metric per sample.
//!
//! Appends are serialised through a mutex, written with a single
//! `write_all` per batch, and fsynced before returning. A batch that fails
//! partway is cut back off the file so the next append starts on a clean
//! line.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::DateTime;
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::LogWriteError;
use crate::sensor::{Metric, SensorReading};

pub const HEADER: &str = "date,value,type";

/// `HH:MM:SS DD/MM/YYYY`, day-first.
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S %d/%m/%Y";

pub fn format_timestamp(ts: &DateTime<Tz>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Round to 2 decimals and print the shortest form that keeps at least
/// one fractional digit (`21.5`, `20.0`, `1013.26`).
pub fn format_value(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded:?}")
}

/// One parsed row of the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRow {
    pub date: String,
    pub value: f64,
    #[serde(rename = "type")]
    pub metric: Metric,
}

impl LogRow {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(3, ',');
        let date = parts.next()?.to_string();
        let value = parts.next()?.trim().parse().ok()?;
        let metric = parts.next()?.parse().ok()?;
        Some(Self {
            date,
            value,
            metric,
        })
    }
}

/// Append target that can be cut back to an earlier length.
trait BatchSink: Write {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl BatchSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write and sync one batch; on failure drop whatever part of it landed.
fn write_batch<S: BatchSink>(sink: &mut S, prev_len: u64, bytes: &[u8]) -> io::Result<()> {
    let result = sink.write_all(bytes).and_then(|()| sink.sync());
    if result.is_err() {
        if let Err(e) = sink.truncate_to(prev_len) {
            warn!(len = prev_len, "failed to roll back partial telemetry write: {e}");
        }
    }
    result
}

pub struct TelemetryLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TelemetryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> LogWriteError {
        LogWriteError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Append one row per reading, creating the file (with its header) if
    /// it does not exist. Returns once the rows are on disk.
    pub fn append(&self, readings: &[SensorReading]) -> Result<(), LogWriteError> {
        let _guard = self.lock.lock().map_err(|_| LogWriteError::Poisoned)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        let prev_len = file.metadata().map_err(|e| self.io_err(e))?.len();
        let is_new = prev_len == 0;

        let mut buf = String::with_capacity(32 * (readings.len() + 1));
        if is_new {
            buf.push_str(HEADER);
            buf.push('\n');
        }
        for r in readings {
            buf.push_str(&format_timestamp(&r.timestamp));
            buf.push(',');
            buf.push_str(&format_value(r.value));
            buf.push(',');
            buf.push_str(r.metric.as_str());
            buf.push('\n');
        }

        write_batch(&mut file, prev_len, buf.as_bytes()).map_err(|e| self.io_err(e))?;

        debug!(
            path = %self.path.display(),
            rows = readings.len(),
            created = is_new,
            "telemetry appended"
        );
        Ok(())
    }

    /// All rows in file order. A missing file reads as empty.
    pub fn read_rows(&self) -> Result<Vec<LogRow>, LogWriteError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        let mut rows = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_err(e))?;
            if line.is_empty() || (i == 0 && line == HEADER) {
                continue;
            }
            match LogRow::parse(&line) {
                Some(row) => rows.push(row),
                None => warn!(path = %self.path.display(), line = i + 1, "skipping malformed telemetry row"),
            }
        }
        Ok(rows)
    }

    /// The last `n` rows, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<LogRow>, LogWriteError> {
        let mut rows = self.read_rows()?;
        let skip = rows.len().saturating_sub(n);
        Ok(rows.split_off(skip))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn batch(minute: u32, base: f64) -> Vec<SensorReading> {
        let ts = chrono_tz::Europe::Berlin
            .with_ymd_and_hms(2024, 5, 1, 12, minute, 7)
            .unwrap();
        Metric::ALL
            .iter()
            .enumerate()
            .map(|(i, &metric)| SensorReading {
                timestamp: ts,
                metric,
                value: base + i as f64,
            })
            .collect()
    }

    fn temp_log() -> (tempfile::TempDir, TelemetryLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = TelemetryLog::new(dir.path().join("sensor_readings_bme280_long.csv"));
        (dir, log)
    }

    // -- Formatting -------------------------------------------------------

    #[test]
    fn value_is_rounded_to_two_decimals() {
        assert_eq!(format_value(21.456), "21.46");
        assert_eq!(format_value(1013.256), "1013.26");
        assert_eq!(format_value(45.0), "45.0");
        assert_eq!(format_value(21.5), "21.5");
        assert_eq!(format_value(-3.004), "-3.0");
    }

    #[test]
    fn timestamp_is_day_first() {
        let ts = chrono_tz::Europe::Berlin
            .with_ymd_and_hms(2024, 3, 9, 8, 5, 1)
            .unwrap();
        assert_eq!(format_timestamp(&ts), "08:05:01 09/03/2024");
    }

    // -- Append -----------------------------------------------------------

    #[test]
    fn first_append_writes_header_then_rows() {
        let (_dir, log) = temp_log();
        log.append(&batch(0, 20.0)).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "date,value,type");
        assert_eq!(lines[1], "12:00:07 01/05/2024,20.0,Temp1");
        assert_eq!(lines[6], "12:00:07 01/05/2024,25.0,Press2");
    }

    #[test]
    fn header_written_exactly_once_across_appends_and_reopen() {
        let (dir, log) = temp_log();
        for m in 0..5 {
            log.append(&batch(m, 20.0)).unwrap();
        }
        // A fresh handle on the same file is a process restart.
        let reopened = TelemetryLog::new(dir.path().join("sensor_readings_bme280_long.csv"));
        reopened.append(&batch(5, 20.0)).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.matches(HEADER).count(), 1);
        assert_eq!(text.lines().count(), 1 + 6 * 6);
    }

    #[test]
    fn header_reappears_after_deletion() {
        let (_dir, log) = temp_log();
        log.append(&batch(0, 20.0)).unwrap();
        std::fs::remove_file(log.path()).unwrap();
        log.append(&batch(1, 30.0)).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.starts_with("date,value,type\n"));
        assert_eq!(text.lines().count(), 7);
    }

    #[test]
    fn read_back_order_equals_append_order() {
        let (_dir, log) = temp_log();
        let mut expected = Vec::new();
        for m in 0..10 {
            let b = batch(m, m as f64 * 10.0);
            expected.extend(b.iter().map(|r| (format_timestamp(&r.timestamp), r.value, r.metric)));
            log.append(&b).unwrap();
        }

        let rows = log.read_rows().unwrap();
        let got: Vec<_> = rows.into_iter().map(|r| (r.date, r.value, r.metric)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn concurrent_appends_produce_whole_rows() {
        let (_dir, log) = temp_log();
        let log = Arc::new(log);
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = [1.0, 2.0]
            .into_iter()
            .map(|base| {
                let log = Arc::clone(&log);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    log.append(&batch(0, base)).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines.len(), 13);
        for line in &lines[1..] {
            assert!(LogRow::parse(line).is_some(), "corrupted row: {line:?}");
        }
        // Each batch lands contiguously.
        let firsts: Vec<_> = lines[1..].chunks(6).map(|c| c[0].to_string()).collect();
        assert!(firsts.iter().all(|l| l.ends_with(",Temp1")));
    }

    #[test]
    fn missing_file_reads_empty() {
        let (_dir, log) = temp_log();
        assert!(log.read_rows().unwrap().is_empty());
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let (_dir, log) = temp_log();
        std::fs::write(
            log.path(),
            "date,value,type\n12:00:00 01/05/2024,21.5,Temp1\ngarbage\n12:00:00 01/05/2024,x,Temp2\n12:00:00 01/05/2024,40.0,Humid1\n",
        )
        .unwrap();
        let rows = log.read_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].metric, Metric::Humid1);
    }

    #[test]
    fn tail_returns_last_rows_oldest_first() {
        let (_dir, log) = temp_log();
        log.append(&batch(0, 0.0)).unwrap();
        log.append(&batch(1, 100.0)).unwrap();
        let tail = log.tail(3).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].metric, Metric::Humid2);
        assert_eq!(tail[2].value, 105.0);
        assert_eq!(log.tail(100).unwrap().len(), 12);
    }

    /// Accepts `budget` bytes, then fails every write.
    struct ShortSink {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for ShortSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.budget);
            self.data.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl BatchSink for ShortSink {
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn partial_batch_is_rolled_back() {
        let existing = b"date,value,type\n12:00:07 01/05/2024,20.0,Temp1\n".to_vec();
        let mut sink = ShortSink {
            data: existing.clone(),
            budget: 10,
        };

        let err = write_batch(
            &mut sink,
            existing.len() as u64,
            b"12:01:07 01/05/2024,21.0,Temp1\n",
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(sink.data, existing);

        sink.budget = usize::MAX;
        write_batch(&mut sink, existing.len() as u64, b"12:02:07 01/05/2024,22.0,Temp1\n").unwrap();
        let text = String::from_utf8(sink.data).unwrap();
        assert_eq!(text.lines().nth(2), Some("12:02:07 01/05/2024,22.0,Temp1"));
    }

    #[test]
    fn append_into_missing_directory_is_a_log_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = TelemetryLog::new(dir.path().join("nope").join("log.csv"));
        let err = log.append(&batch(0, 1.0)).unwrap_err();
        assert!(matches!(err, LogWriteError::Io { .. }));
    }
}
