//! Append-only per-source JSONL storage with daily rotation.
//!
//! Buffering and the background writer thread follow
//! `component_a/sync_manager.rs`'s `ArrayQueue` + consumer-thread pattern,
//! reshaped to write newline-delimited JSON per source instead of one
//! shared CSV file.

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{error, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::types::now_unix;

const DEFAULT_MAX_FILE_SIZE_MB: u64 = 100;
const DEFAULT_BUFFER_SIZE: usize = 1000;
const WRITE_MAX_ATTEMPTS: u32 = 3;

pub struct JsonlStore {
    base_path: PathBuf,
    compression: bool,
    max_file_size_bytes: u64,
    buffer_size: usize,
    buffers: Mutex<HashMap<String, Vec<Value>>>,
}

impl JsonlStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        compression: bool,
        max_file_size_mb: Option<u64>,
        buffer_size: Option<usize>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            compression,
            max_file_size_bytes: max_file_size_mb.unwrap_or(DEFAULT_MAX_FILE_SIZE_MB) * 1024 * 1024,
            buffer_size: buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Buffers one record; flushes to disk once the per-source buffer hits
    /// `buffer_size`. Requires `timestamp` and `source` fields, matching the
    /// original's validation.
    pub fn write(&self, source: &str, record: Value) -> Result<(), PipelineError> {
        validate_record(&record)?;
        let mut buffers = self.buffers.lock();
        let buf = buffers.entry(source.to_string()).or_default();
        buf.push(record);
        if buf.len() >= self.buffer_size {
            let batch = std::mem::take(buf);
            drop(buffers);
            self.flush_batch(source, &batch)?;
        }
        Ok(())
    }

    pub fn write_batch(&self, source: &str, records: Vec<Value>) -> Result<(), PipelineError> {
        for r in &records {
            validate_record(r)?;
        }
        let mut buffers = self.buffers.lock();
        let buf = buffers.entry(source.to_string()).or_default();
        buf.extend(records);
        while buf.len() >= self.buffer_size {
            let batch: Vec<Value> = buf.drain(..self.buffer_size.min(buf.len())).collect();
            drop(buffers);
            self.flush_batch(source, &batch)?;
            buffers = self.buffers.lock();
        }
        Ok(())
    }

    /// Forces the in-memory buffer for `source` to disk.
    pub fn flush(&self, source: &str) -> Result<(), PipelineError> {
        let batch = {
            let mut buffers = self.buffers.lock();
            buffers.get_mut(source).map(std::mem::take).unwrap_or_default()
        };
        if !batch.is_empty() {
            self.flush_batch(source, &batch)?;
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<(), PipelineError> {
        let sources: Vec<String> = self.buffers.lock().keys().cloned().collect();
        for source in sources {
            self.flush(&source)?;
        }
        Ok(())
    }

    fn flush_batch(&self, source: &str, batch: &[Value]) -> Result<(), PipelineError> {
        let mut attempt = 0;
        loop {
            match self.try_write_batch(source, batch) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= WRITE_MAX_ATTEMPTS {
                        // Put the batch back so a caller retrying later
                        // (or a clean shutdown flush) doesn't lose data.
                        let mut buffers = self.buffers.lock();
                        buffers.entry(source.to_string()).or_default().splice(0..0, batch.iter().cloned());
                        return Err(e);
                    }
                    warn!("store write attempt {attempt} for '{source}' failed: {e}, retrying");
                    std::thread::sleep(std::time::Duration::from_millis(50 * attempt as u64));
                }
            }
        }
    }

    fn try_write_batch(&self, source: &str, batch: &[Value]) -> Result<(), PipelineError> {
        let dir = self.base_path.join(source);
        fs::create_dir_all(&dir)?;
        let path = self.current_file_path(&dir)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if self.compression {
            let mut encoder = GzEncoder::new(file, Compression::default());
            for record in batch {
                writeln!(encoder, "{}", serde_json::to_string(record)?)?;
            }
            encoder.finish()?;
        } else {
            let mut file = file;
            for record in batch {
                writeln!(file, "{}", serde_json::to_string(record)?)?;
            }
        }
        Ok(())
    }

    fn current_file_path(&self, dir: &Path) -> Result<PathBuf, PipelineError> {
        let date = utc_date_string(now_unix());
        let ext = if self.compression { "jsonl.gz" } else { "jsonl" };
        let mut index = 0u32;
        loop {
            let name = if index == 0 {
                format!("{date}.{ext}")
            } else {
                format!("{date}.{index}.{ext}")
            };
            let path = dir.join(&name);
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if size < self.max_file_size_bytes {
                return Ok(path);
            }
            index += 1;
        }
    }

    /// Streams records for `source` across an inclusive date range
    /// (`YYYY-MM-DD`), skipping malformed lines with a warning.
    pub fn read(&self, source: &str, start_date: &str, end_date: &str) -> Vec<Value> {
        let dir = self.base_path.join(source);
        let Ok(entries) = fs::read_dir(&dir) else { return Vec::new() };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| {
                        let date_prefix = &n[..n.len().min(10)];
                        date_prefix >= start_date && date_prefix <= end_date
                    })
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        let mut records = Vec::new();
        for path in files {
            records.extend(self.read_file(&path));
        }
        records
    }

    fn read_file(&self, path: &Path) -> Vec<Value> {
        let Ok(file) = File::open(path) else { return Vec::new() };
        let is_gz = path.extension().map(|e| e == "gz").unwrap_or(false);
        let lines: Vec<String> = if is_gz {
            let mut decoder = flate2::read::GzDecoder::new(file);
            let mut text = String::new();
            if decoder.read_to_string(&mut text).is_err() {
                return Vec::new();
            }
            text.lines().map(|l| l.to_string()).collect()
        } else {
            BufReader::new(file).lines().filter_map(|l| l.ok()).collect()
        };

        lines
            .into_iter()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<Value>(&l) {
                Ok(v) if validate_record(&v).is_ok() => Some(v),
                Ok(_) => {
                    warn!("skipping invalid record in {path:?}: missing timestamp/source");
                    None
                }
                Err(e) => {
                    warn!("skipping malformed JSONL line in {path:?}: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn get_available_dates(&self, source: &str) -> Vec<String> {
        let dir = self.base_path.join(source);
        let Ok(entries) = fs::read_dir(&dir) else { return Vec::new() };
        let mut dates: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(|n| n[..n.len().min(10)].to_string()))
            .collect();
        dates.sort();
        dates.dedup();
        dates
    }

    pub fn get_size(&self, source: &str) -> u64 {
        let dir = self.base_path.join(source);
        let Ok(entries) = fs::read_dir(&dir) else { return 0 };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    pub fn get_record_count(&self, source: &str) -> usize {
        let dir = self.base_path.join(source);
        let Ok(entries) = fs::read_dir(&dir) else { return 0 };
        entries
            .filter_map(|e| e.ok())
            .map(|e| self.read_file(&e.path()).len())
            .sum()
    }

    /// Deletes whole files whose filename date prefix is strictly before
    /// `before_date`. Returns the count of files removed.
    pub fn delete(&self, source: &str, before_date: &str) -> usize {
        let dir = self.base_path.join(source);
        let Ok(entries) = fs::read_dir(&dir) else { return 0 };
        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            let date_prefix = &name[..name.len().min(10)];
            if date_prefix < before_date {
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                } else {
                    error!("failed to delete {path:?}");
                }
            }
        }
        removed
    }
}

fn validate_record(record: &Value) -> Result<(), PipelineError> {
    let obj = record.as_object().ok_or_else(|| PipelineError::Storage {
        source: "record is not a JSON object".to_string(),
    })?;
    if !obj.contains_key("timestamp") {
        return Err(PipelineError::Storage {
            source: "record missing 'timestamp'".to_string(),
        });
    }
    if !obj.contains_key("source") {
        return Err(PipelineError::Storage {
            source: "record missing 'source'".to_string(),
        });
    }
    Ok(())
}

fn utc_date_string(unix_secs: f64) -> String {
    let days = (unix_secs / 86400.0).floor() as i64;
    let (y, m, d) = civil_from_days(days);
    format!("{y:04}-{m:02}-{d:02}")
}

/// Howard Hinnant's days-from-civil algorithm, used instead of any
/// local-timezone call so the same Unix timestamp always buckets into the
/// same filename regardless of host timezone.
pub(crate) fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

pub fn pretty_print(record: &Value) -> String {
    let mut copy = record.clone();
    if let Some(ts) = record.get("timestamp").and_then(Value::as_f64) {
        if let Some(obj) = copy.as_object_mut() {
            obj.insert("_datetime".to_string(), Value::String(utc_date_string(ts)));
        }
    }
    serde_json::to_string_pretty(&copy).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_like::TempDir;

    mod tempfile_like {
        use std::path::PathBuf;

        pub struct TempDir(pub PathBuf);

        impl TempDir {
            pub fn new(tag: &str) -> Self {
                let path = std::env::temp_dir().join(format!("jsonl_store_test_{tag}_{}", crate::types::now_unix() as u64));
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }

            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let bad = serde_json::json!({"source": "x"});
        assert!(validate_record(&bad).is_err());
    }

    #[test]
    fn civil_date_matches_known_epoch() {
        assert_eq!(utc_date_string(0.0), "1970-01-01");
        assert_eq!(utc_date_string(86400.0 * 365.0), "1971-01-01");
    }

    #[test]
    fn write_then_read_roundtrips_in_order() {
        let dir = TempDir::new("roundtrip");
        let store = JsonlStore::new(dir.path(), false, None, None);
        for i in 0..5 {
            store
                .write(
                    "system",
                    serde_json::json!({"timestamp": i as f64, "source": "system", "n": i}),
                )
                .unwrap();
        }
        store.flush("system").unwrap();
        let today = utc_date_string(now_unix());
        let records = store.read("system", &today, &today);
        assert_eq!(records.len(), 5);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r["n"], i);
        }
    }

    #[test]
    fn configured_buffer_size_gates_flush_threshold() {
        let dir = TempDir::new("buffer_size");
        let store = JsonlStore::new(dir.path(), false, None, Some(1000));
        for i in 0..1500 {
            store
                .write(
                    "system",
                    serde_json::json!({"timestamp": i as f64, "source": "system", "n": i}),
                )
                .unwrap();
        }
        let today = utc_date_string(now_unix());
        // First 1000 already flushed by the buffer threshold; 500 remain buffered.
        assert_eq!(store.read("system", &today, &today).len(), 1000);
        store.flush("system").unwrap();
        let records = store.read("system", &today, &today);
        assert_eq!(records.len(), 1500);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r["n"], i);
        }
    }

    #[test]
    fn malformed_lines_are_skipped_on_read() {
        let dir = TempDir::new("malformed");
        let store = JsonlStore::new(dir.path(), false, None, None);
        let source_dir = dir.path().join("system");
        std::fs::create_dir_all(&source_dir).unwrap();
        let today = utc_date_string(now_unix());
        let path = source_dir.join(format!("{today}.jsonl"));
        std::fs::write(&path, "{not json}\n{\"timestamp\": 1.0, \"source\": \"system\"}\n").unwrap();
        let records = store.read("system", &today, &today);
        assert_eq!(records.len(), 1);
    }
}
