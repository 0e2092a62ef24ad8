//! Incremental export: append-only JSONL partials with crash-safe resume,
//! final JSON artifact assembly, stdout progress events, and a per-site
//! process lock.
//!
//! Every appended line is a self-contained JSON record followed by a flush,
//! so recovery after a crash is a plain line scan that drops at most the
//! half-written tail.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors from the export layer.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("export serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("incremental writer is not opened")]
    WriterClosed,
    #[error("process lock busy: {path} (pid {pid})")]
    LockContended { path: String, pid: String },
}

/// Paths produced by a finalized export.
#[derive(Debug, Clone)]
pub struct ExportArtifacts {
    pub json_path: PathBuf,
    pub latest_path: PathBuf,
}

/// Append-only JSONL writer for partial export results with resume support.
pub struct IncrementalWriter {
    partial_path: PathBuf,
    file: Option<File>,
    processed_urls: HashSet<String>,
}

impl IncrementalWriter {
    /// Configure a writer, applying the resume policy: without resume the
    /// partial is discarded; with resume a partial older than the window is
    /// discarded as stale. Returns the writer (already opened) and any
    /// records recovered from the partial.
    pub fn prepare(
        partial_path: impl Into<PathBuf>,
        resume: bool,
        resume_window: Option<Duration>,
    ) -> Result<(Self, Vec<Value>), ExportError> {
        let mut writer = Self {
            partial_path: partial_path.into(),
            file: None,
            processed_urls: HashSet::new(),
        };

        if !resume {
            writer.cleanup()?;
        } else if let Some(window) = resume_window
            && writer.partial_path.exists()
        {
            let modified = std::fs::metadata(&writer.partial_path)?.modified()?;
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO);
            if age > window {
                log::info!(
                    "discarding partial export {}: age {:.2}h exceeds resume window {:.2}h",
                    writer.partial_path.display(),
                    age.as_secs_f64() / 3600.0,
                    window.as_secs_f64() / 3600.0
                );
                writer.cleanup()?;
            }
        }

        let existing = writer.load_existing()?;
        writer.open()?;
        Ok((writer, existing))
    }

    /// Scan the partial file, collecting complete records and seeding the
    /// processed-URL set. Unparseable lines (a crash mid-write) are skipped.
    pub fn load_existing(&mut self) -> Result<Vec<Value>, ExportError> {
        if !self.partial_path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.partial_path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(product) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            self.register_urls(&product);
            entries.push(product);
        }
        Ok(entries)
    }

    pub fn open(&mut self) -> Result<(), ExportError> {
        if let Some(parent) = self.partial_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.file = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.partial_path)?,
        );
        Ok(())
    }

    /// Append one product as a single JSON line and flush.
    pub fn append(&mut self, product: &Value) -> Result<(), ExportError> {
        let file = self.file.as_mut().ok_or(ExportError::WriterClosed)?;
        let line = serde_json::to_string(product)?;
        writeln!(file, "{line}")?;
        file.flush()?;

        self.register_urls(product);
        Ok(())
    }

    pub fn is_processed(&self, url: &str) -> bool {
        self.processed_urls.contains(url)
    }

    pub fn processed_urls(&self) -> &HashSet<String> {
        &self.processed_urls
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// Close the stream and re-read every complete line.
    pub fn finalize(&mut self) -> Result<Vec<Value>, ExportError> {
        self.close();
        self.load_existing()
    }

    /// Remove the partial file and forget processed URLs.
    pub fn cleanup(&mut self) -> Result<(), ExportError> {
        self.close();
        self.processed_urls.clear();
        match std::fs::remove_file(&self.partial_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    fn register_urls(&mut self, product: &Value) {
        for key in ["url", "original_url"] {
            if let Some(url) = product.get(key).and_then(Value::as_str) {
                self.processed_urls.insert(url.to_string());
            }
        }
    }
}

/// Seed a writer's processed set from a previous full export so already
/// scraped URLs are skipped.
pub fn prime_writer_from_export(writer: &mut IncrementalWriter, export_path: &Path) -> usize {
    let products = load_export_products(export_path);
    let mut seeded = 0;
    for product in &products {
        let mut added = false;
        for key in ["url", "original_url"] {
            if let Some(url) = product.get(key).and_then(Value::as_str)
                && writer.processed_urls.insert(url.to_string())
            {
                added = true;
            }
        }
        if added {
            seeded += 1;
        }
    }
    if seeded > 0 {
        log::info!(
            "seeded {seeded} products from existing export {}",
            export_path.display()
        );
    }
    seeded
}

/// Load product records from a full export file. Accepts either a bare list
/// or an object with a `products` list.
pub fn load_export_products(export_path: &Path) -> Vec<Value> {
    if !export_path.exists() {
        return Vec::new();
    }

    let raw = match std::fs::read_to_string(export_path) {
        Ok(raw) => raw,
        Err(err) => {
            log::warn!("failed to load existing export {}: {err}", export_path.display());
            return Vec::new();
        }
    };

    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Array(items)) => items.into_iter().filter(|v| v.is_object()).collect(),
        Ok(Value::Object(mut map)) => match map.remove("products") {
            Some(Value::Array(items)) => items.into_iter().filter(|v| v.is_object()).collect(),
            _ => {
                log::warn!("unexpected export structure in {}", export_path.display());
                Vec::new()
            }
        },
        _ => {
            log::warn!("unexpected export structure in {}", export_path.display());
            Vec::new()
        }
    }
}

/// Merge product lists, deduplicating by `url`/`original_url`. Records with
/// neither key are deduplicated by their canonical JSON encoding.
pub fn merge_products(existing: &[Value], new: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(existing.len() + new.len());
    let mut seen: HashSet<String> = HashSet::new();

    let register = |product: &Value, seen: &mut HashSet<String>| {
        let mut keyed = false;
        for key in ["url", "original_url"] {
            if let Some(url) = product.get(key).and_then(Value::as_str)
                && !url.is_empty()
            {
                seen.insert(url.to_string());
                keyed = true;
            }
        }
        if !keyed {
            seen.insert(product.to_string());
        }
    };

    for product in existing {
        merged.push(product.clone());
        register(product, &mut seen);
    }

    for product in new {
        let duplicate = ["url", "original_url"].iter().any(|key| {
            product
                .get(key)
                .and_then(Value::as_str)
                .map(|url| seen.contains(url))
                .unwrap_or(false)
        });
        if duplicate {
            continue;
        }
        merged.push(product.clone());
        register(product, &mut seen);
    }

    merged
}

/// Stub record for a URL that is definitively unavailable, keeping coverage
/// metrics intact downstream.
pub fn error_product(
    domain: &str,
    url: &str,
    original_url: Option<&str>,
    status_code: Option<u16>,
    message: &str,
) -> Value {
    json!({
        "url": url,
        "original_url": original_url.unwrap_or(url),
        "site_domain": domain,
        "name": null,
        "price": null,
        "base_price": null,
        "currency": null,
        "stock": 0.0,
        "stock_quantity": 0.0,
        "in_stock": false,
        "variations": [],
        "error": message,
        "status_code": status_code,
        "scraped_at": Utc::now().to_rfc3339(),
    })
}

/// Persist the final product list: URL-sorted JSON written through a temp
/// file with an atomic rename, mirrored to `latest.json`.
pub fn write_product_exports(
    products: &[Value],
    json_path: &Path,
) -> Result<ExportArtifacts, ExportError> {
    let mut sorted: Vec<Value> = products.to_vec();
    sorted.sort_by(|a, b| {
        let a_url = a.get("url").and_then(Value::as_str).unwrap_or("");
        let b_url = b.get("url").and_then(Value::as_str).unwrap_or("");
        a_url.cmp(b_url)
    });

    if let Some(parent) = json_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let payload = serde_json::to_string_pretty(&sorted)?;
    let tmp_path = json_path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &payload)?;
    std::fs::rename(&tmp_path, json_path)?;

    let latest_path = json_path
        .parent()
        .map(|parent| parent.join("latest.json"))
        .unwrap_or_else(|| PathBuf::from("latest.json"));
    if latest_path != json_path
        && let Err(err) = std::fs::write(&latest_path, &payload)
    {
        log::debug!("failed to mirror export JSON to {}: {err}", latest_path.display());
    }

    Ok(ExportArtifacts {
        json_path: json_path.to_path_buf(),
        latest_path,
    })
}

/// File-backed advisory lock; the holder's PID is written into the file.
/// Contention surfaces as [`ExportError::LockContended`].
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                log::info!(
                    "acquired process lock {} (pid={})",
                    path.display(),
                    std::process::id()
                );
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let pid = std::fs::read_to_string(&path)
                    .map(|raw| raw.trim().to_string())
                    .unwrap_or_default();
                let pid = if pid.is_empty() { "unknown".to_string() } else { pid };
                log::error!("process lock busy {} (pid={pid})", path.display());
                Err(ExportError::LockContended {
                    path: path.display().to_string(),
                    pid,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::debug!("failed to remove lock file {}: {err}", self.path.display());
            }
        }
    }
}

/// Stdout progress events, one JSON line per completed URL. Only active when
/// the `EXPORT_PROGRESS_EVENTS` env flag is truthy.
pub struct ProgressEmitter {
    site: String,
    script: String,
    total: usize,
    counters: Mutex<ProgressCounters>,
}

#[derive(Default)]
struct ProgressCounters {
    processed: usize,
    success: usize,
    failed: usize,
}

impl ProgressEmitter {
    /// Build an emitter when the env flag enables progress events.
    pub fn from_env(site: &str, script: &str, total: usize) -> Option<Self> {
        let flag = std::env::var("EXPORT_PROGRESS_EVENTS")
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        if !matches!(flag.as_str(), "1" | "true" | "yes" | "on") {
            return None;
        }
        Some(Self::new(site, script, total))
    }

    pub fn new(site: &str, script: &str, total: usize) -> Self {
        Self {
            site: site.to_string(),
            script: script.to_string(),
            total,
            counters: Mutex::new(ProgressCounters::default()),
        }
    }

    /// Record one completed URL and emit the progress line.
    pub fn record(&self, success: bool) {
        let payload = self.payload_for(success);
        println!("{payload}");
    }

    fn payload_for(&self, success: bool) -> String {
        let mut counters = self.counters.lock().expect("progress lock poisoned");
        counters.processed += 1;
        if success {
            counters.success += 1;
        } else {
            counters.failed += 1;
        }

        let total = self.total.max(counters.processed).max(1);
        let percent = (counters.processed as f64 / total as f64 * 100.0).clamp(0.0, 100.0);

        json!({
            "event": "progress",
            "site": self.site,
            "script": self.script,
            "processed": counters.processed,
            "success": counters.success,
            "failed": counters.failed,
            "total": total,
            "progressPercent": (percent * 100.0).round() / 100.0,
            "timestamp": Utc::now().timestamp_millis() as f64 / 1000.0,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn product(url: &str) -> Value {
        json!({"url": url, "name": "Merino 50g", "price": 12.5, "scraped_at": Utc::now().to_rfc3339()})
    }

    #[test]
    fn append_then_finalize_round_trip() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("temp/run.jsonl");
        let (mut writer, existing) = IncrementalWriter::prepare(&partial, false, None).unwrap();
        assert!(existing.is_empty());

        for i in 0..5 {
            writer.append(&product(&format!("https://shop.example/p/{i}"))).unwrap();
        }
        let finalized = writer.finalize().unwrap();
        assert_eq!(finalized.len(), 5);
        assert!(writer.is_processed("https://shop.example/p/3"));
    }

    #[test]
    fn crash_recovery_skips_partial_line() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("run.jsonl");

        {
            let (mut writer, _) = IncrementalWriter::prepare(&partial, false, None).unwrap();
            for i in 0..100 {
                writer.append(&product(&format!("https://shop.example/p/{i}"))).unwrap();
            }
        }
        // Simulate a crash mid-write of the 101st record.
        {
            let mut file = OpenOptions::new().append(true).open(&partial).unwrap();
            write!(file, "{{\"url\": \"https://shop.example/p/100\", \"na").unwrap();
        }

        let (writer, existing) =
            IncrementalWriter::prepare(&partial, true, Some(Duration::from_secs(6 * 3600)))
                .unwrap();
        assert_eq!(existing.len(), 100);
        assert_eq!(writer.processed_urls().len(), 100);
        assert!(!writer.is_processed("https://shop.example/p/100"));
    }

    #[test]
    fn no_resume_discards_partial() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("run.jsonl");
        {
            let (mut writer, _) = IncrementalWriter::prepare(&partial, false, None).unwrap();
            writer.append(&product("https://shop.example/p/1")).unwrap();
        }
        let (_, existing) = IncrementalWriter::prepare(&partial, false, None).unwrap();
        assert!(existing.is_empty());
    }

    #[test]
    fn zero_resume_window_always_discards() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("run.jsonl");
        {
            let (mut writer, _) = IncrementalWriter::prepare(&partial, false, None).unwrap();
            writer.append(&product("https://shop.example/p/1")).unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));
        let (_, existing) =
            IncrementalWriter::prepare(&partial, true, Some(Duration::ZERO)).unwrap();
        assert!(existing.is_empty());
    }

    #[test]
    fn merge_deduplicates_by_url() {
        let existing = vec![product("https://shop.example/p/1"), product("https://shop.example/p/2")];
        let new = vec![
            product("https://shop.example/p/2"),
            product("https://shop.example/p/3"),
        ];
        let merged = merge_products(&existing, &new);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn merge_handles_original_url_alias() {
        let existing = vec![json!({"url": "https://shop.example/p/1?v=2", "original_url": "https://shop.example/p/1"})];
        let new = vec![json!({"url": "https://shop.example/p/1"})];
        let merged = merge_products(&existing, &new);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn error_product_has_stub_shape() {
        let stub = error_product(
            "shop.example",
            "https://shop.example/p/404",
            None,
            Some(404),
            "Resource not found (404): https://shop.example/p/404",
        );
        assert_eq!(stub["status_code"], 404);
        assert_eq!(stub["in_stock"], false);
        assert_eq!(stub["stock"], 0.0);
        assert!(stub["variations"].as_array().unwrap().is_empty());
        assert!(stub["scraped_at"].as_str().is_some());
    }

    #[test]
    fn finalize_writes_sorted_artifact_and_latest_mirror() {
        let dir = TempDir::new().unwrap();
        let json_path = dir.path().join("exports/catalog.json");
        let products = vec![product("https://shop.example/p/2"), product("https://shop.example/p/1")];

        let artifacts = write_product_exports(&products, &json_path).unwrap();
        assert!(artifacts.json_path.exists());
        assert!(artifacts.latest_path.exists());

        let reread = load_export_products(&artifacts.json_path);
        assert_eq!(reread.len(), 2);
        assert_eq!(reread[0]["url"], "https://shop.example/p/1");

        let latest = load_export_products(&artifacts.latest_path);
        assert_eq!(latest.len(), 2);
    }

    #[test]
    fn process_lock_blocks_second_holder() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("export_shop.lock");

        let lock = ProcessLock::acquire(&lock_path).unwrap();
        let second = ProcessLock::acquire(&lock_path);
        assert!(matches!(second, Err(ExportError::LockContended { .. })));

        drop(lock);
        assert!(ProcessLock::acquire(&lock_path).is_ok());
    }

    #[test]
    fn prime_from_existing_export() {
        let dir = TempDir::new().unwrap();
        let json_path = dir.path().join("catalog.json");
        write_product_exports(&[product("https://shop.example/p/1")], &json_path).unwrap();

        let partial = dir.path().join("run.jsonl");
        let (mut writer, _) = IncrementalWriter::prepare(&partial, true, None).unwrap();
        let seeded = prime_writer_from_export(&mut writer, &json_path);
        assert_eq!(seeded, 1);
        assert!(writer.is_processed("https://shop.example/p/1"));
    }

    #[test]
    fn progress_emitter_counts_and_percent() {
        let emitter = ProgressEmitter::new("shop.example", "full_export", 4);
        let line = emitter.payload_for(true);
        let event: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(event["event"], "progress");
        assert_eq!(event["processed"], 1);
        assert_eq!(event["success"], 1);
        assert_eq!(event["progressPercent"], 25.0);

        let line = emitter.payload_for(false);
        let event: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(event["failed"], 1);
        assert_eq!(event["progressPercent"], 50.0);
    }
}
