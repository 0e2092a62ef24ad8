//! End-to-end exercise of the resumable export path: write a partial run,
//! crash mid-line, resume, and finalize into deduplicated artifacts.

use std::fs::OpenOptions;
use std::io::Write;
use std::time::Duration;

use serde_json::json;
use stealthfetch::{
    error_product, load_export_products, merge_products, write_product_exports,
    IncrementalWriter, ProcessLock,
};
use tempfile::TempDir;

fn product(url: &str) -> serde_json::Value {
    json!({
        "url": url,
        "name": format!("Product at {url}"),
        "price": 19.9,
        "in_stock": true,
        "variations": [{"value": "red", "stock": 3}],
        "scraped_at": chrono::Utc::now().to_rfc3339(),
    })
}

fn urls(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("https://shop.example/p/{i}"))
        .collect()
}

#[test]
fn crash_resume_processes_only_remaining_urls() {
    let dir = TempDir::new().unwrap();
    let partial_path = dir.path().join("temp/full_export.jsonl");
    let all_urls = urls(150);

    // First run: 100 products land, then the process dies mid-write.
    {
        let (mut writer, existing) =
            IncrementalWriter::prepare(&partial_path, true, Some(Duration::from_secs(6 * 3600)))
                .unwrap();
        assert!(existing.is_empty());
        for url in &all_urls[..100] {
            writer.append(&product(url)).unwrap();
        }
    }
    {
        let mut file = OpenOptions::new().append(true).open(&partial_path).unwrap();
        write!(file, "{{\"url\": \"https://shop.example/p/100\", \"pri").unwrap();
    }

    // Second run resumes, recovers exactly the 100 complete records, and
    // filters them out of the work list.
    let (mut writer, recovered) =
        IncrementalWriter::prepare(&partial_path, true, Some(Duration::from_secs(6 * 3600)))
            .unwrap();
    assert_eq!(recovered.len(), 100);

    let remaining: Vec<&String> = all_urls
        .iter()
        .filter(|url| !writer.is_processed(url))
        .collect();
    assert_eq!(remaining.len(), 50);
    assert_eq!(remaining[0].as_str(), "https://shop.example/p/100");

    for url in remaining {
        writer.append(&product(url)).unwrap();
    }

    let finalized = writer.finalize().unwrap();
    assert_eq!(finalized.len(), 150);

    // Final artifact carries every URL exactly once.
    let export_path = dir.path().join("exports/full_export.json");
    let artifacts = write_product_exports(&finalized, &export_path).unwrap();
    let reread = load_export_products(&artifacts.json_path);
    assert_eq!(reread.len(), 150);

    let mut seen = std::collections::HashSet::new();
    for item in &reread {
        assert!(seen.insert(item["url"].as_str().unwrap().to_string()));
    }

    writer.cleanup().unwrap();
    assert!(!partial_path.exists());
}

#[test]
fn error_stubs_merge_with_successes() {
    let dir = TempDir::new().unwrap();
    let partial_path = dir.path().join("temp/run.jsonl");

    let (mut writer, _) = IncrementalWriter::prepare(&partial_path, false, None).unwrap();
    writer.append(&product("https://shop.example/p/1")).unwrap();
    writer
        .append(&error_product(
            "shop.example",
            "https://shop.example/p/404",
            None,
            Some(404),
            "Resource not found (404): https://shop.example/p/404",
        ))
        .unwrap();

    let run_products = writer.finalize().unwrap();
    assert_eq!(run_products.len(), 2);

    // Merge against a previous export that already has p/1 plus one URL this
    // run never touched.
    let previous = vec![product("https://shop.example/p/1"), product("https://shop.example/p/0")];
    let merged = merge_products(&run_products, &previous);
    assert_eq!(merged.len(), 3);

    let stub = merged
        .iter()
        .find(|p| p["url"] == "https://shop.example/p/404")
        .unwrap();
    assert_eq!(stub["in_stock"], false);
    assert_eq!(stub["status_code"], 404);
}

#[test]
fn concurrent_exporters_are_locked_out() {
    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join("export_shop_example.lock");

    let _held = ProcessLock::acquire(&lock_path).unwrap();
    let contender = ProcessLock::acquire(&lock_path);
    assert!(contender.is_err());
}
