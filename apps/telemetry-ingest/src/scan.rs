use crate::source::RecordingParser;
use crate::workers::WorkItem;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Lists recordings under `dir` old enough to be complete, oldest first.
pub fn scan_ready_files<P: RecordingParser + ?Sized>(
    dir: &Path,
    age_threshold: Duration,
    parser: &P,
) -> Result<Vec<WorkItem>> {
    let now = SystemTime::now();
    let mut ready = Vec::new();

    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !metadata.is_file() || !parser.accepts(&path) {
            continue;
        }
        let modified = metadata.modified().unwrap_or(now);
        let age = now.duration_since(modified).unwrap_or_default();
        if age < age_threshold {
            tracing::debug!(path = %path.display(), age_ms = age.as_millis() as u64, "recording too young; skipping");
            continue;
        }
        ready.push(WorkItem::new(
            path,
            metadata.len(),
            DateTime::<Utc>::from(modified),
        ));
    }

    ready.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::NdjsonParser;
    use tempfile::TempDir;

    #[test]
    fn skips_young_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.ndjson"), "{}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("nested.ndjson")).unwrap();

        let ready = scan_ready_files(dir.path(), Duration::ZERO, &NdjsonParser).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].path.ends_with("a.ndjson"));
        assert_eq!(ready[0].retry_count, 0);

        let young = scan_ready_files(dir.path(), Duration::from_secs(3600), &NdjsonParser).unwrap();
        assert!(young.is_empty());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(scan_ready_files(&missing, Duration::ZERO, &NdjsonParser).is_err());
    }
}
