use crate::telemetry::{SensorSample, SessionMeta};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone)]
pub enum ParseEvent {
    /// Opens a new group; every following sample belongs to it.
    Group(SessionMeta),
    Sample(SensorSample),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseSummary {
    pub groups: usize,
    pub samples: u64,
    pub stopped: bool,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record on line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("sample on line {line} precedes any session group")]
    SampleOutsideGroup { line: usize },
    #[error("recording contains no session groups")]
    Empty,
}

/// Turns one recording file into grouped, typed samples.
///
/// Implementations push events in file order and must stop as soon as the
/// visitor returns `ControlFlow::Break`.
pub trait RecordingParser: Send + Sync + 'static {
    fn accepts(&self, path: &Path) -> bool;

    fn parse(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(ParseEvent) -> ControlFlow<()>,
    ) -> Result<ParseSummary, ParseError>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NdjsonLine {
    Session(SessionMeta),
    Tick(SensorSample),
}

/// Line-delimited JSON recordings: `{"type":"session",..}` opens a group and
/// `{"type":"tick",..}` lines are its samples.
#[derive(Debug, Clone, Default)]
pub struct NdjsonParser;

impl RecordingParser for NdjsonParser {
    fn accepts(&self, path: &Path) -> bool {
        matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("ndjson") | Some("jsonl")
        )
    }

    fn parse(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(ParseEvent) -> ControlFlow<()>,
    ) -> Result<ParseSummary, ParseError> {
        let io_err = |source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        };
        let reader = BufReader::new(File::open(path).map_err(io_err)?);
        let mut summary = ParseSummary::default();

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let mut bytes = line.into_bytes();
            let parsed: NdjsonLine =
                simd_json::serde::from_slice(&mut bytes).map_err(|err| ParseError::Malformed {
                    line: line_no,
                    message: err.to_string(),
                })?;

            let event = match parsed {
                NdjsonLine::Session(meta) => {
                    summary.groups += 1;
                    ParseEvent::Group(meta)
                }
                NdjsonLine::Tick(sample) => {
                    if summary.groups == 0 {
                        return Err(ParseError::SampleOutsideGroup { line: line_no });
                    }
                    summary.samples += 1;
                    ParseEvent::Sample(sample)
                }
            };
            if visit(event).is_break() {
                summary.stopped = true;
                return Ok(summary);
            }
        }

        if summary.groups == 0 {
            return Err(ParseError::Empty);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_recording(dir: &Path, name: &str, lines: &[serde_json::Value]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    #[test]
    fn parses_groups_and_samples_in_order() {
        let dir = TempDir::new().unwrap();
        let path = write_recording(
            dir.path(),
            "spa 2024-05-01 18-22-10.ndjson",
            &[
                serde_json::json!({"type": "session", "sub_session_id": "a", "track_name": "spa"}),
                serde_json::json!({"type": "tick", "session_time": 0.1, "speed": 10.0}),
                serde_json::json!({"type": "tick", "session_time": 0.2, "speed": 11.0}),
                serde_json::json!({"type": "session", "sub_session_id": "b"}),
                serde_json::json!({"type": "tick", "session_time": 0.3, "gear": 3}),
            ],
        );

        let mut seen = Vec::new();
        let summary = NdjsonParser
            .parse(&path, &mut |event| {
                seen.push(match event {
                    ParseEvent::Group(meta) => format!("group:{}", meta.sub_session_id),
                    ParseEvent::Sample(sample) => format!("tick:{}", sample.session_time),
                });
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(summary.groups, 2);
        assert_eq!(summary.samples, 3);
        assert!(!summary.stopped);
        assert_eq!(
            seen,
            vec!["group:a", "tick:0.1", "tick:0.2", "group:b", "tick:0.3"]
        );
    }

    #[test]
    fn visitor_break_stops_parsing() {
        let dir = TempDir::new().unwrap();
        let path = write_recording(
            dir.path(),
            "stop.ndjson",
            &[
                serde_json::json!({"type": "session", "sub_session_id": "a"}),
                serde_json::json!({"type": "tick"}),
                serde_json::json!({"type": "tick"}),
            ],
        );
        let mut events = 0;
        let summary = NdjsonParser
            .parse(&path, &mut |_| {
                events += 1;
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(events, 1);
        assert!(summary.stopped);
    }

    #[test]
    fn rejects_orphan_samples_and_empty_files() {
        let dir = TempDir::new().unwrap();
        let orphan = write_recording(
            dir.path(),
            "orphan.ndjson",
            &[serde_json::json!({"type": "tick"})],
        );
        let err = NdjsonParser
            .parse(&orphan, &mut |_| ControlFlow::Continue(()))
            .unwrap_err();
        assert!(matches!(err, ParseError::SampleOutsideGroup { line: 1 }));

        let empty = write_recording(dir.path(), "empty.ndjson", &[]);
        let err = NdjsonParser
            .parse(&empty, &mut |_| ControlFlow::Continue(()))
            .unwrap_err();
        assert!(matches!(err, ParseError::Empty));
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.ndjson");
        std::fs::write(&path, "{\"type\":\"session\",\"sub_session_id\":\"a\"}\n{not json\n").unwrap();
        let err = NdjsonParser
            .parse(&path, &mut |_| ControlFlow::Continue(()))
            .unwrap_err();
        assert!(matches!(err, ParseError::Malformed { line: 2, .. }));
    }

    #[test]
    fn accepts_only_line_delimited_extensions() {
        assert!(NdjsonParser.accepts(Path::new("a.ndjson")));
        assert!(NdjsonParser.accepts(Path::new("a.jsonl")));
        assert!(!NdjsonParser.accepts(Path::new("a.ibt")));
    }
}
