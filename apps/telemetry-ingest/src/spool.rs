use crate::broker::{BrokerChannel, ConnectionPool};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use chrono::Utc;
use crc32c::crc32c;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const SEGMENT_MAGIC: &[u8; 8] = b"TTSPILL1";
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_HEADER_LEN: usize = 64;
const FRAME_HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;
const OPEN_EXT: &str = "open";
const SEALED_EXT: &str = "seg";
const CORRUPT_EXT: &str = "corrupt";

struct OpenSegment {
    path: PathBuf,
    file: fs::File,
}

/// Append-only spillover for batches that could not reach the broker.
///
/// Each frame is `len u32 LE | crc32c u32 LE | envelope bytes`. A writer owns
/// one `.open` segment, created on first append and renamed to `.seg` by
/// [`SpillWriter::seal`]. A failed append is cut back out of the segment so
/// later frames stay readable.
pub struct SpillWriter {
    dir: PathBuf,
    worker_id: u32,
    segment: Option<OpenSegment>,
    frames: u64,
}

impl SpillWriter {
    pub fn new(dir: impl Into<PathBuf>, worker_id: u32) -> Self {
        Self {
            dir: dir.into(),
            worker_id,
            segment: None,
            frames: 0,
        }
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() > MAX_FRAME_LEN {
            return Err(anyhow!("spill frame of {} bytes out of range", payload.len()));
        }
        if self.segment.is_none() {
            self.segment = Some(self.create_segment()?);
        }
        let Some(segment) = self.segment.as_mut() else {
            return Err(anyhow!("spill segment unavailable"));
        };

        let start = segment.file.stream_position()?;
        if let Err(err) = write_frame(&mut segment.file, payload) {
            let path = segment.path.display().to_string();
            self.discard_partial(start);
            return Err(err.context(format!("append to {path}")));
        }
        self.frames += 1;
        Ok(())
    }

    /// Drops whatever a failed append left past `start`. A segment that
    /// cannot be cut back is sealed as is and the next append opens a new one.
    fn discard_partial(&mut self, start: u64) {
        let Some(segment) = self.segment.as_mut() else {
            return;
        };
        let rolled_back = segment
            .file
            .set_len(start)
            .and_then(|()| segment.file.seek(SeekFrom::Start(start)).map(|_| ()));
        if let Err(err) = rolled_back {
            tracing::warn!(
                path = %segment.path.display(),
                error = %err,
                "cannot roll back partial spill frame; retiring segment"
            );
            if let Err(err) = self.seal() {
                tracing::error!(error = %err, "failed to seal retired spill segment");
            }
        }
    }

    /// Closes the open segment so replay will pick it up.
    pub fn seal(&mut self) -> Result<Option<PathBuf>> {
        let Some(segment) = self.segment.take() else {
            return Ok(None);
        };
        segment.file.sync_data().ok();
        let sealed = segment.path.with_extension(SEALED_EXT);
        fs::rename(&segment.path, &sealed).with_context(|| {
            format!("rename {} -> {}", segment.path.display(), sealed.display())
        })?;
        tracing::info!(path = %sealed.display(), frames = self.frames, "sealed spill segment");
        self.frames = 0;
        Ok(Some(sealed))
    }

    fn create_segment(&self) -> Result<OpenSegment> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create spool dir {}", self.dir.display()))?;
        let id = Uuid::new_v4();
        let path = self.dir.join(format!("spill-{id}.{OPEN_EXT}"));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("create {}", path.display()))?;
        write_segment_header(&mut file, id, self.worker_id)?;
        file.sync_data().ok();
        Ok(OpenSegment { path, file })
    }
}

fn write_segment_header(file: &mut fs::File, id: Uuid, worker_id: u32) -> Result<()> {
    let created_wall_ms = Utc::now().timestamp_millis();
    let mut header = vec![0u8; SEGMENT_HEADER_LEN];
    header[0..8].copy_from_slice(SEGMENT_MAGIC);
    header[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(SEGMENT_HEADER_LEN as u32).to_le_bytes());
    header[16..32].copy_from_slice(id.as_bytes());
    header[32..40].copy_from_slice(&created_wall_ms.to_le_bytes());
    header[40..44].copy_from_slice(&worker_id.to_le_bytes());
    file.write_all(&header)?;
    Ok(())
}

fn check_segment_header(file: &mut fs::File) -> Result<()> {
    let mut header = [0u8; SEGMENT_HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header).context("segment header truncated")?;
    if &header[0..8] != SEGMENT_MAGIC {
        return Err(anyhow!("not a spill segment"));
    }
    Ok(())
}

fn write_frame(file: &mut fs::File, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    let crc = crc32c(payload);
    file.write_all(&len.to_le_bytes())?;
    file.write_all(&crc.to_le_bytes())?;
    file.write_all(payload)?;
    file.sync_data().context("sync spill frame")?;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Payload(Vec<u8>),
    /// Clean end of file on a frame boundary.
    End,
    Corrupt(&'static str),
}

/// Like `read_exact`, but reports how much was read before end of file.
fn read_up_to(file: &mut fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn read_frame(file: &mut fs::File) -> Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read_up_to(file, &mut header)? {
        0 => return Ok(Frame::End),
        FRAME_HEADER_LEN => {}
        _ => return Ok(Frame::Corrupt("truncated frame header")),
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len == 0 || len > MAX_FRAME_LEN {
        return Ok(Frame::Corrupt("frame length out of range"));
    }
    let remaining = file
        .metadata()?
        .len()
        .saturating_sub(file.stream_position()?);
    if len as u64 > remaining {
        return Ok(Frame::Corrupt("truncated frame"));
    }
    let mut payload = vec![0u8; len];
    if read_up_to(file, &mut payload)? < len {
        return Ok(Frame::Corrupt("truncated frame"));
    }
    if crc32c(&payload) != crc {
        return Ok(Frame::Corrupt("frame checksum mismatch"));
    }
    Ok(Frame::Payload(payload))
}

/// Cuts an interrupted segment back to its last intact frame.
fn recover_truncate_tail(file: &mut fs::File) -> Result<u64> {
    check_segment_header(file)?;
    let mut pos = SEGMENT_HEADER_LEN as u64;
    file.seek(SeekFrom::Start(pos))?;
    let mut frames = 0u64;
    loop {
        match read_frame(file)? {
            Frame::Payload(payload) => {
                pos += (FRAME_HEADER_LEN + payload.len()) as u64;
                frames += 1;
            }
            Frame::End => break,
            Frame::Corrupt(reason) => {
                tracing::debug!(reason, offset = pos, "cutting torn spill tail");
                break;
            }
        }
    }
    file.set_len(pos)?;
    file.seek(SeekFrom::End(0))?;
    Ok(frames)
}

fn segments_with_ext(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry?.path();
        let is_spill = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with("spill-"))
            .unwrap_or(false);
        if is_spill && path.extension().and_then(|e| e.to_str()) == Some(ext) {
            found.push(path);
        }
    }
    found.sort_by_key(|path| {
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
    });
    Ok(found)
}

/// Seals `.open` segments left behind by a crash. Returns how many were recovered.
pub fn recover_open_segments(dir: &Path) -> Result<usize> {
    let mut recovered = 0;
    for path in segments_with_ext(dir, OPEN_EXT)? {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        match recover_truncate_tail(&mut file) {
            Ok(frames) => {
                drop(file);
                let sealed = path.with_extension(SEALED_EXT);
                fs::rename(&path, &sealed)
                    .with_context(|| format!("rename {} -> {}", path.display(), sealed.display()))?;
                tracing::info!(path = %sealed.display(), frames, "recovered interrupted spill segment");
                recovered += 1;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "discarding unreadable spill segment");
                drop(file);
                fs::remove_file(&path).ok();
            }
        }
    }
    Ok(recovered)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub recovered: usize,
    pub segments_replayed: usize,
    pub frames_replayed: u64,
    pub segments_remaining: usize,
    /// Sealed segments with a damaged frame, renamed to `.corrupt` and kept.
    pub segments_quarantined: usize,
}

/// Re-publishes spilled batches, oldest segment first.
///
/// Stops at the first frame that cannot be delivered and leaves its segment in
/// place; frames of that segment already sent will be sent again next time.
/// A sealed segment only ever ends on a frame boundary, so a damaged frame
/// means corruption: the segment is renamed to `.corrupt` instead of deleted.
pub async fn replay_spilled<C: BrokerChannel>(
    dir: &Path,
    pool: &ConnectionPool<C>,
    topic: &str,
    attempt_timeout: Duration,
) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();
    if !dir.exists() {
        return Ok(summary);
    }
    summary.recovered = recover_open_segments(dir)?;

    let segments = segments_with_ext(dir, SEALED_EXT)?;
    for (idx, path) in segments.iter().enumerate() {
        let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
        if let Err(err) = check_segment_header(&mut file) {
            tracing::warn!(path = %path.display(), error = %err, "skipping invalid spill segment");
            summary.segments_remaining += 1;
            continue;
        }

        let mut frames = 0u64;
        let mut corrupt = None;
        loop {
            let payload = match read_frame(&mut file)? {
                Frame::Payload(payload) => payload,
                Frame::End => break,
                Frame::Corrupt(reason) => {
                    corrupt = Some(reason);
                    break;
                }
            };
            if !publish_frame(pool, topic, Bytes::from(payload), attempt_timeout).await {
                tracing::warn!(
                    path = %path.display(),
                    frames_sent = frames,
                    "spill replay stopped; broker unavailable"
                );
                summary.frames_replayed += frames;
                summary.segments_remaining += segments.len() - idx;
                return Ok(summary);
            }
            frames += 1;
        }
        drop(file);
        summary.frames_replayed += frames;

        if let Some(reason) = corrupt {
            let quarantined = path.with_extension(CORRUPT_EXT);
            fs::rename(path, &quarantined).with_context(|| {
                format!("rename {} -> {}", path.display(), quarantined.display())
            })?;
            tracing::error!(
                path = %quarantined.display(),
                frames_sent = frames,
                reason,
                "spill segment damaged; frames past the damage were not replayed"
            );
            summary.segments_quarantined += 1;
            continue;
        }

        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
        tracing::info!(path = %path.display(), frames, "replayed spill segment");
        summary.segments_replayed += 1;
    }

    Ok(summary)
}

async fn publish_frame<C: BrokerChannel>(
    pool: &ConnectionPool<C>,
    topic: &str,
    payload: Bytes,
    attempt_timeout: Duration,
) -> bool {
    for _ in 0..pool.size() {
        let channel = match pool.get_channel() {
            Ok(channel) => channel,
            Err(err) => {
                tracing::debug!(error = %err, "replay attempt skipped");
                continue;
            }
        };
        match tokio::time::timeout(attempt_timeout, channel.publish(topic, payload.clone())).await {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => tracing::debug!(slot = channel.slot(), error = %err, "replay publish failed"),
            Err(_) => tracing::debug!(slot = channel.slot(), "replay publish timed out"),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockBroker;
    use tempfile::TempDir;

    #[test]
    fn append_and_seal_writes_framed_segment() {
        let dir = TempDir::new().unwrap();
        let mut writer = SpillWriter::new(dir.path(), 7);
        assert!(writer.seal().unwrap().is_none());

        writer.append(b"first").unwrap();
        writer.append(b"second").unwrap();
        let sealed = writer.seal().unwrap().unwrap();

        assert_eq!(sealed.extension().and_then(|e| e.to_str()), Some("seg"));
        let len = fs::metadata(&sealed).unwrap().len();
        assert_eq!(
            len,
            (SEGMENT_HEADER_LEN + 2 * FRAME_HEADER_LEN + "first".len() + "second".len()) as u64
        );

        let mut file = fs::File::open(&sealed).unwrap();
        check_segment_header(&mut file).unwrap();
        assert_eq!(read_frame(&mut file).unwrap(), Frame::Payload(b"first".to_vec()));
        assert_eq!(read_frame(&mut file).unwrap(), Frame::Payload(b"second".to_vec()));
        assert_eq!(read_frame(&mut file).unwrap(), Frame::End);
    }

    #[test]
    fn recover_truncates_partial_frame_and_seals() {
        let dir = TempDir::new().unwrap();
        let mut writer = SpillWriter::new(dir.path(), 1);
        writer.append(b"intact").unwrap();
        let open_path = writer.segment.as_ref().unwrap().path.clone();
        {
            let segment = writer.segment.as_mut().unwrap();
            segment.file.write_all(&100u32.to_le_bytes()).unwrap();
            segment.file.write_all(b"torn").unwrap();
        }
        // simulate a crash: the writer never seals
        std::mem::forget(writer);

        assert_eq!(recover_open_segments(dir.path()).unwrap(), 1);
        assert!(!open_path.exists());
        let sealed = open_path.with_extension("seg");
        let expected = (SEGMENT_HEADER_LEN + FRAME_HEADER_LEN + "intact".len()) as u64;
        assert_eq!(fs::metadata(&sealed).unwrap().len(), expected);
    }

    #[tokio::test]
    async fn partial_append_is_cut_back_before_the_next_frame() {
        let dir = TempDir::new().unwrap();
        let mut writer = SpillWriter::new(dir.path(), 1);
        writer.append(b"first").unwrap();
        let start = {
            let segment = writer.segment.as_mut().unwrap();
            let start = segment.file.stream_position().unwrap();
            // what a write cut short by a full disk leaves behind
            segment.file.write_all(&100u32.to_le_bytes()).unwrap();
            start
        };
        writer.discard_partial(start);
        writer.append(b"second").unwrap();
        writer.seal().unwrap();

        let broker = MockBroker::new();
        let summary = replay_spilled(dir.path(), &broker.pool(1), "t/ticks", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(summary.frames_replayed, 2);
        assert_eq!(summary.segments_quarantined, 0);
        assert_eq!(broker.payloads(), vec![Bytes::from("first"), Bytes::from("second")]);
    }

    #[tokio::test]
    async fn failed_append_retires_a_segment_it_cannot_cut_back() {
        let dir = TempDir::new().unwrap();
        let mut writer = SpillWriter::new(dir.path(), 1);
        writer.append(b"first").unwrap();
        let first_segment = {
            let segment = writer.segment.as_mut().unwrap();
            // a read-only handle fails both the write and the truncate
            segment.file = fs::File::open(&segment.path).unwrap();
            segment.path.clone()
        };

        assert!(writer.append(b"lost").is_err());
        assert!(writer.segment.is_none());
        assert!(first_segment.with_extension("seg").exists());

        writer.append(b"second").unwrap();
        writer.seal().unwrap();
        assert_eq!(segments_with_ext(dir.path(), SEALED_EXT).unwrap().len(), 2);

        let broker = MockBroker::new();
        let summary = replay_spilled(dir.path(), &broker.pool(1), "t/ticks", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(summary.segments_replayed, 2);
        assert_eq!(summary.segments_quarantined, 0);
        let mut payloads = broker.payloads();
        payloads.sort();
        assert_eq!(payloads, vec![Bytes::from("first"), Bytes::from("second")]);
    }

    #[tokio::test]
    async fn damaged_sealed_segment_is_quarantined_not_deleted() {
        let dir = TempDir::new().unwrap();
        let mut writer = SpillWriter::new(dir.path(), 1);
        writer.append(b"first").unwrap();
        writer
            .segment
            .as_mut()
            .unwrap()
            .file
            .write_all(&100u32.to_le_bytes())
            .unwrap();
        writer.append(b"second").unwrap();
        writer.append(b"third").unwrap();
        let sealed = writer.seal().unwrap().unwrap();

        let broker = MockBroker::new();
        let summary = replay_spilled(dir.path(), &broker.pool(1), "t/ticks", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(broker.payloads(), vec![Bytes::from("first")]);
        assert_eq!(summary.segments_replayed, 0);
        assert_eq!(summary.segments_quarantined, 1);
        assert!(!sealed.exists());
        let kept = sealed.with_extension("corrupt");
        assert!(kept.exists());
        let every_byte = SEGMENT_HEADER_LEN + 4 + 3 * FRAME_HEADER_LEN + "firstsecondthird".len();
        assert_eq!(fs::metadata(&kept).unwrap().len(), every_byte as u64);
    }

    #[tokio::test]
    async fn replay_publishes_frames_and_removes_segment() {
        let dir = TempDir::new().unwrap();
        let mut writer = SpillWriter::new(dir.path(), 2);
        writer.append(b"a").unwrap();
        writer.append(b"b").unwrap();
        writer.seal().unwrap();

        let broker = MockBroker::new();
        let pool = broker.pool(2);
        let summary = replay_spilled(dir.path(), &pool, "t/ticks", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(summary.segments_replayed, 1);
        assert_eq!(summary.frames_replayed, 2);
        assert_eq!(summary.segments_remaining, 0);
        assert_eq!(broker.payloads(), vec![Bytes::from("a"), Bytes::from("b")]);
        assert!(segments_with_ext(dir.path(), SEALED_EXT).unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_keeps_segment_when_broker_is_down() {
        let dir = TempDir::new().unwrap();
        let mut writer = SpillWriter::new(dir.path(), 2);
        writer.append(b"a").unwrap();
        writer.seal().unwrap();

        let broker = MockBroker::new();
        broker.set_failing(true);
        let pool = broker.pool(2);
        let summary = replay_spilled(dir.path(), &pool, "t/ticks", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(summary.segments_replayed, 0);
        assert_eq!(summary.segments_remaining, 1);
        assert_eq!(broker.attempts(), 2);
        assert_eq!(segments_with_ext(dir.path(), SEALED_EXT).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replay_of_missing_dir_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let pool = MockBroker::new().pool(1);
        let summary = replay_spilled(&dir.path().join("absent"), &pool, "t", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(summary, ReplaySummary::default());
    }
}
