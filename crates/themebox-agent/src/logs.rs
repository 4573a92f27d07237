//! Per-sandbox dev server log. The launcher's stdout and stderr are attached
//! to `<workdir>/logs/dev.log` directly, so its output keeps flowing when the
//! manager goes away; the manager only reads the file back.

use std::{
    ffi::OsString,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Unterminated output longer than this is emitted as its own line.
const MAX_LINE_BYTES: usize = 16 * 1024;

/// Lines read back from a dev log and the byte offset to resume from.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LogTail {
    pub lines: Vec<String>,
    pub next_cursor: u64,
}

#[derive(Debug, Clone)]
pub struct DevLog {
    path: PathBuf,
}

impl DevLog {
    pub fn in_workdir(workdir: &Path) -> Self {
        Self {
            path: workdir.join("logs").join("dev.log"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotated(&self, n: usize) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Moves the previous launch's log to `dev.log.1`, shifting older ones up
    /// and keeping at most `keep` of them.
    pub async fn rotate(&self, keep: usize) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !exists(&self.path).await {
            return Ok(());
        }
        if keep == 0 {
            return tokio::fs::remove_file(&self.path).await;
        }
        remove_if_present(&self.rotated(keep)).await?;
        for n in (1..keep).rev() {
            let from = self.rotated(n);
            if exists(&from).await {
                tokio::fs::rename(&from, self.rotated(n + 1)).await?;
            }
        }
        tokio::fs::rename(&self.path, self.rotated(1)).await
    }

    /// Append-mode handles for the child's stdout and stderr.
    pub fn child_stdio(&self) -> io::Result<(std::fs::File, std::fs::File)> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let out = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let err = out.try_clone()?;
        Ok((out, err))
    }

    /// Appends a `[themebox]` line. Best-effort.
    pub async fn note(&self, message: &str) {
        let res = async {
            let mut f = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            f.write_all(format!("[themebox] {message}\n").as_bytes())
                .await?;
            f.flush().await
        }
        .await;
        if let Err(e) = res {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to append dev log note");
        }
    }

    pub async fn size(&self) -> u64 {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Follows lines appended after byte `offset`.
    pub async fn follow_from(&self, offset: u64) -> io::Result<LogFollower> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(LogFollower {
            file,
            pending: Vec::new(),
        })
    }

    /// Cursor 0 (or a cursor past the end, left over from a rotated file)
    /// returns the most recent `limit` lines; any other cursor returns up to
    /// `limit` lines starting there. At most `scan_bytes` are read. `None`
    /// when nothing has been logged yet.
    pub async fn tail(
        &self,
        cursor: u64,
        limit: usize,
        scan_bytes: u64,
    ) -> io::Result<Option<LogTail>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();
        let limit = limit.max(1);
        let from_end = cursor == 0 || cursor > len;
        let start = if from_end {
            len.saturating_sub(scan_bytes)
        } else {
            cursor
        };
        let end = len.min(start.saturating_add(scan_bytes));

        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = Vec::new();
        file.take(end - start).read_to_end(&mut buf).await?;

        let mut lines = complete_lines(&buf);
        if from_end && start > 0 && !lines.is_empty() {
            // The scan window may begin mid-line.
            lines.remove(0);
        }
        let picked: Vec<(usize, String)> = if from_end {
            let skip = lines.len().saturating_sub(limit);
            lines.into_iter().skip(skip).collect()
        } else {
            lines.into_iter().take(limit).collect()
        };
        let next_cursor = picked
            .last()
            .map(|(line_end, _)| start + *line_end as u64)
            .unwrap_or(start);

        Ok(Some(LogTail {
            lines: picked.into_iter().map(|(_, l)| l).collect(),
            next_cursor,
        }))
    }
}

/// Incremental reader over a growing dev log.
pub struct LogFollower {
    file: tokio::fs::File,
    pending: Vec<u8>,
}

impl LogFollower {
    /// Complete lines appended since the last call.
    pub async fn read_lines(&mut self) -> io::Result<Vec<String>> {
        let mut chunk = Vec::new();
        self.file.read_to_end(&mut chunk).await?;
        self.pending.extend_from_slice(&chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..pos]));
        }
        if self.pending.len() > MAX_LINE_BYTES {
            lines.push(decode_line(&std::mem::take(&mut self.pending)));
        }
        Ok(lines)
    }

    /// Everything left, including an unterminated last line.
    pub async fn read_remaining(&mut self) -> io::Result<Vec<String>> {
        let mut lines = self.read_lines().await?;
        if !self.pending.is_empty() {
            lines.push(decode_line(&std::mem::take(&mut self.pending)));
        }
        Ok(lines)
    }
}

/// Newline-terminated lines in `buf` with the offset just past each one.
/// Invalid UTF-8 is replaced rather than rejected.
fn complete_lines(buf: &[u8]) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut begin = 0;
    for (i, b) in buf.iter().enumerate() {
        if *b == b'\n' {
            out.push((i + 1, decode_line(&buf[begin..i])));
            begin = i + 1;
        }
    }
    out
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn log_with(dir: &Path, body: &[u8]) -> DevLog {
        let log = DevLog::in_workdir(dir);
        std::fs::create_dir_all(log.path().parent().unwrap()).unwrap();
        std::fs::write(log.path(), body).unwrap();
        log
    }

    #[tokio::test]
    async fn zero_cursor_returns_most_recent_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_with(dir.path(), b"line 0\nline 1\nline 2\nline 3\nline 4\n");

        let tail = log.tail(0, 2, 1024).await.unwrap().unwrap();
        assert_eq!(tail.lines, vec!["line 3", "line 4"]);
        assert_eq!(tail.next_cursor, log.size().await);

        let tail = log.tail(tail.next_cursor, 10, 1024).await.unwrap().unwrap();
        assert!(tail.lines.is_empty());
    }

    #[tokio::test]
    async fn cursor_pages_forward_and_skips_partial_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_with(dir.path(), b"a\nb\nc\npartial");

        let first = log.tail(1, 100, 1024).await.unwrap();
        // Cursor 1 sits inside "a\n": the remainder of that line comes first.
        assert_eq!(first.unwrap().lines, vec!["", "b", "c"]);

        let page = log.tail(2, 1, 1024).await.unwrap().unwrap();
        assert_eq!(page.lines, vec!["b"]);
        assert_eq!(page.next_cursor, 4);

        let rest = log.tail(page.next_cursor, 10, 1024).await.unwrap().unwrap();
        assert_eq!(rest.lines, vec!["c"]);
        assert_eq!(rest.next_cursor, 6);
    }

    #[tokio::test]
    async fn scan_window_drops_the_cut_line_and_stale_cursor_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_with(dir.path(), b"0123456789\nabc\ndef\n");

        let tail = log.tail(0, 10, 10).await.unwrap().unwrap();
        assert_eq!(tail.lines, vec!["abc", "def"]);

        let stale = log.tail(10_000, 1, 1024).await.unwrap().unwrap();
        assert_eq!(stale.lines, vec!["def"]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_with(dir.path(), b"caf\xe9\r\nok\n");
        let tail = log.tail(0, 10, 1024).await.unwrap().unwrap();
        assert_eq!(tail.lines, vec!["caf\u{fffd}", "ok"]);
    }

    #[tokio::test]
    async fn missing_log_has_no_tail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DevLog::in_workdir(dir.path()).tail(0, 10, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn follower_sees_appended_lines_after_eof() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_with(dir.path(), b"before\n");
        let mut follower = log.follow_from(log.size().await).await.unwrap();
        assert!(follower.read_lines().await.unwrap().is_empty());

        let (mut out, _) = log.child_stdio().unwrap();
        out.write_all(b"first\nsec").unwrap();
        assert_eq!(follower.read_lines().await.unwrap(), vec!["first"]);
        out.write_all(b"ond\n\xff\xfeend").unwrap();
        assert_eq!(follower.read_lines().await.unwrap(), vec!["second"]);
        assert_eq!(
            follower.read_remaining().await.unwrap(),
            vec!["\u{fffd}\u{fffd}end"]
        );
    }

    #[tokio::test]
    async fn rotation_keeps_a_bounded_history_of_launches() {
        let dir = tempfile::tempdir().unwrap();
        let log = DevLog::in_workdir(dir.path());
        for launch in 0..4 {
            log.rotate(2).await.unwrap();
            log.note(&format!("launch {launch}")).await;
        }

        let read = |p: PathBuf| std::fs::read_to_string(p).unwrap();
        assert_eq!(read(log.path().to_path_buf()), "[themebox] launch 3\n");
        assert_eq!(read(log.rotated(1)), "[themebox] launch 2\n");
        assert_eq!(read(log.rotated(2)), "[themebox] launch 1\n");
        assert!(!log.rotated(3).exists());
    }
}
