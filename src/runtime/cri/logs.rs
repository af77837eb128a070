// ABOUTME: Reader for the CRI container log file format.
// ABOUTME: Parses "<time> <stream> <P|F> <content>" records and joins partial lines.

use crate::runtime::error::ContainerError;
use crate::runtime::traits::{LogLine, LogLines, LogOptions, LogStream};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

const FOLLOW_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogParseError {
    #[error("missing fields")]
    MissingFields,

    #[error("bad timestamp: {0}")]
    Timestamp(String),

    #[error("unknown stream: {0}")]
    Stream(String),
}

/// One record of a CRI log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    /// `P` records continue on the next record of the same stream.
    pub partial: bool,
    pub content: &'a str,
}

/// Parse one line of a CRI log file (without its newline).
pub fn parse_line(line: &str) -> Result<CriRecord<'_>, LogParseError> {
    let mut parts = line.splitn(4, ' ');
    let ts = parts.next().ok_or(LogParseError::MissingFields)?;
    let stream = parts.next().ok_or(LogParseError::MissingFields)?;
    let tag = parts.next().ok_or(LogParseError::MissingFields)?;
    let content = parts.next().unwrap_or("");

    let timestamp = DateTime::parse_from_rfc3339(ts)
        .map_err(|_| LogParseError::Timestamp(ts.to_string()))?
        .with_timezone(&Utc);
    let stream = match stream {
        "stdout" => LogStream::Stdout,
        "stderr" => LogStream::Stderr,
        other => return Err(LogParseError::Stream(other.to_string())),
    };
    // Tags are colon separated; the first one is P or F.
    let partial = tag.split(':').next() == Some("P");

    Ok(CriRecord {
        timestamp,
        stream,
        partial,
        content,
    })
}

/// Joins `P` fragments into full lines, one pending fragment per stream.
#[derive(Debug, Default)]
pub struct Assembler {
    stdout: Option<String>,
    stderr: Option<String>,
}

impl Assembler {
    pub fn push(&mut self, record: &CriRecord<'_>) -> Option<LogLine> {
        let slot = match record.stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        };
        let mut content = slot.take().unwrap_or_default();
        content.push_str(record.content);
        if record.partial {
            *slot = Some(content);
            return None;
        }
        Some(LogLine {
            stream: record.stream,
            content,
            timestamp: Some(record.timestamp),
        })
    }

    /// Emit dangling fragments at end of stream.
    pub fn finish(&mut self) -> Vec<LogLine> {
        [
            (LogStream::Stdout, self.stdout.take()),
            (LogStream::Stderr, self.stderr.take()),
        ]
        .into_iter()
        .filter_map(|(stream, content)| content.map(|c| LogLine::new(stream, c)))
        .collect()
    }
}

/// Answers whether the container writing the log has exited.
pub type ExitCheck = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

struct Reader {
    path: PathBuf,
    opts: LogOptions,
    exit_check: ExitCheck,
    file: Option<BufReader<tokio::fs::File>>,
    assembler: Assembler,
    ready: VecDeque<LogLine>,
    buf: Vec<u8>,
    exit_seen: bool,
    done: bool,
}

impl Reader {
    fn accept(&mut self, raw: &[u8]) -> Option<LogLine> {
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        // Containers may write arbitrary bytes; keep the record, lossily.
        let line = String::from_utf8_lossy(raw);
        let record = match parse_line(&line) {
            Ok(record) => record,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "skipping malformed log line");
                return None;
            }
        };
        if !self.opts.wants(record.stream) {
            return None;
        }
        let mut line = self.assembler.push(&record)?;
        if !self.opts.timestamps {
            line.timestamp = None;
        }
        Some(line)
    }

    async fn open(&mut self) -> Result<(), ContainerError> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ContainerError::NotFound(format!("log file {}", self.path.display()))
            } else {
                ContainerError::BackendUnavailable(format!("{}: {e}", self.path.display()))
            }
        })?;
        let mut file = BufReader::new(file);

        if let Some(n) = self.opts.tail {
            let keep = usize::try_from(n).unwrap_or(usize::MAX);
            loop {
                self.buf.clear();
                let read = file
                    .read_until(b'\n', &mut self.buf)
                    .await
                    .map_err(io_error)?;
                if read == 0 {
                    break;
                }
                let raw = std::mem::take(&mut self.buf);
                if let Some(line) = self.accept(&raw) {
                    if self.ready.len() == keep {
                        self.ready.pop_front();
                    }
                    if keep > 0 {
                        self.ready.push_back(line);
                    }
                }
            }
        }

        self.file = Some(file);
        Ok(())
    }

    /// Next complete line, or `None` at end of stream.
    async fn next_line(&mut self) -> Result<Option<LogLine>, ContainerError> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.done {
                return Ok(None);
            }
            if self.file.is_none() {
                self.open().await?;
                continue;
            }
            let Some(file) = self.file.as_mut() else {
                continue;
            };

            let read = file
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(io_error)?;
            if read > 0 && self.buf.ends_with(b"\n") {
                let raw = std::mem::take(&mut self.buf);
                if let Some(line) = self.accept(&raw) {
                    return Ok(Some(line));
                }
                continue;
            }

            // At end of file, possibly with a half-written record in buf.
            if !self.opts.follow || self.exit_seen {
                self.done = true;
                if !self.buf.is_empty() {
                    let raw = std::mem::take(&mut self.buf);
                    if let Some(line) = self.accept(&raw) {
                        self.ready.push_back(line);
                    }
                }
                let rest = self.assembler.finish();
                self.ready.extend(rest);
                continue;
            }
            // One more pass after the exit is seen drains what the runtime
            // flushed before the container stopped.
            if (self.exit_check)().await {
                self.exit_seen = true;
                continue;
            }
            tokio::time::sleep(FOLLOW_POLL).await;
        }
    }
}

fn io_error(e: std::io::Error) -> ContainerError {
    ContainerError::BackendUnavailable(format!("reading log file: {e}"))
}

/// Stream a CRI log file.
///
/// With `follow`, the stream waits for new records until `exit_check` reports the
/// container exited and the file is drained.
// TODO: reopen on kubelet-style rotation (0.log renamed to 0.log.<timestamp>)
pub fn read_log_file(path: PathBuf, opts: LogOptions, exit_check: ExitCheck) -> LogLines {
    let reader = Reader {
        path,
        opts,
        exit_check,
        file: None,
        assembler: Assembler::default(),
        ready: VecDeque::new(),
        buf: Vec::new(),
        exit_seen: false,
        done: false,
    };

    Box::pin(stream::unfold(reader, |mut reader| async move {
        match reader.next_line().await {
            Ok(Some(line)) => Some((Ok(line), reader)),
            Ok(None) => None,
            Err(e) => {
                reader.done = true;
                reader.ready.clear();
                Some((Err(e), reader))
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_record() {
        let rec = parse_line("2024-03-01T10:00:00.123456789Z stdout F hello world").unwrap();
        assert_eq!(rec.stream, LogStream::Stdout);
        assert!(!rec.partial);
        assert_eq!(rec.content, "hello world");
    }

    #[test]
    fn parses_empty_content_and_tags() {
        let rec = parse_line("2024-03-01T10:00:00Z stderr P:extra").unwrap();
        assert!(rec.partial);
        assert_eq!(rec.content, "");
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(parse_line("garbage"), Err(LogParseError::MissingFields));
        assert!(matches!(
            parse_line("yesterday stdout F x"),
            Err(LogParseError::Timestamp(_))
        ));
        assert!(matches!(
            parse_line("2024-03-01T10:00:00Z stdin F x"),
            Err(LogParseError::Stream(_))
        ));
    }

    #[test]
    fn assembler_joins_partials_per_stream() {
        let mut asm = Assembler::default();
        let p1 = parse_line("2024-03-01T10:00:00Z stdout P abc").unwrap();
        let e1 = parse_line("2024-03-01T10:00:00Z stderr F oops").unwrap();
        let f1 = parse_line("2024-03-01T10:00:01Z stdout F def").unwrap();
        assert!(asm.push(&p1).is_none());
        assert_eq!(asm.push(&e1).unwrap().content, "oops");
        assert_eq!(asm.push(&f1).unwrap().content, "abcdef");
        assert!(asm.finish().is_empty());
    }

    fn exited(value: bool) -> ExitCheck {
        Arc::new(move || Box::pin(async move { value }))
    }

    async fn collect(path: PathBuf, opts: LogOptions, exit_check: ExitCheck) -> Vec<String> {
        use futures::StreamExt;
        read_log_file(path, opts, exit_check)
            .map(|line| line.unwrap().content)
            .collect()
            .await
    }

    #[tokio::test]
    async fn invalid_utf8_record_does_not_end_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.log");
        let mut raw = b"2024-03-01T10:00:00Z stdout F first\n".to_vec();
        raw.extend_from_slice(b"2024-03-01T10:00:01Z stdout F \xff\xfe\n");
        raw.extend_from_slice(b"2024-03-01T10:00:02Z stdout F third\n");
        std::fs::write(&path, raw).unwrap();

        let lines = collect(path, LogOptions::default(), exited(true)).await;
        assert_eq!(lines, ["first", "\u{fffd}\u{fffd}", "third"]);
    }

    #[tokio::test]
    async fn tail_keeps_last_lines_of_wanted_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.log");
        std::fs::write(
            &path,
            "2024-03-01T10:00:00Z stdout F one\n\
             2024-03-01T10:00:01Z stderr F noise\n\
             2024-03-01T10:00:02Z stdout F two\n\
             2024-03-01T10:00:03Z stdout F three\n",
        )
        .unwrap();

        let opts = LogOptions {
            stderr: false,
            tail: Some(2),
            ..LogOptions::default()
        };
        let lines = collect(path, opts, exited(true)).await;
        assert_eq!(lines, ["two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn follow_waits_for_records_until_exit() {
        use std::io::Write;
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.log");
        std::fs::write(&path, "2024-03-01T10:00:00Z stdout F early\n").unwrap();

        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let exit_check: ExitCheck = Arc::new(move || {
            let flag = flag.clone();
            Box::pin(async move { flag.load(Ordering::SeqCst) })
        });

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .unwrap();
            file.write_all(b"2024-03-01T10:00:05Z stdout P la").unwrap();
            file.write_all(b"\n2024-03-01T10:00:05Z stdout F te\n").unwrap();
            stopped.store(true, Ordering::SeqCst);
        });

        let opts = LogOptions {
            follow: true,
            ..LogOptions::default()
        };
        let lines = collect(path, opts, exit_check).await;
        writer.await.unwrap();
        assert_eq!(lines, ["early", "late"]);
    }
}
