// ABOUTME: Reassembles raw output chunks into complete log lines.
// ABOUTME: Holds at most one partial line per stream between chunks.

use super::error::ContainerError;
use super::traits::{LogLine, LogLines, LogStream};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, stream};
use std::collections::VecDeque;

/// Splits byte chunks on `\n`, carrying incomplete tails over to the next chunk.
#[derive(Debug, Default)]
pub struct LineSplitter {
    timestamps: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LineSplitter {
    /// With `timestamps`, a leading RFC 3339 token is parsed off each line.
    pub fn new(timestamps: bool) -> Self {
        Self {
            timestamps,
            ..Self::default()
        }
    }

    pub fn push(&mut self, stream: LogStream, chunk: &[u8]) -> Vec<LogLine> {
        let timestamps = self.timestamps;
        let partial = self.partial_mut(stream);
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            partial.extend_from_slice(&rest[..pos]);
            lines.push(make_line(stream, partial, timestamps));
            partial.clear();
            rest = &rest[pos + 1..];
        }
        partial.extend_from_slice(rest);
        lines
    }

    /// Emit whatever partial lines remain at end of stream.
    pub fn finish(&mut self) -> Vec<LogLine> {
        let mut lines = Vec::new();
        for stream in [LogStream::Stdout, LogStream::Stderr] {
            let timestamps = self.timestamps;
            let partial = self.partial_mut(stream);
            if !partial.is_empty() {
                lines.push(make_line(stream, partial, timestamps));
                partial.clear();
            }
        }
        lines
    }

    fn partial_mut(&mut self, stream: LogStream) -> &mut Vec<u8> {
        match stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        }
    }
}

fn make_line(stream: LogStream, raw: &[u8], timestamps: bool) -> LogLine {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    if timestamps
        && let Some((ts, content)) = text.split_once(' ')
        && let Ok(parsed) = DateTime::parse_from_rfc3339(ts)
    {
        return LogLine {
            stream,
            content: content.to_string(),
            timestamp: Some(parsed.with_timezone(&Utc)),
        };
    }
    LogLine::new(stream, text)
}

struct SplitState {
    chunks: std::pin::Pin<Box<dyn Stream<Item = Result<(LogStream, Bytes), ContainerError>> + Send>>,
    splitter: LineSplitter,
    ready: VecDeque<LogLine>,
    done: bool,
}

/// Turn a stream of output chunks into a stream of lines.
///
/// An error from the underlying stream is yielded once and ends the stream.
pub fn split_lines<S>(chunks: S, timestamps: bool) -> LogLines
where
    S: Stream<Item = Result<(LogStream, Bytes), ContainerError>> + Send + 'static,
{
    let state = SplitState {
        chunks: Box::pin(chunks),
        splitter: LineSplitter::new(timestamps),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.ready.pop_front() {
                return Some((Ok(line), st));
            }
            if st.done {
                return None;
            }
            match st.chunks.next().await {
                Some(Ok((stream, bytes))) => {
                    let lines = st.splitter.push(stream, &bytes);
                    st.ready.extend(lines);
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.done = true;
                    let lines = st.splitter.finish();
                    st.ready.extend(lines);
                }
            }
        }
    }))
}
