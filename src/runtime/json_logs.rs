// ABOUTME: Filtering and formatting of structured (JSON per line) container logs.
// ABOUTME: Works on whole log text or on a live line stream, reassembling split records.

use super::error::ContainerError;
use super::traits::{LogLine, LogLines};
use futures::{StreamExt, stream};
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::debug;

/// Longest run of unparsed lines held while waiting for a record to complete.
const MAX_PENDING_BYTES: usize = 256 * 1024;

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const DARK_GREY: &str = "\x1b[90m";
const RESET: &str = "\x1b[0m";

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("constant pattern"));

static RESET_CODES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[0?m").expect("constant pattern"));

// =============================================================================
// Filters
// =============================================================================

/// A condition on one field of a JSON log record.
///
/// A record lacking the field never matches, negated or not.
#[derive(Debug, Clone)]
pub enum LogFilter {
    /// The field's text equals this. Non-string values compare by their JSON
    /// text, so `"3"` matches `3` and `"true"` matches `true`.
    Equals(String),
    /// A string field matching the expression from its start.
    Pattern(Regex),
    /// A numeric field compared against a number, e.g. `>=400`.
    Compare(Ordering, bool, f64),
    Not(Box<LogFilter>),
}

impl LogFilter {
    /// Shell-style pattern where `*` matches any run of characters.
    pub fn glob(glob: &str) -> Result<Self, regex::Error> {
        let pattern = regex::escape(glob).replace(r"\*", ".*");
        Ok(Self::Pattern(Regex::new(&format!("^{pattern}$"))?))
    }

    pub fn pattern(expr: &str) -> Result<Self, regex::Error> {
        Ok(Self::Pattern(Regex::new(&format!("^(?:{expr})"))?))
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Equals(expected) => match value {
                Value::String(s) => s == expected,
                other => other.to_string() == *expected,
            },
            Self::Pattern(re) => value.as_str().is_some_and(|s| re.is_match(s)),
            Self::Compare(ordering, or_equal, bound) => value
                .as_f64()
                .and_then(|n| n.partial_cmp(bound))
                .is_some_and(|cmp| cmp == *ordering || (*or_equal && cmp == Ordering::Equal)),
            Self::Not(inner) => !inner.matches(value),
        }
    }
}

/// `NOT x`, `<5`, `<=5`, `>5`, `>=5`, globs containing `*`, else equality.
impl FromStr for LogFilter {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("NOT ") {
            return Ok(Self::Not(Box::new(rest.parse()?)));
        }
        for (op, ordering, or_equal) in [
            ("<=", Ordering::Less, true),
            (">=", Ordering::Greater, true),
            ("<", Ordering::Less, false),
            (">", Ordering::Greater, false),
        ] {
            if let Some(bound) = s.strip_prefix(op).and_then(|n| n.trim().parse::<f64>().ok()) {
                return Ok(Self::Compare(ordering, or_equal, bound));
            }
        }
        if s.contains('*') {
            return Self::glob(s);
        }
        Ok(Self::Equals(s.to_string()))
    }
}

// =============================================================================
// Format
// =============================================================================

/// How JSON log records are selected and rendered.
#[derive(Debug, Clone, Default)]
pub struct JsonLogFormat {
    filters: Vec<(String, LogFilter)>,
    template: Option<String>,
    color: bool,
}

impl JsonLogFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only records whose `key` satisfies `filter`. Filters combine with AND.
    pub fn filter(mut self, key: impl Into<String>, filter: LogFilter) -> Self {
        self.filters.push((key.into(), filter));
        self
    }

    /// Render each record through `template`, where `{key}` is replaced by the
    /// field's value and missing fields render empty. `{{` and `}}` are
    /// literal braces. Without a template records are pretty-printed.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Color records by the severity in their `levelname` field.
    pub fn colored(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        self.filters.iter().all(|(key, filter)| {
            lookup(record, key).is_some_and(|value| filter.matches(value))
        })
    }

    /// Render one line of output, or `None` when a filter rejects it.
    ///
    /// Lines that are not JSON objects pass through unchanged.
    pub fn render_line(&self, line: &str) -> Option<String> {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(record)) => self.render_record(&record),
            Ok(_) => {
                debug!(line, "log line is JSON but not an object");
                Some(line.to_string())
            }
            Err(_) => Some(line.to_string()),
        }
    }

    fn render_record(&self, record: &Map<String, Value>) -> Option<String> {
        if !self.matches(record) {
            return None;
        }
        let text = match &self.template {
            Some(template) => fill_template(template, record),
            None => serde_json::to_string_pretty(record)
                .unwrap_or_default()
                .replace("\\u001b", "\x1b"),
        };
        let level = record.get("levelname").and_then(Value::as_str);
        match level.and_then(level_color) {
            Some(color) if self.color => Some(apply_color(&text, color)),
            _ => Some(text),
        }
    }
}

/// Field lookup that tolerates keys wrapped in color codes.
fn lookup<'a>(record: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    record.get(key).or_else(|| {
        record
            .iter()
            .find(|(k, _)| k.contains('\x1b') && ANSI_ESCAPE.replace_all(k, "") == key)
            .map(|(_, v)| v)
    })
}

fn fill_template(template: &str, record: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
        } else if let Some(end) = tail.strip_prefix('{').and_then(|t| t.find('}')) {
            let key = &tail[1..=end];
            match lookup(record, key) {
                Some(Value::String(s)) => out.push_str(s),
                Some(Value::Null) | None => {}
                Some(other) => out.push_str(&other.to_string()),
            }
            rest = &tail[end + 2..];
        } else {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

fn level_color(level: &str) -> Option<&'static str> {
    if ["ERROR", "FATAL", "CRITICAL"].iter().any(|l| level.contains(l)) {
        Some(RED)
    } else if level.contains("WARNING") {
        Some(YELLOW)
    } else if level.contains("DEBUG") {
        Some(DARK_GREY)
    } else {
        None
    }
}

/// Color the whole line, keeping colored fragments inside it colored.
fn apply_color(line: &str, color: &str) -> String {
    format!("{color}{}{RESET}", RESET_CODES.replace_all(line, color))
}

/// Render every line of `logs`, dropping records the filters reject.
pub fn parse_json_logs(logs: &str, format: &JsonLogFormat) -> String {
    logs.lines()
        .filter_map(|line| format.render_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

// =============================================================================
// Streaming
// =============================================================================

/// Joins lines until they parse as one JSON record.
///
/// A record printed across several lines arrives here as several log lines.
/// Lines are buffered only while they look like the start of an unfinished
/// object; anything else passes straight through.
#[derive(Debug, Default)]
pub struct RecordAssembler {
    pending: String,
}

impl RecordAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line, returning the rendered output it completes.
    pub fn push(&mut self, format: &JsonLogFormat, line: &str) -> Vec<String> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let candidate = format!("{}{line}", self.pending);
            match serde_json::from_str::<Value>(&candidate) {
                Ok(value) => {
                    self.pending.clear();
                    out.extend(render_value(format, &candidate, value));
                    return out;
                }
                Err(e) if e.is_eof() && candidate.len() <= MAX_PENDING_BYTES => {
                    self.pending = candidate;
                    return out;
                }
                Err(_) => out.extend(self.finish()),
            }
        }

        if line.trim_start().starts_with('{') {
            match serde_json::from_str::<Value>(line) {
                Ok(value) => out.extend(render_value(format, line, value)),
                Err(e) if e.is_eof() => self.pending.push_str(line),
                Err(_) => out.push(line.to_string()),
            }
        } else {
            out.extend(format.render_line(line));
        }
        out
    }

    /// Release whatever never completed, unparsed.
    pub fn finish(&mut self) -> Option<String> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }
}

fn render_value(format: &JsonLogFormat, raw: &str, value: Value) -> Option<String> {
    match value {
        Value::Object(record) => format.render_record(&record),
        _ => Some(raw.to_string()),
    }
}

struct StreamState {
    lines: LogLines,
    format: JsonLogFormat,
    assembler: RecordAssembler,
    ready: VecDeque<Result<LogLine, ContainerError>>,
    last: Option<LogLine>,
    done: bool,
}

/// Apply `format` to a live log stream.
///
/// Output lines keep the stream and timestamp of the line that completed
/// their record. An error from the source is passed on and ends the stream.
pub fn parse_streamed_json_logs(lines: LogLines, format: JsonLogFormat) -> LogLines {
    let state = StreamState {
        lines,
        format,
        assembler: RecordAssembler::new(),
        ready: VecDeque::new(),
        last: None,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.lines.next().await {
                Some(Ok(line)) => {
                    for content in st.assembler.push(&st.format, &line.content) {
                        st.ready.push_back(Ok(LogLine {
                            content,
                            ..line.clone()
                        }));
                    }
                    st.last = Some(line);
                }
                Some(Err(e)) => {
                    st.done = true;
                    st.ready.push_back(Err(e));
                }
                None => {
                    st.done = true;
                    if let (Some(content), Some(last)) = (st.assembler.finish(), st.last.take()) {
                        st.ready.push_back(Ok(LogLine { content, ..last }));
                    }
                }
            }
        }
    }))
}
