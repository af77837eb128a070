// ABOUTME: Shared types used across runtime trait definitions.
// ABOUTME: ContainerSpec and its builder, signals, exec requests, log options and lines.

use super::super::error::ContainerError;
use crate::types::{ImageRef, LogicalNameError, ParseImageRefError};
use chrono::{DateTime, Utc};
use futures::Stream;
use nonempty::NonEmpty;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Container Spec
// =============================================================================

/// Validation failures raised by [`ContainerSpecBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("invalid container name: {0}")]
    InvalidName(#[from] LogicalNameError),

    #[error("invalid image reference: {0}")]
    Image(#[from] ParseImageRefError),

    #[error("environment variable name cannot be empty")]
    EmptyEnvKey,

    #[error("invalid environment variable name: {0}")]
    InvalidEnvKey(String),

    #[error("mount paths must be absolute: {0}")]
    RelativeMountPath(String),

    #[error("container path mounted twice: {0}")]
    DuplicateMountTarget(String),

    #[error("working directory must be absolute: {0}")]
    RelativeWorkingDir(String),

    #[error("command override cannot be empty")]
    EmptyCommand,

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("network name cannot be empty")]
    EmptyNetwork,
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl FromStr for Mount {
    type Err = SpecError;

    /// Parses `HOST:CONTAINER[:ro|:rw]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let host = parts.next().unwrap_or_default();
        let container = parts
            .next()
            .ok_or_else(|| SpecError::RelativeMountPath(s.to_string()))?;
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(_) => return Err(SpecError::RelativeMountPath(s.to_string())),
        };
        Ok(Mount {
            host_path: host.to_string(),
            container_path: container.to_string(),
            read_only,
        })
    }
}

/// Resource limits for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    /// Relative CPU weight.
    pub cpu_shares: Option<u64>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,
}

/// How the container is attached to the network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Whatever the backend does by default (bridge for Docker, pod network for CRI).
    #[default]
    Default,
    Host,
    None,
    Named(String),
}

impl FromStr for NetworkMode {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(SpecError::EmptyNetwork),
            "default" | "bridge" => Ok(NetworkMode::Default),
            "host" => Ok(NetworkMode::Host),
            "none" => Ok(NetworkMode::None),
            other => Ok(NetworkMode::Named(other.to_string())),
        }
    }
}

/// Immutable description of a container to create.
///
/// Only obtainable through [`ContainerSpec::builder`], which validates every
/// field once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSpec {
    #[serde(serialize_with = "serialize_display")]
    image: ImageRef,
    command: Option<Vec<String>>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    resources: ResourceLimits,
    mounts: Vec<Mount>,
    network: NetworkMode,
    working_dir: Option<String>,
    labels: BTreeMap<String, String>,
    tty: bool,
}

fn serialize_display<S: serde::Serializer>(
    value: &ImageRef,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl ContainerSpec {
    pub fn builder(image: impl Into<String>) -> ContainerSpecBuilder {
        ContainerSpecBuilder {
            image: image.into(),
            command: None,
            args: Vec::new(),
            env: Vec::new(),
            resources: ResourceLimits::default(),
            mounts: Vec::new(),
            network: NetworkMode::Default,
            working_dir: None,
            labels: BTreeMap::new(),
            tty: false,
        }
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    /// Entrypoint override.
    pub fn command(&self) -> Option<&[String]> {
        self.command.as_deref()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn resources(&self) -> ResourceLimits {
        self.resources
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn network(&self) -> &NetworkMode {
        &self.network
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.working_dir.as_deref()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn tty(&self) -> bool {
        self.tty
    }
}

/// Builder for [`ContainerSpec`].
#[derive(Debug, Clone)]
#[must_use = "call build() to obtain a ContainerSpec"]
pub struct ContainerSpecBuilder {
    image: String,
    command: Option<Vec<String>>,
    args: Vec<String>,
    env: Vec<(String, String)>,
    resources: ResourceLimits,
    mounts: Vec<Mount>,
    network: NetworkMode,
    working_dir: Option<String>,
    labels: BTreeMap<String, String>,
    tty: bool,
}

impl ContainerSpecBuilder {
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Later values for the same key replace earlier ones.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.resources.memory_bytes = Some(bytes);
        self
    }

    pub fn cpu_shares(mut self, shares: u64) -> Self {
        self.resources.cpu_shares = Some(shares);
        self
    }

    pub fn mount(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
        read_only: bool,
    ) -> Self {
        self.mounts.push(Mount {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only,
        });
        self
    }

    pub fn network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    pub fn build(self) -> Result<ContainerSpec, SpecError> {
        let image = ImageRef::parse(&self.image)?;

        if let Some(cmd) = &self.command
            && cmd.is_empty()
        {
            return Err(SpecError::EmptyCommand);
        }

        let mut env = BTreeMap::new();
        for (key, value) in self.env {
            if key.is_empty() {
                return Err(SpecError::EmptyEnvKey);
            }
            if key.contains('=') || key.contains('\0') {
                return Err(SpecError::InvalidEnvKey(key));
            }
            env.insert(key, value);
        }

        let mut targets = std::collections::HashSet::new();
        for mount in &self.mounts {
            for path in [&mount.host_path, &mount.container_path] {
                if !path.starts_with('/') {
                    return Err(SpecError::RelativeMountPath(path.clone()));
                }
            }
            if !targets.insert(mount.container_path.as_str()) {
                return Err(SpecError::DuplicateMountTarget(mount.container_path.clone()));
            }
        }

        if let Some(dir) = &self.working_dir
            && !dir.starts_with('/')
        {
            return Err(SpecError::RelativeWorkingDir(dir.clone()));
        }

        if self.resources.memory_bytes == Some(0) {
            return Err(SpecError::ZeroLimit("memory limit"));
        }
        if self.resources.cpu_shares == Some(0) {
            return Err(SpecError::ZeroLimit("cpu shares"));
        }
        if let NetworkMode::Named(name) = &self.network
            && name.is_empty()
        {
            return Err(SpecError::EmptyNetwork);
        }

        Ok(ContainerSpec {
            image,
            command: self.command,
            args: self.args,
            env,
            resources: self.resources,
            mounts: self.mounts,
            network: self.network,
            working_dir: self.working_dir,
            labels: self.labels,
            tty: self.tty,
        })
    }
}

// =============================================================================
// Signals
// =============================================================================

/// POSIX signals deliverable through the abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Kill,
    Usr1,
    Usr2,
    Term,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Kill => "SIGKILL",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
            Signal::Term => "SIGTERM",
        }
    }

    /// Linux signal number.
    pub fn number(&self) -> i32 {
        match self {
            Signal::Hup => 1,
            Signal::Int => 2,
            Signal::Quit => 3,
            Signal::Kill => 9,
            Signal::Usr1 => 10,
            Signal::Usr2 => 12,
            Signal::Term => 15,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "HUP" | "1" => Ok(Signal::Hup),
            "INT" | "2" => Ok(Signal::Int),
            "QUIT" | "3" => Ok(Signal::Quit),
            "KILL" | "9" => Ok(Signal::Kill),
            "USR1" | "10" => Ok(Signal::Usr1),
            "USR2" | "12" => Ok(Signal::Usr2),
            "TERM" | "15" => Ok(Signal::Term),
            _ => Err(format!("unknown signal: {s}")),
        }
    }
}

// =============================================================================
// Exec
// =============================================================================

/// A command to run inside a running container.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub cmd: NonEmpty<String>,
    pub working_dir: Option<String>,
    /// Upper bound on the command's run time.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(cmd: NonEmpty<String>) -> Self {
        Self {
            cmd,
            working_dir: None,
            timeout: None,
        }
    }

    /// Returns `None` for an empty command line.
    pub fn from_vec(cmd: Vec<String>) -> Option<Self> {
        NonEmpty::from_vec(cmd).map(Self::new)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn argv(&self) -> Vec<String> {
        self.cmd.iter().cloned().collect()
    }
}

/// Result of a finished exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

// =============================================================================
// Logs
// =============================================================================

/// Options for log streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    /// Include stdout.
    pub stdout: bool,
    /// Include stderr.
    pub stderr: bool,
    /// Keep the stream open for new output (like `tail -f`).
    pub follow: bool,
    /// Parse backend timestamps into [`LogLine::timestamp`].
    pub timestamps: bool,
    /// Number of lines to show from end (`None` = all).
    pub tail: Option<u64>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            tail: None,
        }
    }
}

impl LogOptions {
    /// Create options for following all logs.
    pub fn follow_all() -> Self {
        Self {
            follow: true,
            ..Self::default()
        }
    }

    /// Create options for the last N lines.
    pub fn tail(n: u64) -> Self {
        Self {
            tail: Some(n),
            ..Self::default()
        }
    }

    pub fn wants(&self, stream: LogStream) -> bool {
        match stream {
            LogStream::Stdout => self.stdout,
            LogStream::Stderr => self.stderr,
        }
    }
}

/// Log stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A single complete log line, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            stream,
            content: content.into(),
            timestamp: None,
        }
    }
}

/// Lazy, consumer-paced stream of log lines.
pub type LogLines = Pin<Box<dyn Stream<Item = Result<LogLine, ContainerError>> + Send>>;

// =============================================================================
// Runtime Metadata
// =============================================================================

/// Backend identification returned by `RuntimeInfo::version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendVersion {
    /// Engine name (e.g. "docker", "containerd").
    pub name: String,
    /// Engine version.
    pub version: String,
    /// Protocol version negotiated or reported.
    pub api_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_latest_tag() {
        let spec = ContainerSpec::builder("nginx").build().unwrap();
        assert_eq!(spec.image().to_string(), "nginx:latest");
        assert_eq!(spec.network(), &NetworkMode::Default);
    }

    #[test]
    fn env_keys_must_be_valid() {
        assert_eq!(
            ContainerSpec::builder("nginx").env("", "x").build(),
            Err(SpecError::EmptyEnvKey)
        );
        assert_eq!(
            ContainerSpec::builder("nginx").env("A=B", "x").build(),
            Err(SpecError::InvalidEnvKey("A=B".to_string()))
        );
    }

    #[test]
    fn later_env_value_wins() {
        let spec = ContainerSpec::builder("nginx")
            .env("MODE", "a")
            .env("MODE", "b")
            .build()
            .unwrap();
        assert_eq!(spec.env().get("MODE").map(String::as_str), Some("b"));
    }

    #[test]
    fn mounts_must_be_absolute_and_distinct() {
        assert!(matches!(
            ContainerSpec::builder("nginx").mount("data", "/data", false).build(),
            Err(SpecError::RelativeMountPath(_))
        ));
        assert!(matches!(
            ContainerSpec::builder("nginx")
                .mount("/a", "/data", false)
                .mount("/b", "/data", true)
                .build(),
            Err(SpecError::DuplicateMountTarget(_))
        ));
    }

    #[test]
    fn rejects_empty_command_and_zero_limits() {
        assert_eq!(
            ContainerSpec::builder("nginx")
                .command(Vec::<String>::new())
                .build(),
            Err(SpecError::EmptyCommand)
        );
        assert_eq!(
            ContainerSpec::builder("nginx").memory_bytes(0).build(),
            Err(SpecError::ZeroLimit("memory limit"))
        );
    }

    #[test]
    fn parses_mount_flags() {
        let mount: Mount = "/srv:/data:ro".parse().unwrap();
        assert!(mount.read_only);
        let mount: Mount = "/srv:/data".parse().unwrap();
        assert!(!mount.read_only);
        assert!("/srv".parse::<Mount>().is_err());
    }

    #[test]
    fn parses_signal_names() {
        assert_eq!("term".parse::<Signal>(), Ok(Signal::Term));
        assert_eq!("SIGKILL".parse::<Signal>(), Ok(Signal::Kill));
        assert_eq!("9".parse::<Signal>(), Ok(Signal::Kill));
        assert!("SIGFOO".parse::<Signal>().is_err());
    }

    #[test]
    fn exec_request_rejects_empty_command() {
        assert!(ExecRequest::from_vec(Vec::new()).is_none());
        let req = ExecRequest::from_vec(vec!["ls".into(), "-l".into()]).unwrap();
        assert_eq!(req.argv(), vec!["ls", "-l"]);
    }
}
