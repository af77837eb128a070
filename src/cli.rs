// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use berth::runtime::{BackendKind, ContainerSpec, LogFilter, Mount, NetworkMode, SpecError};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "Run and manage containers on Docker or any CRI runtime")]
#[command(version)]
pub struct Cli {
    /// Config file (default: berth.yml discovered in the current directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend to use: docker or cri (default: auto-detect)
    #[arg(long, global = true)]
    pub backend: Option<BackendKind>,

    /// Backend endpoint, e.g. unix:///var/run/docker.sock or tcp://host:2375
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to the backend and print its name and version
    Info,

    /// Create and start a container, following its output until it exits
    Run(RunArgs),

    /// Run a command in an existing container
    Exec {
        /// Container id or name on the backend
        reference: String,

        /// Kill the command after this long (e.g. 30s)
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Working directory inside the container
        #[arg(short, long)]
        workdir: Option<String>,

        /// Start the command and return without waiting for it
        #[arg(short, long, conflicts_with = "stream")]
        detach: bool,

        /// Print output as it is produced instead of when the command ends
        #[arg(long)]
        stream: bool,

        /// Command and arguments
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },

    /// Copy files between the host and a container.
    /// One side is CONTAINER:PATH, the other a local path
    Cp {
        /// Source: local path or CONTAINER:PATH
        from: CopyLocation,

        /// Destination directory: local path or CONTAINER:PATH
        to: CopyLocation,
    },

    /// Print the output of an existing container
    Logs {
        /// Container id or name on the backend
        reference: String,

        /// Keep streaming new output
        #[arg(short, long)]
        follow: bool,

        /// Only show the last N lines
        #[arg(long)]
        tail: Option<u64>,

        /// Prefix lines with their timestamp
        #[arg(short, long)]
        timestamps: bool,

        /// Treat each line as a JSON record and pretty-print it
        #[arg(long)]
        parse_json: bool,

        /// Keep JSON records where KEY matches VALUE (repeatable).
        /// VALUE may be a glob, <N, >=N or NOT VALUE
        #[arg(long = "filter", value_parser = parse_filter, requires = "parse_json")]
        filters: Vec<(String, LogFilter)>,

        /// Render JSON records through a template such as "{levelname}: {message}"
        #[arg(long, requires = "parse_json")]
        format: Option<String>,
    },
}

/// One side of a `cp`.
#[derive(Debug, Clone, PartialEq)]
pub enum CopyLocation {
    Local(PathBuf),
    Container { reference: String, path: String },
}

impl std::str::FromStr for CopyLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((reference, path)) if !reference.is_empty() && !reference.contains('/') => {
                if path.is_empty() {
                    return Err(format!("missing path after '{reference}:'"));
                }
                Ok(Self::Container {
                    reference: reference.to_string(),
                    path: path.to_string(),
                })
            }
            _ => Ok(Self::Local(PathBuf::from(s))),
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Logical name for the container
    pub name: String,

    /// Image reference, e.g. nginx:1.27
    pub image: String,

    /// Environment variable KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Bind mount HOST:CONTAINER[:ro] (repeatable)
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<Mount>,

    /// Memory limit in bytes
    #[arg(long)]
    pub memory: Option<u64>,

    /// Relative CPU weight
    #[arg(long)]
    pub cpu_shares: Option<u64>,

    /// Network mode: default, host, none or a network name
    #[arg(long)]
    pub network: Option<NetworkMode>,

    /// Working directory inside the container
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Graceful stop timeout on Ctrl-C (e.g. 10s)
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    pub stop_timeout: Option<Duration>,

    /// Remove the container once it has exited
    #[arg(long)]
    pub rm: bool,

    /// Remove containers left over from earlier runs under the same name
    #[arg(long)]
    pub replace: bool,

    /// Override the image's entrypoint
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Arguments passed to the entrypoint, replacing the image's default command
    #[arg(last = true)]
    pub cmd: Vec<String>,
}

impl RunArgs {
    /// Trailing words become arguments, as with `docker run IMAGE CMD...`.
    pub fn to_spec(&self) -> Result<ContainerSpec, SpecError> {
        let mut builder = ContainerSpec::builder(&self.image);
        if let Some(entrypoint) = &self.entrypoint {
            builder = builder.command([entrypoint.as_str()]);
        }
        if !self.cmd.is_empty() {
            builder = builder.args(self.cmd.iter().cloned());
        }
        for (key, value) in &self.env {
            builder = builder.env(key, value);
        }
        for mount in &self.volumes {
            builder = builder.mount(
                mount.host_path.clone(),
                mount.container_path.clone(),
                mount.read_only,
            );
        }
        if let Some(bytes) = self.memory {
            builder = builder.memory_bytes(bytes);
        }
        if let Some(shares) = self.cpu_shares {
            builder = builder.cpu_shares(shares);
        }
        if let Some(network) = &self.network {
            builder = builder.network(network.clone());
        }
        if let Some(dir) = &self.workdir {
            builder = builder.working_dir(dir);
        }
        builder.build()
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

fn parse_filter(s: &str) -> Result<(String, LogFilter), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let filter = value.parse().map_err(|e| format!("invalid filter '{value}': {e}"))?;
    Ok((key.to_string(), filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "berth", "run", "web", "nginx", "-e", "A=1", "-v", "/data:/srv:ro", "--rm", "--",
            "nginx", "-g", "daemon off;",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.env, vec![("A".to_string(), "1".to_string())]);
        assert!(args.volumes[0].read_only);
        assert_eq!(args.cmd, ["nginx", "-g", "daemon off;"]);
        assert!(args.rm);
    }

    #[test]
    fn trailing_words_are_arguments_not_entrypoint() {
        let cli = Cli::try_parse_from(["berth", "run", "box", "alpine", "--", "echo", "hi"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let spec = args.to_spec().unwrap();
        assert_eq!(spec.command(), None);
        assert_eq!(spec.args(), ["echo", "hi"]);

        let cli = Cli::try_parse_from([
            "berth", "run", "box", "alpine", "--entrypoint", "/bin/sh", "--", "-c", "true",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let spec = args.to_spec().unwrap();
        assert_eq!(spec.command(), Some(["/bin/sh".to_string()].as_slice()));
        assert_eq!(spec.args(), ["-c", "true"]);
    }

    #[test]
    fn cp_sides_are_told_apart() {
        let cli = Cli::try_parse_from(["berth", "cp", "./site", "web:/srv"]).unwrap();
        let Commands::Cp { from, to } = cli.command else {
            panic!("expected cp");
        };
        assert_eq!(from, CopyLocation::Local(PathBuf::from("./site")));
        assert_eq!(
            to,
            CopyLocation::Container {
                reference: "web".to_string(),
                path: "/srv".to_string(),
            }
        );

        assert!(Cli::try_parse_from(["berth", "cp", "web:", "/tmp"]).is_err());
    }

    #[test]
    fn log_filters_need_json_parsing() {
        assert!(Cli::try_parse_from(["berth", "logs", "web", "--filter", "levelname=ERROR"]).is_err());

        let cli = Cli::try_parse_from([
            "berth", "logs", "web", "--parse-json", "--filter", "status=>=500", "--filter",
            "path=/api/*",
        ])
        .unwrap();
        let Commands::Logs { filters, .. } = cli.command else {
            panic!("expected logs");
        };
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].0, "status");
        assert!(filters[0].1.matches(&serde_json::json!(503)));
        assert!(filters[1].1.matches(&serde_json::json!("/api/users")));
    }

    #[test]
    fn exec_detach_and_stream_conflict() {
        assert!(
            Cli::try_parse_from(["berth", "exec", "web", "-d", "--stream", "--", "true"]).is_err()
        );
    }

    #[test]
    fn backend_flag_accepts_aliases() {
        let cli = Cli::try_parse_from(["berth", "--backend", "containerd", "info"]).unwrap();
        assert_eq!(cli.backend, Some(BackendKind::Cri));
    }
}
