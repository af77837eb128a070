// ABOUTME: Entry point for the berth CLI application.
// ABOUTME: Parses arguments, loads configuration and dispatches to command handlers.

mod cli;

use berth::LifecycleState;
use berth::config::Config;
use berth::error::Result;
use berth::runtime::{
    ContainerError, ContainerSpec, ExecRequest, JsonLogFormat, LogLine, LogOptions, LogStream,
    SpecError, parse_streamed_json_logs,
};
use berth::session::RuntimeSession;
use clap::Parser;
use cli::{Cli, Commands, CopyLocation, RunArgs};
use futures::StreamExt;
use std::env;
use std::io::{IsTerminal, Write};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Logical name given to containers the CLI adopts for exec and logs.
const ADOPTED_NAME: &str = "target";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = load_config(&cli)?;
    match cli.command {
        Commands::Info => info(&config, cli.json).await,
        Commands::Run(args) => run_container(&config, args, cli.json).await,
        Commands::Exec {
            reference,
            timeout,
            workdir,
            detach,
            stream,
            cmd,
        } => {
            config.remove_on_close = false;
            let mut request = ExecRequest::from_vec(cmd)
                .ok_or(ContainerError::InvalidSpec(SpecError::EmptyCommand))?;
            if let Some(timeout) = timeout {
                request = request.with_timeout(timeout);
            }
            if let Some(dir) = workdir {
                request = request.with_working_dir(dir);
            }
            let mode = match (detach, stream) {
                (true, _) => ExecMode::Detached,
                (_, true) => ExecMode::Streamed,
                _ => ExecMode::Buffered,
            };
            exec(&config, &reference, &request, mode, cli.json).await
        }
        Commands::Cp { from, to } => {
            config.remove_on_close = false;
            copy(&config, from, to, cli.json).await
        }
        Commands::Logs {
            reference,
            follow,
            tail,
            timestamps,
            parse_json,
            filters,
            format,
        } => {
            config.remove_on_close = false;
            let opts = LogOptions {
                follow,
                tail,
                timestamps,
                ..LogOptions::default()
            };
            let json_format = parse_json.then(|| {
                let mut json_format = filters
                    .into_iter()
                    .fold(JsonLogFormat::new(), |f, (key, filter)| f.filter(key, filter))
                    .colored(std::io::stdout().is_terminal());
                if let Some(template) = format {
                    json_format = json_format.template(template);
                }
                json_format
            });
            logs(&config, &reference, &opts, json_format, cli.json).await
        }
    }
}

/// Config file, then environment, then command-line flags.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::discover_or_default(&env::current_dir()?)?,
    };
    config.apply_env()?;
    if let Some(kind) = cli.backend {
        config.backend.kind = Some(kind);
    }
    if let Some(endpoint) = &cli.endpoint {
        config.backend.endpoint = Some(endpoint.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn info(config: &Config, json: bool) -> Result<i32> {
    let session = RuntimeSession::open(config).await?;
    let version = session.backend_version().await;
    session.close().await?;
    let version = version?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "driver": session.backend_name(),
                "backend": version,
            })
        );
    } else {
        println!("Driver:      {}", session.backend_name());
        println!("Backend:     {}", version.name);
        println!("Version:     {}", version.version);
        println!("API version: {}", version.api_version);
    }
    Ok(0)
}

async fn run_container(config: &Config, args: RunArgs, json: bool) -> Result<i32> {
    let spec = args.to_spec().map_err(ContainerError::from)?;
    let session = RuntimeSession::open(config).await?;

    if args.replace {
        match session.purge_existing(&args.name).await {
            Ok(0) => {}
            Ok(removed) => info!(name = %args.name, removed, "replaced earlier containers"),
            Err(err) => {
                session.close().await?;
                return Err(err.into());
            }
        }
    }

    let outcome = follow_until_exit(&session, &args, &spec, json).await;

    if args.rm
        && session.resolve(&args.name).is_ok()
        && let Err(err) = session.remove(&args.name, true).await
    {
        warn!(name = %args.name, error = %err, "failed to remove container");
    }
    session.close().await?;

    let state = outcome?;
    if json {
        println!("{}", serde_json::json!({ "name": args.name, "state": state }));
    }
    Ok(exit_code(state))
}

async fn follow_until_exit(
    session: &RuntimeSession,
    args: &RunArgs,
    spec: &ContainerSpec,
    json: bool,
) -> Result<LifecycleState> {
    let name = args.name.as_str();
    session.create(name, spec).await?;
    session.start(name).await?;

    let mut lines = session.logs(name, &LogOptions::follow_all()).await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let interrupted = loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => print_line(&line, false, json),
                Some(Err(err)) => return Err(err.into()),
                None => break false,
            },
            _ = &mut ctrl_c => break true,
        }
    };
    drop(lines);

    if interrupted {
        return Ok(session.stop(name, args.stop_timeout).await?);
    }

    // The log stream ends as the container exits; give the backend a moment
    // to report it before stopping whatever is left.
    for _ in 0..20 {
        let state = session.inspect(name).await?;
        if state.is_exited() {
            return Ok(state);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(session.stop(name, args.stop_timeout).await?)
}

fn exit_code(state: LifecycleState) -> i32 {
    match state {
        LifecycleState::Exited(Some(code)) => i32::try_from(code).unwrap_or(1),
        _ => 0,
    }
}

#[derive(Clone, Copy)]
enum ExecMode {
    Buffered,
    Detached,
    Streamed,
}

async fn exec(
    config: &Config,
    reference: &str,
    request: &ExecRequest,
    mode: ExecMode,
    json: bool,
) -> Result<i32> {
    let session = RuntimeSession::open(config).await?;
    match mode {
        ExecMode::Buffered => {}
        ExecMode::Detached => {
            let started = match session.adopt(ADOPTED_NAME, reference).await {
                Ok(_) => session.exec_detached(ADOPTED_NAME, request).await,
                Err(err) => Err(err),
            };
            session.close().await?;
            started?;
            if json {
                println!("{}", serde_json::json!({ "detached": true }));
            }
            return Ok(0);
        }
        ExecMode::Streamed => {
            let result = stream_exec(&session, reference, request, json).await;
            session.close().await?;
            return result.map(|()| 0);
        }
    }

    let output = match session.adopt(ADOPTED_NAME, reference).await {
        Ok(_) => session.exec(ADOPTED_NAME, request).await,
        Err(err) => Err(err),
    };
    session.close().await?;
    let output = output?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "exit_code": output.exit_code,
                "stdout": output.stdout_lossy(),
                "stderr": output.stderr_lossy(),
            })
        );
    } else {
        std::io::stdout().write_all(&output.stdout)?;
        std::io::stderr().write_all(&output.stderr)?;
    }
    Ok(i32::try_from(output.exit_code).unwrap_or(1))
}

async fn stream_exec(
    session: &RuntimeSession,
    reference: &str,
    request: &ExecRequest,
    json: bool,
) -> Result<()> {
    session.adopt(ADOPTED_NAME, reference).await?;
    let mut lines = session.exec_stream(ADOPTED_NAME, request).await?;
    while let Some(line) = lines.next().await {
        print_line(&line?, false, json);
    }
    Ok(())
}

async fn copy(config: &Config, from: CopyLocation, to: CopyLocation, json: bool) -> Result<i32> {
    let session = RuntimeSession::open(config).await?;
    let result = run_copy(&session, from, to).await;
    session.close().await?;
    let written = result?;

    if json {
        println!("{}", serde_json::json!({ "copied": written }));
    } else {
        for path in written {
            println!("{path}");
        }
    }
    Ok(0)
}

/// Returns the paths written on the destination side.
async fn run_copy(
    session: &RuntimeSession,
    from: CopyLocation,
    to: CopyLocation,
) -> Result<Vec<String>> {
    match (from, to) {
        (CopyLocation::Local(local), CopyLocation::Container { reference, path }) => {
            session.adopt(ADOPTED_NAME, &reference).await?;
            session.copy_to(ADOPTED_NAME, &local, &path).await?;
            let base = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(vec![format!("{}/{base}", path.trim_end_matches('/'))])
        }
        (CopyLocation::Container { reference, path }, CopyLocation::Local(local)) => {
            session.adopt(ADOPTED_NAME, &reference).await?;
            let written = session.copy_from(ADOPTED_NAME, &path, &local).await?;
            Ok(written.iter().map(|p| p.display().to_string()).collect())
        }
        _ => Err(ContainerError::Transfer(
            "exactly one side of a copy must be CONTAINER:PATH".to_string(),
        )
        .into()),
    }
}

async fn logs(
    config: &Config,
    reference: &str,
    opts: &LogOptions,
    json_format: Option<JsonLogFormat>,
    json: bool,
) -> Result<i32> {
    let session = RuntimeSession::open(config).await?;
    let result = print_logs(&session, reference, opts, json_format, json).await;
    session.close().await?;
    result.map(|()| 0)
}

async fn print_logs(
    session: &RuntimeSession,
    reference: &str,
    opts: &LogOptions,
    json_format: Option<JsonLogFormat>,
    json: bool,
) -> Result<()> {
    session.adopt(ADOPTED_NAME, reference).await?;
    let mut lines = session.logs(ADOPTED_NAME, opts).await?;
    if let Some(format) = json_format {
        lines = parse_streamed_json_logs(lines, format);
    }
    while let Some(line) = lines.next().await {
        print_line(&line?, opts.timestamps, json);
    }
    Ok(())
}

fn print_line(line: &LogLine, timestamps: bool, json: bool) {
    if json {
        if let Ok(encoded) = serde_json::to_string(line) {
            println!("{encoded}");
        }
        return;
    }
    let prefix = match (timestamps, line.timestamp) {
        (true, Some(ts)) => format!("{} ", ts.to_rfc3339()),
        _ => String::new(),
    };
    match line.stream {
        LogStream::Stdout => println!("{prefix}{}", line.content),
        LogStream::Stderr => eprintln!("{prefix}{}", line.content),
    }
}
