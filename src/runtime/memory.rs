// ABOUTME: In-process backend driver with fault injection.
// ABOUTME: Used by tests and dry runs to exercise the dispatcher without an engine.

use super::error::ContainerError;
use super::logs::split_lines;
use super::traits::sealed::Sealed;
use super::traits::{
    BackendVersion, ContainerOps, ContainerSpec, ExecOps, ExecOutput, ExecRequest, FileOps,
    LogLine, LogLines, LogOps, LogOptions, LogStream, RuntimeInfo, Signal,
};
use crate::state::LifecycleState;
use crate::types::{ContainerId, LogicalName};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How a container reacts to a graceful stop request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopBehavior {
    /// Exit with 143 as a process honouring SIGTERM would.
    #[default]
    Graceful,
    /// Never answer the stop request.
    Hang,
    /// Answer with a backend timeout and keep running.
    TimeOut,
}

#[derive(Debug, Clone)]
struct MemContainer {
    name: String,
    state: LifecycleState,
    labels: BTreeMap<String, String>,
    logs: Vec<LogLine>,
    /// Regular files by absolute path.
    files: BTreeMap<String, Vec<u8>>,
    detached: Vec<Vec<String>>,
}

impl MemContainer {
    fn new(name: &str, state: LifecycleState, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            state,
            labels,
            logs: Vec::new(),
            files: BTreeMap::new(),
            detached: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct MemState {
    containers: HashMap<ContainerId, MemContainer>,
    missing_images: HashSet<String>,
    fail_next: usize,
    exhausted: bool,
    stop_behavior: StopBehavior,
    latency: Duration,
    calls: HashMap<&'static str, usize>,
}

/// A backend that keeps containers in memory.
///
/// Cloning shares the same state, so a test can keep a handle for fault
/// injection after moving the driver into a session.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` backend calls with `BackendUnavailable`.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Make creates of this image fail with `ImageNotFound`.
    pub fn remove_image(&self, image: &str) {
        self.state.lock().missing_images.insert(image.to_string());
    }

    /// Make creates fail with `ResourceExhausted`.
    pub fn exhaust_resources(&self, exhausted: bool) {
        self.state.lock().exhausted = exhausted;
    }

    pub fn set_stop_behavior(&self, behavior: StopBehavior) {
        self.state.lock().stop_behavior = behavior;
    }

    /// Delay every call by `latency` before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Simulate the container's process exiting on its own.
    pub fn exit_out_of_band(&self, id: &ContainerId, code: i64) {
        if let Some(c) = self.state.lock().containers.get_mut(id) {
            c.state = LifecycleState::Exited(Some(code));
        }
    }

    /// Simulate someone deleting the container behind the session's back.
    pub fn delete_out_of_band(&self, id: &ContainerId) {
        self.state.lock().containers.remove(id);
    }

    /// Force a state, bypassing every rule.
    pub fn force_state(&self, id: &ContainerId, state: LifecycleState) {
        if let Some(c) = self.state.lock().containers.get_mut(id) {
            c.state = state;
        }
    }

    /// Add a container that exists before any session sees it.
    pub fn insert_existing(&self, name: &str, state: LifecycleState) -> ContainerId {
        self.insert_labelled(name, state, BTreeMap::new())
    }

    /// Like `insert_existing`, with labels, as a leftover from another run.
    pub fn insert_labelled(
        &self,
        name: &str,
        state: LifecycleState,
        labels: BTreeMap<String, String>,
    ) -> ContainerId {
        let id = new_id();
        self.state
            .lock()
            .containers
            .insert(id.clone(), MemContainer::new(name, state, labels));
        id
    }

    /// Place a file inside a container.
    pub fn write_file(&self, id: &ContainerId, path: &str, content: &[u8]) {
        if let Some(c) = self.state.lock().containers.get_mut(id) {
            c.files.insert(path.to_string(), content.to_vec());
        }
    }

    pub fn read_file(&self, id: &ContainerId, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .containers
            .get(id)
            .and_then(|c| c.files.get(path).cloned())
    }

    /// Command lines started with `exec_detached`, oldest first.
    pub fn detached_execs(&self, id: &ContainerId) -> Vec<Vec<String>> {
        self.state
            .lock()
            .containers
            .get(id)
            .map(|c| c.detached.clone())
            .unwrap_or_default()
    }

    pub fn push_log(&self, id: &ContainerId, stream: LogStream, content: &str) {
        if let Some(c) = self.state.lock().containers.get_mut(id) {
            c.logs.push(LogLine::new(stream, content));
        }
    }

    pub fn state_of(&self, id: &ContainerId) -> Option<LifecycleState> {
        self.state.lock().containers.get(id).map(|c| c.state)
    }

    pub fn labels_of(&self, id: &ContainerId) -> Option<BTreeMap<String, String>> {
        self.state.lock().containers.get(id).map(|c| c.labels.clone())
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    /// Number of times `op` reached the backend (including injected failures).
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Count the call, sleep for the configured latency, then consume an
    /// injected failure if one is pending.
    async fn enter(&self, op: &'static str) -> Result<(), ContainerError> {
        let latency = {
            let mut st = self.state.lock();
            *st.calls.entry(op).or_default() += 1;
            st.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut st = self.state.lock();
        if st.fail_next > 0 {
            st.fail_next -= 1;
            return Err(ContainerError::BackendUnavailable(format!(
                "injected failure during {op}"
            )));
        }
        Ok(())
    }

    fn ensure_running(&self, id: &ContainerId) -> Result<(), ContainerError> {
        let state = self.with_container(id, |c| Ok(c.state))?;
        if state != LifecycleState::Running {
            return Err(not_running(id, state));
        }
        Ok(())
    }

    fn with_container<T>(
        &self,
        id: &ContainerId,
        f: impl FnOnce(&mut MemContainer) -> Result<T, ContainerError>,
    ) -> Result<T, ContainerError> {
        let mut st = self.state.lock();
        let container = st
            .containers
            .get_mut(id)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        f(container)
    }
}

fn new_id() -> ContainerId {
    ContainerId::new(Uuid::new_v4().simple().to_string())
}

fn not_running(id: &ContainerId, state: LifecycleState) -> ContainerError {
    ContainerError::InvalidState(format!("container {} is {state}", id.short()))
}

/// Understands two commands: `sleep SECS` and `exit CODE`. Anything else
/// echoes its arguments to stdout and exits 0.
async fn run_scripted(request: &ExecRequest) -> Result<ExecOutput, ContainerError> {
    let argv = request.argv();
    let arg = argv.get(1).map(String::as_str).unwrap_or("0");
    match argv[0].as_str() {
        "sleep" => {
            let secs: u64 = arg.parse().unwrap_or(0);
            let run = Duration::from_secs(secs);
            match request.timeout {
                Some(limit) if limit < run => {
                    tokio::time::sleep(limit).await;
                    Err(ContainerError::Timeout(format!(
                        "exec exceeded {}s",
                        limit.as_secs()
                    )))
                }
                _ => {
                    tokio::time::sleep(run).await;
                    Ok(ExecOutput::default())
                }
            }
        }
        "exit" => Ok(ExecOutput {
            exit_code: arg.parse().unwrap_or(1),
            stdout: Vec::new(),
            stderr: format!("exit {arg}\n").into_bytes(),
        }),
        _ => Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("{}\n", argv[1..].join(" ")).into_bytes(),
            stderr: Vec::new(),
        }),
    }
}

/// Join a container directory and a relative archive entry path.
fn container_path(dir: &str, entry: &str) -> String {
    let entry = entry.trim_start_matches("./").trim_end_matches('/');
    format!("{}/{entry}", dir.trim_end_matches('/'))
}

fn archive_error(err: std::io::Error) -> ContainerError {
    ContainerError::Transfer(err.to_string())
}

impl Sealed for MemoryDriver {}

#[async_trait]
impl RuntimeInfo for MemoryDriver {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), ContainerError> {
        self.enter("ping").await
    }

    async fn version(&self) -> Result<BackendVersion, ContainerError> {
        self.enter("version").await?;
        Ok(BackendVersion {
            name: "memory".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            api_version: "1".to_string(),
        })
    }
}

#[async_trait]
impl ContainerOps for MemoryDriver {
    async fn create(
        &self,
        name: &LogicalName,
        spec: &ContainerSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<ContainerId, ContainerError> {
        self.enter("create").await?;
        let mut st = self.state.lock();
        let image = spec.image().to_string();
        if st.missing_images.contains(&image) || st.missing_images.contains(&spec.image().name())
        {
            return Err(ContainerError::ImageNotFound(image));
        }
        if st.exhausted {
            return Err(ContainerError::ResourceExhausted(
                "not enough memory to create container".to_string(),
            ));
        }
        let mut all_labels = spec.labels().clone();
        all_labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        let id = new_id();
        st.containers.insert(
            id.clone(),
            MemContainer::new(name.as_str(), LifecycleState::Created, all_labels),
        );
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<(), ContainerError> {
        self.enter("start").await?;
        self.with_container(id, |c| match c.state {
            LifecycleState::Created | LifecycleState::Exited(_) => {
                c.state = LifecycleState::Running;
                Ok(())
            }
            other => Err(not_running(id, other)),
        })
    }

    async fn stop(&self, id: &ContainerId, _timeout: Duration) -> Result<(), ContainerError> {
        self.enter("stop").await?;
        let behavior = self.state.lock().stop_behavior;
        let live = self.with_container(id, |c| Ok(c.state.is_live()))?;
        if !live {
            return Ok(());
        }
        match behavior {
            StopBehavior::Graceful => self.with_container(id, |c| {
                c.state = LifecycleState::Exited(Some(143));
                Ok(())
            }),
            StopBehavior::Hang => std::future::pending().await,
            StopBehavior::TimeOut => Err(ContainerError::Timeout(format!(
                "container {} did not stop",
                id.short()
            ))),
        }
    }

    async fn signal(&self, id: &ContainerId, signal: Signal) -> Result<(), ContainerError> {
        self.enter("signal").await?;
        let behavior = self.state.lock().stop_behavior;
        self.with_container(id, |c| {
            if !c.state.is_live() {
                return Err(not_running(id, c.state));
            }
            match signal {
                Signal::Kill => c.state = LifecycleState::Exited(Some(137)),
                Signal::Term | Signal::Int if behavior == StopBehavior::Graceful => {
                    c.state = LifecycleState::Exited(Some(128 + i64::from(signal.number())));
                }
                _ => {}
            }
            Ok(())
        })
    }

    async fn pause(&self, id: &ContainerId) -> Result<(), ContainerError> {
        self.enter("pause").await?;
        self.with_container(id, |c| match c.state {
            LifecycleState::Running => {
                c.state = LifecycleState::Paused;
                Ok(())
            }
            other => Err(not_running(id, other)),
        })
    }

    async fn unpause(&self, id: &ContainerId) -> Result<(), ContainerError> {
        self.enter("unpause").await?;
        self.with_container(id, |c| match c.state {
            LifecycleState::Paused => {
                c.state = LifecycleState::Running;
                Ok(())
            }
            other => Err(not_running(id, other)),
        })
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<(), ContainerError> {
        self.enter("remove").await?;
        let mut st = self.state.lock();
        let state = st
            .containers
            .get(id)
            .map(|c| c.state)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        if state.is_live() && !force {
            return Err(ContainerError::InvalidState(format!(
                "cannot remove {} container {}",
                state,
                id.short()
            )));
        }
        st.containers.remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &ContainerId) -> Result<LifecycleState, ContainerError> {
        self.enter("inspect").await?;
        self.with_container(id, |c| Ok(c.state))
    }

    async fn lookup(&self, reference: &str) -> Result<ContainerId, ContainerError> {
        self.enter("lookup").await?;
        let st = self.state.lock();
        let by_id = st.containers.keys().find(|id| id.as_str() == reference);
        if let Some(id) = by_id {
            return Ok(id.clone());
        }
        let matches: Vec<&ContainerId> = st
            .containers
            .iter()
            .filter(|(_, c)| c.name == reference)
            .map(|(id, _)| id)
            .collect();
        match matches.as_slice() {
            [] => Err(ContainerError::NotFound(reference.to_string())),
            [id] => Ok((*id).clone()),
            _ => Err(ContainerError::InvalidState(format!(
                "{} containers match '{reference}'",
                matches.len()
            ))),
        }
    }

    async fn list_labelled(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerId>, ContainerError> {
        self.enter("list").await?;
        let st = self.state.lock();
        Ok(st
            .containers
            .iter()
            .filter(|(_, c)| labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[async_trait]
impl ExecOps for MemoryDriver {
    async fn exec(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ContainerError> {
        self.enter("exec").await?;
        self.ensure_running(container)?;
        run_scripted(request).await
    }

    async fn exec_detached(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<(), ContainerError> {
        self.enter("exec_detached").await?;
        self.ensure_running(container)?;
        self.with_container(container, |c| {
            c.detached.push(request.argv());
            Ok(())
        })
    }

    async fn exec_stream(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<LogLines, ContainerError> {
        self.enter("exec_stream").await?;
        self.ensure_running(container)?;
        let output = run_scripted(request).await?;
        let chunks = stream::iter([
            Ok((LogStream::Stdout, Bytes::from(output.stdout))),
            Ok((LogStream::Stderr, Bytes::from(output.stderr))),
        ]);
        Ok(split_lines(chunks, false))
    }
}

#[async_trait]
impl FileOps for MemoryDriver {
    async fn upload_archive(
        &self,
        id: &ContainerId,
        dest_dir: &str,
        archive: Bytes,
    ) -> Result<(), ContainerError> {
        self.enter("upload").await?;
        let mut files = Vec::new();
        let mut reader = tar::Archive::new(archive.as_ref());
        for entry in reader.entries().map_err(archive_error)? {
            let mut entry = entry.map_err(archive_error)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = container_path(
                dest_dir,
                &entry.path().map_err(archive_error)?.to_string_lossy(),
            );
            let mut content = Vec::new();
            entry.read_to_end(&mut content).map_err(archive_error)?;
            files.push((path, content));
        }
        self.with_container(id, |c| {
            c.files.extend(files);
            Ok(())
        })
    }

    async fn download_archive(&self, id: &ContainerId, path: &str) -> Result<Bytes, ContainerError> {
        self.enter("download").await?;
        let path = path.trim_end_matches('/');
        let prefix = format!("{path}/");
        let found: Vec<(String, Vec<u8>)> = self.with_container(id, |c| {
            Ok(c.files
                .iter()
                .filter(|(p, _)| p.as_str() == path || p.starts_with(&prefix))
                .map(|(p, content)| (p.clone(), content.clone()))
                .collect())
        })?;
        if found.is_empty() {
            return Err(ContainerError::NotFound(format!("{path} in {}", id.short())));
        }

        let parent = path.rfind('/').map_or(0, |i| i + 1);
        let mut builder = tar::Builder::new(Vec::new());
        for (file, content) in found {
            let mut header = tar::Header::new_gnu();
            header.set_size(u64::try_from(content.len()).unwrap_or(u64::MAX));
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, &file[parent..], content.as_slice())
                .map_err(archive_error)?;
        }
        let bytes = builder.into_inner().map_err(archive_error)?;
        Ok(Bytes::from(bytes))
    }
}

#[async_trait]
impl LogOps for MemoryDriver {
    async fn stream_logs(
        &self,
        id: &ContainerId,
        opts: &LogOptions,
    ) -> Result<LogLines, ContainerError> {
        self.enter("logs").await?;
        let mut lines: Vec<LogLine> = self.with_container(id, |c| Ok(c.logs.clone()))?;
        lines.retain(|l| opts.wants(l.stream));
        if let Some(n) = opts.tail {
            let keep = usize::try_from(n).unwrap_or(usize::MAX);
            let skip = lines.len().saturating_sub(keep);
            lines.drain(..skip);
        }
        Ok(Box::pin(stream::iter(lines.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec::builder("alpine:3.19").build().unwrap()
    }

    fn name(s: &str) -> LogicalName {
        LogicalName::new(s).unwrap()
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let driver = MemoryDriver::new();
        driver.fail_next(1);
        let err = driver.ping().await.unwrap_err();
        assert!(err.is_transient());
        driver.ping().await.unwrap();
        assert_eq!(driver.calls("ping"), 2);
    }

    #[tokio::test]
    async fn missing_image_fails_create() {
        let driver = MemoryDriver::new();
        driver.remove_image("alpine");
        let err = driver
            .create(&name("web"), &spec(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn lookup_by_name_and_id() {
        let driver = MemoryDriver::new();
        let id = driver.insert_existing("legacy", LifecycleState::Running);
        assert_eq!(driver.lookup("legacy").await.unwrap(), id);
        assert_eq!(driver.lookup(id.as_str()).await.unwrap(), id);
        assert!(matches!(
            driver.lookup("other").await,
            Err(ContainerError::NotFound(_))
        ));
        driver.insert_existing("legacy", LifecycleState::Created);
        assert!(matches!(
            driver.lookup("legacy").await,
            Err(ContainerError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn exec_echo_and_exit() {
        let driver = MemoryDriver::new();
        let id = driver.insert_existing("box", LifecycleState::Running);
        let req = ExecRequest::from_vec(vec!["echo".into(), "hi".into()]).unwrap();
        let out = driver.exec(&id, &req).await.unwrap();
        assert_eq!(out.stdout_lossy(), "hi\n");

        let req = ExecRequest::from_vec(vec!["exit".into(), "3".into()]).unwrap();
        assert_eq!(driver.exec(&id, &req).await.unwrap().exit_code, 3);
    }

    #[tokio::test]
    async fn uploaded_files_download_under_their_base_name() {
        let driver = MemoryDriver::new();
        let id = driver.insert_existing("box", LifecycleState::Running);

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "conf/app.ini", &b"a = 1"[..]).unwrap();
        let archive = Bytes::from(builder.into_inner().unwrap());

        driver.upload_archive(&id, "/etc/", archive).await.unwrap();
        assert_eq!(driver.read_file(&id, "/etc/conf/app.ini").unwrap(), b"a = 1");

        let packed = driver.download_archive(&id, "/etc/conf").await.unwrap();
        let mut reader = tar::Archive::new(packed.as_ref());
        let names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["conf/app.ini"]);

        assert!(matches!(
            driver.download_archive(&id, "/nope").await,
            Err(ContainerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_matches_every_label() {
        let driver = MemoryDriver::new();
        let web = BTreeMap::from([
            ("berth.name".to_string(), "web".to_string()),
            ("team".to_string(), "infra".to_string()),
        ]);
        let id = driver.insert_labelled("a", LifecycleState::Running, web.clone());
        driver.insert_labelled(
            "b",
            LifecycleState::Running,
            BTreeMap::from([("berth.name".to_string(), "web".to_string())]),
        );

        assert_eq!(driver.list_labelled(&web).await.unwrap(), vec![id]);
        let by_name = BTreeMap::from([("berth.name".to_string(), "web".to_string())]);
        assert_eq!(driver.list_labelled(&by_name).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn detached_exec_needs_a_running_container() {
        let driver = MemoryDriver::new();
        let id = driver.insert_existing("box", LifecycleState::Created);
        let req = ExecRequest::from_vec(vec!["touch".into(), "/ready".into()]).unwrap();
        assert!(matches!(
            driver.exec_detached(&id, &req).await,
            Err(ContainerError::InvalidState(_))
        ));

        driver.force_state(&id, LifecycleState::Running);
        driver.exec_detached(&id, &req).await.unwrap();
        assert_eq!(driver.detached_execs(&id), vec![vec!["touch", "/ready"]]);
    }

    #[tokio::test]
    async fn create_merges_session_labels() {
        let driver = MemoryDriver::new();
        let spec = ContainerSpec::builder("alpine").label("app", "web").build().unwrap();
        let labels = BTreeMap::from([("berth.managed".to_string(), "true".to_string())]);
        let id = driver.create(&name("web"), &spec, &labels).await.unwrap();
        let stored = driver.labels_of(&id).unwrap();
        assert_eq!(stored.get("app").map(String::as_str), Some("web"));
        assert_eq!(stored.get("berth.managed").map(String::as_str), Some("true"));
    }
}
