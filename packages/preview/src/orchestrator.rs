// ABOUTME: Sandbox orchestrator owning the registry of active sandboxes
// ABOUTME: Runs the materialize/install/spawn/probe pipeline with retries and a single teardown queue

use crate::config::SandboxConfig;
use crate::logs::{self, BuildSignal, LogBuffer};
use crate::materializer::ProjectMaterializer;
use crate::ports::PortAllocator;
use crate::probe::ReadinessProbe;
use crate::supervisor::{ExitInfo, ProcessEvent, ProcessHandle, ProcessSupervisor};
use crate::types::{
    Capabilities, GeneratedFile, LogPhase, SandboxError, SandboxInfo, SandboxLog,
    SandboxLogsResponse, SandboxResult, SandboxStatus,
};
use crate::validation::{validate_relative_path, validate_sandbox_id};
use appforge_config::constants;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error lines quoted in a build failure
const ERROR_EXCERPT_LINES: usize = 10;

/// Failure observed while the pipeline is still waiting for readiness
#[derive(Debug, Clone)]
enum PendingFailure {
    Build(String),
    Exited(String),
}

impl PendingFailure {
    fn to_error(&self) -> SandboxError {
        match self {
            PendingFailure::Build(excerpt) => SandboxError::BuildFailed {
                excerpt: excerpt.clone(),
            },
            PendingFailure::Exited(reason) => SandboxError::ProcessCrashed {
                reason: reason.clone(),
            },
        }
    }
}

struct SandboxEntry {
    info: SandboxInfo,
    logs: LogBuffer,
    /// Install or run process, whichever is current
    process: Option<ProcessHandle>,
    failure: Option<PendingFailure>,
}

impl SandboxEntry {
    fn log(&mut self, message: impl Into<String>) {
        self.logs.push(SandboxLog::system(message));
    }

    fn advance(&mut self, next: SandboxStatus, progress: &str) -> bool {
        if !self.info.status.can_advance_to(next) {
            debug!(
                "Ignoring {} -> {} for sandbox {}",
                self.info.status, next, self.info.sandbox_id
            );
            return false;
        }
        self.info.status = next;
        self.info.build_progress = progress.to_string();
        true
    }

    fn fail(&mut self, failure: PendingFailure) {
        if self.advance(SandboxStatus::Failed, "Failed") {
            self.info.error = Some(failure.to_error().to_string());
            self.failure = Some(failure);
        }
    }
}

/// Final record of a sandbox after teardown.
#[derive(Debug, Clone)]
struct FinishedSandbox {
    info: SandboxInfo,
    logs: LogBuffer,
}

#[derive(Debug, Clone)]
enum TeardownReason {
    Stop,
    /// Only applies if the sandbox has not been touched since `cutoff`
    Idle {
        cutoff: DateTime<Utc>,
    },
    AttemptFailed(String),
    Exited(ExitInfo),
}

impl TeardownReason {
    /// Whether the final record stays queryable after teardown
    fn keeps_snapshot(&self) -> bool {
        matches!(
            self,
            TeardownReason::AttemptFailed(_) | TeardownReason::Exited(_)
        )
    }
}

struct TeardownRequest {
    sandbox_id: String,
    /// `None` tears down whichever instance is active
    instance_id: Option<Uuid>,
    reason: TeardownReason,
    done: Option<oneshot::Sender<Option<FinishedSandbox>>>,
}

/// One pipeline attempt for one sandbox instance
#[derive(Debug, Clone)]
struct AttemptKey {
    sandbox_id: String,
    instance_id: Uuid,
    cancelled: Arc<AtomicBool>,
}

impl AttemptKey {
    fn cancelled_error(&self) -> SandboxError {
        SandboxError::Cancelled {
            sandbox_id: self.sandbox_id.clone(),
        }
    }
}

struct Inner {
    config: SandboxConfig,
    root: PathBuf,
    allocator: PortAllocator,
    probe: ReadinessProbe,
    active: RwLock<HashMap<String, SandboxEntry>>,
    /// Final records of sandboxes that failed or exited on their own
    finished: RwLock<HashMap<String, FinishedSandbox>>,
    start_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Cancellation flags of start pipelines in progress
    pipelines: StdMutex<HashMap<String, Arc<AtomicBool>>>,
    teardown_tx: mpsc::UnboundedSender<TeardownRequest>,
}

/// Runs generated projects as supervised local dev servers.
///
/// Cheap to clone; clones share one registry. Must be created inside a Tokio runtime,
/// since construction starts the teardown consumer task.
///
/// # Examples
///
/// ```no_run
/// use appforge_preview::{GeneratedFile, SandboxConfig, SandboxOrchestrator};
///
/// #[tokio::main]
/// async fn main() {
///     let orchestrator = SandboxOrchestrator::new(SandboxConfig::from_env());
///     let files = vec![GeneratedFile::new("app/page.tsx", "export default () => null")];
///
///     match orchestrator.start("s1", files, "Hello App").await {
///         Ok(info) => println!("Sandbox running at {}", info.url),
///         Err(e) => eprintln!("Sandbox failed: {}", e),
///     }
/// }
/// ```
#[derive(Clone)]
pub struct SandboxOrchestrator {
    inner: Arc<Inner>,
}

impl SandboxOrchestrator {
    pub fn new(config: SandboxConfig) -> Self {
        let root = config.root.resolve();
        let allocator = PortAllocator::new(config.port_min, config.port_max, config.max_sandboxes);
        let probe = ReadinessProbe::new(config.probe_interval);
        let (teardown_tx, teardown_rx) = mpsc::unbounded_channel();

        info!(
            "Sandbox orchestrator: root {}, ports {}-{}, max {} sandboxes",
            root.display(),
            config.port_min,
            config.port_max,
            config.max_sandboxes
        );

        let inner = Arc::new(Inner {
            config,
            root,
            allocator,
            probe,
            active: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
            start_locks: StdMutex::new(HashMap::new()),
            pipelines: StdMutex::new(HashMap::new()),
            teardown_tx,
        });

        tokio::spawn(run_teardown_queue(Arc::downgrade(&inner), teardown_rx));

        Self { inner }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    pub fn port_allocator(&self) -> &PortAllocator {
        &self.inner.allocator
    }

    /// Start (or restart) a sandbox and wait until it serves requests.
    ///
    /// Any sandbox already active under `sandbox_id` is torn down first. Calls for the
    /// same id are serialized; calls for different ids run in parallel. The pipeline runs
    /// on its own task, so dropping the returned future does not abandon a half-started
    /// sandbox; it still ends up running or torn down.
    ///
    /// # Errors
    ///
    /// * `InvalidSandboxId` / `InvalidFilePath` - rejected before any side effect
    /// * `CapacityExceeded` / `NoPortsAvailable` - not retried; on a later attempt they are
    ///   wrapped in `RetriesExhausted` to keep the earlier logs
    /// * `Cancelled` - the sandbox was stopped while starting
    /// * `RetriesExhausted` - every attempt failed; carries the log trail of all attempts
    pub async fn start(
        &self,
        sandbox_id: &str,
        files: Vec<GeneratedFile>,
        title: &str,
    ) -> SandboxResult<SandboxInfo> {
        validate_sandbox_id(sandbox_id)?;
        for file in &files {
            validate_relative_path(&file.path)?;
        }

        // The pipeline owns processes and a port; it must finish even if the caller goes away
        let orchestrator = self.clone();
        let id = sandbox_id.to_string();
        let title = title.to_string();
        let pipeline =
            tokio::spawn(async move { orchestrator.start_serialized(&id, files, &title).await });

        match pipeline.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(SandboxError::Cancelled {
                sandbox_id: sandbox_id.to_string(),
            }),
        }
    }

    async fn start_serialized(
        &self,
        sandbox_id: &str,
        files: Vec<GeneratedFile>,
        title: &str,
    ) -> SandboxResult<SandboxInfo> {
        let lock = self.inner.start_lock(sandbox_id);
        let result = {
            let _serialized = lock.lock().await;

            if self.stop(sandbox_id).await {
                info!("Replaced previous instance of sandbox {}", sandbox_id);
            }

            let cancelled = self.inner.register_pipeline(sandbox_id);
            let result = self
                .inner
                .run_pipeline(sandbox_id, &files, title, &cancelled)
                .await;
            self.inner.unregister_pipeline(sandbox_id, &cancelled);
            result
        };
        self.inner.release_start_lock(sandbox_id, lock);

        result
    }

    /// Stop a sandbox and forget it. Returns `true` if an active sandbox was torn down.
    ///
    /// A start still in progress for the id is cancelled.
    pub async fn stop(&self, sandbox_id: &str) -> bool {
        self.inner.cancel_pipeline(sandbox_id);
        self.inner.finished.write().await.remove(sandbox_id);

        let stopped = self
            .inner
            .teardown(sandbox_id, None, TeardownReason::Stop)
            .await
            .is_some();

        if stopped {
            info!("Stopped sandbox {}", sandbox_id);
        } else {
            debug!("No active sandbox {} to stop", sandbox_id);
        }
        stopped
    }

    /// Current record: the active sandbox, else the final record of one that ended
    /// without an explicit stop.
    pub async fn status(&self, sandbox_id: &str) -> Option<SandboxInfo> {
        if let Some(entry) = self.inner.active.read().await.get(sandbox_id) {
            return Some(entry.info.clone());
        }
        self.inner
            .finished
            .read()
            .await
            .get(sandbox_id)
            .map(|f| f.info.clone())
    }

    /// Refresh the activity clock so the idle reaper leaves the sandbox alone.
    pub async fn touch(&self, sandbox_id: &str) -> bool {
        match self.inner.active.write().await.get_mut(sandbox_id) {
            Some(entry) => {
                entry.info.last_access = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn list_active(&self) -> Vec<SandboxInfo> {
        let mut sandboxes: Vec<SandboxInfo> = self
            .inner
            .active
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        sandboxes.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        sandboxes
    }

    /// Logs, status and build progress of a sandbox.
    pub async fn logs(
        &self,
        sandbox_id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Option<SandboxLogsResponse> {
        let respond = |info: &SandboxInfo, logs: &LogBuffer| SandboxLogsResponse {
            logs: logs.query(since, limit),
            status: info.status,
            build_progress: info.build_progress.clone(),
        };

        if let Some(entry) = self.inner.active.read().await.get(sandbox_id) {
            return Some(respond(&entry.info, &entry.logs));
        }
        self.inner
            .finished
            .read()
            .await
            .get(sandbox_id)
            .map(|f| respond(&f.info, &f.logs))
    }

    pub async fn clear_logs(&self, sandbox_id: &str) -> bool {
        if let Some(entry) = self.inner.active.write().await.get_mut(sandbox_id) {
            entry.logs.clear();
            return true;
        }
        match self.inner.finished.write().await.get_mut(sandbox_id) {
            Some(finished) => {
                finished.logs.clear();
                true
            }
            None => false,
        }
    }

    /// Stop every sandbox and cancel every start in progress. Returns how many were stopped.
    pub async fn cleanup_all(&self) -> usize {
        self.inner.cancel_all_pipelines();

        let targets: Vec<(String, Uuid)> = self
            .inner
            .active
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.info.instance_id))
            .collect();

        info!("Stopping {} sandbox(es)", targets.len());

        let stopped = futures::future::join_all(targets.iter().map(|(id, instance)| {
            self.inner
                .teardown(id, Some(*instance), TeardownReason::Stop)
        }))
        .await
        .into_iter()
        .flatten()
        .count();

        self.inner.finished.write().await.clear();
        stopped
    }

    /// Stop every running sandbox idle for longer than the configured timeout.
    ///
    /// Sandboxes still installing or building are never considered idle. Returns the
    /// ids that were stopped.
    pub async fn reap_idle(&self) -> Vec<String> {
        let idle_for = chrono::Duration::from_std(self.inner.config.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let cutoff = Utc::now() - idle_for;

        let candidates: Vec<(String, Uuid)> = self
            .inner
            .active
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.info.status == SandboxStatus::Running && e.info.last_access < cutoff)
            .map(|(id, e)| (id.clone(), e.info.instance_id))
            .collect();

        let mut reaped = Vec::new();
        for (sandbox_id, instance_id) in candidates {
            let outcome = self
                .inner
                .teardown(&sandbox_id, Some(instance_id), TeardownReason::Idle { cutoff })
                .await;
            if outcome.is_some() {
                info!(
                    "Reaped sandbox {} after {}s without activity",
                    sandbox_id,
                    self.inner.config.idle_timeout.as_secs()
                );
                reaped.push(sandbox_id);
            }
        }
        reaped
    }

    /// Whether sandboxes can be materialized on this host.
    pub async fn capabilities(&self) -> Capabilities {
        Capabilities {
            sandboxing_available: is_writable(&self.inner.root).await,
            root: self.inner.root.clone(),
        }
    }
}

impl Inner {
    fn start_lock(&self, sandbox_id: &str) -> Arc<Mutex<()>> {
        lock_std(&self.start_locks)
            .entry(sandbox_id.to_string())
            .or_default()
            .clone()
    }

    fn release_start_lock(&self, sandbox_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = lock_std(&self.start_locks);
        drop(lock);
        if locks
            .get(sandbox_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(sandbox_id);
        }
    }

    fn register_pipeline(&self, sandbox_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        lock_std(&self.pipelines).insert(sandbox_id.to_string(), flag.clone());
        flag
    }

    fn unregister_pipeline(&self, sandbox_id: &str, flag: &Arc<AtomicBool>) {
        let mut pipelines = lock_std(&self.pipelines);
        if pipelines
            .get(sandbox_id)
            .is_some_and(|current| Arc::ptr_eq(current, flag))
        {
            pipelines.remove(sandbox_id);
        }
    }

    fn cancel_pipeline(&self, sandbox_id: &str) {
        if let Some(flag) = lock_std(&self.pipelines).get(sandbox_id) {
            info!("Cancelling start of sandbox {}", sandbox_id);
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn cancel_all_pipelines(&self) {
        for flag in lock_std(&self.pipelines).values() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    async fn run_pipeline(
        self: &Arc<Self>,
        sandbox_id: &str,
        files: &[GeneratedFile],
        title: &str,
        cancelled: &Arc<AtomicBool>,
    ) -> SandboxResult<SandboxInfo> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut trail = LogBuffer::new(self.config.log_capacity);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self
                .run_attempt(sandbox_id, files, title, attempt, cancelled, &mut trail)
                .await
            {
                Ok(info) => {
                    info!(
                        "Sandbox {} running on port {} (attempt {}/{})",
                        sandbox_id, info.port, attempt, max_attempts
                    );
                    return Ok(info);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                warn!("Sandbox {} failed without retry: {}", sandbox_id, err);
                if attempt == 1 || matches!(err, SandboxError::Cancelled { .. }) {
                    return Err(err);
                }
                // Keep what the earlier attempts logged
                return Err(SandboxError::RetriesExhausted {
                    sandbox_id: sandbox_id.to_string(),
                    attempts: attempt,
                    last_error: Box::new(err),
                    logs: trail.render(),
                });
            }

            if attempt >= max_attempts {
                error!(
                    "Sandbox {} failed after {} attempt(s): {}",
                    sandbox_id, attempt, err
                );
                return Err(SandboxError::RetriesExhausted {
                    sandbox_id: sandbox_id.to_string(),
                    attempts: attempt,
                    last_error: Box::new(err),
                    logs: trail.render(),
                });
            }

            warn!(
                "Attempt {}/{} for sandbox {} failed: {}; retrying in {}ms",
                attempt,
                max_attempts,
                sandbox_id,
                err,
                self.config.retry_backoff.as_millis()
            );
            tokio::time::sleep(self.config.retry_backoff).await;
        }
    }

    async fn run_attempt(
        self: &Arc<Self>,
        sandbox_id: &str,
        files: &[GeneratedFile],
        title: &str,
        attempt: u32,
        cancelled: &Arc<AtomicBool>,
        trail: &mut LogBuffer,
    ) -> SandboxResult<SandboxInfo> {
        let key = AttemptKey {
            sandbox_id: sandbox_id.to_string(),
            instance_id: Uuid::new_v4(),
            cancelled: cancelled.clone(),
        };
        if cancelled.load(Ordering::SeqCst) {
            return Err(key.cancelled_error());
        }

        let port = self.allocator.acquire().await?;
        let now = Utc::now();
        let info = SandboxInfo {
            sandbox_id: sandbox_id.to_string(),
            instance_id: key.instance_id,
            title: title.to_string(),
            project_dir: self.root.join(sandbox_id),
            port,
            url: self.config.sandbox_url(port),
            pid: None,
            status: SandboxStatus::Starting,
            attempt,
            started_at: now,
            ended_at: None,
            last_access: now,
            build_progress: "Preparing sandbox".to_string(),
            error: None,
        };

        let mut entry = SandboxEntry {
            info,
            logs: trail.clone(),
            process: None,
            failure: None,
        };
        entry.log(format!(
            "Attempt {}/{}: allocated port {}",
            attempt,
            self.config.max_attempts.max(1),
            port
        ));

        self.active
            .write()
            .await
            .insert(sandbox_id.to_string(), entry);
        self.finished.write().await.remove(sandbox_id);

        let err = match self.run_stages(&key, files, title, port).await {
            Ok(info) => return Ok(info),
            Err(e) => e,
        };

        let outcome = self
            .teardown(
                sandbox_id,
                Some(key.instance_id),
                TeardownReason::AttemptFailed(err.to_string()),
            )
            .await;

        match outcome {
            Some(finished) if !matches!(err, SandboxError::Cancelled { .. }) => {
                *trail = finished.logs;
                Err(err)
            }
            _ => {
                self.finished.write().await.remove(sandbox_id);
                Err(key.cancelled_error())
            }
        }
    }

    async fn run_stages(
        self: &Arc<Self>,
        key: &AttemptKey,
        files: &[GeneratedFile],
        title: &str,
        port: u16,
    ) -> SandboxResult<SandboxInfo> {
        let dir = self.root.join(&key.sandbox_id);

        self.transition(key, SandboxStatus::Starting, "Writing project files")
            .await?;
        let written = ProjectMaterializer::materialize(&dir, files, title).await?;
        self.update(key, |entry| {
            entry.log(format!(
                "Wrote {} files to {}",
                written.len(),
                dir.display()
            ))
        })
        .await?;

        self.transition(key, SandboxStatus::Installing, "Installing dependencies")
            .await?;
        self.run_install(key, &dir).await?;

        self.transition(key, SandboxStatus::Building, "Starting dev server")
            .await?;
        let command = self.config.run_command.replace("{port}", &port.to_string());
        let env = [
            (constants::PORT, port.to_string()),
            (constants::HOSTNAME, "127.0.0.1".to_string()),
            (constants::NEXT_TELEMETRY_DISABLED, "1".to_string()),
        ];
        let (handle, events) = ProcessSupervisor::spawn(&dir, &command, &env)?;
        self.attach(key, &handle, &command).await?;
        tokio::spawn(self.clone().pump_run_events(key.clone(), events));

        let inner: &Inner = self;
        self.probe
            .wait_until_ready(port, self.config.ready_timeout, move || {
                inner.failure_of(key)
            })
            .await?;

        self.mark_running(key).await
    }

    async fn run_install(&self, key: &AttemptKey, dir: &Path) -> SandboxResult<()> {
        let command = self.config.install_command.as_str();
        let env = [(constants::NEXT_TELEMETRY_DISABLED, "1".to_string())];
        let (handle, mut events) = ProcessSupervisor::spawn(dir, command, &env)?;
        self.attach(key, &handle, command).await?;

        let pump = async {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Stdout(line) => {
                        self.record_line(key, LogPhase::Install, false, line).await
                    }
                    ProcessEvent::Stderr(line) => {
                        self.record_line(key, LogPhase::Install, true, line).await
                    }
                    ProcessEvent::Exited(exit) => return exit,
                }
            }
            handle.wait().await
        };

        let exit = match self.config.install_timeout {
            Some(limit) => match tokio::time::timeout(limit, pump).await {
                Ok(exit) => exit,
                Err(_) => {
                    warn!(
                        "Install for sandbox {} exceeded {:?}, terminating",
                        key.sandbox_id, limit
                    );
                    if let Err(e) = ProcessSupervisor::terminate(&handle, self.config.stop_grace).await {
                        warn!("Failed to terminate install process: {}", e);
                    }
                    self.detach(key).await;
                    return Err(SandboxError::InstallFailed {
                        reason: format!("'{}' timed out after {:?}", command, limit),
                    });
                }
            },
            None => pump.await,
        };

        self.detach(key).await;
        self.update(key, |entry| entry.log(format!("'{}' {}", command, exit.describe())))
            .await?;

        if exit.success() {
            Ok(())
        } else {
            Err(SandboxError::InstallFailed {
                reason: format!("'{}' {}", command, exit.describe()),
            })
        }
    }

    async fn pump_run_events(
        self: Arc<Self>,
        key: AttemptKey,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Stdout(line) => self.record_line(&key, LogPhase::Run, false, line).await,
                ProcessEvent::Stderr(line) => self.record_line(&key, LogPhase::Run, true, line).await,
                ProcessEvent::Exited(exit) => {
                    self.on_run_exit(&key, exit).await;
                    break;
                }
            }
        }
    }

    async fn record_line(&self, key: &AttemptKey, phase: LogPhase, stderr: bool, line: String) {
        let mut active = self.active.write().await;
        let entry = match active.get_mut(&key.sandbox_id) {
            Some(entry) if entry.info.instance_id == key.instance_id => entry,
            _ => return,
        };

        let log = logs::classify_line(phase, stderr, line);
        let pre_ready = phase == LogPhase::Run
            && entry.info.status != SandboxStatus::Running
            && !entry.info.status.is_terminal();

        if pre_ready && logs::is_fatal_build_error(&log.message) {
            entry.logs.push(log);
            let excerpt = logs::error_excerpt(
                entry.logs.entries().filter(|l| l.phase == LogPhase::Run),
                ERROR_EXCERPT_LINES,
            );
            warn!("Sandbox {} build failed: {}", key.sandbox_id, excerpt);
            entry.fail(PendingFailure::Build(excerpt));
            return;
        }

        if pre_ready {
            match logs::detect_build_signal(&log.message) {
                Some(BuildSignal::Compiling) => entry.info.build_progress = "Compiling".to_string(),
                Some(BuildSignal::Ready) => entry.info.build_progress = "Ready".to_string(),
                None => {}
            }
        }

        entry.logs.push(log);
    }

    async fn on_run_exit(&self, key: &AttemptKey, exit: ExitInfo) {
        let was_running = {
            let mut active = self.active.write().await;
            let entry = match active.get_mut(&key.sandbox_id) {
                Some(entry) if entry.info.instance_id == key.instance_id => entry,
                _ => return,
            };
            entry.log(format!("Dev server {}", exit.describe()));
            if entry.info.status == SandboxStatus::Running {
                true
            } else {
                entry.fail(PendingFailure::Exited(format!(
                    "dev server {} before it became ready",
                    exit.describe()
                )));
                false
            }
        };

        if was_running {
            info!("Sandbox {} dev server {}", key.sandbox_id, exit.describe());
            self.request_teardown(
                &key.sandbox_id,
                Some(key.instance_id),
                TeardownReason::Exited(exit),
            );
        }
    }

    /// Error to abort readiness polling with, if any
    async fn failure_of(&self, key: &AttemptKey) -> Option<SandboxError> {
        if key.cancelled.load(Ordering::SeqCst) {
            return Some(key.cancelled_error());
        }
        match self.active.read().await.get(&key.sandbox_id) {
            Some(entry) if entry.info.instance_id == key.instance_id => {
                entry.failure.as_ref().map(PendingFailure::to_error)
            }
            _ => Some(key.cancelled_error()),
        }
    }

    async fn update<F>(&self, key: &AttemptKey, apply: F) -> SandboxResult<()>
    where
        F: FnOnce(&mut SandboxEntry),
    {
        let mut active = self.active.write().await;
        apply(live_entry(&mut active, key)?);
        Ok(())
    }

    async fn transition(
        &self,
        key: &AttemptKey,
        next: SandboxStatus,
        progress: &str,
    ) -> SandboxResult<()> {
        let mut active = self.active.write().await;
        let entry = live_entry(&mut active, key)?;
        if let Some(failure) = &entry.failure {
            return Err(failure.to_error());
        }
        if next == entry.info.status {
            entry.info.build_progress = progress.to_string();
        } else {
            entry.advance(next, progress);
        }
        entry.log(progress);
        Ok(())
    }

    async fn attach(&self, key: &AttemptKey, handle: &ProcessHandle, command: &str) -> SandboxResult<()> {
        let attached = {
            let mut active = self.active.write().await;
            match live_entry(&mut active, key) {
                Ok(entry) => {
                    entry.info.pid = Some(handle.pid());
                    entry.process = Some(handle.clone());
                    entry.log(format!("Started '{}' (PID {})", command, handle.pid()));
                    true
                }
                Err(_) => false,
            }
        };

        if attached {
            Ok(())
        } else {
            // Stopped while spawning; nobody else knows about this process
            let _ = ProcessSupervisor::terminate(handle, self.config.stop_grace).await;
            Err(key.cancelled_error())
        }
    }

    async fn detach(&self, key: &AttemptKey) {
        let mut active = self.active.write().await;
        if let Ok(entry) = live_entry(&mut active, key) {
            entry.process = None;
            entry.info.pid = None;
        }
    }

    async fn mark_running(&self, key: &AttemptKey) -> SandboxResult<SandboxInfo> {
        let mut active = self.active.write().await;
        let entry = live_entry(&mut active, key)?;
        if let Some(failure) = &entry.failure {
            return Err(failure.to_error());
        }
        entry.advance(SandboxStatus::Running, "Running");
        entry.info.last_access = Utc::now();
        let message = format!("Sandbox ready at {}", entry.info.url);
        entry.log(message);
        Ok(entry.info.clone())
    }

    /// Queue a teardown and wait for it to finish.
    async fn teardown(
        &self,
        sandbox_id: &str,
        instance_id: Option<Uuid>,
        reason: TeardownReason,
    ) -> Option<FinishedSandbox> {
        let (done_tx, done_rx) = oneshot::channel();
        let request = TeardownRequest {
            sandbox_id: sandbox_id.to_string(),
            instance_id,
            reason,
            done: Some(done_tx),
        };
        if self.teardown_tx.send(request).is_err() {
            error!("Teardown queue closed, cannot stop sandbox {}", sandbox_id);
            return None;
        }
        done_rx.await.ok().flatten()
    }

    fn request_teardown(&self, sandbox_id: &str, instance_id: Option<Uuid>, reason: TeardownReason) {
        let request = TeardownRequest {
            sandbox_id: sandbox_id.to_string(),
            instance_id,
            reason,
            done: None,
        };
        if self.teardown_tx.send(request).is_err() {
            error!("Teardown queue closed, cannot stop sandbox {}", sandbox_id);
        }
    }

    /// Remove the entry named by a teardown request, if it still applies.
    async fn claim(
        &self,
        sandbox_id: &str,
        instance_id: Option<Uuid>,
        reason: &TeardownReason,
    ) -> Option<SandboxEntry> {
        let mut active = self.active.write().await;
        let entry = active.get(sandbox_id)?;

        if instance_id.is_some_and(|id| id != entry.info.instance_id) {
            debug!("Sandbox {} was replaced, skipping teardown", sandbox_id);
            return None;
        }
        if let TeardownReason::Idle { cutoff } = reason {
            if entry.info.status != SandboxStatus::Running || entry.info.last_access >= *cutoff {
                debug!("Sandbox {} became active again, not reaping", sandbox_id);
                return None;
            }
        }

        active.remove(sandbox_id)
    }

    async fn finish_teardown(&self, mut entry: SandboxEntry, reason: TeardownReason) -> FinishedSandbox {
        let sandbox_id = entry.info.sandbox_id.clone();

        if let Some(handle) = entry.process.take() {
            if let Err(e) = ProcessSupervisor::terminate(&handle, self.config.stop_grace).await {
                error!("Failed to terminate sandbox {}: {}", sandbox_id, e);
                entry.log(format!("Failed to terminate process: {}", e));
            }
        }
        self.allocator.release(entry.info.port);
        entry.info.pid = None;
        entry.info.ended_at = Some(Utc::now());

        match &reason {
            TeardownReason::Stop | TeardownReason::Idle { .. } => {
                if !entry.advance(SandboxStatus::Stopped, "Stopped") {
                    entry.advance(SandboxStatus::Failed, "Cancelled");
                    entry.info.error = Some("Stopped before it became ready".to_string());
                }
                let message = match reason {
                    TeardownReason::Idle { .. } => "Stopped after inactivity timeout",
                    _ => "Stopped",
                };
                entry.log(message);
            }
            TeardownReason::AttemptFailed(message) => {
                entry.advance(SandboxStatus::Failed, "Failed");
                entry.info.error = Some(message.clone());
                entry.log(format!("Attempt {} failed: {}", entry.info.attempt, message));
            }
            TeardownReason::Exited(exit) => {
                if exit.success() && entry.advance(SandboxStatus::Stopped, "Stopped") {
                    entry.log("Dev server exited");
                } else {
                    entry.fail(PendingFailure::Exited(exit.describe()));
                    entry.log(format!("Dev server crashed: {}", exit.describe()));
                }
            }
        }

        let finished = FinishedSandbox {
            info: entry.info,
            logs: entry.logs,
        };

        if reason.keeps_snapshot() {
            let active = self.active.read().await;
            if !active.contains_key(&sandbox_id) {
                self.finished
                    .write()
                    .await
                    .insert(sandbox_id.clone(), finished.clone());
            }
        }

        info!(
            "Sandbox {} torn down ({}), port {} released",
            sandbox_id, finished.info.status, finished.info.port
        );
        finished
    }
}

/// Single consumer of teardown requests.
///
/// Removing the registry entry here is what makes teardown happen exactly once; the
/// slow part (signalling and waiting on the process) runs on its own task.
async fn run_teardown_queue(
    orchestrator: Weak<Inner>,
    mut requests: mpsc::UnboundedReceiver<TeardownRequest>,
) {
    while let Some(request) = requests.recv().await {
        let Some(inner) = orchestrator.upgrade() else {
            break;
        };
        let TeardownRequest {
            sandbox_id,
            instance_id,
            reason,
            done,
        } = request;

        match inner.claim(&sandbox_id, instance_id, &reason).await {
            Some(entry) => {
                tokio::spawn(async move {
                    let finished = inner.finish_teardown(entry, reason).await;
                    if let Some(done) = done {
                        let _ = done.send(Some(finished));
                    }
                });
            }
            None => {
                if let Some(done) = done {
                    let _ = done.send(None);
                }
            }
        }
    }
    debug!("Teardown queue closed");
}

fn live_entry<'a>(
    active: &'a mut HashMap<String, SandboxEntry>,
    key: &AttemptKey,
) -> SandboxResult<&'a mut SandboxEntry> {
    if key.cancelled.load(Ordering::SeqCst) {
        return Err(key.cancelled_error());
    }
    match active.get_mut(&key.sandbox_id) {
        Some(entry) if entry.info.instance_id == key.instance_id => Ok(entry),
        _ => Err(key.cancelled_error()),
    }
}

fn lock_std<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn is_writable(root: &Path) -> bool {
    if let Err(e) = tokio::fs::create_dir_all(root).await {
        warn!("Sandbox root {} is not available: {}", root.display(), e);
        return false;
    }
    let marker = root.join(format!(".write-test-{}", Uuid::new_v4().simple()));
    match tokio::fs::write(&marker, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&marker).await;
            true
        }
        Err(e) => {
            warn!("Sandbox root {} is not writable: {}", root.display(), e);
            false
        }
    }
}
