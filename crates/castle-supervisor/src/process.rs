//! Long-running daemon supervision

use crate::exec::{CommandExecutor, Executor, command_line};
use crate::scan;
use async_trait::async_trait;
use castle_common::{Error, Result};
use dashmap::DashMap;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_RESTARTS: u32 = 5;
const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What `start` does when a matching process is already running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    /// Adopt the running process instead of spawning a duplicate
    ReuseExisting,
    /// Terminate matching processes, then spawn a fresh one
    ReplaceExisting,
}

/// Opaque handle to a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub id: String,
    pub pid: u32,
    /// True if the process was found running rather than spawned by us
    pub adopted: bool,
}

/// Starts, adopts and stops daemons by a stable id
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Start (or adopt) a daemon. `pattern` is a regex matched against the
    /// full space-joined argv of running processes.
    async fn start(
        &self,
        id: &str,
        binary: &str,
        pattern: &str,
        policy: StartPolicy,
        args: &[String],
    ) -> Result<ProcessHandle>;

    /// Stop a daemon; unknown ids are not an error
    async fn stop(&self, id: &str) -> Result<()>;

    /// Run a one-shot command to completion
    async fn run(&self, id: &str, binary: &str, args: &[String]) -> Result<()>;

    /// Run a one-shot command and return its stdout
    async fn run_with_output(&self, id: &str, binary: &str, args: &[String]) -> Result<String>;

    /// True if a daemon with this id is tracked and alive
    fn is_running(&self, id: &str) -> bool;

    /// Stop every tracked daemon
    async fn stop_all(&self);
}

/// Send `sig` to `pid` (`None` probes for existence)
pub(crate) fn send_signal(pid: u32, sig: Option<Signal>) -> bool {
    // pid 0 would address our whole process group
    if pid == 0 {
        return false;
    }
    i32::try_from(pid).is_ok_and(|pid| kill(Pid::from_raw(pid), sig).is_ok())
}

fn is_alive(pid: u32) -> bool {
    send_signal(pid, None)
}

struct Managed {
    pid: AtomicU32,
    stopping: AtomicBool,
    adopted: bool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Managed {
    fn handle(&self, id: &str) -> ProcessHandle {
        ProcessHandle {
            id: id.to_string(),
            pid: self.pid.load(Ordering::SeqCst),
            adopted: self.adopted,
        }
    }
}

/// [`Supervisor`] for local processes
///
/// Spawned daemons are watched by a monitor task that restarts them after
/// unexpected exits, up to a bounded number of attempts. Their stdout and
/// stderr are forwarded to `tracing`.
pub struct ProcessManager {
    procs: Arc<DashMap<String, Arc<Managed>>>,
    executor: CommandExecutor,
    proc_root: PathBuf,
    grace: Duration,
    max_restarts: u32,
    restart_delay: Duration,
}

impl ProcessManager {
    /// Create a manager that waits `grace` between SIGTERM and SIGKILL
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            procs: Arc::new(DashMap::new()),
            executor: CommandExecutor::new(),
            proc_root: PathBuf::from("/proc"),
            grace,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }

    /// Scan a different procfs root for running processes
    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    #[must_use]
    pub const fn with_restart_policy(mut self, max_restarts: u32, delay: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.restart_delay = delay;
        self
    }

    fn spawn_child(id: &str, binary: &str, args: &[String]) -> Result<Child> {
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::external(format!(
                    "failed to start {id} ({}): {e}",
                    command_line(binary, args)
                ))
            })?;
        forward_output(id, child.stdout.take(), "stdout");
        forward_output(id, child.stderr.take(), "stderr");
        Ok(child)
    }

    /// Terminate a process, escalating to SIGKILL after the grace window
    async fn terminate(&self, id: &str, pid: u32, monitor: Option<JoinHandle<()>>) {
        debug!("Sending SIGTERM to '{}' (pid {})", id, pid);
        send_signal(pid, Some(Signal::SIGTERM));

        if let Some(mut monitor) = monitor {
            if tokio::time::timeout(self.grace, &mut monitor).await.is_err() {
                warn!("Process '{}' ignored SIGTERM, killing pid {}", id, pid);
                send_signal(pid, Some(Signal::SIGKILL));
                let _ = monitor.await;
            }
            return;
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        while is_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                warn!("Process '{}' ignored SIGTERM, killing pid {}", id, pid);
                send_signal(pid, Some(Signal::SIGKILL));
                return;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

fn forward_output<R>(id: &str, pipe: Option<R>, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else {
        return;
    };
    let id = id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(process = %id, stream, "{}", line);
        }
    });
}

struct RestartPolicy {
    max_restarts: u32,
    delay: Duration,
}

async fn monitor(
    id: String,
    binary: String,
    args: Vec<String>,
    mut child: Child,
    managed: Arc<Managed>,
    procs: Arc<DashMap<String, Arc<Managed>>>,
    policy: RestartPolicy,
) {
    let mut restarts = 0;
    loop {
        let status = child.wait().await;
        if managed.stopping.load(Ordering::SeqCst) {
            break;
        }
        match status {
            Ok(status) => warn!("Process '{}' exited unexpectedly: {}", id, status),
            Err(e) => warn!("Failed to wait for process '{}': {}", id, e),
        }
        if restarts >= policy.max_restarts {
            error!(
                "Process '{}' exited {} times, giving up",
                id,
                restarts + 1
            );
            break;
        }
        restarts += 1;
        tokio::time::sleep(policy.delay).await;
        if managed.stopping.load(Ordering::SeqCst) {
            break;
        }
        match ProcessManager::spawn_child(&id, &binary, &args) {
            Ok(next) => {
                let pid = next.id().unwrap_or(0);
                info!("Restarted process '{}' as pid {} (attempt {})", id, pid, restarts);
                managed.pid.store(pid, Ordering::SeqCst);
                child = next;
            }
            Err(e) => {
                error!("Failed to restart process '{}': {}", id, e);
                break;
            }
        }
    }
    procs.remove_if(&id, |_, m| Arc::ptr_eq(m, &managed));
}

#[async_trait]
impl Supervisor for ProcessManager {
    async fn start(
        &self,
        id: &str,
        binary: &str,
        pattern: &str,
        policy: StartPolicy,
        args: &[String],
    ) -> Result<ProcessHandle> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::invalid_input(format!("bad process pattern '{pattern}': {e}")))?;

        let existing = self.procs.get(id).map(|e| Arc::clone(e.value()));
        if let Some(existing) = existing {
            if policy == StartPolicy::ReuseExisting
                && is_alive(existing.pid.load(Ordering::SeqCst))
            {
                debug!("Process '{}' already running", id);
                return Ok(existing.handle(id));
            }
            self.stop(id).await?;
        }

        let found = scan::find_matching(&self.proc_root, &regex);
        match policy {
            StartPolicy::ReuseExisting => {
                if let Some(&pid) = found.first() {
                    info!("Adopting running process '{}' (pid {})", id, pid);
                    let managed = Arc::new(Managed {
                        pid: AtomicU32::new(pid),
                        stopping: AtomicBool::new(false),
                        adopted: true,
                        monitor: Mutex::new(None),
                    });
                    self.procs.insert(id.to_string(), Arc::clone(&managed));
                    return Ok(managed.handle(id));
                }
            }
            StartPolicy::ReplaceExisting => {
                for pid in found {
                    info!("Replacing running process '{}' (pid {})", id, pid);
                    self.terminate(id, pid, None).await;
                }
            }
        }

        let child = Self::spawn_child(id, binary, args)?;
        let pid = child.id().unwrap_or(0);
        info!("Started process '{}' (pid {}): {}", id, pid, command_line(binary, args));

        let managed = Arc::new(Managed {
            pid: AtomicU32::new(pid),
            stopping: AtomicBool::new(false),
            adopted: false,
            monitor: Mutex::new(None),
        });
        self.procs.insert(id.to_string(), Arc::clone(&managed));
        let task = tokio::spawn(monitor(
            id.to_string(),
            binary.to_string(),
            args.to_vec(),
            child,
            Arc::clone(&managed),
            Arc::clone(&self.procs),
            RestartPolicy {
                max_restarts: self.max_restarts,
                delay: self.restart_delay,
            },
        ));
        *managed.monitor.lock() = Some(task);
        Ok(managed.handle(id))
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let Some((_, managed)) = self.procs.remove(id) else {
            debug!("Process '{}' is not running", id);
            return Ok(());
        };
        managed.stopping.store(true, Ordering::SeqCst);
        let pid = managed.pid.load(Ordering::SeqCst);
        let task = managed.monitor.lock().take();
        self.terminate(id, pid, task).await;
        info!("Stopped process '{}' (pid {})", id, pid);
        Ok(())
    }

    async fn run(&self, id: &str, binary: &str, args: &[String]) -> Result<()> {
        self.executor.execute(id, binary, args).await?;
        Ok(())
    }

    async fn run_with_output(&self, id: &str, binary: &str, args: &[String]) -> Result<String> {
        Ok(self.executor.execute_with_output(id, binary, args).await?)
    }

    fn is_running(&self, id: &str) -> bool {
        self.procs
            .get(id)
            .is_some_and(|m| is_alive(m.pid.load(Ordering::SeqCst)))
    }

    async fn stop_all(&self) {
        let ids: Vec<String> = self.procs.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!("Failed to stop process '{}': {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::args;

    fn manager(root: &std::path::Path) -> ProcessManager {
        ProcessManager::new(Duration::from_secs(2))
            .with_proc_root(root)
            .with_restart_policy(2, Duration::from_millis(10))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_and_stop() {
        let root = tempfile::tempdir().unwrap();
        let pm = manager(root.path());
        let handle = pm
            .start("sleeper", "sleep", "castle-test-sleeper", StartPolicy::ReuseExisting, &args(["30"]))
            .await
            .unwrap();
        assert!(!handle.adopted);
        assert!(pm.is_running("sleeper"));

        // A second start reuses the tracked process
        let again = pm
            .start("sleeper", "sleep", "castle-test-sleeper", StartPolicy::ReuseExisting, &args(["30"]))
            .await
            .unwrap();
        assert_eq!(again.pid, handle.pid);

        pm.stop("sleeper").await.unwrap();
        assert!(!pm.is_running("sleeper"));
        pm.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn test_adopts_matching_process() {
        let root = tempfile::tempdir().unwrap();
        // A pid far beyond pid_max so no signal ever reaches a real process
        let dir = root.path().join("2000000000");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("cmdline"),
            b"ceph-osd\0--foreground\0--osd-uuid=1234\0",
        )
        .unwrap();

        let pm = manager(root.path());
        let pattern = regex::escape("--osd-uuid=1234");
        let handle = pm
            .start("osd3", "ceph-osd", &pattern, StartPolicy::ReuseExisting, &[])
            .await
            .unwrap();
        assert!(handle.adopted);
        assert_eq!(handle.pid, 2_000_000_000);
    }

    #[tokio::test]
    async fn test_bad_pattern() {
        let root = tempfile::tempdir().unwrap();
        let pm = manager(root.path());
        let err = pm
            .start("x", "true", "(", StartPolicy::ReuseExisting, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_gives_up_after_restarts() {
        let root = tempfile::tempdir().unwrap();
        let pm = manager(root.path());
        pm.start("flaky", "true", "castle-test-flaky", StartPolicy::ReuseExisting, &[])
            .await
            .unwrap();
        let mut gone = false;
        for _ in 0..100 {
            if !pm.procs.contains_key("flaky") {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone);
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let root = tempfile::tempdir().unwrap();
        let pm = manager(root.path());
        pm.run("ok", "true", &[]).await.unwrap();
        let err = pm.run("bad", "false", &[]).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        let out = pm.run_with_output("echo", "echo", &args(["hi"])).await.unwrap();
        assert_eq!(out.trim(), "hi");
    }
}
