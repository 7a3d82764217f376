//! Test doubles for code that runs helpers and daemons

use crate::exec::{ExecError, ExecResult, Executor, command_line};
use crate::process::{ProcessHandle, StartPolicy, Supervisor};
use async_trait::async_trait;
use castle_common::Result;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Clone)]
enum Reply {
    Output(String),
    Fail { code: i32, stderr: String },
}

/// Canned replies keyed by a substring of the command line.
/// The most recently added matching rule wins.
#[derive(Default)]
struct Script {
    rules: Vec<(String, Reply)>,
}

impl Script {
    fn reply(&self, line: &str) -> Option<Reply> {
        self.rules
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
    }
}

fn answer(script: &Script, action: &str, line: &str) -> ExecResult<String> {
    match script.reply(line) {
        None => Ok(String::new()),
        Some(Reply::Output(out)) => Ok(out),
        Some(Reply::Fail { code, stderr }) => Err(ExecError::failed(action, line, Some(code), stderr)),
    }
}

/// [`Executor`] that records every command line and replays scripted output
#[derive(Default)]
pub struct MockExecutor {
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
}

impl MockExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `output` to commands whose line contains `pattern`
    pub fn on(&self, pattern: &str, output: &str) {
        self.script
            .lock()
            .rules
            .push((pattern.to_string(), Reply::Output(output.to_string())));
    }

    /// Fail commands whose line contains `pattern`
    pub fn fail_on(&self, pattern: &str, code: i32, stderr: &str) {
        self.script.lock().rules.push((
            pattern.to_string(),
            Reply::Fail {
                code,
                stderr: stderr.to_string(),
            },
        ));
    }

    /// Every command line run so far
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Command lines containing `pattern`
    #[must_use]
    pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.contains(pattern))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, action: &str, cmd: &str, args: &[String]) -> ExecResult<String> {
        let line = command_line(cmd, args);
        self.calls.lock().push(line.clone());
        answer(&self.script.lock(), action, &line)
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, action: &str, cmd: &str, args: &[String]) -> ExecResult<()> {
        self.record(action, cmd, args).map(|_| ())
    }

    async fn execute_with_output(
        &self,
        action: &str,
        cmd: &str,
        args: &[String],
    ) -> ExecResult<String> {
        self.record(action, cmd, args)
    }

    async fn execute_with_combined_output(
        &self,
        action: &str,
        cmd: &str,
        args: &[String],
    ) -> ExecResult<String> {
        self.record(action, cmd, args)
    }

    async fn execute_with_timeout(
        &self,
        _timeout: Duration,
        action: &str,
        cmd: &str,
        args: &[String],
    ) -> ExecResult<String> {
        self.record(action, cmd, args)
    }
}

/// A recorded `start` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCall {
    pub id: String,
    pub binary: String,
    pub pattern: String,
    pub policy: StartPolicy,
    pub args: Vec<String>,
    /// False when the call found the daemon already running
    pub spawned: bool,
}

/// [`Supervisor`] that never touches real processes
#[derive(Default)]
pub struct RecordingSupervisor {
    running: Mutex<BTreeSet<String>>,
    starts: Mutex<Vec<StartCall>>,
    stops: Mutex<Vec<String>>,
    runs: Mutex<Vec<String>>,
    script: Mutex<Script>,
}

impl RecordingSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `output` to one-shot runs whose line contains `pattern`
    pub fn on_run(&self, pattern: &str, output: &str) {
        self.script
            .lock()
            .rules
            .push((pattern.to_string(), Reply::Output(output.to_string())));
    }

    /// Fail one-shot runs whose line contains `pattern`
    pub fn fail_run(&self, pattern: &str, code: i32, stderr: &str) {
        self.script.lock().rules.push((
            pattern.to_string(),
            Reply::Fail {
                code,
                stderr: stderr.to_string(),
            },
        ));
    }

    #[must_use]
    pub fn starts(&self) -> Vec<StartCall> {
        self.starts.lock().clone()
    }

    /// Ids of daemons that were actually spawned (not already running)
    #[must_use]
    pub fn spawned(&self) -> Vec<String> {
        self.starts
            .lock()
            .iter()
            .filter(|s| s.spawned)
            .map(|s| s.id.clone())
            .collect()
    }

    #[must_use]
    pub fn stops(&self) -> Vec<String> {
        self.stops.lock().clone()
    }

    /// One-shot command lines, prefixed with the run id (`"<id>: <line>"`)
    #[must_use]
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().clone()
    }

    #[must_use]
    pub fn running(&self) -> BTreeSet<String> {
        self.running.lock().clone()
    }

    pub fn clear_history(&self) {
        self.starts.lock().clear();
        self.stops.lock().clear();
        self.runs.lock().clear();
    }

    fn record_run(&self, id: &str, binary: &str, args: &[String]) -> ExecResult<String> {
        let line = command_line(binary, args);
        self.runs.lock().push(format!("{id}: {line}"));
        answer(&self.script.lock(), id, &line)
    }
}

#[async_trait]
impl Supervisor for RecordingSupervisor {
    async fn start(
        &self,
        id: &str,
        binary: &str,
        pattern: &str,
        policy: StartPolicy,
        args: &[String],
    ) -> Result<ProcessHandle> {
        let spawned = policy == StartPolicy::ReplaceExisting || !self.running.lock().contains(id);
        self.running.lock().insert(id.to_string());
        self.starts.lock().push(StartCall {
            id: id.to_string(),
            binary: binary.to_string(),
            pattern: pattern.to_string(),
            policy,
            args: args.to_vec(),
            spawned,
        });
        Ok(ProcessHandle {
            id: id.to_string(),
            pid: 0,
            adopted: !spawned,
        })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.running.lock().remove(id);
        self.stops.lock().push(id.to_string());
        Ok(())
    }

    async fn run(&self, id: &str, binary: &str, args: &[String]) -> Result<()> {
        self.record_run(id, binary, args)?;
        Ok(())
    }

    async fn run_with_output(&self, id: &str, binary: &str, args: &[String]) -> Result<String> {
        Ok(self.record_run(id, binary, args)?)
    }

    fn is_running(&self, id: &str) -> bool {
        self.running.lock().contains(id)
    }

    async fn stop_all(&self) {
        let ids: Vec<String> = self.running.lock().iter().cloned().collect();
        for id in ids {
            let _ = self.stop(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::args;

    #[tokio::test]
    async fn test_mock_executor_script() {
        let exec = MockExecutor::new();
        exec.on("lsblk", "NAME=\"sda\"");
        exec.fail_on("sgdisk --zap-all", 2, "busy");
        assert_eq!(
            exec.execute_with_output("list", "lsblk", &args(["--pairs"]))
                .await
                .unwrap(),
            "NAME=\"sda\""
        );
        let err = exec
            .execute("zap", "sgdisk", &args(["--zap-all", "/dev/sda"]))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
        assert_eq!(exec.calls_matching("sgdisk").len(), 1);
    }

    #[tokio::test]
    async fn test_recording_supervisor_tracks_spawns() {
        let sup = RecordingSupervisor::new();
        sup.start("osd1", "ceph-osd", "x", StartPolicy::ReuseExisting, &[])
            .await
            .unwrap();
        let again = sup
            .start("osd1", "ceph-osd", "x", StartPolicy::ReuseExisting, &[])
            .await
            .unwrap();
        assert!(again.adopted);
        assert_eq!(sup.spawned(), vec!["osd1"]);
        sup.stop_all().await;
        assert!(sup.running().is_empty());
    }
}
