//! `TmuxAdapter` (`spec.md` §4.1) — a thin, per-call-timeouted wrapper over
//! the `tmux` binary. Adapted from the teacher's `TmuxManager`
//! (`src/tmux.rs`): same `Command`-per-operation shape, generalized into an
//! async trait so `ConnectionPool` can hand out interchangeable handles and
//! `MockTmuxAdapter` can stand in during tests.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::AdapterError;
use crate::model::{now_unix, PaneSnapshot};
use crate::target::Target;

const DEFAULT_CAPTURE_LINES: u32 = 50;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const KEYSTROKE_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// The adapter API the core consumes (`spec.md` §6). All four operations may
/// fail with [`AdapterError`]; the adapter never retries on its own.
#[async_trait]
pub trait TmuxAdapter: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<Target>, AdapterError>;
    async fn capture(&self, target: &Target, lines: u32) -> Result<PaneSnapshot, AdapterError>;
    async fn send(&self, target: &Target, text: &str, submit: bool) -> Result<(), AdapterError>;
    async fn spawn(
        &self,
        session: &str,
        window_name: &str,
        command: &str,
    ) -> Result<Target, AdapterError>;

    /// Default capture-line count per `spec.md` §4.1.
    fn default_capture_lines(&self) -> u32 {
        DEFAULT_CAPTURE_LINES
    }
}

/// Production adapter: shells out to the `tmux` binary, matching the
/// teacher's `TmuxManager` command construction, run through tokio's async
/// process API so it never blocks the scheduler thread pool.
pub struct ShellTmuxAdapter {
    call_timeout: Duration,
}

impl ShellTmuxAdapter {
    pub fn new() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, AdapterError> {
        let fut = Command::new("tmux")
            .args(args)
            .stdin(Stdio::null())
            .output();
        match timeout(self.call_timeout, fut).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(AdapterError::Transient(format!("tmux spawn failed: {e}"))),
            Err(_) => Err(AdapterError::Transient("tmux call timed out".to_string())),
        }
    }
}

impl Default for ShellTmuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TmuxAdapter for ShellTmuxAdapter {
    async fn list_targets(&self) -> Result<Vec<Target>, AdapterError> {
        let output = self
            .run(&["list-windows", "-a", "-F", "#{session_name}:#{window_index}"])
            .await?;

        if !output.status.success() {
            // tmux exits non-zero with "no server running" when nothing is
            // up yet; that's a permanent condition for this call, not a bug.
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdapterError::Permanent(format!(
                "tmux list-windows failed: {stderr}"
            )));
        }

        let mut targets = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Ok(t) = line.parse::<Target>() {
                targets.push(t);
            }
        }
        Ok(targets)
    }

    async fn capture(&self, target: &Target, lines: u32) -> Result<PaneSnapshot, AdapterError> {
        let target_str = target.to_string();
        let start_arg = format!("-{lines}");
        let output = self
            .run(&[
                "capture-pane",
                "-t",
                &target_str,
                "-p",
                "-S",
                &start_arg,
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdapterError::Permanent(format!(
                "target {target} does not exist: {stderr}"
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        Ok(PaneSnapshot::new(target.clone(), text, now_unix()))
    }

    async fn send(&self, target: &Target, text: &str, submit: bool) -> Result<(), AdapterError> {
        let target_str = target.to_string();
        let output = self
            .run(&["send-keys", "-t", &target_str, "-l", text])
            .await?;
        if !output.status.success() {
            return Err(AdapterError::Transient(format!(
                "send-keys failed for {target}"
            )));
        }

        if submit {
            // Defeats terminal input debouncing (spec.md §6, §9).
            tokio::time::sleep(KEYSTROKE_SETTLE_DELAY).await;
            let output = self.run(&["send-keys", "-t", &target_str, "Enter"]).await?;
            if !output.status.success() {
                return Err(AdapterError::Transient(format!(
                    "enter key failed for {target}"
                )));
            }
        }
        Ok(())
    }

    async fn spawn(
        &self,
        session: &str,
        window_name: &str,
        command: &str,
    ) -> Result<Target, AdapterError> {
        let output = self
            .run(&[
                "new-window",
                "-t",
                session,
                "-n",
                window_name,
                "-P",
                "-F",
                "#{session_name}:#{window_index}",
                command,
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdapterError::Permanent(format!(
                "failed to spawn window {window_name} in {session}: {stderr}"
            )));
        }

        let printed = String::from_utf8_lossy(&output.stdout);
        printed
            .trim()
            .parse::<Target>()
            .map_err(|_| AdapterError::Transient("spawn returned unparseable target".to_string()))
    }
}

/// In-memory [`TmuxAdapter`] for tests. Not behind `#[cfg(test)]` so
/// integration tests under `tests/` can use it too.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Deterministic in-memory adapter for tests: each target has a queue of
    /// pane texts consumed one per `capture` call (sticking to the last one
    /// once exhausted), matching the scripted-scenario style the spec's
    /// end-to-end tests (S1-S6) require.
    #[derive(Default)]
    pub struct MockTmuxAdapter {
        inner: Mutex<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        targets: Vec<Target>,
        panes: HashMap<Target, Vec<String>>,
        cursor: HashMap<Target, usize>,
        sent: Vec<(Target, String, bool)>,
        spawn_counter: u32,
        fail_capture_for: HashMap<Target, AdapterError>,
    }

    impl MockTmuxAdapter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_target(&self, target: Target, panes: Vec<String>) {
            let mut st = self.inner.lock();
            st.targets.push(target.clone());
            st.panes.insert(target.clone(), panes);
            st.cursor.insert(target, 0);
        }

        pub fn remove_target(&self, target: &Target) {
            let mut st = self.inner.lock();
            st.targets.retain(|t| t != target);
        }

        /// Overwrites an already-registered target's pane script without
        /// re-adding it to the target list, for scenarios where a target's
        /// output changes after it was first discovered or spawned.
        pub fn set_panes(&self, target: &Target, panes: Vec<String>) {
            let mut st = self.inner.lock();
            st.panes.insert(target.clone(), panes);
            st.cursor.insert(target.clone(), 0);
        }

        pub fn fail_capture(&self, target: Target, err: AdapterError) {
            self.inner.lock().fail_capture_for.insert(target, err);
        }

        pub fn sent_messages(&self) -> Vec<(Target, String, bool)> {
            self.inner.lock().sent.clone()
        }
    }

    #[async_trait]
    impl TmuxAdapter for MockTmuxAdapter {
        async fn list_targets(&self) -> Result<Vec<Target>, AdapterError> {
            Ok(self.inner.lock().targets.clone())
        }

        async fn capture(&self, target: &Target, _lines: u32) -> Result<PaneSnapshot, AdapterError> {
            let mut st = self.inner.lock();
            if let Some(err) = st.fail_capture_for.get(target).cloned() {
                return Err(err);
            }
            let panes = st
                .panes
                .get(target)
                .ok_or_else(|| AdapterError::Permanent(format!("unknown target {target}")))?
                .clone();
            let cursor = st.cursor.entry(target.clone()).or_insert(0);
            let idx = (*cursor).min(panes.len().saturating_sub(1));
            let text = panes.get(idx).cloned().unwrap_or_default();
            if *cursor + 1 < panes.len() {
                *cursor += 1;
            }
            Ok(PaneSnapshot::new(target.clone(), text, now_unix()))
        }

        async fn send(&self, target: &Target, text: &str, submit: bool) -> Result<(), AdapterError> {
            self.inner
                .lock()
                .sent
                .push((target.clone(), text.to_string(), submit));
            Ok(())
        }

        async fn spawn(
            &self,
            session: &str,
            _window_name: &str,
            _command: &str,
        ) -> Result<Target, AdapterError> {
            let mut st = self.inner.lock();
            st.spawn_counter += 1;
            let target = Target::new(session, st.spawn_counter).unwrap();
            st.targets.push(target.clone());
            st.panes.insert(target.clone(), vec![String::new()]);
            st.cursor.insert(target.clone(), 0);
            Ok(target)
        }
    }
}
