//! Process Supervisor Client
//!
//! wardend does not run services itself; it asks an external supervisor
//! (pm2 on Termux) for status and restarts. This module provides:
//!
//! - [`ProcessSupervisor`]: the narrow capability set (`status`, `restart`)
//! - [`CommandGuard`]: the allow-list every derived command must pass before
//!   anything is executed
//! - [`Pm2Supervisor`] for production and [`FakeSupervisor`] for tests

use crate::exec::{run_command, ExecError};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Patterns a rendered supervisor command must match in full
const ALLOWED_PATTERNS: &[&str] = &[
    r"^pm2 describe [a-zA-Z0-9_-]+$",
    r"^pm2 restart [a-zA-Z0-9_-]+$",
];

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("command rejected by allow-list: {0}")]
    Rejected(String),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("{0}")]
    Other(String),
}

// ============================================================================
// Commands and allow-list
// ============================================================================

/// What is being asked of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    Describe,
    Restart,
}

impl SupervisorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorAction::Describe => "describe",
            SupervisorAction::Restart => "restart",
        }
    }
}

/// A command as it would be executed, argv form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SupervisorCommand {
    /// The pm2 invocation for `action` on `service`
    pub fn pm2(action: SupervisorAction, service: &str) -> Self {
        Self {
            program: "pm2".to_string(),
            args: vec![action.as_str().to_string(), service.to_string()],
        }
    }

    pub fn render(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for SupervisorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Allow-list for supervisor commands
pub struct CommandGuard {
    patterns: Vec<Regex>,
}

impl CommandGuard {
    pub fn new() -> Self {
        Self {
            patterns: ALLOWED_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }

    /// Ok if the rendered command matches an allowed pattern
    pub fn check(&self, command: &SupervisorCommand) -> Result<(), SupervisorError> {
        let rendered = command.render();
        if self.patterns.iter().any(|p| p.is_match(&rendered)) {
            Ok(())
        } else {
            Err(SupervisorError::Rejected(rendered))
        }
    }
}

impl Default for CommandGuard {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Supervisor trait
// ============================================================================

/// What the external supervisor reports for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Online,
    Offline,
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// The command that `action` on `service` will run, for allow-listing
    fn command_for(&self, action: SupervisorAction, service: &str) -> SupervisorCommand {
        SupervisorCommand::pm2(action, service)
    }

    /// Ask whether `service` is online
    async fn status(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<SupervisorStatus, SupervisorError>;

    /// Restart `service`
    async fn restart(&self, service: &str, timeout: Duration) -> Result<(), SupervisorError>;
}

// ============================================================================
// pm2 (production)
// ============================================================================

/// Talks to pm2 through its CLI. Every command is allow-listed before it
/// runs, whoever the caller is.
pub struct Pm2Supervisor {
    guard: CommandGuard,
}

impl Pm2Supervisor {
    pub fn new() -> Self {
        Self {
            guard: CommandGuard::new(),
        }
    }

    async fn run(
        &self,
        action: SupervisorAction,
        service: &str,
        timeout: Duration,
    ) -> Result<String, SupervisorError> {
        let command = self.command_for(action, service);
        self.guard.check(&command)?;
        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        let output = run_command(&command.program, &args, timeout).await?;
        Ok(output.stdout)
    }
}

impl Default for Pm2Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Empty or unrecognised `pm2 describe` output means offline
pub fn parse_describe(stdout: &str) -> SupervisorStatus {
    if stdout.contains("online") {
        SupervisorStatus::Online
    } else {
        SupervisorStatus::Offline
    }
}

#[async_trait]
impl ProcessSupervisor for Pm2Supervisor {
    async fn status(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<SupervisorStatus, SupervisorError> {
        let stdout = self.run(SupervisorAction::Describe, service, timeout).await?;
        Ok(parse_describe(&stdout))
    }

    async fn restart(&self, service: &str, timeout: Duration) -> Result<(), SupervisorError> {
        self.run(SupervisorAction::Restart, service, timeout).await?;
        Ok(())
    }
}

// ============================================================================
// Fake supervisor (testing)
// ============================================================================

/// Scripted supervisor. Unscripted status queries fail; unscripted restarts
/// succeed.
#[derive(Default)]
pub struct FakeSupervisor {
    statuses: Mutex<HashMap<String, VecDeque<Result<SupervisorStatus, String>>>>,
    restarts: Mutex<HashMap<String, VecDeque<Result<(), String>>>>,
    restart_calls: Mutex<Vec<String>>,
    status_calls: Mutex<Vec<String>>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a status answer for `service`; the last one queued repeats
    pub fn push_status(&self, service: &str, status: Result<SupervisorStatus, &str>) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(service.to_string())
            .or_default()
            .push_back(status.map_err(str::to_string));
    }

    /// Queue a restart outcome for `service`; the last one queued repeats
    pub fn push_restart(&self, service: &str, outcome: Result<(), &str>) {
        self.restarts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(service.to_string())
            .or_default()
            .push_back(outcome.map_err(str::to_string));
    }

    /// Services passed to `restart`, in call order
    pub fn restart_calls(&self) -> Vec<String> {
        self.restart_calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Services passed to `status`, in call order
    pub fn status_calls(&self) -> Vec<String> {
        self.status_calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn next_scripted<T: Clone>(queue: Option<&mut VecDeque<T>>) -> Option<T> {
    let queue = queue?;
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn status(
        &self,
        service: &str,
        _timeout: Duration,
    ) -> Result<SupervisorStatus, SupervisorError> {
        self.status_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(service.to_string());
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        match next_scripted(statuses.get_mut(service)) {
            Some(Ok(status)) => Ok(status),
            Some(Err(e)) => Err(SupervisorError::Other(e)),
            None => Err(SupervisorError::Other(format!("no status scripted for {}", service))),
        }
    }

    async fn restart(&self, service: &str, _timeout: Duration) -> Result<(), SupervisorError> {
        self.restart_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(service.to_string());
        let mut restarts = self.restarts.lock().unwrap_or_else(|e| e.into_inner());
        match next_scripted(restarts.get_mut(service)) {
            Some(Err(e)) => Err(SupervisorError::Other(e)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_allows_pm2_commands() {
        let guard = CommandGuard::new();
        assert!(guard
            .check(&SupervisorCommand::pm2(SupervisorAction::Describe, "sshd"))
            .is_ok());
        assert!(guard
            .check(&SupervisorCommand::pm2(SupervisorAction::Restart, "web_server-2"))
            .is_ok());
    }

    #[test]
    fn test_guard_rejects_injection() {
        let guard = CommandGuard::new();
        for name in ["sshd; rm -rf ~", "sshd && reboot", "$(id)", "a b", "", "web\nrestart"] {
            let cmd = SupervisorCommand::pm2(SupervisorAction::Restart, name);
            assert!(
                matches!(guard.check(&cmd), Err(SupervisorError::Rejected(_))),
                "accepted {:?}",
                name
            );
        }
    }

    #[test]
    fn test_guard_rejects_other_programs() {
        let guard = CommandGuard::new();
        let cmd = SupervisorCommand {
            program: "systemctl".to_string(),
            args: vec!["restart".to_string(), "sshd".to_string()],
        };
        assert!(guard.check(&cmd).is_err());
    }

    #[test]
    fn test_parse_describe() {
        assert_eq!(parse_describe("│ status │ online │"), SupervisorStatus::Online);
        assert_eq!(parse_describe("│ status │ stopped │"), SupervisorStatus::Offline);
        assert_eq!(parse_describe(""), SupervisorStatus::Offline);
    }

    #[tokio::test]
    async fn test_pm2_rejects_unsafe_name_before_exec() {
        let pm2 = Pm2Supervisor::new();
        let t = Duration::from_secs(1);

        let err = pm2.restart("sshd; reboot", t).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Rejected(ref c) if c == "pm2 restart sshd; reboot"
        ));

        let err = pm2.status("$(id)", t).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_fake_last_script_repeats() {
        let fake = FakeSupervisor::new();
        fake.push_restart("sshd", Err("boom"));
        fake.push_restart("sshd", Ok(()));

        let t = Duration::from_secs(1);
        assert!(fake.restart("sshd", t).await.is_err());
        assert!(fake.restart("sshd", t).await.is_ok());
        assert!(fake.restart("sshd", t).await.is_ok());
        assert_eq!(fake.restart_calls().len(), 3);

        assert!(fake.status("webserver", t).await.is_err());
    }
}
