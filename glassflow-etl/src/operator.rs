//! Command and status plumbing between the manager and operator workers.
//!
//! Every lifecycle transition is a message on the operator's command
//! channel, and every state change is a new report on its watch channel.
//! Workers never share flags with the manager.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperatorState {
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Pause,
    Resume,
    /// Drain in-flight work within the drain timeout, then stop.
    Terminate,
}

/// What one worker last said about itself.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorReport {
    pub name: String,
    pub state: OperatorState,
    pub last_success_ts: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Undelivered input (bus pending count), best effort.
    pub backlog_hint: u64,
}

impl OperatorReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: OperatorState::Starting,
            last_success_ts: None,
            last_error: None,
            backlog_hint: 0,
        }
    }
}

/// Manager-side endpoint of one worker. Cloning shares the same command
/// channel and report watch, so the manager can operate on handles outside
/// its registry lock.
#[derive(Clone)]
pub struct OperatorHandle {
    pub name: String,
    commands: mpsc::Sender<OperatorCommand>,
    reports: watch::Receiver<OperatorReport>,
}

impl OperatorHandle {
    pub async fn send(&self, command: OperatorCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub fn report(&self) -> OperatorReport {
        self.reports.borrow().clone()
    }

    /// Waits until the worker reports a state matching `pred`, up to
    /// `timeout`. Returns false on timeout or if the worker is gone.
    pub async fn wait_for_state<F>(&mut self, pred: F, timeout: Duration) -> bool
    where
        F: Fn(OperatorState) -> bool,
    {
        tokio::time::timeout(timeout, self.reports.wait_for(|r| pred(r.state)))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }
}

/// Worker-side endpoint: the command receiver plus the report sender.
pub struct OperatorContext {
    pub commands: mpsc::Receiver<OperatorCommand>,
    pub reporter: StatusReporter,
}

/// Builds the paired endpoints for one operator worker.
pub fn operator_channel(name: &str) -> (OperatorHandle, OperatorContext) {
    let (command_tx, command_rx) = mpsc::channel(4);
    let (report_tx, report_rx) = watch::channel(OperatorReport::new(name));

    (
        OperatorHandle {
            name: name.to_string(),
            commands: command_tx,
            reports: report_rx,
        },
        OperatorContext {
            commands: command_rx,
            reporter: StatusReporter { tx: report_tx },
        },
    )
}

pub struct StatusReporter {
    tx: watch::Sender<OperatorReport>,
}

impl StatusReporter {
    pub fn state(&self, state: OperatorState) {
        self.tx.send_modify(|report| report.state = state);
    }

    pub fn current_state(&self) -> OperatorState {
        self.tx.borrow().state
    }

    pub fn success(&self) {
        self.tx.send_modify(|report| {
            report.last_success_ts = Some(Utc::now());
            report.last_error = None;
        });
    }

    pub fn error(&self, error: impl ToString) {
        self.tx
            .send_modify(|report| report.last_error = Some(error.to_string()));
    }

    pub fn backlog(&self, backlog_hint: u64) {
        self.tx
            .send_modify(|report| report.backlog_hint = backlog_hint);
    }
}
