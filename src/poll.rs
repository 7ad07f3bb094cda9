//! Waiting for the device's services to come up after boot.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Deserializer, de};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
/// How long a cold boot is assumed to take; only used to estimate progress.
pub const DEFAULT_RAMP_UP: Duration = Duration::from_secs(100);

const NOT_READY_PROGRESS_CAP: f64 = 99.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Starting,
    Failed,
    Error,
}

impl ServiceState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ServiceState::Running),
            1 => Some(ServiceState::Starting),
            2 => Some(ServiceState::Failed),
            4 => Some(ServiceState::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Starting => "starting",
            ServiceState::Failed => "failed",
            ServiceState::Error => "error",
        }
    }
}

impl FromStr for ServiceState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(code) = s.trim().parse::<i64>() {
            return ServiceState::from_code(code).ok_or(anyhow!("Unknown service state {}", code));
        }
        match s.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(ServiceState::Running),
            "STARTING" => Ok(ServiceState::Starting),
            "FAILED" => Ok(ServiceState::Failed),
            "ERROR" => Ok(ServiceState::Error),
            other => bail!("Unknown service state {}", other),
        }
    }
}

impl<'de> Deserialize<'de> for ServiceState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Code(i64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Code(code) => ServiceState::from_code(code)
                .ok_or_else(|| de::Error::custom(format!("unknown service state {code}"))),
            Raw::Name(name) => name.parse().map_err(de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub sscma_node: ServiceState,
    pub node_red: ServiceState,
    pub system: ServiceState,
    /// Milliseconds since boot.
    #[serde(default)]
    pub uptime: Option<f64>,
}

impl ServiceStatus {
    pub fn is_ready(&self) -> bool {
        [self.sscma_node, self.node_red, self.system]
            .iter()
            .all(|state| *state == ServiceState::Running)
    }

    pub fn uptime_ms(&self) -> f64 {
        self.uptime.unwrap_or(0.0).max(0.0)
    }

    pub fn uptime(&self) -> Duration {
        Duration::from_millis(self.uptime_ms() as u64)
    }
}

/// Estimated boot progress from uptime, capped just below 100 while the
/// services are not ready and rounded to two decimals.
pub fn uptime_progress(uptime_ms: f64, ramp_up: Duration) -> f64 {
    let ramp_ms = ramp_up.as_millis() as f64;
    let percent = if ramp_ms > 0.0 {
        (uptime_ms.max(0.0) / ramp_ms) * 100.0
    } else {
        100.0
    };
    let percent = if percent >= 100.0 {
        NOT_READY_PROGRESS_CAP
    } else {
        percent
    };
    (percent * 100.0).round() / 100.0
}

pub trait StatusProbe: Send + Sync {
    fn probe(&self) -> impl Future<Output = Result<ServiceStatus>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Starting,
    Running,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollUpdate {
    pub state: PollState,
    /// Probes issued so far.
    pub attempt: u32,
    pub progress: f64,
}

impl Default for PollUpdate {
    fn default() -> Self {
        Self {
            state: PollState::Starting,
            attempt: 0,
            progress: 0.0,
        }
    }
}

pub struct ReadinessPoller<P> {
    probe: P,
    max_attempts: u32,
    interval: Duration,
    ramp_up: Duration,
}

impl<P: StatusProbe> ReadinessPoller<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
            ramp_up: DEFAULT_RAMP_UP,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn ramp_up(mut self, ramp_up: Duration) -> Self {
        self.ramp_up = ramp_up;
        self
    }

    /// Probes until every service reports running or the attempt budget is
    /// spent. Probe errors count as failed attempts. Returns an error only
    /// when cancelled.
    pub async fn run(
        &self,
        updates: &watch::Sender<PollUpdate>,
        cancel: &CancellationToken,
    ) -> Result<PollState> {
        let mut update = PollUpdate::default();
        updates.send_replace(update.clone());

        while update.attempt < self.max_attempts {
            update.attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => bail!("Readiness polling cancelled"),
                outcome = self.probe.probe() => outcome,
            };

            match outcome {
                Ok(status) if status.is_ready() => {
                    tracing::debug!("Services running after {} attempt(s)", update.attempt);
                    update.state = PollState::Running;
                    update.progress = 100.0;
                    updates.send_replace(update);
                    return Ok(PollState::Running);
                }
                Ok(status) => {
                    tracing::debug!(
                        "Attempt {}/{}: sscma-node {}, node-red {}, system {}",
                        update.attempt,
                        self.max_attempts,
                        status.sscma_node.as_str(),
                        status.node_red.as_str(),
                        status.system.as_str()
                    );
                    update.progress = uptime_progress(status.uptime_ms(), self.ramp_up);
                }
                Err(e) => {
                    tracing::warn!(
                        "Attempt {}/{}: status query failed: {:#}",
                        update.attempt,
                        self.max_attempts,
                        e
                    );
                }
            }
            updates.send_replace(update.clone());

            tokio::select! {
                biased;
                _ = cancel.cancelled() => bail!("Readiness polling cancelled"),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::warn!("Services not running after {} attempts", self.max_attempts);
        update.state = PollState::Failed;
        updates.send_replace(update);
        Ok(PollState::Failed)
    }
}

impl<P: StatusProbe + 'static> ReadinessPoller<P> {
    pub fn spawn(self) -> PollHandle {
        let (sender, receiver) = watch::channel(PollUpdate::default());
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { self.run(&sender, &task_cancel).await });

        PollHandle {
            updates: receiver,
            cancel,
            task,
        }
    }
}

pub struct PollHandle {
    updates: watch::Receiver<PollUpdate>,
    cancel: CancellationToken,
    task: JoinHandle<Result<PollState>>,
}

impl PollHandle {
    pub fn subscribe(&self) -> watch::Receiver<PollUpdate> {
        self.updates.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<PollState> {
        self.task.await.context("Readiness poll task failed")?
    }
}
