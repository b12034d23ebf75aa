//! Main control loop.
//!
//! Each iteration runs, in order:
//!
//! 1. take the pending command from the transport, if any, and merge it,
//! 2. run the control policy unless manual control is active,
//! 3. drive changed actuators and publish the state if due,
//! 4. refresh the sensor snapshot if its interval has elapsed.
//!
//! Steps 1 and 2 each hold the state write lock for their whole duration, so
//! a command is applied entirely before or entirely after a control pass.
//! Nothing in an iteration waits on the network.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::command::{Command, PendingCommand};
use crate::config::Config;
use crate::outputs::OutputBoard;
use crate::policy::{ControlPolicy, Tick};
use crate::publisher::{ChangePublisher, PublishReason, Sink};
use crate::sensors::SnapshotReader;
use crate::state::{DeviceState, SharedState};

/// What one iteration did.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct TickReport {
    pub(crate) command_applied: bool,
    pub(crate) policy_ran: bool,
    pub(crate) outputs_changed: usize,
    pub(crate) published: Option<PublishReason>,
    pub(crate) sensors_refreshed: bool,
}

pub(crate) struct Agent<S: Sink> {
    shared: SharedState,
    policy: ControlPolicy,
    publisher: ChangePublisher,
    reader: SnapshotReader,
    outputs: OutputBoard,
    sink: S,
    pending: Arc<PendingCommand>,
    loop_interval: Duration,
    sensor_interval: Duration,
    last_sensor_refresh: Option<Instant>,
}

impl<S: Sink> Agent<S> {
    pub(crate) fn new(
        cfg: &Config,
        shared: SharedState,
        outputs: OutputBoard,
        sink: S,
        pending: Arc<PendingCommand>,
    ) -> Self {
        Self {
            shared,
            policy: ControlPolicy::new(cfg.policy.clone()),
            publisher: ChangePublisher::new(cfg.timing.heartbeat()),
            reader: SnapshotReader::new(&cfg.sensors.snapshot_path),
            outputs,
            sink,
            pending,
            loop_interval: cfg.timing.loop_interval(),
            sensor_interval: cfg.timing.sensor_interval(),
            last_sensor_refresh: None,
        }
    }

    /// Run iterations until `shutdown` resolves, then publish a final
    /// snapshot. An iteration in progress always runs to completion.
    pub(crate) async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = interval(self.loop_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            loop_ms = self.loop_interval.as_millis() as u64,
            sensor_ms = self.sensor_interval.as_millis() as u64,
            snapshot = %self.reader.path().display(),
            "control loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let report = self.tick(Tick::now()).await;
                    trace!(
                        command = report.command_applied,
                        policy = report.policy_ran,
                        outputs = report.outputs_changed,
                        published = ?report.published,
                        sensors = report.sensors_refreshed,
                        "tick"
                    );
                }
            }
        }

        self.finish(Instant::now()).await;
    }

    /// One control-loop iteration at `tick`.
    pub(crate) async fn tick(&mut self, tick: Tick) -> TickReport {
        let mut report = TickReport::default();

        // ── 1. Command ──────────────────────────────────────────────
        if let Some(cmd) = self.pending.take().await {
            report.command_applied = self.apply_command(&cmd).await;
        }

        // ── 2. Policy ───────────────────────────────────────────────
        let (device, connected) = {
            let mut st = self.shared.write().await;
            if st.device.manual_control {
                self.policy.track_manual_main_pump(st.device.main_flow_on);
            } else {
                self.policy.run(&mut st.device, &tick);
                report.policy_ran = true;
            }
            (st.device.clone(), st.mqtt_connected)
        };

        // ── 3. Outputs + publish ────────────────────────────────────
        report.outputs_changed = self.outputs.apply(&device);

        if connected {
            // Failures are logged by the publisher and retried next tick.
            report.published = self
                .publisher
                .maybe_publish(&device, tick.at, &self.sink)
                .unwrap_or(None);
        } else if self.publisher.due(&device, tick.at).is_some() {
            debug!("publish deferred: mqtt not connected");
        }

        // ── 4. Sensors ──────────────────────────────────────────────
        let refresh_due = self
            .last_sensor_refresh
            .map_or(true, |last| tick.at.saturating_duration_since(last) >= self.sensor_interval);
        if refresh_due {
            self.last_sensor_refresh = Some(tick.at);
            report.sensors_refreshed = self.reader.refresh_into(&self.shared).await;
        }

        report
    }

    async fn apply_command(&mut self, cmd: &Command) -> bool {
        if cmd.is_empty() {
            debug!("empty command ignored");
            return false;
        }
        let mut st = self.shared.write().await;
        let was_manual = st.device.manual_control;
        cmd.apply(&mut st.device);

        match (was_manual, st.device.manual_control) {
            (false, true) => info!("manual control enabled, policy suspended"),
            (true, false) => info!("manual control disabled, policy resumed"),
            _ => debug!(manual = was_manual, "command applied"),
        }
        true
    }

    /// Best-effort final publish of the current state.
    async fn finish(&mut self, now: Instant) {
        let device = self.device().await;
        match self.publisher.force_publish(&device, now, &self.sink) {
            Ok(()) => info!("final state published"),
            Err(e) => warn!("final publish failed: {e}"),
        }
    }

    pub(crate) async fn device(&self) -> DeviceState {
        self.shared.read().await.device.clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
