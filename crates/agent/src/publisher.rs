//! Change-detection publisher: emits the device state when it differs from
//! the last successfully published snapshot, or when the heartbeat interval
//! has elapsed with nothing new to say.

use rumqttc::AsyncClient;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::state::DeviceState;
use crate::transport::QOS;

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Where serialized state goes. Implementations must not block: a full or
/// unavailable transport is reported as an error and retried next tick.
pub(crate) trait Sink {
    fn send(&self, payload: Vec<u8>) -> Result<()>;
}

/// Publishes to the broadcast topic through the rumqttc request queue.
pub(crate) struct MqttSink {
    client: AsyncClient,
    topic: String,
}

impl MqttSink {
    pub(crate) fn new(client: AsyncClient, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }
}

impl Sink for MqttSink {
    fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(&self.topic, QOS, false, payload)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// The last state emitted and when.
#[derive(Debug, Clone)]
pub(crate) struct PublishedSnapshot {
    pub(crate) state: DeviceState,
    pub(crate) at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PublishReason {
    First,
    Changed,
    Heartbeat,
    Forced,
}

pub(crate) struct ChangePublisher {
    heartbeat: Duration,
    last: Option<PublishedSnapshot>,
}

impl ChangePublisher {
    pub(crate) fn new(heartbeat: Duration) -> Self {
        Self {
            heartbeat,
            last: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn last(&self) -> Option<&PublishedSnapshot> {
        self.last.as_ref()
    }

    /// Why `state` should be published at `now`, if at all.
    pub(crate) fn due(&self, state: &DeviceState, now: Instant) -> Option<PublishReason> {
        match &self.last {
            None => Some(PublishReason::First),
            Some(last) if last.state != *state => Some(PublishReason::Changed),
            Some(last) if now.saturating_duration_since(last.at) >= self.heartbeat => {
                Some(PublishReason::Heartbeat)
            }
            Some(_) => None,
        }
    }

    /// Publish if due. The baseline only moves after the sink accepted the
    /// payload, so a failed send is retried against the same comparison.
    pub(crate) fn maybe_publish(
        &mut self,
        state: &DeviceState,
        now: Instant,
        sink: &impl Sink,
    ) -> Result<Option<PublishReason>> {
        match self.due(state, now) {
            Some(reason) => {
                self.publish(state, now, sink, reason)?;
                Ok(Some(reason))
            }
            None => Ok(None),
        }
    }

    /// Publish unconditionally (used for the final publish on shutdown).
    pub(crate) fn force_publish(
        &mut self,
        state: &DeviceState,
        now: Instant,
        sink: &impl Sink,
    ) -> Result<()> {
        self.publish(state, now, sink, PublishReason::Forced)
    }

    fn publish(
        &mut self,
        state: &DeviceState,
        now: Instant,
        sink: &impl Sink,
        reason: PublishReason,
    ) -> Result<()> {
        let payload = state.to_payload()?;
        let len = payload.len();
        if let Err(e) = sink.send(payload) {
            warn!(?reason, "state publish failed, will retry: {e}");
            return Err(e);
        }

        match reason {
            PublishReason::Heartbeat => debug!(bytes = len, "heartbeat published"),
            _ => info!(?reason, bytes = len, "state published"),
        }
        self.last = Some(PublishedSnapshot {
            state: state.clone(),
            at: now,
        });
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
