//! MQTT event-loop task. Owns the rumqttc `EventLoop`, decodes inbound
//! commands off the control loop's path and hands them over through the
//! single-slot [`PendingCommand`]; the control loop is the only writer of
//! actuator state.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::command::{decode_command, Command, PendingCommand};
use crate::config::MqttConfig;
use crate::state::SharedState;

/// Delivery level for both directions; the broker only promises at-most-once.
pub(crate) const QOS: QoS = QoS::AtMostOnce;

pub(crate) fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_sec));
    opts
}

/// What to do with one inbound publish.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    Command(Command),
    Rejected(String),
    Ignored,
}

/// Classify an inbound publish by topic and decode command payloads.
pub(crate) fn classify(topic: &str, payload: &[u8], command_topic: &str) -> Inbound {
    if topic != command_topic {
        return Inbound::Ignored;
    }
    match decode_command(payload) {
        Ok(cmd) => Inbound::Command(cmd),
        Err(e) => Inbound::Rejected(e.to_string()),
    }
}

/// Poll the broker connection until a clean disconnect has been sent.
/// Connection errors are logged, followed by a short back-off; rumqttc
/// reconnects on the next poll and state is left as it was.
pub(crate) async fn run(
    mut eventloop: EventLoop,
    client: AsyncClient,
    cfg: MqttConfig,
    pending: Arc<PendingCommand>,
    shared: SharedState,
) {
    let reconnect_delay = Duration::from_millis(cfg.reconnect_delay_ms);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                match classify(&p.topic, &p.payload, &cfg.command_topic) {
                    Inbound::Command(cmd) => {
                        debug!(topic = %p.topic, ?cmd, "command received");
                        if pending.put(cmd).await {
                            debug!("command merged over one not yet applied");
                        }
                    }
                    Inbound::Rejected(e) => {
                        warn!(
                            topic = %p.topic,
                            payload = %String::from_utf8_lossy(&p.payload),
                            "bad command discarded: {e}"
                        );
                    }
                    Inbound::Ignored => {
                        debug!(topic = %p.topic, "unhandled topic");
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(host = %cfg.host, port = cfg.port, "mqtt connected");
                // Subscriptions do not survive a clean-session reconnect.
                if let Err(e) = client.try_subscribe(&cfg.command_topic, QOS) {
                    warn!(topic = %cfg.command_topic, "subscribe failed: {e}");
                }
                shared.write().await.mqtt_connected = true;
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                info!(topic = %cfg.command_topic, "subscribed");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected by broker");
                shared.write().await.mqtt_connected = false;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("mqtt disconnect sent, transport stopping");
                shared.write().await.mqtt_connected = false;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                shared.write().await.mqtt_connected = false;
                sleep(reconnect_delay).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
