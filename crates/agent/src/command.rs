use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{AgentError, Result};
use crate::state::{DeviceState, BANK_SIZE};

// ---------------------------------------------------------------------------
// Inbound command message
// ---------------------------------------------------------------------------

/// A decoded operator command. Every field is optional; `None` leaves the
/// corresponding device field untouched when applied.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub(crate) struct Command {
    #[serde(rename = "MainFlowON")]
    pub(crate) main_flow_on: Option<Flag>,
    #[serde(rename = "AuxFlowON")]
    pub(crate) aux_flow_on: Option<Flag>,
    pub(crate) lights: Option<[Flag; BANK_SIZE]>,
    pub(crate) dosing: Option<[Flag; BANK_SIZE]>,
    pub(crate) tds: Option<f64>,
    #[serde(rename = "temp")]
    pub(crate) temperature: Option<f64>,
    pub(crate) ph: Option<f64>,
    pub(crate) manual_control: Option<Flag>,
}

/// An on/off value on the wire: `0`/`1` or `false`/`true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Flag(pub(crate) bool);

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct FlagVisitor;

        impl<'de> Visitor<'de> for FlagVisitor {
            type Value = Flag;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("0, 1, true or false")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Flag, E> {
                Ok(Flag(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Flag, E> {
                match v {
                    0 => Ok(Flag(false)),
                    1 => Ok(Flag(true)),
                    _ => Err(E::invalid_value(de::Unexpected::Unsigned(v), &self)),
                }
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Flag, E> {
                match v {
                    0 => Ok(Flag(false)),
                    1 => Ok(Flag(true)),
                    _ => Err(E::invalid_value(de::Unexpected::Signed(v), &self)),
                }
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Flag, E> {
                if v == 0.0 {
                    Ok(Flag(false))
                } else if v == 1.0 {
                    Ok(Flag(true))
                } else {
                    Err(E::invalid_value(de::Unexpected::Float(v), &self))
                }
            }
        }

        d.deserialize_any(FlagVisitor)
    }
}

// ---------------------------------------------------------------------------
// Decode / apply
// ---------------------------------------------------------------------------

/// Decode a command payload. The payload must be a JSON object; unknown keys
/// are ignored, but a recognized key with the wrong type rejects the whole
/// message so nothing is partially applied.
pub(crate) fn decode_command(payload: &[u8]) -> Result<Command> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(AgentError::Decode(format!(
            "command must be a JSON object, got {}",
            json_kind(&value)
        )));
    }
    let cmd: Command = serde_json::from_value(value)?;
    for (key, v) in [("tds", cmd.tds), ("temp", cmd.temperature), ("ph", cmd.ph)] {
        if v.is_some_and(|v| !v.is_finite()) {
            return Err(AgentError::Decode(format!("{key} is not a finite number")));
        }
    }
    Ok(cmd)
}

impl Command {
    /// Merge into `state` field by field. Callers hold the state write lock
    /// for the whole call.
    pub(crate) fn apply(&self, state: &mut DeviceState) {
        if let Some(Flag(on)) = self.main_flow_on {
            state.main_flow_on = on;
        }
        if let Some(Flag(on)) = self.aux_flow_on {
            state.aux_flow_on = on;
        }
        if let Some(bank) = self.lights {
            state.lights = bank.map(|Flag(on)| on);
        }
        if let Some(bank) = self.dosing {
            state.dosing = bank.map(|Flag(on)| on);
        }
        if let Some(v) = self.tds {
            state.tds = Some(v);
        }
        if let Some(v) = self.temperature {
            state.temperature = Some(v);
        }
        if let Some(v) = self.ph {
            state.ph = Some(v);
        }
        if let Some(Flag(manual)) = self.manual_control {
            state.manual_control = manual;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        *self == Command::default()
    }

    /// Overlay `newer` on top of `self`: every field `newer` carries wins.
    /// Applying the merged command equals applying both in order.
    pub(crate) fn merge(&mut self, newer: Command) {
        self.main_flow_on = newer.main_flow_on.or(self.main_flow_on);
        self.aux_flow_on = newer.aux_flow_on.or(self.aux_flow_on);
        self.lights = newer.lights.or(self.lights);
        self.dosing = newer.dosing.or(self.dosing);
        self.tds = newer.tds.or(self.tds);
        self.temperature = newer.temperature.or(self.temperature);
        self.ph = newer.ph.or(self.ph);
        self.manual_control = newer.manual_control.or(self.manual_control);
    }
}

// ---------------------------------------------------------------------------
// Pending slot
// ---------------------------------------------------------------------------

/// Hand-off between the transport task and the control loop. Holds at most
/// one command: a new arrival is merged over whatever the loop has not taken
/// yet, so the latest message always wins and nothing is ever turned away.
#[derive(Debug, Default)]
pub(crate) struct PendingCommand {
    slot: Mutex<Option<Command>>,
}

impl PendingCommand {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store `cmd`. Returns true if it was merged over an untaken command.
    pub(crate) async fn put(&self, cmd: Command) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(pending) => {
                pending.merge(cmd);
                true
            }
            None => {
                *slot = Some(cmd);
                false
            }
        }
    }

    /// Take the pending command, leaving the slot empty.
    pub(crate) async fn take(&self) -> Option<Command> {
        self.slot.lock().await.take()
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// ===========================================================================
// Tests
// ===========================================================================
