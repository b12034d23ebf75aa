use serde::{Serialize, Serializer};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Number of channels in the light and dosing banks.
pub const BANK_SIZE: usize = 4;

/// Dosing channel used for fresh-water top-up.
pub const FRESH_WATER_PUMP: usize = 0;
/// Dosing channel used for the nutrient pulse.
pub const NUTRIENT_PUMP: usize = 1;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Authoritative actuator + sensor state. Serializes to the broadcast wire
/// shape; flags go out as 0/1.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceState {
    #[serde(rename = "MainFlowON", serialize_with = "flag")]
    pub main_flow_on: bool,
    #[serde(rename = "AuxFlowON", serialize_with = "flag")]
    pub aux_flow_on: bool,
    #[serde(serialize_with = "flags")]
    pub lights: [bool; BANK_SIZE],
    #[serde(serialize_with = "flags")]
    pub dosing: [bool; BANK_SIZE],
    pub tds: Option<f64>,
    #[serde(rename = "temp")]
    pub temperature: Option<f64>,
    pub ph: Option<f64>,
    #[serde(rename = "manual_control")]
    pub manual_control: bool,
}

/// One physical output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actuator {
    MainPump,
    AuxPump,
    Light(usize),
    Dosing(usize),
}

impl std::fmt::Display for Actuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MainPump => write!(f, "main-pump"),
            Self::AuxPump => write!(f, "aux-pump"),
            Self::Light(i) => write!(f, "light{i}"),
            Self::Dosing(i) => write!(f, "dosing{i}"),
        }
    }
}

impl DeviceState {
    /// Every actuator channel with its current commanded value.
    pub fn actuators(&self) -> impl Iterator<Item = (Actuator, bool)> + '_ {
        [
            (Actuator::MainPump, self.main_flow_on),
            (Actuator::AuxPump, self.aux_flow_on),
        ]
        .into_iter()
        .chain(self.lights.iter().enumerate().map(|(i, on)| (Actuator::Light(i), *on)))
        .chain(self.dosing.iter().enumerate().map(|(i, on)| (Actuator::Dosing(i), *on)))
    }

    /// Serialize to the broadcast JSON payload.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Everything the agent's tasks share: the device state plus transport
/// bookkeeping that is not part of the published snapshot.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub device: DeviceState,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            device: DeviceState::default(),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

fn flag<S: Serializer>(on: &bool, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u8(u8::from(*on))
}

fn flags<S: Serializer>(bank: &[bool; BANK_SIZE], s: S) -> Result<S::Ok, S::Error> {
    bank.map(u8::from).serialize(s)
}

// ===========================================================================
// Tests
// ===========================================================================
