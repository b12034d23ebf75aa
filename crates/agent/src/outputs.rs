//! Actuator relays. The `gpio` feature gates the real rppal driver; without
//! it, a mock board records and logs state changes.

use anyhow::Result;
use std::collections::HashMap;
use tracing::info;

use crate::config::OutputConfig;
use crate::state::{Actuator, DeviceState};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Map each wired actuator to its BCM pin. Unwired actuators are skipped.
fn pin_map(cfg: &OutputConfig) -> Vec<(Actuator, u8)> {
    let mut map = Vec::new();
    if let Some(pin) = cfg.main_pump_pin {
        map.push((Actuator::MainPump, pin as u8));
    }
    if let Some(pin) = cfg.aux_pump_pin {
        map.push((Actuator::AuxPump, pin as u8));
    }
    for (i, pin) in cfg.light_pins.iter().enumerate() {
        map.push((Actuator::Light(i), *pin as u8));
    }
    for (i, pin) in cfg.dosing_pins.iter().enumerate() {
        map.push((Actuator::Dosing(i), *pin as u8));
    }
    map
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct OutputBoard {
    pins: HashMap<Actuator, OutputPin>,
    active_low: bool,
    last: HashMap<Actuator, bool>,
}

#[cfg(feature = "gpio")]
impl OutputBoard {
    pub(crate) fn new(cfg: &OutputConfig) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (actuator, pin_num) in pin_map(cfg) {
            let mut pin = gpio.get(pin_num)?.into_output();

            // Fail-safe: ensure "OFF" at startup
            if cfg.active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            info!(%actuator, gpio = pin_num, "relay registered");
            pins.insert(actuator, pin);
        }

        Ok(Self {
            pins,
            active_low: cfg.active_low,
            last: HashMap::new(),
        })
    }

    fn write(&mut self, actuator: Actuator, on: bool) {
        if let Some(pin) = self.pins.get_mut(&actuator) {
            // active-low relay: LOW = ON, HIGH = OFF
            if on != self.active_low {
                pin.set_high()
            } else {
                pin.set_low()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (no hardware, logs state changes)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct OutputBoard {
    pub(super) wired: HashMap<Actuator, u8>,
    last: HashMap<Actuator, bool>,
}

#[cfg(not(feature = "gpio"))]
impl OutputBoard {
    pub(crate) fn new(cfg: &OutputConfig) -> Result<Self> {
        let wired: HashMap<Actuator, u8> = pin_map(cfg).into_iter().collect();
        for (actuator, pin) in &wired {
            tracing::debug!(%actuator, gpio = pin, "[mock-gpio] relay registered (not wired)");
        }
        info!(relays = wired.len(), "[mock-gpio] output board initialised (no hardware)");
        Ok(Self {
            wired,
            last: HashMap::new(),
        })
    }

    fn write(&mut self, actuator: Actuator, on: bool) {
        tracing::debug!(
            %actuator,
            wired = self.wired.contains_key(&actuator),
            "[mock-gpio] set {}",
            if on { "ON" } else { "OFF" }
        );
    }
}

// ---------------------------------------------------------------------------
// Shared behaviour
// ---------------------------------------------------------------------------

impl OutputBoard {
    /// Drive every actuator whose value differs from what was last written.
    /// Returns the number of channels changed.
    pub(crate) fn apply(&mut self, state: &DeviceState) -> usize {
        let mut changed = 0;
        for (actuator, on) in state.actuators() {
            if self.last.get(&actuator) == Some(&on) {
                continue;
            }
            self.write(actuator, on);
            self.last.insert(actuator, on);
            changed += 1;
        }
        changed
    }

    /// Last value written to `actuator`, if any.
    #[cfg(test)]
    pub(crate) fn get(&self, actuator: Actuator) -> Option<bool> {
        self.last.get(&actuator).copied()
    }

    pub(crate) fn all_off(&mut self) {
        self.apply(&DeviceState::default());
    }
}

// ===========================================================================
// Tests
// ===========================================================================
