//! TOML config file loading, env overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::state::BANK_SIZE;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub timing: TimingConfig,
    pub sensors: SensorConfig,
    pub policy: PolicyConfig,
    pub outputs: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub command_topic: String,
    pub broadcast_topic: String,
    pub keep_alive_sec: u64,
    /// Capacity of the rumqttc request queue.
    pub queue_capacity: usize,
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "hydro-agent".into(),
            command_topic: "rpi/commands".into(),
            broadcast_topic: "rpi/broadcast".into(),
            keep_alive_sec: 60,
            queue_capacity: 32,
            reconnect_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub loop_interval_ms: u64,
    pub sensor_interval_ms: u64,
    pub heartbeat_sec: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: 100,
            sensor_interval_ms: 1000,
            heartbeat_sec: 60,
        }
    }
}

impl TimingConfig {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_interval_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sec)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub snapshot_path: String,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            snapshot_path: "shared_data.json".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Main pump runs for minutes `[0, main_pump_on_minutes)` of every hour.
    pub main_pump_on_minutes: u32,
    /// Lights are on for hours `lights_on_from_hour..=lights_on_until_hour`.
    pub lights_on_from_hour: u32,
    pub lights_on_until_hour: u32,
    pub fresh_water_tds_below: f64,
    pub nutrient_tds_below: f64,
    /// Delay after the main pump stops before a nutrient pulse may fire.
    pub nutrient_settle_sec: u64,
    pub nutrient_pulse_ms: u64,
    /// When false, dosing pumps 0 and 1 are forced OFF after the policy runs.
    pub dosing_enabled: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            main_pump_on_minutes: 10,
            lights_on_from_hour: 5,
            lights_on_until_hour: 23,
            fresh_water_tds_below: 90.0,
            nutrient_tds_below: 700.0,
            nutrient_settle_sec: 300,
            nutrient_pulse_ms: 1000,
            dosing_enabled: true,
        }
    }
}

impl PolicyConfig {
    pub fn nutrient_settle(&self) -> Duration {
        Duration::from_secs(self.nutrient_settle_sec)
    }

    pub fn nutrient_pulse(&self) -> Duration {
        Duration::from_millis(self.nutrient_pulse_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Many common relay boards are active-low. If yours is active-high, set false.
    pub active_low: bool,
    pub main_pump_pin: Option<i64>,
    pub aux_pump_pin: Option<i64>,
    /// Either empty (not wired) or exactly one pin per light.
    pub light_pins: Vec<i64>,
    /// Either empty (not wired) or exactly one pin per dosing pump.
    pub dosing_pins: Vec<i64>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            active_low: true,
            main_pump_pin: None,
            aux_pump_pin: None,
            light_pins: Vec::new(),
            dosing_pins: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_policy(&mut errors);
        self.validate_outputs(&mut errors);

        if self.sensors.snapshot_path.trim().is_empty() {
            errors.push("sensors.snapshot_path is empty".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }

        for (key, topic) in [
            ("command_topic", &m.command_topic),
            ("broadcast_topic", &m.broadcast_topic),
        ] {
            if topic.trim().is_empty() {
                errors.push(format!("mqtt.{key} is empty"));
            } else if topic.contains(['+', '#']) {
                errors.push(format!("mqtt.{key} '{topic}' must not contain wildcards"));
            }
        }
        if m.command_topic == m.broadcast_topic {
            errors.push(format!(
                "mqtt.command_topic and mqtt.broadcast_topic are both '{}'",
                m.command_topic
            ));
        }

        if m.keep_alive_sec < 5 {
            errors.push(format!(
                "mqtt.keep_alive_sec must be at least 5, got {}",
                m.keep_alive_sec
            ));
        }
        if m.queue_capacity == 0 {
            errors.push("mqtt.queue_capacity must be positive".into());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;

        if !(10..=1000).contains(&t.loop_interval_ms) {
            errors.push(format!(
                "timing.loop_interval_ms {} out of range [10, 1000]",
                t.loop_interval_ms
            ));
        }
        if t.sensor_interval_ms < 1000 {
            errors.push(format!(
                "timing.sensor_interval_ms must be at least 1000, got {}",
                t.sensor_interval_ms
            ));
        }
        if t.heartbeat_sec == 0 {
            errors.push("timing.heartbeat_sec must be positive".into());
        }
    }

    fn validate_policy(&self, errors: &mut Vec<String>) {
        let p = &self.policy;

        if !(1..=59).contains(&p.main_pump_on_minutes) {
            errors.push(format!(
                "policy.main_pump_on_minutes {} out of range [1, 59]",
                p.main_pump_on_minutes
            ));
        }
        if p.lights_on_from_hour > 23 {
            errors.push(format!(
                "policy.lights_on_from_hour {} out of range [0, 23]",
                p.lights_on_from_hour
            ));
        }
        if p.lights_on_until_hour > 23 {
            errors.push(format!(
                "policy.lights_on_until_hour {} out of range [0, 23]",
                p.lights_on_until_hour
            ));
        }
        if p.lights_on_from_hour > p.lights_on_until_hour {
            errors.push(format!(
                "policy.lights_on_from_hour ({}) is after lights_on_until_hour ({})",
                p.lights_on_from_hour, p.lights_on_until_hour
            ));
        }

        for (key, v) in [
            ("fresh_water_tds_below", p.fresh_water_tds_below),
            ("nutrient_tds_below", p.nutrient_tds_below),
        ] {
            if !v.is_finite() || v <= 0.0 {
                errors.push(format!("policy.{key} must be a positive number, got {v}"));
            }
        }

        if p.nutrient_settle_sec == 0 {
            errors.push("policy.nutrient_settle_sec must be positive".into());
        }
        if p.nutrient_pulse_ms == 0 {
            errors.push("policy.nutrient_pulse_ms must be positive".into());
        }
    }

    fn validate_outputs(&self, errors: &mut Vec<String>) {
        let o = &self.outputs;
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (bank, pins) in [("light_pins", &o.light_pins), ("dosing_pins", &o.dosing_pins)] {
            if !pins.is_empty() && pins.len() != BANK_SIZE {
                errors.push(format!(
                    "outputs.{bank} must list {BANK_SIZE} pins or none, got {}",
                    pins.len()
                ));
            }
        }

        let named = [("main_pump_pin", o.main_pump_pin), ("aux_pump_pin", o.aux_pump_pin)];
        let all = named
            .iter()
            .filter_map(|(k, p)| p.map(|p| (k.to_string(), p)))
            .chain(o.light_pins.iter().enumerate().map(|(i, p)| (format!("light_pins[{i}]"), *p)))
            .chain(o.dosing_pins.iter().enumerate().map(|(i, p)| (format!("dosing_pins[{i}]"), *p)));

        for (ctx, pin) in all {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "outputs.{ctx}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!(
                    "outputs.{ctx}: {pin} is already used by another output"
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// built-in defaults; env overrides are applied either way.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "config file not found, using defaults");
        Config::default()
    };

    config.apply_env()?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

impl Config {
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Ok(port) = env::var("MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {port}"))?;
        }
        if let Ok(path) = env::var("SNAPSHOT_PATH") {
            self.sensors.snapshot_path = path;
        }
        if let Ok(v) = env::var("RELAY_ACTIVE_LOW") {
            self.outputs.active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
