//! Autonomous control policy: maps (time of day, sensor readings, dosing
//! timers) to desired actuator states.
//!
//! Everything here is synchronous and clock-free; the caller supplies a
//! [`Tick`] so tests can drive arbitrary times.
//!
//! ## Nutrient pump (dosing 1) pulse machine
//!
//! ```text
//!            main pump ON→OFF: arm cycle (done = false, last_off = now)
//!                                   │
//! Idle ──[eligible]──▶ Active{since} ──[pulse elapsed]──▶ Idle (done = true)
//! ```
//!
//! Eligible means: cycle not done, main pump OFF, settle delay elapsed since
//! the main pump stopped, and TDS known and below the nutrient threshold.

use chrono::{Local, Timelike};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::config::PolicyConfig;
use crate::error::{AgentError, Result};
use crate::state::{DeviceState, BANK_SIZE, FRESH_WATER_PUMP, NUTRIENT_PUMP};

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// The moment a control pass is evaluated: monotonic time for timers, local
/// wall-clock hour/minute for schedules.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tick {
    pub(crate) at: Instant,
    pub(crate) hour: u32,
    pub(crate) minute: u32,
}

impl Tick {
    pub(crate) fn now() -> Self {
        let local = Local::now();
        Self {
            at: Instant::now(),
            hour: local.hour(),
            minute: local.minute(),
        }
    }

    /// Same wall-clock reading, `d` later on the monotonic clock.
    #[cfg(test)]
    pub(crate) fn after(&self, d: std::time::Duration) -> Self {
        Self {
            at: self.at + d,
            ..*self
        }
    }
}

// ---------------------------------------------------------------------------
// Decision functions
// ---------------------------------------------------------------------------

/// Main pump runs for the first `main_pump_on_minutes` of every hour.
pub(crate) fn main_pump_on(minute: u32, cfg: &PolicyConfig) -> bool {
    minute < cfg.main_pump_on_minutes
}

/// Auxiliary pump has no active schedule; the slot is kept for a future
/// duty-cycle controller.
pub(crate) fn aux_pump_on() -> bool {
    false
}

/// All lights on during the day window, all off otherwise.
pub(crate) fn lights_on(hour: u32, cfg: &PolicyConfig) -> [bool; BANK_SIZE] {
    let day = (cfg.lights_on_from_hour..=cfg.lights_on_until_hour).contains(&hour);
    [day; BANK_SIZE]
}

/// Fresh-water top-up while TDS reads below the threshold.
pub(crate) fn fresh_water_on(tds: Option<f64>, cfg: &PolicyConfig) -> bool {
    match require_tds(tds) {
        Ok(tds) => tds < cfg.fresh_water_tds_below,
        Err(e) => {
            trace!("fresh water pump held off: {e}");
            false
        }
    }
}

fn require_tds(tds: Option<f64>) -> Result<f64> {
    tds.ok_or(AgentError::PolicyInputMissing("tds"))
}

// ---------------------------------------------------------------------------
// Nutrient pulse timer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PulsePhase {
    Idle,
    Active { since: Instant },
}

/// Debounce state for the nutrient pump: at most one pulse per main-pump
/// cycle.
#[derive(Debug, Clone)]
pub(crate) struct DosingTimer {
    pub(crate) phase: PulsePhase,
    pub(crate) done_this_cycle: bool,
    pub(crate) main_pump_last_off_at: Option<Instant>,
}

impl Default for DosingTimer {
    fn default() -> Self {
        Self {
            phase: PulsePhase::Idle,
            done_this_cycle: false,
            main_pump_last_off_at: None,
        }
    }
}

impl DosingTimer {
    /// Record a main pump ON→OFF edge: a new cycle begins.
    pub(crate) fn main_pump_stopped(&mut self, at: Instant) {
        self.main_pump_last_off_at = Some(at);
        self.done_this_cycle = false;
    }

    pub(crate) fn pump_active(&self) -> bool {
        matches!(self.phase, PulsePhase::Active { .. })
    }

    fn eligible(&self, main_on: bool, tds: Option<f64>, at: Instant, cfg: &PolicyConfig) -> bool {
        if self.done_this_cycle || main_on {
            return false;
        }
        let settled = self
            .main_pump_last_off_at
            .is_some_and(|off| at.saturating_duration_since(off) >= cfg.nutrient_settle());
        if !settled {
            return false;
        }
        match require_tds(tds) {
            Ok(tds) => tds < cfg.nutrient_tds_below,
            Err(e) => {
                trace!("nutrient pump not eligible: {e}");
                false
            }
        }
    }

    /// Advance the pulse machine one tick and return the pump output.
    pub(crate) fn step(
        &mut self,
        main_on: bool,
        tds: Option<f64>,
        at: Instant,
        cfg: &PolicyConfig,
    ) -> bool {
        match self.phase {
            PulsePhase::Active { since } => {
                let held = at.saturating_duration_since(since);
                if held >= cfg.nutrient_pulse() {
                    self.phase = PulsePhase::Idle;
                    self.done_this_cycle = true;
                    info!(held_ms = held.as_millis() as u64, "nutrient pulse complete");
                    false
                } else {
                    true
                }
            }
            PulsePhase::Idle => {
                if self.eligible(main_on, tds, at, cfg) {
                    self.phase = PulsePhase::Active { since: at };
                    info!(tds = ?tds, "nutrient pulse started");
                    true
                } else {
                    false
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Control pass
// ---------------------------------------------------------------------------

/// Owns the timers that persist between control passes.
pub(crate) struct ControlPolicy {
    cfg: PolicyConfig,
    nutrient: DosingTimer,
    /// Main pump value last driven to the relay: computed by a control pass,
    /// or set by the operator while manual control is active. `None` until
    /// the first pass after startup.
    last_main_on: Option<bool>,
}

impl ControlPolicy {
    pub(crate) fn new(cfg: PolicyConfig) -> Self {
        Self {
            cfg,
            nutrient: DosingTimer::default(),
            last_main_on: None,
        }
    }

    /// Record the main pump value held under manual control, so the first
    /// automatic pass afterwards sees the pump as it really was.
    pub(crate) fn track_manual_main_pump(&mut self, on: bool) {
        self.last_main_on = Some(on);
    }

    #[cfg(test)]
    pub(crate) fn nutrient_timer(&self) -> &DosingTimer {
        &self.nutrient
    }

    /// Compute every actuator for this tick and write it into `state`.
    /// Sensor fields and `manual_control` are read, never written. The main
    /// pump ON→OFF edge is taken against the previous driven value, never
    /// against whatever a command left in `state`.
    pub(crate) fn run(&mut self, state: &mut DeviceState, tick: &Tick) {
        let main_on = main_pump_on(tick.minute, &self.cfg);
        if self.last_main_on == Some(true) && !main_on {
            self.nutrient.main_pump_stopped(tick.at);
            info!(minute = tick.minute, "main pump stopped, nutrient cycle armed");
        }
        self.last_main_on = Some(main_on);
        state.main_flow_on = main_on;

        state.aux_flow_on = aux_pump_on();
        state.lights = lights_on(tick.hour, &self.cfg);

        let mut dosing = [false; BANK_SIZE];
        dosing[FRESH_WATER_PUMP] = fresh_water_on(state.tds, &self.cfg);
        dosing[NUTRIENT_PUMP] = self.nutrient.step(main_on, state.tds, tick.at, &self.cfg);

        if !self.cfg.dosing_enabled {
            dosing[FRESH_WATER_PUMP] = false;
            dosing[NUTRIENT_PUMP] = false;
        }
        state.dosing = dosing;

        debug!(
            hour = tick.hour,
            minute = tick.minute,
            main = main_on,
            dosing = ?state.dosing,
            nutrient_active = self.nutrient.pump_active(),
            "control pass"
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SETTLE: Duration = Duration::from_secs(300);
    const PULSE: Duration = Duration::from_secs(1);

    fn cfg() -> PolicyConfig {
        PolicyConfig::default()
    }

    fn tick(hour: u32, minute: u32) -> Tick {
        Tick {
            at: Instant::now(),
            hour,
            minute,
        }
    }

    /// A timer whose cycle was armed at the returned instant.
    fn armed_timer() -> (DosingTimer, Instant) {
        let armed = Instant::now();
        let mut t = DosingTimer::default();
        t.main_pump_stopped(armed);
        (t, armed)
    }

    // -- main pump -------------------------------------------------------

    #[test]
    fn main_pump_on_during_first_ten_minutes() {
        for minute in 0..10 {
            assert!(main_pump_on(minute, &cfg()), "minute {minute}");
        }
        for minute in 10..60 {
            assert!(!main_pump_on(minute, &cfg()), "minute {minute}");
        }
    }

    #[test]
    fn main_pump_window_follows_config() {
        let cfg = PolicyConfig {
            main_pump_on_minutes: 15,
            ..cfg()
        };
        assert!(main_pump_on(14, &cfg));
        assert!(!main_pump_on(15, &cfg));
    }

    // -- aux pump / lights -----------------------------------------------

    #[test]
    fn aux_pump_always_off() {
        assert!(!aux_pump_on());
    }

    #[test]
    fn lights_on_from_five_through_twenty_three() {
        for hour in 0..5 {
            assert_eq!(lights_on(hour, &cfg()), [false; 4], "hour {hour}");
        }
        for hour in 5..=23 {
            assert_eq!(lights_on(hour, &cfg()), [true; 4], "hour {hour}");
        }
    }

    // -- fresh water -------------------------------------------------------

    #[test]
    fn fresh_water_threshold() {
        assert!(fresh_water_on(Some(85.0), &cfg()));
        assert!(fresh_water_on(Some(0.0), &cfg()));
        assert!(!fresh_water_on(Some(90.0), &cfg()));
        assert!(!fresh_water_on(Some(95.0), &cfg()));
    }

    #[test]
    fn fresh_water_off_when_tds_unset() {
        assert!(!fresh_water_on(None, &cfg()));
    }

    // -- nutrient pulse ----------------------------------------------------

    #[test]
    fn nutrient_idle_before_first_cycle() {
        let mut t = DosingTimer::default();
        assert!(!t.step(false, Some(100.0), Instant::now(), &cfg()));
        assert!(!t.pump_active());
    }

    #[test]
    fn nutrient_waits_for_settle_delay() {
        let (mut t, armed) = armed_timer();
        let now = armed + SETTLE - Duration::from_secs(1);
        assert!(!t.step(false, Some(100.0), now, &cfg()));

        assert!(t.step(false, Some(100.0), now + Duration::from_secs(1), &cfg()));
        assert!(t.pump_active());
    }

    #[test]
    fn nutrient_pulse_lasts_configured_duration() {
        let (mut t, armed) = armed_timer();
        let now = armed + SETTLE;

        assert!(t.step(false, Some(100.0), now, &cfg()));
        assert_eq!(t.phase, PulsePhase::Active { since: now });

        // Still inside the pulse.
        assert!(t.step(false, Some(100.0), now + Duration::from_millis(500), &cfg()));

        // Pulse elapsed: off and done for this cycle.
        assert!(!t.step(false, Some(100.0), now + PULSE, &cfg()));
        assert_eq!(t.phase, PulsePhase::Idle);
        assert!(t.done_this_cycle);
    }

    #[test]
    fn nutrient_fires_once_per_cycle() {
        let (mut t, armed) = armed_timer();
        let now = armed + SETTLE;

        let outputs: Vec<bool> = (0..20)
            .map(|i| t.step(false, Some(100.0), now + Duration::from_millis(250 * i), &cfg()))
            .collect();
        let rising_edges = outputs.windows(2).filter(|w| !w[0] && w[1]).count()
            + usize::from(outputs[0]);
        assert_eq!(rising_edges, 1, "outputs: {outputs:?}");
        assert!(!*outputs.last().unwrap());
    }

    #[test]
    fn nutrient_rearms_on_next_cycle() {
        let (mut t, armed) = armed_timer();
        let now = armed + SETTLE;
        assert!(t.step(false, Some(100.0), now, &cfg()));
        assert!(!t.step(false, Some(100.0), now + PULSE, &cfg()));
        assert!(t.done_this_cycle);

        let next_off = now + Duration::from_secs(3600);
        t.main_pump_stopped(next_off);
        assert!(!t.done_this_cycle);
        assert!(t.step(false, Some(100.0), next_off + SETTLE, &cfg()));
    }

    #[test]
    fn nutrient_never_fires_with_tds_unset() {
        let (mut t, armed) = armed_timer();
        let now = armed + SETTLE * 2;
        for i in 0..10 {
            assert!(!t.step(false, None, now + Duration::from_secs(i), &cfg()));
        }
        assert!(!t.done_this_cycle);
    }

    #[test]
    fn nutrient_blocked_by_high_tds() {
        let (mut t, armed) = armed_timer();
        let now = armed + SETTLE;
        assert!(!t.step(false, Some(700.0), now, &cfg()));
        assert!(t.step(false, Some(699.0), now, &cfg()));
    }

    #[test]
    fn nutrient_blocked_while_main_pump_on() {
        let (mut t, armed) = armed_timer();
        let now = armed + SETTLE;
        assert!(!t.step(true, Some(100.0), now, &cfg()));
    }

    #[test]
    fn nutrient_pulse_completes_even_if_tds_rises() {
        let (mut t, armed) = armed_timer();
        let now = armed + SETTLE;
        assert!(t.step(false, Some(100.0), now, &cfg()));
        assert!(t.step(false, Some(900.0), now + Duration::from_millis(400), &cfg()));
        assert!(!t.step(false, Some(900.0), now + PULSE, &cfg()));
        assert!(t.done_this_cycle);
    }

    // -- ControlPolicy::run ------------------------------------------------

    #[test]
    fn run_sets_schedule_outputs() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState {
            tds: Some(400.0),
            ..DeviceState::default()
        };

        policy.run(&mut st, &tick(12, 5));

        assert!(st.main_flow_on);
        assert!(!st.aux_flow_on);
        assert_eq!(st.lights, [true; 4]);
        assert_eq!(st.dosing, [false; 4]);
    }

    #[test]
    fn run_at_night_turns_lights_off() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState {
            lights: [true, false, true, false],
            ..DeviceState::default()
        };
        policy.run(&mut st, &tick(2, 30));
        assert_eq!(st.lights, [false; 4]);
    }

    #[test]
    fn run_detects_main_pump_off_edge() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState::default();

        let on = tick(8, 9);
        policy.run(&mut st, &on);
        assert!(st.main_flow_on);
        assert_eq!(policy.nutrient_timer().main_pump_last_off_at, None);

        let off = Tick {
            minute: 10,
            ..on.after(Duration::from_secs(60))
        };
        policy.run(&mut st, &off);
        assert!(!st.main_flow_on);
        assert_eq!(policy.nutrient_timer().main_pump_last_off_at, Some(off.at));
        assert!(!policy.nutrient_timer().done_this_cycle);
    }

    #[test]
    fn run_ignores_main_pump_flag_written_outside_policy() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState::default();

        policy.run(&mut st, &tick(8, 30));

        // A command merged between passes flips the flag the policy last wrote.
        st.main_flow_on = true;
        policy.run(&mut st, &tick(8, 31));

        assert!(!st.main_flow_on);
        assert_eq!(policy.nutrient_timer().main_pump_last_off_at, None);
    }

    #[test]
    fn run_first_pass_after_startup_does_not_arm() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState {
            main_flow_on: true,
            ..DeviceState::default()
        };
        policy.run(&mut st, &tick(8, 30));
        assert_eq!(policy.nutrient_timer().main_pump_last_off_at, None);
    }

    #[test]
    fn run_arms_after_manual_main_pump_on() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState::default();

        policy.track_manual_main_pump(true);
        let resume = tick(8, 30);
        policy.run(&mut st, &resume);

        assert_eq!(policy.nutrient_timer().main_pump_last_off_at, Some(resume.at));
    }

    #[test]
    fn run_without_edge_does_not_rearm() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState::default();

        policy.run(&mut st, &tick(8, 30));
        policy.run(&mut st, &tick(8, 31));
        assert_eq!(policy.nutrient_timer().main_pump_last_off_at, None);
    }

    #[test]
    fn run_full_cycle_doses_once() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState {
            tds: Some(500.0),
            ..DeviceState::default()
        };

        let start = tick(8, 9);
        policy.run(&mut st, &start);

        let off_at = Tick {
            minute: 10,
            ..start.after(Duration::from_secs(60))
        };
        policy.run(&mut st, &off_at);
        assert!(!st.dosing[NUTRIENT_PUMP]);

        let fire = Tick {
            minute: 15,
            ..off_at.after(SETTLE)
        };
        policy.run(&mut st, &fire);
        assert!(st.dosing[NUTRIENT_PUMP]);

        let stop = fire.after(PULSE);
        policy.run(&mut st, &stop);
        assert!(!st.dosing[NUTRIENT_PUMP]);

        let later = Tick {
            minute: 30,
            ..stop.after(Duration::from_secs(900))
        };
        policy.run(&mut st, &later);
        assert!(!st.dosing[NUTRIENT_PUMP]);
    }

    #[test]
    fn run_fresh_water_follows_tds() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState {
            tds: Some(95.0),
            ..DeviceState::default()
        };
        policy.run(&mut st, &tick(12, 30));
        assert!(!st.dosing[FRESH_WATER_PUMP]);

        st.tds = Some(85.0);
        policy.run(&mut st, &tick(12, 30));
        assert!(st.dosing[FRESH_WATER_PUMP]);
    }

    #[test]
    fn run_reserved_dosing_slots_forced_off() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState {
            dosing: [false, false, true, true],
            aux_flow_on: true,
            ..DeviceState::default()
        };
        policy.run(&mut st, &tick(12, 30));
        assert!(!st.dosing[2]);
        assert!(!st.dosing[3]);
        assert!(!st.aux_flow_on);
    }

    #[test]
    fn run_leaves_sensor_fields_alone() {
        let mut policy = ControlPolicy::new(cfg());
        let mut st = DeviceState {
            tds: Some(50.0),
            temperature: Some(18.0),
            ph: Some(6.4),
            ..DeviceState::default()
        };
        policy.run(&mut st, &tick(12, 30));
        assert_eq!(st.tds, Some(50.0));
        assert_eq!(st.temperature, Some(18.0));
        assert_eq!(st.ph, Some(6.4));
    }

    #[test]
    fn dosing_disabled_forces_pumps_off_but_timer_advances() {
        let mut policy = ControlPolicy::new(PolicyConfig {
            dosing_enabled: false,
            ..cfg()
        });
        let mut st = DeviceState {
            tds: Some(50.0),
            ..DeviceState::default()
        };

        let on = tick(9, 9);
        policy.run(&mut st, &on);
        let off = Tick {
            minute: 10,
            ..on.after(Duration::from_secs(60))
        };
        policy.run(&mut st, &off);
        assert!(!st.dosing[FRESH_WATER_PUMP]);

        let fire = Tick {
            minute: 15,
            ..off.after(SETTLE)
        };
        policy.run(&mut st, &fire);
        assert!(!st.dosing[NUTRIENT_PUMP]);
        assert!(policy.nutrient_timer().pump_active());
    }
}
