use std::time::Instant;

use seeker_proto::control::{ErrorSnapshot, FailsafeLevel, Setpoint};
use tracing::{info, warn};

use crate::filter::{clamp, deadband, Ema, SlewLimiter};
use crate::mode::ModeConfig;

/// Turns tracking errors into bounded attitude/thrust setpoints.
///
/// Chain per tick: gains, failsafe override of the target, EMA, slew limit,
/// hard clamp, thrust gate. Filter and slew memory live here and nowhere else.
///
/// Any tick without usable input forces the targets to neutral (WARNING).
/// Only when the last usable input is older than the track timeout does the
/// level escalate to FAILSAFE, and leaving it takes `recovery_confirm` of
/// uninterrupted valid input (RECOVERY, still neutral).
#[derive(Debug)]
pub struct SafetyMapper {
    cfg: ModeConfig,
    roll_ema: Ema,
    pitch_ema: Ema,
    thrust_ema: Ema,
    roll_slew: SlewLimiter,
    pitch_slew: SlewLimiter,
    thrust_slew: SlewLimiter,
    level: FailsafeLevel,
    last_valid: Option<Instant>,
    recovering_since: Option<Instant>,
}

impl SafetyMapper {
    pub fn new(cfg: ModeConfig) -> Self {
        Self {
            roll_ema: Ema::new(cfg.ema_alpha),
            pitch_ema: Ema::new(cfg.ema_alpha),
            thrust_ema: Ema::new(cfg.ema_alpha),
            roll_slew: SlewLimiter::new(cfg.max_slew_deg_per_tick),
            pitch_slew: SlewLimiter::new(cfg.max_slew_deg_per_tick),
            thrust_slew: SlewLimiter::new(cfg.max_thrust_slew_per_tick),
            // outputs start at neutral; no input yet is a warning, not a failsafe
            level: FailsafeLevel::Warning,
            last_valid: None,
            recovering_since: None,
            cfg,
        }
    }

    pub fn config(&self) -> &ModeConfig {
        &self.cfg
    }

    pub fn level(&self) -> FailsafeLevel {
        self.level
    }

    /// One control tick. `input` is the newest error snapshot, however old;
    /// staleness is judged here against the mode's track timeout.
    pub fn tick(&mut self, input: Option<&ErrorSnapshot>, now: Instant) -> Setpoint {
        let timeout = self.cfg.track_timeout();
        let usable = input
            .filter(|e| e.lock_valid && now.saturating_duration_since(e.timestamp) <= timeout)
            .map(|e| (e.timestamp, self.raw_targets(e)))
            .filter(|(_, (r, p, t))| r.is_finite() && p.is_finite() && t.is_finite());
        if let Some((at, _)) = usable {
            self.last_valid = Some(at);
        }

        let level = self.escalate(usable.is_some(), input, now);
        let failsafe = level != FailsafeLevel::Nominal;

        let (raw_roll, raw_pitch, raw_thrust) = match usable {
            Some((_, raw)) if !failsafe => raw,
            _ if self.cfg.failsafe_ramp => (0.0, 0.0, 0.0),
            _ => {
                let sp = self.force_neutral(now);
                return Setpoint { failsafe: true, level, ..sp };
            }
        };

        let roll_lim = self.cfg.roll_limit_deg;
        let pitch_lim = self.cfg.pitch_limit_deg;
        let roll = shape(&mut self.roll_ema, &mut self.roll_slew, raw_roll, -roll_lim, roll_lim, failsafe);
        let pitch = shape(&mut self.pitch_ema, &mut self.pitch_slew, raw_pitch, -pitch_lim, pitch_lim, failsafe);

        let thrust = if self.cfg.thrust_enabled {
            shape(&mut self.thrust_ema, &mut self.thrust_slew, raw_thrust, 0.0, self.cfg.thrust_max, failsafe)
        } else {
            self.thrust_ema.reset(0.0);
            self.thrust_slew.set(0.0);
            0.0
        };

        Setpoint { roll, pitch, yaw: 0.0, thrust, failsafe, level, timestamp: now }
    }

    fn escalate(&mut self, valid: bool, input: Option<&ErrorSnapshot>, now: Instant) -> FailsafeLevel {
        use FailsafeLevel::*;

        let last_valid = *self.last_valid.get_or_insert(now);
        let silent = now.saturating_duration_since(last_valid);
        let confirm = self.cfg.recovery_confirm();

        let next = match (self.level, valid) {
            (Nominal | Warning, true) => Nominal,
            (Failsafe, true) => Recovery,
            (Recovery, true) => {
                let since = *self.recovering_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= confirm { Nominal } else { Recovery }
            }
            (Failsafe | Recovery, false) => Failsafe,
            (Nominal | Warning, false) if silent > self.cfg.track_timeout() => Failsafe,
            (Nominal | Warning, false) => Warning,
        };

        match (self.level, next) {
            (Nominal, Warning) => warn!("failsafe: entered ({})", invalid_reason(input, now)),
            (Nominal | Warning, Failsafe) => warn!(
                "failsafe: escalated, no usable input for {} ms ({})",
                silent.as_millis(),
                invalid_reason(input, now)
            ),
            (Failsafe, Recovery) => info!("failsafe: input valid again, confirming for {:?}", confirm),
            (Recovery, Failsafe) => warn!("failsafe: recovery interrupted ({})", invalid_reason(input, now)),
            (Warning | Recovery, Nominal) => info!("failsafe: cleared"),
            _ => {}
        }

        if next != Recovery {
            self.recovering_since = None;
        } else if self.level == Failsafe {
            self.recovering_since = Some(now);
        }
        self.level = next;
        next
    }

    fn raw_targets(&self, e: &ErrorSnapshot) -> (f32, f32, f32) {
        let yaw = deadband(e.yaw_error, self.cfg.yaw_deadband_rad);
        let pitch = deadband(e.pitch_error, self.cfg.pitch_deadband_rad);

        // target right of boresight banks right
        let roll = yaw * self.cfg.yaw_to_roll_gain;
        let pitch = pitch * self.cfg.pitch_gain;

        let thrust = if self.cfg.thrust_enabled && e.depth_valid {
            let range = deadband(e.range_error, self.cfg.range_deadband_m);
            clamp(range * self.cfg.range_to_thrust_gain, 0.0, self.cfg.thrust_max)
        } else {
            0.0
        };
        (roll, pitch, thrust)
    }

    /// Drop every channel to 0 immediately, bypassing the slew limiter.
    pub fn force_neutral(&mut self, now: Instant) -> Setpoint {
        for ema in [&mut self.roll_ema, &mut self.pitch_ema, &mut self.thrust_ema] {
            ema.reset(0.0);
        }
        for slew in [&mut self.roll_slew, &mut self.pitch_slew, &mut self.thrust_slew] {
            slew.set(0.0);
        }
        Setpoint::neutral(now)
    }
}

/// EMA, slew, clamp for one channel. While ramping the neutral target goes to
/// the slew limiter directly and the EMA is parked on the emitted value, so
/// leaving failsafe resumes from where the output is.
fn shape(ema: &mut Ema, slew: &mut SlewLimiter, raw: f32, lo: f32, hi: f32, ramping: bool) -> f32 {
    let target = if ramping { raw } else { ema.update(raw) };
    let out = clamp(slew.update(target), lo, hi);
    slew.set(out);
    if ramping {
        ema.reset(out);
    }
    out
}

fn invalid_reason(input: Option<&ErrorSnapshot>, now: Instant) -> String {
    match input {
        None => "no error input".into(),
        Some(e) if !e.lock_valid => "lock invalid".into(),
        Some(e) if !e.is_finite() => "non-finite errors".into(),
        Some(e) => format!("errors stale for {} ms", now.saturating_duration_since(e.timestamp).as_millis()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn errors(yaw: f32, pitch: f32, range: f32, valid: bool, at: Instant) -> ErrorSnapshot {
        ErrorSnapshot {
            yaw_error: yaw,
            pitch_error: pitch,
            range_error: range,
            track_valid: valid,
            depth_valid: valid,
            lock_valid: valid,
            timestamp: at,
        }
    }

    fn tick_ms(t0: Instant, i: u32) -> Instant {
        t0 + Duration::from_millis(33 * i as u64)
    }

    #[test]
    fn thrust_stays_zero_when_disabled() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut m = SafetyMapper::new(ModeConfig::constrained());
        let t0 = Instant::now();
        for i in 0..500 {
            let now = tick_ms(t0, i);
            let e = errors(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-50.0..100.0), rng.gen_bool(0.8), now);
            assert_eq!(m.tick(Some(&e), now).thrust, 0.0);
        }
    }

    #[test]
    fn per_tick_change_never_exceeds_slew() {
        let mut rng = StdRng::seed_from_u64(42);
        for cfg in [ModeConfig::constrained(), ModeConfig::full_envelope()] {
            let slew = cfg.max_slew_deg_per_tick;
            let mut m = SafetyMapper::new(cfg);
            let t0 = Instant::now();
            let mut prev = Setpoint::neutral(t0);
            for i in 0..1000 {
                let now = tick_ms(t0, i);
                let input = if rng.gen_bool(0.05) {
                    None
                } else {
                    Some(errors(rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0), rng.gen_range(-10.0..40.0), rng.gen_bool(0.7), now))
                };
                let sp = m.tick(input.as_ref(), now);
                assert!((sp.roll - prev.roll).abs() <= slew + 1e-4, "roll step at tick {}", i);
                assert!((sp.pitch - prev.pitch).abs() <= slew + 1e-4, "pitch step at tick {}", i);
                prev = sp;
            }
        }
    }

    #[test]
    fn ramp_reaches_neutral_within_bound() {
        let cfg = ModeConfig::constrained();
        let bound = cfg.ramp_ticks();
        let mut m = SafetyMapper::new(cfg);
        let t0 = Instant::now();
        // saturate both channels
        let mut i = 0;
        while i < 200 {
            let now = tick_ms(t0, i);
            m.tick(Some(&errors(2.0, 2.0, 0.0, true, now)), now);
            i += 1;
        }
        let sat = m.tick(Some(&errors(2.0, 2.0, 0.0, true, tick_ms(t0, i))), tick_ms(t0, i));
        assert_eq!((sat.roll, sat.pitch), (20.0, 10.0));

        let mut sp = sat;
        for k in 1..=bound {
            let now = tick_ms(t0, i + k);
            sp = m.tick(Some(&errors(0.0, 0.0, 0.0, false, now)), now);
            assert!(sp.failsafe);
        }
        assert!(sp.roll.abs() < 1e-4 && sp.pitch.abs() < 1e-4);
    }

    #[test]
    fn snap_mode_goes_neutral_at_once() {
        let cfg = ModeConfig { failsafe_ramp: false, ..ModeConfig::full_envelope() };
        let mut m = SafetyMapper::new(cfg);
        let t0 = Instant::now();
        for i in 0..100 {
            let now = tick_ms(t0, i);
            m.tick(Some(&errors(1.0, 0.5, 20.0, true, now)), now);
        }
        let sp = m.tick(None, tick_ms(t0, 100));
        assert!(sp.is_neutral());
        assert!(sp.failsafe);
    }

    #[test]
    fn loss_of_tracking_converges_after_timeout() {
        // constrained profile, valid tracking then 600 ms of a frozen last-good snapshot
        let cfg = ModeConfig::constrained();
        let ramp = cfg.ramp_ticks();
        let mut m = SafetyMapper::new(cfg);
        let t0 = Instant::now();
        let mut last = errors(0.0, 0.0, 0.0, true, t0);
        for i in 0..100 {
            let now = tick_ms(t0, i);
            last = errors(1.5, -1.0, 0.0, true, now);
            m.tick(Some(&last), now);
        }
        let lost_at = tick_ms(t0, 99);
        let mut sp = Setpoint::neutral(lost_at);
        for k in 1..=((600 / 33) + ramp + 1) {
            let now = lost_at + Duration::from_millis(33 * k as u64);
            sp = m.tick(Some(&last), now);
            if now - lost_at <= Duration::from_millis(500) {
                assert!(!sp.failsafe);
            }
        }
        assert!(sp.failsafe);
        assert!(sp.roll.abs() < 1e-4 && sp.pitch.abs() < 1e-4 && sp.thrust == 0.0);
    }

    #[test]
    fn roll_follows_banking_convention() {
        let mut m = SafetyMapper::new(ModeConfig::constrained());
        let t0 = Instant::now();
        let sp = m.tick(Some(&errors(-0.3, 0.0, 0.0, true, t0)), t0);
        assert!(sp.roll < 0.0, "target left must bank left");

        let mut m = SafetyMapper::new(ModeConfig::constrained());
        let sp = m.tick(Some(&errors(0.3, 0.2, 0.0, true, t0)), t0);
        assert!(sp.roll > 0.0 && sp.pitch > 0.0);
        assert_eq!(sp.yaw, 0.0);
    }

    #[test]
    fn thrust_tracks_range_when_enabled() {
        let mut m = SafetyMapper::new(ModeConfig::full_envelope());
        let t0 = Instant::now();
        let mut sp = Setpoint::neutral(t0);
        for i in 0..300 {
            let now = tick_ms(t0, i);
            sp = m.tick(Some(&errors(0.0, 0.0, 100.0, true, now)), now);
            assert!(sp.thrust <= 0.8);
        }
        assert!((sp.thrust - 0.8).abs() < 1e-3);
    }

    #[test]
    fn single_missed_frame_does_not_escalate() {
        let mut m = SafetyMapper::new(ModeConfig::full_envelope());
        let t0 = Instant::now();
        let mut before = Setpoint::neutral(t0);
        for i in 0..30 {
            let now = tick_ms(t0, i);
            before = m.tick(Some(&errors(0.3, 0.0, 20.0, true, now)), now);
        }
        assert_eq!(m.level(), FailsafeLevel::Nominal);

        let now = tick_ms(t0, 30);
        let dropout = m.tick(Some(&ErrorSnapshot::invalid(now)), now);
        assert!(dropout.failsafe);
        assert_eq!(dropout.level, FailsafeLevel::Warning);
        assert!(!dropout.escalated());

        // back on the next frame, and the output resumes from where it was
        let now = tick_ms(t0, 31);
        let after = m.tick(Some(&errors(0.3, 0.0, 20.0, true, now)), now);
        assert_eq!(after.level, FailsafeLevel::Nominal);
        assert!(!after.failsafe);
        assert!(after.roll >= dropout.roll, "roll dipped to {} after {}", after.roll, dropout.roll);
        assert!((after.roll - before.roll).abs() <= 2.0 * m.config().max_slew_deg_per_tick + 1e-4);
    }

    #[test]
    fn escalates_only_past_track_timeout() {
        let cfg = ModeConfig::full_envelope();
        let timeout = cfg.track_timeout();
        let mut m = SafetyMapper::new(cfg);
        let t0 = Instant::now();
        for i in 0..30 {
            let now = tick_ms(t0, i);
            m.tick(Some(&errors(0.3, 0.1, 20.0, true, now)), now);
        }
        let last_good = tick_ms(t0, 29);
        let mut escalated_at = None;
        for i in 30..60 {
            let now = tick_ms(t0, i);
            let sp = m.tick(Some(&ErrorSnapshot::invalid(now)), now);
            assert!(sp.failsafe);
            if sp.escalated() {
                escalated_at = Some(now - last_good);
                break;
            }
        }
        let after = escalated_at.unwrap();
        assert!(after > timeout && after <= timeout + Duration::from_millis(33), "escalated after {:?}", after);
    }

    #[test]
    fn recovery_needs_confirmation() {
        let cfg = ModeConfig::constrained();
        let confirm = cfg.recovery_confirm();
        let mut m = SafetyMapper::new(cfg);
        let t0 = Instant::now();
        for i in 0..30 {
            let now = tick_ms(t0, i);
            m.tick(None, now);
        }
        assert_eq!(m.level(), FailsafeLevel::Failsafe);

        let back = tick_ms(t0, 30);
        let mut i = 30;
        loop {
            let now = tick_ms(t0, i);
            let sp = m.tick(Some(&errors(0.5, 0.0, 0.0, true, now)), now);
            if now - back < confirm {
                assert_eq!(sp.level, FailsafeLevel::Recovery);
                assert!(sp.failsafe && sp.is_neutral());
            } else {
                assert_eq!(sp.level, FailsafeLevel::Nominal);
                assert!(sp.roll > 0.0);
                break;
            }
            i += 1;
        }

        // a dropout during recovery goes straight back to failsafe
        let mut m = SafetyMapper::new(ModeConfig::constrained());
        for i in 0..30 {
            m.tick(None, tick_ms(t0, i));
        }
        m.tick(Some(&errors(0.5, 0.0, 0.0, true, tick_ms(t0, 30))), tick_ms(t0, 30));
        assert_eq!(m.level(), FailsafeLevel::Recovery);
        let sp = m.tick(Some(&ErrorSnapshot::invalid(tick_ms(t0, 31))), tick_ms(t0, 31));
        assert!(sp.escalated());
    }

    #[test]
    fn non_finite_errors_are_not_followed() {
        let mut m = SafetyMapper::new(ModeConfig::constrained());
        let t0 = Instant::now();
        let mut sp = Setpoint::neutral(t0);
        for i in 0..40 {
            let now = tick_ms(t0, i);
            sp = m.tick(Some(&errors(f32::NAN, f32::INFINITY, 0.0, true, now)), now);
            assert!(sp.failsafe);
        }
        assert!(sp.is_neutral());
        assert!(sp.escalated());

        // errors too large to map never reach the filter
        let mut m = SafetyMapper::new(ModeConfig::constrained());
        for i in 0..40 {
            let now = tick_ms(t0, i);
            sp = m.tick(Some(&errors(1e38, 0.0, 0.0, true, now)), now);
        }
        assert!(sp.roll.is_finite());
    }

    #[test]
    fn force_neutral_resets_state() {
        let mut m = SafetyMapper::new(ModeConfig::full_envelope());
        let t0 = Instant::now();
        for i in 0..50 {
            let now = tick_ms(t0, i);
            m.tick(Some(&errors(1.0, 1.0, 30.0, true, now)), now);
        }
        assert!(m.force_neutral(tick_ms(t0, 50)).is_neutral());
        // next valid tick starts from zero again
        let now = tick_ms(t0, 51);
        let sp = m.tick(Some(&errors(1.0, 1.0, 30.0, true, now)), now);
        assert!(sp.roll <= 2.0 + 1e-4);
    }
}
