//! Transport clock for cycle-based scheduling.
//!
//! - [`CycleClock`] - play/pause/stop/hush state and cycle position
//! - [`SharedTransport`] - the handle shared by the server, the evaluator and the relay
//!
//! The clock keeps an anchor point (cycle position at a specific instant and
//! wall-clock time) and uses cps to derive positions and deadlines elsewhere.

use rosc::OscTime;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default tempo, in cycles per second.
pub const DEFAULT_CPS: f64 = 0.5;

/// Offset between the NTP era (1900) and the Unix epoch, in seconds.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Point-in-time view of the transport, as broadcast in `status`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportSnapshot {
    pub playing: bool,
    pub cycle: f64,
    pub cps: f64,
}

#[derive(Clone, Debug)]
pub struct CycleClock {
    cps: f64,
    playing: bool,
    anchor_instant: Instant,
    anchor_system: SystemTime,
    anchor_cycle: f64,
    /// Bumped by every hush so in-flight work can tell it was preempted.
    hush_generation: u64,
}

impl Default for CycleClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleClock {
    /// Create a stopped clock at cycle 0 and the default tempo.
    pub fn new() -> Self {
        Self {
            cps: DEFAULT_CPS,
            playing: false,
            anchor_instant: Instant::now(),
            anchor_system: SystemTime::now(),
            anchor_cycle: 0.0,
            hush_generation: 0,
        }
    }

    fn reanchor(&mut self, now: Instant) {
        let cycle = self.cycle_at(now);
        let drift = now.saturating_duration_since(self.anchor_instant);
        self.anchor_system += drift;
        self.anchor_instant = now;
        self.anchor_cycle = cycle;
    }

    /// Set the tempo, preserving the current cycle position.
    pub fn set_cps(&mut self, cps: f64, now: Instant) {
        if !cps.is_finite() || cps <= 0.0 {
            log::warn!("[TRANSPORT] Ignoring invalid cps {}", cps);
            return;
        }
        self.reanchor(now);
        self.cps = cps;
    }

    pub fn cps(&self) -> f64 {
        self.cps
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn hush_generation(&self) -> u64 {
        self.hush_generation
    }

    pub fn play(&mut self, now: Instant) {
        if self.playing {
            return;
        }
        self.reanchor(now);
        self.playing = true;
    }

    /// Stop advancing, keeping the current position.
    pub fn pause(&mut self, now: Instant) {
        self.reanchor(now);
        self.playing = false;
    }

    /// Stop and rewind to cycle 0.
    pub fn stop(&mut self, now: Instant) {
        self.reanchor(now);
        self.playing = false;
        self.anchor_cycle = 0.0;
    }

    /// Stop, rewind, and preempt anything evaluated before this call.
    pub fn hush(&mut self, now: Instant) {
        self.stop(now);
        self.hush_generation += 1;
    }

    /// Cycle position at `time`.
    pub fn cycle_at(&self, time: Instant) -> f64 {
        if !self.playing || time <= self.anchor_instant {
            return self.anchor_cycle;
        }
        let elapsed = time.duration_since(self.anchor_instant).as_secs_f64();
        self.anchor_cycle + elapsed * self.cps
    }

    /// Wall-clock time at which `cycle` sounds: epoch + cycle / cps.
    pub fn deadline(&self, cycle: f64) -> SystemTime {
        let offset = (cycle - self.anchor_cycle) / self.cps;
        if offset >= 0.0 {
            self.anchor_system + Duration::from_secs_f64(offset)
        } else {
            self.anchor_system
                .checked_sub(Duration::from_secs_f64(-offset))
                .unwrap_or(UNIX_EPOCH)
        }
    }

    /// Wall-clock time of cycle 0 at the current tempo.
    pub fn epoch(&self) -> SystemTime {
        self.deadline(0.0)
    }

    pub fn snapshot(&self, now: Instant) -> TransportSnapshot {
        TransportSnapshot {
            playing: self.playing,
            cycle: self.cycle_at(now),
            cps: self.cps,
        }
    }
}

/// Convert a wall-clock time to an OSC (NTP) time tag.
pub fn system_time_to_osc(time: SystemTime) -> OscTime {
    let elapsed = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    let ntp_seconds_total = elapsed.as_secs() + NTP_UNIX_OFFSET;
    let ntp_seconds = (ntp_seconds_total % (u32::MAX as u64 + 1)) as u32;
    let fractional = ((elapsed.subsec_nanos() as u64) << 32) / 1_000_000_000u64;
    OscTime::from((ntp_seconds, fractional as u32))
}

/// Cloneable handle to one transport shared across tasks and threads.
#[derive(Clone, Debug, Default)]
pub struct SharedTransport {
    inner: Arc<Mutex<CycleClock>>,
}

impl SharedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CycleClock> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `f` with exclusive access to the clock.
    pub fn with<R>(&self, f: impl FnOnce(&mut CycleClock) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        self.lock().snapshot(Instant::now())
    }

    pub fn is_playing(&self) -> bool {
        self.lock().is_playing()
    }

    pub fn cps(&self) -> f64 {
        self.lock().cps()
    }

    pub fn hush_generation(&self) -> u64 {
        self.lock().hush_generation()
    }

    pub fn deadline(&self, cycle: f64) -> SystemTime {
        self.lock().deadline(cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs_between(a: SystemTime, b: SystemTime) -> f64 {
        match b.duration_since(a) {
            Ok(d) => d.as_secs_f64(),
            Err(e) => -e.duration().as_secs_f64(),
        }
    }

    #[test]
    fn test_cycle_advances_only_while_playing() {
        let mut clock = CycleClock::new();
        let t0 = Instant::now();
        assert_eq!(clock.cycle_at(t0 + Duration::from_secs(4)), 0.0);

        clock.set_cps(1.0, t0);
        clock.play(t0);
        let c = clock.cycle_at(t0 + Duration::from_millis(1500));
        assert!((c - 1.5).abs() < 1e-9);

        clock.pause(t0 + Duration::from_secs(2));
        let c = clock.cycle_at(t0 + Duration::from_secs(10));
        assert!((c - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_cps_preserves_position() {
        let mut clock = CycleClock::new();
        let t0 = Instant::now();
        clock.set_cps(1.0, t0);
        clock.play(t0);
        clock.set_cps(2.0, t0 + Duration::from_secs(1));
        let c = clock.cycle_at(t0 + Duration::from_secs(2));
        assert!((c - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_cps_is_ignored() {
        let mut clock = CycleClock::new();
        clock.set_cps(0.0, Instant::now());
        clock.set_cps(f64::NAN, Instant::now());
        assert_eq!(clock.cps(), DEFAULT_CPS);
    }

    #[test]
    fn test_stop_rewinds_and_hush_bumps_generation() {
        let mut clock = CycleClock::new();
        let t0 = Instant::now();
        clock.play(t0);
        clock.stop(t0 + Duration::from_secs(3));
        assert_eq!(clock.cycle_at(t0 + Duration::from_secs(5)), 0.0);
        assert_eq!(clock.hush_generation(), 0);

        clock.play(t0 + Duration::from_secs(5));
        clock.hush(t0 + Duration::from_secs(6));
        assert!(!clock.is_playing());
        assert_eq!(clock.hush_generation(), 1);
    }

    #[test]
    fn test_deadline_is_epoch_plus_cycle_over_cps() {
        let mut clock = CycleClock::new();
        let t0 = Instant::now();
        clock.set_cps(0.5, t0);
        clock.play(t0);

        let epoch = clock.epoch();
        let d = clock.deadline(3.0);
        assert!((secs_between(epoch, d) - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_osc_time_conversion() {
        let t = UNIX_EPOCH + Duration::from_millis(1500);
        let tag = system_time_to_osc(t);
        assert_eq!(tag.seconds, NTP_UNIX_OFFSET as u32 + 1);
        let half = (1u64 << 31) as u32;
        assert!((tag.fractional as i64 - half as i64).abs() < 2);
    }

    #[test]
    fn test_shared_transport_is_shared() {
        let a = SharedTransport::new();
        let b = a.clone();
        a.with(|c| c.play(Instant::now()));
        assert!(b.is_playing());
        b.with(|c| c.hush(Instant::now()));
        assert!(!a.is_playing());
        assert_eq!(a.hush_generation(), 1);
    }
}
