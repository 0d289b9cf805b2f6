//! High-resolution tick clock.
//!
//! [`HighResClock`] drives the whole engine: a dedicated thread emits
//! [`TickEvent`]s at `PPQ` pulses per quarter note, scheduling each
//! tick against an absolute target chain so timing error never
//! compounds. Swing delays the ticks of odd 16th-note groups without
//! shifting the chain itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default pulses per quarter note (MIDI clock rate).
pub const DEFAULT_PPQ: u32 = 24;

/// Period of the slow BPM modulation driven by the `drift` parameter.
const DRIFT_PERIOD_SECS: f64 = 120.0;

/// Ticks later than this get the target chain re-anchored instead of
/// being caught up one by one.
const REANCHOR_THRESHOLD: Duration = Duration::from_millis(50);

/// Longest single sleep; keeps `stop()` responsive at very low BPM.
const MAX_SLEEP_CHUNK: Duration = Duration::from_millis(25);

/// One clock tick.
#[derive(Clone, Copy, Debug)]
pub struct TickEvent {
    /// Monotonically increasing tick index, starting at 0.
    pub tick: u64,
    /// When the tick actually fired.
    pub timestamp: Instant,
    /// Effective BPM at this tick (transitions and drift applied).
    pub bpm: f64,
    /// Swing setting at this tick.
    pub swing: f64,
    /// True when this tick was delayed by swing.
    pub swing_applied: bool,
}

/// A linear BPM ramp in progress.
#[derive(Clone, Copy, Debug)]
struct BpmTransition {
    start_bpm: f64,
    end_bpm: f64,
    started: Instant,
    duration: Duration,
}

struct ClockShared {
    bpm: f64,
    swing: f64,
    drift: f64,
    transition: Option<BpmTransition>,
}

/// Monotonic tick generator with drift correction and swing.
///
/// Reconfiguration (`set_bpm`, `set_swing`, `set_drift`,
/// `start_bpm_transition`) takes effect on the next scheduled tick;
/// the pending tick is not retimed.
pub struct HighResClock {
    ppq: u32,
    shared: Arc<Mutex<ClockShared>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HighResClock {
    pub fn new(bpm: f64, ppq: u32, swing: f64) -> Self {
        Self {
            ppq: ppq.max(4),
            shared: Arc::new(Mutex::new(ClockShared {
                bpm: bpm.clamp(1.0, 300.0),
                swing: swing.clamp(0.0, 0.5),
                drift: 0.0,
                transition: None,
            })),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn ppq(&self) -> u32 {
        self.ppq
    }

    /// The configured base BPM (transition target if one is active).
    pub fn bpm(&self) -> f64 {
        let shared = self.shared.lock().unwrap();
        match shared.transition {
            Some(t) => t.end_bpm,
            None => shared.bpm,
        }
    }

    pub fn swing(&self) -> f64 {
        self.shared.lock().unwrap().swing
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Set the BPM, cancelling any transition in progress.
    pub fn set_bpm(&self, bpm: f64) {
        let mut shared = self.shared.lock().unwrap();
        shared.bpm = bpm.clamp(1.0, 300.0);
        shared.transition = None;
    }

    pub fn set_swing(&self, swing: f64) {
        self.shared.lock().unwrap().swing = swing.clamp(0.0, 0.5);
    }

    pub fn set_drift(&self, drift: f64) {
        self.shared.lock().unwrap().drift = drift.clamp(-0.2, 0.2);
    }

    /// Ramp linearly from `start_bpm` to `end_bpm` over
    /// `duration_seconds`, recomputing each tick's interval from the
    /// interpolated value.
    pub fn start_bpm_transition(&self, start_bpm: f64, end_bpm: f64, duration_seconds: f64) {
        let mut shared = self.shared.lock().unwrap();
        if duration_seconds <= 0.0 {
            shared.bpm = end_bpm.clamp(1.0, 300.0);
            shared.transition = None;
            return;
        }
        shared.transition = Some(BpmTransition {
            start_bpm: start_bpm.clamp(1.0, 300.0),
            end_bpm: end_bpm.clamp(1.0, 300.0),
            started: Instant::now(),
            duration: Duration::from_secs_f64(duration_seconds),
        });
    }

    /// Start the clock thread. Ticks are delivered to `on_tick` on the
    /// clock thread itself.
    pub fn start<F>(&mut self, mut on_tick: F)
    where
        F: FnMut(TickEvent) + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = self.shared.clone();
        let running = self.running.clone();
        let ppq = self.ppq;

        let handle = thread::Builder::new()
            .name("nocturne-clock".to_string())
            .spawn(move || {
                let start = Instant::now();
                let sixteenth_ticks = (ppq / 4).max(1) as u64;
                let mut tick: u64 = 0;
                let mut target = start;

                log::info!("clock_started ppq={ppq}");

                while running.load(Ordering::Relaxed) {
                    let (bpm, swing) = effective_params(&shared, start);
                    let interval = Duration::from_secs_f64(60.0 / (bpm * ppq as f64));
                    target += interval;

                    // Odd 16th-note groups are delayed by a fraction of
                    // a 16th; the target chain itself stays straight so
                    // swing never accumulates.
                    let swing_applied = swing > 0.0 && (tick / sixteenth_ticks) % 2 == 1;
                    let emit_at = if swing_applied {
                        target + interval.mul_f64(swing * sixteenth_ticks as f64)
                    } else {
                        target
                    };

                    if !sleep_until(&running, emit_at) {
                        break;
                    }

                    let now = Instant::now();
                    if now > target + REANCHOR_THRESHOLD {
                        log::warn!(
                            "clock_reanchored tick={tick} late_ms={}",
                            (now - target).as_millis()
                        );
                        target = now;
                    }

                    on_tick(TickEvent {
                        tick,
                        timestamp: now,
                        bpm,
                        swing,
                        swing_applied,
                    });
                    tick += 1;
                }

                log::info!("clock_stopped ticks={tick}");
            })
            .expect("failed to spawn clock thread");

        self.handle = Some(handle);
    }

    /// Stop the clock and join its thread. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HighResClock {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Current (bpm, swing), resolving any active transition and applying
/// the drift modulation.
fn effective_params(shared: &Arc<Mutex<ClockShared>>, clock_start: Instant) -> (f64, f64) {
    let mut shared = shared.lock().unwrap();

    let base_bpm = match shared.transition {
        Some(t) => {
            let elapsed = t.started.elapsed();
            if elapsed >= t.duration {
                shared.bpm = t.end_bpm;
                shared.transition = None;
                t.end_bpm
            } else {
                let frac = elapsed.as_secs_f64() / t.duration.as_secs_f64();
                t.start_bpm + (t.end_bpm - t.start_bpm) * frac
            }
        }
        None => shared.bpm,
    };

    let bpm = if shared.drift.abs() > f64::EPSILON {
        let phase = clock_start.elapsed().as_secs_f64() / DRIFT_PERIOD_SECS;
        (base_bpm * (1.0 + shared.drift * (phase * std::f64::consts::TAU).sin())).clamp(1.0, 300.0)
    } else {
        base_bpm
    };

    (bpm, shared.swing)
}

/// Sleep in interruptible chunks until `deadline`, spinning for the
/// final stretch to keep per-tick jitter small. Returns false when the
/// run flag was cleared.
fn sleep_until(running: &AtomicBool, deadline: Instant) -> bool {
    const SPIN_WINDOW: Duration = Duration::from_micros(500);

    loop {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let remaining = deadline - now;
        if remaining > SPIN_WINDOW {
            thread::sleep((remaining - SPIN_WINDOW).min(MAX_SLEEP_CHUNK));
        } else {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_tick_cadence_at_120_bpm() {
        // 120 BPM at PPQ 24 is one tick every ~20.8 ms.
        let mut clock = HighResClock::new(120.0, 24, 0.0);
        let (tx, rx) = mpsc::channel();
        clock.start(move |tick| {
            let _ = tx.send(tick);
        });
        thread::sleep(Duration::from_millis(220));
        clock.stop();

        let ticks: Vec<TickEvent> = rx.try_iter().collect();
        assert!(
            (6..=14).contains(&ticks.len()),
            "unexpected tick count {}",
            ticks.len()
        );
        for (i, tick) in ticks.iter().enumerate() {
            assert_eq!(tick.tick, i as u64);
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut clock = HighResClock::new(120.0, 24, 0.0);
        clock.start(|_| {});
        clock.stop();
        clock.stop();
        assert!(!clock.is_running());
    }

    #[test]
    fn test_stop_is_prompt_at_minimum_bpm() {
        // One tick every 2.5 s at BPM 1; stop must not wait for it.
        let mut clock = HighResClock::new(1.0, 24, 0.0);
        clock.start(|_| {});
        thread::sleep(Duration::from_millis(30));
        let begun = Instant::now();
        clock.stop();
        assert!(begun.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_swing_flags_odd_sixteenth_groups() {
        let mut clock = HighResClock::new(300.0, 24, 0.3);
        let (tx, rx) = mpsc::channel();
        clock.start(move |tick| {
            let _ = tx.send(tick);
        });
        thread::sleep(Duration::from_millis(200));
        clock.stop();

        let ticks: Vec<TickEvent> = rx.try_iter().collect();
        assert!(ticks.len() > 12, "need at least two 16th groups");
        for tick in &ticks {
            let expected = (tick.tick / 6) % 2 == 1;
            assert_eq!(tick.swing_applied, expected, "tick {}", tick.tick);
        }
    }

    #[test]
    fn test_swing_delay_is_fraction_of_sixteenth() {
        // At swing 0.5 the odd 16ths land exactly halfway into the
        // following 16th: tick 6 fires 3 tick-intervals late.
        let mut clock = HighResClock::new(240.0, 24, 0.5);
        let (tx, rx) = mpsc::channel();
        clock.start(move |tick| {
            let _ = tx.send(tick);
        });
        thread::sleep(Duration::from_millis(300));
        clock.stop();

        let ticks: Vec<TickEvent> = rx.try_iter().collect();
        let t0 = ticks.iter().find(|t| t.tick == 0).unwrap();
        let t6 = ticks.iter().find(|t| t.tick == 6).unwrap();
        let t12 = ticks.iter().find(|t| t.tick == 12).unwrap();

        let interval = 60.0 / (240.0 * 24.0);
        // Unswung gap 0->12 is 12 intervals; swung tick 6 sits at
        // 6 + 3 intervals after tick 0.
        let gap_06 = t6.timestamp.duration_since(t0.timestamp).as_secs_f64();
        let gap_0_12 = t12.timestamp.duration_since(t0.timestamp).as_secs_f64();
        assert!((gap_0_12 - 12.0 * interval).abs() < 0.008, "chain shifted: {gap_0_12}");
        assert!((gap_06 - 9.0 * interval).abs() < 0.008, "swing offset wrong: {gap_06}");
    }

    #[test]
    fn test_bpm_transition_completes() {
        let mut clock = HighResClock::new(120.0, 24, 0.0);
        let (tx, rx) = mpsc::channel();
        clock.start(move |tick| {
            let _ = tx.send(tick.bpm);
        });
        clock.start_bpm_transition(120.0, 240.0, 0.05);
        thread::sleep(Duration::from_millis(200));
        clock.stop();

        assert!((clock.bpm() - 240.0).abs() < 0.001);
        let bpms: Vec<f64> = rx.try_iter().collect();
        assert!(bpms.last().map(|b| (*b - 240.0).abs() < 0.001).unwrap_or(false));
    }

    #[test]
    fn test_setters_clamp() {
        let clock = HighResClock::new(120.0, 24, 0.0);
        clock.set_bpm(1000.0);
        assert!((clock.bpm() - 300.0).abs() < 0.001);
        clock.set_bpm(0.0);
        assert!((clock.bpm() - 1.0).abs() < 0.001);
        clock.set_swing(0.9);
        assert!((clock.swing() - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_maximum_bpm_runs_without_overrun() {
        let mut clock = HighResClock::new(300.0, 24, 0.0);
        let (tx, rx) = mpsc::channel();
        clock.start(move |tick| {
            let _ = tx.send(tick.tick);
        });
        thread::sleep(Duration::from_millis(150));
        clock.stop();

        let ticks: Vec<u64> = rx.try_iter().collect();
        // ~8.3 ms per tick; expect a healthy stream with no gaps.
        assert!(ticks.len() > 8);
        for window in ticks.windows(2) {
            assert_eq!(window[1], window[0] + 1);
        }
    }
}
