//! Emulation speed estimation from sample-push cadence.
//!
//! Ticks are samples, updates are pushes: the counter records the wall-clock
//! delta between consecutive pushes and compares it against the delta a
//! full-speed emulation would have produced. Producers call [`update`] and
//! [`cache_average_speed`]; the audio thread only ever reads the cached
//! atomics, so it never blocks.
//!
//! [`update`]: SpeedCounter::update
//! [`cache_average_speed`]: SpeedCounter::cache_average_speed

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::atomic::AtomicF64;
use crate::time::Clock;

const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Producer-side state, behind a mutex that is only ever taken on the
/// producer path (push entry points, save-state load). Nothing the audio
/// callback reads lives in here.
struct Window {
    /// Wall-clock delta of each retained update, newest last.
    deltas: VecDeque<f64>,
    /// Max total time the deltas may span.
    average_time: f64,
    ticks_per_update: f64,
    ticks_per_sec: f64,
    last_paused_at: u64,
}

pub struct SpeedCounter {
    clock: std::sync::Arc<dyn Clock>,
    window: Mutex<Window>,
    last_update_at: AtomicU64,
    /// Expected wall-clock time between two full-speed updates.
    target_delta: AtomicF64,
    cached_last_delta: AtomicF64,
    // Two cached rolling averages: the full window, and one restricted to
    // the recent custom-speed period.
    cached_average: AtomicF64,
    cached_average_len: AtomicU32,
    alt_cached_average: AtomicF64,
    alt_cached_average_len: AtomicU32,
    paused: AtomicBool,
}

impl SpeedCounter {
    pub fn new(
        average_time: f64,
        ticks_per_sec: f64,
        ticks_per_update: f64,
        clock: std::sync::Arc<dyn Clock>,
    ) -> Self {
        let ticks_per_sec = ticks_per_sec.max(1.0);
        let ticks_per_update = ticks_per_update.max(1.0);
        let target_delta = ticks_per_update / ticks_per_sec;
        let now = clock.now_micros();
        Self {
            clock,
            window: Mutex::new(Window {
                deltas: VecDeque::new(),
                average_time,
                ticks_per_update,
                ticks_per_sec,
                last_paused_at: 0,
            }),
            last_update_at: AtomicU64::new(now),
            target_delta: AtomicF64::new(target_delta),
            cached_last_delta: AtomicF64::new(-1.0),
            cached_average: AtomicF64::new(0.0),
            cached_average_len: AtomicU32::new(0),
            alt_cached_average: AtomicF64::new(0.0),
            alt_cached_average_len: AtomicU32::new(0),
            paused: AtomicBool::new(false),
        }
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seconds elapsed since `old_micros`.
    fn delta_since(&self, old_micros: u64) -> f64 {
        self.clock.now_micros().wrapping_sub(old_micros) as f64 / MICROS_PER_SEC
    }

    /// Recompute the target delta after a rate change, rescaling retained
    /// deltas so the reported speed stays continuous.
    fn apply_rates(&self, window: &mut Window) {
        let prev = self.target_delta.load(Ordering::Relaxed);
        let target = window.ticks_per_update / window.ticks_per_sec;
        self.target_delta.store(target, Ordering::Relaxed);
        let relative_change = target / prev;
        for delta in window.deltas.iter_mut() {
            *delta *= relative_change;
        }
    }

    /// Restart the window. With `simulate_full_speed` the window is
    /// pre-filled as if the emulation had been running at full speed, so the
    /// first real reads don't report garbage.
    pub fn start(&self, simulate_full_speed: bool) {
        let mut window = self.lock_window();
        self.last_update_at
            .store(self.clock.now_micros(), Ordering::Relaxed);
        window.deltas.clear();
        let target = self.target_delta.load(Ordering::Relaxed);
        if simulate_full_speed {
            self.cached_last_delta.store(target, Ordering::Relaxed);
            let len = ((window.average_time / target) as usize).max(1);
            window.deltas.resize(len, target);
        } else {
            self.cached_last_delta.store(-1.0, Ordering::Relaxed);
        }
    }

    /// Record one push of `elapsed_ticks` samples.
    pub fn update(&self, elapsed_ticks: f64) {
        let mut window = self.lock_window();
        if elapsed_ticks != window.ticks_per_update {
            window.ticks_per_update = elapsed_ticks.max(1.0);
            self.apply_rates(&mut window);
        }

        let now = self.clock.now_micros();
        let delta =
            now.wrapping_sub(self.last_update_at.swap(now, Ordering::Relaxed)) as f64
                / MICROS_PER_SEC;
        // A delta of exactly 0 would simply be ignored by the readers
        self.cached_last_delta.store(delta, Ordering::Relaxed);

        // Drop deltas that have fallen out of the averaging window
        let mut total = delta;
        for i in (0..window.deltas.len()).rev() {
            total += window.deltas[i];
            if total > window.average_time {
                window.deltas.drain(..=i);
                break;
            }
        }
        window.deltas.push_back(delta);
    }

    /// Most recent observed speed ratio.
    ///
    /// With `*predict` set, a push that is already overdue is treated as an
    /// ongoing slowdown instead of waiting for it to land; `*predict` is
    /// cleared when no prediction was needed. Lock-free.
    pub fn last_speed(&self, predict: &mut bool, simulate_full_speed: bool) -> f64 {
        let target = self.target_delta.load(Ordering::Relaxed);
        if *predict {
            let delta = self.delta_since(self.last_update_at.load(Ordering::Relaxed));
            if delta > target {
                return target / delta;
            }
            *predict = false;
        }

        let last = self.cached_last_delta.load(Ordering::Relaxed);
        if last > 0.0 {
            return target / last;
        }
        if simulate_full_speed { 1.0 } else { 0.0 }
    }

    /// Windowed average recomputed from the retained deltas. Takes the
    /// producer lock; not for the audio thread (it reads the cached form).
    pub fn average_speed(
        &self,
        predict: bool,
        simulate_full_speed: bool,
        max_average_time: f64,
    ) -> f64 {
        let window = self.lock_window();
        let target = self.target_delta.load(Ordering::Relaxed);
        let mut total = 0.0;
        let mut len = 0u32;

        if predict {
            let delta = self.delta_since(self.last_update_at.load(Ordering::Relaxed));
            if delta > target {
                total += delta;
                len += 1;
            }
        }

        for delta in window.deltas.iter().rev() {
            total += delta;
            len += 1;
            // Accept the last one even if it went over the limit, there is
            // always at least one delta worth of history
            if max_average_time >= 0.0 && total > max_average_time {
                break;
            }
        }

        if len == 0 {
            return if simulate_full_speed { 1.0 } else { 0.0 };
        }
        target / (total / f64::from(len))
    }

    /// Lock-free read of the cached windowed average.
    pub fn cached_average_speed(
        &self,
        alternative: bool,
        predict: bool,
        simulate_full_speed: bool,
    ) -> f64 {
        let (mut total, mut len) = if alternative {
            (
                self.alt_cached_average.load(Ordering::Relaxed),
                self.alt_cached_average_len.load(Ordering::Relaxed) as i64,
            )
        } else {
            (
                self.cached_average.load(Ordering::Relaxed),
                self.cached_average_len.load(Ordering::Relaxed) as i64,
            )
        };
        let target = self.target_delta.load(Ordering::Relaxed);

        if predict {
            let delta = self.delta_since(self.last_update_at.load(Ordering::Relaxed));
            if delta > target {
                // The overdue push replaces the weight of as many old deltas
                // as it spans, so a long stall doesn't get averaged away
                let times_over = (delta / target) as i64;
                total *= (len - times_over).max(1) as f64 / len.max(1) as f64;
                len = (len - times_over).max(1);

                total += delta;
                len += 1;
            }
        }
        if len == 0 {
            return if simulate_full_speed { 1.0 } else { 0.0 };
        }
        target / (total / len as f64)
    }

    /// Recompute one of the cached averages. Producer path only.
    ///
    /// `max_average_time < 0` uses the whole retained window.
    pub fn cache_average_speed(&self, alternative: bool, max_average_time: f64) {
        let window = self.lock_window();
        let mut total = 0.0;
        let mut len = 0u32;
        for delta in window.deltas.iter().rev() {
            total += delta;
            len += 1;
            if max_average_time >= 0.0 && total > max_average_time {
                break;
            }
        }
        if alternative {
            self.alt_cached_average.store(total, Ordering::Relaxed);
            self.alt_cached_average_len.store(len, Ordering::Relaxed);
        } else {
            self.cached_average.store(total, Ordering::Relaxed);
            self.cached_average_len.store(len, Ordering::Relaxed);
        }
    }

    /// Freeze updates; on resume the reference timestamp is re-based so the
    /// paused span doesn't read as a slowdown.
    pub fn set_paused(&self, paused: bool) {
        if paused == self.paused.load(Ordering::Relaxed) {
            return;
        }
        let mut window = self.lock_window();
        self.paused.store(paused, Ordering::Relaxed);
        if paused {
            window.last_paused_at = self.clock.now_micros();
        } else {
            let elapsed = self.clock.now_micros().wrapping_sub(window.last_paused_at);
            self.last_update_at.fetch_add(elapsed, Ordering::Relaxed);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_ticks_per_second(&self, ticks_per_sec: f64) {
        let mut window = self.lock_window();
        window.ticks_per_sec = ticks_per_sec.max(1.0);
        self.apply_rates(&mut window);
    }

    pub fn set_average_time(&self, average_time: f64) {
        // Older deltas are not dropped eagerly, the next update prunes them
        self.lock_window().average_time = average_time;
    }

    pub fn target_delta(&self) -> f64 {
        self.target_delta.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::sync::Arc;

    fn counter(clock: &Arc<ManualClock>) -> SpeedCounter {
        // 32kHz rate, 560 samples per push => 17.5ms target delta
        SpeedCounter::new(0.425, 32_000.0, 560.0, clock.clone() as Arc<dyn Clock>)
    }

    #[test]
    fn full_speed_cadence_reads_as_one() {
        let clock = Arc::new(ManualClock::new());
        let c = counter(&clock);
        for _ in 0..16 {
            clock.advance_micros(17_500);
            c.update(560.0);
        }
        let mut predict = false;
        assert!((c.last_speed(&mut predict, false) - 1.0).abs() < 1e-6);
        assert!((c.average_speed(false, false, -1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn half_speed_cadence_reads_as_half() {
        let clock = Arc::new(ManualClock::new());
        let c = counter(&clock);
        for _ in 0..16 {
            clock.advance_micros(35_000);
            c.update(560.0);
        }
        let mut predict = false;
        assert!((c.last_speed(&mut predict, false) - 0.5).abs() < 1e-6);
        c.cache_average_speed(false, -1.0);
        assert!((c.cached_average_speed(false, false, false) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn prediction_detects_overdue_push() {
        let clock = Arc::new(ManualClock::new());
        let c = counter(&clock);
        clock.advance_micros(17_500);
        c.update(560.0);
        // No push for two target periods: predicted speed halves
        clock.advance_micros(35_000);
        let mut predict = true;
        let speed = c.last_speed(&mut predict, false);
        assert!(predict, "prediction should have been used");
        assert!((speed - 0.5).abs() < 1e-6);
    }

    #[test]
    fn simulated_start_reports_full_speed() {
        let clock = Arc::new(ManualClock::new());
        let c = counter(&clock);
        c.start(true);
        let mut predict = false;
        assert_eq!(c.last_speed(&mut predict, false), 1.0);
        assert_eq!(c.average_speed(false, false, -1.0), 1.0);
    }

    #[test]
    fn pause_rebases_the_reference_time() {
        let clock = Arc::new(ManualClock::new());
        let c = counter(&clock);
        clock.advance_micros(17_500);
        c.update(560.0);
        c.set_paused(true);
        clock.advance_micros(10_000_000); // ten seconds in the pause menu
        c.set_paused(false);
        clock.advance_micros(17_500);
        c.update(560.0);
        let mut predict = false;
        assert!((c.last_speed(&mut predict, false) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rate_change_keeps_reported_speed() {
        let clock = Arc::new(ManualClock::new());
        let c = counter(&clock);
        for _ in 0..8 {
            clock.advance_micros(17_500);
            c.update(560.0);
        }
        c.set_ticks_per_second(48_000.0);
        let mut predict = false;
        // Retained deltas were rescaled, so the last speed is still 1.0
        assert!((c.last_speed(&mut predict, false) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn window_prunes_old_deltas() {
        let clock = Arc::new(ManualClock::new());
        let c = counter(&clock);
        // 0.425s window at 17.5ms per update retains ~24 deltas
        for _ in 0..200 {
            clock.advance_micros(17_500);
            c.update(560.0);
        }
        let w = c.lock_window();
        assert!(w.deltas.len() < 32, "window kept {} deltas", w.deltas.len());
    }
}
