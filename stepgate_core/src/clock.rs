//! Drift-aware step clock.
//!
//! The clock does not own a timer. The host calls [`StepClock::poll`] at
//! every scheduling opportunity (typically after sleeping until
//! [`StepClock::next_deadline`]); each poll compares the time source against
//! the armed deadline and emits at most one [`StepEvent`] into the injected
//! sink. Deadlines accumulate additively so check jitter never compounds.

use crate::error::{ClockInitError, ConfigError, InvalidIndexError};
use crossbeam_channel::Sender;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const STEP_COUNT: usize = 16;
pub const MIN_TEMPO: u32 = 80;
pub const MAX_TEMPO: u32 = 200;
pub const DEFAULT_TEMPO: u32 = 120;

pub fn clamp_tempo(tempo: u32) -> u32 {
    tempo.clamp(MIN_TEMPO, MAX_TEMPO)
}

/// Length of one sixteenth note: `(60 / tempo) / 4` seconds.
pub fn step_duration(tempo: u32) -> Duration {
    Duration::from_secs_f64(60.0 / clamp_tempo(tempo) as f64 / 4.0)
}

/// What a poll does when the host stalled past more than one boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StallPolicy {
    /// Fire the due step once and jump over the boundaries that were missed,
    /// keeping the pattern on its wall-clock grid.
    Skip,
    /// Fire one step per poll and advance the deadline by a single interval.
    /// A backlog drains over the following polls.
    #[default]
    CatchUp,
}

impl FromStr for StallPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(StallPolicy::Skip),
            "catch_up" | "catchup" | "catch-up" => Ok(StallPolicy::CatchUp),
            other => Err(ConfigError::StallPolicy(other.to_string())),
        }
    }
}

pub trait TimeSource: Send {
    /// Activates the source. Called on every clock start.
    fn acquire(&mut self) -> Result<(), ClockInitError>;
    fn now(&self) -> Instant;
}

/// Wall-clock source; requires a tokio runtime to schedule the checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeTimeSource;

impl TimeSource for RuntimeTimeSource {
    fn acquire(&mut self) -> Result<(), ClockInitError> {
        tokio::runtime::Handle::try_current()
            .map(|_| ())
            .map_err(|_| ClockInitError::NoRuntime)
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Explicitly advanced time, for offline stepping and tests.
///
/// Clones share the same timeline. A source created with [`locked`] refuses
/// to activate until [`unlock`] is called, standing in for sources that
/// only start after a user gesture.
///
/// [`locked`]: ManualTimeSource::locked
/// [`unlock`]: ManualTimeSource::unlock
#[derive(Debug, Clone)]
pub struct ManualTimeSource {
    inner: Arc<Mutex<ManualInner>>,
}

#[derive(Debug)]
struct ManualInner {
    now: Instant,
    locked: bool,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualInner {
                now: Instant::now(),
                locked: false,
            })),
        }
    }

    pub fn locked() -> Self {
        let source = Self::new();
        source.lock().locked = true;
        source
    }

    pub fn unlock(&self) {
        self.lock().locked = false;
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.lock();
        inner.now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualTimeSource {
    fn acquire(&mut self) -> Result<(), ClockInitError> {
        if self.lock().locked {
            Err(ClockInitError::GestureRequired)
        } else {
            Ok(())
        }
    }

    fn now(&self) -> Instant {
        self.lock().now
    }
}

/// One fired step. `generation` identifies the start/stop cycle that produced
/// it; consumers drop events whose generation is no longer current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepEvent {
    pub step: usize,
    pub generation: u64,
}

/// Receiver of step events. The clock holds exactly one.
pub trait StepSink: Send {
    fn step(&mut self, event: StepEvent);
}

impl StepSink for Sender<StepEvent> {
    fn step(&mut self, event: StepEvent) {
        if self.try_send(event).is_err() {
            debug!(step = event.step, "step sink closed, event dropped");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockState {
    pub running: bool,
    pub step_duration: Duration,
    pub next_deadline: Option<Instant>,
}

pub struct StepClock {
    source: Box<dyn TimeSource>,
    sink: Box<dyn StepSink>,
    policy: StallPolicy,
    tempo: u32,
    state: ClockState,
    current_step: usize,
    generation: u64,
}

impl StepClock {
    pub fn new(source: impl TimeSource + 'static, sink: impl StepSink + 'static) -> Self {
        Self {
            source: Box::new(source),
            sink: Box::new(sink),
            policy: StallPolicy::default(),
            tempo: DEFAULT_TEMPO,
            state: ClockState {
                running: false,
                step_duration: step_duration(DEFAULT_TEMPO),
                next_deadline: None,
            },
            current_step: 0,
            generation: 0,
        }
    }

    pub fn with_policy(mut self, policy: StallPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the subscriber; the previous sink receives nothing further.
    pub fn on_step(&mut self, sink: impl StepSink + 'static) {
        self.sink = Box::new(sink);
    }

    pub fn start(&mut self, tempo: u32, start_step: usize) -> Result<(), ClockInitError> {
        if start_step >= STEP_COUNT {
            return Err(InvalidIndexError::Step {
                index: start_step,
                bound: STEP_COUNT,
            }
            .into());
        }
        self.source.acquire()?;

        self.tempo = clamp_tempo(tempo);
        self.generation += 1;
        self.current_step = start_step;
        self.state.running = true;
        self.state.step_duration = step_duration(self.tempo);
        self.state.next_deadline = Some(self.source.now() + self.state.step_duration);
        debug!(
            tempo = self.tempo,
            start_step = self.current_step,
            generation = self.generation,
            policy = ?self.policy(),
            "step clock started"
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.state.running {
            self.generation += 1;
            debug!(generation = self.generation, "step clock stopped");
        }
        self.state.running = false;
        self.state.next_deadline = None;
        self.current_step = 0;
    }

    /// Clamps and applies a new tempo. While running, the time left until the
    /// next boundary is scaled by `new / old` so the phase is preserved.
    pub fn set_tempo(&mut self, tempo: u32) -> u32 {
        let tempo = clamp_tempo(tempo);
        if tempo == self.tempo {
            return tempo;
        }
        let old = self.state.step_duration;
        let new = step_duration(tempo);

        if let (true, Some(deadline)) = (self.state.running, self.state.next_deadline) {
            let now = self.source.now();
            let remaining = deadline.saturating_duration_since(now);
            let scaled = remaining.mul_f64(new.as_secs_f64() / old.as_secs_f64());
            self.state.next_deadline = Some(now + scaled);
        }

        self.tempo = tempo;
        self.state.step_duration = new;
        tempo
    }

    /// One scheduling check. Fires at most one step.
    pub fn poll(&mut self) -> Option<StepEvent> {
        if !self.state.running {
            return None;
        }
        let deadline = self.state.next_deadline?;
        let now = self.source.now();
        if now < deadline {
            return None;
        }

        let interval = self.state.step_duration;
        let missed = match self.policy {
            StallPolicy::Skip => {
                let behind = now.duration_since(deadline);
                (behind.as_nanos() / interval.as_nanos().max(1)) as u64
            }
            StallPolicy::CatchUp => 0,
        };
        if missed > 0 {
            debug!(missed, "host stalled, skipping step boundaries");
        }

        let event = StepEvent {
            step: self.current_step,
            generation: self.generation,
        };
        let advance = missed.saturating_add(1);
        self.current_step = (self.current_step + (advance % STEP_COUNT as u64) as usize) % STEP_COUNT;
        let jump = interval.saturating_mul(advance.min(u32::MAX as u64) as u32);
        self.state.next_deadline = Some(deadline + jump);

        self.sink.step(event);
        Some(event)
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    pub fn tempo(&self) -> u32 {
        self.tempo
    }

    /// The step the next boundary will fire.
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn policy(&self) -> StallPolicy {
        self.policy
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.next_deadline
    }

    pub fn time_until_next(&self) -> Option<Duration> {
        self.state
            .next_deadline
            .map(|d| d.saturating_duration_since(self.source.now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};

    fn manual_clock() -> (StepClock, ManualTimeSource, Receiver<StepEvent>) {
        let time = ManualTimeSource::new();
        let (tx, rx) = unbounded();
        (StepClock::new(time.clone(), tx), time, rx)
    }

    fn close_to(actual: Duration, expected: Duration) -> bool {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        diff <= Duration::from_micros(1)
    }

    #[test]
    fn step_duration_is_a_sixteenth_note() {
        assert_eq!(step_duration(120), Duration::from_millis(125));
        assert_eq!(step_duration(80), Duration::from_micros(187_500));
        assert!(close_to(step_duration(200), Duration::from_millis(75)));
        for tempo in MIN_TEMPO..MAX_TEMPO {
            assert!(step_duration(tempo) > step_duration(tempo + 1));
        }
    }

    #[test]
    fn tempo_is_clamped() {
        assert_eq!(clamp_tempo(10), MIN_TEMPO);
        assert_eq!(clamp_tempo(999), MAX_TEMPO);
        assert_eq!(step_duration(999), step_duration(MAX_TEMPO));
    }

    #[test]
    fn locked_source_refuses_to_start_until_unlocked() {
        let time = ManualTimeSource::locked();
        let (tx, _rx) = unbounded();
        let mut clock = StepClock::new(time.clone(), tx);

        assert_eq!(clock.start(120, 0), Err(ClockInitError::GestureRequired));
        assert!(!clock.is_running());
        assert_eq!(clock.next_deadline(), None);

        time.unlock();
        assert_eq!(clock.start(120, 0), Ok(()));
        assert!(clock.is_running());
    }

    #[test]
    fn runtime_source_needs_a_runtime() {
        let mut source = RuntimeTimeSource;
        assert_eq!(source.acquire(), Err(ClockInitError::NoRuntime));

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = rt.enter();
        assert_eq!(source.acquire(), Ok(()));
    }

    #[test]
    fn two_seconds_at_120_is_one_full_cycle() {
        let (mut clock, time, rx) = manual_clock();
        clock.start(120, 0).unwrap();

        for _ in 0..2000 {
            time.advance(Duration::from_millis(1));
            clock.poll();
        }

        let steps: Vec<usize> = rx.try_iter().map(|e| e.step).collect();
        assert_eq!(steps, (0..STEP_COUNT).collect::<Vec<_>>());
        assert_eq!(clock.current_step(), 0);
    }

    #[test]
    fn jittered_checks_do_not_drift() {
        let (mut clock, time, rx) = manual_clock();
        let start = time.now();
        clock.start(120, 0).unwrap();

        // 1429 * 7ms = 10.003s
        for _ in 0..1429 {
            time.advance(Duration::from_millis(7));
            clock.poll();
        }

        assert_eq!(rx.try_iter().count(), 80);
        assert_eq!(
            clock.next_deadline(),
            Some(start + Duration::from_millis(125) * 81)
        );
    }

    #[test]
    fn stop_resets_and_silences_a_due_step() {
        let (mut clock, time, rx) = manual_clock();
        clock.start(120, 0).unwrap();
        time.advance(Duration::from_millis(130));
        assert!(clock.poll().is_some());
        let generation = clock.generation();

        time.advance(Duration::from_millis(200));
        clock.stop();
        assert_eq!(clock.current_step(), 0);
        assert_eq!(clock.poll(), None);
        assert_eq!(rx.try_iter().count(), 1);
        assert!(clock.generation() > generation);

        clock.stop();
        assert_eq!(clock.current_step(), 0);
        assert!(!clock.is_running());
    }

    #[test]
    fn tempo_change_rescales_remaining_time() {
        let (mut clock, time, rx) = manual_clock();
        clock.start(120, 0).unwrap();
        time.advance(Duration::from_millis(25));

        // 100ms remaining at 125ms/step -> 80ms at 100ms/step.
        assert_eq!(clock.set_tempo(150), 150);
        let remaining = clock.time_until_next().unwrap();
        assert!(close_to(remaining, Duration::from_millis(80)), "{remaining:?}");

        time.advance(Duration::from_millis(79));
        assert_eq!(clock.poll(), None);
        time.advance(Duration::from_millis(2));
        assert_eq!(clock.poll().map(|e| e.step), Some(0));
        assert_eq!(clock.poll(), None);
        assert_eq!(rx.try_iter().count(), 1);
        assert!(close_to(clock.state().step_duration, Duration::from_millis(100)));
    }

    #[test]
    fn tempo_change_while_stopped_only_updates_duration() {
        let (mut clock, _time, _rx) = manual_clock();
        assert_eq!(clock.set_tempo(300), MAX_TEMPO);
        assert_eq!(clock.next_deadline(), None);
        assert_eq!(clock.state().step_duration, step_duration(MAX_TEMPO));
    }

    #[test]
    fn skip_policy_jumps_over_missed_boundaries() {
        let time = ManualTimeSource::new();
        let (tx, rx) = unbounded();
        let mut clock = StepClock::new(time.clone(), tx).with_policy(StallPolicy::Skip);
        let start = time.now();
        clock.start(120, 0).unwrap();

        time.advance(Duration::from_millis(385));
        assert_eq!(clock.poll().map(|e| e.step), Some(0));
        assert_eq!(clock.poll(), None);
        assert_eq!(clock.current_step(), 3);
        assert_eq!(clock.next_deadline(), Some(start + Duration::from_millis(500)));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn stalled_host_fires_one_step_per_check_by_default() {
        let (mut clock, time, rx) = manual_clock();
        assert_eq!(clock.policy(), StallPolicy::CatchUp);
        let start = time.now();
        clock.start(120, 0).unwrap();

        time.advance(Duration::from_millis(385));
        assert_eq!(clock.poll().map(|e| e.step), Some(0));
        assert_eq!(clock.current_step(), 1);
        assert_eq!(clock.next_deadline(), Some(start + Duration::from_millis(250)));

        assert_eq!(clock.poll().map(|e| e.step), Some(1));
        assert_eq!(clock.poll().map(|e| e.step), Some(2));
        assert_eq!(clock.poll(), None);
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn start_step_is_honoured() {
        let (mut clock, time, _rx) = manual_clock();
        clock.start(120, 5).unwrap();
        time.advance(Duration::from_millis(125));
        assert_eq!(clock.poll().map(|e| e.step), Some(5));
    }

    #[test]
    fn out_of_range_start_step_is_rejected() {
        let (mut clock, _time, _rx) = manual_clock();
        assert_eq!(
            clock.start(120, 21),
            Err(ClockInitError::StartStep(InvalidIndexError::Step {
                index: 21,
                bound: STEP_COUNT
            }))
        );
        assert!(!clock.is_running());
        assert_eq!(clock.generation(), 0);
        assert_eq!(clock.next_deadline(), None);
    }

    #[test]
    fn replacing_the_sink_drops_the_old_subscriber() {
        let (mut clock, time, old_rx) = manual_clock();
        let (tx, new_rx) = unbounded();
        clock.on_step(tx);
        clock.start(120, 0).unwrap();
        time.advance(Duration::from_millis(125));
        clock.poll();

        assert_eq!(old_rx.try_iter().count(), 0);
        assert_eq!(new_rx.try_iter().count(), 1);
    }

    #[test]
    fn stall_policy_parses() {
        assert_eq!("skip".parse::<StallPolicy>().unwrap(), StallPolicy::Skip);
        assert_eq!("Catch-Up".parse::<StallPolicy>().unwrap(), StallPolicy::CatchUp);
        assert!("burst".parse::<StallPolicy>().is_err());
    }
}
