use crate::clock::{StepClock, StepEvent, TimeSource, STEP_COUNT};
use crate::config::SequencerConfig;
use crate::dispatch::{check_channel, TriggerCommand, TriggerDispatch};
use crate::error::{ClockInitError, InvalidIndexError};
use crossbeam_channel::{unbounded, Receiver};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const CHANNEL_COUNT: usize = 8;

/// 8 channels x 16 steps of on/off flags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Grid {
    cells: [[bool; STEP_COUNT]; CHANNEL_COUNT],
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel: usize, step: usize) -> Result<bool, InvalidIndexError> {
        let (c, s) = check_cell(channel, step)?;
        Ok(self.cells[c][s])
    }

    pub fn set(&mut self, channel: usize, step: usize, on: bool) -> Result<(), InvalidIndexError> {
        let (c, s) = check_cell(channel, step)?;
        self.cells[c][s] = on;
        Ok(())
    }

    /// Flips one cell and returns its new value.
    pub fn toggle(&mut self, channel: usize, step: usize) -> Result<bool, InvalidIndexError> {
        let (c, s) = check_cell(channel, step)?;
        self.cells[c][s] = !self.cells[c][s];
        Ok(self.cells[c][s])
    }

    /// Channels set at `step`, ascending.
    pub fn active_channels(&self, step: usize) -> Result<Vec<usize>, InvalidIndexError> {
        let s = check_step(step)?;
        Ok((0..CHANNEL_COUNT).filter(|&c| self.cells[c][s]).collect())
    }

    pub fn clear(&mut self) {
        self.cells = Default::default();
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().flatten().all(|on| !on)
    }

    pub fn row(&self, channel: usize) -> Result<&[bool; STEP_COUNT], InvalidIndexError> {
        check_channel(channel)?;
        Ok(&self.cells[channel])
    }
}

fn check_step(step: usize) -> Result<usize, InvalidIndexError> {
    if step < STEP_COUNT {
        Ok(step)
    } else {
        Err(InvalidIndexError::Step {
            index: step,
            bound: STEP_COUNT,
        })
    }
}

fn check_cell(channel: usize, step: usize) -> Result<(usize, usize), InvalidIndexError> {
    let c = check_channel(channel)? as usize;
    Ok((c, check_step(step)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackState {
    pub running: bool,
    /// Last step that fired; 0 while stopped.
    pub current_step: usize,
    pub tempo: u32,
}

/// Grid + playback, driving its own [`StepClock`] and handing batch triggers
/// to a [`TriggerDispatch`].
///
/// The host calls [`tick`](Self::tick) (or awaits [`next_step`](Self::next_step))
/// on its single timeline; there is no interior locking.
pub struct SequenceState<D> {
    grid: Grid,
    playback: PlaybackState,
    clock: StepClock,
    steps: Receiver<StepEvent>,
    dispatcher: D,
    trigger_ms: u32,
}

impl<D: TriggerDispatch> SequenceState<D> {
    pub fn new(config: SequencerConfig, source: impl TimeSource + 'static, dispatcher: D) -> Self {
        let (tx, steps) = unbounded();
        let mut clock = StepClock::new(source, tx).with_policy(config.stall_policy);
        let tempo = clock.set_tempo(config.tempo);
        Self {
            grid: Grid::new(),
            playback: PlaybackState {
                running: false,
                current_step: 0,
                tempo,
            },
            clock,
            steps,
            dispatcher,
            trigger_ms: config.trigger_ms.max(1),
        }
    }

    pub fn toggle_step(&mut self, channel: usize, step: usize) -> Result<bool, InvalidIndexError> {
        self.grid.toggle(channel, step)
    }

    pub fn set_step(&mut self, channel: usize, step: usize, on: bool) -> Result<(), InvalidIndexError> {
        self.grid.set(channel, step, on)
    }

    pub fn cell(&self, channel: usize, step: usize) -> Result<bool, InvalidIndexError> {
        self.grid.get(channel, step)
    }

    pub fn active_channels(&self, step: usize) -> Result<Vec<usize>, InvalidIndexError> {
        self.grid.active_channels(step)
    }

    pub fn clear(&mut self) {
        self.grid.clear();
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn playback(&self) -> PlaybackState {
        self.playback
    }

    pub fn is_running(&self) -> bool {
        self.playback.running
    }

    pub fn trigger_ms(&self) -> u32 {
        self.trigger_ms
    }

    /// Clamps to the tempo range and returns the applied value.
    pub fn set_tempo(&mut self, tempo: u32) -> u32 {
        let applied = if self.playback.running {
            self.clock.set_tempo(tempo)
        } else {
            crate::clock::clamp_tempo(tempo)
        };
        self.playback.tempo = applied;
        applied
    }

    pub fn play(&mut self) -> Result<(), ClockInitError> {
        if self.playback.running {
            return Ok(());
        }
        self.clock.start(self.playback.tempo, 0)?;
        self.playback.running = true;
        self.playback.current_step = 0;
        info!(tempo = self.playback.tempo, "playback started");
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.playback.running {
            return;
        }
        self.clock.stop();
        self.playback.running = false;
        self.playback.current_step = 0;
        let stale = self.steps.try_iter().count();
        if stale > 0 {
            debug!(stale, "discarded step events queued before stop");
        }
        info!("playback stopped");
    }

    /// One scheduling check: polls the clock and dispatches whatever fired.
    /// Returns the number of steps handled.
    pub fn tick(&mut self) -> usize {
        self.clock.poll();

        let mut handled = 0;
        while let Ok(event) = self.steps.try_recv() {
            if !self.playback.running || event.generation != self.clock.generation() {
                continue;
            }
            self.fire(event.step);
            handled += 1;
        }
        handled
    }

    /// When the next step is due, if playing.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.clock.next_deadline()
    }

    /// Sleeps until the next boundary and handles it. Pending forever while
    /// stopped, so it can sit in a `select!` next to input handling.
    ///
    /// Only meaningful with a wall-clock [`TimeSource`].
    pub async fn next_step(&mut self) -> usize {
        match self.next_wakeup() {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.tick()
            }
            None => std::future::pending().await,
        }
    }

    fn fire(&mut self, step: usize) {
        self.playback.current_step = step;
        let channels = match self.grid.active_channels(step) {
            Ok(channels) => channels,
            Err(e) => {
                warn!(%e, "clock produced an invalid step");
                return;
            }
        };
        if channels.is_empty() {
            return;
        }
        match TriggerCommand::batch(&channels, self.trigger_ms) {
            Ok(cmd) => {
                if !self.dispatcher.dispatch(cmd) {
                    debug!(step, ?channels, "batch trigger not accepted");
                }
            }
            Err(e) => warn!(%e, step, "could not build batch trigger"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualTimeSource, RuntimeTimeSource};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<TriggerCommand>>>,
        accept: bool,
    }

    impl Recorder {
        fn accepting() -> Self {
            Self {
                accept: true,
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<TriggerCommand> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl TriggerDispatch for Recorder {
        fn dispatch(&self, command: TriggerCommand) -> bool {
            self.sent.lock().unwrap().push(command);
            self.accept
        }
    }

    fn sequence() -> (SequenceState<Recorder>, ManualTimeSource, Recorder) {
        let time = ManualTimeSource::new();
        let recorder = Recorder::accepting();
        let seq = SequenceState::new(SequencerConfig::default(), time.clone(), recorder.clone());
        (seq, time, recorder)
    }

    fn run_for(seq: &mut SequenceState<Recorder>, time: &ManualTimeSource, ms: u64) {
        for _ in 0..ms {
            time.advance(Duration::from_millis(1));
            seq.tick();
        }
    }

    #[test]
    fn toggle_twice_restores_the_cell() {
        let (mut seq, _, _) = sequence();
        assert_eq!(seq.toggle_step(3, 7), Ok(true));
        assert_eq!(seq.toggle_step(3, 7), Ok(false));
        assert_eq!(seq.cell(3, 7), Ok(false));
    }

    #[test]
    fn out_of_range_toggles_are_rejected() {
        let (mut seq, _, _) = sequence();
        assert_eq!(
            seq.toggle_step(8, 0),
            Err(InvalidIndexError::Channel { index: 8, bound: 8 })
        );
        assert_eq!(
            seq.toggle_step(0, 16),
            Err(InvalidIndexError::Step { index: 16, bound: 16 })
        );
        assert!(seq.grid().is_empty());
    }

    #[test]
    fn active_channels_are_ascending() {
        let (mut seq, _, _) = sequence();
        assert_eq!(seq.active_channels(4), Ok(vec![]));
        for channel in [6, 1, 4] {
            seq.toggle_step(channel, 4).unwrap();
        }
        assert_eq!(seq.active_channels(4), Ok(vec![1, 4, 6]));
        assert_eq!(seq.active_channels(5), Ok(vec![]));
        assert!(seq.active_channels(16).is_err());
    }

    #[test]
    fn play_then_stop_before_first_step_sends_nothing() {
        let (mut seq, time, recorder) = sequence();
        seq.play().unwrap();
        run_for(&mut seq, &time, 100);
        seq.stop();
        run_for(&mut seq, &time, 500);
        assert!(recorder.sent().is_empty());
    }

    #[test]
    fn only_active_steps_dispatch_batches() {
        let (mut seq, time, recorder) = sequence();
        seq.toggle_step(0, 0).unwrap();
        seq.toggle_step(2, 0).unwrap();
        seq.toggle_step(5, 0).unwrap();
        seq.toggle_step(1, 8).unwrap();
        seq.play().unwrap();

        run_for(&mut seq, &time, 2000);

        assert_eq!(
            recorder.sent(),
            vec![
                TriggerCommand::Batch {
                    channels: vec![0, 2, 5],
                    duration_ms: 50
                },
                TriggerCommand::Batch {
                    channels: vec![1],
                    duration_ms: 50
                },
            ]
        );
        assert_eq!(seq.playback().current_step, 15);
    }

    #[test]
    fn stop_resets_step_and_drops_due_events() {
        let (mut seq, time, recorder) = sequence();
        for step in 0..STEP_COUNT {
            seq.set_step(7, step, true).unwrap();
        }
        seq.play().unwrap();
        run_for(&mut seq, &time, 300);
        assert_eq!(recorder.sent().len(), 2);
        assert_eq!(seq.playback().current_step, 1);

        time.advance(Duration::from_secs(1));
        seq.stop();
        assert_eq!(seq.playback().current_step, 0);
        assert_eq!(seq.tick(), 0);
        assert_eq!(recorder.sent().len(), 2);
        assert_eq!(seq.next_wakeup(), None);
    }

    #[test]
    fn locked_clock_surfaces_to_play() {
        let time = ManualTimeSource::locked();
        let mut seq = SequenceState::new(SequencerConfig::default(), time.clone(), Recorder::accepting());
        assert_eq!(seq.play(), Err(ClockInitError::GestureRequired));
        assert!(!seq.is_running());

        time.unlock();
        assert_eq!(seq.play(), Ok(()));
        assert!(seq.is_running());
    }

    #[test]
    fn tempo_is_clamped_and_used_on_play() {
        let (mut seq, time, recorder) = sequence();
        assert_eq!(seq.set_tempo(40), 80);
        seq.set_step(0, 0, true).unwrap();
        seq.play().unwrap();

        run_for(&mut seq, &time, 187);
        assert!(recorder.sent().is_empty());
        run_for(&mut seq, &time, 1);
        assert_eq!(recorder.sent().len(), 1);
    }

    #[test]
    fn rejected_dispatch_does_not_stop_playback() {
        let time = ManualTimeSource::new();
        let recorder = Recorder::default();
        let mut seq = SequenceState::new(SequencerConfig::default(), time.clone(), recorder.clone());
        seq.set_step(3, 0, true).unwrap();
        seq.set_step(3, 1, true).unwrap();
        seq.play().unwrap();

        run_for(&mut seq, &time, 250);
        assert_eq!(recorder.sent().len(), 2);
        assert!(seq.is_running());
    }

    #[test]
    fn play_while_running_is_a_no_op() {
        let (mut seq, time, _) = sequence();
        seq.play().unwrap();
        let deadline = seq.next_wakeup();
        time.advance(Duration::from_millis(60));
        seq.play().unwrap();
        assert_eq!(seq.next_wakeup(), deadline);
    }

    #[test]
    fn grid_edits_while_playing_apply_on_next_pass() {
        let (mut seq, time, recorder) = sequence();
        seq.play().unwrap();
        run_for(&mut seq, &time, 130);
        seq.toggle_step(4, 1).unwrap();
        run_for(&mut seq, &time, 125);
        assert_eq!(
            recorder.sent(),
            vec![TriggerCommand::Batch {
                channels: vec![4],
                duration_ms: 50
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_clock_drives_playback() {
        let recorder = Recorder::accepting();
        let mut seq =
            SequenceState::new(SequencerConfig::default(), RuntimeTimeSource, recorder.clone());
        seq.set_step(2, 0, true).unwrap();
        seq.set_step(2, 2, true).unwrap();

        let started = tokio::time::Instant::now();
        seq.play().unwrap();
        for _ in 0..3 {
            assert_eq!(seq.next_step().await, 1);
        }

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(375) && elapsed < Duration::from_millis(376));
        assert_eq!(recorder.sent().len(), 2);
        assert_eq!(seq.playback().current_step, 2);
    }
}
