//! Engine
//!
//! The timing state machine: advances scheduled notes against a clock,
//! judges hits and misses against the detected pitch, keeps score, and emits
//! a [`GameSnapshot`] after every tick.
//!
//! Scoring lives in [`Playfield`], which needs nothing but an elapsed time and
//! an optional detection, so it can be driven directly. [`GameEngine`] wraps
//! it with the session lifecycle, a [`Clock`], an [`AudioCapture`] source and
//! snapshot subscribers. The host owns the frame loop and calls
//! [`GameEngine::tick`] once per display refresh.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, trace, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    capture::{AudioCapture, CaptureError},
    chart::{Chart, ChartError, ChartNote},
    clock::{Clock, SystemClock},
    config::{ConfigError, EngineConfig},
    note::DetectedNote,
    pitch::{PitchError, PitchEstimator},
};

/// Points for every hit, before the streak bonus.
const BASE_HIT_SCORE: u64 = 100;
/// Bonus points per note of the current streak.
const STREAK_BONUS: u64 = 10;
/// Notes stay visible this long after passing the hit line.
const LINGER_SECS: f64 = 1.0;
/// Snapshots queued per subscriber before newer ones are dropped.
pub const SNAPSHOT_BACKLOG: usize = 64;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The audio source could not be acquired.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// The configuration was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The pitch estimator could not be configured.
    #[error(transparent)]
    Pitch(#[from] PitchError),

    /// The chart was invalid.
    #[error(transparent)]
    Chart(#[from] ChartError),
}

/// Lifecycle of a game session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GameState {
    /// Not started, or stopped.
    Idle,
    /// Lead-in before play.
    Countdown,
    /// Notes are falling and being judged.
    Playing,
    /// Play is frozen; the audio source stays held.
    Paused,
    /// The chart has ended; statistics are final.
    Finished,
}

/// Runtime status of one chart note.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteRuntimeState {
    /// The scheduled note.
    pub note: ChartNote,
    /// Lane the note falls in.
    pub lane: usize,
    /// Set once the note has been sung in time.
    pub hit: bool,
    /// Set once the note has left the hit window unhit.
    pub missed: bool,
    /// Fall progress: 0 is the top of the playfield, 1 the hit line.
    pub position: f64,
}

impl NoteRuntimeState {
    /// Neither hit nor missed yet.
    pub fn is_pending(&self) -> bool {
        !self.hit && !self.missed
    }

    /// Whether a renderer should draw this note at `elapsed`.
    pub fn is_visible(&self, elapsed: f64, visible_ahead: f64) -> bool {
        let diff = self.note.time - elapsed;
        diff > -LINGER_SECS && diff < visible_ahead
    }
}

/// Running score for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GameStats {
    /// Notes in the chart.
    pub total_notes: usize,
    /// Notes hit so far.
    pub hit_notes: usize,
    /// Consecutive hits since the last miss.
    pub streak: usize,
    /// Longest streak of the session.
    pub best_streak: usize,
    /// Accumulated score.
    pub score: u64,
}

impl GameStats {
    /// Percentage of chart notes hit, rounded to the nearest whole number.
    pub fn accuracy(&self) -> u32 {
        if self.total_notes == 0 {
            return 0;
        }
        (self.hit_notes as f64 * 100.0 / self.total_notes as f64).round() as u32
    }
}

/// Notes resolved during one update, by chart id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickEvents {
    /// Notes that became hit.
    pub hits: Vec<usize>,
    /// Notes that became missed.
    pub misses: Vec<usize>,
}

impl TickEvents {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty() && self.misses.is_empty()
    }
}

/// Note states and statistics for one play-through of a chart.
#[derive(Debug, Clone)]
pub struct Playfield {
    notes: Vec<NoteRuntimeState>,
    stats: GameStats,
    fall_time: f64,
    hit_window: f64,
    tolerance: u32,
}

impl Playfield {
    /// Fresh, all-pending state for `chart`.
    pub fn new(chart: &Chart, config: &EngineConfig) -> Self {
        let notes = chart
            .notes()
            .iter()
            .map(|note| NoteRuntimeState {
                note: note.clone(),
                lane: chart.lane_of(note),
                hit: false,
                missed: false,
                position: 0.0,
            })
            .collect::<Vec<_>>();
        let stats = GameStats {
            total_notes: notes.len(),
            ..GameStats::default()
        };
        Playfield {
            notes,
            stats,
            fall_time: config.fall_time_secs,
            hit_window: config.hit_window_secs,
            tolerance: config.tolerance_semitones,
        }
    }

    /// Return every note to pending and clear the statistics.
    pub fn reset(&mut self) {
        for state in &mut self.notes {
            state.hit = false;
            state.missed = false;
            state.position = 0.0;
        }
        self.stats = GameStats {
            total_notes: self.notes.len(),
            ..GameStats::default()
        };
    }

    /// Note states in chart order.
    pub fn notes(&self) -> &[NoteRuntimeState] {
        &self.notes
    }

    /// Current statistics.
    pub fn stats(&self) -> GameStats {
        self.stats
    }

    /// Notes neither hit nor missed.
    pub fn pending(&self) -> usize {
        self.notes.iter().filter(|n| n.is_pending()).count()
    }

    /// Notes marked missed.
    pub fn missed(&self) -> usize {
        self.notes.iter().filter(|n| n.missed).count()
    }

    /// Advance every pending note to `elapsed` and judge it against `detected`.
    ///
    /// A note more than the hit window past its time is missed and breaks the
    /// streak. Otherwise, a note strictly inside the window whose name matches
    /// the detection is hit. Each pending note is judged independently, so one
    /// detection may hit several notes.
    pub fn update(&mut self, elapsed: f64, detected: Option<&DetectedNote>) -> TickEvents {
        let mut events = TickEvents::default();
        let stats = &mut self.stats;

        for state in self.notes.iter_mut().filter(|n| n.is_pending()) {
            let diff = state.note.time - elapsed;
            state.position = 1.0 - diff / self.fall_time;

            if diff < -self.hit_window {
                state.missed = true;
                stats.streak = 0;
                debug!("missed {} (id {}) at {elapsed:.3}s", state.note.name, state.note.id);
                events.misses.push(state.note.id);
                continue;
            }

            let Some(detected) = detected else {
                continue;
            };
            if diff.abs() < self.hit_window && detected.matches(&state.note.name, self.tolerance) {
                state.hit = true;
                stats.hit_notes += 1;
                stats.streak += 1;
                stats.best_streak = stats.best_streak.max(stats.streak);
                stats.score += BASE_HIT_SCORE + stats.streak as u64 * STREAK_BONUS;
                debug!(
                    "hit {} (id {}) with {} at {:+.3}s, streak {}",
                    state.note.name, state.note.id, detected.full_name, -diff, stats.streak
                );
                events.hits.push(state.note.id);
            }
        }

        events
    }
}

/// Read-only copy of engine state handed to renderers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameSnapshot {
    /// Session state.
    pub state: GameState,
    /// Seconds of play elapsed.
    pub elapsed: f64,
    /// Whole seconds left in the countdown.
    pub countdown: u32,
    /// Every note's runtime state, in chart order.
    pub notes: Vec<NoteRuntimeState>,
    /// Score so far.
    pub stats: GameStats,
    /// Detection from the latest playing tick.
    pub detected: Option<DetectedNote>,
    /// Lane spellings, left to right.
    pub lanes: Vec<String>,
    /// Song name.
    pub song_name: String,
    /// Difficulty label.
    pub level_label: String,
    /// Chart length in seconds.
    pub duration: f64,
    /// How far ahead of the hit line notes are drawn, in seconds.
    pub visible_ahead: f64,
    /// Notes hit or missed by the tick that produced this snapshot.
    pub events: TickEvents,
}

impl GameSnapshot {
    /// Notes a renderer should draw, using the configured look-ahead.
    pub fn visible_notes(&self) -> impl Iterator<Item = &NoteRuntimeState> {
        let (elapsed, ahead) = (self.elapsed, self.visible_ahead);
        self.notes
            .iter()
            .filter(move |n| n.is_visible(elapsed, ahead))
    }
}

/// A game session bound to a chart, an audio source and a clock.
pub struct GameEngine<A: AudioCapture, C: Clock = SystemClock> {
    chart: Chart,
    config: EngineConfig,
    playfield: Playfield,
    estimator: PitchEstimator,
    capture: A,
    capture_held: bool,
    clock: C,
    state: GameState,
    countdown_start: f64,
    countdown: u32,
    play_origin: f64,
    elapsed: f64,
    detected: Option<DetectedNote>,
    events: TickEvents,
    subscribers: Vec<Sender<GameSnapshot>>,
}

impl<A: AudioCapture> GameEngine<A, SystemClock> {
    /// An engine with default configuration on the system clock.
    pub fn with_defaults(chart: Chart, capture: A) -> Result<Self, EngineError> {
        Self::new(chart, capture, SystemClock::new(), EngineConfig::default())
    }
}

impl<A: AudioCapture, C: Clock> GameEngine<A, C> {
    /// Create an idle engine.
    pub fn new(
        chart: Chart,
        capture: A,
        clock: C,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let estimator = config.estimator()?;
        let playfield = Playfield::new(&chart, &config);
        let countdown = countdown_value(config.countdown_secs, 0.0);
        Ok(GameEngine {
            chart,
            config,
            playfield,
            estimator,
            capture,
            capture_held: false,
            clock,
            state: GameState::Idle,
            countdown_start: 0.0,
            countdown,
            play_origin: 0.0,
            elapsed: 0.0,
            detected: None,
            events: TickEvents::default(),
            subscribers: Vec::new(),
        })
    }

    /// Acquire the audio source and begin the countdown.
    ///
    /// Only valid from [`GameState::Idle`]; elsewhere it does nothing. Starting
    /// again after a stop replays the chart from scratch. If the source cannot
    /// be acquired the engine stays idle and the error is returned.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.state != GameState::Idle {
            debug!("start ignored in {:?}", self.state);
            return Ok(());
        }
        if let Err(err) = self.capture.acquire() {
            warn!("could not acquire audio capture: {err}");
            return Err(err.into());
        }
        self.capture_held = true;

        self.playfield.reset();
        self.elapsed = 0.0;
        self.detected = None;
        self.events = TickEvents::default();
        self.state = GameState::Countdown;
        self.countdown_start = self.clock.now();
        self.countdown = countdown_value(self.config.countdown_secs, 0.0);
        info!("countdown started for \"{}\"", self.chart.name());
        self.publish();
        Ok(())
    }

    /// Freeze play. Only valid while playing.
    pub fn pause(&mut self) {
        if self.state != GameState::Playing {
            return;
        }
        self.state = GameState::Paused;
        info!("paused at {:.3}s", self.elapsed);
        self.publish();
    }

    /// Continue play from the paused elapsed time. Only valid while paused.
    pub fn resume(&mut self) {
        if self.state != GameState::Paused {
            return;
        }
        self.play_origin = self.clock.now() - self.elapsed;
        self.state = GameState::Playing;
        info!("resumed at {:.3}s", self.elapsed);
        self.publish();
    }

    /// End the session and release the audio source.
    ///
    /// Valid during countdown, play and pause; a no-op otherwise.
    pub fn stop(&mut self) {
        match self.state {
            GameState::Countdown | GameState::Playing | GameState::Paused => {
                self.state = GameState::Idle;
                self.release_capture();
                info!("stopped at {:.3}s", self.elapsed);
                self.publish();
            }
            GameState::Idle | GameState::Finished => self.release_capture(),
        }
    }

    /// Run one update cycle and return the resulting snapshot.
    ///
    /// The clock is read once, and while playing exactly one audio window is
    /// analysed; every note is judged against those two values. The snapshot
    /// is also sent to every subscriber.
    pub fn tick(&mut self) -> GameSnapshot {
        let now = self.clock.now();
        self.events = TickEvents::default();

        match self.state {
            GameState::Countdown => {
                let since = now - self.countdown_start;
                self.countdown = countdown_value(self.config.countdown_secs, since);
                if since >= self.config.countdown_secs {
                    self.state = GameState::Playing;
                    self.play_origin = now;
                    self.elapsed = 0.0;
                    info!("playing \"{}\"", self.chart.name());
                }
            }
            GameState::Playing => {
                self.elapsed = now - self.play_origin;
                let buffer = self.capture.sample();
                self.detected = buffer.and_then(|buffer| self.estimator.detect(&buffer));
                self.events = self.playfield.update(self.elapsed, self.detected.as_ref());

                if self.elapsed >= self.chart.duration() {
                    self.state = GameState::Finished;
                    self.release_capture();
                    let stats = self.playfield.stats();
                    info!(
                        "finished: {}/{} notes, best streak {}, score {}",
                        stats.hit_notes, stats.total_notes, stats.best_streak, stats.score
                    );
                }
            }
            GameState::Idle | GameState::Paused | GameState::Finished => {}
        }

        let snapshot = self.snapshot();
        self.broadcast(&snapshot);
        snapshot
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            state: self.state,
            elapsed: self.elapsed,
            countdown: self.countdown,
            notes: self.playfield.notes().to_vec(),
            stats: self.playfield.stats(),
            detected: self.detected.clone(),
            lanes: self.chart.lanes().iter().map(|l| l.to_string()).collect(),
            song_name: self.chart.name().to_string(),
            level_label: self.chart.level_label().to_string(),
            duration: self.chart.duration(),
            visible_ahead: self.config.visible_ahead_secs,
            events: self.events.clone(),
        }
    }

    /// Receive a snapshot after every tick and state change.
    ///
    /// Each subscriber queues at most [`SNAPSHOT_BACKLOG`] snapshots; while
    /// its queue is full, newer snapshots are dropped for it. Dropping the
    /// receiver unsubscribes.
    pub fn subscribe(&mut self) -> Receiver<GameSnapshot> {
        let (tx, rx) = bounded(SNAPSHOT_BACKLOG);
        self.subscribers.push(tx);
        rx
    }

    /// Current session state.
    pub fn state(&self) -> GameState {
        self.state
    }

    /// True while the host should keep calling [`GameEngine::tick`].
    pub fn is_running(&self) -> bool {
        matches!(self.state, GameState::Countdown | GameState::Playing)
    }

    /// Seconds of play elapsed.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Current statistics.
    pub fn stats(&self) -> GameStats {
        self.playfield.stats()
    }

    /// The chart being played.
    pub fn chart(&self) -> &Chart {
        &self.chart
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The audio source.
    pub fn capture(&self) -> &A {
        &self.capture
    }

    /// Mutable access to the audio source, e.g. to feed a scripted one.
    pub fn capture_mut(&mut self) -> &mut A {
        &mut self.capture
    }

    fn release_capture(&mut self) {
        if self.capture_held {
            self.capture.release();
            self.capture_held = false;
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.broadcast(&snapshot);
    }

    fn broadcast(&mut self, snapshot: &GameSnapshot) {
        self.subscribers.retain(|tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("subscriber backlog full, dropping snapshot");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl<A: AudioCapture, C: Clock> Drop for GameEngine<A, C> {
    fn drop(&mut self) {
        self.release_capture();
    }
}

/// Whole seconds left in a countdown of `total` seconds after `since` seconds.
fn countdown_value(total: f64, since: f64) -> u32 {
    (total - since).ceil().max(0.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::Difficulty;

    fn detected(name: &str) -> DetectedNote {
        // Frequencies of the notes used below.
        let freq = match name {
            "C4" => 261.63,
            "D4" => 293.66,
            "E4" => 329.63,
            "A4" => 440.0,
            _ => unreachable!("no test frequency for {name}"),
        };
        DetectedNote::from_frequency(freq, 0.3).unwrap()
    }

    fn playfield(notes: &[(&str, f64)], config: &EngineConfig) -> Playfield {
        let chart = notes
            .iter()
            .fold(Chart::builder("Test", Difficulty::Easy), |b, &(n, t)| b.note(n, t))
            .build()
            .unwrap();
        Playfield::new(&chart, config)
    }

    #[test]
    fn matching_pitch_inside_window_hits() {
        let mut field = playfield(&[("A4", 5.0)], &EngineConfig::default());
        let events = field.update(5.3, Some(&detected("A4")));
        assert_eq!(events.hits, vec![0]);
        let stats = field.stats();
        assert_eq!((stats.hit_notes, stats.streak, stats.score), (1, 1, 110));
    }

    #[test]
    fn wrong_pitch_does_not_hit() {
        let mut field = playfield(&[("C4", 1.0)], &EngineConfig::default());
        assert!(field.update(1.0, Some(&detected("E4"))).is_empty());
        assert_eq!(field.pending(), 1);
    }

    #[test]
    fn neighbouring_semitone_is_tolerated() {
        let mut field = playfield(&[("C4", 1.0)], &EngineConfig::default());
        let cs4 = DetectedNote::from_frequency(277.18, 0.3).unwrap();
        assert_eq!(field.update(1.0, Some(&cs4)).hits, vec![0]);
    }

    #[test]
    fn window_edges_are_exclusive() {
        let config = EngineConfig {
            hit_window_secs: 0.5,
            ..EngineConfig::default()
        };
        let mut field = playfield(&[("C4", 2.0), ("C4", 4.0)], &config);

        // First note is 1.5s late; second is exactly 0.5s early and not yet hittable.
        let events = field.update(3.5, Some(&detected("C4")));
        assert_eq!(events.misses, vec![0]);
        assert!(events.hits.is_empty());

        // diff == -0.5 exactly: not yet missed, and not hittable either.
        let events = field.update(4.5, Some(&detected("C4")));
        assert!(events.is_empty());
        assert_eq!(field.pending(), 1);
    }

    #[test]
    fn miss_resets_streak_but_not_best() {
        let notes = [("C4", 1.0), ("D4", 2.0), ("E4", 4.0)];
        let mut field = playfield(&notes, &EngineConfig::default());
        field.update(1.0, Some(&detected("C4")));
        field.update(2.0, Some(&detected("D4")));
        assert_eq!(field.stats().streak, 2);
        assert_eq!(field.stats().score, 110 + 120);

        let events = field.update(5.0, None);
        assert_eq!(events.misses, vec![2]);
        let stats = field.stats();
        assert_eq!((stats.streak, stats.best_streak), (0, 2));
        assert_eq!(stats.score, 230);
    }

    #[test]
    fn missed_notes_stay_missed() {
        let mut field = playfield(&[("A4", 1.0)], &EngineConfig::default());
        field.update(2.0, None);
        assert_eq!(field.missed(), 1);
        // Jumping back in time must not revive the note.
        assert!(field.update(1.0, Some(&detected("A4"))).is_empty());
        assert_eq!(field.stats().hit_notes, 0);
    }

    #[test]
    fn one_detection_hits_every_matching_note_in_window() {
        let mut field = playfield(&[("A4", 1.0), ("A4", 1.2)], &EngineConfig::default());
        let events = field.update(1.1, Some(&detected("A4")));
        assert_eq!(events.hits, vec![0, 1]);
        assert_eq!(field.stats().score, 110 + 120);
    }

    #[test]
    fn position_reaches_one_at_the_hit_line() {
        let mut field = playfield(&[("A4", 6.0)], &EngineConfig::default());
        field.update(3.0, None);
        assert_eq!(field.notes()[0].position, 0.0);
        field.update(6.0, None);
        assert_eq!(field.notes()[0].position, 1.0);
    }

    #[test]
    fn visibility_window() {
        let field = playfield(&[("A4", 6.0)], &EngineConfig::default());
        let note = &field.notes()[0];
        assert!(!note.is_visible(0.0, 5.0));
        assert!(note.is_visible(1.5, 5.0));
        assert!(note.is_visible(6.5, 5.0));
        assert!(!note.is_visible(7.5, 5.0));
    }

    #[test]
    fn accuracy_is_a_rounded_percentage() {
        let stats = |hit_notes, total_notes| GameStats {
            hit_notes,
            total_notes,
            ..GameStats::default()
        };
        assert_eq!(stats(0, 0).accuracy(), 0);
        assert_eq!(stats(2, 3).accuracy(), 67);
        assert_eq!(stats(1, 8).accuracy(), 13);
        assert_eq!(stats(5, 5).accuracy(), 100);
    }

    #[test]
    fn countdown_rounds_up() {
        assert_eq!(countdown_value(3.0, 0.0), 3);
        assert_eq!(countdown_value(3.0, 0.2), 3);
        assert_eq!(countdown_value(3.0, 1.0), 2);
        assert_eq!(countdown_value(3.0, 2.9), 1);
        assert_eq!(countdown_value(3.0, 3.0), 0);
        assert_eq!(countdown_value(3.0, 4.5), 0);
    }
}
