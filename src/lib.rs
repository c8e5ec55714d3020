//! # pitch_match
//!
//! Real-time pitch estimation and note-timing scoring for sing-along games:
//! estimate the pitch a player is singing, map it to a note, and judge it
//! against a chart of scheduled notes.
//!
//! ## Example
//! ```rust
//! use pitch_match::{
//!     Chart, Difficulty, EngineConfig, GameEngine, GameState, ManualClock, ScriptedCapture,
//! };
//!
//! fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1) A chart with a single A4 five seconds into the song
//!     let chart = Chart::builder("Tuning", Difficulty::Easy)
//!         .note("A4", 5.0)
//!         .build()?;
//!
//!     // 2) An engine on a hand-driven clock, fed by a scripted microphone
//!     let clock = ManualClock::default();
//!     let capture = ScriptedCapture::default();
//!     let mut engine = GameEngine::new(chart, capture, clock.clone(), EngineConfig::default())?;
//!     let snapshots = engine.subscribe();
//!
//!     // 3) In your frame loop:
//!     engine.start()?;
//!     clock.set(3.0);
//!     engine.tick(); // countdown over, now playing
//!     clock.set(8.3);
//!     engine.capture_mut().push_tone(440.0, 0.5);
//!     let snapshot = engine.tick();
//!
//!     assert_eq!(snapshot.state, GameState::Playing);
//!     assert_eq!(snapshot.stats.score, 110);
//!     assert!(snapshots.try_iter().count() >= 3);
//!     Ok(())
//! }
//! # run().unwrap();
//! ```
//!
//! ## Features
//! - `cpal`: live microphone capture from the default input device (`CpalCapture`).

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rust_2018_idioms)]
#![deny(clippy::all)]

/// Audio sources.
pub use capture::{AudioCapture, CaptureError, ScriptedCapture};

#[cfg(feature = "cpal")]
pub use capture::CpalCapture;

/// Song charts and lanes.
pub use chart::{lane_for, Chart, ChartBuilder, ChartError, ChartNote, Difficulty};

/// Time sources.
pub use clock::{Clock, ManualClock, SystemClock};

/// Engine configuration.
pub use config::{ConfigError, EngineConfig};

/// Timing state machine and scoring.
pub use engine::{
    EngineError, GameEngine, GameSnapshot, GameState, GameStats, NoteRuntimeState, Playfield,
    TickEvents, SNAPSHOT_BACKLOG,
};

/// Note mapping and matching.
pub use note::{
    frequency_to_note, note_index, notes_match, pitch_class, DetectedNote, NoteName,
    NotePosition, A4_FREQUENCY, DEFAULT_TOLERANCE,
};

/// Pitch estimation.
pub use pitch::{
    rms, PitchError, PitchEstimator, PitchEstimatorBuilder, SignalBuffer, DEFAULT_WINDOW_SIZE,
};

/// Audio capture module.
pub mod capture;

/// Chart model module.
pub mod chart;

/// Clock module.
pub mod clock;

/// Configuration module.
pub mod config;

/// Game engine module.
pub mod engine;

/// Note mapping module.
pub mod note;

/// Pitch estimation module.
pub mod pitch;
