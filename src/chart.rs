//! Chart
//!
//! The scheduled notes of a song and the lane layout used to display them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::note::{note_index, pitch_class};

/// Extra time after the last note before a chart ends, when no duration is given.
const DEFAULT_TAIL_SECS: f64 = 5.0;

const EASY_LANES: &[&str] = &["C", "D", "E", "F", "G", "A"];
const MEDIUM_LANES: &[&str] = &["C", "D", "E", "F", "F#", "G", "A", "Bb"];

/// Errors returned when building a [`Chart`].
#[derive(Debug, Error)]
pub enum ChartError {
    /// A note name could not be parsed.
    #[error("invalid note name `{name}`")]
    InvalidNoteName {
        /// The rejected name.
        name: String,
    },

    /// A scheduled time was negative or not finite.
    #[error("note {id} has invalid time {time}")]
    InvalidTime {
        /// Id of the offending note.
        id: usize,
        /// The rejected time in seconds.
        time: f64,
    },

    /// Notes must be scheduled in non-decreasing time order.
    #[error("note {id} is scheduled before the note preceding it")]
    Unordered {
        /// Id of the first out-of-order note.
        id: usize,
    },

    /// The chart duration was not positive and finite.
    #[error("invalid chart duration {0}")]
    InvalidDuration(f64),
}

/// Difficulty level, which fixes the set of lanes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// Natural notes only.
    Easy,
    /// Adds sharps and flats.
    Medium,
}

impl Difficulty {
    /// Pitch-class spellings of the lanes, left to right.
    pub const fn lanes(self) -> &'static [&'static str] {
        match self {
            Difficulty::Easy => EASY_LANES,
            Difficulty::Medium => MEDIUM_LANES,
        }
    }

    /// Numeric level, starting at 1.
    pub const fn level(self) -> u8 {
        match self {
            Difficulty::Easy => 1,
            Difficulty::Medium => 2,
        }
    }

    /// Human-readable description of the level.
    pub const fn label(self) -> &'static str {
        match self {
            Difficulty::Easy => "Easy - White Keys Only",
            Difficulty::Medium => "Medium - With Sharps & Flats",
        }
    }
}

/// Lane for a note name: the lane whose spelling equals the note's pitch
/// class, or the middle lane when there is none.
pub fn lane_for(note: &str, lanes: &[&str]) -> usize {
    let class = pitch_class(note);
    lanes
        .iter()
        .position(|&lane| lane == class)
        .unwrap_or(lanes.len() / 2)
}

/// A note the player has to hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartNote {
    /// Note name, e.g. `"F#4"`.
    pub name: String,
    /// Scheduled time in seconds from the start of play.
    pub time: f64,
    /// Stable identifier, unique within the chart.
    pub id: usize,
}

/// An immutable, validated song chart.
#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    name: String,
    difficulty: Difficulty,
    description: String,
    notes: Vec<ChartNote>,
    duration: f64,
}

impl Chart {
    /// Start building a chart.
    pub fn builder(name: impl Into<String>, difficulty: Difficulty) -> ChartBuilder {
        ChartBuilder::new(name, difficulty)
    }

    /// Song name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Difficulty level.
    pub fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    /// Label describing the difficulty.
    pub fn level_label(&self) -> &'static str {
        self.difficulty.label()
    }

    /// Free-form description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Notes in scheduled order.
    pub fn notes(&self) -> &[ChartNote] {
        &self.notes
    }

    /// Total play time in seconds.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Lane spellings for this chart's difficulty.
    pub fn lanes(&self) -> &'static [&'static str] {
        self.difficulty.lanes()
    }

    /// Lane of a note of this chart.
    pub fn lane_of(&self, note: &ChartNote) -> usize {
        lane_for(&note.name, self.lanes())
    }
}

/// Builder for a [`Chart`].
pub struct ChartBuilder {
    name: String,
    difficulty: Difficulty,
    description: String,
    notes: Vec<ChartNote>,
    duration: Option<f64>,
}

impl ChartBuilder {
    /// Start an empty chart.
    pub fn new(name: impl Into<String>, difficulty: Difficulty) -> Self {
        ChartBuilder {
            name: name.into(),
            difficulty,
            description: String::new(),
            notes: Vec::new(),
            duration: None,
        }
    }

    /// Set the description.
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    /// Append a note at `time` seconds; ids follow insertion order.
    pub fn note(mut self, name: impl Into<String>, time: f64) -> Self {
        let id = self.notes.len();
        self.notes.push(ChartNote {
            name: name.into(),
            time,
            id,
        });
        self
    }

    /// Set the total duration. Defaults to 5 s after the last note.
    pub fn duration(mut self, secs: f64) -> Self {
        self.duration = Some(secs);
        self
    }

    /// Validate and create the chart.
    pub fn build(self) -> Result<Chart, ChartError> {
        let mut previous = 0.0;
        for note in &self.notes {
            if note_index(&note.name).is_none() {
                return Err(ChartError::InvalidNoteName {
                    name: note.name.clone(),
                });
            }
            if !note.time.is_finite() || note.time < 0.0 {
                return Err(ChartError::InvalidTime {
                    id: note.id,
                    time: note.time,
                });
            }
            if note.time < previous {
                return Err(ChartError::Unordered { id: note.id });
            }
            previous = note.time;
        }

        let duration = match self.duration {
            Some(secs) => secs,
            None => self.notes.last().map_or(DEFAULT_TAIL_SECS, |n| n.time + DEFAULT_TAIL_SECS),
        };
        if !duration.is_finite() || duration <= 0.0 {
            return Err(ChartError::InvalidDuration(duration));
        }

        Ok(Chart {
            name: self.name,
            difficulty: self.difficulty,
            description: self.description,
            notes: self.notes,
            duration,
        })
    }
}
