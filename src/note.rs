//! Note
//!
//! Mapping between frequencies, pitch classes and note names such as `"F#4"`,
//! plus tolerance-based note comparison.

use std::fmt::Display;

use serde::Serialize;

const SEMITONES: i32 = 12;

/// Reference tuning: A4 in Hz.
pub const A4_FREQUENCY: f64 = 440.0;

/// Semitone distance accepted by default when comparing notes.
pub const DEFAULT_TOLERANCE: u32 = 1;

/// Twelve chromatic pitch classes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum NoteName {
    /// C
    C,
    /// C sharp / D flat
    Cs,
    /// D
    D,
    /// D sharp / E flat
    Ds,
    /// E
    E,
    /// F
    F,
    /// F sharp / G flat
    Fs,
    /// G
    G,
    /// G sharp / A flat
    Gs,
    /// A
    A,
    /// A sharp / B flat
    As,
    /// B
    B,
}

impl NoteName {
    /// All pitch classes in chromatic order starting at C.
    pub const ALL: [NoteName; SEMITONES as usize] = [
        NoteName::C,
        NoteName::Cs,
        NoteName::D,
        NoteName::Ds,
        NoteName::E,
        NoteName::F,
        NoteName::Fs,
        NoteName::G,
        NoteName::Gs,
        NoteName::A,
        NoteName::As,
        NoteName::B,
    ];

    /// Pitch class for a semitone index, wrapping every octave.
    pub const fn from_idx(idx: usize) -> NoteName {
        NoteName::ALL[idx % SEMITONES as usize]
    }

    /// Semitones above C (0..=11).
    pub const fn semitone(self) -> usize {
        self as usize
    }

    /// Sharp spelling, e.g. `"C#"`.
    pub const fn as_str(self) -> &'static str {
        match self {
            NoteName::C => "C",
            NoteName::Cs => "C#",
            NoteName::D => "D",
            NoteName::Ds => "D#",
            NoteName::E => "E",
            NoteName::F => "F",
            NoteName::Fs => "F#",
            NoteName::G => "G",
            NoteName::Gs => "G#",
            NoteName::A => "A",
            NoteName::As => "A#",
            NoteName::B => "B",
        }
    }
}

impl Display for NoteName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nearest equal-tempered note to a frequency.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NotePosition {
    /// Pitch class.
    pub name: NoteName,
    /// Scientific octave number (A4 = 440 Hz).
    pub octave: i32,
    /// Deviation from the note in cents, within [-50, 50].
    pub cents: i32,
}

/// Round half up, matching the usual note-rounding convention for ties.
#[inline]
fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Map a frequency to the nearest note.
///
/// Returns `None` for frequencies that are not positive and finite.
pub fn frequency_to_note(freq: f32) -> Option<NotePosition> {
    let freq = f64::from(freq);
    if !freq.is_finite() || freq <= 0.0 {
        return None;
    }
    let semitones = 12.0 * (freq / A4_FREQUENCY).log2();
    let rounded = round_half_up(semitones);
    let cents = round_half_up((semitones - rounded) * 100.0) as i32;

    // Semitone 0 is A4; shift by 9 so octaves roll over at C.
    let rounded = rounded as i32;
    let class = ((rounded % SEMITONES) + SEMITONES + 9) % SEMITONES;
    let octave = (rounded + 9).div_euclid(SEMITONES) + 4;

    Some(NotePosition {
        name: NoteName::from_idx(class as usize),
        octave,
        cents,
    })
}

/// Absolute semitone index (MIDI numbering, C4 = 60) of a note name.
///
/// Accepts a letter `A`-`G`, an optional `#` or `b`, and octave digits.
/// Anything else yields `None`.
pub fn note_index(name: &str) -> Option<i32> {
    let mut chars = name.chars();
    let base = match chars.next()? {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let rest = chars.as_str();
    let (accidental, digits) = match rest.as_bytes().first()? {
        b'#' => (1, &rest[1..]),
        b'b' => (-1, &rest[1..]),
        _ => (0, rest),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let octave: i32 = digits.parse().ok()?;
    octave
        .checked_add(1)?
        .checked_mul(SEMITONES)?
        .checked_add(base + accidental)
}

/// Pitch-class part of a note name, i.e. the name with trailing octave digits removed.
pub fn pitch_class(name: &str) -> &str {
    name.trim_end_matches(|c: char| c.is_ascii_digit())
}

/// True when two note names lie within `tolerance` semitones of each other.
///
/// Unparseable names never match.
pub fn notes_match(detected: &str, target: &str, tolerance: u32) -> bool {
    match (note_index(detected), note_index(target)) {
        (Some(a), Some(b)) => a.abs_diff(b) <= tolerance,
        _ => false,
    }
}

/// A confidently detected note for one analysis window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedNote {
    /// Pitch class.
    pub name: NoteName,
    /// Octave number.
    pub octave: i32,
    /// Pitch class and octave, e.g. `"A4"`.
    pub full_name: String,
    /// Estimated fundamental in Hz.
    pub frequency: f32,
    /// RMS level of the analysed buffer.
    pub volume: f32,
}

impl DetectedNote {
    /// Build a detection from an estimated frequency and buffer level.
    pub fn from_frequency(frequency: f32, volume: f32) -> Option<Self> {
        let position = frequency_to_note(frequency)?;
        Some(DetectedNote {
            name: position.name,
            octave: position.octave,
            full_name: format!("{}{}", position.name, position.octave),
            frequency,
            volume,
        })
    }

    /// Compare against a target note name.
    pub fn matches(&self, target: &str, tolerance: u32) -> bool {
        notes_match(&self.full_name, target, tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a440_is_a4() {
        let pos = frequency_to_note(440.0).unwrap();
        assert_eq!(pos.name, NoteName::A);
        assert_eq!(pos.octave, 4);
        assert_eq!(pos.cents, 0);
    }

    #[test]
    fn octaves_roll_over_at_c() {
        assert_eq!(
            frequency_to_note(261.63).unwrap(),
            NotePosition {
                name: NoteName::C,
                octave: 4,
                cents: 0
            }
        );
        let b3 = frequency_to_note(246.94).unwrap();
        assert_eq!((b3.name, b3.octave), (NoteName::B, 3));
        let c2 = frequency_to_note(65.41).unwrap();
        assert_eq!((c2.name, c2.octave), (NoteName::C, 2));
    }

    #[test]
    fn cents_report_detuning() {
        // 20 cents sharp of A4
        let pos = frequency_to_note(445.1).unwrap();
        assert_eq!(pos.name, NoteName::A);
        assert_eq!(pos.cents, 20);
        let flat = frequency_to_note(434.9).unwrap();
        assert_eq!(flat.name, NoteName::A);
        assert_eq!(flat.cents, -20);
    }

    #[test]
    fn doubling_frequency_raises_octave() {
        for &f in &[65.41f32, 98.0, 155.56, 329.63, 440.0, 698.46, 987.77] {
            let low = frequency_to_note(f).unwrap();
            let high = frequency_to_note(2.0 * f).unwrap();
            assert_eq!(low.name, high.name, "{f} Hz");
            assert_eq!(low.octave + 1, high.octave, "{f} Hz");
        }
    }

    #[test]
    fn invalid_frequencies_are_rejected() {
        assert!(frequency_to_note(0.0).is_none());
        assert!(frequency_to_note(-440.0).is_none());
        assert!(frequency_to_note(f32::NAN).is_none());
        assert!(frequency_to_note(f32::INFINITY).is_none());
    }

    #[test]
    fn note_names_parse_to_midi_numbers() {
        assert_eq!(note_index("C4"), Some(60));
        assert_eq!(note_index("A4"), Some(69));
        assert_eq!(note_index("C#4"), Some(61));
        assert_eq!(note_index("Db4"), Some(61));
        assert_eq!(note_index("Bb4"), Some(70));
        assert_eq!(note_index("Cb4"), Some(59));
        assert_eq!(note_index("C-1"), None);
        assert_eq!(note_index("C0"), Some(12));
        assert_eq!(note_index("G10"), Some(139));
    }

    #[test]
    fn malformed_names_are_invalid() {
        for name in ["", "C", "H4", "c4", "C#", "C##4", "X9", "C4 ", "C4x", "#4"] {
            assert_eq!(note_index(name), None, "{name:?}");
        }
        assert_eq!(note_index("C99999999999"), None);
    }

    #[test]
    fn matching_uses_semitone_tolerance() {
        assert!(notes_match("C4", "C4", 0));
        assert!(notes_match("C4", "C#4", 1));
        assert!(notes_match("C#4", "Db4", 0));
        assert!(!notes_match("C4", "D4", 1));
        assert!(!notes_match("C4", "C5", 1));
        assert!(!notes_match("X9", "C4", 1));
        assert!(!notes_match("C4", "", 12));
    }

    #[test]
    fn pitch_class_strips_octave() {
        assert_eq!(pitch_class("F#4"), "F#");
        assert_eq!(pitch_class("Bb10"), "Bb");
        assert_eq!(pitch_class("C"), "C");
    }

    #[test]
    fn detected_note_full_name() {
        let note = DetectedNote::from_frequency(466.16, 0.2).unwrap();
        assert_eq!(note.name, NoteName::As);
        assert_eq!(note.full_name, "A#4");
        assert!(note.matches("Bb4", 0));
        assert!(note.matches("A4", DEFAULT_TOLERANCE));
    }

    #[test]
    fn from_idx_wraps() {
        assert_eq!(NoteName::from_idx(0), NoteName::C);
        assert_eq!(NoteName::from_idx(13), NoteName::Cs);
        assert_eq!(NoteName::Gs.semitone(), 8);
        assert_eq!(NoteName::Fs.to_string(), "F#");
    }
}
