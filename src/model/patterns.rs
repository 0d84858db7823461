use serde::{Deserialize, Serialize};

use super::TrackRole;

// Serialized field order below is alphabetical so that serde_json emits
// canonical sorted-key JSON for every representation.

/// A single hit in a drum pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrumHit {
    pub pitch: u8,
    pub step: usize,
    pub vel: u8,
}

/// Drum pattern representation: a step grid of hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrumPattern {
    pub hits: Vec<DrumHit>,
    #[serde(rename = "stepsPerBar")]
    pub steps_per_bar: usize,
}

/// A single event in a melodic pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MelodicNote {
    /// Duration in grid steps (min 1).
    pub dur: usize,
    /// Semitone interval from the pattern's first onset.
    pub interval: i32,
    pub step: usize,
}

/// Melodic pattern representation (transposition-independent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MelodicPattern {
    pub events: Vec<MelodicNote>,
}

/// Named arpeggio rate divisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArpRate {
    #[serde(rename = "1/4")]
    Quarter,
    #[serde(rename = "1/8")]
    Eighth,
    #[serde(rename = "1/8T")]
    EighthTriplet,
    #[serde(rename = "1/16")]
    Sixteenth,
    #[serde(rename = "1/16T")]
    SixteenthTriplet,
    #[serde(rename = "1/32")]
    ThirtySecond,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ArpRate {
    pub const NAMED: [ArpRate; 6] = [
        ArpRate::Quarter,
        ArpRate::Eighth,
        ArpRate::EighthTriplet,
        ArpRate::Sixteenth,
        ArpRate::SixteenthTriplet,
        ArpRate::ThirtySecond,
    ];

    /// Division length in beats, None for `Unknown`.
    pub fn beats(&self) -> Option<f64> {
        match self {
            ArpRate::Quarter => Some(1.0),
            ArpRate::Eighth => Some(0.5),
            ArpRate::EighthTriplet => Some(1.0 / 3.0),
            ArpRate::Sixteenth => Some(0.25),
            ArpRate::SixteenthTriplet => Some(1.0 / 6.0),
            ArpRate::ThirtySecond => Some(0.125),
            ArpRate::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArpRate::Quarter => "1/4",
            ArpRate::Eighth => "1/8",
            ArpRate::EighthTriplet => "1/8T",
            ArpRate::Sixteenth => "1/16",
            ArpRate::SixteenthTriplet => "1/16T",
            ArpRate::ThirtySecond => "1/32",
            ArpRate::Unknown => "unknown",
        }
    }
}

/// Arpeggio pattern representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpPattern {
    /// Note length as a fraction of the rate division, in [0.05, 1.0].
    pub gate: f64,
    /// Semitone offsets from the window root, mod 12.
    pub interval_sequence: Vec<u8>,
    /// Per-step octave index relative to the first note.
    pub octave_jumps: Vec<i32>,
    pub rate: ArpRate,
}

/// Role-specific pattern representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Representation {
    Drum(DrumPattern),
    Melodic(MelodicPattern),
    Arp(ArpPattern),
}

/// Shape descriptors stored alongside a pattern (not hashed).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    /// Onsets per step.
    pub density: f64,
    /// Per-step velocity mean.
    pub accent_profile: Vec<f64>,
    /// Semitone deltas between consecutive onsets.
    pub pitch_contour: Vec<i32>,
    pub onset_count: usize,
    pub mean_pitch: f64,
    /// Raw onset steps, kept for cross-corpus similarity.
    pub onset_steps: Vec<usize>,
    /// Intervals from the first onset (the hashed sequence).
    pub intervals: Vec<i8>,
}

/// A canonical reusable pattern. Created on first occurrence; thereafter
/// only accumulates instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// First 12 hex chars of the combined fingerprint.
    pub pattern_id: String,
    pub role: TrackRole,
    pub length_bars: usize,
    /// Meter at the source chunk, e.g. "4/4".
    pub meter: String,
    pub grid_resolution: usize,
    /// Hex SHA-256 of the rhythm grid.
    pub rhythm_fp: String,
    /// Hex SHA-256 of the interval sequence.
    pub pitch_fp: String,
    /// Hex SHA-256 of rhythm_fp || pitch_fp digests.
    pub combo_fp: String,
    pub representation: Representation,
    pub stats: PatternStats,
    pub tags: Vec<String>,
}

/// Transform mapping a canonical pattern onto an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub pitch_offset: i32,
    pub time_scale: f64,
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            pitch_offset: 0,
            time_scale: 1.0,
        }
    }
}

/// An occurrence of a pattern in a song.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternInstance {
    pub pattern_id: String,
    pub song_id: String,
    pub track_index: usize,
    pub start_bar: usize,
    pub confidence: f64,
    pub transform: Transform,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drum_pattern_json_has_sorted_keys() {
        let pattern = DrumPattern {
            hits: vec![DrumHit {
                pitch: 36,
                step: 0,
                vel: 100,
            }],
            steps_per_bar: 16,
        };
        let json = serde_json::to_string(&pattern).unwrap();
        assert_eq!(
            json,
            r#"{"hits":[{"pitch":36,"step":0,"vel":100}],"stepsPerBar":16}"#
        );
    }

    #[test]
    fn arp_rate_round_trip() {
        let json = serde_json::to_string(&ArpRate::SixteenthTriplet).unwrap();
        assert_eq!(json, r#""1/16T""#);
        let back: ArpRate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ArpRate::SixteenthTriplet);
    }

    #[test]
    fn arp_rate_beats() {
        assert_eq!(ArpRate::Sixteenth.beats(), Some(0.25));
        assert_eq!(ArpRate::Unknown.beats(), None);
    }

    #[test]
    fn identity_transform() {
        let t = Transform::identity();
        assert_eq!(t.pitch_offset, 0);
        assert!((t.time_scale - 1.0).abs() < f64::EPSILON);
    }
}
