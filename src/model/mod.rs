pub mod patterns;

use serde::{Deserialize, Serialize};

/// Musical role classification for a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackRole {
    Drums,
    Bass,
    Chords,
    Pad,
    Lead,
    Arp,
    Other,
}

impl TrackRole {
    pub const ALL: [TrackRole; 7] = [
        TrackRole::Drums,
        TrackRole::Bass,
        TrackRole::Chords,
        TrackRole::Pad,
        TrackRole::Lead,
        TrackRole::Arp,
        TrackRole::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackRole::Drums => "drums",
            TrackRole::Bass => "bass",
            TrackRole::Chords => "chords",
            TrackRole::Pad => "pad",
            TrackRole::Lead => "lead",
            TrackRole::Arp => "arp",
            TrackRole::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<TrackRole> {
        Self::ALL.iter().copied().find(|r| r.as_str() == s)
    }
}

/// Probability distribution over track roles. Sums to 1.0 (±1e-6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleProbs {
    pub drums: f64,
    pub bass: f64,
    pub chords: f64,
    pub pad: f64,
    pub lead: f64,
    pub arp: f64,
    pub other: f64,
}

impl RoleProbs {
    /// Distribution putting all mass on `other` (empty or featureless tracks).
    pub fn all_other() -> Self {
        Self {
            other: 1.0,
            ..Self::default()
        }
    }

    pub fn get(&self, role: TrackRole) -> f64 {
        match role {
            TrackRole::Drums => self.drums,
            TrackRole::Bass => self.bass,
            TrackRole::Chords => self.chords,
            TrackRole::Pad => self.pad,
            TrackRole::Lead => self.lead,
            TrackRole::Arp => self.arp,
            TrackRole::Other => self.other,
        }
    }

    /// Role with the highest probability. Ties break in `TrackRole::ALL`
    /// order for determinism.
    pub fn primary(&self) -> TrackRole {
        let mut best = TrackRole::Other;
        let mut best_p = f64::MIN;
        for role in TrackRole::ALL {
            let p = self.get(role);
            if p > best_p {
                best_p = p;
                best = role;
            }
        }
        best
    }

    pub fn sum(&self) -> f64 {
        self.drums + self.bass + self.chords + self.pad + self.lead + self.arp + self.other
    }
}

/// A single note event with beat-based timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub start_beat: f64,
    pub duration_beats: f64,
    pub pitch: u8,
    pub velocity: u8,
    pub channel: u8,
}

impl NoteEvent {
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }
}

/// A tempo map segment: from `start_beat` until the next segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoSegment {
    pub start_beat: f64,
    pub microseconds_per_quarter: u32,
}

impl TempoSegment {
    pub fn bpm(&self) -> f64 {
        60_000_000.0 / self.microseconds_per_quarter as f64
    }
}

/// A time signature segment: from `start_bar` until the next segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSigSegment {
    pub start_bar: usize,
    pub start_beat: f64,
    pub numerator: u8,
    pub denominator: u8,
}

impl TimeSigSegment {
    /// Beats per bar in quarter notes.
    pub fn beats_per_bar(&self) -> f64 {
        self.numerator as f64 * (4.0 / self.denominator as f64)
    }

    /// Meter as a display string, e.g. "4/4".
    pub fn meter(&self) -> String {
        format!("{}/{}", self.numerator, self.denominator)
    }
}

/// Computed scalar features for a track. All values finite.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackFeatures {
    pub onset_count: usize,
    /// Onsets per bar.
    pub density: f64,
    /// Time-weighted excess voices over max observed polyphony.
    pub polyphony_ratio: f64,
    pub pitch_min: u8,
    pub pitch_max: u8,
    pub pitch_range: u8,
    pub median_pitch: f64,
    /// Off-weak-step onset weight, normalized by onset count.
    pub syncopation: f64,
    /// Mean Jaccard similarity of adjacent 1-bar onset sets.
    pub repetition: f64,
    pub drum_likeness: f64,
    /// Interquartile range of inter-onset intervals.
    pub onset_iqr: f64,
    pub mean_duration: f64,
    pub mean_velocity: f64,
    /// Fraction of onsets landing on a bar's downbeat.
    pub downbeat_ratio: f64,
    /// Fraction of consecutive intervals that are chord-tone leaps.
    pub broken_chord_ratio: f64,
}

/// A MIDI track with beat-domain notes and analysis results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub track_index: usize,
    pub name: String,
    /// Primary (most common) MIDI channel, 0-indexed.
    pub channel: u8,
    pub notes: Vec<NoteEvent>,
    pub features: Option<TrackFeatures>,
    pub role_probs: Option<RoleProbs>,
}

impl Track {
    pub fn primary_role(&self) -> TrackRole {
        self.role_probs
            .as_ref()
            .map(|p| p.primary())
            .unwrap_or(TrackRole::Other)
    }
}

/// Artist/title metadata with provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SongMetadata {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    /// Where the metadata came from (midi_meta, folder, filename, …).
    pub source: String,
    pub confidence: f64,
}

/// A complete normalized song. Immutable after normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    /// First 16 hex chars of the SHA-256 of the file content.
    pub song_id: String,
    pub source_path: String,
    pub ticks_per_quarter: u16,
    pub tempo_map: Vec<TempoSegment>,
    pub time_sig_map: Vec<TimeSigSegment>,
    pub tracks: Vec<Track>,
    pub total_beats: f64,
    pub total_bars: usize,
    /// Count of events dropped during normalization (unmatched note-ons,
    /// zero-duration notes).
    pub warning_count: u32,
    pub metadata: SongMetadata,
}

impl Song {
    pub fn primary_meter(&self) -> String {
        self.time_sig_map
            .first()
            .map(|ts| ts.meter())
            .unwrap_or_else(|| "4/4".to_string())
    }
}

/// Major/minor mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Major,
    Minor,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Major => "major",
            Mode::Minor => "minor",
        }
    }
}

pub const PITCH_CLASS_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Detected key for a song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEstimate {
    /// Tonic pitch class, 0 = C.
    pub tonic: u8,
    pub mode: Mode,
    pub confidence: f64,
    /// Fraction of quartile windows agreeing with the global choice.
    pub stability_samples: f64,
}

impl KeyEstimate {
    pub fn name(&self) -> String {
        format!(
            "{} {}",
            PITCH_CLASS_NAMES[self.tonic as usize % 12],
            self.mode.as_str()
        )
    }
}

/// Chord quality vocabulary used by the inferer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChordQuality {
    Maj,
    Min,
    Dim,
    Aug,
    Maj7,
    Min7,
    Dom7,
    Sus4,
}

impl ChordQuality {
    pub const ALL: [ChordQuality; 8] = [
        ChordQuality::Maj,
        ChordQuality::Min,
        ChordQuality::Dim,
        ChordQuality::Aug,
        ChordQuality::Maj7,
        ChordQuality::Min7,
        ChordQuality::Dom7,
        ChordQuality::Sus4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChordQuality::Maj => "maj",
            ChordQuality::Min => "min",
            ChordQuality::Dim => "dim",
            ChordQuality::Aug => "aug",
            ChordQuality::Maj7 => "maj7",
            ChordQuality::Min7 => "min7",
            ChordQuality::Dom7 => "7",
            ChordQuality::Sus4 => "sus4",
        }
    }

    /// Pitch-class intervals from the root.
    pub fn intervals(&self) -> &'static [u8] {
        match self {
            ChordQuality::Maj => &[0, 4, 7],
            ChordQuality::Min => &[0, 3, 7],
            ChordQuality::Dim => &[0, 3, 6],
            ChordQuality::Aug => &[0, 4, 8],
            ChordQuality::Maj7 => &[0, 4, 7, 11],
            ChordQuality::Min7 => &[0, 3, 7, 10],
            ChordQuality::Dom7 => &[0, 4, 7, 10],
            ChordQuality::Sus4 => &[0, 5, 7],
        }
    }

    pub fn is_minor_flavored(&self) -> bool {
        matches!(
            self,
            ChordQuality::Min | ChordQuality::Min7 | ChordQuality::Dim
        )
    }
}

/// A detected chord spanning a beat range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordEvent {
    pub start_beat: f64,
    pub end_beat: f64,
    /// Root pitch class, 0 = C.
    pub root: u8,
    pub quality: ChordQuality,
    /// Roman numeral relative to the detected key.
    pub roman: String,
    pub confidence: f64,
}

impl ChordEvent {
    pub fn name(&self) -> String {
        let root = PITCH_CLASS_NAMES[self.root as usize % 12];
        match self.quality {
            ChordQuality::Maj => root.to_string(),
            ChordQuality::Min => format!("{root}m"),
            q => format!("{root}{}", q.as_str()),
        }
    }
}

/// Optional section type labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    Intro,
    Verse,
    Chorus,
    Bridge,
    Outro,
    Unknown,
}

impl SectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionType::Intro => "intro",
            SectionType::Verse => "verse",
            SectionType::Chorus => "chorus",
            SectionType::Bridge => "bridge",
            SectionType::Outro => "outro",
            SectionType::Unknown => "unknown",
        }
    }
}

/// A detected song section. Sections are non-overlapping and cover a prefix
/// of the song.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    /// Starting bar (inclusive).
    pub start_bar: usize,
    /// Ending bar (exclusive).
    pub end_bar: usize,
    /// Cluster label (A, B, C…) in order of first appearance.
    pub form_label: String,
    pub type_hint: SectionType,
    pub type_confidence: f64,
}

/// Per-song analysis outcome reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    Ok,
    Partial,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Ok => "ok",
            AnalysisStatus::Partial => "partial",
            AnalysisStatus::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_probs_primary_prefers_highest() {
        let probs = RoleProbs {
            drums: 0.1,
            bass: 0.6,
            lead: 0.3,
            ..RoleProbs::default()
        };
        assert_eq!(probs.primary(), TrackRole::Bass);
    }

    #[test]
    fn all_other_sums_to_one() {
        let probs = RoleProbs::all_other();
        assert!((probs.sum() - 1.0).abs() < 1e-9);
        assert_eq!(probs.primary(), TrackRole::Other);
    }

    #[test]
    fn time_sig_beats_per_bar() {
        let ts = TimeSigSegment {
            start_bar: 0,
            start_beat: 0.0,
            numerator: 6,
            denominator: 8,
        };
        assert!((ts.beats_per_bar() - 3.0).abs() < 1e-9);
        assert_eq!(ts.meter(), "6/8");
    }

    #[test]
    fn chord_event_names() {
        let ev = ChordEvent {
            start_beat: 0.0,
            end_beat: 2.0,
            root: 9,
            quality: ChordQuality::Min,
            roman: "vi".into(),
            confidence: 0.8,
        };
        assert_eq!(ev.name(), "Am");
    }

    #[test]
    fn key_estimate_name() {
        let key = KeyEstimate {
            tonic: 0,
            mode: Mode::Major,
            confidence: 0.9,
            stability_samples: 1.0,
        };
        assert_eq!(key.name(), "C major");
    }
}
