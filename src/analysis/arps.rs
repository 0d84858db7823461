use std::collections::HashMap;

use crate::ingest::timing::TimingMap;
use crate::model::patterns::{ArpPattern, ArpRate};
use crate::model::{ChordEvent, NoteEvent, Song, Track};

/// Tracks below this arp probability are not analyzed.
const ARP_PROB_THRESHOLD: f64 = 0.5;

/// Minimum onsets for a window to read as an arpeggio.
const MIN_WINDOW_NOTES: usize = 4;

/// Fraction of inter-onset intervals that must agree with the elected
/// division; below this the rate is unknown.
const RATE_CLARITY_THRESHOLD: f64 = 0.6;

/// One analyzed arpeggio window.
#[derive(Debug, Clone)]
pub struct ArpWindow {
    pub start_beat: f64,
    pub end_beat: f64,
    /// Root pitch class the intervals are measured from.
    pub root: u8,
    pub rate: ArpRate,
    /// Semitone offsets from the root, mod 12.
    pub interval_sequence: Vec<u8>,
    /// Octave index per step relative to the first note.
    pub octave_jumps: Vec<i32>,
    /// Mean duration over the rate division, clipped to [0.05, 1.0].
    pub gate: f64,
}

/// Per-track arpeggio aggregation.
#[derive(Debug, Clone)]
pub struct ArpAnalysis {
    pub track_index: usize,
    pub windows: Vec<ArpWindow>,
    pub dominant_rate: ArpRate,
    pub mean_gate: f64,
    pub common_interval_sequence: Vec<u8>,
}

/// Persistable per-track arp summary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ArpSummary {
    pub dominant_rate: ArpRate,
    pub mean_gate: f64,
    pub common_interval_sequence: Vec<u8>,
    pub window_count: usize,
}

impl From<&ArpAnalysis> for ArpSummary {
    fn from(analysis: &ArpAnalysis) -> Self {
        Self {
            dominant_rate: analysis.dominant_rate,
            mean_gate: analysis.mean_gate,
            common_interval_sequence: analysis.common_interval_sequence.clone(),
            window_count: analysis.windows.len(),
        }
    }
}

/// Analyze a track for arpeggio content. Returns None unless the track's
/// arp probability reaches 0.5.
///
/// Windows follow the chord inferer's events; without chords, fixed 1-bar
/// windows are used.
pub fn analyze_track(track: &Track, song: &Song, chords: &[ChordEvent]) -> Option<ArpAnalysis> {
    let arp_prob = track.role_probs.as_ref().map(|p| p.arp).unwrap_or(0.0);
    if arp_prob < ARP_PROB_THRESHOLD || track.notes.is_empty() {
        return None;
    }

    let spans = window_spans(song, chords);
    let mut windows = Vec::new();

    for (start, end, chord_root) in spans {
        let notes: Vec<&NoteEvent> = track
            .notes
            .iter()
            .filter(|n| n.start_beat >= start && n.start_beat < end)
            .collect();
        if notes.len() < MIN_WINDOW_NOTES {
            continue;
        }
        if let Some(window) = analyze_window(&notes, start, end, chord_root) {
            windows.push(window);
        }
    }

    if windows.is_empty() {
        return None;
    }

    Some(aggregate(track.track_index, windows))
}

/// Window spans as (start, end, chord_root). Chord events take priority;
/// bars fill in when no chords were inferred.
fn window_spans(song: &Song, chords: &[ChordEvent]) -> Vec<(f64, f64, Option<u8>)> {
    if !chords.is_empty() {
        return chords
            .iter()
            .map(|c| (c.start_beat, c.end_beat, Some(c.root)))
            .collect();
    }

    let timing = TimingMap::new(&song.time_sig_map);
    (0..song.total_bars)
        .map(|bar| {
            let start = timing.bar_start_beat(bar);
            (start, start + timing.beats_per_bar_at(bar), None)
        })
        .collect()
}

fn analyze_window(
    notes: &[&NoteEvent],
    start: f64,
    end: f64,
    chord_root: Option<u8>,
) -> Option<ArpWindow> {
    let mut sorted: Vec<&NoteEvent> = notes.to_vec();
    sorted.sort_by(|a, b| {
        a.start_beat
            .partial_cmp(&b.start_beat)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.pitch.cmp(&b.pitch))
    });

    let iois: Vec<f64> = sorted
        .windows(2)
        .map(|w| w[1].start_beat - w[0].start_beat)
        .filter(|&d| d > 1e-9)
        .collect();
    if iois.is_empty() {
        return None;
    }

    let (rate, median_ioi) = elect_rate(&iois);
    let root = chord_root.unwrap_or_else(|| {
        sorted.iter().map(|n| n.pitch).min().unwrap_or(0) % 12
    });

    let interval_sequence: Vec<u8> = sorted
        .iter()
        .map(|n| ((n.pitch as i16 - root as i16).rem_euclid(12)) as u8)
        .collect();

    let base_octave = sorted[0].pitch as i32 / 12;
    let octave_jumps: Vec<i32> = sorted
        .iter()
        .map(|n| n.pitch as i32 / 12 - base_octave)
        .collect();

    let mean_duration =
        sorted.iter().map(|n| n.duration_beats).sum::<f64>() / sorted.len() as f64;
    let rate_beats = rate.beats().unwrap_or(median_ioi);
    let gate = if rate_beats > 0.0 {
        (mean_duration / rate_beats).clamp(0.05, 1.0)
    } else {
        0.05
    };

    Some(ArpWindow {
        start_beat: start,
        end_beat: end,
        root,
        rate,
        interval_sequence,
        octave_jumps,
        gate,
    })
}

/// Elect the named division nearest the median inter-onset interval.
/// Returns `(rate, median_ioi)`; the rate is `Unknown` when fewer than 60%
/// of IOIs land within ±20% of the division.
fn elect_rate(iois: &[f64]) -> (ArpRate, f64) {
    let mut sorted = iois.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = sorted[sorted.len() / 2];

    let mut best = ArpRate::Quarter;
    let mut best_dist = f64::MAX;
    for rate in ArpRate::NAMED {
        if let Some(beats) = rate.beats() {
            let dist = (median - beats).abs();
            if dist < best_dist {
                best_dist = dist;
                best = rate;
            }
        }
    }

    let division = best.beats().unwrap_or(median);
    let agreeing = iois
        .iter()
        .filter(|&&d| (d - division).abs() <= division * 0.2)
        .count();
    let clarity = agreeing as f64 / iois.len() as f64;

    if clarity < RATE_CLARITY_THRESHOLD {
        (ArpRate::Unknown, median)
    } else {
        (best, median)
    }
}

fn aggregate(track_index: usize, windows: Vec<ArpWindow>) -> ArpAnalysis {
    let mut rate_counts: HashMap<&'static str, (usize, ArpRate)> = HashMap::new();
    for w in &windows {
        let entry = rate_counts.entry(w.rate.as_str()).or_insert((0, w.rate));
        entry.0 += 1;
    }
    let dominant_rate = rate_counts
        .values()
        .max_by_key(|(count, rate)| (*count, std::cmp::Reverse(rate.as_str())))
        .map(|&(_, rate)| rate)
        .unwrap_or(ArpRate::Unknown);

    let mean_gate = windows.iter().map(|w| w.gate).sum::<f64>() / windows.len() as f64;

    let mut seq_counts: HashMap<&[u8], usize> = HashMap::new();
    for w in &windows {
        *seq_counts.entry(w.interval_sequence.as_slice()).or_insert(0) += 1;
    }
    let common_interval_sequence = seq_counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(seq, _)| seq.to_vec())
        .unwrap_or_default();

    ArpAnalysis {
        track_index,
        windows,
        dominant_rate,
        mean_gate,
        common_interval_sequence,
    }
}

/// Build an [`ArpPattern`] representation directly from chunk notes, using
/// the lowest pitch class as the root.
pub fn arp_from_notes(notes: &[NoteEvent]) -> Option<ArpPattern> {
    if notes.len() < MIN_WINDOW_NOTES {
        return None;
    }
    let refs: Vec<&NoteEvent> = notes.iter().collect();
    let window = analyze_window(&refs, 0.0, f64::MAX, None)?;
    Some(ArpPattern {
        gate: window.gate,
        interval_sequence: window.interval_sequence,
        octave_jumps: window.octave_jumps,
        rate: window.rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::test_support::*;
    use crate::model::{ChordQuality, RoleProbs, SongMetadata, TempoSegment};

    fn arp_song(notes: Vec<NoteEvent>) -> Song {
        let total_beats = notes.iter().map(|n| n.end_beat()).fold(0.0, f64::max);
        let mut t = track(notes);
        t.role_probs = Some(RoleProbs {
            arp: 0.8,
            lead: 0.2,
            ..RoleProbs::default()
        });
        Song {
            song_id: "test".into(),
            source_path: "test.mid".into(),
            ticks_per_quarter: 480,
            tempo_map: vec![TempoSegment {
                start_beat: 0.0,
                microseconds_per_quarter: 500_000,
            }],
            time_sig_map: four_four(),
            tracks: vec![t],
            total_beats,
            total_bars: (total_beats / 4.0).ceil() as usize,
            warning_count: 0,
            metadata: SongMetadata::default(),
        }
    }

    fn sixteenth_arp_notes(bars: usize) -> Vec<NoteEvent> {
        let cycle = [60u8, 64, 67, 72];
        (0..bars * 16)
            .map(|i| note(cycle[i % 4], i as f64 * 0.25, 0.2))
            .collect()
    }

    #[test]
    fn low_arp_probability_skips_track() {
        let mut song = arp_song(sixteenth_arp_notes(2));
        song.tracks[0].role_probs = Some(RoleProbs {
            lead: 0.9,
            arp: 0.1,
            ..RoleProbs::default()
        });
        let result = analyze_track(&song.tracks[0].clone(), &song, &[]);
        assert!(result.is_none());
    }

    #[test]
    fn sixteenth_rate_detected() {
        let song = arp_song(sixteenth_arp_notes(2));
        let analysis = analyze_track(&song.tracks[0].clone(), &song, &[]).unwrap();
        assert_eq!(analysis.dominant_rate, ArpRate::Sixteenth);
        assert_eq!(analysis.windows.len(), 2);
    }

    #[test]
    fn intervals_relative_to_chord_root() {
        let song = arp_song(sixteenth_arp_notes(1));
        let chords = vec![ChordEvent {
            start_beat: 0.0,
            end_beat: 4.0,
            root: 0,
            quality: ChordQuality::Maj,
            roman: "I".into(),
            confidence: 0.8,
        }];
        let analysis = analyze_track(&song.tracks[0].clone(), &song, &chords).unwrap();
        let window = &analysis.windows[0];
        assert_eq!(window.root, 0);
        assert_eq!(&window.interval_sequence[..4], &[0, 4, 7, 0]);
        assert_eq!(&window.octave_jumps[..4], &[0, 0, 0, 1]);
    }

    #[test]
    fn gate_reflects_duration_over_rate() {
        // Sixteenth notes held for half their division
        let notes: Vec<_> = (0..16)
            .map(|i| note(60 + (i % 4) as u8 * 4, i as f64 * 0.25, 0.125))
            .collect();
        let song = arp_song(notes);
        let analysis = analyze_track(&song.tracks[0].clone(), &song, &[]).unwrap();
        assert!((analysis.mean_gate - 0.5).abs() < 0.05, "gate {}", analysis.mean_gate);
    }

    #[test]
    fn irregular_timing_yields_unknown_rate() {
        // IOIs scattered across divisions: no 60% agreement
        let starts = [0.0, 0.2, 0.8, 0.95, 1.8, 2.1, 3.2, 3.35];
        let notes: Vec<_> = starts
            .iter()
            .enumerate()
            .map(|(i, &s)| note(60 + (i % 3) as u8 * 5, s, 0.1))
            .collect();
        let song = arp_song(notes);
        let analysis = analyze_track(&song.tracks[0].clone(), &song, &[]).unwrap();
        assert_eq!(analysis.windows[0].rate, ArpRate::Unknown);
    }

    #[test]
    fn arp_from_notes_uses_lowest_pitch_root() {
        let notes = vec![
            note(64, 0.0, 0.2),
            note(67, 0.25, 0.2),
            note(60, 0.5, 0.2),
            note(72, 0.75, 0.2),
        ];
        let arp = arp_from_notes(&notes).unwrap();
        // Root = C; intervals mod 12 from C
        assert_eq!(arp.interval_sequence, vec![4, 7, 0, 0]);
        assert_eq!(arp.rate, ArpRate::Sixteenth);
    }

    #[test]
    fn too_few_notes_is_none() {
        assert!(arp_from_notes(&[note(60, 0.0, 0.2)]).is_none());
    }
}
