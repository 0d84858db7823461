pub mod arps;
pub mod roles;
pub mod sections;

use crate::ingest::timing::TimingMap;
use crate::model::{NoteEvent, TimeSigSegment, Track, TrackFeatures};

/// Semitone leaps that read as broken-chord motion.
const CHORD_TONE_LEAPS: [u8; 7] = [3, 4, 5, 7, 8, 9, 12];

/// Extract per-track scalar features. All values finite.
pub fn extract_features(
    track: &Track,
    time_sigs: &[TimeSigSegment],
    total_bars: usize,
    grid: usize,
) -> TrackFeatures {
    let notes = &track.notes;
    if notes.is_empty() {
        return TrackFeatures::default();
    }

    let timing = TimingMap::new(time_sigs);
    let onset_count = notes.len();
    let density = onset_count as f64 / total_bars.max(1) as f64;

    let mut pitches: Vec<u8> = notes.iter().map(|n| n.pitch).collect();
    pitches.sort_unstable();
    let pitch_min = pitches[0];
    let pitch_max = pitches[pitches.len() - 1];
    let median_pitch = median_u8(&pitches);

    let durations: Vec<f64> = notes.iter().map(|n| n.duration_beats).collect();
    let mean_duration = durations.iter().sum::<f64>() / durations.len() as f64;
    let median_duration = median_f64(&durations);
    let mean_velocity =
        notes.iter().map(|n| n.velocity as f64).sum::<f64>() / onset_count as f64;

    let polyphony_ratio = polyphony_ratio(notes);
    let syncopation = syncopation(notes, &timing, grid);
    let repetition = bar_repetition(notes, &timing, total_bars, grid);
    let onset_iqr = onset_iqr(notes);
    let downbeat_ratio = downbeat_ratio(notes, &timing, grid);
    let broken_chord_ratio = broken_chord_ratio(notes);

    let entropy = pitch_class_entropy(&pitches);
    let is_channel_10 = track.channel == 9 || notes.iter().any(|n| n.channel == 9);
    let drum_likeness = 0.5 * if is_channel_10 { 1.0 } else { 0.0 }
        + 0.25 * if median_duration < 0.25 { 1.0 } else { 0.0 }
        + 0.25 * (1.0 - entropy / 12f64.log2());

    TrackFeatures {
        onset_count,
        density,
        polyphony_ratio,
        pitch_min,
        pitch_max,
        pitch_range: pitch_max - pitch_min,
        median_pitch,
        syncopation,
        repetition,
        drum_likeness,
        onset_iqr,
        mean_duration,
        mean_velocity,
        downbeat_ratio,
        broken_chord_ratio,
    }
}

/// Time-weighted mean of excess voices, normalized by the maximum observed
/// polyphony.
fn polyphony_ratio(notes: &[NoteEvent]) -> f64 {
    if notes.len() < 2 {
        return 0.0;
    }

    // Sweep +1 at onset, -1 at offset
    let mut events: Vec<(f64, i32)> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        events.push((note.start_beat, 1));
        events.push((note.end_beat(), -1));
    }
    events.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });

    let mut current = 0i32;
    let mut max_poly = 0i32;
    let mut excess_time = 0.0;
    let mut prev_beat = events[0].0;
    let span_start = events[0].0;

    for &(beat, delta) in &events {
        let dt = beat - prev_beat;
        if dt > 0.0 && current > 1 {
            excess_time += (current - 1) as f64 * dt;
        }
        current += delta;
        max_poly = max_poly.max(current);
        prev_beat = beat;
    }

    let span = prev_beat - span_start;
    if span <= 0.0 || max_poly == 0 {
        return 0.0;
    }
    (excess_time / span / max_poly as f64).clamp(0.0, 1.0)
}

/// Metric weight of a quantized grid position within its bar.
/// Downbeat 1.0, half-bar 0.7, beat 0.5, half-beat 0.3, else 0.1.
fn metric_weight(step: usize, grid: usize, beats_per_bar: f64) -> f64 {
    let eps = 1e-6;
    let q_beat = step as f64 * beats_per_bar / grid as f64;

    if q_beat < eps || (q_beat - beats_per_bar).abs() < eps {
        return 1.0;
    }
    if (q_beat - beats_per_bar / 2.0).abs() < eps {
        return 0.7;
    }
    let frac = q_beat - q_beat.floor();
    if frac < eps || frac > 1.0 - eps {
        return 0.5;
    }
    if (frac - 0.5).abs() < eps {
        return 0.3;
    }
    0.1
}

/// Sum of on-weak-step onsets weighted by `1 − w(step)`, normalized by
/// onset count.
fn syncopation(notes: &[NoteEvent], timing: &TimingMap, grid: usize) -> f64 {
    let mut total = 0.0;
    for note in notes {
        let bar = timing.bar_of_beat(note.start_beat);
        let step = timing.step_of_onset(note.start_beat, grid);
        let w = metric_weight(step, grid, timing.beats_per_bar_at(bar));
        total += 1.0 - w;
    }
    total / notes.len() as f64
}

/// Jaccard similarity of adjacent 1-bar onset-step sets, averaged.
fn bar_repetition(
    notes: &[NoteEvent],
    timing: &TimingMap,
    total_bars: usize,
    grid: usize,
) -> f64 {
    if total_bars < 2 {
        return 0.0;
    }

    let mut bar_sets: Vec<std::collections::BTreeSet<usize>> = vec![Default::default(); total_bars];
    for note in notes {
        let bar = timing.bar_of_beat(note.start_beat);
        if bar < total_bars {
            let step = timing.step_of_onset(note.start_beat, grid) % grid;
            bar_sets[bar].insert(step);
        }
    }

    let mut total = 0.0;
    let mut pairs = 0usize;
    for pair in bar_sets.windows(2) {
        total += jaccard(&pair[0], &pair[1]);
        pairs += 1;
    }

    if pairs == 0 {
        0.0
    } else {
        total / pairs as f64
    }
}

fn jaccard(a: &std::collections::BTreeSet<usize>, b: &std::collections::BTreeSet<usize>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Interquartile range of inter-onset intervals.
fn onset_iqr(notes: &[NoteEvent]) -> f64 {
    if notes.len() < 3 {
        return 0.0;
    }
    let mut onsets: Vec<f64> = notes.iter().map(|n| n.start_beat).collect();
    onsets.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut iois: Vec<f64> = onsets.windows(2).map(|w| w[1] - w[0]).collect();
    iois.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = iois.len();
    let q1 = iois[n / 4];
    let q3 = iois[(3 * n) / 4];
    q3 - q1
}

/// Fraction of onsets quantizing to a bar's downbeat.
fn downbeat_ratio(notes: &[NoteEvent], timing: &TimingMap, grid: usize) -> f64 {
    let on_downbeat = notes
        .iter()
        .filter(|n| timing.step_of_onset(n.start_beat, grid) % grid == 0)
        .count();
    on_downbeat as f64 / notes.len() as f64
}

/// Fraction of consecutive intervals that are sequential chord-tone leaps.
/// Simultaneous notes (block chords) never count as broken-chord motion.
fn broken_chord_ratio(notes: &[NoteEvent]) -> f64 {
    if notes.len() < 2 {
        return 0.0;
    }
    let leaps = notes
        .windows(2)
        .filter(|w| {
            let sequential = w[1].start_beat > w[0].start_beat + 1e-9;
            let interval = w[1].pitch.abs_diff(w[0].pitch);
            sequential && CHORD_TONE_LEAPS.contains(&interval)
        })
        .count();
    leaps as f64 / (notes.len() - 1) as f64
}

/// Shannon entropy of the pitch-class distribution, in bits.
fn pitch_class_entropy(pitches: &[u8]) -> f64 {
    let mut counts = [0usize; 12];
    for &p in pitches {
        counts[(p % 12) as usize] += 1;
    }
    let total = pitches.len() as f64;

    let mut entropy = 0.0;
    for &count in &counts {
        if count > 0 {
            let p = count as f64 / total;
            entropy -= p * p.log2();
        }
    }
    entropy
}

fn median_u8(sorted: &[u8]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0
    }
}

fn median_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::model::{NoteEvent, TimeSigSegment, Track};

    pub fn note(pitch: u8, start: f64, dur: f64) -> NoteEvent {
        NoteEvent {
            start_beat: start,
            duration_beats: dur,
            pitch,
            velocity: 100,
            channel: 0,
        }
    }

    pub fn drum_note(pitch: u8, start: f64) -> NoteEvent {
        NoteEvent {
            start_beat: start,
            duration_beats: 0.1,
            pitch,
            velocity: 110,
            channel: 9,
        }
    }

    pub fn track(notes: Vec<NoteEvent>) -> Track {
        let channel = notes.first().map(|n| n.channel).unwrap_or(0);
        Track {
            track_index: 0,
            name: String::new(),
            channel,
            notes,
            features: None,
            role_probs: None,
        }
    }

    pub fn four_four() -> Vec<TimeSigSegment> {
        vec![TimeSigSegment {
            start_bar: 0,
            start_beat: 0.0,
            numerator: 4,
            denominator: 4,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn empty_track_has_default_features() {
        let t = track(vec![]);
        let f = extract_features(&t, &four_four(), 4, 16);
        assert_eq!(f.onset_count, 0);
        assert_eq!(f.density, 0.0);
    }

    #[test]
    fn density_is_onsets_per_bar() {
        let notes: Vec<_> = (0..8).map(|i| note(60, i as f64, 0.5)).collect();
        let t = track(notes);
        let f = extract_features(&t, &four_four(), 2, 16);
        assert!((f.density - 4.0).abs() < 1e-9);
    }

    #[test]
    fn monophonic_polyphony_ratio_is_zero() {
        let notes: Vec<_> = (0..4).map(|i| note(60, i as f64, 0.9)).collect();
        let f = extract_features(&track(notes), &four_four(), 1, 16);
        assert!(f.polyphony_ratio < 1e-9);
    }

    #[test]
    fn sustained_chord_has_high_polyphony() {
        let notes = vec![note(60, 0.0, 4.0), note(64, 0.0, 4.0), note(67, 0.0, 4.0)];
        let f = extract_features(&track(notes), &four_four(), 1, 16);
        assert!(f.polyphony_ratio > 0.5, "got {}", f.polyphony_ratio);
    }

    #[test]
    fn on_beat_pattern_has_low_syncopation() {
        let notes: Vec<_> = (0..4).map(|i| note(60, i as f64, 0.5)).collect();
        let f = extract_features(&track(notes), &four_four(), 1, 16);
        // Downbeat + three beats: (0 + 0.5*3)/4
        assert!(f.syncopation < 0.5);
    }

    #[test]
    fn off_grid_sixteenths_are_syncopated() {
        let notes: Vec<_> = (0..8).map(|i| note(60, 0.25 + i as f64 * 0.5, 0.2)).collect();
        let f = extract_features(&track(notes), &four_four(), 1, 16);
        assert!(f.syncopation > 0.6, "got {}", f.syncopation);
    }

    #[test]
    fn identical_bars_repeat_fully() {
        let mut notes = Vec::new();
        for bar in 0..4 {
            for beat in 0..4 {
                notes.push(note(60, bar as f64 * 4.0 + beat as f64, 0.5));
            }
        }
        let f = extract_features(&track(notes), &four_four(), 4, 16);
        assert!((f.repetition - 1.0).abs() < 1e-9);
    }

    #[test]
    fn channel_ten_dominates_drum_likeness() {
        let notes: Vec<_> = (0..8).map(|i| drum_note(36, i as f64 * 0.5)).collect();
        let f = extract_features(&track(notes), &four_four(), 1, 16);
        assert!(f.drum_likeness > 0.7, "got {}", f.drum_likeness);
    }

    #[test]
    fn melodic_track_has_low_drum_likeness() {
        let notes = vec![
            note(60, 0.0, 1.0),
            note(62, 1.0, 1.0),
            note(64, 2.0, 1.0),
            note(65, 3.0, 1.0),
            note(67, 4.0, 1.0),
            note(69, 5.0, 1.0),
            note(71, 6.0, 1.0),
        ];
        let f = extract_features(&track(notes), &four_four(), 2, 16);
        assert!(f.drum_likeness < 0.3, "got {}", f.drum_likeness);
    }

    #[test]
    fn steady_onsets_have_zero_iqr() {
        let notes: Vec<_> = (0..16).map(|i| note(60, i as f64 * 0.25, 0.2)).collect();
        let f = extract_features(&track(notes), &four_four(), 1, 16);
        assert!(f.onset_iqr < 1e-9);
    }

    #[test]
    fn arpeggio_has_high_broken_chord_ratio() {
        // C E G C, perfect chord-tone leaps
        let notes = vec![
            note(60, 0.0, 0.25),
            note(64, 0.25, 0.25),
            note(67, 0.5, 0.25),
            note(72, 0.75, 0.25),
        ];
        let f = extract_features(&track(notes), &four_four(), 1, 16);
        assert!((f.broken_chord_ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn all_features_finite() {
        let notes = vec![note(60, 0.0, 0.5), note(64, 0.1, 2.3), note(67, 3.9, 0.05)];
        let f = extract_features(&track(notes), &four_four(), 1, 16);
        for v in [
            f.density,
            f.polyphony_ratio,
            f.median_pitch,
            f.syncopation,
            f.repetition,
            f.drum_likeness,
            f.onset_iqr,
            f.mean_duration,
            f.mean_velocity,
            f.downbeat_ratio,
            f.broken_chord_ratio,
        ] {
            assert!(v.is_finite());
        }
    }
}
