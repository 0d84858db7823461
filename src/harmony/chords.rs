use crate::ingest::timing::TimingMap;
use crate::model::{ChordEvent, ChordQuality, KeyEstimate, NoteEvent, Song};

/// Penalty for a candidate whose tones leave the detected key's scale.
const DIATONIC_PENALTY: f64 = 0.25;

/// Penalty per chord tone absent from the window.
const MISSING_TONE_PENALTY: f64 = 0.3;

/// Events below this confidence are merged into a neighbor.
const MIN_EVENT_CONFIDENCE: f64 = 0.2;

/// Degree spellings; case is applied afterwards from the chord quality.
const ROMAN_DEGREES: [&str; 12] = [
    "I", "bII", "II", "bIII", "III", "IV", "#IV", "V", "bVI", "VI", "bVII", "VII",
];

/// Infer the chord progression for a song over half-bar windows.
///
/// Each window scores every (root, quality) candidate from the sounding
/// pitch classes weighted by overlap duration; a 3-window median filter and
/// adjacency merging smooth the result. Windows without enough pitch
/// content yield no event, so gaps never exceed one window of silence.
pub fn infer_chords(song: &Song, key: &KeyEstimate) -> Vec<ChordEvent> {
    infer_chords_windowed(song, key, 0.5)
}

/// As [`infer_chords`] with a configurable window size in bars.
pub fn infer_chords_windowed(
    song: &Song,
    key: &KeyEstimate,
    window_bars: f64,
) -> Vec<ChordEvent> {
    let notes: Vec<&NoteEvent> = song
        .tracks
        .iter()
        .filter(|t| {
            let likeness = t
                .features
                .as_ref()
                .map(|f| f.drum_likeness)
                .unwrap_or_else(|| if t.channel == 9 { 1.0 } else { 0.0 });
            likeness <= 0.5
        })
        .flat_map(|t| t.notes.iter())
        .collect();

    if notes.is_empty() {
        return Vec::new();
    }

    let timing = TimingMap::new(&song.time_sig_map);
    let mut raw: Vec<ChordEvent> = Vec::new();

    let mut window_start = 0.0f64;
    while window_start < song.total_beats {
        let bar = timing.bar_of_beat(window_start);
        let window_beats = timing.beats_per_bar_at(bar) * window_bars;
        let window_end = window_start + window_beats;

        if let Some((root, quality, confidence)) =
            score_window(&notes, window_start, window_end, key)
        {
            raw.push(ChordEvent {
                start_beat: window_start,
                end_beat: window_end,
                root,
                quality,
                roman: String::new(),
                confidence,
            });
        }

        window_start = window_end;
    }

    let filtered = median_filter(raw);
    let merged = merge_adjacent(filtered);
    let mut events = absorb_low_confidence(merged);

    for event in &mut events {
        event.roman = roman_numeral(event.root, event.quality, key);
    }
    events
}

/// Best (root, quality) for a window, with confidence = relative margin
/// over the runner-up. None when fewer than two pitch classes sound.
fn score_window(
    notes: &[&NoteEvent],
    start: f64,
    end: f64,
    key: &KeyEstimate,
) -> Option<(u8, ChordQuality, f64)> {
    let weights = window_pitch_weights(notes, start, end)?;

    let mut best: Option<(f64, u8, ChordQuality)> = None;
    let mut second = f64::MIN;

    // Candidates iterate in (root, quality) order; ties keep the first,
    // so the winner is deterministic.
    for root in 0..12u8 {
        for quality in ChordQuality::ALL {
            let score = score_candidate(&weights, root, quality, key);
            match best {
                Some((best_score, _, _)) => {
                    if score > best_score {
                        second = best_score;
                        best = Some((score, root, quality));
                    } else if score > second {
                        second = score;
                    }
                }
                None => best = Some((score, root, quality)),
            }
        }
    }

    let (best_score, root, quality) = best?;
    if best_score <= 0.0 {
        return None;
    }

    let confidence = if second > 0.0 {
        ((best_score - second) / best_score).clamp(0.0, 1.0)
    } else {
        1.0
    };

    Some((root, quality, confidence))
}

/// Normalized pitch-class weights for notes overlapping the window.
/// None when fewer than two distinct classes sound.
fn window_pitch_weights(notes: &[&NoteEvent], start: f64, end: f64) -> Option<[f64; 12]> {
    let mut weights = [0.0f64; 12];
    let mut total = 0.0;

    for note in notes {
        let overlap_start = note.start_beat.max(start);
        let overlap_end = note.end_beat().min(end);
        if overlap_end <= overlap_start {
            continue;
        }
        let overlap = overlap_end - overlap_start;
        weights[(note.pitch % 12) as usize] += overlap;
        total += overlap;
    }

    let distinct = weights.iter().filter(|&&w| w > 0.0).count();
    if distinct < 2 || total <= 0.0 {
        return None;
    }

    for w in &mut weights {
        *w /= total;
    }
    Some(weights)
}

/// score = Σ chord-tone weight − 0.5·Σ non-chord-tone weight
///         − 0.3 per missing chord tone − diatonic penalty.
fn score_candidate(weights: &[f64; 12], root: u8, quality: ChordQuality, key: &KeyEstimate) -> f64 {
    let intervals = quality.intervals();
    let mut tone_mask = [false; 12];
    for &iv in intervals {
        tone_mask[((root + iv) % 12) as usize] = true;
    }

    let mut chord_weight = 0.0;
    let mut other_weight = 0.0;
    for (pc, &w) in weights.iter().enumerate() {
        if tone_mask[pc] {
            chord_weight += w;
        } else {
            other_weight += w;
        }
    }

    let missing = intervals
        .iter()
        .filter(|&&iv| weights[((root + iv) % 12) as usize] <= 0.0)
        .count();

    let diatonic_penalty = if crate::harmony::chord_is_diatonic(root, intervals, key.tonic, key.mode)
    {
        0.0
    } else {
        DIATONIC_PENALTY
    };

    chord_weight - 0.5 * other_weight - MISSING_TONE_PENALTY * missing as f64 - diatonic_penalty
}

/// 3-window median filter over (root, quality) ids. Edge windows keep
/// their own value.
fn median_filter(events: Vec<ChordEvent>) -> Vec<ChordEvent> {
    if events.len() < 3 {
        return events;
    }

    let ids: Vec<u16> = events.iter().map(|e| chord_id(e.root, e.quality)).collect();
    let mut out = events.clone();

    for i in 1..events.len() - 1 {
        let mut triple = [ids[i - 1], ids[i], ids[i + 1]];
        triple.sort_unstable();
        let median = triple[1];
        if median != ids[i] {
            let (root, quality) = chord_from_id(median);
            out[i].root = root;
            out[i].quality = quality;
        }
    }
    out
}

fn chord_id(root: u8, quality: ChordQuality) -> u16 {
    root as u16 * ChordQuality::ALL.len() as u16 + quality_index(quality) as u16
}

fn chord_from_id(id: u16) -> (u8, ChordQuality) {
    let n = ChordQuality::ALL.len() as u16;
    ((id / n) as u8, ChordQuality::ALL[(id % n) as usize])
}

fn quality_index(quality: ChordQuality) -> usize {
    ChordQuality::ALL
        .iter()
        .position(|&q| q == quality)
        .unwrap_or(0)
}

/// Merge adjacent events with identical (root, quality).
fn merge_adjacent(events: Vec<ChordEvent>) -> Vec<ChordEvent> {
    let mut out: Vec<ChordEvent> = Vec::with_capacity(events.len());
    for event in events {
        match out.last_mut() {
            Some(prev)
                if prev.root == event.root
                    && prev.quality == event.quality
                    && (prev.end_beat - event.start_beat).abs() < 1e-9 =>
            {
                prev.end_beat = event.end_beat;
                prev.confidence = prev.confidence.max(event.confidence);
            }
            _ => out.push(event),
        }
    }
    out
}

/// Merge events below the confidence floor into their strongest neighbor.
fn absorb_low_confidence(events: Vec<ChordEvent>) -> Vec<ChordEvent> {
    if events.len() < 2 {
        return events;
    }

    let mut out: Vec<ChordEvent> = Vec::with_capacity(events.len());
    let mut iter = events.into_iter().peekable();

    while let Some(event) = iter.next() {
        if event.confidence >= MIN_EVENT_CONFIDENCE {
            out.push(event);
            continue;
        }

        let prev_conf = out.last().map(|e| e.confidence).unwrap_or(f64::MIN);
        let next_conf = iter.peek().map(|e| e.confidence).unwrap_or(f64::MIN);

        if prev_conf >= next_conf {
            if let Some(prev) = out.last_mut() {
                prev.end_beat = event.end_beat;
                continue;
            }
        }
        if let Some(next) = iter.peek_mut() {
            next.start_beat = event.start_beat;
            continue;
        }
        // No neighbor to absorb into
        out.push(event);
    }
    out
}

/// Roman numeral for a chord relative to the detected key.
fn roman_numeral(root: u8, quality: ChordQuality, key: &KeyEstimate) -> String {
    let degree = ((root as i16 - key.tonic as i16).rem_euclid(12)) as usize;
    let base = ROMAN_DEGREES[degree];

    let mut numeral = if quality.is_minor_flavored() {
        base.to_lowercase()
    } else {
        base.to_string()
    };

    match quality {
        ChordQuality::Dim => numeral.push('°'),
        ChordQuality::Aug => numeral.push('+'),
        ChordQuality::Dom7 | ChordQuality::Min7 => numeral.push('7'),
        ChordQuality::Maj7 => numeral.push_str("maj7"),
        ChordQuality::Sus4 => numeral.push_str("sus4"),
        _ => {}
    }

    numeral
}
