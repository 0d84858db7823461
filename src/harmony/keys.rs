use crate::model::{KeyEstimate, Mode, NoteEvent, Song};

/// Krumhansl-Schmuckler major key profile (tonal hierarchy studies).
const MAJOR_PROFILE: [f64; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];

/// Krumhansl-Schmuckler minor key profile.
const MINOR_PROFILE: [f64; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

/// Drum tracks are excluded from the histogram above this likeness.
const DRUM_EXCLUDE_THRESHOLD: f64 = 0.5;

/// Detect the key of a song from its melodic tracks.
///
/// Builds a duration-weighted pitch-class histogram over tracks with
/// drum_likeness ≤ 0.5, correlates against all 24 Krumhansl-Schmuckler
/// profiles, and measures stability over quartile windows.
pub fn detect_key(song: &Song) -> KeyEstimate {
    let notes = melodic_notes(song);
    if notes.is_empty() {
        return KeyEstimate {
            tonic: 0,
            mode: Mode::Major,
            confidence: 0.0,
            stability_samples: 0.0,
        };
    }

    let (tonic, mode, confidence) = match detect_from_notes(&notes) {
        Some(result) => result,
        None => {
            return KeyEstimate {
                tonic: 0,
                mode: Mode::Major,
                confidence: 0.0,
                stability_samples: 0.0,
            }
        }
    };

    let stability_samples = stability(&notes, song.total_beats, tonic, mode);

    KeyEstimate {
        tonic,
        mode,
        confidence,
        stability_samples,
    }
}

fn melodic_notes(song: &Song) -> Vec<&NoteEvent> {
    song.tracks
        .iter()
        .filter(|t| {
            let likeness = t
                .features
                .as_ref()
                .map(|f| f.drum_likeness)
                .unwrap_or_else(|| if t.channel == 9 { 1.0 } else { 0.0 });
            likeness <= DRUM_EXCLUDE_THRESHOLD
        })
        .flat_map(|t| t.notes.iter())
        .collect()
}

/// Correlate a duration-weighted histogram against the 24 key profiles.
/// Returns `(tonic, mode, confidence)`, or None for an empty weight sum.
///
/// Confidence is `(best − second_best) / best` over the 24 correlations,
/// clamped to [0, 1]. The runner-up is often the relative major/minor, so
/// cleanly diatonic material still scores a modest margin.
pub fn detect_from_notes(notes: &[&NoteEvent]) -> Option<(u8, Mode, f64)> {
    let histogram = weighted_histogram(notes)?;

    let mut correlations: Vec<(f64, u8, Mode)> = Vec::with_capacity(24);
    for tonic in 0..12u8 {
        let mut rotated = [0.0f64; 12];
        for (i, slot) in rotated.iter_mut().enumerate() {
            *slot = histogram[(i + tonic as usize) % 12];
        }
        correlations.push((pearson(&rotated, &MAJOR_PROFILE), tonic, Mode::Major));
        correlations.push((pearson(&rotated, &MINOR_PROFILE), tonic, Mode::Minor));
    }

    correlations.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let (best, tonic, mode) = correlations[0];
    let second = correlations.get(1).map(|&(corr, _, _)| corr).unwrap_or(0.0);

    let confidence = if best > 0.0 {
        ((best - second) / best).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Some((tonic, mode, confidence))
}

fn weighted_histogram(notes: &[&NoteEvent]) -> Option<[f64; 12]> {
    let mut histogram = [0.0f64; 12];
    let mut total = 0.0;
    for note in notes {
        let weight = note.duration_beats.max(0.0);
        histogram[(note.pitch % 12) as usize] += weight;
        total += weight;
    }
    if total <= 0.0 {
        return None;
    }
    for slot in &mut histogram {
        *slot /= total;
    }
    Some(histogram)
}

/// Fraction of quartile-sized windows whose own key matches the global one.
fn stability(notes: &[&NoteEvent], total_beats: f64, tonic: u8, mode: Mode) -> f64 {
    if total_beats <= 0.0 {
        return 0.0;
    }

    let window = total_beats / 4.0;
    let mut agree = 0usize;
    let mut sampled = 0usize;

    for i in 0..4 {
        let start = i as f64 * window;
        let end = start + window;
        let window_notes: Vec<&NoteEvent> = notes
            .iter()
            .filter(|n| n.start_beat >= start && n.start_beat < end)
            .copied()
            .collect();
        if window_notes.is_empty() {
            continue;
        }
        sampled += 1;
        if let Some((t, m, _)) = detect_from_notes(&window_notes) {
            if t == tonic && m == mode {
                agree += 1;
            }
        }
    }

    if sampled == 0 {
        0.0
    } else {
        agree as f64 / sampled as f64
    }
}

fn pearson(x: &[f64; 12], y: &[f64; 12]) -> f64 {
    let x_mean: f64 = x.iter().sum::<f64>() / 12.0;
    let y_mean: f64 = y.iter().sum::<f64>() / 12.0;

    let mut num = 0.0;
    let mut x_sq = 0.0;
    let mut y_sq = 0.0;

    for i in 0..12 {
        let xd = x[i] - x_mean;
        let yd = y[i] - y_mean;
        num += xd * yd;
        x_sq += xd * xd;
        y_sq += yd * yd;
    }

    let denom = (x_sq * y_sq).sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    num / denom
}
