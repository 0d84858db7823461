use crate::ingest::timing::TimingMap;
use crate::model::{ChordEvent, Section, SectionType, Song, TrackRole};

/// Half-window for the novelty curve, in bars.
const NOVELTY_WINDOW: usize = 4;

/// Minimum bars between section boundaries.
const MIN_BOUNDARY_SEPARATION: usize = 4;

/// Complete-linkage agglomeration stops above this distance.
const CLUSTER_TAU: f64 = 0.4;

/// Per-bar feature vector dimensions:
/// [active_track_count, 7×role density, harmonic_rhythm].
const DIMS: usize = 9;

/// Segment a song into form-labeled sections.
///
/// Boundaries come from peaks in a cosine-distance novelty curve over
/// per-bar feature vectors; sections then agglomerate into A/B/C forms by
/// complete linkage.
pub fn segment(song: &Song, chords: &[ChordEvent]) -> Vec<Section> {
    if song.total_bars == 0 || song.tracks.is_empty() {
        return Vec::new();
    }

    let vectors = normalize_dims(bar_vectors(song, chords));
    let boundaries = detect_boundaries(&vectors);

    let mut sections: Vec<Section> = Vec::new();
    let mut means: Vec<Vec<f64>> = Vec::new();
    for pair in boundaries.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if end <= start {
            continue;
        }
        means.push(mean_vector(&vectors[start..end]));
        sections.push(Section {
            start_bar: start,
            end_bar: end,
            form_label: String::new(),
            type_hint: SectionType::Unknown,
            type_confidence: 0.0,
        });
    }

    let labels = cluster_complete_linkage(&means);
    for (section, label) in sections.iter_mut().zip(&labels) {
        section.form_label = label.clone();
    }

    apply_type_hints(&mut sections, song, chords);
    sections
}

/// Raw per-bar vectors.
fn bar_vectors(song: &Song, chords: &[ChordEvent]) -> Vec<[f64; DIMS]> {
    let timing = TimingMap::new(&song.time_sig_map);
    let mut vectors = vec![[0.0f64; DIMS]; song.total_bars];

    for bar in 0..song.total_bars {
        let start = timing.bar_start_beat(bar);
        let end = start + timing.beats_per_bar_at(bar);

        let mut active_tracks = 0usize;
        let mut role_density = [0.0f64; 7];

        for track in &song.tracks {
            let count = track
                .notes
                .iter()
                .filter(|n| n.start_beat >= start && n.start_beat < end)
                .count();
            if count == 0 {
                continue;
            }
            active_tracks += 1;
            let role = track.primary_role();
            let role_idx = TrackRole::ALL
                .iter()
                .position(|&r| r == role)
                .unwrap_or(TrackRole::ALL.len() - 1);
            role_density[role_idx] += count as f64;
        }

        let harmonic_rhythm = chords
            .iter()
            .filter(|c| c.start_beat >= start && c.start_beat < end)
            .count() as f64;

        vectors[bar][0] = active_tracks as f64;
        vectors[bar][1..8].copy_from_slice(&role_density);
        vectors[bar][8] = harmonic_rhythm;
    }

    vectors
}

/// Z-score each dimension across the song.
fn normalize_dims(mut vectors: Vec<[f64; DIMS]>) -> Vec<[f64; DIMS]> {
    let n = vectors.len();
    if n == 0 {
        return vectors;
    }

    for dim in 0..DIMS {
        let mean = vectors.iter().map(|v| v[dim]).sum::<f64>() / n as f64;
        let variance =
            vectors.iter().map(|v| (v[dim] - mean).powi(2)).sum::<f64>() / n as f64;
        let std = variance.sqrt().max(1e-10);
        for v in &mut vectors {
            v[dim] = (v[dim] - mean) / std;
        }
    }
    vectors
}

/// Boundary bars: 0, novelty peaks, and the song end.
fn detect_boundaries(vectors: &[[f64; DIMS]]) -> Vec<usize> {
    let n = vectors.len();
    let w = NOVELTY_WINDOW;
    let mut boundaries = vec![0usize];

    if n >= 2 * w {
        let mut novelty = vec![0.0f64; n];
        for b in w..=(n - w) {
            let before = mean_vector(&vectors[b - w..b]);
            let after = mean_vector(&vectors[b..(b + w).min(n)]);
            novelty[b] = cosine_distance(&before, &after);
        }

        let valid: Vec<f64> = novelty[w..=(n - w)].to_vec();
        let mean = valid.iter().sum::<f64>() / valid.len() as f64;
        let std = (valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / valid.len() as f64)
            .sqrt();
        let threshold = mean + std;

        for b in w..=(n - w) {
            if novelty[b] <= threshold {
                continue;
            }
            // Local maximum
            if b > 0 && novelty[b] < novelty[b - 1] {
                continue;
            }
            if b + 1 < n && novelty[b] < novelty[b + 1] {
                continue;
            }
            if b - boundaries[boundaries.len() - 1] >= MIN_BOUNDARY_SEPARATION {
                boundaries.push(b);
            }
        }
    }

    if *boundaries.last().unwrap_or(&0) != n {
        boundaries.push(n);
    }
    boundaries
}

/// Complete-linkage agglomeration over section mean vectors; clusters merge
/// while the smallest max-pairwise distance stays within τ. Labels run
/// A, B, C… by order of first appearance.
fn cluster_complete_linkage(means: &[Vec<f64>]) -> Vec<String> {
    let n = means.len();
    if n == 0 {
        return Vec::new();
    }

    let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();

    loop {
        if clusters.len() < 2 {
            break;
        }

        let mut best: Option<(f64, usize, usize)> = None;
        for i in 0..clusters.len() {
            for j in i + 1..clusters.len() {
                let dist = complete_linkage(&clusters[i], &clusters[j], means);
                if best.map(|(d, _, _)| dist < d).unwrap_or(true) {
                    best = Some((dist, i, j));
                }
            }
        }

        match best {
            Some((dist, i, j)) if dist <= CLUSTER_TAU => {
                let merged = clusters.remove(j);
                clusters[i].extend(merged);
            }
            _ => break,
        }
    }

    // Order clusters by first member index for deterministic labels
    clusters.sort_by_key(|c| c.iter().copied().min().unwrap_or(usize::MAX));

    let mut labels = vec![String::new(); n];
    for (cluster_idx, members) in clusters.iter().enumerate() {
        let label = form_label(cluster_idx);
        for &member in members {
            labels[member] = label.clone();
        }
    }
    labels
}

fn form_label(index: usize) -> String {
    let letter = (b'A' + (index % 26) as u8) as char;
    if index < 26 {
        letter.to_string()
    } else {
        format!("{}{}", letter, index / 26)
    }
}

fn complete_linkage(a: &[usize], b: &[usize], means: &[Vec<f64>]) -> f64 {
    let mut max = 0.0f64;
    for &i in a {
        for &j in b {
            max = max.max(cosine_distance(&means[i], &means[j]));
        }
    }
    max
}

fn mean_vector(vectors: &[[f64; DIMS]]) -> Vec<f64> {
    let mut mean = vec![0.0f64; DIMS];
    if vectors.is_empty() {
        return mean;
    }
    for v in vectors {
        for (m, x) in mean.iter_mut().zip(v.iter()) {
            *m += x;
        }
    }
    for m in &mut mean {
        *m /= vectors.len() as f64;
    }
    mean
}

fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    1.0 - dot / denom
}

/// Heuristic type labels on cluster size, position, and density.
fn apply_type_hints(sections: &mut [Section], song: &Song, _chords: &[ChordEvent]) {
    if sections.is_empty() {
        return;
    }

    let densities: Vec<f64> = sections
        .iter()
        .map(|s| section_onset_density(s, song))
        .collect();
    let overall = densities.iter().sum::<f64>() / densities.len() as f64;

    // Quiet opening reads as an intro
    if densities[0] < overall * 0.6 {
        sections[0].type_hint = SectionType::Intro;
        sections[0].type_confidence = 0.6;
    }

    // Fading close reads as an outro
    let last = sections.len() - 1;
    if last > 0 && densities[last] < densities[last - 1] * 0.7 {
        sections[last].type_hint = SectionType::Outro;
        sections[last].type_confidence = 0.5;
    }

    // Most common form is the verse; the denser of the top two is the chorus
    let mut form_counts: Vec<(String, usize, f64)> = Vec::new();
    for (i, section) in sections.iter().enumerate() {
        match form_counts.iter_mut().find(|(f, _, _)| *f == section.form_label) {
            Some(entry) => {
                entry.1 += 1;
                entry.2 += densities[i];
            }
            None => form_counts.push((section.form_label.clone(), 1, densities[i])),
        }
    }
    form_counts.sort_by(|a, b| b.1.cmp(&a.1));

    let (verse_form, chorus_form) = match form_counts.as_slice() {
        [first, second, ..] if second.1 > 1 => {
            let first_density = first.2 / first.1 as f64;
            let second_density = second.2 / second.1 as f64;
            if second_density > first_density {
                (first.0.clone(), Some(second.0.clone()))
            } else {
                (second.0.clone(), Some(first.0.clone()))
            }
        }
        [first, ..] => (first.0.clone(), None),
        [] => return,
    };

    for section in sections.iter_mut() {
        if section.type_hint != SectionType::Unknown {
            continue;
        }
        if section.form_label == verse_form {
            section.type_hint = SectionType::Verse;
            section.type_confidence = 0.4;
        } else if Some(&section.form_label) == chorus_form.as_ref() {
            section.type_hint = SectionType::Chorus;
            section.type_confidence = 0.4;
        } else {
            section.type_hint = SectionType::Bridge;
            section.type_confidence = 0.3;
        }
    }
}

fn section_onset_density(section: &Section, song: &Song) -> f64 {
    let timing = TimingMap::new(&song.time_sig_map);
    let start = timing.bar_start_beat(section.start_bar);
    let end = timing.bar_start_beat(section.end_bar.min(song.total_bars.max(1)));
    let bars = (section.end_bar - section.start_bar).max(1) as f64;

    let onsets: usize = song
        .tracks
        .iter()
        .map(|t| {
            t.notes
                .iter()
                .filter(|n| n.start_beat >= start && n.start_beat < end)
                .count()
        })
        .sum();
    onsets as f64 / bars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::test_support::*;
    use crate::model::{RoleProbs, SongMetadata, TempoSegment, Track};

    fn song_with_tracks(tracks: Vec<Track>, total_bars: usize) -> Song {
        Song {
            song_id: "test".into(),
            source_path: "test.mid".into(),
            ticks_per_quarter: 480,
            tempo_map: vec![TempoSegment {
                start_beat: 0.0,
                microseconds_per_quarter: 500_000,
            }],
            time_sig_map: four_four(),
            tracks,
            total_beats: total_bars as f64 * 4.0,
            total_bars,
            warning_count: 0,
            metadata: SongMetadata::default(),
        }
    }

    /// Dense arrangement in [from, to): melody eighths + chord stabs.
    fn dense_bars(notes: &mut Vec<crate::model::NoteEvent>, from: usize, to: usize) {
        for bar in from..to {
            let base = bar as f64 * 4.0;
            for eighth in 0..8 {
                notes.push(note(60 + (eighth % 4) as u8, base + eighth as f64 * 0.5, 0.4));
            }
        }
    }

    /// Sparse arrangement: one long note per bar.
    fn sparse_bars(notes: &mut Vec<crate::model::NoteEvent>, from: usize, to: usize) {
        for bar in from..to {
            notes.push(note(48, bar as f64 * 4.0, 3.5));
        }
    }

    #[test]
    fn empty_song_has_no_sections() {
        let song = song_with_tracks(vec![], 0);
        assert!(segment(&song, &[]).is_empty());
    }

    #[test]
    fn short_song_is_single_section() {
        let mut notes = Vec::new();
        dense_bars(&mut notes, 0, 4);
        let song = song_with_tracks(vec![track(notes)], 4);
        let sections = segment(&song, &[]);

        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].start_bar, 0);
        assert_eq!(sections[0].end_bar, 4);
        assert_eq!(sections[0].form_label, "A");
    }

    #[test]
    fn sections_cover_song_prefix_contiguously() {
        let mut notes = Vec::new();
        sparse_bars(&mut notes, 0, 8);
        dense_bars(&mut notes, 8, 16);
        sparse_bars(&mut notes, 16, 24);
        let song = song_with_tracks(vec![track(notes)], 24);
        let sections = segment(&song, &[]);

        assert!(!sections.is_empty());
        assert_eq!(sections[0].start_bar, 0);
        assert_eq!(sections.last().unwrap().end_bar, 24);
        for pair in sections.windows(2) {
            assert_eq!(pair[0].end_bar, pair[1].start_bar);
        }
    }

    #[test]
    fn contrast_creates_boundary() {
        let mut notes = Vec::new();
        sparse_bars(&mut notes, 0, 8);
        dense_bars(&mut notes, 8, 16);
        let song = song_with_tracks(vec![track(notes)], 16);
        let sections = segment(&song, &[]);

        assert!(sections.len() >= 2, "expected a boundary, got {sections:?}");
    }

    #[test]
    fn repeated_material_shares_form_label() {
        let mut notes = Vec::new();
        sparse_bars(&mut notes, 0, 8);
        dense_bars(&mut notes, 8, 16);
        sparse_bars(&mut notes, 16, 24);
        let song = song_with_tracks(vec![track(notes)], 24);
        let sections = segment(&song, &[]);

        if sections.len() >= 3 {
            assert_eq!(sections[0].form_label, sections[2].form_label);
            assert_ne!(sections[0].form_label, sections[1].form_label);
        }
    }

    #[test]
    fn quiet_opening_hints_intro() {
        let mut melody = Vec::new();
        sparse_bars(&mut melody, 0, 8);
        dense_bars(&mut melody, 8, 24);
        let song = song_with_tracks(vec![track(melody)], 24);
        let sections = segment(&song, &[]);

        if sections.len() >= 2 {
            assert_eq!(sections[0].type_hint, SectionType::Intro);
        }
    }

    #[test]
    fn role_density_uses_primary_role() {
        let mut drum_notes = Vec::new();
        for bar in 0..8 {
            for beat in 0..4 {
                drum_notes.push(drum_note(36, bar as f64 * 4.0 + beat as f64));
            }
        }
        let mut drums = track(drum_notes);
        drums.role_probs = Some(RoleProbs {
            drums: 0.9,
            other: 0.1,
            ..RoleProbs::default()
        });
        let song = song_with_tracks(vec![drums], 8);
        let vectors = bar_vectors(&song, &[]);

        // Dim 1 is drums density (TrackRole::ALL order)
        assert!(vectors[0][1] > 0.0);
        assert_eq!(vectors[0][2], 0.0);
    }

    #[test]
    fn harmonic_rhythm_counts_chord_starts() {
        let mut notes = Vec::new();
        dense_bars(&mut notes, 0, 2);
        let song = song_with_tracks(vec![track(notes)], 2);
        let chords = vec![
            ChordEvent {
                start_beat: 0.0,
                end_beat: 2.0,
                root: 0,
                quality: crate::model::ChordQuality::Maj,
                roman: "I".into(),
                confidence: 0.5,
            },
            ChordEvent {
                start_beat: 2.0,
                end_beat: 4.0,
                root: 7,
                quality: crate::model::ChordQuality::Maj,
                roman: "V".into(),
                confidence: 0.5,
            },
        ];
        let vectors = bar_vectors(&song, &chords);
        assert_eq!(vectors[0][8], 2.0);
        assert_eq!(vectors[1][8], 0.0);
    }
}
