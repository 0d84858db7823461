use sha2::{Digest, Sha256};

use super::chunking::Chunk;
use crate::model::patterns::{
    DrumHit, DrumPattern, MelodicNote, MelodicPattern, Pattern, PatternStats, Representation,
};
use crate::model::{NoteEvent, TrackRole};

/// Velocity buckets for the weighted rhythm variant: soft < 64, med < 96,
/// loud ≤ 127.
fn velocity_bucket(velocity: u8) -> u8 {
    if velocity < 64 {
        1
    } else if velocity < 96 {
        2
    } else {
        3
    }
}

/// Deterministic fingerprints for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkFingerprint {
    /// Hex SHA-256 over (length_bars, grid) header + rhythm grid bytes.
    pub rhythm_fp: String,
    /// Hex SHA-256 over the clamped interval byte sequence.
    pub pitch_fp: String,
    /// Hex SHA-256 over the two digests concatenated.
    pub combo_fp: String,
    /// First 12 hex chars of combo_fp.
    pub pattern_id: String,
    pub stats: PatternStats,
}

/// Fingerprint a chunk on a `grid` steps-per-bar lattice.
///
/// The rhythm hash covers a bitset with one bit per step (or two bits per
/// step for the weighted variant); the pitch hash covers semitone intervals
/// from the first onset, clamped to [−64, 63]. Rests are not encoded, so
/// the pitch fingerprint is transposition-invariant.
pub fn fingerprint_chunk(chunk: &Chunk, grid: usize, weighted: bool) -> ChunkFingerprint {
    let total_steps = chunk.length_bars * grid;
    let beats_per_step = chunk.beats_per_bar / grid as f64;

    // Sort by (onset, pitch) for a deterministic interval order
    let mut notes: Vec<&NoteEvent> = chunk.notes.iter().collect();
    notes.sort_by(|a, b| {
        a.start_beat
            .partial_cmp(&b.start_beat)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.pitch.cmp(&b.pitch))
    });

    let mut step_max_velocity = vec![0u8; total_steps];
    let mut step_velocity_sum = vec![0.0f64; total_steps];
    let mut step_note_count = vec![0usize; total_steps];
    let mut onset_steps: Vec<usize> = Vec::with_capacity(notes.len());

    for note in &notes {
        let step = ((note.start_beat / beats_per_step).round() as usize).min(total_steps - 1);
        onset_steps.push(step);
        step_max_velocity[step] = step_max_velocity[step].max(note.velocity);
        step_velocity_sum[step] += note.velocity as f64;
        step_note_count[step] += 1;
    }

    let rhythm_bytes = if weighted {
        pack_weighted(&step_max_velocity)
    } else {
        pack_binary(&step_max_velocity)
    };

    let mut rhythm_hasher = Sha256::new();
    rhythm_hasher.update([chunk.length_bars as u8]);
    rhythm_hasher.update((grid as u16).to_be_bytes());
    rhythm_hasher.update(&rhythm_bytes);
    let rhythm_digest = rhythm_hasher.finalize();

    let first_pitch = notes.first().map(|n| n.pitch as i32).unwrap_or(0);
    let intervals: Vec<i8> = notes
        .iter()
        .map(|n| (n.pitch as i32 - first_pitch).clamp(-64, 63) as i8)
        .collect();

    let mut pitch_hasher = Sha256::new();
    pitch_hasher.update(intervals.iter().map(|&i| i as u8).collect::<Vec<u8>>());
    let pitch_digest = pitch_hasher.finalize();

    let mut combo_hasher = Sha256::new();
    combo_hasher.update(rhythm_digest);
    combo_hasher.update(pitch_digest);
    let combo_digest = combo_hasher.finalize();

    let combo_fp = to_hex(&combo_digest);
    let pattern_id = combo_fp[..12].to_string();

    let accent_profile: Vec<f64> = (0..total_steps)
        .map(|i| {
            if step_note_count[i] > 0 {
                step_velocity_sum[i] / step_note_count[i] as f64
            } else {
                0.0
            }
        })
        .collect();

    let pitch_contour: Vec<i32> = notes
        .windows(2)
        .map(|w| w[1].pitch as i32 - w[0].pitch as i32)
        .collect();

    let mean_pitch = if notes.is_empty() {
        0.0
    } else {
        notes.iter().map(|n| n.pitch as f64).sum::<f64>() / notes.len() as f64
    };

    let set_steps = step_note_count.iter().filter(|&&c| c > 0).count();

    ChunkFingerprint {
        rhythm_fp: to_hex(&rhythm_digest),
        pitch_fp: to_hex(&pitch_digest),
        combo_fp,
        pattern_id,
        stats: PatternStats {
            density: set_steps as f64 / total_steps as f64,
            accent_profile,
            pitch_contour,
            onset_count: notes.len(),
            mean_pitch,
            onset_steps,
            intervals,
        },
    }
}

/// One bit per step, MSB first.
fn pack_binary(step_max_velocity: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; step_max_velocity.len().div_ceil(8)];
    for (step, &vel) in step_max_velocity.iter().enumerate() {
        if vel > 0 {
            bytes[step / 8] |= 1 << (7 - step % 8);
        }
    }
    bytes
}

/// Two bits per step (velocity bucket), MSB first.
fn pack_weighted(step_max_velocity: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; step_max_velocity.len().div_ceil(4)];
    for (step, &vel) in step_max_velocity.iter().enumerate() {
        if vel > 0 {
            let bucket = velocity_bucket(vel);
            bytes[step / 4] |= bucket << (6 - 2 * (step % 4));
        }
    }
    bytes
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Build the role-specific representation for a chunk.
pub fn build_representation(chunk: &Chunk, grid: usize, role: TrackRole) -> Representation {
    let beats_per_step = chunk.beats_per_bar / grid as f64;
    let total_steps = chunk.length_bars * grid;

    let mut notes: Vec<&NoteEvent> = chunk.notes.iter().collect();
    notes.sort_by(|a, b| {
        a.start_beat
            .partial_cmp(&b.start_beat)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.pitch.cmp(&b.pitch))
    });

    match role {
        TrackRole::Drums => {
            let hits = notes
                .iter()
                .map(|n| DrumHit {
                    pitch: n.pitch,
                    step: ((n.start_beat / beats_per_step).round() as usize)
                        .min(total_steps - 1),
                    vel: n.velocity,
                })
                .collect();
            Representation::Drum(DrumPattern {
                hits,
                steps_per_bar: grid,
            })
        }
        TrackRole::Arp => match crate::analysis::arps::arp_from_notes(&chunk.notes) {
            Some(arp) => Representation::Arp(arp),
            None => Representation::Melodic(melodic_events(&notes, beats_per_step, total_steps)),
        },
        _ => Representation::Melodic(melodic_events(&notes, beats_per_step, total_steps)),
    }
}

fn melodic_events(notes: &[&NoteEvent], beats_per_step: f64, total_steps: usize) -> MelodicPattern {
    let first_pitch = notes.first().map(|n| n.pitch as i32).unwrap_or(0);
    let events = notes
        .iter()
        .map(|n| MelodicNote {
            dur: ((n.duration_beats / beats_per_step).round() as usize).max(1),
            interval: n.pitch as i32 - first_pitch,
            step: ((n.start_beat / beats_per_step).round() as usize).min(total_steps - 1),
        })
        .collect();
    MelodicPattern { events }
}

/// Assemble a full [`Pattern`] from a chunk and its fingerprint.
pub fn pattern_from_chunk(
    chunk: &Chunk,
    fp: &ChunkFingerprint,
    grid: usize,
    role: TrackRole,
) -> Pattern {
    Pattern {
        pattern_id: fp.pattern_id.clone(),
        role,
        length_bars: chunk.length_bars,
        meter: chunk.meter.clone(),
        grid_resolution: grid,
        rhythm_fp: fp.rhythm_fp.clone(),
        pitch_fp: fp.pitch_fp.clone(),
        combo_fp: fp.combo_fp.clone(),
        representation: build_representation(chunk, grid, role),
        stats: fp.stats.clone(),
        tags: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::test_support::*;

    fn one_bar_chunk(notes: Vec<NoteEvent>) -> Chunk {
        Chunk {
            track_index: 0,
            start_bar: 0,
            length_bars: 1,
            beats_per_bar: 4.0,
            meter: "4/4".into(),
            notes,
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let notes = vec![note(60, 0.0, 0.25), note(64, 0.25, 0.25)];
        let chunk = one_bar_chunk(notes);
        let a = fingerprint_chunk(&chunk, 16, false);
        let b = fingerprint_chunk(&chunk, 16, false);
        assert_eq!(a.combo_fp, b.combo_fp);
        assert_eq!(a.pattern_id, b.pattern_id);
        assert_eq!(a.pattern_id.len(), 12);
    }

    #[test]
    fn transposition_preserves_pitch_fp() {
        let cycle = [60u8, 64, 67, 72, 67, 64];
        let c_notes: Vec<_> = cycle
            .iter()
            .enumerate()
            .map(|(i, &p)| note(p, i as f64 * 0.25, 0.2))
            .collect();
        let d_notes: Vec<_> = cycle
            .iter()
            .enumerate()
            .map(|(i, &p)| note(p + 2, i as f64 * 0.25, 0.2))
            .collect();

        let c_fp = fingerprint_chunk(&one_bar_chunk(c_notes), 16, false);
        let d_fp = fingerprint_chunk(&one_bar_chunk(d_notes), 16, false);

        assert_eq!(c_fp.pitch_fp, d_fp.pitch_fp);
        // Same rhythm too, so the whole pattern id matches
        assert_eq!(c_fp.pattern_id, d_fp.pattern_id);
    }

    #[test]
    fn c_major_arp_interval_sequence() {
        let cycle = [60u8, 64, 67, 72, 67, 64];
        let notes: Vec<_> = cycle
            .iter()
            .enumerate()
            .map(|(i, &p)| note(p, i as f64 * 0.25, 0.2))
            .collect();
        let fp = fingerprint_chunk(&one_bar_chunk(notes), 16, false);
        assert_eq!(fp.stats.intervals, vec![0, 4, 7, 12, 7, 4]);
    }

    #[test]
    fn single_note_fingerprints() {
        let fp = fingerprint_chunk(&one_bar_chunk(vec![note(60, 0.0, 1.0)]), 16, false);
        assert_eq!(fp.stats.intervals, vec![0]);
        assert_eq!(fp.stats.onset_steps, vec![0]);
        assert_eq!(fp.stats.onset_count, 1);
    }

    #[test]
    fn rhythm_grid_length_matches_bars_times_grid() {
        let notes = vec![note(60, 0.0, 0.25)];
        let chunk = Chunk {
            length_bars: 2,
            ..one_bar_chunk(notes)
        };
        let fp = fingerprint_chunk(&chunk, 16, false);
        // 32 steps → 4 bytes → fixed digest; densities normalize over 32
        assert!((fp.stats.density - 1.0 / 32.0).abs() < 1e-9);
    }

    #[test]
    fn four_on_floor_rhythm_bits() {
        let notes: Vec<_> = (0..4).map(|i| drum_note(36, i as f64)).collect();
        let chunk = one_bar_chunk(notes);
        let fp = fingerprint_chunk(&chunk, 16, false);
        assert_eq!(fp.stats.onset_steps, vec![0, 4, 8, 12]);
    }

    #[test]
    fn weighted_variant_differs_from_binary() {
        let notes = vec![note(60, 0.0, 0.25), note(64, 1.0, 0.25)];
        let chunk = one_bar_chunk(notes);
        let binary = fingerprint_chunk(&chunk, 16, false);
        let weighted = fingerprint_chunk(&chunk, 16, true);
        assert_ne!(binary.rhythm_fp, weighted.rhythm_fp);
    }

    #[test]
    fn weighted_variant_separates_velocity_buckets() {
        let soft = vec![NoteEvent {
            velocity: 40,
            ..note(60, 0.0, 0.25)
        }];
        let loud = vec![NoteEvent {
            velocity: 120,
            ..note(60, 0.0, 0.25)
        }];
        let soft_fp = fingerprint_chunk(&one_bar_chunk(soft), 16, true);
        let loud_fp = fingerprint_chunk(&one_bar_chunk(loud), 16, true);
        assert_ne!(soft_fp.rhythm_fp, loud_fp.rhythm_fp);
    }

    #[test]
    fn binary_variant_ignores_velocity() {
        let soft = vec![NoteEvent {
            velocity: 40,
            ..note(60, 0.0, 0.25)
        }];
        let loud = vec![NoteEvent {
            velocity: 120,
            ..note(60, 0.0, 0.25)
        }];
        let soft_fp = fingerprint_chunk(&one_bar_chunk(soft), 16, false);
        let loud_fp = fingerprint_chunk(&one_bar_chunk(loud), 16, false);
        assert_eq!(soft_fp.rhythm_fp, loud_fp.rhythm_fp);
    }

    #[test]
    fn drum_representation_quantizes_hits() {
        let notes = vec![drum_note(36, 0.0), drum_note(38, 1.0)];
        let chunk = one_bar_chunk(notes);
        let rep = build_representation(&chunk, 16, TrackRole::Drums);
        match rep {
            Representation::Drum(drum) => {
                assert_eq!(drum.steps_per_bar, 16);
                assert_eq!(drum.hits.len(), 2);
                assert_eq!(drum.hits[0].step, 0);
                assert_eq!(drum.hits[1].step, 4);
            }
            other => panic!("expected drum representation, got {other:?}"),
        }
    }

    #[test]
    fn melodic_representation_relative_intervals() {
        let notes = vec![note(60, 0.0, 0.5), note(67, 1.0, 0.5)];
        let chunk = one_bar_chunk(notes);
        let rep = build_representation(&chunk, 16, TrackRole::Lead);
        match rep {
            Representation::Melodic(pattern) => {
                assert_eq!(pattern.events[0].interval, 0);
                assert_eq!(pattern.events[1].interval, 7);
                assert_eq!(pattern.events[1].step, 4);
                assert_eq!(pattern.events[0].dur, 2);
            }
            other => panic!("expected melodic representation, got {other:?}"),
        }
    }
}
