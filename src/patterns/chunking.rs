use crate::ingest::timing::TimingMap;
use crate::model::{NoteEvent, TimeSigSegment, Track};

/// Chunk lengths mined from every track, in bars.
pub const CHUNK_LENGTHS: [usize; 3] = [1, 2, 4];

/// A bar-aligned window of a track with chunk-local note timing.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub track_index: usize,
    pub start_bar: usize,
    pub length_bars: usize,
    pub beats_per_bar: f64,
    /// Meter at the chunk start, e.g. "4/4".
    pub meter: String,
    /// Notes starting inside the chunk, start_beat relative to chunk start.
    pub notes: Vec<NoteEvent>,
}

impl Chunk {
    pub fn duration_beats(&self) -> f64 {
        self.length_bars as f64 * self.beats_per_bar
    }
}

/// Segment a track into non-overlapping chunks of `length_bars` starting on
/// bar boundaries. Chunks without onsets are skipped, as are trailing
/// windows that would extend past the end of the song.
pub fn chunk_track(
    track: &Track,
    time_sigs: &[TimeSigSegment],
    total_bars: usize,
    length_bars: usize,
) -> Vec<Chunk> {
    let timing = TimingMap::new(time_sigs);
    let mut chunks = Vec::new();

    let mut bar = 0usize;
    while bar + length_bars <= total_bars {
        let start_beat = timing.bar_start_beat(bar);
        let beats_per_bar = timing.beats_per_bar_at(bar);
        let end_beat = start_beat + length_bars as f64 * beats_per_bar;

        let notes: Vec<NoteEvent> = track
            .notes
            .iter()
            .filter(|n| n.start_beat >= start_beat && n.start_beat < end_beat)
            .map(|n| NoteEvent {
                start_beat: n.start_beat - start_beat,
                ..n.clone()
            })
            .collect();

        if !notes.is_empty() {
            chunks.push(Chunk {
                track_index: track.track_index,
                start_bar: bar,
                length_bars,
                beats_per_bar,
                meter: timing.segment_at_bar(bar).meter(),
                notes,
            });
        }

        bar += length_bars;
    }

    chunks
}

/// All chunk sizes for a track.
pub fn chunk_track_all_lengths(
    track: &Track,
    time_sigs: &[TimeSigSegment],
    total_bars: usize,
) -> Vec<Chunk> {
    CHUNK_LENGTHS
        .iter()
        .flat_map(|&len| chunk_track(track, time_sigs, total_bars, len))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::test_support::*;

    #[test]
    fn empty_track_yields_no_chunks() {
        let t = track(vec![]);
        assert!(chunk_track(&t, &four_four(), 4, 1).is_empty());
    }

    #[test]
    fn chunks_align_to_bar_boundaries() {
        let notes: Vec<_> = (0..8).map(|i| note(60, i as f64, 0.5)).collect();
        let t = track(notes);
        let chunks = chunk_track(&t, &four_four(), 2, 1);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start_bar, 0);
        assert_eq!(chunks[1].start_bar, 1);
        // Second chunk's notes are local to its own start
        assert!((chunks[1].notes[0].start_beat - 0.0).abs() < 1e-9);
    }

    #[test]
    fn silent_bars_are_skipped() {
        // Notes only in bar 0 and bar 2
        let notes = vec![note(60, 0.0, 0.5), note(62, 8.0, 0.5)];
        let t = track(notes);
        let chunks = chunk_track(&t, &four_four(), 3, 1);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start_bar, 0);
        assert_eq!(chunks[1].start_bar, 2);
    }

    #[test]
    fn trailing_partial_window_not_emitted() {
        let notes = vec![note(60, 0.0, 0.5), note(62, 8.0, 0.5)];
        let t = track(notes);
        // 3 total bars: one full 2-bar chunk fits, the [2,4) window does not
        let chunks = chunk_track(&t, &four_four(), 3, 2);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_bar, 0);
    }

    #[test]
    fn meter_honored_in_chunk_length() {
        let sigs = vec![crate::model::TimeSigSegment {
            start_bar: 0,
            start_beat: 0.0,
            numerator: 3,
            denominator: 4,
        }];
        let notes = vec![note(60, 0.0, 0.5), note(62, 3.0, 0.5)];
        let t = track(notes);
        let chunks = chunk_track(&t, &sigs, 2, 1);

        assert_eq!(chunks.len(), 2);
        assert!((chunks[0].beats_per_bar - 3.0).abs() < 1e-9);
        assert_eq!(chunks[0].meter, "3/4");
        // Note at beat 3.0 is the downbeat of bar 1 in 3/4
        assert_eq!(chunks[1].start_bar, 1);
        assert!((chunks[1].notes[0].start_beat - 0.0).abs() < 1e-9);
    }

    #[test]
    fn all_lengths_cover_one_two_four() {
        let notes: Vec<_> = (0..16).map(|i| note(60, i as f64, 0.5)).collect();
        let t = track(notes);
        let chunks = chunk_track_all_lengths(&t, &four_four(), 4);

        let ones = chunks.iter().filter(|c| c.length_bars == 1).count();
        let twos = chunks.iter().filter(|c| c.length_bars == 2).count();
        let fours = chunks.iter().filter(|c| c.length_bars == 4).count();
        assert_eq!((ones, twos, fours), (4, 2, 1));
    }
}
