pub mod metadata;
pub mod timing;

use std::collections::HashMap;
use std::path::Path;

use midly::{MetaMessage, MidiMessage, Smf, TrackEventKind};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{NoteEvent, Song, SongMetadata, TempoSegment, TimeSigSegment, Track};
use timing::TimingMap;

/// Default MIDI tempo (120 BPM).
const DEFAULT_TEMPO: u32 = 500_000;
const DEFAULT_TICKS_PER_QUARTER: u16 = 480;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MIDI parse error: {0}")]
    Parse(String),
}

/// Normalize a MIDI file on disk into a beat-domain [`Song`].
pub fn normalize_file(path: &Path) -> Result<Song, NormalizeError> {
    let bytes = std::fs::read(path)?;
    normalize_bytes(&bytes, &path.to_string_lossy())
}

/// Normalize raw SMF bytes into a beat-domain [`Song`].
///
/// Note-ons pair with the next matching off (or velocity-0 on) on the same
/// (channel, pitch). Unmatched note-ons and zero-duration notes are dropped
/// and surface as `warning_count` on the song.
pub fn normalize_bytes(bytes: &[u8], source_path: &str) -> Result<Song, NormalizeError> {
    let smf = Smf::parse(bytes).map_err(|e| NormalizeError::Parse(e.to_string()))?;

    let ticks_per_quarter = match smf.header.timing {
        midly::Timing::Metrical(ticks) => ticks.as_int(),
        midly::Timing::Timecode(_, _) => DEFAULT_TICKS_PER_QUARTER,
    };
    let tpq = ticks_per_quarter as f64;

    let song_id = content_hash(bytes);

    let mut tempo_raw: Vec<(u64, u32)> = Vec::new();
    let mut timesig_raw: Vec<(u64, u8, u8)> = Vec::new();
    let mut max_tick: u64 = 0;
    let mut warning_count: u32 = 0;
    let mut tracks: Vec<Track> = Vec::new();

    for (track_index, events) in smf.tracks.iter().enumerate() {
        let mut current_tick: u64 = 0;
        let mut name = String::new();
        // (channel, pitch) → stack of (onset_tick, velocity)
        let mut pending: HashMap<(u8, u8), Vec<(u64, u8)>> = HashMap::new();
        let mut notes: Vec<NoteEvent> = Vec::new();

        for event in events {
            current_tick += event.delta.as_int() as u64;

            match event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => {
                    tempo_raw.push((current_tick, tempo.as_int()));
                }
                TrackEventKind::Meta(MetaMessage::TimeSignature(num, denom_pow, _, _)) => {
                    timesig_raw.push((current_tick, num, 1u8 << denom_pow));
                }
                TrackEventKind::Meta(MetaMessage::TrackName(bytes)) => {
                    if name.is_empty() {
                        if let Ok(s) = String::from_utf8(bytes.to_vec()) {
                            name = s.trim().to_string();
                        }
                    }
                }
                TrackEventKind::Midi { channel, message } => {
                    let ch = channel.as_int();
                    match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            pending
                                .entry((ch, key.as_int()))
                                .or_default()
                                .push((current_tick, vel.as_int()));
                        }
                        MidiMessage::NoteOff { key, .. } | MidiMessage::NoteOn { key, .. } => {
                            // vel=0 NoteOn is NoteOff
                            if let Some(stack) = pending.get_mut(&(ch, key.as_int())) {
                                if let Some((onset, velocity)) = stack.pop() {
                                    if current_tick > onset {
                                        notes.push(NoteEvent {
                                            start_beat: onset as f64 / tpq,
                                            duration_beats: (current_tick - onset) as f64 / tpq,
                                            pitch: key.as_int(),
                                            velocity,
                                            channel: ch,
                                        });
                                    } else {
                                        // Zero-duration note
                                        warning_count += 1;
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }

            max_tick = max_tick.max(current_tick);
        }

        // Unmatched note-ons are discarded, not force-closed
        let unmatched: u32 = pending.values().map(|s| s.len() as u32).sum();
        if unmatched > 0 {
            log::warn!(
                "{}: {} unmatched note-on(s) in track {}",
                source_path,
                unmatched,
                track_index
            );
            warning_count += unmatched;
        }

        if notes.is_empty() {
            continue;
        }

        notes.sort_by(|a, b| {
            a.start_beat
                .partial_cmp(&b.start_beat)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.pitch.cmp(&b.pitch))
        });

        let channel = primary_channel(&notes);

        tracks.push(Track {
            track_index,
            name,
            channel,
            notes,
            features: None,
            role_probs: None,
        });
    }

    let total_beats = max_tick as f64 / tpq;
    let tempo_map = build_tempo_map(tempo_raw, tpq);
    let time_sig_map = build_time_sig_map(timesig_raw, tpq);
    let total_bars = TimingMap::new(&time_sig_map).bars_for(total_beats);

    Ok(Song {
        song_id,
        source_path: source_path.to_string(),
        ticks_per_quarter,
        tempo_map,
        time_sig_map,
        tracks,
        total_beats,
        total_bars,
        warning_count,
        metadata: SongMetadata::default(),
    })
}

/// First 16 hex chars of the SHA-256 of the file content.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

fn primary_channel(notes: &[NoteEvent]) -> u8 {
    let mut counts: HashMap<u8, usize> = HashMap::new();
    for note in notes {
        *counts.entry(note.channel).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(ch, count)| (count, std::cmp::Reverse(ch)))
        .map(|(ch, _)| ch)
        .unwrap_or(0)
}

/// Sorted, gap-free tempo map covering from beat 0. Duplicate ticks keep
/// the last event (format-1 conductor convention).
fn build_tempo_map(mut raw: Vec<(u64, u32)>, tpq: f64) -> Vec<TempoSegment> {
    raw.sort_by_key(|&(tick, _)| tick);

    let mut map: Vec<TempoSegment> = Vec::new();
    for (tick, uspq) in raw {
        let start_beat = tick as f64 / tpq;
        if let Some(last) = map.last_mut() {
            if (last.start_beat - start_beat).abs() < 1e-9 {
                last.microseconds_per_quarter = uspq;
                continue;
            }
            if last.microseconds_per_quarter == uspq {
                continue;
            }
        }
        map.push(TempoSegment {
            start_beat,
            microseconds_per_quarter: uspq,
        });
    }

    if map.first().map(|s| s.start_beat > 1e-9).unwrap_or(true) {
        map.insert(
            0,
            TempoSegment {
                start_beat: 0.0,
                microseconds_per_quarter: DEFAULT_TEMPO,
            },
        );
    }

    map
}

/// Sorted, gap-free time-signature map covering from bar 0. Bar indices are
/// assigned by walking the previous segment's bar length.
fn build_time_sig_map(mut raw: Vec<(u64, u8, u8)>, tpq: f64) -> Vec<TimeSigSegment> {
    raw.sort_by_key(|&(tick, _, _)| tick);

    let mut map: Vec<TimeSigSegment> = Vec::new();
    for (tick, numerator, denominator) in raw {
        let numerator = numerator.max(1);
        let start_beat = tick as f64 / tpq;

        let start_bar = match map.last() {
            Some(prev) => {
                let bars = ((start_beat - prev.start_beat) / prev.beats_per_bar()).round();
                prev.start_bar + bars.max(0.0) as usize
            }
            None => 0,
        };

        if let Some(last) = map.last_mut() {
            if (last.start_beat - start_beat).abs() < 1e-9 {
                last.numerator = numerator;
                last.denominator = denominator;
                continue;
            }
            if last.numerator == numerator && last.denominator == denominator {
                continue;
            }
        }

        map.push(TimeSigSegment {
            start_bar,
            start_beat,
            numerator,
            denominator,
        });
    }

    if map.first().map(|s| s.start_beat > 1e-9).unwrap_or(true) {
        map.insert(
            0,
            TimeSigSegment {
                start_bar: 0,
                start_beat: 0.0,
                numerator: 4,
                denominator: 4,
            },
        );
    }

    map
}

#[cfg(test)]
pub(crate) mod test_midi {
    /// Build a minimal format-1 SMF: a conductor track (tempo + optional
    /// time signature) and one note track.
    pub fn build_smf(
        ppq: u16,
        tempo: Option<u32>,
        time_sig: Option<(u8, u8)>,
        notes: &[(u8, u8, u32, u32)], // (pitch, velocity, onset_tick, off_tick)
    ) -> Vec<u8> {
        build_smf_on_channel(ppq, tempo, time_sig, notes, 0)
    }

    pub fn build_smf_on_channel(
        ppq: u16,
        tempo: Option<u32>,
        time_sig: Option<(u8, u8)>,
        notes: &[(u8, u8, u32, u32)],
        channel: u8,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"MThd");
        buf.extend_from_slice(&6u32.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&ppq.to_be_bytes());

        let mut track0 = Vec::new();
        if let Some(uspq) = tempo {
            track0.extend_from_slice(&[0x00, 0xFF, 0x51, 0x03]);
            track0.extend_from_slice(&uspq.to_be_bytes()[1..]);
        }
        if let Some((num, denom)) = time_sig {
            let denom_pow = denom.trailing_zeros() as u8;
            track0.extend_from_slice(&[0x00, 0xFF, 0x58, 0x04, num, denom_pow, 0x18, 0x08]);
        }
        track0.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
        buf.extend_from_slice(b"MTrk");
        buf.extend_from_slice(&(track0.len() as u32).to_be_bytes());
        buf.extend_from_slice(&track0);

        // Interleave on/off events in tick order
        let mut events: Vec<(u32, bool, u8, u8)> = Vec::new();
        for &(pitch, vel, on, off) in notes {
            events.push((on, true, pitch, vel));
            events.push((off, false, pitch, 0));
        }
        events.sort_by_key(|&(tick, is_on, pitch, _)| (tick, !is_on, pitch));

        let mut track1 = Vec::new();
        let mut last_tick = 0u32;
        for (tick, is_on, pitch, vel) in events {
            write_varlen(&mut track1, tick - last_tick);
            last_tick = tick;
            if is_on {
                track1.extend_from_slice(&[0x90 | channel, pitch, vel]);
            } else {
                track1.extend_from_slice(&[0x80 | channel, pitch, 0]);
            }
        }
        track1.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
        buf.extend_from_slice(b"MTrk");
        buf.extend_from_slice(&(track1.len() as u32).to_be_bytes());
        buf.extend_from_slice(&track1);

        buf
    }

    fn write_varlen(buf: &mut Vec<u8>, mut value: u32) {
        let mut bytes = vec![(value & 0x7F) as u8];
        value >>= 7;
        while value > 0 {
            bytes.push(((value & 0x7F) | 0x80) as u8);
            value >>= 7;
        }
        bytes.reverse();
        buf.extend_from_slice(&bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::test_midi::{build_smf, build_smf_on_channel};
    use super::*;

    #[test]
    fn normalize_simple_melody() {
        let ppq = 480;
        let bytes = build_smf(
            ppq,
            Some(500_000),
            Some((4, 4)),
            &[(60, 100, 0, 480), (64, 100, 480, 960), (67, 100, 960, 1440)],
        );
        let song = normalize_bytes(&bytes, "test.mid").unwrap();

        assert_eq!(song.ticks_per_quarter, 480);
        assert_eq!(song.tracks.len(), 1);
        assert_eq!(song.warning_count, 0);

        let notes = &song.tracks[0].notes;
        assert_eq!(notes.len(), 3);
        assert!((notes[0].start_beat - 0.0).abs() < 1e-9);
        assert!((notes[1].start_beat - 1.0).abs() < 1e-9);
        assert!((notes[0].duration_beats - 1.0).abs() < 1e-9);
        assert_eq!(notes[2].pitch, 67);
    }

    #[test]
    fn default_tempo_and_meter_when_absent() {
        let bytes = build_smf(480, None, None, &[(60, 100, 0, 480)]);
        let song = normalize_bytes(&bytes, "test.mid").unwrap();

        assert_eq!(song.tempo_map.len(), 1);
        assert_eq!(song.tempo_map[0].microseconds_per_quarter, 500_000);
        assert_eq!(song.time_sig_map.len(), 1);
        assert_eq!(song.time_sig_map[0].numerator, 4);
        assert_eq!(song.time_sig_map[0].denominator, 4);
    }

    #[test]
    fn unmatched_note_on_is_dropped_with_warning() {
        // Note-off for a pitch that was never started, plus a dangling on
        let ppq = 480;
        let mut bytes = build_smf(ppq, Some(500_000), None, &[]);
        // Rebuild track1 manually: NoteOn 60 with no off
        let track1 = [
            0x00u8, 0x90, 60, 100, // dangling note-on
            0x00, 0xFF, 0x2F, 0x00,
        ];
        // Replace last track chunk
        let hdr_len = 14;
        let track0_len = u32::from_be_bytes([
            bytes[hdr_len + 4],
            bytes[hdr_len + 5],
            bytes[hdr_len + 6],
            bytes[hdr_len + 7],
        ]) as usize;
        bytes.truncate(hdr_len + 8 + track0_len);
        bytes.extend_from_slice(b"MTrk");
        bytes.extend_from_slice(&(track1.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&track1);

        let song = normalize_bytes(&bytes, "test.mid").unwrap();
        assert_eq!(song.warning_count, 1);
        assert!(song.tracks.is_empty());
    }

    #[test]
    fn velocity_zero_note_on_acts_as_off() {
        let ppq = 480;
        // Manually: on at 0, vel-0 on at 480
        let mut bytes = build_smf(ppq, Some(500_000), None, &[]);
        let track1 = [
            0x00u8, 0x90, 60, 100, //
            0x83, 0x60, 0x90, 60, 0, // delta 480, vel 0 → off
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let hdr_len = 14;
        let track0_len = u32::from_be_bytes([
            bytes[hdr_len + 4],
            bytes[hdr_len + 5],
            bytes[hdr_len + 6],
            bytes[hdr_len + 7],
        ]) as usize;
        bytes.truncate(hdr_len + 8 + track0_len);
        bytes.extend_from_slice(b"MTrk");
        bytes.extend_from_slice(&(track1.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&track1);

        let song = normalize_bytes(&bytes, "test.mid").unwrap();
        assert_eq!(song.tracks.len(), 1);
        assert_eq!(song.tracks[0].notes.len(), 1);
        assert!((song.tracks[0].notes[0].duration_beats - 1.0).abs() < 1e-9);
    }

    #[test]
    fn non_four_four_meter_bars() {
        let ppq = 480;
        // 3/4: a bar is 3 beats = 1440 ticks
        let bytes = build_smf(
            ppq,
            Some(500_000),
            Some((3, 4)),
            &[(60, 100, 0, 480), (62, 100, 1440, 1920)],
        );
        let song = normalize_bytes(&bytes, "test.mid").unwrap();
        assert_eq!(song.time_sig_map[0].numerator, 3);

        let map = TimingMap::new(&song.time_sig_map);
        assert_eq!(map.bar_of_beat(song.tracks[0].notes[1].start_beat), 1);
    }

    #[test]
    fn channel_10_preserved() {
        let bytes =
            build_smf_on_channel(480, Some(500_000), None, &[(36, 110, 0, 120)], 9);
        let song = normalize_bytes(&bytes, "drums.mid").unwrap();
        assert_eq!(song.tracks[0].channel, 9);
    }

    #[test]
    fn song_id_is_stable_content_hash() {
        let bytes = build_smf(480, Some(500_000), None, &[(60, 100, 0, 480)]);
        let a = normalize_bytes(&bytes, "a.mid").unwrap();
        let b = normalize_bytes(&bytes, "b.mid").unwrap();
        // Same bytes → same id regardless of path
        assert_eq!(a.song_id, b.song_id);
        assert_eq!(a.song_id.len(), 16);
    }

    #[test]
    fn parse_error_on_garbage() {
        assert!(normalize_bytes(b"not a midi file", "x.mid").is_err());
    }
}
