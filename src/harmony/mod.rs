pub mod chords;
pub mod keys;

use crate::model::Mode;

/// Scale pitch classes relative to a tonic (natural minor for minor keys).
pub fn scale_pitch_classes(tonic: u8, mode: Mode) -> [u8; 7] {
    let steps: [u8; 7] = match mode {
        Mode::Major => [0, 2, 4, 5, 7, 9, 11],
        Mode::Minor => [0, 2, 3, 5, 7, 8, 10],
    };
    let mut out = [0u8; 7];
    for (i, step) in steps.iter().enumerate() {
        out[i] = (tonic + step) % 12;
    }
    out
}

/// Whether every pitch class of a chord lies inside the key's scale.
pub fn chord_is_diatonic(root: u8, intervals: &[u8], tonic: u8, mode: Mode) -> bool {
    let scale = scale_pitch_classes(tonic, mode);
    intervals
        .iter()
        .all(|&iv| scale.contains(&((root + iv) % 12)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_major_scale() {
        let scale = scale_pitch_classes(0, Mode::Major);
        assert_eq!(scale, [0, 2, 4, 5, 7, 9, 11]);
    }

    #[test]
    fn a_minor_scale_shares_c_major_pitches() {
        let minor = scale_pitch_classes(9, Mode::Minor);
        let major = scale_pitch_classes(0, Mode::Major);
        for pc in minor {
            assert!(major.contains(&pc));
        }
    }

    #[test]
    fn diatonic_chords_in_c() {
        // C major triad is diatonic in C major, C# major is not
        assert!(chord_is_diatonic(0, &[0, 4, 7], 0, Mode::Major));
        assert!(!chord_is_diatonic(1, &[0, 4, 7], 0, Mode::Major));
        // A minor triad is diatonic in C major
        assert!(chord_is_diatonic(9, &[0, 3, 7], 0, Mode::Major));
    }
}
