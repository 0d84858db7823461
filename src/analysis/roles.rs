use crate::model::{RoleProbs, TrackFeatures};

/// Softmax temperature. Raw score margins are small (a point or two), so
/// the distribution is sharpened before normalizing; downstream consumers
/// threshold on 0.5.
const SHARPNESS: f64 = 2.0;

/// Fixed-weight linear role scores mapped through a softmax.
///
/// The weights are tunable constants, not learned. Tracks that read as
/// drums (channel 10 dominating drum_likeness) suppress the melodic role
/// scores entirely, since a kit never doubles as bass or lead.
pub fn classify(features: Option<&TrackFeatures>) -> RoleProbs {
    let f = match features {
        Some(f) if f.onset_count > 0 => f,
        _ => return RoleProbs::all_other(),
    };

    let poly = f.polyphony_ratio;
    let pitch_range_norm = (f.pitch_range as f64 / 48.0).min(1.0);
    let is_drum_kit = f.drum_likeness > 0.5;

    let drums = 4.0 * f.drum_likeness + indicator(f.density > 8.0);

    let (bass, chords, pad, lead, arp) = if is_drum_kit {
        (0.0, 0.0, 0.0, 0.0, 0.0)
    } else {
        let bass = 2.0 * indicator(f.median_pitch < 48.0)
            + (1.0 - poly)
            + f.downbeat_ratio;
        let chords = 2.0 * poly + indicator(f.mean_duration > 1.0);
        let pad = chords + indicator(f.density < 1.0);
        let lead = 1.5 * (1.0 - poly)
            + pitch_range_norm
            + 0.5 * indicator(f.median_pitch >= 48.0 && f.median_pitch <= 84.0);
        let arp = 2.0 * indicator(f.density > 6.0)
            + 1.5 * f.repetition
            + f.broken_chord_ratio;
        (bass, chords, pad, lead, arp)
    };

    softmax([drums, bass, chords, pad, lead, arp, 0.1])
}

fn indicator(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

fn softmax(scores: [f64; 7]) -> RoleProbs {
    let max = scores.iter().cloned().fold(f64::MIN, f64::max);
    let exps: Vec<f64> = scores
        .iter()
        .map(|s| (SHARPNESS * (s - max)).exp())
        .collect();
    let sum: f64 = exps.iter().sum();

    RoleProbs {
        drums: exps[0] / sum,
        bass: exps[1] / sum,
        chords: exps[2] / sum,
        pad: exps[3] / sum,
        lead: exps[4] / sum,
        arp: exps[5] / sum,
        other: exps[6] / sum,
    }
}
