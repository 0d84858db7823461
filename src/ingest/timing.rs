use crate::model::{TempoSegment, TimeSigSegment};

/// Resolves beat positions to bars and grid steps by walking the
/// time-signature map. Maps are sorted and gap-free from beat 0.
pub struct TimingMap<'a> {
    time_sigs: &'a [TimeSigSegment],
}

impl<'a> TimingMap<'a> {
    pub fn new(time_sigs: &'a [TimeSigSegment]) -> Self {
        Self { time_sigs }
    }

    /// The time signature segment active at `beat`.
    pub fn segment_at_beat(&self, beat: f64) -> &TimeSigSegment {
        let mut active = &self.time_sigs[0];
        for ts in self.time_sigs {
            if ts.start_beat <= beat {
                active = ts;
            } else {
                break;
            }
        }
        active
    }

    /// The time signature segment active at `bar`.
    pub fn segment_at_bar(&self, bar: usize) -> &TimeSigSegment {
        let mut active = &self.time_sigs[0];
        for ts in self.time_sigs {
            if ts.start_bar <= bar {
                active = ts;
            } else {
                break;
            }
        }
        active
    }

    /// Bar index containing `beat`.
    pub fn bar_of_beat(&self, beat: f64) -> usize {
        let ts = self.segment_at_beat(beat);
        let beats_since = beat - ts.start_beat;
        ts.start_bar + (beats_since / ts.beats_per_bar()).floor() as usize
    }

    /// Beat position at the start of `bar`.
    pub fn bar_start_beat(&self, bar: usize) -> f64 {
        let ts = self.segment_at_bar(bar);
        ts.start_beat + (bar - ts.start_bar) as f64 * ts.beats_per_bar()
    }

    /// Beats per bar at `bar`.
    pub fn beats_per_bar_at(&self, bar: usize) -> f64 {
        self.segment_at_bar(bar).beats_per_bar()
    }

    /// Grid step of an onset at `beat` within its bar, for a grid of
    /// `steps_per_bar`. Raw timing is retained by callers; this is the
    /// quantized view.
    pub fn step_of_onset(&self, beat: f64, steps_per_bar: usize) -> usize {
        let bar = self.bar_of_beat(beat);
        let bar_start = self.bar_start_beat(bar);
        let beats_per_step = self.beats_per_bar_at(bar) / steps_per_bar as f64;
        ((beat - bar_start) / beats_per_step).round() as usize
    }

    /// Total bars needed to cover `total_beats`.
    pub fn bars_for(&self, total_beats: f64) -> usize {
        if total_beats <= 0.0 {
            return 0;
        }
        // Walk up from the last bar containing the final beat.
        self.bar_of_beat(total_beats - 1e-9) + 1
    }
}

/// Tempo in BPM at `beat`. Defaults to 120 on an empty map.
pub fn tempo_at_beat(tempo_map: &[TempoSegment], beat: f64) -> f64 {
    let mut active: Option<&TempoSegment> = None;
    for seg in tempo_map {
        if seg.start_beat <= beat {
            active = Some(seg);
        } else {
            break;
        }
    }
    active
        .or_else(|| tempo_map.first())
        .map(|s| s.bpm())
        .unwrap_or(120.0)
}
