/// Query parameters for the clip/pattern search contract.
#[derive(Debug, Clone, Default)]
pub struct ClipQuery {
    pub role: Option<String>,
    pub genre: Option<String>,
    pub artist: Option<String>,
    pub meter: Option<String>,
    pub min_length_bars: Option<usize>,
    pub max_length_bars: Option<usize>,
    pub limit: usize,
    pub offset: usize,
}

impl ClipQuery {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// A pattern row returned from a clip query.
#[derive(Debug, Clone)]
pub struct ClipResult {
    pub pattern_id: String,
    pub role: String,
    pub length_bars: usize,
    pub meter: String,
    pub grid_resolution: usize,
    pub instance_count: usize,
    /// Canonical JSON representation (drum/melodic/arp variant).
    pub representation: String,
}

/// A song row for display.
#[derive(Debug, Clone)]
pub struct SongRow {
    pub song_id: String,
    pub source_path: String,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub total_bars: usize,
    pub detected_key: Option<String>,
    pub analysis_status: String,
    pub warning_count: u32,
}

/// A stored chord row for display.
#[derive(Debug, Clone)]
pub struct ChordRow {
    pub start_beat: f64,
    pub end_beat: f64,
    pub name: String,
    pub roman: String,
    pub confidence: f64,
}

/// A stored section row for display.
#[derive(Debug, Clone)]
pub struct SectionRow {
    pub start_bar: usize,
    pub end_bar: usize,
    pub form_label: String,
    pub type_hint: Option<String>,
}

/// A stored track row for display.
#[derive(Debug, Clone)]
pub struct TrackRow {
    pub track_index: usize,
    pub name: String,
    pub channel: u8,
    pub note_count: usize,
    pub primary_role: Option<String>,
}

/// Library statistics.
#[derive(Debug, Default)]
pub struct LibraryStats {
    pub total_songs: i64,
    pub total_tracks: i64,
    pub total_patterns: i64,
    pub total_instances: i64,
    pub patterns_by_role: Vec<(String, i64)>,
    pub songs_by_status: Vec<(String, i64)>,
}
