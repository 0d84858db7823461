use std::path::Path;
use std::sync::LazyLock;

use midly::{MetaMessage, Smf, TrackEventKind};
use regex::Regex;

use crate::model::SongMetadata;

/// Text-bearing meta events pulled from an SMF for metadata resolution.
#[derive(Debug, Default, Clone)]
pub struct MidiMetaText {
    /// Track-name (0x03) on track 0.
    pub track_name: Option<String>,
    /// Text events (0x01), any track.
    pub texts: Vec<String>,
    /// Copyright (0x02).
    pub copyright: Option<String>,
}

impl MidiMetaText {
    /// Collect meta text from raw SMF bytes. Parse failures yield an empty
    /// result; the resolver falls through to path heuristics.
    pub fn parse(bytes: &[u8]) -> Self {
        let smf = match Smf::parse(bytes) {
            Ok(smf) => smf,
            Err(_) => return Self::default(),
        };

        let mut out = Self::default();
        for (track_index, events) in smf.tracks.iter().enumerate() {
            for event in events {
                match event.kind {
                    TrackEventKind::Meta(MetaMessage::TrackName(raw)) => {
                        if track_index == 0 && out.track_name.is_none() {
                            if let Ok(s) = String::from_utf8(raw.to_vec()) {
                                let s = s.trim().to_string();
                                if !s.is_empty() {
                                    out.track_name = Some(s);
                                }
                            }
                        }
                    }
                    TrackEventKind::Meta(MetaMessage::Text(raw)) => {
                        if let Ok(s) = String::from_utf8(raw.to_vec()) {
                            let s = s.trim().to_string();
                            if !s.is_empty() {
                                out.texts.push(s);
                            }
                        }
                    }
                    TrackEventKind::Meta(MetaMessage::Copyright(raw)) => {
                        if out.copyright.is_none() {
                            if let Ok(s) = String::from_utf8(raw.to_vec()) {
                                let s = s.trim().to_string();
                                if !s.is_empty() {
                                    out.copyright = Some(s);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        out
    }
}

// Timestamp runs (8+ digits), e.g. nonstop2k's 20230130024203
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{8,}").unwrap());

// Trailing "-somedomain.tld" suffixes
static DOMAIN_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[-_.]?(?:[a-z0-9]+\.)+[a-z]{2,4}$").unwrap());

// "Artist - Title" in meta text
static ARTIST_DASH_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<artist>[^-]{2,})\s-\s(?P<title>.{2,})$").unwrap());

// "Title / Artist" in meta text
static TITLE_SLASH_ARTIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<title>[^/]{2,})\s*/\s*(?P<artist>.{2,})$").unwrap());

/// Resolve `(artist, title)` using priority-ordered strategies.
///
/// The first strategy yielding a non-empty result with confidence > 0.5
/// wins; otherwise the highest-confidence partial result is returned so
/// low-confidence matches remain available for human review.
pub fn resolve(path: &Path, meta: &MidiMetaText) -> SongMetadata {
    let candidates = [
        from_midi_meta(meta),
        from_folder_structure(path),
        from_filename(path),
    ];

    for candidate in &candidates {
        if candidate.confidence > 0.5 && (candidate.artist.is_some() || candidate.title.is_some())
        {
            return candidate.clone();
        }
    }

    candidates
        .into_iter()
        .filter(|c| c.artist.is_some() || c.title.is_some())
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or_default()
}

/// Strategy 1: MIDI meta events (track-name, text, copyright).
fn from_midi_meta(meta: &MidiMetaText) -> SongMetadata {
    let mut sources: Vec<&str> = Vec::new();
    if let Some(name) = &meta.track_name {
        sources.push(name);
    }
    for text in &meta.texts {
        sources.push(text);
    }
    if let Some(copyright) = &meta.copyright {
        sources.push(copyright);
    }

    for text in sources {
        if let Some(caps) = ARTIST_DASH_TITLE_RE.captures(text) {
            return SongMetadata {
                artist: Some(caps["artist"].trim().to_string()),
                title: Some(caps["title"].trim().to_string()),
                source: "midi_meta".into(),
                confidence: 0.7,
                ..SongMetadata::default()
            };
        }
        if let Some(caps) = TITLE_SLASH_ARTIST_RE.captures(text) {
            return SongMetadata {
                artist: Some(caps["artist"].trim().to_string()),
                title: Some(caps["title"].trim().to_string()),
                source: "midi_meta".into(),
                confidence: 0.7,
                ..SongMetadata::default()
            };
        }
    }

    SongMetadata::default()
}

/// Strategy 2: `<letter>/<artist>/<title>.mid` folder layout.
fn from_folder_structure(path: &Path) -> SongMetadata {
    let components: Vec<&str> = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();

    if components.len() < 3 {
        return SongMetadata::default();
    }

    let grandparent = components[components.len() - 3];
    let parent = components[components.len() - 2];

    if grandparent.chars().count() == 1 && grandparent.chars().all(|c| c.is_alphabetic()) {
        let title = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(clean_title)
            .unwrap_or_default();
        if title.is_empty() {
            return SongMetadata::default();
        }
        return SongMetadata {
            artist: Some(parent.to_string()),
            title: Some(title),
            source: "folder".into(),
            confidence: 0.9,
            ..SongMetadata::default()
        };
    }

    SongMetadata::default()
}

/// Strategy 3: filename heuristics.
fn from_filename(path: &Path) -> SongMetadata {
    let stem = match path.file_stem().and_then(|s| s.to_str()) {
        Some(s) => s,
        None => return SongMetadata::default(),
    };

    let cleaned = clean_filename(stem);
    if cleaned.is_empty() {
        return SongMetadata::default();
    }

    // "Artist - Title": the side with more capitalized words is the title
    if let Some((left, right)) = cleaned.split_once(" - ") {
        let (artist, title) = if capitalized_words(right) >= capitalized_words(left) {
            (left, right)
        } else {
            (right, left)
        };
        return SongMetadata {
            artist: Some(artist.trim().to_string()),
            title: Some(title.trim().to_string()),
            source: "filename".into(),
            confidence: 0.6,
            ..SongMetadata::default()
        };
    }

    // Hyphen-packed slugs: guess the artist from the leading words.
    // Too ambiguous to trust; flagged for human review by the low score.
    let parts: Vec<&str> = cleaned.split('-').filter(|p| !p.is_empty()).collect();
    if parts.len() >= 3 {
        let split = parts.len() / 2;
        return SongMetadata {
            artist: Some(title_case(&parts[..split].join(" "))),
            title: Some(title_case(&parts[split..].join(" "))),
            source: "filename_slug".into(),
            confidence: 0.4,
            ..SongMetadata::default()
        };
    }

    SongMetadata {
        artist: None,
        title: Some(clean_title(&cleaned)),
        source: "filename_fallback".into(),
        confidence: 0.4,
        ..SongMetadata::default()
    }
}

/// Strip timestamps and trailing domain suffixes from a filename stem.
fn clean_filename(stem: &str) -> String {
    let mut result = DOMAIN_SUFFIX_RE.replace(stem, "").to_string();
    result = TIMESTAMP_RE.replace_all(&result, "").to_string();
    result.trim_matches(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .to_string()
}

fn clean_title(raw: &str) -> String {
    let spaced = raw.replace(['_', '-'], " ");
    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    title_case(&collapsed)
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalized_words(s: &str) -> usize {
    s.split_whitespace()
        .filter(|w| w.chars().next().map(|c| c.is_uppercase()).unwrap_or(false))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn midi_meta_artist_dash_title() {
        let meta = MidiMetaText {
            track_name: Some("Daft Punk - Around The World".into()),
            ..MidiMetaText::default()
        };
        let result = resolve(&PathBuf::from("x.mid"), &meta);
        assert_eq!(result.artist.as_deref(), Some("Daft Punk"));
        assert_eq!(result.title.as_deref(), Some("Around The World"));
        assert!(result.confidence > 0.5);
        assert_eq!(result.source, "midi_meta");
    }

    #[test]
    fn midi_meta_title_slash_artist() {
        let meta = MidiMetaText {
            texts: vec!["One More Time / Daft Punk".into()],
            ..MidiMetaText::default()
        };
        let result = resolve(&PathBuf::from("x.mid"), &meta);
        assert_eq!(result.artist.as_deref(), Some("Daft Punk"));
        assert_eq!(result.title.as_deref(), Some("One More Time"));
    }

    #[test]
    fn folder_structure_wins_over_filename() {
        let path = PathBuf::from("D/Depeche Mode/enjoy_the_silence.mid");
        let result = resolve(&path, &MidiMetaText::default());
        assert_eq!(result.artist.as_deref(), Some("Depeche Mode"));
        assert_eq!(result.title.as_deref(), Some("Enjoy The Silence"));
        assert!((result.confidence - 0.9).abs() < 1e-9);
        assert_eq!(result.source, "folder");
    }

    #[test]
    fn filename_separator_split() {
        let path = PathBuf::from("ABBA - Dancing Queen.mid");
        let result = resolve(&path, &MidiMetaText::default());
        assert_eq!(result.artist.as_deref(), Some("ABBA"));
        assert_eq!(result.title.as_deref(), Some("Dancing Queen"));
        assert!(result.confidence > 0.5);
    }

    #[test]
    fn nonstop2k_slug_is_low_confidence() {
        let path =
            PathBuf::from("le-youth-jerro-lizzy-land-lost-20230130024203-nonstop2k.com.mid");
        let result = resolve(&path, &MidiMetaText::default());
        // Resolvable but below the 0.5 auto-accept threshold
        assert!(result.artist.is_some());
        assert!(result.confidence < 0.5);
    }

    #[test]
    fn timestamp_and_domain_stripped() {
        assert_eq!(
            clean_filename("artist-song-20230130024203-nonstop2k.com"),
            "artist-song"
        );
        assert_eq!(clean_filename("track-freemidi.org"), "track");
    }

    #[test]
    fn single_word_is_title_only() {
        let path = PathBuf::from("Sandstorm.mid");
        let result = resolve(&path, &MidiMetaText::default());
        assert_eq!(result.artist, None);
        assert_eq!(result.title.as_deref(), Some("Sandstorm"));
        assert!((result.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn composite_artist_separators_preserved() {
        // The side with fewer capitalized words is the artist; "&" is kept
        let path = PathBuf::from("elton john & dua lipa - Cold Heart.mid");
        let result = resolve(&path, &MidiMetaText::default());
        assert_eq!(result.artist.as_deref(), Some("elton john & dua lipa"));
        assert_eq!(result.title.as_deref(), Some("Cold Heart"));
    }

    #[test]
    fn title_case_helper() {
        assert_eq!(title_case("lizzy land lost"), "Lizzy Land Lost");
    }
}
