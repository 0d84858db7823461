use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LookupConfig;
use crate::db::Database;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("external service error: {0}")]
    Service(String),
    #[error("database error: {0}")]
    Db(#[from] crate::db::DbError),
}

/// Tag payload returned by a metadata provider for an (artist, title) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupRecord {
    /// Provider name → raw tags, e.g. {"lastfm": ["synthwave", "80s"]}.
    pub sources: BTreeMap<String, Vec<String>>,
    pub recording_id: Option<String>,
}

/// A genre/tag provider. Implementations own the transport; this crate
/// only specifies the contract and the caching around it.
pub trait MetadataSink {
    fn name(&self) -> &str;
    fn lookup(&self, artist: &str, title: &str) -> Result<Option<LookupRecord>, LookupError>;
}

/// Token-bucket rate gate. Refills continuously at `rate_per_sec` up to
/// `capacity` tokens.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    /// Per-source defaults: MusicBrainz 1/s, Discogs 60/min, Last.fm 5/s.
    pub fn for_source(source: &str) -> Self {
        match source {
            "musicbrainz" => Self::new(1.0, 1.0),
            "discogs" => Self::new(1.0, 1.0),
            "lastfm" => Self::new(5.0, 5.0),
            _ => Self::new(1.0, 1.0),
        }
    }

    pub fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token is available.
    pub fn next_available(&self, now: Instant) -> Duration {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        if tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - tokens) / self.rate_per_sec)
        }
    }
}

/// Cache key: lowercased, whitespace-normalized `(artist, title)`.
pub fn cache_key(artist: &str, title: &str) -> String {
    let normalize = |s: &str| {
        s.to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    };
    format!("{}|{}", normalize(artist), normalize(title))
}

/// Wraps a [`MetadataSink`] with the process-wide cache and rate gate.
///
/// - Fresh cache entries (30-day TTL by default) short-circuit the sink.
/// - Misses and exhausted retries are cached as negative entries with a
///   short TTL (1 day by default) so failing lookups are not hammered.
/// - Requests pass a per-source token bucket; retries back off
///   exponentially within the configured attempt budget.
pub struct CachedLookup<'a, S: MetadataSink> {
    sink: S,
    db: &'a Database,
    config: LookupConfig,
    bucket: TokenBucket,
}

impl<'a, S: MetadataSink> CachedLookup<'a, S> {
    pub fn new(sink: S, db: &'a Database, config: LookupConfig) -> Self {
        let bucket = TokenBucket::for_source(sink.name());
        Self {
            sink,
            db,
            config,
            bucket,
        }
    }

    /// Resolve tags for a song, consulting the cache first.
    pub fn lookup(&mut self, artist: &str, title: &str) -> Result<Option<LookupRecord>, LookupError> {
        let key = cache_key(artist, title);
        let now = unix_now();

        if let Some((payload, fresh)) = self.db.cache_get(&key, now)? {
            if fresh {
                return Ok(payload.and_then(|p| serde_json::from_str(&p).ok()));
            }
        }

        let ttl = self.config.cache_ttl_days * 86_400;
        let negative_ttl = self.config.negative_ttl_days * 86_400;
        let source = self.sink.name().to_string();

        let mut last_error: Option<LookupError> = None;
        for attempt in 0..self.config.retry_budget.max(1) {
            self.wait_for_token();

            match self.sink.lookup(artist, title) {
                Ok(Some(record)) => {
                    let payload = serde_json::to_string(&record)
                        .map_err(|e| LookupError::Service(e.to_string()))?;
                    self.db.cache_put(&key, &source, Some(&payload), now, ttl)?;
                    return Ok(Some(record));
                }
                Ok(None) => {
                    self.db.cache_put(&key, &source, None, now, negative_ttl)?;
                    return Ok(None);
                }
                Err(e) => {
                    log::warn!("{source} lookup failed (attempt {}): {e}", attempt + 1);
                    last_error = Some(e);
                    // Exponential backoff between attempts
                    std::thread::sleep(Duration::from_millis(250 << attempt));
                }
            }
        }

        // Retry budget exhausted: record the failure and move on
        self.db.cache_put(&key, &source, None, now, negative_ttl)?;
        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    fn wait_for_token(&mut self) {
        loop {
            let now = Instant::now();
            if self.bucket.try_take(now) {
                return;
            }
            std::thread::sleep(self.bucket.next_available(now));
        }
    }
}

/// Merge a lookup record's raw tags into (genres, tags) for a song.
/// Known genre names land in genres; everything else becomes a tag.
pub fn merge_tags(record: &LookupRecord) -> (Vec<String>, Vec<String>) {
    const KNOWN_GENRES: &[&str] = &[
        "ambient", "blues", "classical", "country", "disco", "drum and bass", "dubstep",
        "electronic", "folk", "funk", "hip hop", "house", "jazz", "latin", "metal", "pop",
        "progressive house", "reggae", "rock", "soul", "techno", "trance",
    ];

    let mut genres: Vec<String> = Vec::new();
    let mut tags: Vec<String> = Vec::new();

    for raw_tags in record.sources.values() {
        for raw in raw_tags {
            let normalized = raw.to_lowercase();
            if KNOWN_GENRES.contains(&normalized.as_str()) {
                if !genres.contains(&normalized) {
                    genres.push(normalized);
                }
            } else if !tags.contains(&normalized) {
                tags.push(normalized);
            }
        }
    }

    genres.sort();
    tags.sort();
    (genres, tags)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct StaticSink {
        calls: RefCell<usize>,
        result: Option<LookupRecord>,
    }

    impl MetadataSink for StaticSink {
        fn name(&self) -> &str {
            "lastfm"
        }
        fn lookup(&self, _artist: &str, _title: &str) -> Result<Option<LookupRecord>, LookupError> {
            *self.calls.borrow_mut() += 1;
            Ok(self.result.clone())
        }
    }

    fn record_with_tags(tags: &[&str]) -> LookupRecord {
        let mut sources = BTreeMap::new();
        sources.insert(
            "lastfm".to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        LookupRecord {
            sources,
            recording_id: Some("mbid-123".into()),
        }
    }

    #[test]
    fn cache_key_normalizes() {
        assert_eq!(cache_key("Daft  Punk", "One More  Time"), "daft punk|one more time");
        assert_eq!(cache_key("DAFT PUNK", "one more time"), "daft punk|one more time");
    }

    #[test]
    fn token_bucket_enforces_rate() {
        let mut bucket = TokenBucket::new(1.0, 1.0);
        let t0 = Instant::now();
        assert!(bucket.try_take(t0));
        assert!(!bucket.try_take(t0));
        // A second later a token is back
        assert!(bucket.try_take(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn token_bucket_caps_burst() {
        let mut bucket = TokenBucket::new(5.0, 5.0);
        let t0 = Instant::now();
        for _ in 0..5 {
            assert!(bucket.try_take(t0));
        }
        assert!(!bucket.try_take(t0));
    }

    #[test]
    fn hit_caches_and_skips_sink_on_second_call() {
        let db = Database::open_in_memory().unwrap();
        let sink = StaticSink {
            calls: RefCell::new(0),
            result: Some(record_with_tags(&["house", "bangers"])),
        };
        let mut lookup = CachedLookup::new(sink, &db, LookupConfig::default());

        let first = lookup.lookup("Artist", "Title").unwrap().unwrap();
        assert_eq!(first.recording_id.as_deref(), Some("mbid-123"));
        let second = lookup.lookup("artist", "title").unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(*lookup.sink.calls.borrow(), 1);
    }

    #[test]
    fn miss_is_cached_negatively() {
        let db = Database::open_in_memory().unwrap();
        let sink = StaticSink {
            calls: RefCell::new(0),
            result: None,
        };
        let mut lookup = CachedLookup::new(sink, &db, LookupConfig::default());

        assert!(lookup.lookup("Unknown", "Song").unwrap().is_none());
        assert!(lookup.lookup("Unknown", "Song").unwrap().is_none());
        assert_eq!(*lookup.sink.calls.borrow(), 1);
    }

    #[test]
    fn merge_tags_splits_genres_from_tags() {
        let record = record_with_tags(&["House", "late night", "Techno"]);
        let (genres, tags) = merge_tags(&record);
        assert_eq!(genres, vec!["house", "techno"]);
        assert_eq!(tags, vec!["late night"]);
    }
}
