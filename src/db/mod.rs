pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }

        self.conn.pragma_update(None, "user_version", 2)?;
        Ok(())
    }

    /// V1: core corpus schema: songs, tracks, patterns, instances,
    /// chords, sections.
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS songs (
                song_id         TEXT PRIMARY KEY,
                source_path     TEXT NOT NULL,
                ticks_per_quarter INTEGER NOT NULL,
                total_bars      INTEGER NOT NULL DEFAULT 0,
                total_beats     REAL NOT NULL DEFAULT 0,
                tempo_map       TEXT NOT NULL,
                time_sig_map    TEXT NOT NULL,

                detected_tonic  INTEGER,
                detected_mode   TEXT,
                key_confidence  REAL,
                key_stability   REAL,

                artist          TEXT,
                title           TEXT,
                metadata_source TEXT,
                metadata_confidence REAL,
                genres          TEXT,  -- JSON array
                tags            TEXT,  -- JSON array

                analysis_status TEXT NOT NULL DEFAULT 'ok',
                warning_count   INTEGER NOT NULL DEFAULT 0,

                created_at      TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_songs_artist_title ON songs(artist, title);
            CREATE INDEX IF NOT EXISTS idx_songs_genres ON songs(genres);

            CREATE TABLE IF NOT EXISTS tracks (
                song_id     TEXT NOT NULL REFERENCES songs(song_id) ON DELETE CASCADE,
                track_index INTEGER NOT NULL,
                name        TEXT,
                channel     INTEGER NOT NULL,
                note_count  INTEGER NOT NULL DEFAULT 0,
                features    TEXT,  -- JSON
                role_probs  TEXT,  -- JSON
                primary_role TEXT,
                arp_summary TEXT,  -- JSON, arp-role tracks only
                PRIMARY KEY (song_id, track_index)
            );

            CREATE TABLE IF NOT EXISTS patterns (
                pattern_id      TEXT PRIMARY KEY,
                role            TEXT NOT NULL,
                length_bars     INTEGER NOT NULL,
                meter           TEXT NOT NULL,
                grid_resolution INTEGER NOT NULL,
                rhythm_fp       TEXT NOT NULL,
                pitch_fp        TEXT NOT NULL,
                combo_fp        TEXT NOT NULL,
                representation  TEXT NOT NULL,  -- canonical JSON
                stats           TEXT NOT NULL,  -- JSON
                tags            TEXT,           -- JSON array
                instance_count  INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_patterns_bucket
                ON patterns(role, length_bars, meter);

            CREATE TABLE IF NOT EXISTS pattern_instances (
                pattern_id  TEXT NOT NULL REFERENCES patterns(pattern_id) ON DELETE CASCADE,
                song_id     TEXT NOT NULL REFERENCES songs(song_id) ON DELETE CASCADE,
                track_index INTEGER NOT NULL,
                start_bar   INTEGER NOT NULL,
                confidence  REAL NOT NULL DEFAULT 1.0,
                transform   TEXT NOT NULL,  -- JSON {pitch_offset, time_scale}
                PRIMARY KEY (pattern_id, song_id, track_index, start_bar)
            );

            CREATE INDEX IF NOT EXISTS idx_instances_song ON pattern_instances(song_id);

            CREATE TABLE IF NOT EXISTS chords (
                song_id     TEXT NOT NULL REFERENCES songs(song_id) ON DELETE CASCADE,
                start_beat  REAL NOT NULL,
                end_beat    REAL NOT NULL,
                root        INTEGER NOT NULL,
                quality     TEXT NOT NULL,
                roman       TEXT NOT NULL,
                confidence  REAL NOT NULL,
                UNIQUE(song_id, start_beat)
            );

            CREATE TABLE IF NOT EXISTS sections (
                song_id         TEXT NOT NULL REFERENCES songs(song_id) ON DELETE CASCADE,
                start_bar       INTEGER NOT NULL,
                end_bar         INTEGER NOT NULL,
                form_label      TEXT NOT NULL,
                type_hint       TEXT,
                type_confidence REAL,
                UNIQUE(song_id, start_bar)
            );
            ",
        )?;
        Ok(())
    }

    /// V2: metadata lookup cache + per-song stage checkpoints.
    fn migrate_v2(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata_cache (
                key         TEXT PRIMARY KEY,
                source      TEXT NOT NULL,
                fetched_at  INTEGER NOT NULL,
                expires_at  INTEGER NOT NULL,
                payload     TEXT  -- NULL marks a negative entry
            );
            CREATE INDEX IF NOT EXISTS idx_cache_expires ON metadata_cache(expires_at);

            CREATE TABLE IF NOT EXISTS checkpoints (
                song_id TEXT NOT NULL,
                stage   TEXT NOT NULL,
                completed_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (song_id, stage)
            );
            ",
        )?;
        Ok(())
    }
}
