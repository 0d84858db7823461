use rusqlite::{params, OptionalExtension};

use super::models::{
    ChordRow, ClipQuery, ClipResult, LibraryStats, SectionRow, SongRow, TrackRow,
};
use super::{Database, Result};
use crate::model::patterns::{Pattern, PatternInstance};
use crate::model::{
    AnalysisStatus, ChordEvent, KeyEstimate, Section, Song, PITCH_CLASS_NAMES,
};
use crate::patterns::mining::{Merge, MinedPattern};

impl Database {
    /// Store one song's full analysis in a single transaction: the song
    /// row, its tracks, chords, sections, and stage checkpoints. Upserts
    /// are idempotent; re-running a song converges to the same state.
    pub fn store_song_analysis(
        &self,
        song: &Song,
        key: Option<&KeyEstimate>,
        chords: &[ChordEvent],
        sections: &[Section],
        status: AnalysisStatus,
        stages: &[&str],
    ) -> Result<()> {
        self.store_song_analysis_with_arps(
            song,
            key,
            chords,
            sections,
            &std::collections::BTreeMap::new(),
            status,
            stages,
        )
    }

    /// As [`Database::store_song_analysis`], with per-track arp summaries
    /// (track_index → serialized summary JSON).
    #[allow(clippy::too_many_arguments)]
    pub fn store_song_analysis_with_arps(
        &self,
        song: &Song,
        key: Option<&KeyEstimate>,
        chords: &[ChordEvent],
        sections: &[Section],
        arps: &std::collections::BTreeMap<usize, String>,
        status: AnalysisStatus,
        stages: &[&str],
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let tempo_map = serde_json::to_string(&song.tempo_map)?;
        let time_sig_map = serde_json::to_string(&song.time_sig_map)?;
        let genres = serde_json::to_string(&song.metadata.genres)?;
        let tags = serde_json::to_string(&song.metadata.tags)?;

        tx.execute(
            "INSERT INTO songs (
                song_id, source_path, ticks_per_quarter, total_bars, total_beats,
                tempo_map, time_sig_map,
                detected_tonic, detected_mode, key_confidence, key_stability,
                artist, title, metadata_source, metadata_confidence, genres, tags,
                analysis_status, warning_count, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7,
                ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, datetime('now')
            )
            ON CONFLICT(song_id) DO UPDATE SET
                source_path = excluded.source_path,
                ticks_per_quarter = excluded.ticks_per_quarter,
                total_bars = excluded.total_bars,
                total_beats = excluded.total_beats,
                tempo_map = excluded.tempo_map,
                time_sig_map = excluded.time_sig_map,
                detected_tonic = excluded.detected_tonic,
                detected_mode = excluded.detected_mode,
                key_confidence = excluded.key_confidence,
                key_stability = excluded.key_stability,
                artist = excluded.artist,
                title = excluded.title,
                metadata_source = excluded.metadata_source,
                metadata_confidence = excluded.metadata_confidence,
                genres = excluded.genres,
                tags = excluded.tags,
                analysis_status = excluded.analysis_status,
                warning_count = excluded.warning_count,
                updated_at = datetime('now')
            ",
            params![
                song.song_id,
                song.source_path,
                song.ticks_per_quarter,
                song.total_bars as i64,
                song.total_beats,
                tempo_map,
                time_sig_map,
                key.map(|k| k.tonic as i64),
                key.map(|k| k.mode.as_str()),
                key.map(|k| k.confidence),
                key.map(|k| k.stability_samples),
                song.metadata.artist,
                song.metadata.title,
                song.metadata.source,
                song.metadata.confidence,
                genres,
                tags,
                status.as_str(),
                song.warning_count,
            ],
        )?;

        // Replace detail rows for idempotent re-analysis
        tx.execute("DELETE FROM tracks WHERE song_id = ?1", params![song.song_id])?;
        tx.execute("DELETE FROM chords WHERE song_id = ?1", params![song.song_id])?;
        tx.execute("DELETE FROM sections WHERE song_id = ?1", params![song.song_id])?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO tracks (
                    song_id, track_index, name, channel, note_count,
                    features, role_probs, primary_role, arp_summary
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for track in &song.tracks {
                let features = track
                    .features
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                let role_probs = track
                    .role_probs
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    song.song_id,
                    track.track_index as i64,
                    track.name,
                    track.channel,
                    track.notes.len() as i64,
                    features,
                    role_probs,
                    track.primary_role().as_str(),
                    arps.get(&track.track_index),
                ])?;
            }
        }

        if !chords.is_empty() {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO chords (
                    song_id, start_beat, end_beat, root, quality, roman, confidence
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for chord in chords {
                stmt.execute(params![
                    song.song_id,
                    chord.start_beat,
                    chord.end_beat,
                    chord.root,
                    chord.quality.as_str(),
                    chord.roman,
                    chord.confidence,
                ])?;
            }
        }

        if !sections.is_empty() {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO sections (
                    song_id, start_bar, end_bar, form_label, type_hint, type_confidence
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for section in sections {
                stmt.execute(params![
                    song.song_id,
                    section.start_bar as i64,
                    section.end_bar as i64,
                    section.form_label,
                    section.type_hint.as_str(),
                    section.type_confidence,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO checkpoints (song_id, stage) VALUES (?1, ?2)",
            )?;
            for stage in stages {
                stmt.execute(params![song.song_id, stage])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Upsert patterns and their instances. A pattern row is created on
    /// first occurrence and never modified afterwards; instances are
    /// idempotent on their composite key.
    pub fn store_patterns(
        &self,
        patterns: &[Pattern],
        instances: &[PatternInstance],
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO patterns (
                    pattern_id, role, length_bars, meter, grid_resolution,
                    rhythm_fp, pitch_fp, combo_fp, representation, stats, tags
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(pattern_id) DO NOTHING",
            )?;
            for pattern in patterns {
                stmt.execute(params![
                    pattern.pattern_id,
                    pattern.role.as_str(),
                    pattern.length_bars as i64,
                    pattern.meter,
                    pattern.grid_resolution as i64,
                    pattern.rhythm_fp,
                    pattern.pitch_fp,
                    pattern.combo_fp,
                    serde_json::to_string(&pattern.representation)?,
                    serde_json::to_string(&pattern.stats)?,
                    serde_json::to_string(&pattern.tags)?,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO pattern_instances (
                    pattern_id, song_id, track_index, start_bar, confidence, transform
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(pattern_id, song_id, track_index, start_bar) DO UPDATE SET
                    confidence = excluded.confidence,
                    transform = excluded.transform",
            )?;
            for instance in instances {
                stmt.execute(params![
                    instance.pattern_id,
                    instance.song_id,
                    instance.track_index as i64,
                    instance.start_bar as i64,
                    instance.confidence,
                    serde_json::to_string(&instance.transform)?,
                ])?;
            }
        }

        tx.execute_batch(
            "UPDATE patterns SET instance_count = (
                SELECT COUNT(*) FROM pattern_instances pi
                WHERE pi.pattern_id = patterns.pattern_id
            )",
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Whether the song already journaled its final stage.
    pub fn song_is_complete(&self, song_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM checkpoints WHERE song_id = ?1 AND stage = 'store'",
                params![song_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Delete a song; patterns survive but its instances cascade away.
    pub fn delete_song(&self, song_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM songs WHERE song_id = ?1", params![song_id])?;
        self.conn.execute(
            "DELETE FROM checkpoints WHERE song_id = ?1",
            params![song_id],
        )?;
        self.conn.execute_batch(
            "UPDATE patterns SET instance_count = (
                SELECT COUNT(*) FROM pattern_instances pi
                WHERE pi.pattern_id = patterns.pattern_id
            )",
        )?;
        Ok(())
    }

    /// Load every pattern for cross-corpus mining.
    pub fn load_patterns_for_mining(&self) -> Result<Vec<MinedPattern>> {
        let mut stmt = self.conn.prepare(
            "SELECT pattern_id, role, length_bars, meter, grid_resolution,
                    rhythm_fp, pitch_fp, combo_fp, representation, stats, tags,
                    instance_count
             FROM patterns ORDER BY pattern_id",
        )?;

        let rows = stmt.query_map([], |row| {
            let representation: String = row.get(8)?;
            let stats: String = row.get(9)?;
            let tags: String = row.get::<_, Option<String>>(10)?.unwrap_or_else(|| "[]".into());
            let role: String = row.get(1)?;
            Ok((
                row.get::<_, String>(0)?,
                role,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                representation,
                stats,
                tags,
                row.get::<_, i64>(11)?,
            ))
        })?;

        let mut patterns = Vec::new();
        for row in rows {
            let (
                pattern_id,
                role,
                length_bars,
                meter,
                grid_resolution,
                rhythm_fp,
                pitch_fp,
                combo_fp,
                representation,
                stats,
                tags,
                instance_count,
            ) = row?;

            let role = crate::model::TrackRole::from_str(&role)
                .unwrap_or(crate::model::TrackRole::Other);

            patterns.push(MinedPattern {
                pattern: Pattern {
                    pattern_id,
                    role,
                    length_bars: length_bars as usize,
                    meter,
                    grid_resolution: grid_resolution as usize,
                    rhythm_fp,
                    pitch_fp,
                    combo_fp,
                    representation: serde_json::from_str(&representation)?,
                    stats: serde_json::from_str(&stats)?,
                    tags: serde_json::from_str(&tags)?,
                },
                instance_count: instance_count as usize,
            });
        }
        Ok(patterns)
    }

    /// Apply mining merges: fold each merged pattern's instances into the
    /// canonical pattern and drop the merged row. Returns patterns removed.
    pub fn apply_merges(&self, merges: &[Merge]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0usize;

        for merge in merges {
            let transform = serde_json::to_string(&merge.transform)?;
            tx.execute(
                "INSERT OR IGNORE INTO pattern_instances
                    (pattern_id, song_id, track_index, start_bar, confidence, transform)
                 SELECT ?1, song_id, track_index, start_bar, ?2, ?3
                 FROM pattern_instances WHERE pattern_id = ?4",
                params![merge.canonical_id, merge.confidence, transform, merge.merged_id],
            )?;
            tx.execute(
                "DELETE FROM pattern_instances WHERE pattern_id = ?1",
                params![merge.merged_id],
            )?;
            removed += tx.execute(
                "DELETE FROM patterns WHERE pattern_id = ?1",
                params![merge.merged_id],
            )?;
        }

        tx.execute_batch(
            "UPDATE patterns SET instance_count = (
                SELECT COUNT(*) FROM pattern_instances pi
                WHERE pi.pattern_id = patterns.pattern_id
            )",
        )?;

        tx.commit()?;
        Ok(removed)
    }

    /// Clip query: filter patterns, order by (popularity desc, id asc).
    pub fn search_clips(&self, query: &ClipQuery) -> Result<Vec<ClipResult>> {
        let mut sql = String::from(
            "SELECT p.pattern_id, p.role, p.length_bars, p.meter, p.grid_resolution,
                    p.instance_count, p.representation
             FROM patterns p WHERE 1=1",
        );
        let mut bindings: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(role) = &query.role {
            sql.push_str(" AND p.role = ?");
            bindings.push(Box::new(role.clone()));
        }
        if let Some(meter) = &query.meter {
            sql.push_str(" AND p.meter = ?");
            bindings.push(Box::new(meter.clone()));
        }
        if let Some(min) = query.min_length_bars {
            sql.push_str(" AND p.length_bars >= ?");
            bindings.push(Box::new(min as i64));
        }
        if let Some(max) = query.max_length_bars {
            sql.push_str(" AND p.length_bars <= ?");
            bindings.push(Box::new(max as i64));
        }
        if let Some(artist) = &query.artist {
            sql.push_str(
                " AND EXISTS (
                    SELECT 1 FROM pattern_instances pi
                    JOIN songs s ON s.song_id = pi.song_id
                    WHERE pi.pattern_id = p.pattern_id AND s.artist LIKE ?
                )",
            );
            bindings.push(Box::new(format!("%{artist}%")));
        }
        if let Some(genre) = &query.genre {
            sql.push_str(
                " AND EXISTS (
                    SELECT 1 FROM pattern_instances pi
                    JOIN songs s ON s.song_id = pi.song_id
                    WHERE pi.pattern_id = p.pattern_id AND s.genres LIKE ?
                )",
            );
            bindings.push(Box::new(format!("%{genre}%")));
        }

        sql.push_str(" ORDER BY p.instance_count DESC, p.pattern_id ASC LIMIT ? OFFSET ?");
        let limit = if query.limit == 0 { 50 } else { query.limit };
        bindings.push(Box::new(limit as i64));
        bindings.push(Box::new(query.offset as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            bindings.iter().map(|b| b.as_ref()).collect();

        let rows = stmt.query_map(params_ref.as_slice(), |row| {
            Ok(ClipResult {
                pattern_id: row.get(0)?,
                role: row.get(1)?,
                length_bars: row.get::<_, i64>(2)? as usize,
                meter: row.get(3)?,
                grid_resolution: row.get::<_, i64>(4)? as usize,
                instance_count: row.get::<_, i64>(5)? as usize,
                representation: row.get(6)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Find a song by exact id or source path.
    pub fn get_song(&self, id_or_path: &str) -> Result<Option<SongRow>> {
        self.conn
            .query_row(
                "SELECT song_id, source_path, artist, title, total_bars,
                        detected_tonic, detected_mode, analysis_status, warning_count
                 FROM songs WHERE song_id = ?1 OR source_path = ?1",
                params![id_or_path],
                |row| {
                    let tonic: Option<i64> = row.get(5)?;
                    let mode: Option<String> = row.get(6)?;
                    let detected_key = match (tonic, mode) {
                        (Some(t), Some(m)) => Some(format!(
                            "{} {}",
                            PITCH_CLASS_NAMES[(t as usize) % 12],
                            m
                        )),
                        _ => None,
                    };
                    Ok(SongRow {
                        song_id: row.get(0)?,
                        source_path: row.get(1)?,
                        artist: row.get(2)?,
                        title: row.get(3)?,
                        total_bars: row.get::<_, i64>(4)? as usize,
                        detected_key,
                        analysis_status: row.get(7)?,
                        warning_count: row.get::<_, i64>(8)? as u32,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_song_tracks(&self, song_id: &str) -> Result<Vec<TrackRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT track_index, name, channel, note_count, primary_role
             FROM tracks WHERE song_id = ?1 ORDER BY track_index",
        )?;
        let rows = stmt.query_map(params![song_id], |row| {
            Ok(TrackRow {
                track_index: row.get::<_, i64>(0)? as usize,
                name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                channel: row.get::<_, i64>(2)? as u8,
                note_count: row.get::<_, i64>(3)? as usize,
                primary_role: row.get(4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_song_chords(&self, song_id: &str) -> Result<Vec<ChordRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT start_beat, end_beat, root, quality, roman, confidence
             FROM chords WHERE song_id = ?1 ORDER BY start_beat",
        )?;
        let rows = stmt.query_map(params![song_id], |row| {
            let root: i64 = row.get(2)?;
            let quality: String = row.get(3)?;
            Ok(ChordRow {
                start_beat: row.get(0)?,
                end_beat: row.get(1)?,
                name: chord_display_name(root as u8, &quality),
                roman: row.get(4)?,
                confidence: row.get(5)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_song_sections(&self, song_id: &str) -> Result<Vec<SectionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT start_bar, end_bar, form_label, type_hint
             FROM sections WHERE song_id = ?1 ORDER BY start_bar",
        )?;
        let rows = stmt.query_map(params![song_id], |row| {
            Ok(SectionRow {
                start_bar: row.get::<_, i64>(0)? as usize,
                end_bar: row.get::<_, i64>(1)? as usize,
                form_label: row.get(2)?,
                type_hint: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        let total_songs: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM songs", [], |row| row.get(0))?;
        let total_tracks: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))?;
        let total_patterns: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM patterns", [], |row| row.get(0))?;
        let total_instances: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pattern_instances",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT role, COUNT(*) FROM patterns GROUP BY role ORDER BY COUNT(*) DESC",
        )?;
        let patterns_by_role = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT analysis_status, COUNT(*) FROM songs GROUP BY analysis_status",
        )?;
        let songs_by_status = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(LibraryStats {
            total_songs,
            total_tracks,
            total_patterns,
            total_instances,
            patterns_by_role,
            songs_by_status,
        })
    }

    /// Read a metadata cache entry. Returns `(payload, is_fresh)`; payload
    /// None marks a negative entry.
    pub fn cache_get(&self, key: &str, now: i64) -> Result<Option<(Option<String>, bool)>> {
        self.conn
            .query_row(
                "SELECT payload, expires_at FROM metadata_cache WHERE key = ?1",
                params![key],
                |row| {
                    let payload: Option<String> = row.get(0)?;
                    let expires_at: i64 = row.get(1)?;
                    Ok((payload, now < expires_at))
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Write a metadata cache entry. `payload` None records a miss/failure
    /// with its own (short) TTL.
    pub fn cache_put(
        &self,
        key: &str,
        source: &str,
        payload: Option<&str>,
        now: i64,
        ttl_secs: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO metadata_cache (key, source, fetched_at, expires_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                source = excluded.source,
                fetched_at = excluded.fetched_at,
                expires_at = excluded.expires_at,
                payload = excluded.payload",
            params![key, source, now, now + ttl_secs, payload],
        )?;
        Ok(())
    }
}

fn chord_display_name(root: u8, quality: &str) -> String {
    let root_name = PITCH_CLASS_NAMES[(root as usize) % 12];
    match quality {
        "maj" => root_name.to_string(),
        "min" => format!("{root_name}m"),
        other => format!("{root_name}{other}"),
    }
}
