use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use walkdir::WalkDir;

use crate::analysis::{self, arps, roles, sections};
use crate::config::FingerprintConfig;
use crate::db::Database;
use crate::harmony::{chords, keys};
use crate::ingest::{self, metadata};
use crate::model::patterns::{Pattern, PatternInstance, Transform};
use crate::model::{AnalysisStatus, ChordEvent, KeyEstimate, Section, Song};
use crate::patterns::{chunking, fingerprint, mining};
use crate::SUPPORTED_EXTENSIONS;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("input error: {0}")]
    Input(#[from] ingest::NormalizeError),
    #[error("store error: {0}")]
    Store(#[from] crate::db::DbError),
    #[error("cancelled")]
    Cancelled,
    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Pipeline stages, journaled per song in dependency order.
pub const STAGES: [&str; 10] = [
    "normalize",
    "metadata",
    "features",
    "roles",
    "patterns",
    "key",
    "chords",
    "arps",
    "sections",
    "store",
];

/// Everything computed for one song, ready for a single store write.
pub struct SongAnalysis {
    pub song: Song,
    pub key: KeyEstimate,
    pub chords: Vec<ChordEvent>,
    pub sections: Vec<Section>,
    pub patterns: Vec<Pattern>,
    pub instances: Vec<PatternInstance>,
    /// track_index → serialized arp summary.
    pub arp_summaries: BTreeMap<usize, String>,
    pub status: AnalysisStatus,
}

pub struct ScanResult {
    pub scanned: u64,
    pub analyzed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub partial: u64,
}

pub struct MineResult {
    pub patterns_before: usize,
    pub patterns_merged: usize,
}

/// Analyze raw SMF bytes into a complete [`SongAnalysis`].
///
/// Within-song work is single-threaded and deterministic; the cancellation
/// token is observed between stages, never mid-structure.
pub fn analyze_bytes(
    bytes: &[u8],
    source_path: &str,
    options: &FingerprintConfig,
    cancel: &AtomicBool,
) -> Result<SongAnalysis, PipelineError> {
    let grid = options.grid_steps_per_bar;

    // Stage: normalize
    let mut song = ingest::normalize_bytes(bytes, source_path)?;
    check_cancel(cancel)?;

    // Stage: metadata
    let meta_text = metadata::MidiMetaText::parse(bytes);
    song.metadata = metadata::resolve(Path::new(source_path), &meta_text);
    check_cancel(cancel)?;

    // Stage: features
    for i in 0..song.tracks.len() {
        let features = analysis::extract_features(
            &song.tracks[i],
            &song.time_sig_map,
            song.total_bars,
            grid,
        );
        song.tracks[i].features = Some(features);
    }
    check_cancel(cancel)?;

    // Stage: roles
    for track in &mut song.tracks {
        let probs = roles::classify(track.features.as_ref());
        let sum = probs.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(PipelineError::Invariant(format!(
                "role probabilities sum to {sum} for track {}",
                track.track_index
            )));
        }
        track.role_probs = Some(probs);
    }
    check_cancel(cancel)?;

    // Stage: patterns (chunk + fingerprint; intra-song dedup is inherent
    // in the content-addressed pattern id)
    let mut patterns: Vec<Pattern> = Vec::new();
    let mut instances: Vec<PatternInstance> = Vec::new();
    for track in &song.tracks {
        let role = track.primary_role();
        for chunk in chunking::chunk_track_all_lengths(track, &song.time_sig_map, song.total_bars)
        {
            let fp = fingerprint::fingerprint_chunk(&chunk, grid, options.weighted_rhythm);
            if !patterns.iter().any(|p| p.pattern_id == fp.pattern_id) {
                patterns.push(fingerprint::pattern_from_chunk(&chunk, &fp, grid, role));
            }
            instances.push(PatternInstance {
                pattern_id: fp.pattern_id,
                song_id: song.song_id.clone(),
                track_index: track.track_index,
                start_bar: chunk.start_bar,
                confidence: 1.0,
                transform: Transform::identity(),
            });
        }
    }
    check_cancel(cancel)?;

    // Stage: key
    let key = keys::detect_key(&song);
    check_cancel(cancel)?;

    // Stage: chords
    let chord_events = chords::infer_chords(&song, &key);
    for pair in chord_events.windows(2) {
        if pair[0].end_beat > pair[1].start_beat + 1e-9 {
            return Err(PipelineError::Invariant(format!(
                "overlapping chord events at beat {}",
                pair[1].start_beat
            )));
        }
    }
    check_cancel(cancel)?;

    // Stage: arps
    let mut arp_summaries = BTreeMap::new();
    for track in &song.tracks {
        if let Some(analysis) = arps::analyze_track(track, &song, &chord_events) {
            let summary = arps::ArpSummary::from(&analysis);
            if let Ok(json) = serde_json::to_string(&summary) {
                arp_summaries.insert(track.track_index, json);
            }
        }
    }
    check_cancel(cancel)?;

    // Stage: sections
    let section_list = sections::segment(&song, &chord_events);
    for pair in section_list.windows(2) {
        if pair[0].end_bar != pair[1].start_bar {
            return Err(PipelineError::Invariant(format!(
                "section gap at bar {}",
                pair[0].end_bar
            )));
        }
    }

    let metadata_missing = song.metadata.artist.is_none() && song.metadata.title.is_none();
    let status = if song.warning_count > 0 || metadata_missing {
        AnalysisStatus::Partial
    } else {
        AnalysisStatus::Ok
    };

    Ok(SongAnalysis {
        song,
        key,
        chords: chord_events,
        sections: section_list,
        patterns,
        instances,
        arp_summaries,
        status,
    })
}

/// Analyze one MIDI file from disk.
pub fn analyze_file(
    path: &Path,
    options: &FingerprintConfig,
    cancel: &AtomicBool,
) -> Result<SongAnalysis, PipelineError> {
    let bytes = std::fs::read(path).map_err(ingest::NormalizeError::Io)?;
    analyze_bytes(&bytes, &path.to_string_lossy(), options, cancel)
}

fn check_cancel(cancel: &AtomicBool) -> Result<(), PipelineError> {
    if cancel.load(Ordering::Relaxed) {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Walk directories, analyze every MIDI file, and store results.
///
/// Songs analyze in parallel (one worker per song); the store is written
/// from the driver thread between chunks, so all writes are serialized.
/// Completed songs (per the checkpoint journal) are skipped unless `force`.
pub fn scan(
    db: &Database,
    paths: &[String],
    options: &FingerprintConfig,
    force: bool,
    jobs: usize,
    cancel: &AtomicBool,
) -> Result<ScanResult, PipelineError> {
    let mut result = ScanResult {
        scanned: 0,
        analyzed: 0,
        skipped: 0,
        failed: 0,
        partial: 0,
    };

    // First pass: collect candidate files, hash them, and skip completed
    // songs. Hashing here keeps all DB access on the driver thread.
    let mut work: Vec<PathBuf> = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }

            result.scanned += 1;
            if !force {
                match std::fs::read(entry.path()) {
                    Ok(bytes) => {
                        let song_id = ingest::content_hash(&bytes);
                        if db.song_is_complete(&song_id)? {
                            result.skipped += 1;
                            continue;
                        }
                    }
                    Err(e) => {
                        log::warn!("Cannot read {}: {}", entry.path().display(), e);
                        result.failed += 1;
                        continue;
                    }
                }
            }
            work.push(entry.path().to_path_buf());
        }
    }

    if work.is_empty() {
        return Ok(result);
    }

    log::info!("Analyzing {} files with {} workers", work.len(), jobs);

    let pb = ProgressBar::new(work.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );
    pb.set_message("Analyzing...");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .map_err(|e| PipelineError::Invariant(e.to_string()))?;

    // Process in chunks: analyze in parallel, then write this chunk's
    // results before moving on. Bounded memory, resumable on crash.
    let chunk_size = jobs.max(1) * 2;

    for files in work.chunks(chunk_size) {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        let analyses: Vec<(PathBuf, Result<SongAnalysis, PipelineError>)> = pool.install(|| {
            use rayon::prelude::*;
            files
                .par_iter()
                .map(|file| {
                    let analysis = analyze_file(file, options, cancel);
                    pb.inc(1);
                    (file.clone(), analysis)
                })
                .collect()
        });

        for (file, analysis) in analyses {
            match analysis {
                Ok(sa) => match store_analysis(db, &sa) {
                    Ok(()) => {
                        result.analyzed += 1;
                        if sa.status == AnalysisStatus::Partial {
                            result.partial += 1;
                        }
                    }
                    Err(e) => {
                        // Checkpoint stays unadvanced; the song retries
                        // on the next scan
                        log::error!("Store failed for {}: {}", file.display(), e);
                        result.failed += 1;
                    }
                },
                Err(PipelineError::Cancelled) => {}
                Err(e @ PipelineError::Invariant(_)) => {
                    pb.finish_and_clear();
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("Analysis failed for {}: {}", file.display(), e);
                    result.failed += 1;
                }
            }
        }

        pb.set_message(format!("{} stored, {} failed", result.analyzed, result.failed));
    }

    pb.finish_with_message(format!(
        "Done: {} analyzed, {} skipped, {} failed",
        result.analyzed, result.skipped, result.failed
    ));

    Ok(result)
}

/// Write one song's full analysis: song row + patterns, one transaction
/// each, with the stage journal advancing only on success.
pub fn store_analysis(db: &Database, sa: &SongAnalysis) -> Result<(), PipelineError> {
    db.store_song_analysis_with_arps(
        &sa.song,
        Some(&sa.key),
        &sa.chords,
        &sa.sections,
        &sa.arp_summaries,
        sa.status,
        &STAGES,
    )?;
    db.store_patterns(&sa.patterns, &sa.instances)?;
    Ok(())
}

/// Cross-corpus mining pass: cluster near-duplicate patterns and fold
/// them into canonical representatives.
pub fn mine(db: &Database) -> Result<MineResult, PipelineError> {
    let patterns = db.load_patterns_for_mining()?;
    let before = patterns.len();

    let merges = mining::plan_merges(&patterns);
    let removed = db.apply_merges(&merges)?;

    Ok(MineResult {
        patterns_before: before,
        patterns_merged: removed,
    })
}
