use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use riffbank::db::models::ClipQuery;
use riffbank::pipeline::{self, PipelineError};

#[derive(Parser)]
#[command(name = "riffbank", version, about = "MIDI pattern corpus analyzer")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan directories for MIDI files, analyze them, and store results
    Scan {
        /// Directories to scan (defaults to config file music_dirs)
        paths: Vec<String>,

        /// Re-analyze files whose songs are already complete
        #[arg(long)]
        force: bool,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Cluster near-duplicate patterns across the corpus
    Mine,

    /// Search the pattern corpus
    Query {
        /// Filter by role (drums, bass, chords, pad, lead, arp, other)
        #[arg(long)]
        role: Option<String>,

        /// Filter by genre (substring match)
        #[arg(long)]
        genre: Option<String>,

        /// Filter by artist (substring match)
        #[arg(long)]
        artist: Option<String>,

        /// Filter by meter, e.g. "4/4"
        #[arg(long)]
        meter: Option<String>,

        /// Minimum pattern length in bars
        #[arg(long)]
        min_bars: Option<usize>,

        /// Maximum pattern length in bars
        #[arg(long)]
        max_bars: Option<usize>,

        /// Number of results
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Pagination offset
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show a song's key, chords, sections, and tracks
    Song {
        /// Song id or source path
        song: String,
    },

    /// Show library statistics
    Stats,
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {e:#}");
            let code = match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::Input(_)) => 3,
                Some(PipelineError::Invariant(_)) => 4,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = riffbank::config::AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(riffbank::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = riffbank::db::Database::open(&db_path).context("Failed to open database")?;

    match cli.command {
        Commands::Scan { paths, force, jobs } => {
            let scan_paths = if !paths.is_empty() {
                paths
            } else if !config.music_dirs.is_empty() {
                config
                    .music_dirs
                    .iter()
                    .map(|p| p.to_string_lossy().to_string())
                    .collect()
            } else {
                anyhow::bail!(
                    "No directories to scan. Pass paths as arguments or set music_dirs in config."
                );
            };

            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let cancel = Arc::new(AtomicBool::new(false));

            let result = pipeline::scan(
                &db,
                &scan_paths,
                &config.fingerprint,
                force,
                workers,
                &cancel,
            )
            .context("Scan failed")?;

            println!(
                "Scan complete: {} scanned, {} analyzed ({} partial), {} skipped, {} failed",
                result.scanned, result.analyzed, result.partial, result.skipped, result.failed
            );
        }

        Commands::Mine => {
            let result = pipeline::mine(&db).context("Mining failed")?;
            println!(
                "Mining complete: {} patterns, {} merged into canonicals",
                result.patterns_before, result.patterns_merged
            );
        }

        Commands::Query {
            role,
            genre,
            artist,
            meter,
            min_bars,
            max_bars,
            limit,
            offset,
        } => {
            let query = ClipQuery {
                role,
                genre,
                artist,
                meter,
                min_length_bars: min_bars,
                max_length_bars: max_bars,
                limit,
                offset,
            };
            let results = db.search_clips(&query).context("Query failed")?;

            if results.is_empty() {
                println!("No patterns found.");
                return Ok(());
            }

            println!(
                "{:<14} {:<8} {:>4} {:>6} {:>6}  {}",
                "Pattern", "Role", "Bars", "Meter", "Uses", "Representation"
            );
            println!("{}", "-".repeat(90));
            for clip in &results {
                let rep_display: String = if clip.representation.len() > 48 {
                    format!("{}...", &clip.representation[..45])
                } else {
                    clip.representation.clone()
                };
                println!(
                    "{:<14} {:<8} {:>4} {:>6} {:>6}  {}",
                    clip.pattern_id,
                    clip.role,
                    clip.length_bars,
                    clip.meter,
                    clip.instance_count,
                    rep_display,
                );
            }
        }

        Commands::Song { song } => {
            let row = match db.get_song(&song).context("Lookup failed")? {
                Some(row) => row,
                None => {
                    println!("No song matching \"{song}\".");
                    return Ok(());
                }
            };

            println!("Song: {}", row.song_id);
            println!("Path: {}", row.source_path);
            if let (Some(artist), Some(title)) = (&row.artist, &row.title) {
                println!("Artist/Title: {artist} — {title}");
            }
            if let Some(key) = &row.detected_key {
                println!("Key: {key}");
            }
            println!("Bars: {}", row.total_bars);
            println!(
                "Status: {} ({} warnings)",
                row.analysis_status, row.warning_count
            );
            println!();

            let tracks = db.get_song_tracks(&row.song_id)?;
            if !tracks.is_empty() {
                println!("Tracks:");
                for t in &tracks {
                    println!(
                        "  {:>2}  {:<24} ch{:<3} {:>5} notes  {}",
                        t.track_index,
                        if t.name.is_empty() { "(unnamed)" } else { &t.name },
                        t.channel + 1,
                        t.note_count,
                        t.primary_role.as_deref().unwrap_or("-"),
                    );
                }
                println!();
            }

            let chords = db.get_song_chords(&row.song_id)?;
            if !chords.is_empty() {
                let names: Vec<String> = chords
                    .iter()
                    .map(|c| format!("{} ({})", c.name, c.roman))
                    .collect();
                println!("Chords: {}", names.join("  "));
                println!();
            }

            let sections = db.get_song_sections(&row.song_id)?;
            if !sections.is_empty() {
                println!("Sections:");
                for s in &sections {
                    println!(
                        "  {:>3}-{:<3} {}  {}",
                        s.start_bar,
                        s.end_bar,
                        s.form_label,
                        s.type_hint.as_deref().unwrap_or(""),
                    );
                }
            }
        }

        Commands::Stats => {
            let stats = db.stats().context("Failed to get stats")?;
            println!("Library Statistics");
            println!("==================");
            println!("Songs:     {}", stats.total_songs);
            println!("Tracks:    {}", stats.total_tracks);
            println!("Patterns:  {}", stats.total_patterns);
            println!("Instances: {}", stats.total_instances);
            println!();

            if !stats.patterns_by_role.is_empty() {
                println!("Patterns by role:");
                for (role, count) in &stats.patterns_by_role {
                    println!("  {:<8} {}", role, count);
                }
                println!();
            }

            if !stats.songs_by_status.is_empty() {
                println!("Songs by status:");
                for (status, count) in &stats.songs_by_status {
                    println!("  {:<8} {}", status, count);
                }
            }
        }
    }

    Ok(())
}
