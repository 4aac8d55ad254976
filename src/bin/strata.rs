//! # Strata CLI - Incremental snapshots as portable patches
//!
//! Command-line interface for the Strata library.
//!
//! ## Usage
//! ```bash
//! # Start tracking the current directory
//! strata init
//!
//! # Record what changed since the last scan
//! strata scan
//!
//! # Ship patch 3 to another machine and replay it there
//! strata export 3 changes.patch
//! strata --path /srv/mirror import changes.patch
//! strata --path /srv/mirror apply 3 /srv/mirror
//! ```

use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use strata::utils::format_bytes;
use strata::{ApplySummary, Result, Strata, StrataBuilder, StrataError};
use tracing_subscriber::EnvFilter;

/// Strata CLI - Incremental filesystem snapshots
#[derive(Parser)]
#[command(name = "strata")]
#[command(version)]
#[command(about = "Record directory changes as a chain of portable patches")]
#[command(long_about = None)]
struct Cli {
    /// Path to the tracked directory (defaults to current)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Storage directory (defaults to <path>/.strata)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize storage for a directory
    Init {
        /// zlib compression level (0-9)
        #[arg(long, default_value_t = strata::DEFAULT_COMPRESSION_LEVEL)]
        compression_level: u32,

        /// Absolute paths to exclude
        #[arg(short, long)]
        ignore: Vec<PathBuf>,

        /// Tracked paths whose new files are stored as placeholders
        #[arg(long)]
        touch: Vec<String>,

        /// Tracked paths where only directories are tracked
        #[arg(long)]
        dirs_only: Vec<String>,

        /// Track mount points of any filesystem type
        #[arg(long)]
        all_mounts: bool,
    },

    /// Scan the tree and record a patch
    Scan {
        /// Update the live tree without recording a patch
        #[arg(long)]
        no_patch: bool,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// List patches
    #[command(alias = "ls")]
    List {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,

        /// Limit results to the newest N patches
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show a patch and its diff tree
    Show {
        /// Sequence number
        seq: u64,
    },

    /// Export a completed patch to a file
    Export {
        /// Sequence number
        seq: u64,

        /// Destination file
        file: PathBuf,
    },

    /// Import a patch file into the chain
    Import {
        /// Patch file
        file: PathBuf,
    },

    /// Apply a patch onto a target directory
    Apply {
        /// Sequence number
        seq: u64,

        /// Target directory
        target: PathBuf,
    },

    /// Undo a patch on a target directory
    Revert {
        /// Sequence number
        seq: u64,

        /// Target directory
        target: PathBuf,
    },

    /// Add a scan filter
    Filter {
        #[command(subcommand)]
        rule: FilterRule,
    },

    /// Verify chain and content store integrity
    Verify {
        /// Decompress every content record
        #[arg(long)]
        deep: bool,
    },
}

#[derive(Subcommand)]
enum FilterRule {
    /// Exclude an absolute path from scanning
    Ignore { path: PathBuf },
    /// Store new files under a tracked path as placeholders
    Touch { path: String },
    /// Track only directories under a tracked path
    DirsOnly { path: String },
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let root_path = cli.path.unwrap_or_else(|| PathBuf::from("."));
    let storage_path = cli.storage.unwrap_or_else(|| root_path.join(".strata"));

    match cli.command {
        Commands::Init {
            compression_level,
            ignore,
            touch,
            dirs_only,
            all_mounts,
        } => {
            let builder = StrataBuilder::new()
                .compression_level(compression_level)
                .ignore_paths(ignore)
                .touch_new_paths(touch)
                .track_dirs_only_paths(dirs_only)
                .ignore_non_local_mounts(!all_mounts);
            cmd_init(root_path, storage_path, builder)
        }
        Commands::Scan { no_patch, progress } => cmd_scan(root_path, storage_path, no_patch, progress),
        Commands::List { detailed, limit } => cmd_list(root_path, storage_path, detailed, limit),
        Commands::Show { seq } => cmd_show(root_path, storage_path, seq),
        Commands::Export { seq, file } => cmd_export(root_path, storage_path, seq, file),
        Commands::Import { file } => cmd_import(root_path, storage_path, file),
        Commands::Apply { seq, target } => cmd_apply(root_path, storage_path, seq, target, true),
        Commands::Revert { seq, target } => cmd_apply(root_path, storage_path, seq, target, false),
        Commands::Filter { rule } => cmd_filter(root_path, storage_path, rule),
        Commands::Verify { deep } => cmd_verify(root_path, storage_path, deep),
    }
}

fn cmd_init(root_path: PathBuf, storage_path: PathBuf, builder: StrataBuilder) -> Result<()> {
    println!("{}", "Initializing Strata...".blue().bold());
    let strata = builder.init(root_path, storage_path)?;

    println!("{} Initialized Strata storage", "✓".green().bold());
    println!("  Root: {}", strata.root_path().display().to_string().cyan());
    println!("  Storage: {}", strata.config().storage_path.display().to_string().cyan());
    println!(
        "  Filesystems: {}",
        strata.database().registry().mount_table().mounts.len().to_string().cyan()
    );
    println!("\nNext steps:");
    println!("  - Record the initial state: {}", "strata scan".yellow());
    Ok(())
}

fn cmd_scan(root_path: PathBuf, storage_path: PathBuf, no_patch: bool, show_progress: bool) -> Result<()> {
    let mut strata = open_strata(root_path, storage_path)?;
    println!("{}", "Scanning...".blue().bold());

    let progress = show_progress.then(|| spinner("Scanning files..."));
    let summary = if no_patch {
        strata.scan_without_patch()?
    } else {
        strata.scan()?
    };
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    match summary.completed_patch {
        Some(seq) => println!("{} Recorded patch {}", "✓".green().bold(), seq.to_string().yellow().bold()),
        None if no_patch => println!("{} Live tree updated", "✓".green().bold()),
        None => println!("{}", "No changes detected.".yellow()),
    }
    println!(
        "  Added: {} entries, {} dirs",
        summary.entries_added.to_string().green(),
        summary.dirs_added.to_string().green()
    );
    println!(
        "  Removed: {} entries, {} dirs",
        summary.entries_removed.to_string().red(),
        summary.dirs_removed.to_string().red()
    );
    println!("  Metadata: {}", summary.metadata_changed.to_string().yellow());
    if summary.hardlinks_resolved > 0 {
        println!("  Hardlinks: {}", summary.hardlinks_resolved.to_string().cyan());
    }
    println!("  Stored: {}", format_bytes(summary.bytes_stored).cyan());
    println!("  Directories scanned: {}", summary.dirs_scanned.to_string().cyan());
    if summary.subtrees_skipped > 0 {
        println!(
            "  {} {} unreadable subtrees skipped",
            "⚠".yellow().bold(),
            summary.subtrees_skipped
        );
    }
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(summary.duration_ms)).to_string().cyan()
    );
    Ok(())
}

fn cmd_list(root_path: PathBuf, storage_path: PathBuf, detailed: bool, limit: Option<usize>) -> Result<()> {
    let strata = open_strata(root_path, storage_path)?;
    let patches = strata.list_patches();
    if patches.is_empty() {
        println!("{}", "No patches found.".yellow());
        return Ok(());
    }

    println!("{}", "Patches:".blue().bold());
    println!();
    let skip = limit.map_or(0, |n| patches.len().saturating_sub(n));
    for patch in patches.iter().skip(skip) {
        let state = if patch.is_complete {
            "complete".green()
        } else {
            "open".yellow()
        };
        println!(
            "  {} {} {} {}",
            format!("{:>4}", patch.sequence_number).yellow().bold(),
            patch.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            patch.uuid.to_string()[..8].cyan(),
            state
        );
        if detailed {
            println!(
                "       Previous: {} | Content: {} records",
                patch.previous_uuid.to_string()[..8].dimmed(),
                patch.content_count()
            );
        }
    }
    Ok(())
}

fn cmd_show(root_path: PathBuf, storage_path: PathBuf, seq: u64) -> Result<()> {
    let strata = open_strata(root_path, storage_path)?;
    let patch = strata.get_patch(seq)?;

    println!("{} {}", "Patch".blue().bold(), seq.to_string().yellow().bold());
    println!("  Uuid: {}", patch.uuid.to_string().dimmed());
    println!("  Previous: {}", patch.previous_uuid.to_string().dimmed());
    println!("  Created: {}", patch.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Complete: {}", if patch.is_complete { "yes".green() } else { "no".yellow() });
    if patch.has_content() {
        println!(
            "  Content ids: {}..={}",
            patch.starting_content_id, patch.ending_content_id
        );
    }
    println!("  Directories: {}", patch.root.dir_count());
    println!();
    print!("{}", patch.root.dump());
    Ok(())
}

fn cmd_export(root_path: PathBuf, storage_path: PathBuf, seq: u64, file: PathBuf) -> Result<()> {
    let strata = open_strata(root_path, storage_path)?;
    let start = Instant::now();
    let info = strata.export_patch(seq, &file)?;

    println!(
        "{} Exported patch {} to {}",
        "✓".green().bold(),
        seq.to_string().yellow().bold(),
        file.display().to_string().cyan()
    );
    println!("  Content: {} records, {}", info.record_count, format_bytes(info.header.content_length));
    println!("  Directories: {}", info.dir_count);
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    Ok(())
}

fn cmd_import(root_path: PathBuf, storage_path: PathBuf, file: PathBuf) -> Result<()> {
    let mut strata = open_strata(root_path, storage_path)?;
    let start = Instant::now();
    let info = strata.import_patch(&file)?;

    println!(
        "{} Imported {} as patch {}",
        "✓".green().bold(),
        file.display().to_string().cyan(),
        info.sequence_number.to_string().yellow().bold()
    );
    println!("  Content: {} records, {}", info.record_count, format_bytes(info.header.content_length));
    println!("  Directories: {}", info.dir_count);
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    Ok(())
}

fn cmd_apply(root_path: PathBuf, storage_path: PathBuf, seq: u64, target: PathBuf, forward: bool) -> Result<()> {
    let strata = open_strata(root_path, storage_path)?;
    let verb = if forward { "Applying" } else { "Reverting" };
    println!(
        "{} {} onto {}",
        format!("{} patch", verb).blue().bold(),
        seq.to_string().yellow(),
        target.display().to_string().cyan()
    );

    let result = if forward {
        strata.apply_patch(seq, &target)
    } else {
        strata.revert_patch(seq, &target)
    };
    print_apply(&result?);
    Ok(())
}

fn print_apply(summary: &ApplySummary) {
    println!("{} Done", "✓".green().bold());
    println!(
        "  Created: {} entries, {} dirs",
        summary.entries_created.to_string().green(),
        summary.dirs_created.to_string().green()
    );
    println!(
        "  Removed: {} entries, {} dirs",
        summary.entries_removed.to_string().red(),
        summary.dirs_removed.to_string().red()
    );
    println!("  Metadata: {}", summary.metadata_applied.to_string().yellow());
    println!("  Bytes written: {}", format_bytes(summary.bytes_written).cyan());
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(summary.duration_ms)).to_string().cyan()
    );
    if !summary.warnings.is_empty() {
        println!("\n{}", "Warnings:".yellow().bold());
        for warning in &summary.warnings {
            println!("  - {}", warning.yellow());
        }
    }
}

fn cmd_filter(root_path: PathBuf, storage_path: PathBuf, rule: FilterRule) -> Result<()> {
    let mut strata = open_strata(root_path, storage_path)?;
    let (kind, path) = match rule {
        FilterRule::Ignore { path } => {
            let shown = path.display().to_string();
            strata.add_ignore(path)?;
            ("ignore", shown)
        }
        FilterRule::Touch { path } => {
            strata.add_touch_new_files(&path)?;
            ("touch-new-files", path)
        }
        FilterRule::DirsOnly { path } => {
            strata.add_track_dirs_only(&path)?;
            ("track-dirs-only", path)
        }
    };
    println!("{} Added {} filter for {}", "✓".green().bold(), kind.yellow(), path.cyan());
    Ok(())
}

fn cmd_verify(root_path: PathBuf, storage_path: PathBuf, deep: bool) -> Result<()> {
    let strata = open_strata(root_path, storage_path)?;
    println!("{}", "Verifying storage...".blue().bold());

    let start = Instant::now();
    let progress = deep.then(|| spinner("Decompressing content..."));
    let result = strata.verify(deep);
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    match result {
        Ok(report) => {
            println!("\n{}", "Verification Report:".bold());
            println!("  Chain: {} ({} patches)", "✓ Valid".green(), report.patches);
            println!("  Content index: {} ({} records)", "✓ Valid".green(), report.records);
            if deep {
                println!("  Content: {} ({})", "✓ Valid".green(), format_bytes(report.bytes_checked));
            }
            println!("  Verification time: {}", format_duration(start.elapsed()));
            Ok(())
        }
        Err(e) if e.is_chain_error() || e.is_corruption() => {
            println!("  {} {}", "✗ Invalid:".red(), e);
            Err(e)
        }
        Err(e) => Err(e),
    }
}

// Helper functions

/// Open existing storage
fn open_strata(root_path: PathBuf, storage_path: PathBuf) -> Result<Strata> {
    if !storage_path.exists() {
        return Err(StrataError::StorageNotInitialized(storage_path));
    }
    Strata::open(root_path, storage_path)
}

fn spinner(message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
