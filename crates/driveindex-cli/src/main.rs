use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use driveindex_core::{
	format_size, ChangeKind, DriveHint, DriveRegistry, EntryKind, IndexConfig, IndexStore,
	MatchMode, ScanReconciler, SearchEngine, SearchQuery,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "driveindex", version, about = "DriveIndex - Offline catalog of removable drives")]
struct Cli {
	/// Catalog database (defaults to ~/.driveindex/catalog.db)
	#[arg(long, global = true)]
	catalog: Option<PathBuf>,
	/// JSON config file (defaults to ~/.driveindex/config.json when present)
	#[arg(long, global = true)]
	config: Option<PathBuf>,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Scan a mounted drive and make the result its current snapshot
	Scan {
		/// Mount point of the drive
		root: PathBuf,
		/// Volume label
		#[arg(long)]
		label: String,
		/// Hardware serial, when the OS exposes one
		#[arg(long)]
		serial: Option<String>,
		/// Stable name to use when no serial is available
		#[arg(long)]
		alias: Option<String>,
		/// List the paths that changed since the previous scan
		#[arg(long)]
		changes: bool,
	},
	/// Search entry names across every cataloged drive
	Search {
		pattern: String,
		#[arg(long, value_parser = ["exact", "prefix", "substring"], default_value = "substring")]
		mode: String,
		/// Only return entries of this kind
		#[arg(long, value_parser = ["file", "dir", "link"])]
		kind: Option<String>,
		#[arg(long, default_value = "50")]
		limit: usize,
		#[arg(long, default_value = "0")]
		offset: usize,
	},
	/// List cataloged drives
	Drives,
	/// List the current snapshot of a drive
	Ls {
		/// Drive id or unique id prefix
		drive: String,
		/// Only show entries under this path
		prefix: Option<String>,
	},
	/// Show the scan generations kept for a drive
	History {
		drive: String,
	},
	/// Give a drive a new label
	Relabel {
		drive: String,
		label: String,
	},
	/// Forget a drive and everything indexed from it
	Remove {
		drive: String,
	},
	/// Drop old generations of a drive
	Prune {
		drive: String,
		/// Superseded generations to keep
		#[arg(long)]
		keep: Option<usize>,
	},
}

fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	let cli = Cli::parse();
	let mut config = IndexConfig::load_or_default(cli.config.as_deref())
		.context("Failed to load configuration")?;
	if let Some(catalog) = cli.catalog {
		config.catalog_path = catalog;
	}
	let store = IndexStore::open_with_config(&config)
		.with_context(|| format!("Failed to open catalog {}", config.catalog_path.display()))?;

	match cli.command {
		Commands::Scan { root, label, serial, alias, changes } => {
			let hint = DriveHint { label, serial, alias };
			let mut reconciler = ScanReconciler::new(&store, &config);
			reconciler.set_progress_callback(|progress| {
				eprintln!("⏳ {}: {} entries indexed", progress.drive_label, progress.entries_indexed);
			});

			let report = reconciler.scan(&root, &hint)?;

			println!("✅ Scan completed successfully!");
			println!("💽 Drive: {} ({})", report.drive.label, report.drive.id);
			println!("🔢 Generation: {}", report.generation.number);
			println!("📈 Entries Indexed: {}", report.entries_indexed);
			println!("➕ Added: {}", report.added);
			println!("➖ Removed: {}", report.removed);
			println!("✏️  Modified: {}", report.modified);
			println!("⏱️  Duration: {} ms", report.duration_ms);
			if report.skipped() > 0 {
				println!("⚠️  Skipped {} unreadable entries:", report.skipped());
				for err in &report.errors {
					println!("   {}", err);
				}
				if report.errors_omitted > 0 {
					println!("   +{} more", report.errors_omitted);
				}
			}

			if changes && report.has_changes() {
				for (kind, marker) in [
					(ChangeKind::Added, "+"),
					(ChangeKind::Removed, "-"),
					(ChangeKind::Modified, "~"),
				] {
					let paths = store.changed_paths(
						report.previous_generation,
						report.generation.id,
						kind,
						usize::MAX >> 1,
					)?;
					for path in paths {
						println!("{} {}", marker, path);
					}
				}
			}
		}
		Commands::Search { pattern, mode, kind, limit, offset } => {
			let Some(mode) = MatchMode::parse(&mode) else {
				bail!("unknown match mode: {}", mode);
			};
			let mut query = SearchQuery::new(pattern, mode).page(limit, offset);
			if let Some(kind) = kind.as_deref().and_then(EntryKind::parse) {
				query = query.with_kind(kind);
			}

			let hits = SearchEngine::new(&store, &config).search(&query)?;
			if hits.is_empty() {
				println!("❌ No matches");
			}
			for hit in hits {
				let size = match hit.kind {
					EntryKind::File => format_size(hit.size),
					other => other.to_string(),
				};
				println!("[{}] {}  ({})", hit.drive_label, hit.path, size);
			}
		}
		Commands::Drives => {
			let drives = DriveRegistry::new(&store).list()?;
			if drives.is_empty() {
				println!("📭 No drives cataloged yet");
			}
			for drive in drives {
				let scanned = drive
					.last_scanned
					.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
					.unwrap_or_else(|| "never".to_string());
				println!("💽 {}  {}", drive.id, drive.label);
				println!("   Identity: {}", drive.identity);
				println!("   Entries: {}  Last scanned: {}", drive.entry_count, scanned);
			}
		}
		Commands::Ls { drive, prefix } => {
			let drive = DriveRegistry::new(&store).find(&drive)?;
			for stored in store.get_current_entries(drive.id, prefix.as_deref())? {
				let entry = stored.entry;
				match entry.kind {
					EntryKind::Directory => println!("📁 {}/", entry.path),
					EntryKind::Link => println!("🔗 {}", entry.path),
					EntryKind::File => println!("📄 {}  ({})", entry.path, format_size(entry.size)),
				}
			}
		}
		Commands::History { drive } => {
			let drive = DriveRegistry::new(&store).find(&drive)?;
			println!("💽 {}", drive.label);
			for generation in store.list_generations(drive.id)? {
				let completed = generation
					.completed_at
					.map(|t| t.to_rfc3339())
					.unwrap_or_else(|| "-".to_string());
				println!(
					"   #{}  {}  started {}  completed {}",
					generation.number,
					generation.status,
					generation.started_at.to_rfc3339(),
					completed
				);
			}
		}
		Commands::Relabel { drive, label } => {
			let registry = DriveRegistry::new(&store);
			let found = registry.find(&drive)?;
			registry.relabel(found.id, &label)?;
			println!("✅ {} is now labeled {}", found.id, label);
		}
		Commands::Remove { drive } => {
			let registry = DriveRegistry::new(&store);
			let found = registry.find(&drive)?;
			registry.remove(found.id)?;
			println!("🗑️  Removed {} ({})", found.label, found.id);
		}
		Commands::Prune { drive, keep } => {
			let found = DriveRegistry::new(&store).find(&drive)?;
			let keep = keep.unwrap_or(config.retain_generations);
			let pruned = store.prune_generations(found.id, keep)?;
			println!("🧹 Pruned {} generation(s) of {}", pruned, found.label);
		}
	}
	Ok(())
}
