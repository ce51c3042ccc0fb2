//! CLI surface (C10) and process entry point.
//!
//! Four mutually exclusive modes, matching spec.md §6 exactly: list backup
//! history, run a backup, restore a tree, or restore a metadata snapshot.
//! Argument parsing itself is `clap`'s concern; this file only translates a
//! parsed [`Cli`] into a [`RunMode`] and hands it to the [`RunCoordinator`].

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use s3backup::{Config, RunCoordinator, RunMode};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "s3backup", about = "Incremental, content-addressed backup to an S3-compatible store")]
struct Cli {
	/// Path to the YAML configuration document.
	#[arg(long, default_value = "./bus3.yaml")]
	config: PathBuf,

	/// List backup history.
	#[arg(short = 'l', long, conflicts_with_all = ["backup", "restore", "restore_db"])]
	list: bool,

	/// Run one backup scan of the configured root directory.
	#[arg(short = 'b', long, conflicts_with_all = ["list", "restore", "restore_db"])]
	backup: bool,

	/// Restore TARGET (an absolute path under root_dir, or the literal
	/// "all") into DEST, optionally at a past GENERATION (default: latest).
	#[arg(short = 'r', long, num_args = 2..=3, value_names = ["TARGET", "DEST", "GENERATION"], conflicts_with_all = ["list", "backup", "restore_db"])]
	restore: Option<Vec<String>>,

	/// Download a metadata snapshot. N <= 0 counts backwards from newest
	/// (0 = newest, -1 = second-newest, ...); default 0.
	#[arg(short = 'R', long, num_args = 0..=1, value_name = "N", conflicts_with_all = ["list", "backup", "restore"], allow_hyphen_values = true)]
	restore_db: Option<Vec<String>>,
}

impl Cli {
	fn into_mode(self) -> Result<RunMode, String> {
		if self.backup {
			return Ok(RunMode::Backup);
		}
		if let Some(args) = self.restore {
			let target = args[0].clone();
			let dest = PathBuf::from(&args[1]);
			let generation = match args.get(2) {
				Some(raw) => Some(raw.parse::<i64>().map_err(|_| format!("invalid generation: {raw}"))?),
				None => None,
			};
			return Ok(RunMode::Restore { target, dest, generation });
		}
		if let Some(args) = self.restore_db {
			let relative_index = match args.first() {
				Some(raw) => raw.parse::<i64>().map_err(|_| format!("invalid snapshot index: {raw}"))?,
				None => 0,
			};
			return Ok(RunMode::RestoreMetadata { relative_index });
		}
		// `-l`, or no mode flag at all: list history is the original's
		// default runmode.
		if self.list {
			tracing::debug!("explicit --list flag");
		}
		Ok(RunMode::ListHistory)
	}
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.init();

	let cli = Cli::parse();
	let config_path = cli.config.clone();
	let mode = match cli.into_mode() {
		Ok(mode) => mode,
		Err(message) => {
			eprintln!("{message}");
			return ExitCode::FAILURE;
		}
	};

	match run(&config_path, mode).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!(%err, "run failed");
			ExitCode::FAILURE
		}
	}
}

async fn run(config_path: &std::path::Path, mode: RunMode) -> s3backup::Result<()> {
	let config = Config::load(config_path)?;
	let cancel = CancellationToken::new();
	install_signal_handlers(cancel.clone());

	let coordinator = RunCoordinator::new(config, cancel).await?;
	coordinator.run(mode).await
}

/// Cancels every in-flight task on `SIGHUP`/`SIGTERM`/`SIGINT` (spec.md §5).
/// Every metadata unit-of-work is transactional, so the store is left
/// consistent; the current scan is simply abandoned and may be resumed by a
/// future scan (no `mark_deletions` runs for an abandoned scan).
fn install_signal_handlers(cancel: CancellationToken) {
	tokio::spawn(async move {
		#[cfg(unix)]
		{
			use tokio::signal::unix::{signal, SignalKind};
			let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
			let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
			let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
			tokio::select! {
				_ = hangup.recv() => {}
				_ = terminate.recv() => {}
				_ = interrupt.recv() => {}
			}
		}
		#[cfg(not(unix))]
		{
			let _ = tokio::signal::ctrl_c().await;
		}
		cancel.cancel();
	});
}
