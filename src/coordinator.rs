//! Run Coordinator (C8): selects one of the four run modes and owns the
//! lifecycle of the metadata store and object store gateway pools for the
//! duration of the run.

use std::{path::Path, sync::Arc, time::Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
	arbiter::LargeBufferArbiter,
	config::Config,
	error::{Error, Result},
	infrastructure::{
		database::MetadataStore,
		gateway::{ObjectStore, ObjectStoreGateway},
	},
	operations::{RestoreEngine, ScanEngine, UploadScheduler},
};

/// One of the four mutually exclusive ways this crate can be invoked,
/// matching spec.md §6's CLI surface one-to-one.
pub enum RunMode {
	/// `-l / --list`
	ListHistory,
	/// `-b / --backup`
	Backup,
	/// `-r / --restore TARGET DEST [GENERATION]`
	Restore {
		target: String,
		dest: std::path::PathBuf,
		generation: Option<i64>,
	},
	/// `-R / --restore_db [N]`
	RestoreMetadata { relative_index: i64 },
}

pub struct RunCoordinator {
	config: Config,
	store: Arc<MetadataStore>,
	gateway: Arc<dyn ObjectStore>,
	arbiter: LargeBufferArbiter,
	cancel: CancellationToken,
}

impl RunCoordinator {
	pub async fn new(config: Config, cancel: CancellationToken) -> Result<Self> {
		let store = MetadataStore::open(&config.metadata_store.sqlite_path).await?;
		store.migrate().await?;

		let client = crate::infrastructure::gateway::build_client(
			&config.s3_config.s3_endpoint,
			config.s3_config.region.as_deref(),
			config.s3_config.access_key_id.as_deref(),
			config.s3_config.secret_access_key.as_deref(),
			config.s3_config.force_path_style,
		)
		.await;
		let gateway: Arc<dyn ObjectStore> = Arc::new(ObjectStoreGateway::new(client, &config.s3_config.s3_bucket, config.s3_pool_size));
		let arbiter = LargeBufferArbiter::new(config.lb_max);

		Ok(Self {
			config,
			store: Arc::new(store),
			gateway,
			arbiter,
			cancel,
		})
	}

	pub async fn run(&self, mode: RunMode) -> Result<()> {
		match mode {
			RunMode::ListHistory => self.list_history().await,
			RunMode::Backup => self.backup().await,
			RunMode::Restore {
				target,
				dest,
				generation,
			} => self.restore(&target, &dest, generation).await,
			RunMode::RestoreMetadata { relative_index } => self.restore_metadata(relative_index).await,
		}
	}

	async fn list_history(&self) -> Result<()> {
		let scans = self.store.scans().await?;
		println!("  #: {:<19} backup root directory", "date & time");
		for scan in scans {
			println!("{:3}: {} {}", scan.scan_counter, scan.start_time.format("%Y-%m-%d %H:%M:%S"), scan.root_dir);
		}
		Ok(())
	}

	async fn backup(&self) -> Result<()> {
		if !self.gateway.bucket_exists().await? {
			return Err(Error::precondition_failed(format!(
				"bucket {} is not reachable",
				self.config.s3_config.s3_bucket
			)));
		}

		let upload_scheduler = UploadScheduler::new(
			self.config.s3_pool_size,
			self.config.s3_max,
			self.gateway.clone(),
			self.arbiter.clone(),
			self.config.chunksize,
		);
		let scan_engine = ScanEngine::new(
			self.store.clone(),
			upload_scheduler,
			self.config.db_max,
			self.config.chunksize,
			self.config.buffersize,
			self.cancel.clone(),
		);

		let started = Instant::now();
		let mut file_count = 0u64;
		let mut byte_count = 0u64;
		let scan_counter = scan_engine.scan(self.config.root_dir.clone()).await?;
		let (processed_files, processed_bytes) = self.summarize(scan_counter).await?;
		file_count += processed_files;
		byte_count += processed_bytes;

		if self.cancel.is_cancelled() {
			info!(scan_counter, "backup cancelled before completion, run may be resumed by a future scan");
			return Ok(());
		}

		if self.config.upload_metadata_snapshot {
			self.upload_metadata_snapshot(scan_counter).await?;
		}

		let elapsed = started.elapsed().as_secs_f64().max(0.000_001);
		info!(
			"processed {} files in {:.1} seconds ({:.1} files/sec, {:.1} MB/s)",
			file_count,
			elapsed,
			file_count as f64 / elapsed,
			(byte_count as f64 / 1_048_576.0) / elapsed
		);
		Ok(())
	}

	/// Counts files/bytes touched by the just-completed scan, for the
	/// completion summary line spec.md §7 requires.
	async fn summarize(&self, scan_counter: i64) -> Result<(u64, u64)> {
		use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

		use crate::infrastructure::database::entities::version;

		let rows = version::Entity::find()
			.filter(version::Column::ScanCounter.eq(scan_counter))
			.all(self.store.conn())
			.await?;
		let files = rows.len() as u64;
		let bytes = rows.iter().map(|row| row.size.max(0) as u64).sum();
		Ok((files, bytes))
	}

	async fn upload_metadata_snapshot(&self, scan_counter: i64) -> Result<()> {
		let key = format!("{}_{scan_counter}", self.config.metadata_store.metadata_identifier);
		self.gateway.put_file(&self.config.metadata_store.sqlite_path, &key).await?;
		info!(key, "uploaded metadata snapshot");
		Ok(())
	}

	async fn restore(&self, target: &str, dest: &Path, generation: Option<i64>) -> Result<()> {
		if !dest.is_dir() {
			return Err(Error::precondition_failed(format!("restore destination {} is not a directory", dest.display())));
		}
		let restore_engine = RestoreEngine::new(
			self.store.clone(),
			self.gateway.clone(),
			self.arbiter.clone(),
			self.config.restore_max,
			self.config.chunksize,
		);
		restore_engine.restore(target, dest, generation).await
	}

	/// `relative_index <= 0` counts backwards from the newest snapshot: `0`
	/// is newest, `-1` is second-newest, matching spec.md §6's `dbrestore_rel`.
	async fn restore_metadata(&self, relative_index: i64) -> Result<()> {
		let prefix = format!("{}_", self.config.metadata_store.metadata_identifier);
		let mut keys = self.gateway.list(&prefix).await?;
		let mut parsed: Vec<(i64, String)> = keys
			.drain(..)
			.filter_map(|key| {
				key.strip_prefix(&prefix)
					.and_then(|suffix| suffix.parse::<i64>().ok())
					.map(|counter| (counter, key.clone()))
			})
			.collect();
		parsed.sort_by_key(|(counter, _)| *counter);

		let index_from_newest = (1 - relative_index) as usize;
		let chosen = parsed
			.len()
			.checked_sub(index_from_newest)
			.and_then(|idx| parsed.get(idx))
			.ok_or_else(|| Error::precondition_failed("no such metadata snapshot version"))?;

		self.gateway
			.get_file(&chosen.1, &self.config.metadata_store.sqlite_path)
			.await?;
		info!(key = %chosen.1, "restored metadata snapshot");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	#[test]
	fn relative_index_math_picks_newest_by_default() {
		// 0 => newest (index_from_newest = 1, i.e. last element)
		assert_eq!(1 - 0_i64, 1);
		// -1 => second-newest
		assert_eq!(1 - (-1_i64), 2);
	}
}
