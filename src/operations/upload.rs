//! Bounded worker pool draining the upload job queue (C6).

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use backup_task_system::{Dispatcher, Task, TaskHandle, TaskId};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{
	arbiter::LargeBufferArbiter,
	error::{Error, Result},
	infrastructure::gateway::ObjectStore,
};

/// One chunk awaiting upload. `tail_bytes_if_small` is set by the scan
/// engine only when the whole file is a single chunk that fit in one
/// buffer read, letting the upload happen with no second file read.
#[derive(Debug, Clone)]
pub struct UploadJob {
	pub path: PathBuf,
	pub chunk_index: u64,
	pub object_hash: String,
	pub size: u64,
	pub tail_bytes_if_small: Option<Vec<u8>>,
}

/// Worker count is bounded by `s3_pool_size`; the dispatcher's queue
/// capacity is `s3_max` — together these are the upload side of the three
/// bounded resource pools.
#[derive(Clone)]
pub struct UploadScheduler {
	dispatcher: Dispatcher,
	gateway: Arc<dyn ObjectStore>,
	arbiter: LargeBufferArbiter,
	chunk_size: u64,
}

impl UploadScheduler {
	pub fn new(
		worker_count: usize,
		queue_capacity: usize,
		gateway: Arc<dyn ObjectStore>,
		arbiter: LargeBufferArbiter,
		chunk_size: u64,
	) -> Self {
		Self {
			dispatcher: Dispatcher::new(worker_count.max(1), queue_capacity.max(1)),
			gateway,
			arbiter,
			chunk_size,
		}
	}

	/// Enqueues the job, awaiting a free slot — this is the `s3_max`
	/// backpressure bound the scan engine yields on.
	pub async fn submit(&self, job: UploadJob) -> Result<TaskHandle<(), Error>> {
		let task = UploadTask {
			id: TaskId::new(),
			gateway: self.gateway.clone(),
			arbiter: self.arbiter.clone(),
			chunk_size: self.chunk_size,
			job,
		};
		Ok(self.dispatcher.dispatch(task).await?)
	}
}

struct UploadTask {
	id: TaskId,
	gateway: Arc<dyn ObjectStore>,
	arbiter: LargeBufferArbiter,
	chunk_size: u64,
	job: UploadJob,
}

#[async_trait]
impl Task for UploadTask {
	type Output = ();
	type Error = Error;

	fn id(&self) -> TaskId {
		self.id
	}

	async fn run(self: Box<Self>) -> Result<()> {
		if let Some(bytes) = self.job.tail_bytes_if_small {
			self.gateway.put_bytes(&self.job.object_hash, Bytes::from(bytes)).await?;
			return Ok(());
		}

		let _permit = self.arbiter.acquire().await;
		let mut file = tokio::fs::File::open(&self.job.path).await?;
		file.seek(std::io::SeekFrom::Start(self.job.chunk_index * self.chunk_size))
			.await?;
		let mut buf = vec![0u8; self.job.size as usize];
		file.read_exact(&mut buf).await?;
		self.gateway.put_bytes(&self.job.object_hash, Bytes::from(buf)).await?;
		Ok(())
	}
}
