//! A small bounded worker pool used to dispatch [`Task`]s against one of the
//! backup engine's resource pools (database unit-of-work, S3 transfer, restore
//! fan-out). Each pool is an independent [`Dispatcher`] with its own worker
//! count and its own bounded queue; the bound on the queue *is* the
//! backpressure mechanism — `dispatch` simply awaits until a slot is free.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Identifies one dispatched task, primarily useful in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for TaskId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A unit of work executed by a [`Dispatcher`]'s worker pool.
///
/// Unlike a bare `Future`, a `Task` carries an id for logging and is boxed so
/// dispatchers can hold heterogeneous work in one queue.
#[async_trait]
pub trait Task: Send + 'static {
	type Output: Send + 'static;
	type Error: Send + 'static;

	fn id(&self) -> TaskId;

	async fn run(self: Box<Self>) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
	#[error("dispatcher has shut down")]
	ShutDown,
}

/// A running (or already finished) task; awaiting it yields the task's result.
pub struct TaskHandle<O, E> {
	id: TaskId,
	rx: oneshot::Receiver<Result<O, E>>,
}

impl<O, E> TaskHandle<O, E> {
	pub fn id(&self) -> TaskId {
		self.id
	}

	/// Waits for the task to finish. Returns `Err(DispatchError::ShutDown)`
	/// only if the worker died without sending a reply (panic unwind).
	pub async fn join(self) -> Result<Result<O, E>, DispatchError> {
		self.rx.await.map_err(|_| DispatchError::ShutDown)
	}
}

type BoxedJob = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, ()> + Send>;

/// A bounded pool of workers draining a single job queue.
///
/// The channel capacity given to [`Dispatcher::new`] is the pool's
/// backpressure bound: once `capacity` jobs are in flight or queued,
/// `dispatch` blocks the caller until a worker frees a slot. This is how the
/// scan/upload/restore engines honour the `db_max`/`s3_max`/`restore_max`
/// bounds from the configuration without a manual poll-and-sleep loop.
#[derive(Clone)]
pub struct Dispatcher {
	tx: async_channel::Sender<BoxedJob>,
	_workers: Arc<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
	pub fn new(worker_count: usize, capacity: usize) -> Self {
		assert!(worker_count > 0, "a dispatcher needs at least one worker");
		let (tx, rx) = async_channel::bounded::<BoxedJob>(capacity.max(1));

		let workers = (0..worker_count)
			.map(|worker_index| {
				let rx = rx.clone();
				tokio::spawn(async move {
					while let Ok(job) = rx.recv().await {
						trace!(worker_index, "picked up job");
						job().await;
					}
					debug!(worker_index, "dispatcher worker exiting, channel closed");
				})
			})
			.collect();

		Self {
			tx,
			_workers: Arc::new(workers),
		}
	}

	/// Enqueues `task`, awaiting until the bounded queue has room. Returns a
	/// handle the caller can `join` to obtain the task's result; the task
	/// itself starts running as soon as a worker is free, independent of
	/// whether the handle is ever joined.
	pub async fn dispatch<T>(&self, task: T) -> Result<TaskHandle<T::Output, T::Error>, DispatchError>
	where
		T: Task,
	{
		let id = task.id();
		let (result_tx, result_rx) = oneshot::channel();

		let job: BoxedJob = Box::new(move || {
			Box::pin(async move {
				let result = Box::new(task).run().await;
				if result_tx.send(result).is_err() {
					warn!(%id, "task handle dropped before result could be delivered");
				}
			})
		});

		self.tx.send(job).await.map_err(|_| DispatchError::ShutDown)?;

		Ok(TaskHandle { id, rx: result_rx })
	}

	/// Number of jobs currently queued (not counting ones already picked up
	/// by a worker). Exposed for tests asserting on backpressure bounds.
	pub fn queue_len(&self) -> usize {
		self.tx.len()
	}

	/// Stops accepting new work; already-queued jobs still drain.
	pub fn close(&self) {
		self.tx.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct Add(u32, u32, TaskId);

	#[async_trait]
	impl Task for Add {
		type Output = u32;
		type Error = ();

		fn id(&self) -> TaskId {
			self.2
		}

		async fn run(self: Box<Self>) -> Result<u32, ()> {
			Ok(self.0 + self.1)
		}
	}

	#[tokio::test]
	async fn dispatches_and_joins() {
		let dispatcher = Dispatcher::new(4, 8);
		let handle = dispatcher.dispatch(Add(2, 3, TaskId::new())).await.unwrap();
		assert_eq!(handle.join().await.unwrap(), Ok(5));
	}

	#[tokio::test]
	async fn bounded_queue_limits_in_flight_work() {
		let concurrent = Arc::new(AtomicUsize::new(0));
		let max_seen = Arc::new(AtomicUsize::new(0));

		struct Track {
			id: TaskId,
			concurrent: Arc<AtomicUsize>,
			max_seen: Arc<AtomicUsize>,
		}

		#[async_trait]
		impl Task for Track {
			type Output = ();
			type Error = ();

			fn id(&self) -> TaskId {
				self.id
			}

			async fn run(self: Box<Self>) -> Result<(), ()> {
				let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
				self.max_seen.fetch_max(now, Ordering::SeqCst);
				tokio::time::sleep(std::time::Duration::from_millis(20)).await;
				self.concurrent.fetch_sub(1, Ordering::SeqCst);
				Ok(())
			}
		}

		let dispatcher = Dispatcher::new(2, 2);
		let mut handles = Vec::new();
		for _ in 0..10 {
			handles.push(
				dispatcher
					.dispatch(Track {
						id: TaskId::new(),
						concurrent: concurrent.clone(),
						max_seen: max_seen.clone(),
					})
					.await
					.unwrap(),
			);
		}
		for handle in handles {
			handle.join().await.unwrap().unwrap();
		}

		assert!(max_seen.load(Ordering::SeqCst) <= 2);
	}
}
