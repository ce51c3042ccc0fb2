//! Global gate on concurrent chunk-sized buffer allocations (C4).
//!
//! Bounds peak memory at roughly `lb_max * chunk_size` regardless of how
//! many files are being hashed or uploaded concurrently.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct LargeBufferArbiter {
	semaphore: Arc<Semaphore>,
}

impl LargeBufferArbiter {
	pub fn new(lb_max: usize) -> Self {
		Self {
			semaphore: Arc::new(Semaphore::new(lb_max.max(1))),
		}
	}

	/// Acquires one large-buffer slot. The returned permit releases the slot
	/// on drop, so every exit path (including panics during the held
	/// section) pairs the acquire with a release.
	pub async fn acquire(&self) -> OwnedSemaphorePermit {
		self.semaphore
			.clone()
			.acquire_owned()
			.await
			.expect("arbiter semaphore is never closed")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	#[tokio::test]
	async fn bounds_concurrent_holders() {
		let arbiter = LargeBufferArbiter::new(2);
		let concurrent = Arc::new(AtomicUsize::new(0));
		let max_seen = Arc::new(AtomicUsize::new(0));

		let mut handles = Vec::new();
		for _ in 0..6 {
			let arbiter = arbiter.clone();
			let concurrent = concurrent.clone();
			let max_seen = max_seen.clone();
			handles.push(tokio::spawn(async move {
				let _permit = arbiter.acquire().await;
				let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
				max_seen.fetch_max(now, Ordering::SeqCst);
				tokio::time::sleep(Duration::from_millis(15)).await;
				concurrent.fetch_sub(1, Ordering::SeqCst);
			}));
		}
		for handle in handles {
			handle.await.unwrap();
		}

		assert!(max_seen.load(Ordering::SeqCst) <= 2);
	}
}
