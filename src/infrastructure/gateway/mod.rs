//! Thin, pooled contract over an S3-compatible object store (C1).
//!
//! Keys are content-addressed, so a `put` of an existing key is always
//! idempotent by construction; the gateway does not attempt to detect or
//! reject content mismatches.

use std::{future::Future, path::Path, time::Duration};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use backoff::ExponentialBackoffBuilder;
use bytes::Bytes;
use tokio::{
	io::{AsyncRead, AsyncReadExt},
	sync::Semaphore,
};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Retries `op` with exponential backoff as long as it keeps returning
/// [`Error::is_transient`] failures, per the retry allowance for transient
/// I/O in this crate's error taxonomy. Gives up after 30 seconds of total
/// elapsed retry time and surfaces the last error.
async fn with_retry<T, F, Fut>(op: F) -> Result<T>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T>>,
{
	let policy = ExponentialBackoffBuilder::new()
		.with_max_elapsed_time(Some(Duration::from_secs(30)))
		.build();
	let mut op = op;
	backoff::future::retry(policy, || async {
		op().await.map_err(|err| {
			if err.is_transient() {
				backoff::Error::transient(err)
			} else {
				backoff::Error::permanent(err)
			}
		})
	})
	.await
}

/// The contract every component in this crate depends on, never `aws_sdk_s3`
/// directly. [`ObjectStoreGateway`] is the only production implementation;
/// tests substitute an in-memory fake (see `testing` below) so the scan,
/// upload, and restore engines never need real network access to be
/// exercised end to end.
#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn bucket_exists(&self) -> Result<bool>;
	async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<()>;
	async fn get_bytes(&self, key: &str) -> Result<Bytes>;
	async fn list(&self, prefix: &str) -> Result<Vec<String>>;

	/// Reads `length` bytes from `reader` and uploads them. The default
	/// implementation buffers the whole read in memory; callers that already
	/// hold bytes in memory (the common case for this crate's chunk sizes)
	/// should prefer `put_bytes` directly.
	async fn put_stream(&self, key: &str, reader: &mut (dyn AsyncRead + Unpin + Send), length: u64) -> Result<()> {
		let mut buf = Vec::with_capacity(length as usize);
		reader.read_to_end(&mut buf).await?;
		self.put_bytes(key, Bytes::from(buf)).await
	}

	async fn get_file(&self, key: &str, dest_path: &Path) -> Result<()> {
		let bytes = self.get_bytes(key).await?;
		if let Some(parent) = dest_path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(dest_path, &bytes).await?;
		Ok(())
	}

	async fn put_file(&self, src_path: &Path, key: &str) -> Result<()> {
		let bytes = tokio::fs::read(src_path).await?;
		self.put_bytes(key, Bytes::from(bytes)).await
	}
}

/// Pooled wrapper around an `aws_sdk_s3::Client`. The pool bound is a
/// semaphore: every operation acquires a permit before touching the client
/// and releases it on return, so the gateway never issues more than
/// `pool_size` concurrent requests regardless of how many callers hold a
/// clone of it.
#[derive(Clone)]
pub struct ObjectStoreGateway {
	client: aws_sdk_s3::Client,
	bucket: String,
	pool: std::sync::Arc<Semaphore>,
}

impl ObjectStoreGateway {
	pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, pool_size: usize) -> Self {
		Self {
			client,
			bucket: bucket.into(),
			pool: std::sync::Arc::new(Semaphore::new(pool_size.max(1))),
		}
	}

	async fn acquire(&self) -> tokio::sync::SemaphorePermit<'_> {
		self.pool.acquire().await.expect("gateway semaphore is never closed")
	}
}

#[async_trait]
impl ObjectStore for ObjectStoreGateway {
	async fn bucket_exists(&self) -> Result<bool> {
		let _permit = self.acquire().await;
		match self.client.head_bucket().bucket(&self.bucket).send().await {
			Ok(_) => Ok(true),
			Err(err) => {
				if err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
					Ok(false)
				} else {
					Err(Error::from(err))
				}
			}
		}
	}

	async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<()> {
		let _permit = self.acquire().await;
		with_retry(|| async {
			self.client
				.put_object()
				.bucket(&self.bucket)
				.key(key)
				.body(ByteStream::from(bytes.clone()))
				.send()
				.await?;
			Ok(())
		})
		.await?;
		debug!(key, "put object");
		Ok(())
	}

	async fn get_bytes(&self, key: &str) -> Result<Bytes> {
		let _permit = self.acquire().await;
		with_retry(|| async {
			let output = self.client.get_object().bucket(&self.bucket).key(key).send().await?;
			let aggregated = output
				.body
				.collect()
				.await
				.map_err(|e| Error::transient_io(e.to_string()))?;
			Ok(aggregated.into_bytes())
		})
		.await
	}

	async fn list(&self, prefix: &str) -> Result<Vec<String>> {
		let _permit = self.acquire().await;
		let mut keys = Vec::new();
		let mut continuation_token = None;
		loop {
			let token_for_request = continuation_token.clone();
			let output = with_retry(|| async {
				let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
				if let Some(token) = &token_for_request {
					request = request.continuation_token(token);
				}
				Ok(request.send().await?)
			})
			.await?;
			keys.extend(output.contents().iter().filter_map(|object| object.key().map(str::to_owned)));
			match output.next_continuation_token() {
				Some(token) => continuation_token = Some(token.to_owned()),
				None => break,
			}
		}
		Ok(keys)
	}

	async fn put_file(&self, src_path: &Path, key: &str) -> Result<()> {
		let _permit = self.acquire().await;
		with_retry(|| async {
			let body = ByteStream::from_path(src_path)
				.await
				.map_err(|e| Error::transient_io(e.to_string()))?;
			self.client.put_object().bucket(&self.bucket).key(key).body(body).send().await?;
			Ok(())
		})
		.await
	}
}

/// Builds the underlying SDK client from configuration, honouring an
/// S3-compatible custom endpoint (MinIO, Ceph RGW, etc).
pub async fn build_client(
	endpoint: &str,
	region: Option<&str>,
	access_key_id: Option<&str>,
	secret_access_key: Option<&str>,
	force_path_style: bool,
) -> aws_sdk_s3::Client {
	let region_provider = aws_config::meta::region::RegionProviderChain::first_try(
		region.map(|r| aws_sdk_s3::config::Region::new(r.to_owned())),
	)
	.or_else(aws_sdk_s3::config::Region::new("us-east-1"));

	let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
		.region(region_provider)
		.endpoint_url(endpoint);

	if let (Some(key), Some(secret)) = (access_key_id, secret_access_key) {
		loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(key, secret, None, None, "static-config"));
	} else {
		warn!("no explicit S3 credentials configured, falling back to the default credential chain");
	}

	let shared_config = loader.load().await;
	aws_sdk_s3::Client::from_conf(
		aws_sdk_s3::config::Builder::from(&shared_config)
			.force_path_style(force_path_style)
			.build(),
	)
}

/// An in-memory [`ObjectStore`] used by integration tests so the scan,
/// upload, and restore engines can be exercised without a real S3-compatible
/// endpoint. Grounded in the same "fake the external collaborator" shape
/// spec.md §1 calls out for the object store client.
pub mod testing {
	use std::{collections::HashMap, sync::Arc};

	use tokio::sync::Mutex;

	use super::*;

	#[derive(Clone, Default)]
	pub struct FakeObjectStore {
		objects: Arc<Mutex<HashMap<String, Bytes>>>,
	}

	impl FakeObjectStore {
		pub fn new() -> Self {
			Self::default()
		}

		pub async fn len(&self) -> usize {
			self.objects.lock().await.len()
		}
	}

	#[async_trait]
	impl ObjectStore for FakeObjectStore {
		async fn bucket_exists(&self) -> Result<bool> {
			Ok(true)
		}

		async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<()> {
			self.objects.lock().await.insert(key.to_string(), bytes);
			Ok(())
		}

		async fn get_bytes(&self, key: &str) -> Result<Bytes> {
			self.objects
				.lock()
				.await
				.get(key)
				.cloned()
				.ok_or_else(|| Error::precondition_failed(format!("no such object: {key}")))
		}

		async fn list(&self, prefix: &str) -> Result<Vec<String>> {
			Ok(self
				.objects
				.lock()
				.await
				.keys()
				.filter(|key| key.starts_with(prefix))
				.cloned()
				.collect())
		}
	}
}
