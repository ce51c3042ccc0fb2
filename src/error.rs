//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the engine resolves to one of the five kinds
//! below. The kind determines how the run coordinator reacts: `ConfigInvalid`
//! and `PreconditionFailed` abort before or at the start of a run;
//! `TransientIo` is retried with bounded backoff by the caller and becomes
//! `FatalPerTask` on exhaustion; `LogicViolation` aborts the run immediately
//! without attempting repair.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	/// Missing configuration, malformed YAML, missing required keys.
	#[error("invalid configuration: {0}")]
	ConfigInvalid(String),

	/// Bucket missing, metadata store unreachable, restore target missing.
	#[error("precondition failed: {0}")]
	PreconditionFailed(String),

	/// S3/network hiccup or database contention; the caller may retry.
	#[error("transient I/O error: {0}")]
	TransientIo(String),

	/// A single file's upload/download failed after retries were exhausted.
	#[error("task failed for {path}: {source}")]
	FatalPerTask {
		path: PathBuf,
		#[source]
		source: Box<Error>,
	},

	/// An invariant was violated (e.g. duplicate (fsid, inode) dirent).
	#[error("invariant violated: {0}")]
	LogicViolation(String),

	#[error("database error: {0}")]
	Database(#[from] sea_orm::DbErr),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("dispatcher shut down: {0}")]
	Dispatch(#[from] backup_task_system::DispatchError),
}

impl Error {
	pub fn config_invalid(msg: impl Into<String>) -> Self {
		Self::ConfigInvalid(msg.into())
	}

	pub fn precondition_failed(msg: impl Into<String>) -> Self {
		Self::PreconditionFailed(msg.into())
	}

	pub fn transient_io(msg: impl Into<String>) -> Self {
		Self::TransientIo(msg.into())
	}

	pub fn logic_violation(msg: impl Into<String>) -> Self {
		Self::LogicViolation(msg.into())
	}

	pub fn fatal_per_task(path: impl Into<PathBuf>, source: Error) -> Self {
		Self::FatalPerTask {
			path: path.into(),
			source: Box::new(source),
		}
	}

	/// Whether this error kind is worth retrying with backoff before giving up.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::TransientIo(_))
	}
}

impl<E> From<aws_sdk_s3::error::SdkError<E>> for Error
where
	E: std::error::Error + Send + Sync + 'static,
{
	fn from(err: aws_sdk_s3::error::SdkError<E>) -> Self {
		Self::TransientIo(err.to_string())
	}
}
