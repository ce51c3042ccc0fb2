//! YAML configuration document (spec.md §6 / SPEC_FULL.md §6).
//!
//! Only `root_dir` and `s3_config` are required; everything else has a
//! sensible default so a minimal config file is valid.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_chunksize() -> u64 {
	4 * 1024 * 1024
}

fn default_buffersize() -> usize {
	256 * 1024
}

fn default_s3_max() -> usize {
	1000
}

fn default_db_max() -> usize {
	1000
}

fn default_lb_max() -> usize {
	16
}

fn default_s3_pool_size() -> usize {
	100
}

fn default_restore_max() -> usize {
	64
}

fn default_metadata_db_path() -> PathBuf {
	PathBuf::from("backup_meta.db")
}

fn default_metadata_identifier() -> String {
	"backup_meta".to_string()
}

fn default_upload_metadata_snapshot() -> bool {
	true
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
	pub s3_endpoint: String,
	pub s3_bucket: String,
	/// Optional explicit credentials; when absent the AWS SDK's default
	/// credential chain (env vars, profile, IMDS) is used.
	pub access_key_id: Option<String>,
	pub secret_access_key: Option<String>,
	#[serde(default)]
	pub region: Option<String>,
	/// Needed for most non-AWS S3-compatible endpoints (path-style addressing).
	#[serde(default = "default_force_path_style")]
	pub force_path_style: bool,
}

fn default_force_path_style() -> bool {
	true
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataStoreConfig {
	#[serde(default = "default_metadata_db_path")]
	pub sqlite_path: PathBuf,
	/// Object-store key prefix metadata snapshots are stored under, suffixed
	/// with `_{scan_counter}`.
	#[serde(default = "default_metadata_identifier")]
	pub metadata_identifier: String,
}

impl Default for MetadataStoreConfig {
	fn default() -> Self {
		Self {
			sqlite_path: default_metadata_db_path(),
			metadata_identifier: default_metadata_identifier(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub root_dir: PathBuf,
	pub s3_config: S3Config,

	#[serde(default = "default_chunksize")]
	pub chunksize: u64,
	#[serde(default = "default_buffersize")]
	pub buffersize: usize,
	#[serde(default = "default_s3_max")]
	pub s3_max: usize,
	#[serde(default = "default_db_max")]
	pub db_max: usize,
	#[serde(default = "default_lb_max")]
	pub lb_max: usize,
	#[serde(default = "default_s3_pool_size")]
	pub s3_pool_size: usize,
	#[serde(default = "default_restore_max")]
	pub restore_max: usize,
	#[serde(default)]
	pub metadata_store: MetadataStoreConfig,
	#[serde(default = "default_upload_metadata_snapshot")]
	pub upload_metadata_snapshot: bool,
}

impl Config {
	pub fn load(path: &Path) -> Result<Self> {
		let raw = std::fs::read_to_string(path).map_err(|e| {
			Error::config_invalid(format!("cannot read config file {}: {e}", path.display()))
		})?;
		let config: Self = serde_yaml::from_str(&raw)
			.map_err(|e| Error::config_invalid(format!("malformed config YAML: {e}")))?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<()> {
		if !self.root_dir.is_absolute() {
			return Err(Error::config_invalid("root_dir must be an absolute path"));
		}
		if self.s3_config.s3_bucket.is_empty() {
			return Err(Error::config_invalid("s3_config.s3_bucket must not be empty"));
		}
		if self.s3_config.s3_endpoint.is_empty() {
			return Err(Error::config_invalid("s3_config.s3_endpoint must not be empty"));
		}
		if self.chunksize == 0 {
			return Err(Error::config_invalid("chunksize must be > 0"));
		}
		if self.buffersize == 0 {
			return Err(Error::config_invalid("buffersize must be > 0"));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn minimal_config_gets_defaults() {
		let yaml = r#"
root_dir: /srv/data
s3_config:
  s3_endpoint: http://localhost:9000
  s3_bucket: backups
"#;
		let config: Config = serde_yaml::from_str(yaml).unwrap();
		config.validate().unwrap();
		assert_eq!(config.chunksize, default_chunksize());
		assert_eq!(config.lb_max, 16);
		assert!(config.upload_metadata_snapshot);
	}

	#[test]
	fn relative_root_dir_is_rejected() {
		let yaml = r#"
root_dir: relative/path
s3_config:
  s3_endpoint: http://localhost:9000
  s3_bucket: backups
"#;
		let config: Config = serde_yaml::from_str(yaml).unwrap();
		assert!(config.validate().is_err());
	}
}
