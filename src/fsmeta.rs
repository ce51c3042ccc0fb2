//! POSIX filesystem metadata: stat, filesystem id, ownership, xattrs.
//!
//! Kept as small free functions rather than a trait because both the scan
//! engine (reading) and the restore engine (writing) need exactly these
//! primitives and nothing more.

use std::{
	os::unix::{ffi::OsStrExt, fs::MetadataExt},
	path::Path,
};

use nix::unistd::{FchownatFlags, Gid, Uid};

use crate::{
	error::{Error, Result},
	infrastructure::database::DirentKind,
};

#[derive(Debug, Clone)]
pub struct Stat {
	pub inode: i64,
	pub kind: DirentKind,
	pub size: i64,
	pub ctime: i64,
	pub mtime: i64,
	pub atime: i64,
	pub permission: i64,
	pub uid: i64,
	pub gid: i64,
}

/// `lstat` (never follows the final symlink component).
pub fn lstat(path: &Path) -> Result<Stat> {
	let meta = std::fs::symlink_metadata(path)?;
	let kind = if meta.file_type().is_symlink() {
		DirentKind::Symlink
	} else if meta.is_dir() {
		DirentKind::Directory
	} else {
		DirentKind::File
	};
	Ok(Stat {
		inode: meta.ino() as i64,
		kind,
		size: meta.size() as i64,
		ctime: meta.ctime(),
		mtime: meta.mtime(),
		atime: meta.atime(),
		permission: (meta.mode() & 0o7777) as i64,
		uid: meta.uid() as i64,
		gid: meta.gid() as i64,
	})
}

/// Filesystem id of the device backing `path`, computed once per scan and
/// threaded down to every `upsert_dirent` call so that `(fsid, inode)`
/// identifies an inode uniquely even across bind mounts.
pub fn filesystem_id(path: &Path) -> Result<i64> {
	let stat = nix::sys::statvfs::statvfs(path).map_err(|e| Error::transient_io(e.to_string()))?;
	Ok(stat.filesystem_id() as i64)
}

pub fn read_link(path: &Path) -> Result<String> {
	Ok(std::fs::read_link(path)?.to_string_lossy().into_owned())
}

pub fn list_xattrs(path: &Path) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
	let mut pairs = Vec::new();
	let names = match xattr::list(path) {
		Ok(names) => names,
		// Not every filesystem supports xattrs; treat as "none present".
		Err(_) => return Ok(pairs),
	};
	for name in names {
		if let Some(value) = xattr::get(path, &name).map_err(|e| Error::transient_io(e.to_string()))? {
			pairs.push((name.as_bytes().to_vec(), value));
		}
	}
	Ok(pairs)
}

pub fn set_xattrs(path: &Path, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
	for (name, value) in pairs {
		let name = std::ffi::OsStr::from_bytes(name);
		xattr::set(path, name, value).map_err(|e| Error::transient_io(e.to_string()))?;
	}
	Ok(())
}

pub fn chmod(path: &Path, mode: i64) -> Result<()> {
	use std::os::unix::fs::PermissionsExt;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode as u32))?;
	Ok(())
}

/// Ownership change that does not follow a trailing symlink.
pub fn lchown(path: &Path, uid: i64, gid: i64) -> Result<()> {
	nix::unistd::fchownat(
		None,
		path,
		Some(Uid::from_raw(uid as u32)),
		Some(Gid::from_raw(gid as u32)),
		FchownatFlags::NoFollowSymlink,
	)
	.map_err(|e| Error::transient_io(e.to_string()))
}

/// `ctime` cannot be set directly by design (the kernel derives it); only
/// `mtime`/`atime` are replayed.
pub fn set_times(path: &Path, mtime_secs: i64, atime_secs: i64) -> Result<()> {
	use filetime::FileTime;
	let mtime = FileTime::from_unix_time(mtime_secs, 0);
	let atime = FileTime::from_unix_time(atime_secs, 0);
	filetime::set_symlink_file_times(path, atime, mtime).map_err(Error::from)
}
