//! Splits a file into fixed-size, content-hashed chunks (C3).

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;

/// One chunk produced by [`chunk_file`].
#[derive(Debug, Clone)]
pub struct Chunk {
	pub chunk_index: u64,
	pub object_hash: String,
	pub size: u64,
	/// The last `buffer_size` bytes read for this chunk. A chunk that fits
	/// entirely in one buffer read can therefore be uploaded directly from
	/// `tail_bytes` without a second pass over the file.
	pub tail_bytes: Vec<u8>,
}

/// Reads `chunk_size` bytes at a time (itself read in `buffer_size`
/// increments) from `reader`, hashing each chunk independently. Stops at
/// EOF; a trailing empty chunk is never emitted.
pub async fn chunk_file<R>(mut reader: R, chunk_size: u64, buffer_size: usize) -> Result<Vec<Chunk>>
where
	R: AsyncRead + Unpin,
{
	let mut chunks = Vec::new();
	let mut chunk_index = 0u64;

	loop {
		let mut hasher = Sha256::new();
		let mut remaining = chunk_size;
		let mut actual_size = 0u64;
		let mut tail_bytes = Vec::new();
		let mut buf = vec![0u8; buffer_size];

		while remaining > 0 {
			let want = remaining.min(buffer_size as u64) as usize;
			let read = reader.read(&mut buf[..want]).await?;
			if read == 0 {
				break;
			}
			hasher.update(&buf[..read]);
			actual_size += read as u64;
			remaining -= read as u64;
			tail_bytes = buf[..read].to_vec();
		}

		if actual_size == 0 {
			break;
		}

		chunks.push(Chunk {
			chunk_index,
			object_hash: hex::encode(hasher.finalize()),
			size: actual_size,
			tail_bytes,
		});
		chunk_index += 1;

		if actual_size < chunk_size {
			break;
		}
	}

	Ok(chunks)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[tokio::test]
	async fn single_chunk_smaller_than_chunk_size() {
		let data = b"hello".to_vec();
		let chunks = chunk_file(Cursor::new(data.clone()), 4 * 1024 * 1024, 256).await.unwrap();
		assert_eq!(chunks.len(), 1);
		assert_eq!(chunks[0].size, 5);
		assert_eq!(chunks[0].tail_bytes, data);
		assert_eq!(
			chunks[0].object_hash,
			"2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
		);
	}

	#[tokio::test]
	async fn splits_across_chunk_boundary() {
		let data = vec![0u8; 10];
		let chunks = chunk_file(Cursor::new(data), 4, 4).await.unwrap();
		assert_eq!(chunks.len(), 3);
		assert_eq!(chunks[0].size, 4);
		assert_eq!(chunks[1].size, 4);
		assert_eq!(chunks[2].size, 2);
		assert_eq!(chunks[0].chunk_index, 0);
		assert_eq!(chunks[2].chunk_index, 2);
	}

	#[tokio::test]
	async fn exact_multiple_does_not_emit_trailing_empty_chunk() {
		let data = vec![1u8; 8];
		let chunks = chunk_file(Cursor::new(data), 4, 4).await.unwrap();
		assert_eq!(chunks.len(), 2);
	}

	#[tokio::test]
	async fn empty_file_yields_no_chunks() {
		let chunks = chunk_file(Cursor::new(Vec::new()), 4 * 1024 * 1024, 256).await.unwrap();
		assert!(chunks.is_empty());
	}
}
