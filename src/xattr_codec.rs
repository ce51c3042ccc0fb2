//! Wire format for extended attributes stored in the `dirent.xattrs` column.
//!
//! Attribute names and values are arbitrary byte strings on Linux, so they
//! cannot be joined with a delimiter safely. Each record is instead
//! length-prefixed (`u32` little-endian name length, name bytes, `u32`
//! little-endian value length, value bytes); the whole concatenated record
//! stream is base64-encoded before being stored in a text column.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{Error, Result};

/// Encodes a set of `(name, value)` xattr pairs into the text column format.
pub fn encode(pairs: &[(Vec<u8>, Vec<u8>)]) -> String {
	let mut buf = Vec::new();
	for (name, value) in pairs {
		buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
		buf.extend_from_slice(name);
		buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
		buf.extend_from_slice(value);
	}
	STANDARD.encode(buf)
}

/// Decodes the text column format back into `(name, value)` pairs.
///
/// An empty string decodes to an empty vec; any malformed encoding is a
/// `LogicViolation` since it can only come from a row this engine itself
/// wrote.
pub fn decode(encoded: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
	if encoded.is_empty() {
		return Ok(Vec::new());
	}
	let buf = STANDARD
		.decode(encoded)
		.map_err(|e| Error::logic_violation(format!("xattr column is not valid base64: {e}")))?;

	let mut pairs = Vec::new();
	let mut cursor = 0usize;
	while cursor < buf.len() {
		let name_len = read_u32(&buf, &mut cursor)?;
		let name = read_bytes(&buf, &mut cursor, name_len)?;
		let value_len = read_u32(&buf, &mut cursor)?;
		let value = read_bytes(&buf, &mut cursor, value_len)?;
		pairs.push((name, value));
	}
	Ok(pairs)
}

fn read_u32(buf: &[u8], cursor: &mut usize) -> Result<u32> {
	let end = *cursor + 4;
	let slice = buf
		.get(*cursor..end)
		.ok_or_else(|| Error::logic_violation("truncated xattr record length prefix"))?;
	*cursor = end;
	Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_bytes(buf: &[u8], cursor: &mut usize, len: u32) -> Result<Vec<u8>> {
	let len = len as usize;
	let end = *cursor + len;
	let slice = buf
		.get(*cursor..end)
		.ok_or_else(|| Error::logic_violation("truncated xattr record body"))?;
	*cursor = end;
	Ok(slice.to_vec())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_empty() {
		let encoded = encode(&[]);
		assert_eq!(decode(&encoded).unwrap(), Vec::new());
	}

	#[test]
	fn round_trips_multiple_pairs_with_binary_values() {
		let pairs = vec![
			(b"user.comment".to_vec(), b"hello world".to_vec()),
			(b"user.bin".to_vec(), vec![0u8, 255, 1, 254, 0]),
		];
		let encoded = encode(&pairs);
		assert_eq!(decode(&encoded).unwrap(), pairs);
	}

	#[test]
	fn rejects_truncated_input() {
		let mut pairs_encoded = STANDARD.decode(encode(&[(b"a".to_vec(), b"b".to_vec())])).unwrap();
		pairs_encoded.truncate(pairs_encoded.len() - 1);
		let truncated = STANDARD.encode(pairs_encoded);
		assert!(decode(&truncated).is_err());
	}
}
