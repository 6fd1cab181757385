use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;

use super::{KeyValueStore, StoreError, io_err};

const TMP_SUFFIX: &str = ".tmp";

/// Directory-backed store: one file per key.
///
/// Keys are percent-encoded into flat file names so opaque owner ids never
/// escape the directory. Writes go to `<file>.tmp` and are renamed into
/// place.
#[derive(Debug, Clone)]
pub struct FileStore {
	root: PathBuf,
}

impl FileStore {
	/// Open (and create if needed) a store rooted at `root`.
	pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let root = root.into();
		tokio::fs::create_dir_all(&root)
			.await
			.map_err(|e| io_err(&root, e))?;
		debug!("Opened file store at {}", root.display());
		Ok(Self { root })
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
		if key.is_empty() {
			return Err(StoreError::InvalidKey(key.to_string()));
		}
		Ok(self.root.join(encode_key(key)))
	}
}

fn encode_key(key: &str) -> String {
	let mut out = String::with_capacity(key.len());
	for b in key.bytes() {
		if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
			out.push(b as char);
		} else {
			out.push_str(&format!("%{:02X}", b));
		}
	}
	out
}

fn decode_key(name: &str) -> Option<String> {
	let bytes = name.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'%' {
			let hex = name.get(i + 1..i + 3)?;
			out.push(u8::from_str_radix(hex, 16).ok()?);
			i += 3;
		} else {
			out.push(bytes[i]);
			i += 1;
		}
	}
	String::from_utf8(out).ok()
}

#[async_trait]
impl KeyValueStore for FileStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		let path = self.path_for(key)?;
		match tokio::fs::read(&path).await {
			Ok(bytes) => Ok(Some(bytes)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(io_err(path, e)),
		}
	}

	async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
		let path = self.path_for(key)?;
		let mut tmp = path.clone().into_os_string();
		tmp.push(TMP_SUFFIX);
		let tmp = PathBuf::from(tmp);

		tokio::fs::write(&tmp, value)
			.await
			.map_err(|e| io_err(&tmp, e))?;
		tokio::fs::rename(&tmp, &path)
			.await
			.map_err(|e| io_err(&path, e))?;
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		let path = self.path_for(key)?;
		match tokio::fs::remove_file(&path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(io_err(path, e)),
		}
	}

	async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
		let mut dir = tokio::fs::read_dir(&self.root)
			.await
			.map_err(|e| io_err(&self.root, e))?;

		let mut keys = Vec::new();
		while let Some(entry) = dir.next_entry().await.map_err(|e| io_err(&self.root, e))? {
			let name = entry.file_name();
			let Some(name) = name.to_str() else {
				continue;
			};
			if name.ends_with(TMP_SUFFIX) {
				continue;
			}
			if let Some(key) = decode_key(name) {
				if key.starts_with(prefix) {
					keys.push(key);
				}
			}
		}
		keys.sort();
		Ok(keys)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn key_encoding_keeps_names_flat() {
		let encoded = encode_key("location/../etc passwd");
		assert!(!encoded.contains('/'));
		assert!(!encoded.contains('.'));
		assert_eq!(decode_key(&encoded).as_deref(), Some("location/../etc passwd"));
	}

	#[test]
	fn decode_rejects_truncated_escapes() {
		assert_eq!(decode_key("abc%2"), None);
		assert_eq!(decode_key("abc%zz"), None);
	}

	#[tokio::test]
	async fn file_store_persists_across_reopen() {
		let dir = tempfile::tempdir().unwrap();

		let kv = FileStore::open(dir.path()).await.unwrap();
		kv.put("location/alice", b"{\"a\":1}").await.unwrap();
		kv.put("location/bob", b"{\"b\":2}").await.unwrap();
		kv.put("queue/pending", b"[]").await.unwrap();
		kv.delete("location/bob").await.unwrap();
		drop(kv);

		let reopened = FileStore::open(dir.path()).await.unwrap();
		assert_eq!(
			reopened.get("location/alice").await.unwrap().as_deref(),
			Some(&b"{\"a\":1}"[..])
		);
		assert!(reopened.get("location/bob").await.unwrap().is_none());
		assert_eq!(
			reopened.keys_with_prefix("location/").await.unwrap(),
			vec!["location/alice".to_string()]
		);
	}

	#[tokio::test]
	async fn empty_key_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let kv = FileStore::open(dir.path()).await.unwrap();
		assert!(matches!(kv.put("", b"x").await, Err(StoreError::InvalidKey(_))));
	}
}
