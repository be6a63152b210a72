//! File-backed [`TokenCache`] writing one JSON document per customer/client pair.

// std
use std::{
	fs::{self, File},
	io::Write,
	path::{Path, PathBuf},
};
// self
use crate::{
	_prelude::*,
	auth::TokenPair,
	store::{CacheKey, CachedTokens, StoreError, StoreFuture, TokenCache},
};

#[derive(Serialize, Deserialize)]
struct CacheDocument {
	#[serde(flatten)]
	pair: TokenPair,
	/// Unix timestamp (seconds); older documents without it fall back to the file mtime.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	saved_at: Option<i64>,
}

/// Persists token pairs as `tok_{customer}_{client}.json` inside a directory.
#[derive(Clone, Debug)]
pub struct FileTokenCache {
	dir: PathBuf,
	write_guard: Arc<Mutex<()>>,
}
impl FileTokenCache {
	/// Opens (or creates) the cache directory.
	pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let dir = dir.into();

		fs::create_dir_all(&dir).map_err(|e| StoreError::Backend {
			message: format!("Failed to create token cache directory {}: {e}", dir.display()),
		})?;

		Ok(Self { dir, write_guard: Default::default() })
	}

	/// Full path of the document backing `key`.
	pub fn path_for(&self, key: &CacheKey) -> PathBuf {
		self.dir.join(key.file_name())
	}

	fn read_document(path: &Path) -> Result<Option<CachedTokens>, StoreError> {
		if !path.exists() {
			return Ok(None);
		}

		let metadata = path.metadata().map_err(|e| StoreError::Backend {
			message: format!("Failed to inspect {}: {e}", path.display()),
		})?;

		if metadata.len() == 0 {
			return Ok(None);
		}

		let bytes = fs::read(path).map_err(|e| StoreError::Backend {
			message: format!("Failed to read {}: {e}", path.display()),
		})?;
		let document: CacheDocument =
			serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
				message: format!("Failed to parse {}: {e}", path.display()),
			})?;
		let saved_at = match document.saved_at {
			Some(ts) => OffsetDateTime::from_unix_timestamp(ts).map_err(|e| {
				StoreError::Serialization {
					message: format!("Invalid timestamp in {}: {e}", path.display()),
				}
			})?,
			None => metadata.modified().map(OffsetDateTime::from).map_err(|e| {
				StoreError::Backend {
					message: format!("Failed to read mtime of {}: {e}", path.display()),
				}
			})?,
		};

		Ok(Some(CachedTokens { pair: document.pair, saved_at }))
	}

	fn write_document(path: &Path, pair: &TokenPair) -> Result<(), StoreError> {
		let document = CacheDocument {
			pair: pair.clone(),
			saved_at: Some(OffsetDateTime::now_utc().unix_timestamp()),
		};
		let serialized =
			serde_json::to_vec_pretty(&document).map_err(|e| StoreError::Serialization {
				message: format!("Failed to serialize token pair: {e}"),
			})?;
		let mut tmp_path = path.to_path_buf();

		tmp_path.set_extension("tmp");

		{
			let mut file = File::create(&tmp_path).map_err(|e| StoreError::Backend {
				message: format!("Failed to create {}: {e}", tmp_path.display()),
			})?;

			file.write_all(&serialized).map_err(|e| StoreError::Backend {
				message: format!("Failed to write {}: {e}", tmp_path.display()),
			})?;
			file.sync_all().map_err(|e| StoreError::Backend {
				message: format!("Failed to sync {}: {e}", tmp_path.display()),
			})?;
		}

		fs::rename(&tmp_path, path).map_err(|e| StoreError::Backend {
			message: format!("Failed to replace {}: {e}", path.display()),
		})
	}
}
impl TokenCache for FileTokenCache {
	fn save<'a>(&'a self, key: &'a CacheKey, pair: &'a TokenPair) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			let _guard = self.write_guard.lock();

			Self::write_document(&self.path_for(key), pair)
		})
	}

	fn load<'a>(&'a self, key: &'a CacheKey) -> StoreFuture<'a, Option<CachedTokens>> {
		Box::pin(async move { Self::read_document(&self.path_for(key)) })
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::{env, process};
	// self
	use super::*;
	use crate::auth::{ClientId, CustomerId};

	fn temp_dir() -> PathBuf {
		let unique = format!(
			"central_session_token_cache_{}_{}",
			process::id(),
			OffsetDateTime::now_utc().unix_timestamp_nanos(),
		);

		env::temp_dir().join(unique)
	}

	fn key() -> CacheKey {
		CacheKey::new(
			CustomerId::new("cust-1").expect("Customer fixture should be valid."),
			ClientId::new("client-1").expect("Client fixture should be valid."),
		)
	}

	#[tokio::test]
	async fn save_and_reload_round_trip() {
		let dir = temp_dir();
		let cache = FileTokenCache::open(&dir).expect("Failed to open token cache directory.");
		let pair = TokenPair::new("access-a", "refresh-a");

		cache.save(&key(), &pair).await.expect("Saving the pair should succeed.");

		let reopened = FileTokenCache::open(&dir).expect("Failed to reopen token cache.");
		let loaded = reopened
			.load(&key())
			.await
			.expect("Loading the pair should succeed.")
			.expect("Cache lost the pair after reopen.");

		assert_eq!(loaded.pair, pair);
		assert!(reopened.path_for(&key()).ends_with("tok_cust-1_client-1.json"));

		fs::remove_dir_all(&dir).unwrap_or_else(|e| {
			panic!("Failed to remove temporary cache directory {}: {e}", dir.display())
		});
	}

	#[tokio::test]
	async fn documents_without_timestamp_use_file_mtime() {
		let dir = temp_dir();
		let cache = FileTokenCache::open(&dir).expect("Failed to open token cache directory.");

		fs::write(cache.path_for(&key()), br#"{"access_token":"a","refresh_token":"r"}"#)
			.expect("Failed to seed legacy cache document.");

		let loaded = cache
			.load(&key())
			.await
			.expect("Legacy document should load.")
			.expect("Legacy document should be present.");

		assert_eq!(loaded.pair, TokenPair::new("a", "r"));
		assert!(loaded.saved_at <= OffsetDateTime::now_utc());

		fs::remove_dir_all(&dir).unwrap_or_else(|e| {
			panic!("Failed to remove temporary cache directory {}: {e}", dir.display())
		});
	}

	#[tokio::test]
	async fn missing_document_loads_as_none() {
		let dir = temp_dir();
		let cache = FileTokenCache::open(&dir).expect("Failed to open token cache directory.");

		assert!(cache.load(&key()).await.expect("Load should succeed.").is_none());

		fs::remove_dir_all(&dir).unwrap_or_else(|e| {
			panic!("Failed to remove temporary cache directory {}: {e}", dir.display())
		});
	}
}
