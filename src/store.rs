//! Persisted token cache contracts and built-in implementations.

pub mod file;
pub mod memory;

pub use file::FileTokenCache;
pub use memory::MemoryTokenCache;

// self
use crate::{
	_prelude::*,
	auth::{ClientId, CustomerId, TokenPair},
};

/// Boxed future returned by [`TokenCache`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Storage backend for the token pair of one customer/client combination.
pub trait TokenCache
where
	Self: Send + Sync,
{
	/// Persists or replaces the pair stored under `key`.
	fn save<'a>(&'a self, key: &'a CacheKey, pair: &'a TokenPair) -> StoreFuture<'a, ()>;

	/// Loads the pair stored under `key`, if any.
	fn load<'a>(&'a self, key: &'a CacheKey) -> StoreFuture<'a, Option<CachedTokens>>;
}

/// Pair read back from a cache, stamped with the instant it was written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedTokens {
	/// Stored pair.
	pub pair: TokenPair,
	/// Moment the pair was persisted.
	pub saved_at: OffsetDateTime,
}

/// Error type produced by [`TokenCache`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}

/// Identifies the cache slot for a customer/client pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
	/// Customer the tokens were issued for.
	pub customer_id: CustomerId,
	/// API client that minted the tokens.
	pub client_id: ClientId,
}
impl CacheKey {
	/// Builds a key for the provided identifiers.
	pub fn new(customer_id: CustomerId, client_id: ClientId) -> Self {
		Self { customer_id, client_id }
	}

	/// File name used by [`FileTokenCache`].
	pub fn file_name(&self) -> String {
		format!("tok_{}_{}.json", self.customer_id, self.client_id)
	}
}
