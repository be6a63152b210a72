//! Thread-safe in-memory [`TokenCache`] for tests and short-lived sessions.

// self
use crate::{
	_prelude::*,
	auth::TokenPair,
	store::{CacheKey, CachedTokens, StoreFuture, TokenCache},
};

type CacheMap = Arc<RwLock<HashMap<CacheKey, CachedTokens>>>;

/// Keeps token pairs in-process; clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryTokenCache(CacheMap);
impl MemoryTokenCache {
	/// Seeds the cache with a pair stamped at `saved_at`.
	pub fn seeded(key: CacheKey, pair: TokenPair, saved_at: OffsetDateTime) -> Self {
		let cache = Self::default();

		cache.0.write().insert(key, CachedTokens { pair, saved_at });

		cache
	}

	/// Returns the stored pair without going through the async contract.
	pub fn peek(&self, key: &CacheKey) -> Option<TokenPair> {
		self.0.read().get(key).map(|cached| cached.pair.clone())
	}
}
impl TokenCache for MemoryTokenCache {
	fn save<'a>(&'a self, key: &'a CacheKey, pair: &'a TokenPair) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			let cached = CachedTokens { pair: pair.clone(), saved_at: OffsetDateTime::now_utc() };

			self.0.write().insert(key.clone(), cached);

			Ok(())
		})
	}

	fn load<'a>(&'a self, key: &'a CacheKey) -> StoreFuture<'a, Option<CachedTokens>> {
		Box::pin(async move { Ok(self.0.read().get(key).cloned()) })
	}
}
