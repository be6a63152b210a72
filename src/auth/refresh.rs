//! Bearer-token refresh with singleflight guards, candidate fallback, and metrics.
//!
//! [`TokenStore`] owns the active [`TokenPair`] plus an optional retry pair left over from
//! bootstrap. A refresh walks the candidates in order and installs the first pair the
//! [`TokenRefresher`] accepts. The new pair is persisted to the [`TokenCache`] and every
//! later request picks up the new `Authorization` header. The executor goes through
//! [`TokenStore::refresh_after_rejection`], which serializes concurrent refreshes so a burst
//! of 401s produces a single exchange.

mod metrics;

pub use metrics::RefreshMetrics;

// self
use crate::{
	_prelude::*,
	auth::{ClientId, TokenPair, TokenSecret, dedup_candidates},
	error::{RefreshError, TransportError},
	http::{ApiTransport, HttpRequest},
	obs::{self, CallKind, CallOutcome, CallSpan},
	request::Method,
	store::{CacheKey, TokenCache},
};

/// Path of the token exchange endpoint, relative to the API base URL.
pub const REFRESH_PATH: &str = "/oauth2/token";

/// Boxed future returned by [`TokenRefresher::refresh`].
pub type RefreshFuture<'a> = Pin<Box<dyn Future<Output = Result<TokenPair>> + 'a + Send>>;
/// Boxed future returned by [`TokenRecovery::recover`].
pub type RecoveryFuture<'a> = Pin<Box<dyn Future<Output = Option<TokenPair>> + 'a + Send>>;
/// Boxed future returned by [`ExpiryHook::on_signature_expired`].
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = ()> + 'a + Send>>;

/// Exchanges a refresh token for a new pair.
pub trait TokenRefresher
where
	Self: Send + Sync,
{
	/// Performs one exchange for `pair`.
	fn refresh<'a>(&'a self, pair: &'a TokenPair) -> RefreshFuture<'a>;
}

/// Fallback used when every refresh candidate failed on a non-silent refresh.
///
/// Implementations typically prompt the operator for a freshly generated pair.
pub trait TokenRecovery
where
	Self: Send + Sync,
{
	/// Produces a replacement pair, or `None` to give up.
	fn recover(&self) -> RecoveryFuture<'_>;
}

/// Invoked when the gateway reports an expired request signature.
pub trait ExpiryHook
where
	Self: Send + Sync,
{
	/// Re-establishes whatever credential the signature was derived from.
	fn on_signature_expired(&self) -> HookFuture<'_>;
}

/// Recovery that never yields a pair.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRecovery;
impl TokenRecovery for NoRecovery {
	fn recover(&self) -> RecoveryFuture<'_> {
		Box::pin(async { None })
	}
}

/// Expiry hook that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopExpiryHook;
impl ExpiryHook for NoopExpiryHook {
	fn on_signature_expired(&self) -> HookFuture<'_> {
		Box::pin(async {})
	}
}

/// Default refresher posting to `{base_url}/oauth2/token`.
///
/// Credentials travel as query parameters:
/// `client_id`, `client_secret`, `grant_type=refresh_token`, `refresh_token`.
#[derive(Clone)]
pub struct EndpointRefresher {
	transport: Arc<dyn ApiTransport>,
	endpoint: Url,
	client_id: ClientId,
	client_secret: TokenSecret,
}
impl EndpointRefresher {
	/// Creates a refresher for the API rooted at `base_url`.
	pub fn new(
		transport: Arc<dyn ApiTransport>,
		base_url: &Url,
		client_id: ClientId,
		client_secret: TokenSecret,
	) -> Result<Self> {
		let endpoint = base_url.join(REFRESH_PATH).map_err(|source| {
			crate::error::ConfigError::InvalidPath { path: REFRESH_PATH.into(), source }
		})?;

		Ok(Self { transport, endpoint, client_id, client_secret })
	}

	/// Token endpoint without the credential query.
	pub fn endpoint(&self) -> &Url {
		&self.endpoint
	}

	async fn exchange(&self, pair: &TokenPair) -> Result<TokenPair> {
		let mut url = self.endpoint.clone();

		url.query_pairs_mut()
			.append_pair("client_id", &self.client_id)
			.append_pair("client_secret", self.client_secret.expose())
			.append_pair("grant_type", "refresh_token")
			.append_pair("refresh_token", pair.refresh_token.expose());

		let request = HttpRequest {
			method: Method::Post,
			url,
			headers: vec![("Accept".into(), "application/json".into())],
			body: None,
		};
		let response = self
			.transport
			.send(request)
			.await
			.map_err(|e| TransportError::network(self.endpoint.as_str(), e))?;

		if !response.is_success() {
			let message = serde_json::from_slice::<Value>(&response.body)
				.ok()
				.and_then(|v| {
					v.get("error_description")
						.or_else(|| v.get("error"))
						.and_then(Value::as_str)
						.map(str::to_owned)
				})
				.unwrap_or_else(|| String::from_utf8_lossy(&response.body).chars().take(256).collect());

			return Err(RefreshError::Rejected { status: response.status, message }.into());
		}

		let mut deserializer = serde_json::Deserializer::from_slice(&response.body);
		let pair = serde_path_to_error::deserialize(&mut deserializer)
			.map_err(|source| RefreshError::Malformed { source })?;

		Ok(pair)
	}
}
impl Debug for EndpointRefresher {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("EndpointRefresher")
			.field("endpoint", &self.endpoint.as_str())
			.field("client_id", &self.client_id)
			.finish_non_exhaustive()
	}
}
impl TokenRefresher for EndpointRefresher {
	fn refresh<'a>(&'a self, pair: &'a TokenPair) -> RefreshFuture<'a> {
		Box::pin(self.exchange(pair))
	}
}

#[derive(Debug, Default)]
struct TokenSlots {
	current: Option<TokenPair>,
	retry: Option<TokenPair>,
}

/// Holder of the active token pair and the refresh machinery around it.
pub struct TokenStore {
	key: CacheKey,
	cache: Arc<dyn TokenCache>,
	refresher: Arc<dyn TokenRefresher>,
	recovery: Arc<dyn TokenRecovery>,
	slots: RwLock<TokenSlots>,
	singleflight: AsyncMutex<()>,
	metrics: RefreshMetrics,
}
impl TokenStore {
	/// Creates an empty store; call [`TokenStore::bootstrap`] or [`TokenStore::install_pairs`]
	/// before issuing requests.
	pub fn new(
		key: CacheKey,
		cache: Arc<dyn TokenCache>,
		refresher: Arc<dyn TokenRefresher>,
	) -> Self {
		Self {
			key,
			cache,
			refresher,
			recovery: Arc::new(NoRecovery),
			slots: Default::default(),
			singleflight: AsyncMutex::new(()),
			metrics: RefreshMetrics::default(),
		}
	}

	/// Installs a recovery hook for non-silent refreshes.
	pub fn with_recovery(mut self, recovery: Arc<dyn TokenRecovery>) -> Self {
		self.recovery = recovery;

		self
	}

	/// Loads the cached pair and orders it against the configured pair.
	///
	/// The newer of the two becomes current and the other one the retry candidate; pairs
	/// sharing a refresh secret collapse into one. A configured pair is written to an empty
	/// cache so later runs find it.
	pub async fn bootstrap(
		&self,
		configured: Option<TokenPair>,
		configured_at: Option<OffsetDateTime>,
	) {
		let cached = match self.cache.load(&self.key).await {
			Ok(cached) => cached,
			Err(e) => {
				tracing::warn!(error = %e, "Token cache could not be read, ignoring it.");

				None
			},
		};
		let (current, retry) = match (cached, configured) {
			(None, None) => (None, None),
			(Some(cached), None) => (Some(cached.pair), None),
			(None, Some(configured)) => {
				if let Err(e) = self.cache.save(&self.key, &configured).await {
					tracing::warn!(error = %e, "Failed to seed token cache with configured tokens.");
				}

				(Some(configured), None)
			},
			(Some(cached), Some(configured)) => {
				let cache_is_newer = configured_at.is_none_or(|at| cached.saved_at > at);
				let (current, retry) = if cache_is_newer {
					(cached.pair, configured)
				} else {
					(configured, cached.pair)
				};

				if current.same_refresh(&retry) { (Some(current), None) } else { (Some(current), Some(retry)) }
			},
		};

		tracing::debug!(has_current = current.is_some(), has_retry = retry.is_some(), "Token store bootstrapped.");
		self.install_pairs(current, retry);
	}

	/// Replaces the current and retry pairs without touching the cache.
	pub fn install_pairs(&self, current: Option<TokenPair>, retry: Option<TokenPair>) {
		let mut slots = self.slots.write();

		slots.current = current;
		slots.retry = retry;
	}

	/// Active pair.
	pub fn current(&self) -> Option<TokenPair> {
		self.slots.read().current.clone()
	}

	/// Stale pair kept as a second refresh candidate.
	pub fn retry(&self) -> Option<TokenPair> {
		self.slots.read().retry.clone()
	}

	/// `Authorization` header value for the active pair.
	pub fn bearer(&self) -> Option<String> {
		self.slots.read().current.as_ref().map(TokenPair::bearer)
	}

	/// Counters for refresh exchanges.
	pub fn metrics(&self) -> &RefreshMetrics {
		&self.metrics
	}

	/// Tries each candidate in order and installs the first refreshed pair.
	///
	/// When every candidate fails and `silent` is false the recovery hook may supply one
	/// more pair to exchange. Returns whether a new pair is now active.
	pub async fn refresh(&self, candidates: Vec<TokenPair>, silent: bool) -> bool {
		let _singleflight = self.singleflight.lock().await;

		self.refresh_locked(candidates, silent).await
	}

	/// Refreshes using the current pair, then the retry pair.
	pub async fn refresh_current(&self, silent: bool) -> bool {
		let _singleflight = self.singleflight.lock().await;

		self.refresh_locked(self.candidates(), silent).await
	}

	/// Refreshes after the API rejected `rejected_bearer`.
	///
	/// Concurrent callers queue on one guard; a caller whose rejected token was already
	/// replaced while it waited returns `true` without another exchange.
	pub async fn refresh_after_rejection(&self, rejected_bearer: Option<&str>) -> bool {
		let _singleflight = self.singleflight.lock().await;

		if self.bearer().as_deref() != rejected_bearer {
			tracing::debug!("Token already refreshed by a concurrent call.");

			return true;
		}

		self.refresh_locked(self.candidates(), false).await
	}

	fn candidates(&self) -> Vec<TokenPair> {
		let slots = self.slots.read();

		slots.current.iter().chain(slots.retry.iter()).cloned().collect()
	}

	async fn refresh_locked(&self, candidates: Vec<TokenPair>, silent: bool) -> bool {
		const KIND: CallKind = CallKind::Refresh;

		let span = CallSpan::new(KIND, "refresh");

		obs::record_call_outcome(KIND, CallOutcome::Attempt);

		let refreshed = span
			.instrument(async move {
				let candidates = dedup_candidates(candidates);

				for (idx, pair) in candidates.iter().enumerate() {
					if self.exchange(pair, idx).await {
						return true;
					}
				}

				if silent {
					return false;
				}

				match self.recovery.recover().await {
					Some(pair) => self.exchange(&pair, candidates.len()).await,
					None => false,
				}
			})
			.await;

		obs::record_call_outcome(KIND, CallOutcome::from_ok(refreshed));

		if !refreshed {
			tracing::error!("Token refresh failed for every candidate.");
		}

		refreshed
	}

	async fn exchange(&self, pair: &TokenPair, idx: usize) -> bool {
		self.metrics.record_attempt();

		match self.refresher.refresh(pair).await {
			Ok(new_pair) => {
				self.metrics.record_success();

				if let Err(e) = self.cache.save(&self.key, &new_pair).await {
					tracing::warn!(error = %e, "Failed to persist refreshed tokens.");
				}

				self.install_pairs(Some(new_pair), None);
				tracing::info!(candidate = idx, "Token refreshed.");

				true
			},
			Err(e) => {
				self.metrics.record_failure();
				tracing::warn!(candidate = idx, error = %e, "Token refresh attempt failed.");

				false
			},
		}
	}
}
impl Debug for TokenStore {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenStore")
			.field("key", &self.key)
			.field("slots", &*self.slots.read())
			.field("metrics", &self.metrics)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use super::*;
	use crate::{_preludet::*, store::MemoryTokenCache};

	/// Refresher that accepts only refresh secrets listed in `accepted`.
	struct SelectiveRefresher {
		accepted: Vec<&'static str>,
		calls: AtomicUsize,
	}
	impl SelectiveRefresher {
		fn new(accepted: Vec<&'static str>) -> Arc<Self> {
			Arc::new(Self { accepted, calls: AtomicUsize::new(0) })
		}
	}
	impl TokenRefresher for SelectiveRefresher {
		fn refresh<'a>(&'a self, pair: &'a TokenPair) -> RefreshFuture<'a> {
			Box::pin(async move {
				let n = self.calls.fetch_add(1, Ordering::SeqCst);
				let secret = pair.refresh_token.expose();
				let result: Result<TokenPair> = if self.accepted.contains(&secret) {
					Ok(TokenPair::new(format!("access-new-{n}"), format!("refresh-new-{n}")))
				} else {
					Err(RefreshError::Rejected { status: 400, message: "invalid_grant".into() }.into())
				};

				result
			})
		}
	}

	struct FixedRecovery(TokenPair);
	impl TokenRecovery for FixedRecovery {
		fn recover(&self) -> RecoveryFuture<'_> {
			Box::pin(async move { Some(self.0.clone()) })
		}
	}

	fn store(refresher: Arc<SelectiveRefresher>) -> (TokenStore, MemoryTokenCache) {
		let cache = MemoryTokenCache::default();

		(TokenStore::new(cache_key(), Arc::new(cache.clone()), refresher), cache)
	}

	#[tokio::test]
	async fn falls_back_to_retry_candidate() {
		let refresher = SelectiveRefresher::new(vec!["valid-retry"]);
		let (store, cache) = store(refresher.clone());
		let refreshed = store
			.refresh(vec![token_pair("a", "expired"), token_pair("b", "valid-retry")], true)
			.await;

		assert!(refreshed);
		assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
		assert_eq!(store.bearer().as_deref(), Some("Bearer access-new-1"));
		assert_eq!(store.retry(), None);
		assert_eq!(cache.peek(&cache_key()), store.current());
		assert_eq!(store.metrics().failures(), 1);
		assert_eq!(store.metrics().successes(), 1);
	}

	#[tokio::test]
	async fn identical_candidates_are_tried_once() {
		let refresher = SelectiveRefresher::new(vec![]);
		let (store, _) = store(refresher.clone());
		let refreshed =
			store.refresh(vec![token_pair("a", "same"), token_pair("b", "same")], true).await;

		assert!(!refreshed);
		assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn recovery_runs_only_when_not_silent() {
		let refresher = SelectiveRefresher::new(vec!["pasted"]);
		let cache = MemoryTokenCache::default();
		let store = TokenStore::new(cache_key(), Arc::new(cache), refresher.clone())
			.with_recovery(Arc::new(FixedRecovery(token_pair("x", "pasted"))));

		store.install_pairs(Some(token_pair("a", "dead")), None);

		assert!(!store.refresh_current(true).await);
		assert!(store.refresh_current(false).await);
		assert_eq!(refresher.calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn rejection_of_a_replaced_token_skips_the_exchange() {
		let refresher = SelectiveRefresher::new(vec!["r"]);
		let (store, _) = store(refresher.clone());

		store.install_pairs(Some(token_pair("fresh", "r")), None);

		assert!(store.refresh_after_rejection(Some("Bearer stale")).await);
		assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
		assert!(store.refresh_after_rejection(Some("Bearer fresh")).await);
		assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn bootstrap_prefers_newer_cache_and_keeps_config_as_retry() {
		let saved_at = OffsetDateTime::now_utc();
		let cache = MemoryTokenCache::seeded(cache_key(), token_pair("cached", "rc"), saved_at);
		let store = TokenStore::new(
			cache_key(),
			Arc::new(cache),
			SelectiveRefresher::new(vec![]),
		);

		store
			.bootstrap(Some(token_pair("config", "rf")), Some(saved_at - time::Duration::hours(1)))
			.await;

		assert_eq!(store.current(), Some(token_pair("cached", "rc")));
		assert_eq!(store.retry(), Some(token_pair("config", "rf")));
	}

	#[tokio::test]
	async fn bootstrap_prefers_newer_config_and_collapses_duplicates() {
		let saved_at = OffsetDateTime::now_utc() - time::Duration::hours(2);
		let cache = MemoryTokenCache::seeded(cache_key(), token_pair("cached", "same"), saved_at);
		let store = TokenStore::new(
			cache_key(),
			Arc::new(cache),
			SelectiveRefresher::new(vec![]),
		);

		store.bootstrap(Some(token_pair("config", "same")), Some(OffsetDateTime::now_utc())).await;

		assert_eq!(store.current(), Some(token_pair("config", "same")));
		assert_eq!(store.retry(), None);
	}

	#[tokio::test]
	async fn bootstrap_seeds_empty_cache_with_configured_pair() {
		let cache = MemoryTokenCache::default();
		let store =
			TokenStore::new(cache_key(), Arc::new(cache.clone()), SelectiveRefresher::new(vec![]));

		store.bootstrap(Some(token_pair("config", "rf")), None).await;

		assert_eq!(cache.peek(&cache_key()), Some(token_pair("config", "rf")));
		assert_eq!(store.bearer().as_deref(), Some("Bearer config"));
	}
}
