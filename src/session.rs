//! The [`Session`] facade tying executor, pagination, batching, and tokens together.
//!
//! A session starts [`SessionState::Unverified`] and turns [`SessionState::Verified`] after
//! its first successful call. Batches consult that state to decide whether the first
//! request must run alone. Clones share one inner state, so a session can be handed to
//! batched operations and cache refreshers freely.

// std
use std::sync::atomic::{AtomicBool, Ordering};
// self
use crate::{
	_prelude::*,
	auth::{
		EndpointRefresher, ExpiryHook, NoopExpiryHook, TokenRecovery, TokenRefresher, TokenStore,
	},
	batch::{BatchScheduler, DeferredRequest, DispatchFuture, Dispatcher},
	config::SessionConfig,
	executor::RequestExecutor,
	http::ApiTransport,
	pagination::{FetchOptions, PaginationAggregator},
	rate_limit::{RateLimitLogEntry, RateLimitSnapshot},
	request::Request,
	response::{EnvelopeUnwrapper, Response, ResponseUnwrapper},
	store::{FileTokenCache, MemoryTokenCache, TokenCache},
};

/// Whether a call has succeeded on the session yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
	/// No call has succeeded; credentials are unproven.
	Unverified,
	/// At least one call succeeded.
	Verified,
}

struct SessionInner {
	config: SessionConfig,
	executor: RequestExecutor,
	tokens: Arc<TokenStore>,
	scheduler: BatchScheduler,
	pagination: PaginationAggregator,
	verified: AtomicBool,
}

/// Cheaply cloneable handle for issuing API calls.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);
impl Session {
	/// Opens a session with the default transport, token cache, and refresher.
	pub async fn connect(config: SessionConfig) -> Result<Self> {
		Self::builder(config).build().await
	}

	/// Starts a builder for custom collaborators.
	pub fn builder(config: SessionConfig) -> SessionBuilder {
		SessionBuilder::new(config)
	}

	/// Executes a single call without pagination.
	pub async fn execute(&self, request: Request) -> Response {
		let response = self.0.executor.execute(request).await;

		if response.ok && !self.0.verified.swap(true, Ordering::SeqCst) {
			tracing::debug!("Session verified by first successful call.");
		}

		response
	}

	/// Executes a call and follows every page of its result set.
	pub async fn fetch(&self, request: Request, options: FetchOptions) -> Response {
		self.0.pagination.drive(self, &self.0.scheduler, request, options).await
	}

	/// `GET path`, following pagination.
	pub async fn get(&self, path: impl Into<String>) -> Response {
		self.fetch(Request::get(path), FetchOptions::default()).await
	}

	/// `POST path` with a JSON body.
	pub async fn post(&self, path: impl Into<String>, body: Value) -> Response {
		self.execute(Request::post(path).json(body)).await
	}

	/// `PUT path` with a JSON body.
	pub async fn put(&self, path: impl Into<String>, body: Value) -> Response {
		self.execute(Request::put(path).json(body)).await
	}

	/// `PATCH path` with a JSON body.
	pub async fn patch(&self, path: impl Into<String>, body: Value) -> Response {
		self.execute(Request::patch(path).json(body)).await
	}

	/// `DELETE path`.
	pub async fn delete(&self, path: impl Into<String>) -> Response {
		self.execute(Request::delete(path)).await
	}

	/// Runs independent requests in paced chunks, returning responses in input order.
	pub async fn batch(
		&self,
		requests: Vec<DeferredRequest>,
		continue_on_fail: bool,
	) -> Vec<Response> {
		self.0.scheduler.run(self, requests, continue_on_fail).await
	}

	/// Cancels every pending and future call.
	pub fn cancel(&self) {
		tracing::info!("Session cancelled.");
		self.0.executor.cancel();
	}

	/// Whether [`Session::cancel`] was called.
	pub fn is_cancelled(&self) -> bool {
		self.0.executor.is_cancelled()
	}

	/// Current verification state.
	pub fn state(&self) -> SessionState {
		if self.0.verified.load(Ordering::SeqCst) {
			SessionState::Verified
		} else {
			SessionState::Unverified
		}
	}

	/// HTTP requests issued so far, including retries and token exchanges.
	pub fn request_count(&self) -> u64 {
		self.0.executor.request_count() + self.0.tokens.metrics().attempts()
	}

	/// Timeline of attempts and their quota observations.
	pub fn rate_limit_log(&self) -> Vec<RateLimitLogEntry> {
		self.0.executor.rate_limit_log().entries()
	}

	/// Latest quota reported by the API.
	pub fn rate_limit(&self) -> Option<RateLimitSnapshot> {
		self.0.executor.rate_limits().latest()
	}

	/// Token store backing the session.
	pub fn tokens(&self) -> &TokenStore {
		&self.0.tokens
	}

	/// Configuration the session was opened with.
	pub fn config(&self) -> &SessionConfig {
		&self.0.config
	}
}
impl Dispatcher for Session {
	fn dispatch(&self, request: DeferredRequest) -> DispatchFuture<'_> {
		match request {
			DeferredRequest::Call(request) => Box::pin(self.execute(request)),
			DeferredRequest::Fetch(request, options) => Box::pin(self.fetch(request, options)),
			DeferredRequest::Operation(op) => op(self.clone()),
		}
	}

	fn is_verified(&self) -> bool {
		self.state() == SessionState::Verified
	}
}
impl Debug for Session {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Session")
			.field("base_url", &self.0.config.base_url.as_str())
			.field("customer_id", &self.0.config.customer_id)
			.field("state", &self.state())
			.field("executor", &self.0.executor)
			.finish_non_exhaustive()
	}
}

/// Assembles a [`Session`] with optional custom collaborators.
pub struct SessionBuilder {
	config: SessionConfig,
	transport: Option<Arc<dyn ApiTransport>>,
	token_cache: Option<Arc<dyn TokenCache>>,
	refresher: Option<Arc<dyn TokenRefresher>>,
	recovery: Option<Arc<dyn TokenRecovery>>,
	expiry_hook: Option<Arc<dyn ExpiryHook>>,
	unwrapper: Option<Arc<dyn ResponseUnwrapper>>,
}
impl SessionBuilder {
	/// Creates a builder with every collaborator left at its default.
	pub fn new(config: SessionConfig) -> Self {
		Self {
			config,
			transport: None,
			token_cache: None,
			refresher: None,
			recovery: None,
			expiry_hook: None,
			unwrapper: None,
		}
	}

	/// Uses `transport` for API calls and, unless overridden, token exchanges.
	pub fn transport(mut self, transport: Arc<dyn ApiTransport>) -> Self {
		self.transport = Some(transport);

		self
	}

	/// Overrides the persisted token cache.
	pub fn token_cache(mut self, cache: Arc<dyn TokenCache>) -> Self {
		self.token_cache = Some(cache);

		self
	}

	/// Overrides the token exchange.
	pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
		self.refresher = Some(refresher);

		self
	}

	/// Installs a recovery hook tried when every refresh candidate fails.
	pub fn recovery(mut self, recovery: Arc<dyn TokenRecovery>) -> Self {
		self.recovery = Some(recovery);

		self
	}

	/// Installs the hook run when a request signature expires.
	pub fn expiry_hook(mut self, hook: Arc<dyn ExpiryHook>) -> Self {
		self.expiry_hook = Some(hook);

		self
	}

	/// Overrides the envelope unwrapper.
	pub fn unwrapper(mut self, unwrapper: Arc<dyn ResponseUnwrapper>) -> Self {
		self.unwrapper = Some(unwrapper);

		self
	}

	/// Validates the configuration, loads tokens, and opens the session.
	pub async fn build(self) -> Result<Session> {
		let config = self.config;

		config.validate()?;

		let transport = match self.transport {
			Some(transport) => transport,
			None => default_transport(&config)?,
		};
		let cache: Arc<dyn TokenCache> = match (self.token_cache, &config.token_cache_dir) {
			(Some(cache), _) => cache,
			(None, Some(dir)) => Arc::new(FileTokenCache::open(dir)?),
			(None, None) => Arc::new(MemoryTokenCache::default()),
		};
		let refresher: Arc<dyn TokenRefresher> = match self.refresher {
			Some(refresher) => refresher,
			None => Arc::new(EndpointRefresher::new(
				transport.clone(),
				&config.base_url,
				config.client_id.clone(),
				config.client_secret.clone(),
			)?),
		};
		let mut tokens = TokenStore::new(config.cache_key(), cache, refresher);

		if let Some(recovery) = self.recovery {
			tokens = tokens.with_recovery(recovery);
		}

		tokens.bootstrap(config.tokens.clone(), config.tokens_updated_at).await;

		let tokens = Arc::new(tokens);
		let unwrapper = self
			.unwrapper
			.unwrap_or_else(|| Arc::new(EnvelopeUnwrapper::new(config.envelope_keys.iter().cloned())));
		let executor = RequestExecutor::new(config.base_url.clone(), transport, tokens.clone())
			.with_policy(config.retry.clone())
			.with_unwrapper(unwrapper)
			.with_expiry_hook(self.expiry_hook.unwrap_or_else(|| Arc::new(NoopExpiryHook)));
		let scheduler = BatchScheduler::new(config.batch.clone());
		let pagination = PaginationAggregator::new(config.pagination.clone());

		tracing::info!(
			base_url = %config.base_url,
			customer_id = %config.customer_id,
			has_tokens = tokens.current().is_some(),
			"Session opened."
		);

		Ok(Session(Arc::new(SessionInner {
			config,
			executor,
			tokens,
			scheduler,
			pagination,
			verified: AtomicBool::new(false),
		})))
	}
}
impl Debug for SessionBuilder {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SessionBuilder")
			.field("config", &self.config)
			.field("custom_transport", &self.transport.is_some())
			.field("custom_cache", &self.token_cache.is_some())
			.finish_non_exhaustive()
	}
}

#[cfg(feature = "reqwest")]
fn default_transport(config: &SessionConfig) -> Result<Arc<dyn ApiTransport>> {
	Ok(Arc::new(crate::http::ReqwestTransport::new(config.transport_settings())))
}

#[cfg(not(feature = "reqwest"))]
fn default_transport(_: &SessionConfig) -> Result<Arc<dyn ApiTransport>> {
	Err(crate::error::ConfigError::Missing { field: "transport" }.into())
}
