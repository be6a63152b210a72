//! Single-call execution with retry, token refresh, and rate-limit accounting.
//!
//! [`RequestExecutor::execute`] never fails: every outcome, including transport errors and
//! cancellation, comes back as a [`Response`]. Between attempts the executor applies the
//! corrective action chosen by [`RetryPolicy::decide`].

// std
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
// self
use crate::{
	_prelude::*,
	auth::{ExpiryHook, NoopExpiryHook, TokenStore},
	http::{ApiTransport, HttpRequest, TransportErrorKind},
	obs::{self, CallKind, CallOutcome, CallSpan},
	rate_limit::{RateLimitEvent, RateLimitLog, RateLimitTracker},
	request::{Body, Request},
	response::{EnvelopeUnwrapper, ErrorKind, Response, ResponseUnwrapper},
	retry::{RetryDecision, RetryPolicy, RetryState},
};

/// Executes requests against one API base URL.
pub struct RequestExecutor {
	base_url: Url,
	transport: Arc<dyn ApiTransport>,
	tokens: Arc<TokenStore>,
	expiry_hook: Arc<dyn ExpiryHook>,
	unwrapper: Arc<dyn ResponseUnwrapper>,
	policy: RetryPolicy,
	rate_limits: RateLimitTracker,
	log: RateLimitLog,
	calls: AtomicU64,
	cancelled: AtomicBool,
}
impl RequestExecutor {
	/// Creates an executor with the default retry policy and envelope unwrapper.
	pub fn new(base_url: Url, transport: Arc<dyn ApiTransport>, tokens: Arc<TokenStore>) -> Self {
		Self {
			base_url,
			transport,
			tokens,
			expiry_hook: Arc::new(NoopExpiryHook),
			unwrapper: Arc::new(EnvelopeUnwrapper::default()),
			policy: RetryPolicy::default(),
			rate_limits: RateLimitTracker::default(),
			log: RateLimitLog::new(),
			calls: AtomicU64::new(0),
			cancelled: AtomicBool::new(false),
		}
	}

	/// Overrides the retry policy.
	pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
		self.policy = policy;

		self
	}

	/// Overrides the envelope unwrapper.
	pub fn with_unwrapper(mut self, unwrapper: Arc<dyn ResponseUnwrapper>) -> Self {
		self.unwrapper = unwrapper;

		self
	}

	/// Installs the hook run when a request signature expires.
	pub fn with_expiry_hook(mut self, hook: Arc<dyn ExpiryHook>) -> Self {
		self.expiry_hook = hook;

		self
	}

	/// Base URL requests are resolved against.
	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	/// Attempts sent over the wire so far, retries included.
	pub fn request_count(&self) -> u64 {
		self.calls.load(Ordering::Relaxed)
	}

	/// Latest quota observed.
	pub fn rate_limits(&self) -> &RateLimitTracker {
		&self.rate_limits
	}

	/// Attempt timeline.
	pub fn rate_limit_log(&self) -> &RateLimitLog {
		&self.log
	}

	/// Stops every pending and future call; they return a `Cancelled` failure.
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}

	/// Whether [`RequestExecutor::cancel`] was called.
	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	/// Executes `request`, retrying per the policy.
	pub async fn execute(&self, request: Request) -> Response {
		const KIND: CallKind = CallKind::Request;

		let span = CallSpan::new(KIND, "execute");

		obs::record_call_outcome(KIND, CallOutcome::Attempt);

		let response = span.instrument(self.run(request)).await;

		obs::record_call_outcome(KIND, CallOutcome::from_ok(response.ok));

		response
	}

	async fn run(&self, request: Request) -> Response {
		let target = request.path_and_query();
		let url = match request.url(&self.base_url) {
			Ok(url) => url,
			Err(e) => {
				return Response::failure(
					request,
					ErrorKind::Transport(TransportErrorKind::Request),
					e.to_string(),
				);
			},
		};
		let (body, content_type) = match encode_body(request.body.as_ref()) {
			Ok(encoded) => encoded,
			Err(e) => {
				return Response::failure(
					request,
					ErrorKind::Transport(TransportErrorKind::Request),
					format!("Request body could not be encoded: {e}"),
				);
			},
		};
		let mut state = RetryState::default();
		let mut try_number = 0_u32;

		loop {
			if self.is_cancelled() {
				return Response::failure(request, ErrorKind::Cancelled, "Session was cancelled.");
			}

			state.begin_attempt();
			try_number += 1;
			self.calls.fetch_add(1, Ordering::Relaxed);
			self.log.record(request.method, &target, try_number, RateLimitEvent::Attempt, None);
			tracing::debug!(method = %request.method, target = %target, try_number, "Sending request.");

			let bearer = self.tokens.bearer();
			let http_request = HttpRequest {
				method: request.method,
				url: url.clone(),
				headers: merge_headers(content_type, bearer.as_deref(), &request.headers),
				body: body.clone(),
			};
			let started = Instant::now();
			let response = match self.transport.send(http_request).await {
				Ok(http) => {
					let response = Response::from_http(
						request.clone(),
						http,
						started.elapsed(),
						self.unwrapper.as_ref(),
					);

					self.rate_limits.update(response.rate_limit);

					response
				},
				Err(failure) =>
					Response::transport_failure(request.clone(), failure, started.elapsed()),
			};

			self.log_outcome(&response, &target, try_number);

			match self.policy.decide(&mut state, &response) {
				RetryDecision::Finish => {
					if response.ok {
						tracing::debug!(target = %target, status = ?response.status, "Request succeeded.");
					} else {
						tracing::error!(
							target = %target,
							status = ?response.status,
							reason = %response.reason,
							"Request failed."
						);
					}

					return response;
				},
				RetryDecision::Retry => {
					tracing::warn!(target = %target, status = ?response.status, "Server error, retrying.");
				},
				RetryDecision::ResetTransport => {
					tracing::warn!(
						target = %target,
						reason = %response.reason,
						"Transport failure, reconnecting before retry."
					);
					self.transport.reset();
				},
				RetryDecision::RefreshToken => {
					tracing::warn!(target = %target, "Access token rejected, refreshing.");

					if !self.tokens.refresh_after_rejection(bearer.as_deref()).await {
						return response;
					}
				},
				RetryDecision::RunExpiryHook => {
					tracing::warn!(target = %target, "Request signature expired, running expiry hook.");
					self.expiry_hook.on_signature_expired().await;
				},
				RetryDecision::Backoff(delay) => {
					tracing::warn!(
						target = %target,
						hits = state.rate_limit_hits,
						delay_ms = delay.as_millis() as u64,
						"Rate limit hit, backing off."
					);

					if self.is_cancelled() {
						return Response::failure(request, ErrorKind::Cancelled, "Session was cancelled.");
					}
					if !delay.is_zero() {
						tokio::time::sleep(delay).await;
					}
				},
			}
		}
	}

	fn log_outcome(&self, response: &Response, target: &str, try_number: u32) {
		let event = match response.error_kind() {
			None if response.rate_limit.near_limit => RateLimitEvent::NearLimit,
			None => RateLimitEvent::Ok,
			Some(ErrorKind::RateLimited) => RateLimitEvent::RateLimitHit,
			Some(_) => RateLimitEvent::Failed,
		};

		self.log.record(
			response.request.method,
			target,
			try_number,
			event,
			response.rate_limit.remaining_per_second,
		);
	}
}
impl Debug for RequestExecutor {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RequestExecutor")
			.field("base_url", &self.base_url.as_str())
			.field("policy", &self.policy)
			.field("calls", &self.request_count())
			.field("cancelled", &self.is_cancelled())
			.finish_non_exhaustive()
	}
}

fn encode_body(body: Option<&Body>) -> Result<(Option<Vec<u8>>, &'static str), serde_json::Error> {
	const JSON: &str = "application/json";

	match body {
		None => Ok((None, JSON)),
		Some(Body::Json(value)) => Ok((Some(serde_json::to_vec(value)?), JSON)),
		Some(Body::Form(pairs)) => {
			let encoded = url::form_urlencoded::Serializer::new(String::new())
				.extend_pairs(pairs.iter())
				.finish();

			Ok((Some(encoded.into_bytes()), "application/x-www-form-urlencoded"))
		},
	}
}

fn merge_headers(
	content_type: &str,
	bearer: Option<&str>,
	overrides: &[(String, String)],
) -> Vec<(String, String)> {
	let mut headers = vec![
		("Content-Type".to_owned(), content_type.to_owned()),
		("Accept".to_owned(), "application/json".to_owned()),
	];

	if let Some(bearer) = bearer {
		headers.push(("Authorization".to_owned(), bearer.to_owned()));
	}

	for (name, value) in overrides {
		headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
		headers.push((name.clone(), value.clone()));
	}

	headers
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::AtomicUsize;
	// self
	use super::*;
	use crate::{
		_preludet::*,
		auth::{HookFuture, RefreshFuture, TokenPair, TokenRefresher},
		http::TransportFailure,
		retry::RateLimitBackoff,
		store::MemoryTokenCache,
	};

	/// Refresher handing out `access-N`/`refresh-N` pairs.
	#[derive(Default)]
	struct CountingRefresher(AtomicUsize);
	impl TokenRefresher for CountingRefresher {
		fn refresh<'a>(&'a self, _: &'a TokenPair) -> RefreshFuture<'a> {
			let n = self.0.fetch_add(1, Ordering::SeqCst) + 2;

			Box::pin(async move { Ok(TokenPair::new(format!("access-{n}"), format!("refresh-{n}"))) })
		}
	}

	#[derive(Default)]
	struct CountingHook(AtomicUsize);
	impl ExpiryHook for CountingHook {
		fn on_signature_expired(&self) -> HookFuture<'_> {
			self.0.fetch_add(1, Ordering::SeqCst);

			Box::pin(async {})
		}
	}

	fn executor(transport: Arc<ScriptedTransport>) -> (RequestExecutor, Arc<TokenStore>) {
		let tokens = Arc::new(TokenStore::new(
			cache_key(),
			Arc::new(MemoryTokenCache::default()),
			Arc::new(CountingRefresher::default()),
		));

		tokens.install_pairs(Some(token_pair("access-1", "refresh-1")), None);

		let base = Url::parse("https://apigw.example.com/").expect("Base URL should parse.");

		(RequestExecutor::new(base, transport, tokens.clone()), tokens)
	}

	fn throttled() -> ScriptedOutcome {
		Ok(json_response(429, serde_json::json!({ "message": "API rate limit exceeded" })))
	}

	fn no_jitter(max_retries: Option<u32>) -> RetryPolicy {
		RetryPolicy {
			rate_limit: RateLimitBackoff { max_retries, jitter: false, ..Default::default() },
			..Default::default()
		}
	}

	#[tokio::test]
	async fn transient_server_error_is_retried_once() {
		let transport = Arc::new(ScriptedTransport::new([
			Ok(json_response(500, serde_json::json!({ "message": "boom" }))),
			Ok(json_response(200, serde_json::json!({ "devices": [{ "serial": "CN1" }] }))),
		]));
		let (executor, _) = executor(transport.clone());
		let response = executor.execute(Request::get("/monitoring/v1/switches")).await;

		assert!(response.ok);
		assert_eq!(response.output, serde_json::json!([{ "serial": "CN1" }]));
		assert_eq!(transport.calls(), 2);
		assert_eq!(executor.rate_limit_log().attempts_for("/monitoring/v1/switches"), 2);
	}

	#[tokio::test]
	async fn server_error_budget_is_two_attempts() {
		let transport = Arc::new(ScriptedTransport::new([
			Ok(json_response(503, serde_json::json!({}))),
			Ok(json_response(503, serde_json::json!({}))),
		]));
		let (executor, _) = executor(transport.clone());
		let response = executor.execute(Request::get("/a")).await;

		assert_eq!(response.status, Some(503));
		assert_eq!(response.error_kind(), Some(ErrorKind::ServerError));
		assert_eq!(transport.calls(), 2);
	}

	#[tokio::test]
	async fn client_errors_are_not_retried() {
		let transport =
			Arc::new(ScriptedTransport::new([Ok(json_response(400, serde_json::json!({})))]));
		let (executor, _) = executor(transport.clone());

		assert!(!executor.execute(Request::get("/a")).await.ok);
		assert_eq!(transport.calls(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn throttling_backs_off_until_the_call_goes_through() {
		let transport = Arc::new(ScriptedTransport::new([throttled(), throttled(), throttled()]));
		let (executor, _) = executor(transport.clone());
		let executor = executor.with_policy(no_jitter(None));
		let started = tokio::time::Instant::now();
		let response = executor.execute(Request::get("/a")).await;

		assert!(response.ok);
		assert_eq!(transport.calls(), 4);
		// 250ms + 500ms + 1s
		assert_eq!(started.elapsed(), Duration::from_millis(1_750));

		let hits = executor
			.rate_limit_log()
			.entries()
			.iter()
			.filter(|e| e.event == RateLimitEvent::RateLimitHit)
			.count();

		assert_eq!(hits, 3);
	}

	#[tokio::test(start_paused = true)]
	async fn bounded_throttling_gives_up_with_the_429() {
		let transport = Arc::new(ScriptedTransport::new([throttled(), throttled(), throttled()]));
		let (executor, _) = executor(transport.clone());
		let executor = executor.with_policy(no_jitter(Some(2)));
		let response = executor.execute(Request::get("/a")).await;

		assert_eq!(response.status, Some(429));
		assert_eq!(response.error_kind(), Some(ErrorKind::RateLimited));
		assert_eq!(transport.calls(), 3);
	}

	#[tokio::test]
	async fn invalid_token_refreshes_and_retries_with_the_new_bearer() {
		let transport = Arc::new(ScriptedTransport::new([Ok(json_response(
			401,
			serde_json::json!({ "error": "invalid_token", "error_description": "expired" }),
		))]));
		let (executor, tokens) = executor(transport.clone());
		let response = executor.execute(Request::get("/a")).await;
		let requests = transport.requests();

		assert!(response.ok);
		assert_eq!(requests.len(), 2);
		assert_eq!(requests[0].header("Authorization"), Some("Bearer access-1"));
		assert_eq!(requests[1].header("Authorization"), Some("Bearer access-2"));
		assert_eq!(tokens.metrics().successes(), 1);
	}

	#[tokio::test]
	async fn transport_failure_resets_the_connection() {
		let transport = Arc::new(ScriptedTransport::new([Err(TransportFailure::new(
			TransportErrorKind::Connect,
			"connection reset by peer",
		))]));
		let (executor, _) = executor(transport.clone());
		let response = executor.execute(Request::get("/a")).await;

		assert!(response.ok);
		assert_eq!(transport.calls(), 2);
		assert_eq!(transport.resets(), 1);
	}

	#[tokio::test]
	async fn repeated_transport_failure_is_reported_without_status() {
		let failure = || Err(TransportFailure::new(TransportErrorKind::Timeout, "timed out"));
		let transport = Arc::new(ScriptedTransport::new([failure(), failure()]));
		let (executor, _) = executor(transport.clone());
		let response = executor.execute(Request::get("/a")).await;

		assert_eq!(response.status, None);
		assert_eq!(response.error_kind(), Some(ErrorKind::Transport(TransportErrorKind::Timeout)));
		assert_eq!(response.reason, "TimeoutError");
	}

	#[tokio::test]
	async fn expired_signature_runs_the_hook() {
		let transport = Arc::new(ScriptedTransport::new([Ok(json_response(
			401,
			serde_json::json!({ "errorCode": "HPE_GL_ERROR_UNAUTHORIZED", "message": "Signature has expired" }),
		))]));
		let hook = Arc::new(CountingHook::default());
		let (executor, _) = executor(transport.clone());
		let executor = executor.with_expiry_hook(hook.clone());

		assert!(executor.execute(Request::get("/a")).await.ok);
		assert_eq!(hook.0.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn cancelled_executor_sends_nothing() {
		let transport = Arc::new(ScriptedTransport::default());
		let (executor, _) = executor(transport.clone());

		executor.cancel();

		let response = executor.execute(Request::get("/a")).await;

		assert_eq!(response.error_kind(), Some(ErrorKind::Cancelled));
		assert_eq!(transport.calls(), 0);
		assert_eq!(executor.request_count(), 0);
	}

	#[test]
	fn request_headers_override_defaults_case_insensitively() {
		let headers = merge_headers(
			"application/json",
			Some("Bearer abc"),
			&[("accept".into(), "text/csv".into())],
		);

		assert_eq!(
			headers,
			vec![
				("Content-Type".to_owned(), "application/json".to_owned()),
				("Authorization".to_owned(), "Bearer abc".to_owned()),
				("accept".to_owned(), "text/csv".to_owned()),
			]
		);
	}

	#[test]
	fn form_bodies_are_url_encoded() {
		let body = Body::Form(vec![("name".into(), "a b".into()), ("x".into(), "1&2".into())]);
		let (bytes, content_type) = encode_body(Some(&body)).expect("Form body should encode.");

		assert_eq!(bytes.as_deref(), Some(b"name=a+b&x=1%262".as_slice()));
		assert_eq!(content_type, "application/x-www-form-urlencoded");
	}
}
