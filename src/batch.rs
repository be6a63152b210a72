//! Chunked, paced fan-out of independent requests.
//!
//! [`BatchScheduler::run`] issues deferred requests in chunks that are awaited concurrently
//! on the calling task. Every chunk but the last is stretched to at least
//! [`BatchConfig::chunk_pause`] so a burst stays under the per-second quota. While the
//! session is still unverified the first request runs alone, which lets a token refresh
//! happen once instead of failing a whole chunk.

// crates.io
use futures::future;
// self
use crate::{
	_prelude::*,
	config::duration_ms,
	obs::{self, CallKind, CallOutcome, CallSpan},
	pagination::FetchOptions,
	rate_limit::RateLimitSnapshot,
	request::Request,
	response::Response,
	session::Session,
};

/// Boxed future returned by [`Dispatcher::dispatch`].
pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Response> + 'a + Send>>;

/// Arbitrary async operation over a session, batched like any other request.
pub type BoxedOperation = Box<dyn FnOnce(Session) -> DispatchFuture<'static> + Send>;

/// Unit of work accepted by [`BatchScheduler::run`].
pub enum DeferredRequest {
	/// One executor call.
	Call(Request),
	/// A full paginated fetch.
	Fetch(Request, FetchOptions),
	/// Any other session operation.
	Operation(BoxedOperation),
}
impl DeferredRequest {
	/// Wraps an async closure over the session.
	pub fn operation<F, Fut>(op: F) -> Self
	where
		F: 'static + Send + FnOnce(Session) -> Fut,
		Fut: 'static + Send + Future<Output = Response>,
	{
		Self::Operation(Box::new(move |session| Box::pin(op(session))))
	}

	/// Short description for logs.
	pub fn describe(&self) -> String {
		match self {
			DeferredRequest::Call(request) => format!("{} {}", request.method, request.path_and_query()),
			DeferredRequest::Fetch(request, _) =>
				format!("{} {} (paged)", request.method, request.path_and_query()),
			DeferredRequest::Operation(_) => "operation".into(),
		}
	}
}
impl Debug for DeferredRequest {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			DeferredRequest::Call(request) => f.debug_tuple("Call").field(request).finish(),
			DeferredRequest::Fetch(request, options) =>
				f.debug_tuple("Fetch").field(request).field(options).finish(),
			DeferredRequest::Operation(_) => f.write_str("Operation(..)"),
		}
	}
}
impl From<Request> for DeferredRequest {
	fn from(request: Request) -> Self {
		Self::Call(request)
	}
}

/// Executes deferred requests on behalf of the scheduler.
pub trait Dispatcher
where
	Self: Send + Sync,
{
	/// Runs one deferred request to completion.
	fn dispatch(&self, request: DeferredRequest) -> DispatchFuture<'_>;

	/// Whether a call has already succeeded on this dispatcher.
	fn is_verified(&self) -> bool;
}

/// Chunking and pacing knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
	/// Requests awaited concurrently per chunk.
	pub chunk_size: usize,
	/// Minimum wall time of every chunk except the last.
	#[serde(with = "duration_ms")]
	pub chunk_pause: Duration,
}
impl Default for BatchConfig {
	fn default() -> Self {
		Self { chunk_size: 6, chunk_pause: Duration::from_secs(1) }
	}
}

/// Runs batches according to a [`BatchConfig`].
#[derive(Clone, Debug, Default)]
pub struct BatchScheduler {
	config: BatchConfig,
}
impl BatchScheduler {
	/// Creates a scheduler.
	pub fn new(config: BatchConfig) -> Self {
		Self { config }
	}

	/// Active configuration.
	pub fn config(&self) -> &BatchConfig {
		&self.config
	}

	/// Runs `requests` and returns one response per request, in input order.
	///
	/// When the dispatcher is unverified and the first request fails, the batch stops there
	/// unless `continue_on_fail` is set.
	pub async fn run<D>(
		&self,
		dispatcher: &D,
		requests: Vec<DeferredRequest>,
		continue_on_fail: bool,
	) -> Vec<Response>
	where
		D: ?Sized + Dispatcher,
	{
		const KIND: CallKind = CallKind::Batch;

		let span = CallSpan::new(KIND, "run");

		obs::record_call_outcome(KIND, CallOutcome::Attempt);

		let responses =
			span.instrument(self.run_chunks(dispatcher, requests, continue_on_fail)).await;

		obs::record_call_outcome(KIND, CallOutcome::from_ok(responses.iter().all(|r| r.ok)));

		responses
	}

	async fn run_chunks<D>(
		&self,
		dispatcher: &D,
		requests: Vec<DeferredRequest>,
		continue_on_fail: bool,
	) -> Vec<Response>
	where
		D: ?Sized + Dispatcher,
	{
		let started = Instant::now();
		let total = requests.len();
		let mut responses = Vec::with_capacity(total);
		let mut pending = requests;

		if !dispatcher.is_verified() && !pending.is_empty() {
			let first = pending.remove(0);

			tracing::debug!(request = %first.describe(), "Running first request alone.");

			let response = dispatcher.dispatch(first).await;
			let failed = !response.ok;

			responses.push(response);

			if failed && !continue_on_fail {
				tracing::warn!(skipped = pending.len(), "First batch request failed, skipping the rest.");

				return responses;
			}
		}

		let chunk_size = self.config.chunk_size.max(1);

		while !pending.is_empty() {
			let rest = pending.split_off(chunk_size.min(pending.len()));
			let chunk = std::mem::replace(&mut pending, rest);
			let calls = future::join_all(chunk.into_iter().map(|request| dispatcher.dispatch(request)));

			if pending.is_empty() || self.config.chunk_pause.is_zero() {
				responses.extend(calls.await);
			} else {
				let (chunk_responses, ()) =
					future::join(calls, tokio::time::sleep(self.config.chunk_pause)).await;

				responses.extend(chunk_responses);
			}
		}

		let remaining = responses
			.iter()
			.map(|r| r.rate_limit.remaining_per_second)
			.collect::<Vec<_>>();

		let failed = responses
			.iter()
			.filter(|r| !r.ok)
			.map(|r| r.request.path_and_query())
			.collect::<Vec<_>>();

		tracing::info!(
			calls = total,
			failed = failed.len(),
			elapsed_ms = started.elapsed().as_millis() as u64,
			"Batch finished."
		);

		if !failed.is_empty() {
			tracing::error!(failed = failed.len(), paths = ?failed, "Some batch requests failed.");
		}

		tracing::debug!(
			?remaining,
			most_constrained = %RateLimitSnapshot::most_constrained(responses.iter().map(|r| r.rate_limit)),
			"Batch per-second quota."
		);

		responses
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicBool, Ordering};
	// self
	use super::*;
	use crate::{
		_preludet::LogCapture,
		http::HttpResponse,
		response::{ErrorKind, Passthrough},
	};

	struct RecordingDispatcher {
		started: Mutex<Vec<(String, tokio::time::Instant)>>,
		verified: AtomicBool,
		fail_paths: Vec<&'static str>,
	}
	impl RecordingDispatcher {
		fn new(fail_paths: Vec<&'static str>) -> Self {
			Self { started: Mutex::new(Vec::new()), verified: AtomicBool::new(false), fail_paths }
		}

		fn group_sizes(&self) -> Vec<usize> {
			let started = self.started.lock();
			let mut sizes: Vec<(tokio::time::Instant, usize)> = Vec::new();

			for (_, at) in started.iter() {
				match sizes.last_mut() {
					Some((last, n)) if *last == *at => *n += 1,
					_ => sizes.push((*at, 1)),
				}
			}

			sizes.into_iter().map(|(_, n)| n).collect()
		}
	}
	impl Dispatcher for RecordingDispatcher {
		fn dispatch(&self, request: DeferredRequest) -> DispatchFuture<'_> {
			Box::pin(async move {
				let DeferredRequest::Call(request) = request else {
					panic!("Only calls are batched in these tests.");
				};

				self.started.lock().push((request.path.clone(), tokio::time::Instant::now()));
				tokio::time::sleep(Duration::from_millis(10)).await;

				if self.fail_paths.contains(&request.path.as_str()) {
					Response::failure(request, ErrorKind::Client, "nope")
				} else {
					self.verified.store(true, Ordering::SeqCst);

					Response::from_http(
						request,
						HttpResponse::new(200, b"[]".to_vec()),
						Duration::from_millis(10),
						&Passthrough,
					)
				}
			})
		}

		fn is_verified(&self) -> bool {
			self.verified.load(Ordering::SeqCst)
		}
	}

	fn calls(n: usize) -> Vec<DeferredRequest> {
		(0..n).map(|i| DeferredRequest::Call(Request::get(format!("/r/{i}")))).collect()
	}

	#[tokio::test(start_paused = true)]
	async fn first_call_runs_alone_then_chunks_of_six() {
		let dispatcher = RecordingDispatcher::new(vec![]);
		let responses = BatchScheduler::default().run(&dispatcher, calls(13), false).await;

		assert_eq!(responses.len(), 13);
		assert_eq!(dispatcher.group_sizes(), vec![1, 6, 6]);

		let paths = responses.iter().map(|r| r.request.path.clone()).collect::<Vec<_>>();

		assert_eq!(paths, (0..13).map(|i| format!("/r/{i}")).collect::<Vec<_>>());
	}

	#[tokio::test(start_paused = true)]
	async fn chunks_are_paced_by_the_pause_unit() {
		let dispatcher = RecordingDispatcher::new(vec![]);

		dispatcher.verified.store(true, Ordering::SeqCst);

		let started = tokio::time::Instant::now();

		BatchScheduler::default().run(&dispatcher, calls(13), false).await;

		let starts = dispatcher.started.lock().iter().map(|(_, at)| *at - started).collect::<Vec<_>>();

		assert_eq!(dispatcher.group_sizes(), vec![6, 6, 1]);
		assert_eq!(starts[6], Duration::from_secs(1));
		assert_eq!(starts[12], Duration::from_secs(2));
	}

	#[tokio::test(start_paused = true)]
	async fn failed_first_call_short_circuits() {
		let dispatcher = RecordingDispatcher::new(vec!["/r/0"]);
		let responses = BatchScheduler::default().run(&dispatcher, calls(5), false).await;

		assert_eq!(responses.len(), 1);
		assert!(!responses[0].ok);
		assert_eq!(dispatcher.started.lock().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn failed_first_call_continues_when_allowed() {
		let dispatcher = RecordingDispatcher::new(vec!["/r/0"]);
		let responses = BatchScheduler::default().run(&dispatcher, calls(5), true).await;

		assert_eq!(responses.len(), 5);
		assert!(responses[1..].iter().all(|r| r.ok));
	}

	#[tokio::test(start_paused = true)]
	async fn failures_are_logged_with_their_paths() {
		let logs = LogCapture::install();
		let dispatcher = RecordingDispatcher::new(vec!["/r/2", "/r/4"]);

		dispatcher.verified.store(true, Ordering::SeqCst);

		let responses = BatchScheduler::default().run(&dispatcher, calls(5), true).await;
		let output = logs.output();

		assert_eq!(responses.iter().filter(|r| !r.ok).count(), 2);
		assert!(output.contains("Some batch requests failed."));
		assert!(output.contains("failed=2"));
		assert!(output.contains(r#"paths=["/r/2", "/r/4"]"#));
	}

	#[tokio::test]
	async fn empty_batch_returns_nothing() {
		let dispatcher = RecordingDispatcher::new(vec![]);

		assert!(BatchScheduler::default().run(&dispatcher, Vec::new(), false).await.is_empty());
	}
}
