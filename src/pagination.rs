//! Stitching paginated result sets into one [`Response`].
//!
//! Two conventions are in use. Offset endpoints take `offset`/`limit` and usually report a
//! `total`; once the first page reveals it, the remaining pages are fanned out as one
//! batch. Marker endpoints return an opaque `marker` that must be echoed back, so their
//! pages are fetched strictly one after another.

// self
use crate::{
	_prelude::*,
	batch::{BatchScheduler, DeferredRequest, Dispatcher},
	obs::{self, CallKind, CallOutcome, CallSpan},
	request::Request,
	response::{PaginationReport, Response},
};

/// Per-fetch options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
	/// Stop once this many records were merged and truncate to exactly this many.
	pub count: Option<usize>,
}
impl FetchOptions {
	/// Caps the number of records fetched.
	pub fn with_count(count: usize) -> Self {
		Self { count: Some(count) }
	}
}

/// Pagination conventions and limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
	/// Path fragments identifying marker-paginated endpoints.
	pub marker_paths: Vec<String>,
	/// Path suffixes whose reachable window is limited to [`PaginationConfig::cap`] records.
	pub capped_paths: Vec<String>,
	/// Reachable window of capped endpoints.
	pub cap: usize,
	/// Page size assumed for fan-out when the request has no `limit`.
	pub default_limit: usize,
	/// Replaces every `limit` query parameter, to exercise paging with small pages.
	pub debug_limit: Option<usize>,
}
impl Default for PaginationConfig {
	fn default() -> Self {
		Self {
			marker_paths: vec!["/api/routing/".into()],
			capped_paths: vec!["/monitoring/v2/events".into()],
			cap: 10_000,
			default_limit: 100,
			debug_limit: None,
		}
	}
}

/// Addressing scheme of a paginated endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageScheme {
	/// `offset`/`limit` query parameters.
	Offset,
	/// Opaque `marker` cursor.
	Marker,
}

/// Drives paginated fetches through a [`Dispatcher`].
#[derive(Clone, Debug, Default)]
pub struct PaginationAggregator {
	config: PaginationConfig,
}
impl PaginationAggregator {
	/// Creates an aggregator.
	pub fn new(config: PaginationConfig) -> Self {
		Self { config }
	}

	/// Scheme used for `request`.
	pub fn scheme(&self, request: &Request) -> PageScheme {
		if request.query.contains_key("marker")
			|| self.config.marker_paths.iter().any(|p| request.path.contains(p.as_str()))
		{
			PageScheme::Marker
		} else {
			PageScheme::Offset
		}
	}

	/// Fetches every page of `request` and merges them.
	pub async fn drive<D>(
		&self,
		dispatcher: &D,
		scheduler: &BatchScheduler,
		request: Request,
		options: FetchOptions,
	) -> Response
	where
		D: ?Sized + Dispatcher,
	{
		const KIND: CallKind = CallKind::Pagination;

		let span = CallSpan::new(KIND, "drive");

		obs::record_call_outcome(KIND, CallOutcome::Attempt);

		let request = self.apply_debug_limit(request);
		let response = span
			.instrument(async move {
				match self.scheme(&request) {
					PageScheme::Marker => self.drive_marker(dispatcher, request, options).await,
					PageScheme::Offset =>
						self.drive_offset(dispatcher, scheduler, request, options).await,
				}
			})
			.await;

		obs::record_call_outcome(KIND, CallOutcome::from_ok(response.ok));

		response
	}

	fn apply_debug_limit(&self, request: Request) -> Request {
		match (self.config.debug_limit, request.query_value("limit")) {
			(Some(debug_limit), Some(limit)) => {
				tracing::info!(
					from = limit,
					to = debug_limit,
					"Paging limit overridden by configuration."
				);

				request.query("limit", debug_limit)
			},
			_ => request,
		}
	}

	fn is_capped(&self, path: &str) -> bool {
		self.config.capped_paths.iter().any(|suffix| path.ends_with(suffix.as_str()))
	}

	async fn drive_offset<D>(
		&self,
		dispatcher: &D,
		scheduler: &BatchScheduler,
		request: Request,
		options: FetchOptions,
	) -> Response
	where
		D: ?Sized + Dispatcher,
	{
		let first = dispatcher.dispatch(DeferredRequest::Call(request.clone())).await;

		if !first.ok {
			return first;
		}

		let limit = request.query_usize("limit");
		let offset = request.query_usize("offset").unwrap_or(0);
		let capped = self.is_capped(&request.path);
		let reported_total = first.reported_total();
		let mut merged = first;
		let mut failed_pages = Vec::new();
		let page_limit = limit.unwrap_or(self.config.default_limit);

		match reported_total {
			Some(total) if merged.len().saturating_add(page_limit) < total => {
				let limit = page_limit.max(1);
				let mut end = total;

				if let Some(count) = options.count {
					end = end.min(offset.saturating_add(count));
				}
				if capped {
					end = end.min(self.config.cap);
				}

				let pages = (offset.saturating_add(merged.len())..end)
					.step_by(limit)
					.map(|page_offset| {
						DeferredRequest::Call(
							request
								.with_query("offset", page_offset)
								.with_query("limit", limit.min(end - page_offset)),
						)
					})
					.collect::<Vec<_>>();

				tracing::debug!(pages = pages.len(), total, limit, "Fanning out remaining pages.");

				let mut first_failure = None;
				let mut succeeded = 0;

				for page in scheduler.run(dispatcher, pages, true).await {
					if page.ok {
						succeeded += 1;
						merged.append(page);
					} else {
						failed_pages.push(page.request.path_and_query());
						first_failure.get_or_insert(page);
					}
				}

				if let Some(mut failure) = first_failure {
					if succeeded == 0 {
						failure.pagination = Some(PaginationReport {
							reported_total,
							received: merged.len(),
							failed_pages,
						});

						return failure;
					}

					tracing::error!(
						failed = failed_pages.len(),
						paths = ?failed_pages,
						"Some pages failed, returning partial results."
					);
				}
			},
			_ => {
				let Some(limit) = limit else {
					return merged;
				};
				let mut last_len = merged.len();
				let mut next_offset = offset.saturating_add(last_len);
				let mut expected = limit;

				loop {
					if last_len < expected || last_len == 0 {
						break;
					}
					let reached = offset.saturating_add(merged.len());

					if options.count.is_some_and(|count| merged.len() >= count)
						|| reported_total.is_some_and(|total| reached >= total)
					{
						break;
					}

					expected = options.count.map_or(limit, |count| limit.min(count - merged.len()));

					let page = dispatcher
						.dispatch(DeferredRequest::Call(
							request.with_query("offset", next_offset).with_query("limit", expected),
						))
						.await;

					if !page.ok {
						return page;
					}

					last_len = page.len();
					next_offset = next_offset.saturating_add(last_len);
					merged.append(page);
				}
			},
		}

		self.finish(merged, options, reported_total, failed_pages, capped)
	}

	async fn drive_marker<D>(&self, dispatcher: &D, request: Request, options: FetchOptions) -> Response
	where
		D: ?Sized + Dispatcher,
	{
		let first = dispatcher.dispatch(DeferredRequest::Call(request.clone())).await;

		if !first.ok {
			return first;
		}

		let mut marker = marker_of(&first.raw);
		let mut merged = first;

		while let Some(next) = marker.take() {
			if options.count.is_some_and(|count| merged.len() >= count) {
				break;
			}

			let page = dispatcher
				.dispatch(DeferredRequest::Call(request.with_query("marker", &next)))
				.await;

			if !page.ok {
				return page;
			}

			marker = marker_of(&page.raw).filter(|m| *m != next);
			merged.append(page);
		}

		if let Value::Object(raw) = &mut merged.raw {
			raw.remove("marker");
		}

		self.finish(merged, options, None, Vec::new(), false)
	}

	fn finish(
		&self,
		mut merged: Response,
		options: FetchOptions,
		reported_total: Option<usize>,
		failed_pages: Vec<String>,
		capped: bool,
	) -> Response {
		if let Some(count) = options.count {
			merged.truncate(count);
		}

		let received = merged.len();
		let short = options.count.is_none()
			&& failed_pages.is_empty()
			&& reported_total.is_some_and(|total| {
				received < if capped { total.min(self.config.cap) } else { total }
			});

		if short {
			tracing::warn!(
				reported_total = ?reported_total,
				received,
				"Merged record count is below the reported total."
			);
		}
		if short || !failed_pages.is_empty() {
			merged.pagination = Some(PaginationReport { reported_total, received, failed_pages });
		}

		merged
	}
}

fn marker_of(raw: &Value) -> Option<String> {
	match raw.get("marker")? {
		Value::Null => None,
		Value::String(s) if s.is_empty() => None,
		Value::String(s) => Some(s.clone()),
		other => Some(other.to_string()),
	}
}
