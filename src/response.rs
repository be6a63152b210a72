//! Normalized call results, failure classification, and envelope unwrapping.
//!
//! Every API call yields exactly one [`Response`], successful or not. Failures are data: the
//! executor never returns `Err`, it fills [`Response::error`] with a classified
//! [`ResponseError`] instead.

// self
use crate::{
	_prelude::*,
	http::{HttpResponse, TransportErrorKind, TransportFailure},
	rate_limit::RateLimitSnapshot,
	request::Request,
};

/// Envelope keys stripped by [`EnvelopeUnwrapper::default`], in lookup order.
pub const ENVELOPE_KEYS: &[&str] = &[
	"data",
	"gateways",
	"switches",
	"aps",
	"swarms",
	"devices",
	"mcs",
	"group",
	"clients",
	"sites",
	"labels",
	"neighbors",
	"audit_logs",
	"vlans",
	"result",
	"networks",
	"ports",
	"rogue_aps",
	"suspect_aps",
	"interfering_aps",
	"neighbor_aps",
	"events",
	"notifications",
	"settings",
	"items",
	"poe_details",
	"trails",
	"servers",
	"subscriptions",
	"portals",
	"visitors",
	"interfaces",
	"areas",
	"lsas",
	"commands",
	"stacks",
];

const MAX_ENVELOPE_KEYS: usize = 5;

/// Failure category attached to an unsuccessful [`Response`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
	/// No HTTP response was received.
	Transport(TransportErrorKind),
	/// HTTP 401 reporting `invalid_token`.
	InvalidToken,
	/// Gateway rejected the call because its signature expired.
	SignatureExpired,
	/// HTTP 5xx.
	ServerError,
	/// HTTP 429.
	RateLimited,
	/// Any other non-2xx status.
	Client,
	/// The session was cancelled before the call completed.
	Cancelled,
}
impl ErrorKind {
	/// Classifies an HTTP failure from its status and decoded body.
	pub fn classify(status: u16, raw: &Value) -> Self {
		match status {
			401 if body_mentions(raw, "invalid_token") => ErrorKind::InvalidToken,
			401 | 403 if signature_expired(raw) => ErrorKind::SignatureExpired,
			429 => ErrorKind::RateLimited,
			500..=599 => ErrorKind::ServerError,
			_ => ErrorKind::Client,
		}
	}

	/// Short label used in logs and metrics.
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorKind::Transport(kind) => kind.as_str(),
			ErrorKind::InvalidToken => "invalid_token",
			ErrorKind::SignatureExpired => "signature_expired",
			ErrorKind::ServerError => "server_error",
			ErrorKind::RateLimited => "rate_limited",
			ErrorKind::Client => "client_error",
			ErrorKind::Cancelled => "cancelled",
		}
	}
}
impl Display for ErrorKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Classified failure carried by a [`Response`].
#[derive(Clone, Debug, PartialEq, ThisError)]
#[error("{kind}: {message}")]
pub struct ResponseError {
	/// Failure category.
	pub kind: ErrorKind,
	/// Human-readable summary.
	pub message: String,
	/// Decoded error body, when one was received.
	pub detail: Option<Value>,
}
impl ResponseError {
	/// Creates an error without a body.
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self { kind, message: message.into(), detail: None }
	}
}

/// Outcome of a paginated fetch when it did not line up with the reported total.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationReport {
	/// `total` announced by the first page.
	pub reported_total: Option<usize>,
	/// Records actually merged.
	pub received: usize,
	/// `path?query` of pages that failed during fan-out.
	pub failed_pages: Vec<String>,
}
impl PaginationReport {
	/// Whether the merged set is known to be short of the announced total.
	pub fn is_short(&self) -> bool {
		self.reported_total.is_some_and(|total| self.received < total)
	}
}

/// Normalized result of one API call (or of a merged series of pages).
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
	/// HTTP status, `None` when no response was received.
	pub status: Option<u16>,
	/// Whether the call succeeded.
	pub ok: bool,
	/// Decoded body with the envelope stripped.
	pub output: Value,
	/// Decoded body as received.
	pub raw: Value,
	/// Classified failure, `None` iff `ok`.
	pub error: Option<ResponseError>,
	/// Reason phrase or transport error name.
	pub reason: String,
	/// Quota reported by the response headers.
	pub rate_limit: RateLimitSnapshot,
	/// Wall time spent, summed across merged pages.
	pub elapsed: Duration,
	/// Request that produced this response (the first page for merged responses).
	pub request: Request,
	/// Pagination discrepancy or partial-failure data.
	pub pagination: Option<PaginationReport>,
	/// Member path inside `raw` that `output` was unwrapped from, empty when the whole body is
	/// the payload.
	pub envelope: Vec<String>,
}
impl Response {
	/// Builds a response from a received HTTP message.
	pub fn from_http(
		request: Request,
		http: HttpResponse,
		elapsed: Duration,
		unwrapper: &dyn ResponseUnwrapper,
	) -> Self {
		let raw = decode_body(&http);
		let mut output = unwrapper.unwrap_envelope(&raw);
		let envelope = unwrapper.envelope_path(&raw);

		if let Some(rewritten) = error_description(&output) {
			output = Value::String(rewritten);
		}

		let ok = http.is_success();
		let error = (!ok).then(|| {
			let kind = ErrorKind::classify(http.status, &raw);
			let message = match &output {
				Value::String(s) if !s.is_empty() => s.clone(),
				Value::Null => http.reason.clone(),
				other => other.to_string(),
			};

			ResponseError { kind, message, detail: Some(raw.clone()) }
		});

		if !ok && is_empty(&output) {
			output = Value::String(http.reason.clone());
		}

		Self {
			status: Some(http.status),
			ok,
			output,
			raw,
			error,
			reason: http.reason.clone(),
			rate_limit: RateLimitSnapshot::from_response(&http),
			elapsed,
			request,
			pagination: None,
			envelope,
		}
	}

	/// Builds a failed response that never reached the server.
	pub fn failure(request: Request, kind: ErrorKind, message: impl Into<String>) -> Self {
		let message = message.into();
		let reason = match kind {
			ErrorKind::Transport(transport) => transport.as_str().to_owned(),
			other => other.as_str().to_owned(),
		};

		Self {
			status: None,
			ok: false,
			output: Value::String(message.clone()),
			raw: Value::Null,
			error: Some(ResponseError::new(kind, message)),
			reason,
			rate_limit: RateLimitSnapshot::default(),
			elapsed: Duration::ZERO,
			request,
			pagination: None,
			envelope: Vec::new(),
		}
	}

	/// Builds a failed response from a transport failure.
	pub fn transport_failure(request: Request, failure: TransportFailure, elapsed: Duration) -> Self {
		let mut response = Self::failure(request, ErrorKind::Transport(failure.kind), failure.message);

		response.elapsed = elapsed;

		response
	}

	/// Whether the call succeeded.
	pub fn is_ok(&self) -> bool {
		self.ok
	}

	/// Failure category, if the call failed.
	pub fn error_kind(&self) -> Option<ErrorKind> {
		self.error.as_ref().map(|e| e.kind)
	}

	/// Number of records in `output`: array length, object key count, 0 for `null`, else 1.
	pub fn len(&self) -> usize {
		value_len(&self.output)
	}

	/// Whether `output` holds no records.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// `raw.total` when the body announces one.
	pub fn reported_total(&self) -> Option<usize> {
		self.raw.get("total").and_then(Value::as_u64).and_then(|t| usize::try_from(t).ok())
	}

	/// Deserializes `output` into `T`.
	pub fn output_as<T>(&self) -> Result<T, serde_path_to_error::Error<serde_json::Error>>
	where
		T: for<'de> Deserialize<'de>,
	{
		serde_path_to_error::deserialize(&self.output)
	}

	/// Folds a later page into this response.
	///
	/// Arrays concatenate in order and objects take a shallow key union where later keys
	/// win. Raw bodies merge under the envelope member the output came from (or their first
	/// shared container member) and sum `count` when both sides report it. Elapsed time adds
	/// up and the tighter rate-limit snapshot is kept.
	pub fn append(&mut self, later: Response) {
		merge_output(&mut self.output, later.output);
		merge_raw(&mut self.raw, later.raw, &self.envelope);

		self.elapsed += later.elapsed;
		self.rate_limit = self.rate_limit.tighter(later.rate_limit);
	}

	/// Truncates array output (and the matching raw envelope list) to `count` records.
	pub fn truncate(&mut self, count: usize) {
		if let Value::Array(items) = &mut self.output {
			items.truncate(count);
		}
		if let Some(Value::Array(items)) = member_mut(&mut self.raw, &self.envelope) {
			items.truncate(count);
		}
	}
}

/// Strips the transport envelope from a decoded body.
pub trait ResponseUnwrapper
where
	Self: Send + Sync,
{
	/// Returns the payload the caller is interested in.
	fn unwrap_envelope(&self, raw: &Value) -> Value;

	/// Member path inside `raw` that [`ResponseUnwrapper::unwrap_envelope`] reads from.
	fn envelope_path(&self, raw: &Value) -> Vec<String> {
		let _ = raw;

		Vec::new()
	}
}

/// Default unwrapper removing one well-known wrapping key.
///
/// Bodies with more than five keys besides `cid` and `status_code` are treated as payloads
/// already. A `result` member is descended into first, then the body is unwrapped when
/// exactly one envelope key is present.
#[derive(Clone, Debug)]
pub struct EnvelopeUnwrapper {
	keys: Vec<String>,
}
impl EnvelopeUnwrapper {
	/// Uses a custom envelope key list.
	pub fn new<I, S>(keys: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self { keys: keys.into_iter().map(Into::into).collect() }
	}

	fn locate<'a>(&self, raw: &'a Value) -> (Vec<String>, &'a Value) {
		let Value::Object(map) = raw else {
			return (Vec::new(), raw);
		};

		if map.keys().filter(|k| *k != "cid" && *k != "status_code").count() > MAX_ENVELOPE_KEYS {
			return (Vec::new(), raw);
		}

		let (mut path, body) = match map.get("result") {
			Some(result) => (vec!["result".to_owned()], result),
			None => (Vec::new(), raw),
		};
		let Value::Object(body_map) = body else {
			return (path, body);
		};
		let present = self.keys.iter().filter(|key| body_map.contains_key(*key)).collect::<Vec<_>>();

		match present.as_slice() {
			[key] => {
				path.push((*key).clone());

				(path, &body_map[key.as_str()])
			},
			[] => (path, body),
			keys => {
				tracing::debug!(?keys, "More wrapping keys than expected, returning body unchanged.");

				(path, body)
			},
		}
	}
}
impl Default for EnvelopeUnwrapper {
	fn default() -> Self {
		Self::new(ENVELOPE_KEYS.iter().copied())
	}
}
impl ResponseUnwrapper for EnvelopeUnwrapper {
	fn unwrap_envelope(&self, raw: &Value) -> Value {
		self.locate(raw).1.clone()
	}

	fn envelope_path(&self, raw: &Value) -> Vec<String> {
		self.locate(raw).0
	}
}

/// Envelope unwrapper that returns bodies unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;
impl ResponseUnwrapper for Passthrough {
	fn unwrap_envelope(&self, raw: &Value) -> Value {
		raw.clone()
	}
}

fn decode_body(http: &HttpResponse) -> Value {
	if http.body.is_empty() {
		return Value::Null;
	}

	match serde_json::from_slice(&http.body) {
		Ok(value) => value,
		Err(e) => {
			if http.is_json() {
				tracing::debug!(error = %e, "Response announced JSON but failed to decode.");
			}

			Value::String(String::from_utf8_lossy(&http.body).into_owned())
		},
	}
}

fn error_description(output: &Value) -> Option<String> {
	let error = output.get("error")?;
	let description = output.get("error_description")?;
	let render = |v: &Value| v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string());

	Some(format!("{}: {}", render(error), render(description)))
}

fn body_mentions(raw: &Value, needle: &str) -> bool {
	match raw {
		Value::String(s) => s.contains(needle),
		Value::Null => false,
		other => other.to_string().contains(needle),
	}
}

fn signature_expired(raw: &Value) -> bool {
	let code = raw.get("errorCode").and_then(Value::as_str).unwrap_or_default();
	let message = raw.get("message").and_then(Value::as_str).unwrap_or_default();

	code.contains("HPE_GL_ERROR") && message.to_ascii_lowercase().contains("signature has expired")
}

fn is_empty(value: &Value) -> bool {
	match value {
		Value::Null => true,
		Value::String(s) => s.is_empty(),
		Value::Array(a) => a.is_empty(),
		Value::Object(o) => o.is_empty(),
		_ => false,
	}
}

fn value_len(value: &Value) -> usize {
	match value {
		Value::Array(a) => a.len(),
		Value::Object(o) => o.len(),
		Value::Null => 0,
		_ => 1,
	}
}

fn merge_output(into: &mut Value, later: Value) {
	match (into, later) {
		(Value::Array(a), Value::Array(b)) => a.extend(b),
		(Value::Object(a), Value::Object(b)) => a.extend(b),
		(slot, later) if slot.is_null() => *slot = later,
		(_, later) => tracing::debug!(
			kind = value_kind(&later),
			"Page output shape differs from the first page, skipping merge."
		),
	}
}

fn member_mut<'a>(value: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
	path.iter().try_fold(value, |value, key| value.get_mut(key.as_str()))
}

fn take_member(value: &mut Value, path: &[String]) -> Option<Value> {
	let (last, parents) = path.split_last()?;

	member_mut(value, parents)?.as_object_mut()?.remove(last)
}

fn merge_raw(into: &mut Value, mut later: Value, envelope: &[String]) {
	if !envelope.is_empty()
		&& into.is_object()
		&& let Some(page) = take_member(&mut later, envelope)
		&& let Some(slot) = member_mut(into, envelope)
	{
		merge_output(slot, page);
	}

	match (into, later) {
		(Value::Array(a), Value::Array(b)) => a.extend(b),
		(Value::Object(a), Value::Object(mut b)) => {
			let shared = envelope
				.is_empty()
				.then(|| {
					b.iter()
						.find(|(k, v)| (v.is_array() || v.is_object()) && a.contains_key(*k))
						.map(|(k, _)| k.clone())
				})
				.flatten();

			if let Some(key) = shared
				&& let (Some(slot), Some(page)) = (a.get_mut(&key), b.remove(&key))
			{
				merge_output(slot, page);
			}
			if let (Some(x), Some(y)) =
				(a.get("count").and_then(Value::as_u64), b.get("count").and_then(Value::as_u64))
			{
				a.insert("count".into(), Value::from(x.saturating_add(y)));
			}
			if let Some(marker) = b.remove("marker") {
				a.insert("marker".into(), marker);
			}
		},
		(slot, later) if slot.is_null() => *slot = later,
		_ => {},
	}
}

fn value_kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "bool",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
