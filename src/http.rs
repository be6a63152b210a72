//! Transport primitives for API calls.
//!
//! [`ApiTransport`] is the session's only dependency on an HTTP stack. It moves a fully
//! resolved [`HttpRequest`] over the wire and hands back an [`HttpResponse`] or a
//! classified [`TransportFailure`]; retry, decoding, and rate-limit accounting stay in the
//! executor. [`ReqwestTransport`] is the default implementation.

// self
use crate::{_prelude::*, request::Method};

/// Boxed future returned by [`ApiTransport::send`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<HttpResponse, TransportFailure>> + 'a + Send>>;

/// Abstraction over HTTP transports able to execute API calls.
///
/// Implementations must be `Send + Sync + 'static` so one transport can be shared by every
/// clone of a session. The returned futures must be `Send` so batches can be driven from
/// multi-threaded runtimes.
pub trait ApiTransport
where
	Self: 'static + Send + Sync,
{
	/// Sends `request` and returns the raw response.
	fn send(&self, request: HttpRequest) -> TransportFuture<'_>;

	/// Drops any pooled connection state so the next call starts fresh.
	///
	/// The executor calls this after a transport-level failure before retrying.
	fn reset(&self) {}
}

/// Fully resolved outbound request.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
	/// HTTP verb.
	pub method: Method,
	/// Absolute URL including the query string.
	pub url: Url,
	/// Final header set, later entries override earlier ones of the same name.
	pub headers: Vec<(String, String)>,
	/// Encoded body.
	pub body: Option<Vec<u8>>,
}
impl HttpRequest {
	/// Case-insensitive header lookup returning the last matching value.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.iter().rev().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
	}
}

/// Raw response captured from the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
	/// HTTP status code.
	pub status: u16,
	/// Reason phrase (`OK`, `Too Many Requests`, ...).
	pub reason: String,
	/// Response headers.
	pub headers: Vec<(String, String)>,
	/// Undecoded body bytes.
	pub body: Vec<u8>,
}
impl HttpResponse {
	/// Creates a response with the canonical reason phrase for `status`.
	pub fn new(status: u16, body: Vec<u8>) -> Self {
		Self { status, reason: canonical_reason(status).into(), headers: Vec::new(), body }
	}

	/// Appends a header.
	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));

		self
	}

	/// Case-insensitive header lookup.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
	}

	/// Whether the status is in the 2xx range.
	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}

	/// Whether the content type announces JSON.
	pub fn is_json(&self) -> bool {
		self.header("content-type").is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
	}
}

/// Category of a transport-level failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportErrorKind {
	/// Connection could not be established or was reset.
	Connect,
	/// The transport gave up waiting.
	Timeout,
	/// The body was truncated or did not match its declared length.
	Body,
	/// The request could not be built or sent.
	Request,
	/// Anything else reported by the HTTP stack.
	Other,
}
impl TransportErrorKind {
	/// Stable label used as the response reason.
	pub const fn as_str(self) -> &'static str {
		match self {
			TransportErrorKind::Connect => "ConnectError",
			TransportErrorKind::Timeout => "TimeoutError",
			TransportErrorKind::Body => "ContentLengthError",
			TransportErrorKind::Request => "RequestError",
			TransportErrorKind::Other => "TransportError",
		}
	}
}
impl Display for TransportErrorKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Transport failure captured instead of a response.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("{kind}: {message}")]
pub struct TransportFailure {
	/// Failure category.
	pub kind: TransportErrorKind,
	/// Underlying error rendered as text.
	pub message: String,
}
impl TransportFailure {
	/// Creates a failure of `kind`.
	pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
		Self { kind, message: message.into() }
	}
}

/// Settings applied when the reqwest client is (re)built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
	/// Per-request timeout.
	pub timeout: Option<Duration>,
	/// `User-Agent` header.
	pub user_agent: String,
	/// Whether TLS certificates are verified.
	pub verify_tls: bool,
}
impl Default for TransportSettings {
	fn default() -> Self {
		Self {
			timeout: None,
			user_agent: concat!("central-session/", env!("CARGO_PKG_VERSION")).into(),
			verify_tls: true,
		}
	}
}

/// Lazily built reqwest client that is discarded after transport failures.
#[cfg(feature = "reqwest")]
#[derive(Debug, Default)]
pub struct ReqwestTransport {
	settings: TransportSettings,
	client: Mutex<Option<ReqwestClient>>,
}
#[cfg(feature = "reqwest")]
impl ReqwestTransport {
	/// Creates a transport; the underlying client is built on first use.
	pub fn new(settings: TransportSettings) -> Self {
		Self { settings, client: Mutex::new(None) }
	}

	/// Wraps an existing client. It is still replaced by a fresh one after a reset.
	pub fn with_client(settings: TransportSettings, client: ReqwestClient) -> Self {
		Self { settings, client: Mutex::new(Some(client)) }
	}

	fn client(&self) -> Result<ReqwestClient, TransportFailure> {
		let mut slot = self.client.lock();

		if let Some(client) = slot.as_ref() {
			return Ok(client.clone());
		}

		let mut builder = ReqwestClient::builder()
			.user_agent(&self.settings.user_agent)
			.danger_accept_invalid_certs(!self.settings.verify_tls);

		if let Some(timeout) = self.settings.timeout {
			builder = builder.timeout(timeout);
		}

		let client = builder
			.build()
			.map_err(|e| TransportFailure::new(TransportErrorKind::Request, e.to_string()))?;

		*slot = Some(client.clone());

		Ok(client)
	}
}
#[cfg(feature = "reqwest")]
impl ApiTransport for ReqwestTransport {
	fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			let client = self.client()?;
			let method = match request.method {
				Method::Get => reqwest::Method::GET,
				Method::Post => reqwest::Method::POST,
				Method::Put => reqwest::Method::PUT,
				Method::Patch => reqwest::Method::PATCH,
				Method::Delete => reqwest::Method::DELETE,
			};
			let mut builder = client.request(method, request.url);

			for (name, value) in &request.headers {
				builder = builder.header(name.as_str(), value.as_str());
			}
			if let Some(body) = request.body {
				builder = builder.body(body);
			}

			let response = builder.send().await.map_err(map_reqwest_error)?;
			let status = response.status();
			let headers = response
				.headers()
				.iter()
				.map(|(name, value)| {
					(name.as_str().to_owned(), value.to_str().unwrap_or_default().to_owned())
				})
				.collect();
			let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

			Ok(HttpResponse {
				status: status.as_u16(),
				reason: status.canonical_reason().unwrap_or_default().to_owned(),
				headers,
				body,
			})
		})
	}

	fn reset(&self) {
		*self.client.lock() = None;
	}
}

#[cfg(feature = "reqwest")]
fn map_reqwest_error(e: ReqwestError) -> TransportFailure {
	let kind = if e.is_timeout() {
		TransportErrorKind::Timeout
	} else if e.is_connect() {
		TransportErrorKind::Connect
	} else if e.is_body() || e.is_decode() {
		TransportErrorKind::Body
	} else if e.is_request() || e.is_builder() {
		TransportErrorKind::Request
	} else {
		TransportErrorKind::Other
	};

	TransportFailure::new(kind, e.to_string())
}

fn canonical_reason(status: u16) -> &'static str {
	match status {
		200 => "OK",
		201 => "Created",
		202 => "Accepted",
		204 => "No Content",
		400 => "Bad Request",
		401 => "Unauthorized",
		403 => "Forbidden",
		404 => "Not Found",
		429 => "Too Many Requests",
		500 => "Internal Server Error",
		502 => "Bad Gateway",
		503 => "Service Unavailable",
		504 => "Gateway Timeout",
		_ => "",
	}
}

#[cfg(test)]
mod tests {
	// std
	#[cfg(feature = "reqwest")]
	use std::{
		io::{Read, Write},
		net::TcpListener,
		thread,
	};
	// crates.io
	#[cfg(feature = "reqwest")]
	use httpmock::{Method::GET, MockServer};
	// self
	use super::*;

	#[cfg(feature = "reqwest")]
	fn get(url: &str) -> HttpRequest {
		HttpRequest {
			method: Method::Get,
			url: Url::parse(url).expect("Test URL should parse."),
			headers: Vec::new(),
			body: None,
		}
	}

	#[cfg(feature = "reqwest")]
	fn insecure(timeout: Option<Duration>) -> ReqwestTransport {
		ReqwestTransport::new(TransportSettings { timeout, verify_tls: false, ..Default::default() })
	}

	#[test]
	fn header_lookup_is_case_insensitive() {
		let response = HttpResponse::new(429, Vec::new())
			.with_header("Content-Type", "application/json; charset=utf-8")
			.with_header("X-RateLimit-Remaining-second", "0");

		assert_eq!(response.reason, "Too Many Requests");
		assert_eq!(response.header("x-ratelimit-remaining-second"), Some("0"));
		assert!(response.is_json());
		assert!(!response.is_success());
	}

	#[test]
	fn failure_renders_kind_and_message() {
		let failure = TransportFailure::new(TransportErrorKind::Body, "expected 120 bytes");

		assert_eq!(failure.to_string(), "ContentLengthError: expected 120 bytes");
	}

	#[cfg(feature = "reqwest")]
	#[tokio::test]
	async fn refused_connection_is_a_connect_error() {
		let failure = insecure(None)
			.send(get("http://127.0.0.1:1/monitoring/v2/aps"))
			.await
			.expect_err("Nothing listens on port 1.");

		assert_eq!(failure.kind, TransportErrorKind::Connect);
	}

	#[cfg(feature = "reqwest")]
	#[tokio::test]
	async fn slow_server_is_a_timeout() {
		let server = MockServer::start_async().await;
		let slow = server
			.mock_async(|when, then| {
				when.method(GET).path("/slow");
				then.status(200).delay(Duration::from_secs(2)).body("late");
			})
			.await;
		let failure = insecure(Some(Duration::from_millis(100)))
			.send(get(&server.url("/slow")))
			.await
			.expect_err("The request should time out.");

		slow.assert_async().await;

		assert_eq!(failure.kind, TransportErrorKind::Timeout);
		assert_eq!(failure.kind.as_str(), "TimeoutError");
	}

	#[cfg(feature = "reqwest")]
	#[tokio::test]
	async fn truncated_body_is_a_content_length_error() {
		let listener = TcpListener::bind("127.0.0.1:0").expect("Loopback listener should bind.");
		let addr = listener.local_addr().expect("Listener should have an address.");
		let server = thread::spawn(move || {
			let (mut stream, _) = listener.accept().expect("Client should connect.");
			let mut request = Vec::new();
			let mut buf = [0; 1024];

			while !request.windows(4).any(|w| w == b"\r\n\r\n") {
				let n = stream.read(&mut buf).expect("Request should be readable.");

				if n == 0 {
					break;
				}

				request.extend_from_slice(&buf[..n]);
			}

			stream
				.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 120\r\n\r\nshort")
				.expect("Response head should be writable.");
		});
		let failure = insecure(None)
			.send(get(&format!("http://{addr}/aps")))
			.await
			.expect_err("The body ends before its announced length.");

		server.join().expect("Server thread should finish.");

		assert_eq!(failure.kind, TransportErrorKind::Body);
		assert_eq!(failure.kind.as_str(), "ContentLengthError");
	}
}
