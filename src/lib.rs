//! Request-execution core for a cloud network-management API client: a retrying executor,
//! rate-limit aware batching, pagination stitching, and bearer-token refresh behind one
//! [`Session`](session::Session) facade.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod obs;
pub mod pagination;
pub mod rate_limit;
pub mod request;
pub mod response;
pub mod retry;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::collections::VecDeque;
	// self
	use crate::{
		auth::{ClientId, CustomerId, TokenPair},
		config::SessionConfig,
		http::{ApiTransport, HttpRequest, HttpResponse, TransportFailure, TransportFuture},
		store::CacheKey,
	};

	/// Scripted outcome served by [`ScriptedTransport`].
	pub type ScriptedOutcome = std::result::Result<HttpResponse, TransportFailure>;

	/// Transport that replays a fixed script of outcomes and records every request it saw.
	///
	/// Once the script is exhausted the transport keeps answering with an empty `200 OK` JSON
	/// object.
	#[derive(Default)]
	pub struct ScriptedTransport {
		script: Mutex<VecDeque<ScriptedOutcome>>,
		seen: Mutex<Vec<HttpRequest>>,
		resets: Mutex<usize>,
	}
	impl ScriptedTransport {
		/// Builds a transport that replays `outcomes` in order.
		pub fn new(outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
			Self { script: Mutex::new(outcomes.into_iter().collect()), ..Default::default() }
		}

		/// Requests observed so far, in issue order.
		pub fn requests(&self) -> Vec<HttpRequest> {
			self.seen.lock().clone()
		}

		/// Number of requests observed so far.
		pub fn calls(&self) -> usize {
			self.seen.lock().len()
		}

		/// Number of times the executor asked for a fresh connection.
		pub fn resets(&self) -> usize {
			*self.resets.lock()
		}
	}
	impl ApiTransport for ScriptedTransport {
		fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
			self.seen.lock().push(request);

			let next = self.script.lock().pop_front();

			Box::pin(async move {
				next.unwrap_or_else(|| Ok(json_response(200, serde_json::json!({}))))
			})
		}

		fn reset(&self) {
			*self.resets.lock() += 1;
		}
	}

	/// Builds an HTTP response with a JSON body and generous rate-limit headers.
	pub fn json_response(status: u16, body: Value) -> HttpResponse {
		HttpResponse::new(status, body.to_string().into_bytes())
			.with_header("content-type", "application/json")
			.with_header("X-RateLimit-Remaining-second", "6")
			.with_header("X-RateLimit-Remaining-day", "4900")
	}

	/// Token pair fixture.
	pub fn token_pair(access: &str, refresh: &str) -> TokenPair {
		TokenPair::new(access, refresh)
	}

	/// Cache key fixture shared by tests.
	pub fn cache_key() -> CacheKey {
		CacheKey::new(
			CustomerId::new("customer-1").expect("Customer fixture should be valid."),
			ClientId::new("client-1").expect("Client fixture should be valid."),
		)
	}

	/// Formatted log output of the current thread, collected while the capture is alive.
	#[cfg(test)]
	pub struct LogCapture {
		buffer: Arc<Mutex<Vec<u8>>>,
		_guard: tracing::subscriber::DefaultGuard,
	}
	#[cfg(test)]
	impl LogCapture {
		/// Installs a thread-local subscriber that writes into memory.
		pub fn install() -> Self {
			let buffer = Arc::new(Mutex::new(Vec::new()));
			let sink = buffer.clone();
			let subscriber = tracing_subscriber::fmt()
				.with_ansi(false)
				.with_max_level(tracing::Level::DEBUG)
				.with_writer(move || LogSink(sink.clone()))
				.finish();

			Self { buffer, _guard: tracing::subscriber::set_default(subscriber) }
		}

		/// Everything logged so far.
		pub fn output(&self) -> String {
			String::from_utf8_lossy(&self.buffer.lock()).into_owned()
		}
	}

	#[cfg(test)]
	struct LogSink(Arc<Mutex<Vec<u8>>>);
	#[cfg(test)]
	impl std::io::Write for LogSink {
		fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
			self.0.lock().extend_from_slice(buf);

			Ok(buf.len())
		}

		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	/// Session configuration pointing at `base_url` with test credentials and no pacing delay.
	pub fn test_config(base_url: &str) -> SessionConfig {
		SessionConfig::builder(Url::parse(base_url).expect("Test base URL should parse."))
			.customer_id("customer-1")
			.client_id("client-1")
			.client_secret("secret-1")
			.tokens(token_pair("access-1", "refresh-1"))
			.chunk_pause(Duration::ZERO)
			.build()
			.expect("Test session configuration should be valid.")
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
		time::{Duration, Instant},
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use serde_json::Value;
	pub use thiserror::Error as ThisError;
	pub use time::OffsetDateTime;
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(all(test, feature = "reqwest"))] use {color_eyre as _, httpmock as _};
