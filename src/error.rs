//! Session-level error types for construction, configuration, token cache, and refresh
//! failures.
//!
//! Request execution never surfaces these across its boundary; per-call failures are
//! carried as [`ResponseError`](crate::response::ResponseError) values inside a
//! [`Response`](crate::response::Response).

// self
use crate::_prelude::*;

/// Session-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error exposed by fallible constructors and token maintenance.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Token cache failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Transport failure (DNS, TCP, TLS).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// The refresh endpoint rejected or garbled a token exchange.
	#[error(transparent)]
	Refresh(#[from] RefreshError),
}

/// Configuration and validation failures raised while building a session.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// Base URL must use HTTPS unless it targets a loopback host.
	#[error("The base URL must use HTTPS: {url}.")]
	InsecureBaseUrl {
		/// Offending URL.
		url: String,
	},
	/// Base URL cannot carry a query or fragment.
	#[error("The base URL must not carry a query string or fragment: {url}.")]
	BaseUrlHasQuery {
		/// Offending URL.
		url: String,
	},
	/// A path could not be joined onto the base URL.
	#[error("Path `{path}` cannot be joined onto the base URL.")]
	InvalidPath {
		/// Offending path.
		path: String,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Required credential or identifier is missing.
	#[error("Missing required setting `{field}`.")]
	Missing {
		/// Name of the missing setting.
		field: &'static str,
	},
	/// Identifier failed validation.
	#[error(transparent)]
	Identifier(#[from] crate::auth::IdentifierError),
	/// Batch chunk size must be positive.
	#[error("Batch chunk size must be at least 1.")]
	ZeroChunkSize,
	/// Retry policy must allow at least one attempt.
	#[error("Retry policy must allow at least one attempt.")]
	ZeroAttempts,
	/// Configuration file could not be read.
	#[error("Failed to read configuration file {path}.")]
	Read {
		/// File path.
		path: String,
		/// Underlying IO failure.
		#[source]
		source: std::io::Error,
	},
	/// Configuration file could not be parsed.
	#[error("Failed to parse configuration file {path}.")]
	Parse {
		/// File path.
		path: String,
		/// Structured parsing failure pointing at the offending field.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
}
/// Transport-level failures raised outside the executor.
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling {endpoint}.")]
	Network {
		/// Endpoint being called.
		endpoint: String,
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(
		endpoint: impl Into<String>,
		src: impl 'static + Send + Sync + std::error::Error,
	) -> Self {
		Self::Network { endpoint: endpoint.into(), source: Box::new(src) }
	}
}

/// Failures returned by the token refresh endpoint.
#[derive(Debug, ThisError)]
pub enum RefreshError {
	/// Refresh endpoint answered with a non-success status.
	#[error("Refresh endpoint rejected the token pair with status {status}: {message}.")]
	Rejected {
		/// HTTP status code.
		status: u16,
		/// Endpoint-supplied message or body preview.
		message: String,
	},
	/// Refresh endpoint answered with JSON that does not describe a token pair.
	#[error("Refresh endpoint returned a malformed token payload.")]
	Malformed {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn refresh_error_converts_into_session_error_with_message() {
		let err: Error =
			RefreshError::Rejected { status: 400, message: "invalid_grant".into() }.into();

		assert!(matches!(err, Error::Refresh(_)));
		assert!(err.to_string().contains("invalid_grant"));
	}

	#[test]
	fn config_error_keeps_field_name() {
		let err = ConfigError::Missing { field: "client_secret" };

		assert_eq!(err.to_string(), "Missing required setting `client_secret`.");
	}
}
