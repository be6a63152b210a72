//! Session configuration, its builder, and file loading.

// std
use std::{
	fs,
	net::IpAddr,
	path::{Path, PathBuf},
};
// crates.io
use url::Host;
// self
use crate::{
	_prelude::*,
	auth::{ClientId, CustomerId, TokenPair, TokenSecret},
	batch::BatchConfig,
	error::ConfigError,
	http::TransportSettings,
	pagination::PaginationConfig,
	response::ENVELOPE_KEYS,
	retry::RetryPolicy,
	store::CacheKey,
};

/// Everything needed to open a [`Session`](crate::session::Session).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
	/// API gateway root, for example `https://apigw-prod2.central.arubanetworks.com/`.
	pub base_url: Url,
	/// Customer the API client belongs to.
	pub customer_id: CustomerId,
	/// API client identifier.
	pub client_id: ClientId,
	/// API client secret.
	pub client_secret: TokenSecret,
	/// Token pair supplied with the configuration; used when the cache is older or empty.
	#[serde(default)]
	pub tokens: Option<TokenPair>,
	/// When the configured tokens were last edited; set from the file mtime on load.
	#[serde(skip)]
	pub tokens_updated_at: Option<OffsetDateTime>,
	/// Directory for the persisted token cache; in-memory only when unset.
	#[serde(default)]
	pub token_cache_dir: Option<PathBuf>,
	/// `User-Agent` header.
	#[serde(default = "default_user_agent")]
	pub user_agent: String,
	/// Per-request transport timeout.
	#[serde(default, with = "option_duration_ms")]
	pub timeout: Option<Duration>,
	/// Whether TLS certificates are verified.
	#[serde(default = "default_verify_tls")]
	pub verify_tls: bool,
	/// Retry budget.
	#[serde(default)]
	pub retry: RetryPolicy,
	/// Batch chunking and pacing.
	#[serde(default)]
	pub batch: BatchConfig,
	/// Pagination conventions.
	#[serde(default)]
	pub pagination: PaginationConfig,
	/// Envelope keys stripped from response bodies.
	#[serde(default = "default_envelope_keys")]
	pub envelope_keys: Vec<String>,
}
impl SessionConfig {
	/// Starts a builder for the API rooted at `base_url`.
	pub fn builder(base_url: Url) -> SessionConfigBuilder {
		SessionConfigBuilder::new(base_url)
	}

	/// Loads and validates a JSON configuration file.
	///
	/// Parsing errors carry the path of the offending field.
	pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let display = path.display().to_string();
		let bytes =
			fs::read(path).map_err(|source| ConfigError::Read { path: display.clone(), source })?;
		let mut deserializer = serde_json::Deserializer::from_slice(&bytes);
		let mut config: Self = serde_path_to_error::deserialize(&mut deserializer)
			.map_err(|source| ConfigError::Parse { path: display, source })?;

		if config.tokens.is_some() {
			config.tokens_updated_at =
				fs::metadata(path).and_then(|m| m.modified()).ok().map(OffsetDateTime::from);
		}

		config.validate()?;

		Ok(config)
	}

	/// Checks invariants that serde cannot express.
	pub fn validate(&self) -> Result<(), ConfigError> {
		validate_base_url(&self.base_url)?;

		if self.batch.chunk_size == 0 {
			return Err(ConfigError::ZeroChunkSize);
		}
		if self.retry.max_attempts == 0 {
			return Err(ConfigError::ZeroAttempts);
		}

		Ok(())
	}

	/// Token cache slot for this customer/client pair.
	pub fn cache_key(&self) -> CacheKey {
		CacheKey::new(self.customer_id.clone(), self.client_id.clone())
	}

	/// Settings for the HTTP transport.
	pub fn transport_settings(&self) -> TransportSettings {
		TransportSettings {
			timeout: self.timeout,
			user_agent: self.user_agent.clone(),
			verify_tls: self.verify_tls,
		}
	}
}

/// Builder for [`SessionConfig`] values.
#[derive(Debug)]
pub struct SessionConfigBuilder {
	base_url: Url,
	customer_id: Option<String>,
	client_id: Option<String>,
	client_secret: Option<String>,
	tokens: Option<TokenPair>,
	tokens_updated_at: Option<OffsetDateTime>,
	token_cache_dir: Option<PathBuf>,
	user_agent: String,
	timeout: Option<Duration>,
	verify_tls: bool,
	retry: RetryPolicy,
	batch: BatchConfig,
	pagination: PaginationConfig,
	envelope_keys: Vec<String>,
}
impl SessionConfigBuilder {
	/// Creates a builder with default policies.
	pub fn new(base_url: Url) -> Self {
		Self {
			base_url,
			customer_id: None,
			client_id: None,
			client_secret: None,
			tokens: None,
			tokens_updated_at: None,
			token_cache_dir: None,
			user_agent: default_user_agent(),
			timeout: None,
			verify_tls: true,
			retry: RetryPolicy::default(),
			batch: BatchConfig::default(),
			pagination: PaginationConfig::default(),
			envelope_keys: default_envelope_keys(),
		}
	}

	/// Sets the customer identifier.
	pub fn customer_id(mut self, id: impl Into<String>) -> Self {
		self.customer_id = Some(id.into());

		self
	}

	/// Sets the API client identifier.
	pub fn client_id(mut self, id: impl Into<String>) -> Self {
		self.client_id = Some(id.into());

		self
	}

	/// Sets the API client secret.
	pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
		self.client_secret = Some(secret.into());

		self
	}

	/// Supplies a token pair.
	pub fn tokens(mut self, pair: TokenPair) -> Self {
		self.tokens = Some(pair);

		self
	}

	/// Records when the supplied token pair was issued.
	pub fn tokens_updated_at(mut self, at: OffsetDateTime) -> Self {
		self.tokens_updated_at = Some(at);

		self
	}

	/// Persists tokens under `dir`.
	pub fn token_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.token_cache_dir = Some(dir.into());

		self
	}

	/// Overrides the `User-Agent` header.
	pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = user_agent.into();

		self
	}

	/// Sets the transport timeout.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);

		self
	}

	/// Enables or disables TLS verification.
	pub fn verify_tls(mut self, verify: bool) -> Self {
		self.verify_tls = verify;

		self
	}

	/// Overrides the retry policy.
	pub fn retry(mut self, policy: RetryPolicy) -> Self {
		self.retry = policy;

		self
	}

	/// Overrides batch chunking.
	pub fn batch(mut self, batch: BatchConfig) -> Self {
		self.batch = batch;

		self
	}

	/// Overrides only the pause between batch chunks.
	pub fn chunk_pause(mut self, pause: Duration) -> Self {
		self.batch.chunk_pause = pause;

		self
	}

	/// Overrides pagination conventions.
	pub fn pagination(mut self, pagination: PaginationConfig) -> Self {
		self.pagination = pagination;

		self
	}

	/// Replaces the envelope key list.
	pub fn envelope_keys<I, S>(mut self, keys: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.envelope_keys = keys.into_iter().map(Into::into).collect();

		self
	}

	/// Consumes the builder and validates the resulting configuration.
	pub fn build(self) -> Result<SessionConfig, ConfigError> {
		let customer_id =
			CustomerId::new(self.customer_id.ok_or(ConfigError::Missing { field: "customer_id" })?)?;
		let client_id =
			ClientId::new(self.client_id.ok_or(ConfigError::Missing { field: "client_id" })?)?;
		let client_secret = self
			.client_secret
			.filter(|secret| !secret.is_empty())
			.ok_or(ConfigError::Missing { field: "client_secret" })?;
		let config = SessionConfig {
			base_url: self.base_url,
			customer_id,
			client_id,
			client_secret: TokenSecret::new(client_secret),
			tokens: self.tokens,
			tokens_updated_at: self.tokens_updated_at,
			token_cache_dir: self.token_cache_dir,
			user_agent: self.user_agent,
			timeout: self.timeout,
			verify_tls: self.verify_tls,
			retry: self.retry,
			batch: self.batch,
			pagination: self.pagination,
			envelope_keys: self.envelope_keys,
		};

		config.validate()?;

		Ok(config)
	}
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
	// crates.io
	use serde::{Deserializer, Serializer};
	// self
	use crate::_prelude::*;

	/// Serializes `duration` as milliseconds.
	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
	}

	/// Deserializes milliseconds into a [`Duration`].
	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}

/// Serde adapter storing an optional [`Duration`] as whole milliseconds.
pub mod option_duration_ms {
	// crates.io
	use serde::{Deserializer, Serializer};
	// self
	use crate::_prelude::*;

	/// Serializes `duration` as milliseconds or `null`.
	pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		match duration {
			Some(duration) => super::duration_ms::serialize(duration, serializer),
			None => serializer.serialize_none(),
		}
	}

	/// Deserializes optional milliseconds into a [`Duration`].
	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
	where
		D: Deserializer<'de>,
	{
		Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
	}
}

fn validate_base_url(url: &Url) -> Result<(), ConfigError> {
	if url.query().is_some() || url.fragment().is_some() {
		return Err(ConfigError::BaseUrlHasQuery { url: url.to_string() });
	}

	let loopback = match url.host() {
		Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
		Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
		Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
		None => false,
	};

	if url.scheme() == "https" || (loopback && url.scheme() == "http") {
		Ok(())
	} else {
		Err(ConfigError::InsecureBaseUrl { url: url.to_string() })
	}
}

fn default_user_agent() -> String {
	TransportSettings::default().user_agent
}

fn default_verify_tls() -> bool {
	true
}

fn default_envelope_keys() -> Vec<String> {
	ENVELOPE_KEYS.iter().map(|key| (*key).to_owned()).collect()
}

#[cfg(test)]
mod tests {
	// std
	use std::{env, process};
	// self
	use super::*;

	fn base(url: &str) -> Url {
		Url::parse(url).expect("Fixture URL should parse.")
	}

	fn builder(url: &str) -> SessionConfigBuilder {
		SessionConfig::builder(base(url)).customer_id("cust").client_id("cli").client_secret("s")
	}

	#[test]
	fn builder_applies_defaults() {
		let config = builder("https://apigw.example.com/").build().expect("Config should build.");

		assert_eq!(config.retry.max_attempts, 2);
		assert_eq!(config.batch.chunk_size, 6);
		assert_eq!(config.batch.chunk_pause, Duration::from_secs(1));
		assert_eq!(config.cache_key().file_name(), "tok_cust_cli.json");
		assert!(config.envelope_keys.iter().any(|k| k == "devices"));
	}

	#[test]
	fn plain_http_is_only_allowed_on_loopback() {
		assert!(builder("http://127.0.0.1:8080/").build().is_ok());
		assert!(builder("http://localhost/").build().is_ok());
		assert!(matches!(
			builder("http://apigw.example.com/").build(),
			Err(ConfigError::InsecureBaseUrl { .. })
		));
		assert!(matches!(
			builder("https://apigw.example.com/?x=1").build(),
			Err(ConfigError::BaseUrlHasQuery { .. })
		));
	}

	#[test]
	fn missing_and_invalid_settings_are_rejected() {
		assert!(matches!(
			SessionConfig::builder(base("https://a.example.com/")).client_id("c").build(),
			Err(ConfigError::Missing { field: "customer_id" })
		));
		assert!(matches!(
			builder("https://a.example.com/").client_secret("").build(),
			Err(ConfigError::Missing { field: "client_secret" })
		));
		assert!(matches!(
			builder("https://a.example.com/").customer_id("a/b").build(),
			Err(ConfigError::Identifier(_))
		));
		assert!(matches!(
			builder("https://a.example.com/")
				.batch(BatchConfig { chunk_size: 0, ..Default::default() })
				.build(),
			Err(ConfigError::ZeroChunkSize)
		));
	}

	#[test]
	fn json_file_loads_with_millisecond_durations() {
		let path = env::temp_dir().join(format!("central_session_config_{}.json", process::id()));

		fs::write(
			&path,
			r#"{
				"base_url": "https://apigw.example.com/",
				"customer_id": "cust",
				"client_id": "cli",
				"client_secret": "s",
				"tokens": { "access_token": "a", "refresh_token": "r" },
				"timeout": 30000,
				"batch": { "chunk_pause": 500 },
				"retry": { "rate_limit": { "max_retries": null } }
			}"#,
		)
		.expect("Failed to write config fixture.");

		let config = SessionConfig::from_json_file(&path).expect("Config file should load.");

		fs::remove_file(&path).expect("Failed to remove config fixture.");

		assert_eq!(config.timeout, Some(Duration::from_secs(30)));
		assert_eq!(config.batch.chunk_pause, Duration::from_millis(500));
		assert_eq!(config.batch.chunk_size, 6);
		assert_eq!(config.retry.rate_limit.max_retries, None);
		assert_eq!(config.tokens, Some(TokenPair::new("a", "r")));
		assert!(config.tokens_updated_at.is_some());
	}

	#[test]
	fn json_parse_errors_point_at_the_field() {
		let path = env::temp_dir().join(format!("central_session_bad_config_{}.json", process::id()));

		fs::write(
			&path,
			r#"{"base_url":"https://a.example.com/","customer_id":"c","client_id":"k","client_secret":"s","batch":{"chunk_size":"six"}}"#,
		)
		.expect("Failed to write config fixture.");

		let err = SessionConfig::from_json_file(&path).expect_err("Config should fail to parse.");

		fs::remove_file(&path).expect("Failed to remove config fixture.");

		match err {
			ConfigError::Parse { source, .. } => assert_eq!(source.path().to_string(), "batch.chunk_size"),
			other => panic!("Unexpected error: {other:?}."),
		}
	}
}
