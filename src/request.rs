//! Immutable request descriptions.
//!
//! Endpoint wrappers are plain functions returning a [`Request`]; nothing here performs I/O.
//! The executor turns a request into an [`HttpRequest`](crate::http::HttpRequest) only at
//! dispatch time, so the same value can be logged, retried, paged, or queued in a batch.

// self
use crate::{_prelude::*, error::ConfigError};

/// HTTP verbs accepted by the API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
	/// `GET`
	Get,
	/// `POST`
	Post,
	/// `PUT`
	Put,
	/// `PATCH`
	Patch,
	/// `DELETE`
	Delete,
}
impl Method {
	/// Upper-case verb used on the wire.
	pub const fn as_str(self) -> &'static str {
		match self {
			Method::Get => "GET",
			Method::Post => "POST",
			Method::Put => "PUT",
			Method::Patch => "PATCH",
			Method::Delete => "DELETE",
		}
	}
}
impl Display for Method {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Request payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
	/// JSON document; `null` members are stripped on construction.
	Json(Value),
	/// `application/x-www-form-urlencoded` pairs.
	Form(Vec<(String, String)>),
}

/// One API call: method, path, query, body, and extra headers.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
	/// HTTP verb.
	pub method: Method,
	/// Path relative to the session base URL, or an absolute `http(s)://` URL.
	pub path: String,
	/// Query parameters; keys are unique.
	pub query: BTreeMap<String, String>,
	/// Optional payload.
	pub body: Option<Body>,
	/// Headers layered over the session defaults.
	pub headers: Vec<(String, String)>,
}
impl Request {
	/// Creates a request without query, body, or extra headers.
	pub fn new(method: Method, path: impl Into<String>) -> Self {
		Self {
			method,
			path: path.into(),
			query: BTreeMap::new(),
			body: None,
			headers: Vec::new(),
		}
	}

	/// `GET` request.
	pub fn get(path: impl Into<String>) -> Self {
		Self::new(Method::Get, path)
	}

	/// `POST` request.
	pub fn post(path: impl Into<String>) -> Self {
		Self::new(Method::Post, path)
	}

	/// `PUT` request.
	pub fn put(path: impl Into<String>) -> Self {
		Self::new(Method::Put, path)
	}

	/// `PATCH` request.
	pub fn patch(path: impl Into<String>) -> Self {
		Self::new(Method::Patch, path)
	}

	/// `DELETE` request.
	pub fn delete(path: impl Into<String>) -> Self {
		Self::new(Method::Delete, path)
	}

	/// Sets a query parameter, replacing any previous value.
	pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
		self.query.insert(key.into(), value.to_string());

		self
	}

	/// Sets a query parameter only when a value is present.
	pub fn query_opt<V>(self, key: impl Into<String>, value: Option<V>) -> Self
	where
		V: ToString,
	{
		match value {
			Some(value) => self.query(key, value),
			None => self,
		}
	}

	/// Attaches a JSON body with `null` members removed.
	pub fn json(mut self, body: Value) -> Self {
		self.body = Some(Body::Json(strip_nulls(body)));

		self
	}

	/// Attaches form-encoded data.
	pub fn form<I, K, V>(mut self, pairs: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		self.body =
			Some(Body::Form(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()));

		self
	}

	/// Adds a header that overrides the session default of the same name.
	pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));

		self
	}

	/// Returns a copy with `key` set to `value`.
	pub fn with_query(&self, key: &str, value: impl ToString) -> Self {
		self.clone().query(key, value)
	}

	/// Raw query value.
	pub fn query_value(&self, key: &str) -> Option<&str> {
		self.query.get(key).map(String::as_str)
	}

	/// Query value parsed as a non-negative integer.
	pub fn query_usize(&self, key: &str) -> Option<usize> {
		self.query_value(key).and_then(|value| value.parse().ok())
	}

	/// `path?query` rendering used in logs.
	pub fn path_and_query(&self) -> String {
		if self.query.is_empty() {
			return self.path.clone();
		}

		let query = self.query.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>();

		format!("{}?{}", self.path, query.join("&"))
	}

	/// Resolves the request against `base` into a full URL including the query string.
	pub fn url(&self, base: &Url) -> Result<Url, ConfigError> {
		let joined = if self.path.starts_with("http://") || self.path.starts_with("https://") {
			Url::parse(&self.path)
		} else {
			base.join(&self.path)
		};
		let mut url = joined
			.map_err(|source| ConfigError::InvalidPath { path: self.path.clone(), source })?;

		if !self.query.is_empty() {
			url.query_pairs_mut().extend_pairs(self.query.iter());
		}

		Ok(url)
	}
}

/// Removes `null` members from a JSON object, and nested objects that become empty after
/// their own `null` members are removed.
pub fn strip_nulls(body: Value) -> Value {
	match body {
		Value::Object(map) => Value::Object(
			map.into_iter()
				.filter_map(|(key, value)| match value {
					Value::Null => None,
					Value::Object(inner) => {
						let inner = inner
							.into_iter()
							.filter(|(_, v)| !v.is_null())
							.collect::<serde_json::Map<_, _>>();

						(!inner.is_empty()).then_some((key, Value::Object(inner)))
					},
					other => Some((key, other)),
				})
				.collect(),
		),
		other => other,
	}
}
