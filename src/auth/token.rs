//! Bearer-token pairs and the redacting secret wrapper.

// self
use crate::_prelude::*;

/// Redacted token secret wrapper keeping sensitive material out of logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSecret(String);
impl TokenSecret {
	/// Wraps a new secret string.
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the inner token value. Callers must avoid logging this string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}
impl Debug for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("TokenSecret").field(&"<redacted>").finish()
	}
}
impl Display for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}

/// Access/refresh credential pair used for request authorization.
///
/// The serialized shape (`access_token` + `refresh_token`) is shared by the persisted token
/// cache, the configuration fallback, and the refresh endpoint's response. Unknown fields
/// such as `expires_in` or `token_type` are ignored on input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
	/// Bearer token sent with every API call.
	pub access_token: TokenSecret,
	/// Secret exchanged for a new pair.
	pub refresh_token: TokenSecret,
}
impl TokenPair {
	/// Creates a pair from raw strings.
	pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
		Self { access_token: TokenSecret::new(access), refresh_token: TokenSecret::new(refresh) }
	}

	/// Two pairs are interchangeable for refresh purposes when their refresh secrets match.
	pub fn same_refresh(&self, other: &Self) -> bool {
		self.refresh_token == other.refresh_token
	}

	/// Value for the `Authorization` header.
	pub fn bearer(&self) -> String {
		format!("Bearer {}", self.access_token.expose())
	}
}

/// Removes candidates whose refresh secret already appeared earlier in the list.
pub fn dedup_candidates(candidates: Vec<TokenPair>) -> Vec<TokenPair> {
	let mut unique: Vec<TokenPair> = Vec::with_capacity(candidates.len());

	for pair in candidates {
		if !unique.iter().any(|seen| seen.same_refresh(&pair)) {
			unique.push(pair);
		}
	}

	unique
}
