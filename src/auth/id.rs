//! Account identifiers that key the persisted token cache.

// std
use std::ops::Deref;
// self
use crate::_prelude::*;

macro_rules! def_id {
	($name:ident, $doc:literal, $kind:literal) => {
		#[doc = $doc]
		#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);
		impl $name {
			/// Creates a new identifier after validation.
			pub fn new(value: impl AsRef<str>) -> Result<Self, IdentifierError> {
				let view = value.as_ref();

				validate_view($kind, view)?;

				Ok(Self(view.to_owned()))
			}
		}
		impl Deref for $name {
			type Target = str;

			fn deref(&self) -> &Self::Target {
				&self.0
			}
		}
		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
		impl From<$name> for String {
			fn from(value: $name) -> Self {
				value.0
			}
		}
		impl TryFrom<String> for $name {
			type Error = IdentifierError;

			fn try_from(value: String) -> Result<Self, Self::Error> {
				validate_view($kind, &value)?;

				Ok(Self(value))
			}
		}
		impl Debug for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				write!(f, concat!($kind, "({})"), self.0)
			}
		}
		impl Display for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				f.write_str(&self.0)
			}
		}
		impl FromStr for $name {
			type Err = IdentifierError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s)
			}
		}
	};
}

const IDENTIFIER_MAX_LEN: usize = 128;

/// Error returned when identifier validation fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum IdentifierError {
	/// The identifier was empty.
	#[error("{kind} identifier cannot be empty.")]
	Empty {
		/// Kind of identifier (customer, client).
		kind: &'static str,
	},
	/// The identifier contains whitespace characters.
	#[error("{kind} identifier contains whitespace.")]
	ContainsWhitespace {
		/// Kind of identifier (customer, client).
		kind: &'static str,
	},
	/// The identifier contains characters that cannot appear in a cache file name.
	#[error("{kind} identifier contains the path character `{found}`.")]
	PathCharacter {
		/// Kind of identifier (customer, client).
		kind: &'static str,
		/// Offending character.
		found: char,
	},
	/// The identifier exceeded the allowed character count.
	#[error("{kind} identifier exceeds {max} characters.")]
	TooLong {
		/// Kind of identifier (customer, client).
		kind: &'static str,
		/// Maximum permitted character count.
		max: usize,
	},
}

def_id! { CustomerId, "Tenant (customer) identifier issued by the cloud API.", "Customer" }
def_id! { ClientId, "API client identifier used for token refresh.", "Client" }

fn validate_view(kind: &'static str, view: &str) -> Result<(), IdentifierError> {
	if view.is_empty() {
		return Err(IdentifierError::Empty { kind });
	}
	if view.chars().any(char::is_whitespace) {
		return Err(IdentifierError::ContainsWhitespace { kind });
	}
	if let Some(found) = view.chars().find(|c| matches!(c, '/' | '\\' | ':')) {
		return Err(IdentifierError::PathCharacter { kind, found });
	}
	if view.len() > IDENTIFIER_MAX_LEN {
		return Err(IdentifierError::TooLong { kind, max: IDENTIFIER_MAX_LEN });
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn identifiers_reject_whitespace_and_path_characters() {
		assert!(CustomerId::new(" abc").is_err(), "Leading whitespace must be rejected.");
		assert!(ClientId::new("").is_err());
		assert_eq!(
			CustomerId::new("../etc").unwrap_err(),
			IdentifierError::PathCharacter { kind: "Customer", found: '/' },
		);

		let customer = CustomerId::new("9a1b2c3d").expect("Customer fixture should be valid.");

		assert_eq!(customer.as_ref(), "9a1b2c3d");
	}

	#[test]
	fn serde_enforces_validation() {
		let client: ClientId =
			serde_json::from_str("\"cli-42\"").expect("Client should deserialize successfully.");

		assert_eq!(&*client, "cli-42");
		assert!(serde_json::from_str::<ClientId>("\"with space\"").is_err());
		assert!(serde_json::from_str::<ClientId>(&format!("\"{}\"", "a".repeat(129))).is_err());
	}
}
