use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::AuthzError;

/// How an entry's verdict combines with the rest of its stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    /// A denial fails the stack, but evaluation continues.
    #[default]
    Required,
    /// A denial fails the stack immediately.
    Requisite,
    /// An approval while nothing has failed yet allows immediately.
    Sufficient,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Required => "required",
            Role::Requisite => "requisite",
            Role::Sufficient => "sufficient",
        }
    }
}

impl FromStr for Role {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "required" => Ok(Role::Required),
            "requisite" => Ok(Role::Requisite),
            "sufficient" => Ok(Role::Sufficient),
            // PAM's optional role has no settled meaning here yet.
            "optional" => Err(AuthzError::UnsupportedRole(s.trim().to_string())),
            _ => Err(AuthzError::UnknownRole(s.to_string())),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = AuthzError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}
