use std::any::Any;

/// A unit name was refused by the loader's security policy.
///
/// Violations are never downgraded to [`LoadError::NotFound`]: they point at
/// a potentially malicious plugin artifact rather than a packaging mistake.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityViolation {
    #[error("unit \"{name}\" is placed in the blacklisted package \"{package}\"")]
    BlacklistedPackage { name: String, package: String },

    #[error("unit \"{name}\" belongs to the host namespace \"{namespace}\" and is not whitelisted")]
    HostNamespace { name: String, namespace: String },
}

/// Errors produced while resolving or instantiating a unit.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unit \"{name}\" was not found: {reason}")]
    NotFound { name: String, reason: String },

    #[error(transparent)]
    Security(#[from] SecurityViolation),

    #[error("invalid unit name \"{0}\"")]
    InvalidName(String),

    #[error("unit \"{name}\" links the symbol \"{symbol}\" which the host does not export")]
    UnresolvedSymbol { name: String, symbol: String },

    #[error("unit \"{name}\" requires \"{dependency}\": {source}")]
    Dependency {
        name: String,
        dependency: String,
        #[source]
        source: Box<LoadError>,
    },

    #[error("unit \"{name}\" does not implement {capability}")]
    NotImplementer { name: String, capability: String },

    #[error("unit \"{name}\" could not be instantiated: {reason}")]
    Instantiation { name: String, reason: String },
}

impl LoadError {
    pub(crate) fn not_found(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::NotFound {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the policy violation behind this error, looking through
    /// failed dependencies.
    pub fn security_violation(&self) -> Option<&SecurityViolation> {
        match self {
            Self::Security(violation) => Some(violation),
            Self::Dependency { source, .. } => source.security_violation(),
            _ => None,
        }
    }

    pub fn is_security_violation(&self) -> bool {
        self.security_violation().is_some()
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_violation_seen_through_dependencies() {
        let err = LoadError::Dependency {
            name: "acme.Plugin".into(),
            dependency: "std.fs.File".into(),
            source: Box::new(LoadError::Security(SecurityViolation::BlacklistedPackage {
                name: "std.fs.File".into(),
                package: "std".into(),
            })),
        };
        assert!(err.is_security_violation());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_panic_message() {
        let n = 1;
        let payload = std::panic::catch_unwind(|| panic!("boom {n}")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }

    #[test]
    fn test_not_found_is_not_a_violation() {
        let err = LoadError::not_found("acme.Missing", "no such file");
        assert!(err.is_not_found());
        assert!(!err.is_security_violation());
        assert_eq!(
            err.to_string(),
            "unit \"acme.Missing\" was not found: no such file"
        );
    }
}
