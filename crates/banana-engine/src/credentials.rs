use std::fmt;

use banana_contracts::errors::{GenerationError, GenerationErrorKind};

use crate::config::{non_empty_env, Provider};

/// Opaque API key. Never printed, serialized or written to the event log.
#[derive(Clone, Default)]
pub struct Credentials {
    secret: Option<String>,
}

impl Credentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }

    pub fn missing() -> Self {
        Self::default()
    }

    /// First non-empty key among the provider's environment variables.
    pub fn from_env(provider: Provider) -> Self {
        provider
            .key_env_vars()
            .iter()
            .find_map(|key| non_empty_env(key))
            .map(Self::new)
            .unwrap_or_default()
    }

    pub fn is_present(&self) -> bool {
        self.secret.is_some()
    }

    /// Shape check done before any network call: the key must exist, be
    /// non-blank and contain no whitespace or control characters.
    pub fn validate(&self) -> Result<(), GenerationError> {
        let Some(secret) = self.secret.as_deref() else {
            return Err(GenerationError::new(
                GenerationErrorKind::AuthInvalid,
                "no API key configured",
            ));
        };
        if secret.trim().is_empty() {
            return Err(GenerationError::new(
                GenerationErrorKind::AuthInvalid,
                "API key is blank",
            ));
        }
        if secret
            .chars()
            .any(|ch| ch.is_whitespace() || ch.is_control())
        {
            return Err(GenerationError::new(
                GenerationErrorKind::AuthInvalid,
                "API key contains whitespace or control characters",
            ));
        }
        Ok(())
    }

    /// Raw key for transports. Do not log the returned value.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.secret {
            Some(_) => f.write_str("Credentials(<redacted>)"),
            None => f.write_str("Credentials(<missing>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_shows_the_key() {
        let credentials = Credentials::new("AIza-very-secret");
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("very-secret"));
        assert_eq!(rendered, "Credentials(<redacted>)");
        assert_eq!(format!("{:?}", Credentials::missing()), "Credentials(<missing>)");
    }

    #[test]
    fn malformed_keys_are_auth_invalid() {
        for credentials in [
            Credentials::missing(),
            Credentials::new(""),
            Credentials::new("   "),
            Credentials::new("abc def"),
            Credentials::new("abc\u{7}"),
        ] {
            let err = credentials.validate().unwrap_err();
            assert_eq!(err.kind, GenerationErrorKind::AuthInvalid);
            assert_eq!(err.attempts, 0);
        }
        assert!(Credentials::new("AIzaSyExample123").validate().is_ok());
    }
}
