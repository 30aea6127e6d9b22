use rusty_ulid::Ulid;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, ops::Deref};

/// Client-generated token correlating one search request with its progress channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct SessionId(String);

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for SessionId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(fr: &str) -> Self {
        SessionId(fr.to_string())
    }
}

impl SessionId {
    #[inline]
    pub fn new() -> SessionId {
        SessionId(Ulid::generate().to_string().to_lowercase())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
    }
}
