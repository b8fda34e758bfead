//! Cancellation tokens for stream subscriptions

use std::fmt;
use uuid::Uuid;

/// Opaque per-subscription handle.
///
/// Minted on subscription (or supplied by the caller to group several
/// callbacks) and presented to `FutureStream::cancel` to stop delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelToken(Uuid);

impl CancelToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tokens_are_unique() {
        let tokens: HashSet<CancelToken> = (0..1000).map(|_| CancelToken::new()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn test_token_copy_equality() {
        let token = CancelToken::new();
        let copy = token;
        assert_eq!(token, copy);
        assert_ne!(token, CancelToken::default());
    }

    #[test]
    fn test_token_display_is_short() {
        assert_eq!(CancelToken::new().to_string().len(), 8);
    }
}
