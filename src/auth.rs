use parking_lot::RwLock;
use std::sync::Arc;

/// Source of the current access token.
///
/// Read on every connection attempt, never cached by the client, so a token
/// refreshed while the socket is down is used by the next reconnect.
/// Called with client state locked; must not call back into the client.
pub trait TokenProvider: Send + Sync + 'static {
    fn access_token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn access_token(&self) -> Option<String> {
        self()
    }
}

/// Provider for anonymous clients
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

impl TokenProvider for NoToken {
    fn access_token(&self) -> Option<String> {
        None
    }
}

/// In-memory session store that can be updated while the client runs.
///
/// Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct SessionToken {
    token: Arc<RwLock<Option<String>>>,
}

impl SessionToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let session = Self::new();
        session.set(token);
        session
    }

    /// Replace the stored token
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    /// Forget the stored token (signed out)
    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl TokenProvider for SessionToken {
    fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}
