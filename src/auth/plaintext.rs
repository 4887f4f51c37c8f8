//! Legacy plaintext authenticator: exactly one invocation, comparing the
//! presented key against the watchable of known keys.

use std::sync::Arc;

use super::{AuthWatchable, AuthenticatedUser, AuthenticationError};

enum State {
    Begin,
    Done,
}

pub struct PlaintextAuthenticator {
    watchable: Arc<dyn AuthWatchable>,
    state: State,
}

impl PlaintextAuthenticator {
    pub fn new(watchable: Arc<dyn AuthWatchable>) -> Self {
        Self {
            watchable,
            state: State::Begin,
        }
    }

    pub async fn next_message(&mut self, client_input: &str) -> Result<String, AuthenticationError> {
        match self.state {
            State::Begin => {
                if self.watchable.check_legacy_key(client_input.as_bytes()).await {
                    self.state = State::Done;
                    // No explicit terminal message; the handshake engine
                    // sends the literal "SUCCESS" banner itself.
                    Ok(String::new())
                } else {
                    Err(AuthenticationError::bad_credentials("<legacy>"))
                }
            }
            State::Done => Err(AuthenticationError::protocol_violation(
                "legacy authenticator invoked more than once",
            )),
        }
    }

    pub fn authenticated_user(&self) -> Option<AuthenticatedUser> {
        match self.state {
            State::Done => Some(AuthenticatedUser("<legacy>".to_string())),
            State::Begin => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StoredCredential;
    use async_trait::async_trait;

    struct FixedKey(Vec<u8>);

    #[async_trait]
    impl AuthWatchable for FixedKey {
        async fn lookup(&self, _user: &str) -> Option<StoredCredential> {
            None
        }

        async fn check_legacy_key(&self, presented: &[u8]) -> bool {
            presented == self.0.as_slice()
        }
    }

    #[tokio::test]
    async fn accepts_the_correct_key() {
        let mut auth = PlaintextAuthenticator::new(Arc::new(FixedKey(b"hunter2".to_vec())));
        assert!(auth.next_message("hunter2").await.is_ok());
        assert!(auth.authenticated_user().is_some());
    }

    #[tokio::test]
    async fn rejects_the_wrong_key() {
        let mut auth = PlaintextAuthenticator::new(Arc::new(FixedKey(b"hunter2".to_vec())));
        let err = auth.next_message("bad").await.unwrap_err();
        assert_eq!(err.code, 10);
        assert!(auth.authenticated_user().is_none());
    }
}
