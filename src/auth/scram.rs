//! Server-side SCRAM-SHA-256, per RFC 5802 and RFC 7677.
//!
//! Two invocations of `next_message` drive client-first -> server-first,
//! client-final -> server-final, matching the handshake engine's three JSON
//! round-trips (the server hello counts as the first). Keyed-hash
//! primitives (`hmac`, `pbkdf2`, `sha2`) implement the server-role math:
//! ClientKey/StoredKey/ServerKey at credential-build time, then
//! ClientSignature/ClientProof verification and ServerSignature
//! computation per exchange.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{AuthWatchable, AuthenticatedUser, AuthenticationError, StoredCredential};

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_KEY_LEN: usize = 32;

/// Derived from the user's password at registration time and looked up per
/// session; never the password itself (RFC 5802 §3).
#[derive(Clone)]
pub struct ServerSecret {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub stored_key: [u8; SCRAM_KEY_LEN],
    pub server_key: [u8; SCRAM_KEY_LEN],
}

impl ServerSecret {
    /// Build a secret from a plaintext password, for credential provisioning
    /// and tests. Production code should persist `stored_key`/`server_key`
    /// rather than the password.
    pub fn build(password: &str, salt: Vec<u8>, iterations: u32) -> Self {
        let salted_password = pbkdf2_hmac_sha256(password.as_bytes(), &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let server_key = hmac_sha256(&salted_password, b"Server Key");
        Self {
            salt,
            iterations,
            stored_key: to_array(&stored_key),
            server_key: to_array(&server_key),
        }
    }
}

enum State {
    Begin,
    ClientFirstReceived {
        user: String,
        client_nonce: String,
        combined_nonce: String,
        secret: ServerSecret,
        auth_message_prefix: String,
    },
    Done {
        user: String,
    },
}

pub struct ScramAuthenticator {
    watchable: Arc<dyn AuthWatchable>,
    state: State,
}

impl ScramAuthenticator {
    pub fn new(watchable: Arc<dyn AuthWatchable>) -> Self {
        Self {
            watchable,
            state: State::Begin,
        }
    }

    pub async fn next_message(&mut self, client_input: &str) -> Result<String, AuthenticationError> {
        match std::mem::replace(&mut self.state, State::Begin) {
            State::Begin => self.handle_client_first(client_input).await,
            State::ClientFirstReceived {
                user,
                client_nonce,
                combined_nonce,
                secret,
                auth_message_prefix,
            } => self.handle_client_final(
                client_input,
                user,
                client_nonce,
                combined_nonce,
                secret,
                auth_message_prefix,
            ),
            State::Done { user } => {
                self.state = State::Done { user };
                Err(AuthenticationError::protocol_violation(
                    "SCRAM authenticator invoked after completion",
                ))
            }
        }
    }

    pub fn authenticated_user(&self) -> Option<AuthenticatedUser> {
        match &self.state {
            State::Done { user } => Some(AuthenticatedUser(user.clone())),
            _ => None,
        }
    }

    async fn handle_client_first(&mut self, client_input: &str) -> Result<String, AuthenticationError> {
        let bare = strip_gs2_header(client_input);
        let fields = parse_scram_fields(bare)
            .ok_or_else(|| AuthenticationError::malformed_message("bad client-first-message"))?;
        let user = fields
            .get("n")
            .ok_or_else(|| AuthenticationError::malformed_message("missing username"))?
            .replace("=3D", "=")
            .replace("=2C", ",");
        let client_nonce = fields
            .get("r")
            .ok_or_else(|| AuthenticationError::malformed_message("missing client nonce"))?
            .clone();

        let secret = match self.watchable.lookup(&user).await {
            Some(StoredCredential::ScramSecret(secret)) => secret,
            _ => return Err(AuthenticationError::bad_credentials(&user)),
        };

        let server_nonce = generate_nonce();
        let combined_nonce = format!("{client_nonce}{server_nonce}");

        let client_first_bare = format!("n={},r={}", escape_username(&user), client_nonce);
        let server_first = format!(
            "r={},s={},i={}",
            combined_nonce,
            BASE64.encode(&secret.salt),
            secret.iterations
        );
        let auth_message_prefix = format!("{client_first_bare},{server_first}");

        self.state = State::ClientFirstReceived {
            user,
            client_nonce,
            combined_nonce,
            secret,
            auth_message_prefix,
        };

        Ok(server_first)
    }

    fn handle_client_final(
        &mut self,
        client_input: &str,
        user: String,
        _client_nonce: String,
        combined_nonce: String,
        secret: ServerSecret,
        auth_message_prefix: String,
    ) -> Result<String, AuthenticationError> {
        let fields = parse_scram_fields(client_input)
            .ok_or_else(|| AuthenticationError::malformed_message("bad client-final-message"))?;
        let channel_binding = fields
            .get("c")
            .ok_or_else(|| AuthenticationError::malformed_message("missing channel binding"))?;
        let nonce = fields
            .get("r")
            .ok_or_else(|| AuthenticationError::malformed_message("missing nonce"))?;
        if nonce != &combined_nonce {
            return Err(AuthenticationError::new(13, "SCRAM nonce mismatch"));
        }
        let proof_b64 = fields
            .get("p")
            .ok_or_else(|| AuthenticationError::malformed_message("missing client proof"))?;
        let client_proof = BASE64
            .decode(proof_b64)
            .map_err(|_| AuthenticationError::malformed_message("client proof is not base64"))?;

        let client_final_without_proof = format!("c={channel_binding},r={nonce}");
        let auth_message = format!("{auth_message_prefix},{client_final_without_proof}");

        let client_signature = hmac_sha256(&secret.stored_key, auth_message.as_bytes());
        let recovered_client_key: Vec<u8> = client_proof
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        if sha256(&recovered_client_key) != secret.stored_key {
            self.state = State::Begin;
            return Err(AuthenticationError::new(14, "Incorrect authorization key."));
        }

        let server_signature = hmac_sha256(&secret.server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64.encode(server_signature));

        self.state = State::Done { user };
        Ok(server_final)
    }
}

fn escape_username(user: &str) -> String {
    user.replace('=', "=3D").replace(',', "=2C")
}

fn strip_gs2_header(message: &str) -> &str {
    // `n,,n=user,r=nonce` or bare `n=user,r=nonce`: tolerate both since the
    // handshake already negotiated the mechanism out-of-band.
    if let Some(rest) = message.strip_prefix("n,,") {
        rest
    } else if let Some(rest) = message.strip_prefix("y,,") {
        rest
    } else {
        message
    }
}

fn parse_scram_fields(message: &str) -> Option<std::collections::HashMap<String, String>> {
    let mut map = std::collections::HashMap::new();
    for part in message.split(',') {
        let (key, value) = part.split_once('=')?;
        map.insert(key.to_string(), value.to_string());
    }
    Some(map)
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

fn pbkdf2_hmac_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut out = vec![0u8; SCRAM_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn to_array(bytes: &[u8]) -> [u8; SCRAM_KEY_LEN] {
    let mut out = [0u8; SCRAM_KEY_LEN];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct OneUser {
        user: String,
        secret: ServerSecret,
    }

    #[async_trait]
    impl AuthWatchable for OneUser {
        async fn lookup(&self, user: &str) -> Option<StoredCredential> {
            if user == self.user {
                Some(StoredCredential::ScramSecret(self.secret.clone()))
            } else {
                None
            }
        }

        async fn check_legacy_key(&self, _presented: &[u8]) -> bool {
            false
        }
    }

    fn client_proof(
        password: &str,
        salt: &[u8],
        iterations: u32,
        auth_message: &str,
    ) -> (String, [u8; SCRAM_KEY_LEN]) {
        let salted_password = pbkdf2_hmac_sha256(password.as_bytes(), salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        let server_key = hmac_sha256(&salted_password, b"Server Key");
        (BASE64.encode(proof), to_array(&server_key))
    }

    #[tokio::test]
    async fn full_exchange_succeeds_with_the_right_password() {
        let salt = b"somesalt".to_vec();
        let iterations = 4096;
        let secret = ServerSecret::build("s3kr1t", salt.clone(), iterations);
        let watchable = Arc::new(OneUser {
            user: "alice".to_string(),
            secret: secret.clone(),
        });
        let mut auth = ScramAuthenticator::new(watchable);

        let client_nonce = "fyko+d2lbbFgONRv9qkxdawL";
        let client_first = format!("n,,n=alice,r={client_nonce}");
        let server_first = auth.next_message(&client_first).await.unwrap();

        let fields = parse_scram_fields(&server_first).unwrap();
        let combined_nonce = fields.get("r").unwrap().clone();
        assert!(combined_nonce.starts_with(client_nonce));

        let client_first_bare = format!("n=alice,r={client_nonce}");
        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{client_final_without_proof}");
        let (proof, _server_key) = client_proof("s3kr1t", &salt, iterations, &auth_message);

        let client_final = format!("{client_final_without_proof},p={proof}");
        let server_final = auth.next_message(&client_final).await.unwrap();
        assert!(server_final.starts_with("v="));
        assert_eq!(
            auth.authenticated_user().unwrap(),
            AuthenticatedUser("alice".to_string())
        );
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_with_code_14() {
        let salt = b"somesalt".to_vec();
        let iterations = 4096;
        let secret = ServerSecret::build("s3kr1t", salt.clone(), iterations);
        let watchable = Arc::new(OneUser {
            user: "alice".to_string(),
            secret,
        });
        let mut auth = ScramAuthenticator::new(watchable);

        let client_nonce = "abcdefghijklmnop";
        let client_first = format!("n,,n=alice,r={client_nonce}");
        let server_first = auth.next_message(&client_first).await.unwrap();
        let fields = parse_scram_fields(&server_first).unwrap();
        let combined_nonce = fields.get("r").unwrap().clone();

        let client_first_bare = format!("n=alice,r={client_nonce}");
        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{client_final_without_proof}");
        let (proof, _) = client_proof("wrong password", &salt, iterations, &auth_message);

        let client_final = format!("{client_final_without_proof},p={proof}");
        let err = auth.next_message(&client_final).await.unwrap_err();
        assert_eq!(err.code, 14);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let salt = b"somesalt".to_vec();
        let secret = ServerSecret::build("s3kr1t", salt, 4096);
        let watchable = Arc::new(OneUser {
            user: "alice".to_string(),
            secret,
        });
        let mut auth = ScramAuthenticator::new(watchable);
        let err = auth
            .next_message("n,,n=mallory,r=abcdefghijklmnop")
            .await
            .unwrap_err();
        assert_eq!(err.code, 10);
    }
}
