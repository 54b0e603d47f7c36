use std::{collections::HashMap, fs, path::Path};

use base64::{Engine, engine::general_purpose::URL_SAFE};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;

use crate::error::{NestError, Result};

/// Validity window applied to tokens loaded from the bootstrap file.
const BOOTSTRAP_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
struct TokenRecord {
    username: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AuthState {
    /// token -> record
    tokens: HashMap<String, TokenRecord>,
    /// username -> currently active token
    user_tokens: HashMap<String, String>,
}

/// Resolves bearer tokens to principals. Tokens come from two places: a
/// bootstrap file loaded at startup and `POST /auth` logins. A successful
/// authenticate slides the token's expiry window forward.
#[derive(Debug)]
pub struct AuthManager {
    ttl: Duration,
    state: Mutex<AuthState>,
}

impl AuthManager {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_secs as i64),
            state: Mutex::new(AuthState::default()),
        }
    }

    /// Load a JSON map of `username -> token` and register each pair.
    pub fn load_bootstrap(&self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)?;
        let pairs: HashMap<String, String> = serde_json::from_str(&contents)?;

        let mut state = self.state.lock();
        let expires_at = Utc::now() + Duration::hours(BOOTSTRAP_TTL_HOURS);
        for (username, token) in pairs {
            state.user_tokens.insert(username.clone(), token.clone());
            state.tokens.insert(
                token.clone(),
                TokenRecord {
                    username,
                    expires_at,
                },
            );
        }
        Ok(())
    }

    /// Issue a fresh token for `username`, revoking any previous one.
    pub fn login(&self, username: &str) -> Result<String> {
        if username.is_empty() {
            return Err(NestError::BadRequest("username cannot be empty".into()));
        }

        let token = generate_token();
        let mut state = self.state.lock();
        if let Some(old) = state.user_tokens.remove(username) {
            state.tokens.remove(&old);
        }
        state.tokens.insert(
            token.clone(),
            TokenRecord {
                username: username.to_string(),
                expires_at: Utc::now() + self.ttl,
            },
        );
        state.user_tokens.insert(username.to_string(), token.clone());
        Ok(token)
    }

    /// Revoke a token, logging its user out.
    pub fn logout(&self, token: &str) -> Result<()> {
        let mut state = self.state.lock();
        let record = state
            .tokens
            .remove(token)
            .ok_or(NestError::Unauthorized)?;
        state.user_tokens.remove(&record.username);
        Ok(())
    }

    /// Resolve a token to its principal, refreshing the expiry window.
    pub fn authenticate(&self, token: &str) -> Result<String> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let ttl = self.ttl;
        let record = state.tokens.get_mut(token).ok_or(NestError::Unauthorized)?;
        if record.expires_at < now {
            return Err(NestError::Unauthorized);
        }
        record.expires_at = now + ttl;
        Ok(record.username.clone())
    }
}

/// 16 random bytes, URL-safe base64.
fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_then_authenticate_resolves_user() {
        let auth = AuthManager::new(3600);
        let token = auth.login("alice").unwrap();
        assert_eq!(auth.authenticate(&token).unwrap(), "alice");
    }

    #[test]
    fn relogin_revokes_previous_token() {
        let auth = AuthManager::new(3600);
        let first = auth.login("alice").unwrap();
        let second = auth.login("alice").unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            auth.authenticate(&first),
            Err(NestError::Unauthorized)
        ));
        assert_eq!(auth.authenticate(&second).unwrap(), "alice");
    }

    #[test]
    fn logout_invalidates_token() {
        let auth = AuthManager::new(3600);
        let token = auth.login("bob").unwrap();
        auth.logout(&token).unwrap();
        assert!(matches!(
            auth.authenticate(&token),
            Err(NestError::Unauthorized)
        ));
        assert!(matches!(auth.logout(&token), Err(NestError::Unauthorized)));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let auth = AuthManager::new(0);
        let token = auth.login("carol").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(matches!(
            auth.authenticate(&token),
            Err(NestError::Unauthorized)
        ));
    }

    #[test]
    fn bootstrap_tokens_resolve() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        fs::write(
            temp.path(),
            serde_json::to_vec(&serde_json::json!({"admin": "seed-token"})).unwrap(),
        )
        .unwrap();

        let auth = AuthManager::new(3600);
        auth.load_bootstrap(temp.path()).unwrap();
        assert_eq!(auth.authenticate("seed-token").unwrap(), "admin");
    }
}
