use crate::error::{Result, TokenError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Random bytes per token, hex encoded to twice as many characters
pub const TOKEN_BYTES: usize = 32;

/// Time source for token expiry
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Ok(delta) = chrono::Duration::from_std(by) {
            *now += delta;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// A bearer token bound to one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub value: String,
    pub command_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// In-memory token registry
pub struct TokenStore {
    tokens: RwLock<HashMap<String, Token>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh token for `command_id`
    pub fn generate(&self, command_id: &str) -> Result<Token> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| TokenError::Generation {
                details: e.to_string(),
            })?;
        let value: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

        let ttl = chrono::Duration::from_std(self.ttl).map_err(|e| TokenError::Generation {
            details: format!("token TTL out of range: {}", e),
        })?;
        let created_at = self.clock.now();
        let expires_at = created_at
            .checked_add_signed(ttl)
            .ok_or_else(|| TokenError::Generation {
                details: "token expiry overflows".to_string(),
            })?;

        let token = Token {
            value: value.clone(),
            command_id: command_id.to_string(),
            created_at,
            expires_at,
        };
        self.tokens.write().insert(value, token.clone());

        debug!(command_id, "Issued token");
        Ok(token)
    }

    /// Look up a live token. Expired tokens are revoked on sight.
    pub fn validate(&self, value: &str) -> Option<Token> {
        if value.trim().is_empty() {
            return None;
        }

        let token = self.tokens.read().get(value).cloned()?;
        if token.is_expired_at(self.clock.now()) {
            self.revoke(value);
            return None;
        }
        Some(token)
    }

    pub fn revoke(&self, value: &str) {
        self.tokens.write().remove(value);
    }

    /// Revoke every token issued for `command_id`, returning how many
    pub fn revoke_for_command(&self, command_id: &str) -> usize {
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, token| token.command_id != command_id);
        before - tokens.len()
    }

    /// Drop expired tokens, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, token| !token.is_expired_at(now));
        let removed = before - tokens.len();
        if removed > 0 {
            debug!(removed, "Swept expired tokens");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("tokens", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
