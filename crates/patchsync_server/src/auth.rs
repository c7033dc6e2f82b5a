//! Agent authentication.
//!
//! When the synchronizer is configured with a shared secret, every `Hello`
//! must carry a token issued for the agent's id.
//!
//! ## Token Format
//!
//! - 16 bytes: agent id
//! - 8 bytes: issue timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 over the preceding 24 bytes
//!
//! Total: 56 bytes, hex-encoded when handled by people.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 56;
const SIGNED_LEN: usize = 24;

/// Issues and checks agent tokens.
#[derive(Clone)]
pub struct TokenValidator {
    secret: Vec<u8>,
    token_expiry: Option<Duration>,
}

impl TokenValidator {
    /// Creates a validator whose tokens never expire.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: None,
        }
    }

    /// Rejects tokens older than `expiry`.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = Some(expiry);
        self
    }

    /// Creates a token for `agent_id`.
    pub fn create_token(&self, agent_id: Uuid) -> ServerResult<Vec<u8>> {
        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(agent_id.as_bytes());
        token.extend_from_slice(&now_millis().to_be_bytes());
        let signature = self.sign(&token)?;
        token.extend_from_slice(&signature);
        Ok(token)
    }

    /// Checks that `token` was issued by this secret for `agent_id` and has
    /// not expired.
    pub fn validate(&self, token: &[u8], agent_id: Uuid) -> ServerResult<()> {
        if token.len() != TOKEN_LEN {
            return Err(ServerError::AuthenticationFailed("invalid token length".into()));
        }
        let (signed, signature) = token.split_at(SIGNED_LEN);
        if &signed[..16] != agent_id.as_bytes() {
            return Err(ServerError::AuthenticationFailed("agent id mismatch".into()));
        }

        let mut mac = self.mac()?;
        mac.update(signed);
        mac.verify_slice(signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        if let Some(expiry) = self.token_expiry {
            let mut stamp = [0u8; 8];
            stamp.copy_from_slice(&signed[16..SIGNED_LEN]);
            let issued = u64::from_be_bytes(stamp);
            if now_millis() > issued.saturating_add(expiry.as_millis() as u64) {
                return Err(ServerError::AuthenticationFailed("token expired".into()));
            }
        }
        Ok(())
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ServerError::Config(format!("unusable auth secret: {e}")))
    }

    fn sign(&self, data: &[u8]) -> ServerResult<[u8; 32]> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
