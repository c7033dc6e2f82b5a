//! Token command implementation.

use patchsync_server::TokenValidator;
use uuid::Uuid;

/// Issues a hex-encoded token for `agent_id` signed with `secret`.
pub fn issue(secret: &str, agent_id: Uuid) -> Result<String, Box<dyn std::error::Error>> {
    if secret.is_empty() {
        return Err("secret must not be empty".into());
    }
    let token = TokenValidator::new(secret.as_bytes().to_vec()).create_token(agent_id)?;
    Ok(hex::encode(token))
}
