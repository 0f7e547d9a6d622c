use crate::error::ChatError;
use crate::model::{Role, UserRecord};
use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::path::Path;
use time::{Duration, OffsetDateTime};

/// Claims minted by the platform's identity service. Verifying the
/// signature is all this service does; user management lives elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub name: String,
    pub role: Role,
    pub exp: usize,
}

impl Claims {
    pub fn to_user(&self) -> UserRecord {
        UserRecord {
            id: self.sub.clone(),
            username: self.username.clone(),
            display_name: self.name.clone(),
            role: self.role,
        }
    }
}

/// Issue a JWT for a user valid for the provided duration.
pub fn issue_jwt(secret: &[u8], user: &UserRecord, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: user.id.clone(),
        username: user.username.clone(),
        name: user.display_name.clone(),
        role: user.role,
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims, ChatError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|_| ChatError::Unauthorized)?;
    Ok(data.claims)
}

/// Resolve the signing secret: explicit config value, previously persisted
/// file, or a freshly generated one written for the next start.
pub fn load_or_generate_secret(configured: Option<&str>, data_dir: &Path) -> Result<Vec<u8>> {
    if let Some(b64) = configured {
        return Ok(STANDARD.decode(b64)?);
    }
    let path = data_dir.join("jwt.secret");
    if let Ok(text) = std::fs::read_to_string(&path) {
        return Ok(STANDARD.decode(text.trim())?);
    }
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, STANDARD.encode(&secret))?;
    Ok(secret)
}
