//! Bearer-token authentication for the admin surface.
//!
//! `POST /auth/login` exchanges the admin credentials for an HS256 JWT;
//! mutating endpoints require it. The admin password hash is salted and
//! computed exactly once at startup — verification compares against that
//! stored hash, so it stays stable for the lifetime of the process.

use crate::config::ServerConfig;
use crate::errors::{ToolforgeError, ToolforgeResult};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

pub struct AuthState {
    jwt_secret: String,
    username: String,
    salt: [u8; 16],
    password_hash: String,
    ttl_hours: u64,
}

fn hash_password(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

impl AuthState {
    pub fn new(server: &ServerConfig) -> Self {
        let salt = *uuid::Uuid::new_v4().as_bytes();
        Self {
            jwt_secret: server.jwt_secret.clone(),
            username: server.admin_username.clone(),
            salt,
            password_hash: hash_password(&salt, &server.admin_password),
            ttl_hours: server.token_ttl_hours,
        }
    }

    pub fn verify_password(&self, username: &str, password: &str) -> bool {
        username == self.username && hash_password(&self.salt, password) == self.password_hash
    }

    /// Issue a bearer token; returns `(token, expires_in_seconds)`.
    pub fn issue_token(&self) -> ToolforgeResult<(String, u64)> {
        let now = chrono::Utc::now();
        let expires_in = self.ttl_hours * 3600;
        let claims = Claims {
            sub: self.username.clone(),
            iat: now.timestamp(),
            exp: now.timestamp() + expires_in as i64,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| ToolforgeError::Auth(format!("cannot sign token: {e}")))?;
        Ok((token, expires_in))
    }

    pub fn verify_token(&self, token: &str) -> ToolforgeResult<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ToolforgeError::Auth("token has expired".to_string())
            }
            _ => ToolforgeError::Auth("invalid token".to_string()),
        })
    }

    /// Validate an `Authorization` header value (with or without the
    /// `Bearer ` prefix).
    pub fn verify_header(&self, header: Option<&str>) -> ToolforgeResult<Claims> {
        let raw = header.ok_or_else(|| {
            ToolforgeError::Auth("no authorization token provided".to_string())
        })?;
        let token = raw.strip_prefix("Bearer ").unwrap_or(raw);
        self.verify_token(token)
    }
}
