//! Session token signing and validation.
//!
//! Tokens are opaque to devices but carry the device id as subject,
//! the auth set id as jti and the tenant context resolved at issuance.
//! Validation is split from claim parsing: the verify pipeline reads
//! claims before checking signatures so it can route errors and pick
//! the right key.

use std::fs;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::JwtKeyConfig;
use crate::models::Addon;

fn is_false(v: &bool) -> bool {
    !*v
}

/// Claims carried by issued session tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    /// Token id; equals the id of the auth set the token was issued for.
    #[serde(rename = "jti")]
    pub id: String,
    /// Device id.
    #[serde(rename = "sub")]
    pub subject: String,
    #[serde(rename = "iss")]
    pub issuer: String,
    /// Expiration time (Unix timestamp).
    #[serde(rename = "exp")]
    pub expires_at: i64,
    /// Issued at (Unix timestamp).
    #[serde(rename = "iat")]
    pub issued_at: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tenant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub plan: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub addons: Vec<Addon>,
    #[serde(skip_serializing_if = "is_false", default)]
    pub trial: bool,
    #[serde(skip_serializing_if = "is_false", default)]
    pub device: bool,
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("jwt: token expired")]
    Expired,

    #[error("jwt: token invalid")]
    Invalid,
}

/// Signing/validation backend. Object-safe so a deployment can hold a
/// primary handler plus a fallback for key rotation.
pub trait JwtHandler: Send + Sync {
    fn sign(&self, claims: &Claims) -> Result<String, anyhow::Error>;
    fn validate(&self, raw: &str) -> Result<(), JwtError>;
}

pub struct JwtService {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    /// Create a service from key configuration; RSA keys are loaded
    /// from PEM files, symmetric secrets are used as-is.
    pub fn new(config: &JwtKeyConfig) -> Result<Self, anyhow::Error> {
        match config {
            JwtKeyConfig::Rs256 {
                private_key_path,
                public_key_path,
            } => {
                let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
                    anyhow::anyhow!("failed to read private key from {}: {}", private_key_path, e)
                })?;
                let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("failed to parse private key: {}", e))?;

                let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
                    anyhow::anyhow!("failed to read public key from {}: {}", public_key_path, e)
                })?;
                let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("failed to parse public key: {}", e))?;

                Ok(Self {
                    algorithm: Algorithm::RS256,
                    encoding_key,
                    decoding_key,
                })
            }
            JwtKeyConfig::Hs256 { secret } => Ok(Self {
                algorithm: Algorithm::HS256,
                encoding_key: EncodingKey::from_secret(secret.as_bytes()),
                decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            }),
        }
    }
}

impl JwtHandler for JwtService {
    fn sign(&self, claims: &Claims) -> Result<String, anyhow::Error> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("failed to sign token: {}", e))
    }

    fn validate(&self, raw: &str) -> Result<(), JwtError> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();
        match decode::<Claims>(raw, &self.decoding_key, &validation) {
            Ok(_) => Ok(()),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(JwtError::Expired),
                _ => Err(JwtError::Invalid),
            },
        }
    }
}

/// Parse claims without verifying signature or expiry. Used to route a
/// presented token (device vs. user, tenant) before any cryptographic
/// check; callers must still run [`JwtHandler::validate`].
pub fn parse_claims(raw: &str) -> Result<Claims, JwtError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    let data = decode::<Claims>(raw, &DecodingKey::from_secret(b""), &validation)
        .map_err(|_| JwtError::Invalid)?;
    Ok(data.claims)
}
