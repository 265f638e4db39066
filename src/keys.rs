//! Signing key holder
//!
//! Owns the single active RSA-2048 key used to sign ID tokens. The key is
//! generated on first run, persisted as PEM under the state directory, and
//! reloaded on subsequent runs. The key id is derived from the public key
//! material, so it is stable for the life of the key and changes if the key
//! ever does. The JWKS document already carries a key list, so rotation can
//! be added without changing the published shape.

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::clients::write_atomic;
use crate::{Error, Result};

/// File name of the persisted private key inside the state directory
const KEY_FILE: &str = "oidc-key.pem";

/// The active signing key and its derived metadata.
pub struct SigningKey {
    kid: String,
    encoding_key: EncodingKey,
    jwks: Jwks,
}

impl SigningKey {
    /// Load the key from `state_dir`, generating and persisting a fresh
    /// RSA-2048 key on first run.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be generated, parsed, or written.
    pub fn load_or_generate(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(KEY_FILE);
        let private_key = if path.exists() {
            let pem = fs::read_to_string(&path)?;
            RsaPrivateKey::from_pkcs1_pem(&pem)
                .map_err(|e| Error::Key(format!("invalid key file {}: {e}", path.display())))?
        } else {
            let key = generate_key()?;
            persist_key(&key, &path)?;
            info!(path = %path.display(), "Generated new signing key");
            key
        };
        Self::from_private_key(&private_key)
    }

    /// Build a signing key from existing RSA key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be re-encoded for the JWT library.
    pub fn from_private_key(private_key: &RsaPrivateKey) -> Result<Self> {
        let public_key = private_key.to_public_key();
        let kid = derive_kid(&public_key)?;

        let pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::Key(format!("failed to encode private key: {e}")))?;
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())?;

        let jwks = Jwks {
            keys: vec![Jwk {
                kty: "RSA".to_string(),
                kid: kid.clone(),
                alg: "RS256".to_string(),
                use_field: "sig".to_string(),
                n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
                e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
            }],
        };

        Ok(Self {
            kid,
            encoding_key,
            jwks,
        })
    }

    /// Stable identifier of the active key, carried in every JWT header.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Sign `claims` as a compact RS256 JWS.
    ///
    /// # Errors
    ///
    /// Returns an error if JWT encoding fails.
    pub fn sign(&self, claims: &serde_json::Map<String, serde_json::Value>) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        Ok(jsonwebtoken::encode(&header, claims, &self.encoding_key)?)
    }

    /// The published JWKS document (public key only).
    #[must_use]
    pub fn jwks(&self) -> &Jwks {
        &self.jwks
    }
}

/// JSON Web Key Set document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    /// Published keys; exactly one entry today
    pub keys: Vec<Jwk>,
}

/// A single published JSON Web Key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, always `RSA`
    pub kty: String,
    /// Key identifier matching the JWT header `kid`
    pub kid: String,
    /// Signature algorithm, always `RS256`
    pub alg: String,
    /// Key use, always `sig`
    #[serde(rename = "use")]
    pub use_field: String,
    /// Base64url modulus
    pub n: String,
    /// Base64url public exponent
    pub e: String,
}

fn generate_key() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
        .map_err(|e| Error::Key(format!("failed to generate key: {e}")))
}

fn persist_key(key: &RsaPrivateKey, path: &Path) -> Result<()> {
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::Key(format!("failed to encode private key: {e}")))?;
    write_atomic(path, pem.as_bytes())?;

    // Owner read/write only; the file holds the private key.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(path, perms);
    }
    Ok(())
}

/// Derive the numeric key id from the public key DER.
fn derive_kid(public_key: &rsa::RsaPublicKey) -> Result<String> {
    let der = public_key
        .to_pkcs1_der()
        .map_err(|e| Error::Key(format!("failed to encode public key: {e}")))?;
    let digest = Sha256::digest(der.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(prefix).to_string())
}

/// Path of the key file inside `state_dir`; exposed for operational tooling.
#[must_use]
pub fn key_path(state_dir: &Path) -> PathBuf {
    state_dir.join(KEY_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};
    use serde_json::json;

    fn test_key() -> SigningKey {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        SigningKey::from_private_key(&private_key).unwrap()
    }

    #[test]
    fn kid_is_stable_for_same_key() {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let a = SigningKey::from_private_key(&private_key).unwrap();
        let b = SigningKey::from_private_key(&private_key).unwrap();
        assert_eq!(a.kid(), b.kid());
    }

    #[test]
    fn jwks_has_one_rs256_signing_key() {
        let key = test_key();
        let jwks = key.jwks();
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kty, "RSA");
        assert_eq!(jwks.keys[0].alg, "RS256");
        assert_eq!(jwks.keys[0].use_field, "sig");
        assert_eq!(jwks.keys[0].kid, key.kid());
    }

    #[test]
    fn sign_verify_roundtrip_against_jwks() {
        let key = test_key();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        let mut claims = serde_json::Map::new();
        claims.insert("iss".to_string(), json!("https://idp.test.ts.net"));
        claims.insert("sub".to_string(), json!("UABC123"));
        claims.insert("aud".to_string(), json!("client-1"));
        claims.insert("exp".to_string(), json!(now + 300));
        claims.insert("iat".to_string(), json!(now));

        let token = key.sign(&claims).unwrap();

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some(key.kid()));

        let jwk = &key.jwks().keys[0];
        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["client-1"]);
        validation.set_issuer(&["https://idp.test.ts.net"]);
        let decoded = jsonwebtoken::decode::<serde_json::Map<String, serde_json::Value>>(
            &token,
            &decoding_key,
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims["sub"], json!("UABC123"));
    }

    #[test]
    fn load_or_generate_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let first = SigningKey::load_or_generate(dir.path()).unwrap();
        assert!(key_path(dir.path()).exists());
        let second = SigningKey::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.kid(), second.kid());
    }
}
