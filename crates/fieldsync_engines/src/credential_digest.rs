#![forbid(unsafe_code)]

//! Slow salted password digests for offline verification.
//!
//! Encoding: `pbkdf2-sha256$<iterations>$<salt b64>$<hash b64>`. The iteration count travels
//! with the digest so the default can be raised without invalidating existing vault entries,
//! while anything below [`DIGEST_MIN_ITERATIONS`] is refused on both hash and verify.

use base64::engine::general_purpose::STANDARD_NO_PAD as B64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const DIGEST_SCHEME: &str = "pbkdf2-sha256";
pub const DIGEST_MIN_ITERATIONS: u32 = 100_000;
pub const DIGEST_DEFAULT_ITERATIONS: u32 = 600_000;
pub const DIGEST_MAX_ITERATIONS: u32 = 10_000_000;
pub const DIGEST_SALT_LEN: usize = 16;
pub const DIGEST_HASH_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    #[error("iteration count {got} outside {min}..={max}")]
    IterationsOutOfRange { got: u32, min: u32, max: u32 },
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("malformed credential digest: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestParams {
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub hash: Vec<u8>,
}

impl DigestParams {
    pub fn parse(encoded: &str) -> Result<Self, DigestError> {
        let mut parts = encoded.split('$');
        let scheme = parts.next().ok_or(DigestError::Malformed("missing scheme"))?;
        if scheme != DIGEST_SCHEME {
            return Err(DigestError::Malformed("unknown scheme"));
        }
        let iterations = parts
            .next()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or(DigestError::Malformed("bad iteration count"))?;
        check_iterations(iterations)?;
        let salt = parts
            .next()
            .and_then(|v| B64.decode(v).ok())
            .ok_or(DigestError::Malformed("bad salt"))?;
        let hash = parts
            .next()
            .and_then(|v| B64.decode(v).ok())
            .ok_or(DigestError::Malformed("bad hash"))?;
        if parts.next().is_some() {
            return Err(DigestError::Malformed("trailing fields"));
        }
        if salt.len() < DIGEST_SALT_LEN || hash.len() != DIGEST_HASH_LEN {
            return Err(DigestError::Malformed("bad salt or hash length"));
        }
        Ok(Self {
            iterations,
            salt,
            hash,
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{DIGEST_SCHEME}${}${}${}",
            self.iterations,
            B64.encode(&self.salt),
            B64.encode(&self.hash)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialHasher {
    iterations: u32,
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self {
            iterations: DIGEST_DEFAULT_ITERATIONS,
        }
    }
}

impl CredentialHasher {
    pub fn new(iterations: u32) -> Result<Self, DigestError> {
        check_iterations(iterations)?;
        Ok(Self { iterations })
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn hash(&self, password: &str) -> Result<String, DigestError> {
        if password.is_empty() {
            return Err(DigestError::EmptyPassword);
        }
        let mut salt = vec![0u8; DIGEST_SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let hash = derive(password, &salt, self.iterations);
        Ok(DigestParams {
            iterations: self.iterations,
            salt,
            hash,
        }
        .encode())
    }
}

/// Verifies a password against an encoded digest in constant time.
pub fn verify_password(password: &str, encoded: &str) -> Result<bool, DigestError> {
    if password.is_empty() {
        return Err(DigestError::EmptyPassword);
    }
    let params = DigestParams::parse(encoded)?;
    let candidate = derive(password, &params.salt, params.iterations);
    Ok(candidate.as_slice().ct_eq(params.hash.as_slice()).into())
}

fn derive(password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut out = vec![0u8; DIGEST_HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

fn check_iterations(iterations: u32) -> Result<(), DigestError> {
    if !(DIGEST_MIN_ITERATIONS..=DIGEST_MAX_ITERATIONS).contains(&iterations) {
        return Err(DigestError::IterationsOutOfRange {
            got: iterations,
            min: DIGEST_MIN_ITERATIONS,
            max: DIGEST_MAX_ITERATIONS,
        });
    }
    Ok(())
}
