use std::collections::HashMap;
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jwt_simple::prelude::{RS256PublicKey, RSAPublicKeyLike, VerificationOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DpopError {
    #[error("dpop proof invalid")]
    Invalid,
    #[error("dpop proof replayed")]
    Replay,
    #[error("dpop proof stale")]
    Stale,
}

const FRESHNESS_WINDOW_SECS: i64 = 300;
const REPLAY_RETENTION_SECS: i64 = 2 * FRESHNESS_WINDOW_SECS;

#[derive(Serialize, Deserialize)]
struct DpopCustomClaims {
    htu: String,
    htm: String,
}

#[derive(Deserialize)]
struct Jwk {
    n: String,
    e: String,
}

#[derive(Deserialize)]
struct ProofHeader {
    alg: String,
    jwk: Jwk,
}

/// Verifies DPoP proof-of-possession proofs: RSA signature under the
/// caller-embedded public key, method/URL binding, timestamp freshness,
/// and replay suppression. The replay set is its own lock domain,
/// independent of the Store, with time-based eviction — it never holds
/// the Store lock and the Store never holds this one.
pub struct DpopVerifier {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Default for DpopVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DpopVerifier {
    pub fn new() -> Self {
        Self { seen: Mutex::new(HashMap::new()) }
    }

    /// Verify a proof presented for `method`/`url` (the request's HTTP
    /// method and absolute URL).
    pub fn verify(&self, proof: &str, method: &str, url: &str) -> Result<(), DpopError> {
        let header_b64 = proof.split('.').next().ok_or(DpopError::Invalid)?;
        let header_bytes = URL_SAFE_NO_PAD.decode(header_b64).map_err(|_| DpopError::Invalid)?;
        let header: ProofHeader = serde_json::from_slice(&header_bytes).map_err(|_| DpopError::Invalid)?;
        if header.alg != "RS256" {
            return Err(DpopError::Invalid);
        }

        let n = URL_SAFE_NO_PAD.decode(&header.jwk.n).map_err(|_| DpopError::Invalid)?;
        let e = URL_SAFE_NO_PAD.decode(&header.jwk.e).map_err(|_| DpopError::Invalid)?;
        let public_key = RS256PublicKey::from_components(&n, &e).map_err(|_| DpopError::Invalid)?;

        let options = VerificationOptions { accept_future: false, ..Default::default() };
        let claims = public_key
            .verify_token::<DpopCustomClaims>(proof, Some(options))
            .map_err(|_| DpopError::Invalid)?;

        if claims.custom.htm != method || claims.custom.htu != url {
            return Err(DpopError::Invalid);
        }

        let iat = claims.issued_at.ok_or(DpopError::Invalid)?;
        let iat = Utc
            .timestamp_opt(i64::try_from(iat.as_secs()).map_err(|_| DpopError::Invalid)?, 0)
            .single()
            .ok_or(DpopError::Invalid)?;
        let now = Utc::now();
        if (now - iat).num_seconds().abs() > FRESHNESS_WINDOW_SECS {
            return Err(DpopError::Stale);
        }

        let jti = claims.jwt_id.ok_or(DpopError::Invalid)?;

        let mut seen = self.seen.lock().unwrap();
        seen.retain(|_, seen_at| now.signed_duration_since(*seen_at) < Duration::seconds(REPLAY_RETENTION_SECS));
        if seen.contains_key(&jti) {
            return Err(DpopError::Replay);
        }
        seen.insert(jti, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_rsa_algorithm_header() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","jwk":{"n":"","e":""}}"#);
        let forged = format!("{header}..");
        let verifier = DpopVerifier::new();
        assert_eq!(
            verifier.verify(&forged, "GET", "https://resource.example/data"),
            Err(DpopError::Invalid)
        );
    }

    #[test]
    fn rejects_malformed_proof() {
        let verifier = DpopVerifier::new();
        assert_eq!(verifier.verify("not-a-jwt", "GET", "https://resource.example/data"), Err(DpopError::Invalid));
    }
}
