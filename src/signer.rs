use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("token expired")]
    Expired,
    #[error("bad signature")]
    BadSignature,
    #[error("malformed token")]
    Malformed,
    #[error("unexpected signing algorithm")]
    WrongAlg,
    #[error("claims missing exp or iat")]
    MissingClaims,
}

#[derive(Serialize, Deserialize)]
struct Header<'a> {
    alg: &'a str,
    typ: &'a str,
}

/// Mints and verifies compact three-segment signed credentials
/// (`header.payload.signature`, each base64url, no padding) using a
/// single configured HMAC-SHA256 secret. Stateless beyond the secret
/// itself; safe to share behind an `Arc`.
pub struct Signer {
    secret: Vec<u8>,
}

impl Signer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    /// Sign a JSON object claim set. Fails if `exp` or `iat` are absent —
    /// every credential this service issues must carry both.
    pub fn sign(&self, claims: &Value) -> Result<String, SignerError> {
        let obj = claims.as_object().ok_or(SignerError::Malformed)?;
        if !obj.contains_key("exp") || !obj.contains_key("iat") {
            return Err(SignerError::MissingClaims);
        }
        let header = Header { alg: "HS256", typ: "JWT" };
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).map_err(|_| SignerError::Malformed)?);
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).map_err(|_| SignerError::Malformed)?);
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = self.hmac(signing_input.as_bytes());
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature);
        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Verify a token's signature, algorithm, and expiry, and return its
    /// claim set. **Rejects `none` and any algorithm other than the
    /// configured HS256** — this is the algorithm-confusion defense, not
    /// an incidental check.
    pub fn verify(&self, token: &str) -> Result<Value, SignerError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SignerError::Malformed);
        };
        if parts.next().is_some() {
            return Err(SignerError::Malformed);
        }

        let header_bytes = URL_SAFE_NO_PAD.decode(header_b64).map_err(|_| SignerError::Malformed)?;
        let header: Map<String, Value> =
            serde_json::from_slice(&header_bytes).map_err(|_| SignerError::Malformed)?;
        let alg = header.get("alg").and_then(Value::as_str).ok_or(SignerError::Malformed)?;
        if alg != "HS256" {
            return Err(SignerError::WrongAlg);
        }

        let signing_input = format!("{header_b64}.{payload_b64}");
        let expected_signature = self.hmac(signing_input.as_bytes());
        let given_signature = URL_SAFE_NO_PAD.decode(signature_b64).map_err(|_| SignerError::Malformed)?;
        if !constant_time_eq(&expected_signature, &given_signature) {
            return Err(SignerError::BadSignature);
        }

        let payload_bytes = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| SignerError::Malformed)?;
        let claims: Value = serde_json::from_slice(&payload_bytes).map_err(|_| SignerError::Malformed)?;
        let exp = claims.get("exp").and_then(Value::as_i64).ok_or(SignerError::Malformed)?;
        if exp < chrono::Utc::now().timestamp() {
            return Err(SignerError::Expired);
        }

        Ok(claims)
    }

    fn hmac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Build a forged token with an attacker-chosen algorithm name, bypassing
/// the `Signer`'s own signing path entirely. Used only by the algorithm-
/// confusion test scenario (exercised from both inline unit tests and
/// `tests/algorithm_confusion.rs`, so it can't be `#[cfg(test)]`-gated —
/// integration tests link the crate as an ordinary dependency).
pub fn forge_with_alg(alg: &str, claims: &Value) -> String {
    let header = serde_json::json!({ "alg": alg, "typ": "JWT" });
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header_b64}.{payload_b64}.")
}
