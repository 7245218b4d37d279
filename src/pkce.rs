use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use crate::store::PkceMethod;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PkceError {
    #[error("code_verifier required")]
    Required,
    #[error("code_verifier does not match code_challenge")]
    Mismatch,
}

/// Verify a presented `verifier` against the `(challenge, method)` pair
/// recorded at authorization time. `None` challenge means PKCE was not
/// requested for this delegation, so no verifier is required.
pub fn verify(
    challenge: Option<&str>,
    method: Option<PkceMethod>,
    verifier: Option<&str>,
) -> Result<(), PkceError> {
    let Some(challenge) = challenge else {
        return Ok(());
    };
    let Some(verifier) = verifier else {
        return Err(PkceError::Required);
    };
    let method = method.unwrap_or(PkceMethod::S256);
    let matches = match method {
        PkceMethod::Plain => verifier == challenge,
        PkceMethod::S256 => challenge_from_verifier(verifier) == challenge,
    };
    if matches {
        Ok(())
    } else {
        Err(PkceError::Mismatch)
    }
}

/// Compute the S256 code challenge for a given verifier:
/// `base64url_nopad(sha256(verifier))`.
pub fn challenge_from_verifier(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}
