//! Signature verification against a resolved public key.
//!
//! Only the signature is checked here. Registered claims (`exp`, `nbf`,
//! `aud`) are deliberately not validated by `jsonwebtoken`; expiry runs
//! separately against the injected [`Clock`](crate::clock::Clock).

use std::str::FromStr;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use tracing::debug;

use crate::keys::PublicKey;

/// Verify `token`'s signature with `key`.
///
/// Returns `false` when the signature does not verify, when the key is not
/// an RSA key, or when the token header names a different algorithm than the
/// key is registered for.
pub fn verify_signature(token: &str, key: &PublicKey) -> bool {
    if !key.kty.eq_ignore_ascii_case("RSA") {
        debug!(kid = %key.kid, kty = %key.kty, "Unsupported key type");
        return false;
    }

    let Some(algorithm) = key_algorithm(key) else {
        debug!(kid = %key.kid, alg = ?key.alg, "Unsupported key algorithm");
        return false;
    };

    let decoding_key = match DecodingKey::from_rsa_components(&key.n, &key.e) {
        Ok(k) => k,
        Err(e) => {
            debug!(kid = %key.kid, error = %e, "Public key components rejected");
            return false;
        }
    };

    // Validation::new pins the accepted algorithm, so a header `alg` that
    // differs from the key's algorithm fails here.
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match jsonwebtoken::decode::<serde_json::Value>(token, &decoding_key, &validation) {
        Ok(_) => true,
        Err(e) => {
            debug!(kid = %key.kid, error = %e, "Signature verification failed");
            false
        }
    }
}

fn key_algorithm(key: &PublicKey) -> Option<Algorithm> {
    let alg = key.alg.as_deref().unwrap_or("RS256");
    match Algorithm::from_str(alg).ok()? {
        a @ (Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512) => Some(a),
        _ => None,
    }
}
