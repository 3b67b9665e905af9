//! Node agent credentials
//!
//! First run: the agent presents the shared one-time registration token and
//! receives a persistent per-node secret. Subsequent runs authenticate with
//! that secret. Only SHA-256 fingerprints are stored.

use hyper::header::AUTHORIZATION;
use hyper::Request;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Extract a bearer credential from the Authorization header, falling back
/// to a `token` query parameter for agents that cannot set headers during a
/// WebSocket upgrade
pub fn extract_bearer<B>(req: &Request<B>) -> Option<String> {
    if let Some(value) = req.headers().get(AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    query_param(req, "token")
}

/// Pull one parameter out of the query string
pub fn query_param<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    })
}

/// Generate a fresh per-node secret (hex, 256 bits)
pub fn generate_node_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fingerprint stored in place of the secret
pub fn secret_fingerprint(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Check a presented secret against a stored fingerprint
pub fn verify_secret(presented: &str, stored_fingerprint: &str) -> bool {
    secret_fingerprint(presented) == stored_fingerprint
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_roundtrip() {
        let secret = generate_node_secret();
        assert_eq!(secret.len(), 64);
        let fp = secret_fingerprint(&secret);
        assert!(verify_secret(&secret, &fp));
        assert!(!verify_secret("wrong", &fp));
    }

    #[test]
    fn test_bearer_extraction() {
        let req = Request::builder()
            .uri("/agent/channel?node_id=n1&token=qtoken")
            .header(AUTHORIZATION, "Bearer headertoken")
            .body(())
            .unwrap();
        assert_eq!(extract_bearer(&req).as_deref(), Some("headertoken"));

        let req = Request::builder()
            .uri("/agent/channel?node_id=n1&token=qtoken")
            .body(())
            .unwrap();
        assert_eq!(extract_bearer(&req).as_deref(), Some("qtoken"));
        assert_eq!(query_param(&req, "node_id").as_deref(), Some("n1"));
        assert_eq!(query_param(&req, "missing"), None);
    }
}
