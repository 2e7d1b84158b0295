//! Pairing Manager (§4.5).
//!
//! One-time invitation tokens that let a not-yet-trusted instance
//! complete an authenticated handshake once. Generalizes
//! `magic_link::ConnectionInfo` (a base64-encoded, single-shot
//! connection descriptor) into a full invitation contract with TTL
//! expiry and one-time consumption; token generation reuses the
//! teacher's existing `rand` dependency rather than adding a new
//! token-generation crate.
//!
//! Reaching someone is two separate concerns: `InvitationTarget` is
//! the out-of-band reachability descriptor (host/port/key) shared as
//! a link or QR code so the two sides can open a `Connection` at all;
//! `OneInstanceEndpoint` is the in-band identity each side sends the
//! other once that connection is up, the thing `accept_invitation`
//! actually negotiates.

use crate::canonical::{hash_hex, Hash};
use crate::connection::{Connection, PromisePlugin};
use crate::error::{CoreError, CoreResult};
use crate::identity::Keys;
use crate::trust::{Profile, TrustGraph};
use base64::{engine::general_purpose, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::info;

/// Connection-reachability descriptor bundled into an invitation, the
/// same role `ConnectionInfo` plays in a magic link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationTarget {
    pub host: String,
    pub port: u16,
    pub public_sign_key: String,
}

#[derive(Debug, Clone)]
struct InvitationRecord {
    target: InvitationTarget,
    created_at: i64,
    expires_at: i64,
    used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    pub token: String,
    pub target: InvitationTarget,
    pub expires_at: i64,
}

impl Invitation {
    /// Encode as a URL-safe, base64-wrapped token suitable for sharing
    /// out of band (a QR code, a link), mirroring
    /// `ConnectionInfo::to_magic_link`.
    pub fn to_link(&self) -> CoreResult<String> {
        let json = serde_json::to_string(self)
            .map_err(|e| CoreError::Invalid(format!("encode invitation: {e}")))?;
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(json.as_bytes()))
    }

    pub fn from_link(link: &str) -> CoreResult<Self> {
        let decoded = general_purpose::URL_SAFE_NO_PAD
            .decode(link.trim())
            .map_err(|e| CoreError::Invalid(format!("decode invitation: {e}")))?;
        let json = String::from_utf8(decoded)
            .map_err(|e| CoreError::Invalid(format!("decode invitation: {e}")))?;
        serde_json::from_str(&json).map_err(|e| CoreError::Invalid(format!("decode invitation: {e}")))
    }
}

/// One instance's identity and reachability, exchanged in-band over an
/// open `Connection` so each side can build a `Profile` for the other
/// (§4.5). Distinct from `InvitationTarget`, which only gets the
/// connection open in the first place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneInstanceEndpoint {
    pub person_id: Hash,
    pub instance_id: Hash,
    pub keys: Keys,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command")]
enum PairingMessage {
    #[serde(rename = "pairing_endpoint")]
    Endpoint { token: String, endpoint: OneInstanceEndpoint },
}

/// Which side of a completed pairing this instance played. Only the
/// side that called `create_invitation` owns the `InvitationRecord`
/// and therefore enforces the TTL/single-use rule; the other side is
/// redeeming a token it received out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingDirection {
    WeInvited,
    WeAccepted,
}

type AuthSuccessListener = Box<dyn Fn(&str, PairingDirection, Hash, Hash) + Send + Sync>;

/// Issues, tracks, and redeems pairing invitations. Tokens are opaque
/// random strings; unknown, expired, and already-consumed tokens all
/// fail identically with `CoreError::InvalidToken` so a prober can't
/// distinguish "never existed" from "expired" from "already used".
pub struct PairingManager {
    invitations: RwLock<HashMap<String, InvitationRecord>>,
    token_ttl_secs: i64,
    listeners: RwLock<Vec<AuthSuccessListener>>,
}

impl PairingManager {
    pub fn new(token_ttl_secs: i64) -> Self {
        Self {
            invitations: RwLock::new(HashMap::new()),
            token_ttl_secs,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub async fn on_one_time_auth_success(&self, listener: AuthSuccessListener) {
        self.listeners.write().await.push(listener);
    }

    fn generate_token() -> String {
        let mut bytes = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    pub async fn create_invitation(&self, target: InvitationTarget, now: i64) -> Invitation {
        let token = Self::generate_token();
        let expires_at = now + self.token_ttl_secs;
        self.invitations.write().await.insert(
            token.clone(),
            InvitationRecord {
                target: target.clone(),
                created_at: now,
                expires_at,
                used: false,
            },
        );
        info!("pairing invitation created, expires_at={expires_at}");
        Invitation { token, target, expires_at }
    }

    /// The bookkeeping half of redemption: if we hold the record for
    /// `token` (we're the inviter), enforce TTL/single-use and mark it
    /// consumed; otherwise assume the remote side is the inviter and
    /// we're redeeming a token issued out of band.
    async fn redeem(&self, token: &str, now: i64) -> CoreResult<PairingDirection> {
        let mut invitations = self.invitations.write().await;
        match invitations.get_mut(token) {
            Some(record) => {
                if record.used || now > record.expires_at {
                    return Err(CoreError::InvalidToken);
                }
                record.used = true;
                Ok(PairingDirection::WeInvited)
            }
            None => Ok(PairingDirection::WeAccepted),
        }
    }

    /// Run the §4.5 wire protocol over an already-open `Connection`:
    /// send our `OneInstanceEndpoint`, wait for the counterpart's,
    /// verify it names the expected remote person/instance, persist a
    /// `Profile` for them in `trust`, and fire
    /// `on_one_time_auth_success`. Both sides of a pairing call this
    /// the same way; `redeem` decides which one owns the TTL check.
    #[allow(clippy::too_many_arguments)]
    pub async fn accept_invitation(
        &self,
        conn: &Arc<Connection>,
        promise: &PromisePlugin,
        token: &str,
        now: i64,
        local_person_id: Hash,
        local_instance_id: Hash,
        local_keys: &Keys,
        local_url: &str,
        remote_person_id: Hash,
        remote_instance_id: Hash,
        trust: &TrustGraph,
        timeout_dur: Duration,
    ) -> CoreResult<OneInstanceEndpoint> {
        let direction = self.redeem(token, now).await?;

        let local_endpoint = OneInstanceEndpoint {
            person_id: local_person_id,
            instance_id: local_instance_id,
            keys: local_keys.clone(),
            url: local_url.to_string(),
        };
        let outgoing = PairingMessage::Endpoint { token: token.to_string(), endpoint: local_endpoint };
        let bytes = serde_json::to_vec(&outgoing).map_err(|e| CoreError::Invalid(e.to_string()))?;
        conn.send_message(bytes).await;

        let incoming: PairingMessage =
            promise.wait_for_json_message_with_command("pairing_endpoint", timeout_dur).await?;
        let PairingMessage::Endpoint { endpoint: remote_endpoint, .. } = incoming;

        if remote_endpoint.person_id != remote_person_id || remote_endpoint.instance_id != remote_instance_id {
            return Err(CoreError::Protocol {
                expected: "endpoint for the expected remote person/instance".into(),
                got: "an endpoint naming a different identity".into(),
            });
        }

        let profile = Profile {
            person: remote_endpoint.person_id,
            owner: local_person_id,
            profile_id: hash_hex(&remote_endpoint.instance_id),
            keys: vec![remote_endpoint.keys.public_sign.clone()],
        };
        trust.add_profile(profile).await;

        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener(token, direction, local_person_id, remote_person_id);
        }

        Ok(remote_endpoint)
    }

    pub async fn invalidate(&self, token: &str) {
        self.invitations.write().await.remove(token);
    }

    pub async fn invalidate_all(&self) {
        self.invitations.write().await.clear();
    }

    /// Drop invitations past their TTL; purely a housekeeping helper,
    /// expired tokens already fail `accept_invitation` on their own.
    pub async fn sweep_expired(&self, now: i64) {
        self.invitations.write().await.retain(|_, record| record.expires_at >= now);
    }

    pub async fn pending_count(&self) -> usize {
        self.invitations.read().await.values().filter(|r| !r.used).count()
    }
}
