//! Trust Graph (§4.3).
//!
//! Decides, for every known public sign-key, whether it is trusted —
//! via the stack-based dynamic-programming walk specified in §4.3.
//! Root keys are always trusted; everything else is trusted only
//! through a chain of certificates whose issuers hold the matching
//! right and whose own signing key is, recursively, trusted.
//!
//! Grounded on `moderation::check_permission`'s
//! `Result<(), &'static str>` permission-check shape (generalized to
//! `CoreResult<()>`) and on `pow.rs`'s style of small, independently
//! testable pure functions for the recursive step.

use crate::canonical::{canonical_hash, Hash};
use crate::error::CoreResult;
use crate::identity::{verify, CompleteKeys, Signature};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    Affirmation,
    TrustKeys,
    RightToDeclareTrustedKeysForEverybody,
    RightToDeclareTrustedKeysForSelf,
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub person: Hash,
    pub owner: Hash,
    pub profile_id: String,
    pub keys: Vec<String>,
}

impl Profile {
    pub fn id_hash(&self) -> Hash {
        // (person, owner, profileId) per the data model table.
        let mut input = Vec::new();
        input.extend_from_slice(&self.person);
        input.extend_from_slice(&self.owner);
        input.extend_from_slice(self.profile_id.as_bytes());
        crate::canonical::hash_bytes(&input)
    }
}

#[derive(Debug, Clone)]
pub struct License {
    pub kind: CertificateKind,
}

#[derive(Debug, Clone)]
pub struct Certificate {
    pub kind: CertificateKind,
    pub issuer: Hash,
    pub subject: Hash,
    pub license: Hash,
}

impl Certificate {
    pub fn hash(&self) -> Hash {
        let mut input = Vec::new();
        input.extend_from_slice(&self.issuer);
        input.extend_from_slice(&self.subject);
        input.extend_from_slice(&self.license);
        input.push(self.kind as u8);
        crate::canonical::hash_bytes(&input)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rights {
    pub everybody: bool,
    pub self_: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrustSource {
    pub issuer: Hash,
    pub kind: CertificateKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrustResult {
    pub trusted: bool,
    pub reason: &'static str,
    pub sources: Vec<TrustSource>,
}

pub struct TrustGraph {
    root_keys: RwLock<HashSet<String>>,
    profiles: RwLock<HashMap<Hash, Profile>>,
    certs_by_profile: RwLock<HashMap<Hash, Vec<(Certificate, Signature)>>>,
    rights_certs: RwLock<Vec<(Certificate, Signature)>>,
    cache: RwLock<HashMap<String, TrustResult>>,
}

impl TrustGraph {
    pub fn new() -> Self {
        Self {
            root_keys: RwLock::new(HashSet::new()),
            profiles: RwLock::new(HashMap::new()),
            certs_by_profile: RwLock::new(HashMap::new()),
            rights_certs: RwLock::new(Vec::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register a root key: a public sign-key whose private half we
    /// hold locally for MainId or any of our identities.
    pub async fn add_root_key(&self, key_hex: &str) {
        self.root_keys.write().await.insert(key_hex.to_string());
        self.invalidate().await;
    }

    pub async fn add_profile(&self, profile: Profile) {
        self.profiles.write().await.insert(profile.id_hash(), profile);
        self.invalidate().await;
    }

    /// Attach a certificate+signature pair. Rights-granting
    /// certificates (`RightToDeclareTrustedKeysFor*`) are tracked
    /// separately since they key off the *subject person*, not a
    /// profile; all other kinds attach to the profile named by
    /// `cert.subject`.
    pub async fn add_certificate(&self, cert: Certificate, signature: Signature) {
        match cert.kind {
            CertificateKind::RightToDeclareTrustedKeysForEverybody
            | CertificateKind::RightToDeclareTrustedKeysForSelf => {
                self.rights_certs.write().await.push((cert, signature));
            }
            CertificateKind::TrustKeys | CertificateKind::Affirmation => {
                self.certs_by_profile
                    .write()
                    .await
                    .entry(cert.subject)
                    .or_default()
                    .push((cert, signature));
            }
        }
        self.invalidate().await;
    }

    async fn invalidate(&self) {
        self.cache.write().await.clear();
    }

    /// Rebuild every cached key-trust result under a single writer
    /// lock, atomic w.r.t. external readers: a concurrent reader
    /// either observes the fully-old map (lock still held) or the
    /// fully-new one (lock released), never a partial rewrite.
    pub async fn rebuild(&self) {
        let keys = self.all_known_keys().await;
        let mut fresh = HashMap::new();
        for key in keys {
            let mut stack = Vec::new();
            let result = self.trust_uncached(&key, &mut stack, &fresh).await;
            fresh.insert(key, result);
        }
        *self.cache.write().await = fresh;
        info!("trust graph rebuilt");
    }

    async fn all_known_keys(&self) -> HashSet<String> {
        let mut keys: HashSet<String> = self.root_keys.read().await.iter().cloned().collect();
        for profile in self.profiles.read().await.values() {
            keys.extend(profile.keys.iter().cloned());
        }
        keys
    }

    /// Keys known for a person across any profile referencing them.
    pub async fn keys_for_person(&self, person: &Hash) -> Vec<String> {
        self.profiles
            .read()
            .await
            .values()
            .filter(|p| &p.person == person)
            .flat_map(|p| p.keys.iter().cloned())
            .collect()
    }

    /// Rights derived from certificates signed directly by a root
    /// key — the foundation of the whole graph.
    pub async fn rights_of(&self, person: &Hash) -> Rights {
        let root_keys = self.root_keys.read().await;
        let mut rights = Rights::default();
        for (cert, sig) in self.rights_certs.read().await.iter() {
            if &cert.subject != person {
                continue;
            }
            let issuer_keys = self.keys_for_person(&cert.issuer).await;
            let signed_by_root = issuer_keys
                .iter()
                .filter(|k| root_keys.contains(*k))
                .any(|k| verify(sig, k));
            if signed_by_root {
                match cert.kind {
                    CertificateKind::RightToDeclareTrustedKeysForEverybody => rights.everybody = true,
                    CertificateKind::RightToDeclareTrustedKeysForSelf => rights.self_ = true,
                    _ => {}
                }
            }
        }
        rights
    }

    pub async fn is_key_trusted(&self, key_hex: &str) -> bool {
        if let Some(cached) = self.cache.read().await.get(key_hex) {
            return cached.trusted;
        }
        let mut stack = Vec::new();
        let empty = HashMap::new();
        let result = self.trust_uncached(key_hex, &mut stack, &empty).await;
        self.cache
            .write()
            .await
            .insert(key_hex.to_string(), result.clone());
        result.trusted
    }

    fn trust_uncached<'a>(
        &'a self,
        key_hex: &'a str,
        stack: &'a mut Vec<String>,
        partial: &'a HashMap<String, TrustResult>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = TrustResult> + 'a>> {
        Box::pin(async move {
            if stack.contains(&key_hex.to_string()) {
                return TrustResult { trusted: false, reason: "cycle", sources: Vec::new() };
            }
            if self.root_keys.read().await.contains(key_hex) {
                return TrustResult { trusted: true, reason: "root", sources: Vec::new() };
            }
            if let Some(cached) = partial.get(key_hex) {
                return cached.clone();
            }
            if let Some(cached) = self.cache.read().await.get(key_hex) {
                return cached.clone();
            }

            stack.push(key_hex.to_string());
            let mut result = TrustResult { trusted: false, reason: "no path", sources: Vec::new() };

            let profiles_referencing: Vec<Profile> = self
                .profiles
                .read()
                .await
                .values()
                .filter(|p| p.keys.iter().any(|k| k == key_hex))
                .cloned()
                .collect();

            for profile in profiles_referencing {
                let id_hash = profile.id_hash();
                let certs = self
                    .certs_by_profile
                    .read()
                    .await
                    .get(&id_hash)
                    .cloned()
                    .unwrap_or_default();

                for (cert, sig) in certs {
                    let issuer_keys = self.keys_for_person(&cert.issuer).await;
                    let used_key = issuer_keys.iter().find(|k| verify(&sig, k)).cloned();
                    let Some(used_key) = used_key else { continue };

                    let rights = self.rights_of(&cert.issuer).await;
                    let applies = match cert.kind {
                        CertificateKind::TrustKeys => rights.everybody,
                        CertificateKind::Affirmation => rights.self_,
                        _ => false,
                    };
                    if !applies {
                        continue;
                    }

                    let sub = self.trust_uncached(&used_key, stack, partial).await;
                    if sub.trusted {
                        result.trusted = true;
                        result.reason = "certified";
                        result.sources.push(TrustSource { issuer: cert.issuer, kind: cert.kind });
                    }
                }
            }

            stack.pop();
            result
        })
    }

    /// Persons with at least one signature over `data_hash` that
    /// verifies against a key that is (currently) trusted for them.
    pub async fn signed_by(&self, data_hash: &Hash, signatures: &[(Hash, Signature)]) -> Vec<Hash> {
        let mut persons = Vec::new();
        for (person, sig) in signatures {
            if hex::decode(&sig.data).ok().as_deref() != Some(data_hash.as_slice()) {
                continue;
            }
            let keys = self.keys_for_person(person).await;
            for key in &keys {
                if verify(sig, key) && self.is_key_trusted(key).await {
                    persons.push(*person);
                    break;
                }
            }
        }
        persons
    }

    /// Issue `{license, certificate, signature}` as one logical unit.
    /// `issuer` defaults to the caller's own main identity.
    pub fn certify(
        keys: &CompleteKeys,
        issuer: &Hash,
        kind: CertificateKind,
        subject: Hash,
    ) -> CoreResult<(License, Certificate, Signature)> {
        let license = License { kind };
        let license_hash = canonical_hash(&LicenseWire { kind_tag: kind_tag(kind) })?;
        let cert = Certificate { kind, issuer: *issuer, subject, license: license_hash };
        let cert_hash = cert.hash();
        let sig = keys.sign(&cert_hash, issuer);
        Ok((license, cert, sig))
    }

    pub fn affirm(
        keys: &CompleteKeys,
        issuer: &Hash,
        data_hash: Hash,
    ) -> CoreResult<(License, Certificate, Signature)> {
        Self::certify(keys, issuer, CertificateKind::Affirmation, data_hash)
    }

    pub async fn is_affirmed_by(&self, data_hash: &Hash, issuer: &Hash) -> bool {
        if let Some(certs) = self.certs_by_profile.read().await.get(data_hash) {
            let issuer_keys = self.keys_for_person(issuer).await;
            return certs.iter().any(|(cert, sig)| {
                cert.kind == CertificateKind::Affirmation
                    && &cert.issuer == issuer
                    && issuer_keys.iter().any(|k| verify(sig, k))
            });
        }
        false
    }

    pub async fn affirmed_by(&self, data_hash: &Hash) -> Vec<Hash> {
        let certs = self
            .certs_by_profile
            .read()
            .await
            .get(data_hash)
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::new();
        for (cert, sig) in certs {
            if cert.kind != CertificateKind::Affirmation {
                continue;
            }
            let issuer_keys = self.keys_for_person(&cert.issuer).await;
            if issuer_keys.iter().any(|k| verify(&sig, k)) {
                out.push(cert.issuer);
            }
        }
        out
    }
}

impl Default for TrustGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(serde::Serialize)]
struct LicenseWire {
    kind_tag: &'static str,
}

fn kind_tag(kind: CertificateKind) -> &'static str {
    match kind {
        CertificateKind::Affirmation => "Affirmation",
        CertificateKind::TrustKeys => "TrustKeys",
        CertificateKind::RightToDeclareTrustedKeysForEverybody => "RightEverybody",
        CertificateKind::RightToDeclareTrustedKeysForSelf => "RightSelf",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hexkey(n: u8) -> String {
        hex::encode([n; 32])
    }

    #[tokio::test]
    async fn root_key_is_always_trusted() {
        let graph = TrustGraph::new();
        let root = hexkey(1);
        graph.add_root_key(&root).await;
        assert!(graph.is_key_trusted(&root).await);
    }

    #[tokio::test]
    async fn unknown_key_is_not_trusted() {
        let graph = TrustGraph::new();
        assert!(!graph.is_key_trusted(&hexkey(9)).await);
    }

    #[tokio::test]
    async fn trust_propagates_through_trust_keys_certificate() {
        let graph = TrustGraph::new();
        let me_keys = CompleteKeys::generate();
        let me_sign_hex = hex::encode(me_keys.verifying_key.as_bytes());
        graph.add_root_key(&me_sign_hex).await;

        let me_person = crate::identity::derive_person_id("me@example.com");
        let other_person = crate::identity::derive_person_id("other@example.com");
        let other_keys = CompleteKeys::generate();
        let other_sign_hex = hex::encode(other_keys.verifying_key.as_bytes());

        let profile = Profile {
            person: other_person,
            owner: me_person,
            profile_id: "p1".to_string(),
            keys: vec![other_sign_hex.clone()],
        };
        let profile_hash = profile.id_hash();
        graph.add_profile(profile).await;

        // root key implicitly has everybody-rights over itself (me_person
        // isn't the root hex, so grant it explicitly via a rights cert).
        let (_, right_cert, right_sig) = TrustGraph::certify(
            &me_keys,
            &me_person,
            CertificateKind::RightToDeclareTrustedKeysForEverybody,
            me_person,
        )
        .unwrap();
        graph.add_certificate(right_cert, right_sig).await;

        let me_profile = Profile {
            person: me_person,
            owner: me_person,
            profile_id: "self".to_string(),
            keys: vec![me_sign_hex.clone()],
        };
        graph.add_profile(me_profile).await;

        let (_, trust_cert, trust_sig) = TrustGraph::certify(
            &me_keys,
            &me_person,
            CertificateKind::TrustKeys,
            profile_hash,
        )
        .unwrap();
        graph.add_certificate(trust_cert, trust_sig).await;

        assert!(graph.is_key_trusted(&other_sign_hex).await);
    }

    #[tokio::test]
    async fn affirm_and_query_round_trip() {
        let graph = TrustGraph::new();
        let issuer_keys = CompleteKeys::generate();
        let issuer_person = crate::identity::derive_person_id("issuer@example.com");
        let issuer_sign_hex = hex::encode(issuer_keys.verifying_key.as_bytes());

        let issuer_profile = Profile {
            person: issuer_person,
            owner: issuer_person,
            profile_id: "self".to_string(),
            keys: vec![issuer_sign_hex],
        };
        graph.add_profile(issuer_profile).await;

        let data_hash = crate::canonical::hash_bytes(b"some document");
        let (_, cert, sig) = TrustGraph::affirm(&issuer_keys, &issuer_person, data_hash).unwrap();
        graph.add_certificate(cert, sig).await;

        assert!(graph.is_affirmed_by(&data_hash, &issuer_person).await);
        assert_eq!(graph.affirmed_by(&data_hash).await, vec![issuer_person]);
    }

    #[tokio::test]
    async fn rebuild_resets_cache_without_losing_root_trust() {
        let graph = TrustGraph::new();
        let root = hexkey(3);
        graph.add_root_key(&root).await;
        assert!(graph.is_key_trusted(&root).await);
        graph.rebuild().await;
        assert!(graph.is_key_trusted(&root).await);
    }
}
