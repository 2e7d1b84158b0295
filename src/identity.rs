//! Identity & Keychain (§4.2).
//!
//! Per-instance/per-person key material, id-hash derivation, and the
//! signing/encryption primitives the rest of the core builds on.
//! Grounded on `persistence::Identity` (load-or-generate an ed25519
//! keypair from the config dir) generalized to the full contract:
//! X25519 session keys for the connection handshake, a symmetric
//! cipher for the encrypted channel, and a scrypt-class KDF for
//! unlocking private key halves from a user secret.

use crate::canonical::{canonical_hash, hash_bytes, Hash};
use crate::error::{CoreError, CoreResult};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Stable identity hash for a Person, derived only from their
/// canonicalized email (data model invariant: id-hash depends only on
/// email).
pub fn derive_person_id(email: &str) -> Hash {
    let canon = email.trim().to_lowercase();
    hash_bytes(canon.as_bytes())
}

/// Stable identity hash for an Instance, derived from its owning
/// Person id-hash and instance name.
pub fn derive_instance_id(owner: &Hash, name: &str) -> Hash {
    let mut input = Vec::with_capacity(32 + name.len());
    input.extend_from_slice(owner);
    input.extend_from_slice(name.as_bytes());
    hash_bytes(&input)
}

/// Immutable object: a person's sign/encrypt public keys, plus
/// (optionally) their symmetrically-encrypted private halves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keys {
    #[serde(rename = "$type$")]
    pub type_tag: String,
    pub public_sign: String,
    pub public_encrypt: String,
    #[serde(default)]
    pub encrypted_sign_private: Option<String>,
    #[serde(default)]
    pub encrypted_encrypt_private: Option<String>,
}

impl Keys {
    pub fn public_only(sign: &VerifyingKey, encrypt: &X25519PublicKey) -> Self {
        Self {
            type_tag: "Keys".to_string(),
            public_sign: hex::encode(sign.as_bytes()),
            public_encrypt: hex::encode(encrypt.as_bytes()),
            encrypted_sign_private: None,
            encrypted_encrypt_private: None,
        }
    }

    pub fn id_hash(&self) -> CoreResult<Hash> {
        canonical_hash(&IdSubset {
            public_sign: self.public_sign.clone(),
            public_encrypt: self.public_encrypt.clone(),
        })
    }
}

#[derive(Serialize)]
struct IdSubset {
    public_sign: String,
    public_encrypt: String,
}

/// Immutable object: an ed25519 signature over a stored hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    #[serde(rename = "$type$")]
    pub type_tag: String,
    pub issuer: String,
    pub data: String,
    pub signature_bytes: String,
}

/// Locally-held complete key material: both public keys and both
/// private halves, in memory only (never serialized as-is).
#[derive(Clone)]
pub struct CompleteKeys {
    pub signing_key: Arc<SigningKey>,
    pub verifying_key: VerifyingKey,
    pub encrypt_secret: Arc<StaticSecret>,
    pub encrypt_public: X25519PublicKey,
}

impl CompleteKeys {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let encrypt_secret = StaticSecret::random_from_rng(OsRng);
        let encrypt_public = X25519PublicKey::from(&encrypt_secret);
        Self {
            signing_key: Arc::new(signing_key),
            verifying_key,
            encrypt_secret: Arc::new(encrypt_secret),
            encrypt_public,
        }
    }

    /// Load from disk (two raw 32-byte key files) or generate fresh,
    /// mirroring `persistence::Identity::load_or_generate`.
    pub fn load_or_generate(dir: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| CoreError::Storage(e.to_string()))?;
        let sign_path = dir.join("sign.key");
        let encrypt_path = dir.join("encrypt.key");

        let signing_key = if sign_path.exists() {
            let bytes = std::fs::read(&sign_path).map_err(|e| CoreError::Storage(e.to_string()))?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| CoreError::Invalid("sign key file has wrong length".into()))?;
            SigningKey::from_bytes(&arr)
        } else {
            let key = SigningKey::generate(&mut OsRng);
            std::fs::write(&sign_path, key.to_bytes()).map_err(|e| CoreError::Storage(e.to_string()))?;
            info!("generated new sign key at {:?}", sign_path);
            key
        };

        let encrypt_secret = if encrypt_path.exists() {
            let bytes = std::fs::read(&encrypt_path).map_err(|e| CoreError::Storage(e.to_string()))?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| CoreError::Invalid("encrypt key file has wrong length".into()))?;
            StaticSecret::from(arr)
        } else {
            let key = StaticSecret::random_from_rng(OsRng);
            std::fs::write(&encrypt_path, key.to_bytes()).map_err(|e| CoreError::Storage(e.to_string()))?;
            info!("generated new encrypt key at {:?}", encrypt_path);
            key
        };

        let verifying_key = signing_key.verifying_key();
        let encrypt_public = X25519PublicKey::from(&encrypt_secret);

        Ok(Self {
            signing_key: Arc::new(signing_key),
            verifying_key,
            encrypt_secret: Arc::new(encrypt_secret),
            encrypt_public,
        })
    }

    pub fn keys_object(&self) -> Keys {
        Keys::public_only(&self.verifying_key, &self.encrypt_public)
    }

    /// Sign a stored hash, producing an immutable `Signature` object.
    pub fn sign(&self, data: &Hash, issuer: &Hash) -> Signature {
        let sig = self.signing_key.sign(data);
        Signature {
            type_tag: "Signature".to_string(),
            issuer: hex::encode(issuer),
            data: hex::encode(data),
            signature_bytes: hex::encode(sig.to_bytes()),
        }
    }
}

/// Every `CompleteKeys` this instance holds the private halves for,
/// indexed by the person each identity belongs to. A person may run
/// several local instances (laptop, phone), each with its own key
/// pair, so the index maps to a `Vec`. Distinct from
/// `trust::TrustGraph::keys_for_person`, which answers "what public
/// keys does a profile say this person has" — a read-only query over
/// other people's profiles, not what we locally hold private material
/// for.
pub struct Keychain {
    by_person: RwLock<HashMap<Hash, Vec<CompleteKeys>>>,
}

impl Keychain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { by_person: RwLock::new(HashMap::new()) })
    }

    pub async fn add(&self, person: Hash, keys: CompleteKeys) {
        self.by_person.write().await.entry(person).or_default().push(keys);
    }

    /// §4.2 `get_complete_keys`: the locally-held `Keys` objects for
    /// which we also possess the private halves, for one person.
    pub async fn get_complete_keys(&self, person: &Hash) -> Vec<Keys> {
        self.by_person
            .read()
            .await
            .get(person)
            .map(|keys| keys.iter().map(CompleteKeys::keys_object).collect())
            .unwrap_or_default()
    }

    /// The full `CompleteKeys` (private halves included) for one
    /// person, for callers that need to actually sign or decrypt
    /// rather than just advertise a public `Keys` object.
    pub async fn complete_keys_for(&self, person: &Hash) -> Vec<CompleteKeys> {
        self.by_person.read().await.get(person).cloned().unwrap_or_default()
    }
}

/// Verify a `Signature` against a candidate public sign-key. Callers
/// are responsible for only trusting the result when the Trust Graph
/// attests the key belongs to the claimed issuer (§4.2 invariant).
pub fn verify(signature: &Signature, public_sign_key_hex: &str) -> bool {
    let Ok(key_bytes) = hex::decode(public_sign_key_hex) else { return false };
    let Ok(key_arr): Result<[u8; 32], _> = key_bytes.try_into() else { return false };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_arr) else { return false };

    let Ok(sig_bytes) = hex::decode(&signature.signature_bytes) else { return false };
    let Ok(sig_arr): Result<[u8; 64], _> = sig_bytes.try_into() else { return false };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_arr);

    let Ok(data) = hex::decode(&signature.data) else { return false };
    verifying_key.verify(&data, &sig).is_ok()
}

/// Derive a shared session key via X25519 ECDH between our static
/// secret and the remote's static public key. Used both for the
/// long-term "wrapping" key in step 4 of the handshake and, with
/// ephemeral keys, for the resulting forward-secret session key.
pub fn derive_session_key(remote_public_hex: &str, local_secret: &StaticSecret) -> CoreResult<[u8; 32]> {
    let bytes = hex::decode(remote_public_hex).map_err(|e| CoreError::Invalid(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CoreError::Invalid("public key must be 32 bytes".into()))?;
    let remote_public = X25519PublicKey::from(arr);
    let shared = local_secret.diffie_hellman(&remote_public);
    Ok(*shared.as_bytes())
}

/// Symmetrically encrypt `plaintext` under `shared_key` with a fresh
/// random nonce, prefixed to the ciphertext.
pub fn symmetric_encrypt(shared_key: &[u8; 32], plaintext: &[u8]) -> CoreResult<Vec<u8>> {
    let unbound = UnboundKey::new(&CHACHA20_POLY1305, shared_key)
        .map_err(|_| CoreError::Invalid("bad symmetric key length".into()))?;
    let key = LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CoreError::Invalid("encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Inverse of `symmetric_encrypt`.
pub fn symmetric_decrypt(shared_key: &[u8; 32], ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
    if ciphertext.len() < NONCE_LEN {
        return Err(CoreError::Invalid("ciphertext too short".into()));
    }
    let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
    let nonce_arr: [u8; NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| CoreError::Invalid("bad nonce length".into()))?;

    let unbound = UnboundKey::new(&CHACHA20_POLY1305, shared_key)
        .map_err(|_| CoreError::Invalid("bad symmetric key length".into()))?;
    let key = LessSafeKey::new(unbound);
    let nonce = Nonce::assume_unique_for_key(nonce_arr);

    let mut buf = sealed.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut buf)
        .map_err(|_| CoreError::Invalid("decryption failed".into()))?;
    Ok(plaintext.to_vec())
}

/// Deterministic scrypt-class KDF used to unlock private key halves
/// from a user-supplied secret.
pub fn derive_from_secret(user_secret: &[u8], nonce: &[u8], length: usize) -> CoreResult<Vec<u8>> {
    let params = scrypt::Params::new(15, 8, 1, length)
        .map_err(|e| CoreError::Invalid(format!("bad scrypt params: {e}")))?;
    let mut out = vec![0u8; length];
    scrypt::scrypt(user_secret, nonce, &params, &mut out)
        .map_err(|e| CoreError::Invalid(format!("scrypt failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn person_id_stable_across_case_and_whitespace() {
        let a = derive_person_id("Alice@Example.com");
        let b = derive_person_id("  alice@example.com  ");
        assert_eq!(a, b);
    }

    #[test]
    fn instance_id_depends_on_owner_and_name() {
        let owner = derive_person_id("alice@example.com");
        let a = derive_instance_id(&owner, "laptop");
        let b = derive_instance_id(&owner, "phone");
        assert_ne!(a, b);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keys = CompleteKeys::generate();
        let person = derive_person_id("alice@example.com");
        let data = hash_bytes(b"some payload");
        let sig = keys.sign(&data, &person);
        assert!(verify(&sig, &hex::encode(keys.verifying_key.as_bytes())));
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let keys = CompleteKeys::generate();
        let person = derive_person_id("alice@example.com");
        let data = hash_bytes(b"some payload");
        let mut sig = keys.sign(&data, &person);
        sig.data = hex::encode(hash_bytes(b"different payload"));
        assert!(!verify(&sig, &hex::encode(keys.verifying_key.as_bytes())));
    }

    #[test]
    fn identity_persists_across_loads() {
        let dir = tempdir().unwrap();
        let k1 = CompleteKeys::load_or_generate(dir.path()).unwrap();
        let k2 = CompleteKeys::load_or_generate(dir.path()).unwrap();
        assert_eq!(k1.verifying_key, k2.verifying_key);
        assert_eq!(k1.encrypt_public.as_bytes(), k2.encrypt_public.as_bytes());
    }

    #[test]
    fn session_key_agreement_matches_both_sides() {
        let a = CompleteKeys::generate();
        let b = CompleteKeys::generate();
        let a_pub = hex::encode(a.encrypt_public.as_bytes());
        let b_pub = hex::encode(b.encrypt_public.as_bytes());

        let shared_a = derive_session_key(&b_pub, &a.encrypt_secret).unwrap();
        let shared_b = derive_session_key(&a_pub, &b.encrypt_secret).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn symmetric_encrypt_decrypt_round_trip() {
        let key = [7u8; 32];
        let ciphertext = symmetric_encrypt(&key, b"hello world").unwrap();
        let plaintext = symmetric_decrypt(&key, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[test]
    fn symmetric_decrypt_fails_with_wrong_key() {
        let key = [7u8; 32];
        let other = [9u8; 32];
        let ciphertext = symmetric_encrypt(&key, b"hello world").unwrap();
        assert!(symmetric_decrypt(&other, &ciphertext).is_err());
    }

    #[test]
    fn derive_from_secret_is_deterministic() {
        let a = derive_from_secret(b"correct horse battery staple", b"nonce1", 32).unwrap();
        let b = derive_from_secret(b"correct horse battery staple", b"nonce1", 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn derive_from_secret_differs_by_nonce() {
        let a = derive_from_secret(b"secret", b"nonce1", 32).unwrap();
        let b = derive_from_secret(b"secret", b"nonce2", 32).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn keychain_returns_only_keys_for_requested_person() {
        let keychain = Keychain::new();
        let alice = derive_person_id("alice@example.com");
        let bob = derive_person_id("bob@example.com");
        let alice_keys = CompleteKeys::generate();
        let bob_keys = CompleteKeys::generate();
        keychain.add(alice, alice_keys.clone()).await;
        keychain.add(bob, bob_keys).await;

        let found = keychain.get_complete_keys(&alice).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].public_sign, alice_keys.keys_object().public_sign);
    }

    #[tokio::test]
    async fn keychain_get_complete_keys_empty_for_unknown_person() {
        let keychain = Keychain::new();
        let stranger = derive_person_id("stranger@example.com");
        assert!(keychain.get_complete_keys(&stranger).await.is_empty());
    }

    #[tokio::test]
    async fn keychain_holds_multiple_instances_for_one_person() {
        let keychain = Keychain::new();
        let alice = derive_person_id("alice@example.com");
        keychain.add(alice, CompleteKeys::generate()).await;
        keychain.add(alice, CompleteKeys::generate()).await;
        assert_eq!(keychain.get_complete_keys(&alice).await.len(), 2);
    }
}
