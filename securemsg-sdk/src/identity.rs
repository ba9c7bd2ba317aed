//! Long-lived identity keys and short-lived ephemeral keys, plus a
//! file-backed identity persistence collaborator.

use std::fs;
use std::io;
use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret as XStaticSecret};

use crate::primitives;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("persisted key material has an invalid length")]
    InvalidLength,
}

/// A long-lived Ed25519 keypair. The hex of the public key is the party's
/// stable identifier.
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand_core::OsRng);
        IdentityKeyPair { signing_key }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        IdentityKeyPair {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Stable hex party identifier.
    pub fn party_id(&self) -> String {
        hex::encode(self.public_key().as_bytes())
    }

    /// 64-byte persisted private form: 32-byte seed || 32-byte public key.
    pub fn to_private_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.signing_key.to_bytes());
        out[32..].copy_from_slice(self.public_key().as_bytes());
        out
    }

    pub fn from_private_bytes(bytes: &[u8; 64]) -> Result<Self, IdentityError> {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[..32]);
        let pair = IdentityKeyPair::from_seed(seed);
        if pair.public_key().as_bytes() != &bytes[32..] {
            return Err(IdentityError::InvalidLength);
        }
        Ok(pair)
    }
}

/// A short-lived X25519 keypair, created per handshake and per ratchet step.
pub struct EphemeralKeyPair {
    pub secret: XStaticSecret,
    pub public: XPublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = XStaticSecret::random_from_rng(rand_core::OsRng);
        let public = primitives::x25519_derive_public(&secret);
        EphemeralKeyPair { secret, public }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "privateKey")]
    private_key: String,
    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
}

/// `load()`/`save()` over a JSON file holding `{publicKey, privateKey,
/// createdAt?}`, written with file mode 0600.
pub trait IdentityStore {
    fn load(&self) -> Result<Option<IdentityKeyPair>, IdentityError>;
    fn save(&self, identity: &IdentityKeyPair) -> Result<(), IdentityError>;
}

pub struct FileIdentityStore {
    path: std::path::PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileIdentityStore {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<IdentityKeyPair>, IdentityError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let persisted: PersistedIdentity = serde_json::from_str(&raw)?;
        let private_bytes = hex::decode(&persisted.private_key).map_err(|_| IdentityError::InvalidLength)?;
        if private_bytes.len() != 64 {
            return Err(IdentityError::InvalidLength);
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&private_bytes);
        Ok(Some(IdentityKeyPair::from_private_bytes(&arr)?))
    }

    fn save(&self, identity: &IdentityKeyPair) -> Result<(), IdentityError> {
        let persisted = PersistedIdentity {
            public_key: hex::encode(identity.public_key().as_bytes()),
            private_key: hex::encode(identity.to_private_bytes()),
            created_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&persisted)?;
        fs::write(&self.path, json)?;
        set_owner_only_permissions(&self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<(), io::Error> {
    Ok(())
}
