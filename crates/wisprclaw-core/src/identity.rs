//! Device identity.
//!
//! Every client install owns one Ed25519 keypair. The gateway knows the
//! device by `device_id`, the lowercase-hex SHA-256 of the raw public key,
//! and authenticates it by a signature over the handshake payload.
//!
//! The record lives in a small JSON file:
//!
//! ```json
//! { "deviceId": "…", "publicKeyBase64": "…", "privateKeyBase64": "…" }
//! ```
//!
//! Keys are standard padded base64 at rest. On the wire they use the
//! URL-safe alphabet without padding (see [`encode_url_safe`]).

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Length of an Ed25519 secret seed and public key, in bytes.
const KEY_LEN: usize = 32;

/// A loaded or freshly generated device identity.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: String,
    public_key: Vec<u8>,
    private_key: Vec<u8>,
}

impl DeviceIdentity {
    /// Generate a new random identity. Nothing is persisted.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(&signing_key)
    }

    /// Rebuild an identity from a raw 32-byte private seed.
    pub fn from_private_key(private_key: &[u8]) -> Result<Self, IdentityError> {
        Ok(Self::from_signing_key(&signing_key(private_key)?))
    }

    fn from_signing_key(signing_key: &SigningKey) -> Self {
        let public_key = signing_key.verifying_key().to_bytes().to_vec();
        Self {
            device_id: derive_device_id(&public_key),
            public_key,
            private_key: signing_key.to_bytes().to_vec(),
        }
    }

    /// Content-derived device identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Raw public key bytes.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Public key in wire encoding.
    pub fn public_key_url_safe(&self) -> String {
        encode_url_safe(&self.public_key)
    }

    /// Sign `payload` with this identity's private key.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, IdentityError> {
        sign(payload, &self.private_key)
    }

    fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            device_id: self.device_id.clone(),
            public_key_base64: STANDARD.encode(&self.public_key),
            private_key_base64: STANDARD.encode(&self.private_key),
        }
    }
}

// Keep private key material out of logs.
impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// On-disk shape of the identity file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    device_id: String,
    public_key_base64: String,
    private_key_base64: String,
}

impl IdentityRecord {
    /// Rebuild the identity from the key pair. The stored `deviceId` is not
    /// consulted.
    fn into_identity(self) -> Result<DeviceIdentity, IdentityError> {
        let private_key = STANDARD
            .decode(&self.private_key_base64)
            .map_err(|e| IdentityError::Corrupt(format!("private key: {e}")))?;
        let public_key = STANDARD
            .decode(&self.public_key_base64)
            .map_err(|e| IdentityError::Corrupt(format!("public key: {e}")))?;

        let identity = DeviceIdentity::from_private_key(&private_key)?;
        if identity.public_key != public_key {
            return Err(IdentityError::Corrupt(
                "public key does not match private key".to_string(),
            ));
        }
        Ok(identity)
    }
}

/// Persists the device identity at a fixed path.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Store backed by an explicit file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the per-user default location,
    /// `<config dir>/wisprclaw/identity/device.json`.
    pub fn default_location() -> Result<Self, IdentityError> {
        let base = dirs::config_dir().ok_or(IdentityError::NoConfigDir)?;
        Ok(Self::new(
            base.join("wisprclaw").join("identity").join("device.json"),
        ))
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted identity, or create and persist a new one.
    ///
    /// Never fails: unreadable or corrupt records are replaced, and a
    /// failed write leaves the fresh identity usable in memory only. A record
    /// whose keys are intact but whose `deviceId` is wrong keeps its keys and
    /// is rewritten with the derived id.
    pub fn load_or_create(&self) -> DeviceIdentity {
        match self.read() {
            Ok((stored, identity)) if stored == identity.device_id => return identity,
            Ok((stored, identity)) => {
                tracing::warn!(
                    path = %self.path.display(),
                    stored = %stored,
                    derived = %identity.device_id,
                    "Stored device id does not match key, rewriting record"
                );
                if let Err(e) = self.save(&identity) {
                    tracing::warn!(path = %self.path.display(), error = %e, "Could not persist device identity");
                }
                return identity;
            }
            Err(IdentityError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "No device identity found, generating one");
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Discarding unusable device identity");
            }
        }

        let identity = DeviceIdentity::generate();
        if let Err(e) = self.save(&identity) {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not persist device identity");
        }
        identity
    }

    /// Read and validate the persisted record.
    pub fn load(&self) -> Result<DeviceIdentity, IdentityError> {
        let (stored, identity) = self.read()?;
        if stored != identity.device_id {
            return Err(IdentityError::DeviceIdMismatch {
                stored,
                derived: identity.device_id,
            });
        }
        Ok(identity)
    }

    /// The stored `deviceId` alongside the identity its keys describe.
    fn read(&self) -> Result<(String, DeviceIdentity), IdentityError> {
        let raw = fs::read(&self.path)?;
        let record: IdentityRecord = serde_json::from_slice(&raw)?;
        let stored = record.device_id.clone();
        Ok((stored, record.into_identity()?))
    }

    /// Write the record, creating parent directories as needed. On unix the
    /// file is owner-only before any key material is written.
    pub fn save(&self, identity: &DeviceIdentity) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&identity.to_record())?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;

        // `mode` only applies to new files.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(&json)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Lowercase-hex SHA-256 of the raw public key.
pub fn derive_device_id(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Ed25519 signature over exactly `payload`.
pub fn sign(payload: &[u8], private_key: &[u8]) -> Result<Vec<u8>, IdentityError> {
    Ok(signing_key(private_key)?.sign(payload).to_bytes().to_vec())
}

/// Base64 with the URL-safe alphabet and no padding.
pub fn encode_url_safe(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn signing_key(private_key: &[u8]) -> Result<SigningKey, IdentityError> {
    let seed: [u8; KEY_LEN] = private_key
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyLength(private_key.len()))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Error loading, saving, or using a device identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("identity record is corrupt: {0}")]
    Corrupt(String),
    #[error("stored device id {stored} does not match derived {derived}")]
    DeviceIdMismatch { stored: String, derived: String },
    #[error("private key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("no per-user config directory available")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> IdentityStore {
        IdentityStore::new(dir.path().join("identity").join("device.json"))
    }

    #[test]
    fn load_or_create_is_stable() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let first = store.load_or_create();
        let second = store.load_or_create();
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn deleting_the_file_yields_a_new_identity() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let first = store.load_or_create();
        fs::remove_file(store.path()).unwrap();
        let second = store.load_or_create();
        assert_ne!(first.device_id(), second.device_id());
    }

    #[test]
    fn record_uses_padded_base64_and_hex_id() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let identity = store.load_or_create();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["deviceId"], identity.device_id());
        // 32 bytes encodes to 44 chars with one '=' of padding.
        let public = raw["publicKeyBase64"].as_str().unwrap();
        assert_eq!(public.len(), 44);
        assert!(public.ends_with('='));
        assert_eq!(identity.device_id().len(), 64);
        assert!(identity.device_id().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn garbage_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"not json").unwrap();

        let identity = store.load_or_create();
        assert_eq!(store.load().unwrap(), identity);
    }

    #[test]
    fn tampered_device_id_is_detected_and_repaired() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let original = store.load_or_create();

        let mut raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        raw["deviceId"] = "deadbeef".into();
        fs::write(store.path(), serde_json::to_vec(&raw).unwrap()).unwrap();

        assert!(matches!(
            store.load(),
            Err(IdentityError::DeviceIdMismatch { .. })
        ));
        assert_eq!(store.load_or_create(), original);
        assert_eq!(store.load().unwrap(), original);
    }

    #[test]
    fn mismatched_public_key_is_replaced() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let original = store.load_or_create();

        let mut raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        raw["publicKeyBase64"] = STANDARD.encode(DeviceIdentity::generate().public_key()).into();
        fs::write(store.path(), serde_json::to_vec(&raw).unwrap()).unwrap();

        assert!(matches!(store.load(), Err(IdentityError::Corrupt(_))));
        assert_ne!(store.load_or_create(), original);
    }

    #[cfg(unix)]
    #[test]
    fn identity_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"stale").unwrap();
        fs::set_permissions(store.path(), fs::Permissions::from_mode(0o644)).unwrap();

        let identity = DeviceIdentity::generate();
        store.save(&identity).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(store.load().unwrap(), identity);
    }

    #[test]
    fn unwritable_path_still_returns_identity() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file, not a directory").unwrap();
        let store = IdentityStore::new(blocker.join("device.json"));

        let identity = store.load_or_create();
        assert_eq!(identity.device_id(), derive_device_id(identity.public_key()));
    }

    #[test]
    fn signatures_are_deterministic_and_verify() {
        let identity = DeviceIdentity::generate();
        let payload = b"v1|d1|c|ui|operator|operator.read,operator.write|1000|tok";

        let a = identity.sign(payload).unwrap();
        let b = identity.sign(payload).unwrap();
        assert_eq!(a, b);

        let key: [u8; 32] = identity.public_key().try_into().unwrap();
        let signature = Signature::from_slice(&a).unwrap();
        VerifyingKey::from_bytes(&key)
            .unwrap()
            .verify(payload, &signature)
            .unwrap();

        let other = identity
            .sign(b"v2|d1|c|ui|operator|operator.read,operator.write|1000|tok|nonceX")
            .unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn short_key_is_an_error() {
        assert!(matches!(
            sign(b"payload", &[0u8; 7]),
            Err(IdentityError::InvalidKeyLength(7))
        ));
    }

    #[test]
    fn url_safe_encoding_strips_padding() {
        assert_eq!(encode_url_safe(&[0xfb, 0xff]), "-_8");
        assert_eq!(STANDARD.encode([0xfb, 0xff]), "+/8=");
    }
}
