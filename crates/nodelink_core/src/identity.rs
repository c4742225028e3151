use crate::{NodeLinkError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

/// Ed25519 keypair of this node plus the device id derived from it.
pub struct DeviceIdentity {
    signing_key: Secret<[u8; 32]>,
    public_key: [u8; 32],
    device_id: String,
}

impl Clone for DeviceIdentity {
    fn clone(&self) -> Self {
        Self {
            signing_key: Secret::new(*self.signing_key.expose_secret()),
            public_key: self.public_key,
            device_id: self.device_id.clone(),
        }
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("signing_key", &"[REDACTED]")
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl DeviceIdentity {
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| NodeLinkError::Crypto(format!("Failed to gather entropy: {}", e)))?;

        let identity = Self::from_seed(seed);
        seed.fill(0);
        Ok(identity)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes();

        Self {
            signing_key: Secret::new(seed),
            public_key,
            device_id: device_id_for(&public_key),
        }
    }

    /// Load the seed stored at `path`, or generate one and store it there.
    pub async fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = tokio::fs::read_to_string(path).await?;
            let bytes = hex::decode(contents.trim()).map_err(|e| {
                NodeLinkError::Crypto(format!("Invalid key file {}: {}", path.display(), e))
            })?;
            let seed: [u8; 32] = bytes.try_into().map_err(|_| {
                NodeLinkError::Crypto(format!("Key file {} must hold 32 bytes", path.display()))
            })?;

            let identity = Self::from_seed(seed);
            debug!("Loaded device identity {}", identity.device_id);
            return Ok(identity);
        }

        let identity = Self::generate()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, hex::encode(identity.signing_key.expose_secret())).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, permissions)?;
        }

        info!(
            "Generated new device identity {} at {}",
            identity.device_id,
            path.display()
        );
        Ok(identity)
    }

    pub fn public_key_bytes(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn public_key_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public_key)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signing_key = SigningKey::from_bytes(self.signing_key.expose_secret());
        signing_key.sign(message).to_bytes()
    }
}

/// Lowercase hex SHA-256 of the raw public key.
pub fn device_id_for(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<bool> {
    let public_key_array: [u8; 32] = public_key_bytes
        .try_into()
        .map_err(|_| NodeLinkError::Crypto("Invalid public key length".to_string()))?;

    let signature_array: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| NodeLinkError::Crypto("Invalid signature length".to_string()))?;

    let verifying_key = VerifyingKey::from_bytes(&public_key_array)
        .map_err(|e| NodeLinkError::Crypto(format!("Invalid public key: {}", e)))?;

    let signature = Signature::from_bytes(&signature_array);

    Ok(verifying_key.verify(message, &signature).is_ok())
}
