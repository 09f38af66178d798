//! Password-protected on-disk container for the root CA.
//!
//! The container is a single file holding the CA certificate and private key
//! PEMs, sealed under a password: the key is stretched with
//! PBKDF2-HMAC-SHA256 and the payload encrypted with AES-256-GCM, the salt
//! doubling as AAD. A wrong password surfaces as an AEAD open failure and is
//! reported as [`CaError::BadPassword`].
//!
//! Layout: `magic (8) | version (1) | salt (32) | nonce (12) | ciphertext`.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::CaError;

/// Fixed filename of the CA container inside the state directory.
pub const CA_CONTAINER_FILE: &str = "mitmproxy-ca.sealed";

const MAGIC: &[u8; 8] = b"SNTCHRCA";
const VERSION: u8 = 1;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};

fn derive_key(password: &str, salt: &[u8]) -> Result<LessSafeKey, CaError> {
    let mut key_bytes = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        salt,
        password.as_bytes(),
        &mut key_bytes,
    );
    let unbound =
        UnboundKey::new(&aead::AES_256_GCM, &key_bytes).map_err(|_| CaError::crypto("bad key"))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal `plaintext` under `password` into a container blob.
pub fn seal(plaintext: &[u8], password: &str) -> Result<Vec<u8>, CaError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut salt)
        .map_err(|_| CaError::crypto("system RNG failure"))?;
    rng.fill(&mut nonce_bytes)
        .map_err(|_| CaError::crypto("system RNG failure"))?;

    let key = derive_key(password, &salt)?;
    let mut sealed = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(&salt),
        &mut sealed,
    )
    .map_err(|_| CaError::crypto("AEAD seal failure"))?;

    let mut out = Vec::with_capacity(MAGIC.len() + 1 + SALT_LEN + NONCE_LEN + sealed.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a container blob with `password`, returning the plaintext.
pub fn open(container: &[u8], password: &str) -> Result<Vec<u8>, CaError> {
    let header_len = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;
    if container.len() < header_len + TAG_LEN || &container[..MAGIC.len()] != MAGIC {
        return Err(CaError::crypto("not a CA container"));
    }
    if container[MAGIC.len()] != VERSION {
        return Err(CaError::crypto(format!(
            "unsupported container version {}",
            container[MAGIC.len()]
        )));
    }
    let salt_start = MAGIC.len() + 1;
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&container[salt_start..salt_start + SALT_LEN]);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&container[salt_start + SALT_LEN..header_len]);

    let key = derive_key(password, &salt)?;
    let mut sealed = container[header_len..].to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&salt),
            &mut sealed,
        )
        .map_err(|_| CaError::BadPassword)?;
    Ok(plaintext.to_vec())
}

/// Storage port for the sealed container, so tests and embedders can swap the
/// filesystem out.
pub trait CaStorage: Send + Sync {
    /// Raw container bytes, or `None` if no container exists yet.
    fn load(&self) -> Result<Option<Vec<u8>>, CaError>;

    fn store(&self, bytes: &[u8]) -> Result<(), CaError>;
}

/// Filesystem-backed storage: one fixed-name file in a state directory.
pub struct FsCaStorage {
    path: PathBuf,
}

impl FsCaStorage {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        FsCaStorage {
            path: state_dir.as_ref().join(CA_CONTAINER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaStorage for FsCaStorage {
    fn load(&self) -> Result<Option<Vec<u8>>, CaError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CaError::io(format!(
                "reading {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn store(&self, bytes: &[u8]) -> Result<(), CaError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CaError::io(format!("creating {}: {e}", parent.display())))?;
        }
        std::fs::write(&self.path, bytes)
            .map_err(|e| CaError::io(format!("writing {}: {e}", self.path.display())))?;

        // The container holds a private key; keep it owner-readable only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CaError::io(format!("chmod {}: {e}", self.path.display())))?;
        }

        Ok(())
    }
}

/// In-memory storage for tests and ephemeral embedders.
#[derive(Default)]
pub struct MemoryCaStorage {
    bytes: RwLock<Option<Vec<u8>>>,
}

impl MemoryCaStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaStorage for MemoryCaStorage {
    fn load(&self) -> Result<Option<Vec<u8>>, CaError> {
        Ok(self
            .bytes
            .read()
            .map_err(|_| CaError::io("storage lock poisoned"))?
            .clone())
    }

    fn store(&self, bytes: &[u8]) -> Result<(), CaError> {
        *self
            .bytes
            .write()
            .map_err(|_| CaError::io("storage lock poisoned"))? = Some(bytes.to_vec());
        Ok(())
    }
}
