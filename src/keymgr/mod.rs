//! Cluster key manager.
//!
//! Provisions, persists, loads, and rotates the cluster's internal
//! data-encryption keys (DEKs). DEKs are generated once at bootstrap and
//! never change; on disk they are stored wrapped under a key-encryption key
//! (KEK) derived from the operator's passphrase, which is obtained by
//! running an external command. At startup every wrapped key is unwrapped
//! (the MAC check doubling as passphrase verification) and the plaintexts
//! are published to a read-only, once-initialized cache.
//!
//! Rotating the passphrase re-wraps the cached DEKs under a freshly derived
//! KEK and swaps the on-disk directory atomically. A crash at any point
//! leaves a state that [`KeyManager::recover_rotation`] resolves to exactly
//! one consistent key set at the next startup, without a write-ahead log.

pub mod cache;
pub mod command;
pub mod crypto;
pub mod store;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info, warn};

use self::cache::{CacheError, KeyCache};
use self::command::{CommandError, Passphrase};
use self::crypto::{CryptoError, CryptoKey, KdfParams, WrapCipher};
use self::store::StoreError;

pub use self::command::PASSPHRASE_PROMPT;
pub use self::crypto::TEST_KDF_ENV;

/// Identifier of an internal key; doubles as its slot index.
pub type KeyId = u32;

/// Fixed population of internal keys.
pub const N_KEYS: usize = 1;

/// The key used by the SQL layer to encrypt relation data.
pub const SQL_KEY_ID: KeyId = 0;

/// Plaintext length in bytes of each internal key, indexed by id.
pub const KEY_LENGTHS: [usize; N_KEYS] = [32];

/// Largest plaintext key length.
pub const MAX_KEY_LEN: usize = 32;

pub const PASSPHRASE_MIN_LEN: usize = 8;
pub const PASSPHRASE_MAX_LEN: usize = 1024;

/// Live wrapped-key directory, relative to the data directory.
pub const PRIMARY_DIR_NAME: &str = "cryptokeys";
/// Staging directory used only while a rotation is in flight.
pub const TMP_DIR_NAME: &str = "cryptokeys_tmp";

const LOCK_FILE_NAME: &str = "cryptokeys.lock";

#[derive(Debug, Error)]
pub enum KmgrError {
    #[error("key management is not enabled")]
    FeatureDisabled,

    #[error("passphrase must be at least {PASSPHRASE_MIN_LEN} bytes")]
    PassphraseTooShort,

    #[error("cluster passphrase does not match the stored keys")]
    BadPassphrase,

    #[error("keystore already exists at \"{0}\"")]
    AlreadyBootstrapped(PathBuf),

    #[error("no keystore found")]
    MissingKeystore,

    #[error("another passphrase rotation is in progress")]
    RotationInProgress,

    #[error("unsupported platform for file locking")]
    UnsupportedPlatform,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// Resolved key-manager settings, independent of how they were configured.
#[derive(Debug, Clone)]
pub struct KmgrSettings {
    pub enabled: bool,
    pub passphrase_command: String,
}

/// Observable keystore state, cheap to compute and passphrase-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreStatus {
    Missing,
    Healthy { keys: usize },
    RecoveryPending,
}

impl KeystoreStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KeystoreStatus::Missing => "missing",
            KeystoreStatus::Healthy { .. } => "healthy",
            KeystoreStatus::RecoveryPending => "recovery-pending",
        }
    }
}

pub struct KeyManager {
    data_dir: PathBuf,
    primary_dir: PathBuf,
    tmp_dir: PathBuf,
    lock_path: PathBuf,
    enabled: bool,
    kdf_params: KdfParams,
    passphrase_command: Mutex<String>,
    cache: KeyCache,
}

impl KeyManager {
    pub fn new(data_dir: impl Into<PathBuf>, settings: KmgrSettings) -> Self {
        let data_dir = data_dir.into();
        Self {
            primary_dir: data_dir.join(PRIMARY_DIR_NAME),
            tmp_dir: data_dir.join(TMP_DIR_NAME),
            lock_path: data_dir.join(LOCK_FILE_NAME),
            data_dir,
            enabled: settings.enabled,
            kdf_params: KdfParams::active(),
            passphrase_command: Mutex::new(settings.passphrase_command),
            cache: KeyCache::new(),
        }
    }

    /// Override the KDF cost parameters. The choice must be stable across
    /// the lifetime of a cluster.
    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_params = params;
        self
    }

    pub fn primary_dir(&self) -> &Path {
        &self.primary_dir
    }

    /// Bytes of cache memory this process will hold; zero when disabled.
    pub fn shared_size(&self) -> usize {
        if !self.enabled {
            return 0;
        }
        self.cache.shared_size()
    }

    /// Point the manager at a different passphrase source. Operators call
    /// this (via configuration reload) before [`KeyManager::rotate`].
    pub fn set_passphrase_command(&self, template: &str) {
        let mut command = self
            .passphrase_command
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        template.clone_into(&mut command);
    }

    /// Create the keystore for a new cluster. Called exactly once, before
    /// the cluster ever serves data.
    ///
    /// Generates every internal key from the OS CSPRNG, wraps each under
    /// the KEK derived from the operator's passphrase, and persists the
    /// set durably.
    pub fn bootstrap(&self) -> Result<(), KmgrError> {
        if !self.enabled {
            return Err(KmgrError::FeatureDisabled);
        }
        if self.primary_dir.exists() {
            return Err(KmgrError::AlreadyBootstrapped(self.primary_dir.clone()));
        }

        let passphrase = self.obtain_passphrase()?;
        let kek = crypto::derive_kek_pair(passphrase.expose(), self.kdf_params)?;
        let cipher = WrapCipher::new(&kek)?;

        let mut wrapped = Vec::with_capacity(N_KEYS);
        for len in KEY_LENGTHS {
            let key = crypto::generate_key(len)?;
            wrapped.push(cipher.wrap(&key)?);
            // `key` drops here and zeroizes; only the wrapped form survives.
        }

        store::save_all(&self.primary_dir, &wrapped)?;
        debug!(keys = N_KEYS, "bootstrapped cluster keystore");
        Ok(())
    }

    /// Load and verify the keystore. Called once per process start, before
    /// any worker can ask for a key.
    pub fn startup(&self) -> Result<(), KmgrError> {
        if !self.enabled {
            return Ok(());
        }

        debug!("starting up key management");
        self.recover_rotation()?;

        let wrapped = store::load_all(&self.primary_dir)?;
        let passphrase = self.obtain_passphrase()?;

        match self.verify_passphrase(&passphrase, &wrapped)? {
            Some(plaintexts) => {
                self.cache.install(plaintexts)?;
                debug!(keys = N_KEYS, "internal keys loaded");
                Ok(())
            }
            None => Err(KmgrError::BadPassphrase),
        }
    }

    /// Hot-path lookup of one plaintext key.
    pub fn key(&self, id: KeyId) -> Result<&CryptoKey, KmgrError> {
        if !self.enabled {
            return Err(KmgrError::FeatureDisabled);
        }
        Ok(self.cache.get(id)?)
    }

    /// Re-wrap every internal key under a KEK derived from the newly
    /// configured passphrase command, then atomically swap the on-disk set.
    ///
    /// The staging directory is made durable before the old set is removed;
    /// a crash at any point is resolved by [`KeyManager::recover_rotation`]
    /// at the next startup. The DEKs themselves never change.
    pub fn rotate(&self) -> Result<(), KmgrError> {
        if !self.enabled {
            return Err(KmgrError::FeatureDisabled);
        }

        let _lock = RotationLock::acquire(&self.lock_path)?;
        self.recover_rotation()?;

        let passphrase = self.obtain_passphrase()?;
        let kek = crypto::derive_kek_pair(passphrase.expose(), self.kdf_params)?;
        let cipher = WrapCipher::new(&kek)?;

        let mut rewrapped = Vec::with_capacity(N_KEYS);
        for id in 0..N_KEYS as KeyId {
            let plain = self.cache.get(id)?;
            rewrapped.push(cipher.wrap(plain)?);
        }

        store::save_all(&self.tmp_dir, &rewrapped)?;
        store::remove_tree(&self.primary_dir)?;
        store::rename_dir(&self.tmp_dir, &self.primary_dir)?;
        store::fsync_dir(&self.data_dir)?;

        info!("cluster passphrase rotated");
        Ok(())
    }

    /// Resolve a rotation the last process did not finish.
    ///
    /// Idempotent; called at every startup and at the head of every
    /// rotation. The decision needs no passphrase: record writes are
    /// sector-atomic, so counting well-formed files in the staging
    /// directory tells whether the new set was written out completely.
    pub fn recover_rotation(&self) -> Result<(), KmgrError> {
        match (self.primary_dir.exists(), self.tmp_dir.exists()) {
            // Normal state.
            (true, false) => Ok(()),

            // Crashed between removing the old set and renaming the new
            // one into place. The new keys win.
            (false, true) => {
                warn!(
                    "keystore missing but staging directory present; \
                     completing interrupted passphrase rotation"
                );
                store::rename_dir(&self.tmp_dir, &self.primary_dir)?;
                store::fsync_dir(&self.data_dir)?;
                info!("keys wrapped by the new passphrase were chosen");
                Ok(())
            }

            // Both present: the crash hit either after the new set was
            // fully staged (finish the swap) or mid-write (discard it).
            (true, true) => {
                if store::valid_key_count(&self.tmp_dir)? == N_KEYS {
                    store::remove_tree(&self.primary_dir)?;
                    store::rename_dir(&self.tmp_dir, &self.primary_dir)?;
                    store::fsync_dir(&self.data_dir)?;
                    info!(
                        "interrupted rotation had staged a complete key set; \
                         keys wrapped by the new passphrase were chosen"
                    );
                } else {
                    store::remove_tree(&self.tmp_dir)?;
                    info!(
                        "interrupted rotation left an incomplete staging \
                         directory; keys wrapped by the old passphrase were kept"
                    );
                }
                Ok(())
            }

            (false, false) => Err(KmgrError::MissingKeystore),
        }
    }

    /// Cheap, passphrase-free census for operators.
    pub fn keystore_status(&self) -> Result<KeystoreStatus, KmgrError> {
        match (self.primary_dir.exists(), self.tmp_dir.exists()) {
            (false, false) => Ok(KeystoreStatus::Missing),
            (true, false) => Ok(KeystoreStatus::Healthy {
                keys: store::valid_key_count(&self.primary_dir)?,
            }),
            _ => Ok(KeystoreStatus::RecoveryPending),
        }
    }

    fn obtain_passphrase(&self) -> Result<Passphrase, KmgrError> {
        let template = self
            .passphrase_command
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let passphrase = command::run_passphrase_command(&template)?;
        if passphrase.len() < PASSPHRASE_MIN_LEN {
            return Err(KmgrError::PassphraseTooShort);
        }
        Ok(passphrase)
    }

    /// Unwrap every key under the KEK derived from `passphrase`. `None`
    /// means the passphrase is wrong (or a record was tampered with); any
    /// partially unwrapped material is dropped and zeroized before return.
    fn verify_passphrase(
        &self,
        passphrase: &Passphrase,
        wrapped: &[CryptoKey],
    ) -> Result<Option<Vec<CryptoKey>>, KmgrError> {
        let kek = crypto::derive_kek_pair(passphrase.expose(), self.kdf_params)?;
        let cipher = WrapCipher::new(&kek)?;

        let mut plaintexts = Vec::with_capacity(wrapped.len());
        for blob in wrapped {
            match cipher.unwrap(blob) {
                Ok(plain) => plaintexts.push(plain),
                Err(CryptoError::Auth) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Some(plaintexts))
    }
}

/// Exclusive advisory lock serializing rotations against each other.
struct RotationLock {
    #[allow(dead_code)]
    file: std::fs::File,
}

impl RotationLock {
    fn acquire(lock_path: &Path) -> Result<Self, KmgrError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(lock_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                    return Err(KmgrError::RotationInProgress);
                }
                return Err(KmgrError::Io(err));
            }
            return Ok(Self { file });
        }

        #[cfg(not(unix))]
        {
            let _ = file;
            Err(KmgrError::UnsupportedPlatform)
        }
    }
}
