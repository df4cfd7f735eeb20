//! On-disk wrapped-key store.
//!
//! One directory holds the live key set: one file per internal key, named by
//! the 4-digit uppercase-hex key id. Every file is exactly `KEY_RECORD_LEN`
//! bytes, well under one disk sector, so a single `write` lands atomically
//! and the store needs no CRC and no write-ahead log. The MAC inside the
//! wrapped blob covers integrity; this layer only enforces shape.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use super::crypto::{CryptoKey, WRAPPED_KEY_MAX_LEN};
use super::{KeyId, N_KEYS};

/// Exact on-disk size of one key record: length prefix plus the full key
/// buffer, zero-padded. Strictly below 512 bytes.
pub const KEY_RECORD_LEN: usize = 4 + WRAPPED_KEY_MAX_LEN;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("invalid cryptographic key identifier {0}")]
    InvalidKeyId(u32),

    #[error("too many key files in \"{0}\"")]
    TooManyKeys(PathBuf),

    #[error("corrupted key file \"{0}\"")]
    Corrupt(PathBuf),

    #[error("keystore holds {found} of {N_KEYS} keys")]
    Incomplete { found: usize },
}

/// Path of the key file for `id` under `dir`.
pub fn key_path(dir: &Path, id: KeyId) -> PathBuf {
    dir.join(format!("{id:04X}"))
}

/// Accepts exactly 4-character uppercase-hex names; everything else in the
/// directory (dotfiles, editor droppings) is not ours and is skipped.
fn is_key_file_name(name: &str) -> bool {
    name.len() == 4 && name.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

fn encode_record(key: &CryptoKey) -> [u8; KEY_RECORD_LEN] {
    let mut record = [0u8; KEY_RECORD_LEN];
    record[..4].copy_from_slice(&(key.len() as u32).to_le_bytes());
    record[4..4 + key.len()].copy_from_slice(key.as_bytes());
    record
}

fn decode_record(bytes: &[u8], path: &Path) -> Result<CryptoKey, StoreError> {
    if bytes.len() != KEY_RECORD_LEN {
        return Err(StoreError::Corrupt(path.to_path_buf()));
    }
    let klen = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if klen == 0 || klen > WRAPPED_KEY_MAX_LEN {
        return Err(StoreError::Corrupt(path.to_path_buf()));
    }
    CryptoKey::from_slice(&bytes[4..4 + klen]).map_err(|_| StoreError::Corrupt(path.to_path_buf()))
}

/// Write the full key set under `dir`, creating it if needed.
///
/// Files are owner-only; each record goes out in a single `write`. Every
/// file is fsynced, then the directory itself, so a completed `save_all` is
/// durable before the caller takes any commit step that depends on it.
pub fn save_all(dir: &Path, keys: &[CryptoKey]) -> Result<(), StoreError> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;

    for (id, key) in keys.iter().enumerate() {
        let path = key_path(dir, id as KeyId);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&path)?;
        file.write_all(&encode_record(key))?;
        file.sync_all()?;
    }

    fsync_dir(dir)
}

/// Load the complete key set from `dir`.
///
/// Fails unless exactly `N_KEYS` valid records are present. Names that are
/// not 4 uppercase hex digits are silently ignored.
pub fn load_all(dir: &Path) -> Result<Vec<CryptoKey>, StoreError> {
    let mut slots: Vec<Option<CryptoKey>> = (0..N_KEYS).map(|_| None).collect();
    let mut found = 0usize;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_key_file_name(name) {
            continue;
        }

        let Ok(id) = u32::from_str_radix(name, 16) else {
            continue;
        };
        if id as usize >= N_KEYS {
            return Err(StoreError::InvalidKeyId(id));
        }
        if found >= N_KEYS {
            return Err(StoreError::TooManyKeys(dir.to_path_buf()));
        }

        slots[id as usize] = Some(read_one_keyfile(dir, id)?);
        found += 1;
    }

    let mut keys = Vec::with_capacity(N_KEYS);
    for slot in slots {
        match slot {
            Some(key) => keys.push(key),
            None => return Err(StoreError::Incomplete { found }),
        }
    }
    Ok(keys)
}

fn read_one_keyfile(dir: &Path, id: KeyId) -> Result<CryptoKey, StoreError> {
    let path = key_path(dir, id);
    let mut file = File::open(&path)?;

    let mut buf = Zeroizing::new(Vec::with_capacity(KEY_RECORD_LEN + 1));
    file.read_to_end(&mut buf)?;
    decode_record(&buf, &path)
}

/// Lenient census used by crash recovery, where the passphrase (and with
/// it AEAD verification) is not yet available: count the key files that
/// have a well-formed name, an in-range id, and exactly the record size.
/// Sector-atomic record writes make this count a reliable completeness
/// signal. Malformed entries reduce the count instead of failing.
pub fn valid_key_count(dir: &Path) -> Result<usize, StoreError> {
    let mut count = 0usize;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_key_file_name(name) {
            continue;
        }
        let Ok(id) = u32::from_str_radix(name, 16) else {
            continue;
        };
        if id as usize >= N_KEYS {
            continue;
        }
        if entry.metadata()?.len() == KEY_RECORD_LEN as u64 {
            count += 1;
        }
    }
    Ok(count)
}

/// Atomic on POSIX when both paths live on the same filesystem.
pub fn rename_dir(from: &Path, to: &Path) -> Result<(), StoreError> {
    fs::rename(from, to)?;
    Ok(())
}

pub fn remove_tree(dir: &Path) -> Result<(), StoreError> {
    fs::remove_dir_all(dir)?;
    Ok(())
}

pub fn fsync_dir(dir: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        let file = File::open(dir)?;
        file.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymgr::crypto;

    fn sample_keys() -> Vec<CryptoKey> {
        (0..N_KEYS)
            .map(|_| crypto::generate_key(32).unwrap())
            .collect()
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("cryptokeys");

        let keys = sample_keys();
        save_all(&store_dir, &keys).unwrap();

        let loaded = load_all(&store_dir).unwrap();
        assert_eq!(loaded.len(), N_KEYS);
        for (a, b) in keys.iter().zip(&loaded) {
            assert_eq!(a.as_bytes(), b.as_bytes());
        }
    }

    #[test]
    #[cfg(unix)]
    fn permissions_are_restrictive() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("cryptokeys");
        save_all(&store_dir, &sample_keys()).unwrap();

        let dir_mode = fs::metadata(&store_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);

        let file_mode = fs::metadata(key_path(&store_dir, 0))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn key_file_name_matrix() {
        assert!(is_key_file_name("0000"));
        assert!(is_key_file_name("00AF"));
        assert!(is_key_file_name("FFFF"));

        assert!(!is_key_file_name("00af"), "lowercase hex is rejected");
        assert!(!is_key_file_name("000"));
        assert!(!is_key_file_name("00000"));
        assert!(!is_key_file_name("00G0"));
        assert!(!is_key_file_name("xyz"));
        assert!(!is_key_file_name(".."));
    }

    #[test]
    fn stray_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("cryptokeys");
        save_all(&store_dir, &sample_keys()).unwrap();

        fs::write(store_dir.join("xyz"), b"not a key").unwrap();
        fs::write(store_dir.join("0000.bak"), b"also not a key").unwrap();

        assert_eq!(load_all(&store_dir).unwrap().len(), N_KEYS);
        assert_eq!(valid_key_count(&store_dir).unwrap(), N_KEYS);
    }

    #[test]
    fn out_of_range_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("cryptokeys");
        save_all(&store_dir, &sample_keys()).unwrap();

        fs::write(store_dir.join("FFFE"), [0u8; KEY_RECORD_LEN]).unwrap();
        assert!(matches!(
            load_all(&store_dir),
            Err(StoreError::InvalidKeyId(0xFFFE))
        ));

        // The lenient census skips it instead.
        assert_eq!(valid_key_count(&store_dir).unwrap(), N_KEYS);
    }

    #[test]
    fn short_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("cryptokeys");
        save_all(&store_dir, &sample_keys()).unwrap();

        fs::write(key_path(&store_dir, 0), [0u8; 10]).unwrap();
        assert!(matches!(load_all(&store_dir), Err(StoreError::Corrupt(_))));
        assert_eq!(valid_key_count(&store_dir).unwrap(), N_KEYS - 1);
    }

    #[test]
    fn missing_key_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("cryptokeys");
        save_all(&store_dir, &sample_keys()).unwrap();

        fs::remove_file(key_path(&store_dir, 0)).unwrap();
        assert!(matches!(
            load_all(&store_dir),
            Err(StoreError::Incomplete { found: 0 })
        ));
    }

    #[test]
    fn record_length_prefix_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("cryptokeys");
        save_all(&store_dir, &sample_keys()).unwrap();

        // Right size, absurd length prefix.
        let mut record = [0u8; KEY_RECORD_LEN];
        record[..4].copy_from_slice(&(WRAPPED_KEY_MAX_LEN as u32 + 1).to_le_bytes());
        fs::write(key_path(&store_dir, 0), record).unwrap();
        assert!(matches!(load_all(&store_dir), Err(StoreError::Corrupt(_))));
    }
}
