//! The repository info file
//!
//! `_info.json` is the only plaintext blob in a repository. It names the
//! data path and holds every wrapped copy of the master key: passphrase
//! slots (Argon2id-derived wrapping key plus a confirmation hash) and GPG
//! slots (master key encrypted to a GPG key). Version 1 repositories stored
//! a single passphrase-derived master key in the legacy `salt` and
//! `confirmationHash` fields; the upgrade path migrates those into a
//! wrapped slot.

use crate::crypto::{self, key_from_passphrase, MasterKey, KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use crate::gpg::GpgAgent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application identifier written to new info files
pub const INFO_APP: &str = "coffre";

/// Current info file format version
pub const INFO_VERSION: u16 = 3;

/// Slot id reported when the legacy v1 fields unlocked the repository
pub const LEGACY_KEY_ID: &str = "LegacyKey";

/// One wrapped copy of the master key
///
/// Passphrase slots carry `salt` and `confirmation_hash`; GPG slots carry
/// `gpg_key`. `master_key` is always the wrapped (never plaintext) key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gpg_key: String,

    #[serde(with = "b64")]
    pub master_key: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub salt: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub confirmation_hash: Option<Vec<u8>>,
}

impl WrappedKey {
    fn is_gpg(&self) -> bool {
        !self.gpg_key.is_empty() && !self.master_key.is_empty()
    }

    fn is_passphrase(&self) -> bool {
        self.gpg_key.is_empty()
            && !self.master_key.is_empty()
            && self.salt.is_some()
            && self.confirmation_hash.is_some()
    }
}

/// The repository info file, stored as plaintext JSON at `_info.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoFile {
    pub app: String,
    pub version: u16,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_path: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<WrappedKey>,

    /// Legacy v1 salt; empty for version >= 2
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub salt: Option<Vec<u8>>,

    /// Legacy v1 confirmation hash; empty for version >= 2
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub confirmation_hash: Option<Vec<u8>>,
}

impl InfoFile {
    /// Create a new info file at the current version with a random data path
    pub fn new() -> Self {
        InfoFile {
            app: INFO_APP.to_string(),
            version: INFO_VERSION,
            data_path: Uuid::new_v4().to_string(),
            keys: Vec::new(),
            salt: None,
            confirmation_hash: None,
        }
    }

    /// Validate a loaded info file
    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.version) {
            return Err(Error::Config(format!(
                "unsupported repository version {}",
                self.version
            )));
        }
        if self.data_path.is_empty() {
            return Err(Error::Config("info file has no data path".to_string()));
        }

        let has_legacy = matches!(
            (&self.salt, &self.confirmation_hash),
            (Some(s), Some(c)) if s.len() == SALT_SIZE && c.len() == KEY_SIZE
        );

        if self.version == 1 {
            if !has_legacy && self.keys.is_empty() {
                return Err(Error::Config(
                    "version 1 info file has no keys".to_string(),
                ));
            }
        } else {
            if self.keys.is_empty() {
                return Err(Error::Config("info file has no keys".to_string()));
            }
            if self.salt.is_some() || self.confirmation_hash.is_some() {
                return Err(Error::Config(
                    "legacy fields are not allowed after version 1".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Append a passphrase slot
    pub fn add_passphrase(
        &mut self,
        salt: [u8; SALT_SIZE],
        confirmation_hash: [u8; KEY_SIZE],
        wrapped_key: Vec<u8>,
    ) {
        self.keys.push(WrappedKey {
            gpg_key: String::new(),
            master_key: wrapped_key,
            salt: Some(salt.to_vec()),
            confirmation_hash: Some(confirmation_hash.to_vec()),
        });
    }

    /// Append a GPG slot
    pub fn add_gpg_wrapped_key(&mut self, gpg_key: &str, wrapped_key: Vec<u8>) {
        self.keys.push(WrappedKey {
            gpg_key: gpg_key.to_string(),
            master_key: wrapped_key,
            salt: None,
            confirmation_hash: None,
        });
    }

    /// Remove a key slot by id: a GPG key id, or `p:<n>` for the n-th
    /// passphrase slot. At least one slot must remain.
    pub fn remove_key(&mut self, key_id: &str) -> Result<()> {
        let position = if let Some(n) = key_id.strip_prefix("p:") {
            let n: usize = n
                .parse()
                .map_err(|_| Error::Config(format!("invalid key id: {}", key_id)))?;
            self.keys
                .iter()
                .enumerate()
                .filter(|(_, k)| k.is_passphrase())
                .nth(n)
                .map(|(i, _)| i)
        } else {
            self.keys.iter().position(|k| k.gpg_key == key_id)
        };

        let position =
            position.ok_or_else(|| Error::Config(format!("key not found: {}", key_id)))?;

        if self.keys.len() <= 1 {
            return Err(Error::Config(
                "cannot remove the last key from the repository".to_string(),
            ));
        }

        self.keys.remove(position);
        Ok(())
    }

    /// Upgrade the info file to the latest version
    ///
    /// v1 → v2 rewraps the legacy passphrase-derived master key into a
    /// proper slot under a fresh salt and clears the legacy fields.
    /// v2 → v3 changes nothing here; the version bump stops older readers
    /// from touching an index whose encoding changed outside this file.
    pub fn upgrade<P>(&mut self, prompt: P) -> Result<()>
    where
        P: FnOnce() -> Result<String>,
    {
        if self.version != 1 && self.version != 2 {
            return Err(Error::Config(
                "repository is already upgraded or uses an unsupported version".to_string(),
            ));
        }

        if self.version < 2 {
            self.upgrade_v1(prompt)?;
        }

        self.version = INFO_VERSION;
        Ok(())
    }

    fn upgrade_v1<P>(&mut self, prompt: P) -> Result<()>
    where
        P: FnOnce() -> Result<String>,
    {
        // GPG slots were already stored in `keys`; only the legacy
        // passphrase-derived key needs migrating
        let (salt, confirmation) = match (&self.salt, &self.confirmation_hash) {
            (Some(s), Some(c)) => (s.clone(), c.clone()),
            _ => return Ok(()),
        };

        let passphrase = prompt()?;

        // In version 1 the derived key is the master key itself
        let (master_key, derived_hash) = key_from_passphrase(&passphrase, &salt)?;
        if derived_hash.as_slice() != confirmation.as_slice() {
            return Err(Error::Unlock);
        }

        let new_salt = crypto::new_salt()?;
        let (wrapping_key, new_hash) = key_from_passphrase(&passphrase, &new_salt)?;
        let wrapped = crypto::wrap_key(&wrapping_key, &master_key)?;

        self.add_passphrase(new_salt, new_hash, wrapped);
        self.salt = None;
        self.confirmation_hash = None;
        Ok(())
    }
}

impl Default for InfoFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Recover the master key from an info file
///
/// Tries every GPG slot first (no interaction if the GPG agent holds a
/// matching private key), then prompts for the passphrase exactly once and
/// tries the legacy v1 fields followed by each passphrase slot in order.
/// Returns the master key and the id of the slot that unlocked it. Fails
/// with [`Error::Unlock`] without revealing which slot came close.
pub async fn unlock<P>(
    info: &InfoFile,
    gpg: &dyn GpgAgent,
    prompt: P,
) -> Result<(MasterKey, String)>
where
    P: FnOnce() -> Result<String>,
{
    // GPG slots first, in order
    for key in info.keys.iter().filter(|k| k.is_gpg()) {
        if let Ok(plain) = gpg.decrypt(&key.master_key).await {
            if plain.len() == KEY_SIZE {
                let mut bytes = [0u8; KEY_SIZE];
                bytes.copy_from_slice(&plain);
                return Ok((MasterKey::from_bytes(bytes), key.gpg_key.clone()));
            }
        }
    }

    // One passphrase prompt covers the legacy fields and every slot
    let passphrase = prompt()?;

    if let (Some(salt), Some(confirmation)) = (&info.salt, &info.confirmation_hash) {
        if let Ok((candidate, hash)) = key_from_passphrase(&passphrase, salt) {
            if hash.as_slice() == confirmation.as_slice() {
                return Ok((MasterKey::from_bytes(*candidate), LEGACY_KEY_ID.to_string()));
            }
        }
    }

    for (i, key) in info.keys.iter().filter(|k| k.is_passphrase()).enumerate() {
        let (salt, confirmation) = match (&key.salt, &key.confirmation_hash) {
            (Some(s), Some(c)) => (s, c),
            _ => continue,
        };
        if let Ok((wrapping_key, hash)) = key_from_passphrase(&passphrase, salt) {
            if hash.as_slice() == confirmation.as_slice() {
                let master = crypto::unwrap_key(&wrapping_key, &key.master_key)?;
                return Ok((MasterKey::from_bytes(*master), format!("p:{}", i)));
            }
        }
    }

    Err(Error::Unlock)
}

/// Add a key slot to an info file
///
/// With a GPG key id the master key is wrapped by the GPG agent; otherwise
/// the prompt supplies a passphrase and a fresh salt derives the wrapping
/// key.
pub async fn add_key<P>(
    info: &mut InfoFile,
    master_key: &MasterKey,
    gpg_key: Option<&str>,
    gpg: &dyn GpgAgent,
    prompt: P,
) -> Result<()>
where
    P: FnOnce() -> Result<String>,
{
    match gpg_key {
        Some(key_id) => {
            let wrapped = gpg.encrypt(master_key.as_bytes(), key_id).await?;
            info.add_gpg_wrapped_key(key_id, wrapped);
        }
        None => {
            let passphrase = prompt()?;
            let salt = crypto::new_salt()?;
            let (wrapping_key, confirmation_hash) = key_from_passphrase(&passphrase, &salt)?;
            let wrapped = crypto::wrap_key(&wrapping_key, master_key.as_bytes())?;
            info.add_passphrase(salt, confirmation_hash, wrapped);
        }
    }
    Ok(())
}

/// Base64 serde helpers for byte fields in the info file
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            None => Ok(None),
            Some(s) if s.is_empty() => Ok(None),
            Some(s) => STANDARD.decode(&s).map(Some).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Test double that "encrypts" by prefixing a marker
    struct MockGpg;

    #[async_trait]
    impl GpgAgent for MockGpg {
        async fn encrypt(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>> {
            let mut out = format!("mock:{}:", key_id).into_bytes();
            out.extend_from_slice(plaintext);
            Ok(out)
        }

        async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
            let s = ciphertext
                .strip_prefix(b"mock:")
                .ok_or(Error::Crypto("not a mock blob".to_string()))?;
            let sep = s
                .iter()
                .position(|&b| b == b':')
                .ok_or(Error::Crypto("not a mock blob".to_string()))?;
            Ok(s[sep + 1..].to_vec())
        }
    }

    /// GPG agent that always fails, for passphrase-only paths
    struct NoGpg;

    #[async_trait]
    impl GpgAgent for NoGpg {
        async fn encrypt(&self, _: &[u8], _: &str) -> Result<Vec<u8>> {
            Err(Error::Crypto("no gpg".to_string()))
        }
        async fn decrypt(&self, _: &[u8]) -> Result<Vec<u8>> {
            Err(Error::Crypto("no gpg".to_string()))
        }
    }

    fn prompt(passphrase: &str) -> impl FnOnce() -> Result<String> {
        let p = passphrase.to_string();
        move || Ok(p)
    }

    async fn new_with_passphrase(passphrase: &str) -> (InfoFile, MasterKey) {
        let mut info = InfoFile::new();
        let master = MasterKey::generate().unwrap();
        add_key(&mut info, &master, None, &NoGpg, prompt(passphrase))
            .await
            .unwrap();
        (info, master)
    }

    fn legacy_v1(passphrase: &str) -> (InfoFile, MasterKey) {
        let salt = crypto::new_salt().unwrap();
        let (master, confirmation) = key_from_passphrase(passphrase, &salt).unwrap();
        let mut info = InfoFile::new();
        info.version = 1;
        info.salt = Some(salt.to_vec());
        info.confirmation_hash = Some(confirmation.to_vec());
        (info, MasterKey::from_bytes(*master))
    }

    #[tokio::test]
    async fn test_new_info_file_shape() {
        let (info, _) = new_with_passphrase("hunter2").await;

        assert_eq!(info.version, 3);
        assert_eq!(info.keys.len(), 1);
        assert!(info.salt.is_none());
        assert!(info.confirmation_hash.is_none());
        info.validate().unwrap();
    }

    #[tokio::test]
    async fn test_json_roundtrip() {
        let (info, _) = new_with_passphrase("hunter2").await;

        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("\"salt\":null"));

        let parsed: InfoFile = serde_json::from_str(&json).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.keys.len(), 1);
        assert_eq!(parsed.keys[0].master_key, info.keys[0].master_key);
        assert_eq!(parsed.data_path, info.data_path);
    }

    #[tokio::test]
    async fn test_unlock_with_passphrase() {
        let (info, master) = new_with_passphrase("hunter2").await;

        let (unlocked, key_id) = unlock(&info, &NoGpg, prompt("hunter2")).await.unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());
        assert_eq!(key_id, "p:0");
    }

    #[tokio::test]
    async fn test_unlock_wrong_passphrase() {
        let (info, _) = new_with_passphrase("hunter2").await;

        let err = unlock(&info, &NoGpg, prompt("wrong")).await.unwrap_err();
        assert!(matches!(err, Error::Unlock));
    }

    #[tokio::test]
    async fn test_unlock_with_gpg_skips_prompt() {
        let mut info = InfoFile::new();
        let master = MasterKey::generate().unwrap();
        add_key(&mut info, &master, Some("0xCOFFEE"), &MockGpg, || {
            Err(Error::Internal("prompt must not run".to_string()))
        })
        .await
        .unwrap();

        let (unlocked, key_id) = unlock(&info, &MockGpg, || {
            Err(Error::Internal("prompt must not run".to_string()))
        })
        .await
        .unwrap();

        assert_eq!(unlocked.as_bytes(), master.as_bytes());
        assert_eq!(key_id, "0xCOFFEE");
    }

    #[tokio::test]
    async fn test_unlock_falls_back_to_passphrase_slot() {
        let (mut info, master) = new_with_passphrase("hunter2").await;
        info.add_gpg_wrapped_key("0xDEAD", b"garbage".to_vec());
        // GPG slot is first in unlock order but cannot be decrypted
        let (unlocked, key_id) = unlock(&info, &NoGpg, prompt("hunter2")).await.unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());
        assert_eq!(key_id, "p:0");
    }

    #[tokio::test]
    async fn test_legacy_v1_unlock() {
        let (info, master) = legacy_v1("hunter2");
        info.validate().unwrap();

        let (unlocked, key_id) = unlock(&info, &NoGpg, prompt("hunter2")).await.unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());
        assert_eq!(key_id, LEGACY_KEY_ID);
    }

    #[tokio::test]
    async fn test_upgrade_v1_preserves_master_key() {
        let (mut info, master) = legacy_v1("hunter2");

        info.upgrade(prompt("hunter2")).unwrap();

        assert_eq!(info.version, 3);
        assert!(info.salt.is_none());
        assert!(info.confirmation_hash.is_none());
        assert_eq!(info.keys.len(), 1);
        info.validate().unwrap();

        let (unlocked, key_id) = unlock(&info, &NoGpg, prompt("hunter2")).await.unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());
        assert_eq!(key_id, "p:0");
    }

    #[test]
    fn test_upgrade_v1_wrong_passphrase() {
        let (mut info, _) = legacy_v1("hunter2");
        let err = info.upgrade(prompt("wrong")).unwrap_err();
        assert!(matches!(err, Error::Unlock));
        // Nothing was modified
        assert_eq!(info.version, 1);
        assert!(info.salt.is_some());
    }

    #[tokio::test]
    async fn test_upgrade_v2_only_bumps_version() {
        let (mut info, master) = new_with_passphrase("hunter2").await;
        info.version = 2;

        info.upgrade(|| Err(Error::Internal("prompt must not run".to_string())))
            .unwrap();

        assert_eq!(info.version, 3);
        assert_eq!(info.keys.len(), 1);
        let (unlocked, _) = unlock(&info, &NoGpg, prompt("hunter2")).await.unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());
    }

    #[tokio::test]
    async fn test_upgrade_v3_rejected() {
        let (mut info, _) = new_with_passphrase("hunter2").await;
        assert!(info.upgrade(prompt("hunter2")).is_err());
    }

    #[tokio::test]
    async fn test_remove_key() {
        let (mut info, master) = new_with_passphrase("hunter2").await;
        add_key(&mut info, &master, Some("0xCOFFEE"), &MockGpg, prompt(""))
            .await
            .unwrap();
        assert_eq!(info.keys.len(), 2);

        info.remove_key("0xCOFFEE").unwrap();
        assert_eq!(info.keys.len(), 1);

        let err = info.remove_key("p:0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_versions() {
        let mut info = InfoFile::new();
        info.add_passphrase([0u8; SALT_SIZE], [0u8; KEY_SIZE], vec![0u8; 60]);

        info.version = 0;
        assert!(info.validate().is_err());
        info.version = 4;
        assert!(info.validate().is_err());
        info.version = 3;
        info.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_legacy_fields_after_v1() {
        let mut info = InfoFile::new();
        info.add_passphrase([0u8; SALT_SIZE], [0u8; KEY_SIZE], vec![0u8; 60]);
        info.salt = Some(vec![0u8; SALT_SIZE]);
        info.confirmation_hash = Some(vec![0u8; KEY_SIZE]);
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_keys() {
        let info = InfoFile::new();
        assert!(info.validate().is_err());
    }
}
