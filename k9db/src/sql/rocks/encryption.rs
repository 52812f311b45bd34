//! Per-user at-rest encryption.
//!
//! Three artifacts: a global key and a global nonce for deterministic
//! encryption of shard-name prefixes (equal plaintexts must yield equal
//! ciphertexts or prefix seeks stop working), and one symmetric key per
//! user. Row key suffixes reuse the global nonce under the user's key so
//! point lookups stay deterministic; row values get a fresh random nonce.
//!
//! All key material lives in the reserved `__keys__` column family and
//! never leaves this module in plaintext.

use aws_lc_rs::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::encode::Sequence;
use super::metadata::RocksdbMetadata;
use super::transaction::Db;
use crate::util::ShardName;

pub const KEY_LEN: usize = 32;

/// An encrypted row key: `[u16 BE prefix length][prefix][pk suffix]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncryptedKey(Vec<u8>);

impl EncryptedKey {
    pub fn from_db(bytes: Vec<u8>) -> EncryptedKey {
        EncryptedKey(bytes)
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }

    fn prefix_len(&self) -> usize {
        u16::from_be_bytes([self.0[0], self.0[1]]) as usize
    }

    /// The bytes a prefix seek over this key's shard uses.
    pub fn prefix(&self) -> &[u8] {
        &self.0[..2 + self.prefix_len()]
    }

    fn suffix(&self) -> &[u8] {
        &self.0[2 + self.prefix_len()..]
    }
}

/// The encrypted shard prefix used to bound a scan to one shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncryptedPrefix(Vec<u8>);

impl EncryptedPrefix {
    pub fn data(&self) -> &[u8] {
        &self.0
    }
}

/// An encrypted row value: `[nonce][ciphertext]`.
#[derive(Debug, Clone)]
pub struct EncryptedValue(Vec<u8>);

impl EncryptedValue {
    pub fn from_db(bytes: Vec<u8>) -> EncryptedValue {
        EncryptedValue(bytes)
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }
}

pub struct EncryptionManager {
    global_key: [u8; KEY_LEN],
    global_nonce: [u8; NONCE_LEN],
    /// user id -> key. Mutated on first insert into a fresh shard.
    user_keys: RwLock<HashMap<String, [u8; KEY_LEN]>>,
    rng: SystemRandom,
}

impl EncryptionManager {
    /// Load persisted key material, generating the global artifacts on
    /// first open.
    pub fn initialize(db: &Db, metadata: &RocksdbMetadata) -> EncryptionManager {
        let rng = SystemRandom::new();
        let global_key = match metadata.load_global_key(db) {
            Some(key) => key.try_into().expect("corrupt global key"),
            None => {
                let mut key = [0u8; KEY_LEN];
                rng.fill(&mut key).expect("rng failure");
                metadata.persist_global_key(db, &key);
                key
            }
        };
        let global_nonce = match metadata.load_global_nonce(db) {
            Some(nonce) => nonce.try_into().expect("corrupt global nonce"),
            None => {
                let mut nonce = [0u8; NONCE_LEN];
                rng.fill(&mut nonce).expect("rng failure");
                metadata.persist_global_nonce(db, &nonce);
                nonce
            }
        };
        let user_keys = metadata
            .load_user_keys(db)
            .into_iter()
            .map(|(user, key)| {
                let key: [u8; KEY_LEN] = key.try_into().expect("corrupt user key");
                (user, key)
            })
            .collect();
        EncryptionManager {
            global_key,
            global_nonce,
            user_keys: RwLock::new(user_keys),
            rng,
        }
    }

    fn aead(key: &[u8; KEY_LEN]) -> LessSafeKey {
        LessSafeKey::new(UnboundKey::new(&AES_256_GCM, key).expect("bad key length"))
    }

    /// Deterministic seal under the given key and the global nonce.
    fn seal_deterministic(&self, key: &[u8; KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
        let mut data = plaintext.to_vec();
        Self::aead(key)
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(self.global_nonce),
                Aad::empty(),
                &mut data,
            )
            .expect("seal failure");
        data
    }

    fn open_deterministic(&self, key: &[u8; KEY_LEN], ciphertext: &[u8]) -> Vec<u8> {
        let mut data = ciphertext.to_vec();
        let plaintext = Self::aead(key)
            .open_in_place(
                Nonce::assume_unique_for_key(self.global_nonce),
                Aad::empty(),
                &mut data,
            )
            .expect("authentication failure, store is corrupt");
        plaintext.to_vec()
    }

    /// The per-user key, created and persisted on first use.
    fn user_key(&self, db: &Db, metadata: &RocksdbMetadata, user_id: &str) -> [u8; KEY_LEN] {
        if let Some(key) = self.user_keys.read().get(user_id) {
            return *key;
        }
        let mut keys = self.user_keys.write();
        *keys.entry(user_id.to_string()).or_insert_with(|| {
            let mut key = [0u8; KEY_LEN];
            self.rng.fill(&mut key).expect("rng failure");
            metadata.persist_user_key(db, user_id, &key);
            tracing::debug!(user = user_id, "created encryption key for new user");
            key
        })
    }

    /// A user key that must already exist (read paths).
    fn existing_user_key(&self, user_id: &str) -> [u8; KEY_LEN] {
        *self
            .user_keys
            .read()
            .get(user_id)
            .unwrap_or_else(|| panic!("no key material for shard user"))
    }

    /// Encrypt a `(shard ⨾ pk)` key sequence.
    pub fn encrypt_key(&self, db: &Db, metadata: &RocksdbMetadata, key: &Sequence) -> EncryptedKey {
        let shard_bytes = key.at(0);
        let user_id = ShardName::from_bytes(shard_bytes).user_id().to_string();
        let prefix = self.seal_deterministic(&self.global_key, shard_bytes);
        let user_key = self.user_key(db, metadata, &user_id);
        let suffix = self.seal_deterministic(&user_key, key.at(1));

        let mut out = Vec::with_capacity(2 + prefix.len() + suffix.len());
        out.extend_from_slice(&(prefix.len() as u16).to_be_bytes());
        out.extend_from_slice(&prefix);
        out.extend_from_slice(&suffix);
        EncryptedKey(out)
    }

    /// The seek prefix for one shard.
    pub fn encrypt_prefix(&self, shard: &ShardName) -> EncryptedPrefix {
        let prefix = self.seal_deterministic(&self.global_key, &shard.as_bytes());
        let mut out = Vec::with_capacity(2 + prefix.len());
        out.extend_from_slice(&(prefix.len() as u16).to_be_bytes());
        out.extend_from_slice(&prefix);
        EncryptedPrefix(out)
    }

    /// Recover the shard name from an encrypted key.
    pub fn decrypt_shard(&self, key: &EncryptedKey) -> ShardName {
        let plaintext = self.open_deterministic(&self.global_key, &key.data()[2..2 + key.prefix_len()]);
        ShardName::from_bytes(&plaintext)
    }

    /// Recover the decoded pk field from an encrypted key.
    pub fn decrypt_pk(&self, user_id: &str, key: &EncryptedKey) -> Vec<u8> {
        let user_key = self.existing_user_key(user_id);
        self.open_deterministic(&user_key, key.suffix())
    }

    /// Encrypt a row under the shard user's key with a fresh nonce.
    pub fn encrypt_value(
        &self,
        db: &Db,
        metadata: &RocksdbMetadata,
        user_id: &str,
        value: &Sequence,
    ) -> EncryptedValue {
        let user_key = self.user_key(db, metadata, user_id);
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).expect("rng failure");

        let mut data = value.data().to_vec();
        Self::aead(&user_key)
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut data)
            .expect("seal failure");

        let mut out = Vec::with_capacity(NONCE_LEN + data.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&data);
        EncryptedValue(out)
    }

    /// Authenticated decrypt of a row. MAC failure is corruption and fatal.
    pub fn decrypt_value(&self, user_id: &str, value: &EncryptedValue) -> Sequence {
        let user_key = self.existing_user_key(user_id);
        let (nonce, ciphertext) = value.data().split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce.try_into().expect("truncated value");
        let mut data = ciphertext.to_vec();
        let plaintext = Self::aead(&user_key)
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut data)
            .expect("authentication failure, store is corrupt");
        Sequence::from_bytes(plaintext)
    }

    /// Destroy a user's key material.
    pub fn forget_user(&self, db: &Db, metadata: &RocksdbMetadata, user_id: &str) {
        self.user_keys.write().remove(user_id);
        metadata.delete_user_key(db, user_id);
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.user_keys.read().contains_key(user_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::rocks::transaction;

    fn setup() -> (tempfile::TempDir, Db, RocksdbMetadata, EncryptionManager) {
        let dir = tempfile::TempDir::new().unwrap();
        let (db, existing) = transaction::open(dir.path()).unwrap();
        let metadata = RocksdbMetadata::initialize(&db, existing);
        let manager = EncryptionManager::initialize(&db, &metadata);
        (dir, db, metadata, manager)
    }

    #[test]
    fn prefix_is_deterministic_and_keys_point_lookupable() {
        let (_dir, db, metadata, manager) = setup();
        let shard = ShardName::new("User", "1");

        let mut key = Sequence::new();
        key.append_shard(&shard);
        key.append_encoded(b"10");
        let a = manager.encrypt_key(&db, &metadata, &key);
        let b = manager.encrypt_key(&db, &metadata, &key);
        // Equal plaintext, equal ciphertext: point lookups work.
        assert_eq!(a, b);
        // The key starts with the shard's seek prefix.
        let prefix = manager.encrypt_prefix(&shard);
        assert!(a.data().starts_with(prefix.data()));
        // And the shard is recoverable for full scans.
        assert_eq!(manager.decrypt_shard(&a), shard);
    }

    #[test]
    fn value_round_trip_uses_fresh_nonces() {
        let (_dir, db, metadata, manager) = setup();
        let mut row = Sequence::new();
        row.append_encoded(b"10");
        row.append_encoded(b"hello");

        let a = manager.encrypt_value(&db, &metadata, "1", &row);
        let b = manager.encrypt_value(&db, &metadata, "1", &row);
        // Randomized nonces: same plaintext, different ciphertext.
        assert_ne!(a.data(), b.data());
        assert_eq!(manager.decrypt_value("1", &a), row);
        assert_eq!(manager.decrypt_value("1", &b), row);
    }

    #[test]
    #[should_panic]
    fn wrong_user_key_fails_authentication() {
        let (_dir, db, metadata, manager) = setup();
        let mut row = Sequence::new();
        row.append_encoded(b"secret");
        let value = manager.encrypt_value(&db, &metadata, "1", &row);
        // Force a key for user 2 to exist, then try to open user 1's row.
        manager.encrypt_value(&db, &metadata, "2", &row);
        manager.decrypt_value("2", &value);
    }

    #[test]
    #[should_panic]
    fn forgotten_user_has_no_key_material() {
        let (_dir, db, metadata, manager) = setup();
        let mut row = Sequence::new();
        row.append_encoded(b"secret");
        let value = manager.encrypt_value(&db, &metadata, "1", &row);
        manager.forget_user(&db, &metadata, "1");
        manager.decrypt_value("1", &value);
    }
}
