use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::crypto::{self, EncryptionKey};
use super::model::SecretRecord;
use crate::lookup::LookupKey;

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Leading byte of every stored record, so the layout can evolve.
const RECORD_V1_MARKER: u8 = 0x01;

/// Outcome of an insert.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// A record already exists under this lookup key. Nothing was written.
    DuplicateKey,
}

/// Thread-safe handle to the redb store.
///
/// The store is the encryption boundary: plaintext goes in through `insert`
/// and comes out only through `take_live`, which deletes the record in the
/// same write transaction.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    key: Arc<EncryptionKey>,
    /// Encoded, already-expired record decoded when a lookup key is absent,
    /// so a miss costs the same as an expired hit.
    absent: Arc<[u8]>,
}

impl Store {
    /// Open (or create) the database at `path`, using `key` for encryption.
    pub fn open(path: &Path, key: EncryptionKey) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.commit()?;

        let absent = encode(&SecretRecord {
            content_encrypted: Vec::new(),
            nonce: [0u8; crypto::NONCE_SIZE],
            created_at: 0,
            expires_at: 0,
        })?;

        Ok(Self {
            db: Arc::new(db),
            key: Arc::new(key),
            absent: absent.into(),
        })
    }

    /// Current Unix time in seconds.
    pub fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Encrypt `content` and store it under `lookup_key`.
    /// Never overwrites: an existing record yields `DuplicateKey`.
    pub fn insert(
        &self,
        lookup_key: &LookupKey,
        content: &[u8],
        expires_at: i64,
    ) -> Result<InsertResult> {
        let key_hex = lookup_key.to_hex();

        let (content_encrypted, nonce) =
            crypto::encrypt(&self.key, content, lookup_key.as_bytes())
                .context("encrypt content")?;

        let record = SecretRecord {
            content_encrypted,
            nonce,
            created_at: Self::now(),
            expires_at,
        };
        let bytes = encode(&record)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            if table.get(key_hex.as_str())?.is_some() {
                drop(table);
                write_txn.abort()?;
                debug!(key = %lookup_key, "lookup key collision");
                return Ok(InsertResult::DuplicateKey);
            }
            table.insert(key_hex.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        debug!(key = %lookup_key, expires_at, "stored secret");
        Ok(InsertResult::Inserted)
    }

    /// Fetch the record under `lookup_key` if it is still live at `now`.
    /// Content stays encrypted; this never deletes.
    pub fn find_live(&self, lookup_key: &LookupKey, now: i64) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;

        let raw_bytes: Option<Vec<u8>> = table
            .get(lookup_key.to_hex().as_str())?
            .map(|guard| guard.value().to_vec());

        match raw_bytes {
            None => Ok(None),
            Some(bytes) => {
                let record = decode(&bytes)?;
                if record.is_expired(now) {
                    Ok(None)
                } else {
                    Ok(Some(record))
                }
            }
        }
    }

    /// Atomically find a live record, decrypt it, and delete it.
    ///
    /// Lookup, decrypt and delete run inside one redb write transaction, and
    /// redb admits one writer at a time, so two callers racing on the same key
    /// get exactly one `Some`. The plaintext is only returned after the delete
    /// has committed; any failure before that aborts and leaves the record as
    /// it was. Expired records are left in place for the reaper.
    pub fn take_live(
        &self,
        lookup_key: &LookupKey,
        now: i64,
    ) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let key_hex = lookup_key.to_hex();

        let write_txn = self.db.begin_write()?;
        let taken = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Copy the bytes out so the AccessGuard is dropped before removal.
            let raw_bytes: Option<Vec<u8>> = table
                .get(key_hex.as_str())?
                .map(|guard| guard.value().to_vec());

            // Missing and expired keys both decode a record and check expiry.
            let found = raw_bytes.is_some();
            let record = decode(raw_bytes.as_deref().unwrap_or(&self.absent[..]))?;
            if !found || record.is_expired(now) {
                None
            } else {
                let plaintext = crypto::decrypt(
                    &self.key,
                    &record.content_encrypted,
                    &record.nonce,
                    lookup_key.as_bytes(),
                )
                .context("decrypt content")?;
                table.remove(key_hex.as_str())?;
                Some(plaintext)
            }
        };

        match taken {
            Some(plaintext) => {
                write_txn.commit()?;
                debug!(key = %lookup_key, "redeemed and deleted secret");
                Ok(Some(plaintext))
            }
            None => {
                write_txn.abort()?;
                Ok(None)
            }
        }
    }

    /// Delete a record regardless of expiry. Returns true if it existed.
    pub fn delete(&self, lookup_key: &LookupKey) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let existed = table.remove(lookup_key.to_hex().as_str())?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Remove every record with `expires_at <= now` in a single write
    /// transaction. Returns how many expired records were removed.
    ///
    /// Records that cannot be decoded can never be redeemed; they are
    /// dropped in the same pass so one bad row cannot stall the sweep.
    pub fn delete_expired(&self, now: i64) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let (removed, discarded) = {
            let mut table = write_txn.open_table(SECRETS)?;

            let mut expired_keys = Vec::new();
            let mut corrupt_keys = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                match decode(v.value()) {
                    Ok(record) if record.is_expired(now) => {
                        expired_keys.push(k.value().to_owned());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let key = k.value();
                        let short = key.get(..8).unwrap_or(key);
                        warn!(key = short, error = %e, "dropping undecodable record");
                        corrupt_keys.push(key.to_owned());
                    }
                }
            }

            for key in expired_keys.iter().chain(&corrupt_keys) {
                table.remove(key.as_str())?;
            }
            (expired_keys.len(), corrupt_keys.len())
        };
        write_txn.commit()?;

        if removed > 0 || discarded > 0 {
            info!(removed, discarded, "pruned expired secrets");
        }
        Ok(removed)
    }

    /// Number of stored records, live or expired-but-unreaped.
    pub fn count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        Ok(table.len()? as usize)
    }
}

/// Encode a SecretRecord as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_V1_MARKER, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format 0x{marker:02x}"),
        None => anyhow::bail!("empty record"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::lookup::{CodeHasher, ServerSecret};
    use tempfile::tempdir;

    fn make_store() -> (Store, tempfile::TempDir) {
        let key = crypto::generate_key();
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path, key).unwrap();
        (store, dir)
    }

    fn lookup(code: &str) -> LookupKey {
        let secret = ServerSecret::new(b"store-test-server-secret".to_vec()).unwrap();
        CodeHasher::new(secret).unwrap().hash(code)
    }

    #[test]
    fn insert_take_once() {
        let (s, _dir) = make_store();
        let k = lookup("AAAA2222");
        let now = Store::now();
        assert_eq!(
            s.insert(&k, b"my-value", now + 3600).unwrap(),
            InsertResult::Inserted
        );
        let taken = s.take_live(&k, now).unwrap().unwrap();
        assert_eq!(taken.as_slice(), b"my-value");
        assert!(s.take_live(&k, now).unwrap().is_none());
        assert_eq!(s.count().unwrap(), 0);
    }

    #[test]
    fn duplicate_key_does_not_overwrite() {
        let (s, _dir) = make_store();
        let k = lookup("DUPE2222");
        let now = Store::now();
        s.insert(&k, b"first", now + 3600).unwrap();
        assert_eq!(
            s.insert(&k, b"second", now + 3600).unwrap(),
            InsertResult::DuplicateKey
        );
        assert_eq!(s.count().unwrap(), 1);
        assert_eq!(s.take_live(&k, now).unwrap().unwrap().as_slice(), b"first");
    }

    #[test]
    fn content_is_encrypted_at_rest() {
        let (s, _dir) = make_store();
        let k = lookup("CRYP2222");
        let now = Store::now();
        s.insert(&k, b"Sensitive data", now + 3600).unwrap();

        let record = s.find_live(&k, now).unwrap().unwrap();
        assert_ne!(record.content_encrypted.as_slice(), b"Sensitive data");
        assert!(!record
            .content_encrypted
            .windows(b"Sensitive".len())
            .any(|w| w == b"Sensitive"));

        // The raw row on disk holds no plaintext either.
        let read_txn = s.db.begin_read().unwrap();
        let table = read_txn.open_table(SECRETS).unwrap();
        let raw = table.get(k.to_hex().as_str()).unwrap().unwrap().value().to_vec();
        assert!(!raw.windows(b"Sensitive".len()).any(|w| w == b"Sensitive"));
    }

    #[test]
    fn expired_is_invisible_and_left_in_place() {
        let (s, _dir) = make_store();
        let k = lookup("EXPD2222");
        let now = Store::now();
        s.insert(&k, b"value", now).unwrap();
        assert!(s.find_live(&k, now).unwrap().is_none());
        assert!(s.take_live(&k, now).unwrap().is_none());
        assert_eq!(s.count().unwrap(), 1);
    }

    #[test]
    fn find_live_does_not_consume() {
        let (s, _dir) = make_store();
        let k = lookup("PEEK2222");
        let now = Store::now();
        s.insert(&k, b"value", now + 60).unwrap();
        assert!(s.find_live(&k, now).unwrap().is_some());
        assert!(s.find_live(&k, now).unwrap().is_some());
        assert!(s.take_live(&k, now).unwrap().is_some());
    }

    #[test]
    fn delete_reports_existence() {
        let (s, _dir) = make_store();
        let k = lookup("DELE2222");
        s.insert(&k, b"v", Store::now() - 10).unwrap();
        assert!(s.delete(&k).unwrap());
        assert!(!s.delete(&k).unwrap());
    }

    #[test]
    fn delete_expired_keeps_live() {
        let (s, _dir) = make_store();
        let now = Store::now();
        let live = lookup("LIVE2222");
        let dead = lookup("DEAD2222");
        let edge = lookup("EDGE2222");
        s.insert(&live, b"keep me", now + 3600).unwrap();
        s.insert(&dead, b"delete me", now - 1).unwrap();
        s.insert(&edge, b"expires now", now).unwrap();

        assert_eq!(s.delete_expired(now).unwrap(), 2);
        assert_eq!(s.count().unwrap(), 1);
        assert_eq!(s.delete_expired(now).unwrap(), 0);
        assert_eq!(
            s.take_live(&live, now).unwrap().unwrap().as_slice(),
            b"keep me"
        );
    }

    #[test]
    fn concurrent_take_single_winner() {
        let (s, _dir) = make_store();
        let k = lookup("RACE2222");
        let now = Store::now();
        s.insert(&k, b"only once", now + 3600).unwrap();

        let threads = 16;
        let barrier = Barrier::new(threads);
        let wins: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        s.take_live(&k, now).unwrap().is_some() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(wins, 1);
    }

    #[test]
    fn reopen_keeps_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let key_bytes = *crypto::generate_key().as_bytes();
        let k = lookup("KEEP2222");
        let now = Store::now();
        {
            let s = Store::open(&path, crypto::load_key(&key_bytes).unwrap()).unwrap();
            s.insert(&k, b"durable", now + 3600).unwrap();
        }
        let s = Store::open(&path, crypto::load_key(&key_bytes).unwrap()).unwrap();
        assert_eq!(s.take_live(&k, now).unwrap().unwrap().as_slice(), b"durable");
    }

    fn put_raw(s: &Store, key: &str, bytes: &[u8]) {
        let write_txn = s.db.begin_write().unwrap();
        write_txn.open_table(SECRETS).unwrap().insert(key, bytes).unwrap();
        write_txn.commit().unwrap();
    }

    #[test]
    fn delete_expired_survives_undecodable_rows() {
        let (s, _dir) = make_store();
        let now = Store::now();
        let dead = lookup("DEAD3333");
        let live = lookup("LIVE3333");
        s.insert(&dead, b"delete me", now - 1).unwrap();
        s.insert(&live, b"keep me", now + 3600).unwrap();
        put_raw(&s, &lookup("BADROW22").to_hex(), &[RECORD_V1_MARKER, 0xff, 0xff]);
        put_raw(&s, &lookup("BADROW33").to_hex(), &[0x7f]);
        assert_eq!(s.count().unwrap(), 4);

        assert_eq!(s.delete_expired(now).unwrap(), 1);
        assert_eq!(s.count().unwrap(), 1);
        assert_eq!(
            s.take_live(&live, now).unwrap().unwrap().as_slice(),
            b"keep me"
        );
    }

    #[test]
    fn absent_record_is_always_expired() {
        let (s, _dir) = make_store();
        let record = decode(&s.absent).unwrap();
        assert!(record.is_expired(0));
        assert!(record.is_expired(Store::now()));
        assert!(s.take_live(&lookup("MISSING2"), Store::now()).unwrap().is_none());
        assert_eq!(s.count().unwrap(), 0);
    }

    #[test]
    fn decode_rejects_unknown_marker() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x7f, 0, 0]).is_err());
    }
}
