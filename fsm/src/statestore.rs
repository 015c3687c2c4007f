// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::Error;
use db::Store;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{from_slice, to_vec, RawBytes};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Layout version written with every record. Records persisted by a
/// different version refuse to load.
pub const RECORD_VERSION: u64 = 1;

/// On-disk envelope around a serialized deal record.
#[derive(Serialize_tuple, Deserialize_tuple)]
struct VersionedRecord {
    version: u64,
    data: RawBytes,
}

/// Typed record store over a key prefix of a backing [`Store`]. Records
/// are serialized as DAG-CBOR inside a versioned envelope. A side index
/// of live keys is kept under the prefix so records can be enumerated.
pub struct StateStore<DB, T> {
    db: Arc<DB>,
    prefix: String,
    // serializes read-modify-write cycles on the key index
    index_lock: Arc<Mutex<()>>,
    _records: PhantomData<T>,
}

impl<DB, T> Clone for StateStore<DB, T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            prefix: self.prefix.clone(),
            index_lock: self.index_lock.clone(),
            _records: PhantomData,
        }
    }
}

impl<DB, T> StateStore<DB, T>
where
    DB: Store,
    T: Serialize + DeserializeOwned,
{
    pub fn new(db: Arc<DB>, prefix: &str) -> Self {
        Self {
            db,
            prefix: prefix.to_owned(),
            index_lock: Arc::new(Mutex::new(())),
            _records: PhantomData,
        }
    }

    fn record_key(&self, key: &str) -> Vec<u8> {
        format!("{}/{}", self.prefix, key).into_bytes()
    }

    fn index_key(&self) -> Vec<u8> {
        format!("{}/__keys", self.prefix).into_bytes()
    }

    fn read_index(&self) -> Result<Vec<String>, Error> {
        match self.db.read(self.index_key())? {
            Some(bz) => Ok(from_slice(&bz)?),
            None => Ok(Vec::new()),
        }
    }

    fn write_index(&self, keys: &[String]) -> Result<(), Error> {
        self.db.write(self.index_key(), to_vec(&keys.to_vec())?)?;
        Ok(())
    }

    /// Start tracking a record. Errors if the key is already live.
    pub fn begin(&self, key: &str, record: &T) -> Result<(), Error> {
        let _guard = self.index_lock.lock();
        if self.db.exists(self.record_key(key))? {
            return Err(Error::AlreadyTracked(key.to_owned()));
        }
        self.put(key, record)?;
        let mut keys = self.read_index()?;
        keys.push(key.to_owned());
        self.write_index(&keys)
    }

    /// Overwrite the record under `key`.
    pub fn put(&self, key: &str, record: &T) -> Result<(), Error> {
        let envelope = VersionedRecord {
            version: RECORD_VERSION,
            data: RawBytes::new(to_vec(record)?),
        };
        self.db.write(self.record_key(key), to_vec(&envelope)?)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<T, Error> {
        let bz = self
            .db
            .read(self.record_key(key))?
            .ok_or_else(|| Error::NotFound(key.to_owned()))?;
        let envelope: VersionedRecord = from_slice(&bz)?;
        if envelope.version != RECORD_VERSION {
            return Err(Error::UnsupportedVersion(envelope.version));
        }
        Ok(from_slice(envelope.data.bytes())?)
    }

    pub fn has(&self, key: &str) -> Result<bool, Error> {
        Ok(self.db.exists(self.record_key(key))?)
    }

    /// Stop tracking a record and delete it.
    pub fn end(&self, key: &str) -> Result<(), Error> {
        let _guard = self.index_lock.lock();
        self.db.delete(self.record_key(key))?;
        let keys = self
            .read_index()?
            .into_iter()
            .filter(|k| k != key)
            .collect::<Vec<_>>();
        self.write_index(&keys)
    }

    /// Snapshot of every live key.
    pub fn keys(&self) -> Result<Vec<String>, Error> {
        self.read_index()
    }

    /// Snapshot of every live record.
    pub fn list(&self) -> Result<Vec<T>, Error> {
        self.read_index()?
            .iter()
            .map(|k| self.get(k))
            .collect::<Result<Vec<_>, _>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryDB;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        state: u64,
        msg: String,
    }

    #[test]
    fn track_and_list() {
        let store: StateStore<_, Rec> = StateStore::new(Arc::new(MemoryDB::default()), "/deals");
        let rec = Rec {
            state: 0,
            msg: String::new(),
        };
        store.begin("a", &rec).unwrap();
        assert!(store.begin("a", &rec).is_err());
        store
            .begin(
                "b",
                &Rec {
                    state: 3,
                    msg: "other".to_owned(),
                },
            )
            .unwrap();

        assert_eq!(store.get("a").unwrap(), rec);
        assert_eq!(store.list().unwrap().len(), 2);

        store.end("a").unwrap();
        assert!(matches!(store.get("a"), Err(Error::NotFound(_))));
        assert_eq!(store.keys().unwrap(), vec!["b".to_owned()]);
    }

    #[test]
    fn version_refused() {
        let db = Arc::new(MemoryDB::default());
        let store: StateStore<_, Rec> = StateStore::new(db.clone(), "/deals");
        let envelope = VersionedRecord {
            version: RECORD_VERSION + 1,
            data: RawBytes::new(
                to_vec(&Rec {
                    state: 0,
                    msg: String::new(),
                })
                .unwrap(),
            ),
        };
        db.write(b"/deals/x".to_vec(), to_vec(&envelope).unwrap())
            .unwrap();
        assert!(matches!(
            store.get("x"),
            Err(Error::UnsupportedVersion(v)) if v == RECORD_VERSION + 1
        ));
    }
}
