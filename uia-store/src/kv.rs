use std::path::Path;
use uia_core::UiaError;

/// Minimal persistent key-value contract the mapper needs.
///
/// Writes must be durable before `put` returns; reads observe prior writes
/// from the same process.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, UiaError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), UiaError>;
    fn remove(&self, key: &str) -> Result<(), UiaError>;
    /// Full scan, used by the repair utility.
    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, UiaError>;
}

/// sled-backed store, one tree per directory.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(folder: &Path) -> Result<Self, UiaError> {
        let db = sled::open(folder).map_err(store_err)?;
        Ok(Self { db })
    }

    /// In-memory store for tests; nothing touches disk.
    pub fn temporary() -> Result<Self, UiaError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(store_err)?;
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, UiaError> {
        Ok(self.db.get(key).map_err(store_err)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), UiaError> {
        self.db.insert(key, value).map_err(store_err)?;
        self.db.flush().map_err(store_err)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), UiaError> {
        self.db.remove(key).map_err(store_err)?;
        self.db.flush().map_err(store_err)?;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, UiaError> {
        let mut out = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item.map_err(store_err)?;
            out.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(out)
    }
}

fn store_err(e: sled::Error) -> UiaError {
    UiaError::Store(e.to_string())
}
