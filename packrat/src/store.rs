//! Persistent storage capability.
//!
//! The station persists a handful of logical tables (mail, connection summaries, APRS message
//! records, bulletins) through a deliberately tiny capability: an opaque key→bytes map. The
//! encoding of each record is the stack's business; durability and placement are the platform's.
//!
//! Keys are ASCII strings with a `-`-separated prefix per table, eg. `winlink-mails-<MID>` or
//! `connection-<ts>`.

use alloc::string::String;
use alloc::vec::Vec;

/// Opaque key→bytes persistence.
///
/// Implementations are expected to be cheap to call; the stack performs no batching. A `false`
/// return from `save`/`delete` is treated as "storage unavailable" and logged, never fatal.
pub trait Store {
    /// Stores `value` under `key`, replacing any previous value.
    fn save(&mut self, key: &str, value: &[u8]) -> bool;

    /// Loads the value stored under `key`.
    fn load(&self, key: &str) -> Option<Vec<u8>>;

    /// Removes `key`. Returns whether a value was present.
    fn delete(&mut self, key: &str) -> bool;

    /// Lists all keys starting with `prefix`, in unspecified order.
    fn list(&self, prefix: &str) -> Vec<String>;
}

/// An in-memory [`Store`], used by tests and useful for stations without persistence.
///
/// [`Store`]: trait.Store.html
pub struct MemStore {
    map: alloc::collections::BTreeMap<String, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            map: alloc::collections::BTreeMap::new(),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemStore {
    fn save(&mut self, key: &str, value: &[u8]) -> bool {
        self.map.insert(String::from(key), value.to_vec());
        true
    }

    fn load(&self, key: &str) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    fn delete(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        self.map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}
