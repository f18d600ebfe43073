use std::collections::HashMap;

use parking_lot::RwLock;

/// Application-side lookup of the newest downloaded dive's fingerprint for a
/// device, keyed by its "Vendor Product" label and serial string.
///
/// `None` (or an empty vector) means nothing was downloaded before, which is
/// a normal outcome. Closures implement this trait.
pub trait FingerprintLookup: Send + Sync {
    fn lookup(&self, device_type: &str, serial: &str) -> Option<Vec<u8>>;
}

impl<F> FingerprintLookup for F
where
    F: Fn(&str, &str) -> Option<Vec<u8>> + Send + Sync,
{
    fn lookup(&self, device_type: &str, serial: &str) -> Option<Vec<u8>> {
        self(device_type, serial)
    }
}

/// Serial as the lookup key expects it: eight lowercase hex digits.
pub fn serial_key(serial: u32) -> String {
    format!("{serial:08x}")
}

/// In-memory fingerprint table. Persisting it across runs is up to the
/// application.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `fingerprint` as the newest dive of the device. An empty
    /// fingerprint clears the entry.
    pub fn insert(&self, device_type: &str, serial: &str, fingerprint: &[u8]) {
        let key = (device_type.to_string(), serial.to_string());
        let mut entries = self.entries.write();
        if fingerprint.is_empty() {
            entries.remove(&key);
        } else {
            entries.insert(key, fingerprint.to_vec());
        }
    }

    pub fn remove(&self, device_type: &str, serial: &str) -> Option<Vec<u8>> {
        self.entries
            .write()
            .remove(&(device_type.to_string(), serial.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl FingerprintLookup for FingerprintStore {
    fn lookup(&self, device_type: &str, serial: &str) -> Option<Vec<u8>> {
        self.entries
            .read()
            .get(&(device_type.to_string(), serial.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_key_format() {
        assert_eq!(serial_key(0xDEADBEEF), "deadbeef");
        assert_eq!(serial_key(0x1A2B), "00001a2b");
        assert_eq!(serial_key(0), "00000000");
    }

    #[test]
    fn test_closure_lookup() {
        let lookup = |device_type: &str, serial: &str| {
            (device_type == "Suunto EON Steel" && serial == "deadbeef").then(|| vec![0xAAu8, 0xBB])
        };
        assert_eq!(
            lookup.lookup("Suunto EON Steel", "deadbeef"),
            Some(vec![0xAA, 0xBB])
        );
        assert_eq!(lookup.lookup("Suunto EON Steel", "00000001"), None);
    }

    #[test]
    fn test_store_insert_lookup_remove() {
        let store = FingerprintStore::new();
        assert!(store.is_empty());

        store.insert("Shearwater Perdix 2", "0000abcd", &[1, 2, 3, 4]);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.lookup("Shearwater Perdix 2", "0000abcd"),
            Some(vec![1, 2, 3, 4])
        );
        assert_eq!(store.lookup("Shearwater Perdix", "0000abcd"), None);

        store.insert("Shearwater Perdix 2", "0000abcd", &[9]);
        assert_eq!(store.lookup("Shearwater Perdix 2", "0000abcd"), Some(vec![9]));

        assert_eq!(store.remove("Shearwater Perdix 2", "0000abcd"), Some(vec![9]));
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_empty_fingerprint_clears() {
        let store = FingerprintStore::new();
        store.insert("Suunto D5", "00000001", &[7]);
        store.insert("Suunto D5", "00000001", &[]);
        assert!(store.is_empty());
    }
}
