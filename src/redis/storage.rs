use dashmap::DashMap;
use log::debug;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("key does not exist")]
    KeyNotFound,
    #[error("key has expired")]
    KeyExpired,
    #[error("value is not an integer or out of range")]
    NotAnInteger,
}

/// One-byte value-type tag as used by the RDB format. Live commands only
/// ever write `String`; the remaining tags are preserved when restoring a
/// snapshot produced by another server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueEncoding {
    String = 0,
    List = 1,
    Set = 2,
    ZSet = 3,
    Hash = 4,
    ZipMap = 9,
    ZipList = 10,
    IntSet = 11,
    ZSetZipList = 12,
    HashZipList = 13,
    ListQuickList = 14,
}

impl TryFrom<u8> for ValueEncoding {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0 => Ok(ValueEncoding::String),
            1 => Ok(ValueEncoding::List),
            2 => Ok(ValueEncoding::Set),
            3 => Ok(ValueEncoding::ZSet),
            4 => Ok(ValueEncoding::Hash),
            9 => Ok(ValueEncoding::ZipMap),
            10 => Ok(ValueEncoding::ZipList),
            11 => Ok(ValueEncoding::IntSet),
            12 => Ok(ValueEncoding::ZSetZipList),
            13 => Ok(ValueEncoding::HashZipList),
            14 => Ok(ValueEncoding::ListQuickList),
            other => Err(other),
        }
    }
}

/// A stored entry: raw binary value, optional absolute expiry in unix
/// milliseconds, and the encoding tag it arrived with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub raw: Vec<u8>,
    pub expiry_ms: Option<u64>,
    pub encoding: ValueEncoding,
}

impl StoredValue {
    pub fn new(raw: impl Into<Vec<u8>>, expiry_ms: Option<u64>) -> Self {
        StoredValue {
            raw: raw.into(),
            expiry_ms,
            encoding: ValueEncoding::String,
        }
    }

    pub fn with_encoding(
        raw: impl Into<Vec<u8>>,
        expiry_ms: Option<u64>,
        encoding: ValueEncoding,
    ) -> Self {
        StoredValue {
            raw: raw.into(),
            expiry_ms,
            encoding,
        }
    }

    fn expired_at(&self, now_ms: u64) -> bool {
        matches!(self.expiry_ms, Some(at) if at <= now_ms)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Thread-safe keyspace. Keys are binary-safe byte strings. Expiry is lazy:
/// a read that observes a past deadline removes the entry and reports
/// `KeyExpired`. The sharded map serializes `update` against concurrent
/// operations on the same key.
pub struct Storage {
    data: DashMap<Vec<u8>, StoredValue>,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    pub fn new() -> Self {
        Storage {
            data: DashMap::new(),
        }
    }

    pub fn set(&self, key: &[u8], value: StoredValue) {
        self.data.insert(key.to_vec(), value);
    }

    pub fn get(&self, key: &[u8]) -> Result<StoredValue, StorageError> {
        let entry = self.data.get(key).ok_or(StorageError::KeyNotFound)?;
        if entry.expired_at(now_ms()) {
            drop(entry); // release the shard lock before removing the key
            self.data.remove(key);
            return Err(StorageError::KeyExpired);
        }
        Ok(entry.clone())
    }

    pub fn remove(&self, key: &[u8]) {
        self.data.remove(key);
    }

    /// Atomic read-modify-write. The transform runs while the entry's shard
    /// lock is held, so no concurrent `get`/`set`/`remove` of the same key
    /// can interleave. A transform error leaves the map unchanged.
    pub fn update<F>(&self, key: &[u8], transform: F) -> Result<StoredValue, StorageError>
    where
        F: FnOnce(&StoredValue) -> Result<StoredValue, StorageError>,
    {
        match self.data.entry(key.to_vec()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().expired_at(now_ms()) {
                    entry.remove();
                    return Err(StorageError::KeyExpired);
                }
                let updated = transform(entry.get())?;
                entry.insert(updated.clone());
                Ok(updated)
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Err(StorageError::KeyNotFound),
        }
    }

    /// Enumerate keys matching a glob pattern (`?`, `*`, `[abc]`, `[a-z]`,
    /// `[^abc]`). Keys are matched as raw bytes; a pattern that cannot be
    /// compiled yields no matches rather than an error.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        let matcher = match glob_to_regex(pattern) {
            Some(re) => re,
            None => {
                debug!("KEYS pattern did not compile, returning no matches");
                return Vec::new();
            }
        };

        let now = now_ms();
        let mut matches = Vec::new();
        let mut reap = Vec::new();
        for entry in self.data.iter() {
            if entry.value().expired_at(now) {
                reap.push(entry.key().clone());
                continue;
            }
            if matcher.is_match(entry.key()) {
                matches.push(entry.key().clone());
            }
        }
        for key in reap {
            self.data.remove(&key);
        }
        matches
    }

    /// Bulk-replace the keyspace, used when restoring an RDB snapshot.
    pub fn restore(&self, db: HashMap<Vec<u8>, StoredValue>) {
        self.data.clear();
        for (key, value) in db {
            self.data.insert(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn flush(&self) {
        self.data.clear();
    }
}

/// Translate a Redis glob pattern into an anchored byte regex. `?` matches
/// one byte, `*` any run of bytes, bracket classes pass through with `^`
/// negation. Returns None when the pattern is not valid UTF-8 or produces
/// an uncompilable expression.
fn glob_to_regex(pattern: &[u8]) -> Option<regex::bytes::Regex> {
    let pattern = std::str::from_utf8(pattern).ok()?;
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push_str("(?s-u)^");

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            '[' => {
                translated.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    translated.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if regex_syntax_char(inner) && inner != '-' {
                        translated.push('\\');
                    }
                    translated.push(inner);
                }
                translated.push(']');
            }
            c if regex_syntax_char(c) => {
                translated.push('\\');
                translated.push(c);
            }
            c => translated.push(c),
        }
    }
    translated.push('$');

    regex::bytes::Regex::new(&translated).ok()
}

fn regex_syntax_char(c: char) -> bool {
    matches!(
        c,
        '\\' | '.' | '+' | '(' | ')' | '|' | '{' | '}' | '^' | '$' | '#' | '&' | '-' | '~' | '*'
            | '?' | '[' | ']'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_str(storage: &Storage, key: &str, value: &str) {
        storage.set(key.as_bytes(), StoredValue::new(value.as_bytes(), None));
    }

    #[test]
    fn test_set_get_roundtrip() {
        let storage = Storage::new();
        set_str(&storage, "foo", "bar");
        assert_eq!(storage.get(b"foo").unwrap().raw, b"bar");
    }

    #[test]
    fn test_get_missing_key() {
        let storage = Storage::new();
        assert_eq!(storage.get(b"nope").unwrap_err(), StorageError::KeyNotFound);
    }

    #[test]
    fn test_set_overwrites_and_clears_ttl() {
        let storage = Storage::new();
        storage.set(b"k", StoredValue::new(&b"v1"[..], Some(now_ms() + 60_000)));
        storage.set(b"k", StoredValue::new(&b"v2"[..], None));
        let value = storage.get(b"k").unwrap();
        assert_eq!(value.raw, b"v2");
        assert_eq!(value.expiry_ms, None);
    }

    #[test]
    fn test_lazy_expiry_removes_entry() {
        let storage = Storage::new();
        storage.set(b"gone", StoredValue::new(&b"v"[..], Some(now_ms() - 1)));
        assert_eq!(storage.get(b"gone").unwrap_err(), StorageError::KeyExpired);
        // second read no longer sees the entry at all
        assert_eq!(storage.get(b"gone").unwrap_err(), StorageError::KeyNotFound);
    }

    #[test]
    fn test_update_applies_transform_under_lock() {
        let storage = Storage::new();
        set_str(&storage, "n", "41");
        let updated = storage
            .update(b"n", |current| {
                let number = String::from_utf8(current.raw.clone())
                    .unwrap()
                    .parse::<i64>()
                    .unwrap();
                Ok(StoredValue::new(
                    (number + 1).to_string().into_bytes(),
                    current.expiry_ms,
                ))
            })
            .unwrap();
        assert_eq!(updated.raw, b"42");
        assert_eq!(storage.get(b"n").unwrap().raw, b"42");
    }

    #[test]
    fn test_update_error_leaves_value_unchanged() {
        let storage = Storage::new();
        set_str(&storage, "k", "abc");
        let err = storage
            .update(b"k", |_| Err(StorageError::NotAnInteger))
            .unwrap_err();
        assert_eq!(err, StorageError::NotAnInteger);
        assert_eq!(storage.get(b"k").unwrap().raw, b"abc");
    }

    #[test]
    fn test_update_missing_key() {
        let storage = Storage::new();
        let err = storage.update(b"k", |v| Ok(v.clone())).unwrap_err();
        assert_eq!(err, StorageError::KeyNotFound);
    }

    #[test]
    fn test_keys_glob_star_and_question_mark() {
        let storage = Storage::new();
        set_str(&storage, "hello", "1");
        set_str(&storage, "hxllo", "2");
        set_str(&storage, "halo", "3");

        let mut matched = storage.keys(b"h*llo");
        matched.sort();
        assert_eq!(matched, vec![b"hello".to_vec(), b"hxllo".to_vec()]);

        let mut matched = storage.keys(b"h?llo");
        matched.sort();
        assert_eq!(matched, vec![b"hello".to_vec(), b"hxllo".to_vec()]);

        assert_eq!(storage.keys(b"*").len(), 3);
    }

    #[test]
    fn test_keys_glob_classes() {
        let storage = Storage::new();
        set_str(&storage, "hallo", "1");
        set_str(&storage, "hbllo", "2");
        set_str(&storage, "hello", "3");

        let mut matched = storage.keys(b"h[ab]llo");
        matched.sort();
        assert_eq!(matched, vec![b"hallo".to_vec(), b"hbllo".to_vec()]);

        let mut matched = storage.keys(b"h[a-b]llo");
        matched.sort();
        assert_eq!(matched, vec![b"hallo".to_vec(), b"hbllo".to_vec()]);

        let mut matched = storage.keys(b"h[^e]llo");
        matched.sort();
        assert_eq!(matched, vec![b"hallo".to_vec(), b"hbllo".to_vec()]);
    }

    #[test]
    fn test_keys_pattern_is_anchored() {
        let storage = Storage::new();
        set_str(&storage, "key", "1");
        set_str(&storage, "key:sub", "2");
        assert_eq!(storage.keys(b"key"), vec![b"key".to_vec()]);
    }

    #[test]
    fn test_keys_skips_expired() {
        let storage = Storage::new();
        set_str(&storage, "alive", "1");
        storage.set(b"dead", StoredValue::new(&b"2"[..], Some(now_ms() - 1)));
        assert_eq!(storage.keys(b"*"), vec![b"alive".to_vec()]);
    }

    #[test]
    fn test_keys_with_binary_keys() {
        let storage = Storage::new();
        storage.set(&[0xff, 0x00, 0x01], StoredValue::new(&b"v"[..], None));
        set_str(&storage, "plain", "v");
        assert_eq!(storage.keys(b"*").len(), 2);
        assert_eq!(storage.keys(b"plain"), vec![b"plain".to_vec()]);
    }

    #[test]
    fn test_restore_replaces_contents() {
        let storage = Storage::new();
        set_str(&storage, "old", "1");
        let mut db = HashMap::new();
        db.insert(b"new".to_vec(), StoredValue::new(&b"2"[..], None));
        storage.restore(db);
        assert!(storage.get(b"old").is_err());
        assert_eq!(storage.get(b"new").unwrap().raw, b"2");
    }
}
