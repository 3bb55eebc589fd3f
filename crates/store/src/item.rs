use std::sync::Arc;

/// Largest value accepted by the engine, matching the classic memcached
/// item-size ceiling.
pub const MAX_ITEM_BYTES: usize = 1024 * 1024;

/// Item values end with a protocol trailer so they can be written to the
/// wire verbatim.
const TRAILER: &[u8] = b"\r\n";

/// Value bytes shared between the hash table, in-flight flushes, and tap
/// consumers. Mutation replaces the whole value, never edits it in place.
pub type Value = Arc<Vec<u8>>;

/// A single key/value record passed between the engine front-end, the hash
/// table, and the backing store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    key: String,
    value: Value,
    flags: u32,
    exptime: u64,
    cas: u64,
}

impl Item {
    /// Build an item from caller-supplied bytes, appending the protocol
    /// trailer if it is missing.
    pub fn new(key: impl Into<String>, data: &[u8], flags: u32, exptime: u64) -> Self {
        let mut value = data.to_vec();
        if !value.ends_with(TRAILER) {
            value.extend_from_slice(TRAILER);
        }
        Self {
            key: key.into(),
            value: Arc::new(value),
            flags,
            exptime,
            cas: 0,
        }
    }

    /// Rehydrate an item from the backing store; the value is trusted to
    /// already carry its trailer.
    pub fn from_stored(
        key: impl Into<String>,
        value: Vec<u8>,
        flags: u32,
        exptime: u64,
        cas: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value: Arc::new(value),
            flags,
            exptime,
            cas,
        }
    }

    /// A key-only stub, used for deletion events on the tap stream.
    pub fn stub(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Arc::new(Vec::new()),
            flags: 0,
            exptime: 0,
            cas: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn data(&self) -> &[u8] {
        &self.value
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn exptime(&self) -> u64 {
        self.exptime
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    /// Append `other`'s value to this item, keeping a single trailer.
    /// Fails when the combined value would exceed [`MAX_ITEM_BYTES`].
    pub fn append(&mut self, other: &Item) -> bool {
        let head = self.trimmed().to_vec();
        self.splice(&head, other.data())
    }

    /// Prepend `other`'s value to this item, keeping a single trailer.
    /// Fails when the combined value would exceed [`MAX_ITEM_BYTES`].
    pub fn prepend(&mut self, other: &Item) -> bool {
        let head = other.trimmed().to_vec();
        let tail = self.value.clone();
        self.splice(&head, &tail)
    }

    fn splice(&mut self, head: &[u8], tail: &[u8]) -> bool {
        if head.len() + tail.len() > MAX_ITEM_BYTES {
            return false;
        }
        let mut combined = Vec::with_capacity(head.len() + tail.len());
        combined.extend_from_slice(head);
        combined.extend_from_slice(tail);
        self.value = Arc::new(combined);
        true
    }

    /// The value without its trailer.
    pub fn trimmed(&self) -> &[u8] {
        self.value
            .strip_suffix(TRAILER)
            .unwrap_or(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_is_appended_when_missing() {
        let item = Item::new("k", b"value", 0, 0);
        assert_eq!(item.data(), b"value\r\n");
    }

    #[test]
    fn trailer_is_not_doubled() {
        let item = Item::new("k", b"value\r\n", 0, 0);
        assert_eq!(item.data(), b"value\r\n");
    }

    #[test]
    fn append_joins_values_with_one_trailer() {
        let mut item = Item::new("k", b"head", 0, 0);
        let suffix = Item::new("k", b"tail", 0, 0);
        assert!(item.append(&suffix));
        assert_eq!(item.data(), b"headtail\r\n");
    }

    #[test]
    fn prepend_joins_values_with_one_trailer() {
        let mut item = Item::new("k", b"tail", 0, 0);
        let prefix = Item::new("k", b"head", 0, 0);
        assert!(item.prepend(&prefix));
        assert_eq!(item.data(), b"headtail\r\n");
    }

    #[test]
    fn append_refuses_oversized_values() {
        let mut item = Item::new("k", &vec![b'x'; MAX_ITEM_BYTES - 2], 0, 0);
        let suffix = Item::new("k", b"more", 0, 0);
        assert!(!item.append(&suffix));
        assert_eq!(item.data().len(), MAX_ITEM_BYTES);
    }

    #[test]
    fn clones_share_the_value_allocation() {
        let item = Item::new("k", b"value", 0, 0);
        let copy = item.clone();
        assert!(Arc::ptr_eq(item.value(), copy.value()));
    }
}
