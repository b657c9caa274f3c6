//! Internal key representation.
//!
//! Every record in the store is keyed by an internal key: the user key plus
//! an 8-byte trailer packing a 56-bit sequence number and a kind byte:
//!
//! ```text
//! +----------------------+---------------------------------+
//! | user key (variable)  | (seq << 8) | kind  (u64, LE)    |
//! +----------------------+---------------------------------+
//! ```
//!
//! Internal keys order by user key ascending (under the configured
//! comparator) and, for equal user keys, by trailer *descending*. Forward
//! iteration therefore visits the newest version of a key first, which the
//! read path depends on.

use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Largest sequence number representable in the 56-bit trailer field.
pub const SEQ_NUM_MAX: u64 = (1 << 56) - 1;

/// Bit marking the sequence number of an uncommitted record read through an
/// indexed batch. Such records are always visible to the batch's own reads,
/// regardless of snapshot.
pub const SEQ_NUM_BATCH_BIT: u64 = 1 << 55;

/// Whether a record with sequence number `seq` is visible to a reader that
/// captured `snapshot` (the published visible boundary; sequence numbers
/// below it are visible).
pub fn is_visible(seq: u64, snapshot: u64) -> bool {
    seq < snapshot || seq & SEQ_NUM_BATCH_BIT != 0
}

/// Number of trailer bytes appended to the user key.
pub const TRAILER_LEN: usize = 8;

/// The kind of a record, stored in the low byte of the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum InternalKeyKind {
    /// A tombstone hiding all older versions of the key.
    Delete = 0,
    /// A plain value.
    Set = 1,
    /// A merge operand, combined by the configured merge operator.
    Merge = 2,
    /// An annotation carried through the WAL; never stored.
    LogData = 3,
    /// A range tombstone; the value holds the exclusive end key.
    RangeDelete = 15,
    /// Sentinel, greater than every valid kind. Used for seek probes.
    Max = 17,
}

impl InternalKeyKind {
    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(InternalKeyKind::Delete),
            1 => Ok(InternalKeyKind::Set),
            2 => Ok(InternalKeyKind::Merge),
            3 => Ok(InternalKeyKind::LogData),
            15 => Ok(InternalKeyKind::RangeDelete),
            17 => Ok(InternalKeyKind::Max),
            _ => Err(Error::Corruption(format!("invalid record kind: {b}"))),
        }
    }
}

/// Packs a sequence number and kind into a trailer value.
pub fn make_trailer(seq: u64, kind: InternalKeyKind) -> u64 {
    (seq << 8) | kind as u64
}

/// A user key qualified with a sequence number and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub trailer: u64,
}

impl InternalKey {
    pub fn new(user_key: Vec<u8>, seq: u64, kind: InternalKeyKind) -> Self {
        Self {
            user_key,
            trailer: make_trailer(seq, kind),
        }
    }

    /// A probe key ordering before every real version of `user_key`: the
    /// maximum trailer sorts first under the descending trailer order.
    pub fn search_key(user_key: &[u8]) -> Self {
        Self::new(user_key.to_vec(), SEQ_NUM_MAX, InternalKeyKind::Max)
    }

    pub fn seq_num(&self) -> u64 {
        self.trailer >> 8
    }

    pub fn kind(&self) -> Result<InternalKeyKind> {
        InternalKeyKind::from_u8(self.trailer as u8)
    }

    /// Replaces the sequence number, keeping the kind. Used when a block
    /// carries a global sequence number override.
    pub fn set_seq_num(&mut self, seq: u64) {
        self.trailer = (seq << 8) | (self.trailer & 0xff);
    }

    /// Encoded length: user key plus the 8-byte trailer.
    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + TRAILER_LEN
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.user_key);
        buf.extend_from_slice(&self.trailer.to_le_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Splits an encoded internal key back into user key and trailer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < TRAILER_LEN {
            return Err(Error::Corruption(format!(
                "internal key too short: {} bytes",
                data.len()
            )));
        }
        let split = data.len() - TRAILER_LEN;
        let trailer = u64::from_le_bytes(data[split..].try_into().unwrap());
        Ok(Self {
            user_key: data[..split].to_vec(),
            trailer,
        })
    }
}

/// Compares two internal keys under the given user-key comparator: user key
/// ascending, then trailer descending so newer records sort first.
pub fn internal_compare(
    user_cmp: fn(&[u8], &[u8]) -> Ordering,
    a: &InternalKey,
    b: &InternalKey,
) -> Ordering {
    user_cmp(&a.user_key, &b.user_key).then_with(|| b.trailer.cmp(&a.trailer))
}

/// Length of the common prefix of two keys.
pub fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn test_trailer_packing() {
        let key = InternalKey::new(b"k".to_vec(), 42, InternalKeyKind::Set);
        assert_eq!(key.seq_num(), 42);
        assert_eq!(key.kind().unwrap(), InternalKeyKind::Set);

        let key = InternalKey::new(b"k".to_vec(), SEQ_NUM_MAX, InternalKeyKind::Max);
        assert_eq!(key.seq_num(), SEQ_NUM_MAX);
        assert_eq!(key.kind().unwrap(), InternalKeyKind::Max);
    }

    #[test]
    fn test_encode_roundtrip() {
        let key = InternalKey::new(b"hello".to_vec(), 7, InternalKeyKind::Delete);
        let decoded = InternalKey::decode(&key.encode()).expect("decode failed");
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            InternalKey::decode(b"short"),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_newest_version_sorts_first() {
        let old = InternalKey::new(b"a".to_vec(), 1, InternalKeyKind::Set);
        let new = InternalKey::new(b"a".to_vec(), 2, InternalKeyKind::Set);
        assert_eq!(internal_compare(bytewise, &new, &old), Ordering::Less);

        // A delete at the same seq sorts after a set at a higher seq but the
        // probe key sorts before everything.
        let probe = InternalKey::search_key(b"a");
        assert_eq!(internal_compare(bytewise, &probe, &new), Ordering::Less);
    }

    #[test]
    fn test_user_key_dominates() {
        let a = InternalKey::new(b"a".to_vec(), 1, InternalKeyKind::Set);
        let b = InternalKey::new(b"b".to_vec(), 100, InternalKeyKind::Set);
        assert_eq!(internal_compare(bytewise, &a, &b), Ordering::Less);
    }

    #[test]
    fn test_set_seq_num_keeps_kind() {
        let mut key = InternalKey::new(b"k".to_vec(), 5, InternalKeyKind::Merge);
        key.set_seq_num(99);
        assert_eq!(key.seq_num(), 99);
        assert_eq!(key.kind().unwrap(), InternalKeyKind::Merge);
    }

    #[test]
    fn test_visibility() {
        assert!(is_visible(4, 5));
        assert!(!is_visible(5, 5));
        assert!(!is_visible(6, 5));
        assert!(is_visible(SEQ_NUM_BATCH_BIT | 3, 5));
    }

    #[test]
    fn test_shared_prefix_len() {
        assert_eq!(shared_prefix_len(b"apple", b"application"), 4);
        assert_eq!(shared_prefix_len(b"", b"a"), 0);
        assert_eq!(shared_prefix_len(b"same", b"same"), 4);
    }
}
