use verso_types::{NodeId, Tuid, VersoError};

/// Big-endian encoding of an `i64` with the sign bit flipped, so that
/// lexicographic byte order equals signed numeric order.
pub fn ordered_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_ordered_i64(bytes: &[u8]) -> Result<i64, VersoError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| VersoError::Storage("short ordered integer".into()))?;
    Ok((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}

fn tuid_bytes(id: Tuid) -> [u8; 8] {
    ordered_i64(id.raw())
}

/// Reject names and values that would break the `\x00` delimiter.
pub fn check_component(kind: &str, text: &str) -> Result<(), VersoError> {
    if text.as_bytes().contains(&0) {
        return Err(VersoError::InvalidArgument(format!("{kind} must not contain NUL: {text:?}")));
    }
    Ok(())
}

fn text_prefix(parts: &[&str], extra: usize) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len() + 1).sum::<usize>() + extra;
    let mut buf = Vec::with_capacity(len);
    for part in parts {
        buf.extend_from_slice(part.as_bytes());
        buf.push(0x00);
    }
    buf
}

/// `versions` keyspace: `table ++ \x00 ++ id(8) ++ update_id(8)`
pub fn version_key(table: &str, id: Tuid, update_id: Tuid) -> Vec<u8> {
    let mut buf = text_prefix(&[table], 16);
    buf.extend_from_slice(&tuid_bytes(id));
    buf.extend_from_slice(&tuid_bytes(update_id));
    buf
}

/// Prefix of every version row of one entity: `table ++ \x00 ++ id(8)`
pub fn version_prefix(table: &str, id: Tuid) -> Vec<u8> {
    let mut buf = text_prefix(&[table], 8);
    buf.extend_from_slice(&tuid_bytes(id));
    buf
}

/// Prefix of every version row in a table: `table ++ \x00`
pub fn table_prefix(table: &str) -> Vec<u8> {
    text_prefix(&[table], 0)
}

/// Entity id of a `versions` key, given the table prefix length.
pub fn version_key_id(key: &[u8], prefix_len: usize) -> Result<Tuid, VersoError> {
    let bytes = key
        .get(prefix_len..prefix_len + 8)
        .ok_or_else(|| VersoError::Storage("malformed version key".into()))?;
    decode_ordered_i64(bytes).map(Tuid::from_raw)
}

/// `indexes` keyspace: `index ++ \x00 ++ value ++ \x00 ++ clustering(8)`
///
/// The delimiter after `value` keeps a scan for "ca" from bleeding into "cat".
pub fn index_key(index: &str, value: &str, clustering: Tuid) -> Vec<u8> {
    let mut buf = text_prefix(&[index, value], 8);
    buf.extend_from_slice(&tuid_bytes(clustering));
    buf
}

pub fn index_prefix(index: &str, value: &str) -> Vec<u8> {
    text_prefix(&[index, value], 0)
}

/// `counters` keyspace: `counter ++ \x00 ++ key ++ \x00 ++ bucket(8)`
pub fn counter_key(counter: &str, key: &str, bucket: i64) -> Vec<u8> {
    let mut buf = text_prefix(&[counter, key], 8);
    buf.extend_from_slice(&ordered_i64(bucket));
    buf
}

pub fn counter_prefix(counter: &str, key: &str) -> Vec<u8> {
    text_prefix(&[counter, key], 0)
}

/// `leases` keyspace: one byte, sign-flipped so ids sort numerically.
pub fn lease_key(node_id: NodeId) -> [u8; 1] {
    [(node_id as u8) ^ 0x80]
}

pub fn decode_lease_key(key: &[u8]) -> Result<NodeId, VersoError> {
    match key {
        [b] => Ok((b ^ 0x80) as i8),
        _ => Err(VersoError::Storage("malformed lease key".into())),
    }
}

/// `lease_history` keyspace: `node(1) ++ seq(8)`, where `seq` counts the
/// rows already recorded for the node. Two rows written in the same
/// millisecond by the same identity stay distinct.
pub fn lease_history_key(node_id: NodeId, seq: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.extend_from_slice(&lease_key(node_id));
    buf.extend_from_slice(&seq.to_be_bytes());
    buf
}

/// Keyspace tag stored in a `ttl_index` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlTarget {
    Version,
    Index,
}

impl TtlTarget {
    fn tag(self) -> u8 {
        match self {
            TtlTarget::Version => b'v',
            TtlTarget::Index => b'i',
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'v' => Some(TtlTarget::Version),
            b'i' => Some(TtlTarget::Index),
            _ => None,
        }
    }
}

/// `ttl_index` keyspace: `expires_at_ms(8) ++ target(1) ++ target_key`
pub fn ttl_key(expires_at_ms: i64, target: TtlTarget, target_key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + target_key.len());
    buf.extend_from_slice(&ordered_i64(expires_at_ms));
    buf.push(target.tag());
    buf.extend_from_slice(target_key);
    buf
}

/// Exclusive upper bound for TTL entries expiring at or before `now_ms`.
pub fn ttl_bound(now_ms: i64) -> [u8; 8] {
    ordered_i64(now_ms.saturating_add(1))
}

pub fn split_ttl_key(key: &[u8]) -> Result<(i64, TtlTarget, &[u8]), VersoError> {
    if key.len() < 9 {
        return Err(VersoError::Storage("malformed ttl key".into()));
    }
    let expires = decode_ordered_i64(&key[..8])?;
    let target = TtlTarget::from_tag(key[8])
        .ok_or_else(|| VersoError::Storage("unknown ttl target".into()))?;
    Ok((expires, target, &key[9..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_i64_sorts_signed() {
        let values = [i64::MIN, -5, -1, 0, 1, 5, i64::MAX];
        for pair in values.windows(2) {
            assert!(ordered_i64(pair[0]) < ordered_i64(pair[1]));
        }
        for v in values {
            assert_eq!(decode_ordered_i64(&ordered_i64(v)).unwrap(), v);
        }
    }

    #[test]
    fn version_keys_sort_by_update_id() {
        let id = Tuid::pack(1_000, 0, 1);
        let a = version_key("users", id, id);
        let b = version_key("users", id, Tuid::pack(1_001, 0, 1));
        let c = version_key("users", id, Tuid::pack(2_000, 4, -3));
        assert!(a < b && b < c);
        assert!(a.starts_with(&version_prefix("users", id)));
        assert_eq!(version_key_id(&a, table_prefix("users").len()).unwrap(), id);
    }

    #[test]
    fn table_prefix_no_bleed() {
        let id = Tuid::pack(1_000, 0, 1);
        let user = version_key("user", id, id);
        let users = version_key("users", id, id);
        assert!(user.starts_with(&table_prefix("user")));
        assert!(!users.starts_with(&table_prefix("user")));
    }

    #[test]
    fn index_prefix_no_bleed() {
        let id = Tuid::pack(1_000, 0, 1);
        let ca = index_key("state", "CA", id);
        let cat = index_key("state", "CAT", id);
        assert!(ca.starts_with(&index_prefix("state", "CA")));
        assert!(!cat.starts_with(&index_prefix("state", "CA")));
    }

    #[test]
    fn lease_keys_sort_numerically() {
        assert!(lease_key(-127) < lease_key(-1));
        assert!(lease_key(-1) < lease_key(0));
        assert!(lease_key(0) < lease_key(127));
        for id in [-127i8, -1, 0, 42, 127] {
            assert_eq!(decode_lease_key(&lease_key(id)).unwrap(), id);
        }
    }

    #[test]
    fn lease_history_keys_sort_by_sequence_within_node() {
        assert!(lease_history_key(3, 0) < lease_history_key(3, 1));
        assert!(lease_history_key(3, 255) < lease_history_key(3, 256));
        assert!(lease_history_key(3, u64::MAX) < lease_history_key(4, 0));
        assert!(lease_history_key(3, 7).starts_with(&lease_key(3)));
    }

    #[test]
    fn ttl_keys_sort_by_expiry_and_split() {
        let early = ttl_key(1_000, TtlTarget::Index, b"zzz");
        let late = ttl_key(2_000, TtlTarget::Version, b"aaa");
        assert!(early < late);
        assert!(early.as_slice() < ttl_bound(1_000).as_slice());
        assert!(late.as_slice() >= ttl_bound(1_000).as_slice());

        let (exp, target, rest) = split_ttl_key(&late).unwrap();
        assert_eq!(exp, 2_000);
        assert_eq!(target, TtlTarget::Version);
        assert_eq!(rest, b"aaa");
    }

    #[test]
    fn nul_components_are_rejected() {
        assert!(check_component("index value", "a\0b").is_err());
        assert!(check_component("index value", "plain").is_ok());
    }
}
