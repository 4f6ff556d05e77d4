use crate::error::{Error, Result};
use crate::index::record::{self, Record};
use crate::types::KeyedBlock;

/// Bytes reserved at the front of every bucket snapshot for the number of
/// key bits that routed records into it. Opaque to record-list logic.
pub const BUCKET_PREFIX_BYTES: usize = 4;

/// One bucket's contents: a byte-lexicographically sorted run of
/// variable-length records over a dense byte buffer.
///
/// Stored keys are the shortest prefixes of the full index keys that keep
/// neighbors distinguishable: no stored key is a prefix of an adjacent one.
pub struct RecordList<'a> {
    data: &'a [u8],
}

impl<'a> RecordList<'a> {
    /// Wraps a bucket snapshot, skipping the leading bucket-bits prefix.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: &data[BUCKET_PREFIX_BYTES.min(data.len())..],
        }
    }

    /// Payload length in bytes, excluding the bucket-bits prefix.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decodes the record starting at the given payload offset.
    pub fn record_at(&self, pos: usize) -> Result<Record<'a>> {
        record::decode_entry(self.data, pos)
    }

    pub fn iter(&self) -> RecordListIter<'a> {
        RecordListIter {
            data: self.data,
            pos: 0,
        }
    }

    /// Finds the payload offset at which a record with the given key would
    /// be inserted to preserve order, together with the last record not
    /// sorting above the key, if any.
    ///
    /// Slice ordering compares byte-wise over the shorter length and breaks
    /// ties by length, which is exactly the record ordering: adjacent stored
    /// keys are never prefixes of each other, so one differing byte decides.
    /// A record equal to the key is returned as the predecessor.
    pub fn find_key_position(&self, key: &[u8]) -> Result<(usize, Option<Record<'a>>)> {
        let mut prev = None;
        for rec in self.iter() {
            let rec = rec?;
            if rec.key <= key {
                prev = Some(rec);
            } else {
                return Ok((rec.pos, prev));
            }
        }
        Ok((self.data.len(), prev))
    }

    /// Looks up the block for a full index key. A record matches when its
    /// stored key is a prefix of (or equal to) the query; the scan stops as
    /// soon as a stored key sorts above the query, keeping the longest match
    /// seen until then.
    pub fn get(&self, key: &[u8]) -> Result<Option<KeyedBlock>> {
        let mut found = None;
        for rec in self.iter() {
            let rec = rec?;
            if key.starts_with(rec.key) {
                found = Some(rec.block);
            } else if rec.key > key {
                break;
            }
        }
        Ok(found)
    }

    /// Produces a new payload with the bytes in `[cut_from, cut_to)` replaced
    /// by the encodings of `keys`, in the order given.
    ///
    /// One entry with `cut_from == cut_to` is a plain insertion. Two entries
    /// additionally rewrite the record preceding the insertion point, which
    /// keeps its block but carries a lengthened stored key.
    pub fn put_keys(
        &self,
        keys: &[(&[u8], KeyedBlock)],
        cut_from: usize,
        cut_to: usize,
    ) -> Result<Vec<u8>> {
        if cut_from > cut_to || cut_to > self.data.len() {
            return Err(Error::invalid_input(format!(
                "cut range {cut_from}..{cut_to} outside payload of {} bytes",
                self.data.len()
            )));
        }
        let added: usize = keys.iter().map(|(key, _)| record::encoded_len(key)).sum();
        let mut out = Vec::with_capacity(self.data.len() - (cut_to - cut_from) + added);
        out.extend_from_slice(&self.data[..cut_from]);
        for (key, block) in keys {
            record::encode_entry(key, block, &mut out)?;
        }
        out.extend_from_slice(&self.data[cut_to..]);
        Ok(out)
    }
}

/// Cursor over the records of one payload, yielding each record with its
/// byte position.
pub struct RecordListIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for RecordListIter<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        match record::decode_entry(self.data, self.pos) {
            Ok(rec) => {
                self.pos += rec.encoded_len();
                Some(Ok(rec))
            }
            Err(e) => {
                self.pos = self.data.len();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::record::{encode_entry, RECORD_FIXED_BYTES};

    fn encode_keys(keys: &[&str]) -> Vec<u8> {
        let mut data = vec![0u8; BUCKET_PREFIX_BYTES];
        for (i, key) in keys.iter().enumerate() {
            let block = KeyedBlock::new(i as u64, i as u32, i as u16);
            encode_entry(key.as_bytes(), &block, &mut data).unwrap();
        }
        data
    }

    /// Stored keys must stay strictly ascending. The reference fixtures
    /// below exercise list mechanics with hand-picked keys, so only the
    /// ordering invariant is checked here; prefix minimality is enforced a
    /// layer up, where records are created.
    fn assert_strictly_ascending(records: &RecordList) {
        let mut prev: Option<Vec<u8>> = None;
        for rec in records.iter() {
            let rec = rec.unwrap();
            if let Some(prev) = prev {
                assert!(prev.as_slice() < rec.key);
            }
            prev = Some(rec.key.to_vec());
        }
    }

    #[test]
    fn test_iterate_in_insertion_order() {
        let keys: Vec<String> = (0..20).map(|i| format!("key-{:02}", i)).collect();
        let data = encode_keys(&keys.iter().map(String::as_str).collect::<Vec<_>>());
        let records = RecordList::new(&data);

        let record_len = RECORD_FIXED_BYTES + 6;
        let mut count = 0;
        for (i, rec) in records.iter().enumerate() {
            let rec = rec.unwrap();
            assert_eq!(rec.key, keys[i].as_bytes());
            assert_eq!(rec.block, KeyedBlock::new(i as u64, i as u32, i as u16));
            assert_eq!(rec.pos, i * record_len);
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn test_empty_list() {
        let data = vec![0u8; BUCKET_PREFIX_BYTES];
        let records = RecordList::new(&data);
        assert!(records.is_empty());
        assert!(records.iter().next().is_none());
        assert_eq!(records.get(b"anything").unwrap(), None);
        let (pos, prev) = records.find_key_position(b"anything").unwrap();
        assert_eq!(pos, 0);
        assert!(prev.is_none());
    }

    // Reference set used across the search/insert/get tests. With the
    // 15-byte fixed record overhead the records start at payload offsets
    // 0, 16, 33, 49, 65, 82, 99 and 117; the payload is 137 bytes long.
    const REFERENCE_KEYS: [&str; 8] = ["a", "ac", "b", "d", "de", "dn", "nky", "xrlfg"];

    fn probe(records: &RecordList, key: &[u8]) -> (usize, Option<Vec<u8>>) {
        let (pos, prev) = records.find_key_position(key).unwrap();
        (pos, prev.map(|r| r.key.to_vec()))
    }

    #[test]
    fn test_find_key_position() {
        let data = encode_keys(&REFERENCE_KEYS);
        let records = RecordList::new(&data);

        // Before the first key
        assert_eq!(probe(&records, b"ABCD"), (0, None));

        // Between two keys with the same prefix, the first one shorter
        assert_eq!(probe(&records, b"ab"), (16, Some(b"a".to_vec())));

        // Between two keys with different prefixes
        assert_eq!(probe(&records, b"c"), (49, Some(b"b".to_vec())));

        // Same spot, but with a longer input key
        assert_eq!(probe(&records, b"cabefg"), (49, Some(b"b".to_vec())));

        // Between two keys sharing one character, all the same length
        assert_eq!(probe(&records, b"dg"), (82, Some(b"de".to_vec())));

        // Input key longer than its neighbors, nothing in common
        assert_eq!(probe(&records, b"hello"), (99, Some(b"dn".to_vec())));

        // Input key shorter than its left neighbor, nothing in common
        assert_eq!(probe(&records, b"pz"), (117, Some(b"nky".to_vec())));

        // After the last key
        assert_eq!(probe(&records, b"z"), (137, Some(b"xrlfg".to_vec())));
    }

    fn assert_add_key(records: &RecordList, key: &[u8]) {
        let (pos, _) = records.find_key_position(key).unwrap();
        let new_data = records
            .put_keys(&[(key, KeyedBlock::new(773, 48, 24))], pos, pos)
            .unwrap();

        let mut prefixed = vec![0u8; BUCKET_PREFIX_BYTES];
        prefixed.extend_from_slice(&new_data);
        let new_records = RecordList::new(&prefixed);
        assert_strictly_ascending(&new_records);

        let (inserted_pos, _) = new_records.find_key_position(key).unwrap();
        assert_eq!(inserted_pos, pos + RECORD_FIXED_BYTES + key.len());
        let inserted = new_records.record_at(pos).unwrap();
        assert_eq!(inserted.key, key);
        assert_eq!(inserted.block, KeyedBlock::new(773, 48, 24));
    }

    #[test]
    fn test_add_key_without_replacing() {
        let data = encode_keys(&REFERENCE_KEYS);
        let records = RecordList::new(&data);

        assert_add_key(&records, b"ABCD");
        assert_add_key(&records, b"ab");
        assert_add_key(&records, b"c");
        assert_add_key(&records, b"cabefg");
        assert_add_key(&records, b"dg");
        assert_add_key(&records, b"hello");
        assert_add_key(&records, b"pz");
        assert_add_key(&records, b"z");
    }

    fn assert_add_key_and_replace_prev(records: &RecordList, key: &[u8], new_prev_key: &[u8]) {
        let (pos, prev) = records.find_key_position(key).unwrap();
        let prev = prev.expect("probe keys all have a predecessor");

        let keys = [
            (new_prev_key, prev.block),
            (key, KeyedBlock::new(773, 48, 24)),
        ];
        let new_data = records.put_keys(&keys, prev.pos, pos).unwrap();

        let mut prefixed = vec![0u8; BUCKET_PREFIX_BYTES];
        prefixed.extend_from_slice(&new_data);
        let new_records = RecordList::new(&prefixed);
        assert_strictly_ascending(&new_records);

        // The rewritten predecessor sits where the old one was and keeps
        // its original block.
        let (new_prev_pos, _) = new_records.find_key_position(new_prev_key).unwrap();
        let rewritten = new_records.record_at(prev.pos).unwrap();
        assert_eq!(new_prev_pos, prev.pos + rewritten.encoded_len());
        assert_eq!(rewritten.key, new_prev_key);
        assert_eq!(rewritten.block, prev.block);

        // The new key follows immediately after the lengthened predecessor.
        let (inserted_pos, _) = new_records.find_key_position(key).unwrap();
        assert_eq!(
            inserted_pos,
            prev.pos + rewritten.encoded_len() + RECORD_FIXED_BYTES + key.len()
        );
        let inserted = new_records
            .record_at(prev.pos + rewritten.encoded_len())
            .unwrap();
        assert_eq!(inserted.key, key);
    }

    #[test]
    fn test_add_key_and_replace_prev() {
        let data = encode_keys(&REFERENCE_KEYS);
        let records = RecordList::new(&data);

        // Previous key is a prefix of the new key and gets one byte longer
        assert_add_key_and_replace_prev(&records, b"ab", b"aa");

        // Same, extended by several bytes
        assert_add_key_and_replace_prev(&records, b"ab", b"aaaa");

        // Previous key rewritten to a longer, still smaller one
        assert_add_key_and_replace_prev(&records, b"c", b"bx");
        assert_add_key_and_replace_prev(&records, b"cabefg", b"bbccdd");

        // Shared first character with the new key
        assert_add_key_and_replace_prev(&records, b"deq", b"dej");

        // Replacing the last record in the list
        assert_add_key_and_replace_prev(&records, b"xrlfgu", b"xrlfgs");
    }

    #[test]
    fn test_put_keys_rejects_bad_cut_range() {
        let data = encode_keys(&REFERENCE_KEYS);
        let records = RecordList::new(&data);
        let entry = [(b"q".as_slice(), KeyedBlock::new(0, 0, 0))];

        assert!(records.put_keys(&entry, 10, 5).is_err());
        assert!(records.put_keys(&entry, 0, records.len() + 1).is_err());
    }

    #[test]
    fn test_get_key() {
        let keys = ["a", "ac", "b", "de", "dn", "nky", "xrlfg"];
        let data = encode_keys(&keys);
        let records = RecordList::new(&data);

        // First key
        assert_eq!(records.get(b"a").unwrap(), Some(KeyedBlock::new(0, 0, 0)));

        // Key sharing a prefix with its predecessor
        assert_eq!(records.get(b"ac").unwrap(), Some(KeyedBlock::new(1, 1, 1)));

        // Key with the same length as two others, sharing a prefix
        assert_eq!(records.get(b"de").unwrap(), Some(KeyedBlock::new(3, 3, 3)));

        // Stored key is a prefix of the queried key
        assert_eq!(
            records.get(b"dngho").unwrap(),
            Some(KeyedBlock::new(4, 4, 4))
        );

        // Last key
        assert_eq!(
            records.get(b"xrlfg").unwrap(),
            Some(KeyedBlock::new(6, 6, 6))
        );

        // Query shorter than the stored keys it would match cannot match
        assert_eq!(records.get(b"d").unwrap(), None);

        // Before all keys
        assert_eq!(records.get(b"ABCD").unwrap(), None);

        // After all keys
        assert_eq!(records.get(b"zzzzz").unwrap(), None);

        // Shares a prefix with stored keys but matches none in full
        assert_eq!(records.get(b"dg").unwrap(), None);
    }
}
