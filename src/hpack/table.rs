//! RFC 7541 §2.3 / Appendix A: the 61-entry static table and the per-connection
//! dynamic table (a size-bounded FIFO with combined name+value lookup).

use std::collections::VecDeque;

/// RFC 7541 Appendix A, 1-indexed when combined with the dynamic table.
#[rustfmt::skip]
pub(super) const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Result of a combined static+dynamic table lookup, used by the encoder to
/// pick the cheapest representation for a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Match {
    /// Both name and value matched at this 1-based index.
    Full(usize),
    /// Only the name matched, at this 1-based index.
    NameOnly(usize),
    None,
}

/// The per-connection dynamic table (RFC 7541 §2.3.2). Entries are inserted
/// at the front and evicted from the back once the size budget is exceeded.
#[derive(Debug, Clone)]
pub(super) struct DynamicTable {
    entries: VecDeque<(String, String)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    /// Each entry's size is `len(name) + len(value) + 32` (RFC 7541 §4.1).
    const ENTRY_OVERHEAD: usize = 32;

    pub fn new(max_size: usize) -> Self {
        Self { entries: VecDeque::new(), size: 0, max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn entry_size(name: &str, value: &str) -> usize {
        name.len() + value.len() + Self::ENTRY_OVERHEAD
    }

    /// Insert a new entry at the front, evicting from the back until the
    /// table fits within `max_size`. An entry larger than the whole table
    /// empties it entirely rather than being stored (RFC 7541 §4.4).
    pub fn insert(&mut self, name: String, value: String) {
        let entry_size = Self::entry_size(&name, &value);
        self.evict_to_fit(entry_size);
        if entry_size > self.max_size {
            return;
        }
        self.size += entry_size;
        self.entries.push_front((name, value));
    }

    fn evict_to_fit(&mut self, incoming: usize) {
        while self.size + incoming > self.max_size {
            match self.entries.pop_back() {
                Some((name, value)) => self.size -= Self::entry_size(&name, &value),
                None => break,
            }
        }
    }

    /// Change the maximum size, evicting as needed. Driven by a dynamic
    /// table size update representation, itself bounded by the
    /// `SETTINGS_HEADER_TABLE_SIZE` the peer last acknowledged.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to_fit(0);
    }

    /// Fetch by 0-based dynamic-table position (most recently inserted first).
    pub fn get(&self, index: usize) -> Option<&(String, String)> {
        self.entries.get(index)
    }

    pub fn find(&self, name: &str, value: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, v)| n == name && v == value)
    }

    pub fn find_name(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }
}

/// Look up `(name, value)` across the static table then the dynamic table,
/// returning the combined 1-based index per RFC 7541 §2.3.3.
pub(super) fn lookup(dynamic: &DynamicTable, name: &str, value: &str) -> Match {
    if let Some(i) = STATIC_TABLE.iter().position(|&(n, v)| n == name && v == value) {
        return Match::Full(i + 1);
    }
    if let Some(i) = dynamic.find(name, value) {
        return Match::Full(STATIC_TABLE.len() + 1 + i);
    }
    if let Some(i) = STATIC_TABLE.iter().position(|&(n, _)| n == name) {
        return Match::NameOnly(i + 1);
    }
    if let Some(i) = dynamic.find_name(name) {
        return Match::NameOnly(STATIC_TABLE.len() + 1 + i);
    }
    Match::None
}

/// Resolve a combined 1-based index to `(name, value)`, searching the static
/// table then the dynamic table.
pub(super) fn resolve(dynamic: &DynamicTable, index: usize) -> Option<(String, String)> {
    if index == 0 {
        return None;
    }
    let index = index - 1;
    if index < STATIC_TABLE.len() {
        let (n, v) = STATIC_TABLE[index];
        return Some((n.to_string(), v.to_string()));
    }
    dynamic.get(index - STATIC_TABLE.len()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_has_61_entries() {
        assert_eq!(STATIC_TABLE.len(), 61);
        assert_eq!(STATIC_TABLE[0], (":authority", ""));
        assert_eq!(STATIC_TABLE[1], (":method", "GET"));
        assert_eq!(STATIC_TABLE[60], ("www-authenticate", ""));
    }

    #[test]
    fn dynamic_table_evicts_oldest_first() {
        let mut table = DynamicTable::new(64);
        table.insert("a".into(), "1".into()); // 34 bytes
        table.insert("b".into(), "2".into()); // 34 bytes, evicts "a"
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0), Some(&("b".to_string(), "2".to_string())));
    }

    #[test]
    fn entry_larger_than_table_is_dropped() {
        let mut table = DynamicTable::new(16);
        table.insert("name".into(), "a-much-too-long-value".into());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn resize_down_evicts() {
        let mut table = DynamicTable::new(256);
        table.insert("a".into(), "1".into());
        table.insert("b".into(), "2".into());
        table.set_max_size(34);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0), Some(&("b".to_string(), "2".to_string())));
    }

    #[test]
    fn lookup_finds_static_full_match() {
        let dynamic = DynamicTable::new(4096);
        assert_eq!(lookup(&dynamic, ":method", "GET"), Match::Full(2));
    }

    #[test]
    fn lookup_finds_dynamic_after_static() {
        let mut dynamic = DynamicTable::new(4096);
        dynamic.insert("x-custom".into(), "value".into());
        assert_eq!(lookup(&dynamic, "x-custom", "value"), Match::Full(62));
        assert_eq!(resolve(&dynamic, 62), Some(("x-custom".to_string(), "value".to_string())));
    }

    #[test]
    fn lookup_name_only_falls_back() {
        let dynamic = DynamicTable::new(4096);
        assert_eq!(lookup(&dynamic, ":method", "PATCH"), Match::NameOnly(2));
    }
}
