//! HPACK: Header Compression for HTTP/2 (RFC 7541)
//!
//! [`Compressor`] and [`Decompressor`] each own a [`HeaderTable`]: the 61
//! static entries followed by a dynamic region that is inserted at the front
//! and evicted from the tail. Both partitions share one 1-based index space.

use std::collections::VecDeque;

use log::trace;

use crate::error::H2Error;
use crate::huffman;
use crate::settings::DEFAULT_HEADER_TABLE_SIZE;

/// Per-entry overhead added to name and value lengths (RFC 7541 Section 4.1).
pub const ENTRY_OVERHEAD: usize = 32;

/// Values shorter than this for `cookie`/`set-cookie` are never indexed.
const SHORT_COOKIE_LEN: usize = 20;

/// A single header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Pseudo-headers start with a colon (`:path`, `:status`, ...).
    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }

    /// Size as accounted by the header table.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// First value of the header called `name`, if any.
pub fn get_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name == name)
        .map(|h| h.value.as_str())
}

/// HPACK static table (RFC 7541 Appendix A), index 1 through 61.
pub static STATIC_TABLE: [(&str, &str); 61] = [
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

// ============================================================================
// Primitive representations
// ============================================================================

/// Encode `value` as an HPACK integer with an N-bit prefix (RFC 7541 Section 5.1).
/// `pattern` supplies the representation bits above the prefix.
pub fn encode_integer(value: usize, prefix_bits: u8, pattern: u8, out: &mut Vec<u8>) {
    let limit = (1usize << prefix_bits) - 1;
    if value < limit {
        out.push(pattern | value as u8);
        return;
    }
    out.push(pattern | limit as u8);
    let mut rest = value - limit;
    while rest >= 128 {
        out.push((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    out.push(rest as u8);
}

/// Decode an HPACK integer. Returns the value and the number of bytes consumed.
pub fn decode_integer(data: &[u8], prefix_bits: u8) -> Result<(usize, usize), H2Error> {
    let first = *data
        .first()
        .ok_or_else(|| H2Error::compression("truncated integer"))?;
    let limit = (1usize << prefix_bits) - 1;
    let mut value = first as usize & limit;
    if value < limit {
        return Ok((value, 1));
    }

    let mut shift = 0u32;
    for (i, &byte) in data[1..].iter().enumerate() {
        if shift > 28 {
            return Err(H2Error::compression("integer overflow"));
        }
        value += ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, i + 2));
        }
    }
    Err(H2Error::compression("truncated integer"))
}

/// String literal, Huffman-coded only when that is strictly shorter.
fn encode_string(s: &[u8], out: &mut Vec<u8>) {
    let huffman_len = huffman::encoded_len(s);
    if huffman_len < s.len() {
        encode_integer(huffman_len, 7, 0x80, out);
        huffman::encode(s, out);
    } else {
        encode_integer(s.len(), 7, 0x00, out);
        out.extend_from_slice(s);
    }
}

fn decode_string(data: &[u8]) -> Result<(Vec<u8>, usize), H2Error> {
    let huffman_coded = data.first().map(|b| b & 0x80 != 0).unwrap_or(false);
    let (len, n) = decode_integer(data, 7)?;
    let end = n
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| H2Error::compression("string literal exceeds header block"))?;
    let raw = &data[n..end];
    let bytes = if huffman_coded {
        huffman::decode(raw)?
    } else {
        raw.to_vec()
    };
    Ok((bytes, end))
}

// ============================================================================
// Header table
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    header: Header,
    /// Accounted size, taken from the wire bytes
    size: usize,
}

/// Combined static + dynamic header table.
#[derive(Debug, Clone)]
pub struct HeaderTable {
    dynamic: VecDeque<Entry>,
    size: usize,
    limit: usize,
}

impl Default for HeaderTable {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_TABLE_SIZE as usize)
    }
}

impl HeaderTable {
    pub fn new(limit: usize) -> Self {
        Self {
            dynamic: VecDeque::new(),
            size: 0,
            limit,
        }
    }

    pub fn dynamic_len(&self) -> usize {
        self.dynamic.len()
    }

    /// Bytes used by dynamic entries.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Look up a 1-based index across both partitions.
    pub fn get(&self, index: usize) -> Option<(&str, &str)> {
        if index == 0 {
            return None;
        }
        if index <= STATIC_TABLE.len() {
            return Some(STATIC_TABLE[index - 1]);
        }
        self.dynamic
            .get(index - STATIC_TABLE.len() - 1)
            .map(|e| (e.header.name.as_str(), e.header.value.as_str()))
    }

    /// Insert at the front, evicting from the tail until the entry fits.
    /// An entry larger than the whole table empties it and is not stored.
    pub fn add(&mut self, header: Header) {
        let size = header.size();
        self.insert(header, size);
    }

    fn insert(&mut self, header: Header, size: usize) {
        if size > self.limit {
            self.evict_to(0);
            return;
        }
        self.evict_to(self.limit - size);
        self.size += size;
        self.dynamic.push_front(Entry { header, size });
    }

    pub fn set_size_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.evict_to(limit);
    }

    fn evict_to(&mut self, target: usize) {
        while self.size > target {
            match self.dynamic.pop_back() {
                Some(entry) => {
                    trace!("evicting header {} from dynamic table", entry.header.name);
                    self.size -= entry.size;
                }
                None => break,
            }
        }
    }

    /// Find the best index for a field: `(index, true)` for a full match,
    /// `(index, false)` when only the name matches.
    pub fn find(&self, name: &str, value: &str) -> Option<(usize, bool)> {
        let mut name_match = None;
        let entries = STATIC_TABLE
            .iter()
            .copied()
            .chain(self.dynamic.iter().map(|e| (e.header.name.as_str(), e.header.value.as_str())));
        for (i, (n, v)) in entries.enumerate() {
            if n == name {
                if v == value {
                    return Some((i + 1, true));
                }
                if name_match.is_none() {
                    name_match = Some((i + 1, false));
                }
            }
        }
        name_match
    }
}

// ============================================================================
// Compressor
// ============================================================================

/// Turns header lists into HPACK header blocks.
///
/// Indexing policy: a field whose full name+value is already in the table is
/// emitted as an index; otherwise it is sent as a literal (reusing a matching
/// name index) and inserted into the dynamic table only when its size is below
/// half of the table limit. `authorization` and short cookies are sent
/// never-indexed.
#[derive(Debug)]
pub struct Compressor {
    table: HeaderTable,
    /// Smallest limit set since the last block, when an update is owed
    pending_update: Option<usize>,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_TABLE_SIZE as usize)
    }
}

impl Compressor {
    pub fn new(limit: usize) -> Self {
        Self {
            table: HeaderTable::new(limit),
            pending_update: None,
        }
    }

    pub fn table(&self) -> &HeaderTable {
        &self.table
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. The change is signalled at
    /// the start of the next header block.
    pub fn set_table_size_limit(&mut self, limit: usize) {
        let lowest = self.pending_update.map_or(limit, |p| p.min(limit));
        self.pending_update = Some(lowest);
        self.table.set_size_limit(limit);
    }

    /// Compress a header list into one header block.
    ///
    /// Names are lowercased, pseudo-headers are moved in front of regular
    /// headers and `cookie` values are split into their crumbs.
    pub fn compress(&mut self, headers: &[Header]) -> Vec<u8> {
        let mut out = Vec::new();

        if let Some(lowest) = self.pending_update.take() {
            if lowest < self.table.limit() {
                encode_integer(lowest, 5, 0x20, &mut out);
            }
            encode_integer(self.table.limit(), 5, 0x20, &mut out);
        }

        let pseudo = headers.iter().filter(|h| h.is_pseudo());
        let regular = headers.iter().filter(|h| !h.is_pseudo());
        for header in pseudo.chain(regular) {
            let name = header.name.to_ascii_lowercase();
            if name == "cookie" {
                for crumb in header.value.split(';').map(str::trim).filter(|c| !c.is_empty()) {
                    self.encode_field(&name, crumb, &mut out);
                }
            } else {
                self.encode_field(&name, &header.value, &mut out);
            }
        }
        out
    }

    fn encode_field(&mut self, name: &str, value: &str, out: &mut Vec<u8>) {
        let never_index = must_never_index(name, value);
        let found = self.table.find(name, value);

        if let Some((index, true)) = found {
            if !never_index {
                encode_integer(index, 7, 0x80, out);
                return;
            }
        }

        let size = name.len() + value.len() + ENTRY_OVERHEAD;
        let index_it = !never_index && size < self.table.limit() / 2;
        let (prefix, pattern) = if index_it {
            (6, 0x40)
        } else if never_index {
            (4, 0x10)
        } else {
            (4, 0x00)
        };

        match found {
            Some((name_index, _)) => encode_integer(name_index, prefix, pattern, out),
            None => {
                encode_integer(0, prefix, pattern, out);
                encode_string(name.as_bytes(), out);
            }
        }
        encode_string(value.as_bytes(), out);

        if index_it {
            self.table.add(Header::new(name, value));
        }
    }
}

fn must_never_index(name: &str, value: &str) -> bool {
    name == "authorization"
        || ((name == "cookie" || name == "set-cookie") && value.len() < SHORT_COOKIE_LEN)
}

// ============================================================================
// Decompressor
// ============================================================================

/// Turns HPACK header blocks back into header lists.
///
/// Every failure is a COMPRESSION_ERROR, since a partially applied block leaves
/// the dynamic table out of sync with the peer. The one exception is a
/// pseudo-header that follows a regular header, which is a PROTOCOL_ERROR.
#[derive(Debug)]
pub struct Decompressor {
    table: HeaderTable,
    /// Largest table size the peer may select (our SETTINGS_HEADER_TABLE_SIZE)
    max_table_size: usize,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_TABLE_SIZE as usize)
    }
}

impl Decompressor {
    pub fn new(limit: usize) -> Self {
        Self {
            table: HeaderTable::new(limit),
            max_table_size: limit,
        }
    }

    pub fn table(&self) -> &HeaderTable {
        &self.table
    }

    /// Apply our acknowledged SETTINGS_HEADER_TABLE_SIZE.
    pub fn set_max_table_size(&mut self, max: usize) {
        self.max_table_size = max;
        if self.table.limit() > max {
            self.table.set_size_limit(max);
        }
    }

    pub fn decompress(&mut self, block: &[u8]) -> Result<Vec<Header>, H2Error> {
        let mut headers: Vec<Header> = Vec::new();
        let mut seen_regular = false;
        let mut pos = 0;

        while pos < block.len() {
            let data = &block[pos..];
            let first = data[0];

            let header = if first & 0x80 != 0 {
                // Indexed
                let (index, n) = decode_integer(data, 7)?;
                pos += n;
                let (name, value) = self
                    .table
                    .get(index)
                    .ok_or_else(|| H2Error::compression(format!("invalid table index {}", index)))?;
                Header::new(name, value)
            } else if first & 0x40 != 0 {
                // Literal with incremental indexing
                let (header, raw_size, n) = self.decode_literal(data, 6)?;
                pos += n;
                self.table.insert(header.clone(), raw_size);
                header
            } else if first & 0x20 != 0 {
                // Size updates may only open a block
                if !headers.is_empty() {
                    return Err(H2Error::compression("table size update after a header field"));
                }
                let (size, n) = decode_integer(data, 5)?;
                pos += n;
                if size > self.max_table_size {
                    return Err(H2Error::compression(format!(
                        "table size update {} exceeds limit {}",
                        size, self.max_table_size
                    )));
                }
                self.table.set_size_limit(size);
                continue;
            } else {
                // Literal without indexing / never indexed
                let (header, _, n) = self.decode_literal(data, 4)?;
                pos += n;
                header
            };

            if header.is_pseudo() {
                if seen_regular {
                    return Err(H2Error::protocol(format!(
                        "pseudo-header {} after regular header",
                        header.name
                    )));
                }
            } else {
                seen_regular = true;
            }
            headers.push(header);
        }

        join_cookies(&mut headers);
        Ok(headers)
    }

    /// Returns the header, its wire-accounted size and bytes consumed.
    fn decode_literal(&self, data: &[u8], prefix_bits: u8) -> Result<(Header, usize, usize), H2Error> {
        let (name_index, mut pos) = decode_integer(data, prefix_bits)?;
        let name = if name_index == 0 {
            let (name, n) = decode_string(&data[pos..])?;
            pos += n;
            name
        } else {
            let (name, _) = self
                .table
                .get(name_index)
                .ok_or_else(|| H2Error::compression(format!("invalid name index {}", name_index)))?;
            name.as_bytes().to_vec()
        };
        let (value, n) = decode_string(&data[pos..])?;
        pos += n;

        let size = name.len() + value.len() + ENTRY_OVERHEAD;
        let header = Header::new(
            String::from_utf8_lossy(&name).into_owned(),
            String::from_utf8_lossy(&value).into_owned(),
        );
        Ok((header, size, pos))
    }
}

/// Merge repeated `cookie` fields into the first one, joined with `"; "`.
fn join_cookies(headers: &mut Vec<Header>) {
    let count = headers.iter().filter(|h| h.name == "cookie").count();
    if count < 2 {
        return;
    }
    let crumbs: Vec<String> = headers
        .iter()
        .filter(|h| h.name == "cookie")
        .map(|h| h.value.clone())
        .collect();
    let mut first = true;
    headers.retain_mut(|h| {
        if h.name != "cookie" {
            return true;
        }
        if first {
            first = false;
            h.value = crumbs.join("; ");
            true
        } else {
            false
        }
    });
}

// ============================================================================
// Tests
// ============================================================================
