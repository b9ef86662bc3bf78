//! Wire-format domain names.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::wire::{ParseError, WireRead};

/// The largest wire size of a domain name.
pub const MAX_NAME_SIZE: usize = 255;

/// The largest size of a single label.
pub const MAX_LABEL_SIZE: usize = 63;

/// The largest number of labels in a name (excluding the root).
///
/// A name of 255 bytes can hold at most 127 one-byte labels.
pub const MAX_LABELS: usize = 127;

//----------- DomainName -------------------------------------------------------

/// A domain name.
///
/// The name is kept in uncompressed wire format: a sequence of
/// length-prefixed labels, terminated by the zero-length root label.  The
/// original spelling is preserved; equality, ordering and hashing are
/// case-insensitive over ASCII.
///
/// The `Ord` implementation is the DNSSEC canonical order: names compare
/// label by label starting from the root, each label as lowercase bytes.
/// Maps keyed by [`DomainName`] are therefore in canonical zone order.
#[derive(Clone)]
pub struct DomainName {
    /// The wire-format name.
    ///
    /// Invariants:
    ///
    /// - Well-formed: length-prefixed labels ending in the root label.
    /// - At most [`MAX_NAME_SIZE`] bytes; labels of at most
    ///   [`MAX_LABEL_SIZE`] bytes.
    wire: Bytes,
}

impl DomainName {
    /// The root name.
    pub fn root() -> Self {
        Self {
            wire: Bytes::from_static(&[0]),
        }
    }

    /// Construct a name from wire-format bytes.
    ///
    /// The entire buffer must be a single well-formed name; compression
    /// pointers are not accepted here (resolving them is the business of
    /// the packet codec).
    pub fn from_wire(wire: Bytes) -> Result<Self, ParseError> {
        let mut read = WireRead::new(&wire);
        Self::skip_wire(&mut read)?;
        if !read.is_empty() {
            return Err(ParseError::Malformed);
        }
        Ok(Self { wire })
    }

    /// Read a name from the current position of a wire reader.
    pub fn parse_wire(read: &mut WireRead<'_>) -> Result<Self, ParseError> {
        let start = read.offset();
        let copy = *read;
        Self::skip_wire(read)?;
        let len = read.offset() - start;
        let mut all = copy;
        let bytes = all.take(len)?;
        Ok(Self {
            wire: Bytes::copy_from_slice(bytes),
        })
    }

    /// Skip over a wire-format name, validating it.
    fn skip_wire(read: &mut WireRead<'_>) -> Result<(), ParseError> {
        let mut size = 0usize;
        loop {
            let len = read.get_u8()? as usize;
            if len == 0 {
                size += 1;
                if size > MAX_NAME_SIZE {
                    return Err(ParseError::Malformed);
                }
                return Ok(());
            }
            if len > MAX_LABEL_SIZE {
                // The two top bits signal a compression pointer, which has
                // no place in stored names.
                return Err(ParseError::Malformed);
            }
            read.take(len)?;
            size += 1 + len;
            if size > MAX_NAME_SIZE {
                return Err(ParseError::Malformed);
            }
        }
    }

    /// The wire-format bytes of this name.
    pub fn as_wire(&self) -> &[u8] {
        &self.wire
    }

    /// The wire size of this name.
    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }

    /// Whether this is the root name.
    pub fn is_root(&self) -> bool {
        self.wire.len() == 1
    }

    /// Whether the first label is the wildcard label.
    pub fn is_wildcard(&self) -> bool {
        self.wire.len() >= 2 && self.wire[0] == 1 && self.wire[1] == b'*'
    }

    /// The number of labels, excluding the root.
    pub fn label_count(&self) -> u8 {
        self.labels().count() as u8
    }

    /// Iterate over the labels, in wire order, excluding the root.
    pub fn labels(&self) -> Labels<'_> {
        Labels {
            wire: &self.wire,
            pos: 0,
        }
    }

    /// The name without its first label.
    ///
    /// Returns [`None`] for the root name.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let skip = 1 + self.wire[0] as usize;
        Some(Self {
            wire: self.wire.slice(skip..),
        })
    }

    /// Whether this name is `other` or a subdomain of it.
    pub fn ends_with(&self, other: &Self) -> bool {
        if other.wire.len() > self.wire.len() {
            return false;
        }
        let tail = &self.wire[self.wire.len() - other.wire.len()..];
        tail.eq_ignore_ascii_case(&other.wire)
    }

    /// A copy of this name with all labels lowercased.
    pub fn to_lowercase(&self) -> Self {
        Self {
            wire: Bytes::from(self.wire.to_ascii_lowercase()),
        }
    }
}

//--- Comparison

impl DomainName {
    /// Collect the start offset of every label.
    fn label_offsets(&self, offsets: &mut [u8; MAX_LABELS]) -> usize {
        let mut count = 0;
        let mut pos = 0usize;
        while self.wire[pos] != 0 {
            offsets[count] = pos as u8;
            count += 1;
            pos += 1 + self.wire[pos] as usize;
        }
        count
    }

    fn label_at(&self, offset: u8) -> &[u8] {
        let pos = offset as usize;
        let len = self.wire[pos] as usize;
        &self.wire[pos + 1..pos + 1 + len]
    }

    /// Compare two names in DNSSEC canonical order.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        let mut self_offs = [0u8; MAX_LABELS];
        let mut other_offs = [0u8; MAX_LABELS];
        let self_count = self.label_offsets(&mut self_offs);
        let other_count = other.label_offsets(&mut other_offs);

        // Walk the labels from the root upward.
        let common = self_count.min(other_count);
        for i in 1..=common {
            let a = self.label_at(self_offs[self_count - i]);
            let b = other.label_at(other_offs[other_count - i]);
            match cmp_label(a, b) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        self_count.cmp(&other_count)
    }
}

/// Compare two labels as lowercase bytes.
fn cmp_label(a: &[u8], b: &[u8]) -> Ordering {
    let common = a.len().min(b.len());
    for i in 0..common {
        match a[i].to_ascii_lowercase().cmp(&b[i].to_ascii_lowercase()) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

impl PartialEq for DomainName {
    fn eq(&self, other: &Self) -> bool {
        self.wire.eq_ignore_ascii_case(&other.wire)
    }
}

impl Eq for DomainName {}

impl PartialOrd for DomainName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DomainName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_cmp(other)
    }
}

impl Hash for DomainName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for &b in self.wire.iter() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

//--- Text conversion

impl FromStr for DomainName {
    type Err = NameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(NameParseError::Empty);
        }
        if s == "." {
            return Ok(Self::root());
        }

        let s = s.strip_suffix('.').unwrap_or(s);
        let mut wire = Vec::with_capacity(s.len() + 2);
        let mut label = Vec::with_capacity(MAX_LABEL_SIZE);
        let mut chars = s.bytes();
        loop {
            match chars.next() {
                Some(b'.') | None => {
                    if label.is_empty() {
                        return Err(NameParseError::EmptyLabel);
                    }
                    if label.len() > MAX_LABEL_SIZE {
                        return Err(NameParseError::LabelTooLong);
                    }
                    wire.push(label.len() as u8);
                    wire.append(&mut label);
                    if chars.len() == 0 {
                        break;
                    }
                }
                Some(b'\\') => {
                    // '\NNN' decimal escape, or a literally escaped byte.
                    let b = chars.next().ok_or(NameParseError::BadEscape)?;
                    if b.is_ascii_digit() {
                        let mut value = (b - b'0') as u32;
                        for _ in 0..2 {
                            let d = chars.next().ok_or(NameParseError::BadEscape)?;
                            if !d.is_ascii_digit() {
                                return Err(NameParseError::BadEscape);
                            }
                            value = value * 10 + (d - b'0') as u32;
                        }
                        let value = u8::try_from(value).map_err(|_| NameParseError::BadEscape)?;
                        label.push(value);
                    } else {
                        label.push(b);
                    }
                }
                Some(b) => label.push(b),
            }
        }
        wire.push(0);
        if wire.len() > MAX_NAME_SIZE {
            return Err(NameParseError::TooLong);
        }
        Ok(Self {
            wire: Bytes::from(wire),
        })
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for label in self.labels() {
            for &b in label {
                match b {
                    b'.' | b'\\' => write!(f, "\\{}", b as char)?,
                    0x21..=0x7e => write!(f, "{}", b as char)?,
                    _ => write!(f, "\\{b:03}")?,
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainName({self})")
    }
}

//--- Serde (presentation form)

impl Serialize for DomainName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DomainName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

//----------- Labels -----------------------------------------------------------

/// An iterator over the labels of a [`DomainName`].
#[derive(Clone, Debug)]
pub struct Labels<'a> {
    wire: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Labels<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.wire[self.pos] as usize;
        if len == 0 {
            return None;
        }
        let label = &self.wire[self.pos + 1..self.pos + 1 + len];
        self.pos += 1 + len;
        Some(label)
    }
}

//----------- NameParseError ---------------------------------------------------

/// An error in parsing a domain name from text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameParseError {
    /// The input was empty.
    Empty,

    /// A label was empty.
    EmptyLabel,

    /// A label exceeded 63 bytes.
    LabelTooLong,

    /// The whole name exceeded 255 bytes.
    TooLong,

    /// A backslash escape was malformed.
    BadEscape,
}

impl std::error::Error for NameParseError {}

impl fmt::Display for NameParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "the name is empty",
            Self::EmptyLabel => "the name contains an empty label",
            Self::LabelTooLong => "a label exceeds 63 bytes",
            Self::TooLong => "the name exceeds 255 bytes",
            Self::BadEscape => "the name contains a malformed escape",
        })
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::DomainName;
    use std::cmp::Ordering;

    fn name(s: &str) -> DomainName {
        s.parse().unwrap()
    }

    #[test]
    fn text_round_trip() {
        for text in ["example.com.", "a.b.c.example.", "*.example.org.", "."] {
            assert_eq!(name(text).to_string(), text);
        }
        // A missing final dot is accepted on input.
        assert_eq!(name("example.com").to_string(), "example.com.");
    }

    #[test]
    fn wire_form() {
        let n = name("example.com.");
        assert_eq!(n.as_wire(), b"\x07example\x03com\x00");
        assert_eq!(n.label_count(), 2);
        assert!(!n.is_wildcard());
        assert!(name("*.example.com.").is_wildcard());
    }

    #[test]
    fn case_insensitive_eq() {
        assert_eq!(name("Example.COM."), name("example.com."));
        assert_eq!(name("Example.COM.").canonical_cmp(&name("example.com.")), Ordering::Equal);
    }

    #[test]
    fn canonical_order() {
        // The canonical order example from RFC 4034, section 6.1.
        let ordered = [
            "example.",
            "a.example.",
            "yljkjljk.a.example.",
            "Z.a.example.",
            "zABC.a.EXAMPLE.",
            "z.example.",
            "\\001.z.example.",
            "*.z.example.",
            "\\200.z.example.",
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                name(pair[0]).canonical_cmp(&name(pair[1])),
                Ordering::Less,
                "{} < {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn parents() {
        let n = name("a.b.example.com.");
        assert_eq!(n.parent().unwrap(), name("b.example.com."));
        assert!(n.ends_with(&name("example.com.")));
        assert!(!n.ends_with(&name("com.example.")));
        assert!(DomainName::root().parent().is_none());
    }

    #[test]
    fn rejects_bad_names() {
        assert!("..".parse::<DomainName>().is_err());
        assert!("".parse::<DomainName>().is_err());
        let long_label = "a".repeat(64);
        assert!(format!("{long_label}.example.").parse::<DomainName>().is_err());
        let long_name = format!("{}.", "abcdefg.".repeat(33));
        assert!(long_name.parse::<DomainName>().is_err());
    }
}
