//! Ordered, multi-valued, case-insensitive key/value storage.
//!
//! One [`HeaderMap`] holds every kind of named value a request carries:
//! request headers, cookies, decoded query arguments and decoded POST form
//! fields, discriminated by [`ValueKind`] and selectable through a
//! [`KindMask`]. Responses use the same type with [`ValueKind::ResponseHeader`]
//! entries only.

use crate::error::Error;
use smallvec::SmallVec;
use std::fmt::{Display, Formatter};

/// Kind of a stored value. The discriminants are the public mask values of
/// the embedding API and combine with bitwise OR into a [`KindMask`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum ValueKind {
    /// Header to be emitted with a response. Never present in a session's
    /// value set, so the zero mask value is fine.
    ResponseHeader = 0,
    /// Request header as received (and trailer headers, once decoded).
    Header = 1,
    /// Cookie split out of the `Cookie` request headers.
    Cookie = 2,
    /// Decoded `application/x-www-form-urlencoded` POST field.
    PostData = 4,
    /// Decoded URL query argument.
    GetArgument = 8,
}

impl ValueKind {
    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// Bitwise-OR combination of [`ValueKind`]s.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KindMask(u32);

impl KindMask {
    pub const HEADER: KindMask = KindMask(ValueKind::Header as u32);
    pub const COOKIE: KindMask = KindMask(ValueKind::Cookie as u32);
    pub const POST_DATA: KindMask = KindMask(ValueKind::PostData as u32);
    pub const GET_ARGUMENT: KindMask = KindMask(ValueKind::GetArgument as u32);
    /// Every kind a session can carry.
    pub const ALL: KindMask = KindMask(
        ValueKind::Header as u32
            | ValueKind::Cookie as u32
            | ValueKind::PostData as u32
            | ValueKind::GetArgument as u32,
    );

    #[inline]
    pub const fn from_bits(bits: u32) -> KindMask {
        KindMask(bits)
    }

    #[inline]
    pub const fn contains(&self, kind: ValueKind) -> bool {
        kind.bits() & self.0 != 0
    }
}

impl std::ops::BitOr for KindMask {
    type Output = KindMask;

    fn bitor(self, rhs: KindMask) -> KindMask {
        KindMask(self.0 | rhs.0)
    }
}

impl From<ValueKind> for KindMask {
    fn from(kind: ValueKind) -> KindMask {
        KindMask(kind.bits())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    kind: ValueKind,
    name: Box<str>,
    value: Box<str>,
}

/// Insertion-ordered list of `(kind, name, value)` triples. Duplicate names
/// are allowed; name comparison is ASCII case-insensitive while the original
/// spelling is preserved for emission.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: SmallVec<[Entry; 8]>,
}

fn valid_text(s: &str) -> bool {
    !s.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0)
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        Self::default()
    }

    /// Appends a value. Names must be non-empty; neither names nor values may
    /// contain CR, LF or NUL.
    pub fn append(&mut self, kind: ValueKind, name: &str, value: &str) -> Result<(), Error> {
        if name.is_empty() || !valid_text(name) || !valid_text(value) {
            return Err(Error::InvalidHeader);
        }
        self.entries.push(Entry {
            kind,
            name: name.into(),
            value: value.into(),
        });
        Ok(())
    }

    /// Extends the most recently appended value with a single space and
    /// `continuation`, implementing obsolete header line folding.
    pub fn fold_last(&mut self, continuation: &str) -> Result<(), Error> {
        if !valid_text(continuation) {
            return Err(Error::InvalidHeader);
        }
        let last = self.entries.last_mut().ok_or(Error::InvalidHeader)?;
        let mut folded = String::with_capacity(last.value.len() + 1 + continuation.len());
        folded.push_str(&last.value);
        folded.push(' ');
        folded.push_str(continuation);
        last.value = folded.into();
        Ok(())
    }

    /// First value of `kind` stored under `name`, compared case-insensitively.
    pub fn first(&self, kind: ValueKind, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && e.name.eq_ignore_ascii_case(name))
            .map(|e| &*e.value)
    }

    /// Visits every entry selected by `mask` in insertion order and returns
    /// the number visited.
    pub fn for_each<F>(&self, mask: KindMask, mut f: F) -> usize
    where
        F: FnMut(ValueKind, &str, &str),
    {
        let mut count = 0;
        for e in &self.entries {
            if mask.contains(e.kind) {
                f(e.kind, &e.name, &e.value);
                count += 1;
            }
        }
        count
    }

    /// Every value of `kind` stored under `name`, in insertion order.
    pub fn all<'a>(&'a self, kind: ValueKind, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |e| e.kind == kind && e.name.eq_ignore_ascii_case(name))
            .map(|e| &*e.value)
    }

    pub fn count(&self, mask: KindMask) -> usize {
        self.entries.iter().filter(|e| mask.contains(e.kind)).count()
    }

    /// Removes every entry named `name` (case-insensitive), returning whether
    /// anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !e.name.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// All entries in insertion order, regardless of kind.
    pub fn iter(&self) -> impl Iterator<Item = (ValueKind, &str, &str)> {
        self.entries.iter().map(|e| (e.kind, &*e.name, &*e.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Display for HeaderMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for e in &self.entries {
            writeln!(f, "{}: {}", e.name, e.value)?;
        }
        Ok(())
    }
}
