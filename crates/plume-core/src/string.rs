/// Interned byte strings shared by the lexer, the constant pool and debug info.
///
/// Every string the compiler touches (names, literals, debug names) is interned
/// exactly once; equal byte sequences always map to the same `StringId`, so the
/// compiler can compare names and de-duplicate constants by id alone.
use indexmap::IndexSet;
use std::borrow::Cow;
use std::fmt;

/// An opaque handle to a string in the interner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct StringId(pub u32);

/// String interner backed by an insertion-ordered set, so ids are dense and stable.
#[derive(Default, Clone)]
pub struct StringInterner {
    strings: IndexSet<Box<[u8]>>,
}

impl StringInterner {
    /// Create a new empty interner.
    pub fn new() -> Self {
        StringInterner {
            strings: IndexSet::new(),
        }
    }

    /// Intern a byte string. Returns the existing id if already present.
    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        if let Some(idx) = self.strings.get_index_of(bytes) {
            return StringId(idx as u32);
        }
        let (idx, _) = self.strings.insert_full(bytes.into());
        StringId(idx as u32)
    }

    /// Look up a string without interning it.
    pub fn lookup(&self, bytes: &[u8]) -> Option<StringId> {
        self.strings.get_index_of(bytes).map(|idx| StringId(idx as u32))
    }

    /// Get the raw bytes of a string by its ID.
    pub fn get_bytes(&self, id: StringId) -> &[u8] {
        self.strings
            .get_index(id.0 as usize)
            .map(|b| &b[..])
            .unwrap_or_default()
    }

    /// Get a string for display, replacing invalid UTF-8.
    pub fn get_str(&self, id: StringId) -> Cow<'_, str> {
        String::from_utf8_lossy(self.get_bytes(id))
    }

    /// Get the number of strings stored.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns true if no strings are stored.
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl fmt::Debug for StringInterner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.strings.iter().map(|s| String::from_utf8_lossy(s)))
            .finish()
    }
}
