// arena.rs
//
// Single bump-allocated byte region for every name in the config: component
// ids, decode ids, bit-string labels, connection names. Everything else
// refers to a string by an `(offset, length)` handle instead of owning a
// `String`, so routing and printing stay cache-friendly and the arena is
// the only thing that ever holds the bytes.
//
// Built once at config-load time via `ArenaBuilder` (which also dedups
// identical strings through a map), then frozen into a `StringArena` that
// is read-only for the remainder of the process.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StrHandle {
    pub offset: u32,
    pub len: u32,
}

impl StrHandle {
    pub const EMPTY: StrHandle = StrHandle { offset: 0, len: 0 };
}

pub struct ArenaBuilder {
    bytes: Vec<u8>,
    dedup: HashMap<String, StrHandle>,
}

impl ArenaBuilder {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            dedup: HashMap::new(),
        }
    }

    /// Intern a string, returning a handle. Identical strings (by value)
    /// share the same backing bytes.
    pub fn intern(&mut self, s: &str) -> StrHandle {
        if let Some(handle) = self.dedup.get(s) {
            return *handle;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        let handle = StrHandle {
            offset,
            len: s.len() as u32,
        };
        self.dedup.insert(s.to_string(), handle);
        handle
    }

    pub fn finish(self) -> StringArena {
        StringArena { bytes: self.bytes }
    }
}

impl Default for ArenaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the interned strings. No mutation after `finish()`.
pub struct StringArena {
    bytes: Vec<u8>,
}

impl StringArena {
    pub fn get(&self, handle: StrHandle) -> &str {
        let start = handle.offset as usize;
        let end = start + handle.len as usize;
        std::str::from_utf8(&self.bytes[start..end]).expect("arena handles always span valid utf8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_identical_strings() {
        let mut builder = ArenaBuilder::new();
        let a = builder.intern("soc");
        let b = builder.intern("soc");
        let c = builder.intern("voltage");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let arena = builder.finish();
        assert_eq!(arena.get(a), "soc");
        assert_eq!(arena.get(c), "voltage");
    }
}
