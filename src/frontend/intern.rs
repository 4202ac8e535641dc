//! Global string interning. Identifiers appear everywhere in the compiler
//! (module paths, variables, proc and type names), so they are stored once
//! in a process-wide table and passed around as indices into it. Two
//! symbols are equal exactly when their strings are.

use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Every interned string, in insertion order. Entries are leaked so a
/// symbol can hand out `&'static str` without holding the lock; the table
/// only ever grows, which keeps existing indices valid.
static SYMBOLS: Lazy<RwLock<Vec<&'static str>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// An index into the string interning table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternedSymbol(usize);

impl InternedSymbol {
    pub fn new(value: &str) -> Self {
        {
            let symbols = SYMBOLS.read().unwrap();
            if let Some(index) = symbols.iter().position(|s| *s == value) {
                return Self(index);
            }
        }

        let mut symbols = SYMBOLS.write().unwrap();
        // The string may have been interned between dropping the read lock
        // and taking the write lock.
        if let Some(index) = symbols.iter().position(|s| *s == value) {
            return Self(index);
        }

        symbols.push(Box::leak(value.to_owned().into_boxed_str()));
        Self(symbols.len() - 1)
    }

    pub fn value(&self) -> &'static str {
        // Symbols are only created by `new`, so the index is always live.
        SYMBOLS.read().unwrap()[self.0]
    }
}

impl core::fmt::Debug for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InternedSymbol")
            .field(&self.0)
            .field(&self.value())
            .finish()
    }
}

impl core::fmt::Display for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

// Symbols persist as their string contents, not their table index; indices
// are only meaningful within a single process.

impl Serialize for InternedSymbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.value())
    }
}

impl<'de> Deserialize<'de> for InternedSymbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(InternedSymbol::new(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let a = InternedSymbol::new("hello");
        let b = InternedSymbol::new("hello");
        let c = InternedSymbol::new("world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.value(), "hello");
    }

    #[test]
    fn symbols_round_trip_through_serde() {
        let a = InternedSymbol::new("roundtrip");
        let json = serde_json::to_string(&a).unwrap();
        let b: InternedSymbol = serde_json::from_str(&json).unwrap();

        assert_eq!(a, b);
    }
}
