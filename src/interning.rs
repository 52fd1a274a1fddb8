//! Process-wide string interning.
//!
//! Labels are compared and hashed constantly by the graph and the
//! scheduler, so every label field is stored as an `InternedString`
//! rather than an owned `String`. Two interned strings with the same
//! text point at the same heap allocation, which makes equality and
//! hashing a pointer comparison instead of a byte comparison.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::ptr;
use std::sync::Mutex;
use std::sync::OnceLock;

fn cache() -> &'static Mutex<HashSet<&'static str>> {
    static CACHE: OnceLock<Mutex<HashSet<&'static str>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashSet::new()))
}

fn leak(s: &str) -> &'static str {
    Box::leak(s.to_string().into_boxed_str())
}

/// An interned, `Copy`, immutable string.
#[derive(Clone, Copy)]
pub struct InternedString {
    inner: &'static str,
}

impl InternedString {
    pub fn new(s: &str) -> InternedString {
        let mut cache = cache().lock().unwrap();
        let interned = match cache.get(s) {
            Some(existing) => *existing,
            None => {
                let leaked = leak(s);
                cache.insert(leaked);
                leaked
            }
        };
        InternedString { inner: interned }
    }

    pub fn as_str(&self) -> &'static str {
        self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for InternedString {
    fn default() -> Self {
        InternedString::new("")
    }
}

impl PartialEq for InternedString {
    fn eq(&self, other: &InternedString) -> bool {
        ptr::eq(self.inner, other.inner) || self.inner == other.inner
    }
}

impl Eq for InternedString {}

impl Hash for InternedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl PartialOrd for InternedString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternedString {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.cmp(other.inner)
    }
}

impl Deref for InternedString {
    type Target = str;

    fn deref(&self) -> &str {
        self.inner
    }
}

impl Borrow<str> for InternedString {
    fn borrow(&self) -> &str {
        self.inner
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.inner)
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.inner, f)
    }
}

impl From<&str> for InternedString {
    fn from(s: &str) -> Self {
        InternedString::new(s)
    }
}

impl From<String> for InternedString {
    fn from(s: String) -> Self {
        InternedString::new(&s)
    }
}

impl serde::Serialize for InternedString {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.inner)
    }
}
