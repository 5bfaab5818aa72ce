//! Short identifier generation.
//!
//! Kernel interface names are limited to 15 bytes, so nodes and bridges are
//! referred to by a 5 character token instead of their full name. The
//! token is a disambiguation digit followed by a 4 character base derived
//! from the name.

use crate::errors::{NetemError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Length of every issued token.
pub const SHORT_ID_LEN: usize = 5;

/// Number of disambiguation digits tried per base.
const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Default)]
struct Issued {
    /// name -> token
    by_name: HashMap<String, String>,
    /// every token handed out
    tokens: HashSet<String>,
}

/// Issues collision-free short identifiers for one topology instance.
///
/// Shared by the node creation workers, hence the mutex.
#[derive(Debug, Default)]
pub struct IdentifierGenerator {
    issued: Mutex<Issued>,
}

/// Base token for `name`: the name itself right-padded with `_` when it is
/// at most 4 characters, else its first two and last two characters.
pub fn base_token(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    if chars.len() <= 4 {
        let mut base: String = chars.into_iter().collect();
        while base.chars().count() < 4 {
            base.push('_');
        }
        base
    } else {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        head + &tail
    }
}

impl IdentifierGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `name`; the same name always yields the same token until
    /// [`IdentifierGenerator::reset`].
    pub fn get_id(&self, name: &str) -> Result<String> {
        let base = base_token(name);
        let mut issued = self
            .issued
            .lock()
            .map_err(|_| NetemError::Unsupported("identifier table poisoned".to_string()))?;

        if let Some(token) = issued.by_name.get(name) {
            return Ok(token.clone());
        }

        for idx in 0..MAX_ATTEMPTS {
            let token = format!("{}{}", idx, base);
            if issued.tokens.insert(token.clone()) {
                issued.by_name.insert(name.to_string(), token.clone());
                return Ok(token);
            }
        }

        Err(NetemError::IdExhausted(name.to_string()))
    }

    /// Forget every issued token.
    pub fn reset(&self) {
        match self.issued.lock() {
            Ok(mut issued) => *issued = Issued::default(),
            Err(poisoned) => *poisoned.into_inner() = Issued::default(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.issued.lock().map(|i| i.by_name.len()).unwrap_or(0)
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_same_name_same_token() {
        let gen = IdentifierGenerator::new();
        let first = gen.get_id("router").unwrap();
        assert_eq!(first, "0roer");
        assert_eq!(gen.get_id("router").unwrap(), first);
    }

    #[test]
    fn test_colliding_names_get_distinct_digits() {
        let gen = IdentifierGenerator::new();
        // both reduce to "nnnn"
        assert_eq!(gen.get_id("nnnn").unwrap(), "0nnnn");
        assert_eq!(gen.get_id("nnxxnn").unwrap(), "1nnnn");
    }

    #[test]
    fn test_short_names_are_padded() {
        let gen = IdentifierGenerator::new();
        assert_eq!(gen.get_id("R1").unwrap(), "0R1__");
        assert_eq!(gen.get_id("host").unwrap(), "0host");
        for name in ["a", "ab", "abc", "abcd", "abcde", "a_long_name"] {
            assert_eq!(gen.get_id(name).unwrap().len(), SHORT_ID_LEN);
        }
    }

    #[test]
    fn test_eleventh_collision_fails() {
        let gen = IdentifierGenerator::new();
        for i in 0..10 {
            gen.get_id(&format!("ab{}cd", "x".repeat(i + 1))).unwrap();
        }
        let err = gen.get_id("abyyycd").unwrap_err();
        assert!(matches!(err, NetemError::IdExhausted(_)));
    }

    #[test]
    fn test_reset_forgets_tokens() {
        let gen = IdentifierGenerator::new();
        gen.get_id("nnnn").unwrap();
        gen.get_id("nnxxnn").unwrap();
        gen.reset();
        assert!(gen.is_empty());
        assert_eq!(gen.get_id("nnxxnn").unwrap(), "0nnnn");
    }

    #[test]
    fn test_concurrent_callers_never_share_a_token() {
        let gen = Arc::new(IdentifierGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gen = Arc::clone(&gen);
                thread::spawn(move || gen.get_id(&format!("sw{}ch", i)).unwrap())
            })
            .collect();

        let mut tokens: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        tokens.sort();
        tokens.dedup();
        assert_eq!(tokens.len(), 8);
    }
}
