//! Random identifiers.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random string of `len` ASCII letters.
pub fn rand_letters(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .filter(char::is_ascii_alphabetic)
        .take(len)
        .collect()
}
