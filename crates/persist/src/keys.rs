//! Annotation keys for handler ids.
//!
//! Handler ids may contain `/` (sub-handlers) and be arbitrarily long, while the
//! name part of an annotation key is limited to 63 characters.

use std::hash::Hasher;

use rustc_hash::FxHasher;

pub const MAX_NAME_LEN: usize = 63;

pub fn annotation_key(prefix: &str, name: &str) -> String {
    let safe = name.replace('/', ".");
    let name = if safe.len() > MAX_NAME_LEN { shorten(&safe) } else { safe };
    if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    }
}

/// Truncate and append a stable digest of the full name, so distinct long ids
/// sharing a prefix stay distinct.
fn shorten(name: &str) -> String {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    let digest = format!("{:016x}", hasher.finish());
    let mut cut = MAX_NAME_LEN - digest.len() - 1;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}-{}", &name[..cut], digest)
}
