//! Column identifier sanitization.
//!
//! Report headers arrive as free text ("Amount (converted) Currency",
//! "Probability (%)"). Warehouse columns need short, upper-case identifiers
//! that are unique within one table.

use std::collections::HashSet;
use std::hash::BuildHasher;

/// Upper bound on generated column names, suffixes included.
pub const MAX_IDENTIFIER_LEN: usize = 30;

/// Characters the historical loader mapped to `_`.
const LEGACY_BLACKLIST: &[char] = &[
    ' ', '<', '>', ':', ';', ',', '?', '\\', '(', ')', '/', '[', ']', '#', '.', '$', '%', '-',
    '!', '&',
];

/// Turn a raw report header into a column identifier.
///
/// Every character outside `[A-Za-z0-9_]` becomes `_`, runs of underscores
/// collapse to one, a leading digit gets a `C_` prefix, and the result is cut
/// to [`MAX_IDENTIFIER_LEN`] and upper-cased. Never fails; input with nothing
/// usable in it comes back as `_`.
pub fn sanitize(raw: &str) -> String {
    let mut collapsed = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' {
            c
        } else {
            '_'
        };
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }
    finish_identifier(collapsed)
}

/// Byte-compatible rendition of the historical header cleanup.
///
/// Only the fixed blacklist is replaced, apostrophes are deleted, anything
/// else (`*`, `@`, non-ASCII letters) passes through, and runs of underscores
/// are shortened by a fixed longest-first sequence of replacements (10 down
/// to 2). Use this only when names must match tables built by the old loader.
pub fn sanitize_legacy(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .filter(|c| *c != '\'')
        .map(|c| if LEGACY_BLACKLIST.contains(&c) { '_' } else { c })
        .collect();
    for run in (2..=10).rev() {
        name = name.replace(&"_".repeat(run), "_");
    }
    finish_identifier(name)
}

fn finish_identifier(mut name: String) -> String {
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert_str(0, "C_");
    }
    let name = name
        .chars()
        .take(MAX_IDENTIFIER_LEN)
        .collect::<String>()
        .to_uppercase();
    if name.is_empty() {
        "_".to_string()
    } else {
        name
    }
}

/// Return `candidate`, or the first `candidate + n` (n = 1, 2, ...) that is not
/// in `existing`. The candidate is shortened as needed so the suffixed name
/// stays within [`MAX_IDENTIFIER_LEN`].
pub fn unique_identifier<S: BuildHasher>(existing: &HashSet<String, S>, candidate: &str) -> String {
    let mut suffix: u64 = 0;
    loop {
        let padding = if suffix == 0 {
            String::new()
        } else {
            suffix.to_string()
        };
        let keep = MAX_IDENTIFIER_LEN.saturating_sub(padding.len());
        let mut probe: String = candidate.chars().take(keep).collect();
        probe.push_str(&padding);
        if !existing.contains(&probe) {
            return probe;
        }
        suffix += 1;
    }
}

/// Sanitize a whole header row, deduplicating names within the row.
pub fn unique_identifiers<I, S>(headers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for header in headers {
        let name = unique_identifier(&seen, &sanitize(header.as_ref()));
        seen.insert(name.clone());
        names.push(name);
    }
    names
}
