//! Wildcard matching for key names.
//!
//! `*` matches any run of characters (including none). There are no other
//! metacharacters: `prefix*`, `*suffix`, `prefix*suffix` and exact names are the
//! shapes callers use, and any number of `*` is accepted.

pub const WILDCARD: char = '*';

/// Characters the remote store's glob syntax treats specially besides `*`.
const GLOB_SPECIALS: [char; 4] = ['?', '[', ']', '\\'];

pub fn is_pattern(candidate: &str) -> bool {
    candidate.contains(WILDCARD)
}

/// Match a trimmed key name against a wildcard pattern.
pub fn matches(name: &str, pattern: &str) -> bool {
    let mut segments = pattern.split(WILDCARD);
    // split always yields at least one segment
    let head = segments.next().unwrap_or_default();
    let Some(mut rest) = name.strip_prefix(head) else {
        return false;
    };

    let tail_segments: Vec<&str> = segments.collect();
    let Some((tail, middle)) = tail_segments.split_last() else {
        return rest.is_empty();
    };

    for segment in middle.iter().filter(|s| !s.is_empty()) {
        match rest.find(segment) {
            Some(at) => rest = &rest[at + segment.len()..],
            None => return false,
        }
    }

    rest.ends_with(tail)
}

/// The literal text before the first `*`; every match starts with it.
pub fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(WILDCARD) {
        Some(at) => &pattern[..at],
        None => pattern,
    }
}

/// Escape `text` for the remote glob syntax. With `keep_wildcards` the `*`
/// characters stay live, otherwise they are matched literally.
pub fn escape_glob(text: &str, keep_wildcards: bool) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if GLOB_SPECIALS.contains(&ch) || (ch == WILDCARD && !keep_wildcards) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
