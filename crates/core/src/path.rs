//! Destination path normalization
//!
//! Drive paths are addressed as `root:/<path>:` segments inside the request
//! URL, so every segment is percent-encoded on its own and the `/` separators
//! are kept verbatim.

use std::borrow::Cow;

/// Characters the remote file system rejects in item names
const DENYLIST: &[char] = &['"', '*', ':', '<', '>', '?', '/', '\\', '|'];

/// Replacement for denylisted characters
const REPLACEMENT: char = '_';

/// Normalize a logical destination path into a transport-safe path.
///
/// Segments are split on `/` (and `\`), decoded, stripped of denylisted
/// characters and re-encoded one by one. Leading and trailing separators are
/// dropped; interior segments keep their order and count. Applying the
/// function twice yields the same result as applying it once.
pub fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    unified
        .trim_matches('/')
        .split('/')
        .map(normalize_segment)
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalize one path segment
pub fn normalize_segment(segment: &str) -> String {
    let decoded: Cow<'_, str> = urlencoding::decode(segment).unwrap_or(Cow::Borrowed(segment));
    let cleaned = sanitize_name(&decoded);
    urlencoding::encode(&cleaned).into_owned()
}

/// Replace characters the remote refuses in a single item name
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if DENYLIST.contains(&c) || c.is_control() {
                REPLACEMENT
            } else {
                c
            }
        })
        .collect()
}

/// Last segment of a logical path, decoded, for display and request bodies
pub fn leaf_name(path: &str) -> String {
    let normalized = normalize(path);
    let leaf = normalized.rsplit('/').next().unwrap_or_default();
    urlencoding::decode(leaf)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| leaf.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_keeps_hierarchy() {
        let normalized = normalize("Reports/Q1 2024/file name.pdf");
        assert_eq!(normalized, "Reports/Q1%202024/file%20name.pdf");
        assert_eq!(normalized.split('/').count(), 3);
    }

    #[test]
    fn test_normalize_idempotent() {
        let inputs = [
            "Reports/Q1 2024/file name.pdf",
            "/REPOSITORY/IT Development/a:b*c?.docx",
            "a%20b/100% done/c",
            "x\\y\\z.txt",
            "émoji 🎉/Ünïcode.pdf",
        ];
        for input in inputs {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "input {:?}", input);
        }
    }

    #[test]
    fn test_normalize_replaces_denylist() {
        assert_eq!(normalize("dir/a:b|c\"d.pdf"), "dir/a_b_c_d.pdf");
        assert_eq!(normalize("dir/tab\there"), "dir/tab_here");
    }

    #[test]
    fn test_normalize_trims_outer_separators_only() {
        assert_eq!(normalize("/a/b/"), "a/b");
        // interior empty segments are not collapsed
        assert_eq!(normalize("a//b"), "a//b");
    }

    #[test]
    fn test_backslash_is_separator() {
        assert_eq!(normalize("2024\\Finance\\q1.xlsx"), "2024/Finance/q1.xlsx");
    }

    #[test]
    fn test_encoded_slash_stays_inside_segment() {
        // an encoded separator decodes into a denylisted character
        assert_eq!(normalize("a%2Fb/c"), "a_b/c");
    }

    #[test]
    fn test_leaf_name() {
        assert_eq!(leaf_name("Reports/Q1 2024/file name.pdf"), "file name.pdf");
        assert_eq!(leaf_name("single"), "single");
    }
}
