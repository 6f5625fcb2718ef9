//! Pure path utilities for the virtual filesystem.
//!
//! Virtual paths are `/`-separated, relative, and never escape the root: `..`
//! segments are resolved during sanitization and a leading `..` marks a path
//! outside the filesystem (which [`contains`] rejects). The empty string is
//! the root.

/// Characters stripped from paths, besides control characters.
const SPECIAL_CHARS: &[char] = &['"', ':', '<', '>', '?', '|'];

/// Sanitize a path, stripping disallowed characters and resolving `.`/`..`.
/// Idempotent: sanitizing a sanitized path returns it unchanged.
pub fn sanitize(path: &str) -> String {
    sanitize_with(path, false)
}

/// As [`sanitize`], optionally keeping the wildcard characters `*` and `?`
/// (used when matching rather than addressing files).
pub fn sanitize_with(path: &str, allow_wildcards: bool) -> String {
    let cleaned: String = path
        .chars()
        .map(|c| if c == '\\' { '/' } else { c })
        .filter(|&c| {
            c >= ' '
                && !SPECIAL_CHARS.contains(&c)
                && (allow_wildcards || c != '*')
                && (allow_wildcards || c != '?')
        })
        .collect();

    let mut parts: Vec<String> = Vec::new();
    for part in cleaned.split('/') {
        let part = part.trim();
        if part.is_empty() || part == "." || (part.len() >= 3 && part.bytes().all(|b| b == b'.')) {
            continue;
        }
        if part == ".." {
            match parts.last() {
                Some(last) if last != ".." => {
                    parts.pop();
                }
                _ => parts.push("..".to_owned()),
            }
        } else if part.chars().count() > 255 {
            let truncated: String = part.chars().take(255).collect();
            parts.push(truncated.trim_end().to_owned());
        } else {
            parts.push(part.to_owned());
        }
    }
    parts.join("/")
}

/// Join two paths, sanitizing the result. Wildcards survive combination.
pub fn combine(path: &str, child: &str) -> String {
    let path = sanitize_with(path, true);
    let child = sanitize_with(child, true);
    if path.is_empty() {
        child
    } else if child.is_empty() {
        path
    } else {
        sanitize_with(&format!("{path}/{child}"), true)
    }
}

/// The parent of a path: `"a/b/c"` is in `"a/b"`, `"a"` is in the root, and
/// the root's parent is outside the filesystem (`".."`).
pub fn get_directory(path: &str) -> String {
    let path = sanitize_with(path, true);
    if path.is_empty() {
        return "..".to_owned();
    }
    match path.rfind('/') {
        Some(idx) => path[..idx].to_owned(),
        None => String::new(),
    }
}

/// The final segment of a path, or `"root"` for the root itself.
pub fn get_name(path: &str) -> String {
    let path = sanitize_with(path, true);
    if path.is_empty() {
        return "root".to_owned();
    }
    match path.rfind('/') {
        Some(idx) => path[idx + 1..].to_owned(),
        None => path,
    }
}

/// Whether `path` lies within `branch` (inclusively). Case-insensitive.
/// Paths escaping the root are never contained in anything.
pub fn contains(branch: &str, path: &str) -> bool {
    let branch = sanitize(branch).to_lowercase();
    let path = sanitize(path).to_lowercase();
    if path == ".." || path.starts_with("../") {
        false
    } else if branch == path {
        true
    } else if branch.is_empty() {
        true
    } else {
        path.starts_with(&format!("{branch}/"))
    }
}

/// Rewrite `path` as relative to `location`. `location` must contain `path`.
pub fn to_local(path: &str, location: &str) -> String {
    let path = sanitize(path);
    let location = sanitize(location);
    debug_assert!(contains(&location, &path));
    let local = &path[location.len()..];
    local.strip_prefix('/').unwrap_or(local).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_normalizes_separators_and_dots() {
        assert_eq!(sanitize("a\\b\\c"), "a/b/c");
        assert_eq!(sanitize("a/./b"), "a/b");
        assert_eq!(sanitize("a//b/"), "a/b");
        assert_eq!(sanitize("a/.../b"), "a/b");
        assert_eq!(sanitize("...."), "");
    }

    #[test]
    fn sanitize_resolves_parent_segments() {
        assert_eq!(sanitize("a/b/../c"), "a/c");
        assert_eq!(sanitize("a/../../b"), "../b");
        assert_eq!(sanitize("../.."), "../..");
        assert_eq!(sanitize("a/.."), "");
    }

    #[test]
    fn sanitize_strips_special_characters() {
        assert_eq!(sanitize("a<b>:c|d\"e"), "abcde");
        assert_eq!(sanitize("wild*card?"), "wildcard");
        assert_eq!(sanitize_with("wild*card?", true), "wild*card?");
        assert_eq!(sanitize("ctrl\u{1}char"), "ctrlchar");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for raw in ["a\\b/../c", " spaced / parts ", "../x/./y", "A/B*?"] {
            let once = sanitize(raw);
            assert_eq!(sanitize(&once), once, "sanitize({raw:?}) not idempotent");
        }
    }

    #[test]
    fn sanitize_truncates_long_segments() {
        let long = "x".repeat(300);
        let sanitized = sanitize(&long);
        assert_eq!(sanitized.chars().count(), 255);
    }

    #[test]
    fn combine_handles_roots() {
        assert_eq!(combine("", "rom"), "rom");
        assert_eq!(combine("rom", ""), "rom");
        assert_eq!(combine("rom", "programs/ls"), "rom/programs/ls");
        assert_eq!(combine("a/b", "../c"), "a/c");
    }

    #[test]
    fn directory_and_name() {
        assert_eq!(get_directory("a/b/c"), "a/b");
        assert_eq!(get_directory("a"), "");
        assert_eq!(get_directory(""), "..");
        assert_eq!(get_name("a/b/c"), "c");
        assert_eq!(get_name(""), "root");
    }

    #[test]
    fn contains_rules() {
        assert!(contains("", "anything/here"));
        assert!(contains("a/b", "a/b"));
        assert!(contains("a/b", "A/B/C"));
        assert!(!contains("a/b", "a/bc"));
        assert!(!contains("a", ".."));
        assert!(!contains("", "../x"));
        assert!(!contains("a/b", "a"));
    }

    #[test]
    fn to_local_strips_location() {
        assert_eq!(to_local("rom/programs/ls", "rom"), "programs/ls");
        assert_eq!(to_local("rom", "rom"), "");
        assert_eq!(to_local("a/b", ""), "a/b");
    }
}
