//! Key and path normalization.
//!
//! Every backend builds its storage paths and its listing prefixes through
//! [`normalize_path`], so the character offset used to strip a prefix from a
//! listed key is always the one used to build it.

/// Join `directory` and `key`, collapse repeated slashes and strip one leading
/// and one trailing slash.
///
/// `normalize_path("/data/", "//a//b.txt/")` is `"data/a/b.txt"`.
pub fn normalize_path(directory: &str, key: &str) -> String {
    let mut joined = String::with_capacity(directory.len() + key.len() + 3);
    joined.push('/');
    joined.push_str(directory);
    joined.push('/');
    joined.push_str(key);
    joined.push('/');

    let mut collapsed = String::with_capacity(joined.len());
    let mut last_slash = false;
    for c in joined.chars() {
        if c == '/' {
            if !last_slash {
                collapsed.push(c);
            }
            last_slash = true;
        } else {
            collapsed.push(c);
            last_slash = false;
        }
    }

    // collapsed always starts and ends with a single '/'
    if collapsed.len() <= 1 {
        return String::new();
    }
    collapsed[1..collapsed.len() - 1].to_string()
}

/// Normalize a key relative to the repository root.
pub fn normalize_key(key: &str) -> String {
    normalize_path("", key)
}

/// True when `key` names no file at all: empty, or made only of `.` and
/// `..` segments. Such keys resolve to the storage root on path-based
/// backends.
pub fn is_root_key(key: &str) -> bool {
    normalize_key(key)
        .split('/')
        .all(|segment| matches!(segment, "" | "." | ".."))
}

/// Last segment of a key (`"sub/file.txt"` → `"file.txt"`).
pub fn basename(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Everything before the last segment, without leading slash
/// (`"/sub/file.txt"` → `"sub"`, `"file.txt"` → `""`).
pub fn dirname(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => trimmed[..pos].trim_start_matches('/'),
        None => "",
    }
}

/// Parent directories of a relative key, nearest last
/// (`"a/b/c.txt"` → `["a", "a/b"]`).
pub fn ancestors(key: &str) -> Vec<&str> {
    key.match_indices('/').map(|(pos, _)| &key[..pos]).collect()
}

/// A parsed `listKeys` prefix.
///
/// A prefix ending in `/` (or an empty prefix) selects a directory. Otherwise
/// the last segment is a filename fragment searched for inside the parent
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyQuery {
    /// Normalized directory the listing starts in, relative to the root.
    pub directory: String,
    /// Substring the first path segment below `directory` must contain.
    pub fragment: Option<String>,
}

impl KeyQuery {
    pub fn parse(prefix: Option<&str>) -> Self {
        let raw = prefix.unwrap_or("");
        if raw.is_empty() || raw.ends_with('/') {
            return KeyQuery {
                directory: normalize_key(raw),
                fragment: None,
            };
        }

        let normalized = normalize_key(raw);
        match normalized.rsplit_once('/') {
            Some((dir, fragment)) => KeyQuery {
                directory: dir.to_string(),
                fragment: Some(fragment.to_string()),
            },
            None => KeyQuery {
                directory: String::new(),
                fragment: Some(normalized),
            },
        }
    }

    /// Whether a top-level entry name passes the fragment filter.
    pub fn matches(&self, name: &str) -> bool {
        match &self.fragment {
            Some(fragment) => name.contains(fragment.as_str()),
            None => true,
        }
    }
}
