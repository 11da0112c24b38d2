//! Prefix-based key listing.
//!
//! Two strategies produce the same result shape:
//!
//! - [`walk_hierarchy`] walks a real directory tree (local disk, FTP, SFTP)
//!   one directory at a time.
//! - [`synthesize_flat`] takes a flat, string-prefix listing of object keys
//!   (object storage) and derives the directory entries from the key paths.
//!
//! Both return keys relative to the query directory, sorted and deduplicated.
//! In fragment mode the filter applies to the first path segment below the
//! query directory; everything beneath a matching directory is included.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::error::Result;
use crate::key::{ancestors, normalize_path, KeyQuery};

/// One entry of a directory listing, as reported by a hierarchical backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

impl DirEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_dir: false }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_dir: true }
    }
}

/// Walk a hierarchical backend starting at `query.directory`.
///
/// `list_dir` receives a path relative to the repository root and returns the
/// entries of that directory, or `None` if it does not exist. A missing start
/// directory yields an empty listing.
pub fn walk_hierarchy<F>(
    query: &KeyQuery,
    include_directories: bool,
    mut list_dir: F,
) -> Result<Vec<String>>
where
    F: FnMut(&str) -> Result<Option<Vec<DirEntry>>>,
{
    let mut keys = BTreeSet::new();
    let mut pending: Vec<String> = Vec::new();

    let top = match list_dir(&query.directory)? {
        Some(entries) => entries,
        None => {
            debug!(directory = %query.directory, "Listing of missing directory is empty");
            return Ok(Vec::new());
        }
    };

    for entry in top {
        if is_dot_entry(&entry.name) || !query.matches(&entry.name) {
            continue;
        }
        visit(entry, "", include_directories, &mut keys, &mut pending);
    }

    while let Some(relative) = pending.pop() {
        let path = normalize_path(&query.directory, &relative);
        let entries = match list_dir(&path)? {
            Some(entries) => entries,
            None => {
                warn!(directory = %path, "Directory vanished during listing, skipped");
                continue;
            }
        };
        for entry in entries {
            if is_dot_entry(&entry.name) {
                continue;
            }
            visit(entry, &relative, include_directories, &mut keys, &mut pending);
        }
    }

    Ok(keys.into_iter().collect())
}

fn visit(
    entry: DirEntry,
    parent: &str,
    include_directories: bool,
    keys: &mut BTreeSet<String>,
    pending: &mut Vec<String>,
) {
    let relative = if parent.is_empty() {
        entry.name
    } else {
        format!("{}/{}", parent, entry.name)
    };
    if entry.is_dir {
        if include_directories {
            keys.insert(relative.clone());
        }
        pending.push(relative);
    } else {
        keys.insert(relative);
    }
}

fn is_dot_entry(name: &str) -> bool {
    name.is_empty() || name == "." || name == ".."
}

/// Build a listing from the keys a flat-namespace backend returned for the
/// string prefix `listing_base`.
///
/// Keys that end in `/` are zero-byte directory markers: they contribute a
/// directory entry and are never reported as files. Every ancestor of a
/// listed key is registered as a synthesized directory.
pub fn synthesize_flat<I>(
    listing_base: &str,
    query: &KeyQuery,
    object_keys: I,
    include_directories: bool,
) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut files = BTreeSet::new();
    let mut directories = BTreeSet::new();

    for key in object_keys {
        let suffix = match key.strip_prefix(listing_base) {
            Some(s) => s.trim_start_matches('/'),
            None => continue,
        };
        if suffix.is_empty() {
            // the prefix itself
            continue;
        }

        let first_segment = suffix.split('/').next().unwrap_or(suffix);
        if !query.matches(first_segment) {
            continue;
        }

        if let Some(marker) = suffix.strip_suffix('/') {
            let marker = marker.trim_end_matches('/');
            if marker.is_empty() {
                continue;
            }
            directories.extend(ancestors(marker).into_iter().map(str::to_string));
            directories.insert(marker.to_string());
            continue;
        }

        directories.extend(ancestors(suffix).into_iter().map(str::to_string));
        files.insert(suffix.to_string());
    }

    if include_directories {
        files.extend(directories);
    }
    files.into_iter().collect()
}
