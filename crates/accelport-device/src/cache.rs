use std::fs::{File, OpenOptions};
use std::path::Path;

use tracing::debug;

use crate::{CacheToken, CACHE_TOKEN_LEN};

/// Upper bound on cache file descriptors per kind, regardless of what a
/// driver reports.
pub const MAX_CACHE_FILES: u32 = 32;

/// Derives the cache filename stem for a token: two characters per token
/// byte (low then high nibble, offset from 'A'), so the same token always
/// addresses the same files.
fn filename_stem(token: &CacheToken) -> String {
    let mut stem = String::with_capacity(CACHE_TOKEN_LEN * 2);
    for &byte in token.iter() {
        stem.push((b'A' + (byte & 0x0F)) as char);
        stem.push((b'A' + (byte >> 4)) as char);
    }
    stem
}

fn open_handles(
    dir: &Path,
    stem: &str,
    kind: char,
    count: u32,
    create: bool,
) -> Option<Vec<File>> {
    let mut handles = Vec::with_capacity(count as usize);
    for i in 0..count {
        let path = dir.join(format!("{stem}{kind}{i}"));
        debug!(path = %path.display(), "cache file");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .ok()?;
        handles.push(file);
    }
    Some(handles)
}

/// Opens the model- and data-cache files for `token`, read-write and
/// positioned at the start. Counts are clamped to `MAX_CACHE_FILES`. None
/// when any file cannot be opened; the caller then proceeds without caching.
pub fn open_cache_handles(
    dir: &Path,
    token: &CacheToken,
    num_files: (u32, u32),
    create: bool,
) -> Option<(Vec<File>, Vec<File>)> {
    let (num_model, num_data) = num_files;
    if num_model > MAX_CACHE_FILES || num_data > MAX_CACHE_FILES {
        return None;
    }
    let stem = filename_stem(token);
    let model_cache = open_handles(dir, &stem, '1', num_model, create)?;
    let data_cache = open_handles(dir, &stem, '2', num_data, create)?;
    Some((model_cache, data_cache))
}
