use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use base64::prelude::{Engine as _, BASE64_URL_SAFE};

/// Used when the filesystem cannot report its filename limit.
pub const DEFAULT_MAX_FILENAME_LEN: usize = 255;

/// Marks directory components. Never produced by url-safe base64.
const DIR_MARKER: char = '@';

/// Maps a record id to a nested, length-bounded path below a subject root.
///
/// The id is url-safe base64 encoded and split into chunks of at most
/// `max_len - 1` characters. Every chunk but the last becomes a directory
/// prefixed with `@`; the last one is the file name.
#[derive(Debug, Default)]
pub struct RecordPathCodec {
    max_len: OnceLock<usize>,
}

impl RecordPathCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec with a fixed filename limit; the filesystem is never queried.
    #[must_use]
    pub fn with_max_len(max_len: usize) -> Self {
        let codec = Self::default();
        let _ = codec.max_len.set(normalize_max_len(max_len));
        codec
    }

    /// Path of the record for `id` below `subject_root`.
    pub fn encode(&self, subject_root: &Path, id: &str) -> PathBuf {
        let max_len = self.max_len(subject_root);
        let mut path = subject_root.to_path_buf();
        for component in encode_components(id, max_len) {
            path.push(component);
        }
        path
    }

    /// Filename limit in effect, queried once from `subject_root`.
    pub fn max_len(&self, subject_root: &Path) -> usize {
        *self
            .max_len
            .get_or_init(|| normalize_max_len(query_max_len(subject_root)))
    }
}

pub(crate) fn encode_components(id: &str, max_len: usize) -> Vec<String> {
    let encoded = BASE64_URL_SAFE.encode(id.as_bytes());
    if encoded.is_empty() {
        return vec![DIR_MARKER.to_string()];
    }
    // base64 output is ASCII, so byte chunks are char chunks.
    let chunk_len = max_len.saturating_sub(1).max(1);
    let chunks: Vec<&str> = encoded
        .as_bytes()
        .chunks(chunk_len)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(idx, chunk)| {
            if idx == last {
                chunk.to_string()
            } else {
                format!("{DIR_MARKER}{chunk}")
            }
        })
        .collect()
}

fn normalize_max_len(max_len: usize) -> usize {
    if max_len == 0 {
        DEFAULT_MAX_FILENAME_LEN
    } else {
        max_len
    }
}

#[cfg(unix)]
fn query_max_len(dir: &Path) -> usize {
    use nix::unistd::{pathconf, PathconfVar};

    match pathconf(dir, PathconfVar::NAME_MAX) {
        Ok(Some(limit)) => usize::try_from(limit).unwrap_or(DEFAULT_MAX_FILENAME_LEN),
        Ok(None) | Err(_) => DEFAULT_MAX_FILENAME_LEN,
    }
}

#[cfg(not(unix))]
fn query_max_len(_dir: &Path) -> usize {
    DEFAULT_MAX_FILENAME_LEN
}
