//! Deterministic mapping from request URIs to relative cache file names and
//! hash buckets.
//!
//! The mapping is part of the on-disk format: two nodes that agree on it can
//! exchange cache trees and packages, so none of the constants below may change.

use std::borrow::Cow;
use std::path::MAIN_SEPARATOR;
use std::path::MAIN_SEPARATOR_STR;
use std::path::PathBuf;

/// Host marker of the admin/search front end.
const SEARCH_HOST: &str = "ruralcafe.net";
/// Query field carrying the search terms on the admin/search front end.
const SEARCH_FIELD: &str = "textfield";
/// File name used for directory-like URIs.
const INDEX_FILE: &str = "index.html";
/// Longest sanitized file name kept; longer names are cut to this length.
const MAX_FILE_NAME_LEN: usize = 219;
/// Number of buckets on each of the two hash levels.
const HASH_BUCKETS: u32 = 5000;

/// Two-level bucket of a cache entry, rendered as `"<bucket1>/<bucket2>/"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct HashPath {
    pub(crate) bucket1: u32,
    pub(crate) bucket2: u32,
}

impl HashPath {
    /// Buckets a relative file name: the first level hashes the second half of
    /// the separator-free name, the second level the first half.
    #[must_use]
    pub(crate) fn from_file_name(file_name: &str) -> Self {
        let units: Vec<u16> = file_name
            .encode_utf16()
            .filter(|&unit| unit != MAIN_SEPARATOR as u16)
            .collect();

        if units.is_empty() {
            return Self {
                bucket1: 0,
                bucket2: 0,
            };
        }

        let (first_half, second_half) = units.split_at(units.len() / 2);

        Self {
            bucket1: bucket(hash_units(second_half)),
            bucket2: bucket(hash_units(first_half)),
        }
    }

    /// Flat identifier of the bucket pair, used to key queue entries.
    #[must_use]
    pub(crate) fn item_id(&self) -> String {
        format!("{}{}", self.bucket1, self.bucket2)
    }

    #[must_use]
    pub(crate) fn as_path(&self) -> PathBuf {
        [self.bucket1.to_string(), self.bucket2.to_string()]
            .iter()
            .collect()
    }
}

impl std::fmt::Display for HashPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{MAIN_SEPARATOR}{}{MAIN_SEPARATOR}",
            self.bucket1, self.bucket2
        )
    }
}

/// Magnitude is taken unsigned so that `i32::MIN` still lands in a valid bucket.
#[must_use]
const fn bucket(hash: i32) -> u32 {
    hash.unsigned_abs() % HASH_BUCKETS
}

/// 32-bit string hash over UTF-16 code units with wrapping arithmetic.
///
/// Never returns `-1`; the empty string hashes to `0`.
#[must_use]
pub(crate) fn hash_string(s: &str) -> i32 {
    let units: Vec<u16> = s.encode_utf16().collect();
    hash_units(&units)
}

#[must_use]
fn hash_units(units: &[u16]) -> i32 {
    let Some(&first) = units.first() else {
        return 0;
    };

    let mut value = i32::from(first) << 7;
    for &unit in units {
        value = value.wrapping_mul(1_000_003) ^ i32::from(unit);
    }

    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let len = units.len() as i32;
    avoid_sentinel(value ^ len)
}

#[must_use]
const fn avoid_sentinel(value: i32) -> i32 {
    if value == -1 { -2 } else { value }
}

/// Maps a request URI to its relative cache file name.
///
/// Search-form URIs of the front end map to their decoded search terms, every
/// other URI drops its scheme. Directory-like URIs name an `index.html` inside
/// the directory. The result is always sanitized.
#[must_use]
pub(crate) fn to_file_path(uri: &str) -> String {
    let mut name = search_terms(uri).unwrap_or(uri);

    if let Some((scheme, rest)) = name.split_once("://")
        && is_scheme(scheme)
    {
        name = rest;
    }

    let mut name = Cow::Borrowed(name);
    if is_directory_like(&name) {
        name.to_mut().push('/');
    }

    let decoded = decode(&name);
    let decoded = if MAIN_SEPARATOR == '/' {
        decoded
    } else {
        Cow::Owned(decoded.replace('/', MAIN_SEPARATOR_STR))
    };

    let mut file_name = sanitize(&decoded);
    if file_name.ends_with(MAIN_SEPARATOR) {
        file_name.push_str(INDEX_FILE);
    }

    file_name
}

/// Search terms of a front-end search URI, up to the next query field.
fn search_terms(uri: &str) -> Option<&str> {
    if !uri.contains(SEARCH_HOST) {
        return None;
    }

    let pos = uri.find(SEARCH_FIELD)?;
    let mut rest = uri[pos + SEARCH_FIELD.len()..].chars();
    // skip the `=`
    rest.next();
    let rest = rest.as_str();

    Some(match rest.find('&') {
        Some(end) if end > 0 => &rest[..end],
        _ => rest,
    })
}

fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// A name without any path, or whose last segment has no extension.
fn is_directory_like(name: &str) -> bool {
    match name.rsplit_once('/') {
        None => true,
        Some((_, last)) => !last.is_empty() && !last.contains('.'),
    }
}

/// Percent-decoding with `+` meaning a space; invalid UTF-8 is replaced.
fn decode(s: &str) -> Cow<'_, str> {
    let plus_decoded = if s.contains('+') {
        Cow::Owned(s.replace('+', " "))
    } else {
        Cow::Borrowed(s)
    };

    let decoded = match urlencoding::decode(&plus_decoded) {
        Ok(Cow::Borrowed(_)) => None,
        Ok(Cow::Owned(decoded)) => Some(decoded),
        Err(_) => Some(
            String::from_utf8_lossy(&urlencoding::decode_binary(plus_decoded.as_bytes()))
                .into_owned(),
        ),
    };

    decoded.map_or(plus_decoded, Cow::Owned)
}

/// Reduces a name to lowercase ASCII letters, digits, the path separator, `-`
/// and `.`, with spaces turned into `-`, no `--` runs, a bounded length and no
/// leading or trailing `-`/`.`.
///
/// Idempotent: `sanitize(sanitize(x)) == sanitize(x)`.
#[must_use]
pub(crate) fn sanitize(raw: &str) -> String {
    let lowered = raw.trim().replace(' ', "-").to_lowercase();

    let mut safe = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        let legal = c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || c == MAIN_SEPARATOR
            || c == '-'
            || c == '.';
        if !legal || (c == '-' && safe.ends_with('-')) {
            continue;
        }
        safe.push(c);
    }

    // only ASCII is left, any byte index is a char boundary
    safe.truncate(MAX_FILE_NAME_LEN);

    safe.trim_matches(['-', '.']).to_string()
}
