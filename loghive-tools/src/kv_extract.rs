//! `key=value` pair extraction from raw log payloads.
//!
//! Extractors feed the kv indexer; they are combinable and lowercase both
//! sides, so index lookups are case insensitive.

use lazy_static::lazy_static;
use regex::bytes::Regex;

/// Extracts `(key, value)` pairs from a raw log line.
pub trait KvExtractor: Send + Sync {
    /// Calls `emit` once per extracted pair. Keys and values are already
    /// folded to lower case.
    fn extract(&self, raw: &[u8], emit: &mut dyn FnMut(&[u8], &[u8]));
}

lazy_static! {
    // bare values end at whitespace or common separators, quoted values
    // may contain anything but a quote
    static ref PAIR_REGEX: Regex =
        Regex::new(r#"([A-Za-z0-9_.-]+)=(?:"([^"]*)"|([^\s",;]*))"#).unwrap();
}

/// The default extractor: unquoted `key=value` and `key="some value"`
/// pairs, logfmt style.
pub struct EqualsPairExtractor;

impl KvExtractor for EqualsPairExtractor {
    fn extract(&self, raw: &[u8], emit: &mut dyn FnMut(&[u8], &[u8])) {
        let mut key = Vec::new();
        let mut value = Vec::new();
        for caps in PAIR_REGEX.captures_iter(raw) {
            let raw_value = match caps.get(2).or_else(|| caps.get(3)) {
                Some(m) => m.as_bytes(),
                None => continue,
            };

            key.clear();
            key.extend(caps[1].iter().map(|b| b.to_ascii_lowercase()));
            value.clear();
            value.extend(raw_value.iter().map(|b| b.to_ascii_lowercase()));

            emit(&key, &value);
        }
    }
}

/// Runs a list of extractors in declaration order.
pub struct MultiExtractor {
    extractors: Vec<Box<dyn KvExtractor>>,
}

impl MultiExtractor {
    pub fn new(extractors: Vec<Box<dyn KvExtractor>>) -> Self {
        Self { extractors }
    }
}

impl KvExtractor for MultiExtractor {
    fn extract(&self, raw: &[u8], emit: &mut dyn FnMut(&[u8], &[u8])) {
        for extractor in &self.extractors {
            extractor.extract(raw, emit);
        }
    }
}
