//! Variable substitution, response extraction and assertions.

use std::collections::HashMap;

use rand::Rng;
use regex::bytes::Regex;

use crate::item::{OutputItem, PayloadItem};

/// Literal substituted for variables with no current value.
pub const NO_VALUE: &[u8] = b"NO_VALUE";

/// Literal stored when an extractor matches nothing.
pub const NOT_FOUND: &[u8] = b"NOT_FOUND";

/// Per-worker variable state.
pub type ValMap = HashMap<String, Vec<u8>>;

/// Regex-driven capture over the response recording.
#[derive(Debug, Clone)]
pub struct ExtractRegex {
    /// Pattern searched in the response bytes
    pub re: Regex,
    /// Capture group taken from the match; 0 is the whole match
    pub group: usize,
    /// Which match to take; negative picks one at random
    pub match_no: isize,
}

/// Regex assertion over the response recording.
#[derive(Debug, Clone)]
pub struct AssertRegex {
    /// Pattern searched in the response bytes
    pub re: Regex,
    /// Inverted assertions fail when the pattern is present
    pub invert: bool,
}

/// Cache of compiled `${name}` patterns, shared across iterations.
#[derive(Debug, Default)]
pub struct ReplaceCache {
    cache: HashMap<String, Regex>,
}

impl ReplaceCache {
    fn pattern(&mut self, name: &str) -> &Regex {
        self.cache.entry(name.to_string()).or_insert_with(|| {
            let pat = format!(r"(?m)\$\{{{}\}}", regex::escape(name));
            Regex::new(&pat).expect("escaped variable pattern compiles")
        })
    }
}

/// Substitute `${name}` occurrences in payload, label and address for
/// every name in the item's `replaces` list. Missing values become
/// the `NO_VALUE` literal.
pub fn replace_values(item: &mut PayloadItem, values: &ValMap, cache: &mut ReplaceCache) {
    for name in item.replaces.clone() {
        let val: &[u8] = values.get(&name).map(Vec::as_slice).unwrap_or(NO_VALUE);
        let re = cache.pattern(&name);

        item.payload = re.replace_all(&item.payload, val).into_owned();
        if !item.label.is_empty() {
            let replaced = re.replace_all(item.label.as_bytes(), val).into_owned();
            item.label = String::from_utf8_lossy(&replaced).into_owned();
        }
        if !item.address.is_empty() {
            let replaced = re.replace_all(item.address.as_bytes(), val).into_owned();
            item.address = String::from_utf8_lossy(&replaced).into_owned();
        }
    }
}

/// Run the item's extractors against the response recording, storing
/// fresh copies of the captured bytes in the worker's value map.
pub fn extract_values(
    extractors: &HashMap<String, ExtractRegex>,
    response: &[u8],
    values: &mut ValMap,
) {
    for (name, ex) in extractors {
        let cap = capture(ex, response);
        match cap {
            Some(bytes) => {
                values.insert(name.clone(), bytes);
            }
            None => {
                tracing::debug!("No match for extractor {:?}: {}", name, ex.re.as_str());
                values.insert(name.clone(), NOT_FOUND.to_vec());
            }
        }
    }
}

fn capture(ex: &ExtractRegex, response: &[u8]) -> Option<Vec<u8>> {
    let wanted = if ex.match_no >= 0 {
        ex.match_no as usize + 1
    } else {
        usize::MAX
    };

    let matches: Vec<_> = ex.re.captures_iter(response).take(wanted).collect();
    if matches.is_empty() {
        return None;
    }

    let caps = if ex.match_no >= 0 {
        matches.get(ex.match_no as usize)?
    } else {
        &matches[rand::thread_rng().gen_range(0..matches.len())]
    };

    caps.get(ex.group).map(|m| m.as_bytes().to_vec())
}

/// Evaluate the item's assertions against the response recording and
/// attach the aggregate failure message to the result, preserving any
/// pre-existing transport error as a prefix.
pub fn assert_response(asserts: &[AssertRegex], response: &[u8], result: &mut OutputItem) {
    let mut failures = Vec::new();
    for a in asserts {
        if a.re.is_match(response) == a.invert {
            if a.invert {
                failures.push(format!("Assert failed on inverted regexp: {}", a.re.as_str()));
            } else {
                failures.push(format!("Assert failed on regexp: {}", a.re.as_str()));
            }
        }
    }

    if failures.is_empty() {
        return;
    }

    let msg = failures.join("\n");
    result.error = match result.error.take() {
        Some(prev) => Some(format!("{}\n{}", prev, msg)),
        None => Some(msg),
    };
}
