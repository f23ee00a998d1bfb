//! Scanning filters: operator-supplied `namespace;kind;name` regex triples.

use regex::Regex;
use tracing::warn;
use vigil_core::{AdmissionRequest, ObjectMetadata};

/// One compiled skip-list entry. An entry that failed to parse never matches.
#[derive(Debug, Clone)]
pub struct SkipEntry {
    raw: String,
    patterns: Option<[Regex; 3]>,
}

impl SkipEntry {
    pub fn parse(raw: &str) -> Self {
        let patterns = compile(raw);
        if patterns.is_none() {
            warn!(entry = %raw, "skip-list entry is malformed; it will never match");
        }
        Self { raw: raw.to_string(), patterns }
    }

    pub fn raw(&self) -> &str { &self.raw }

    pub fn is_valid(&self) -> bool { self.patterns.is_some() }

    /// Patterns are searched, not anchored; use `^...$` for exact matches.
    pub fn matches(&self, namespace: &str, kind: &str, name: &str) -> bool {
        match &self.patterns {
            Some([ns, k, n]) => ns.is_match(namespace) && k.is_match(kind) && n.is_match(name),
            None => false,
        }
    }
}

fn compile(raw: &str) -> Option<[Regex; 3]> {
    let parts: Vec<&str> = raw.split(';').collect();
    match parts.as_slice() {
        [ns, kind, name] => Some([Regex::new(ns).ok()?, Regex::new(kind).ok()?, Regex::new(name).ok()?]),
        _ => None,
    }
}

/// Ordered `namespace;kind;name` skip entries; any match skips the object.
#[derive(Debug, Clone, Default)]
pub struct SkipList {
    entries: Vec<SkipEntry>,
}

impl SkipList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self { entries: entries.into_iter().map(|s| SkipEntry::parse(s.as_ref())).collect() }
    }

    /// A new list holding this list's entries followed by `extra`.
    pub fn extended<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = self.entries.clone();
        entries.extend(extra.into_iter().map(|s| SkipEntry::parse(s.as_ref())));
        Self { entries }
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Raw entries, in order, as they were supplied.
    pub fn raw_entries(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.raw.clone()).collect()
    }

    pub fn matches(&self, namespace: &str, kind: &str, name: &str) -> bool {
        self.entries.iter().any(|e| e.matches(namespace, kind, name))
    }
}

/// True when some entry matches the request's namespace, kind and object name.
pub fn should_skip_by_scanning_filters(req: &AdmissionRequest, meta: &ObjectMetadata, skip_list: &SkipList) -> bool {
    skip_list.matches(&req.namespace, &req.kind.kind, &meta.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_arity_is_invalid() {
        assert!(!SkipEntry::parse("default;Pod").is_valid());
        assert!(!SkipEntry::parse("a;b;c;d").is_valid());
        assert!(SkipEntry::parse(".*;.*;.*").is_valid());
    }

    #[test]
    fn bad_regex_is_invalid_and_never_matches() {
        let e = SkipEntry::parse("(;Pod;x");
        assert!(!e.is_valid());
        assert!(!e.matches("(", "Pod", "x"));
    }
}
