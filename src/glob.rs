//! Name and tag patterns.
//!
//! `*` matches within one path component, `**` crosses `/`, `?` matches one
//! non-`/` character, `[...]` is a character class and `{a,b}` is an alternation.
//! Patterns are translated to an anchored [`Regex`].

use regex::Regex;

use crate::error::{Error, Result};

const WILDCARDS: &[char] = &['*', '?', '['];

pub fn compile(pattern: &str) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let chars: Vec<char> = pattern.chars().collect();
    let mut depth = 0usize;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    out.push_str(".*");
                    i += 1;
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '{' => {
                depth += 1;
                out.push_str("(?:");
            }
            '}' if depth > 0 => {
                depth -= 1;
                out.push(')');
            }
            ',' if depth > 0 => out.push('|'),
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|e| *e == ']')
                    .map(|p| p + i + 1)
                    .ok_or_else(|| {
                        Error::Configuration(format!("unterminated '[' in pattern '{}'", pattern))
                    })?;
                out.push('[');
                let mut body: &[char] = &chars[i + 1..close];
                if let Some(first) = body.first() {
                    if *first == '!' || *first == '^' {
                        out.push('^');
                        body = &body[1..];
                    }
                }
                for b in body {
                    if *b == '\\' || *b == '[' || *b == ']' {
                        out.push('\\');
                    }
                    out.push(*b);
                }
                out.push(']');
                i = close;
            }
            '\\' => {
                let next = chars.get(i + 1).ok_or_else(|| {
                    Error::Configuration(format!("trailing escape in pattern '{}'", pattern))
                })?;
                out.push_str(&regex::escape(&next.to_string()));
                i += 1;
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }
    if depth != 0 {
        return Err(Error::Configuration(format!(
            "unbalanced '{{' in pattern '{}'",
            pattern
        )));
    }
    out.push('$');
    Regex::new(&out)
        .map_err(|e| Error::Configuration(format!("invalid pattern '{}': {}", pattern, e)))
}

pub fn matches(pattern: &str, name: &str) -> Result<bool> {
    Ok(compile(pattern)?.is_match(name))
}

/// Expands `{a,b}` groups into every literal they describe.
fn expand_alternations(pattern: &str) -> Vec<String> {
    let open = match pattern.find('{') {
        None => return vec![pattern.to_string()],
        Some(o) => o,
    };
    let mut depth = 0;
    let mut close = None;
    let mut splits = Vec::new();
    for (idx, c) in pattern[open..].char_indices() {
        let idx = idx + open;
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(idx);
                    break;
                }
            }
            ',' if depth == 1 => splits.push(idx),
            _ => (),
        }
    }
    let close = match close {
        None => return vec![pattern.to_string()],
        Some(c) => c,
    };
    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    let mut bounds = vec![open];
    bounds.extend(splits);
    bounds.push(close);
    let mut out = Vec::new();
    for w in bounds.windows(2) {
        let alt = &pattern[w[0] + 1..w[1]];
        for expanded in expand_alternations(&format!("{}{}{}", prefix, alt, suffix)) {
            if !out.contains(&expanded) {
                out.push(expanded);
            }
        }
    }
    out
}

/// The literal names a pattern can match, when it contains no wildcard.
pub fn specific_paths(pattern: &str) -> Option<Vec<String>> {
    if pattern.is_empty() || pattern.contains(WILDCARDS) {
        return None;
    }
    Some(expand_alternations(pattern))
}

/// The literal first path components (namespaces) a pattern can match.
///
/// `library/*` yields `["library"]`, `{a,b}/app` yields `["a", "b"]` and
/// `*/app` yields `None`.
pub fn specific_namespaces(pattern: &str) -> Option<Vec<String>> {
    let mut namespaces = Vec::new();
    for candidate in expand_alternations(pattern) {
        let (first, _) = candidate.split_once('/')?;
        if first.is_empty() || first.contains(WILDCARDS) || first.contains(['{', '}']) {
            return None;
        }
        if !namespaces.iter().any(|n| n == first) {
            namespaces.push(first.to_string());
        }
    }
    if namespaces.is_empty() {
        None
    } else {
        Some(namespaces)
    }
}
