//! Parser for component source files.
//!
//! The template language itself is not Rust, so this is a small
//! hand-written scanner: a `regex` pre-pass locates `package` and
//! `component Name(` headers, then manual paren/brace-depth counting finds
//! the parameter list and body — bodies may contain nested `{ }` from
//! control constructs, which a single regex can't balance. Parameter type
//! strings are treated as opaque, per `spec.md` §9 Open Question (a).

use crate::error::Error;
use crate::types::Parameter;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

static PACKAGE_RE: OnceLock<Regex> = OnceLock::new();
static COMPONENT_RE: OnceLock<Regex> = OnceLock::new();
static REFERENCE_RE: OnceLock<Regex> = OnceLock::new();

fn package_re() -> &'static Regex {
    PACKAGE_RE.get_or_init(|| Regex::new(r"(?m)^\s*package\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

fn component_re() -> &'static Regex {
    COMPONENT_RE.get_or_init(|| {
        Regex::new(r"\bcomponent\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap()
    })
}

fn reference_re() -> &'static Regex {
    REFERENCE_RE.get_or_init(|| Regex::new(r"@([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap())
}

/// A single successfully parsed `component` block.
#[derive(Debug, Clone)]
pub struct ParsedComponent {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub references: Vec<String>,
}

/// Outcome of parsing one source file.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub package: Option<String>,
    pub components: Vec<ParsedComponent>,
    pub errors: Vec<Error>,
}

/// Convert a byte offset into 1-based (line, column).
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for ch in source[..offset.min(source.len())].chars() {
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Find the index of the matching closing delimiter for the opening
/// delimiter at `open_idx`, honoring nesting. Returns `None` if the source
/// ends before the matching delimiter is found.
fn find_matching(source: &str, open_idx: usize, open: char, close: char) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut depth = 0i32;
    let mut idx = open_idx;
    while idx < bytes.len() {
        let ch = source[idx..].chars().next()?;
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(idx);
            }
        }
        idx += ch.len_utf8();
    }
    None
}

/// Split a parameter list string on top-level commas (commas inside nested
/// parens, e.g. `onClick func(int)`, are not split points).
fn split_top_level_commas(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (idx, ch) in params.char_indices() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(params[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    let tail = params[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

fn parse_parameter(raw: &str) -> Option<Parameter> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut split = raw.splitn(2, char::is_whitespace);
    let name_token = split.next()?.trim();
    let type_name = split.next().unwrap_or("").trim().to_string();
    let optional = name_token.ends_with('?');
    let name = name_token.trim_end_matches('?').to_string();
    Some(Parameter { name, type_name, optional })
}

fn extract_references(body: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut refs = Vec::new();
    for cap in reference_re().captures_iter(body) {
        let name = cap[1].to_string();
        if seen.insert(name.clone()) {
            refs.push(name);
        }
    }
    refs
}

/// Parse one source file's contents. Never aborts on a malformed component —
/// each failure is recorded in `ParseOutcome::errors` and scanning resumes
/// after the header that failed to parse.
pub fn parse(path: &Path, source: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    outcome.package = package_re().captures(source).map(|c| c[1].to_string());

    let mut search_from = 0usize;
    while let Some(m) = component_re().find(&source[search_from..]) {
        let abs_start = search_from + m.start();
        let name_caps = component_re().captures(&source[search_from..]).unwrap();
        let name = name_caps[1].to_string();
        let open_paren = search_from + m.end() - 1; // the `(` the regex consumed

        let Some(close_paren) = find_matching(source, open_paren, '(', ')') else {
            let (line, column) = line_col(source, abs_start);
            outcome.errors.push(Error::ParseError {
                path: path.to_path_buf(),
                line,
                column,
                message: format!("component '{name}': unterminated parameter list"),
            });
            search_from = abs_start + m.end();
            continue;
        };

        let params_str = &source[open_paren + 1..close_paren];
        let parameters: Vec<Parameter> = split_top_level_commas(params_str)
            .into_iter()
            .filter_map(parse_parameter)
            .collect();

        let after_params = source[close_paren + 1..].trim_start();
        let skipped = source[close_paren + 1..].len() - after_params.len();
        let body_open_rel = after_params.find('{');

        let Some(body_open_rel) = body_open_rel.filter(|&idx| after_params[..idx].trim().is_empty()) else {
            let (line, column) = line_col(source, close_paren);
            outcome.errors.push(Error::ParseError {
                path: path.to_path_buf(),
                line,
                column,
                message: format!("component '{name}': expected '{{' after parameter list"),
            });
            search_from = close_paren + 1;
            continue;
        };
        let body_open = close_paren + 1 + skipped + body_open_rel;

        let Some(body_close) = find_matching(source, body_open, '{', '}') else {
            let (line, column) = line_col(source, body_open);
            outcome.errors.push(Error::ParseError {
                path: path.to_path_buf(),
                line,
                column,
                message: format!("component '{name}': unterminated body"),
            });
            search_from = body_open + 1;
            continue;
        };

        let body = &source[body_open + 1..body_close];
        let references = extract_references(body);

        outcome.components.push(ParsedComponent { name, parameters, references });
        search_from = body_close + 1;
    }

    outcome
}
