//! Rule DSL parser - parse rule expressions into the typed AST
//!
//! Handles the full rule syntax:
//! - Atom type detection (@js:, @json:/$, @regex:, @xpath:///, CSS default)
//! - Composite combinations (`a || b`, `a && b`, `a %% b`), one operator
//!   per nesting level
//! - Trailing `@attr` / `[slice]` suffixes on CSS and XPath selectors
//! - `@put:{var:rule}` side-effect directives
//! - `##pattern##replacement##1` regex-replace suffixes
//!
//! Splitting is bracket- and string-aware: operators inside `[]`/`()`/`{}`
//! or inside `'`/`"`/backtick strings never split. Literal operators are
//! escaped as `\||`, `\&&`, `\%%`, `\##` and un-escaped after splitting.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::ast::{
    Composite, CompositeOp, JsRule, RegexReplace, RuleNode, Selector, SelectorType, SliceRange,
};
use super::template::validate_template;
use crate::error::{ReaderError, ReaderResult};

/// Slice spec: a pure integer index, or 1-2 colon-separated optional bounds.
/// A bare `[]` or anything with letters is a CSS attribute selector, not a
/// slice.
static SLICE_SPEC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(-?\d+|-?\d*(:-?\d*){1,2})$").unwrap());

static PUT_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Parse a field expression. Suffix metadata (`##...`, `@put:{...}`) is
/// allowed, but only on a plain selector root.
pub fn parse_rule(expr: &str) -> ReaderResult<RuleNode> {
    parse_complete(expr, true)
}

/// Parse a list expression. A list rule producing suffix metadata is a
/// hard parse error.
pub fn parse_list_rule(expr: &str) -> ReaderResult<RuleNode> {
    parse_complete(expr, false)
}

fn parse_complete(expr: &str, allow_suffix: bool) -> ReaderResult<RuleNode> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(ReaderError::parse("empty rule expression", expr));
    }
    if let Err(msg) = validate_template(trimmed) {
        return Err(ReaderError::parse(msg, expr));
    }

    let (body, put_vars) = extract_put_directives(trimmed)?;
    let (body, regex_replace) = extract_regex_suffix(&body)?;
    let body = body.trim();
    if body.is_empty() {
        return Err(ReaderError::parse("rule has only suffixes, no body", expr));
    }

    let node = parse_composite(body, expr)?;

    if put_vars.is_empty() && regex_replace.is_none() {
        return Ok(node);
    }
    if !allow_suffix {
        return Err(ReaderError::parse(
            "list expression cannot carry a regex-replace or @put suffix",
            expr,
        ));
    }
    match node {
        RuleNode::Selector(mut sel) => {
            sel.regex_replace = regex_replace;
            sel.put_vars = put_vars;
            Ok(RuleNode::Selector(sel))
        }
        _ => Err(ReaderError::parse(
            "only a selector rule may carry a regex-replace or @put suffix",
            expr,
        )),
    }
}

/// Strip every `@put:{k:rule, ...}` directive out of the expression,
/// collecting the key/rule pairs.
pub fn extract_put_directives(expr: &str) -> ReaderResult<(String, BTreeMap<String, String>)> {
    let mut body = expr.to_string();
    let mut puts = BTreeMap::new();

    while let Some(start) = body.find("@put:{") {
        let inner_start = start + "@put:{".len();
        let mut depth = 1usize;
        let mut end = None;
        let mut chars = body[inner_start..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    chars.next();
                }
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(inner_start + i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let end = end.ok_or_else(|| ReaderError::parse("unclosed @put directive", expr))?;
        let content = body[inner_start..end].to_string();
        for pair in split_unescaped(&content, ',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, rule) = pair
                .split_once(':')
                .ok_or_else(|| ReaderError::parse("@put entry must be `name:rule`", expr))?;
            let key = key.trim();
            if !PUT_KEY.is_match(key) {
                return Err(ReaderError::parse(
                    format!("invalid @put variable name `{key}`"),
                    expr,
                ));
            }
            let rule = unescape_put(rule.trim());
            puts.insert(key.to_string(), rule);
        }
        body.replace_range(start..end + 1, "");
    }

    Ok((body.trim().to_string(), puts))
}

fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = vec![String::new()];
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                if next != sep && next != '}' {
                    parts.last_mut().unwrap().push('\\');
                }
                parts.last_mut().unwrap().push(next);
            }
        } else if c == sep {
            parts.push(String::new());
        } else {
            parts.last_mut().unwrap().push(c);
        }
    }
    parts
}

fn unescape_put(s: &str) -> String {
    s.replace("\\,", ",").replace("\\}", "}")
}

/// Split off a trailing `##pattern##replacement##1` suffix. `\##` escapes a
/// literal `##` and survives into the body for the atom un-escape pass.
pub fn extract_regex_suffix(expr: &str) -> ReaderResult<(String, Option<RegexReplace>)> {
    let mut positions = Vec::new();
    let bytes = expr.as_bytes();
    let mut i = 0;
    let mut escaped = false;
    while i < bytes.len() {
        let c = bytes[i];
        if escaped {
            escaped = false;
            i += 1;
            continue;
        }
        if c == b'\\' {
            escaped = true;
            i += 1;
            continue;
        }
        if c == b'#' && bytes.get(i + 1) == Some(&b'#') {
            positions.push(i);
            i += 2;
            continue;
        }
        i += 1;
    }

    if positions.is_empty() {
        return Ok((expr.to_string(), None));
    }
    if positions.len() > 3 {
        return Err(ReaderError::parse("malformed regex-replace suffix", expr));
    }

    let mut parts = Vec::new();
    let mut prev = 0;
    for &pos in &positions {
        parts.push(&expr[prev..pos]);
        prev = pos + 2;
    }
    parts.push(&expr[prev..]);

    let body = parts[0].to_string();
    let pattern = unescape_hashes(parts[1]);
    if pattern.is_empty() {
        return Err(ReaderError::parse("empty regex-replace pattern", expr));
    }
    if let Err(e) = Regex::new(&pattern) {
        return Err(ReaderError::parse(
            format!("invalid regex-replace pattern: {e}"),
            expr,
        ));
    }
    let replacement = parts
        .get(2)
        .map(|p| unescape_hashes(p))
        .unwrap_or_default();
    let first_only = match parts.get(3) {
        None => false,
        Some(&"1") => true,
        Some(flag) => {
            return Err(ReaderError::parse(
                format!("invalid regex-replace flag `{flag}` (only `1` is allowed)"),
                expr,
            ));
        }
    };

    Ok((
        body,
        Some(RegexReplace {
            pattern,
            replacement,
            first_only,
        }),
    ))
}

fn unescape_hashes(s: &str) -> String {
    s.replace("\\##", "##")
}

/// Split on ` || ` / ` && ` / ` %% ` at bracket depth zero outside strings.
/// All operators found at one level must be the same kind.
fn parse_composite(body: &str, original: &str) -> ReaderResult<RuleNode> {
    let mut op: Option<CompositeOp> = None;
    let mut split_at = Vec::new();

    let mut square = 0i32;
    let mut paren = 0i32;
    let mut brace = 0i32;
    let mut in_str: Option<char> = None;
    let mut escaped = false;

    let chars: Vec<(usize, char)> = body.char_indices().collect();
    let mut idx = 0;
    while idx < chars.len() {
        let (pos, c) = chars[idx];
        if escaped {
            escaped = false;
            idx += 1;
            continue;
        }
        if c == '\\' {
            escaped = true;
            idx += 1;
            continue;
        }
        if let Some(quote) = in_str {
            if c == quote {
                in_str = None;
            }
            idx += 1;
            continue;
        }
        match c {
            '\'' | '"' | '`' => in_str = Some(c),
            '[' => square += 1,
            ']' => square = (square - 1).max(0),
            '(' => paren += 1,
            ')' => paren = (paren - 1).max(0),
            '{' => brace += 1,
            '}' => brace = (brace - 1).max(0),
            ' ' if square == 0 && paren == 0 && brace == 0 => {
                let rest = &body[pos..];
                let found = [
                    (" || ", CompositeOp::Or),
                    (" && ", CompositeOp::And),
                    (" %% ", CompositeOp::Zip),
                ]
                .into_iter()
                .find(|(tok, _)| rest.starts_with(tok));
                if let Some((tok, kind)) = found {
                    match op {
                        Some(existing) if existing != kind => {
                            return Err(ReaderError::parse(
                                format!(
                                    "mixed composite operators `{}` and `{}` at one level",
                                    existing.token(),
                                    kind.token()
                                ),
                                original,
                            ));
                        }
                        _ => op = Some(kind),
                    }
                    split_at.push((pos, tok.len()));
                    // jump past the operator token
                    while idx < chars.len() && chars[idx].0 < pos + tok.len() {
                        idx += 1;
                    }
                    continue;
                }
            }
            _ => {}
        }
        idx += 1;
    }

    let Some(operator) = op else {
        return parse_atom(body, original);
    };

    let mut atoms = Vec::new();
    let mut prev = 0;
    for (pos, len) in split_at {
        atoms.push(&body[prev..pos]);
        prev = pos + len;
    }
    atoms.push(&body[prev..]);

    let mut children = Vec::with_capacity(atoms.len());
    for atom in atoms {
        let atom = atom.trim();
        if atom.is_empty() {
            return Err(ReaderError::parse("empty composite operand", original));
        }
        children.push(parse_atom(atom, original)?);
    }

    Ok(RuleNode::Composite(Composite { operator, children }))
}

fn unescape_atom(s: &str) -> String {
    s.replace("\\||", "||")
        .replace("\\&&", "&&")
        .replace("\\%%", "%%")
        .replace("\\##", "##")
}

fn parse_atom(raw: &str, original: &str) -> ReaderResult<RuleNode> {
    let s = unescape_atom(raw.trim());
    if s.is_empty() {
        return Err(ReaderError::parse("empty rule atom", original));
    }

    if let Some(code) = s.strip_prefix("@js:") {
        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(ReaderError::parse("empty @js rule", original));
        }
        let requires_dom = code.contains("document") || code.contains("window");
        return Ok(RuleNode::Js(JsRule { code, requires_dom }));
    }

    if let Some(rest) = s.strip_prefix("@regex:") {
        let pattern = rest.trim();
        if pattern.is_empty() {
            return Err(ReaderError::parse("empty @regex rule", original));
        }
        if let Err(e) = Regex::new(pattern) {
            return Err(ReaderError::parse(
                format!("invalid regex rule: {e}"),
                original,
            ));
        }
        return Ok(RuleNode::Selector(Selector::new(
            SelectorType::Regex,
            pattern,
        )));
    }

    if let Some(rest) = s.strip_prefix("@json:") {
        return parse_json_atom(rest.trim(), original);
    }
    if s.starts_with('$') {
        return parse_json_atom(&s, original);
    }

    if let Some(rest) = s.strip_prefix("@xpath:") {
        return parse_xpath_atom(rest.trim(), original);
    }
    if s.starts_with("//") {
        return parse_xpath_atom(&s, original);
    }

    let css = s.strip_prefix("@css:").unwrap_or(&s).trim();
    parse_css_atom(css, original)
}

fn parse_json_atom(path: &str, original: &str) -> ReaderResult<RuleNode> {
    if path.is_empty() {
        return Err(ReaderError::parse("empty JSONPath rule", original));
    }
    let path = if path.starts_with('$') {
        path.to_string()
    } else {
        format!("$.{path}")
    };

    // A trailing slice applies to the final match list, host-side; a bare
    // `$[...]` stays in the path for the JSONPath engine itself.
    let mut sel = Selector::new(SelectorType::Json, "");
    let (base, slice) = strip_trailing_slice(&path, original)?;
    if slice.is_some() && base != "$" && !base.is_empty() {
        sel.expr = base;
        sel.slice = slice;
    } else {
        sel.expr = path;
    }
    Ok(RuleNode::Selector(sel))
}

fn parse_xpath_atom(body: &str, original: &str) -> ReaderResult<RuleNode> {
    let mut expr = body.to_string();
    let mut sel = Selector::new(SelectorType::XPath, "");

    loop {
        let (rest, slice) = strip_trailing_slice(&expr, original)?;
        if let Some(slice) = slice {
            if sel.slice.is_none() {
                sel.slice = Some(slice);
                expr = rest;
                continue;
            }
        }
        if let Some(rest) = expr.strip_suffix("/text()") {
            expr = rest.to_string();
            sel.attr = "text".to_string();
            continue;
        }
        if let Some((rest, attr)) = strip_xpath_attr(&expr) {
            expr = rest;
            sel.attr = normalize_attr(&attr);
            continue;
        }
        if let Some((rest, attr)) = strip_trailing_attr(&expr) {
            expr = rest;
            sel.attr = normalize_attr(&attr);
            continue;
        }
        break;
    }

    if expr.trim().is_empty() {
        return Err(ReaderError::parse("empty XPath selector", original));
    }
    sel.expr = expr.trim().to_string();
    Ok(RuleNode::Selector(sel))
}

fn parse_css_atom(body: &str, original: &str) -> ReaderResult<RuleNode> {
    let mut expr = body.to_string();
    let mut sel = Selector::new(SelectorType::Css, "");

    loop {
        let (rest, slice) = strip_trailing_slice(&expr, original)?;
        if let Some(slice) = slice {
            if sel.slice.is_none() {
                sel.slice = Some(slice);
                expr = rest;
                continue;
            }
        }
        if let Some((rest, attr)) = strip_trailing_attr(&expr) {
            expr = rest;
            sel.attr = normalize_attr(&attr);
            continue;
        }
        break;
    }

    if expr.trim().is_empty() {
        return Err(ReaderError::parse("empty CSS selector", original));
    }
    sel.expr = expr.trim().to_string();
    Ok(RuleNode::Selector(sel))
}

/// Strip a trailing `[...]` when its content is a slice spec. Returns the
/// remaining expression and the parsed range.
fn strip_trailing_slice(expr: &str, original: &str) -> ReaderResult<(String, Option<SliceRange>)> {
    let trimmed = expr.trim_end();
    if !trimmed.ends_with(']') {
        return Ok((expr.to_string(), None));
    }
    let Some(open) = trimmed.rfind('[') else {
        return Ok((expr.to_string(), None));
    };
    let content = &trimmed[open + 1..trimmed.len() - 1];
    if !SLICE_SPEC.is_match(content) {
        return Ok((expr.to_string(), None));
    }
    let slice = parse_slice_spec(content, original)?;
    Ok((trimmed[..open].to_string(), Some(slice)))
}

fn parse_slice_spec(content: &str, original: &str) -> ReaderResult<SliceRange> {
    if !content.contains(':') {
        let i: i64 = content
            .parse()
            .map_err(|_| ReaderError::parse("invalid integer in slice", original))?;
        return Ok(SliceRange::index(i));
    }
    let segments: Vec<&str> = content.split(':').collect();
    if segments.len() > 3 {
        return Err(ReaderError::parse("too many `:` in slice", original));
    }
    let mut bounds = [None::<i64>; 3];
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            continue;
        }
        bounds[i] = Some(
            seg.parse()
                .map_err(|_| ReaderError::parse("invalid integer in slice", original))?,
        );
    }
    if bounds[2] == Some(0) {
        return Err(ReaderError::parse("slice step must not be zero", original));
    }
    Ok(SliceRange::range(bounds[0], bounds[1], bounds[2]))
}

/// Strip a trailing `@name` attribute suffix (CSS/DSL style).
fn strip_trailing_attr(expr: &str) -> Option<(String, String)> {
    let trimmed = expr.trim_end();
    let at = trimmed.rfind('@')?;
    if at == 0 {
        return None;
    }
    let attr = &trimmed[at + 1..];
    if attr.is_empty()
        || !attr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some((trimmed[..at].to_string(), attr.to_string()))
}

/// Strip a trailing `/@name` XPath attribute step.
fn strip_xpath_attr(expr: &str) -> Option<(String, String)> {
    let trimmed = expr.trim_end();
    let at = trimmed.rfind("/@")?;
    let attr = &trimmed[at + 2..];
    if attr.is_empty()
        || !attr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some((trimmed[..at].to_string(), attr.to_string()))
}

fn normalize_attr(attr: &str) -> String {
    match attr {
        "text" | "textContent" => "text".to_string(),
        "html" | "innerHtml" => "html".to_string(),
        "outerHtml" => "outerHtml".to_string(),
        other => other.to_string(),
    }
}

/// Parse cache shared across operations. Parsing is source-independent, so
/// expressions key the cache directly.
#[derive(Default)]
pub struct RuleCache {
    field: Mutex<HashMap<String, Arc<RuleNode>>>,
    list: Mutex<HashMap<String, Arc<RuleNode>>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_rule(&self, expr: &str) -> ReaderResult<Arc<RuleNode>> {
        if let Some(node) = self.field.lock().unwrap().get(expr) {
            return Ok(node.clone());
        }
        let node = Arc::new(parse_rule(expr)?);
        self.field
            .lock()
            .unwrap()
            .insert(expr.to_string(), node.clone());
        Ok(node)
    }

    pub fn list_rule(&self, expr: &str) -> ReaderResult<Arc<RuleNode>> {
        if let Some(node) = self.list.lock().unwrap().get(expr) {
            return Ok(node.clone());
        }
        let node = Arc::new(parse_list_rule(expr)?);
        self.list
            .lock()
            .unwrap()
            .insert(expr.to_string(), node.clone());
        Ok(node)
    }
}
