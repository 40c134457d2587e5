//! Extraction Script Generator - the in-page DOM interpreter
//!
//! For `action: loadUrl` modules the rule AST ships into the page as JSON
//! and a generated script interprets it over the live DOM: purify first,
//! then resolve list nodes, then extract field values per item. The script
//! is a *function body* with a top-level `return`; controllers wrap it as
//! needed (IIFE for Chrome, completion handler for platform web views).
//! Fatal errors return `{__error: message}` instead of throwing so the host
//! can surface a precise message.

use serde::Serialize;

use super::ast::RuleNode;
use crate::error::{ReaderError, ReaderResult};

/// Key used by generated put-variable pseudo-fields (`__put__name`).
pub const PUT_FIELD_PREFIX: &str = "__put__";

/// Content-cleanup rule. CSS rules remove matching elements; regex rules
/// rewrite text nodes (script/style/noscript skipped).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PurifyRule {
    #[serde(rename = "css")]
    Css { selector: String },
    #[serde(rename = "regex")]
    Regex { pattern: String, replacement: String },
}

impl PurifyRule {
    /// Purify entries use `##pattern##replacement` for regex rewrites
    /// (`@regex:` accepted as an alias) and a bare CSS selector for element
    /// removal.
    pub fn parse(raw: &str) -> ReaderResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ReaderError::parse("empty purify rule", raw));
        }
        let regex_body = if let Some(rest) = raw.strip_prefix("##") {
            Some(rest)
        } else {
            raw.strip_prefix("@regex:")
        };
        if let Some(body) = regex_body {
            let (pattern, replacement) = match body.split_once("##") {
                Some((p, r)) => (p, r),
                None => (body, ""),
            };
            if pattern.is_empty() {
                return Err(ReaderError::parse("empty purify regex pattern", raw));
            }
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ReaderError::parse(
                    format!("invalid purify regex: {e}"),
                    raw,
                ));
            }
            return Ok(Self::Regex {
                pattern: pattern.to_string(),
                replacement: replacement.to_string(),
            });
        }
        Ok(Self::Css {
            selector: raw.to_string(),
        })
    }

    /// Host-side application for the fetch backend: regex rules rewrite the
    /// raw body, CSS rules are a no-op without a DOM.
    pub fn apply_native(&self, text: &str) -> ReaderResult<Option<String>> {
        match self {
            Self::Css { .. } => Ok(None),
            Self::Regex {
                pattern,
                replacement,
            } => {
                let re = regex::Regex::new(pattern).map_err(|e| {
                    ReaderError::source(format!("invalid purify regex: {e}"))
                })?;
                Ok(Some(re.replace_all(text, replacement.as_str()).into_owned()))
            }
        }
    }
}

/// What one WebView extraction should produce.
#[derive(Debug, Default)]
pub struct ExtractSpec<'a> {
    /// List rule; `None` extracts a single record from the document.
    pub list: Option<&'a RuleNode>,
    /// Per-item fields, in output order
    pub fields: Vec<(String, &'a RuleNode)>,
    /// Fields evaluated on the document rather than per item (pagination
    /// next-link and friends)
    pub root_fields: Vec<(String, &'a RuleNode)>,
    pub purify: Vec<PurifyRule>,
}

/// Emit the extraction function body for this spec.
pub fn generate_extract_script(spec: &ExtractSpec) -> String {
    let fields: Vec<serde_json::Value> = spec
        .fields
        .iter()
        .map(|(key, node)| serde_json::json!([key, node]))
        .collect();
    let root_fields: Vec<serde_json::Value> = spec
        .root_fields
        .iter()
        .map(|(key, node)| serde_json::json!([key, node]))
        .collect();
    let payload = serde_json::json!({
        "list": spec.list,
        "fields": fields,
        "rootFields": root_fields,
        "purify": spec.purify,
    });

    format!("var __spec = {payload};\n{SCRIPT_RUNTIME}")
}

/// The interpreter: operator merging, Python slices, attribute extraction
/// and purify, mirroring the native evaluator's semantics over the DOM.
const SCRIPT_RUNTIME: &str = r#"
function __fail(msg) { throw new Error(msg); }

function __applySlice(arr, s) {
  var len = arr.length;
  if (s.index) {
    var idx = s.start == null ? 0 : s.start;
    if (idx < 0) idx += len;
    return (idx >= 0 && idx < len) ? [arr[idx]] : [];
  }
  var step = s.step == null ? 1 : s.step;
  var out = [];
  if (step > 0) {
    var start = s.start == null ? 0 : s.start;
    if (start < 0) start += len;
    start = Math.max(0, Math.min(start, len));
    var end = s.end == null ? len : s.end;
    if (end < 0) end += len;
    end = Math.max(0, Math.min(end, len));
    for (var i = start; i < end; i += step) out.push(arr[i]);
  } else {
    var start = s.start == null ? len - 1 : (s.start < 0 ? s.start + len : s.start);
    start = Math.min(start, len - 1);
    var end = s.end == null ? -1 : (s.end < 0 ? Math.max(s.end + len, -1) : s.end);
    for (var i = start; i > end && i >= 0; i += step) out.push(arr[i]);
  }
  return out;
}

function __mergeParts(op, thunks) {
  if (op === '||') {
    for (var i = 0; i < thunks.length; i++) {
      try {
        var v = thunks[i]();
        if (v && v.length) return v;
      } catch (e) {
        if (i === thunks.length - 1) throw e;
      }
    }
    return [];
  }
  var parts = thunks.map(function (t) { return t(); });
  if (op === '&&') return Array.prototype.concat.apply([], parts);
  if (op === '%%') {
    var out = [];
    var max = 0;
    for (var i = 0; i < parts.length; i++) max = Math.max(max, parts[i].length);
    for (var i = 0; i < max; i++) {
      for (var j = 0; j < parts.length; j++) {
        if (i < parts[j].length) out.push(parts[j][i]);
      }
    }
    return out;
  }
  __fail('unknown composite operator: ' + op);
}

function __cssNodes(sel, ctx) {
  return Array.prototype.slice.call((ctx || document).querySelectorAll(sel));
}

function __xpathNodes(expr, ctx) {
  var res = document.evaluate(expr, ctx || document, null,
    XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
  var out = [];
  for (var i = 0; i < res.snapshotLength; i++) out.push(res.snapshotItem(i));
  return out;
}

function __resolveNodes(rule, ctx) {
  if (rule.kind === 'composite') {
    return __mergeParts(rule.operator, rule.children.map(function (ch) {
      return function () { return __resolveNodes(ch, ctx); };
    }));
  }
  if (rule.kind !== 'selector') __fail('rule kind not usable as node list: ' + rule.kind);
  var nodes;
  if (rule.selectorType === 'css') nodes = __cssNodes(rule.expr, ctx);
  else if (rule.selectorType === 'xpath') nodes = __xpathNodes(rule.expr, ctx);
  else __fail('selector type not supported in webview: ' + rule.selectorType);
  if (rule.slice) nodes = __applySlice(nodes, rule.slice);
  return nodes;
}

function __attrValue(node, attr) {
  if (node.nodeType === 2 || node.nodeType === 3) return node.nodeValue || '';
  if (attr === 'text') return (node.textContent || '').trim();
  if (attr === 'html') return node.innerHTML || '';
  if (attr === 'outerHtml') return node.outerHTML || '';
  var v = node.getAttribute ? (node.getAttribute(attr) || '') : '';
  if ((attr === 'href' || attr === 'src') && v) {
    try { v = new URL(v, document.baseURI).href; } catch (e) {}
  }
  return v;
}

function __resolveValues(rule, ctx) {
  if (rule.kind === 'js') {
    var resultText = ctx
      ? (ctx.outerHTML || ctx.textContent || '')
      : (document.documentElement ? document.documentElement.outerHTML : '');
    var body = /\breturn\b/.test(rule.code) ? rule.code : ('return (' + rule.code + ');');
    var v = (new Function('result', 'baseUrl', body))(resultText, document.baseURI);
    if (v == null) return [];
    if (Array.isArray(v)) {
      return v.map(String).filter(function (s) { return s.length; });
    }
    v = String(v);
    return v.length ? [v] : [];
  }
  if (rule.kind === 'composite') {
    return __mergeParts(rule.operator, rule.children.map(function (ch) {
      return function () { return __resolveValues(ch, ctx); };
    }));
  }
  var nodes = __resolveNodes(rule, ctx);
  var attr = rule.attr || 'text';
  return nodes.map(function (n) { return __attrValue(n, attr); })
    .filter(function (s) { return s.length; });
}

function __fieldValue(rule, ctx) {
  var joined = __resolveValues(rule, ctx).join('\n');
  if (rule.kind === 'selector' && rule.regexReplace) {
    var rr = rule.regexReplace;
    var re;
    try { re = new RegExp(rr.pattern, rr.firstOnly ? '' : 'g'); }
    catch (e) { __fail('invalid regex-replace pattern: ' + rr.pattern); }
    joined = joined.replace(re, rr.replacement);
  }
  return joined;
}

function __purify(rules) {
  for (var i = 0; i < rules.length; i++) {
    var r = rules[i];
    if (r.kind === 'css') {
      var nodes;
      try { nodes = document.querySelectorAll(r.selector); }
      catch (e) { __fail('invalid purify selector: ' + r.selector); }
      for (var j = nodes.length - 1; j >= 0; j--) {
        var n = nodes[j];
        if (n.parentNode) n.parentNode.removeChild(n);
      }
    } else {
      var re;
      try { re = new RegExp(r.pattern, 'g'); }
      catch (e) { __fail('invalid purify regex: ' + r.pattern); }
      var root = document.body || document.documentElement;
      if (!root) continue;
      var walker = document.createTreeWalker(root, NodeFilter.SHOW_TEXT, null, false);
      var texts = [];
      while (walker.nextNode()) texts.push(walker.currentNode);
      for (var j = 0; j < texts.length; j++) {
        var parent = texts[j].parentNode && texts[j].parentNode.nodeName;
        if (parent === 'SCRIPT' || parent === 'STYLE' || parent === 'NOSCRIPT') continue;
        texts[j].nodeValue = texts[j].nodeValue.replace(re, r.replacement);
      }
    }
  }
}

try {
  __purify(__spec.purify || []);

  if (!__spec.list) {
    var single = {};
    __spec.fields.forEach(function (f) { single[f[0]] = __fieldValue(f[1], null); });
    return single;
  }

  var items = __resolveNodes(__spec.list, null).map(function (el) {
    var item = {};
    __spec.fields.forEach(function (f) { item[f[0]] = __fieldValue(f[1], el); });
    return item;
  });

  if (__spec.rootFields && __spec.rootFields.length) {
    var root = {};
    __spec.rootFields.forEach(function (f) { root[f[0]] = __fieldValue(f[1], null); });
    return { root: root, items: items };
  }
  return items;
} catch (e) {
  return { __error: String(e && e.message ? e.message : e) };
}
"#;
