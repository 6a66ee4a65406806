//! Path template rendering for the tree layout.
//!
//! Templates are strings with `$var` / `${var}` placeholders rendered from
//! per-message values, e.g. `"$folder/$yyyy/$mm/${sha8}_${subj}.eml"`.

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

/// Preset layouts, resolvable by name before rendering.
pub static PRESETS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (
            "default",
            "$folder/$yyyy/$mm/$dd/${hhmmss}_${sha8}_${subj}.eml",
        ),
        ("flat", "$folder/${sha8}_${subj}.eml"),
        ("monthly", "$folder/$yyyy/$mm/${sha8}_${subj}.eml"),
        ("daily", "$folder/$yyyy/$mm/$dd/${sha8}_${subj}.eml"),
        ("compact", "$folder/$yyyy$mm$dd_${sha8}.eml"),
        ("hash2", "$folder/${sha2}/${sha8}_${subj}.eml"),
        ("verbose", "$folder/$yyyy/$mm/$dd/${hhmm}_${from}_${subj}_${sha8}.eml"),
    ])
});

/// Backwards-compatible aliases from the old layout names.
pub static LEGACY_PRESETS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("tree:flat", "flat"),
        ("tree:year", "$folder/$yyyy/${sha8}_${subj}.eml"),
        ("tree:month", "monthly"),
        ("tree:day", "daily"),
        ("tree:hash2", "hash2"),
    ])
});

/// Resolve a preset name to its template string. Unknown names are assumed
/// to already be templates.
pub fn resolve_preset(layout: &str) -> String {
    if let Some(resolved) = LEGACY_PRESETS.get(layout) {
        if let Some(template) = PRESETS.get(resolved) {
            return template.to_string();
        }
        return resolved.to_string();
    }
    if let Some(template) = PRESETS.get(layout) {
        return template.to_string();
    }
    layout.to_string()
}

/// A layout string is valid when it names a preset, selects the sqlite
/// layout, or contains at least one `$` placeholder.
pub fn is_valid_layout(layout: &str) -> bool {
    PRESETS.contains_key(layout)
        || LEGACY_PRESETS.contains_key(layout)
        || layout == "sqlite"
        || layout.contains('$')
}

/// SHA-256 of the raw message bytes, lowercase hex. This is the on-disk
/// identity of a message.
pub fn content_hash(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

/// Sanitize a header value for use as a path component.
///
/// Lowercases, strips leading `re:`/`fwd:`/`fw:` repeatedly, rewrites every
/// non-`[a-z0-9]` to `_`, collapses runs, trims, truncates. Idempotent;
/// never returns an empty string.
pub fn sanitize_for_path(s: &str, max_len: usize) -> String {
    let mut s = s.to_lowercase();

    let prefixes = ["re:", "fwd:", "fw:"];
    let mut changed = true;
    while changed {
        changed = false;
        for prefix in prefixes {
            if let Some(rest) = s.strip_prefix(prefix) {
                s = rest.trim_start().to_string();
                changed = true;
            }
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut prev_underscore = false;
    for c in s.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            prev_underscore = false;
        } else if !prev_underscore {
            out.push('_');
            prev_underscore = true;
        }
    }

    let mut out = out.trim_matches('_').to_string();
    if out.len() > max_len {
        out.truncate(max_len);
        out = out.trim_end_matches('_').to_string();
    }

    if out.is_empty() {
        "_".to_string()
    } else {
        out
    }
}

/// Per-message values available to templates.
#[derive(Clone, Debug)]
pub struct MessageVars<'a> {
    pub folder: &'a str,
    pub raw: &'a [u8],
    pub date: Option<DateTime<Utc>>,
    pub subject: &'a str,
    pub from_addr: &'a str,
    pub uid: Option<u32>,
}

impl MessageVars<'_> {
    /// Expand into the full variable table. A missing date falls back to
    /// the render-time wall clock, so such files still land somewhere
    /// consistent (but not reproducibly).
    pub fn to_map(&self) -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();

        vars.insert("folder", self.folder.to_string());

        let sha = content_hash(self.raw);
        vars.insert("sha2", sha[..2].to_string());
        vars.insert("sha4", sha[..4].to_string());
        vars.insert("sha8", sha[..8].to_string());
        vars.insert("sha16", sha[..16].to_string());
        vars.insert("sha32", sha[..32].to_string());
        vars.insert("sha", sha);

        let dt = self.date.unwrap_or_else(Utc::now);
        vars.insert("yyyy", dt.format("%Y").to_string());
        vars.insert("yy", dt.format("%y").to_string());
        vars.insert("mm", dt.format("%m").to_string());
        vars.insert("dd", dt.format("%d").to_string());
        vars.insert("hh", dt.format("%H").to_string());
        vars.insert("MM", dt.format("%M").to_string());
        vars.insert("ss", dt.format("%S").to_string());
        vars.insert("hhmm", dt.format("%H%M").to_string());
        vars.insert("hhmmss", dt.format("%H%M%S").to_string());

        vars.insert("subj", sanitize_for_path(self.subject, 30));
        vars.insert("subj10", sanitize_for_path(self.subject, 10));
        vars.insert("subj20", sanitize_for_path(self.subject, 20));
        vars.insert("subj40", sanitize_for_path(self.subject, 40));
        vars.insert("subj60", sanitize_for_path(self.subject, 60));

        vars.insert("from", sanitize_for_path(self.from_addr, 20));
        vars.insert("from10", sanitize_for_path(self.from_addr, 10));
        vars.insert("from30", sanitize_for_path(self.from_addr, 30));

        vars.insert("uid", self.uid.map_or_else(|| "0".to_string(), |u| u.to_string()));

        vars
    }
}

/// A resolved template ready to render message paths.
#[derive(Clone, Debug)]
pub struct PathTemplate {
    original: String,
    template: String,
}

impl PathTemplate {
    pub fn new(layout: &str) -> Self {
        Self {
            original: layout.to_string(),
            template: resolve_preset(layout),
        }
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn template_str(&self) -> &str {
        &self.template
    }

    /// Substitute `$var` / `${var}` placeholders. An undefined variable is
    /// a fatal render error.
    pub fn render(&self, vars: &HashMap<&'static str, String>) -> Result<String> {
        let mut out = String::with_capacity(self.template.len() + 32);
        let mut chars = self.template.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }

            let name: String = if chars.peek() == Some(&'{') {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => bail!("unterminated ${{...}} in template '{}'", self.template),
                    }
                }
                name
            } else {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                name
            };

            if name.is_empty() {
                bail!("dangling '$' in template '{}'", self.template);
            }

            let value = vars.get(name.as_str()).ok_or_else(|| {
                anyhow::anyhow!("unknown template variable '${name}' in '{}'", self.template)
            })?;
            out.push_str(value);
        }

        Ok(out)
    }

    pub fn render_message(&self, vars: &MessageVars<'_>) -> Result<String> {
        self.render(&vars.to_map())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["Re: Fwd: Meeting (notes)", "Café résumé", "a   b   c", ""] {
            let once = sanitize_for_path(input, 30);
            assert_eq!(sanitize_for_path(&once, 30), once);
        }
    }

    #[test]
    fn sanitize_strips_reply_prefixes() {
        assert_eq!(sanitize_for_path("Re: Fwd: Test", 30), "test");
        assert_eq!(sanitize_for_path("FW: RE: Subject", 30), "subject");
    }

    #[test]
    fn sanitize_empty_becomes_underscore() {
        assert_eq!(sanitize_for_path("", 30), "_");
        assert_eq!(sanitize_for_path("   ", 30), "_");
    }

    #[test]
    fn render_is_deterministic() {
        let tpl = PathTemplate::new("default");
        let date = Utc.with_ymd_and_hms(2024, 3, 15, 14, 30, 5).unwrap();
        let vars = MessageVars {
            folder: "INBOX",
            raw: b"raw bytes",
            date: Some(date),
            subject: "Hello World",
            from_addr: "alice@example.com",
            uid: Some(7),
        };
        let a = tpl.render_message(&vars).unwrap();
        let b = tpl.render_message(&vars).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("INBOX/2024/03/15/143005_"));
        assert!(a.ends_with("_hello_world.eml"));
    }

    #[test]
    fn unknown_variable_is_fatal() {
        let tpl = PathTemplate::new("$folder/$nope.eml");
        let vars = MessageVars {
            folder: "INBOX",
            raw: b"x",
            date: None,
            subject: "",
            from_addr: "",
            uid: None,
        };
        assert!(tpl.render_message(&vars).is_err());
    }

    #[test]
    fn legacy_presets_resolve() {
        assert_eq!(resolve_preset("tree:month"), resolve_preset("monthly"));
        assert!(resolve_preset("tree:year").contains('$'));
        assert_eq!(resolve_preset("$a/$b"), "$a/$b");
    }
}
