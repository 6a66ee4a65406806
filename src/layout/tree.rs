//! Tree layout: one `.eml` file per message under template-derived paths.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::parsing::HeaderInfo;
use crate::types::StoredMessage;

use super::path_template::{content_hash, MessageVars, PathTemplate};

pub struct TreeLayout {
    root: PathBuf,
    template: PathTemplate,
    // message_id -> relative path, content_hash -> relative path. Built
    // lazily by scanning, or seeded from the File Index.
    mid_index: Option<HashMap<String, PathBuf>>,
    hash_index: Option<HashMap<String, PathBuf>>,
}

impl TreeLayout {
    pub fn new(root: impl Into<PathBuf>, layout: &str) -> Self {
        Self {
            root: root.into(),
            template: PathTemplate::new(layout),
            mid_index: None,
            hash_index: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    /// Seed the lookup maps from a pre-built index so the first dedup check
    /// does not trigger a full scan.
    pub fn seed_indices(&mut self, entries: Vec<(String, Option<String>, String)>) {
        let mut mid_index = HashMap::new();
        let mut hash_index = HashMap::new();
        for (path, message_id, hash) in entries {
            let rel = PathBuf::from(path);
            if let Some(mid) = message_id {
                mid_index.insert(mid, rel.clone());
            }
            hash_index.insert(hash, rel);
        }
        debug!(hashes = hash_index.len(), "tree layout indices seeded");
        self.mid_index = Some(mid_index);
        self.hash_index = Some(hash_index);
    }

    fn ensure_indices(&mut self) -> Result<()> {
        if self.mid_index.is_some() && self.hash_index.is_some() {
            return Ok(());
        }

        let mut mid_index = HashMap::new();
        let mut hash_index = HashMap::new();
        for path in walk_eml_files(&self.root)? {
            let Ok(raw) = fs::read(&path) else { continue };
            let rel = path
                .strip_prefix(&self.root)
                .unwrap_or(&path)
                .to_path_buf();
            if let Ok(info) = HeaderInfo::parse(&raw) {
                if let Some(mid) = info.message_id {
                    mid_index.insert(mid, rel.clone());
                }
            }
            hash_index.insert(content_hash(&raw), rel);
        }
        debug!(files = hash_index.len(), "tree layout indices built by scan");
        self.mid_index = Some(mid_index);
        self.hash_index = Some(hash_index);
        Ok(())
    }

    /// Relative path of an existing file with identical content, if any.
    pub fn path_by_content(&mut self, raw: &[u8]) -> Result<Option<String>> {
        self.ensure_indices()?;
        let sha = content_hash(raw);
        let hit = self
            .hash_index
            .as_ref()
            .and_then(|idx| idx.get(&sha))
            .filter(|rel| self.root.join(rel).exists())
            .map(|rel| rel.to_string_lossy().to_string());
        Ok(hit)
    }

    pub fn has_message(&mut self, message_id: &str) -> Result<bool> {
        self.ensure_indices()?;
        Ok(self
            .mid_index
            .as_ref()
            .and_then(|idx| idx.get(message_id))
            .map(|rel| self.root.join(rel).exists())
            .unwrap_or(false))
    }

    /// Write a message at its template-derived path. Writes go through a
    /// temp file and rename; identical-content collisions land on the same
    /// path with the same bytes and are safe.
    #[allow(clippy::too_many_arguments)]
    pub fn add_message(
        &mut self,
        message_id: &str,
        raw: &[u8],
        folder: &str,
        date: Option<DateTime<Utc>>,
        from_addr: &str,
        subject: &str,
        uid: Option<u32>,
    ) -> Result<PathBuf> {
        let rel = self.template.render_message(&MessageVars {
            folder,
            raw,
            date,
            subject,
            from_addr,
            uid,
        })?;
        let path = self.root.join(&rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let tmp = path.with_extension("eml.tmp");
        fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;

        let rel_path = PathBuf::from(&rel);
        if let Some(idx) = self.mid_index.as_mut() {
            if !message_id.is_empty() {
                idx.insert(message_id.to_string(), rel_path.clone());
            }
        }
        if let Some(idx) = self.hash_index.as_mut() {
            idx.insert(content_hash(raw), rel_path);
        }

        Ok(path)
    }

    pub fn get_message(&mut self, message_id: &str) -> Result<Option<StoredMessage>> {
        self.ensure_indices()?;
        let Some(rel) = self
            .mid_index
            .as_ref()
            .and_then(|idx| idx.get(message_id))
            .cloned()
        else {
            return Ok(None);
        };
        let path = self.root.join(&rel);
        if !path.exists() {
            return Ok(None);
        }
        Ok(parse_eml(&self.root, &path))
    }

    pub fn iter_messages(
        &self,
        folder: Option<&str>,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredMessage>> {
        let mut out = Vec::new();
        for path in walk_eml_files(&self.root)? {
            let Some(msg) = parse_eml(&self.root, &path) else {
                continue;
            };
            if let Some(folder) = folder {
                if msg.folder != folder {
                    continue;
                }
            }
            if let Some(date) = msg.date {
                if start_date.is_some_and(|s| date < s) || end_date.is_some_and(|e| date > e) {
                    continue;
                }
            }
            out.push(msg);
        }
        Ok(out)
    }

    pub fn count(&self, folder: Option<&str>) -> Result<usize> {
        if folder.is_some() {
            return Ok(self.iter_messages(folder, None, None)?.len());
        }
        Ok(walk_eml_files(&self.root)?.len())
    }
}

/// All `.eml` files under `root`, excluding the `.eml` state directory.
pub fn walk_eml_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            if path.is_dir() {
                if name == ".eml" || name == ".git" {
                    continue;
                }
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "eml") {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn parse_eml(root: &Path, path: &Path) -> Option<StoredMessage> {
    let raw = fs::read(path).ok()?;
    let info = HeaderInfo::parse(&raw).ok()?;

    // Messages without a Message-ID get a synthetic content-hash id so
    // they can still be indexed (they are never push-manifest keys).
    let message_id = info
        .message_id
        .unwrap_or_else(|| format!("<{}@content-hash>", content_hash(&raw)));

    let rel = path.strip_prefix(root).unwrap_or(path);
    Some(StoredMessage {
        message_id,
        folder: extract_folder(rel),
        date: info.date,
        from_addr: info.from_addr,
        to_addr: info.to_addr,
        cc_addr: info.cc_addr,
        subject: info.subject,
        path: Some(rel.to_string_lossy().to_string()),
        raw,
    })
}

/// Recover the IMAP folder from a relative path by cutting at the first
/// sharding component (year, month/hash shard, or `_undated`).
fn extract_folder(rel_path: &Path) -> String {
    let parts: Vec<&str> = rel_path
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect()
        })
        .unwrap_or_default();

    let mut folder_parts = Vec::new();
    for part in parts {
        if part.len() == 4 && part.chars().all(|c| c.is_ascii_digit()) {
            break;
        }
        if part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()) {
            break;
        }
        if part == "_undated" {
            break;
        }
        folder_parts.push(part);
    }

    if folder_parts.is_empty() {
        "INBOX".to_string()
    } else {
        folder_parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_extraction_stops_at_shards() {
        assert_eq!(
            extract_folder(Path::new("INBOX/2024/01/a1b2_meeting.eml")),
            "INBOX"
        );
        assert_eq!(
            extract_folder(Path::new("[Gmail]/All Mail/2023/12/05/x.eml")),
            "[Gmail]/All Mail"
        );
        assert_eq!(extract_folder(Path::new("Archive/ab/cdef12_x.eml")), "Archive");
        assert_eq!(extract_folder(Path::new("x.eml")), "INBOX");
    }
}
