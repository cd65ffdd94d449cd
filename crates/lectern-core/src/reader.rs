//! Reading source documents into plain text plus metadata.
//!
//! Rich formats (PDF and friends) are expected to come from other [`DocumentReader`]
//! implementations; the built-in reader handles plain text and markdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::record::MetadataValue;

/// Extensions [`PlainTextReader`] accepts.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];

/// Text extracted from one source document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// File name; becomes the `sourceFile` of every chunk.
    pub name: String,
    pub text: String,
    pub page_count: usize,
    /// Reader-supplied fields copied onto every chunk.
    pub metadata: BTreeMap<String, MetadataValue>,
}

/// Produces a [`Document`] from a file on disk.
pub trait DocumentReader {
    fn read(&self, path: &Path) -> Result<Document, ReadError>;
}

/// Reads `.txt` and markdown files. Form feeds separate pages; YAML front matter of
/// markdown files becomes document metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextReader;

impl DocumentReader for PlainTextReader {
    fn read(&self, path: &Path) -> Result<Document, ReadError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ReadError::Read(path.to_path_buf(), e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let (front_matter, body) = split_front_matter(&raw);
        let mut metadata = BTreeMap::new();
        if let Some(yaml) = front_matter {
            match parse_front_matter(yaml) {
                Ok(fields) => metadata.extend(fields),
                Err(e) => warn!("ignoring front matter in {}: {}", path.display(), e),
            }
        }

        let page_count = body.split('\u{c}').filter(|p| !p.trim().is_empty()).count().max(1);
        Ok(Document {
            name,
            text: body.replace('\u{c}', "\n\n"),
            page_count,
            metadata,
        })
    }
}

/// Scans `root` (a file or a directory) for readable text documents.
/// Hidden entries are skipped; symlinks into directories are not followed.
pub fn scan_documents(root: &Path) -> Result<Vec<PathBuf>, ReadError> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.is_dir() {
        return Err(ReadError::NotFound(root.to_path_buf()));
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
    {
        let entry = entry.map_err(|e| ReadError::Walk(e.to_string()))?;
        let path = entry.path();
        if path.is_file() && has_text_extension(path) {
            paths.push(path.to_path_buf());
        }
    }
    Ok(paths)
}

fn has_text_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| TEXT_EXTENSIONS.iter().any(|t| t.eq_ignore_ascii_case(e)))
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

/// Splits optional YAML front matter (between a leading `---` and the next `---` line)
/// from the body.
fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let s = content.trim_start();
    let Some(after_first) = s.strip_prefix("---") else {
        return (None, content);
    };
    match after_first.find("\n---") {
        Some(end) => {
            let yaml = &after_first[..end];
            let rest = &after_first[end + 4..];
            (Some(yaml), rest.trim_start())
        }
        None => (None, content),
    }
}

fn parse_front_matter(yaml: &str) -> Result<BTreeMap<String, MetadataValue>, serde_yaml::Error> {
    let map: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(yaml)?;
    Ok(map
        .into_iter()
        .filter_map(|(k, v)| {
            let json = serde_json::to_value(v).ok()?;
            Some((k, MetadataValue::from(json)))
        })
        .collect())
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("no such file or directory: {0}")]
    NotFound(PathBuf),
    #[error("walk error: {0}")]
    Walk(String),
    #[error("read error for {0}: {1}")]
    Read(PathBuf, std::io::Error),
}
