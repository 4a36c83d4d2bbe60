//! Corpus loading for the `ingest` command.
//!
//! Accepts a JSON array of documents, a JSONL file (one document per line),
//! a directory of text files filtered by include/exclude globs, or a single
//! text file.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::path::Path;
use walkdir::WalkDir;

use medrag_core::models::{Document, DocumentKind, Metadata};

use crate::config::LoaderConfig;

/// Document as it appears in JSON input; everything except `content` is optional.
#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    kind: DocumentKind,
    #[serde(default)]
    image_path: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl RawDocument {
    fn into_document(self) -> Document {
        let id = match self.id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id,
            None => Document::derived_id(self.title.as_deref(), &self.content),
        };
        Document {
            id,
            content: self.content,
            title: self.title,
            source: self.source,
            category: self.category,
            tags: self.tags,
            metadata: self.metadata,
            kind: self.kind,
            image_path: self.image_path,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Load documents from `path`.
pub fn load_path(path: &Path, config: &LoaderConfig) -> Result<Vec<Document>> {
    if !path.exists() {
        bail!("Input path does not exist: {}", path.display());
    }
    if path.is_dir() {
        return load_directory(path, config);
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_json_array(&text)
            .with_context(|| format!("Invalid document array in {}", path.display())),
        Some("jsonl") => parse_jsonl(&text)
            .with_context(|| format!("Invalid JSONL in {}", path.display())),
        _ => Ok(vec![file_to_document(path, &path.to_string_lossy(), text)?]),
    }
}

pub fn parse_json_array(text: &str) -> Result<Vec<Document>> {
    let raw: Vec<RawDocument> = serde_json::from_str(text)?;
    Ok(raw.into_iter().map(RawDocument::into_document).collect())
}

pub fn parse_jsonl(text: &str) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: RawDocument =
            serde_json::from_str(line).with_context(|| format!("line {}", lineno + 1))?;
        docs.push(raw.into_document());
    }
    Ok(docs)
}

fn load_directory(root: &Path, config: &LoaderConfig) -> Result<Vec<Document>> {
    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut docs = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let body = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        docs.push(file_to_document(path, &rel_str, body)?);
    }

    // Sort for deterministic ordering
    docs.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(docs)
}

fn file_to_document(path: &Path, relative_path: &str, body: String) -> Result<Document> {
    let modified_secs = std::fs::metadata(path)?
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let title = path
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(Document {
        id: Document::derived_id(Some(relative_path), ""),
        content: body,
        title: Some(title),
        source: Some(relative_path.to_string()),
        category: None,
        tags: Vec::new(),
        metadata: Metadata::new(),
        kind: DocumentKind::Text,
        image_path: None,
        created_at: Utc
            .timestamp_opt(modified_secs, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_array_derives_missing_ids() {
        let docs = parse_json_array(
            r#"[
                {"id": "d1", "content": "高血压", "title": "高血压", "category": "disease", "tags": ["慢病"]},
                {"content": "糖尿病饮食", "title": "糖尿病"}
            ]"#,
        )
        .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "d1");
        assert_eq!(docs[0].tags, vec!["慢病"]);
        assert_eq!(docs[1].id, Document::derived_id(Some("糖尿病"), "糖尿病饮食"));
    }

    #[test]
    fn test_jsonl_reports_bad_line() {
        let err = parse_jsonl("{\"content\": \"a\"}\n\nnot json\n").unwrap_err();
        assert!(format!("{:#}", err).contains("line 3"));
    }

    #[test]
    fn test_directory_respects_globs() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("b.md"), "骨折康复").unwrap();
        std::fs::write(tmp.path().join("a.txt"), "高血压").unwrap();
        std::fs::write(tmp.path().join("skip.pdf"), "x").unwrap();
        std::fs::create_dir(tmp.path().join("drafts")).unwrap();
        std::fs::write(tmp.path().join("drafts/c.md"), "草稿").unwrap();

        let config = LoaderConfig {
            exclude_globs: vec!["drafts/**".into()],
            ..Default::default()
        };
        let docs = load_path(tmp.path(), &config).unwrap();
        let titles: Vec<_> = docs.iter().filter_map(|d| d.title.as_deref()).collect();
        assert_eq!(titles, vec!["a", "b"]);
        assert_eq!(docs[0].source.as_deref(), Some("a.txt"));
    }

    #[test]
    fn test_missing_path_errors() {
        assert!(load_path(Path::new("/nonexistent/medrag"), &LoaderConfig::default()).is_err());
    }
}
