//! Plain-text document sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::{DocumentFormat, DocumentSink, SinkError};
use crate::model::{BookDetail, Chapter};

const MAX_STEM_CHARS: usize = 80;
const MAX_DUPLICATE_SUFFIX: usize = 1000;
const SEPARATOR: &str = "==============================";

/// Writes `<output_dir>/<title>.txt`: a header with the book's metadata,
/// then each chapter's title and body.
#[derive(Debug, Clone)]
pub struct TextSink {
    output_dir: PathBuf,
}

impl TextSink {
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[async_trait]
impl DocumentSink for TextSink {
    fn supports(&self, format: DocumentFormat) -> bool {
        format == DocumentFormat::Txt
    }

    #[instrument(skip_all, fields(title = %book.title, chapters = chapters.len()))]
    async fn write(
        &self,
        book: &BookDetail,
        chapters: &[Chapter],
        format: DocumentFormat,
    ) -> Result<PathBuf, SinkError> {
        if !self.supports(format) {
            return Err(SinkError::UnsupportedFormat(format.to_string()));
        }
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| SinkError::io(&self.output_dir, e))?;

        let stem = sanitize_file_stem(&book.title);
        let path = unique_path(&self.output_dir, &stem, format.extension()).await;
        let mut file = File::create(&path).await.map_err(|e| SinkError::io(&path, e))?;

        if let Err(error) = write_document(&mut file, book, chapters, &path).await {
            drop(file);
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %cleanup, "failed to remove partial document");
            }
            return Err(error);
        }

        info!(path = %path.display(), "document written");
        Ok(path)
    }
}

async fn write_document(
    file: &mut File,
    book: &BookDetail,
    chapters: &[Chapter],
    path: &Path,
) -> Result<(), SinkError> {
    let mut writer = BufWriter::new(file);

    put(&mut writer, &header(book), path).await?;
    for chapter in chapters {
        put(&mut writer, &format!("\n\n{}\n\n", chapter.title), path).await?;
        put(&mut writer, chapter.content.trim(), path).await?;
    }
    put(&mut writer, "\n", path).await?;

    writer.flush().await.map_err(|e| SinkError::io(path, e))?;
    debug!(chapters = chapters.len(), "chapters flushed");
    Ok(())
}

async fn put(writer: &mut BufWriter<&mut File>, text: &str, path: &Path) -> Result<(), SinkError> {
    writer.write_all(text.as_bytes()).await.map_err(|e| SinkError::io(path, e))
}

fn header(book: &BookDetail) -> String {
    let mut lines = vec![book.title.clone()];
    if let Some(author) = &book.author {
        lines.push(format!("Author: {author}"));
    }
    if let Some(category) = &book.category {
        lines.push(format!("Category: {category}"));
    }
    if let Some(status) = &book.status {
        lines.push(format!("Status: {status}"));
    }
    lines.push(format!("Source: {}", book.url));
    if let Some(intro) = book.intro.as_deref().map(str::trim).filter(|i| !i.is_empty()) {
        lines.push(String::new());
        lines.push(intro.to_string());
    }
    lines.push(String::new());
    lines.push(SEPARATOR.to_string());
    lines.join("\n")
}

/// A file stem safe on common filesystems: path separators, reserved
/// punctuation and control characters become `_`, runs of `_` collapse,
/// and the result is capped at 80 characters. Falls back to `book`.
#[must_use]
pub fn sanitize_file_stem(title: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in title.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    let stem: String = out.trim_matches(|c| c == '_' || c == '.').chars().take(MAX_STEM_CHARS).collect();
    if stem.is_empty() { "book".to_string() } else { stem }
}

/// `stem.ext`, then `stem_2.ext`, `stem_3.ext`, ... for the first free name.
async fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let base = dir.join(format!("{stem}.{extension}"));
    if !exists(&base).await {
        return base;
    }
    for suffix in 2..MAX_DUPLICATE_SUFFIX {
        let candidate = dir.join(format!("{stem}_{suffix}.{extension}"));
        if !exists(&candidate).await {
            return candidate;
        }
    }
    base
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
