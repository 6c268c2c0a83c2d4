//! File Store
//!
//! Content-addressed storage of uploads plus parse dispatch by type.
//! Uploads land at `<upload_root>/kb_<id>/files/<hash>_<sanitized_name>`;
//! the BLAKE3 hash of the raw bytes dedupes re-uploads within a KB.

pub mod parser;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::database::models::{FileRecord, FileStatus};
use crate::database::{Database, FileOps, NewFile};

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("file too large: {size} bytes (limit {max})")]
    SizeExceeded { size: u64, max: u64 },

    #[error("invalid filename: {0}")]
    InvalidName(String),

    #[error("parse failure: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("file not found: {0}")]
    NotFound(i64),
}

pub type Result<T> = std::result::Result<T, FileStoreError>;

/// Supported document types, detected from the filename extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Txt,
    Md,
    Pdf,
    Docx,
    Html,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Txt => "txt",
            FileType::Md => "md",
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Html => "html",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag.to_lowercase().as_str() {
            "txt" => Ok(FileType::Txt),
            "md" | "markdown" => Ok(FileType::Md),
            "pdf" => Ok(FileType::Pdf),
            "docx" | "doc" => Ok(FileType::Docx),
            "html" | "htm" => Ok(FileType::Html),
            other => Err(FileStoreError::UnsupportedType(other.to_string())),
        }
    }

    /// Detect from a filename's extension.
    pub fn detect(filename: &str) -> Result<Self> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| FileStoreError::UnsupportedType(filename.to_string()))?;
        Self::from_tag(ext)
    }
}

/// Strip directory components, traversal sequences, and control characters
/// from an uploaded filename. An empty result is an `InvalidName` error.
pub fn sanitize_filename(filename: &str) -> Result<String> {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .replace("..", "")
        .trim()
        .to_string();

    if cleaned.is_empty() || cleaned == "." {
        return Err(FileStoreError::InvalidName(filename.to_string()));
    }
    Ok(cleaned)
}

/// Content-addressed upload storage for all knowledge bases.
#[derive(Clone)]
pub struct FileStore {
    upload_root: PathBuf,
    max_file_bytes: u64,
}

impl FileStore {
    pub fn new(upload_root: PathBuf, max_file_bytes: u64) -> Self {
        Self {
            upload_root,
            max_file_bytes,
        }
    }

    pub fn upload_root(&self) -> &Path {
        &self.upload_root
    }

    /// Directory of a KB's stored files.
    pub fn kb_dir(&self, kb_id: i64) -> PathBuf {
        self.upload_root.join(format!("kb_{}", kb_id))
    }

    /// Store uploaded bytes for a KB and insert the catalog row.
    ///
    /// Duplicate content (same `(kb_id, hash)`) silently returns the
    /// existing file; the bytes are not rewritten.
    pub async fn save(
        &self,
        catalog: &Database,
        kb_id: i64,
        filename: &str,
        bytes: &[u8],
    ) -> Result<FileRecord> {
        if bytes.len() as u64 > self.max_file_bytes {
            return Err(FileStoreError::SizeExceeded {
                size: bytes.len() as u64,
                max: self.max_file_bytes,
            });
        }

        let safe_name = sanitize_filename(filename)?;
        let file_type = FileType::detect(&safe_name)?;
        let hash = blake3::hash(bytes).to_hex().to_string();

        if let Some(existing) = catalog.get_file_by_hash(kb_id, &hash).await? {
            tracing::info!(
                kb_id,
                file_id = existing.id,
                filename = %safe_name,
                "duplicate upload, returning existing file"
            );
            return Ok(existing);
        }

        let files_dir = self.kb_dir(kb_id).join("files");
        std::fs::create_dir_all(&files_dir)?;

        let storage_path = files_dir.join(format!("{}_{}", hash, safe_name));
        std::fs::write(&storage_path, bytes)?;

        let record = catalog
            .insert_file(NewFile {
                kb_id,
                filename: &safe_name,
                file_type: file_type.as_str(),
                file_size: bytes.len() as i64,
                file_hash: &hash,
                storage_path: &storage_path.to_string_lossy(),
            })
            .await?;

        tracing::info!(kb_id, file_id = record.id, filename = %safe_name, "file stored");
        Ok(record)
    }

    /// Parse a stored file to text, transitioning its status
    /// `parsing -> parsed` (or `error` with the message on failure).
    pub async fn parse(&self, catalog: &Database, file: &FileRecord) -> Result<String> {
        catalog
            .update_file_status(file.id, FileStatus::Parsing, None)
            .await?;

        let file_type = FileType::from_tag(&file.file_type)?;
        match parser::parse_file(Path::new(&file.storage_path), file_type) {
            Ok(text) => {
                catalog
                    .update_file_status(file.id, FileStatus::Parsed, None)
                    .await?;
                Ok(text)
            }
            Err(e) => {
                catalog
                    .update_file_status(file.id, FileStatus::Error, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Remove a file's stored bytes. Missing bytes are a no-op; the catalog
    /// row and vectors are owned by the caller.
    pub fn remove_bytes(&self, file: &FileRecord) -> Result<()> {
        let path = Path::new(&file.storage_path);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Remove a KB's whole upload directory.
    pub fn remove_kb_dir(&self, kb_id: i64) -> Result<()> {
        let dir = self.kb_dir(kb_id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}
