//! Document loader: filesystem walk, ignore patterns, CSV expansion and
//! archive virtual paths
//!
//! Files inside archives are addressed with a virtual path of the form
//! `<archive>!/<internal>`, which becomes the document's identity path.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use glob::Pattern;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{Error, Result};

/// A normalized input document
#[derive(Debug, Clone)]
pub struct Document {
    /// Physical path, or `<archive>!/<internal>` for archive members
    pub source_path: String,

    /// Full text content
    pub text: String,

    /// String-valued metadata (file name, row index, archive origin, ...)
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    fn new(source_path: impl Into<String>, text: impl Into<String>) -> Self {
        let source_path = source_path.into();
        let mut metadata = BTreeMap::new();
        if let Some(name) = Path::new(&source_path).file_name() {
            metadata.insert("file_name".to_string(), name.to_string_lossy().to_string());
        }
        Self {
            source_path,
            text: text.into(),
            metadata,
        }
    }

    /// Identity hash over `(text, source_path)`
    ///
    /// Altering either field changes the hash; this is the dedup key for the
    /// whole pipeline.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        hasher.update(b":");
        hasher.update(self.source_path.as_bytes());
        hex_digest(&hasher.finalize())
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").ok();
    }
    out
}

/// Plain-text extensions read directly as UTF-8
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "rst", "html", "htm", "xml", "json", "tsv",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    TarBz2,
}

fn archive_kind(file_name: &str) -> Option<ArchiveKind> {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if lower.ends_with(".tar.bz2") {
        Some(ArchiveKind::TarBz2)
    } else if lower.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    }
}

fn is_csv(file_name: &str) -> bool {
    file_name.to_lowercase().ends_with(".csv")
}

fn is_text(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    TEXT_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")))
}

/// Walks a root directory and emits normalized documents
pub struct DocumentLoader {
    patterns: Vec<Pattern>,
}

impl DocumentLoader {
    /// Compile the ignore pattern list
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid glob pattern.
    pub fn new(ignore_patterns: &[String]) -> Result<Self> {
        let patterns = ignore_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| Error::Config(format!("bad ignore pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whether a path is excluded by the ignore patterns
    ///
    /// Patterns are matched against the full (slash-normalized) path and the
    /// basename.
    #[must_use]
    pub fn should_ignore(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let normalized = path.replace('\\', "/");
        let basename = normalized.rsplit('/').next().unwrap_or(&normalized);
        self.patterns
            .iter()
            .any(|p| p.matches(&normalized) || p.matches(basename))
    }

    /// Enumerate and load every recognized document under `input_dir`
    ///
    /// Regular files are classified by extension; archives are expanded
    /// through a virtual filesystem. Unrecognized extensions are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Archive` when an archive cannot be opened or one of
    /// its members cannot be read, and `Error::Io` on filesystem failures
    /// outside archives.
    pub fn load_dir(&self, input_dir: &Path) -> Result<Vec<Document>> {
        let mut documents = Vec::new();

        for entry in WalkDir::new(input_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let display_path = path.to_string_lossy().to_string();
            if self.should_ignore(&display_path) {
                debug!(path = %display_path, "ignored by pattern");
                continue;
            }

            let file_name = entry.file_name().to_string_lossy().to_string();
            let rel = path
                .strip_prefix(input_dir)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");

            if let Some(kind) = archive_kind(&file_name) {
                documents.extend(self.load_archive(path, &rel, kind)?);
            } else if is_csv(&file_name) {
                documents.extend(load_csv_file(path)?);
            } else if is_text(&file_name) {
                let text = std::fs::read(path)?;
                documents.push(Document::new(
                    display_path,
                    String::from_utf8_lossy(&text).to_string(),
                ));
            } else {
                debug!(path = %display_path, "unrecognized extension, skipped");
            }
        }

        info!(
            count = documents.len(),
            dir = %input_dir.display(),
            "loaded documents"
        );
        Ok(documents)
    }

    fn load_archive(
        &self,
        archive_path: &Path,
        archive_rel: &str,
        kind: ArchiveKind,
    ) -> Result<Vec<Document>> {
        let result = match kind {
            ArchiveKind::Zip => self.load_zip(archive_path, archive_rel),
            ArchiveKind::Tar => {
                let file = open_archive(archive_path)?;
                self.load_tar(tar::Archive::new(file), archive_rel)
            }
            ArchiveKind::TarGz => {
                let file = open_archive(archive_path)?;
                self.load_tar(tar::Archive::new(flate2::read::GzDecoder::new(file)), archive_rel)
            }
            ArchiveKind::TarBz2 => {
                let file = open_archive(archive_path)?;
                self.load_tar(tar::Archive::new(bzip2::read::BzDecoder::new(file)), archive_rel)
            }
        };
        match &result {
            Ok(docs) => info!(archive = archive_rel, count = docs.len(), "expanded archive"),
            Err(e) => debug!(archive = archive_rel, error = %e, "archive failed"),
        }
        result
    }

    fn load_zip(&self, archive_path: &Path, archive_rel: &str) -> Result<Vec<Document>> {
        let file = open_archive(archive_path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| Error::Archive(format!("cannot open zip '{archive_rel}': {e}")))?;

        let mut documents = Vec::new();
        for index in 0..archive.len() {
            let mut member = archive
                .by_index(index)
                .map_err(|e| Error::Archive(format!("cannot read zip member: {e}")))?;
            if member.is_dir() {
                continue;
            }
            let internal = member.name().to_string();
            let mut bytes = Vec::new();
            member
                .read_to_end(&mut bytes)
                .map_err(|e| Error::Archive(format!("cannot read '{internal}': {e}")))?;
            documents.extend(self.member_documents(archive_rel, &internal, &bytes)?);
        }
        Ok(documents)
    }

    fn load_tar<R: Read>(
        &self,
        mut archive: tar::Archive<R>,
        archive_rel: &str,
    ) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        let entries = archive
            .entries()
            .map_err(|e| Error::Archive(format!("cannot open tar '{archive_rel}': {e}")))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| Error::Archive(format!("cannot read tar member: {e}")))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let internal = entry
                .path()
                .map_err(|e| Error::Archive(format!("bad tar member path: {e}")))?
                .to_string_lossy()
                .to_string();
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| Error::Archive(format!("cannot read '{internal}': {e}")))?;
            documents.extend(self.member_documents(archive_rel, &internal, &bytes)?);
        }
        Ok(documents)
    }

    /// Classify and load one archive member; CSVs expand row-by-row like
    /// their on-disk counterparts
    fn member_documents(
        &self,
        archive_rel: &str,
        internal: &str,
        bytes: &[u8],
    ) -> Result<Vec<Document>> {
        let virtual_path = format!("{archive_rel}!/{internal}");
        if self.should_ignore(internal) || self.should_ignore(&virtual_path) {
            debug!(path = %virtual_path, "archive member ignored by pattern");
            return Ok(Vec::new());
        }

        let mut documents = if is_csv(internal) {
            expand_csv_rows(csv::Reader::from_reader(bytes), &virtual_path)
                .map_err(|e| Error::Archive(format!("bad csv '{virtual_path}': {e}")))?
        } else if is_text(internal) {
            vec![Document::new(
                virtual_path.clone(),
                String::from_utf8_lossy(bytes).to_string(),
            )]
        } else {
            debug!(path = %virtual_path, "unrecognized archive member, skipped");
            Vec::new()
        };

        for doc in &mut documents {
            doc.metadata
                .insert("source_archive".to_string(), archive_rel.to_string());
            doc.metadata
                .insert("archive_internal_path".to_string(), internal.to_string());
            doc.metadata
                .insert("virtual_path".to_string(), virtual_path.clone());
        }
        Ok(documents)
    }
}

fn open_archive(path: &Path) -> Result<File> {
    File::open(path)
        .map_err(|e| Error::Archive(format!("cannot open archive '{}': {e}", path.display())))
}

/// One document per CSV row, text `"col1: v1, col2: v2, ..."`
fn load_csv_file(path: &Path) -> Result<Vec<Document>> {
    let reader = csv::Reader::from_path(path)
        .map_err(|e| Error::Io(std::io::Error::other(format!("csv open failed: {e}"))))?;
    expand_csv_rows(reader, &path.to_string_lossy())
        .map_err(|e| Error::Io(std::io::Error::other(format!("csv read failed: {e}"))))
}

fn expand_csv_rows<R: Read>(
    mut reader: csv::Reader<R>,
    source_path: &str,
) -> std::result::Result<Vec<Document>, csv::Error> {
    let headers = reader.headers()?.clone();
    let mut documents = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record = record?;
        let text = headers
            .iter()
            .zip(record.iter())
            .map(|(col, val)| format!("{col}: {val}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut doc = Document::new(source_path.to_string(), text);
        doc.metadata
            .insert("row_index".to_string(), row_index.to_string());
        documents.push(doc);
    }
    Ok(documents)
}
