//! Sentence-aware chunking of documents into indexable text units

use text_splitter::{ChunkConfig, TextSplitter};

use crate::config::ChunkingConfig;
use crate::{Error, Result};

/// A bounded slice of a document's text, the atomic unit of indexing
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Stable id: `<document_id>:<position>`
    pub chunk_id: String,

    /// Identity hash of the owning document
    pub document_id: String,

    /// The text content of this chunk
    pub text: String,

    /// Ordinal within the document
    pub position: usize,
}

/// Splits text at natural boundaries within a character budget
pub struct SentenceChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl SentenceChunker {
    /// Create a chunker from the chunking configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the overlap does not fit the chunk size.
    pub fn new(config: &ChunkingConfig) -> Result<Self> {
        if config.chunk_overlap >= config.chunk_size {
            return Err(Error::Config(
                "chunk_overlap must be smaller than chunk_size".to_string(),
            ));
        }
        Ok(Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        })
    }

    /// Split one document into ordered chunks
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the splitter rejects the size/overlap pair.
    pub fn chunk_document(&self, document_id: &str, text: &str) -> Result<Vec<Chunk>> {
        let config = ChunkConfig::new(self.chunk_size)
            .with_overlap(self.chunk_overlap)
            .map_err(|e| Error::Config(format!("invalid chunking parameters: {e}")))?;
        let splitter = TextSplitter::new(config);

        Ok(splitter
            .chunks(text)
            .enumerate()
            .map(|(position, chunk)| Chunk {
                chunk_id: format!("{document_id}:{position}"),
                document_id: document_id.to_string(),
                text: chunk.to_string(),
                position,
            })
            .collect())
    }
}
