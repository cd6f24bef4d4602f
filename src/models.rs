//! Core data models shared by the ingestion and query pipelines.
//!
//! Ingestion produces [`Chunk`]s and turns them into [`VectorRecord`]s;
//! the query path reads [`RetrievedChunk`]s back and converses in
//! [`ChatMessage`]s.

use serde::{Deserialize, Serialize};

/// Where a chunk came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Source file name (e.g. `"mission.txt"`).
    pub source: String,
    /// Ordinal position within the source, starting at 0.
    pub chunk_index: u32,
    /// Byte offset of the chunk's first character in the source text.
    pub start: usize,
    /// Byte offset one past the chunk's last character.
    pub end: usize,
}

/// A contiguous, immutable slice of a source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// A record as written to the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl VectorRecord {
    pub fn new(chunk: Chunk, values: Vec<f32>) -> Self {
        Self {
            id: chunk.id,
            values,
            text: chunk.text,
            metadata: chunk.metadata,
        }
    }
}

/// A chunk returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub source: Option<String>,
    pub chunk_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
