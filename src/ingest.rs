//! Ingestion pipeline: text files → chunks → embeddings → vector index.
//!
//! Files in the source directory are processed one at a time, in name
//! order. Within a file, chunk texts are embedded in batches and the
//! resulting records are upserted in batches with a bounded number of
//! requests in flight:
//!
//! ```text
//! data/*.txt ─▶ RecursiveSplitter ─▶ Embedder (batch_size) ─▶ VectorStore::upsert
//!                                                            (upsert_batch_size,
//!                                                             ≤ max_concurrency in flight)
//! ```
//!
//! The first failure aborts the run. Files already written stay written;
//! re-running is safe because chunk ids are deterministic and upserts
//! overwrite.

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::chunk::RecursiveSplitter;
use crate::config::{Config, Credentials};
use crate::embedding::{Embedder, OpenAIEmbedder};
use crate::models::{Chunk, VectorRecord};
use crate::vector_store::{PineconeStore, VectorStore};

/// Totals for one ingestion run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub files: usize,
    pub chunks: usize,
    pub vectors: usize,
}

/// Ingest every eligible file in `config.ingest.source_dir`.
pub async fn ingest_dir(
    config: &Config,
    embedder: &dyn Embedder,
    store: &dyn VectorStore,
) -> Result<IngestReport> {
    let files = list_source_files(&config.ingest.source_dir, &config.ingest.extension)?;
    let mut report = IngestReport::default();

    if files.is_empty() {
        println!("No .{} files found in {}", config.ingest.extension, config.ingest.source_dir.display());
        return Ok(report);
    }

    tracing::info!(files = files.len(), model = embedder.model_name(), "ingesting");
    let splitter = RecursiveSplitter::from_config(&config.chunking);

    for path in &files {
        let (chunks, vectors) = ingest_file(config, &splitter, embedder, store, path)
            .await
            .with_context(|| format!("Failed to ingest {}", path.display()))?;
        report.files += 1;
        report.chunks += chunks;
        report.vectors += vectors;
    }

    Ok(report)
}

/// Ingest with the OpenAI embedder and the Pinecone index, printing a
/// per-file summary.
pub async fn run_ingest(config: &Config, credentials: &Credentials) -> Result<()> {
    let embedder = OpenAIEmbedder::new(&config.embedding, credentials)?;
    let store = PineconeStore::new(&config.vector_store, credentials)?;

    println!("ingest {}", config.ingest.source_dir.display());
    println!("  embedding model: {}", embedder.model_name());
    let report = ingest_dir(config, &embedder, &store).await?;
    println!("  files: {}", report.files);
    println!("  chunks: {}", report.chunks);
    println!("  vectors upserted: {}", report.vectors);
    println!("ok");
    Ok(())
}

/// Regular files directly under `dir` with the given extension, sorted by path.
pub fn list_source_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("Source directory does not exist: {}", dir.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry =
            entry.with_context(|| format!("Failed to read source directory {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == extension)
            .unwrap_or(false);
        if matches {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

async fn ingest_file(
    config: &Config,
    splitter: &RecursiveSplitter,
    embedder: &dyn Embedder,
    store: &dyn VectorStore,
    path: &Path,
) -> Result<(usize, usize)> {
    let text = std::fs::read_to_string(path)?;
    let source = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    if text.trim().is_empty() {
        tracing::info!(file = %source, "skipping blank file");
        println!("  {}: empty, skipped", source);
        return Ok((0, 0));
    }

    let chunks: Vec<Chunk> = splitter
        .chunk_document(&source, &text)
        .filter(|c| !c.text.trim().is_empty())
        .collect();

    let records = embed_chunks(embedder, chunks, config.embedding.batch_size).await?;
    let chunk_count = records.len();

    let written = upsert_bounded(
        store,
        &records,
        config.ingest.upsert_batch_size,
        config.ingest.max_concurrency,
    )
    .await?;

    tracing::info!(file = %source, chunks = chunk_count, vectors = written, "ingested file");
    println!("  {}: {} chunks, {} vectors", source, chunk_count, written);
    Ok((chunk_count, written))
}

async fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: Vec<Chunk>,
    batch_size: usize,
) -> Result<Vec<VectorRecord>> {
    let mut records = Vec::with_capacity(chunks.len());
    let mut pending = chunks.into_iter().peekable();

    while pending.peek().is_some() {
        let batch: Vec<Chunk> = pending.by_ref().take(batch_size.max(1)).collect();
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed_texts(&texts).await?;
        if vectors.len() != batch.len() {
            bail!(
                "{} returned {} embeddings for {} chunks",
                embedder.model_name(),
                vectors.len(),
                batch.len()
            );
        }
        records.extend(
            batch
                .into_iter()
                .zip(vectors)
                .map(|(chunk, values)| VectorRecord::new(chunk, values)),
        );
    }

    Ok(records)
}

/// Upsert `records` in batches, keeping at most `max_in_flight` requests
/// outstanding. Returns the total count the store reports written.
async fn upsert_bounded(
    store: &dyn VectorStore,
    records: &[VectorRecord],
    batch_size: usize,
    max_in_flight: usize,
) -> Result<usize> {
    let counts: Vec<usize> = stream::iter(records.chunks(batch_size.max(1)))
        .map(|batch| store.upsert(batch))
        .buffer_unordered(max_in_flight.max(1))
        .try_collect()
        .await?;
    Ok(counts.into_iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RetrievedChunk;
    use crate::vector_store::InMemoryVectorStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Counts calls; vectors derive from text length.
    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
        largest_batch: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.largest_batch.fetch_max(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    /// Tracks how many upserts overlap.
    #[derive(Default)]
    struct SlowStore {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        written: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for SlowStore {
        async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.written.fetch_add(records.len(), Ordering::SeqCst);
            Ok(records.len())
        }

        async fn query(&self, _vector: &[f32], _top_k: usize) -> Result<Vec<RetrievedChunk>> {
            Ok(Vec::new())
        }
    }

    struct RejectingStore;

    #[async_trait]
    impl VectorStore for RejectingStore {
        async fn upsert(&self, _records: &[VectorRecord]) -> Result<usize> {
            anyhow::bail!("Pinecone API error 401 Unauthorized")
        }

        async fn query(&self, _vector: &[f32], _top_k: usize) -> Result<Vec<RetrievedChunk>> {
            Ok(Vec::new())
        }
    }

    fn config_for(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.ingest.source_dir = dir.path().to_path_buf();
        config
    }

    fn write(dir: &TempDir, name: &str, text: &str) {
        std::fs::write(dir.path().join(name), text).unwrap();
    }

    fn long_text(paragraphs: usize) -> String {
        (0..paragraphs)
            .map(|i| format!("Paragraph {} describes one more impossible mission in some detail.", i))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[tokio::test]
    async fn test_no_files_makes_no_calls() {
        let dir = TempDir::new().unwrap();
        write(&dir, "notes.md", "not a text file");
        let embedder = CountingEmbedder::default();
        let store = SlowStore::default();

        let report = ingest_dir(&config_for(&dir), &embedder, &store).await.unwrap();

        assert_eq!(report, IngestReport::default());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ingests_only_top_level_txt() {
        let dir = TempDir::new().unwrap();
        write(&dir, "b.txt", "Second file.");
        write(&dir, "a.txt", "First file.");
        write(&dir, "blank.txt", "   \n\n ");
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write(&dir, "nested/c.txt", "Not scanned.");

        let store = InMemoryVectorStore::new();
        let report = ingest_dir(&config_for(&dir), &CountingEmbedder::default(), &store)
            .await
            .unwrap();

        assert_eq!(report.files, 3);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.vectors, 2);
        let sources: Vec<String> = store.records().iter().map(|r| r.metadata.source.clone()).collect();
        assert_eq!(sources, vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_upserts_respect_concurrency_bound() {
        let dir = TempDir::new().unwrap();
        write(&dir, "long.txt", &long_text(60));

        let mut config = config_for(&dir);
        config.chunking.chunk_size = 80;
        config.chunking.chunk_overlap = 0;
        config.ingest.upsert_batch_size = 2;
        config.ingest.max_concurrency = 3;
        config.embedding.batch_size = 7;

        let embedder = CountingEmbedder::default();
        let store = Arc::new(SlowStore::default());
        let report = ingest_dir(&config, &embedder, store.as_ref()).await.unwrap();

        assert!(report.chunks >= 60);
        assert_eq!(report.vectors, report.chunks);
        assert_eq!(store.written.load(Ordering::SeqCst), report.chunks);
        assert_eq!(store.calls.load(Ordering::SeqCst), report.chunks.div_ceil(2));
        let peak = store.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in-flight upserts was {}", peak);
        assert!(peak > 1, "upserts never overlapped");
        assert!(embedder.largest_batch.load(Ordering::SeqCst) <= 7);
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write(&dir, "mission.txt", &long_text(10));
        let config = config_for(&dir);
        let store = InMemoryVectorStore::new();

        let first = ingest_dir(&config, &CountingEmbedder::default(), &store).await.unwrap();
        let second = ingest_dir(&config, &CountingEmbedder::default(), &store).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), first.chunks);
    }

    /// Drops the last vector of every batch.
    struct ShortEmbedder;

    #[async_trait]
    impl Embedder for ShortEmbedder {
        fn model_name(&self) -> &str {
            "short"
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().skip(1).map(|_| vec![1.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_embedding_count_mismatch_aborts() {
        let dir = TempDir::new().unwrap();
        write(&dir, "mission.txt", &long_text(10));
        let mut config = config_for(&dir);
        config.chunking.chunk_size = 80;
        config.chunking.chunk_overlap = 0;
        let store = InMemoryVectorStore::new();

        let err = ingest_dir(&config, &ShortEmbedder, &store).await.unwrap_err();

        let message = format!("{:#}", err);
        assert!(message.contains("mission.txt"), "{}", message);
        assert!(message.contains("embeddings for"), "{}", message);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_names_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "mission.txt", "Your mission, should you choose to accept it.");

        let err = ingest_dir(&config_for(&dir), &CountingEmbedder::default(), &RejectingStore)
            .await
            .unwrap_err();

        let message = format!("{:#}", err);
        assert!(message.contains("mission.txt"), "{}", message);
        assert!(message.contains("401"), "{}", message);
    }

    #[test]
    fn test_missing_source_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(list_source_files(&dir.path().join("absent"), "txt").is_err());
    }
}
