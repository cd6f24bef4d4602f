//! # RAG Chat
//!
//! Retrieval-augmented chat over a directory of plain-text documents.
//!
//! Two pipelines share one vector index:
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌───────────────┐
//! │ data/*.txt│──▶│  Chunker  │──▶│ Embedder │──▶│ Vector index  │
//! └──────────┘   └───────────┘   └──────────┘   └──────┬────────┘
//!                                                      │ top-k
//! ┌──────────┐   ┌───────────┐   ┌──────────┐          │
//! │ Chat UI  │──▶│  Rewrite  │──▶│ Retrieve │◀─────────┘
//! │ /api/... │◀──│  Generate │◀──│          │
//! └──────────┘   └───────────┘   └──────────┘
//! ```
//!
//! Ingestion is an offline batch job (`rag ingest`); the query pipeline
//! runs per HTTP request (`rag serve`) and only reads the index.
//!
//! ## Quick Start
//!
//! ```bash
//! export OPENAI_API_KEY=... PINECONE_API_KEY=... PINECONE_INDEX=...
//! rag ingest                  # chunk, embed and upsert ./data/*.txt
//! rag serve                   # chat UI on http://127.0.0.1:3000
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and credentials |
//! | [`models`] | Core data types |
//! | [`chunk`] | Recursive character text splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Vector index abstraction (Pinecone, in-memory) |
//! | [`llm`] | Chat-completion abstraction |
//! | [`streaming`] | Fragment streams and SSE decoding |
//! | [`ingest`] | Ingestion pipeline |
//! | [`pipeline`] | History-aware query pipeline |
//! | [`server`] | HTTP server and chat UI |

pub mod chunk;
pub mod config;
pub mod embedding;
mod http;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod streaming;
pub mod vector_store;
