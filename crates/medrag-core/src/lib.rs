//! # medrag core
//!
//! Runtime-agnostic logic for the medical RAG pipeline: data models,
//! chunking strategies, the vector index abstraction, the retrieval
//! algorithm, and embedding vector utilities.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. Model
//! runtimes, generation, and persistence live in the `medical-rag` app
//! crate, which hands vectors and documents to the types defined here.

pub mod chunk;
pub mod embedding;
pub mod index;
pub mod models;
pub mod retrieval;
