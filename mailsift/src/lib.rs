//! mailsift - incremental semantic index of a remote mailbox
//!
//! Keeps a local metadata store and a vector index consistent with one
//! remote mailbox, syncing only what is new since the last watermark.
//!
//! ## Module Organization
//!
//! - `services/`: Sync engine, semantic search and read-side operations
//! - `state/`: State directory, shared index handle and sync lock
//! - `index/`: Vector index, slot mapping and persistence
//! - `adapters/`: SQLite store, IMAP client and Ollama embedder
//! - `backend/`: Mail retrieval seam
//! - `embedding/`: Embedding strategies
//! - `config/`: Configuration management
//! - `types/`: Data structures shared across modules

pub mod adapters;
pub mod backend;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod logging;
pub mod services;
pub mod state;
pub mod types;

pub use error::MailsiftError;
