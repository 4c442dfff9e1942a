//! # docchat
//!
//! Chat with your documents: upload a file, have it indexed, then ask
//! natural-language questions over a WebSocket connection. Answers are
//! generated by an LLM grounded in passages retrieved from a TF-IDF index
//! built per document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────┐   ┌───────────────┐
//! │  Upload  │──▶│  Ingestion pipeline  │──▶│  TF-IDF index │
//! │  (HTTP)  │   │ extract·chunk·index  │   │  (per doc)    │
//! └──────────┘   └──────────────────────┘   └──────┬────────┘
//!                                                  │
//!                 ┌────────────┐   ┌───────────┐   │
//!      client ◀──▶│  Session   │──▶│ Retrieval │◀──┘
//!      (WS)       │  protocol  │   └───────────┘
//!                 │            │──▶ Generation (LLM)
//!                 └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docchat init                      # create database
//! docchat token --user alice       # mint a bearer token
//! docchat ingest notes.pdf --user alice
//! docchat search "deployment" --user alice
//! docchat serve                     # start the HTTP/WebSocket server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Domain error taxonomy |
//! | [`auth`] | Bearer token issuance and validation |
//! | [`extract`] | Document text extraction |
//! | [`chunk`] | Layered-separator chunking with overlap |
//! | [`index`] | TF-IDF index: build, search, persistence |
//! | [`ingest`] | Ingestion pipeline and background worker |
//! | [`retrieval`] | Scope resolution and similarity search |
//! | [`generate`] | Grounded answer generation |
//! | [`session`] | Per-connection protocol state machine |
//! | [`server`] | HTTP/WebSocket server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod auth;
pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod generate;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod retrieval;
pub mod server;
pub mod session;
