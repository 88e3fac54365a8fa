//! Poliqarp client library
//!
//! Async client for poliqarpd, the Poliqarp corpus query server. The crate
//! is organised in layers:
//!
//! - `ipc` - line framing and the connector demultiplexing replies from
//!   asynchronous milestones
//! - `client` - session lifecycle, query jobs, pagination, excerpt decoding
//! - `models` - query results, excerpts, segments and their readings
//! - `config` - session options and connection settings
//!
//! # Example
//!
//! ```ignore
//! use poliqarp::{Client, ClientSettings, FindOptions};
//!
//! let mut client = Client::connect(ClientSettings::from_env()).await?;
//! client.open_corpus("/corpora/sample").await?;
//! println!("{} results", client.count("kot").await?);
//! let page = client.find("kot", &FindOptions::page(10, 1)).await?;
//! client.close().await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod ipc;
mod job;
pub mod models;

pub use client::{page_span, Client, CorpusPath, SessionState};
pub use config::{ClientSettings, Config, ContextWidth, Group, GroupFlags};
pub use error::{PoliqarpError, Result};
pub use models::{
    CorpusStats, Excerpt, FindOptions, Lemmata, LongContext, Metadata, QueryResult, Segment,
    Tagset,
};
