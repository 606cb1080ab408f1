#![forbid(unsafe_code)]

//! Tastemakers video catalogue.
//!
//! `catalog` owns the SQLite store; the other modules add operations to it.
//! `ingest` is the only place that talks to the video API on behalf of the
//! store.

pub mod catalog;
pub mod comments;
pub mod config;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod ranking;
pub mod tags;
pub mod users;
pub mod votes;
pub mod youtube;

pub use catalog::Catalog;
pub use error::{CatalogError, CatalogResult};
