//! Zgjedhjet: election results ingestion, aggregation and search
//!
//! This crate loads polling-station vote counts from CSV into a transactional
//! record store, reports per-party totals, mirrors the dataset into OpenSearch
//! and tracks which municipality suggestions users see most:
//!
//! 1. **Import** -- Parse the CSV row by row, collect bad rows by line number,
//!    and replace the whole dataset in one transaction
//! 2. **Aggregate** -- Sum votes per party over the record store, with
//!    category, municipality, polling center/place and party filters
//! 3. **Index sync** -- Create the search index with a diacritic-folding
//!    analyzer when missing, bulk-index every stored row by row id and drop
//!    documents left over from a larger dataset
//! 4. **Search / Suggest** -- The same aggregation served from the index, and
//!    prefix suggestions over municipality names
//! 5. **Stats** -- Top-K municipalities by suggestion count
//!
//! # Architecture
//!
//! Services talk to three collaborators through `async_trait` interfaces, so
//! each can be swapped for an in-memory double in tests:
//!
//! - [`store::RecordStore`] -- SQLite in [`sqlite::SqliteStore`]
//! - [`search::SearchIndex`] -- [`opensearch::OpenSearchIndex`] or [`search::MemoryIndex`]
//! - [`cache::SuggestionCache`] -- [`sqlite::SqliteCache`] or [`cache::MemoryCache`]
//!
//! The record store is the system of record. The index can serve stale data
//! until the next sync; nothing orders an import against a resync.
//!
//! # Key Modules
//!
//! - [`parser`] -- Header-mapped row parsing with per-row errors
//! - [`import`] -- Upload validation, streaming parse, atomic replace
//! - [`aggregate`] -- Store-backed totals and the shared tally
//! - [`index`] -- Index creation, resync, search and suggest
//! - [`ranker`] -- Suggestion counters and top-K ranking
//! - [`models`] -- Closed enums, records, filters and response shapes
//! - [`error`] -- Service error taxonomy and timeout wrapper
//! - [`config`] -- Defaults, page sizes, timeouts
//!
//! # Example Usage
//!
//! ```bash
//! zgjedhjet import -i results.csv
//! zgjedhjet results --kategoria Local --partia Partia111
//! zgjedhjet index-sync
//! zgjedhjet suggest -q pri
//! zgjedhjet stats --top 5
//! ```

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod import;
pub mod index;
pub mod models;
pub mod opensearch;
pub mod parser;
pub mod ranker;
pub mod search;
pub mod sqlite;
pub mod store;
