use crate::aggregate::party_totals;
use crate::config::ServiceConfig;
use crate::error::{bounded, ElectionError};
use crate::models::{AggregatedResponse, ResultFilter};
use crate::ranker::SuggestionRanker;
use crate::search::{index_settings, BulkSummary, IndexField, IndexQuery, SearchError, SearchIndex};
use crate::store::RecordStore;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Failed bulk items quoted in the sync error.
const MAX_REPORTED_FAILURES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub message: String,
    pub indexed: usize,
    /// Documents left over from a larger previous dataset.
    pub removed: u64,
}

/// Keeps the search index in step with the record store and serves the
/// index-backed queries.
pub struct IndexSynchronizer {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SearchIndex>,
    ranker: Arc<SuggestionRanker>,
    config: ServiceConfig,
}

impl IndexSynchronizer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<dyn SearchIndex>,
        ranker: Arc<SuggestionRanker>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            index,
            ranker,
            config,
        }
    }

    /// Create the index with its analyzer and mappings unless it already exists.
    pub async fn ensure_index(&self) -> Result<(), ElectionError> {
        let limit = self.config.search_timeout;
        if bounded("search index exists", limit, self.index.index_exists()).await? {
            return Ok(());
        }

        let created = bounded(
            "search index create",
            limit,
            self.index.create_index(&index_settings()),
        )
        .await;
        match created {
            Ok(()) => Ok(()),
            // A concurrent sync may have created it in between
            Err(e) => {
                if bounded("search index exists", limit, self.index.index_exists()).await? {
                    debug!(index = %self.config.index_name, "Index created concurrently");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Make the index hold exactly the record-store rows, keyed by row id.
    ///
    /// Rows are sent in chunks, then documents with ids beyond the highest
    /// stored row are deleted. Row ids restart at 1 on every replace, so this
    /// leaves no document from an earlier dataset. Any failed item fails the
    /// sync with the backend's error detail and skips the cleanup. Running it
    /// twice without an import in between leaves the same documents.
    pub async fn sync_index(&self) -> Result<SyncReport, ElectionError> {
        self.ensure_index().await?;

        let rows = bounded(
            "record store snapshot",
            self.config.store_timeout,
            self.store.snapshot(),
        )
        .await?;

        let mut summary = BulkSummary::default();
        for chunk in rows.chunks(self.config.bulk_chunk_size.max(1)) {
            let part = bounded(
                "search index bulk",
                self.config.search_timeout,
                self.index.bulk_index(chunk),
            )
            .await?;
            summary.merge(part);
        }

        if summary.failed > 0 {
            error!(
                index = %self.config.index_name,
                failed = summary.failed,
                total = summary.total,
                errors = ?summary.errors,
                "Bulk indexing reported failures"
            );
            let detail: Vec<&str> = summary
                .errors
                .iter()
                .take(MAX_REPORTED_FAILURES)
                .map(String::as_str)
                .collect();
            return Err(SearchError::bulk_index(format!(
                "{} of {} documents failed: {}",
                summary.failed,
                summary.total,
                detail.join("; ")
            ))
            .into());
        }

        let max_id = rows.iter().map(|r| r.id).max().unwrap_or(0);
        let removed = bounded(
            "search index cleanup",
            self.config.search_timeout,
            self.index.delete_above(max_id),
        )
        .await?;

        info!(
            index = %self.config.index_name,
            indexed = summary.succeeded,
            removed,
            "Search index synchronized"
        );
        Ok(SyncReport {
            message: format!("Imported {} records successfully", summary.succeeded),
            indexed: summary.succeeded,
            removed,
        })
    }

    /// Index-backed aggregation. Filters become exact term matches and no
    /// existence check is made, so unknown values simply match nothing.
    pub async fn search(&self, filter: ResultFilter) -> Result<AggregatedResponse, ElectionError> {
        let filter = filter.normalized();
        let query = IndexQuery::from_filter(&filter);
        let sums = bounded(
            "search index query",
            self.config.search_timeout,
            self.index.sum_votes(&query),
        )
        .await?;
        debug!(matched = sums.matched, ?filter, "Summed index votes");

        Ok(AggregatedResponse {
            results: party_totals(&sums.totals, filter.party),
        })
    }

    /// Municipality names whose analyzed form starts with `prefix`, distinct
    /// and in hit order. Each returned name counts as one suggestion hit.
    pub async fn suggest(&self, prefix: &str) -> Result<Vec<String>, ElectionError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(ElectionError::validation("Query parameter is required"));
        }

        let query = IndexQuery::phrase_prefix(
            IndexField::Municipality,
            prefix,
            self.config.suggest_page_size,
        );
        let hits = bounded(
            "search index query",
            self.config.search_timeout,
            self.index.search(&query),
        )
        .await?;

        let mut seen = FxHashSet::default();
        let names: Vec<String> = hits
            .records
            .iter()
            .map(|r| r.municipality.as_str())
            .filter(|name| seen.insert(*name))
            .map(str::to_string)
            .collect();

        self.ranker.record_hits(&names).await?;
        debug!(prefix, suggestions = names.len(), "Suggested municipalities");
        Ok(names)
    }
}
