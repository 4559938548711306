use std::time::Duration;

/// Default SQLite database holding the record store and suggestion counters
pub const DEFAULT_DB_PATH: &str = "zgjedhjet.db";

/// Default OpenSearch endpoint
pub const DEFAULT_OPENSEARCH_URL: &str = "http://localhost:9200";

/// Name of the search index mirroring the record store
pub const INDEX_NAME: &str = "zgjedhjet";

/// Name of the custom analyzer applied to the municipality field
pub const MUNICIPALITY_ANALYZER: &str = "custom_analyzer";

/// Cache hash holding per-municipality suggestion counters
pub const SUGGESTIONS_KEY: &str = "suggestions";

/// Documents fetched per suggestion query
pub const SUGGEST_PAGE_SIZE: usize = 10;

/// Default number of entries returned by the stats ranking
pub const DEFAULT_TOP_K: usize = 5;

/// Documents per bulk request during index sync
pub const BULK_CHUNK_SIZE: usize = 1000;

/// Upper bound for a single record store operation (includes the replace transaction)
pub const STORE_TIMEOUT_SECS: u64 = 120;

/// Upper bound for a single search index request
pub const SEARCH_TIMEOUT_SECS: u64 = 30;

/// Upper bound for a single cache operation
pub const CACHE_TIMEOUT_SECS: u64 = 5;

/// Runtime knobs shared by the services. Defaults come from the constants above.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub index_name: String,
    pub suggestions_key: String,
    pub suggest_page_size: usize,
    pub bulk_chunk_size: usize,
    pub store_timeout: Duration,
    pub search_timeout: Duration,
    pub cache_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            index_name: INDEX_NAME.to_string(),
            suggestions_key: SUGGESTIONS_KEY.to_string(),
            suggest_page_size: SUGGEST_PAGE_SIZE,
            bulk_chunk_size: BULK_CHUNK_SIZE,
            store_timeout: Duration::from_secs(STORE_TIMEOUT_SECS),
            search_timeout: Duration::from_secs(SEARCH_TIMEOUT_SECS),
            cache_timeout: Duration::from_secs(CACHE_TIMEOUT_SECS),
        }
    }
}

impl ServiceConfig {
    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = index_name.into();
        self
    }
}
