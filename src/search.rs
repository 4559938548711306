//! Search index interface, typed queries and the in-memory backend.
//!
//! Queries are built as [`IndexQuery`] values rather than raw JSON so that the
//! same query can be rendered for OpenSearch or evaluated by [`MemoryIndex`].

use crate::config::MUNICIPALITY_ANALYZER;
use crate::models::{ElectionRecord, Party, ResultFilter, StoredRecord, PARTY_COUNT};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Index creation error: {0}")]
    IndexCreationError(String),

    #[error("Bulk index error: {0}")]
    BulkIndexError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    /// A response or stored document did not have the expected shape.
    #[error("Parse error: {0}")]
    ParseError(String),
}

impl SearchError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    pub fn index_creation(msg: impl Into<String>) -> Self {
        Self::IndexCreationError(msg.into())
    }

    pub fn bulk_index(msg: impl Into<String>) -> Self {
        Self::BulkIndexError(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::QueryError(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }
}

/// Document fields a query can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexField {
    /// `kategoria`, a keyword.
    Category,
    /// `komuna`, analyzed with the municipality analyzer.
    Municipality,
    MunicipalityKeyword,
    PollingCenterKeyword,
    PollingPlaceKeyword,
}

impl IndexField {
    pub fn path(&self) -> &'static str {
        match self {
            IndexField::Category => "kategoria",
            IndexField::Municipality => "komuna",
            IndexField::MunicipalityKeyword => "komuna.keyword",
            IndexField::PollingCenterKeyword => "qendra_e_votimit.keyword",
            IndexField::PollingPlaceKeyword => "vendvotimi.keyword",
        }
    }

    fn is_analyzed(&self) -> bool {
        matches!(self, IndexField::Municipality)
    }

    fn value_of<'r>(&self, record: &'r ElectionRecord) -> &'r str {
        match self {
            IndexField::Category => record.category.as_str(),
            IndexField::Municipality | IndexField::MunicipalityKeyword => {
                record.municipality.as_str()
            }
            IndexField::PollingCenterKeyword => &record.polling_center,
            IndexField::PollingPlaceKeyword => &record.polling_place,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexClause {
    /// Exact term match. On an analyzed field the term must equal one token.
    Term { field: IndexField, value: String },
    /// Phrase match where the last query token is a prefix.
    PhrasePrefix { field: IndexField, text: String },
}

/// A conjunction of clauses with a result size cap. No clauses matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    pub clauses: Vec<IndexClause>,
    pub size: usize,
}

impl IndexQuery {
    pub fn match_all(size: usize) -> Self {
        Self {
            clauses: Vec::new(),
            size,
        }
    }

    /// Term clauses on the exact-match fields for every filter that is set.
    /// The party filter selects output columns and never becomes a clause.
    /// No documents are requested; the query is meant for [`SearchIndex::sum_votes`].
    pub fn from_filter(filter: &ResultFilter) -> Self {
        let mut clauses = Vec::new();
        if let Some(category) = filter.category {
            clauses.push(IndexClause::Term {
                field: IndexField::Category,
                value: category.as_str().to_string(),
            });
        }
        if let Some(municipality) = filter.municipality {
            clauses.push(IndexClause::Term {
                field: IndexField::MunicipalityKeyword,
                value: municipality.as_str().to_string(),
            });
        }
        if let Some(ref center) = filter.polling_center {
            clauses.push(IndexClause::Term {
                field: IndexField::PollingCenterKeyword,
                value: center.clone(),
            });
        }
        if let Some(ref place) = filter.polling_place {
            clauses.push(IndexClause::Term {
                field: IndexField::PollingPlaceKeyword,
                value: place.clone(),
            });
        }
        Self { clauses, size: 0 }
    }

    pub fn phrase_prefix(field: IndexField, text: impl Into<String>, size: usize) -> Self {
        Self {
            clauses: vec![IndexClause::PhrasePrefix {
                field,
                text: text.into(),
            }],
            size,
        }
    }
}

/// Outcome of one bulk request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Backend error detail for each failed item.
    pub errors: Vec<String>,
}

impl BulkSummary {
    pub fn merge(&mut self, other: BulkSummary) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// Records returned by a search, plus the number of documents that matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHits {
    pub records: Vec<ElectionRecord>,
    pub total: u64,
}

/// Per-party vote sums over every matching document, indexed by [`Party::index`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteSums {
    pub matched: u64,
    pub totals: [u64; PARTY_COUNT],
}

impl Default for VoteSums {
    fn default() -> Self {
        Self {
            matched: 0,
            totals: [0; PARTY_COUNT],
        }
    }
}

impl VoteSums {
    pub fn add(&mut self, record: &ElectionRecord) {
        self.matched += 1;
        for (party, votes) in record.votes.iter() {
            self.totals[party.index()] += u64::from(votes);
        }
    }
}

/// Document field carrying the record store row id, used to drop stale documents.
pub const ROW_ID_FIELD: &str = "row_id";

/// Index settings and mappings in OpenSearch form.
///
/// `komuna` uses a standard tokenizer with lowercase and ASCII folding, so a
/// prefix typed without diacritics still matches, and keeps a `keyword`
/// sibling for exact filters.
pub fn index_settings() -> Value {
    let mut properties = Map::new();
    properties.insert(ROW_ID_FIELD.to_string(), json!({ "type": "long" }));
    properties.insert("kategoria".to_string(), json!({ "type": "keyword" }));
    properties.insert(
        "komuna".to_string(),
        json!({
            "type": "text",
            "analyzer": MUNICIPALITY_ANALYZER,
            "fields": { "keyword": { "type": "keyword" } }
        }),
    );
    for text_field in ["qendra_e_votimit", "vendvotimi"] {
        properties.insert(
            text_field.to_string(),
            json!({
                "type": "text",
                "fields": { "keyword": { "type": "keyword" } }
            }),
        );
    }
    for party in Party::ALL {
        properties.insert(party.field_name(), json!({ "type": "integer" }));
    }

    json!({
        "settings": {
            "analysis": {
                "analyzer": {
                    MUNICIPALITY_ANALYZER: {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "asciifolding"]
                    }
                }
            }
        },
        "mappings": {
            "properties": properties
        }
    })
}

/// Secondary full-text and exact-match mirror of the record store.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_exists(&self) -> Result<bool, SearchError>;

    async fn create_index(&self, settings: &Value) -> Result<(), SearchError>;

    /// Index every record under its row id, overwriting documents with the same id.
    ///
    /// Per-item failures are reported in the summary, not as an `Err`.
    async fn bulk_index(&self, documents: &[StoredRecord]) -> Result<BulkSummary, SearchError>;

    /// Remove every document whose row id is greater than `max_id`.
    ///
    /// # Returns
    ///
    /// * `Ok(u64)` - Number of documents deleted
    async fn delete_above(&self, max_id: i64) -> Result<u64, SearchError>;

    /// Up to `query.size` matching records, in relevance order where the
    /// backend scores hits.
    async fn search(&self, query: &IndexQuery) -> Result<SearchHits, SearchError>;

    /// Vote sums over every document matching `query`. `query.size` is ignored.
    async fn sum_votes(&self, query: &IndexQuery) -> Result<VoteSums, SearchError>;
}

fn fold_char(c: char) -> char {
    match c {
        'à'..='å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'è'..='ë' | 'ē' | 'ę' | 'ě' => 'e',
        'ì'..='ï' | 'ī' => 'i',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò'..='ö' | 'ø' | 'ō' => 'o',
        'ř' => 'r',
        'ś' | 'š' => 's',
        'ť' => 't',
        'ù'..='ü' | 'ū' | 'ů' => 'u',
        'ý' | 'ÿ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        _ => c,
    }
}

/// Tokens produced by the municipality analyzer.
pub fn analyze(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.chars().flat_map(char::to_lowercase).map(fold_char).collect())
        .collect()
}

fn phrase_prefix_matches(tokens: &[String], query: &[String]) -> bool {
    let Some((last, leading)) = query.split_last() else {
        return false;
    };
    if tokens.len() < query.len() {
        return false;
    }
    tokens.windows(query.len()).any(|window| {
        window[..leading.len()] == *leading && window[leading.len()].starts_with(last.as_str())
    })
}

fn clause_matches(clause: &IndexClause, record: &ElectionRecord) -> bool {
    match clause {
        IndexClause::Term { field, value } => {
            let stored = field.value_of(record);
            if field.is_analyzed() {
                analyze(stored).iter().any(|token| token == value)
            } else {
                stored == value
            }
        }
        IndexClause::PhrasePrefix { field, text } => {
            let stored = field.value_of(record);
            if field.is_analyzed() {
                phrase_prefix_matches(&analyze(stored), &analyze(text))
            } else {
                stored.starts_with(text.as_str())
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryIndexState {
    settings: Option<Value>,
    documents: BTreeMap<i64, ElectionRecord>,
}

/// Process-local index. Hits come back in document id order.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: RwLock<MemoryIndexState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document_count(&self) -> usize {
        self.state.read().await.documents.len()
    }

    /// Settings the index was created with, if it exists.
    pub async fn settings(&self) -> Option<Value> {
        self.state.read().await.settings.clone()
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn index_exists(&self) -> Result<bool, SearchError> {
        Ok(self.state.read().await.settings.is_some())
    }

    async fn create_index(&self, settings: &Value) -> Result<(), SearchError> {
        let mut state = self.state.write().await;
        if state.settings.is_some() {
            return Err(SearchError::index_creation("resource_already_exists_exception"));
        }
        state.settings = Some(settings.clone());
        Ok(())
    }

    async fn bulk_index(&self, documents: &[StoredRecord]) -> Result<BulkSummary, SearchError> {
        let mut state = self.state.write().await;
        // Indexing into a missing index creates it with dynamic mappings
        state.settings.get_or_insert_with(|| json!({}));
        for doc in documents {
            state.documents.insert(doc.id, doc.record.clone());
        }
        Ok(BulkSummary {
            total: documents.len(),
            succeeded: documents.len(),
            ..Default::default()
        })
    }

    async fn delete_above(&self, max_id: i64) -> Result<u64, SearchError> {
        let mut state = self.state.write().await;
        let Some(first_stale) = max_id.checked_add(1) else {
            return Ok(0);
        };
        let stale = state.documents.split_off(&first_stale);
        Ok(stale.len() as u64)
    }

    async fn search(&self, query: &IndexQuery) -> Result<SearchHits, SearchError> {
        let state = self.state.read().await;
        let matched: Vec<&ElectionRecord> = state
            .documents
            .values()
            .filter(|record| query.clauses.iter().all(|c| clause_matches(c, record)))
            .collect();

        Ok(SearchHits {
            total: matched.len() as u64,
            records: matched.into_iter().take(query.size).cloned().collect(),
        })
    }

    async fn sum_votes(&self, query: &IndexQuery) -> Result<VoteSums, SearchError> {
        let state = self.state.read().await;
        let mut sums = VoteSums::default();
        for record in state.documents.values() {
            if query.clauses.iter().all(|c| clause_matches(c, record)) {
                sums.add(record);
            }
        }
        Ok(sums)
    }
}
