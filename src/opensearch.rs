//! OpenSearch implementation of [`SearchIndex`].

use crate::models::{Category, ElectionRecord, Municipality, Party, StoredRecord};
use crate::search::{
    BulkSummary, IndexClause, IndexQuery, SearchError, SearchHits, SearchIndex, VoteSums,
    ROW_ID_FIELD,
};
use async_trait::async_trait;
use opensearch::http::request::JsonBody;
use opensearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use opensearch::indices::{IndicesCreateParts, IndicesExistsParts, IndicesRefreshParts};
use opensearch::params::Conflicts;
use opensearch::{BulkParts, DeleteByQueryParts, OpenSearch, SearchParts};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error, info};
use url::Url;

pub struct OpenSearchIndex {
    client: OpenSearch,
    index_name: String,
}

impl OpenSearchIndex {
    /// Connect to the node at `url`. No request is sent until the first call.
    ///
    /// # Arguments
    ///
    /// * `url` - The OpenSearch server URL (e.g., "http://localhost:9200")
    /// * `index_name` - Index holding the election records
    /// * `timeout` - Per-request transport timeout
    pub fn new(url: &str, index_name: impl Into<String>, timeout: Duration) -> Result<Self, SearchError> {
        let parsed_url = Url::parse(url).map_err(|e| SearchError::connection(e.to_string()))?;

        let conn_pool = SingleNodeConnectionPool::new(parsed_url);
        let transport = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let index_name = index_name.into();
        info!(url = %url, index = %index_name, "Created OpenSearch client");

        Ok(Self {
            client: OpenSearch::new(transport),
            index_name,
        })
    }

    async fn send_search(&self, body: Value) -> Result<Value, SearchError> {
        debug!(index = %self.index_name, query = %body, "Searching");

        let response = self
            .client
            .search(SearchParts::Index(&[&self.index_name]))
            .body(body)
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Search request failed");
            return Err(SearchError::query(format!(
                "Search failed with status {status}: {error_body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SearchError::parse(e.to_string()))
    }
}

/// Document body for one stored row. Field names match [`crate::search::index_settings`].
pub fn to_document(row: &StoredRecord) -> Value {
    let record = &row.record;
    let mut doc = Map::new();
    doc.insert(ROW_ID_FIELD.to_string(), json!(row.id));
    doc.insert("kategoria".to_string(), json!(record.category.as_str()));
    doc.insert("komuna".to_string(), json!(record.municipality.as_str()));
    doc.insert("qendra_e_votimit".to_string(), json!(record.polling_center));
    doc.insert("vendvotimi".to_string(), json!(record.polling_place));
    for (party, votes) in record.votes.iter() {
        doc.insert(party.field_name(), json!(votes));
    }
    Value::Object(doc)
}

/// Rebuild a record from a hit's `_source`. Missing party fields read as 0.
pub fn parse_source(source: &Value) -> Result<ElectionRecord, SearchError> {
    let text = |field: &str| source.get(field).and_then(Value::as_str);

    let category: Category = text("kategoria")
        .ok_or_else(|| SearchError::parse("document has no kategoria"))?
        .parse()
        .map_err(|e| SearchError::parse(format!("{e}")))?;
    let municipality: Municipality = text("komuna")
        .ok_or_else(|| SearchError::parse("document has no komuna"))?
        .parse()
        .map_err(|e| SearchError::parse(format!("{e}")))?;

    let mut record = ElectionRecord::new(category, municipality)
        .with_polling_center(text("qendra_e_votimit").unwrap_or_default())
        .with_polling_place(text("vendvotimi").unwrap_or_default());

    for party in Party::ALL {
        let field = party.field_name();
        let votes = match source.get(&field) {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| SearchError::parse(format!("invalid {field}: {value}")))?,
        };
        record.votes.set(*party, votes);
    }
    Ok(record)
}

/// Term clauses filter without scoring. Phrase-prefix clauses are scored so
/// the best matches come first.
fn query_clause(query: &IndexQuery) -> Value {
    let mut must = Vec::new();
    let mut filter = Vec::new();
    for clause in &query.clauses {
        match clause {
            IndexClause::Term { field, value } => {
                filter.push(json!({ "term": { field.path(): value } }))
            }
            IndexClause::PhrasePrefix { field, text } => {
                must.push(json!({ "match_phrase_prefix": { field.path(): text } }))
            }
        }
    }

    if must.is_empty() && filter.is_empty() {
        return json!({ "match_all": {} });
    }
    let mut bool_query = Map::new();
    if !must.is_empty() {
        bool_query.insert("must".to_string(), Value::Array(must));
    }
    if !filter.is_empty() {
        bool_query.insert("filter".to_string(), Value::Array(filter));
    }
    json!({ "bool": bool_query })
}

/// Request body for a typed query.
pub fn build_search_query(query: &IndexQuery) -> Value {
    json!({
        "query": query_clause(query),
        "size": query.size,
        "track_total_hits": true
    })
}

/// Request body summing every party field over all matching documents.
pub fn build_sum_query(query: &IndexQuery) -> Value {
    let mut aggs = Map::new();
    for party in Party::ALL {
        let field = party.field_name();
        aggs.insert(field.clone(), json!({ "sum": { "field": field } }));
    }
    json!({
        "query": query_clause(query),
        "size": 0,
        "track_total_hits": true,
        "aggs": aggs
    })
}

fn hits_total(response: &Value) -> u64 {
    response
        .get("hits")
        .and_then(|h| h.get("total"))
        .and_then(|t| t.get("value").and_then(Value::as_u64).or_else(|| t.as_u64()))
        .unwrap_or(0)
}

/// Read the per-party `sum` aggregations. A party without an aggregation sums to 0.
fn parse_vote_sums(response: &Value) -> Result<VoteSums, SearchError> {
    let aggregations = response
        .get("aggregations")
        .ok_or_else(|| SearchError::parse("search response has no aggregations"))?;

    let mut sums = VoteSums {
        matched: hits_total(response),
        ..Default::default()
    };
    for party in Party::ALL {
        let field = party.field_name();
        let value = match aggregations.get(&field).and_then(|a| a.get("value")) {
            None | Some(Value::Null) => 0.0,
            Some(v) => v
                .as_f64()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .ok_or_else(|| SearchError::parse(format!("invalid sum for {field}: {v}")))?,
        };
        sums.totals[party.index()] = value.round() as u64;
    }
    Ok(sums)
}

/// Split a bulk response into per-item outcomes.
fn summarize_bulk(response: &Value, total: usize) -> BulkSummary {
    let mut summary = BulkSummary {
        total,
        ..Default::default()
    };
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        summary.succeeded = total;
        return summary;
    }

    let items = response
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for item in items {
        match item.get("index").and_then(|i| i.get("error")) {
            Some(err) => {
                summary.failed += 1;
                let id = item["index"].get("_id").and_then(Value::as_str).unwrap_or("?");
                let reason = err
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string());
                summary.errors.push(format!("document {id}: {reason}"));
            }
            None => summary.succeeded += 1,
        }
    }
    summary
}

fn parse_hits(response: &Value) -> Result<SearchHits, SearchError> {
    let hits = response
        .get("hits")
        .ok_or_else(|| SearchError::parse("search response has no hits"))?;
    let total = hits_total(response);

    let records = hits
        .get("hits")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|hit| {
            hit.get("_source")
                .ok_or_else(|| SearchError::parse("hit has no _source"))
                .and_then(parse_source)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SearchHits { records, total })
}

#[async_trait]
impl SearchIndex for OpenSearchIndex {
    async fn index_exists(&self) -> Result<bool, SearchError> {
        let response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[&self.index_name]))
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        match response.status_code().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(SearchError::query(format!(
                "Index exists check returned status {status}"
            ))),
        }
    }

    async fn create_index(&self, settings: &Value) -> Result<(), SearchError> {
        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(&self.index_name))
            .body(settings.clone())
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Create index failed");
            return Err(SearchError::index_creation(format!(
                "Create index failed with status {status}: {error_body}"
            )));
        }

        info!(index = %self.index_name, "Created search index");
        Ok(())
    }

    async fn bulk_index(&self, documents: &[StoredRecord]) -> Result<BulkSummary, SearchError> {
        if documents.is_empty() {
            return Ok(BulkSummary::default());
        }

        let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(documents.len() * 2);
        for doc in documents {
            body.push(json!({ "index": { "_id": doc.id.to_string() } }).into());
            body.push(to_document(doc).into());
        }

        let response = self
            .client
            .bulk(BulkParts::Index(&self.index_name))
            .body(body)
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Bulk request failed");
            return Err(SearchError::bulk_index(format!(
                "Bulk request failed with status {status}: {error_body}"
            )));
        }

        let response_body: Value = response
            .json()
            .await
            .map_err(|e| SearchError::parse(e.to_string()))?;
        let summary = summarize_bulk(&response_body, documents.len());
        debug!(
            total = summary.total,
            failed = summary.failed,
            "Bulk request completed"
        );
        Ok(summary)
    }

    async fn delete_above(&self, max_id: i64) -> Result<u64, SearchError> {
        // Documents from the previous sync may not be searchable yet
        let response = self
            .client
            .indices()
            .refresh(IndicesRefreshParts::Index(&[&self.index_name]))
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;
        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Index refresh failed");
            return Err(SearchError::query(format!(
                "Refresh failed with status {status}: {error_body}"
            )));
        }

        let response = self
            .client
            .delete_by_query(DeleteByQueryParts::Index(&[&self.index_name]))
            .conflicts(Conflicts::Proceed)
            .refresh(true)
            .body(json!({ "query": { "range": { ROW_ID_FIELD: { "gt": max_id } } } }))
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Delete by query failed");
            return Err(SearchError::query(format!(
                "Delete by query failed with status {status}: {error_body}"
            )));
        }

        let response_body: Value = response
            .json()
            .await
            .map_err(|e| SearchError::parse(e.to_string()))?;
        let deleted = response_body.get("deleted").and_then(Value::as_u64).unwrap_or(0);
        debug!(index = %self.index_name, max_id, deleted, "Deleted stale documents");
        Ok(deleted)
    }

    async fn search(&self, query: &IndexQuery) -> Result<SearchHits, SearchError> {
        let response_body = self.send_search(build_search_query(query)).await?;
        parse_hits(&response_body)
    }

    async fn sum_votes(&self, query: &IndexQuery) -> Result<VoteSums, SearchError> {
        let response_body = self.send_search(build_sum_query(query)).await?;
        parse_vote_sums(&response_body)
    }
}
