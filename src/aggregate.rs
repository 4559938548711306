//! Per-party vote totals over the record store.

use crate::config::ServiceConfig;
use crate::error::{bounded, ElectionError};
use crate::models::{
    AggregatedResponse, ElectionRecord, Party, PartyTotal, ResultFilter, PARTY_COUNT,
};
use crate::store::{CheckedQuery, RecordStore, TextField};
use std::sync::Arc;
use tracing::debug;

pub const POLLING_CENTER_NOT_FOUND: &str = "Qendra_e_Votimit nuk ekziston";
pub const POLLING_PLACE_NOT_FOUND: &str = "Vendvotimi nuk ekziston";

/// Report `sums` (indexed by [`Party::index`]) in party declaration order.
///
/// With `party` set only that column is reported.
pub fn party_totals(sums: &[u64; PARTY_COUNT], party: Option<Party>) -> Vec<PartyTotal> {
    let parties: &[Party] = match party {
        Some(ref p) => std::slice::from_ref(p),
        None => Party::ALL,
    };

    parties
        .iter()
        .map(|&party| PartyTotal {
            party,
            total_votes: sums[party.index()],
        })
        .collect()
}

/// Sum votes per party across `records`.
pub fn tally(records: &[ElectionRecord], party: Option<Party>) -> Vec<PartyTotal> {
    let mut sums = [0u64; PARTY_COUNT];
    for record in records {
        for (p, votes) in record.votes.iter() {
            sums[p.index()] += u64::from(votes);
        }
    }
    party_totals(&sums, party)
}

pub struct Aggregator {
    store: Arc<dyn RecordStore>,
    config: ServiceConfig,
}

impl Aggregator {
    pub fn new(store: Arc<dyn RecordStore>, config: ServiceConfig) -> Self {
        Self { store, config }
    }

    /// Totals for every record matching `filter`.
    ///
    /// A polling center or polling place filter must name a value that exists
    /// somewhere in the dataset, whatever the other filters are. The center is
    /// checked first. Checks and totals come from the same dataset.
    pub async fn aggregate(&self, filter: ResultFilter) -> Result<AggregatedResponse, ElectionError> {
        let filter = filter.normalized();
        let checked = bounded(
            "record store query",
            self.config.store_timeout,
            self.store.query_checked(&filter),
        )
        .await?;

        let records = match checked {
            CheckedQuery::Records(records) => records,
            CheckedQuery::Missing(TextField::PollingCenter) => {
                return Err(ElectionError::not_found(POLLING_CENTER_NOT_FOUND));
            }
            CheckedQuery::Missing(TextField::PollingPlace) => {
                return Err(ElectionError::not_found(POLLING_PLACE_NOT_FOUND));
            }
        };
        debug!(matched = records.len(), ?filter, "Aggregating store records");

        Ok(AggregatedResponse {
            results: tally(&records, filter.party),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, Municipality};
    use crate::sqlite::SqliteStore;

    fn record(category: Category, center: &str, place: &str, p111: u32, p112: u32) -> ElectionRecord {
        ElectionRecord::new(category, Municipality::Prishtine)
            .with_polling_center(center)
            .with_polling_place(place)
            .with_votes(Party::Partia111, p111)
            .with_votes(Party::Partia112, p112)
    }

    async fn aggregator(records: Vec<ElectionRecord>) -> Aggregator {
        let store = SqliteStore::open_in_memory().unwrap();
        store.replace_all(records).await.unwrap();
        Aggregator::new(Arc::new(store), ServiceConfig::default())
    }

    #[test]
    fn tally_sums_in_declaration_order() {
        let records = vec![record(Category::Local, "A", "1", 10, 1), record(Category::Local, "B", "1", 25, 2)];
        let totals = tally(&records, None);
        assert_eq!(totals.len(), 28);
        assert_eq!(totals[0], PartyTotal { party: Party::Partia111, total_votes: 35 });
        assert_eq!(totals[1], PartyTotal { party: Party::Partia112, total_votes: 3 });
        assert_eq!(totals[27].party, Party::Partia138);
        assert_eq!(totals[27].total_votes, 0);
    }

    #[test]
    fn tally_does_not_overflow_u32() {
        let records = vec![
            record(Category::Local, "A", "1", u32::MAX, 0),
            record(Category::Local, "B", "1", u32::MAX, 0),
        ];
        let totals = tally(&records, Some(Party::Partia111));
        assert_eq!(totals[0].total_votes, 2 * u64::from(u32::MAX));
    }

    #[test]
    fn tally_of_nothing_is_zero() {
        let totals = tally(&[], Some(Party::Partia120));
        assert_eq!(totals, vec![PartyTotal { party: Party::Partia120, total_votes: 0 }]);
    }

    #[tokio::test]
    async fn category_and_party_filter() {
        let agg = aggregator(vec![
            record(Category::Local, "A", "1", 10, 7),
            record(Category::Local, "B", "2", 25, 7),
            record(Category::Postal, "C", "3", 100, 7),
        ])
        .await;

        let response = agg
            .aggregate(
                ResultFilter::new()
                    .with_category(Category::Local)
                    .with_party(Party::Partia111),
            )
            .await
            .unwrap();
        assert_eq!(
            response.results,
            vec![PartyTotal { party: Party::Partia111, total_votes: 35 }]
        );
    }

    #[tokio::test]
    async fn no_filter_sums_everything() {
        let agg = aggregator(vec![
            record(Category::Local, "A", "1", 10, 1),
            record(Category::Postal, "C", "3", 100, 2),
        ])
        .await;
        let response = agg.aggregate(ResultFilter::new()).await.unwrap();
        assert_eq!(response.results[0].total_votes, 110);
        assert_eq!(response.results[1].total_votes, 3);
    }

    #[tokio::test]
    async fn unknown_polling_center_is_not_found() {
        let agg = aggregator(vec![record(Category::Local, "A", "1", 10, 1)]).await;
        let err = agg
            .aggregate(
                ResultFilter::new()
                    .with_category(Category::Postal)
                    .with_polling_center("Nowhere"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_string(), POLLING_CENTER_NOT_FOUND);
    }

    #[tokio::test]
    async fn center_is_checked_before_place() {
        let agg = aggregator(vec![record(Category::Local, "A", "1", 10, 1)]).await;
        let err = agg
            .aggregate(
                ResultFilter::new()
                    .with_polling_center("Nowhere")
                    .with_polling_place("99"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), POLLING_CENTER_NOT_FOUND);

        let err = agg
            .aggregate(ResultFilter::new().with_polling_center("A").with_polling_place("99"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), POLLING_PLACE_NOT_FOUND);
    }

    #[tokio::test]
    async fn existence_is_independent_of_other_filters() {
        // "A" exists, but not as a Postal record: that is an empty result, not NotFound
        let agg = aggregator(vec![record(Category::Local, "A", "1", 10, 1)]).await;
        let response = agg
            .aggregate(
                ResultFilter::new()
                    .with_category(Category::Postal)
                    .with_polling_center("A"),
            )
            .await
            .unwrap();
        assert!(response.results.iter().all(|t| t.total_votes == 0));
    }

    #[tokio::test]
    async fn blank_text_filters_are_ignored() {
        let agg = aggregator(vec![record(Category::Local, "A", "1", 10, 1)]).await;
        let response = agg
            .aggregate(ResultFilter::new().with_polling_center("  ").with_polling_place(""))
            .await
            .unwrap();
        assert_eq!(response.results[0].total_votes, 10);
    }

    #[test]
    fn party_totals_picks_one_column() {
        let mut sums = [0u64; PARTY_COUNT];
        sums[Party::Partia120.index()] = 42;
        assert_eq!(
            party_totals(&sums, Some(Party::Partia120)),
            vec![PartyTotal { party: Party::Partia120, total_votes: 42 }]
        );
        assert_eq!(party_totals(&sums, None).len(), PARTY_COUNT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lookup_and_totals_see_one_dataset() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("results.db");
        let with_a = vec![record(Category::Local, "A", "1", 10, 0)];
        let without_a = vec![record(Category::Local, "B", "1", 7, 0)];

        let writer = SqliteStore::open(&path).unwrap();
        writer.replace_all(with_a.clone()).await.unwrap();
        // A second connection, so the writer's commits are not serialized
        // behind the reader's mutex
        let agg = Aggregator::new(Arc::new(SqliteStore::open(&path).unwrap()), ServiceConfig::default());

        let swaps = tokio::spawn(async move {
            for i in 0..100 {
                let batch = if i % 2 == 0 { without_a.clone() } else { with_a.clone() };
                writer.replace_all(batch).await.unwrap();
            }
        });

        for _ in 0..200 {
            match agg.aggregate(ResultFilter::new().with_polling_center("A")).await {
                Ok(response) => assert_eq!(response.results[0].total_votes, 10),
                Err(e) => assert_eq!(e.to_string(), POLLING_CENTER_NOT_FOUND),
            }
        }
        swaps.await.unwrap();
    }

    #[tokio::test]
    async fn stored_sentinel_is_real_data() {
        let agg = aggregator(vec![
            record(Category::TeGjitha, "A", "1", 5, 0),
            record(Category::Local, "B", "1", 7, 0),
        ])
        .await;
        let response = agg
            .aggregate(ResultFilter::new().with_category(Category::TeGjitha))
            .await
            .unwrap();
        assert_eq!(response.results[0].total_votes, 5);
    }
}
