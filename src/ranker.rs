//! Suggestion popularity counters and the top-K ranking over them.

use crate::cache::SuggestionCache;
use crate::error::{bounded, ElectionError};
use crate::models::SuggestionStat;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct SuggestionRanker {
    cache: Arc<dyn SuggestionCache>,
    key: String,
    timeout: Duration,
}

impl SuggestionRanker {
    pub fn new(cache: Arc<dyn SuggestionCache>, key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cache,
            key: key.into(),
            timeout,
        }
    }

    /// Count one more suggestion of `name`.
    pub async fn record_hit(&self, name: &str) -> Result<i64, ElectionError> {
        bounded(
            "suggestion cache increment",
            self.timeout,
            self.cache.hash_increment(&self.key, name, 1),
        )
        .await
    }

    /// Count one hit for each name, concurrently.
    pub async fn record_hits(&self, names: &[String]) -> Result<(), ElectionError> {
        try_join_all(names.iter().map(|name| self.record_hit(name))).await?;
        Ok(())
    }

    /// The `k` most suggested names, highest count first, ties by name.
    pub async fn top_k(&self, k: usize) -> Result<Vec<SuggestionStat>, ElectionError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut counters = bounded(
            "suggestion cache read",
            self.timeout,
            self.cache.hash_get_all(&self.key),
        )
        .await?;
        debug!(names = counters.len(), k, "Ranking suggestions");

        counters.sort_by(|(a_name, a_hits), (b_name, b_hits)| {
            b_hits.cmp(a_hits).then_with(|| a_name.cmp(b_name))
        });
        Ok(counters
            .into_iter()
            .take(k)
            .map(|(name, hits)| SuggestionStat { name, hits })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::{CACHE_TIMEOUT_SECS, SUGGESTIONS_KEY};

    fn ranker() -> SuggestionRanker {
        SuggestionRanker::new(
            Arc::new(MemoryCache::new()),
            SUGGESTIONS_KEY,
            Duration::from_secs(CACHE_TIMEOUT_SECS),
        )
    }

    fn names(stats: &[SuggestionStat]) -> Vec<&str> {
        stats.iter().map(|s| s.name.as_str()).collect()
    }

    #[tokio::test]
    async fn ranks_by_count_then_name() {
        let ranker = ranker();
        for (name, hits) in [("Prizren", 3), ("Peje", 5), ("Gjilan", 3), ("Viti", 1)] {
            for _ in 0..hits {
                ranker.record_hit(name).await.unwrap();
            }
        }

        let top = ranker.top_k(3).await.unwrap();
        assert_eq!(names(&top), vec!["Peje", "Gjilan", "Prizren"]);
        assert_eq!(top[0].hits, 5);
    }

    #[tokio::test]
    async fn k_larger_than_population() {
        let ranker = ranker();
        ranker.record_hit("Peje").await.unwrap();
        assert_eq!(ranker.top_k(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_k_is_empty() {
        let ranker = ranker();
        ranker.record_hit("Peje").await.unwrap();
        assert!(ranker.top_k(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_cache_ranks_nothing() {
        assert!(ranker().top_k(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_hits_counts_each_name_once() {
        let ranker = ranker();
        ranker
            .record_hits(&["Peje".to_string(), "Prizren".to_string()])
            .await
            .unwrap();
        ranker.record_hits(&["Peje".to_string()]).await.unwrap();

        let top = ranker.top_k(5).await.unwrap();
        assert_eq!(
            top,
            vec![
                SuggestionStat { name: "Peje".to_string(), hits: 2 },
                SuggestionStat { name: "Prizren".to_string(), hits: 1 },
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_hits_are_all_counted() {
        let ranker = Arc::new(ranker());
        let mut handles = Vec::new();
        for _ in 0..100 {
            let ranker = Arc::clone(&ranker);
            handles.push(tokio::spawn(async move { ranker.record_hit("Ferizaj").await.unwrap() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(ranker.top_k(1).await.unwrap()[0].hits, 100);
    }
}
