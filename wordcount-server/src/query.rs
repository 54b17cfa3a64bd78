use crate::error::QueryError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info};

/// A query with named parameters bound separately from the SQL text.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryParam {
    pub name: String,
    pub value: String,
}

/// One record returned by the warehouse. Columns keep the order the
/// service reported them in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRow {
    columns: Vec<(String, Value)>,
}

impl ResultRow {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.columns.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// The external query service. Construction is the implementor's concern;
/// handlers only ever see a ready client.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn query(&self, request: &QueryRequest) -> Result<Vec<ResultRow>, QueryError>;
}

/// Total occurrences of `word` per corpus, highest first. The word is bound
/// as `@word`; the table is a validated identifier.
pub fn word_count_query(table: &str, word: &str) -> QueryRequest {
    let sql = format!(
        concat!(
            "SELECT\n",
            "    corpus,\n",
            "    SUM(word_count) AS total_words\n",
            "FROM `{}`\n",
            "WHERE word = @word\n",
            "GROUP BY corpus\n",
            "ORDER BY total_words DESC",
        ),
        table
    );
    QueryRequest {
        sql,
        params: vec![QueryParam {
            name: "word".to_string(),
            value: word.to_string(),
        }],
    }
}

pub async fn run_word_count(
    warehouse: &dyn Warehouse,
    table: &str,
    word: &str,
    timeout: Duration,
) -> Result<Vec<ResultRow>, QueryError> {
    let request = word_count_query(table, word);
    info!("Executing query for word: '{}'", word);

    let result = match tokio::time::timeout(timeout, warehouse.query(&request)).await {
        Ok(res) => res,
        Err(_) => Err(QueryError::Timeout(timeout)),
    };

    match &result {
        Ok(rows) => info!("Query returned {} results", rows.len()),
        Err(e) => error!("Error executing query: {}", e),
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Canned warehouse for handler and executor tests.
    pub(crate) struct FakeWarehouse {
        pub outcome: Result<Vec<ResultRow>, String>,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
        pub last_request: Mutex<Option<QueryRequest>>,
    }

    impl FakeWarehouse {
        pub fn rows(rows: Vec<ResultRow>) -> Self {
            Self::with_outcome(Ok(rows))
        }

        pub fn failing(message: &str) -> Self {
            Self::with_outcome(Err(message.to_string()))
        }

        fn with_outcome(outcome: Result<Vec<ResultRow>, String>) -> Self {
            FakeWarehouse {
                outcome,
                delay: None,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Warehouse for FakeWarehouse {
        async fn query(&self, request: &QueryRequest) -> Result<Vec<ResultRow>, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.outcome.clone().map_err(|message| QueryError::Api {
                status: 400,
                message,
            })
        }
    }

    #[test]
    fn word_is_bound_not_interpolated() {
        let req = word_count_query("bigquery-public-data.samples.shakespeare", "o'er");
        assert!(!req.sql.contains("o'er"));
        assert!(req.sql.contains("WHERE word = @word"));
        assert!(req.sql.contains("FROM `bigquery-public-data.samples.shakespeare`"));
        assert!(req.sql.contains("ORDER BY total_words DESC"));
        assert_eq!(
            req.params,
            vec![QueryParam {
                name: "word".to_string(),
                value: "o'er".to_string()
            }]
        );
    }

    #[test]
    fn result_row_keeps_insertion_order() {
        let row = ResultRow::new().with("corpus", "hamlet").with("total_words", 7);
        let names: Vec<&str> = row.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["corpus", "total_words"]);
        assert_eq!(row.get("total_words"), Some(&Value::from(7)));
        assert_eq!(row.get("missing"), None);
    }

    #[tokio::test]
    async fn executor_passes_rows_through() {
        let fake = FakeWarehouse::rows(vec![ResultRow::new().with("corpus", "sonnets")]);
        let rows = run_word_count(&fake, "d.t", "love", Duration::from_secs(1))
            .await
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(fake.calls(), 1);
        let sent = fake.last_request.lock().unwrap().clone().expect("request");
        assert_eq!(sent.params[0].value, "love");
    }

    #[tokio::test]
    async fn executor_propagates_failure_message_without_retry() {
        let fake = FakeWarehouse::failing("timeout");
        let err = run_word_count(&fake, "d.t", "the", Duration::from_secs(1))
            .await
            .expect_err("must fail");
        assert_eq!(err.to_string(), "timeout");
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn executor_enforces_timeout() {
        let mut fake = FakeWarehouse::rows(vec![]);
        fake.delay = Some(Duration::from_secs(5));
        let err = run_word_count(&fake, "d.t", "the", Duration::from_millis(50))
            .await
            .expect_err("must time out");
        assert!(matches!(err, QueryError::Timeout(_)));
        assert!(err.to_string().contains("timed out"));
    }
}
