use std::time::{Duration, Instant};
use thiserror::Error;

use super::value::Row;

/// Failure reported by a [`QueryExecutor`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecuteError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unsupported query: {0}")]
    Unsupported(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("connection failed: {0}")]
    Connection(String),
}

/// Raw output of a query executor: declared column names plus loosely
/// typed rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub records: Vec<Row>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, records: Vec<Row>) -> Self {
        Self { columns, records }
    }

    pub fn row_count(&self) -> usize {
        self.records.len()
    }

    /// Number of rows that supply fewer values than there are columns.
    pub fn ragged_rows(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.len() < self.columns.len())
            .count()
    }
}

/// Runs query text against a document store.
///
/// Implementations are obtained per request from a
/// [`DocumentBackend`](super::DocumentBackend) and are free to block.
pub trait QueryExecutor: Send {
    fn execute(&self, query: &str) -> Result<ResultSet, ExecuteError>;
}

/// Execute a query and report how long it took.
pub fn execute_timed(
    executor: &dyn QueryExecutor,
    query: &str,
) -> (Result<ResultSet, ExecuteError>, Duration) {
    let start = Instant::now();
    let result = executor.execute(query.trim());
    (result, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RawValue;

    struct FixedExecutor(ResultSet);

    impl QueryExecutor for FixedExecutor {
        fn execute(&self, query: &str) -> Result<ResultSet, ExecuteError> {
            if query.is_empty() {
                return Err(ExecuteError::Syntax("empty".into()));
            }
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_execute_error_messages() {
        assert_eq!(
            ExecuteError::Syntax("unexpected token".into()).to_string(),
            "syntax error: unexpected token"
        );
        assert_eq!(
            ExecuteError::Unsupported("JOIN".into()).to_string(),
            "unsupported query: JOIN"
        );
    }

    #[test]
    fn test_empty_result() {
        let r = ResultSet::default();
        assert!(r.columns.is_empty());
        assert_eq!(r.row_count(), 0);
        assert_eq!(r.ragged_rows(), 0);
    }

    #[test]
    fn test_ragged_rows() {
        let r = ResultSet::new(
            vec!["a".into(), "b".into()],
            vec![
                vec![RawValue::Int64(1), RawValue::Int64(2)],
                vec![RawValue::Int64(3)],
                vec![],
            ],
        );
        assert_eq!(r.row_count(), 3);
        assert_eq!(r.ragged_rows(), 2);
    }

    #[test]
    fn test_execute_timed_trims_query() {
        let executor = FixedExecutor(ResultSet::new(vec!["a".into()], vec![]));
        let (result, _) = execute_timed(&executor, "   ");
        assert!(matches!(result, Err(ExecuteError::Syntax(_))));
        let (result, _) = execute_timed(&executor, " SELECT a FROM c ");
        assert_eq!(result.unwrap().columns, vec!["a".to_string()]);
    }
}
