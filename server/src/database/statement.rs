//! Prepared statement registry and transactions

use super::value::{QueryResult, Value};
use crate::error::DbError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Name to SQL map. Built once at startup; no SQL is constructed elsewhere.
#[derive(Debug, Clone, Default)]
pub struct StatementRegistry {
    statements: BTreeMap<String, String>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.statements.insert(name.into(), sql.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.statements.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.statements.iter().map(|(n, s)| (n.as_str(), s.as_str()))
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Inspects a statement's result and may append statements to the
/// running transaction. Returning an error aborts it.
pub type Hook = Arc<dyn Fn(&QueryResult, &mut TransactionPlan) -> Result<(), DbError> + Send + Sync>;

#[derive(Clone)]
pub struct TransactionStatement {
    pub name: String,
    pub params: Vec<Value>,
    pub hook: Option<Hook>,
}

impl fmt::Debug for TransactionStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStatement")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// Ordered statements executed atomically.
///
/// Kept intact by the worker, so a transaction interrupted by a lost
/// connection can be replayed from the start.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    statements: Vec<TransactionStatement>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statement(mut self, name: impl Into<String>, params: Vec<Value>) -> Self {
        self.statements.push(TransactionStatement {
            name: name.into(),
            params,
            hook: None,
        });
        self
    }

    pub fn statement_with_hook<F>(mut self, name: impl Into<String>, params: Vec<Value>, hook: F) -> Self
    where
        F: Fn(&QueryResult, &mut TransactionPlan) -> Result<(), DbError> + Send + Sync + 'static,
    {
        self.statements.push(TransactionStatement {
            name: name.into(),
            params,
            hook: Some(Arc::new(hook)),
        });
        self
    }

    pub fn statements(&self) -> &[TransactionStatement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Statements appended by hooks while a transaction runs. They execute
/// after the statements already queued, before commit.
#[derive(Debug, Default)]
pub struct TransactionPlan {
    appended: Vec<TransactionStatement>,
}

impl TransactionPlan {
    pub fn push(&mut self, name: impl Into<String>, params: Vec<Value>) {
        self.appended.push(TransactionStatement {
            name: name.into(),
            params,
            hook: None,
        });
    }

    pub fn push_with_hook<F>(&mut self, name: impl Into<String>, params: Vec<Value>, hook: F)
    where
        F: Fn(&QueryResult, &mut TransactionPlan) -> Result<(), DbError> + Send + Sync + 'static,
    {
        self.appended.push(TransactionStatement {
            name: name.into(),
            params,
            hook: Some(Arc::new(hook)),
        });
    }

    pub(crate) fn into_statements(self) -> Vec<TransactionStatement> {
        self.appended
    }
}

/// Results of a transaction: `[BEGIN, statements..., COMMIT or ROLLBACK]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    pub results: Vec<QueryResult>,
    pub committed: bool,
}

impl TransactionResult {
    /// A transaction that never ran: failed BEGIN and ROLLBACK entries
    /// carrying `error`.
    pub fn failed(error: DbError) -> Self {
        Self {
            results: vec![QueryResult::failed(error.clone()), QueryResult::failed(error)],
            committed: false,
        }
    }

    /// Result of the `index`th executed statement, not counting BEGIN.
    pub fn statement(&self, index: usize) -> Option<&QueryResult> {
        let executed = self.results.len().saturating_sub(2);
        if index < executed {
            self.results.get(index + 1)
        } else {
            None
        }
    }

    /// Position in `results` of the first failure.
    pub fn failed_at(&self) -> Option<usize> {
        self.results.iter().position(|r| !r.is_valid())
    }

    pub fn error(&self) -> Option<&DbError> {
        self.results.iter().find_map(|r| r.error.as_ref())
    }
}
