//! Buffered remote writes.
//!
//! Writes issued inside a transaction are held locally and sent as one batch
//! at commit. Nothing reaches the remote before commit, so reads inside the
//! transaction do not see its own writes. A failed commit leaves the buffer
//! intact; statements the remote already applied are not undone.

use cirrus_common::credentials::EndpointIdentity;
use cirrus_connectors::sources::d1::D1Client;
use cirrus_connectors::sources::QueryResult;
use cirrus_error::{CirrusError, ErrorCode, ErrorContext, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Started,
    Committing,
}

#[derive(Debug)]
struct Transaction {
    identity: EndpointIdentity,
    alias: String,
    statements: Vec<String>,
    state: TransactionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub statements: usize,
    pub changes: u64,
}

#[derive(Debug)]
pub struct TransactionManager {
    client: Arc<D1Client>,
    next_id: AtomicU64,
    open: Mutex<HashMap<TransactionId, Transaction>>,
}

impl TransactionManager {
    pub fn new(client: Arc<D1Client>) -> Self {
        Self {
            client,
            next_id: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn open(&self) -> MutexGuard<'_, HashMap<TransactionId, Transaction>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self, identity: EndpointIdentity, alias: impl Into<String>) -> TransactionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let alias = alias.into();
        tracing::debug!(transaction = id, alias = %alias, "Transaction started");
        self.open().insert(
            id,
            Transaction {
                identity,
                alias,
                statements: Vec::new(),
                state: TransactionState::Started,
            },
        );
        id
    }

    /// Appends `sql` to the buffer of transaction `id`. Returns the buffer length.
    pub fn buffer(&self, id: TransactionId, sql: impl Into<String>) -> Result<usize> {
        let mut open = self.open();
        let txn = open.get_mut(&id).ok_or_else(|| not_found(id))?;
        if txn.state == TransactionState::Committing {
            return Err(CirrusError::new(
                ErrorCode::InvalidTransactionState,
                format!("Transaction {} is committing and cannot take more writes", id),
            )
            .with_context(ErrorContext::Transaction { id }));
        }
        txn.statements.push(sql.into());
        Ok(txn.statements.len())
    }

    /// Buffers `sql` into `id` when it is still open, otherwise into a new
    /// transaction for `identity`. Returns the transaction used.
    pub fn buffer_or_start(
        &self,
        id: Option<TransactionId>,
        identity: &EndpointIdentity,
        alias: &str,
        sql: impl Into<String>,
    ) -> Result<TransactionId> {
        let id = match id.filter(|id| self.is_open(*id)) {
            Some(id) => id,
            None => self.start(identity.clone(), alias),
        };
        self.buffer(id, sql)?;
        Ok(id)
    }

    pub fn is_open(&self, id: TransactionId) -> bool {
        self.open().contains_key(&id)
    }

    pub fn state(&self, id: TransactionId) -> Option<TransactionState> {
        self.open().get(&id).map(|t| t.state)
    }

    pub fn pending(&self, id: TransactionId) -> Result<Vec<String>> {
        self.open()
            .get(&id)
            .map(|t| t.statements.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Sends the buffer as one batch. The transaction closes only when every
    /// statement succeeded; on failure it returns to `Started` with its buffer.
    pub async fn commit(&self, id: TransactionId) -> Result<CommitOutcome> {
        let (identity, alias, statements) = {
            let mut open = self.open();
            let txn = open.get_mut(&id).ok_or_else(|| not_found(id))?;
            if txn.state == TransactionState::Committing {
                return Err(CirrusError::new(
                    ErrorCode::InvalidTransactionState,
                    format!("Transaction {} is already committing", id),
                )
                .with_context(ErrorContext::Transaction { id }));
            }
            if txn.statements.is_empty() {
                open.remove(&id);
                return Ok(CommitOutcome {
                    statements: 0,
                    changes: 0,
                });
            }
            txn.state = TransactionState::Committing;
            (txn.identity.clone(), txn.alias.clone(), txn.statements.clone())
        };

        // Puts the transaction back to `Started` on failure or when this
        // future is dropped mid-request.
        let mut guard = CommitGuard {
            manager: self,
            id,
            finished: false,
        };
        let result = self.client.execute_batch(&identity, &statements).await;
        match result {
            Ok(batch) => {
                self.open().remove(&id);
                guard.finished = true;
                let outcome = CommitOutcome {
                    statements: statements.len(),
                    changes: batch.total_changes(),
                };
                tracing::info!(
                    transaction = id,
                    alias = %alias,
                    statements = outcome.statements,
                    changes = outcome.changes,
                    "Transaction committed"
                );
                Ok(outcome)
            }
            Err(e) => {
                drop(guard);
                tracing::error!(transaction = id, alias = %alias, error = %e, "Commit failed");
                Err(e)
            }
        }
    }

    /// Discards the buffer without contacting the remote. Returns how many statements were dropped.
    pub fn rollback(&self, id: TransactionId) -> Result<usize> {
        let mut open = self.open();
        match open.get(&id).map(|t| t.state) {
            None => Err(not_found(id)),
            Some(TransactionState::Committing) => Err(CirrusError::new(
                ErrorCode::InvalidTransactionState,
                format!("Transaction {} is committing and cannot be rolled back", id),
            )
            .with_context(ErrorContext::Transaction { id })),
            Some(TransactionState::Started) => {
                let dropped = open.remove(&id).map_or(0, |t| t.statements.len());
                tracing::debug!(transaction = id, dropped, "Transaction rolled back");
                Ok(dropped)
            }
        }
    }

    /// Runs `sql` immediately against the transaction's database, ignoring the buffer.
    pub async fn execute_read(&self, id: TransactionId, sql: &str) -> Result<QueryResult> {
        let identity = self
            .open()
            .get(&id)
            .map(|t| t.identity.clone())
            .ok_or_else(|| not_found(id))?;
        self.client.execute(&identity, sql).await
    }
}

struct CommitGuard<'a> {
    manager: &'a TransactionManager,
    id: TransactionId,
    finished: bool,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(txn) = self.manager.open().get_mut(&self.id) {
            txn.state = TransactionState::Started;
        }
    }
}

fn not_found(id: TransactionId) -> CirrusError {
    CirrusError::new(
        ErrorCode::TransactionNotFound,
        format!("No open transaction {}", id),
    )
    .with_context(ErrorContext::Transaction { id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_connectors::sources::HttpTransport;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(server: &MockServer) -> Arc<TransactionManager> {
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let client = D1Client::new(Arc::new(transport), &server.uri(), 100).unwrap();
        Arc::new(TransactionManager::new(Arc::new(client)))
    }

    fn identity() -> EndpointIdentity {
        EndpointIdentity::new("acct", "tok").with_target("db-1")
    }

    fn ok_statement(changes: u64) -> serde_json::Value {
        json!({"results": [], "success": true, "meta": {"changes": changes}})
    }

    #[tokio::test]
    async fn test_commit_sends_one_batch_and_closes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({"batch": [
                {"sql": "INSERT INTO t VALUES (1)"},
                {"sql": "UPDATE t SET v = 2"}
            ]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [ok_statement(1), ok_statement(3)]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager(&server);
        let id = manager.start(identity(), "demo");
        manager.buffer(id, "INSERT INTO t VALUES (1)").unwrap();
        assert_eq!(manager.buffer(id, "UPDATE t SET v = 2").unwrap(), 2);
        assert!(server.received_requests().await.unwrap().is_empty());

        let outcome = manager.commit(id).await.unwrap();
        assert_eq!(
            outcome,
            CommitOutcome {
                statements: 2,
                changes: 4
            }
        );
        assert!(!manager.is_open(id));
    }

    #[tokio::test]
    async fn test_failed_statement_keeps_buffer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [
                    ok_statement(1),
                    {"results": [], "success": false, "error": "UNIQUE constraint failed: t.id"},
                    ok_statement(1)
                ]
            })))
            .mount(&server)
            .await;

        let manager = manager(&server);
        let id = manager.start(identity(), "demo");
        for sql in ["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (2)"] {
            manager.buffer(id, sql).unwrap();
        }

        let err = manager.commit(id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::StatementFailed);
        assert!(err.message.starts_with("Statement 2 of 3 failed"));
        assert_eq!(manager.state(id), Some(TransactionState::Started));
        assert_eq!(manager.pending(id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_batch_level_failure_keeps_buffer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let manager = manager(&server);
        let id = manager.start(identity(), "demo");
        manager.buffer(id, "DELETE FROM t").unwrap();
        let err = manager.commit(id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::HttpStatus);
        assert!(err.message.starts_with("Batch commit failed: HTTP 503"));
        assert_eq!(manager.pending(id).unwrap(), vec!["DELETE FROM t"]);
    }

    #[tokio::test]
    async fn test_rollback_and_empty_commit_send_nothing() {
        let server = MockServer::start().await;
        let manager = manager(&server);

        let id = manager.start(identity(), "demo");
        manager.buffer(id, "DELETE FROM t").unwrap();
        assert_eq!(manager.rollback(id).unwrap(), 1);
        assert_eq!(manager.rollback(id).unwrap_err().code, ErrorCode::TransactionNotFound);

        let empty = manager.start(identity(), "demo");
        assert_eq!(manager.commit(empty).await.unwrap().statements, 0);
        assert!(!manager.is_open(empty));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_buffer_or_start_auto_starts() {
        let server = MockServer::start().await;
        let manager = manager(&server);

        let id = manager
            .buffer_or_start(None, &identity(), "demo", "INSERT INTO t VALUES (1)")
            .unwrap();
        let same = manager
            .buffer_or_start(Some(id), &identity(), "demo", "INSERT INTO t VALUES (2)")
            .unwrap();
        assert_eq!(id, same);
        assert_eq!(manager.pending(id).unwrap().len(), 2);

        manager.rollback(id).unwrap();
        let fresh = manager
            .buffer_or_start(Some(id), &identity(), "demo", "INSERT INTO t VALUES (3)")
            .unwrap();
        assert_ne!(fresh, id);
    }

    #[tokio::test]
    async fn test_writes_rejected_while_committing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true, "result": [ok_statement(1)]}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let manager = manager(&server);
        let id = manager.start(identity(), "demo");
        manager.buffer(id, "INSERT INTO t VALUES (1)").unwrap();

        let committing = Arc::clone(&manager);
        let commit = tokio::spawn(async move { committing.commit(id).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.state(id), Some(TransactionState::Committing));
        let err = manager.buffer(id, "INSERT INTO t VALUES (2)").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransactionState);

        commit.await.unwrap().unwrap();
        assert!(!manager.is_open(id));
    }

    #[tokio::test]
    async fn test_cancelled_commit_reopens_the_transaction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true, "result": [ok_statement(1)]}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let manager = manager(&server);
        let id = manager.start(identity(), "demo");
        manager.buffer(id, "INSERT INTO t VALUES (1)").unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(100), manager.commit(id)).await;
        assert!(timed_out.is_err());
        assert_eq!(manager.state(id), Some(TransactionState::Started));
        assert_eq!(manager.pending(id).unwrap().len(), 1);
        assert_eq!(manager.rollback(id).unwrap(), 1);
        assert!(!manager.is_open(id));
    }

    #[tokio::test]
    async fn test_reads_bypass_the_buffer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"sql": "SELECT COUNT(*) AS n FROM t"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [{"results": [{"n": 0}]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager(&server);
        let id = manager.start(identity(), "demo");
        manager.buffer(id, "INSERT INTO t VALUES (1)").unwrap();
        let result = manager
            .execute_read(id, "SELECT COUNT(*) AS n FROM t")
            .await
            .unwrap();
        // The buffered insert has not been sent yet
        assert_eq!(result.value(0, "n"), Some("0"));
        assert_eq!(manager.pending(id).unwrap().len(), 1);
    }
}
