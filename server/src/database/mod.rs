//! Asynchronous database pipeline
//!
//! Persistence work runs on a pool of worker threads, each owning exactly
//! one connection. Requests carry a continuation; when a worker finishes
//! it pushes the continuation and the result onto a result queue, and the
//! simulation thread runs the continuations when it calls
//! [`Database::poll`]. Continuations therefore see the game context
//! mutably without any locking.
//!
//! A worker that loses its connection reconnects with a fixed backoff and
//! replays the interrupted request, so callers only see failures of the
//! statements themselves.

pub mod sqlite;
pub mod statement;
pub mod value;

pub use sqlite::SqliteConnector;
pub use statement::{StatementRegistry, Transaction, TransactionPlan, TransactionResult};
pub use value::{QueryResult, Row, Value};

use crate::error::DbError;
use crossbeam_channel::{self as channel, RecvTimeoutError, TrySendError};
use log::{debug, error, info, warn};
use statement::TransactionStatement;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper bound on statements a transaction may grow to through hooks.
const MAX_TRANSACTION_STATEMENTS: usize = 1024;

/// Transaction control statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Begin,
    Commit,
    Rollback,
}

/// A live backend connection, owned by one worker thread.
pub trait Connection: Send {
    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), DbError>;
    fn execute(&mut self, name: &str, params: &[Value]) -> Result<QueryResult, DbError>;
    fn control(&mut self, control: Control) -> Result<QueryResult, DbError>;
    fn ping(&mut self) -> bool;
}

/// Opens connections for the workers.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self) -> Result<Self::Connection, DbError>;
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub reconnect_backoff: Duration,
    /// Idle time after which a worker checks that its connection is alive.
    pub ping_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1024,
            reconnect_backoff: Duration::from_secs(1),
            ping_interval: Duration::from_secs(10),
        }
    }
}

type QueryContinuation<C> = Box<dyn FnOnce(&mut C, QueryResult) + Send>;
type TransactionContinuation<C> = Box<dyn FnOnce(&mut C, TransactionResult) + Send>;

enum Request<C> {
    Query {
        name: String,
        params: Vec<Value>,
        continuation: QueryContinuation<C>,
    },
    Transaction {
        transaction: Transaction,
        continuation: TransactionContinuation<C>,
    },
}

enum Completion<C> {
    Query(QueryContinuation<C>, QueryResult),
    Transaction(TransactionContinuation<C>, TransactionResult),
}

impl<C> Request<C> {
    fn fail(self, error: DbError) -> Completion<C> {
        match self {
            Request::Query { continuation, .. } => Completion::Query(continuation, QueryResult::failed(error)),
            Request::Transaction { continuation, .. } => {
                Completion::Transaction(continuation, TransactionResult::failed(error))
            }
        }
    }
}

/// Counters shared between the pipeline owner, handles and workers.
struct PipelineState {
    workers: usize,
    outstanding: AtomicUsize,
    connected: AtomicUsize,
    stopping: AtomicBool,
}

/// Cloneable front end for submitting work.
pub struct DatabaseHandle<C> {
    requests: channel::Sender<Request<C>>,
    results: channel::Sender<Completion<C>>,
    state: Arc<PipelineState>,
}

impl<C> Clone for DatabaseHandle<C> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            results: self.results.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<C: 'static> DatabaseHandle<C> {
    fn submit(&self, request: Request<C>) {
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);
        let rejected = match self.requests.try_send(request) {
            Ok(()) => return,
            Err(TrySendError::Full(request)) => {
                warn!("Database request queue full");
                request.fail(DbError::Overloaded)
            }
            Err(TrySendError::Disconnected(request)) => request.fail(DbError::Stopped),
        };
        // Still delivered through poll so continuations always run on the
        // simulation thread.
        if self.results.send(rejected).is_err() {
            self.state.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Runs one registered statement; `continuation` receives the result on
    /// the polling thread.
    pub fn execute<F>(&self, name: &str, params: Vec<Value>, continuation: F)
    where
        F: FnOnce(&mut C, QueryResult) + Send + 'static,
    {
        self.submit(Request::Query {
            name: name.to_string(),
            params,
            continuation: Box::new(continuation),
        });
    }

    /// Runs `transaction` atomically.
    pub fn execute_transaction<F>(&self, transaction: Transaction, continuation: F)
    where
        F: FnOnce(&mut C, TransactionResult) + Send + 'static,
    {
        self.submit(Request::Transaction {
            transaction,
            continuation: Box::new(continuation),
        });
    }
}

/// Owner side of the worker pool.
pub struct Database<C> {
    handle: DatabaseHandle<C>,
    results: channel::Receiver<Completion<C>>,
    workers: Vec<JoinHandle<()>>,
}

impl<C: 'static> Database<C> {
    /// Spawns the workers. Connections are opened on the worker threads; use
    /// [`Database::is_idle`] to wait for them.
    pub fn start<K: Connector>(
        connector: K,
        statements: StatementRegistry,
        config: DatabaseConfig,
    ) -> Result<Self, DbError> {
        let worker_count = config.workers.max(1);
        let (request_tx, request_rx) = channel::bounded(config.queue_capacity);
        let (result_tx, result_rx) = channel::unbounded();
        let state = Arc::new(PipelineState {
            workers: worker_count,
            outstanding: AtomicUsize::new(0),
            connected: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
        });
        let connector = Arc::new(connector);
        let statements = Arc::new(statements);

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker = Worker {
                index,
                connector: Arc::clone(&connector),
                statements: Arc::clone(&statements),
                requests: request_rx.clone(),
                results: result_tx.clone(),
                state: Arc::clone(&state),
                backoff: config.reconnect_backoff,
                ping_interval: config.ping_interval,
            };
            let spawned = std::thread::Builder::new()
                .name(format!("db-worker-{}", index))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    state.stopping.store(true, Ordering::SeqCst);
                    return Err(DbError::Spawn(e.to_string()));
                }
            }
        }
        info!("Database pipeline started with {} workers", worker_count);

        Ok(Self {
            handle: DatabaseHandle {
                requests: request_tx,
                results: result_tx,
                state,
            },
            results: result_rx,
            workers,
        })
    }

    pub fn handle(&self) -> DatabaseHandle<C> {
        self.handle.clone()
    }

    /// Runs the continuations of every result completed so far on the
    /// calling thread. Returns how many ran.
    pub fn poll(&self, ctx: &mut C) -> usize {
        let ready = self.results.len();
        let mut processed = 0;
        for _ in 0..ready {
            let Ok(completion) = self.results.try_recv() else {
                break;
            };
            match completion {
                Completion::Query(continuation, result) => continuation(ctx, result),
                Completion::Transaction(continuation, result) => continuation(ctx, result),
            }
            self.handle.state.outstanding.fetch_sub(1, Ordering::SeqCst);
            processed += 1;
        }
        processed
    }

    /// True when no request is outstanding and every worker holds a live
    /// connection.
    pub fn is_idle(&self) -> bool {
        let state = &self.handle.state;
        state.outstanding.load(Ordering::SeqCst) == 0 && state.connected.load(Ordering::SeqCst) == state.workers
    }

    /// Polls until the pipeline is idle or `timeout` elapses.
    pub fn wait_idle(&self, ctx: &mut C, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll(ctx);
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.handle.state.outstanding.load(Ordering::SeqCst)
    }

    pub fn connected_workers(&self) -> usize {
        self.handle.state.connected.load(Ordering::SeqCst)
    }
}

impl<C> Drop for Database<C> {
    fn drop(&mut self) {
        self.handle.state.stopping.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Database worker panicked");
            }
        }
    }
}

struct Worker<K: Connector, C> {
    index: usize,
    connector: Arc<K>,
    statements: Arc<StatementRegistry>,
    requests: channel::Receiver<Request<C>>,
    results: channel::Sender<Completion<C>>,
    state: Arc<PipelineState>,
    backoff: Duration,
    ping_interval: Duration,
}

impl<K: Connector, C> Worker<K, C> {
    fn stopping(&self) -> bool {
        self.state.stopping.load(Ordering::SeqCst)
    }

    fn open(&self) -> Result<K::Connection, DbError> {
        let mut conn = self.connector.connect()?;
        for (name, sql) in self.statements.iter() {
            conn.prepare(name, sql)?;
        }
        Ok(conn)
    }

    /// Blocks until a connection is established. `None` on shutdown.
    fn connect(&self) -> Option<K::Connection> {
        let mut failures = 0u32;
        loop {
            if self.stopping() {
                return None;
            }
            match self.open() {
                Ok(conn) => {
                    if failures > 0 {
                        info!(
                            "Database worker {} connected after {} failed attempts",
                            self.index, failures
                        );
                    } else {
                        debug!("Database worker {} connected", self.index);
                    }
                    self.state.connected.fetch_add(1, Ordering::SeqCst);
                    return Some(conn);
                }
                Err(e) => {
                    if failures == 0 {
                        warn!(
                            "Database worker {} cannot connect: {}; retrying every {:?}",
                            self.index, e, self.backoff
                        );
                    }
                    failures += 1;
                    std::thread::sleep(self.backoff);
                }
            }
        }
    }

    fn disconnected(&self, reason: &DbError) {
        error!("Database worker {} lost its connection: {}", self.index, reason);
        self.state.connected.fetch_sub(1, Ordering::SeqCst);
    }

    fn run(self) {
        let Some(mut conn) = self.connect() else {
            return;
        };
        let mut last_activity = Instant::now();

        loop {
            let request = match self.requests.recv_timeout(Duration::from_millis(50)) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => {
                    if self.stopping() {
                        break;
                    }
                    if last_activity.elapsed() >= self.ping_interval {
                        last_activity = Instant::now();
                        if !conn.ping() {
                            self.disconnected(&DbError::ConnectionLost("ping failed".to_string()));
                            match self.connect() {
                                Some(fresh) => conn = fresh,
                                None => return,
                            }
                        }
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let completion = loop {
                match execute_request(&mut conn, &request) {
                    Ok(completion) => break Some(completion),
                    Err(lost) => {
                        self.disconnected(&lost);
                        match self.connect() {
                            Some(fresh) => conn = fresh,
                            None => break None,
                        }
                    }
                }
            };
            last_activity = Instant::now();

            let Some(outcome) = completion else {
                // Stopped while reconnecting; the connection is already counted as lost.
                let _ = self.results.send(request.fail(DbError::Stopped));
                return;
            };
            if self.results.send(outcome.into_completion(request)).is_err() {
                break;
            }
        }
        self.state.connected.fetch_sub(1, Ordering::SeqCst);
        debug!("Database worker {} stopped", self.index);
    }
}

/// What a worker produced for one request, before the continuation is
/// attached.
enum Outcome {
    Query(QueryResult),
    Transaction(TransactionResult),
}

impl Outcome {
    fn into_completion<C>(self, request: Request<C>) -> Completion<C> {
        match (self, request) {
            (Outcome::Query(result), Request::Query { continuation, .. }) => Completion::Query(continuation, result),
            (Outcome::Transaction(result), Request::Transaction { continuation, .. }) => {
                Completion::Transaction(continuation, result)
            }
            (_, request) => request.fail(DbError::Statement("mismatched request".to_string())),
        }
    }
}

/// Runs a request. `Err` only for a lost connection, in which case the
/// request is replayed on a fresh connection.
fn execute_request<N: Connection + ?Sized, C>(conn: &mut N, request: &Request<C>) -> Result<Outcome, DbError> {
    match request {
        Request::Query { name, params, .. } => match conn.execute(name, params) {
            Ok(result) => Ok(Outcome::Query(result)),
            Err(lost @ DbError::ConnectionLost(_)) => Err(lost),
            Err(e) => {
                debug!("Statement {} failed: {}", name, e);
                Ok(Outcome::Query(QueryResult::failed(e)))
            }
        },
        Request::Transaction { transaction, .. } => run_transaction(conn, transaction).map(Outcome::Transaction),
    }
}

fn run_control<N: Connection + ?Sized>(conn: &mut N, control: Control) -> Result<QueryResult, DbError> {
    match conn.control(control) {
        Ok(result) => Ok(result),
        Err(lost @ DbError::ConnectionLost(_)) => Err(lost),
        Err(e) => Ok(QueryResult::failed(e)),
    }
}

/// Executes a transaction: BEGIN, each statement (plus hook-appended ones)
/// in order, then COMMIT, or ROLLBACK at the first failure.
pub(crate) fn run_transaction<N: Connection + ?Sized>(
    conn: &mut N,
    transaction: &Transaction,
) -> Result<TransactionResult, DbError> {
    let begin = run_control(conn, Control::Begin)?;
    if let Some(error) = begin.error.clone() {
        // Nothing to roll back; the closing entry carries the same error.
        return Ok(TransactionResult {
            results: vec![begin, QueryResult::failed(error)],
            committed: false,
        });
    }
    let mut results = vec![begin];

    let mut queue: VecDeque<TransactionStatement> = transaction.statements().iter().cloned().collect();
    let mut executed = 0;
    let mut failed = false;
    while let Some(statement) = queue.pop_front() {
        executed += 1;
        let mut result = match conn.execute(&statement.name, &statement.params) {
            Ok(result) => result,
            Err(lost @ DbError::ConnectionLost(_)) => return Err(lost),
            Err(e) => QueryResult::failed(e),
        };

        if result.is_valid() {
            if let Some(hook) = &statement.hook {
                let mut plan = TransactionPlan::default();
                match hook(&result, &mut plan) {
                    Ok(()) => queue.extend(plan.into_statements()),
                    Err(e) => result.error = Some(e),
                }
            }
            if executed + queue.len() > MAX_TRANSACTION_STATEMENTS {
                result.error = Some(DbError::Hook(format!(
                    "transaction grew past {} statements",
                    MAX_TRANSACTION_STATEMENTS
                )));
            }
        }

        let ok = result.is_valid();
        results.push(result);
        if !ok {
            failed = true;
            break;
        }
    }

    if failed {
        results.push(run_control(conn, Control::Rollback)?);
        return Ok(TransactionResult {
            results,
            committed: false,
        });
    }

    let commit = run_control(conn, Control::Commit)?;
    let committed = commit.is_valid();
    results.push(commit);
    if !committed {
        // A failed COMMIT leaves the transaction open.
        let _ = conn.control(Control::Rollback);
    }
    Ok(TransactionResult { results, committed })
}
