//! Statement recording and fault injection around any [`DatabasePool`]
//!
//! Every statement and query passing through an [`InstrumentedPool`] is
//! appended to a shared log before it reaches the real database. Tests can
//! make matching statements fail, hold a session right after a matching
//! statement ran, or make the pool refuse new sessions altogether.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use strata_migrate::{
    DatabaseConnection, DatabaseError, DatabasePool, DatabaseTransaction, DatabaseValue,
    SqlDialect, SqlExecutor,
};
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

struct InjectedFailure {
    fragment: String,
    error: DatabaseError,
    /// `None` fails every match
    remaining: Option<usize>,
}

#[derive(Default)]
struct Recorder {
    statements: Mutex<Vec<String>>,
    failures: Mutex<Vec<InjectedFailure>>,
    gates: Mutex<Vec<(String, StatementGate)>>,
    unavailable: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared log and fault plan. Clones share state.
#[derive(Clone, Default)]
pub struct Instrumentation {
    recorder: Arc<Recorder>,
}

impl Instrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `pool` so its sessions report to this instrumentation
    pub fn wrap(&self, pool: Arc<dyn DatabasePool>) -> InstrumentedPool {
        InstrumentedPool {
            inner: pool,
            instrumentation: self.clone(),
        }
    }

    /// Every statement and query seen so far, in order
    pub fn statement_log(&self) -> Vec<String> {
        lock(&self.recorder.statements).clone()
    }

    /// Number of logged statements containing `fragment`
    pub fn executed_count(&self, fragment: &str) -> usize {
        lock(&self.recorder.statements)
            .iter()
            .filter(|statement| statement.contains(fragment))
            .count()
    }

    pub fn clear_statement_log(&self) {
        lock(&self.recorder.statements).clear();
    }

    /// Fail every statement containing `fragment` until cleared
    pub fn fail_statements_containing(&self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        let error = DatabaseError::Query(format!("injected failure for '{}'", fragment));
        lock(&self.recorder.failures).push(InjectedFailure {
            fragment,
            error,
            remaining: None,
        });
    }

    /// Fail only the next statement containing `fragment`, with `error`
    pub fn fail_next_statement_containing(&self, fragment: impl Into<String>, error: DatabaseError) {
        lock(&self.recorder.failures).push(InjectedFailure {
            fragment: fragment.into(),
            error,
            remaining: Some(1),
        });
    }

    pub fn clear_failures(&self) {
        lock(&self.recorder.failures).clear();
    }

    /// Hold the session that next runs a statement containing `fragment`,
    /// after the statement succeeded, until the returned gate is opened
    pub fn pause_after(&self, fragment: impl Into<String>) -> StatementGate {
        let gate = StatementGate::new();
        lock(&self.recorder.gates).push((fragment.into(), gate.clone()));
        gate
    }

    /// Refuse new sessions as if the server were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.recorder.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn is_unavailable(&self) -> bool {
        self.recorder.unavailable.load(Ordering::SeqCst)
    }

    /// Log `sql` and return the failure planned for it, if any
    fn intercept(&self, sql: &str) -> Result<(), DatabaseError> {
        lock(&self.recorder.statements).push(sql.to_string());

        let mut failures = lock(&self.recorder.failures);
        let Some(index) = failures.iter().position(|f| sql.contains(&f.fragment)) else {
            return Ok(());
        };

        let failure = &mut failures[index];
        let error = failure.error.clone();
        let exhausted = match failure.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            failures.remove(index);
        }

        debug!("Injecting failure into: {}", sql);
        Err(error)
    }

    async fn after_success(&self, sql: &str) {
        let gate = {
            let mut gates = lock(&self.recorder.gates);
            gates
                .iter()
                .position(|(fragment, _)| sql.contains(fragment.as_str()))
                .map(|index| gates.remove(index).1)
        };

        if let Some(gate) = gate {
            gate.hold().await;
        }
    }

    async fn execute<E>(&self, executor: &mut E, sql: &str, params: &[DatabaseValue]) -> Result<u64, DatabaseError>
    where
        E: SqlExecutor + ?Sized,
    {
        self.intercept(sql)?;
        let affected = executor.execute(sql, params).await?;
        self.after_success(sql).await;
        Ok(affected)
    }

    async fn fetch_scalar<E>(
        &self,
        executor: &mut E,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<Option<DatabaseValue>, DatabaseError>
    where
        E: SqlExecutor + ?Sized,
    {
        self.intercept(sql)?;
        let value = executor.fetch_scalar(sql, params).await?;
        self.after_success(sql).await;
        Ok(value)
    }
}

struct GateState {
    reached: Notify,
    release: Semaphore,
}

/// Rendezvous point between a paused session and the test driving it
#[derive(Clone)]
pub struct StatementGate {
    state: Arc<GateState>,
}

impl StatementGate {
    fn new() -> Self {
        Self {
            state: Arc::new(GateState {
                reached: Notify::new(),
                release: Semaphore::new(0),
            }),
        }
    }

    /// Wait until a session is held at this gate
    pub async fn reached(&self) {
        self.state.reached.notified().await;
    }

    /// Let the held session, and any later one, continue
    pub fn open(&self) {
        self.state.release.close();
    }

    async fn hold(&self) {
        self.state.reached.notify_one();
        // Only ever closed, never given permits: an error means open.
        let _ = self.state.release.acquire().await;
    }
}

/// Pool whose sessions report to an [`Instrumentation`]
#[derive(Clone)]
pub struct InstrumentedPool {
    inner: Arc<dyn DatabasePool>,
    instrumentation: Instrumentation,
}

#[async_trait]
impl DatabasePool for InstrumentedPool {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>, DatabaseError> {
        if self.instrumentation.is_unavailable() {
            return Err(DatabaseError::Connection(
                "database unavailable (simulated)".to_string(),
            ));
        }

        let inner = self.inner.acquire().await?;
        Ok(Box::new(InstrumentedConnection {
            inner,
            instrumentation: self.instrumentation.clone(),
        }))
    }

    fn dialect(&self) -> SqlDialect {
        self.inner.dialect()
    }
}

pub struct InstrumentedConnection {
    inner: Box<dyn DatabaseConnection>,
    instrumentation: Instrumentation,
}

#[async_trait]
impl SqlExecutor for InstrumentedConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<u64, DatabaseError> {
        self.instrumentation
            .execute(self.inner.as_mut(), sql, params)
            .await
    }

    async fn fetch_scalar(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<Option<DatabaseValue>, DatabaseError> {
        self.instrumentation
            .fetch_scalar(self.inner.as_mut(), sql, params)
            .await
    }
}

#[async_trait]
impl DatabaseConnection for InstrumentedConnection {
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn DatabaseTransaction + 'a>, DatabaseError> {
        let inner = self.inner.begin().await?;
        Ok(Box::new(InstrumentedTransaction {
            inner,
            instrumentation: self.instrumentation.clone(),
        }))
    }
}

pub struct InstrumentedTransaction<'a> {
    inner: Box<dyn DatabaseTransaction + 'a>,
    instrumentation: Instrumentation,
}

#[async_trait]
impl<'a> SqlExecutor for InstrumentedTransaction<'a> {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<u64, DatabaseError> {
        self.instrumentation
            .execute(self.inner.as_mut(), sql, params)
            .await
    }

    async fn fetch_scalar(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<Option<DatabaseValue>, DatabaseError> {
        self.instrumentation
            .fetch_scalar(self.inner.as_mut(), sql, params)
            .await
    }
}

#[async_trait]
impl<'a> DatabaseTransaction for InstrumentedTransaction<'a> {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.inner.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Pool whose sessions accept everything and remember nothing
    struct NullPool;

    struct NullConnection;

    #[async_trait]
    impl SqlExecutor for NullConnection {
        async fn execute(&mut self, _sql: &str, _params: &[DatabaseValue]) -> Result<u64, DatabaseError> {
            Ok(0)
        }

        async fn fetch_scalar(
            &mut self,
            _sql: &str,
            _params: &[DatabaseValue],
        ) -> Result<Option<DatabaseValue>, DatabaseError> {
            Ok(None)
        }
    }

    #[async_trait]
    impl DatabaseConnection for NullConnection {
        async fn begin<'a>(&'a mut self) -> Result<Box<dyn DatabaseTransaction + 'a>, DatabaseError> {
            Err(DatabaseError::Query("no transactions here".to_string()))
        }
    }

    #[async_trait]
    impl DatabasePool for NullPool {
        async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>, DatabaseError> {
            Ok(Box::new(NullConnection))
        }

        fn dialect(&self) -> SqlDialect {
            SqlDialect::SQLite
        }
    }

    fn wrapped() -> (Instrumentation, InstrumentedPool) {
        let instrumentation = Instrumentation::new();
        let pool = instrumentation.wrap(Arc::new(NullPool));
        (instrumentation, pool)
    }

    #[tokio::test]
    async fn test_statements_are_logged_in_order() {
        let (instrumentation, pool) = wrapped();
        let mut conn = pool.acquire().await.unwrap();

        conn.execute("CREATE TABLE foo (id int)", &[]).await.unwrap();
        conn.fetch_scalar("SELECT MAX(id) FROM foo", &[]).await.unwrap();

        assert_eq!(
            instrumentation.statement_log(),
            vec!["CREATE TABLE foo (id int)", "SELECT MAX(id) FROM foo"]
        );
        assert_eq!(instrumentation.executed_count("foo"), 2);

        instrumentation.clear_statement_log();
        assert!(instrumentation.statement_log().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_and_one_shot_failures() {
        let (instrumentation, pool) = wrapped();
        let mut conn = pool.acquire().await.unwrap();

        instrumentation.fail_statements_containing("DROP");
        instrumentation.fail_next_statement_containing(
            "CREATE",
            DatabaseError::UniqueViolation("pg_type_typname_nsp_index".to_string()),
        );

        assert!(matches!(
            conn.execute("CREATE TABLE foo (id int)", &[]).await,
            Err(DatabaseError::UniqueViolation(_))
        ));
        assert!(conn.execute("CREATE TABLE foo (id int)", &[]).await.is_ok());
        assert!(conn.execute("DROP TABLE foo", &[]).await.is_err());
        assert!(conn.execute("DROP TABLE foo", &[]).await.is_err());

        instrumentation.clear_failures();
        assert!(conn.execute("DROP TABLE foo", &[]).await.is_ok());
        assert_eq!(instrumentation.executed_count("DROP TABLE foo"), 3);
    }

    #[tokio::test]
    async fn test_unavailable_pool_refuses_sessions() {
        let (instrumentation, pool) = wrapped();

        instrumentation.set_unavailable(true);
        assert!(matches!(pool.acquire().await, Err(DatabaseError::Connection(_))));

        instrumentation.set_unavailable(false);
        assert!(pool.acquire().await.is_ok());
        assert_eq!(pool.dialect(), SqlDialect::SQLite);
    }

    #[tokio::test]
    async fn test_gate_holds_session_until_opened() {
        let (instrumentation, pool) = wrapped();
        let gate = instrumentation.pause_after("ADD COLUMN");

        let held = tokio::spawn(async move {
            let mut conn = pool.acquire().await.unwrap();
            conn.execute("ALTER TABLE foo ADD COLUMN bar int", &[]).await
        });

        gate.reached().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!held.is_finished());

        gate.open();
        assert!(held.await.unwrap().is_ok());
    }
}
