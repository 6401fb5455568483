//! Transaction queue.
//!
//! Operations submitted before the next tick runs are coalesced into one
//! SQLite transaction. Each operation gets its own savepoint, so a failing
//! operation rolls back only its own writes and only its caller sees the
//! error. Batches run in submission order.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// One queued operation, type-erased so a batch can hold mixed results.
trait Task: Send {
    /// Run against the batch transaction. Returns false if the operation
    /// failed and its savepoint must be rolled back.
    fn run(&mut self, conn: &Connection) -> bool;

    /// Deliver the outcome. `aborted` is set when the batch transaction
    /// itself failed.
    fn finish(self: Box<Self>, aborted: Option<&str>);
}

struct Pending<T, F> {
    op: Option<F>,
    outcome: Option<Result<T>>,
    reply: oneshot::Sender<Result<T>>,
}

impl<T, F> Task for Pending<T, F>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
{
    fn run(&mut self, conn: &Connection) -> bool {
        let Some(op) = self.op.take() else {
            return false;
        };
        // A panic must not unwind through the connection lock.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| op(conn)))
            .unwrap_or_else(|payload| Err(StoreError::Panicked(panic_message(payload.as_ref()))));
        let ok = outcome.is_ok();
        self.outcome = Some(outcome);
        ok
    }

    fn finish(self: Box<Self>, aborted: Option<&str>) {
        let result = match (aborted, self.outcome) {
            (Some(reason), _) => Err(StoreError::TransactionAborted(reason.to_string())),
            (None, Some(outcome)) => outcome,
            (None, None) => Err(StoreError::TransactionAborted(
                "operation never ran".to_string(),
            )),
        };
        // The caller may have stopped waiting.
        let _ = self.reply.send(result);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Default)]
struct QueueState {
    tasks: Vec<Box<dyn Task>>,
    scheduled: bool,
}

/// A coalescing transaction queue over one connection.
#[derive(Clone)]
pub struct Queue {
    name: &'static str,
    conn: Arc<Mutex<Connection>>,
    state: Arc<Mutex<QueueState>>,
    /// Held by the running tick so batches never overlap or reorder.
    turn: Arc<tokio::sync::Mutex<()>>,
    batches: Arc<AtomicU64>,
}

impl Queue {
    pub fn new(name: &'static str, conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            name,
            conn,
            state: Arc::new(Mutex::new(QueueState::default())),
            turn: Arc::new(tokio::sync::Mutex::new(())),
            batches: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue `op` and wait for its result.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn enqueue<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let schedule = {
            let mut state = self.state.lock().map_err(StoreError::poisoned)?;
            state.tasks.push(Box::new(Pending {
                op: Some(op),
                outcome: None,
                reply,
            }));
            !std::mem::replace(&mut state.scheduled, true)
        };
        if schedule {
            tokio::spawn(self.clone().tick());
        }

        result.await.map_err(|_| {
            StoreError::TransactionAborted(format!("{} queue dropped the operation", self.name))
        })?
    }

    /// Number of batches run so far.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    async fn tick(self) {
        // Let other submissions from this turn of the runtime join the batch.
        tokio::task::yield_now().await;
        let _turn = self.turn.lock().await;

        let tasks = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.scheduled = false;
            std::mem::take(&mut state.tasks)
        };
        if tasks.is_empty() {
            return;
        }

        let batch = self.batches.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(queue = self.name, batch, operations = tasks.len(), "running batch");

        let conn = Arc::clone(&self.conn);
        if let Err(e) = tokio::task::spawn_blocking(move || run_batch(&conn, tasks)).await {
            warn!(queue = self.name, batch, error = %e, "batch task failed");
        }
    }
}

fn run_batch(conn: &Mutex<Connection>, mut tasks: Vec<Box<dyn Task>>) {
    let aborted = execute(conn, &mut tasks).err().map(|e| e.to_string());
    if let Some(reason) = &aborted {
        warn!(operations = tasks.len(), %reason, "batch transaction aborted");
    }
    for task in tasks {
        task.finish(aborted.as_deref());
    }
}

fn execute(conn: &Mutex<Connection>, tasks: &mut [Box<dyn Task>]) -> Result<()> {
    // An interrupted batch leaves no open transaction behind: the dropped
    // `Transaction` rolled it back.
    let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
    let mut tx = conn.transaction()?;
    for task in tasks.iter_mut() {
        let mut savepoint = tx.savepoint()?;
        if task.run(&savepoint) {
            savepoint.commit()?;
        } else {
            // ROLLBACK TO leaves the savepoint open, so release it too.
            savepoint.rollback()?;
            savepoint.commit()?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Queue {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE log (n INTEGER PRIMARY KEY, label TEXT NOT NULL UNIQUE);")
            .unwrap();
        Queue::new("test", Arc::new(Mutex::new(conn)))
    }

    fn append(label: &'static str) -> impl FnOnce(&Connection) -> Result<i64> + Send + 'static {
        move |conn| {
            conn.execute("INSERT INTO log (label) VALUES (?1)", [label])?;
            Ok(conn.last_insert_rowid())
        }
    }

    async fn labels(queue: &Queue) -> Vec<String> {
        queue
            .enqueue(|conn| {
                let mut stmt = conn.prepare("SELECT label FROM log ORDER BY n")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_operation() {
        let queue = queue();
        assert_eq!(queue.enqueue(append("a")).await.unwrap(), 1);
        assert_eq!(labels(&queue).await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_concurrent_operations_share_a_batch() {
        let queue = queue();
        let (a, b, c) = tokio::join!(
            queue.enqueue(append("a")),
            queue.enqueue(append("b")),
            queue.enqueue(append("c")),
        );
        let mut ids = vec![a.unwrap(), b.unwrap(), c.unwrap()];
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(queue.batches(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_operation() {
        let queue = queue();
        let (first, failed, last) = tokio::join!(
            queue.enqueue(append("a")),
            queue.enqueue(|conn: &Connection| {
                conn.execute("INSERT INTO log (label) VALUES ('x')", [])?;
                conn.execute("INSERT INTO log (label) VALUES (NULL)", [])?;
                Ok(())
            }),
            queue.enqueue(append("b")),
        );

        assert!(first.is_ok());
        assert!(matches!(failed, Err(StoreError::Database(_))));
        assert!(last.is_ok());
        assert_eq!(queue.batches(), 1);
        // The failed operation's first insert was rolled back with it.
        assert_eq!(labels(&queue).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_panicking_operation_does_not_poison_queue() {
        let queue = queue();
        let (first, panicked) = tokio::join!(
            queue.enqueue(append("a")),
            queue.enqueue(|conn: &Connection| -> Result<()> {
                conn.execute("INSERT INTO log (label) VALUES ('x')", [])?;
                panic!("operation blew up");
            }),
        );

        assert!(first.is_ok());
        match panicked {
            Err(StoreError::Panicked(message)) => assert!(message.contains("blew up")),
            other => panic!("expected a panic error, got {:?}", other),
        }
        queue.enqueue(append("b")).await.unwrap();
        assert_eq!(labels(&queue).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_batches_run_in_submission_order() {
        let queue = queue();
        queue.enqueue(append("first")).await.unwrap();
        let (second, third) = tokio::join!(
            queue.enqueue(append("second")),
            queue.enqueue(append("third")),
        );
        second.unwrap();
        third.unwrap();
        queue.enqueue(append("fourth")).await.unwrap();

        let seen = labels(&queue).await;
        assert_eq!(seen.first().map(String::as_str), Some("first"));
        assert_eq!(seen.last().map(String::as_str), Some("fourth"));
        assert_eq!(seen.len(), 4);
        assert_eq!(queue.batches(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_callers_all_complete() {
        let queue = queue();
        let handles: Vec<_> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|label| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.enqueue(append(label)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut seen = labels(&queue).await;
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }
}
