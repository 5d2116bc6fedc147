// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Optimistic concurrency control around [`DeltaLog::commit`].
//!
//! Each attempt reads the latest snapshot, asks the caller to prepare a
//! change against it, and tries to commit that change at the snapshot's
//! version. A conflict discards the prepared change and starts over after a
//! backoff delay. The loop is bounded by `max_retries`.

use crate::entry::{Action, Provenance};
use crate::error::DeltaLogError;
use crate::log::{CommitOutcome, ConflictScope, DeltaLog};
use crate::schema::TableId;
use crate::snapshot::Snapshot;
use backon::BackoffBuilder;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

/// Source of delays between commit attempts.
pub trait BackoffPolicy: Send + Sync + Debug {
    /// Delays for retry 1, 2, ... of one operation.
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send>;
}

/// Randomized exponential backoff.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        Box::new(
            backon::ExponentialBuilder::default()
                .with_min_delay(self.min_delay)
                .with_max_delay(self.max_delay)
                .with_jitter()
                .without_max_times()
                .build(),
        )
    }
}

/// No waiting between attempts. For tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        Box::new(std::iter::repeat(Duration::ZERO))
    }
}

/// A change prepared against one snapshot.
#[derive(Debug)]
pub struct Prepared<T> {
    /// Empty means there is nothing to commit
    pub actions: Vec<Action>,
    pub scope: ConflictScope,
    /// Returned to the caller on success, dropped on conflict
    pub payload: T,
}

impl<T> Prepared<T> {
    pub fn new(actions: Vec<Action>, scope: ConflictScope, payload: T) -> Self {
        Self {
            actions,
            scope,
            payload,
        }
    }

    pub fn nothing(payload: T) -> Self {
        Self::new(Vec::new(), ConflictScope::BlindAppend, payload)
    }
}

/// A change that made it into the log.
#[derive(Debug)]
pub struct Committed<T> {
    /// `None` when the prepared change was empty
    pub outcome: Option<CommitOutcome>,
    pub payload: T,
    /// The snapshot the successful attempt prepared against
    pub read_snapshot: Arc<Snapshot>,
    pub attempts: u32,
}

/// Retries read-prepare-commit cycles until one commits.
#[derive(Debug)]
pub struct ConcurrencyController {
    log: Arc<DeltaLog>,
    optimistic: bool,
    max_retries: u32,
    backoff: Arc<dyn BackoffPolicy>,
    /// Per-table locks used when optimistic locking is off
    table_locks: StdMutex<HashMap<TableId, Arc<Mutex<()>>>>,
}

impl ConcurrencyController {
    #[must_use]
    pub fn new(log: Arc<DeltaLog>) -> Self {
        Self {
            log,
            optimistic: true,
            max_retries: 5,
            backoff: Arc::new(ExponentialBackoff::default()),
            table_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// With `false`, writers of a table take turns behind a lock instead of
    /// racing and retrying.
    #[must_use]
    pub fn with_optimistic_lock(mut self, enabled: bool) -> Self {
        self.optimistic = enabled;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn log(&self) -> &Arc<DeltaLog> {
        &self.log
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn is_optimistic(&self) -> bool {
        self.optimistic
    }

    fn table_lock(&self, table: &TableId) -> Arc<Mutex<()>> {
        match self.table_locks.lock() {
            Ok(mut locks) => locks.entry(table.clone()).or_default().clone(),
            // A poisoned map still hands out a lock; it only guards creation
            Err(poisoned) => poisoned.into_inner().entry(table.clone()).or_default().clone(),
        }
    }

    /// Run `prepare` against the latest snapshot and commit its result,
    /// retrying on conflict.
    ///
    /// `prepare` may run several times. Anything it stages must be owned by
    /// the payload so a discarded attempt cleans up when dropped.
    pub async fn run<T, E, F, Fut>(
        &self,
        table: &TableId,
        provenance: &Provenance,
        mut prepare: F,
    ) -> Result<Committed<T>, E>
    where
        F: FnMut(Arc<Snapshot>) -> Fut,
        Fut: Future<Output = Result<Prepared<T>, E>>,
        E: From<DeltaLogError>,
    {
        let mut delays = self.backoff.delays();
        let attempts = self.max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let lock = (!self.optimistic).then(|| self.table_lock(table));
            let _serialized = match &lock {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };

            let snapshot = self.log.current_snapshot_or_empty(table).await?;
            let prepared = prepare(snapshot.clone()).await?;

            if prepared.actions.is_empty() {
                return Ok(Committed {
                    outcome: None,
                    payload: prepared.payload,
                    read_snapshot: snapshot,
                    attempts: attempt,
                });
            }

            match self
                .log
                .commit(
                    table,
                    snapshot.version(),
                    &prepared.scope,
                    prepared.actions,
                    provenance,
                )
                .await
            {
                Ok(outcome) => {
                    if attempt > 1 {
                        diagnostics::log_debug!(
                            "Commit to {table} succeeded on attempt {attempt}",
                            table: table.as_str(),
                            attempt: attempt
                        );
                    }
                    return Ok(Committed {
                        outcome: Some(outcome),
                        payload: prepared.payload,
                        read_snapshot: snapshot,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_conflict() => {
                    drop(prepared.payload);
                    let delay = delays.next().unwrap_or(Duration::ZERO);
                    diagnostics::log_warn!(
                        "Commit to {table} conflicted on attempt {attempt}, retrying in {delay_ms} ms: {error}",
                        table: table.as_str(),
                        attempt: attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string()
                    );
                    if attempt < attempts && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DeltaLogError::RetryableConflictExhausted {
            table: table.clone(),
            attempts,
        }
        .into())
    }
}
