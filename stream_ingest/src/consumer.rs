//! The entry point invoked by the host scheduler.
use std::sync::Arc;

use tracing::{debug, error, info};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    lease::StepOutcome,
    pool::{ConsumerPool, PoolConfig, PoolStats},
    reader::ReaderFactory,
    session::OutputSession,
};

/// What the host should do before triggering the consumer again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Trigger again as soon as a worker is free.
    Processed,
    /// Back off before the next trigger: no reader was available, the reader failed, or the
    /// reader group signalled teardown.
    Yield,
}

/// Consumes a stream through a lazily created [`ConsumerPool`].
///
/// Any number of worker threads may call [`on_trigger`](Self::on_trigger) concurrently; each call
/// holds at most one lease for its duration.
#[derive(Debug)]
pub struct StreamConsumer {
    config: PoolConfig,
    factory: Arc<dyn ReaderFactory>,
    pool: Mutex<Option<Arc<ConsumerPool>>>,
    /// Cancelled while the consumer is not scheduled. Replaced with a fresh token on every
    /// schedule so triggers from an earlier schedule keep seeing their cancellation.
    scheduled: Mutex<CancellationToken>,
}

impl StreamConsumer {
    /// Create a consumer. It starts out unscheduled.
    pub fn new(config: PoolConfig, factory: Arc<dyn ReaderFactory>) -> Self {
        let scheduled = CancellationToken::new();
        scheduled.cancel();
        Self {
            config,
            factory,
            pool: Mutex::new(None),
            scheduled: Mutex::new(scheduled),
        }
    }

    pub fn on_scheduled(&self) {
        let mut scheduled = self.scheduled.lock();
        if scheduled.is_cancelled() {
            *scheduled = CancellationToken::new();
            info!("stream consumer scheduled");
        }
    }

    /// Ask running triggers to stop. They notice between reads.
    pub fn on_unscheduled(&self) {
        self.scheduled.lock().cancel();
        info!("stream consumer unscheduled");
    }

    pub fn is_scheduled(&self) -> bool {
        !self.scheduled.lock().is_cancelled()
    }

    /// Run one lease for as long as the consumer stays scheduled.
    ///
    /// The lease is released back to the pool on every path out of this method. Errors are
    /// logged here; the lease has already poisoned itself, so its reader is replaced on a later
    /// trigger.
    pub fn on_trigger<S: OutputSession>(&self, session: S) -> TriggerOutcome {
        let pool = self.get_or_create_pool();
        let scheduled = self.scheduled.lock().clone();

        let mut lease = match pool.obtain(session) {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!("no reader lease available, yielding");
                return TriggerOutcome::Yield;
            }
            Err(e) => {
                error!(error = %e, "unable to obtain a reader lease");
                return TriggerOutcome::Yield;
            }
        };

        let outcome = loop {
            if scheduled.is_cancelled() {
                break TriggerOutcome::Processed;
            }
            match lease.run_until_checkpoint(|| !scheduled.is_cancelled()) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Stop) => break TriggerOutcome::Yield,
                Err(e) => {
                    error!(
                        reader_id = %lease.reader_id(),
                        error = %e,
                        "error while reading from stream, closing the lease"
                    );
                    break TriggerOutcome::Yield;
                }
            }
        };
        pool.release(lease);
        outcome
    }

    /// Close the pool. The next trigger starts over with a new one.
    pub fn on_stopped(&self) {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.close();
        }
    }

    /// Statistics of the current pool, if one has been created.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.lock().as_ref().map(|pool| pool.stats())
    }

    fn get_or_create_pool(&self) -> Arc<ConsumerPool> {
        let mut guard = self.pool.lock();
        let pool = guard.get_or_insert_with(|| {
            Arc::new(ConsumerPool::new(
                Arc::clone(&self.factory),
                self.config.clone(),
            ))
        });
        Arc::clone(pool)
    }
}
