// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// FIFO print queue with a single worker.
//
// Each job gets the full delivery retry budget.  A job that still fails goes
// to the back of the queue with its retry count bumped, until the ceiling is
// passed and it is dropped.  Extra copies are printed after the first one
// succeeds, each on a best-effort basis.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use receiptlink_bridge::SettingsStore;
use receiptlink_core::error::{ReceiptError, Result, classify_error};
use receiptlink_core::{ErrorClass, JobId, Order, PrintJob, PrinterConfig};

use crate::delivery::Delivery;

/// Times a failed job is put back before it is dropped.
pub const MAX_REQUEUES: u32 = 3;

struct Queued {
    order: Order,
    job: PrintJob,
}

/// Counters for what the worker has done so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

pub struct PrintQueue {
    delivery: Arc<Delivery>,
    settings: Arc<dyn SettingsStore>,
    jobs: Mutex<VecDeque<Queued>>,
    wake: Notify,
    delivered: AtomicUsize,
    requeued: AtomicUsize,
    dropped: AtomicUsize,
}

impl PrintQueue {
    pub fn new(delivery: Arc<Delivery>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            delivery,
            settings,
            jobs: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            delivered: AtomicUsize::new(0),
            requeued: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<Queued>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            delivered: self.delivered.load(Ordering::SeqCst),
            requeued: self.requeued.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
        }
    }

    /// Queue `order` for `config` with the printer's copy count.
    pub fn enqueue(&self, order: Order, config: PrinterConfig) -> JobId {
        let job = PrintJob::new(order.id, config);
        let id = job.id;
        debug!(job = %id, order = %order.number, copies = job.copies, "job queued");
        self.jobs().push_back(Queued { order, job });
        self.wake.notify_one();
        id
    }

    /// Queue `order` on the default printer if auto-print is on and the
    /// order has not been printed yet.
    ///
    /// Returns the queued job's id, or `None` when nothing was queued.
    pub async fn auto_print(&self, order: &Order) -> Result<Option<JobId>> {
        if !self.settings.auto_print_enabled() {
            debug!(order = %order.number, "auto-print is off");
            return Ok(None);
        }
        let config = self
            .settings
            .default_printer()
            .ok_or(ReceiptError::NoDefaultPrinter)?;
        let current = self
            .delivery
            .orders()
            .get_by_id(order.id)
            .await?
            .ok_or(ReceiptError::OrderNotFound(order.id.0))?;
        if current.printed {
            debug!(order = %order.number, "already printed, not queueing");
            return Ok(None);
        }
        Ok(Some(self.enqueue(current, config)))
    }

    /// Start the worker on the current runtime.
    pub fn spawn_worker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run(cancel).await })
    }

    /// Drain the queue until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("print queue worker started");
        loop {
            let next = self.jobs().pop_front();
            let Some(queued) = next else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.wake.notified() => {}
                }
                continue;
            };
            if !self.process(queued, &cancel).await {
                break;
            }
        }
        info!(pending = self.len(), "print queue worker stopped");
    }

    /// Deliver one job. Returns `false` when the worker should stop.
    async fn process(&self, mut queued: Queued, cancel: &CancellationToken) -> bool {
        let Queued { order, job } = &mut queued;

        match self.delivery.deliver(order, job, None, cancel).await {
            Ok(_) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                self.extra_copies(job, cancel).await;
                true
            }
            Err(ReceiptError::Cancelled) => {
                debug!(job = %job.id, "job interrupted, keeping it queued");
                self.jobs().push_front(queued);
                false
            }
            Err(e) => {
                job.retry_count += 1;
                let permanent = classify_error(&e) == ErrorClass::Permanent;
                if permanent || job.retry_count > MAX_REQUEUES {
                    self.dropped.fetch_add(1, Ordering::SeqCst);
                    error!(
                        job = %job.id,
                        order = %order.number,
                        retries = job.retry_count,
                        error = %e,
                        "dropping print job"
                    );
                } else {
                    self.requeued.fetch_add(1, Ordering::SeqCst);
                    warn!(job = %job.id, retry = job.retry_count, error = %e, "print job requeued");
                    self.jobs().push_back(queued);
                }
                true
            }
        }
    }

    async fn extra_copies(&self, job: &PrintJob, cancel: &CancellationToken) {
        let Some(markup) = job.cached_payload.as_deref() else {
            return;
        };
        for copy in 2..=job.copies {
            if let Err(e) = self.delivery.send(&job.config, markup, cancel).await {
                warn!(job = %job.id, copy, error = %e, "extra copy failed");
            }
        }
    }
}
