// Ordered, single-drainer delivery of cluster changes.
//
// Every change goes through one FIFO queue. The first caller that finds the
// queue idle becomes the drainer and delivers records until the queue is
// empty; concurrent or reentrant callers only append. This keeps delivery in
// enqueue order and keeps the call stack flat when listeners raise changes.
use crate::event::{ClusterChange, ClusterListener};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub struct NotificationPipeline {
    // Registration order is delivery order.
    listeners: Mutex<Vec<Arc<dyn ClusterListener>>>,
    // Read by the drain loop without holding the registration lock.
    snapshot: ArcSwap<Vec<Arc<dyn ClusterListener>>>,
    queue: Mutex<PendingChanges>,
}

#[derive(Default)]
struct PendingChanges {
    entries: VecDeque<ClusterChange>,
    // True while some thread owns the drain loop.
    processing: bool,
    // Outstanding holds; no new drainer starts while non-zero.
    held: usize,
}

impl Default for NotificationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationPipeline {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            queue: Mutex::new(PendingChanges::default()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ClusterListener>) {
        let mut listeners = self.listeners.lock();
        listeners.push(listener);
        self.rebuild_snapshot(&listeners);
    }

    /// Returns true if the listener was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn ClusterListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(index) = listeners
            .iter()
            .position(|existing| same_listener(existing, listener))
        else {
            return false;
        };
        listeners.remove(index);
        self.rebuild_snapshot(&listeners);
        true
    }

    pub fn listener_count(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Records waiting for the active drainer.
    pub fn pending(&self) -> usize {
        self.queue.lock().entries.len()
    }

    fn rebuild_snapshot(&self, listeners: &[Arc<dyn ClusterListener>]) {
        self.snapshot.store(Arc::new(listeners.to_vec()));
    }

    fn is_registered(&self, listener: &Arc<dyn ClusterListener>) -> bool {
        self.listeners
            .lock()
            .iter()
            .any(|existing| same_listener(existing, listener))
    }

    /// Queue a change for delivery to every registered listener.
    ///
    /// Returns after the queue is empty if this call became the drainer, or
    /// immediately if another call (possibly further up this thread's stack)
    /// is already draining. Changes raised with no listeners are dropped.
    pub fn broker_changed(&self, change: ClusterChange) {
        if self.snapshot.load().is_empty() {
            tracing::trace!(reason = %change.reason(), "no cluster listeners; change dropped");
            return;
        }
        {
            let mut queue = self.queue.lock();
            queue.entries.push_back(change);
            metrics::gauge!("felix_cluster_pending_events").set(queue.entries.len() as f64);
            if queue.processing || queue.held > 0 {
                return;
            }
            queue.processing = true;
        }
        self.drain();
    }

    /// Queue changes without delivering them until the returned guard drops.
    ///
    /// Lets a caller finish work under its own locks before any listener
    /// runs. Dropping the last hold drains whatever was queued meanwhile,
    /// unless another call is already draining.
    pub(crate) fn hold(&self) -> PipelineHold<'_> {
        self.queue.lock().held += 1;
        PipelineHold { pipeline: self }
    }

    fn release(&self) {
        {
            let mut queue = self.queue.lock();
            queue.held -= 1;
            if queue.held > 0 || queue.processing || queue.entries.is_empty() {
                return;
            }
            queue.processing = true;
        }
        self.drain();
    }

    fn drain(&self) {
        let _guard = DrainGuard { pipeline: self };
        loop {
            let next = {
                let mut queue = self.queue.lock();
                match queue.entries.pop_front() {
                    Some(change) => {
                        metrics::gauge!("felix_cluster_pending_events")
                            .set(queue.entries.len() as f64);
                        change
                    }
                    None => {
                        queue.processing = false;
                        return;
                    }
                }
            };
            self.dispatch(&next);
        }
    }

    fn dispatch(&self, change: &ClusterChange) {
        let reason = change.reason();
        let listeners = self.snapshot.load_full();
        for listener in listeners.iter() {
            // Skip listeners removed since the snapshot was taken.
            if !self.is_registered(listener) {
                continue;
            }
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| change.deliver(listener.as_ref())));
            if let Err(payload) = delivered {
                metrics::counter!("felix_cluster_listener_failures_total", "reason" => reason.as_str())
                    .increment(1);
                tracing::error!(
                    reason = %reason,
                    broker = change.broker_name().unwrap_or("-"),
                    panic = panic_message(payload.as_ref()),
                    "cluster listener panicked; continuing delivery"
                );
            }
        }
        metrics::counter!("felix_cluster_events_total", "reason" => reason.as_str()).increment(1);
    }
}

pub(crate) struct PipelineHold<'a> {
    pipeline: &'a NotificationPipeline,
}

impl Drop for PipelineHold<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.pipeline.queue.lock().held -= 1;
        } else {
            self.pipeline.release();
        }
    }
}

// Releases drain ownership if the loop unwinds outside a listener call.
struct DrainGuard<'a> {
    pipeline: &'a NotificationPipeline,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.pipeline.queue.lock().processing = false;
        }
    }
}

fn same_listener(a: &Arc<dyn ClusterListener>, b: &Arc<dyn ClusterListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
