use std::{sync::Arc, time::Instant};

use crate::controller::{Controller, ResourceKind};

pub(crate) async fn run_worker(controller: Arc<Controller>, kind: ResourceKind) {
    while process_next_item(&controller, kind).await {}
    debug!("{} worker stopped", kind);
}

pub(crate) async fn run_poller(controller: Arc<Controller>) {
    while poll_next_item(&controller).await {}
    debug!("instance poller stopped");
}

/// Reconcile the next key of `kind`'s queue.
///
/// On success the key's retry counter is reset, on failure it is re-added
/// with backoff until `max_retries` is reached and then dropped. Returns
/// `false` once the queue is shut down.
pub(crate) async fn process_next_item(controller: &Controller, kind: ResourceKind) -> bool {
    let queue = controller.queue(kind);
    let Some(key) = queue.get().await else {
        return false;
    };
    let start = Instant::now();
    let result = controller.reconcile_key(kind, &key).await;
    controller
        .metrics
        .record_reconcile(kind, start.elapsed(), result.is_ok());
    match result {
        Ok(()) => queue.forget(&key),
        Err(e) if e.is_requeued_by_poller() => {
            debug!("{} \"{}\": {}", kind, key, e);
            queue.forget(&key);
        }
        Err(e) => {
            let retries = queue.num_requeues(&key);
            if retries < controller.config.max_retries {
                if e.is_conflict() {
                    debug!("{} \"{}\": modified concurrently, retrying: {}", kind, key, e);
                } else {
                    warn!(
                        "{} \"{}\": error syncing (retry {}): {}",
                        kind, key, retries, e
                    );
                }
                queue.add_rate_limited(&key);
            } else {
                error!(
                    "{} \"{}\": dropping out of the queue after {} retries: {}",
                    kind, key, retries, e
                );
                queue.forget(&key);
                controller.metrics.record_dropped(kind);
            }
        }
    }
    queue.done(&key);
    true
}

/// Move the next due key of the polling queue onto the instance queue.
///
/// The polling backoff is kept until the reconciler finishes polling.
pub(crate) async fn poll_next_item(controller: &Controller) -> bool {
    let Some(key) = controller.polling_queue.get().await else {
        return false;
    };
    trace!("ServiceInstance \"{}\": polling", key);
    controller.instance_queue.add(&key);
    controller.polling_queue.done(&key);
    true
}
