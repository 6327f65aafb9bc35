//! Live fan-out of published events to matching subscriptions.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::{
    connection::Connection, event::Event, message::event_frame, registry::SubscriptionRegistry,
};

/// Deliver `event` to every listener with a matching filter.
///
/// Matching pairs are snapshotted first so no registry lock is held while
/// writing. Writes to different connections run concurrently; a connection
/// that fails or times out is closed by its own write path and skipped.
/// Returns the number of frames delivered.
pub async fn broadcast(registry: &SubscriptionRegistry, event: &Event) -> usize {
    let mut deliveries: Vec<(Arc<Connection>, String)> = vec![];
    registry.for_each(|conn, listener| {
        if listener.matches(event) {
            deliveries.push((
                Arc::clone(conn),
                event_frame(&listener.subscription_id, event),
            ));
        }
    });
    if deliveries.is_empty() {
        return 0;
    }
    let sends = deliveries.into_iter().map(|(conn, frame)| async move {
        match conn.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(conn = conn.id(), error = %e, "dropping delivery");
                false
            }
        }
    });
    let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();
    debug!(id = %event.id, kind = event.kind, delivered, "broadcast");
    delivered
}
