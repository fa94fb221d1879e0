//! The single consumer of `PeerMessenger::receive`.
//!
//! Every delivered message is stored before it is acknowledged, so an ack
//! always means the message survives a restart of this node.

use std::sync::Arc;

use crate::messenger::PeerMessenger;
use crate::store::MessageStore;

/// Store and acknowledge messages until the messenger shuts down.
/// Returns how many previously unseen messages were stored.
pub async fn apply_inbound(
    messenger: Arc<dyn PeerMessenger>,
    store: Arc<dyn MessageStore>,
) -> u64 {
    let mut applied = 0u64;

    while let Some(message) = messenger.receive().await {
        let key = message.key();
        if store.put_message(&message) {
            applied += 1;
            tracing::info!(
                message = %key,
                kind = message.message_type().name(),
                bytes = message.blob().len(),
                "applied replicated message"
            );
        } else {
            tracing::debug!(message = %key, "message already stored");
        }
        messenger.send_ack(key.origin_id, key.message_id).await;
    }

    tracing::info!(applied, "inbound loop finished");
    applied
}
