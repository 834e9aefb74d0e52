use {
    studio_client::GatewayEvent,
    studio_common::SharedScheduler,
    tokio::sync::broadcast::{self, error::RecvError},
    tracing::{debug, info, warn},
};

use crate::{classify::classify, handler::IntentHandler, policy::decide};

/// Drive classifier → policy → handler from a client's event subscription.
///
/// Runs until the client disconnects or the subscription closes, then
/// disposes the handler so no armed timer reaches the sink afterwards.
/// Returns the number of events processed.
pub async fn pump(
    mut events: broadcast::Receiver<GatewayEvent>,
    mut handler: IntentHandler,
    scheduler: SharedScheduler,
) -> u64 {
    let mut processed = 0u64;
    loop {
        match events.recv().await {
            Ok(GatewayEvent::Event(frame)) => {
                let classified = classify(&frame, scheduler.now_ms());
                let intents = decide(&classified);
                debug!(
                    event = %classified.event,
                    agent_id = classified.agent_id.as_deref().unwrap_or("-"),
                    intents = intents.len(),
                    "event classified"
                );
                handler.apply_intents(intents, &classified);
                processed += 1;
            },
            Ok(GatewayEvent::Gap { expected, received }) => {
                info!(expected, received, "event sequence gap");
            },
            Ok(GatewayEvent::Closed) => {
                debug!("client disconnected, stopping event pump");
                break;
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event pump lagged, events dropped");
            },
            Err(RecvError::Closed) => break,
        }
    }
    handler.dispose();
    debug!(processed, "event pump finished");
    processed
}
