// Consumer loop for the shared change channel.
// Each subsystem owns its own subscription; a closed subscription is retried
// once, after which the subsystem keeps serving what it already has.
use edge_coord::{ChannelEvent, CoordinationStore, Subscription};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub(crate) fn spawn_change_listener<F, Fut>(
    consumer: &'static str,
    store: Arc<dyn CoordinationStore>,
    mut subscription: Subscription,
    handler: F,
) -> JoinHandle<()>
where
    F: Fn(ChannelEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            while let Some(payload) = subscription.next().await {
                match ChannelEvent::parse(&payload) {
                    Ok(event) => handler(event).await,
                    Err(err) => {
                        tracing::warn!(consumer, error = %err, "ignoring unparseable change event");
                    }
                }
            }
            let channel = subscription.channel().to_string();
            tracing::warn!(consumer, channel = %channel, "change subscription closed; resubscribing");
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            match store.subscribe(&channel).await {
                Ok(next) => subscription = next,
                Err(err) => {
                    tracing::error!(
                        consumer,
                        channel = %channel,
                        error = %err,
                        "resubscribe failed; no further change events until manual refresh"
                    );
                    return;
                }
            }
        }
    })
}
