//! Topic subscriptions feeding remote heads into the engine.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tracing::{Instrument, debug, error_span, trace, warn};

use super::{Event, actor::Command};
use crate::{codec, keys::KeyStore, metrics::Metrics, peer::Topic, util::Closer};

/// Everything a subscription task needs.
#[derive(Debug, Clone)]
pub(super) struct Subscriber {
    pub(super) keys: KeyStore,
    pub(super) public_server: bool,
    pub(super) events: broadcast::Sender<Event>,
    pub(super) metrics: Arc<Metrics>,
}

impl Subscriber {
    /// Spawn the loop for one topic on `closer`.
    ///
    /// The loop holds only a weak sender, so it ends once the engine handles
    /// are gone, as well as when the closer is closed.
    pub(super) fn spawn(
        self,
        closer: &Closer,
        topic: Topic,
        records: broadcast::Receiver<Bytes>,
        commands: flume::WeakSender<Command>,
    ) {
        let span = error_span!("subscribe", %topic);
        closer.spawn(self.run(records, commands).instrument(span));
    }

    async fn run(self, records: broadcast::Receiver<Bytes>, commands: flume::WeakSender<Command>) {
        let mut records = BroadcastStream::new(records);
        while let Some(record) = records.next().await {
            let record = match record {
                Ok(record) => record,
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("subscription lagged, {n} records missed");
                    continue;
                }
            };
            let link = match codec::decode_link(&record) {
                Ok(link) => link,
                Err(err) => {
                    self.metrics.records_malformed.inc();
                    debug!("dropping malformed record: {err}");
                    self.events
                        .send(Event::Dropped {
                            link: None,
                            reason: err.to_string(),
                        })
                        .ok();
                    continue;
                }
            };
            if !self.public_server && !link.is_verified_by_any(&self.keys.public_keys()) {
                self.metrics.links_dropped.inc();
                debug!(path = %link.path().fmt_short(), "dropping unverified link");
                self.events
                    .send(Event::Dropped {
                        link: Some(link),
                        reason: "not signed by a trusted key".to_string(),
                    })
                    .ok();
                continue;
            }
            let Some(commands) = commands.upgrade() else {
                break;
            };
            trace!(path = %link.path().fmt_short(), "replicating");
            let command = Command::Replicate {
                links: vec![link],
                reply: None,
            };
            if commands.send_async(command).await.is_err() {
                break;
            }
        }
        debug!("subscription closed");
    }
}
