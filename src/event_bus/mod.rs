use serde_json::Value;
use tokio::sync::mpsc::{self, Sender, error::TrySendError};
use tracing::debug;

use crate::{event_bus::constants::MAX_EVENTS, intake::RequestError, server_info::ServerVersion};

pub mod constants;

/// Notifications a transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An intake upload, config poll or version probe failed.
    RequestError(RequestError),
    /// Central config returned a new configuration document.
    Config(Value),
    /// Cloud metadata was fetched and merged into the metadata record.
    CloudMetadata(Value),
    ServerVersion(ServerVersion),
}

#[allow(clippy::module_name_repetitions)]
pub struct EventBus {
    pub rx: mpsc::Receiver<TransportEvent>,
}

impl EventBus {
    #[must_use]
    pub fn run() -> (EventBus, EventSender) {
        let (tx, rx) = mpsc::channel(MAX_EVENTS);
        (EventBus { rx }, EventSender { tx })
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// Sending half of the [`EventBus`]. Emitting never blocks, a full or
/// abandoned bus drops the event.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<TransportEvent>,
}

impl EventSender {
    pub fn emit(&self, event: TransportEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                debug!("TRANSPORT | Event bus is full, dropping {:?}", event);
            }
        }
    }

    pub fn request_error(&self, err: RequestError) {
        self.emit(TransportEvent::RequestError(err));
    }
}
