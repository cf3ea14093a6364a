use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::spawn;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::IpmiError;
use crate::protocol::ipmi_lan::IpmiResponse;

/// Asynchronous notifications a connection emits to its listeners.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    SessionEstablished(SessionEstablishedData),
    SessionClosed(SessionClosedData),
    SessionFailed(SessionFailedData),
    /// A valid in-session response that matched no pending request.
    UnsolicitedResponse(UnsolicitedResponseData),
}

#[derive(Debug, Clone)]
pub struct SessionEstablishedData {
    pub remote: SocketAddr,
    pub managed_system_session_id: u32,
}

#[derive(Debug, Clone)]
pub struct SessionClosedData {
    pub remote: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct SessionFailedData {
    pub remote: SocketAddr,
    pub error: IpmiError,
}

#[derive(Debug, Clone)]
pub struct UnsolicitedResponseData {
    pub remote: SocketAddr,
    pub response: IpmiResponse,
}

#[async_trait::async_trait]
pub trait ConnectionListener: Sync + Send {
    async fn on_connection_event(&self, event: ConnectionEvent);
}

/// Fans connection events out to registered listeners. Listeners run on
/// spawned tasks so a slow listener cannot stall the receive path.
pub struct ConnectionEventNotifier {
    listeners: RwLock<FxHashMap<Uuid, Arc<dyn ConnectionListener>>>,
}

impl ConnectionEventNotifier {
    pub fn new() -> ConnectionEventNotifier {
        ConnectionEventNotifier {
            listeners: Default::default(),
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> Uuid {
        let id = Uuid::new_v4();
        self.listeners.write().await.insert(id, listener);
        id
    }

    pub async fn try_remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()> {
        match self.listeners.write().await.remove(listener_id) {
            None => Err(anyhow!(
                "tried to remove a listener that was not (no longer?) registered: {}",
                listener_id
            )),
            Some(_) => Ok(()),
        }
    }

    pub async fn notify(&self, event: ConnectionEvent) {
        let listeners = self
            .listeners
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for listener in listeners {
            let event = event.clone();
            spawn(async move { listener.on_connection_event(event).await });
        }
    }
}

impl Default for ConnectionEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
