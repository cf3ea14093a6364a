//! The single UDP endpoint shared by all connections of a manager.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::IpmiError;

const RECEIVE_BUFFER_SIZE: usize = 16 * 1024;

/// Callback invoked for every datagram the messenger receives, in receive
/// order. The messenger performs no demultiplexing: every subscriber sees
/// every datagram and decides for itself whether the packet concerns it.
#[async_trait::async_trait]
pub trait MessageListener: Sync + Send {
    async fn on_datagram(&self, datagram: &[u8], sender: SocketAddr);
}

/// One UDP socket with a background reader fanning received datagrams out to
/// all subscribers.
pub struct UdpMessenger {
    socket: Arc<UdpSocket>,
    listeners: Arc<RwLock<Vec<Arc<dyn MessageListener>>>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpMessenger {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpMessenger> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("bound UDP messenger to {:?}", socket.local_addr()?);

        let listeners: Arc<RwLock<Vec<Arc<dyn MessageListener>>>> = Default::default();
        let (shutdown, shutdown_signal) = watch::channel(false);

        let reader = tokio::spawn(Self::receive_loop(
            socket.clone(),
            listeners.clone(),
            shutdown_signal,
        ));

        Ok(UdpMessenger {
            socket,
            listeners,
            closed: AtomicBool::new(false),
            shutdown,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Registers a subscriber. Subscribers are invoked sequentially for each
    /// datagram so that a single connection observes packets in receive
    /// order.
    pub async fn subscribe(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Best-effort datagram send. Fails with *transport-closed* once
    /// [`UdpMessenger::close`] ran or the socket is gone.
    pub async fn send(&self, to: SocketAddr, datagram: &[u8]) -> Result<(), IpmiError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IpmiError::TransportClosed);
        }
        trace!(?to, len = datagram.len(), "sending datagram");

        match self.socket.send_to(datagram, to).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("error sending datagram to {:?}: {}", to, e);
                Err(IpmiError::TransportClosed)
            }
        }
    }

    /// Stops the reader and marks the messenger closed. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        info!("UDP messenger closed");
    }

    async fn receive_loop(
        socket: Arc<UdpSocket>,
        listeners: Arc<RwLock<Vec<Arc<dyn MessageListener>>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
            select! {
                _ = shutdown.changed() => {
                    info!("shutting down receiver");
                    return;
                }
                recv_result = socket.recv_from(&mut buf) => {
                    match recv_result {
                        Ok((len, sender)) => {
                            if len == RECEIVE_BUFFER_SIZE {
                                warn!("received a datagram exceeding the receive buffer - skipping");
                                continue;
                            }
                            trace!(?sender, len, "received datagram");

                            let subscribers = listeners.read().await.clone();
                            if subscribers.is_empty() {
                                debug!("received datagram but nobody subscribed - dropping");
                            }
                            for listener in subscribers {
                                listener.on_datagram(&buf[..len], sender).await;
                            }
                        }
                        Err(e) => {
                            error!("error receiving UDP datagram: {}", e);
                        }
                    }
                }
            }
        }
    }
}
