//! Entry point owning the transport, timers and tag/ID collaborators shared
//! by all connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::IpmiConfig;
use crate::connection::events::ConnectionListener;
use crate::connection::session_id::SessionIdGenerator;
use crate::connection::tag_pool::SessionlessTagPool;
use crate::connection::Connection;
use crate::error::IpmiError;
use crate::protocol::handshake::PrivilegeLevel;
use crate::protocol::ipmi_lan::{AuthCapabilities, IpmiRequest, IpmiResponse};
use crate::security::CipherSuite;
use crate::timer::TimerService;
use crate::transport::UdpMessenger;

/// Manages many [`Connection`]s multiplexed over one UDP messenger.
///
/// Connections are addressed by a dense integer handle assigned at creation;
/// handles are never reused within a manager's lifetime. Every stage that
/// precedes session establishment borrows a sessionless tag from the shared
/// pool around the exchange.
pub struct ConnectionManager {
    messenger: Arc<UdpMessenger>,
    timer: Arc<TimerService>,
    tags: Arc<SessionlessTagPool>,
    session_ids: Arc<SessionIdGenerator>,
    config: Arc<IpmiConfig>,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionManager {
    /// Binds the shared UDP endpoint. Use `0.0.0.0:0` to let the OS pick the
    /// local port.
    pub async fn bind(local: SocketAddr, config: IpmiConfig) -> anyhow::Result<ConnectionManager> {
        let messenger = Arc::new(UdpMessenger::bind(local).await?);
        Ok(Self::with_messenger(messenger, config))
    }

    /// Builds a manager around an existing messenger. Collaborators that the
    /// original design kept as process-wide statics (tag pool, session-ID
    /// generator) are owned per manager so independent managers cannot
    /// interfere.
    pub fn with_messenger(messenger: Arc<UdpMessenger>, config: IpmiConfig) -> ConnectionManager {
        let timer = Arc::new(TimerService::new(config.timer_thread_pool_size));
        ConnectionManager {
            messenger,
            timer,
            tags: Arc::new(SessionlessTagPool::new()),
            session_ids: Arc::new(SessionIdGenerator::new()),
            config: Arc::new(config),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.messenger.local_addr()
    }

    /// Creates a connection to `remote` with the configured ping period and
    /// returns its handle.
    pub async fn create_connection(&self, remote: SocketAddr) -> Result<usize, IpmiError> {
        self.create_connection_with_ping_period(remote, self.config.ping_period)
            .await
    }

    /// Creates a connection with an explicit keep-alive period.
    pub async fn create_connection_with_ping_period(
        &self,
        remote: SocketAddr,
        ping_period: Duration,
    ) -> Result<usize, IpmiError> {
        let mut connections = self.connections.lock().await;
        let connection = Connection::connect(
            remote,
            ping_period,
            self.messenger.clone(),
            self.timer.clone(),
            self.session_ids.clone(),
            self.config.clone(),
        )
        .await;
        connections.push(Arc::new(connection));
        let handle = connections.len() - 1;
        debug!(?remote, handle, "connection registered");
        Ok(handle)
    }

    /// Looks up a connection by handle.
    pub async fn connection(&self, handle: usize) -> Result<Arc<Connection>, IpmiError> {
        self.connections
            .lock()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| IpmiError::IllegalState(format!("unknown connection handle {}", handle)))
    }

    /// Retrieves the cipher suites the managed system supports. First of the
    /// handshake stages.
    pub async fn get_available_cipher_suites(
        &self,
        handle: usize,
    ) -> Result<Vec<CipherSuite>, IpmiError> {
        let connection = self.connection(handle).await?;
        let tag = self.tags.acquire().await;
        let result = connection.get_available_cipher_suites(tag).await;
        self.tags.release(tag).await;
        result
    }

    /// Queries the authentication process details. Second handshake stage.
    pub async fn get_channel_authentication_capabilities(
        &self,
        handle: usize,
        cipher_suite: CipherSuite,
        privilege: PrivilegeLevel,
    ) -> Result<AuthCapabilities, IpmiError> {
        let connection = self.connection(handle).await?;
        let tag = self.tags.acquire().await;
        let result = connection
            .get_channel_authentication_capabilities(tag, cipher_suite, privilege)
            .await;
        self.tags.release(tag).await;
        result
    }

    /// Runs the RAKP handshake and establishes the session. Third handshake
    /// stage.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_session(
        &self,
        handle: usize,
        cipher_suite: CipherSuite,
        privilege: PrivilegeLevel,
        username: &str,
        password: &str,
        bmc_key: Option<&[u8]>,
    ) -> Result<(), IpmiError> {
        let connection = self.connection(handle).await?;
        let tag = self.tags.acquire().await;
        let result = connection
            .start_session(tag, cipher_suite, privilege, username, password, bmc_key)
            .await;
        self.tags.release(tag).await;
        result
    }

    /// Submits a command on an established session.
    pub async fn send_command(
        &self,
        handle: usize,
        request: IpmiRequest,
    ) -> Result<IpmiResponse, IpmiError> {
        self.connection(handle).await?.send_command(request).await
    }

    /// Registers a listener on one connection.
    pub async fn register_listener(
        &self,
        handle: usize,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<Uuid, IpmiError> {
        Ok(self.connection(handle).await?.register_listener(listener).await)
    }

    /// Closes one connection; its handle stays assigned.
    pub async fn close_connection(&self, handle: usize) -> Result<(), IpmiError> {
        self.connection(handle).await?.disconnect().await;
        Ok(())
    }

    /// Disconnects every active connection, then closes the messenger. No
    /// timer fires for this manager afterwards.
    pub async fn close(&self) {
        let connections = self.connections.lock().await.clone();
        for connection in connections {
            if connection.is_active().await {
                connection.disconnect().await;
            }
        }
        self.messenger.close().await;
        info!("connection manager closed");
    }
}
