use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::message::{Message, MessageType};
use crate::message_counter::MessageCounter;
use crate::message_handler::MessageHandler;
use crate::packet::parse_datagram;

/// Gets notified of malformed traffic. The transport drops the offending datagram or message
///  and carries on, so this is for diagnostics and application-level policies (e.g. blocking
///  a peer).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ErrorListener: Send + Sync + 'static {
    async fn on_error(&self, peer_addr: SocketAddr, error: &anyhow::Error);
}

/// EndPoint is where the parts of the transport come together: it owns the UDP socket and a
///  connection per peer, dispatching incoming datagrams to their connections and periodically
///  sending whatever the connections have buffered.
///
/// Handlers are registered end-point-wide and apply to all connections, including those that
///  are created later.
///
/// NB: Lock order is handler table before connection table
pub struct EndPoint {
    socket: UdpSocket,
    config: Arc<TransportConfig>,
    connections: RwLock<FxHashMap<SocketAddr, Arc<Connection>>>,
    handlers: RwLock<FxHashMap<MessageType, Arc<dyn MessageHandler>>>,
    error_listener: Arc<dyn ErrorListener>,
}

impl EndPoint {
    pub async fn new(config: Arc<TransportConfig>, error_listener: Arc<dyn ErrorListener>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = UdpSocket::bind(config.self_addr).await?;
        info!("bound socket to {:?}", socket.local_addr()?);

        Ok(EndPoint {
            socket,
            config,
            connections: Default::default(),
            handlers: Default::default(),
            error_listener,
        })
    }

    pub fn self_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn connection(&self, peer_addr: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.read().await
            .get(&peer_addr)
            .cloned()
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.connections.read().await
            .keys()
            .cloned()
            .collect()
    }

    /// Returns the connection to a peer, creating it if it does not exist yet
    pub async fn connect(&self, peer_addr: SocketAddr) -> Arc<Connection> {
        if let Some(conn) = self.connection(peer_addr).await {
            return conn;
        }

        let handlers = self.handlers.read().await;
        match self.connections.write().await.entry(peer_addr) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                debug!("initializing connection to {:?}", peer_addr);
                let conn = Connection::new(peer_addr, &self.config);
                for (&msg_type, handler) in handlers.iter() {
                    conn.add_handler(msg_type, handler.clone()).await;
                }
                e.insert(Arc::new(conn)).clone()
            }
        }
    }

    pub async fn disconnect(&self, peer_addr: SocketAddr) -> bool {
        let removed = self.connections.write().await
            .remove(&peer_addr)
            .is_some();
        if removed {
            debug!("disconnected from {:?}", peer_addr);
        }
        removed
    }

    /// Registers a handler for an application message type on all current and future
    ///  connections. Reserved types and types that have a handler already are rejected.
    pub async fn add_handler(&self, msg_type: MessageType, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        if msg_type.is_reserved() {
            bail!("message type {} is reserved for the transport, application types start at {}", msg_type, MessageType::MAX_RESERVED + 1);
        }
        self.register_handler(msg_type, handler).await
    }

    pub(crate) async fn register_handler(&self, msg_type: MessageType, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let mut handlers = self.handlers.write().await;
        match handlers.entry(msg_type) {
            Entry::Occupied(_) => bail!("there is a handler for message type {} already", msg_type),
            Entry::Vacant(e) => {
                e.insert(handler.clone());
            }
        }

        for conn in self.connections.read().await.values() {
            conn.add_handler(msg_type, handler.clone()).await;
        }
        Ok(())
    }

    pub async fn remove_handler(&self, msg_type: MessageType) -> bool {
        let mut handlers = self.handlers.write().await;
        if handlers.remove(&msg_type).is_none() {
            return false;
        }

        for conn in self.connections.read().await.values() {
            conn.remove_handler(msg_type).await;
        }
        true
    }

    /// Enqueues a message for a peer, connecting to it if necessary. The message is sent with
    ///  the next send tick.
    pub async fn send(&self, to: SocketAddr, msg: Message) -> anyhow::Result<MessageCounter> {
        self.connect(to).await
            .mark_to_send(msg).await
    }

    pub async fn broadcast(&self, msg: Message) -> anyhow::Result<()> {
        self.do_broadcast(None, msg).await
    }

    /// enqueues a message for all connected peers except one
    pub async fn broadcast_except(&self, except: SocketAddr, msg: Message) -> anyhow::Result<()> {
        self.do_broadcast(Some(except), msg).await
    }

    async fn do_broadcast(&self, except: Option<SocketAddr>, msg: Message) -> anyhow::Result<()> {
        let connections = self.connection_snapshot().await;
        for conn in connections {
            if Some(conn.peer_addr()) == except {
                continue;
            }
            conn.mark_to_send(msg.clone()).await?;
        }
        Ok(())
    }

    async fn connection_snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await
            .values()
            .cloned()
            .collect()
    }

    /// Runs a single send tick: collects each connection's datagrams and sends them
    pub async fn tick(&self) {
        for conn in self.connection_snapshot().await {
            for datagram in conn.packets_to_send(self.config.max_datagram_size).await {
                trace!("sending datagram of {} bytes to {:?}", datagram.len(), conn.peer_addr());
                if let Err(e) = self.socket.send_to(&datagram, conn.peer_addr()).await {
                    error!("error sending datagram to {:?}: {}", conn.peer_addr(), e);
                }
            }
        }
    }

    pub async fn drop_idle_connections(&self) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };

        let mut idle = Vec::new();
        for conn in self.connection_snapshot().await {
            if conn.idle_for().await > idle_timeout {
                idle.push(conn.peer_addr());
            }
        }
        if idle.is_empty() {
            return;
        }

        let mut connections = self.connections.write().await;
        for peer_addr in idle {
            info!("dropping connection to {:?}: no traffic for more than {:?}", peer_addr, idle_timeout);
            connections.remove(&peer_addr);
        }
    }

    pub async fn send_loop(&self) {
        info!("starting send loop");

        let mut send_interval = interval(self.config.send_interval);
        send_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            send_interval.tick().await;
            self.tick().await;
            self.drop_idle_connections().await;
        }
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.receive_buffer_size];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

            self.on_datagram(from, Bytes::copy_from_slice(&buf[..num_read]))
                .instrument(span)
                .await;
        }
    }

    pub(crate) async fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        trace!("received datagram from {:?}: {:?}", from, datagram.as_ref());

        let messages = match parse_datagram(datagram) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("received malformed datagram from {:?} - dropping: {}", from, e);
                self.error_listener.on_error(from, &e).await;
                return;
            }
        };

        let conn = self.connect(from).await;
        conn.update_activity().await;

        for msg in messages {
            if let Err(e) = conn.handle_message(msg).await {
                warn!("received malformed message from {:?} - dropping: {}", from, e);
                self.error_listener.on_error(from, &e).await;
            }
        }
    }
}
