use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::message::Message;

/// Application callback for messages of a given type. Handlers are registered per message type,
///  and they are called for each message that is due for delivery according to its mode.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, peer_addr: SocketAddr, message: &Message);
}
