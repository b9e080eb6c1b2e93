use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::end_point::EndPoint;
use crate::message::{Message, MessageType, Mode};
use crate::message_handler::MessageHandler;
use crate::safe_converter::PrecheckedCast;

pub type RpcFunction = dyn Fn(SocketAddr, Bytes) -> anyhow::Result<()> + Send + Sync;

/// Remote procedure calls on top of the transport: a call is a message with the method name and
///  opaque argument bytes, dispatched to a function registered under that name.
///
/// Call body:
/// ```ascii
/// 0: method name length (u16 BE)
/// 2: method name (UTF-8)
/// *: arguments, extending to the end of the message
/// ```
///
/// There are two call message types:
/// * [MessageType::RPC_SEND_TO_END_POINT] is dispatched on the receiving end point
/// * [MessageType::RPC_RESEND] is forwarded by the receiving end point to all its other peers (as
///    [MessageType::RPC_SEND_TO_END_POINT] with the same mode), and then dispatched locally
///
/// The registry is built once at startup and is immutable after [RpcRegistry::install].
#[derive(Default)]
pub struct RpcRegistry {
    methods: FxHashMap<String, Arc<RpcFunction>>,
}

impl RpcRegistry {
    pub fn new() -> RpcRegistry {
        Default::default()
    }

    pub fn register(&mut self, name: &str, f: impl Fn(SocketAddr, Bytes) -> anyhow::Result<()> + Send + Sync + 'static) -> anyhow::Result<()> {
        if name.len() > u16::MAX as usize {
            bail!("RPC method name exceeds {} bytes", u16::MAX);
        }
        if self.methods.contains_key(name) {
            bail!("duplicate RPC method {}", name);
        }
        debug!("registering RPC method {}", name);
        self.methods.insert(name.to_string(), Arc::new(f));
        Ok(())
    }

    pub fn encode_call(name: &str, args: &[u8]) -> anyhow::Result<Bytes> {
        if name.len() > u16::MAX as usize {
            bail!("RPC method name exceeds {} bytes", u16::MAX);
        }

        let mut buf = BytesMut::with_capacity(size_of::<u16>() + name.len() + args.len());
        buf.put_u16(name.len().prechecked_cast());
        buf.put_slice(name.as_bytes());
        buf.put_slice(args);
        Ok(buf.freeze())
    }

    pub fn decode_call(mut body: Bytes) -> anyhow::Result<(String, Bytes)> {
        let name_len = body.try_get_u16()? as usize;
        if name_len > body.remaining() {
            bail!("RPC method name length {} exceeds the remaining {} bytes", name_len, body.remaining());
        }
        let name = String::from_utf8(body.split_to(name_len).to_vec())?;
        Ok((name, body))
    }

    /// a call to be dispatched by the receiving end point
    pub fn call_message(name: &str, args: &[u8], mode: Mode) -> anyhow::Result<Message> {
        Ok(Message::new(MessageType::RPC_SEND_TO_END_POINT, mode, Self::encode_call(name, args)?))
    }

    /// a call to be dispatched by the receiving end point and all of its other peers
    pub fn resend_message(name: &str, args: &[u8], mode: Mode) -> anyhow::Result<Message> {
        Ok(Message::new(MessageType::RPC_RESEND, mode, Self::encode_call(name, args)?))
    }

    pub fn dispatch(&self, peer_addr: SocketAddr, body: Bytes) -> anyhow::Result<()> {
        let (name, args) = Self::decode_call(body)?;
        let method = self.methods.get(&name)
            .ok_or_else(|| anyhow!("unknown RPC method {}", name))?;

        trace!("dispatching RPC call {} from {:?}", name, peer_addr);
        method(peer_addr, args)
    }

    /// Registers the handlers for the RPC message types with an end point
    pub async fn install(self: Arc<Self>, end_point: &Arc<EndPoint>) -> anyhow::Result<()> {
        end_point.register_handler(MessageType::RPC_SEND_TO_END_POINT, Arc::new(RpcSendToEndPointHandler {
            registry: self.clone(),
        })).await?;
        end_point.register_handler(MessageType::RPC_RESEND, Arc::new(RpcResendHandler {
            registry: self,
            end_point: Arc::downgrade(end_point),
        })).await
    }
}

struct RpcSendToEndPointHandler {
    registry: Arc<RpcRegistry>,
}

#[async_trait]
impl MessageHandler for RpcSendToEndPointHandler {
    async fn on_message(&self, peer_addr: SocketAddr, message: &Message) {
        if let Err(e) = self.registry.dispatch(peer_addr, message.body().clone()) {
            warn!("RPC call from {:?} failed: {}", peer_addr, e);
        }
    }
}

struct RpcResendHandler {
    registry: Arc<RpcRegistry>,
    end_point: Weak<EndPoint>,
}

#[async_trait]
impl MessageHandler for RpcResendHandler {
    async fn on_message(&self, peer_addr: SocketAddr, message: &Message) {
        if let Some(end_point) = self.end_point.upgrade() {
            let forwarded = Message::new(MessageType::RPC_SEND_TO_END_POINT, message.mode(), message.body().clone());
            if let Err(e) = end_point.broadcast_except(peer_addr, forwarded).await {
                warn!("failed to forward RPC call from {:?}: {}", peer_addr, e);
            }
        }

        if let Err(e) = self.registry.dispatch(peer_addr, message.body().clone()) {
            warn!("RPC call from {:?} failed: {}", peer_addr, e);
        }
    }
}
