//! Channel state and the operations of an open channel.
use crate::client_error;
use crate::connection::ConnectionInner;
use crate::consumer::{ConsumerHandler, ConsumerSignal, ConsumerSink, Exclusive, NoAck, NoLocal};
use crate::error::{ClientError, ErrorKind};
use crate::message::{to_content_frames, GetMessage, PublishedMessage};
use crate::model::{ChannelNumber, ClassMethod, REPLY_SUCCESS};
use crate::rpc::{rpc_error, ContentAssembly, ContentTarget, RpcDispatcher, RpcId, RpcReply};
use amqpstorm_codec::codec::Frame;
use amqpstorm_codec::frame::{self, MethodFrameArgs};
use anyhow::Result;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

const EXCHANGE_DECLARE_OK: &[ClassMethod] = &[frame::EXCHANGE_DECLARE_OK];
const EXCHANGE_DELETE_OK: &[ClassMethod] = &[frame::EXCHANGE_DELETE_OK];
const EXCHANGE_BIND_OK: &[ClassMethod] = &[frame::EXCHANGE_BIND_OK];
const EXCHANGE_UNBIND_OK: &[ClassMethod] = &[frame::EXCHANGE_UNBIND_OK];
const QUEUE_DECLARE_OK: &[ClassMethod] = &[frame::QUEUE_DECLARE_OK];
const QUEUE_BIND_OK: &[ClassMethod] = &[frame::QUEUE_BIND_OK];
const QUEUE_UNBIND_OK: &[ClassMethod] = &[frame::QUEUE_UNBIND_OK];
const QUEUE_PURGE_OK: &[ClassMethod] = &[frame::QUEUE_PURGE_OK];
const QUEUE_DELETE_OK: &[ClassMethod] = &[frame::QUEUE_DELETE_OK];
const BASIC_QOS_OK: &[ClassMethod] = &[frame::BASIC_QOS_OK];
const BASIC_CONSUME_OK: &[ClassMethod] = &[frame::BASIC_CONSUME_OK];
const BASIC_CANCEL_OK: &[ClassMethod] = &[frame::BASIC_CANCEL_OK];
const BASIC_GET_REPLIES: &[ClassMethod] = &[frame::BASIC_GET_OK, frame::BASIC_GET_EMPTY];
const BASIC_RECOVER_OK: &[ClassMethod] = &[frame::BASIC_RECOVER_OK];
const CONFIRM_SELECT_OK: &[ClassMethod] = &[frame::CONFIRM_SELECT_OK];
const CHANNEL_FLOW_OK: &[ClassMethod] = &[frame::CHANNEL_FLOW_OK];
const CHANNEL_CLOSE_OK: &[ClassMethod] = &[frame::CHANNEL_CLOSE_OK];

/// Lifecycle of a channel.
///
/// ```text
/// Closed ──open──▶ Opening ──OpenOk──▶ Open ──close──▶ Closing ──CloseOk──▶ Closed
///                     │                  │                                   ▲
///                     └──────────────────┴──── Channel.Close from server ────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Per channel state in the channel table of the connection.
pub(crate) struct ChannelCore {
    pub(crate) state: ChannelState,
    pub(crate) rpc: RpcDispatcher,
    pub(crate) consumers: HashMap<String, ConsumerSink>,
    /// Content being received after a `Deliver`, `Return` or `GetOk`.
    pub(crate) assembly: Option<ContentAssembly>,
}

impl ChannelCore {
    pub(crate) fn new() -> Self {
        ChannelCore {
            state: ChannelState::Opening,
            rpc: RpcDispatcher::default(),
            consumers: HashMap::new(),
            assembly: None,
        }
    }

    pub(crate) fn start_content(&mut self, channel: ChannelNumber, target: ContentTarget) {
        self.assembly = Some(ContentAssembly::new(channel, target));
    }

    /// The caller of `id` stopped waiting. If the content answering it is being received, that
    /// content is dropped, otherwise the response is still to come.
    pub(crate) fn abandon_rpc(&mut self, id: RpcId) {
        let receiving = self
            .assembly
            .as_mut()
            .is_some_and(|assembly| assembly.abandon_get(id));

        if receiving {
            self.rpc.cancel(id);
        } else {
            self.rpc.abandon(id);
        }
    }

    /// State changes caused by the response of a pending request.
    pub(crate) fn on_response(&mut self, cm: ClassMethod, args: &MethodFrameArgs) {
        match args {
            MethodFrameArgs::ChannelOpenOk => self.state = ChannelState::Open,
            MethodFrameArgs::ChannelCloseOk => self.state = ChannelState::Closed,
            MethodFrameArgs::BasicCancelOk(args) => {
                if let Some(sink) = self.consumers.remove(&args.consumer_tag) {
                    let _ = sink.send(ConsumerSignal::Cancelled);
                }
            }
            _ => trace!("Response {:08X}", cm),
        }
    }

    /// The server closed the channel. The pending request fails and the consumers are notified.
    /// Returns true if the channel was already closing on our side, so the server's `CloseOk`
    /// is still to come and the channel number stays reserved until then.
    pub(crate) fn closed_by_peer(&mut self, channel: ChannelNumber, code: u16, text: &str, cm: ClassMethod) -> bool {
        let closing = self.state == ChannelState::Closing;

        self.state = ChannelState::Closed;
        self.assembly = None;
        self.rpc
            .reset(rpc_error(ErrorKind::ChannelClosed, Some(channel), code, text, cm));

        for (_, sink) in self.consumers.drain() {
            let _ = sink.send(ConsumerSignal::ChannelClosed {
                reply_code: code,
                reply_text: text.to_string(),
                class_method: cm,
            });
        }

        closing
    }
}

fn channel_closed<T>(channel: ChannelNumber) -> Result<T> {
    client_error!(ErrorKind::ChannelClosed, Some(channel), 0, "Channel is not open", 0)
}

fn require_open(channel: ChannelNumber) -> impl FnOnce(&mut ChannelCore) -> Result<()> {
    move |core| match core.state {
        ChannelState::Open => Ok(()),
        _ => channel_closed(channel),
    }
}

fn unexpected_reply<T>(channel: ChannelNumber, reply: RpcReply) -> Result<T> {
    client_error!(
        ErrorKind::ProtocolViolation,
        Some(channel),
        0,
        format!("Unexpected reply {:?}", reply),
        0
    )
}

/// Specify if the exchange or the queue can only be deleted if it is not in use.
#[derive(Clone, Copy, Debug, Default)]
pub struct IfUnused(pub bool);
/// Specify if the queue can only be deleted if it is empty.
#[derive(Clone, Copy, Debug, Default)]
pub struct IfEmpty(pub bool);

/// Result of `Queue.Declare`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeclaredQueue {
    /// The name of the queue, generated by the server if the declared name was empty.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A channel of a connection. It can be cloned, the clones refer to the same channel.
///
/// Synchronous operations wait for the response of the server up to the connection timeout.
/// Only one of them can be in progress at a time on a channel.
#[derive(Clone)]
pub struct Channel {
    pub channel: ChannelNumber,
    conn: Arc<ConnectionInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("channel", &self.channel)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(channel: ChannelNumber, conn: Arc<ConnectionInner>) -> Channel {
        Channel { channel, conn }
    }

    pub fn state(&self) -> ChannelState {
        self.conn
            .channels()
            .get(&self.channel)
            .map(|core| core.state)
            .unwrap_or(ChannelState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    async fn call(&self, frame: frame::AMQPFrame, expected: &'static [ClassMethod]) -> Result<RpcReply> {
        self.conn
            .channel_rpc(self.channel, frame, expected, require_open(self.channel))
            .await
    }

    /// Send frames without waiting for any response.
    async fn send(&self, frame: Frame) -> Result<()> {
        let open = self
            .conn
            .channels()
            .get(&self.channel)
            .is_some_and(|core| core.state == ChannelState::Open);

        if !open {
            return channel_closed(self.channel);
        }

        self.conn.send_frame(frame).await
    }

    /// Declare exchange. The `NO_WAIT` flag is ignored, the call always waits for the response.
    pub async fn exchange_declare(
        &self,
        exchange_name: &str,
        exchange_type: &str,
        flags: Option<frame::ExchangeDeclareFlags>,
    ) -> Result<()> {
        let mut flags = flags.unwrap_or_default();
        flags.remove(frame::ExchangeDeclareFlags::NO_WAIT);

        let args = frame::ExchangeDeclareArgs {
            exchange_name: exchange_name.to_string(),
            exchange_type: exchange_type.to_string(),
            flags,
            args: None,
        };

        self.call(args.frame(self.channel), EXCHANGE_DECLARE_OK).await?;

        Ok(())
    }

    /// Delete exchange.
    pub async fn exchange_delete(&self, exchange_name: &str, if_unused: IfUnused) -> Result<()> {
        let frame = frame::ExchangeDeleteArgs::default()
            .exchange_name(exchange_name)
            .if_unused(if_unused.0)
            .frame(self.channel);

        self.call(frame, EXCHANGE_DELETE_OK).await?;

        Ok(())
    }

    /// Bind the `destination` exchange to the `source` exchange.
    pub async fn exchange_bind(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        let frame = frame::ExchangeBindArgs::new(destination, source)
            .routing_key(routing_key)
            .bind_frame(self.channel);

        self.call(frame, EXCHANGE_BIND_OK).await?;

        Ok(())
    }

    pub async fn exchange_unbind(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        let frame = frame::ExchangeBindArgs::new(destination, source)
            .routing_key(routing_key)
            .unbind_frame(self.channel);

        self.call(frame, EXCHANGE_UNBIND_OK).await?;

        Ok(())
    }

    /// Declare queue. An empty name asks the server to generate one.
    pub async fn queue_declare(
        &self,
        queue_name: &str,
        flags: Option<frame::QueueDeclareFlags>,
    ) -> Result<DeclaredQueue> {
        let mut flags = flags.unwrap_or_default();
        flags.remove(frame::QueueDeclareFlags::NO_WAIT);

        let args = frame::QueueDeclareArgs {
            name: queue_name.to_string(),
            flags,
            args: None,
        };

        match self.call(args.frame(self.channel), QUEUE_DECLARE_OK).await? {
            RpcReply::Method(_, MethodFrameArgs::QueueDeclareOk(ok)) => Ok(DeclaredQueue {
                name: ok.name,
                message_count: ok.message_count,
                consumer_count: ok.consumer_count,
            }),
            other => unexpected_reply(self.channel, other),
        }
    }

    /// Bind queue to exchange.
    pub async fn queue_bind(&self, queue_name: &str, exchange_name: &str, routing_key: &str) -> Result<()> {
        let frame = frame::QueueBindArgs::new(queue_name, exchange_name)
            .routing_key(routing_key)
            .frame(self.channel);

        self.call(frame, QUEUE_BIND_OK).await?;

        Ok(())
    }

    pub async fn queue_unbind(&self, queue_name: &str, exchange_name: &str, routing_key: &str) -> Result<()> {
        let frame = frame::QueueUnbindArgs::new(queue_name, exchange_name)
            .routing_key(routing_key)
            .frame(self.channel);

        self.call(frame, QUEUE_UNBIND_OK).await?;

        Ok(())
    }

    /// Remove all the messages of the queue, returns the number of messages removed.
    pub async fn queue_purge(&self, queue_name: &str) -> Result<u32> {
        let frame = frame::QueuePurgeArgs::default()
            .queue_name(queue_name)
            .frame(self.channel);

        match self.call(frame, QUEUE_PURGE_OK).await? {
            RpcReply::Method(_, MethodFrameArgs::QueuePurgeOk(ok)) => Ok(ok.message_count),
            other => unexpected_reply(self.channel, other),
        }
    }

    /// Delete the queue, returns the number of messages deleted with it.
    pub async fn queue_delete(&self, queue_name: &str, if_unused: IfUnused, if_empty: IfEmpty) -> Result<u32> {
        let frame = frame::QueueDeleteArgs::default()
            .queue_name(queue_name)
            .if_unused(if_unused.0)
            .if_empty(if_empty.0)
            .frame(self.channel);

        match self.call(frame, QUEUE_DELETE_OK).await? {
            RpcReply::Method(_, MethodFrameArgs::QueueDeleteOk(ok)) => Ok(ok.message_count),
            other => unexpected_reply(self.channel, other),
        }
    }

    /// Limit the number of unacked messages the server delivers.
    pub async fn basic_qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        let frame = frame::BasicQosArgs::default()
            .prefetch_count(prefetch_count)
            .prefetch_size(prefetch_size)
            .global(global)
            .frame(self.channel);

        self.call(frame, BASIC_QOS_OK).await?;

        Ok(())
    }

    /// Publish a message. The method, header and body frames are written as one unit, there is no
    /// response from the server (unless the channel is in confirm mode, see
    /// [`crate::EventSignal::BasicAck`]).
    ///
    /// ```no_run
    /// use amqpstorm_client::{Channel, PublishedMessage};
    ///
    /// async fn publish(channel: Channel) -> anyhow::Result<()> {
    ///     let message = PublishedMessage::default()
    ///         .str("{\"id\": 1}")
    ///         .content_type("application/json")
    ///         .mandatory(true);
    ///
    ///     channel.basic_publish("orders", "new", message).await
    /// }
    /// ```
    pub async fn basic_publish(&self, exchange_name: &str, routing_key: &str, message: PublishedMessage) -> Result<()> {
        let method = frame::BasicPublishArgs::new(exchange_name)
            .routing_key(routing_key)
            .mandatory(message.mandatory)
            .immediate(message.immediate)
            .frame(self.channel);

        let (header, body) = to_content_frames(self.channel, message.message);

        let mut frames = vec![method, header.frame()];

        if !body.body.is_empty() {
            frames.push(body.frame());
        }

        self.send(Frame::Frames(frames)).await
    }

    /// Start consuming a queue.
    ///
    /// It returns a `ConsumerHandler` with which the server events can be handled. Messages are
    /// delivered in the form of those events and also channel close or connection close events
    /// coming through that interface.
    ///
    /// ```no_run
    /// use amqpstorm_client::{Channel, ConsumerSignal, Exclusive, NoAck, NoLocal};
    ///
    /// async fn consume(channel: Channel) {
    ///     let mut handler = channel.basic_consume("queue", NoAck(false), Exclusive(false),
    ///         NoLocal(false)).await.unwrap();
    ///
    ///     while let Some(signal) = handler.signal_stream.recv().await {
    ///         match signal {
    ///             ConsumerSignal::Delivered(m) => {
    ///                 handler.basic_ack(m.delivery_tag).await.unwrap();
    ///             }
    ///             ConsumerSignal::Cancelled | ConsumerSignal::ChannelClosed { .. } |
    ///                 ConsumerSignal::ConnectionClosed { .. } => {
    ///                 break;
    ///             }
    ///         }
    ///     }
    /// }
    /// ```
    pub async fn basic_consume(
        &self,
        queue_name: &str,
        no_ack: NoAck,
        exclusive: Exclusive,
        no_local: NoLocal,
    ) -> Result<ConsumerHandler> {
        let consumer_tag = format!("amqpstorm-{}", rand::random::<u64>());

        let frame = frame::BasicConsumeArgs::default()
            .queue(queue_name)
            .consumer_tag(&consumer_tag)
            .no_ack(no_ack.0)
            .exclusive(exclusive.0)
            .no_local(no_local.0)
            .frame(self.channel);

        let (signal_sink, signal_stream) = mpsc::unbounded_channel();

        // registered before the request, deliveries may follow the ConsumeOk immediately
        let tag = consumer_tag.clone();
        let channel = self.channel;

        let result = self
            .conn
            .channel_rpc(self.channel, frame, BASIC_CONSUME_OK, move |core| {
                require_open(channel)(core)?;
                core.consumers.insert(tag, signal_sink);

                Ok(())
            })
            .await;

        if let Err(e) = result {
            if let Some(core) = self.conn.channels().get_mut(&self.channel) {
                core.consumers.remove(&consumer_tag);
            }

            return Err(e);
        }

        debug!("Consuming {} on channel {} as {}", queue_name, self.channel, consumer_tag);

        Ok(ConsumerHandler {
            channel: self.channel,
            consumer_tag,
            channel_handle: self.clone(),
            signal_stream,
        })
    }

    /// Cancel a consumer, its signal stream gets a `Cancelled` signal.
    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let frame = frame::BasicCancelArgs::new(consumer_tag).frame(self.channel);

        self.call(frame, BASIC_CANCEL_OK).await?;

        Ok(())
    }

    /// Get one message from the queue, `None` if the queue is empty.
    pub async fn basic_get(&self, queue_name: &str, no_ack: NoAck) -> Result<Option<GetMessage>> {
        let frame = frame::BasicGetArgs::new(queue_name).no_ack(no_ack.0).frame(self.channel);

        match self.call(frame, BASIC_GET_REPLIES).await? {
            RpcReply::Get(message) => Ok(Some(*message)),
            RpcReply::Method(frame::BASIC_GET_EMPTY, _) => Ok(None),
            other => unexpected_reply(self.channel, other),
        }
    }

    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let frame = frame::BasicAckArgs::default()
            .delivery_tag(delivery_tag)
            .multiple(multiple)
            .frame(self.channel);

        self.send(frame.into()).await
    }

    pub async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let frame = frame::BasicNackArgs::default()
            .delivery_tag(delivery_tag)
            .multiple(multiple)
            .requeue(requeue)
            .frame(self.channel);

        self.send(frame.into()).await
    }

    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let frame = frame::BasicRejectArgs::default()
            .delivery_tag(delivery_tag)
            .requeue(requeue)
            .frame(self.channel);

        self.send(frame.into()).await
    }

    /// Ask the server to redeliver the unacked messages of the channel.
    pub async fn basic_recover(&self, requeue: bool) -> Result<()> {
        let frame = frame::BasicRecoverArgs::default().requeue(requeue).frame(self.channel);

        self.call(frame, BASIC_RECOVER_OK).await?;

        Ok(())
    }

    /// Switch the channel to publisher confirm mode. Confirms arrive as
    /// [`crate::EventSignal::BasicAck`] and [`crate::EventSignal::BasicNack`] events.
    pub async fn confirm_select(&self) -> Result<()> {
        let frame = frame::ConfirmSelectArgs::default().frame(self.channel);

        self.call(frame, CONFIRM_SELECT_OK).await?;

        Ok(())
    }

    /// Ask the server to pause or restart deliveries, returns the state confirmed by the server.
    pub async fn flow(&self, active: bool) -> Result<bool> {
        let frame = frame::ChannelFlowArgs::new(active).frame(self.channel);

        match self.call(frame, CHANNEL_FLOW_OK).await? {
            RpcReply::Method(_, MethodFrameArgs::ChannelFlowOk(ok)) => Ok(ok.active),
            other => unexpected_reply(self.channel, other),
        }
    }

    /// Close the channel. Closing a channel which is already closed is not an error, and neither
    /// is a server which doesn't acknowledge the close in time: the channel is closed on our side
    /// and its number is reused only after the late `CloseOk`.
    pub async fn close(&self) -> Result<()> {
        let channel = self.channel;
        let frame = frame::ChannelCloseArgs::new(REPLY_SUCCESS, "Normal close", 0).frame(channel);

        let result = self
            .conn
            .channel_rpc(channel, frame, CHANNEL_CLOSE_OK, move |core| match core.state {
                ChannelState::Open => {
                    core.state = ChannelState::Closing;

                    Ok(())
                }
                _ => channel_closed(channel),
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => match e.downcast_ref::<ClientError>() {
                // the server closed it meanwhile
                Some(err) if err.kind == ErrorKind::ChannelClosed => Ok(()),
                Some(err) if err.kind == ErrorKind::Timeout => {
                    warn!("No Channel.CloseOk on channel {} in time", channel);

                    if let Some(core) = self.conn.channels().get_mut(&channel) {
                        core.state = ChannelState::Closed;
                    }

                    Ok(())
                }
                _ => Err(e),
            },
        }
    }
}
