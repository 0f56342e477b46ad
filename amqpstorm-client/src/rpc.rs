//! Matching synchronous requests with their responses, and assembling content-bearing methods.
//!
//! Every channel (and the connection itself on channel 0) has one `RpcDispatcher`. At most one
//! request is outstanding; when the caller gives up waiting the request is moved to the abandoned
//! queue, so its late response is recognized and dropped instead of completing a newer request.
use crate::client_error;
use crate::error::{ClientError, ErrorKind};
use crate::message::{Content, DeliveredMessage, GetMessage, MessageProperties, ReturnedMessage};
use crate::model::{ChannelNumber, ClassMethod, ConnectionError};
use amqpstorm_codec::frame::{BasicDeliverArgs, BasicGetOkArgs, BasicReturnArgs, ContentHeaderFrame, MethodFrameArgs};
use anyhow::Result;
use log::trace;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Successful response of a synchronous request.
#[derive(Debug)]
pub(crate) enum RpcReply {
    Method(ClassMethod, MethodFrameArgs),
    /// `Basic.GetOk` with its content.
    Get(Box<GetMessage>),
}

pub(crate) type RpcResult = oneshot::Receiver<Result<RpcReply>>;

/// Identifies one request, so a caller can only abandon its own request.
pub(crate) type RpcId = u64;

struct PendingRpc {
    id: RpcId,
    expected: &'static [ClassMethod],
    reply: oneshot::Sender<Result<RpcReply>>,
}

/// Where an incoming response belongs.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Route {
    /// It answers the outstanding request.
    Pending,
    /// It is the late answer of a request which timed out, it needs to be dropped.
    Abandoned,
    /// Nobody waits for it.
    Unexpected,
}

#[derive(Default)]
pub(crate) struct RpcDispatcher {
    next_id: RpcId,
    pending: Option<PendingRpc>,
    abandoned: VecDeque<&'static [ClassMethod]>,
}

impl RpcDispatcher {
    /// Register a new request which is answered by one of the `expected` methods.
    pub(crate) fn begin(&mut self, channel: ChannelNumber, expected: &'static [ClassMethod]) -> Result<(RpcId, RpcResult)> {
        if self.pending.is_some() {
            return client_error!(
                ErrorKind::ProtocolViolation,
                Some(channel),
                0,
                "Another synchronous request is in progress on the channel",
                expected.first().copied().unwrap_or_default()
            );
        }

        let (tx, rx) = oneshot::channel();

        self.next_id += 1;
        self.pending = Some(PendingRpc {
            id: self.next_id,
            expected,
            reply: tx,
        });

        Ok((self.next_id, rx))
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn pending_id(&self) -> Option<RpcId> {
        self.pending.as_ref().map(|pending| pending.id)
    }

    /// The caller stopped waiting, the response is expected to arrive later.
    pub(crate) fn abandon(&mut self, id: RpcId) {
        if let Some(pending) = self.take_if(id) {
            trace!("Abandon request waiting for {:08X?}", pending.expected);

            self.abandoned.push_back(pending.expected);
        }
    }

    /// A response is going to arrive without anybody waiting for it, like the `CloseOk` of a
    /// channel closed in the background.
    pub(crate) fn expect_late(&mut self, expected: &'static [ClassMethod]) {
        self.abandoned.push_back(expected);
    }

    /// The request couldn't be sent, no response will come.
    pub(crate) fn cancel(&mut self, id: RpcId) {
        self.take_if(id);
    }

    fn take_if(&mut self, id: RpcId) -> Option<PendingRpc> {
        match &self.pending {
            Some(pending) if pending.id == id => self.pending.take(),
            _ => None,
        }
    }

    /// Decide who the response belongs to. The abandoned requests were sent earlier, so their
    /// responses arrive first.
    pub(crate) fn route(&mut self, cm: ClassMethod) -> Route {
        if let Some(expected) = self.abandoned.front() {
            if expected.contains(&cm) {
                self.abandoned.pop_front();

                return Route::Abandoned;
            }
        }

        match &self.pending {
            Some(pending) if pending.expected.contains(&cm) => Route::Pending,
            _ => Route::Unexpected,
        }
    }

    /// Wake up the waiting caller with the response.
    pub(crate) fn complete(&mut self, reply: RpcReply) -> bool {
        match self.pending.take() {
            Some(pending) => pending.reply.send(Ok(reply)).is_ok(),
            None => false,
        }
    }

    /// Complete the request only if it is still the one with `id`.
    pub(crate) fn complete_for(&mut self, id: RpcId, reply: RpcReply) -> bool {
        match self.take_if(id) {
            Some(pending) => pending.reply.send(Ok(reply)).is_ok(),
            None => {
                trace!("Request {} is gone, drop its reply", id);

                false
            }
        }
    }

    /// Wake up the waiting caller with an error.
    pub(crate) fn fail(&mut self, err: anyhow::Error) -> bool {
        match self.pending.take() {
            Some(pending) => pending.reply.send(Err(err)).is_ok(),
            None => false,
        }
    }

    /// Forget everything, used when the channel goes away.
    pub(crate) fn reset(&mut self, err: anyhow::Error) {
        self.fail(err);
        self.abandoned.clear();
    }
}

/// What the assembled content is going to be.
#[derive(Debug)]
pub(crate) enum ContentTarget {
    Deliver(BasicDeliverArgs),
    Return(BasicReturnArgs),
    /// Content answering the request `RpcId`.
    Get(BasicGetOkArgs, RpcId),
    /// Content of an abandoned `Basic.Get`, it is read and dropped.
    Discard,
}

/// A message built from its method, header and body frames.
#[derive(Debug)]
pub(crate) enum Assembled {
    Delivered(Box<DeliveredMessage>),
    Returned(Box<ReturnedMessage>),
    Get(Box<GetMessage>, RpcId),
    Discarded,
}

/// Collects the header and body frames following a content-bearing method.
#[derive(Debug)]
pub(crate) struct ContentAssembly {
    channel: ChannelNumber,
    target: ContentTarget,
    header: Option<ContentHeaderFrame>,
    body: Vec<u8>,
}

fn unexpected_frame<T>(channel: ChannelNumber, message: &str) -> Result<T> {
    client_error!(
        ErrorKind::ProtocolViolation,
        Some(channel),
        ConnectionError::UnexpectedFrame.into(),
        message,
        0
    )
}

impl ContentAssembly {
    pub(crate) fn new(channel: ChannelNumber, target: ContentTarget) -> Self {
        ContentAssembly {
            channel,
            target,
            header: None,
            body: vec![],
        }
    }

    /// The request waiting for this content gave up, the rest of the content is dropped.
    /// Returns false if the content doesn't belong to that request.
    pub(crate) fn abandon_get(&mut self, id: RpcId) -> bool {
        let owned = matches!(self.target, ContentTarget::Get(_, get_id) if get_id == id);

        if owned {
            self.target = ContentTarget::Discard;
        }

        owned
    }

    /// Accept the content header, returns true if the content is complete (zero length body).
    pub(crate) fn on_header(&mut self, header: ContentHeaderFrame) -> Result<bool> {
        if self.header.is_some() {
            return unexpected_frame(self.channel, "Second content header of the same message");
        }

        let body_size = header.body_size;

        self.body.reserve(usize::try_from(body_size).unwrap_or(0).min(1 << 20));
        self.header = Some(header);

        Ok(body_size == 0)
    }

    /// Accept a body frame, returns true if the whole body arrived.
    pub(crate) fn on_body(&mut self, body: &[u8]) -> Result<bool> {
        let body_size = match &self.header {
            Some(header) => header.body_size,
            None => return unexpected_frame(self.channel, "Content body before content header"),
        };

        if (self.body.len() + body.len()) as u64 > body_size {
            return unexpected_frame(self.channel, "Content body is larger than the announced size");
        }

        self.body.extend_from_slice(body);

        Ok(self.body.len() as u64 == body_size)
    }

    pub(crate) fn finish(self) -> Assembled {
        let properties = self.header.map(MessageProperties::from).unwrap_or_default();
        let message = Content {
            channel: self.channel,
            body: self.body,
            properties,
        };

        match self.target {
            ContentTarget::Deliver(args) => Assembled::Delivered(Box::new(DeliveredMessage {
                message,
                consumer_tag: args.consumer_tag,
                delivery_tag: args.delivery_tag,
                redelivered: args.redelivered,
                exchange: args.exchange_name,
                routing_key: args.routing_key,
            })),
            ContentTarget::Return(args) => Assembled::Returned(Box::new(ReturnedMessage {
                message,
                reply_code: args.reply_code,
                reply_text: args.reply_text,
                exchange: args.exchange_name,
                routing_key: args.routing_key,
            })),
            ContentTarget::Get(args, id) => Assembled::Get(
                Box::new(GetMessage {
                    message,
                    delivery_tag: args.delivery_tag,
                    redelivered: args.redelivered,
                    exchange: args.exchange_name,
                    routing_key: args.routing_key,
                    message_count: args.message_count,
                }),
                id,
            ),
            ContentTarget::Discard => Assembled::Discarded,
        }
    }
}

/// Build the error a waiting caller gets when its request fails.
pub(crate) fn rpc_error(kind: ErrorKind, channel: Option<ChannelNumber>, code: u16, text: &str, cm: ClassMethod) -> anyhow::Error {
    anyhow::Error::new(ClientError {
        kind,
        channel,
        code,
        message: text.to_string(),
        class_method: cm,
    })
}
