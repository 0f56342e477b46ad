use crate::channel::Channel;
use crate::message::DeliveredMessage;
use crate::model::{ChannelNumber, ClassMethod};
use anyhow::Result;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) type ConsumerSink = mpsc::UnboundedSender<ConsumerSignal>;

/// A signal arriving from the server during consuming a queue.
#[derive(Debug)]
pub enum ConsumerSignal {
    Delivered(Box<DeliveredMessage>),
    /// The consumer is cancelled by the client or by the server (queue deleted for example).
    Cancelled,
    ChannelClosed {
        reply_code: u16,
        reply_text: String,
        class_method: ClassMethod,
    },
    ConnectionClosed {
        reply_code: u16,
        reply_text: String,
        class_method: ClassMethod,
    },
}

/// Specify if the consume is exclusive aka no other client can consume the queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct Exclusive(pub bool);
/// Specify if the client needs to ack messages after delivery.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAck(pub bool);
/// Specify if the server sends messages to the same connection which published them.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLocal(pub bool);

/// Consumer API for `Basic.Consume`.
///
/// `ConsumerHandler` can be get by invoking [`Channel::basic_consume`].
#[derive(Debug)]
pub struct ConsumerHandler {
    /// The channel number we are consuming messages.
    pub channel: ChannelNumber,
    /// Identifier of the consumer in server.
    pub consumer_tag: String,
    pub(crate) channel_handle: Channel,
    /// From this signal stream the consumer gets the messages as [`ConsumerSignal`] values and can
    /// handle them by acking messages or handling channel or connection close events.
    pub signal_stream: mpsc::UnboundedReceiver<ConsumerSignal>,
}

/// After consuming started with `ConsumerHandler` one can ack, nack or reject messages.
impl ConsumerHandler {
    /// Wait for the next signal, `None` if nothing arrived within the timeout or the stream is
    /// finished.
    pub async fn receive(&mut self, timeout: Duration) -> Option<ConsumerSignal> {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            signal = self.signal_stream.recv() => {
                signal
            }
            _ = &mut sleep => {
                None
            }
        }
    }

    pub async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel_handle.basic_ack(delivery_tag, false).await
    }

    pub async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.channel_handle.basic_nack(delivery_tag, multiple, requeue).await
    }

    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel_handle.basic_reject(delivery_tag, requeue).await
    }

    /// Stop consuming. Messages delivered before the cancel can still be read from the signal
    /// stream, it ends with a `Cancelled` signal.
    pub async fn basic_cancel(&self) -> Result<()> {
        self.channel_handle.basic_cancel(&self.consumer_tag).await
    }
}
