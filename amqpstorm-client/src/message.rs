use crate::compat::{try_utf8_decode, Utf8Decoded};
use crate::model::ChannelNumber;
use amqpstorm_codec::frame::{self, ContentBodyFrame, ContentHeaderFrame, FieldTable};

/// A message sent to the server or received from the server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Content {
    pub channel: ChannelNumber,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Content {
    /// The body as text if it is valid UTF-8, otherwise the raw bytes.
    pub fn decoded_body(&self) -> Utf8Decoded {
        try_utf8_decode(self.body.clone())
    }
}

/// Standard set of message properties
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    /// 1 - non-persistent, 2 - persistent
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

/// A delivered message.
///
/// With the `consumer_tag` and `delivery_tag` a client can send back acknowledgements to the
/// server, saying that the message was successfully arrived.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeliveredMessage {
    pub message: Content,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A message get by `Basic.Get`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetMessage {
    pub message: Content,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// Messages left in the queue.
    pub message_count: u32,
}

/// A mandatory or immediate message the server couldn't route.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReturnedMessage {
    pub message: Content,
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A message published by the client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishedMessage {
    pub message: Content,
    pub mandatory: bool,
    pub immediate: bool,
}

impl From<&str> for PublishedMessage {
    fn from(value: &str) -> Self {
        PublishedMessage::default().str(value)
    }
}

impl From<Vec<u8>> for PublishedMessage {
    fn from(value: Vec<u8>) -> Self {
        PublishedMessage::default().body(value)
    }
}

impl PublishedMessage {
    pub fn str(mut self, value: &str) -> Self {
        self.message.body = value.as_bytes().to_vec();
        self
    }

    pub fn body(mut self, value: Vec<u8>) -> Self {
        self.message.body = value;
        self
    }

    pub fn content_type(mut self, value: &str) -> Self {
        self.message.properties.content_type = Some(value.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: frame::AMQPFieldValue) -> Self {
        self.message
            .properties
            .headers
            .get_or_insert_with(FieldTable::new)
            .insert(name.to_string(), value);
        self
    }

    /// Make the message survive broker restarts (delivery mode 2).
    pub fn persistent(mut self, value: bool) -> Self {
        self.message.properties.delivery_mode = Some(if value { 2 } else { 1 });
        self
    }

    pub fn correlation_id(mut self, value: &str) -> Self {
        self.message.properties.correlation_id = Some(value.to_string());
        self
    }

    pub fn reply_to(mut self, value: &str) -> Self {
        self.message.properties.reply_to = Some(value.to_string());
        self
    }

    pub fn message_id(mut self, value: &str) -> Self {
        self.message.properties.message_id = Some(value.to_string());
        self
    }

    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.message.properties = properties;
        self
    }

    /// Condition for mandatory publishing. Mandatory messages are failed if the exchange doesn't have
    /// bound queue or if the routing keys are not matched.
    pub fn mandatory(mut self, value: bool) -> Self {
        self.mandatory = value;
        self
    }

    /// Condition for immediate publishing. Immediate messages are received by a server successfully if
    /// they managed to be sent to a consumer immediately.
    pub fn immediate(mut self, value: bool) -> Self {
        self.immediate = value;
        self
    }
}

/// Header and body frames of an outgoing message. The body frame is split by the codec if it is
/// larger than the frame size limit.
pub(crate) fn to_content_frames(channel: ChannelNumber, message: Content) -> (ContentHeaderFrame, ContentBodyFrame) {
    let props = message.properties;

    let header = ContentHeaderFrame {
        channel,
        class_id: frame::BASIC_CLASS,
        weight: 0,
        body_size: message.body.len() as u64,
        prop_flags: frame::HeaderPropertyFlags::default(),
        cluster_id: props.cluster_id,
        app_id: props.app_id,
        user_id: props.user_id,
        message_type: props.message_type,
        timestamp: props.timestamp,
        message_id: props.message_id,
        expiration: props.expiration,
        reply_to: props.reply_to,
        correlation_id: props.correlation_id,
        priority: props.priority,
        delivery_mode: props.delivery_mode,
        headers: props.headers,
        content_encoding: props.content_encoding,
        content_type: props.content_type,
    };

    let body = ContentBodyFrame {
        channel,
        body: message.body,
    };

    (header, body)
}

impl From<ContentHeaderFrame> for MessageProperties {
    fn from(value: ContentHeaderFrame) -> Self {
        MessageProperties {
            content_type: value.content_type,
            content_encoding: value.content_encoding,
            headers: value.headers,
            delivery_mode: value.delivery_mode,
            priority: value.priority,
            correlation_id: value.correlation_id,
            reply_to: value.reply_to,
            expiration: value.expiration,
            message_id: value.message_id,
            timestamp: value.timestamp,
            message_type: value.message_type,
            user_id: value.user_id,
            app_id: value.app_id,
            cluster_id: value.cluster_id,
        }
    }
}
