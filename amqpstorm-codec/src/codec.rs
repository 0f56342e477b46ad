use crate::frame::*;
use crate::{frame_error, Result, COMMAND_INVALID, FRAME_ERROR, SYNTAX_ERROR};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tokio_util::codec::{Decoder, Encoder};

const FRAME_METHOD_FRAME: u8 = 0x01;
const FRAME_CONTENT_HEADER: u8 = 0x02;
const FRAME_CONTENT_BODY: u8 = 0x03;
const FRAME_HEARTBEAT: u8 = 0x08;
const FRAME_AMQP_VERSION: u8 = 0x41;

const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// How deep field tables and arrays can be nested in each other.
const MAX_FIELD_NESTING: usize = 64;

/// Frame size limit before the connection is tuned.
pub const DEFAULT_FRAME_MAX: u32 = 131_072;

/// AMQP encoder and decoder.
///
/// `frame_max` is the negotiated maximal size of a frame including the frame header and the end
/// marker, 0 means there is no limit. Incoming frames above the limit are rejected, outgoing
/// content bodies are split into as many body frames as needed.
#[derive(Clone, Debug)]
pub struct AMQPCodec {
    pub frame_max: u32,
}

impl Default for AMQPCodec {
    fn default() -> Self {
        AMQPCodec {
            frame_max: DEFAULT_FRAME_MAX,
        }
    }
}

impl AMQPCodec {
    pub fn new(frame_max: u32) -> Self {
        AMQPCodec { frame_max }
    }

    /// The largest payload which fits into a frame.
    pub fn max_payload(&self) -> usize {
        max_payload(self.frame_max)
    }
}

#[derive(Debug)]
pub enum Frame {
    Frame(AMQPFrame),
    /// Frames which need to be written out together, like the method, header and body frames of
    /// a published message.
    Frames(Vec<AMQPFrame>),
}

impl From<AMQPFrame> for Frame {
    fn from(frame: AMQPFrame) -> Self {
        Frame::Frame(frame)
    }
}

impl Encoder<Frame> for AMQPCodec {
    type Error = crate::FrameError;

    fn encode(&mut self, event: Frame, buf: &mut BytesMut) -> Result<()> {
        let max = self.max_payload();

        match event {
            Frame::Frame(frame) => encode_amqp_frame(buf, frame, max),
            Frame::Frames(frames) => {
                // a group which fails half way must not leave its first frames in the buffer
                let mut group = BytesMut::new();

                for frame in frames {
                    encode_amqp_frame(&mut group, frame, max)?;
                }

                buf.extend_from_slice(&group);

                Ok(())
            }
        }
    }
}

impl Decoder for AMQPCodec {
    type Item = Frame;
    type Error = crate::FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(decode_amqp_frame(src, self.frame_max)?.map(Frame::Frame))
    }
}

/// Lazy iterator of the complete frames in a buffer.
///
/// Decoded bytes are consumed from the buffer, an incomplete frame at the end stays there, so
/// after appending more bytes a new `Frames` continues where the previous one stopped. After a
/// decoding error the iterator yields nothing.
pub struct Frames<'a> {
    buf: &'a mut BytesMut,
    frame_max: u32,
    failed: bool,
}

/// Iterate over the frames can be decoded from `buf`.
pub fn frames(buf: &mut BytesMut, frame_max: u32) -> Frames<'_> {
    Frames {
        buf,
        frame_max,
        failed: false,
    }
}

impl Iterator for Frames<'_> {
    type Item = Result<AMQPFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        match decode_amqp_frame(self.buf, self.frame_max) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn max_payload(frame_max: u32) -> usize {
    if frame_max == 0 {
        u32::MAX as usize
    } else {
        (frame_max.max(FRAME_MIN_SIZE) - FRAME_OVERHEAD) as usize
    }
}

fn decode_amqp_frame(src: &mut BytesMut, frame_max: u32) -> Result<Option<AMQPFrame>> {
    if src.is_empty() {
        return Ok(None);
    }

    if src[0] == FRAME_AMQP_VERSION {
        return decode_protocol_header(src);
    }

    match split_raw_frame(src, frame_max)? {
        Some(raw) => Ok(Some(decode_raw_frame(raw)?)),
        None => Ok(None),
    }
}

fn decode_protocol_header(src: &mut BytesMut) -> Result<Option<AMQPFrame>> {
    if src.len() < PROTOCOL_HEADER.len() {
        return Ok(None);
    }

    let head = src.split_to(PROTOCOL_HEADER.len());

    if &head[..] != PROTOCOL_HEADER {
        return frame_error!(FRAME_ERROR, format!("Unsupported protocol header {:?}", &head[..]));
    }

    Ok(Some(AMQPFrame::Header))
}

/// Cut the next complete frame out of the buffer.
///
/// Returns `None` and leaves the buffer untouched if the frame is not complete yet. The frame
/// header is validated as soon as it is available, so a bad frame type or an oversized frame is
/// reported before its payload arrives.
pub fn split_raw_frame(src: &mut BytesMut, frame_max: u32) -> Result<Option<RawFrame>> {
    if src.len() < 7 {
        return Ok(None);
    }

    let frame_type = match FrameType::from_u8(src[0]) {
        Some(ft) => ft,
        None => return frame_error!(FRAME_ERROR, format!("Unknown frame type {}", src[0])),
    };
    let channel = u16::from_be_bytes([src[1], src[2]]);
    let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

    if size > max_payload(frame_max) {
        return frame_error!(
            FRAME_ERROR,
            format!("Frame size {} exceeds the frame limit {}", size, frame_max)
        );
    }

    if src.len() < size + 8 {
        src.reserve(size + 8 - src.len());

        return Ok(None);
    }

    if src[7 + size] != FRAME_END {
        return frame_error!(
            FRAME_ERROR,
            format!("Invalid frame end marker {:02X}", src[7 + size])
        );
    }

    src.advance(7);
    let payload = src.split_to(size).freeze();
    src.advance(1);

    Ok(Some(RawFrame {
        channel,
        frame_type,
        payload,
    }))
}

/// Interpret the payload of a raw frame.
pub fn decode_raw_frame(raw: RawFrame) -> Result<AMQPFrame> {
    let RawFrame {
        channel,
        frame_type,
        mut payload,
    } = raw;

    match frame_type {
        FrameType::Method => decode_method_frame(&mut payload, channel),
        FrameType::Header => decode_content_header_frame(&mut payload, channel),
        FrameType::Body => Ok(AMQPFrame::ContentBody(ContentBodyFrame {
            channel,
            body: payload.to_vec(),
        })),
        FrameType::Heartbeat => {
            if !payload.is_empty() {
                return frame_error!(FRAME_ERROR, "Heartbeat frame with payload");
            }

            Ok(AMQPFrame::Heartbeat(channel))
        }
    }
}

fn decode_method_frame(src: &mut Bytes, channel: u16) -> Result<AMQPFrame> {
    let class_method = get_u32(src)?;

    let method_frame_args = match class_method {
        CONNECTION_START => decode_connection_start(src)?,
        CONNECTION_START_OK => decode_connection_start_ok(src)?,
        CONNECTION_SECURE => MethodFrameArgs::ConnectionSecure(ConnectionSecureArgs {
            challenge: decode_long_string(src)?,
        }),
        CONNECTION_SECURE_OK => MethodFrameArgs::ConnectionSecureOk(ConnectionSecureOkArgs {
            response: decode_long_string(src)?,
        }),
        CONNECTION_TUNE => MethodFrameArgs::ConnectionTune(ConnectionTuneArgs {
            channel_max: get_u16(src)?,
            frame_max: get_u32(src)?,
            heartbeat: get_u16(src)?,
        }),
        CONNECTION_TUNE_OK => MethodFrameArgs::ConnectionTuneOk(ConnectionTuneOkArgs {
            channel_max: get_u16(src)?,
            frame_max: get_u32(src)?,
            heartbeat: get_u16(src)?,
        }),
        CONNECTION_OPEN => decode_connection_open(src)?,
        CONNECTION_OPEN_OK => {
            let _ = decode_short_string(src)?;

            MethodFrameArgs::ConnectionOpenOk
        }
        CONNECTION_CLOSE => MethodFrameArgs::ConnectionClose(ConnectionCloseArgs {
            code: get_u16(src)?,
            text: decode_short_string(src)?,
            class_id: get_u16(src)?,
            method_id: get_u16(src)?,
        }),
        CONNECTION_CLOSE_OK => MethodFrameArgs::ConnectionCloseOk,
        CONNECTION_BLOCKED => MethodFrameArgs::ConnectionBlocked(ConnectionBlockedArgs {
            reason: decode_short_string(src)?,
        }),
        CONNECTION_UNBLOCKED => MethodFrameArgs::ConnectionUnblocked,
        CHANNEL_OPEN => {
            let _ = decode_short_string(src)?;

            MethodFrameArgs::ChannelOpen
        }
        CHANNEL_OPEN_OK => {
            let _ = decode_long_bytes(src)?;

            MethodFrameArgs::ChannelOpenOk
        }
        CHANNEL_FLOW => MethodFrameArgs::ChannelFlow(ChannelFlowArgs { active: get_bool(src)? }),
        CHANNEL_FLOW_OK => MethodFrameArgs::ChannelFlowOk(ChannelFlowArgs { active: get_bool(src)? }),
        CHANNEL_CLOSE => MethodFrameArgs::ChannelClose(ChannelCloseArgs {
            code: get_u16(src)?,
            text: decode_short_string(src)?,
            class_id: get_u16(src)?,
            method_id: get_u16(src)?,
        }),
        CHANNEL_CLOSE_OK => MethodFrameArgs::ChannelCloseOk,
        EXCHANGE_DECLARE => decode_exchange_declare(src)?,
        EXCHANGE_DECLARE_OK => MethodFrameArgs::ExchangeDeclareOk,
        EXCHANGE_DELETE => decode_exchange_delete(src)?,
        EXCHANGE_DELETE_OK => MethodFrameArgs::ExchangeDeleteOk,
        EXCHANGE_BIND => MethodFrameArgs::ExchangeBind(decode_exchange_bind(src)?),
        EXCHANGE_BIND_OK => MethodFrameArgs::ExchangeBindOk,
        EXCHANGE_UNBIND => MethodFrameArgs::ExchangeUnbind(decode_exchange_bind(src)?),
        EXCHANGE_UNBIND_OK => MethodFrameArgs::ExchangeUnbindOk,
        QUEUE_DECLARE => decode_queue_declare(src)?,
        QUEUE_DECLARE_OK => MethodFrameArgs::QueueDeclareOk(QueueDeclareOkArgs {
            name: decode_short_string(src)?,
            message_count: get_u32(src)?,
            consumer_count: get_u32(src)?,
        }),
        QUEUE_BIND => decode_queue_bind(src)?,
        QUEUE_BIND_OK => MethodFrameArgs::QueueBindOk,
        QUEUE_PURGE => decode_queue_purge(src)?,
        QUEUE_PURGE_OK => MethodFrameArgs::QueuePurgeOk(QueueMessageCountArgs {
            message_count: get_u32(src)?,
        }),
        QUEUE_DELETE => decode_queue_delete(src)?,
        QUEUE_DELETE_OK => MethodFrameArgs::QueueDeleteOk(QueueMessageCountArgs {
            message_count: get_u32(src)?,
        }),
        QUEUE_UNBIND => decode_queue_unbind(src)?,
        QUEUE_UNBIND_OK => MethodFrameArgs::QueueUnbindOk,
        BASIC_QOS => MethodFrameArgs::BasicQos(BasicQosArgs {
            prefetch_size: get_u32(src)?,
            prefetch_count: get_u16(src)?,
            global: get_bool(src)?,
        }),
        BASIC_QOS_OK => MethodFrameArgs::BasicQosOk,
        BASIC_CONSUME => decode_basic_consume(src)?,
        BASIC_CONSUME_OK => MethodFrameArgs::BasicConsumeOk(BasicConsumeOkArgs {
            consumer_tag: decode_short_string(src)?,
        }),
        BASIC_CANCEL => MethodFrameArgs::BasicCancel(BasicCancelArgs {
            consumer_tag: decode_short_string(src)?,
            no_wait: get_bool(src)?,
        }),
        BASIC_CANCEL_OK => MethodFrameArgs::BasicCancelOk(BasicCancelOkArgs {
            consumer_tag: decode_short_string(src)?,
        }),
        BASIC_PUBLISH => decode_basic_publish(src)?,
        BASIC_RETURN => MethodFrameArgs::BasicReturn(BasicReturnArgs {
            reply_code: get_u16(src)?,
            reply_text: decode_short_string(src)?,
            exchange_name: decode_short_string(src)?,
            routing_key: decode_short_string(src)?,
        }),
        BASIC_DELIVER => MethodFrameArgs::BasicDeliver(BasicDeliverArgs {
            consumer_tag: decode_short_string(src)?,
            delivery_tag: get_u64(src)?,
            redelivered: get_bool(src)?,
            exchange_name: decode_short_string(src)?,
            routing_key: decode_short_string(src)?,
        }),
        BASIC_GET => decode_basic_get(src)?,
        BASIC_GET_OK => MethodFrameArgs::BasicGetOk(BasicGetOkArgs {
            delivery_tag: get_u64(src)?,
            redelivered: get_bool(src)?,
            exchange_name: decode_short_string(src)?,
            routing_key: decode_short_string(src)?,
            message_count: get_u32(src)?,
        }),
        BASIC_GET_EMPTY => {
            let _ = decode_short_string(src)?;

            MethodFrameArgs::BasicGetEmpty
        }
        BASIC_ACK => MethodFrameArgs::BasicAck(BasicAckArgs {
            delivery_tag: get_u64(src)?,
            multiple: get_bool(src)?,
        }),
        BASIC_REJECT => MethodFrameArgs::BasicReject(BasicRejectArgs {
            delivery_tag: get_u64(src)?,
            requeue: get_bool(src)?,
        }),
        BASIC_RECOVER_ASYNC => MethodFrameArgs::BasicRecoverAsync(BasicRecoverArgs { requeue: get_bool(src)? }),
        BASIC_RECOVER => MethodFrameArgs::BasicRecover(BasicRecoverArgs { requeue: get_bool(src)? }),
        BASIC_RECOVER_OK => MethodFrameArgs::BasicRecoverOk,
        BASIC_NACK => MethodFrameArgs::BasicNack(BasicNackArgs {
            delivery_tag: get_u64(src)?,
            flags: BasicNackFlags::from_bits_truncate(get_u8(src)?),
        }),
        CONFIRM_SELECT => MethodFrameArgs::ConfirmSelect(ConfirmSelectArgs { no_wait: get_bool(src)? }),
        CONFIRM_SELECT_OK => MethodFrameArgs::ConfirmSelectOk,
        _ => {
            return frame_error!(
                COMMAND_INVALID,
                format!("Unknown class method {:08X}", class_method)
            )
        }
    };

    Ok(AMQPFrame::Method(channel, class_method, method_frame_args))
}

fn decode_connection_start(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let args = ConnectionStartArgs {
        version_major: get_u8(src)?,
        version_minor: get_u8(src)?,
        properties: decode_optional_field_table(src)?,
        mechanisms: decode_long_string(src)?,
        locales: decode_long_string(src)?,
    };

    Ok(MethodFrameArgs::ConnectionStart(args))
}

fn decode_connection_start_ok(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let args = ConnectionStartOkArgs {
        properties: decode_optional_field_table(src)?,
        mechanism: decode_short_string(src)?,
        response: decode_long_string(src)?,
        locale: decode_short_string(src)?,
    };

    Ok(MethodFrameArgs::ConnectionStartOk(args))
}

fn decode_connection_open(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let virtual_host = decode_short_string(src)?;
    let _reserved = decode_short_string(src)?;
    let flags = get_u8(src)?;

    Ok(MethodFrameArgs::ConnectionOpen(ConnectionOpenArgs {
        virtual_host,
        insist: flags & 0x01 != 0,
    }))
}

fn decode_exchange_declare(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;

    let args = ExchangeDeclareArgs {
        exchange_name: decode_short_string(src)?,
        exchange_type: decode_short_string(src)?,
        flags: ExchangeDeclareFlags::from_bits_truncate(get_u8(src)?),
        args: decode_optional_field_table(src)?,
    };

    Ok(MethodFrameArgs::ExchangeDeclare(args))
}

fn decode_exchange_delete(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;

    let args = ExchangeDeleteArgs {
        exchange_name: decode_short_string(src)?,
        flags: ExchangeDeleteFlags::from_bits_truncate(get_u8(src)?),
    };

    Ok(MethodFrameArgs::ExchangeDelete(args))
}

fn decode_exchange_bind(src: &mut Bytes) -> Result<ExchangeBindArgs> {
    let _ = get_u16(src)?;

    Ok(ExchangeBindArgs {
        destination: decode_short_string(src)?,
        source: decode_short_string(src)?,
        routing_key: decode_short_string(src)?,
        no_wait: get_bool(src)?,
        args: decode_optional_field_table(src)?,
    })
}

fn decode_queue_declare(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;

    let args = QueueDeclareArgs {
        name: decode_short_string(src)?,
        flags: QueueDeclareFlags::from_bits_truncate(get_u8(src)?),
        args: decode_optional_field_table(src)?,
    };

    Ok(MethodFrameArgs::QueueDeclare(args))
}

fn decode_queue_bind(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;

    let args = QueueBindArgs {
        queue_name: decode_short_string(src)?,
        exchange_name: decode_short_string(src)?,
        routing_key: decode_short_string(src)?,
        no_wait: get_bool(src)?,
        args: decode_optional_field_table(src)?,
    };

    Ok(MethodFrameArgs::QueueBind(args))
}

fn decode_queue_purge(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;

    let args = QueuePurgeArgs {
        queue_name: decode_short_string(src)?,
        no_wait: get_bool(src)?,
    };

    Ok(MethodFrameArgs::QueuePurge(args))
}

fn decode_queue_delete(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;

    let args = QueueDeleteArgs {
        queue_name: decode_short_string(src)?,
        flags: QueueDeleteFlags::from_bits_truncate(get_u8(src)?),
    };

    Ok(MethodFrameArgs::QueueDelete(args))
}

fn decode_queue_unbind(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;

    let args = QueueUnbindArgs {
        queue_name: decode_short_string(src)?,
        exchange_name: decode_short_string(src)?,
        routing_key: decode_short_string(src)?,
        args: decode_optional_field_table(src)?,
    };

    Ok(MethodFrameArgs::QueueUnbind(args))
}

fn decode_basic_consume(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;

    let args = BasicConsumeArgs {
        queue: decode_short_string(src)?,
        consumer_tag: decode_short_string(src)?,
        flags: BasicConsumeFlags::from_bits_truncate(get_u8(src)?),
        args: decode_optional_field_table(src)?,
    };

    Ok(MethodFrameArgs::BasicConsume(args))
}

fn decode_basic_publish(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;

    let args = BasicPublishArgs {
        exchange_name: decode_short_string(src)?,
        routing_key: decode_short_string(src)?,
        flags: BasicPublishFlags::from_bits_truncate(get_u8(src)?),
    };

    Ok(MethodFrameArgs::BasicPublish(args))
}

fn decode_basic_get(src: &mut Bytes) -> Result<MethodFrameArgs> {
    let _ = get_u16(src)?;

    let args = BasicGetArgs {
        queue: decode_short_string(src)?,
        no_ack: get_bool(src)?,
    };

    Ok(MethodFrameArgs::BasicGet(args))
}

fn decode_content_header_frame(src: &mut Bytes, channel: u16) -> Result<AMQPFrame> {
    let mut header = ContentHeaderFrame {
        channel,
        class_id: get_u16(src)?,
        weight: get_u16(src)?,
        body_size: get_u64(src)?,
        ..Default::default()
    };

    let flags = HeaderPropertyFlags::from_bits_truncate(get_u16(src)?);

    if flags.contains(HeaderPropertyFlags::CONTENT_TYPE) {
        header.content_type = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::CONTENT_ENCODING) {
        header.content_encoding = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::HEADERS) {
        header.headers = Some(decode_field_table(src)?);
    }
    if flags.contains(HeaderPropertyFlags::DELIVERY_MODE) {
        header.delivery_mode = Some(get_u8(src)?);
    }
    if flags.contains(HeaderPropertyFlags::PRIORITY) {
        header.priority = Some(get_u8(src)?);
    }
    if flags.contains(HeaderPropertyFlags::CORRELATION_ID) {
        header.correlation_id = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::REPLY_TO) {
        header.reply_to = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::EXPIRATION) {
        header.expiration = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::MESSAGE_ID) {
        header.message_id = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::TIMESTAMP) {
        header.timestamp = Some(get_u64(src)?);
    }
    if flags.contains(HeaderPropertyFlags::MESSAGE_TYPE) {
        header.message_type = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::USER_ID) {
        header.user_id = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::APP_ID) {
        header.app_id = Some(decode_short_string(src)?);
    }
    if flags.contains(HeaderPropertyFlags::CLUSTER_ID) {
        header.cluster_id = Some(decode_short_string(src)?);
    }

    header.prop_flags = flags;

    Ok(AMQPFrame::ContentHeader(header))
}

fn decode_value(buf: &mut Bytes, depth: usize) -> Result<AMQPFieldValue> {
    let value = match get_u8(buf)? {
        b't' => AMQPFieldValue::Bool(get_bool(buf)?),
        b'b' => AMQPFieldValue::I8(get_i8(buf)?),
        b'B' => AMQPFieldValue::U8(get_u8(buf)?),
        b's' => AMQPFieldValue::I16(get_i16(buf)?),
        b'u' => AMQPFieldValue::U16(get_u16(buf)?),
        b'I' => AMQPFieldValue::I32(get_i32(buf)?),
        b'i' => AMQPFieldValue::U32(get_u32(buf)?),
        b'l' => AMQPFieldValue::I64(get_i64(buf)?),
        b'f' => AMQPFieldValue::Float(get_f32(buf)?),
        b'd' => AMQPFieldValue::Double(get_f64(buf)?),
        b'D' => {
            let scale = get_u8(buf)?;
            let value = get_u32(buf)?;

            AMQPFieldValue::Decimal(scale, value)
        }
        // long strings may carry binary data
        b'S' => match String::from_utf8(decode_long_bytes(buf)?) {
            Ok(s) => AMQPFieldValue::LongString(s),
            Err(e) => AMQPFieldValue::Bytes(e.into_bytes()),
        },
        b'x' => AMQPFieldValue::Bytes(decode_long_bytes(buf)?),
        b'T' => AMQPFieldValue::Timestamp(get_u64(buf)?),
        b'A' => {
            check_nesting(depth + 1)?;

            let len = get_u32(buf)? as usize;
            ensure(buf, len)?;

            let mut array_buf = buf.split_to(len);
            let mut values = vec![];

            while array_buf.has_remaining() {
                values.push(decode_value(&mut array_buf, depth + 1)?);
            }

            AMQPFieldValue::FieldArray(values)
        }
        b'F' => AMQPFieldValue::FieldTable(Box::new(decode_nested_field_table(buf, depth + 1)?)),
        b'V' => AMQPFieldValue::Void,
        t => return frame_error!(SYNTAX_ERROR, format!("Unknown field value type {}", t)),
    };

    Ok(value)
}

fn decode_short_string(buf: &mut Bytes) -> Result<String> {
    let len = get_u8(buf)? as usize;
    ensure(buf, len)?;

    let sb = buf.split_to(len);

    match String::from_utf8(sb.to_vec()) {
        Ok(s) => Ok(s),
        Err(_) => frame_error!(SYNTAX_ERROR, "Short string is not valid UTF-8"),
    }
}

fn decode_long_bytes(buf: &mut Bytes) -> Result<Vec<u8>> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;

    Ok(buf.split_to(len).to_vec())
}

fn decode_long_string(buf: &mut Bytes) -> Result<String> {
    match String::from_utf8(decode_long_bytes(buf)?) {
        Ok(s) => Ok(s),
        Err(_) => frame_error!(SYNTAX_ERROR, "Long string is not valid UTF-8"),
    }
}

/// Decode a field table
///
/// The buffer points to the beginning of the field table which is a `u32` length
/// information.
fn decode_field_table(buf: &mut Bytes) -> Result<FieldTable> {
    decode_nested_field_table(buf, 0)
}

fn decode_nested_field_table(buf: &mut Bytes, depth: usize) -> Result<FieldTable> {
    check_nesting(depth)?;

    let ft_len = get_u32(buf)? as usize;
    ensure(buf, ft_len)?;

    let mut ft_buf = buf.split_to(ft_len);
    let mut table = HashMap::new();

    while ft_buf.has_remaining() {
        let field_name = decode_short_string(&mut ft_buf)?;
        let field_value = decode_value(&mut ft_buf, depth)?;

        table.insert(field_name, field_value);
    }

    Ok(table)
}

/// Method arguments represent an empty table with `None`.
fn decode_optional_field_table(buf: &mut Bytes) -> Result<Option<FieldTable>> {
    let table = decode_field_table(buf)?;

    if table.is_empty() {
        Ok(None)
    } else {
        Ok(Some(table))
    }
}

fn check_nesting(depth: usize) -> Result<()> {
    if depth > MAX_FIELD_NESTING {
        return frame_error!(
            SYNTAX_ERROR,
            format!("Field values are nested deeper than {}", MAX_FIELD_NESTING)
        );
    }

    Ok(())
}

fn ensure(buf: &Bytes, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return frame_error!(
            SYNTAX_ERROR,
            format!("Frame is truncated, {} more bytes expected", len - buf.remaining())
        );
    }

    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

fn get_i8(buf: &mut Bytes) -> Result<i8> {
    ensure(buf, 1)?;
    Ok(buf.get_i8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_i16(buf: &mut Bytes) -> Result<i16> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

fn get_f32(buf: &mut Bytes) -> Result<f32> {
    ensure(buf, 4)?;
    Ok(buf.get_f32())
}

fn get_f64(buf: &mut Bytes) -> Result<f64> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

fn encode_amqp_frame(buf: &mut BytesMut, frame: AMQPFrame, max_payload: usize) -> Result<()> {
    match frame {
        AMQPFrame::Header => {
            buf.put(&PROTOCOL_HEADER[..]);

            Ok(())
        }
        AMQPFrame::Method(ch, cm, args) => encode_method_frame(buf, ch, cm, &args, max_payload),
        AMQPFrame::ContentHeader(header_frame) => encode_content_header_frame(buf, &header_frame, max_payload),
        AMQPFrame::ContentBody(body_frame) => {
            encode_content_body_frame(buf, &body_frame, max_payload);

            Ok(())
        }
        AMQPFrame::Heartbeat(channel) => {
            write_frame(buf, FRAME_HEARTBEAT, channel, &[]);

            Ok(())
        }
    }
}

fn write_frame(buf: &mut BytesMut, frame_type: u8, channel: Channel, payload: &[u8]) {
    buf.reserve(payload.len() + FRAME_OVERHEAD as usize);
    buf.put_u8(frame_type);
    buf.put_u16(channel);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.put_u8(FRAME_END);
}

fn check_frame_size(len: usize, max_payload: usize) -> Result<()> {
    if len > max_payload {
        return frame_error!(
            FRAME_ERROR,
            format!("Frame payload of {} bytes exceeds the limit {}", len, max_payload)
        );
    }

    Ok(())
}

fn encode_method_frame(
    buf: &mut BytesMut,
    channel: Channel,
    cm: ClassMethod,
    args: &MethodFrameArgs,
    max_payload: usize,
) -> Result<()> {
    let mut fr = BytesMut::with_capacity(256);
    fr.put_u32(cm);

    match args {
        MethodFrameArgs::ConnectionStart(args) => encode_connection_start(&mut fr, args)?,
        MethodFrameArgs::ConnectionStartOk(args) => encode_connection_start_ok(&mut fr, args)?,
        MethodFrameArgs::ConnectionSecure(args) => encode_long_string(&mut fr, &args.challenge),
        MethodFrameArgs::ConnectionSecureOk(args) => encode_long_string(&mut fr, &args.response),
        MethodFrameArgs::ConnectionTune(args) => {
            fr.put_u16(args.channel_max);
            fr.put_u32(args.frame_max);
            fr.put_u16(args.heartbeat);
        }
        MethodFrameArgs::ConnectionTuneOk(args) => {
            fr.put_u16(args.channel_max);
            fr.put_u32(args.frame_max);
            fr.put_u16(args.heartbeat);
        }
        MethodFrameArgs::ConnectionOpen(args) => encode_connection_open(&mut fr, args)?,
        // reserved short string
        MethodFrameArgs::ConnectionOpenOk => fr.put_u8(0),
        MethodFrameArgs::ConnectionClose(args) => {
            fr.put_u16(args.code);
            encode_short_string(&mut fr, &args.text)?;
            fr.put_u16(args.class_id);
            fr.put_u16(args.method_id);
        }
        MethodFrameArgs::ConnectionCloseOk => (),
        MethodFrameArgs::ConnectionBlocked(args) => encode_short_string(&mut fr, &args.reason)?,
        MethodFrameArgs::ConnectionUnblocked => (),
        // reserved short string
        MethodFrameArgs::ChannelOpen => fr.put_u8(0),
        // reserved long string
        MethodFrameArgs::ChannelOpenOk => fr.put_u32(0),
        MethodFrameArgs::ChannelFlow(args) => fr.put_u8(u8::from(args.active)),
        MethodFrameArgs::ChannelFlowOk(args) => fr.put_u8(u8::from(args.active)),
        MethodFrameArgs::ChannelClose(args) => {
            fr.put_u16(args.code);
            encode_short_string(&mut fr, &args.text)?;
            fr.put_u16(args.class_id);
            fr.put_u16(args.method_id);
        }
        MethodFrameArgs::ChannelCloseOk => (),
        MethodFrameArgs::ExchangeDeclare(args) => encode_exchange_declare(&mut fr, args)?,
        MethodFrameArgs::ExchangeDeclareOk => (),
        MethodFrameArgs::ExchangeDelete(args) => {
            fr.put_u16(0);
            encode_short_string(&mut fr, &args.exchange_name)?;
            fr.put_u8(args.flags.bits());
        }
        MethodFrameArgs::ExchangeDeleteOk => (),
        MethodFrameArgs::ExchangeBind(args) => encode_exchange_bind(&mut fr, args)?,
        MethodFrameArgs::ExchangeBindOk => (),
        MethodFrameArgs::ExchangeUnbind(args) => encode_exchange_bind(&mut fr, args)?,
        MethodFrameArgs::ExchangeUnbindOk => (),
        MethodFrameArgs::QueueDeclare(args) => {
            fr.put_u16(0);
            encode_short_string(&mut fr, &args.name)?;
            fr.put_u8(args.flags.bits());
            encode_field_table(&mut fr, args.args.as_ref())?;
        }
        MethodFrameArgs::QueueDeclareOk(args) => {
            encode_short_string(&mut fr, &args.name)?;
            fr.put_u32(args.message_count);
            fr.put_u32(args.consumer_count);
        }
        MethodFrameArgs::QueueBind(args) => encode_queue_bind(&mut fr, args)?,
        MethodFrameArgs::QueueBindOk => (),
        MethodFrameArgs::QueuePurge(args) => {
            fr.put_u16(0);
            encode_short_string(&mut fr, &args.queue_name)?;
            fr.put_u8(u8::from(args.no_wait));
        }
        MethodFrameArgs::QueuePurgeOk(args) => fr.put_u32(args.message_count),
        MethodFrameArgs::QueueDelete(args) => {
            fr.put_u16(0);
            encode_short_string(&mut fr, &args.queue_name)?;
            fr.put_u8(args.flags.bits());
        }
        MethodFrameArgs::QueueDeleteOk(args) => fr.put_u32(args.message_count),
        MethodFrameArgs::QueueUnbind(args) => encode_queue_unbind(&mut fr, args)?,
        MethodFrameArgs::QueueUnbindOk => (),
        MethodFrameArgs::BasicQos(args) => {
            fr.put_u32(args.prefetch_size);
            fr.put_u16(args.prefetch_count);
            fr.put_u8(u8::from(args.global));
        }
        MethodFrameArgs::BasicQosOk => (),
        MethodFrameArgs::BasicConsume(args) => encode_basic_consume(&mut fr, args)?,
        MethodFrameArgs::BasicConsumeOk(args) => encode_short_string(&mut fr, &args.consumer_tag)?,
        MethodFrameArgs::BasicCancel(args) => {
            encode_short_string(&mut fr, &args.consumer_tag)?;
            fr.put_u8(u8::from(args.no_wait));
        }
        MethodFrameArgs::BasicCancelOk(args) => encode_short_string(&mut fr, &args.consumer_tag)?,
        MethodFrameArgs::BasicPublish(args) => {
            fr.put_u16(0);
            encode_short_string(&mut fr, &args.exchange_name)?;
            encode_short_string(&mut fr, &args.routing_key)?;
            fr.put_u8(args.flags.bits());
        }
        MethodFrameArgs::BasicReturn(args) => {
            fr.put_u16(args.reply_code);
            encode_short_string(&mut fr, &args.reply_text)?;
            encode_short_string(&mut fr, &args.exchange_name)?;
            encode_short_string(&mut fr, &args.routing_key)?;
        }
        MethodFrameArgs::BasicDeliver(args) => {
            encode_short_string(&mut fr, &args.consumer_tag)?;
            fr.put_u64(args.delivery_tag);
            fr.put_u8(u8::from(args.redelivered));
            encode_short_string(&mut fr, &args.exchange_name)?;
            encode_short_string(&mut fr, &args.routing_key)?;
        }
        MethodFrameArgs::BasicGet(args) => {
            fr.put_u16(0);
            encode_short_string(&mut fr, &args.queue)?;
            fr.put_u8(u8::from(args.no_ack));
        }
        MethodFrameArgs::BasicGetOk(args) => {
            fr.put_u64(args.delivery_tag);
            fr.put_u8(u8::from(args.redelivered));
            encode_short_string(&mut fr, &args.exchange_name)?;
            encode_short_string(&mut fr, &args.routing_key)?;
            fr.put_u32(args.message_count);
        }
        // reserved short string
        MethodFrameArgs::BasicGetEmpty => fr.put_u8(0),
        MethodFrameArgs::BasicAck(args) => {
            fr.put_u64(args.delivery_tag);
            fr.put_u8(u8::from(args.multiple));
        }
        MethodFrameArgs::BasicReject(args) => {
            fr.put_u64(args.delivery_tag);
            fr.put_u8(u8::from(args.requeue));
        }
        MethodFrameArgs::BasicRecoverAsync(args) => fr.put_u8(u8::from(args.requeue)),
        MethodFrameArgs::BasicRecover(args) => fr.put_u8(u8::from(args.requeue)),
        MethodFrameArgs::BasicRecoverOk => (),
        MethodFrameArgs::BasicNack(args) => {
            fr.put_u64(args.delivery_tag);
            fr.put_u8(args.flags.bits());
        }
        MethodFrameArgs::ConfirmSelect(args) => fr.put_u8(u8::from(args.no_wait)),
        MethodFrameArgs::ConfirmSelectOk => (),
    }

    check_frame_size(fr.len(), max_payload)?;
    write_frame(buf, FRAME_METHOD_FRAME, channel, &fr);

    Ok(())
}

fn encode_connection_start(buf: &mut BytesMut, args: &ConnectionStartArgs) -> Result<()> {
    buf.put_u8(args.version_major);
    buf.put_u8(args.version_minor);
    encode_field_table(buf, args.properties.as_ref())?;
    encode_long_string(buf, &args.mechanisms);
    encode_long_string(buf, &args.locales);

    Ok(())
}

fn encode_connection_start_ok(buf: &mut BytesMut, args: &ConnectionStartOkArgs) -> Result<()> {
    encode_field_table(buf, args.properties.as_ref())?;
    encode_short_string(buf, &args.mechanism)?;
    encode_long_string(buf, &args.response);
    encode_short_string(buf, &args.locale)
}

fn encode_connection_open(buf: &mut BytesMut, args: &ConnectionOpenArgs) -> Result<()> {
    encode_short_string(buf, &args.virtual_host)?;
    encode_short_string(buf, "")?;
    buf.put_u8(u8::from(args.insist));

    Ok(())
}

fn encode_exchange_declare(buf: &mut BytesMut, args: &ExchangeDeclareArgs) -> Result<()> {
    buf.put_u16(0);
    encode_short_string(buf, &args.exchange_name)?;
    encode_short_string(buf, &args.exchange_type)?;
    buf.put_u8(args.flags.bits());
    encode_field_table(buf, args.args.as_ref())
}

fn encode_exchange_bind(buf: &mut BytesMut, args: &ExchangeBindArgs) -> Result<()> {
    buf.put_u16(0);
    encode_short_string(buf, &args.destination)?;
    encode_short_string(buf, &args.source)?;
    encode_short_string(buf, &args.routing_key)?;
    buf.put_u8(u8::from(args.no_wait));
    encode_field_table(buf, args.args.as_ref())
}

fn encode_queue_bind(buf: &mut BytesMut, args: &QueueBindArgs) -> Result<()> {
    buf.put_u16(0);
    encode_short_string(buf, &args.queue_name)?;
    encode_short_string(buf, &args.exchange_name)?;
    encode_short_string(buf, &args.routing_key)?;
    buf.put_u8(u8::from(args.no_wait));
    encode_field_table(buf, args.args.as_ref())
}

fn encode_queue_unbind(buf: &mut BytesMut, args: &QueueUnbindArgs) -> Result<()> {
    buf.put_u16(0);
    encode_short_string(buf, &args.queue_name)?;
    encode_short_string(buf, &args.exchange_name)?;
    encode_short_string(buf, &args.routing_key)?;
    encode_field_table(buf, args.args.as_ref())
}

fn encode_basic_consume(buf: &mut BytesMut, args: &BasicConsumeArgs) -> Result<()> {
    buf.put_u16(0);
    encode_short_string(buf, &args.queue)?;
    encode_short_string(buf, &args.consumer_tag)?;
    buf.put_u8(args.flags.bits());
    encode_field_table(buf, args.args.as_ref())
}

fn encode_content_header_frame(buf: &mut BytesMut, hf: &ContentHeaderFrame, max_payload: usize) -> Result<()> {
    let mut fr_buf = BytesMut::with_capacity(256);
    fr_buf.put_u16(hf.class_id);
    fr_buf.put_u16(hf.weight);
    fr_buf.put_u64(hf.body_size);
    fr_buf.put_u16(hf.computed_flags().bits());

    if let Some(ref v) = hf.content_type {
        encode_short_string(&mut fr_buf, v)?;
    }
    if let Some(ref v) = hf.content_encoding {
        encode_short_string(&mut fr_buf, v)?;
    }
    if let Some(ref v) = hf.headers {
        encode_field_table(&mut fr_buf, Some(v))?;
    }
    if let Some(v) = hf.delivery_mode {
        fr_buf.put_u8(v);
    }
    if let Some(v) = hf.priority {
        fr_buf.put_u8(v);
    }
    if let Some(ref v) = hf.correlation_id {
        encode_short_string(&mut fr_buf, v)?;
    }
    if let Some(ref v) = hf.reply_to {
        encode_short_string(&mut fr_buf, v)?;
    }
    if let Some(ref v) = hf.expiration {
        encode_short_string(&mut fr_buf, v)?;
    }
    if let Some(ref v) = hf.message_id {
        encode_short_string(&mut fr_buf, v)?;
    }
    if let Some(v) = hf.timestamp {
        fr_buf.put_u64(v);
    }
    if let Some(ref v) = hf.message_type {
        encode_short_string(&mut fr_buf, v)?;
    }
    if let Some(ref v) = hf.user_id {
        encode_short_string(&mut fr_buf, v)?;
    }
    if let Some(ref v) = hf.app_id {
        encode_short_string(&mut fr_buf, v)?;
    }
    if let Some(ref v) = hf.cluster_id {
        encode_short_string(&mut fr_buf, v)?;
    }

    check_frame_size(fr_buf.len(), max_payload)?;
    write_frame(buf, FRAME_CONTENT_HEADER, hf.channel, &fr_buf);

    Ok(())
}

/// Bodies are split into chunks which fit into the negotiated frame size.
fn encode_content_body_frame(buf: &mut BytesMut, bf: &ContentBodyFrame, max_payload: usize) {
    if bf.body.is_empty() {
        write_frame(buf, FRAME_CONTENT_BODY, bf.channel, &[]);
        return;
    }

    for chunk in bf.body.chunks(max_payload) {
        write_frame(buf, FRAME_CONTENT_BODY, bf.channel, chunk);
    }
}

fn encode_short_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u8::MAX as usize {
        return frame_error!(
            SYNTAX_ERROR,
            format!("Short string is too long ({} bytes)", s.len())
        );
    }

    buf.put_u8(s.len() as u8);
    buf.put(s.as_bytes());

    Ok(())
}

fn encode_long_string(buf: &mut BytesMut, s: &str) {
    encode_long_bytes(buf, s.as_bytes());
}

fn encode_long_bytes(buf: &mut BytesMut, bs: &[u8]) {
    buf.put_u32(bs.len() as u32);
    buf.put(bs);
}

fn encode_field_table(buf: &mut BytesMut, ft: Option<&FieldTable>) -> Result<()> {
    let table = match ft {
        None => {
            buf.put_u32(0);
            return Ok(());
        }
        Some(t) => t,
    };

    let mut ft_buf = BytesMut::with_capacity(256);

    for (name, value) in table {
        encode_short_string(&mut ft_buf, name)?;
        encode_value(&mut ft_buf, value)?;
    }

    buf.put_u32(ft_buf.len() as u32);
    buf.put(ft_buf);

    Ok(())
}

fn encode_value(buf: &mut BytesMut, value: &AMQPFieldValue) -> Result<()> {
    match value {
        AMQPFieldValue::Bool(v) => {
            buf.put_u8(b't');
            buf.put_u8(u8::from(*v));
        }
        AMQPFieldValue::I8(v) => {
            buf.put_u8(b'b');
            buf.put_i8(*v);
        }
        AMQPFieldValue::U8(v) => {
            buf.put_u8(b'B');
            buf.put_u8(*v);
        }
        AMQPFieldValue::I16(v) => {
            buf.put_u8(b's');
            buf.put_i16(*v);
        }
        AMQPFieldValue::U16(v) => {
            buf.put_u8(b'u');
            buf.put_u16(*v);
        }
        AMQPFieldValue::I32(v) => {
            buf.put_u8(b'I');
            buf.put_i32(*v);
        }
        AMQPFieldValue::U32(v) => {
            buf.put_u8(b'i');
            buf.put_u32(*v);
        }
        AMQPFieldValue::I64(v) => {
            buf.put_u8(b'l');
            buf.put_i64(*v);
        }
        AMQPFieldValue::Float(v) => {
            buf.put_u8(b'f');
            buf.put_f32(*v);
        }
        AMQPFieldValue::Double(v) => {
            buf.put_u8(b'd');
            buf.put_f64(*v);
        }
        AMQPFieldValue::Decimal(scale, v) => {
            buf.put_u8(b'D');
            buf.put_u8(*scale);
            buf.put_u32(*v);
        }
        AMQPFieldValue::LongString(v) => {
            buf.put_u8(b'S');
            encode_long_string(buf, v);
        }
        AMQPFieldValue::Bytes(v) => {
            buf.put_u8(b'x');
            encode_long_bytes(buf, v);
        }
        AMQPFieldValue::Timestamp(v) => {
            buf.put_u8(b'T');
            buf.put_u64(*v);
        }
        AMQPFieldValue::FieldArray(values) => {
            buf.put_u8(b'A');

            let mut array_buf = BytesMut::with_capacity(64);

            for v in values {
                encode_value(&mut array_buf, v)?;
            }

            buf.put_u32(array_buf.len() as u32);
            buf.put(array_buf);
        }
        AMQPFieldValue::FieldTable(v) => {
            buf.put_u8(b'F');
            encode_field_table(buf, Some(v.as_ref()))?;
        }
        AMQPFieldValue::Void => buf.put_u8(b'V'),
    }

    Ok(())
}
