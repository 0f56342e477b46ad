use amqpstorm_client::{
    Channel, ChannelNumber, ClassMethod, ClientError, Connection, ConnectionConfig, ConsumerHandler, ConsumerSignal,
    DeliveredMessage, EventSignal, Exclusive, NoAck, NoLocal, Transport,
};
use amqpstorm_codec::codec::{AMQPCodec, Frame};
use amqpstorm_codec::frame::{self, AMQPFrame, ContentBodyFrame, ContentHeaderFrame, MethodFrameArgs};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Server side of an in-memory connection, the test drives it frame by frame.
pub struct Broker {
    pub framed: Framed<DuplexStream, AMQPCodec>,
    pub start_ok: frame::ConnectionStartOkArgs,
    pub tune_ok: frame::ConnectionTuneOkArgs,
    pub open: frame::ConnectionOpenArgs,
}

#[allow(dead_code)]
pub fn tune(channel_max: u16, frame_max: u32, heartbeat: u16) -> frame::ConnectionTuneArgs {
    frame::ConnectionTuneArgs {
        channel_max,
        frame_max,
        heartbeat,
    }
}

/// Config without heartbeats, tests which need them switch them on.
#[allow(dead_code)]
pub fn default_config() -> ConnectionConfig {
    ConnectionConfig::default().heartbeat(0).timeout(5)
}

/// Connect a client to a fake broker which accepts the handshake with the given tune.
#[allow(dead_code)]
pub async fn connect(config: ConnectionConfig, tune: frame::ConnectionTuneArgs) -> (Connection, Broker) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let transport: Transport = Box::new(client_io);

    let client = tokio::spawn(Connection::connect_with(transport, config));

    let mut framed = Framed::new(server_io, AMQPCodec::default());

    match next_frame(&mut framed).await {
        AMQPFrame::Header => {}
        other => panic!("Expected protocol header {other:?}"),
    }

    send_to(&mut framed, frame::ConnectionStartArgs::new().frame()).await;

    let start_ok = match next_frame(&mut framed).await {
        AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionStartOk(args)) => args,
        other => panic!("Expected Connection.StartOk {other:?}"),
    };

    send_to(&mut framed, tune.frame()).await;

    let tune_ok = match next_frame(&mut framed).await {
        AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionTuneOk(args)) => args,
        other => panic!("Expected Connection.TuneOk {other:?}"),
    };

    framed.codec_mut().frame_max = tune_ok.frame_max;

    let open = match next_frame(&mut framed).await {
        AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionOpen(args)) => args,
        other => panic!("Expected Connection.Open {other:?}"),
    };

    send_to(&mut framed, frame::connection_open_ok()).await;

    let conn = client.await.unwrap().unwrap();

    let broker = Broker {
        framed,
        start_ok,
        tune_ok,
        open,
    };

    (conn, broker)
}

async fn next_frame(framed: &mut Framed<DuplexStream, AMQPCodec>) -> AMQPFrame {
    match tokio::time::timeout(Duration::from_secs(10), framed.next()).await {
        Ok(Some(Ok(Frame::Frame(f)))) => f,
        other => panic!("Expected a single frame {other:?}"),
    }
}

async fn send_to(framed: &mut Framed<DuplexStream, AMQPCodec>, frame: AMQPFrame) {
    framed.send(Frame::Frame(frame)).await.unwrap();
}

#[allow(dead_code)]
impl Broker {
    /// Next frame from the client, heartbeats are skipped.
    pub async fn recv(&mut self) -> AMQPFrame {
        loop {
            match next_frame(&mut self.framed).await {
                AMQPFrame::Heartbeat(_) => continue,
                f => return f,
            }
        }
    }

    /// Next frame including heartbeats, `None` if the client closed the socket.
    pub async fn recv_raw(&mut self) -> Option<AMQPFrame> {
        match self.framed.next().await {
            Some(Ok(Frame::Frame(f))) => Some(f),
            Some(other) => panic!("Unexpected frame {other:?}"),
            None => None,
        }
    }

    /// Next method frame, with its channel, class-method and arguments.
    pub async fn recv_method(&mut self) -> (ChannelNumber, ClassMethod, MethodFrameArgs) {
        match self.recv().await {
            AMQPFrame::Method(ch, cm, args) => (ch, cm, args),
            other => panic!("Expected a method frame {other:?}"),
        }
    }

    pub async fn send(&mut self, frame: AMQPFrame) {
        send_to(&mut self.framed, frame).await;
    }

    /// Expect the `expected` request, answer it with `reply` and return the request arguments.
    pub async fn reply(&mut self, expected: ClassMethod, reply: AMQPFrame) -> MethodFrameArgs {
        match self.recv_method().await {
            (ch, cm, args) if cm == expected => {
                assert_eq!(ch, reply.channel());

                self.send(reply).await;

                args
            }
            other => panic!("Expected {expected:08X} {other:?}"),
        }
    }

    /// Reply `OpenOk` to the next `Channel.Open`.
    pub async fn accept_channel(&mut self) -> ChannelNumber {
        match self.recv_method().await {
            (ch, frame::CHANNEL_OPEN, _) => {
                self.send(frame::channel_open_ok(ch)).await;
                ch
            }
            other => panic!("Expected Channel.Open {other:?}"),
        }
    }

    /// Send a message as a header and body frames split to `chunk` sized pieces.
    pub async fn send_content(&mut self, channel: ChannelNumber, body: &[u8], chunk: usize) {
        let header = ContentHeaderFrame {
            channel,
            class_id: frame::BASIC_CLASS,
            body_size: body.len() as u64,
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };

        self.send(header.frame()).await;

        for piece in body.chunks(chunk) {
            self.send(
                ContentBodyFrame {
                    channel,
                    body: piece.to_vec(),
                }
                .frame(),
            )
            .await;
        }
    }
}

/// Open a channel while the broker accepts it.
#[allow(dead_code)]
pub async fn open_channel(conn: &Connection, broker: &mut Broker) -> Channel {
    let (channel, number) = tokio::join!(conn.channel(), broker.accept_channel());
    let channel = channel.unwrap();

    assert_eq!(channel.channel, number);

    channel
}

/// Start consuming a queue while the broker accepts the consumer.
#[allow(dead_code)]
pub async fn consume(channel: &Channel, broker: &mut Broker, queue: &str) -> ConsumerHandler {
    let (handler, _) = tokio::join!(
        channel.basic_consume(queue, NoAck(false), Exclusive(false), NoLocal(false)),
        async {
            match broker.recv_method().await {
                (ch, _, MethodFrameArgs::BasicConsume(args)) => {
                    assert_eq!(args.queue, queue);

                    broker
                        .send(frame::BasicConsumeOkArgs::new(&args.consumer_tag).frame(ch))
                        .await;
                }
                other => panic!("Expected Basic.Consume {other:?}"),
            }
        }
    );

    handler.unwrap()
}

#[allow(dead_code)]
pub fn to_client_error<T: std::fmt::Debug>(result: anyhow::Result<T>) -> ClientError {
    result.unwrap_err().downcast::<ClientError>().unwrap()
}

#[allow(dead_code)]
pub fn unwrap_delivered_message(signal: ConsumerSignal) -> DeliveredMessage {
    match signal {
        ConsumerSignal::Delivered(msg) => *msg,
        other => panic!("{other:?} is not a Delivered signal"),
    }
}

/// Next event, panics if nothing arrives in a few seconds.
#[allow(dead_code)]
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<EventSignal>) -> EventSignal {
    match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Some(event)) => event,
        other => panic!("No event {other:?}"),
    }
}
