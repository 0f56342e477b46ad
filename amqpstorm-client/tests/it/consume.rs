use std::time::Duration;

use amqpstorm_client::*;
use amqpstorm_codec::frame::{self, AMQPFrame, MethodFrameArgs};

use crate::helper;

#[tokio::test]
async fn publish_splits_the_body_by_frame_max() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 4096, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let body = vec![b'x'; 10_000];
    let message = PublishedMessage::default()
        .body(body.clone())
        .content_type("application/octet-stream")
        .mandatory(true);

    channel.basic_publish("orders", "new", message).await.unwrap();

    match broker.recv_method().await {
        (1, frame::BASIC_PUBLISH, MethodFrameArgs::BasicPublish(args)) => {
            assert_eq!(args.exchange_name, "orders");
            assert_eq!(args.routing_key, "new");
            assert!(args.is_mandatory());
            assert!(!args.is_immediate());
        }
        other => panic!("Expected Basic.Publish {other:?}"),
    }

    match broker.recv().await {
        AMQPFrame::ContentHeader(header) => {
            assert_eq!(header.body_size, 10_000);
            assert_eq!(header.content_type.as_deref(), Some("application/octet-stream"));
        }
        other => panic!("Expected content header {other:?}"),
    }

    let mut received = vec![];
    let mut sizes = vec![];

    while received.len() < body.len() {
        match broker.recv().await {
            AMQPFrame::ContentBody(chunk) => {
                sizes.push(chunk.body.len());
                received.extend(chunk.body);
            }
            other => panic!("Expected content body {other:?}"),
        }
    }

    assert_eq!(sizes, vec![4088, 4088, 1824]);
    assert_eq!(received, body);
}

#[tokio::test]
async fn empty_message_has_no_body_frame() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    channel.basic_publish("", "jobs", PublishedMessage::default()).await.unwrap();
    channel.basic_publish("", "jobs", PublishedMessage::from("next")).await.unwrap();

    assert!(matches!(broker.recv_method().await, (1, frame::BASIC_PUBLISH, _)));
    assert!(matches!(broker.recv().await, AMQPFrame::ContentHeader(h) if h.body_size == 0));

    // the next frame belongs to the second message
    assert!(matches!(broker.recv_method().await, (1, frame::BASIC_PUBLISH, _)));
    assert!(matches!(broker.recv().await, AMQPFrame::ContentHeader(h) if h.body_size == 4));
    assert!(matches!(broker.recv().await, AMQPFrame::ContentBody(b) if b.body == b"next"));
}

#[tokio::test]
async fn delivered_message_is_assembled_from_chunks() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;
    let mut consumer = helper::consume(&channel, &mut broker, "jobs").await;

    assert!(consumer.consumer_tag.starts_with("amqpstorm-"));

    broker
        .send(
            frame::BasicDeliverArgs::new(&consumer.consumer_tag, 7, "orders")
                .routing_key("new")
                .frame(1),
        )
        .await;
    broker.send_content(1, "Hello, world".as_bytes(), 5).await;

    let message = helper::unwrap_delivered_message(consumer.receive(Duration::from_secs(5)).await.unwrap());

    assert_eq!(message.consumer_tag, consumer.consumer_tag);
    assert_eq!(message.delivery_tag, 7);
    assert_eq!(message.exchange, "orders");
    assert_eq!(message.routing_key, "new");
    assert_eq!(message.message.channel, 1);
    assert_eq!(message.message.body, b"Hello, world");
    assert_eq!(message.message.properties.content_type.as_deref(), Some("text/plain"));
    assert_eq!(
        message.message.decoded_body(),
        Utf8Decoded::Text("Hello, world".to_string())
    );

    consumer.basic_ack(message.delivery_tag).await.unwrap();

    match broker.recv_method().await {
        (1, frame::BASIC_ACK, MethodFrameArgs::BasicAck(args)) => {
            assert_eq!(args.delivery_tag, 7);
            assert!(!args.multiple);
        }
        other => panic!("Expected Basic.Ack {other:?}"),
    }

    consumer.basic_nack(8, true, false).await.unwrap();

    match broker.recv_method().await {
        (1, frame::BASIC_NACK, MethodFrameArgs::BasicNack(args)) => {
            assert_eq!(args.delivery_tag, 8);
            assert!(args.flags.contains(frame::BasicNackFlags::MULTIPLE));
            assert!(!args.flags.contains(frame::BasicNackFlags::REQUEUE));
        }
        other => panic!("Expected Basic.Nack {other:?}"),
    }
}

#[tokio::test]
async fn method_in_the_middle_of_a_content_is_a_violation() {
    let (mut conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let mut events = conn.take_events().unwrap();
    let channel = helper::open_channel(&conn, &mut broker).await;
    let consumer = helper::consume(&channel, &mut broker, "jobs").await;

    broker
        .send(frame::BasicDeliverArgs::new(&consumer.consumer_tag, 1, "").frame(1))
        .await;
    broker
        .send(frame::BasicDeliverArgs::new(&consumer.consumer_tag, 2, "").frame(1))
        .await;

    match broker.recv_method().await {
        (0, frame::CONNECTION_CLOSE, MethodFrameArgs::ConnectionClose(args)) => assert_eq!(args.code, 505),
        other => panic!("Expected Connection.Close {other:?}"),
    }

    assert!(matches!(
        helper::next_event(&mut events).await,
        EventSignal::ConnectionClosed(ClientError {
            kind: ErrorKind::ProtocolViolation,
            ..
        })
    ));
}

#[tokio::test]
async fn client_cancel_ends_the_signal_stream() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;
    let mut consumer = helper::consume(&channel, &mut broker, "jobs").await;

    let (cancelled, _) = tokio::join!(consumer.basic_cancel(), async {
        match broker.recv_method().await {
            (1, frame::BASIC_CANCEL, MethodFrameArgs::BasicCancel(args)) => {
                broker
                    .send(frame::BasicCancelOkArgs::new(&args.consumer_tag).frame(1))
                    .await
            }
            other => panic!("Expected Basic.Cancel {other:?}"),
        }
    });

    cancelled.unwrap();

    assert!(matches!(consumer.signal_stream.recv().await, Some(ConsumerSignal::Cancelled)));
    // the sender is dropped with the consumer
    assert!(consumer.signal_stream.recv().await.is_none());
}

#[tokio::test]
async fn server_cancel_is_acknowledged() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;
    let mut consumer = helper::consume(&channel, &mut broker, "jobs").await;

    broker
        .send(frame::BasicCancelArgs::new(&consumer.consumer_tag).frame(1))
        .await;

    match broker.recv_method().await {
        (1, frame::BASIC_CANCEL_OK, MethodFrameArgs::BasicCancelOk(args)) => {
            assert_eq!(args.consumer_tag, consumer.consumer_tag)
        }
        other => panic!("Expected Basic.CancelOk {other:?}"),
    }

    assert!(matches!(
        consumer.receive(Duration::from_secs(5)).await,
        Some(ConsumerSignal::Cancelled)
    ));
    assert!(channel.is_open());
}

#[tokio::test]
async fn peer_channel_close_reaches_the_consumer() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;
    let mut consumer = helper::consume(&channel, &mut broker, "jobs").await;

    broker
        .send(frame::ChannelCloseArgs::new(404, "NOT_FOUND - queue deleted", 0).frame(1))
        .await;

    match consumer.receive(Duration::from_secs(5)).await {
        Some(ConsumerSignal::ChannelClosed {
            reply_code, reply_text, ..
        }) => {
            assert_eq!(reply_code, 404);
            assert_eq!(reply_text, "NOT_FOUND - queue deleted");
        }
        other => panic!("{other:?}"),
    }

    assert!(matches!(broker.recv_method().await, (1, frame::CHANNEL_CLOSE_OK, _)));
    assert!(conn.is_open());
}

#[tokio::test]
async fn basic_get_returns_message_or_none() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let (message, _) = tokio::join!(channel.basic_get("jobs", NoAck(true)), async {
        match broker.recv_method().await {
            (1, frame::BASIC_GET, MethodFrameArgs::BasicGet(args)) => {
                assert_eq!(args.queue, "jobs");
                assert!(args.no_ack);
            }
            other => panic!("Expected Basic.Get {other:?}"),
        }

        broker
            .send(
                frame::BasicGetOkArgs::new(3, "orders")
                    .routing_key("new")
                    .message_count(41)
                    .frame(1),
            )
            .await;
        broker.send_content(1, b"order #3", 1024).await;
    });

    let message = message.unwrap().unwrap();

    assert_eq!(message.delivery_tag, 3);
    assert_eq!(message.exchange, "orders");
    assert_eq!(message.routing_key, "new");
    assert_eq!(message.message_count, 41);
    assert_eq!(message.message.body, b"order #3");

    let (empty, _) = tokio::join!(channel.basic_get("jobs", NoAck(true)), async {
        assert!(matches!(broker.recv_method().await, (1, frame::BASIC_GET, _)));

        broker
            .send(AMQPFrame::Method(1, frame::BASIC_GET_EMPTY, MethodFrameArgs::BasicGetEmpty))
            .await;
    });

    assert!(empty.unwrap().is_none());
}

#[tokio::test]
async fn returned_messages_and_confirms_are_events() {
    let (mut conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let mut events = conn.take_events().unwrap();
    let channel = helper::open_channel(&conn, &mut broker).await;

    let (selected, _) = tokio::join!(channel.confirm_select(), async {
        assert!(matches!(broker.recv_method().await, (1, frame::CONFIRM_SELECT, _)));

        broker
            .send(AMQPFrame::Method(1, frame::CONFIRM_SELECT_OK, MethodFrameArgs::ConfirmSelectOk))
            .await;
    });

    selected.unwrap();

    broker
        .send(
            frame::BasicReturnArgs {
                reply_code: 312,
                reply_text: "NO_ROUTE".to_string(),
                exchange_name: "orders".to_string(),
                routing_key: "nowhere".to_string(),
            }
            .frame(1),
        )
        .await;
    broker.send_content(1, b"undeliverable", 1024).await;
    broker
        .send(frame::BasicAckArgs::default().delivery_tag(1).frame(1))
        .await;
    broker
        .send(frame::BasicNackArgs::default().delivery_tag(2).requeue(true).frame(1))
        .await;

    match helper::next_event(&mut events).await {
        EventSignal::BasicReturn(returned) => {
            assert_eq!(returned.reply_code, 312);
            assert_eq!(returned.reply_text, "NO_ROUTE");
            assert_eq!(returned.exchange, "orders");
            assert_eq!(returned.routing_key, "nowhere");
            assert_eq!(returned.message.body, b"undeliverable");
        }
        other => panic!("{other:?}"),
    }

    assert!(matches!(
        helper::next_event(&mut events).await,
        EventSignal::BasicAck {
            channel: 1,
            delivery_tag: 1,
            multiple: false
        }
    ));
    assert!(matches!(
        helper::next_event(&mut events).await,
        EventSignal::BasicNack {
            channel: 1,
            delivery_tag: 2,
            multiple: false,
            requeue: true
        }
    ));
}

#[tokio::test]
async fn qos_recover_and_reject() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let (qos, args) = tokio::join!(
        channel.basic_qos(10, 0, false),
        broker.reply(
            frame::BASIC_QOS,
            AMQPFrame::Method(1, frame::BASIC_QOS_OK, MethodFrameArgs::BasicQosOk)
        )
    );

    qos.unwrap();

    match args {
        MethodFrameArgs::BasicQos(args) => {
            assert_eq!(args.prefetch_count, 10);
            assert_eq!(args.prefetch_size, 0);
            assert!(!args.global);
        }
        other => panic!("Expected Basic.Qos {other:?}"),
    }

    let (recovered, args) = tokio::join!(
        channel.basic_recover(true),
        broker.reply(
            frame::BASIC_RECOVER,
            AMQPFrame::Method(1, frame::BASIC_RECOVER_OK, MethodFrameArgs::BasicRecoverOk)
        )
    );

    recovered.unwrap();

    assert!(matches!(args, MethodFrameArgs::BasicRecover(args) if args.requeue));

    channel.basic_reject(12, false).await.unwrap();

    match broker.recv_method().await {
        (1, frame::BASIC_REJECT, MethodFrameArgs::BasicReject(args)) => {
            assert_eq!(args.delivery_tag, 12);
            assert!(!args.requeue);
        }
        other => panic!("Expected Basic.Reject {other:?}"),
    }
}

#[tokio::test]
async fn unencodable_publish_leaves_nothing_on_the_wire() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let message = PublishedMessage::from("body").content_type(&"x".repeat(300));

    let err = helper::to_client_error(channel.basic_publish("", "jobs", message).await);

    assert_eq!(err.kind, ErrorKind::Framing);
    assert!(conn.is_open());

    let (declared, args) = tokio::join!(
        channel.queue_declare("after", None),
        broker.reply(
            frame::QUEUE_DECLARE,
            frame::QueueDeclareOkArgs::default().name("after").frame(1)
        )
    );

    assert_eq!(declared.unwrap().name, "after");
    assert!(matches!(args, MethodFrameArgs::QueueDeclare(args) if args.name == "after"));
}

#[tokio::test(start_paused = true)]
async fn get_content_arriving_after_timeout_is_dropped() {
    let config = helper::default_config().timeout(1);
    let (conn, mut broker) = helper::connect(config, helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let ch = channel.clone();
    let get = tokio::spawn(async move { ch.basic_get("jobs", NoAck(true)).await });

    assert!(matches!(broker.recv_method().await, (1, frame::BASIC_GET, _)));

    // the method arrives in time, its content doesn't
    broker.send(frame::BasicGetOkArgs::new(1, "orders").frame(1)).await;

    let err = helper::to_client_error(get.await.unwrap());

    assert_eq!(err.kind, ErrorKind::Timeout);

    let ch = channel.clone();
    let declare = tokio::spawn(async move { ch.queue_declare("other", None).await });

    assert!(matches!(broker.recv_method().await, (1, frame::QUEUE_DECLARE, _)));

    broker.send_content(1, b"late", 1024).await;
    broker
        .send(frame::QueueDeclareOkArgs::default().name("other").frame(1))
        .await;

    assert_eq!(declare.await.unwrap().unwrap().name, "other");

    let (empty, _) = tokio::join!(
        channel.basic_get("jobs", NoAck(true)),
        broker.reply(
            frame::BASIC_GET,
            AMQPFrame::Method(1, frame::BASIC_GET_EMPTY, MethodFrameArgs::BasicGetEmpty)
        )
    );

    assert!(empty.unwrap().is_none());
    assert!(channel.is_open());
}
