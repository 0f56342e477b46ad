use amqpstorm_client::*;
use amqpstorm_codec::frame::{self, AMQPFrame, MethodFrameArgs, QueueDeclareOkArgs};

use crate::helper;

#[tokio::test]
async fn queue_declare_returns_server_values() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    assert_eq!(channel.channel, 1);
    assert!(channel.is_open());

    let (declared, _) = tokio::join!(channel.queue_declare("", Some(QueueDeclareFlags::EXCLUSIVE)), async {
        match broker.recv_method().await {
            (1, frame::QUEUE_DECLARE, MethodFrameArgs::QueueDeclare(args)) => {
                assert!(args.flags.contains(QueueDeclareFlags::EXCLUSIVE));
                assert!(!args.flags.contains(QueueDeclareFlags::NO_WAIT));
            }
            other => panic!("Expected Queue.Declare {other:?}"),
        }

        broker
            .send(
                QueueDeclareOkArgs::default()
                    .name("amq.gen-1")
                    .message_count(3)
                    .consumer_count(1)
                    .frame(1),
            )
            .await;
    });

    assert_eq!(
        declared.unwrap(),
        DeclaredQueue {
            name: "amq.gen-1".to_string(),
            message_count: 3,
            consumer_count: 1
        }
    );
}

#[tokio::test]
async fn channel_numbers_are_the_lowest_free() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;

    let first = helper::open_channel(&conn, &mut broker).await;
    let second = helper::open_channel(&conn, &mut broker).await;

    assert_eq!((first.channel, second.channel), (1, 2));

    let (closed, _) = tokio::join!(first.close(), async {
        assert!(matches!(broker.recv_method().await, (1, frame::CHANNEL_CLOSE, _)));

        broker.send(frame::channel_close_ok(1)).await;
    });

    closed.unwrap();

    assert_eq!(first.state(), ChannelState::Closed);

    let third = helper::open_channel(&conn, &mut broker).await;

    assert_eq!(third.channel, 1);
}

#[tokio::test]
async fn channel_max_limits_channel_numbers() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(1, 131_072, 0)).await;

    helper::open_channel(&conn, &mut broker).await;

    let err = helper::to_client_error(conn.channel().await);

    assert_eq!(err.kind, ErrorKind::ProtocolViolation);
    assert_eq!(err.code, 506);
}

#[tokio::test]
async fn peer_close_fails_only_its_pending_request() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let ch1 = helper::open_channel(&conn, &mut broker).await;
    let ch2 = helper::open_channel(&conn, &mut broker).await;

    let c1 = ch1.clone();
    let missing = tokio::spawn(async move { c1.queue_declare("missing", Some(QueueDeclareFlags::PASSIVE)).await });
    let c2 = ch2.clone();
    let existing = tokio::spawn(async move { c2.queue_declare("existing", None).await });

    let mut requests = vec![broker.recv_method().await.0, broker.recv_method().await.0];
    requests.sort();

    assert_eq!(requests, vec![1, 2]);

    broker
        .send(frame::ChannelCloseArgs::new(404, "NOT_FOUND - no queue 'missing'", frame::QUEUE_DECLARE).frame(1))
        .await;

    assert!(matches!(broker.recv_method().await, (1, frame::CHANNEL_CLOSE_OK, _)));

    broker
        .send(QueueDeclareOkArgs::default().name("existing").frame(2))
        .await;

    let err = helper::to_client_error(missing.await.unwrap());

    assert_eq!(err.kind, ErrorKind::ChannelClosed);
    assert_eq!(err.channel, Some(1));
    assert_eq!(err.code, 404);
    assert_eq!(err.message, "NOT_FOUND - no queue 'missing'");
    assert_eq!(err.class_method, frame::QUEUE_DECLARE);

    assert_eq!(existing.await.unwrap().unwrap().name, "existing");

    assert_eq!(ch1.state(), ChannelState::Closed);
    assert!(ch2.is_open());
    assert!(conn.is_open());

    let err = helper::to_client_error(ch1.queue_declare("missing", None).await);

    assert_eq!(err.kind, ErrorKind::ChannelClosed);
}

#[tokio::test]
async fn second_request_is_refused_while_one_is_pending() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let ch = channel.clone();
    let pending = tokio::spawn(async move { ch.queue_declare("jobs", None).await });

    assert!(matches!(broker.recv_method().await, (1, frame::QUEUE_DECLARE, _)));

    let err = helper::to_client_error(channel.queue_bind("jobs", "amq.direct", "jobs").await);

    assert_eq!(err.kind, ErrorKind::ProtocolViolation);

    broker.send(QueueDeclareOkArgs::default().name("jobs").frame(1)).await;

    assert_eq!(pending.await.unwrap().unwrap().name, "jobs");
}

#[tokio::test(start_paused = true)]
async fn late_response_after_timeout_is_discarded() {
    let config = helper::default_config().timeout(1);
    let (conn, mut broker) = helper::connect(config, helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let err = helper::to_client_error(channel.queue_declare("first", None).await);

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(err.channel, Some(1));

    match broker.recv_method().await {
        (1, _, MethodFrameArgs::QueueDeclare(args)) => assert_eq!(args.name, "first"),
        other => panic!("Expected Queue.Declare {other:?}"),
    }

    let ch = channel.clone();
    let second = tokio::spawn(async move { ch.queue_declare("second", None).await });

    match broker.recv_method().await {
        (1, _, MethodFrameArgs::QueueDeclare(args)) => assert_eq!(args.name, "second"),
        other => panic!("Expected Queue.Declare {other:?}"),
    }

    broker.send(QueueDeclareOkArgs::default().name("first").frame(1)).await;
    broker.send(QueueDeclareOkArgs::default().name("second").frame(1)).await;

    assert_eq!(second.await.unwrap().unwrap().name, "second");
    assert!(channel.is_open());
}

#[tokio::test]
async fn unexpected_response_fails_the_request() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let (declared, _) = tokio::join!(channel.queue_declare("jobs", None), async {
        broker.recv_method().await;
        broker
            .send(AMQPFrame::Method(1, frame::EXCHANGE_DECLARE_OK, MethodFrameArgs::ExchangeDeclareOk))
            .await;
    });

    let err = helper::to_client_error(declared);

    assert_eq!(err.kind, ErrorKind::ProtocolViolation);
    assert_eq!(err.code, 503);

    // the channel stays usable
    let (purged, _) = tokio::join!(channel.queue_purge("jobs"), async {
        assert!(matches!(broker.recv_method().await, (1, frame::QUEUE_PURGE, _)));

        broker
            .send(frame::QueueMessageCountArgs::default().message_count(7).purge_ok_frame(1))
            .await;
    });

    assert_eq!(purged.unwrap(), 7);
}

#[tokio::test]
async fn crossing_close_keeps_the_number_until_close_ok() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let ch1 = helper::open_channel(&conn, &mut broker).await;
    let ch2 = helper::open_channel(&conn, &mut broker).await;

    let ch = ch1.clone();
    let closing = tokio::spawn(async move { ch.close().await });

    assert!(matches!(broker.recv_method().await, (1, frame::CHANNEL_CLOSE, _)));

    broker
        .send(frame::ChannelCloseArgs::new(406, "PRECONDITION_FAILED", 0).frame(1))
        .await;

    closing.await.unwrap().unwrap();

    assert_eq!(ch1.state(), ChannelState::Closed);
    assert!(matches!(broker.recv_method().await, (1, frame::CHANNEL_CLOSE_OK, _)));

    let ch3 = helper::open_channel(&conn, &mut broker).await;

    assert_eq!(ch3.channel, 3);

    broker.send(frame::channel_close_ok(1)).await;

    // frames are processed in order, after this round trip the CloseOk is handled
    let (declared, _) = tokio::join!(ch2.queue_declare("jobs", None), async {
        broker.recv_method().await;
        broker.send(QueueDeclareOkArgs::default().name("jobs").frame(2)).await;
    });

    declared.unwrap();

    let reused = helper::open_channel(&conn, &mut broker).await;

    assert_eq!(reused.channel, 1);
}

#[tokio::test]
async fn flow_requests_in_both_directions() {
    let (mut conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let mut events = conn.take_events().unwrap();
    let channel = helper::open_channel(&conn, &mut broker).await;

    broker.send(frame::ChannelFlowArgs::new(false).frame(1)).await;

    match broker.recv_method().await {
        (1, frame::CHANNEL_FLOW_OK, MethodFrameArgs::ChannelFlowOk(args)) => assert!(!args.active),
        other => panic!("Expected Channel.FlowOk {other:?}"),
    }

    assert!(matches!(
        helper::next_event(&mut events).await,
        EventSignal::ChannelFlow {
            channel: 1,
            active: false
        }
    ));

    let (active, _) = tokio::join!(channel.flow(true), async {
        match broker.recv_method().await {
            (1, frame::CHANNEL_FLOW, MethodFrameArgs::ChannelFlow(args)) => {
                broker.send(frame::ChannelFlowArgs::new(args.active).ok_frame(1)).await
            }
            other => panic!("Expected Channel.Flow {other:?}"),
        }
    });

    assert!(active.unwrap());
}

#[tokio::test]
async fn closed_channel_refuses_operations() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let (closed, _) = tokio::join!(channel.close(), async {
        match broker.recv_method().await {
            (1, frame::CHANNEL_CLOSE, MethodFrameArgs::ChannelClose(args)) => assert_eq!(args.code, 200),
            other => panic!("Expected Channel.Close {other:?}"),
        }

        broker.send(frame::channel_close_ok(1)).await;
    });

    closed.unwrap();

    let err = helper::to_client_error(channel.queue_declare("jobs", None).await);

    assert_eq!(err.kind, ErrorKind::ChannelClosed);

    let err = helper::to_client_error(channel.basic_publish("", "jobs", PublishedMessage::from("lost")).await);

    assert_eq!(err.kind, ErrorKind::ChannelClosed);

    // closing again is not an error
    channel.close().await.unwrap();
}

#[tokio::test]
async fn exchange_operations_wait_for_their_responses() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let flags = ExchangeDeclareFlags::DURABLE | ExchangeDeclareFlags::NO_WAIT;

    let (declared, args) = tokio::join!(
        channel.exchange_declare("orders", "topic", Some(flags)),
        broker.reply(
            frame::EXCHANGE_DECLARE,
            AMQPFrame::Method(1, frame::EXCHANGE_DECLARE_OK, MethodFrameArgs::ExchangeDeclareOk)
        )
    );

    declared.unwrap();

    match args {
        MethodFrameArgs::ExchangeDeclare(args) => {
            assert_eq!(args.exchange_name, "orders");
            assert_eq!(args.exchange_type, "topic");
            assert!(args.flags.contains(ExchangeDeclareFlags::DURABLE));
            assert!(!args.flags.contains(ExchangeDeclareFlags::NO_WAIT));
        }
        other => panic!("Expected Exchange.Declare {other:?}"),
    }

    let (bound, args) = tokio::join!(
        channel.exchange_bind("audit", "orders", "order.*"),
        broker.reply(
            frame::EXCHANGE_BIND,
            AMQPFrame::Method(1, frame::EXCHANGE_BIND_OK, MethodFrameArgs::ExchangeBindOk)
        )
    );

    bound.unwrap();

    match args {
        MethodFrameArgs::ExchangeBind(args) => {
            assert_eq!(args.destination, "audit");
            assert_eq!(args.source, "orders");
            assert_eq!(args.routing_key, "order.*");
        }
        other => panic!("Expected Exchange.Bind {other:?}"),
    }

    let (unbound, args) = tokio::join!(
        channel.exchange_unbind("audit", "orders", "order.*"),
        broker.reply(
            frame::EXCHANGE_UNBIND,
            AMQPFrame::Method(1, frame::EXCHANGE_UNBIND_OK, MethodFrameArgs::ExchangeUnbindOk)
        )
    );

    unbound.unwrap();

    match args {
        MethodFrameArgs::ExchangeUnbind(args) => {
            assert_eq!(args.destination, "audit");
            assert_eq!(args.source, "orders");
            assert_eq!(args.routing_key, "order.*");
        }
        other => panic!("Expected Exchange.Unbind {other:?}"),
    }

    let (deleted, args) = tokio::join!(
        channel.exchange_delete("orders", IfUnused(true)),
        broker.reply(
            frame::EXCHANGE_DELETE,
            AMQPFrame::Method(1, frame::EXCHANGE_DELETE_OK, MethodFrameArgs::ExchangeDeleteOk)
        )
    );

    deleted.unwrap();

    match args {
        MethodFrameArgs::ExchangeDelete(args) => {
            assert_eq!(args.exchange_name, "orders");
            assert!(args.flags.contains(frame::ExchangeDeleteFlags::IF_UNUSED));
        }
        other => panic!("Expected Exchange.Delete {other:?}"),
    }
}

#[tokio::test]
async fn queue_unbind_and_delete() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    let (unbound, args) = tokio::join!(
        channel.queue_unbind("jobs", "orders", "new"),
        broker.reply(
            frame::QUEUE_UNBIND,
            AMQPFrame::Method(1, frame::QUEUE_UNBIND_OK, MethodFrameArgs::QueueUnbindOk)
        )
    );

    unbound.unwrap();

    match args {
        MethodFrameArgs::QueueUnbind(args) => {
            assert_eq!(args.queue_name, "jobs");
            assert_eq!(args.exchange_name, "orders");
            assert_eq!(args.routing_key, "new");
        }
        other => panic!("Expected Queue.Unbind {other:?}"),
    }

    let (deleted, args) = tokio::join!(
        channel.queue_delete("jobs", IfUnused(false), IfEmpty(true)),
        broker.reply(
            frame::QUEUE_DELETE,
            frame::QueueMessageCountArgs::default().message_count(0).delete_ok_frame(1)
        )
    );

    assert_eq!(deleted.unwrap(), 0);

    match args {
        MethodFrameArgs::QueueDelete(args) => {
            assert_eq!(args.queue_name, "jobs");
            assert!(args.flags.contains(frame::QueueDeleteFlags::IF_EMPTY));
            assert!(!args.flags.contains(frame::QueueDeleteFlags::IF_UNUSED));
        }
        other => panic!("Expected Queue.Delete {other:?}"),
    }
}

#[tokio::test]
async fn number_is_reused_only_after_close_ok_is_sent() {
    let (conn, mut broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;
    let channel = helper::open_channel(&conn, &mut broker).await;

    broker
        .send(frame::ChannelCloseArgs::new(406, "PRECONDITION_FAILED", frame::QUEUE_DECLARE).frame(1))
        .await;

    let (reopened, _) = tokio::join!(conn.channel(), async {
        assert!(matches!(broker.recv_method().await, (1, frame::CHANNEL_CLOSE_OK, _)));

        broker.accept_channel().await
    });

    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(reopened.unwrap().is_open());
}

#[tokio::test(start_paused = true)]
async fn unanswered_close_keeps_the_number_until_late_close_ok() {
    let config = helper::default_config().timeout(1);
    let (conn, mut broker) = helper::connect(config, helper::tune(0, 131_072, 0)).await;
    let ch1 = helper::open_channel(&conn, &mut broker).await;

    ch1.close().await.unwrap();

    assert_eq!(ch1.state(), ChannelState::Closed);
    assert!(matches!(broker.recv_method().await, (1, frame::CHANNEL_CLOSE, _)));

    let ch2 = helper::open_channel(&conn, &mut broker).await;

    assert_eq!(ch2.channel, 2);

    broker.send(frame::channel_close_ok(1)).await;

    // after this round trip the late CloseOk is handled
    let (declared, _) = tokio::join!(
        ch2.queue_declare("jobs", None),
        broker.reply(frame::QUEUE_DECLARE, QueueDeclareOkArgs::default().name("jobs").frame(2))
    );

    declared.unwrap();

    let reused = helper::open_channel(&conn, &mut broker).await;

    assert_eq!(reused.channel, 1);
}
