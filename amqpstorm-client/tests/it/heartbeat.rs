use std::time::Duration;

use amqpstorm_client::*;
use amqpstorm_codec::frame::{self, AMQPFrame};

use crate::helper;

#[tokio::test(start_paused = true)]
async fn silent_server_is_torn_down_once() {
    let config = helper::default_config().heartbeat(2).timeout(60);
    let (mut conn, mut broker) = helper::connect(config, helper::tune(0, 131_072, 2)).await;
    let mut events = conn.take_events().unwrap();
    let channel = helper::open_channel(&conn, &mut broker).await;

    let ch = channel.clone();
    let pending = tokio::spawn(async move { ch.queue_declare("jobs", None).await });

    match tokio::time::timeout(Duration::from_secs(30), events.recv()).await {
        Ok(Some(EventSignal::ConnectionClosed(reason))) => assert_eq!(reason.kind, ErrorKind::HeartbeatTimeout),
        other => panic!("{other:?}"),
    }

    let err = helper::to_client_error(pending.await.unwrap());

    assert_eq!(err.kind, ErrorKind::HeartbeatTimeout);
    assert_eq!(err.channel, Some(1));

    assert!(!conn.is_open());
    assert!(events.try_recv().is_err());

    // the client kept sending heartbeats while it was waiting
    let mut heartbeats = 0;

    while let Some(frame) = broker.recv_raw().await {
        if let AMQPFrame::Heartbeat(channel) = frame {
            assert_eq!(channel, 0);
            heartbeats += 1;
        }
    }

    assert!(heartbeats > 0);
}

#[tokio::test(start_paused = true)]
async fn server_heartbeats_keep_the_connection_alive() {
    let config = helper::default_config().heartbeat(2);
    let (conn, mut broker) = helper::connect(config, helper::tune(0, 131_072, 2)).await;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(1)).await;

        broker.send(frame::heartbeat()).await;
    }

    assert!(conn.is_open());
    assert!(matches!(broker.recv_raw().await, Some(AMQPFrame::Heartbeat(0))));
}

#[tokio::test(start_paused = true)]
async fn no_heartbeat_when_switched_off() {
    let (conn, _broker) = helper::connect(helper::default_config(), helper::tune(0, 131_072, 0)).await;

    assert_eq!(conn.tuning().unwrap().heartbeat, 0);

    tokio::time::sleep(Duration::from_secs(600)).await;

    assert!(conn.is_open());
}

#[tokio::test(start_paused = true)]
async fn blocked_writer_does_not_delay_the_teardown() {
    let config = helper::default_config().heartbeat(2).timeout(60);
    let (mut conn, mut broker) = helper::connect(config, helper::tune(0, 131_072, 2)).await;
    let mut events = conn.take_events().unwrap();
    let channel = helper::open_channel(&conn, &mut broker).await;

    // the broker stops reading, the message doesn't fit into the pipe
    let ch = channel.clone();
    let publish = tokio::spawn(async move {
        ch.basic_publish("", "jobs", PublishedMessage::from(vec![0u8; 4 << 20]))
            .await
    });

    match tokio::time::timeout(Duration::from_secs(30), events.recv()).await {
        Ok(Some(EventSignal::ConnectionClosed(reason))) => assert_eq!(reason.kind, ErrorKind::HeartbeatTimeout),
        other => panic!("{other:?}"),
    }

    let err = helper::to_client_error(publish.await.unwrap());

    assert_eq!(err.kind, ErrorKind::HeartbeatTimeout);
    assert!(!conn.is_open());

    drop(broker);
}
