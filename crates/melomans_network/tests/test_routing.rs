use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use melomans_network::wire::{self, HandshakeStatus};
use melomans_network::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const VOLUME_ID: MessageTypeId = MessageTypeId(42);
const SEEK_ID: MessageTypeId = MessageTypeId(7);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Volume {
    level: u8,
}

impl Message for Volume {
    fn definition() -> MessageDefinition {
        MessageDefinition::new("volume", 1, AccessGroup::ManipulatePlayer).with_fields(["level"])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Seek {
    position_ms: u64,
}

impl Message for Seek {
    fn definition() -> MessageDefinition {
        MessageDefinition::new("seek", 1, AccessGroup::Player).with_fields(["position_ms"])
    }
}

/// Pins the ids so raw clients can speak the protocol by hand.
struct FixedIds;

impl MessageService for FixedIds {
    fn type_id(&self, definition: &MessageDefinition) -> MessageTypeId {
        match definition.name.as_str() {
            "volume" => VOLUME_ID,
            "seek" => SEEK_ID,
            _ => MessageTypeId(0),
        }
    }
}

fn loopback_settings() -> NetworkSettings {
    NetworkSettings {
        multicast_address: Ipv4Addr::LOCALHOST,
        multicast_port: 0,
        listen_port: 0,
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..NetworkSettings::default()
    }
}

async fn started_router() -> (NetworkRouter, Meloman) {
    let mut router = NetworkRouter::new(loopback_settings(), Arc::new(FixedIds));
    let listen = router.initialize().await.unwrap();
    let peer = Meloman::new("local", SocketAddr::from((Ipv4Addr::LOCALHOST, listen.port())));
    (router, peer)
}

async fn handshake(peer: &Meloman, id: MessageTypeId) -> (TcpStream, HandshakeStatus) {
    let mut stream = TcpStream::connect(peer.address).await.unwrap();
    wire::write_type_id(&mut stream, id).await.unwrap();
    let status = wire::read_status(&mut stream).await.unwrap();
    (stream, status)
}

async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("nothing received in time")
        .expect("channel closed")
}

#[tokio::test]
async fn multicast_publish_reaches_subscriber_only() {
    let (router, _peer) = started_router().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _sub = router
        .on_message::<Volume, _, _>(move |volume, client| {
            let tx = tx.clone();
            async move {
                assert_eq!(client.origin(), Origin::Multicast);
                let _ = tx.send(volume);
                Ok(())
            }
        })
        .unwrap();

    let outcome = router.publish(Volume { level: 5 }).unwrap().run().await;
    assert_eq!(outcome, TaskOutcome::Succeeded);
    assert_eq!(recv_within(&mut rx).await, Volume { level: 5 });

    // No subscription for seek: the datagram is dropped.
    let outcome = router.publish(Seek { position_ms: 1 }).unwrap().run().await;
    assert_eq!(outcome, TaskOutcome::Succeeded);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn addressed_task_delivers_frame_and_body_with_progress() {
    let (receiver, peer) = started_router().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _sub = receiver
        .on_message::<Volume, _, _>(move |volume, mut client| {
            let tx = tx.clone();
            async move {
                assert_eq!(client.origin(), Origin::Connection);
                let body = client.read_to_end().await?;
                let _ = tx.send((volume, body));
                Ok::<_, NetworkError>(())
            }
        })
        .unwrap();

    let sender = NetworkRouter::new(loopback_settings(), Arc::new(FixedIds));
    let body = vec![0xA5u8; 20_000];
    let reports: Arc<Mutex<Vec<(u64, Option<u64>)>>> = Arc::default();

    let mut tasks = sender.publish_for(vec![peer], Volume { level: 9 });
    let task = tasks.next().unwrap();
    assert!(tasks.next().is_none());

    let outcome = task
        .with_stream({
            let body = body.clone();
            move |_| Some(BodyStream::new(Cursor::new(body)).with_len(20_000))
        })
        .on_report({
            let reports = reports.clone();
            move |progress| {
                assert_eq!(progress.message.level, 9);
                reports.lock().push((progress.bytes_sent, progress.total_bytes));
            }
        })
        .run()
        .await;
    assert_eq!(outcome, TaskOutcome::Succeeded);

    let (volume, received) = recv_within(&mut rx).await;
    assert_eq!(volume, Volume { level: 9 });
    assert_eq!(received, body);

    let reports = reports.lock();
    assert!(!reports.is_empty());
    assert!(reports.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(reports.last(), Some(&(20_000, Some(20_000))));
}

#[tokio::test]
async fn addressed_task_to_unsubscribed_peer_is_rejected() {
    let (_receiver, peer) = started_router().await;
    let sender = NetworkRouter::new(loopback_settings(), Arc::new(FixedIds));
    let errors: Arc<Mutex<Vec<NetworkError>>> = Arc::default();
    let succeeded = Arc::new(Mutex::new(false));

    let task = sender
        .publish_for(vec![peer.clone()], Seek { position_ms: 10 })
        .next()
        .unwrap();
    let outcome = task
        .on_exception({
            let errors = errors.clone();
            move |e| errors.lock().push(e)
        })
        .on_success({
            let succeeded = succeeded.clone();
            move |_| *succeeded.lock() = true
        })
        .run()
        .await;

    assert_eq!(outcome, TaskOutcome::Faulted);
    assert!(!*succeeded.lock());
    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        NetworkError::HandshakeRejected { peer: rejected } => {
            assert_eq!(rejected, &peer.address)
        }
        other => panic!("expected HandshakeRejected, got {other}"),
    }
}

#[tokio::test]
async fn raw_client_with_subscribed_id_gets_ok() {
    let (router, peer) = started_router().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _sub = router
        .subscribe::<Volume, _, _>(move |mut client| {
            let tx = tx.clone();
            async move {
                assert_eq!(client.type_id(), VOLUME_ID);
                let volume: Volume = client.read_message().await?;
                if let Some(writer) = client.writer() {
                    writer.write_all(b"ack").await?;
                    writer.shutdown().await?;
                }
                let _ = tx.send(volume);
                Ok::<_, NetworkError>(())
            }
        })
        .unwrap();

    let (mut stream, status) = handshake(&peer, VOLUME_ID).await;
    assert_eq!(status, HandshakeStatus::Ok);

    let frame = wire::encode_frame(&Volume { level: 3 }).unwrap();
    stream.write_all(&frame).await.unwrap();
    stream.flush().await.unwrap();

    assert_eq!(recv_within(&mut rx).await, Volume { level: 3 });
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"ack");
}

#[tokio::test]
async fn raw_client_with_unknown_id_is_denied_and_closed() {
    let (_router, peer) = started_router().await;

    let (mut stream, status) = handshake(&peer, SEEK_ID).await;
    assert_eq!(status, HandshakeStatus::AccessDenied);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn dropping_subscription_makes_id_unroutable() {
    let (router, peer) = started_router().await;
    let sub = router
        .subscribe::<Volume, _, _>(|_client| async { Ok(()) })
        .unwrap();

    let (_stream, status) = handshake(&peer, VOLUME_ID).await;
    assert_eq!(status, HandshakeStatus::Ok);

    drop(sub);
    assert!(!router.is_subscribed(VOLUME_ID));

    let (_stream, status) = handshake(&peer, VOLUME_ID).await;
    assert_eq!(status, HandshakeStatus::AccessDenied);
}

#[tokio::test]
async fn cancel_while_body_is_streaming() {
    let (receiver, peer) = started_router().await;
    let _sub = receiver
        .subscribe::<Volume, _, _>(|mut client| async move {
            client.read_to_end().await?;
            Ok::<_, NetworkError>(())
        })
        .unwrap();

    let sender = NetworkRouter::new(loopback_settings(), Arc::new(FixedIds));
    // The write end stays open, so the body never reaches EOF.
    let (_body_writer, body_reader) = tokio::io::duplex(64);
    let log: Arc<Mutex<Vec<String>>> = Arc::default();

    let task = sender
        .publish_for(vec![peer], Volume { level: 1 })
        .next()
        .unwrap();
    let canceller = task.canceller();
    let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
    let task = task
        .with_stream(move |_| Some(BodyStream::new(body_reader)))
        .on_start(move |_| a.lock().push("start".into()))
        .on_success(move |_| b.lock().push("success".into()))
        .on_cancelled(move |volume| c.lock().push(format!("cancelled:{}", volume.level)))
        .on_finally(move |_| d.lock().push("finally".into()));

    let running = tokio::spawn(task.run());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(canceller.state(), TaskState::Running);

    canceller.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("run did not observe cancellation")
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Cancelled);
    assert_eq!(*log.lock(), vec!["start", "cancelled:1", "finally"]);
    assert_eq!(canceller.state(), TaskState::Finalized);
}

#[tokio::test]
async fn initialize_twice_and_shutdown_twice() {
    let (mut router, peer) = started_router().await;
    assert!(router.is_running());
    assert!(matches!(
        router.initialize().await,
        Err(NetworkError::InvalidState(_))
    ));

    router.shutdown();
    router.shutdown();
    assert!(!router.is_running());
    assert!(matches!(
        router.publish(Volume { level: 0 }),
        Err(NetworkError::NotRunning)
    ));
    assert!(matches!(
        router.initialize().await,
        Err(NetworkError::InvalidState(_))
    ));

    // The accept loop released the listener.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(peer.address).await.is_err());
}

#[tokio::test]
async fn each_id_reaches_only_its_own_handler() {
    let (receiver, peer) = started_router().await;
    let (volume_tx, mut volume_rx) = mpsc::unbounded_channel();
    let (seek_tx, mut seek_rx) = mpsc::unbounded_channel();

    let _volume_sub = receiver
        .on_message::<Volume, _, _>(move |volume, client| {
            let tx = volume_tx.clone();
            async move {
                let _ = tx.send((volume, client.origin()));
                Ok(())
            }
        })
        .unwrap();
    let _seek_sub = receiver
        .on_message::<Seek, _, _>(move |seek, client| {
            let tx = seek_tx.clone();
            async move {
                let _ = tx.send((seek, client.origin()));
                Ok(())
            }
        })
        .unwrap();
    assert_eq!(receiver.subscription_count(), 2);

    let outcome = receiver.publish(Volume { level: 4 }).unwrap().run().await;
    assert_eq!(outcome, TaskOutcome::Succeeded);
    assert_eq!(
        recv_within(&mut volume_rx).await,
        (Volume { level: 4 }, Origin::Multicast)
    );

    let outcome = receiver.publish(Seek { position_ms: 900 }).unwrap().run().await;
    assert_eq!(outcome, TaskOutcome::Succeeded);
    assert_eq!(
        recv_within(&mut seek_rx).await,
        (Seek { position_ms: 900 }, Origin::Multicast)
    );

    let sender = NetworkRouter::new(loopback_settings(), Arc::new(FixedIds));
    for task in sender.publish_for(vec![peer.clone()], Seek { position_ms: 1200 }) {
        assert_eq!(task.run().await, TaskOutcome::Succeeded);
    }
    assert_eq!(
        recv_within(&mut seek_rx).await,
        (Seek { position_ms: 1200 }, Origin::Connection)
    );

    for task in sender.publish_for(vec![peer], Volume { level: 8 }) {
        assert_eq!(task.run().await, TaskOutcome::Succeeded);
    }
    assert_eq!(
        recv_within(&mut volume_rx).await,
        (Volume { level: 8 }, Origin::Connection)
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(volume_rx.try_recv().is_err());
    assert!(seek_rx.try_recv().is_err());
}

#[tokio::test]
async fn cancel_while_socket_write_is_blocked() {
    let (receiver, peer) = started_router().await;
    // Accepts the connection but never reads, so the sender's socket fills up.
    let _sub = receiver
        .subscribe::<Volume, _, _>(|client| async move {
            let _held = client;
            std::future::pending::<()>().await;
            Ok::<_, NetworkError>(())
        })
        .unwrap();

    const BODY_LEN: usize = 64 * 1024 * 1024;
    let sender = NetworkRouter::new(loopback_settings(), Arc::new(FixedIds));
    let sent = Arc::new(Mutex::new(0u64));
    let log: Arc<Mutex<Vec<String>>> = Arc::default();

    let task = sender
        .publish_for(vec![peer], Volume { level: 2 })
        .next()
        .unwrap();
    let canceller = task.canceller();
    let (a, b, c) = (log.clone(), log.clone(), log.clone());
    let progress = sent.clone();
    let task = task
        .with_stream(|_| {
            let body = BodyStream::new(Cursor::new(vec![0u8; BODY_LEN]));
            Some(body.with_len(BODY_LEN as u64))
        })
        .on_report(move |p| *progress.lock() = p.bytes_sent)
        .on_success(move |_| a.lock().push("success".into()))
        .on_cancelled(move |_| b.lock().push("cancelled".into()))
        .on_finally(move |_| c.lock().push("finally".into()));

    let running = tokio::spawn(task.run());

    // Wait until the body stops advancing: the write is stuck on a full socket.
    let mut last = 0;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let now = *sent.lock();
        if now > 0 && now == last {
            break;
        }
        last = now;
    }
    assert!(last > 0, "body never started streaming");
    assert_eq!(canceller.state(), TaskState::Running);
    assert!(last < BODY_LEN as u64);

    canceller.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("blocked write did not observe cancellation")
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Cancelled);
    assert_eq!(*log.lock(), vec!["cancelled", "finally"]);
}
