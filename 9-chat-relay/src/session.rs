//! One connected participant: bootstrap plus the inbound and outbound pumps.
//!
//! The transport is any `Stream` of WebSocket messages paired with a `Sink`
//! for them. In production that is a split `axum` WebSocket; tests drive the
//! pumps with in-memory channels.
//!
//! The two pumps run as independent tasks and never call into each other.
//! The inbound pump unregisters on exit, the hub closes the outbound queue in
//! response, and the outbound pump winds down when it sees the queue close.
//! When the outbound pump stops first (eviction, a failed or stalled write)
//! it unregisters too and drops a oneshot sender, which ends the inbound
//! stream so the read half of the transport is released as well.

use std::{error::Error as StdError, sync::Arc, time::Duration};

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior, interval_at, timeout, timeout_at},
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    error::SessionError,
    hub::{HubHandle, Registration, SessionId},
    protocol::{
        ClientCommand, LINE_SEPARATOR, Payload, chat_line, join_notice, parse_client_message,
    },
};

/// Tasks backing a started session.
pub struct SessionTasks {
    pub id: SessionId,
    pub inbound: JoinHandle<()>,
    pub outbound: JoinHandle<()>,
}

/// Registers a freshly upgraded connection, announces it and starts both
/// pumps.
pub async fn start<S, K, E>(
    hub: HubHandle,
    stream: S,
    sink: K,
    config: Arc<RelayConfig>,
) -> Result<SessionTasks, SessionError>
where
    S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: StdError + Send + Sync + 'static,
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: StdError + Send + Sync + 'static,
{
    let (outbound, queue) = mpsc::channel(config.queue_capacity);
    let Registration { id, default_name } = hub.register(outbound).await?;

    info!(session = id, nickname = %default_name, "client joined");
    hub.broadcast(Some(id), join_notice(&default_name))?;

    let (writer_done, writer_stopped) = oneshot::channel::<()>();

    let outbound = tokio::spawn({
        let hub = hub.clone();
        let config = Arc::clone(&config);
        async move {
            let result = outbound_pump(queue, sink, &config).await;
            log_exit(id, "outbound", result);
            hub.unregister(id);
            drop(writer_done);
        }
    });
    let inbound = tokio::spawn(async move {
        let stream = stream.take_until(writer_stopped);
        let result = inbound_pump(hub, id, default_name, stream, &config).await;
        log_exit(id, "inbound", result);
    });

    Ok(SessionTasks {
        id,
        inbound,
        outbound,
    })
}

fn log_exit(id: SessionId, pump: &'static str, result: Result<(), SessionError>) {
    match result {
        Ok(()) => debug!(session = id, pump, "pump finished"),
        Err(err) => warn!(session = id, pump, error = %err, "pump stopped"),
    }
}

/// Reads client frames and turns them into broadcasts until the transport
/// fails, closes or goes quiet past the pong deadline. Always unregisters
/// before the read half is dropped.
pub async fn inbound_pump<S, E>(
    hub: HubHandle,
    id: SessionId,
    nickname: String,
    mut stream: S,
    config: &RelayConfig,
) -> Result<(), SessionError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: StdError + Send + Sync + 'static,
{
    let result = read_loop(&hub, id, nickname, &mut stream, config).await;
    hub.unregister(id);
    drop(stream);
    result
}

async fn read_loop<S, E>(
    hub: &HubHandle,
    id: SessionId,
    mut nickname: String,
    stream: &mut S,
    config: &RelayConfig,
) -> Result<(), SessionError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: StdError + Send + Sync + 'static,
{
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let message = match timeout_at(deadline, stream.next()).await {
            Err(_) => return Err(SessionError::ReadDeadline),
            Ok(None) => return Ok(()),
            Ok(Some(Err(err))) => return Err(SessionError::transport(err)),
            Ok(Some(Ok(message))) => message,
        };

        let raw = match message {
            Message::Text(text) => {
                check_size(text.len(), config.max_message_size)?;
                text
            }
            Message::Binary(bytes) => {
                // Measured before decoding; lossy replacement can grow the text.
                check_size(bytes.len(), config.max_message_size)?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Message::Pong(_) => {
                deadline = Instant::now() + config.pong_wait;
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(frame) => {
                debug!(session = id, ?frame, "client sent close");
                return Ok(());
            }
        };

        match parse_client_message(&raw) {
            ClientCommand::Rename { nickname: renamed } => {
                info!(session = id, from = %nickname, to = %renamed, "nickname changed");
                nickname = renamed;
            }
            ClientCommand::Chat { text } => {
                hub.broadcast(Some(id), chat_line(&nickname, &text))?;
            }
        }
    }
}

fn check_size(len: usize, limit: usize) -> Result<(), SessionError> {
    if len > limit {
        return Err(SessionError::MessageTooLarge { len, limit });
    }
    Ok(())
}

/// Writes queued lines and keepalive pings until the hub closes the queue or
/// a write fails. The sink is closed on every exit path.
pub async fn outbound_pump<K>(
    mut queue: mpsc::Receiver<Payload>,
    mut sink: K,
    config: &RelayConfig,
) -> Result<(), SessionError>
where
    K: Sink<Message> + Unpin,
    K::Error: StdError + Send + Sync + 'static,
{
    let period = config.ping_period();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = write_loop(&mut queue, &mut sink, &mut ticker, config.write_wait).await;

    drop(ticker);
    if let Ok(Err(err)) = timeout(config.write_wait, sink.close()).await {
        debug!(error = %err, "closing transport failed");
    }
    result
}

async fn write_loop<K>(
    queue: &mut mpsc::Receiver<Payload>,
    sink: &mut K,
    ticker: &mut Interval,
    write_wait: Duration,
) -> Result<(), SessionError>
where
    K: Sink<Message> + Unpin,
    K::Error: StdError + Send + Sync + 'static,
{
    loop {
        select! {
            next = queue.recv() => {
                let Some(first) = next else {
                    // Unregistered or evicted by the hub.
                    let _ = send_before(sink, Message::Close(None), write_wait).await;
                    return Ok(());
                };
                let batch = drain_batch(queue, &first);
                send_before(sink, Message::Text(batch), write_wait).await?;
            }
            _ = ticker.tick() => {
                send_before(sink, Message::Ping(Vec::new()), write_wait).await?;
            }
        }
    }
}

/// Joins `first` with whatever was already queued behind it. Lines arriving
/// while the batch is built wait for the next write.
fn drain_batch(queue: &mut mpsc::Receiver<Payload>, first: &str) -> String {
    let pending = queue.len();
    let mut batch = String::from(first);
    for _ in 0..pending {
        match queue.try_recv() {
            Ok(line) => {
                batch.push(LINE_SEPARATOR);
                batch.push_str(&line);
            }
            Err(_) => break,
        }
    }
    batch
}

async fn send_before<K>(sink: &mut K, message: Message, wait: Duration) -> Result<(), SessionError>
where
    K: Sink<Message> + Unpin,
    K::Error: StdError + Send + Sync + 'static,
{
    match timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(SessionError::transport(err)),
        Err(_) => Err(SessionError::WriteDeadline),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use futures::{
        channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
        future, sink,
    };

    use super::*;
    use crate::hub::Hub;

    type Frames = UnboundedSender<Result<Message, io::Error>>;

    fn transport() -> (Frames, UnboundedReceiver<Result<Message, io::Error>>) {
        unbounded()
    }

    fn text(line: &str) -> Result<Message, io::Error> {
        Ok(Message::Text(line.to_string()))
    }

    async fn register(hub: &HubHandle) -> (SessionId, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(16);
        let registration = hub.register(tx).await.expect("register");
        (registration.id, rx)
    }

    #[tokio::test]
    async fn chat_is_prefixed_and_nick_is_not_broadcast() {
        let (hub, _task) = Hub::spawn();
        let (speaker, mut speaker_queue) = register(&hub).await;
        let (_listener, mut listener_queue) = register(&hub).await;

        let (frames, stream) = transport();
        frames.unbounded_send(text("hello")).unwrap();
        frames.unbounded_send(text("/nick Bob")).unwrap();
        frames.unbounded_send(text("  hi\nthere ")).unwrap();
        drop(frames);

        let config = RelayConfig::default();
        inbound_pump(hub.clone(), speaker, "A".into(), stream, &config)
            .await
            .expect("clean end of stream");

        assert_eq!(&*listener_queue.recv().await.unwrap(), "[A] hello");
        assert_eq!(&*listener_queue.recv().await.unwrap(), "[Bob] hi there");

        // The pump unregistered itself, which closes its own queue; nothing was echoed.
        assert!(speaker_queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn binary_frames_are_treated_as_text() {
        let (hub, _task) = Hub::spawn();
        let (speaker, _speaker_queue) = register(&hub).await;
        let (_listener, mut listener_queue) = register(&hub).await;

        let (frames, stream) = transport();
        frames
            .unbounded_send(Ok(Message::Binary(b"raw bytes".to_vec())))
            .unwrap();
        frames.unbounded_send(Ok(Message::Close(None))).unwrap();

        let config = RelayConfig::default();
        inbound_pump(hub.clone(), speaker, "A".into(), stream, &config)
            .await
            .expect("close frame ends the pump cleanly");
        assert_eq!(&*listener_queue.recv().await.unwrap(), "[A] raw bytes");
    }

    #[tokio::test]
    async fn oversized_message_is_fatal_and_unregisters() {
        let (hub, _task) = Hub::spawn();
        let (speaker, mut speaker_queue) = register(&hub).await;
        let (_listener, mut listener_queue) = register(&hub).await;
        let config = RelayConfig::default();

        let (frames, stream) = transport();
        frames
            .unbounded_send(text(&"x".repeat(config.max_message_size + 1)))
            .unwrap();

        let result = inbound_pump(hub.clone(), speaker, "A".into(), stream, &config).await;
        assert!(matches!(
            result,
            Err(SessionError::MessageTooLarge { len: 513, limit: 512 })
        ));
        assert!(speaker_queue.recv().await.is_none());

        hub.broadcast(None, "after".into()).unwrap();
        assert_eq!(&*listener_queue.recv().await.unwrap(), "after");
        drop(frames);
    }

    #[tokio::test]
    async fn binary_limit_applies_to_raw_bytes() {
        let (hub, _task) = Hub::spawn();
        let (speaker, _speaker_queue) = register(&hub).await;
        let (_listener, mut listener_queue) = register(&hub).await;
        let config = RelayConfig::default();

        // Every invalid byte decodes to a three-byte replacement character.
        let (frames, stream) = transport();
        frames
            .unbounded_send(Ok(Message::Binary(vec![0xff; 200])))
            .unwrap();
        drop(frames);

        inbound_pump(hub.clone(), speaker, "A".into(), stream, &config)
            .await
            .expect("frame within the byte limit is accepted");
        let expected = format!("[A] {}", "\u{fffd}".repeat(200));
        assert_eq!(&*listener_queue.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn transport_error_ends_the_pump() {
        let (hub, _task) = Hub::spawn();
        let (speaker, mut speaker_queue) = register(&hub).await;

        let (frames, stream) = transport();
        frames
            .unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();

        let config = RelayConfig::default();
        let result = inbound_pump(hub.clone(), speaker, "A".into(), stream, &config).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert!(speaker_queue.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_hits_the_read_deadline() {
        let (hub, _task) = Hub::spawn();
        let (speaker, _speaker_queue) = register(&hub).await;

        let (frames, stream) = transport();
        let started = Instant::now();
        let config = RelayConfig::default();
        let result = inbound_pump(hub.clone(), speaker, "A".into(), stream, &config).await;

        assert!(matches!(result, Err(SessionError::ReadDeadline)));
        assert!(started.elapsed() >= config.pong_wait);
        drop(frames);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_extends_the_read_deadline() {
        let (hub, _task) = Hub::spawn();
        let (speaker, _speaker_queue) = register(&hub).await;
        let config = RelayConfig::default();

        let (frames, stream) = transport();
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(50)).await;
            frames.unbounded_send(Ok(Message::Pong(Vec::new()))).unwrap();
            // Keep the stream open so only the deadline can end it.
            future::pending::<()>().await;
        });

        let started = Instant::now();
        let result = inbound_pump(hub.clone(), speaker, "A".into(), stream, &config).await;

        assert!(matches!(result, Err(SessionError::ReadDeadline)));
        assert!(started.elapsed() >= Duration::from_secs(50) + config.pong_wait);
        feeder.abort();
    }

    #[tokio::test]
    async fn queued_messages_are_batched_into_one_write() {
        let (tx, queue) = mpsc::channel::<Payload>(8);
        for line in ["[A] one", "[A] two", "[B] three"] {
            tx.try_send(line.into()).unwrap();
        }
        drop(tx);

        let (sink, written) = unbounded::<Message>();
        outbound_pump(queue, sink, &RelayConfig::default())
            .await
            .expect("closed queue ends the pump cleanly");

        let frames: Vec<Message> = written.collect().await;
        assert_eq!(
            frames,
            vec![
                Message::Text("[A] one\n[A] two\n[B] three".into()),
                Message::Close(None),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_sends_keepalive_pings() {
        let config = RelayConfig::default();
        let (tx, queue) = mpsc::channel::<Payload>(8);
        let (sink, mut written) = unbounded::<Message>();

        let started = Instant::now();
        let pump = tokio::spawn(async move { outbound_pump(queue, sink, &config).await });

        assert_eq!(written.next().await, Some(Message::Ping(Vec::new())));
        assert!(started.elapsed() >= RelayConfig::default().ping_period());

        drop(tx);
        assert_eq!(written.next().await, Some(Message::Close(None)));
        assert_eq!(written.next().await, None);
        pump.await.unwrap().expect("clean shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transport_hits_the_write_deadline() {
        let (tx, queue) = mpsc::channel::<Payload>(8);
        tx.try_send("[A] stuck".into()).unwrap();

        let stalled = sink::unfold((), |(), _message: Message| {
            future::pending::<Result<(), io::Error>>()
        });
        let result = outbound_pump(queue, Box::pin(stalled), &RelayConfig::default()).await;

        assert!(matches!(result, Err(SessionError::WriteDeadline)));
        drop(tx);
    }

    #[tokio::test]
    async fn started_session_announces_itself_to_others_only() {
        let (hub, _task) = Hub::spawn();
        let (_peer, mut peer_queue) = register(&hub).await;

        let (frames, stream) = transport();
        let (sink, mut written) = unbounded::<Message>();
        let tasks = start(hub.clone(), stream, sink, Arc::new(RelayConfig::default()))
            .await
            .expect("session starts");

        assert_eq!(&*peer_queue.recv().await.unwrap(), "_NOTIFICATION_[user2] joined");

        frames.unbounded_send(text("hey")).unwrap();
        assert_eq!(&*peer_queue.recv().await.unwrap(), "[user2] hey");

        hub.broadcast(None, "welcome".into()).unwrap();
        assert_eq!(written.next().await, Some(Message::Text("welcome".into())));

        // Closing the client side tears down both pumps.
        drop(frames);
        tasks.inbound.await.unwrap();
        tasks.outbound.await.unwrap();
        assert_eq!(written.next().await, Some(Message::Close(None)));
        assert_eq!(written.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_session_is_torn_down_and_silenced() {
        let (hub, _task) = Hub::spawn();
        let (_peer, mut peer_queue) = register(&hub).await;

        let (frames, stream) = transport();
        let stalled = sink::unfold((), |(), _message: Message| {
            future::pending::<Result<(), io::Error>>()
        });
        let config = RelayConfig {
            queue_capacity: 1,
            ..RelayConfig::default()
        };
        let tasks = start(hub.clone(), stream, Box::pin(stalled), Arc::new(config))
            .await
            .expect("session starts");

        let flood: Vec<String> = (1..=5).map(|n| format!("line {n}")).collect();
        for line in &flood {
            hub.broadcast(None, line.as_str().into()).unwrap();
        }
        // Queued behind the flood, so the hub sees it after the eviction.
        frames.unbounded_send(text("ghost")).unwrap();

        tasks.outbound.await.unwrap();
        tasks.inbound.await.unwrap();
        assert!(
            frames.unbounded_send(text("late")).is_err(),
            "read half must be released"
        );

        hub.broadcast(None, "marker".into()).unwrap();
        assert_eq!(&*peer_queue.recv().await.unwrap(), "_NOTIFICATION_[user2] joined");
        for line in &flood {
            assert_eq!(&*peer_queue.recv().await.unwrap(), line.as_str());
        }
        assert_eq!(&*peer_queue.recv().await.unwrap(), "marker");
    }

    #[tokio::test]
    async fn failed_write_unregisters_and_stops_reading() {
        let (hub, _task) = Hub::spawn();
        let (_peer, mut peer_queue) = register(&hub).await;

        let (frames, stream) = transport();
        let broken = sink::unfold((), |(), _message: Message| {
            future::ready(Err::<(), _>(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "gone",
            )))
        });
        let tasks = start(
            hub.clone(),
            stream,
            Box::pin(broken),
            Arc::new(RelayConfig::default()),
        )
        .await
        .expect("session starts");
        assert_eq!(&*peer_queue.recv().await.unwrap(), "_NOTIFICATION_[user2] joined");

        hub.broadcast(None, "doomed".into()).unwrap();
        tasks.outbound.await.unwrap();
        tasks.inbound.await.unwrap();
        assert!(frames.unbounded_send(text("still talking")).is_err());

        hub.broadcast(None, "marker".into()).unwrap();
        assert_eq!(&*peer_queue.recv().await.unwrap(), "doomed");
        assert_eq!(&*peer_queue.recv().await.unwrap(), "marker");
    }
}
