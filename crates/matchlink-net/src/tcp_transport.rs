//! TCP transport to the matchmaking gateway.
//!
//! [`TcpTransport`] implements [`Transport`] over a single TCP stream. Each
//! successful connect spawns a reader task that turns inbound frames into
//! [`TransportEvent::Payload`]s and a writer task that drains an unbounded
//! queue, so [`Transport::send`] never blocks and keeps call order. State
//! changes are published through a [`ConnectionStateWatch`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, watch};

use crate::framing::{FrameConfig, FrameError, RoutedFrame, read_frame, write_frame};
use crate::messages::RoutingConfig;
use crate::platform::{SocketConfig, configure_stream};
use crate::transport::{
    ConnectOptions, ConnectionState, ConnectionStateWatch, EVENT_CHANNEL_CAPACITY, Transport,
    TransportError, TransportEvent,
};

/// Writer queue and shutdown switch of one live connection.
struct Link {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
}

/// State shared between the transport handle and its I/O tasks.
struct Shared {
    state: ConnectionStateWatch,
    events: broadcast::Sender<TransportEvent>,
    /// Bumped on every connect and close; I/O tasks of an older link must not
    /// touch the state of a newer one.
    generation: AtomicU64,
}

impl Shared {
    /// Mark the link of `generation` as lost, unless it was already replaced
    /// or closed on purpose.
    fn link_lost(&self, generation: u64, reason: &FrameError) {
        if self
            .generation
            .compare_exchange(
                generation,
                generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            tracing::warn!("Gateway connection lost: {reason}");
            self.state.set(ConnectionState::Stopped);
            let _ = self.events.send(TransportEvent::Closed { intentional: false });
        }
    }
}

/// [`Transport`] over TCP with length-prefixed [`RoutedFrame`]s.
pub struct TcpTransport {
    shared: Arc<Shared>,
    socket: SocketConfig,
    frames: FrameConfig,
    link: Mutex<Option<Link>>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(SocketConfig::default(), FrameConfig::default())
    }
}

impl TcpTransport {
    /// Create a stopped transport.
    pub fn new(socket: SocketConfig, frames: FrameConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: ConnectionStateWatch::new(),
                events,
                generation: AtomicU64::new(0),
            }),
            socket,
            frames,
            link: Mutex::new(None),
        }
    }

    /// Return the connection state watch.
    pub fn state_watch(&self) -> &ConnectionStateWatch {
        &self.shared.state
    }

    async fn open(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        let stream = tokio::time::timeout(
            options.connect_timeout,
            TcpStream::connect(options.address.as_str()),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout(options.connect_timeout))??;
        configure_stream(&stream, &self.socket)?;

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(read_loop(
            reader,
            Arc::clone(&self.shared),
            generation,
            self.frames.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            Arc::clone(&self.shared),
            generation,
            self.frames.clone(),
            shutdown_rx,
        ));

        let previous = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Link {
                outbound,
                shutdown_tx,
            });
        if let Some(previous) = previous {
            let _ = previous.shutdown_tx.send(true);
        }

        self.shared.state.set(ConnectionState::Running);
        tracing::info!("Connected to gateway at {}", options.address);
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    fn connect(
        &self,
        options: &ConnectOptions,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            self.shared.state.set(ConnectionState::Connecting);
            let result = self.open(options).await;
            if let Err(e) = &result {
                tracing::debug!("Connect to {} failed: {e}", options.address);
                self.shared.state.set(ConnectionState::Stopped);
            }
            result
        }
    }

    fn send(&self, body: Vec<u8>, routing: Option<RoutingConfig>) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Running {
            return Err(TransportError::NotRunning);
        }
        let frame = RoutedFrame { routing, body }.encode()?;
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        match link.as_ref() {
            Some(link) => link
                .outbound
                .send(frame)
                .map_err(|_| TransportError::NotRunning),
            None => Err(TransportError::NotRunning),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn close(&self) {
        let link = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(link) = link {
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            let _ = link.shutdown_tx.send(true);
            self.shared.state.set(ConnectionState::Stopped);
            let _ = self
                .shared
                .events
                .send(TransportEvent::Closed { intentional: true });
            tracing::info!("Gateway connection closed");
        }
    }
}

/// Read frames until the connection closes or shutdown is signalled.
async fn read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    generation: u64,
    config: FrameConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = read_frame(&mut reader, &config) => {
                match result.and_then(|raw| RoutedFrame::decode(&raw)) {
                    Ok(frame) => {
                        let _ = shared.events.send(TransportEvent::Payload(frame.body));
                    }
                    Err(e) => {
                        shared.link_lost(generation, &e);
                        break;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped sender means the transport itself is gone.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Drain the outbound queue into the socket in order.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
    generation: u64,
    config: FrameConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(frame) = next else { break };
                if let Err(e) = write_frame(&mut writer, &frame, &config).await {
                    shared.link_lost(generation, &e);
                    break;
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Helper: a gateway that accepts one connection and echoes every frame
    /// back with its routing stripped.
    async fn echo_gateway() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let config = FrameConfig::default();
            while let Ok(raw) = read_frame(&mut stream, &config).await {
                let frame = RoutedFrame::decode(&raw).unwrap();
                let reply = RoutedFrame {
                    routing: None,
                    body: frame.body,
                };
                if write_frame(&mut stream, &reply.encode().unwrap(), &config)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        addr.to_string()
    }

    fn options(address: String) -> ConnectOptions {
        ConnectOptions {
            address,
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event should arrive")
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_reaches_running() {
        let transport = TcpTransport::default();
        assert_eq!(transport.state(), ConnectionState::Stopped);

        transport.connect(&options(echo_gateway().await)).await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Running);
    }

    #[tokio::test]
    async fn test_payloads_round_trip_in_order() {
        let transport = TcpTransport::default();
        let mut events = transport.subscribe();
        transport.connect(&options(echo_gateway().await)).await.unwrap();

        let routing = Some(RoutingConfig {
            module_type: 1,
            instance_id: 2,
        });
        transport.send(b"one".to_vec(), routing).unwrap();
        transport.send(b"two".to_vec(), None).unwrap();

        assert_eq!(next_event(&mut events).await, TransportEvent::Payload(b"one".to_vec()));
        assert_eq!(next_event(&mut events).await, TransportEvent::Payload(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = TcpTransport::default();
        assert!(matches!(
            transport.send(b"x".to_vec(), None),
            Err(TransportError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_refused_connect_leaves_stopped_without_close_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::default();
        let mut events = transport.subscribe();
        assert!(transport.connect(&options(addr)).await.is_err());
        assert_eq!(transport.state(), ConnectionState::Stopped);
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_close_is_intentional() {
        let transport = TcpTransport::default();
        let mut events = transport.subscribe();
        transport.connect(&options(echo_gateway().await)).await.unwrap();

        transport.close();
        assert_eq!(transport.state(), ConnectionState::Stopped);
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Closed { intentional: true }
        );

        // Closing twice is a no-op.
        transport.close();
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_peer_drop_is_unintentional() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(stream);
        });

        let transport = TcpTransport::default();
        let mut events = transport.subscribe();
        transport.connect(&options(addr)).await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Closed { intentional: false }
        );
        assert_eq!(transport.state(), ConnectionState::Stopped);
    }
}
