//! Periodic keep-alive for an acknowledged match request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use matchlink_net::messages::HeartbeatReq;
use matchlink_net::{Message, MessageManager, RoutingConfig, Transport};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A running heartbeat task. Dropping the handle stops it.
pub struct Heartbeat {
    stop: CancellationToken,
    lost: CancellationToken,
    sent: Arc<AtomicU32>,
}

impl Heartbeat {
    /// Send a heartbeat to `routing` every `interval`, starting one interval
    /// from now.
    ///
    /// A send the transport refuses counts as a miss. After `max_missed`
    /// consecutive misses the heartbeat stops and [`lost`](Self::lost)
    /// resolves. `max_missed == 0` never gives up.
    pub fn start<T: Transport>(
        messages: Arc<MessageManager<T>>,
        routing: RoutingConfig,
        interval: Duration,
        max_missed: u32,
    ) -> Self {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let sent = Arc::new(AtomicU32::new(0));

        tokio::spawn(run(
            messages,
            routing,
            interval,
            max_missed,
            stop.clone(),
            lost.clone(),
            Arc::clone(&sent),
        ));
        tracing::debug!("Heartbeat started every {interval:?}");

        Self { stop, lost, sent }
    }

    /// Resolves once heartbeats have stopped reaching the transport.
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    /// Heartbeats handed to the transport so far.
    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Stop sending. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<T: Transport>(
    messages: Arc<MessageManager<T>>,
    routing: RoutingConfig,
    period: Duration,
    max_missed: u32,
    stop: CancellationToken,
    lost: CancellationToken,
    sent: Arc<AtomicU32>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let id = messages.send(&Message::HeartbeatReq(HeartbeatReq {}), Some(routing));
        if id.is_sent() {
            missed = 0;
            sent.fetch_add(1, Ordering::SeqCst);
            continue;
        }

        missed += 1;
        tracing::warn!("Heartbeat not sent ({missed} in a row)");
        if max_missed > 0 && missed >= max_missed {
            tracing::error!("Giving up on heartbeats after {missed} misses");
            lost.cancel();
            break;
        }
    }
    tracing::debug!("Heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchlink_net::{ConnectOptions, MemoryTransport};

    async fn running() -> (Arc<MemoryTransport>, Arc<MessageManager<MemoryTransport>>) {
        let transport = Arc::new(MemoryTransport::new());
        transport.connect(&ConnectOptions::default()).await.unwrap();
        let messages = Arc::new(MessageManager::new(Arc::clone(&transport)));
        (transport, messages)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_beat_after_one_interval() {
        let (transport, messages) = running().await;
        let mut frames = transport.take_sent().unwrap();
        let routing = RoutingConfig {
            module_type: 1,
            instance_id: 2,
        };
        let heartbeat = Heartbeat::start(messages, routing, Duration::from_secs(5), 3);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(heartbeat.sent(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(heartbeat.sent(), 1);
        assert_eq!(frames.recv().await.unwrap().routing, Some(routing));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(heartbeat.sent(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_beats_after_drop() {
        let (transport, messages) = running().await;
        let mut frames = transport.take_sent().unwrap();
        let heartbeat = Heartbeat::start(
            messages,
            RoutingConfig::default(),
            Duration::from_secs(1),
            3,
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        drop(heartbeat);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let mut count = 0;
        while frames.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_misses_signal_loss() {
        let (transport, messages) = running().await;
        let heartbeat = Heartbeat::start(
            messages,
            RoutingConfig::default(),
            Duration::from_secs(2),
            3,
        );

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(heartbeat.sent(), 1);
        transport.drop_connection();

        let start = Instant::now();
        heartbeat.lost().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(heartbeat.sent(), 1);
    }
}
