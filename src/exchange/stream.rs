//! Streaming market data over the gateway WebSocket
//!
//! One background task owns the socket. It reconnects with bounded
//! exponential backoff plus jitter and replays every active subscription
//! after each reconnect. Subscribers see connect/disconnect/error events
//! through the same callback that delivers data.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::traits::{StreamCallback, StreamChannel, StreamEvent};
use crate::domain::{Orderbook, PublicTrade, Ticker};
use crate::error::{PerpError, Result};

const PING_INTERVAL_SECS: u64 = 20;

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    op: &'static str,
    channel: StreamChannel,
    symbols: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(tag = "channel", content = "data", rename_all = "snake_case")]
enum DataFrame {
    Ticker(Ticker),
    Orderbook(Orderbook),
    Trades(PublicTrade),
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    event: String,
    #[serde(default)]
    message: Option<String>,
}

struct Listener {
    channel: StreamChannel,
    symbols: HashSet<String>,
    callback: StreamCallback,
}

/// Reconnecting WebSocket market-data stream
pub struct MarketStream {
    url: String,
    connect_timeout: Duration,
    reconnect_base: Duration,
    reconnect_max: Duration,
    subscriptions: RwLock<BTreeMap<StreamChannel, BTreeSet<String>>>,
    listeners: RwLock<Vec<Listener>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    started: AtomicBool,
    connected: AtomicBool,
    reconnects: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl MarketStream {
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Duration,
        reconnect_base: Duration,
        reconnect_max: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            url: url.into(),
            connect_timeout,
            reconnect_base,
            reconnect_max,
            subscriptions: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            outbound: Mutex::new(None),
            started: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Register a listener and make sure the socket task is running.
    pub async fn subscribe(
        self: &Arc<Self>,
        channel: StreamChannel,
        symbols: &[String],
        callback: StreamCallback,
    ) -> Result<()> {
        Url::parse(&self.url)
            .map_err(|e| PerpError::Validation(format!("invalid stream URL: {}", e)))?;

        {
            let mut subs = self.subscriptions.write().await;
            subs.entry(channel).or_default().extend(symbols.iter().cloned());
        }
        self.listeners.write().await.push(Listener {
            channel,
            symbols: symbols.iter().cloned().collect(),
            callback: callback.clone(),
        });

        if self.is_connected() {
            callback(StreamEvent::Connected);
            if let Some(tx) = self.outbound.lock().await.as_ref() {
                let frame = subscribe_message(channel, symbols)?;
                let _ = tx.send(frame);
            }
        }

        if !self.started.swap(true, Ordering::SeqCst) {
            let stream = Arc::clone(self);
            tokio::spawn(async move { stream.run().await });
        }
        Ok(())
    }

    /// Stop the socket task; listeners receive a final Disconnected.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut shutdown = self.shutdown_tx.subscribe();

        info!(url = %self.url, "Starting market stream");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.connect_and_stream(&mut shutdown).await {
                Ok(()) => {
                    info!("Market stream closed normally");
                    attempt = 0;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    error!("Market stream error (attempt {}): {}", attempt, e);
                    self.broadcast(StreamEvent::Error(e.to_string())).await;
                }
            }

            if self.connected.swap(false, Ordering::SeqCst) {
                self.broadcast(StreamEvent::Disconnected {
                    reason: "connection lost".to_string(),
                })
                .await;
            }
            *self.outbound.lock().await = None;

            if *shutdown.borrow() {
                break;
            }

            let delay = self.backoff(attempt);
            info!("Reconnecting market stream in {:?} (attempt {})", delay, attempt + 1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }

        self.broadcast(StreamEvent::Disconnected {
            reason: "stream closed".to_string(),
        })
        .await;
        info!("Market stream stopped");
    }

    /// base * 2^attempt, capped, plus up to 25% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let delay = self.reconnect_base.saturating_mul(factor).min(self.reconnect_max);
        let jitter_range = (delay.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_range);
        delay + Duration::from_millis(jitter)
    }

    async fn connect_and_stream(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| PerpError::Validation(format!("invalid stream URL: {}", e)))?;

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| PerpError::Timeout("market stream connect".to_string()))??;

        info!("Connected to market stream");
        let (mut write, mut read) = ws_stream.split();

        // Replay the active channel set before anything else goes out.
        let subscriptions = self.subscriptions.read().await.clone();
        for (channel, symbols) in &subscriptions {
            if symbols.is_empty() {
                continue;
            }
            let symbols: Vec<String> = symbols.iter().cloned().collect();
            write.send(subscribe_message(*channel, &symbols)?).await?;
            debug!(%channel, count = symbols.len(), "resubscribed");
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.outbound.lock().await = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        self.broadcast(StreamEvent::Connected).await;

        let mut ping = interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text).await,
                        Some(Ok(Message::Ping(payload))) => write.send(Message::Pong(payload)).await?,
                        Some(Ok(Message::Close(frame))) => {
                            info!("Market stream closed by server: {:?}", frame);
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
                Some(frame) = rx.recv() => {
                    write.send(frame).await?;
                }
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_message(&self, text: &str) {
        if let Ok(control) = serde_json::from_str::<ControlFrame>(text) {
            if control.event == "error" {
                let message = control.message.unwrap_or_else(|| "unknown".to_string());
                warn!(%message, "market stream error frame");
                self.broadcast(StreamEvent::Error(message)).await;
            }
            return;
        }

        let (channel, symbol, event) = match serde_json::from_str::<DataFrame>(text) {
            Ok(DataFrame::Ticker(t)) => (StreamChannel::Ticker, t.symbol.clone(), StreamEvent::Ticker(t)),
            Ok(DataFrame::Orderbook(b)) => {
                (StreamChannel::Orderbook, b.symbol.clone(), StreamEvent::Orderbook(b))
            }
            Ok(DataFrame::Trades(t)) => (StreamChannel::Trades, t.symbol.clone(), StreamEvent::Trade(t)),
            Err(e) => {
                debug!(error = %e, "ignoring unparseable stream frame");
                return;
            }
        };

        let listeners = self.listeners.read().await;
        for l in listeners
            .iter()
            .filter(|l| l.channel == channel && l.symbols.contains(&symbol))
        {
            (l.callback)(event.clone());
        }
    }

    async fn broadcast(&self, event: StreamEvent) {
        let listeners = self.listeners.read().await;
        for l in listeners.iter() {
            (l.callback)(event.clone());
        }
    }
}

fn subscribe_message(channel: StreamChannel, symbols: &[String]) -> Result<Message> {
    let frame = SubscribeFrame {
        op: "subscribe",
        channel,
        symbols,
    };
    Ok(Message::Text(serde_json::to_string(&frame)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> MarketStream {
        MarketStream::new(
            "ws://127.0.0.1:1/ws",
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_backoff_is_bounded() {
        let s = stream();
        let first = s.backoff(0);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(126));
        let late = s.backoff(30);
        assert!(late >= Duration::from_secs(2) && late <= Duration::from_millis(2500));
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let msg = subscribe_message(StreamChannel::Ticker, &["BTC-PERP".to_string()]).unwrap();
        match msg {
            Message::Text(text) => {
                assert_eq!(
                    text,
                    r#"{"op":"subscribe","channel":"ticker","symbols":["BTC-PERP"]}"#
                );
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_data_frames_route_by_channel_and_symbol() {
        let s = stream();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        s.listeners.write().await.push(Listener {
            channel: StreamChannel::Ticker,
            symbols: ["BTC-PERP".to_string()].into_iter().collect(),
            callback: Arc::new(move |e: StreamEvent| {
                if let Ok(mut v) = sink.lock() {
                    v.push(e);
                }
            }),
        });

        let frame = r#"{"channel":"ticker","data":{"symbol":"BTC-PERP","bid":"1","ask":"2","last":"1.5","volume_24h":"0","timestamp":"2026-01-01T00:00:00Z"}}"#;
        s.handle_message(frame).await;
        let other = frame.replace("BTC-PERP", "ETH-PERP");
        s.handle_message(&other).await;
        s.handle_message(r#"{"event":"error","message":"bad symbol"}"#).await;

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Ticker(t) if t.symbol == "BTC-PERP"));
    }
}
