use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::types::{ClosedCandle, FeedState};

/// Kline interval every symbol is subscribed at.
const KLINE_INTERVAL: &str = "1s";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("upstream feed failed after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("candle consumer dropped")]
    EventSinkClosed,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Stream of inbound text frames from one upstream session. The stream ends
/// when the session closes.
pub type TextStream = BoxStream<'static, Result<String>>;

/// Opens upstream sessions. Production uses [`TungsteniteTransport`].
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TextStream>;
}

pub struct TungsteniteTransport;

#[async_trait]
impl StreamTransport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<TextStream> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .context("failed to connect to kline WebSocket")?;

        // Ping / Pong / Binary frames are dropped here; tungstenite answers
        // pings on the next read by itself.
        let texts = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(anyhow::Error::new(e).context("kline WebSocket read error"))),
            }
        });
        Ok(texts.boxed())
    }
}

// ---------------------------------------------------------------------------
// FeedConnector
// ---------------------------------------------------------------------------

/// Owns the single multiplexed kline subscription and its reconnect state
/// machine. Closed candles are sent on the channel handed to [`run`].
///
/// [`run`]: FeedConnector::run
pub struct FeedConnector {
    url: String,
    quote_asset: String,
    reconnect_delay: Duration,
    max_attempts: u32,
    state: Arc<RwLock<FeedState>>,
}

impl FeedConnector {
    pub fn new(
        stream_base_url: &str,
        symbols: &[String],
        quote_asset: &str,
        reconnect_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            url: build_kline_url(stream_base_url, symbols, quote_asset),
            quote_asset: quote_asset.to_uppercase(),
            reconnect_delay,
            max_attempts,
            state: Arc::new(RwLock::new(FeedState::Disconnected)),
        }
    }

    /// Shared handle to the live connection state.
    pub fn state_handle(&self) -> Arc<RwLock<FeedState>> {
        self.state.clone()
    }

    #[cfg(test)]
    fn state(&self) -> FeedState {
        *self.state.read()
    }

    fn set_state(&self, next: FeedState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            debug!(from = %prev, to = %next, "feed state transition");
        }
    }

    /// Drive the connection until retries are exhausted or the consumer goes
    /// away. The retry counter resets on every successful open.
    pub async fn run<T>(&self, transport: &T, events: mpsc::Sender<ClosedCandle>) -> Result<(), FeedError>
    where
        T: StreamTransport + ?Sized,
    {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(FeedState::Connecting);
            info!(url = %self.url, attempt, "connecting to kline WebSocket");

            match transport.connect(&self.url).await {
                Ok(mut stream) => {
                    self.set_state(FeedState::Connected);
                    attempt = 0;
                    info!("kline WebSocket connected");

                    loop {
                        match stream.next().await {
                            Some(Ok(text)) => self.handle_message(&text, &events).await?,
                            Some(Err(e)) => {
                                error!(error = %e, "kline WebSocket error");
                                self.set_state(FeedState::Errored);
                                break;
                            }
                            None => {
                                warn!("kline WebSocket connection closed");
                                self.set_state(FeedState::Closed);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "kline WebSocket connect failed");
                    self.set_state(FeedState::Errored);
                }
            }

            attempt += 1;
            if attempt > self.max_attempts {
                self.set_state(FeedState::Failed);
                error!(
                    max_attempts = self.max_attempts,
                    "max reconnection attempts reached, feed is now stale"
                );
                return Err(FeedError::RetriesExhausted {
                    attempts: self.max_attempts,
                });
            }

            self.set_state(FeedState::Backoff(attempt));
            info!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "attempting to reconnect"
            );
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn handle_message(&self, text: &str, events: &mpsc::Sender<ClosedCandle>) -> Result<(), FeedError> {
        match parse_kline_envelope(text, &self.quote_asset) {
            Ok(Some(candle)) => {
                debug!(symbol = %candle.symbol, close = candle.close, "closed candle");
                events
                    .send(candle)
                    .await
                    .map_err(|_| FeedError::EventSinkClosed)
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(error = %e, "failed to parse kline message");
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Build the Binance combined-stream URL covering every symbol.
pub fn build_kline_url(base: &str, symbols: &[String], quote_asset: &str) -> String {
    let quote = quote_asset.to_lowercase();
    let streams: Vec<String> = symbols
        .iter()
        .map(|sym| format!("{}{quote}@kline_{KLINE_INTERVAL}", sym.to_lowercase()))
        .collect();
    format!(
        "{}/stream?streams={}",
        base.trim_end_matches('/'),
        streams.join("/")
    )
}

/// Parse a combined-stream envelope.
///
/// Returns `Ok(None)` for envelopes without a `data` payload and for candles
/// that are still open.
///
/// Expected shape:
/// ```json
/// { "stream": "btcusdt@kline_1s",
///   "data": { "E": 1700000000000, "s": "BTCUSDT", "k": { "o": "..", "x": true, .. } } }
/// ```
pub fn parse_kline_envelope(text: &str, quote_asset: &str) -> Result<Option<ClosedCandle>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = match root.get("data") {
        Some(d) if !d.is_null() => d,
        _ => return Ok(None),
    };

    let k = data.get("k").context("missing field data.k")?;
    let is_closed = k["x"].as_bool().context("missing field k.x")?;
    if !is_closed {
        return Ok(None);
    }

    let pair = data["s"].as_str().context("missing field data.s")?;
    let symbol = base_symbol(pair, quote_asset);

    let candle = ClosedCandle {
        symbol,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        event_time: data["E"].as_i64().context("missing field data.E")?,
    };

    Ok(Some(candle))
}

/// `"BTCUSDT"` -> `"BTC"` for quote asset `"USDT"`.
fn base_symbol(pair: &str, quote_asset: &str) -> String {
    let upper = pair.to_uppercase();
    if let Some(base) = upper.strip_suffix(quote_asset) {
        if !base.is_empty() {
            return base.to_string();
        }
    }
    upper
}

/// Helper: Binance sends numeric values as JSON strings inside kline objects.
/// Non-finite values (`NaN`, `inf`) are rejected.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    let v = match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}"))?,
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64"))?,
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    };
    if !v.is_finite() {
        anyhow::bail!("field {name} is not finite: {v}");
    }
    Ok(v)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    fn kline_json(symbol: &str, close: &str, closed: bool) -> String {
        format!(
            r#"{{
                "stream": "{lower}@kline_1s",
                "data": {{
                    "e": "kline",
                    "E": 1700000000123,
                    "s": "{symbol}",
                    "k": {{
                        "t": 1700000000000,
                        "T": 1700000000999,
                        "i": "1s",
                        "o": "100.00",
                        "h": "105.00",
                        "l": "95.00",
                        "c": "{close}",
                        "v": "10.0",
                        "x": {closed}
                    }}
                }}
            }}"#,
            lower = symbol.to_lowercase(),
        )
    }

    /// One scripted upstream session: either a failed connect or a list of
    /// frames after which the session closes.
    enum Session {
        Refuse,
        Frames(Vec<String>),
    }

    struct ScriptedTransport {
        sessions: Mutex<VecDeque<Session>>,
        connects: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(sessions: Vec<Session>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                connects: AtomicUsize::new(0),
            }
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        async fn connect(&self, _url: &str) -> Result<TextStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().pop_front() {
                Some(Session::Frames(frames)) => {
                    Ok(futures_util::stream::iter(frames.into_iter().map(Ok)).boxed())
                }
                Some(Session::Refuse) | None => anyhow::bail!("connection refused"),
            }
        }
    }

    fn connector(max_attempts: u32) -> FeedConnector {
        FeedConnector::new(
            "wss://example.invalid",
            &["BTC".to_string()],
            "USDT",
            Duration::ZERO,
            max_attempts,
        )
    }

    #[test]
    fn build_url_contains_streams() {
        let url = build_kline_url(
            "wss://stream.binance.com:9443/",
            &["BTC".to_string(), "eth".to_string()],
            "USDT",
        );
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@kline_1s/ethusdt@kline_1s"
        );
    }

    #[test]
    fn parse_closed_candle() {
        let candle = parse_kline_envelope(&kline_json("BTCUSDT", "102.00", true), "USDT")
            .expect("should parse")
            .expect("closed candle");
        assert_eq!(candle.symbol, "BTC");
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 105.0);
        assert_eq!(candle.low, 95.0);
        assert_eq!(candle.close, 102.0);
        assert_eq!(candle.volume, 10.0);
        assert_eq!(candle.event_time, 1_700_000_000_123);
    }

    #[test]
    fn open_candle_is_discarded() {
        let parsed = parse_kline_envelope(&kline_json("BTCUSDT", "102.00", false), "USDT").unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn envelope_without_payload_is_ignored() {
        assert!(parse_kline_envelope(r#"{"result":null,"id":1}"#, "USDT").unwrap().is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(parse_kline_envelope("not json", "USDT").is_err());
        assert!(parse_kline_envelope(&kline_json("BTCUSDT", "abc", true), "USDT").is_err());
        assert!(parse_kline_envelope(r#"{"data":{"s":"BTCUSDT"}}"#, "USDT").is_err());
    }

    #[test]
    fn non_finite_fields_are_rejected() {
        assert!(parse_kline_envelope(&kline_json("BTCUSDT", "NaN", true), "USDT").is_err());
        assert!(parse_kline_envelope(&kline_json("BTCUSDT", "inf", true), "USDT").is_err());
        assert!(parse_kline_envelope(&kline_json("BTCUSDT", "-inf", true), "USDT").is_err());
        let nan_volume = kline_json("BTCUSDT", "102.00", true).replace(r#""v": "10.0""#, r#""v": "NaN""#);
        assert!(parse_kline_envelope(&nan_volume, "USDT").is_err());
    }

    #[test]
    fn base_symbol_strips_quote_suffix() {
        assert_eq!(base_symbol("btcusdt", "USDT"), "BTC");
        assert_eq!(base_symbol("USDT", "USDT"), "USDT");
        assert_eq!(base_symbol("ETHBTC", "USDT"), "ETHBTC");
        assert_eq!(base_symbol("ETHBTC", "BTC"), "ETH");
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let transport = ScriptedTransport::new(Vec::new());
        let feed = connector(5);
        let (tx, _rx) = mpsc::channel(8);

        let result = feed.run(&transport, tx).await;

        assert!(matches!(result, Err(FeedError::RetriesExhausted { attempts: 5 })));
        // One initial connect plus exactly five reconnects.
        assert_eq!(transport.connects(), 6);
        assert_eq!(feed.state(), FeedState::Failed);
    }

    #[tokio::test]
    async fn successful_open_resets_retry_counter() {
        let transport = ScriptedTransport::new(vec![
            Session::Refuse,
            Session::Frames(Vec::new()),
            Session::Refuse,
            Session::Refuse,
        ]);
        let feed = connector(2);
        let (tx, _rx) = mpsc::channel(8);

        let result = feed.run(&transport, tx).await;

        // refuse(1) -> open, reset -> close(1) -> refuse(2) -> refuse(3 > 2).
        // Without the reset it would stop after the third connect.
        assert!(matches!(result, Err(FeedError::RetriesExhausted { attempts: 2 })));
        assert_eq!(transport.connects(), 4);
        assert_eq!(feed.state(), FeedState::Failed);
    }

    #[tokio::test]
    async fn forwards_only_closed_candles() {
        let transport = ScriptedTransport::new(vec![Session::Frames(vec![
            kline_json("BTCUSDT", "101.00", false),
            "garbage".to_string(),
            kline_json("BTCUSDT", "102.00", true),
            kline_json("ETHUSDT", "2000.00", true),
        ])]);
        let feed = connector(0);
        let (tx, mut rx) = mpsc::channel(8);

        let _ = feed.run(&transport, tx).await;

        let first = rx.recv().await.expect("first candle");
        assert_eq!(first.symbol, "BTC");
        assert_eq!(first.close, 102.0);
        let second = rx.recv().await.expect("second candle");
        assert_eq!(second.symbol, "ETH");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn drops_candles_with_non_finite_values() {
        let nan_volume = kline_json("BTCUSDT", "101.00", true).replace(r#""v": "10.0""#, r#""v": "NaN""#);
        let transport = ScriptedTransport::new(vec![Session::Frames(vec![
            kline_json("BTCUSDT", "NaN", true),
            nan_volume,
            kline_json("BTCUSDT", "102.00", true),
        ])]);
        let feed = connector(0);
        let (tx, mut rx) = mpsc::channel(8);

        let _ = feed.run(&transport, tx).await;

        let only = rx.recv().await.expect("finite candle");
        assert_eq!(only.close, 102.0);
        assert_eq!(only.volume, 10.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stops_when_consumer_is_gone() {
        let transport = ScriptedTransport::new(vec![Session::Frames(vec![kline_json(
            "BTCUSDT", "102.00", true,
        )])]);
        let feed = connector(5);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let result = feed.run(&transport, tx).await;
        assert!(matches!(result, Err(FeedError::EventSinkClosed)));
        assert_eq!(transport.connects(), 1);
    }
}
