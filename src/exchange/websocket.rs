//! Mark-price WebSocket stream.
//!
//! Delivers `Ticker`s over a bounded channel; a full channel drops the update
//! so a slow consumer never stalls the socket reader.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::Ticker;

const FUTURES_WS_URL: &str = "wss://fstream.binance.com";
const FUTURES_TESTNET_WS_URL: &str = "wss://stream.binancefuture.com";

const TICKER_CHANNEL_CAPACITY: usize = 100;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[allow(dead_code)]
    stream: String,
    data: MarkPriceEvent,
}

#[derive(Debug, Deserialize)]
struct MarkPriceEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: String,
    #[serde(rename = "E")]
    event_time: i64,
}

/// Connects to the venue mark-price stream and fans updates into a channel.
pub struct TickerStream {
    base_url: String,
}

impl TickerStream {
    pub fn new(testnet: bool) -> Self {
        let base_url = if testnet {
            FUTURES_TESTNET_WS_URL.to_string()
        } else {
            FUTURES_WS_URL.to_string()
        };
        Self { base_url }
    }

    /// Subscribe to 1s mark-price updates for the given symbols.
    ///
    /// The reader task reconnects until shutdown fires; the receiver closes
    /// when the task exits.
    pub fn subscribe(
        &self,
        symbols: &[String],
        mut shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Ticker> {
        let (tx, rx) = mpsc::channel(TICKER_CHANNEL_CAPACITY);

        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@markPrice@1s", s.to_lowercase()))
            .collect();
        let url = format!("{}/stream?streams={}", self.base_url, streams.join("/"));

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                match run_connection(&url, &tx, &mut shutdown).await {
                    Ok(()) => break, // clean shutdown
                    Err(e) => {
                        warn!(error = %e, "Mark-price stream dropped, reconnecting");
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }
            info!("Mark-price stream closed");
        });

        rx
    }
}

async fn run_connection(
    url: &str,
    tx: &mpsc::Sender<Ticker>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (ws, _) = connect_async(url)
        .await
        .context("Failed to connect mark-price stream")?;
    info!("Mark-price stream connected");

    let (_, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(ticker) = parse_mark_price(&text) {
                            // Non-blocking: latest-wins for slow consumers
                            if tx.try_send(ticker).is_err() {
                                debug!("Ticker channel full, dropping update");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("stream closed by venue");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Mark-price stream read error");
                        return Err(e.into());
                    }
                }
            }
        }
    }
}

fn parse_mark_price(text: &str) -> Option<Ticker> {
    let envelope: StreamEnvelope = serde_json::from_str(text).ok()?;
    if envelope.data.event_type != "markPriceUpdate" {
        return None;
    }
    let mark_price = Decimal::from_str(&envelope.data.mark_price).ok()?;
    let at = Utc
        .timestamp_millis_opt(envelope.data.event_time)
        .single()
        .unwrap_or_else(Utc::now);
    Some(Ticker {
        symbol: envelope.data.symbol,
        mark_price,
        at,
    })
}
