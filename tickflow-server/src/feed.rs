//! Websocket bridge from an upstream market data feed into a [`LiveTickSource`] channel.
//!
//! [`LiveTickSource`]: tickflow::pipeline::source::LiveTickSource

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tickflow::{InstrumentId, RawTick, enrich::threshold::ThresholdHandle};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Upstream feed client configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    /// Delay before the first reconnect attempt, doubled per consecutive failure.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl FeedConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Messages accepted from the upstream feed.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedMessage {
    /// Out-of-band refresh of an instrument's large trade threshold.
    Threshold {
        instrument: InstrumentId,
        large_trade_threshold: f64,
    },
    Tick(RawTick),
}

enum Session {
    /// The pipeline stopped consuming ticks.
    PipelineClosed,
    /// The upstream connection ended and should be re-established.
    Disconnected,
}

/// Forward ticks from `config.url` into `tx` until the pipeline drops its receiver, reconnecting
/// with capped exponential backoff whenever the upstream connection ends.
pub async fn run(config: FeedConfig, tx: mpsc::Sender<RawTick>, thresholds: ThresholdHandle) {
    let mut delay = config.reconnect_delay;

    loop {
        match connect_async(config.url.as_str()).await {
            Ok((stream, _)) => {
                info!(url = %config.url, "connected to tick feed");
                delay = config.reconnect_delay;

                if let Session::PipelineClosed = forward(stream, &tx, &thresholds).await {
                    info!("pipeline stopped, closing tick feed");
                    return;
                }
                warn!(url = %config.url, "tick feed disconnected");
            }
            Err(error) => {
                error!(url = %config.url, %error, "failed to connect to tick feed");
            }
        }

        if tx.is_closed() {
            return;
        }

        info!(delay_ms = delay.as_millis() as u64, "reconnecting to tick feed");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(config.max_reconnect_delay);
    }
}

async fn forward(
    mut stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    tx: &mpsc::Sender<RawTick>,
    thresholds: &ThresholdHandle,
) -> Session {
    loop {
        let message = tokio::select! {
            _ = tx.closed() => return Session::PipelineClosed,
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(payload))) => {
                if stream.send(Message::Pong(payload)).await.is_err() {
                    return Session::Disconnected;
                }
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "tick feed sent close frame");
                return Session::Disconnected;
            }
            Some(Ok(_)) => continue,
            Some(Err(error)) => {
                warn!(%error, "tick feed read error");
                return Session::Disconnected;
            }
            None => return Session::Disconnected,
        };

        match serde_json::from_str::<FeedMessage>(&text) {
            Ok(FeedMessage::Tick(tick)) => {
                if tx.send(tick).await.is_err() {
                    return Session::PipelineClosed;
                }
            }
            Ok(FeedMessage::Threshold {
                instrument,
                large_trade_threshold,
            }) => {
                debug!(%instrument, large_trade_threshold, "refreshed large trade threshold");
                thresholds.set(instrument, large_trade_threshold);
            }
            Err(error) => {
                warn!(%error, payload = %text.as_str(), "skipping undecodable feed message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_message_decoding() {
        let tick = r#"{"instrument":"DIXON","time":"2024-01-02T10:00:00Z","last_price":101.5}"#;
        assert!(matches!(
            serde_json::from_str::<FeedMessage>(tick),
            Ok(FeedMessage::Tick(tick)) if tick.last_price == 101.5
        ));

        let threshold = r#"{"instrument":"DIXON","large_trade_threshold":2500.0}"#;
        assert!(matches!(
            serde_json::from_str::<FeedMessage>(threshold),
            Ok(FeedMessage::Threshold { large_trade_threshold, .. }) if large_trade_threshold == 2500.0
        ));

        assert!(serde_json::from_str::<FeedMessage>(r#"{"instrument":"DIXON"}"#).is_err());
    }
}
