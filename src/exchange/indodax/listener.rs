// =============================================================================
// Indodax websocket session — auth, subscribe, read loop, restart
// =============================================================================

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use super::wire::{decode_frame, WsRequest, WsResponse};
use super::{IndodaxFeed, EXCHANGE_ID};
use crate::error::FeedError;
use crate::exchange::MarketDataFeed;

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Every trade consumer dropped its receiver.
    ConsumersGone,
}

#[async_trait]
impl MarketDataFeed for IndodaxFeed {
    fn name(&self) -> &'static str {
        EXCHANGE_ID
    }

    async fn listen(&self, connection_id: usize, pairs: Vec<String>) -> anyhow::Result<()> {
        let mut failures: u32 = 0;
        loop {
            match self.listen_once(connection_id, &pairs).await {
                Ok(SessionEnd::ConsumersGone) => {
                    info!(connection = connection_id, "no trade consumers left, closing indodax listener");
                    return Ok(());
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.config.reconnect.delay_for(failures);
                    error!(
                        connection = connection_id,
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "restarting indodax market data listener"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

impl IndodaxFeed {
    /// One full session: dial, authenticate, subscribe and read until the
    /// socket fails.
    pub(crate) async fn listen_once(&self, connection_id: usize, pairs: &[String]) -> Result<SessionEnd, FeedError> {
        let (ws, _response) = connect_async(self.config.ws_url.as_str()).await?;
        info!(connection = connection_id, url = %self.config.ws_url, "indodax websocket connected");

        let (mut write, mut read) = ws.split();
        let client_id = chrono::Utc::now().timestamp() + connection_id as i64;

        self.authenticate(&mut write, &mut read, client_id).await?;
        debug!(connection = connection_id, client_id, "indodax session authenticated");

        let subscribe = self.subscribe_pairs(&mut write, connection_id, client_id, pairs);
        let read_loop = self.read_loop(&mut read, connection_id);
        tokio::pin!(subscribe, read_loop);

        let mut subscribed = false;
        loop {
            tokio::select! {
                res = &mut subscribe, if !subscribed => {
                    res?;
                    subscribed = true;
                    info!(connection = connection_id, pairs = pairs.len(), "indodax market data websocket fully initiated");
                }
                end = &mut read_loop => return end,
            }
        }
    }

    /// Send the token and require a session id in the first reply.
    async fn authenticate<W, R>(&self, write: &mut W, read: &mut R, client_id: i64) -> Result<(), FeedError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let auth = WsRequest::auth(&self.config.public_ws_token, client_id);
        write.send(Message::Text(serde_json::to_string(&auth)?)).await?;

        let frame = match read.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(other)) => return Err(FeedError::Auth(format!("unexpected auth reply frame: {other:?}"))),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(FeedError::Connection("socket closed during auth".into())),
        };

        let (values, decode_err) = decode_frame(&frame);
        let reply: Option<&WsResponse> = values.first();
        match reply {
            Some(reply) if !reply.result.client.is_empty() => Ok(()),
            _ => Err(FeedError::Auth(match decode_err {
                Some(e) => format!("{e} [raw: {frame}]"),
                None => format!("no client id in reply [raw: {frame}]"),
            })),
        }
    }

    /// Subscribe order-book and trade channels for every pair, pausing after
    /// each pair.
    async fn subscribe_pairs<W>(
        &self,
        write: &mut W,
        connection_id: usize,
        client_id: i64,
        pairs: &[String],
    ) -> Result<(), FeedError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let delay = self.config.subscribe_delay();
        for (idx, pair) in pairs.iter().enumerate() {
            for prefix in [&self.config.orderbook_channel_prefix, &self.config.trade_channel_prefix] {
                let req = WsRequest::subscribe(format!("{prefix}{pair}"), client_id);
                write.send(Message::Text(serde_json::to_string(&req)?)).await?;
            }
            debug!(
                connection = connection_id,
                pair = %pair,
                progress = %format!("{}/{}", idx + 1, pairs.len()),
                "subscribed to orderbook and trade activity channels"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    /// Read frames until the socket fails or every trade consumer is gone.
    async fn read_loop<R>(&self, read: &mut R, connection_id: usize) -> Result<SessionEnd, FeedError>
    where
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let text = match read.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    return Err(FeedError::Connection(format!("closed by venue: {frame:?}")));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(FeedError::Connection("stream ended".into())),
            };

            // A malformed frame or value costs only that value. The session is
            // kept rather than torn down and re-dialled over bad venue data.
            let (values, decode_err) = decode_frame(&text);
            if let Some(e) = decode_err {
                contain(e, connection_id, "-")?;
            }

            for value in &values {
                if let Err(e) = self.route(value) {
                    contain(e, connection_id, &value.result.channel)?;
                }
            }

            if self.consumers_gone() {
                return Ok(SessionEnd::ConsumersGone);
            }
        }
    }
}

/// Hand session-fatal errors back to the caller; log and swallow the rest.
fn contain(err: FeedError, connection_id: usize, channel: &str) -> Result<(), FeedError> {
    if err.is_session_fatal() {
        return Err(err);
    }
    warn!(connection = connection_id, channel, error = %err, "market data value skipped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::feed_with_sinks;
    use super::*;
    use crate::config::IndodaxConfig;
    use crate::exchange::ReconnectPolicy;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use tokio_tungstenite::accept_async;

    /// Venue double: answers auth with `auth_reply`, swallows the expected
    /// subscriptions, then pushes `frames` and closes.
    async fn spawn_venue(auth_reply: &'static str, frames: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let auth = ws.next().await.unwrap().unwrap();
            let auth: serde_json::Value = serde_json::from_str(auth.to_text().unwrap()).unwrap();
            assert_eq!(auth["params"]["token"], "tok");
            ws.send(Message::Text(auth_reply.to_string())).await.unwrap();
            if auth_reply.contains("\"client\":\"\"") {
                return;
            }

            for _ in 0..2 {
                let sub = ws.next().await.unwrap().unwrap();
                let sub: serde_json::Value = serde_json::from_str(sub.to_text().unwrap()).unwrap();
                assert_eq!(sub["method"], 1);
            }
            for frame in frames {
                ws.send(Message::Text(frame)).await.unwrap();
            }
            let _ = ws.close(None).await;
        });
        format!("ws://{addr}")
    }

    fn config(url: String) -> IndodaxConfig {
        IndodaxConfig {
            ws_url: url,
            public_ws_token: "tok".into(),
            subscribe_delay_ms: 0,
            reconnect: ReconnectPolicy::Immediate,
            ..IndodaxConfig::default()
        }
    }

    #[tokio::test]
    async fn session_routes_every_value_in_a_frame() {
        let frame = concat!(
            r#"{"result":{"channel":"market:trade-activity-btcidr","data":{"data":[["btcidr",60,1,"buy",100,"1","0.01"],["btcidr",60,1,"buy",100,"1","0.01"]],"offset":1}}}"#,
            r#"{"result":{"channel":"market:order-book-btcidr","data":{"data":{"pair":"btcidr","bid":[{"price":"9","btc_volume":"1"}],"ask":[]},"offset":2}}}"#,
        );
        let url = spawn_venue(r#"{"id":1,"result":{"client":"c-1","version":"1"}}"#, vec![frame.to_string()]).await;
        let (feed, mut ob_rx, mut tr_rx) = feed_with_sinks(config(url));

        let err = feed.listen_once(1, &["btcidr".to_string()]).await.unwrap_err();
        assert!(err.is_session_fatal());

        let trade = tr_rx.try_recv().unwrap();
        assert_eq!(trade.key.to_string(), "60-1");
        assert!(tr_rx.try_recv().is_err());
        assert_eq!(ob_rx.try_recv().unwrap().pair, "btcidr");
        assert!(feed.orderbooks().get("btcidr").is_some());
    }

    #[tokio::test]
    async fn empty_client_id_is_an_auth_error() {
        let url = spawn_venue(r#"{"id":1,"result":{"client":""}}"#, vec![]).await;
        let (feed, _ob_rx, _tr_rx) = feed_with_sinks(config(url));

        let err = feed.listen_once(1, &["btcidr".to_string()]).await.unwrap_err();
        assert!(matches!(err, FeedError::Auth(_)));
    }

    #[tokio::test]
    async fn session_ends_cleanly_when_consumers_are_gone() {
        let frame = r#"{"result":{"channel":"market:trade-activity-btcidr","data":{"data":[],"offset":1}}}"#;
        let url = spawn_venue(r#"{"id":1,"result":{"client":"c-1"}}"#, vec![frame.to_string()]).await;
        let (feed, _ob_rx, tr_rx) = feed_with_sinks(config(url));
        drop(tr_rx);

        let end = feed.listen_once(1, &["btcidr".to_string()]).await.unwrap();
        assert_eq!(end, SessionEnd::ConsumersGone);
    }

    #[test]
    fn only_session_fatal_errors_escape_the_read_loop() {
        assert!(contain(FeedError::Decode("bad tuple".into()), 1, "market:trade-activity-btcidr").is_ok());
        assert!(matches!(
            contain(FeedError::Connection("reset".into()), 1, "-"),
            Err(FeedError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped_without_ending_the_session() {
        let good = r#"{"result":{"channel":"market:trade-activity-btcidr","data":{"data":[["btcidr",60,7,"sell",100,"1","0.01"]],"offset":1}}}"#;
        let url = spawn_venue(
            r#"{"id":1,"result":{"client":"c-1"}}"#,
            vec!["garbage{".to_string(), good.to_string()],
        )
        .await;
        let (feed, _ob_rx, mut tr_rx) = feed_with_sinks(config(url));

        // Only the venue closing the socket ends the session.
        let err = feed.listen_once(1, &["btcidr".to_string()]).await.unwrap_err();
        assert!(matches!(err, FeedError::Connection(_)));
        assert_eq!(tr_rx.try_recv().unwrap().key.sequence, 7);
    }

    /// Venue that accepts TCP and hangs up before the websocket handshake,
    /// reporting the virtual time of every dial.
    async fn spawn_hangup_venue() -> (String, mpsc::UnboundedReceiver<Instant>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                let _ = tx.send(Instant::now());
                drop(tcp);
            }
        });
        (format!("ws://{addr}"), rx)
    }

    async fn dial_times(reconnect: ReconnectPolicy, dials: usize) -> Vec<Instant> {
        let (url, mut dialled) = spawn_hangup_venue().await;
        let (feed, _ob_rx, _tr_rx) = feed_with_sinks(IndodaxConfig { reconnect, ..config(url) });
        let feed = Arc::new(feed);
        let task = {
            let feed = feed.clone();
            tokio::spawn(async move { feed.listen(1, vec!["btcidr".to_string()]).await })
        };

        let mut times = Vec::with_capacity(dials);
        while times.len() < dials {
            times.push(dialled.recv().await.unwrap());
        }
        task.abort();
        times
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_policy_redials_after_every_failure_without_waiting() {
        let times = dial_times(ReconnectPolicy::Immediate, 4).await;
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] < Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_policy_waits_before_each_redial() {
        let times = dial_times(ReconnectPolicy::Fixed { delay_ms: 250 }, 3).await;
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_policy_backs_off_per_consecutive_failure() {
        let policy = ReconnectPolicy::Exponential { base_ms: 100, max_ms: 300 };
        let times = dial_times(policy.clone(), 4).await;
        for (attempt, pair) in times.windows(2).enumerate() {
            assert!(pair[1] - pair[0] >= policy.delay_for(attempt as u32 + 1));
        }
        assert!(times[3] - times[0] >= Duration::from_millis(100 + 200 + 300));
    }
}
