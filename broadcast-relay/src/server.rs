use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
    time::{Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        self, Message as WsMessage, Utf8Bytes,
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    connection::{ConnectionId, Outbox},
    dispatcher::Dispatcher,
    error::RelayError,
    message::{Frame, FrameKind, Message},
    registry::Registry,
    stats::RelayStats,
};

/// How long a closing connection gets to flush its queue and send a Close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// How long shutdown waits for sessions before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// WebSocket front end: accepts connections and wires them to the registry
/// and dispatcher.
pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    stats: Arc<RelayStats>,
}

impl Relay {
    /// Builds a relay on an already bound listener. Fails if `config` does
    /// not validate.
    pub fn new(listener: TcpListener, config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::from_config(&config)?);
        let stats = Arc::new(RelayStats::new());
        let dispatcher =
            Dispatcher::from_config(Arc::clone(&registry), &config, Arc::clone(&stats));
        Ok(Self {
            listener,
            config,
            registry,
            dispatcher,
            stats,
        })
    }

    /// Binds `config.listen` and builds the relay.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Self::new(listener, config)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            config,
            registry,
            dispatcher,
            stats,
        } = self;
        tokio::pin!(shutdown);

        let mut sessions = JoinSet::new();
        let mut stats_ticker = config.stats_interval().map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(
                        accept_result,
                        &mut sessions,
                        &dispatcher,
                        &stats,
                        config.handshake_timeout(),
                    );
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = ?err, "connection task panicked or was cancelled");
                    }
                }
                _ = tick(&mut stats_ticker) => log_stats(&stats),
            }
        }

        shutdown_sessions(&registry, &mut sessions).await;
        log_stats(&stats);
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_stats(stats: &RelayStats) {
    match serde_json::to_string(&stats.snapshot()) {
        Ok(json) => info!(stats = %json, "relay stats"),
        Err(err) => warn!(error = ?err, "failed to serialize relay stats"),
    }
}

async fn shutdown_sessions(registry: &Registry, sessions: &mut JoinSet<()>) {
    let closed = registry.close_all();
    info!(connections = closed, "relay shutting down");

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = sessions.len(), "sessions did not close in time; aborting");
        sessions.abort_all();
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    sessions: &mut JoinSet<()>,
    dispatcher: &Dispatcher,
    stats: &Arc<RelayStats>,
    handshake_timeout: Duration,
) {
    match result {
        Ok((stream, peer)) => {
            let dispatcher = dispatcher.clone();
            let stats = Arc::clone(stats);
            sessions.spawn(async move {
                let connection =
                    handle_connection(stream, peer, dispatcher, stats, handshake_timeout);
                if let Err(err) = connection.await {
                    warn!(peer = %peer, error = ?err, "client connection closed with error");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    stats: Arc<RelayStats>,
    handshake_timeout: Duration,
) -> Result<()> {
    // Admission happens inside the upgrade, once the request has arrived, so a
    // socket that never finishes the handshake never becomes a member.
    let registry = dispatcher.registry();
    let mut admission: Option<Result<Outbox, RelayError>> = None;
    let admit = |_request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let result = registry.admit();
        let reply = match &result {
            Ok(_) => Ok(response),
            Err(error) => Err(rejection(error)),
        };
        admission = Some(result);
        reply
    };
    let handshake = tokio::time::timeout(handshake_timeout, accept_hdr_async(stream, admit)).await;

    let outbox = match admission {
        Some(Ok(outbox)) => outbox,
        Some(Err(error)) => {
            stats.record_rejected();
            warn!(peer = %peer, %error, "rejected connection");
            return Ok(());
        }
        None => {
            return match handshake {
                Ok(Err(err)) => Err(RelayError::from(err)).context("websocket handshake failed"),
                _ => Err(anyhow!("no upgrade request within {handshake_timeout:?}")),
            };
        }
    };
    let id = outbox.id();

    let websocket = match handshake {
        Ok(Ok(websocket)) => websocket,
        Ok(Err(err)) => {
            dispatcher.on_disconnect(id);
            return Err(RelayError::from(err)).context("websocket handshake failed");
        }
        Err(_) => {
            dispatcher.on_disconnect(id);
            return Err(anyhow!("websocket handshake timed out after {handshake_timeout:?}"));
        }
    };

    stats.record_connected();
    info!(connection = %id, peer = %peer, "client connected");

    let result = run_session(websocket, outbox, &dispatcher).await;

    stats.record_disconnected();
    info!(connection = %id, peer = %peer, "client disconnected");
    result
}

fn rejection(error: &RelayError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
}

async fn run_session<S>(websocket: S, outbox: Outbox, dispatcher: &Dispatcher) -> Result<()>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Unpin,
{
    let id = outbox.id();
    let (sink, inbound) = websocket.split();

    let writer = write_outbox(sink, outbox, dispatcher);
    let reader = read_inbound(inbound, id, dispatcher);
    tokio::pin!(writer);
    tokio::pin!(reader);

    // The writer only finishes on its own once the connection has been
    // evicted (shutdown, slow consumer) or a write failed.
    let result = select! {
        _ = &mut writer => Ok(()),
        result = &mut reader => {
            dispatcher.on_disconnect(id);
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                debug!(connection = %id, "gave up flushing outbound queue");
            }
            result
        }
    };

    dispatcher.on_disconnect(id);
    result
}

async fn write_outbox<S>(mut sink: S, mut outbox: Outbox, dispatcher: &Dispatcher)
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let id = outbox.id();
    while let Some(frame) = outbox.recv().await {
        if let Err(err) = sink.send(to_ws_message(frame)).await {
            dispatcher.on_transport_error(id, &RelayError::from(err));
            return;
        }
    }

    if let Err(err) = sink.close().await {
        debug!(connection = %id, error = ?err, "close frame not delivered");
    }
}

async fn read_inbound<S>(mut inbound: S, id: ConnectionId, dispatcher: &Dispatcher) -> Result<()>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(next) = inbound.next().await {
        let message = match next {
            Ok(message) => message,
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(err) => return Err(RelayError::from(err).into()),
        };

        let frame = match message {
            WsMessage::Text(text) => Frame::text(text.as_str()),
            WsMessage::Binary(payload) => Frame::binary(payload),
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };

        let report = dispatcher.on_message(&Message::new(id, frame));
        debug!(
            connection = %id,
            recipients = report.recipients,
            delivered = report.delivered,
            "broadcast dispatched"
        );
    }
    Ok(())
}

fn to_ws_message(frame: Frame) -> WsMessage {
    let kind = frame.kind();
    let payload = frame.into_payload();
    match kind {
        FrameKind::Text => match Utf8Bytes::try_from(payload.clone()) {
            Ok(text) => WsMessage::Text(text),
            Err(_) => WsMessage::Binary(payload),
        },
        FrameKind::Binary => WsMessage::Binary(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frames_stay_text_on_the_wire() {
        match to_ws_message(Frame::text("hi")) {
            WsMessage::Text(text) => assert_eq!(text.as_str(), "hi"),
            other => panic!("expected text message, got {other:?}"),
        }
        assert!(matches!(
            to_ws_message(Frame::binary(vec![1u8, 2, 3])),
            WsMessage::Binary(_)
        ));
    }

    #[tokio::test]
    async fn new_rejects_zero_queue_capacity() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let config = RelayConfig {
            outbound_queue_capacity: 0,
            ..RelayConfig::default()
        };
        assert!(Relay::new(listener, config).is_err());
        Ok(())
    }
}
