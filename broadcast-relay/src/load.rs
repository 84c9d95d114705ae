//! Load generator: many concurrent clients hammering one relay.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{task::JoinSet, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::cli::LoadArgs;

/// A client stops listening once the relay has been quiet this long after its
/// last send.
const IDLE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct Counters {
    connected: AtomicU64,
    failed_connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub server: String,
    pub clients: usize,
    pub messages_per_client: usize,
    pub connected: u64,
    pub failed_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub elapsed_ms: u128,
}

pub async fn run(args: LoadArgs) -> Result<()> {
    let summary = run_load(&args).await?;
    let json = serde_json::to_string_pretty(&summary).context("failed to encode summary")?;
    println!("{json}");
    Ok(())
}

pub async fn run_load(args: &LoadArgs) -> Result<LoadSummary> {
    let counters = Arc::new(Counters::default());
    let started = Instant::now();

    let mut workers = JoinSet::new();
    for client in 0..args.clients {
        let counters = Arc::clone(&counters);
        let args = args.clone();
        workers.spawn(async move {
            if let Err(err) = client_worker(client, &args, &counters).await {
                counters.failed_connections.fetch_add(1, Ordering::Relaxed);
                warn!(client, error = ?err, "load client failed");
            }
        });
    }
    while let Some(joined) = workers.join_next().await {
        joined.context("load client task panicked")?;
    }

    Ok(LoadSummary {
        server: args.server.clone(),
        clients: args.clients,
        messages_per_client: args.messages,
        connected: counters.connected.load(Ordering::Relaxed),
        failed_connections: counters.failed_connections.load(Ordering::Relaxed),
        messages_sent: counters.messages_sent.load(Ordering::Relaxed),
        messages_received: counters.messages_received.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis(),
    })
}

async fn client_worker(client: usize, args: &LoadArgs, counters: &Counters) -> Result<()> {
    let (socket, _response) = connect_async(args.server.as_str())
        .await
        .with_context(|| format!("client {client} failed to connect"))?;
    counters.connected.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = socket.split();

    let delay = Duration::from_millis(args.delay_ms);
    let sender = async {
        for n in 1..=args.messages {
            let text = format!("Test message {n} from client {client}");
            sink.send(Message::text(text)).await?;
            counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok::<_, anyhow::Error>(())
    };

    let receiver = async {
        while let Ok(Some(Ok(message))) = timeout(IDLE_TIMEOUT + delay, stream.next()).await {
            if message.is_text() || message.is_binary() {
                counters.messages_received.fetch_add(1, Ordering::Relaxed);
            }
        }
    };

    let (sent, ()) = tokio::join!(sender, receiver);
    sent?;

    if let Err(err) = sink.close().await {
        debug!(client, error = ?err, "close frame not delivered");
    }
    Ok(())
}
