use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut socket = establish_connection(&args.server).await?;
    write_stdout(&format!("*** connected to {}", args.server)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut socket, &mut stdin, &mut input).await?;
    shutdown_connection(&mut socket).await;

    Ok(())
}

async fn establish_connection(server: &str) -> Result<Socket> {
    let (socket, _response) = connect_async(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    info!("connected to {server}");
    Ok(socket)
}

async fn run_client_loop(
    socket: &mut Socket,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = socket.next() => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, socket).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: Option<Result<Message, tungstenite::Error>>,
) -> Result<bool> {
    match message {
        Some(Ok(message)) => render_server_message(message).await,
        Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
        Some(Err(err)) => Err(err).context("failed to read from relay"),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    socket: &mut Socket,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving relay").await?;
        return Ok(false);
    }

    socket
        .send(Message::text(text.to_string()))
        .await
        .context("failed to send message")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(socket: &mut Socket) {
    if let Err(error) = socket.close(None).await {
        warn!(?error, "failed to close relay connection cleanly");
    }
}

/// Prints one received frame. Returns `false` once the relay has closed.
async fn render_server_message(message: Message) -> Result<bool> {
    match message {
        Message::Text(text) => write_stdout(text.as_str()).await?,
        Message::Binary(payload) => {
            write_stdout(&format!("*** binary message ({} bytes)", payload.len())).await?
        }
        Message::Close(_) => {
            write_stdout("*** relay closed the connection").await?;
            return Ok(false);
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
    }
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
