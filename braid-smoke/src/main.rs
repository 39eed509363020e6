//! End-to-end smoke test for braid-conn.
//!
//! Runs two real connections over a TCP socket pair on loopback and drives
//! the full protocol lifecycle: multi-channel traffic, fragmentation,
//! keepalive round-trips, and flush-then-stop shutdown. Nothing is stubbed.
//!
//! Usage: cargo run -p braid-smoke

use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use colored::Colorize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

use braid_conn::{ChannelDescriptor, ConnConfig, ConnError, Connection};

/// Low-priority bulk channel.
const CH_BULK: u8 = 0x01;

/// High-priority control channel.
const CH_CONTROL: u8 = 0x02;

/// Messages sent per channel in the burst step.
const BURST_MESSAGES: usize = 50;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    println!("\n{}", "=".repeat(70).bright_blue());
    println!("{}", "  BRAID CONNECTION END-TO-END SMOKE TEST".bright_blue().bold());
    println!("{}", "=".repeat(70).bright_blue());
    println!();

    let result = run_smoke_test().await;

    println!();
    match result {
        Ok(()) => {
            println!("{}", "=".repeat(70).bright_green());
            println!("{}", "  ALL CHECKS PASSED".bright_green().bold());
            println!("{}", "=".repeat(70).bright_green());
            println!();
            Ok(())
        }
        Err(e) => {
            println!("{}", "=".repeat(70).bright_red());
            println!("{}", format!("  SMOKE TEST FAILED: {e:#}").bright_red().bold());
            println!("{}", "=".repeat(70).bright_red());
            println!();
            std::process::exit(1);
        }
    }
}

fn check(name: &str) {
    println!("  {} {}", "[ OK ]".green().bold(), name);
}

fn smoke_config() -> ConnConfig {
    ConnConfig::new()
        .with_ping_interval(Duration::from_millis(500))
        .with_pong_timeout(Duration::from_millis(250))
        .with_flush_throttle(Duration::from_millis(20))
        // Generous caps so the burst step is not the bottleneck.
        .with_send_rate(8 * 1024 * 1024)
        .with_recv_rate(8 * 1024 * 1024)
}

fn smoke_channels() -> Vec<ChannelDescriptor> {
    vec![
        ChannelDescriptor::new(CH_BULK).with_send_queue_capacity(16),
        ChannelDescriptor::new(CH_CONTROL)
            .with_priority(10)
            .with_send_queue_capacity(16),
    ]
}

/// A connection plus capture channels for everything its callbacks see.
struct SmokeEnd {
    conn: Connection,
    messages: mpsc::UnboundedReceiver<(u8, Bytes)>,
    errors: mpsc::UnboundedReceiver<ConnError>,
}

fn smoke_end(stream: TcpStream) -> Result<SmokeEnd> {
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;

    let (msg_tx, messages) = mpsc::unbounded_channel();
    let (err_tx, errors) = mpsc::unbounded_channel();
    let conn = Connection::new(
        stream,
        smoke_channels(),
        move |channel, bytes| {
            let _ = msg_tx.send((channel, bytes));
        },
        move |err| {
            let _ = err_tx.send(err);
        },
        smoke_config(),
    );
    Ok(SmokeEnd {
        conn,
        messages,
        errors,
    })
}

async fn expect_message(end: &mut SmokeEnd, what: &str) -> Result<(u8, Bytes)> {
    timeout(Duration::from_secs(5), end.messages.recv())
        .await
        .with_context(|| format!("timed out waiting for {what}"))?
        .with_context(|| format!("capture channel closed waiting for {what}"))
}

fn ensure_healthy(end: &mut SmokeEnd, side: &str) -> Result<()> {
    if let Ok(err) = end.errors.try_recv() {
        bail!("{side} connection reported an error: {err}");
    }
    if !end.conn.is_running() {
        bail!("{side} connection is no longer running");
    }
    Ok(())
}

async fn run_smoke_test() -> Result<()> {
    // Step 1: establish a real TCP pair on loopback.
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("binding loopback listener")?;
    let addr = listener.local_addr()?;
    let (client_stream, (server_stream, _)) = tokio::try_join!(
        async { TcpStream::connect(addr).await.context("connecting") },
        async { listener.accept().await.context("accepting") },
    )?;
    check(&format!("TCP pair established on {addr}"));

    // Step 2: start both connections.
    let mut client = smoke_end(client_stream)?;
    let mut server = smoke_end(server_stream)?;
    client.conn.start().context("starting client")?;
    server.conn.start().context("starting server")?;
    check("both connections started");

    // Step 3: round-trip a small message in each direction.
    if !client.conn.send(CH_BULK, Bytes::from_static(b"hello from client")).await {
        bail!("client send refused");
    }
    let (channel, bytes) = expect_message(&mut server, "client greeting").await?;
    if (channel, &bytes[..]) != (CH_BULK, &b"hello from client"[..]) {
        bail!("server received wrong greeting on channel {channel}");
    }

    if !server.conn.send(CH_BULK, Bytes::from_static(b"hello from server")).await {
        bail!("server send refused");
    }
    let (channel, bytes) = expect_message(&mut client, "server greeting").await?;
    if (channel, &bytes[..]) != (CH_BULK, &b"hello from server"[..]) {
        bail!("client received wrong greeting on channel {channel}");
    }
    check("small messages round-trip in both directions");

    // Step 4: a message far above the packet payload bound, so it travels
    // as hundreds of fragments and must reassemble exactly.
    let big: Bytes = (0..512 * 1024u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
    if !client.conn.send(CH_BULK, big.clone()).await {
        bail!("client refused the large message");
    }
    let (channel, bytes) = expect_message(&mut server, "large message").await?;
    if channel != CH_BULK || bytes != big {
        bail!("large message corrupted in transit ({} bytes)", bytes.len());
    }
    check("512 KiB message fragmented and reassembled intact");

    // Step 5: interleaved burst across both priority classes.
    for i in 0..BURST_MESSAGES {
        let marker = (i % 256) as u8;
        if !client.conn.send(CH_BULK, Bytes::from(vec![marker; 700])).await {
            bail!("burst send refused on bulk channel at {i}");
        }
        if !client.conn.send(CH_CONTROL, Bytes::from(vec![marker; 40])).await {
            bail!("burst send refused on control channel at {i}");
        }
    }
    let mut bulk_seen = Vec::new();
    let mut control_seen = Vec::new();
    while bulk_seen.len() < BURST_MESSAGES || control_seen.len() < BURST_MESSAGES {
        let (channel, bytes) = expect_message(&mut server, "burst traffic").await?;
        match channel {
            CH_BULK => bulk_seen.push(bytes[0]),
            CH_CONTROL => control_seen.push(bytes[0]),
            other => bail!("burst arrived on unexpected channel {other}"),
        }
    }
    let expected: Vec<u8> = (0..BURST_MESSAGES).map(|i| (i % 256) as u8).collect();
    if bulk_seen != expected || control_seen != expected {
        bail!("per-channel ordering broken during burst");
    }
    check(&format!(
        "{BURST_MESSAGES} messages per channel delivered in order across priorities"
    ));

    // Step 6: sit past several ping intervals; keepalive must hold the
    // connection up with no errors on either side.
    sleep(Duration::from_millis(1200)).await;
    ensure_healthy(&mut client, "client")?;
    ensure_healthy(&mut server, "server")?;
    check("keepalive survives an idle period of multiple ping intervals");

    // Step 7: status reflects the traffic.
    let status = client.conn.status();
    if status.bytes_sent == 0 || status.channels.len() != 2 {
        bail!("client status looks wrong: {status:?}");
    }
    println!(
        "         client sent {} bytes ({} B/s), server recv {} bytes",
        status.bytes_sent,
        status.send_rate,
        server.conn.status().bytes_recv,
    );
    check("status reports byte counters and per-channel state");

    // Step 8: flush-stop with queued messages; everything accepted before
    // the call must arrive.
    for i in 0..5u8 {
        if !client.conn.send(CH_CONTROL, Bytes::from(vec![i; 64])).await {
            bail!("pre-flush-stop send refused");
        }
    }
    client.conn.flush_stop().await;
    if client.conn.is_running() {
        bail!("client still running after flush_stop");
    }
    if client.conn.send(CH_CONTROL, Bytes::from_static(b"late")).await {
        bail!("send accepted after flush_stop");
    }
    for i in 0..5u8 {
        let (channel, bytes) = expect_message(&mut server, "flush-stop drain").await?;
        if channel != CH_CONTROL || bytes[0] != i {
            bail!("flush-stop drain out of order");
        }
    }
    check("flush_stop drained every queued message before closing");

    // Step 9: orderly shutdown of the surviving side.
    server.conn.stop().await.context("stopping server")?;
    if server.conn.is_running() {
        bail!("server still running after stop");
    }
    check("server stopped cleanly");

    Ok(())
}
