//! Two nodes on an in-process fabric exchanging RAW, LONG and RDMA traffic.
//!
//! Run:
//! - cargo run -p nicwarp --example loopback
//! - RUST_LOG=nicwarp_transport=trace cargo run -p nicwarp --example loopback
//! - cargo run -p nicwarp --example loopback -- 0.3
//!   (answers 30% of RDMA requests with a remote error)

use std::{env, thread};

use nicwarp::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let error_rate: f64 = env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0.0);

    let fabric = LoopbackFabric::new();
    fabric.set_ack_error_rate(error_rate);
    let alpha = fabric.attach(Config::for_node(1))?;
    let beta = fabric.attach(Config::for_node(2))?;
    fabric.link(1, 2)?;

    let server = beta.open()?;
    let raw_port = server.bind(Transport::Raw, PortSelector::Any, false)?;
    let long_port = server.bind(Transport::Long, PortSelector::Any, false)?;
    println!("node 2 listening on RAW port {} and LONG port {}", raw_port, long_port);

    let echo = thread::spawn(move || -> nicwarp::Result<()> {
        for _ in 0..3 {
            let (src, payload) = server.recv(Transport::Raw, raw_port.get())?;
            println!("[node 2] RAW from {}: {}", src, String::from_utf8_lossy(&payload));
            server.send(Transport::Raw, src, raw_port.get(), &payload)?;
        }
        let (src, payload) = server.recv(Transport::Long, long_port.get())?;
        println!("[node 2] LONG from {}: {} bytes", src, payload.len());
        Ok(())
    });

    let client = alpha.open()?;
    client.bind(Transport::Raw, PortSelector::Exact(raw_port.get()), false)?;
    for i in 0..3 {
        let message = format!("hello {}", i);
        client.send(Transport::Raw, 2, raw_port.get(), message.as_bytes())?;
        let (src, reply) = client.recv(Transport::Raw, raw_port.get())?;
        println!("[node 1] echo from {}: {}", src, String::from_utf8_lossy(&reply));
    }

    let bulk: Vec<u8> = (0..60_000u32).map(|i| i as u8).collect();
    client.send(Transport::Long, 2, long_port.get(), &bulk)?;
    if let Ok(result) = echo.join() {
        result?;
    }

    let local = alpha.zone().layout.user_base();
    let remote = beta.zone().layout.user_base();
    alpha.zone().memory.write(local, b"written by node 1")?;
    match client.rdma_write(2, local, remote, 17, Completion::Blocking)? {
        SendOutcome::Completed { remote_error, .. } => {
            println!("[node 1] RDMA write done, remote error: {}", remote_error)
        }
        SendOutcome::Pending(token) => println!("[node 1] RDMA write {} pending", token.msg_id),
    }

    let stats = alpha.statistics();
    println!(
        "node 1: raw sent {} / received {}, long sent {}, rdma retries {}, completions {}",
        stats.raw.packets_sent,
        stats.raw.packets_received,
        stats.long.packets_sent,
        stats.rdma_retries,
        stats.rdma_completions
    );
    Ok(())
}
