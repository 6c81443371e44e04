// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ksync::config::{Config, TransportKind};
use ksync::ctx::Ksync;
use ksync::transport::netlink::NetlinkWire;
use ksync::transport::stream::{StreamEndpoint, StreamWire};
use ksync::transport::udp::UdpWire;
use ksync::transport::Wire;

fn init_logging(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    if let Err(e) = result {
        eprintln!("logging init failed: {e}");
    }
}

async fn build_wire(config: &Config, shard: usize) -> anyhow::Result<Arc<dyn Wire>> {
    match config.transport_kind()? {
        TransportKind::Netlink => {
            let wire = NetlinkWire::connect(config.family)?;
            Ok(Arc::new(wire))
        }
        TransportKind::Udp => {
            let wire = UdpWire::connect(config.server_addr()?).await?;
            Ok(Arc::new(wire))
        }
        TransportKind::Tcp => {
            let endpoint = StreamEndpoint::Tcp(config.server_addr()?);
            let wire = StreamWire::connect(endpoint, config.family).await?;
            Ok(Arc::new(wire))
        }
        TransportKind::Unix => {
            let path = config
                .socket
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--socket missing for unix transport"))?;
            let _ = shard;
            let wire = StreamWire::connect(StreamEndpoint::Unix(path), config.family).await?;
            Ok(Arc::new(wire))
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let mut wires = Vec::with_capacity(config.flow_shards);
    for shard in 0..config.flow_shards {
        wires.push(build_wire(&config, shard).await?);
    }
    let mut wires = wires.into_iter();
    let ctx = Ksync::init(config.flow_shards, move |_| match wires.next() {
        Some(wire) => wire,
        None => unreachable!("wire per shard prepared above"),
    });
    ctx.start();

    info!(
        transport = %config.transport,
        shards = config.flow_shards,
        "ksync engine running"
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt, shutting down"),
        _ = sigterm.recv() => info!("sigterm, shutting down"),
    }

    ctx.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_logging(&config);

    if let Err(e) = run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
