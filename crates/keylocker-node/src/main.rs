mod adaptor;
mod api;
mod config;
mod conn_manager;
mod discovery;
mod dispatcher;
mod host;
mod identity;
mod network;
mod peer_store;
mod pending;
mod protocol;
mod relay;
mod service;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use crate::{
    adaptor::AdaptorContext,
    conn_manager::ConnManager,
    dispatcher::Dispatcher,
    host::P2pHost,
    network::PeerTransport,
    peer_store::PeerStore,
    protocol::GetKeyProtocol,
    relay::{FaultTolerance, RelaySettings},
    service::KeyService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keylocker_node=info,libp2p=warn")),
        )
        .init();

    let config = config::Config::parse();
    if config.gen_key {
        let identity = identity::NodeIdentity::generate();
        println!("{}={}", config.private_key_env, identity.encode()?);
        eprintln!("peer id: {}", identity.peer_id());
        return Ok(());
    }
    config.validate()?;
    let identity = identity::NodeIdentity::from_env(&config.private_key_env)?;
    let local = identity.peer_id();
    let own_id = local.to_bytes();
    let sig = identity.sign(&own_id)?;
    if !identity.public_key().verify(&own_id, &sig) {
        anyhow::bail!("identity key cannot verify its own signature");
    }

    tracing::info!(
        peer_id = %local,
        public_key = %hex::encode(identity.public_key().encode_protobuf()),
        "keylocker node starting",
    );

    // ── Backends ────────────────────────────────────────────────────────────
    let mut ctx = AdaptorContext::new(config.aes_key_bytes()?, config.rsa_bits);
    ctx.ethereum_contract = config.ethereum_contract.clone();
    ctx.ipfs_nodes = config.ipfs_node.clone();
    let dispatcher = Arc::new(Dispatcher::new(&config.chains, &ctx));
    if dispatcher.chains().is_empty() {
        tracing::warn!(configured = ?config.chains, "No chain is served locally; every get will be relayed");
    }

    // ── P2P host ────────────────────────────────────────────────────────────
    let swarm = network::build_swarm(
        identity.keypair().clone(),
        config.listen_multiaddr()?,
        &config.rendezvous,
    )?;

    let peer_store = Arc::new(PeerStore::new());
    let (discovered_tx, discovered_rx) = mpsc::channel(128);
    let (mut host, client) = P2pHost::new(
        local,
        &config.rendezvous,
        ConnManager::new(config.conn_low_water, config.conn_high_water, config.conn_grace()),
        peer_store.clone(),
        discovered_tx,
    );

    let transport: Arc<dyn PeerTransport> = Arc::new(client.clone());
    let protocol = Arc::new(GetKeyProtocol::new(
        identity.keypair().clone(),
        peer_store.clone(),
        dispatcher.clone(),
        transport,
    ));
    host.set_protocol(protocol.clone());

    let relay = Arc::new(FaultTolerance::new(
        protocol,
        RelaySettings {
            attempts: config.fault_tolerance_times,
            poll_interval: config.relay_poll_interval(),
            timeout: config.relay_timeout(),
        },
    ));
    let service = Arc::new(KeyService::new(dispatcher, Some(relay)));

    tokio::spawn(discovery::run_recovery(
        local,
        client.clone(),
        peer_store.clone(),
        discovered_rx,
    ));

    // ── JSON API ────────────────────────────────────────────────────────────
    if let Some(addr) = config.api_addr {
        let state = api::ApiState::new(service, peer_store, Some(client), local.to_base58());
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, addr).await {
                tracing::error!("API server stopped: {e}");
            }
        });
    }

    host.run(swarm).await
}
