//! Runs a small cluster on loopback, kills one silo and measures how long the
//! survivors take to declare it dead.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use ringwatch_core::{
    GatewayEntry, InMemoryMembershipTable, LocalNetwork, LocalSiloDetails, MembershipAgent,
    MembershipConfig, MembershipMessageHandler, MembershipTableStore, MembershipTransport,
    ShutdownMode, SiloAddress, SiloStatus, UdpTransport,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::config::{SimulationConfig, TransportKind};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// Transport the silos used.
    pub transport: TransportKind,
    /// Silo that was killed.
    pub victim: SiloAddress,
    /// Silos still running at the end.
    pub survivors: Vec<SiloAddress>,
    /// Time from the kill until the victim's row turned Dead.
    pub detection_time: Duration,
    /// Table version after the declaration.
    pub table_version: u64,
    /// Gateway list a survivor advertised once it noticed the death.
    pub gateways: Vec<GatewayEntry>,
}

/// UDP listener owned by the simulation for one silo.
struct Listener {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Listener {
    async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            warn!("udp listener ended abnormally: {err}");
        }
    }
}

struct SimulatedSilo {
    agent: Arc<MembershipAgent>,
    listener: Option<Listener>,
}

/// Starts `settings.silos` silos sharing one in-memory table, kills silo
/// `kill` without letting it leave, and waits for the rest to declare it Dead.
///
/// # Errors
///
/// Fails for an out-of-range `kill`, when a silo cannot start, or when the
/// cluster misses either deadline in `settings`.
pub async fn run_simulation(
    membership: &MembershipConfig,
    settings: &SimulationConfig,
    kill: u16,
) -> Result<SimulationReport> {
    if settings.silos < 2 {
        bail!("a simulation needs at least two silos");
    }
    if kill >= settings.silos {
        bail!("cannot kill silo {kill}: only {} silos are started", settings.silos);
    }
    let last_port = settings
        .base_port
        .checked_add(settings.silos.saturating_mul(2))
        .ok_or_else(|| anyhow!("base port {} leaves no room for the cluster", settings.base_port))?;
    info!(
        silos = settings.silos,
        transport = ?settings.transport,
        ports = %format!("{}..{last_port}", settings.base_port),
        "starting simulated cluster"
    );

    let table = Arc::new(InMemoryMembershipTable::new());
    let network = LocalNetwork::new();
    let mut silos = Vec::with_capacity(usize::from(settings.silos));
    for idx in 0..settings.silos {
        let silo = start_silo(membership, settings, &table, &network, idx).await?;
        silos.push(silo);
    }
    for silo in &silos {
        silo.agent
            .join()
            .await
            .with_context(|| format!("silo {} failed to join", silo.agent.local()))?;
    }
    for silo in &silos {
        silo.agent
            .become_active()
            .await
            .with_context(|| format!("silo {} failed to become active", silo.agent.local()))?;
    }

    let expected = silos.len();
    wait_until(settings.settle_timeout, "every silo to see the full cluster", || {
        silos
            .iter()
            .all(|silo| silo.agent.cache().current().active_silos().len() == expected)
    })
    .await?;
    info!(silos = expected, version = table.version().version, "cluster settled");

    let victim = silos.remove(usize::from(kill));
    let victim_silo = victim.agent.local();
    info!(victim = %victim_silo, "killing silo");
    let killed_at = Instant::now();
    victim.agent.abort().await;
    if let Some(listener) = victim.listener {
        listener.stop().await;
    }

    wait_until(settings.detection_timeout, "the killed silo to be declared dead", || {
        table.row(&victim_silo).is_some_and(|row| row.status == SiloStatus::Dead)
    })
    .await?;
    let detection_time = killed_at.elapsed();
    let table_version = table.version().version;
    info!(victim = %victim_silo, ?detection_time, version = table_version, "killed silo declared dead");

    let observer = silos
        .first()
        .map(|silo| Arc::clone(&silo.agent))
        .ok_or_else(|| anyhow!("no surviving silo"))?;
    wait_until(settings.settle_timeout, "gateway lists to drop the dead silo", || {
        observer
            .gateways()
            .gateways()
            .iter()
            .all(|entry| entry.silo != victim_silo)
    })
    .await?;
    let gateways = Vec::clone(&observer.gateways().gateways());

    let survivors = silos.iter().map(|silo| silo.agent.local()).collect();
    for silo in silos {
        if let Err(err) = silo.agent.shutdown(ShutdownMode::Graceful).await {
            warn!(silo = %silo.agent.local(), "shutdown failed: {err}");
        }
        if let Some(listener) = silo.listener {
            listener.stop().await;
        }
    }

    Ok(SimulationReport {
        transport: settings.transport,
        victim: victim_silo,
        survivors,
        detection_time,
        table_version,
        gateways,
    })
}

async fn start_silo(
    membership: &MembershipConfig,
    settings: &SimulationConfig,
    table: &Arc<InMemoryMembershipTable>,
    network: &Arc<LocalNetwork>,
    idx: u16,
) -> Result<SimulatedSilo> {
    let port = settings.base_port + idx;
    let silo = SiloAddress::new_generation(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    let details = LocalSiloDetails::new(silo, format!("silo-{idx}"))
        .with_proxy_port(settings.base_port + settings.silos + idx);
    let store: Arc<dyn MembershipTableStore> = table.clone();

    match settings.transport {
        TransportKind::Local => {
            let transport: Arc<dyn MembershipTransport> = network.transport_for(silo);
            let agent = MembershipAgent::new(details, membership.clone(), store, transport)?;
            let handler: Arc<dyn MembershipMessageHandler> = agent.clone();
            network.register(&handler);
            Ok(SimulatedSilo {
                agent,
                listener: None,
            })
        }
        TransportKind::Udp => {
            let udp = UdpTransport::bind(silo)
                .await
                .with_context(|| format!("failed to bind {}", silo.endpoint))?;
            let transport: Arc<dyn MembershipTransport> = udp.clone();
            let agent = MembershipAgent::new(details, membership.clone(), store, transport)?;
            let (shutdown, rx) = watch::channel(false);
            let task = udp.spawn_listener(agent.clone(), rx);
            Ok(SimulatedSilo {
                agent,
                listener: Some(Listener { shutdown, task }),
            })
        }
    }
}

async fn wait_until(deadline: Duration, what: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    time::timeout(deadline, async {
        while !condition() {
            time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| anyhow!("timed out after {deadline:?} waiting for {what}"))
}
