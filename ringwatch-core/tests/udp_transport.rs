#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use ringwatch_core::config::GossipConfig;
use ringwatch_core::{
    ChangeOrigin, GossipDisseminator, InMemoryMembershipTable, LocalSiloDetails, MembershipAgent,
    MembershipConfig, MembershipEntry, MembershipMessageHandler, MembershipTableSnapshot,
    MembershipTableStore, MembershipTransport, ProbeReply, ShutdownMode, SiloAddress, SiloStatus,
    TableChange, TableDelta, TableVersion, TransportError, UdpTransport,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

fn silo(idx: u16, generation: i64) -> SiloAddress {
    SiloAddress::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 35_000 + idx),
        generation,
    )
}

struct Recorder {
    silo: SiloAddress,
    answer: bool,
    gossip: Mutex<Vec<(SiloAddress, TableDelta)>>,
}

impl Recorder {
    fn new(silo: SiloAddress, answer: bool) -> Arc<Self> {
        Arc::new(Self {
            silo,
            answer,
            gossip: Mutex::new(Vec::new()),
        })
    }
}

impl MembershipMessageHandler for Recorder {
    fn local_silo(&self) -> SiloAddress {
        self.silo
    }

    fn on_probe(&self, _from: SiloAddress) -> Option<ProbeReply> {
        self.answer.then_some(ProbeReply {
            responder: self.silo,
        })
    }

    fn on_gossip(&self, from: SiloAddress, delta: TableDelta) {
        self.gossip.lock().push((from, delta));
    }
}

struct Endpoint {
    transport: Arc<UdpTransport>,
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<()>,
}

impl Endpoint {
    async fn start(handler: Arc<dyn MembershipMessageHandler>) -> Self {
        let transport = UdpTransport::bind(handler.local_silo()).await.expect("bind");
        let (shutdown, rx) = watch::channel(false);
        let listener = transport.spawn_listener(handler, rx);
        Self {
            transport,
            shutdown,
            listener,
        }
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        self.listener.await.expect("listener task");
    }
}

fn active_row(silo: SiloAddress, row_version: u64) -> MembershipEntry {
    let name = format!("silo-{}", silo.endpoint.port());
    let mut entry = MembershipEntry::joining(silo, name, "localhost", Utc::now());
    entry.status = SiloStatus::Active;
    entry.row_version = row_version;
    entry
}

fn delta_of(rows: usize) -> TableDelta {
    let entries = (0..rows)
        .map(|idx| {
            let port = 500 + u16::try_from(idx).expect("small index");
            active_row(silo(port, 1), idx as u64 + 1)
        })
        .collect();
    TableDelta {
        version: TableVersion::initial().next(),
        entries,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn probe_round_trips_over_udp() {
    let a = Recorder::new(silo(1, 1), true);
    let b = Recorder::new(silo(2, 7), true);
    let a_end = Endpoint::start(a.clone()).await;
    let b_end = Endpoint::start(b.clone()).await;

    let reply = time::timeout(Duration::from_secs(2), a_end.transport.probe(b.silo))
        .await
        .expect("probe answered in time")
        .expect("probe");
    assert_eq!(reply.responder, b.silo);
    assert_eq!(a_end.transport.pending_probes(), 0);

    a_end.stop().await;
    b_end.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn silent_peer_leaves_no_pending_probe_behind() {
    let a = Recorder::new(silo(3, 1), true);
    let mute = Recorder::new(silo(4, 1), false);
    let a_end = Endpoint::start(a.clone()).await;
    let mute_end = Endpoint::start(mute.clone()).await;

    let waited = time::timeout(Duration::from_millis(200), a_end.transport.probe(mute.silo)).await;
    assert!(waited.is_err(), "a silent peer must not answer");
    assert_eq!(a_end.transport.pending_probes(), 0);

    a_end.stop().await;
    mute_end.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn stopping_the_listener_fails_outstanding_probes() {
    let a = Recorder::new(silo(5, 1), true);
    let mute = Recorder::new(silo(6, 1), false);
    let a_end = Endpoint::start(a.clone()).await;
    let mute_end = Endpoint::start(mute.clone()).await;

    let transport = Arc::clone(&a_end.transport);
    let target = mute.silo;
    let probe = tokio::spawn(async move { transport.probe(target).await });
    time::sleep(Duration::from_millis(100)).await;
    a_end.stop().await;

    let result = time::timeout(Duration::from_secs(2), probe)
        .await
        .expect("probe resolved")
        .expect("probe task");
    assert!(matches!(result, Err(TransportError::Closed)));
    mute_end.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn gossip_is_delivered_and_oversized_deltas_rejected() {
    let a = Recorder::new(silo(7, 1), true);
    let b = Recorder::new(silo(8, 1), true);
    let a_end = Endpoint::start(a.clone()).await;
    let b_end = Endpoint::start(b.clone()).await;

    let delta = delta_of(3);
    a_end
        .transport
        .push_gossip(b.silo, &delta)
        .await
        .expect("gossip sent");
    let delivered = time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some((from, received)) = b.gossip.lock().first().cloned() {
                return (from, received);
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("gossip delivered");
    assert_eq!(delivered, (a.silo, delta));

    let oversized = a_end.transport.push_gossip(b.silo, &delta_of(200)).await;
    assert!(matches!(oversized, Err(TransportError::MessageTooLarge(_))));

    a_end.stop().await;
    b_end.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn refresh_of_a_sixty_silo_table_reaches_peers_in_batches() {
    let a = Recorder::new(silo(20, 1), true);
    let b = Recorder::new(silo(21, 1), true);
    let a_end = Endpoint::start(a.clone()).await;
    let b_end = Endpoint::start(b.clone()).await;

    let transport: Arc<dyn MembershipTransport> = a_end.transport.clone();
    let config = GossipConfig::default();
    let batch = config.max_batch_entries;
    let gossip = GossipDisseminator::new(a.silo, config, Duration::from_secs(1), transport);

    let refreshed = delta_of(60);
    let snapshot = MembershipTableSnapshot::new(
        refreshed.version.clone(),
        [active_row(a.silo, 61), active_row(b.silo, 62)],
    );
    gossip.enqueue(&TableChange {
        origin: ChangeOrigin::Refresh,
        version: refreshed.version.clone(),
        changed: refreshed.entries.clone(),
    });

    let mut flushes = 0;
    while gossip.pending_len() > 0 {
        assert_eq!(gossip.flush(&snapshot).await, 1, "every batch fits one datagram");
        flushes += 1;
        assert!(flushes <= 60, "backlog must drain");
    }
    assert_eq!(flushes, 60usize.div_ceil(batch));

    let received = time::timeout(Duration::from_secs(2), async {
        loop {
            let silos: std::collections::BTreeSet<SiloAddress> = b
                .gossip
                .lock()
                .iter()
                .flat_map(|(_, delta)| delta.entries.iter().map(|row| row.silo))
                .collect();
            if silos.len() == 60 {
                return silos;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("every row delivered");
    let expected: std::collections::BTreeSet<SiloAddress> =
        refreshed.entries.iter().map(|row| row.silo).collect();
    assert_eq!(received, expected);
    assert!(b.gossip.lock().iter().all(|(from, delta)| *from == a.silo && delta.entries.len() <= batch));

    a_end.stop().await;
    b_end.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn udp_cluster_declares_a_silent_silo_dead() {
    let mut config = MembershipConfig::default();
    config.probe.interval = Duration::from_millis(100);
    config.probe.timeout = Duration::from_millis(50);
    config.probe.miss_window = Duration::from_secs(2);
    config.gossip.interval = Duration::from_millis(50);
    config.table.refresh_interval = Duration::from_millis(500);

    let table = Arc::new(InMemoryMembershipTable::new());
    let mut agents = Vec::new();
    let mut endpoints = Vec::new();
    for idx in 10..13 {
        let local = silo(idx, 1);
        let transport = UdpTransport::bind(local).await.expect("bind");
        let store: Arc<dyn MembershipTableStore> = table.clone();
        let sender: Arc<dyn MembershipTransport> = transport.clone();
        let agent = MembershipAgent::new(
            LocalSiloDetails::new(local, format!("silo-{idx}")),
            config.clone(),
            store,
            sender,
        )
        .expect("valid configuration");
        let (shutdown, rx) = watch::channel(false);
        let listener = transport.spawn_listener(agent.clone(), rx);
        endpoints.push(Endpoint {
            transport,
            shutdown,
            listener,
        });
        agents.push(agent);
    }
    for agent in &agents {
        agent.join().await.expect("join");
    }
    for agent in &agents {
        agent.become_active().await.expect("become active");
    }

    let victim = agents[2].local();
    let silent = endpoints.pop().expect("victim endpoint");
    silent.stop().await;

    let declared = time::timeout(Duration::from_secs(20), async {
        while table.row(&victim).map(|row| row.status) != Some(SiloStatus::Dead) {
            time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(declared.is_ok(), "silent silo was never declared dead");

    for agent in &agents[..2] {
        assert_eq!(table.row(&agent.local()).map(|row| row.status), Some(SiloStatus::Active));
    }
    for agent in &agents {
        let _ = agent.shutdown(ShutdownMode::Fast).await;
    }
    for endpoint in endpoints {
        endpoint.stop().await;
    }
}
