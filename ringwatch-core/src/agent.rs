//! The per-silo membership subsystem.
//!
//! [`MembershipAgent`] owns the table cache, failure detector, voting engine,
//! heartbeat publisher and gossip disseminator of one silo. It is constructed
//! explicitly, joins the cluster, runs one task per periodic timer so that a
//! timer never overlaps itself, and tears everything down on shutdown.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::cache::MembershipTableCache;
use crate::config::{MembershipConfig, RetryConfig};
use crate::detector::{FailureDetector, ProbeObserver, ProbeOutcome, SuspicionEvent};
use crate::error::MembershipError;
use crate::gossip::GossipDisseminator;
use crate::heartbeat::HeartbeatPublisher;
use crate::identity::SiloAddress;
use crate::lifecycle::{LifecycleRegistry, stages};
use crate::observers::{GatewayListProvider, MembershipObserver, ObserverRegistry};
use crate::store::retry::with_retry;
use crate::store::{InsertOutcome, MembershipTableStore, WriteOutcome};
use crate::table::{MembershipEntry, MembershipTableSnapshot, SiloStatus, TableDelta};
use crate::transport::{MembershipMessageHandler, MembershipTransport, ProbeReply};
use crate::voting::{SuspicionEngine, VoteOutcome};

/// Static description of the local silo written into its row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSiloDetails {
    /// Identity of this incarnation.
    pub silo: SiloAddress,
    /// Human-readable name.
    pub silo_name: String,
    /// Host name recorded in the row.
    pub host_name: String,
    /// Client gateway port, if this silo accepts clients.
    pub proxy_port: Option<u16>,
    /// Optional role label.
    pub role: Option<String>,
}

impl LocalSiloDetails {
    /// Details with the host name taken from the endpoint address.
    pub fn new(silo: SiloAddress, silo_name: impl Into<String>) -> Self {
        Self {
            silo,
            silo_name: silo_name.into(),
            host_name: silo.endpoint.ip().to_string(),
            proxy_port: None,
            role: None,
        }
    }

    /// Sets the client gateway port.
    #[must_use]
    pub const fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = Some(port);
        self
    }

    /// Sets the role label.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    fn joining_entry(&self, now: DateTime<Utc>) -> MembershipEntry {
        let mut entry =
            MembershipEntry::joining(self.silo, self.silo_name.clone(), self.host_name.clone(), now);
        entry.proxy_port = self.proxy_port;
        entry.role.clone_from(&self.role);
        entry
    }
}

/// Coarse health of the membership subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipHealth {
    /// Store interactions succeed.
    Healthy,
    /// Store interactions keep failing; detection runs on the last snapshot.
    Degraded {
        /// Failed refreshes or heartbeats in a row.
        consecutive_failures: u32,
    },
    /// The cluster declared this silo Dead.
    Evicted,
}

/// How [`MembershipAgent::shutdown`] leaves the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Write ShuttingDown, stop every task, then write Dead.
    Graceful,
    /// Stop every task and write Dead.
    Fast,
}

/// Membership subsystem instance for one silo.
pub struct MembershipAgent {
    details: LocalSiloDetails,
    config: MembershipConfig,
    cache: Arc<MembershipTableCache>,
    transport: Arc<dyn MembershipTransport>,
    detector: FailureDetector,
    engine: SuspicionEngine,
    heartbeat: HeartbeatPublisher,
    gossip: GossipDisseminator,
    observers: ObserverRegistry,
    gateways: Arc<GatewayListProvider>,
    health: watch::Sender<MembershipHealth>,
    store_failures: AtomicU32,
    local_status: Mutex<Option<SiloStatus>>,
    stopped: AtomicBool,
    leaving: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MembershipAgent {
    /// Builds an agent that has not joined yet.
    ///
    /// # Errors
    ///
    /// Returns [`MembershipError::Configuration`] for invalid settings.
    pub fn new(
        details: LocalSiloDetails,
        config: MembershipConfig,
        store: Arc<dyn MembershipTableStore>,
        transport: Arc<dyn MembershipTransport>,
    ) -> Result<Arc<Self>, MembershipError> {
        Self::with_probe_observer(details, config, store, transport, None)
    }

    /// Like [`new`](Self::new), with a probe telemetry hook.
    ///
    /// # Errors
    ///
    /// Returns [`MembershipError::Configuration`] for invalid settings.
    pub fn with_probe_observer(
        details: LocalSiloDetails,
        config: MembershipConfig,
        store: Arc<dyn MembershipTableStore>,
        transport: Arc<dyn MembershipTransport>,
        probe_observer: Option<Arc<dyn ProbeObserver>>,
    ) -> Result<Arc<Self>, MembershipError> {
        config.validate()?;
        let local = details.silo;
        let cache = Arc::new(MembershipTableCache::new(store, config.table.retry.clone()));

        let mut detector = FailureDetector::new(local, &config);
        if let Some(observer) = probe_observer {
            detector = detector.with_observer(observer);
        }
        let engine = SuspicionEngine::new(local, config.voting.clone(), Arc::clone(&cache));
        let heartbeat = HeartbeatPublisher::new(
            local,
            Arc::clone(&cache),
            config.voting.max_declaration_attempts,
        );
        let gossip = GossipDisseminator::new(
            local,
            config.gossip.clone(),
            config.probe.timeout,
            Arc::clone(&transport),
        );

        let observers = ObserverRegistry::new();
        let gateways = Arc::new(GatewayListProvider::new());
        observers.register(Arc::clone(&gateways) as Arc<dyn MembershipObserver>);

        let (health, _) = watch::channel(MembershipHealth::Healthy);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            details,
            config,
            cache,
            transport,
            detector,
            engine,
            heartbeat,
            gossip,
            observers,
            gateways,
            health,
            store_failures: AtomicU32::new(0),
            local_status: Mutex::new(None),
            stopped: AtomicBool::new(false),
            leaving: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Identity of the local silo.
    pub const fn local(&self) -> SiloAddress {
        self.details.silo
    }

    /// Configuration in effect.
    pub const fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// The local table cache.
    pub const fn cache(&self) -> &Arc<MembershipTableCache> {
        &self.cache
    }

    /// The failure detector.
    pub const fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    /// Client gateway list kept current by this agent.
    pub const fn gateways(&self) -> &Arc<GatewayListProvider> {
        &self.gateways
    }

    /// Registers an additional table observer.
    pub fn register_observer(&self, observer: Arc<dyn MembershipObserver>) {
        self.observers.register(observer);
    }

    /// Current health.
    pub fn health(&self) -> MembershipHealth {
        *self.health.borrow()
    }

    /// Watches health transitions.
    pub fn subscribe_health(&self) -> watch::Receiver<MembershipHealth> {
        self.health.subscribe()
    }

    /// Status this silo last wrote for itself, `None` before joining.
    pub fn local_status(&self) -> Option<SiloStatus> {
        *self.local_status.lock()
    }

    /// Registers join, activation and shutdown with the host lifecycle.
    pub fn participate(self: &Arc<Self>, registry: &LifecycleRegistry) {
        let agent = Arc::clone(self);
        registry.on_start(stages::RUNTIME_SERVICES, "membership-join", move |_| {
            let agent = Arc::clone(&agent);
            async move { agent.join().await }
        });
        let agent = Arc::clone(self);
        registry.on_start(stages::BECOME_ACTIVE, "membership-become-active", move |_| {
            let agent = Arc::clone(&agent);
            async move { agent.become_active().await }
        });
        let agent = Arc::clone(self);
        registry.on_stop(stages::RUNTIME_SERVICES, "membership-shutdown", move |_| {
            let agent = Arc::clone(&agent);
            async move { agent.shutdown(ShutdownMode::Graceful).await }
        });
    }

    /// Enters the cluster as Joining and starts the refresh, notification and
    /// heartbeat tasks.
    ///
    /// # Errors
    ///
    /// Fails if the table cannot be read, a newer incarnation of this endpoint
    /// is live, the row cannot be inserted, or the optional connectivity check
    /// finds unreachable Active silos.
    pub async fn join(self: &Arc<Self>) -> Result<(), MembershipError> {
        let local = self.local();
        info!(silo = %local, "joining cluster");
        let snapshot = self.cache.refresh().await?;

        if let Some(newer) = snapshot.entries().find(|entry| {
            local.is_older_generation_of(&entry.silo) && !entry.status.is_terminal()
        }) {
            return Err(MembershipError::SupersededGeneration {
                local,
                newer: newer.silo,
            });
        }

        self.spawn_notifier();

        let stale: Vec<SiloAddress> = snapshot
            .entries()
            .filter(|entry| {
                entry.silo.is_older_generation_of(&local) && !entry.status.is_terminal()
            })
            .map(|entry| entry.silo)
            .collect();
        for old in stale {
            info!(silo = %local, old = %old, "retiring previous incarnation");
            self.write_status(old, SiloStatus::Dead, &self.config.table.retry, self.write_attempts())
                .await?;
        }

        self.insert_own_row().await?;
        self.spawn_refresher();
        self.spawn_heartbeat();

        if self.config.join.validate_initial_connectivity
            && let Err(err) = self.check_initial_connectivity().await
        {
            error!(silo = %local, "initial connectivity check failed: {err}");
            if let Err(shutdown_err) = self.shutdown(ShutdownMode::Fast).await {
                warn!(silo = %local, "cleanup after failed join: {shutdown_err}");
            }
            return Err(err);
        }

        info!(silo = %local, version = self.cache.version().version, "joined cluster");
        Ok(())
    }

    /// Writes Active and starts probing and gossip.
    ///
    /// # Errors
    ///
    /// Fails if the status write is rejected or keeps losing version races.
    pub async fn become_active(self: &Arc<Self>) -> Result<(), MembershipError> {
        self.write_status(
            self.local(),
            SiloStatus::Active,
            &self.config.table.retry,
            self.write_attempts(),
        )
        .await?;
        self.spawn_prober();
        self.spawn_gossip();
        info!(silo = %self.local(), "silo active");
        Ok(())
    }

    /// Leaves the cluster, stopping every task and cancelling pending probes.
    ///
    /// Status writes are best effort: one refresh after a version conflict and
    /// no retry on unavailability.
    ///
    /// # Errors
    ///
    /// Returns the failure of the final Dead write; earlier failures are logged.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<(), MembershipError> {
        if self.leaving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let local = self.local();
        let writable = self.local_status().is_some() && self.health() != MembershipHealth::Evicted;
        let best_effort = self.config.table.retry.single_attempt();
        info!(silo = %local, ?mode, "shutting down membership");

        if writable
            && mode == ShutdownMode::Graceful
            && let Err(err) = self
                .write_status(local, SiloStatus::ShuttingDown, &best_effort, 2)
                .await
        {
            warn!(silo = %local, "failed to announce shutdown: {err}");
        }

        self.stop_tasks().await;

        let result = if writable {
            self.write_status(local, SiloStatus::Dead, &best_effort, 2).await
        } else {
            Ok(())
        };
        match &result {
            Ok(()) => info!(silo = %local, "membership stopped"),
            Err(err) => warn!(silo = %local, "final status write failed: {err}"),
        }
        result
    }

    /// Stops every task without touching the table, as a crashed process
    /// would. Peers find out through missed probes; a later
    /// [`shutdown`](Self::shutdown) is a no-op.
    pub async fn abort(&self) {
        if self.leaving.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(silo = %self.local(), "membership aborted without leaving the table");
        self.stop_tasks().await;
    }

    /// Probes every current target once and votes on resulting suspicions.
    ///
    /// # Errors
    ///
    /// Currently infallible; vote failures are logged and retried next cycle.
    pub async fn run_probe_cycle(&self) -> Result<(), MembershipError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let targets = self.detector.targets();
        let results = join_all(targets.iter().map(|target| self.probe_once(*target))).await;

        let mut events: Vec<SuspicionEvent> = Vec::new();
        let now = Instant::now();
        for (target, outcome) in targets.iter().zip(results) {
            if let Some(event) = self.detector.record_probe(*target, &outcome, now) {
                events.push(event);
            }
        }
        for event in self.detector.stale_targets(&self.cache.current(), Utc::now()) {
            if !events.iter().any(|existing| existing.target == event.target) {
                events.push(event);
            }
        }

        for event in events {
            debug!(target = %event.target, reason = ?event.reason, "silo suspected");
            match self.engine.handle_suspicion(&event).await {
                Ok(VoteOutcome::DeclaredDead | VoteOutcome::AlreadyDead) => {
                    self.detector.evict(&event.target);
                }
                Ok(outcome) => trace!(target = %event.target, ?outcome, "suspicion handled"),
                Err(err) => warn!(target = %event.target, "suspicion vote failed: {err}"),
            }
        }
        Ok(())
    }

    async fn probe_once(&self, target: SiloAddress) -> ProbeOutcome {
        let started = Instant::now();
        match time::timeout(self.config.probe.timeout, self.transport.probe(target)).await {
            Ok(Ok(reply)) if reply.responder == target => ProbeOutcome::Ack {
                responder: reply.responder,
                latency: started.elapsed(),
            },
            Ok(Ok(reply)) => ProbeOutcome::WrongGeneration {
                responder: reply.responder,
            },
            Ok(Err(err)) => ProbeOutcome::Refused(err.to_string()),
            Err(_) => ProbeOutcome::Timeout,
        }
    }

    async fn check_initial_connectivity(&self) -> Result<(), MembershipError> {
        let local = self.local();
        let peers: Vec<SiloAddress> = self
            .cache
            .current()
            .active_silos()
            .into_iter()
            .filter(|silo| *silo != local)
            .collect();
        let outcomes = join_all(peers.iter().map(|peer| self.probe_once(*peer))).await;
        let unreachable: Vec<SiloAddress> = peers
            .into_iter()
            .zip(outcomes)
            .filter(|(peer, outcome)| !outcome.is_ack_from(peer))
            .map(|(peer, _)| peer)
            .collect();
        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(MembershipError::InitialConnectivity { unreachable })
        }
    }

    async fn insert_own_row(&self) -> Result<(), MembershipError> {
        let local = self.local();
        let entry = self.details.joining_entry(Utc::now());
        let store = Arc::clone(self.cache.store());
        let outcome = with_retry(&self.config.table.retry, "insert_row", || {
            store.insert_row(entry.clone())
        })
        .await?;

        match outcome {
            InsertOutcome::Inserted { version, row } => {
                self.cache.record_write(&version, row);
            }
            InsertOutcome::AlreadyExists => {
                debug!(silo = %local, "row already present, adopting it");
                let snapshot = self.cache.refresh().await?;
                match snapshot.get(&local) {
                    Some(row) if row.status.is_terminal() => {
                        return Err(MembershipError::SelfDeclaredDead(local));
                    }
                    Some(_) => {}
                    None => {
                        return Err(MembershipError::JoinFailed(format!(
                            "insert for {local} reported a duplicate but no row is readable"
                        )));
                    }
                }
            }
        }
        *self.local_status.lock() = Some(SiloStatus::Joining);
        Ok(())
    }

    const fn write_attempts(&self) -> usize {
        self.config.voting.max_declaration_attempts
    }

    /// Conditionally moves `silo` to `status`, refreshing after each lost race.
    async fn write_status(
        &self,
        silo: SiloAddress,
        status: SiloStatus,
        retry: &RetryConfig,
        attempts: usize,
    ) -> Result<(), MembershipError> {
        let local = self.local();
        let store = Arc::clone(self.cache.store());
        let attempts = attempts.max(1);

        for attempt in 1..=attempts {
            let snapshot = self.cache.current();
            let Some(entry) = snapshot.get(&silo) else {
                return Err(MembershipError::JoinFailed(format!("no membership row for {silo}")));
            };
            if entry.status.is_terminal() {
                return if silo == local && status != SiloStatus::Dead {
                    Err(MembershipError::SelfDeclaredDead(local))
                } else {
                    Ok(())
                };
            }
            if entry.status == status {
                return Ok(());
            }

            let mut row = entry.clone();
            row.set_status(status)?;
            let expected = snapshot.read_version().clone();
            let outcome =
                with_retry(retry, "update_row", || store.update_row(row.clone(), &expected)).await?;

            match outcome {
                WriteOutcome::Applied { version, row } => {
                    info!(%silo, %status, version = version.version, "status written");
                    self.cache.record_write(&version, row);
                    if silo == local {
                        *self.local_status.lock() = Some(status);
                    }
                    return Ok(());
                }
                WriteOutcome::VersionConflict { current } => {
                    debug!(%silo, %status, attempt, current = current.version, "status write lost version race");
                    self.cache.refresh_with(retry).await?;
                }
                WriteOutcome::RowDead => {
                    self.cache.refresh_with(retry).await?;
                }
                WriteOutcome::RowMissing => {
                    return Err(MembershipError::JoinFailed(format!(
                        "no membership row for {silo}"
                    )));
                }
            }
        }

        Err(MembershipError::Contention {
            operation: "status write",
            attempts,
        })
    }

    fn on_snapshot(&self, snapshot: &MembershipTableSnapshot) {
        let local = self.local();
        if let Some(own) = snapshot.get(&local)
            && own.status.is_terminal()
            && !self.leaving.load(Ordering::SeqCst)
        {
            self.handle_eviction();
        }
        self.detector.update_targets(snapshot);
        self.observers.notify(snapshot);
    }

    fn handle_eviction(&self) {
        if self.health.send_replace(MembershipHealth::Evicted) == MembershipHealth::Evicted {
            return;
        }
        error!(silo = %self.local(), "local silo declared dead by the cluster, stopping membership");
        self.stopped.store(true, Ordering::SeqCst);
        *self.local_status.lock() = Some(SiloStatus::Dead);
        self.shutdown_tx.send_replace(true);
    }

    fn record_store_success(&self) {
        self.store_failures.store(0, Ordering::SeqCst);
        self.health.send_if_modified(|health| {
            if matches!(health, MembershipHealth::Degraded { .. }) {
                info!(silo = %self.local(), "membership store reachable again");
                *health = MembershipHealth::Healthy;
                true
            } else {
                false
            }
        });
    }

    fn record_store_failure(&self) {
        let failures = self.store_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < self.config.table.degraded_after_failures {
            return;
        }
        self.health.send_if_modified(|health| {
            if *health == MembershipHealth::Evicted {
                return false;
            }
            if *health == MembershipHealth::Healthy {
                warn!(
                    silo = %self.local(),
                    failures,
                    "membership store unreachable, detection degraded to last known table"
                );
            }
            *health = MembershipHealth::Degraded {
                consecutive_failures: failures,
            };
            true
        });
    }

    async fn refresh_tick(&self) {
        match self.cache.refresh().await {
            Ok(_) => self.record_store_success(),
            Err(err) => {
                self.record_store_failure();
                warn!(silo = %self.local(), "membership refresh failed: {err}");
            }
        }
    }

    async fn heartbeat_tick(&self) {
        match self.heartbeat.publish(Utc::now()).await {
            Ok(()) => self.record_store_success(),
            Err(MembershipError::SelfDeclaredDead(_)) => self.handle_eviction(),
            Err(err) => {
                self.record_store_failure();
                warn!(silo = %self.local(), "heartbeat failed: {err}");
            }
        }
    }

    async fn gossip_tick(&self) {
        let snapshot = self.cache.current();
        self.gossip.flush(&snapshot).await;
    }

    async fn probe_tick(&self) {
        if let Err(err) = self.run_probe_cycle().await {
            warn!(silo = %self.local(), "probe cycle failed: {err}");
        }
    }

    fn spawn_notifier(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        let mut snapshots = self.cache.subscribe();
        let mut changes = self.cache.subscribe_changes();
        let mut shutdown = self.shutdown_tx.subscribe();
        self.on_snapshot(&self.cache.current());

        self.track(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = Arc::clone(&snapshots.borrow_and_update());
                        agent.on_snapshot(&snapshot);
                    }
                    change = changes.recv() => match change {
                        Ok(change) => {
                            agent.gossip.enqueue(&change);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "gossip queue lagged behind table changes");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }));
    }

    fn spawn_refresher(self: &Arc<Self>) {
        self.spawn_periodic("refresh", self.config.table.refresh_interval, |agent| async move {
            agent.refresh_tick().await;
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        self.spawn_periodic("heartbeat", self.config.heartbeat.interval, |agent| async move {
            agent.heartbeat_tick().await;
        });
    }

    fn spawn_prober(self: &Arc<Self>) {
        self.spawn_periodic("probe", self.config.probe.interval, |agent| async move {
            agent.probe_tick().await;
        });
    }

    fn spawn_gossip(self: &Arc<Self>) {
        if !self.config.gossip.enabled {
            return;
        }
        self.spawn_periodic("gossip", self.config.gossip.interval, |agent| async move {
            agent.gossip_tick().await;
        });
    }

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, tick: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let agent = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        self.track(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => tick(Arc::clone(&agent)).await,
                }
            }
            trace!(task = name, "membership task stopped");
        }));
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    async fn stop_tasks(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl MembershipMessageHandler for MembershipAgent {
    fn local_silo(&self) -> SiloAddress {
        self.local()
    }

    fn on_probe(&self, from: SiloAddress) -> Option<ProbeReply> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        trace!(silo = %self.local(), %from, "answering probe");
        Some(ProbeReply {
            responder: self.local(),
        })
    }

    fn on_gossip(&self, from: SiloAddress, delta: TableDelta) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let outcome = self.cache.apply_delta(delta);
        trace!(silo = %self.local(), %from, ?outcome, "gossip merged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ColumnUpdate;
    use crate::store::memory::InMemoryMembershipTable;
    use crate::table::SuspectVote;
    use crate::transport::local::LocalNetwork;
    use std::net::SocketAddr;

    fn details(port: u16, generation: i64) -> LocalSiloDetails {
        let silo = SiloAddress::new(SocketAddr::from(([127, 0, 0, 1], port)), generation);
        LocalSiloDetails::new(silo, format!("silo-{port}")).with_proxy_port(port + 1_000)
    }

    fn agent(
        table: &Arc<InMemoryMembershipTable>,
        network: &Arc<LocalNetwork>,
        details: LocalSiloDetails,
    ) -> Arc<MembershipAgent> {
        let store: Arc<dyn MembershipTableStore> = table.clone();
        let transport: Arc<dyn MembershipTransport> = network.transport_for(details.silo);
        let agent = MembershipAgent::new(details, MembershipConfig::default(), store, transport).unwrap();
        let handler: Arc<dyn MembershipMessageHandler> = agent.clone();
        network.register(&handler);
        agent
    }

    #[tokio::test(start_paused = true)]
    async fn join_then_activate_writes_rows() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let network = LocalNetwork::new();
        let a = agent(&table, &network, details(11_000, 1));

        a.join().await.unwrap();
        assert_eq!(table.row(&a.local()).map(|row| row.status), Some(SiloStatus::Joining));
        assert_eq!(a.local_status(), Some(SiloStatus::Joining));

        let mut gateways = a.gateways().subscribe();
        a.become_active().await.unwrap();
        assert_eq!(table.row(&a.local()).map(|row| row.status), Some(SiloStatus::Active));
        time::timeout(Duration::from_secs(1), gateways.wait_for(|list| list.len() == 1))
            .await
            .unwrap()
            .unwrap();

        a.shutdown(ShutdownMode::Fast).await.unwrap();
        assert_eq!(table.row(&a.local()).map(|row| row.status), Some(SiloStatus::Dead));
    }

    #[tokio::test(start_paused = true)]
    async fn older_generation_cannot_join_over_newer() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let network = LocalNetwork::new();
        let newer = agent(&table, &network, details(11_000, 5));
        newer.join().await.unwrap();

        let older = agent(&table, &network, details(11_000, 4));
        let err = older.join().await.unwrap_err();
        assert!(matches!(err, MembershipError::SupersededGeneration { .. }));
        newer.shutdown(ShutdownMode::Fast).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_agent_stays_silent() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let network = LocalNetwork::new();
        let a = agent(&table, &network, details(11_000, 1));
        a.join().await.unwrap();
        assert!(a.on_probe(a.local()).is_some());
        a.shutdown(ShutdownMode::Graceful).await.unwrap();
        assert!(a.on_probe(a.local()).is_none());
        assert!(a.shutdown(ShutdownMode::Graceful).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn status_write_keeps_votes_the_cache_never_saw() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let network = LocalNetwork::new();
        let a = agent(&table, &network, details(11_000, 1));
        let b = agent(&table, &network, details(11_001, 1));
        for silo in [&a, &b] {
            silo.join().await.unwrap();
        }
        for silo in [&a, &b] {
            silo.become_active().await.unwrap();
        }

        // b's vote on a reaches the store; a only hears a delta carrying the
        // resulting table version.
        let now = Utc::now();
        let vote = ColumnUpdate::SuspectVote {
            vote: SuspectVote {
                voter: b.local(),
                at: now,
            },
            cutoff: now - chrono::TimeDelta::minutes(5),
            max_votes: 8,
        };
        table.merge_column(a.local(), vote, &table.version()).await.unwrap();
        let b_row = table.row(&b.local()).unwrap();
        a.on_gossip(
            b.local(),
            TableDelta {
                version: table.version(),
                entries: vec![b_row],
            },
        );
        assert_eq!(a.cache().version().version, table.version().version);

        a.shutdown(ShutdownMode::Graceful).await.unwrap();
        let row = table.row(&a.local()).unwrap();
        assert_eq!(row.status, SiloStatus::Dead);
        assert!(row.vote_of(&b.local()).is_some());
        b.shutdown(ShutdownMode::Fast).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn abort_leaves_row_for_peers_to_clean_up() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let network = LocalNetwork::new();
        let a = agent(&table, &network, details(11_000, 1));
        a.join().await.unwrap();
        a.become_active().await.unwrap();

        a.abort().await;
        assert!(a.on_probe(a.local()).is_none());
        a.shutdown(ShutdownMode::Graceful).await.unwrap();
        assert_eq!(table.row(&a.local()).map(|row| row.status), Some(SiloStatus::Active));
    }
}
