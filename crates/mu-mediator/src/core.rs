use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use mu_proto::config::Config;
use mu_proto::params::Settings;
use mu_proto::protocol::{Broadcast, Command, StatusReport};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::EnhanceBackend;
use crate::cooldown::Cooldown;
use crate::debounce::Debouncer;
use crate::lifecycle::Lifecycle;
use crate::locator::{locator_host, LocatorResolver};
use crate::preload::PreloadCache;
use crate::render::{RemoteSurface, SurfacePolicy};
use crate::session::{Document, Enhancer};
use crate::stream_store::StreamStore;
use crate::supervisor::Supervisor;
use crate::visibility::VisibilityTracker;

pub type ConsumerId = u64;

/// All inputs to the mediator, processed one at a time by [`MediatorCore::run`].
pub enum MediatorEvent {
    ConsumerConnected {
        id: ConsumerId,
        outbound: mpsc::UnboundedSender<Broadcast>,
    },
    ConsumerGone(ConsumerId),
    Command(ConsumerId, Command),
    /// Debounced scroll/resize tick for one consumer.
    Cycle(ConsumerId),
    AutoTick,
    ResumeAfterCooldown,
    /// Run a command for every active consumer (local control API).
    ForActive(Command),
    QueryStatus(oneshot::Sender<Vec<ConsumerStatus>>),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatus {
    pub consumer_id: ConsumerId,
    pub site: String,
    pub active: bool,
    pub auto_mode: bool,
    pub status: StatusReport,
}

#[derive(Debug, Clone, Copy)]
enum CycleKind {
    Process,
    Preload(usize),
}

struct Consumer {
    outbound: mpsc::UnboundedSender<Broadcast>,
    /// `None` until the consumer introduced itself.
    site: Option<String>,
    host: String,
    doc: Document<RemoteSurface>,
    active: bool,
    auto_mode: bool,
    cycle: Debouncer<()>,
}

impl Consumer {
    fn send(&self, msg: Broadcast) {
        // A closed channel means the socket task is already gone.
        let _ = self.outbound.send(msg);
    }

    fn flush(&mut self) {
        for instruction in self.doc.surface.take_outbox() {
            self.send(Broadcast::Render { instruction });
        }
    }
}

/// Single owner of every document, the preload cache and the cooldown gate.
pub struct MediatorCore {
    config: Config,
    settings: Settings,
    enhancer: Enhancer,
    store: StreamStore,
    consumers: HashMap<ConsumerId, Consumer>,
    /// Consumers whose cycle was turned away by the cooldown gate.
    pending_resume: BTreeSet<ConsumerId>,
    event_tx: mpsc::Sender<MediatorEvent>,
}

impl MediatorCore {
    pub fn new(
        config: Config,
        backend: Arc<dyn EnhanceBackend>,
        supervisor: Arc<dyn Supervisor>,
        store: StreamStore,
        event_tx: mpsc::Sender<MediatorEvent>,
    ) -> Self {
        let lifecycle = Lifecycle::new(config.lifecycle.clone(), backend.clone(), supervisor);
        let enhancer = Enhancer::new(
            config.session.clone(),
            backend,
            lifecycle,
            Cooldown::new(config.cooldown.clone()),
            PreloadCache::from_config(&config.cache),
        );
        Self {
            settings: config.defaults.clone(),
            config,
            enhancer,
            store,
            consumers: HashMap::new(),
            pending_resume: BTreeSet::new(),
            event_tx,
        }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        self.enhancer.lifecycle()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<MediatorEvent>) -> anyhow::Result<()> {
        let tick_tx = self.event_tx.clone();
        let period = self.config.session.auto_tick();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if tick_tx.send(MediatorEvent::AutoTick).await.is_err() {
                    break;
                }
            }
        });

        info!("MediatorCore: event loop running");
        while let Some(event) = event_rx.recv().await {
            if matches!(event, MediatorEvent::Shutdown) {
                break;
            }
            self.handle_event(event).await;
        }

        info!("MediatorCore: shutting down");
        self.consumers.clear();
        self.enhancer.lifecycle().stop("mediator exit").await;
        Ok(())
    }

    pub(crate) async fn handle_event(&mut self, event: MediatorEvent) {
        match event {
            MediatorEvent::ConsumerConnected { id, outbound } => self.add_consumer(id, outbound),
            MediatorEvent::ConsumerGone(id) => {
                if self.consumers.remove(&id).is_some() {
                    info!("MediatorCore: consumer {} gone", id);
                    self.pending_resume.remove(&id);
                    self.refresh_policy("consumer gone");
                }
            }
            MediatorEvent::Command(id, cmd) => self.handle_command(id, cmd).await,
            MediatorEvent::Cycle(id) => {
                if self.is_auto(id) {
                    let count = self.settings.preload_count;
                    self.run_cycle(id, CycleKind::Preload(count), false).await;
                }
            }
            MediatorEvent::AutoTick => {
                if self.enhancer.cooldown().is_cooling_down() {
                    return;
                }
                let count = self.settings.preload_count;
                for id in self.auto_consumers() {
                    self.run_cycle(id, CycleKind::Preload(count), false).await;
                }
            }
            MediatorEvent::ResumeAfterCooldown => {
                self.enhancer.cooldown_mut().resume_fired();
                let mut targets: BTreeSet<ConsumerId> = std::mem::take(&mut self.pending_resume);
                targets.extend(self.auto_consumers());
                info!("MediatorCore: cooldown over, resuming {} consumer(s)", targets.len());
                let count = self.settings.preload_count;
                for id in targets {
                    self.run_cycle(id, CycleKind::Preload(count), false).await;
                }
            }
            MediatorEvent::ForActive(cmd) => {
                let ids: Vec<ConsumerId> = self
                    .consumers
                    .iter()
                    .filter(|(_, c)| c.active)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    self.handle_command(id, cmd.clone()).await;
                }
            }
            MediatorEvent::QueryStatus(reply) => {
                let _ = reply.send(self.statuses());
            }
            MediatorEvent::Shutdown => {}
        }
    }

    async fn handle_command(&mut self, id: ConsumerId, cmd: Command) {
        match cmd {
            Command::Hello { site, auto_mode } => self.greet(id, site, auto_mode),
            Command::Observe {
                viewport,
                items,
                removed,
                intersections,
            } => {
                let Some(consumer) = self.consumers.get_mut(&id) else {
                    return;
                };
                consumer
                    .doc
                    .tracker
                    .observe(viewport, &items, &removed, &intersections);
                if consumer.active && (consumer.auto_mode || self.settings.auto_mode) {
                    consumer.cycle.trigger(());
                }
            }
            Command::ProcessCurrentVisible => {
                self.run_cycle(id, CycleKind::Process, true).await;
            }
            Command::RunWithPreload { count } => {
                self.run_cycle(id, CycleKind::Preload(count), true).await;
            }
            Command::GetStatus => {
                let status = self.status_of(id);
                if let Some(consumer) = self.consumers.get(&id) {
                    consumer.send(Broadcast::Status { status });
                }
            }
            Command::SettingsChanged { settings } => self.apply_settings(settings),
            Command::ClearBackendCache => {
                self.enhancer.cache_mut().clear();
                if let Err(e) = self.enhancer.backend().clear_cache().await {
                    error!("MediatorCore: clearing backend cache failed: {}", e);
                    self.send_to(id, Broadcast::Error {
                        message: format!("Could not clear the backend cache: {}", e),
                    });
                } else {
                    info!("MediatorCore: caches cleared");
                }
            }
            Command::DownloadModels { extra_tier } => {
                let backend = self.enhancer.backend().clone();
                let outbound = self.consumers.get(&id).map(|c| c.outbound.clone());
                tokio::spawn(async move {
                    info!("MediatorCore: model download requested (extra tier: {})", extra_tier);
                    if let Err(e) = backend.download_models(extra_tier).await {
                        error!("MediatorCore: model download failed: {}", e);
                        if let Some(tx) = outbound {
                            let _ = tx.send(Broadcast::Error {
                                message: format!("Model download failed: {}", e),
                            });
                        }
                    }
                });
            }
            Command::StreamFailed {
                item,
                stream_id,
                reason,
            } => {
                self.store.delete(&stream_id);
                let Some(consumer) = self.consumers.get_mut(&id) else {
                    return;
                };
                warn!(
                    "MediatorCore: consumer {} lost stream {} for item {}: {}",
                    id, stream_id, item, reason
                );
                self.enhancer.stream_failed(&mut consumer.doc, item, &reason);
                consumer.flush();
            }
            Command::GetChunk { .. } | Command::ReleaseStream { .. } => {
                debug!("MediatorCore: stream command from {} ignored", id);
            }
        }
    }

    fn add_consumer(&mut self, id: ConsumerId, outbound: mpsc::UnboundedSender<Broadcast>) {
        let tx = self.event_tx.clone();
        let cycle = Debouncer::spawn(self.config.session.cycle_debounce(), move |_: ()| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(MediatorEvent::Cycle(id)).await;
            }
        });
        let consumer = Consumer {
            outbound,
            site: None,
            host: String::new(),
            doc: self.new_document(None),
            active: false,
            auto_mode: false,
            cycle,
        };
        self.consumers.insert(id, consumer);
        info!("MediatorCore: consumer {} connected", id);
    }

    fn new_document(&self, site: Option<&str>) -> Document<RemoteSurface> {
        let mut resolver = LocatorResolver::default();
        if let Some(site) = site {
            resolver.set_base(site);
        }
        Document::new(
            VisibilityTracker::new(self.config.selection.clone(), resolver),
            RemoteSurface::new(self.store.clone(), SurfacePolicy::default()),
        )
    }

    fn greet(&mut self, id: ConsumerId, site: String, auto_mode: bool) {
        let doc = self.new_document(Some(&site));
        let Some(consumer) = self.consumers.get_mut(&id) else {
            return;
        };
        consumer.host = locator_host(&site).unwrap_or_else(|| site.trim().to_ascii_lowercase());
        info!(
            "MediatorCore: consumer {} is on {} (auto: {})",
            id, consumer.host, auto_mode
        );
        consumer.site = Some(site);
        consumer.auto_mode = auto_mode;
        consumer.doc = doc;
        self.refresh_policy("consumer hello");
    }

    fn apply_settings(&mut self, settings: Settings) {
        info!(
            "MediatorCore: settings changed (enabled: {}, auto: {})",
            settings.enabled, settings.auto_mode
        );
        self.settings = settings;
        self.refresh_policy("settings");

        let lifecycle = self.enhancer.lifecycle();
        if lifecycle.health_is_fresh() || lifecycle.last_known_running() == Some(true) {
            let backend = self.enhancer.backend().clone();
            let tuning = self.settings.backend.clone();
            tokio::spawn(async move {
                if let Err(e) = backend.push_config(&tuning).await {
                    warn!("MediatorCore: pushing backend config failed: {}", e);
                }
            });
        }
    }

    /// Re-evaluate every consumer against the site policy and let the
    /// lifecycle manager converge on the new active count.
    fn refresh_policy(&mut self, reason: &str) {
        let mut active = 0;
        for (id, consumer) in self.consumers.iter_mut() {
            let allowed = consumer.site.is_some() && self.settings.allows_site(&consumer.host);
            if allowed != consumer.active {
                info!(
                    "MediatorCore: consumer {} ({}) now {}",
                    id,
                    consumer.host,
                    if allowed { "active" } else { "inactive" }
                );
            }
            consumer.active = allowed;
            if allowed {
                active += 1;
            }
        }
        let lifecycle = self.enhancer.lifecycle();
        lifecycle.set_active_consumers(active);
        lifecycle.reconcile(reason);
    }

    async fn run_cycle(&mut self, id: ConsumerId, kind: CycleKind, explicit: bool) {
        let params = self.settings.transform;
        let Some(consumer) = self.consumers.get_mut(&id) else {
            return;
        };
        if !consumer.active {
            if explicit {
                consumer.send(Broadcast::Error {
                    message: format!("Enhancement is disabled on {}", consumer.host),
                });
            }
            return;
        }

        let result = match kind {
            CycleKind::Process => self.enhancer.process_current(&mut consumer.doc, params).await,
            CycleKind::Preload(count) => {
                self.enhancer
                    .run_with_preload(&mut consumer.doc, count, params)
                    .await
            }
        };
        consumer.flush();

        match result {
            Ok(Some(item)) => debug!("MediatorCore: consumer {} item {} enhanced", id, item),
            Ok(None) => debug!("MediatorCore: consumer {} had nothing to do", id),
            Err(e) if e.is_cooldown() => {
                debug!("MediatorCore: consumer {} deferred: {}", id, e);
                self.pending_resume.insert(id);
            }
            Err(e) if explicit => {
                warn!("MediatorCore: consumer {} request failed: {}", id, e);
                consumer.send(Broadcast::Error {
                    message: e.to_string(),
                });
            }
            Err(e) => debug!("MediatorCore: consumer {} auto cycle failed: {}", id, e),
        }
        self.after_cycle(id);
    }

    /// One notice per cooldown episode, and a single deferred retry.
    fn after_cycle(&mut self, id: ConsumerId) {
        let now = Instant::now();
        let cooldown = self.enhancer.cooldown_mut();
        if cooldown.take_notice_at(now) {
            let secs = cooldown
                .remaining_at(now)
                .map(|d| d.as_secs().max(1))
                .unwrap_or(1);
            self.send_to(id, Broadcast::Notice {
                message: format!("Enhancement paused for {}s to let the backend recover", secs),
            });
        }
        if let Some(delay) = self.enhancer.cooldown_mut().arm_resume_at(now) {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(MediatorEvent::ResumeAfterCooldown).await;
            });
        }
    }

    fn send_to(&self, id: ConsumerId, msg: Broadcast) {
        if let Some(consumer) = self.consumers.get(&id) {
            consumer.send(msg);
        }
    }

    fn is_auto(&self, id: ConsumerId) -> bool {
        self.consumers
            .get(&id)
            .map_or(false, |c| c.active && (c.auto_mode || self.settings.auto_mode))
    }

    fn auto_consumers(&self) -> Vec<ConsumerId> {
        let mut ids: Vec<ConsumerId> = self
            .consumers
            .keys()
            .copied()
            .filter(|id| self.is_auto(*id))
            .collect();
        ids.sort_unstable();
        ids
    }

    fn status_of(&self, id: ConsumerId) -> StatusReport {
        match self.consumers.get(&id) {
            Some(c) => self.enhancer.status(
                &c.doc,
                self.settings.preload_count,
                self.settings.transform,
            ),
            None => StatusReport::default(),
        }
    }

    fn statuses(&self) -> Vec<ConsumerStatus> {
        let mut out: Vec<ConsumerStatus> = self
            .consumers
            .iter()
            .map(|(id, c)| ConsumerStatus {
                consumer_id: *id,
                site: c.host.clone(),
                active: c.active,
                auto_mode: c.auto_mode || self.settings.auto_mode,
                status: self.status_of(*id),
            })
            .collect();
        out.sort_by_key(|s| s.consumer_id);
        out
    }
}
