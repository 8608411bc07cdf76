//! Enhancement session controller.
//!
//! [`Enhancer`] owns everything shared between consumers (backend client,
//! lifecycle, cooldown, preload cache) and drives one [`Document`] at a
//! time through a processing cycle.  Every per-item failure is turned into
//! backoff state here; none of them escapes as anything but a `Result`.

use std::sync::Arc;
use std::time::Duration;

use mu_proto::config::SessionConfig;
use mu_proto::params::{OutputFormat, TransformParams};
use mu_proto::protocol::{ItemId, StatusReport};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{EnhanceBackend, EnhanceRequest, Enhanced};
use crate::cooldown::Cooldown;
use crate::error::{EnhanceError, FailureCategory};
use crate::lifecycle::Lifecycle;
use crate::preload::{CacheKey, PreloadCache};
use crate::render::{self, RenderError, RenderOutcome, Surface};
use crate::visibility::{ItemState, VisibilityTracker};

/// One consumer's view: what it shows and where it draws.
pub struct Document<S> {
    pub tracker: VisibilityTracker,
    pub surface: S,
}

impl<S: Surface> Document<S> {
    pub fn new(tracker: VisibilityTracker, surface: S) -> Self {
        Self { tracker, surface }
    }

    fn mark_done(&mut self, id: ItemId) {
        if let Some(item) = self.tracker.item_mut(id) {
            item.state = ItemState::Done;
            item.last_processed = Some(Instant::now());
            item.displaced = true;
        }
    }
}

pub struct Enhancer {
    cfg: SessionConfig,
    backend: Arc<dyn EnhanceBackend>,
    lifecycle: Arc<Lifecycle>,
    cooldown: Cooldown,
    cache: PreloadCache,
}

impl Enhancer {
    pub fn new(
        cfg: SessionConfig,
        backend: Arc<dyn EnhanceBackend>,
        lifecycle: Arc<Lifecycle>,
        cooldown: Cooldown,
        cache: PreloadCache,
    ) -> Self {
        Self {
            cfg,
            backend,
            lifecycle,
            cooldown,
            cache,
        }
    }

    pub fn backend(&self) -> &Arc<dyn EnhanceBackend> {
        &self.backend
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn cooldown(&self) -> &Cooldown {
        &self.cooldown
    }

    pub fn cooldown_mut(&mut self) -> &mut Cooldown {
        &mut self.cooldown
    }

    pub fn cache(&self) -> &PreloadCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut PreloadCache {
        &mut self.cache
    }

    fn backoff(&self, category: FailureCategory) -> Duration {
        let secs = match category {
            FailureCategory::Transient => self.cfg.backoff_transient_secs,
            FailureCategory::Soft => self.cfg.backoff_soft_secs,
            FailureCategory::Decode => self.cfg.backoff_decode_secs,
            FailureCategory::Integrity => self.cfg.backoff_integrity_secs,
        };
        Duration::from_secs(secs)
    }

    /// Cached result, or one backend request behind the cooldown gate.  A
    /// transient failure restarts the backend and retries once.
    pub async fn fetch(
        &mut self,
        locator: &str,
        params: TransformParams,
    ) -> Result<Enhanced, EnhanceError> {
        let params = params.normalized();
        self.cooldown.check_at(Instant::now())?;

        let key = CacheKey::new(locator, &params);
        if let Some(entry) = self.cache.get(&key) {
            debug!("fetch {}: preload cache hit", key);
            return Ok(Enhanced {
                bytes: entry.bytes.clone(),
                content_type: entry.content_type.clone(),
                model: entry.model.clone(),
            });
        }

        self.lifecycle.ensure_running("enhance").await?;
        let req = EnhanceRequest {
            locator: locator.to_string(),
            params,
        };
        let result = match self.attempt(&req).await {
            Err(EnhanceError::Transient(reason)) => {
                warn!("fetch {}: {}; restarting backend", key, reason);
                match self.lifecycle.restart("transient error").await {
                    Ok(()) => self.attempt(&req).await,
                    Err(e) => Err(e.into()),
                }
            }
            other => other,
        };

        let enhanced = result?;
        self.cooldown.on_success_at(Instant::now());
        self.cache.put(
            key,
            enhanced.bytes.clone(),
            &enhanced.content_type,
            &enhanced.model,
        );
        Ok(enhanced)
    }

    async fn attempt(&mut self, req: &EnhanceRequest) -> Result<Enhanced, EnhanceError> {
        self.cooldown
            .on_attempt_at(Instant::now(), req.params.is_heavy());
        self.backend.enhance(req).await
    }

    /// Enhance the item the reader is looking at.  Returns the item that
    /// changed, if any.
    pub async fn process_current<S: Surface>(
        &mut self,
        doc: &mut Document<S>,
        params: TransformParams,
    ) -> Result<Option<ItemId>, EnhanceError> {
        let Some(id) = doc.tracker.current_item() else {
            return Ok(None);
        };
        let Some(item) = doc.tracker.item_mut(id) else {
            return Ok(None);
        };
        if item.state.blocks_request(Instant::now()) {
            debug!("item {}: {:?}, skipping", id, item.state);
            return Ok(None);
        }
        let Some(locator) = item.locator.clone() else {
            return Ok(None);
        };
        item.state = ItemState::Processing;

        let affordance = self.cfg.processing_affordance();
        let wait = self.cfg.display_wait();
        let fetched = {
            let fetch = self.fetch(&locator, params);
            let slow = tokio::time::sleep(affordance);
            let deadline = tokio::time::sleep(wait);
            tokio::pin!(fetch, slow, deadline);
            let mut shown = false;
            loop {
                tokio::select! {
                    r = &mut fetch => break r,
                    _ = &mut slow, if !shown => {
                        shown = true;
                        doc.surface.show_processing(id);
                    }
                    _ = &mut deadline => {
                        break Err(EnhanceError::Transient(format!(
                            "no result within {}s",
                            wait.as_secs()
                        )));
                    }
                }
            }
        };

        let rendered = match fetched {
            Ok(enhanced) => self.render(doc, id, &locator, &enhanced, params).await,
            Err(e) => Err(e),
        };
        match rendered {
            Ok(how) => {
                debug!("item {}: enhanced ({:?})", id, how);
                doc.mark_done(id);
                Ok(Some(id))
            }
            Err(e) => {
                self.fail_item(doc, id, &e);
                Err(e)
            }
        }
    }

    async fn render<S: Surface>(
        &mut self,
        doc: &mut Document<S>,
        id: ItemId,
        locator: &str,
        enhanced: &Enhanced,
        params: TransformParams,
    ) -> Result<RenderOutcome, EnhanceError> {
        let this = &mut *self;
        let refetch = move |format: OutputFormat| async move {
            match this.fetch(locator, params.with_format(format)).await {
                Ok(alternate) => Some(alternate),
                Err(e) => {
                    debug!("item {}: alternate format failed: {}", id, e);
                    None
                }
            }
        };
        let outcome =
            render::apply_result(&mut doc.surface, id, enhanced, params.format, refetch).await;
        if matches!(outcome, Ok(RenderOutcome::OverlayAlternate) | Err(RenderError::Decode(_))) {
            // Undecodable bytes must not be served from the cache again.
            self.cache
                .invalidate(&CacheKey::new(locator, &params.normalized()));
        }
        outcome.map_err(|e| match e {
            RenderError::Decode(msg) => EnhanceError::Decode(msg),
            RenderError::Rejected(msg) => EnhanceError::Render(msg),
        })
    }

    /// A consumer could not read back the result for `id`.  The request
    /// is not retried; the item backs off like any other failure.
    pub fn stream_failed<S: Surface>(
        &mut self,
        doc: &mut Document<S>,
        id: ItemId,
        reason: &str,
    ) {
        if doc.tracker.item(id).is_none() {
            debug!("stream failure for unknown item {}", id);
            return;
        }
        self.fail_item(doc, id, &EnhanceError::Integrity(reason.to_string()));
    }

    /// Restore the item, start its backoff window and count the failure.
    fn fail_item<S: Surface>(&mut self, doc: &mut Document<S>, id: ItemId, err: &EnhanceError) {
        let now = Instant::now();
        doc.surface.restore(id);
        doc.surface.clear_overlays(id);
        let category = err.category();
        if let Some(item) = doc.tracker.item_mut(id) {
            item.displaced = false;
            item.state = match category {
                Some(cat) => ItemState::FailedUntil(now + self.backoff(cat)),
                None => ItemState::Idle,
            };
        }
        match category {
            Some(_) => {
                debug!("item {}: {}", id, err);
                self.cooldown.on_failure_at(now);
            }
            None => debug!("item {}: deferred, {}", id, err),
        }
    }

    /// Fill the preload cache for `ids` without touching the display.
    /// Returns how many results were fetched.
    pub async fn preload_candidates<S: Surface>(
        &mut self,
        doc: &mut Document<S>,
        ids: &[ItemId],
        params: TransformParams,
    ) -> usize {
        let mut fetched = 0;
        for (n, &id) in ids.iter().enumerate() {
            if self.cooldown.is_cooling_down_at(Instant::now()) {
                debug!("preload: cooling down, dropping {} candidates", ids.len() - n);
                break;
            }
            let Some(item) = doc.tracker.item(id) else {
                continue;
            };
            if item.state.blocks_request(Instant::now()) {
                continue;
            }
            let Some(locator) = item.locator.clone() else {
                continue;
            };
            if self.cache.contains(&CacheKey::new(&locator, &params.normalized())) {
                continue;
            }
            match self.fetch(&locator, params).await {
                Ok(_) => fetched += 1,
                Err(e) if e.is_cooldown() => break,
                Err(e) => {
                    debug!("preload item {}: {}", id, e);
                    let now = Instant::now();
                    if let (Some(cat), Some(item)) = (e.category(), doc.tracker.item_mut(id)) {
                        item.state = ItemState::FailedUntil(now + self.backoff(cat));
                    }
                    if self.cooldown.on_failure_at(now) {
                        break;
                    }
                }
            }
        }
        fetched
    }

    /// Swap in a cached result when one exists and the item is close (or
    /// `force`).  Always warms the original and hints eager loading.
    pub async fn apply_ready_preloaded<S: Surface>(
        &mut self,
        doc: &mut Document<S>,
        id: ItemId,
        params: TransformParams,
        force: bool,
    ) -> bool {
        let Some(item) = doc.tracker.item(id) else {
            return false;
        };
        let Some(locator) = item.locator.clone() else {
            return false;
        };
        let eligible = !item.state.blocks_request(Instant::now())
            && (force || doc.tracker.is_near_viewport(id));

        let mut swapped = false;
        if eligible {
            let key = CacheKey::new(&locator, &params.normalized());
            let cached = self.cache.get(&key).map(|e| Enhanced {
                bytes: e.bytes.clone(),
                content_type: e.content_type.clone(),
                model: e.model.clone(),
            });
            if let Some(enhanced) = cached {
                match self.render(doc, id, &locator, &enhanced, params).await {
                    Ok(how) => {
                        debug!("item {}: preloaded result applied ({:?})", id, how);
                        doc.mark_done(id);
                        swapped = true;
                    }
                    Err(e) => self.fail_item(doc, id, &e),
                }
            }
        }

        if let Some(item) = doc.tracker.item_mut(id) {
            if !item.prefetched && !locator.starts_with("data:") {
                item.prefetched = true;
                doc.surface.prefetch_original(id, &locator);
            }
        }
        doc.surface.hint_eager_load(id);
        swapped
    }

    /// Process the current item, then preload and apply up to `count`
    /// upcoming ones.
    pub async fn run_with_preload<S: Surface>(
        &mut self,
        doc: &mut Document<S>,
        count: usize,
        params: TransformParams,
    ) -> Result<Option<ItemId>, EnhanceError> {
        let result = self.process_current(doc, params).await;
        let Some(current) = doc.tracker.current_item() else {
            return result;
        };
        let candidates = doc.tracker.next_candidates(current, count, Instant::now());
        if !candidates.is_empty() {
            let fetched = self.preload_candidates(doc, &candidates, params).await;
            info!(
                "preload: {} fetched for {} candidates after item {}",
                fetched,
                candidates.len(),
                current
            );
            for id in candidates {
                self.apply_ready_preloaded(doc, id, params, false).await;
            }
        }
        result
    }

    pub fn status<S: Surface>(
        &self,
        doc: &Document<S>,
        count: usize,
        params: TransformParams,
    ) -> StatusReport {
        let Some(current) = doc.tracker.current_item() else {
            return StatusReport::default();
        };
        let params = params.normalized();
        let mut report = StatusReport::default();
        for id in doc.tracker.neighbourhood(current, count) {
            let Some(item) = doc.tracker.item(id) else {
                continue;
            };
            report.target += 1;
            if item.state == ItemState::Done {
                report.enhanced += 1;
            }
            if let Some(locator) = &item.locator {
                if self.cache.contains(&CacheKey::new(locator, &params)) {
                    report.cached += 1;
                }
            }
            if item.prefetched {
                report.prefetched += 1;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::{Probe, RecordingSupervisor};
    use crate::locator::LocatorResolver;
    use crate::render::{RemoteSurface, SurfacePolicy};
    use crate::stream_store::StreamStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use mu_proto::config::{CooldownConfig, LifecycleConfig, SelectionConfig};
    use mu_proto::native::SupervisorCommand;
    use mu_proto::params::{BackendTuning, OutputFormat};
    use mu_proto::protocol::{ItemSnapshot, Rect, RenderInstruction, Viewport};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn png() -> Enhanced {
        Enhanced {
            bytes: Bytes::from_static(PNG),
            content_type: "image/png".into(),
            model: "test-model".into(),
        }
    }

    /// Serves scripted outcomes, then PNG bytes forever.
    struct ScriptedBackend {
        probe: Arc<Probe>,
        script: Mutex<VecDeque<Result<Enhanced, EnhanceError>>>,
        delay: Duration,
        requests: Mutex<Vec<EnhanceRequest>>,
    }

    impl ScriptedBackend {
        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EnhanceBackend for ScriptedBackend {
        async fn enhance(&self, req: &EnhanceRequest) -> Result<Enhanced, EnhanceError> {
            self.requests.lock().unwrap().push(req.clone());
            tokio::time::sleep(self.delay).await;
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(png()))
        }
        async fn health(&self) -> bool {
            self.probe.healthy.load(Ordering::SeqCst)
        }
        async fn shutdown(&self) -> anyhow::Result<()> {
            self.probe.healthy.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn push_config(&self, _: &BackendTuning) -> anyhow::Result<()> {
            Ok(())
        }
        async fn clear_cache(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn download_models(&self, _: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Rig {
        enhancer: Enhancer,
        backend: Arc<ScriptedBackend>,
        supervisor: Arc<RecordingSupervisor>,
        doc: Document<RemoteSurface>,
    }

    fn rig(
        script: Vec<Result<Enhanced, EnhanceError>>,
        delay: Duration,
        policy: SurfacePolicy,
    ) -> Rig {
        let probe = Arc::new(Probe::default());
        let supervisor = Arc::new(RecordingSupervisor::new(probe.clone(), false));
        let backend = Arc::new(ScriptedBackend {
            probe: probe.clone(),
            script: Mutex::new(script.into()),
            delay,
            requests: Mutex::new(Vec::new()),
        });
        let lifecycle = Lifecycle::new(
            LifecycleConfig::default(),
            backend.clone(),
            supervisor.clone(),
        );
        let enhancer = Enhancer::new(
            SessionConfig::default(),
            backend.clone(),
            lifecycle,
            Cooldown::new(CooldownConfig::default()),
            PreloadCache::new(24, usize::MAX, Duration::from_secs(600)),
        );

        // Ten 800x1200 pages; the viewport shows the top of page 0.
        let mut tracker = VisibilityTracker::new(SelectionConfig::default(), LocatorResolver::default());
        let snaps: Vec<ItemSnapshot> = (0..10u64)
            .map(|i| {
                let mut attrs = BTreeMap::new();
                attrs.insert("src".into(), format!("https://cdn.example.com/{}.jpg", i));
                ItemSnapshot {
                    id: i,
                    order: i as u32,
                    rect: Rect {
                        x: 100.0,
                        y: i as f64 * 1200.0,
                        width: 800.0,
                        height: 1200.0,
                    },
                    attrs,
                    connected: true,
                }
            })
            .collect();
        tracker.observe(Viewport::default(), &snaps, &[], &[]);
        let surface = RemoteSurface::new(StreamStore::new(1024, Duration::from_secs(60)), policy);

        Rig {
            enhancer,
            backend,
            supervisor,
            doc: Document::new(tracker, surface),
        }
    }

    fn ops(doc: &mut Document<RemoteSurface>) -> Vec<&'static str> {
        doc.surface
            .take_outbox()
            .iter()
            .map(|i| match i {
                RenderInstruction::Swap { .. } => "swap",
                RenderInstruction::Overlay { .. } => "overlay",
                RenderInstruction::Restore { .. } => "restore",
                RenderInstruction::ShowProcessing { .. } => "processing",
                RenderInstruction::ClearOverlays { .. } => "clear",
                RenderInstruction::PrefetchOriginal { .. } => "prefetch",
                RenderInstruction::EagerLoad { .. } => "eager",
            })
            .collect()
    }

    fn params() -> TransformParams {
        TransformParams::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_success_swaps_without_affordance() {
        let mut r = rig(vec![], Duration::from_millis(100), SurfacePolicy::default());
        let done = r.enhancer.process_current(&mut r.doc, params()).await.unwrap();
        assert_eq!(done, Some(0));
        assert_eq!(ops(&mut r.doc), vec!["swap"]);
        assert_eq!(r.doc.tracker.item(0).unwrap().state, ItemState::Done);

        // Done items are never requested again.
        assert_eq!(r.enhancer.process_current(&mut r.doc, params()).await.unwrap(), None);
        assert_eq!(r.backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_request_shows_processing() {
        let mut r = rig(vec![], Duration::from_millis(1500), SurfacePolicy::default());
        r.enhancer.process_current(&mut r.doc, params()).await.unwrap();
        assert_eq!(ops(&mut r.doc), vec!["processing", "swap"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_error_restores_and_backs_off() {
        let mut r = rig(
            vec![Err(EnhanceError::HostError("model crashed".into()))],
            Duration::from_millis(10),
            SurfacePolicy::default(),
        );
        let started = Instant::now();
        let err = r.enhancer.process_current(&mut r.doc, params()).await.unwrap_err();
        assert!(matches!(err, EnhanceError::HostError(_)));
        assert_eq!(ops(&mut r.doc), vec!["clear"]);
        match r.doc.tracker.item(0).unwrap().state {
            ItemState::FailedUntil(t) => assert!(t >= started + Duration::from_secs(20)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r.enhancer.cooldown().consecutive_failures(), 1);

        // Backing off: no new request.
        assert_eq!(r.enhancer.process_current(&mut r.doc, params()).await.unwrap(), None);
        assert_eq!(r.backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_backoff_is_longer_than_transient() {
        let r = rig(vec![], Duration::ZERO, SurfacePolicy::default());
        assert!(
            r.enhancer.backoff(FailureCategory::Decode)
                > r.enhancer.backoff(FailureCategory::Transient)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_restarts_and_retries_once() {
        let mut r = rig(
            vec![Err(EnhanceError::Transient("connection reset".into()))],
            Duration::from_millis(10),
            SurfacePolicy::default(),
        );
        let done = r.enhancer.process_current(&mut r.doc, params()).await.unwrap();
        assert_eq!(done, Some(0));
        assert_eq!(r.backend.calls(), 2);
        assert_eq!(r.supervisor.count(SupervisorCommand::Stop), 1);
        assert_eq!(r.supervisor.count(SupervisorCommand::Start), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_wait_bounds_a_stalled_request() {
        let mut r = rig(vec![], Duration::from_secs(60), SurfacePolicy::default());
        let started = Instant::now();
        let err = r.enhancer.process_current(&mut r.doc, params()).await.unwrap_err();
        assert!(matches!(err, EnhanceError::Transient(_)));
        assert!(Instant::now() - started < Duration::from_secs(19));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_uses_alternate_format() {
        let garbage = Enhanced {
            bytes: Bytes::from_static(b"not an image"),
            content_type: "image/webp".into(),
            model: "m".into(),
        };
        let policy = SurfacePolicy {
            allow_reference: false,
            embedded_max_bytes: 0,
        };
        let mut r = rig(vec![Ok(garbage)], Duration::from_millis(10), policy);
        let p = params().with_format(OutputFormat::Webp);
        assert_eq!(r.enhancer.process_current(&mut r.doc, p).await.unwrap(), Some(0));
        assert_eq!(ops(&mut r.doc), vec!["overlay"]);
        let formats: Vec<OutputFormat> = r
            .backend
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|req| req.params.format)
            .collect();
        assert_eq!(formats, vec![OutputFormat::Webp, OutputFormat::Png]);
        // Only the decodable alternate stays cached.
        assert_eq!(r.enhancer.cache().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preload_fills_cache_without_display_change() {
        let mut r = rig(vec![], Duration::from_millis(10), SurfacePolicy::default());
        let fetched = r.enhancer.preload_candidates(&mut r.doc, &[1, 2, 3], params()).await;
        assert_eq!(fetched, 3);
        assert!(ops(&mut r.doc).is_empty());
        assert_eq!(r.enhancer.cache().len(), 3);

        // Already cached: nothing to fetch.
        assert_eq!(r.enhancer.preload_candidates(&mut r.doc, &[1, 2], params()).await, 0);
        assert_eq!(r.backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preload_aborts_when_cooldown_engages() {
        let script = (0..10)
            .map(|_| Err(EnhanceError::HostError("busy".into())))
            .collect();
        let mut r = rig(script, Duration::from_millis(10), SurfacePolicy::default());
        let ids: Vec<ItemId> = (0..10).collect();
        let fetched = r.enhancer.preload_candidates(&mut r.doc, &ids, params()).await;
        assert_eq!(fetched, 0);
        // The fifth failure engages the cooldown; the rest never reach the backend.
        assert_eq!(r.backend.calls(), 5);
        assert!(r.enhancer.cooldown().is_cooling_down());

        let err = r.enhancer.process_current(&mut r.doc, params()).await;
        assert!(matches!(err, Ok(None) | Err(EnhanceError::CoolingDown { .. })));
        assert_eq!(r.backend.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_rejection_leaves_item_idle() {
        let mut r = rig(vec![], Duration::from_millis(10), SurfacePolicy::default());
        for _ in 0..5 {
            r.enhancer.cooldown_mut().on_failure_at(Instant::now());
        }
        let err = r.enhancer.process_current(&mut r.doc, params()).await.unwrap_err();
        assert!(err.is_cooldown());
        assert_eq!(r.doc.tracker.item(0).unwrap().state, ItemState::Idle);
        assert_eq!(r.backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_ready_preloaded_always_warms_original() {
        let mut r = rig(vec![], Duration::from_millis(10), SurfacePolicy::default());
        r.enhancer.preload_candidates(&mut r.doc, &[1, 5], params()).await;

        // Page 1 is near the viewport; page 5 is far away.
        assert!(r.enhancer.apply_ready_preloaded(&mut r.doc, 1, params(), false).await);
        assert_eq!(ops(&mut r.doc), vec!["swap", "prefetch", "eager"]);
        assert!(!r.enhancer.apply_ready_preloaded(&mut r.doc, 5, params(), false).await);
        assert_eq!(ops(&mut r.doc), vec!["prefetch", "eager"]);
        assert!(r.enhancer.apply_ready_preloaded(&mut r.doc, 5, params(), true).await);
        assert_eq!(ops(&mut r.doc), vec!["swap", "eager"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_preload_and_status() {
        let mut r = rig(vec![], Duration::from_millis(10), SurfacePolicy::default());
        let done = r.enhancer.run_with_preload(&mut r.doc, 3, params()).await.unwrap();
        assert_eq!(done, Some(0));
        assert_eq!(r.backend.calls(), 4);

        let status = r.enhancer.status(&r.doc, 3, params());
        assert_eq!(status.target, 4);
        assert_eq!(status.cached, 4);
        assert_eq!(status.prefetched, 3);
        // Page 0 plus the candidates within 1.5 viewports (pages 1 and 2).
        assert_eq!(status.enhanced, 3);
    }
}
