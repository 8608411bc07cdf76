//! Visibility tracking and candidate selection for one document.
//!
//! Consumers push batched observations (item geometry + attributes) and
//! intersection changes.  The tracker keeps the per-item session state and
//! answers two questions: which item is the reader looking at, and which
//! items come next.

use std::collections::HashMap;

use mu_proto::config::SelectionConfig;
use mu_proto::protocol::{IntersectionChange, ItemId, ItemSnapshot, Rect, Viewport};
use tokio::time::Instant;
use tracing::debug;

use crate::locator::{locator_host, LocatorResolver};

/// Per-item session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemState {
    #[default]
    Idle,
    Processing,
    Done,
    /// Backing off after a failure; no new request before the deadline.
    FailedUntil(Instant),
}

impl ItemState {
    /// True when the item must not be (re)requested at `now`.
    pub fn blocks_request(&self, now: Instant) -> bool {
        match self {
            ItemState::Idle => false,
            ItemState::Processing | ItemState::Done => true,
            ItemState::FailedUntil(t) => now < *t,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContentItem {
    pub id: ItemId,
    pub order: u32,
    pub rect: Rect,
    pub locator: Option<String>,
    pub state: ItemState,
    pub last_processed: Option<Instant>,
    /// The display currently shows something other than the original.
    pub displaced: bool,
    /// The unmodified original was prefetched.
    pub prefetched: bool,
}

impl ContentItem {
    fn new(snapshot: &ItemSnapshot, locator: Option<String>) -> Self {
        Self {
            id: snapshot.id,
            order: snapshot.order,
            rect: snapshot.rect,
            locator,
            state: ItemState::Idle,
            last_processed: None,
            displaced: false,
            prefetched: false,
        }
    }
}

pub struct VisibilityTracker {
    cfg: SelectionConfig,
    resolver: LocatorResolver,
    viewport: Viewport,
    items: HashMap<ItemId, ContentItem>,
    /// Intersection areas from the latest notifications; only items with a
    /// usable locator and a positive area are kept.
    scores: HashMap<ItemId, f64>,
}

impl VisibilityTracker {
    pub fn new(cfg: SelectionConfig, resolver: LocatorResolver) -> Self {
        Self {
            cfg,
            resolver,
            viewport: Viewport::default(),
            items: HashMap::new(),
            scores: HashMap::new(),
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn item(&self, id: ItemId) -> Option<&ContentItem> {
        self.items.get(&id)
    }

    pub fn item_mut(&mut self, id: ItemId) -> Option<&mut ContentItem> {
        self.items.get_mut(&id)
    }

    pub fn items(&self) -> impl Iterator<Item = &ContentItem> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn score(&self, id: ItemId) -> f64 {
        self.scores.get(&id).copied().unwrap_or(0.0)
    }

    /// Apply one batch of observations.
    pub fn observe(
        &mut self,
        viewport: Viewport,
        snapshots: &[ItemSnapshot],
        removed: &[ItemId],
        intersections: &[IntersectionChange],
    ) {
        self.viewport = viewport;

        for snap in snapshots {
            if !snap.connected {
                self.forget(snap.id);
                continue;
            }
            let locator = self.resolver.resolve(&snap.attrs);
            match self.items.get_mut(&snap.id) {
                Some(item) => {
                    item.order = snap.order;
                    item.rect = snap.rect;
                    // A swapped element reports our payload, not its source.
                    if item.displaced || locator == item.locator {
                        continue;
                    }
                    if locator.is_none() {
                        debug!("item {}: source gone, dropping from scoring", snap.id);
                        self.scores.remove(&snap.id);
                    } else {
                        debug!("item {}: locator changed, resetting", snap.id);
                    }
                    item.locator = locator;
                    item.state = ItemState::Idle;
                    item.prefetched = false;
                }
                None => {
                    self.items.insert(snap.id, ContentItem::new(snap, locator));
                }
            }
        }

        for id in removed {
            self.forget(*id);
        }

        for change in intersections {
            let usable = self
                .items
                .get(&change.id)
                .map_or(false, |i| i.locator.is_some());
            if usable && change.area > 0.0 {
                self.scores.insert(change.id, change.area);
            } else {
                self.scores.remove(&change.id);
            }
        }
    }

    fn forget(&mut self, id: ItemId) {
        self.items.remove(&id);
        self.scores.remove(&id);
    }

    /// `1 / (1 + dx + 1.4·dy)` with dx, dy the normalised distance of the
    /// item's centre from the viewport centre.
    pub fn center_boost(&self, rect: &Rect) -> f64 {
        let (cx, cy) = rect.center();
        let (vx, vy) = self.viewport.center();
        let dx = (cx - vx).abs() / self.viewport.width.max(1.0);
        let dy = (cy - vy).abs() / self.viewport.height.max(1.0);
        1.0 / (1.0 + dx + 1.4 * dy)
    }

    fn site_boost(&self, item: &ContentItem) -> f64 {
        item.locator
            .as_deref()
            .and_then(locator_host)
            .and_then(|host| self.cfg.site_boost.get(&host).copied())
            .unwrap_or(1.0)
    }

    /// The item the reader is looking at.
    pub fn current_item(&self) -> Option<ItemId> {
        if self.scores.is_empty() {
            return self.full_scan();
        }
        self.scores
            .iter()
            .filter_map(|(id, score)| {
                let item = self.items.get(id)?;
                let effective = score * self.center_boost(&item.rect) * self.site_boost(item);
                Some((*id, effective, item.order))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.2.cmp(&a.2)))
            .map(|(id, _, _)| id)
    }

    /// Raw visible area only; used before any notification arrived.
    fn full_scan(&self) -> Option<ItemId> {
        let view = self.viewport.rect();
        self.items
            .values()
            .filter(|i| i.locator.is_some())
            .map(|i| (i.id, i.rect.intersection_area(&view), i.order))
            .filter(|(_, area, _)| *area > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.2.cmp(&a.2)))
            .map(|(id, _, _)| id)
    }

    /// Up to `n` items to enhance ahead of the reader, in document order.
    pub fn next_candidates(&self, current: ItemId, n: usize, now: Instant) -> Vec<ItemId> {
        self.select(current, n, |item| !item.state.blocks_request(now))
    }

    /// The current item followed by the items around it, whatever their
    /// processing state.
    pub fn neighbourhood(&self, current: ItemId, n: usize) -> Vec<ItemId> {
        if !self.items.contains_key(&current) {
            return Vec::new();
        }
        let mut out = vec![current];
        out.extend(self.select(current, n, |_| true));
        out
    }

    fn select<F>(&self, current: ItemId, n: usize, wanted: F) -> Vec<ItemId>
    where
        F: Fn(&ContentItem) -> bool,
    {
        let Some(cur) = self.items.get(&current) else {
            return Vec::new();
        };
        if n == 0 {
            return Vec::new();
        }
        let vh = self.viewport.height.max(1.0);
        let window_top = self.viewport.scroll_y - 0.5 * vh;
        let window_bottom = self.viewport.scroll_y + vh + self.cfg.lookahead_viewports * vh;
        let min_area = self.cfg.min_area.max(self.cfg.size_ratio * cur.rect.area());

        let eligible =
            |item: &&ContentItem| item.id != current && item.locator.is_some() && wanted(item);

        let mut picked: Vec<&ContentItem> = self
            .items
            .values()
            .filter(eligible)
            .filter(|i| i.order > cur.order)
            .filter(|i| i.rect.bottom() > window_top && i.rect.y < window_bottom)
            .filter(|i| i.rect.area() >= min_area)
            .collect();
        picked.sort_by_key(|i| i.order);
        picked.truncate(n);

        let mut out: Vec<ItemId> = picked.iter().map(|i| i.id).collect();
        if out.len() < n {
            let (_, cur_y) = cur.rect.center();
            let mut rest: Vec<&ContentItem> = self
                .items
                .values()
                .filter(eligible)
                .filter(|i| !out.contains(&i.id))
                .filter(|i| i.rect.area() >= self.cfg.min_area)
                .collect();
            rest.sort_by(|a, b| {
                let da = (a.rect.center().1 - cur_y).abs();
                let db = (b.rect.center().1 - cur_y).abs();
                let below_a = a.order > cur.order;
                let below_b = b.order > cur.order;
                da.total_cmp(&db)
                    .then(below_b.cmp(&below_a))
                    .then(a.order.cmp(&b.order))
            });
            out.extend(rest.iter().take(n - out.len()).map(|i| i.id));
        }
        out
    }

    /// Distance from the viewport in viewport heights; zero when visible.
    pub fn viewport_distance(&self, id: ItemId) -> Option<f64> {
        let item = self.items.get(&id)?;
        let top = self.viewport.scroll_y;
        let bottom = top + self.viewport.height;
        let gap = if item.rect.bottom() < top {
            top - item.rect.bottom()
        } else if item.rect.y > bottom {
            item.rect.y - bottom
        } else {
            0.0
        };
        Some(gap / self.viewport.height.max(1.0))
    }

    pub fn is_near_viewport(&self, id: ItemId) -> bool {
        self.viewport_distance(id)
            .map_or(false, |d| d <= self.cfg.near_viewports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn snap(id: ItemId, order: u32, rect: Rect) -> ItemSnapshot {
        let mut attrs = BTreeMap::new();
        attrs.insert("src".to_string(), format!("https://cdn.example.com/{}.jpg", id));
        ItemSnapshot {
            id,
            order,
            rect,
            attrs,
            connected: true,
        }
    }

    fn rect(x: f64, y: f64, w: f64, h: f64) -> Rect {
        Rect {
            x,
            y,
            width: w,
            height: h,
        }
    }

    fn tracker() -> VisibilityTracker {
        VisibilityTracker::new(SelectionConfig::default(), LocatorResolver::default())
    }

    /// A long strip of 800x1200 pages stacked vertically.
    fn strip(t: &mut VisibilityTracker, pages: u32, scroll_y: f64) {
        let snaps: Vec<ItemSnapshot> = (0..pages)
            .map(|i| snap(i as ItemId, i, rect(100.0, i as f64 * 1200.0, 800.0, 1200.0)))
            .collect();
        let viewport = Viewport {
            scroll_x: 0.0,
            scroll_y,
            width: 1000.0,
            height: 1000.0,
        };
        t.observe(viewport, &snaps, &[], &[]);
    }

    #[test]
    fn test_centered_item_beats_larger_offset_item() {
        let mut t = tracker();
        let a = snap(1, 0, rect(400.0, 400.0, 200.0, 200.0));
        let b = snap(2, 1, rect(775.0, 800.0, 250.0, 200.0));
        t.observe(
            Viewport::default(),
            &[a, b],
            &[],
            &[
                IntersectionChange { id: 1, area: 40000.0 },
                IntersectionChange { id: 2, area: 50000.0 },
            ],
        );
        let boost_a = t.center_boost(&t.item(1).unwrap().rect);
        let boost_b = t.center_boost(&t.item(2).unwrap().rect);
        assert!((40000.0 * boost_a - 40000.0).abs() < 1e-6);
        assert!((50000.0 * boost_b - 25510.2).abs() < 1.0);
        assert_eq!(t.current_item(), Some(1));
    }

    #[test]
    fn test_full_scan_when_no_scores() {
        let mut t = tracker();
        strip(&mut t, 5, 1500.0);
        // Viewport 1500..2500 overlaps page 1 (1200..2400) the most.
        assert_eq!(t.current_item(), Some(1));
    }

    #[test]
    fn test_items_without_locator_are_not_scored() {
        let mut t = tracker();
        let mut bare = snap(1, 0, rect(0.0, 0.0, 500.0, 500.0));
        bare.attrs.clear();
        t.observe(
            Viewport::default(),
            &[bare],
            &[],
            &[IntersectionChange { id: 1, area: 250000.0 }],
        );
        assert_eq!(t.score(1), 0.0);
        assert_eq!(t.current_item(), None);
    }

    #[test]
    fn test_disconnect_and_zero_area_drop_scores() {
        let mut t = tracker();
        strip(&mut t, 3, 0.0);
        t.observe(
            Viewport::default(),
            &[],
            &[],
            &[
                IntersectionChange { id: 0, area: 800.0 * 1000.0 },
                IntersectionChange { id: 1, area: 10.0 },
            ],
        );
        assert_eq!(t.current_item(), Some(0));
        let mut gone = snap(0, 0, rect(100.0, 0.0, 800.0, 1200.0));
        gone.connected = false;
        t.observe(Viewport::default(), &[gone], &[], &[IntersectionChange { id: 1, area: 0.0 }]);
        assert!(t.item(0).is_none());
        assert_eq!(t.score(1), 0.0);
    }

    #[test]
    fn test_next_candidates_in_document_order() {
        let mut t = tracker();
        strip(&mut t, 10, 0.0);
        let now = Instant::now();
        // Window reaches 4 viewports down (4000px): pages 1..=3 start above it.
        let next = t.next_candidates(0, 5, now);
        assert_eq!(&next[..3], &[1, 2, 3]);
        assert_eq!(next.len(), 5);
        assert!(!next.contains(&0));
        let mut dedup = next.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), next.len());
    }

    #[test]
    fn test_next_candidates_skip_processed_and_small() {
        let mut t = tracker();
        strip(&mut t, 4, 0.0);
        t.observe(
            Viewport::default(),
            &[snap(9, 2, rect(0.0, 2400.0, 50.0, 50.0))],
            &[],
            &[],
        );
        t.item_mut(1).unwrap().state = ItemState::Done;
        let now = Instant::now();
        let next = t.next_candidates(0, 2, now);
        assert_eq!(next, vec![2, 3]);
    }

    #[test]
    fn test_padding_prefers_nearest_then_below() {
        let mut t = tracker();
        strip(&mut t, 5, 2400.0);
        let now = Instant::now();
        for id in [3, 4] {
            t.item_mut(id).unwrap().state = ItemState::Done;
        }
        // Nothing qualifies below page 2; pad with pages above it, nearest first.
        let next = t.next_candidates(2, 2, now);
        assert_eq!(next, vec![1, 0]);
    }

    #[test]
    fn test_padding_tie_goes_below() {
        let mut t = tracker();
        let snaps = vec![
            snap(1, 0, rect(0.0, 0.0, 800.0, 1000.0)),
            snap(2, 1, rect(0.0, 1000.0, 800.0, 1000.0)),
            snap(3, 2, rect(0.0, 2000.0, 800.0, 1000.0)),
        ];
        // Viewport far away so the lookahead window excludes everything.
        let viewport = Viewport {
            scroll_x: 0.0,
            scroll_y: 50000.0,
            width: 1000.0,
            height: 1000.0,
        };
        t.observe(viewport, &snaps, &[], &[]);
        let next = t.next_candidates(2, 1, Instant::now());
        assert_eq!(next, vec![3]);
    }

    #[test]
    fn test_failed_items_are_skipped_until_deadline() {
        let mut t = tracker();
        strip(&mut t, 3, 0.0);
        let now = Instant::now();
        t.item_mut(1).unwrap().state = ItemState::FailedUntil(now + Duration::from_secs(10));
        assert_eq!(t.next_candidates(0, 1, now), vec![2]);
        assert_eq!(t.next_candidates(0, 1, now + Duration::from_secs(11)), vec![1]);
    }

    #[test]
    fn test_neighbourhood_keeps_processed_items() {
        let mut t = tracker();
        strip(&mut t, 5, 0.0);
        t.item_mut(1).unwrap().state = ItemState::Done;
        assert_eq!(t.neighbourhood(0, 2), vec![0, 1, 2]);
        assert!(t.neighbourhood(42, 2).is_empty());
    }

    #[test]
    fn test_never_exceeds_n() {
        let mut t = tracker();
        strip(&mut t, 30, 0.0);
        for n in 0..8 {
            assert!(t.next_candidates(0, n, Instant::now()).len() <= n);
        }
        assert!(t.next_candidates(999, 3, Instant::now()).is_empty());
    }

    #[test]
    fn test_viewport_distance() {
        let mut t = tracker();
        strip(&mut t, 6, 0.0);
        assert_eq!(t.viewport_distance(0), Some(0.0));
        // Page 2 starts at 2400, viewport ends at 1000.
        assert_eq!(t.viewport_distance(2), Some(1.4));
        assert!(t.is_near_viewport(2));
        assert!(!t.is_near_viewport(3));
    }

    #[test]
    fn test_locator_change_resets_state() {
        let mut t = tracker();
        strip(&mut t, 1, 0.0);
        t.item_mut(0).unwrap().state = ItemState::Done;
        let mut changed = snap(0, 0, rect(100.0, 0.0, 800.0, 1200.0));
        changed
            .attrs
            .insert("data-src".to_string(), "https://cdn.example.com/hq.jpg".to_string());
        t.observe(Viewport::default(), &[changed.clone()], &[], &[]);
        assert_eq!(t.item(0).unwrap().state, ItemState::Idle);

        // Once displaced, reported attributes no longer move the locator.
        t.item_mut(0).unwrap().displaced = true;
        changed
            .attrs
            .insert("data-src".to_string(), "https://cdn.example.com/other.jpg".to_string());
        t.observe(Viewport::default(), &[changed], &[], &[]);
        assert_eq!(
            t.item(0).unwrap().locator.as_deref(),
            Some("https://cdn.example.com/hq.jpg")
        );
    }

    #[test]
    fn test_item_losing_its_source_is_dropped_from_scoring() {
        let mut t = tracker();
        let page = snap(1, 0, rect(0.0, 0.0, 500.0, 500.0));
        let seen = [IntersectionChange { id: 1, area: 250000.0 }];
        t.observe(Viewport::default(), &[page.clone()], &[], &seen);
        assert_eq!(t.score(1), 250000.0);
        assert_eq!(t.current_item(), Some(1));
        t.item_mut(1).unwrap().state = ItemState::Done;

        let mut blanked = page;
        blanked
            .attrs
            .insert("src".to_string(), "about:blank".to_string());
        t.observe(Viewport::default(), &[blanked.clone()], &[], &seen);
        assert_eq!(t.score(1), 0.0);
        assert_ne!(t.current_item(), Some(1));
        let item = t.item(1).unwrap();
        assert_eq!(item.locator, None);
        assert_eq!(item.state, ItemState::Idle);

        // Later intersections alone do not bring it back.
        t.observe(Viewport::default(), &[], &[], &seen);
        assert_eq!(t.score(1), 0.0);

        blanked.attrs.remove("src");
        t.observe(Viewport::default(), &[blanked], &[], &seen);
        assert_eq!(t.score(1), 0.0);
        assert_eq!(t.current_item(), None);
    }
}
