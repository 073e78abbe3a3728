use crossbeam_channel::{Receiver, Sender, unbounded};
use terrastream_common::{LayerId, UberRegion};

use crate::upload::ResourceViewId;

/// Freshly edited data for a region of one layer's uber surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortCircuitUpdate {
    pub layer: LayerId,
    pub region: UberRegion,
    pub view: ResourceViewId,
}

/// Cancels an earlier update for a region; affected nodes reload from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortCircuitAbandon {
    pub layer: LayerId,
    pub region: UberRegion,
}

#[derive(Debug, Clone, Copy)]
enum BridgeMessage {
    Update(ShortCircuitUpdate),
    Abandon(ShortCircuitAbandon),
}

/// Producer side of the bridge. Cheap to clone and safe to hand to editor
/// threads.
#[derive(Debug, Clone)]
pub struct ShortCircuitQueue {
    tx: Sender<BridgeMessage>,
}

impl ShortCircuitQueue {
    /// Returns false once the consuming cache is gone.
    pub fn queue_short_circuit(&self, layer: LayerId, region: UberRegion, view: ResourceViewId) -> bool {
        self.tx
            .send(BridgeMessage::Update(ShortCircuitUpdate { layer, region, view }))
            .is_ok()
    }

    pub fn queue_abandon(&self, layer: LayerId, region: UberRegion) -> bool {
        self.tx
            .send(BridgeMessage::Abandon(ShortCircuitAbandon { layer, region }))
            .is_ok()
    }
}

/// Everything queued since the previous drain, coalesced per `(layer, region)`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainedEdits {
    pub abandons: Vec<ShortCircuitAbandon>,
    pub updates: Vec<ShortCircuitUpdate>,
}

impl DrainedEdits {
    pub fn is_empty(&self) -> bool {
        self.abandons.is_empty() && self.updates.is_empty()
    }
}

/// Consumer side, owned by the tile cache.
///
/// Messages are taken in arrival order. A later update for the same layer
/// and region replaces the earlier one in place. An abandon drops any update
/// queued before it on the same layer whose region it contains; an update
/// queued after an abandon is kept and lands after the reload.
#[derive(Debug)]
pub struct ShortCircuitBridge {
    tx: Sender<BridgeMessage>,
    rx: Receiver<BridgeMessage>,
    staged: DrainedEdits,
}

impl Default for ShortCircuitBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ShortCircuitBridge {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            staged: DrainedEdits::default(),
        }
    }

    pub fn queue(&self) -> ShortCircuitQueue {
        ShortCircuitQueue { tx: self.tx.clone() }
    }

    pub fn queue_short_circuit(&self, layer: LayerId, region: UberRegion, view: ResourceViewId) {
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self
            .tx
            .send(BridgeMessage::Update(ShortCircuitUpdate { layer, region, view }));
    }

    pub fn queue_abandon(&self, layer: LayerId, region: UberRegion) {
        let _ = self
            .tx
            .send(BridgeMessage::Abandon(ShortCircuitAbandon { layer, region }));
    }

    /// Messages sent but not yet collected.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Take the coalesced updates. Abandons stay staged until collected.
    pub fn pending_updates(&mut self) -> Vec<ShortCircuitUpdate> {
        self.collect();
        std::mem::take(&mut self.staged.updates)
    }

    /// Take the coalesced abandons. Updates stay staged until collected.
    pub fn pending_abandons(&mut self) -> Vec<ShortCircuitAbandon> {
        self.collect();
        std::mem::take(&mut self.staged.abandons)
    }

    /// Take everything queued since the previous drain.
    pub fn drain(&mut self) -> DrainedEdits {
        self.collect();
        let out = std::mem::take(&mut self.staged);
        if !out.is_empty() {
            tracing::trace!(
                abandons = out.abandons.len(),
                updates = out.updates.len(),
                "drained short-circuit bridge"
            );
        }
        out
    }

    fn collect(&mut self) {
        let staged = &mut self.staged;
        for message in self.rx.try_iter() {
            match message {
                BridgeMessage::Update(update) => {
                    match staged
                        .updates
                        .iter_mut()
                        .find(|u| u.layer == update.layer && u.region == update.region)
                    {
                        Some(existing) => existing.view = update.view,
                        None => staged.updates.push(update),
                    }
                }
                BridgeMessage::Abandon(abandon) => {
                    staged
                        .updates
                        .retain(|u| !(u.layer == abandon.layer && abandon.region.contains(&u.region)));
                    if !staged.abandons.contains(&abandon) {
                        staged.abandons.push(abandon);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: u32) -> UberRegion {
        UberRegion::new([x, 0], [x + 8, 8])
    }

    #[test]
    fn later_update_replaces_earlier() {
        let mut bridge = ShortCircuitBridge::new();
        bridge.queue_short_circuit(LayerId::Heights, region(0), ResourceViewId(1));
        bridge.queue_short_circuit(LayerId::Heights, region(16), ResourceViewId(2));
        bridge.queue_short_circuit(LayerId::Heights, region(0), ResourceViewId(3));

        let drained = bridge.drain();
        assert_eq!(drained.updates.len(), 2);
        assert_eq!(drained.updates[0].view, ResourceViewId(3));
        assert_eq!(drained.updates[1].view, ResourceViewId(2));
        assert!(bridge.drain().is_empty());
    }

    #[test]
    fn layers_do_not_coalesce() {
        let mut bridge = ShortCircuitBridge::new();
        bridge.queue_short_circuit(LayerId::Heights, region(0), ResourceViewId(1));
        bridge.queue_short_circuit(LayerId::Coverage(0), region(0), ResourceViewId(2));
        assert_eq!(bridge.drain().updates.len(), 2);
    }

    #[test]
    fn abandon_drops_earlier_update() {
        let mut bridge = ShortCircuitBridge::new();
        bridge.queue_short_circuit(LayerId::Heights, region(0), ResourceViewId(1));
        bridge.queue_abandon(LayerId::Heights, region(0));
        bridge.queue_abandon(LayerId::Heights, region(0));

        let drained = bridge.drain();
        assert!(drained.updates.is_empty());
        assert_eq!(drained.abandons.len(), 1);
    }

    #[test]
    fn abandon_drops_updates_inside_its_region() {
        let mut bridge = ShortCircuitBridge::new();
        let inner = UberRegion::new([4, 4], [8, 8]);
        let straddling = UberRegion::new([60, 0], [70, 8]);
        bridge.queue_short_circuit(LayerId::Heights, inner, ResourceViewId(1));
        bridge.queue_short_circuit(LayerId::Heights, straddling, ResourceViewId(2));
        bridge.queue_short_circuit(LayerId::Coverage(0), inner, ResourceViewId(3));
        bridge.queue_abandon(LayerId::Heights, UberRegion::new([0, 0], [64, 64]));

        let views: Vec<_> = bridge.drain().updates.iter().map(|u| u.view).collect();
        assert_eq!(views, vec![ResourceViewId(2), ResourceViewId(3)]);
    }

    #[test]
    fn update_after_abandon_survives() {
        let mut bridge = ShortCircuitBridge::new();
        bridge.queue_abandon(LayerId::Heights, region(0));
        bridge.queue_short_circuit(LayerId::Heights, region(0), ResourceViewId(5));

        let drained = bridge.drain();
        assert_eq!(drained.abandons.len(), 1);
        assert_eq!(drained.updates[0].view, ResourceViewId(5));
    }

    #[test]
    fn producers_on_other_threads() {
        let mut bridge = ShortCircuitBridge::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = bridge.queue();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        assert!(queue.queue_short_circuit(LayerId::Heights, region(t * 8), ResourceViewId(i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = bridge.drain();
        assert_eq!(drained.updates.len(), 4);
        assert!(drained.updates.iter().all(|u| u.view == ResourceViewId(49)));
    }

    #[test]
    fn pending_lists_drain_separately() {
        let mut bridge = ShortCircuitBridge::new();
        bridge.queue_short_circuit(LayerId::Heights, region(0), ResourceViewId(1));
        bridge.queue_abandon(LayerId::Coverage(0), region(16));
        assert_eq!(bridge.queued(), 2);

        let updates = bridge.pending_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(bridge.queued(), 0);
        assert!(bridge.pending_updates().is_empty());

        let abandons = bridge.pending_abandons();
        assert_eq!(abandons, vec![ShortCircuitAbandon { layer: LayerId::Coverage(0), region: region(16) }]);
        assert!(bridge.drain().is_empty());
    }

    #[test]
    fn queue_reports_dropped_consumer() {
        let bridge = ShortCircuitBridge::new();
        let queue = bridge.queue();
        drop(bridge);
        assert!(!queue.queue_abandon(LayerId::Heights, region(0)));
    }
}
