use terrastream_common::{INVALID_INDEX, LayerId};

/// Handle to one slot of a [`TileSet`]. Only valid while the slot's
/// generation still matches; eviction or release bumps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileHandle {
    pub slot: u32,
    pub generation: u32,
}

/// Result of [`TileSet::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub handle: TileHandle,
    /// The handle that previously owned the slot, when one had to be evicted.
    pub evicted: Option<TileHandle>,
}

/// Fixed pool of GPU tile slots for one layer.
///
/// Slots in use sit on an intrusive list ordered by last reference, least
/// recent at the head. A slot with transfers still writing into it is never
/// evicted, and a released busy slot only returns to the free list once its
/// last transfer has finished.
#[derive(Debug, Clone)]
pub struct TileSet {
    layer: LayerId,
    generations: Vec<u32>,
    in_use: Vec<bool>,
    last_used: Vec<u64>,
    busy: Vec<u32>,
    prev: Vec<u32>,
    next: Vec<u32>,
    head: u32,
    tail: u32,
    free: Vec<u32>,
}

impl TileSet {
    pub fn new(layer: LayerId, capacity: u32) -> Self {
        let n = capacity as usize;
        Self {
            layer,
            generations: vec![0; n],
            in_use: vec![false; n],
            last_used: vec![0; n],
            busy: vec![0; n],
            prev: vec![INVALID_INDEX; n],
            next: vec![INVALID_INDEX; n],
            head: INVALID_INDEX,
            tail: INVALID_INDEX,
            // Reversed so slot 0 is handed out first.
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    pub fn capacity(&self) -> usize {
        self.generations.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.iter().filter(|used| **used).count()
    }

    /// Transfers still writing into the handle's slot, whoever owns it now.
    pub fn is_busy(&self, handle: TileHandle) -> bool {
        self.busy.get(handle.slot as usize).is_some_and(|b| *b > 0)
    }

    /// Record a transfer targeting `handle`'s slot.
    pub fn begin_upload(&mut self, handle: TileHandle) {
        if let Some(busy) = self.busy.get_mut(handle.slot as usize) {
            *busy += 1;
        }
    }

    /// Record that a transfer into `handle`'s slot has finished. A released
    /// slot becomes allocatable again with its last transfer.
    pub fn end_upload(&mut self, handle: TileHandle) {
        let s = handle.slot as usize;
        let Some(busy) = self.busy.get_mut(s) else {
            return;
        };
        if *busy == 0 {
            return;
        }
        *busy -= 1;
        if *busy == 0 && !self.in_use[s] {
            self.free.push(handle.slot);
        }
    }

    pub fn is_valid(&self, handle: TileHandle) -> bool {
        let slot = handle.slot as usize;
        slot < self.generations.len() && self.in_use[slot] && self.generations[slot] == handle.generation
    }

    /// Take a free slot, or evict the least recently referenced idle slot not
    /// referenced during `frame`. `None` when no slot qualifies.
    pub fn allocate(&mut self, frame: u64) -> Option<Allocation> {
        let mut evicted = None;
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let mut victim = self.head;
                while victim != INVALID_INDEX && self.busy[victim as usize] > 0 {
                    victim = self.next[victim as usize];
                }
                if victim == INVALID_INDEX || self.last_used[victim as usize] >= frame {
                    return None;
                }
                evicted = Some(self.handle(victim));
                self.unlink(victim);
                self.generations[victim as usize] = self.generations[victim as usize].wrapping_add(1);
                victim
            }
        };

        let s = slot as usize;
        self.in_use[s] = true;
        self.last_used[s] = frame;
        self.push_back(slot);
        Some(Allocation {
            handle: self.handle(slot),
            evicted,
        })
    }

    /// Mark a slot as referenced in `frame`. Returns false for stale handles.
    pub fn touch(&mut self, handle: TileHandle, frame: u64) -> bool {
        if !self.is_valid(handle) {
            return false;
        }
        let slot = handle.slot;
        self.last_used[slot as usize] = frame;
        if self.tail != slot {
            self.unlink(slot);
            self.push_back(slot);
        }
        true
    }

    /// Invalidate a handle and give its slot back. Stale handles are ignored.
    pub fn release(&mut self, handle: TileHandle) -> bool {
        if !self.is_valid(handle) {
            return false;
        }
        let slot = handle.slot;
        self.unlink(slot);
        let s = slot as usize;
        self.in_use[s] = false;
        self.generations[s] = self.generations[s].wrapping_add(1);
        if self.busy[s] == 0 {
            self.free.push(slot);
        }
        true
    }

    /// Slots in use, least recently referenced first.
    pub fn lru_order(&self) -> Vec<TileHandle> {
        let mut out = Vec::with_capacity(self.in_use());
        let mut cursor = self.head;
        while cursor != INVALID_INDEX {
            out.push(self.handle(cursor));
            cursor = self.next[cursor as usize];
        }
        out
    }

    fn handle(&self, slot: u32) -> TileHandle {
        TileHandle {
            slot,
            generation: self.generations[slot as usize],
        }
    }

    fn push_back(&mut self, slot: u32) {
        let s = slot as usize;
        self.prev[s] = self.tail;
        self.next[s] = INVALID_INDEX;
        if self.tail != INVALID_INDEX {
            self.next[self.tail as usize] = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
    }

    fn unlink(&mut self, slot: u32) {
        let s = slot as usize;
        let (prev, next) = (self.prev[s], self.next[s]);
        if prev != INVALID_INDEX {
            self.next[prev as usize] = next;
        } else {
            self.head = next;
        }
        if next != INVALID_INDEX {
            self.prev[next as usize] = prev;
        } else {
            self.tail = prev;
        }
        self.prev[s] = INVALID_INDEX;
        self.next[s] = INVALID_INDEX;
    }
}
