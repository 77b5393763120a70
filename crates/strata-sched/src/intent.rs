use hashbrown::HashMap;
use strata_cell::CellKey;
use strata_store::CellIndex;

/// Higher values are admitted first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub const BACKGROUND: Priority = Priority(0);
    /// First build of a cell a body just reached.
    pub const LOAD: Priority = Priority(1);
    pub const EDIT: Priority = Priority(2);
    pub const URGENT: Priority = Priority(3);

    /// Edit-or-higher work goes to the edit build lane.
    pub fn is_edit(self) -> bool {
        self >= Priority::EDIT
    }
}

/// A claimed cell waiting for its snapshot. The claim (state `Scheduled`)
/// is already held; `version` is what the claim returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub key: CellKey,
    pub index: CellIndex,
    pub version: u32,
    pub initial: bool,
    pub priority: Priority,
}

/// Pending requests keyed by cell; repeated requests coalesce.
#[derive(Default)]
pub struct IntentSet {
    by_key: HashMap<CellKey, PendingRequest>,
}

impl IntentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn contains(&self, key: CellKey) -> bool {
        self.by_key.contains_key(&key)
    }

    pub fn get(&self, key: CellKey) -> Option<&PendingRequest> {
        self.by_key.get(&key)
    }

    /// Insert or merge; the merged entry keeps the highest priority and version.
    pub fn record(&mut self, req: PendingRequest) {
        self.by_key
            .entry(req.key)
            .and_modify(|e| {
                if req.version > e.version {
                    e.version = req.version;
                    e.index = req.index;
                }
                if req.priority > e.priority {
                    e.priority = req.priority;
                }
                e.initial |= req.initial;
            })
            .or_insert(req);
    }

    /// Raise the priority of a queued request. Returns false if none is queued.
    pub fn raise(&mut self, key: CellKey, priority: Priority) -> bool {
        match self.by_key.get_mut(&key) {
            Some(e) => {
                e.priority = e.priority.max(priority);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: CellKey) -> Option<PendingRequest> {
        self.by_key.remove(&key)
    }

    /// Remove and return every request `drop` selects.
    pub fn extract_if(&mut self, mut drop: impl FnMut(&PendingRequest) -> bool) -> Vec<PendingRequest> {
        let keys: Vec<CellKey> = self
            .by_key
            .values()
            .filter(|r| drop(r))
            .map(|r| r.key)
            .collect();
        keys.into_iter()
            .filter_map(|k| self.by_key.remove(&k))
            .collect()
    }

    /// Take up to `max` requests ordered by priority, then version, both
    /// descending. Ties break on key so the order is deterministic.
    pub fn take_ranked(&mut self, max: usize) -> Vec<PendingRequest> {
        if max == 0 || self.by_key.is_empty() {
            return Vec::new();
        }
        let mut items: Vec<PendingRequest> = self.by_key.values().copied().collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.version.cmp(&a.version))
                .then(a.key.cmp(&b.key))
        });
        items.truncate(max);
        for r in &items {
            self.by_key.remove(&r.key);
        }
        items
    }
}
