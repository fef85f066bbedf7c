//! Notification batcher
//!
//! Change markers collected while the batch lock is held are deduplicated
//! and handed out as one set when the outermost lock is released. A marker
//! recorded outside any lock is flushed on its own right away.

use std::collections::BTreeSet;

use lwm2m_interface::ChangeMarker;

/// Depth-counted batch of pending change markers
#[derive(Debug, Default)]
pub struct NotificationBatcher {
    depth: usize,
    pending: BTreeSet<ChangeMarker>,
    evaluations: u64,
}

impl NotificationBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current nesting depth of the batch lock
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_locked(&self) -> bool {
        self.depth > 0
    }

    /// Markers waiting for the outermost leave
    pub fn pending(&self) -> impl Iterator<Item = &ChangeMarker> {
        self.pending.iter()
    }

    /// Number of evaluation passes handed out so far
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn enter(&mut self) {
        self.depth += 1;
    }

    /// Leave one level; returns the batch when the outermost level is left
    ///
    /// A leave without a matching enter is ignored.
    pub fn leave(&mut self) -> Option<Vec<ChangeMarker>> {
        if self.depth == 0 {
            log::warn!("Unbalanced notification lock release ignored");
            return None;
        }
        self.depth -= 1;
        if self.depth > 0 {
            return None;
        }
        self.flush()
    }

    /// Enter or leave, mirroring the public lock entry point
    pub fn lock(&mut self, enter: bool) -> Option<Vec<ChangeMarker>> {
        if enter {
            self.enter();
            None
        } else {
            self.leave()
        }
    }

    /// Record a marker
    ///
    /// Outside a lock this is an implicit enter and leave, so the marker is
    /// returned straight away as a batch of its own.
    pub fn mark(&mut self, marker: ChangeMarker) -> Option<Vec<ChangeMarker>> {
        self.enter();
        self.pending.insert(marker);
        self.leave()
    }

    /// Record several markers as one unit
    pub fn mark_all(&mut self, markers: impl IntoIterator<Item = ChangeMarker>) -> Option<Vec<ChangeMarker>> {
        self.enter();
        self.pending.extend(markers);
        self.leave()
    }

    fn flush(&mut self) -> Option<Vec<ChangeMarker>> {
        if self.pending.is_empty() {
            return None;
        }
        self.evaluations += 1;
        let batch: Vec<ChangeMarker> = std::mem::take(&mut self.pending).into_iter().collect();
        log::trace!("Flushing {} change marker(s)", batch.len());
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(resource: u16) -> ChangeMarker {
        ChangeMarker::resource(3, Some(0), Some(resource))
    }

    #[test]
    fn test_unlocked_mark_flushes_immediately() {
        let mut batcher = NotificationBatcher::new();
        assert_eq!(batcher.mark(marker(9)), Some(vec![marker(9)]));
        assert_eq!(batcher.evaluations(), 1);
        assert_eq!(batcher.depth(), 0);
    }

    #[test]
    fn test_nested_lock_flushes_once() {
        let mut batcher = NotificationBatcher::new();
        batcher.lock(true);
        batcher.lock(true);
        assert_eq!(batcher.mark(marker(9)), None);
        assert_eq!(batcher.mark(marker(9)), None);
        assert_eq!(batcher.mark(marker(10)), None);
        assert_eq!(batcher.lock(false), None);
        assert_eq!(batcher.pending().count(), 2);

        assert_eq!(batcher.lock(false), Some(vec![marker(9), marker(10)]));
        assert_eq!(batcher.evaluations(), 1);
        assert_eq!(batcher.pending().count(), 0);
    }

    #[test]
    fn test_unbalanced_leave_is_ignored() {
        let mut batcher = NotificationBatcher::new();
        assert_eq!(batcher.lock(false), None);
        assert_eq!(batcher.depth(), 0);
        batcher.lock(true);
        assert!(batcher.is_locked());
        assert_eq!(batcher.mark(marker(1)), None);
        assert_eq!(batcher.lock(false).map(|b| b.len()), Some(1));
    }

    #[test]
    fn test_empty_batch_is_not_an_evaluation() {
        let mut batcher = NotificationBatcher::new();
        batcher.lock(true);
        assert_eq!(batcher.lock(false), None);
        assert_eq!(batcher.evaluations(), 0);
    }

    #[test]
    fn test_create_delete_markers_stay_distinct() {
        let mut batcher = NotificationBatcher::new();
        batcher.lock(true);
        batcher.mark(ChangeMarker::instance_created(3300, 1));
        batcher.mark(ChangeMarker::instance_deleted(3300, 1));
        batcher.mark(ChangeMarker::instance_created(3300, 1));
        assert_eq!(batcher.lock(false).map(|b| b.len()), Some(2));
    }
}
