//! Dirty-table scheduler.
//!
//! Two FIFO sets keyed by table name, one per sync direction. A table can
//! be dirty on both sides at once (a pending download and a pending
//! upload). No fairness beyond eventual visit is promised.

use std::collections::VecDeque;

/// Direction of pending work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSide {
    /// Local changes waiting for upload.
    Local,
    /// Cloud changes waiting for download.
    Cloud,
}

/// The two dirty sets.
#[derive(Debug, Default)]
pub struct DirtyTables {
    local: VecDeque<String>,
    cloud: VecDeque<String>,
}

impl DirtyTables {
    /// Creates empty sets.
    pub fn new() -> Self {
        Self::default()
    }

    fn side_mut(&mut self, side: SyncSide) -> &mut VecDeque<String> {
        match side {
            SyncSide::Local => &mut self.local,
            SyncSide::Cloud => &mut self.cloud,
        }
    }

    fn side(&self, side: SyncSide) -> &VecDeque<String> {
        match side {
            SyncSide::Local => &self.local,
            SyncSide::Cloud => &self.cloud,
        }
    }

    /// Marks a table dirty on one side; set semantics, re-marking an
    /// already dirty table does nothing.
    pub fn mark_dirty(&mut self, table: &str, side: SyncSide) {
        let set = self.side_mut(side);
        if !set.iter().any(|t| t == table) {
            set.push_back(table.to_owned());
        }
    }

    /// The next table to work on for a side; the entry stays until
    /// [`Self::clear`] so partial failures retry.
    pub fn next_dirty(&self, side: SyncSide) -> Option<String> {
        self.side(side).front().cloned()
    }

    /// Removes a table from one side.
    pub fn clear(&mut self, table: &str, side: SyncSide) {
        self.side_mut(side).retain(|t| t != table);
    }

    /// Snapshots all given tables into one side's set.
    pub fn fill_dirty<I>(&mut self, side: SyncSide, tables: I)
    where
        I: IntoIterator<Item = String>,
    {
        for table in tables {
            self.mark_dirty(&table, side);
        }
    }

    /// Forgets a table on both sides, for tables leaving the watcher.
    pub fn remove_table(&mut self, table: &str) {
        self.clear(table, SyncSide::Local);
        self.clear(table, SyncSide::Cloud);
    }

    /// True if the side has no pending tables.
    pub fn is_empty(&self, side: SyncSide) -> bool {
        self.side(side).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_side() {
        let mut dirty = DirtyTables::new();
        dirty.mark_dirty("a", SyncSide::Cloud);
        dirty.mark_dirty("b", SyncSide::Cloud);

        assert_eq!(dirty.next_dirty(SyncSide::Cloud).as_deref(), Some("a"));
        dirty.clear("a", SyncSide::Cloud);
        assert_eq!(dirty.next_dirty(SyncSide::Cloud).as_deref(), Some("b"));
        dirty.clear("b", SyncSide::Cloud);
        assert_eq!(dirty.next_dirty(SyncSide::Cloud), None);
    }

    #[test]
    fn marking_twice_is_once() {
        let mut dirty = DirtyTables::new();
        dirty.mark_dirty("a", SyncSide::Local);
        dirty.mark_dirty("a", SyncSide::Local);
        dirty.clear("a", SyncSide::Local);
        assert!(dirty.is_empty(SyncSide::Local));
    }

    #[test]
    fn sides_are_independent() {
        let mut dirty = DirtyTables::new();
        dirty.mark_dirty("a", SyncSide::Local);
        dirty.mark_dirty("a", SyncSide::Cloud);

        dirty.clear("a", SyncSide::Local);
        assert!(dirty.is_empty(SyncSide::Local));
        assert_eq!(dirty.next_dirty(SyncSide::Cloud).as_deref(), Some("a"));
    }

    #[test]
    fn entry_survives_until_cleared() {
        let mut dirty = DirtyTables::new();
        dirty.mark_dirty("a", SyncSide::Cloud);
        // Peeking twice without clearing returns the same table; a failed
        // download leaves the table due for retry.
        assert_eq!(dirty.next_dirty(SyncSide::Cloud).as_deref(), Some("a"));
        assert_eq!(dirty.next_dirty(SyncSide::Cloud).as_deref(), Some("a"));
    }

    #[test]
    fn fill_and_remove() {
        let mut dirty = DirtyTables::new();
        dirty.fill_dirty(
            SyncSide::Cloud,
            ["a".to_string(), "b".to_string()],
        );
        dirty.fill_dirty(SyncSide::Local, ["a".to_string()]);

        dirty.remove_table("a");
        assert_eq!(dirty.next_dirty(SyncSide::Cloud).as_deref(), Some("b"));
        assert!(dirty.is_empty(SyncSide::Local));
    }
}
