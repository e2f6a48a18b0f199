//! Per-session table of open device handles.

const ALLOC_INCREMENT: usize = 16;

/// Maps the small non-negative handle words on the wire to open devices.
///
/// Slots are scanned round-robin from the most recently used one, so a
/// freshly closed handle is not reissued until the cursor wraps around.
/// The table grows in increments when full.
pub(crate) struct HandleTable<D> {
    slots: Vec<Option<D>>,
    last_used: usize,
}

impl<D> HandleTable<D> {
    pub(crate) fn new() -> Self {
        HandleTable { slots: Vec::new(), last_used: 0 }
    }

    /// Store a device, returning its handle.
    pub(crate) fn insert(&mut self, device: D) -> usize {
        let len = self.slots.len();
        if len > 0 {
            let start = (self.last_used + 1) % len;
            for i in 0..len {
                let idx = (start + i) % len;
                if self.slots[idx].is_none() {
                    self.slots[idx] = Some(device);
                    self.last_used = idx;
                    return idx;
                }
            }
        }
        let idx = len;
        self.slots.resize_with(len + ALLOC_INCREMENT, || None);
        self.slots[idx] = Some(device);
        self.last_used = idx;
        idx
    }

    pub(crate) fn get_mut(&mut self, handle: i32) -> Option<&mut D> {
        let idx = usize::try_from(handle).ok()?;
        self.slots.get_mut(idx)?.as_mut()
    }

    /// Remove and return a device, freeing its handle.
    pub(crate) fn take(&mut self, handle: i32) -> Option<D> {
        let idx = usize::try_from(handle).ok()?;
        self.slots.get_mut(idx)?.take()
    }

    /// Return a device checked out with [`take`](Self::take).
    pub(crate) fn put_back(&mut self, handle: usize, device: D) {
        self.slots[handle] = Some(device);
    }

    /// Drop every open device.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique_while_open() {
        let mut table = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        let c = table.insert("c");
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[test]
    fn freed_handle_is_not_reissued_until_the_cursor_wraps() {
        let mut table = HandleTable::new();
        table.insert("a");
        table.insert("b");
        table.insert("c");
        assert_eq!(table.take(1), Some("b"));
        // The cursor sits at 2; slot 1 is skipped until everything after
        // it has been used.
        assert_eq!(table.insert("d"), 3);
        for expected in 4..ALLOC_INCREMENT {
            assert_eq!(table.insert("x"), expected);
        }
        assert_eq!(table.insert("wrapped"), 1);
    }

    #[test]
    fn table_grows_when_full() {
        let mut table = HandleTable::new();
        for i in 0..ALLOC_INCREMENT {
            assert_eq!(table.insert(i), i);
        }
        assert_eq!(table.insert(99), ALLOC_INCREMENT);
    }

    #[test]
    fn take_and_get_reject_bad_handles() {
        let mut table: HandleTable<&str> = HandleTable::new();
        table.insert("a");
        assert!(table.get_mut(-1).is_none());
        assert!(table.get_mut(7).is_none());
        assert!(table.take(100).is_none());
        assert!(table.get_mut(0).is_some());
    }

    #[test]
    fn clear_drops_everything() {
        let mut table = HandleTable::new();
        table.insert("a");
        table.insert("b");
        table.clear();
        assert!(table.get_mut(0).is_none());
        assert!(table.get_mut(1).is_none());
    }
}
