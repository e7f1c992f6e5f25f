//! Fixed-capacity registry of in-flight queries keyed by DNS transaction ID.
//!
//! A [`SlotTable`] holds exactly 65536 [`QuerySlot`]s, one per possible DNS
//! ID. Each slot is on exactly one of two intrusive, doubly-linked lists —
//! `outstanding` (sent, awaiting a response or timeout) and `unused` (free)
//! — implemented as index chains over the backing array rather than actual
//! pointers, so that slot index doubles as DNS ID with no hashing involved.

use crate::clock::TIMESTAMP_PENDING;

/// Number of DNS transaction IDs, and thus the fixed size of a [`SlotTable`].
pub const TABLE_SIZE: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Outstanding,
    Unused,
}

#[derive(Debug, Clone, Copy)]
struct QuerySlot {
    /// Send time in microseconds, or [`TIMESTAMP_PENDING`] while reserved
    /// but not yet committed.
    timestamp: u64,
    /// Index of the [`crate::socket_slot::SocketSlot`] this query was sent
    /// on, valid only once committed.
    sock: u16,
    /// Generation of that socket at commit time; guards against a response
    /// matching a query from before the socket was closed and reopened.
    sock_generation: u32,
    list: List,
    prev: Option<u16>,
    next: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("slot table exhausted: all {TABLE_SIZE} query slots are outstanding")]
    Exhausted,
    #[error("response ID has no matching outstanding slot, or slot's socket differs")]
    Unexpected,
}

/// An expired or cancelled slot, handed back to the caller for accounting.
#[derive(Debug, Clone, Copy)]
pub struct ExpiredSlot {
    pub id: u16,
    pub timestamp: u64,
    pub sock: u16,
}

pub struct SlotTable {
    slots: Box<[QuerySlot; TABLE_SIZE]>,
    outstanding_head: Option<u16>,
    outstanding_tail: Option<u16>,
    unused_head: Option<u16>,
    unused_tail: Option<u16>,
    outstanding_len: usize,
}

impl SlotTable {
    pub fn new() -> Self {
        let mut slots = Box::new(
            [QuerySlot {
                timestamp: TIMESTAMP_PENDING,
                sock: 0,
                sock_generation: 0,
                list: List::Unused,
                prev: None,
                next: None,
            }; TABLE_SIZE],
        );

        for id in 0..TABLE_SIZE {
            slots[id].prev = (id > 0).then(|| (id - 1) as u16);
            slots[id].next = (id + 1 < TABLE_SIZE).then(|| (id + 1) as u16);
        }

        Self {
            slots,
            outstanding_head: None,
            outstanding_tail: None,
            unused_head: Some(0),
            unused_tail: Some((TABLE_SIZE - 1) as u16),
            outstanding_len: 0,
        }
    }

    pub fn num_outstanding(&self) -> usize {
        self.outstanding_len
    }

    pub fn num_unused(&self) -> usize {
        TABLE_SIZE - self.outstanding_len
    }

    /// Removes the head of `unused`, appends it to the head of
    /// `outstanding`, and marks its timestamp pending. Returns the slot's
    /// ID (its array index).
    pub fn reserve(&mut self) -> Result<u16, SlotError> {
        let id = self.unused_head.ok_or(SlotError::Exhausted)?;
        self.unlink(id);

        self.slots[id as usize].timestamp = TIMESTAMP_PENDING;
        self.push_front_outstanding(id);

        Ok(id)
    }

    /// Sets the send time and owning socket on a previously reserved slot.
    pub fn commit(&mut self, id: u16, send_time: u64, sock: u16, sock_generation: u32) {
        let slot = &mut self.slots[id as usize];
        debug_assert_eq!(slot.list, List::Outstanding);
        slot.timestamp = send_time;
        slot.sock = sock;
        slot.sock_generation = sock_generation;
    }

    /// Matches a response to its outstanding slot, moving it to `unused`.
    ///
    /// Returns the slot's original send timestamp on success, used by the
    /// caller to compute latency.
    pub fn complete(&mut self, id: u16, sock: u16, sock_generation: u32) -> Result<u64, SlotError> {
        let slot = self.slots[id as usize];

        if slot.list != List::Outstanding
            || slot.timestamp == TIMESTAMP_PENDING
            || slot.sock != sock
            || slot.sock_generation != sock_generation
        {
            return Err(SlotError::Unexpected);
        }

        self.unlink(id);
        self.push_back_unused(id);

        Ok(slot.timestamp)
    }

    /// Releases a reserved-but-unsent slot back to `unused` (used when the
    /// codec rejects the input line, or a send fails fatally before any
    /// bytes reached the wire).
    pub fn release(&mut self, id: u16) {
        debug_assert_eq!(self.slots[id as usize].list, List::Outstanding);
        self.unlink(id);
        self.push_back_unused(id);
    }

    /// Moves every outstanding slot whose deadline has passed to `unused`,
    /// yielding each one (oldest first) for timeout accounting.
    pub fn expire_older_than(&mut self, now: u64, timeout: u64) -> Vec<ExpiredSlot> {
        let mut expired = Vec::new();

        while let Some(id) = self.outstanding_tail {
            let slot = self.slots[id as usize];
            if slot.timestamp == TIMESTAMP_PENDING || slot.timestamp + timeout > now {
                break;
            }

            self.unlink(id);
            self.push_back_unused(id);

            expired.push(ExpiredSlot {
                id,
                timestamp: slot.timestamp,
                sock: slot.sock,
            });
        }

        expired
    }

    /// Drains every outstanding slot into `unused`, yielding each for
    /// `num_interrupted` accounting.
    pub fn cancel_all(&mut self) -> Vec<ExpiredSlot> {
        let mut cancelled = Vec::new();

        while let Some(id) = self.outstanding_head {
            let slot = self.slots[id as usize];
            self.unlink(id);
            self.push_back_unused(id);

            cancelled.push(ExpiredSlot {
                id,
                timestamp: slot.timestamp,
                sock: slot.sock,
            });
        }

        cancelled
    }

    fn unlink(&mut self, id: u16) {
        let (prev, next, list) = {
            let slot = &self.slots[id as usize];
            (slot.prev, slot.next, slot.list)
        };

        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => match list {
                List::Outstanding => self.outstanding_head = next,
                List::Unused => self.unused_head = next,
            },
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => match list {
                List::Outstanding => self.outstanding_tail = prev,
                List::Unused => self.unused_tail = prev,
            },
        }

        if list == List::Outstanding {
            self.outstanding_len -= 1;
        }

        self.slots[id as usize].prev = None;
        self.slots[id as usize].next = None;
    }

    fn push_front_outstanding(&mut self, id: u16) {
        let old_head = self.outstanding_head;
        self.slots[id as usize].list = List::Outstanding;
        self.slots[id as usize].prev = None;
        self.slots[id as usize].next = old_head;

        if let Some(h) = old_head {
            self.slots[h as usize].prev = Some(id);
        } else {
            self.outstanding_tail = Some(id);
        }
        self.outstanding_head = Some(id);
        self.outstanding_len += 1;
    }

    fn push_back_unused(&mut self, id: u16) {
        let old_tail = self.unused_tail;
        self.slots[id as usize].list = List::Unused;
        self.slots[id as usize].next = None;
        self.slots[id as usize].prev = old_tail;

        if let Some(t) = old_tail {
            self.slots[t as usize].next = Some(id);
        } else {
            self.unused_head = Some(id);
        }
        self.unused_tail = Some(id);
    }

    /// Distinct slot indices currently outstanding, head to tail (newest to
    /// oldest). Exposed for invariant testing only.
    #[cfg(test)]
    pub fn outstanding_ids(&self) -> Vec<u16> {
        let mut ids = Vec::new();
        let mut cur = self.outstanding_head;
        while let Some(id) = cur {
            ids.push(id);
            cur = self.slots[id as usize].next;
        }
        ids
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_conservation_holds_across_reserve_and_complete() {
        let mut table = SlotTable::new();
        assert_eq!(table.num_outstanding() + table.num_unused(), TABLE_SIZE);

        let mut ids = Vec::new();
        for _ in 0..100 {
            let id = table.reserve().unwrap();
            table.commit(id, 1, 0, 0);
            ids.push(id);
            assert_eq!(table.num_outstanding() + table.num_unused(), TABLE_SIZE);
        }

        for id in ids {
            table.complete(id, 0, 0).unwrap();
            assert_eq!(table.num_outstanding() + table.num_unused(), TABLE_SIZE);
        }

        assert_eq!(table.num_outstanding(), 0);
    }

    #[test]
    fn ids_are_unique_while_outstanding() {
        let mut table = SlotTable::new();
        let mut ids = std::collections::HashSet::new();

        for _ in 0..1000 {
            let id = table.reserve().unwrap();
            table.commit(id, 1, 0, 0);
            assert!(ids.insert(id), "duplicate ID handed out while outstanding");
        }

        let outstanding = table.outstanding_ids();
        let unique: std::collections::HashSet<_> = outstanding.iter().copied().collect();
        assert_eq!(outstanding.len(), unique.len());
    }

    #[test]
    fn reserve_fails_when_exhausted() {
        let mut table = SlotTable::new();
        for _ in 0..TABLE_SIZE {
            table.reserve().unwrap();
        }

        assert!(matches!(table.reserve(), Err(SlotError::Exhausted)));
    }

    #[test]
    fn complete_rejects_wrong_socket() {
        let mut table = SlotTable::new();
        let id = table.reserve().unwrap();
        table.commit(id, 1, 3, 0);

        assert!(matches!(table.complete(id, 4, 0), Err(SlotError::Unexpected)));
        assert!(table.complete(id, 3, 0).is_ok());
    }

    #[test]
    fn complete_rejects_stale_generation_after_reopen() {
        let mut table = SlotTable::new();
        let id = table.reserve().unwrap();
        table.commit(id, 1, 0, 1);

        assert!(matches!(table.complete(id, 0, 0), Err(SlotError::Unexpected)));
        assert!(table.complete(id, 0, 1).is_ok());
    }

    #[test]
    fn expire_older_than_scans_oldest_first_and_stops_at_first_survivor() {
        let mut table = SlotTable::new();
        let a = table.reserve().unwrap();
        table.commit(a, 100, 0, 0);
        let b = table.reserve().unwrap();
        table.commit(b, 200, 0, 0);
        let c = table.reserve().unwrap();
        table.commit(c, 300, 0, 0);

        let expired = table.expire_older_than(250, 100);

        assert_eq!(expired.len(), 2);
        assert_eq!(expired[0].id, a);
        assert_eq!(expired[1].id, b);
        assert_eq!(table.num_outstanding(), 1);
    }

    #[test]
    fn cancel_all_drains_everything() {
        let mut table = SlotTable::new();
        for _ in 0..10 {
            let id = table.reserve().unwrap();
            table.commit(id, 1, 0, 0);
        }

        let cancelled = table.cancel_all();
        assert_eq!(cancelled.len(), 10);
        assert_eq!(table.num_outstanding(), 0);
        assert_eq!(table.num_unused(), TABLE_SIZE);
    }
}
