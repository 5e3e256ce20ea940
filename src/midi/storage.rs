// src/midi/storage.rs
// Ring store of timestamped MIDI records with invalidating cursors

/// Record header: time (u32 LE) followed by data size (u16 LE).
const HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiRecord<'a> {
    pub time: u32,
    pub data: &'a [u8],
}

/// Handle to a cursor registered with one storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MidiCursor(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorFindResult {
    /// Records stepped over before stopping.
    pub n_processed: usize,
    /// Whether the cursor now points at a record at or after the target.
    pub found: bool,
}

/// Which records `truncate` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateSide {
    /// Records with a time before the given time.
    Head,
    /// Records with a time at or after the given time.
    Tail,
}

#[derive(Debug, Clone, Copy, Default)]
struct CursorState {
    offset: Option<usize>,
    generation: u64,
    pending: bool,
}

/// MIDI records `(time, size, data)` in one fixed byte arena.
///
/// Records are kept contiguous. When a record does not fit at the end of the
/// arena it is written at the start and the store becomes "wrapped": the
/// records then occupy `[front, wrap_end)` followed by `[0, back)`.
/// Times never decrease from front to back.
///
/// Cursors live in a registry inside the storage and are addressed by
/// `MidiCursor`. A cursor only stays valid while its generation matches the
/// storage's; `clear()` bumps the generation, `truncate()` bumps it and
/// carries over every cursor it did not invalidate.
#[derive(Debug)]
pub struct MidiStorage {
    arena: Box<[u8]>,
    front: usize,
    back: usize,
    last: usize,
    wrap_end: usize,
    wrapped: bool,
    n_events: usize,
    n_bytes: usize,
    generation: u64,
    cursors: Vec<CursorState>,
}

impl MidiStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: vec![0; capacity].into_boxed_slice(),
            front: 0,
            back: 0,
            last: 0,
            wrap_end: capacity,
            wrapped: false,
            n_events: 0,
            n_bytes: 0,
            generation: 0,
            cursors: Vec::with_capacity(4),
        }
    }

    pub fn bytes_capacity(&self) -> usize {
        self.arena.len()
    }

    pub fn bytes_occupied(&self) -> usize {
        self.n_bytes
    }

    pub fn bytes_free(&self) -> usize {
        self.arena.len() - self.n_bytes
    }

    pub fn n_events(&self) -> usize {
        self.n_events
    }

    pub fn is_empty(&self) -> bool {
        self.n_events == 0
    }

    fn read_u32(&self, off: usize) -> u32 {
        let b = &self.arena[off..off + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn record_size(&self, off: usize) -> usize {
        let b = &self.arena[off + 4..off + 6];
        u16::from_le_bytes([b[0], b[1]]) as usize
    }

    fn record_len(&self, off: usize) -> usize {
        HEADER_SIZE + self.record_size(off)
    }

    fn record_at(&self, off: usize) -> MidiRecord<'_> {
        let size = self.record_size(off);
        MidiRecord {
            time: self.read_u32(off),
            data: &self.arena[off + HEADER_SIZE..off + HEADER_SIZE + size],
        }
    }

    fn next_offset(&self, off: usize) -> Option<usize> {
        if self.n_events == 0 || off == self.last {
            return None;
        }
        let next = off + self.record_len(off);
        if self.wrapped && next == self.wrap_end {
            Some(0)
        } else {
            Some(next)
        }
    }

    fn store(&mut self, off: usize, time: u32, data: &[u8]) {
        self.arena[off..off + 4].copy_from_slice(&time.to_le_bytes());
        self.arena[off + 4..off + 6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        self.arena[off + HEADER_SIZE..off + HEADER_SIZE + data.len()].copy_from_slice(data);
    }

    fn check_size(&self, data: &[u8]) -> Option<usize> {
        let len = HEADER_SIZE + data.len();
        if data.len() > u16::MAX as usize || len > self.arena.len() {
            log::warn!("ignoring MIDI message of {} bytes: larger than storage", data.len());
            return None;
        }
        Some(len)
    }

    fn reset_positions(&mut self) {
        self.front = 0;
        self.back = 0;
        self.last = 0;
        self.wrap_end = self.arena.len();
        self.wrapped = false;
        self.n_events = 0;
        self.n_bytes = 0;
    }

    /// Where a record of `len` bytes would go at the back, and whether
    /// writing it there wraps the store.
    fn append_slot(&self, len: usize) -> Option<(usize, bool)> {
        if self.n_events == 0 {
            return (len <= self.arena.len()).then_some((0, false));
        }
        if self.wrapped {
            return (self.front - self.back >= len).then_some((self.back, false));
        }
        if self.arena.len() - self.back >= len {
            Some((self.back, false))
        } else if self.front >= len {
            Some((0, true))
        } else {
            None
        }
    }

    /// Remove the oldest record. Cursors pointing at it are marked pending.
    fn pop_front<F>(&mut self, dropped: &mut F)
    where
        F: FnMut(MidiRecord<'_>),
    {
        if self.n_events == 0 {
            return;
        }
        let off = self.front;
        let len = self.record_len(off);
        dropped(self.record_at(off));
        for cursor in self.cursors.iter_mut() {
            if cursor.generation == self.generation && cursor.offset == Some(off) {
                cursor.pending = true;
            }
        }
        if self.n_events == 1 {
            self.reset_positions();
            return;
        }
        let next = off + len;
        if self.wrapped && next == self.wrap_end {
            self.front = 0;
            self.wrapped = false;
            self.wrap_end = self.arena.len();
        } else {
            self.front = next;
        }
        self.n_events -= 1;
        self.n_bytes -= len;
    }

    /// Move every pending cursor to the current front.
    fn settle_pending_cursors(&mut self) {
        let front = (self.n_events > 0).then_some(self.front);
        for cursor in self.cursors.iter_mut() {
            if cursor.pending {
                cursor.pending = false;
                cursor.offset = front;
            }
        }
    }

    /// Append a record at the back. Rejected (with a warning) when `time` is
    /// older than the newest record or there is no room.
    pub fn append(&mut self, time: u32, data: &[u8]) -> bool {
        self.append_impl(time, data, false, &mut |_| {})
    }

    /// Append a record, evicting the oldest records if needed to make room.
    /// `dropped` sees every evicted record before it is overwritten.
    pub fn append_replacing<F>(&mut self, time: u32, data: &[u8], mut dropped: F) -> bool
    where
        F: FnMut(MidiRecord<'_>),
    {
        self.append_impl(time, data, true, &mut dropped)
    }

    fn append_impl<F>(&mut self, time: u32, data: &[u8], allow_replace: bool, dropped: &mut F) -> bool
    where
        F: FnMut(MidiRecord<'_>),
    {
        let Some(len) = self.check_size(data) else {
            return false;
        };
        if self.n_events > 0 && self.read_u32(self.last) > time {
            log::warn!("ignoring out-of-order MIDI message at {}", time);
            return false;
        }

        let mut evicted = false;
        let (off, wraps) = loop {
            if let Some(slot) = self.append_slot(len) {
                break slot;
            }
            if !allow_replace {
                log::warn!("ignoring MIDI message at {}: storage full", time);
                return false;
            }
            self.pop_front(dropped);
            evicted = true;
        };
        if evicted {
            self.settle_pending_cursors();
        }

        if self.n_events == 0 {
            self.reset_positions();
        }
        if wraps {
            self.wrap_end = self.back;
            self.wrapped = true;
        }
        self.store(off, time, data);
        self.back = off + len;
        self.last = off;
        self.n_events += 1;
        self.n_bytes += len;
        true
    }

    /// Insert a record before all others. `time` must not be later than the
    /// current oldest record.
    pub fn prepend(&mut self, time: u32, data: &[u8]) -> bool {
        let Some(len) = self.check_size(data) else {
            return false;
        };
        if self.n_events == 0 {
            return self.append(time, data);
        }
        if self.read_u32(self.front) < time {
            log::warn!("ignoring out-of-order MIDI message at {}", time);
            return false;
        }

        let off = if self.wrapped {
            if self.front - self.back < len {
                None
            } else {
                Some(self.front - len)
            }
        } else if self.front >= len {
            Some(self.front - len)
        } else if self.front == 0 && self.arena.len() - self.back >= len {
            self.wrap_end = self.arena.len();
            self.wrapped = true;
            Some(self.arena.len() - len)
        } else {
            None
        };
        let Some(off) = off else {
            log::warn!("ignoring MIDI message at {}: storage full", time);
            return false;
        };

        self.store(off, time, data);
        self.front = off;
        self.n_events += 1;
        self.n_bytes += len;
        true
    }

    /// Remove records on one side of `time`. Cursors on removed records are
    /// moved to the new front (`Head`) or invalidated (`Tail`).
    pub fn truncate<F>(&mut self, time: u32, side: TruncateSide, mut dropped: F)
    where
        F: FnMut(MidiRecord<'_>),
    {
        match side {
            TruncateSide::Head => {
                while self.n_events > 0 && self.read_u32(self.front) < time {
                    self.pop_front(&mut dropped);
                }
            }
            TruncateSide::Tail => self.truncate_tail(time, &mut dropped),
        }

        let generation = self.generation;
        self.generation += 1;
        let front = (self.n_events > 0).then_some(self.front);
        let current = self.generation;
        for cursor in self.cursors.iter_mut() {
            if cursor.generation != generation {
                continue;
            }
            if cursor.pending {
                cursor.pending = false;
                cursor.offset = match side {
                    TruncateSide::Head => front,
                    TruncateSide::Tail => None,
                };
            }
            cursor.generation = current;
        }
    }

    fn truncate_tail<F>(&mut self, time: u32, dropped: &mut F)
    where
        F: FnMut(MidiRecord<'_>),
    {
        if self.n_events == 0 {
            return;
        }

        // Find the first record to remove and the last one to keep.
        let mut kept = 0;
        let mut kept_bytes = 0;
        let mut prev = None;
        let mut cut = Some(self.front);
        while let Some(off) = cut {
            if self.read_u32(off) >= time {
                break;
            }
            kept += 1;
            kept_bytes += self.record_len(off);
            prev = Some(off);
            cut = self.next_offset(off);
        }
        let Some(cut) = cut else {
            return;
        };

        let mut off = Some(cut);
        while let Some(o) = off {
            dropped(self.record_at(o));
            for cursor in self.cursors.iter_mut() {
                if cursor.generation == self.generation && cursor.offset == Some(o) {
                    cursor.pending = true;
                }
            }
            off = self.next_offset(o);
        }

        let Some(last) = prev else {
            self.reset_positions();
            return;
        };
        if self.wrapped && cut >= self.front {
            // Cut inside the upper segment: the lower one is gone entirely.
            self.wrapped = false;
            self.wrap_end = self.arena.len();
        } else if self.wrapped && cut == 0 {
            self.wrapped = false;
            self.back = self.wrap_end;
            self.wrap_end = self.arena.len();
            self.last = last;
            self.n_events = kept;
            self.n_bytes = kept_bytes;
            return;
        }
        self.back = cut;
        self.last = last;
        self.n_events = kept;
        self.n_bytes = kept_bytes;
    }

    /// Drop all records. Every cursor becomes invalid.
    pub fn clear(&mut self) {
        self.reset_positions();
        self.generation += 1;
    }

    pub fn iter(&self) -> MidiStorageIter<'_> {
        MidiStorageIter {
            storage: self,
            next: (self.n_events > 0).then_some(self.front),
        }
    }

    pub fn for_each_msg<F>(&self, mut f: F)
    where
        F: FnMut(MidiRecord<'_>),
    {
        for record in self.iter() {
            f(record);
        }
    }

    /// Replace the contents of `other` with this storage's records.
    /// Returns false if `other` could not hold all of them.
    pub fn copy_to(&self, other: &mut MidiStorage) -> bool {
        other.clear();
        let mut complete = true;
        for record in self.iter() {
            complete &= other.append(record.time, record.data);
        }
        complete
    }

    /// Register a new cursor, positioned at the oldest record.
    pub fn create_cursor(&mut self) -> MidiCursor {
        self.cursors.push(CursorState {
            offset: (self.n_events > 0).then_some(self.front),
            generation: self.generation,
            pending: false,
        });
        MidiCursor(self.cursors.len() - 1)
    }

    fn cursor_offset(&self, cursor: MidiCursor) -> Option<usize> {
        let state = self.cursors.get(cursor.0)?;
        if state.generation != self.generation {
            return None;
        }
        state.offset
    }

    fn set_cursor(&mut self, cursor: MidiCursor, offset: Option<usize>) {
        let generation = self.generation;
        if let Some(state) = self.cursors.get_mut(cursor.0) {
            state.offset = offset;
            state.generation = generation;
            state.pending = false;
        }
    }

    /// Move the cursor to the oldest record, or invalidate it if empty.
    pub fn cursor_reset(&mut self, cursor: MidiCursor) {
        let front = (self.n_events > 0).then_some(self.front);
        self.set_cursor(cursor, front);
    }

    pub fn cursor_valid(&self, cursor: MidiCursor) -> bool {
        self.cursor_offset(cursor).is_some()
    }

    pub fn cursor_get(&self, cursor: MidiCursor) -> Option<MidiRecord<'_>> {
        self.cursor_offset(cursor).map(|off| self.record_at(off))
    }

    pub fn cursor_is_at_start(&self, cursor: MidiCursor) -> bool {
        self.n_events > 0 && self.cursor_offset(cursor) == Some(self.front)
    }

    /// Step to the next record. Past the newest record the cursor becomes
    /// invalid.
    pub fn cursor_next(&mut self, cursor: MidiCursor) {
        let next = self.cursor_offset(cursor).and_then(|off| self.next_offset(off));
        self.set_cursor(cursor, next);
    }

    /// Advance to the first record at or after `time`, handing every
    /// record stepped over to `skipped`. An invalid cursor stays invalid.
    pub fn cursor_find_time_forward<F>(
        &mut self,
        cursor: MidiCursor,
        time: u32,
        mut skipped: F,
    ) -> CursorFindResult
    where
        F: FnMut(MidiRecord<'_>),
    {
        let mut result = CursorFindResult::default();
        let mut current = self.cursor_offset(cursor);
        if current.is_none() {
            return result;
        }
        while let Some(off) = current {
            let record = self.record_at(off);
            if record.time >= time {
                result.found = true;
                break;
            }
            skipped(record);
            result.n_processed += 1;
            current = self.next_offset(off);
        }
        self.set_cursor(cursor, current);
        result
    }
}

pub struct MidiStorageIter<'a> {
    storage: &'a MidiStorage,
    next: Option<usize>,
}

impl<'a> Iterator for MidiStorageIter<'a> {
    type Item = MidiRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let off = self.next?;
        self.next = self.storage.next_offset(off);
        Some(self.storage.record_at(off))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times(storage: &MidiStorage) -> Vec<u32> {
        storage.iter().map(|r| r.time).collect()
    }

    fn note(n: u8) -> [u8; 3] {
        [0x90, n, 100]
    }

    #[test]
    fn test_append_iterate_in_order() {
        let mut storage = MidiStorage::new(256);
        let events: Vec<(u32, Vec<u8>)> = vec![
            (1, vec![0x90, 60, 100]),
            (5, vec![0xC0, 3]),
            (9, vec![0xF0, 1, 2, 3, 4, 0xF7]),
            (20, vec![0x80, 60, 64]),
        ];
        for (t, d) in &events {
            assert!(storage.append(*t, d));
        }
        assert_eq!(storage.n_events(), 4);

        let cursor = storage.create_cursor();
        let mut seen = Vec::new();
        while let Some(record) = storage.cursor_get(cursor) {
            seen.push((record.time, record.data.to_vec()));
            storage.cursor_next(cursor);
        }
        assert_eq!(seen, events);
        assert!(!storage.cursor_valid(cursor));
    }

    #[test]
    fn test_rejects_out_of_order_append() {
        let mut storage = MidiStorage::new(128);
        assert!(storage.append(10, &note(1)));
        assert!(!storage.append(5, &note(2)));
        assert!(storage.append(10, &note(3)));
        assert_eq!(times(&storage), vec![10, 10]);
    }

    #[test]
    fn test_rejects_when_full() {
        // Room for exactly two 3-byte records.
        let mut storage = MidiStorage::new(18);
        assert!(storage.append(0, &note(1)));
        assert!(storage.append(1, &note(2)));
        assert!(!storage.append(2, &note(3)));
        assert_eq!(storage.bytes_free(), 0);
        assert_eq!(times(&storage), vec![0, 1]);
    }

    #[test]
    fn test_append_replacing_evicts_oldest() {
        let mut storage = MidiStorage::new(20);
        let cursor = storage.create_cursor();
        assert!(storage.append(0, &note(1)));
        storage.cursor_reset(cursor);
        assert!(storage.append(1, &note(2)));

        let mut dropped = Vec::new();
        assert!(storage.append_replacing(2, &note(3), |r| dropped.push(r.time)));
        assert_eq!(dropped, vec![0]);
        assert_eq!(times(&storage), vec![1, 2]);
        // The cursor pointed at the evicted record and moved to the front.
        assert_eq!(storage.cursor_get(cursor).map(|r| r.time), Some(1));
        assert!(storage.cursor_is_at_start(cursor));
    }

    #[test]
    fn test_append_replacing_wraps_and_moves_cursors() {
        // Three 9-byte records fill the arena exactly.
        let mut storage = MidiStorage::new(30);
        for t in 0..3 {
            assert!(storage.append(t, &note(t as u8)));
        }
        let at_front = storage.create_cursor();
        let at_second = storage.create_cursor();
        storage.cursor_next(at_second);

        let mut dropped = Vec::new();
        assert!(storage.append_replacing(3, &note(3), |r| dropped.push(r.time)));
        assert_eq!(dropped, vec![0]);
        assert_eq!(times(&storage), vec![1, 2, 3]);
        assert_eq!(storage.cursor_get(at_front).map(|r| r.time), Some(1));
        assert!(storage.cursor_is_at_start(at_front));
        assert_eq!(storage.cursor_get(at_second).map(|r| r.time), Some(1));

        // Now wrapped: the next record goes between the two segments.
        assert!(storage.append_replacing(4, &note(4), |r| dropped.push(r.time)));
        assert_eq!(dropped, vec![0, 1]);
        assert_eq!(times(&storage), vec![2, 3, 4]);
        for cursor in [at_front, at_second] {
            assert_eq!(storage.cursor_get(cursor).map(|r| r.time), Some(2));
        }

        let mut seen = Vec::new();
        while let Some(record) = storage.cursor_get(at_front) {
            seen.push((record.time, record.data[1]));
            storage.cursor_next(at_front);
        }
        assert_eq!(seen, vec![(2, 2), (3, 3), (4, 4)]);
        assert_eq!(storage.bytes_occupied(), 27);
    }

    #[test]
    fn test_wrapped_storage_keeps_order() {
        let mut storage = MidiStorage::new(30);
        for t in 0..3 {
            assert!(storage.append(t, &note(t as u8)));
        }
        storage.truncate(2, TruncateSide::Head, |_| {});
        assert_eq!(times(&storage), vec![2]);
        // Does not fit at the end anymore, wraps to the start.
        assert!(storage.append(3, &note(3)));
        assert!(storage.append(4, &note(4)));
        assert_eq!(times(&storage), vec![2, 3, 4]);

        let mut data = Vec::new();
        storage.for_each_msg(|r| data.push(r.data[1]));
        assert_eq!(data, vec![2, 3, 4]);
    }

    #[test]
    fn test_prepend() {
        let mut storage = MidiStorage::new(64);
        assert!(storage.append(10, &note(1)));
        assert!(!storage.prepend(11, &note(2)));
        // No room before the front yet: wraps to the end of the arena.
        assert!(storage.prepend(5, &note(3)));
        assert!(storage.prepend(5, &note(4)));
        assert_eq!(times(&storage), vec![5, 5, 10]);
        assert!(storage.append(12, &note(5)));
        assert_eq!(times(&storage), vec![5, 5, 10, 12]);
    }

    #[test]
    fn test_truncate_tail_invalidates_cursors() {
        let mut storage = MidiStorage::new(128);
        for t in [1, 4, 8, 12] {
            storage.append(t, &note(t as u8));
        }
        let early = storage.create_cursor();
        let late = storage.create_cursor();
        storage.cursor_find_time_forward(late, 9, |_| {});
        assert_eq!(storage.cursor_get(late).map(|r| r.time), Some(12));

        let mut dropped = Vec::new();
        storage.truncate(8, TruncateSide::Tail, |r| dropped.push(r.time));
        assert_eq!(dropped, vec![8, 12]);
        assert_eq!(times(&storage), vec![1, 4]);
        assert!(!storage.cursor_valid(late));
        assert_eq!(storage.cursor_get(early).map(|r| r.time), Some(1));

        // Appending after the cut works against the new newest record.
        assert!(storage.append(5, &note(5)));
        assert_eq!(times(&storage), vec![1, 4, 5]);
    }

    #[test]
    fn test_truncate_head_repositions_cursors() {
        let mut storage = MidiStorage::new(128);
        for t in [1, 4, 8, 12] {
            storage.append(t, &note(t as u8));
        }
        let at_start = storage.create_cursor();
        let at_end = storage.create_cursor();
        storage.cursor_find_time_forward(at_end, 12, |_| {});

        let mut dropped = Vec::new();
        storage.truncate(5, TruncateSide::Head, |r| dropped.push(r.time));
        assert_eq!(dropped, vec![1, 4]);
        assert_eq!(storage.cursor_get(at_start).map(|r| r.time), Some(8));
        assert_eq!(storage.cursor_get(at_end).map(|r| r.time), Some(12));
    }

    #[test]
    fn test_clear_invalidates_all_cursors() {
        let mut storage = MidiStorage::new(64);
        storage.append(0, &note(1));
        let cursor = storage.create_cursor();
        assert!(storage.cursor_valid(cursor));
        storage.clear();
        assert!(!storage.cursor_valid(cursor));
        storage.append(3, &note(2));
        // Still invalid until explicitly reset.
        assert!(!storage.cursor_valid(cursor));
        storage.cursor_reset(cursor);
        assert_eq!(storage.cursor_get(cursor).map(|r| r.time), Some(3));
    }

    #[test]
    fn test_find_time_forward_reports_skipped() {
        let mut storage = MidiStorage::new(128);
        for t in [0, 2, 4, 6] {
            storage.append(t, &note(t as u8));
        }
        let cursor = storage.create_cursor();
        let mut skipped = Vec::new();
        let result = storage.cursor_find_time_forward(cursor, 3, |r| skipped.push(r.time));
        assert_eq!(skipped, vec![0, 2]);
        assert_eq!(
            result,
            CursorFindResult {
                n_processed: 2,
                found: true
            }
        );

        let result = storage.cursor_find_time_forward(cursor, 100, |_| {});
        assert!(!result.found);
        assert_eq!(result.n_processed, 2);
        assert!(!storage.cursor_valid(cursor));
    }

    #[test]
    fn test_copy_to() {
        let mut storage = MidiStorage::new(64);
        storage.append(1, &note(1));
        storage.append(2, &[0xC0, 4]);
        let mut copy = MidiStorage::new(64);
        copy.append(0, &note(9));
        assert!(storage.copy_to(&mut copy));
        assert_eq!(times(&copy), vec![1, 2]);
        assert_eq!(copy.bytes_occupied(), storage.bytes_occupied());
    }
}
