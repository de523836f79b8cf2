//! The per-move command history ring used to catch up out-of-sync slaves.

use crate::id::MAX_CMDS_PER_MOVE;

/// One remembered command: the id it was minted with, and a byte offset
/// into the command buffer for whatever command followed it (`None` until
/// a successor is published).
///
/// The original C implementation stores a raw `char *` pointer into the
/// command buffer here; since the buffer is fixed-capacity, a byte offset
/// is exactly as stable and avoids the buffer-mutation-invalidates-pointer
/// hazard that representation would otherwise carry in Rust.
#[derive(Debug, Clone, Copy)]
pub struct HistorySlot {
    pub gtp_id: i64,
    pub next_cmd: Option<usize>,
}

impl Default for HistorySlot {
    fn default() -> Self {
        Self {
            gtp_id: -1,
            next_cmd: None,
        }
    }
}

/// `history[move][slot]` from the spec: a two-dimensional table indexed by
/// move number and a round-robin slot.
pub struct History {
    rows: Vec<[HistorySlot; MAX_CMDS_PER_MOVE]>,
    /// Rolling slot cursor, shared across moves (not reset when the move
    /// number changes). Since at most `MAX_CMDS_PER_MOVE` commands are ever
    /// issued for a single move, this still guarantees the slots used
    /// within one move are the `MAX_CMDS_PER_MOVE` consecutive values mod
    /// `MAX_CMDS_PER_MOVE`, hence always distinct; it also means the ring
    /// degrades gracefully (oldest slot aliased) if that budget is
    /// overrun, exactly as spec'd.
    next_slot: usize,
    last_written: Option<(usize, usize)>,
}

impl History {
    pub fn new(max_gamelen: usize) -> Self {
        Self {
            rows: vec![[HistorySlot::default(); MAX_CMDS_PER_MOVE]; max_gamelen],
            next_slot: 0,
            last_written: None,
        }
    }

    pub fn clear(&mut self) {
        for row in &mut self.rows {
            *row = [HistorySlot::default(); MAX_CMDS_PER_MOVE];
        }
        self.next_slot = 0;
        self.last_written = None;
    }

    pub fn slot(&self, mv: usize, slot: usize) -> HistorySlot {
        self.rows[mv][slot]
    }

    /// Looks up the slot whose `gtp_id` equals `id` within move `mv`.
    pub fn find(&self, mv: usize, id: i64) -> Option<HistorySlot> {
        self.rows[mv].iter().find(|s| s.gtp_id == id).copied()
    }

    /// Allocates the next round-robin slot for move `mv`, linking the
    /// previously-written slot's `next_cmd` to `at`, and records that this
    /// new slot (carrying `id`) starts at `at`. Returns `(mv, slot)` for
    /// later lookups.
    pub fn push(&mut self, mv: usize, id: i64, at: usize) -> (usize, usize) {
        if let Some((pm, ps)) = self.last_written {
            self.rows[pm][ps].next_cmd = Some(at);
        }
        let slot = self.next_slot;
        self.next_slot = (self.next_slot + 1) % MAX_CMDS_PER_MOVE;
        self.rows[mv][slot] = HistorySlot {
            gtp_id: id,
            next_cmd: None,
        };
        self.last_written = Some((mv, slot));
        (mv, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_links_previous_slot_to_the_new_offset() {
        let mut h = History::new(4);
        h.push(0, 100, 10);
        h.push(0, 101, 20);

        let first = h.find(0, 100).unwrap();
        assert_eq!(first.next_cmd, Some(20));
        let second = h.find(0, 101).unwrap();
        assert_eq!(second.next_cmd, None);
    }

    #[test]
    fn overflow_within_a_move_wraps_and_aliases_the_oldest_slot() {
        let mut h = History::new(4);
        for i in 0..(MAX_CMDS_PER_MOVE as i64 + 1) {
            h.push(0, i, i as usize);
        }
        // id 0 was issued first and should have been overwritten by id
        // MAX_CMDS_PER_MOVE wrapping back to slot 0.
        assert!(h.find(0, 0).is_none());
        assert!(h.find(0, MAX_CMDS_PER_MOVE as i64).is_some());
    }

    #[test]
    fn clear_resets_everything() {
        let mut h = History::new(4);
        h.push(0, 7, 1);
        h.clear();
        assert!(h.find(0, 7).is_none());
    }
}
