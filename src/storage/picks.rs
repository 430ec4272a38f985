//! Piece-selection hints that bias the picker toward closing merge gaps.

use super::engine::ContentEngine;
use crate::bitfield::Bitfield;

impl ContentEngine {
    /// Of the pieces in `choices`, selects one that helps merge staged
    /// data.
    ///
    /// The first piece that would bridge a real file's written prefix
    /// directly into the staging file after it wins outright. Failing
    /// that, `preference` wins when it falls inside a merge gap; then a
    /// random choice from the gap; then a random choice from the next gap
    /// over; and finally `preference` as-is.
    pub fn choose_piece(
        &self,
        choices: &Bitfield,
        available: &Bitfield,
        preference: usize,
    ) -> usize {
        let piece_length = self.piece_length;
        let mut needs = Bitfield::new(self.npieces);
        let mut needs_next = Bitfield::new(self.npieces);

        let mut cur = self.chain.head();
        while let Some(id) = cur {
            let node = self.chain.node(id);
            cur = node.next_real;

            let Some(next) = node.next else { continue };
            if !self.chain.node(next).is_staging() {
                continue;
            }
            let gap_end = self.chain.node(next).offset;

            // the next piece of this file extends it toward the staged data
            let index = (node.data_end() / piece_length) as usize;
            if available.is_set(index) && gap_end <= node.data_end() + piece_length {
                // this one piece bridges into the staging file
                return index;
            }
            if choices.is_set(preference)
                && preference as u64 * piece_length >= node.offset
                && (preference as u64 * piece_length) < gap_end
            {
                return preference;
            }
            let mut i = index as u64;
            while i * piece_length < gap_end {
                if choices.is_set(i as usize) {
                    needs.set(i as usize);
                }
                i += 1;
            }

            if needs.is_empty() {
                // secondary: the next staging gap of the same file
                let mut at = next;
                'gaps: loop {
                    let node = self.chain.node(at);
                    let Some(after) = node.next else { break };
                    if !self.chain.node(after).is_staging() {
                        break;
                    }
                    let mut i = node.data_end() / piece_length;
                    let mut found = false;
                    while i * piece_length < self.chain.node(after).offset {
                        if choices.is_set(i as usize) {
                            needs_next.set(i as usize);
                            found = true;
                        }
                        i += 1;
                    }
                    if found {
                        break 'gaps;
                    }
                    at = after;
                }
            }
        }

        if let Some(pick) = needs.random() {
            return pick;
        }
        if needs_next.is_empty() || needs_next.is_set(preference) {
            preference
        } else {
            needs_next.random().unwrap_or(preference)
        }
    }

    /// Fills `filter` with every piece that does NOT belong to file
    /// `index` - a mask selecting everything but that file. A file ending
    /// exactly on a piece boundary leaves the boundary piece to the
    /// earlier file. An out-of-range index clears the filter.
    pub fn set_filter(&self, index: usize, filter: &mut Bitfield, piece_length: u64) {
        let Some((offset, real)) = self.files.get(index).and_then(|&id| {
            let node = self.chain.node(id);
            node.as_real().map(|r| (node.offset, r))
        }) else {
            filter.clear();
            return;
        };

        if real.length == 0 {
            filter.set_all();
            return;
        }
        let start = offset / piece_length;
        let mut stop = (offset + real.length) / piece_length;
        if stop > start && (offset + real.length) % piece_length == 0 {
            stop -= 1;
        }
        filter.set_all();
        for piece in start..=stop {
            filter.unset(piece as usize);
        }
    }
}
