// One fixed-size segment slab. All methods run under the allocator lock.

use super::{Colour, MBULK_CLASS_MAX};

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Tracker {
    pub colour: Colour,
    pub clas: u8,
    pub allocated: bool,
}

#[derive(Debug)]
pub(crate) struct MbulkPool {
    /// Region offset of the first segment
    pub base: usize,
    /// Region offset one past the last segment
    pub end: usize,
    /// Usable bytes per segment (signal + data)
    pub seg_size: usize,
    /// Segment stride including header, rounded to `MBULK_ALIGN`
    pub byte_per_block: usize,
    pub tot_seg_num: u32,
    /// Allocation fails once this many or fewer segments remain
    pub guard: u32,
    free: Vec<u32>,
    usage: [u32; MBULK_CLASS_MAX],
    tracker: Vec<Tracker>,
}

impl MbulkPool {
    pub fn new(base: usize, seg_count: u32, seg_size: usize, byte_per_block: usize, guard: u32) -> Self {
        // Highest index is handed out first
        let free: Vec<u32> = (0..seg_count).collect();
        Self {
            base,
            end: base + seg_count as usize * byte_per_block,
            seg_size,
            byte_per_block,
            tot_seg_num: seg_count,
            guard,
            free,
            usage: [0; MBULK_CLASS_MAX],
            tracker: vec![Tracker::default(); seg_count as usize],
        }
    }

    #[inline]
    pub fn offset_of(&self, index: u32) -> usize {
        self.base + index as usize * self.byte_per_block
    }

    /// Segment index for a region offset, if it is the start of one of ours.
    pub fn index_of(&self, offset: usize) -> Option<u32> {
        if offset < self.base || offset >= self.end {
            return None;
        }
        let rel = offset - self.base;
        if rel % self.byte_per_block != 0 {
            return None;
        }
        Some((rel / self.byte_per_block) as u32)
    }

    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.base && offset < self.end
    }

    pub fn get(&mut self, clas: u8, colour: Colour) -> Option<u32> {
        if self.free.len() as u32 <= self.guard {
            return None;
        }
        let index = self.free.pop()?;
        let slot = &mut self.tracker[index as usize];
        slot.allocated = true;
        slot.colour = colour;
        slot.clas = clas;
        if let Some(u) = self.usage.get_mut(clas as usize) {
            *u += 1;
        }
        Some(index)
    }

    /// Returns false when the segment was already free. The class comes
    /// from the tracker, not the header the peer could have rewritten.
    pub fn put(&mut self, index: u32) -> bool {
        let slot = match self.tracker.get_mut(index as usize) {
            Some(slot) if slot.allocated => slot,
            _ => return false,
        };
        slot.allocated = false;
        if let Some(u) = self.usage.get_mut(slot.clas as usize) {
            *u = u.saturating_sub(1);
        }
        self.free.push(index);
        true
    }

    pub fn colour(&self, index: u32) -> Option<Colour> {
        self.tracker
            .get(index as usize)
            .filter(|t| t.allocated)
            .map(|t| t.colour)
    }

    pub fn free_cnt(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.tot_seg_num as usize - self.free.len()
    }

    pub fn usage(&self, clas: u8) -> u32 {
        self.usage.get(clas as usize).copied().unwrap_or(0)
    }
}
