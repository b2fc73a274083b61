use super::*;

/// Read-only views of pool geometry for diagnostics.
impl MbulkAllocator {
    /// `(base, end, byte_per_block, segment count, guard)` of a pool.
    pub fn pool_geometry(&self, pool_id: u8) -> Option<(usize, usize, usize, u32, u32)> {
        let pools = self.pools.lock();
        pools
            .get(pool_id as usize)?
            .as_ref()
            .map(|p| (p.base, p.end, p.byte_per_block, p.tot_seg_num, p.guard))
    }

    /// Ids of the pools currently valid.
    pub fn pool_ids(&self) -> Vec<u8> {
        self.pools
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_some())
            .map(|(i, _)| i as u8)
            .collect()
    }

    /// Pool owning the segment that starts at `r`, judged by address only.
    pub fn pool_of(&self, r: MifRef) -> Option<u8> {
        self.pools
            .lock()
            .iter()
            .position(|p| p.as_ref().map_or(false, |p| p.index_of(r.offset()).is_some()))
            .map(|i| i as u8)
    }
}
