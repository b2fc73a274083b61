//! SMAPPER: receive buffers the peer writes into directly.
//!
//! The host keeps a set of banks, each an array of equally sized buffers
//! mapped for the peer. Ownership of a bank is negotiated through one mailbox
//! word in the scoreboard: bank `b` uses bit `2b` for the owner (1 = peer)
//! and bit `2b + 1` for whether its entries are mapped.
//!
//! The peer asks for a refill with an interrupt. The host maps every bank it
//! owns, hands it over and answers with the fill interrupt. Filled entries
//! come back as a descriptor inside an `MA_UNITDATA_IND` signal whose bulk
//! data descriptor field says [`BULK_DATA_DESCRIPTOR_SMAPPER`]. Indications
//! marked [`BULK_DATA_DESCRIPTOR_INLINE`] carry their payload in-line and are
//! left alone.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use super::config::{SmapperBankConfig, SmapperConfig};
use crate::error::{HipError, HipResult};
use crate::HIP::Structs::SignalHeader;

/// Bytes of descriptor following the signal header, marker included.
pub const SMAPPER_DESC_LEN: usize = 8;

/// Bulk data descriptor values of an `MA_UNITDATA_IND`.
pub const BULK_DATA_DESCRIPTOR_INLINE: u16 = 0x0000;
pub const BULK_DATA_DESCRIPTOR_SMAPPER: u16 = 0x0001;

/// The bulk data descriptor field of an indication, if the signal is long
/// enough to carry one.
pub fn bulk_data_descriptor(signal: &[u8]) -> Option<u16> {
    let d = signal.get(SignalHeader::LEN..SignalHeader::LEN + 2)?;
    Some(u16::from_le_bytes([d[0], d[1]]))
}

#[inline]
pub fn owner_bit(bank: u8) -> u32 {
    1 << (2 * bank as u32)
}

#[inline]
pub fn mapped_bit(bank: u8) -> u32 {
    1 << (2 * bank as u32 + 1)
}

/// Where a filled payload sits: `len` bytes starting `headroom` bytes into
/// `entry` of `bank`, continuing into the following entries if needed.
///
/// On the wire it follows the signal header as the SMAPPER marker, bank,
/// entry, length and headroom, little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmapperDescriptor {
    pub bank: u8,
    pub entry: u8,
    pub len: u16,
    pub headroom: u16,
}

impl SmapperDescriptor {
    /// `None` unless the signal is marked as carrying a SMAPPER descriptor.
    pub fn parse(signal: &[u8]) -> Option<Self> {
        if bulk_data_descriptor(signal)? != BULK_DATA_DESCRIPTOR_SMAPPER {
            return None;
        }
        let d = signal.get(SignalHeader::LEN..SignalHeader::LEN + SMAPPER_DESC_LEN)?;
        Some(Self {
            bank: d[2],
            entry: d[3],
            len: u16::from_le_bytes([d[4], d[5]]),
            headroom: u16::from_le_bytes([d[6], d[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; SMAPPER_DESC_LEN] {
        let mut out = [0u8; SMAPPER_DESC_LEN];
        out[0..2].copy_from_slice(&BULK_DATA_DESCRIPTOR_SMAPPER.to_le_bytes());
        out[2] = self.bank;
        out[3] = self.entry;
        out[4..6].copy_from_slice(&self.len.to_le_bytes());
        out[6..8].copy_from_slice(&self.headroom.to_le_bytes());
        out
    }
}

/// The mapping hardware: turns host buffers into peer addresses and
/// programs them into a bank's entry table.
pub trait SmapperHw: Send + Sync {
    fn bank_entries(&self, bank: u8) -> usize;
    fn program(&self, bank: u8, entry: u8, dma_addr: u64) -> HipResult<()>;
    fn map(&self, buf: &mut [u8]) -> HipResult<u64>;
    fn unmap(&self, dma_addr: u64);
}

struct SmapperEntry {
    buf: Box<[u8]>,
    dma: u64,
}

struct SmapperBank {
    cfg: SmapperBankConfig,
    entries: Mutex<Vec<Option<SmapperEntry>>>,
}

pub struct Smapper {
    hw: Arc<dyn SmapperHw>,
    banks: Vec<SmapperBank>,
}

impl Smapper {
    pub fn new(config: &SmapperConfig, hw: Arc<dyn SmapperHw>) -> HipResult<Self> {
        let mut banks = Vec::with_capacity(config.banks.len());
        for cfg in &config.banks {
            let hw_entries = hw.bank_entries(cfg.bank);
            if hw_entries < cfg.entries as usize {
                return Err(HipError::Smapper(format!(
                    "bank {} has {} entries, {} configured",
                    cfg.bank, hw_entries, cfg.entries
                )));
            }
            banks.push(SmapperBank {
                cfg: *cfg,
                entries: Mutex::new((0..cfg.entries).map(|_| None).collect()),
            });
        }
        Ok(Self { hw, banks })
    }

    pub fn banks(&self) -> impl Iterator<Item = &SmapperBankConfig> {
        self.banks.iter().map(|b| &b.cfg)
    }

    fn bank(&self, id: u8) -> Option<&SmapperBank> {
        self.banks.iter().find(|b| b.cfg.bank == id)
    }

    fn fill_entry(&self, bank: &SmapperBankConfig, entry: u8) -> HipResult<SmapperEntry> {
        let mut buf = vec![0u8; bank.entry_size()].into_boxed_slice();
        let dma = self.hw.map(&mut buf)?;
        if let Err(e) = self.hw.program(bank.bank, entry, dma) {
            self.hw.unmap(dma);
            return Err(e);
        }
        Ok(SmapperEntry { buf, dma })
    }

    /// Map every missing entry of every host-owned bank and hand the banks to
    /// the peer. A bank that could not be fully mapped goes back unmapped and
    /// is retried the next time the peer returns it. Returns the banks mapped.
    pub fn refill(&self, mailbox: &AtomicU32) -> usize {
        let mut mapped = 0;
        for bank in &self.banks {
            let id = bank.cfg.bank;
            if mailbox.load(Ordering::Acquire) & owner_bit(id) != 0 {
                continue;
            }

            let mut complete = true;
            {
                let mut entries = bank.entries.lock();
                for (index, slot) in entries.iter_mut().enumerate() {
                    if slot.is_some() {
                        continue;
                    }
                    match self.fill_entry(&bank.cfg, index as u8) {
                        Ok(entry) => *slot = Some(entry),
                        Err(e) => {
                            warn!("smapper: bank {} entry {}: {}", id, index, e);
                            complete = false;
                            break;
                        }
                    }
                }
            }

            if complete {
                mailbox.fetch_or(owner_bit(id) | mapped_bit(id), Ordering::AcqRel);
                mapped += 1;
                debug!("smapper: bank {} mapped, owner peer", id);
            } else {
                mailbox.fetch_and(!mapped_bit(id), Ordering::AcqRel);
                mailbox.fetch_or(owner_bit(id), Ordering::AcqRel);
                warn!("smapper: bank {} left unmapped", id);
            }
        }
        mapped
    }

    /// Detach the payload a descriptor signal points at and backfill the
    /// entries it used. `Ok(None)` means the signal is not a descriptor.
    pub fn consume(&self, signal: &[u8]) -> HipResult<Option<Vec<u8>>> {
        match bulk_data_descriptor(signal) {
            Some(BULK_DATA_DESCRIPTOR_SMAPPER) => {}
            _ => return Ok(None),
        }
        let desc = SmapperDescriptor::parse(signal)
            .ok_or_else(|| HipError::Smapper(format!("truncated descriptor in {} byte signal", signal.len())))?;
        let bank = self
            .bank(desc.bank)
            .ok_or_else(|| HipError::Smapper(format!("descriptor names unknown bank {}", desc.bank)))?;
        let entry_size = bank.cfg.entry_size();
        let headroom = desc.headroom as usize;
        let len = desc.len as usize;
        if headroom >= entry_size || len == 0 {
            return Err(HipError::Smapper(format!("bad descriptor {:?}", desc)));
        }
        let first = entry_size - headroom;
        let span = if len <= first { 1 } else { 1 + (len - first).div_ceil(entry_size) };
        let mut entries = bank.entries.lock();
        if desc.entry as usize + span > entries.len() {
            return Err(HipError::Smapper(format!(
                "descriptor {:?} runs past the {} entries of bank {}",
                desc,
                entries.len(),
                desc.bank
            )));
        }
        if entries[desc.entry as usize..desc.entry as usize + span]
            .iter()
            .any(Option::is_none)
        {
            return Err(HipError::Smapper(format!("descriptor {:?} names an empty entry", desc)));
        }

        let mut payload = Vec::new();
        for i in 0..span {
            let index = desc.entry as usize + i;
            let Some(taken) = entries[index].take() else {
                continue;
            };
            self.hw.unmap(taken.dma);
            match self.fill_entry(&bank.cfg, index as u8) {
                Ok(fresh) => entries[index] = Some(fresh),
                Err(e) => warn!("smapper: backfill of bank {} entry {}: {}", desc.bank, index, e),
            }

            let mut buf = taken.buf.into_vec();
            if span == 1 {
                // Single entry: hand over the buffer itself
                buf.truncate(headroom + len);
                buf.drain(..headroom);
                return Ok(Some(buf));
            }
            let start = if i == 0 { headroom } else { 0 };
            let want = (len - payload.len()).min(entry_size - start);
            payload.extend_from_slice(&buf[start..start + want]);
        }
        Ok(Some(payload))
    }

    /// Unmap everything; used at teardown.
    pub fn release(&self, mailbox: Option<&AtomicU32>) {
        for bank in &self.banks {
            for slot in bank.entries.lock().iter_mut() {
                if let Some(entry) = slot.take() {
                    self.hw.unmap(entry.dma);
                }
            }
            if let Some(mailbox) = mailbox {
                let id = bank.cfg.bank;
                mailbox.fetch_and(!(owner_bit(id) | mapped_bit(id)), Ordering::AcqRel);
            }
        }
    }

    pub fn mapped_entries(&self, bank: u8) -> usize {
        self.bank(bank)
            .map(|b| b.entries.lock().iter().filter(|e| e.is_some()).count())
            .unwrap_or(0)
    }
}

impl fmt::Debug for Smapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Smapper")
            .field("banks", &self.banks.iter().map(|b| b.cfg.bank).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// In-process mapping hardware. The "DMA address" is the buffer's address,
/// and the peer side writes through [`SoftSmapper::write_entry`].
pub struct SoftSmapper {
    entries_per_bank: usize,
    table: Mutex<HashMap<(u8, u8), u64>>,
    mapped: Mutex<HashMap<u64, usize>>,
    fail_maps: AtomicU32,
}

impl SoftSmapper {
    pub fn new(entries_per_bank: usize) -> Arc<Self> {
        Arc::new(Self {
            entries_per_bank,
            table: Mutex::new(HashMap::new()),
            mapped: Mutex::new(HashMap::new()),
            fail_maps: AtomicU32::new(0),
        })
    }

    /// The next `n` calls to `map` fail.
    pub fn fail_next_maps(&self, n: u32) {
        self.fail_maps.store(n, Ordering::SeqCst);
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped.lock().len()
    }

    /// Peer side: write `data` into a programmed entry at `offset`.
    pub fn write_entry(&self, bank: u8, entry: u8, offset: usize, data: &[u8]) -> HipResult<()> {
        let dma = *self
            .table
            .lock()
            .get(&(bank, entry))
            .ok_or_else(|| HipError::Smapper(format!("bank {} entry {} not programmed", bank, entry)))?;
        let mapped = self.mapped.lock();
        let len = *mapped
            .get(&dma)
            .ok_or_else(|| HipError::Smapper(format!("{:#x} not mapped", dma)))?;
        if offset + data.len() > len {
            return Err(HipError::Smapper(format!(
                "write of {} bytes at {} past a {} byte entry",
                data.len(),
                offset,
                len
            )));
        }
        // Entry buffers stay allocated while mapped, and the lock keeps unmap out
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), (dma as usize as *mut u8).add(offset), data.len());
        }
        Ok(())
    }
}

impl SmapperHw for SoftSmapper {
    fn bank_entries(&self, _bank: u8) -> usize {
        self.entries_per_bank
    }

    fn program(&self, bank: u8, entry: u8, dma_addr: u64) -> HipResult<()> {
        if entry as usize >= self.entries_per_bank {
            return Err(HipError::Smapper(format!("entry {} out of range", entry)));
        }
        self.table.lock().insert((bank, entry), dma_addr);
        Ok(())
    }

    fn map(&self, buf: &mut [u8]) -> HipResult<u64> {
        let failed = self
            .fail_maps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(HipError::Smapper("mapping failed".into()));
        }
        let dma = buf.as_mut_ptr() as usize as u64;
        self.mapped.lock().insert(dma, buf.len());
        Ok(dma)
    }

    fn unmap(&self, dma_addr: u64) {
        self.mapped.lock().remove(&dma_addr);
        self.table.lock().retain(|_, v| *v != dma_addr);
    }
}

impl fmt::Debug for SoftSmapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftSmapper")
            .field("entries_per_bank", &self.entries_per_bank)
            .field("mapped", &self.mapped_count())
            .finish()
    }
}
