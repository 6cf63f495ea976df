//! Physical Region Page resolution.
//!
//! `(PRP1, PRP2, length)` resolves to either a scatter list over guest
//! physical memory or a segment list over the CMB, chosen by where PRP1
//! points. The two never mix within one command; a CMB-mode command whose
//! list names an address outside the window is malformed.

use memory::MemoryBus;

use crate::cmb::Cmb;
use crate::regs::{NVME_DNR, NVME_INVALID_FIELD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    pub addr: u64,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmbSegment {
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrpMapping {
    Sg(Vec<SgSegment>),
    Cmb(Vec<CmbSegment>),
}

impl PrpMapping {
    pub fn total_len(&self) -> u64 {
        match self {
            PrpMapping::Sg(segs) => segs.iter().map(|s| s.len as u64).sum(),
            PrpMapping::Cmb(segs) => segs.iter().map(|s| s.len as u64).sum(),
        }
    }
}

/// Read guest-addressed controller data, honouring the CMB window.
pub(crate) fn addr_read(cmb: Option<&Cmb>, mem: &mut dyn MemoryBus, addr: u64, buf: &mut [u8]) {
    match cmb {
        Some(cmb) if cmb.contains(addr, buf.len() as u64) => {
            cmb.read(cmb.offset_of(addr), buf);
        }
        _ => mem.read_physical(addr, buf),
    }
}

enum Builder {
    Sg(Vec<SgSegment>),
    Cmb(Vec<CmbSegment>),
}

impl Builder {
    fn push(&mut self, cmb: Option<&Cmb>, addr: u64, len: u64) -> Result<(), u16> {
        match self {
            Builder::Sg(segs) => {
                segs.push(SgSegment {
                    addr,
                    len: len as u32,
                });
                Ok(())
            }
            Builder::Cmb(segs) => {
                let cmb = cmb.expect("CMB mode without CMB");
                if !cmb.contains(addr, len) {
                    tracing::warn!(target: "nvme", addr, "PRP entry outside CMB in CMB-mode command");
                    return Err(NVME_INVALID_FIELD | NVME_DNR);
                }
                segs.push(CmbSegment {
                    offset: cmb.offset_of(addr),
                    len: len as usize,
                });
                Ok(())
            }
        }
    }
}

/// Translate a PRP pair into a mapping covering exactly `len` bytes.
///
/// Failure destroys any partial mapping and reports `INVALID_FIELD|DNR`.
pub(crate) fn map_prp(
    page_size: u64,
    max_prp_ents: usize,
    cmb: Option<&Cmb>,
    mem: &mut dyn MemoryBus,
    prp1: u64,
    prp2: u64,
    len: u64,
) -> Result<PrpMapping, u16> {
    if prp1 == 0 {
        tracing::warn!(target: "nvme", "null PRP1");
        return Err(NVME_INVALID_FIELD | NVME_DNR);
    }

    let mut builder = match cmb {
        Some(c) if c.contains(prp1, 1) => Builder::Cmb(Vec::new()),
        _ => Builder::Sg(Vec::new()),
    };

    let first = (page_size - (prp1 % page_size)).min(len);
    builder.push(cmb, prp1, first)?;
    let mut remaining = len - first;

    if remaining > 0 {
        if prp2 == 0 {
            tracing::warn!(target: "nvme", "PRP2 missing with data remaining");
            return Err(NVME_INVALID_FIELD | NVME_DNR);
        }
        if remaining > page_size {
            let mut list = read_prp_list(page_size, max_prp_ents, cmb, mem, prp2, remaining);
            let mut i = 0;
            while remaining != 0 {
                let mut prp_ent = list[i];

                // The final slot of a full list page chains to the next page.
                if i == max_prp_ents - 1 && remaining > page_size {
                    if prp_ent == 0 || prp_ent % page_size != 0 {
                        tracing::warn!(target: "nvme", prp_ent, "invalid PRP list chain entry");
                        return Err(NVME_INVALID_FIELD | NVME_DNR);
                    }
                    list = read_prp_list(page_size, max_prp_ents, cmb, mem, prp_ent, remaining);
                    i = 0;
                    prp_ent = list[i];
                }

                if prp_ent == 0 || prp_ent % page_size != 0 {
                    tracing::warn!(target: "nvme", prp_ent, "invalid PRP list entry");
                    return Err(NVME_INVALID_FIELD | NVME_DNR);
                }

                let trans = remaining.min(page_size);
                builder.push(cmb, prp_ent, trans)?;
                remaining -= trans;
                i += 1;
            }
        } else {
            if prp2 % page_size != 0 {
                tracing::warn!(target: "nvme", prp2, "misaligned PRP2");
                return Err(NVME_INVALID_FIELD | NVME_DNR);
            }
            builder.push(cmb, prp2, remaining)?;
        }
    }

    Ok(match builder {
        Builder::Sg(segs) => PrpMapping::Sg(segs),
        Builder::Cmb(segs) => PrpMapping::Cmb(segs),
    })
}

impl crate::NvmeController {
    pub(crate) fn map_prp_cmd(
        &mut self,
        mem: &mut dyn MemoryBus,
        prp1: u64,
        prp2: u64,
        len: u64,
    ) -> Result<PrpMapping, u16> {
        map_prp(
            self.page_size,
            self.max_prp_ents,
            self.cmb.as_ref(),
            mem,
            prp1,
            prp2,
            len,
        )
    }

    /// Transfer controller data to the guest buffer named by a PRP pair.
    pub(crate) fn dma_read_prp(
        &mut self,
        mem: &mut dyn MemoryBus,
        data: &[u8],
        prp1: u64,
        prp2: u64,
    ) -> u16 {
        tracing::trace!(target: "nvme", prp1, prp2, len = data.len(), "DMA read");
        match self.map_prp_cmd(mem, prp1, prp2, data.len() as u64) {
            Ok(mapping) => {
                self.copy_to_mapping(mem, &mapping, data);
                crate::regs::NVME_SUCCESS
            }
            Err(status) => status,
        }
    }

    /// Fill a controller buffer from the guest memory named by a PRP pair.
    pub(crate) fn dma_write_prp(
        &mut self,
        mem: &mut dyn MemoryBus,
        data: &mut [u8],
        prp1: u64,
        prp2: u64,
    ) -> u16 {
        match self.map_prp_cmd(mem, prp1, prp2, data.len() as u64) {
            Ok(mapping) => {
                self.copy_from_mapping(mem, &mapping, data);
                crate::regs::NVME_SUCCESS
            }
            Err(status) => status,
        }
    }

    pub(crate) fn copy_to_mapping(
        &mut self,
        mem: &mut dyn MemoryBus,
        mapping: &PrpMapping,
        data: &[u8],
    ) {
        let mut off = 0usize;
        match mapping {
            PrpMapping::Sg(segs) => {
                for seg in segs {
                    let len = seg.len as usize;
                    mem.write_physical(seg.addr, &data[off..off + len]);
                    off += len;
                }
            }
            PrpMapping::Cmb(segs) => {
                let cmb = self.cmb.as_mut().expect("CMB mapping without CMB");
                for seg in segs {
                    cmb.write(seg.offset, &data[off..off + seg.len]);
                    off += seg.len;
                }
            }
        }
    }

    pub(crate) fn copy_from_mapping(
        &mut self,
        mem: &mut dyn MemoryBus,
        mapping: &PrpMapping,
        data: &mut [u8],
    ) {
        let mut off = 0usize;
        match mapping {
            PrpMapping::Sg(segs) => {
                for seg in segs {
                    let len = seg.len as usize;
                    mem.read_physical(seg.addr, &mut data[off..off + len]);
                    off += len;
                }
            }
            PrpMapping::Cmb(segs) => {
                let cmb = self.cmb.as_ref().expect("CMB mapping without CMB");
                for seg in segs {
                    cmb.read(seg.offset, &mut data[off..off + seg.len]);
                    off += seg.len;
                }
            }
        }
    }
}

fn read_prp_list(
    page_size: u64,
    max_prp_ents: usize,
    cmb: Option<&Cmb>,
    mem: &mut dyn MemoryBus,
    list_addr: u64,
    remaining: u64,
) -> Vec<u64> {
    let nents = (remaining + page_size - 1) / page_size;
    let count = (nents as usize).min(max_prp_ents);
    let mut bytes = vec![0u8; count * 8];
    addr_read(cmb, mem, list_addr, &mut bytes);
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct TestMem {
        buf: Vec<u8>,
    }

    impl MemoryBus for TestMem {
        fn read_physical(&mut self, paddr: u64, out: &mut [u8]) {
            let start = paddr as usize;
            out.copy_from_slice(&self.buf[start..start + out.len()]);
        }

        fn write_physical(&mut self, paddr: u64, data: &[u8]) {
            let start = paddr as usize;
            self.buf[start..start + data.len()].copy_from_slice(data);
        }
    }

    const PAGE: u64 = 4096;
    const MAX_ENTS: usize = (PAGE / 8) as usize;

    fn mem() -> TestMem {
        TestMem {
            buf: vec![0u8; 4 * 1024 * 1024],
        }
    }

    fn sg(mapping: PrpMapping) -> Vec<SgSegment> {
        match mapping {
            PrpMapping::Sg(segs) => segs,
            PrpMapping::Cmb(_) => panic!("expected guest mapping"),
        }
    }

    #[test]
    fn single_page() {
        let mut m = mem();
        let segs = sg(map_prp(PAGE, MAX_ENTS, None, &mut m, 0x2000, 0, 512).unwrap());
        assert_eq!(
            segs,
            vec![SgSegment {
                addr: 0x2000,
                len: 512
            }]
        );
    }

    #[test]
    fn offset_first_page_plus_prp2() {
        let mut m = mem();
        // 0x100 into the first page: 0xF00 bytes there, remainder on PRP2.
        let segs = sg(map_prp(PAGE, MAX_ENTS, None, &mut m, 0x2100, 0x5000, 0x1000).unwrap());
        assert_eq!(segs[0].addr, 0x2100);
        assert_eq!(segs[0].len, 0xF00);
        assert_eq!(segs[1].addr, 0x5000);
        assert_eq!(segs[1].len, 0x100);
    }

    #[test]
    fn null_prp1_rejected() {
        let mut m = mem();
        assert!(map_prp(PAGE, MAX_ENTS, None, &mut m, 0, 0, 512).is_err());
    }

    #[test]
    fn missing_prp2_rejected() {
        let mut m = mem();
        assert!(map_prp(PAGE, MAX_ENTS, None, &mut m, 0x2000, 0, PAGE + 1).is_err());
    }

    #[test]
    fn misaligned_prp2_rejected() {
        let mut m = mem();
        assert!(map_prp(PAGE, MAX_ENTS, None, &mut m, 0x2000, 0x5004, 2 * PAGE).is_err());
    }

    #[test]
    fn prp_list_walk() {
        let mut m = mem();
        // 3 pages: first via PRP1, two via a list at 0x8000.
        m.write_physical(0x8000, &0x10000u64.to_le_bytes());
        m.write_physical(0x8008, &0x11000u64.to_le_bytes());
        let segs = sg(map_prp(PAGE, MAX_ENTS, None, &mut m, 0x2000, 0x8000, 3 * PAGE).unwrap());
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[1].addr, 0x10000);
        assert_eq!(segs[2].addr, 0x11000);
        assert!(segs.iter().all(|s| s.len == PAGE as u32));
    }

    #[test]
    fn chained_list_pages() {
        let mut m = mem();
        // Transfer large enough that the last list slot chains to a second
        // list page: (MAX_ENTS + 4) data pages after the first.
        let data_pages = MAX_ENTS + 4;
        let len = PAGE + data_pages as u64 * PAGE;

        let list1 = 0x100000u64;
        let list2 = 0x200000u64;
        for i in 0..MAX_ENTS - 1 {
            let addr = 0x300000u64 + i as u64 * PAGE;
            m.write_physical(list1 + i as u64 * 8, &addr.to_le_bytes());
        }
        m.write_physical(list1 + (MAX_ENTS as u64 - 1) * 8, &list2.to_le_bytes());
        let left = data_pages - (MAX_ENTS - 1);
        for i in 0..left {
            let addr = 0x380000u64 + i as u64 * PAGE;
            m.write_physical(list2 + i as u64 * 8, &addr.to_le_bytes());
        }

        let segs = sg(map_prp(PAGE, MAX_ENTS, None, &mut m, 0x2000, list1, len).unwrap());
        assert_eq!(segs.len(), 1 + data_pages);
        assert_eq!(segs.last().unwrap().addr, 0x380000 + (left as u64 - 1) * PAGE);
        assert_eq!(segs.iter().map(|s| s.len as u64).sum::<u64>(), len);
    }

    #[test]
    fn zero_list_entry_rejected() {
        let mut m = mem();
        m.write_physical(0x8000, &0x10000u64.to_le_bytes());
        // Second entry left zero.
        assert!(map_prp(PAGE, MAX_ENTS, None, &mut m, 0x2000, 0x8000, 3 * PAGE).is_err());
    }

    proptest! {
        // Sum of segment lengths equals the request; every segment after the
        // first is page-aligned and at most one page.
        #[test]
        fn mapping_invariants(
            prp1_off in 0u64..PAGE,
            pages in 1u64..24,
            tail in 1u64..=PAGE,
        ) {
            let mut m = mem();
            let prp1 = 0x2000 + prp1_off;
            let len = (pages - 1) * PAGE + tail;

            let first = (PAGE - (prp1 % PAGE)).min(len);
            let remaining = len - first;
            let list_base = 0x80000u64;
            let prp2 = if remaining == 0 {
                0
            } else if remaining <= PAGE {
                0x40000
            } else {
                let nents = (remaining + PAGE - 1) / PAGE;
                for i in 0..nents {
                    let addr = 0x100000u64 + i * PAGE;
                    m.write_physical(list_base + i * 8, &addr.to_le_bytes());
                }
                list_base
            };

            let mapping = map_prp(PAGE, MAX_ENTS, None, &mut m, prp1, prp2, len).unwrap();
            let segs = sg(mapping);
            prop_assert_eq!(segs.iter().map(|s| s.len as u64).sum::<u64>(), len);
            for seg in &segs[1..] {
                prop_assert_eq!(seg.addr % PAGE, 0);
                prop_assert!(seg.len as u64 <= PAGE);
            }
        }
    }
}
