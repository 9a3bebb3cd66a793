use std::sync::LazyLock;

use nonempty::NonEmpty;
use regex::Regex;

use crate::DfuError;

static SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\*(\d+)\s*([BKM]?)\s*([a-g])\s*$").unwrap()
});
static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*0[xX]([\da-fA-F]+)U?\s*$").unwrap());

/// Memory map of one alternate setting, ST UM0424 section 4.3.2
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DfuMemory {
    pub name: String,
    pub segments: NonEmpty<DfuMemSegment>,
}

/// Run of equally sized pages sharing the same permissions
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DfuMemSegment {
    start_addr: u32,
    end_addr: u32,
    page_size: u32,
    mem_type: u8,
}

impl DfuMemory {
    /// Segment holding `addr`
    pub fn find_segment(&self, addr: u32) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    pub(crate) fn find_segment_mut(
        &mut self,
        addr: u32,
    ) -> Option<&mut DfuMemSegment> {
        self.segments.iter_mut().find(|s| s.contains(addr))
    }

    /// Segments overlapping `start_address..end_address`
    pub fn find_segments(
        &self,
        start_address: u32,
        end_address: u32,
    ) -> Vec<DfuMemSegment> {
        self.segments
            .iter()
            .filter(|s| s.overlaps(start_address, end_address))
            .cloned()
            .collect()
    }

    /// Start address of every erasable page touched by
    /// `start_address..end_address`, in increasing order
    pub fn erase_pages(&self, start_address: u32, end_address: u32) -> Vec<u32> {
        self.segments
            .iter()
            .filter(|s| s.erasable() && s.overlaps(start_address, end_address))
            .flat_map(|s| s.erase_pages(start_address, end_address))
            .collect()
    }

    pub fn start_addr(&self) -> u32 {
        self.segments.first().start_addr
    }

    /// First address of `start_address..=last_address` that no segment
    /// accepted by `permitted` covers.
    ///
    /// Contiguous segments are walked one after the other, a gap or a
    /// refused segment stops the walk.
    pub fn first_uncovered(
        &self,
        start_address: u32,
        last_address: u32,
        permitted: impl Fn(&DfuMemSegment) -> bool,
    ) -> Option<u32> {
        let mut addr = start_address;
        loop {
            match self.find_segment(addr) {
                Some(segment) if permitted(segment) => {
                    if last_address < segment.end_addr {
                        return None;
                    }
                    addr = segment.end_addr;
                }
                _ => return Some(addr),
            }
        }
    }
}

impl DfuMemSegment {
    pub fn new(start_addr: u32, pages: u32, page_size: u32, mem_type: u8) -> Option<Self> {
        if page_size == 0 {
            return None;
        }
        let size = pages.checked_mul(page_size)?;
        Some(DfuMemSegment {
            start_addr,
            end_addr: start_addr.checked_add(size)?,
            page_size,
            mem_type: mem_type & 7,
        })
    }

    pub fn start_addr(&self) -> u32 {
        self.start_addr
    }
    /// First address past the segment
    pub fn end_addr(&self) -> u32 {
        self.end_addr
    }
    pub fn page_size(&self) -> u32 {
        self.page_size
    }
    pub fn size(&self) -> u32 {
        self.end_addr - self.start_addr
    }
    pub fn pages(&self) -> u32 {
        self.size() / self.page_size
    }
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start_addr && addr < self.end_addr
    }
    pub fn overlaps(&self, start_addr: u32, end_addr: u32) -> bool {
        start_addr < self.end_addr && self.start_addr < end_addr
    }
    /// Start of the page holding `addr`
    pub fn page_start(&self, addr: u32) -> u32 {
        addr - (addr - self.start_addr) % self.page_size
    }
    fn erase_pages(
        &self,
        start_addr: u32,
        end_addr: u32,
    ) -> impl Iterator<Item = u32> + '_ {
        let first = self.page_start(start_addr.max(self.start_addr));
        let end = end_addr.min(self.end_addr);
        (first..end).step_by(self.page_size as usize)
    }
    pub(crate) fn resize(&mut self, page_size: u32, pages: u32) {
        self.page_size = page_size;
        self.end_addr = self
            .start_addr
            .saturating_add(page_size.saturating_mul(pages));
    }
    pub fn readable(&self) -> bool {
        self.mem_type & 1 == 1
    }
    pub fn erasable(&self) -> bool {
        self.mem_type & 2 == 2
    }
    pub fn writable(&self) -> bool {
        self.mem_type & 4 == 4
    }
}

fn layout_error(msg: impl Into<String>) -> DfuError {
    DfuError::LayoutParse(msg.into())
}

/// Parse a DfuSe alternate setting name such as
/// `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`.
///
/// Several regions may follow the name, each as `/<address>/<segments>`.
pub fn parse_memory_layout(mem_layout_str: &str) -> Result<DfuMemory, DfuError> {
    let desc = mem_layout_str.trim_end_matches('\0');
    let desc = desc
        .strip_prefix('@')
        .ok_or_else(|| layout_error(format!("\"{desc}\" does not start with '@'")))?;

    let mut parts = desc.split('/');
    let name = parts.next().unwrap_or_default().trim().to_string();

    let mut layout: Vec<DfuMemSegment> = Vec::new();
    while let Some(address) = parts.next() {
        let captures = ADDRESS_RE
            .captures(address)
            .ok_or_else(|| layout_error(format!("invalid address \"{address}\"")))?;
        let base = u32::from_str_radix(&captures[1], 16)
            .map_err(|e| layout_error(format!("address \"{address}\": {e}")))?;

        let segments = parts
            .next()
            .ok_or_else(|| layout_error(format!("no segments at 0x{base:08x}")))?;

        if let Some(last) = layout.last() {
            if base < last.end_addr {
                return Err(layout_error(format!(
                    "region at 0x{base:08x} overlaps previous segment ending at 0x{:08x}",
                    last.end_addr
                )));
            }
        }

        let mut current_addr = base;
        for segment in segments.split(',') {
            // trailing separators are common
            if segment.trim().is_empty() {
                continue;
            }
            let segment = parse_segment(segment, current_addr)?;
            current_addr = segment.end_addr;
            layout.push(segment);
        }
    }

    NonEmpty::from_vec(layout)
        .map(|segments| DfuMemory { name, segments })
        .ok_or_else(|| layout_error(format!("no memory segments in \"{mem_layout_str}\"")))
}

fn parse_segment(desc: &str, start_addr: u32) -> Result<DfuMemSegment, DfuError> {
    let captures = SEGMENT_RE
        .captures(desc)
        .ok_or_else(|| layout_error(format!("invalid segment \"{desc}\"")))?;

    let pages: u32 = captures[1]
        .parse()
        .map_err(|e| layout_error(format!("page count \"{}\": {e}", &captures[1])))?;
    let page_size: u32 = captures[2]
        .parse()
        .map_err(|e| layout_error(format!("page size \"{}\": {e}", &captures[2])))?;
    let multiplier: u32 = match &captures[3] {
        "K" => 1024,
        "M" => 1024 * 1024,
        _ => 1,
    };
    let mem_type = captures[4].as_bytes()[0] & 7;

    if pages == 0 || page_size == 0 {
        return Err(layout_error(format!("empty segment \"{desc}\"")));
    }
    let page_size = page_size
        .checked_mul(multiplier)
        .ok_or_else(|| layout_error(format!("page size overflow in \"{desc}\"")))?;

    let segment = DfuMemSegment::new(start_addr, pages, page_size, mem_type)
        .ok_or_else(|| {
            layout_error(format!(
                "segment \"{desc}\" at 0x{start_addr:08x} exceeds the address space"
            ))
        })?;

    if segment.erasable() && start_addr % page_size != 0 {
        return Err(layout_error(format!(
            "erasable segment at 0x{start_addr:08x} is not aligned to its {page_size} byte pages"
        )));
    }
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonempty::nonempty;

    #[test]
    fn test_memory_layout() {
        let layout = parse_memory_layout("@Option Bytes   /0x5200201C/01*128 e");
        assert_eq!(
            layout.unwrap(),
            DfuMemory {
                name: "Option Bytes".into(),
                segments: nonempty![DfuMemSegment {
                    start_addr: 0x5200201C,
                    end_addr: 0x5200201C + 128,
                    page_size: 128,
                    mem_type: b'e' & 7
                }],
            }
        );

        let layout = parse_memory_layout("@Internal Flash   /0x08000000/8*08Kg");
        assert_eq!(
            layout.unwrap(),
            DfuMemory {
                name: "Internal Flash".into(),
                segments: nonempty![DfuMemSegment {
                    start_addr: 0x08000000,
                    end_addr: 0x08000000 + 64 * 1024,
                    page_size: 8 * 1024,
                    mem_type: b'g' & 7
                }],
            }
        );
    }

    #[test]
    fn test_two_segments() {
        let layout =
            parse_memory_layout("@Internal Flash/0x08000000/4*16Ka,12*64Kg")
                .unwrap();
        assert_eq!(layout.segments.len(), 2);

        let first = &layout.segments[0];
        assert_eq!(first.start_addr(), 0x0800_0000);
        assert_eq!(first.pages(), 4);
        assert_eq!(first.page_size(), 16 * 1024);
        assert!(first.readable() && !first.erasable() && !first.writable());

        let second = &layout.segments[1];
        assert_eq!(second.start_addr(), 0x0801_0000);
        assert_eq!(second.pages(), 12);
        assert_eq!(second.page_size(), 64 * 1024);
        assert!(second.readable() && second.erasable() && second.writable());
    }

    #[test]
    fn test_multiple_regions() {
        let layout = parse_memory_layout(
            "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg/0x1FFF7800/01*512 e,",
        )
        .unwrap();
        assert_eq!(layout.segments.len(), 4);
        assert_eq!(layout.segments[2].end_addr(), 0x0810_0000);
        assert_eq!(layout.segments[3].start_addr(), 0x1fff_7800);
        assert_eq!(
            layout.find_segment(0x0800_c000).unwrap().page_size(),
            16 * 1024
        );
        assert!(layout.find_segment(0x0810_0000).is_none());
    }

    #[test]
    fn test_invalid_layouts() {
        for desc in [
            "Internal Flash/0x08000000/4*16Ka",
            "@Internal Flash",
            "@Internal Flash/0x08000000",
            "@Internal Flash/08000000/4*16Ka",
            "@Internal Flash/0x08000000/4*16Kz",
            "@Internal Flash/0x08000000/0*16Kg",
            "@Internal Flash/0x08000000/4*0Kg",
            "@Internal Flash/0xFFFF0000/4*64Kg",
            // decreasing
            "@Flash/0x08010000/1*64Kg/0x08000000/1*64Kg",
            // overlapping
            "@Flash/0x08000000/2*64Kg/0x08010000/1*64Kg",
            // erasable but not aligned
            "@Flash/0x08000100/2*1Kg",
        ] {
            assert!(
                matches!(parse_memory_layout(desc), Err(DfuError::LayoutParse(_))),
                "{desc}"
            );
        }
    }

    #[test]
    fn test_erase_pages() {
        let layout =
            parse_memory_layout("@Flash/0x08000000/4*16Ka,64*1Kg").unwrap();
        // read-only segment is skipped
        assert!(layout.erase_pages(0x0800_0000, 0x0801_0000).is_empty());
        assert_eq!(
            layout.erase_pages(0x0801_0200, 0x0801_0900),
            vec![0x0801_0000, 0x0801_0400, 0x0801_0800]
        );
        assert_eq!(
            layout.erase_pages(0x0801_07ff, 0x0801_0801),
            vec![0x0801_0400, 0x0801_0800]
        );
        assert_eq!(
            layout.erase_pages(0x0801_fc00, 0x0803_0000),
            vec![0x0801_fc00]
        );
    }

    #[test]
    fn test_first_uncovered() {
        let layout = parse_memory_layout(
            "@Flash/0x08000000/4*16Ka,2*32Kg,1*64Kg/0x08040000/1*1Kg",
        )
        .unwrap();
        let writable = |s: &DfuMemSegment| s.writable();
        // inside one segment
        assert_eq!(layout.first_uncovered(0x0801_0000, 0x0801_00ff, writable), None);
        // across two contiguous writable segments
        assert_eq!(layout.first_uncovered(0x0801_ff00, 0x0802_00ff, writable), None);
        // starts in the read-only segment
        assert_eq!(
            layout.first_uncovered(0x0800_ff00, 0x0801_00ff, writable),
            Some(0x0800_ff00)
        );
        // runs into the gap after the 64K segment
        assert_eq!(
            layout.first_uncovered(0x0802_ff00, 0x0804_00ff, writable),
            Some(0x0803_0000)
        );
        assert_eq!(
            layout.first_uncovered(0x0800_0000, 0x0800_0fff, |s| s.readable()),
            None
        );
    }

    #[test]
    fn test_find_segments() {
        let layout =
            parse_memory_layout("@Flash/0x08000000/4*16Kg,1*64Kg").unwrap();
        assert_eq!(layout.find_segments(0x0800_0000, 0x0800_4000).len(), 1);
        assert_eq!(layout.find_segments(0x0800_8000, 0x0801_0001).len(), 2);
        assert!(layout.find_segments(0x0802_0000, 0x0803_0000).is_empty());
    }
}
