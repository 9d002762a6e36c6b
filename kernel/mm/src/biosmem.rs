//! Early physical-memory discovery and bootstrap allocation.
//!
//! At boot, the firmware memory map is brought into canonical form
//! (invalid entries dropped, overlaps resolved in favor of the more
//! restrictive type, entries sorted), and the available memory in it is
//! partitioned into the priority segments of [`crate::vm_page`]. A bump
//! allocator is then placed over the largest gap in upper memory that
//! avoids every piece of boot data, and feeds early allocations until
//! the page allocator takes over.
//!
//! Once [`vm_page::setup`] has run, [`free_usable`] walks the available
//! ranges one last time and releases every frame that is not the kernel
//! image, the bootstrap heap or memory already handed over through a
//! segment's avail window.

use planck_noalloc::vec::ArrayVec;
use quark_core::addr::PhysAddr;
use quark_core::sync::SpinLock;
use quark_core::{kinfo, kwarn};
use quark_multiboot::MmapIter;

use crate::bootinfo::{BootInfo, PhysRange};
use crate::vm_page::{self, MAX_SEGS, SEG_DIRECTMAP, SEG_DMA, SEG_LIMITS, VmPage};
use crate::{PAGE_SIZE, page_round, page_trunc, pages_to_bytes};

/// Maximum number of entries in the firmware memory map.
///
/// Overlap adjustment can split ranges, so the working map holds up to
/// twice this many entries.
pub const MAX_MAP_ENTRIES: usize = 128;

const MAP_CAPACITY: usize = MAX_MAP_ENTRIES * 2;

/// Lowest physical address handed to the segment partitioner and to the
/// bootstrap-heap search: the first byte of upper memory.
pub const BIOSMEM_BASE: u64 = 0x10_0000;

/// Capacity of the recorded boot-data range list.
const MAX_BOOT_DATA: usize = 4 + 2 * crate::bootinfo::MAX_MODULES + crate::bootinfo::MAX_SECTIONS;

/// Firmware range type code.
///
/// Codes are ordered by restrictiveness; when two ranges overlap, the
/// numerically higher type wins the intersection. Codes the firmware
/// invents beyond [`RangeType::DISABLED`] therefore behave as reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RangeType(u32);

impl RangeType {
    /// Usable RAM.
    pub const AVAILABLE: Self = Self(1);
    /// Reserved by firmware or hardware.
    pub const RESERVED: Self = Self(2);
    /// ACPI tables.
    pub const ACPI: Self = Self(3);
    /// ACPI non-volatile storage.
    pub const NVS: Self = Self(4);
    /// Defective memory.
    pub const UNUSABLE: Self = Self(5);
    /// Disabled memory.
    pub const DISABLED: Self = Self(6);

    /// Wraps a raw firmware type code.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Human-readable name for the map listing.
    pub fn name(self) -> &'static str {
        match self {
            Self::AVAILABLE => "available",
            Self::RESERVED => "reserved",
            Self::ACPI => "ACPI",
            Self::NVS => "ACPI NVS",
            Self::UNUSABLE => "unusable",
            _ => "unknown (reserved)",
        }
    }
}

/// One range of the firmware memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Firmware range type.
    pub kind: RangeType,
}

impl MapEntry {
    const fn end(&self) -> u64 {
        self.base + self.length
    }

    fn is_invalid(&self) -> bool {
        match self.base.checked_add(self.length) {
            Some(end) => end <= self.base,
            None => true,
        }
    }
}

/// The firmware memory map, canonicalized in place by [`BootMap::adjust`].
struct BootMap {
    entries: ArrayVec<MapEntry, MAP_CAPACITY>,
}

impl BootMap {
    fn from_firmware(buf: &[u8]) -> Self {
        let mut entries = ArrayVec::new();
        for raw in MmapIter::new(buf).take(MAX_MAP_ENTRIES) {
            entries.push(MapEntry {
                base: raw.base,
                length: raw.length,
                kind: RangeType::from_raw(raw.entry_type),
            });
        }
        Self { entries }
    }

    /// Fallback map from the conventional/upper memory split, for boot
    /// loaders that pass no firmware map.
    fn from_simple(mem_lower_kib: u32, mem_upper_kib: u32) -> Self {
        let mut entries = ArrayVec::new();
        entries.push(MapEntry {
            base: 0,
            length: u64::from(mem_lower_kib) << 10,
            kind: RangeType::AVAILABLE,
        });
        entries.push(MapEntry {
            base: BIOSMEM_BASE,
            length: u64::from(mem_upper_kib) << 10,
            kind: RangeType::AVAILABLE,
        });
        Self { entries }
    }

    /// Single-range map from a host-reported page count (paravirtualized
    /// boot).
    fn from_single(length: u64) -> Self {
        let mut entries = ArrayVec::new();
        entries.push(MapEntry {
            base: 0,
            length,
            kind: RangeType::AVAILABLE,
        });
        Self { entries }
    }

    fn entries(&self) -> &[MapEntry] {
        self.entries.as_slice()
    }

    fn filter_invalid(&mut self) {
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].is_invalid() {
                self.entries.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Insertion sort by base address; the map is small and nearly
    /// sorted already.
    fn sort(&mut self) {
        for i in 1..self.entries.len() {
            let tmp = self.entries[i];
            let mut j = i;
            while j > 0 && self.entries[j - 1].base > tmp.base {
                self.entries[j] = self.entries[j - 1];
                j -= 1;
            }
            self.entries[j] = tmp;
        }
    }

    /// Brings the map into canonical form: no invalid entries, no
    /// overlaps, sorted by base.
    ///
    /// For every overlapping pair, the range is cut into the leading
    /// piece (keeping the earlier entry's type), the intersection
    /// (taking the more restrictive type) and the trailing piece
    /// (keeping the later-ending entry's type). The intersection merges
    /// into a neighbor of equal type where possible, else becomes a new
    /// entry. The single sort at the end is what makes the incremental
    /// merging sound; nothing reads the map before `adjust` returns.
    fn adjust(&mut self) {
        self.filter_invalid();

        let mut i = 0;
        while i < self.entries.len() {
            let mut j = i + 1;
            while j < self.entries.len() {
                let a = self.entries[i];
                let b = self.entries[j];
                let a_end = a.end();
                let b_end = b.end();

                if a.base >= b_end || a_end <= b.base {
                    j += 1;
                    continue;
                }

                let first = if a.base < b.base { i } else { j };
                let second = if a.base < b.base { j } else { i };
                let (last_end, last_kind) = if a_end > b_end {
                    (a_end, a.kind)
                } else {
                    (b_end, b.kind)
                };

                let inter = MapEntry {
                    base: self.entries[second].base,
                    length: a_end.min(b_end) - self.entries[second].base,
                    kind: a.kind.max(b.kind),
                };

                self.entries[first].length = inter.base - self.entries[first].base;
                let suffix = &mut self.entries[second];
                suffix.base += inter.length;
                suffix.length = last_end - suffix.base;
                suffix.kind = last_kind;

                // The surgery can leave either side empty.
                let a_gone = self.entries[i].is_invalid();
                let b_gone = self.entries[j].is_invalid();
                if a_gone && b_gone {
                    self.entries[i] = inter;
                    self.entries.remove(j);
                    continue;
                } else if a_gone {
                    self.entries[i] = inter;
                    j += 1;
                    continue;
                } else if b_gone {
                    self.entries[j] = inter;
                    j += 1;
                    continue;
                }

                let merge_into = if inter.kind == self.entries[i].kind {
                    i
                } else if inter.kind == self.entries[j].kind {
                    j
                } else {
                    // The intersection matches neither neighbor and must
                    // become an entry of its own.
                    if self.entries.is_full() {
                        panic!("biosmem: too many memory map entries");
                    }
                    self.entries.push(inter);
                    j += 1;
                    continue;
                };

                let entry = &mut self.entries[merge_into];
                if entry.base > inter.base {
                    entry.base = inter.base;
                }
                entry.length += inter.length;
                j += 1;
            }
            i += 1;
        }

        self.sort();
    }

    /// Narrows `[phys_start, phys_end)` to the page-aligned hull of the
    /// available memory inside it. Returns `false` when the window
    /// contains none.
    fn find_avail(&self, phys_start: &mut u64, phys_end: &mut u64) -> bool {
        let mut seg_start = u64::MAX;
        let mut seg_end = u64::MAX;

        for entry in self.entries.iter() {
            if entry.kind != RangeType::AVAILABLE {
                continue;
            }

            let start = page_round(entry.base);
            if start >= *phys_end {
                break;
            }
            let end = page_trunc(entry.end());

            if start < end && start < *phys_end && end > *phys_start {
                if seg_start == u64::MAX {
                    seg_start = start;
                }
                seg_end = end;
            }
        }

        if seg_start == u64::MAX || seg_end == u64::MAX {
            return false;
        }
        if seg_start > *phys_start {
            *phys_start = seg_start;
        }
        if seg_end < *phys_end {
            *phys_end = seg_end;
        }
        true
    }
}

/// Which way the bootstrap heap grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeapDirection {
    /// Baremetal: allocate downward so DMA-capable low memory stays
    /// untouched as long as possible.
    TopDown,
    /// Paravirtualized: only a small window above the host page tables
    /// is initially accessible, so allocation must grow upward from it.
    BottomUp,
}

/// The bootstrap bump heap: `[start, end)` with `cur` as the watermark.
#[derive(Debug, Clone, Copy)]
struct BumpHeap {
    start: u64,
    end: u64,
    cur: u64,
    direction: HeapDirection,
}

impl BumpHeap {
    fn top_down(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            cur: end,
            direction: HeapDirection::TopDown,
        }
    }

    fn bottom_up(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            cur: start,
            direction: HeapDirection::BottomUp,
        }
    }

    fn alloc(&mut self, nr_pages: u32) -> u64 {
        let size = pages_to_bytes(u64::from(nr_pages));
        if size == 0 {
            panic!("biosmem: attempt to allocate 0 page");
        }

        match self.direction {
            HeapDirection::TopDown => {
                let addr = self.cur.wrapping_sub(size);
                if addr < self.start || addr > self.cur {
                    panic!("biosmem: unable to allocate memory");
                }
                self.cur = addr;
                addr
            }
            HeapDirection::BottomUp => {
                let addr = self.cur;
                let Some(next) = addr.checked_add(size) else {
                    panic!("biosmem: unable to allocate memory");
                };
                if next > self.end {
                    panic!("biosmem: unable to allocate memory");
                }
                self.cur = next;
                addr
            }
        }
    }

    /// The part of the heap never allocated from, which is released to
    /// the page allocator like any other available memory.
    fn unused_span(&self) -> (u64, u64) {
        match self.direction {
            HeapDirection::TopDown => (self.start, self.cur),
            HeapDirection::BottomUp => (self.cur, self.end),
        }
    }
}

/// A segment discovered by the partitioner, with the avail window set
/// when the segment is loaded into the page allocator.
#[derive(Debug, Clone, Copy)]
struct SegRange {
    start: u64,
    end: u64,
    avail_start: u64,
    avail_end: u64,
}

impl SegRange {
    const fn unset() -> Self {
        Self {
            start: 0,
            end: 0,
            avail_start: 0,
            avail_end: 0,
        }
    }

    fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Boot-time memory discovery state.
struct BootMem {
    map: BootMap,
    segments: [SegRange; MAX_SEGS],
    heap: BumpHeap,
    kernel: PhysRange,
    boot_data: ArrayVec<PhysRange, MAX_BOOT_DATA>,
}

fn record_range(ranges: &mut ArrayVec<PhysRange, MAX_BOOT_DATA>, range: PhysRange) {
    if !range.is_empty() && !ranges.is_full() {
        ranges.push(range);
    }
}

/// Flattens everything the boot loader left in RAM into one range list
/// for the heap-gap search: the kernel, its command line, the module
/// table, each module body and command line, and the recorded ELF
/// sections.
fn collect_boot_data(info: &BootInfo<'_>) -> ArrayVec<PhysRange, MAX_BOOT_DATA> {
    let mut ranges = ArrayVec::new();
    record_range(&mut ranges, info.kernel);
    if let Some(range) = info.cmdline {
        record_range(&mut ranges, range);
    }
    if let Some(range) = info.module_table {
        record_range(&mut ranges, range);
    }
    for module in info.modules.iter() {
        record_range(&mut ranges, module.body);
        if let Some(range) = module.cmdline {
            record_range(&mut ranges, range);
        }
    }
    for &section in info.sections.iter() {
        record_range(&mut ranges, section);
    }
    ranges
}

/// Returns the lowest boot-data range starting in `[min, max)`, the gap
/// walk's probe.
fn find_boot_data(boot_data: &[PhysRange], min: u64, max: u64) -> Option<PhysRange> {
    let mut found: Option<PhysRange> = None;
    for &range in boot_data {
        if range.start >= min && range.start < found.map_or(max, |f| f.start) {
            found = Some(range);
        }
    }
    found
}

/// Assigns available memory to the priority classes, each class taking
/// the hull of available memory between the previous class's ceiling
/// and its own. Loading stops at the first class with nothing in its
/// window.
fn partition_segments(map: &BootMap) -> [SegRange; MAX_SEGS] {
    let mut segments = [SegRange::unset(); MAX_SEGS];
    let mut phys_start = BIOSMEM_BASE;

    for (i, &limit) in SEG_LIMITS.iter().enumerate() {
        let mut start = phys_start;
        let mut end = limit;
        if !map.find_avail(&mut start, &mut end) {
            assert!(i != 0, "biosmem: unable to find any memory segment");
            break;
        }
        segments[i].start = start;
        segments[i].end = end;
        phys_start = limit;
    }

    segments
}

/// Picks the largest gap between boot-data regions in upper memory and
/// makes it the top-down bootstrap heap.
fn setup_allocator(boot_data: &[PhysRange], mem_upper_kib: u32) -> BumpHeap {
    let mem_end = page_trunc((u64::from(mem_upper_kib) + 1024) << 10);
    #[cfg(target_pointer_width = "32")]
    let mem_end = mem_end.min(vm_page::DIRECTMAP_LIMIT);

    let mut max_start = 0u64;
    let mut max_end = 0u64;
    let mut next = BIOSMEM_BASE;

    loop {
        let gap_start = next;
        let gap_end = match find_boot_data(boot_data, gap_start, mem_end) {
            Some(range) => {
                next = range.end;
                range.start
            }
            None => {
                next = 0;
                mem_end
            }
        };

        // A boot-data region can end past mem_end, inverting the last
        // candidate; saturate so it never wins.
        if gap_end.saturating_sub(gap_start) > max_end - max_start {
            max_start = gap_start;
            max_end = gap_end;
        }
        if next == 0 {
            break;
        }
    }

    let start = page_round(max_start);
    let end = page_trunc(max_end);
    if start >= end {
        panic!("biosmem: unable to set up the early memory allocator");
    }
    BumpHeap::top_down(start, end)
}

impl BootMem {
    /// Builds the map from the loader-provided description, partitions
    /// the segments and places the bootstrap heap.
    fn bootstrap(info: &BootInfo<'_>) -> Self {
        let mut map = match info.mmap {
            Some(buf) => BootMap::from_firmware(buf),
            None => BootMap::from_simple(info.mem_lower_kib, info.mem_upper_kib),
        };
        map.adjust();

        let segments = partition_segments(&map);
        let boot_data = collect_boot_data(info);
        let heap = setup_allocator(boot_data.as_slice(), info.mem_upper_kib);

        Self {
            map,
            segments,
            heap,
            kernel: info.kernel,
            boot_data,
        }
    }

    /// Alternate entry for a paravirtualized host: one available range
    /// covering the host-reported page count, and a bottom-up heap just
    /// above the host-provided page tables.
    fn xen_bootstrap(nr_pages: u64, pt_base: u64, nr_pt_frames: u64, kernel: PhysRange) -> Self {
        let mut map = BootMap::from_single(pages_to_bytes(nr_pages));
        map.adjust();

        let segments = partition_segments(&map);

        let heap_start = pt_base + pages_to_bytes(nr_pt_frames + 3);
        let heap_end = pages_to_bytes(nr_pages);
        #[cfg(target_pointer_width = "32")]
        let heap_end = heap_end.min(vm_page::DIRECTMAP_LIMIT);

        Self {
            map,
            segments,
            heap: BumpHeap::bottom_up(heap_start, heap_end),
            kernel,
            boot_data: ArrayVec::new(),
        }
    }

    fn bootalloc(&mut self, nr_pages: u32) -> u64 {
        self.heap.alloc(nr_pages)
    }

    /// Upper bound of directly mappable memory: the end of the highest
    /// loaded segment at or below the direct-map class.
    fn directmap_size(&self) -> u64 {
        let mut i = SEG_DIRECTMAP;
        while i > 0 {
            if self.segments[i].size() != 0 {
                return self.segments[i].end;
            }
            i -= 1;
        }
        self.segments[SEG_DMA].end
    }

    fn map_show(&self) {
        kinfo!("biosmem: physical memory map:");
        for entry in self.map.entries() {
            kinfo!(
                "biosmem: {:018x}:{:018x}, {}",
                entry.base,
                entry.end(),
                entry.kind.name()
            );
        }
        kinfo!("biosmem: heap: {:x}-{:x}", self.heap.start, self.heap.end);
    }

    fn load_segment(
        &mut self,
        vm: &VmPage,
        seg_index: usize,
        max_phys_end: u64,
        avail_start: u64,
        avail_end: u64,
    ) {
        let (start, mut end) = (self.segments[seg_index].start, self.segments[seg_index].end);

        if end > max_phys_end {
            if max_phys_end <= start {
                kwarn!(
                    "biosmem: warning: segment {} physically unreachable, not loaded",
                    vm_page::seg_name(seg_index)
                );
                return;
            }
            kwarn!(
                "biosmem: warning: segment {} truncated to {:#x}",
                vm_page::seg_name(seg_index),
                max_phys_end
            );
            end = max_phys_end;
        }

        // Clamp the heap's unused span into the segment; a window that
        // misses the segment entirely widens to the whole of it.
        let mut a_start = avail_start;
        let mut a_end = avail_end;
        if a_start < start || a_start >= end {
            a_start = start;
        }
        if a_end <= start || a_end > end {
            a_end = end;
        }

        self.segments[seg_index].avail_start = a_start;
        self.segments[seg_index].avail_end = a_end;
        vm.load(seg_index, start, end, a_start, a_end);
    }

    /// Prints the canonical map and loads every discovered segment into
    /// the page allocator, offering each the unused part of the heap as
    /// its avail window.
    fn setup(&mut self, vm: &VmPage) {
        self.map_show();

        let (avail_start, avail_end) = self.heap.unused_span();
        for i in 0..MAX_SEGS {
            if self.segments[i].size() == 0 {
                break;
            }
            self.load_segment(vm, i, vm_page::HIGHMEM_LIMIT, avail_start, avail_end);
        }
    }

    fn reserved(&self, pa: u64) -> bool {
        if self.kernel.contains(pa) {
            return true;
        }
        if pa >= self.heap.start && pa < self.heap.end {
            return true;
        }
        self.segments
            .iter()
            .any(|seg| pa >= seg.avail_start && pa < seg.avail_end)
    }

    fn skip_reserved(&self, mut start: u64) -> u64 {
        fn update(start: &mut u64, res_start: u64, res_end: u64) {
            if *start >= res_start && *start < res_end {
                *start = res_end;
            }
        }

        update(&mut start, self.kernel.start, self.kernel.end);
        update(&mut start, self.heap.start, self.heap.end);
        for seg in &self.segments {
            update(&mut start, seg.avail_start, seg.avail_end);
        }
        start
    }

    fn free_usable_range(&self, vm: &VmPage, start: u64, end: u64) {
        kinfo!(
            "biosmem: release to vm_page: {:x}-{:x} ({}k)",
            start,
            end,
            (end - start) >> 10
        );

        let mut pa = start;
        while pa < end {
            match vm.lookup_pa(PhysAddr::new(pa)) {
                Some(page) => vm.manage(page),
                None => debug_assert!(false, "biosmem: released frame outside any segment"),
            }
            pa += PAGE_SIZE;
        }
    }

    fn free_usable_entry(&self, vm: &VmPage, start: u64, entry_end: u64) {
        let mut start = start;
        loop {
            start = self.skip_reserved(start);
            if start >= entry_end {
                return;
            }

            let mut end = start;
            while end < entry_end && !self.reserved(end) {
                end += PAGE_SIZE;
            }

            self.free_usable_range(vm, start, end);
            start = end;
        }
    }

    /// Releases every available frame that is not boot data and was not
    /// already handed over through an avail window.
    fn free_usable(&self, vm: &VmPage) {
        for entry in self.map.entries() {
            if entry.kind != RangeType::AVAILABLE {
                continue;
            }

            let mut start = page_round(entry.base);
            if start >= vm_page::HIGHMEM_LIMIT {
                break;
            }
            let end = page_trunc(entry.end());

            if start < BIOSMEM_BASE {
                start = BIOSMEM_BASE;
            }
            self.free_usable_entry(vm, start, end);
        }
    }
}

/// The process-wide boot memory state.
static BOOTMEM: SpinLock<Option<BootMem>> = SpinLock::new(None);

fn with_bootmem<R>(f: impl FnOnce(&mut BootMem) -> R) -> R {
    let mut boot = BOOTMEM.lock();
    f(boot.as_mut().expect("biosmem: not bootstrapped"))
}

/// Builds and adjusts the memory map, partitions the segments and
/// places the bootstrap heap. Must run before any other entry point.
pub fn bootstrap(info: &BootInfo<'_>) {
    let mut boot = BOOTMEM.lock();
    assert!(boot.is_none(), "biosmem: already bootstrapped");
    *boot = Some(BootMem::bootstrap(info));
}

/// Alternate bootstrap for a paravirtualized host. `nr_pages` is the
/// host-reported memory size in frames; `pt_base` and `nr_pt_frames`
/// describe the host-built page tables the heap must sit above.
pub fn xen_bootstrap(nr_pages: u64, pt_base: u64, nr_pt_frames: u64, kernel: PhysRange) {
    let mut boot = BOOTMEM.lock();
    assert!(boot.is_none(), "biosmem: already bootstrapped");
    *boot = Some(BootMem::xen_bootstrap(nr_pages, pt_base, nr_pt_frames, kernel));
}

/// Allocates `nr_pages` contiguous page-aligned frames from the
/// bootstrap heap. Only legal before [`vm_page::setup`] publishes the
/// page allocator.
pub fn bootalloc(nr_pages: u32) -> PhysAddr {
    debug_assert!(!vm_page::ready(), "biosmem: bootalloc after vm_page setup");
    PhysAddr::new(with_bootmem(|mem| mem.bootalloc(nr_pages)))
}

/// Upper bound of directly mappable memory, used to size the kernel's
/// identity mapping.
pub fn directmap_size() -> PhysAddr {
    PhysAddr::new(with_bootmem(|mem| mem.directmap_size()))
}

/// Loads the discovered segments into the page allocator. Call once,
/// before [`vm_page::setup`].
pub fn setup() {
    with_bootmem(|mem| mem.setup(vm_page::global()));
}

/// Releases leftover available memory to the page allocator. Call once,
/// after [`vm_page::setup`].
pub fn free_usable() {
    with_bootmem(|mem| mem.free_usable(vm_page::global()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_page::PageType;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    const A: RangeType = RangeType::AVAILABLE;
    const R: RangeType = RangeType::RESERVED;

    fn map_of(entries: &[(u64, u64, RangeType)]) -> BootMap {
        let mut map = BootMap {
            entries: ArrayVec::new(),
        };
        for &(base, length, kind) in entries {
            map.entries.push(MapEntry { base, length, kind });
        }
        map
    }

    fn assert_canonical(map: &BootMap) {
        let entries = map.entries();
        for (i, entry) in entries.iter().enumerate() {
            assert!(entry.length > 0, "entry {i} has zero length");
            if i > 0 {
                assert!(
                    entries[i - 1].end() <= entry.base,
                    "entries {} and {i} overlap or are unsorted",
                    i - 1
                );
            }
        }
    }

    #[test]
    fn filter_drops_invalid_entries() {
        let mut map = map_of(&[
            (0x1000, 0, A),                // zero length
            (0x2000, 0x1000, A),           // fine
            (u64::MAX - 0x100, 0x1000, R), // wraps around
        ]);
        map.adjust();
        assert_eq!(map.entries().len(), 1);
        assert_eq!(map.entries()[0].base, 0x2000);
        assert_canonical(&map);
    }

    #[test]
    fn overlap_reserved_wins_intersection() {
        // Available [0, 0x1000) against reserved [0x800, 0x1800): the
        // intersection goes to the reserved side.
        let mut map = map_of(&[(0, 0x1000, A), (0x800, 0x1000, R)]);
        map.adjust();

        assert_eq!(
            map.entries(),
            &[
                MapEntry {
                    base: 0,
                    length: 0x800,
                    kind: A
                },
                MapEntry {
                    base: 0x800,
                    length: 0x1000,
                    kind: R
                },
            ]
        );
        assert_canonical(&map);
    }

    #[test]
    fn overlap_contained_range_splits_in_three() {
        // An ACPI range strictly inside an available one matches neither
        // neighbor after the cut and becomes its own entry.
        let mut map = map_of(&[(0, 0x3000, A), (0x1000, 0x1000, RangeType::ACPI)]);
        map.adjust();

        assert_eq!(
            map.entries(),
            &[
                MapEntry {
                    base: 0,
                    length: 0x1000,
                    kind: A
                },
                MapEntry {
                    base: 0x1000,
                    length: 0x1000,
                    kind: RangeType::ACPI
                },
                MapEntry {
                    base: 0x2000,
                    length: 0x1000,
                    kind: A
                },
            ]
        );
        assert_canonical(&map);
    }

    #[test]
    fn overlap_same_type_absorbs_intersection() {
        // The intersection merges into the earlier entry; the suffix
        // stays its own entry. No coalescing of adjacent equals.
        let mut map = map_of(&[(0, 0x2000, A), (0x1000, 0x2000, A)]);
        map.adjust();
        assert_eq!(
            map.entries(),
            &[
                MapEntry {
                    base: 0,
                    length: 0x2000,
                    kind: A
                },
                MapEntry {
                    base: 0x2000,
                    length: 0x1000,
                    kind: A
                },
            ]
        );
        assert_canonical(&map);
    }

    #[test]
    fn adjust_sorts_disjoint_entries() {
        let mut map = map_of(&[(0x5000, 0x1000, R), (0x1000, 0x1000, A), (0x3000, 0x1000, A)]);
        map.adjust();
        let bases: Vec<u64> = map.entries().iter().map(|e| e.base).collect();
        assert_eq!(bases, vec![0x1000, 0x3000, 0x5000]);
        assert_canonical(&map);
    }

    #[test]
    fn unknown_type_codes_act_reserved() {
        let mut map = map_of(&[(0, 0x2000, A), (0x1000, 0x1000, RangeType::from_raw(9))]);
        map.adjust();
        // The unknown (higher) code takes the intersection.
        assert_eq!(map.entries().len(), 2);
        assert_eq!(map.entries()[1].kind, RangeType::from_raw(9));
        assert_eq!(map.entries()[1].kind.name(), "unknown (reserved)");
        assert_canonical(&map);
    }

    #[test]
    fn find_avail_narrows_to_hull() {
        let map = map_of(&[
            (0, 0x9F000, A),
            (0x100000, 0x700000, A),
            (0xF00000, 0x1000, R),
        ]);
        let mut start = BIOSMEM_BASE;
        let mut end = vm_page::DMA_LIMIT;
        assert!(map.find_avail(&mut start, &mut end));
        assert_eq!(start, 0x100000);
        assert_eq!(end, 0x800000);
    }

    #[test]
    fn find_avail_rejects_empty_window() {
        let map = map_of(&[(0, 0x9F000, A)]);
        let mut start = BIOSMEM_BASE;
        let mut end = vm_page::DMA_LIMIT;
        assert!(!map.find_avail(&mut start, &mut end));
    }

    #[test]
    fn find_avail_unaligned_ranges_shrink_to_pages() {
        let map = map_of(&[(0x100800, 0x2000, A)]);
        let mut start = 0x100000;
        let mut end = 0x200000;
        assert!(map.find_avail(&mut start, &mut end));
        assert_eq!(start, 0x101000);
        assert_eq!(end, 0x102000);
    }

    #[test]
    fn partition_assigns_priority_classes() {
        // 8 GiB of RAM: DMA gets [1 MiB, 16 MiB), DIRECTMAP (aliasing
        // DMA32) gets [16 MiB, 4 GiB), HIGHMEM the rest.
        let mut map = map_of(&[(0, 0x2_0000_0000, A)]);
        map.adjust();
        let segs = partition_segments(&map);

        assert_eq!(segs[SEG_DMA].start, BIOSMEM_BASE);
        assert_eq!(segs[SEG_DMA].end, vm_page::DMA_LIMIT);
        assert_eq!(segs[SEG_DIRECTMAP].start, vm_page::DMA_LIMIT);
        assert_eq!(segs[SEG_DIRECTMAP].end, vm_page::DIRECTMAP_LIMIT);
        assert_eq!(segs[vm_page::SEG_HIGHMEM].start, vm_page::DIRECTMAP_LIMIT);
        assert_eq!(segs[vm_page::SEG_HIGHMEM].end, 0x2_0000_0000);
    }

    #[test]
    fn partition_stops_at_first_empty_class() {
        let mut map = map_of(&[(0x100000, 0x700000, A)]);
        map.adjust();
        let segs = partition_segments(&map);

        assert_eq!(segs[SEG_DMA].end, 0x800000);
        assert_eq!(segs[SEG_DIRECTMAP].size(), 0);
        assert_eq!(segs[vm_page::SEG_HIGHMEM].size(), 0);
    }

    #[test]
    #[should_panic(expected = "unable to find any memory segment")]
    fn partition_without_upper_memory_panics() {
        let mut map = map_of(&[(0, 0x9F000, A)]);
        map.adjust();
        let _ = partition_segments(&map);
    }

    #[test]
    fn heap_picks_largest_gap_between_boot_data() {
        let boot_data = [
            PhysRange::new(0x20_0000, 0x30_0000), // kernel
            PhysRange::new(0x50_0000, 0x60_0000), // a module
        ];
        // mem_upper 15 MiB -> upper memory ends at 16 MiB.
        let heap = setup_allocator(&boot_data, 15 * 1024);

        // Gaps: [1M,2M) = 1M, [3M,5M) = 2M, [6M,16M) = 10M.
        assert_eq!(heap.start, 0x60_0000);
        assert_eq!(heap.end, 0x100_0000);
        assert_eq!(heap.cur, heap.end);
    }

    #[test]
    fn heap_gap_before_first_boot_data() {
        let boot_data = [PhysRange::new(0xF0_0000, 0xFF_0000)];
        let heap = setup_allocator(&boot_data, 15 * 1024);
        // [1M, 15M) dwarfs [15.9M, 16M).
        assert_eq!(heap.start, BIOSMEM_BASE);
        assert_eq!(heap.end, 0xF0_0000);
    }

    #[test]
    #[should_panic(expected = "unable to set up the early memory allocator")]
    fn heap_fails_when_boot_data_covers_everything() {
        let boot_data = [PhysRange::new(BIOSMEM_BASE, 0x100_0000)];
        let _ = setup_allocator(&boot_data, 15 * 1024);
    }

    #[test]
    fn find_boot_data_returns_lowest_in_window() {
        let ranges = [
            PhysRange::new(0x50_0000, 0x60_0000),
            PhysRange::new(0x20_0000, 0x30_0000),
            PhysRange::new(0x40_0000, 0x45_0000),
        ];
        assert_eq!(
            find_boot_data(&ranges, 0, u64::MAX),
            Some(PhysRange::new(0x20_0000, 0x30_0000))
        );
        assert_eq!(
            find_boot_data(&ranges, 0x30_0000, u64::MAX),
            Some(PhysRange::new(0x40_0000, 0x45_0000))
        );
        assert_eq!(find_boot_data(&ranges, 0x60_0000, u64::MAX), None);
        // A range starting at or past `max` is out of the window.
        assert_eq!(find_boot_data(&ranges, 0x46_0000, 0x50_0000), None);
    }

    #[test]
    fn bootalloc_top_down() {
        let mut heap = BumpHeap::top_down(0x20_0000, 0x80_0000);
        let first = heap.alloc(2);
        assert_eq!(first, 0x7F_E000);
        let second = heap.alloc(1);
        assert_eq!(second, 0x7F_D000);
        assert_eq!(heap.unused_span(), (0x20_0000, 0x7F_D000));
    }

    #[test]
    fn bootalloc_bottom_up() {
        let mut heap = BumpHeap::bottom_up(0x20_0000, 0x80_0000);
        let first = heap.alloc(2);
        assert_eq!(first, 0x20_0000);
        let second = heap.alloc(1);
        assert_eq!(second, 0x20_2000);
        assert_eq!(heap.unused_span(), (0x20_3000, 0x80_0000));
    }

    #[test]
    #[should_panic(expected = "attempt to allocate 0 page")]
    fn bootalloc_zero_pages_panics() {
        let mut heap = BumpHeap::top_down(0x20_0000, 0x80_0000);
        let _ = heap.alloc(0);
    }

    #[test]
    #[should_panic(expected = "unable to allocate memory")]
    fn bootalloc_exhaustion_panics() {
        let mut heap = BumpHeap::top_down(0x20_0000, 0x20_2000);
        let _ = heap.alloc(2);
        let _ = heap.alloc(1);
    }

    #[test]
    #[should_panic(expected = "unable to allocate memory")]
    fn bootalloc_bottom_up_exhaustion_panics() {
        let mut heap = BumpHeap::bottom_up(0x20_0000, 0x20_2000);
        let _ = heap.alloc(3);
    }

    #[test]
    fn xen_bootstrap_places_heap_above_page_tables() {
        // 32 MiB guest, page tables at 4 MiB spanning 5 frames.
        let mem = BootMem::xen_bootstrap(
            8192,
            0x40_0000,
            5,
            PhysRange::new(0x10_0000, 0x20_0000),
        );
        assert_eq!(mem.heap.direction, HeapDirection::BottomUp);
        // 5 page-table frames plus the 3-frame fixup window.
        assert_eq!(mem.heap.start, 0x40_0000 + 8 * 0x1000);
        assert_eq!(mem.heap.end, 0x200_0000);
        assert_eq!(mem.heap.cur, mem.heap.start);
        assert_eq!(mem.segments[SEG_DMA].start, BIOSMEM_BASE);
        assert_eq!(mem.segments[SEG_DMA].end, vm_page::DMA_LIMIT);
    }

    #[test]
    fn directmap_size_prefers_highest_loaded() {
        let mut map = map_of(&[(0, 0x2_0000_0000, A)]);
        map.adjust();
        let mem = BootMem {
            segments: partition_segments(&map),
            map,
            heap: BumpHeap::top_down(0x20_0000, 0x80_0000),
            kernel: PhysRange::empty(),
            boot_data: ArrayVec::new(),
        };
        assert_eq!(mem.directmap_size(), vm_page::DIRECTMAP_LIMIT);
    }

    #[test]
    fn directmap_size_falls_back_to_dma() {
        let mut map = map_of(&[(0x100000, 0x700000, A)]);
        map.adjust();
        let mem = BootMem {
            segments: partition_segments(&map),
            map,
            heap: BumpHeap::top_down(0x20_0000, 0x80_0000),
            kernel: PhysRange::empty(),
            boot_data: ArrayVec::new(),
        };
        assert_eq!(mem.directmap_size(), 0x800000);
    }

    // -----------------------------------------------------------------
    // Full boot walk: bootstrap -> setup -> vm_page setup -> free_usable
    // -----------------------------------------------------------------

    fn mmap_bytes(entries: &[(u64, u64, u32)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for &(base, length, kind) in entries {
            buf.extend_from_slice(&20u32.to_ne_bytes());
            buf.extend_from_slice(&base.to_ne_bytes());
            buf.extend_from_slice(&length.to_ne_bytes());
            buf.extend_from_slice(&kind.to_ne_bytes());
        }
        buf
    }

    #[test]
    fn full_boot_handoff() {
        // 8 MiB machine: conventional memory below 640 KiB, upper memory
        // [1 MiB, 8 MiB). The kernel sits at [1 MiB, 2 MiB) and one boot
        // module at [7 MiB, 7.5 MiB).
        let mmap = mmap_bytes(&[(0, 0x9F000, 1), (0x10_0000, 0x70_0000, 1)]);

        let mut info = BootInfo::new(PhysRange::new(0x10_0000, 0x20_0000));
        info.mmap = Some(&mmap);
        info.mem_lower_kib = 636;
        info.mem_upper_kib = 7 * 1024;
        info.modules.push(crate::bootinfo::BootModule {
            body: PhysRange::new(0x70_0000, 0x78_0000),
            cmdline: None,
        });

        let mut mem = BootMem::bootstrap(&info);
        // Gaps: [2 MiB, 7 MiB) and [7.5 MiB, 8 MiB); the first wins.
        assert_eq!(mem.heap.start, 0x20_0000);
        assert_eq!(mem.heap.end, 0x70_0000);
        assert_eq!(mem.directmap_size(), 0x80_0000);

        // An early allocation comes off the top of the heap.
        let early = mem.bootalloc(2);
        assert_eq!(early, 0x6F_E000);

        // Load the segments and hand over to the page allocator. The
        // descriptor table for 1792 frames needs 11 pages and is carved
        // from the bottom of the heap's unused span.
        let vm = Box::new(crate::vm_page::VmPage::new());
        mem.setup(&vm);
        assert_eq!(mem.segments[SEG_DMA].avail_start, 0x20_0000);
        assert_eq!(mem.segments[SEG_DMA].avail_end, 0x6F_E000);

        let frames = 1792u64;
        let table_size = page_round(frames * core::mem::size_of::<crate::vm_page::PageDesc>() as u64);
        let layout =
            Layout::from_size_align((table_size + PAGE_SIZE) as usize, PAGE_SIZE as usize).unwrap();
        // SAFETY: non-zero size.
        let buf = unsafe { alloc_zeroed(layout) };
        assert!(!buf.is_null());
        let offset = (buf as u64).wrapping_sub(0x20_0000);
        // SAFETY: offset maps the table storage into `buf`.
        unsafe { vm.setup(offset) };
        assert!(vm.ready());

        // Released at setup: the avail window minus the table pages.
        let avail_frames = (0x6F_E000u64 - 0x20_0000) / PAGE_SIZE;
        let table_frames = table_size / PAGE_SIZE;
        assert_eq!(vm.mem_free(), avail_frames - table_frames);

        // The early bootstrap allocation stays reserved.
        let early_page = vm.lookup_pa(PhysAddr::new(early)).unwrap();
        // SAFETY: read-only peek at a descriptor the allocator owns.
        assert_eq!(
            unsafe { early_page.as_ref() }.page_type(),
            PageType::Reserved
        );
        // So does the kernel image.
        let kernel_page = vm.lookup_pa(PhysAddr::new(0x10_0000)).unwrap();
        assert_eq!(
            unsafe { kernel_page.as_ref() }.page_type(),
            PageType::Reserved
        );

        // free_usable reclaims what no window covered: the old module
        // area and the space above the heap, [7 MiB, 8 MiB).
        mem.free_usable(&vm);
        assert_eq!(vm.mem_free(), avail_frames - table_frames + 256);

        // The allocator is live: frames come back out of it.
        let page = vm
            .alloc_pa(0, crate::vm_page::Selector::Dma, PageType::Kernel)
            .expect("allocator is live");
        vm.free_pa(page, 0);

        // SAFETY: allocated above with this layout.
        unsafe { dealloc(buf, layout) };
    }
}
