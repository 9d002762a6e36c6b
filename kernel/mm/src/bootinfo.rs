//! Boot-loader-independent boot description.
//!
//! [`BootInfo`] is what [`crate::biosmem`] actually consumes: the raw
//! firmware memory map (or the conventional/upper split when the loader
//! passed none) plus every region the boot loader left in RAM that the
//! kernel must not overwrite. [`BootInfo::from_multiboot`] performs the
//! one walk over the raw Multiboot records, measuring command-line
//! strings and picking out the ELF symbol and string tables, so nothing
//! downstream ever touches loader memory again.

use planck_noalloc::vec::ArrayVec;
use quark_multiboot::{ElfShdr, InfoFlags, RawInfo, RawModule, SHT_STRTAB, SHT_SYMTAB};

/// Capacity of the boot module list.
pub const MAX_MODULES: usize = 16;

/// Capacity of the ELF section range list.
pub const MAX_SECTIONS: usize = 32;

/// A half-open physical address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    /// First address of the range.
    pub start: u64,
    /// One past the last address of the range.
    pub end: u64,
}

impl PhysRange {
    /// Creates a range from its bounds.
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The empty range at address zero.
    pub const fn empty() -> Self {
        Self { start: 0, end: 0 }
    }

    /// Returns the byte length of the range.
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` if the range covers no addresses.
    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Returns `true` if `addr` falls inside the range.
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// A boot module and its command line.
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    /// The module body.
    pub body: PhysRange,
    /// The module command line, if the loader passed one.
    pub cmdline: Option<PhysRange>,
}

/// Everything the boot loader left in RAM, in loader-independent form.
#[derive(Debug)]
pub struct BootInfo<'a> {
    /// Raw BIOS memory-map buffer, if the loader provided one.
    pub mmap: Option<&'a [u8]>,
    /// KiB of conventional memory starting at physical 0.
    pub mem_lower_kib: u32,
    /// KiB of upper memory starting at 1 MiB.
    pub mem_upper_kib: u32,
    /// The kernel image.
    pub kernel: PhysRange,
    /// The kernel command line, NUL terminator included.
    pub cmdline: Option<PhysRange>,
    /// The module table itself.
    pub module_table: Option<PhysRange>,
    /// The boot modules.
    pub modules: ArrayVec<BootModule, MAX_MODULES>,
    /// ELF ranges: the section header table plus the symbol and string
    /// table sections.
    pub sections: ArrayVec<PhysRange, MAX_SECTIONS>,
}

impl<'a> BootInfo<'a> {
    /// Creates an empty description carrying only the kernel image range.
    pub fn new(kernel: PhysRange) -> Self {
        Self {
            mmap: None,
            mem_lower_kib: 0,
            mem_upper_kib: 0,
            kernel,
            cmdline: None,
            module_table: None,
            modules: ArrayVec::new(),
            sections: ArrayVec::new(),
        }
    }

    /// Builds a `BootInfo` from the raw Multiboot information structure.
    ///
    /// `phys_to_virt` maps a physical address to a readable pointer; on
    /// the boot CPU this is the identity map set up by the loader.
    ///
    /// # Safety
    ///
    /// Every address reachable through `mbi` (command line, module table,
    /// module strings, section header table) must be mapped and readable
    /// via `phys_to_virt` for its full extent, and strings must be NUL
    /// terminated.
    pub unsafe fn from_multiboot(
        mbi: &RawInfo,
        kernel: PhysRange,
        phys_to_virt: impl Fn(u64) -> *const u8,
    ) -> Self {
        let flags = InfoFlags::from_bits_truncate(mbi.flags);
        let mut info = Self::new(kernel);

        if flags.contains(InfoFlags::MEMORY) {
            info.mem_lower_kib = mbi.mem_lower;
            info.mem_upper_kib = mbi.mem_upper;
        }

        if flags.contains(InfoFlags::MMAP) && mbi.mmap_length != 0 {
            let ptr = phys_to_virt(u64::from(mbi.mmap_addr));
            // SAFETY: The caller guarantees the map buffer is mapped and
            // readable for mmap_length bytes.
            info.mmap =
                Some(unsafe { core::slice::from_raw_parts(ptr, mbi.mmap_length as usize) });
        }

        if flags.contains(InfoFlags::CMDLINE) && mbi.cmdline != 0 {
            let start = u64::from(mbi.cmdline);
            // SAFETY: The caller guarantees a mapped, NUL-terminated string.
            let len = unsafe { strlen(phys_to_virt(start)) } as u64 + 1;
            info.cmdline = Some(PhysRange::new(start, start + len));
        }

        if flags.contains(InfoFlags::MODULES) && mbi.mods_count != 0 {
            let table_start = u64::from(mbi.mods_addr);
            let entry_size = core::mem::size_of::<RawModule>() as u64;
            info.module_table = Some(PhysRange::new(
                table_start,
                table_start + u64::from(mbi.mods_count) * entry_size,
            ));

            for i in 0..u64::from(mbi.mods_count) {
                if info.modules.is_full() {
                    break;
                }
                let entry_ptr = phys_to_virt(table_start + i * entry_size).cast::<RawModule>();
                // SAFETY: The caller guarantees the module table is mapped
                // for mods_count entries.
                let module = unsafe { entry_ptr.read_unaligned() };

                let cmdline = if module.string != 0 {
                    let start = u64::from(module.string);
                    // SAFETY: Mapped, NUL-terminated module string.
                    let len = unsafe { strlen(phys_to_virt(start)) } as u64 + 1;
                    Some(PhysRange::new(start, start + len))
                } else {
                    None
                };

                info.modules.push(BootModule {
                    body: PhysRange::new(u64::from(module.start), u64::from(module.end)),
                    cmdline,
                });
            }
        }

        if flags.contains(InfoFlags::SHDR) && mbi.shdr_num != 0 {
            let table_start = u64::from(mbi.shdr_addr);
            info.sections.push(PhysRange::new(
                table_start,
                table_start + u64::from(mbi.shdr_num) * u64::from(mbi.shdr_size),
            ));

            for i in 0..u64::from(mbi.shdr_num) {
                if info.sections.is_full() {
                    break;
                }
                let shdr_ptr =
                    phys_to_virt(table_start + i * u64::from(mbi.shdr_size)).cast::<ElfShdr>();
                // SAFETY: The caller guarantees the section header table
                // is mapped for shdr_num entries of shdr_size bytes.
                let shdr = unsafe { shdr_ptr.read_unaligned() };

                if (shdr.shtype == SHT_SYMTAB || shdr.shtype == SHT_STRTAB) && shdr.addr != 0 {
                    info.sections.push(PhysRange::new(
                        u64::from(shdr.addr),
                        u64::from(shdr.addr) + u64::from(shdr.size),
                    ));
                }
            }
        }

        info
    }
}

/// Measures a NUL-terminated string.
///
/// # Safety
///
/// `p` must point to a readable, NUL-terminated byte string.
unsafe fn strlen(mut p: *const u8) -> usize {
    let mut n = 0;
    // SAFETY: The caller guarantees readability up to the terminator.
    while unsafe { p.read() } != 0 {
        // SAFETY: Still before the terminator.
        p = unsafe { p.add(1) };
        n += 1;
    }
    n
}
