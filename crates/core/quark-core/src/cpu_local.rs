//! Per-CPU storage and thread pinning.
//!
//! Provides [`CpuLocal`] indexed by CPU ID, and [`pin`], which holds the
//! calling thread on its current CPU for the lifetime of the returned
//! guard. On kernel targets the CPU ID is read from the GS-based per-CPU
//! data structure; on host targets it is always 0 (single-threaded test
//! assumption).

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

/// Maximum supported CPUs. Matches the Kconfig upper bound.
pub const MAX_CPUS: usize = 256;

/// Per-CPU storage. Wraps `[T; MAX_CPUS]`, indexed by current CPU ID.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    ///
    /// If the GS base is not yet initialized (e.g. during AP early boot),
    /// `current_cpu_id()` may return garbage. In that case, falls back to
    /// CPU 0's slot to prevent an out-of-bounds panic.
    pub fn get(&self) -> &T {
        let id = current_cpu_id() as usize;
        if id < MAX_CPUS {
            &self.data[id]
        } else {
            &self.data[0]
        }
    }

    /// Returns a reference to a specific CPU's instance.
    ///
    /// # Panics
    ///
    /// Panics if `cpu >= MAX_CPUS`.
    pub fn get_for(&self, cpu: usize) -> &T {
        &self.data[cpu]
    }
}

// SAFETY: CpuLocal<T> is designed for per-CPU access. Send/Sync are safe
// because each CPU only accesses its own slot.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

/// Returns the current CPU ID.
///
/// On kernel targets, reads from the GS-based per-CPU data structure
/// (offset 24 = the per-CPU `cpu_id` field). On host targets, returns 0.
#[inline]
pub fn current_cpu_id() -> u32 {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    {
        // SAFETY: GS:[24] contains the cpu_id field of the per-CPU data,
        // valid after GS-base initialization during CPU init.
        unsafe {
            let id: u32;
            core::arch::asm!("mov {:e}, gs:[24]", out(reg) id, options(readonly, nostack));
            id
        }
    }
    #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
    {
        0
    }
}

/// Per-CPU count of outstanding [`PinnedCpu`] guards. The scheduler must
/// not migrate a thread off a CPU whose slot is non-zero.
static PIN_DEPTH: CpuLocal<AtomicU32> =
    CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

/// Pins the calling thread to its current CPU.
///
/// Per-CPU data indexed by [`PinnedCpu::id`] stays correct only while the
/// guard is alive: a preempted thread that resumed on another CPU would
/// otherwise touch the wrong slot.
pub fn pin() -> PinnedCpu {
    let cpu = current_cpu_id();
    PIN_DEPTH.get_for(cpu as usize).fetch_add(1, Ordering::Relaxed);
    PinnedCpu {
        cpu,
        _not_send: PhantomData,
    }
}

/// Returns the current CPU's pin depth.
pub fn pin_depth() -> u32 {
    PIN_DEPTH.get().load(Ordering::Relaxed)
}

/// RAII guard holding the current thread on one CPU.
///
/// `!Send` by construction: the guard is only meaningful on the CPU it
/// was taken on.
pub struct PinnedCpu {
    cpu: u32,
    _not_send: PhantomData<*mut ()>,
}

impl PinnedCpu {
    /// Returns the ID of the pinned CPU.
    pub fn id(&self) -> usize {
        self.cpu as usize
    }
}

impl Drop for PinnedCpu {
    fn drop(&mut self) {
        PIN_DEPTH
            .get_for(self.cpu as usize)
            .fetch_sub(1, Ordering::Relaxed);
    }
}
