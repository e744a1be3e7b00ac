use std::collections::BTreeMap;
use tracing::warn;

/// Width of the GPU virtual address space.
pub const GPU_VA_BITS: u32 = 48;
const GPU_VA_MASK: u64 = (1 << GPU_VA_BITS) - 1;

pub const PAGE_SIZE: u64 = 4096;

/// Sign-extend bit 47 into the upper bits, as the hardware expects in command streams.
#[must_use]
pub const fn canonize(address: u64) -> u64 {
    let shift = 64 - GPU_VA_BITS;
    (((address << shift) as i64) >> shift) as u64
}

/// Strip the sign extension; the form VM bind and the heap bookkeeping use.
#[must_use]
pub const fn decanonize(address: u64) -> u64 {
    address & GPU_VA_MASK
}

/// Round `value` up to the power-of-two `align`; `None` on overflow.
#[must_use]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(padded) => Some(padded & !(align - 1)),
        None => None,
    }
}

/// A managed range of GPU virtual address space.
///
/// First-fit hole search over a sorted map of occupied ranges. Every range is
/// padded with guard pages on both sides so an overrun faults instead of
/// landing in a neighbour.
#[derive(Debug)]
pub struct GpuVaHeap {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,

    // Reserved start (guard included) -> reserved size
    allocations: BTreeMap<u64, u64>,
}

impl GpuVaHeap {
    /// `base` and `limit` are decanonized; `limit` is exclusive.
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64, guard_pages: u64) -> Self {
        Self {
            base: decanonize(base),
            limit: decanonize(limit),
            align: align.max(PAGE_SIZE),
            guard_pages,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        let address = decanonize(address);
        address >= self.base && address < self.limit
    }

    /// Bytes currently reserved, guard pages included.
    #[must_use]
    pub fn reserved_bytes(&self) -> u64 {
        self.allocations.values().sum()
    }

    /// Reserve `size` bytes and return the canonical address of the usable range.
    pub fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(self.align);
        if !align.is_power_of_two() || size == 0 {
            return None;
        }
        let guard = self.guard_pages * PAGE_SIZE;
        let request = align_up(size, PAGE_SIZE)?.checked_add(guard * 2)?;

        // Place the usable start on `align`; the leading guard sits just below it.
        let place = |cursor: u64| Some(align_up(cursor.checked_add(guard)?, align)? - guard);

        let mut candidate = place(self.base)?;
        for (&start, &len) in &self.allocations {
            if start >= candidate && start - candidate >= request {
                break;
            }
            candidate = candidate.max(place(start + len)?);
        }

        if candidate.checked_add(request)? > self.limit {
            return None;
        }
        self.allocations.insert(candidate, request);
        Some(canonize(candidate + guard))
    }

    /// Release a range handed out by [`allocate`](Self::allocate).
    pub fn free(&mut self, address: u64) -> bool {
        let guard = self.guard_pages * PAGE_SIZE;
        let start = decanonize(address).wrapping_sub(guard);
        if self.allocations.remove(&start).is_none() {
            warn!(address = format_args!("{address:#x}"), "freeing untracked GPU VA");
            return false;
        }
        true
    }
}
