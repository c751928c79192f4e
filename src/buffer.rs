//! Carving of one pinned, network-registered memory region.
//!
//! A [`BufferPool`] splits a region into sub-regions used as local targets of
//! one-sided and two-sided verbs:
//!
//! | sub-region | slot size | handed out by |
//! |---|---|---|
//! | page fetch | `page_size` | [`BufferPool::next_page_slot`] |
//! | sibling fetch | `page_size` | [`BufferPool::next_sibling_slot`] |
//! | compare-and-swap scratch | [`CAS_SLOT_SIZE`] | [`BufferPool::next_cas_slot`] |
//! | send / receive | whole span | [`BufferPool::send_region`], [`BufferPool::recv_region`] |
//!
//! Rings rotate round-robin and never allocate, block or fail. The pool does
//! not track in-flight operations: the caller must not reuse a slot before the
//! completion of the operation that last targeted it. One pool belongs to one
//! connection; rotation takes `&mut self`, so sharing a pool across threads
//! needs the caller's own synchronization.

use crate::error::{Error, Result};
use crate::state::CACHE_LINE_SIZE;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::marker::PhantomData;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Default size of one page-fetch slot.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// Size of one compare-and-swap scratch slot.
pub const CAS_SLOT_SIZE: usize = CACHE_LINE_SIZE;

/// Alignment of heap-backed pinned regions.
pub const REGION_ALIGN: usize = 4096;

/// Granularity of huge-page backed regions.
pub const HUGE_PAGE_SIZE: usize = 2 << 20;

const DEFAULT_PAGE_SLOTS: usize = 16;
const DEFAULT_SIBLING_SLOTS: usize = 4;
const DEFAULT_CAS_SLOTS: usize = 16;

#[derive(Debug)]
enum Backing {
    Heap(Layout),
    #[cfg(target_os = "linux")]
    HugePages { mapped_len: usize },
}

/// Owned, zeroed memory that stays at a fixed address for its whole lifetime.
///
/// Registration with the network adapter happens outside this crate; the
/// region only guarantees a stable base address and alignment.
#[derive(Debug)]
pub struct PinnedRegion {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: the region is plain bytes owned by this value; concurrent access to
// the bytes is governed by the verbs and slots that target them.
unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}

impl PinnedRegion {
    /// Allocate `len` zeroed bytes aligned to [`REGION_ALIGN`].
    pub fn allocate(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidBufferConfig(
                "pinned region length cannot be 0".into(),
            ));
        }

        let layout = Layout::from_size_align(len, REGION_ALIGN).map_err(|_| {
            Error::InvalidBufferConfig(format!("invalid region layout for {len} bytes"))
        })?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::AllocationFailed { bytes: len })?;

        debug!(len, "buffer.region.allocated");
        Ok(Self {
            ptr,
            len,
            backing: Backing::Heap(layout),
        })
    }

    /// Map `len` bytes (rounded up to [`HUGE_PAGE_SIZE`]) of anonymous huge pages.
    ///
    /// Fails with the OS error when no huge pages are available.
    #[cfg(target_os = "linux")]
    pub fn allocate_huge(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidBufferConfig(
                "pinned region length cannot be 0".into(),
            ));
        }
        let mapped_len = len
            .checked_next_multiple_of(HUGE_PAGE_SIZE)
            .ok_or(Error::AllocationFailed { bytes: len })?;

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            warn!(len = mapped_len, error = %err, "buffer.region.huge_page_map_failed");
            return Err(Error::Io(err));
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(Error::AllocationFailed { bytes: len })?;

        debug!(len, mapped_len, "buffer.region.huge_pages_mapped");
        Ok(Self {
            ptr,
            len,
            backing: Backing::HugePages { mapped_len },
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        match self.backing {
            // SAFETY: allocated in `allocate` with exactly this layout.
            Backing::Heap(layout) => unsafe { dealloc(self.ptr.as_ptr(), layout) },
            #[cfg(target_os = "linux")]
            Backing::HugePages { mapped_len } => {
                // SAFETY: mapped in `allocate_huge` with exactly this length.
                let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), mapped_len) };
                if ret != 0 {
                    warn!(
                        len = mapped_len,
                        error = %std::io::Error::last_os_error(),
                        "buffer.region.huge_page_unmap_failed"
                    );
                }
            }
        }
    }
}

/// Address and length of a piece of the registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSlot {
    ptr: NonNull<u8>,
    len: usize,
}

impl BufferSlot {
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Virtual address as posted in a work request.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as usize as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed-size slots over a sub-range, handed out round-robin.
///
/// The cursor starts at 0 and is read before it advances, so the first slot
/// handed out is slot 0. A cursor that increments before reading would start
/// at slot 1; only the position differs, the rotation order is the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotRing {
    offset: usize,
    slot_size: usize,
    slots: usize,
    cursor: usize,
}

impl SlotRing {
    fn new(offset: usize, slot_size: usize, slots: usize) -> Self {
        Self {
            offset,
            slot_size,
            slots,
            cursor: 0,
        }
    }

    #[inline]
    fn byte_len(&self) -> usize {
        self.slot_size * self.slots
    }

    /// Offset of the slot under the cursor; advances the cursor.
    #[inline]
    fn advance(&mut self) -> usize {
        let slot = self.cursor;
        self.cursor = (self.cursor + 1) % self.slots;
        self.offset + slot * self.slot_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    offset: usize,
    len: usize,
}

fn check_range(offset: usize, len: usize, align: usize, region_len: usize) -> Result<()> {
    if offset % align != 0 {
        return Err(Error::Misaligned { offset, align });
    }
    match offset.checked_add(len) {
        Some(end) if end <= region_len => Ok(()),
        _ => Err(Error::RegionOutOfBounds {
            offset,
            len,
            region_len,
        }),
    }
}

fn ring_len(slot_size: usize, slots: usize) -> Result<usize> {
    if slots == 0 {
        return Err(Error::InvalidBufferConfig(
            "a slot ring needs at least one slot".into(),
        ));
    }
    slot_size.checked_mul(slots).ok_or_else(|| {
        Error::InvalidBufferConfig(format!("{slots} slots of {slot_size} bytes overflow"))
    })
}

#[inline]
fn align_up(offset: usize, align: usize) -> Option<usize> {
    offset.checked_next_multiple_of(align)
}

/// Builder laying the sub-regions out back to back from the start of the region.
///
/// # Example
/// ```
/// use rdma_epoch::{BufferPool, PinnedRegion};
///
/// let region = PinnedRegion::allocate(1 << 20).unwrap();
/// let mut pool = BufferPool::builder(&region)
///     .page_slots(32)
///     .cas_slots(8)
///     .send_len(4096)
///     .recv_len(4096)
///     .build()
///     .unwrap();
///
/// let first = pool.next_page_slot();
/// assert_eq!(first.as_ptr(), region.as_ptr());
/// ```
pub struct BufferPoolBuilder<'r> {
    base: NonNull<u8>,
    len: usize,
    page_size: usize,
    page_slots: usize,
    sibling_slots: usize,
    cas_slots: usize,
    send_len: usize,
    recv_len: usize,
    _region: PhantomData<&'r PinnedRegion>,
}

impl<'r> BufferPoolBuilder<'r> {
    fn new(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            page_size: DEFAULT_PAGE_SIZE,
            page_slots: DEFAULT_PAGE_SLOTS,
            sibling_slots: DEFAULT_SIBLING_SLOTS,
            cas_slots: DEFAULT_CAS_SLOTS,
            send_len: 0,
            recv_len: 0,
            _region: PhantomData,
        }
    }

    /// Carve memory registered elsewhere, e.g. an adapter memory region.
    ///
    /// # Safety
    /// `base..base + len` must stay valid and at a fixed address for `'r`.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
        Self::new(base, len)
    }

    /// Size of one page / sibling slot. Must be a non-zero multiple of [`CAS_SLOT_SIZE`].
    ///
    /// Default: `1024`
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Default: `16`
    pub fn page_slots(mut self, slots: usize) -> Self {
        self.page_slots = slots;
        self
    }

    /// Default: `4`
    pub fn sibling_slots(mut self, slots: usize) -> Self {
        self.sibling_slots = slots;
        self
    }

    /// Default: `16`
    pub fn cas_slots(mut self, slots: usize) -> Self {
        self.cas_slots = slots;
        self
    }

    /// Bytes reserved for two-sided sends. Default: `0`
    pub fn send_len(mut self, len: usize) -> Self {
        self.send_len = len;
        self
    }

    /// Bytes reserved for two-sided receives. Default: `0`
    pub fn recv_len(mut self, len: usize) -> Self {
        self.recv_len = len;
        self
    }

    pub fn build(self) -> Result<BufferPool<'r>> {
        validate_page_size(self.page_size)?;

        let page_len = ring_len(self.page_size, self.page_slots)?;
        let sibling_len = ring_len(self.page_size, self.sibling_slots)?;
        let cas_len = ring_len(CAS_SLOT_SIZE, self.cas_slots)?;
        let overflow = || Error::RegionOutOfBounds {
            offset: usize::MAX,
            len: 0,
            region_len: self.len,
        };

        let page_offset = 0;
        let sibling_offset = page_offset + page_len;
        let cas_offset = sibling_offset.checked_add(sibling_len).ok_or_else(overflow)?;
        let send_offset = cas_offset.checked_add(cas_len).ok_or_else(overflow)?;
        let recv_offset = send_offset
            .checked_add(self.send_len)
            .and_then(|end| align_up(end, CACHE_LINE_SIZE))
            .ok_or_else(overflow)?;

        check_range(recv_offset, self.recv_len, 1, self.len)?;

        debug!(
            region_len = self.len,
            page_size = self.page_size,
            page_slots = self.page_slots,
            sibling_slots = self.sibling_slots,
            cas_slots = self.cas_slots,
            send_len = self.send_len,
            recv_len = self.recv_len,
            "buffer.pool.carved"
        );

        Ok(BufferPool {
            base: self.base,
            len: self.len,
            page_size: self.page_size,
            page: SlotRing::new(page_offset, self.page_size, self.page_slots),
            sibling: SlotRing::new(sibling_offset, self.page_size, self.sibling_slots),
            cas: SlotRing::new(cas_offset, CAS_SLOT_SIZE, self.cas_slots),
            send: Span {
                offset: send_offset,
                len: self.send_len,
            },
            recv: Span {
                offset: recv_offset,
                len: self.recv_len,
            },
            _region: PhantomData,
        })
    }
}

fn validate_page_size(page_size: usize) -> Result<()> {
    if page_size == 0 || page_size % CAS_SLOT_SIZE != 0 {
        return Err(Error::InvalidBufferConfig(format!(
            "page size {page_size} is not a non-zero multiple of {CAS_SLOT_SIZE}"
        )));
    }
    Ok(())
}

/// Per-connection carving of a pinned region into rotating verb targets.
///
/// See the [module documentation](self) for the layout.
#[derive(Debug)]
pub struct BufferPool<'r> {
    base: NonNull<u8>,
    len: usize,
    page_size: usize,
    page: SlotRing,
    sibling: SlotRing,
    cas: SlotRing,
    send: Span,
    recv: Span,
    _region: PhantomData<&'r PinnedRegion>,
}

// SAFETY: the pool only computes addresses inside a region that outlives it;
// it never dereferences them.
unsafe impl Send for BufferPool<'_> {}

impl<'r> BufferPool<'r> {
    pub fn builder(region: &'r PinnedRegion) -> BufferPoolBuilder<'r> {
        BufferPoolBuilder::new(region.ptr, region.len)
    }

    #[inline]
    fn slot_at(&self, offset: usize, len: usize) -> BufferSlot {
        // SAFETY: every configured offset was checked against `self.len`.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) };
        BufferSlot { ptr, len }
    }

    /// Re-point the page ring at `slots` slots starting at `offset`.
    pub fn set_page_region(&mut self, offset: usize, slots: usize) -> Result<()> {
        let len = ring_len(self.page_size, slots)?;
        check_range(offset, len, self.page_size, self.len)?;
        self.page = SlotRing::new(offset, self.page_size, slots);
        Ok(())
    }

    /// Re-point the sibling ring at `slots` slots starting at `offset`.
    pub fn set_sibling_region(&mut self, offset: usize, slots: usize) -> Result<()> {
        let len = ring_len(self.page_size, slots)?;
        check_range(offset, len, self.page_size, self.len)?;
        self.sibling = SlotRing::new(offset, self.page_size, slots);
        Ok(())
    }

    /// Re-point the compare-and-swap ring at `slots` cache lines starting at `offset`.
    pub fn set_cas_region(&mut self, offset: usize, slots: usize) -> Result<()> {
        let len = ring_len(CAS_SLOT_SIZE, slots)?;
        check_range(offset, len, CAS_SLOT_SIZE, self.len)?;
        self.cas = SlotRing::new(offset, CAS_SLOT_SIZE, slots);
        Ok(())
    }

    pub fn set_send_region(&mut self, offset: usize, len: usize) -> Result<()> {
        check_range(offset, len, 1, self.len)?;
        self.send = Span { offset, len };
        Ok(())
    }

    pub fn set_recv_region(&mut self, offset: usize, len: usize) -> Result<()> {
        check_range(offset, len, 1, self.len)?;
        self.recv = Span { offset, len };
        Ok(())
    }

    /// Next page-fetch target.
    #[inline]
    pub fn next_page_slot(&mut self) -> BufferSlot {
        let offset = self.page.advance();
        self.slot_at(offset, self.page_size)
    }

    /// Next sibling-fetch target.
    #[inline]
    pub fn next_sibling_slot(&mut self) -> BufferSlot {
        let offset = self.sibling.advance();
        self.slot_at(offset, self.page_size)
    }

    /// Next compare-and-swap scratch line.
    #[inline]
    pub fn next_cas_slot(&mut self) -> BufferSlot {
        let offset = self.cas.advance();
        self.slot_at(offset, CAS_SLOT_SIZE)
    }

    /// The whole page ring as one contiguous target, for range reads.
    #[inline]
    pub fn range_region(&self) -> BufferSlot {
        self.slot_at(self.page.offset, self.page.byte_len())
    }

    #[inline]
    pub fn send_region(&self) -> BufferSlot {
        self.slot_at(self.send.offset, self.send.len)
    }

    #[inline]
    pub fn recv_region(&self) -> BufferSlot {
        self.slot_at(self.recv.offset, self.recv.len)
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn page_slots(&self) -> usize {
        self.page.slots
    }

    #[inline]
    pub fn sibling_slots(&self) -> usize {
        self.sibling.slots
    }

    #[inline]
    pub fn cas_slots(&self) -> usize {
        self.cas.slots
    }

    /// Base address of the carved region.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Length of the carved region.
    #[inline]
    pub fn region_len(&self) -> usize {
        self.len
    }
}
