//! # EMBER Core Types
//!
//! Fundamental type definitions used across the submission engine stack.
//!
//! These types provide:
//! - Strong typing for GPU addresses (never dereferenced directly)
//! - Task counter / fence value semantics
//! - Size and alignment guarantees

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// TASK COUNT
// =============================================================================

/// Monotonically increasing per-context submission counter.
///
/// The hardware writes the latest completed value to the context's fence
/// location; `fence >= recorded task count` is necessary and sufficient for
/// "safe to reuse".
pub type TaskCount = u32;

/// Sentinel task count forcing an unconditional drain.
///
/// Only valid after the caller has externally awaited full pipeline drain
/// (teardown path); it bypasses the fence completion check.
pub const TASK_COUNT_ALL: TaskCount = TaskCount::MAX;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// An address in the GPU's virtual address space. It is NOT a CPU pointer
/// and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(pub u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes (for device allocations)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 4 KiB (base page)
    pub const KIB_4: Self = Self(4 * 1024);
    /// 64 KiB (large page / default heap)
    pub const KIB_64: Self = Self(64 * 1024);
    /// 1 MiB
    pub const MIB_1: Self = Self(1024 * 1024);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get as KiB
    #[inline]
    pub const fn as_kib(self) -> u64 {
        self.0 / 1024
    }

    /// Align up
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Saturating subtraction
    #[inline]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Component-wise maximum
    #[inline]
    pub const fn max(self, rhs: Self) -> Self {
        if self.0 >= rhs.0 { self } else { rhs }
    }

    /// Component-wise minimum
    #[inline]
    pub const fn min(self, rhs: Self) -> Self {
        if self.0 <= rhs.0 { self } else { rhs }
    }
}

impl Add for ByteSize {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 * 1024 {
            write!(f, "{} GiB", self.0 / (1024 * 1024 * 1024))
        } else if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to an engine-managed resource
///
/// Handles are type-safe wrappers that prevent mixing different resource
/// kinds.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: core::marker::PhantomData<T>,
}

// Manual impls: derives would bound the marker type, which stays a bare
// uninstantiated tag
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: core::marker::PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>(0x{:x})", core::any::type_name::<T>(), self.id)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_addr_alignment() {
        let a = GpuAddr::new(0x1001);
        assert!(!a.is_aligned(0x1000));
        assert_eq!(a.align_up(0x1000), GpuAddr::new(0x2000));
        assert!(a.align_up(0x1000).is_aligned(0x1000));
    }

    #[test]
    fn test_byte_size_align_up() {
        let s = ByteSize::from_kib(100);
        assert_eq!(s.align_up(4096).as_bytes(), 100 * 1024);
        let odd = ByteSize::from_bytes(100 * 1024 + 1);
        assert_eq!(odd.align_up(4096).as_bytes(), 104 * 1024);
    }

    #[test]
    fn test_handle_identity() {
        struct Marker;
        let h = Handle::<Marker>::new(42);
        assert_eq!(h.id(), 42);
        assert!(!h.is_null());
        assert!(Handle::<Marker>::null().is_null());
    }

    #[test]
    fn test_handle_orders_without_marker_bounds() {
        // the marker implements nothing; comparison and map keying must
        // still work
        struct Marker;
        assert!(Handle::<Marker>::new(1) < Handle::<Marker>::new(2));
        assert_eq!(Handle::<Marker>::new(3), Handle::<Marker>::new(3));

        let mut map = alloc::collections::BTreeMap::new();
        map.insert(Handle::<Marker>::new(2), "late");
        map.insert(Handle::<Marker>::new(1), "early");
        assert_eq!(map.values().next(), Some(&"early"));
    }
}
