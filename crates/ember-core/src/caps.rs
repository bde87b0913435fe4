//! # Engine Capabilities
//!
//! Per-hardware-family constants and the capability registry.
//!
//! Instead of a global dispatch table indexed by a hardware enumeration,
//! families register an `EngineCaps` entry once at process-wide
//! initialization; components receive the caps value they need rather than
//! reading a bare global.

use alloc::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::ByteSize;

// =============================================================================
// HARDWARE FAMILY
// =============================================================================

/// GPU hardware family (capability lookup key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum HardwareFamily {
    /// Turing (RTX 20xx)
    Turing = 0x160,
    /// Ampere (RTX 30xx)
    Ampere = 0x170,
    /// Ada Lovelace (RTX 40xx)
    Ada = 0x190,
    /// Blackwell (RTX 50xx)
    Blackwell = 0x1A0,
}

// =============================================================================
// ENGINE CAPS
// =============================================================================

/// Submission engine sizing and padding constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCaps {
    /// Cache line size (end-of-buffer marker padding)
    pub cache_line_size: u64,
    /// Base page granularity for heap backings
    pub page_size: u64,
    /// Large page granularity for command buffer backings
    pub large_page_size: u64,
    /// Hardware prefetch overfetch pad reserved past the usable stream
    pub overfetch_size: u64,
    /// Default size for a freshly allocated auxiliary heap
    pub default_heap_size: ByteSize,
    /// Hard ceiling for the surface-state heap
    pub surface_heap_limit: ByteSize,
    /// Nodes per tag pool block
    pub tag_pool_capacity: u32,
    /// Bytes per tag node (cache-line granular)
    pub tag_node_size: u64,
}

impl Default for EngineCaps {
    fn default() -> Self {
        Self {
            cache_line_size: 64,
            page_size: 4096,
            large_page_size: 64 * 1024,
            overfetch_size: 1024,
            default_heap_size: ByteSize::KIB_64,
            surface_heap_limit: ByteSize::MIB_1,
            tag_pool_capacity: 512,
            tag_node_size: 64,
        }
    }
}

impl EngineCaps {
    /// Usable capacity of the surface-state heap
    ///
    /// One page below the ceiling, guaranteeing headroom for hardware
    /// prefetch overfetch.
    #[inline]
    pub fn surface_heap_max_usable(&self) -> ByteSize {
        self.surface_heap_limit
            .saturating_sub(ByteSize::from_bytes(self.page_size))
    }
}

// =============================================================================
// CAPS REGISTRY
// =============================================================================

/// Explicit registry of per-family capabilities
///
/// Populated once during driver bring-up; looked up by family and passed by
/// value to the components that need it.
#[derive(Debug, Default)]
pub struct CapsRegistry {
    entries: BTreeMap<HardwareFamily, EngineCaps>,
}

impl CapsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Create a registry pre-populated with defaults for all known families
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for family in [
            HardwareFamily::Turing,
            HardwareFamily::Ampere,
            HardwareFamily::Ada,
            HardwareFamily::Blackwell,
        ] {
            registry.register(family, EngineCaps::default());
        }
        registry
    }

    /// Register a family's capabilities (later entries replace earlier ones)
    pub fn register(&mut self, family: HardwareFamily, caps: EngineCaps) {
        if self.entries.insert(family, caps).is_some() {
            log::debug!("caps: {:?} entry replaced", family);
        }
    }

    /// Look up a family's capabilities
    pub fn lookup(&self, family: HardwareFamily) -> Result<EngineCaps> {
        self.entries.get(&family).copied().ok_or(Error::NotFound)
    }

    /// Number of registered families
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = CapsRegistry::with_defaults();
        let caps = registry.lookup(HardwareFamily::Ampere).unwrap();
        assert_eq!(caps.cache_line_size, 64);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_registry_miss() {
        let registry = CapsRegistry::new();
        assert_eq!(
            registry.lookup(HardwareFamily::Turing),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_surface_heap_headroom() {
        let caps = EngineCaps::default();
        assert_eq!(
            caps.surface_heap_max_usable().as_bytes(),
            1024 * 1024 - 4096
        );
    }
}
