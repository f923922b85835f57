//! HAL configuration constants.
//!
//! Compile-time limits and sizes shared by the bus, interrupt and
//! virtio layers. Behaviour switches live in Cargo features
//! (`msix`, `trace-queues`).

/// Page size (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Size of one function's configuration space in the ECAM window.
pub const ECAM_FUNCTION_SIZE: usize = 4096;

/// Bytes of ECAM window per bus (32 devices * 8 functions * 4 KB).
pub const ECAM_BUS_SIZE: usize = 1 << 20;

/// Upper bound on capability list nodes.
///
/// Capabilities are dword aligned and live in 0x40..0x100, so a
/// well-formed list can never hold more than 48 nodes.
pub const MAX_CAPABILITIES: usize = (256 - 0x40) / 4;

/// Block device sector size in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Bytes of DMA memory reserved per in-flight block request
/// (16-byte header, 1-byte status, padding).
pub const REQUEST_SLOT_SIZE: usize = 32;

/// MSI address window (local APIC, destination 0).
pub const MSI_ADDRESS_BASE: u64 = 0xFEE0_0000;

/// Size of the IOAPIC register window mapped per controller.
pub const IOAPIC_WINDOW_SIZE: usize = 0x20;
