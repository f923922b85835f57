//! KPIO hardware core
//!
//! Typed MMIO regions, ACPI static tables, IOAPIC interrupt routing, the
//! PCI configuration space and the Virtio-over-PCI transport with its
//! block driver.
//!
//! # Bring-up
//!
//! The kernel supplies two services, [`memory::MemoryServices`] and
//! [`interrupts::InterruptController`], plus the physical address of the
//! ACPI RSDP. Everything else is discovered:
//!
//! ```ignore
//! let platform = Platform::bring_up(memory, interrupts, rsdp)?;
//! let mut registry = DriverRegistry::new();
//! let blk = VirtioBlockDriver::new();
//! let disks = blk.devices();
//! registry.register(Box::new(blk));
//! platform.scan_pci(&mut registry)?;
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(not(target_endian = "little"))]
compile_error!("kpio-hal assumes a little-endian target");

extern crate alloc;

pub mod acpi;
pub mod config;
pub mod error;
pub mod interrupts;
pub mod memory;
pub mod mmio;
pub mod pci;
pub mod platform;
pub mod virtio;

#[cfg(test)]
mod tests;

pub use error::{ConfigError, HalError, Result};
pub use memory::{DmaBuffer, MemoryServices};
pub use mmio::{Field, Region};
pub use platform::{Platform, Subsystem};
