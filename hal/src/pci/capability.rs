//! Capability list walk.
//!
//! The list is a chain of `{id, next}` nodes in configuration space,
//! rooted at the capabilities pointer (0x34). Firmware and devices can
//! hand us a cyclic or dangling list, so the walk is bounded by
//! [`MAX_CAPABILITIES`], refuses to revisit an offset and stops on
//! pointers into the standard header.

use super::{PciDevice, Status};
use crate::config::MAX_CAPABILITIES;

/// Capability IDs.
pub mod id {
    pub const POWER_MANAGEMENT: u8 = 0x01;
    pub const MSI: u8 = 0x05;
    /// Vendor-specific (virtio structures).
    pub const VENDOR: u8 = 0x09;
    pub const PCI_EXPRESS: u8 = 0x10;
    pub const MSIX: u8 = 0x11;
}

/// Lowest offset a capability may live at.
const FIRST_CAPABILITY_OFFSET: u8 = 0x40;

/// One node of the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub id: u8,
    /// Offset of the node in configuration space.
    pub offset: u8,
    pub next: u8,
}

/// Bounded iterator over a device's capability list.
pub struct Capabilities<'a> {
    device: &'a PciDevice,
    next: u8,
    visited: [u64; 4],
    steps: usize,
}

impl<'a> Capabilities<'a> {
    fn new(device: &'a PciDevice) -> Self {
        let next = if device.status().contains(Status::CAPABILITIES_LIST) {
            device.capabilities_pointer() & !0x3
        } else {
            0
        };
        Capabilities {
            device,
            next,
            visited: [0; 4],
            steps: 0,
        }
    }

    fn stop(&mut self) -> Option<Capability> {
        self.next = 0;
        None
    }
}

impl Iterator for Capabilities<'_> {
    type Item = Capability;

    fn next(&mut self) -> Option<Capability> {
        let offset = self.next;
        if offset == 0 {
            return None;
        }
        if offset < FIRST_CAPABILITY_OFFSET {
            log::warn!(
                "[PCI] {}: capability pointer {:#x} inside the header",
                self.device.address(),
                offset
            );
            return self.stop();
        }

        let (word, bit) = ((offset / 64) as usize, offset % 64);
        if self.visited[word] & (1 << bit) != 0 {
            log::warn!(
                "[PCI] {}: capability list loops back to {:#x}",
                self.device.address(),
                offset
            );
            return self.stop();
        }
        if self.steps >= MAX_CAPABILITIES {
            log::warn!("[PCI] {}: capability list too long", self.device.address());
            return self.stop();
        }
        self.visited[word] |= 1 << bit;
        self.steps += 1;

        let header = match self.device.read_config::<u16>(offset as usize) {
            Ok(h) => h,
            Err(_) => return self.stop(),
        };
        let cap = Capability {
            id: header as u8,
            offset,
            next: (header >> 8) as u8 & !0x3,
        };
        self.next = cap.next;
        Some(cap)
    }
}

impl PciDevice {
    /// Walk the capability list in order.
    pub fn capabilities(&self) -> Capabilities<'_> {
        Capabilities::new(self)
    }

    /// First capability with the given ID.
    pub fn find_capability(&self, id: u8) -> Option<Capability> {
        self.capabilities().find(|c| c.id == id)
    }
}
