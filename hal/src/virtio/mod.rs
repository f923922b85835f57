//! VirtIO over PCI.
//!
//! Modern (virtio 1.x) devices only: configuration goes through the
//! vendor-specific capabilities, and queues use the split-ring layout.

pub mod block;
pub mod queue;
pub mod transport;

use core::fmt;

pub use block::{BlockError, BlockRequest, VirtioBlock, VirtioBlockDriver};
pub use queue::{Descriptor, DescriptorState, Virtqueue};
pub use transport::VirtioPciTransport;

/// PCI vendor ID of every virtio function.
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;

bitflags::bitflags! {
    /// Device status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Guest OS has found the device.
        const ACKNOWLEDGE = 1;
        /// Guest OS knows how to drive the device.
        const DRIVER = 2;
        /// Driver is set up and ready to drive the device.
        const DRIVER_OK = 4;
        /// Feature negotiation is complete.
        const FEATURES_OK = 8;
        /// Device hit an error it cannot recover from.
        const DEVICE_NEEDS_RESET = 64;
        /// Driver gave up on the device.
        const FAILED = 128;
    }
}

bitflags::bitflags! {
    /// Device-independent feature bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u64 {
        /// Indirect descriptor tables.
        const RING_INDIRECT_DESC = 1 << 28;
        /// `used_event`/`avail_event` notification suppression.
        const RING_EVENT_IDX = 1 << 29;
        /// Modern (1.0+) interface.
        const VERSION_1 = 1 << 32;
        /// Device DMA goes through the platform IOMMU.
        const ACCESS_PLATFORM = 1 << 33;
        /// Packed virtqueue layout.
        const RING_PACKED = 1 << 34;
    }
}

/// VirtIO device types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Network,
    Block,
    Console,
    Entropy,
    Filesystem,
    Unknown(u16),
}

impl DeviceType {
    /// Device type of a virtio PCI device ID.
    ///
    /// 0x1000-0x103F are transitional IDs, 0x1040+ modern ones
    /// (0x1040 + virtio device id).
    pub fn from_pci_id(device_id: u16) -> Self {
        match device_id {
            0x1001 | 0x1042 => DeviceType::Block,
            0x1000 | 0x1041 => DeviceType::Network,
            0x1003 | 0x1043 => DeviceType::Console,
            0x1005 | 0x1044 => DeviceType::Entropy,
            0x1009 | 0x105A => DeviceType::Filesystem,
            other => DeviceType::Unknown(other),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Network => write!(f, "Network"),
            DeviceType::Block => write!(f, "Block"),
            DeviceType::Console => write!(f, "Console"),
            DeviceType::Entropy => write!(f, "Entropy"),
            DeviceType::Filesystem => write!(f, "Filesystem"),
            DeviceType::Unknown(id) => write!(f, "Unknown({:#x})", id),
        }
    }
}
