//! PCI Express bus access through the ECAM window.
//!
//! # Configuration space
//!
//! Every function exposes 4 KiB of configuration space in the ECAM
//! window described by the MCFG table:
//!
//! ```text
//! offset = ((bus - start_bus) << 20) | (device << 15) | (function << 12)
//! ```
//!
//! # Bus topology
//!
//! - Bus (0-255): limited to the MCFG bus range
//! - Device (0-31)
//! - Function (0-7): only probed past 0 on multifunction devices

pub mod bar;
pub mod capability;
pub mod msix;
pub mod registry;

use core::fmt;

use crate::acpi::McfgAllocation;
use crate::config::{ECAM_BUS_SIZE, ECAM_FUNCTION_SIZE};
use crate::error::Result;
use crate::memory::MemoryServices;
use crate::mmio::{Field, FieldArray, Region, Register};

pub use bar::{Bar, BarAddress};
pub use capability::{Capabilities, Capability};
pub use msix::Msix;
pub use registry::{Claim, DriverRegistry, PciDriver};

/// Vendor ID read back from an empty slot.
pub const VENDOR_NONE: u16 = 0xFFFF;

/// Type 0 header register offsets.
pub mod offsets {
    pub const VENDOR_ID: usize = 0x00;
    pub const DEVICE_ID: usize = 0x02;
    pub const COMMAND: usize = 0x04;
    pub const STATUS: usize = 0x06;
    pub const CLASS_REVISION: usize = 0x08;
    pub const HEADER_TYPE: usize = 0x0E;
    pub const BAR0: usize = 0x10;
    pub const SUBSYSTEM_VENDOR_ID: usize = 0x2C;
    pub const SUBSYSTEM_ID: usize = 0x2E;
    pub const CAPABILITIES_POINTER: usize = 0x34;
    pub const INTERRUPT_LINE: usize = 0x3C;
    pub const INTERRUPT_PIN: usize = 0x3D;
}

bitflags::bitflags! {
    /// Command register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        const IO_SPACE = 1 << 0;
        const MEMORY_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const INTX_DISABLE = 1 << 10;
    }
}

bitflags::bitflags! {
    /// Status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u16 {
        const INTERRUPT = 1 << 3;
        const CAPABILITIES_LIST = 1 << 4;
    }
}

/// PCI device address (Bus:Device:Function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        debug_assert!(device < 32, "Device must be 0-31");
        debug_assert!(function < 8, "Function must be 0-7");
        Self {
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// PCI header types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    /// Standard device (Type 0).
    Standard,
    /// PCI-to-PCI bridge (Type 1).
    PciBridge,
    /// CardBus bridge (Type 2).
    CardBusBridge,
    Unknown(u8),
}

impl From<u8> for HeaderType {
    fn from(value: u8) -> Self {
        match value & 0x7F {
            0x00 => HeaderType::Standard,
            0x01 => HeaderType::PciBridge,
            0x02 => HeaderType::CardBusBridge,
            other => HeaderType::Unknown(other),
        }
    }
}

/// Class code triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciClass {
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

impl PciClass {
    pub const MASS_STORAGE: u8 = 0x01;
    pub const NETWORK: u8 = 0x02;
    pub const DISPLAY: u8 = 0x03;
    pub const BRIDGE: u8 = 0x06;

    pub fn is_storage(&self) -> bool {
        self.class == Self::MASS_STORAGE
    }
}

impl fmt::Display for PciClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}:{:02x}", self.class, self.subclass, self.prog_if)
    }
}

/// Registers of the common header, resolved once per function.
#[derive(Clone)]
struct Header {
    command: Field<u16>,
    status: Field<u16>,
    class_revision: Field<u32>,
    bars: FieldArray<u32>,
    subsystem_vendor_id: Field<u16>,
    subsystem_id: Field<u16>,
    capabilities_pointer: Field<u8>,
    interrupt_line: Field<u8>,
    interrupt_pin: Field<u8>,
}

impl Header {
    fn new(config: &Region) -> Result<Self> {
        Ok(Header {
            command: config.field(offsets::COMMAND)?,
            status: config.field(offsets::STATUS)?,
            class_revision: config.field(offsets::CLASS_REVISION)?,
            bars: config.array(offsets::BAR0, 6)?,
            subsystem_vendor_id: config.field(offsets::SUBSYSTEM_VENDOR_ID)?,
            subsystem_id: config.field(offsets::SUBSYSTEM_ID)?,
            capabilities_pointer: config.field(offsets::CAPABILITIES_POINTER)?,
            interrupt_line: config.field(offsets::INTERRUPT_LINE)?,
            interrupt_pin: config.field(offsets::INTERRUPT_PIN)?,
        })
    }
}

/// One present PCI function.
#[derive(Clone)]
pub struct PciDevice {
    address: PciAddress,
    config: Region,
    vendor_id: u16,
    device_id: u16,
    header_type: u8,
    header: Header,
}

impl PciDevice {
    /// Read the identity registers of a function's configuration space.
    ///
    /// Returns `None` for an absent function (vendor ID `0xFFFF`).
    pub fn probe(address: PciAddress, config: Region) -> Result<Option<Self>> {
        let vendor_id = config.field::<u16>(offsets::VENDOR_ID)?.read();
        if vendor_id == VENDOR_NONE {
            return Ok(None);
        }
        let header = Header::new(&config)?;
        Ok(Some(PciDevice {
            address,
            vendor_id,
            device_id: config.field::<u16>(offsets::DEVICE_ID)?.read(),
            header_type: config.field::<u8>(offsets::HEADER_TYPE)?.read(),
            header,
            config,
        }))
    }

    pub fn address(&self) -> PciAddress {
        self.address
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn header_type(&self) -> HeaderType {
        HeaderType::from(self.header_type)
    }

    /// Header type bit 7.
    pub fn is_multifunction(&self) -> bool {
        self.header_type & 0x80 != 0
    }

    pub fn class(&self) -> PciClass {
        let reg = self.header.class_revision.read();
        PciClass {
            class: (reg >> 24) as u8,
            subclass: (reg >> 16) as u8,
            prog_if: (reg >> 8) as u8,
        }
    }

    pub fn revision(&self) -> u8 {
        self.header.class_revision.read() as u8
    }

    pub fn subsystem_vendor_id(&self) -> u16 {
        self.header.subsystem_vendor_id.read()
    }

    pub fn subsystem_id(&self) -> u16 {
        self.header.subsystem_id.read()
    }

    /// Legacy interrupt line assigned by firmware.
    pub fn interrupt_line(&self) -> u8 {
        self.header.interrupt_line.read()
    }

    /// INTx pin (0 = none, 1 = INTA# ...).
    pub fn interrupt_pin(&self) -> u8 {
        self.header.interrupt_pin.read()
    }

    pub fn command(&self) -> Command {
        Command::from_bits_retain(self.header.command.read())
    }

    pub fn set_command(&self, command: Command) {
        self.header.command.write(command.bits());
    }

    pub fn status(&self) -> Status {
        Status::from_bits_retain(self.header.status.read())
    }

    /// Let the device issue DMA.
    pub fn enable_bus_master(&self) {
        self.set_command(self.command() | Command::BUS_MASTER);
    }

    /// Decode memory BARs.
    pub fn enable_memory_space(&self) {
        self.set_command(self.command() | Command::MEMORY_SPACE);
    }

    /// Stop asserting INTx (used once MSI-X takes over).
    pub fn disable_intx(&self) {
        self.set_command(self.command() | Command::INTX_DISABLE);
    }

    /// Raw capabilities pointer register.
    pub fn capabilities_pointer(&self) -> u8 {
        self.header.capabilities_pointer.read()
    }

    /// Whole 4 KiB configuration space.
    pub fn config(&self) -> &Region {
        &self.config
    }

    /// Read a configuration register at a device-supplied offset.
    pub fn read_config<T: Register>(&self, offset: usize) -> Result<T> {
        Ok(self.config.field::<T>(offset)?.read())
    }

    /// Write a configuration register at a device-supplied offset.
    pub fn write_config<T: Register>(&self, offset: usize, value: T) -> Result<()> {
        self.config.field::<T>(offset)?.write(value);
        Ok(())
    }

    /// Whether this is a virtio function (vendor 0x1AF4).
    pub fn is_virtio(&self) -> bool {
        self.vendor_id == crate::virtio::VIRTIO_VENDOR_ID
    }
}

impl fmt::Display for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:04x}:{:04x} class={} {}",
            self.address,
            self.vendor_id,
            self.device_id,
            self.class(),
            if self.is_virtio() { "(VirtIO)" } else { "" }
        )
    }
}

impl fmt::Debug for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciDevice")
            .field("address", &self.address)
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("device_id", &format_args!("{:#06x}", self.device_id))
            .field("header_type", &self.header_type())
            .finish()
    }
}

/// The mapped ECAM window of PCI segment group 0.
pub struct EcamWindow {
    region: Region,
    base: u64,
    start_bus: u8,
    end_bus: u8,
}

impl EcamWindow {
    /// Map the window described by an MCFG allocation.
    pub fn map(memory: &dyn MemoryServices, allocation: &McfgAllocation) -> Result<Self> {
        let len = allocation.bus_count() * ECAM_BUS_SIZE;
        let region = memory.map(allocation.base, len)?;
        log::info!(
            "[PCI] ECAM at {:#x}, buses {}..={}",
            allocation.base,
            allocation.start_bus,
            allocation.end_bus
        );
        Ok(EcamWindow {
            region,
            base: allocation.base,
            start_bus: allocation.start_bus,
            end_bus: allocation.end_bus,
        })
    }

    /// Physical base of the window.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn bus_range(&self) -> (u8, u8) {
        (self.start_bus, self.end_bus)
    }

    /// Configuration space of one function.
    pub fn function_region(&self, address: PciAddress) -> Result<Region> {
        let offset = ((address.bus.wrapping_sub(self.start_bus) as usize) << 20)
            | ((address.device as usize) << 15)
            | ((address.function as usize) << 12);
        self.region.sub(offset, ECAM_FUNCTION_SIZE)
    }

    /// Probe one function.
    pub fn probe(&self, address: PciAddress) -> Result<Option<PciDevice>> {
        PciDevice::probe(address, self.function_region(address)?)
    }

    /// Walk every bus, device and function in the window and hand each
    /// present function to `sink`. Returns the number found.
    pub fn scan(&self, mut sink: impl FnMut(PciDevice)) -> Result<usize> {
        let mut found = 0;
        for bus in self.start_bus..=self.end_bus {
            for device in 0..32 {
                let Some(function0) = self.probe(PciAddress::new(bus, device, 0))? else {
                    continue;
                };
                let multifunction = function0.is_multifunction();
                log::debug!("[PCI] {}", function0);
                sink(function0);
                found += 1;

                if !multifunction {
                    continue;
                }
                for function in 1..8 {
                    if let Some(dev) = self.probe(PciAddress::new(bus, device, function))? {
                        log::debug!("[PCI] {}", dev);
                        sink(dev);
                        found += 1;
                    }
                }
            }
        }
        log::info!("[PCI] Found {} function(s)", found);
        Ok(found)
    }
}
