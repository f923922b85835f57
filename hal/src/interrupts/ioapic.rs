//! I/O APIC (Advanced Programmable Interrupt Controller) routing.
//!
//! Each I/O APIC serves a contiguous range of Global System Interrupts
//! `[gsi_base, gsi_end)`. Legacy ISA IRQs reach a GSI through the MADT
//! interrupt source overrides, or map 1:1 when no override exists.
//!
//! # Registers
//!
//! Two memory-mapped registers give indirect access to the rest:
//! - IOREGSEL (offset 0x00): selects the internal register.
//! - IOWIN (offset 0x10): data window for the selected register.
//!
//! # Redirection entries
//!
//! 64 bits each, at internal registers `0x10 + 2n` (low) and `0x11 + 2n`
//! (high):
//! - Bits 0-7: vector.
//! - Bits 8-10: delivery mode.
//! - Bit 11: destination mode (0 = physical).
//! - Bit 13: polarity (1 = active low).
//! - Bit 15: trigger mode (1 = level).
//! - Bit 16: mask.
//! - Bits 56-63: destination APIC ID.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{InterruptController, Irq, MaskSource};
use crate::acpi::{InterruptOverride, IoApicEntry, Madt, OverridePolarity};
use crate::config::IOAPIC_WINDOW_SIZE;
use crate::error::{ConfigError, Result};
use crate::memory::MemoryServices;
use crate::mmio::Field;

/// Register offsets inside the MMIO window.
mod regs {
    pub const IOREGSEL: usize = 0x00;
    pub const IOWIN: usize = 0x10;
}

/// Internal register indices.
mod internal {
    pub const IOAPICVER: u32 = 0x01;
    pub const IOREDTBL_BASE: u32 = 0x10;
}

/// Interrupt delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Deliver to the vector on every listed destination.
    Fixed = 0b000,
    /// Deliver to the lowest priority processor among the destinations.
    LowestPriority = 0b001,
    /// System management interrupt. Vector is ignored.
    Smi = 0b010,
    /// Non-maskable interrupt. Vector is ignored.
    Nmi = 0b100,
    /// INIT IPI to the destinations.
    Init = 0b101,
    /// Legacy 8259-compatible external interrupt.
    ExtInt = 0b111,
}

/// Pin polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Polarity {
    /// Line asserted when high.
    ActiveHigh = 0,
    /// Line asserted when low.
    ActiveLow = 1,
}

impl From<OverridePolarity> for Polarity {
    fn from(p: OverridePolarity) -> Self {
        match p {
            OverridePolarity::ActiveLow => Polarity::ActiveLow,
            OverridePolarity::ActiveHigh | OverridePolarity::Conforming => Polarity::ActiveHigh,
        }
    }
}

/// Trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerMode {
    /// Fires once per edge; no EOI to the I/O APIC.
    Edge = 0,
    /// Fires while the line stays asserted.
    Level = 1,
}

/// Redirection table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectionEntry {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    /// Destination mode (false = physical, true = logical).
    pub logical_destination: bool,
    pub polarity: Polarity,
    pub trigger_mode: TriggerMode,
    pub masked: bool,
    /// Destination APIC ID.
    pub destination: u8,
}

impl RedirectionEntry {
    /// The state every entry is put in at construction.
    pub const fn disabled() -> Self {
        RedirectionEntry {
            vector: 0,
            delivery_mode: DeliveryMode::Fixed,
            logical_destination: false,
            polarity: Polarity::ActiveHigh,
            trigger_mode: TriggerMode::Edge,
            masked: true,
            destination: 0,
        }
    }

    /// Encode as the 64-bit register value.
    pub fn to_u64(&self) -> u64 {
        let mut value: u64 = self.vector as u64;
        value |= (self.delivery_mode as u64) << 8;
        value |= (self.logical_destination as u64) << 11;
        value |= (self.polarity as u64) << 13;
        value |= (self.trigger_mode as u64) << 15;
        value |= (self.masked as u64) << 16;
        value |= (self.destination as u64) << 56;
        value
    }

    /// Decode a 64-bit register value.
    pub fn from_u64(value: u64) -> Self {
        RedirectionEntry {
            vector: value as u8,
            delivery_mode: match (value >> 8) & 0x7 {
                0b001 => DeliveryMode::LowestPriority,
                0b010 => DeliveryMode::Smi,
                0b100 => DeliveryMode::Nmi,
                0b101 => DeliveryMode::Init,
                0b111 => DeliveryMode::ExtInt,
                _ => DeliveryMode::Fixed,
            },
            logical_destination: (value >> 11) & 1 != 0,
            polarity: if (value >> 13) & 1 != 0 {
                Polarity::ActiveLow
            } else {
                Polarity::ActiveHigh
            },
            trigger_mode: if (value >> 15) & 1 != 0 {
                TriggerMode::Level
            } else {
                TriggerMode::Edge
            },
            masked: (value >> 16) & 1 != 0,
            destination: (value >> 56) as u8,
        }
    }
}

/// IOREGSEL/IOWIN pair plus the software copy of the redirection table.
struct Registers {
    select: Field<u32>,
    window: Field<u32>,
    shadow: Vec<RedirectionEntry>,
}

impl Registers {
    fn read(&self, reg: u32) -> u32 {
        self.select.write(reg);
        self.window.read()
    }

    fn write(&self, reg: u32, value: u32) {
        self.select.write(reg);
        self.window.write(value);
    }

    fn store(&mut self, index: usize, entry: RedirectionEntry) {
        let reg_low = internal::IOREDTBL_BASE + index as u32 * 2;
        let value = entry.to_u64();
        // High dword first so the entry never fires half-programmed.
        self.write(reg_low + 1, (value >> 32) as u32);
        self.write(reg_low, value as u32);
        self.shadow[index] = entry;
    }
}

/// One I/O APIC.
pub struct IoApic {
    id: u8,
    address: u64,
    gsi_base: u32,
    gsi_end: u32,
    regs: Mutex<Registers>,
}

impl IoApic {
    /// Map the controller described by a MADT entry, read its version
    /// register and mask every redirection entry.
    pub fn new(memory: &dyn MemoryServices, info: &IoApicEntry) -> Result<Self> {
        let address = info.address as u64;
        let window = memory.map(address, IOAPIC_WINDOW_SIZE)?;
        let mut regs = Registers {
            select: window.field(regs::IOREGSEL)?,
            window: window.field(regs::IOWIN)?,
            shadow: Vec::new(),
        };

        let version = regs.read(internal::IOAPICVER);
        let entries = ((version >> 16) & 0xFF) as usize + 1;
        let gsi_end = info
            .gsi_base
            .checked_add(entries as u32)
            .ok_or(ConfigError::MalformedTable("I/O APIC GSI range"))?;
        regs.shadow = alloc::vec![RedirectionEntry::disabled(); entries];
        for i in 0..entries {
            regs.store(i, RedirectionEntry::disabled());
        }

        log::info!(
            "[IOAPIC] ID={}, base={:#x}, GSI {}..{}",
            info.id,
            address,
            info.gsi_base,
            gsi_end
        );

        Ok(IoApic {
            id: info.id,
            address,
            gsi_base: info.gsi_base,
            gsi_end,
            regs: Mutex::new(regs),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Physical base address.
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn gsi_base(&self) -> u32 {
        self.gsi_base
    }

    /// First GSI past this controller.
    pub fn gsi_end(&self) -> u32 {
        self.gsi_end
    }

    /// Whether `gsi` is in `[gsi_base, gsi_end)`.
    pub fn handles_gsi(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_end
    }

    fn index(&self, gsi: u32) -> Result<usize> {
        if self.handles_gsi(gsi) {
            Ok((gsi - self.gsi_base) as usize)
        } else {
            Err(ConfigError::NoIoApicForGsi(gsi).into())
        }
    }

    /// Last entry programmed for `gsi`.
    pub fn entry(&self, gsi: u32) -> Result<RedirectionEntry> {
        let index = self.index(gsi)?;
        Ok(self.regs.lock().shadow[index])
    }

    /// Program the redirection entry for `gsi`.
    pub fn program(&self, gsi: u32, entry: RedirectionEntry) -> Result<()> {
        let index = self.index(gsi)?;
        self.regs.lock().store(index, entry);
        Ok(())
    }

    /// Set or clear the mask bit for `gsi`.
    pub fn set_masked(&self, gsi: u32, masked: bool) -> Result<()> {
        let index = self.index(gsi)?;
        let mut regs = self.regs.lock();
        let mut entry = regs.shadow[index];
        entry.masked = masked;
        regs.store(index, entry);
        Ok(())
    }

    /// Read the live entry back from the hardware.
    pub fn read_entry(&self, gsi: u32) -> Result<RedirectionEntry> {
        let index = self.index(gsi)?;
        let reg_low = internal::IOREDTBL_BASE + index as u32 * 2;
        let regs = self.regs.lock();
        let low = regs.read(reg_low);
        let high = regs.read(reg_low + 1);
        Ok(RedirectionEntry::from_u64((high as u64) << 32 | low as u64))
    }
}

/// All I/O APICs plus the MADT override table.
pub struct IoApicRouter {
    ioapics: Vec<IoApic>,
    overrides: Vec<InterruptOverride>,
    controller: Arc<dyn InterruptController>,
}

impl IoApicRouter {
    /// Bring up every I/O APIC listed in the MADT.
    pub fn new(
        memory: &dyn MemoryServices,
        madt: &Madt,
        controller: Arc<dyn InterruptController>,
    ) -> Result<Self> {
        if madt.io_apics.is_empty() {
            return Err(ConfigError::MalformedTable("MADT lists no I/O APIC").into());
        }
        let ioapics = madt
            .io_apics
            .iter()
            .map(|info| IoApic::new(memory, info))
            .collect::<Result<Vec<_>>>()?;

        Ok(IoApicRouter {
            ioapics,
            overrides: madt.overrides.clone(),
            controller,
        })
    }

    /// The I/O APIC serving `gsi`.
    pub fn find_by_gsi(&self, gsi: u32) -> Option<&IoApic> {
        self.ioapics.iter().find(|ioapic| ioapic.handles_gsi(gsi))
    }

    pub fn ioapics(&self) -> &[IoApic] {
        &self.ioapics
    }

    /// Legacy IRQ to GSI and polarity; the first matching override wins.
    pub fn resolve(&self, irq: u8) -> (u32, Polarity) {
        match self.overrides.iter().find(|o| o.source_irq == irq) {
            Some(o) => (o.gsi, o.polarity.into()),
            None => (irq as u32, Polarity::ActiveHigh),
        }
    }

    /// Route legacy IRQ `irq` to a freshly allocated vector.
    ///
    /// The entry is left masked, lowest-priority, and level-triggered
    /// whatever the firmware reports; the waiter unmasks it.
    pub fn register_irq(&self, irq: u8) -> Result<Irq> {
        let (gsi, polarity) = self.resolve(irq);
        self.register_gsi(gsi, polarity)
    }

    /// Route `gsi` directly.
    pub fn register_gsi(&self, gsi: u32, polarity: Polarity) -> Result<Irq> {
        let ioapic = self
            .find_by_gsi(gsi)
            .ok_or(ConfigError::NoIoApicForGsi(gsi))?;

        let source = MaskSource::IoApic {
            address: ioapic.address(),
            index: (gsi - ioapic.gsi_base()) as u8,
        };
        let vector = self.controller.allocate_vector(1, source)?;

        ioapic.program(
            gsi,
            RedirectionEntry {
                vector,
                delivery_mode: DeliveryMode::LowestPriority,
                logical_destination: false,
                polarity,
                trigger_mode: TriggerMode::Level,
                masked: true,
                destination: 0,
            },
        )?;

        log::debug!(
            "[IOAPIC] GSI {} -> vector {:#x} on IOAPIC {} ({:?})",
            gsi,
            vector,
            ioapic.id(),
            polarity
        );

        Ok(Irq::new(vector, source, self.controller.clone()))
    }

    /// Mask a GSI.
    pub fn mask(&self, gsi: u32) -> Result<()> {
        self.find_by_gsi(gsi)
            .ok_or(ConfigError::NoIoApicForGsi(gsi))?
            .set_masked(gsi, true)
    }

    /// Unmask a GSI.
    pub fn unmask(&self, gsi: u32) -> Result<()> {
        self.find_by_gsi(gsi)
            .ok_or(ConfigError::NoIoApicForGsi(gsi))?
            .set_masked(gsi, false)
    }
}
