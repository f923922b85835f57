//! MADT (Multiple APIC Description Table) decoding

use alloc::vec::Vec;

use super::{AcpiTable, SDT_HEADER_SIZE};
use crate::error::{ConfigError, Result};
use crate::mmio::Region;

/// MADT entry types this decoder understands.
mod entry_type {
    pub const LOCAL_APIC: u8 = 0;
    pub const IO_APIC: u8 = 1;
    pub const INTERRUPT_SOURCE_OVERRIDE: u8 = 2;
    pub const LOCAL_APIC_ADDRESS_OVERRIDE: u8 = 5;
}

/// First entry follows the local APIC address and flags.
const ENTRIES_OFFSET: usize = SDT_HEADER_SIZE + 8;

/// Local APIC (one per processor)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalApic {
    pub processor_id: u8,
    pub apic_id: u8,
    pub enabled: bool,
}

/// I/O APIC as reported by firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicEntry {
    pub id: u8,
    pub address: u32,
    pub gsi_base: u32,
}

/// MPS INTI polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverridePolarity {
    /// Conforms to the bus (active high for ISA)
    Conforming,
    ActiveHigh,
    ActiveLow,
}

impl From<u16> for OverridePolarity {
    fn from(flags: u16) -> Self {
        match flags & 0b11 {
            0b01 => OverridePolarity::ActiveHigh,
            0b11 => OverridePolarity::ActiveLow,
            _ => OverridePolarity::Conforming,
        }
    }
}

/// MPS INTI trigger mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideTrigger {
    /// Conforms to the bus (edge for ISA)
    Conforming,
    Edge,
    Level,
}

impl From<u16> for OverrideTrigger {
    fn from(flags: u16) -> Self {
        match (flags >> 2) & 0b11 {
            0b01 => OverrideTrigger::Edge,
            0b11 => OverrideTrigger::Level,
            _ => OverrideTrigger::Conforming,
        }
    }
}

/// Interrupt source override: legacy IRQ -> GSI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptOverride {
    pub bus: u8,
    pub source_irq: u8,
    pub gsi: u32,
    pub polarity: OverridePolarity,
    pub trigger: OverrideTrigger,
}

/// Parsed MADT
#[derive(Debug, Clone, Default)]
pub struct Madt {
    /// Local APIC address (after any 64-bit override)
    pub local_apic_address: u64,
    /// MADT flags (bit 0: dual 8259 present)
    pub flags: u32,
    pub local_apics: Vec<LocalApic>,
    pub io_apics: Vec<IoApicEntry>,
    pub overrides: Vec<InterruptOverride>,
}

impl Madt {
    /// Decode the variable-length entry list of an `APIC` table.
    ///
    /// Entries are walked by their declared length. Unknown types are
    /// skipped; an entry that is shorter than 2 bytes, runs past the
    /// table end, or is too short for its type is a malformed table.
    pub fn parse(table: &AcpiTable) -> Result<Self> {
        let region = table.region();
        if region.len() < ENTRIES_OFFSET {
            return Err(ConfigError::MalformedTable("MADT").into());
        }

        let mut madt = Madt {
            local_apic_address: region.load::<u32>(SDT_HEADER_SIZE)? as u64,
            flags: region.load::<u32>(SDT_HEADER_SIZE + 4)?,
            ..Madt::default()
        };

        let mut offset = ENTRIES_OFFSET;
        while offset < region.len() {
            if offset + 2 > region.len() {
                return Err(ConfigError::MalformedTable("MADT entry header").into());
            }
            let kind = region.load::<u8>(offset)?;
            let length = region.load::<u8>(offset + 1)? as usize;
            if length < 2 || offset + length > region.len() {
                return Err(ConfigError::MalformedTable("MADT entry length").into());
            }
            let entry = region.sub(offset, length)?;
            madt.decode_entry(kind, &entry)?;
            offset += length;
        }

        log::debug!(
            "[ACPI] MADT: {} local APICs, {} I/O APICs, {} overrides",
            madt.local_apics.len(),
            madt.io_apics.len(),
            madt.overrides.len()
        );

        Ok(madt)
    }

    fn decode_entry(&mut self, kind: u8, entry: &Region) -> Result<()> {
        let need = match kind {
            entry_type::LOCAL_APIC => 8,
            entry_type::IO_APIC => 12,
            entry_type::INTERRUPT_SOURCE_OVERRIDE => 10,
            entry_type::LOCAL_APIC_ADDRESS_OVERRIDE => 12,
            _ => return Ok(()),
        };
        if entry.len() < need {
            return Err(ConfigError::MalformedTable("MADT entry").into());
        }

        match kind {
            entry_type::LOCAL_APIC => self.local_apics.push(LocalApic {
                processor_id: entry.load(2)?,
                apic_id: entry.load(3)?,
                enabled: entry.load::<u32>(4)? & 1 != 0,
            }),
            entry_type::IO_APIC => self.io_apics.push(IoApicEntry {
                id: entry.load(2)?,
                address: entry.load(4)?,
                gsi_base: entry.load(8)?,
            }),
            entry_type::INTERRUPT_SOURCE_OVERRIDE => {
                let flags = entry.load::<u16>(8)?;
                self.overrides.push(InterruptOverride {
                    bus: entry.load(2)?,
                    source_irq: entry.load(3)?,
                    gsi: entry.load(4)?,
                    polarity: OverridePolarity::from(flags),
                    trigger: OverrideTrigger::from(flags),
                });
            }
            _ => self.local_apic_address = entry.load::<u64>(4)?,
        }
        Ok(())
    }

    /// Override for a legacy IRQ; the first match wins.
    pub fn override_for(&self, irq: u8) -> Option<&InterruptOverride> {
        self.overrides.iter().find(|o| o.source_irq == irq)
    }
}
