//! MSI-X (capability 0x11).
//!
//! The table lives in a BAR at `table_offset`; each 16-byte entry is
//! `{address_lo, address_hi, data, vector_control}`. Bit 0 of
//! `vector_control` masks the entry.

use alloc::sync::Arc;

use super::capability::id;
use super::PciDevice;
use crate::config::MSI_ADDRESS_BASE;
use crate::error::{ConfigError, HalError, Result};
use crate::interrupts::{InterruptController, Irq, MaskSource};
use crate::memory::MemoryServices;
use crate::mmio::{Field, Region};

const ENTRY_SIZE: usize = 16;
const VECTOR_CONTROL: usize = 12;
const ENTRY_MASKED: u32 = 1;
const TABLE_SIZE_MASK: u16 = 0x07FF;
/// Lowest-priority delivery in the MSI data word.
const DATA_LOWEST_PRIORITY: u32 = 1 << 8;

bitflags::bitflags! {
    /// Message control register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageControl: u16 {
        const FUNCTION_MASK = 1 << 14;
        const ENABLE = 1 << 15;
    }
}

/// A function's MSI-X table.
pub struct Msix {
    control: Field<u16>,
    table: Region,
    table_phys: u64,
    entries: u16,
}

impl Msix {
    /// Locate and map the table, masking every entry.
    ///
    /// Returns `None` when the function has no MSI-X capability.
    pub fn new(device: &PciDevice, memory: &dyn MemoryServices) -> Result<Option<Self>> {
        let Some(cap) = device.find_capability(id::MSIX) else {
            return Ok(None);
        };
        let base = cap.offset as usize;
        let control = device.config().field::<u16>(base + 2)?;
        let entries = (control.read() & TABLE_SIZE_MASK) + 1;

        let table_reg = device.read_config::<u32>(base + 4)?;
        let bir = (table_reg & 0x7) as u8;
        let table_phys = device.bar_address(bir)?.base() + (table_reg & !0x7) as u64;
        if table_phys == 0 {
            return Err(ConfigError::UnusableBar(bir).into());
        }
        let table = memory.map(table_phys, entries as usize * ENTRY_SIZE)?;

        let msix = Msix {
            control,
            table,
            table_phys,
            entries,
        };
        msix.control
            .update(|c| c | MessageControl::FUNCTION_MASK.bits());
        for entry in 0..entries {
            msix.set_masked(entry, true)?;
        }

        log::debug!(
            "[PCI] {}: MSI-X table of {} entries at {:#x}",
            device.address(),
            entries,
            table_phys
        );
        Ok(Some(msix))
    }

    /// Number of table entries.
    pub fn table_size(&self) -> u16 {
        self.entries
    }

    fn entry_field(&self, entry: u16, offset: usize) -> Result<Field<u32>> {
        if entry >= self.entries {
            return Err(HalError::OutOfBounds {
                offset: entry as usize * ENTRY_SIZE,
                size: ENTRY_SIZE,
                limit: self.table.len(),
            });
        }
        self.table.field(entry as usize * ENTRY_SIZE + offset)
    }

    /// Allocate a vector for `entry` and program its address/data pair.
    /// The entry stays masked until the waiter unmasks it.
    pub fn configure_entry(
        &self,
        entry: u16,
        controller: &Arc<dyn InterruptController>,
    ) -> Result<Irq> {
        let vector_control = self.entry_field(entry, VECTOR_CONTROL)?;
        let source = MaskSource::Msix {
            control: self.table_phys + (entry as usize * ENTRY_SIZE + VECTOR_CONTROL) as u64,
        };
        let vector = controller.allocate_vector(1, source)?;

        vector_control.write(ENTRY_MASKED);
        self.entry_field(entry, 0)?.write(MSI_ADDRESS_BASE as u32);
        self.entry_field(entry, 4)?.write((MSI_ADDRESS_BASE >> 32) as u32);
        self.entry_field(entry, 8)?
            .write(DATA_LOWEST_PRIORITY | vector as u32);

        Ok(Irq::new(vector, source, controller.clone()))
    }

    /// Allocate vectors for entries `0..count`.
    pub fn configure(
        &self,
        count: u16,
        controller: &Arc<dyn InterruptController>,
    ) -> Result<alloc::vec::Vec<Irq>> {
        (0..count)
            .map(|entry| self.configure_entry(entry, controller))
            .collect()
    }

    /// Set or clear the per-entry mask.
    pub fn set_masked(&self, entry: u16, masked: bool) -> Result<()> {
        let ctrl = self.entry_field(entry, VECTOR_CONTROL)?;
        ctrl.update(|c| if masked { c | ENTRY_MASKED } else { c & !ENTRY_MASKED });
        Ok(())
    }

    /// Enable MSI-X and lift the function-wide mask. INTx is disabled.
    pub fn enable(&self, device: &PciDevice) {
        device.disable_intx();
        self.control.update(|c| {
            (MessageControl::from_bits_retain(c) - MessageControl::FUNCTION_MASK
                | MessageControl::ENABLE)
                .bits()
        });
    }

    pub fn is_enabled(&self) -> bool {
        MessageControl::from_bits_retain(self.control.read()).contains(MessageControl::ENABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{EcamWindow, PciAddress};
    use crate::tests::sim::{SimEcam, SimInterrupts, SimMemory};

    #[test]
    fn test_configure_programs_entries() {
        let mem = SimMemory::new();
        let ecam = SimEcam::new(&mem, 0, 0);
        let addr = PciAddress::new(0, 3, 0);
        ecam.add_function(addr, 0x1AF4, 0x1042, 0);
        let bar = mem.allocate_region(0x1000);
        let bar_phys = mem.phys(&bar);
        ecam.add_msix(addr, 0x40, bar_phys, 0x800, 4);

        let window = EcamWindow::map(&mem, &ecam.allocation()).unwrap();
        let dev = window.probe(addr).unwrap().unwrap();
        let msix = Msix::new(&dev, &mem).unwrap().unwrap();
        assert_eq!(msix.table_size(), 4);
        assert_eq!(bar.load::<u32>(0x800 + 3 * 16 + 12).unwrap(), 1);

        let sim = Arc::new(SimInterrupts::new());
        let controller: Arc<dyn InterruptController> = sim.clone();
        let irqs = msix.configure(2, &controller).unwrap();
        assert_eq!(irqs.len(), 2);
        let entry1 = 0x800 + 16;
        assert_eq!(bar.load::<u32>(entry1).unwrap(), 0xFEE0_0000);
        assert_eq!(bar.load::<u32>(entry1 + 8).unwrap(), 0x100 | irqs[1].vector() as u32);
        assert_eq!(
            irqs[1].source(),
            MaskSource::Msix {
                control: bar_phys + entry1 as u64 + 12
            }
        );
        assert_eq!(sim.mask_sources().len(), 2);

        msix.enable(&dev);
        assert!(msix.is_enabled());
        assert!(dev.command().contains(crate::pci::Command::INTX_DISABLE));
        assert!(msix.configure_entry(4, &controller).is_err());
    }
}
