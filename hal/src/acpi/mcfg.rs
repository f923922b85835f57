//! MCFG (PCI Express memory-mapped configuration) decoding

use alloc::vec::Vec;

use super::{AcpiTable, SDT_HEADER_SIZE};
use crate::error::{ConfigError, Result};

/// Allocations follow the header and 8 reserved bytes.
const ALLOCATIONS_OFFSET: usize = SDT_HEADER_SIZE + 8;
const ALLOCATION_SIZE: usize = 16;

/// One ECAM window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McfgAllocation {
    /// Physical base of the window (bus `start_bus`, device 0, function 0)
    pub base: u64,
    pub segment: u16,
    pub start_bus: u8,
    pub end_bus: u8,
}

impl McfgAllocation {
    /// Number of buses covered.
    pub fn bus_count(&self) -> usize {
        (self.end_bus as usize).saturating_sub(self.start_bus as usize) + 1
    }
}

/// Parsed MCFG
#[derive(Debug, Clone)]
pub struct Mcfg {
    allocations: Vec<McfgAllocation>,
}

impl Mcfg {
    /// Decode every allocation structure in the table.
    pub fn parse(table: &AcpiTable) -> Result<Self> {
        let region = table.region();
        if region.len() < ALLOCATIONS_OFFSET
            || (region.len() - ALLOCATIONS_OFFSET) % ALLOCATION_SIZE != 0
        {
            return Err(ConfigError::MalformedTable("MCFG").into());
        }

        let count = (region.len() - ALLOCATIONS_OFFSET) / ALLOCATION_SIZE;
        let mut allocations = Vec::with_capacity(count);
        for i in 0..count {
            let at = ALLOCATIONS_OFFSET + i * ALLOCATION_SIZE;
            let window = McfgAllocation {
                base: region.load(at)?,
                segment: region.load(at + 8)?,
                start_bus: region.load(at + 10)?,
                end_bus: region.load(at + 11)?,
            };
            if window.end_bus < window.start_bus {
                return Err(ConfigError::MalformedTable("MCFG bus range").into());
            }
            allocations.push(window);
        }

        Ok(Mcfg { allocations })
    }

    /// All allocations, including ones for other segment groups.
    pub fn allocations(&self) -> &[McfgAllocation] {
        &self.allocations
    }

    /// The segment group 0 window; other segments are ignored.
    pub fn segment0(&self) -> Result<McfgAllocation> {
        for window in self.allocations.iter().filter(|a| a.segment != 0) {
            log::warn!(
                "[ACPI] MCFG: ignoring segment group {} at {:#x}",
                window.segment,
                window.base
            );
        }
        self.allocations
            .iter()
            .find(|a| a.segment == 0)
            .copied()
            .ok_or_else(|| {
                let seg = self.allocations.first().map(|a| a.segment).unwrap_or(0);
                ConfigError::UnsupportedSegment(seg).into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acpi::AcpiTables;
    use crate::error::HalError;
    use crate::tests::sim::{self, SimMemory};

    fn parse(allocs: &[(u64, u16, u8, u8)]) -> Mcfg {
        let mem = SimMemory::new();
        let rsdp = sim::install_tables(&mem, 2, &[sim::mcfg(allocs)]);
        AcpiTables::discover(&mem, rsdp).unwrap().mcfg().unwrap()
    }

    #[test]
    fn test_segment0_selected() {
        let mcfg = parse(&[(0xD000_0000, 1, 0, 7), (0xE000_0000, 0, 0, 0x3F)]);
        assert_eq!(mcfg.allocations().len(), 2);
        let seg0 = mcfg.segment0().unwrap();
        assert_eq!(seg0.base, 0xE000_0000);
        assert_eq!(seg0.bus_count(), 64);
    }

    #[test]
    fn test_other_segments_only() {
        let mcfg = parse(&[(0xD000_0000, 2, 0, 7)]);
        assert_eq!(
            mcfg.segment0().unwrap_err(),
            HalError::Config(ConfigError::UnsupportedSegment(2))
        );
    }
}
