//! ACPI static table discovery
//!
//! Walks RSDP -> RSDT/XSDT -> system description tables and keeps a
//! mapped [`Region`] per table. Only static tables are parsed; there is
//! no AML interpreter.

pub mod madt;
pub mod mcfg;

use alloc::vec::Vec;
use core::fmt;

use crate::error::{ConfigError, Result};
use crate::memory::MemoryServices;
use crate::mmio::Region;

pub use madt::{InterruptOverride, IoApicEntry, LocalApic, Madt, OverridePolarity, OverrideTrigger};
pub use mcfg::{Mcfg, McfgAllocation};

/// Length of the standard system description table header.
pub const SDT_HEADER_SIZE: usize = 36;

/// ACPI 1.0 RSDP length (covered by the first checksum).
const RSDP_V1_SIZE: usize = 20;
/// ACPI 2.0+ RSDP length (covered by the extended checksum).
const RSDP_V2_SIZE: usize = 36;

/// Header field offsets.
mod offsets {
    pub const RSDP_REVISION: usize = 15;
    pub const RSDP_RSDT: usize = 16;
    pub const RSDP_XSDT: usize = 24;
    pub const SDT_LENGTH: usize = 4;
}

/// One mapped system description table.
pub struct AcpiTable {
    signature: [u8; 4],
    address: u64,
    region: Region,
}

impl AcpiTable {
    /// 4-byte table signature (`APIC`, `MCFG`, ...).
    pub fn signature(&self) -> &[u8; 4] {
        &self.signature
    }

    /// Physical address of the table.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Total table length including the header.
    pub fn length(&self) -> usize {
        self.region.len()
    }

    /// Mapped table bytes.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Whether the table bytes sum to zero.
    pub fn checksum_valid(&self) -> bool {
        self.region.checksum() == 0
    }

    /// Map a table, reading its header first to learn the length.
    fn map(memory: &dyn MemoryServices, address: u64) -> Result<Self> {
        let header = memory.map(address, SDT_HEADER_SIZE)?;
        let mut signature = [0u8; 4];
        header.read_bytes(0, &mut signature)?;
        let length = header.load::<u32>(offsets::SDT_LENGTH)? as usize;
        if length < SDT_HEADER_SIZE {
            return Err(ConfigError::MalformedTable("table header").into());
        }
        let region = memory.map(address, length)?;
        Ok(AcpiTable {
            signature,
            address,
            region,
        })
    }
}

impl fmt::Debug for AcpiTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcpiTable")
            .field("signature", &SignatureStr(&self.signature))
            .field("address", &format_args!("{:#x}", self.address))
            .field("length", &self.length())
            .finish()
    }
}

/// Displays a table signature as text.
pub struct SignatureStr<'a>(pub &'a [u8; 4]);

impl fmt::Display for SignatureStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SignatureStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

/// All system description tables reachable from the RSDP.
#[derive(Debug)]
pub struct AcpiTables {
    rsdp_address: u64,
    revision: u8,
    tables: Vec<AcpiTable>,
}

impl AcpiTables {
    /// Validate the RSDP at `rsdp_address` and map every table it lists.
    ///
    /// Revision 2 and later use the XSDT (64-bit pointers), earlier
    /// revisions the RSDT (32-bit pointers). A bad RSDP or root table is
    /// fatal; a bad checksum on a leaf table is logged and the table kept.
    pub fn discover(memory: &dyn MemoryServices, rsdp_address: u64) -> Result<Self> {
        let rsdp = memory.map(rsdp_address, RSDP_V1_SIZE)?;
        let mut signature = [0u8; 8];
        rsdp.read_bytes(0, &mut signature)?;
        if &signature != b"RSD PTR " {
            return Err(ConfigError::BadSignature("RSDP").into());
        }
        if rsdp.checksum() != 0 {
            return Err(ConfigError::BadChecksum("RSDP").into());
        }

        let revision = rsdp.load::<u8>(offsets::RSDP_REVISION)?;
        let (root_address, entry_size) = if revision >= 2 {
            let rsdp = memory.map(rsdp_address, RSDP_V2_SIZE)?;
            if rsdp.checksum() != 0 {
                return Err(ConfigError::BadChecksum("RSDP extended").into());
            }
            let xsdt = rsdp.load::<u64>(offsets::RSDP_XSDT)?;
            if xsdt != 0 {
                (xsdt, 8)
            } else {
                (rsdp.load::<u32>(offsets::RSDP_RSDT)? as u64, 4)
            }
        } else {
            (rsdp.load::<u32>(offsets::RSDP_RSDT)? as u64, 4)
        };

        let (root_name, root_sig) = if entry_size == 8 {
            ("XSDT", b"XSDT")
        } else {
            ("RSDT", b"RSDT")
        };
        let root = AcpiTable::map(memory, root_address)?;
        if &root.signature != root_sig {
            return Err(ConfigError::BadSignature(root_name).into());
        }
        if !root.checksum_valid() {
            return Err(ConfigError::BadChecksum(root_name).into());
        }

        log::debug!(
            "[ACPI] RSDP rev {} at {:#x}, {} at {:#x}",
            revision,
            rsdp_address,
            root_name,
            root_address
        );

        let count = (root.length() - SDT_HEADER_SIZE) / entry_size;
        let mut tables = Vec::with_capacity(count);
        for i in 0..count {
            let offset = SDT_HEADER_SIZE + i * entry_size;
            let address = if entry_size == 8 {
                root.region.load::<u64>(offset)?
            } else {
                root.region.load::<u32>(offset)? as u64
            };
            if address == 0 {
                continue;
            }

            let table = match AcpiTable::map(memory, address) {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("[ACPI] skipping table at {:#x}: {}", address, e);
                    continue;
                }
            };
            if !table.checksum_valid() {
                log::warn!(
                    "[ACPI] {} at {:#x} has a bad checksum, keeping it",
                    SignatureStr(&table.signature),
                    address
                );
            }
            log::debug!(
                "[ACPI] {} at {:#x} ({} bytes)",
                SignatureStr(&table.signature),
                address,
                table.length()
            );
            tables.push(table);
        }

        log::info!("[ACPI] Parsed {} ACPI table(s)", tables.len());

        Ok(AcpiTables {
            rsdp_address,
            revision,
            tables,
        })
    }

    /// First table with the given signature.
    pub fn find(&self, signature: &[u8; 4]) -> Option<&AcpiTable> {
        self.tables.iter().find(|t| &t.signature == signature)
    }

    fn require(&self, signature: &[u8; 4]) -> Result<&AcpiTable> {
        self.find(signature)
            .ok_or(ConfigError::MissingTable(*signature).into())
    }

    /// Decode the MADT (`APIC`).
    pub fn madt(&self) -> Result<Madt> {
        Madt::parse(self.require(b"APIC")?)
    }

    /// Decode the MCFG.
    pub fn mcfg(&self) -> Result<Mcfg> {
        Mcfg::parse(self.require(b"MCFG")?)
    }

    /// RSDP revision (0 = ACPI 1.0, 2 = ACPI 2.0+).
    pub fn revision(&self) -> u8 {
        self.revision
    }

    /// Physical address the tables were discovered from.
    pub fn rsdp_address(&self) -> u64 {
        self.rsdp_address
    }

    /// Every mapped table, in root-table order.
    pub fn tables(&self) -> &[AcpiTable] {
        &self.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HalError;
    use crate::tests::sim::{self, SimMemory};

    #[test]
    fn test_discover_via_xsdt() {
        let mem = SimMemory::new();
        let madt = sim::madt(0xFEE0_0000, &[sim::ioapic_entry(0, 0xFEC0_0000, 0)]);
        let mcfg = sim::mcfg(&[(0xE000_0000, 0, 0, 1)]);
        let rsdp = sim::install_tables(&mem, 2, &[madt, mcfg]);

        let acpi = AcpiTables::discover(&mem, rsdp).unwrap();
        assert_eq!(acpi.revision(), 2);
        assert_eq!(acpi.tables().len(), 2);
        assert!(acpi.find(b"APIC").is_some());
        assert!(acpi.find(b"MCFG").is_some());
        assert!(acpi.find(b"HPET").is_none());
    }

    #[test]
    fn test_discover_via_rsdt() {
        let mem = SimMemory::new();
        let mcfg = sim::mcfg(&[(0xE000_0000, 0, 0, 0)]);
        let rsdp = sim::install_tables(&mem, 0, &[mcfg]);

        let acpi = AcpiTables::discover(&mem, rsdp).unwrap();
        assert_eq!(acpi.revision(), 0);
        assert_eq!(acpi.find(b"MCFG").unwrap().length(), SDT_HEADER_SIZE + 8 + 16);
        assert_eq!(
            acpi.madt().unwrap_err(),
            HalError::Config(ConfigError::MissingTable(*b"APIC"))
        );
    }

    #[test]
    fn test_rsdp_signature_and_checksum() {
        let mem = SimMemory::new();
        let rsdp = sim::install_tables(&mem, 2, &[]);
        let region = mem.map(rsdp, 36).unwrap();

        region.store::<u8>(8, region.load::<u8>(8).unwrap().wrapping_add(1)).unwrap();
        assert_eq!(
            AcpiTables::discover(&mem, rsdp).unwrap_err(),
            HalError::Config(ConfigError::BadChecksum("RSDP"))
        );

        region.write_bytes(0, b"RSD PTX ").unwrap();
        assert_eq!(
            AcpiTables::discover(&mem, rsdp).unwrap_err(),
            HalError::Config(ConfigError::BadSignature("RSDP"))
        );
    }

    #[test]
    fn test_leaf_checksum_is_tolerated() {
        let mem = SimMemory::new();
        let mut mcfg = sim::mcfg(&[(0xE000_0000, 0, 0, 0)]);
        mcfg[9] = mcfg[9].wrapping_add(1);
        let rsdp = sim::install_tables(&mem, 2, &[mcfg]);

        let acpi = AcpiTables::discover(&mem, rsdp).unwrap();
        let table = acpi.find(b"MCFG").unwrap();
        assert!(!table.checksum_valid());
        assert!(acpi.mcfg().is_ok());
    }
}
