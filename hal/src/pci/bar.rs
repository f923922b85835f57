//! Base Address Registers.
//!
//! Bit 0 selects I/O (1) or memory (0). For memory BARs, bits 1-2 give
//! the width (`0b10` = 64-bit, upper half in the next BAR) and bit 3
//! marks prefetchable memory. The size is found by writing all ones,
//! reading the mask back and restoring the original value.

use super::{Command, PciDevice};
use crate::error::{ConfigError, Result};
use crate::memory::MemoryServices;
use crate::mmio::Region;

const BAR_COUNT: u8 = 6;

/// Decoded BAR contents, without the size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarAddress {
    Memory {
        address: u64,
        prefetchable: bool,
        is_64bit: bool,
    },
    Io {
        port: u32,
    },
}

impl BarAddress {
    /// Decode a BAR. `high` is the following BAR, used for 64-bit BARs.
    pub fn decode(low: u32, high: Option<u32>) -> Self {
        if low & 0x1 != 0 {
            return BarAddress::Io { port: low & !0x3 };
        }
        let is_64bit = (low >> 1) & 0x3 == 0b10;
        let mut address = (low & !0xF) as u64;
        if is_64bit {
            address |= (high.unwrap_or(0) as u64) << 32;
        }
        BarAddress::Memory {
            address,
            prefetchable: low & 0x8 != 0,
            is_64bit,
        }
    }

    /// Base address, for either space.
    pub fn base(&self) -> u64 {
        match *self {
            BarAddress::Memory { address, .. } => address,
            BarAddress::Io { port } => port as u64,
        }
    }

    /// Number of BAR slots this BAR occupies.
    pub fn slots(&self) -> u8 {
        match self {
            BarAddress::Memory { is_64bit: true, .. } => 2,
            _ => 1,
        }
    }
}

/// A sized BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar {
    pub address: BarAddress,
    pub size: u64,
}

/// Size from the mask read back after writing all ones.
pub fn size_from_mask(address: &BarAddress, low: u32, high: u32) -> u64 {
    match address {
        BarAddress::Io { .. } => {
            let mask = (low & !0x3) | 0xFFFF_0000;
            (!mask).wrapping_add(1) as u64
        }
        BarAddress::Memory { is_64bit, .. } => {
            let mut mask = (low & !0xF) as u64;
            mask |= if *is_64bit {
                (high as u64) << 32
            } else {
                0xFFFF_FFFF_0000_0000
            };
            (!mask).wrapping_add(1)
        }
    }
}

impl PciDevice {
    fn bar_raw(&self, index: u8) -> Result<(u32, Option<u32>)> {
        if index >= BAR_COUNT {
            return Err(ConfigError::UnusableBar(index).into());
        }
        let low = self.header.bars.read(index as usize)?;
        let high = if index + 1 < BAR_COUNT {
            Some(self.header.bars.read(index as usize + 1)?)
        } else {
            None
        };
        Ok((low, high))
    }

    /// Decode BAR `index` without touching the hardware mask.
    pub fn bar_address(&self, index: u8) -> Result<BarAddress> {
        let (low, high) = self.bar_raw(index)?;
        let address = BarAddress::decode(low, high);
        if let BarAddress::Memory { is_64bit: true, .. } = address {
            if high.is_none() {
                return Err(ConfigError::UnusableBar(index).into());
            }
        }
        Ok(address)
    }

    /// Decode and size BAR `index`.
    ///
    /// Decoding is switched off in the command register while the mask
    /// is probed, and both registers are restored afterwards. Returns
    /// `None` for an unimplemented BAR.
    pub fn probe_bar(&self, index: u8) -> Result<Option<Bar>> {
        let address = self.bar_address(index)?;
        let bars = &self.header.bars;
        let i = index as usize;

        let command = self.command();
        self.set_command(command - (Command::IO_SPACE | Command::MEMORY_SPACE));

        let original_low = bars.read(i)?;
        bars.write(i, 0xFFFF_FFFF)?;
        let mask_low = bars.read(i)?;
        bars.write(i, original_low)?;

        let mut mask_high = 0;
        if address.slots() == 2 {
            let original_high = bars.read(i + 1)?;
            bars.write(i + 1, 0xFFFF_FFFF)?;
            mask_high = bars.read(i + 1)?;
            bars.write(i + 1, original_high)?;
        }

        self.set_command(command);

        if mask_low == 0 && mask_high == 0 {
            return Ok(None);
        }
        Ok(Some(Bar {
            address,
            size: size_from_mask(&address, mask_low, mask_high),
        }))
    }

    /// Size and map a memory BAR.
    pub fn map_bar(&self, index: u8, memory: &dyn MemoryServices) -> Result<Region> {
        let bar = self
            .probe_bar(index)?
            .ok_or(ConfigError::UnusableBar(index))?;
        match bar.address {
            BarAddress::Memory { address, .. } if address != 0 => {
                let len = usize::try_from(bar.size).map_err(|_| ConfigError::UnusableBar(index))?;
                memory.map(address, len)
            }
            _ => Err(ConfigError::UnusableBar(index).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{offsets, EcamWindow, PciAddress};
    use crate::tests::sim::{SimEcam, SimMemory};

    #[test]
    fn test_decode_memory_bars() {
        assert_eq!(
            BarAddress::decode(0xFEB0_0000, None),
            BarAddress::Memory {
                address: 0xFEB0_0000,
                prefetchable: false,
                is_64bit: false
            }
        );
        let bar = BarAddress::decode(0x0000_000C, Some(0x0000_0008));
        assert_eq!(
            bar,
            BarAddress::Memory {
                address: 0x8_0000_0000,
                prefetchable: true,
                is_64bit: true
            }
        );
        assert_eq!(bar.slots(), 2);
    }

    #[test]
    fn test_decode_io_bar() {
        let bar = BarAddress::decode(0xC041, None);
        assert_eq!(bar, BarAddress::Io { port: 0xC040 });
        assert_eq!(bar.base(), 0xC040);
    }

    #[test]
    fn test_size_from_mask() {
        let mem32 = BarAddress::decode(0, None);
        assert_eq!(size_from_mask(&mem32, 0xFFFF_C000, 0), 0x4000);
        let mem64 = BarAddress::decode(0x4, Some(0));
        assert_eq!(size_from_mask(&mem64, 0xFFFF_C004, 0xFFFF_FFFF), 0x4000);
        assert_eq!(size_from_mask(&mem64, 0x0000_0004, 0xFFFF_FFFE), 0x2_0000_0000);
        let io = BarAddress::decode(0x1, None);
        assert_eq!(size_from_mask(&io, 0xFFFF_FFE1, 0), 0x20);
    }

    #[test]
    fn test_probe_restores_registers() {
        let mem = SimMemory::new();
        let ecam = SimEcam::new(&mem, 0, 0);
        let addr = PciAddress::new(0, 2, 0);
        let cfg = ecam.add_function(addr, 0x1AF4, 0x1042, 0);
        cfg.store::<u32>(offsets::BAR0, 0xFEB0_000C).unwrap();
        cfg.store::<u32>(offsets::BAR0 + 4, 0x1).unwrap();
        cfg.store::<u16>(offsets::COMMAND, 0x0006).unwrap();

        let window = EcamWindow::map(&mem, &ecam.allocation()).unwrap();
        let dev = window.probe(addr).unwrap().unwrap();
        // Plain memory keeps whatever is written, so the "mask" is all ones.
        let bar = dev.probe_bar(0).unwrap().unwrap();
        assert_eq!(bar.address.base(), 0x1_FEB0_0000);
        assert_eq!(bar.size, 16);
        assert_eq!(cfg.load::<u32>(offsets::BAR0).unwrap(), 0xFEB0_000C);
        assert_eq!(cfg.load::<u32>(offsets::BAR0 + 4).unwrap(), 0x1);
        assert_eq!(cfg.load::<u16>(offsets::COMMAND).unwrap(), 0x0006);
    }

    #[test]
    fn test_64bit_bar_in_last_slot() {
        let mem = SimMemory::new();
        let ecam = SimEcam::new(&mem, 0, 0);
        let addr = PciAddress::new(0, 2, 0);
        let cfg = ecam.add_function(addr, 0x1AF4, 0x1042, 0);
        cfg.store::<u32>(offsets::BAR0 + 20, 0x4).unwrap();
        let window = EcamWindow::map(&mem, &ecam.allocation()).unwrap();
        let dev = window.probe(addr).unwrap().unwrap();
        assert!(dev.bar_address(5).is_err());
        assert!(dev.bar_address(6).is_err());
    }
}
