//! Hardware bring-up context.
//!
//! Owns everything discovered during boot (ACPI tables, IOAPICs, the
//! ECAM window) and is passed by reference to drivers instead of living
//! in global registries.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::acpi::{AcpiTables, Madt};
use crate::error::{ConfigError, HalError, Result};
use crate::interrupts::{InterruptController, IoApicRouter};
use crate::memory::MemoryServices;
use crate::pci::{Claim, DriverRegistry, EcamWindow};

/// Bring-up stages that may fail independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    IoApic,
    Pci,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::IoApic => write!(f, "IOAPIC"),
            Subsystem::Pci => write!(f, "PCI"),
        }
    }
}

pub struct Platform {
    memory: Arc<dyn MemoryServices>,
    interrupts: Arc<dyn InterruptController>,
    acpi: AcpiTables,
    madt: Option<Madt>,
    ioapics: Option<IoApicRouter>,
    ecam: Option<EcamWindow>,
    errors: Vec<(Subsystem, HalError)>,
}

impl Platform {
    /// Discover ACPI tables from the RSDP at `rsdp`, then the IOAPICs
    /// (MADT) and the PCI ECAM window (MCFG).
    ///
    /// Only an unusable RSDP or root table is an error here. A failed
    /// IOAPIC or PCI stage is recorded in [`Platform::subsystem_errors`]
    /// and the platform comes up without it; the caller decides whether
    /// that is fatal.
    pub fn bring_up(
        memory: Arc<dyn MemoryServices>,
        interrupts: Arc<dyn InterruptController>,
        rsdp: u64,
    ) -> Result<Self> {
        let acpi = AcpiTables::discover(&*memory, rsdp)?;
        let mut errors = Vec::new();

        let (madt, ioapics) = match acpi.madt().and_then(|madt| {
            let router = IoApicRouter::new(&*memory, &madt, interrupts.clone())?;
            Ok((madt, router))
        }) {
            Ok((madt, router)) => (Some(madt), Some(router)),
            Err(e) => {
                log::warn!("[IOAPIC] unavailable: {}", e);
                errors.push((Subsystem::IoApic, e));
                (None, None)
            }
        };

        let ecam = match acpi
            .mcfg()
            .and_then(|mcfg| mcfg.segment0())
            .and_then(|allocation| EcamWindow::map(&*memory, &allocation))
        {
            Ok(ecam) => Some(ecam),
            Err(e) => {
                log::warn!("[PCI] unavailable: {}", e);
                errors.push((Subsystem::Pci, e));
                None
            }
        };

        log::info!(
            "[HAL] Platform up: {} ACPI table(s), {} IOAPIC(s), PCI {}",
            acpi.tables().len(),
            ioapics.as_ref().map_or(0, |r| r.ioapics().len()),
            if ecam.is_some() { "ready" } else { "missing" }
        );

        Ok(Platform {
            memory,
            interrupts,
            acpi,
            madt,
            ioapics,
            ecam,
            errors,
        })
    }

    /// Offer every function in the ECAM window to `registry`. Returns
    /// the number of functions a driver attached.
    pub fn scan_pci(&self, registry: &mut DriverRegistry) -> Result<usize> {
        let ecam = self.ecam.as_ref().ok_or_else(|| {
            self.subsystem_error(Subsystem::Pci)
                .unwrap_or(ConfigError::MissingTable(*b"MCFG").into())
        })?;

        let mut found = Vec::new();
        ecam.scan(|device| found.push(device))?;

        let attached = found
            .into_iter()
            .map(|device| registry.offer(device, self))
            .filter(|claim| matches!(claim, Claim::Attached(_)))
            .count();
        Ok(attached)
    }

    pub fn memory(&self) -> &Arc<dyn MemoryServices> {
        &self.memory
    }

    pub fn interrupts(&self) -> &Arc<dyn InterruptController> {
        &self.interrupts
    }

    pub fn acpi(&self) -> &AcpiTables {
        &self.acpi
    }

    pub fn madt(&self) -> Option<&Madt> {
        self.madt.as_ref()
    }

    pub fn ioapics(&self) -> Option<&IoApicRouter> {
        self.ioapics.as_ref()
    }

    pub fn ecam(&self) -> Option<&EcamWindow> {
        self.ecam.as_ref()
    }

    /// Stages that failed during bring-up.
    pub fn subsystem_errors(&self) -> &[(Subsystem, HalError)] {
        &self.errors
    }

    fn subsystem_error(&self, subsystem: Subsystem) -> Option<HalError> {
        self.errors
            .iter()
            .find(|(s, _)| *s == subsystem)
            .map(|(_, e)| *e)
    }
}
