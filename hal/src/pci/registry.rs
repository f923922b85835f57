//! Driver matching for discovered PCI functions.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::{PciAddress, PciDevice};
use crate::error::Result;
use crate::platform::Platform;

/// A driver that can claim PCI functions.
pub trait PciDriver: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether this driver handles `device`.
    fn matches(&self, device: &PciDevice) -> bool;

    /// Take ownership of a matched device and bring it up.
    fn attach(&mut self, device: PciDevice, platform: &Platform) -> Result<()>;
}

/// Outcome of offering a device to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Claimed and attached by the named driver.
    Attached(&'static str),
    /// Claimed by the named driver, which failed to attach it.
    Failed(&'static str),
    /// No driver matched.
    Unclaimed,
}

/// Ordered list of drivers; the first match claims a device.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<Box<dyn PciDriver>>,
    claims: Vec<(PciAddress, Claim)>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a driver; earlier drivers take precedence.
    pub fn register(&mut self, driver: Box<dyn PciDriver>) {
        log::debug!("[PCI] registered driver {}", driver.name());
        self.drivers.push(driver);
    }

    /// Offer a device to the drivers in registration order.
    pub fn offer(&mut self, device: PciDevice, platform: &Platform) -> Claim {
        let address = device.address();
        let claim = match self.drivers.iter_mut().find(|d| d.matches(&device)) {
            Some(driver) => {
                let name = driver.name();
                match driver.attach(device, platform) {
                    Ok(()) => {
                        log::info!("[PCI] {} claimed by {}", address, name);
                        Claim::Attached(name)
                    }
                    Err(e) => {
                        log::warn!("[PCI] {}: {} failed to attach: {}", address, name, e);
                        Claim::Failed(name)
                    }
                }
            }
            None => Claim::Unclaimed,
        };
        self.claims.push((address, claim));
        claim
    }

    /// Every offer made so far, in order.
    pub fn claims(&self) -> &[(PciAddress, Claim)] {
        &self.claims
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }
}
