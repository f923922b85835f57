//! Virtio PCI transport (modern interface).
//!
//! The device describes its register blocks with vendor-specific PCI
//! capabilities (`cfg_type` 1-4), each pointing at `length` bytes at
//! `offset` inside one of its BARs.
//!
//! Initialisation must follow the order below; any other order is
//! rejected with [`ConfigError::InitOrder`]:
//!
//! ```text
//! reset -> acknowledge -> driver -> negotiate_features -> features_ok
//!       -> setup_queue (per queue) -> driver_ok
//! ```

use alloc::sync::Arc;
use core::hint::spin_loop;

use super::queue::Virtqueue;
use super::{DeviceStatus, Features};
use crate::error::{ConfigError, Result};
use crate::interrupts::{InterruptController, Irq};
use crate::memory::MemoryServices;
use crate::mmio::{Field, Region};
use crate::pci::capability::id;
use crate::pci::{BarAddress, Msix, PciDevice};
use crate::platform::Platform;

/// `cfg_type` values of virtio PCI capabilities.
mod cfg_type {
    pub const COMMON: u8 = 1;
    pub const NOTIFY: u8 = 2;
    pub const ISR: u8 = 3;
    pub const DEVICE: u8 = 4;
}

/// Field offsets inside a virtio PCI capability.
mod cap {
    pub const CFG_TYPE: usize = 3;
    pub const BAR: usize = 4;
    pub const OFFSET: usize = 8;
    pub const LENGTH: usize = 12;
    pub const NOTIFY_OFF_MULTIPLIER: usize = 16;
}

/// MSI-X "no vector" value.
pub const NO_VECTOR: u16 = 0xFFFF;

/// Lo/hi halves of a 64-bit common-config register.
#[derive(Clone, Copy)]
struct Split64 {
    lo: Field<u32>,
    hi: Field<u32>,
}

impl Split64 {
    fn new(region: &Region, offset: usize) -> Result<Self> {
        Ok(Split64 {
            lo: region.field(offset)?,
            hi: region.field(offset + 4)?,
        })
    }

    fn write(&self, value: u64) {
        self.lo.write(value as u32);
        self.hi.write((value >> 32) as u32);
    }
}

/// `virtio_pci_common_cfg`
struct CommonCfg {
    device_feature_select: Field<u32>,
    device_feature: Field<u32>,
    driver_feature_select: Field<u32>,
    driver_feature: Field<u32>,
    num_queues: Field<u16>,
    device_status: Field<u8>,
    config_generation: Field<u8>,
    queue_select: Field<u16>,
    queue_size: Field<u16>,
    queue_msix_vector: Field<u16>,
    queue_enable: Field<u16>,
    queue_notify_off: Field<u16>,
    queue_desc: Split64,
    queue_driver: Split64,
    queue_device: Split64,
}

impl CommonCfg {
    fn new(r: &Region) -> Result<Self> {
        Ok(CommonCfg {
            device_feature_select: r.field(0)?,
            device_feature: r.field(4)?,
            driver_feature_select: r.field(8)?,
            driver_feature: r.field(12)?,
            num_queues: r.field(18)?,
            device_status: r.field(20)?,
            config_generation: r.field(21)?,
            queue_select: r.field(22)?,
            queue_size: r.field(24)?,
            queue_msix_vector: r.field(26)?,
            queue_enable: r.field(28)?,
            queue_notify_off: r.field(30)?,
            queue_desc: Split64::new(r, 32)?,
            queue_driver: Split64::new(r, 40)?,
            queue_device: Split64::new(r, 48)?,
        })
    }
}

/// How queue interrupts reach the CPU.
enum InterruptRoute {
    /// One MSI-X table entry per queue.
    Msix(Msix),
    /// The function's INTx line through the IOAPIC, shared by all queues.
    Intx(Irq),
}

/// Where initialisation has got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    Discovered,
    Reset,
    Acknowledged,
    Driver,
    FeaturesNegotiated,
    FeaturesOk,
    DriverOk,
    Failed,
}

/// A virtio device behind the PCI transport.
pub struct VirtioPciTransport {
    device: PciDevice,
    common: CommonCfg,
    notify: Region,
    notify_multiplier: u32,
    isr: Field<u8>,
    device_cfg: Option<Region>,
    route: InterruptRoute,
    memory: Arc<dyn MemoryServices>,
    controller: Arc<dyn InterruptController>,
    stage: InitStage,
    features: u64,
}

/// Map the window a virtio capability points at.
fn map_window(
    device: &PciDevice,
    memory: &dyn MemoryServices,
    bar: u8,
    offset: u32,
    length: u32,
) -> Result<Region> {
    match device.bar_address(bar)? {
        BarAddress::Memory { address, .. } if address != 0 => {
            memory.map(address + offset as u64, length as usize)
        }
        _ => Err(ConfigError::UnusableBar(bar).into()),
    }
}

fn check_features_ok(status: DeviceStatus) -> Result<()> {
    if status.contains(DeviceStatus::FEATURES_OK) {
        Ok(())
    } else {
        Err(ConfigError::FeaturesRejected.into())
    }
}

/// The device answers `NO_VECTOR` when it cannot use the vector.
fn check_vector(index: u16, readback: u16) -> Result<()> {
    if readback == NO_VECTOR {
        Err(ConfigError::MsixVectorRejected(index).into())
    } else {
        Ok(())
    }
}

impl VirtioPciTransport {
    /// Locate the virtio structures of `device` and route its interrupt.
    ///
    /// Uses MSI-X when the `msix` feature is on and the function has the
    /// capability; otherwise the INTx line is routed through the IOAPIC.
    pub fn new(device: PciDevice, platform: &Platform) -> Result<Self> {
        let memory = platform.memory().clone();

        let mut common = None;
        let mut notify = None;
        let mut isr = None;
        let mut device_cfg = None;

        for c in device.capabilities().filter(|c| c.id == id::VENDOR) {
            let base = c.offset as usize;
            let kind = device.read_config::<u8>(base + cap::CFG_TYPE)?;
            let bar = device.read_config::<u8>(base + cap::BAR)?;
            if bar > 5 {
                continue;
            }
            let offset = device.read_config::<u32>(base + cap::OFFSET)?;
            let length = device.read_config::<u32>(base + cap::LENGTH)?;

            // The first capability of each type wins.
            match kind {
                cfg_type::COMMON if common.is_none() => {
                    common = Some(map_window(&device, &*memory, bar, offset, length)?);
                }
                cfg_type::NOTIFY if notify.is_none() => {
                    let multiplier =
                        device.read_config::<u32>(base + cap::NOTIFY_OFF_MULTIPLIER)?;
                    let region = map_window(&device, &*memory, bar, offset, length)?;
                    notify = Some((region, multiplier));
                }
                cfg_type::ISR if isr.is_none() => {
                    isr = Some(map_window(&device, &*memory, bar, offset, length)?);
                }
                cfg_type::DEVICE if device_cfg.is_none() => {
                    device_cfg = Some(map_window(&device, &*memory, bar, offset, length)?);
                }
                _ => {}
            }
        }

        let common = common.ok_or(ConfigError::MissingCapability("common configuration"))?;
        let (notify, notify_multiplier) =
            notify.ok_or(ConfigError::MissingCapability("notification"))?;
        let isr = isr.ok_or(ConfigError::MissingCapability("ISR status"))?;

        // MSI-X table writes need memory decoding.
        device.enable_memory_space();
        let route = Self::route_interrupts(&device, platform)?;
        device.enable_bus_master();

        log::info!(
            "[VirtIO] {} {:04x}:{:04x}, {} interrupts",
            device.address(),
            device.vendor_id(),
            device.device_id(),
            match route {
                InterruptRoute::Msix(_) => "MSI-X",
                InterruptRoute::Intx(_) => "INTx",
            }
        );

        Ok(VirtioPciTransport {
            common: CommonCfg::new(&common)?,
            notify,
            notify_multiplier,
            isr: isr.field(0)?,
            device_cfg,
            route,
            memory,
            controller: platform.interrupts().clone(),
            stage: InitStage::Discovered,
            features: 0,
            device,
        })
    }

    fn route_interrupts(device: &PciDevice, platform: &Platform) -> Result<InterruptRoute> {
        #[cfg(feature = "msix")]
        let msix = Msix::new(device, &**platform.memory())?;
        #[cfg(not(feature = "msix"))]
        let msix: Option<Msix> = None;
        if let Some(msix) = msix {
            return Ok(InterruptRoute::Msix(msix));
        }

        let line = device.interrupt_line();
        let router = platform
            .ioapics()
            .ok_or(ConfigError::NoIoApicForGsi(line as u32))?;
        Ok(InterruptRoute::Intx(router.register_irq(line)?))
    }

    fn expect_stage(&self, expected: InitStage, step: &'static str) -> Result<()> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(ConfigError::InitOrder(step).into())
        }
    }

    fn set_status(&self, bits: DeviceStatus) {
        self.common
            .device_status
            .write(self.common.device_status.read() | bits.bits());
    }

    /// Write 0 to the status register and wait for the device to
    /// acknowledge the reset.
    pub fn reset(&mut self) {
        self.common.device_status.write(0);
        while self.common.device_status.read() != 0 {
            spin_loop();
        }
        self.stage = InitStage::Reset;
    }

    pub fn acknowledge(&mut self) -> Result<()> {
        self.expect_stage(InitStage::Reset, "acknowledge")?;
        self.set_status(DeviceStatus::ACKNOWLEDGE);
        self.stage = InitStage::Acknowledged;
        Ok(())
    }

    pub fn driver(&mut self) -> Result<()> {
        self.expect_stage(InitStage::Acknowledged, "driver")?;
        self.set_status(DeviceStatus::DRIVER);
        self.stage = InitStage::Driver;
        Ok(())
    }

    /// All 64 feature bits the device offers.
    pub fn device_features(&self) -> u64 {
        self.common.device_feature_select.write(0);
        let lo = self.common.device_feature.read() as u64;
        self.common.device_feature_select.write(1);
        let hi = self.common.device_feature.read() as u64;
        hi << 32 | lo
    }

    /// Accept the offered subset of `wanted`. `VIRTIO_F_VERSION_1` is
    /// always required. Returns the accepted bits.
    pub fn negotiate_features(&mut self, wanted: u64) -> Result<u64> {
        self.expect_stage(InitStage::Driver, "feature negotiation")?;
        let offered = self.device_features();
        let required = Features::VERSION_1.bits();
        if offered & required != required {
            return Err(ConfigError::MissingFeature(required & !offered).into());
        }

        let accepted = offered & (wanted | required);
        self.common.driver_feature_select.write(0);
        self.common.driver_feature.write(accepted as u32);
        self.common.driver_feature_select.write(1);
        self.common.driver_feature.write((accepted >> 32) as u32);

        log::debug!(
            "[VirtIO] {}: offered {:#x}, accepted {:#x}",
            self.device.address(),
            offered,
            accepted
        );
        self.features = accepted;
        self.stage = InitStage::FeaturesNegotiated;
        Ok(accepted)
    }

    /// Set FEATURES_OK and check the device kept it.
    pub fn features_ok(&mut self) -> Result<()> {
        self.expect_stage(InitStage::FeaturesNegotiated, "FEATURES_OK")?;
        self.set_status(DeviceStatus::FEATURES_OK);
        check_features_ok(self.status())?;
        self.stage = InitStage::FeaturesOk;
        Ok(())
    }

    /// Allocate queue `index`, hand its rings to the device and route
    /// its interrupt.
    pub fn setup_queue(&mut self, index: u16) -> Result<(Virtqueue, Irq)> {
        self.expect_stage(InitStage::FeaturesOk, "queue setup")?;
        if index >= self.num_queues() {
            return Err(ConfigError::QueueUnavailable(index).into());
        }

        let c = &self.common;
        c.queue_select.write(index);
        let size = c.queue_size.read();
        let notify_off = c.queue_notify_off.read() as usize;
        let notifier = self
            .notify
            .field::<u16>(notify_off * self.notify_multiplier as usize)?;

        let queue = Virtqueue::new(&*self.memory, index, size, notifier)?;
        let irq = match self.queue_irq(index) {
            Ok(irq) => irq,
            Err(e) => {
                self.memory.free_dma(queue.into_buffer());
                return Err(e);
            }
        };

        let c = &self.common;
        c.queue_desc.write(queue.desc_phys());
        c.queue_driver.write(queue.avail_phys());
        c.queue_device.write(queue.used_phys());
        c.queue_enable.write(1);

        log::debug!(
            "[VirtIO] {}: queue {} size {} vector {:#x}",
            self.device.address(),
            index,
            size,
            irq.vector()
        );
        Ok((queue, irq))
    }

    /// Interrupt for the queue currently selected as `index`.
    fn queue_irq(&self, index: u16) -> Result<Irq> {
        match &self.route {
            InterruptRoute::Msix(msix) => {
                let irq = msix.configure_entry(index, &self.controller)?;
                self.common.queue_msix_vector.write(index);
                check_vector(index, self.common.queue_msix_vector.read())?;
                Ok(irq)
            }
            InterruptRoute::Intx(irq) => Ok(irq.clone()),
        }
    }

    /// Set DRIVER_OK; the device is live after this.
    pub fn driver_ok(&mut self) -> Result<()> {
        self.expect_stage(InitStage::FeaturesOk, "DRIVER_OK")?;
        self.set_status(DeviceStatus::DRIVER_OK);
        if let InterruptRoute::Msix(msix) = &self.route {
            msix.enable(&self.device);
        }
        self.stage = InitStage::DriverOk;
        Ok(())
    }

    /// Tell the device the driver gave up on it.
    pub fn fail(&mut self) {
        log::warn!("[VirtIO] {}: initialisation failed", self.device.address());
        self.set_status(DeviceStatus::FAILED);
        self.stage = InitStage::Failed;
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.common.device_status.read())
    }

    pub fn stage(&self) -> InitStage {
        self.stage
    }

    /// Features accepted during negotiation.
    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn num_queues(&self) -> u16 {
        self.common.num_queues.read()
    }

    /// Read (and thereby clear) the ISR status byte.
    pub fn read_isr(&self) -> u8 {
        self.isr.read()
    }

    pub fn uses_msix(&self) -> bool {
        matches!(self.route, InterruptRoute::Msix(_))
    }

    /// Device-specific configuration window, if the device has one.
    pub fn device_config(&self) -> Option<&Region> {
        self.device_cfg.as_ref()
    }

    /// Read a 32-bit device config field, retrying across config
    /// generation changes.
    pub fn read_config_u32(&self, offset: usize) -> Result<u32> {
        let cfg = self
            .device_cfg
            .as_ref()
            .ok_or(ConfigError::MissingCapability("device configuration"))?;
        let field = cfg.field::<u32>(offset)?;
        loop {
            let before = self.common.config_generation.read();
            let value = field.read();
            if self.common.config_generation.read() == before {
                return Ok(value);
            }
        }
    }

    /// Read a 64-bit device config field as two dwords within one
    /// config generation.
    pub fn read_config_u64(&self, offset: usize) -> Result<u64> {
        let cfg = self
            .device_cfg
            .as_ref()
            .ok_or(ConfigError::MissingCapability("device configuration"))?;
        let lo = cfg.field::<u32>(offset)?;
        let hi = cfg.field::<u32>(offset + 4)?;
        loop {
            let before = self.common.config_generation.read();
            let value = (hi.read() as u64) << 32 | lo.read() as u64;
            if self.common.config_generation.read() == before {
                return Ok(value);
            }
        }
    }

    pub fn device(&self) -> &PciDevice {
        &self.device
    }

    pub fn memory(&self) -> &Arc<dyn MemoryServices> {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HalError;
    use crate::pci::Command;
    use crate::tests::sim::{SimPlatform, VirtioBlkConfig};

    #[test]
    fn test_init_sequence_and_order_enforced() {
        let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig::default());
        let platform = sim.bring_up();
        let mut t = VirtioPciTransport::new(sim.virtio_device(&platform), &platform).unwrap();

        assert_eq!(
            t.acknowledge().unwrap_err(),
            HalError::Config(ConfigError::InitOrder("acknowledge"))
        );
        t.reset();
        t.acknowledge().unwrap();
        assert_eq!(
            t.negotiate_features(0).unwrap_err(),
            HalError::Config(ConfigError::InitOrder("feature negotiation"))
        );
        t.driver().unwrap();
        assert_eq!(
            t.setup_queue(0).err(),
            Some(HalError::Config(ConfigError::InitOrder("queue setup")))
        );
        let accepted = t.negotiate_features(1 << 9).unwrap();
        assert_eq!(accepted & Features::VERSION_1.bits(), Features::VERSION_1.bits());
        t.features_ok().unwrap();
        assert_eq!(
            t.status(),
            DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER | DeviceStatus::FEATURES_OK
        );

        let (queue, irq) = t.setup_queue(0).unwrap();
        assert_eq!(sim.queue_desc(), queue.desc_phys());
        assert_eq!(sim.queue_driver(), queue.avail_phys());
        assert_eq!(sim.queue_device(), queue.used_phys());
        assert_eq!(sim.queue_enable(), 1);
        assert_eq!(t.uses_msix(), cfg!(feature = "msix"));
        if t.uses_msix() {
            assert_eq!(sim.msix_data(0) & 0xFF, irq.vector() as u32);
        }

        assert_eq!(
            t.setup_queue(1).err(),
            Some(HalError::Config(ConfigError::QueueUnavailable(1)))
        );
        t.driver_ok().unwrap();
        assert!(t.status().contains(DeviceStatus::DRIVER_OK));
    }

    #[test]
    fn test_version_1_required() {
        let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig {
            legacy_only: true,
            ..VirtioBlkConfig::default()
        });
        let platform = sim.bring_up();
        let mut t = VirtioPciTransport::new(sim.virtio_device(&platform), &platform).unwrap();
        t.reset();
        t.acknowledge().unwrap();
        t.driver().unwrap();
        assert_eq!(
            t.negotiate_features(0).unwrap_err(),
            HalError::Config(ConfigError::MissingFeature(1 << 32))
        );
    }

    #[test]
    fn test_missing_common_capability() {
        let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig {
            omit_common_cap: true,
            ..VirtioBlkConfig::default()
        });
        let platform = sim.bring_up();
        assert_eq!(
            VirtioPciTransport::new(sim.virtio_device(&platform), &platform).err(),
            Some(HalError::Config(ConfigError::MissingCapability(
                "common configuration"
            )))
        );
    }

    #[test]
    fn test_missing_notify_and_isr_capabilities() {
        let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig {
            omit_notify_cap: true,
            ..VirtioBlkConfig::default()
        });
        let platform = sim.bring_up();
        assert_eq!(
            VirtioPciTransport::new(sim.virtio_device(&platform), &platform).err(),
            Some(HalError::Config(ConfigError::MissingCapability("notification")))
        );

        let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig {
            omit_isr_cap: true,
            ..VirtioBlkConfig::default()
        });
        let platform = sim.bring_up();
        assert_eq!(
            VirtioPciTransport::new(sim.virtio_device(&platform), &platform).err(),
            Some(HalError::Config(ConfigError::MissingCapability("ISR status")))
        );
    }

    #[test]
    fn test_memory_decoding_enabled_on_discovery() {
        let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig::default());
        let platform = sim.bring_up();
        let device = sim.virtio_device(&platform);
        device.set_command(Command::empty());
        let t = VirtioPciTransport::new(device, &platform).unwrap();
        assert!(t
            .device()
            .command()
            .contains(Command::MEMORY_SPACE | Command::BUS_MASTER));
    }

    #[test]
    fn test_device_rejections() {
        assert_eq!(check_vector(2, 2), Ok(()));
        assert_eq!(
            check_vector(2, NO_VECTOR),
            Err(HalError::Config(ConfigError::MsixVectorRejected(2)))
        );
        assert_eq!(
            check_features_ok(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER),
            Err(HalError::Config(ConfigError::FeaturesRejected))
        );
        assert_eq!(check_features_ok(DeviceStatus::FEATURES_OK), Ok(()));
    }

    #[cfg(feature = "msix")]
    #[test]
    fn test_queue_memory_returned_when_vector_unavailable() {
        let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig {
            vector_limit: Some(0),
            ..VirtioBlkConfig::default()
        });
        let platform = sim.bring_up();
        let mut t = VirtioPciTransport::new(sim.virtio_device(&platform), &platform).unwrap();
        t.reset();
        t.acknowledge().unwrap();
        t.driver().unwrap();
        t.negotiate_features(0).unwrap();
        t.features_ok().unwrap();
        assert_eq!(
            t.setup_queue(0).err(),
            Some(HalError::VectorsExhausted)
        );
        assert_eq!(sim.mem.freed().len(), 1);
        assert_eq!(sim.queue_enable(), 0);
    }

    #[test]
    fn test_intx_fallback_routes_through_ioapic() {
        let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig {
            msix: false,
            ..VirtioBlkConfig::default()
        });
        let platform = sim.bring_up();
        let mut t = VirtioPciTransport::new(sim.virtio_device(&platform), &platform).unwrap();
        assert!(!t.uses_msix());
        t.reset();
        t.acknowledge().unwrap();
        t.driver().unwrap();
        t.negotiate_features(0).unwrap();
        t.features_ok().unwrap();
        let (_queue, irq) = t.setup_queue(0).unwrap();
        let line = t.device().interrupt_line() as u32;
        let entry = platform
            .ioapics()
            .unwrap()
            .find_by_gsi(line)
            .unwrap()
            .entry(line)
            .unwrap();
        assert_eq!(entry.vector, irq.vector());
    }
}
