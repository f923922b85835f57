//! ECAM discovery and driver matching through the platform context.

use crate::pci::{Claim, DriverRegistry, PciAddress, PciDevice, PciDriver};
use crate::platform::Platform;
use crate::tests::sim::{SimPlatform, VirtioBlkConfig, VIRTIO_BLK_ADDRESS};
use crate::virtio::VirtioBlockDriver;
use crate::Result;

/// Claims nothing; counts what it was shown.
struct Observer {
    seen: std::sync::Arc<std::sync::Mutex<Vec<PciAddress>>>,
}

impl PciDriver for Observer {
    fn name(&self) -> &'static str {
        "observer"
    }

    fn matches(&self, device: &PciDevice) -> bool {
        self.seen.lock().unwrap().push(device.address());
        false
    }

    fn attach(&mut self, _device: PciDevice, _platform: &Platform) -> Result<()> {
        unreachable!("never matches")
    }
}

#[test]
fn test_single_virtio_blk_on_two_buses() {
    let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig::default());
    let platform = sim.bring_up();
    assert_eq!(platform.ecam().unwrap().bus_range(), (0, 1));

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let blk = VirtioBlockDriver::new();
    let disks = blk.devices();
    let mut registry = DriverRegistry::new();
    registry.register(Box::new(Observer { seen: seen.clone() }));
    registry.register(Box::new(blk));

    assert_eq!(platform.scan_pci(&mut registry).unwrap(), 1);
    assert_eq!(*seen.lock().unwrap(), [VIRTIO_BLK_ADDRESS]);
    assert_eq!(
        registry.claims(),
        [(VIRTIO_BLK_ADDRESS, Claim::Attached("virtio-blk"))]
    );

    let disks = disks.lock();
    assert_eq!(disks.len(), 1);
    assert_eq!(disks[0].capacity(), 128);
    assert_eq!(disks[0].transport().device().address(), VIRTIO_BLK_ADDRESS);
}

#[test]
fn test_failed_attach_is_reported() {
    let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig {
        legacy_only: true,
        ..VirtioBlkConfig::default()
    });
    let platform = sim.bring_up();
    let mut registry = DriverRegistry::new();
    registry.register(Box::new(VirtioBlockDriver::new()));

    assert_eq!(platform.scan_pci(&mut registry).unwrap(), 0);
    assert_eq!(
        registry.claims(),
        [(VIRTIO_BLK_ADDRESS, Claim::Failed("virtio-blk"))]
    );
    // FAILED written after the partial handshake.
    assert_ne!(sim.device_status() & 0x80, 0);
}

#[test]
fn test_unclaimed_without_drivers() {
    let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig::default());
    let platform = sim.bring_up();
    let mut registry = DriverRegistry::new();
    assert_eq!(platform.scan_pci(&mut registry).unwrap(), 0);
    assert_eq!(registry.claims(), [(VIRTIO_BLK_ADDRESS, Claim::Unclaimed)]);
}
