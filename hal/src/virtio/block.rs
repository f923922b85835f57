//! VirtIO block device driver.
//!
//! One request queue. Every request is a descriptor chain of a 16-byte
//! header, an optional data buffer and a 1-byte status the device writes
//! last. Headers and status bytes live in a per-head slot of a DMA area
//! allocated at attach time, so submitting a request never allocates.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::future::Future;
use core::hint::spin_loop;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use hashbrown::HashMap;
use spin::Mutex;

use super::queue::Virtqueue;
use super::transport::VirtioPciTransport;
use super::{DeviceType, VIRTIO_VENDOR_ID};
use crate::config::{BLOCK_SIZE, REQUEST_SLOT_SIZE};
use crate::error::{HalError, Result};
use crate::interrupts::Irq;
use crate::memory::DmaBuffer;
use crate::pci::{PciDevice, PciDriver};
use crate::platform::Platform;

/// Request types
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    In = 0,
    Out = 1,
    Flush = 4,
    GetId = 8,
}

/// Status byte written by the device
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Ok = 0,
    IoErr = 1,
    Unsupported = 2,
    /// Not written yet
    Pending = 0xFF,
}

impl From<u8> for RequestStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => RequestStatus::Ok,
            1 => RequestStatus::IoErr,
            2 => RequestStatus::Unsupported,
            _ => RequestStatus::Pending,
        }
    }
}

impl RequestStatus {
    fn into_result(self) -> core::result::Result<(), BlockError> {
        match self {
            RequestStatus::Ok => Ok(()),
            RequestStatus::Unsupported => Err(BlockError::Unsupported),
            RequestStatus::IoErr | RequestStatus::Pending => Err(BlockError::Io),
        }
    }
}

/// Request header layout
mod header {
    pub const TYPE: usize = 0;
    pub const RESERVED: usize = 4;
    pub const SECTOR: usize = 8;
    pub const SIZE: u32 = 16;
}

/// Status byte offset inside a request slot.
const STATUS_OFFSET: usize = header::SIZE as usize;

bitflags::bitflags! {
    /// Block device feature bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFeatures: u64 {
        const SIZE_MAX = 1 << 1;
        const SEG_MAX = 1 << 2;
        const GEOMETRY = 1 << 4;
        const RO = 1 << 5;
        const BLK_SIZE = 1 << 6;
        const FLUSH = 1 << 9;
        const TOPOLOGY = 1 << 10;
        const CONFIG_WCE = 1 << 11;
    }
}

/// Features the driver asks for.
const WANTED_FEATURES: BlockFeatures = BlockFeatures::RO
    .union(BlockFeatures::BLK_SIZE)
    .union(BlockFeatures::FLUSH);

/// Device config offsets
mod device_config {
    pub const CAPACITY: usize = 0;
    pub const BLK_SIZE: usize = 20;
}

/// Block I/O errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Device reported an I/O error
    Io,
    /// Device or negotiated features do not support the request
    Unsupported,
    /// Request runs past the end of the device
    OutOfRange,
    /// Write to a read-only device
    ReadOnly,
    /// Buffer is empty or not a whole number of sectors
    InvalidBuffer,
    /// Queue or transport failure
    Hal(HalError),
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::Io => write!(f, "I/O error"),
            BlockError::Unsupported => write!(f, "Unsupported request"),
            BlockError::OutOfRange => write!(f, "Request past end of device"),
            BlockError::ReadOnly => write!(f, "Device is read-only"),
            BlockError::InvalidBuffer => write!(f, "Invalid buffer length"),
            BlockError::Hal(e) => write!(f, "{}", e),
        }
    }
}

impl From<HalError> for BlockError {
    fn from(e: HalError) -> Self {
        BlockError::Hal(e)
    }
}

struct Completion<T> {
    result: Mutex<Option<core::result::Result<T, BlockError>>>,
    done: AtomicBool,
    waker: AtomicWaker,
}

impl<T> Completion<T> {
    fn new() -> Arc<Self> {
        Arc::new(Completion {
            result: Mutex::new(None),
            done: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        })
    }

    fn complete(&self, result: core::result::Result<T, BlockError>) {
        *self.result.lock() = Some(result);
        self.done.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// Handle to an in-flight request.
///
/// Resolved by whichever thread processes the used ring. Requests cannot
/// be cancelled: dropping the handle leaves the request running, and its
/// buffer goes back to the memory services once the device completes it.
pub struct BlockRequest<T> {
    head: u16,
    completion: Arc<Completion<T>>,
}

impl<T> BlockRequest<T> {
    /// Head descriptor of the request's chain.
    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn is_complete(&self) -> bool {
        self.completion.done.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<core::result::Result<T, BlockError>> {
        if !self.is_complete() {
            return None;
        }
        // Empty only when polled again after returning Ready.
        Some(self.completion.result.lock().take().unwrap_or(Err(BlockError::Io)))
    }

    /// Spin until the device completes the request.
    pub fn wait(self) -> core::result::Result<T, BlockError> {
        loop {
            if let Some(result) = self.take() {
                return result;
            }
            spin_loop();
        }
    }
}

impl<T> Future for BlockRequest<T> {
    type Output = core::result::Result<T, BlockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.take() {
            return Poll::Ready(result);
        }
        self.completion.waker.register(cx.waker());
        match self.take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

enum InFlight {
    Data {
        completion: Arc<Completion<DmaBuffer>>,
        buffer: DmaBuffer,
    },
    Flush {
        completion: Arc<Completion<()>>,
    },
}

struct QueueState {
    queue: Virtqueue,
    in_flight: HashMap<u16, InFlight>,
}

/// Data segment of a request.
struct Segment {
    phys: u64,
    len: u32,
    device_writes: bool,
}

/// Everything initialisation produces.
struct Setup {
    queue: Virtqueue,
    irq: Irq,
    slots: DmaBuffer,
    capacity: u64,
    block_size: u32,
    features: BlockFeatures,
}

/// A virtio-blk device with one request queue.
pub struct VirtioBlock {
    transport: VirtioPciTransport,
    state: Mutex<QueueState>,
    slots: DmaBuffer,
    irq: Irq,
    capacity: u64,
    block_size: u32,
    features: BlockFeatures,
}

impl VirtioBlock {
    /// Run the virtio initialisation sequence on `device`.
    ///
    /// The device is marked FAILED if any step after discovery fails.
    pub fn new(device: PciDevice, platform: &Platform) -> Result<Self> {
        let mut transport = VirtioPciTransport::new(device, platform)?;
        let setup = match Self::initialise(&mut transport) {
            Ok(setup) => setup,
            Err(e) => {
                transport.fail();
                return Err(e);
            }
        };
        log::info!(
            "[VirtIO-Blk] {}: {} sectors, block size {}{}",
            transport.device().address(),
            setup.capacity,
            setup.block_size,
            if setup.features.contains(BlockFeatures::RO) { ", read-only" } else { "" }
        );
        Ok(VirtioBlock {
            state: Mutex::new(QueueState {
                queue: setup.queue,
                in_flight: HashMap::new(),
            }),
            transport,
            slots: setup.slots,
            irq: setup.irq,
            capacity: setup.capacity,
            block_size: setup.block_size,
            features: setup.features,
        })
    }

    fn initialise(transport: &mut VirtioPciTransport) -> Result<Setup> {
        transport.reset();
        transport.acknowledge()?;
        transport.driver()?;
        let accepted = transport.negotiate_features(WANTED_FEATURES.bits())?;
        let features = BlockFeatures::from_bits_truncate(accepted);
        transport.features_ok()?;

        let capacity = transport.read_config_u64(device_config::CAPACITY)?;
        let block_size = if features.contains(BlockFeatures::BLK_SIZE) {
            transport.read_config_u32(device_config::BLK_SIZE)?
        } else {
            BLOCK_SIZE as u32
        };

        let (queue, irq) = transport.setup_queue(0)?;
        let memory = transport.memory().clone();
        let slots = match memory.allocate_dma(queue.size() as usize * REQUEST_SLOT_SIZE) {
            Ok(slots) => slots,
            Err(e) => {
                memory.free_dma(queue.into_buffer());
                return Err(e);
            }
        };
        if let Err(e) = transport.driver_ok() {
            memory.free_dma(slots);
            memory.free_dma(queue.into_buffer());
            return Err(e);
        }

        Ok(Setup {
            queue,
            irq,
            slots,
            capacity,
            block_size,
            features,
        })
    }

    /// Capacity in 512-byte sectors.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn is_read_only(&self) -> bool {
        self.features.contains(BlockFeatures::RO)
    }

    pub fn features(&self) -> BlockFeatures {
        self.features
    }

    pub fn irq(&self) -> &Irq {
        &self.irq
    }

    pub fn transport(&self) -> &VirtioPciTransport {
        &self.transport
    }

    /// Read `buffer.len()` bytes starting at sector `lba` into `buffer`.
    ///
    /// On completion the buffer is handed back filled. If the request
    /// cannot be submitted or fails, the buffer is returned to the
    /// memory services.
    pub fn read(
        &self,
        lba: u64,
        buffer: DmaBuffer,
    ) -> core::result::Result<BlockRequest<DmaBuffer>, BlockError> {
        self.submit_data(RequestType::In, lba, buffer)
    }

    /// Write `buffer` to the device starting at sector `lba`.
    pub fn write(
        &self,
        lba: u64,
        buffer: DmaBuffer,
    ) -> core::result::Result<BlockRequest<DmaBuffer>, BlockError> {
        if self.is_read_only() {
            self.transport.memory().free_dma(buffer);
            return Err(BlockError::ReadOnly);
        }
        self.submit_data(RequestType::Out, lba, buffer)
    }

    /// Ask the device to commit its write cache.
    pub fn flush(&self) -> core::result::Result<BlockRequest<()>, BlockError> {
        if !self.features.contains(BlockFeatures::FLUSH) {
            return Err(BlockError::Unsupported);
        }
        let completion = Completion::new();
        let head = self.submit(
            RequestType::Flush,
            0,
            None,
            InFlight::Flush {
                completion: completion.clone(),
            },
        )?;
        Ok(BlockRequest { head, completion })
    }

    fn check_range(&self, lba: u64, len: usize) -> core::result::Result<u32, BlockError> {
        if len == 0 || len % BLOCK_SIZE != 0 {
            return Err(BlockError::InvalidBuffer);
        }
        let len32 = u32::try_from(len).map_err(|_| BlockError::InvalidBuffer)?;
        let sectors = (len / BLOCK_SIZE) as u64;
        match lba.checked_add(sectors) {
            Some(end) if end <= self.capacity => Ok(len32),
            _ => Err(BlockError::OutOfRange),
        }
    }

    fn submit_data(
        &self,
        kind: RequestType,
        lba: u64,
        buffer: DmaBuffer,
    ) -> core::result::Result<BlockRequest<DmaBuffer>, BlockError> {
        let len = match self.check_range(lba, buffer.len()) {
            Ok(len) => len,
            Err(e) => {
                self.transport.memory().free_dma(buffer);
                return Err(e);
            }
        };
        let segment = Segment {
            phys: buffer.phys(),
            len,
            device_writes: kind == RequestType::In,
        };
        let completion = Completion::new();
        let head = self.submit(
            kind,
            lba,
            Some(segment),
            InFlight::Data {
                completion: completion.clone(),
                buffer,
            },
        )?;
        Ok(BlockRequest { head, completion })
    }

    /// Build the chain, record it as in flight and notify the device.
    fn submit(
        &self,
        kind: RequestType,
        sector: u64,
        segment: Option<Segment>,
        request: InFlight,
    ) -> core::result::Result<u16, BlockError> {
        let needed = if segment.is_some() { 3 } else { 2 };
        let mut state = self.state.lock();
        let QueueState { queue, in_flight } = &mut *state;

        if queue.num_free() < needed {
            drop(state);
            if let InFlight::Data { buffer, .. } = request {
                self.transport.memory().free_dma(buffer);
            }
            return Err(BlockError::Hal(HalError::QueueFull));
        }

        let head = queue.alloc_descriptor()?;
        let slot = head as usize * REQUEST_SLOT_SIZE;
        let slots = self.slots.region();
        slots.store::<u32>(slot + header::TYPE, kind as u32)?;
        slots.store::<u32>(slot + header::RESERVED, 0)?;
        slots.store::<u64>(slot + header::SECTOR, sector)?;
        slots.store::<u8>(slot + STATUS_OFFSET, RequestStatus::Pending as u8)?;

        let slot_phys = self.slots.phys() + slot as u64;
        queue.set_buffer(head, slot_phys, header::SIZE, false)?;

        let mut tail = head;
        if let Some(segment) = segment {
            tail = queue.chain_next(tail)?;
            queue.set_buffer(tail, segment.phys, segment.len, segment.device_writes)?;
        }
        let status = queue.chain_next(tail)?;
        queue.set_buffer(status, slot_phys + STATUS_OFFSET as u64, 1, true)?;

        in_flight.insert(head, request);
        queue.enqueue(head)?;
        queue.notify();

        log::trace!(
            "[VirtIO-Blk] submitted {:?} sector {} head {}",
            kind,
            sector,
            head
        );
        Ok(head)
    }

    /// Resolve every request the device has completed. Returns how many
    /// were resolved.
    pub fn process_completions(&self) -> usize {
        let mut state = self.state.lock();
        let QueueState { queue, in_flight } = &mut *state;
        let slots = self.slots.region();
        let memory = self.transport.memory();

        queue.drain_used(|head, _len| {
            let status = slots
                .load::<u8>(head as usize * REQUEST_SLOT_SIZE + STATUS_OFFSET)
                .unwrap_or(RequestStatus::Pending as u8);
            let outcome = RequestStatus::from(status).into_result();

            match in_flight.remove(&head) {
                Some(InFlight::Data { completion, buffer }) => {
                    // Nobody is left to receive the buffer.
                    if Arc::strong_count(&completion) == 1 {
                        memory.free_dma(buffer);
                        return;
                    }
                    match outcome {
                        Ok(()) => completion.complete(Ok(buffer)),
                        Err(e) => {
                            log::warn!("[VirtIO-Blk] request at head {} failed: {}", head, e);
                            memory.free_dma(buffer);
                            completion.complete(Err(e));
                        }
                    }
                }
                Some(InFlight::Flush { completion }) => completion.complete(outcome),
                None => log::error!("[VirtIO-Blk] completion for idle head {}", head),
            }
        })
    }

    /// Interrupt service loop for the queue's handler thread.
    pub fn serve_interrupts(&self) -> ! {
        loop {
            self.irq.wait();
            if !self.transport.uses_msix() {
                self.transport.read_isr();
            }
            self.process_completions();
        }
    }

    /// Requests submitted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

/// Devices attached by a [`VirtioBlockDriver`].
pub type BlockDevices = Arc<Mutex<Vec<Arc<VirtioBlock>>>>;

/// PCI driver for virtio block functions.
#[derive(Default)]
pub struct VirtioBlockDriver {
    devices: BlockDevices,
}

impl VirtioBlockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared list of attached devices.
    pub fn devices(&self) -> BlockDevices {
        self.devices.clone()
    }
}

impl PciDriver for VirtioBlockDriver {
    fn name(&self) -> &'static str {
        "virtio-blk"
    }

    fn matches(&self, device: &PciDevice) -> bool {
        device.vendor_id() == VIRTIO_VENDOR_ID
            && DeviceType::from_pci_id(device.device_id()) == DeviceType::Block
    }

    fn attach(&mut self, device: PciDevice, platform: &Platform) -> Result<()> {
        let block = VirtioBlock::new(device, platform)?;
        self.devices.lock().push(Arc::new(block));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::sim::{SimPlatform, VirtioBlkConfig};
    use crate::virtio::DeviceStatus;

    fn attach(config: VirtioBlkConfig) -> (SimPlatform, Platform, VirtioBlock) {
        let sim = SimPlatform::with_virtio_blk(config);
        let platform = sim.bring_up();
        let block = VirtioBlock::new(sim.virtio_device(&platform), &platform).unwrap();
        (sim, platform, block)
    }

    #[test]
    fn test_request_status_mapping() {
        assert_eq!(RequestStatus::from(0).into_result(), Ok(()));
        assert_eq!(RequestStatus::from(1).into_result(), Err(BlockError::Io));
        assert_eq!(
            RequestStatus::from(2).into_result(),
            Err(BlockError::Unsupported)
        );
        assert_eq!(RequestStatus::from(7).into_result(), Err(BlockError::Io));
    }

    #[test]
    fn test_failed_attach_returns_queue_memory() {
        let sim = SimPlatform::with_virtio_blk(VirtioBlkConfig::default());
        let platform = sim.bring_up();
        // Room for the rings but not the request slots.
        sim.mem.limit_dma(1);
        assert_eq!(
            VirtioBlock::new(sim.virtio_device(&platform), &platform).err(),
            Some(HalError::OutOfMemory)
        );
        assert_eq!(sim.mem.freed(), vec![sim.queue_desc()]);
        let status = DeviceStatus::from_bits_retain(sim.device_status());
        assert!(status.contains(DeviceStatus::FAILED));
    }

    #[test]
    fn test_attach_reads_capacity() {
        let (sim, _platform, block) = attach(VirtioBlkConfig::default());
        assert_eq!(block.capacity(), sim.config().capacity);
        assert_eq!(block.block_size(), 512);
        assert!(!block.is_read_only());
        assert!(block.features().contains(BlockFeatures::FLUSH));
    }

    #[test]
    fn test_invalid_buffers_rejected() {
        let (sim, platform, block) = attach(VirtioBlkConfig::default());
        let memory = platform.memory();

        let odd = memory.allocate_dma(100).unwrap();
        assert_eq!(block.read(0, odd).err(), Some(BlockError::InvalidBuffer));

        let buf = memory.allocate_dma(1024).unwrap();
        let last = sim.config().capacity - 1;
        assert_eq!(block.read(last, buf).err(), Some(BlockError::OutOfRange));

        let buf = memory.allocate_dma(512).unwrap();
        assert_eq!(block.read(u64::MAX, buf).err(), Some(BlockError::OutOfRange));
        assert_eq!(block.in_flight(), 0);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let (_sim, platform, block) = attach(VirtioBlkConfig {
            read_only: true,
            ..VirtioBlkConfig::default()
        });
        assert!(block.is_read_only());
        let buf = platform.memory().allocate_dma(512).unwrap();
        assert_eq!(block.write(0, buf).err(), Some(BlockError::ReadOnly));
    }

    #[test]
    fn test_flush_needs_feature() {
        let (_sim, _platform, block) = attach(VirtioBlkConfig {
            flush: false,
            ..VirtioBlkConfig::default()
        });
        assert_eq!(block.flush().err(), Some(BlockError::Unsupported));
    }

    #[test]
    fn test_queue_full_is_reported() {
        let (_sim, platform, block) = attach(VirtioBlkConfig::default());
        let memory = platform.memory();
        // Queue size 8: two 3-descriptor requests leave 2 descriptors.
        let _a = block.read(0, memory.allocate_dma(512).unwrap()).unwrap();
        let _b = block.read(1, memory.allocate_dma(512).unwrap()).unwrap();
        assert_eq!(
            block.read(2, memory.allocate_dma(512).unwrap()).err(),
            Some(BlockError::Hal(HalError::QueueFull))
        );
        // A flush only needs two.
        let _f = block.flush().unwrap();
        assert_eq!(block.in_flight(), 3);
    }
}
