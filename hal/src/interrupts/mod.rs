//! Interrupt vectors and routing.
//!
//! The kernel's interrupt dispatcher is external: it owns the IDT and
//! the vector space and wakes threads blocked in [`Irq::wait`]. The
//! HAL programs the routing hardware (IOAPIC redirection entries or
//! MSI-X table entries) so a device's interrupt lands on a vector it
//! obtained from that dispatcher.

pub mod ioapic;

use alloc::sync::Arc;
use core::fmt;

use crate::error::Result;

pub use ioapic::{DeliveryMode, IoApic, IoApicRouter, Polarity, RedirectionEntry, TriggerMode};

/// Where the kernel finds the mask bit for a vector.
///
/// The dispatcher unmasks the source when a thread starts waiting on
/// the vector and may mask it again while the vector is unattended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskSource {
    /// Redirection entry `index` of the IOAPIC at physical `address`.
    IoApic { address: u64, index: u8 },
    /// MSI-X vector-control dword at physical address `control`.
    Msix { control: u64 },
}

/// Vector allocation and delivery, provided by the kernel.
pub trait InterruptController: Send + Sync {
    /// Reserve `count` consecutive vectors and return the first.
    fn allocate_vector(&self, count: u8, mask: MaskSource) -> Result<u8>;

    /// Block the calling thread until `vector` fires.
    fn wait(&self, vector: u8);
}

/// A routed interrupt line.
#[derive(Clone)]
pub struct Irq {
    vector: u8,
    source: MaskSource,
    controller: Arc<dyn InterruptController>,
}

impl Irq {
    /// Wrap a vector obtained from `controller`.
    pub fn new(vector: u8, source: MaskSource, controller: Arc<dyn InterruptController>) -> Self {
        Irq {
            vector,
            source,
            controller,
        }
    }

    /// CPU vector the line is routed to.
    pub fn vector(&self) -> u8 {
        self.vector
    }

    /// Mask bit location registered with the controller.
    pub fn source(&self) -> MaskSource {
        self.source
    }

    /// Block until the interrupt fires.
    ///
    /// Must not be called with a queue lock held.
    pub fn wait(&self) {
        self.controller.wait(self.vector);
    }
}

impl fmt::Debug for Irq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Irq")
            .field("vector", &self.vector)
            .field("source", &self.source)
            .finish()
    }
}
