//! HAL error types

use core::fmt;

/// Errors raised by the hardware core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// A field or sub-region does not fit inside its parent region.
    OutOfBounds {
        offset: usize,
        size: usize,
        limit: usize,
    },
    /// A register view is not naturally aligned.
    Misaligned { offset: usize, align: usize },
    /// The memory services could not map or allocate.
    OutOfMemory,
    /// The descriptor free list cannot satisfy the request.
    QueueFull,
    /// The kernel has no interrupt vectors left.
    VectorsExhausted,
    /// A descriptor that is already free was handed back.
    DoubleFree(u16),
    /// A descriptor chain links outside the table or never terminates.
    CorruptChain(u16),
    /// Firmware or device configuration cannot be used.
    Config(ConfigError),
}

/// Fatal configuration problems found during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Table or structure signature mismatch.
    BadSignature(&'static str),
    /// Checksum over a firmware structure is not zero.
    BadChecksum(&'static str),
    /// A table is truncated or internally inconsistent.
    MalformedTable(&'static str),
    /// A required ACPI table is not present.
    MissingTable([u8; 4]),
    /// Only PCI segment group 0 is supported.
    UnsupportedSegment(u16),
    /// No IOAPIC covers this global system interrupt.
    NoIoApicForGsi(u32),
    /// A virtio capability structure is missing.
    MissingCapability(&'static str),
    /// The device does not offer a feature the driver requires.
    MissingFeature(u64),
    /// The device cleared FEATURES_OK after negotiation.
    FeaturesRejected,
    /// The device reports size 0 (or an invalid size) for this queue.
    QueueUnavailable(u16),
    /// An initialisation step was attempted out of order.
    InitOrder(&'static str),
    /// The device did not accept an MSI-X vector assignment.
    MsixVectorRejected(u16),
    /// The BAR is absent, an I/O BAR, or too large to map.
    UnusableBar(u8),
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::OutOfBounds { offset, size, limit } => write!(
                f,
                "access of {} bytes at {:#x} exceeds region of {:#x} bytes",
                size, offset, limit
            ),
            HalError::Misaligned { offset, align } => {
                write!(f, "offset {:#x} is not {}-byte aligned", offset, align)
            }
            HalError::OutOfMemory => write!(f, "out of memory"),
            HalError::QueueFull => write!(f, "virtqueue full"),
            HalError::VectorsExhausted => write!(f, "interrupt vectors exhausted"),
            HalError::DoubleFree(idx) => write!(f, "descriptor {} freed twice", idx),
            HalError::CorruptChain(head) => write!(f, "corrupt descriptor chain at {}", head),
            HalError::Config(e) => write!(f, "configuration error: {}", e),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::BadSignature(what) => write!(f, "invalid {} signature", what),
            ConfigError::BadChecksum(what) => write!(f, "invalid {} checksum", what),
            ConfigError::MalformedTable(what) => write!(f, "malformed {}", what),
            ConfigError::MissingTable(sig) => write!(
                f,
                "missing ACPI table {}",
                core::str::from_utf8(sig).unwrap_or("????")
            ),
            ConfigError::UnsupportedSegment(seg) => {
                write!(f, "PCI segment group {} not supported", seg)
            }
            ConfigError::NoIoApicForGsi(gsi) => write!(f, "no IOAPIC handles GSI {}", gsi),
            ConfigError::MissingCapability(what) => {
                write!(f, "missing virtio {} capability", what)
            }
            ConfigError::MissingFeature(bits) => {
                write!(f, "device lacks required features {:#x}", bits)
            }
            ConfigError::FeaturesRejected => write!(f, "device rejected negotiated features"),
            ConfigError::QueueUnavailable(q) => write!(f, "virtqueue {} unavailable", q),
            ConfigError::InitOrder(step) => write!(f, "initialisation step out of order: {}", step),
            ConfigError::MsixVectorRejected(q) => {
                write!(f, "device rejected MSI-X vector for queue {}", q)
            }
            ConfigError::UnusableBar(bar) => write!(f, "BAR{} cannot be used", bar),
        }
    }
}

impl From<ConfigError> for HalError {
    fn from(e: ConfigError) -> Self {
        HalError::Config(e)
    }
}

/// Result type for HAL operations
pub type Result<T> = core::result::Result<T, HalError>;
