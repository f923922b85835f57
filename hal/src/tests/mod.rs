//! HAL scenario tests
//!
//! End-to-end runs over the simulated platform in [`sim`].


mod pci_scan;
