//! Embedded controller backends and the EC fan driver.

pub mod device_io;
pub mod ec_fan;
pub mod ec_sys;
pub mod memory_ec;

pub use device_io::{EcAccess, EmbeddedController};
pub use ec_fan::EcFanDriver;
pub use ec_sys::EcSysPort;
pub use memory_ec::MemoryEc;
