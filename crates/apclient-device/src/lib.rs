//! Device memory bridges.
//!
//! Provides:
//! - `MemoryDevice` / `MemoryConnector` - In-process memory for tests and demos
//! - `Usb2SnesConnector` / `Usb2SnesDevice` - usb2snes protocol (feature: usb2snes)

pub mod memory;

#[cfg(feature = "usb2snes")]
pub mod usb2snes;

pub use memory::{DeviceOp, MemoryConnector, MemoryDevice};

#[cfg(feature = "usb2snes")]
pub use usb2snes::{DEFAULT_USB2SNES_URL, Usb2SnesConnector, Usb2SnesDevice};
