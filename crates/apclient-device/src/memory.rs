//! In-memory device.
//!
//! Useful for development without hardware and as a test double: every
//! request is recorded and failures can be injected.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use apclient_core::{Address, DeviceBridge, DeviceConnector, DeviceError};
use async_trait::async_trait;

/// A request observed by a [`MemoryDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    Read { address: Address, length: usize },
    Write { address: Address, data: Vec<u8> },
}

#[derive(Default)]
struct Inner {
    bytes: HashMap<Address, u8>,
    ops: Vec<DeviceOp>,
    available: bool,
    poisoned: HashSet<Address>,
}

/// Sparse byte-addressable memory. Unwritten bytes read as zero.
pub struct MemoryDevice {
    name: String,
    inner: RwLock<Inner>,
}

impl MemoryDevice {
    /// Create an available, zeroed device.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Inner {
                available: true,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Simulate the device being unplugged or plugged back in.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Make every request touching `address` fail.
    pub fn fail_at(&self, address: Address) {
        self.lock().poisoned.insert(address);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.lock().poisoned.clear();
    }

    /// Write bytes without recording an operation.
    pub fn poke(&self, address: Address, data: &[u8]) {
        let mut inner = self.lock();
        for (addr, byte) in (address..).zip(data) {
            inner.bytes.insert(addr, *byte);
        }
    }

    /// Read bytes without recording an operation.
    #[must_use]
    pub fn peek(&self, address: Address, length: usize) -> Vec<u8> {
        let inner = self.lock();
        (address..)
            .take(length)
            .map(|addr| inner.bytes.get(&addr).copied().unwrap_or(0))
            .collect()
    }

    /// Read a little-endian `u16` without recording an operation.
    #[must_use]
    pub fn peek_u16(&self, address: Address) -> u16 {
        let bytes = self.peek(address, 2);
        u16::from_le_bytes([bytes[0], bytes[1]])
    }

    /// Requests recorded so far.
    #[must_use]
    pub fn ops(&self) -> Vec<DeviceOp> {
        self.lock().ops.clone()
    }

    /// Forget recorded requests.
    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    fn check(inner: &Inner, name: &str, address: Address, length: usize) -> Result<(), DeviceError> {
        if !inner.available {
            return Err(DeviceError::Unavailable(format!("{name} is disconnected")));
        }
        let touches_poisoned = (address..)
            .take(length.max(1))
            .any(|addr| inner.poisoned.contains(&addr));
        if touches_poisoned {
            return Err(DeviceError::Unavailable(format!(
                "{name} failed at {address:#08X}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceBridge for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, address: Address, length: usize) -> Result<Vec<u8>, DeviceError> {
        {
            let mut inner = self.lock();
            inner.ops.push(DeviceOp::Read { address, length });
            Self::check(&inner, &self.name, address, length)?;
        }
        Ok(self.peek(address, length))
    }

    async fn write(&self, address: Address, data: &[u8]) -> Result<(), DeviceError> {
        {
            let mut inner = self.lock();
            inner.ops.push(DeviceOp::Write {
                address,
                data: data.to_vec(),
            });
            Self::check(&inner, &self.name, address, data.len())?;
        }
        self.poke(address, data);
        Ok(())
    }
}

/// Connector over a fixed set of in-memory devices.
#[derive(Default, Clone)]
pub struct MemoryConnector {
    devices: Vec<Arc<MemoryDevice>>,
}

impl MemoryConnector {
    /// Create a connector offering the given devices.
    #[must_use]
    pub fn new(devices: impl IntoIterator<Item = Arc<MemoryDevice>>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DeviceConnector for MemoryConnector {
    async fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        Ok(self
            .devices
            .iter()
            .filter(|d| d.lock().available)
            .map(|d| d.name.clone())
            .collect())
    }

    async fn attach(&self, device: &str) -> Result<Arc<dyn DeviceBridge>, DeviceError> {
        let found = self
            .devices
            .iter()
            .find(|d| d.name == device && d.lock().available)
            .ok_or(DeviceError::NoDevice)?;
        Ok(Arc::clone(found) as Arc<dyn DeviceBridge>)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[tokio::test]
    async fn test_read_write_and_log() {
        let device = MemoryDevice::new("mock");
        device.write(0x10, &[1, 2, 3]).await.unwrap();
        assert_eq!(device.read(0x11, 3).await.unwrap(), vec![2, 3, 0]);
        assert_eq!(
            device.ops(),
            vec![
                DeviceOp::Write {
                    address: 0x10,
                    data: vec![1, 2, 3]
                },
                DeviceOp::Read {
                    address: 0x11,
                    length: 3
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_unavailable_and_poisoned() {
        let device = MemoryDevice::new("mock");
        device.fail_at(0x20);
        assert_err!(device.read(0x1F, 2).await);
        assert_ok!(device.read(0x21, 2).await);

        device.set_available(false);
        assert!(matches!(
            device.write(0x00, &[0]).await,
            Err(DeviceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_connector_lists_available_devices() {
        let a = Arc::new(MemoryDevice::new("a"));
        let b = Arc::new(MemoryDevice::new("b"));
        b.set_available(false);
        let connector = MemoryConnector::new([Arc::clone(&a), Arc::clone(&b)]);

        assert_eq!(connector.list_devices().await.unwrap(), vec!["a".to_string()]);
        assert!(connector.attach("b").await.is_err());
        let bridge = connector.attach("a").await.unwrap();
        assert_eq!(bridge.name(), "a");
    }
}
