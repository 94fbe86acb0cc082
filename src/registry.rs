//! Camera discovery.

use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::{CameraError, Result};
use crate::session::CaptureSession;
use crate::traits::{DeviceDescriptor, Transport};

/// Enumerate attached cameras once. Nothing is cached: call again to see
/// hot-plug changes.
pub fn list_devices(transport: &dyn Transport) -> Result<Vec<DeviceDescriptor>> {
    let devices = transport.enumerate()?;
    tracing::debug!(count = devices.len(), "enumerated cameras");
    Ok(devices)
}

/// Snapshot of the attached cameras, refreshed explicitly with `rescan`.
pub struct DeviceRegistry {
    transport: Arc<dyn Transport>,
    devices: Vec<DeviceDescriptor>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Enumerate once and keep the result.
    pub fn scan(transport: Arc<dyn Transport>) -> Result<Self> {
        let devices = list_devices(transport.as_ref())?;
        Ok(Self { transport, devices })
    }

    /// Replace the snapshot with a fresh enumeration. On failure the old
    /// snapshot is kept.
    pub fn rescan(&mut self) -> Result<&[DeviceDescriptor]> {
        self.devices = list_devices(self.transport.as_ref())?;
        Ok(&self.devices)
    }

    /// Devices from the last scan.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Device by uid.
    pub fn find(&self, uid: &str) -> Result<&DeviceDescriptor> {
        self.devices
            .iter()
            .find(|device| device.uid == uid)
            .ok_or_else(|| CameraError::DeviceNotFound(uid.to_owned()))
    }

    /// First device whose name contains `name`, ignoring ASCII case.
    pub fn find_by_name(&self, name: &str) -> Result<&DeviceDescriptor> {
        let needle = name.to_ascii_lowercase();
        self.devices
            .iter()
            .find(|device| device.name.to_ascii_lowercase().contains(&needle))
            .ok_or_else(|| CameraError::DeviceNotFound(name.to_owned()))
    }

    /// Whether the device can be opened right now. Opens and immediately
    /// closes it without streaming.
    pub fn is_accessible(&self, uid: &str) -> bool {
        let Ok(device) = self.find(uid) else {
            return false;
        };
        match self.transport.open(device) {
            Ok(mut handle) => {
                handle.close();
                true
            }
            Err(err) => {
                tracing::debug!(uid, error = %err, "device not accessible");
                false
            }
        }
    }

    /// Open a session on a device from the last scan.
    pub fn open_session(&self, uid: &str, config: SessionConfig) -> Result<CaptureSession> {
        let device = self.find(uid)?;
        let mut session = CaptureSession::new(Arc::clone(&self.transport), config);
        session.open(device)?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockTransport};
    use crate::session::SessionState;

    fn transport() -> (Arc<MockTransport>, MockDevice) {
        let device = MockDevice::new("mock-1").with_name("Lab Camera");
        let transport = Arc::new(MockTransport::new(vec![
            MockDevice::new("mock-0"),
            device.clone(),
        ]));
        (transport, device)
    }

    #[test]
    fn test_list_devices() {
        let (transport, _) = transport();
        let devices = list_devices(transport.as_ref()).expect("enumerate");
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].name, "Lab Camera");
    }

    #[test]
    fn test_transport_unavailable_is_surfaced() {
        let transport = MockTransport::unavailable();
        assert!(matches!(
            list_devices(&transport),
            Err(CameraError::TransportUnavailable(_))
        ));
        assert!(DeviceRegistry::scan(Arc::new(transport)).is_err());
    }

    #[test]
    fn test_lookup() {
        let (transport, _) = transport();
        let registry = DeviceRegistry::scan(transport).expect("scan");
        assert_eq!(registry.find("mock-1").expect("by uid").name, "Lab Camera");
        assert_eq!(registry.find_by_name("lab").expect("by name").uid, "mock-1");
        assert!(matches!(
            registry.find("mock-9"),
            Err(CameraError::DeviceNotFound(uid)) if uid == "mock-9"
        ));
    }

    #[test]
    fn test_is_accessible_opens_and_closes() {
        let (transport, device) = transport();
        let registry = DeviceRegistry::scan(transport).expect("scan");
        assert!(registry.is_accessible("mock-1"));
        assert!(!registry.is_accessible("mock-9"));
        let counters = device.counters();
        assert_eq!(counters.opens(), 1);
        assert_eq!(counters.closes(), 1);
        assert_eq!(counters.submits(), 0);
    }

    #[test]
    fn test_open_session() {
        let (transport, _) = transport();
        let registry = DeviceRegistry::scan(transport).expect("scan");
        let session = registry
            .open_session("mock-0", SessionConfig::default())
            .expect("open");
        assert_eq!(session.state(), SessionState::Negotiating);
        assert!(matches!(
            registry.open_session("nope", SessionConfig::default()),
            Err(CameraError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_rescan_sees_changes() {
        let transport = Arc::new(MockTransport::new(vec![MockDevice::new("mock-0")]));
        let mut registry =
            DeviceRegistry::scan(Arc::clone(&transport) as Arc<dyn Transport>).expect("scan");
        transport.attach(MockDevice::new("mock-1"));
        assert_eq!(registry.devices().len(), 1);
        assert_eq!(registry.rescan().expect("rescan").len(), 2);
        transport.detach("mock-0");
        assert_eq!(registry.rescan().expect("rescan").len(), 1);
    }
}
