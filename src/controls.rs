//! Typed access to a device's control registers.

use serde::Deserialize;

use crate::error::{CameraError, Result};
use crate::traits::{ControlDescriptor, ControlKind, ControlRequest, DeviceHandle, MenuEntry};

/// What `set_value` does with a value outside `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangePolicy {
    /// Fail with `ControlOutOfRange`.
    #[default]
    Reject,
    /// Clamp into range and write the clamped value.
    Clamp,
}

/// A device control and its last known value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    /// Control identifier.
    pub id: u32,
    /// Human-readable name.
    pub display_name: String,
    /// Value interpretation.
    pub kind: ControlKind,
    /// Minimum value.
    pub min: i64,
    /// Maximum value.
    pub max: i64,
    /// Step between valid values.
    pub step: i64,
    /// Device default.
    pub default: i64,
    /// Last value read from or committed to the device.
    pub current: i64,
    /// Unit the control belongs to.
    pub unit: String,
    /// Whether writes are accepted.
    pub writable: bool,
    /// Menu entries for menu controls.
    pub menu: Vec<MenuEntry>,
}

impl Control {
    fn from_descriptor(descriptor: &ControlDescriptor) -> Self {
        Self {
            id: descriptor.id,
            display_name: descriptor.display_name.clone(),
            kind: descriptor.kind,
            min: descriptor.min,
            max: descriptor.max,
            step: descriptor.step,
            default: descriptor.default,
            current: descriptor.default,
            unit: descriptor.unit.clone(),
            writable: descriptor.writable,
            menu: descriptor.menu.clone(),
        }
    }

    /// Whether `value` lies in `[min, max]`.
    pub const fn in_range(&self, value: i64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Label of a menu value.
    pub fn menu_label(&self, value: i64) -> Option<&str> {
        self.menu
            .iter()
            .find(|entry| entry.value == value)
            .map(|entry| entry.label.as_str())
    }
}

/// Controls of one open device.
///
/// Cached values change only after the device acknowledged a write, so a
/// failed `set_value` leaves `get_value` reporting the previous value.
#[derive(Debug, Clone, Default)]
pub struct ControlRegistry {
    controls: Vec<Control>,
    policy: RangePolicy,
}

impl ControlRegistry {
    /// Registry with every control at its device default.
    pub fn from_descriptors(descriptors: &[ControlDescriptor], policy: RangePolicy) -> Self {
        Self {
            controls: descriptors.iter().map(Control::from_descriptor).collect(),
            policy,
        }
    }

    /// Read every control's current value. Controls the device refuses to
    /// report keep their default.
    pub fn load_current(&mut self, handle: &mut dyn DeviceHandle) {
        for control in &mut self.controls {
            let request = ControlRequest::Get {
                id: control.id,
                kind: control.kind,
            };
            match handle.control_transfer(&request) {
                Ok(value) => control.current = value,
                Err(err) => tracing::warn!(
                    id = control.id,
                    name = %control.display_name,
                    error = %err,
                    "could not read control, keeping default"
                ),
            }
        }
    }

    /// Range policy in effect.
    pub const fn policy(&self) -> RangePolicy {
        self.policy
    }

    /// All controls.
    pub fn list(&self) -> &[Control] {
        &self.controls
    }

    /// Control by identifier.
    pub fn get(&self, id: u32) -> Result<&Control> {
        self.controls
            .iter()
            .find(|control| control.id == id)
            .ok_or_else(|| CameraError::ControlNotFound(format!("{id:#x}")))
    }

    /// Control by display name, ignoring ASCII case.
    pub fn find_by_name(&self, name: &str) -> Result<&Control> {
        self.controls
            .iter()
            .find(|control| control.display_name.eq_ignore_ascii_case(name))
            .ok_or_else(|| CameraError::ControlNotFound(name.to_owned()))
    }

    /// Cached value of a control.
    pub fn get_value(&self, id: u32) -> Result<i64> {
        self.get(id).map(|control| control.current)
    }

    /// Re-read a control from the device and update the cache.
    pub fn refresh(&mut self, handle: &mut dyn DeviceHandle, id: u32) -> Result<i64> {
        let control = self.get_mut(id)?;
        let request = ControlRequest::Get {
            id,
            kind: control.kind,
        };
        let value = handle
            .control_transfer(&request)
            .map_err(|err| control_error(id, err))?;
        control.current = value;
        Ok(value)
    }

    /// Write a control through one control transfer.
    ///
    /// Returns the value the device committed. Out-of-range values are
    /// rejected or clamped according to the policy before any transfer.
    pub fn set_value(&mut self, handle: &mut dyn DeviceHandle, id: u32, value: i64) -> Result<i64> {
        let policy = self.policy;
        let control = self.get_mut(id)?;

        if !control.writable {
            return Err(CameraError::ControlError {
                id,
                reason: "control is read-only".to_owned(),
            });
        }

        let value = if control.in_range(value) {
            value
        } else {
            match policy {
                RangePolicy::Reject => {
                    return Err(CameraError::ControlOutOfRange {
                        id,
                        value,
                        min: control.min,
                        max: control.max,
                    });
                }
                RangePolicy::Clamp => {
                    let clamped = value.clamp(control.min, control.max);
                    tracing::debug!(id, requested = value, clamped, "clamping control value");
                    clamped
                }
            }
        };

        if control.kind == ControlKind::Menu
            && !control.menu.is_empty()
            && control.menu_label(value).is_none()
        {
            return Err(CameraError::ControlError {
                id,
                reason: format!("{value} is not a menu value"),
            });
        }

        let request = ControlRequest::Set {
            id,
            kind: control.kind,
            value,
        };
        let committed = handle.control_transfer(&request).map_err(|err| {
            tracing::warn!(id, value, error = %err, "control write rejected");
            control_error(id, err)
        })?;
        control.current = committed;
        Ok(committed)
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut Control> {
        self.controls
            .iter_mut()
            .find(|control| control.id == id)
            .ok_or_else(|| CameraError::ControlNotFound(format!("{id:#x}")))
    }
}

fn control_error(id: u32, err: CameraError) -> CameraError {
    match err {
        CameraError::ControlError { .. } => err,
        other => CameraError::ControlError {
            id,
            reason: other.to_string(),
        },
    }
}
