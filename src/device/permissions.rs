// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use crate::device::device::Device;

/// Authorization level attached to a request after token resolution. The
/// two authenticated levels carry the device whose token matched; the
/// reference never outlives the registry entry it came from.
#[derive(Debug, Clone, Default)]
pub enum PermissionLevel {
    /// No device, or the token did not match.
    #[default]
    Default,
    /// A subdevice token matched.
    Subdev(Arc<Device>),
    /// The device's own token matched.
    Max(Arc<Device>),
}

impl PermissionLevel {
    pub fn int_level(&self) -> u8 {
        match self {
            PermissionLevel::Default => 0,
            PermissionLevel::Subdev(_) => 50,
            PermissionLevel::Max(_) => 100,
        }
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        match self {
            PermissionLevel::Default => None,
            PermissionLevel::Subdev(d) | PermissionLevel::Max(d) => Some(d),
        }
    }
}
