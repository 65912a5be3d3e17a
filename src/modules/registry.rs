//! Module Registry
//!
//! Static, read-only mapping from module identity to the driver aliases it
//! supports. Each alias resolves to the driver's plugin identifier and the
//! name of its config-params volume mount.

use crate::crd::{DriverType, ModuleType};

/// Driver parameters a module needs to render against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedDriver {
    /// Plugin identifier substituted for `<DriverPluginIdentifier>`
    pub plugin_identifier: &'static str,
    /// Volume mount substituted for `<DriverConfigParamsVolumeMount>`
    pub config_params_volume_mount: &'static str,
}

pub const POWERSCALE: SupportedDriver = SupportedDriver {
    plugin_identifier: "isilon",
    config_params_volume_mount: "csi-isilon-config-params",
};

pub const POWERFLEX: SupportedDriver = SupportedDriver {
    plugin_identifier: "vxflexos",
    config_params_volume_mount: "vxflexos-config-params",
};

pub const POWERMAX: SupportedDriver = SupportedDriver {
    plugin_identifier: "powermax",
    config_params_volume_mount: "powermax-config-params",
};

pub const POWERSTORE: SupportedDriver = SupportedDriver {
    plugin_identifier: "powerstore",
    config_params_volume_mount: "powerstore-config-params",
};

pub const UNITY: SupportedDriver = SupportedDriver {
    plugin_identifier: "unity",
    config_params_volume_mount: "unity-config-params",
};

type SupportTable = &'static [(&'static str, SupportedDriver)];

const AUTHORIZATION_DRIVERS: SupportTable = &[
    ("powerscale", POWERSCALE),
    ("isilon", POWERSCALE),
    ("powerflex", POWERFLEX),
    ("vxflexos", POWERFLEX),
    ("powermax", POWERMAX),
];

const REPLICATION_DRIVERS: SupportTable = &[
    ("powerscale", POWERSCALE),
    ("isilon", POWERSCALE),
    ("powerflex", POWERFLEX),
    ("vxflexos", POWERFLEX),
    ("powermax", POWERMAX),
    ("powerstore", POWERSTORE),
];

const RESILIENCY_DRIVERS: SupportTable = &[
    ("powerscale", POWERSCALE),
    ("isilon", POWERSCALE),
    ("powerflex", POWERFLEX),
    ("vxflexos", POWERFLEX),
    ("powermax", POWERMAX),
    ("powerstore", POWERSTORE),
    ("unity", UNITY),
];

const OBSERVABILITY_DRIVERS: SupportTable = &[
    ("powerscale", POWERSCALE),
    ("isilon", POWERSCALE),
    ("powerflex", POWERFLEX),
    ("vxflexos", POWERFLEX),
    ("powermax", POWERMAX),
    ("powerstore", POWERSTORE),
];

const REVERSE_PROXY_DRIVERS: SupportTable = &[("powermax", POWERMAX)];

// Application mobility is driver agnostic
const APPLICATION_MOBILITY_DRIVERS: SupportTable = RESILIENCY_DRIVERS;

fn table(module: ModuleType) -> SupportTable {
    match module {
        ModuleType::Authorization => AUTHORIZATION_DRIVERS,
        ModuleType::Replication => REPLICATION_DRIVERS,
        ModuleType::Resiliency => RESILIENCY_DRIVERS,
        ModuleType::Observability => OBSERVABILITY_DRIVERS,
        ModuleType::ReverseProxy => REVERSE_PROXY_DRIVERS,
        ModuleType::ApplicationMobility => APPLICATION_MOBILITY_DRIVERS,
    }
}

/// Look up whether `module` supports `driver`
pub fn supports(module: ModuleType, driver: DriverType) -> Option<SupportedDriver> {
    let alias = driver.as_str();
    table(module)
        .iter()
        .find(|(name, _)| *name == alias)
        .map(|(_, supported)| *supported)
}

/// Driver aliases accepted by `module`
pub fn supported_aliases(module: ModuleType) -> Vec<&'static str> {
    table(module).iter().map(|(name, _)| *name).collect()
}

/// Plugin parameters of a driver, independent of any module
pub fn driver_params(driver: DriverType) -> SupportedDriver {
    match driver.canonical() {
        DriverType::PowerScale | DriverType::Isilon => POWERSCALE,
        DriverType::PowerFlex | DriverType::VxflexOs => POWERFLEX,
        DriverType::PowerMax => POWERMAX,
        DriverType::PowerStore => POWERSTORE,
        DriverType::Unity => UNITY,
    }
}
