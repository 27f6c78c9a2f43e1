use std::fmt::Write;

use devclaim::cloud::DeviceIdentity;

use tracing::{info, warn};

use crate::error::{Error, ErrorKind, Result};

#[cfg(target_os = "linux")]
mod os_mac {
    use std::fs;
    use std::path::Path;

    use tracing::warn;

    const IFACE_TYPE_ETHERNET: u16 = 1;
    const IFACE_TYPE_WIFI: u16 = 801;

    // Known MAC OUIs of common virtual machine vendors.
    const VM_MAC_PREFIXES: &[[u8; 3]] = &[
        [0x00, 0x05, 0x69], // VMware
        [0x00, 0x0C, 0x29], // VMware
        [0x00, 0x1C, 0x14], // VMware
        [0x00, 0x50, 0x56], // VMware
        [0x00, 0x03, 0xFF], // Microsoft Hyper-V
        [0x00, 0x15, 0x5D], // Microsoft Hyper-V
        [0x08, 0x00, 0x27], // Oracle VirtualBox
        [0x0A, 0x00, 0x27], // Oracle VirtualBox
        [0x00, 0x1C, 0x42], // Parallels
    ];

    // Interface name prefixes of containers and virtual networks.
    const VIRTUAL_PREFIXES: &[&str] = &["docker", "br-", "veth", "tun", "tap", "vmnet"];

    pub(super) fn is_locally_administered_mac(mac: [u8; 6]) -> bool {
        (mac[0] & 0x02) != 0
    }

    pub(super) fn is_virtual_mac_vendor(mac: [u8; 6]) -> bool {
        VM_MAC_PREFIXES.iter().any(|prefix| prefix == &mac[0..3])
    }

    pub(super) fn parse_mac(mac: &str) -> Option<[u8; 6]> {
        let mut bytes = [0u8; 6];
        let mut parts = mac.trim().split(':');

        for byte in &mut bytes {
            *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
        }

        parts.next().is_none().then_some(bytes)
    }

    fn is_virtual_interface(iface_path: &Path, mac: [u8; 6]) -> bool {
        // An interface without a backing device is virtual.
        if !iface_path.join("device").exists() {
            return true;
        }

        // Software assigned addresses belong to virtual machines, containers
        // and custom network setups.
        if is_locally_administered_mac(mac) || is_virtual_mac_vendor(mac) {
            return true;
        }

        if let Ok(canon) = fs::canonicalize(iface_path)
            && let Some(s) = canon.to_str()
            && (s.contains("/sys/devices/virtual/") || s.contains("VMBUS"))
        {
            return true;
        }

        iface_path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| {
                name == "lo" || VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
            })
    }

    fn interface_type(iface_path: &Path) -> Option<u16> {
        fs::read_to_string(iface_path.join("type"))
            .ok()
            .and_then(|s| s.trim().parse::<u16>().ok())
    }

    // Returns the MAC address of the first physical interface, preferring
    // Ethernet over Wi-Fi. Interfaces are visited in name order so the
    // result is stable across boots.
    pub(super) fn physical_mac() -> Option<[u8; 6]> {
        let net_dir = Path::new("/sys/class/net");

        let Ok(entries) = fs::read_dir(net_dir) else {
            warn!("Unable to read {}.", net_dir.display());
            return None;
        };

        let mut paths: Vec<_> = entries.flatten().map(|entry| entry.path()).collect();
        paths.sort();

        let mut wifi_mac = None;
        for iface_path in paths {
            let Some(mac) = fs::read_to_string(iface_path.join("address"))
                .ok()
                .and_then(|s| parse_mac(&s))
            else {
                continue;
            };

            if is_virtual_interface(&iface_path, mac) {
                continue;
            }

            let is_wireless = iface_path.join("wireless").exists();
            match (is_wireless, interface_type(&iface_path)) {
                (false, Some(IFACE_TYPE_ETHERNET)) => return Some(mac),
                (true, Some(IFACE_TYPE_WIFI)) if wifi_mac.is_none() => wifi_mac = Some(mac),
                _ => {}
            }
        }

        wifi_mac
    }
}

fn physical_mac() -> Option<[u8; 6]> {
    #[cfg(target_os = "linux")]
    {
        os_mac::physical_mac()
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Encodes a MAC address as a lowercase hexadecimal device identifier.
#[must_use]
pub fn device_id_from_mac(mac: [u8; 6]) -> String {
    mac.iter().fold(String::with_capacity(12), |mut id, byte| {
        // Writing into a `String` never fails.
        let _ = write!(id, "{byte:02x}");
        id
    })
}

/// The identity of the device running the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    device_id: String,
}

impl HostIdentity {
    /// Creates a [`HostIdentity`] from a known device identifier.
    #[must_use]
    #[inline]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    /// Determines the [`HostIdentity`].
    ///
    /// A configured identifier always wins. Otherwise the identifier is
    /// derived from the MAC address of a physical network interface.
    ///
    /// # Errors
    ///
    /// An [`ErrorKind::Identity`] error when no identifier is configured and
    /// no physical network interface is found.
    pub fn detect(configured: Option<&str>) -> Result<Self> {
        if let Some(device_id) = configured {
            if device_id.is_empty() {
                return Err(Error::new(
                    ErrorKind::Identity,
                    "The configured device identifier is empty.",
                ));
            }
            return Ok(Self::new(device_id));
        }

        let Some(mac) = physical_mac() else {
            warn!("No physical network interface found");
            return Err(Error::new(
                ErrorKind::Identity,
                "Impossible to derive the device identifier from a MAC address.",
            )
            .info("configure `device_id` explicitly"));
        };

        let identity = Self::new(device_id_from_mac(mac));
        info!("Device identifier: {}", identity.device_id);
        Ok(identity)
    }
}

impl DeviceIdentity for HostIdentity {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}
