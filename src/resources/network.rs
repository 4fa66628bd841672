//! Network reachability and class (Wi-Fi, metered, disconnected).

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    /// Unmetered link; data budget checks are bypassed.
    Wifi,
    /// Cellular or otherwise metered link.
    Metered,
    Disconnected,
}

impl NetworkClass {
    pub fn is_connected(self) -> bool {
        self != NetworkClass::Disconnected
    }
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkClass::Wifi => write!(f, "wifi"),
            NetworkClass::Metered => write!(f, "metered"),
            NetworkClass::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl FromStr for NetworkClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wifi" => Ok(NetworkClass::Wifi),
            "metered" | "cellular" => Ok(NetworkClass::Metered),
            "none" | "disconnected" => Ok(NetworkClass::Disconnected),
            other => Err(format!("unknown network class '{}'", other)),
        }
    }
}

pub trait NetworkMonitor: Send + Sync {
    fn class(&self) -> NetworkClass;

    fn signal_dbm(&self) -> Option<i32> {
        None
    }
}

/// Classifies the host's interfaces under `/sys/class/net`.
#[derive(Debug, Clone)]
pub struct SystemNetworkMonitor {
    net_root: PathBuf,
    wireless_stats: PathBuf,
}

impl Default for SystemNetworkMonitor {
    fn default() -> Self {
        Self {
            net_root: PathBuf::from("/sys/class/net"),
            wireless_stats: PathBuf::from("/proc/net/wireless"),
        }
    }
}

impl SystemNetworkMonitor {
    pub fn with_paths(net_root: impl Into<PathBuf>, wireless_stats: impl Into<PathBuf>) -> Self {
        Self {
            net_root: net_root.into(),
            wireless_stats: wireless_stats.into(),
        }
    }

    fn is_metered_name(name: &str) -> bool {
        ["wwan", "rmnet", "ppp", "ccmni"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }
}

impl NetworkMonitor for SystemNetworkMonitor {
    fn class(&self) -> NetworkClass {
        let Ok(entries) = fs::read_dir(&self.net_root) else {
            return NetworkClass::Disconnected;
        };

        let mut metered = false;
        let mut unmetered = false;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "lo" {
                continue;
            }
            let state = fs::read_to_string(entry.path().join("operstate")).unwrap_or_default();
            if state.trim() != "up" {
                continue;
            }
            if Self::is_metered_name(&name) {
                metered = true;
            } else {
                unmetered = true;
            }
        }

        if unmetered {
            NetworkClass::Wifi
        } else if metered {
            NetworkClass::Metered
        } else {
            NetworkClass::Disconnected
        }
    }

    fn signal_dbm(&self) -> Option<i32> {
        // Inter-| sta-|   Quality        |   Discarded packets
        //  face | tus | link level noise |  nwid  crypt   frag  retry   misc
        //  wlan0: 0000   70.  -40.  -256        0      0      0      0     0
        let content = fs::read_to_string(&self.wireless_stats).ok()?;
        content.lines().skip(2).find_map(|line| {
            let mut parts = line.split_whitespace();
            parts.next()?;
            parts.next()?;
            parts.next()?;
            let level = parts.next()?.trim_end_matches('.');
            level.parse::<f64>().ok().map(|v| v as i32)
        })
    }
}

/// Fixed network class, settable at runtime.
#[derive(Debug)]
pub struct StaticNetworkMonitor {
    class: Mutex<NetworkClass>,
}

impl StaticNetworkMonitor {
    pub fn new(class: NetworkClass) -> Self {
        Self {
            class: Mutex::new(class),
        }
    }

    pub fn set(&self, class: NetworkClass) {
        *self.class.lock().unwrap_or_else(|e| e.into_inner()) = class;
    }
}

impl NetworkMonitor for StaticNetworkMonitor {
    fn class(&self) -> NetworkClass {
        *self.class.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(root: &std::path::Path, name: &str, state: &str) {
        let dir = root.join(name);
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("operstate"), format!("{}\n", state)).unwrap();
    }

    #[test]
    fn test_classifies_interfaces() {
        let root = tempfile::tempdir().unwrap();
        iface(root.path(), "lo", "unknown");
        iface(root.path(), "wwan0", "up");
        let monitor = SystemNetworkMonitor::with_paths(root.path(), "/nonexistent");
        assert_eq!(monitor.class(), NetworkClass::Metered);

        iface(root.path(), "wlan0", "up");
        assert_eq!(monitor.class(), NetworkClass::Wifi);
    }

    #[test]
    fn test_nothing_up_is_disconnected() {
        let root = tempfile::tempdir().unwrap();
        iface(root.path(), "eth0", "down");
        let monitor = SystemNetworkMonitor::with_paths(root.path(), "/nonexistent");
        assert_eq!(monitor.class(), NetworkClass::Disconnected);
    }

    #[test]
    fn test_signal_from_proc_wireless() {
        let dir = tempfile::tempdir().unwrap();
        let stats = dir.path().join("wireless");
        fs::write(
            &stats,
            "Inter-| sta-|   Quality        |   Discarded packets\n face | tus | link level noise |  nwid  crypt\n wlan0: 0000   70.  -41.  -256        0      0\n",
        )
        .unwrap();
        let monitor = SystemNetworkMonitor::with_paths(dir.path(), &stats);
        assert_eq!(monitor.signal_dbm(), Some(-41));
    }

    #[test]
    fn test_parse_network_class() {
        assert_eq!("cellular".parse::<NetworkClass>().unwrap(), NetworkClass::Metered);
        assert_eq!("WIFI".parse::<NetworkClass>().unwrap(), NetworkClass::Wifi);
        assert!("satellite".parse::<NetworkClass>().is_err());
    }
}
