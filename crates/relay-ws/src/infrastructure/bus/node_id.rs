//! Identity of the local controller node.
//!
//! Notifications read from a local bus are stamped with the id of the node
//! they came from.  Unless configured explicitly, the id is derived from the
//! first non-zero hardware address under `/sys/class/net`, rendered as 16
//! upper-case hex digits.

use std::fs;
use std::path::Path;

use tracing::debug;

/// Id used when no hardware address can be found.
pub const FALLBACK_NODE_ID: &str = "0000000000000000";

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Resolves the node id: `configured` if given, otherwise derived from the
/// host's network interfaces.
pub fn local_node_id(configured: Option<&str>) -> String {
    if let Some(id) = configured {
        return id.to_string();
    }
    match node_id_from_interfaces(Path::new(SYS_CLASS_NET)) {
        Some(id) => id,
        None => {
            debug!("no hardware address found; using {FALLBACK_NODE_ID}");
            FALLBACK_NODE_ID.to_string()
        }
    }
}

/// Scans `<dir>/*/address` in name order for the first non-zero MAC.
pub fn node_id_from_interfaces(dir: &Path) -> Option<String> {
    let mut interfaces: Vec<_> = fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();
    interfaces.sort();

    interfaces.iter().find_map(|iface| {
        let raw = fs::read_to_string(iface.join("address")).ok()?;
        let mac = parse_mac(raw.trim())?;
        (mac != 0).then(|| format_node_id(mac))
    })
}

/// Parses `aa:bb:cc:dd:ee:ff` into an integer.
pub fn parse_mac(text: &str) -> Option<u64> {
    let mut value = 0u64;
    let mut octets = 0;
    for part in text.split(':') {
        if part.len() != 2 {
            return None;
        }
        value = (value << 8) | u64::from(u8::from_str_radix(part, 16).ok()?);
        octets += 1;
    }
    (octets == 6).then_some(value)
}

pub fn format_node_id(mac: u64) -> String {
    format!("{mac:016X}")
}
