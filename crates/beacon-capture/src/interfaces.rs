use pnet_datalink::NetworkInterface;

/// Name prefixes that mark a pod-level virtual link, host primary, or
/// container bridge/overlay device. A node's plaintext HTTP traffic almost
/// always crosses one of these rather than a physical NIC.
const PREFERRED_PREFIXES: &[&str] = &["veth", "eth0", "docker", "br", "cni", "flannel"];

/// Select which interfaces to sniff on: any interface whose name starts with
/// one of the preferred prefixes, or (if none match) every non-loopback
/// interface. Loopback is always skipped.
pub fn select_interfaces(all: Vec<NetworkInterface>) -> Vec<NetworkInterface> {
    let candidates: Vec<NetworkInterface> = all.into_iter().filter(|i| !i.is_loopback()).collect();

    let preferred: Vec<NetworkInterface> = candidates
        .iter()
        .filter(|i| PREFERRED_PREFIXES.iter().any(|p| i.name.starts_with(p)))
        .cloned()
        .collect();

    if preferred.is_empty() {
        candidates
    } else {
        preferred
    }
}

/// Apply an explicit operator override (`--interfaces` / comma list) in
/// place of auto-selection, matching by exact interface name.
pub fn select_named<'a>(
    all: Vec<NetworkInterface>,
    names: impl Iterator<Item = &'a str>,
) -> Vec<NetworkInterface> {
    let wanted: Vec<&str> = names.collect();
    all.into_iter()
        .filter(|i| wanted.contains(&i.name.as_str()))
        .collect()
}
