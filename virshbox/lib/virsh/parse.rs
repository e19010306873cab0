//! Parsers for the tabular text virsh and friends print.

use super::DomainState;
use crate::domain::MacAddress;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A row of `virsh domblklist --details`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// The source type, usually `file`.
    pub kind: String,

    /// The device role, `disk` or `cdrom`.
    pub device: String,

    /// The guest target, e.g. `vda`.
    pub target: String,

    /// The backing file, or `-` for an empty drive.
    pub source: String,
}

/// The fields of `virsh dominfo` the fleet layer uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    /// The domain UUID.
    pub uuid: Option<String>,

    /// The lifecycle state.
    pub state: DomainState,

    /// Whether the domain is persistently defined.
    pub persistent: bool,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses `virsh list --name`, one name per non-empty line.
pub fn parse_domain_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses the rows of `virsh domblklist --details`, skipping the header and separator.
pub fn parse_block_devices(output: &str) -> Vec<BlockDevice> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Type") && !line.starts_with('-'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }

            Some(BlockDevice {
                kind: fields[0].to_string(),
                device: fields[1].to_string(),
                target: fields[2].to_string(),
                source: fields[3..].join(" "),
            })
        })
        .collect()
}

/// The backing file of the first file-backed disk, which is the image a clone overlays.
pub fn parse_primary_disk_path(output: &str) -> Option<String> {
    parse_block_devices(output)
        .into_iter()
        .find(|dev| dev.kind == "file" && dev.device == "disk")
        .map(|dev| dev.source)
}

/// The backing file of a cdrom row that looks like a cloud-init seed.
pub fn parse_seed_iso_path(output: &str) -> Option<String> {
    parse_block_devices(output)
        .into_iter()
        .find(|dev| {
            dev.device == "cdrom"
                && (dev.source.contains("cloud-init") || dev.source.ends_with(".iso"))
        })
        .map(|dev| dev.source)
}

/// Parses `virsh dominfo`.
pub fn parse_dominfo(output: &str) -> DomainInfo {
    let mut info = DomainInfo {
        uuid: None,
        state: DomainState::Unknown,
        persistent: false,
    };

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        let value = value.trim();
        match key.trim() {
            "UUID" if !value.is_empty() => info.uuid = Some(value.to_string()),
            "State" => info.state = DomainState::from_virsh(value),
            "Persistent" => info.persistent = value == "yes",
            _ => {}
        }
    }

    info
}

/// Returns the first IPv4 address and its MAC from `virsh domifaddr`.
pub fn parse_domifaddr_ipv4(output: &str) -> Option<(String, String)> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Name") && !line.starts_with('-'))
        .find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 4 && fields[2] == "ipv4" {
                Some((strip_prefix_len(fields[3]).to_string(), fields[1].to_string()))
            } else {
                None
            }
        })
}

/// Returns the MAC of the first interface listed by `virsh domiflist`.
pub fn parse_domiflist_mac(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Interface") && !line.starts_with('-'))
        .find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            fields
                .get(4)
                .filter(|mac| mac.matches(':').count() == 5)
                .map(|mac| mac.to_string())
        })
}

/// Returns the `Bridge:` value of `virsh net-info`.
pub fn parse_net_bridge(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.starts_with("Bridge:"))
        .find_map(|line| line.split_whitespace().nth(1).map(str::to_string))
}

/// Returns the address leased to `mac` in `virsh net-dhcp-leases`.
pub fn parse_dhcp_lease_ip(output: &str, mac: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.contains(mac))
        .filter_map(|line| {
            line.split_whitespace()
                .nth(4)
                .map(|addr| strip_prefix_len(addr).to_string())
        })
        .last()
}

/// Returns the address bound to `mac` in the output of `arp -an`.
///
/// BSD `arp` drops leading zeros from octets, so both sides are compared in canonical form.
pub fn parse_arp_ip(output: &str, mac: &MacAddress) -> Option<String> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            return None;
        }

        let at = parts.iter().position(|p| *p == "at")?;
        let arp_mac: MacAddress = parts.get(at + 1)?.parse().ok()?;
        if arp_mac != *mac {
            return None;
        }

        parts.iter().find_map(|p| {
            let ip = p.strip_prefix('(')?.strip_suffix(')')?;
            (ip.matches('.').count() == 3).then(|| ip.to_string())
        })
    })
}

/// Returns the `CPU(s):` value of `virsh nodeinfo`.
pub fn parse_nodeinfo_cpus(output: &str) -> Option<u32> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "CPU(s)")
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Returns `(total, free)` in MiB from `virsh nodememstats`, whose values are KiB.
pub fn parse_nodememstats(output: &str) -> (u64, u64) {
    let mut total = 0;
    let mut free = 0;

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }

        let Ok(kib) = fields[fields.len() - 2].parse::<u64>() else {
            continue;
        };

        let name = fields[0].to_lowercase();
        if name.contains("total") {
            total = kib / 1024;
        } else if name.contains("free") {
            free = kib / 1024;
        }
    }

    (total, free)
}

/// Parses the single number printed by the `df -m | tail -1 | awk` pipeline.
pub fn parse_df_available_mb(output: &str) -> Option<u64> {
    output.trim().parse().ok()
}

fn strip_prefix_len(addr: &str) -> &str {
    addr.split_once('/').map(|(ip, _)| ip).unwrap_or(addr)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DOMBLKLIST: &str = "\
 Type   Device   Target   Source
------------------------------------------------------------------
 file   disk     vda      /var/lib/libvirt/images/base/ubuntu.qcow2
 file   cdrom    sda      /var/lib/libvirt/images/jobs/base/cloud-init.iso
";

    #[test]
    fn test_parse_domblklist_finds_disk_and_seed() {
        assert_eq!(
            parse_primary_disk_path(DOMBLKLIST).as_deref(),
            Some("/var/lib/libvirt/images/base/ubuntu.qcow2")
        );
        assert_eq!(
            parse_seed_iso_path(DOMBLKLIST).as_deref(),
            Some("/var/lib/libvirt/images/jobs/base/cloud-init.iso")
        );
        assert_eq!(parse_primary_disk_path(""), None);
    }

    #[test]
    fn test_parse_domifaddr_returns_first_ipv4() {
        let output = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
 vnet0      52:54:00:6b:3c:86    ipv6         fe80::1/64
 vnet0      52:54:00:6b:3c:86    ipv4         192.168.122.63/24
";
        assert_eq!(
            parse_domifaddr_ipv4(output),
            Some(("192.168.122.63".to_string(), "52:54:00:6b:3c:86".to_string()))
        );
        assert_eq!(parse_domifaddr_ipv4(" Name MAC address Protocol Address\n---\n"), None);
    }

    #[test]
    fn test_parse_domiflist_and_dominfo() {
        let iflist = "\
 Interface   Type      Source    Model    MAC
-----------------------------------------------------------
 -           network   default   virtio   52:54:00:6b:3c:86
";
        assert_eq!(
            parse_domiflist_mac(iflist).as_deref(),
            Some("52:54:00:6b:3c:86")
        );

        let info = parse_dominfo(
            "Id:             3\nName:           sbx-1\nUUID:           0d1e-42\nState:          shut off\nPersistent:     yes\n",
        );
        assert_eq!(info.uuid.as_deref(), Some("0d1e-42"));
        assert_eq!(info.state, DomainState::ShutOff);
        assert!(info.persistent);
    }

    #[test]
    fn test_parse_arp_normalizes_short_octets() -> anyhow::Result<()> {
        let output = "\
? (192.168.105.1) at 5e:e9:1e:aa:bb:cc on bridge100 ifscope [ethernet]
? (192.168.105.2) at 52:54:0:ab:cd:ef on bridge100 ifscope [ethernet]
";
        let mac: MacAddress = "52:54:00:ab:cd:ef".parse()?;
        assert_eq!(parse_arp_ip(output, &mac).as_deref(), Some("192.168.105.2"));

        let missing: MacAddress = "52:54:00:00:00:01".parse()?;
        assert_eq!(parse_arp_ip(output, &missing), None);
        Ok(())
    }

    #[test]
    fn test_parse_host_resources() {
        assert_eq!(
            parse_nodeinfo_cpus("CPU model:           x86_64\nCPU(s):              16\n"),
            Some(16)
        );

        let (total, free) = parse_nodememstats(
            "total  :             32768000 KiB\nfree   :              8192000 KiB\nbuffers:               102400 KiB\n",
        );
        assert_eq!(total, 32000);
        assert_eq!(free, 8000);

        assert_eq!(parse_df_available_mb("51200\n"), Some(51200));
    }

    #[test]
    fn test_parse_network_lease_tables() {
        assert_eq!(
            parse_net_bridge("Name:           default\nBridge:         virbr0\n").as_deref(),
            Some("virbr0")
        );

        let leases = "\
 Expiry Time           MAC address         Protocol   IP address          Hostname   Client ID
---------------------------------------------------------------------------------------------------
 2024-01-08 12:00:00   52:54:00:6b:3c:86   ipv4       192.168.122.63/24   sbx-1      -
";
        assert_eq!(
            parse_dhcp_lease_ip(leases, "52:54:00:6b:3c:86").as_deref(),
            Some("192.168.122.63")
        );
    }
}
