//! Per-run identifiers and the small bitwise/formatting algorithms the back-ends
//! and throttling controller depend on. Kept dependency-free and exhaustively
//! unit tested since every caller treats these as ground truth.

use crate::error::DiskNameError;

/// Build the per-run tag embedded in file names and the classifier cgroup path:
/// `YYYYMMDDThhmmss-<pid>`.
pub fn run_tag(now: chrono::DateTime<chrono::Utc>, pid: u32) -> String {
    format!("{}-{}", crate::time::tag_timestamp(now), pid)
}

/// OpenStack disk-naming scheme: 1 -> "vda", 26 -> "vdz", 27 -> "vdaa", ..., 702 -> "vdzz".
///
/// `index` is 1-based (the first block device after the boot volume is `2`, the
/// boot volume itself is never named through this function).
pub fn openstack_disk_name(index: i64) -> Result<String, DiskNameError> {
    if index < 1 || index > 702 {
        return Err(DiskNameError::OutOfRange(index));
    }
    let zero_based = index - 1;
    let one = zero_based / 26;
    let two = zero_based % 26;
    let letter = |i: i64| (b'a' + i as u8) as char;
    if one == 0 {
        Ok(format!("vd{}", letter(two)))
    } else {
        Ok(format!("vd{}{}", letter(one - 1), letter(two)))
    }
}

/// Pack a `major:minor` tc class id string into the `0xMMMMNNNN` form net_cls.classid expects.
pub fn class_id_to_hex(class_id: &str) -> anyhow::Result<String> {
    let (major_s, minor_s) = class_id
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("class id {:?} missing ':'", class_id))?;
    let major = u32::from_str_radix(major_s, 16)?;
    let minor = u32::from_str_radix(minor_s, 16)?;
    Ok(format!("0x{:04x}{:04x}", major, minor))
}

/// Parse an IPv4 dotted-quad into a 32-bit big-endian integer.
fn ipv4_to_u32(addr: &str) -> anyhow::Result<u32> {
    let octets: Vec<u8> = addr
        .split('.')
        .map(|p| p.parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow::anyhow!("invalid IPv4 address: {:?}", addr))?;
    if octets.len() != 4 {
        anyhow::bail!("invalid IPv4 address: {:?}", addr);
    }
    Ok(u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]))
}

/// Bitwise-prefix CIDR containment check: does `addr` fall inside `cidr` (`a.b.c.d/netsize`)?
pub fn ipv4_in_cidr(addr: &str, cidr: &str) -> anyhow::Result<bool> {
    let (net, prefix_s) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("invalid CIDR: {:?}", cidr))?;
    let prefix: u32 = prefix_s.parse()?;
    if prefix > 32 {
        anyhow::bail!("invalid CIDR prefix: {:?}", cidr);
    }
    let addr_bits = ipv4_to_u32(addr)?;
    let net_bits = ipv4_to_u32(net)?;
    let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ok(addr_bits & mask == net_bits & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openstack_disk_name_known_values() {
        assert_eq!(openstack_disk_name(1).unwrap(), "vda");
        assert_eq!(openstack_disk_name(26).unwrap(), "vdz");
        assert_eq!(openstack_disk_name(27).unwrap(), "vdaa");
        assert_eq!(openstack_disk_name(52).unwrap(), "vdaz");
        assert_eq!(openstack_disk_name(53).unwrap(), "vdba");
        assert_eq!(openstack_disk_name(701).unwrap(), "vdzy");
        assert_eq!(openstack_disk_name(702).unwrap(), "vdzz");
    }

    #[test]
    fn test_openstack_disk_name_rejects_out_of_range() {
        assert!(openstack_disk_name(0).is_err());
        assert!(openstack_disk_name(703).is_err());
        assert_eq!(openstack_disk_name(-1), Err(DiskNameError::OutOfRange(-1)));
    }

    #[test]
    fn test_class_id_to_hex() {
        assert_eq!(class_id_to_hex("1a:2b").unwrap(), "0x001a002b");
        assert_eq!(class_id_to_hex("abc:1").unwrap(), "0x0abc0001");
    }

    #[test]
    fn test_class_id_to_hex_rejects_malformed() {
        assert!(class_id_to_hex("no-colon").is_err());
    }

    #[test]
    fn test_ipv4_in_cidr() {
        assert!(ipv4_in_cidr("192.168.0.42", "192.168.0.0/24").unwrap());
        assert!(!ipv4_in_cidr("192.168.0.42", "192.168.1.0/24").unwrap());
    }

    #[test]
    fn test_ipv4_in_cidr_edge_prefixes() {
        assert!(ipv4_in_cidr("10.0.0.1", "0.0.0.0/0").unwrap());
        assert!(ipv4_in_cidr("10.0.0.1", "10.0.0.1/32").unwrap());
        assert!(!ipv4_in_cidr("10.0.0.2", "10.0.0.1/32").unwrap());
    }

    #[test]
    fn test_run_tag_format() {
        let now = chrono::DateTime::parse_from_rfc3339("2024-03-05T12:30:45Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(run_tag(now, 4242), "20240305T123045-4242");
    }
}
