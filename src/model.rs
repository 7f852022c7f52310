use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

/// The 5-tuple identifying a flow. Addresses are stored in the 16-byte
/// IPv6-mapped form so every encoded key has a fixed width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

/// Per-packet metadata extracted by a probe. Read-only after construction;
/// workers share it by reference across all tasks.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    pub timestamp: SystemTime,
    pub five_tuple: FiveTuple,
    pub length: u32,
}

/// The inbox message shape pushed by external producers: addresses arrive as
/// raw bytes (4 for IPv4, 16 for IPv6) exactly as the transport carried them.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub timestamp: SystemTime,
    pub src_addr: Vec<u8>,
    pub dst_addr: Vec<u8>,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub length: u32,
}

impl RawPacket {
    /// Normalizes the raw message into a `PacketInfo` with IPv6-mapped
    /// addresses. Returns `None` when an address is neither 4 nor 16 bytes.
    pub fn normalize(&self) -> Option<PacketInfo> {
        let src_ip = normalize_addr(&self.src_addr)?;
        let dst_ip = normalize_addr(&self.dst_addr)?;

        Some(PacketInfo {
            timestamp: self.timestamp,
            five_tuple: FiveTuple {
                src_ip,
                dst_ip,
                src_port: self.src_port,
                dst_port: self.dst_port,
                protocol: self.protocol,
            },
            length: self.length,
        })
    }
}

/// Maps raw address bytes to the 16-byte representation (IPv4 embedded in
/// IPv6 format).
pub fn normalize_addr(bytes: &[u8]) -> Option<[u8; 16]> {
    match bytes.len() {
        4 => {
            let v4 = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            Some(v4.to_ipv6_mapped().octets())
        }
        16 => {
            let mut out = [0u8; 16];
            out.copy_from_slice(bytes);
            Some(out)
        }
        _ => None,
    }
}

/// Renders a 16-byte address, unwrapping IPv4-mapped addresses to dotted form.
pub fn format_addr(bytes: &[u8; 16]) -> String {
    let v6 = Ipv6Addr::from(*bytes);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4).to_string(),
        None => IpAddr::V6(v6).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(src: &[u8], dst: &[u8]) -> RawPacket {
        RawPacket {
            timestamp: SystemTime::UNIX_EPOCH,
            src_addr: src.to_vec(),
            dst_addr: dst.to_vec(),
            src_port: 12345,
            dst_port: 53,
            protocol: 17,
            length: 100,
        }
    }

    #[test]
    fn test_normalize_ipv4_is_mapped() {
        let info = raw(&[10, 0, 0, 1], &[8, 8, 8, 8])
            .normalize()
            .expect("valid packet");

        let mut expected = [0u8; 16];
        expected[10] = 0xff;
        expected[11] = 0xff;
        expected[12..].copy_from_slice(&[10, 0, 0, 1]);
        assert_eq!(info.five_tuple.src_ip, expected);
        assert_eq!(format_addr(&info.five_tuple.src_ip), "10.0.0.1");
    }

    #[test]
    fn test_normalize_ipv6_passthrough() {
        let addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).octets();
        let info = raw(&addr, &[8, 8, 8, 8]).normalize().expect("valid packet");
        assert_eq!(info.five_tuple.src_ip, addr);
        assert_eq!(format_addr(&info.five_tuple.src_ip), "2001:db8::1");
    }

    #[test]
    fn test_normalize_rejects_bad_length() {
        assert!(raw(&[1, 2, 3], &[8, 8, 8, 8]).normalize().is_none());
        assert!(raw(&[1, 2, 3, 4], &[8; 5]).normalize().is_none());
    }

    #[test]
    fn test_same_address_same_bytes() {
        let a = raw(&[1, 1, 1, 1], &[2, 2, 2, 2]).normalize().unwrap();
        let v4_in_v6 = Ipv4Addr::new(1, 1, 1, 1).to_ipv6_mapped().octets();
        let b = raw(&v4_in_v6, &[2, 2, 2, 2]).normalize().unwrap();
        assert_eq!(a.five_tuple.src_ip, b.five_tuple.src_ip);
    }
}
