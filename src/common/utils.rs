//! Utility functions for spacecoord

use rand::RngCore;
use std::net::IpAddr;

/// Length, in characters, of the identity token a daemon presents.
pub const TOKEN_LEN: usize = 32;

/// Normalize a textual IPv4/IPv6 address (e.g. `::0001` → `::1`).
/// Returns `None` for anything that is not an IP literal.
pub fn normalize_address(addr: &str) -> Option<String> {
    addr.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Split `ip:port` on the last colon and normalize both halves.
pub fn parse_host_port(host: &str) -> Option<(String, u16)> {
    let (ip, port) = host.rsplit_once(':')?;
    let ip = normalize_address(ip.trim_start_matches('[').trim_end_matches(']'))?;
    let port = port.parse().ok()?;
    Some((ip, port))
}

/// Generate a random 128-bit identifier, hex encoded.
pub fn random_state_id<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
