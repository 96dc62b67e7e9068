//! Deterministic choices every peer makes the same way without talking

use std::net::Ipv4Addr;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(s: &str) -> u32 {
    s.bytes()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME))
}

/// The candidate with the highest 32-bit FNV-1a hash; the earliest wins
/// ties. `None` for an empty list.
pub fn leader<S: AsRef<str>>(candidates: &[S]) -> Option<String> {
    let mut best: Option<(&str, u32)> = None;
    for candidate in candidates {
        let candidate = candidate.as_ref();
        let hash = fnv1a(candidate);
        if best.map_or(true, |(_, top)| hash > top) {
            best = Some((candidate, hash));
        }
    }
    best.map(|(candidate, _)| candidate.to_string())
}

/// One past the highest parseable IPv4 address in `used`, or `default`
/// when there is none
pub fn next_ip<S: AsRef<str>>(default: &str, used: &[S]) -> String {
    used.iter()
        .filter_map(|ip| ip.as_ref().parse::<Ipv4Addr>().ok())
        .map(u32::from)
        .max()
        .and_then(|max| max.checked_add(1))
        .map(|next| Ipv4Addr::from(next).to_string())
        .unwrap_or_else(|| default.to_string())
}
