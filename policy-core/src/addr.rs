//! Address helpers on top of `ipnetwork`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};

/// Parse `addr/len`; host bits must be zero.
pub fn parse_prefix(raw: &str) -> Result<IpNetwork, String> {
    let net = IpNetwork::from_str(raw.trim()).map_err(|e| format!("invalid prefix '{raw}': {e}"))?;
    if net.ip() != net.network() {
        return Err(format!("prefix '{raw}' has host bits set"));
    }
    Ok(net)
}

pub fn parse_ip(raw: &str) -> Result<IpAddr, String> {
    IpAddr::from_str(raw.trim()).map_err(|e| format!("invalid IP address '{raw}': {e}"))
}

/// Parse `first-last`.
pub fn parse_range(raw: &str) -> Result<(IpAddr, IpAddr), String> {
    let (lo, hi) = raw
        .split_once('-')
        .ok_or_else(|| format!("invalid range '{raw}', expected 'first-last'"))?;
    let (lo, hi) = (parse_ip(lo)?, parse_ip(hi)?);
    if lo.is_ipv4() != hi.is_ipv4() || to_bits(lo) > to_bits(hi) {
        return Err(format!("invalid range '{raw}'"));
    }
    Ok((lo, hi))
}

/// Single address as /32 or /128 prefix.
pub fn host_prefix(ip: IpAddr) -> IpNetwork {
    match ip {
        IpAddr::V4(v4) => IpNetwork::V4(Ipv4Network::from(v4)),
        IpAddr::V6(v6) => IpNetwork::V6(Ipv6Network::from(v6)),
    }
}

/// The whole IPv4 or IPv6 address space.
pub fn any_prefix(v6: bool) -> IpNetwork {
    let zero = if v6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    IpNetwork::new(zero, 0).unwrap_or_else(|_| host_prefix(zero))
}

/// True if `inner` lies completely inside `outer`.
pub fn covers(outer: IpNetwork, inner: IpNetwork) -> bool {
    outer.is_ipv4() == inner.is_ipv4()
        && outer.prefix() <= inner.prefix()
        && outer.contains(inner.network())
}

pub fn to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

pub fn from_bits(bits: u128, v6: bool) -> IpAddr {
    if v6 {
        IpAddr::V6(Ipv6Addr::from(bits))
    } else {
        IpAddr::V4(Ipv4Addr::from(bits as u32))
    }
}

fn width(v6: bool) -> u32 {
    if v6 {
        128
    } else {
        32
    }
}

fn host_mask(prefix: u8, v6: bool) -> u128 {
    let host_bits = width(v6) - u32::from(prefix);
    if host_bits == 0 {
        0
    } else if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    }
}

/// Move `ip` from network `from` into network `to`, keeping its host part.
pub fn map_into(ip: IpAddr, from: IpNetwork, to: IpNetwork) -> IpAddr {
    let v6 = to.is_ipv6();
    let mask = host_mask(from.prefix(), from.is_ipv6()) & host_mask(to.prefix(), v6);
    let bits = to_bits(to.network()) | (to_bits(ip) & mask);
    from_bits(bits, v6)
}

/// Network or broadcast address of an IPv4 prefix shorter than /31.
pub fn is_reserved_v4(ip: IpAddr, net: IpNetwork) -> bool {
    match (ip, net) {
        (IpAddr::V4(_), IpNetwork::V4(v4)) if v4.prefix() < 31 => {
            ip == IpAddr::V4(v4.network()) || ip == IpAddr::V4(v4.broadcast())
        }
        _ => false,
    }
}

/// Smallest list of prefixes exactly covering `lo..=hi`.
pub fn range_to_prefixes(lo: IpAddr, hi: IpAddr) -> Vec<IpNetwork> {
    let v6 = lo.is_ipv6();
    let bits = width(v6);
    let mut out = Vec::new();
    let mut cur = to_bits(lo);
    let last = to_bits(hi);
    loop {
        let mut len = bits;
        while len > 0 {
            let size_bits = bits - len + 1;
            let block = if size_bits >= 128 {
                u128::MAX
            } else {
                (1u128 << size_bits) - 1
            };
            if cur & block != 0 || cur.checked_add(block).map_or(true, |end| end > last) {
                break;
            }
            len -= 1;
        }
        let prefix = len as u8;
        let net = match from_bits(cur, v6) {
            IpAddr::V4(v4) => Ipv4Network::new(v4, prefix).map(IpNetwork::V4),
            IpAddr::V6(v6addr) => Ipv6Network::new(v6addr, prefix).map(IpNetwork::V6),
        };
        if let Ok(net) = net {
            out.push(net);
        }
        let size_bits = bits - len;
        let step = if size_bits >= 128 { u128::MAX } else { 1u128 << size_bits };
        match cur.checked_add(step) {
            Some(next) if next <= last && next > cur => cur = next,
            _ => break,
        }
    }
    out
}
