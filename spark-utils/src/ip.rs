//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv6Addr;

// Extension methods for Ipv6Addr.
pub trait Ipv6AddrExt {
    /// Returns `true` for addresses in the `fe80::/10` range.
    fn is_unicast_linklocal(&self) -> bool;
}

// ===== impl Ipv6Addr =====

impl Ipv6AddrExt for Ipv6Addr {
    fn is_unicast_linklocal(&self) -> bool {
        (self.segments()[0] & 0xffc0) == 0xfe80
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_unicast_linklocal() {
        let addr = "fe80::1".parse::<Ipv6Addr>().unwrap();
        assert!(addr.is_unicast_linklocal());
        let addr = "febf::1".parse::<Ipv6Addr>().unwrap();
        assert!(addr.is_unicast_linklocal());
        let addr = "fec0::1".parse::<Ipv6Addr>().unwrap();
        assert!(!addr.is_unicast_linklocal());
        let addr = "2001:db8::1".parse::<Ipv6Addr>().unwrap();
        assert!(!addr.is_unicast_linklocal());
    }
}
