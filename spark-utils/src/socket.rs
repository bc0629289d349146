//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv6Addr;
use std::os::raw::{c_int, c_void};
use std::os::unix::io::AsRawFd;

// Normal build: re-export standard socket types.
#[cfg(not(feature = "testing"))]
pub use {socket2::Socket, tokio::io::unix::AsyncFd};

// Test build: export mock sockets.
#[cfg(feature = "testing")]
pub use crate::socket::mock::{AsyncFd, Socket};

// Useful type definition.
type Result<T> = std::io::Result<T>;

// Extension methods for Socket.
pub trait SocketExt {
    // Executes an operation of the IPV6_JOIN_GROUP type.
    fn join_multicast_ifindex_v6(
        &self,
        multiaddr: &Ipv6Addr,
        ifindex: u32,
    ) -> Result<()>;

    // Executes an operation of the IPV6_LEAVE_GROUP type.
    fn leave_multicast_ifindex_v6(
        &self,
        multiaddr: &Ipv6Addr,
        ifindex: u32,
    ) -> Result<()>;

    // Sets the value of the IPV6_MULTICAST_HOPS option for this socket.
    fn set_multicast_hopcount_v6(&self, hopcount: u8) -> Result<()>;

    // Sets the value of the IPV6_RECVHOPLIMIT option for this socket.
    fn set_ipv6_recv_hoplimit(&self, value: bool) -> Result<()>;

    // Sets the value of the IPV6_RECVPKTINFO option for this socket.
    fn set_ipv6_pktinfo(&self, value: bool) -> Result<()>;

    // Sets the value of the IPV6_TCLASS option for this socket.
    fn set_ipv6_tclass(&self, dscp: u8) -> Result<()>;

    // Sets the value of the SO_TIMESTAMPNS option for this socket.
    fn set_recv_timestampns(&self, value: bool) -> Result<()>;
}

// ===== impl Socket =====

#[cfg(not(feature = "testing"))]
impl SocketExt for Socket {
    fn join_multicast_ifindex_v6(
        &self,
        multiaddr: &Ipv6Addr,
        ifindex: u32,
    ) -> Result<()> {
        let optval = ipv6_mreq(multiaddr, ifindex);

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_ADD_MEMBERSHIP,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        )
    }

    fn leave_multicast_ifindex_v6(
        &self,
        multiaddr: &Ipv6Addr,
        ifindex: u32,
    ) -> Result<()> {
        let optval = ipv6_mreq(multiaddr, ifindex);

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_DROP_MEMBERSHIP,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        )
    }

    fn set_multicast_hopcount_v6(&self, hopcount: u8) -> Result<()> {
        let optval = hopcount as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_HOPS,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_ipv6_recv_hoplimit(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVHOPLIMIT,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_ipv6_pktinfo(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVPKTINFO,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_ipv6_tclass(&self, dscp: u8) -> Result<()> {
        let optval = dscp as c_int;

        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_TCLASS,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_recv_timestampns(&self, value: bool) -> Result<()> {
        let optval = value as c_int;

        setsockopt(
            self,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPNS,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }
}

// ===== Mock sockets for unit testing =====

pub mod mock {
    use super::Result;

    #[derive(Debug, Default)]
    pub struct AsyncFd<T>(T);

    #[derive(Debug, Default)]
    pub struct Socket();

    impl<T> AsyncFd<T> {
        pub fn new(inner: T) -> Result<Self> {
            Ok(Self(inner))
        }

        pub fn get_ref(&self) -> &T {
            &self.0
        }
    }

    impl super::SocketExt for Socket {
        fn join_multicast_ifindex_v6(
            &self,
            _multiaddr: &std::net::Ipv6Addr,
            _ifindex: u32,
        ) -> Result<()> {
            Ok(())
        }

        fn leave_multicast_ifindex_v6(
            &self,
            _multiaddr: &std::net::Ipv6Addr,
            _ifindex: u32,
        ) -> Result<()> {
            Ok(())
        }

        fn set_multicast_hopcount_v6(&self, _hopcount: u8) -> Result<()> {
            Ok(())
        }

        fn set_ipv6_recv_hoplimit(&self, _value: bool) -> Result<()> {
            Ok(())
        }

        fn set_ipv6_pktinfo(&self, _value: bool) -> Result<()> {
            Ok(())
        }

        fn set_ipv6_tclass(&self, _dscp: u8) -> Result<()> {
            Ok(())
        }

        fn set_recv_timestampns(&self, _value: bool) -> Result<()> {
            Ok(())
        }
    }
}

// ===== global functions =====

#[cfg(not(feature = "testing"))]
fn ipv6_mreq(multiaddr: &Ipv6Addr, ifindex: u32) -> libc::ipv6_mreq {
    libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr {
            s6_addr: multiaddr.octets(),
        },
        ipv6mr_interface: ifindex,
    }
}

#[cfg(not(feature = "testing"))]
fn setsockopt<F: AsRawFd>(
    sock: &F,
    opt: c_int,
    val: c_int,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> Result<()> {
    let ret;

    unsafe {
        ret = libc::setsockopt(sock.as_raw_fd(), opt, val, optval, optlen);
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}
