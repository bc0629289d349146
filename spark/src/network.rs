//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

#[cfg(not(feature = "testing"))]
use std::io::{IoSlice, IoSliceMut};
use std::net::Ipv6Addr;
#[cfg(not(feature = "testing"))]
use std::ops::Deref;
#[cfg(not(feature = "testing"))]
use std::net::SocketAddrV6;
#[cfg(not(feature = "testing"))]
use std::os::fd::AsRawFd;
#[cfg(not(feature = "testing"))]
use std::sync::Arc;

#[cfg(not(feature = "testing"))]
use nix::sys::socket::{
    self, ControlMessage, ControlMessageOwned, MsgFlags, SockaddrIn6,
};
use spark_utils::Sender;
use spark_utils::socket::{AsyncFd, Socket, SocketExt};
#[cfg(not(feature = "testing"))]
use tokio::sync::mpsc::error::SendError;

use crate::consts::{MIN_IPV6_MTU, SPARK_HOP_LIMIT, SPARK_MCAST_ADDR};
use crate::error::{Error, IoError};
#[cfg(not(feature = "testing"))]
use crate::packet::Packet;
use crate::tasks::messages::input::NetRxPacketMsg;
use crate::tasks::messages::output::NetTxPacketMsg;

// Opens and configures the shared neighbor discovery socket.
//
// One IPv6-only non-blocking UDP socket is used for all interfaces; the
// multicast hop count is pinned to 255 so receivers can reject off-link
// packets, looped delivery of our own multicasts is disabled, and kernel
// receive timestamps are requested for RTT measurement.
pub(crate) fn socket(
    udp_port: u16,
    ip_tos: Option<u8>,
) -> Result<Socket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        use socket2::{Domain, Type};

        let socket = Socket::new(Domain::IPV6, Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        socket.set_only_v6(true)?;
        socket.set_reuse_address(true)?;
        socket.set_ipv6_pktinfo(true)?;
        socket.set_ipv6_recv_hoplimit(true)?;
        socket.set_multicast_hopcount_v6(SPARK_HOP_LIMIT)?;
        socket.set_multicast_loop_v6(false)?;
        if let Some(tos) = ip_tos {
            socket.set_ipv6_tclass(tos)?;
        }
        socket.bind(
            &std::net::SocketAddr::from((Ipv6Addr::UNSPECIFIED, udp_port))
                .into(),
        )?;
        if let Err(error) = socket.set_recv_timestampns(true) {
            // Measured RTTs will carry more noise without kernel
            // timestamps.
            tracing::warn!(%error, "failed to enable receive timestamping");
        }

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(Socket::default())
    }
}

// Joins the Spark multicast group on the given interface.
pub(crate) fn join_multicast(
    socket: &Socket,
    ifindex: u32,
) -> Result<(), IoError> {
    socket
        .join_multicast_ifindex_v6(&SPARK_MCAST_ADDR, ifindex)
        .map_err(IoError::MulticastJoinError)
}

// Leaves the Spark multicast group on the given interface.
pub(crate) fn leave_multicast(
    socket: &Socket,
    ifindex: u32,
) -> Result<(), IoError> {
    socket
        .leave_multicast_ifindex_v6(&SPARK_MCAST_ADDR, ifindex)
        .map_err(IoError::MulticastLeaveError)
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn read_loop(
    socket: Arc<AsyncFd<Socket>>,
    net_packet_rxp: Sender<NetRxPacketMsg>,
) -> Result<(), SendError<NetRxPacketMsg>> {
    // One extra byte so a datagram larger than the MTU bound shows up as
    // oversized instead of silently truncating.
    let mut buf = [0; MIN_IPV6_MTU + 1];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsgspace = nix::cmsg_space!(
        libc::in6_pktinfo,
        libc::c_int,
        nix::sys::time::TimeSpec
    );

    loop {
        // Receive data packet together with its ancillary data.
        match socket
            .async_io(tokio::io::Interest::READABLE, |socket| {
                match socket::recvmsg::<SockaddrIn6>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        let src = msg.address.map(|addr| addr.ip());
                        let bytes = msg.bytes;
                        let mut ifindex = None;
                        let mut hop_limit = 0;
                        let mut recv_ts_us = None;
                        let cmsgs =
                            msg.cmsgs().map_err(std::io::Error::from)?;
                        for cmsg in cmsgs {
                            match cmsg {
                                ControlMessageOwned::Ipv6PacketInfo(info) => {
                                    ifindex = Some(info.ipi6_ifindex as u32);
                                }
                                ControlMessageOwned::Ipv6HopLimit(limit) => {
                                    hop_limit = limit as u8;
                                }
                                ControlMessageOwned::ScmTimestampns(ts) => {
                                    recv_ts_us = Some(
                                        ts.tv_sec() * 1_000_000
                                            + ts.tv_nsec() / 1_000,
                                    );
                                }
                                _ => {}
                            }
                        }
                        Ok((src, bytes, ifindex, hop_limit, recv_ts_us))
                    }
                    Err(errno) => Err(errno.into()),
                }
            })
            .await
        {
            Ok((src, bytes, ifindex, hop_limit, recv_ts_us)) => {
                let Some(src) = src else {
                    IoError::RecvMissingAncillaryData.log();
                    continue;
                };
                let Some(ifindex) = ifindex else {
                    IoError::RecvMissingAncillaryData.log();
                    continue;
                };

                // Reject packets that can't have originated on-link. We
                // send with a hop limit of 255, so anything lower has been
                // forwarded and is likely spoofed.
                if hop_limit < SPARK_HOP_LIMIT {
                    Error::HopLimitTooLow(src, hop_limit).log();
                    continue;
                }

                // Kernel timestamps aren't guaranteed; fall back to the
                // wall clock.
                let recv_ts_us = recv_ts_us
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_micros());

                let packet = Packet::decode(&iov[0].deref()[..bytes]);
                let msg = NetRxPacketMsg {
                    ifindex,
                    src,
                    bytes,
                    recv_ts_us,
                    packet,
                };
                net_packet_rxp.send(msg).await?;
            }
            Err(error)
                if error.kind() == std::io::ErrorKind::Interrupted =>
            {
                // Retry if the syscall was interrupted (EINTR).
                continue;
            }
            Err(error) => {
                IoError::RecvError(error).log();
            }
        }
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn write_loop(
    socket: Arc<AsyncFd<Socket>>,
    udp_port: u16,
    mut net_tx_packetc: spark_utils::UnboundedReceiver<NetTxPacketMsg>,
) {
    while let Some(msg) = net_tx_packetc.recv().await {
        if let Err(error) = send_packet(&socket, udp_port, &msg).await {
            error.log();
        }
    }
}

// ===== helper functions =====

#[cfg(not(feature = "testing"))]
async fn send_packet(
    socket: &AsyncFd<Socket>,
    udp_port: u16,
    msg: &NetTxPacketMsg,
) -> Result<usize, IoError> {
    if msg.buf.len() > MIN_IPV6_MTU {
        return Err(IoError::PacketTooBig(msg.buf.len()));
    }

    // The destination is always the well-known multicast group; the source
    // address and the egress interface are pinned via IPV6_PKTINFO.
    let dst = SockaddrIn6::from(SocketAddrV6::new(
        SPARK_MCAST_ADDR,
        udp_port,
        0,
        msg.ifindex,
    ));
    let pktinfo = libc::in6_pktinfo {
        ipi6_addr: libc::in6_addr {
            s6_addr: msg.src.octets(),
        },
        ipi6_ifindex: msg.ifindex,
    };

    socket
        .async_io(tokio::io::Interest::WRITABLE, |socket| {
            let iov = [IoSlice::new(&msg.buf)];
            let cmsgs = [ControlMessage::Ipv6PacketInfo(&pktinfo)];
            socket::sendmsg(
                socket.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::empty(),
                Some(&dst),
            )
            .map_err(|errno| errno.into())
        })
        .await
        .map_err(IoError::SendError)
}
