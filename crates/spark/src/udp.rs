//! The real IPv6 multicast transport.
//!
//! One UDP socket serves every tracked interface: it joins the discovery
//! group per ifIndex and uses `IPV6_PKTINFO` to attribute received packets
//! to their arrival interface. Hop limit is fixed at 255 outbound and
//! reported inbound so the receiver can reject off-link senders, and
//! `SO_TIMESTAMPNS` supplies kernel receive timestamps for RTT estimation.
//!
//! The ancillary-data plumbing (`recvmsg` + cmsg parsing) has no safe
//! wrapper in std or tokio, so this module is the one place that talks raw
//! `libc`.

use crate::io::{PacketIo, RecvPacket};
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use spindle_common::{MIN_IPV6_MTU, SPARK_HOP_LIMIT, SPARK_MCAST_ADDR};
use std::io;
use std::mem;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::unix::AsyncFd;

pub struct UdpPacketIo {
    fd: AsyncFd<Socket>,
    mcast_group: Ipv6Addr,
    port: u16,
    recv_buf: Vec<u8>,
}

impl UdpPacketIo {
    /// Bind the discovery socket on `port`.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_only_v6(true)?;
        socket.set_reuse_address(true)?;
        socket.set_multicast_hops_v6(u32::from(SPARK_HOP_LIMIT))?;
        socket.set_multicast_loop_v6(false)?;
        set_int_sockopt(&socket, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)?;
        set_int_sockopt(&socket, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, 1)?;
        // Best effort: without kernel timestamps RTT samples are just
        // noisier.
        if let Err(e) = set_int_sockopt(&socket, libc::SOL_SOCKET, libc::SO_TIMESTAMPNS, 1) {
            tracing::warn!("kernel timestamping unavailable: {}", e);
        }

        let bind_addr: SocketAddr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into();
        socket.bind(&bind_addr.into())?;

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            mcast_group: SPARK_MCAST_ADDR.parse().expect("valid multicast literal"),
            port,
            // One extra byte so an oversized datagram shows up as > MTU
            // instead of being silently truncated to exactly MTU.
            recv_buf: vec![0u8; MIN_IPV6_MTU + 1],
        })
    }
}

fn set_int_sockopt(socket: &Socket, level: i32, name: i32, value: i32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct RawRecv {
    len: usize,
    if_index: u32,
    src: Ipv6Addr,
    hop_limit: u8,
    ts_us: i64,
    truncated: bool,
}

fn recvmsg_once(fd: i32, buf: &mut [u8]) -> io::Result<RawRecv> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut src_storage: libc::sockaddr_in6 = mem::zeroed();
        let mut cmsg_space = [0u8; 256];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_name = &mut src_storage as *mut libc::sockaddr_in6 as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space.len();

        let n = libc::recvmsg(fd, &mut msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut if_index = 0u32;
        let mut hop_limit = 0u8;
        let mut ts_us = 0i64;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
                let info = &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                if_index = info.ipi6_ifindex;
            } else if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_HOPLIMIT {
                hop_limit = *(libc::CMSG_DATA(cmsg) as *const libc::c_int) as u8;
            } else if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_TIMESTAMPNS {
                let ts = &*(libc::CMSG_DATA(cmsg) as *const libc::timespec);
                ts_us = ts.tv_sec * 1_000_000 + ts.tv_nsec / 1_000;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        Ok(RawRecv {
            len: n as usize,
            if_index,
            src: Ipv6Addr::from(src_storage.sin6_addr.s6_addr),
            hop_limit,
            ts_us,
            truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
        })
    }
}

fn wall_clock_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl PacketIo for UdpPacketIo {
    async fn recv(&mut self) -> io::Result<RecvPacket> {
        let raw_fd = self.fd.get_ref().as_raw_fd();
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|_| recvmsg_once(raw_fd, &mut self.recv_buf)) {
                Ok(Ok(raw)) => {
                    let len = if raw.truncated {
                        self.recv_buf.len()
                    } else {
                        raw.len
                    };
                    let recv_time_us = if raw.ts_us != 0 { raw.ts_us } else { wall_clock_us() };
                    return Ok(RecvPacket {
                        data: self.recv_buf[..len].to_vec(),
                        if_index: raw.if_index,
                        src: raw.src,
                        hop_limit: raw.hop_limit,
                        recv_time_us,
                    });
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&mut self, if_index: u32, payload: &[u8]) -> io::Result<usize> {
        // The scope id steers link-local multicast out the right interface.
        let dst: SockAddr =
            SocketAddrV6::new(self.mcast_group, self.port, 0, if_index).into();
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(payload, &dst)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    fn join_multicast(&mut self, if_index: u32) -> io::Result<()> {
        self.fd
            .get_ref()
            .join_multicast_v6(&self.mcast_group, if_index)
    }

    fn leave_multicast(&mut self, if_index: u32) -> io::Result<()> {
        self.fd
            .get_ref()
            .leave_multicast_v6(&self.mcast_group, if_index)
    }

    fn now_us(&self) -> i64 {
        wall_clock_us()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral() {
        // Environments without IPv6 get a pass, not a failure.
        let Ok(io) = UdpPacketIo::bind(0) else {
            return;
        };
        assert!(io.now_us() > 0);
    }
}
