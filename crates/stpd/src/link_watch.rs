//! Netlink link discovery and monitoring (bin-only). A single
//! `NETLINK_ROUTE` socket is used twice: once for an `RTM_GETLINK` dump at
//! startup (spec §4.3 "interface table is populated from kernel state before
//! the first tick"), then left bound to the `RTMGRP_LINK` multicast group so
//! the same file descriptor keeps delivering unsolicited `RTM_NEWLINK`/
//! `RTM_DELLINK` notifications for [`stpd::stp::port_event`]. Grounded in
//! the teacher's `netlink_socket.rs`, which parses the same message family
//! by hand rather than through a higher-level async client.

use std::os::unix::io::{AsRawFd, RawFd};

use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use sonic_types::MacAddress;
use tracing::warn;

use stpd::error::{Result, StpError};

/// `RTMGRP_LINK`: multicast group carrying link up/down/create/delete.
const RTMGRP_LINK: u32 = 1;
const IFF_RUNNING: u32 = 0x40;

/// One event pulled off the netlink socket: either a link the dump/monitor
/// observed, with enough detail for [`stpd::iftable::InterfaceTable::upsert`],
/// or a deletion by kernel ifindex.
#[derive(Debug)]
pub enum RawLinkEvent {
    Upserted {
        name: String,
        kernel_index: u32,
        mac: MacAddress,
        up: bool,
        master_ifindex: Option<u32>,
    },
    Deleted {
        kernel_index: u32,
    },
}

pub struct LinkWatcher {
    socket: Socket,
}

impl LinkWatcher {
    /// Opens the socket, joins `RTMGRP_LINK`, and sends the initial dump
    /// request. Callers should drain [`Self::recv_batch`] in a loop right
    /// after construction to consume the dump replies before treating
    /// further reads as live events — both arrive on the same fd.
    pub fn open() -> Result<Self> {
        let mut socket =
            Socket::new(NETLINK_ROUTE).map_err(|e| StpError::Transport(format!("netlink socket: {e}")))?;
        socket
            .bind(&SocketAddr::new(0, RTMGRP_LINK))
            .map_err(|e| StpError::Transport(format!("netlink bind: {e}")))?;
        socket
            .set_non_blocking(true)
            .map_err(|e| StpError::Transport(format!("netlink set_non_blocking: {e}")))?;

        let watcher = Self { socket };
        watcher.request_dump()?;
        Ok(watcher)
    }

    fn request_dump(&self) -> Result<()> {
        let mut msg = NetlinkMessage::from(RouteNetlinkMessage::GetLink(LinkMessage::default()));
        msg.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        msg.header.sequence_number = 1;
        msg.finalize();
        let mut buf = vec![0u8; msg.header.length as usize];
        msg.serialize(&mut buf);
        self.socket
            .send(&buf, 0)
            .map_err(|e| StpError::Transport(format!("netlink dump request: {e}")))?;
        Ok(())
    }

    /// Reads one datagram, nonblocking, and decodes every netlink message it
    /// contains (dump replies batch several `RTM_NEWLINK`s per datagram).
    /// Returns an empty vec on `EAGAIN`/`EWOULDBLOCK`.
    pub fn recv_batch(&self) -> Result<Vec<RawLinkEvent>> {
        let mut buf = vec![0u8; 16 * 1024];
        let n = match self.socket.recv(&mut &mut buf[..], 0) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Vec::new()),
            Err(e) => return Err(StpError::Transport(format!("netlink recv: {e}"))),
        };
        Ok(parse_many(&buf[..n]))
    }
}

impl AsRawFd for LinkWatcher {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

fn parse_many(buf: &[u8]) -> Vec<RawLinkEvent> {
    let mut events = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "discarding malformed netlink message");
                break;
            }
        };
        let len = msg.header.length as usize;
        if len == 0 {
            break;
        }
        match msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                events.push(extract(link));
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                events.push(RawLinkEvent::Deleted {
                    kernel_index: link.header.index,
                });
            }
            NetlinkPayload::Done(_) | NetlinkPayload::Error(_) | NetlinkPayload::Noop => {}
            _ => {}
        }
        offset += len;
    }
    events
}

fn extract(link: LinkMessage) -> RawLinkEvent {
    let mut name = String::new();
    let mut mac = MacAddress::ZERO;
    let mut master_ifindex = None;
    for attr in &link.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = n.clone(),
            LinkAttribute::Address(bytes) if bytes.len() == 6 => {
                mac = MacAddress::new([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]]);
            }
            LinkAttribute::Controller(idx) => master_ifindex = Some(*idx),
            _ => {}
        }
    }
    RawLinkEvent::Upserted {
        name,
        kernel_index: link.header.index,
        mac,
        up: link.header.flags & IFF_RUNNING != 0,
        master_ifindex,
    }
}
