//! OS wiring for the `stpd` binary: an AF_PACKET socket for BPDU rx/tx, a
//! netlink link-event source for interface discovery, and a
//! `std::process::Command`-backed [`sync::DownstreamSync`] (spec §6.4, §9
//! "a native netlink path is preferred but not required").
//!
//! None of this is exercised by the engine's own tests — it exists only to
//! hand `main` real file descriptors to drive [`stp`]/[`sched`]/[`sync`]
//! with. Kept out of `lib.rs` (unlike every other module here) because it
//! is Linux-only glue, not STP logic.

use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;

use sonic_types::{MacAddress, VlanId};
use tracing::{debug, warn};

use stpd::bpdu;
use stpd::error::{Result, StpError};
use stpd::iftable::{InterfaceTable, LinkEvent, LinkSpeed, OperState};
use stpd::model::PortId;
use stpd::stp::PacketTx;
use stpd::sync::{DownstreamSync, VlanInstanceFields, VlanPortFields};

/// Ethernet broadcast/multicast-capable raw socket bound to `ETH_P_ALL`, used
/// to send and receive BPDUs on arbitrary interfaces without per-port binds
/// (spec §6.2: "the daemon owns a single packet socket").
pub struct BpduSocket {
    fd: RawFd,
}

impl BpduSocket {
    /// Opens a nonblocking `AF_PACKET`/`SOCK_RAW` socket listening on every
    /// interface. Requires `CAP_NET_RAW`.
    pub fn open() -> Result<Self> {
        let proto = (libc::ETH_P_ALL as u16).to_be() as i32;
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto) };
        if fd < 0 {
            return Err(StpError::Transport(format!(
                "socket(AF_PACKET, SOCK_RAW): {}",
                std::io::Error::last_os_error()
            )));
        }
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags >= 0 {
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        Ok(Self { fd })
    }

    /// Sends a fully encoded Ethernet frame out of `ifindex`.
    pub fn send_to(&self, ifindex: i32, bytes: &[u8]) -> Result<()> {
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        sll.sll_ifindex = ifindex;
        sll.sll_halen = 6;

        let ret = unsafe {
            libc::sendto(
                self.fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if ret < 0 {
            return Err(StpError::Transport(format!("sendto: {}", std::io::Error::last_os_error())));
        }
        Ok(())
    }

    /// Receives one frame, nonblocking. Returns `(payload, source ifindex)`.
    /// `Ok(None)` means no datagram was ready (`EAGAIN`/`EWOULDBLOCK`).
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, i32)>> {
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        let mut addr_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        let ret = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut sll as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(StpError::Transport(format!("recvfrom: {err}")));
        }
        Ok(Some((ret as usize, sll.sll_ifindex)))
    }
}

impl AsRawFd for BpduSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for BpduSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// [`PacketTx`] backed by a real [`BpduSocket`]. Resolves `PortId` to a
/// kernel ifindex through the live [`InterfaceTable`] on every send, since
/// LAG membership/ifindex can change between ticks.
pub struct RawPacketTx<'a> {
    socket: &'a BpduSocket,
    iftable: &'a InterfaceTable,
}

impl<'a> RawPacketTx<'a> {
    pub fn new(socket: &'a BpduSocket, iftable: &'a InterfaceTable) -> Self {
        Self { socket, iftable }
    }
}

impl<'a> PacketTx for RawPacketTx<'a> {
    fn tx(&mut self, port: PortId, vlan: Option<VlanId>, bytes: &[u8], tagged: bool) -> Result<()> {
        let record = self
            .iftable
            .iter()
            .find(|r| r.port_id == port)
            .ok_or_else(|| StpError::Transport(format!("tx: no interface record for port {}", port.0)))?;
        if record.oper_state != OperState::Up {
            return Ok(());
        }
        match (tagged, vlan) {
            (true, Some(vlan_id)) => {
                let framed = bpdu::insert_vlan_tag(bytes, vlan_id);
                self.socket.send_to(record.kernel_index as i32, &framed)
            }
            _ => self.socket.send_to(record.kernel_index as i32, bytes),
        }
    }
}

/// Strips a leading 802.1Q tag (TPID `0x8100`) from a received frame, if
/// present, returning the carried VLAN id and the frame with the tag
/// removed so [`bpdu::decode`] sees its expected fixed MAC-header layout.
pub fn strip_vlan_tag(frame: &[u8]) -> (Option<VlanId>, Vec<u8>) {
    if frame.len() < 16 || frame[12] != 0x81 || frame[13] != 0x00 {
        return (None, frame.to_vec());
    }
    let vlan_raw = u16::from_be_bytes([frame[14], frame[15]]) & 0x0FFF;
    let vlan_id = VlanId::new(vlan_raw).ok();
    let mut out = Vec::with_capacity(frame.len() - 4);
    out.extend_from_slice(&frame[..12]);
    out.extend_from_slice(&frame[16..]);
    (vlan_id, out)
}

const SIOCETHTOOL: libc::c_ulong = 0x8946;
const ETHTOOL_GSET: u32 = 0x00000001;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct EthtoolCmd {
    cmd: u32,
    supported: u32,
    advertising: u32,
    speed: u16,
    duplex: u8,
    port: u8,
    phy_address: u8,
    transceiver: u8,
    autoneg: u8,
    mdio_support: u8,
    maxtxpkt: u32,
    maxrxpkt: u32,
    speed_hi: u16,
    eth_tp_mdix: u8,
    eth_tp_mdix_ctrl: u8,
    lp_advertising: i32,
    reserved: [u32; 2],
}

#[repr(C)]
struct IfreqEthtool {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_data: *mut libc::c_void,
}

/// Queries link speed via the `SIOCETHTOOL`/`ETHTOOL_GSET` ioctl (spec §4.3
/// needs an observed speed to derive default path cost). Returns
/// `LinkSpeed::None` on any failure — unsupported NIC, virtual interface,
/// permissions — rather than propagating an error, since a missing speed
/// reading should not block interface discovery.
pub fn query_link_speed(ifname: &str) -> LinkSpeed {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return LinkSpeed::None;
    }
    let mut cmd = EthtoolCmd {
        cmd: ETHTOOL_GSET,
        supported: 0,
        advertising: 0,
        speed: 0,
        duplex: 0,
        port: 0,
        phy_address: 0,
        transceiver: 0,
        autoneg: 0,
        mdio_support: 0,
        maxtxpkt: 0,
        maxrxpkt: 0,
        speed_hi: 0,
        eth_tp_mdix: 0,
        eth_tp_mdix_ctrl: 0,
        lp_advertising: 0,
        reserved: [0; 2],
    };
    let mut name = [0 as libc::c_char; IFNAMSIZ];
    for (i, b) in ifname.bytes().take(IFNAMSIZ - 1).enumerate() {
        name[i] = b as libc::c_char;
    }
    let mut ifr = IfreqEthtool {
        ifr_name: name,
        ifr_data: &mut cmd as *mut EthtoolCmd as *mut libc::c_void,
    };
    let ret = unsafe { libc::ioctl(fd, SIOCETHTOOL, &mut ifr as *mut IfreqEthtool) };
    unsafe {
        libc::close(fd);
    }
    if ret < 0 {
        return LinkSpeed::None;
    }
    let mbps = ((cmd.speed_hi as u32) << 16) | cmd.speed as u32;
    match mbps {
        10 => LinkSpeed::Mb10,
        100 => LinkSpeed::Mb100,
        1_000 => LinkSpeed::Gb1,
        10_000 => LinkSpeed::Gb10,
        25_000 => LinkSpeed::Gb25,
        40_000 => LinkSpeed::Gb40,
        100_000 => LinkSpeed::Gb100,
        400_000 => LinkSpeed::Gb400,
        _ => LinkSpeed::None,
    }
}

/// Builds a [`LinkEvent`] for `ifname` by combining the kernel's notion of
/// oper state/ifindex/MAC (already resolved by the netlink caller) with an
/// ethtool speed lookup.
pub fn link_event(
    ifname: &str,
    kernel_index: u32,
    mac: MacAddress,
    up: bool,
    master_ifindex: Option<u32>,
    is_bond: bool,
) -> LinkEvent {
    LinkEvent {
        name: ifname.to_string(),
        kernel_index,
        mac,
        speed: if up { query_link_speed(ifname) } else { LinkSpeed::None },
        oper_state: if up { OperState::Up } else { OperState::Down },
        master_ifindex,
        is_bond,
        is_member: master_ifindex.is_some(),
    }
}

/// Production [`DownstreamSync`]: publish calls are logged at `debug` level
/// (no Redis/swss-common bus exists in this deployment shape), while the two
/// methods with real kernel side effects shell out idempotently, matching
/// the design note that a native netlink path is preferred but not required.
#[derive(Default)]
pub struct ProcessDownstreamSync;

impl DownstreamSync for ProcessDownstreamSync {
    fn publish_vlan_instance(
        &mut self,
        vlan_id: VlanId,
        instance_index: stpd::model::InstanceIndex,
        fields: VlanInstanceFields,
    ) -> Result<()> {
        debug!(?vlan_id, instance = instance_index.0, ?fields, "publish_vlan_instance");
        Ok(())
    }

    fn publish_vlan_port(&mut self, vlan_id: VlanId, port_name: &str, fields: VlanPortFields) -> Result<()> {
        debug!(?vlan_id, port_name, ?fields, "publish_vlan_port");
        Ok(())
    }

    fn publish_port_state(
        &mut self,
        port_name: &str,
        instance_index: stpd::model::InstanceIndex,
        state: stpd::model::PortState,
    ) -> Result<()> {
        debug!(port_name, instance = instance_index.0, ?state, "publish_port_state");
        Ok(())
    }

    fn publish_fast_age(&mut self, vlan_id: VlanId, on: bool) -> Result<()> {
        debug!(?vlan_id, on, "publish_fast_age");
        Ok(())
    }

    fn admin_down_port(&mut self, port_name: &str, physical: bool) -> Result<()> {
        warn!(port_name, physical, "admin_down_port");
        if physical {
            run_command("ip", &["link", "set", "dev", port_name, "down"])?;
        }
        Ok(())
    }

    fn kernel_bridge_vlan(&mut self, port_name: &str, vlan_id: VlanId, add: bool, tagged: bool) -> Result<()> {
        let vlan_arg = if tagged {
            vlan_id.as_u16().to_string()
        } else {
            format!("{} pvid untagged", vlan_id.as_u16())
        };
        let action = if add { "add" } else { "del" };
        let mut args = vec!["vlan", action, "vid"];
        let parts: Vec<&str> = vlan_arg.split(' ').collect();
        args.extend(parts.iter());
        args.extend(["dev", port_name]);
        // Idempotent: the kernel returns EEXIST/ENOENT for a membership that
        // already matches the requested state, which `run_command` treats
        // as success rather than propagating a transport error.
        run_command("bridge", &args)
    }
}

fn run_command(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| StpError::Transport(format!("{program}: {e}")))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("File exists") || stderr.contains("No such") {
        return Ok(());
    }
    Err(StpError::Transport(format!(
        "{program} {args:?} failed: {}",
        stderr.trim()
    )))
}
