//! BPDU codec (C4): encode/decode/validate 802.1D Config, TCN, PVST+ Config,
//! PVST+ TCN frames.
//!
//! Byte offsets and struct layouts are bit-exact with
//! `original_source/include/{l2,stp_common}.h`. Multibyte fields are network
//! (big-endian) order on the wire; `byteorder` is used for the conversions,
//! the same crate the workspace already pulls in for other wire-format work.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sonic_types::{MacAddress, VlanId};
use std::io::{Cursor, Read, Write};

use crate::error::{Result, StpError};
use crate::model::{BridgeIdentifier, PortIdentifier};

pub const STP_DEST_MAC: MacAddress = MacAddress::new([0x01, 0x80, 0xC2, 0x00, 0x00, 0x00]);
pub const PVST_DEST_MAC: MacAddress = MacAddress::new([0x01, 0x00, 0x0C, 0xCC, 0xCC, 0xCD]);

const LLC_SAP_STP: u8 = 0x42;
const LLC_CONTROL_UI: u8 = 0x03;
const SNAP_SAP_PVST: u8 = 0xAA;
const SNAP_OUI: [u8; 3] = [0x00, 0x00, 0x0C];
const SNAP_PROTOCOL_ID_PVST: u16 = 0x010B;

const MAC_HEADER_LEN: usize = 14;
const LLC_HEADER_LEN: usize = 3;
const SNAP_HEADER_LEN: usize = 8;

/// `STP_SIZEOF_CONFIG_BPDU` — bytes of the Config BPDU body after the LLC/SNAP
/// header, from `protocol_id` through `forward_delay`.
pub const STP_SIZEOF_CONFIG_BPDU: usize = 35;
/// `STP_SIZEOF_TCN_BPDU` — bytes of the TCN BPDU body before its padding.
pub const STP_SIZEOF_TCN_BPDU: usize = 4;
/// `STP_MAX_PKT_LEN` from `original_source/include/l2.h`.
pub const STP_MAX_PKT_LEN: usize = 68;
/// `VLAN_HEADER_LEN` from `original_source/include/l2.h`.
pub const VLAN_HEADER_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BpduType {
    Config,
    /// Recognized and counted, processed with 802.1D rules per spec §1
    /// Non-goals — RSTP convergence semantics are out of scope.
    Rstp,
    Tcn,
}

impl BpduType {
    fn from_wire(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(BpduType::Config),
            0x02 => Some(BpduType::Rstp),
            0x80 => Some(BpduType::Tcn),
            _ => None,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            BpduType::Config => 0x00,
            BpduType::Rstp => 0x02,
            BpduType::Tcn => 0x80,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BpduFlags {
    pub topology_change: bool,
    pub topology_change_acknowledge: bool,
}

impl BpduFlags {
    fn from_wire(b: u8) -> Self {
        Self {
            topology_change: b & 0x01 != 0,
            topology_change_acknowledge: b & 0x80 != 0,
        }
    }

    fn to_wire(self) -> u8 {
        (self.topology_change as u8) | ((self.topology_change_acknowledge as u8) << 7)
    }
}

/// Common Config BPDU body, shared byte-for-byte between the 802.1D and
/// PVST+ encodings (spec §4.4). `message_age`/`max_age`/`hello_time`/
/// `forward_delay` are seconds here; the wire format is `seconds << 8`
/// (1/256-second units), converted at encode/decode time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigBpdu {
    pub bpdu_type: BpduType,
    pub flags: BpduFlags,
    pub root_id: BridgeIdentifier,
    pub root_path_cost: u32,
    pub bridge_id: BridgeIdentifier,
    pub port_id: PortIdentifier,
    pub message_age: u16,
    pub max_age: u16,
    pub hello_time: u16,
    pub forward_delay: u16,
}

/// A decoded frame, tagged by which of the four wire formats it was.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    StpConfig(ConfigBpdu),
    StpTcn,
    PvstConfig { bpdu: ConfigBpdu, vlan_id: VlanId },
    PvstTcn,
}

// The wire layout packs `priority` (high nibble) and `system_id` (low 12
// bits) the same way regardless of extend/legacy mode — `system_id` simply
// holds the VLAN id in extend mode and 0 in legacy mode (`BridgeIdentifier`
// already enforces that at construction). Mode only matters to the *ordering*
// in `model::BridgeIdentifier::cmp_in_mode`, not to the bytes on the wire.
fn write_bridge_id<W: Write>(w: &mut W, id: &BridgeIdentifier) -> Result<()> {
    let field = ((id.priority as u16) << 12) | id.system_id;
    w.write_u16::<BigEndian>(field).map_err(StpError::Io)?;
    w.write_all(id.mac.as_bytes()).map_err(StpError::Io)?;
    Ok(())
}

fn read_bridge_id(cursor: &mut Cursor<&[u8]>) -> Result<BridgeIdentifier> {
    let field = cursor.read_u16::<BigEndian>().map_err(StpError::Io)?;
    let priority = (field >> 12) as u8;
    let system_id = field & 0x0FFF;
    let mut mac_bytes = [0u8; 6];
    cursor.read_exact(&mut mac_bytes).map_err(StpError::Io)?;
    Ok(BridgeIdentifier::new(priority, system_id, MacAddress::new(mac_bytes)))
}

fn write_config_body<W: Write>(w: &mut W, bpdu: &ConfigBpdu) -> Result<()> {
    w.write_u16::<BigEndian>(0x0000).map_err(StpError::Io)?; // protocol_id
    w.write_u8(0).map_err(StpError::Io)?; // protocol_version_id
    w.write_u8(bpdu.bpdu_type.to_wire()).map_err(StpError::Io)?;
    w.write_u8(bpdu.flags.to_wire()).map_err(StpError::Io)?;
    write_bridge_id(w, &bpdu.root_id)?;
    w.write_u32::<BigEndian>(bpdu.root_path_cost).map_err(StpError::Io)?;
    write_bridge_id(w, &bpdu.bridge_id)?;
    w.write_u16::<BigEndian>(bpdu.port_id.as_u16()).map_err(StpError::Io)?;
    w.write_u16::<BigEndian>(bpdu.message_age << 8).map_err(StpError::Io)?;
    w.write_u16::<BigEndian>(bpdu.max_age << 8).map_err(StpError::Io)?;
    w.write_u16::<BigEndian>(bpdu.hello_time << 8).map_err(StpError::Io)?;
    w.write_u16::<BigEndian>(bpdu.forward_delay << 8).map_err(StpError::Io)?;
    Ok(())
}

fn read_config_body(cursor: &mut Cursor<&[u8]>) -> Result<ConfigBpdu> {
    let protocol_id = cursor.read_u16::<BigEndian>().map_err(StpError::Io)?;
    let _version = cursor.read_u8().map_err(StpError::Io)?;
    let type_byte = cursor.read_u8().map_err(StpError::Io)?;
    if protocol_id != 0x0000 {
        return Err(StpError::InvalidFrame(format!(
            "unexpected inner protocol id {protocol_id:#06x}"
        )));
    }
    let bpdu_type = BpduType::from_wire(type_byte)
        .ok_or_else(|| StpError::InvalidFrame(format!("unknown BPDU type {type_byte:#04x}")))?;
    let flags_byte = cursor.read_u8().map_err(StpError::Io)?;
    let flags = BpduFlags::from_wire(flags_byte);
    let root_id = read_bridge_id(cursor)?;
    let root_path_cost = cursor.read_u32::<BigEndian>().map_err(StpError::Io)?;
    let bridge_id = read_bridge_id(cursor)?;
    let port_field = cursor.read_u16::<BigEndian>().map_err(StpError::Io)?;
    let port_id = PortIdentifier::new((port_field >> 12) as u8, port_field & 0x0FFF);
    let message_age = cursor.read_u16::<BigEndian>().map_err(StpError::Io)? >> 8;
    let max_age = cursor.read_u16::<BigEndian>().map_err(StpError::Io)? >> 8;
    let hello_time = cursor.read_u16::<BigEndian>().map_err(StpError::Io)? >> 8;
    let forward_delay = cursor.read_u16::<BigEndian>().map_err(StpError::Io)? >> 8;
    Ok(ConfigBpdu {
        bpdu_type,
        flags,
        root_id,
        root_path_cost,
        bridge_id,
        port_id,
        message_age,
        max_age,
        hello_time,
        forward_delay,
    })
}

fn write_mac_header<W: Write>(w: &mut W, dst: MacAddress, src: MacAddress, length: u16) -> Result<()> {
    w.write_all(dst.as_bytes()).map_err(StpError::Io)?;
    w.write_all(src.as_bytes()).map_err(StpError::Io)?;
    w.write_u16::<BigEndian>(length).map_err(StpError::Io)?;
    Ok(())
}

fn write_snap_header<W: Write>(w: &mut W) -> Result<()> {
    w.write_u8(SNAP_SAP_PVST).map_err(StpError::Io)?;
    w.write_u8(SNAP_SAP_PVST).map_err(StpError::Io)?;
    w.write_u8(LLC_CONTROL_UI).map_err(StpError::Io)?;
    w.write_all(&SNAP_OUI).map_err(StpError::Io)?;
    w.write_u16::<BigEndian>(SNAP_PROTOCOL_ID_PVST).map_err(StpError::Io)?;
    Ok(())
}

/// `MAC_HEADER_LEN + LLC_HEADER_LEN + STP_SIZEOF_CONFIG_BPDU` — the exact
/// byte length [`encode_stp_config_into`] writes.
pub const STP_CONFIG_FRAME_LEN: usize = MAC_HEADER_LEN + LLC_HEADER_LEN + STP_SIZEOF_CONFIG_BPDU;
/// Byte length of an 802.1D TCN frame.
pub const STP_TCN_FRAME_LEN: usize = MAC_HEADER_LEN + LLC_HEADER_LEN + STP_SIZEOF_TCN_BPDU + 3;
/// Byte length of a PVST+ Config frame.
pub const PVST_CONFIG_FRAME_LEN: usize =
    MAC_HEADER_LEN + SNAP_HEADER_LEN + STP_SIZEOF_CONFIG_BPDU + 3 + 2 + 2;
/// Byte length of a PVST+ TCN frame.
pub const PVST_TCN_FRAME_LEN: usize = MAC_HEADER_LEN + SNAP_HEADER_LEN + STP_SIZEOF_TCN_BPDU + 38;

/// Encodes an 802.1D Config BPDU directly into `out` with no allocation;
/// `out` must be at least [`STP_CONFIG_FRAME_LEN`] bytes. Returns the number
/// of bytes written.
pub fn encode_stp_config_into(out: &mut [u8], src_mac: MacAddress, bpdu: &ConfigBpdu) -> Result<usize> {
    let mut w = Cursor::new(out);
    write_mac_header(&mut w, STP_DEST_MAC, src_mac, (LLC_HEADER_LEN + STP_SIZEOF_CONFIG_BPDU) as u16)?;
    w.write_u8(LLC_SAP_STP).map_err(StpError::Io)?;
    w.write_u8(LLC_SAP_STP).map_err(StpError::Io)?;
    w.write_u8(LLC_CONTROL_UI).map_err(StpError::Io)?;
    write_config_body(&mut w, bpdu)?;
    Ok(w.position() as usize)
}

/// Allocating convenience wrapper around [`encode_stp_config_into`].
pub fn encode_stp_config(src_mac: MacAddress, bpdu: &ConfigBpdu) -> Vec<u8> {
    let mut buf = vec![0u8; STP_CONFIG_FRAME_LEN];
    let n = encode_stp_config_into(&mut buf, src_mac, bpdu).expect("buffer sized for STP_CONFIG_FRAME_LEN");
    buf.truncate(n);
    buf
}

/// Encodes an 802.1D TCN BPDU directly into `out`; `out` must be at least
/// [`STP_TCN_FRAME_LEN`] bytes.
pub fn encode_stp_tcn_into(out: &mut [u8], src_mac: MacAddress) -> Result<usize> {
    let mut w = Cursor::new(out);
    write_mac_header(&mut w, STP_DEST_MAC, src_mac, (LLC_HEADER_LEN + STP_SIZEOF_TCN_BPDU) as u16)?;
    w.write_u8(LLC_SAP_STP).map_err(StpError::Io)?;
    w.write_u8(LLC_SAP_STP).map_err(StpError::Io)?;
    w.write_u8(LLC_CONTROL_UI).map_err(StpError::Io)?;
    w.write_u16::<BigEndian>(0x0000).map_err(StpError::Io)?;
    w.write_u8(0).map_err(StpError::Io)?;
    w.write_u8(BpduType::Tcn.to_wire()).map_err(StpError::Io)?;
    w.write_all(&[0u8; 3]).map_err(StpError::Io)?;
    Ok(w.position() as usize)
}

/// Allocating convenience wrapper around [`encode_stp_tcn_into`].
pub fn encode_stp_tcn(src_mac: MacAddress) -> Vec<u8> {
    let mut buf = vec![0u8; STP_TCN_FRAME_LEN];
    let n = encode_stp_tcn_into(&mut buf, src_mac).expect("buffer sized for STP_TCN_FRAME_LEN");
    buf.truncate(n);
    buf
}

/// Encodes a PVST+ Config BPDU directly into `out`; `out` must be at least
/// [`PVST_CONFIG_FRAME_LEN`] bytes.
pub fn encode_pvst_config_into(
    out: &mut [u8],
    src_mac: MacAddress,
    bpdu: &ConfigBpdu,
    vlan_id: VlanId,
) -> Result<usize> {
    let body_len = STP_SIZEOF_CONFIG_BPDU + 3 + 2 + 2;
    let mut w = Cursor::new(out);
    write_mac_header(&mut w, PVST_DEST_MAC, src_mac, (SNAP_HEADER_LEN + body_len) as u16)?;
    write_snap_header(&mut w)?;
    write_config_body(&mut w, bpdu)?;
    w.write_all(&[0u8; 3]).map_err(StpError::Io)?;
    w.write_u16::<BigEndian>(2).map_err(StpError::Io)?; // tag_length
    w.write_u16::<BigEndian>(vlan_id.as_u16()).map_err(StpError::Io)?;
    Ok(w.position() as usize)
}

/// Allocating convenience wrapper around [`encode_pvst_config_into`].
pub fn encode_pvst_config(src_mac: MacAddress, bpdu: &ConfigBpdu, vlan_id: VlanId) -> Vec<u8> {
    let mut buf = vec![0u8; PVST_CONFIG_FRAME_LEN];
    let n = encode_pvst_config_into(&mut buf, src_mac, bpdu, vlan_id)
        .expect("buffer sized for PVST_CONFIG_FRAME_LEN");
    buf.truncate(n);
    buf
}

/// Encodes a PVST+ TCN BPDU directly into `out`; `out` must be at least
/// [`PVST_TCN_FRAME_LEN`] bytes.
pub fn encode_pvst_tcn_into(out: &mut [u8], src_mac: MacAddress) -> Result<usize> {
    let body_len = STP_SIZEOF_TCN_BPDU + 38;
    let mut w = Cursor::new(out);
    write_mac_header(&mut w, PVST_DEST_MAC, src_mac, (SNAP_HEADER_LEN + body_len) as u16)?;
    write_snap_header(&mut w)?;
    w.write_u16::<BigEndian>(0x0000).map_err(StpError::Io)?;
    w.write_u8(0).map_err(StpError::Io)?;
    w.write_u8(BpduType::Tcn.to_wire()).map_err(StpError::Io)?;
    w.write_all(&[0u8; 38]).map_err(StpError::Io)?;
    Ok(w.position() as usize)
}

/// Allocating convenience wrapper around [`encode_pvst_tcn_into`].
pub fn encode_pvst_tcn(src_mac: MacAddress) -> Vec<u8> {
    let mut buf = vec![0u8; PVST_TCN_FRAME_LEN];
    let n = encode_pvst_tcn_into(&mut buf, src_mac).expect("buffer sized for PVST_TCN_FRAME_LEN");
    buf.truncate(n);
    buf
}

/// Decodes and validates a received frame (spec §4.4 accept predicates).
///
/// The hello-time clamp from §4.4/§9(b) is *not* applied here: the decoded
/// `hello_time` is always the bytes that were on the wire. Callers that need
/// the tolerant "treat sub-1s hello as 2s" behavior must call
/// [`clamp_hello_time`] on their own local copy, never mutate the decoded
/// value in place — the original silently overwrote the field before
/// comparison, which this codec deliberately does not reproduce.
pub fn decode(frame: &[u8]) -> Result<Frame> {
    if frame.len() < MAC_HEADER_LEN + LLC_HEADER_LEN {
        return Err(StpError::InvalidFrame("frame shorter than MAC+LLC header".to_string()));
    }
    let dsap = frame[MAC_HEADER_LEN];
    let ssap = frame[MAC_HEADER_LEN + 1];
    let control = frame[MAC_HEADER_LEN + 2];

    if dsap == LLC_SAP_STP && ssap == LLC_SAP_STP {
        if control != LLC_CONTROL_UI {
            return Err(StpError::InvalidFrame("LLC frame is not UI".to_string()));
        }
        let body = &frame[MAC_HEADER_LEN + LLC_HEADER_LEN..];
        return decode_stp_body(body);
    }

    if dsap == SNAP_SAP_PVST && ssap == SNAP_SAP_PVST {
        if frame.len() < MAC_HEADER_LEN + SNAP_HEADER_LEN {
            return Err(StpError::InvalidFrame("frame shorter than MAC+SNAP header".to_string()));
        }
        if control != LLC_CONTROL_UI {
            return Err(StpError::InvalidFrame("SNAP frame is not UI".to_string()));
        }
        let oui = &frame[MAC_HEADER_LEN + 3..MAC_HEADER_LEN + 6];
        if oui != SNAP_OUI {
            return Err(StpError::InvalidFrame(format!("unexpected SNAP OUI {oui:?}")));
        }
        let mut cursor = Cursor::new(&frame[MAC_HEADER_LEN + 6..MAC_HEADER_LEN + 8]);
        let snap_protocol_id = cursor.read_u16::<BigEndian>().map_err(StpError::Io)?;
        if snap_protocol_id != SNAP_PROTOCOL_ID_PVST {
            return Err(StpError::InvalidFrame(format!(
                "unexpected SNAP protocol id {snap_protocol_id:#06x}"
            )));
        }
        let body = &frame[MAC_HEADER_LEN + SNAP_HEADER_LEN..];
        return decode_pvst_body(body);
    }

    Err(StpError::InvalidFrame(format!(
        "unrecognized DSAP/SSAP {dsap:#04x}/{ssap:#04x}"
    )))
}

fn decode_stp_body(body: &[u8]) -> Result<Frame> {
    if body.len() < 4 {
        return Err(StpError::InvalidFrame("STP body too short".to_string()));
    }
    let type_byte = body[3];
    match BpduType::from_wire(type_byte) {
        Some(BpduType::Tcn) => Ok(Frame::StpTcn),
        Some(BpduType::Config) | Some(BpduType::Rstp) => {
            let mut cursor = Cursor::new(body);
            let bpdu = read_config_body(&mut cursor)?;
            Ok(Frame::StpConfig(bpdu))
        }
        None => Err(StpError::InvalidFrame(format!("unknown BPDU type {type_byte:#04x}"))),
    }
}

fn decode_pvst_body(body: &[u8]) -> Result<Frame> {
    if body.len() < 4 {
        return Err(StpError::InvalidFrame("PVST body too short".to_string()));
    }
    let type_byte = body[3];
    match BpduType::from_wire(type_byte) {
        Some(BpduType::Tcn) => Ok(Frame::PvstTcn),
        Some(BpduType::Config) => {
            // Read sequentially off one `Cursor` over the whole remaining
            // slice, the same checked style `decode_stp_body` uses — any
            // short/truncated body runs out of bytes and returns `Err`
            // through `std::io::Read` rather than panicking on a raw slice
            // index.
            let mut cursor = Cursor::new(body);
            let bpdu = read_config_body(&mut cursor)?;
            let mut reserved = [0u8; 3];
            cursor.read_exact(&mut reserved).map_err(StpError::Io)?;
            let tag_length = cursor.read_u16::<BigEndian>().map_err(StpError::Io)?;
            if tag_length != 2 {
                return Err(StpError::InvalidFrame(format!("unexpected tag length {tag_length}")));
            }
            let vlan_raw = cursor.read_u16::<BigEndian>().map_err(StpError::Io)?;
            let vlan_id = VlanId::new(vlan_raw)
                .map_err(|_| StpError::InvalidFrame(format!("invalid PVST vlan id {vlan_raw}")))?;
            Ok(Frame::PvstConfig { bpdu, vlan_id })
        }
        Some(BpduType::Rstp) | None => Err(StpError::InvalidFrame(format!(
            "PVST accepts only Config/TCN, got type {type_byte:#04x}"
        ))),
    }
}

/// Tolerant hello-time clamp applied by receive handlers to their own local
/// copy of a decoded `hello_time` (spec §4.4, §9(b)): values under 1 second
/// are treated as the 2-second default.
pub fn clamp_hello_time(seconds: u16) -> u16 {
    if seconds < 1 {
        2
    } else {
        seconds
    }
}

/// Splices an 802.1Q tag carrying `vlan_id` into an already-encoded frame,
/// between the source MAC and the length/SNAP field. `stp::send_config_bpdu`
/// passes `tagged: true` for ports whose PVST+ membership on `vlan_id` is
/// tagged; the transmit path (not this codec) is responsible for calling
/// this before handing the frame to the kernel, since an untagged send goes
/// out exactly as [`encode_pvst_config`]/[`encode_pvst_tcn`] produced it.
pub fn insert_vlan_tag(frame: &[u8], vlan_id: VlanId) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + VLAN_HEADER_LEN);
    out.extend_from_slice(&frame[..12]);
    out.extend_from_slice(&0x8100u16.to_be_bytes());
    out.extend_from_slice(&vlan_id.as_u16().to_be_bytes());
    out.extend_from_slice(&frame[12..]);
    out
}
