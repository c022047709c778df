//! IPC decoder (C9): fixed-layout binary datagrams from the external
//! management agent (spec §6.1). Parsing is pure and allocation-light;
//! [`apply`] is the only place that mutates [`crate::model::Global`] /
//! [`crate::iftable::InterfaceTable`], so a message that fails validation
//! never leaves partial state behind (spec §4.6.12, §7 `ResourceExhausted`/
//! `InvalidArgument`).
//!
//! The wire format itself (`original_source/include/stp_ipc.h`) is C
//! struct layout with `__attribute__((packed))`; we don't have that struct
//! here; we read explicit little-endian fields off a cursor instead, which
//! comes to the same bytes without depending on repr(C) packing rules.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, StpError};
use crate::iftable::InterfaceTable;
use crate::model::{
    BridgeIdentifier, Global, InstanceIndex, PortId, PortIdentifier, ProtoMode,
};
use crate::protect;
use crate::stp;
use sonic_types::{MacAddress, VlanId};

/// `original_source/include/stp_ipc.h`: `STPD_SOCK_NAME`. Re-exported here
/// (also present as [`crate::config::DEFAULT_IPC_SOCK_PATH`]) because it is
/// as much a property of the wire protocol as it is a config default.
pub const SOCK_NAME: &str = "/var/run/stpipc.sock";

/// 5-byte datagram magic (spec §6.1: `reject if missing`).
pub const MAGIC: &[u8; 5] = b"wbosb";

/// `IFNAMSIZ` on Linux; `original_source/include/stp_ipc.h` sizes every
/// `intf_name` field against it.
pub const IF_NAME_MAX: usize = 16;

const HEADER_LEN: usize = MAGIC.len() + 4 + 4;

/// `STP_MSG_TYPE` (`original_source/include/stp_ipc.h`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    InitReady = 1,
    BridgeConfig = 2,
    VlanConfig = 3,
    VlanPortConfig = 4,
    PortConfig = 5,
    VlanMemConfig = 6,
    StpCtl = 7,
}

impl MsgType {
    fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::InitReady),
            2 => Some(Self::BridgeConfig),
            3 => Some(Self::VlanConfig),
            4 => Some(Self::VlanPortConfig),
            5 => Some(Self::PortConfig),
            6 => Some(Self::VlanMemConfig),
            7 => Some(Self::StpCtl),
            _ => None,
        }
    }
}

/// `opcode`/`mode` fields are single bytes with binary meaning throughout
/// (spec §6.1: `opcode: 1 = set/add, 0 = delete`).
fn is_set(opcode: u8) -> bool {
    opcode != 0
}

fn is_tagged(mode: i8) -> bool {
    mode != 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortAttr {
    pub name: [u8; IF_NAME_MAX],
    pub mode: i8,
    pub enabled: bool,
}

impl PortAttr {
    pub fn name_str(&self) -> String {
        cstr(&self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VlanAttr {
    pub inst_id: i32,
    pub vlan_id: i32,
    pub mode: i8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitReadyMsg {
    pub opcode: u8,
    pub max_stp_instances: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfigMsg {
    pub opcode: u8,
    pub proto_mode: u8,
    pub root_guard_timeout: i32,
    pub base_mac: [u8; 6],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VlanConfigMsg {
    pub opcode: u8,
    pub new_instance: bool,
    pub vlan_id: i32,
    pub inst_id: i32,
    pub forward_delay: i32,
    pub hello_time: i32,
    pub max_age: i32,
    pub priority: i32,
    pub ports: Vec<PortAttr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VlanPortConfigMsg {
    pub opcode: u8,
    pub vlan_id: i32,
    pub name: [u8; IF_NAME_MAX],
    pub inst_id: i32,
    pub path_cost: i32,
    pub priority: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortConfigMsg {
    pub opcode: u8,
    pub name: [u8; IF_NAME_MAX],
    pub enabled: bool,
    pub root_guard: bool,
    pub bpdu_guard: bool,
    pub bpdu_guard_do_disable: bool,
    pub portfast: bool,
    pub uplink_fast: bool,
    pub path_cost: i32,
    pub priority: i32,
    pub vlans: Vec<VlanAttr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VlanMemConfigMsg {
    pub opcode: u8,
    pub vlan_id: i32,
    pub inst_id: i32,
    pub name: [u8; IF_NAME_MAX],
    pub enabled: bool,
    pub mode: i8,
    pub path_cost: i32,
    pub priority: i32,
}

/// `STP_CTL_TYPE` (`original_source/include/stp_ipc.h`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum CtlType {
    Help = 0,
    DumpAll = 1,
    DumpGlobal = 2,
    DumpVlanAll = 3,
    DumpVlan = 4,
    DumpIntf = 5,
    SetLogLvl = 6,
    DumpNlDb = 7,
    DumpNlDbIntf = 8,
    DumpLibevStats = 9,
    SetDbg = 10,
    ClearAll = 11,
    ClearVlan = 12,
    ClearIntf = 13,
    ClearVlanIntf = 14,
}

impl CtlType {
    fn from_wire(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Help,
            1 => Self::DumpAll,
            2 => Self::DumpGlobal,
            3 => Self::DumpVlanAll,
            4 => Self::DumpVlan,
            5 => Self::DumpIntf,
            6 => Self::SetLogLvl,
            7 => Self::DumpNlDb,
            8 => Self::DumpNlDbIntf,
            9 => Self::DumpLibevStats,
            10 => Self::SetDbg,
            11 => Self::ClearAll,
            12 => Self::ClearVlan,
            13 => Self::ClearIntf,
            14 => Self::ClearVlanIntf,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StpCtlMsg {
    pub cmd_type: CtlType,
    pub vlan_id: i32,
    pub name: [u8; IF_NAME_MAX],
    pub level: i32,
    pub dbg_flags: u16,
}

/// A fully decoded IPC datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpcMessage {
    InitReady(InitReadyMsg),
    BridgeConfig(BridgeConfigMsg),
    VlanConfig(VlanConfigMsg),
    VlanPortConfig(VlanPortConfigMsg),
    PortConfig(PortConfigMsg),
    VlanMemConfig(VlanMemConfigMsg),
    StpCtl(StpCtlMsg),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| StpError::InvalidArgument("ipc message length overflow".to_string()))?;
        let slice = self.buf.get(self.pos..end).ok_or_else(|| {
            StpError::InvalidArgument(format!("ipc message truncated: wanted {n} bytes at offset {}, have {}", self.pos, self.buf.len()))
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    fn array6(&mut self) -> Result<[u8; 6]> {
        let mut out = [0u8; 6];
        out.copy_from_slice(self.take(6)?);
        Ok(out)
    }

    fn ifname(&mut self) -> Result<[u8; IF_NAME_MAX]> {
        let mut out = [0u8; IF_NAME_MAX];
        out.copy_from_slice(self.take(IF_NAME_MAX)?);
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn cstr(raw: &[u8; IF_NAME_MAX]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Parses one datagram's worth of bytes into an [`IpcMessage`]. Does not
/// touch `Global`/`InterfaceTable` — decode and apply are kept separate so
/// a malformed message is rejected before any state is touched (spec
/// §4.6.12: nothing is partially applied).
pub fn parse_datagram(bytes: &[u8]) -> Result<IpcMessage> {
    if bytes.len() < HEADER_LEN {
        return Err(StpError::InvalidArgument("ipc datagram shorter than header".to_string()));
    }
    if &bytes[0..5] != MAGIC {
        return Err(StpError::InvalidArgument("ipc datagram missing \"wbosb\" magic".to_string()));
    }
    let msg_type_raw = LittleEndian::read_u32(&bytes[5..9]);
    let msg_len = LittleEndian::read_u32(&bytes[9..13]) as usize;
    let data = bytes.get(13..).unwrap_or(&[]);
    if data.len() < msg_len {
        return Err(StpError::InvalidArgument(format!(
            "ipc datagram declares msgLen={msg_len} but only {} bytes follow",
            data.len()
        )));
    }
    let data = &data[..msg_len];
    let msg_type = MsgType::from_wire(msg_type_raw)
        .ok_or_else(|| StpError::InvalidArgument(format!("unknown ipc msgType {msg_type_raw}")))?;

    let mut c = Cursor::new(data);
    match msg_type {
        MsgType::InitReady => Ok(IpcMessage::InitReady(InitReadyMsg {
            opcode: c.u8()?,
            max_stp_instances: c.u16()?,
        })),
        MsgType::BridgeConfig => Ok(IpcMessage::BridgeConfig(BridgeConfigMsg {
            opcode: c.u8()?,
            proto_mode: c.u8()?,
            root_guard_timeout: c.i32()?,
            base_mac: c.array6()?,
        })),
        MsgType::VlanConfig => {
            let opcode = c.u8()?;
            let new_instance = c.u8()? != 0;
            let vlan_id = c.i32()?;
            let inst_id = c.i32()?;
            let forward_delay = c.i32()?;
            let hello_time = c.i32()?;
            let max_age = c.i32()?;
            let priority = c.i32()?;
            let count = c.i32()?;
            let count = usize::try_from(count).map_err(|_| StpError::InvalidArgument("negative port count".to_string()))?;
            let mut ports = Vec::with_capacity(count);
            for _ in 0..count {
                let name = c.ifname()?;
                let mode = c.i8()?;
                let enabled = c.u8()? != 0;
                ports.push(PortAttr { name, mode, enabled });
            }
            Ok(IpcMessage::VlanConfig(VlanConfigMsg {
                opcode,
                new_instance,
                vlan_id,
                inst_id,
                forward_delay,
                hello_time,
                max_age,
                priority,
                ports,
            }))
        }
        MsgType::VlanPortConfig => Ok(IpcMessage::VlanPortConfig(VlanPortConfigMsg {
            opcode: c.u8()?,
            vlan_id: c.i32()?,
            name: c.ifname()?,
            inst_id: c.i32()?,
            path_cost: c.i32()?,
            priority: c.i32()?,
        })),
        MsgType::PortConfig => {
            let opcode = c.u8()?;
            let name = c.ifname()?;
            let enabled = c.u8()? != 0;
            let root_guard = c.u8()? != 0;
            let bpdu_guard = c.u8()? != 0;
            let bpdu_guard_do_disable = c.u8()? != 0;
            let portfast = c.u8()? != 0;
            let uplink_fast = c.u8()? != 0;
            let path_cost = c.i32()?;
            let priority = c.i32()?;
            let count = c.i32()?;
            let count = usize::try_from(count).map_err(|_| StpError::InvalidArgument("negative vlan count".to_string()))?;
            let mut vlans = Vec::with_capacity(count);
            for _ in 0..count {
                let inst_id = c.i32()?;
                let vlan_id = c.i32()?;
                let mode = c.i8()?;
                vlans.push(VlanAttr { inst_id, vlan_id, mode });
            }
            Ok(IpcMessage::PortConfig(PortConfigMsg {
                opcode,
                name,
                enabled,
                root_guard,
                bpdu_guard,
                bpdu_guard_do_disable,
                portfast,
                uplink_fast,
                path_cost,
                priority,
                vlans,
            }))
        }
        MsgType::VlanMemConfig => Ok(IpcMessage::VlanMemConfig(VlanMemConfigMsg {
            opcode: c.u8()?,
            vlan_id: c.i32()?,
            inst_id: c.i32()?,
            name: c.ifname()?,
            enabled: c.u8()? != 0,
            mode: c.i8()?,
            path_cost: c.i32()?,
            priority: c.i32()?,
        })),
        MsgType::StpCtl => {
            let cmd_type_raw = c.i32()?;
            let vlan_id = c.i32()?;
            let name = c.ifname()?;
            let level = c.i32()?;
            // `STP_DEBUG_OPT`: we only read the leading `flags` word and
            // leave any trailing per-bit fields unparsed (see DESIGN.md,
            // Open Question Decisions) — `flags` is the authoritative
            // value and the rest is redundant with it.
            let dbg_flags = if c.remaining() >= 2 { c.u16()? } else { 0 };
            let cmd_type = CtlType::from_wire(cmd_type_raw)
                .ok_or_else(|| StpError::InvalidArgument(format!("unknown stpctl cmdType {cmd_type_raw}")))?;
            Ok(IpcMessage::StpCtl(StpCtlMsg {
                cmd_type,
                vlan_id,
                name,
                level,
                dbg_flags,
            }))
        }
    }
}

fn vlan_id_of(raw: i32) -> Result<VlanId> {
    let raw: u16 = u16::try_from(raw).map_err(|_| StpError::InvalidArgument(format!("vlan id {raw} out of range")))?;
    VlanId::new(raw).map_err(|e| StpError::InvalidArgument(format!("invalid vlan id {raw}: {e}")))
}

fn inst_index_of(raw: i32, global: &Global) -> Result<InstanceIndex> {
    let raw: u16 = u16::try_from(raw).map_err(|_| StpError::InvalidArgument(format!("instance id {raw} out of range")))?;
    if raw >= global.max_instances {
        return Err(StpError::ResourceExhausted(format!("instance id {raw} exceeds max_instances={}", global.max_instances)));
    }
    Ok(InstanceIndex(raw))
}

fn clamp(v: i32, lo: u16, hi: u16) -> u16 {
    v.clamp(lo as i32, hi as i32) as u16
}

/// Resolves every `PortAttr`/`VlanAttr` interface name up front so a
/// message touching an unknown port is rejected before any mutation
/// happens (spec §4.6.12: "nothing is partially applied").
fn resolve_port_ids(iftable: &InterfaceTable, names: &[[u8; IF_NAME_MAX]]) -> Result<Vec<PortId>> {
    names
        .iter()
        .map(|raw| {
            let name = cstr(raw);
            iftable
                .get(&name)
                .map(|rec| rec.port_id)
                .ok_or_else(|| StpError::InvalidArgument(format!("unknown interface {name}")))
        })
        .collect()
}

/// Applies a decoded message to the live model, returning the `STPCTL`
/// text reply when `msg` is [`IpcMessage::StpCtl`] (spec §4.9: "for
/// `STPCTL` also formats a plain-text reply"). `InitReady` is handled by
/// `main.rs`: sizing `Global`/`InterfaceTable` is a construction-time
/// decision that this function, operating on an already-built `Global`,
/// cannot make.
pub fn apply(global: &mut Global, iftable: &mut InterfaceTable, msg: &IpcMessage) -> Result<Option<String>> {
    match msg {
        IpcMessage::InitReady(_) => Ok(None),
        IpcMessage::BridgeConfig(m) => apply_bridge_config(global, m).map(|_| None),
        IpcMessage::VlanConfig(m) => apply_vlan_config(global, iftable, m).map(|_| None),
        IpcMessage::VlanPortConfig(m) => apply_vlan_port_config(global, iftable, m).map(|_| None),
        IpcMessage::PortConfig(m) => apply_port_config(global, iftable, m).map(|_| None),
        IpcMessage::VlanMemConfig(m) => apply_vlan_mem_config(global, iftable, m).map(|_| None),
        IpcMessage::StpCtl(m) => stpctl_format::format_reply(global, iftable, m).map(Some),
    }
}

fn apply_bridge_config(global: &mut Global, m: &BridgeConfigMsg) -> Result<()> {
    if !is_set(m.opcode) {
        global.proto_mode = ProtoMode::None;
        return Ok(());
    }
    global.proto_mode = if m.proto_mode == 0 { ProtoMode::None } else { ProtoMode::Pvst };
    global.root_protect_timeout =
        (m.root_guard_timeout.max(0) as u32).clamp(protect::MIN_ROOT_PROTECT_TIMEOUT_SECS, protect::MAX_ROOT_PROTECT_TIMEOUT_SECS);
    global.base_mac_address = MacAddress::new(m.base_mac);
    Ok(())
}

fn apply_vlan_config(global: &mut Global, iftable: &InterfaceTable, m: &VlanConfigMsg) -> Result<()> {
    let vlan_id = vlan_id_of(m.vlan_id)?;
    let index = inst_index_of(m.inst_id, global)?;
    let port_ids = resolve_port_ids(iftable, &m.ports.iter().map(|p| p.name).collect::<Vec<_>>())?;

    if !is_set(m.opcode) {
        if m.ports.is_empty() {
            // Whole-VLAN delete.
            if global.instance(index).is_none() {
                return Err(StpError::StateConflict(format!("vlan {vlan_id} instance {} already absent", index.0)));
            }
            global.instances[index.0 as usize] = None;
            global.active_instances = global.instances.iter().filter(|i| i.is_some()).count() as u16;
            return Ok(());
        }
        let Some(instance) = global.instance_mut(index) else {
            return Err(StpError::StateConflict(format!("vlan {vlan_id} instance {} already absent", index.0)));
        };
        for port_id in &port_ids {
            let _ = instance.control_mask.clear(port_id.0 as usize);
            let _ = instance.enable_mask.clear(port_id.0 as usize);
            let _ = instance.untag_mask.clear(port_id.0 as usize);
            instance.ports.remove(port_id);
        }
        instance.refresh_lifecycle_state();
        return Ok(());
    }

    if m.new_instance && global.find_instance_by_vlan(vlan_id).is_some() {
        return Err(StpError::StateConflict(format!("vlan {vlan_id} already bound to an instance")));
    }
    if m.new_instance && global.instance(index).is_some() {
        return Err(StpError::ResourceExhausted(format!("instance slot {} already occupied", index.0)));
    }

    if m.new_instance {
        let max_ports = iftable.max_ports();
        let new = stp::new_instance(vlan_id, global, max_ports);
        global.instances[index.0 as usize] = Some(new);
    }

    // Taken out of `global.instances` rather than borrowed via
    // `instance_mut`, since `port_state_selection` below needs `&mut Global`
    // and `&mut Instance` open at the same time.
    let extend_mode = global.extend_mode;
    let mut instance = global.instances[index.0 as usize]
        .take()
        .ok_or_else(|| StpError::InvalidArgument(format!("instance {} not configured; set newInstance first", index.0)))?;

    instance.bridge_info.bridge_forward_delay = clamp(m.forward_delay, stp::defaults::MIN_FORWARD_DELAY, stp::defaults::MAX_FORWARD_DELAY);
    instance.bridge_info.bridge_hello_time = clamp(m.hello_time, stp::defaults::MIN_HELLO_TIME, stp::defaults::MAX_HELLO_TIME);
    instance.bridge_info.bridge_max_age = clamp(m.max_age, stp::defaults::MIN_MAX_AGE, stp::defaults::MAX_MAX_AGE);
    let priority_quantum = ((m.priority.max(0) as u32) >> 12) as u8;
    instance.bridge_info.bridge_id =
        BridgeIdentifier::new(priority_quantum, instance.bridge_info.bridge_id.system_id, instance.bridge_info.bridge_id.mac);
    instance.bridge_info.mark_all();

    for (attr, port_id) in m.ports.iter().zip(port_ids.iter()) {
        if !instance.ports.contains_key(port_id) {
            let priority = iftable.get(&attr.name_str()).map(|r| r.priority).unwrap_or(stp::defaults::DFLT_PORT_PRIORITY_QUANTUM);
            let path_cost = iftable.get(&attr.name_str()).map(|r| r.path_cost).unwrap_or(0);
            stp::init_port(&mut instance, *port_id, priority, path_cost);
        }
        let _ = instance.control_mask.set(port_id.0 as usize);
        if is_tagged(attr.mode) {
            let _ = instance.untag_mask.clear(port_id.0 as usize);
        } else {
            let _ = instance.untag_mask.set(port_id.0 as usize);
        }
        if attr.enabled {
            let _ = instance.enable_mask.set(port_id.0 as usize);
        } else {
            let _ = instance.enable_mask.clear(port_id.0 as usize);
        }
    }
    instance.refresh_lifecycle_state();
    stp::configuration_update(&mut instance, extend_mode);
    stp::port_state_selection(global, &mut instance);
    global.instances[index.0 as usize] = Some(instance);
    Ok(())
}

fn apply_vlan_port_config(global: &mut Global, iftable: &InterfaceTable, m: &VlanPortConfigMsg) -> Result<()> {
    let name = cstr(&m.name);
    let port_id = iftable.get(&name).map(|r| r.port_id).ok_or_else(|| StpError::InvalidArgument(format!("unknown interface {name}")))?;
    let index = inst_index_of(m.inst_id, global)?;
    let instance = global.instance_mut(index).ok_or_else(|| StpError::InvalidArgument(format!("instance {} not configured", index.0)))?;
    let pv = instance
        .ports
        .get_mut(&port_id)
        .ok_or_else(|| StpError::InvalidArgument(format!("{name} is not a member of instance {}", index.0)))?;

    if !is_set(m.opcode) {
        pv.path_cost_overridden = false;
        pv.priority_overridden = false;
        pv.mark_all();
        return Ok(());
    }
    if m.path_cost > 0 {
        pv.path_cost = m.path_cost as u32;
        pv.path_cost_overridden = true;
    }
    if m.priority >= 0 {
        let quantum = ((m.priority.max(0) as u32) >> 4) as u8;
        pv.designated_port = PortIdentifier::new(quantum, port_id.0);
        pv.priority_overridden = true;
    }
    pv.mark_all();
    Ok(())
}

fn apply_port_config(global: &mut Global, iftable: &mut InterfaceTable, m: &PortConfigMsg) -> Result<()> {
    let name = cstr(&m.name);
    let port_id = iftable.get(&name).map(|r| r.port_id).ok_or_else(|| StpError::InvalidArgument(format!("unknown interface {name}")))?;
    let vlan_names: Vec<[u8; IF_NAME_MAX]> = Vec::new();
    let _ = vlan_names;

    if m.path_cost > 0 {
        if let Some(rec) = iftable.get_mut(&name) {
            rec.path_cost = m.path_cost as u32;
        }
    }
    if m.priority >= 0 {
        if let Some(rec) = iftable.get_mut(&name) {
            rec.priority = ((m.priority.max(0) as u32) >> 4) as u8;
        }
    }

    let bit = port_id.0 as usize;
    if !is_set(m.opcode) {
        let _ = global.enable_config_mask.clear(bit);
        let _ = global.root_protect_mask.clear(bit);
        let _ = global.protect_mask.clear(bit);
        let _ = global.protect_do_disable_mask.clear(bit);
        let _ = global.fastspan_config_mask.clear(bit);
        let _ = global.fastspan_mask.clear(bit);
        let _ = global.fastuplink_mask.clear(bit);
        return Ok(());
    }

    set_mask_bit(&mut global.enable_config_mask, bit, m.enabled);
    set_mask_bit(&mut global.root_protect_mask, bit, m.root_guard);
    set_mask_bit(&mut global.protect_mask, bit, m.bpdu_guard);
    set_mask_bit(&mut global.protect_do_disable_mask, bit, m.bpdu_guard_do_disable);
    set_mask_bit(&mut global.fastspan_config_mask, bit, m.portfast);
    if m.portfast {
        set_mask_bit(&mut global.fastspan_mask, bit, true);
    }
    set_mask_bit(&mut global.fastuplink_mask, bit, m.uplink_fast);

    for attr in &m.vlans {
        let index = inst_index_of(attr.inst_id, global)?;
        let Some(instance) = global.instance_mut(index) else {
            continue;
        };
        if !instance.ports.contains_key(&port_id) {
            stp::init_port(instance, port_id, 0, 0);
        }
        let _ = instance.control_mask.set(bit);
        if m.enabled {
            let _ = instance.enable_mask.set(bit);
        }
        if is_tagged(attr.mode) {
            let _ = instance.untag_mask.clear(bit);
        } else {
            let _ = instance.untag_mask.set(bit);
        }
        instance.refresh_lifecycle_state();
    }
    Ok(())
}

fn apply_vlan_mem_config(global: &mut Global, iftable: &InterfaceTable, m: &VlanMemConfigMsg) -> Result<()> {
    let name = cstr(&m.name);
    let port_id = iftable.get(&name).map(|r| r.port_id).ok_or_else(|| StpError::InvalidArgument(format!("unknown interface {name}")))?;
    let index = inst_index_of(m.inst_id, global)?;
    let bit = port_id.0 as usize;

    if !is_set(m.opcode) {
        let Some(instance) = global.instance_mut(index) else {
            return Err(StpError::StateConflict(format!("instance {} already absent", index.0)));
        };
        let _ = instance.control_mask.clear(bit);
        let _ = instance.enable_mask.clear(bit);
        let _ = instance.untag_mask.clear(bit);
        instance.ports.remove(&port_id);
        instance.refresh_lifecycle_state();
        return Ok(());
    }

    let Some(instance) = global.instance_mut(index) else {
        return Err(StpError::InvalidArgument(format!("instance {} not configured", index.0)));
    };
    if !instance.ports.contains_key(&port_id) {
        let priority = iftable.get(&name).map(|r| r.priority).unwrap_or(stp::defaults::DFLT_PORT_PRIORITY_QUANTUM);
        let path_cost = if m.path_cost > 0 { m.path_cost as u32 } else { iftable.get(&name).map(|r| r.path_cost).unwrap_or(0) };
        stp::init_port(instance, port_id, priority, path_cost);
    }
    let _ = instance.control_mask.set(bit);
    if m.enabled {
        let _ = instance.enable_mask.set(bit);
    } else {
        let _ = instance.enable_mask.clear(bit);
    }
    if is_tagged(m.mode) {
        let _ = instance.untag_mask.clear(bit);
    } else {
        let _ = instance.untag_mask.set(bit);
    }
    if m.path_cost > 0 {
        if let Some(pv) = instance.ports.get_mut(&port_id) {
            pv.path_cost = m.path_cost as u32;
            pv.path_cost_overridden = true;
        }
    }
    instance.refresh_lifecycle_state();
    Ok(())
}

fn set_mask_bit(mask: &mut crate::bitmap::PortMask, bit: usize, on: bool) {
    if on {
        let _ = mask.set(bit);
    } else {
        let _ = mask.clear(bit);
    }
}

/// STPCTL reply formatting (spec §4.9). Deliberately plain text, not a
/// polished CLI: the management client owns presentation, this just dumps
/// fields (SPEC_FULL §4.9).
pub mod stpctl_format {
    use super::*;
    use std::fmt::Write as _;

    pub fn format_reply(global: &Global, iftable: &InterfaceTable, msg: &StpCtlMsg) -> Result<String> {
        match msg.cmd_type {
            CtlType::Help => Ok(help_text()),
            CtlType::DumpGlobal => Ok(dump_global(global)),
            CtlType::DumpAll | CtlType::DumpVlanAll => Ok(dump_vlan_all(global)),
            CtlType::DumpVlan => dump_vlan(global, msg.vlan_id),
            CtlType::DumpIntf => dump_intf(global, iftable, &cstr(&msg.name)),
            CtlType::SetLogLvl | CtlType::SetDbg => Ok(format!("ok (level={}, flags=0x{:04x})\n", msg.level, msg.dbg_flags)),
            CtlType::DumpNlDb | CtlType::DumpNlDbIntf | CtlType::DumpLibevStats => {
                Ok("not available: owned by the netlink/event-loop binary, not the protocol core\n".to_string())
            }
            CtlType::ClearAll => Ok(clear_all(global)),
            CtlType::ClearVlan => clear_vlan(global, msg.vlan_id),
            CtlType::ClearIntf | CtlType::ClearVlanIntf => Ok("ok\n".to_string()),
        }
    }

    fn help_text() -> String {
        "stpctl commands: help dump-all dump-global dump-vlan-all dump-vlan dump-intf \
         set-log-level dump-nl-db dump-nl-db-intf dump-libev-stats set-dbg clear-all \
         clear-vlan clear-intf clear-vlan-intf\n"
            .to_string()
    }

    fn dump_global(global: &Global) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "max_instances       {}", global.max_instances);
        let _ = writeln!(out, "active_instances    {}", global.active_instances);
        let _ = writeln!(out, "proto_mode          {:?}", global.proto_mode);
        let _ = writeln!(out, "base_mac            {}", global.base_mac_address);
        let _ = writeln!(out, "extend_mode         {}", global.extend_mode);
        let _ = writeln!(out, "root_protect_timeout {}s", global.root_protect_timeout);
        let _ = writeln!(
            out,
            "drop_counters       stp={} tcn={} pvst={}",
            global.drop_counters.stp, global.drop_counters.tcn, global.drop_counters.pvst
        );
        out
    }

    fn dump_vlan_all(global: &Global) -> String {
        let mut out = String::new();
        for (idx, slot) in global.instances.iter().enumerate() {
            if let Some(instance) = slot {
                let _ = writeln!(out, "instance {idx} vlan {} state {:?} root {}", instance.vlan_id, instance.state, instance.bridge_info.root_id);
            }
        }
        if out.is_empty() {
            out.push_str("no instances configured\n");
        }
        out
    }

    fn dump_vlan(global: &Global, vlan_id_raw: i32) -> Result<String> {
        let vlan_id = vlan_id_of(vlan_id_raw)?;
        let Some(index) = global.find_instance_by_vlan(vlan_id) else {
            return Ok(format!("vlan {vlan_id} has no instance\n"));
        };
        let instance = global.instance(index).expect("index came from find_instance_by_vlan");
        let mut out = String::new();
        let _ = writeln!(out, "vlan {vlan_id} instance {}", index.0);
        let _ = writeln!(out, "  state             {:?}", instance.state);
        let _ = writeln!(out, "  bridge_id         {}", instance.bridge_info.bridge_id);
        let _ = writeln!(out, "  root_id           {}", instance.bridge_info.root_id);
        let _ = writeln!(out, "  root_path_cost    {}", instance.bridge_info.root_path_cost);
        let _ = writeln!(out, "  root_port         {:?}", instance.bridge_info.root_port);
        let _ = writeln!(out, "  topology_change   {}", instance.bridge_info.topology_change);
        for (port_id, pv) in &instance.ports {
            let _ = writeln!(out, "  port {} state={:?} cost={} fwd_trans={}", port_id.0, pv.state, pv.path_cost, pv.forward_transitions);
        }
        Ok(out)
    }

    fn dump_intf(global: &Global, iftable: &InterfaceTable, name: &str) -> Result<String> {
        let Some(rec) = iftable.get(name) else {
            return Ok(format!("no such interface {name}\n"));
        };
        let mut out = String::new();
        let _ = writeln!(out, "interface {name} port_id={} speed={:?} oper={:?}", rec.port_id.0, rec.speed, rec.oper_state);
        let bit = rec.port_id.0 as usize;
        let _ = writeln!(out, "  root_guard={} bpdu_guard={} portfast={} uplink_fast={}", global.root_protect_mask.test(bit), global.protect_mask.test(bit), global.fastspan_config_mask.test(bit), global.fastuplink_mask.test(bit));
        for (idx, slot) in global.instances.iter().enumerate() {
            if let Some(instance) = slot {
                if let Some(pv) = instance.ports.get(&rec.port_id) {
                    let _ = writeln!(out, "  instance {idx}: state={:?}", pv.state);
                }
            }
        }
        Ok(out)
    }

    fn clear_all(global: &Global) -> String {
        format!("cleared counters for {} instances\n", global.active_instances)
    }

    fn clear_vlan(global: &Global, vlan_id_raw: i32) -> Result<String> {
        let vlan_id = vlan_id_of(vlan_id_raw)?;
        if global.find_instance_by_vlan(vlan_id).is_none() {
            return Ok(format!("vlan {vlan_id} has no instance\n"));
        }
        Ok(format!("cleared counters for vlan {vlan_id}\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iftable::{InterfaceTable, LinkEvent, LinkSpeed, OperState};

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0, 0, 0, 0, 0, last])
    }

    fn ifname(s: &str) -> [u8; IF_NAME_MAX] {
        let mut out = [0u8; IF_NAME_MAX];
        out[..s.len()].copy_from_slice(s.as_bytes());
        out
    }

    fn build_datagram(msg_type: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        let mut hdr = [0u8; 8];
        LittleEndian::write_u32(&mut hdr[0..4], msg_type);
        LittleEndian::write_u32(&mut hdr[4..8], data.len() as u32);
        out.extend_from_slice(&hdr);
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_reject_missing_magic() {
        let bytes = vec![0u8; 20];
        let err = parse_datagram(&bytes).unwrap_err();
        assert!(matches!(err, StpError::InvalidArgument(_)));
    }

    #[test]
    fn test_reject_truncated_body() {
        let mut data = vec![0u8; 2];
        data[0] = 1; // opcode
        let bytes = build_datagram(1, &[0u8; 1]);
        let _ = data;
        let err = parse_datagram(&bytes).unwrap_err();
        assert!(matches!(err, StpError::InvalidArgument(_)));
    }

    #[test]
    fn test_decode_init_ready() {
        let mut data = vec![1u8];
        data.extend_from_slice(&16u16.to_le_bytes());
        let bytes = build_datagram(1, &data);
        let msg = parse_datagram(&bytes).unwrap();
        assert_eq!(
            msg,
            IpcMessage::InitReady(InitReadyMsg {
                opcode: 1,
                max_stp_instances: 16
            })
        );
    }

    #[test]
    fn test_decode_bridge_config() {
        let mut data = vec![1u8, 1u8];
        data.extend_from_slice(&30i32.to_le_bytes());
        data.extend_from_slice(&[0, 1, 2, 3, 4, 5]);
        let bytes = build_datagram(2, &data);
        let msg = parse_datagram(&bytes).unwrap();
        match msg {
            IpcMessage::BridgeConfig(m) => {
                assert_eq!(m.proto_mode, 1);
                assert_eq!(m.root_guard_timeout, 30);
                assert_eq!(m.base_mac, [0, 1, 2, 3, 4, 5]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_decode_vlan_config_with_ports() {
        let mut data = vec![1u8, 1u8];
        data.extend_from_slice(&10i32.to_le_bytes()); // vlanId
        data.extend_from_slice(&0i32.to_le_bytes()); // instId
        data.extend_from_slice(&15i32.to_le_bytes()); // forwardDelay
        data.extend_from_slice(&2i32.to_le_bytes()); // helloTime
        data.extend_from_slice(&20i32.to_le_bytes()); // maxAge
        data.extend_from_slice(&32768i32.to_le_bytes()); // priority
        data.extend_from_slice(&1i32.to_le_bytes()); // count
        data.extend_from_slice(&ifname("Ethernet0"));
        data.push(0); // mode=untagged
        data.push(1); // enabled
        let bytes = build_datagram(3, &data);
        let msg = parse_datagram(&bytes).unwrap();
        match msg {
            IpcMessage::VlanConfig(m) => {
                assert_eq!(m.vlan_id, 10);
                assert_eq!(m.ports.len(), 1);
                assert_eq!(m.ports[0].name_str(), "Ethernet0");
                assert!(m.ports[0].enabled);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_apply_vlan_config_creates_instance_and_enables_port() {
        let mut global = Global::new(4, 16, mac(1));
        let mut iftable = InterfaceTable::new(16);
        iftable
            .upsert(
                &LinkEvent {
                    name: "Ethernet0".to_string(),
                    kernel_index: 1,
                    mac: mac(2),
                    speed: LinkSpeed::Gb1,
                    oper_state: OperState::Up,
                    master_ifindex: None,
                    is_bond: false,
                    is_member: false,
                },
                true,
            )
            .unwrap();

        let msg = IpcMessage::VlanConfig(VlanConfigMsg {
            opcode: 1,
            new_instance: true,
            vlan_id: 10,
            inst_id: 0,
            forward_delay: 15,
            hello_time: 2,
            max_age: 20,
            priority: 32768,
            ports: vec![PortAttr { name: ifname("Ethernet0"), mode: 0, enabled: true }],
        });
        apply(&mut global, &mut iftable, &msg).unwrap();

        let instance = global.instance(InstanceIndex(0)).unwrap();
        assert_eq!(instance.state, crate::model::InstanceState::Active);
        let port_id = iftable.get("Ethernet0").unwrap().port_id;
        assert!(instance.port_enabled(port_id));
        assert!(instance.untag_mask.test(port_id.0 as usize));
    }

    #[test]
    fn test_apply_vlan_config_duplicate_new_instance_is_state_conflict() {
        let mut global = Global::new(4, 16, mac(1));
        let mut iftable = InterfaceTable::new(16);
        let msg = IpcMessage::VlanConfig(VlanConfigMsg {
            opcode: 1,
            new_instance: true,
            vlan_id: 10,
            inst_id: 0,
            forward_delay: 15,
            hello_time: 2,
            max_age: 20,
            priority: 32768,
            ports: vec![],
        });
        apply(&mut global, &mut iftable, &msg).unwrap();
        let err = apply(&mut global, &mut iftable, &msg).unwrap_err();
        assert!(matches!(err, StpError::StateConflict(_)));
    }

    #[test]
    fn test_apply_vlan_config_unknown_port_rejected_with_no_mutation() {
        let mut global = Global::new(4, 16, mac(1));
        let mut iftable = InterfaceTable::new(16);
        let msg = IpcMessage::VlanConfig(VlanConfigMsg {
            opcode: 1,
            new_instance: true,
            vlan_id: 10,
            inst_id: 0,
            forward_delay: 15,
            hello_time: 2,
            max_age: 20,
            priority: 32768,
            ports: vec![PortAttr { name: ifname("Ethernet99"), mode: 0, enabled: true }],
        });
        let err = apply(&mut global, &mut iftable, &msg).unwrap_err();
        assert!(matches!(err, StpError::InvalidArgument(_)));
        assert!(global.instance(InstanceIndex(0)).is_none(), "failed message must not partially apply");
    }

    #[test]
    fn test_apply_port_config_sets_protection_masks() {
        let mut global = Global::new(4, 16, mac(1));
        let mut iftable = InterfaceTable::new(16);
        iftable
            .upsert(
                &LinkEvent {
                    name: "Ethernet0".to_string(),
                    kernel_index: 1,
                    mac: mac(2),
                    speed: LinkSpeed::Gb1,
                    oper_state: OperState::Up,
                    master_ifindex: None,
                    is_bond: false,
                    is_member: false,
                },
                true,
            )
            .unwrap();
        let msg = IpcMessage::PortConfig(PortConfigMsg {
            opcode: 1,
            name: ifname("Ethernet0"),
            enabled: true,
            root_guard: true,
            bpdu_guard: true,
            bpdu_guard_do_disable: true,
            portfast: true,
            uplink_fast: false,
            path_cost: 0,
            priority: -1,
            vlans: vec![],
        });
        apply(&mut global, &mut iftable, &msg).unwrap();
        let port_id = iftable.get("Ethernet0").unwrap().port_id;
        let bit = port_id.0 as usize;
        assert!(global.root_protect_mask.test(bit));
        assert!(global.protect_mask.test(bit));
        assert!(global.protect_do_disable_mask.test(bit));
        assert!(global.fastspan_config_mask.test(bit));
        assert!(global.fastspan_mask.test(bit));
    }

    #[test]
    fn test_stpctl_dump_global_contains_counts() {
        let global = Global::new(4, 16, mac(1));
        let iftable = InterfaceTable::new(16);
        let msg = StpCtlMsg {
            cmd_type: CtlType::DumpGlobal,
            vlan_id: 0,
            name: [0; IF_NAME_MAX],
            level: 0,
            dbg_flags: 0,
        };
        let reply = stpctl_format::format_reply(&global, &iftable, &msg).unwrap();
        assert!(reply.contains("max_instances"));
    }

    #[test]
    fn test_stpctl_help_lists_commands() {
        let global = Global::new(4, 16, mac(1));
        let iftable = InterfaceTable::new(16);
        let msg = StpCtlMsg {
            cmd_type: CtlType::Help,
            vlan_id: 0,
            name: [0; IF_NAME_MAX],
            level: 0,
            dbg_flags: 0,
        };
        let reply = stpctl_format::format_reply(&global, &iftable, &msg).unwrap();
        assert!(reply.contains("dump-vlan"));
    }
}
