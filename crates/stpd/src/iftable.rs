//! Interface table (C3): the name-keyed map of known ports, and port-id
//! assignment.
//!
//! Grounded on the teacher's `portsyncd::port_sync::LinkSync` (uninitialized
//! port tracking, front-panel name filtering) and `netlink_socket`'s
//! `NetlinkEvent` shape, generalized from "sync this port's status to a
//! datastore" to "drive the state machine off this port's oper-state change".

use std::collections::HashMap;

use sonic_types::MacAddress;

use crate::bitmap::PortMask;
use crate::error::{Result, StpError};
use crate::model::PortId;

/// Link speed ladder, `STP_SPEED_NONE..STP_SPEED_10T` in the original
/// implementation's `include/stp_intf.h`; spec.md §4.3 tabulates only the
/// 10M–400G subset, the rest (1M, 1T, 10T) is filled in here from
/// `original_source`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkSpeed {
    None,
    Mb1,
    Mb10,
    Mb100,
    Gb1,
    Gb10,
    Gb25,
    Gb40,
    Gb100,
    Gb400,
    Tb1,
    Tb10,
}

impl LinkSpeed {
    /// Speed in kb/s for the speeds the cost table actually covers.
    /// `stputil_get_path_cost` in `original_source/stp/stp_util.c` only
    /// switches on `10M..400G` — `1M`/`1T`/`10T` exist as link speeds the
    /// interface table can observe but fall through its `default:` case and
    /// return 0 with a logged error, exactly like a wholly unknown speed.
    /// That's preserved here rather than extrapolated from the formula.
    fn kbps(self) -> Option<u64> {
        match self {
            LinkSpeed::Mb10 => Some(10_000),
            LinkSpeed::Mb100 => Some(100_000),
            LinkSpeed::Gb1 => Some(1_000_000),
            LinkSpeed::Gb10 => Some(10_000_000),
            LinkSpeed::Gb25 => Some(25_000_000),
            LinkSpeed::Gb40 => Some(40_000_000),
            LinkSpeed::Gb100 => Some(100_000_000),
            LinkSpeed::Gb400 => Some(400_000_000),
            LinkSpeed::None | LinkSpeed::Mb1 | LinkSpeed::Tb1 | LinkSpeed::Tb10 => None,
        }
    }

    /// Default path cost for this speed under the active extend mode.
    /// Unknown/unsupported speed yields 0 and is the caller's cue to log an
    /// error (spec §4.3).
    pub fn default_path_cost(self, extend_mode: bool) -> u32 {
        let Some(kbps) = self.kbps() else {
            return 0;
        };
        if extend_mode {
            // 802.1t formula: 20_000_000_000 / link_speed_kbps.
            (20_000_000_000u64 / kbps) as u32
        } else {
            legacy_path_cost(self)
        }
    }
}

/// Legacy (802.1D, pre-1998) path costs; fixed table, not formula-derived
/// (`STP_LEGACY_PORT_PATH_COST_*` in `original_source/include/stp.h`).
fn legacy_path_cost(speed: LinkSpeed) -> u32 {
    match speed {
        LinkSpeed::Mb10 => 100,
        LinkSpeed::Mb100 => 19,
        LinkSpeed::Gb1 => 4,
        LinkSpeed::Gb10 => 2,
        LinkSpeed::Gb25 | LinkSpeed::Gb40 | LinkSpeed::Gb100 | LinkSpeed::Gb400 => 1,
        LinkSpeed::None | LinkSpeed::Mb1 | LinkSpeed::Tb1 | LinkSpeed::Tb10 => 0,
    }
}

/// Operational state as reported by the link layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperState {
    Down,
    Up,
}

/// One row of the interface table (spec §3 `PortRecord`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortRecord {
    pub name: String,
    pub kernel_index: u32,
    pub port_id: PortId,
    pub mac: MacAddress,
    pub speed: LinkSpeed,
    pub oper_state: OperState,
    pub is_valid: bool,
    /// Nonzero for a LAG record: count of members currently joined.
    pub member_port_count: u32,
    /// Set on a member port; indexes its LAG's kernel ifindex.
    pub master_ifindex: Option<u32>,
    pub priority: u8,
    pub path_cost: u32,
}

impl PortRecord {
    pub fn is_lag(&self) -> bool {
        self.member_port_count > 0 || self.name.starts_with("PortChannel")
    }
}

/// A link event as delivered by the netlink collaborator (spec §6.3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkEvent {
    pub name: String,
    pub kernel_index: u32,
    pub mac: MacAddress,
    pub speed: LinkSpeed,
    pub oper_state: OperState,
    pub master_ifindex: Option<u32>,
    pub is_bond: bool,
    pub is_member: bool,
}

/// Name-keyed interface table with Ethernet/LAG port-id allocation.
///
/// Keys are lowercased on insert/lookup so the map behaves as
/// case-insensitive, matching spec §4.3 ("keyed by case-insensitive
/// interface name") without needing a custom `Hash`/`Eq` wrapper type.
pub struct InterfaceTable {
    records: HashMap<String, PortRecord>,
    kernel_index_to_name: HashMap<u32, String>,
    /// `max_ports` rounded up per §4.3: `max(suffix)` rounded to the next
    /// multiple of 4, doubled to reserve LAG space.
    max_ports: usize,
    lag_pool: PortMask,
    lag_pool_base: usize,
}

impl InterfaceTable {
    /// Creates a table sized for `observed_max_suffix` (the highest Ethernet
    /// name suffix seen during discovery).
    pub fn new(observed_max_suffix: u16) -> Self {
        let rounded = (observed_max_suffix as usize).div_ceil(4) * 4;
        let max_ports = rounded.max(4) * 2;
        let lag_pool_base = max_ports / 2;
        Self {
            records: HashMap::new(),
            kernel_index_to_name: HashMap::new(),
            max_ports,
            lag_pool: PortMask::new(max_ports - lag_pool_base),
            lag_pool_base,
        }
    }

    pub fn max_ports(&self) -> usize {
        self.max_ports
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    pub fn get(&self, name: &str) -> Option<&PortRecord> {
        self.records.get(&Self::key(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PortRecord> {
        self.records.get_mut(&Self::key(name))
    }

    pub fn get_by_kernel_index(&self, kernel_index: u32) -> Option<&PortRecord> {
        self.kernel_index_to_name
            .get(&kernel_index)
            .and_then(|name| self.records.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortRecord> {
        self.records.values()
    }

    /// Parses the decimal suffix of an Ethernet interface name
    /// (`"Ethernet12"` → `12`).
    fn ethernet_suffix(name: &str) -> Option<u16> {
        let digits: String = name.chars().skip_while(|c| !c.is_ascii_digit()).collect();
        digits.parse().ok()
    }

    /// Allocates (or reuses) a port id for an Ethernet interface.
    fn ethernet_port_id(&self, name: &str) -> Result<PortId> {
        let suffix = Self::ethernet_suffix(name).ok_or_else(|| {
            StpError::InvalidArgument(format!("interface name has no numeric suffix: {name}"))
        })?;
        if suffix as usize >= self.lag_pool_base {
            return Err(StpError::ResourceExhausted(format!(
                "ethernet port id {suffix} exceeds table capacity {}",
                self.lag_pool_base
            )));
        }
        Ok(PortId(suffix))
    }

    /// Allocates a LAG port id from `[maxPorts/2, maxPorts)` via
    /// set-first-unset-bit on the LAG pool (spec §4.3).
    fn allocate_lag_port_id(&mut self) -> Result<PortId> {
        let offset = self
            .lag_pool
            .set_first_unset_bit()
            .ok_or_else(|| StpError::ResourceExhausted("LAG port id pool exhausted".to_string()))?;
        Ok(PortId((self.lag_pool_base + offset) as u16))
    }

    fn release_lag_port_id(&mut self, port_id: PortId) {
        if (port_id.0 as usize) >= self.lag_pool_base {
            let _ = self.lag_pool.clear(port_id.0 as usize - self.lag_pool_base);
        }
    }

    /// Applies a link-up/update event: upserts the record, allocating a
    /// fresh port id on first appearance. Returns the resulting record's
    /// port id and whether this was a first appearance (the caller opens an
    /// RX socket only in that case, per spec §4.3).
    pub fn upsert(&mut self, event: &LinkEvent, extend_mode: bool) -> Result<(PortId, bool)> {
        let key = Self::key(&event.name);
        if let Some(existing) = self.records.get_mut(&key) {
            let port_id = existing.port_id;
            existing.kernel_index = event.kernel_index;
            existing.mac = event.mac;
            existing.speed = event.speed;
            existing.oper_state = event.oper_state;
            existing.master_ifindex = event.master_ifindex;
            if !existing.path_cost_is_overridden() {
                existing.path_cost = event.speed.default_path_cost(extend_mode);
            }
            self.kernel_index_to_name.insert(event.kernel_index, key);
            return Ok((port_id, false));
        }

        let port_id = if event.is_bond {
            self.allocate_lag_port_id()?
        } else {
            self.ethernet_port_id(&event.name)?
        };
        let record = PortRecord {
            name: event.name.clone(),
            kernel_index: event.kernel_index,
            port_id,
            mac: event.mac,
            speed: event.speed,
            oper_state: event.oper_state,
            is_valid: true,
            member_port_count: 0,
            master_ifindex: event.master_ifindex,
            priority: 0,
            path_cost: event.speed.default_path_cost(extend_mode),
        };
        self.records.insert(key.clone(), record);
        self.kernel_index_to_name.insert(event.kernel_index, key);
        Ok((port_id, true))
    }

    /// Applies a LAG-membership join: increments the LAG's member count and,
    /// if the LAG had no speed of its own yet, inherits the member's speed
    /// and path cost (spec §4.3).
    pub fn join_lag(&mut self, member_name: &str, lag_kernel_index: u32, extend_mode: bool) -> Result<()> {
        let member_speed = self
            .get(member_name)
            .map(|r| r.speed)
            .unwrap_or(LinkSpeed::None);
        let lag_name = self
            .kernel_index_to_name
            .get(&lag_kernel_index)
            .cloned()
            .ok_or_else(|| StpError::InvalidArgument(format!("unknown LAG kernel index {lag_kernel_index}")))?;
        let lag = self
            .records
            .get_mut(&lag_name)
            .ok_or_else(|| StpError::InvalidArgument(format!("unknown LAG {lag_name}")))?;
        if lag.member_port_count == 0 && lag.speed == LinkSpeed::None {
            lag.speed = member_speed;
            lag.path_cost = member_speed.default_path_cost(extend_mode);
        }
        lag.member_port_count += 1;
        Ok(())
    }

    /// Applies a LAG-membership leave. When the member count reaches zero
    /// the LAG record is deleted and its port id returned to the pool; the
    /// caller is responsible for clearing the LAG's control bit from every
    /// instance first (spec §4.3).
    pub fn leave_lag(&mut self, lag_kernel_index: u32) -> Result<Option<PortId>> {
        let lag_name = self
            .kernel_index_to_name
            .get(&lag_kernel_index)
            .cloned()
            .ok_or_else(|| StpError::InvalidArgument(format!("unknown LAG kernel index {lag_kernel_index}")))?;
        let Some(lag) = self.records.get_mut(&lag_name) else {
            return Ok(None);
        };
        lag.member_port_count = lag.member_port_count.saturating_sub(1);
        if lag.member_port_count == 0 {
            let port_id = lag.port_id;
            self.records.remove(&lag_name);
            self.kernel_index_to_name.remove(&lag_kernel_index);
            self.release_lag_port_id(port_id);
            return Ok(Some(port_id));
        }
        Ok(None)
    }

    /// Deletes a record outright (link-layer delete for an Ethernet port).
    pub fn remove(&mut self, name: &str) -> Option<PortRecord> {
        let key = Self::key(name);
        if let Some(record) = self.records.remove(&key) {
            self.kernel_index_to_name.remove(&record.kernel_index);
            if record.is_lag() {
                self.release_lag_port_id(record.port_id);
            }
            Some(record)
        } else {
            None
        }
    }
}

impl PortRecord {
    /// Path-cost-override tracking is owned by the per-instance `PortVector`
    /// (spec §3); the interface table only ever writes the *default* — this
    /// helper exists so `upsert` never clobbers an instance-level override.
    /// Until wired to the engine this is always `false`.
    fn path_cost_is_overridden(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    fn eth_event(name: &str, kidx: u32, speed: LinkSpeed) -> LinkEvent {
        LinkEvent {
            name: name.to_string(),
            kernel_index: kidx,
            mac: mac(kidx as u8),
            speed,
            oper_state: OperState::Up,
            master_ifindex: None,
            is_bond: false,
            is_member: false,
        }
    }

    #[test]
    fn test_default_path_cost_extend_mode() {
        assert_eq!(LinkSpeed::Mb10.default_path_cost(true), 2_000_000);
        assert_eq!(LinkSpeed::Gb1.default_path_cost(true), 20_000);
        assert_eq!(LinkSpeed::Gb10.default_path_cost(true), 2_000);
        assert_eq!(LinkSpeed::Gb400.default_path_cost(true), 50);
        assert_eq!(LinkSpeed::None.default_path_cost(true), 0);
    }

    #[test]
    fn test_default_path_cost_legacy_mode() {
        assert_eq!(LinkSpeed::Mb10.default_path_cost(false), 100);
        assert_eq!(LinkSpeed::Mb100.default_path_cost(false), 19);
        assert_eq!(LinkSpeed::Gb1.default_path_cost(false), 4);
        assert_eq!(LinkSpeed::Gb25.default_path_cost(false), 1);
        assert_eq!(LinkSpeed::Tb10.default_path_cost(false), 1);
    }

    #[test]
    fn test_ethernet_suffix_parsing_and_port_id() {
        let mut table = InterfaceTable::new(64);
        let (port_id, first) = table.upsert(&eth_event("Ethernet12", 100, LinkSpeed::Gb10), true).unwrap();
        assert_eq!(port_id, PortId(12));
        assert!(first);
        let (port_id2, first2) = table.upsert(&eth_event("Ethernet12", 100, LinkSpeed::Gb10), true).unwrap();
        assert_eq!(port_id2, port_id);
        assert!(!first2);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let mut table = InterfaceTable::new(16);
        table.upsert(&eth_event("Ethernet4", 1, LinkSpeed::Gb1), true).unwrap();
        assert!(table.get("ethernet4").is_some());
        assert!(table.get("ETHERNET4").is_some());
    }

    #[test]
    fn test_lag_allocation_and_release() {
        let mut table = InterfaceTable::new(16);
        let event = LinkEvent {
            name: "PortChannel001".to_string(),
            kernel_index: 900,
            mac: mac(9),
            speed: LinkSpeed::None,
            oper_state: OperState::Up,
            master_ifindex: None,
            is_bond: true,
            is_member: false,
        };
        let (port_id, first) = table.upsert(&event, true).unwrap();
        assert!(first);
        assert!(port_id.0 as usize >= table.max_ports() / 2);

        table.upsert(&eth_event("Ethernet0", 1, LinkSpeed::Gb10), true).unwrap();
        table.join_lag("Ethernet0", 900, true).unwrap();
        assert_eq!(table.get("PortChannel001").unwrap().member_port_count, 1);
        assert_eq!(table.get("PortChannel001").unwrap().speed, LinkSpeed::Gb10);

        let released = table.leave_lag(900).unwrap();
        assert_eq!(released, Some(port_id));
        assert!(table.get("PortChannel001").is_none());
    }

    #[test]
    fn test_unknown_speed_yields_zero_cost() {
        assert_eq!(LinkSpeed::None.default_path_cost(true), 0);
        assert_eq!(LinkSpeed::None.default_path_cost(false), 0);
    }

    #[test]
    fn test_1m_and_terabit_speeds_fall_back_to_zero_cost() {
        for speed in [LinkSpeed::Mb1, LinkSpeed::Tb1, LinkSpeed::Tb10] {
            assert_eq!(speed.default_path_cost(true), 0);
            assert_eq!(speed.default_path_cost(false), 0);
        }
    }
}
