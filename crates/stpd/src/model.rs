//! Per-instance and global data model (C5, §3).
//!
//! Two redesigns from the upstream C layout are deliberate (spec §9): the
//! `BadPortId`/`InvalidInstance` sentinels become `Option<PortId>` /
//! `Option<InstanceIndex>`, and the raw `modifiedFields` bitmask becomes a
//! small `DirtySet` keyed by a per-struct field enum so the field-to-bit
//! mapping can't drift out of sync with the struct it describes.

use std::collections::BTreeMap;

use sonic_types::{MacAddress, VlanId};

use crate::bitmap::PortMask;
use crate::timer::Timer;

/// Opaque 16-bit port identifier. The `BadPortId` sentinel from the original
/// design is represented as `Option<PortId>` everywhere a port reference may
/// be absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u16);

/// Dense index into the instance array, `0..MaxInstances`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceIndex(pub u16);

/// Quantum of the 4-bit bridge/port priority field: legal priorities are
/// multiples of this value.
pub const BRIDGE_PRIORITY_QUANTUM: u16 = 4096;
pub const PORT_PRIORITY_QUANTUM: u8 = 16;

/// (priority, systemId, mac) triple with the total ordering from spec §3.
///
/// The composite 16-bit priority field depends on `extendMode`, which is
/// bridge-global state external to this type, so ordering is exposed as
/// [`BridgeIdentifier::cmp_in_mode`] rather than `impl Ord`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeIdentifier {
    /// 4-bit priority quantum, 0..=15 (real priority = quantum * 4096).
    pub priority: u8,
    /// 12-bit system id; holds the VLAN id in extend mode, 0 in legacy mode.
    pub system_id: u16,
    pub mac: MacAddress,
}

impl BridgeIdentifier {
    pub fn new(priority: u8, system_id: u16, mac: MacAddress) -> Self {
        Self {
            priority: priority & 0x0F,
            system_id: system_id & 0x0FFF,
            mac,
        }
    }

    /// The composite 16-bit priority field used as the primary sort key.
    pub fn composite_priority(&self, extend_mode: bool) -> u16 {
        let base = (self.priority as u16) << 12;
        if extend_mode {
            base
        } else {
            base | self.system_id
        }
    }

    /// Total order: composite priority field, then MAC as a 48-bit integer.
    ///
    /// `MacAddress` has no `Ord` impl of its own (it's a display/parse type,
    /// not an ordering key elsewhere in the stack), so the 48-bit big-endian
    /// integer comparison is done directly over its bytes here.
    pub fn cmp_in_mode(&self, other: &Self, extend_mode: bool) -> std::cmp::Ordering {
        self.composite_priority(extend_mode)
            .cmp(&other.composite_priority(extend_mode))
            .then_with(|| self.mac.as_bytes().cmp(other.mac.as_bytes()))
    }

    /// True if `self` is strictly better (lower) than `other` under the
    /// bridge-identifier ordering — "better" meaning more likely to be root.
    pub fn is_better_than(&self, other: &Self, extend_mode: bool) -> bool {
        self.cmp_in_mode(other, extend_mode) == std::cmp::Ordering::Less
    }
}

/// (priority, number) pair, compared as a 16-bit integer with priority as
/// the high nibble. Unlike `BridgeIdentifier` this ordering has no external
/// dependency, so a full `Ord` impl is appropriate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortIdentifier {
    pub priority: u8,
    pub number: u16,
}

impl PortIdentifier {
    pub fn new(priority: u8, number: u16) -> Self {
        Self {
            priority: priority & 0x0F,
            number: number & 0x0FFF,
        }
    }

    pub fn as_u16(&self) -> u16 {
        ((self.priority as u16) << 12) | self.number
    }
}

/// Forwarding states a port moves through. Ordered so that
/// `state >= Learning` matches the invariant checks in §8.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortState {
    Disabled,
    Blocking,
    Listening,
    Learning,
    Forwarding,
}

/// Kernel-visible forwarding state published via the downstream sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelState {
    Forward,
    Blocking,
}

impl From<PortState> for KernelState {
    fn from(state: PortState) -> Self {
        match state {
            PortState::Forwarding => KernelState::Forward,
            _ => KernelState::Blocking,
        }
    }
}

/// Lifecycle state of a per-VLAN instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Free,
    Config,
    Active,
}

/// Whether the daemon additionally speaks PVST+ tagged frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProtoMode {
    #[default]
    None,
    Pvst,
}

/// A small bitset staging observable field changes for the downstream
/// publisher. Cleared exactly on successful publish (§3 invariant).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirtySet(u32);

impl DirtySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn mark(&mut self, bit: impl Into<u32>) {
        self.0 |= 1 << bit.into();
    }

    pub fn is_dirty(&self, bit: impl Into<u32>) -> bool {
        self.0 & (1 << bit.into()) != 0
    }

    /// True if any field is dirty — the predicate the sync pass (C10) tests
    /// to decide whether an instance/port needs a publish this tick.
    pub fn any(&self) -> bool {
        self.0 != 0
    }

    /// Clears all dirty bits. Only the sync pass may call this, and only
    /// after a successful publish.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Marks every field up to `count` dirty — used on instance/port
    /// initialization so the first sync publishes full state.
    pub fn mark_all(&mut self, count: u32) {
        self.0 = if count >= 32 { u32::MAX } else { (1u32 << count) - 1 };
    }
}

/// Fields of [`BridgeInfo`] tracked by its `dirty` set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BridgeInfoField {
    RootId = 0,
    RootPathCost,
    RootPort,
    MaxAge,
    HelloTime,
    ForwardDelay,
    BridgeMaxAge,
    BridgeHelloTime,
    BridgeForwardDelay,
    BridgeId,
    TopologyChangeCount,
    TopologyChangeTick,
    HoldTime,
    TopologyChangeDetected,
    TopologyChange,
    TopologyChangeTime,
}
impl From<BridgeInfoField> for u32 {
    fn from(f: BridgeInfoField) -> u32 {
        f as u32
    }
}
/// Count of variants, for `DirtySet::mark_all`.
pub const BRIDGE_INFO_FIELD_COUNT: u32 = 16;

/// One bridge instance's root-election state (spec §3 `BridgeInfo`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeInfo {
    pub root_id: BridgeIdentifier,
    pub root_path_cost: u32,
    pub root_port: Option<PortId>,
    pub max_age: u16,
    pub hello_time: u16,
    pub forward_delay: u16,
    pub bridge_max_age: u16,
    pub bridge_hello_time: u16,
    pub bridge_forward_delay: u16,
    pub bridge_id: BridgeIdentifier,
    pub topology_change_count: u32,
    pub topology_change_tick: u32,
    /// 6-bit hold-time value in seconds.
    pub hold_time: u8,
    pub topology_change_detected: bool,
    pub topology_change: bool,
    pub topology_change_time: u32,
    pub dirty: DirtySet,
}

impl BridgeInfo {
    pub fn mark(&mut self, field: BridgeInfoField) {
        self.dirty.mark(field);
    }

    pub fn mark_all(&mut self) {
        self.dirty.mark_all(BRIDGE_INFO_FIELD_COUNT);
    }

    /// True iff this bridge considers itself the root (§3 invariant: root
    /// port is absent exactly when `rootId == bridgeId`).
    pub fn is_root(&self, extend_mode: bool) -> bool {
        self.root_id.cmp_in_mode(&self.bridge_id, extend_mode) == std::cmp::Ordering::Equal
    }
}

/// Fields of [`PortVector`] tracked by its `dirty` set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PortVectorField {
    State = 0,
    PathCost,
    DesignatedRoot,
    DesignatedCost,
    DesignatedBridge,
    DesignatedPort,
    ForwardTransitions,
    RxConfigBpdu,
    TxConfigBpdu,
    RxTcnBpdu,
    TxTcnBpdu,
    RxDelayedBpdu,
    RxDropBpdu,
    TopologyChangeAcknowledge,
    RootProtectTimer,
    KernelState,
    PriorityOverridden,
    PathCostOverridden,
}
impl From<PortVectorField> for u32 {
    fn from(f: PortVectorField) -> u32 {
        f as u32
    }
}
pub const PORT_VECTOR_FIELD_COUNT: u32 = 18;

/// One port's per-instance state vector (spec §3 `PortVector`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortVector {
    pub port_id: PortId,
    pub state: PortState,
    pub path_cost: u32,
    pub designated_root: BridgeIdentifier,
    pub designated_cost: u32,
    pub designated_bridge: BridgeIdentifier,
    pub designated_port: PortIdentifier,
    pub message_age_timer: Timer,
    pub forward_delay_timer: Timer,
    pub hold_timer: Timer,
    pub root_protect_timer: Timer,
    pub forward_transitions: u32,
    pub rx_config_bpdu: u64,
    pub tx_config_bpdu: u64,
    pub rx_tcn_bpdu: u64,
    pub tx_tcn_bpdu: u64,
    pub rx_delayed_bpdu: u64,
    pub rx_drop_bpdu: u64,
    pub topology_change_acknowledge: bool,
    pub config_pending: bool,
    pub change_detection_enabled: bool,
    pub self_loop: bool,
    pub auto_config: bool,
    pub oper_edge: bool,
    pub kernel_state: KernelState,
    pub priority_overridden: bool,
    pub path_cost_overridden: bool,
    /// Cached `maxAge`/`helloTime`/`forwardDelay` from the last BPDU that
    /// superseded this port's stored info. Not part of spec §3's field list
    /// and not downstream-published — §4.6.4 requires "copy the root's
    /// maxAge/helloTime/forwardDelay" whenever configuration update selects
    /// a non-local root port, but those timer parameters have nowhere else
    /// to live between "received on port P" and "root port recomputed to be
    /// P" (see DESIGN.md, Open Question Decisions).
    pub root_max_age: u16,
    pub root_hello_time: u16,
    pub root_forward_delay: u16,
    pub dirty: DirtySet,
}

impl PortVector {
    pub fn new(port_id: PortId, designated_port: PortIdentifier, path_cost: u32) -> Self {
        Self {
            port_id,
            state: PortState::Blocking,
            path_cost,
            designated_root: BridgeIdentifier::new(0, 0, MacAddress::ZERO),
            designated_cost: 0,
            designated_bridge: BridgeIdentifier::new(0, 0, MacAddress::ZERO),
            designated_port,
            message_age_timer: Timer::new(),
            forward_delay_timer: Timer::new(),
            hold_timer: Timer::new(),
            root_protect_timer: Timer::new(),
            forward_transitions: 0,
            rx_config_bpdu: 0,
            tx_config_bpdu: 0,
            rx_tcn_bpdu: 0,
            tx_tcn_bpdu: 0,
            rx_delayed_bpdu: 0,
            rx_drop_bpdu: 0,
            topology_change_acknowledge: false,
            config_pending: false,
            change_detection_enabled: true,
            self_loop: false,
            auto_config: true,
            oper_edge: false,
            kernel_state: KernelState::Blocking,
            priority_overridden: false,
            path_cost_overridden: false,
            root_max_age: 20,
            root_hello_time: 2,
            root_forward_delay: 15,
            dirty: DirtySet::empty(),
        }
    }

    pub fn mark(&mut self, field: PortVectorField) {
        self.dirty.mark(field);
    }

    pub fn mark_all(&mut self) {
        self.dirty.mark_all(PORT_VECTOR_FIELD_COUNT);
    }

    /// Sets forwarding state and keeps `kernelState`/dirty bits in lock-step;
    /// every caller that changes `state` should go through here rather than
    /// assigning the field directly.
    pub fn set_state(&mut self, state: PortState) {
        if self.state != state {
            self.state = state;
            self.kernel_state = KernelState::from(state);
            self.mark(PortVectorField::State);
            self.mark(PortVectorField::KernelState);
            if state == PortState::Forwarding {
                self.forward_transitions += 1;
                self.mark(PortVectorField::ForwardTransitions);
            }
        }
    }

    /// Runs "become designated port" (§4.6.2) against the instance's
    /// current root identity/cost/bridge-id.
    pub fn become_designated(
        &mut self,
        root_id: BridgeIdentifier,
        root_path_cost: u32,
        bridge_id: BridgeIdentifier,
    ) {
        self.designated_root = root_id;
        self.designated_cost = root_path_cost;
        self.designated_bridge = bridge_id;
        self.designated_port = PortIdentifier::new(self.designated_port.priority, self.port_id.0);
        self.mark(PortVectorField::DesignatedRoot);
        self.mark(PortVectorField::DesignatedCost);
        self.mark(PortVectorField::DesignatedBridge);
        self.mark(PortVectorField::DesignatedPort);
    }
}

/// Fields of [`Instance`] tracked by its `dirty` set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum InstanceField {
    State = 0,
    FastAging,
    EnableMask,
    ControlMask,
    UntagMask,
    RxDropBpdu,
}
impl From<InstanceField> for u32 {
    fn from(f: InstanceField) -> u32 {
        f as u32
    }
}
pub const INSTANCE_FIELD_COUNT: u32 = 6;

/// One STP instance, one per VLAN enabled for the protocol (spec §3
/// `Instance`). Port vectors are keyed by `PortId` in a `BTreeMap` so
/// iteration is in ascending port order, matching the §4.6.11 ordering rule
/// without a separate sort step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub vlan_id: VlanId,
    pub state: InstanceState,
    pub fast_aging: bool,
    pub bridge_info: BridgeInfo,
    pub enable_mask: PortMask,
    pub control_mask: PortMask,
    pub untag_mask: PortMask,
    /// Ports whose link is physically down, set by [`crate::stp::port_event`]
    /// and excluded from root/designated-port eligibility independently of
    /// `enable_mask` (admin intent) — a down port stays out of the topology
    /// without the operator's own enable bit being touched.
    pub oper_down_mask: PortMask,
    pub hello_timer: Timer,
    pub tcn_timer: Timer,
    pub topology_change_timer: Timer,
    pub last_expiry_time: u32,
    pub last_bpdu_rx_time: u32,
    pub rx_drop_bpdu: u64,
    pub dirty: DirtySet,
    pub ports: BTreeMap<PortId, PortVector>,
}

impl Instance {
    pub fn mark(&mut self, field: InstanceField) {
        self.dirty.mark(field);
    }

    pub fn mark_all(&mut self) {
        self.dirty.mark_all(INSTANCE_FIELD_COUNT);
    }

    /// Recomputes `state` from `enableMask` per the §3 lifecycle rule:
    /// Active iff at least one port is enabled, Config otherwise.
    pub fn refresh_lifecycle_state(&mut self) {
        let next = if self.enable_mask.first_set_bit().is_some() {
            InstanceState::Active
        } else {
            InstanceState::Config
        };
        if self.state != next {
            self.state = next;
            self.mark(InstanceField::State);
        }
    }

    /// True if the given port is enabled on this instance — the predicate
    /// behind the `enableMask ⊆ controlMask` invariant and §8 property 1.
    pub fn port_enabled(&self, port: PortId) -> bool {
        self.enable_mask.test(port.0 as usize)
    }

    /// True if `port` is both admin-enabled and not known to be physically
    /// down — the eligibility predicate `configuration_update` and
    /// `port_state_selection` filter on.
    pub fn port_eligible(&self, port: PortId) -> bool {
        self.enable_mask.test(port.0 as usize) && !self.oper_down_mask.test(port.0 as usize)
    }
}

/// Per-protocol drop counters (spec §3 `Global`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DropCounters {
    pub stp: u64,
    pub tcn: u64,
    pub pvst: u64,
}

/// The four preformed BPDU templates global state caches so the hot tx path
/// doesn't rebuild static header bytes every hello.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BpduTemplates {
    pub stp_config: Vec<u8>,
    pub stp_tcn: Vec<u8>,
    pub pvst_config: Vec<u8>,
    pub pvst_tcn: Vec<u8>,
}

/// Process-wide state (spec §3 `Global`). Per §9's redesign note this is an
/// explicit context handle owned by the binary, never a hidden singleton;
/// only the event-loop thread ever touches it, so no interior mutability is
/// needed.
#[derive(Debug)]
pub struct Global {
    pub max_instances: u16,
    pub active_instances: u16,
    /// Dense instance array indexed by `InstanceIndex`; `None` is a free
    /// slot, replacing the `STP_CLASS_STATE::FREE` sentinel.
    pub instances: Vec<Option<Instance>>,
    pub enable_mask: PortMask,
    pub enable_config_mask: PortMask,
    pub fastspan_mask: PortMask,
    pub fastspan_config_mask: PortMask,
    pub fastuplink_mask: PortMask,
    pub protect_mask: PortMask,
    pub protect_do_disable_mask: PortMask,
    pub protect_disabled_mask: PortMask,
    pub root_protect_mask: PortMask,
    /// Seconds; global rather than per-port per spec §9(c).
    pub root_protect_timeout: u32,
    pub proto_mode: ProtoMode,
    pub base_mac_address: MacAddress,
    /// Selects 802.1t path costs / extended bridge-id encoding.
    pub extend_mode: bool,
    pub templates: BpduTemplates,
    pub drop_counters: DropCounters,
}

impl Global {
    pub fn new(max_instances: u16, max_ports: usize, base_mac_address: MacAddress) -> Self {
        let mut instances = Vec::with_capacity(max_instances as usize);
        instances.resize_with(max_instances as usize, || None);
        Self {
            max_instances,
            active_instances: 0,
            instances,
            enable_mask: PortMask::new(max_ports),
            enable_config_mask: PortMask::new(max_ports),
            fastspan_mask: PortMask::new(max_ports),
            fastspan_config_mask: PortMask::new(max_ports),
            fastuplink_mask: PortMask::new(max_ports),
            protect_mask: PortMask::new(max_ports),
            protect_do_disable_mask: PortMask::new(max_ports),
            protect_disabled_mask: PortMask::new(max_ports),
            root_protect_mask: PortMask::new(max_ports),
            root_protect_timeout: 30,
            proto_mode: ProtoMode::None,
            base_mac_address,
            extend_mode: true,
            templates: BpduTemplates::default(),
            drop_counters: DropCounters::default(),
        }
    }

    pub fn instance(&self, index: InstanceIndex) -> Option<&Instance> {
        self.instances.get(index.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn instance_mut(&mut self, index: InstanceIndex) -> Option<&mut Instance> {
        self.instances
            .get_mut(index.0 as usize)
            .and_then(|s| s.as_mut())
    }

    /// Finds the instance index carrying `vlan_id`, if any — the invariant
    /// "exactly one instance per VLAN id" is maintained by `create_instance`
    /// rejecting duplicates, so a linear scan is sufficient here.
    pub fn find_instance_by_vlan(&self, vlan_id: VlanId) -> Option<InstanceIndex> {
        self.instances.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|inst| inst.vlan_id == vlan_id)
                .map(|_| InstanceIndex(i as u16))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    #[test]
    fn test_bridge_identifier_priority_dominates_mac() {
        let lower_prio_higher_mac = BridgeIdentifier::new(4, 0, mac(0xff));
        let higher_prio_lower_mac = BridgeIdentifier::new(8, 0, mac(0x01));
        assert!(lower_prio_higher_mac.is_better_than(&higher_prio_lower_mac, true));
    }

    #[test]
    fn test_bridge_identifier_mac_tiebreak() {
        let a = BridgeIdentifier::new(8, 0, mac(0x55));
        let b = BridgeIdentifier::new(8, 0, mac(0x66));
        assert!(a.is_better_than(&b, true));
        assert!(!b.is_better_than(&a, true));
    }

    #[test]
    fn test_port_identifier_ordering() {
        let a = PortIdentifier::new(0, 1);
        let b = PortIdentifier::new(0, 2);
        let c = PortIdentifier::new(1, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.as_u16(), 0x1000);
    }

    #[test]
    fn test_port_state_ordering_for_invariant_checks() {
        assert!(PortState::Forwarding > PortState::Learning);
        assert!(PortState::Learning > PortState::Listening);
        assert!(PortState::Listening > PortState::Blocking);
        assert!(PortState::Blocking > PortState::Disabled);
    }

    #[test]
    fn test_set_state_bumps_forward_transitions_once() {
        let mut pv = PortVector::new(PortId(1), PortIdentifier::new(0, 1), 100);
        pv.set_state(PortState::Listening);
        pv.set_state(PortState::Learning);
        pv.set_state(PortState::Forwarding);
        assert_eq!(pv.forward_transitions, 1);
        assert_eq!(pv.kernel_state, KernelState::Forward);
        pv.set_state(PortState::Forwarding);
        assert_eq!(pv.forward_transitions, 1, "no-op transitions must not double count");
    }

    #[test]
    fn test_dirty_set_mark_and_clear() {
        let mut d = DirtySet::empty();
        assert!(!d.any());
        d.mark(BridgeInfoField::RootId);
        assert!(d.is_dirty(BridgeInfoField::RootId));
        assert!(!d.is_dirty(BridgeInfoField::HoldTime));
        assert!(d.any());
        d.clear();
        assert!(!d.any());
    }

    #[test]
    fn test_mark_all_seeds_full_publish_on_init() {
        let mut d = DirtySet::empty();
        d.mark_all(PORT_VECTOR_FIELD_COUNT);
        for bit in 0..PORT_VECTOR_FIELD_COUNT {
            assert!(d.0 & (1 << bit) != 0);
        }
    }

    #[test]
    fn test_instance_lifecycle_active_iff_enable_mask_nonempty() {
        let bridge_id = BridgeIdentifier::new(8, 10, mac(0x01));
        let mut inst = Instance {
            vlan_id: VlanId::try_from(10u16).unwrap(),
            state: InstanceState::Config,
            fast_aging: false,
            bridge_info: BridgeInfo {
                root_id: bridge_id,
                root_path_cost: 0,
                root_port: None,
                max_age: 20,
                hello_time: 2,
                forward_delay: 15,
                bridge_max_age: 20,
                bridge_hello_time: 2,
                bridge_forward_delay: 15,
                bridge_id,
                topology_change_count: 0,
                topology_change_tick: 0,
                hold_time: 1,
                topology_change_detected: false,
                topology_change: false,
                topology_change_time: 0,
                dirty: DirtySet::empty(),
            },
            enable_mask: PortMask::new(8),
            control_mask: PortMask::new(8),
            untag_mask: PortMask::new(8),
            oper_down_mask: PortMask::new(8),
            hello_timer: Timer::new(),
            tcn_timer: Timer::new(),
            topology_change_timer: Timer::new(),
            last_expiry_time: 0,
            last_bpdu_rx_time: 0,
            rx_drop_bpdu: 0,
            dirty: DirtySet::empty(),
            ports: BTreeMap::new(),
        };
        inst.refresh_lifecycle_state();
        assert_eq!(inst.state, InstanceState::Config);
        inst.enable_mask.set(2).unwrap();
        inst.refresh_lifecycle_state();
        assert_eq!(inst.state, InstanceState::Active);
        inst.enable_mask.clear(2).unwrap();
        inst.refresh_lifecycle_state();
        assert_eq!(inst.state, InstanceState::Config);
    }

    #[test]
    fn test_global_instance_lookup_by_vlan() {
        let mut g = Global::new(4, 16, mac(0x9));
        let bridge_id = BridgeIdentifier::new(8, 0, mac(0x9));
        let inst = Instance {
            vlan_id: VlanId::try_from(5u16).unwrap(),
            state: InstanceState::Config,
            fast_aging: false,
            bridge_info: BridgeInfo {
                root_id: bridge_id,
                root_path_cost: 0,
                root_port: None,
                max_age: 20,
                hello_time: 2,
                forward_delay: 15,
                bridge_max_age: 20,
                bridge_hello_time: 2,
                bridge_forward_delay: 15,
                bridge_id,
                topology_change_count: 0,
                topology_change_tick: 0,
                hold_time: 1,
                topology_change_detected: false,
                topology_change: false,
                topology_change_time: 0,
                dirty: DirtySet::empty(),
            },
            enable_mask: PortMask::new(16),
            control_mask: PortMask::new(16),
            untag_mask: PortMask::new(16),
            oper_down_mask: PortMask::new(16),
            hello_timer: Timer::new(),
            tcn_timer: Timer::new(),
            topology_change_timer: Timer::new(),
            last_expiry_time: 0,
            last_bpdu_rx_time: 0,
            rx_drop_bpdu: 0,
            dirty: DirtySet::empty(),
            ports: BTreeMap::new(),
        };
        g.instances[1] = Some(inst);
        assert_eq!(
            g.find_instance_by_vlan(VlanId::try_from(5u16).unwrap()),
            Some(InstanceIndex(1))
        );
        assert_eq!(g.find_instance_by_vlan(VlanId::try_from(6u16).unwrap()), None);
    }
}
