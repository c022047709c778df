//! Downstream sync (C10): batches dirty fields into publish calls against
//! the capability described in spec §6.4, and clears dirty bits only after
//! a successful publish (§3 invariant, §8 property 7).

use sonic_types::VlanId;

use crate::error::Result;
use crate::iftable::InterfaceTable;
use crate::model::{
    BridgeIdentifier, Global, InstanceField, InstanceIndex, PortId, PortIdentifier, PortState, PortVectorField,
};

/// Snapshot of the `BridgeInfo` fields a VLAN-instance publish carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VlanInstanceFields {
    pub root_id: BridgeIdentifier,
    pub root_path_cost: u32,
    pub root_port: Option<PortId>,
    pub max_age: u16,
    pub hello_time: u16,
    pub forward_delay: u16,
    pub bridge_id: BridgeIdentifier,
    pub topology_change_count: u32,
    pub topology_change: bool,
    pub topology_change_detected: bool,
    pub hold_time: u8,
}

/// Snapshot of the `PortVector` fields a per-port publish carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VlanPortFields {
    pub state: PortState,
    pub priority: u8,
    pub path_cost: u32,
    pub designated_root: BridgeIdentifier,
    pub designated_cost: u32,
    pub designated_bridge: BridgeIdentifier,
    pub designated_port: PortIdentifier,
    pub rx_config_bpdu: u64,
    pub tx_config_bpdu: u64,
    pub rx_tcn_bpdu: u64,
    pub tx_tcn_bpdu: u64,
    pub root_protect_active: bool,
}

/// The five publish functions plus the kernel-bridge shim from spec §6.4.
/// Production wires this to `std::process::Command`; tests use an in-memory
/// recording implementation.
pub trait DownstreamSync {
    fn publish_vlan_instance(
        &mut self,
        vlan_id: VlanId,
        instance_index: InstanceIndex,
        fields: VlanInstanceFields,
    ) -> Result<()>;

    fn publish_vlan_port(&mut self, vlan_id: VlanId, port_name: &str, fields: VlanPortFields) -> Result<()>;

    fn publish_port_state(&mut self, port_name: &str, instance_index: InstanceIndex, state: PortState) -> Result<()>;

    fn publish_fast_age(&mut self, vlan_id: VlanId, on: bool) -> Result<()>;

    fn admin_down_port(&mut self, port_name: &str, physical: bool) -> Result<()>;

    fn kernel_bridge_vlan(&mut self, port_name: &str, vlan_id: VlanId, add: bool, tagged: bool) -> Result<()>;
}

fn port_name<'a>(iftable: &'a InterfaceTable, port_id: PortId) -> Option<&'a str> {
    iftable.iter().find(|r| r.port_id == port_id).map(|r| r.name.as_str())
}

/// Runs one tick's worth of the batched publish pass (spec §4.10): every
/// instance with nonzero `dirty`, and every one of its ports with nonzero
/// `dirty`, is snapshotted and handed to `downstream`. Dirty bits are
/// cleared only after their publish call returns `Ok`.
pub fn sync_tick(global: &mut Global, iftable: &InterfaceTable, downstream: &mut dyn DownstreamSync) -> Result<()> {
    for idx in 0..global.instances.len() {
        let index = InstanceIndex(idx as u16);
        let Some(instance) = global.instance_mut(index) else {
            continue;
        };
        let vlan_id = instance.vlan_id;

        if instance.dirty.is_dirty(InstanceField::FastAging) {
            downstream.publish_fast_age(vlan_id, instance.fast_aging)?;
        }

        if instance.dirty.any() {
            let fields = VlanInstanceFields {
                root_id: instance.bridge_info.root_id,
                root_path_cost: instance.bridge_info.root_path_cost,
                root_port: instance.bridge_info.root_port,
                max_age: instance.bridge_info.max_age,
                hello_time: instance.bridge_info.hello_time,
                forward_delay: instance.bridge_info.forward_delay,
                bridge_id: instance.bridge_info.bridge_id,
                topology_change_count: instance.bridge_info.topology_change_count,
                topology_change: instance.bridge_info.topology_change,
                topology_change_detected: instance.bridge_info.topology_change_detected,
                hold_time: instance.bridge_info.hold_time,
            };
            downstream.publish_vlan_instance(vlan_id, index, fields)?;
            instance.dirty.clear();
            instance.bridge_info.dirty.clear();
        }

        let port_ids: Vec<PortId> = instance
            .ports
            .iter()
            .filter(|(_, pv)| pv.dirty.any())
            .map(|(id, _)| *id)
            .collect();

        for port_id in port_ids {
            let untagged = instance.untag_mask.test(port_id.0 as usize);
            let Some(name) = port_name(iftable, port_id) else {
                continue;
            };
            let name = name.to_string();
            let pv = instance
                .ports
                .get(&port_id)
                .expect("port_id came from iterating instance.ports");

            let state_dirty = pv.dirty.is_dirty(PortVectorField::State) || pv.dirty.is_dirty(PortVectorField::KernelState);
            let state = pv.state;
            let root_protect_active = pv.root_protect_timer.is_active();

            let fields = VlanPortFields {
                state,
                priority: pv.designated_port.priority,
                path_cost: pv.path_cost,
                designated_root: pv.designated_root,
                designated_cost: pv.designated_cost,
                designated_bridge: pv.designated_bridge,
                designated_port: pv.designated_port,
                rx_config_bpdu: pv.rx_config_bpdu,
                tx_config_bpdu: pv.tx_config_bpdu,
                rx_tcn_bpdu: pv.rx_tcn_bpdu,
                tx_tcn_bpdu: pv.tx_tcn_bpdu,
                root_protect_active,
            };
            downstream.publish_vlan_port(vlan_id, &name, fields)?;

            if state_dirty {
                downstream.publish_port_state(&name, index, state)?;
                downstream.kernel_bridge_vlan(&name, vlan_id, state == PortState::Forwarding, !untagged)?;
            }

            instance
                .ports
                .get_mut(&port_id)
                .expect("port_id came from iterating instance.ports")
                .dirty
                .clear();
        }
    }
    Ok(())
}

/// One of 10 round-robin sub-groups of the counter-only sweep (spec
/// §4.6.11: "the BPDU-counter sync visiting one of 10 sub-groups every tick,
/// 10s full sweep"). Unlike [`sync_tick`] this republishes regardless of the
/// dirty bit, since counters accumulate without necessarily flipping other
/// observable fields in the same tick.
pub fn counter_sweep_tick(
    global: &Global,
    iftable: &InterfaceTable,
    downstream: &mut dyn DownstreamSync,
    tick_counter: u64,
) -> Result<()> {
    let sub_group = (tick_counter % 10) as u16;
    for idx in 0..global.instances.len() {
        let index = InstanceIndex(idx as u16);
        let Some(instance) = global.instance(index) else {
            continue;
        };
        let vlan_id = instance.vlan_id;
        for (port_id, pv) in instance.ports.iter() {
            if port_id.0 % 10 != sub_group {
                continue;
            }
            let Some(name) = port_name(iftable, *port_id) else {
                continue;
            };
            let fields = VlanPortFields {
                state: pv.state,
                priority: pv.designated_port.priority,
                path_cost: pv.path_cost,
                designated_root: pv.designated_root,
                designated_cost: pv.designated_cost,
                designated_bridge: pv.designated_bridge,
                designated_port: pv.designated_port,
                rx_config_bpdu: pv.rx_config_bpdu,
                tx_config_bpdu: pv.tx_config_bpdu,
                rx_tcn_bpdu: pv.rx_tcn_bpdu,
                tx_tcn_bpdu: pv.tx_tcn_bpdu,
                root_protect_active: pv.root_protect_timer.is_active(),
            };
            downstream.publish_vlan_port(vlan_id, name, fields)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iftable::{InterfaceTable, LinkEvent, LinkSpeed, OperState};
    use crate::model::{BridgeInfo, DirtySet, Instance, InstanceState, PortVector, ProtoMode};
    use crate::timer::Timer;
    use sonic_types::MacAddress;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct RecordingSync {
        vlan_instance_calls: usize,
        vlan_port_calls: usize,
        port_state_calls: Vec<(String, PortState)>,
        kernel_bridge_calls: Vec<(String, bool, bool)>,
        fast_age_calls: Vec<bool>,
        admin_down_calls: Vec<String>,
    }

    impl DownstreamSync for RecordingSync {
        fn publish_vlan_instance(
            &mut self,
            _vlan_id: VlanId,
            _instance_index: InstanceIndex,
            _fields: VlanInstanceFields,
        ) -> Result<()> {
            self.vlan_instance_calls += 1;
            Ok(())
        }

        fn publish_vlan_port(&mut self, _vlan_id: VlanId, _port_name: &str, _fields: VlanPortFields) -> Result<()> {
            self.vlan_port_calls += 1;
            Ok(())
        }

        fn publish_port_state(&mut self, port_name: &str, _instance_index: InstanceIndex, state: PortState) -> Result<()> {
            self.port_state_calls.push((port_name.to_string(), state));
            Ok(())
        }

        fn publish_fast_age(&mut self, _vlan_id: VlanId, on: bool) -> Result<()> {
            self.fast_age_calls.push(on);
            Ok(())
        }

        fn admin_down_port(&mut self, port_name: &str, _physical: bool) -> Result<()> {
            self.admin_down_calls.push(port_name.to_string());
            Ok(())
        }

        fn kernel_bridge_vlan(&mut self, port_name: &str, _vlan_id: VlanId, add: bool, tagged: bool) -> Result<()> {
            self.kernel_bridge_calls.push((port_name.to_string(), add, tagged));
            Ok(())
        }
    }

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    fn test_instance(vlan: u16, port: PortId) -> Instance {
        let bridge_id = BridgeIdentifier::new(8, vlan, mac(1));
        let mut pv = PortVector::new(port, PortIdentifier::new(0, port.0), 100);
        pv.set_state(PortState::Forwarding);
        let mut ports = BTreeMap::new();
        ports.insert(port, pv);
        Instance {
            vlan_id: VlanId::try_from(vlan).unwrap(),
            state: InstanceState::Active,
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
            enable_mask: crate::bitmap::PortMask::new(16),
            control_mask: crate::bitmap::PortMask::new(16),
            untag_mask: crate::bitmap::PortMask::new(16),
            oper_down_mask: crate::bitmap::PortMask::new(16),
            hello_timer: Timer::new(),
            tcn_timer: Timer::new(),
            topology_change_timer: Timer::new(),
            last_expiry_time: 0,
            last_bpdu_rx_time: 0,
            rx_drop_bpdu: 0,
            dirty: DirtySet::empty(),
            ports,
        }
    }

    #[test]
    fn test_sync_tick_publishes_and_clears_dirty_bits() {
        let mut global = Global::new(4, 16, mac(1));
        global.proto_mode = ProtoMode::None;
        let mut instance = test_instance(10, PortId(3));
        instance.mark_all();
        instance.ports.get_mut(&PortId(3)).unwrap().mark_all();
        global.instances[0] = Some(instance);

        let mut iftable = InterfaceTable::new(16);
        iftable
            .upsert(
                &LinkEvent {
                    name: "Ethernet3".to_string(),
                    kernel_index: 3,
                    mac: mac(3),
                    speed: LinkSpeed::Gb1,
                    oper_state: OperState::Up,
                    master_ifindex: None,
                    is_bond: false,
                    is_member: false,
                },
                true,
            )
            .unwrap();

        let mut downstream = RecordingSync::default();
        sync_tick(&mut global, &iftable, &mut downstream).unwrap();

        assert_eq!(downstream.vlan_instance_calls, 1);
        assert_eq!(downstream.vlan_port_calls, 1);
        assert_eq!(downstream.port_state_calls, vec![("Ethernet3".to_string(), PortState::Forwarding)]);
        assert_eq!(downstream.kernel_bridge_calls, vec![("Ethernet3".to_string(), true, true)]);

        let instance = global.instance(InstanceIndex(0)).unwrap();
        assert!(!instance.dirty.any());
        assert!(!instance.ports.get(&PortId(3)).unwrap().dirty.any());
    }

    #[test]
    fn test_sync_tick_publishes_fast_age_transition() {
        let mut global = Global::new(4, 16, mac(1));
        global.proto_mode = ProtoMode::None;
        let mut instance = test_instance(40, PortId(2));
        instance.dirty.clear();
        instance.ports.get_mut(&PortId(2)).unwrap().dirty.clear();
        instance.fast_aging = true;
        instance.mark(InstanceField::FastAging);
        global.instances[0] = Some(instance);

        let iftable = InterfaceTable::new(16);
        let mut downstream = RecordingSync::default();
        sync_tick(&mut global, &iftable, &mut downstream).unwrap();
        assert_eq!(downstream.fast_age_calls, vec![true]);

        let instance = global.instance_mut(InstanceIndex(0)).unwrap();
        assert!(!instance.dirty.is_dirty(InstanceField::FastAging));
        instance.fast_aging = false;
        instance.mark(InstanceField::FastAging);

        sync_tick(&mut global, &iftable, &mut downstream).unwrap();
        assert_eq!(downstream.fast_age_calls, vec![true, false]);
    }

    #[test]
    fn test_sync_tick_skips_clean_instances() {
        let mut global = Global::new(2, 16, mac(1));
        let instance = test_instance(20, PortId(1));
        global.instances[0] = Some(instance);
        // No mark_all(): everything starts clean.
        let instance = global.instance_mut(InstanceIndex(0)).unwrap();
        instance.dirty.clear();
        instance.ports.get_mut(&PortId(1)).unwrap().dirty.clear();

        let iftable = InterfaceTable::new(16);
        let mut downstream = RecordingSync::default();
        sync_tick(&mut global, &iftable, &mut downstream).unwrap();
        assert_eq!(downstream.vlan_instance_calls, 0);
        assert_eq!(downstream.vlan_port_calls, 0);
    }
}
