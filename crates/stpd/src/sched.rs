//! Cooperative scheduler (C8): a single 100ms tick drives every active
//! instance's timers in deterministic, ascending (instance, port) order
//! (spec §4.8). Instances are split into 5 round-robin groups so that a
//! steady-state tick only services 1/5 of them — full coverage is still
//! guaranteed within 500ms, well inside every timer's granularity.

use sonic_types::MacAddress;

use crate::error::Result;
use crate::iftable::InterfaceTable;
use crate::model::{Global, InstanceIndex, PortId};
use crate::protect;
use crate::stp::{self, PacketTx};
use crate::sync::{self, DownstreamSync};

/// Number of round-robin groups a tick's instance set is split across
/// (spec §4.8: "grouped mod 5 so a full sweep completes in five ticks").
pub const TICK_GROUP_COUNT: u64 = 5;

/// How many consecutive ticks of the counter-sweep sub-rotation
/// ([`sync::counter_sweep_tick`]) make up a full pass (spec §4.6.11).
pub const COUNTER_SWEEP_GROUP_COUNT: u64 = 10;

/// Drives every instance whose index falls in this tick's round-robin group
/// through one 100ms step: timer decrement, expiry handling, and a dirty
/// sync pass. Returns the set of ports that need a BPDU sent this tick (the
/// caller already owns the socket/`PacketTx`, so transmission happens
/// inline rather than being queued).
pub fn tick(
    global: &mut Global,
    iftable: &InterfaceTable,
    tick_counter: u64,
    now_secs: u32,
    base_mac: MacAddress,
    tx: &mut dyn PacketTx,
    downstream: &mut dyn DownstreamSync,
) -> Result<()> {
    let group = tick_counter % TICK_GROUP_COUNT;
    let extend_mode = global.extend_mode;

    let indices: Vec<InstanceIndex> = (0..global.instances.len())
        .filter(|i| (*i as u64) % TICK_GROUP_COUNT == group)
        .map(|i| InstanceIndex(i as u16))
        .collect();

    for index in indices {
        let idx = index.0 as usize;
        let Some(mut instance) = global.instances[idx].take() else {
            continue;
        };
        if instance.state != crate::model::InstanceState::Active {
            global.instances[idx] = Some(instance);
            continue;
        }

        let outcome = tick_instance(global, &mut instance, extend_mode, now_secs, base_mac, tx);
        global.instances[idx] = Some(instance);
        outcome?;
    }

    sync::sync_tick(global, iftable, downstream)?;
    sync::counter_sweep_tick(global, iftable, downstream, tick_counter)?;
    Ok(())
}

/// One instance's share of a tick. Split out of [`tick`] so the instance can
/// be [`Option::take`]n out of `global.instances` for the duration: several
/// state-machine steps need `&mut Global` and `&mut Instance` open at once,
/// which an aliasing `global.instance_mut()` borrow can't give them.
fn tick_instance(
    global: &mut Global,
    instance: &mut crate::model::Instance,
    extend_mode: bool,
    now_secs: u32,
    base_mac: MacAddress,
    tx: &mut dyn PacketTx,
) -> Result<()> {
    instance.last_expiry_time = now_secs;

    // Per-port timer sweep, ascending port id (BTreeMap iteration order).
    let port_ids: Vec<PortId> = instance.ports.keys().copied().collect();
    for port_id in port_ids {
        let message_age_expired;
        let forward_delay_expired;
        let hold_expired;
        let root_protect_expired;
        {
            let pv = instance.ports.get_mut(&port_id).expect("port_id came from this instance's ports map");
            pv.message_age_timer.tick();
            pv.forward_delay_timer.tick();
            pv.hold_timer.tick();
            pv.root_protect_timer.tick();
            message_age_expired = pv.message_age_timer.expired();
            forward_delay_expired = pv.forward_delay_timer.expired();
            hold_expired = pv.hold_timer.expired();
            root_protect_expired = pv.root_protect_timer.expired();
        }

        if message_age_expired {
            instance.ports.get_mut(&port_id).unwrap().message_age_timer.stop();
            stp::message_age_timer_expired(instance, port_id);
            stp::configuration_update(instance, extend_mode);
        }
        if forward_delay_expired {
            stp::advance_forward_delay(global, instance, port_id);
        }
        if hold_expired {
            instance.ports.get_mut(&port_id).unwrap().hold_timer.stop();
            stp::hold_timer_expired(global, instance, port_id, base_mac, tx)?;
        }
        if root_protect_expired {
            instance.ports.get_mut(&port_id).unwrap().root_protect_timer.stop();
            stp::root_protect_timer_expired(instance, port_id);
            protect::clear_bpdu_guard_disabled(global, port_id);
        }
    }
    if instance.ports.values().any(|pv| pv.message_age_timer.is_active() || pv.forward_delay_timer.is_active()) {
        stp::port_state_selection(global, instance);
    }

    // Instance-level timer sweep.
    instance.hello_timer.tick();
    instance.tcn_timer.tick();
    instance.topology_change_timer.tick();

    if instance.hello_timer.expired() {
        instance.hello_timer.start((instance.bridge_info.hello_time as u32) * 10);
        stp::config_bpdu_generation(global, instance, base_mac, tx)?;
    }
    if instance.tcn_timer.expired() && !instance.bridge_info.is_root(extend_mode) {
        instance.tcn_timer.start((instance.bridge_info.bridge_hello_time as u32) * 10);
        stp::tcn_bpdu_generation(instance, base_mac, tx)?;
    }
    if instance.topology_change_timer.expired() {
        instance.topology_change_timer.stop();
        stp::topology_change_timer_expired(instance);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iftable::{InterfaceTable, LinkEvent, LinkSpeed, OperState};
    use crate::model::InstanceIndex;
    use crate::stp::new_instance;
    use crate::sync::{VlanInstanceFields, VlanPortFields};
    use sonic_types::{MacAddress, VlanId};

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    #[derive(Default)]
    struct RecordingTx {
        sent: Vec<(PortId, bool)>,
    }
    impl PacketTx for RecordingTx {
        fn tx(&mut self, port: PortId, _vlan: Option<VlanId>, bytes: &[u8], tagged: bool) -> Result<()> {
            assert!(!bytes.is_empty(), "tx must be called with a fully encoded frame");
            self.sent.push((port, tagged));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSync;
    impl DownstreamSync for RecordingSync {
        fn publish_vlan_instance(&mut self, _v: VlanId, _i: InstanceIndex, _f: VlanInstanceFields) -> Result<()> {
            Ok(())
        }
        fn publish_vlan_port(&mut self, _v: VlanId, _p: &str, _f: VlanPortFields) -> Result<()> {
            Ok(())
        }
        fn publish_port_state(&mut self, _p: &str, _i: InstanceIndex, _s: crate::model::PortState) -> Result<()> {
            Ok(())
        }
        fn publish_fast_age(&mut self, _v: VlanId, _on: bool) -> Result<()> {
            Ok(())
        }
        fn admin_down_port(&mut self, _p: &str, _physical: bool) -> Result<()> {
            Ok(())
        }
        fn kernel_bridge_vlan(&mut self, _p: &str, _v: VlanId, _add: bool, _tagged: bool) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (Global, InterfaceTable) {
        let mut global = Global::new(4, 16, mac(1));
        let mut instance = new_instance(VlanId::new(10).unwrap(), &global, 16);
        instance.enable_mask.set(1).unwrap();
        instance.state = crate::model::InstanceState::Active;
        stp::init_port(&mut instance, PortId(1), 0, 4);
        stp::configuration_update(&mut instance, global.extend_mode);
        stp::port_state_selection(&mut global, &mut instance);
        global.instances[0] = Some(instance);

        let mut iftable = InterfaceTable::new(16);
        iftable
            .upsert(
                &LinkEvent {
                    name: "Ethernet1".to_string(),
                    kernel_index: 1,
                    mac: mac(1),
                    speed: LinkSpeed::Gb1,
                    oper_state: OperState::Up,
                    master_ifindex: None,
                    is_bond: false,
                    is_member: false,
                },
                true,
            )
            .unwrap();
        (global, iftable)
    }

    #[test]
    fn test_hello_timer_expiry_sends_config_bpdu() {
        let (mut global, iftable) = setup();
        {
            let instance = global.instance_mut(InstanceIndex(0)).unwrap();
            instance.hello_timer.start(0);
        }
        let mut tx = RecordingTx::default();
        let mut downstream = RecordingSync;
        tick(&mut global, &iftable, 0, 1, mac(1), &mut tx, &mut downstream).unwrap();
        assert!(!tx.sent.is_empty(), "hello expiry on a designated port must transmit");
    }

    #[test]
    fn test_instance_outside_group_is_skipped() {
        let (mut global, iftable) = setup();
        {
            let instance = global.instance_mut(InstanceIndex(0)).unwrap();
            instance.hello_timer.start(0);
        }
        let mut tx = RecordingTx::default();
        let mut downstream = RecordingSync;
        // Instance 0 belongs to group 0 only; tick_counter=1 selects group 1.
        tick(&mut global, &iftable, 1, 1, mac(1), &mut tx, &mut downstream).unwrap();
        assert!(tx.sent.is_empty(), "instance must not be serviced outside its round-robin group");
    }

    #[test]
    fn test_forward_delay_progresses_across_ticks() {
        let (mut global, iftable) = setup();
        {
            let pv = global.instance_mut(InstanceIndex(0)).unwrap().ports.get_mut(&PortId(1)).unwrap();
            assert_eq!(pv.state, crate::model::PortState::Listening);
            pv.forward_delay_timer.start(0);
        }
        let mut tx = RecordingTx::default();
        let mut downstream = RecordingSync;
        tick(&mut global, &iftable, 0, 1, mac(1), &mut tx, &mut downstream).unwrap();
        let pv = global.instance(InstanceIndex(0)).unwrap().ports.get(&PortId(1)).unwrap();
        assert_eq!(pv.state, crate::model::PortState::Learning);
    }
}
