//! Protection overlays (C7): Root Guard, BPDU Guard, PortFast/Fast Span,
//! Fast Uplink. These are predicates and small state transitions the state
//! machine (C6) consults at well-defined points rather than a parallel state
//! machine of their own — spec §4.7 describes each as a bit plus a gating
//! rule, not an independent protocol.

use crate::model::{Global, Instance, PortId, PortState};

/// Per-spec §9(c): `rootProtectTimeout` is a single global value, not
/// per-port. Default from `original_source/include/stp.h`
/// (`STP_DFLT_ROOT_PROTECT_TIMEOUT`), range 5–600s.
pub const DFLT_ROOT_PROTECT_TIMEOUT_SECS: u32 = 30;
pub const MIN_ROOT_PROTECT_TIMEOUT_SECS: u32 = 5;
pub const MAX_ROOT_PROTECT_TIMEOUT_SECS: u32 = 600;

/// `STP_FASTSPAN_FORWARD_DELAY` / `STP_FASTUPLINK_FORWARD_DELAY`
/// (`original_source/include/stp.h`): the two-stage forward-delay override
/// each overlay grants, in seconds.
pub const FASTSPAN_FORWARD_DELAY_SECS: u16 = 2;
pub const FASTUPLINK_LISTEN_DELAY_SECS: u16 = 1;
pub const FASTUPLINK_LEARN_DELAY_SECS: u16 = 0;

/// Effective forward-delay stages `(listening_to_learning, learning_to_forwarding)`
/// in seconds for `port` on `instance`, accounting for PortFast/FastSpan and
/// Fast Uplink overrides (spec §4.6.5, §4.7).
pub fn effective_forward_delay_secs(global: &Global, instance: &Instance, port: PortId) -> (u16, u16) {
    if global.fastspan_mask.test(port.0 as usize) {
        return (FASTSPAN_FORWARD_DELAY_SECS, FASTSPAN_FORWARD_DELAY_SECS);
    }
    if global.fastuplink_mask.test(port.0 as usize) && is_fastuplink_ok(global, instance, port) {
        return (FASTUPLINK_LISTEN_DELAY_SECS, FASTUPLINK_LEARN_DELAY_SECS);
    }
    let d = instance.bridge_info.forward_delay;
    (d, d)
}

/// Fast Uplink eligibility (spec §4.6.5, §4.7): true iff no *other*
/// fastuplink-configured port on this instance is in a non-blocking,
/// non-disabled state.
pub fn is_fastuplink_ok(global: &Global, instance: &Instance, port: PortId) -> bool {
    instance.ports.iter().all(|(id, pv)| {
        *id == port
            || !global.fastuplink_mask.test(id.0 as usize)
            || matches!(pv.state, PortState::Blocking | PortState::Disabled)
    })
}

/// Clears the *active* Fast Span bit for `port` on first BPDU receipt
/// (spec §4.7: "the active bit is cleared; the configured bit remains, so
/// link flap re-arms it"). Returns true if the bit was actually cleared (so
/// the caller can mark the field dirty / publish if it tracks this as
/// observable state).
pub fn clear_fastspan_on_bpdu(global: &mut Global, port: PortId) -> bool {
    if global.fastspan_mask.test(port.0 as usize) {
        let _ = global.fastspan_mask.clear(port.0 as usize);
        true
    } else {
        false
    }
}

/// BPDU Guard gating (spec §4.7, §4.6.12, scenario 3): if `port` has BPDU
/// Guard with `doDisable` configured, mark it admin-disabled and tell the
/// caller to stop processing this BPDU and request a physical admin-down.
/// Returns true if the port must be shut down and processing dropped.
pub fn bpdu_guard_trip(global: &mut Global, port: PortId) -> bool {
    let guarded = global.protect_mask.test(port.0 as usize);
    let do_disable = global.protect_do_disable_mask.test(port.0 as usize);
    if guarded && do_disable {
        let _ = global.protect_disabled_mask.set(port.0 as usize);
        true
    } else {
        false
    }
}

/// Clears a BPDU-Guard admin-disable for `port`, e.g. on operator request
/// via `STPCTL`/`PortConfig`. The port remains guarded; only the
/// "currently shut down" bit is cleared.
pub fn clear_bpdu_guard_disabled(global: &mut Global, port: PortId) {
    let _ = global.protect_disabled_mask.clear(port.0 as usize);
}

/// True if Root Guard is configured on `port`.
pub fn root_guard_configured(global: &Global, port: PortId) -> bool {
    global.root_protect_mask.test(port.0 as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::PortMask;
    use crate::model::{BridgeIdentifier, BridgeInfo, DirtySet, InstanceState, PortIdentifier, PortVector};
    use crate::timer::Timer;
    use sonic_types::{MacAddress, VlanId};
    use std::collections::BTreeMap;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0, 0, 0, 0, 0, last])
    }

    fn test_instance() -> Instance {
        let bridge_id = BridgeIdentifier::new(8, 0, mac(1));
        Instance {
            vlan_id: VlanId::new(10).unwrap(),
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
        }
    }

    #[test]
    fn test_fastspan_overrides_forward_delay() {
        let mut global = Global::new(4, 16, mac(9));
        global.fastspan_mask.set(3).unwrap();
        let instance = test_instance();
        assert_eq!(
            effective_forward_delay_secs(&global, &instance, PortId(3)),
            (FASTSPAN_FORWARD_DELAY_SECS, FASTSPAN_FORWARD_DELAY_SECS)
        );
    }

    #[test]
    fn test_fastuplink_eligible_when_alone() {
        let mut global = Global::new(4, 16, mac(9));
        global.fastuplink_mask.set(6).unwrap();
        global.fastuplink_mask.set(7).unwrap();
        let mut instance = test_instance();
        let mut pv6 = PortVector::new(PortId(6), PortIdentifier::new(0, 6), 4);
        pv6.set_state(PortState::Blocking);
        let mut pv7 = PortVector::new(PortId(7), PortIdentifier::new(0, 7), 4);
        pv7.set_state(PortState::Blocking);
        instance.ports.insert(PortId(6), pv6);
        instance.ports.insert(PortId(7), pv7);
        assert!(is_fastuplink_ok(&global, &instance, PortId(7)));

        instance.ports.get_mut(&PortId(6)).unwrap().set_state(PortState::Forwarding);
        assert!(!is_fastuplink_ok(&global, &instance, PortId(7)));
    }

    #[test]
    fn test_bpdu_guard_do_disable_trips() {
        let mut global = Global::new(4, 16, mac(9));
        global.protect_mask.set(4).unwrap();
        global.protect_do_disable_mask.set(4).unwrap();
        assert!(bpdu_guard_trip(&mut global, PortId(4)));
        assert!(global.protect_disabled_mask.test(4));
    }

    #[test]
    fn test_bpdu_guard_without_do_disable_does_not_trip() {
        let mut global = Global::new(4, 16, mac(9));
        global.protect_mask.set(4).unwrap();
        assert!(!bpdu_guard_trip(&mut global, PortId(4)));
        assert!(!global.protect_disabled_mask.test(4));
    }

    #[test]
    fn test_fastspan_clears_on_first_bpdu_only() {
        let mut global = Global::new(4, 16, mac(9));
        global.fastspan_mask.set(2).unwrap();
        assert!(clear_fastspan_on_bpdu(&mut global, PortId(2)));
        assert!(!global.fastspan_mask.test(2));
        assert!(!clear_fastspan_on_bpdu(&mut global, PortId(2)));
    }
}
