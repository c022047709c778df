//! stpd: per-VLAN Spanning Tree Protocol (PVST+) daemon entry point.
//!
//! Wires the library (every other module in this crate) to real OS
//! resources: an AF_PACKET socket for BPDU rx/tx, a netlink socket for
//! interface discovery, and a UNIX datagram socket for the control-plane IPC
//! protocol (spec §6). The `tokio::select!` loop below is the concrete
//! realization of the single-threaded cooperative scheduler described in
//! spec §4.8/§5 — nothing here spawns a second task or takes a lock.

mod link_watch;
mod platform;

use std::process::ExitCode;

use sonic_types::MacAddress;
use tokio::io::unix::AsyncFd;
use tokio::net::UnixDatagram;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stpd::config::StpdConfig;
use stpd::iftable::InterfaceTable;
use stpd::ipc::{self, IpcMessage};
use stpd::model::Global;
use stpd::sched;
use stpd::stp;

use link_watch::{LinkWatcher, RawLinkEvent};
use platform::{BpduSocket, ProcessDownstreamSync, RawPacketTx};

/// Upper bound on events drained from any single non-tick branch per wakeup
/// (spec §4.8: "never starves the 100ms tick").
const MAX_EVENTS_PER_WAKEUP: u32 = 5;

/// Initial sizing hint for the interface table before any link has been
/// discovered; `InterfaceTable::new` only uses this to round up a port-id
/// space, so an undersized guess just means an early LAG allocation, never
/// data loss — the table itself has no fixed capacity on Ethernet ports.
const INITIAL_PORT_SUFFIX_HINT: u16 = 64;

fn init_logging() {
    let filter = EnvFilter::try_from_env("STPD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    info!("stpd starting");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "/etc/sonic/stpd.conf".to_string());
    let config = match StpdConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "stpd exiting on fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: StpdConfig) -> stpd::Result<()> {
    let base_mac: MacAddress = config
        .base_mac
        .parse()
        .map_err(|_| stpd::StpError::InvalidArgument(format!("malformed base_mac {}", config.base_mac)))?;

    let mut iftable = InterfaceTable::new(INITIAL_PORT_SUFFIX_HINT);
    let mut global = Global::new(config.max_instances_ceiling, iftable.max_ports(), base_mac);

    let bpdu_socket = BpduSocket::open()?;
    let bpdu_fd = AsyncFd::new(bpdu_socket).map_err(|e| stpd::StpError::Fatal(format!("bpdu socket: {e}")))?;

    let link_watcher = LinkWatcher::open()?;
    let link_fd = AsyncFd::new(link_watcher).map_err(|e| stpd::StpError::Fatal(format!("netlink socket: {e}")))?;

    let _ = std::fs::remove_file(&config.ipc_sock_path);
    let ipc_socket = UnixDatagram::bind(&config.ipc_sock_path)
        .map_err(|e| stpd::StpError::Fatal(format!("ipc bind {}: {e}", config.ipc_sock_path)))?;

    let mut downstream = ProcessDownstreamSync::default();
    let mut tick_counter: u64 = 0;
    let started_at = std::time::Instant::now();
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(config.tick_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut ipc_buf = vec![0u8; 4096];
    let mut bpdu_buf = vec![0u8; 2048];

    info!(sock = %config.ipc_sock_path, "stpd ready");

    loop {
        tokio::select! {
            biased;

            _ = interval.tick() => {
                tick_counter += 1;
                let now_secs = started_at.elapsed().as_secs() as u32;
                let mut tx = RawPacketTx::new(bpdu_fd.get_ref(), &iftable);
                if let Err(e) = sched::tick(&mut global, &iftable, tick_counter, now_secs, base_mac, &mut tx, &mut downstream) {
                    warn!(error = %e, "scheduler tick failed");
                }
            }

            result = link_fd.readable() => {
                let mut guard = match result {
                    Ok(guard) => guard,
                    Err(e) => { warn!(error = %e, "netlink socket error"); continue; }
                };
                for _ in 0..MAX_EVENTS_PER_WAKEUP {
                    match guard.get_inner().recv_batch() {
                        Ok(events) if events.is_empty() => { guard.clear_ready(); break; }
                        Ok(events) => handle_link_events(&mut global, &mut iftable, events),
                        Err(e) => { warn!(error = %e, "netlink recv failed"); break; }
                    }
                }
            }

            result = bpdu_fd.readable() => {
                let mut guard = match result {
                    Ok(guard) => guard,
                    Err(e) => { warn!(error = %e, "bpdu socket error"); continue; }
                };
                for _ in 0..MAX_EVENTS_PER_WAKEUP {
                    match guard.get_inner().recv(&mut bpdu_buf) {
                        Ok(Some((n, ifindex))) => {
                            let now_secs = started_at.elapsed().as_secs() as u32;
                            handle_bpdu(&mut global, &iftable, guard.get_inner(), ifindex, &bpdu_buf[..n], now_secs, base_mac, &mut downstream);
                        }
                        Ok(None) => { guard.clear_ready(); break; }
                        Err(e) => { warn!(error = %e, "bpdu recv failed"); break; }
                    }
                }
            }

            result = ipc_socket.readable() => {
                if let Err(e) = result {
                    warn!(error = %e, "ipc socket error");
                    continue;
                }
                for _ in 0..MAX_EVENTS_PER_WAKEUP {
                    match ipc_socket.try_recv_from(&mut ipc_buf) {
                        Ok((n, from)) => handle_ipc_datagram(&mut global, &mut iftable, &ipc_socket, &ipc_buf[..n], from).await,
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => { warn!(error = %e, "ipc recv failed"); break; }
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                return Ok(());
            }
        }
    }
}

fn handle_link_events(global: &mut Global, iftable: &mut InterfaceTable, events: Vec<RawLinkEvent>) {
    for event in events {
        match event {
            RawLinkEvent::Upserted { name, kernel_index, mac, up, master_ifindex } => {
                let is_bond = name.starts_with("PortChannel");
                let ev = platform::link_event(&name, kernel_index, mac, up, master_ifindex, is_bond);
                let prev_master = iftable.get(&name).and_then(|r| r.master_ifindex);
                match iftable.upsert(&ev, global.extend_mode) {
                    Ok((port_id, existing)) => {
                        if existing {
                            stp::port_event(global, port_id, up);
                        }
                        if prev_master != ev.master_ifindex {
                            if let Some(old_master) = prev_master {
                                if let Err(e) = iftable.leave_lag(old_master) {
                                    warn!(error = %e, interface = %name, "failed to leave LAG");
                                }
                            }
                            if let Some(new_master) = ev.master_ifindex {
                                if let Err(e) = iftable.join_lag(&name, new_master, global.extend_mode) {
                                    warn!(error = %e, interface = %name, "failed to join LAG");
                                }
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, interface = %name, "failed to upsert interface"),
                }
            }
            RawLinkEvent::Deleted { kernel_index } => {
                if let Some(record) = iftable.get_by_kernel_index(kernel_index) {
                    let name = record.name.clone();
                    let prev_master = record.master_ifindex;
                    iftable.remove(&name);
                    if let Some(old_master) = prev_master {
                        if let Err(e) = iftable.leave_lag(old_master) {
                            warn!(error = %e, interface = %name, "failed to leave LAG on delete");
                        }
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_bpdu(
    global: &mut Global,
    iftable: &InterfaceTable,
    socket: &BpduSocket,
    ifindex: i32,
    frame: &[u8],
    now_secs: u32,
    base_mac: MacAddress,
    downstream: &mut ProcessDownstreamSync,
) {
    let Some(record) = iftable.get_by_kernel_index(ifindex as u32) else {
        return;
    };
    let port_id = record.port_id;
    let port_name = record.name.clone();

    let (tag_vlan, untagged_frame) = platform::strip_vlan_tag(frame);
    let decoded = match stpd::bpdu::decode(&untagged_frame) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, port = %port_name, "dropping unparseable frame");
            return;
        }
    };

    let vlan_id = tag_vlan
        .or(match &decoded {
            stpd::bpdu::Frame::PvstConfig { vlan_id, .. } => Some(*vlan_id),
            _ => None,
        })
        .unwrap_or(sonic_types::VlanId::DEFAULT);

    let Some(instance_index) = global.find_instance_by_vlan(vlan_id) else {
        return;
    };
    let idx = instance_index.0 as usize;
    let Some(mut instance) = global.instances[idx].take() else {
        return;
    };

    let mut tx = RawPacketTx::new(socket, iftable);
    let result = stp::receive_frame(
        global,
        &mut instance,
        port_id,
        &decoded,
        tag_vlan.is_some(),
        now_secs,
        base_mac,
        &mut tx,
        downstream,
        &port_name,
    );
    global.instances[idx] = Some(instance);
    if let Err(e) = result {
        warn!(error = %e, port = %port_name, "bpdu receive handler failed");
    }
}

async fn handle_ipc_datagram(
    global: &mut Global,
    iftable: &mut InterfaceTable,
    socket: &UnixDatagram,
    bytes: &[u8],
    from: tokio::net::unix::SocketAddr,
) {
    let msg = match ipc::parse_datagram(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "dropping malformed ipc datagram");
            return;
        }
    };
    match ipc::apply(global, iftable, &msg) {
        Ok(Some(reply)) => {
            if let Some(path) = from.as_pathname() {
                if let Err(e) = socket.send_to(reply.as_bytes(), path).await {
                    warn!(error = %e, "failed to send stpctl reply");
                }
            }
        }
        Ok(None) => {}
        Err(e) if e.is_idempotent() => {
            warn!(error = %e, "ipc message was a no-op");
        }
        Err(e) => warn!(error = %e, ?msg, "ipc apply failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    fn test_global() -> Global {
        Global::new(4, 32, mac(0xee))
    }

    #[test]
    fn test_link_event_join_and_leave_lag() {
        let mut global = test_global();
        let mut iftable = InterfaceTable::new(16);

        handle_link_events(
            &mut global,
            &mut iftable,
            vec![RawLinkEvent::Upserted {
                name: "PortChannel001".to_string(),
                kernel_index: 900,
                mac: mac(9),
                up: true,
                master_ifindex: None,
            }],
        );
        handle_link_events(
            &mut global,
            &mut iftable,
            vec![RawLinkEvent::Upserted {
                name: "Ethernet0".to_string(),
                kernel_index: 1,
                mac: mac(1),
                up: true,
                master_ifindex: None,
            }],
        );
        assert_eq!(iftable.get("PortChannel001").unwrap().member_port_count, 0);

        // Ethernet0 now reports PortChannel001 (kernel index 900) as its
        // master — this must drive InterfaceTable::join_lag, not just update
        // the member's own record.
        handle_link_events(
            &mut global,
            &mut iftable,
            vec![RawLinkEvent::Upserted {
                name: "Ethernet0".to_string(),
                kernel_index: 1,
                mac: mac(1),
                up: true,
                master_ifindex: Some(900),
            }],
        );
        assert_eq!(iftable.get("PortChannel001").unwrap().member_port_count, 1);

        // Master goes back to `None` — must drive `leave_lag`, tearing the
        // now-empty LAG record down.
        handle_link_events(
            &mut global,
            &mut iftable,
            vec![RawLinkEvent::Upserted {
                name: "Ethernet0".to_string(),
                kernel_index: 1,
                mac: mac(1),
                up: true,
                master_ifindex: None,
            }],
        );
        assert!(iftable.get("PortChannel001").is_none());
    }

    #[test]
    fn test_deleted_link_event_leaves_lag() {
        let mut global = test_global();
        let mut iftable = InterfaceTable::new(16);

        handle_link_events(
            &mut global,
            &mut iftable,
            vec![
                RawLinkEvent::Upserted {
                    name: "PortChannel001".to_string(),
                    kernel_index: 900,
                    mac: mac(9),
                    up: true,
                    master_ifindex: None,
                },
                RawLinkEvent::Upserted {
                    name: "Ethernet0".to_string(),
                    kernel_index: 1,
                    mac: mac(1),
                    up: true,
                    master_ifindex: Some(900),
                },
            ],
        );
        assert_eq!(iftable.get("PortChannel001").unwrap().member_port_count, 1);

        handle_link_events(&mut global, &mut iftable, vec![RawLinkEvent::Deleted { kernel_index: 1 }]);
        assert!(iftable.get("PortChannel001").is_none());
    }
}
