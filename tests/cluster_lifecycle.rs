//! Cluster scenarios driven straight through the coordinator state machine

use rand::rngs::StdRng;
use rand::SeedableRng;
use spacecoord::common::ErrorKind;
use spacecoord::coordinator::metadata::InstanceBindings;
use spacecoord::coordinator::space_desc::parse_space;
use spacecoord::coordinator::{Coordinator, LifecycleState, ServiceLevel};

const HOST: &str = "10.0.0.1";

fn token(n: u16) -> String {
    format!("{:032}", n)
}

fn register(c: &mut Coordinator, n: u16) -> InstanceBindings {
    let port = 2000 + n * 2;
    c.register_instance(HOST, port, port + 1, u32::from(n), &token(n))
        .unwrap()
}

fn add(c: &mut Coordinator, desc: &str) {
    c.add_space(parse_space(desc).unwrap()).unwrap();
}

/// Ack everything queued for an instance, in order.
fn drain(c: &mut Coordinator, b: &InstanceBindings) -> Vec<u64> {
    let mut acked = Vec::new();
    while let Some(config) = c.fetch_config(Some(b)) {
        c.ack_config(b, config.version).unwrap();
        acked.push(config.version);
    }
    acked
}

#[test]
fn test_first_instance_restores_service_level() {
    let mut c = Coordinator::with_seed(1);
    add(&mut c, "space kv key k attributes v auto 0 0");
    assert_eq!(c.config_version(), 1);
    assert_eq!(c.service_level(), ServiceLevel::Dataloss);

    let b = register(&mut c, 1);
    assert_eq!(c.service_level(), ServiceLevel::Desired);
    assert_eq!(c.config_version(), 2);

    let id = c.instance_id(&b).unwrap();
    assert_eq!(c.instance(id).unwrap().pending_versions(), vec![1, 2]);
    assert_eq!(c.fetch_config(Some(&b)).unwrap().version, 1);

    c.ack_config(&b, 1).unwrap();
    let latest = c.fetch_config(Some(&b)).unwrap();
    assert_eq!(latest.version, 2);
    assert!(latest.blob.starts_with("host 1 10.0.0.1 2002 1 2003 1\nversion 2\n"));
    assert!(latest.blob.contains("space kv 1 k string v string\n"));
    assert!(latest.blob.ends_with("region 1 0 0 0x0 1"));
}

#[test]
fn test_failed_host_is_replaced_by_transfer() {
    let mut c = Coordinator::with_seed(11);
    let bindings: Vec<_> = (1..=3).map(|n| register(&mut c, n)).collect();
    add(&mut c, "space kv key k auto 0 1");

    let region = c.get_space("kv").unwrap().subspaces[0].regions[0].clone();
    assert_eq!(region.replicas.len(), 2);
    let victim = region.replicas[0];
    let survivor = region.replicas[1];
    let spare = (1..=3).find(|id| !region.replicas.contains(id)).unwrap();

    let before = c.config_version();
    let port = c.instance(victim).unwrap().bindings.inport;
    let failed = c.fail_host(HOST, port);
    assert_eq!(failed.into_iter().collect::<Vec<_>>(), vec![victim]);
    assert!(c.is_failed(victim));
    assert!(c.config_version() > before);
    assert_eq!(c.service_level(), ServiceLevel::Degraded);

    let xfers: Vec<_> = c.transfers().values().copied().collect();
    assert_eq!(xfers.len(), 1);
    let xfer = xfers[0];
    assert_eq!(xfer.target, spare);
    let blob = c.config_data().to_string();
    assert!(blob.contains(&format!("region 1 0 0 0x0 {}\n", survivor)));
    assert!(blob.contains(&format!("transfer {} 1 0 0 0x0 {}", xfer.xferid, spare)));

    // complete before golive is a protocol violation
    let err = c.transfer_complete(xfer.xferid).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    c.transfer_golive(xfer.xferid).unwrap();
    assert_eq!(c.service_level(), ServiceLevel::Desired);
    c.transfer_complete(xfer.xferid).unwrap();
    assert!(c.transfers().is_empty());
    let region = &c.get_space("kv").unwrap().subspaces[0].regions[0];
    assert_eq!(region.replicas, vec![survivor, spare]);
    assert!(!c.config_data().contains("transfer"));

    // late messages for a retired transfer are ignored
    let version = c.config_version();
    c.transfer_complete(xfer.xferid).unwrap();
    c.transfer_fail(xfer.xferid).unwrap();
    assert_eq!(c.config_version(), version);

    // the failed instance drops out of the host lines; the spare saw every version
    assert!(!c.config_data().contains(&format!("host {} ", victim)));
    assert!(drain(&mut c, &bindings[usize::try_from(spare - 1).unwrap()]).len() > 1);
}

#[test]
fn test_failed_transfer_rolls_back_live_replica() {
    let mut c = Coordinator::with_seed(5);
    for n in 1..=3 {
        register(&mut c, n);
    }
    add(&mut c, "space kv key k auto 0 1");
    let victim = c.get_space("kv").unwrap().subspaces[0].regions[0].replicas[0];
    let port = c.instance(victim).unwrap().bindings.outport;
    c.fail_host(HOST, port);

    let xferid = *c.transfers().keys().next().unwrap();
    c.transfer_golive(xferid).unwrap();
    assert_eq!(c.get_space("kv").unwrap().subspaces[0].regions[0].replicas.len(), 2);
    c.transfer_fail(xferid).unwrap();
    let region = &c.get_space("kv").unwrap().subspaces[0].regions[0];
    assert_eq!(region.replicas.len(), 1);
    assert!(region.transfers.is_empty());
    assert_eq!(c.service_level(), ServiceLevel::Degraded);
}

#[test]
fn test_second_failure_during_live_transfer_is_repaired() {
    let mut c = Coordinator::with_seed(13);
    for n in 1..=5 {
        register(&mut c, n);
    }
    add(&mut c, "space kv key k auto 0 2");
    let original = c.get_space("kv").unwrap().subspaces[0].regions[0].replicas.clone();
    assert_eq!(original.len(), 3);

    let port = c.instance(original[0]).unwrap().bindings.inport;
    c.fail_host(HOST, port);
    let first = *c.transfers().values().next().unwrap();
    c.transfer_golive(first.xferid).unwrap();
    assert_eq!(c.service_level(), ServiceLevel::Desired);

    // the live target already counts as a replica; a new failure still needs a transfer
    let port = c.instance(original[1]).unwrap().bindings.inport;
    c.fail_host(HOST, port);
    assert_eq!(c.service_level(), ServiceLevel::Degraded);
    assert_eq!(c.transfers().len(), 2);
    let second = *c
        .transfers()
        .values()
        .find(|x| x.xferid != first.xferid)
        .unwrap();
    assert!(![original[0], original[1], original[2], first.target].contains(&second.target));

    c.transfer_complete(first.xferid).unwrap();
    assert!(c
        .config_data()
        .contains(&format!("transfer {} 1 0 0 0x0 {}", second.xferid, second.target)));
    c.transfer_golive(second.xferid).unwrap();
    c.transfer_complete(second.xferid).unwrap();

    let region = &c.get_space("kv").unwrap().subspaces[0].regions[0];
    assert_eq!(region.replicas, vec![original[2], first.target, second.target]);
    assert!(c.transfers().is_empty());
    assert_eq!(c.service_level(), ServiceLevel::Desired);
}

#[test]
fn test_fetch_configs_for_mixed_targets() {
    let mut c = Coordinator::with_seed(14);
    let a = register(&mut c, 1);
    let b = register(&mut c, 2);
    assert!(c.fetch_configs([None, Some(&a), Some(&b)]).is_empty());

    add(&mut c, "space kv key k auto 0 0");
    add(&mut c, "space other key k auto 0 0");
    c.ack_config(&a, 1).unwrap();
    c.ack_config(&a, 2).unwrap();
    c.ack_config(&b, 1).unwrap();

    let configs = c.fetch_configs([None, Some(&a), Some(&b)]);
    assert_eq!(configs.len(), 2);
    assert!(!configs.contains_key(&Some(a)));
    assert_eq!(configs[&None].version, 2);
    assert_eq!(configs[&None].blob, c.config_data());
    assert_eq!(configs[&Some(b)].version, 2);
}

/// Assert that exactly one configuration version was generated since `before`.
fn bumped(c: &Coordinator, before: u64) -> u64 {
    assert_eq!(c.config_version(), before + 1, "{}", c.config_data());
    c.config_version()
}

#[test]
fn test_each_change_bumps_version_once() {
    let mut c = Coordinator::with_seed(2);
    let mut v = c.config_version();
    add(&mut c, "space a key k auto 0 1");
    v = bumped(&c, v);

    // first instance gets the empty region directly
    register(&mut c, 1);
    v = bumped(&c, v);
    // second instance is brought in by a transfer
    register(&mut c, 2);
    v = bumped(&c, v);
    let xferid = *c.transfers().keys().next().unwrap();
    c.transfer_golive(xferid).unwrap();
    v = bumped(&c, v);
    c.transfer_complete(xferid).unwrap();
    v = bumped(&c, v);

    // nothing to place, nothing to announce
    register(&mut c, 3);
    assert_eq!(c.config_version(), v);

    add(&mut c, "space b key k attributes x(int64) auto 0 0 subspace x auto 0 0");
    v = bumped(&c, v);
    c.del_space("b").unwrap();
    v = bumped(&c, v);
    c.fail_host(HOST, 2006);
    v = bumped(&c, v);
    c.quiesce().unwrap();
    v = bumped(&c, v);
    assert!(c.config_data().contains(&format!("version {}\n", v)));
}

#[test]
fn test_acks_follow_queue_order() {
    let mut c = Coordinator::with_seed(3);
    let b = register(&mut c, 1);
    add(&mut c, "space a key k auto 0 0");
    add(&mut c, "space b key k auto 0 0");

    let err = c.ack_config(&b, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    c.reject_config(&b, 1).unwrap();
    c.ack_config(&b, 2).unwrap();
    assert!(c.fetch_config(Some(&b)).is_none());
    assert!(c.ack_config(&b, 3).is_err());

    let id = c.instance_id(&b).unwrap();
    let inst = c.instance(id).unwrap();
    assert_eq!((inst.last_acked, inst.last_rejected), (2, 1));
}

#[test]
fn test_reregistration_keeps_identity_and_queue() {
    let mut c = Coordinator::with_seed(4);
    let first = c.register_instance(HOST, 2000, 2001, 10, &token(1)).unwrap();
    add(&mut c, "space kv key k auto 0 0");
    let id = c.instance_id(&first).unwrap();

    let second = c.register_instance(HOST, 2100, 2101, 11, &token(1)).unwrap();
    assert_eq!(c.instance_id(&second), Some(id));
    assert_eq!(c.instance_id(&first), None);
    let inst = c.instance(id).unwrap();
    assert_eq!(inst.pid, 11);
    // the host line changed, so a new version was queued behind the old one
    assert_eq!(inst.pending_versions(), vec![1, 2]);
    assert!(c.config_data().contains("host 1 10.0.0.1 2100 1 2101 1"));
    assert_eq!(c.get_status().instances.len(), 1);

    // same ports again bump the epochs
    let third = c.register_instance(HOST, 2100, 2101, 11, &token(1)).unwrap();
    assert_eq!((third.inver, third.outver), (2, 2));
    assert_eq!(c.instance_id(&third), Some(id));
}

#[test]
fn test_space_changes_need_service_level() {
    let mut c = Coordinator::with_seed(6);
    add(&mut c, "space kv key k auto 0 0");
    assert_eq!(c.service_level(), ServiceLevel::Dataloss);

    let version = c.config_version();
    let err = c
        .add_space(parse_space("space other key k auto 0 0").unwrap())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceLevelNotMet);
    assert_eq!(c.del_space("kv").unwrap_err().kind(), ErrorKind::ServiceLevelNotMet);
    assert_eq!(c.config_version(), version);
    assert_eq!(c.lst_spaces(), vec!["kv".to_string()]);

    register(&mut c, 1);
    c.del_space("kv").unwrap();
    assert!(c.lst_spaces().is_empty());
    assert_eq!(c.del_space("kv").unwrap_err().kind(), ErrorKind::UnknownSpace);
}

#[test]
fn test_lifecycle_ordering() {
    let mut c = Coordinator::with_seed(8);
    assert_eq!(c.shutdown().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(c.go_live().unwrap_err().kind(), ErrorKind::InvalidState);

    let a = register(&mut c, 1);
    let b = register(&mut c, 2);
    add(&mut c, "space kv key k auto 0 1");
    drain(&mut c, &a);
    drain(&mut c, &b);

    let state_id = c.quiesce().unwrap();
    assert_eq!(state_id.len(), 32);
    assert_eq!(c.state(), LifecycleState::Quiesce);
    assert!(c.config_data().ends_with(&format!("quiesce {}", state_id)));
    assert_eq!(c.quiesce().unwrap_err().kind(), ErrorKind::InvalidState);
    let err = c
        .add_space(parse_space("space late key k auto 0 0").unwrap())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    drain(&mut c, &a);
    let err = c.shutdown().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(err.to_string().contains("waiting for 1 hosts"));

    drain(&mut c, &b);
    let snapshot = c.shutdown().unwrap();
    assert_eq!(c.state(), LifecycleState::Shutdown);
    assert!(c.config_data().ends_with("shutdown"));
    assert!(snapshot.contains("state_version"));
    assert_eq!(c.go_live().unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn test_failed_instance_does_not_block_shutdown() {
    let mut c = Coordinator::with_seed(9);
    let a = register(&mut c, 1);
    register(&mut c, 2);
    add(&mut c, "space kv key k auto 0 0");
    c.fail_host(HOST, 2004);
    c.quiesce().unwrap();
    drain(&mut c, &a);
    c.shutdown().unwrap();
}

#[test]
fn test_restore_waits_for_go_live() {
    let mut c = Coordinator::with_seed(10);
    let a = register(&mut c, 1);
    add(&mut c, "space kv key k attributes v auto 1 0");
    drain(&mut c, &a);
    let state_id = c.quiesce().unwrap();
    drain(&mut c, &a);
    let snapshot = c.shutdown().unwrap();
    let saved_version = c.config_version();

    let mut restored = Coordinator::restore(&snapshot, StdRng::seed_from_u64(1)).unwrap();
    assert_eq!(restored.state(), LifecycleState::Startup);
    assert_eq!(restored.config_version(), saved_version);
    assert_eq!(restored.lst_spaces(), vec!["kv".to_string()]);
    assert_eq!(restored.get_status().restored_state_id, Some(state_id));
    assert_eq!(
        restored.add_space(parse_space("space x key k auto 0 0").unwrap()).unwrap_err().kind(),
        ErrorKind::InvalidState
    );

    let again = restored
        .register_instance(HOST, 2002, 2003, 99, &token(1))
        .unwrap();
    assert_eq!((again.inver, again.outver), (2, 2));
    assert_eq!(restored.instance_id(&again), Some(1));
    assert!(restored.fetch_config(Some(&again)).is_none());

    restored.go_live().unwrap();
    assert_eq!(restored.state(), LifecycleState::Normal);
    let pushed = restored.fetch_config(Some(&again)).unwrap();
    assert_eq!(pushed.version, restored.config_version());
    assert!(pushed.version > saved_version);
    assert!(!pushed.blob.contains("shutdown"));
    assert!(pushed.blob.contains("host 1 10.0.0.1 2002 2 2003 2"));
}

#[test]
fn test_corrupt_snapshot_is_rejected() {
    let mut c = Coordinator::with_seed(12);
    register(&mut c, 1);
    let snapshot = c.backup_state().unwrap();
    let tampered = snapshot.replace("\"pid\": 1", "\"pid\": 2");
    assert_ne!(snapshot, tampered);
    let err = Coordinator::restore(&tampered, StdRng::seed_from_u64(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateData);
    assert!(Coordinator::restore("{}", StdRng::seed_from_u64(1)).is_err());
}
