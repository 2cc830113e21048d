mod common;

use common::{build, config, harness, spec};
use nimbus_common::{Error, ErrorKind, InstanceState, PowerAction};
use nimbus_daemon::ssh::simulated::{default_response, SimulatedConnector};
use nimbus_daemon::ssh::ExecOutput;
use nimbus_provider::{Fault, SimulatedProvider};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn create_reaches_running_through_ssh_ready() {
    let h = harness();
    let record = h.running("test1").await;

    assert_eq!(record.state, InstanceState::Running);
    assert!(record.ipv4.as_deref().is_some_and(|ip| !ip.is_empty()));
    assert!(record.cost.hourly_rate > 0.0);

    let stored = h.daemon.vps().list_vps().unwrap();
    assert_eq!(stored.len(), 1);

    let states: Vec<InstanceState> = stored[0].history.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            InstanceState::Requested,
            InstanceState::Provisioning,
            InstanceState::NetworkReady,
            InstanceState::Bootstrapping,
            InstanceState::SshReady,
            InstanceState::Running,
        ]
    );

    let ip = record.ipv4.unwrap();
    let commands = h.ssh.commands_for(&ip);
    assert!(commands.iter().any(|c| c.starts_with("bash -s")));
    assert!(commands.iter().any(|c| c == "kubectl get nodes"));
}

#[tokio::test(start_paused = true)]
async fn instances_share_one_provider_key() {
    let h = harness();
    h.running("web-1").await;
    h.running("web-2").await;
    assert_eq!(h.provider.ssh_key_count(), 1);
    assert_eq!(h.provider.server_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn create_rejects_bad_specs() {
    let h = harness();

    let mut bad = spec("test1");
    bad.size = "gigantic".into();
    assert!(h.daemon.vps().create_vps(bad).await.is_err());

    let mut bad = spec("test1");
    bad.provider = Some("nowhere".into());
    let err = h.daemon.vps().create_vps(bad).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(h.daemon.vps().create_vps(spec("Not_Valid")).await.is_err());
    assert!(h.daemon.vps().list_vps().unwrap().is_empty());

    h.running("test1").await;
    let err = h.daemon.vps().create_vps(spec("test1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test(start_paused = true)]
async fn readiness_timeout_compensates() {
    let h = build(SimulatedProvider::new().never_ready(), SimulatedConnector::new(), config());

    let handle = h.daemon.vps().create_vps(spec("slow")).await.unwrap();
    let id = handle.id.clone();
    let err = handle.wait().await.unwrap_err();

    match &err {
        Error::Pipeline {
            step, compensated, ..
        } => {
            assert_eq!(step, "readiness");
            assert!(*compensated);
        }
        other => panic!("expected pipeline error, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let record = h.daemon.vps().get_vps(&id).unwrap();
    assert_eq!(record.state, InstanceState::BootstrapTimeout);
    assert!(record.provider_id.is_none());
    assert!(!record.visited(InstanceState::Running));
    assert_eq!(h.provider.server_count(), 0);
    assert!(h.daemon.state().list_orphans().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_compensation_leaves_orphan_for_reconciler() {
    let h = build(SimulatedProvider::new().never_ready(), SimulatedConnector::new(), config());
    h.provider.inject_fault("delete", Fault::Permanent, 1);

    let err = h
        .daemon
        .vps()
        .create_vps(spec("slow"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Pipeline { compensated: false, .. }));
    assert_eq!(h.daemon.state().list_orphans().unwrap().len(), 1);
    assert_eq!(h.provider.server_count(), 1);

    let report = h.daemon.reconciler().reconcile_all().await.unwrap();
    assert_eq!(report.orphans_cleared, 1);
    assert!(h.daemon.state().list_orphans().unwrap().is_empty());
    assert_eq!(h.provider.server_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unreachable_ssh_times_out_bootstrap() {
    let ssh = SimulatedConnector::new();
    ssh.set_unreachable(true);
    let h = build(
        SimulatedProvider::new().with_readiness_delay(Duration::ZERO),
        ssh,
        config(),
    );

    let handle = h.daemon.vps().create_vps(spec("dark")).await.unwrap();
    let id = handle.id.clone();
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(&err, Error::Pipeline { step, .. } if step == "bootstrap"));

    let record = h.daemon.vps().get_vps(&id).unwrap();
    assert_eq!(record.state, InstanceState::BootstrapTimeout);
    assert!(record.visited(InstanceState::Bootstrapping));
    assert!(!record.visited(InstanceState::SshReady));
    assert_eq!(h.provider.server_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_ssh_key_is_not_retried() {
    let ssh = SimulatedConnector::new();
    ssh.reject_auth(true);
    let h = build(
        SimulatedProvider::new().with_readiness_delay(Duration::ZERO),
        ssh.clone(),
        config(),
    );

    let handle = h.daemon.vps().create_vps(spec("locked")).await.unwrap();
    let id = handle.id.clone();
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(ssh.connect_count(), 1);
    assert_eq!(
        h.daemon.vps().get_vps(&id).unwrap().state,
        InstanceState::ConfigFailed
    );
}

#[tokio::test(start_paused = true)]
async fn failed_bootstrap_can_be_retried() {
    let broken = Arc::new(AtomicBool::new(true));
    let flag = broken.clone();
    let ssh = SimulatedConnector::with_responder(move |cmd| {
        if cmd.starts_with("bash -s") && flag.load(Ordering::SeqCst) {
            return ExecOutput {
                stdout: String::new(),
                stderr: "curl: (6) Could not resolve host".into(),
                exit_code: 6,
            };
        }
        default_response(cmd)
    });
    let h = build(
        SimulatedProvider::new().with_readiness_delay(Duration::ZERO),
        ssh,
        config(),
    );

    let handle = h.daemon.vps().create_vps(spec("flaky")).await.unwrap();
    let id = handle.id.clone();
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Ssh);
    assert_eq!(err.detail(), Some("curl: (6) Could not resolve host"));

    let record = h.daemon.vps().get_vps(&id).unwrap();
    assert_eq!(record.state, InstanceState::ConfigFailed);
    assert!(record.last_error.is_some());

    // Only failed instances can be retried
    let other = h.running("steady").await;
    let err = h.daemon.vps().retry_vps(&other.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    broken.store(false, Ordering::SeqCst);
    let record = h.daemon.vps().retry_vps(&id).await.unwrap().wait().await.unwrap();
    assert_eq!(record.state, InstanceState::Running);
    assert!(record.last_error.is_none());
    // The first attempt's server was removed before the retry
    assert_eq!(h.provider.server_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn delete_is_idempotent() {
    let h = harness();
    let record = h.running("test1").await;

    h.daemon.vps().delete_vps(&record.id).await.unwrap();
    h.daemon.vps().delete_vps(&record.id).await.unwrap();

    assert!(h.daemon.vps().list_vps().unwrap().is_empty());
    assert_eq!(h.provider.server_count(), 0);
    assert_eq!(h.daemon.ssh().cached_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn delete_error_keeps_record_for_retry() {
    let h = harness();
    let record = h.running("test1").await;
    h.provider.inject_fault("delete", Fault::Permanent, 1);

    let err = h.daemon.vps().delete_vps(&record.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderPermanent);
    assert_eq!(
        h.daemon.vps().get_vps(&record.id).unwrap().state,
        InstanceState::Deleting
    );

    let report = h.daemon.reconciler().reconcile_all().await.unwrap();
    assert_eq!(report.deletes_finished, 1);
    assert!(h.daemon.vps().list_vps().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_succeeds_when_provider_lost_the_server() {
    let h = harness();
    let record = h.running("test1").await;
    assert!(h.provider.forget_server(record.provider_id.as_deref().unwrap()));

    h.daemon.vps().delete_vps(&record.id).await.unwrap();
    assert!(h.daemon.vps().list_vps().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn power_actions_follow_the_state_table() {
    let h = harness();
    let record = h.running("test1").await;
    let vps = h.daemon.vps();

    let err = vps.power_action(&record.id, PowerAction::On).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let off = vps.power_action(&record.id, PowerAction::Off).await.unwrap();
    assert_eq!(off.state, InstanceState::PoweredOff);

    for action in [PowerAction::Off, PowerAction::Reboot] {
        let err = vps.power_action(&record.id, action).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    let on = vps.power_action(&record.id, PowerAction::On).await.unwrap();
    assert_eq!(on.state, InstanceState::Running);

    let rebooted = vps.power_action(&record.id, PowerAction::Reboot).await.unwrap();
    assert_eq!(rebooted.state, InstanceState::Running);
    assert!(rebooted.visited(InstanceState::Rebooting));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_power_action_leaves_instance_usable() {
    let h = harness();
    let record = h.running("test1").await;
    let vps = h.daemon.vps();

    h.provider.inject_fault("get", Fault::Permanent, 1);
    let err = vps.power_action(&record.id, PowerAction::Reboot).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderPermanent);
    let after = vps.get_vps(&record.id).unwrap();
    assert_eq!(after.state, InstanceState::Running);
    assert!(after.last_error.is_some());

    let off = vps.power_action(&record.id, PowerAction::Off).await.unwrap();
    assert_eq!(off.state, InstanceState::PoweredOff);

    h.provider.inject_fault("get", Fault::Permanent, 1);
    assert!(vps.power_action(&record.id, PowerAction::On).await.is_err());
    assert_eq!(vps.get_vps(&record.id).unwrap().state, InstanceState::Running);

    let rebooted = vps.power_action(&record.id, PowerAction::Reboot).await.unwrap();
    assert_eq!(rebooted.state, InstanceState::Running);
    assert!(rebooted.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn same_instance_operations_are_serialized() {
    let h = build(
        SimulatedProvider::new()
            .with_readiness_delay(Duration::ZERO)
            .with_latency(Duration::from_secs(1)),
        SimulatedConnector::new(),
        config(),
    );
    let a = h.running("web-a").await;
    let b = h.running("web-b").await;
    let vps = h.daemon.vps();

    // A reboot is one power call plus one status poll
    let started = Instant::now();
    let (r1, r2) = tokio::join!(
        vps.power_action(&a.id, PowerAction::Reboot),
        vps.power_action(&b.id, PowerAction::Reboot),
    );
    r1.unwrap();
    r2.unwrap();
    let independent = started.elapsed();
    assert!(independent < Duration::from_secs(3), "took {:?}", independent);

    let started = Instant::now();
    let (r1, r2) = tokio::join!(
        vps.power_action(&a.id, PowerAction::Reboot),
        vps.power_action(&a.id, PowerAction::Reboot),
    );
    r1.unwrap();
    r2.unwrap();
    let serialized = started.elapsed();
    assert!(serialized >= Duration::from_secs(4), "took {:?}", serialized);

    // A delete queued behind a power action sees its result
    let (power, delete) = tokio::join!(
        vps.power_action(&b.id, PowerAction::Off),
        vps.delete_vps(&b.id),
    );
    assert_eq!(power.unwrap().state, InstanceState::PoweredOff);
    delete.unwrap();
    assert!(vps.get_vps(&b.id).unwrap_err().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn ssh_operations_require_ssh_ready() {
    let h = build(SimulatedProvider::new().never_ready(), SimulatedConnector::new(), config());
    let handle = h.daemon.vps().create_vps(spec("slow")).await.unwrap();
    let id = handle.id.clone();
    let _ = handle.wait().await;

    let err = h.daemon.vps().connection_for(&id).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = h.daemon.terminals().open_session(&id, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}
