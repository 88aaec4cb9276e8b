//! Integration coverage for the source-side migration driver against the
//! in-memory collaborator fakes: the end-to-end scenarios and cross-module
//! invariants a single module's unit tests can't exercise on their own.

use std::sync::Arc;
use std::time::Duration;

use migration_agent::config::MigrationConfig;
use migration_agent::migration::collaborators::{CustomDevice, JobInfo, PeerAgentClient};
use migration_agent::migration::mock::{
    CreateOutcome, MockHookDispatcher, MockHypervisorDomain, MockPeerAgentClient, MockVmHandle,
    ProbeOutcome,
};
use migration_agent::migration::MigrationDriver;
use migrate_common::migration::{MigrationMethod, MigrationRequest, StatusCode};

fn fast_config() -> MigrationConfig {
    let mut config = MigrationConfig::default();
    config.monitor_interval = Duration::from_millis(2);
    config.downtime_steps = 2;
    config.downtime_delay_ms_per_gib = 1;
    config
}

#[tokio::test]
async fn peer_already_present_skips_the_slot_and_leaves_vm_up() {
    let domain = Arc::new(MockHypervisorDomain::new());
    let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::new(
        ProbeOutcome::AlreadyExists,
        CreateOutcome::Accepted,
    ));
    let vm = Arc::new(MockVmHandle::new("vm-100"));
    let hooks = Arc::new(MockHookDispatcher::new());
    let request = MigrationRequest::remote("node2", MigrationMethod::Online, 500);

    let driver = MigrationDriver::new(domain.clone(), Some(peer), vm.clone(), hooks, fast_config(), request);
    driver.run().await;

    let status = driver.get_stat().await;
    assert_eq!(status.code, StatusCode::Exist);
    assert_eq!(vm.last_status(), "Up");
    assert!(domain.migrate_calls().is_empty());
}

#[tokio::test]
async fn unreachable_peer_recovers_and_leaves_vm_up() {
    let domain = Arc::new(MockHypervisorDomain::new());
    let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::new(
        ProbeOutcome::Unreachable,
        CreateOutcome::Accepted,
    ));
    let vm = Arc::new(MockVmHandle::new("vm-100"));
    let hooks = Arc::new(MockHookDispatcher::new());
    let request = MigrationRequest::remote("node2", MigrationMethod::Online, 500);

    let driver = MigrationDriver::new(domain, Some(peer), vm.clone(), hooks, fast_config(), request);
    driver.run().await;

    let status = driver.get_stat().await;
    assert_eq!(status.code, StatusCode::NoConPeer);
    assert_eq!(vm.last_status(), "Up");
    assert!(!vm.is_paused());
}

#[tokio::test]
async fn successful_remote_migration_dispatches_all_hooks_and_tickets() {
    let domain = Arc::new(MockHypervisorDomain::new());
    let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::reachable_and_absent());
    let vm = Arc::new(
        MockVmHandle::new("vm-100")
            .with_display("qxl", "203.0.113.7")
            .with_custom_devices(vec![
                CustomDevice {
                    device_xml: "<hostdev/>".to_string(),
                    custom: Default::default(),
                },
                CustomDevice {
                    device_xml: "<redirdev/>".to_string(),
                    custom: Default::default(),
                },
            ]),
    );
    let hooks = Arc::new(MockHookDispatcher::new());
    let request = MigrationRequest::remote("node2.cluster.internal:54321", MigrationMethod::Online, 400);

    let driver = MigrationDriver::new(
        domain.clone(),
        Some(peer),
        vm.clone(),
        hooks.clone(),
        fast_config(),
        request,
    );
    driver.run().await;

    let status = driver.get_stat().await;
    assert_eq!(status.progress, 100);
    assert_eq!(status.message, "Migration done");
    assert_eq!(
        vm.down_status(),
        Some(("MIGRATION_SUCCEEDED".to_string(), "Migration done".to_string()))
    );
    assert_eq!(hooks.device_migrate_calls(), 2);
    assert_eq!(hooks.migrate_source_calls(), 1);
    assert_eq!(vm.display_ticket_calls(), 1);
    let (dest_uri, mig_uri, _, _) = &domain.migrate_calls()[0];
    assert_eq!(dest_uri, "qemu+tls://node2.cluster.internal/system");
    assert_eq!(mig_uri, "tcp://node2.cluster.internal");
}

#[tokio::test]
async fn file_mode_unresponsive_guest_persists_stripped_params() {
    let domain = Arc::new(MockHypervisorDomain::new());
    let vm = Arc::new(MockVmHandle::new("vm-200").with_guest_agent_unresponsive());
    let hooks = Arc::new(MockHookDispatcher::new());
    let request = MigrationRequest::to_file("/var/lib/migrate/vm-200.save", 500);

    let driver = MigrationDriver::new(domain.clone(), None, vm.clone(), hooks, fast_config(), request);
    driver.run().await;

    assert!(vm.is_paused() || vm.last_status() == "Down");
    assert_eq!(domain.save_calls().len(), 1);
    let (_, saved) = vm.saved_state().expect("save-state payload recorded");
    assert!(!saved.contains_key("display"));
    assert!(!saved.contains_key("displayIp"));
    assert!(!saved.contains_key("pid"));
    let status = driver.get_stat().await;
    assert_eq!(status.progress, 100);
    assert_eq!(status.message, "SaveState done");
}

#[tokio::test]
async fn stop_after_slot_acquire_but_before_migrate_to_uri_cancels() {
    let domain = Arc::new(MockHypervisorDomain::new());
    let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::reachable_and_absent());
    let vm = Arc::new(MockVmHandle::new("vm-100"));
    let hooks = Arc::new(MockHookDispatcher::new());
    let request = MigrationRequest::remote("node2", MigrationMethod::Online, 500);

    let driver = Arc::new(MigrationDriver::new(
        domain.clone(),
        Some(peer),
        vm.clone(),
        hooks,
        fast_config(),
        request,
    ));
    driver.stop().await.expect("nothing to abort yet");
    driver.run().await;

    let status = driver.get_stat().await;
    assert_eq!(status.code, StatusCode::MigCancelErr);
    assert_eq!(status.message, "Migration canceled");
    assert!(domain.migrate_calls().is_empty());
}

#[tokio::test]
async fn monitor_stall_aborts_the_job_and_surfaces_mig_cancel_err() {
    let domain = Arc::new(
        MockHypervisorDomain::with_job_infos(vec![
            JobInfo {
                job_type: 1,
                data_total: 1000,
                data_remaining: 500,
                ..Default::default()
            };
            50
        ])
        .with_migrate_blocks_until_abort(),
    );
    let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::reachable_and_absent());
    let vm = Arc::new(MockVmHandle::new("vm-100"));
    let hooks = Arc::new(MockHookDispatcher::new());

    let mut config = fast_config();
    config.monitor_interval = Duration::from_millis(2);
    config.progress_timeout = Duration::from_millis(6);
    config.max_time_per_gib_mem_secs = 0;

    let request = MigrationRequest::remote("node2", MigrationMethod::Online, 500);
    let driver = MigrationDriver::new(domain.clone(), Some(peer), vm.clone(), hooks, config, request);

    tokio::time::timeout(Duration::from_secs(5), driver.run())
        .await
        .expect("driver should abort promptly once the monitor detects a stall");

    assert_eq!(domain.abort_calls(), 1);
    let status = driver.get_stat().await;
    assert_eq!(status.code, StatusCode::MigCancelErr);
}

#[tokio::test]
async fn monitor_wall_clock_overrun_aborts_the_job() {
    let domain = Arc::new(
        MockHypervisorDomain::with_job_infos(vec![JobInfo {
            job_type: 1,
            data_total: 1000,
            data_remaining: 500,
            ..Default::default()
        }])
        .with_migrate_blocks_until_abort(),
    );
    let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::reachable_and_absent());
    // mem_mib=1, max_time_per_gib_mem_secs=1 is deliberately the case where a
    // floor-divided budget (1*1/1024 == 0) would abort on the very first
    // sample; the ceiling division the monitor actually uses rounds this up
    // to a genuine 1s budget, so a real overrun has to be waited out.
    let vm = Arc::new(MockVmHandle::new("vm-100").with_mem_mib(1));
    let hooks = Arc::new(MockHookDispatcher::new());

    let mut config = fast_config();
    config.monitor_interval = Duration::from_millis(2);
    config.progress_timeout = Duration::from_secs(60);
    config.max_time_per_gib_mem_secs = 1;

    let request = MigrationRequest::remote("node2", MigrationMethod::Online, 500);
    let driver = MigrationDriver::new(domain.clone(), Some(peer), vm.clone(), hooks, config, request);

    let started = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(5), driver.run())
        .await
        .expect("driver should abort once the monitor detects the overrun");
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(900),
        "abort fired after {elapsed:?}, too soon for the computed 1s budget \
         (a floor-divided budget would abort almost instantly)"
    );
    assert_eq!(domain.abort_calls(), 1);
    let status = driver.get_stat().await;
    assert_eq!(status.code, StatusCode::MigCancelErr);
}

#[tokio::test]
async fn small_guest_with_nonzero_config_does_not_abort_instantly() {
    // Regression guard: max_time_per_gib_mem_secs is non-zero but small
    // enough that a naive floor-divided budget would round to 0 and trip the
    // "migrationMaxTime > 0" guard on the very first sample. The monitor
    // must treat this as a real (ceiling-rounded) budget instead.
    let domain = Arc::new(
        MockHypervisorDomain::with_job_infos(vec![
            JobInfo {
                job_type: 1,
                data_total: 1000,
                data_remaining: 500,
                ..Default::default()
            };
            3
        ])
        .with_migrate_blocks_until_abort(),
    );
    let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::reachable_and_absent());
    let vm = Arc::new(MockVmHandle::new("vm-100").with_mem_mib(1));
    let hooks = Arc::new(MockHookDispatcher::new());

    let mut config = fast_config();
    config.monitor_interval = Duration::from_millis(5);
    config.progress_timeout = Duration::from_secs(60);
    config.max_time_per_gib_mem_secs = 1;

    let request = MigrationRequest::remote("node2", MigrationMethod::Online, 500);
    let driver = Arc::new(MigrationDriver::new(
        domain.clone(),
        Some(peer),
        vm.clone(),
        hooks,
        config,
        request,
    ));

    let running = tokio::spawn({
        let driver = driver.clone();
        async move { driver.run().await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        domain.abort_calls(),
        0,
        "monitor aborted well before its 1s wall-clock budget elapsed"
    );

    driver.stop().await.ok();
    let _ = tokio::time::timeout(Duration::from_secs(5), running).await;
}

#[tokio::test]
async fn migration_params_are_absent_before_and_after_a_run() {
    let domain = Arc::new(MockHypervisorDomain::new());
    let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::reachable_and_absent());
    let vm = Arc::new(MockVmHandle::new("vm-100"));
    let hooks = Arc::new(MockHookDispatcher::new());
    assert!(vm.migration_params().is_none());

    let request = MigrationRequest::remote("node2", MigrationMethod::Online, 500);
    let driver = MigrationDriver::new(domain, Some(peer), vm.clone(), hooks, fast_config(), request);
    driver.run().await;

    assert!(vm.migration_params().is_none());
}

#[tokio::test]
async fn migration_create_refusal_surfaces_peer_message_and_recovers() {
    let domain = Arc::new(MockHypervisorDomain::new());
    let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::new(
        ProbeOutcome::NotPresent,
        CreateOutcome::Refused("destination storage pool is full".to_string()),
    ));
    let vm = Arc::new(MockVmHandle::new("vm-100"));
    let hooks = Arc::new(MockHookDispatcher::new());
    let request = MigrationRequest::remote("node2", MigrationMethod::Online, 500);

    let driver = MigrationDriver::new(domain.clone(), Some(peer), vm.clone(), hooks, fast_config(), request);
    driver.run().await;

    let status = driver.get_stat().await;
    assert_eq!(status.code, StatusCode::MigrateErr);
    assert_eq!(status.message, "destination storage pool is full");
    assert_eq!(vm.last_status(), "Up");
    assert!(domain.migrate_calls().is_empty());
}
