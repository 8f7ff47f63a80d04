//! Container actor lifecycle, console supervision, and shell commands
//! against scripted runtime and RPC fakes.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use redlab_domain::{
    CommandStatus, ConsoleError, ConsoleStatus, ContainerId, ContainerStatus, Event, Topic,
    TrackId, WorkspaceId,
};
use redlab_engine::container::{self, ContainerDeps, ContainerHandle, ContainerSpec};
use redlab_engine::events::EventBus;
use redlab_engine::supervisor::Supervisor;
use redlab_engine::trace::NullTraceSink;

use support::{test_config, MockRpc, MockRuntime};

const TRACK: TrackId = TrackId(42);

struct Harness {
    handle: ContainerHandle,
    runtime: Arc<MockRuntime>,
    rpc: Arc<MockRpc>,
    bus: Arc<EventBus>,
}

fn spawn_container() -> Harness {
    let runtime = MockRuntime::new();
    let rpc = MockRpc::new();
    let bus = Arc::new(EventBus::new());

    let handle = container::spawn(
        ContainerSpec {
            container_id: ContainerId(7),
            workspace_id: WorkspaceId(1),
            workspace_slug: "acme".into(),
            container_slug: "msf-1".into(),
        },
        ContainerDeps {
            runtime: runtime.clone(),
            rpc: rpc.clone(),
            bus: bus.clone(),
            trace: Arc::new(NullTraceSink),
            config: test_config(),
        },
    );

    Harness {
        handle,
        runtime,
        rpc,
        bus,
    }
}

async fn wait_for_console_status(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
    wanted: ConsoleStatus,
) {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(Event::ConsoleUpdated { status, .. }) = rx.recv().await {
                if status == wanted {
                    return;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("console never reached {wanted:?}"))
}

#[tokio::test]
async fn start_transitions_offline_starting_running() {
    let harness = spawn_container();
    let mut events = harness.bus.subscribe(&Topic::Container(ContainerId(7)));

    harness.handle.start().await.unwrap();
    assert_eq!(harness.handle.status().await, ContainerStatus::Running);

    let mut seen = Vec::new();
    while let Ok(Event::ContainerStatusChanged { status, .. }) = events.try_recv() {
        seen.push(status);
    }
    assert_eq!(
        seen,
        vec![ContainerStatus::Starting, ContainerStatus::Running]
    );

    // Running implies endpoint and token are in place.
    assert!(harness.handle.rpc_endpoint().await.is_some());
    assert_eq!(harness.runtime.running_count(), 1);
}

#[tokio::test]
async fn start_while_running_is_rejected() {
    let harness = spawn_container();
    harness.handle.start().await.unwrap();
    assert!(harness.handle.start().await.is_err());
}

#[tokio::test]
async fn register_then_unregister_round_trips_membership() {
    let harness = spawn_container();
    let mut track_events = harness.bus.subscribe(&Topic::Track(TRACK));
    harness.handle.start().await.unwrap();

    harness.handle.register_console(TRACK).await;
    wait_for_console_status(&mut track_events, ConsoleStatus::Ready).await;

    let snapshot = harness.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.registered_tracks, vec![TRACK]);
    assert_eq!(snapshot.consoles.len(), 1);
    assert!(snapshot.consoles[0].alive);

    harness.handle.unregister_console(TRACK).await;
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.registered_tracks.is_empty());
    assert!(snapshot.consoles.is_empty());

    // Registering again restores an observably equivalent membership.
    harness.handle.register_console(TRACK).await;
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.registered_tracks, vec![TRACK]);
}

#[tokio::test]
async fn msf_command_validation_is_three_layered() {
    let harness = spawn_container();

    // Layer 1: container not running.
    assert_eq!(
        harness.handle.send_msf_command(TRACK, "help").await.unwrap_err(),
        ConsoleError::ContainerNotRunning
    );

    harness.handle.start().await.unwrap();

    // Layer 2: track not registered.
    assert_eq!(
        harness.handle.send_msf_command(TRACK, "help").await.unwrap_err(),
        ConsoleError::ConsoleNotRegistered
    );

    // Layer 3: registered but console dead. Make the first session
    // creation fail so the slot has no live actor yet.
    harness
        .rpc
        .fail_next_create(redlab_domain::RpcError::Transport("refused".into()));
    harness.handle.register_console(TRACK).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let err = harness.handle.send_msf_command(TRACK, "help").await.unwrap_err();
    assert_eq!(err, ConsoleError::ConsoleOffline);
}

#[tokio::test]
async fn msf_command_flows_through_to_the_console() {
    let harness = spawn_container();
    let mut track_events = harness.bus.subscribe(&Topic::Track(TRACK));
    harness.handle.start().await.unwrap();
    harness.handle.register_console(TRACK).await;
    wait_for_console_status(&mut track_events, ConsoleStatus::Ready).await;

    harness.rpc.push_read(MockRpc::busy_chunk("[*] ok\n"));
    harness.rpc.push_read(MockRpc::done_chunk(""));

    let command_id = harness.handle.send_msf_command(TRACK, "db_status").await.unwrap();
    assert_eq!(command_id.as_str().len(), 16);
}

#[tokio::test]
async fn bash_command_completes_and_publishes_result() {
    let harness = spawn_container();
    let mut track_events = harness.bus.subscribe(&Topic::Track(TRACK));
    harness.handle.start().await.unwrap();
    harness.runtime.push_exec("total 0\n", 0);

    let command_id = harness.handle.send_bash_command(TRACK, "ls -la").await.unwrap();

    let mut saw_running = false;
    let finished = timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(Event::CommandResult { command, .. }) = track_events.recv().await {
                match command.status {
                    CommandStatus::Running => saw_running = true,
                    _ => return command,
                }
            }
        }
    })
    .await
    .expect("no command result");

    assert!(saw_running);
    assert_eq!(finished.id, command_id);
    assert_eq!(finished.status, CommandStatus::Finished);
    assert_eq!(finished.output, "total 0\n");
    assert_eq!(finished.exit_code, Some(0));

    // The tracking entry is removed on completion.
    assert!(harness.handle.running_bash_commands().await.is_empty());
}

#[tokio::test]
async fn failed_exec_publishes_command_error() {
    let harness = spawn_container();
    let mut track_events = harness.bus.subscribe(&Topic::Track(TRACK));
    harness.handle.start().await.unwrap();
    harness
        .runtime
        .fail_next_exec(redlab_domain::RuntimeError::ExecFailed("exec subsystem down".into()));

    harness.handle.send_bash_command(TRACK, "ls").await.unwrap();

    let errored = timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(Event::CommandResult { command, .. }) = track_events.recv().await {
                if command.status != CommandStatus::Running {
                    return command;
                }
            }
        }
    })
    .await
    .expect("no command result");
    assert_eq!(errored.status, CommandStatus::Error);
    assert!(errored.error.unwrap().contains("exec subsystem down"));
}

#[tokio::test]
async fn dead_console_respawns_on_a_fresh_token() {
    let harness = spawn_container();
    let mut track_events = harness.bus.subscribe(&Topic::Track(TRACK));
    harness.handle.start().await.unwrap();
    harness.handle.register_console(TRACK).await;
    wait_for_console_status(&mut track_events, ConsoleStatus::Ready).await;
    let logins_before = harness.rpc.login_count();

    // An expired token kills the write and the actor with it.
    harness
        .rpc
        .fail_next_write(redlab_domain::RpcError::Auth("token expired".into()));
    let err = harness.handle.send_msf_command(TRACK, "db_status").await.unwrap_err();
    assert!(matches!(err, ConsoleError::WriteFailed(_)));

    // The parent synthesizes offline, then respawns after backoff.
    wait_for_console_status(&mut track_events, ConsoleStatus::Offline).await;
    wait_for_console_status(&mut track_events, ConsoleStatus::Ready).await;

    // Respawn reauthenticated rather than reusing the stale token.
    assert!(harness.rpc.login_count() > logins_before);
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.consoles[0].alive);
}

#[tokio::test]
async fn stop_terminates_children_and_goes_offline() {
    let harness = spawn_container();
    let mut track_events = harness.bus.subscribe(&Topic::Track(TRACK));
    harness.handle.start().await.unwrap();
    harness.handle.register_console(TRACK).await;
    wait_for_console_status(&mut track_events, ConsoleStatus::Ready).await;

    harness.handle.stop().await;
    assert_eq!(harness.handle.status().await, ContainerStatus::Offline);
    assert_eq!(harness.runtime.running_count(), 0);

    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.consoles.iter().all(|c| !c.alive));
    assert!(snapshot.rpc_endpoint.is_none());
}

#[tokio::test]
async fn adopt_running_container_skips_creation() {
    let harness = spawn_container();
    harness.runtime.seed_container(
        "existing-1",
        redlab_docker::build_labels(ContainerId(7), "acme", "msf-1", 50123),
        true,
    );

    harness
        .handle
        .adopt_docker_container("existing-1".into())
        .await
        .unwrap();
    assert_eq!(harness.handle.status().await, ContainerStatus::Running);
    // Adoption never created a second container.
    assert_eq!(harness.runtime.running_count(), 1);
}

#[tokio::test]
async fn adopt_dead_container_fails() {
    let harness = spawn_container();
    harness.runtime.seed_container(
        "existing-1",
        redlab_docker::build_labels(ContainerId(7), "acme", "msf-1", 50123),
        false,
    );

    assert!(harness
        .handle
        .adopt_docker_container("existing-1".into())
        .await
        .is_err());
    assert_eq!(harness.handle.status().await, ContainerStatus::Offline);
}

#[tokio::test]
async fn supervisor_ensure_container_is_idempotent() {
    let runtime = MockRuntime::new();
    let rpc = MockRpc::new();
    let bus = Arc::new(EventBus::new());
    let supervisor = Supervisor::new(
        runtime,
        rpc,
        bus,
        Arc::new(NullTraceSink),
        test_config(),
    );

    let spec = ContainerSpec {
        container_id: ContainerId(7),
        workspace_id: WorkspaceId(1),
        workspace_slug: "acme".into(),
        container_slug: "msf-1".into(),
    };
    let first = supervisor.ensure_container(spec.clone());
    let second = supervisor.ensure_container(spec);
    first.start().await.unwrap();

    // Both handles reach the same actor.
    assert_eq!(second.status().await, ContainerStatus::Running);
    assert_eq!(supervisor.container_ids(), vec![ContainerId(7)]);

    supervisor.stop_all().await;
    assert_eq!(first.status().await, ContainerStatus::Offline);
}
