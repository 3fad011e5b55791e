//! End-to-end lifecycle scenarios against the simulated engine.

use std::sync::{Arc, Barrier};
use std::thread;
use uvmhost_core::{
    CoreError, CreateRequest, HostConfig, HostedContainer, HostingVm, LayerSet,
    LifecycleOrchestrator, Phase,
};
use uvmhost_vm::{LifecycleState, ResourceLimits, SimulatedEngine};

const GIB: u64 = 1024 * 1024 * 1024;

fn orchestrator(bus_capacity: usize) -> (Arc<SimulatedEngine>, Arc<LifecycleOrchestrator>) {
    let engine = Arc::new(SimulatedEngine::new());
    let config = HostConfig::builder().bus_capacity(bus_capacity).build().unwrap();
    let orch = LifecycleOrchestrator::new(config, engine.clone()).unwrap();
    (engine, Arc::new(orch))
}

fn running_uvm(orch: &LifecycleOrchestrator, id: &str) -> HostingVm {
    let boot = LayerSet::with_scratch(["/layers/base"], format!("/scratch/{}", id)).unwrap();
    let mut vm = orch
        .vms()
        .create(boot, ResourceLimits::new(GIB, 2), Some(id.to_string()))
        .unwrap();
    orch.vms().start(&mut vm).unwrap();
    vm
}

fn hosted(orch: &LifecycleOrchestrator, vm: &str, id: &str) -> Result<HostedContainer, CoreError> {
    let scratch = format!("/scratch/{}", id);
    orch.containers().create(
        &CreateRequest::new()
            .id(id)
            .hosted_in(vm)
            .layer_folders(["/layers/base", "/layers/app", scratch.as_str()]),
    )
}

/// VM [base]+S0, container [base, app]+S1, then tear both down in order
#[test]
fn test_basic_scenario() {
    let (engine, orch) = orchestrator(64);

    let boot = LayerSet::with_scratch(["base"], "S0").unwrap();
    let mut vm = orch
        .vms()
        .create(boot, ResourceLimits::new(GIB, 2), Some("uvm".into()))
        .unwrap();
    assert_eq!(vm.state(), LifecycleState::Created);
    orch.vms().start(&mut vm).unwrap();
    assert_eq!(vm.state(), LifecycleState::Running);

    let mut container = orch
        .containers()
        .create(
            &CreateRequest::new()
                .id("c1")
                .hosted_in("uvm")
                .layer_folders(["base", "app", "S1"]),
        )
        .unwrap();
    assert_eq!(container.state(), LifecycleState::Created);
    assert_eq!(orch.mounts().ref_count("uvm", container.layers()), 1);

    orch.containers().terminate(&mut container).unwrap();
    assert_eq!(container.state(), LifecycleState::Terminated);
    assert_eq!(orch.mounts().ref_count("uvm", container.layers()), 0);
    assert_eq!(orch.mounts().snapshot("uvm").unwrap().records, 1);

    orch.vms().terminate(&mut vm).unwrap();
    assert_eq!(vm.state(), LifecycleState::Terminated);
    assert_eq!(engine.running_count(), 0);
    assert!(engine.attachments("uvm").is_empty());
}

/// A running container answers commands through the command channel
#[test]
fn test_run_command_in_container() {
    let (engine, orch) = orchestrator(64);
    let mut vm = running_uvm(&orch, "uvm");
    let mut container = hosted(&orch, "uvm", "c1").unwrap();

    assert!(matches!(
        container.run(&*engine, "echo early", "/"),
        Err(CoreError::InvalidState { phase: Phase::Exec, .. })
    ));

    orch.containers().start(&mut container).unwrap();
    let out = container
        .run(&*engine, "cmd /s /c echo Hello", r"c:\")
        .unwrap();
    assert_eq!(out.stdout.trim(), "Hello");
    assert_eq!(out.exit_code, 0);

    orch.teardown_all(&mut vm).unwrap();
}

/// The VM refuses to terminate while it hosts a live container
#[test]
fn test_host_busy_until_containers_terminated() {
    let (_engine, orch) = orchestrator(64);
    let mut vm = running_uvm(&orch, "uvm");
    let mut a = hosted(&orch, "uvm", "a").unwrap();
    let mut b = hosted(&orch, "uvm", "b").unwrap();
    orch.containers().start(&mut a).unwrap();

    match orch.vms().terminate(&mut vm) {
        Err(CoreError::HostBusy { vm: id, hosted }) => {
            assert_eq!(id, "uvm");
            assert_eq!(hosted, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("expected HostBusy, got {other:?}"),
    }
    assert_eq!(vm.state(), LifecycleState::Running);

    orch.containers().terminate(&mut a).unwrap();
    assert!(matches!(
        orch.vms().terminate(&mut vm),
        Err(CoreError::HostBusy { .. })
    ));

    orch.containers().terminate(&mut b).unwrap();
    orch.vms().terminate(&mut vm).unwrap();
    assert_eq!(vm.state(), LifecycleState::Terminated);

    // Late creations against the terminated VM are refused
    assert!(matches!(
        hosted(&orch, "uvm", "late"),
        Err(CoreError::HostNotFound { .. })
    ));
}

/// 64 containers fit a bus with 64 free slots; the 65th does not
#[test]
fn test_bus_capacity_stress() {
    // One slot goes to the VM's own boot scratch
    let (_engine, orch) = orchestrator(65);
    let mut vm = running_uvm(&orch, "uvm");
    assert_eq!(orch.mounts().slots_in_use("uvm"), Some(1));

    let mut containers: Vec<HostedContainer> = (0..64)
        .map(|i| hosted(&orch, "uvm", &format!("c{}", i)).unwrap())
        .collect();
    assert_eq!(orch.hosted_containers("uvm").len(), 64);

    let err = hosted(&orch, "uvm", "c64").unwrap_err();
    assert!(matches!(
        err,
        CoreError::CapacityExceeded { ref vm, needed: 1, free: 0, capacity: 65 } if vm == "uvm"
    ));
    assert_eq!(orch.hosted_containers("uvm").len(), 64);
    assert_eq!(orch.mounts().slots_in_use("uvm"), Some(65));

    // Existing containers are unaffected and still start
    orch.containers().start(&mut containers[0]).unwrap();

    // Freeing one slot admits the excess container
    orch.containers().terminate(&mut containers[1]).unwrap();
    containers.push(hosted(&orch, "uvm", "c64").unwrap());

    orch.teardown_all(&mut vm).unwrap();
    assert!(containers.iter().all(|c| c.state() == LifecycleState::Terminated));
}

/// Teardown keeps going past failures and reports them together
#[test]
fn test_teardown_all_fail_forward() {
    let (engine, orch) = orchestrator(64);
    let mut vm = running_uvm(&orch, "uvm");
    let mut containers: Vec<HostedContainer> = ["c1", "c2", "c3"]
        .iter()
        .map(|id| hosted(&orch, "uvm", id).unwrap())
        .collect();
    for c in &mut containers {
        orch.containers().start(c).unwrap();
    }

    engine.fail_shutdown_of("c2");
    engine.fail_detach_of("/scratch/c3");

    match orch.teardown_all(&mut vm) {
        Err(CoreError::Teardown { id, failures }) => {
            assert_eq!(id, "uvm");
            assert_eq!(failures.len(), 2);
            assert_eq!(failures[0].id(), "c2");
            assert_eq!(failures[0].phase(), Phase::Terminate);
            assert_eq!(failures[1].phase(), Phase::Unmount);
        }
        other => panic!("expected Teardown, got {other:?}"),
    }

    assert!(containers.iter().all(|c| c.state() == LifecycleState::Terminated));
    assert_eq!(vm.state(), LifecycleState::Terminated);
    assert!(!orch.mounts().is_registered("uvm"));

    // Caller-side terminate after teardown is a no-op
    for c in &mut containers {
        orch.containers().terminate(c).unwrap();
    }
}

/// A failed creation leaves slot accounting as it was
#[test]
fn test_failed_creation_rolls_back() {
    let (engine, orch) = orchestrator(64);
    let mut vm = running_uvm(&orch, "uvm");
    let _keep = hosted(&orch, "uvm", "keep").unwrap();
    let before = orch.mounts().snapshot("uvm").unwrap();

    engine.fail_attach_of("/scratch/c1");
    assert!(matches!(
        hosted(&orch, "uvm", "c1"),
        Err(CoreError::Engine { phase: Phase::Mount, .. })
    ));
    assert_eq!(orch.mounts().snapshot("uvm").unwrap(), before);
    assert_eq!(orch.hosted_containers("uvm"), vec!["keep".to_string()]);

    // The identity was released with the rollback
    engine.clear_failures();
    hosted(&orch, "uvm", "c1").unwrap();

    orch.teardown_all(&mut vm).unwrap();
}

/// Dropping a container keeps its claim until the hosting VM is torn down
#[test]
fn test_dropped_container_stays_registered() {
    let (engine, orch) = orchestrator(64);
    let mut vm = running_uvm(&orch, "uvm");
    let mut c = hosted(&orch, "uvm", "c1").unwrap();
    orch.containers().start(&mut c).unwrap();
    drop(c);

    assert_eq!(orch.hosted_containers("uvm"), vec!["c1".to_string()]);
    assert!(matches!(
        hosted(&orch, "uvm", "c1"),
        Err(CoreError::Configuration { .. })
    ));

    orch.teardown_all(&mut vm).unwrap();
    assert!(orch.hosted_containers("uvm").is_empty());
    assert_eq!(engine.running_count(), 0);

    // The identity is free again
    let mut vm = running_uvm(&orch, "uvm2");
    let mut c = hosted(&orch, "uvm2", "c1").unwrap();
    orch.containers().terminate(&mut c).unwrap();
    orch.teardown_all(&mut vm).unwrap();
}

/// VM termination never races container creation on that VM
#[test]
fn test_terminate_excludes_concurrent_creation() {
    const CREATORS: usize = 8;
    let (_engine, orch) = orchestrator(64);
    let mut vm = running_uvm(&orch, "uvm");
    let barrier = Arc::new(Barrier::new(CREATORS + 1));

    let handles: Vec<_> = (0..CREATORS)
        .map(|i| {
            let orch = orch.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                hosted(&orch, "uvm", &format!("c{}", i))
            })
        })
        .collect();

    barrier.wait();
    let terminated = orch.vms().terminate(&mut vm);
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let created = results.iter().filter(|r| r.is_ok()).count();
    match terminated {
        Ok(()) => {
            assert_eq!(created, 0);
            assert!(results
                .iter()
                .all(|r| matches!(r, Err(CoreError::HostNotFound { .. }))));
        }
        Err(CoreError::HostBusy { hosted, .. }) => {
            assert!(created >= hosted.len());
            assert!(!hosted.is_empty());
        }
        Err(other) => panic!("unexpected terminate error: {other:?}"),
    }
}

/// Split requests with the marker create hosting VMs through create_ex
#[test]
fn test_create_ex_round() {
    let (_engine, orch) = orchestrator(64);
    let mut vm = orch
        .create_ex(
            &CreateRequest::new()
                .id("uvm")
                .owner("ci")
                .utility_vm()
                .layer_folders(["/layers/base", "/scratch/uvm"]),
        )
        .unwrap()
        .into_utility_vm()
        .unwrap();
    assert_eq!(vm.machine().config().owner.as_deref(), Some("ci"));
    orch.vms().start(&mut vm).unwrap();

    let created = orch
        .create_ex(
            &CreateRequest::new()
                .schema("2.0")
                .hosted_in("uvm")
                .layer_folders(["/layers/base", "/scratch/anon"]),
        )
        .unwrap();
    // Generated identity
    assert_eq!(created.id().len(), 36);
    assert!(created.into_container().is_some());

    let err = orch
        .create_ex(&CreateRequest::new().schema("1.0").hosted_in("uvm"))
        .unwrap_err();
    assert!(matches!(err, CoreError::Configuration { .. }));

    orch.teardown_all(&mut vm).unwrap();
}
