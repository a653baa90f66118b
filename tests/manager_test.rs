use node_cpu_manager::runtime::{ContainerRuntime, RunningContainer};
use node_cpu_manager::state::{CheckpointState, FileCheckpointStore};
use node_cpu_manager::topology::presets::topology_for_preset;
use node_cpu_manager::{
    AlignmentClass, Container, CpuManager, CpuManagerError, CpuManagerMetrics, CpuSet, CpuTopology, NoAffinity, Pod,
    Policy, StaticPolicy, StaticPolicyOptions,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeRuntime {
    applied: Mutex<Vec<(String, CpuSet)>>,
}

impl ContainerRuntime for FakeRuntime {
    fn update_container_cpus(&self, container: &RunningContainer, cpus: &CpuSet) -> node_cpu_manager::Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push((container.container_id.clone(), cpus.clone()));
        Ok(())
    }

    fn refresh_container(&self, _container: &mut RunningContainer) -> bool {
        true
    }
}

fn open_manager(preset: &str, state_file: &Path, runtime: Arc<FakeRuntime>) -> node_cpu_manager::Result<CpuManager> {
    let topology: Arc<CpuTopology> = Arc::new(topology_for_preset(preset)?);
    let metrics = Arc::new(CpuManagerMetrics::new());
    let policy = StaticPolicy::new(
        topology.clone(),
        2,
        CpuSet::new(),
        Arc::new(NoAffinity),
        StaticPolicyOptions::default(),
        metrics.clone(),
    )?;
    let state = CheckpointState::new(
        Box::new(FileCheckpointStore::new(state_file)),
        policy.name(),
        topology.fingerprint(),
    )?;
    CpuManager::new(
        Arc::new(policy),
        Box::new(state),
        runtime,
        metrics,
        Duration::from_secs(1),
    )
}

#[tokio::test]
async fn test_assignments_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cpu_manager_state");
    let pod = Pod::guaranteed("pod", vec![Container::new("app", 4)]);

    let cpus = {
        let m = open_manager("dual-socket-ht", &path, Arc::new(FakeRuntime::default())).unwrap();
        m.allocate(&pod, &pod.containers[0]).await.unwrap();
        assert_eq!(m.metrics().aligned_count(AlignmentClass::PhysicalCpu), 1);
        m.get_exclusive_cpus("pod", "app").await.unwrap()
    };

    let runtime = Arc::new(FakeRuntime::default());
    let m = open_manager("dual-socket-ht", &path, runtime.clone()).unwrap();
    assert_eq!(m.get_exclusive_cpus("pod", "app").await, Some(cpus.clone()));
    assert_eq!(m.get_allocatable_cpus().await.len(), 10);

    // a restarted container is pinned back onto the same cpus
    m.add_container(&pod, &pod.containers[0], "c1", vec![42]).await.unwrap();
    assert_eq!(runtime.applied.lock().unwrap().clone(), vec![("c1".to_string(), cpus)]);
}

#[tokio::test]
async fn test_reconcile_after_restart_keeps_restored_assignments() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cpu_manager_state");
    let pod = Pod::guaranteed("pod", vec![Container::new("app", 2)]);
    let cpus = {
        let m = open_manager("dual-socket-ht", &path, Arc::new(FakeRuntime::default())).unwrap();
        m.allocate(&pod, &pod.containers[0]).await.unwrap();
        m.get_exclusive_cpus("pod", "app").await.unwrap()
    };

    let m = open_manager("dual-socket-ht", &path, Arc::new(FakeRuntime::default())).unwrap();
    let report = m.reconcile_state().await;
    assert!(report.stale_removed.is_empty(), "{report:?}");
    assert_eq!(m.get_exclusive_cpus("pod", "app").await, Some(cpus.clone()));

    // and the checkpoint on disk still holds it
    drop(m);
    let m = open_manager("dual-socket-ht", &path, Arc::new(FakeRuntime::default())).unwrap();
    assert_eq!(m.get_exclusive_cpus("pod", "app").await, Some(cpus.clone()));

    // once the pod is torn down the restored entry is gone for good
    m.remove_container("pod", "app").await.unwrap();
    assert!(m.reconcile_state().await.stale_removed.is_empty());
    assert_eq!(m.get_allocatable_cpus().await.len(), 14);
}

#[tokio::test]
async fn test_restart_on_other_hardware_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cpu_manager_state");
    {
        let m = open_manager("single-socket-ht", &path, Arc::new(FakeRuntime::default())).unwrap();
        let pod = Pod::guaranteed("pod", vec![Container::new("app", 2)]);
        m.allocate(&pod, &pod.containers[0]).await.unwrap();
    }

    let err = open_manager("dual-socket-ht", &path, Arc::new(FakeRuntime::default()))
        .err()
        .unwrap();
    assert!(matches!(err, CpuManagerError::IncompatibleTopology(_)), "{err}");
}

#[tokio::test]
async fn test_hints_through_manager_do_not_allocate() {
    let dir = tempfile::tempdir().unwrap();
    let m = open_manager("dual-socket-ht", &dir.path().join("state"), Arc::new(FakeRuntime::default())).unwrap();
    let pod = Pod::guaranteed("pod", vec![Container::new("app", 4)]);

    let before = m.get_allocatable_cpus().await;
    let hints = m.get_topology_hints(&pod, &pod.containers[0]).await.unwrap().unwrap();
    assert!(hints.iter().any(|h| h.preferred && h.numa_affinity.count() == 1));
    let pod_hints = m.get_pod_topology_hints(&pod).await.unwrap().unwrap();
    assert_eq!(pod_hints.len(), hints.len());

    assert_eq!(m.get_allocatable_cpus().await, before);
    assert_eq!(m.get_exclusive_cpus("pod", "app").await, None);
}

#[tokio::test]
async fn test_concurrent_allocations_stay_disjoint() {
    let dir = tempfile::tempdir().unwrap();
    let m = Arc::new(open_manager("dual-socket-multi-numa-ht", &dir.path().join("state"), Arc::new(FakeRuntime::default())).unwrap());

    let mut tasks = Vec::new();
    for i in 0..10 {
        let m = Arc::clone(&m);
        tasks.push(tokio::spawn(async move {
            let pod = Pod::guaranteed(format!("pod-{i}"), vec![Container::new("app", 3)]);
            m.allocate(&pod, &pod.containers[0]).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut seen = CpuSet::new();
    for i in 0..10 {
        let cpus = m.get_exclusive_cpus(&format!("pod-{i}"), "app").await.unwrap();
        assert_eq!(cpus.len(), 3);
        assert!(cpus.is_disjoint(&seen));
        seen = seen.union(&cpus);
    }
    assert_eq!(m.get_allocatable_cpus().await.len(), 32 - 2 - 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconcile_never_releases_fresh_allocations() {
    let dir = tempfile::tempdir().unwrap();
    let m = Arc::new(open_manager("dual-socket-multi-numa-ht", &dir.path().join("state"), Arc::new(FakeRuntime::default())).unwrap());

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reconciler = {
        let m = Arc::clone(&m);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut released = 0;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                released += m.reconcile_state().await.stale_removed.len();
                tokio::task::yield_now().await;
            }
            released
        })
    };

    for round in 0..100 {
        let mut tasks = Vec::new();
        for i in 0..8 {
            let m = Arc::clone(&m);
            tasks.push(tokio::spawn(async move {
                let pod = Pod::guaranteed(format!("pod-{round}-{i}"), vec![Container::new("app", 2)]);
                m.allocate(&pod, &pod.containers[0]).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        for i in 0..8 {
            let uid = format!("pod-{round}-{i}");
            assert!(m.get_exclusive_cpus(&uid, "app").await.is_some(), "{uid} lost its cpus");
            m.remove_container(&uid, "app").await.unwrap();
        }
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    assert_eq!(reconciler.await.unwrap(), 0);
    assert_eq!(m.get_allocatable_cpus().await.len(), 30);
}
