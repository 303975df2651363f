//! Accelerator pod model.

use std::sync::atomic::{AtomicUsize, Ordering};

use haagenti_dist::{Buffer, DistError, LaunchConfig, Value};

#[test]
fn test_spawn_four_cores() {
    let finished = AtomicUsize::new(0);

    haagenti_dist::spawn(
        "xla-tpu",
        |local_rank, scale: f64| -> haagenti_dist::Result<()> {
            assert_eq!(haagenti_dist::model_name()?, "xla-dist");
            assert_eq!(haagenti_dist::backend()?.as_deref(), Some("xla-tpu"));
            assert_eq!(haagenti_dist::device()?.to_string(), format!("xla:{}", local_rank));
            assert_eq!(haagenti_dist::get_world_size()?, 4);
            assert_eq!(haagenti_dist::get_num_nodes()?, 1);
            assert_eq!(haagenti_dist::get_node_rank()?, 0);

            let total = haagenti_dist::all_reduce(1, "SUM")?;
            assert_eq!(total, Value::Scalar(4.0));

            let data: Vec<f64> = (0..10).map(|i| scale * (i + local_rank) as f64).collect();
            let reduced = haagenti_dist::all_reduce(data, "MIN")?;
            let expected: Vec<f64> = (0..10).map(|i| scale * i as f64).collect();
            assert_eq!(reduced.as_buffer().unwrap().data(), &expected[..]);

            let gathered = haagenti_dist::all_gather(Buffer::from_vec(vec![local_rank as f64]))?;
            assert_eq!(gathered.data(), &[0.0, 1.0, 2.0, 3.0]);

            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        0.5,
        4,
        &LaunchConfig::default(),
    )
    .unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 4);
    assert!(!haagenti_dist::pod::is_active());
}

#[test]
fn test_pod_rejects_multi_node() {
    let config = LaunchConfig::default().with_num_nodes(2).with_node_rank(1);
    let err = haagenti_dist::spawn(
        "xla-tpu",
        |_, ()| -> haagenti_dist::Result<()> { Ok(()) },
        (),
        2,
        &config,
    )
    .unwrap_err();
    assert!(matches!(err, DistError::InvalidConfig(_)));
}

#[test]
fn test_pod_worker_panic_is_reported() {
    let err = haagenti_dist::spawn(
        "xla-tpu",
        |local_rank, ()| -> haagenti_dist::Result<()> {
            if local_rank == 1 {
                panic!("core fault");
            }
            Ok(())
        },
        (),
        2,
        &LaunchConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, DistError::WorkerPanicked { local_rank: 1, .. }));
}

#[test]
fn test_initialize_single_core() {
    haagenti_dist::initialize("xla-tpu", &LaunchConfig::default()).unwrap();
    assert_eq!(haagenti_dist::model_name().unwrap(), "xla-dist");
    assert_eq!(haagenti_dist::get_world_size().unwrap(), 1);
    assert!(haagenti_dist::has_pod_support());

    haagenti_dist::finalize().unwrap();
    assert_eq!(haagenti_dist::model_name().unwrap(), "serial");
    assert!(!haagenti_dist::pod::is_active());
}

#[test]
fn test_registered_models() {
    assert_eq!(
        haagenti_dist::registered_computation_models(),
        vec!["serial", "native-dist", "xla-dist"]
    );
    assert_eq!(
        haagenti_dist::available_backends(),
        vec!["nccl", "gloo", "xla-tpu"]
    );
}
