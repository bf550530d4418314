//! Интеграционные тесты солвера: обучение на данных из хранилища,
//! снапшот и продолжение обучения, iter_size.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustylayers::data::{Database, Datum, JsonDb, OpenMode, Transaction};
use rustylayers::net::NetConfig;
use rustylayers::nn::{FillerConfig, LayerConfig, LayerRegistry, Phase};
use rustylayers::optimizers::RuleKind;
use rustylayers::runtime::Context;
use rustylayers::serialization::{load_arrays, SnapshotError};
use rustylayers::solver::{Solver, SolverConfig, SolverError};
use std::path::Path;
use std::sync::Arc;

/// Три линейно разделимых класса в 4 измерениях.
fn write_dataset(path: &Path, count: usize, seed: u64) {
    let centers = [
        [1.0, 0.0, 0.0, 1.0],
        [-1.0, 1.0, 0.0, 0.0],
        [0.0, -1.0, 1.0, -1.0],
    ];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut db = JsonDb::open(path, OpenMode::New).unwrap();
    let mut txn = db.new_transaction().unwrap();
    for i in 0..count {
        let label = i % centers.len();
        let values: Vec<f32> = centers[label]
            .iter()
            .map(|&c| c + rng.gen_range(-0.2..0.2))
            .collect();
        let datum = Datum::from_floats(4, 1, 1, values, label as i32);
        txn.put(&format!("{:06}", i), datum.encode().unwrap());
    }
    txn.commit().unwrap();
}

fn data_layer(name: &str, source: &Path, phase: Phase) -> LayerConfig {
    let mut config = LayerConfig::new(name, "Data")
        .with_tops(&["data", "label"])
        .with_phase(phase);
    config.data.source = source.to_path_buf();
    config.data.batch_size = 12;
    config
}

fn classifier(train: &Path, test: &Path) -> NetConfig {
    let mut fc = LayerConfig::new("fc", "InnerProduct")
        .with_bottoms(&["data"])
        .with_tops(&["score"]);
    fc.inner_product.num_output = 3;
    fc.inner_product.weight_filler = FillerConfig::gaussian(0.0, 0.01);
    NetConfig::new("clusters")
        .with_layer(data_layer("train_data", train, Phase::Train))
        .with_layer(data_layer("test_data", test, Phase::Test))
        .with_layer(fc)
        .with_layer(
            LayerConfig::new("loss", "SoftmaxWithLoss")
                .with_bottoms(&["score", "label"])
                .with_tops(&["loss"]),
        )
        .with_layer(
            LayerConfig::new("accuracy", "Accuracy")
                .with_bottoms(&["score", "label"])
                .with_tops(&["accuracy"])
                .with_phase(Phase::Test),
        )
}

#[test]
fn test_training_reaches_high_accuracy() {
    let dir = tempfile::tempdir().unwrap();
    let train = dir.path().join("train.json");
    let test = dir.path().join("test.json");
    write_dataset(&train, 120, 1);
    write_dataset(&test, 60, 2);

    let config = SolverConfig {
        net_config: Some(classifier(&train, &test)),
        test_iter: vec![5],
        test_interval: 50,
        test_compute_loss: true,
        base_lr: 0.1,
        momentum: 0.9,
        weight_decay: 1e-4,
        lr_policy: "step".to_string(),
        gamma: 0.5,
        stepsize: 100,
        max_iter: 150,
        display: 50,
        average_loss: 10,
        snapshot_prefix: Some(dir.path().join("clusters")),
        random_seed: Some(7),
        ..SolverConfig::default()
    };
    let mut solver =
        Solver::new(config, Arc::new(Context::default()), &LayerRegistry::with_builtin()).unwrap();
    assert_eq!(solver.test_nets().len(), 1);
    solver.solve(None).unwrap();

    assert_eq!(solver.iter(), 150);
    assert_eq!(solver.current_step(), 1);
    assert!(solver.smoothed_loss() < 0.3, "loss {}", solver.smoothed_loss());

    let reports = solver.test_all().unwrap();
    let report = &reports[0];
    let accuracy = report
        .outputs
        .iter()
        .find(|(name, _)| name == "accuracy")
        .map(|(_, value)| *value)
        .unwrap();
    assert!(accuracy > 0.9, "accuracy {}", accuracy);
    assert!(report.loss.unwrap() < 0.3);

    // snapshot_after_train
    let model = dir.path().join("clusters_iter_150.model");
    let params = load_arrays(&model).unwrap();
    assert_eq!(params["fc.0"].shape(), &[4, 3]);
    assert!(dir.path().join("clusters_iter_150.state").exists());
}

fn fixed_input_net() -> NetConfig {
    let mut fc = LayerConfig::new("fc", "InnerProduct")
        .with_bottoms(&["data"])
        .with_tops(&["score"]);
    fc.inner_product.num_output = 3;
    fc.inner_product.weight_filler = FillerConfig::uniform(-0.5, 0.5);
    NetConfig::new("fixed")
        .with_input("data", &[4, 2])
        .with_input("label", &[4])
        .with_layer(fc)
        .with_layer(
            LayerConfig::new("loss", "SoftmaxWithLoss")
                .with_bottoms(&["score", "label"])
                .with_tops(&["loss"]),
        )
}

fn fixed_input_solver(config: SolverConfig, seed: u64) -> Solver {
    let ctx = Arc::new(Context::default().with_seed(seed));
    let solver = Solver::new(config, ctx, &LayerRegistry::with_builtin()).unwrap();
    let net = solver.net();
    net.tensor_by_name("data")
        .unwrap()
        .set_value(&[1.0, 0.5, -0.5, 1.0, 0.0, -1.0, 2.0, 0.25]);
    net.tensor_by_name("label")
        .unwrap()
        .set_value(&[0.0, 1.0, 2.0, 0.0]);
    solver
}

fn param_values(solver: &Solver) -> Vec<Vec<f32>> {
    solver
        .net()
        .learnable_params()
        .iter()
        .map(|p| p.value().to_vec())
        .collect()
}

#[test]
fn test_resume_matches_uninterrupted_run() {
    for kind in [RuleKind::Sgd, RuleKind::AdaDelta, RuleKind::RmsProp] {
        let dir = tempfile::tempdir().unwrap();
        let config = SolverConfig {
            net_config: Some(fixed_input_net()),
            base_lr: 0.05,
            momentum: 0.9,
            delta: 1e-6,
            lr_policy: "multistep".to_string(),
            stepvalue: vec![2, 4],
            solver_type: kind,
            snapshot: 3,
            snapshot_prefix: Some(dir.path().join("snap")),
            snapshot_diff: true,
            ..SolverConfig::default()
        };

        let mut full = fixed_input_solver(config.clone(), 11);
        full.step(6).unwrap();
        assert!(dir.path().join("snap_iter_3.state").exists());
        assert!(dir.path().join("snap_iter_6.model").exists());
        let gradients = load_arrays(dir.path().join("snap_iter_3.model")).unwrap();
        assert!(gradients.contains_key("fc.0.grad"));

        // Другой seed: начальные веса отличаются и должны быть перезаписаны.
        let mut resumed = fixed_input_solver(config, 99);
        resumed.restore(&dir.path().join("snap_iter_3.state")).unwrap();
        assert_eq!(resumed.iter(), 3);
        assert_eq!(resumed.current_step(), 1);
        resumed.step(3).unwrap();

        for (a, b) in param_values(&full).iter().zip(param_values(&resumed)) {
            for (x, y) in a.iter().zip(&b) {
                assert!((x - y).abs() < 1e-6, "{:?}: {} vs {}", kind, x, y);
            }
        }
    }
}

#[test]
fn test_restore_rejects_foreign_history() {
    let dir = tempfile::tempdir().unwrap();
    let adadelta = SolverConfig {
        net_config: Some(fixed_input_net()),
        solver_type: RuleKind::AdaDelta,
        momentum: 0.9,
        snapshot_prefix: Some(dir.path().join("ada")),
        ..SolverConfig::default()
    };
    let mut solver = fixed_input_solver(adadelta, 1);
    solver.step(1).unwrap();
    let state = solver.snapshot().unwrap().unwrap();

    let sgd = SolverConfig {
        net_config: Some(fixed_input_net()),
        ..SolverConfig::default()
    };
    let mut other = fixed_input_solver(sgd, 1);
    let err = other.restore(&state).unwrap_err();
    assert!(matches!(
        err,
        SolverError::Snapshot(SnapshotError::HistoryMismatch { stored: 2, expected: 0 })
    ));
}

#[test]
fn test_iter_size_averages_gradients() {
    let single = SolverConfig {
        net_config: Some(fixed_input_net()),
        base_lr: 0.1,
        ..SolverConfig::default()
    };
    let doubled = SolverConfig {
        iter_size: 2,
        ..single.clone()
    };
    let mut a = fixed_input_solver(single, 5);
    let mut b = fixed_input_solver(doubled, 5);
    a.step(2).unwrap();
    b.step(2).unwrap();
    for (x, y) in param_values(&a).iter().zip(param_values(&b)) {
        for (p, q) in x.iter().zip(&y) {
            assert!((p - q).abs() < 1e-6);
        }
    }
}
