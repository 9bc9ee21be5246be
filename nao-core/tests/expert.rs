use nao_core::{
    error::DatasetError,
    expert::{
        DatasetOptions, ExpertDataset, ExpertTrajectories, Split, TrajectoryLimit,
        generate_expert_traj,
    },
    rng::set_seed,
    test_utils::{EnvCounters, TargetEnv},
};
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

#[derive(Serialize, Deserialize)]
struct Wrapper {
    limit: TrajectoryLimit,
}

#[test]
fn trajectory_limit_sentinel() {
    let all: Wrapper = toml::from_str("limit = -1").unwrap();
    assert_eq!(all.limit, TrajectoryLimit::All);
    let some: Wrapper = toml::from_str("limit = 3").unwrap();
    assert_eq!(some.limit, TrajectoryLimit::Limit(3));
    assert!(toml::from_str::<Wrapper>("limit = -2").is_err());
    let written = toml::to_string(&Wrapper {
        limit: TrajectoryLimit::All,
    })
    .unwrap();
    assert_eq!(written.trim(), "limit = -1");
}

#[test]
fn recorded_episodes_round_trip_through_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("walk.traj");
    let mut env = TargetEnv::new(5, EnvCounters::default());
    let recorded = generate_expert_traj(&mut env, &path, 3, 11).unwrap();
    assert_eq!(recorded.len(), 15);
    assert_eq!(recorded.num_episodes(), 3);
    assert_eq!(recorded.episode_returns.len(), 3);
    // the expert action is the target, so the reward is maximal
    assert!(recorded.rewards.iter().all(|r| *r == 0.));
    assert_eq!(ExpertTrajectories::load(&path).unwrap(), recorded);
}

#[test]
fn absent_dataset_is_not_found() {
    let dir = tempdir().unwrap();
    let err = ExpertDataset::load(&dir.path().join("missing.traj"), DatasetOptions::default())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DatasetError>(),
        Some(DatasetError::NotFound(_))
    ));
}

#[test]
fn empty_dataset_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.traj");
    ExpertTrajectories::default().save(&path).unwrap();
    let err = ExpertDataset::load(&path, DatasetOptions::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DatasetError>(),
        Some(DatasetError::Empty(_))
    ));
}

#[test]
fn zero_trajectory_limit_leaves_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("walk.traj");
    generate_expert_traj(&mut TargetEnv::new(4, EnvCounters::default()), &path, 2, 0).unwrap();
    let options = DatasetOptions {
        traj_limit: TrajectoryLimit::Limit(0),
        ..Default::default()
    };
    let err = ExpertDataset::load(&path, options).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DatasetError>(),
        Some(DatasetError::Empty(_))
    ));
}

#[test]
fn garbage_file_is_malformed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.traj");
    std::fs::write(&path, b"not a dataset").unwrap();
    let err = ExpertDataset::load(&path, DatasetOptions::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DatasetError>(),
        Some(DatasetError::Malformed { .. })
    ));
}

#[test]
fn limit_keeps_leading_episodes_and_splits() {
    set_seed(5);
    let dir = tempdir().unwrap();
    let path = dir.path().join("walk.traj");
    generate_expert_traj(&mut TargetEnv::new(10, EnvCounters::default()), &path, 4, 0).unwrap();

    let options = DatasetOptions {
        traj_limit: TrajectoryLimit::Limit(2),
        train_fraction: 0.5,
        batch_size: 3,
        randomize: true,
    };
    let dataset = ExpertDataset::load(&path, options).unwrap();
    assert_eq!(dataset.trajectories().len(), 20);
    assert_eq!(dataset.trajectories().episode_returns.len(), 2);
    assert_eq!(dataset.len(Split::Train), 10);
    assert_eq!(dataset.len(Split::Validation), 10);
    let batches = dataset.batches(Split::Train);
    assert_eq!(batches.len(), 4);
    assert_eq!(batches.iter().map(|b| b.actions.len()).sum::<usize>(), 10);

    let all = ExpertDataset::load(&path, DatasetOptions::default()).unwrap();
    assert_eq!(all.trajectories().len(), 40);
    assert_eq!(all.sample(8).observations.len(), 8);
}

#[test]
fn sampling_draws_distinct_training_transitions() {
    set_seed(9);
    let dir = tempdir().unwrap();
    let path = dir.path().join("walk.traj");
    generate_expert_traj(&mut TargetEnv::new(5, EnvCounters::default()), &path, 2, 0).unwrap();
    let options = DatasetOptions {
        train_fraction: 0.6,
        ..Default::default()
    };
    let dataset = ExpertDataset::load(&path, options).unwrap();
    assert_eq!(dataset.len(Split::Train), 6);

    // asking for more than the training split yields the whole split once
    let batch = dataset.sample(64);
    assert_eq!(batch.observations.len(), 6);
    assert_eq!(batch.actions.len(), 6);
    let mut seen: Vec<Vec<f32>> = batch.observations.iter().map(|o| o.data.clone()).collect();
    seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
    seen.dedup();
    assert_eq!(seen.len(), 6);
}
