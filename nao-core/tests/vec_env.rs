use nao_core::{
    agents::NoHooks,
    cancel::CancellationToken,
    env::Env,
    error::IpcError,
    sampler::{Collected, StepBoundSampler},
    tensor::Buffer,
    test_utils::{ACTION_SIZE, EnvCounters, TargetEnv},
    vec_env::{DummyVecEnv, SubprocOptions, SubprocVecEnv, VecEnv, worker_seed},
};
use std::{
    collections::HashSet,
    path::PathBuf,
    time::{Duration, Instant},
};

fn pool(num_envs: usize, base_seed: u64, episode_len: usize) -> (DummyVecEnv<TargetEnv>, EnvCounters) {
    let counters = EnvCounters::default();
    let envs = (0..num_envs)
        .map(|_| TargetEnv::new(episode_len, counters.clone()))
        .collect();
    (DummyVecEnv::new(envs, base_seed).unwrap(), counters)
}

#[test]
fn workers_are_seeded_consecutively() {
    let base_seed = 1_000;
    let (mut env, counters) = pool(8, base_seed, 10);
    let expected: Vec<u64> = (0..8).map(|r| base_seed + r).collect();
    assert_eq!(env.seeds(), expected);
    env.reset().unwrap();
    let seeds: HashSet<u64> = counters.reset_seeds().into_iter().collect();
    assert_eq!(seeds.len(), 8);
    assert_eq!(seeds, expected.into_iter().collect());
}

#[test]
fn worker_seed_wraps_instead_of_overflowing() {
    assert_eq!(worker_seed(u64::MAX, 1), 0);
}

#[test]
fn finished_episodes_are_reset_automatically() {
    let (mut env, counters) = pool(2, 3, 2);
    let first = env.reset().unwrap();
    let actions = vec![Buffer::zeros(ACTION_SIZE); 2];
    let step = env.step(actions.clone()).unwrap();
    assert!(step.iter().all(|t| !t.done() && t.terminal_state.is_none()));
    let step = env.step(actions).unwrap();
    for transition in &step {
        assert!(transition.truncated);
        assert!(transition.terminal_state.is_some());
    }
    // initial reset of two workers plus one reset each after the episode ended
    assert_eq!(counters.reset_seeds().len(), 4);
    assert_ne!(step[0].state, first[0]);
}

#[test]
fn reseeding_is_reproducible() {
    let run = || {
        let (mut env, counters) = pool(2, 42, 1);
        env.reset().unwrap();
        for _ in 0..3 {
            env.step(vec![Buffer::zeros(ACTION_SIZE); 2]).unwrap();
        }
        counters.reset_seeds()
    };
    assert_eq!(run(), run());
}

#[test]
fn close_is_idempotent_and_blocks_stepping() {
    let (mut env, counters) = pool(3, 0, 5);
    env.reset().unwrap();
    env.close().unwrap();
    env.close().unwrap();
    assert!(env.is_closed());
    assert_eq!(counters.closes(), 3);
    let err = env.step(vec![Buffer::zeros(ACTION_SIZE); 3]).unwrap_err();
    assert!(matches!(err.downcast_ref::<IpcError>(), Some(IpcError::Closed)));
}

#[test]
fn wrong_number_of_actions_is_rejected() {
    let (mut env, _) = pool(2, 0, 5);
    env.reset().unwrap();
    assert!(env.step(vec![Buffer::zeros(ACTION_SIZE)]).is_err());
}

#[test]
fn sampler_collects_bootstrapped_rollouts() {
    let (mut env, _) = pool(2, 0, 3);
    let mut sampler = StepBoundSampler::new();
    let collected = sampler
        .collect(&mut env, 5, &NoHooks, |obs| {
            Ok(obs.iter().map(|_| (Buffer::zeros(ACTION_SIZE), 0.)).collect())
        })
        .unwrap();
    let Collected::Rollouts(rollouts) = collected else {
        panic!("sampling was not cancelled");
    };
    assert_eq!(rollouts.len(), 2);
    for rollout in &rollouts {
        assert_eq!(rollout.len(), 5);
        assert_eq!(rollout.states.len(), 6);
        assert_eq!(rollout.dones.iter().filter(|d| **d).count(), 1);
    }
    assert_eq!(sampler.tracker.total_episodes(), 2);
}

#[test]
fn sampler_stops_when_cancelled() {
    let (mut env, counters) = pool(1, 0, 3);
    let token = CancellationToken::new();
    token.cancel();
    let mut sampler = StepBoundSampler::new();
    let collected = sampler
        .collect(&mut env, 5, &token, |obs| {
            Ok(obs.iter().map(|_| (Buffer::zeros(ACTION_SIZE), 0.)).collect())
        })
        .unwrap();
    assert!(matches!(collected, Collected::Interrupted));
    assert_eq!(counters.steps(), 0);
}

#[test]
fn boxed_env_forwards_close() {
    let counters = EnvCounters::default();
    let mut env: Box<dyn Env + Send> = Box::new(TargetEnv::new(4, counters.clone()));
    env.close().unwrap();
    env.close().unwrap();
    assert_eq!(counters.closes(), 1);
}

fn subproc_options(worker: &str) -> SubprocOptions {
    SubprocOptions {
        worker: PathBuf::from(worker),
        env_id: "NaoEnv".to_owned(),
        num_envs: 2,
        base_seed: 0,
        gui: false,
        connect_timeout: Duration::from_secs(30),
    }
}

#[cfg(unix)]
#[test]
fn worker_exiting_before_connecting_fails_the_spawn() {
    let started = Instant::now();
    let Err(err) = SubprocVecEnv::spawn(&subproc_options("true")) else {
        panic!("a worker that never connects produced a pool");
    };
    assert!(matches!(
        err.downcast_ref::<IpcError>(),
        Some(IpcError::WorkerSpawn { rank: 0, reason }) if reason.contains("before connecting")
    ));
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[test]
fn missing_worker_binary_fails_the_spawn() {
    let Err(err) = SubprocVecEnv::spawn(&subproc_options("./no-such-nao-worker")) else {
        panic!("spawned a pool without a worker binary");
    };
    assert!(matches!(
        err.downcast_ref::<IpcError>(),
        Some(IpcError::WorkerSpawn { rank: 0, .. })
    ));
}
