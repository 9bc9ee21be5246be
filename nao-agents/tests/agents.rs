use anyhow::Result;
use candle_core::Device;
use nao_agents::{
    checkpoint::Checkpoint,
    ddpg::{DDPG, Ddpg, DdpgParams},
    gail::{GAIL, Gail, GailHooks, GailParams},
    ppo::{PPO2, Ppo, PpoParams},
};
use nao_core::{
    agents::{Agent, LearnOutcome, LearningHooks, NoHooks, PretrainOptions, RolloutStats},
    cancel::CancellationToken,
    env::{Env, EnvironmentDescription},
    error::{CheckpointError, ConfigError},
    expert::{DatasetOptions, ExpertDataset, generate_expert_traj},
    noise::OrnsteinUhlenbeckActionNoise,
    policy::PolicyNetwork,
    rng::set_seed,
    tensor::Buffer,
    test_utils::{EnvCounters, TargetEnv},
    vec_env::{VecEnv, dummy_vec_env::DummyVecEnv},
};
use std::path::Path;

#[derive(Default)]
struct Recorder {
    stats: Vec<RolloutStats>,
}

impl LearningHooks for Recorder {
    fn on_rollout_end(&mut self, stats: &RolloutStats) -> Result<bool> {
        self.stats.push(stats.clone());
        Ok(false)
    }

    fn should_stop(&self) -> bool {
        false
    }
}

fn description() -> EnvironmentDescription {
    TargetEnv::new(10, EnvCounters::default()).env_description()
}

fn small_network() -> PolicyNetwork {
    PolicyNetwork::mlp(vec![16, 16]).unwrap()
}

fn small_ppo_params() -> PpoParams {
    PpoParams {
        n_steps: 16,
        n_epochs: 2,
        ..Default::default()
    }
}

fn vec_env(num_envs: usize, counters: &EnvCounters) -> DummyVecEnv<TargetEnv> {
    let envs = (0..num_envs)
        .map(|_| TargetEnv::new(10, counters.clone()))
        .collect();
    DummyVecEnv::new(envs, 3).unwrap()
}

fn expert_dataset(dir: &Path, episodes: usize) -> ExpertDataset {
    let path = dir.join("target.traj");
    let mut env = TargetEnv::new(10, EnvCounters::default());
    generate_expert_traj(&mut env, &path, episodes, 5).unwrap();
    ExpertDataset::load(&path, DatasetOptions::default()).unwrap()
}

#[test]
fn ppo_checkpoint_restores_predictions() {
    set_seed(1);
    let dir = tempfile::tempdir().unwrap();
    let device = Device::Cpu;
    let agent = Ppo::new(&description(), &small_network(), small_ppo_params(), &device).unwrap();
    let file = agent.save(&dir.path().join("PPO2_test")).unwrap();
    assert_eq!(file, dir.path().join("PPO2_test.safetensors"));
    assert_eq!(Checkpoint::metadata(&file).unwrap().algorithm, PPO2);

    let loaded = Ppo::load(
        &dir.path().join("PPO2_test"),
        &small_network(),
        small_ppo_params(),
        &device,
        nao_agents::ppo::EmptyPpoHooks,
    )
    .unwrap();
    let observation = Buffer::from_vec(vec![0.1, -0.2, 0.3, 0.4]);
    assert_eq!(
        agent.predict(&observation, true).unwrap(),
        loaded.predict(&observation, true).unwrap()
    );
}

#[test]
fn loading_with_another_network_is_a_shape_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let device = Device::Cpu;
    let agent = Ppo::new(&description(), &small_network(), small_ppo_params(), &device).unwrap();
    let file = agent.save(&dir.path().join("PPO2_shape")).unwrap();
    let wider = PolicyNetwork::mlp(vec![32, 32]).unwrap();
    let err = Ppo::load(
        &file,
        &wider,
        small_ppo_params(),
        &device,
        nao_agents::ppo::EmptyPpoHooks,
    )
    .err()
    .unwrap();
    assert!(matches!(
        err.downcast_ref::<CheckpointError>(),
        Some(CheckpointError::ShapeMismatch { .. })
    ));
}

#[test]
fn ddpg_refuses_a_ppo_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let device = Device::Cpu;
    let agent = Ppo::new(&description(), &small_network(), small_ppo_params(), &device).unwrap();
    let file = agent.save(&dir.path().join("PPO2_algo")).unwrap();
    let err = Ddpg::load(&file, &small_network(), DdpgParams::default(), None, &device)
        .err()
        .unwrap();
    match err.downcast_ref::<CheckpointError>() {
        Some(CheckpointError::AlgorithmMismatch { expected, found }) => {
            assert_eq!(expected, DDPG);
            assert_eq!(found, PPO2);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn ppo_learns_on_vectorized_workers() {
    set_seed(2);
    let counters = EnvCounters::default();
    let mut env = vec_env(2, &counters);
    let mut agent =
        Ppo::new(&description(), &small_network(), small_ppo_params(), &Device::Cpu).unwrap();
    let mut recorder = Recorder::default();
    let outcome = agent.learn(&mut env, 64, &mut recorder).unwrap();
    assert_eq!(outcome, LearnOutcome::Completed);
    // 16 steps on each of the 2 workers per rollout
    assert_eq!(agent.num_timesteps(), 64);
    assert_eq!(counters.steps(), 64);
    assert_eq!(recorder.stats.len(), 2);
    assert_eq!(recorder.stats[1].timesteps, 64);
    assert!(recorder.stats.iter().all(|s| s.episodes == 2 || s.episodes == 4));
    let names: Vec<&str> = recorder.stats[0].losses.iter().map(|l| l.0).collect();
    assert_eq!(names, ["policy_loss", "value_loss", "std"]);
}

#[test]
fn cancelled_learning_takes_no_step() {
    let counters = EnvCounters::default();
    let mut env = vec_env(1, &counters);
    let mut agent =
        Ppo::new(&description(), &small_network(), small_ppo_params(), &Device::Cpu).unwrap();
    let mut token = CancellationToken::new();
    token.cancel();
    let outcome = agent.learn(&mut env, 1_000, &mut token).unwrap();
    assert_eq!(outcome, LearnOutcome::Interrupted);
    assert_eq!(counters.steps(), 0);
    assert_eq!(agent.num_timesteps(), 0);
}

#[test]
fn empty_rollouts_are_rejected_before_stepping() {
    let counters = EnvCounters::default();
    let mut env = vec_env(2, &counters);
    let params = PpoParams {
        n_steps: 0,
        ..small_ppo_params()
    };
    let mut agent = Ppo::new(&description(), &small_network(), params, &Device::Cpu).unwrap();
    let err = agent.learn(&mut env, 64, &mut NoHooks).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::Invalid { field: "ppo.n_steps", .. })
    ));

    let params = DdpgParams {
        nb_rollout_steps: 0,
        ..Default::default()
    };
    let mut agent =
        Ddpg::new(&description(), &small_network(), params, None, &Device::Cpu).unwrap();
    let mut env = vec_env(1, &counters);
    let err = agent.learn(&mut env, 64, &mut NoHooks).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::Invalid { field: "ddpg.nb_rollout_steps", .. })
    ));
    assert_eq!(counters.steps(), 0);
}

#[test]
fn behaviour_cloning_fits_the_expert() {
    set_seed(3);
    let dir = tempfile::tempdir().unwrap();
    let dataset = expert_dataset(dir.path(), 20);
    let mut agent =
        Ppo::new(&description(), &small_network(), small_ppo_params(), &Device::Cpu).unwrap();
    let first = agent
        .pretrain(
            &dataset,
            &PretrainOptions {
                n_epochs: 1,
                learning_rate: 1e-2,
                val_interval: 1,
            },
        )
        .unwrap();
    let later = agent
        .pretrain(
            &dataset,
            &PretrainOptions {
                n_epochs: 100,
                learning_rate: 1e-2,
                val_interval: 50,
            },
        )
        .unwrap();
    assert_eq!(later.epochs, 100);
    assert!(later.train_loss < first.train_loss);
    assert!(later.val_loss.is_some());
}

#[test]
fn ddpg_trains_on_a_single_worker_only() {
    let counters = EnvCounters::default();
    let mut agent = Ddpg::new(
        &description(),
        &small_network(),
        DdpgParams::default(),
        None,
        &Device::Cpu,
    )
    .unwrap();
    let mut env = vec_env(2, &counters);
    assert!(agent.learn(&mut env, 10, &mut NoHooks).is_err());
    assert_eq!(counters.steps(), 0);
}

#[test]
fn ddpg_learns_and_keeps_actions_in_bounds() {
    set_seed(4);
    let dir = tempfile::tempdir().unwrap();
    let counters = EnvCounters::default();
    let params = DdpgParams {
        batch_size: 32,
        buffer_size: 1_000,
        nb_rollout_steps: 20,
        nb_train_steps: 5,
        ..Default::default()
    };
    let noise = OrnsteinUhlenbeckActionNoise::isotropic(2, params.noise_sigma);
    let mut agent = Ddpg::new(
        &description(),
        &small_network(),
        params.clone(),
        Some(noise),
        &Device::Cpu,
    )
    .unwrap();
    let mut env = vec_env(1, &counters);
    let mut recorder = Recorder::default();
    agent.learn(&mut env, 60, &mut recorder).unwrap();
    assert_eq!(agent.num_timesteps(), 60);
    assert_eq!(recorder.stats.len(), 3);
    // no update before the replay buffer holds one batch
    assert_eq!(recorder.stats[0].losses[0], ("actor_loss", 0.));
    assert_ne!(recorder.stats[2].losses[1].1, 0.);

    let observation = Buffer::from_vec(vec![1., -1., 1., 1.]);
    let action = agent.predict(&observation, true).unwrap();
    assert!(action.data.iter().all(|a| (-1. ..=1.).contains(a)));

    let file = agent.save(&dir.path().join("DDPG_60")).unwrap();
    let loaded = Ddpg::load(&file, &small_network(), params, None, &Device::Cpu).unwrap();
    assert_eq!(loaded.num_timesteps(), 60);
    assert_eq!(loaded.predict(&observation, true).unwrap(), action);
    env.close().unwrap();
    assert_eq!(counters.closes(), 1);
}

#[test]
fn gail_rewards_the_generator_with_the_discriminator() {
    set_seed(5);
    let dir = tempfile::tempdir().unwrap();
    let dataset = expert_dataset(dir.path(), 5);
    let device = Device::Cpu;
    let hooks = GailHooks::new(&description(), dataset, GailParams::default(), &device).unwrap();
    let observations = vec![Buffer::from_vec(vec![0.; 4]); 3];
    let actions = vec![Buffer::from_vec(vec![0.5, -0.5]); 3];
    let rewards = hooks.rewards(&observations, &actions).unwrap();
    assert_eq!(rewards.len(), 3);
    assert!(rewards.iter().all(|r| *r > 0.));

    let mut agent: Gail =
        Gail::with_hooks(&description(), &small_network(), small_ppo_params(), &device, hooks)
            .unwrap();
    let counters = EnvCounters::default();
    let mut env = vec_env(2, &counters);
    let mut recorder = Recorder::default();
    agent.learn(&mut env, 32, &mut recorder).unwrap();
    let loss = recorder.stats[0]
        .losses
        .iter()
        .find(|(name, _)| *name == "discriminator_loss")
        .map(|(_, loss)| *loss)
        .unwrap();
    assert!(loss > 0.);

    let file = agent.save(&dir.path().join("GAIL_5")).unwrap();
    let checkpoint = Checkpoint::read(&file, &device).unwrap();
    assert_eq!(checkpoint.metadata.algorithm, GAIL);
    assert!(checkpoint.has_group("discriminator"));
    // the generator alone is enough for inference
    let generator = Ppo::load(
        &file,
        &small_network(),
        small_ppo_params(),
        &device,
        nao_agents::ppo::EmptyPpoHooks,
    )
    .unwrap();
    let observation = Buffer::from_vec(vec![0.2; 4]);
    assert_eq!(
        generator.predict(&observation, true).unwrap(),
        agent.predict(&observation, true).unwrap()
    );
}
