use approx::assert_relative_eq;
use nao_core::{
    rng::set_seed,
    tensor::Buffer,
    utils::rollout_buffer::{Advantages, Returns, RolloutBatchIterator, RolloutBuffer},
};

fn rollout(rewards: &[f32], dones: &[bool]) -> RolloutBuffer {
    let mut rollout = RolloutBuffer::default();
    for (i, (reward, done)) in rewards.iter().zip(dones).enumerate() {
        rollout.push_step(
            Buffer::from_vec(vec![i as f32]),
            Buffer::from_vec(vec![0.]),
            *reward,
            *done,
            -1.,
        );
    }
    rollout.push_state(Buffer::from_vec(vec![rewards.len() as f32]));
    rollout
}

#[test]
fn gae_with_lambda_one_is_discounted_return() {
    let rollout = rollout(&[1., 1., 1.], &[false, false, true]);
    let values = [0.; 4];
    let (advantages, returns) = rollout
        .calculate_advantages_and_returns(&values, 0.5, 1.)
        .unwrap();
    assert_relative_eq!(returns[0], 1. + 0.5 + 0.25);
    assert_relative_eq!(returns[1], 1. + 0.5);
    assert_relative_eq!(returns[2], 1.);
    assert_eq!(advantages, returns);
}

#[test]
fn gae_bootstraps_from_last_state_unless_done() {
    let rollout = rollout(&[0., 0.], &[false, false]);
    let values = [0., 0., 10.];
    let (_, returns) = rollout
        .calculate_advantages_and_returns(&values, 0.9, 0.95)
        .unwrap();
    assert!(returns[1] > 8.9 && returns[1] < 9.1);

    let finished = self::rollout(&[0., 0.], &[false, true]);
    let (_, returns) = finished
        .calculate_advantages_and_returns(&values, 0.9, 0.95)
        .unwrap();
    assert_relative_eq!(returns[1], 0.);
}

#[test]
fn gae_rejects_missing_bootstrap_value() {
    let rollout = rollout(&[0., 0.], &[false, false]);
    assert!(rollout.calculate_advantages_and_returns(&[0., 0.], 0.9, 0.9).is_err());
}

#[test]
fn normalized_advantages_have_zero_mean() {
    let mut advantages = Advantages::new(vec![vec![1., 2., 3.], vec![4., 5.]]);
    advantages.normalize();
    let all: Vec<f32> = advantages.iter().flatten().copied().collect();
    let mean = all.iter().sum::<f32>() / all.len() as f32;
    assert_relative_eq!(mean, 0., epsilon = 1e-5);
}

#[test]
fn batches_cover_every_step_once() {
    set_seed(3);
    let rollouts = vec![rollout(&[1.; 5], &[false; 5]), rollout(&[2.; 4], &[false; 4])];
    let advantages = Advantages::new(vec![vec![0.; 5], vec![0.; 4]]);
    let returns = Returns::new(vec![vec![0.; 5], vec![0.; 4]]);
    let batches: Vec<_> = RolloutBatchIterator::new(&rollouts, &advantages, &returns, 4).collect();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches.iter().map(|b| b.observations.len()).sum::<usize>(), 9);
    let below_four = batches
        .iter()
        .flat_map(|b| b.observations.iter())
        .filter(|o| o.data[0] < 4.)
        .count();
    assert_eq!(below_four, 8);
}
