use crate::{rng::with_rng, tensor::Buffer};
use rand::Rng;
use rand_distr::StandardNormal;

/// Temporally correlated exploration noise for continuous control.
///
/// `x' = x + theta * (mean - x) * dt + sigma * sqrt(dt) * N(0, 1)`
#[derive(Debug, Clone)]
pub struct OrnsteinUhlenbeckActionNoise {
    pub mean: Vec<f32>,
    pub sigma: Vec<f32>,
    pub theta: f32,
    pub dt: f32,
    initial: Option<Vec<f32>>,
    prev: Vec<f32>,
}

impl OrnsteinUhlenbeckActionNoise {
    pub fn new(mean: Vec<f32>, sigma: Vec<f32>) -> Self {
        let prev = vec![0.; mean.len()];
        Self {
            mean,
            sigma,
            theta: 0.15,
            dt: 1e-2,
            initial: None,
            prev,
        }
    }

    /// Zero mean noise with the same `sigma` on every action dimension.
    pub fn isotropic(action_size: usize, sigma: f32) -> Self {
        Self::new(vec![0.; action_size], vec![sigma; action_size])
    }

    pub fn with_theta(mut self, theta: f32) -> Self {
        self.theta = theta;
        self
    }

    pub fn with_initial(mut self, initial: Vec<f32>) -> Self {
        self.prev = initial.clone();
        self.initial = Some(initial);
        self
    }

    pub fn reset(&mut self) {
        self.prev = match &self.initial {
            Some(initial) => initial.clone(),
            None => vec![0.; self.mean.len()],
        };
    }

    pub fn sample(&mut self) -> Buffer {
        let sqrt_dt = self.dt.sqrt();
        let next: Vec<f32> = with_rng(|rng| {
            self.prev
                .iter()
                .zip(self.mean.iter().zip(self.sigma.iter()))
                .map(|(x, (mu, sigma))| {
                    let z: f32 = rng.sample(StandardNormal);
                    x + self.theta * (mu - x) * self.dt + sigma * sqrt_dt * z
                })
                .collect()
        });
        self.prev = next.clone();
        Buffer::from_vec(next)
    }
}
