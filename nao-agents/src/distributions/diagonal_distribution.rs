use crate::thread_safe_sequential::{ThreadSafeSequential, build_mlp};
use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::{Init, Module, VarBuilder};
use nao_core::rng::with_rng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f32;

/// Gaussian policy with a state dependent mean and a learned, state independent log std.
#[derive(Debug, Clone)]
pub struct DiagGaussianDistribution {
    mu_net: ThreadSafeSequential,
    log_std: Tensor,
}

impl DiagGaussianDistribution {
    pub fn new(mu_net: ThreadSafeSequential, log_std: Tensor) -> Self {
        Self { mu_net, log_std }
    }

    pub fn build(
        input_dim: usize,
        hidden_layers: &[usize],
        action_size: usize,
        vb: &VarBuilder,
        prefix: &str,
    ) -> Result<Self> {
        let mu_net = build_mlp(input_dim, hidden_layers, action_size, vb, prefix)?;
        let log_std = vb.get_with_hints(action_size, "log_std", Init::Const(0.))?;
        Ok(Self { mu_net, log_std })
    }

    pub fn device(&self) -> &Device {
        self.log_std.device()
    }

    /// Mean action for a `(batch, obs)` tensor.
    pub fn mean(&self, observations: &Tensor) -> Result<Tensor> {
        Ok(self.mu_net.forward(observations)?)
    }

    /// Samples one action per row. Noise comes from the process generator so runs are
    /// reproducible from the seed.
    pub fn sample(&self, observations: &Tensor) -> Result<Tensor> {
        let mu = self.mean(observations)?;
        let count = mu.elem_count();
        let noise: Vec<f32> = with_rng(|rng| (0..count).map(|_| rng.sample(StandardNormal)).collect());
        let noise = Tensor::from_vec(noise, mu.shape(), mu.device())?;
        let std = self.log_std.exp()?.broadcast_as(mu.shape())?;
        Ok((mu + std.mul(&noise)?)?.detach())
    }

    pub fn log_probs(&self, states: &Tensor, actions: &Tensor) -> Result<Tensor> {
        let mu = self.mu_net.forward(states)?;
        let std = self.log_std.exp()?.broadcast_as(mu.shape())?;
        let var = std.sqr()?;
        let log_sqrt_2pi = f32::ln(f32::sqrt(2f32 * f32::consts::PI));
        let log_sqrt_2pi = Tensor::full(log_sqrt_2pi, mu.shape(), mu.device())?;
        let log_probs = ((((actions - &mu)?.sqr()? / (2. * var)?)?.neg()?
            - &self.log_std.broadcast_as(mu.shape())?)?
            - log_sqrt_2pi)?;
        Ok(log_probs.sum(1)?)
    }

    pub fn entropy(&self) -> Result<Tensor> {
        let log_2pi_plus_1_div_2 = Tensor::full(
            0.5 * ((2. * f32::consts::PI).ln() + 1.),
            self.log_std.shape(),
            self.log_std.device(),
        )?;
        Ok(log_2pi_plus_1_div_2.add(&self.log_std)?.sum_all()?)
    }

    pub fn std(&self) -> Result<f32> {
        Ok(self.log_std.exp()?.mean_all()?.to_scalar::<f32>()?)
    }
}

#[cfg(test)]
mod test {
    use super::DiagGaussianDistribution;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use nao_core::rng::set_seed;

    fn distribution() -> (DiagGaussianDistribution, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dist = DiagGaussianDistribution::build(3, &[8], 2, &vb, "policy").unwrap();
        (dist, varmap)
    }

    #[test]
    fn unit_std_log_prob_matches_closed_form() {
        let (dist, _) = distribution();
        let obs = Tensor::zeros((1, 3), DType::F32, &Device::Cpu).unwrap();
        let mu = dist.mean(&obs).unwrap();
        let logp: Vec<f32> = dist.log_probs(&obs, &mu).unwrap().to_vec1().unwrap();
        // at the mean with std 1 the density is (2 pi)^(-k/2)
        assert_relative_eq!(logp[0], -(2. * std::f32::consts::PI).ln(), epsilon = 1e-5);
        assert_relative_eq!(dist.std().unwrap(), 1.);
    }

    #[test]
    fn sampling_follows_the_process_seed() {
        let (dist, _) = distribution();
        let obs = Tensor::ones((4, 3), DType::F32, &Device::Cpu).unwrap();
        set_seed(9);
        let a: Vec<Vec<f32>> = dist.sample(&obs).unwrap().to_vec2().unwrap();
        set_seed(9);
        let b: Vec<Vec<f32>> = dist.sample(&obs).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
    }
}
