use crate::progress::ProgressLogger;
use anyhow::Result;
use nao_core::{
    agents::{LearningHooks, RolloutStats},
    cancel::CancellationToken,
};

/// Hooks of a training run: stop when the token is cancelled, log every rollout.
pub struct TrainingHooks {
    token: CancellationToken,
    progress: Option<ProgressLogger>,
    /// Rollouts seen over the whole run. Agents restart their own count when reloaded.
    rollouts: usize,
}

impl TrainingHooks {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            progress: None,
            rollouts: 0,
        }
    }

    pub fn with_progress(mut self, progress: ProgressLogger) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl LearningHooks for TrainingHooks {
    fn on_rollout_end(&mut self, stats: &RolloutStats) -> Result<bool> {
        let stats = RolloutStats {
            rollout: self.rollouts,
            ..stats.clone()
        };
        self.rollouts += 1;
        tracing::info!(
            rollout = stats.rollout,
            timesteps = stats.timesteps,
            episodes = stats.episodes,
            mean_episode_reward = stats.mean_episode_reward,
            losses = ?stats.losses,
            "rollout finished"
        );
        if let Some(progress) = self.progress.as_mut() {
            progress.record(&stats)?;
        }
        Ok(false)
    }

    fn should_stop(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod test {
    use super::TrainingHooks;
    use crate::progress::ProgressLogger;
    use nao_core::{
        agents::{LearningHooks, RolloutStats},
        cancel::CancellationToken,
    };

    #[test]
    fn rollouts_keep_counting_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let progress = ProgressLogger::new(dir.path());
        let path = progress.path();
        let mut hooks = TrainingHooks::new(CancellationToken::new()).with_progress(progress);
        for timesteps in [32, 64, 96] {
            // a reloaded agent reports rollout 0 again
            let stats = RolloutStats {
                rollout: 0,
                timesteps,
                ..Default::default()
            };
            assert!(!hooks.on_rollout_end(&stats).unwrap());
        }
        let content = std::fs::read_to_string(path).unwrap();
        let rollouts: Vec<&str> = content
            .lines()
            .skip(1)
            .map(|line| line.split(',').next().unwrap())
            .collect();
        assert_eq!(rollouts, ["0", "1", "2"]);
    }
}
