use anyhow::{Context, Result, bail};
use nao_core::agents::RolloutStats;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

pub const PROGRESS_FILE: &str = "progress.csv";

/// Appends one CSV row per rollout to `<log_dir>/progress.csv`. The directory and the header are
/// written with the first row, the loss columns are taken from that row.
pub struct ProgressLogger {
    log_dir: PathBuf,
    writer: Option<BufWriter<File>>,
    loss_columns: Vec<&'static str>,
}

impl ProgressLogger {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_owned(),
            writer: None,
            loss_columns: vec![],
        }
    }

    pub fn path(&self) -> PathBuf {
        self.log_dir.join(PROGRESS_FILE)
    }

    fn create(&mut self, stats: &RolloutStats) -> Result<BufWriter<File>> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        let mut writer = BufWriter::new(File::create(self.path())?);
        self.loss_columns = stats.losses.iter().map(|(name, _)| *name).collect();
        write!(
            writer,
            "rollout,timesteps,episodes,mean_episode_reward,total_reward"
        )?;
        for column in &self.loss_columns {
            write!(writer, ",{column}")?;
        }
        writeln!(writer)?;
        Ok(writer)
    }

    pub fn record(&mut self, stats: &RolloutStats) -> Result<()> {
        if self.writer.is_none() {
            let writer = self.create(stats)?;
            self.writer = Some(writer);
        }
        let Some(writer) = self.writer.as_mut() else {
            bail!("progress log is not open");
        };
        let mean_reward = stats
            .mean_episode_reward
            .map(|r| r.to_string())
            .unwrap_or_default();
        write!(
            writer,
            "{},{},{},{},{}",
            stats.rollout, stats.timesteps, stats.episodes, mean_reward, stats.total_reward
        )?;
        for column in &self.loss_columns {
            let value = stats
                .losses
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, value)| value.to_string())
                .unwrap_or_default();
            write!(writer, ",{value}")?;
        }
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}
