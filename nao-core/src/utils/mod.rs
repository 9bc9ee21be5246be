pub mod replay_buffer;
pub mod rollout_buffer;
