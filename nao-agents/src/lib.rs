pub mod checkpoint;
pub mod ddpg;
pub mod distributions;
pub mod gail;
pub mod optimizer;
pub mod ppo;
pub mod tensors;
pub mod thread_safe_sequential;
