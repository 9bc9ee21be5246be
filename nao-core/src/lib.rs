pub mod agents;
pub mod cancel;
pub mod env;
pub mod env_registry;
pub mod error;
pub mod expert;
pub mod ipc;
pub mod noise;
pub mod policy;
pub mod rng;
pub mod sampler;
pub mod tensor;
pub mod utils;
pub mod vec_env;
#[cfg(feature = "test-utils")]
pub mod test_utils;
