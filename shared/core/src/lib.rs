mod buckets;
mod config;
mod dither;
mod microbatch;
mod scaling;
mod schedule;
mod sequence;

pub use buckets::{GroupHyperparameters, ParamBucket};
pub use config::{
    ConfigError, LrMultipliers, MicrobatchConfig, ModelConfig, OptimizerConfig, RunConfig,
    RunConfigBuilder, SequenceConfig, ValuePathway,
};
pub use dither::{discretize_depth, stochastic_round};
pub use microbatch::{MicrobatchController, MicrobatchUpdate};
pub use scaling::{
    depth_from_scale, gpu_token_capacity, to_nearest_64, tokens_per_batch_capacity,
    width_from_scale, ScalingLaws, BASE_GPU_TOKEN_CAPACITY, REFERENCE_PARAM_COUNT,
};
pub use schedule::LrSchedule;
pub use sequence::{grow_sequence_length, SequenceGrowth};
