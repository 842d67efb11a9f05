mod attention;
mod batch;
mod clock;
mod constants;
mod device_utils;
mod evaluation;
mod layer_norm;
pub mod metrics;
mod model;
mod optimizer;
mod param_groups;
mod trainer;

pub use attention::{AttentionImplementation, LatentAttentionBlock};
pub use batch::DeviceBatch;
pub use clock::TrainingClock;
pub use constants::{softplus, PositionConstants};
pub use device_utils::{get_optimal_device, CudaSynchronize, DeviceParseError, TrainDevice};
pub use evaluation::{evaluate, EvalMetrics};
pub use layer_norm::LayerNorm;
pub use metrics::{
    calc_pplx, load_metrics, EvalStats, MetricsHistory, MetricsRecord, MetricsRecorder,
    MetricsSink, NoopSink, TrainStats, PPLX_BASE,
};
pub use model::{accuracy, cross_entropy, SpeedyLangNet, IGNORE_INDEX};
pub use optimizer::GroupedAdamW;
pub use param_groups::{tagged, tagged_parameters, BucketSummary, ParamGroupError, TaggedParameter};
pub use trainer::{train, TrainOptions, TrainOutput, TrainState};
