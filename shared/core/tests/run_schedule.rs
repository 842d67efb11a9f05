use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use speedy_core::{
    discretize_depth, grow_sequence_length, MicrobatchConfig, MicrobatchController, ParamBucket,
    RunConfig,
};

/// Replays the sequence-length policy of a default run without any tensors.
#[test]
fn default_run_grows_to_max_within_token_budget() {
    let config = RunConfig::builder().build().unwrap();
    let max = config.max_sequence_length();
    let capacity = config.tokens_per_batch_capacity;

    let mut length = config.sequence.initial_length;
    let mut batch_size = config.initial_batch_size();
    let mut lengths = vec![length];
    for step in 0..config.optimizer.total_steps {
        assert!(batch_size * length <= capacity);
        if config.sequence.should_grow(step, length, max) {
            let growth = grow_sequence_length(length, batch_size, max, capacity);
            assert!(growth.length > length);
            length = growth.length;
            batch_size = growth.batch_size;
            lengths.push(length);
        }
    }

    assert_eq!(lengths, vec![32, 64, 128, 256, 512, 1024]);
    assert_eq!(batch_size, config.final_batch_size());
    assert!(config.final_batch_size() > 1);
}

#[test]
fn controller_depth_tracks_estimate_on_average() {
    let config = RunConfig::builder().build().unwrap();
    let mut controller = MicrobatchController::new(
        MicrobatchConfig {
            initial_estimate: 2.25,
            ..Default::default()
        },
        config.scaling_laws(),
        config.seed,
    );

    let draws = 20_000;
    let total: usize = (0..draws).map(|_| controller.sample_depth()).sum();
    let mean = total as f64 / draws as f64;
    assert!((mean - 2.25).abs() < 0.02, "mean depth {mean}");
}

#[test]
fn depth_never_drops_below_one() {
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    for estimate in [0.0, 0.1, 0.5, 0.99, 1.0, 3.7] {
        for _ in 0..1000 {
            assert!(discretize_depth(estimate, &mut rng) >= 1);
        }
    }
}

#[test]
fn only_decay_bucket_carries_weight_decay() {
    let config = RunConfig::builder().scale(0.5).build().unwrap();
    let base_lr = config.scaling_laws().base_lr();
    let decaying: Vec<ParamBucket> = ParamBucket::ALL
        .into_iter()
        .filter(|&bucket| {
            config
                .optimizer
                .group_hyperparameters(bucket, base_lr)
                .weight_decay
                > 0.0
        })
        .collect();
    assert_eq!(decaying, vec![ParamBucket::Decay]);
}
