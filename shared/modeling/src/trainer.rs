use anyhow::{bail, Result};
use speedy_core::{grow_sequence_length, MicrobatchController, ParamBucket, RunConfig};
use speedy_data_provider::{BatchSampler, Split};
use tch::{nn::Module, Device, Kind};
use tracing::{debug, info};

use crate::{
    accuracy, calc_pplx, cross_entropy, evaluate, AttentionImplementation, DeviceBatch,
    EvalStats, GroupedAdamW, MetricsHistory, MetricsRecord, MetricsSink, SpeedyLangNet,
    TrainStats, TrainingClock,
};

#[derive(Debug, Clone, Copy)]
pub struct TrainOptions {
    pub device: Device,
    pub kind: Kind,
    pub attn_implementation: AttentionImplementation,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            kind: Kind::Float,
            attn_implementation: AttentionImplementation::default(),
        }
    }
}

#[derive(Debug)]
pub struct TrainOutput {
    pub model: SpeedyLangNet,
    pub history: MetricsHistory,
    pub final_eval: Option<EvalStats>,
}

/// Everything the loop mutates between micro-steps.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainState {
    pub step: u32,
    pub micro_step: usize,
    pub sequence_length: usize,
    pub batch_size: usize,
    pub tokens_seen: u64,
    pub last_eval_epoch: f64,
    pub grad_norm: Option<f64>,
}

impl TrainState {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            step: 0,
            micro_step: 0,
            sequence_length: config.sequence.initial_length,
            batch_size: config.initial_batch_size(),
            tokens_seen: 0,
            last_eval_epoch: 0.0,
            grad_norm: None,
        }
    }

    pub fn epoch(&self, train_len: usize) -> f64 {
        self.tokens_seen as f64 / train_len as f64
    }
}

fn emit(
    record: MetricsRecord,
    history: &mut MetricsHistory,
    sink: &mut dyn MetricsSink,
) -> Result<()> {
    sink.record(&record)?;
    history.record(&record)
}

fn run_eval<S: BatchSampler + ?Sized>(
    model: &SpeedyLangNet,
    sampler: &S,
    config: &RunConfig,
    state: &TrainState,
    epoch: f64,
    clock: &mut TrainingClock,
) -> Result<EvalStats> {
    clock.pause();
    let metrics = evaluate(model, sampler, config)?;
    let stats = EvalStats {
        step: state.step,
        val_loss: metrics.loss,
        val_acc: metrics.accuracy,
        val_pplx: metrics.pplx,
        tokens_seen: state.tokens_seen,
        epoch,
        batch_size: config.eval_batch_size(),
        sequence_length: config.max_sequence_length(),
        t_secs: clock.elapsed_secs(),
    };
    info!(
        step = stats.step,
        val_loss = stats.val_loss,
        val_acc = stats.val_acc,
        val_pplx = stats.val_pplx,
        epoch = stats.epoch,
        t_secs = stats.t_secs,
        "eval"
    );
    clock.resume();
    Ok(stats)
}

/// Trains for `config.optimizer.total_steps` optimizer steps.
///
/// One loop iteration is one micro-batch. After every accumulation group the optimizer
/// steps, the sequence length may double, the accumulation depth may be resampled from the
/// gradient norm, and train/eval rows are emitted to `sink` and the returned history.
pub fn train<S: BatchSampler + ?Sized>(
    config: &RunConfig,
    model: Option<SpeedyLangNet>,
    sampler: &mut S,
    sink: &mut dyn MetricsSink,
    options: &TrainOptions,
) -> Result<TrainOutput> {
    config.validate()?;
    let model = match model {
        Some(model) if model.config() != &config.model => {
            bail!(
                "model was built for {:?}, but the run expects {:?}",
                model.config(),
                config.model
            )
        }
        Some(model) => model,
        None => {
            tch::manual_seed(config.seed as i64);
            SpeedyLangNet::new(
                &config.model,
                options.attn_implementation,
                options.device,
                options.kind,
            )?
        }
    };
    let device = model.device();
    let laws = config.scaling_laws();
    let optim = &config.optimizer;
    let max_length = config.max_sequence_length();
    let train_len = sampler.split_len(Split::Train);

    let summary = model.bucket_summary()?;
    info!(
        width = config.model.width,
        depth = config.model.depth,
        num_heads = config.model.num_heads,
        value_pathway = ?config.model.value_pathway,
        num_params = model.num_params(),
        non_embedding_params = config.model.num_non_embedding_params(),
        tokens_per_batch_capacity = config.tokens_per_batch_capacity,
        initial_batch_size = config.initial_batch_size(),
        final_batch_size = config.final_batch_size(),
        base_lr = laws.base_lr(),
        "Starting training"
    );
    for (bucket, params) in &summary.params {
        debug!(%bucket, tensors = summary.tensors[bucket], params, "Parameter bucket");
    }

    let mut optimizer = GroupedAdamW::new(model.parameters()?, optim, laws.base_lr());
    let mut controller = MicrobatchController::new(optim.microbatch, laws, config.seed);
    let mut state = TrainState::new(config);
    let mut history = MetricsHistory::default();
    let mut clock = TrainingClock::new(device);
    let mut evaluated_last_step = false;

    model.set_training(true);
    clock.resume();

    while state.step < optim.total_steps {
        let depth = controller.depth();
        let batch = sampler.sample_batch(Split::Train, state.batch_size, state.sequence_length)?;
        let batch = DeviceBatch::new(&batch, device);
        let logits = model.forward(&batch.inputs);
        let loss = cross_entropy(&logits, &batch.targets);
        (&loss / depth as f64).backward();

        state.tokens_seen += (state.batch_size * state.sequence_length) as u64;
        state.micro_step += 1;
        if state.micro_step < depth {
            continue;
        }

        let step = state.step;
        let loss_value = loss.double_value(&[]);
        // the row for this step describes the batch it trained on, before any growth
        let (sequence_length, batch_size) = (state.sequence_length, state.batch_size);

        optimizer.set_weight_decay(
            ParamBucket::Decay,
            laws.dynamic_weight_decay(optim.weight_decay, loss_value),
        );
        optimizer.step();
        optimizer.scheduler_step();

        if config
            .sequence
            .should_grow(step, state.sequence_length, max_length)
        {
            let growth = grow_sequence_length(
                state.sequence_length,
                state.batch_size,
                max_length,
                config.tokens_per_batch_capacity,
            );
            state.sequence_length = growth.length;
            state.batch_size = growth.batch_size;
        }

        if controller.is_resample_step(step) {
            let grad_norm = model.grad_norm();
            controller.observe_grad_norm(step, grad_norm);
            state.grad_norm = Some(grad_norm);
        }
        controller.sample_depth();

        optimizer.zero_grad();
        state.micro_step = 0;

        let epoch = state.epoch(train_len);
        if step % optim.log_every == 0 {
            let train_acc = tch::no_grad(|| accuracy(&logits, &batch.targets)).double_value(&[]);
            let stats = TrainStats {
                step,
                train_loss: loss_value,
                train_acc,
                train_pplx: calc_pplx(loss_value),
                grad_norm: state.grad_norm,
                accumulation_estimate: controller.estimate(),
                accumulation_depth: depth,
                lr: optimizer.lr(ParamBucket::Decay),
                weight_decay: optimizer.weight_decay(ParamBucket::Decay),
                tokens_seen: state.tokens_seen,
                epoch,
                batch_size,
                sequence_length,
                t_secs: clock.elapsed_secs(),
            };
            info!(
                step,
                train_loss = stats.train_loss,
                train_acc = stats.train_acc,
                accumulation_estimate = stats.accumulation_estimate,
                sequence_length = stats.sequence_length,
                batch_size = stats.batch_size,
                t_secs = stats.t_secs,
                "train"
            );
            emit(stats.into(), &mut history, sink)?;
        }

        evaluated_last_step = step % optim.eval_every == 0
            || epoch - state.last_eval_epoch > optim.max_epochs_between_evals;
        if evaluated_last_step {
            let stats = run_eval(&model, &*sampler, config, &state, epoch, &mut clock)?;
            state.last_eval_epoch = epoch;
            emit(stats.into(), &mut history, sink)?;
        }

        state.step += 1;
    }

    clock.pause();
    if !evaluated_last_step {
        let epoch = state.epoch(train_len);
        let stats = run_eval(&model, &*sampler, config, &state, epoch, &mut clock)?;
        emit(stats.into(), &mut history, sink)?;
    }

    Ok(TrainOutput {
        model,
        final_eval: history.last_eval().cloned(),
        history,
    })
}
