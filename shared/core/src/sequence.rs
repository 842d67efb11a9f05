use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGrowth {
    pub length: usize,
    pub batch_size: usize,
}

/// Doubles the sequence length up to `max_length` and shrinks the batch to keep the
/// per-batch token count within `tokens_per_batch_capacity`.
pub fn grow_sequence_length(
    old_length: usize,
    old_batch_size: usize,
    max_length: usize,
    tokens_per_batch_capacity: usize,
) -> SequenceGrowth {
    debug_assert!(
        old_length < max_length,
        "sequence already at its maximum length {max_length}"
    );
    let length = (2 * old_length).min(max_length);
    let batch_size = tokens_per_batch_capacity / length;
    info!(
        old_length,
        new_length = length,
        old_batch_size,
        new_batch_size = batch_size,
        "Growing sequence length"
    );
    SequenceGrowth { length, batch_size }
}
