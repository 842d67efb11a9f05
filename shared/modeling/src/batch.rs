use speedy_data_provider::TokenBatch;
use tch::{Device, Kind, Tensor};

/// A token batch on the training device, split into model inputs and next-token targets.
#[derive(Debug)]
pub struct DeviceBatch {
    /// `[batch, length]` token ids.
    pub inputs: Tensor,
    /// `[batch, length]` ids of the token following each input position.
    pub targets: Tensor,
}

impl DeviceBatch {
    pub fn new(batch: &TokenBatch, device: Device) -> Self {
        let rows = Tensor::from_slice(&batch.tokens)
            .view([batch.batch_size as i64, batch.row_len() as i64])
            .to_kind(Kind::Int64)
            .to(device);
        let length = batch.length as i64;
        // both halves are strided views of `rows` until made contiguous
        Self {
            inputs: rows.narrow(1, 0, length).contiguous(),
            targets: rows.narrow(1, 1, length).contiguous(),
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.inputs.size()[0]
    }

    pub fn length(&self) -> i64 {
        self.inputs.size()[1]
    }
}
