mod local;
mod tokens;
mod traits;

pub use local::{decode_tokens, load_token_splits, DataFormat, TokenSize, DATA_FILE_EXTENSIONS};
pub use tokens::{TokenSplits, UniformSampler};
pub use traits::{BatchSampler, DataError, Split, TokenBatch};
