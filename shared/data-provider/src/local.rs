use anyhow::{anyhow, bail, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::TokenSplits;

const MODDED_NANOGPT_MAGIC: u32 = 20240520;
/// 256 little-endian i32 words: magic, version, token count, then padding.
const MODDED_NANOGPT_HEADER_SIZE: usize = 1024;

pub const DATA_FILE_EXTENSIONS: [&str; 3] = ["bin", "npy", "ds"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSize {
    TwoBytes,
    FourBytes,
}

impl TokenSize {
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            2 => Some(TokenSize::TwoBytes),
            4 => Some(TokenSize::FourBytes),
            _ => None,
        }
    }
}

impl From<TokenSize> for usize {
    fn from(value: TokenSize) -> Self {
        match value {
            TokenSize::TwoBytes => 2,
            TokenSize::FourBytes => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Raw,
    /// Shards written by modded-nanogpt's `fineweb.py`.
    ModdedNanogpt { version: u32, token_count: u32 },
}

impl DataFormat {
    /// Anything without the magic word in its first four bytes is headerless.
    pub fn detect(data: &[u8]) -> Self {
        if data.len() >= 12 {
            let word = |i: usize| {
                u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]])
            };
            if word(0) == MODDED_NANOGPT_MAGIC {
                return DataFormat::ModdedNanogpt {
                    version: word(4),
                    token_count: word(8),
                };
            }
        }
        DataFormat::Raw
    }

    pub fn header_size(&self) -> usize {
        match self {
            DataFormat::Raw => 0,
            DataFormat::ModdedNanogpt { .. } => MODDED_NANOGPT_HEADER_SIZE,
        }
    }
}

fn is_validation_filename(path: &Path) -> bool {
    path.file_name()
        .and_then(|x| x.to_str())
        .map(|name| name.to_ascii_lowercase().contains("val"))
        .unwrap_or(false)
}

fn mmap_file(p: &Path) -> Result<memmap2::Mmap> {
    let file = std::fs::File::open(p)?;
    // SAFETY: token files are opened read-only and not expected to change while training
    Ok(unsafe { memmap2::MmapOptions::new().map(&file)? })
}

/// Decodes little-endian token ids following the format header.
pub fn decode_tokens(data: &[u8], token_size: TokenSize) -> Vec<i32> {
    let format = DataFormat::detect(data);
    let body = data.get(format.header_size()..).unwrap_or_default();
    let width = usize::from(token_size);
    let mut available = body.len() / width;
    if let DataFormat::ModdedNanogpt { token_count, .. } = format {
        available = available.min(token_count as usize);
    }
    body.chunks_exact(width)
        .take(available)
        .map(|t| match token_size {
            TokenSize::TwoBytes => u16::from_le_bytes([t[0], t[1]]) as i32,
            TokenSize::FourBytes => u32::from_le_bytes([t[0], t[1], t[2], t[3]]) as i32,
        })
        .collect()
}

fn load_files(files: &[PathBuf], token_size: TokenSize) -> Result<Vec<i32>> {
    let mut tokens = Vec::new();
    for path in files {
        let data = mmap_file(path)?;
        let format = DataFormat::detect(&data);
        match format {
            DataFormat::Raw => {
                debug!("File {:?}: Raw binary format (no header)", path.file_name())
            }
            DataFormat::ModdedNanogpt {
                version,
                token_count,
            } => info!(
                "File {:?}: modded-nanogpt format (version={}, tokens={})",
                path.file_name(),
                version,
                token_count
            ),
        }
        let decoded = decode_tokens(&data, token_size);
        if decoded.is_empty() {
            warn!(file = ?path, "Data file holds no tokens; skipping");
        }
        tokens.extend(decoded);
    }
    Ok(tokens)
}

/// Loads every token file in `dir`, routing files with `val` in their name to the held-out split.
pub fn load_token_splits(dir: impl AsRef<Path>, token_size: TokenSize) -> Result<TokenSplits> {
    let dir = std::fs::canonicalize(&dir)
        .map_err(|e| anyhow!("Failed to open data directory {:?}: {e}", dir.as_ref()))?;

    let mut bin_files = vec![];
    for file in std::fs::read_dir(&dir)
        .map_err(|e| anyhow!("couldn't load training data from {}: {e}", dir.display()))?
        .flatten()
    {
        let file = file.path();
        if let Some(extension) = file.extension().and_then(|s| s.to_str()) {
            if DATA_FILE_EXTENSIONS.contains(&extension) {
                bin_files.push(file);
            }
        }
    }
    bin_files.sort();

    let (eval_files, train_files): (Vec<_>, Vec<_>) = bin_files
        .into_iter()
        .partition(|path| is_validation_filename(path));
    if train_files.is_empty() {
        bail!("No training data files in directory {}", dir.display());
    }
    if eval_files.is_empty() {
        bail!(
            "No validation data files in directory {} (expected a file name containing `val`)",
            dir.display()
        );
    }

    let train = load_files(&train_files, token_size)?;
    let eval = load_files(&eval_files, token_size)?;
    info!(
        train_files = train_files.len(),
        train_tokens = train.len(),
        eval_files = eval_files.len(),
        eval_tokens = eval.len(),
        "Loaded token data from directory {}",
        dir.display()
    );
    Ok(TokenSplits::new(train, eval))
}
