use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use speedy_core::ParamBucket;
use tch::{nn, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParamGroupError {
    #[error("parameter {name} was created in group {group}, which is not a known bucket")]
    UnknownGroup { name: String, group: usize },

    #[error("trainable parameter in group {group} has no registered name")]
    Unnamed { group: usize },
}

/// Returns `vs` with every parameter it creates assigned to `bucket`.
///
/// Paths never tagged stay in group 0, the catch-all decay bucket.
pub fn tagged(mut vs: nn::Path<'_>, bucket: ParamBucket) -> nn::Path<'_> {
    vs.set_group(bucket.index());
    vs
}

#[derive(Debug)]
pub struct TaggedParameter {
    pub name: String,
    pub bucket: ParamBucket,
    pub tensor: Tensor,
}

impl TaggedParameter {
    pub fn numel(&self) -> usize {
        self.tensor.numel()
    }
}

/// Every trainable parameter of `vs` with its bucket, sorted by name.
pub fn tagged_parameters(vs: &nn::VarStore) -> Result<Vec<TaggedParameter>, ParamGroupError> {
    let variables = vs.variables_.lock().unwrap();
    let names: HashMap<_, _> = variables
        .named_variables
        .iter()
        .map(|(name, tensor)| (tensor.data_ptr(), name))
        .collect();

    let mut parameters = variables
        .trainable_variables
        .iter()
        .map(|var| {
            let name = names
                .get(&var.tensor.data_ptr())
                .ok_or(ParamGroupError::Unnamed { group: var.group })?;
            let bucket =
                ParamBucket::from_index(var.group).ok_or_else(|| ParamGroupError::UnknownGroup {
                    name: name.to_string(),
                    group: var.group,
                })?;
            Ok(TaggedParameter {
                name: name.to_string(),
                bucket,
                tensor: var.tensor.shallow_clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    parameters.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(parameters)
}

/// Tensor and element counts per bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BucketSummary {
    pub tensors: BTreeMap<ParamBucket, usize>,
    pub params: BTreeMap<ParamBucket, usize>,
}

impl BucketSummary {
    pub fn from_parameters(parameters: &[TaggedParameter]) -> Self {
        let mut summary = Self::default();
        for bucket in ParamBucket::ALL {
            summary.tensors.insert(bucket, 0);
            summary.params.insert(bucket, 0);
        }
        for parameter in parameters {
            *summary.tensors.entry(parameter.bucket).or_default() += 1;
            *summary.params.entry(parameter.bucket).or_default() += parameter.numel();
        }
        summary
    }

    pub fn total_params(&self) -> usize {
        self.params.values().sum()
    }
}
