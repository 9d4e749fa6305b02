use std::fmt::Debug;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Deserializer, Serialize};

pub mod distributed;
mod error;
pub mod gptq;
pub mod loading;
pub mod safetensors;
mod utils;

pub use distributed::{
    create_process_groups, create_process_groups_with,
    layers::{DenseColumnParallel, DenseRowParallel},
    launch, AllGather, BarrierLike, Collective, CommContext, Id, ParallelArgs, ProcessGroup,
    SumAllReduce, ThreadCollective,
};
pub use error::{Error, Result};
pub use gptq::{
    dequantize, pack, pack_factor, sequential_g_idx, unpack, DequantParams, DequantWorkspace,
    GptqColumnParallel, GptqRowParallel, PackDim, ZeroPointEncoding,
};
pub use loading::{InMemoryStore, Param, ParamSet, Sharding, StoreView, TensorStore};
pub use safetensors::SafetensorsStore;
pub use utils::log;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationMethod {
    #[default]
    None,
    Gptq,
}

/// Quantization settings attached to a layer at construction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct QuantizationArgs {
    pub method: QuantizationMethod,
    pub bits: usize,
    pub group_size: usize,
    /// Zero-point storage of the checkpoint. `"gptq"` means every stored zero
    /// is `zero - 1`; `"gptq_v2"` or an absent value means zeros are stored
    /// as-is. Legacy AutoGPTQ exports that omit this field while storing
    /// `zero - 1` must set it to `"gptq"` explicitly.
    pub checkpoint_format: Option<String>,
    pub desc_act: bool,
    #[serde(skip)]
    pub pack_dim: PackDim,
}

#[derive(Deserialize)]
struct RawConfig {
    quant_method: Option<String>,
    bits: Option<usize>,
    group_size: Option<usize>,
    checkpoint_format: Option<String>,
    desc_act: Option<bool>,
}

impl<'de> Deserialize<'de> for QuantizationArgs {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawConfig::deserialize(deserializer)?;

        match &raw.quant_method {
            Some(m) if m == "gptq" => {
                let bits = raw
                    .bits
                    .ok_or_else(|| serde::de::Error::missing_field("bits"))?;
                let group_size = raw
                    .group_size
                    .ok_or_else(|| serde::de::Error::missing_field("group_size"))?;
                Ok(QuantizationArgs {
                    method: QuantizationMethod::Gptq,
                    bits,
                    group_size,
                    checkpoint_format: raw.checkpoint_format,
                    desc_act: raw.desc_act.unwrap_or(false),
                    pack_dim: PackDim::Rows,
                })
            }
            None => Ok(QuantizationArgs::none()),
            Some(unknown_method) => Err(serde::de::Error::custom(format!(
                "Unknown quantization method: {unknown_method}. Expected gptq or not specified"
            ))),
        }
    }
}

impl QuantizationArgs {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn gptq(bits: usize, group_size: usize) -> Self {
        Self {
            method: QuantizationMethod::Gptq,
            bits,
            group_size,
            ..Self::default()
        }
    }

    pub fn with_pack_dim(mut self, pack_dim: PackDim) -> Self {
        self.pack_dim = pack_dim;
        self
    }

    pub fn is_quantized(&self) -> bool {
        self.method != QuantizationMethod::None
    }

    pub fn zero_point(&self) -> Result<ZeroPointEncoding> {
        if self.checkpoint_format.is_none() && self.is_quantized() {
            log::once_log_info(
                "No checkpoint_format given, reading GPTQ zero points as stored (gptq_v2)",
            );
        }
        ZeroPointEncoding::from_checkpoint_format(self.checkpoint_format.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        if let QuantizationMethod::Gptq = self.method {
            if self.group_size == 0 {
                return Err(Error::Config("group_size must be positive".to_string()));
            }
            pack_factor(self.bits)?;
            self.zero_point()?;
        }
        Ok(())
    }

    pub(crate) fn dequant_params(&self) -> Result<DequantParams> {
        self.validate()?;
        Ok(DequantParams {
            bits: self.bits,
            group_size: self.group_size,
            pack_dim: self.pack_dim,
            zero_point: self.zero_point()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedKind {
    ColumnParallel,
    RowParallel,
}

/// A tensor-parallel linear layer, dense or quantized.
pub trait ParallelLinear: Send + Sync + Debug {
    /// Local product for this rank, followed by whatever collective the
    /// partitioning needs to make the result correct.
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Direct mode: fetch this rank's shard of each parameter by name.
    fn load_state_dict(&mut self, store: &dyn TensorStore) -> Result<()>;

    /// Fused mode: parameter `p` is the concatenation of `<prefix>p` over
    /// `prefixes`, in order.
    fn load_fused_state_dict(&mut self, store: &dyn TensorStore, prefixes: &[&str]) -> Result<()>;

    fn verify_loaded_weights(&self, prefix: &str) -> Result<()>;

    /// The local weight shard as `[out, in]`, dequantized if necessary.
    fn dequantize_w(&self) -> Result<Tensor>;

    fn describe(&self) -> String;

    fn kind(&self) -> DistributedKind;
}

/// Output-feature-partitioned linear layer, dense or GPTQ depending on `quant`.
pub fn column_parallel_linear(
    in_features: usize,
    out_features: usize,
    quant: &QuantizationArgs,
    bias: bool,
    gather_output: bool,
    dtype: DType,
    args: &ParallelArgs,
) -> Result<Box<dyn ParallelLinear>> {
    let layer: Box<dyn ParallelLinear> = match quant.method {
        QuantizationMethod::None => Box::new(DenseColumnParallel::new(
            in_features,
            out_features,
            bias,
            gather_output,
            dtype,
            args,
        )?),
        QuantizationMethod::Gptq => Box::new(GptqColumnParallel::new(
            in_features,
            out_features,
            quant,
            bias,
            gather_output,
            dtype,
            args,
        )?),
    };
    Ok(layer)
}

/// Input-feature-partitioned linear layer, dense or GPTQ depending on `quant`.
pub fn row_parallel_linear(
    in_features: usize,
    out_features: usize,
    quant: &QuantizationArgs,
    bias: bool,
    input_is_parallelized: bool,
    dtype: DType,
    args: &ParallelArgs,
) -> Result<Box<dyn ParallelLinear>> {
    let layer: Box<dyn ParallelLinear> = match quant.method {
        QuantizationMethod::None => Box::new(DenseRowParallel::new(
            in_features,
            out_features,
            bias,
            input_is_parallelized,
            dtype,
            args,
        )?),
        QuantizationMethod::Gptq => Box::new(GptqRowParallel::new(
            in_features,
            out_features,
            quant,
            bias,
            input_is_parallelized,
            dtype,
            args,
        )?),
    };
    Ok(layer)
}

/// Holder for a sub-layer that may not have been constructed yet.
#[derive(Debug, Default)]
pub enum LayerSlot {
    #[default]
    Unbound,
    Bound(Box<dyn ParallelLinear>),
}

impl LayerSlot {
    pub fn bind(&mut self, layer: Box<dyn ParallelLinear>) {
        *self = Self::Bound(layer);
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Bound(_))
    }

    pub fn get(&self) -> Result<&dyn ParallelLinear> {
        match self {
            Self::Bound(layer) => Ok(layer.as_ref()),
            Self::Unbound => Err(Error::NotBound),
        }
    }

    pub fn get_mut(&mut self) -> Result<&mut (dyn ParallelLinear + 'static)> {
        match self {
            Self::Bound(layer) => Ok(layer.as_mut()),
            Self::Unbound => Err(Error::NotBound),
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.get()?.forward(xs)
    }
}

impl From<Box<dyn ParallelLinear>> for LayerSlot {
    fn from(layer: Box<dyn ParallelLinear>) -> Self {
        Self::Bound(layer)
    }
}
