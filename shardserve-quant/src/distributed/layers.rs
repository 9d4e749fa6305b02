use candle_core::{DType, Module, Tensor, D};
use candle_nn::Linear;
use tracing::debug;

use crate::{
    distributed::{partition, AllGather, ParallelArgs, SumAllReduce},
    loading::{Param, ParamSet, Sharding, TensorStore},
    DistributedKind, ParallelLinear, Result,
};

fn dense_forward(params: &ParamSet, xs: &Tensor, with_bias: bool) -> Result<Tensor> {
    params.verify("")?;
    let weight = params.tensor("weight")?;
    let bias = if with_bias {
        Some(params.tensor("bias")?.clone())
    } else {
        None
    };
    let original_dtype = xs.dtype();
    let layer = Linear::new(weight.clone(), bias);
    Ok(layer
        .forward(&xs.to_dtype(weight.dtype())?)?
        .to_dtype(original_dtype)?)
}

/// This layer has a weight that is parallelized along the output dimension,
/// returning this rank's slice of the output unless `gather_output` is set.
#[derive(Debug)]
pub struct DenseColumnParallel {
    in_features: usize,
    out_features: usize,
    out_per_partition: usize,
    bias: bool,
    gather: Option<AllGather>,
    args: ParallelArgs,
    params: ParamSet,
}

impl DenseColumnParallel {
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        gather_output: bool,
        dtype: DType,
        args: &ParallelArgs,
    ) -> Result<Self> {
        let out_per_partition = partition(out_features, args.world_size(), "out_features")?;
        let device = args.process_group().device();

        let mut params = vec![Param::new(
            "weight",
            Tensor::zeros((out_per_partition, in_features), dtype, device)?,
            Sharding::Split(0),
        )];
        if bias {
            params.push(Param::new(
                "bias",
                Tensor::zeros(out_per_partition, dtype, device)?,
                Sharding::Split(0),
            ));
        }
        debug!(
            "DenseColumnParallel {in_features}->{out_features} on rank {}/{}",
            args.rank(),
            args.world_size()
        );

        Ok(Self {
            in_features,
            out_features,
            out_per_partition,
            bias,
            gather: gather_output.then(|| AllGather::new(args.process_group())),
            args: args.clone(),
            params: ParamSet::new(params),
        })
    }
}

impl ParallelLinear for DenseColumnParallel {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = dense_forward(&self.params, xs, self.bias)?;
        match &self.gather {
            Some(gather) => gather.all_gather(&ys),
            None => Ok(ys),
        }
    }

    fn load_state_dict(&mut self, store: &dyn TensorStore) -> Result<()> {
        self.params
            .load(store, self.args.rank(), self.args.world_size())
    }

    fn load_fused_state_dict(&mut self, store: &dyn TensorStore, prefixes: &[&str]) -> Result<()> {
        self.params
            .load_fused(store, prefixes, self.args.rank(), self.args.world_size())
    }

    fn verify_loaded_weights(&self, prefix: &str) -> Result<()> {
        self.params.verify(prefix)
    }

    fn dequantize_w(&self) -> Result<Tensor> {
        Ok(self.params.tensor("weight")?.clone())
    }

    fn describe(&self) -> String {
        format!(
            "DenseColumnParallel(in_features={}, out_features={}, out_per_partition={}, bias={}, gather_output={}, rank={}/{})",
            self.in_features,
            self.out_features,
            self.out_per_partition,
            self.bias,
            self.gather.is_some(),
            self.args.rank(),
            self.args.world_size()
        )
    }

    fn kind(&self) -> DistributedKind {
        DistributedKind::ColumnParallel
    }
}

/// This layer has a weight that is parallelized along the input dimension,
/// returning the "full" output dimension after a sum all-reduce.
#[derive(Debug)]
pub struct DenseRowParallel {
    in_features: usize,
    out_features: usize,
    in_per_partition: usize,
    input_is_parallelized: bool,
    all_reduce: SumAllReduce,
    args: ParallelArgs,
    params: ParamSet,
    bias: bool,
}

impl DenseRowParallel {
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        input_is_parallelized: bool,
        dtype: DType,
        args: &ParallelArgs,
    ) -> Result<Self> {
        let in_per_partition = partition(in_features, args.world_size(), "in_features")?;
        let device = args.process_group().device();

        let mut params = vec![Param::new(
            "weight",
            Tensor::zeros((out_features, in_per_partition), dtype, device)?,
            Sharding::Split(1),
        )];
        if bias {
            params.push(Param::new(
                "bias",
                Tensor::zeros(out_features, dtype, device)?,
                Sharding::Replicated,
            ));
        }
        debug!(
            "DenseRowParallel {in_features}->{out_features} on rank {}/{}",
            args.rank(),
            args.world_size()
        );

        Ok(Self {
            in_features,
            out_features,
            in_per_partition,
            input_is_parallelized,
            all_reduce: SumAllReduce::new(args.process_group()),
            args: args.clone(),
            params: ParamSet::new(params),
            bias,
        })
    }
}

impl ParallelLinear for DenseRowParallel {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = if self.input_is_parallelized {
            xs.clone()
        } else {
            xs.narrow(
                D::Minus1,
                self.args.rank() * self.in_per_partition,
                self.in_per_partition,
            )?
        };
        let partial = dense_forward(&self.params, &xs, false)?;
        let ys = self.all_reduce.sum_all_reduce(&partial)?;
        if self.bias {
            let bias = self.params.tensor("bias")?.to_dtype(ys.dtype())?;
            Ok(ys.broadcast_add(&bias)?)
        } else {
            Ok(ys)
        }
    }

    fn load_state_dict(&mut self, store: &dyn TensorStore) -> Result<()> {
        self.params
            .load(store, self.args.rank(), self.args.world_size())
    }

    fn load_fused_state_dict(&mut self, store: &dyn TensorStore, prefixes: &[&str]) -> Result<()> {
        self.params
            .load_fused(store, prefixes, self.args.rank(), self.args.world_size())
    }

    fn verify_loaded_weights(&self, prefix: &str) -> Result<()> {
        self.params.verify(prefix)
    }

    fn dequantize_w(&self) -> Result<Tensor> {
        Ok(self.params.tensor("weight")?.clone())
    }

    fn describe(&self) -> String {
        format!(
            "DenseRowParallel(in_features={}, out_features={}, in_per_partition={}, bias={}, input_is_parallelized={}, rank={}/{})",
            self.in_features,
            self.out_features,
            self.in_per_partition,
            self.bias,
            self.input_is_parallelized,
            self.args.rank(),
            self.args.world_size()
        )
    }

    fn kind(&self) -> DistributedKind {
        DistributedKind::RowParallel
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::{DType, Device, Tensor};

    use super::*;
    use crate::{
        create_process_groups, launch, CommContext, Error, InMemoryStore, ProcessGroup,
    };

    fn groups(world_size: usize) -> Vec<Arc<ProcessGroup>> {
        let ctx = CommContext::init();
        create_process_groups(&ctx, &vec![Device::Cpu; world_size]).unwrap()
    }

    fn matrix(rows: usize, cols: usize, scale: f32) -> Tensor {
        let data = (0..rows * cols)
            .map(|i| ((i % 7) as f32 - 3.) * scale)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    }

    fn reference(xs: &Tensor, w: &Tensor, b: Option<&Tensor>) -> Vec<Vec<f32>> {
        Linear::new(w.clone(), b.cloned())
            .forward(xs)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap()
    }

    #[test]
    fn column_rejects_uneven_partition() {
        let groups = groups(3);
        let args = ParallelArgs::new(groups[0].clone());
        assert!(matches!(
            DenseColumnParallel::new(4, 10, false, false, DType::F32, &args),
            Err(Error::Config(_))
        ));
        let layer = DenseColumnParallel::new(4, 12, false, false, DType::F32, &args).unwrap();
        assert_eq!(layer.out_per_partition, 4);
    }

    #[test]
    fn column_gathered_output_matches_unsharded() -> Result<()> {
        let w = matrix(6, 4, 0.25);
        let b = matrix(1, 6, 0.5).squeeze(0)?;
        let xs = matrix(3, 4, 1.0);
        let store: InMemoryStore = [("weight", w.clone()), ("bias", b.clone())]
            .into_iter()
            .collect();
        let expected = reference(&xs, &w, Some(&b));

        let out = launch(&groups(2), |group| {
            let args = ParallelArgs::new(group);
            let mut layer = DenseColumnParallel::new(4, 6, true, true, DType::F32, &args)?;
            layer.load_state_dict(&store)?;
            layer.verify_loaded_weights("proj")?;
            layer.forward(&xs)
        })?;
        for ys in out {
            assert_eq!(ys.to_vec2::<f32>()?, expected);
        }
        Ok(())
    }

    #[test]
    fn row_all_reduce_matches_unsharded() -> Result<()> {
        let w = matrix(3, 8, 0.5);
        let b = Tensor::new(&[1f32, -1., 0.5], &Device::Cpu)?;
        let xs = matrix(2, 8, 1.0);
        let store: InMemoryStore = [("weight", w.clone()), ("bias", b.clone())]
            .into_iter()
            .collect();
        let expected = reference(&xs, &w, Some(&b));

        for input_is_parallelized in [false, true] {
            let out = launch(&groups(4), |group| {
                let args = ParallelArgs::new(group);
                let mut layer =
                    DenseRowParallel::new(8, 3, true, input_is_parallelized, DType::F32, &args)?;
                layer.load_state_dict(&store)?;
                let xs = if input_is_parallelized {
                    xs.narrow(1, args.rank() * 2, 2)?
                } else {
                    xs.clone()
                };
                layer.forward(&xs)
            })?;
            for ys in out {
                assert_eq!(ys.to_vec2::<f32>()?, expected);
            }
        }
        Ok(())
    }

    #[test]
    fn fused_qkv_matches_prefused() -> Result<()> {
        let (q, k, v) = (matrix(4, 4, 1.), matrix(4, 4, 2.), matrix(4, 4, 3.));
        // Pre-fused checkpoint laid out rank-major: [q0; k0; v0; q1; k1; v1].
        let mut blocks = Vec::new();
        for rank in 0..2 {
            for proj in [&q, &k, &v] {
                blocks.push(proj.narrow(0, rank * 2, 2)?);
            }
        }
        let fused = Tensor::cat(&blocks, 0)?;
        let mut store = InMemoryStore::new();
        store
            .insert("attn.q_proj.weight", q)
            .insert("attn.k_proj.weight", k)
            .insert("attn.v_proj.weight", v)
            .insert("attn.qkv.weight", fused);

        let out = launch(&groups(2), |group| {
            let args = ParallelArgs::new(group);
            let attn = store.select("attn");
            let mut split = DenseColumnParallel::new(4, 12, false, false, DType::F32, &args)?;
            split.load_fused_state_dict(&attn, &["q_proj.", "k_proj.", "v_proj."])?;
            split.verify_loaded_weights("attn.[q_proj,k_proj,v_proj]")?;

            let mut direct = DenseColumnParallel::new(4, 12, false, false, DType::F32, &args)?;
            direct.load_state_dict(&attn.select("qkv"))?;
            Ok((split.dequantize_w()?, direct.dequantize_w()?))
        })?;
        for (split, direct) in out {
            assert_eq!(split.dims(), &[6, 4]);
            assert_eq!(split.to_vec2::<f32>()?, direct.to_vec2::<f32>()?);
        }
        Ok(())
    }
}
