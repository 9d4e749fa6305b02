//! Checkpoint lookup and the load / fused-merge / verify protocol shared by
//! every parallel layer.

use std::collections::{HashMap, HashSet};

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::{error::config_bail, Error, Result};

/// Join a prefix and a parameter name, inserting `.` when the prefix is
/// non-empty and does not already end with one.
pub fn qualified_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('.') {
        format!("{prefix}{name}")
    } else {
        format!("{prefix}.{name}")
    }
}

/// The `rank`-th contiguous block of `xs` along `dim`.
pub fn shard_tensor(xs: &Tensor, dim: usize, rank: usize, world_size: usize) -> Result<Tensor> {
    if world_size == 1 {
        return Ok(xs.clone());
    }
    if dim >= xs.rank() {
        config_bail!("cannot shard {:?} along dim {dim}", xs.shape());
    }
    let size = xs.dim(dim)?;
    if size % world_size != 0 {
        config_bail!(
            "cannot split {:?} along dim {dim} into {world_size} parts",
            xs.shape()
        );
    }
    let block = size / world_size;
    Ok(xs.narrow(dim, rank * block, block)?.contiguous()?)
}

/// Name-keyed tensor lookup. A missing name is `Ok(None)`, never an error.
pub trait TensorStore: Send + Sync {
    fn get_tensor(&self, name: &str) -> Result<Option<Tensor>>;

    fn get_sharded_tensor(
        &self,
        name: &str,
        dim: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<Option<Tensor>> {
        self.get_tensor(name)?
            .map(|xs| shard_tensor(&xs, dim, rank, world_size))
            .transpose()
    }

    fn contains(&self, name: &str) -> bool {
        matches!(self.get_tensor(name), Ok(Some(_)))
    }

    /// Prefix prepended to every lookup, used for error messages.
    fn prefix(&self) -> &str {
        ""
    }

    fn select(&self, prefix: &str) -> StoreView<'_>
    where
        Self: Sized,
    {
        StoreView::new(self, prefix)
    }
}

/// A store seen through a name prefix.
pub struct StoreView<'a> {
    inner: &'a dyn TensorStore,
    local: String,
    full: String,
}

impl<'a> StoreView<'a> {
    pub fn new(inner: &'a dyn TensorStore, prefix: &str) -> Self {
        Self {
            full: qualified_name(inner.prefix(), prefix),
            local: prefix.to_string(),
            inner,
        }
    }
}

impl TensorStore for StoreView<'_> {
    fn get_tensor(&self, name: &str) -> Result<Option<Tensor>> {
        self.inner.get_tensor(&qualified_name(&self.local, name))
    }

    fn get_sharded_tensor(
        &self,
        name: &str,
        dim: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<Option<Tensor>> {
        self.inner
            .get_sharded_tensor(&qualified_name(&self.local, name), dim, rank, world_size)
    }

    fn contains(&self, name: &str) -> bool {
        self.inner.contains(&qualified_name(&self.local, name))
    }

    fn prefix(&self) -> &str {
        &self.full
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    tensors: HashMap<String, Tensor>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, xs: Tensor) -> &mut Self {
        self.tensors.insert(name.into(), xs);
        self
    }
}

impl<S: Into<String>> FromIterator<(S, Tensor)> for InMemoryStore {
    fn from_iter<I: IntoIterator<Item = (S, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl TensorStore for InMemoryStore {
    fn get_tensor(&self, name: &str) -> Result<Option<Tensor>> {
        Ok(self.tensors.get(name).cloned())
    }
}

/// How a parameter is laid out across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharding {
    Replicated,
    Split(usize),
}

/// How fused sub-tensors combine into one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    Concat(usize),
    /// Every slot must carry the same tensor, which becomes the parameter.
    Identical,
}

/// A pre-allocated parameter and whether it has received checkpoint data.
#[derive(Debug, Clone)]
pub struct Param {
    name: &'static str,
    tensor: Tensor,
    sharding: Sharding,
    merge: MergeRule,
    required: bool,
    loaded: bool,
}

impl Param {
    pub fn new(name: &'static str, tensor: Tensor, sharding: Sharding) -> Self {
        let merge = match sharding {
            Sharding::Split(dim) => MergeRule::Concat(dim),
            Sharding::Replicated => MergeRule::Identical,
        };
        Self {
            name,
            tensor,
            sharding,
            merge,
            required: true,
            loaded: false,
        }
    }

    /// Not checked by verification.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_merge(mut self, merge: MergeRule) -> Self {
        self.merge = merge;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn check_shape(&self, qualified: &str, src: &Tensor) -> Result<()> {
        if src.shape() != self.tensor.shape() {
            return Err(Error::ShapeMismatch {
                name: qualified.to_string(),
                expected: self.tensor.shape().clone(),
                got: src.shape().clone(),
            });
        }
        Ok(())
    }

    /// Copy `src` in, cast to this parameter's dtype and device, and mark it
    /// loaded. The parameter is untouched on a shape mismatch.
    pub fn copy_from(&mut self, qualified: &str, src: &Tensor) -> Result<()> {
        self.check_shape(qualified, src)?;
        self.tensor = src
            .to_dtype(self.tensor.dtype())?
            .to_device(self.tensor.device())?;
        self.loaded = true;
        Ok(())
    }

    fn fetch(
        &self,
        store: &dyn TensorStore,
        name: &str,
        rank: usize,
        world_size: usize,
    ) -> Result<Option<Tensor>> {
        match self.sharding {
            Sharding::Replicated => store.get_tensor(name),
            Sharding::Split(dim) => store.get_sharded_tensor(name, dim, rank, world_size),
        }
    }
}

#[derive(Debug, Clone)]
struct FusedMerge {
    slots: Vec<Option<Tensor>>,
    complete: bool,
}

impl FusedMerge {
    fn new(n_slots: usize) -> Self {
        Self {
            slots: vec![None; n_slots],
            complete: false,
        }
    }

    fn fill(&mut self, name: &str, slot: usize, xs: Tensor) -> Result<()> {
        if self.complete || self.slots[slot].is_some() {
            return Err(Error::DuplicateFill {
                name: name.to_string(),
                slot,
            });
        }
        self.slots[slot] = Some(xs);
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn merge(&self, name: &str, rule: MergeRule) -> Result<Tensor> {
        let parts = self.slots.iter().flatten().collect::<Vec<_>>();
        match rule {
            MergeRule::Concat(dim) => Ok(Tensor::cat(&parts, dim)?),
            MergeRule::Identical => {
                let first = parts[0];
                for (slot, other) in parts.iter().enumerate().skip(1) {
                    if !same_values(first, other)? {
                        config_bail!("{name}: slot {slot} differs from slot 0");
                    }
                }
                Ok(first.clone())
            }
        }
    }
}

fn same_values(a: &Tensor, b: &Tensor) -> Result<bool> {
    if a.shape() != b.shape() || a.dtype() != b.dtype() {
        return Ok(false);
    }
    let differing = a
        .ne(b)?
        .to_dtype(DType::U32)?
        .flatten_all()?
        .sum(0)?
        .to_scalar::<u32>()?;
    Ok(differing == 0)
}

fn fused_label(prefixes: &[String]) -> String {
    let names = prefixes
        .iter()
        .map(|p| p.trim_end_matches('.'))
        .collect::<Vec<_>>();
    format!("[{}]", names.join(","))
}

/// Adjusts a freshly fetched tensor before shape checks, e.g. rebasing a
/// sharded index map.
pub type Fixup<'a> = &'a dyn Fn(&Param, Tensor) -> Result<Tensor>;

/// The parameters of one layer plus their fused-merge state.
#[derive(Debug, Clone)]
pub struct ParamSet {
    params: Vec<Param>,
    merges: Vec<Option<FusedMerge>>,
    fused_prefixes: Option<Vec<String>>,
}

impl ParamSet {
    pub fn new(params: Vec<Param>) -> Self {
        let merges = vec![None; params.len()];
        Self {
            params,
            merges,
            fused_prefixes: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn tensor(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .map(Param::tensor)
            .ok_or_else(|| Error::Config(format!("unknown parameter {name}")))
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.get(name).is_some_and(Param::is_loaded)
    }

    pub fn load(&mut self, store: &dyn TensorStore, rank: usize, world_size: usize) -> Result<()> {
        self.load_with(store, rank, world_size, &|_, xs| Ok(xs))
    }

    /// Direct mode: every present parameter is fetched and shape-checked
    /// before any of them is committed.
    pub fn load_with(
        &mut self,
        store: &dyn TensorStore,
        rank: usize,
        world_size: usize,
        fixup: Fixup<'_>,
    ) -> Result<()> {
        let mut staged = Vec::new();
        for (idx, param) in self.params.iter().enumerate() {
            let qualified = qualified_name(store.prefix(), param.name);
            let Some(xs) = param.fetch(store, param.name, rank, world_size)? else {
                continue;
            };
            let xs = fixup(param, xs)?;
            param.check_shape(&qualified, &xs)?;
            staged.push((idx, qualified, xs));
        }
        for (idx, qualified, xs) in staged {
            self.params[idx].copy_from(&qualified, &xs)?;
            debug!("Loaded {qualified} {:?}", xs.shape());
        }
        Ok(())
    }

    pub fn load_fused(
        &mut self,
        store: &dyn TensorStore,
        prefixes: &[&str],
        rank: usize,
        world_size: usize,
    ) -> Result<()> {
        self.load_fused_with(store, prefixes, rank, world_size, &|_, xs| Ok(xs))
    }

    /// Fused mode: `<prefix><param>` fills slot `i` of the prefix list. A
    /// parameter is committed once all of its slots are filled, possibly
    /// across several calls with the same prefix list.
    pub fn load_fused_with(
        &mut self,
        store: &dyn TensorStore,
        prefixes: &[&str],
        rank: usize,
        world_size: usize,
        fixup: Fixup<'_>,
    ) -> Result<()> {
        let prefixes = self.check_prefixes(prefixes)?;
        let label = fused_label(&prefixes);

        let mut merges = self.merges.clone();
        let mut merged = Vec::new();
        for (idx, param) in self.params.iter().enumerate() {
            let qualified = qualified_name(store.prefix(), &format!("{label}.{}", param.name));
            let merge = merges[idx].get_or_insert_with(|| FusedMerge::new(prefixes.len()));
            let mut filled = false;
            for (slot, prefix) in prefixes.iter().enumerate() {
                let name = qualified_name(prefix, param.name);
                if let Some(xs) = param.fetch(store, &name, rank, world_size)? {
                    let xs = fixup(param, xs)?;
                    merge.fill(&qualified_name(store.prefix(), &name), slot, xs)?;
                    filled = true;
                }
            }
            if filled && merge.is_full() {
                let xs = merge.merge(&qualified, param.merge)?;
                param.check_shape(&qualified, &xs)?;
                merge.complete = true;
                merge.slots.iter_mut().for_each(|s| *s = None);
                merged.push((idx, qualified, xs));
            }
        }

        self.merges = merges;
        self.fused_prefixes = Some(prefixes);
        for (idx, qualified, xs) in merged {
            self.params[idx].copy_from(&qualified, &xs)?;
            debug!("Merged {qualified} {:?}", xs.shape());
        }
        Ok(())
    }

    fn check_prefixes(&self, prefixes: &[&str]) -> Result<Vec<String>> {
        if prefixes.is_empty() {
            config_bail!("fused load needs at least one prefix");
        }
        let mut seen = HashSet::new();
        for prefix in prefixes {
            if !seen.insert(*prefix) {
                config_bail!("duplicate fused prefix {prefix:?}");
            }
        }
        let prefixes = prefixes.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        if let Some(existing) = &self.fused_prefixes {
            if *existing != prefixes {
                config_bail!(
                    "fused prefixes {prefixes:?} differ from earlier call {existing:?}"
                );
            }
        }
        Ok(prefixes)
    }

    /// Fails on the first required parameter that never received data.
    pub fn verify(&self, prefix: &str) -> Result<()> {
        match self.params.iter().find(|p| p.required && !p.loaded) {
            Some(p) => Err(Error::IncompleteLoad {
                name: qualified_name(prefix, p.name),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::*;

    fn arange(rows: usize, cols: usize, offset: f32) -> Tensor {
        let data = (0..rows * cols)
            .map(|i| i as f32 + offset)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    }

    fn column_set() -> ParamSet {
        ParamSet::new(vec![
            Param::new(
                "weight",
                Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
                Sharding::Split(0),
            ),
            Param::new(
                "bias",
                Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap(),
                Sharding::Split(0),
            )
            .optional(),
        ])
    }

    #[test]
    fn qualified_names() {
        assert_eq!(qualified_name("", "qweight"), "qweight");
        assert_eq!(qualified_name("o_proj.", "qweight"), "o_proj.qweight");
        assert_eq!(qualified_name("o_proj", "qweight"), "o_proj.qweight");
    }

    #[test]
    fn nested_views_prepend_prefixes() -> Result<()> {
        let mut store = InMemoryStore::new();
        store.insert("model.layers.0.o_proj.qweight", arange(2, 2, 0.));
        let layer = store.select("model.layers.0");
        let proj = layer.select("o_proj.");
        assert_eq!(proj.prefix(), "model.layers.0.o_proj.");
        assert!(proj.contains("qweight"));
        assert!(!proj.contains("scales"));
        assert!(proj.get_tensor("scales")?.is_none());
        Ok(())
    }

    #[test]
    fn sharding_rejects_uneven_split() -> Result<()> {
        let xs = arange(4, 3, 0.);
        let shard = shard_tensor(&xs, 0, 1, 2)?;
        assert_eq!(shard.to_vec2::<f32>()?, arange(2, 3, 6.).to_vec2::<f32>()?);
        assert!(matches!(shard_tensor(&xs, 1, 0, 2), Err(Error::Config(_))));
        Ok(())
    }

    #[test]
    fn direct_load_takes_rank_shard() -> Result<()> {
        let mut set = column_set();
        let mut store = InMemoryStore::new();
        store.insert("weight", arange(4, 3, 0.));
        set.load(&store, 1, 2)?;
        assert!(set.is_loaded("weight"));
        assert!(!set.is_loaded("bias"));
        assert_eq!(
            set.tensor("weight")?.to_vec2::<f32>()?,
            arange(2, 3, 6.).to_vec2::<f32>()?
        );
        set.verify("proj")?;
        Ok(())
    }

    #[test]
    fn shape_mismatch_commits_nothing() -> Result<()> {
        let mut set = column_set();
        let mut store = InMemoryStore::new();
        store.insert("layer.weight", arange(2, 3, 1.));
        store.insert("layer.bias", arange(1, 3, 0.));
        let view = store.select("layer");
        match set.load(&view, 0, 1) {
            Err(Error::ShapeMismatch { name, .. }) => assert_eq!(name, "layer.bias"),
            other => panic!("expected shape mismatch, got {other:?}"),
        }
        assert!(!set.is_loaded("weight"));
        assert_eq!(set.tensor("weight")?.sum_all()?.to_scalar::<f32>()?, 0.);
        Ok(())
    }

    #[test]
    fn verify_names_missing_param() {
        let set = column_set();
        match set.verify("model.o_proj") {
            Err(Error::IncompleteLoad { name }) => assert_eq!(name, "model.o_proj.weight"),
            other => panic!("expected incomplete load, got {other:?}"),
        }
    }

    #[test]
    fn fused_load_across_calls() -> Result<()> {
        let mut set = ParamSet::new(vec![Param::new(
            "weight",
            Tensor::zeros((3, 2), DType::F32, &Device::Cpu)?,
            Sharding::Split(0),
        )]);
        let prefixes = ["q_proj.", "k_proj.", "v_proj."];

        let mut first = InMemoryStore::new();
        first.insert("q_proj.weight", arange(1, 2, 0.));
        first.insert("v_proj.weight", arange(1, 2, 4.));
        set.load_fused(&first, &prefixes, 0, 1)?;
        assert!(!set.is_loaded("weight"));
        assert!(set.verify("attn").is_err());

        let mut second = InMemoryStore::new();
        second.insert("k_proj.weight", arange(1, 2, 2.));
        set.load_fused(&second, &prefixes, 0, 1)?;
        assert!(set.is_loaded("weight"));
        assert_eq!(
            set.tensor("weight")?.to_vec2::<f32>()?,
            arange(3, 2, 0.).to_vec2::<f32>()?
        );

        // Every slot is spent once the merge completes.
        assert!(matches!(
            set.load_fused(&second, &prefixes, 0, 1),
            Err(Error::DuplicateFill { slot: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn fused_duplicate_slot_is_rejected() -> Result<()> {
        let mut set = ParamSet::new(vec![Param::new(
            "weight",
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?,
            Sharding::Split(0),
        )]);
        let mut store = InMemoryStore::new();
        store.insert("a.weight", arange(1, 2, 0.));
        set.load_fused(&store, &["a.", "b."], 0, 1)?;
        match set.load_fused(&store, &["a.", "b."], 0, 1) {
            Err(Error::DuplicateFill { name, slot }) => {
                assert_eq!(name, "a.weight");
                assert_eq!(slot, 0);
            }
            other => panic!("expected duplicate fill, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn fused_prefix_list_is_fixed() -> Result<()> {
        let mut set = column_set();
        let store = InMemoryStore::new();
        assert!(matches!(
            set.load_fused(&store, &["a.", "a."], 0, 1),
            Err(Error::Config(_))
        ));
        set.load_fused(&store, &["a.", "b."], 0, 1)?;
        assert!(matches!(
            set.load_fused(&store, &["b.", "a."], 0, 1),
            Err(Error::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn identical_merge_requires_equal_slots() -> Result<()> {
        let make = || {
            ParamSet::new(vec![Param::new(
                "g_idx",
                Tensor::zeros(4, DType::U32, &Device::Cpu).unwrap(),
                Sharding::Replicated,
            )])
        };
        let same = Tensor::new(&[0u32, 0, 1, 1], &Device::Cpu)?;
        let other = Tensor::new(&[0u32, 1, 1, 1], &Device::Cpu)?;

        let mut set = make();
        let store: InMemoryStore = [("a.g_idx", same.clone()), ("b.g_idx", same.clone())]
            .into_iter()
            .collect();
        set.load_fused(&store, &["a.", "b."], 0, 1)?;
        assert_eq!(set.tensor("g_idx")?.to_vec1::<u32>()?, vec![0, 0, 1, 1]);

        let mut set = make();
        let store: InMemoryStore = [("a.g_idx", same), ("b.g_idx", other)]
            .into_iter()
            .collect();
        assert!(matches!(
            set.load_fused(&store, &["a.", "b."], 0, 1),
            Err(Error::Config(_))
        ));
        Ok(())
    }
}
