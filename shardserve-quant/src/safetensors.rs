use std::{collections::HashMap, fmt, path::Path};

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::{self as st, SafeTensors};
use tracing::debug;

use crate::{
    error::config_bail,
    loading::{shard_tensor, TensorStore},
    Error, Result,
};

/// Storage dtype of a safetensors entry. Packed int32 words are read as
/// bit-identical `u32`.
fn storage_dtype(name: &str, dtype: st::Dtype) -> Result<DType> {
    Ok(match dtype {
        st::Dtype::U8 => DType::U8,
        st::Dtype::U32 | st::Dtype::I32 => DType::U32,
        st::Dtype::I64 => DType::I64,
        st::Dtype::BF16 => DType::BF16,
        st::Dtype::F16 => DType::F16,
        st::Dtype::F32 => DType::F32,
        st::Dtype::F64 => DType::F64,
        other => config_bail!("{name} has unsupported safetensors dtype {other:?}"),
    })
}

#[derive(yoke::Yokeable)]
struct SafeTensors_<'a>(SafeTensors<'a>);

/// Memory-mapped safetensors checkpoint, possibly split over several files.
pub struct SafetensorsStore {
    safetensors: Vec<yoke::Yoke<SafeTensors_<'static>, memmap2::Mmap>>,
    routing: HashMap<String, usize>,
    device: Device,
}

impl fmt::Debug for SafetensorsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetensorsStore")
            .field("files", &self.safetensors.len())
            .field("tensors", &self.routing.len())
            .field("device", &self.device)
            .finish()
    }
}

impl SafetensorsStore {
    /// Map every file and read its header. Tensors are created on `device`.
    ///
    /// If a tensor name appears in multiple files, the last entry is returned.
    ///
    /// # Safety
    ///
    /// The unsafe is inherited from [`memmap2::MmapOptions`]: the files must
    /// not be modified while the store is alive.
    pub unsafe fn new<P: AsRef<Path>>(paths: &[P], device: &Device) -> Result<Self> {
        let mut routing = HashMap::new();
        let mut safetensors = vec![];
        for (index, p) in paths.iter().enumerate() {
            let p = p.as_ref();
            let file = std::fs::File::open(p)?;
            let file = memmap2::MmapOptions::new().map(&file)?;
            let data = yoke::Yoke::<SafeTensors_<'static>, memmap2::Mmap>::try_attach_to_cart(
                file,
                |data: &[u8]| {
                    let st = SafeTensors::deserialize(data).map_err(|e| {
                        Error::Config(format!("cannot read safetensors header of {}: {e}", p.display()))
                    })?;
                    Ok::<_, Error>(SafeTensors_(st))
                },
            )?;
            for k in data.get().0.names() {
                routing.insert(k.to_string(), index);
            }
            debug!("Mapped {}", p.display());
            safetensors.push(data)
        }
        Ok(Self {
            safetensors,
            routing,
            device: device.clone(),
        })
    }

    fn view(&self, name: &str) -> Result<Option<st::TensorView<'_>>> {
        let Some(&index) = self.routing.get(name) else {
            return Ok(None);
        };
        let view = self.safetensors[index]
            .get()
            .0
            .tensor(name)
            .map_err(|e| Error::Config(format!("cannot read {name}: {e}")))?;
        Ok(Some(view))
    }
}

impl TensorStore for SafetensorsStore {
    fn get_tensor(&self, name: &str) -> Result<Option<Tensor>> {
        let Some(view) = self.view(name)? else {
            return Ok(None);
        };
        let dtype = storage_dtype(name, view.dtype())?;
        Ok(Some(Tensor::from_raw_buffer(
            view.data(),
            dtype,
            view.shape(),
            &self.device,
        )?))
    }

    /// Slices dims 0 and 1 straight out of the mapping; other dims go through
    /// a full load.
    fn get_sharded_tensor(
        &self,
        name: &str,
        dim: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<Option<Tensor>> {
        use safetensors::slice::IndexOp;

        let Some(view) = self.view(name)? else {
            return Ok(None);
        };
        let mut shape = view.shape().to_vec();
        if world_size == 1 || dim > 1 || dim >= shape.len() {
            return self
                .get_tensor(name)?
                .map(|xs| shard_tensor(&xs, dim, rank, world_size))
                .transpose();
        }

        let size = shape[dim];
        if size % world_size != 0 {
            config_bail!("cannot split {name} {shape:?} along dim {dim} into {world_size} parts");
        }
        let block_size = size / world_size;
        let start = rank * block_size;
        let stop = (rank + 1) * block_size;

        let sliced = if dim == 0 {
            view.slice(start..stop)
        } else {
            view.slice((.., start..stop))
        };
        let iterator = sliced.map_err(|_| {
            Error::Config(format!(
                "cannot slice {name} ({shape:?}) along dim {dim} with {start}..{stop}"
            ))
        })?;
        shape[dim] = block_size;

        let dtype = storage_dtype(name, view.dtype())?;
        let raw: Vec<u8> = iterator.into_iter().flatten().cloned().collect();
        Ok(Some(Tensor::from_raw_buffer(
            &raw,
            dtype,
            &shape,
            &self.device,
        )?))
    }

    fn contains(&self, name: &str) -> bool {
        self.routing.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};

    use super::*;

    #[test]
    fn slices_shards_from_mapped_file() -> Result<()> {
        let dev = Device::Cpu;
        let weight = Tensor::arange(0f32, 24., &dev)?.reshape((4, 6))?;
        let qweight = Tensor::new(&[[0xFFFF_FFFFu32, 1, 2, 3], [4, 5, 6, 7]], &dev)?;
        let tensors = HashMap::from([
            ("layer.weight".to_string(), weight.clone()),
            ("layer.qweight".to_string(), qweight.clone()),
        ]);
        let path = std::env::temp_dir().join(format!(
            "shardserve-quant-store-{}.safetensors",
            std::process::id()
        ));
        candle_core::safetensors::save(&tensors, &path)?;

        let store = unsafe { SafetensorsStore::new(&[&path], &dev)? };
        let layer = store.select("layer");
        assert!(layer.contains("weight"));
        assert!(layer.get_tensor("bias")?.is_none());

        let rows = layer.get_sharded_tensor("weight", 0, 1, 2)?.unwrap();
        assert_eq!(rows.to_vec2::<f32>()?, weight.narrow(0, 2, 2)?.to_vec2::<f32>()?);
        let cols = layer.get_sharded_tensor("weight", 1, 2, 3)?.unwrap();
        assert_eq!(cols.to_vec2::<f32>()?, weight.narrow(1, 4, 2)?.to_vec2::<f32>()?);
        assert!(matches!(
            layer.get_sharded_tensor("weight", 1, 0, 4),
            Err(Error::Config(_))
        ));

        let packed = layer.get_sharded_tensor("qweight", 1, 0, 2)?.unwrap();
        assert_eq!(packed.dtype(), DType::U32);
        assert_eq!(packed.to_vec2::<u32>()?, vec![vec![0xFFFF_FFFF, 1], vec![4, 5]]);

        drop(store);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
