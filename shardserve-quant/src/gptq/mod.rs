//! GPTQ weight codec: bit (un)packing and group-wise dequantization.

use candle_core::{DType, Device, Tensor};

use crate::{error::config_bail, Result};

pub mod layers;
mod workspace;

pub use layers::{GptqColumnParallel, GptqRowParallel};
pub use workspace::DequantWorkspace;

macro_rules! pack_factor {
    ($bits:expr) => {
        32 / $bits
    };
}

/// Dimension along which low-bit values are packed into 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackDim {
    /// `[in / pack_factor, out]`, the usual GPTQ layout.
    #[default]
    Rows = 0,
    /// `[in, out / pack_factor]`.
    Cols = 1,
}

impl PackDim {
    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<usize> for PackDim {
    type Error = crate::Error;

    fn try_from(dim: usize) -> Result<Self> {
        match dim {
            0 => Ok(Self::Rows),
            1 => Ok(Self::Cols),
            other => config_bail!("packing dimension must be 0 or 1, got {other}"),
        }
    }
}

/// How stored zero-points relate to the value subtracted during dequantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroPointEncoding {
    /// Stored value is the zero-point.
    #[default]
    Exact,
    /// Stored value is `zero - 1` (legacy `checkpoint_format = "gptq"`).
    OffByOne,
}

impl ZeroPointEncoding {
    /// `None` maps to [`ZeroPointEncoding::Exact`].
    pub fn from_checkpoint_format(format: Option<&str>) -> Result<Self> {
        match format {
            None | Some("gptq_v2") => Ok(Self::Exact),
            Some("gptq") => Ok(Self::OffByOne),
            Some(other) => config_bail!(
                "unsupported checkpoint_format `{other}`, expected `gptq` or `gptq_v2`"
            ),
        }
    }

    fn offset(self) -> i64 {
        match self {
            Self::Exact => 0,
            Self::OffByOne => 1,
        }
    }
}

/// Number of `bits`-wide values per 32-bit word.
pub fn pack_factor(bits: usize) -> Result<usize> {
    if !(1..=16).contains(&bits) || 32 % bits != 0 {
        config_bail!("bits must divide 32 and be at most 16, got {bits}");
    }
    Ok(pack_factor!(bits))
}

pub fn n_groups(in_features: usize, group_size: usize) -> usize {
    in_features.div_ceil(group_size)
}

fn host_words(xs: &Tensor) -> Result<Vec<Vec<u32>>> {
    Ok(xs
        .to_device(&Device::Cpu)?
        .to_dtype(DType::U32)?
        .to_vec2::<u32>()?)
}

/// Expand packed words into one `u32` per value along `dim`, low bits first.
pub fn unpack(packed: &Tensor, bits: usize, dim: PackDim) -> Result<Tensor> {
    let pf = pack_factor(bits)?;
    let mask = (1u32 << bits) - 1;
    let words = host_words(packed)?;
    let (rows, cols) = packed.dims2()?;

    let (out_rows, out_cols) = match dim {
        PackDim::Rows => (rows * pf, cols),
        PackDim::Cols => (rows, cols * pf),
    };
    let mut out = vec![0u32; out_rows * out_cols];
    for (r, row) in words.iter().enumerate() {
        for (c, &word) in row.iter().enumerate() {
            for k in 0..pf {
                let value = (word >> (bits * k)) & mask;
                let idx = match dim {
                    PackDim::Rows => (r * pf + k) * out_cols + c,
                    PackDim::Cols => r * out_cols + c * pf + k,
                };
                out[idx] = value;
            }
        }
    }
    Ok(Tensor::from_vec(out, (out_rows, out_cols), packed.device())?)
}

/// Inverse of [`unpack`]. Every value must fit in `bits`.
pub fn pack(values: &Tensor, bits: usize, dim: PackDim) -> Result<Tensor> {
    let pf = pack_factor(bits)?;
    let (rows, cols) = values.dims2()?;
    let device = values.device().clone();
    let values = host_words(values)?;

    let (out_rows, out_cols) = match dim {
        PackDim::Rows if rows % pf == 0 => (rows / pf, cols),
        PackDim::Cols if cols % pf == 0 => (rows, cols / pf),
        _ => config_bail!("cannot pack {rows}x{cols} by {pf} along {dim:?}"),
    };
    let mut out = vec![0u32; out_rows * out_cols];
    for (r, row) in values.iter().enumerate() {
        for (c, &value) in row.iter().enumerate() {
            if value >> bits != 0 {
                config_bail!("value {value} at ({r}, {c}) does not fit in {bits} bits");
            }
            let (idx, k) = match dim {
                PackDim::Rows => ((r / pf) * out_cols + c, r % pf),
                PackDim::Cols => (r * out_cols + c / pf, c % pf),
            };
            out[idx] |= value << (bits * k);
        }
    }
    Ok(Tensor::from_vec(out, (out_rows, out_cols), &device)?)
}

/// `g_idx[i] = i / group_size`, equivalent to passing no index map.
pub fn sequential_g_idx(in_features: usize, group_size: usize, device: &Device) -> Result<Tensor> {
    if group_size == 0 {
        config_bail!("group_size must be positive");
    }
    let idx = (0..in_features)
        .map(|i| (i / group_size) as u32)
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(idx, in_features, device)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequantParams {
    pub bits: usize,
    pub group_size: usize,
    pub pack_dim: PackDim,
    pub zero_point: ZeroPointEncoding,
}

/// `w[i, j] = scales[g(i), j] * (q[i, j] - z[g(i), j])`, with `g(i) = g_idx[i]`
/// when an index map is given and `i / group_size` otherwise.
///
/// Returns `[in_features, out_features]` in the dtype and on the device of
/// `scales`. Computed on the host in f32.
pub fn dequantize(
    qweight: &Tensor,
    qzeros: &Tensor,
    scales: &Tensor,
    g_idx: Option<&Tensor>,
    params: &DequantParams,
) -> Result<Tensor> {
    let DequantParams {
        bits,
        group_size,
        pack_dim,
        zero_point,
    } = *params;
    if group_size == 0 {
        config_bail!("group_size must be positive");
    }

    let q = host_words(&unpack(qweight, bits, pack_dim)?)?;
    let z = host_words(&unpack(qzeros, bits, PackDim::Cols)?)?;
    let s = scales
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .to_vec2::<f32>()?;

    let in_features = q.len();
    let out_features = q.first().map_or(0, Vec::len);
    let n_groups = s.len();
    if s.first().map_or(0, Vec::len) != out_features {
        config_bail!(
            "scales {:?} do not match {out_features} output features",
            scales.shape()
        );
    }
    if z.len() != n_groups || z.first().map_or(0, Vec::len) != out_features {
        config_bail!(
            "qzeros {:?} do not unpack to {n_groups}x{out_features}",
            qzeros.shape()
        );
    }

    let groups = match g_idx {
        Some(g_idx) => {
            let groups = g_idx.to_device(&Device::Cpu)?.to_vec1::<u32>()?;
            if groups.len() != in_features {
                config_bail!(
                    "g_idx has {} entries for {in_features} input features",
                    groups.len()
                );
            }
            groups.into_iter().map(|g| g as usize).collect::<Vec<_>>()
        }
        None => (0..in_features).map(|i| i / group_size).collect(),
    };
    if let Some((i, g)) = groups.iter().enumerate().find(|&(_, &g)| g >= n_groups) {
        config_bail!("input row {i} maps to group {g}, but only {n_groups} groups exist");
    }

    let offset = zero_point.offset();
    let mut out = Vec::with_capacity(in_features * out_features);
    for (row, &g) in q.iter().zip(groups.iter()) {
        for (j, &value) in row.iter().enumerate() {
            let zero = z[g][j] as i64 + offset;
            out.push(s[g][j] * (value as i64 - zero) as f32);
        }
    }
    Ok(Tensor::from_vec(out, (in_features, out_features), &Device::Cpu)?
        .to_dtype(scales.dtype())?
        .to_device(scales.device())?)
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::*;
    use crate::Error;

    const PARAMS: DequantParams = DequantParams {
        bits: 4,
        group_size: 2,
        pack_dim: PackDim::Cols,
        zero_point: ZeroPointEncoding::Exact,
    };

    /// 4x2 packed qweight (4 inputs, 16 outputs), two groups.
    fn fixture() -> (Tensor, Tensor, Tensor) {
        let dev = Device::Cpu;
        let qweight = Tensor::new(
            &[
                [0x76543210u32, 0xFEDCBA98],
                [0x01234567, 0x89ABCDEF],
                [0x11111111, 0x22222222],
                [0x00000000, 0xFFFFFFFF],
            ],
            &dev,
        )
        .unwrap();
        let qzeros = Tensor::new(
            &[[0x88888888u32, 0x88888888], [0x00000000, 0x44444444]],
            &dev,
        )
        .unwrap();
        let mut scales = vec![0.5f32; 16];
        scales.extend([2.0f32; 8]);
        scales.extend([-1.0f32; 8]);
        let scales = Tensor::from_vec(scales, (2, 16), &dev).unwrap();
        (qweight, qzeros, scales)
    }

    #[test]
    fn dequantize_matches_hand_computed() -> Result<()> {
        let (qweight, qzeros, scales) = fixture();
        let w = dequantize(&qweight, &qzeros, &scales, None, &PARAMS)?;
        assert_eq!(w.dims(), &[4, 16]);
        let w = w.to_vec2::<f32>()?;

        let row0 = (0..16).map(|j| 0.5 * (j as f32 - 8.)).collect::<Vec<_>>();
        assert_eq!(w[0], row0);
        assert_eq!(
            w[1],
            vec![
                -0.5, -1.0, -1.5, -2.0, -2.5, -3.0, -3.5, -4.0, 3.5, 3.0, 2.5, 2.0, 1.5, 1.0, 0.5,
                0.0
            ]
        );
        assert_eq!(w[2], vec![2.0; 16]);
        let mut row3 = vec![0.0f32; 8];
        row3.extend([-11.0f32; 8]);
        assert_eq!(w[3], row3);
        Ok(())
    }

    #[test]
    fn sequential_g_idx_agrees_with_fallback() -> Result<()> {
        let (qweight, qzeros, scales) = fixture();
        let g_idx = sequential_g_idx(4, 2, &Device::Cpu)?;
        assert_eq!(g_idx.to_vec1::<u32>()?, vec![0, 0, 1, 1]);
        let with = dequantize(&qweight, &qzeros, &scales, Some(&g_idx), &PARAMS)?;
        let without = dequantize(&qweight, &qzeros, &scales, None, &PARAMS)?;
        assert_eq!(with.to_vec2::<f32>()?, without.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn explicit_g_idx_selects_groups() -> Result<()> {
        let (qweight, qzeros, scales) = fixture();
        let g_idx = Tensor::new(&[1u32, 0, 1, 0], &Device::Cpu)?;
        let w = dequantize(&qweight, &qzeros, &scales, Some(&g_idx), &PARAMS)?.to_vec2::<f32>()?;
        // Row 0 now uses group 1: scale 2, zero 0 on the first eight outputs.
        assert_eq!(w[0][3], 6.0);
        assert_eq!(w[0][9], -5.0);
        // Row 3 uses group 0: scale 0.5, zero 8.
        assert_eq!(w[3][0], -4.0);

        let bad = Tensor::new(&[0u32, 0, 1, 2], &Device::Cpu)?;
        assert!(matches!(
            dequantize(&qweight, &qzeros, &scales, Some(&bad), &PARAMS),
            Err(Error::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn off_by_one_zero_points() -> Result<()> {
        let (qweight, qzeros, scales) = fixture();
        let params = DequantParams {
            zero_point: ZeroPointEncoding::OffByOne,
            ..PARAMS
        };
        let w = dequantize(&qweight, &qzeros, &scales, None, &params)?.to_vec2::<f32>()?;
        assert_eq!(w[0][0], -4.5);
        assert_eq!(w[2][0], 0.0);
        assert_eq!(w[2][8], 3.0);
        Ok(())
    }

    #[test]
    fn partial_final_group_reuses_last_row() -> Result<()> {
        // Three inputs with group_size 2: the third row is alone in group 1.
        let values = Tensor::new(&[[1u32, 2, 3, 4, 5, 6, 7, 8], [3; 8], [9; 8]], &Device::Cpu)?;
        let qweight = pack(&values, 4, PackDim::Cols)?;
        let qzeros = pack(&Tensor::new(&[[1u32; 8], [4; 8]], &Device::Cpu)?, 4, PackDim::Cols)?;
        let scales = Tensor::new(&[[1f32; 8], [0.5; 8]], &Device::Cpu)?.to_dtype(DType::F16)?;
        let w = dequantize(&qweight, &qzeros, &scales, None, &PARAMS)?;
        assert_eq!(w.dtype(), DType::F16);
        let w = w.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        assert_eq!(w[0], vec![0., 1., 2., 3., 4., 5., 6., 7.]);
        assert_eq!(w[1], vec![2.; 8]);
        assert_eq!(w[2], vec![2.5; 8]);
        Ok(())
    }

    #[test]
    fn unpack_rows_low_bits_first() -> Result<()> {
        let packed = Tensor::new(&[[0b11_10_01_00u32 | (0b01 << 30)]], &Device::Cpu)?;
        let values = unpack(&packed, 2, PackDim::Rows)?;
        assert_eq!(values.dims(), &[16, 1]);
        let values = values.flatten_all()?.to_vec1::<u32>()?;
        assert_eq!(&values[..4], &[0, 1, 2, 3]);
        assert_eq!(values[15], 1);
        let repacked = pack(&unpack(&packed, 2, PackDim::Rows)?, 2, PackDim::Rows)?;
        assert_eq!(repacked.to_vec2::<u32>()?, packed.to_vec2::<u32>()?);
        Ok(())
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(matches!(pack_factor(3), Err(Error::Config(_))));
        assert!(matches!(pack_factor(32), Err(Error::Config(_))));
        assert_eq!(pack_factor(8).unwrap(), 4);
        assert!(matches!(PackDim::try_from(2), Err(Error::Config(_))));
        assert!(matches!(
            pack(&Tensor::new(&[[16u32; 8]], &Device::Cpu).unwrap(), 4, PackDim::Cols),
            Err(Error::Config(_))
        ));
        assert_eq!(
            ZeroPointEncoding::from_checkpoint_format(Some("gptq")).unwrap(),
            ZeroPointEncoding::OffByOne
        );
    }
}
