pub mod log;

use candle_core::{Tensor, D};

use crate::Result;

/// `xs @ w` over the last dimension of `xs`, for `w` laid out `[in, out]`.
///
/// The activation is cast to the weight dtype for the product and the result is
/// cast back to the activation dtype.
pub(crate) fn matmul_last_dim(xs: &Tensor, w: &Tensor) -> Result<Tensor> {
    let in_dim = xs.dim(D::Minus1)?;
    let mut out_dims = xs.dims()[..xs.rank() - 1].to_vec();
    out_dims.push(w.dim(1)?);

    let original_dtype = xs.dtype();
    let xs = xs.reshape(((), in_dim))?.to_dtype(w.dtype())?;
    Ok(xs
        .matmul(w)?
        .reshape(out_dims)?
        .to_dtype(original_dtype)?)
}
