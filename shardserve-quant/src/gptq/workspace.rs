use std::sync::{Mutex, MutexGuard};

use candle_core::Tensor;
use tracing::trace;

use crate::Result;

/// Owned buffer holding a layer's dequantized weight.
///
/// Materialized on first [`acquire`](Self::acquire) and held until
/// [`release`](Self::release), a reload, or drop.
#[derive(Debug, Default)]
pub struct DequantWorkspace {
    weight: Mutex<Option<Tensor>>,
}

impl DequantWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Tensor>> {
        self.weight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The materialized weight, running `init` if the workspace is empty. A
    /// failing `init` leaves the workspace empty.
    pub fn acquire(&self, init: impl FnOnce() -> Result<Tensor>) -> Result<Tensor> {
        let mut slot = self.slot();
        if let Some(weight) = slot.as_ref() {
            return Ok(weight.clone());
        }
        let weight = init()?;
        trace!("Acquired dequant workspace {:?}", weight.shape());
        *slot = Some(weight.clone());
        Ok(weight)
    }

    pub fn release(&self) {
        if let Some(weight) = self.slot().take() {
            trace!("Released dequant workspace {:?}", weight.shape());
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.slot().is_some()
    }
}

impl Drop for DequantWorkspace {
    fn drop(&mut self) {
        self.release();
    }
}
