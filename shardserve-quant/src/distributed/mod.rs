use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::{error::config_bail, Error, Result};

pub mod layers;
mod local;

pub use local::ThreadCollective;

static NEXT_COMM_ID: AtomicU64 = AtomicU64::new(0);

/// Identifier of one communicator context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(u64);

/// Process-wide communicator context.
///
/// Must be initialized before any process group is created and can only be
/// torn down once every group built from it has been dropped.
#[derive(Debug)]
pub struct CommContext {
    id: Id,
    shut_down: AtomicBool,
}

impl CommContext {
    pub fn init() -> Arc<Self> {
        let id = Id(NEXT_COMM_ID.fetch_add(1, Ordering::Relaxed));
        info!("Initialized communicator context {id:?}");
        Arc::new(Self {
            id,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Release the context. Fails while any process group still holds it; the
    /// context is marked shut down either way and those groups refuse further
    /// collectives.
    pub fn teardown(self: Arc<Self>) -> Result<()> {
        self.shut_down.store(true, Ordering::Release);
        match Arc::try_unwrap(self) {
            Ok(ctx) => {
                info!("Tore down communicator context {:?}", ctx.id);
                Ok(())
            }
            Err(ctx) => Err(Error::Collective(format!(
                "cannot tear down communicator context {:?}: {} process group(s) still alive",
                ctx.id,
                Arc::strong_count(&ctx) - 1
            ))),
        }
    }
}

/// Transport behind a process group. One instance is shared by every rank of
/// the group; each call blocks until all ranks have issued the matching call.
pub trait Collective: Send + Sync + Debug {
    fn world_size(&self) -> usize;

    /// Element-wise sum of every rank's `xs`, returned to every rank on the
    /// device of its own input.
    fn all_reduce_sum(&self, rank: usize, xs: &Tensor) -> Result<Tensor>;

    /// Every rank's `xs`, in rank order.
    fn all_gather(&self, rank: usize, xs: &Tensor) -> Result<Vec<Tensor>>;

    fn barrier(&self) -> Result<()>;

    /// Fail every pending and later call on every rank. Used when a rank
    /// stops participating.
    fn abort(&self) {}
}

pub trait BarrierLike {
    fn wait(&self) -> Result<()>;
}

/// One rank's membership in a fixed-size collective group, bound to a device.
#[derive(Debug)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    device: Device,
    collective: Arc<dyn Collective>,
    ctx: Arc<CommContext>,
}

impl ProcessGroup {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn comm_id(&self) -> Id {
        self.ctx.id()
    }

    fn check_live(&self) -> Result<()> {
        if self.ctx.is_shut_down() {
            return Err(Error::Collective(format!(
                "communicator context {:?} was torn down",
                self.ctx.id()
            )));
        }
        Ok(())
    }

    /// In-place element-wise sum of `xs` across the group.
    ///
    /// Every rank must call this once, with a tensor of identical shape and
    /// dtype, for each logical step. An unmatched call blocks until a peer
    /// calls [`ProcessGroup::abort`].
    pub fn all_reduce(&self, xs: &mut Tensor) -> Result<()> {
        self.check_live()?;
        if self.world_size == 1 {
            return Ok(());
        }
        *xs = self.collective.all_reduce_sum(self.rank, &xs.contiguous()?)?;
        Ok(())
    }

    /// Release peers blocked in a collective this rank will never join. The
    /// group is unusable afterwards.
    pub fn abort(&self) {
        self.collective.abort();
    }

    /// Concatenate every rank's `xs` along `dim`, in rank order.
    pub fn all_gather(&self, xs: &Tensor, dim: usize) -> Result<Tensor> {
        self.check_live()?;
        if self.world_size == 1 {
            return Ok(xs.clone());
        }
        let parts = self
            .collective
            .all_gather(self.rank, &xs.contiguous()?)?
            .into_iter()
            .map(|part| part.to_device(&self.device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, dim)?)
    }
}

impl BarrierLike for ProcessGroup {
    fn wait(&self) -> Result<()> {
        self.check_live()?;
        if self.world_size == 1 {
            return Ok(());
        }
        self.collective.barrier()
    }
}

/// Create one process group per device, rank = index in `devices`, all bound
/// to `ctx` and sharing one in-process collective.
pub fn create_process_groups(
    ctx: &Arc<CommContext>,
    devices: &[Device],
) -> Result<Vec<Arc<ProcessGroup>>> {
    let collective: Arc<dyn Collective> = Arc::new(ThreadCollective::new(devices.len())?);
    create_process_groups_with(ctx, devices, collective)
}

/// Like [`create_process_groups`], over a caller-provided transport.
pub fn create_process_groups_with(
    ctx: &Arc<CommContext>,
    devices: &[Device],
    collective: Arc<dyn Collective>,
) -> Result<Vec<Arc<ProcessGroup>>> {
    if devices.is_empty() {
        config_bail!("cannot create process groups without devices");
    }
    let world_size = devices.len();
    if collective.world_size() != world_size {
        config_bail!(
            "collective expects world size {}, got {world_size} devices",
            collective.world_size()
        );
    }

    let mut groups = Vec::with_capacity(world_size);
    for (rank, device) in devices.iter().enumerate() {
        // Surface allocation failures here rather than on the first collective.
        Tensor::zeros(1, DType::F32, device)?;
        groups.push(Arc::new(ProcessGroup {
            rank,
            world_size,
            device: device.clone(),
            collective: collective.clone(),
            ctx: ctx.clone(),
        }));
    }
    info!(
        "Created {world_size} process group(s) on communicator {:?}",
        ctx.id()
    );
    Ok(groups)
}

/// Rank and world size of the group a layer belongs to, plus the group itself.
#[derive(Debug, Clone)]
pub struct ParallelArgs {
    rank: usize,
    world_size: usize,
    process_group: Arc<ProcessGroup>,
}

impl ParallelArgs {
    pub fn new(process_group: Arc<ProcessGroup>) -> Self {
        Self {
            rank: process_group.rank(),
            world_size: process_group.world_size(),
            process_group,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn process_group(&self) -> &Arc<ProcessGroup> {
        &self.process_group
    }
}

/// Sum all-reduce bound to a process group.
#[derive(Debug, Clone)]
pub struct SumAllReduce {
    group: Arc<ProcessGroup>,
}

impl SumAllReduce {
    pub fn new(group: &Arc<ProcessGroup>) -> Self {
        Self {
            group: group.clone(),
        }
    }

    pub fn sum_all_reduce(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        self.group.all_reduce(&mut xs)?;
        Ok(xs)
    }
}

/// All-gather along the last dimension, bound to a process group.
#[derive(Debug, Clone)]
pub struct AllGather {
    group: Arc<ProcessGroup>,
}

impl AllGather {
    pub fn new(group: &Arc<ProcessGroup>) -> Self {
        Self {
            group: group.clone(),
        }
    }

    pub fn all_gather(&self, xs: &Tensor) -> Result<Tensor> {
        let dim = xs.rank().saturating_sub(1);
        self.group.all_gather(xs, dim)
    }
}

/// `features / world_size`, or a configuration error when it does not divide.
pub(crate) fn partition(features: usize, world_size: usize, what: &str) -> Result<usize> {
    if world_size == 0 || features % world_size != 0 {
        config_bail!("{what} ({features}) is not divisible by world size {world_size}");
    }
    Ok(features / world_size)
}

/// Aborts the group's collective unless disarmed, including while unwinding.
struct AbortOnFailure {
    group: Arc<ProcessGroup>,
    armed: bool,
}

impl Drop for AbortOnFailure {
    fn drop(&mut self) {
        if self.armed {
            self.group.abort();
        }
    }
}

/// Run `f` once per rank, each on its own scoped thread, and collect the
/// per-rank results in rank order.
///
/// A rank that returns an error or panics aborts the shared collective, so
/// peers waiting on it fail instead of blocking.
pub fn launch<T, F>(groups: &[Arc<ProcessGroup>], f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(Arc<ProcessGroup>) -> Result<T> + Sync,
{
    thread::scope(|s| {
        let handles = groups
            .iter()
            .map(|group| {
                let group = group.clone();
                let f = &f;
                s.spawn(move || {
                    let mut guard = AbortOnFailure {
                        group: group.clone(),
                        armed: true,
                    };
                    let out = f(group);
                    guard.armed = out.is_err();
                    out
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::Collective(format!("rank {rank} panicked"))))
            })
            .collect()
    })
}
