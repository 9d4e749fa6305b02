use std::sync::{Condvar, Mutex, MutexGuard};

use candle_core::Tensor;

use super::Collective;
use crate::{error::config_bail, Error, Result};

#[derive(Debug, Default)]
struct RendezvousState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Reusable barrier that can be aborted, releasing every current and future
/// waiter with an error.
#[derive(Debug)]
struct Rendezvous {
    parties: usize,
    state: Mutex<RendezvousState>,
    cvar: Condvar,
}

impl Rendezvous {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(RendezvousState::default()),
            cvar: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, RendezvousState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state();
        if state.aborted {
            return Err(aborted());
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            state = self
                .cvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.generation != generation {
            Ok(())
        } else {
            Err(aborted())
        }
    }

    fn abort(&self) {
        self.state().aborted = true;
        self.cvar.notify_all();
    }
}

fn aborted() -> Error {
    Error::Collective("collective aborted by a failed rank".to_string())
}

/// In-process collective for ranks running as threads of one process.
///
/// Each call is two barrier phases: every rank publishes its tensor into its
/// own slot, then reads all slots, then clears its slot once everybody has read.
/// After [`Collective::abort`] every pending and later call fails.
#[derive(Debug)]
pub struct ThreadCollective {
    world_size: usize,
    barrier: Rendezvous,
    slots: Mutex<Vec<Option<Tensor>>>,
}

impl ThreadCollective {
    pub fn new(world_size: usize) -> Result<Self> {
        if world_size == 0 {
            config_bail!("world size must be at least 1");
        }
        Ok(Self {
            world_size,
            barrier: Rendezvous::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        })
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Option<Tensor>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish `xs`, run `f` over every rank's tensor, then retire the slot.
    /// Both barrier phases run even when `f` fails so peers never hang.
    fn exchange<T>(
        &self,
        rank: usize,
        xs: &Tensor,
        f: impl FnOnce(&[Tensor]) -> Result<T>,
    ) -> Result<T> {
        if rank >= self.world_size {
            return Err(Error::Collective(format!(
                "rank {rank} outside world of size {}",
                self.world_size
            )));
        }
        self.slots()[rank] = Some(xs.clone());
        if let Err(e) = self.barrier.wait() {
            self.slots()[rank] = None;
            return Err(e);
        }

        let published = self.slots().iter().cloned().collect::<Option<Vec<_>>>();
        let out = match published {
            Some(all) => f(&all),
            None => Err(Error::Collective("a rank did not publish".to_string())),
        };

        let done = self.barrier.wait();
        self.slots()[rank] = None;
        done.and(out)
    }
}

impl Collective for ThreadCollective {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, rank: usize, xs: &Tensor) -> Result<Tensor> {
        let device = xs.device().clone();
        self.exchange(rank, xs, |all| {
            for (peer, t) in all.iter().enumerate() {
                if t.shape() != xs.shape() || t.dtype() != xs.dtype() {
                    return Err(Error::Collective(format!(
                        "all_reduce mismatch: rank {rank} has {:?}/{:?}, rank {peer} has {:?}/{:?}",
                        xs.shape(),
                        xs.dtype(),
                        t.shape(),
                        t.dtype()
                    )));
                }
            }
            // Fixed rank order so every rank produces bit-identical sums.
            let mut acc = all[0].to_device(&device)?;
            for t in &all[1..] {
                acc = acc.add(&t.to_device(&device)?)?;
            }
            Ok(acc)
        })
    }

    fn all_gather(&self, rank: usize, xs: &Tensor) -> Result<Vec<Tensor>> {
        self.exchange(rank, xs, |all| {
            if let Some(peer) = all.iter().position(|t| t.dtype() != xs.dtype()) {
                return Err(Error::Collective(format!(
                    "all_gather dtype mismatch between rank {rank} and rank {peer}"
                )));
            }
            Ok(all.to_vec())
        })
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait()
    }

    fn abort(&self) {
        self.barrier.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn abort_releases_waiting_ranks() {
        let collective = ThreadCollective::new(3).unwrap();
        let results = thread::scope(|s| {
            let waiters = (0..2)
                .map(|_| s.spawn(|| collective.barrier()))
                .collect::<Vec<_>>();
            collective.abort();
            waiters
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(Error::Collective(_)))));
        assert!(collective.barrier().is_err());
    }

    #[test]
    fn barrier_is_reusable() {
        let collective = ThreadCollective::new(2).unwrap();
        thread::scope(|s| {
            let peer = s.spawn(|| (0..5).try_for_each(|_| collective.barrier()));
            (0..5).try_for_each(|_| collective.barrier()).unwrap();
            peer.join().unwrap().unwrap();
        });
    }
}
