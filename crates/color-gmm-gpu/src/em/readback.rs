//! Asynchronous populated-bin count readback.
//!
//! The count is copied out of the dispatch-args record in the same
//! submission that computes it and mapped without blocking. The map
//! callback fires on a later `poll`, records the value and notifies
//! listeners. A monotonically increasing run id makes callbacks of a
//! superseded initialization no-ops.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::gpu::GpuContext;

/// Callback invoked with the populated-bin count of each initialization.
pub type BinCountListener = Arc<dyn Fn(u32) + Send + Sync>;

/// Where the populated-bin count of the current run stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinCount {
    /// No run, or the transfer has not completed yet.
    Pending,
    Ready(u32),
    /// The transfer failed. Fatal to the run.
    Failed(String),
}

struct Shared {
    run: u64,
    count: BinCount,
    listeners: Vec<BinCountListener>,
}

pub(crate) struct BinCountReadback {
    shared: Arc<Mutex<Shared>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Byte offset of `DispatchArgs::count` inside dispatch record 0.
const COUNT_OFFSET: u64 = 12;

impl BinCountReadback {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                run: 0,
                count: BinCount::Pending,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, listener: BinCountListener) {
        lock(&self.shared).listeners.push(listener);
    }

    /// Start tracking a new run, invalidating any transfer still in flight.
    pub fn begin(&self) -> u64 {
        let mut shared = lock(&self.shared);
        shared.run += 1;
        shared.count = BinCount::Pending;
        shared.run
    }

    /// Forget the current run.
    pub fn reset(&self) {
        self.begin();
    }

    pub fn count(&self) -> BinCount {
        lock(&self.shared).count.clone()
    }

    /// Record a copy of the populated-bin count into a fresh staging buffer.
    pub fn encode_copy(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        dispatch_args: &wgpu::Buffer,
    ) -> wgpu::Buffer {
        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Bin Count Staging Buffer"),
            size: std::mem::size_of::<u32>() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(
            dispatch_args,
            COUNT_OFFSET,
            &staging,
            0,
            std::mem::size_of::<u32>() as u64,
        );
        staging
    }

    /// Map `staging` after its copy was submitted. Completion is reported
    /// on a later device poll.
    pub fn watch(&self, staging: wgpu::Buffer, run: u64) {
        let shared = Arc::clone(&self.shared);
        let mapped = staging.clone();

        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let value = result.map_err(|e| e.to_string()).and_then(|()| {
                    let value = {
                        let data = mapped.slice(..).get_mapped_range();
                        data.get(..4).map(bytemuck::pod_read_unaligned::<u32>)
                    };
                    mapped.unmap();
                    value.ok_or_else(|| "short bin count read".to_string())
                });
                mapped.destroy();
                complete(&shared, run, value);
            });
    }
}

/// Record the outcome of run `run`'s transfer and notify listeners on
/// success. Outcomes of a superseded run are discarded.
fn complete(shared: &Mutex<Shared>, run: u64, value: std::result::Result<u32, String>) {
    let outcome = match value {
        Ok(count) => BinCount::Ready(count),
        Err(message) => BinCount::Failed(message),
    };

    let listeners = {
        let mut shared = lock(shared);
        if shared.run != run {
            tracing::warn!("Discarding bin count of superseded run {}", run);
            return;
        }
        shared.count = outcome.clone();
        shared.listeners.clone()
    };

    match outcome {
        BinCount::Ready(count) => {
            tracing::info!("Run {} has {} populated color bins", run, count);
            for listener in &listeners {
                listener(count);
            }
        }
        BinCount::Failed(message) => {
            tracing::error!("Bin count readback of run {} failed: {}", run, message);
        }
        BinCount::Pending => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::DispatchArgs;

    #[test]
    fn test_count_offset_matches_layout() {
        assert_eq!(COUNT_OFFSET as usize, std::mem::offset_of!(DispatchArgs, count));
    }

    fn counting_listener(readback: &BinCountReadback) -> Arc<AtomicU32> {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        readback.subscribe(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        calls
    }

    #[test]
    fn test_completed_count_notifies_listeners() {
        let readback = BinCountReadback::new();
        let calls = counting_listener(&readback);
        let run = readback.begin();

        complete(&readback.shared, run, Ok(42));
        assert_eq!(readback.count(), BinCount::Ready(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_transfer_is_recorded_without_notifying() {
        let readback = BinCountReadback::new();
        let calls = counting_listener(&readback);
        let run = readback.begin();

        complete(&readback.shared, run, Err("device lost".into()));
        assert_eq!(readback.count(), BinCount::Failed("device lost".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_superseded_run_is_discarded() {
        let readback = BinCountReadback::new();
        let calls = counting_listener(&readback);
        let stale = readback.begin();
        let current = readback.begin();

        complete(&readback.shared, stale, Ok(9));
        complete(&readback.shared, stale, Err("late failure".into()));
        assert_eq!(readback.count(), BinCount::Pending);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        complete(&readback.shared, current, Ok(3));
        assert_eq!(readback.count(), BinCount::Ready(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_begin_invalidates_previous_run() {
        let readback = BinCountReadback::new();
        let first = readback.begin();
        lock(&readback.shared).count = BinCount::Ready(7);
        let second = readback.begin();
        assert!(second > first);
        assert_eq!(readback.count(), BinCount::Pending);
    }
}
