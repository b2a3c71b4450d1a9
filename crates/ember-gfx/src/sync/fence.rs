use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::command::Queue;
use crate::config::ValidationMode;
use crate::device::Device;
use crate::error::{GfxError, GfxResult, SyncError};
use crate::hal::{Backend, HalError, RawFence, WaitStatus};

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`CompletionFence`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FenceId(u64);

impl fmt::Display for FenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A point on a fence's timeline: reached once the device has finished
/// everything queued before the label was put.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label {
    /// Fence value the device writes once the label is reached.
    value: u64,
    /// Fence that issued the label.
    fence: FenceId,
}

impl Label {
    pub fn value(self) -> u64 {
        self.value
    }

    pub fn fence(self) -> FenceId {
        self.fence
    }
}

/// Monotonic completion counter shared with the device.
///
/// Labels are issued 1, 2, 3, ... in queue order. Single-threaded by contract.
pub struct CompletionFence {
    backend: Arc<dyn Backend>,
    /// `None` once the device fence has been destroyed.
    raw: Option<RawFence>,
    /// Stamped into every label this fence issues.
    id: FenceId,
    /// Value of the most recent label.
    issued: u64,
    blocking_waits: Cell<u64>,
    /// What a label from another fence does.
    validation: ValidationMode,
    /// Bound on a blocking wait. `None` waits forever.
    timeout: Option<Duration>,
}

impl CompletionFence {
    pub fn new(device: &Device) -> GfxResult<Self> {
        let backend = Arc::clone(device.backend());
        let raw = backend
            .create_fence(0)
            .map_err(GfxError::resource("completion fence"))?;
        let id = FenceId(NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed));
        log::debug!("completion fence {id} created");

        Ok(Self {
            backend,
            raw: Some(raw),
            id,
            issued: 0,
            blocking_waits: Cell::new(0),
            validation: device.config().validation,
            timeout: device.config().fence_timeout,
        })
    }

    pub fn id(&self) -> FenceId {
        self.id
    }

    /// Value of the most recent label, 0 before the first.
    pub fn last_issued(&self) -> u64 {
        self.issued
    }

    /// Number of waits that had to block.
    pub fn blocking_waits(&self) -> u64 {
        self.blocking_waits.get()
    }

    /// Highest value the device has signalled.
    pub fn completed_value(&self) -> GfxResult<u64> {
        self.backend
            .fence_value(self.raw()?)
            .map_err(|e| SyncError::Device(e).into())
    }

    pub fn is_complete(&self, label: Label) -> GfxResult<bool> {
        Ok(self.completed_value()? >= label.value)
    }

    /// Issues the next label and has `queue` signal it after all work queued so far.
    pub fn put_label(&mut self, queue: &Queue) -> GfxResult<Label> {
        let value = self.issued + 1;
        self.backend
            .signal_fence(queue.raw(), self.raw()?, value)
            .map_err(SyncError::Device)?;
        self.issued = value;

        log::trace!("fence {} label {value}", self.id);
        Ok(Label {
            value,
            fence: self.id,
        })
    }

    /// Blocks until the device has passed `label`.
    ///
    /// Returns without touching the wait primitive if it already has. A label
    /// beyond the last one this fence issued can never be reached and fails
    /// straight away, whatever the validation mode.
    pub fn wait_for_label(&self, label: Label) -> GfxResult<()> {
        self.check_owner(label)?;
        if label.value > self.issued {
            return Err(SyncError::NotIssued {
                value: label.value,
                issued: self.issued,
            }
            .into());
        }

        let completed = self.completed_value()?;
        if completed >= label.value {
            return Ok(());
        }

        self.blocking_waits.set(self.blocking_waits.get() + 1);
        log::trace!(
            "fence {} waiting for {} (completed {completed})",
            self.id,
            label.value
        );

        match self
            .backend
            .wait_fence(self.raw()?, label.value, self.timeout)
            .map_err(SyncError::Device)?
        {
            WaitStatus::Reached => Ok(()),
            WaitStatus::TimedOut => Err(SyncError::Timeout {
                value: label.value,
                completed: self.completed_value().unwrap_or(completed),
            }
            .into()),
        }
    }

    /// Destroys the device fence, reporting failure.
    pub fn shutdown(mut self) -> GfxResult<()> {
        self.release()
    }

    pub(crate) fn release(&mut self) -> GfxResult<()> {
        match self.raw.take() {
            Some(raw) => self
                .backend
                .destroy_fence(raw)
                .map_err(|e| SyncError::Device(e).into()),
            None => Ok(()),
        }
    }

    fn raw(&self) -> GfxResult<RawFence> {
        self.raw
            .ok_or_else(|| SyncError::Device(HalError::invalid("fence", 0)).into())
    }

    fn check_owner(&self, label: Label) -> GfxResult<()> {
        if label.fence == self.id || self.validation == ValidationMode::Off {
            return Ok(());
        }

        let err = SyncError::ForeignLabel {
            label: label.value,
            label_fence: label.fence.0,
            fence: self.id.0,
        };
        match self.validation {
            ValidationMode::Strict => Err(err.into()),
            _ => {
                log::warn!("{err}");
                Ok(())
            }
        }
    }
}

impl fmt::Debug for CompletionFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionFence")
            .field("id", &self.id)
            .field("issued", &self.issued)
            .field("blocking_waits", &self.blocking_waits.get())
            .finish_non_exhaustive()
    }
}

impl Drop for CompletionFence {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("failed to destroy completion fence {}: {e}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    fn soft(config: DeviceConfig) -> (Device, Queue) {
        let device = Device::create(&config).unwrap();
        let queue = device.create_queue().unwrap();
        (device, queue)
    }

    #[test]
    fn labels_count_up_from_one() {
        let (device, queue) = soft(DeviceConfig::soft());
        let mut fence = CompletionFence::new(&device).unwrap();
        assert_eq!(fence.last_issued(), 0);

        let values: Vec<u64> = (0..3)
            .map(|_| fence.put_label(&queue).unwrap().value())
            .collect();
        assert_eq!(values, [1, 2, 3]);
        assert_eq!(fence.last_issued(), 3);
    }

    #[test]
    fn waiting_reaches_label_and_completion_is_monotonic() {
        let (device, queue) = soft(DeviceConfig::soft());
        let mut fence = CompletionFence::new(&device).unwrap();

        let first = fence.put_label(&queue).unwrap();
        let second = fence.put_label(&queue).unwrap();
        fence.wait_for_label(second).unwrap();

        assert!(fence.is_complete(first).unwrap());
        assert!(fence.completed_value().unwrap() >= 2);

        // Waiting for an older label afterwards never blocks.
        let blocked = fence.blocking_waits();
        fence.wait_for_label(first).unwrap();
        fence.wait_for_label(second).unwrap();
        assert_eq!(fence.blocking_waits(), blocked);
    }

    #[test]
    fn slow_device_forces_a_blocking_wait() {
        let (device, queue) = soft(DeviceConfig {
            soft_latency: Duration::from_millis(30),
            ..DeviceConfig::soft()
        });
        let mut fence = CompletionFence::new(&device).unwrap();

        let mut list = device.create_command_list(&device.create_command_allocator()).unwrap();
        list.close().unwrap();
        queue.execute_command_lists(&[&list]).unwrap();

        let label = fence.put_label(&queue).unwrap();
        fence.wait_for_label(label).unwrap();
        assert_eq!(fence.blocking_waits(), 1);
        assert!(fence.is_complete(label).unwrap());
    }

    #[test]
    fn timeout_is_reported() {
        let (device, queue) = soft(DeviceConfig {
            soft_latency: Duration::from_millis(300),
            fence_timeout: Some(Duration::from_millis(10)),
            ..DeviceConfig::soft()
        });
        let mut fence = CompletionFence::new(&device).unwrap();

        let mut list = device.create_command_list(&device.create_command_allocator()).unwrap();
        list.close().unwrap();
        queue.execute_command_lists(&[&list]).unwrap();

        let label = fence.put_label(&queue).unwrap();
        let err = fence.wait_for_label(label).unwrap_err();
        assert!(matches!(
            err,
            GfxError::Synchronization(SyncError::Timeout { value: 1, .. })
        ));
    }

    #[test]
    fn foreign_labels_follow_validation_mode() {
        let strict = DeviceConfig {
            validation: ValidationMode::Strict,
            ..DeviceConfig::soft()
        };
        let (device, queue) = soft(strict);
        let a = CompletionFence::new(&device).unwrap();
        let mut b = CompletionFence::new(&device).unwrap();
        assert_ne!(a.id(), b.id());

        let from_b = b.put_label(&queue).unwrap();
        b.wait_for_label(from_b).unwrap();
        assert!(matches!(
            a.wait_for_label(from_b),
            Err(GfxError::Synchronization(SyncError::ForeignLabel { .. }))
        ));

        let warn = DeviceConfig {
            validation: ValidationMode::Warn,
            ..DeviceConfig::soft()
        };
        let (device, queue) = soft(warn);
        let mut a = CompletionFence::new(&device).unwrap();
        let b = CompletionFence::new(&device).unwrap();
        let own = a.put_label(&queue).unwrap();
        a.wait_for_label(own).unwrap();

        // Same value, other fence: checked against `a`'s own timeline.
        let foreign = Label {
            value: own.value(),
            fence: b.id(),
        };
        a.wait_for_label(foreign).unwrap();

        let off = DeviceConfig {
            validation: ValidationMode::Off,
            ..DeviceConfig::soft()
        };
        let (device, queue) = soft(off);
        let mut a = CompletionFence::new(&device).unwrap();
        let mut b = CompletionFence::new(&device).unwrap();
        let own = a.put_label(&queue).unwrap();
        let from_b = b.put_label(&queue).unwrap();
        a.wait_for_label(own).unwrap();
        // No identity check at all: only the value is compared.
        a.wait_for_label(from_b).unwrap();
    }

    #[test]
    fn labels_never_issued_fail_without_blocking() {
        for validation in [ValidationMode::Warn, ValidationMode::Off] {
            let (device, queue) = soft(DeviceConfig {
                validation,
                fence_timeout: None,
                ..DeviceConfig::soft()
            });
            let mut a = CompletionFence::new(&device).unwrap();
            let mut b = CompletionFence::new(&device).unwrap();
            a.put_label(&queue).unwrap();
            let ahead = (0..5).map(|_| b.put_label(&queue).unwrap()).last().unwrap();

            let err = a.wait_for_label(ahead).unwrap_err();
            assert!(matches!(
                err,
                GfxError::Synchronization(SyncError::NotIssued { value: 5, issued: 1 })
            ));
            assert_eq!(a.blocking_waits(), 0);
        }
    }

    #[test]
    fn device_loss_surfaces_as_sync_error() {
        let backend = Arc::new(crate::hal::soft::SoftBackend::new(Default::default()).unwrap());
        let device = Device::from_backend(backend.clone(), DeviceConfig::soft());
        let queue = device.create_queue().unwrap();
        let mut fence = CompletionFence::new(&device).unwrap();

        backend.remove_device("test reset");
        let err = match fence.put_label(&queue) {
            Ok(label) => fence.wait_for_label(label).unwrap_err(),
            Err(e) => e,
        };
        assert!(err.is_device_lost());
        assert!(fence.shutdown().is_err());
    }

    #[test]
    fn shutdown_destroys_the_device_fence() {
        let (device, _queue) = soft(DeviceConfig::soft());
        let fence = CompletionFence::new(&device).unwrap();
        fence.shutdown().unwrap();
    }
}
