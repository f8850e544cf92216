//! Named shared memory holding one [`Metrics`] instance.
//!
//! The region is a POSIX shared memory object (`shm_open`) sized to exactly
//! one `Metrics` and mapped read-write. Whichever process opens it first
//! creates it; the kernel zero-fills new objects, which is a valid empty
//! `Metrics`. Dropping a handle only unmaps the local view. The object itself
//! lives until [`SharedMetrics::remove`] unlinks it or the host reboots.

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use rtlat_common::error::{LatError, LatResult};
use rtlat_common::metrics::Metrics;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::ptr::NonNull;
use tracing::{debug, info, warn};

/// Size of the shared object in bytes.
pub const METRICS_REGION_SIZE: usize = std::mem::size_of::<Metrics>();

static_assertions::const_assert!(METRICS_REGION_SIZE > 0);

/// A mapped view of the shared metrics region.
pub struct SharedMetrics {
    name: String,
    ptr: NonNull<Metrics>,
    len: usize,
}

// SAFETY: the mapping holds a Metrics, which consists only of atomics and is
// therefore Sync; the handle owns nothing thread-affine.
unsafe impl Send for SharedMetrics {}
// SAFETY: see above
unsafe impl Sync for SharedMetrics {}

fn shm_error(name: &str, op: &'static str, reason: impl ToString) -> LatError {
    LatError::SharedMemory {
        name: name.to_string(),
        op,
        reason: reason.to_string(),
    }
}

impl SharedMetrics {
    /// Create or attach the region called `name` and map it.
    ///
    /// Concurrent callers converge on one object. An existing object of the
    /// wrong size is resized.
    ///
    /// # Errors
    ///
    /// Returns [`LatError::SharedMemory`] naming the step that failed.
    pub fn open_or_create(name: &str) -> LatResult<Self> {
        Self::open_with_size(name, METRICS_REGION_SIZE)
    }

    /// Like [`open_or_create`](Self::open_or_create), with the region size
    /// given by the caller.
    ///
    /// The mapping is viewed as one [`Metrics`], so `size` must be exactly
    /// [`METRICS_REGION_SIZE`]; a region laid out by a different build is
    /// rejected instead of being reinterpreted.
    ///
    /// # Errors
    ///
    /// Returns [`LatError::SharedMemory`] for a mismatched `size` or when a
    /// step fails.
    pub fn open_with_size(name: &str, size: usize) -> LatResult<Self> {
        if size != METRICS_REGION_SIZE {
            return Err(shm_error(
                name,
                "size",
                format!("region must be {METRICS_REGION_SIZE} bytes, not {size}"),
            ));
        }

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP,
        )
        .map_err(|e| shm_error(name, "open", e))?;
        let file = File::from(fd);

        let len = METRICS_REGION_SIZE;
        let current = file
            .metadata()
            .map_err(|e| shm_error(name, "stat", e))?
            .len();
        if current != len as u64 {
            if current != 0 {
                warn!(name, current, expected = len, "Resizing shared metrics region");
            }
            file.set_len(len as u64)
                .map_err(|e| shm_error(name, "size", e))?;
        }

        let length =
            NonZeroUsize::new(len).ok_or_else(|| shm_error(name, "map", "zero length"))?;

        // SAFETY: fresh mapping of a file we just sized to `len`; the kernel
        // picks the address so nothing existing is replaced
        let addr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|e| shm_error(name, "map", e))?;

        debug!(name, len, created = current == 0, "Shared metrics region mapped");

        Ok(Self {
            name: name.to_string(),
            ptr: addr.cast::<Metrics>(),
            len,
        })
    }

    /// Logical name of the region.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unlink the named object. Existing mappings stay valid.
    ///
    /// Returns `false` when no such object existed.
    ///
    /// # Errors
    ///
    /// Returns [`LatError::SharedMemory`] for failures other than absence.
    pub fn remove(name: &str) -> LatResult<bool> {
        match shm_unlink(name) {
            Ok(()) => {
                info!(name, "Shared metrics region removed");
                Ok(true)
            }
            Err(nix::errno::Errno::ENOENT) => Ok(false),
            Err(e) => Err(shm_error(name, "unlink", e)),
        }
    }
}

impl Deref for SharedMetrics {
    type Target = Metrics;

    fn deref(&self) -> &Metrics {
        // SAFETY: ptr is a live, page-aligned mapping of METRICS_REGION_SIZE
        // bytes. Metrics holds only integer atomics, for which every byte
        // pattern is valid, and all access goes through them
        unsafe { self.ptr.as_ref() }
    }
}

impl std::fmt::Debug for SharedMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMetrics")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Drop for SharedMetrics {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in open_or_create and
        // no reference derived from it outlives self
        let result = unsafe { munmap(self.ptr.cast(), self.len) };
        if let Err(e) = result {
            warn!(name = %self.name, error = %e, "munmap of shared metrics failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtlat_common::metrics::LatencyLimits;
    use rtlat_common::time::Timestamp;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unique_name() -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "/rtlat-test-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_new_region_is_empty() {
        let name = unique_name();
        let shm = match SharedMetrics::open_or_create(&name) {
            Ok(s) => s,
            Err(e) => {
                println!("Skipping test due to error: {e}");
                return;
            }
        };

        assert_eq!(shm.counter(), 0);
        assert_eq!(shm.histogram_total(), 0);
        assert!(!shm.reset_pending());
        assert_eq!(shm.name(), name);

        drop(shm);
        assert!(SharedMetrics::remove(&name).unwrap());
    }

    #[test]
    fn test_two_handles_share_state() {
        let name = unique_name();
        let writer = match SharedMetrics::open_or_create(&name) {
            Ok(s) => s,
            Err(e) => {
                println!("Skipping test due to error: {e}");
                return;
            }
        };
        let reader = SharedMetrics::open_or_create(&name).unwrap();

        let limits = LatencyLimits::new(1000);
        writer.update(12, Timestamp::new(1, 0), &limits);
        writer.update(30, Timestamp::new(1, 1_000_000), &limits);

        assert_eq!(reader.counter(), 2);
        assert_eq!(reader.bucket(12), 1);
        assert_eq!(reader.max_lat(), 30);

        reader.request_reset();
        assert!(writer.reset_pending());

        drop(writer);
        drop(reader);
        SharedMetrics::remove(&name).unwrap();
    }

    #[test]
    fn test_wrong_size_rejected() {
        let name = unique_name();
        let err = SharedMetrics::open_with_size(&name, METRICS_REGION_SIZE / 2).unwrap_err();
        assert!(matches!(err, LatError::SharedMemory { op: "size", .. }));
        // nothing was created
        assert!(!SharedMetrics::remove(&name).unwrap_or(false));
    }

    #[test]
    fn test_garbage_edge_flags_do_not_hide_late_run() {
        use std::os::unix::fs::FileExt;

        let name = unique_name();
        let fd = match shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => fd,
            Err(e) => {
                println!("Skipping test due to error: {e}");
                return;
            }
        };
        let file = File::from(fd);
        file.set_len(METRICS_REGION_SIZE as u64).unwrap();
        // the two edge flags follow the reset byte
        file.write_all_at(&[0xFF, 0xFF], 1).unwrap();
        drop(file);

        let shm = SharedMetrics::open_or_create(&name).unwrap();
        let limits = LatencyLimits::new(1000);
        assert!(shm.update(2000, Timestamp::new(1, 0), &limits).is_some());
        shm.update(2000, Timestamp::new(1, 1_000_000), &limits);
        assert_eq!(shm.late_count(), 1);
        assert_eq!(shm.late_sum_us(), 1000);

        drop(shm);
        assert!(SharedMetrics::remove(&name).unwrap());
    }

    #[test]
    fn test_unmap_keeps_object() {
        let name = unique_name();
        let first = match SharedMetrics::open_or_create(&name) {
            Ok(s) => s,
            Err(e) => {
                println!("Skipping test due to error: {e}");
                return;
            }
        };
        first.update(5, Timestamp::new(2, 0), &LatencyLimits::new(1000));
        drop(first);

        let second = SharedMetrics::open_or_create(&name).unwrap();
        assert_eq!(second.counter(), 1);
        drop(second);

        assert!(SharedMetrics::remove(&name).unwrap());
        assert!(!SharedMetrics::remove(&name).unwrap());
    }
}
