//! One-call process table query with a growing, capped buffer.

use std::time::Instant;

use crate::{
    config::TelemetryConfig,
    telemetry::{
        decode::{ProcessRecords, NATIVE_LAYOUT},
        ProcessSnapshot, SnapshotSource,
    },
    Result, WtopError,
};

/// Outcome of one raw query attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// The table fit; `written` bytes are valid.
    Complete { written: usize },
    /// The buffer was too small. `required` is the size the OS reported,
    /// or zero when it did not say.
    TooSmall { required: usize },
    Failed(u32),
}

/// 8-byte aligned scratch buffer handed to the kernel.
#[derive(Debug)]
pub struct QueryBuffer {
    words: Vec<u64>,
    valid: usize,
}

impl QueryBuffer {
    fn with_len(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8)],
            valid: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.words.len() * 8
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        let len = self.capacity();
        // SAFETY: `words` owns `len` initialised bytes; u8 has no alignment
        // or validity requirements and the borrow is tied to `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), len) }
    }

    /// The bytes the last successful query wrote.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `valid <= capacity()` is maintained by `query_with_growth`.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.valid) }
    }

    /// Address name pointers inside the buffer are relative to.
    pub fn base_address(&self) -> usize {
        self.words.as_ptr() as usize
    }
}

/// Runs `query` until the table fits, doubling the buffer (or jumping to the
/// reported size when larger) on each "too small" answer. Fails with
/// [`WtopError::SnapshotTooLarge`] once growth would pass `limit`.
pub fn query_with_growth<F>(initial: usize, limit: usize, mut query: F) -> Result<QueryBuffer>
where
    F: FnMut(&mut [u8]) -> QueryStatus,
{
    let mut len = initial.max(8);
    loop {
        let mut buffer = QueryBuffer::with_len(len);
        match query(buffer.as_mut_bytes()) {
            QueryStatus::Complete { written } => {
                let capacity = buffer.capacity();
                buffer.valid = if written == 0 {
                    capacity
                } else {
                    written.min(capacity)
                };
                return Ok(buffer);
            }
            QueryStatus::TooSmall { required } => {
                let next = len.saturating_mul(2).max(required);
                if next > limit {
                    return Err(WtopError::SnapshotTooLarge {
                        requested: next,
                        limit,
                    });
                }
                tracing::debug!(from = len, to = next, "growing process table buffer");
                len = next;
            }
            QueryStatus::Failed(status) => return Err(WtopError::KernelQuery { status }),
        }
    }
}

/// Production [`SnapshotSource`] backed by `NtQuerySystemInformation`.
#[derive(Debug, Clone)]
pub struct KernelSnapshotSource {
    next_len: usize,
    limit: usize,
}

impl KernelSnapshotSource {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            next_len: config.initial_buffer_bytes,
            limit: config.max_buffer_bytes,
        }
    }
}

impl SnapshotSource for KernelSnapshotSource {
    fn snapshot(&mut self) -> Result<ProcessSnapshot> {
        let buffer = query_with_growth(self.next_len, self.limit, platform::query)?;
        let captured_at = Instant::now();
        // Start the next query at the size that worked.
        self.next_len = self.next_len.max(buffer.capacity());

        let records = ProcessRecords::new(buffer.as_bytes(), buffer.base_address(), NATIVE_LAYOUT)
            .collect::<Result<Vec<_>>>()?;
        Ok(ProcessSnapshot::new(records, captured_at))
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;

    use windows::Win32::Foundation::{NTSTATUS, STATUS_INFO_LENGTH_MISMATCH, STATUS_SUCCESS};

    use super::QueryStatus;

    const SYSTEM_PROCESS_INFORMATION_CLASS: u32 = 5;

    #[link(name = "ntdll")]
    extern "system" {
        fn NtQuerySystemInformation(
            system_information_class: u32,
            system_information: *mut c_void,
            system_information_length: u32,
            return_length: *mut u32,
        ) -> NTSTATUS;
    }

    pub(super) fn query(buffer: &mut [u8]) -> QueryStatus {
        let Ok(len) = u32::try_from(buffer.len()) else {
            return QueryStatus::TooSmall { required: usize::MAX };
        };
        let mut return_length: u32 = 0;
        // SAFETY: the kernel writes at most `len` bytes into `buffer`, which
        // is a live, writable, 8-byte aligned allocation of that size, and
        // `return_length` is a valid out pointer.
        let status = unsafe {
            NtQuerySystemInformation(
                SYSTEM_PROCESS_INFORMATION_CLASS,
                buffer.as_mut_ptr().cast::<c_void>(),
                len,
                &mut return_length,
            )
        };

        if status == STATUS_SUCCESS {
            QueryStatus::Complete {
                written: return_length as usize,
            }
        } else if status == STATUS_INFO_LENGTH_MISMATCH {
            QueryStatus::TooSmall {
                required: return_length as usize,
            }
        } else {
            QueryStatus::Failed(status.0 as u32)
        }
    }
}

#[cfg(not(windows))]
mod platform {
    use super::QueryStatus;

    /// STATUS_NOT_IMPLEMENTED
    const STATUS_NOT_IMPLEMENTED: u32 = 0xC000_0002;

    pub(super) fn query(_buffer: &mut [u8]) -> QueryStatus {
        QueryStatus::Failed(STATUS_NOT_IMPLEMENTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_table_fits() {
        let mut seen = Vec::new();
        let buffer = query_with_growth(1024, 1 << 20, |buf| {
            seen.push(buf.len());
            if buf.len() < 6000 {
                QueryStatus::TooSmall { required: 0 }
            } else {
                buf[..4].copy_from_slice(&[1, 2, 3, 4]);
                QueryStatus::Complete { written: 4 }
            }
        })
        .unwrap();

        assert_eq!(seen, vec![1024, 2048, 4096, 8192]);
        assert_eq!(buffer.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(buffer.base_address() % 8, 0);
    }

    #[test]
    fn jumps_to_reported_size_when_larger() {
        let mut seen = Vec::new();
        query_with_growth(1024, 1 << 20, |buf| {
            seen.push(buf.len());
            if buf.len() < 50_000 {
                QueryStatus::TooSmall { required: 50_000 }
            } else {
                QueryStatus::Complete { written: 10 }
            }
        })
        .unwrap();

        assert_eq!(seen, vec![1024, 50_000]);
    }

    #[test]
    fn pathological_growth_is_capped() {
        let mut calls = 0;
        let err = query_with_growth(1024, 64 * 1024, |_| {
            calls += 1;
            QueryStatus::TooSmall { required: 0 }
        })
        .unwrap_err();

        assert!(matches!(
            err,
            WtopError::SnapshotTooLarge {
                requested: 131_072,
                limit: 65_536
            }
        ));
        assert_eq!(calls, 7);
    }

    #[test]
    fn other_failures_surface_status() {
        let err = query_with_growth(1024, 4096, |_| QueryStatus::Failed(0xC000_0022)).unwrap_err();
        assert!(matches!(err, WtopError::KernelQuery { status: 0xC000_0022 }));
    }

    #[cfg(not(windows))]
    #[test]
    fn snapshot_surfaces_the_unsupported_platform_status() {
        let mut source = KernelSnapshotSource::new(&TelemetryConfig::default());
        let err = source.snapshot().unwrap_err();
        assert!(matches!(err, WtopError::KernelQuery { status: 0xC000_0002 }));
    }
}
