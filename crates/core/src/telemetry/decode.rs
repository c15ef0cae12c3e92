//! Decoder for the `SystemProcessInformation` result buffer.
//!
//! The kernel answers with one contiguous region holding a chain of
//! variable-length records. Each record starts with a fixed header whose
//! first field is the byte distance to the next record (zero on the last
//! one); image-name UTF-16 data and per-thread arrays are interleaved
//! between headers, so the chain must be walked by the declared offsets.

use crate::{telemetry::ProcessRecord, Result, WtopError};

/// Field offsets inside one `SYSTEM_PROCESS_INFORMATION` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub next_entry_offset: usize,
    pub thread_count: usize,
    pub user_time: usize,
    pub kernel_time: usize,
    pub name_length: usize,
    pub name_buffer: usize,
    pub pid: usize,
    pub parent_pid: usize,
    pub working_set: usize,
    pub pointer_width: usize,
}

impl RecordLayout {
    /// Bytes that must be present for a header to be decodable.
    pub const fn header_len(&self) -> usize {
        self.working_set + self.pointer_width
    }
}

pub const LAYOUT_64: RecordLayout = RecordLayout {
    next_entry_offset: 0,
    thread_count: 4,
    user_time: 40,
    kernel_time: 48,
    name_length: 56,
    name_buffer: 64,
    pid: 80,
    parent_pid: 88,
    working_set: 144,
    pointer_width: 8,
};

pub const LAYOUT_32: RecordLayout = RecordLayout {
    next_entry_offset: 0,
    thread_count: 4,
    user_time: 40,
    kernel_time: 48,
    name_length: 56,
    name_buffer: 60,
    pid: 68,
    parent_pid: 72,
    working_set: 104,
    pointer_width: 4,
};

#[cfg(target_pointer_width = "64")]
pub const NATIVE_LAYOUT: RecordLayout = LAYOUT_64;
#[cfg(not(target_pointer_width = "64"))]
pub const NATIVE_LAYOUT: RecordLayout = LAYOUT_32;

/// Lazy, single-pass walk over the record chain.
///
/// `base_address` is the address the buffer lived at when the kernel filled
/// it; name pointers are translated back into offsets relative to it.
/// A header that would overrun the buffer yields one
/// [`WtopError::MalformedSnapshot`] and ends the iteration.
#[derive(Debug, Clone)]
pub struct ProcessRecords<'a> {
    buf: &'a [u8],
    base_address: usize,
    layout: RecordLayout,
    offset: Option<usize>,
}

impl<'a> ProcessRecords<'a> {
    pub fn new(buf: &'a [u8], base_address: usize, layout: RecordLayout) -> Self {
        let offset = if buf.is_empty() { None } else { Some(0) };
        Self {
            buf,
            base_address,
            layout,
            offset,
        }
    }

    fn decode_at(&self, offset: usize) -> Result<(ProcessRecord, u32)> {
        let layout = &self.layout;
        let end = offset
            .checked_add(layout.header_len())
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                WtopError::malformed(format!(
                    "record at offset {offset} overruns {}-byte buffer",
                    self.buf.len()
                ))
            })?;
        let header = &self.buf[offset..end];

        let next = read_u32(header, layout.next_entry_offset);
        let pid = read_ptr(header, layout.pid, layout.pointer_width) as u32;
        let record = ProcessRecord {
            pid,
            parent_pid: read_ptr(header, layout.parent_pid, layout.pointer_width) as u32,
            name: self
                .image_name(header)
                .unwrap_or_else(|| fallback_name(pid).to_string()),
            thread_count: read_u32(header, layout.thread_count),
            user_time_ticks: read_i64(header, layout.user_time).max(0) as u64,
            kernel_time_ticks: read_i64(header, layout.kernel_time).max(0) as u64,
            working_set_bytes: read_ptr(header, layout.working_set, layout.pointer_width),
        };
        Ok((record, next))
    }

    fn image_name(&self, header: &[u8]) -> Option<String> {
        let len = read_u16(header, self.layout.name_length) as usize;
        let pointer =
            read_ptr(header, self.layout.name_buffer, self.layout.pointer_width) as usize;
        if len == 0 || pointer == 0 {
            return None;
        }

        let start = pointer.checked_sub(self.base_address)?;
        let bytes = start
            .checked_add(len)
            .and_then(|end| self.buf.get(start..end));
        let Some(bytes) = bytes else {
            tracing::trace!(pointer, len, "image name points outside the snapshot");
            return None;
        };

        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Some(String::from_utf16_lossy(&units))
    }
}

impl Iterator for ProcessRecords<'_> {
    type Item = Result<ProcessRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset.take()?;
        match self.decode_at(offset) {
            Ok((record, next)) => {
                if next != 0 {
                    self.offset = offset.checked_add(next as usize);
                }
                Some(Ok(record))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

fn fallback_name(pid: u32) -> &'static str {
    if pid == 0 {
        "System Idle Process"
    } else {
        "System"
    }
}

// Callers slice `header` to `header_len()` first, so fixed offsets are in range.
fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(raw)
}

fn read_ptr(buf: &[u8], at: usize, width: usize) -> u64 {
    if width == 8 {
        read_i64(buf, at) as u64
    } else {
        u64::from(read_u32(buf, at))
    }
}
