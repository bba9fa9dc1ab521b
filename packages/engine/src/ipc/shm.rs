// packages/engine/src/ipc/shm.rs
//! Shared-memory segments
//!
//! Three kinds of mapped objects, all named by port so co-hosted
//! servers cannot collide:
//!
//! - `/call_<port>`: the command region, one 1024-byte slot per
//!   worker holding `[call_id: i32][function_id: i32]`.
//! - `/small_obj_pool_shm_<port>`: a fixed arena of `max_call_id`
//!   slots of `[occupied: i32][length: i32][payload]`, the fast path
//!   for payloads up to `small_obj_size` bytes.
//! - `/args_<port>_<id>` / `/result_<port>_<id>`: named slow-path
//!   segments of `[length: i32][payload]`, created on demand for
//!   oversized payloads and unlinked by the consumer.
//!
//! Payload bytes are published by the accompanying semaphore post, not
//! by the atomics here; the occupied flag only selects the tier.

use crate::utils::config::{IpcConfig, CALL_SLOT_SIZE};
use crate::utils::errors::{EngineError, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use std::sync::atomic::{AtomicI32, Ordering};

fn create_segment(name: &str, size: usize) -> Result<MmapMut> {
    // A leftover object from a crashed run would otherwise survive
    // O_CREAT with its old contents.
    let _ = shm_unlink(name);
    let fd = shm_open(
        name,
        OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
        Mode::from_bits_truncate(0o666),
    )
    .map_err(|e| EngineError::Shm(format!("shm_open({}) failed: {}", name, e)))?;
    let file = File::from(fd);
    file.set_len(size as u64)
        .map_err(|e| EngineError::Shm(format!("ftruncate({}, {}) failed: {}", name, size, e)))?;
    let map = unsafe { MmapOptions::new().map_mut(&file) }
        .map_err(|e| EngineError::Shm(format!("mmap({}) failed: {}", name, e)))?;
    Ok(map)
}

fn open_segment_ro(name: &str) -> Result<Mmap> {
    let fd = shm_open(name, OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| EngineError::Shm(format!("shm_open({}) failed: {}", name, e)))?;
    let file = File::from(fd);
    let map = unsafe { MmapOptions::new().map(&file) }
        .map_err(|e| EngineError::Shm(format!("mmap({}) failed: {}", name, e)))?;
    Ok(map)
}

/// Unlink a named segment, ignoring an already-missing name
pub fn unlink_segment(name: &str) {
    let _ = shm_unlink(name);
}

/// A named, pre-sized mapping shared across fork.
///
/// Distinct byte ranges are owned by distinct call-ids / workers; the
/// semaphore handshake orders cross-process access within one range.
struct SharedRegion {
    ptr: *mut u8,
    len: usize,
    name: String,
    _map: MmapMut,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    fn create(name: &str, size: usize) -> Result<Self> {
        let mut map = create_segment(name, size)?;
        let ptr = map.as_mut_ptr();
        Ok(Self {
            ptr,
            len: size,
            name: name.to_string(),
            _map: map,
        })
    }

    /// View four bytes at `offset` as an atomic cell. `offset` must be
    /// 4-aligned and in bounds.
    fn cell(&self, offset: usize) -> &AtomicI32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        unsafe { &*(self.ptr.add(offset) as *const AtomicI32) }
    }

    fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }

    fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        debug_assert!(offset + len <= self.len);
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), len);
        }
        out
    }

    fn unlink(&self) {
        unlink_segment(&self.name);
    }
}

/// Command region: `(call_id, function_id)` cell per worker
pub struct CommandBoard {
    region: SharedRegion,
    num_workers: usize,
}

impl CommandBoard {
    pub fn create(port: u16, num_workers: usize) -> Result<Self> {
        let region = SharedRegion::create(&format!("/call_{}", port), num_workers * CALL_SLOT_SIZE)?;
        Ok(Self {
            region,
            num_workers,
        })
    }

    /// Write the next command for `worker_id`. The caller must hold the
    /// worker's available token so the previous command has been read.
    pub fn post(&self, worker_id: usize, call_id: i32, function_id: i32) {
        debug_assert!(worker_id < self.num_workers);
        let base = worker_id * CALL_SLOT_SIZE;
        self.region.cell(base).store(call_id.to_le(), Ordering::Release);
        self.region
            .cell(base + 4)
            .store(function_id.to_le(), Ordering::Release);
    }

    /// Read the pending command for `worker_id` after its ready wakeup
    pub fn fetch(&self, worker_id: usize) -> (i32, i32) {
        debug_assert!(worker_id < self.num_workers);
        let base = worker_id * CALL_SLOT_SIZE;
        let call_id = i32::from_le(self.region.cell(base).load(Ordering::Acquire));
        let function_id = i32::from_le(self.region.cell(base + 4).load(Ordering::Acquire));
        (call_id, function_id)
    }

    pub fn unlink(&self) {
        self.region.unlink();
    }
}

/// Fixed arena of small-object slots indexed by call-id
pub struct SmallObjPool {
    region: SharedRegion,
    slot_size: usize,
    payload_cap: usize,
    slots: usize,
}

impl SmallObjPool {
    pub fn create(port: u16, ipc: &IpcConfig) -> Result<Self> {
        let slot_size = ipc.small_slot_size();
        let region = SharedRegion::create(
            &format!("/small_obj_pool_shm_{}", port),
            ipc.max_call_id * slot_size,
        )?;
        Ok(Self {
            region,
            slot_size,
            payload_cap: ipc.small_obj_size,
            slots: ipc.max_call_id,
        })
    }

    fn slot_base(&self, call_id: i32) -> usize {
        debug_assert!(call_id >= 0 && (call_id as usize) < self.slots);
        call_id as usize * self.slot_size
    }

    /// Stash `payload` in the slot for `call_id` if it fits the fast path
    pub fn try_write(&self, call_id: i32, payload: &[u8]) -> bool {
        if payload.len() > self.payload_cap {
            return false;
        }
        let base = self.slot_base(call_id);
        self.region
            .cell(base + 4)
            .store((payload.len() as i32).to_le(), Ordering::Relaxed);
        self.region.write_bytes(base + 8, payload);
        self.region.cell(base).store(1i32.to_le(), Ordering::Release);
        true
    }

    /// Take the slot contents for `call_id`, clearing the occupied flag;
    /// `None` means the payload went through a named segment instead
    pub fn try_read(&self, call_id: i32) -> Option<Vec<u8>> {
        let base = self.slot_base(call_id);
        if i32::from_le(self.region.cell(base).load(Ordering::Acquire)) != 1 {
            return None;
        }
        let len = i32::from_le(self.region.cell(base + 4).load(Ordering::Relaxed)) as usize;
        let payload = self.region.read_bytes(base + 8, len.min(self.payload_cap));
        self.region.cell(base).store(0, Ordering::Release);
        Some(payload)
    }

    pub fn unlink(&self) {
        self.region.unlink();
    }
}

/// Direction of a payload exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Args,
    Result,
}

impl PayloadKind {
    fn prefix(&self) -> &'static str {
        match self {
            PayloadKind::Args => "args",
            PayloadKind::Result => "result",
        }
    }
}

/// Two-tier payload channel: pooled small slots with named-segment overflow
pub struct PayloadStore {
    pool: SmallObjPool,
    port: u16,
}

impl PayloadStore {
    pub fn create(port: u16, ipc: &IpcConfig) -> Result<Self> {
        Ok(Self {
            pool: SmallObjPool::create(port, ipc)?,
            port,
        })
    }

    /// Name of the slow-path segment for one direction of one call
    pub fn segment_name(&self, kind: PayloadKind, call_id: i32) -> String {
        format!("/{}_{}_{}", kind.prefix(), self.port, call_id)
    }

    /// Write one direction's payload for `call_id`. Small payloads land
    /// in the pooled slot; anything larger gets its own named segment.
    pub fn write(&self, kind: PayloadKind, call_id: i32, payload: &[u8]) -> Result<()> {
        if self.pool.try_write(call_id, payload) {
            return Ok(());
        }
        let name = self.segment_name(kind, call_id);
        let mut map = create_segment(&name, payload.len() + 4)?;
        map[0..4].copy_from_slice(&(payload.len() as i32).to_le_bytes());
        map[4..4 + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Read and consume one direction's payload for `call_id`. The named
    /// segment, if used, is unlinked once copied out.
    pub fn read(&self, kind: PayloadKind, call_id: i32) -> Result<Vec<u8>> {
        if let Some(payload) = self.pool.try_read(call_id) {
            return Ok(payload);
        }
        let name = self.segment_name(kind, call_id);
        let map = open_segment_ro(&name)?;
        if map.len() < 4 {
            unlink_segment(&name);
            return Err(EngineError::Shm(format!(
                "segment {} too short for a length header",
                name
            )));
        }
        let len = i32::from_le_bytes([map[0], map[1], map[2], map[3]]) as usize;
        if 4 + len > map.len() {
            unlink_segment(&name);
            return Err(EngineError::Shm(format!(
                "segment {} declares {} payload bytes but holds {}",
                name,
                len,
                map.len() - 4
            )));
        }
        let payload = map[4..4 + len].to_vec();
        drop(map);
        unlink_segment(&name);
        Ok(payload)
    }

    pub fn unlink(&self) {
        self.pool.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU16;

    fn test_port() -> u16 {
        static NEXT: AtomicU16 = AtomicU16::new(0);
        40_000
            + (std::process::id() % 5_000) as u16
            + NEXT.fetch_add(7, std::sync::atomic::Ordering::Relaxed)
    }

    fn small_ipc() -> IpcConfig {
        IpcConfig {
            max_call_id: 8,
            small_obj_size: 64,
        }
    }

    #[test]
    fn test_command_board_roundtrip() {
        let board = CommandBoard::create(test_port(), 3).unwrap();
        board.post(0, 17, 7);
        board.post(2, 101, 3);
        assert_eq!(board.fetch(0), (17, 7));
        assert_eq!(board.fetch(2), (101, 3));
        board.unlink();
    }

    #[test]
    fn test_small_payload_uses_pool_slot() {
        let store = PayloadStore::create(test_port(), &small_ipc()).unwrap();
        let payload = vec![0xAB; 64]; // exactly small_obj_size
        store.write(PayloadKind::Args, 3, &payload).unwrap();

        // The named segment must not exist for an inline payload.
        assert!(open_segment_ro(&store.segment_name(PayloadKind::Args, 3)).is_err());
        assert_eq!(store.read(PayloadKind::Args, 3).unwrap(), payload);
        // Slot is free again.
        assert!(store.pool.try_read(3).is_none());
        store.unlink();
    }

    #[test]
    fn test_oversized_payload_uses_named_segment() {
        let store = PayloadStore::create(test_port(), &small_ipc()).unwrap();
        let payload: Vec<u8> = (0..65).map(|i| i as u8).collect(); // small_obj_size + 1
        store.write(PayloadKind::Result, 5, &payload).unwrap();

        assert!(store.pool.try_read(5).is_none());
        assert_eq!(store.read(PayloadKind::Result, 5).unwrap(), payload);
        // Consumer unlinked the segment.
        assert!(open_segment_ro(&store.segment_name(PayloadKind::Result, 5)).is_err());
        store.unlink();
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let store = PayloadStore::create(test_port(), &small_ipc()).unwrap();
        store.write(PayloadKind::Result, 0, &[]).unwrap();
        assert_eq!(store.read(PayloadKind::Result, 0).unwrap(), Vec::<u8>::new());
        store.unlink();
    }

    #[test]
    fn test_slots_are_independent() {
        let store = PayloadStore::create(test_port(), &small_ipc()).unwrap();
        store.write(PayloadKind::Args, 1, b"one").unwrap();
        store.write(PayloadKind::Args, 2, b"two").unwrap();
        assert_eq!(store.read(PayloadKind::Args, 2).unwrap(), b"two");
        assert_eq!(store.read(PayloadKind::Args, 1).unwrap(), b"one");
        store.unlink();
    }

    #[test]
    fn test_large_payload_byte_identity() {
        let store = PayloadStore::create(test_port(), &small_ipc()).unwrap();
        let payload: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        store.write(PayloadKind::Args, 7, &payload).unwrap();
        assert_eq!(store.read(PayloadKind::Args, 7).unwrap(), payload);
        store.unlink();
    }
}
