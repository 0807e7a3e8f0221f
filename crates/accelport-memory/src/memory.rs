use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use accelport_core::ErrorStatus;
use tracing::{debug, warn};

use crate::validator::MemoryValidator;
use crate::{DeviceValidator, ForeignValidator, IoRole, Metadata, OperandInfo, SizedValidator};

/// Shared-ownership handle to a buffer; clones refer to the same storage and
/// validator.
pub type Memory = Arc<MemoryObject>;

/// CPU-visible staging view a driver may expose for its opaque buffers; this
/// is what makes one-hop staging copies possible.
pub type StagingView = Arc<Mutex<Vec<u8>>>;

pub enum MemoryKind {
    /// Generic shared, CPU-mappable region.
    Shared { data: Mutex<Vec<u8>> },
    /// Caller-supplied file-descriptor-backed region.
    FdBacked { file: Mutex<File>, length: usize },
    /// Backend-opaque buffer, identified to the driver by a token.
    Device {
        token: u32,
        device: String,
        staging: Option<StagingView>,
    },
}

/// A shared buffer paired with its usage validator. Shared across threads via
/// `Arc`; the Arc pointer doubles as the buffer's stable identity for burst
/// slot caching.
pub struct MemoryObject {
    kind: MemoryKind,
    validator: Mutex<Box<dyn MemoryValidator>>,
}

impl MemoryObject {
    pub fn new_shared(size: usize) -> Arc<Self> {
        Arc::new(Self {
            kind: MemoryKind::Shared {
                data: Mutex::new(vec![0u8; size]),
            },
            validator: Mutex::new(Box::new(SizedValidator::new(size))),
        })
    }

    pub fn new_from_fd(file: File, length: usize) -> Arc<Self> {
        Arc::new(Self {
            kind: MemoryKind::FdBacked {
                file: Mutex::new(file),
                length,
            },
            validator: Mutex::new(Box::new(SizedValidator::new(length))),
        })
    }

    pub fn new_device(
        token: u32,
        device: String,
        staging: Option<StagingView>,
        metadata: Metadata,
        input_roles: Vec<OperandInfo>,
        output_roles: Vec<OperandInfo>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind: MemoryKind::Device {
                token,
                device,
                staging,
            },
            validator: Mutex::new(Box::new(DeviceValidator::new(
                metadata,
                input_roles,
                output_roles,
            ))),
        })
    }

    /// Wraps a buffer the runtime cannot map or describe; execution-only use.
    pub fn new_foreign() -> Arc<Self> {
        Arc::new(Self {
            kind: MemoryKind::Device {
                token: 0,
                device: String::new(),
                staging: None,
            },
            validator: Mutex::new(Box::new(ForeignValidator::new())),
        })
    }

    pub fn kind(&self) -> &MemoryKind {
        &self.kind
    }

    pub fn device_token(&self) -> Option<u32> {
        match &self.kind {
            MemoryKind::Device { token, .. } => Some(*token),
            _ => None,
        }
    }

    /// Logical size in bytes; 0 when unknown (device-opaque without metadata).
    pub fn size(&self) -> usize {
        match &self.kind {
            MemoryKind::Shared { data } => data.lock().unwrap().len(),
            MemoryKind::FdBacked { length, .. } => *length,
            MemoryKind::Device { .. } => self.validator().metadata().logical_size,
        }
    }

    pub fn validator(&self) -> MutexGuard<'_, Box<dyn MemoryValidator>> {
        self.validator.lock().unwrap()
    }

    /// Delegates a usage check to the buffer's validator.
    pub fn validate(&self, role: IoRole, operand: &OperandInfo, offset: u32, length: u32) -> bool {
        self.validator().validate(role, operand, offset, length)
    }

    /// Reads the whole CPU-visible contents. None for non-mappable buffers.
    pub fn read_all(&self) -> Option<Vec<u8>> {
        match &self.kind {
            MemoryKind::Shared { data } => Some(data.lock().unwrap().clone()),
            MemoryKind::FdBacked { file, length } => {
                let mut file = file.lock().unwrap();
                let mut buf = vec![0u8; *length];
                file.seek(SeekFrom::Start(0)).ok()?;
                file.read_exact(&mut buf).ok()?;
                Some(buf)
            }
            MemoryKind::Device { staging, .. } => {
                staging.as_ref().map(|s| s.lock().unwrap().clone())
            }
        }
    }

    /// Overwrites the CPU-visible contents. False for non-mappable buffers or
    /// a size mismatch.
    pub fn write_all(&self, bytes: &[u8]) -> bool {
        match &self.kind {
            MemoryKind::Shared { data } => {
                let mut data = data.lock().unwrap();
                if data.len() != bytes.len() {
                    return false;
                }
                data.copy_from_slice(bytes);
                true
            }
            MemoryKind::FdBacked { file, length } => {
                if *length != bytes.len() {
                    return false;
                }
                let mut file = file.lock().unwrap();
                if file.seek(SeekFrom::Start(0)).is_err() {
                    return false;
                }
                file.write_all(bytes).is_ok() && file.flush().is_ok()
            }
            MemoryKind::Device { staging, .. } => match staging {
                Some(s) => {
                    let mut s = s.lock().unwrap();
                    if s.len() != bytes.len() {
                        return false;
                    }
                    s.copy_from_slice(bytes);
                    true
                }
                None => false,
            },
        }
    }
}

impl std::fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            MemoryKind::Shared { .. } => "shared",
            MemoryKind::FdBacked { .. } => "fd",
            MemoryKind::Device { .. } => "device",
        };
        f.debug_struct("MemoryObject")
            .field("kind", &kind)
            .field("size", &self.size())
            .finish()
    }
}

/// Stable identity of a shared buffer, independent of its location or
/// contents. Used by the burst slot cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryId(usize);

impl MemoryId {
    pub fn of(memory: &Arc<MemoryObject>) -> Self {
        Self(Arc::as_ptr(memory) as usize)
    }
}

/// Copies `src` into `dst`. `src` must be initialized; `dst` picks up the
/// merged metadata and becomes initialized only if every step succeeds.
pub fn copy(src: &Memory, dst: &Memory) -> ErrorStatus {
    if !src.validator().is_initialized() {
        warn!("copy source has not been initialized");
        return ErrorStatus::GeneralFailure;
    }

    let src_metadata = src.validator().metadata();
    {
        let mut dst_validator = dst.validator();
        if !dst_validator.update_metadata(&src_metadata) {
            warn!("copy destination metadata is incompatible with source");
            dst_validator.set_initialized(false);
            return ErrorStatus::InvalidArgument;
        }
    }

    // Most specific path available: both sides CPU-visible means a single
    // staging transfer; anything else cannot be reached from this process.
    let status = match src.read_all() {
        Some(bytes) => {
            if dst.write_all(&bytes) {
                ErrorStatus::None
            } else {
                warn!(len = bytes.len(), "copy destination rejected contents");
                ErrorStatus::InvalidArgument
            }
        }
        None => {
            warn!("copy source is not CPU-visible");
            ErrorStatus::InvalidArgument
        }
    };

    let mut dst_validator = dst.validator();
    if status == ErrorStatus::None {
        debug!(len = src.size(), "buffer copy complete");
        dst_validator.set_initialized(true);
    } else {
        dst_validator.set_initialized(false);
    }
    status
}
