//! Element buffers: named, shared, fixed-layout memory regions.
//!
//! A buffer is a file on the shared-memory tmpfs, mapped into the
//! process. The first [`HEADER_SIZE`] bytes hold the [`BufferHeader`];
//! the rest is a dense array of `element_count` records of
//! `element_size` bytes each. A JSON sidecar next to the buffer file
//! carries the layout for discovery by processes that have not mapped
//! it yet.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{Ordering, fence};
use std::time::Duration;
use std::{fs, io, ptr, thread};

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use taxel::consts::{BUFFER_PREFIX, META_SUFFIX, POLL_INTERVAL_NS, SHM_DIR};
use taxel::header::{BufferHeader, HEADER_SIZE};
use taxel::record::Record;

use crate::descriptor::ServiceDescriptor;
use crate::element::ElementRef;
use crate::error::{ServiceError, ServiceResult};

/// Number of seqlock retries before a snapshot gives up.
const SNAPSHOT_RETRIES: usize = 64;

/// Attach attempts against a file another process is still initializing.
const ATTACH_RETRIES: usize = 10;

/// Discovery sidecar written next to each buffer file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferMeta {
    /// Buffer name without prefix.
    pub name: String,
    /// Size of one element in bytes.
    pub element_size: usize,
    /// Number of elements.
    pub element_count: usize,
    /// Raw temporal mode word, see [`taxel::header::BufferMode`].
    pub mode: u64,
    /// Period or minimum inter-arrival time [ns].
    pub period_ns: u64,
    /// Application-defined request tag.
    pub request_tag: u32,
    /// Application-defined response tag.
    pub response_tag: u32,
    /// Pid of the registering process.
    pub owner_pid: u32,
}

/// Path of the buffer file for `name`.
pub(crate) fn buffer_path(name: &str) -> PathBuf {
    Path::new(SHM_DIR).join(format!("{BUFFER_PREFIX}{name}"))
}

/// Path of the discovery sidecar for `name`.
pub(crate) fn meta_path(name: &str) -> PathBuf {
    Path::new(SHM_DIR).join(format!("{BUFFER_PREFIX}{name}{META_SUFFIX}"))
}

/// A mapped element buffer.
///
/// The owning side (the registering manager) creates the file, writes
/// the header and unlinks everything on drop. Attached sides share the
/// same mapping semantics but never remove the files.
pub struct ElementBuffer {
    name: String,
    path: PathBuf,
    meta_path: PathBuf,
    // Kept alive for the mapping; all access goes through `base`.
    _mmap: MmapMut,
    base: *mut u8,
    element_size: usize,
    element_count: usize,
    owner: bool,
}

// The mapping is shared memory by construction; concurrent access is
// mediated by the header atomics and the seqlock protocol.
unsafe impl Send for ElementBuffer {}
unsafe impl Sync for ElementBuffer {}

impl ElementBuffer {
    /// Create the buffer for `desc`, or attach to an existing one with
    /// an identical layout.
    ///
    /// # Errors
    /// [`ServiceError::DuplicateName`] if a buffer of this name exists
    /// with a different element layout or temporal class.
    pub fn create_or_attach(desc: &ServiceDescriptor) -> ServiceResult<Self> {
        let path = buffer_path(&desc.buffer_name);

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(name = %desc.buffer_name, "buffer exists, attaching");
                // The creator may still be between set_len and the
                // header store; a freshly created file is given a few
                // polls to gain its magic before it counts as corrupt.
                let mut attempt = 0;
                loop {
                    match Self::attach(&desc.buffer_name) {
                        Ok(existing) => return existing.check_layout(desc),
                        Err(ServiceError::BufferUnavailable { .. })
                            if attempt < ATTACH_RETRIES =>
                        {
                            attempt += 1;
                            thread::sleep(Duration::from_nanos(POLL_INTERVAL_NS));
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };

        let total = desc.mapped_size();
        file.set_len(total as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = mmap.as_mut_ptr();

        let class = desc.class;
        let header = BufferHeader::new(
            desc.element_size as u64,
            desc.element_count as u64,
            class.buffer_mode(),
            class.interval_ns(),
            desc.request_tag.raw(),
            desc.response_tag.raw(),
        );
        // The mapping is zero-initialized; this is the first and only
        // full-header store, published by the fence below.
        unsafe { ptr::write(base as *mut BufferHeader, header) };
        fence(Ordering::Release);

        let meta = BufferMeta {
            name: desc.buffer_name.clone(),
            element_size: desc.element_size,
            element_count: desc.element_count,
            mode: class.buffer_mode() as u64,
            period_ns: class.interval_ns(),
            request_tag: desc.request_tag.raw(),
            response_tag: desc.response_tag.raw(),
            owner_pid: std::process::id(),
        };
        let meta_path = meta_path(&desc.buffer_name);
        fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)?;

        debug!(
            name = %desc.buffer_name,
            size = total,
            count = desc.element_count,
            "element buffer created"
        );

        Ok(Self {
            name: desc.buffer_name.clone(),
            path,
            meta_path,
            _mmap: mmap,
            base,
            element_size: desc.element_size,
            element_count: desc.element_count,
            owner: true,
        })
    }

    /// Attach to an existing buffer by name, without taking ownership.
    ///
    /// # Errors
    /// [`ServiceError::BufferUnavailable`] if the file is missing, too
    /// small, or its header fails validation.
    pub fn attach(name: &str) -> ServiceResult<Self> {
        let path = buffer_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ServiceError::BufferUnavailable {
                name: name.to_string(),
                reason: format!("open failed: {e}"),
            })?;

        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            return Err(ServiceError::BufferUnavailable {
                name: name.to_string(),
                reason: format!("file too small for a header ({len} bytes)"),
            });
        }

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        fence(Ordering::Acquire);

        let header = unsafe { &*(base as *const BufferHeader) };
        if !header.is_magic_valid() {
            return Err(ServiceError::BufferUnavailable {
                name: name.to_string(),
                reason: "bad magic".to_string(),
            });
        }
        if header.buffer_mode().is_none() {
            return Err(ServiceError::BufferUnavailable {
                name: name.to_string(),
                reason: format!("corrupt mode word {}", header.mode),
            });
        }

        let element_size = header.element_size as usize;
        let element_count = header.element_count as usize;
        let expected = HEADER_SIZE + element_size * element_count;
        if len < expected {
            return Err(ServiceError::BufferUnavailable {
                name: name.to_string(),
                reason: format!("file truncated: {len} < {expected}"),
            });
        }

        Ok(Self {
            name: name.to_string(),
            path,
            meta_path: meta_path(name),
            _mmap: mmap,
            base,
            element_size,
            element_count,
            owner: false,
        })
    }

    fn check_layout(self, desc: &ServiceDescriptor) -> ServiceResult<Self> {
        if self.layout_matches(desc) {
            Ok(self)
        } else {
            Err(ServiceError::DuplicateName {
                name: desc.buffer_name.clone(),
            })
        }
    }

    /// Whether this buffer's layout and temporal class agree with `desc`.
    pub fn layout_matches(&self, desc: &ServiceDescriptor) -> bool {
        self.element_size == desc.element_size
            && self.element_count == desc.element_count
            && self.header().mode == desc.class.buffer_mode() as u64
    }

    /// Buffer name without the filename prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Number of elements in the buffer.
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// The shared header.
    #[inline]
    pub fn header(&self) -> &BufferHeader {
        unsafe { &*(self.base as *const BufferHeader) }
    }

    /// Typed view of element `index`.
    ///
    /// # Errors
    /// [`ServiceError::OutOfRange`] for `index >= element_count`;
    /// [`ServiceError::BufferUnavailable`] if `size_of::<T>()` disagrees
    /// with the buffer's declared element size.
    pub fn element<T: Record>(&self, index: usize) -> ServiceResult<ElementRef<'_, T>> {
        if core::mem::size_of::<T>() != self.element_size {
            return Err(ServiceError::BufferUnavailable {
                name: self.name.clone(),
                reason: format!(
                    "record size {} does not match element size {}",
                    core::mem::size_of::<T>(),
                    self.element_size
                ),
            });
        }
        if index >= self.element_count {
            return Err(ServiceError::OutOfRange {
                index,
                count: self.element_count,
            });
        }
        let ptr = unsafe { self.base.add(HEADER_SIZE + index * self.element_size) } as *mut T;
        Ok(ElementRef::new(self, ptr))
    }

    /// Consistent snapshot of the whole element array.
    ///
    /// Retries the seqlock a bounded number of times; a writer that keeps
    /// the buffer torn for that long yields [`ServiceError::ReadContention`].
    pub fn snapshot<T: Record>(&self) -> ServiceResult<Vec<T>> {
        if core::mem::size_of::<T>() != self.element_size {
            return Err(ServiceError::BufferUnavailable {
                name: self.name.clone(),
                reason: format!(
                    "record size {} does not match element size {}",
                    core::mem::size_of::<T>(),
                    self.element_size
                ),
            });
        }

        let header = self.header();
        let data = unsafe { self.base.add(HEADER_SIZE) } as *const T;

        for _ in 0..SNAPSHOT_RETRIES {
            let seq_before = header.write_seq.load(Ordering::Acquire);
            if seq_before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let mut out = Vec::with_capacity(self.element_count);
            for i in 0..self.element_count {
                out.push(unsafe { ptr::read_volatile(data.add(i)) });
            }

            fence(Ordering::Acquire);
            if header.write_seq.load(Ordering::Acquire) == seq_before {
                return Ok(out);
            }
        }

        Err(ServiceError::ReadContention {
            name: self.name.clone(),
        })
    }

    /// Whether this side created the buffer and will unlink it on drop.
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for ElementBuffer {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        for path in [&self.path, &self.meta_path] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to unlink buffer file");
                }
            }
        }
        debug!(name = %self.name, "element buffer unlinked");
    }
}

impl std::fmt::Debug for ElementBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementBuffer")
            .field("name", &self.name)
            .field("element_size", &self.element_size)
            .field("element_count", &self.element_count)
            .field("owner", &self.owner)
            .finish()
    }
}
