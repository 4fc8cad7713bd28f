// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pinned host memory for bus-master DMA: hugetlbfs-backed files for the
//! client buffer, locked anonymous memory for small internal structures.

#![cfg(target_os = "linux")]

use crate::memory::DmaClient;
use crate::memory::MappedDmaTarget;
use crate::memory::MemoryBlock;
use crate::memory::ScatterGatherEntry;
use crate::memory::HOST_PAGE_SIZE;
use anyhow::Context;
use std::ffi::c_void;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use zerocopy::IntoBytes;

struct Mapping {
    addr: *mut c_void,
    len: usize,
}

// SAFETY: the result of an mmap is safe to share amongst threads.
unsafe impl Send for Mapping {}
// SAFETY: the result of an mmap is safe to share amongst threads.
unsafe impl Sync for Mapping {}

impl Mapping {
    fn anonymous(len: usize) -> std::io::Result<Self> {
        // SAFETY: no file descriptor or address is being passed. The result
        // is validated.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_LOCKED,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { addr, len })
    }

    fn file(file: &File, len: usize) -> std::io::Result<Self> {
        // SAFETY: mapping a file we own for its full length. The result is
        // validated.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { addr, len })
    }

    fn lock(&self) -> std::io::Result<()> {
        // SAFETY: self contains a valid mmap result.
        if unsafe { libc::mlock(self.addr, self.len) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Touches every page so the pagemap walk below sees them resident.
    fn populate(&self) {
        for offset in (0..self.len).step_by(HOST_PAGE_SIZE) {
            // SAFETY: in bounds of the mapping.
            unsafe {
                let p = self.addr.cast::<u8>().add(offset);
                std::ptr::write_volatile(p, std::ptr::read_volatile(p));
            }
        }
    }

    /// Resolves physical runs via /proc/self/pagemap, coalescing contiguous
    /// frames into scatter/gather entries.
    fn scatter_gather(&self) -> anyhow::Result<Vec<ScatterGatherEntry>> {
        let mut pagemap = File::open("/proc/self/pagemap").context("failed to open pagemap")?;
        pagemap
            .seek(SeekFrom::Start(
                (8 * self.addr as usize / HOST_PAGE_SIZE) as u64,
            ))
            .context("failed to seek")?;
        let n = self.len.div_ceil(HOST_PAGE_SIZE);
        let mut pfns = vec![0u64; n];
        pagemap
            .read_exact(pfns.as_mut_bytes())
            .context("failed to read from pagemap")?;
        let mut entries: Vec<ScatterGatherEntry> = Vec::new();
        for (i, pfn) in pfns.iter_mut().enumerate() {
            if *pfn & (1 << 63) == 0 {
                anyhow::bail!("page not present in RAM");
            }
            *pfn &= 0x3f_ffff_ffff_ffff;
            let bus = *pfn * HOST_PAGE_SIZE as u64;
            let length = HOST_PAGE_SIZE.min(self.len - i * HOST_PAGE_SIZE);
            match entries.last_mut() {
                Some(last) if last.bus_address + last.length as u64 == bus => {
                    last.length += length;
                }
                _ => entries.push(ScatterGatherEntry {
                    user_offset: i * HOST_PAGE_SIZE,
                    bus_address: bus,
                    length,
                }),
            }
        }
        Ok(entries)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: self contains a valid mmap result.
        if unsafe { libc::munmap(self.addr, self.len) } < 0 {
            panic!("{:?}", std::io::Error::last_os_error());
        }
    }
}

/// Anonymous, `mlock`ed memory with resolved bus addresses. Suitable for
/// small structures on IOMMU-less hosts where bus address == physical
/// address.
pub struct LockedMemory {
    mapping: Mapping,
    sg: Vec<ScatterGatherEntry>,
}

impl LockedMemory {
    pub fn new(len: usize) -> anyhow::Result<Self> {
        if len % HOST_PAGE_SIZE != 0 {
            anyhow::bail!("not a page-size multiple");
        }
        let mapping = Mapping::anonymous(len).context("failed to create mapping")?;
        mapping.lock().context("failed to lock mapping")?;
        mapping.populate();
        let sg = mapping.scatter_gather()?;
        Ok(Self { mapping, sg })
    }
}

// SAFETY: the mapping is locked, populated and only unmapped on drop.
unsafe impl MappedDmaTarget for LockedMemory {
    fn base(&self) -> *const u8 {
        self.mapping.addr.cast()
    }

    fn len(&self) -> usize {
        self.mapping.len
    }

    fn scatter_gather(&self) -> &[ScatterGatherEntry] {
        &self.sg
    }
}

/// A file on a hugetlbfs mount (or any filesystem, for non-hugepage use),
/// sized and mapped shared.
///
/// Note: if resizing the file fails, the file may be sitting on a hugetlbfs
/// mount with a larger page size than the requested length.
pub struct MemoryMappedFile {
    mapping: Mapping,
    sg: Vec<ScatterGatherEntry>,
    path: PathBuf,
    delete_on_drop: bool,
}

impl MemoryMappedFile {
    pub fn new(path: &Path, len: usize, delete_on_drop: bool) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        // SAFETY: resizing a file we just opened read-write.
        if unsafe { libc::ftruncate(file.as_raw_fd(), len as libc::off_t) } < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to size {}", path.display()));
        }
        let mapping = Mapping::file(&file, len).context("failed to map file")?;
        mapping.lock().context("failed to lock mapping")?;
        mapping.populate();
        let sg = mapping.scatter_gather()?;
        Ok(Self {
            mapping,
            sg,
            path: path.to_owned(),
            delete_on_drop,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MemoryMappedFile {
    fn drop(&mut self) {
        if self.delete_on_drop {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// SAFETY: the mapping is locked, populated and only unmapped on drop.
unsafe impl MappedDmaTarget for MemoryMappedFile {
    fn base(&self) -> *const u8 {
        self.mapping.addr.cast()
    }

    fn len(&self) -> usize {
        self.mapping.len
    }

    fn scatter_gather(&self) -> &[ScatterGatherEntry] {
        &self.sg
    }
}

/// [`DmaClient`] that backs a single allocation with the file at `path`.
/// Channels use one per internal structure, on the paths the
/// [`crate::paths::ChannelPaths`] collaborator hands out.
pub struct FileDmaClient {
    path: PathBuf,
    used: std::sync::atomic::AtomicBool,
}

impl FileDmaClient {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            used: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl DmaClient for FileDmaClient {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        if self.used.swap(true, std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("backing file {} already allocated", self.path.display());
        }
        let rounded = len.next_multiple_of(HOST_PAGE_SIZE);
        Ok(MemoryBlock::new(MemoryMappedFile::new(
            &self.path, rounded, false,
        )?))
    }
}
