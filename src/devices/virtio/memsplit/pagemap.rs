//! Host page table lookups through `/proc/self/pagemap`.
//!
//! Each virtual page of the process has one 64-bit entry:
//!
//! ```text
//! bit  63     page present
//! bit  62     page swapped
//! bits 0-54   page frame number (zero without CAP_SYS_ADMIN)
//! ```

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use nix::errno::Errno;

const PAGEMAP_PATH: &str = "/proc/self/pagemap";

const PM_PRESENT: u64 = 1 << 63;
const PM_SWAPPED: u64 = 1 << 62;
const PM_PFN_MASK: u64 = (1 << 55) - 1;

const PAGEMAP_ENTRY_SIZE: u64 = 8;

/// Page size assumed if `sysconf` cannot tell us.
const FALLBACK_PAGE_SIZE: u64 = 4096;

/// A decoded pagemap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagemapEntry {
    pub present: bool,
    pub swapped: bool,
    pub pfn: u64,
}

impl PagemapEntry {
    pub fn from_raw(raw: u64) -> Self {
        Self {
            present: raw & PM_PRESENT != 0,
            swapped: raw & PM_SWAPPED != 0,
            pfn: raw & PM_PFN_MASK,
        }
    }
}

/// Open handle on this process's pagemap.
pub struct Pagemap {
    file: File,
    page_size: u64,
}

impl Pagemap {
    pub fn open() -> io::Result<Self> {
        Ok(Self {
            file: File::open(PAGEMAP_PATH)?,
            page_size: host_page_size(),
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Entry for the page containing `hva`.
    pub fn entry(&self, hva: u64) -> io::Result<PagemapEntry> {
        let offset = (hva / self.page_size) * PAGEMAP_ENTRY_SIZE;
        let mut buf = [0u8; PAGEMAP_ENTRY_SIZE as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(PagemapEntry::from_raw(u64::from_le_bytes(buf)))
    }
}

/// Host page size in bytes.
pub fn host_page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        FALLBACK_PAGE_SIZE
    }
}

/// Fault in the page containing `hva` for writing.
///
/// Returns `Ok(false)` if the kernel does not know `MADV_POPULATE_WRITE`.
pub fn populate_write(hva: u64, page_size: u64) -> io::Result<bool> {
    let page = hva & !(page_size - 1);
    // SAFETY: madvise does not dereference the range; an address that is not
    // mapped only yields an error.
    let ret = unsafe {
        libc::madvise(
            page as *mut libc::c_void,
            page_size as libc::size_t,
            libc::MADV_POPULATE_WRITE,
        )
    };
    match Errno::result(ret) {
        Ok(_) => Ok(true),
        Err(Errno::EINVAL) => Ok(false),
        Err(errno) => Err(io::Error::from(errno)),
    }
}
