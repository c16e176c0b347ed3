use std::fs::OpenOptions;
use std::io;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};

use trunkline_pac::device::{self, Addressing, RegisterAddress, RegisterIo, RegisterValue};

/// A card's register BAR, mapped from its sysfs PCI resource file.
///
/// Registers are 16 bits wide at consecutive word offsets.
///
pub struct MmioWindow {
    base: NonNull<RegisterValue>,
    words: usize,
}

// The mapping belongs to the window and is only touched through volatile
// word accesses.
unsafe impl Send for MmioWindow {}

impl MmioWindow {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let words = Addressing::WINDOW_LEN;
        let len = words * size_of::<RegisterValue>();

        let mapped = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let base = NonNull::new(mapped as *mut RegisterValue)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "register window mapped at null"))?;

        Ok(Self {
            base,
            words,
        })
    }

    fn word(&self, address: RegisterAddress) -> device::Result<*mut RegisterValue> {
        let offset = address as usize;
        if offset >= self.words {
            return Err(device::Error::Unmapped(address));
        }
        Ok(unsafe { self.base.as_ptr().add(offset) })
    }
}

impl RegisterIo for MmioWindow {
    fn read(&self, address: RegisterAddress) -> device::Result<RegisterValue> {
        let word = self.word(address)?;
        let value = unsafe { ptr::read_volatile(word) };

        // A surprise-removed card reads back all ones.
        if value == 0xffff && address == 0x000b {
            return Err(device::Error::Bus);
        }
        Ok(value)
    }

    fn write(&self, address: RegisterAddress, value: RegisterValue) -> device::Result<()> {
        let word = self.word(address)?;
        unsafe { ptr::write_volatile(word, value) };
        Ok(())
    }
}

impl Drop for MmioWindow {
    fn drop(&mut self) {
        let len = self.words * size_of::<RegisterValue>();
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, len);
        }
    }
}
