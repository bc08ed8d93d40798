/*
 * ELF32 Loader
 *
 * Validates an executable image and installs its PT_LOAD segments as
 * lazy supplemental entries; nothing is read from the file until the
 * first touch. Finishes by building the initial stack page with the
 * program's arguments marshalled in the exact user-visible layout.
 *
 * Accepted images: 32-bit, little-endian, version 1, machine 3 (i386),
 * at most 1024 program headers. PT_DYNAMIC, PT_INTERP, and PT_SHLIB
 * reject the image; unknown segment types are ignored.
 */

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::fs::File;
use crate::mem::{PG_SIZE, PHYS_BASE, Vpn, is_user_vaddr};
use crate::vm::page::LazyFile;
use crate::vm::{self, VmHandle};

/// e_ident prefix: magic, 32-bit class, little-endian data, version 1.
const ELF_IDENT: [u8; 7] = [0x7f, b'E', b'L', b'F', 1, 1, 1];

const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const EV_CURRENT: u32 = 1;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_SHLIB: u32 = 5;

const PF_W: u32 = 2;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The executable does not exist.
    NotFound,
    /// The ELF header is malformed or for some other machine.
    BadHeader,
    /// A program header is malformed or describes an illegal segment.
    BadSegment,
    /// No memory for the initial stack page.
    NoStack,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadError::NotFound => "open failed",
            LoadError::BadHeader => "error loading executable",
            LoadError::BadSegment => "bad segment",
            LoadError::NoStack => "stack setup failed",
        };
        f.write_str(s)
    }
}

struct Ehdr {
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

struct Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

impl Ehdr {
    /// Read and validate the executable header.
    fn read(file: &File) -> Result<Ehdr, LoadError> {
        let mut buf = [0u8; EHDR_SIZE];
        if file.read_at(&mut buf, 0) != EHDR_SIZE {
            return Err(LoadError::BadHeader);
        }
        if buf[..7] != ELF_IDENT {
            return Err(LoadError::BadHeader);
        }
        let hdr = Ehdr {
            e_type: u16_at(&buf, 16),
            e_machine: u16_at(&buf, 18),
            e_version: u32_at(&buf, 20),
            e_entry: u32_at(&buf, 24),
            e_phoff: u32_at(&buf, 28),
            e_phentsize: u16_at(&buf, 42),
            e_phnum: u16_at(&buf, 44),
        };
        let ok = hdr.e_type == ET_EXEC
            && hdr.e_machine == EM_386
            && hdr.e_version == EV_CURRENT
            && hdr.e_phentsize as usize == PHDR_SIZE
            && hdr.e_phnum <= 1024;
        if ok { Ok(hdr) } else { Err(LoadError::BadHeader) }
    }
}

impl Phdr {
    fn read(file: &File, offset: usize) -> Result<Phdr, LoadError> {
        let mut buf = [0u8; PHDR_SIZE];
        if file.read_at(&mut buf, offset) != PHDR_SIZE {
            return Err(LoadError::BadSegment);
        }
        Ok(Phdr {
            p_type: u32_at(&buf, 0),
            p_offset: u32_at(&buf, 4),
            p_vaddr: u32_at(&buf, 8),
            p_filesz: u32_at(&buf, 16),
            p_memsz: u32_at(&buf, 20),
            p_flags: u32_at(&buf, 24),
        })
    }

    /// Checks from the loader's rulebook: offset/vaddr congruent modulo
    /// the page size, offset inside the file, memsz covering filesz, a
    /// nonempty user-space region that neither wraps nor maps page zero.
    fn validate(&self, file: &File) -> bool {
        let pg_mask = PG_SIZE as u32 - 1;
        if self.p_offset & pg_mask != self.p_vaddr & pg_mask {
            return false;
        }
        if self.p_offset as usize > file.length() {
            return false;
        }
        if self.p_memsz < self.p_filesz || self.p_memsz == 0 {
            return false;
        }
        let end = match self.p_vaddr.checked_add(self.p_memsz) {
            Some(end) => end,
            None => return false,
        };
        is_user_vaddr(self.p_vaddr)
            && is_user_vaddr(end)
            && self.p_vaddr >= PG_SIZE as u32
    }
}

/// Load `program` into `vm_arc` and marshal `args` onto the initial
/// stack. On success returns the entry point and initial user stack
/// pointer. The caller holds the page-table lock.
pub fn load(program: &str, args: &[String], vm_arc: &VmHandle) -> Result<(u32, u32), LoadError> {
    let file = vm::exe::checkout(program).ok_or(LoadError::NotFound)?;
    match load_image(&file, args, vm_arc) {
        Ok(done) => Ok(done),
        Err(err) => {
            // The failed image keeps no claim on the executable.
            vm::exe::release(program);
            Err(err)
        }
    }
}

fn load_image(file: &File, args: &[String], vm_arc: &VmHandle) -> Result<(u32, u32), LoadError> {
    let ehdr = Ehdr::read(file)?;

    for i in 0..ehdr.e_phnum as usize {
        let phdr = Phdr::read(file, ehdr.e_phoff as usize + i * PHDR_SIZE)?;
        match phdr.p_type {
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(LoadError::BadSegment),
            PT_LOAD => {
                if !phdr.validate(file) {
                    return Err(LoadError::BadSegment);
                }
                install_segment(file, &phdr, vm_arc);
            }
            _ => {}
        }
    }

    let esp = setup_stack(args, vm_arc).ok_or(LoadError::NoStack)?;
    Ok((ehdr.e_entry, esp))
}

/// Record one IN_FILE supplemental entry per page of a PT_LOAD segment.
fn install_segment(file: &File, phdr: &Phdr, vm_arc: &VmHandle) {
    let pg_mask = PG_SIZE as u32 - 1;
    let writable = phdr.p_flags & PF_W != 0;
    let page_offset = (phdr.p_vaddr & pg_mask) as usize;

    let mut read_bytes;
    let mut zero_bytes;
    if phdr.p_filesz > 0 {
        read_bytes = page_offset + phdr.p_filesz as usize;
        zero_bytes =
            crate::mem::round_up_page(page_offset + phdr.p_memsz as usize) - read_bytes;
    } else {
        read_bytes = 0;
        zero_bytes = crate::mem::round_up_page(page_offset + phdr.p_memsz as usize);
    }

    let mut vpn = Vpn::containing(phdr.p_vaddr);
    let mut offset = (phdr.p_offset & !pg_mask) as usize;

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PG_SIZE);
        let page_zero = PG_SIZE - page_read;

        let already = vm_arc.lock().pages.contains(vpn);
        if already {
            // Overlapping segments share the page; the page becomes
            // writable if any segment wants it so.
            if writable {
                let mut g = vm_arc.lock();
                if let Some(entry) = g.pages.lookup_mut(vpn) {
                    entry.writable = true;
                }
            }
        } else {
            let lazy = LazyFile {
                file: file.clone(),
                offset,
                read_bytes: page_read,
                zero_bytes: page_zero,
            };
            vm::add_lazy_page(vm_arc, vpn, lazy, writable);
        }

        read_bytes -= page_read;
        zero_bytes -= page_zero;
        offset += PG_SIZE;
        vpn = vpn.next();
    }
}

/// Build the initial stack: one zeroed page at the top of user space
/// with `args` marshalled onto it. Returns the initial stack pointer.
fn setup_stack(args: &[String], vm_arc: &VmHandle) -> Option<u32> {
    let page_base = PHYS_BASE - PG_SIZE as u32;
    let kaddr = vm::add_anon_page(vm_arc, Vpn::containing(page_base))?;
    let page = unsafe { core::slice::from_raw_parts_mut(kaddr as *mut u8, PG_SIZE) };
    marshal_args(args, page, page_base)
}

/// Lay out the program arguments on the stack page.
///
/// From the top of user space downward: the argument strings (last
/// argument deepest is not required, only that argv points at them),
/// zero padding to word alignment, a null sentinel, the argv pointers
/// right to left, argv itself, argc, and a zero fake return address.
/// Returns the final stack pointer, or None if it all cannot fit.
pub fn marshal_args(args: &[String], page: &mut [u8], page_base: u32) -> Option<u32> {
    let top = page_base + PG_SIZE as u32;
    let mut esp = top;

    // Lowest address the marshalling may reach: strings plus padding
    // plus (argc + 3) words of tail.
    let tail_words = args.len() + 4;

    // Argument strings, right to left.
    let mut arg_addrs: Vec<u32> = Vec::with_capacity(args.len());
    for arg in args.iter().rev() {
        let bytes = arg.as_bytes();
        esp = esp.checked_sub(bytes.len() as u32 + 1)?;
        if esp < page_base {
            return None;
        }
        let off = (esp - page_base) as usize;
        page[off..off + bytes.len()].copy_from_slice(bytes);
        page[off + bytes.len()] = 0;
        arg_addrs.push(esp);
    }
    arg_addrs.reverse();

    // Word-align, padding with zeros.
    while esp % 4 != 0 {
        if esp == page_base {
            return None;
        }
        esp -= 1;
        page[(esp - page_base) as usize] = 0;
    }

    if (esp - page_base) as usize / 4 < tail_words {
        return None;
    }

    let mut push = |val: u32, esp: &mut u32| {
        *esp -= 4;
        let off = (*esp - page_base) as usize;
        page[off..off + 4].copy_from_slice(&val.to_le_bytes());
    };

    // argv[argc] sentinel, then argv[argc-1] .. argv[0].
    push(0, &mut esp);
    for &addr in arg_addrs.iter().rev() {
        push(addr, &mut esp);
    }
    // argv, argc, fake return address.
    let argv = esp;
    push(argv, &mut esp);
    push(args.len() as u32, &mut esp);
    push(0, &mut esp);

    Some(esp)
}
