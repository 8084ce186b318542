// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program loading: ELF64 RISC-V images and the flat boot image
//! OWNERS: @kernel-team
//! PUBLIC API: ProgramSource, Registry, PROGRAMS, parse(), load_elf(), load_flat(), commit(), Image, ExecError
//! DEPENDS_ON: mm::AddressSpace (mmap/store), mm::layout (stack placement), task::TaskData
//! INVARIANTS: A failed load releases every frame it took; the running image is untouched until commit()
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::vec::Vec;
use core::mem::size_of;

use crate::mm::address_space::{AddressSpace, VmError};
use crate::mm::frame::Frames;
use crate::mm::layout::{is_page_aligned, PAGE_SIZE, USER_STACK_PAGES, VA_ANONYMOUS, VA_USERSTACK};
use crate::mm::vma::{MapFlags, Perm};
use crate::param::MAXARG;
use crate::sync::SpinLock;
use crate::task::TaskData;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;

/// Errors surfaced while loading a program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecError {
    /// No program registered under the path.
    NotFound,
    /// Image shorter than its headers claim.
    Truncated,
    /// ELF magic missing or header fields inconsistent.
    InvalidElf,
    WrongClass,
    WrongEndian,
    WrongMachine,
    /// Segment misaligned, overlapping the stack, or larger than the file.
    BadSegment,
    TooManyArgs,
    /// Arguments do not fit on the initial stack.
    ArgsTooLarge,
    Vm(VmError),
}

impl From<VmError> for ExecError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

/// Byte source of a program image.
pub trait ProgramSource: Sync {
    fn size(&self) -> usize;
    /// Copies bytes starting at `offset` into `buf`; returns how many were
    /// available.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;
}

impl ProgramSource for [u8] {
    fn size(&self) -> usize {
        self.len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let Some(tail) = self.get(offset..) else {
            return 0;
        };
        let n = core::cmp::min(tail.len(), buf.len());
        buf[..n].copy_from_slice(&tail[..n]);
        n
    }
}

impl ProgramSource for Vec<u8> {
    fn size(&self) -> usize {
        self.len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.as_slice().read_at(offset, buf)
    }
}

impl<const N: usize> ProgramSource for [u8; N] {
    fn size(&self) -> usize {
        N
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        <[u8] as ProgramSource>::read_at(self, offset, buf)
    }
}

/// Path -> image table standing in for the filesystem.
pub struct Registry {
    entries: SpinLock<Vec<(&'static str, &'static dyn ProgramSource)>>,
}

impl Registry {
    pub const fn new() -> Self {
        Self { entries: SpinLock::new("programs", Vec::new()) }
    }

    /// Registers `source` under `path`, replacing an earlier entry.
    pub fn register(&self, path: &'static str, source: &'static dyn ProgramSource) {
        let mut entries = self.entries.lock();
        entries.retain(|(existing, _)| *existing != path);
        entries.push((path, source));
    }

    pub fn lookup(&self, path: &str) -> Option<&'static dyn ProgramSource> {
        self.entries.lock().iter().find(|(existing, _)| *existing == path).map(|(_, source)| *source)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Programs reachable through `exec`.
pub static PROGRAMS: Registry = Registry::new();

/// One `PT_LOAD` segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: usize,
    pub memsz: usize,
    pub filesz: usize,
    pub offset: usize,
    pub perm: Perm,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadPlan {
    pub entry: usize,
    pub segments: Vec<Segment>,
}

/// A fully built address space waiting to be installed.
pub struct Image {
    pub space: AddressSpace,
    pub entry: usize,
    pub sp: usize,
    pub argc: usize,
    /// User address of the argv pointer array.
    pub argv: usize,
}

fn read_exact<S: ProgramSource + ?Sized>(source: &S, offset: usize, buf: &mut [u8]) -> Result<(), ExecError> {
    if source.read_at(offset, buf) == buf.len() {
        Ok(())
    } else {
        Err(ExecError::Truncated)
    }
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8], at: usize) -> usize {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw) as usize
}

/// Validates the ELF header and collects the loadable segments.
pub fn parse<S: ProgramSource + ?Sized>(source: &S) -> Result<LoadPlan, ExecError> {
    let mut ehdr = [0u8; EHDR_SIZE];
    read_exact(source, 0, &mut ehdr)?;
    if ehdr[0..4] != *b"\x7FELF" {
        return Err(ExecError::InvalidElf);
    }
    if ehdr[4] != ELFCLASS64 {
        return Err(ExecError::WrongClass);
    }
    if ehdr[5] != ELFDATA2LSB {
        return Err(ExecError::WrongEndian);
    }
    if le_u16(&ehdr, 18) != EM_RISCV {
        return Err(ExecError::WrongMachine);
    }
    let entry = le_u64(&ehdr, 24);
    let phoff = le_u64(&ehdr, 32);
    let phentsize = le_u16(&ehdr, 54) as usize;
    let phnum = le_u16(&ehdr, 56) as usize;
    if phnum > 0 && phentsize < PHDR_SIZE {
        return Err(ExecError::InvalidElf);
    }

    let mut segments = Vec::new();
    for index in 0..phnum {
        let at = index
            .checked_mul(phentsize)
            .and_then(|offset| offset.checked_add(phoff))
            .ok_or(ExecError::Truncated)?;
        let mut phdr = [0u8; PHDR_SIZE];
        read_exact(source, at, &mut phdr)?;
        if le_u32(&phdr, 0) != PT_LOAD {
            continue;
        }
        let flags = le_u32(&phdr, 4);
        let mut perm = Perm::READ;
        if flags & PF_W != 0 {
            perm |= Perm::WRITE;
        }
        if flags & PF_X != 0 {
            perm |= Perm::EXEC;
        }
        let segment = Segment {
            offset: le_u64(&phdr, 8),
            vaddr: le_u64(&phdr, 16),
            filesz: le_u64(&phdr, 32),
            memsz: le_u64(&phdr, 40),
            perm,
        };
        if segment.memsz == 0 {
            continue;
        }
        let in_memory = segment.vaddr.checked_add(segment.memsz).is_some_and(|end| end <= VA_USERSTACK);
        let in_file = segment.offset.checked_add(segment.filesz).is_some_and(|end| end <= source.size());
        if !is_page_aligned(segment.vaddr) || segment.filesz > segment.memsz || !in_memory || !in_file {
            return Err(ExecError::BadSegment);
        }
        segments.push(segment);
    }
    if segments.is_empty() {
        return Err(ExecError::InvalidElf);
    }
    Ok(LoadPlan { entry, segments })
}

/// Builds a fresh address space for an ELF image with `argv` on its stack.
pub fn load_elf<S: ProgramSource + ?Sized>(
    frames: &Frames<'_>,
    source: &S,
    argv: &[&[u8]],
) -> Result<Image, ExecError> {
    if argv.len() > MAXARG {
        return Err(ExecError::TooManyArgs);
    }
    let plan = parse(source)?;
    let mut space = AddressSpace::new(frames)?;
    let built = plan
        .segments
        .iter()
        .try_for_each(|segment| load_segment(frames, &mut space, source, segment))
        .and_then(|()| push_args(frames, &mut space, argv));
    match built {
        Ok(sp) => Ok(Image { space, entry: plan.entry, sp, argc: argv.len(), argv: sp }),
        Err(err) => {
            space.release(frames);
            Err(err)
        }
    }
}

/// Builds an address space holding a raw image at virtual address 0, with
/// an empty argument vector on its stack.
pub fn load_flat(frames: &Frames<'_>, image: &[u8]) -> Result<Image, ExecError> {
    let mut space = AddressSpace::new(frames)?;
    let flags = MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED;
    let built = space
        .mmap(frames, 0, core::cmp::max(image.len(), 1), Perm::READ | Perm::EXEC, flags, true)
        .and_then(|_| space.store(0, image))
        .map_err(ExecError::from)
        .and_then(|()| push_args(frames, &mut space, &[]));
    match built {
        Ok(sp) => Ok(Image { space, entry: 0, sp, argc: 0, argv: sp }),
        Err(err) => {
            space.release(frames);
            Err(err)
        }
    }
}

fn load_segment<S: ProgramSource + ?Sized>(
    frames: &Frames<'_>,
    space: &mut AddressSpace,
    source: &S,
    segment: &Segment,
) -> Result<(), ExecError> {
    space.mmap(frames, segment.vaddr, segment.memsz, segment.perm, MapFlags::PRIVATE | MapFlags::FIXED, true)?;
    let mut chunk = [0u8; 512];
    let mut done = 0;
    while done < segment.filesz {
        let n = core::cmp::min(chunk.len(), segment.filesz - done);
        read_exact(source, segment.offset + done, &mut chunk[..n])?;
        space.store(segment.vaddr + done, &chunk[..n])?;
        done += n;
    }
    Ok(())
}

/// Maps the user stack below `VA_ANONYMOUS` and pushes the argument
/// strings followed by the NULL-terminated pointer array. Returns the
/// initial stack pointer, which is also the array address.
fn push_args(frames: &Frames<'_>, space: &mut AddressSpace, argv: &[&[u8]]) -> Result<usize, ExecError> {
    let flags = MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED;
    space.mmap(frames, VA_USERSTACK, USER_STACK_PAGES * PAGE_SIZE, Perm::READ | Perm::WRITE, flags, true)?;

    let mut pointers = [0usize; MAXARG + 1];
    let mut sp = VA_ANONYMOUS;
    for (slot, arg) in pointers.iter_mut().zip(argv) {
        sp = sp.checked_sub(arg.len() + 1).ok_or(ExecError::ArgsTooLarge)? & !0xf;
        if sp < VA_USERSTACK {
            return Err(ExecError::ArgsTooLarge);
        }
        space.store(sp, arg)?;
        space.store(sp + arg.len(), &[0])?;
        *slot = sp;
    }
    let table = &pointers[..=argv.len()];
    sp = sp.checked_sub(table.len() * size_of::<usize>()).ok_or(ExecError::ArgsTooLarge)? & !0xf;
    if sp < VA_USERSTACK {
        return Err(ExecError::ArgsTooLarge);
    }
    for (index, pointer) in table.iter().enumerate() {
        space.store(sp + index * size_of::<usize>(), &pointer.to_le_bytes())?;
    }
    Ok(sp)
}

/// Installs `image` into the task owning `data`: maps the trap pages,
/// swaps the address space, releases the old one and points the saved
/// registers at the new entry. Returns `argc`.
pub fn commit(
    frames: &Frames<'_>,
    trampoline: usize,
    data: &mut TaskData,
    name: &str,
    image: Image,
) -> Result<usize, ExecError> {
    let Image { mut space, entry, sp, argc, argv } = image;
    if let Err(err) = space.map_trap_pages(frames, trampoline, data.trapframe) {
        space.release(frames);
        return Err(err.into());
    }
    if let Some(old) = data.space.replace(space) {
        old.release(frames);
    }
    if let Some(tf) = data.trapframe() {
        tf.epc = entry;
        tf.set_sp(sp);
        tf.set_a1(argv);
    }
    data.set_name(name.rsplit('/').next().unwrap_or(name));
    Ok(argc)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mm::frame::HeapFrames;
    use crate::task::TaskTable;

    pub(crate) const ENTRY: usize = 0x1000;
    pub(crate) const TEXT: &[u8] = &[0x13, 0x00, 0x00, 0x00, 0x73, 0x00, 0x00, 0x00];

    /// Minimal ELF64 RISC-V image: one R+X text segment at 0x1000 and one
    /// R+W data segment at 0x2000 with a zero-filled tail.
    pub(crate) fn sample_elf() -> Vec<u8> {
        let mut image = vec![0u8; 0x200];
        image[0..4].copy_from_slice(b"\x7FELF");
        image[4] = ELFCLASS64;
        image[5] = ELFDATA2LSB;
        image[6] = 1;
        image[16..18].copy_from_slice(&2u16.to_le_bytes());
        image[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        image[24..32].copy_from_slice(&(ENTRY as u64).to_le_bytes());
        image[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        image[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        image[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image[56..58].copy_from_slice(&2u16.to_le_bytes());

        let mut phdr = |index: usize, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64| {
            let at = EHDR_SIZE + index * PHDR_SIZE;
            image[at..at + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            image[at + 4..at + 8].copy_from_slice(&flags.to_le_bytes());
            image[at + 8..at + 16].copy_from_slice(&offset.to_le_bytes());
            image[at + 16..at + 24].copy_from_slice(&vaddr.to_le_bytes());
            image[at + 32..at + 40].copy_from_slice(&filesz.to_le_bytes());
            image[at + 40..at + 48].copy_from_slice(&memsz.to_le_bytes());
        };
        phdr(0, 4 | PF_X, 0x180, ENTRY as u64, TEXT.len() as u64, TEXT.len() as u64);
        phdr(1, 4 | PF_W, 0x1c0, 0x2000, 4, 0x1800);
        image[0x180..0x180 + TEXT.len()].copy_from_slice(TEXT);
        image[0x1c0..0x1c4].copy_from_slice(b"data");
        image
    }

    fn read_user(space: &mut AddressSpace, frames: &Frames<'_>, va: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        space.copy_in(frames, &mut buf, va).unwrap();
        buf
    }

    #[test]
    fn parse_collects_load_segments() {
        let plan = parse(sample_elf().as_slice()).unwrap();
        assert_eq!(plan.entry, ENTRY);
        assert_eq!(plan.segments.len(), 2);
        assert_eq!(plan.segments[0].perm, Perm::READ | Perm::EXEC);
        assert_eq!(plan.segments[1].perm, Perm::READ | Perm::WRITE);
        assert_eq!(plan.segments[1].memsz, 0x1800);
    }

    #[test]
    fn parse_rejects_foreign_images() {
        let mut image = sample_elf();
        image[18] = 0x3e;
        assert_eq!(parse(image.as_slice()), Err(ExecError::WrongMachine));

        let mut image = sample_elf();
        image[4] = 1;
        assert_eq!(parse(image.as_slice()), Err(ExecError::WrongClass));

        assert_eq!(parse(&b"\x7FEL"[..]), Err(ExecError::Truncated));
        assert_eq!(parse(&[0u8; EHDR_SIZE][..]), Err(ExecError::InvalidElf));

        let mut image = sample_elf();
        // Second segment claims more file bytes than the image has.
        let at = EHDR_SIZE + PHDR_SIZE + 32;
        image[at..at + 8].copy_from_slice(&0x1000u64.to_le_bytes());
        assert_eq!(parse(image.as_slice()), Err(ExecError::BadSegment));
    }

    #[test]
    fn load_maps_segments_and_arguments() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let elf = sample_elf();
        let mut image = load_elf(&frames, elf.as_slice(), &[&b"prog"[..], &b"-v"[..]]).unwrap();
        assert_eq!(image.entry, ENTRY);
        assert_eq!(image.argc, 2);
        assert_eq!(image.sp % 16, 0);
        assert!(image.sp >= VA_USERSTACK && image.sp < VA_ANONYMOUS);

        let space = &mut image.space;
        assert_eq!(read_user(space, &frames, ENTRY, TEXT.len()), TEXT);
        assert_eq!(read_user(space, &frames, 0x2000, 6), b"data\0\0");
        assert_eq!(read_user(space, &frames, 0x3400, 1), [0]);

        let table = read_user(space, &frames, image.argv, 3 * size_of::<usize>());
        let pointer = |index: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&table[index * 8..index * 8 + 8]);
            usize::from_le_bytes(raw)
        };
        assert_eq!(pointer(2), 0);
        let mut arg = [0u8; 8];
        let len = space.copy_in_str(&frames, &mut arg, pointer(0)).unwrap();
        assert_eq!(&arg[..len], b"prog");
        let len = space.copy_in_str(&frames, &mut arg, pointer(1)).unwrap();
        assert_eq!(&arg[..len], b"-v");

        image.space.release(&frames);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn text_segment_stays_read_only() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let elf = sample_elf();
        let mut image = load_elf(&frames, elf.as_slice(), &[]).unwrap();
        assert_eq!(image.space.copy_out(&frames, ENTRY, &[0]), Err(VmError::BadAddress));
        image.space.release(&frames);
    }

    #[test]
    fn failed_load_releases_every_frame() {
        let heap = HeapFrames::with_limit(6);
        let frames = Frames::new(&heap);
        let elf = sample_elf();
        assert!(matches!(load_elf(&frames, elf.as_slice(), &[]), Err(ExecError::Vm(VmError::OutOfMemory))));
        assert_eq!(heap.live(), 0);
        assert_eq!(frames.tracked(), 0);
    }

    #[test]
    fn too_many_arguments_are_refused() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let elf = sample_elf();
        let args = [&b"x"[..]; MAXARG + 1];
        assert!(matches!(load_elf(&frames, elf.as_slice(), &args), Err(ExecError::TooManyArgs)));
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn flat_image_lands_at_zero() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut image = load_flat(&frames, TEXT).unwrap();
        assert_eq!(image.entry, 0);
        assert_eq!(read_user(&mut image.space, &frames, 0, TEXT.len()), TEXT);
        image.space.release(&frames);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn commit_replaces_the_running_image() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(2, 0x8020_0000);
        let first = load_flat(&frames, TEXT).unwrap();
        let pid = table.spawn_user(&frames, "init", first.space, first.entry, first.sp).unwrap();
        // SAFETY: the test owns the slot.
        let data = unsafe { table.task(pid).unwrap().data() };

        let elf = sample_elf();
        let image = load_elf(&frames, elf.as_slice(), &[&b"prog"[..]]).unwrap();
        let argv = image.argv;
        assert_eq!(commit(&frames, table.trampoline(), data, "/bin/prog", image), Ok(1));
        assert_eq!(data.name(), "prog");
        let tf = data.trapframe().unwrap();
        assert_eq!((tf.epc, tf.sp(), tf.x[11]), (ENTRY, argv, argv));
        let space = data.space.as_ref().unwrap();
        assert!(space.entry(0).is_none());
        assert!(space.entry(ENTRY).is_some());
    }

    #[test]
    fn registry_replaces_entries_by_path() {
        static FIRST: [u8; 1] = [1];
        static SECOND: [u8; 2] = [2, 2];
        let registry = Registry::new();
        registry.register("/init", &FIRST);
        registry.register("/init", &SECOND);
        assert_eq!(registry.lookup("/init").map(|source| source.size()), Some(2));
        assert!(registry.lookup("/missing").is_none());
    }
}
