// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! Helpers shared by the unit tests. Mainly a tiny builder for synthesizing
//! valid 32-bit little-endian ELF executables in memory.

use crate::flash::{FlashInfo, FlashType, SectionDecl, SectionRecord};

pub fn flash_info(flash_type: FlashType) -> FlashInfo {
    FlashInfo {
        name: "flash".to_owned(),
        index: 0,
        flash_type,
        itf: 0,
        cs: 0,
        size: 0x10_0000,
    }
}

pub fn decl(
    name: &str,
    global_index: u16,
    flash_index: u16,
    class: (u8, u8),
) -> SectionDecl {
    SectionDecl {
        name: name.to_owned(),
        global_index,
        flash_index,
        flash: 0,
        partition_type: class.0,
        partition_subtype: class.1,
    }
}

pub fn record(offset: u64, size: u64, empty: bool) -> SectionRecord {
    SectionRecord {
        offset,
        size,
        empty,
        flash_type_code: 0,
        itf: 0,
        cs: 0,
    }
}

struct Seg {
    vaddr: u32,
    paddr: u32,
    data: Vec<u8>,
    // (name, offset within the segment, size)
    sections: Vec<(String, u32, u32)>,
}

pub struct ElfBuilder {
    entry: u32,
    segments: Vec<Seg>,
    // (name, vaddr, size)
    nobits: Vec<(String, u32, u32)>,
    // (name, vaddr, data): allocated sections outside every segment
    orphans: Vec<(String, u32, Vec<u8>)>,
}

const EHSIZE: u32 = 52;
const PHENTSIZE: u32 = 32;
const SHENTSIZE: u32 = 40;

const PT_LOAD: u32 = 1;
const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_NOBITS: u32 = 8;
const SHF_ALLOC: u32 = 2;

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

impl ElfBuilder {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: vec![],
            nobits: vec![],
            orphans: vec![],
        }
    }

    /// Add a `PT_LOAD` segment with the given contents.
    pub fn segment(mut self, vaddr: u32, paddr: u32, data: Vec<u8>) -> Self {
        self.segments.push(Seg {
            vaddr,
            paddr,
            data,
            sections: vec![],
        });
        self
    }

    /// Add an allocated `SHT_PROGBITS` section covering a slice of the most
    /// recently added segment.
    pub fn section(mut self, name: &str, offset: u32, size: u32) -> Self {
        let seg = self.segments.last_mut().unwrap();
        assert!((offset + size) as usize <= seg.data.len());
        seg.sections.push((name.to_owned(), offset, size));
        self
    }

    /// Add an allocated `SHT_NOBITS` section.
    pub fn nobits(mut self, name: &str, vaddr: u32, size: u32) -> Self {
        self.nobits.push((name.to_owned(), vaddr, size));
        self
    }

    /// Add an allocated section that no load segment covers.
    pub fn orphan_section(mut self, name: &str, vaddr: u32, data: Vec<u8>) -> Self {
        self.orphans.push((name.to_owned(), vaddr, data));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let phoff = EHSIZE;
        let mut cursor = phoff + PHENTSIZE * self.segments.len() as u32;

        let mut seg_offsets = vec![];
        for seg in &self.segments {
            seg_offsets.push(cursor);
            cursor += seg.data.len() as u32;
        }

        let mut orphan_offsets = vec![];
        for (_, _, data) in &self.orphans {
            orphan_offsets.push(cursor);
            cursor += data.len() as u32;
        }

        // Section header string table. Index 0 stays the empty string.
        let mut strtab = vec![0u8];
        let mut name_off = |name: &str| {
            let off = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            off
        };

        // (name offset, type, flags, vaddr, file offset, size)
        let mut shdrs = vec![(0, 0, 0, 0, 0, 0)];
        for (seg, seg_off) in self.segments.iter().zip(&seg_offsets) {
            for (name, offset, size) in &seg.sections {
                shdrs.push((
                    name_off(name),
                    SHT_PROGBITS,
                    SHF_ALLOC,
                    seg.vaddr + offset,
                    seg_off + offset,
                    *size,
                ));
            }
        }
        for (name, vaddr, size) in &self.nobits {
            shdrs.push((name_off(name), SHT_NOBITS, SHF_ALLOC, *vaddr, 0, *size));
        }
        for ((name, vaddr, data), off) in self.orphans.iter().zip(&orphan_offsets) {
            shdrs.push((
                name_off(name),
                SHT_PROGBITS,
                SHF_ALLOC,
                *vaddr,
                *off,
                data.len() as u32,
            ));
        }
        shdrs.push((
            name_off(".shstrtab"),
            SHT_STRTAB,
            0,
            0,
            cursor,
            strtab.len() as u32,
        ));

        let strtab_off = cursor;
        cursor += strtab.len() as u32;
        let pad = (4 - cursor % 4) % 4;
        cursor += pad;
        let shoff = cursor;

        let mut out = vec![];

        // e_ident: magic, ELFCLASS32, ELFDATA2LSB, EV_CURRENT
        out.extend_from_slice(b"\x7fELF\x01\x01\x01");
        out.resize(16, 0);
        put_u16(&mut out, 2); // e_type: ET_EXEC
        put_u16(&mut out, 0x28); // e_machine: EM_ARM
        put_u32(&mut out, 1); // e_version
        put_u32(&mut out, self.entry);
        put_u32(&mut out, phoff);
        put_u32(&mut out, shoff);
        put_u32(&mut out, 0); // e_flags
        put_u16(&mut out, EHSIZE as u16);
        put_u16(&mut out, PHENTSIZE as u16);
        put_u16(&mut out, self.segments.len() as u16);
        put_u16(&mut out, SHENTSIZE as u16);
        put_u16(&mut out, shdrs.len() as u16);
        put_u16(&mut out, (shdrs.len() - 1) as u16); // e_shstrndx

        for (seg, seg_off) in self.segments.iter().zip(&seg_offsets) {
            put_u32(&mut out, PT_LOAD);
            put_u32(&mut out, *seg_off);
            put_u32(&mut out, seg.vaddr);
            put_u32(&mut out, seg.paddr);
            put_u32(&mut out, seg.data.len() as u32); // p_filesz
            put_u32(&mut out, seg.data.len() as u32); // p_memsz
            put_u32(&mut out, 7); // p_flags: RWX
            put_u32(&mut out, 4); // p_align
        }

        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        for (_, _, data) in &self.orphans {
            out.extend_from_slice(data);
        }

        assert_eq!(out.len() as u32, strtab_off);
        out.extend_from_slice(&strtab);
        out.resize(shoff as usize, 0);

        for (name, sh_type, flags, vaddr, offset, size) in shdrs {
            put_u32(&mut out, name);
            put_u32(&mut out, sh_type);
            put_u32(&mut out, flags);
            put_u32(&mut out, vaddr);
            put_u32(&mut out, offset);
            put_u32(&mut out, size);
            put_u32(&mut out, 0); // sh_link
            put_u32(&mut out, 0); // sh_info
            put_u32(&mut out, 4); // sh_addralign
            put_u32(&mut out, 0); // sh_entsize
        }

        out
    }
}
