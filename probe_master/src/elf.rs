//! Minimal static i386 ELF executable around a flat blob of code.

use object::elf::{
    FileHeader32, Ident, ProgramHeader32, ELFCLASS32, ELFDATA2LSB, ELFMAG, ELFOSABI_SYSV, EM_386,
    ET_EXEC, EV_CURRENT, PF_R, PF_X, PT_LOAD,
};
use object::pod::bytes_of;
use object::{LittleEndian, U16, U32};
use std::mem::size_of;

/// Where the single segment is mapped.
pub const LOAD_ADDRESS: u32 = 0x0804_8000;

const FILE_HEADER_SIZE: usize = size_of::<FileHeader32<LittleEndian>>();
const PROGRAM_HEADER_SIZE: usize = size_of::<ProgramHeader32<LittleEndian>>();
pub const HEADERS_SIZE: usize = FILE_HEADER_SIZE + PROGRAM_HEADER_SIZE;

const PAGE_SIZE: u32 = 0x1000;

/// Address of the first code byte, the code must be assembled for this ip.
pub const fn entry_point() -> u32 {
    LOAD_ADDRESS + HEADERS_SIZE as u32
}

pub fn wrap(code: &[u8]) -> Vec<u8> {
    let e = LittleEndian;
    let total = (HEADERS_SIZE + code.len()) as u32;

    let header = FileHeader32 {
        e_ident: Ident {
            magic: ELFMAG,
            class: ELFCLASS32,
            data: ELFDATA2LSB,
            version: EV_CURRENT,
            os_abi: ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: U16::new(e, ET_EXEC),
        e_machine: U16::new(e, EM_386),
        e_version: U32::new(e, u32::from(EV_CURRENT)),
        e_entry: U32::new(e, entry_point()),
        e_phoff: U32::new(e, FILE_HEADER_SIZE as u32),
        e_shoff: U32::new(e, 0),
        e_flags: U32::new(e, 0),
        e_ehsize: U16::new(e, FILE_HEADER_SIZE as u16),
        e_phentsize: U16::new(e, PROGRAM_HEADER_SIZE as u16),
        e_phnum: U16::new(e, 1),
        e_shentsize: U16::new(e, 0),
        e_shnum: U16::new(e, 0),
        e_shstrndx: U16::new(e, 0),
    };

    // headers and code in one R+X segment
    let segment = ProgramHeader32 {
        p_type: U32::new(e, PT_LOAD),
        p_offset: U32::new(e, 0),
        p_vaddr: U32::new(e, LOAD_ADDRESS),
        p_paddr: U32::new(e, LOAD_ADDRESS),
        p_filesz: U32::new(e, total),
        p_memsz: U32::new(e, total),
        p_flags: U32::new(e, PF_R | PF_X),
        p_align: U32::new(e, PAGE_SIZE),
    };

    let mut image = Vec::with_capacity(total as usize);
    image.extend_from_slice(bytes_of(&header));
    image.extend_from_slice(bytes_of(&segment));
    image.extend_from_slice(code);
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::read::elf::{FileHeader, ProgramHeader};

    #[test]
    fn test_elf_headers() {
        let code = [0x90, 0xcc];
        let image = wrap(&code);
        let e = LittleEndian;

        assert_eq!(HEADERS_SIZE, 84);
        assert_eq!(entry_point(), 0x0804_8054);

        let header = FileHeader32::<LittleEndian>::parse(&*image).unwrap();
        assert!(!header.is_type_64());
        assert_eq!(header.e_type(e), ET_EXEC);
        assert_eq!(header.e_machine(e), EM_386);
        assert_eq!(header.e_entry(e), entry_point());

        let segments = header.program_headers(e, &*image).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].p_type(e), PT_LOAD);
        assert_eq!(segments[0].p_vaddr(e), LOAD_ADDRESS);
        assert_eq!(segments[0].p_filesz(e), image.len() as u32);
        assert_eq!(segments[0].p_flags(e), PF_R | PF_X);

        assert_eq!(&image[HEADERS_SIZE..], &code);
    }
}
