//! Executable image walker over remote memory.
//!
//! Reads the loaded image header of a module directly from the debugee: DOS header, NT headers,
//! optional header data directories, section table and export directory. Every read is small
//! and bounded, an unmapped or half initialized image yields an error, never a fault.

use crate::bridge::address::{GlobalAddress, RelocatedAddress};
use crate::bridge::error::Error;
use crate::bridge::error::Error::ImageFormat;
use crate::bridge::host::RemoteMemory;
use crate::bridge::memory::MemoryExt;
use object::pe::{
    ImageDataDirectory, ImageDosHeader, ImageExportDirectory, ImageFileHeader,
    ImageOptionalHeader32, ImageOptionalHeader64, ImageSectionHeader, IMAGE_DIRECTORY_ENTRY_EXPORT,
    IMAGE_DOS_SIGNATURE, IMAGE_NT_OPTIONAL_HDR32_MAGIC, IMAGE_NT_OPTIONAL_HDR64_MAGIC,
    IMAGE_NT_SIGNATURE,
};
use object::pod::Pod;
use object::LittleEndian as LE;

/// NT headers never start that far into an image.
const MAX_NT_HEADERS_OFFSET: u32 = 0x1_0000;
const MAX_OPTIONAL_HEADER_SIZE: usize = 0x1000;
const MAX_SECTIONS: usize = 96;
const MAX_EXPORT_NAMES: u32 = 0x1_0000;
const MAX_EXPORT_NAME_LEN: usize = 256;
const SECTION_NAME_LEN: usize = 8;

/// Section table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: [u8; SECTION_NAME_LEN],
    pub virtual_address: GlobalAddress,
    pub virtual_size: u32,
}

/// Header facts required by lookups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageHeaders {
    pub is_64: bool,
    pub sections: Vec<Section>,
    export_directory: Option<(GlobalAddress, u32)>,
}

/// Return true if a section name matches `tag`.
///
/// Image section names are at most 8 bytes, so a longer tag matches its truncation.
/// A leading dot is optional on both the plain and the truncated form.
pub fn section_name_matches(name: &[u8], tag: &str) -> bool {
    let name = match name.iter().position(|b| *b == 0) {
        Some(end) => &name[..end],
        None => name,
    };
    let tag = tag.as_bytes();
    for prefix in [&b""[..], &b"."[..]] {
        let candidate: Vec<u8> = prefix.iter().chain(tag.iter()).copied().collect();
        if name == candidate.as_slice() {
            return true;
        }
        if name.len() == SECTION_NAME_LEN
            && candidate.len() > SECTION_NAME_LEN
            && name == &candidate[..SECTION_NAME_LEN]
        {
            return true;
        }
    }
    false
}

fn read_pod<T: Pod, M: RemoteMemory + ?Sized>(
    memory: &M,
    addr: RelocatedAddress,
    what: &'static str,
) -> Result<T, Error> {
    let bytes = memory.read_bytes(addr, std::mem::size_of::<T>())?;
    let (value, _) = object::pod::from_bytes::<T>(&bytes).map_err(|_| ImageFormat(what))?;
    Ok(*value)
}

/// Loaded image of one module in the debugee.
pub struct RemoteImage<'a, M: RemoteMemory + ?Sized> {
    memory: &'a M,
    base: RelocatedAddress,
}

impl<'a, M: RemoteMemory + ?Sized> RemoteImage<'a, M> {
    pub fn new(memory: &'a M, base: RelocatedAddress) -> Self {
        Self { memory, base }
    }

    fn at(&self, rva: impl Into<u64>) -> Result<RelocatedAddress, Error> {
        let rva = rva.into();
        self.base
            .checked_add(rva)
            .ok_or(Error::AddressOverflow(self.base, rva))
    }

    /// Read DOS and NT headers and the section table.
    pub fn headers(&self) -> Result<ImageHeaders, Error> {
        let dos: ImageDosHeader = read_pod(self.memory, self.base, "dos header")?;
        if dos.e_magic.get(LE) != IMAGE_DOS_SIGNATURE {
            return Err(ImageFormat("dos signature"));
        }
        let nt_offset = dos.e_lfanew.get(LE);
        if nt_offset == 0 || nt_offset > MAX_NT_HEADERS_OFFSET {
            return Err(ImageFormat("nt headers offset"));
        }

        let nt = self.at(nt_offset)?;
        if self.memory.read_u32(nt)? != IMAGE_NT_SIGNATURE {
            return Err(ImageFormat("nt signature"));
        }
        let file_header_addr = self.at(nt_offset as u64 + 4)?;
        let file_header: ImageFileHeader = read_pod(self.memory, file_header_addr, "file header")?;

        let optional_size = file_header.size_of_optional_header.get(LE) as usize;
        if optional_size > MAX_OPTIONAL_HEADER_SIZE {
            return Err(ImageFormat("optional header size"));
        }
        let optional_addr = self.at(
            nt_offset as u64 + 4 + std::mem::size_of::<ImageFileHeader>() as u64,
        )?;
        let optional = self.memory.read_bytes(optional_addr, optional_size)?;
        let (is_64, directories) = Self::data_directories(&optional)?;

        let export_directory = directories
            .get(IMAGE_DIRECTORY_ENTRY_EXPORT)
            .map(|dir| (dir.virtual_address.get(LE), dir.size.get(LE)))
            .filter(|(va, size)| *va != 0 && *size != 0)
            .map(|(va, size)| (GlobalAddress::from(va), size));

        let section_count = file_header.number_of_sections.get(LE) as usize;
        if section_count > MAX_SECTIONS {
            return Err(ImageFormat("section count"));
        }
        let table = self.memory.read_bytes(
            optional_addr
                .checked_add(optional_size as u64)
                .ok_or(Error::AddressOverflow(optional_addr, optional_size as u64))?,
            section_count * std::mem::size_of::<ImageSectionHeader>(),
        )?;
        let (raw_sections, _) =
            object::pod::slice_from_bytes::<ImageSectionHeader>(&table, section_count)
                .map_err(|_| ImageFormat("section table"))?;
        let sections = raw_sections
            .iter()
            .map(|s| Section {
                name: s.name,
                virtual_address: GlobalAddress::from(s.virtual_address.get(LE)),
                virtual_size: s.virtual_size.get(LE),
            })
            .collect();

        Ok(ImageHeaders {
            is_64,
            sections,
            export_directory,
        })
    }

    fn data_directories(optional: &[u8]) -> Result<(bool, Vec<ImageDataDirectory>), Error> {
        let magic = optional
            .get(..2)
            .map(|m| u16::from_le_bytes([m[0], m[1]]))
            .ok_or(ImageFormat("optional header magic"))?;

        let (is_64, count, rest) = match magic {
            IMAGE_NT_OPTIONAL_HDR64_MAGIC => {
                let (header, rest) = object::pod::from_bytes::<ImageOptionalHeader64>(optional)
                    .map_err(|_| ImageFormat("optional header"))?;
                (true, header.number_of_rva_and_sizes.get(LE), rest)
            }
            IMAGE_NT_OPTIONAL_HDR32_MAGIC => {
                let (header, rest) = object::pod::from_bytes::<ImageOptionalHeader32>(optional)
                    .map_err(|_| ImageFormat("optional header"))?;
                (false, header.number_of_rva_and_sizes.get(LE), rest)
            }
            _ => return Err(ImageFormat("optional header magic")),
        };

        let available = rest.len() / std::mem::size_of::<ImageDataDirectory>();
        let count = (count as usize).min(available);
        let (directories, _) = object::pod::slice_from_bytes::<ImageDataDirectory>(rest, count)
            .map_err(|_| ImageFormat("data directories"))?;
        Ok((is_64, directories.to_vec()))
    }

    /// Module relative address of the first section matching `tag`.
    pub fn find_section(&self, tag: &str) -> Result<Option<GlobalAddress>, Error> {
        let headers = self.headers()?;
        Ok(headers
            .sections
            .iter()
            .find(|s| section_name_matches(&s.name, tag))
            .map(|s| s.virtual_address))
    }

    /// Module relative address of an exported symbol, forwarded exports are not resolved.
    pub fn find_export(&self, name: &str) -> Result<Option<GlobalAddress>, Error> {
        let headers = self.headers()?;
        let Some((dir_rva, dir_size)) = headers.export_directory else {
            return Ok(None);
        };

        let dir: ImageExportDirectory =
            read_pod(self.memory, self.at(dir_rva)?, "export directory")?;
        let names_count = dir.number_of_names.get(LE);
        let functions_count = dir.number_of_functions.get(LE);
        if names_count > MAX_EXPORT_NAMES || functions_count > MAX_EXPORT_NAMES {
            return Err(ImageFormat("export directory size"));
        }

        let names_rva = dir.address_of_names.get(LE) as u64;
        let ordinals_rva = dir.address_of_name_ordinals.get(LE) as u64;
        let functions_rva = dir.address_of_functions.get(LE) as u64;

        for i in 0..names_count as u64 {
            let name_rva = self.memory.read_u32(self.at(names_rva + i * 4)?)?;
            let Some(export_name) =
                crate::muted_error!(self.read_name(name_rva), "export name:")
            else {
                continue;
            };
            if export_name != name {
                continue;
            }

            let ordinal = self.memory.read_u16(self.at(ordinals_rva + i * 2)?)? as u32;
            if ordinal >= functions_count {
                return Err(ImageFormat("export ordinal"));
            }
            let rva = self
                .memory
                .read_u32(self.at(functions_rva + ordinal as u64 * 4)?)?;

            let dir_start = dir_rva.as_u64();
            let forwarded =
                rva as u64 >= dir_start && (rva as u64) < dir_start + dir_size as u64;
            if rva == 0 || forwarded {
                return Ok(None);
            }
            return Ok(Some(GlobalAddress::from(rva)));
        }
        Ok(None)
    }

    fn read_name(&self, rva: u32) -> Result<String, Error> {
        // a name near the end of a mapping may not have the whole bound readable
        let addr = self.at(rva)?;
        let mut len = MAX_EXPORT_NAME_LEN;
        loop {
            match self.memory.read_c_string(addr, len) {
                Ok(name) => return Ok(name),
                Err(e) if len <= 16 => return Err(e),
                Err(_) => len /= 4,
            }
        }
    }
}
