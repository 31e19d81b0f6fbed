use crate::bridge::address::GlobalAddress;
use crate::bridge::error::Error;
use crate::bridge::pe::section_name_matches;
use object::{BinaryFormat, Object, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const PAGE_MASK: u64 = !0xFFF;

/// Symbols, sections and exports of an on-disk image, addresses relative to the image base.
#[derive(Debug, Default)]
pub struct ImageIndex {
    pub is_64: bool,
    variables: HashMap<String, u64>,
    functions: HashMap<String, u64>,
    /// Function ranges sorted by start.
    ranges: Vec<(u64, u64)>,
    sections: Vec<(Vec<u8>, u64)>,
    exports: HashMap<Vec<u8>, u64>,
}

impl ImageIndex {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;
        Self::from_object(&object)
    }

    fn from_object(object: &object::File) -> Result<Self, Error> {
        let base = match object.format() {
            BinaryFormat::Pe => object.relative_address_base(),
            _ => object
                .segments()
                .map(|segment| segment.address())
                .min()
                .unwrap_or(0)
                & PAGE_MASK,
        };
        let rva = |addr: u64| addr.checked_sub(base);

        let mut index = ImageIndex {
            is_64: object.is_64(),
            ..ImageIndex::default()
        };
        for symbol in object.symbols().chain(object.dynamic_symbols()) {
            if !symbol.is_definition() {
                continue;
            }
            let (Ok(name), Some(addr)) = (symbol.name(), rva(symbol.address())) else {
                continue;
            };
            match symbol.kind() {
                SymbolKind::Text => {
                    index.functions.insert(name.to_string(), addr);
                    index.ranges.push((addr, symbol.size().max(1)));
                }
                SymbolKind::Data => {
                    index.variables.insert(name.to_string(), addr);
                }
                _ => {}
            }
        }
        index.ranges.sort_unstable();
        index.ranges.dedup();

        for section in object.sections() {
            if let (Ok(name), Some(addr)) = (section.name_bytes(), rva(section.address())) {
                index.sections.push((name.to_vec(), addr));
            }
        }
        for export in object.exports()? {
            if let Some(addr) = rva(export.address()) {
                index.exports.insert(export.name().to_vec(), addr);
            }
        }
        Ok(index)
    }

    pub fn has_symbols(&self) -> bool {
        !self.functions.is_empty() || !self.variables.is_empty()
    }

    pub fn variable(&self, name: &str) -> Option<GlobalAddress> {
        self.variables.get(name).copied().map(GlobalAddress::from)
    }

    pub fn function(&self, name: &str) -> Option<GlobalAddress> {
        self.functions.get(name).copied().map(GlobalAddress::from)
    }

    /// Start of the function containing `rva`.
    pub fn function_start(&self, rva: u64) -> Option<u64> {
        let idx = self.ranges.partition_point(|&(start, _)| start <= rva);
        let (start, size) = *self.ranges.get(idx.checked_sub(1)?)?;
        (rva - start < size).then_some(start)
    }

    pub fn section(&self, tag: &str) -> Option<GlobalAddress> {
        self.sections
            .iter()
            .find(|(name, _)| section_name_matches(name, tag))
            .map(|&(_, addr)| GlobalAddress::from(addr))
    }

    pub fn export(&self, name: &str) -> Option<GlobalAddress> {
        self.exports
            .get(name.as_bytes())
            .copied()
            .map(GlobalAddress::from)
    }
}
