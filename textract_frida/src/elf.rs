//! Utilities to look up exports directly in ELF files

use std::{fs::File, io::Read, path::Path};

use goblin::elf::{section_header::SHN_UNDEF, Elf, Sym};
use textract_bolts::Error;

/// A parsed ELF file borrowing its bytes
#[derive(Debug)]
pub struct EasyElf<'a> {
    elf: Elf<'a>,
}

impl<'a> EasyElf<'a> {
    /// Read and parse `path`, keeping the bytes in `buffer`
    pub fn from_file<P>(path: P, buffer: &'a mut Vec<u8>) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let mut binary_file = File::open(path)?;
        binary_file.read_to_end(buffer)?;
        Self::from_slice(buffer)
    }

    /// Parse an ELF image held in memory
    pub fn from_slice(buffer: &'a [u8]) -> Result<Self, Error> {
        let elf = Elf::parse(buffer).map_err(|e| Error::illegal_argument(format!("{e}")))?;
        Ok(Self { elf })
    }

    /// The underlying goblin representation
    #[must_use]
    pub fn goblin(&self) -> &Elf<'a> {
        &self.elf
    }

    /// The value of the defined dynamic symbol `name`, falling back to the static symbol table.
    /// Undefined or zero valued symbols are not reported.
    #[must_use]
    pub fn resolve_symbol(&self, name: &str) -> Option<u64> {
        let defined = |sym: &Sym| sym.st_shndx != SHN_UNDEF as usize;
        let sym = self
            .elf
            .dynsyms
            .iter()
            .find(|sym| defined(sym) && self.elf.dynstrtab.get_at(sym.st_name) == Some(name))
            .or_else(|| {
                self.elf
                    .syms
                    .iter()
                    .find(|sym| defined(sym) && self.elf.strtab.get_at(sym.st_name) == Some(name))
            })?;
        (sym.st_value != 0).then_some(sym.st_value)
    }
}

/// The runtime address of export `symbol` of the module at `path`, loaded at `base`
pub fn find_export_in_elf<P: AsRef<Path>>(
    path: P,
    symbol: &str,
    base: usize,
) -> Result<Option<usize>, Error> {
    let mut buffer = Vec::new();
    let elf = EasyElf::from_file(path, &mut buffer)?;
    Ok(elf
        .resolve_symbol(symbol)
        .and_then(|value| usize::try_from(value).ok())
        .and_then(|value| base.checked_add(value)))
}

#[cfg(test)]
mod tests {
    use textract_bolts::Error;

    use super::{find_export_in_elf, EasyElf};

    #[test]
    fn test_not_an_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libfake.so");
        std::fs::write(&path, b"definitely not an elf file").unwrap();
        assert!(matches!(
            find_export_in_elf(&path, "il2cpp_string_new", 0x1000),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            find_export_in_elf(dir.path().join("missing.so"), "x", 0),
            Err(Error::File(_))
        ));
        assert!(EasyElf::from_slice(&[0x7f, b'E', b'L']).is_err());
    }

    #[test]
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn test_resolves_libc_export() {
        let path = textract_bolts::os::find_module_path("libc.so.6").unwrap();
        let malloc = find_export_in_elf(&path, "malloc", 0).unwrap().unwrap();
        assert_ne!(malloc, 0);
        assert_eq!(
            find_export_in_elf(&path, "malloc", 0x1000).unwrap(),
            Some(malloc + 0x1000)
        );
        assert_eq!(
            find_export_in_elf(&path, "textract_no_such_export", 0).unwrap(),
            None
        );
    }
}
