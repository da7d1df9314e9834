use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use goblin::elf::Elf;
use goblin::elf::header::ET_DYN;
use kestrel_target::Module;
use tokio::sync::OnceCell;
use tracing::Instrument;
use wholesym::{LookupAddress, SymbolManager, SymbolMap};

use crate::inline::{InlineFrame, build_location};

/// ELF image mapped into a debugged process.
pub struct MappedElf {
    /// Address range of the loaded binary.
    addr_range: Range<u64>,

    /// File name of the loaded binary.
    file_name: String,

    /// Path of the mapped file.
    path: PathBuf,

    /// Binary symbol resolver.
    symbol_manager: Arc<SymbolManager>,

    /// Symbols of the loaded binary, loaded on first lookup.
    symbol_map: OnceCell<SymbolMap>,
}

impl MappedElf {
    /// Creates a `MappedElf` for a module of a debugged process.
    pub fn new(module: &Module, symbol_manager: Arc<SymbolManager>) -> Self {
        let path = match module.path.canonicalize() {
            Ok(p) => p,
            Err(_) => module.path.clone(),
        };

        let file_name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();

        Self {
            addr_range: module.base..module.end,
            file_name,
            path,
            symbol_manager,
            symbol_map: OnceCell::new(),
        }
    }

    /// Returns the address range of the loaded binary.
    pub fn addr_range(&self) -> &Range<u64> {
        &self.addr_range
    }

    /// Returns the file name of the loaded binary.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Returns the path of the loaded binary.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether the address falls within the loaded binary.
    pub fn contains(&self, addr: u64) -> bool {
        self.addr_range.contains(&addr)
    }

    async fn symbol_map(&self) -> crate::Result<&SymbolMap> {
        self.symbol_map
            .get_or_try_init(|| {
                self.symbol_manager
                    .load_symbol_map_for_binary_at_path(&self.path, None)
                    .instrument(tracing::info_span!("LoadSymbols", binary = %self.file_name))
            })
            .await
            .map_err(Into::into)
    }

    /// Resolves an address of the loaded binary, inline frames included.
    pub async fn lookup(&self, addr: u64) -> crate::Result<kestrel_target::Location> {
        let Some(rela_addr) = addr
            .checked_sub(self.addr_range.start)
            .and_then(|offset| u32::try_from(offset).ok())
        else {
            return Ok(kestrel_target::Location::address_only(addr));
        };

        let symbol_map = self.symbol_map().await?;

        let Some(info) = symbol_map.lookup(LookupAddress::Relative(rela_addr)).await else {
            return Ok(build_location(addr, None, Vec::new()));
        };

        let frames = info
            .frames
            .unwrap_or_default()
            .into_iter()
            .map(|frame| InlineFrame {
                function: frame.function,
                file: frame.file_path.map(|path| path.raw_path().to_owned()),
                line: frame.line_number,
            })
            .collect();

        Ok(build_location(addr, Some(info.symbol.name), frames))
    }

    /// Builds the unwind module of the loaded binary from its ELF sections.
    #[tracing::instrument(name = "UnwindModule", skip_all, fields(path = %self.path.display()))]
    pub async fn to_unwind_module(&self) -> crate::Result<framehop::Module<Vec<u8>>> {
        let elf = tokio::fs::read(&self.path)
            .await
            .map_err(|e| crate::Error::File(self.path.clone(), e))?;

        let elf_header = Elf::parse_header(&elf)?;
        let elf_ctx = goblin::container::Ctx::new(elf_header.container()?, elf_header.endianness()?);

        let base_svma = if elf_header.e_type == ET_DYN {
            0
        } else {
            self.addr_range.start
        };

        let mut sections_info = framehop::ExplicitModuleSectionInfo {
            base_svma,
            ..Default::default()
        };

        parse_sections_info(&elf, &elf_header, elf_ctx, &mut sections_info)?;

        Ok(framehop::Module::new(
            self.file_name.clone(),
            self.addr_range.clone(),
            self.addr_range.start,
            sections_info,
        ))
    }
}

fn parse_sections_info(
    elf: &[u8],
    elf_header: &goblin::elf::Header,
    elf_ctx: goblin::container::Ctx,
    module_section_info: &mut framehop::ExplicitModuleSectionInfo<Vec<u8>>,
) -> crate::Result<()> {
    use goblin::elf::SectionHeader;
    use goblin::elf::section_header::{SHN_UNDEF, SHN_XINDEX};
    use goblin::strtab::Strtab;

    let shdrs = SectionHeader::parse(
        elf,
        elf_header.e_shoff as usize,
        elf_header.e_shnum as usize,
        elf_ctx,
    )?;

    let idx = match elf_header.e_shstrndx.into() {
        SHN_XINDEX => shdrs.first().map(|shdr| shdr.sh_link as usize),
        SHN_UNDEF => None,
        n => Some(n as usize),
    };

    let Some(shstrtab) = idx
        .and_then(|i| shdrs.get(i))
        .map(|shdr| Strtab::parse(elf, shdr.sh_offset as usize, shdr.sh_size as usize, 0x0))
        .transpose()?
    else {
        return Ok(());
    };

    for (name, shdr) in shdrs
        .iter()
        .filter_map(|shdr| shstrtab.get_at(shdr.sh_name).map(|name| (name, shdr)))
    {
        let Range { start, end } = shdr.vm_range();
        let svma = start as u64..end as u64;

        let data = shdr
            .file_range()
            .and_then(|range| elf.get(range))
            .map(<[u8]>::to_vec);

        match name {
            ".text" => {
                module_section_info.text_svma = Some(svma);
                module_section_info.text = data;
            }
            ".got" => module_section_info.got_svma = Some(svma),
            ".eh_frame" => {
                module_section_info.eh_frame_svma = Some(svma);
                module_section_info.eh_frame = data;
            }
            ".eh_frame_hdr" => {
                module_section_info.eh_frame_hdr_svma = Some(svma);
                module_section_info.eh_frame_hdr = data;
            }
            ".debug_frame" => module_section_info.debug_frame = data,
            _ => continue,
        }

        tracing::trace!("found section {name}");
    }

    Ok(())
}
