use std::path::{Path, PathBuf};

use futures_util::TryStreamExt;
use kestrel_target::Module;
use nix::unistd::Pid;
use tokio::fs::File;
use tokio::io::BufReader;
use tokio_util::codec::{FramedRead, LinesCodec};

/// File-backed mapping of `/proc/<pid>/maps`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Mapping {
    start: u64,
    end: u64,
    offset: u64,
    path: PathBuf,
}

/// Lists the binaries mapped into a process.
pub async fn process_modules(pid: Pid) -> crate::Result<Vec<Module>> {
    let path: PathBuf = format!("/proc/{pid}/maps").into();

    let reader = File::open(&path)
        .await
        .map(BufReader::new)
        .map_err(|e| crate::Error::File(path, e))?;

    let mut lines = FramedRead::new(reader, LinesCodec::new());
    let mut mappings = Vec::new();

    while let Some(line) = lines.try_next().await? {
        if let Some(mapping) = parse_mapping(&line) {
            mappings.push(mapping);
        }
    }

    Ok(collect_modules(mappings))
}

/// Parses a line of `/proc/<pid>/maps`, keeping file-backed mappings only.
fn parse_mapping(line: &str) -> Option<Mapping> {
    let mut fields = line.split_ascii_whitespace();

    let (start, end) = fields.next()?.split_once('-')?;
    let _perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;

    // the path may contain spaces
    let path = fields.collect::<Vec<_>>().join(" ");

    if !path.starts_with('/') {
        return None;
    }

    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(offset, 16).ok()?,
        path: path.into(),
    })
}

/// Groups mappings by file, from the mapping of the file start to the end
/// of its last mapping.
fn collect_modules(mappings: Vec<Mapping>) -> Vec<Module> {
    let mut modules: Vec<Module> = Vec::new();

    for mapping in mappings {
        let last = modules.iter_mut().rev().find(|m| m.path == mapping.path);

        match (last, mapping.offset) {
            (Some(module), offset) if offset != 0 => {
                module.end = module.end.max(mapping.end);
            }
            (_, 0) => modules.push(Module {
                name: file_name(&mapping.path),
                path: mapping.path,
                base: mapping.start,
                end: mapping.end,
            }),
            _ => (),
        }
    }

    modules.sort_by_key(|module| module.base);
    modules
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned()
}
