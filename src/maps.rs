//! Reading the list of loaded binaries from `/proc/<pid>/maps`.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use arrayvec::ArrayVec;
use memmap2::Mmap;
use object::{Object, ObjectSegment};

use crate::error::ModuleError;
use crate::module::{Module, ModuleMap};

/// One line of a maps file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub executable: bool,
    /// The file offset that is mapped at `start`.
    pub offset: u64,
    /// The backing file, or the pseudo-path like `[stack]`, if any.
    pub path: Option<String>,
    /// The backing file has been deleted or replaced since it was mapped.
    pub deleted: bool,
}

impl Mapping {
    /// Parse a line of the form `start-end perms offset dev inode [path]`.
    pub fn parse(line: &str) -> Result<Self, ModuleError> {
        let malformed = || ModuleError::MalformedMapsLine(line.to_string());

        let fields: ArrayVec<&str, 6> = line.splitn(6, ' ').collect();
        if fields.len() < 5 {
            return Err(malformed());
        }
        let (start, end) = fields[0].split_once('-').ok_or_else(malformed)?;
        let start = u64::from_str_radix(start, 16).map_err(|_| malformed())?;
        let end = u64::from_str_radix(end, 16).map_err(|_| malformed())?;
        let perms = fields[1].as_bytes();
        if perms.len() < 4 || start > end {
            return Err(malformed());
        }
        let offset = u64::from_str_radix(fields[2], 16).map_err(|_| malformed())?;

        let (path, deleted) = match fields.get(5).map(|p| p.trim()) {
            None | Some("") => (None, false),
            Some(path) => match path.strip_suffix(" (deleted)") {
                Some(path) => (Some(path.to_string()), true),
                None => (Some(path.to_string()), false),
            },
        };

        Ok(Mapping {
            start,
            end,
            readable: perms[0] == b'r',
            executable: perms[2] == b'x',
            offset,
            path,
            deleted,
        })
    }

    /// Whether this mapping is backed by a file on disk we can open.
    fn is_file_backed(&self) -> bool {
        !self.deleted && self.path.as_deref().is_some_and(|p| p.starts_with('/'))
    }
}

fn maps_path(pid: Option<i32>) -> String {
    match pid {
        Some(pid) => format!("/proc/{pid}/maps"),
        None => "/proc/self/maps".to_string(),
    }
}

/// Read and parse the maps file of `pid`, or of the calling process for `None`.
pub fn read_maps(pid: Option<i32>) -> Result<Vec<Mapping>, ModuleError> {
    let path = maps_path(pid);
    let maps = std::fs::read_to_string(&path).map_err(|source| ModuleError::Io {
        path: path.into(),
        source,
    })?;
    maps.lines()
        .filter(|line| !line.is_empty())
        .map(Mapping::parse)
        .collect()
}

/// A loadable segment: its file offset and its SVMA.
#[derive(Clone, Copy, Debug)]
struct LoadSegment {
    offset: u64,
    address: u64,
}

/// Compute the load bias of an image from one of its mappings: the AVMA at which the
/// mapping starts, minus the SVMA of the mapped file offset.
///
/// Segments may share a file page, so the mapping belongs to the last segment that
/// starts in or before the mapped page. `segments` must be in file order.
fn bias_for_mapping(
    segments: &[LoadSegment],
    mapping: &Mapping,
    page_size: u64,
) -> Option<u64> {
    let page_mask = !(page_size - 1);
    let segment = segments
        .iter()
        .rev()
        .find(|segment| (segment.offset & page_mask) <= mapping.offset)?;
    let svma = segment
        .address
        .wrapping_sub(segment.offset)
        .wrapping_add(mapping.offset);
    Some(mapping.start.wrapping_sub(svma))
}

fn load_segments(file: &object::File<'_>) -> Vec<LoadSegment> {
    let mut segments: Vec<LoadSegment> = file
        .segments()
        .filter_map(|segment| {
            let (offset, size) = segment.file_range();
            (size != 0).then(|| LoadSegment {
                offset,
                address: segment.address(),
            })
        })
        .collect();
    segments.sort_unstable_by_key(|segment| segment.offset);
    segments
}

fn page_size() -> u64 {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as u64,
        _ => 4096,
    }
}

fn load_module(path: &str, mappings: &[&Mapping]) -> Result<Option<Module<Mmap>>, ModuleError> {
    let Some(exec_mapping) = mappings.iter().find(|m| m.executable) else {
        return Ok(None);
    };
    let io_error = |source| ModuleError::Io {
        path: path.into(),
        source,
    };
    let file = File::open(Path::new(path)).map_err(io_error)?;
    // The file stays mapped for as long as the module lives. Binaries that are
    // currently loaded by a process are not expected to be modified in place.
    let mmap = unsafe { Mmap::map(&file) }.map_err(io_error)?;

    let bias = {
        let object = object::File::parse(&*mmap).map_err(|source| ModuleError::Object {
            path: path.into(),
            source,
        })?;
        bias_for_mapping(&load_segments(&object), exec_mapping, page_size()).ok_or_else(
            || ModuleError::NoSegmentForOffset {
                path: path.into(),
                offset: exec_mapping.offset,
            },
        )?
    };

    let start = mappings.iter().map(|m| m.start).min().unwrap_or(exec_mapping.start);
    let end = mappings.iter().map(|m| m.end).max().unwrap_or(exec_mapping.end);
    Module::from_elf(path.to_string(), start..end, bias, mmap).map(Some)
}

/// Build the module map of `pid`, or of the calling process for `None`.
///
/// Every file-backed image with at least one executable mapping becomes a module.
/// Images that cannot be opened or parsed are skipped; their frames will have no CFI
/// and no symbols.
pub fn load_modules(pid: Option<i32>) -> Result<ModuleMap<Mmap>, ModuleError> {
    let mappings = read_maps(pid)?;

    let mut by_path: BTreeMap<&str, Vec<&Mapping>> = BTreeMap::new();
    for mapping in mappings.iter().filter(|m| m.is_file_backed()) {
        if let Some(path) = mapping.path.as_deref() {
            by_path.entry(path).or_default().push(mapping);
        }
    }

    let mut modules = ModuleMap::new();
    for (path, mappings) in by_path {
        match load_module(path, &mappings) {
            Ok(Some(module)) => {
                log::trace!("Loaded {module:?}");
                modules.add_module(module);
            }
            Ok(None) => {}
            Err(e) => log::debug!("Skipping {path}: {e}"),
        }
    }
    Ok(modules)
}
