//! Operating System specific helpers: memory map walking and process identity.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    sync::OnceLock,
};

use regex::Regex;

use crate::Error;

/// A single line of a `maps` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsEntry {
    /// First address of the region
    pub start: usize,
    /// One past the last address of the region
    pub end: usize,
    /// `rwxp` style permissions
    pub perms: String,
    /// The backing path, may be empty or a pseudo path like `[stack]`
    pub path: String,
}

fn maps_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<start>[0-9a-f]{8,16})-(?P<end>[0-9a-f]{8,16}) (?P<perm>[-rwxps]{4}) (?P<offset>[0-9a-f]{8,16}) [0-9a-f]+:[0-9a-f]+ [0-9]+\s*(?P<path>.*)$")
            .expect("maps regex is valid")
    })
}

/// Parse one line of a `maps` file. Returns `None` for lines that do not look like a mapping.
#[must_use]
pub fn parse_maps_line(line: &str) -> Option<MapsEntry> {
    let caps = maps_regex().captures(line)?;
    Some(MapsEntry {
        start: usize::from_str_radix(caps.name("start")?.as_str(), 16).ok()?,
        end: usize::from_str_radix(caps.name("end")?.as_str(), 16).ok()?,
        perms: caps.name("perm")?.as_str().to_string(),
        path: caps.name("path")?.as_str().trim().to_string(),
    })
}

/// Allows one to walk the mappings of any `maps` formatted reader, calling a callback function
/// for each mapping.
/// If the callback returns true, we stop the walk.
pub fn walk_maps<R: BufRead>(
    reader: R,
    visitor: &mut dyn FnMut(&MapsEntry) -> bool,
) -> Result<(), Error> {
    for line in reader.lines() {
        let line = line?;
        if let Some(entry) = parse_maps_line(&line) {
            if visitor(&entry) {
                break;
            }
        }
    }
    Ok(())
}

/// Allows one to walk the mappings in /proc/self/maps, calling a callback function for each
/// mapping.
/// If the callback returns true, we stop the walk.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn walk_self_maps(visitor: &mut dyn FnMut(&MapsEntry) -> bool) -> Result<(), Error> {
    let mapsfile = File::open("/proc/self/maps")?;
    walk_maps(BufReader::new(mapsfile), visitor)
}

/// There is no `/proc/self/maps` on this platform.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn walk_self_maps(_visitor: &mut dyn FnMut(&MapsEntry) -> bool) -> Result<(), Error> {
    Err(Error::unsupported("walking /proc/self/maps"))
}

/// Start address of the first mapping whose path contains `name`, or 0.
pub fn find_module_base_in<R: BufRead>(reader: R, name: &str) -> Result<usize, Error> {
    let mut base = 0;
    walk_maps(reader, &mut |entry| {
        if entry.path.contains(name) {
            base = entry.start;
            true
        } else {
            false
        }
    })?;
    Ok(base)
}

/// Start address of the first mapping of the current process whose path contains `name`,
/// or 0 if the module is not (yet) mapped.
#[must_use]
pub fn find_module_base(name: &str) -> usize {
    if name.is_empty() {
        return 0;
    }
    let mut base = 0;
    let walked = walk_self_maps(&mut |entry| {
        if entry.path.contains(name) {
            base = entry.start;
            true
        } else {
            false
        }
    });
    if let Err(err) = walked {
        log::debug!("Could not walk the memory map: {err}");
        return 0;
    }
    base
}

/// Full path of the first mapping of the current process whose path contains `name`
#[must_use]
pub fn find_module_path(name: &str) -> Option<String> {
    let mut path = None;
    walk_self_maps(&mut |entry| {
        if entry.path.contains(name) {
            path = Some(entry.path.clone());
            true
        } else {
            false
        }
    })
    .ok()?;
    path
}

/// The base package of a process name: everything before the first `:`.
/// Process variants like `com.example.game:remote` share the storage of `com.example.game`.
#[must_use]
pub fn base_package(process_name: &str) -> &str {
    let pkg = process_name
        .split_once(':')
        .map_or(process_name, |(pkg, _)| pkg)
        .trim();
    if pkg.is_empty() {
        "unknown"
    } else {
        pkg
    }
}
