//! ROM set loading.
//!
//! The machine needs three system images (kernal, basic, chargen); each
//! attachable drive model can bring its DOS image too.  Every ROM is
//! described by one `RomSpec` row and resolved the same way, so adding
//! an image means adding a row, not another loader.  Both `.bin` and
//! `.rom` extensions are accepted (`.bin` tried first).
//!
//! # Search paths (tried in order)
//! 1. `$C64_ROM_DIR`  — environment variable
//! 2. `./roms/`       — next to the binary / working directory
//! 3. `./`            — working directory itself
//! 4. `~/.local/share/c64/roms/`
//! 5. `/usr/share/vice/C64/`
//!
//! System ROMs are mandatory; a power-on without them fails here, before
//! any machine state exists.  Drive DOS ROMs are optional — a drive
//! without one runs on a stub and still answers the bus through the
//! protocol engine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::{env, fs, io};

use crate::drive::DriveModel;

pub const BASIC_ROM_SIZE: usize = 0x2000;
pub const KERNAL_ROM_SIZE: usize = 0x2000;
pub const CHARGEN_ROM_SIZE: usize = 0x1000;

// ── Errors ────────────────────────────────────────────────────

/// ROM load failure; fatal at power-on.
#[derive(Debug)]
pub enum RomError {
    /// No search-path candidate held a complete system set.
    NoRomDirectory { searched: Vec<PathBuf> },
    /// A required image is absent from the chosen directory.
    Missing { name: &'static str, dir: PathBuf },
    /// The file exists but is too small to be the named chip.
    WrongSize {
        path: PathBuf,
        expected: usize,
        got: usize,
    },
    /// The file could not be read.
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for RomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RomError::NoRomDirectory { searched } => {
                writeln!(f, "C64 ROM files not found.  Searched:")?;
                for dir in searched {
                    writeln!(f, "  {}", dir.display())?;
                }
                write!(
                    f,
                    "Place kernal.bin/rom (8 KiB), basic.bin/rom (8 KiB), and \
                     chargen.bin/rom (4 KiB) in one of those directories, \
                     or set the C64_ROM_DIR environment variable."
                )
            }
            RomError::Missing { name, dir } => {
                write!(f, "{}/{name}.bin or .rom not found", dir.display())
            }
            RomError::WrongSize {
                path,
                expected,
                got,
            } => write!(
                f,
                "{}: expected at least {expected} bytes, got {got}",
                path.display()
            ),
            RomError::Io { path, source } => {
                write!(f, "{}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for RomError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RomError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ── ROM descriptors ───────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct RomSpec {
    name: &'static str,
    min_size: usize,
}

const KERNAL: RomSpec = RomSpec {
    name: "kernal",
    min_size: KERNAL_ROM_SIZE,
};
const BASIC: RomSpec = RomSpec {
    name: "basic",
    min_size: BASIC_ROM_SIZE,
};
const CHARGEN: RomSpec = RomSpec {
    name: "chargen",
    min_size: CHARGEN_ROM_SIZE,
};

const SYSTEM_ROMS: [RomSpec; 3] = [KERNAL, BASIC, CHARGEN];

/// The DOS image a drive model boots from.
fn drive_rom_spec(model: DriveModel) -> RomSpec {
    match model {
        DriveModel::D1541 => RomSpec {
            name: "dos1541",
            min_size: 0x2000,
        },
        DriveModel::D1571 => RomSpec {
            name: "dos1571",
            min_size: 0x8000,
        },
        DriveModel::D1581 => RomSpec {
            name: "dos1581",
            min_size: 0x8000,
        },
    }
}

const DRIVE_MODELS: [DriveModel; 3] =
    [DriveModel::D1541, DriveModel::D1571, DriveModel::D1581];

fn drive_slot(model: DriveModel) -> usize {
    match model {
        DriveModel::D1541 => 0,
        DriveModel::D1571 => 1,
        DriveModel::D1581 => 2,
    }
}

// ── RomSet ────────────────────────────────────────────────────

pub struct RomSet {
    pub kernal: Vec<u8>,
    pub basic: Vec<u8>,
    pub chargen: Vec<u8>,
    drive_roms: [Option<Vec<u8>>; 3],
}

impl RomSet {
    /// Search the standard paths and load everything available.
    pub fn load() -> Result<Self, RomError> {
        let searched = candidate_dirs();
        let dir = match searched.iter().find(|d| has_system_roms(d)) {
            Some(d) => d.clone(),
            None => return Err(RomError::NoRomDirectory { searched }),
        };
        Self::load_from(dir)
    }

    /// Load from an explicit directory.
    pub fn load_from<P: AsRef<Path>>(dir: P) -> Result<Self, RomError> {
        let dir = dir.as_ref();
        let kernal = read_rom(dir, KERNAL)?;
        let basic = read_rom(dir, BASIC)?;
        let chargen = read_rom(dir, CHARGEN)?;

        let mut drive_roms: [Option<Vec<u8>>; 3] = [None, None, None];
        for model in DRIVE_MODELS {
            let spec = drive_rom_spec(model);
            match read_rom(dir, spec) {
                Ok(data) => drive_roms[drive_slot(model)] = Some(data),
                Err(RomError::Missing { .. }) => {
                    log::debug!("{} drive runs on the stub ({} absent)", model.name(), spec.name);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            kernal,
            basic,
            chargen,
            drive_roms,
        })
    }

    /// The DOS image for a drive model, when one was found.
    pub fn drive_rom(&self, model: DriveModel) -> Option<&[u8]> {
        self.drive_roms[drive_slot(model)].as_deref()
    }
}

// ── Path resolution ───────────────────────────────────────────

fn candidate_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Ok(val) = env::var("C64_ROM_DIR") {
        dirs.push(PathBuf::from(val));
    }
    if let Ok(cwd) = env::current_dir() {
        dirs.push(cwd.join("roms"));
        dirs.push(cwd);
    }
    if let Ok(exe) = env::current_exe() {
        if let Some(d) = exe.parent() {
            dirs.push(d.join("roms"));
            dirs.push(d.to_path_buf());
        }
    }
    if let Some(home) = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE")) {
        dirs.push(
            PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("c64")
                .join("roms"),
        );
    }
    dirs.push(PathBuf::from("/usr/share/vice/C64"));
    dirs.push(PathBuf::from("/usr/local/share/vice/C64"));
    dirs
}

fn has_system_roms(dir: &Path) -> bool {
    SYSTEM_ROMS.iter().all(|spec| resolve(dir, spec.name).is_some())
}

/// Find an image by base name — `.bin` first, then `.rom`.
fn resolve(dir: &Path, name: &str) -> Option<PathBuf> {
    ["bin", "rom"]
        .iter()
        .map(|ext| dir.join(format!("{name}.{ext}")))
        .find(|p| p.is_file())
}

fn read_rom(dir: &Path, spec: RomSpec) -> Result<Vec<u8>, RomError> {
    let path = resolve(dir, spec.name).ok_or(RomError::Missing {
        name: spec.name,
        dir: dir.to_path_buf(),
    })?;
    let data = fs::read(&path).map_err(|source| RomError::Io {
        path: path.clone(),
        source,
    })?;
    if data.len() < spec.min_size {
        return Err(RomError::WrongSize {
            path,
            expected: spec.min_size,
            got: data.len(),
        });
    }
    log::info!("loaded ROM: {}", path.display());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unique scratch directory under the system temp dir.
    fn scratch(tag: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!(
            "breadbin-roms-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_system_set(dir: &Path) {
        fs::write(dir.join("kernal.bin"), vec![0xE2; KERNAL_ROM_SIZE]).unwrap();
        fs::write(dir.join("basic.rom"), vec![0xA0; BASIC_ROM_SIZE]).unwrap();
        fs::write(dir.join("chargen.bin"), vec![0x3C; CHARGEN_ROM_SIZE]).unwrap();
    }

    #[test]
    fn loads_a_complete_system_set() {
        let dir = scratch("full");
        write_system_set(&dir);

        let roms = RomSet::load_from(&dir).unwrap();
        assert_eq!(roms.kernal.len(), KERNAL_ROM_SIZE);
        assert_eq!(roms.basic[0], 0xA0, ".rom extension resolved");
        assert_eq!(roms.chargen.len(), CHARGEN_ROM_SIZE);
        // No DOS images present: every drive falls back to the stub.
        for model in DRIVE_MODELS {
            assert!(roms.drive_rom(model).is_none());
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn drive_roms_key_by_model() {
        let dir = scratch("drives");
        write_system_set(&dir);
        fs::write(dir.join("dos1541.bin"), vec![0x41; 0x4000]).unwrap();
        fs::write(dir.join("dos1581.rom"), vec![0x81; 0x8000]).unwrap();

        let roms = RomSet::load_from(&dir).unwrap();
        assert_eq!(roms.drive_rom(DriveModel::D1541).unwrap()[0], 0x41);
        assert!(roms.drive_rom(DriveModel::D1571).is_none());
        assert_eq!(roms.drive_rom(DriveModel::D1581).unwrap().len(), 0x8000);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_system_rom_is_fatal() {
        let dir = scratch("missing");
        fs::write(dir.join("kernal.bin"), vec![0; KERNAL_ROM_SIZE]).unwrap();

        match RomSet::load_from(&dir) {
            Err(RomError::Missing { name, .. }) => assert_eq!(name, "basic"),
            Err(e) => panic!("expected Missing, got {e}"),
            Ok(_) => panic!("load must fail without a BASIC image"),
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn short_image_reports_its_size() {
        let dir = scratch("short");
        write_system_set(&dir);
        fs::write(dir.join("kernal.bin"), vec![0; 100]).unwrap();

        match RomSet::load_from(&dir) {
            Err(RomError::WrongSize { expected, got, .. }) => {
                assert_eq!(expected, KERNAL_ROM_SIZE);
                assert_eq!(got, 100);
            }
            Err(e) => panic!("expected WrongSize, got {e}"),
            Ok(_) => panic!("load must fail on a truncated kernal"),
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn short_drive_rom_is_an_error_not_a_stub() {
        // A present-but-truncated DOS image must fail loudly rather
        // than silently booting the stub.
        let dir = scratch("shortdos");
        write_system_set(&dir);
        fs::write(dir.join("dos1571.bin"), vec![0; 0x1000]).unwrap();

        assert!(matches!(
            RomSet::load_from(&dir),
            Err(RomError::WrongSize { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
