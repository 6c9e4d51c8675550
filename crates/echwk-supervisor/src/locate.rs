//! Executable resolution
//!
//! Search order: directory of the running program, current working
//! directory, then every `PATH` entry.

use crate::supervisor::SupervisorError;
use std::env;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default name of the proxy binary
pub const EXECUTABLE_NAME: &str = "ech-workers";

/// Magic numbers of POSIX binaries and scripts
const POSIX_HEADERS: [&[u8]; 6] = [
    b"\x7fELF",
    b"\xfe\xed\xfa",     // Mach-O, big endian
    b"\xce\xfa\xed\xfe", // Mach-O 32-bit
    b"\xcf\xfa\xed\xfe", // Mach-O 64-bit
    b"\xca\xfe\xba\xbe", // universal binary
    b"#!",
];

/// Whether `header` starts like an ELF/Mach-O binary or a script
pub fn is_posix_executable_header(header: &[u8]) -> bool {
    POSIX_HEADERS.iter().any(|magic| header.starts_with(magic))
}

/// Finds the proxy binary in a fixed list of directories
#[derive(Debug, Clone)]
pub struct ExecutableLocator {
    name: String,
    dirs: Vec<PathBuf>,
}

impl ExecutableLocator {
    /// Standard search path for `name`
    pub fn new(name: impl Into<String>) -> Self {
        let mut dirs = Vec::new();

        if let Some(dir) = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            dirs.push(dir);
        }
        if let Ok(cwd) = env::current_dir() {
            if !dirs.contains(&cwd) {
                dirs.push(cwd);
            }
        }
        if let Some(path) = env::var_os("PATH") {
            dirs.extend(env::split_paths(&path));
        }

        Self::with_dirs(name, dirs)
    }

    /// Search only `dirs`, in order
    pub fn with_dirs(name: impl Into<String>, dirs: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dirs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// File name on this platform (`.exe` appended on Windows)
    pub fn file_name(&self) -> String {
        if cfg!(windows) && Path::new(&self.name).extension().is_none() {
            format!("{}.exe", self.name)
        } else {
            self.name.clone()
        }
    }

    /// First qualifying candidate
    pub fn locate(&self) -> Result<PathBuf, SupervisorError> {
        let file_name = self.file_name();
        let mut searched = Vec::with_capacity(self.dirs.len());

        for dir in &self.dirs {
            let candidate = dir.join(&file_name);
            if qualifies(&candidate) {
                info!("Using {}", candidate.display());
                return Ok(candidate);
            }
            searched.push(candidate);
        }

        Err(SupervisorError::ExecutableNotFound {
            name: file_name,
            searched,
        })
    }
}

impl Default for ExecutableLocator {
    fn default() -> Self {
        Self::new(EXECUTABLE_NAME)
    }
}

fn read_header(path: &Path) -> Option<[u8; 4]> {
    let mut header = [0u8; 4];
    let mut file = fs::File::open(path).ok()?;
    let read = file.read(&mut header).ok()?;
    (read >= 2).then_some(header)
}

#[cfg(unix)]
fn qualifies(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    if metadata.permissions().mode() & 0o111 != 0 {
        return true;
    }

    match read_header(path) {
        Some(header) if is_posix_executable_header(&header) => {
            debug!("{} is not executable, setting mode 755", path.display());
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o755)) {
                warn!("Failed to chmod {}: {}", path.display(), e);
            }
            true
        }
        _ => false,
    }
}

#[cfg(windows)]
fn qualifies(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let has_exe_suffix = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"));

    has_exe_suffix || read_header(path).is_some_and(|header| header.starts_with(b"MZ"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers() {
        assert!(is_posix_executable_header(b"\x7fELF\x02\x01"));
        assert!(is_posix_executable_header(b"#!/bin/sh"));
        assert!(is_posix_executable_header(b"\xcf\xfa\xed\xfe"));
        assert!(!is_posix_executable_header(b"MZ\x90\x00"));
        assert!(!is_posix_executable_header(b"hello"));
        assert!(!is_posix_executable_header(b""));
    }

    #[test]
    fn test_not_found_lists_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ExecutableLocator::with_dirs("ech-workers", vec![dir.path().to_path_buf()]);

        match locator.locate() {
            Err(SupervisorError::ExecutableNotFound { searched, .. }) => {
                assert_eq!(searched, vec![dir.path().join(locator.file_name())]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_default_search_order() {
        let locator = ExecutableLocator::default();
        let exe_dir = env::current_exe().unwrap().parent().unwrap().to_path_buf();
        assert_eq!(locator.search_dirs()[0], exe_dir);
        assert_eq!(locator.name(), EXECUTABLE_NAME);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        #[test]
        fn test_first_directory_wins() {
            let first = tempfile::tempdir().unwrap();
            let second = tempfile::tempdir().unwrap();
            for dir in [&first, &second] {
                let path = dir.path().join("ech-workers");
                fs::write(&path, "#!/bin/sh\n").unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            }

            let locator = ExecutableLocator::with_dirs(
                "ech-workers",
                vec![first.path().to_path_buf(), second.path().to_path_buf()],
            );
            assert_eq!(locator.locate().unwrap(), first.path().join("ech-workers"));
        }

        #[test]
        fn test_script_gets_chmod() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("ech-workers");
            fs::write(&path, "#!/bin/sh\necho hi\n").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

            let locator = ExecutableLocator::with_dirs("ech-workers", vec![dir.path().to_path_buf()]);
            assert_eq!(locator.locate().unwrap(), path);

            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        #[test]
        fn test_plain_file_skipped() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("ech-workers");
            fs::write(&path, "just some notes").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

            let locator = ExecutableLocator::with_dirs("ech-workers", vec![dir.path().to_path_buf()]);
            assert!(locator.locate().is_err());
        }
    }
}
