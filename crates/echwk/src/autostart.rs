//! Launch at login
//!
//! Windows: a `ECHWorkersClient` value under
//! `HKCU\Software\Microsoft\Windows\CurrentVersion\Run`.
//! macOS: `~/Library/LaunchAgents/com.echworkers.client.plist`.
//!
//! Both register this binary with [`AUTOSTART_FLAG`] so a login launch
//! starts the proxy straight away.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Flag passed to the binary when launched at login
pub const AUTOSTART_FLAG: &str = "--autostart";

/// Value name under the `Run` key
pub const RUN_VALUE_NAME: &str = "ECHWorkersClient";

/// launchd job label
pub const LAUNCH_AGENT_LABEL: &str = "com.echworkers.client";

#[derive(Debug, Error)]
pub enum AutostartError {
    #[error("Launch at login is not supported on {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A per-user launch-at-login registration
pub trait LaunchAtLogin {
    fn is_enabled(&self) -> Result<bool, AutostartError>;

    /// Register `program args..`; replaces an existing registration
    fn enable(&self, program: &Path, args: &[String]) -> Result<(), AutostartError>;

    /// Remove the registration; succeeds when there is none
    fn disable(&self) -> Result<(), AutostartError>;
}

/// The registration mechanism of this platform
pub fn system_autostart() -> Result<Box<dyn LaunchAtLogin>, AutostartError> {
    #[cfg(windows)]
    {
        Ok(Box::new(RunKey))
    }

    #[cfg(target_os = "macos")]
    {
        LaunchAgent::for_current_user()
            .map(|agent| Box::new(agent) as Box<dyn LaunchAtLogin>)
            .ok_or(AutostartError::Unsupported("a system without a home directory"))
    }

    #[cfg(not(any(windows, target_os = "macos")))]
    {
        Err(AutostartError::Unsupported(std::env::consts::OS))
    }
}

/// launchd agent plist
#[derive(Debug, Clone)]
pub struct LaunchAgent {
    path: PathBuf,
}

impl LaunchAgent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/Library/LaunchAgents/com.echworkers.client.plist`
    pub fn for_current_user() -> Option<Self> {
        let home = dirs::home_dir()?;
        Some(Self::new(
            home.join("Library")
                .join("LaunchAgents")
                .join(format!("{}.plist", LAUNCH_AGENT_LABEL)),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LaunchAtLogin for LaunchAgent {
    fn is_enabled(&self) -> Result<bool, AutostartError> {
        Ok(self.path.exists())
    }

    fn enable(&self, program: &Path, args: &[String]) -> Result<(), AutostartError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let plist = render_plist(program, args);
        let temp_path = self.path.with_extension("plist.tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(plist.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &self.path)?;

        info!("Installed launch agent {}", self.path.display());
        Ok(())
    }

    fn disable(&self) -> Result<(), AutostartError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed launch agent {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// RunAtLoad job, no KeepAlive
pub fn render_plist(program: &Path, args: &[String]) -> String {
    let mut arguments = format!(
        "        <string>{}</string>\n",
        xml_escape(&program.to_string_lossy())
    );
    for arg in args {
        arguments.push_str(&format!("        <string>{}</string>\n", xml_escape(arg)));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{arguments}    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <false/>
</dict>
</plist>
"#,
        label = LAUNCH_AGENT_LABEL,
        arguments = arguments,
    )
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// `"program" "arg" ..` as stored in the `Run` value
pub fn run_command_line(program: &Path, args: &[String]) -> String {
    std::iter::once(program.to_string_lossy().into_owned())
        .chain(args.iter().cloned())
        .map(|part| format!("\"{}\"", part))
        .collect::<Vec<_>>()
        .join(" ")
}

/// HKCU `Run` value
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RunKey;

#[cfg(windows)]
const RUN_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Run";

#[cfg(windows)]
impl LaunchAtLogin for RunKey {
    fn is_enabled(&self) -> Result<bool, AutostartError> {
        use winreg::enums::{HKEY_CURRENT_USER, KEY_READ};
        let key = winreg::RegKey::predef(HKEY_CURRENT_USER).open_subkey_with_flags(RUN_KEY, KEY_READ)?;
        match key.get_value::<String, _>(RUN_VALUE_NAME) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn enable(&self, program: &Path, args: &[String]) -> Result<(), AutostartError> {
        use winreg::enums::{HKEY_CURRENT_USER, KEY_SET_VALUE};
        let key =
            winreg::RegKey::predef(HKEY_CURRENT_USER).open_subkey_with_flags(RUN_KEY, KEY_SET_VALUE)?;
        key.set_value(RUN_VALUE_NAME, &run_command_line(program, args))?;
        info!("Registered {} under HKCU Run", RUN_VALUE_NAME);
        Ok(())
    }

    fn disable(&self) -> Result<(), AutostartError> {
        use winreg::enums::{HKEY_CURRENT_USER, KEY_SET_VALUE};
        let key =
            winreg::RegKey::predef(HKEY_CURRENT_USER).open_subkey_with_flags(RUN_KEY, KEY_SET_VALUE)?;
        match key.delete_value(RUN_VALUE_NAME) {
            Ok(()) => {
                info!("Removed {} from HKCU Run", RUN_VALUE_NAME);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Vec<String> {
        vec![
            AUTOSTART_FLAG.to_string(),
            "--config-dir".to_string(),
            "/Users/a&b/cfg".to_string(),
        ]
    }

    #[test]
    fn test_plist_contents() {
        let plist = render_plist(Path::new("/Applications/echwk"), &args());
        assert!(plist.contains("<string>com.echworkers.client</string>"));
        assert!(plist.contains(
            "        <string>/Applications/echwk</string>\n        <string>--autostart</string>\n"
        ));
        assert!(plist.contains("<string>/Users/a&amp;b/cfg</string>"));
        assert!(plist.contains("<key>RunAtLoad</key>\n    <true/>"));
        assert!(plist.contains("<key>KeepAlive</key>\n    <false/>"));
    }

    #[test]
    fn test_launch_agent_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let agent = LaunchAgent::new(dir.path().join("LaunchAgents").join("com.echworkers.client.plist"));

        assert!(!agent.is_enabled().unwrap());
        agent.disable().unwrap();

        agent.enable(Path::new("/usr/local/bin/echwk"), &args()).unwrap();
        assert!(agent.is_enabled().unwrap());
        let written = fs::read_to_string(agent.path()).unwrap();
        assert_eq!(written, render_plist(Path::new("/usr/local/bin/echwk"), &args()));

        agent.disable().unwrap();
        assert!(!agent.is_enabled().unwrap());
    }

    #[test]
    fn test_run_command_line() {
        assert_eq!(
            run_command_line(Path::new(r"C:\Program Files\echwk.exe"), &[AUTOSTART_FLAG.to_string()]),
            r#""C:\Program Files\echwk.exe" "--autostart""#
        );
    }
}
