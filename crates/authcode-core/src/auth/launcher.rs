use std::io;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use tracing::debug;
use url::Url;

use super::AuthError;

/// Capability to show the authorization page to the user.
pub trait BrowserLauncher {
    fn open_url(&self, url: &Url) -> Result<(), AuthError>;
}

impl<F> BrowserLauncher for F
where
    F: Fn(&Url) -> Result<(), AuthError>,
{
    fn open_url(&self, url: &Url) -> Result<(), AuthError> {
        self(url)
    }
}

/// Opens URLs with the platform's default handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open_url(&self, url: &Url) -> Result<(), AuthError> {
        debug!("opening authorization URL with system browser");
        open::that(url.as_str()).map_err(|err| AuthError::BrowserLaunch(err.to_string()))
    }
}

/// Spawns a configured program (e.g. `xdg-open`, `firefox`) with the URL as its only argument.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
}

impl CommandLauncher {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Spawn the program and reap it on a background thread once it exits.
    fn spawn(&self, url: &Url) -> Result<JoinHandle<io::Result<ExitStatus>>, AuthError> {
        let mut child = Command::new(&self.program)
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| AuthError::BrowserLaunch(format!("{}: {err}", self.program)))?;

        let program = self.program.clone();
        let reaper = thread::Builder::new()
            .name("browser-launcher".into())
            .spawn(move || {
                let status = child.wait();
                match &status {
                    Ok(status) => debug!(%program, %status, "browser command exited"),
                    Err(err) => debug!(%program, error = %err, "failed to wait for browser command"),
                }
                status
            })?;
        Ok(reaper)
    }
}

impl BrowserLauncher for CommandLauncher {
    fn open_url(&self, url: &Url) -> Result<(), AuthError> {
        debug!(program = %self.program, "opening authorization URL");
        self.spawn(url).map(drop)
    }
}

/// Launcher selected from configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredLauncher {
    System(SystemBrowser),
    Command(CommandLauncher),
}

impl ConfiguredLauncher {
    /// Use `open_command` when set, otherwise the system browser.
    pub fn from_command(open_command: Option<&str>) -> Self {
        match open_command.map(str::trim) {
            Some(program) if !program.is_empty() => Self::Command(CommandLauncher::new(program)),
            _ => Self::System(SystemBrowser),
        }
    }
}

impl BrowserLauncher for ConfiguredLauncher {
    fn open_url(&self, url: &Url) -> Result<(), AuthError> {
        match self {
            Self::System(launcher) => launcher.open_url(url),
            Self::Command(launcher) => launcher.open_url(url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn closures_are_launchers() {
        let seen = Arc::new(Mutex::new(None));
        let launcher = {
            let seen = seen.clone();
            move |url: &Url| -> Result<(), AuthError> {
                *seen.lock().unwrap() = Some(url.to_string());
                Ok(())
            }
        };
        let url = Url::parse("https://example.com/authorize?x=1").unwrap();
        launcher.open_url(&url).unwrap();
        assert_eq!(
            seen.lock().unwrap().as_deref(),
            Some("https://example.com/authorize?x=1")
        );
    }

    #[test]
    fn missing_program_is_launch_error() {
        let launcher = CommandLauncher::new("definitely-not-a-real-browser-binary");
        let url = Url::parse("https://example.com").unwrap();
        let err = launcher.open_url(&url).unwrap_err();
        assert!(matches!(err, AuthError::BrowserLaunch(reason) if reason.contains("definitely-not")));
    }

    #[cfg(unix)]
    #[test]
    fn launched_program_is_reaped() {
        let launcher = CommandLauncher::new("true");
        let url = Url::parse("https://example.com").unwrap();
        let status = launcher
            .spawn(&url)
            .unwrap()
            .join()
            .expect("reaper thread finished")
            .expect("child waited on");
        assert!(status.success());
        launcher.open_url(&url).unwrap();
    }

    #[test]
    fn configured_launcher_prefers_command() {
        match ConfiguredLauncher::from_command(Some(" firefox ")) {
            ConfiguredLauncher::Command(launcher) => assert_eq!(launcher.program(), "firefox"),
            other => panic!("unexpected launcher: {other:?}"),
        }
        assert!(matches!(
            ConfiguredLauncher::from_command(Some("")),
            ConfiguredLauncher::System(_)
        ));
        assert!(matches!(
            ConfiguredLauncher::from_command(None),
            ConfiguredLauncher::System(_)
        ));
    }
}
