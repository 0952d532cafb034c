//! Launch a child process that joins this server's network.
//!
//! The child gets its name, its listen port and the parent's address on the command line:
//! `<name> --process-port <port> --master-port <parent port> --master-name <parent> --domain <domain>`.
//! `wimp-node` understands these arguments.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::info;

/// What a launched child needs to find its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildLaunch {
    /// Name the child registers under.
    pub name: String,
    /// Port the child listens on.
    pub port: u16,
    pub parent_name: String,
    pub parent_domain: String,
    pub parent_port: u16,
    /// Passed through after the entry arguments.
    pub extra_args: Vec<OsString>,
}

impl ChildLaunch {
    /// Entry arguments, in launch order.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            self.name.clone().into(),
            "--process-port".into(),
            self.port.to_string().into(),
            "--master-port".into(),
            self.parent_port.to_string().into(),
            "--master-name".into(),
            self.parent_name.clone().into(),
            "--domain".into(),
            self.parent_domain.clone().into(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Path of an executable next to the running one (`.exe` appended on Windows).
pub fn sibling_executable(name: &str) -> io::Result<PathBuf> {
    let current = std::env::current_exe()?;
    let dir = current
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "executable has no directory"))?;
    let path = dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX));
    if !path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} was not found", path.display()),
        ));
    }
    Ok(path)
}

/// Spawn `program` with the entry arguments of `launch`. The child is killed if the handle is dropped.
pub fn spawn_executable_process(program: &Path, launch: &ChildLaunch) -> io::Result<Child> {
    info!(
        "launching {} as {} (parent {} on port {})",
        program.display(),
        launch.name,
        launch.parent_name,
        launch.parent_port
    );
    Command::new(program)
        .args(launch.args())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch() -> ChildLaunch {
        ChildLaunch {
            name: "client".into(),
            port: 8001,
            parent_name: "master".into(),
            parent_domain: "127.0.0.1".into(),
            parent_port: 8000,
            extra_args: vec!["--debug".into()],
        }
    }

    #[test]
    fn entry_arguments() {
        let args: Vec<String> = launch()
            .args()
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            [
                "client",
                "--process-port",
                "8001",
                "--master-port",
                "8000",
                "--master-name",
                "master",
                "--domain",
                "127.0.0.1",
                "--debug"
            ]
        );
    }

    #[test]
    fn missing_sibling_is_not_found() {
        let err = sibling_executable("no-such-wimp-program").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = spawn_executable_process(Path::new("/nonexistent/wimp-node"), &launch())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
