//! Typed construction of external tool invocations.
//!
//! Adapters describe a run with named flags and paths; the flag syntax of each tool
//! (`-NAME value` for the astromatic suite, `--name value` for astrometry.net) stays here.

use std::ffi::{OsStr, OsString};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use itertools::Itertools;
use log::debug;

use crate::error::{Error, Result};

/// A single run of an external program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    tool: String,
    program: String,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
}

impl Invocation {
    /// `tool` names the program in diagnostics, `program` is the executable to run.
    pub fn new(tool: &str, program: &str) -> Self {
        Self {
            tool: tool.to_string(),
            program: program.to_string(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Astromatic style option: `-NAME value`.
    pub fn option(self, name: &str, value: impl Display) -> Self {
        self.arg(format!("-{name}")).arg(value.to_string())
    }

    /// Astromatic style option with a path value.
    pub fn path_option(self, name: &str, value: &Path) -> Self {
        self.arg(format!("-{name}")).arg(value)
    }

    /// GNU style option: `--name value`.
    pub fn long(self, name: &str, value: impl Display) -> Self {
        self.arg(format!("--{name}")).arg(value.to_string())
    }

    /// GNU style switch without a value.
    pub fn switch(self, name: &str) -> Self {
        self.arg(format!("--{name}"))
    }

    /// Run the program inside `dir`. Tools writing fixed file names need this.
    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .join(" ")
    }

    /// Run to completion. `subject` is the file the run concerns, used in errors.
    pub fn run(&self, subject: &Path) -> Result<()> {
        debug!("Running `{}`.", self.command_line());
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .map_err(|e| Error::tool(&self.tool, subject, format!("could not start `{}`: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(Error::tool(
                &self.tool,
                subject,
                format!("exited with {}: {}", output.status, last.trim()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_construction() {
        let run = Invocation::new("SExtractor", "sex")
            .arg("image.fits")
            .option("DETECT_THRESH", 4.0)
            .path_option("CATALOG_NAME", Path::new("out/image_SourcesDet.cat"));
        assert_eq!(
            run.command_line(),
            "sex image.fits -DETECT_THRESH 4 -CATALOG_NAME out/image_SourcesDet.cat"
        );

        let run = Invocation::new("astrometry.net", "solve-field")
            .long("scale-low", 0.5)
            .switch("overwrite");
        assert_eq!(run.command_line(), "solve-field --scale-low 0.5 --overwrite");
    }

    #[test]
    fn missing_program_is_tool_failure() {
        let err = Invocation::new("SCAMP", "definitely-not-an-installed-program-4711")
            .run(Path::new("a.fits"))
            .unwrap_err();
        assert!(matches!(err, Error::ExternalToolFailure { ref tool, .. } if tool == "SCAMP"));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_tool_failure() {
        let err = Invocation::new("false", "false").run(Path::new("a.fits")).unwrap_err();
        assert!(err.to_string().starts_with("false failed on a.fits: exited with"));
        assert!(Invocation::new("true", "true").run(Path::new("a.fits")).is_ok());
    }
}
