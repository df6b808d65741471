//! Docker CLI image source
//!
//! Drives the local `docker` binary. `save` streams the child's stdout
//! directly; the child's exit status is checked in [`ImageStream::finish`]
//! so a daemon error mid-export surfaces as a truncated stream. A stream
//! dropped before `finish` kills and reaps the child.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use tracing::{debug, warn};

use super::{ExportError, ImageRef, ImageSource, ImageStream};

/// Image source backed by the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use a different compatible binary (e.g. `podman`).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output, ExportError> {
        debug!(binary = %self.binary, ?args, "running container runtime");
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ExportError::Runtime(format!("failed to run {}: {}", self.binary, e)))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageSource for DockerCli {
    fn exists(&self, image: &ImageRef) -> Result<bool, ExportError> {
        let reference = image.to_string();
        let output = self.run(&["image", "inspect", "--format", "{{.Id}}", reference.as_str()])?;
        Ok(output.status.success())
    }

    fn digest(&self, image: &ImageRef) -> Result<Option<String>, ExportError> {
        let reference = image.to_string();
        let output = self.run(&["image", "inspect", "--format", "{{.Id}}", reference.as_str()])?;
        if !output.status.success() {
            return Err(ExportError::ImageNotFound(image.clone()));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if id.is_empty() { None } else { Some(id) })
    }

    fn pull(&self, image: &ImageRef) -> Result<(), ExportError> {
        let reference = image.to_string();
        let output = self.run(&["pull", reference.as_str()])?;
        if !output.status.success() {
            return Err(ExportError::Runtime(format!(
                "pull {} failed: {}",
                image,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn save(&self, image: &ImageRef) -> Result<Box<dyn ImageStream>, ExportError> {
        debug!(binary = %self.binary, image = %image, "starting image save");
        let reference = image.to_string();
        let mut child = self
            .command()
            .args(["save", reference.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExportError::Runtime(format!("failed to spawn {}: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExportError::Runtime("save produced no stdout".to_string()))?;

        Ok(Box::new(DockerSaveStream {
            image: image.clone(),
            child,
            stdout,
        }))
    }

    fn load(&self, archive: &Path) -> Result<Vec<String>, ExportError> {
        let archive_arg = archive.to_string_lossy().to_string();
        let output = self.run(&["load", "--input", archive_arg.as_str()])?;
        if !output.status.success() {
            return Err(ExportError::Runtime(format!(
                "load {} failed: {}",
                archive.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_load_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Extract references from `docker load` output lines
/// (`Loaded image: alpine:3.20` or `Loaded image ID: sha256:...`).
fn parse_load_output(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            line.strip_prefix("Loaded image: ")
                .or_else(|| line.strip_prefix("Loaded image ID: "))
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

struct DockerSaveStream {
    image: ImageRef,
    child: Child,
    stdout: ChildStdout,
}

impl Read for DockerSaveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl ImageStream for DockerSaveStream {
    fn finish(mut self: Box<Self>) -> Result<(), ExportError> {
        let mut stderr = String::new();
        if let Some(mut err) = self.child.stderr.take() {
            let _ = err.read_to_string(&mut stderr);
        }
        let status = self.child.wait()?;
        if status.success() {
            return Ok(());
        }
        if stderr.contains("No such image") || stderr.contains("reference does not exist") {
            return Err(ExportError::ImageNotFound(self.image.clone()));
        }
        Err(ExportError::Truncated {
            reference: self.image.clone(),
            reason: format!("save exited with {}: {}", status, stderr.trim()),
        })
    }
}

impl Drop for DockerSaveStream {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!(image = %self.image, pid = self.child.id(), "stopping abandoned image save");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_load_output() {
        let out = "Loaded image: alpine:3.20\nsome progress line\nLoaded image ID: sha256:abc\n";
        assert_eq!(parse_load_output(out), vec!["alpine:3.20", "sha256:abc"]);
        assert!(parse_load_output("").is_empty());
    }

    #[test]
    fn test_missing_binary_is_runtime_error() {
        let cli = DockerCli::with_binary("fairops-no-such-container-runtime");
        let err = cli.exists(&ImageRef::new("alpine", "3.20")).unwrap_err();
        assert!(matches!(err, ExportError::Runtime(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dropped_save_stream_reaps_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id();
        let stdout = child.stdout.take().unwrap();
        let stream = DockerSaveStream {
            image: ImageRef::new("alpine", "3.20"),
            child,
            stdout,
        };
        assert!(Path::new(&format!("/proc/{}", pid)).exists());

        drop(stream);
        assert!(!Path::new(&format!("/proc/{}", pid)).exists());
    }
}
