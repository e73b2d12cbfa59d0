use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::{env, fs, io};

use tokio::process::Command;
use tokio::time::timeout;

use crate::completion::{PendingBatch, PendingEntry};
use crate::config::EnhancerConfig;
use crate::ledger::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnhancementState {
    Idle,
    Staging,
    Running,
    Enhanced,
    Failed,
    Skipped,
}

impl EnhancementState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Enhanced | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancementReport {
    pub state: EnhancementState,
    /// Files copied into the input directory
    pub staged: usize,
    pub enhanced: usize,
    pub failed: usize,
    pub reason: Option<String>,
}

impl EnhancementReport {
    fn skipped() -> Self {
        Self {
            state: EnhancementState::Skipped,
            staged: 0,
            enhanced: 0,
            failed: 0,
            reason: None,
        }
    }
}

/// Runs the external upscaler once over every pending file.
///
/// Success or failure applies to the whole batch, there is no per file retry.
#[derive(Debug, Clone)]
pub struct Enhancer {
    conf: EnhancerConfig,
}

impl Enhancer {
    pub fn new(conf: EnhancerConfig) -> Self {
        Self { conf }
    }

    /// Command line flags passed to the executable
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            absolute(&self.conf.input_dir()).into(),
            "-o".into(),
            absolute(&self.conf.output_dir()).into(),
            "-n".into(),
            self.conf.noise_level.to_string().into(),
            "-s".into(),
            self.conf.scale.to_string().into(),
            "-t".into(),
            self.conf.tile_size.to_string().into(),
            "-m".into(),
            absolute(&self.conf.model_dir()).into(),
            "-g".into(),
            self.conf.gpu.clone().into(),
            "-j".into(),
            self.conf.threads.clone().into(),
            "-f".into(),
            self.conf.format.as_str().into(),
        ];
        if self.conf.verbose {
            args.push("-v".into());
        }
        args
    }

    /// Stages, runs and reconciles the batch, which is always left empty
    pub async fn enhance(&self, pending: &mut PendingBatch, ledger: &mut Ledger) -> EnhancementReport {
        let mut state = EnhancementState::Idle;
        let entries = pending.take();

        if entries.is_empty() {
            advance(&mut state, EnhancementState::Skipped);
            log::info!("No new images to enhance");
            return EnhancementReport::skipped();
        }

        log::info!("Found {} new images to enhance", entries.len());
        advance(&mut state, EnhancementState::Staging);

        if let Err(e) = self.prepare_staging() {
            let reason = format!("couldn't prepare staging directories: {e}");
            log::error!("{reason}");
            for entry in &entries {
                ledger.mark_enhanced(&entry.identifier, false);
            }
            advance(&mut state, EnhancementState::Failed);
            return EnhancementReport {
                state,
                staged: 0,
                enhanced: 0,
                failed: entries.len(),
                reason: Some(reason),
            };
        }

        let (staged, rejected) = self.stage(entries);
        for entry in &rejected {
            ledger.mark_enhanced(&entry.identifier, false);
        }

        if staged.is_empty() {
            advance(&mut state, EnhancementState::Failed);
            return EnhancementReport {
                state,
                staged: 0,
                enhanced: 0,
                failed: rejected.len(),
                reason: Some("no file could be staged".into()),
            };
        }

        advance(&mut state, EnhancementState::Running);
        let outcome = self.run(staged.len()).await;
        let success = outcome.is_ok();
        for entry in &staged {
            ledger.mark_enhanced(&entry.identifier, success);
        }

        match outcome {
            Ok(()) => {
                advance(&mut state, EnhancementState::Enhanced);
                log::info!("Successfully enhanced all {} new images", staged.len());
                EnhancementReport {
                    state,
                    staged: staged.len(),
                    enhanced: staged.len(),
                    failed: rejected.len(),
                    reason: None,
                }
            }
            Err(reason) => {
                advance(&mut state, EnhancementState::Failed);
                log::error!("Failed to enhance {} images: {reason}", staged.len());
                EnhancementReport {
                    state,
                    staged: staged.len(),
                    enhanced: 0,
                    failed: staged.len() + rejected.len(),
                    reason: Some(reason),
                }
            }
        }
    }

    /// Empties leftovers of an aborted run and makes sure both dirs exist
    fn prepare_staging(&self) -> io::Result<()> {
        for dir in [self.conf.input_dir(), self.conf.output_dir()] {
            if dir.is_dir() {
                log::info!("Cleaning staging folder {}", dir.display());
                for entry in fs::read_dir(&dir)? {
                    let path = entry?.path();
                    let removed = if path.is_dir() {
                        fs::remove_dir_all(&path)
                    } else {
                        fs::remove_file(&path)
                    };
                    if let Err(e) = removed {
                        log::error!("Failed to remove {}: {e}", path.display());
                    }
                }
            } else {
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    /// Copies files into the input dir, returns `(staged, rejected)`
    fn stage(&self, entries: Vec<PendingEntry>) -> (Vec<PendingEntry>, Vec<PendingEntry>) {
        let input_dir = self.conf.input_dir();
        let mut names = HashSet::new();
        let mut staged = Vec::with_capacity(entries.len());
        let mut rejected = vec![];

        for entry in entries {
            let name = match entry.path.file_name() {
                Some(name) => name.to_os_string(),
                None => {
                    log::error!(
                        "Cannot stage {} ({}): no file name",
                        entry.identifier,
                        entry.path.display()
                    );
                    rejected.push(entry);
                    continue;
                }
            };
            if !names.insert(name.clone()) {
                log::error!(
                    "Cannot stage {} ({}): file name already staged",
                    entry.identifier,
                    entry.path.display()
                );
                rejected.push(entry);
                continue;
            }

            match fs::copy(&entry.path, input_dir.join(&name)) {
                Ok(_) => {
                    log::debug!("Copied new image to enhancer input: {}", display(&name));
                    staged.push(entry);
                }
                Err(e) => {
                    log::error!(
                        "Failed to copy {} ({}) to {}: {e}",
                        entry.identifier,
                        entry.path.display(),
                        input_dir.display()
                    );
                    rejected.push(entry);
                }
            }
        }

        (staged, rejected)
    }

    /// Single blocking invocation, `Err` carries the failure reason
    async fn run(&self, count: usize) -> Result<(), String> {
        let program = resolve_program(&self.conf.executable);
        let mut cmd = Command::new(&program);
        cmd.args(self.args())
            .current_dir(absolute(&self.conf.install_dir()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::info!(
            "Enhancing {count} images in {} with {}",
            self.conf.input_dir().display(),
            program.display()
        );
        let child = cmd
            .spawn()
            .map_err(|e| format!("couldn't launch {}: {e}", program.display()))?;

        let limit = self.conf.timeout();
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("error while waiting for enhancer: {e}")),
            Err(_) => return Err(format!("enhancer timed out after {limit:?}")),
        };

        if !output.stdout.is_empty() {
            log::debug!("enhancer stdout: {}", String::from_utf8_lossy(&output.stdout));
        }
        if !output.stderr.is_empty() {
            log::debug!("enhancer stderr: {}", String::from_utf8_lossy(&output.stderr));
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(format!("enhancer exited with {}", output.status))
        }
    }
}

fn advance(state: &mut EnhancementState, next: EnhancementState) {
    debug_assert!(!state.is_terminal(), "{state:?} is terminal");
    log::debug!("Enhancement {state:?} -> {next:?}");
    *state = next;
}

/// The child runs from its install dir, paths handed to it must not be relative
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Bare names are looked up in `PATH`, anything else is made absolute
fn resolve_program(executable: &Path) -> PathBuf {
    if executable.components().count() > 1 {
        absolute(executable)
    } else {
        executable.to_path_buf()
    }
}

fn display(name: &OsStr) -> String {
    name.to_string_lossy().into_owned()
}
