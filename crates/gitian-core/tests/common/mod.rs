//! In-memory sandbox backend and fixtures shared by the pipeline tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use gitian_core::{
    BuildRequest, Mode, PipelineConfig, PipelineContext, SigningIdentity, Target, BUILD_SCRIPT,
    OUT_DIR,
};
use gitian_sandbox::{
    BackendError, ImageSpec, Mount, OutputLine, OutputSender, ResourceLimits, SandboxBackend,
    SandboxCommand, SandboxHandle,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How build sandboxes of one image label behave.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Exit code of the build script.
    pub exit_code: i32,
    /// Files the build leaves in the output directory.
    pub artifacts: BTreeMap<String, Vec<u8>>,
    /// Files listed in the output directory that cannot be copied out.
    pub ghosts: Vec<String>,
    /// The build script never returns.
    pub hang: bool,
    /// Running the build script fails at the backend level.
    pub fail_run: bool,
}

impl Behavior {
    pub fn producing(artifacts: &[(&str, &[u8])]) -> Self {
        Self {
            artifacts: artifacts
                .iter()
                .map(|(path, contents)| (path.to_string(), contents.to_vec()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn exiting(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn broken() -> Self {
        Self {
            fail_run: true,
            ..Default::default()
        }
    }
}

/// A command as the backend saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub label: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MockBackend {
    behaviors: Mutex<HashMap<String, Behavior>>,
    images: Mutex<HashSet<String>>,
    pub images_created: AtomicUsize,
    pub provisioned: AtomicUsize,
    pub destroyed: AtomicUsize,
    commands: Mutex<Vec<Recorded>>,
    files: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    sign_exit: Mutex<i32>,
    mounts: Mutex<Vec<Mount>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn behave(&self, target: Target, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(target.as_str().to_string(), behavior);
    }

    pub fn set_sign_exit(&self, code: i32) {
        *self.sign_exit.lock().unwrap() = code;
    }

    pub fn commands(&self) -> Vec<Recorded> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_for(&self, label: &str) -> Vec<Recorded> {
        self.commands()
            .into_iter()
            .filter(|c| c.label == label)
            .collect()
    }

    pub fn mounts(&self) -> Vec<Mount> {
        self.mounts.lock().unwrap().clone()
    }

    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn behavior(&self, label: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(label)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_image(&self, spec: &ImageSpec) -> gitian_sandbox::Result<()> {
        self.images_created.fetch_add(1, Ordering::SeqCst);
        self.images.lock().unwrap().insert(spec.tag());
        Ok(())
    }

    async fn image_exists(&self, spec: &ImageSpec) -> gitian_sandbox::Result<bool> {
        Ok(self.images.lock().unwrap().contains(&spec.tag()))
    }

    async fn create(
        &self,
        image: &ImageSpec,
        _limits: &ResourceLimits,
        mounts: &[Mount],
    ) -> gitian_sandbox::Result<SandboxHandle> {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        self.mounts.lock().unwrap().extend_from_slice(mounts);
        Ok(SandboxHandle::new(image.clone()))
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &SandboxCommand,
        _limits: &ResourceLimits,
        output: OutputSender,
    ) -> gitian_sandbox::Result<i32> {
        let label = handle.image.label.clone();
        self.commands.lock().unwrap().push(Recorded {
            label: label.clone(),
            argv: command.argv(),
            env: command.env.clone(),
        });

        match command.program.as_str() {
            "bash" if command.args.first().map(String::as_str) == Some(BUILD_SCRIPT) => {
                let behavior = self.behavior(&label);
                if behavior.fail_run {
                    return Err(BackendError::Command {
                        program: "mock".into(),
                        code: 125,
                        stderr: "sandbox vanished".into(),
                    });
                }
                let _ = output.send(OutputLine::stdout(format!("building {label}")));
                if behavior.hang {
                    std::future::pending::<()>().await;
                }
                if behavior.exit_code != 0 {
                    let _ = output.send(OutputLine::stderr("make: *** [all] Error 2"));
                }
                Ok(behavior.exit_code)
            }
            "find" => {
                let behavior = self.behavior(&label);
                for (path, contents) in &behavior.artifacts {
                    let _ = output.send(OutputLine::stdout(format!(
                        "{path}\t{}\t1577836800.0000000000\troot",
                        contents.len()
                    )));
                }
                for ghost in &behavior.ghosts {
                    let _ = output.send(OutputLine::stdout(format!(
                        "{ghost}\t1\t1577836800.0000000000\troot"
                    )));
                }
                Ok(0)
            }
            "gpg" if command.args.iter().any(|a| a == "--detach-sign") => {
                Ok(*self.sign_exit.lock().unwrap())
            }
            _ => Ok(0),
        }
    }

    async fn copy_out(&self, handle: &SandboxHandle, path: &str) -> gitian_sandbox::Result<Bytes> {
        if path.ends_with(".sig") {
            return Ok(Bytes::from_static(b"signature"));
        }
        if let Some(relative) = path.strip_prefix(OUT_DIR).map(|p| p.trim_start_matches('/')) {
            return self
                .behavior(&handle.image.label)
                .artifacts
                .get(relative)
                .map(|contents| Bytes::from(contents.clone()))
                .ok_or_else(|| BackendError::PathNotFound(path.to_string()));
        }
        self.files
            .lock()
            .unwrap()
            .get(&handle.name)
            .and_then(|files| files.get(path))
            .map(|contents| Bytes::from(contents.clone()))
            .ok_or_else(|| BackendError::PathNotFound(path.to_string()))
    }

    async fn copy_in(
        &self,
        handle: &SandboxHandle,
        path: &str,
        contents: &[u8],
    ) -> gitian_sandbox::Result<()> {
        self.files
            .lock()
            .unwrap()
            .entry(handle.name.clone())
            .or_default()
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn destroy(&self, _handle: &SandboxHandle) -> gitian_sandbox::Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub const VERSION: &str = "0.21.2";

/// A descriptor named after `target`, pinning `pins`.
pub fn descriptor(target: Target, pins: &[&str]) -> String {
    let pins: Vec<String> = pins.iter().map(|p| format!("- \"{p}\"")).collect();
    format!(
        r#"---
name: "litecoin-{target}-0.21"
distro: "ubuntu"
suites:
- "bionic"
architectures:
- "amd64"
packages:
{}
remotes:
- "url": "https://github.com/litecoin-project/litecoin.git"
  "dir": "litecoin"
files: []
script: |
  cd litecoin
  make -j"$JOBS"
"#,
        pins.join("\n")
    )
}

/// Write descriptors for every target into the work directory.
pub fn write_descriptors(workdir: &Path, descriptors: &[(Target, String)]) {
    let dir = workdir.join("gitian-descriptors");
    std::fs::create_dir_all(&dir).unwrap();
    for (target, contents) in descriptors {
        std::fs::write(dir.join(target.descriptor_file()), contents).unwrap();
    }
}

pub fn all_descriptors(workdir: &Path) {
    write_descriptors(
        workdir,
        &Target::ALL
            .iter()
            .map(|&t| (t, descriptor(t, &["curl", "faketime=0.9.7-2"])))
            .collect::<Vec<_>>(),
    );
}

pub fn config(workdir: &Path) -> PipelineConfig {
    PipelineConfig::builder()
        .workdir(workdir)
        .cancel_grace(Duration::from_secs(2))
        .destroy_timeout(Duration::from_millis(500))
        .provision_retry_backoff(Duration::from_millis(10))
        .git_commit(false)
        .build()
        .unwrap()
}

pub fn context(workdir: &Path, backend: &Arc<MockBackend>, signer: &str) -> PipelineContext {
    let backend: Arc<dyn SandboxBackend> = backend.clone();
    PipelineContext::new(config(workdir), backend, SigningIdentity::gpg(signer))
}

pub fn request(builder: &str, mode: Mode, targets: &[Target]) -> BuildRequest {
    BuildRequest::builder(builder, VERSION)
        .mode(mode)
        .targets(targets.iter().copied())
        .build()
        .unwrap()
}

/// Install a test subscriber once so failures come with logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("gitian=debug")
        .with_test_writer()
        .try_init();
}
