//! Running a descriptor's build inside a sandbox.

use crate::descriptor::Descriptor;
use crate::error::BuildError;
use crate::log::{LogRef, Step, StepLog};
use crate::manifest::{sha256_hex, ArtifactEntry, ArtifactMetadata, Fingerprint, OutputManifest};
use crate::provisioner::Sandbox;
use crate::request::Target;
use crate::store::{is_safe_relative, ArtifactStage, BuildResultStore};
use chrono::{DateTime, Utc};
use gitian_sandbox::{BackendError, OutputLine, OutputStream, SandboxCommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Build directory inside the sandbox; inputs and remotes land here.
pub const BUILD_DIR: &str = "/home/gitian/build";
/// Directory the descriptor script writes its artifacts to.
pub const OUT_DIR: &str = "/home/gitian/out";
/// Generated build script.
pub const BUILD_SCRIPT: &str = "/home/gitian/build-script.sh";

/// Outcome of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    /// The build script failed, or produced nothing.
    Failed,
    /// The script succeeded but some artifacts could not be collected.
    PartiallyFailed,
}

/// Everything known about one target's build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub version: String,
    pub target: Target,
    pub builder: String,
    /// Name of the descriptor that was built.
    pub descriptor: String,
    pub status: BuildStatus,
    /// Collected artifacts, ordered by path.
    pub artifacts: Vec<ArtifactEntry>,
    /// Set only for successful builds.
    pub fingerprint: Option<Fingerprint>,
    /// Exit code of the build script; `None` when it never ran.
    pub exit_code: Option<i32>,
    pub log: LogRef,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }

    pub fn manifest(&self) -> OutputManifest {
        OutputManifest::new(self.artifacts.clone())
    }
}

/// Runs descriptor builds and collects their artifacts.
#[derive(Clone)]
pub struct BuildRunner {
    store: Arc<BuildResultStore>,
    log: StepLog,
    inputs_dir: PathBuf,
    builder: String,
    source_url: Option<String>,
}

impl BuildRunner {
    pub fn new(
        store: Arc<BuildResultStore>,
        log: StepLog,
        inputs_dir: impl Into<PathBuf>,
        builder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            log,
            inputs_dir: inputs_dir.into(),
            builder: builder.into(),
            source_url: None,
        }
    }

    /// Clone the first remote from `url` instead of the descriptor's URL.
    pub fn with_source_url(mut self, url: Option<String>) -> Self {
        self.source_url = url;
        self
    }

    /// Build `descriptor` in `sandbox`.
    ///
    /// A failing script is a `Failed` result, not an error. Errors mean the
    /// sandbox or the store could not be driven at all.
    ///
    /// Artifacts only replace those of an earlier build of the same
    /// (version, target) when the new build succeeds; any other outcome
    /// invalidates what was stored before.
    pub async fn run(
        &self,
        descriptor: &Descriptor,
        sandbox: &Sandbox,
        threads: u32,
        memory_mb: u64,
    ) -> Result<BuildResult, BuildError> {
        let result = self.execute(descriptor, sandbox, threads, memory_mb).await?;
        if !result.is_success() {
            self.store.invalidate(&result.version, result.target).await?;
        }
        Ok(result)
    }

    async fn execute(
        &self,
        descriptor: &Descriptor,
        sandbox: &Sandbox,
        threads: u32,
        memory_mb: u64,
    ) -> Result<BuildResult, BuildError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let target = descriptor.target;
        let finish = |status, artifacts, exit_code, log| {
            self.result(descriptor, status, artifacts, exit_code, log, started_at, clock)
        };

        tracing::info!(
            os = %target,
            descriptor = %descriptor.name,
            commit = %descriptor.script_commit,
            sandbox_id = %sandbox.id(),
            threads,
            memory_mb,
            "Starting build"
        );

        let (tx, forwarder) = self.log.start(&descriptor.version, target, Step::Build).await;

        let script = render_build_script(descriptor, self.source_url.as_deref());
        sandbox.copy_in(BUILD_SCRIPT, script.as_bytes()).await?;

        for file in &descriptor.files {
            let host_path = self.inputs_dir.join(file);
            match tokio::fs::read(&host_path).await {
                Ok(contents) => sandbox.copy_in(&format!("{BUILD_DIR}/{file}"), &contents).await?,
                Err(e) => {
                    tracing::error!(os = %target, input = %host_path.display(), error = %e, "Build input missing");
                    let _ = tx.send(OutputLine::stderr(format!(
                        "missing input {}: {e}",
                        host_path.display()
                    )));
                    drop(tx);
                    let log = forwarder.finish().await;
                    return Ok(finish(BuildStatus::Failed, Vec::new(), None, log));
                }
            }
        }

        let exit_code = sandbox.run(&build_command(threads, memory_mb), tx).await?;
        let log = forwarder.finish().await;
        if exit_code != 0 {
            tracing::warn!(os = %target, exit_code, log = %log.path().display(), "Build script failed");
            return Ok(finish(BuildStatus::Failed, Vec::new(), Some(exit_code), log));
        }

        let listing = list_outputs(sandbox).await?;
        if listing.is_empty() {
            tracing::warn!(os = %target, "Build produced no artifacts");
            return Ok(finish(BuildStatus::Failed, Vec::new(), Some(exit_code), log));
        }

        let stage = self.store.stage_artifacts(&descriptor.version, target);
        let (artifacts, missing) = match collect_outputs(sandbox, target, listing, &stage).await {
            Ok(collected) => collected,
            Err(e) => {
                stage.discard().await;
                return Err(e);
            }
        };
        let status = if missing == 0 {
            BuildStatus::Success
        } else {
            BuildStatus::PartiallyFailed
        };
        if status == BuildStatus::Success {
            // the old result must not outlive the artifacts it describes
            if let Err(e) = self.store.remove_result(&descriptor.version, target).await {
                stage.discard().await;
                return Err(e.into());
            }
            stage.publish().await?;
        } else {
            stage.discard().await;
        }
        let result = finish(status, artifacts, Some(exit_code), log);
        tracing::info!(
            os = %target,
            status = ?result.status,
            artifacts = result.artifacts.len(),
            missing,
            fingerprint = result.fingerprint.as_ref().map(Fingerprint::short).unwrap_or("-"),
            elapsed_ms = result.elapsed_ms,
            "Build finished"
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn result(
        &self,
        descriptor: &Descriptor,
        status: BuildStatus,
        artifacts: Vec<ArtifactEntry>,
        exit_code: Option<i32>,
        log: LogRef,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> BuildResult {
        let manifest = OutputManifest::new(artifacts);
        let fingerprint = (status == BuildStatus::Success).then(|| manifest.fingerprint());
        BuildResult {
            version: descriptor.version.clone(),
            target: descriptor.target,
            builder: self.builder.clone(),
            descriptor: descriptor.name.clone(),
            status,
            artifacts: manifest.into_entries(),
            fingerprint,
            exit_code,
            log,
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
        }
    }
}

/// Command running the generated script with the build's resource hints.
pub fn build_command(threads: u32, memory_mb: u64) -> SandboxCommand {
    SandboxCommand::new("bash")
        .arg(BUILD_SCRIPT)
        .workdir(BUILD_DIR)
        .env("HOME", "/home/gitian")
        .env("MAKEOPTS", format!("-j{threads}"))
        .env("JOBS", threads.to_string())
        .env("GITIAN_MEMORY_MB", memory_mb.to_string())
        .env("OUTDIR", OUT_DIR)
        .env("TZ", "UTC")
        .env("LC_ALL", "C")
}

/// Single-quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Script installing pinned packages, checking out remotes, then running
/// the descriptor script.
pub fn render_build_script(descriptor: &Descriptor, source_url: Option<&str>) -> String {
    let mut script = String::from("#!/bin/bash\n");
    script.push_str(&format!(
        "# {} {} (descriptor sha256 {})\n",
        descriptor.name, descriptor.version, descriptor.digest
    ));
    script.push_str("set -e -o pipefail\numask 002\n");
    script.push_str(&format!("mkdir -p \"$OUTDIR\" {BUILD_DIR}\ncd {BUILD_DIR}\n"));

    if !descriptor.packages.is_empty() {
        let pins: Vec<String> = descriptor
            .packages
            .iter()
            .map(|p| shell_quote(&p.to_string()))
            .collect();
        script.push_str("export DEBIAN_FRONTEND=noninteractive\napt-get update -q\n");
        script.push_str(&format!(
            "apt-get install -q -y --no-install-recommends {}\n",
            pins.join(" ")
        ));
    }

    for (i, remote) in descriptor.remotes.iter().enumerate() {
        let url = match (i, source_url) {
            (0, Some(url)) => url,
            _ => remote.url.as_str(),
        };
        let dir = shell_quote(&remote.dir);
        script.push_str(&format!("rm -rf {dir}\n"));
        script.push_str(&format!("git clone -q {} {dir}\n", shell_quote(url)));
        let commit = shell_quote(&descriptor.script_commit);
        if descriptor.script_commit.starts_with("refs/") {
            // not fetched by a plain clone
            script.push_str(&format!("git -C {dir} fetch -q origin {commit}\n"));
            script.push_str(&format!("git -C {dir} checkout -q --detach FETCH_HEAD\n"));
        } else {
            script.push_str(&format!("git -C {dir} checkout -q --detach {commit}\n"));
        }
    }

    script.push_str(&descriptor.script);
    if !descriptor.script.ends_with('\n') {
        script.push('\n');
    }
    script
}

/// Copy every listed output into `stage`. Returns the collected entries and
/// how many listed files could not be collected.
async fn collect_outputs(
    sandbox: &Sandbox,
    target: Target,
    listing: Vec<Result<ListedFile, String>>,
    stage: &ArtifactStage,
) -> Result<(Vec<ArtifactEntry>, usize), BuildError> {
    let mut artifacts = Vec::with_capacity(listing.len());
    let mut missing = 0usize;
    for listed in listing {
        let file = match listed {
            Ok(file) if is_safe_relative(&file.path) => file,
            Ok(file) => {
                tracing::warn!(os = %target, path = %file.path, "Skipping unsafe artifact path");
                missing += 1;
                continue;
            }
            Err(line) => {
                tracing::warn!(os = %target, %line, "Unparsable output listing line");
                missing += 1;
                continue;
            }
        };

        let contents = match sandbox.copy_out(&format!("{OUT_DIR}/{}", file.path)).await {
            Ok(contents) => contents,
            Err(BackendError::PathNotFound(path)) => {
                tracing::warn!(os = %target, %path, "Artifact vanished before copy-out");
                missing += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if contents.len() as u64 != file.size {
            tracing::debug!(os = %target, path = %file.path, listed = file.size, copied = contents.len(), "Artifact size changed since listing");
        }
        stage.write(&file.path, &contents).await?;
        artifacts.push(ArtifactEntry {
            path: file.path,
            size: contents.len() as u64,
            sha256: sha256_hex(&contents),
            metadata: file.metadata,
        });
    }
    Ok((artifacts, missing))
}

#[derive(Debug, Clone, PartialEq)]
struct ListedFile {
    path: String,
    size: u64,
    metadata: ArtifactMetadata,
}

/// List regular files under [`OUT_DIR`] as `path TAB size TAB mtime TAB owner`.
async fn list_outputs(sandbox: &Sandbox) -> Result<Vec<Result<ListedFile, String>>, BuildError> {
    let command = SandboxCommand::new("find")
        .arg(OUT_DIR)
        .arg("-type")
        .arg("f")
        .arg("-printf")
        .arg(r"%P\t%s\t%T@\t%u\n");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let code = sandbox.run(&command, tx).await?;
    if code != 0 {
        return Err(BuildError::Listing(code));
    }

    let mut listing = Vec::new();
    while let Ok(line) = rx.try_recv() {
        if line.stream == OutputStream::Stdout && !line.line.is_empty() {
            listing.push(parse_listing_line(&line.line).ok_or(line.line));
        }
    }
    Ok(listing)
}

fn parse_listing_line(line: &str) -> Option<ListedFile> {
    let mut fields = line.splitn(4, '\t');
    let path = fields.next()?.to_string();
    let size = fields.next()?.parse().ok()?;
    let modified = fields.next().and_then(parse_epoch);
    let owner = fields.next().map(str::to_string).filter(|o| !o.is_empty());
    if path.is_empty() {
        return None;
    }
    Some(ListedFile {
        path,
        size,
        metadata: ArtifactMetadata { modified, owner },
    })
}

fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = raw.split_once('.').unwrap_or((raw, "0"));
    let secs: i64 = secs.parse().ok()?;
    let digits: String = frac.chars().take(9).collect();
    let nanos: u32 = format!("{digits:0<9}").parse().ok()?;
    DateTime::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SourceRef;

    fn descriptor() -> Descriptor {
        descriptor_at(&SourceRef::Tag.git_ref("0.21.2"))
    }

    fn descriptor_at(git_ref: &str) -> Descriptor {
        let contents = r#"
name: litecoin-win-0.21
distro: ubuntu
suites: [bionic]
architectures: [amd64]
packages: ["g++-mingw-w64", "nsis=3.03-2"]
remotes:
- url: https://github.com/litecoin-project/litecoin.git
  dir: litecoin
files: ["osslsigncode-2.0.tar.gz"]
script: |
  cd litecoin
  make -j"$JOBS"
"#;
        Descriptor::parse(
            "gitian-win.yml",
            "0.21.2",
            Target::Windows,
            git_ref,
            contents,
        )
        .unwrap()
    }

    #[test]
    fn test_build_command_carries_resource_hints() {
        let cmd = build_command(4, 4000);
        assert_eq!(cmd.argv(), vec!["bash", BUILD_SCRIPT]);
        assert_eq!(cmd.env["MAKEOPTS"], "-j4");
        assert_eq!(cmd.env["JOBS"], "4");
        assert_eq!(cmd.env["GITIAN_MEMORY_MB"], "4000");
        assert_eq!(cmd.env["TZ"], "UTC");
        assert_eq!(cmd.workdir.as_deref(), Some(BUILD_DIR));
    }

    #[test]
    fn test_script_pins_and_checks_out() {
        let script = render_build_script(&descriptor(), None);
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("apt-get install -q -y --no-install-recommends 'g++-mingw-w64' 'nsis=3.03-2'"));
        assert!(script.contains("git clone -q 'https://github.com/litecoin-project/litecoin.git' 'litecoin'"));
        assert!(script.contains("git -C 'litecoin' checkout -q --detach 'v0.21.2'"));
        assert!(script.ends_with("make -j\"$JOBS\"\n"));
    }

    #[test]
    fn test_script_fetches_pull_merge_ref() {
        let script = render_build_script(&descriptor_at(&SourceRef::Pull.git_ref("pull-742")), None);
        assert!(script.contains("git -C 'litecoin' fetch -q origin 'refs/pull/742/merge'"));
        assert!(script.contains("git -C 'litecoin' checkout -q --detach FETCH_HEAD"));
    }

    #[test]
    fn test_script_url_override() {
        let script = render_build_script(&descriptor(), Some("https://example.org/fork.git"));
        assert!(script.contains("git clone -q 'https://example.org/fork.git' 'litecoin'"));
        assert!(!script.contains("litecoin-project/litecoin.git"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_parse_listing_line() {
        let file = parse_listing_line("src/litecoin-0.21.2.tar.gz\t1024\t1577836800.5000000000\troot")
            .unwrap();
        assert_eq!(file.path, "src/litecoin-0.21.2.tar.gz");
        assert_eq!(file.size, 1024);
        assert_eq!(file.metadata.owner.as_deref(), Some("root"));
        assert_eq!(
            file.metadata.modified,
            DateTime::from_timestamp(1_577_836_800, 500_000_000)
        );

        assert!(parse_listing_line("no-size").is_none());
        assert!(parse_listing_line("a\tbig\t0\troot").is_none());
        assert!(parse_listing_line("a.zip\t3").is_some());
    }
}
