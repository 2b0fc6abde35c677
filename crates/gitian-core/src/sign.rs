//! Signing build results inside a toolchain sandbox.

use crate::build::{BuildResult, BuildStatus};
use crate::error::SigningError;
use crate::log::{Step, StepLog};
use crate::manifest::Fingerprint;
use crate::provisioner::Sandbox;
use crate::request::Target;
use chrono::{DateTime, Utc};
use gitian_sandbox::{Mount, OutputSender, SandboxCommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Directory holding assert documents inside the sandbox.
pub const SIGN_DIR: &str = "/home/gitian/sign";
/// Where the host keyring is mounted, read-only.
pub const GNUPG_MOUNT: &str = "/home/gitian/.gnupg-host";
const GNUPG_HOME: &str = "/home/gitian/.gnupg";

/// How assert documents get signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignProgram {
    /// `gpg --detach-sign` with the signer's key.
    #[default]
    Gpg,
    /// Produce the assert document only, to be signed elsewhere later.
    Detached,
}

/// Key the signer signs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    /// GPG user id or key id, also the builder name in the results repository.
    pub signer: String,
    pub program: SignProgram,
    /// Host keyring to expose to the sandbox.
    pub gnupg_home: Option<PathBuf>,
}

impl SigningIdentity {
    pub fn gpg(signer: impl Into<String>) -> Self {
        Self {
            signer: signer.into(),
            program: SignProgram::Gpg,
            gnupg_home: None,
        }
    }

    pub fn detached(signer: impl Into<String>) -> Self {
        Self {
            signer: signer.into(),
            program: SignProgram::Detached,
            gnupg_home: None,
        }
    }

    pub fn with_gnupg_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.gnupg_home = Some(home.into());
        self
    }

    /// Mounts a signing sandbox needs for this identity.
    pub fn mounts(&self) -> Vec<Mount> {
        match (&self.gnupg_home, self.program) {
            (Some(home), SignProgram::Gpg) => vec![Mount::read_only(home, GNUPG_MOUNT)],
            _ => Vec::new(),
        }
    }
}

/// A builder's signed statement about one target's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureAssertion {
    pub version: String,
    pub target: Target,
    pub builder: String,
    pub fingerprint: Fingerprint,
    /// Release name, `<version>-<suffix>`.
    pub release: String,
    /// File name of the assert document, e.g. `litecoin-linux-0.21-build.assert`.
    pub assert_name: String,
    pub assert_document: String,
    /// Detached signature over the assert document; empty when detached.
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    /// Signing was deferred.
    pub detached: bool,
    pub signed_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct AssertDocument<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    release: &'a str,
    builder: &'a str,
    fingerprint: &'a str,
    out_manifest: String,
}

/// Release name of `version` for `target` in the results repository.
pub fn release_name(version: &str, target: Target) -> String {
    format!("{version}-{}", target.release_suffix())
}

/// Render the YAML assert document `signer` signs over `result`.
///
/// The signer need not be the builder who produced `result`.
pub fn render_assert(
    result: &BuildResult,
    fingerprint: &Fingerprint,
    signer: &str,
) -> Result<String, SigningError> {
    let release = release_name(&result.version, result.target);
    let doc = AssertDocument {
        name: &result.descriptor,
        kind: "build",
        release: &release,
        builder: signer,
        fingerprint: fingerprint.as_str(),
        out_manifest: result.manifest().sums(),
    };
    Ok(serde_yaml::to_string(&doc)?)
}

/// Produces [`SignatureAssertion`]s for successful builds.
#[derive(Clone)]
pub struct SignRunner {
    log: StepLog,
}

impl SignRunner {
    pub fn new(log: StepLog) -> Self {
        Self { log }
    }

    /// Sign `result` in `sandbox` as `identity`.
    ///
    /// Callers must only pass successful builds; anything else is rejected
    /// with [`SigningError::UnsignableBuild`].
    pub async fn run(
        &self,
        result: &BuildResult,
        sandbox: &Sandbox,
        identity: &SigningIdentity,
    ) -> Result<SignatureAssertion, SigningError> {
        let fingerprint = match (&result.status, &result.fingerprint) {
            (BuildStatus::Success, Some(fingerprint)) => fingerprint.clone(),
            (status, _) => return Err(SigningError::UnsignableBuild(*status)),
        };
        let target = result.target;
        let assert_name = format!("{}-build.assert", result.descriptor);
        let assert_path = format!("{SIGN_DIR}/{assert_name}");
        let document = render_assert(result, &fingerprint, &identity.signer)?;

        tracing::info!(
            os = %target,
            signer = %identity.signer,
            program = ?identity.program,
            fingerprint = fingerprint.short(),
            sandbox_id = %sandbox.id(),
            "Signing build"
        );
        sandbox.copy_in(&assert_path, document.as_bytes()).await?;

        let (tx, forwarder) = self.log.start(&result.version, target, Step::Sign).await;
        let signature = match identity.program {
            SignProgram::Detached => {
                step(sandbox, &tx, &SandboxCommand::new("true")).await?;
                Vec::new()
            }
            SignProgram::Gpg => {
                if identity.gnupg_home.is_some() {
                    let import = SandboxCommand::shell(format!(
                        "rm -rf {GNUPG_HOME} && cp -a {GNUPG_MOUNT} {GNUPG_HOME} && chmod 700 {GNUPG_HOME}"
                    ));
                    if step(sandbox, &tx, &import).await? != 0 {
                        return Err(SigningError::IdentityUnavailable(identity.signer.clone()));
                    }
                }

                let list = gpg()
                    .arg("--list-secret-keys")
                    .arg(identity.signer.as_str());
                if step(sandbox, &tx, &list).await? != 0 {
                    tracing::error!(os = %target, signer = %identity.signer, "No secret key for signer");
                    return Err(SigningError::IdentityUnavailable(identity.signer.clone()));
                }

                let sign = gpg()
                    .arg("--yes")
                    .arg("--local-user")
                    .arg(identity.signer.as_str())
                    .arg("--detach-sign")
                    .arg(assert_path.as_str());
                let exit_code = step(sandbox, &tx, &sign).await?;
                if exit_code != 0 {
                    return Err(SigningError::Failed { exit_code });
                }
                sandbox.copy_out(&format!("{assert_path}.sig")).await?.to_vec()
            }
        };
        drop(tx);
        forwarder.finish().await;

        Ok(SignatureAssertion {
            version: result.version.clone(),
            target,
            builder: identity.signer.clone(),
            fingerprint,
            release: release_name(&result.version, target),
            assert_name,
            assert_document: document,
            signature,
            detached: identity.program == SignProgram::Detached,
            signed_at: Utc::now(),
        })
    }
}

async fn step(
    sandbox: &Sandbox,
    output: &OutputSender,
    command: &SandboxCommand,
) -> Result<i32, SigningError> {
    Ok(sandbox.run(command, output.clone()).await?)
}

fn gpg() -> SandboxCommand {
    SandboxCommand::new("gpg")
        .arg("--batch")
        .env("GNUPGHOME", GNUPG_HOME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogRef;
    use crate::manifest::{sha256_hex, ArtifactEntry, ArtifactMetadata};

    fn result() -> BuildResult {
        let artifacts = vec![ArtifactEntry {
            path: "litecoin-0.21.2-x86_64-linux-gnu.tar.gz".into(),
            size: 3,
            sha256: sha256_hex(b"abc"),
            metadata: ArtifactMetadata::default(),
        }];
        let fingerprint = crate::manifest::OutputManifest::new(artifacts.clone()).fingerprint();
        BuildResult {
            version: "0.21.2".into(),
            target: Target::Linux,
            builder: "alice".into(),
            descriptor: "litecoin-linux-0.21".into(),
            status: BuildStatus::Success,
            artifacts,
            fingerprint: Some(fingerprint),
            exit_code: Some(0),
            log: LogRef::from(PathBuf::from("/tmp/linux-build.log")),
            started_at: Utc::now(),
            elapsed_ms: 1,
        }
    }

    #[test]
    fn test_release_names() {
        assert_eq!(release_name("0.21.2", Target::Linux), "0.21.2-linux");
        assert_eq!(release_name("0.21.2", Target::Windows), "0.21.2-win-unsigned");
        assert_eq!(release_name("0.21.2", Target::MacOs), "0.21.2-osx-unsigned");
    }

    #[test]
    fn test_assert_document() {
        let result = result();
        let fingerprint = result.fingerprint.clone().unwrap();
        let doc = render_assert(&result, &fingerprint, "alice").unwrap();

        let parsed: serde_yaml::Value = serde_yaml::from_str(&doc).unwrap();
        assert_eq!(parsed["name"].as_str(), Some("litecoin-linux-0.21"));
        assert_eq!(parsed["type"].as_str(), Some("build"));
        assert_eq!(parsed["release"].as_str(), Some("0.21.2-linux"));
        assert_eq!(parsed["fingerprint"].as_str(), Some(fingerprint.as_str()));
        assert_eq!(
            parsed["out_manifest"].as_str(),
            Some(format!("{}  litecoin-0.21.2-x86_64-linux-gnu.tar.gz\n", sha256_hex(b"abc")).as_str())
        );
    }

    #[test]
    fn test_assert_document_names_signer() {
        let result = result();
        let fingerprint = result.fingerprint.clone().unwrap();
        let doc = render_assert(&result, &fingerprint, "bob").unwrap();

        let parsed: serde_yaml::Value = serde_yaml::from_str(&doc).unwrap();
        assert_eq!(parsed["builder"].as_str(), Some("bob"));
    }

    #[test]
    fn test_gnupg_mount_only_for_gpg() {
        let gpg = SigningIdentity::gpg("alice").with_gnupg_home("/home/alice/.gnupg");
        assert_eq!(gpg.mounts().len(), 1);
        assert_eq!(gpg.mounts()[0].target, GNUPG_MOUNT);
        assert!(gpg.mounts()[0].read_only);

        let detached = SigningIdentity::detached("alice").with_gnupg_home("/home/alice/.gnupg");
        assert!(detached.mounts().is_empty());
    }

    #[test]
    fn test_assertion_signature_is_hex_in_json() {
        let result = result();
        let assertion = SignatureAssertion {
            version: result.version.clone(),
            target: result.target,
            builder: "alice".into(),
            fingerprint: result.fingerprint.clone().unwrap(),
            release: "0.21.2-linux".into(),
            assert_name: "litecoin-linux-0.21-build.assert".into(),
            assert_document: String::new(),
            signature: vec![0xde, 0xad],
            detached: false,
            signed_at: Utc::now(),
        };
        let json = serde_json::to_value(&assertion).unwrap();
        assert_eq!(json["signature"], "dead");
    }
}
