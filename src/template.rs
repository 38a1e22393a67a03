//! Deterministic build of the sandbox template image.
//!
//! The image tag is a hash over the resolved profile set and the agentbox
//! version, so identical inputs always reuse a previously built image and
//! any change to either invalidates the cache.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cmd::Cmd;
use crate::profiles::{get_profile, resolve_profiles};

/// Base template image the generated Dockerfile starts from.
pub const BASE_TEMPLATE_IMAGE: &str = "docker/sandbox-templates:claude-code";

/// Published image carrying the agentbox binary for release builds.
const AGENTBOX_BINARY_IMAGE: &str = "ghcr.io/agentbox/agentbox";

/// Env var that switches the builder into dev mode (local binary, `dev` tag).
pub const DEV_MODE_ENV: &str = "AGENTBOX_DEV";

/// Target architecture facts, queried from the external tool's own runtime
/// info rather than assumed from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetArch {
    /// Docker platform string (linux/amd64, linux/arm64)
    pub docker_platform: &'static str,
    /// Architecture suffix for Go downloads
    pub go_arch: &'static str,
    /// Architecture suffix for yq downloads
    pub yq_arch: &'static str,
    /// Architecture suffix for protoc downloads
    pub protoc_arch: &'static str,
}

const ARCH_AMD64: TargetArch = TargetArch {
    docker_platform: "linux/amd64",
    go_arch: "amd64",
    yq_arch: "amd64",
    protoc_arch: "x86_64",
};

const ARCH_ARM64: TargetArch = TargetArch {
    docker_platform: "linux/arm64",
    go_arch: "arm64",
    yq_arch: "arm64",
    protoc_arch: "aarch_64",
};

/// Detect the architecture Docker will run containers on.
pub fn detect_target_arch() -> Result<TargetArch> {
    let output = Cmd::new("docker")
        .args(&["info", "--format", "{{.Architecture}}"])
        .run_and_capture_stdout();

    let arch = match output {
        Ok(arch) => arch,
        Err(e) => {
            warn!(error = %e, "template:failed to detect Docker architecture, defaulting to amd64");
            return Ok(ARCH_AMD64);
        }
    };

    debug!(arch = %arch, "template:detected Docker architecture");
    match arch.as_str() {
        "aarch64" | "arm64" => Ok(ARCH_ARM64),
        "x86_64" | "amd64" => Ok(ARCH_AMD64),
        other => bail!("unsupported Docker architecture: {}", other),
    }
}

/// Builds the custom template image for a resolved profile set.
pub struct TemplateBuilder {
    profiles: Vec<String>,
}

impl TemplateBuilder {
    pub fn new(profiles: &[String]) -> Self {
        Self {
            profiles: profiles.to_vec(),
        }
    }

    /// The agentbox version folded into the template hash. Dev mode pins it
    /// to "dev" so locally built binaries share one tag.
    fn version(&self) -> String {
        if is_dev_mode() {
            "dev".to_string()
        } else {
            env!("CARGO_PKG_VERSION").to_string()
        }
    }

    /// Stable hash over the sorted resolved profile names plus the agentbox
    /// version, truncated to 12 hex chars.
    pub fn template_hash(&self) -> String {
        let mut resolved = resolve_profiles(&self.profiles);
        resolved.sort_unstable();

        let combined = format!("{};{}", resolved.join(","), self.version());
        let digest = Sha256::digest(combined.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        hex[..12].to_string()
    }

    /// The image reference for this template configuration.
    pub fn image_name(&self) -> String {
        format!("agentbox-template:{}", self.template_hash())
    }

    fn image_exists(&self) -> bool {
        let image = self.image_name();
        Cmd::new("docker")
            .args(&["image", "inspect", &image])
            .run_as_check()
            .unwrap_or(false)
    }

    /// Generate the Dockerfile: base layer, architecture build args, the
    /// agentbox binary, one block per resolved profile in order, then the
    /// wrapper that intercepts the agent binary and redirects it to
    /// `agentbox entrypoint`.
    pub fn generate_dockerfile(&self, arch: Option<&TargetArch>) -> Result<String> {
        let mut out = String::new();

        out.push_str("# Auto-generated by agentbox\n");

        if is_dev_mode() {
            out.push_str("# Dev mode: using local agentbox binary\n");
            out.push_str(&format!("FROM {}\n\n", BASE_TEMPLATE_IMAGE));
        } else {
            let binary_image = format!("{}:{}", AGENTBOX_BINARY_IMAGE, self.version());
            out.push_str(&format!("FROM {} AS agentbox-bin\n\n", binary_image));
            out.push_str(&format!("FROM {}\n\n", BASE_TEMPLATE_IMAGE));
        }

        if let Some(arch) = arch {
            out.push_str("# Architecture variables for multi-arch support\n");
            out.push_str(&format!("ARG GO_ARCH={}\n", arch.go_arch));
            out.push_str(&format!("ARG YQ_ARCH={}\n", arch.yq_arch));
            out.push_str(&format!("ARG PROTOC_ARCH={}\n\n", arch.protoc_arch));
        }

        out.push_str("# Switch to root to install agentbox and packages\n");
        out.push_str("USER root\n\n");

        if is_dev_mode() {
            out.push_str("# Copy agentbox binary (dev mode - from build context)\n");
            out.push_str("COPY agentbox /usr/local/bin/agentbox\n");
        } else {
            out.push_str("# Copy agentbox binary from release image\n");
            out.push_str("COPY --from=agentbox-bin /agentbox /usr/local/bin/agentbox\n");
        }
        out.push_str("RUN chmod +x /usr/local/bin/agentbox\n\n");

        for name in resolve_profiles(&self.profiles) {
            let profile = get_profile(&name)
                .with_context(|| format!("unknown profile: {}", name))?;
            out.push_str(&format!("# Profile: {}\n", profile.name));
            out.push_str(&format!("# {}\n", profile.description));
            out.push_str(profile.dockerfile_snippet);
            out.push('\n');
        }

        // The agent user must be able to write the persistent env file at
        // runtime; login shells source /etc/profile.d/*.sh.
        out.push_str("# Create agentbox persistent env file (writable by agent)\n");
        out.push_str(
            "RUN touch /etc/profile.d/agentbox-env.sh && chmod 666 /etc/profile.d/agentbox-env.sh\n\n",
        );

        out.push_str("# Switch back to agent user\n");
        out.push_str("USER agent\n\n");

        // The sandbox tool manages the container entrypoint itself; setting
        // ENTRYPOINT gets the unit killed. The claude binary is replaced with
        // a wrapper instead, so setup runs before the agent starts.
        out.push_str("# Create claude wrapper script\n");
        out.push_str("USER root\n");
        out.push_str(
            r#"COPY <<'WRAPPER_EOF' /usr/local/bin/claude-wrapper
#!/bin/bash
# agentbox wrapper for claude - does setup before starting claude
# PWD/WORKSPACE_DIR is set to the workspace by docker sandbox
exec /usr/local/bin/agentbox entrypoint
WRAPPER_EOF
RUN chmod +x /usr/local/bin/claude-wrapper
"#,
        );
        out.push_str("# Replace claude with our wrapper\n");
        out.push_str(
            r#"RUN CLAUDE_PATH=$(which claude) && \
    if [ -n "$CLAUDE_PATH" ]; then \
        mv "$CLAUDE_PATH" "${CLAUDE_PATH}-real" && \
        ln -s /usr/local/bin/claude-wrapper "$CLAUDE_PATH"; \
    fi
"#,
        );
        out.push_str("USER agent\n\n");

        out.push_str("# CMD for agentbox entrypoint - docker sandbox may override this\n");
        out.push_str("CMD [\"agentbox\", \"entrypoint\"]\n");

        Ok(out)
    }

    /// Build the template image, reusing an existing one unless forced.
    /// Returns the image reference. Build failures are fatal and surfaced
    /// verbatim; the build tool's own diagnostics are the useful message.
    pub fn build(&self, force_rebuild: bool) -> Result<String> {
        let image = self.image_name();

        if !force_rebuild && self.image_exists() {
            debug!(
                image = %image,
                profiles = ?self.profiles,
                "template:using existing image"
            );
            return Ok(image);
        }

        let arch = detect_target_arch()?;

        info!(
            image = %image,
            profiles = ?self.profiles,
            platform = %arch.docker_platform,
            dev_mode = is_dev_mode(),
            "template:building image"
        );

        let temp_dir = tempfile::Builder::new()
            .prefix("agentbox-template-")
            .tempdir()
            .context("Failed to create temporary build directory")?;
        let context_path = temp_dir.path();

        if is_dev_mode() {
            stage_dev_binary(context_path)?;
        }

        let dockerfile = self.generate_dockerfile(Some(&arch))?;
        let dockerfile_path = context_path.join("Dockerfile");
        fs::write(&dockerfile_path, &dockerfile).context("Failed to write Dockerfile")?;

        debug!(
            path = %dockerfile_path.display(),
            size = dockerfile.len(),
            "template:generated Dockerfile"
        );

        let dockerfile_str = dockerfile_path.display().to_string();
        let context_str = context_path.display().to_string();
        Cmd::new("docker")
            .args(&[
                "build",
                "--platform",
                arch.docker_platform,
                "-t",
                &image,
                "-f",
                &dockerfile_str,
                &context_str,
            ])
            .run_interactive()
            .context("docker build failed")?;

        info!(image = %image, "template:image built");
        Ok(image)
    }
}

/// Whether dev mode is active (local binary instead of the release image).
pub fn is_dev_mode() -> bool {
    std::env::var(DEV_MODE_ENV).is_ok_and(|v| v == "1")
}

/// Copy the currently running agentbox executable into the build context.
///
/// Only meaningful on Linux hosts: a macOS binary would not run inside the
/// Linux sandbox, so dev mode refuses elsewhere.
fn stage_dev_binary(context_path: &Path) -> Result<()> {
    if !cfg!(target_os = "linux") {
        bail!(
            "Cannot build a dev-mode template on a non-Linux host.\n\
             The agentbox binary copied into the image would not run in the Linux sandbox.\n\
             Unset {} or build from a Linux machine.",
            DEV_MODE_ENV
        );
    }

    let current_exe =
        std::env::current_exe().context("Failed to locate current agentbox executable")?;
    let dest = context_path.join("agentbox");
    fs::copy(&current_exe, &dest)
        .context("Failed to copy agentbox binary to build context")?;
    Ok(())
}

/// Remove all cached template images.
pub fn clean_templates() -> Result<()> {
    info!("template:cleaning cached images");

    let output = Cmd::new("docker")
        .args(&[
            "images",
            "--filter",
            "reference=agentbox-template:*",
            "--format",
            "{{.Repository}}:{{.Tag}}",
        ])
        .run_and_capture_stdout()
        .context("Failed to list template images")?;

    for image in output.lines().filter(|l| !l.is_empty()) {
        debug!(image = %image, "template:removing image");
        if let Err(e) = Cmd::new("docker").args(&["rmi", image]).run() {
            warn!(image = %image, error = %e, "template:failed to remove image");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(profiles: &[&str]) -> TemplateBuilder {
        let profiles: Vec<String> = profiles.iter().map(|s| s.to_string()).collect();
        TemplateBuilder::new(&profiles)
    }

    #[test]
    fn hash_is_deterministic_and_order_insensitive() {
        let a = builder(&["go", "rust"]).template_hash();
        let b = builder(&["rust", "go"]).template_hash();
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn hash_changes_with_profile_set() {
        let a = builder(&["go"]).template_hash();
        let b = builder(&["rust"]).template_hash();
        assert_ne!(a, b);
    }

    #[test]
    fn dependency_expansion_folds_into_hash() {
        // substreams pulls in rust, so requesting rust explicitly is a no-op.
        let a = builder(&["substreams"]).template_hash();
        let b = builder(&["substreams", "rust"]).template_hash();
        assert_eq!(a, b);
    }

    #[test]
    fn image_name_carries_hash() {
        let b = builder(&["go"]);
        assert_eq!(
            b.image_name(),
            format!("agentbox-template:{}", b.template_hash())
        );
    }

    #[test]
    fn dockerfile_emits_profiles_in_dependency_order() {
        let dockerfile = builder(&["substreams"])
            .generate_dockerfile(Some(&ARCH_AMD64))
            .unwrap();

        let rust_pos = dockerfile.find("# Profile: rust").unwrap();
        let substreams_pos = dockerfile.find("# Profile: substreams").unwrap();
        assert!(rust_pos < substreams_pos);
        assert!(dockerfile.contains(BASE_TEMPLATE_IMAGE));
        assert!(dockerfile.contains("claude-wrapper"));
        assert!(dockerfile.contains("PROTOC_ARCH=x86_64"));
    }

    #[test]
    fn dockerfile_rejects_unknown_profile() {
        let err = builder(&["nonexistent"])
            .generate_dockerfile(None)
            .unwrap_err();
        assert!(err.to_string().contains("unknown profile"));
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn dockerfile_is_deterministic() {
        let a = builder(&["go", "bash-utils"])
            .generate_dockerfile(Some(&ARCH_ARM64))
            .unwrap();
        let b = builder(&["go", "bash-utils"])
            .generate_dockerfile(Some(&ARCH_ARM64))
            .unwrap();
        assert_eq!(a, b);
    }
}
