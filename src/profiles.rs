//! Built-in tool profiles folded into the sandbox image.
//!
//! A profile is a named bundle of Dockerfile instructions plus the profiles
//! it depends on. Build steps are emitted in resolution order, so a profile
//! may assume its dependencies' tools are already on PATH.

/// A named, dependency-aware bundle of image build steps.
pub struct Profile {
    /// Unique identifier
    pub name: &'static str,

    /// Human-readable explanation of what the profile provides
    pub description: &'static str,

    /// Profiles that must be installed before this one
    pub dependencies: &'static [&'static str],

    /// Dockerfile instructions installing the profile's tools
    pub dockerfile_snippet: &'static str,
}

/// All built-in profiles, in catalog order.
pub const BUILTIN_PROFILES: &[Profile] = &[
    Profile {
        name: "go",
        description: "Go programming language toolchain (latest stable version)",
        dependencies: &[],
        dockerfile_snippet: r#"# Go toolchain
RUN apt-get update && apt-get install -y wget && \
    wget -q https://go.dev/dl/go1.24.4.linux-${GO_ARCH}.tar.gz && \
    tar -C /usr/local -xzf go1.24.4.linux-${GO_ARCH}.tar.gz && \
    rm go1.24.4.linux-${GO_ARCH}.tar.gz && \
    apt-get clean && rm -rf /var/lib/apt/lists/*

ENV PATH="/usr/local/go/bin:${PATH}"
ENV GOPATH="/workspace/.go"
ENV PATH="${GOPATH}/bin:${PATH}"
"#,
    },
    Profile {
        name: "rust",
        description: "Rust programming language toolchain (stable)",
        dependencies: &[],
        dockerfile_snippet: r#"# Rust toolchain (installed system-wide for all users)
ENV RUSTUP_HOME="/usr/local/rustup"
ENV CARGO_HOME="/usr/local/cargo"
ENV PATH="/usr/local/cargo/bin:${PATH}"

RUN apt-get update && apt-get install -y curl build-essential && \
    curl --proto '=https' --tlsv1.2 -sSf https://sh.rustup.rs | sh -s -- -y --no-modify-path && \
    chmod -R a+rwx /usr/local/rustup /usr/local/cargo && \
    apt-get clean && rm -rf /var/lib/apt/lists/*
"#,
    },
    Profile {
        name: "docker",
        description: "Docker CLI tools for container management",
        dependencies: &[],
        dockerfile_snippet: r#"# Docker CLI
RUN apt-get update && apt-get install -y \
    ca-certificates \
    curl \
    gnupg \
    lsb-release && \
    mkdir -p /etc/apt/keyrings && \
    curl -fsSL https://download.docker.com/linux/debian/gpg | gpg --dearmor -o /etc/apt/keyrings/docker.gpg && \
    echo "deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.gpg] https://download.docker.com/linux/debian \
    $(lsb_release -cs) stable" | tee /etc/apt/sources.list.d/docker.list > /dev/null && \
    apt-get update && apt-get install -y docker-ce-cli docker-compose-plugin && \
    apt-get clean && rm -rf /var/lib/apt/lists/*
"#,
    },
    Profile {
        name: "bash-utils",
        description: "Common shell utilities (jq, yq, curl, wget, git)",
        dependencies: &[],
        dockerfile_snippet: r#"# Bash utilities
RUN apt-get update && apt-get install -y \
    jq \
    curl \
    wget \
    git \
    vim \
    nano \
    htop \
    tree \
    zip \
    unzip && \
    wget -qO /usr/local/bin/yq https://github.com/mikefarah/yq/releases/latest/download/yq_linux_${YQ_ARCH} && \
    chmod +x /usr/local/bin/yq && \
    apt-get clean && rm -rf /var/lib/apt/lists/*
"#,
    },
    Profile {
        name: "substreams",
        description: "Substreams and Firehose Core CLI tools for blockchain data",
        dependencies: &["rust"],
        dockerfile_snippet: r#"# Substreams CLI (from official Docker image)
COPY --from=ghcr.io/streamingfast/substreams:latest /app/substreams /usr/local/bin/substreams

# Firehose Core CLI (from official Docker image)
COPY --from=ghcr.io/streamingfast/firehose-core:latest /app/firecore /usr/local/bin/firecore

# buf CLI and protoc (protobuf compiler)
RUN apt-get update && apt-get install -y curl unzip && \
    curl -sSL "https://github.com/bufbuild/buf/releases/latest/download/buf-$(uname -s)-$(uname -m)" -o /usr/local/bin/buf && \
    chmod +x /usr/local/bin/buf && \
    PROTOC_VERSION=$(curl -sSL https://api.github.com/repos/protocolbuffers/protobuf/releases/latest | grep '"tag_name"' | sed 's/.*"v\(.*\)".*/\1/') && \
    curl -sSL "https://github.com/protocolbuffers/protobuf/releases/download/v${PROTOC_VERSION}/protoc-${PROTOC_VERSION}-linux-${PROTOC_ARCH}.zip" -o /tmp/protoc.zip && \
    unzip -o /tmp/protoc.zip -d /usr/local bin/protoc 'include/*' && \
    rm /tmp/protoc.zip && \
    apt-get clean && rm -rf /var/lib/apt/lists/*
"#,
    },
    Profile {
        name: "javascript",
        description: "JavaScript/TypeScript development tools (pnpm, yarn)",
        dependencies: &[],
        dockerfile_snippet: r#"# JavaScript package managers (pnpm, yarn)
# Note: Node.js and npm are already installed in the base image
RUN npm install -g pnpm yarn
"#,
    },
];

/// Look up a built-in profile by name.
pub fn get_profile(name: &str) -> Option<&'static Profile> {
    BUILTIN_PROFILES.iter().find(|p| p.name == name)
}

/// Sorted list of all available profile names.
pub fn list_profiles() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = BUILTIN_PROFILES.iter().map(|p| p.name).collect();
    names.sort_unstable();
    names
}

/// Expand a requested profile set into the full dependency-ordered build
/// list.
///
/// Depth-first: each profile's dependencies land strictly before the profile
/// itself, and a profile already placed is never duplicated. Unknown names
/// are passed through unresolved so the build step can raise a clear
/// "unknown profile" error instead of silently dropping work.
pub fn resolve_profiles(requested: &[String]) -> Vec<String> {
    let mut seen: Vec<&str> = Vec::new();
    let mut result: Vec<String> = Vec::new();

    fn resolve<'a>(name: &'a str, seen: &mut Vec<&'a str>, result: &mut Vec<String>) {
        if seen.contains(&name) {
            return;
        }

        match get_profile(name) {
            Some(profile) => {
                for dep in profile.dependencies {
                    resolve(dep, seen, result);
                }
                seen.push(name);
                result.push(name.to_string());
            }
            None => {
                // Unknown profile: keep it so a later stage errors clearly
                seen.push(name);
                result.push(name.to_string());
            }
        }
    }

    for name in requested {
        resolve(name, &mut seen, &mut result);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolve_empty() {
        assert!(resolve_profiles(&[]).is_empty());
    }

    #[test]
    fn resolve_single_without_dependencies() {
        assert_eq!(resolve_profiles(&names(&["go"])), names(&["go"]));
    }

    #[test]
    fn dependencies_come_before_dependents() {
        assert_eq!(
            resolve_profiles(&names(&["substreams"])),
            names(&["rust", "substreams"])
        );
    }

    #[test]
    fn shared_dependency_not_duplicated() {
        assert_eq!(
            resolve_profiles(&names(&["substreams", "rust"])),
            names(&["rust", "substreams"])
        );
        assert_eq!(
            resolve_profiles(&names(&["rust", "substreams"])),
            names(&["rust", "substreams"])
        );
    }

    #[test]
    fn independent_profiles_keep_request_order() {
        assert_eq!(
            resolve_profiles(&names(&["go", "docker"])),
            names(&["go", "docker"])
        );
    }

    #[test]
    fn resolution_is_idempotent() {
        let once = resolve_profiles(&names(&["substreams", "go"]));
        let twice = resolve_profiles(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_profiles_pass_through() {
        assert_eq!(
            resolve_profiles(&names(&["nonexistent", "go"])),
            names(&["nonexistent", "go"])
        );
    }

    #[test]
    fn builtin_catalog_is_well_formed() {
        for profile in BUILTIN_PROFILES {
            assert!(!profile.description.is_empty(), "{}", profile.name);
            assert!(!profile.dockerfile_snippet.is_empty(), "{}", profile.name);
            for dep in profile.dependencies {
                assert!(get_profile(dep).is_some(), "{} -> {}", profile.name, dep);
            }
        }
        assert!(get_profile("nonexistent").is_none());
    }

    #[test]
    fn substreams_profile_contents() {
        let profile = get_profile("substreams").unwrap();
        assert!(profile.dependencies.contains(&"rust"));
        assert!(profile.dockerfile_snippet.contains("substreams"));
        assert!(profile.dockerfile_snippet.contains("firecore"));
        assert!(profile.dockerfile_snippet.contains("buf"));
        assert!(profile.dockerfile_snippet.contains("protoc"));
    }
}
