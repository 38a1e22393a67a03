//! Environment variable specs shared with the sandbox.
//!
//! A spec is either `NAME=value` (explicit) or a bare `NAME` (passthrough:
//! the value is read from the host environment when the handoff directory is
//! prepared, not when configs are merged).

use std::fmt;

use tracing::debug;

/// Where a merged env spec came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvSource {
    Global,
    CheckedIn,
    Project,
}

impl fmt::Display for EnvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvSource::Global => write!(f, "global"),
            EnvSource::CheckedIn => write!(f, "checked-in"),
            EnvSource::Project => write!(f, "project"),
        }
    }
}

/// A merged env spec together with the source that supplied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEnv {
    pub spec: String,
    pub source: EnvSource,
}

/// Extract the variable name from a spec (`FOO=bar` -> `FOO`, `FOO` -> `FOO`).
pub fn env_name(spec: &str) -> &str {
    match spec.find('=') {
        Some(idx) => &spec[..idx],
        None => spec,
    }
}

/// Merge env specs from the three configuration layers.
///
/// Sources are applied in order global, checked-in, project; the last source
/// that mentions a name wins both its value and its reported origin, while
/// the position of the first occurrence fixes the output order. An empty
/// source changes nothing.
pub fn merge_envs(
    global: &[String],
    project: &[String],
    checked_in: &[String],
) -> (Vec<String>, Vec<ResolvedEnv>) {
    let mut order: Vec<String> = Vec::new();
    let mut resolved: Vec<ResolvedEnv> = Vec::new();

    let mut apply = |specs: &[String], source: EnvSource| {
        for spec in specs {
            let name = env_name(spec);
            if name.is_empty() {
                continue;
            }
            match order.iter().position(|n| n == name) {
                Some(idx) => {
                    resolved[idx] = ResolvedEnv {
                        spec: spec.clone(),
                        source,
                    };
                }
                None => {
                    order.push(name.to_string());
                    resolved.push(ResolvedEnv {
                        spec: spec.clone(),
                        source,
                    });
                }
            }
        }
    };

    apply(global, EnvSource::Global);
    apply(checked_in, EnvSource::CheckedIn);
    apply(project, EnvSource::Project);

    let merged = resolved.iter().map(|r| r.spec.clone()).collect();
    (merged, resolved)
}

/// Resolve merged specs to concrete `NAME=value` pairs.
///
/// Passthrough names are read from the current host environment; names that
/// are unset on the host are dropped.
pub fn resolve_envs(merged: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for spec in merged {
        if spec.contains('=') {
            out.push(spec.clone());
            continue;
        }
        match std::env::var(spec) {
            Ok(value) if !value.is_empty() => {
                debug!(name = %spec, "envs:resolved passthrough from host");
                out.push(format!("{}={}", spec, value));
            }
            _ => {
                debug!(name = %spec, "envs:passthrough not set on host, skipping");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn env_name_variants() {
        assert_eq!(env_name("FOO"), "FOO");
        assert_eq!(env_name("FOO=bar"), "FOO");
        assert_eq!(env_name("FOO="), "FOO");
        assert_eq!(env_name("FOO=bar=baz"), "FOO");
    }

    #[test]
    fn merge_empty_sources() {
        let (merged, resolved) = merge_envs(&[], &[], &[]);
        assert!(merged.is_empty());
        assert!(resolved.is_empty());
    }

    #[test]
    fn merge_global_only() {
        let (merged, resolved) = merge_envs(&specs(&["FOO=bar"]), &[], &[]);
        assert_eq!(merged, specs(&["FOO=bar"]));
        assert_eq!(resolved[0].source, EnvSource::Global);
    }

    #[test]
    fn project_overrides_global() {
        let (merged, resolved) = merge_envs(
            &specs(&["FOO=global", "BAZ=keep"]),
            &specs(&["FOO=project"]),
            &[],
        );
        assert_eq!(merged, specs(&["FOO=project", "BAZ=keep"]));
        assert_eq!(resolved[0].source, EnvSource::Project);
        assert_eq!(resolved[1].source, EnvSource::Global);
    }

    #[test]
    fn checked_in_overrides_global_project_overrides_checked_in() {
        let (merged, resolved) = merge_envs(
            &specs(&["A=global"]),
            &specs(&["B=project", "C=project"]),
            &specs(&["A=checked", "B=checked"]),
        );
        assert_eq!(merged, specs(&["A=checked", "B=project", "C=project"]));
        let sources: Vec<EnvSource> = resolved.iter().map(|r| r.source).collect();
        assert_eq!(
            sources,
            vec![EnvSource::CheckedIn, EnvSource::Project, EnvSource::Project]
        );
    }

    #[test]
    fn passthrough_spec_preserved() {
        let (merged, resolved) = merge_envs(&specs(&["TOKEN"]), &specs(&["DEBUG=1"]), &[]);
        assert_eq!(merged, specs(&["TOKEN", "DEBUG=1"]));
        assert_eq!(resolved[0].source, EnvSource::Global);
        assert_eq!(resolved[1].source, EnvSource::Project);
    }

    #[test]
    fn project_wins_over_checked_in_with_passthrough_global() {
        // Global declares a passthrough TOKEN, project pins FOO, checked-in
        // tries to override FOO and adds BAZ.
        let (merged, _) = merge_envs(
            &specs(&["TOKEN"]),
            &specs(&["FOO=bar"]),
            &specs(&["FOO=baz", "BAZ=qux"]),
        );
        assert_eq!(merged, specs(&["TOKEN", "FOO=bar", "BAZ=qux"]));
    }

    #[test]
    fn resolve_envs_substitutes_passthrough() {
        // SAFETY: test-local variable, no concurrent reader cares about it.
        unsafe { std::env::set_var("AGENTBOX_TEST_TOKEN", "sekrit") };
        let resolved = resolve_envs(&specs(&["AGENTBOX_TEST_TOKEN", "FOO=bar", "AGENTBOX_UNSET"]));
        assert_eq!(resolved, specs(&["AGENTBOX_TEST_TOKEN=sekrit", "FOO=bar"]));
        unsafe { std::env::remove_var("AGENTBOX_TEST_TOKEN") };
    }
}
