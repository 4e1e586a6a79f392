use std::time::Duration;

use log::debug;
use rand::Rng;
use tokio::process::Command;

use crate::model::sanitize_name;

pub const MIGRATED_SUFFIX: &str = "-migrated";
pub const TEST_SUFFIX: &str = "-test";

const MAX_PREFIX_LEN: usize = 15;
const GIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Current git branch, sanitized. `None` outside a repository, on a detached
/// head or when git is slow or missing.
pub async fn git_branch() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(GIT_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(_)) => return None,
        Ok(Err(e)) => {
            debug!("git not available: {}", e);
            return None;
        }
        Err(_) => {
            debug!("git rev-parse timed out");
            return None;
        }
    };

    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if branch.is_empty() || branch == "HEAD" {
        return None;
    }
    Some(sanitize_name(&branch)).filter(|b| !b.is_empty())
}

/// `test-{prefix}-{4 hex}{suffix}`, or `test-{4 hex}{suffix}` without a
/// usable prefix
pub fn branch_name(prefix: Option<&str>, suffix: &str) -> String {
    let random: u16 = rand::thread_rng().gen();
    let prefix = prefix
        .map(sanitize_name)
        .map(|p| p.chars().take(MAX_PREFIX_LEN).collect::<String>())
        .map(|p| p.trim_end_matches('-').to_string())
        .filter(|p| !p.is_empty());

    match prefix {
        Some(prefix) => format!("test-{}-{:04x}{}", prefix, random, suffix),
        None => format!("test-{:04x}{}", random, suffix),
    }
}

/// Resolve the prefix: explicit configuration first, then the git branch
pub async fn resolve_prefix(configured: Option<&str>) -> Option<String> {
    match configured.map(sanitize_name).filter(|p| !p.is_empty()) {
        Some(prefix) => Some(prefix),
        None => git_branch().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_part(name: &str, prefix: &str, suffix: &str) -> String {
        name.strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_name_with_prefix() {
        let name = branch_name(Some("feature/login"), MIGRATED_SUFFIX);
        let hex = random_part(&name, "test-feature-login-", MIGRATED_SUFFIX);
        assert_eq!(hex.len(), 4);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_prefix_truncated() {
        let name = branch_name(Some("a-very-long-branch-name-indeed"), TEST_SUFFIX);
        assert!(name.starts_with("test-a-very-long-bra-"));
        assert!(name.ends_with(TEST_SUFFIX));
    }

    #[test]
    fn test_truncation_does_not_leave_trailing_hyphen() {
        let name = branch_name(Some("fourteen-chars-x"), "");
        assert!(name.starts_with("test-fourteen-chars-"));
        assert!(!name.contains("--"));
    }

    #[test]
    fn test_name_without_prefix() {
        let name = branch_name(None, TEST_SUFFIX);
        assert_eq!(random_part(&name, "test-", TEST_SUFFIX).len(), 4);

        let name = branch_name(Some("///"), "");
        assert_eq!(random_part(&name, "test-", "").len(), 4);
    }

    #[tokio::test]
    async fn test_configured_prefix_wins() {
        assert_eq!(resolve_prefix(Some("ci run")).await.as_deref(), Some("ci-run"));
    }
}
