//! Derives a human-readable project name from a working directory.

use regex::Regex;
use std::path::Path;

/// Tries, in order: git remote origin URL, `package.json` name,
/// `pyproject.toml` name, `go.mod` module path, `Cargo.toml` name, falling
/// back to the directory's basename. Each step swallows its own parse
/// failures and falls through to the next.
pub fn detect_project_name(directory: &Path) -> String {
    from_git_remote(directory)
        .or_else(|| from_package_json(directory))
        .or_else(|| from_pyproject_toml(directory))
        .or_else(|| from_go_mod(directory))
        .or_else(|| from_cargo_toml(directory))
        .unwrap_or_else(|| {
            directory
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| directory.display().to_string())
        })
}

fn from_git_remote(directory: &Path) -> Option<String> {
    let config = std::fs::read_to_string(directory.join(".git").join("config")).ok()?;
    let mut in_origin = false;
    for line in config.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_origin = trimmed == "[remote \"origin\"]";
            continue;
        }
        if in_origin
            && let Some(rest) = trimmed.strip_prefix("url")
            && let Some(url) = rest.trim_start_matches([' ', '=']).split('=').last()
        {
            return extract_repo_name_from_url(url.trim());
        }
    }
    None
}

fn extract_repo_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    if trimmed.is_empty() {
        return None;
    }
    let tail = if let Some(idx) = trimmed.find("://") {
        trimmed[idx + 3..].rsplit('/').next()
    } else if let Some(idx) = trimmed.find(':') {
        // scp-like syntax: git@host:user/repo
        trimmed[idx + 1..].rsplit('/').next()
    } else {
        trimmed.rsplit('/').next()
    };
    tail.filter(|s| !s.is_empty()).map(str::to_string)
}

fn from_package_json(directory: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(directory.join("package.json")).ok()?;
    let value: serde_json::Value = serde_json::from_str(&contents).ok()?;
    let name = value.get("name")?.as_str()?;
    Some(strip_npm_scope(name))
}

fn strip_npm_scope(name: &str) -> String {
    name.split('/').next_back().unwrap_or(name).to_string()
}

fn from_pyproject_toml(directory: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(directory.join("pyproject.toml")).ok()?;
    name_from_toml_like(&contents)
}

fn from_cargo_toml(directory: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(directory.join("Cargo.toml")).ok()?;
    name_from_toml_like(&contents)
}

fn name_from_toml_like(contents: &str) -> Option<String> {
    let re = Regex::new(r#"(?m)^\s*name\s*=\s*["']([^"']+)["']"#).ok()?;
    re.captures(contents)
        .map(|c| c.get(1).unwrap().as_str().to_string())
}

fn from_go_mod(directory: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(directory.join("go.mod")).ok()?;
    let re = Regex::new(r"(?m)^module\s+(\S+)").ok()?;
    let module_path = re.captures(&contents)?.get(1)?.as_str();
    module_path.rsplit('/').next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn falls_back_to_directory_basename() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("my-app");
        std::fs::create_dir(&sub).unwrap();
        assert_eq!(detect_project_name(&sub), "my-app");
    }

    #[test]
    fn reads_name_from_cargo_toml() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"widget-factory\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        assert_eq!(detect_project_name(dir.path()), "widget-factory");
    }

    #[test]
    fn reads_name_from_package_json_and_strips_scope() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name": "@my-org/widget", "version": "1.0.0"}"#,
        )
        .unwrap();
        assert_eq!(detect_project_name(dir.path()), "widget");
    }

    #[test]
    fn reads_module_tail_from_go_mod() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("go.mod"),
            "module github.com/acme/widget\n\ngo 1.21\n",
        )
        .unwrap();
        assert_eq!(detect_project_name(dir.path()), "widget");
    }

    #[test]
    fn extracts_repo_name_from_ssh_remote() {
        assert_eq!(
            extract_repo_name_from_url("git@github.com:acme/widget.git"),
            Some("widget".to_string())
        );
    }

    #[test]
    fn extracts_repo_name_from_https_remote() {
        assert_eq!(
            extract_repo_name_from_url("https://github.com/acme/widget.git"),
            Some("widget".to_string())
        );
    }

    #[test]
    fn cargo_toml_takes_priority_over_basename_but_not_git() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(
            dir.path().join(".git").join("config"),
            "[remote \"origin\"]\n\turl = git@github.com:acme/from-git.git\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"from-cargo\"\n",
        )
        .unwrap();
        assert_eq!(detect_project_name(dir.path()), "from-git");
    }
}
