//! Skill discovery and loading.
//!
//! A skill is a directory with a `SKILL.md` (YAML frontmatter + markdown
//! body), optional `references/` text files, optional `scripts/` with
//! executable helpers, optional `assets/`, and an optional `workflow.yaml`.
//! Names are validated on discovery; skill content is immutable afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ErrorCode, WeftError};

/// `^[a-z0-9]([a-z0-9-]{0,62}[a-z0-9])?$` — lowercase, digits, hyphens, no
/// leading/trailing hyphen, at most 64 characters.
fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,62}[a-z0-9])?$").expect("static regex"))
}

const MAX_DESCRIPTION_LEN: usize = 1024;

/// YAML frontmatter of a `SKILL.md`.
#[derive(Debug, Clone, Deserialize)]
pub struct SkillFrontmatter {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub license: Option<String>,
    /// Interpreter the skill's scripts require (`python` or `bash`).
    #[serde(default)]
    pub language: Option<String>,
}

/// A discovered skill bundle.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub license: Option<String>,
    pub required_language: Option<String>,
    pub directory: PathBuf,
    /// Markdown body after the frontmatter.
    pub main_content: String,
    /// `references/` text files, keyed by file name.
    pub references: BTreeMap<String, String>,
    /// Executable files under `scripts/`.
    pub scripts: Vec<PathBuf>,
    pub scripts_dir: Option<PathBuf>,
    pub assets_dir: Option<PathBuf>,
    pub workflow_path: Option<PathBuf>,
}

impl Skill {
    /// Finds a script by bare file name.
    pub fn script(&self, file_name: &str) -> Option<&PathBuf> {
        self.scripts
            .iter()
            .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(file_name))
    }
}

/// Validates a skill name against the naming contract.
pub fn validate_skill_name(name: &str) -> Result<(), WeftError> {
    if name.len() > 64 || !name_re().is_match(name) {
        return Err(WeftError::new(
            ErrorCode::ConfigInvalid,
            format!(
                "invalid skill name {name:?}: lowercase letters, digits, and inner hyphens only, max 64 chars"
            ),
        ));
    }
    Ok(())
}

/// Splits a `SKILL.md` into frontmatter and body.
pub fn parse_frontmatter(text: &str) -> Result<(SkillFrontmatter, String), WeftError> {
    let rest = text.strip_prefix("---").ok_or_else(|| {
        WeftError::new(ErrorCode::ConfigInvalid, "SKILL.md is missing YAML frontmatter")
    })?;
    let end = rest.find("\n---").ok_or_else(|| {
        WeftError::new(ErrorCode::ConfigInvalid, "SKILL.md frontmatter is unterminated")
    })?;
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n').to_string();

    let frontmatter: SkillFrontmatter = serde_yaml::from_str(yaml).map_err(|e| {
        WeftError::new(ErrorCode::ConfigParseFailed, "invalid SKILL.md frontmatter").with_cause(e)
    })?;
    Ok((frontmatter, body))
}

/// Loads one skill directory, validating its metadata.
pub fn load_skill(directory: &Path) -> Result<Skill, WeftError> {
    let manifest = directory.join("SKILL.md");
    let text = std::fs::read_to_string(&manifest).map_err(|e| {
        WeftError::new(
            ErrorCode::ConfigNotFound,
            format!("cannot read {}", manifest.display()),
        )
        .with_cause(e)
    })?;
    let (frontmatter, main_content) = parse_frontmatter(&text)?;

    validate_skill_name(&frontmatter.name)?;
    if frontmatter.description.is_empty() || frontmatter.description.len() > MAX_DESCRIPTION_LEN {
        return Err(WeftError::new(
            ErrorCode::ConfigInvalid,
            format!(
                "skill {:?} description must be 1..={MAX_DESCRIPTION_LEN} chars",
                frontmatter.name
            ),
        ));
    }

    let references = load_references(&directory.join("references"));
    let (scripts_dir, scripts) = load_scripts(&directory.join("scripts"));
    let assets_dir = existing_dir(directory.join("assets"));
    let workflow_path = {
        let path = directory.join("workflow.yaml");
        path.is_file().then_some(path)
    };

    Ok(Skill {
        name: frontmatter.name,
        description: frontmatter.description,
        license: frontmatter.license,
        required_language: frontmatter.language,
        directory: directory.to_path_buf(),
        main_content,
        references,
        scripts,
        scripts_dir,
        assets_dir,
        workflow_path,
    })
}

/// Scans a directory for skills: each direct subdirectory with a `SKILL.md`
/// is a candidate. Invalid candidates are skipped with a warning so one bad
/// bundle cannot take down discovery. Include/exclude filters apply by name.
pub fn scan_skills(
    directory: &Path,
    include: &[String],
    exclude: &[String],
) -> Result<Vec<Skill>, WeftError> {
    let entries = std::fs::read_dir(directory).map_err(|e| {
        WeftError::new(
            ErrorCode::ConfigNotFound,
            format!("cannot read skills directory {}", directory.display()),
        )
        .with_cause(e)
    })?;

    let mut skills = Vec::new();
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir() && path.join("SKILL.md").is_file())
        .collect();
    dirs.sort();

    for dir in dirs {
        match load_skill(&dir) {
            Ok(skill) => {
                if !include.is_empty() && !include.contains(&skill.name) {
                    debug!(skill = %skill.name, "not in include list; skipping");
                    continue;
                }
                if exclude.contains(&skill.name) {
                    debug!(skill = %skill.name, "excluded; skipping");
                    continue;
                }
                skills.push(skill);
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "skipping invalid skill"),
        }
    }
    Ok(skills)
}

fn load_references(dir: &Path) -> BTreeMap<String, String> {
    let mut references = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return references;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                references.insert(name.to_string(), text);
            }
            Err(e) => warn!(file = %path.display(), error = %e, "unreadable reference"),
        }
    }
    references
}

fn load_scripts(dir: &Path) -> (Option<PathBuf>, Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return (None, Vec::new());
    };
    let mut scripts: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_script(p))
        .collect();
    scripts.sort();
    (Some(dir.to_path_buf()), scripts)
}

fn is_script(path: &Path) -> bool {
    if matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("py") | Some("sh")
    ) {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = path.metadata() {
            return meta.permissions().mode() & 0o111 != 0;
        }
    }
    false
}

fn existing_dir(path: PathBuf) -> Option<PathBuf> {
    path.is_dir().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_skill(root: &Path, dir_name: &str, name: &str, description: &str) -> PathBuf {
        let dir = root.join(dir_name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("SKILL.md"),
            format!("---\nname: {name}\ndescription: {description}\n---\n\n# Usage\n\nBody text.\n"),
        )
        .unwrap();
        dir
    }

    #[test]
    fn name_validation_table() {
        for valid in ["a", "abc", "abc-def", "a1-b2", "x0"] {
            assert!(validate_skill_name(valid).is_ok(), "expected valid: {valid}");
        }
        let too_long = "a".repeat(65);
        for invalid in ["", "-abc", "abc-", "ABC", "a_b", too_long.as_str()] {
            assert!(
                validate_skill_name(invalid).is_err(),
                "expected invalid: {invalid:?}"
            );
        }
        // Exactly 64 characters is fine.
        assert!(validate_skill_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn frontmatter_parse_splits_body() {
        let (frontmatter, body) =
            parse_frontmatter("---\nname: demo\ndescription: does things\n---\n\nThe body.\n")
                .unwrap();
        assert_eq!(frontmatter.name, "demo");
        assert_eq!(frontmatter.description, "does things");
        assert_eq!(body.trim(), "The body.");
    }

    #[test]
    fn missing_frontmatter_is_invalid() {
        assert!(parse_frontmatter("no fences here").is_err());
        assert!(parse_frontmatter("---\nname: x\ndescription: y\n").is_err());
    }

    #[test]
    fn load_skill_enumerates_bundle_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_skill(tmp.path(), "demo", "demo", "a demo skill");
        fs::create_dir(dir.join("references")).unwrap();
        fs::write(dir.join("references/notes.md"), "ref text").unwrap();
        fs::create_dir(dir.join("scripts")).unwrap();
        fs::write(dir.join("scripts/helper.py"), "def greet(n): ...").unwrap();
        fs::write(dir.join("workflow.yaml"), "schema: workflow/v2.0").unwrap();

        let skill = load_skill(&dir).unwrap();
        assert_eq!(skill.name, "demo");
        assert_eq!(skill.references["notes.md"], "ref text");
        assert_eq!(skill.scripts.len(), 1);
        assert!(skill.script("helper.py").is_some());
        assert!(skill.workflow_path.is_some());
        assert!(skill.main_content.contains("Usage"));
    }

    #[test]
    fn scan_applies_filters_and_skips_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "alpha", "alpha", "first");
        write_skill(tmp.path(), "beta", "beta", "second");
        // Invalid name: skipped, not fatal.
        write_skill(tmp.path(), "broken", "Not-Valid", "third");
        // No SKILL.md: not a candidate.
        fs::create_dir(tmp.path().join("plain")).unwrap();

        let all = scan_skills(tmp.path(), &[], &[]).unwrap();
        assert_eq!(
            all.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "beta"]
        );

        let only_beta =
            scan_skills(tmp.path(), &["beta".to_string()], &[]).unwrap();
        assert_eq!(only_beta.len(), 1);

        let without_beta =
            scan_skills(tmp.path(), &[], &["beta".to_string()]).unwrap();
        assert_eq!(without_beta[0].name, "alpha");
        assert_eq!(without_beta.len(), 1);
    }

    #[test]
    fn oversize_description_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let long = "d".repeat(1025);
        let dir = write_skill(tmp.path(), "big", "big", &long);
        assert!(load_skill(&dir).is_err());
    }
}
