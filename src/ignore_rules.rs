// SPDX-License-Identifier: GPL-3.0-or-later

//! Ignore-aware path classification.
//!
//! An [`IgnoreSpec`] is built once per facade instance from user-configured
//! patterns plus the repository's `.gitignore`, and decides which paths the
//! facade surfaces. A path is ignored when any of the following holds:
//!
//! - it is a regular file whose extension is not a source extension of the
//!   active language (unless the caller opts out),
//! - any directory component of it is an always-ignored name (hidden
//!   directories plus per-language entries such as `node_modules`),
//! - the compiled gitignore pattern set matches it. Later patterns may
//!   re-include, with full gitignore semantics.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::language::Language;

/// Compiled ignore rules for one repository and language.
#[derive(Debug)]
pub struct IgnoreSpec {
    root: PathBuf,
    language: Language,
    gitignore: Gitignore,
}

impl IgnoreSpec {
    /// Compiles the ignore rules.
    ///
    /// `patterns` come from the configuration (normalized to forward
    /// slashes); `gitignore_content` overrides reading `<root>/.gitignore`
    /// when provided. A missing `.gitignore` is logged, not fatal.
    #[must_use]
    pub fn new(
        root: &Path,
        language: Language,
        patterns: &[String],
        gitignore_content: Option<&str>,
    ) -> Self {
        let mut builder = GitignoreBuilder::new(root);

        for pattern in patterns {
            let normalized = pattern.replace('\\', "/");
            if let Err(e) = builder.add_line(None, &normalized) {
                warn!(pattern = %normalized, "Invalid ignore pattern, skipping: {e}");
            }
        }

        match gitignore_content {
            Some(content) => add_gitignore_lines(&mut builder, content),
            None => {
                let gitignore_path = root.join(".gitignore");
                match std::fs::read_to_string(&gitignore_path) {
                    Ok(content) => add_gitignore_lines(&mut builder, &content),
                    Err(_) => {
                        warn!(
                            path = %gitignore_path.display(),
                            "No .gitignore found, using configured patterns only"
                        );
                    }
                }
            }
        }

        let gitignore = builder.build().unwrap_or_else(|e| {
            warn!("Failed to compile ignore patterns, ignoring none: {e}");
            Gitignore::empty()
        });

        Self {
            root: root.to_path_buf(),
            language,
            gitignore,
        }
    }

    /// Whether the given repository-relative path should be ignored.
    ///
    /// With `ignore_unsupported` set, files that are not source files of
    /// the active language are ignored regardless of patterns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the path does not exist: the
    /// file/directory distinction is part of the decision and cannot be
    /// made for absent paths.
    pub fn is_ignored(&self, relative_path: &str, ignore_unsupported: bool) -> Result<bool> {
        let absolute = self.root.join(relative_path);
        if !absolute.exists() {
            return Err(Error::FileNotFound(absolute));
        }
        let is_file = absolute.is_file();

        if is_file && ignore_unsupported && !self.language.is_source_file(&absolute) {
            return Ok(true);
        }

        // Always-ignored names apply to every directory component; for a
        // file, the final component is the filename and is exempt.
        let rel = Path::new(relative_path);
        let components: Vec<&str> = rel
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        let dir_components = if is_file {
            &components[..components.len().saturating_sub(1)]
        } else {
            &components[..]
        };
        for part in dir_components {
            if !part.is_empty() && self.language.is_ignored_dirname(part) {
                return Ok(true);
            }
        }

        // The matcher only applies directory patterns when told the probe
        // is a directory, so the flag must be accurate here.
        let matched = self
            .gitignore
            .matched_path_or_any_parents(rel, !is_file)
            .is_ignore();
        if matched {
            debug!(path = relative_path, "Path matches ignore patterns");
        }
        Ok(matched)
    }
}

fn add_gitignore_lines(builder: &mut GitignoreBuilder, content: &str) {
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Err(e) = builder.add_line(None, trimmed) {
            warn!(pattern = trimmed, "Invalid .gitignore line, skipping: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use tempfile::TempDir;

    fn scratch_repo() -> Result<TempDir> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("src"))?;
        fs::create_dir_all(dir.path().join("build"))?;
        fs::create_dir_all(dir.path().join("node_modules/pkg"))?;
        fs::create_dir_all(dir.path().join(".hidden"))?;
        fs::write(dir.path().join("src/a.py"), "x = 1\n")?;
        fs::write(dir.path().join("src/notes.txt"), "notes\n")?;
        fs::write(dir.path().join("build/a.py"), "x = 1\n")?;
        fs::write(dir.path().join("node_modules/pkg/b.py"), "x = 1\n")?;
        fs::write(dir.path().join(".hidden/c.py"), "x = 1\n")?;
        Ok(dir)
    }

    #[test]
    fn unsupported_extension_is_ignored() -> Result<()> {
        let repo = scratch_repo()?;
        let spec = IgnoreSpec::new(repo.path(), Language::Python, &[], None);
        assert!(spec.is_ignored("src/notes.txt", true)?);
        assert!(!spec.is_ignored("src/notes.txt", false)?);
        assert!(!spec.is_ignored("src/a.py", true)?);
        Ok(())
    }

    #[test]
    fn always_ignored_directory_components() -> Result<()> {
        let repo = scratch_repo()?;
        let spec = IgnoreSpec::new(repo.path(), Language::Python, &[], None);
        assert!(spec.is_ignored("node_modules/pkg/b.py", true)?);
        assert!(spec.is_ignored(".hidden/c.py", true)?);
        assert!(spec.is_ignored(".hidden", false)?);
        Ok(())
    }

    #[test]
    fn configured_patterns_match_directories() -> Result<()> {
        let repo = scratch_repo()?;
        let spec = IgnoreSpec::new(
            repo.path(),
            Language::Python,
            &["build/**".to_string()],
            None,
        );
        assert!(spec.is_ignored("build/a.py", true)?);
        assert!(!spec.is_ignored("src/a.py", true)?);
        Ok(())
    }

    #[test]
    fn gitignore_content_with_reinclude() -> Result<()> {
        let repo = scratch_repo()?;
        fs::write(repo.path().join("build/keep.py"), "x = 1\n")?;
        let spec = IgnoreSpec::new(
            repo.path(),
            Language::Python,
            &[],
            Some("# generated\nbuild/*\n!build/keep.py\n"),
        );
        assert!(spec.is_ignored("build/a.py", true)?);
        assert!(!spec.is_ignored("build/keep.py", true)?);
        Ok(())
    }

    #[test]
    fn gitignore_discovered_on_disk() -> Result<()> {
        let repo = scratch_repo()?;
        fs::write(repo.path().join(".gitignore"), "build/\n")?;
        let spec = IgnoreSpec::new(repo.path(), Language::Python, &[], None);
        assert!(spec.is_ignored("build", false)?);
        assert!(spec.is_ignored("build/a.py", true)?);
        Ok(())
    }

    #[test]
    fn missing_path_is_an_error() -> Result<()> {
        let repo = scratch_repo()?;
        let spec = IgnoreSpec::new(repo.path(), Language::Python, &[], None);
        assert!(matches!(
            spec.is_ignored("src/absent.py", true),
            Err(Error::FileNotFound(_))
        ));
        Ok(())
    }
}
