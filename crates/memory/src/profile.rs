//! The singleton user-profile JSON document (§6) and its renderer for the
//! Hydrator. Mutated only by the [`crate::scribe::Scribe`] via
//! read-modify-write with last-writer-wins — tolerable because a single
//! user owns the profile, mirroring the teacher's
//! `record_user_profile_keyed` approach.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::schema::{ConstraintSeverity, ProfileConstraint, ProfileIdentity, ProfilePreference, UserProfile};

pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<UserProfile> {
        if !self.path.exists() {
            return Ok(UserProfile::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading user profile at {}", self.path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing user profile at {}", self.path.display()))
    }

    pub fn save(&self, profile: &UserProfile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = serde_json::to_string_pretty(profile)?;
        std::fs::write(&self.path, rendered)?;
        Ok(())
    }

    /// Read-modify-write: apply `mutate`, then persist. Last writer wins if
    /// two Scribe tasks race — acceptable for a single-user profile (§4.3).
    pub fn update(&self, mutate: impl FnOnce(&mut UserProfile)) -> Result<UserProfile> {
        let mut profile = self.load()?;
        mutate(&mut profile);
        self.save(&profile)?;
        Ok(profile)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Renders the profile as labelled sections (constraints with key,
/// description, type and severity — not just key/value, per §4.6) for the
/// Hydrator's fixed-order prompt assembly.
pub fn render_profile_block(profile: &UserProfile) -> Option<String> {
    let g = &profile.glossary;
    if g.constraints.is_empty() && g.preferences.is_empty() && g.identities.is_empty() {
        return None;
    }

    let mut sections = Vec::new();
    if !g.constraints.is_empty() {
        sections.push(format!("Constraints:\n{}", bullet_constraints(&g.constraints)));
    }
    if !g.preferences.is_empty() {
        sections.push(format!("Preferences:\n{}", bullet_preferences(&g.preferences)));
    }
    if !g.identities.is_empty() {
        sections.push(format!("Identities:\n{}", bullet_identities(&g.identities)));
    }
    Some(sections.join("\n"))
}

fn bullet_constraints(items: &[ProfileConstraint]) -> String {
    items
        .iter()
        .map(|c| {
            let severity = match c.severity {
                ConstraintSeverity::Hard => "hard",
                ConstraintSeverity::Soft => "soft",
            };
            format!("  - [{}] {} ({}): {}", severity, c.key, c.r#type, c.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn bullet_preferences(items: &[ProfilePreference]) -> String {
    items.iter().map(|p| format!("  - {}: {}", p.key, p.description)).collect::<Vec<_>>().join("\n")
}

fn bullet_identities(items: &[ProfileIdentity]) -> String {
    items.iter().map(|i| format!("  - {}: {}", i.key, i.description)).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_returns_default() {
        let store = ProfileStore::new("/nonexistent/hmlr/profile.json");
        let profile = store.load().unwrap();
        assert!(profile.glossary.constraints.is_empty());
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        let store = ProfileStore::new(&path);

        store
            .update(|p| {
                p.glossary.constraints.push(ProfileConstraint {
                    key: "diet_vegetarian".into(),
                    r#type: "diet".into(),
                    description: "Vegetarian, no meat".into(),
                    severity: ConstraintSeverity::Hard,
                });
            })
            .unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.glossary.constraints.len(), 1);
        assert_eq!(reloaded.glossary.constraints[0].key, "diet_vegetarian");
    }

    #[test]
    fn render_includes_description_and_severity() {
        let mut profile = UserProfile::default();
        profile.glossary.constraints.push(ProfileConstraint {
            key: "diet_vegetarian".into(),
            r#type: "diet".into(),
            description: "Vegetarian, no meat".into(),
            severity: ConstraintSeverity::Hard,
        });
        let block = render_profile_block(&profile).unwrap();
        assert!(block.contains("Vegetarian, no meat"));
        assert!(block.contains("hard"));
    }

    #[test]
    fn render_returns_none_for_empty_profile() {
        assert!(render_profile_block(&UserProfile::default()).is_none());
    }
}
