//! Zone classification.
//!
//! A zone is a named set of root directories (`frontend`, `electron`,
//! `workspace`, ...). Every file under a zone root gets a machine-independent
//! virtual path `{zone}/{zoneRelativePath}`, which is the key used by
//! snapshots, diffs and restores.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SelfModError};
use crate::paths::{join_relative, lexical_normalize, sanitize_relative_path, CASE_INSENSITIVE_PATHS};

/// Zone definition as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ZoneDefinition {
    pub name: String,
    /// Free-form kind used to select groups of zones; defaults to the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub roots: Vec<PathBuf>,
}

/// A registered zone.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub name: String,
    pub kind: String,
    pub roots: Vec<PathBuf>,
}

/// Result of classifying an absolute path.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PathClassification {
    pub zone: String,
    pub zone_kind: String,
    /// Root the path was matched against.
    pub root: PathBuf,
    pub zone_relative_path: String,
    /// Relative to the project root, when the path lies under it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_relative_path: Option<String>,
    pub virtual_path: String,
    pub absolute_path: PathBuf,
}

#[derive(Debug, Clone)]
struct RootMatcher {
    zone_index: usize,
    root: PathBuf,
    key: String,
    depth: usize,
}

/// Immutable zone registry built once at startup.
#[derive(Debug, Clone)]
pub struct ZoneManager {
    zones: Vec<Zone>,
    project_root: PathBuf,
    /// Sorted longest key first so nested roots win.
    matchers: Vec<RootMatcher>,
}

impl ZoneManager {
    /// Build the registry. Zone names must be unique single path segments.
    pub fn new(project_root: PathBuf, definitions: Vec<ZoneDefinition>) -> Result<Self> {
        let mut zones: Vec<Zone> = Vec::with_capacity(definitions.len());
        for def in definitions {
            crate::paths::validate_id(&def.name)
                .map_err(|_| SelfModError::Config(format!("invalid zone name `{}`", def.name)))?;
            if zones.iter().any(|z| z.name == def.name) {
                return Err(SelfModError::Config(format!(
                    "duplicate zone name `{}`",
                    def.name
                )));
            }
            if def.roots.is_empty() {
                return Err(SelfModError::Config(format!(
                    "zone `{}` has no roots",
                    def.name
                )));
            }
            let roots = def
                .roots
                .iter()
                .map(|r| lexical_normalize(&absolutize(&project_root, r)))
                .collect();
            zones.push(Zone {
                kind: def.kind.unwrap_or_else(|| def.name.clone()),
                name: def.name,
                roots,
            });
        }

        let mut matchers = Vec::new();
        for (zone_index, zone) in zones.iter().enumerate() {
            for root in &zone.roots {
                matchers.push(RootMatcher {
                    zone_index,
                    root: root.clone(),
                    key: match_key(root),
                    depth: root.components().count(),
                });
            }
        }
        matchers.sort_by(|a, b| b.key.len().cmp(&a.key.len()));

        Ok(Self {
            zones,
            project_root: lexical_normalize(&project_root),
            matchers,
        })
    }

    /// Single `frontend` zone rooted at `frontend_root`.
    pub fn single_frontend(frontend_root: PathBuf) -> Self {
        let root = lexical_normalize(&frontend_root);
        let zone = Zone {
            name: "frontend".to_string(),
            kind: "frontend".to_string(),
            roots: vec![root.clone()],
        };
        let matchers = vec![RootMatcher {
            zone_index: 0,
            key: match_key(&root),
            depth: root.components().count(),
            root: root.clone(),
        }];
        Self {
            zones: vec![zone],
            project_root: root,
            matchers,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn get_zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn get_zone(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.name == name)
    }

    /// Zone roots as strings, for persisting alongside snapshots and baselines.
    pub fn get_zone_roots(&self) -> BTreeMap<String, Vec<String>> {
        self.zones
            .iter()
            .map(|z| {
                (
                    z.name.clone(),
                    z.roots.iter().map(|r| r.display().to_string()).collect(),
                )
            })
            .collect()
    }

    /// Zones selected by kind and/or name. No filter selects every zone.
    pub fn select_zones(&self, kinds: Option<&[String]>, names: Option<&[String]>) -> Vec<&Zone> {
        self.zones
            .iter()
            .filter(|z| kinds.map_or(true, |k| k.iter().any(|k| *k == z.kind)))
            .filter(|z| names.map_or(true, |n| n.iter().any(|n| *n == z.name)))
            .collect()
    }

    /// Classify a path. Relative paths are resolved against the project root.
    /// Returns `None` when the path is outside every zone root.
    pub fn classify_path(&self, path: &Path) -> Option<PathClassification> {
        let absolute = lexical_normalize(&absolutize(&self.project_root, path));
        let key = match_key(&absolute);

        let matcher = self
            .matchers
            .iter()
            .find(|m| key_is_within(&key, &m.key))?;
        let zone = &self.zones[matcher.zone_index];

        let zone_relative_path = absolute
            .components()
            .skip(matcher.depth)
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");

        let virtual_path = if zone_relative_path.is_empty() {
            zone.name.clone()
        } else {
            format!("{}/{}", zone.name, zone_relative_path)
        };

        let project_key = match_key(&self.project_root);
        let project_relative_path = if key_is_within(&key, &project_key) {
            Some(
                absolute
                    .components()
                    .skip(self.project_root.components().count())
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/"),
            )
        } else {
            None
        };

        Some(PathClassification {
            zone: zone.name.clone(),
            zone_kind: zone.kind.clone(),
            root: matcher.root.clone(),
            zone_relative_path,
            project_relative_path,
            virtual_path,
            absolute_path: absolute,
        })
    }

    /// Split a virtual path into its zone and zone-relative part.
    pub fn parse_virtual_path<'a>(&self, virtual_path: &'a str) -> Option<(&Zone, &'a str)> {
        let (zone_name, rest) = match virtual_path.split_once('/') {
            Some((z, r)) => (z, r),
            None => (virtual_path, ""),
        };
        self.get_zone(zone_name).map(|z| (z, rest))
    }

    /// Absolute location for a virtual path: the first root of its zone where
    /// the file exists, else the zone's first root.
    pub fn resolve_virtual_path(&self, virtual_path: &str) -> Option<PathBuf> {
        let (zone, rest) = self.parse_virtual_path(virtual_path)?;
        let candidates: Vec<PathBuf> = zone.roots.iter().map(|r| join_relative(r, rest)).collect();
        candidates
            .iter()
            .find(|c| c.exists())
            .cloned()
            .or_else(|| candidates.into_iter().next())
    }

    /// Normalize caller-supplied subset paths into virtual path prefixes.
    ///
    /// Accepts absolute paths, virtual paths (`frontend/src/App.tsx`) and
    /// project-relative paths. Entries that fall outside every zone are
    /// dropped.
    pub fn resolve_subset(&self, subset: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for raw in subset {
            let resolved = if Path::new(raw).is_absolute() {
                self.classify_path(Path::new(raw)).map(|c| c.virtual_path)
            } else if let Some((zone, rest)) = self.parse_virtual_path(&raw.replace('\\', "/")) {
                if rest.is_empty() {
                    Some(zone.name.clone())
                } else {
                    sanitize_relative_path(rest)
                        .ok()
                        .map(|r| format!("{}/{}", zone.name, r))
                }
            } else {
                sanitize_relative_path(raw)
                    .ok()
                    .and_then(|r| self.classify_path(&join_relative(&self.project_root, &r)))
                    .map(|c| c.virtual_path)
            };

            if let Some(vp) = resolved {
                if !out.contains(&vp) {
                    out.push(vp);
                }
            }
        }
        out
    }
}

/// True when `virtual_path` equals or lies under one of `prefixes`.
pub fn matches_subset(virtual_path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| {
        virtual_path == p
            || (virtual_path.len() > p.len()
                && virtual_path.starts_with(p.as_str())
                && virtual_path.as_bytes()[p.len()] == b'/')
    })
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn match_key(path: &Path) -> String {
    let unified = path.to_string_lossy().replace('\\', "/");
    let trimmed = if unified.len() > 1 {
        unified.trim_end_matches('/').to_string()
    } else {
        unified
    };
    if CASE_INSENSITIVE_PATHS {
        trimmed.to_lowercase()
    } else {
        trimmed
    }
}

fn key_is_within(key: &str, root_key: &str) -> bool {
    if root_key == "/" {
        return key.starts_with('/');
    }
    key == root_key
        || (key.len() > root_key.len()
            && key.starts_with(root_key)
            && key.as_bytes()[root_key.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ZoneManager {
        ZoneManager::new(
            PathBuf::from("/proj"),
            vec![
                ZoneDefinition {
                    name: "workspace".into(),
                    kind: None,
                    roots: vec![PathBuf::from("/proj")],
                },
                ZoneDefinition {
                    name: "frontend".into(),
                    kind: Some("source".into()),
                    roots: vec![PathBuf::from("/proj/frontend")],
                },
                ZoneDefinition {
                    name: "electron".into(),
                    kind: Some("source".into()),
                    roots: vec![PathBuf::from("electron")],
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_longest_root_wins() {
        let zm = manager();
        let c = zm
            .classify_path(Path::new("/proj/frontend/src/App.tsx"))
            .unwrap();
        assert_eq!(c.zone, "frontend");
        assert_eq!(c.zone_kind, "source");
        assert_eq!(c.zone_relative_path, "src/App.tsx");
        assert_eq!(c.virtual_path, "frontend/src/App.tsx");
        assert_eq!(c.project_relative_path.as_deref(), Some("frontend/src/App.tsx"));

        let c = zm.classify_path(Path::new("/proj/README.md")).unwrap();
        assert_eq!(c.zone, "workspace");
        assert_eq!(c.virtual_path, "workspace/README.md");
    }

    #[test]
    fn test_relative_roots_and_paths_resolve_against_project() {
        let zm = manager();
        let c = zm.classify_path(Path::new("electron/main.ts")).unwrap();
        assert_eq!(c.virtual_path, "electron/main.ts");
        assert_eq!(c.absolute_path, PathBuf::from("/proj/electron/main.ts"));
    }

    #[test]
    fn test_outside_every_zone() {
        let zm = manager();
        assert!(zm.classify_path(Path::new("/other/file.txt")).is_none());
        // sibling sharing a name prefix is not inside the root
        assert!(zm.classify_path(Path::new("/project/file.txt")).is_none());
    }

    #[test]
    fn test_dot_segments_are_normalized() {
        let zm = manager();
        let c = zm
            .classify_path(Path::new("/proj/frontend/src/../lib/./x.ts"))
            .unwrap();
        assert_eq!(c.virtual_path, "frontend/lib/x.ts");
    }

    #[test]
    fn test_select_zones() {
        let zm = manager();
        let kinds = vec!["source".to_string()];
        let names: Vec<&str> = zm
            .select_zones(Some(&kinds), None)
            .iter()
            .map(|z| z.name.as_str())
            .collect();
        assert_eq!(names, vec!["frontend", "electron"]);

        let only = vec!["electron".to_string()];
        assert_eq!(zm.select_zones(Some(&kinds), Some(&only)).len(), 1);
        assert_eq!(zm.select_zones(None, None).len(), 3);
    }

    #[test]
    fn test_duplicate_zone_rejected() {
        let def = ZoneDefinition {
            name: "a".into(),
            kind: None,
            roots: vec![PathBuf::from("/x")],
        };
        assert!(ZoneManager::new(PathBuf::from("/"), vec![def.clone(), def]).is_err());
    }

    #[test]
    fn test_resolve_subset_and_matching() {
        let zm = manager();
        let subset = zm.resolve_subset(&[
            "/proj/frontend/src".to_string(),
            "electron/main.ts".to_string(),
            "frontend/src".to_string(),
            "/elsewhere/x".to_string(),
        ]);
        assert_eq!(subset, vec!["frontend/src", "electron/main.ts"]);

        assert!(matches_subset("frontend/src/App.tsx", &subset));
        assert!(matches_subset("frontend/src", &subset));
        assert!(!matches_subset("frontend/srcx/App.tsx", &subset));
        assert!(!matches_subset("electron/main.tsx", &subset));
    }

    #[test]
    fn test_zone_roots_for_metadata() {
        let zm = manager();
        let roots = zm.get_zone_roots();
        assert_eq!(roots["frontend"], vec!["/proj/frontend".to_string()]);
    }
}
