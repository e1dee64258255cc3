//! Collaborators the worker reads from: the ordered table list and the
//! fallback assets. Both are read-only and must be usable from the worker
//! process (they are inherited across `fork`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use log::{debug, info};
use serde::Deserialize;

/// Which screen of a cabinet an image is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenRole {
    #[default]
    Table,
    Backglass,
    Dmd,
}

impl ScreenRole {
    /// File stem looked up inside a table directory.
    pub fn file_stem(self) -> &'static str {
        match self {
            ScreenRole::Table => "table",
            ScreenRole::Backglass => "bg",
            ScreenRole::Dmd => "dmd",
        }
    }
}

impl fmt::Display for ScreenRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScreenRole::Table => "table",
            ScreenRole::Backglass => "backglass",
            ScreenRole::Dmd => "dmd",
        })
    }
}

impl FromStr for ScreenRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(ScreenRole::Table),
            "backglass" | "bg" => Ok(ScreenRole::Backglass),
            "dmd" => Ok(ScreenRole::Dmd),
            other => Err(format!("unknown screen role '{other}' (expected table, backglass, dmd)")),
        }
    }
}

/// Read-only ordered list of tables. Indices are `0..count()`.
pub trait TableList: Send {
    fn count(&self) -> usize;

    /// Image path for `index` on the given screen, `None` when out of range.
    /// The path need not exist; a missing file is a decode failure.
    fn image_path_for(&self, index: usize, role: ScreenRole) -> Option<PathBuf>;
}

/// A fixed list of image paths, one per table, shared by every role.
impl TableList for Vec<PathBuf> {
    fn count(&self) -> usize {
        self.len()
    }

    fn image_path_for(&self, index: usize, _role: ScreenRole) -> Option<PathBuf> {
        self.get(index).cloned()
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];

/// Tables discovered as the subdirectories of a root, sorted by name.
///
/// Each table directory holds one image per role, e.g. `table.png`, `bg.jpg`,
/// `dmd.png`.
#[derive(Debug, Clone)]
pub struct DirectoryTables {
    root: PathBuf,
    tables: Vec<PathBuf>,
}

impl DirectoryTables {
    pub fn scan(root: &Path) -> anyhow::Result<Self> {
        let mut tables = Vec::new();
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("failed to read tables directory {}", root.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                tables.push(entry.path());
            }
        }
        tables.sort();
        info!("tables: found {} table(s) under {}", tables.len(), root.display());
        Ok(Self {
            root: root.to_path_buf(),
            tables,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Display name (directory name) of a table.
    pub fn name(&self, index: usize) -> Option<&str> {
        self.tables.get(index)?.file_name()?.to_str()
    }
}

impl TableList for DirectoryTables {
    fn count(&self) -> usize {
        self.tables.len()
    }

    fn image_path_for(&self, index: usize, role: ScreenRole) -> Option<PathBuf> {
        let dir = self.tables.get(index)?;
        let stem = role.file_stem();
        let found = IMAGE_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{stem}.{ext}")))
            .find(|p| p.is_file());
        if found.is_none() {
            debug!("tables: no {role} image in {}", dir.display());
        }
        Some(found.unwrap_or_else(|| dir.join(format!("{stem}.png"))))
    }
}

/// Placeholder and logo images.
pub trait FallbackAssets: Send {
    fn missing_image(&self) -> &Path;
    fn logo(&self) -> &Path;
}

#[derive(Debug, Clone)]
pub struct AssetPaths {
    pub missing_image: PathBuf,
    pub logo: PathBuf,
}

impl FallbackAssets for AssetPaths {
    fn missing_image(&self) -> &Path {
        &self.missing_image
    }

    fn logo(&self) -> &Path {
        &self.logo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn role_parse() {
        assert_eq!("table".parse::<ScreenRole>().unwrap(), ScreenRole::Table);
        assert_eq!("BG".parse::<ScreenRole>().unwrap(), ScreenRole::Backglass);
        assert_eq!("dmd".parse::<ScreenRole>().unwrap(), ScreenRole::Dmd);
        assert!("topper".parse::<ScreenRole>().is_err());
    }

    #[test]
    fn role_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrap {
            role: ScreenRole,
        }
        let w: Wrap = toml::from_str(r#"role = "backglass""#).unwrap();
        assert_eq!(w.role, ScreenRole::Backglass);
    }

    #[test]
    fn directory_scan_sorted_and_role_lookup() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Medieval Madness", "Addams Family", "Twilight Zone"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("stray.txt"), "not a table").unwrap();
        fs::write(dir.path().join("Addams Family").join("bg.jpg"), b"jpg").unwrap();

        let tables = DirectoryTables::scan(dir.path()).unwrap();
        assert_eq!(tables.count(), 3);
        assert_eq!(tables.name(0), Some("Addams Family"));
        assert_eq!(tables.name(2), Some("Twilight Zone"));

        let bg = tables.image_path_for(0, ScreenRole::Backglass).unwrap();
        assert!(bg.ends_with("Addams Family/bg.jpg"));

        // Missing image still yields a path; decoding it fails later.
        let table = tables.image_path_for(1, ScreenRole::Table).unwrap();
        assert!(table.ends_with("Medieval Madness/table.png"));

        assert!(tables.image_path_for(3, ScreenRole::Table).is_none());
    }

    #[test]
    fn scan_missing_root_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DirectoryTables::scan(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn vec_list_ignores_role() {
        let list = vec![PathBuf::from("a.png"), PathBuf::from("b.png")];
        assert_eq!(list.count(), 2);
        assert_eq!(
            list.image_path_for(1, ScreenRole::Dmd),
            Some(PathBuf::from("b.png"))
        );
        assert_eq!(list.image_path_for(2, ScreenRole::Table), None);
    }
}
