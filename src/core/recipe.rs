//! Recipe tree reader
//!
//! Walks a recipe tree laid out `<root>/<category>/<name>/recipe.toml` and
//! produces the flat list of dependency records the graph is built from.
//! A recipe that fails to parse is reported and recorded as broken rather
//! than aborting the load; the scheduler marks it failed before dispatch.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::defaults;
use crate::core::package::PackageId;
use crate::error::RecipeError;

/// One parsed build recipe
#[derive(Debug, Clone)]
pub struct RecipeRecord {
    /// Package identity
    pub id: PackageId,
    /// Build-time dependencies, in declaration order
    pub build_depends: Vec<PackageId>,
    /// Run-time dependencies, in declaration order
    pub run_depends: Vec<PackageId>,
    /// Build command line
    pub command: String,
    /// Recipe file this record came from
    pub path: PathBuf,
}

/// A recipe that could not be parsed
///
/// Identity is derived from the file's position in the tree so the package
/// can still be named in the final report.
#[derive(Debug, Clone)]
pub struct BrokenRecipe {
    /// Path-derived identity
    pub id: PackageId,
    /// Parse error text
    pub error: String,
    /// Recipe file that failed
    pub path: PathBuf,
}

/// Result of loading a recipe tree
#[derive(Debug, Default)]
pub struct RecipeSet {
    /// Successfully parsed recipes, in tree order
    pub records: Vec<RecipeRecord>,
    /// Recipes that failed to parse
    pub broken: Vec<BrokenRecipe>,
}

impl RecipeSet {
    /// Total number of recipes found, parsed or not
    pub fn len(&self) -> usize {
        self.records.len() + self.broken.len()
    }

    /// Whether the tree contained no recipes at all
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.broken.is_empty()
    }

    /// Fingerprint of the recipe set
    ///
    /// SHA256 over the canonicalized records, sorted by identity. Any
    /// change to identities, dependencies, or build commands changes the
    /// fingerprint and invalidates prior ledger state.
    pub fn fingerprint(&self) -> String {
        let mut lines: Vec<String> = self
            .records
            .iter()
            .map(|r| {
                format!(
                    "{}\x00build={}\x00run={}\x00cmd={}",
                    r.id,
                    join_ids(&r.build_depends),
                    join_ids(&r.run_depends),
                    r.command
                )
            })
            .collect();
        lines.extend(self.broken.iter().map(|b| format!("{}\x00broken", b.id)));
        lines.sort();

        let mut hasher = Sha256::new();
        for line in &lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// On-disk recipe schema
#[derive(Debug, Deserialize)]
struct RecipeFile {
    package: PackageSection,
    #[serde(default)]
    depends: DependsSection,
    build: BuildSection,
}

#[derive(Debug, Deserialize)]
struct PackageSection {
    category: String,
    name: String,
    flavor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DependsSection {
    #[serde(default)]
    build: Vec<String>,
    #[serde(default)]
    run: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BuildSection {
    command: String,
}

/// Load every recipe under `root`
///
/// Returns a hard error only for conditions that make the whole set
/// unusable: a missing root, an unreadable tree, or two recipes claiming
/// the same identity. Individual parse failures land in `broken`.
pub fn load_recipes(root: &Path) -> Result<RecipeSet, RecipeError> {
    if !root.is_dir() {
        return Err(RecipeError::RootNotFound {
            path: root.to_path_buf(),
        });
    }

    let mut set = RecipeSet::default();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| RecipeError::ScanFailed {
            path: root.to_path_buf(),
            error: e.to_string(),
        })?;
        if !entry.file_type().is_file() || entry.file_name() != defaults::RECIPE_FILE {
            continue;
        }

        let path = entry.path();
        match parse_recipe(path) {
            Ok(record) => {
                let duplicate = set.records.iter().any(|r| r.id == record.id);
                if duplicate {
                    return Err(RecipeError::DuplicateIdentity {
                        identity: record.id.to_string(),
                        path: path.to_path_buf(),
                    });
                }
                set.records.push(record);
            }
            Err(error) => {
                let id = path_identity(root, path);
                tracing::warn!(
                    recipe = %path.display(),
                    package = %id,
                    %error,
                    "recipe failed to parse; package will be marked failed"
                );
                set.broken.push(BrokenRecipe {
                    id,
                    error: error.to_string(),
                    path: path.to_path_buf(),
                });
            }
        }
    }

    Ok(set)
}

/// Parse a single recipe file
fn parse_recipe(path: &Path) -> Result<RecipeRecord, RecipeError> {
    let content = std::fs::read_to_string(path).map_err(|e| RecipeError::ParseError {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;

    let file: RecipeFile = toml::from_str(&content).map_err(|e| RecipeError::ParseError {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;

    let id = match file.package.flavor {
        Some(ref flavor) => {
            PackageId::with_flavor(&file.package.category, &file.package.name, flavor)
        }
        None => PackageId::new(&file.package.category, &file.package.name),
    };
    if file.package.category.is_empty() || file.package.name.is_empty() {
        return Err(RecipeError::InvalidIdentity {
            identity: id.to_string(),
            reason: "empty category or name".to_string(),
        });
    }

    if file.build.command.trim().is_empty() {
        return Err(RecipeError::ParseError {
            path: path.to_path_buf(),
            error: "build command is empty".to_string(),
        });
    }

    let build_depends = parse_ids(&file.depends.build)?;
    let run_depends = parse_ids(&file.depends.run)?;

    Ok(RecipeRecord {
        id,
        build_depends,
        run_depends,
        command: file.build.command,
        path: path.to_path_buf(),
    })
}

fn parse_ids(raw: &[String]) -> Result<Vec<PackageId>, RecipeError> {
    raw.iter().map(|s| s.parse()).collect()
}

/// Derive an identity from a recipe file's position in the tree
///
/// Used when the file itself is unreadable: `<root>/<cat>/<name>/recipe.toml`
/// yields `cat/name`. Files at unexpected depths fall back to the "broken"
/// category so they still appear in the report.
fn path_identity(root: &Path, path: &Path) -> PackageId {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut components: Vec<&str> = relative
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    components.pop(); // drop the file name

    match components.as_slice() {
        [category, name] => PackageId::new(category, name),
        [name] => PackageId::new("broken", name),
        _ => PackageId::new("broken", &relative.display().to_string().replace('/', "_")),
    }
}

fn join_ids(ids: &[PackageId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
