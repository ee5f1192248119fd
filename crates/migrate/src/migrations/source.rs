//! Migration Sources - Where migration units come from
//!
//! A [`MigrationSource`] lists the available unit keys and loads a unit by key
//! without touching the database. [`load_catalogue`] reads a whole source into
//! a validated [`Catalogue`] the engine can walk in either direction.

use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use super::definitions::{MigrationUnit, NO_MIGRATIONS_APPLIED};
use crate::error::{MigrateResult, MigrationError};

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";

/// An ordered, immutable catalogue of migration units
pub trait MigrationSource: Send + Sync {
    /// Every available unit key
    fn unit_keys(&self) -> MigrateResult<Vec<i64>>;

    /// Load the unit stored under `version`
    fn load_unit(&self, version: i64) -> MigrateResult<MigrationUnit>;
}

/// Catalogue built in code, e.g. from `include_str!` bodies
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    units: BTreeMap<i64, MigrationUnit>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source from units, rejecting duplicate versions
    pub fn from_units(units: impl IntoIterator<Item = MigrationUnit>) -> MigrateResult<Self> {
        let mut source = Self::new();
        for unit in units {
            if source.units.contains_key(&unit.version) {
                return Err(MigrationError::Catalogue(format!(
                    "migration version {} is defined more than once",
                    unit.version
                )));
            }
            source.units.insert(unit.version, unit);
        }
        Ok(source)
    }

    /// Add a unit, replacing any unit with the same version
    pub fn with_unit(mut self, unit: MigrationUnit) -> Self {
        self.units.insert(unit.version, unit);
        self
    }
}

impl MigrationSource for StaticSource {
    fn unit_keys(&self) -> MigrateResult<Vec<i64>> {
        Ok(self.units.keys().copied().collect())
    }

    fn load_unit(&self, version: i64) -> MigrateResult<MigrationUnit> {
        self.units
            .get(&version)
            .cloned()
            .ok_or(MigrationError::UnknownVersion(version))
    }
}

/// Catalogue read from `<version>_<name>.up.sql` files with optional
/// `<version>_<name>.down.sql` counterparts
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

#[derive(Debug)]
struct UnitFiles {
    name: String,
    up: Option<PathBuf>,
    down: Option<PathBuf>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new pair of migration files keyed by the current Unix
    /// timestamp. Returns the path of the up file.
    pub fn create_migration(&self, name: &str) -> MigrateResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            MigrationError::Catalogue(format!(
                "failed to create migrations directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let slug = slugify(name);
        if slug.is_empty() {
            return Err(MigrationError::Catalogue(format!(
                "migration name '{}' has no usable characters",
                name
            )));
        }

        // Two migrations created within the same second still need distinct,
        // increasing keys.
        let newest = self.scan()?.keys().next_back().copied();
        let now = Utc::now();
        let version = match newest {
            Some(newest) if newest >= now.timestamp() => newest + 1,
            _ => now.timestamp(),
        };

        let stem = format!("{}_{}", version, slug);
        let up_path = self.dir.join(format!("{}{}", stem, UP_SUFFIX));
        let down_path = self.dir.join(format!("{}{}", stem, DOWN_SUFFIX));
        let created = now.format("%Y-%m-%d %H:%M:%S UTC");

        let up_template = format!(
            "-- Migration: {}\n-- Version: {}\n-- Created: {}\n\
             -- Put the NO_TRANSACTION marker first to run the statements outside a transaction.\n\n",
            name, version, created
        );
        let down_template = format!(
            "-- Revert migration: {}\n-- Version: {}\n-- Delete this file if the migration cannot be reverted.\n\n",
            name, version
        );

        write_file(&up_path, &up_template)?;
        write_file(&down_path, &down_template)?;

        info!("Created migration {} at {}", version, up_path.display());
        Ok(up_path)
    }

    fn scan(&self) -> MigrateResult<BTreeMap<i64, UnitFiles>> {
        let mut units: BTreeMap<i64, UnitFiles> = BTreeMap::new();

        if !self.dir.exists() {
            debug!("Migrations directory {} does not exist", self.dir.display());
            return Ok(units);
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| {
            MigrationError::Catalogue(format!(
                "failed to read migrations directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| {
                MigrationError::Catalogue(format!("failed to read directory entry: {}", e))
            })?;
            let path = entry.path();

            let file_name = match path.file_name().and_then(|s| s.to_str()) {
                Some(file_name) if file_name.ends_with(".sql") => file_name.to_string(),
                _ => continue,
            };

            let (stem, is_up) = if let Some(stem) = file_name.strip_suffix(UP_SUFFIX) {
                (stem, true)
            } else if let Some(stem) = file_name.strip_suffix(DOWN_SUFFIX) {
                (stem, false)
            } else {
                return Err(MigrationError::Catalogue(format!(
                    "migration file {} must end in {} or {}",
                    file_name, UP_SUFFIX, DOWN_SUFFIX
                )));
            };

            let (version, name) = parse_stem(stem).ok_or_else(|| {
                MigrationError::Catalogue(format!(
                    "migration file {} must be named <version>_<name>{}",
                    file_name,
                    if is_up { UP_SUFFIX } else { DOWN_SUFFIX }
                ))
            })?;

            let files = units.entry(version).or_insert_with(|| UnitFiles {
                name: name.clone(),
                up: None,
                down: None,
            });

            if files.name != name {
                return Err(MigrationError::Catalogue(format!(
                    "migration version {} is used by both '{}' and '{}'",
                    version, files.name, name
                )));
            }

            let slot = if is_up { &mut files.up } else { &mut files.down };
            if slot.is_some() {
                return Err(MigrationError::Catalogue(format!(
                    "migration version {} is defined more than once",
                    version
                )));
            }
            *slot = Some(path);
        }

        if let Some((version, _)) = units.iter().find(|(_, files)| files.up.is_none()) {
            return Err(MigrationError::Catalogue(format!(
                "migration version {} has a down file but no up file",
                version
            )));
        }

        Ok(units)
    }
}

impl MigrationSource for DirectorySource {
    fn unit_keys(&self) -> MigrateResult<Vec<i64>> {
        Ok(self.scan()?.into_keys().collect())
    }

    fn load_unit(&self, version: i64) -> MigrateResult<MigrationUnit> {
        let mut units = self.scan()?;
        let files = units
            .remove(&version)
            .ok_or(MigrationError::UnknownVersion(version))?;

        let up_path = files
            .up
            .ok_or(MigrationError::UnknownVersion(version))?;
        let down_sql = files.down.as_deref().map(read_file).transpose()?;

        Ok(MigrationUnit {
            version,
            name: files.name,
            up_sql: read_file(&up_path)?,
            down_sql,
        })
    }
}

/// A validated, ordered set of migration units
#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    units: BTreeMap<i64, MigrationUnit>,
}

impl Catalogue {
    pub fn get(&self, version: i64) -> Option<&MigrationUnit> {
        self.units.get(&version)
    }

    pub fn contains(&self, version: i64) -> bool {
        self.units.contains_key(&version)
    }

    /// Highest key, or [`NO_MIGRATIONS_APPLIED`] for an empty catalogue
    pub fn latest_version(&self) -> i64 {
        self.units
            .keys()
            .next_back()
            .copied()
            .unwrap_or(NO_MIGRATIONS_APPLIED)
    }

    /// Units with a key strictly greater than `version`, ascending
    pub fn after(&self, version: i64) -> impl Iterator<Item = &MigrationUnit> {
        self.units
            .range((Bound::Excluded(version), Bound::Unbounded))
            .map(|(_, unit)| unit)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationUnit> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Read every unit from `source` and validate the catalogue: keys are
/// strictly positive and unique, and each unit carries the key it was
/// listed under.
pub fn load_catalogue(source: &dyn MigrationSource) -> MigrateResult<Catalogue> {
    let mut units = BTreeMap::new();

    for version in source.unit_keys()? {
        if version <= NO_MIGRATIONS_APPLIED {
            return Err(MigrationError::Catalogue(format!(
                "migration version {} must be a positive integer",
                version
            )));
        }

        if units.contains_key(&version) {
            return Err(MigrationError::Catalogue(format!(
                "migration version {} is listed more than once",
                version
            )));
        }

        let unit = source.load_unit(version)?;
        if unit.version != version {
            return Err(MigrationError::Catalogue(format!(
                "migration listed as {} declares version {}",
                version, unit.version
            )));
        }

        units.insert(version, unit);
    }

    debug!("Loaded {} migration units", units.len());
    Ok(Catalogue { units })
}

fn parse_stem(stem: &str) -> Option<(i64, String)> {
    let (version, name) = stem.split_once('_')?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) || name.is_empty() {
        return None;
    }
    Some((version.parse().ok()?, name.to_string()))
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

fn read_file(path: &Path) -> MigrateResult<String> {
    fs::read_to_string(path).map_err(|e| {
        MigrationError::Catalogue(format!(
            "failed to read migration file {}: {}",
            path.display(),
            e
        ))
    })
}

fn write_file(path: &Path, content: &str) -> MigrateResult<()> {
    fs::write(path, content).map_err(|e| {
        MigrationError::Catalogue(format!(
            "failed to write migration file {}: {}",
            path.display(),
            e
        ))
    })
}
