//! Static town reference table and the per-source key spaces resolved against it.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TownId;

pub const STATE_FIPS: &str = "34";

const BUNDLED_TOWNS: &str = include_str!("../towns.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum County {
    Bergen,
    Essex,
    Hudson,
}

impl County {
    pub const ALL: [County; 3] = [County::Bergen, County::Hudson, County::Essex];

    pub fn fips(self) -> &'static str {
        match self {
            County::Bergen => "003",
            County::Essex => "013",
            County::Hudson => "017",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            County::Bergen => "Bergen",
            County::Essex => "Essex",
            County::Hudson => "Hudson",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Town {
    pub id: TownId,
    pub name_en: String,
    pub county: County,
    /// Five-digit Census county subdivision code.
    pub cousub: String,
    #[serde(default)]
    pub redfin_name: Option<String>,
    #[serde(default)]
    pub zillow_name: Option<String>,
}

impl Town {
    /// County code followed by county subdivision code, as the Census API reports them.
    pub fn fips_key(&self) -> String {
        format!("{}{}", self.county.fips(), self.cousub)
    }
}

/// Naming convention a lookup key comes from. Each space is an independent map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    Fips,
    Name,
    Redfin,
    Zillow,
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KeySpace::Fips => "fips",
            KeySpace::Name => "name",
            KeySpace::Redfin => "redfin",
            KeySpace::Zillow => "zillow",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading town table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing town table: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate town id {0}")]
    DuplicateId(TownId),
    #[error("duplicate {space} key {key:?} ({first} and {second})")]
    DuplicateKey {
        space: KeySpace,
        key: String,
        first: TownId,
        second: TownId,
    },
}

/// Lookup seam used by the transform stages; tests substitute reduced or counting doubles.
pub trait TownResolver: Send + Sync {
    fn resolve(&self, space: KeySpace, key: &str) -> Option<&TownId>;

    fn knows(&self, id: &str) -> bool;
}

#[derive(Debug, Deserialize)]
struct TownTable {
    towns: Vec<Town>,
}

/// Immutable registry built once per process.
#[derive(Debug, Clone)]
pub struct TownRegistry {
    towns: Vec<Town>,
    by_id: HashMap<TownId, usize>,
    keys: HashMap<KeySpace, HashMap<String, TownId>>,
}

/// Trim, case-fold and collapse internal whitespace of a name-based key.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalize_key(space: KeySpace, raw: &str) -> String {
    match space {
        KeySpace::Fips => raw.trim().to_string(),
        KeySpace::Name | KeySpace::Redfin | KeySpace::Zillow => normalize_name(raw),
    }
}

impl TownRegistry {
    /// The 104 Bergen, Hudson and Essex municipalities shipped with the crate.
    pub fn bundled() -> Result<Self, RegistryError> {
        Self::from_yaml_str(BUNDLED_TOWNS)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RegistryError> {
        let table: TownTable = serde_yaml::from_str(text)?;
        Self::from_towns(table.towns)
    }

    pub fn from_towns(towns: Vec<Town>) -> Result<Self, RegistryError> {
        let mut by_id = HashMap::with_capacity(towns.len());
        let mut keys: HashMap<KeySpace, HashMap<String, TownId>> = HashMap::new();

        for (index, town) in towns.iter().enumerate() {
            if by_id.insert(town.id.clone(), index).is_some() {
                return Err(RegistryError::DuplicateId(town.id.clone()));
            }
            let entries = [
                (KeySpace::Fips, town.fips_key()),
                (KeySpace::Name, town.name_en.clone()),
                (
                    KeySpace::Redfin,
                    town.redfin_name.clone().unwrap_or_else(|| town.name_en.clone()),
                ),
                (
                    KeySpace::Zillow,
                    town.zillow_name.clone().unwrap_or_else(|| town.name_en.clone()),
                ),
            ];
            for (space, raw) in entries {
                let key = normalize_key(space, &raw);
                let map = keys.entry(space).or_default();
                if let Some(existing) = map.get(&key) {
                    return Err(RegistryError::DuplicateKey {
                        space,
                        key,
                        first: existing.clone(),
                        second: town.id.clone(),
                    });
                }
                map.insert(key, town.id.clone());
            }
        }

        Ok(Self { towns, by_id, keys })
    }

    pub fn towns(&self) -> &[Town] {
        &self.towns
    }

    pub fn len(&self) -> usize {
        self.towns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.towns.is_empty()
    }

    pub fn town(&self, id: &str) -> Option<&Town> {
        self.by_id
            .get(&TownId::new(id))
            .and_then(|index| self.towns.get(*index))
    }
}

impl TownResolver for TownRegistry {
    fn resolve(&self, space: KeySpace, key: &str) -> Option<&TownId> {
        self.keys.get(&space)?.get(&normalize_key(space, key))
    }

    fn knows(&self, id: &str) -> bool {
        self.by_id.contains_key(&TownId::new(id))
    }
}
