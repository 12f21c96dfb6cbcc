// 🏠 Unit Registry - the monitored population
// Static catalog loaded once at startup. Registration order is the rotation
// order, so it must be stable across runs.
//
// Identity: unit_id (never changes)
// Values: address and per-source lookup keys (correctable)

use crate::error::{CatalogError, RegistryError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

// ============================================================================
// SOURCE
// ============================================================================

/// Estimate provider. Adding a provider means adding a variant here and to `ALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Zillow,
    Redfin,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Zillow, Source::Redfin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Zillow => "zillow",
            Source::Redfin => "redfin",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .iter()
            .copied()
            .find(|source| source.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown source: {}", s))
    }
}

// ============================================================================
// UNIT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Stable identity - NEVER changes
    pub unit_id: String,

    /// Development the unit belongs to
    pub development: String,

    /// Standardized street address
    pub address: String,

    /// Per-source lookup key (listing URL or provider-internal id)
    pub lookup_keys: BTreeMap<Source, String>,
}

impl Unit {
    pub fn new(unit_id: &str, development: &str, address: &str) -> Self {
        Unit {
            unit_id: unit_id.to_string(),
            development: development.to_string(),
            address: address.to_string(),
            lookup_keys: BTreeMap::new(),
        }
    }

    pub fn with_key(mut self, source: Source, key: &str) -> Self {
        self.lookup_keys.insert(source, key.to_string());
        self
    }

    pub fn has_any_key(&self) -> bool {
        !self.lookup_keys.is_empty()
    }
}

// ============================================================================
// UNIT REGISTRY
// ============================================================================

#[derive(Debug)]
pub struct UnitRegistry {
    /// Registration order
    units: Vec<Unit>,

    /// unit_id -> position in `units`
    index: HashMap<String, usize>,
}

impl UnitRegistry {
    /// Build a registry from already-parsed units. Duplicate ids are fatal.
    pub fn from_units(units: Vec<Unit>) -> Result<Self, CatalogError> {
        if units.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut index = HashMap::with_capacity(units.len());
        for (position, unit) in units.iter().enumerate() {
            if unit.unit_id.trim().is_empty() {
                return Err(CatalogError::MalformedRow {
                    line: position as u64 + 1,
                    reason: "empty unit_id".to_string(),
                });
            }
            if index.insert(unit.unit_id.clone(), position).is_some() {
                return Err(CatalogError::DuplicateUnit {
                    unit_id: unit.unit_id.clone(),
                    line: position as u64 + 1,
                });
            }
        }

        Ok(UnitRegistry { units, index })
    }

    /// Load the catalog CSV.
    ///
    /// Required columns: `unit_id`, `development`, `address`.
    /// Lookup keys come from `<source>_key` or `<source>_url` columns
    /// (e.g. `zillow_url`, `redfin_key`); blank cells mean "no key".
    pub fn load_csv(path: &Path) -> Result<Self, CatalogError> {
        let reader = csv::Reader::from_path(path)?;
        Self::from_reader(reader)
    }

    pub fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self, CatalogError> {
        let headers = reader.headers()?.clone();
        let column = |name: &'static str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
                .ok_or(CatalogError::MissingColumn(name))
        };

        let id_col = column("unit_id")?;
        let development_col = column("development")?;
        let address_col = column("address")?;

        // Source key columns
        let key_cols: Vec<(usize, Source)> = headers
            .iter()
            .enumerate()
            .filter_map(|(i, h)| {
                let h = h.trim().to_lowercase();
                let name = h.strip_suffix("_key").or_else(|| h.strip_suffix("_url"))?;
                name.parse::<Source>().ok().map(|source| (i, source))
            })
            .collect();

        let mut units = Vec::new();
        let mut seen: HashMap<String, u64> = HashMap::new();

        for result in reader.records() {
            let record = result?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            let field = |col: usize| record.get(col).map(str::trim).unwrap_or("");

            let unit_id = field(id_col);
            if unit_id.is_empty() {
                return Err(CatalogError::MalformedRow {
                    line,
                    reason: "empty unit_id".to_string(),
                });
            }
            if seen.insert(unit_id.to_string(), line).is_some() {
                return Err(CatalogError::DuplicateUnit {
                    unit_id: unit_id.to_string(),
                    line,
                });
            }

            let address = field(address_col);
            if address.is_empty() {
                return Err(CatalogError::MalformedRow {
                    line,
                    reason: format!("unit {} has no address", unit_id),
                });
            }

            let mut unit = Unit::new(unit_id, field(development_col), address);
            for (col, source) in &key_cols {
                let key = field(*col);
                if !key.is_empty() {
                    unit.lookup_keys.insert(*source, key.to_string());
                }
            }

            units.push(unit);
        }

        let registry = Self::from_units(units)?;
        let keyless = registry.keyless_units();
        if !keyless.is_empty() {
            warn!(units = ?keyless, "units with no lookup key for any source; all their pairs will be skipped");
        }
        Ok(registry)
    }

    pub fn get(&self, unit_id: &str) -> Result<&Unit, RegistryError> {
        self.index
            .get(unit_id)
            .map(|&i| &self.units[i])
            .ok_or_else(|| RegistryError::UnknownUnit(unit_id.to_string()))
    }

    /// All units in registration order
    pub fn all(&self) -> &[Unit] {
        &self.units
    }

    pub fn unit_ids(&self) -> Vec<String> {
        self.units.iter().map(|u| u.unit_id.clone()).collect()
    }

    pub fn lookup_key(&self, unit_id: &str, source: Source) -> Result<&str, RegistryError> {
        let unit = self.get(unit_id)?;
        unit.lookup_keys
            .get(&source)
            .map(String::as_str)
            .ok_or_else(|| RegistryError::MissingSourceKey {
                unit_id: unit_id.to_string(),
                provider: source,
            })
    }

    pub fn contains(&self, unit_id: &str) -> bool {
        self.index.contains_key(unit_id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Correct a unit's lookup key (listing moved, URL fixed)
    pub fn update_key(&mut self, unit_id: &str, source: Source, key: &str) -> Result<(), RegistryError> {
        let &i = self
            .index
            .get(unit_id)
            .ok_or_else(|| RegistryError::UnknownUnit(unit_id.to_string()))?;
        self.units[i].lookup_keys.insert(source, key.to_string());
        Ok(())
    }

    pub fn update_address(&mut self, unit_id: &str, address: &str) -> Result<(), RegistryError> {
        let &i = self
            .index
            .get(unit_id)
            .ok_or_else(|| RegistryError::UnknownUnit(unit_id.to_string()))?;
        self.units[i].address = address.to_string();
        Ok(())
    }

    /// Number of units that have a key for `source`
    pub fn key_coverage(&self, source: Source) -> usize {
        self.units
            .iter()
            .filter(|u| u.lookup_keys.contains_key(&source))
            .count()
    }

    /// Units with no key for any source. They stay in the rotation and
    /// every pair comes back skipped.
    pub fn keyless_units(&self) -> Vec<&str> {
        self.units
            .iter()
            .filter(|u| !u.has_any_key())
            .map(|u| u.unit_id.as_str())
            .collect()
    }

    /// SHA-256 over the registration-ordered unit ids.
    /// The rotation cursor is an index into this order, so a changed
    /// fingerprint means a stored cursor points somewhere else now.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for unit in &self.units {
            hasher.update(unit.unit_id.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_from(csv_text: &str) -> Result<UnitRegistry, CatalogError> {
        let reader = csv::Reader::from_reader(csv_text.as_bytes());
        UnitRegistry::from_reader(reader)
    }

    #[test]
    fn test_load_catalog_with_keys() {
        let registry = registry_from(
            "unit_id,development,address,zillow_url,redfin_key\n\
             U01,Woodgate,1 Main St #1,https://z/1,rf-1\n\
             U02,Woodgate,1 Main St #2,,rf-2\n",
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.all()[0].unit_id, "U01");
        assert_eq!(registry.lookup_key("U01", Source::Zillow).unwrap(), "https://z/1");
        assert_eq!(registry.lookup_key("U02", Source::Redfin).unwrap(), "rf-2");
        assert_eq!(registry.key_coverage(Source::Zillow), 1);
        assert_eq!(registry.key_coverage(Source::Redfin), 2);
    }

    #[test]
    fn test_missing_source_key() {
        let registry = registry_from(
            "unit_id,development,address,zillow_url,redfin_url\n\
             U02,Woodgate,1 Main St #2,,https://r/2\n",
        )
        .unwrap();

        let err = registry.lookup_key("U02", Source::Zillow).unwrap_err();
        assert_eq!(
            err,
            RegistryError::MissingSourceKey {
                unit_id: "U02".to_string(),
                provider: Source::Zillow,
            }
        );
    }

    #[test]
    fn test_unknown_unit() {
        let registry = registry_from("unit_id,development,address\nU01,W,addr\n").unwrap();
        assert_eq!(
            registry.get("U99").unwrap_err(),
            RegistryError::UnknownUnit("U99".to_string())
        );
    }

    #[test]
    fn test_duplicate_unit_is_fatal() {
        let err = registry_from(
            "unit_id,development,address\n\
             U01,W,a\n\
             U01,W,b\n",
        )
        .unwrap_err();

        assert!(matches!(err, CatalogError::DuplicateUnit { ref unit_id, .. } if unit_id == "U01"));
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let err = registry_from("unit_id,address\nU01,a\n").unwrap_err();
        assert!(matches!(err, CatalogError::MissingColumn("development")));
    }

    #[test]
    fn test_blank_unit_id_is_fatal() {
        let err = registry_from("unit_id,development,address\n,W,a\n").unwrap_err();
        assert!(matches!(err, CatalogError::MalformedRow { .. }));
    }

    #[test]
    fn test_empty_catalog_is_fatal() {
        let err = registry_from("unit_id,development,address\n").unwrap_err();
        assert!(matches!(err, CatalogError::Empty));
    }

    #[test]
    fn test_key_and_address_corrections() {
        let mut registry = UnitRegistry::from_units(vec![
            Unit::new("U01", "W", "old address").with_key(Source::Redfin, "old"),
        ])
        .unwrap();

        registry.update_key("U01", Source::Redfin, "new").unwrap();
        registry.update_address("U01", "new address").unwrap();

        assert_eq!(registry.lookup_key("U01", Source::Redfin).unwrap(), "new");
        assert_eq!(registry.get("U01").unwrap().address, "new address");
        assert!(registry.update_key("U99", Source::Redfin, "x").is_err());
    }

    #[test]
    fn test_keyless_units_listed() {
        let registry = registry_from(
            "unit_id,development,address,zillow_url,redfin_url\n\
             U01,W,1 Main,https://z/1,\n\
             U02,W,2 Main,,\n\
             U03,W,3 Main,,https://r/3\n",
        )
        .unwrap();

        assert_eq!(registry.keyless_units(), vec!["U02"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_fingerprint_tracks_order() {
        let a = UnitRegistry::from_units(vec![Unit::new("A", "W", "a"), Unit::new("B", "W", "b")]).unwrap();
        let b = UnitRegistry::from_units(vec![Unit::new("B", "W", "b"), Unit::new("A", "W", "a")]).unwrap();

        assert_eq!(a.fingerprint(), a.fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_source_parse() {
        assert_eq!("Zillow".parse::<Source>().unwrap(), Source::Zillow);
        assert_eq!(" redfin ".parse::<Source>().unwrap(), Source::Redfin);
        assert!("trulia".parse::<Source>().is_err());
    }
}
