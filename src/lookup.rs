//! Product reference data.
//!
//! The table is loaded once at startup and only read afterwards, so a plain
//! `HashMap` shared by reference is enough for any number of workers.

use crate::error::EnrichError;

use log::{debug, info, warn};

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Resolves a product id to its display name.
pub trait Lookup: Sync {
    fn lookup(&self, product_id: &str) -> Option<&str>;
}

impl Lookup for HashMap<String, String> {
    fn lookup(&self, product_id: &str) -> Option<&str> {
        self.get(product_id).map(String::as_str)
    }
}

/// `product_id -> product_name` table read from a two column CSV file.
#[derive(Debug, Default, Clone)]
pub struct ProductRegistry {
    names: HashMap<String, String>,
}

impl ProductRegistry {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, EnrichError> {
        let path = path.as_ref();
        let reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)?;
        let registry = Self::from_csv(reader)?;
        info!(
            "loaded {} products from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Reads `id,name` rows after a header row. Names follow CSV quoting; an
    /// unquoted name is everything after the first comma. Rows without a name
    /// are skipped.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, EnrichError> {
        let reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);
        Self::from_csv(reader)
    }

    fn from_csv<R: Read>(mut reader: csv::Reader<R>) -> Result<Self, EnrichError> {
        let mut names = HashMap::new();

        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(e) if e.is_io_error() => return Err(e.into()),
                Err(e) => {
                    warn!("skipping unreadable product row: {}", e);
                    continue;
                }
            };

            if record.len() < 2 {
                warn!("invalid product row: {:?}", record);
                continue;
            }

            let id = record[0].to_string();
            let name = record.iter().skip(1).collect::<Vec<_>>().join(",");
            if let Some(previous) = names.insert(id.clone(), name) {
                debug!("product {} redefined, replacing {:?}", id, previous);
            }
        }

        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Lookup for ProductRegistry {
    fn lookup(&self, product_id: &str) -> Option<&str> {
        self.names.lookup(product_id)
    }
}

impl From<HashMap<String, String>> for ProductRegistry {
    fn from(names: HashMap<String, String>) -> Self {
        Self { names }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_rows_after_header() {
        let csv = "product_id,product_name\n1,Treasury Bills Domestic\n2,Corporate Bonds Domestic\n";
        let registry = ProductRegistry::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("1"), Some("Treasury Bills Domestic"));
        assert_eq!(registry.lookup("2"), Some("Corporate Bonds Domestic"));
        assert_eq!(registry.lookup("product_id"), None);
        assert_eq!(registry.lookup("3"), None);
    }

    #[test]
    fn test_skips_rows_without_name() {
        let csv = "product_id,product_name\n7\n8,REPO Domestic\n";
        let registry = ProductRegistry::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("7"), None);
        assert_eq!(registry.lookup("8"), Some("REPO Domestic"));
    }

    #[test]
    fn test_name_keeps_unquoted_commas() {
        let csv = "product_id,product_name\n4,Bonds, Foreign\n";
        let registry = ProductRegistry::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(registry.lookup("4"), Some("Bonds, Foreign"));
    }

    #[test]
    fn test_quoted_name_is_unquoted() {
        let csv = "product_id,product_name\n5,\"Bonds, Foreign\"\n6,\"Say \"\"Hi\"\"\"\n";
        let registry = ProductRegistry::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(registry.lookup("5"), Some("Bonds, Foreign"));
        assert_eq!(registry.lookup("6"), Some("Say \"Hi\""));
    }

    #[test]
    fn test_empty_table() {
        let registry = ProductRegistry::from_reader("product_id,product_name\n".as_bytes()).unwrap();
        assert!(registry.is_empty());
    }
}
