use std::fmt;

use crate::common::ObjectId;
use crate::error::{DbError, Result};

const TEMPORARY_PREFIX: &str = "temp";
const TABLE_PREFIX: &str = "table";
const INDEX_PREFIX: &str = "index";

/// Name of a persisted map. The kind and owner id are encoded as `<kind>.<n>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MapName {
    /// Session scoped scratch map, never recovered. Holds the text after `temp.`,
    /// which is a sequence number for the maps this engine names itself.
    Temporary(String),
    Table(ObjectId),
    Index(ObjectId),
    Other(String),
}

impl MapName {
    pub fn parse(name: &str) -> Result<Self> {
        let Some((prefix, suffix)) = name.split_once('.') else {
            return Ok(MapName::Other(name.to_owned()));
        };
        let invalid = |reason: String| DbError::InvalidMapName {
            name: name.to_owned(),
            reason,
        };
        match prefix {
            TEMPORARY_PREFIX => Ok(MapName::Temporary(suffix.to_owned())),
            TABLE_PREFIX => suffix
                .parse()
                .map(MapName::Table)
                .map_err(|e| invalid(e.to_string())),
            INDEX_PREFIX => suffix
                .parse()
                .map(MapName::Index)
                .map_err(|e| invalid(e.to_string())),
            _ => Ok(MapName::Other(name.to_owned())),
        }
    }

    pub fn temporary(sequence: u64) -> Self {
        MapName::Temporary(sequence.to_string())
    }

    /// Sequence number of a temporary map named by [`MapName::temporary`].
    pub fn sequence(&self) -> Option<u64> {
        match self {
            MapName::Temporary(suffix) => suffix.parse().ok(),
            _ => None,
        }
    }

    /// Id of the catalog object owning the map.
    pub fn owner(&self) -> Option<ObjectId> {
        match self {
            MapName::Table(id) | MapName::Index(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, MapName::Temporary(_))
    }
}

impl fmt::Display for MapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapName::Temporary(suffix) => write!(f, "{TEMPORARY_PREFIX}.{suffix}"),
            MapName::Table(id) => write!(f, "{TABLE_PREFIX}.{id}"),
            MapName::Index(id) => write!(f, "{INDEX_PREFIX}.{id}"),
            MapName::Other(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MapName;
    use crate::error::DbError;

    #[test]
    fn parse_known_kinds() {
        assert_eq!(MapName::parse("temp.3").unwrap(), MapName::temporary(3));
        assert_eq!(MapName::parse("table.5").unwrap(), MapName::Table(5));
        assert_eq!(MapName::parse("index.9").unwrap(), MapName::Index(9));
        assert_eq!(
            MapName::parse("transaction.log").unwrap(),
            MapName::Other("transaction.log".to_owned())
        );
        assert_eq!(
            MapName::parse("meta").unwrap(),
            MapName::Other("meta".to_owned())
        );
    }

    #[test]
    fn display_inverts_parse() {
        for name in ["temp.0", "temp.session-7", "table.17", "index.4294967295", "undo.log"] {
            assert_eq!(MapName::parse(name).unwrap().to_string(), name);
        }
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for name in ["table.", "table.-1", "index.x", "table.5.data"] {
            assert!(
                matches!(MapName::parse(name), Err(DbError::InvalidMapName { .. })),
                "{name}"
            );
        }
    }

    #[test]
    fn any_temp_suffix_is_temporary() {
        for name in ["temp.session-7", "temp.", "temp.1.2"] {
            let map = MapName::parse(name).unwrap();
            assert!(map.is_temporary(), "{name}");
            assert_eq!(map.sequence(), None);
        }
        assert_eq!(MapName::parse("temp.12").unwrap().sequence(), Some(12));
    }

    #[test]
    fn owner_of_catalog_maps() {
        assert_eq!(MapName::Table(5).owner(), Some(5));
        assert_eq!(MapName::Index(9).owner(), Some(9));
        assert_eq!(MapName::temporary(9).owner(), None);
        assert!(MapName::temporary(0).is_temporary());
    }
}
