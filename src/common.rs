use std::time::Duration;

/// Id of a catalog object (table or index) owning a persistent map.
pub type ObjectId = u32;

/// Suffix appended to the database path to name the store file.
pub const SUFFIX_MV_FILE: &str = ".mv.db";
pub const SUFFIX_LOCK_FILE: &str = ".lock";
pub const SUFFIX_TEMP_FILE: &str = ".tempFile";

pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Page split size forced when compression is enabled.
pub const COMPRESSED_PAGE_SPLIT_SIZE: usize = 64 * 1024;

pub const FLUSH_FILL_RATE: u32 = 50;
pub const FLUSH_WRITE_LIMIT: usize = 4 * 1024 * 1024;
pub const COMPACT_FILL_RATE: u32 = 95;
pub const COMPACT_WRITE_LIMIT: usize = 16 * 1024 * 1024;

pub const DEFAULT_RETENTION_TIME: Duration = Duration::from_secs(45);

/// Passed as the maximum compaction time to request a full offline compaction on close.
pub const COMPACT_FULLY: Duration = Duration::MAX;

/// Set of object ids still referenced by the schema catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectIds {
    words: Vec<u64>,
}

impl ObjectIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ObjectId) {
        let (word, bit) = Self::position(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << bit;
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        let (word, bit) = Self::position(id);
        self.words
            .get(word)
            .map(|w| w & (1 << bit) != 0)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    fn position(id: ObjectId) -> (usize, u32) {
        ((id / 64) as usize, id % 64)
    }
}

impl FromIterator<ObjectId> for ObjectIds {
    fn from_iter<T: IntoIterator<Item = ObjectId>>(iter: T) -> Self {
        let mut ids = ObjectIds::new();
        for id in iter {
            ids.insert(id);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectIds;

    #[test]
    fn object_ids_track_membership() {
        let ids: ObjectIds = [0, 9, 63, 64, 1000].into_iter().collect();
        for id in [0, 9, 63, 64, 1000] {
            assert!(ids.contains(id));
        }
        for id in [1, 62, 65, 999, 5000] {
            assert!(!ids.contains(id));
        }
        assert_eq!(ids.len(), 5);
        assert!(ObjectIds::new().is_empty());
    }
}
