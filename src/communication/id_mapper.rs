use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdMapError {
    #[error("string id '{string_id}' is already mapped to {uint_id}")]
    AlreadyMapped { string_id: String, uint_id: u32 },
    #[error("failed to write id mapping: {0}")]
    Dump(#[from] csv::Error),
    #[error("failed to open id mapping file: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle shared by every component that translates ids for the wire.
pub type SharedIdMapper = Arc<Mutex<IdMapper>>;

/// Integer id of a string: the first four bytes of its MD5 digest, big-endian.
///
/// Peers compute the same value independently, so this must stay stable.
pub fn hash_to_uint(string_id: &str) -> u32 {
    let digest = md5::compute(string_id.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Serialize)]
struct IdMappingRow<'a> {
    int_id: u32,
    string_id: &'a str,
}

/// Bidirectional cache between string ids and their 32 bit wire ids.
#[derive(Debug, Default)]
pub struct IdMapper {
    to_uint: HashMap<String, u32>,
    to_string: HashMap<u32, String>,
}

impl IdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedIdMapper {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn len(&self) -> usize {
        self.to_uint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_uint.is_empty()
    }

    /// Wire id for `string_id`, cached in both directions on first use.
    ///
    /// Hash collisions are not detected; the later string wins the reverse entry.
    pub fn to_uint(&mut self, string_id: &str) -> u32 {
        if let Some(uint_id) = self.to_uint.get(string_id) {
            return *uint_id;
        }
        let uint_id = hash_to_uint(string_id);
        self.to_uint.insert(string_id.to_string(), uint_id);
        self.to_string.insert(uint_id, string_id.to_string());
        uint_id
    }

    /// String id for `uint_id`.
    ///
    /// Peers may echo ids this side has not produced yet; those get a
    /// placeholder (`unknown-<id>`), cached for the reverse direction only.
    pub fn to_string(&mut self, uint_id: u32) -> String {
        if let Some(string_id) = self.to_string.get(&uint_id) {
            return string_id.clone();
        }
        let placeholder = format!("unknown-{}", uint_id);
        log::warn!(
            "No string id known for {}, using placeholder '{}'",
            uint_id,
            placeholder
        );
        self.to_string.insert(uint_id, placeholder.clone());
        placeholder
    }

    /// Insert an explicit pair, refusing to shadow an existing string mapping.
    pub fn force_add_mapping(&mut self, string_id: &str, uint_id: u32) -> Result<(), IdMapError> {
        if let Some(existing) = self.to_uint.get(string_id) {
            return Err(IdMapError::AlreadyMapped {
                string_id: string_id.to_string(),
                uint_id: *existing,
            });
        }
        self.to_uint.insert(string_id.to_string(), uint_id);
        self.to_string.insert(uint_id, string_id.to_string());
        Ok(())
    }

    /// Pre-compute the mappings of a known set of ids.
    pub fn prime<'a, I: IntoIterator<Item = &'a str>>(&mut self, string_ids: I) {
        for string_id in string_ids {
            self.to_uint(string_id);
        }
    }

    /// Write the `int_id,string_id` table, sorted by integer id.
    pub fn write_dump(&self, path: &Path) -> Result<(), IdMapError> {
        let file = File::create(path)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(true)
            .from_writer(file);

        let mut rows: Vec<(&u32, &String)> = self.to_string.iter().collect();
        rows.sort();
        for (int_id, string_id) in rows {
            wtr.serialize(IdMappingRow {
                int_id: *int_id,
                string_id,
            })?;
        }
        wtr.flush()?;
        log::info!("Wrote {} id mappings to {}", self.to_string.len(), path.display());
        Ok(())
    }
}
