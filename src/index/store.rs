use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

use super::{procedure_key, ObjectKind, ObjectRecord, ProcedureRecord};
use crate::error::CacheIoError;

pub const SYMBOLS_FILE: &str = "symbols.json";
pub const PROCEDURES_FILE: &str = "procedures.json";

/// In-memory object and procedure maps backed by two JSON snapshots.
///
/// All lookups are plain map reads; only `load`, `save` and `clear` touch disk.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    objects: HashMap<String, ObjectRecord>,
    by_id: HashMap<(ObjectKind, i64), String>,
    procedures: HashMap<String, Vec<ProcedureRecord>>,
}

impl CacheStore {
    /// Create an empty store rooted at `dir` without reading anything.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            objects: HashMap::new(),
            by_id: HashMap::new(),
            procedures: HashMap::new(),
        }
    }

    /// Create a store and load whatever snapshots exist.
    pub fn open(dir: impl AsRef<Path>) -> Self {
        let mut store = Self::new(dir);
        store.load();
        store
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn symbols_path(&self) -> PathBuf {
        self.dir.join(SYMBOLS_FILE)
    }

    pub fn procedures_path(&self) -> PathBuf {
        self.dir.join(PROCEDURES_FILE)
    }

    /// Read both snapshots. A missing file counts as empty; a corrupt file is
    /// logged and the in-memory map is left untouched.
    pub fn load(&mut self) {
        match read_snapshot::<HashMap<String, ObjectRecord>>(&self.symbols_path()) {
            Ok(Some(objects)) => {
                debug!("Loaded {} objects from {}", objects.len(), self.symbols_path().display());
                self.replace_objects(objects);
            }
            Ok(None) => self.replace_objects(HashMap::new()),
            Err(e) => error!("Keeping in-memory objects, failed to load snapshot: {}", e),
        }

        match read_snapshot::<HashMap<String, Vec<ProcedureRecord>>>(&self.procedures_path()) {
            Ok(Some(procedures)) => {
                debug!(
                    "Loaded procedures for {} objects from {}",
                    procedures.len(),
                    self.procedures_path().display()
                );
                self.procedures = procedures;
            }
            Ok(None) => self.procedures.clear(),
            Err(e) => error!("Keeping in-memory procedures, failed to load snapshot: {}", e),
        }
    }

    /// Write both snapshots. In-memory state is kept even when this fails.
    pub fn save(&self) -> Result<(), CacheIoError> {
        fs::create_dir_all(&self.dir).map_err(|source| CacheIoError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let objects: BTreeMap<&String, &ObjectRecord> = self.objects.iter().collect();
        write_snapshot(&self.symbols_path(), &objects)?;

        let procedures: BTreeMap<&String, &Vec<ProcedureRecord>> = self.procedures.iter().collect();
        write_snapshot(&self.procedures_path(), &procedures)?;

        info!(
            "Saved {} objects and {} procedure lists to {}",
            self.objects.len(),
            self.procedures.len(),
            self.dir.display()
        );
        Ok(())
    }

    /// Empty both maps and persist the empty state right away.
    pub fn clear(&mut self) -> Result<(), CacheIoError> {
        self.objects.clear();
        self.by_id.clear();
        self.procedures.clear();
        self.save()
    }

    /// Swap in a freshly built object map (full replace).
    pub fn replace_objects(&mut self, objects: HashMap<String, ObjectRecord>) {
        self.by_id = objects
            .values()
            .filter_map(|o| o.id.map(|id| ((o.kind, id), o.name.clone())))
            .collect();
        self.objects = objects;
    }

    /// Assign procedure lists key by key; keys not mentioned are retained.
    pub fn merge_procedures<I>(&mut self, procedures: I)
    where
        I: IntoIterator<Item = (String, Vec<ProcedureRecord>)>,
    {
        for (key, list) in procedures {
            self.procedures.insert(key, list);
        }
    }

    pub fn objects(&self) -> &HashMap<String, ObjectRecord> {
        &self.objects
    }

    pub fn get_object(&self, name: &str) -> Option<&ObjectRecord> {
        self.objects.get(name)
    }

    pub fn get_object_id(&self, name: &str) -> Option<i64> {
        self.objects.get(name).and_then(|o| o.id)
    }

    pub fn find_by_id(&self, kind: ObjectKind, id: i64) -> Option<&ObjectRecord> {
        self.by_id
            .get(&(kind, id))
            .and_then(|name| self.objects.get(name))
    }

    pub fn get_procedures(&self, kind: ObjectKind, name: &str) -> &[ProcedureRecord] {
        self.procedures
            .get(&procedure_key(kind, name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn set_procedures(&mut self, kind: ObjectKind, name: &str, list: Vec<ProcedureRecord>) {
        self.procedures.insert(procedure_key(kind, name), list);
    }

    /// Procedure-map keys (`type:name`) in sorted order.
    pub fn list_objects_with_procedures(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn procedure_count(&self) -> usize {
        self.procedures.values().map(Vec::len).sum()
    }
}

/// Read a JSON snapshot. `Ok(None)` when the file does not exist.
pub(crate) fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CacheIoError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CacheIoError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| CacheIoError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Pretty-print to a sibling temp file, then rename over the target.
pub(crate) fn write_snapshot<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), CacheIoError> {
    let content = serde_json::to_string_pretty(value).map_err(|source| CacheIoError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(|source| CacheIoError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| CacheIoError::Io {
        path: path.to_path_buf(),
        source,
    })
}
