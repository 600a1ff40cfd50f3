use std::path::Path;
use std::sync::Arc;

use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options};
use tracing::{info, warn};

use crate::errors::{RegistryError, RegistryResult};
use crate::registry::RegistrySnapshot;

/// Version tag of the persisted blob; a mismatch discards the blob and
/// lets the registry rebuild from the network.
pub const SNAPSHOT_VERSION_TAG: &str = "CMasternodeMan-Version-8";

const CF_REGISTRY: &str = "registry";
const VERSION_KEY: &[u8] = b"version";
const SNAPSHOT_KEY: &[u8] = b"snapshot";

/// On-disk home of the registry snapshot.
pub struct RegistryStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RegistryStore {
    pub fn open(path: &Path) -> RegistryResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![ColumnFamilyDescriptor::new(CF_REGISTRY, Options::default())];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn registry_cf(&self) -> RegistryResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_REGISTRY)
            .ok_or_else(|| RegistryError::Config("missing registry column family".into()))
    }

    pub fn save(&self, snapshot: &RegistrySnapshot) -> RegistryResult<()> {
        let cf = self.registry_cf()?;
        let encoded = bincode::serialize(snapshot)?;
        self.db
            .put_cf(&cf, VERSION_KEY, SNAPSHOT_VERSION_TAG.as_bytes())?;
        self.db.put_cf(&cf, SNAPSHOT_KEY, encoded)?;
        info!(entries = snapshot.entries.len(), "registry snapshot persisted");
        Ok(())
    }

    /// Load the persisted snapshot. `Ok(None)` means there is nothing
    /// usable on disk and the caller starts from an empty registry.
    pub fn load(&self) -> RegistryResult<Option<RegistrySnapshot>> {
        let cf = self.registry_cf()?;
        let Some(version) = self.db.get_cf(&cf, VERSION_KEY)? else {
            return Ok(None);
        };
        if version != SNAPSHOT_VERSION_TAG.as_bytes() {
            warn!(
                found = %String::from_utf8_lossy(&version),
                expected = SNAPSHOT_VERSION_TAG,
                "registry snapshot version mismatch, rebuilding"
            );
            return Ok(None);
        }
        let Some(encoded) = self.db.get_cf(&cf, SNAPSHOT_KEY)? else {
            return Ok(None);
        };
        let snapshot: RegistrySnapshot = bincode::deserialize(&encoded)?;
        info!(entries = snapshot.entries.len(), "registry snapshot loaded");
        Ok(Some(snapshot))
    }
}
