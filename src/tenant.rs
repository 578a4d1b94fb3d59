use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Per-tenant engines, keyed by the pgwire database name. Each tenant owns
/// one WAL file under `data_dir` and one background compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Reduce a database name to a safe file stem.
fn file_stem(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let stem: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if stem.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(stem)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Engine for `tenant`, replaying its WAL on first use.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = file_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Holding the shard entry keeps two first connections from opening
        // the same WAL twice.
        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                slot.insert(engine.clone());
                engine
            }
        };

        if self.compact_threshold > 0 {
            let compactor_engine = engine.clone();
            let threshold = self.compact_threshold;
            tokio::spawn(async move {
                compactor::run_compactor(compactor_engine, threshold).await;
            });
        }

        tracing::info!("tenant {tenant} opened");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("gridlock_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenants_do_not_share_bitmaps() {
        let tm = TenantManager::new(test_data_dir("isolation"), 1000);
        let a = tm.get_or_create("campus_a").unwrap();
        let b = tm.get_or_create("campus_b").unwrap();

        let sid = Ulid::new();
        let f = Ulid::new();
        for engine in [&a, &b] {
            engine.create_schedule(sid, None, None, None).await.unwrap();
            engine.create_resource(ResourceKind::Faculty, f, None).await.unwrap();
        }

        let raw = format!(
            r#"{{"timetables":{{"S1":{{"days":[[{{"courseid":"C1","facultyid":"{f}"}}]]}}}}}}"#
        );
        a.commit_timetable(sid, &raw).await.unwrap();

        let key = ResourceKey::faculty(f);
        assert!(!a.is_free(key, sid, 0, 0).await.unwrap());
        assert!(b.is_free(key, sid, 0, 0).await.unwrap());
    }

    #[tokio::test]
    async fn wal_created_lazily() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _engine = tm.get_or_create("registrar").unwrap();
        assert!(dir.join("registrar.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let tm = TenantManager::new(test_data_dir("same_engine"), 1000);
        let first = tm.get_or_create("foo").unwrap();
        let second = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let _engine = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = TenantManager::new(test_data_dir("name_too_long"), 1000);
        let err = tm
            .get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = TenantManager::new(test_data_dir("count_limit"), 0);
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
