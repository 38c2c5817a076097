use std::{collections::VecDeque, fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::task;

/// Tenant database handle. One connection per process, serialized behind a
/// mutex and only touched from the blocking pool.
#[derive(Clone)]
pub struct TenantDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl TenantDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed creating tenant database directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening tenant database {}", path.display()))?;
        Self::bootstrap(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS modules (
                name TEXT PRIMARY KEY,
                display_name TEXT NOT NULL DEFAULT '',
                summary TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                website TEXT NOT NULL DEFAULT '',
                latest_version TEXT NOT NULL DEFAULT '',
                installed_version TEXT,
                state TEXT NOT NULL DEFAULT 'uninstalled'
            );
            CREATE TABLE IF NOT EXISTS module_dependencies (
                module TEXT NOT NULL REFERENCES modules(name) ON DELETE CASCADE,
                depends_on TEXT NOT NULL,
                PRIMARY KEY (module, depends_on)
            );
            ",
        )
        .context("Failed initializing tenant database schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .context("Tenant database task failed")?
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleRecord {
    pub name: String,
    pub display_name: String,
    pub summary: String,
    pub description: String,
    pub author: String,
    pub category: String,
    pub website: String,
    pub latest_version: String,
    pub installed_version: Option<String>,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleDependency {
    pub name: String,
    pub state: String,
}

const MODULE_COLUMNS: &str = "name, display_name, summary, description, author, category, \
                              website, latest_version, installed_version, state";

fn module_from_row(row: &Row<'_>) -> rusqlite::Result<ModuleRecord> {
    Ok(ModuleRecord {
        name: row.get(0)?,
        display_name: row.get(1)?,
        summary: row.get(2)?,
        description: row.get(3)?,
        author: row.get(4)?,
        category: row.get(5)?,
        website: row.get(6)?,
        latest_version: row.get(7)?,
        installed_version: row.get(8)?,
        state: row.get(9)?,
    })
}

/// Returns one page of modules ordered by name, plus the unpaged match count.
pub fn list_modules(
    conn: &Connection,
    state: Option<&str>,
    search: Option<&str>,
    limit: usize,
) -> Result<(Vec<ModuleRecord>, usize)> {
    let pattern = search.map(|term| format!("%{}%", term.to_lowercase()));
    let filter = "WHERE (?1 IS NULL OR state = ?1)
                  AND (?2 IS NULL OR lower(name) LIKE ?2 OR lower(display_name) LIKE ?2
                       OR lower(summary) LIKE ?2)";

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM modules {filter}"),
            params![state, pattern],
            |row| row.get(0),
        )
        .context("Failed counting modules")?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {MODULE_COLUMNS} FROM modules {filter} ORDER BY name LIMIT ?3"
        ))
        .context("Failed preparing module listing")?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let modules = stmt
        .query_map(params![state, pattern, limit], module_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed listing modules")?;

    Ok((modules, usize::try_from(total).unwrap_or_default()))
}

pub fn find_module(conn: &Connection, name: &str) -> Result<Option<ModuleRecord>> {
    conn.query_row(
        &format!("SELECT {MODULE_COLUMNS} FROM modules WHERE name = ?1"),
        params![name],
        module_from_row,
    )
    .optional()
    .with_context(|| format!("Failed loading module {name}"))
}

pub fn module_dependencies(conn: &Connection, name: &str) -> Result<Vec<ModuleDependency>> {
    let mut stmt = conn.prepare(
        "SELECT d.depends_on, COALESCE(m.state, 'unknown')
         FROM module_dependencies d
         LEFT JOIN modules m ON m.name = d.depends_on
         WHERE d.module = ?1
         ORDER BY d.depends_on",
    )?;
    let deps = stmt
        .query_map(params![name], |row| {
            Ok(ModuleDependency {
                name: row.get(0)?,
                state: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("Failed loading dependencies of {name}"))?;
    Ok(deps)
}

/// Marks `name` and every not-yet-installed module it transitively depends on
/// as installed at their latest version. Returns the dependencies that were
/// installed along the way.
pub fn install_with_dependencies(conn: &mut Connection, name: &str) -> Result<Vec<String>> {
    let tx = conn.transaction()?;
    let mut pulled_in = Vec::new();
    let mut pending = VecDeque::from([name.to_string()]);
    let mut seen = vec![name.to_string()];

    while let Some(current) = pending.pop_front() {
        let Some(module) = find_module(&tx, &current)? else {
            anyhow::bail!("Module not found: {current}");
        };
        if module.state != "installed" {
            mark_installed(&tx, &module.name)?;
            if module.name != name {
                pulled_in.push(module.name.clone());
            }
        }
        for dep in module_dependencies(&tx, &current)? {
            if !seen.contains(&dep.name) {
                seen.push(dep.name.clone());
                pending.push_back(dep.name);
            }
        }
    }

    tx.commit().context("Failed committing module installation")?;
    Ok(pulled_in)
}

pub fn mark_installed(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(
        "UPDATE modules SET state = 'installed', installed_version = latest_version
         WHERE name = ?1",
        params![name],
    )
    .with_context(|| format!("Failed updating module {name}"))?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn seed_module(
    conn: &Connection,
    name: &str,
    state: &str,
    latest_version: &str,
    depends_on: &[&str],
) -> Result<()> {
    conn.execute(
        "INSERT INTO modules (name, display_name, summary, author, latest_version, installed_version, state)
         VALUES (?1, ?2, ?3, 'Fleet Ops', ?4, CASE WHEN ?5 = 'installed' THEN '0.9' END, ?5)",
        params![name, name.replace('_', " "), format!("{name} summary"), latest_version, state],
    )?;
    for dep in depends_on {
        conn.execute(
            "INSERT INTO module_dependencies (module, depends_on) VALUES (?1, ?2)",
            params![name, dep],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        find_module, install_with_dependencies, list_modules, module_dependencies, seed_module,
        TenantDatabase,
    };

    #[tokio::test]
    async fn listing_filters_by_state_and_search() {
        let db = TenantDatabase::open_in_memory().expect("db");
        let (modules, total) = db
            .call(|conn| {
                seed_module(conn, "base", "installed", "1.0", &[])?;
                seed_module(conn, "sale", "uninstalled", "1.2", &["base"])?;
                seed_module(conn, "sale_stock", "uninstalled", "1.1", &["sale"])?;
                list_modules(conn, Some("uninstalled"), Some("SALE"), 1)
            })
            .await
            .expect("list");

        assert_eq!(total, 2);
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name, "sale");
    }

    #[tokio::test]
    async fn install_pulls_in_missing_dependencies() {
        let db = TenantDatabase::open_in_memory().expect("db");
        let (pulled, sale, deps) = db
            .call(|conn| {
                seed_module(conn, "base", "installed", "1.0", &[])?;
                seed_module(conn, "sale", "uninstalled", "1.2", &["base"])?;
                seed_module(conn, "sale_stock", "uninstalled", "1.1", &["sale", "base"])?;
                let pulled = install_with_dependencies(conn, "sale_stock")?;
                let sale = find_module(conn, "sale")?;
                let deps = module_dependencies(conn, "sale_stock")?;
                Ok((pulled, sale, deps))
            })
            .await
            .expect("install");

        assert_eq!(pulled, vec!["sale".to_string()]);
        let sale = sale.expect("sale exists");
        assert_eq!(sale.state, "installed");
        assert_eq!(sale.installed_version.as_deref(), Some("1.2"));
        assert_eq!(deps.len(), 2);
        assert!(deps.iter().all(|d| d.state == "installed"));
    }

    #[tokio::test]
    async fn install_rolls_back_on_missing_dependency() {
        let db = TenantDatabase::open_in_memory().expect("db");
        let (result, state) = db
            .call(|conn| {
                seed_module(conn, "report", "uninstalled", "2.0", &["ghost"])?;
                let result = install_with_dependencies(conn, "report").map_err(|e| e.to_string());
                let state = find_module(conn, "report")?.map(|m| m.state);
                Ok((result, state))
            })
            .await
            .expect("call");

        assert_eq!(result, Err("Module not found: ghost".to_string()));
        assert_eq!(state.as_deref(), Some("uninstalled"));
    }
}
