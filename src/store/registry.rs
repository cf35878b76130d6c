//! SQLite-backed ToolServerRegistry.
//!
//! Uses `rusqlite` synchronously behind a mutex; every call is a short
//! statement, so async callers invoke it directly.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use super::errors::RegistryError;
use crate::engine::normalize_name;
use super::types::{
    Manifest, NewRoutingRule, NewToolServer, RoutingRule, ServerSource, ServerStatus,
    ToolServerConfig,
};

/// Schema revision recorded in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// Port assigned to manifest imports that do not name one.
const DEFAULT_MANIFEST_PORT: u16 = 8011;

const SERVER_COLUMNS: &str = "id, name, description, server_type, transport_type, image,
    build_source, build_context, dockerfile_path, port, url, headers, env_vars, status,
    last_health_check, auto_start, color, source, manifest_url, created_at, updated_at";

const RULE_COLUMNS: &str = "id, server_id, pattern, priority, is_enabled, created_at";

// ─── Registry ────────────────────────────────────────────────────────────────

/// CRUD store for tool servers and their routing rules.
pub struct ToolServerRegistry {
    conn: Mutex<Connection>,
}

impl ToolServerRegistry {
    /// Open (or create) the registry database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.create_tables()?;
        Ok(registry)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn.lock().map_err(|e| RegistryError::DatabaseError {
            reason: format!("connection lock poisoned: {e}"),
        })
    }

    fn create_tables(&self) -> Result<(), RegistryError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tool_servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                server_type TEXT NOT NULL,
                transport_type TEXT NOT NULL DEFAULT 'http',
                image TEXT,
                build_source TEXT NOT NULL DEFAULT 'image',
                build_context TEXT,
                dockerfile_path TEXT,
                port INTEGER NOT NULL DEFAULT 0,
                url TEXT,
                headers TEXT NOT NULL DEFAULT '{}',
                env_vars TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'stopped',
                last_health_check TEXT,
                auto_start INTEGER NOT NULL DEFAULT 0,
                color TEXT NOT NULL DEFAULT '#22c55e',
                source TEXT NOT NULL DEFAULT 'local',
                manifest_url TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS routing_rules (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                pattern TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                FOREIGN KEY (server_id) REFERENCES tool_servers(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_rules_server
                ON routing_rules(server_id);
            ",
        )?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        }
        Ok(())
    }

    // ─── Servers ─────────────────────────────────────────────────────────

    /// Validate and insert a new server. New servers start `Stopped`.
    pub fn create(&self, draft: NewToolServer) -> Result<ToolServerConfig, RegistryError> {
        let draft = draft.validate()?;
        let conn = self.conn()?;
        let id = insert_server(&conn, &draft)?;
        drop(conn);
        self.require(&id)
    }

    /// Replace the editable fields of a server. Status and timestamps of the
    /// last health check are kept.
    pub fn update(&self, id: &str, draft: NewToolServer) -> Result<ToolServerConfig, RegistryError> {
        let draft = draft.validate()?;
        let conn = self.conn()?;

        ensure_name_free(&conn, &draft.name, Some(id))?;

        let changed = conn.execute(
            "UPDATE tool_servers SET
                name = ?2, description = ?3, server_type = ?4, transport_type = ?5,
                image = ?6, build_source = ?7, build_context = ?8, dockerfile_path = ?9,
                port = ?10, url = ?11, headers = ?12, env_vars = ?13, auto_start = ?14,
                color = ?15, source = ?16, manifest_url = ?17, updated_at = ?18
             WHERE id = ?1",
            params![
                id,
                draft.name,
                draft.description,
                draft.server_type,
                draft.transport_type,
                draft.image,
                draft.build_source,
                draft.build_context,
                draft.dockerfile_path,
                draft.port,
                draft.url,
                serde_json::to_string(&draft.headers)?,
                serde_json::to_string(&draft.env_var_names)?,
                draft.auto_start,
                draft.color,
                draft.source,
                draft.manifest_url,
                now_text(),
            ],
        )?;
        drop(conn);

        if changed == 0 {
            return Err(RegistryError::ServerNotFound { id: id.to_string() });
        }
        self.require(id)
    }

    /// Delete a server and, through the foreign key, all of its rules.
    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let changed = self
            .conn()?
            .execute("DELETE FROM tool_servers WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(RegistryError::ServerNotFound { id: id.to_string() });
        }
        tracing::info!(server_id = %id, "deleted tool server");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<ToolServerConfig>, RegistryError> {
        let conn = self.conn()?;
        let server = conn
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM tool_servers WHERE id = ?1"),
                params![id],
                server_from_row,
            )
            .optional()?;
        Ok(server)
    }

    /// Like [`get`](Self::get), but a missing server is an error.
    pub fn require(&self, id: &str) -> Result<ToolServerConfig, RegistryError> {
        self.get(id)?
            .ok_or_else(|| RegistryError::ServerNotFound { id: id.to_string() })
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<ToolServerConfig>, RegistryError> {
        let conn = self.conn()?;
        let server = conn
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM tool_servers WHERE name = ?1"),
                params![name.trim()],
                server_from_row,
            )
            .optional()?;
        Ok(server)
    }

    /// All servers, ordered by name.
    pub fn list(&self) -> Result<Vec<ToolServerConfig>, RegistryError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {SERVER_COLUMNS} FROM tool_servers ORDER BY name"))?;
        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(servers)
    }

    /// Persist the cached status, and the health-check time when one ran.
    pub fn set_status(
        &self,
        id: &str,
        status: ServerStatus,
        health_checked_at: Option<DateTime<Utc>>,
    ) -> Result<(), RegistryError> {
        let conn = self.conn()?;
        let changed = match health_checked_at {
            Some(at) => conn.execute(
                "UPDATE tool_servers SET status = ?2, last_health_check = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, status, at.to_rfc3339(), now_text()],
            )?,
            None => conn.execute(
                "UPDATE tool_servers SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status, now_text()],
            )?,
        };
        if changed == 0 {
            return Err(RegistryError::ServerNotFound { id: id.to_string() });
        }
        Ok(())
    }

    // ─── Rules ───────────────────────────────────────────────────────────

    pub fn create_rule(
        &self,
        server_id: &str,
        rule: NewRoutingRule,
    ) -> Result<RoutingRule, RegistryError> {
        let conn = self.conn()?;
        if !server_exists(&conn, server_id)? {
            return Err(RegistryError::ServerNotFound {
                id: server_id.to_string(),
            });
        }
        let id = insert_rule(&conn, server_id, &rule)?;
        drop(conn);
        self.require_rule(&id)
    }

    pub fn update_rule(&self, id: &str, rule: NewRoutingRule) -> Result<RoutingRule, RegistryError> {
        let changed = self.conn()?.execute(
            "UPDATE routing_rules SET pattern = ?2, priority = ?3, is_enabled = ?4 WHERE id = ?1",
            params![id, rule.pattern, rule.priority, rule.is_enabled],
        )?;
        if changed == 0 {
            return Err(RegistryError::RuleNotFound { id: id.to_string() });
        }
        self.require_rule(id)
    }

    pub fn delete_rule(&self, id: &str) -> Result<(), RegistryError> {
        let changed = self
            .conn()?
            .execute("DELETE FROM routing_rules WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(RegistryError::RuleNotFound { id: id.to_string() });
        }
        Ok(())
    }

    fn require_rule(&self, id: &str) -> Result<RoutingRule, RegistryError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {RULE_COLUMNS} FROM routing_rules WHERE id = ?1"),
            params![id],
            rule_from_row,
        )
        .optional()?
        .ok_or_else(|| RegistryError::RuleNotFound { id: id.to_string() })
    }

    /// Rules of one server, highest priority first.
    pub fn list_rules(&self, server_id: &str) -> Result<Vec<RoutingRule>, RegistryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM routing_rules WHERE server_id = ?1
             ORDER BY priority DESC, created_at, rowid"
        ))?;
        let rules = stmt
            .query_map(params![server_id], rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Enabled rules across all servers, in insertion order. Callers impose
    /// priority ordering.
    pub fn list_enabled_rules(&self) -> Result<Vec<RoutingRule>, RegistryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM routing_rules WHERE is_enabled = 1 ORDER BY rowid"
        ))?;
        let rules = stmt
            .query_map([], rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    // ─── Manifests ───────────────────────────────────────────────────────

    /// Register a server described by a manifest, with one enabled rule per
    /// default pattern (priority `100 - index`).
    pub fn import_manifest(
        &self,
        manifest: &Manifest,
        manifest_url: &str,
    ) -> Result<ToolServerConfig, RegistryError> {
        if manifest.name.trim().is_empty() || manifest.image.trim().is_empty() {
            return Err(RegistryError::InvalidConfig {
                reason: "manifest must include 'name' and 'image'".into(),
            });
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let used: HashSet<u16> = {
            let mut stmt = tx.prepare("SELECT port FROM tool_servers WHERE port > 0")?;
            let ports = stmt
                .query_map([], |row| row.get::<_, u16>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            ports
        };
        let mut port = manifest.port.filter(|p| *p > 0).unwrap_or(DEFAULT_MANIFEST_PORT);
        while used.contains(&port) {
            port = port.checked_add(1).ok_or_else(|| RegistryError::InvalidConfig {
                reason: "no free port above the manifest port".into(),
            })?;
        }

        let draft = NewToolServer {
            description: manifest.description.clone(),
            env_var_names: manifest.env_vars.clone(),
            source: ServerSource::Github,
            manifest_url: Some(manifest_url.to_string()),
            ..NewToolServer::docker_http(&manifest.name, &manifest.image, port)
        }
        .validate()?;

        let id = insert_server(&tx, &draft)?;
        for (index, pattern) in manifest.default_routing_patterns.iter().enumerate() {
            let priority = 100 - index as i64;
            insert_rule(&tx, &id, &NewRoutingRule::new(pattern, priority))?;
        }
        tx.commit()?;
        drop(conn);

        tracing::info!(
            server = %manifest.name,
            port,
            rules = manifest.default_routing_patterns.len(),
            "imported tool server from manifest"
        );
        self.require(&id)
    }
}

// ─── Statement helpers ───────────────────────────────────────────────────────

fn now_text() -> String {
    Utc::now().to_rfc3339()
}

fn server_exists(conn: &Connection, id: &str) -> Result<bool, RegistryError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM tool_servers WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

/// Reject `name` if another server (other than `except_id`) has the same
/// name or one that normalizes to the same container name.
fn ensure_name_free(conn: &Connection, name: &str, except_id: Option<&str>) -> Result<(), RegistryError> {
    let wanted = normalize_name(name);
    let mut stmt = conn.prepare("SELECT id, name FROM tool_servers")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (id, existing) = row?;
        if Some(id.as_str()) == except_id {
            continue;
        }
        if existing == name {
            return Err(RegistryError::DuplicateName { name: name.to_string() });
        }
        if normalize_name(&existing) == wanted {
            return Err(RegistryError::NameCollision {
                name: name.to_string(),
                existing,
            });
        }
    }
    Ok(())
}

fn insert_server(conn: &Connection, draft: &NewToolServer) -> Result<String, RegistryError> {
    ensure_name_free(conn, &draft.name, None)?;

    let id = uuid::Uuid::new_v4().to_string();
    let now = now_text();
    conn.execute(
        "INSERT INTO tool_servers (
            id, name, description, server_type, transport_type, image, build_source,
            build_context, dockerfile_path, port, url, headers, env_vars, status,
            auto_start, color, source, manifest_url, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?19)",
        params![
            id,
            draft.name,
            draft.description,
            draft.server_type,
            draft.transport_type,
            draft.image,
            draft.build_source,
            draft.build_context,
            draft.dockerfile_path,
            draft.port,
            draft.url,
            serde_json::to_string(&draft.headers)?,
            serde_json::to_string(&draft.env_var_names)?,
            ServerStatus::Stopped,
            draft.auto_start,
            draft.color,
            draft.source,
            draft.manifest_url,
            now,
        ],
    )?;
    tracing::info!(server = %draft.name, server_id = %id, "registered tool server");
    Ok(id)
}

fn insert_rule(
    conn: &Connection,
    server_id: &str,
    rule: &NewRoutingRule,
) -> Result<String, RegistryError> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO routing_rules (id, server_id, pattern, priority, is_enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, server_id, rule.pattern, rule.priority, rule.is_enabled, now_text()],
    )?;
    Ok(id)
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<ToolServerConfig> {
    Ok(ToolServerConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        server_type: row.get(3)?,
        transport_type: row.get(4)?,
        image: row.get(5)?,
        build_source: row.get(6)?,
        build_context: row.get(7)?,
        dockerfile_path: row.get(8)?,
        port: row.get(9)?,
        url: row.get(10)?,
        headers: json_column(row, 11)?,
        env_var_names: json_column(row, 12)?,
        status: row.get(13)?,
        last_health_check: optional_time_column(row, 14)?,
        auto_start: row.get(15)?,
        color: row.get(16)?,
        source: row.get(17)?,
        manifest_url: row.get(18)?,
        created_at: time_column(row, 19)?,
        updated_at: time_column(row, 20)?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<RoutingRule> {
    Ok(RoutingRule {
        id: row.get(0)?,
        server_id: row.get(1)?,
        pattern: row.get(2)?,
        priority: row.get(3)?,
        is_enabled: row.get(4)?,
        created_at: time_column(row, 5)?,
    })
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_time(&text, idx)
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_time(&t, idx)).transpose()
}

fn parse_time(text: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{ServerType, TransportType};

    fn registry() -> ToolServerRegistry {
        ToolServerRegistry::open(":memory:").unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let reg = registry();
        let mut draft = NewToolServer::docker_http("Search", "acme/search:1", 8011);
        draft.env_var_names = vec!["OPENAI_API_KEY".into()];
        let created = reg.create(draft).unwrap();

        assert_eq!(created.status, ServerStatus::Stopped);
        assert_eq!(created.server_type, ServerType::Docker);
        assert_eq!(created.color, "#22c55e");
        assert_eq!(created.env_var_names, vec!["OPENAI_API_KEY"]);

        let fetched = reg.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(reg.get_by_name("Search").unwrap().unwrap().id, created.id);
        assert!(reg.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let reg = registry();
        reg.create(NewToolServer::remote("search", "https://a.example/mcp")).unwrap();
        let err = reg
            .create(NewToolServer::remote("search", "https://b.example/mcp"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName { .. }));
    }

    #[test]
    fn test_names_that_share_a_container_are_rejected() {
        let reg = registry();
        let search = reg.create(NewToolServer::remote("Search", "https://a.example/mcp")).unwrap();

        let err = reg
            .create(NewToolServer::remote("search", "https://b.example/mcp"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameCollision { ref existing, .. } if existing == "Search"));

        reg.create(NewToolServer::docker_stdio("my tool", "acme/tool:1")).unwrap();
        let err = reg
            .create(NewToolServer::docker_stdio("my-tool", "acme/tool:2"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameCollision { .. }));

        // Renaming a server to a variant of its own name is fine.
        let renamed = reg
            .update(&search.id, NewToolServer::remote("SEARCH", "https://a.example/mcp"))
            .unwrap();
        assert_eq!(renamed.name, "SEARCH");
        let clash = reg.update(&search.id, NewToolServer::remote("My Tool", "https://a.example/mcp"));
        assert!(matches!(clash, Err(RegistryError::NameCollision { .. })));
    }

    #[test]
    fn test_update_keeps_status_and_checks_names() {
        let reg = registry();
        let a = reg.create(NewToolServer::docker_stdio("a", "acme/a:1")).unwrap();
        reg.create(NewToolServer::docker_stdio("b", "acme/b:1")).unwrap();
        reg.set_status(&a.id, ServerStatus::Running, None).unwrap();

        let mut draft = NewToolServer::docker_stdio("a", "acme/a:2");
        draft.headers.insert("X-Trace".into(), "1".into());
        let updated = reg.update(&a.id, draft).unwrap();
        assert_eq!(updated.image.as_deref(), Some("acme/a:2"));
        assert_eq!(updated.status, ServerStatus::Running);
        assert_eq!(updated.transport_type, TransportType::Stdio);

        let clash = reg.update(&a.id, NewToolServer::docker_stdio("b", "acme/a:2"));
        assert!(matches!(clash, Err(RegistryError::DuplicateName { .. })));

        let missing = reg.update("nope", NewToolServer::docker_stdio("c", "x"));
        assert!(matches!(missing, Err(RegistryError::ServerNotFound { .. })));
    }

    #[test]
    fn test_delete_cascades_rules() {
        let reg = registry();
        let server = reg.create(NewToolServer::remote("search", "https://a.example")).unwrap();
        let other = reg.create(NewToolServer::remote("other", "https://b.example")).unwrap();
        reg.create_rule(&server.id, NewRoutingRule::new("search|find", 10)).unwrap();
        reg.create_rule(&server.id, NewRoutingRule::new("look up", 5)).unwrap();
        reg.create_rule(&other.id, NewRoutingRule::new(".*", 0)).unwrap();

        reg.delete(&server.id).unwrap();

        assert!(reg.list_rules(&server.id).unwrap().is_empty());
        assert_eq!(reg.list_enabled_rules().unwrap().len(), 1);
        assert!(matches!(
            reg.delete(&server.id),
            Err(RegistryError::ServerNotFound { .. })
        ));
    }

    #[test]
    fn test_rule_crud() {
        let reg = registry();
        let server = reg.create(NewToolServer::remote("s", "https://a.example")).unwrap();
        let low = reg.create_rule(&server.id, NewRoutingRule::new("low", 1)).unwrap();
        let high = reg.create_rule(&server.id, NewRoutingRule::new("high", 50)).unwrap();

        let rules = reg.list_rules(&server.id).unwrap();
        assert_eq!(rules[0].id, high.id);

        let updated = reg
            .update_rule(&low.id, NewRoutingRule::new("lower", 0).disabled())
            .unwrap();
        assert!(!updated.is_enabled);
        assert_eq!(updated.pattern, "lower");

        let enabled = reg.list_enabled_rules().unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, high.id);

        reg.delete_rule(&high.id).unwrap();
        assert!(matches!(
            reg.delete_rule(&high.id),
            Err(RegistryError::RuleNotFound { .. })
        ));
        assert!(matches!(
            reg.create_rule("missing", NewRoutingRule::new("x", 0)),
            Err(RegistryError::ServerNotFound { .. })
        ));
    }

    #[test]
    fn test_set_status_records_health_check() {
        let reg = registry();
        let server = reg.create(NewToolServer::remote("s", "https://a.example")).unwrap();
        assert!(server.last_health_check.is_none());

        let at = Utc::now();
        reg.set_status(&server.id, ServerStatus::Running, Some(at)).unwrap();
        let fetched = reg.require(&server.id).unwrap();
        assert_eq!(fetched.status, ServerStatus::Running);
        assert_eq!(
            fetched.last_health_check.map(|t| t.timestamp()),
            Some(at.timestamp())
        );
    }

    #[test]
    fn test_import_manifest_bumps_port_and_creates_rules() {
        let reg = registry();
        reg.create(NewToolServer::docker_http("existing", "acme/x:1", 8011)).unwrap();

        let manifest = Manifest {
            name: "summarizer".into(),
            image: "acme/summarizer:1".into(),
            port: None,
            description: Some("Summaries".into()),
            env_vars: vec!["OPENAI_API_KEY".into()],
            default_routing_patterns: vec!["summar".into(), "tl;?dr".into()],
        };
        let server = reg
            .import_manifest(&manifest, "https://github.com/acme/summarizer/mcp.json")
            .unwrap();

        assert_eq!(server.port, 8012);
        assert_eq!(server.source, ServerSource::Github);
        assert!(!server.auto_start);
        assert_eq!(server.status, ServerStatus::Stopped);

        let rules = reg.list_rules(&server.id).unwrap();
        let priorities: Vec<i64> = rules.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![100, 99]);
        assert!(rules.iter().all(|r| r.is_enabled));

        let dup = reg.import_manifest(&manifest, "https://example.com/m.json");
        assert!(matches!(dup, Err(RegistryError::DuplicateName { .. })));
    }

    #[test]
    fn test_import_manifest_requires_name_and_image() {
        let reg = registry();
        let manifest = Manifest {
            name: "x".into(),
            image: " ".into(),
            port: None,
            description: None,
            env_vars: vec![],
            default_routing_patterns: vec![],
        };
        assert!(matches!(
            reg.import_manifest(&manifest, "u"),
            Err(RegistryError::InvalidConfig { .. })
        ));
    }
}
