//! The identity catalog: a durable, relational mapping of orchestrator object
//! UIDs to internal integer ids.
//!
//! One SQLite file with foreign keys enabled. Every upsert is a single
//! `INSERT .. ON CONFLICT .. RETURNING id` statement so that callers never
//! read-then-write and concurrent upserts across tasks serialize inside the
//! database, not in caller code.
//!
//! The read side is a set of typed list/join queries consumed exclusively by
//! the query API; no other component issues reads against this store.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::todo,
    missing_debug_implementations,
    missing_docs
)]

use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use data_types::{
    DaemonSetId, DeploymentId, EntityKind, NamespaceId, NodeId, PodId, PvcId, StatefulSetId,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

/// Errors returned by the identity catalog.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying database rejected the statement.
    #[error("identity catalog error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// A specialized `Result` for catalog operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Node names referenced by a Pod before the Node itself was observed are
/// recorded under a synthesized UID with this prefix, and reconciled onto the
/// real UID by name when the Node event arrives.
pub const STUB_UID_PREFIX: &str = "stub-";

// Node upserts conflict-target both `name` and `uid`: the `name` clause folds
// a real UID onto a previously stubbed row, the `uid` clause covers repeat
// events for an already-reconciled node.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS namespace (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS node (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        uid        TEXT NOT NULL UNIQUE,
        name       TEXT NOT NULL UNIQUE,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS deployment (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        uid          TEXT NOT NULL UNIQUE,
        name         TEXT NOT NULL,
        namespace_id INTEGER NOT NULL REFERENCES namespace (id),
        updated_at   INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS statefulset (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        uid          TEXT NOT NULL UNIQUE,
        name         TEXT NOT NULL,
        namespace_id INTEGER NOT NULL REFERENCES namespace (id),
        updated_at   INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS daemonset (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        uid          TEXT NOT NULL UNIQUE,
        name         TEXT NOT NULL,
        namespace_id INTEGER NOT NULL REFERENCES namespace (id),
        updated_at   INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pod (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        uid            TEXT NOT NULL UNIQUE,
        name           TEXT NOT NULL,
        namespace_id   INTEGER NOT NULL REFERENCES namespace (id),
        node_id        INTEGER NOT NULL REFERENCES node (id),
        deployment_id  INTEGER REFERENCES deployment (id),
        statefulset_id INTEGER REFERENCES statefulset (id),
        daemonset_id   INTEGER REFERENCES daemonset (id),
        updated_at     INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pvc (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        uid          TEXT NOT NULL UNIQUE,
        name         TEXT NOT NULL,
        namespace_id INTEGER NOT NULL REFERENCES namespace (id),
        updated_at   INTEGER NOT NULL
    )",
];

/// A node row as served by the query API.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct NodeRow {
    #[allow(missing_docs)]
    pub id: i64,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub uid: String,
}

/// A namespace row as served by the query API.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct NamespaceRow {
    #[allow(missing_docs)]
    pub id: i64,
    #[allow(missing_docs)]
    pub name: String,
}

/// A deployment row joined with its namespace name.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct DeploymentRow {
    #[allow(missing_docs)]
    pub id: i64,
    #[allow(missing_docs)]
    pub uid: String,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub namespace: String,
}

/// A pod row joined with its namespace, node and optional deployment names.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct PodRow {
    #[allow(missing_docs)]
    pub id: i64,
    #[allow(missing_docs)]
    pub uid: String,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub namespace: String,
    #[allow(missing_docs)]
    pub node: String,
    #[allow(missing_docs)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    /// Raw namespace id, used by the live view to group PVCs; never
    /// serialized.
    #[serde(skip_serializing)]
    pub namespace_id: i64,
}

/// A PVC row joined with its namespace name.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct PvcRow {
    #[allow(missing_docs)]
    pub id: i64,
    #[allow(missing_docs)]
    pub uid: String,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub namespace: String,
}

/// A PVC row in its raw form, used by the live view.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PvcLiveRow {
    #[allow(missing_docs)]
    pub id: i64,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub namespace_id: i64,
}

/// Selection parameters for [`IdentityCatalog::list_pods`].
///
/// All fields are optional and conjunctive; `ids` restricts to an explicit id
/// set (an empty set selects nothing).
#[derive(Debug, Clone, Default)]
pub struct PodFilter {
    #[allow(missing_docs)]
    pub deployment: Option<i64>,
    #[allow(missing_docs)]
    pub namespace: Option<i64>,
    #[allow(missing_docs)]
    pub node: Option<i64>,
    #[allow(missing_docs)]
    pub pod: Option<i64>,
    #[allow(missing_docs)]
    pub ids: Option<Vec<i64>>,
}

/// The identity store.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct IdentityCatalog {
    pool: SqlitePool,
}

impl IdentityCatalog {
    /// Open (creating if missing) the catalog database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        Self::init(SqlitePoolOptions::new().connect_with(options).await?).await
    }

    /// An in-memory catalog for tests.
    ///
    /// Restricted to a single pooled connection: every connection to
    /// `:memory:` is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::init(
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await?,
        )
        .await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Insert `name` if absent and return its id; idempotent.
    pub async fn upsert_namespace(&self, name: &str) -> Result<NamespaceId> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO namespace (name) VALUES (?1)
             ON CONFLICT (name) DO UPDATE SET name = excluded.name
             RETURNING id",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(NamespaceId::new(id))
    }

    /// Upsert a node.
    ///
    /// Conflicts on `name` fold the incoming (possibly real) UID onto the
    /// existing row, so a stub created by a racing Pod event and the real
    /// Node event always resolve to the same id; conflicts on `uid` refresh
    /// the name. The table never grows a second row for one name.
    pub async fn upsert_node(&self, uid: &str, name: &str) -> Result<NodeId> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO node (uid, name, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (name) DO UPDATE SET uid = excluded.uid, updated_at = excluded.updated_at
             ON CONFLICT (uid) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(uid)
        .bind(name)
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(NodeId::new(id))
    }

    /// Upsert a deployment; conflict target is `uid`.
    pub async fn upsert_deployment(
        &self,
        uid: &str,
        name: &str,
        namespace_id: NamespaceId,
    ) -> Result<DeploymentId> {
        self.upsert_controller("deployment", uid, name, namespace_id)
            .await
            .map(DeploymentId::new)
    }

    /// Upsert a statefulset; conflict target is `uid`.
    pub async fn upsert_statefulset(
        &self,
        uid: &str,
        name: &str,
        namespace_id: NamespaceId,
    ) -> Result<StatefulSetId> {
        self.upsert_controller("statefulset", uid, name, namespace_id)
            .await
            .map(StatefulSetId::new)
    }

    /// Upsert a daemonset; conflict target is `uid`.
    pub async fn upsert_daemonset(
        &self,
        uid: &str,
        name: &str,
        namespace_id: NamespaceId,
    ) -> Result<DaemonSetId> {
        self.upsert_controller("daemonset", uid, name, namespace_id)
            .await
            .map(DaemonSetId::new)
    }

    async fn upsert_controller(
        &self,
        table: &'static str,
        uid: &str,
        name: &str,
        namespace_id: NamespaceId,
    ) -> Result<i64> {
        // `table` is one of three compile-time constants, never caller input.
        let sql = format!(
            "INSERT INTO {table} (uid, name, namespace_id, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (uid) DO UPDATE SET
                 name = excluded.name,
                 namespace_id = excluded.namespace_id,
                 updated_at = excluded.updated_at
             RETURNING id"
        );
        Ok(sqlx::query_scalar::<_, i64>(&sql)
            .bind(uid)
            .bind(name)
            .bind(namespace_id.get())
            .bind(Utc::now().timestamp())
            .fetch_one(&self.pool)
            .await?)
    }

    /// Upsert a pod; conflict target is `uid`, all mutable fields are
    /// refreshed on conflict.
    ///
    /// At most one of the three controller links should be set; the caller
    /// resolves the pod's owner reference before calling.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_pod(
        &self,
        uid: &str,
        name: &str,
        namespace_id: NamespaceId,
        node_id: NodeId,
        deployment_id: Option<DeploymentId>,
        statefulset_id: Option<StatefulSetId>,
        daemonset_id: Option<DaemonSetId>,
    ) -> Result<PodId> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO pod
                 (uid, name, namespace_id, node_id, deployment_id, statefulset_id, daemonset_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (uid) DO UPDATE SET
                 name = excluded.name,
                 namespace_id = excluded.namespace_id,
                 node_id = excluded.node_id,
                 deployment_id = excluded.deployment_id,
                 statefulset_id = excluded.statefulset_id,
                 daemonset_id = excluded.daemonset_id,
                 updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(uid)
        .bind(name)
        .bind(namespace_id.get())
        .bind(node_id.get())
        .bind(deployment_id.map(|id| id.get()))
        .bind(statefulset_id.map(|id| id.get()))
        .bind(daemonset_id.map(|id| id.get()))
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(PodId::new(id))
    }

    /// Upsert a persistent volume claim; conflict target is `uid`.
    pub async fn upsert_pvc(
        &self,
        uid: &str,
        name: &str,
        namespace_id: NamespaceId,
    ) -> Result<PvcId> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO pvc (uid, name, namespace_id, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (uid) DO UPDATE SET
                 name = excluded.name,
                 namespace_id = excluded.namespace_id,
                 updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(uid)
        .bind(name)
        .bind(namespace_id.get())
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(PvcId::new(id))
    }

    /// Look up the internal id recorded for `uid` in the table for `kind`,
    /// or `None` if the UID has not been observed.
    pub async fn resource_id(&self, kind: EntityKind, uid: &str) -> Result<Option<i64>> {
        let sql = match kind {
            EntityKind::Node => "SELECT id FROM node WHERE uid = ?1",
            EntityKind::Deployment => "SELECT id FROM deployment WHERE uid = ?1",
            EntityKind::StatefulSet => "SELECT id FROM statefulset WHERE uid = ?1",
            EntityKind::DaemonSet => "SELECT id FROM daemonset WHERE uid = ?1",
            EntityKind::Pod => "SELECT id FROM pod WHERE uid = ?1",
            EntityKind::Pvc => "SELECT id FROM pvc WHERE uid = ?1",
        };
        Ok(sqlx::query_scalar::<_, i64>(sql)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// All nodes, ordered by name.
    pub async fn list_nodes(&self) -> Result<Vec<NodeRow>> {
        Ok(
            sqlx::query_as::<_, NodeRow>("SELECT id, name, uid FROM node ORDER BY name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// All namespaces, ordered by name.
    pub async fn list_namespaces(&self) -> Result<Vec<NamespaceRow>> {
        Ok(
            sqlx::query_as::<_, NamespaceRow>("SELECT id, name FROM namespace ORDER BY name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Deployments joined with their namespace name, optionally restricted
    /// to one namespace id.
    pub async fn list_deployments(&self, namespace: Option<i64>) -> Result<Vec<DeploymentRow>> {
        let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT d.id, d.uid, d.name, ns.name AS namespace
             FROM deployment d
             JOIN namespace ns ON ns.id = d.namespace_id",
        );
        if let Some(namespace) = namespace {
            query.push(" WHERE d.namespace_id = ").push_bind(namespace);
        }
        query.push(" ORDER BY d.name");
        Ok(query
            .build_query_as::<DeploymentRow>()
            .fetch_all(&self.pool)
            .await?)
    }

    /// PVCs joined with their namespace name, optionally restricted to one
    /// namespace id.
    pub async fn list_pvcs(&self, namespace: Option<i64>) -> Result<Vec<PvcRow>> {
        let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT v.id, v.uid, v.name, ns.name AS namespace
             FROM pvc v
             JOIN namespace ns ON ns.id = v.namespace_id",
        );
        if let Some(namespace) = namespace {
            query.push(" WHERE v.namespace_id = ").push_bind(namespace);
        }
        query.push(" ORDER BY v.name");
        Ok(query
            .build_query_as::<PvcRow>()
            .fetch_all(&self.pool)
            .await?)
    }

    /// Pods joined with namespace, node and optional deployment names,
    /// restricted by `filter`, ordered by pod name.
    pub async fn list_pods(&self, filter: &PodFilter) -> Result<Vec<PodRow>> {
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(vec![]);
            }
        }

        let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT p.id, p.uid, p.name, ns.name AS namespace, n.name AS node,
                    d.name AS deployment, p.namespace_id
             FROM pod p
             JOIN namespace ns ON ns.id = p.namespace_id
             JOIN node n ON n.id = p.node_id
             LEFT JOIN deployment d ON d.id = p.deployment_id
             WHERE 1 = 1",
        );
        if let Some(deployment) = filter.deployment {
            query.push(" AND p.deployment_id = ").push_bind(deployment);
        }
        if let Some(namespace) = filter.namespace {
            query.push(" AND p.namespace_id = ").push_bind(namespace);
        }
        if let Some(node) = filter.node {
            query.push(" AND p.node_id = ").push_bind(node);
        }
        if let Some(pod) = filter.pod {
            query.push(" AND p.id = ").push_bind(pod);
        }
        if let Some(ids) = &filter.ids {
            query.push(" AND p.id IN (");
            let mut separated = query.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            query.push(")");
        }
        query.push(" ORDER BY p.name");
        Ok(query
            .build_query_as::<PodRow>()
            .fetch_all(&self.pool)
            .await?)
    }

    /// Raw PVC rows for an explicit id set, used by the live view to group
    /// volume aggregates under pods of the same namespace.
    pub async fn live_pvcs(&self, ids: &[i64]) -> Result<Vec<PvcLiveRow>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut query: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT id, name, namespace_id FROM pvc WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        query.push(") ORDER BY name");
        Ok(query
            .build_query_as::<PvcLiveRow>()
            .fetch_all(&self.pool)
            .await?)
    }
}
