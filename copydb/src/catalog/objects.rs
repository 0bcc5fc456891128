//! Database-level objects: databases and their properties, namespaces, extensions,
//! collations, roles, materialized views and dependency edges.
//!
//! These are populated once while fetching the schema, before any worker runs, so none of the
//! writes take the catalog semaphore.

use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::catalog::sql::Statement;
use crate::catalog::store::Catalog;
use crate::error::CopyDbResult;
use crate::progress::pretty_bytes;
use crate::types::Oid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDatabase {
    pub oid: Oid,
    pub datname: String,
    pub bytes: u64,
}

/// A `ALTER DATABASE ... SET` or `ALTER ROLE ... IN DATABASE ... SET` property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseProperty {
    pub role_in_database: bool,
    pub rolname: Option<String>,
    pub datname: String,
    pub setconfig: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Namespace {
    pub oid: Oid,
    pub nspname: String,
    pub restore_list_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Extension {
    pub oid: Oid,
    pub extname: String,
    pub extnamespace: String,
    pub extrelocatable: bool,
    pub config: Vec<ExtensionConfig>,
}

/// A configuration table registered by an extension, whose rows are dumped separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionConfig {
    pub reloid: Oid,
    pub nspname: String,
    pub relname: String,
    pub condition: Option<String>,
    pub relkind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collation {
    pub oid: Oid,
    pub collname: String,
    pub description: Option<String>,
    pub restore_list_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Role {
    pub oid: Oid,
    pub rolname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Matview {
    pub oid: Oid,
    pub nspname: String,
    pub relname: String,
    pub restore_list_name: String,
    pub exclude_data: bool,
}

/// A dependency edge pointing at an excluded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Depend {
    pub nspname: String,
    pub relname: String,
    pub refclassid: Oid,
    pub refobjid: Oid,
    pub classid: Oid,
    pub objid: Oid,
    pub deptype: String,
    pub kind: String,
    /// Identity of the dependent object, matching its archive restore-list name.
    pub identity: String,
}

impl Catalog {
    pub async fn add_database(&self, database: &SourceDatabase) -> CopyDbResult<()> {
        let bytes_pretty = pretty_bytes(database.bytes);
        let bytes_pretty = bytes_pretty.as_str();

        self.run(Statement::DatabaseInsert, |pool| async move {
            sqlx::query(Statement::DatabaseInsert.sql())
                .bind(database.oid)
                .bind(&database.datname)
                .bind(database.bytes as i64)
                .bind(bytes_pretty)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn databases(&self) -> CopyDbResult<Vec<SourceDatabase>> {
        let rows = self
            .run(Statement::DatabaseSelectAll, |pool| async move {
                sqlx::query(Statement::DatabaseSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows
            .iter()
            .map(|row| SourceDatabase {
                oid: row.get("oid"),
                datname: row.get("datname"),
                bytes: row.get::<i64, _>("bytes") as u64,
            })
            .collect())
    }

    pub async fn add_database_property(&self, property: &DatabaseProperty) -> CopyDbResult<()> {
        self.run(Statement::DatabasePropertyInsert, |pool| async move {
            sqlx::query(Statement::DatabasePropertyInsert.sql())
                .bind(property.role_in_database)
                .bind(property.rolname.as_deref())
                .bind(&property.datname)
                .bind(&property.setconfig)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn database_properties(&self) -> CopyDbResult<Vec<DatabaseProperty>> {
        let rows = self
            .run(Statement::DatabasePropertySelectAll, |pool| async move {
                sqlx::query(Statement::DatabasePropertySelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows
            .iter()
            .map(|row| DatabaseProperty {
                role_in_database: row.get("role_in_database"),
                rolname: row.get("rolname"),
                datname: row.get("datname"),
                setconfig: row.get("setconfig"),
            })
            .collect())
    }

    pub async fn add_namespace(&self, namespace: &Namespace) -> CopyDbResult<()> {
        self.run(Statement::NamespaceInsert, |pool| async move {
            sqlx::query(Statement::NamespaceInsert.sql())
                .bind(namespace.oid)
                .bind(&namespace.nspname)
                .bind(&namespace.restore_list_name)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn lookup_namespace_by_name(&self, nspname: &str) -> CopyDbResult<Option<Namespace>> {
        let row = self
            .run_locked(Statement::NamespaceSelectByName, |pool| async move {
                sqlx::query(Statement::NamespaceSelectByName.sql())
                    .bind(nspname)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        Ok(row.map(|row| Namespace {
            oid: row.get("oid"),
            nspname: row.get("nspname"),
            restore_list_name: row.get("restore_list_name"),
        }))
    }

    /// Adds an extension and its configuration tables.
    pub async fn add_extension(&self, extension: &Extension) -> CopyDbResult<()> {
        self.run(Statement::ExtensionInsert, |pool| async move {
            sqlx::query(Statement::ExtensionInsert.sql())
                .bind(extension.oid)
                .bind(&extension.extname)
                .bind(&extension.extnamespace)
                .bind(extension.extrelocatable)
                .execute(&pool)
                .await
        })
        .await?;

        for config in &extension.config {
            self.run(Statement::ExtensionConfigInsert, |pool| async move {
                sqlx::query(Statement::ExtensionConfigInsert.sql())
                    .bind(extension.oid)
                    .bind(config.reloid)
                    .bind(&config.nspname)
                    .bind(&config.relname)
                    .bind(config.condition.as_deref())
                    .bind(&config.relkind)
                    .execute(&pool)
                    .await
            })
            .await?;
        }

        Ok(())
    }

    pub async fn extensions(&self) -> CopyDbResult<Vec<Extension>> {
        let rows = self
            .run(Statement::ExtensionSelectAll, |pool| async move {
                sqlx::query(Statement::ExtensionSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        let mut extensions = Vec::with_capacity(rows.len());
        for row in rows {
            let oid: Oid = row.get("oid");
            let config = self
                .run(Statement::ExtensionConfigSelect, |pool| async move {
                    sqlx::query(Statement::ExtensionConfigSelect.sql())
                        .bind(oid)
                        .fetch_all(&pool)
                        .await
                })
                .await?;

            extensions.push(Extension {
                oid,
                extname: row.get("extname"),
                extnamespace: row.get("extnamespace"),
                extrelocatable: row.get("extrelocatable"),
                config: config.iter().map(extension_config_from_row).collect(),
            });
        }

        Ok(extensions)
    }

    pub async fn add_collation(&self, collation: &Collation) -> CopyDbResult<()> {
        self.run(Statement::CollationInsert, |pool| async move {
            sqlx::query(Statement::CollationInsert.sql())
                .bind(collation.oid)
                .bind(&collation.collname)
                .bind(collation.description.as_deref())
                .bind(&collation.restore_list_name)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn collations(&self) -> CopyDbResult<Vec<Collation>> {
        let rows = self
            .run(Statement::CollationSelectAll, |pool| async move {
                sqlx::query(Statement::CollationSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows
            .iter()
            .map(|row| Collation {
                oid: row.get("oid"),
                collname: row.get("collname"),
                description: row.get("description"),
                restore_list_name: row.get("restore_list_name"),
            })
            .collect())
    }

    pub async fn add_role(&self, role: &Role) -> CopyDbResult<()> {
        self.run(Statement::RoleInsert, |pool| async move {
            sqlx::query(Statement::RoleInsert.sql())
                .bind(role.oid)
                .bind(&role.rolname)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn lookup_role_by_name(&self, rolname: &str) -> CopyDbResult<Option<Role>> {
        let row = self
            .run_locked(Statement::RoleSelectByName, |pool| async move {
                sqlx::query(Statement::RoleSelectByName.sql())
                    .bind(rolname)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        Ok(row.map(|row| Role {
            oid: row.get("oid"),
            rolname: row.get("rolname"),
        }))
    }

    pub async fn add_matview(&self, matview: &Matview) -> CopyDbResult<()> {
        self.run(Statement::MatviewInsert, |pool| async move {
            sqlx::query(Statement::MatviewInsert.sql())
                .bind(matview.oid)
                .bind(&matview.nspname)
                .bind(&matview.relname)
                .bind(&matview.restore_list_name)
                .bind(matview.exclude_data)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn matviews(&self) -> CopyDbResult<Vec<Matview>> {
        let rows = self
            .run(Statement::MatviewSelectAll, |pool| async move {
                sqlx::query(Statement::MatviewSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows
            .iter()
            .map(|row| Matview {
                oid: row.get("oid"),
                nspname: row.get("nspname"),
                relname: row.get("relname"),
                restore_list_name: row.get("restore_list_name"),
                exclude_data: row.get("exclude_data"),
            })
            .collect())
    }

    pub async fn add_depend(&self, depend: &Depend) -> CopyDbResult<()> {
        self.run(Statement::DependInsert, |pool| async move {
            sqlx::query(Statement::DependInsert.sql())
                .bind(&depend.nspname)
                .bind(&depend.relname)
                .bind(depend.refclassid)
                .bind(depend.refobjid)
                .bind(depend.classid)
                .bind(depend.objid)
                .bind(&depend.deptype)
                .bind(&depend.kind)
                .bind(&depend.identity)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }
}

fn extension_config_from_row(row: &SqliteRow) -> ExtensionConfig {
    ExtensionConfig {
        reloid: row.get("reloid"),
        nspname: row.get("nspname"),
        relname: row.get("relname"),
        condition: row.get("condition"),
        relkind: row.get("relkind"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::CatalogRole;

    #[tokio::test]
    async fn extensions_carry_their_config_tables() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();

        let extension = Extension {
            oid: Oid(16_500),
            extname: "postgis".to_string(),
            extnamespace: "public".to_string(),
            extrelocatable: false,
            config: vec![ExtensionConfig {
                reloid: Oid(16_510),
                nspname: "public".to_string(),
                relname: "spatial_ref_sys".to_string(),
                condition: Some("WHERE NOT (srid BETWEEN 2000 AND 6999)".to_string()),
                relkind: "r".to_string(),
            }],
        };
        catalog.add_extension(&extension).await.unwrap();

        assert_eq!(catalog.extensions().await.unwrap(), vec![extension]);
    }

    #[tokio::test]
    async fn roles_are_looked_up_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(CatalogRole::Target, dir.path().join("target.db"));
        catalog.init().await.unwrap();

        let role = Role {
            oid: Oid(10),
            rolname: "postgres".to_string(),
        };
        catalog.add_role(&role).await.unwrap();
        catalog.add_role(&role).await.unwrap();

        assert_eq!(
            catalog.lookup_role_by_name("postgres").await.unwrap(),
            Some(role)
        );
        assert_eq!(catalog.lookup_role_by_name("app").await.unwrap(), None);
    }
}
