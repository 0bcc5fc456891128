//! Source and target clients over `tokio-postgres`.

use std::borrow::Cow;

use async_trait::async_trait;
use copydb_config::shared::ConnectionConfig;
use futures::{SinkExt, StreamExt, pin_mut};
use secrecy::ExposeSecret;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, Connection, NoTls, Row, SimpleQueryMessage, Socket};
use tracing::{Instrument, debug, error, info};

use crate::catalog::{
    Collation, Depend, Extension, ExtensionConfig, Namespace, SourceConstraint, SourceIndex,
    SourceSequence, SourceTable, TableAttribute, TableChecksum,
};
use crate::clients::base::{Connector, CopySpec, SourceClient, SourceSchema, TargetClient};
use crate::copydb_error;
use crate::error::{CopyDbError, CopyDbResult, ErrorKind};
use crate::replay::Applier;
use crate::types::{Oid, PgLsn};

/// Schemas never copied.
const SYSTEM_SCHEMAS: &str = "n.nspname !~ '^pg_' and n.nspname <> 'information_schema'";

const NAMESPACES_QUERY: &str = "
select n.oid, n.nspname,
       format('- %s %s', n.nspname, r.rolname) as restore_list_name
  from pg_catalog.pg_namespace n
  join pg_catalog.pg_roles r on r.oid = n.nspowner
 where {system}
 order by n.nspname";

const EXTENSIONS_QUERY: &str = "
select e.oid, e.extname, n.nspname as extnamespace, e.extrelocatable
  from pg_catalog.pg_extension e
  join pg_catalog.pg_namespace n on n.oid = e.extnamespace
 order by e.extname";

const EXTENSION_CONFIG_QUERY: &str = "
select e.oid as extoid, c.oid as reloid, n.nspname, c.relname, cfg.condition,
       c.relkind::text as relkind
  from pg_catalog.pg_extension e,
       unnest(e.extconfig, e.extcondition) as cfg(reloid, condition)
  join pg_catalog.pg_class c on c.oid = cfg.reloid
  join pg_catalog.pg_namespace n on n.oid = c.relnamespace
 order by e.oid, c.oid";

const COLLATIONS_QUERY: &str = "
select c.oid, c.collname,
       pg_catalog.pg_describe_object('pg_catalog.pg_collation'::regclass, c.oid, 0) as description,
       format('%s %s %s', n.nspname, c.collname, r.rolname) as restore_list_name
  from pg_catalog.pg_collation c
  join pg_catalog.pg_namespace n on n.oid = c.collnamespace
  join pg_catalog.pg_roles r on r.oid = c.collowner
 where c.oid >= 16384
 order by c.oid";

const TABLES_QUERY: &str = "
select c.oid, current_database() as datname,
       format('%I.%I', n.nspname, c.relname) as qname,
       n.nspname, c.relname, am.amname,
       format('%s %s %s', n.nspname, c.relname, r.rolname) as restore_list_name,
       c.relpages::bigint as relpages,
       c.reltuples::bigint as reltuples,
       pg_catalog.pg_table_size(c.oid) as bytes,
       (select a.attname
          from pg_catalog.pg_index x
          join pg_catalog.pg_attribute a
            on a.attrelid = x.indrelid and a.attnum = x.indkey[0]
         where x.indrelid = c.oid
           and x.indisprimary
           and x.indnatts = 1
           and a.atttypid in ('int2'::regtype, 'int4'::regtype, 'int8'::regtype)
       ) as part_key
  from pg_catalog.pg_class c
  join pg_catalog.pg_namespace n on n.oid = c.relnamespace
  join pg_catalog.pg_roles r on r.oid = c.relowner
  left join pg_catalog.pg_am am on am.oid = c.relam
 where c.relkind = 'r'
   and {system}
   and not exists
       (select 1 from pg_catalog.pg_depend d
         where d.classid = 'pg_catalog.pg_class'::regclass
           and d.objid = c.oid
           and d.deptype = 'e')
 order by bytes desc, c.oid";

const ATTRIBUTES_QUERY: &str = "
select a.attrelid, a.attnum, a.atttypid, a.attname,
       exists(select 1 from pg_catalog.pg_index x
               where x.indrelid = a.attrelid
                 and x.indisprimary
                 and a.attnum = any(x.indkey)) as attisprimary,
       a.attgenerated <> '' as attisgenerated
  from pg_catalog.pg_attribute a
  join pg_catalog.pg_class c on c.oid = a.attrelid
  join pg_catalog.pg_namespace n on n.oid = c.relnamespace
 where c.relkind = 'r'
   and a.attnum > 0
   and not a.attisdropped
   and {system}
 order by a.attrelid, a.attnum";

const INDEXES_QUERY: &str = "
select i.oid, format('%I.%I', n.nspname, i.relname) as qname,
       n.nspname, i.relname,
       format('%s %s %s', n.nspname, i.relname, r.rolname) as restore_list_name,
       t.oid as tableoid, tn.nspname as table_nspname, t.relname as table_relname,
       x.indisprimary, x.indisunique,
       (select string_agg(quote_ident(a.attname), ',' order by a.attnum)
          from pg_catalog.pg_attribute a
         where a.attrelid = t.oid and a.attnum = any(x.indkey)) as columns,
       pg_catalog.pg_get_indexdef(x.indexrelid) as sql,
       c.oid as conoid, c.conname, c.condeferrable, c.condeferred,
       pg_catalog.pg_get_constraintdef(c.oid) as condef
  from pg_catalog.pg_index x
  join pg_catalog.pg_class i on i.oid = x.indexrelid
  join pg_catalog.pg_namespace n on n.oid = i.relnamespace
  join pg_catalog.pg_roles r on r.oid = i.relowner
  join pg_catalog.pg_class t on t.oid = x.indrelid
  join pg_catalog.pg_namespace tn on tn.oid = t.relnamespace
  left join pg_catalog.pg_constraint c
         on c.conindid = x.indexrelid
        and c.conrelid = t.oid
        and c.contype in ('p', 'u', 'x')
 where t.relkind = 'r'
   and tn.nspname !~ '^pg_' and tn.nspname <> 'information_schema'
 order by t.oid, i.oid";

const SEQUENCES_QUERY: &str = "
select c.oid,
       coalesce(d.refobjid, 0::oid) as ownedby,
       coalesce(ad.adrelid, 0::oid) as attrelid,
       coalesce(ad.oid, 0::oid) as attroid,
       current_database() as datname,
       format('%I.%I', n.nspname, c.relname) as qname,
       n.nspname, c.relname,
       format('%s %s %s', n.nspname, c.relname, r.rolname) as restore_list_name
  from pg_catalog.pg_class c
  join pg_catalog.pg_namespace n on n.oid = c.relnamespace
  join pg_catalog.pg_roles r on r.oid = c.relowner
  left join pg_catalog.pg_depend d
         on d.classid = 'pg_catalog.pg_class'::regclass
        and d.objid = c.oid
        and d.refclassid = 'pg_catalog.pg_class'::regclass
        and d.deptype in ('a', 'i')
  left join pg_catalog.pg_depend dd
         on dd.refclassid = 'pg_catalog.pg_class'::regclass
        and dd.refobjid = c.oid
        and dd.classid = 'pg_catalog.pg_attrdef'::regclass
  left join pg_catalog.pg_attrdef ad on ad.oid = dd.objid
 where c.relkind = 'S'
   and {system}
 order by c.oid";

const DEPENDS_QUERY: &str = "
select distinct n.nspname, c.relname, d.refclassid, d.refobjid, d.classid, d.objid,
       d.deptype::text as deptype, o.type, o.identity
  from pg_catalog.pg_depend d
  join pg_catalog.pg_class c on c.oid = d.refobjid
  join pg_catalog.pg_namespace n on n.oid = c.relnamespace
  cross join lateral pg_catalog.pg_identify_object(d.classid, d.objid, d.objsubid) o
 where d.refclassid = 'pg_catalog.pg_class'::regclass
   and d.refobjid = any($1)
   and d.deptype in ('n', 'a')
   and d.objid <> d.refobjid
 order by d.refobjid, d.objid";

fn with_system_filter(query: &str) -> String {
    query.replace("{system}", SYSTEM_SCHEMAS)
}

fn checksum_sql(qname: &str) -> String {
    format!(
        "select count(1)::bigint as rowcount,
                coalesce(sum(('x' || substr(md5(t::text), 1, 16))::bit(64)::bigint), 0)::text
                  as checksum
           from only {qname} t"
    )
}

/// Spawns a background task driving a Postgres connection until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!("an error occurred during the postgres connection: {}", err),
            Ok(()) => debug!("postgres connection terminated"),
        }
    }
    .instrument(span);

    // The client terminates the connection when dropped.
    tokio::spawn(task);
}

async fn connect(config: &ConnectionConfig) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = tokio_postgres::connect(config.uri.expose_secret(), NoTls).await?;
    spawn_postgres_connection::<NoTls>(connection);

    Ok(client)
}

/// Re-classifies a client error raised on the target server.
pub fn target_error(err: tokio_postgres::Error) -> CopyDbError {
    let source_side = CopyDbError::from(err);
    let kind = match source_side.kind() {
        ErrorKind::SourceConnectionFailed => ErrorKind::TargetConnectionFailed,
        _ => ErrorKind::TargetQueryFailed,
    };
    let description = match kind {
        ErrorKind::TargetConnectionFailed => "Target connection failed",
        _ => "Target query failed",
    };
    let detail = source_side.detail().unwrap_or_default().to_string();

    copydb_error!(kind, description, detail)
}

fn oid(row: &Row, column: &str) -> Result<Oid, tokio_postgres::Error> {
    row.try_get::<_, u32>(column).map(Oid)
}

/// Reads the rows of a query filtered on the user schemas.
async fn query_catalog(client: &Client, query: &str) -> Result<Vec<Row>, tokio_postgres::Error> {
    let query: Cow<'_, str> = if query.contains("{system}") {
        Cow::Owned(with_system_filter(query))
    } else {
        Cow::Borrowed(query)
    };

    client.query(query.as_ref(), &[]).await
}

async fn fetch_index_list(client: &Client) -> Result<Vec<SourceIndex>, tokio_postgres::Error> {
    let rows = client.query(INDEXES_QUERY, &[]).await?;

    let mut indexes = Vec::with_capacity(rows.len());
    for row in rows {
        let constraint = match row.try_get::<_, Option<u32>>("conoid")? {
            Some(conoid) => Some(SourceConstraint {
                oid: Oid(conoid),
                name: row.try_get("conname")?,
                deferrable: row.try_get("condeferrable")?,
                deferred: row.try_get("condeferred")?,
                sql: row.try_get("condef")?,
            }),
            None => None,
        };

        indexes.push(SourceIndex {
            oid: oid(&row, "oid")?,
            qname: row.try_get("qname")?,
            nspname: row.try_get("nspname")?,
            relname: row.try_get("relname")?,
            restore_list_name: row.try_get("restore_list_name")?,
            table_oid: oid(&row, "tableoid")?,
            table_nspname: row.try_get("table_nspname")?,
            table_relname: row.try_get("table_relname")?,
            is_primary: row.try_get("indisprimary")?,
            is_unique: row.try_get("indisunique")?,
            columns: row
                .try_get::<_, Option<String>>("columns")?
                .unwrap_or_default(),
            sql: row.try_get("sql")?,
            constraint,
        });
    }

    Ok(indexes)
}

async fn fetch_checksum(
    client: &Client,
    qname: &str,
) -> Result<TableChecksum, tokio_postgres::Error> {
    let row = client.query_one(checksum_sql(qname).as_str(), &[]).await?;

    Ok(TableChecksum {
        rowcount: row.try_get("rowcount")?,
        checksum: row.try_get("checksum")?,
    })
}

/// A connection to the source server.
#[derive(Debug)]
pub struct PostgresSource {
    client: Client,
}

impl PostgresSource {
    async fn fetch_tables(&self) -> Result<Vec<SourceTable>, tokio_postgres::Error> {
        let rows = query_catalog(&self.client, TABLES_QUERY).await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            tables.push(SourceTable {
                oid: oid(&row, "oid")?,
                datname: row.try_get("datname")?,
                qname: row.try_get("qname")?,
                nspname: row.try_get("nspname")?,
                relname: row.try_get("relname")?,
                amname: row.try_get("amname")?,
                restore_list_name: row.try_get("restore_list_name")?,
                relpages: row.try_get("relpages")?,
                reltuples: row.try_get("reltuples")?,
                bytes: row.try_get::<_, i64>("bytes")?.max(0) as u64,
                exclude_data: false,
                part_key: row.try_get("part_key")?,
                partcount: 0,
                attributes: Vec::new(),
                parts: Vec::new(),
            });
        }

        let rows = query_catalog(&self.client, ATTRIBUTES_QUERY).await?;
        for row in rows {
            let relid = oid(&row, "attrelid")?;
            let Some(table) = tables.iter_mut().find(|table| table.oid == relid) else {
                continue;
            };

            table.attributes.push(TableAttribute {
                attnum: i32::from(row.try_get::<_, i16>("attnum")?),
                atttypid: oid(&row, "atttypid")?,
                attname: row.try_get("attname")?,
                attisprimary: row.try_get("attisprimary")?,
                attisgenerated: row.try_get("attisgenerated")?,
            });
        }

        Ok(tables)
    }

    async fn fetch_sequences(&self) -> Result<Vec<SourceSequence>, tokio_postgres::Error> {
        let rows = query_catalog(&self.client, SEQUENCES_QUERY).await?;

        rows.iter()
            .map(|row| {
                Ok(SourceSequence {
                    oid: oid(row, "oid")?,
                    ownedby: oid(row, "ownedby")?,
                    attrelid: oid(row, "attrelid")?,
                    attroid: oid(row, "attroid")?,
                    datname: row.try_get("datname")?,
                    qname: row.try_get("qname")?,
                    nspname: row.try_get("nspname")?,
                    relname: row.try_get("relname")?,
                    restore_list_name: row.try_get("restore_list_name")?,
                    last_value: 0,
                    is_called: false,
                })
            })
            .collect()
    }

    async fn fetch_extensions(&self) -> Result<Vec<Extension>, tokio_postgres::Error> {
        let rows = self.client.query(EXTENSIONS_QUERY, &[]).await?;
        let mut extensions = Vec::with_capacity(rows.len());
        for row in rows {
            extensions.push(Extension {
                oid: oid(&row, "oid")?,
                extname: row.try_get("extname")?,
                extnamespace: row.try_get("extnamespace")?,
                extrelocatable: row.try_get("extrelocatable")?,
                config: Vec::new(),
            });
        }

        let rows = self.client.query(EXTENSION_CONFIG_QUERY, &[]).await?;
        for row in rows {
            let extoid = oid(&row, "extoid")?;
            let Some(extension) = extensions.iter_mut().find(|ext| ext.oid == extoid) else {
                continue;
            };

            extension.config.push(ExtensionConfig {
                reloid: oid(&row, "reloid")?,
                nspname: row.try_get("nspname")?,
                relname: row.try_get("relname")?,
                condition: row.try_get("condition")?,
                relkind: row.try_get("relkind")?,
            });
        }

        Ok(extensions)
    }

    async fn fetch_namespaces(&self) -> Result<Vec<Namespace>, tokio_postgres::Error> {
        let rows = query_catalog(&self.client, NAMESPACES_QUERY).await?;

        rows.iter()
            .map(|row| {
                Ok(Namespace {
                    oid: oid(row, "oid")?,
                    nspname: row.try_get("nspname")?,
                    restore_list_name: row.try_get("restore_list_name")?,
                })
            })
            .collect()
    }

    async fn fetch_collations(&self) -> Result<Vec<Collation>, tokio_postgres::Error> {
        let rows = self.client.query(COLLATIONS_QUERY, &[]).await?;

        rows.iter()
            .map(|row| {
                Ok(Collation {
                    oid: oid(row, "oid")?,
                    collname: row.try_get("collname")?,
                    description: row.try_get("description")?,
                    restore_list_name: row.try_get("restore_list_name")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl SourceClient for PostgresSource {
    async fn export_snapshot(&mut self) -> CopyDbResult<String> {
        self.client
            .batch_execute("begin isolation level repeatable read read only")
            .await?;
        let row = self
            .client
            .query_one("select pg_catalog.pg_export_snapshot()", &[])
            .await?;
        let snapshot: String = row.try_get(0)?;

        info!(%snapshot, "exported source snapshot");

        Ok(snapshot)
    }

    async fn set_snapshot(&mut self, snapshot: &str) -> CopyDbResult<()> {
        let sql = format!(
            "begin isolation level repeatable read read only; set transaction snapshot {}",
            pg_escape::quote_literal(snapshot)
        );
        self.client.batch_execute(&sql).await?;

        Ok(())
    }

    async fn fetch_schema(&mut self) -> CopyDbResult<SourceSchema> {
        Ok(SourceSchema {
            namespaces: self.fetch_namespaces().await?,
            extensions: self.fetch_extensions().await?,
            collations: self.fetch_collations().await?,
            tables: self.fetch_tables().await?,
            indexes: fetch_index_list(&self.client).await?,
            sequences: self.fetch_sequences().await?,
        })
    }

    async fn fetch_depends(&mut self, relations: &[Oid]) -> CopyDbResult<Vec<Depend>> {
        if relations.is_empty() {
            return Ok(Vec::new());
        }

        let relations: Vec<u32> = relations.iter().map(|oid| oid.into_inner()).collect();
        let rows = self.client.query(DEPENDS_QUERY, &[&relations]).await?;

        let mut depends = Vec::with_capacity(rows.len());
        for row in rows {
            depends.push(Depend {
                nspname: row.try_get("nspname")?,
                relname: row.try_get("relname")?,
                refclassid: oid(&row, "refclassid")?,
                refobjid: oid(&row, "refobjid")?,
                classid: oid(&row, "classid")?,
                objid: oid(&row, "objid")?,
                deptype: row.try_get("deptype")?,
                kind: row.try_get("type")?,
                identity: row.try_get("identity")?,
            });
        }

        Ok(depends)
    }

    async fn key_range(&mut self, qname: &str, column: &str) -> CopyDbResult<Option<(i64, i64)>> {
        let column = pg_escape::quote_identifier(column);
        let sql = format!("select min({column})::bigint, max({column})::bigint from only {qname}");
        let row = self.client.query_one(sql.as_str(), &[]).await?;

        let min: Option<i64> = row.try_get(0)?;
        let max: Option<i64> = row.try_get(1)?;

        Ok(min.zip(max))
    }

    async fn table_checksum(&mut self, qname: &str) -> CopyDbResult<TableChecksum> {
        Ok(fetch_checksum(&self.client, qname).await?)
    }

    async fn sequence_value(&mut self, qname: &str) -> CopyDbResult<(i64, bool)> {
        let sql = format!("select last_value, is_called from {qname}");
        let row = self.client.query_one(sql.as_str(), &[]).await?;

        Ok((row.try_get(0)?, row.try_get(1)?))
    }

    async fn current_wal_lsn(&mut self) -> CopyDbResult<PgLsn> {
        let row = self
            .client
            .query_one("select pg_catalog.pg_current_wal_lsn()", &[])
            .await?;

        Ok(row.try_get(0)?)
    }
}

/// A connection to the target server.
#[derive(Debug)]
pub struct PostgresTarget {
    client: Client,
}

impl PostgresTarget {
    async fn lsn(&self, sql: &str) -> CopyDbResult<PgLsn> {
        let row = self.client.query_one(sql, &[]).await.map_err(target_error)?;
        row.try_get(0).map_err(target_error)
    }
}

#[async_trait]
impl TargetClient for PostgresTarget {
    async fn execute(&mut self, sql: &str) -> CopyDbResult<u64> {
        let messages = self.client.simple_query(sql).await.map_err(target_error)?;

        let affected = messages
            .iter()
            .rev()
            .find_map(|message| match message {
                SimpleQueryMessage::CommandComplete(rows) => Some(*rows),
                _ => None,
            })
            .unwrap_or(0);

        Ok(affected)
    }

    async fn fetch_indexes(&mut self) -> CopyDbResult<Vec<SourceIndex>> {
        fetch_index_list(&self.client).await.map_err(target_error)
    }

    async fn table_checksum(&mut self, qname: &str) -> CopyDbResult<TableChecksum> {
        fetch_checksum(&self.client, qname)
            .await
            .map_err(target_error)
    }
}

impl Applier for PostgresTarget {
    async fn begin(&mut self, xid: u32) -> CopyDbResult<()> {
        debug!(xid, "applying transaction");
        self.client.batch_execute("begin").await.map_err(target_error)
    }

    async fn apply(&mut self, sql: &str) -> CopyDbResult<()> {
        self.client.batch_execute(sql).await.map_err(target_error)
    }

    async fn commit(&mut self) -> CopyDbResult<PgLsn> {
        self.client
            .batch_execute("commit")
            .await
            .map_err(target_error)?;

        self.lsn("select pg_catalog.pg_current_wal_insert_lsn()").await
    }

    async fn flush_lsn(&mut self) -> CopyDbResult<PgLsn> {
        self.lsn("select pg_catalog.pg_current_wal_flush_lsn()").await
    }
}

/// Opens plain connections to the configured servers.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    source: ConnectionConfig,
    target: Option<ConnectionConfig>,
}

impl PostgresConnector {
    pub fn new(source: ConnectionConfig, target: Option<ConnectionConfig>) -> Self {
        Self { source, target }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Source = PostgresSource;
    type Target = PostgresTarget;

    async fn connect_source(&self) -> CopyDbResult<PostgresSource> {
        let client = connect(&self.source).await?;

        Ok(PostgresSource { client })
    }

    async fn connect_target(&self) -> CopyDbResult<PostgresTarget> {
        let Some(target) = &self.target else {
            return Err(copydb_error!(
                ErrorKind::ConfigError,
                "No target connection is configured"
            ));
        };

        let client = connect(target).await.map_err(target_error)?;

        Ok(PostgresTarget { client })
    }

    async fn copy_rows(
        &self,
        source: &mut PostgresSource,
        target: &mut PostgresTarget,
        copy: &CopySpec,
    ) -> CopyDbResult<u64> {
        let source_sql = copy.source_sql();
        let target_sql = copy.target_sql();

        let stream = source.client.copy_out(source_sql.as_str()).await?;
        let sink = target
            .client
            .copy_in(target_sql.as_str())
            .await
            .map_err(target_error)?;
        pin_mut!(stream);
        pin_mut!(sink);

        let mut bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            bytes += chunk.len() as u64;
            sink.send(chunk).await.map_err(target_error)?;
        }

        let rows = sink.as_mut().finish().await.map_err(target_error)?;
        debug!(%copy, rows, bytes, "copied rows");

        Ok(bytes)
    }
}
