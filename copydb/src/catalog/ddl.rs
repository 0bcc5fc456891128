//! Table definitions of the three catalog roles.
//!
//! LSNs are stored as `X/X` text. Oids are stored as integers. Partial unique indexes on the
//! `summary` table enforce at most one row per table part, index and constraint.

use crate::catalog::store::CatalogRole;

const SETUP: &str = "create table setup(
    id integer primary key check (id = 1),
    source_pg_uri text,
    target_pg_uri text,
    snapshot text,
    split_tables_larger_than integer,
    split_max_parts integer,
    filters text,
    plugin text,
    slot_name text
)";

const SECTION: &str = "create table section(
    name text primary key,
    fetched boolean,
    start_time_epoch integer,
    done_time_epoch integer,
    duration integer
)";

const S_DATABASE: &str = "create table s_database(
    oid integer primary key,
    datname text,
    bytes integer,
    bytes_pretty text
)";

const S_DATABASE_PROPERTY: &str = "create table s_database_property(
    role_in_database boolean,
    rolname text,
    datname text,
    setconfig text
)";

const S_NAMESPACE: &str = "create table s_namespace(
    oid integer primary key,
    nspname text,
    restore_list_name text
)";

const S_NAMESPACE_NAME_INDEX: &str =
    "create unique index s_namespace_nspname on s_namespace(nspname)";

const S_TABLE: &str = "create table s_table(
    oid integer primary key,
    datname text,
    qname text,
    nspname text,
    relname text,
    amname text,
    restore_list_name text,
    relpages integer,
    reltuples integer,
    exclude_data boolean,
    part_key text
)";

const S_TABLE_QNAME_INDEX: &str = "create unique index s_table_qname on s_table(qname)";

const S_TABLE_RLNAME_INDEX: &str =
    "create unique index s_table_rlname on s_table(restore_list_name)";

const S_MATVIEW: &str = "create table s_matview(
    oid integer primary key,
    nspname text,
    relname text,
    restore_list_name text,
    exclude_data boolean
)";

const S_TABLE_SIZE: &str = "create table s_table_size(
    oid integer primary key,
    bytes integer,
    bytes_pretty text
)";

const S_ATTR: &str = "create table s_attr(
    oid integer,
    attnum integer,
    attypid integer,
    attname text,
    attisprimary boolean,
    attisgenerated boolean,
    primary key(oid, attnum)
)";

const S_TABLE_PART: &str = "create table s_table_part(
    oid integer,
    partnum integer,
    partcount integer,
    min integer,
    max integer,
    count integer,
    primary key(oid, partnum)
)";

const S_TABLE_CHKSUM: &str = "create table s_table_chksum(
    oid integer primary key,
    srcrowcount integer,
    srcsum text,
    dstrowcount integer,
    dstsum text
)";

const S_INDEX: &str = "create table s_index(
    oid integer primary key,
    qname text,
    nspname text,
    relname text,
    restore_list_name text,
    tableoid integer,
    isprimary boolean,
    isunique boolean,
    columns text,
    sql text
)";

const S_INDEX_TABLE_INDEX: &str = "create index s_index_tableoid on s_index(tableoid)";

const S_INDEX_NAME_INDEX: &str = "create unique index s_index_qname on s_index(nspname, relname)";

const S_CONSTRAINT: &str = "create table s_constraint(
    oid integer primary key,
    conname text,
    indexoid integer,
    condeferrable boolean,
    condeferred boolean,
    sql text
)";

const S_CONSTRAINT_INDEX_INDEX: &str =
    "create index s_constraint_indexoid on s_constraint(indexoid)";

const S_SEQ: &str = "create table s_seq(
    oid integer,
    ownedby integer,
    attrelid integer,
    attroid integer,
    datname text,
    qname text,
    nspname text,
    relname text,
    restore_list_name text,
    last_value integer,
    is_called boolean,
    primary key(oid, ownedby, attrelid, attroid)
)";

const S_DEPEND: &str = "create table s_depend(
    nspname text,
    relname text,
    refclassid integer,
    refobjid integer,
    classid integer,
    objid integer,
    deptype text,
    type text,
    identity text
)";

const S_EXTENSION: &str = "create table s_extension(
    oid integer primary key,
    extname text,
    extnamespace text,
    extrelocatable boolean
)";

const S_EXTENSION_CONFIG: &str = "create table s_extension_config(
    extoid integer,
    reloid integer,
    nspname text,
    relname text,
    condition text,
    relkind text
)";

const S_COLL: &str = "create table s_coll(
    oid integer primary key,
    collname text,
    description text,
    restore_list_name text
)";

const S_ROLE: &str = "create table s_role(
    oid integer primary key,
    rolname text
)";

const S_ROLE_NAME_INDEX: &str = "create unique index s_role_rolname on s_role(rolname)";

const PROCESS: &str = "create table process(
    pid integer,
    worker text,
    ps_type text,
    ps_title text,
    tableoid integer,
    partnum integer,
    indexoid integer,
    primary key(pid, worker)
)";

const TIMINGS: &str = "create table timings(
    section text primary key,
    start_time_epoch integer,
    done_time_epoch integer,
    duration integer,
    count integer,
    bytes integer
)";

const SUMMARY: &str = "create table summary(
    pid integer,
    token text,
    tableoid integer,
    partnum integer,
    indexoid integer,
    conoid integer,
    start_time_epoch integer,
    done_time_epoch integer,
    duration integer,
    bytes integer,
    command text
)";

const SUMMARY_TABLE_INDEX: &str = "create unique index summary_table_part
    on summary(tableoid, partnum)
    where indexoid is null and conoid is null";

const SUMMARY_INDEX_INDEX: &str =
    "create unique index summary_index on summary(indexoid) where indexoid is not null";

const SUMMARY_CONSTRAINT_INDEX: &str =
    "create unique index summary_constraint on summary(conoid) where conoid is not null";

const VACUUM_SUMMARY: &str = "create table vacuum_summary(
    pid integer,
    tableoid integer unique,
    start_time_epoch integer,
    done_time_epoch integer,
    duration integer
)";

const S_TABLE_PARTS_DONE: &str = "create table s_table_parts_done(
    tableoid integer primary key,
    pid integer,
    token text
)";

const S_TABLE_INDEXES_DONE: &str = "create table s_table_indexes_done(
    tableoid integer primary key,
    pid integer,
    token text
)";

const SENTINEL: &str = "create table sentinel(
    id integer primary key check (id = 1),
    startpos text,
    endpos text,
    apply boolean,
    write_lsn text,
    flush_lsn text,
    replay_lsn text
)";

const LSN_TRACKING: &str = "create table lsn_tracking(
    source text primary key,
    target text
)";

const TIMELINE_HISTORY: &str = "create table timeline_history(
    tli integer primary key,
    startpos text,
    endpos text
)";

const FILTER: &str = "create table filter(
    oid integer,
    restore_list_name text,
    kind text
)";

const FILTER_OID_INDEX: &str = "create unique index filter_oid on filter(oid) where oid > 0";

const FILTER_OID_RLNAME_INDEX: &str =
    "create unique index filter_oid_rlname on filter(oid, restore_list_name) where oid > 0";

const FILTER_RLNAME_INDEX: &str = "create index filter_rlname on filter(restore_list_name)";

const SOURCE_DDL: &[&str] = &[
    SETUP,
    SECTION,
    S_DATABASE,
    S_DATABASE_PROPERTY,
    S_NAMESPACE,
    S_NAMESPACE_NAME_INDEX,
    S_TABLE,
    S_TABLE_QNAME_INDEX,
    S_TABLE_RLNAME_INDEX,
    S_MATVIEW,
    S_TABLE_SIZE,
    S_ATTR,
    S_TABLE_PART,
    S_TABLE_CHKSUM,
    S_INDEX,
    S_INDEX_TABLE_INDEX,
    S_INDEX_NAME_INDEX,
    S_CONSTRAINT,
    S_CONSTRAINT_INDEX_INDEX,
    S_SEQ,
    S_EXTENSION,
    S_EXTENSION_CONFIG,
    S_COLL,
    PROCESS,
    TIMINGS,
    SUMMARY,
    SUMMARY_TABLE_INDEX,
    SUMMARY_INDEX_INDEX,
    SUMMARY_CONSTRAINT_INDEX,
    VACUUM_SUMMARY,
    S_TABLE_PARTS_DONE,
    S_TABLE_INDEXES_DONE,
    SENTINEL,
    LSN_TRACKING,
    TIMELINE_HISTORY,
];

const FILTER_DDL: &[&str] = &[
    SECTION,
    S_COLL,
    S_EXTENSION,
    S_EXTENSION_CONFIG,
    S_NAMESPACE,
    S_NAMESPACE_NAME_INDEX,
    S_TABLE,
    S_TABLE_QNAME_INDEX,
    S_MATVIEW,
    S_TABLE_SIZE,
    S_ATTR,
    S_TABLE_PART,
    S_INDEX,
    S_INDEX_TABLE_INDEX,
    S_INDEX_NAME_INDEX,
    S_CONSTRAINT,
    S_CONSTRAINT_INDEX_INDEX,
    S_SEQ,
    S_DEPEND,
    SUMMARY,
    SUMMARY_TABLE_INDEX,
    SUMMARY_INDEX_INDEX,
    SUMMARY_CONSTRAINT_INDEX,
    FILTER,
    FILTER_OID_INDEX,
    FILTER_OID_RLNAME_INDEX,
    FILTER_RLNAME_INDEX,
];

const TARGET_DDL: &[&str] = &[
    SECTION,
    S_ROLE,
    S_ROLE_NAME_INDEX,
    S_NAMESPACE,
    S_NAMESPACE_NAME_INDEX,
    S_TABLE,
    S_TABLE_QNAME_INDEX,
    S_TABLE_SIZE,
    S_ATTR,
    S_INDEX,
    S_INDEX_TABLE_INDEX,
    S_INDEX_NAME_INDEX,
    S_CONSTRAINT,
    S_CONSTRAINT_INDEX_INDEX,
];

const SOURCE_DROP: &[&str] = &[
    "drop table if exists setup",
    "drop table if exists section",
    "drop table if exists s_database",
    "drop table if exists s_database_property",
    "drop table if exists s_namespace",
    "drop table if exists s_table",
    "drop table if exists s_matview",
    "drop table if exists s_table_size",
    "drop table if exists s_attr",
    "drop table if exists s_table_part",
    "drop table if exists s_table_chksum",
    "drop table if exists s_index",
    "drop table if exists s_constraint",
    "drop table if exists s_seq",
    "drop table if exists s_extension",
    "drop table if exists s_extension_config",
    "drop table if exists s_coll",
    "drop table if exists process",
    "drop table if exists timings",
    "drop table if exists summary",
    "drop table if exists vacuum_summary",
    "drop table if exists s_table_parts_done",
    "drop table if exists s_table_indexes_done",
    "drop table if exists sentinel",
    "drop table if exists lsn_tracking",
    "drop table if exists timeline_history",
];

const FILTER_DROP: &[&str] = &[
    "drop table if exists section",
    "drop table if exists s_coll",
    "drop table if exists s_extension",
    "drop table if exists s_extension_config",
    "drop table if exists s_namespace",
    "drop table if exists s_table",
    "drop table if exists s_matview",
    "drop table if exists s_table_size",
    "drop table if exists s_attr",
    "drop table if exists s_table_part",
    "drop table if exists s_index",
    "drop table if exists s_constraint",
    "drop table if exists s_seq",
    "drop table if exists s_depend",
    "drop table if exists summary",
    "drop table if exists filter",
];

const TARGET_DROP: &[&str] = &[
    "drop table if exists section",
    "drop table if exists s_role",
    "drop table if exists s_namespace",
    "drop table if exists s_table",
    "drop table if exists s_table_size",
    "drop table if exists s_attr",
    "drop table if exists s_index",
    "drop table if exists s_constraint",
];

/// Statements creating the schema of `role`, in order.
pub fn create_statements(role: CatalogRole) -> &'static [&'static str] {
    match role {
        CatalogRole::Source => SOURCE_DDL,
        CatalogRole::Filter => FILTER_DDL,
        CatalogRole::Target => TARGET_DDL,
    }
}

/// Statements dropping the schema of `role`.
pub fn drop_statements(role: CatalogRole) -> &'static [&'static str] {
    match role {
        CatalogRole::Source => SOURCE_DROP,
        CatalogRole::Filter => FILTER_DROP,
        CatalogRole::Target => TARGET_DROP,
    }
}
