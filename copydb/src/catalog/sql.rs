//! Statement templates of the catalog access layer.
//!
//! Every query the crate runs against a catalog is one of these templates with positional `?`
//! parameters. Only DDL is not templated.

/// A catalog statement template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statement {
    BeginImmediate,
    Commit,
    Rollback,
    Attach,

    SetupInsert,
    SetupSelect,
    SetupUpdateSnapshot,
    SetupUpdateReplication,

    SectionUpsert,
    SectionSelect,
    SectionSelectAll,

    DatabaseInsert,
    DatabaseSelectAll,
    DatabasePropertyInsert,
    DatabasePropertySelectAll,
    NamespaceInsert,
    NamespaceSelectByName,
    ExtensionInsert,
    ExtensionSelectAll,
    ExtensionConfigInsert,
    ExtensionConfigSelect,
    CollationInsert,
    CollationSelectAll,
    RoleInsert,
    RoleSelectByName,
    DependInsert,
    MatviewInsert,
    MatviewSelectAll,

    TableInsert,
    TableSizeInsert,
    TableSetExcludeData,
    AttributeInsert,
    AttributeSelect,
    TablePartInsert,
    TablePartSelect,
    TableSelectByOid,
    TableSelectByName,
    TableSelectAll,
    TableSelectWithoutPrimaryKey,
    TableSelectWithGeneratedColumns,
    TableSelectInCopy,
    TableCount,
    ChecksumUpsertSource,
    ChecksumUpsertTarget,
    ChecksumSelect,

    IndexInsert,
    ConstraintInsert,
    IndexSelectByOid,
    IndexSelectByName,
    IndexSelectAll,
    IndexSelectByTable,
    IndexSelectInProgress,
    IndexCount,
    IndexCountBuildable,
    ConstraintSelectByName,

    SequenceInsert,
    SequenceUpdateValues,
    SequenceSelectByOid,
    SequenceSelectAll,

    FilterInsert,
    FilterPrepareObjects,
    FilterPrepareDepend,
    FilterPrepareExtensions,
    FilterPrepareCollations,
    FilterSelectByOid,
    FilterSelectByRestoreListName,
    FilterCount,

    ProcessUpsert,
    ProcessDelete,
    ProcessDeleteByPid,
    ProcessSelectAll,

    SummaryClaimTablePart,
    SummaryFinishTablePart,
    SummaryDeleteTablePart,
    SummarySelectTablePart,
    SummaryClaimIndex,
    SummaryFinishIndex,
    SummaryDeleteIndex,
    SummarySelectIndex,
    SummaryClaimConstraint,
    SummaryFinishConstraint,
    SummaryDeleteConstraint,
    SummarySelectConstraint,
    SummaryCountDone,
    SummarySelectTableBytes,

    PartsDoneInsert,
    PartsDoneSelect,
    IndexesDoneInsert,
    IndexesDoneSelect,
    IndexesDoneSelectAll,

    VacuumClaim,
    VacuumFinish,
    VacuumSelect,

    TimingStart,
    TimingDone,
    TimingIncrement,
    TimingSelectAll,

    SentinelSetup,
    SentinelSelect,
    SentinelUpdateStartpos,
    SentinelUpdateEndpos,
    SentinelUpdateApply,
    SentinelSyncRecv,
    SentinelSyncApply,

    LsnTrackingDeleteAll,
    LsnTrackingInsert,
    LsnTrackingSelectAll,

    TimelineInsert,
    TimelineSelectAll,
}

macro_rules! table_select {
    ($tail:literal) => {
        concat!(
            "select t.oid, t.datname, t.qname, t.nspname, t.relname, t.amname,
    t.restore_list_name, t.relpages, t.reltuples, coalesce(ts.bytes, 0) as bytes,
    t.exclude_data, t.part_key,
    (select count(*) from s_table_part p where p.oid = t.oid) as partcount
  from s_table t left join s_table_size ts on ts.oid = t.oid ",
            $tail
        )
    };
}

macro_rules! index_select {
    ($tail:literal) => {
        concat!(
            "select i.oid, i.qname, i.nspname, i.relname, i.restore_list_name,
    i.tableoid, t.nspname as table_nspname, t.relname as table_relname,
    i.isprimary, i.isunique, i.columns, i.sql,
    c.oid as conoid, c.conname, c.condeferrable, c.condeferred, c.sql as consql
  from s_index i
       left join s_table t on t.oid = i.tableoid
       left join s_constraint c on c.indexoid = i.oid ",
            $tail
        )
    };
}

macro_rules! summary_select {
    ($tail:literal) => {
        concat!(
            "select pid, token, tableoid, partnum, indexoid, conoid, start_time_epoch,
    done_time_epoch, duration, bytes, command
  from summary ",
            $tail
        )
    };
}

impl Statement {
    /// Text of the template.
    pub fn sql(self) -> &'static str {
        match self {
            Statement::BeginImmediate => "begin immediate",
            Statement::Commit => "commit",
            Statement::Rollback => "rollback",
            Statement::Attach => "attach database ? as",

            Statement::SetupInsert => {
                "insert into setup(id, source_pg_uri, target_pg_uri, snapshot,
    split_tables_larger_than, split_max_parts, filters, plugin, slot_name)
  values(1, ?, ?, ?, ?, ?, ?, ?, ?)"
            }
            Statement::SetupSelect => {
                "select source_pg_uri, target_pg_uri, snapshot, split_tables_larger_than,
    split_max_parts, filters, plugin, slot_name
  from setup where id = 1"
            }
            Statement::SetupUpdateSnapshot => "update setup set snapshot = ? where id = 1",
            Statement::SetupUpdateReplication => {
                "update setup set plugin = ?, slot_name = ? where id = 1"
            }

            Statement::SectionUpsert => {
                "insert into section(name, fetched, start_time_epoch, done_time_epoch, duration)
  values(?, ?, ?, ?, ?)
  on conflict(name) do update
     set fetched = excluded.fetched,
         start_time_epoch = excluded.start_time_epoch,
         done_time_epoch = excluded.done_time_epoch,
         duration = excluded.duration"
            }
            Statement::SectionSelect => {
                "select name, fetched, start_time_epoch, done_time_epoch, duration
  from section where name = ?"
            }
            Statement::SectionSelectAll => {
                "select name, fetched, start_time_epoch, done_time_epoch, duration
  from section order by start_time_epoch, name"
            }

            Statement::DatabaseInsert => {
                "insert or replace into s_database(oid, datname, bytes, bytes_pretty)
  values(?, ?, ?, ?)"
            }
            Statement::DatabaseSelectAll => {
                "select oid, datname, bytes, bytes_pretty from s_database order by datname"
            }
            Statement::DatabasePropertyInsert => {
                "insert into s_database_property(role_in_database, rolname, datname, setconfig)
  values(?, ?, ?, ?)"
            }
            Statement::DatabasePropertySelectAll => {
                "select role_in_database, rolname, datname, setconfig
  from s_database_property order by rowid"
            }
            Statement::NamespaceInsert => {
                "insert or ignore into s_namespace(oid, nspname, restore_list_name)
  values(?, ?, ?)"
            }
            Statement::NamespaceSelectByName => {
                "select oid, nspname, restore_list_name from s_namespace where nspname = ?"
            }
            Statement::ExtensionInsert => {
                "insert or ignore into s_extension(oid, extname, extnamespace, extrelocatable)
  values(?, ?, ?, ?)"
            }
            Statement::ExtensionSelectAll => {
                "select oid, extname, extnamespace, extrelocatable from s_extension order by extname"
            }
            Statement::ExtensionConfigInsert => {
                "insert into s_extension_config(extoid, reloid, nspname, relname, condition, relkind)
  values(?, ?, ?, ?, ?, ?)"
            }
            Statement::ExtensionConfigSelect => {
                "select extoid, reloid, nspname, relname, condition, relkind
  from s_extension_config where extoid = ? order by rowid"
            }
            Statement::CollationInsert => {
                "insert or ignore into s_coll(oid, collname, description, restore_list_name)
  values(?, ?, ?, ?)"
            }
            Statement::CollationSelectAll => {
                "select oid, collname, description, restore_list_name from s_coll order by collname"
            }
            Statement::RoleInsert => "insert or ignore into s_role(oid, rolname) values(?, ?)",
            Statement::RoleSelectByName => "select oid, rolname from s_role where rolname = ?",
            Statement::DependInsert => {
                "insert into s_depend(nspname, relname, refclassid, refobjid, classid, objid,
    deptype, type, identity)
  values(?, ?, ?, ?, ?, ?, ?, ?, ?)"
            }
            Statement::MatviewInsert => {
                "insert or ignore into s_matview(oid, nspname, relname, restore_list_name,
    exclude_data)
  values(?, ?, ?, ?, ?)"
            }
            Statement::MatviewSelectAll => {
                "select oid, nspname, relname, restore_list_name, exclude_data
  from s_matview order by oid"
            }

            Statement::TableInsert => {
                "insert into s_table(oid, datname, qname, nspname, relname, amname,
    restore_list_name, relpages, reltuples, exclude_data, part_key)
  values(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            }
            Statement::TableSizeInsert => {
                "insert or replace into s_table_size(oid, bytes, bytes_pretty) values(?, ?, ?)"
            }
            Statement::TableSetExcludeData => {
                "update s_table set exclude_data = ? where oid = ?"
            }
            Statement::AttributeInsert => {
                "insert into s_attr(oid, attnum, attypid, attname, attisprimary, attisgenerated)
  values(?, ?, ?, ?, ?, ?)"
            }
            Statement::AttributeSelect => {
                "select attnum, attypid, attname, attisprimary, attisgenerated
  from s_attr where oid = ? order by attnum"
            }
            Statement::TablePartInsert => {
                "insert into s_table_part(oid, partnum, partcount, min, max, count)
  values(?, ?, ?, ?, ?, ?)"
            }
            Statement::TablePartSelect => {
                "select partnum, partcount, min, max, count
  from s_table_part where oid = ? order by partnum"
            }
            Statement::TableSelectByOid => table_select!("where t.oid = ?"),
            Statement::TableSelectByName => {
                table_select!("where t.nspname = ? and t.relname = ?")
            }
            Statement::TableSelectAll => table_select!("order by bytes desc, t.oid"),
            Statement::TableSelectWithoutPrimaryKey => table_select!(
                "where not exists
         (select 1 from s_attr a where a.oid = t.oid and a.attisprimary)
  order by bytes desc, t.oid"
            ),
            Statement::TableSelectWithGeneratedColumns => table_select!(
                "where exists
         (select 1 from s_attr a where a.oid = t.oid and a.attisgenerated)
  order by bytes desc, t.oid"
            ),
            Statement::TableSelectInCopy => table_select!(
                "where exists
         (select 1
            from summary s
                 join process p
                   on p.pid = s.pid
                  and p.tableoid = s.tableoid
                  and p.partnum = s.partnum
           where s.tableoid = t.oid
             and s.indexoid is null
             and s.conoid is null
             and s.done_time_epoch is null)
  order by t.oid"
            ),
            Statement::TableCount => "select count(*) from s_table",
            Statement::ChecksumUpsertSource => {
                "insert into s_table_chksum(oid, srcrowcount, srcsum) values(?, ?, ?)
  on conflict(oid) do update
     set srcrowcount = excluded.srcrowcount, srcsum = excluded.srcsum"
            }
            Statement::ChecksumUpsertTarget => {
                "insert into s_table_chksum(oid, dstrowcount, dstsum) values(?, ?, ?)
  on conflict(oid) do update
     set dstrowcount = excluded.dstrowcount, dstsum = excluded.dstsum"
            }
            Statement::ChecksumSelect => {
                "select srcrowcount, srcsum, dstrowcount, dstsum from s_table_chksum where oid = ?"
            }

            Statement::IndexInsert => {
                "insert into s_index(oid, qname, nspname, relname, restore_list_name, tableoid,
    isprimary, isunique, columns, sql)
  values(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            }
            Statement::ConstraintInsert => {
                "insert into s_constraint(oid, conname, indexoid, condeferrable, condeferred, sql)
  values(?, ?, ?, ?, ?, ?)"
            }
            Statement::IndexSelectByOid => index_select!("where i.oid = ?"),
            Statement::IndexSelectByName => {
                index_select!("where i.nspname = ? and i.relname = ?")
            }
            Statement::IndexSelectAll => index_select!("order by i.tableoid, i.oid"),
            Statement::IndexSelectByTable => index_select!("where i.tableoid = ? order by i.oid"),
            Statement::IndexSelectInProgress => index_select!(
                "where exists
         (select 1
            from summary s
                 join process p on p.pid = s.pid and p.indexoid = s.indexoid
           where s.indexoid = i.oid
             and s.done_time_epoch is null)
  order by i.oid"
            ),
            Statement::IndexCount => "select count(*) from s_index",
            Statement::IndexCountBuildable => {
                "select count(*)
  from s_index i left join s_constraint c on c.indexoid = i.oid
 where i.tableoid = ?
   and (c.oid is null or i.isprimary or i.isunique)"
            }

            Statement::ConstraintSelectByName => {
                "select c.oid
  from s_constraint c join s_index i on i.oid = c.indexoid
 where i.nspname = ? and c.conname = ?
 limit 1"
            }

            Statement::SequenceInsert => {
                "insert or ignore into s_seq(oid, ownedby, attrelid, attroid, datname, qname,
    nspname, relname, restore_list_name, last_value, is_called)
  values(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            }
            Statement::SequenceUpdateValues => {
                "update s_seq set last_value = ?, is_called = ? where oid = ?"
            }
            Statement::SequenceSelectByOid => {
                "select oid, ownedby, attrelid, attroid, datname, qname, nspname, relname,
    restore_list_name, last_value, is_called
  from s_seq where oid = ? order by rowid limit 1"
            }
            Statement::SequenceSelectAll => {
                "select oid, ownedby, attrelid, attroid, datname, qname, nspname, relname,
    restore_list_name, last_value, is_called
  from s_seq order by oid, rowid"
            }

            Statement::FilterInsert => {
                "insert or ignore into filter(oid, restore_list_name, kind) values(?, ?, ?)"
            }
            Statement::FilterPrepareObjects => {
                "insert or ignore into filter(oid, restore_list_name, kind)
     select oid, restore_list_name, 'table' from s_table
  union all
     select oid, restore_list_name, 'matview' from s_matview
  union all
     select oid, restore_list_name, 'index' from s_index
  union all
     select oid, null as restore_list_name, 'constraint' from s_constraint
  union all
     select distinct s.oid, null as restore_list_name, 'sequence'
       from s_seq s
      where not exists (select 1 from source.s_seq ss where ss.oid = s.oid)
  union all
     select null as oid, restore_list_name, 'sequence owned by'
       from (select distinct s.restore_list_name
               from s_seq s
              where s.ownedby > 0
                and not exists
                    (select 1 from source.s_table st where st.oid = s.ownedby)
            ) as seqownedby
  union all
     select distinct s.attroid, s.restore_list_name, 'default'
       from s_seq s
      where s.attroid > 0"
            }
            Statement::FilterPrepareDepend => {
                "insert or ignore into filter(oid, restore_list_name, kind)
     select distinct objid, identity as restore_list_name, 'pg_depend'
       from s_depend d
      where not exists (select 1 from source.s_seq ss where ss.oid = d.objid)"
            }
            Statement::FilterPrepareExtensions => {
                "insert or ignore into filter(oid, restore_list_name, kind)
     select oid, extname, 'extension' from s_extension"
            }
            Statement::FilterPrepareCollations => {
                "insert or ignore into filter(oid, restore_list_name, kind)
     select oid, restore_list_name, 'coll' from s_coll"
            }
            Statement::FilterSelectByOid => {
                "select oid, restore_list_name, kind from filter where oid = ?"
            }
            Statement::FilterSelectByRestoreListName => {
                "select oid, restore_list_name, kind
  from filter where restore_list_name = ? order by rowid limit 1"
            }
            Statement::FilterCount => "select count(*) from filter",

            Statement::ProcessUpsert => {
                "insert into process(pid, worker, ps_type, ps_title, tableoid, partnum, indexoid)
  values(?, ?, ?, ?, ?, ?, ?)
  on conflict(pid, worker) do update
     set ps_type = excluded.ps_type,
         ps_title = excluded.ps_title,
         tableoid = excluded.tableoid,
         partnum = excluded.partnum,
         indexoid = excluded.indexoid"
            }
            Statement::ProcessDelete => "delete from process where pid = ? and worker = ?",
            Statement::ProcessDeleteByPid => "delete from process where pid = ?",
            Statement::ProcessSelectAll => {
                "select pid, worker, ps_type, ps_title, tableoid, partnum, indexoid
  from process order by pid, worker"
            }

            Statement::SummaryClaimTablePart => {
                "insert or replace into summary(pid, token, tableoid, partnum, start_time_epoch,
    command)
  values(?, ?, ?, ?, ?, ?)"
            }
            Statement::SummaryFinishTablePart => {
                "update summary
   set done_time_epoch = ?, duration = ?, bytes = ?
 where tableoid = ? and partnum = ? and indexoid is null and conoid is null"
            }
            Statement::SummaryDeleteTablePart => {
                "delete from summary
 where tableoid = ? and partnum = ? and indexoid is null and conoid is null"
            }
            Statement::SummarySelectTablePart => summary_select!(
                "where tableoid = ? and partnum = ? and indexoid is null and conoid is null"
            ),
            Statement::SummaryClaimIndex => {
                "insert or replace into summary(pid, token, tableoid, indexoid, start_time_epoch,
    command)
  values(?, ?, ?, ?, ?, ?)"
            }
            Statement::SummaryFinishIndex => {
                "update summary
   set done_time_epoch = ?, duration = ?, bytes = ?
 where indexoid = ?"
            }
            Statement::SummaryDeleteIndex => "delete from summary where indexoid = ?",
            Statement::SummarySelectIndex => summary_select!("where indexoid = ?"),
            Statement::SummaryClaimConstraint => {
                "insert or replace into summary(pid, token, tableoid, conoid, start_time_epoch,
    command)
  values(?, ?, ?, ?, ?, ?)"
            }
            Statement::SummaryFinishConstraint => {
                "update summary
   set done_time_epoch = ?, duration = ?, bytes = ?
 where conoid = ?"
            }
            Statement::SummaryDeleteConstraint => "delete from summary where conoid = ?",
            Statement::SummarySelectConstraint => summary_select!("where conoid = ?"),
            Statement::SummaryCountDone => {
                "select
    coalesce(sum(case when indexoid is null and conoid is null then 1 else 0 end), 0),
    coalesce(sum(case when indexoid is not null then 1 else 0 end), 0),
    coalesce(sum(case when conoid is not null then 1 else 0 end), 0),
    coalesce(sum(case when indexoid is null and conoid is null then bytes else 0 end), 0)
  from summary
 where done_time_epoch is not null"
            }
            Statement::SummarySelectTableBytes => {
                "select coalesce(sum(bytes), 0)
  from summary
 where tableoid = ? and indexoid is null and conoid is null
   and done_time_epoch is not null"
            }

            Statement::PartsDoneInsert => {
                "insert or ignore into s_table_parts_done(tableoid, pid, token) values(?, ?, ?)"
            }
            Statement::PartsDoneSelect => {
                "select pid, token from s_table_parts_done where tableoid = ?"
            }
            Statement::IndexesDoneInsert => {
                "insert or ignore into s_table_indexes_done(tableoid, pid, token) values(?, ?, ?)"
            }
            Statement::IndexesDoneSelect => {
                "select pid, token from s_table_indexes_done where tableoid = ?"
            }
            Statement::IndexesDoneSelectAll => "select tableoid from s_table_indexes_done",

            Statement::VacuumClaim => {
                "insert or replace into vacuum_summary(pid, tableoid, start_time_epoch)
  values(?, ?, ?)"
            }
            Statement::VacuumFinish => {
                "update vacuum_summary set done_time_epoch = ?, duration = ? where tableoid = ?"
            }
            Statement::VacuumSelect => {
                "select pid, start_time_epoch, done_time_epoch, duration
  from vacuum_summary where tableoid = ?"
            }

            Statement::TimingStart => {
                "insert into timings(section, start_time_epoch, count, bytes) values(?, ?, 0, 0)
  on conflict(section) do update
     set start_time_epoch = excluded.start_time_epoch,
         done_time_epoch = null,
         duration = null,
         count = 0,
         bytes = 0"
            }
            Statement::TimingDone => {
                "update timings set done_time_epoch = ?, duration = ? where section = ?"
            }
            Statement::TimingIncrement => {
                "update timings set count = count + ?, bytes = bytes + ? where section = ?"
            }
            Statement::TimingSelectAll => {
                "select section, start_time_epoch, done_time_epoch, duration, count, bytes
  from timings order by start_time_epoch, section"
            }

            Statement::SentinelSetup => {
                "insert or replace into sentinel(id, startpos, endpos, apply, write_lsn,
    flush_lsn, replay_lsn)
  values(1, ?, ?, false, '0/0', '0/0', '0/0')"
            }
            Statement::SentinelSelect => {
                "select startpos, endpos, apply, write_lsn, flush_lsn, replay_lsn
  from sentinel where id = 1"
            }
            Statement::SentinelUpdateStartpos => "update sentinel set startpos = ? where id = 1",
            Statement::SentinelUpdateEndpos => "update sentinel set endpos = ? where id = 1",
            Statement::SentinelUpdateApply => "update sentinel set apply = ? where id = 1",
            Statement::SentinelSyncRecv => {
                "update sentinel set startpos = ?, write_lsn = ?, flush_lsn = ? where id = 1"
            }
            Statement::SentinelSyncApply => "update sentinel set replay_lsn = ? where id = 1",

            Statement::LsnTrackingDeleteAll => "delete from lsn_tracking",
            Statement::LsnTrackingInsert => {
                "insert into lsn_tracking(source, target) values(?, ?)"
            }
            Statement::LsnTrackingSelectAll => "select source, target from lsn_tracking",

            Statement::TimelineInsert => {
                "insert or replace into timeline_history(tli, startpos, endpos) values(?, ?, ?)"
            }
            Statement::TimelineSelectAll => {
                "select tli, startpos, endpos from timeline_history order by tli"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE_COLUMNS: &str = "t.oid, t.datname, t.qname, t.nspname, t.relname, t.amname,
    t.restore_list_name, t.relpages, t.reltuples, coalesce(ts.bytes, 0) as bytes,
    t.exclude_data, t.part_key,
    (select count(*) from s_table_part p where p.oid = t.oid) as partcount";

    const INDEX_COLUMNS: &str = "i.oid, i.qname, i.nspname, i.relname, i.restore_list_name,
    i.tableoid, t.nspname as table_nspname, t.relname as table_relname,
    i.isprimary, i.isunique, i.columns, i.sql,
    c.oid as conoid, c.conname, c.condeferrable, c.condeferred, c.sql as consql";

    #[test]
    fn select_templates_share_their_column_lists() {
        assert!(Statement::TableSelectByOid.sql().contains(TABLE_COLUMNS));
        assert!(Statement::IndexSelectInProgress.sql().contains(INDEX_COLUMNS));
    }

    #[test]
    fn parameter_counts_match_bindings() {
        let count = |statement: Statement| statement.sql().matches('?').count();

        assert_eq!(count(Statement::SetupInsert), 8);
        assert_eq!(count(Statement::TableInsert), 11);
        assert_eq!(count(Statement::IndexInsert), 10);
        assert_eq!(count(Statement::SequenceInsert), 11);
        assert_eq!(count(Statement::SummaryClaimTablePart), 6);
        assert_eq!(count(Statement::SummaryFinishTablePart), 5);
        assert_eq!(count(Statement::ProcessUpsert), 7);
        assert_eq!(count(Statement::SentinelSyncRecv), 3);
    }
}
