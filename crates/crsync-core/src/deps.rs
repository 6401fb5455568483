//! Table dependency extraction.
//!
//! Subscriptions are routed by table name: a change batch touches the tables
//! its records name, and a query depends on every table any part of its plan
//! reads, at any nesting depth.

use std::collections::{BTreeSet, HashSet};
use std::convert::Infallible;

use crate::change::ChangeRecord;
use crate::codec::EncodedBatch;
use crate::error::CodecError;
use crate::plan::{walk_select, Plan, Select, TableRef, Visitor};

/// Anything that can report the tables it depends on.
pub trait Dependencies {
    type Error;

    fn affected_tables(&self) -> Result<BTreeSet<String>, Self::Error>;
}

/// Free-function form of [`Dependencies::affected_tables`].
pub fn affected_tables<D: Dependencies + ?Sized>(source: &D) -> Result<BTreeSet<String>, D::Error> {
    source.affected_tables()
}

impl Dependencies for Plan {
    type Error = Infallible;

    fn affected_tables(&self) -> Result<BTreeSet<String>, Infallible> {
        let mut collector = TableCollector::default();
        collector.visit_plan(self);
        Ok(collector.tables)
    }
}

impl Dependencies for Select {
    type Error = Infallible;

    fn affected_tables(&self) -> Result<BTreeSet<String>, Infallible> {
        let mut collector = TableCollector::default();
        collector.visit_select(self);
        Ok(collector.tables)
    }
}

impl Dependencies for [ChangeRecord] {
    type Error = Infallible;

    fn affected_tables(&self) -> Result<BTreeSet<String>, Infallible> {
        Ok(self.iter().map(|r| r.table.clone()).collect())
    }
}

impl Dependencies for EncodedBatch {
    type Error = CodecError;

    fn affected_tables(&self) -> Result<BTreeSet<String>, CodecError> {
        Ok(self.decode()?.into_iter().map(|r| r.table).collect())
    }
}

/// Tables touched by a decoded batch.
pub fn tables_of(records: &[ChangeRecord]) -> BTreeSet<String> {
    records.affected_tables().unwrap_or_else(|never| match never {})
}

/// Collects base table names. CTE names in scope shadow tables.
#[derive(Default)]
struct TableCollector {
    tables: BTreeSet<String>,
    scopes: Vec<HashSet<String>>,
}

impl TableCollector {
    fn is_cte(&self, table: &TableRef) -> bool {
        table.schema.is_none() && self.scopes.iter().any(|scope| scope.contains(&table.name))
    }
}

impl Visitor for TableCollector {
    fn visit_select(&mut self, select: &Select) {
        let scoped = !select.ctes.is_empty();
        if scoped {
            self.scopes
                .push(select.ctes.iter().map(|cte| cte.name.clone()).collect());
        }
        walk_select(self, select);
        if scoped {
            self.scopes.pop();
        }
    }

    fn visit_table_ref(&mut self, table: &TableRef) {
        if !self.is_cte(table) {
            self.tables.insert(table.name.clone());
        }
    }
}
