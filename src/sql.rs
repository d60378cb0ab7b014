use std::collections::BTreeSet;

use crate::db::{Dialect, Value};
use crate::error::MartError;
use crate::query::{Filter, IdSource, Query};

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Condition {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn bare(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectBuilder {
    columns: Vec<String>,
    from: String,
    joins: Vec<(String, String)>,
    conditions: Vec<Condition>,
    order_by: Vec<String>,
    page: Option<Page>,
}

impl SelectBuilder {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            ..Self::default()
        }
    }

    pub fn column(&mut self, expr: impl Into<String>) -> &mut Self {
        self.columns.push(expr.into());
        self
    }

    pub fn join(&mut self, table: impl Into<String>, on: impl Into<String>) -> &mut Self {
        self.joins.push((table.into(), on.into()));
        self
    }

    pub fn condition(&mut self, condition: Condition) -> &mut Self {
        self.conditions.push(condition);
        self
    }

    pub fn order_by(&mut self, expr: impl Into<String>) -> &mut Self {
        let expr = expr.into();
        if !self.order_by.contains(&expr) {
            self.order_by.push(expr);
        }
        self
    }

    pub fn page(&mut self, limit: usize, offset: usize) -> &mut Self {
        self.page = Some(Page { limit, offset });
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn has_order(&self) -> bool {
        !self.order_by.is_empty()
    }

    /// Pages are only rendered for dialects that page by offset; the others cap rows
    /// on the cursor instead.
    pub fn render(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT {} FROM {}", self.columns.join(", "), self.from);
        for (table, on) in &self.joins {
            sql.push_str(&format!(" JOIN {table} ON {on}"));
        }

        let mut params = Vec::new();
        if !self.conditions.is_empty() {
            let clauses = self
                .conditions
                .iter()
                .map(|condition| format!("({})", condition.sql))
                .collect::<Vec<_>>();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
            for condition in &self.conditions {
                params.extend(condition.params.iter().cloned());
            }
        }

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }

        if let Some(page) = self.page {
            match dialect {
                Dialect::Mysql => sql.push_str(&format!(" LIMIT {}, {}", page.offset, page.limit)),
                Dialect::Postgres => {
                    sql.push_str(&format!(" LIMIT {} OFFSET {}", page.limit, page.offset))
                }
                Dialect::Oracle | Dialect::Generic => {}
            }
        }

        (sql, params)
    }
}

/// Turns a [`Query`] into SQL plus the key metadata the runners page on.
pub trait QueryCompiler {
    fn to_sql(&self, query: &Query) -> Result<SelectBuilder, MartError>;

    fn to_sql_with_key(&self, query: &Query) -> Result<SelectBuilder, MartError>;

    fn qualified_lowest_level_key(&self, query: &Query) -> String;

    fn lowest_level_key(&self, query: &Query) -> String;
}

/// Compiles queries against a star schema: every table joins the dataset's main table on
/// a shared key column.
#[derive(Debug, Clone, Copy, Default)]
pub struct StarSchemaCompiler;

impl StarSchemaCompiler {
    fn build(&self, query: &Query, with_key: bool) -> Result<SelectBuilder, MartError> {
        if query.attributes().is_empty() {
            return Err(MartError::InvalidQuery(format!(
                "query on dataset {} requests no attributes",
                query.dataset().name
            )));
        }

        let dataset = query.dataset();
        let main = dataset.main_table.as_str();
        let mut select = SelectBuilder::new(main);
        if with_key {
            select.column(self.qualified_lowest_level_key(query));
        }
        for attribute in query.attributes() {
            select.column(attribute.qualified());
        }

        let mut joined = BTreeSet::new();
        let referenced = query
            .attributes()
            .iter()
            .map(|attribute| (attribute.table.as_str(), attribute.key.as_deref()))
            .chain(
                query
                    .filters()
                    .iter()
                    .map(|filter| (filter.table(), filter.key())),
            )
            .chain(
                query
                    .sort_by()
                    .iter()
                    .map(|attribute| (attribute.table.as_str(), attribute.key.as_deref())),
            );
        for (table, key) in referenced {
            if table == main || !joined.insert(table.to_string()) {
                continue;
            }
            let key = key.unwrap_or(dataset.primary_key.as_str());
            select.join(table, format!("{table}.{key} = {main}.{key}"));
        }

        for filter in query.filters() {
            select.condition(filter_condition(filter)?);
        }
        for attribute in query.sort_by() {
            select.order_by(attribute.qualified());
        }
        Ok(select)
    }
}

impl QueryCompiler for StarSchemaCompiler {
    fn to_sql(&self, query: &Query) -> Result<SelectBuilder, MartError> {
        self.build(query, false)
    }

    fn to_sql_with_key(&self, query: &Query) -> Result<SelectBuilder, MartError> {
        self.build(query, true)
    }

    fn qualified_lowest_level_key(&self, query: &Query) -> String {
        format!(
            "{}.{}",
            query.dataset().main_table,
            self.lowest_level_key(query)
        )
    }

    fn lowest_level_key(&self, query: &Query) -> String {
        query.dataset().primary_key.clone()
    }
}

fn filter_condition(filter: &Filter) -> Result<Condition, MartError> {
    let column = filter.qualified();
    match filter {
        Filter::Basic(basic) => {
            if !basic.operator.takes_value() {
                return Ok(Condition::bare(format!("{column} {}", basic.operator.sql())));
            }
            let value = basic.value.clone().ok_or_else(|| {
                MartError::InvalidQuery(format!("filter on {column} is missing a value"))
            })?;
            Ok(Condition::new(
                format!("{column} {} ?", basic.operator.sql()),
                vec![Value::Text(value)],
            ))
        }
        Filter::IdList(list) => match &list.source {
            IdSource::Values(values) if values.is_empty() => Ok(Condition::bare("1 = 0")),
            IdSource::Values(values) => {
                let placeholders = vec!["?"; values.len()].join(", ");
                Ok(Condition::new(
                    format!("{column} IN ({placeholders})"),
                    values.iter().cloned().map(Value::Text).collect(),
                ))
            }
            IdSource::SubQuery(_) | IdSource::Url(_) => Err(MartError::InvalidQuery(format!(
                "id list on {column} has not been resolved"
            ))),
        },
    }
}
