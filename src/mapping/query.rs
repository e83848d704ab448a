//! Queries for the children of a collection relation

use crate::core::Result;
use crate::mapping::db_mapping::DbMapping;
use crate::mapping::relation::{Relation, RelationKind};
use crate::mapping::sql::{literal, quote};
use crate::storage::relational::{DbSource, Dialect};
use std::sync::Arc;

/// Statements selecting the rows a collection relation contains
pub struct SubnodeQuery<'a> {
    relation: &'a Relation,
    target: &'a Arc<DbMapping>,
    source: &'a dyn DbSource,
    local_values: Vec<Option<String>>,
    extensions: Option<Vec<String>>,
}

impl<'a> SubnodeQuery<'a> {
    /// Query for `relation` whose child rows live in `target`.
    /// `local_values` holds the home object's value for each constraint.
    pub fn new(
        relation: &'a Relation,
        target: &'a Arc<DbMapping>,
        source: &'a dyn DbSource,
        local_values: Vec<Option<String>>,
    ) -> Self {
        Self {
            relation,
            target,
            source,
            local_values,
            extensions: None,
        }
    }

    /// Restrict rows to the given extension ids of the target's storage
    pub fn with_extensions(mut self, extensions: Option<Vec<String>>) -> Self {
        self.extensions = extensions;
        self
    }

    fn dialect(&self) -> Dialect {
        self.source.dialect()
    }

    fn table(&self) -> Result<String> {
        self.target
            .table_name()
            .ok_or_else(|| crate::core::MappingError::MissingTable(self.target.type_name().to_string()).into())
    }

    /// WHERE conditions of the relation, without the keyword
    pub fn conditions(&self) -> Result<Vec<String>> {
        let table = self.table()?;
        let mut conditions = Vec::new();

        for (i, constraint) in self.relation.constraints.iter().enumerate() {
            let foreign = if constraint.foreign_is_id() {
                self.target.id_column()
            } else {
                constraint.foreign.clone()
            };
            match self.local_values.get(i).cloned().flatten() {
                Some(value) => {
                    let quoted = self.target.needs_quotes(&foreign, self.source)?;
                    conditions.push(format!("{}.{} = {}", table, foreign, literal(&value, quoted)?));
                }
                None => conditions.push(format!("{}.{} IS NULL", table, foreign)),
            }
        }

        if let Some((column, value)) = &self.relation.group_value {
            let quoted = self.target.needs_quotes(column, self.source)?;
            conditions.push(format!("{}.{} = {}", table, column, literal(value, quoted)?));
        }

        if let (Some(ids), Some(column)) = (&self.extensions, self.target.prototype_column()) {
            if ids.is_empty() {
                conditions.push(format!("{}.{} = {}", table, column, quote(self.target.type_name())));
            } else {
                let list: Vec<String> = ids.iter().map(|id| quote(id)).collect();
                conditions.push(format!("{}.{} IN ({})", table, column, list.join(", ")));
            }
        }

        if let Some(filter) = &self.relation.filter {
            conditions.push(format!("({})", filter));
        }

        Ok(conditions)
    }

    fn from_where(&self, table: &str) -> Result<String> {
        let mut sql = format!(" FROM {}", table);
        if let Some(tables) = &self.relation.additional_tables {
            sql.push_str(", ");
            sql.push_str(tables);
        }
        let conditions = self.conditions()?;
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        Ok(sql)
    }

    fn paginate(&self, sql: String) -> String {
        self.dialect()
            .paginate(&sql, self.relation.offset, self.relation.max_size)
    }

    /// Ids of the children, or the distinct group names for grouped
    /// collections
    pub fn ids_sql(&self) -> Result<String> {
        let table = self.table()?;
        let from_where = self.from_where(&table)?;

        let sql = match (&self.relation.kind, &self.relation.group) {
            (RelationKind::GroupBy, Some(group)) => {
                let order = group
                    .order
                    .clone()
                    .unwrap_or_else(|| format!("{}.{}", table, group.column));
                format!(
                    "SELECT DISTINCT {}.{}{} ORDER BY {}",
                    table, group.column, from_where, order
                )
            }
            _ => {
                let mut sql = String::from("SELECT ");
                if let Some(hints) = &self.relation.query_hints {
                    sql.push_str(hints);
                    sql.push(' ');
                }
                sql.push_str(&format!("{}.{}{}", table, self.target.id_column(), from_where));
                if let Some(order) = &self.relation.order {
                    sql.push_str(" ORDER BY ");
                    sql.push_str(order);
                }
                sql
            }
        };
        Ok(self.paginate(sql))
    }

    /// Number of children, or of groups for grouped collections
    pub fn count_sql(&self) -> Result<String> {
        let table = self.table()?;
        let from_where = self.from_where(&table)?;
        Ok(match (&self.relation.kind, &self.relation.group) {
            (RelationKind::GroupBy, Some(group)) => {
                format!("SELECT COUNT(DISTINCT {}.{}){}", table, group.column, from_where)
            }
            _ => format!("SELECT COUNT(*){}", from_where),
        })
    }

    /// Complete rows of the children, including aggressive joins
    pub fn rows_sql(&self) -> Result<String> {
        let select = self.target.select(self.dialect(), Some(self.relation))?;
        let mut sql = select.with_conditions(&self.conditions()?);
        if let Some(order) = &self.relation.order {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        Ok(self.paginate(sql))
    }

    /// Row of the child whose access name is `name`
    pub fn by_name_sql(&self, name: &str) -> Result<Option<String>> {
        let Some(column) = self.relation.accessname.as_deref() else {
            return Ok(None);
        };
        let table = self.table()?;
        let quoted = self.target.needs_quotes(column, self.source)?;
        let mut conditions = self.conditions()?;
        conditions.push(format!("{}.{} = {}", table, column, literal(name, quoted)?));
        let select = self.target.select(self.dialect(), Some(self.relation))?;
        Ok(Some(select.with_conditions(&conditions)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::column::{DbColumn, SqlType};
    use crate::mapping::properties::StaticSource;
    use crate::mapping::registry::MappingRegistry;
    use crate::storage::relational::{Row, SqlValue};

    struct Schema(Dialect);

    impl DbSource for Schema {
        fn name(&self) -> &str {
            "blog"
        }

        fn dialect(&self) -> Dialect {
            self.0
        }

        fn query(&self, _sql: &str) -> Result<Vec<Row>> {
            Ok(vec![Row::new().with("COUNT", SqlValue::Integer(0))])
        }

        fn execute(&self, _sql: &str, _params: &[SqlValue]) -> Result<u64> {
            Ok(0)
        }

        fn columns(&self, _table: &str) -> Result<Vec<DbColumn>> {
            Ok(vec![
                DbColumn::new("ID", SqlType::Integer),
                DbColumn::new("SITE_ID", SqlType::Integer),
                DbColumn::new("TITLE", SqlType::Text),
                DbColumn::new("DAY", SqlType::Text),
            ])
        }
    }

    fn setup(extra: &[(&str, &str)]) -> (MappingRegistry, Relation) {
        let registry = MappingRegistry::new("ID");
        registry.register("Story", Box::new(StaticSource::from_pairs([("_db", "blog"), ("_table", "STORY")])));
        let mut pairs = vec![
            ("_db", "blog"),
            ("_table", "SITE"),
            ("_children", "collection(Story)"),
            ("_children.foreign", "SITE_ID"),
        ];
        pairs.extend_from_slice(extra);
        registry.register("Site", Box::new(StaticSource::from_pairs(pairs)));
        registry.update_all().unwrap();
        let rel = registry.get("Site").unwrap().subnode_relation().unwrap();
        (registry, rel)
    }

    #[test]
    fn test_ids_query_with_window() {
        let (registry, rel) = setup(&[("_children.order", "TITLE")]);
        let story = registry.get("Story").unwrap();
        let source = Schema(Dialect::Standard);
        let rel = rel.window(1000, 1000);
        let query = SubnodeQuery::new(&rel, &story, &source, vec![Some("7".into())]);

        assert_eq!(
            query.ids_sql().unwrap(),
            "SELECT STORY.ID FROM STORY WHERE STORY.SITE_ID = 7 ORDER BY TITLE LIMIT 1000 OFFSET 1000"
        );
        assert_eq!(
            query.count_sql().unwrap(),
            "SELECT COUNT(*) FROM STORY WHERE STORY.SITE_ID = 7"
        );
    }

    #[test]
    fn test_rejects_non_numeric_local_value() {
        let (registry, rel) = setup(&[]);
        let story = registry.get("Story").unwrap();
        let source = Schema(Dialect::Standard);
        let query = SubnodeQuery::new(&rel, &story, &source, vec![Some("7 OR 1=1".into())]);
        assert!(query.ids_sql().is_err());
    }

    #[test]
    fn test_null_local_value_and_filter() {
        let (registry, rel) = setup(&[("_children.filter", "STORY.TITLE <> ''")]);
        let story = registry.get("Story").unwrap();
        let source = Schema(Dialect::Standard);
        let query = SubnodeQuery::new(&rel, &story, &source, vec![None]);
        assert_eq!(
            query.conditions().unwrap(),
            vec!["STORY.SITE_ID IS NULL".to_string(), "(STORY.TITLE <> '')".to_string()]
        );
    }

    #[test]
    fn test_group_queries() {
        let (registry, rel) = setup(&[("_children.group", "DAY"), ("_children.group.order", "STORY.DAY desc")]);
        let story = registry.get("Story").unwrap();
        let source = Schema(Dialect::Standard);
        let query = SubnodeQuery::new(&rel, &story, &source, vec![Some("7".into())]);
        assert_eq!(
            query.ids_sql().unwrap(),
            "SELECT DISTINCT STORY.DAY FROM STORY WHERE STORY.SITE_ID = 7 ORDER BY STORY.DAY desc"
        );
        assert_eq!(
            query.count_sql().unwrap(),
            "SELECT COUNT(DISTINCT STORY.DAY) FROM STORY WHERE STORY.SITE_ID = 7"
        );

        let inner = rel.for_group("2004'03");
        let query = SubnodeQuery::new(&inner, &story, &source, vec![Some("7".into())]);
        assert_eq!(
            query.conditions().unwrap(),
            vec!["STORY.SITE_ID = 7".to_string(), "STORY.DAY = '2004\\'03'".to_string()]
        );
    }

    #[test]
    fn test_by_name_and_rows() {
        let (registry, rel) = setup(&[("_children.accessname", "TITLE")]);
        let story = registry.get("Story").unwrap();
        let source = Schema(Dialect::Oracle);
        let query = SubnodeQuery::new(&rel, &story, &source, vec![Some("7".into())]);
        assert_eq!(
            query.by_name_sql("O'Brien").unwrap().unwrap(),
            "SELECT STORY.* FROM STORY WHERE STORY.SITE_ID = 7 AND STORY.TITLE = 'O\\'Brien'"
        );
        assert_eq!(
            query.rows_sql().unwrap(),
            "SELECT STORY.* FROM STORY WHERE STORY.SITE_ID = 7"
        );
    }
}
