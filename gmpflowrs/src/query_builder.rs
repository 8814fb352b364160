//! Parameter validation and SQL rendering for catalog templates.
//!
//! The builder is the only place values reach SQL text. Every value is
//! rendered through the dialect according to its declared kind; nothing is
//! interpolated verbatim.

use std::collections::BTreeMap;

use crate::catalog::{QueryTemplate, Segment};
use crate::dialect::Dialect;
use crate::error::{GmpflowError, Result};
use crate::params::{CanonicalParams, ParamValue, QueryParams, END_DATE, START_DATE};

#[derive(Debug, Default, Clone, Copy)]
pub struct QueryBuilder;

impl QueryBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Validate `params` against the template schema and render the final SQL.
    pub fn build(
        &self,
        template: &QueryTemplate,
        params: &QueryParams,
        dialect: &dyn Dialect,
    ) -> Result<String> {
        let canonical = self.canonicalize(template, params)?;
        self.render(template, &canonical, dialect)
    }

    /// Check presence, kinds and date ordering; coerce text input to the declared kinds.
    pub fn canonicalize(
        &self,
        template: &QueryTemplate,
        params: &QueryParams,
    ) -> Result<CanonicalParams> {
        if let Some((name, _)) = params
            .iter()
            .find(|(name, _)| !template.params().contains_key(name.as_str()))
        {
            return Err(GmpflowError::invalid_param(
                name.as_str(),
                format!("not a parameter of template {}", template.id()),
            ));
        }

        let mut values = BTreeMap::new();
        for (name, kind) in template.params() {
            let raw = params
                .get(name)
                .cloned()
                .ok_or_else(|| GmpflowError::invalid_param(name.as_str(), "missing"))?;
            values.insert(name.clone(), raw.coerce(name, *kind)?);
        }

        if let (Some(ParamValue::Date(start)), Some(ParamValue::Date(end))) =
            (values.get(START_DATE), values.get(END_DATE))
        {
            if end < start {
                return Err(GmpflowError::invalid_param(
                    END_DATE,
                    format!("{end} is before start_date {start}"),
                ));
            }
        }

        Ok(CanonicalParams::from_validated(values))
    }

    /// Substitute canonical values into the template.
    pub fn render(
        &self,
        template: &QueryTemplate,
        params: &CanonicalParams,
        dialect: &dyn Dialect,
    ) -> Result<String> {
        let mut sql = String::with_capacity(template.sql().len());
        for segment in template.segments() {
            match segment {
                Segment::Sql(text) => sql.push_str(text),
                Segment::Param(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| GmpflowError::invalid_param(name.as_str(), "missing"))?;
                    sql.push_str(&render_value(value, dialect));
                }
            }
        }
        tracing::trace!(
            template = template.id(),
            dialect = dialect.name(),
            sql = %sql,
            "rendered template"
        );
        Ok(sql)
    }
}

fn render_value(value: &ParamValue, dialect: &dyn Dialect) -> String {
    match value {
        ParamValue::Date(date) => dialect.render_date(date),
        ParamValue::Bucket(bucket) => dialect.render_bucket(*bucket),
        ParamValue::Text(text) => dialect.render_string(text),
    }
}
