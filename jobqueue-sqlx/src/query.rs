use jobqueue::store::Query;
use sqlx::{QueryBuilder, Sqlite};

use crate::types::{to_micros, JobStatus, COLUMNS};

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Sqlite>;
}

impl ToQuery for Query {
    fn query(&self) -> QueryBuilder<'_, Sqlite> {
        let mut builder = QueryBuilder::new(format!("SELECT {COLUMNS} FROM jobqueue_jobs WHERE"));
        handle_query(&mut builder, self);
        builder.push(" ORDER BY created_at, rowid");
        builder
    }
}

fn handle_query<'a>(builder: &mut QueryBuilder<'a, Sqlite>, query: &'a Query) {
    match query {
        Query::And(queries) => match queries.split_last() {
            Some((last, elements)) => {
                builder.push(" (");
                elements.iter().for_each(|query| {
                    handle_query(builder, query);
                    builder.push(" AND");
                });
                handle_query(builder, last);
                builder.push(")");
            }
            None => {
                builder.push(" 1 = 1");
            }
        },
        Query::TenantEqual(tenant_id) => {
            builder.push(" tenant_id = ");
            builder.push_bind(tenant_id.as_str());
        }
        Query::StatusEqual(status) => {
            builder.push(" status = ");
            builder.push_bind(JobStatus::from(*status));
        }
        Query::CreatedBefore(created_at) => {
            builder.push(" created_at < ");
            builder.push_bind(to_micros(*created_at));
        }
    }
}
