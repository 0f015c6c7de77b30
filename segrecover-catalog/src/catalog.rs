//! Segment configuration catalog
//!
//! Reads `gp_segment_configuration` from the coordinator and turns it into a
//! validated `ClusterTopology`.

use segrecover_core::{ClusterTopology, Segment};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::connection::{DbConnector, DbError, DbUrl, Result};

/// Columns are cast to text so every row decodes the same way
pub const SEGMENT_CONFIGURATION_QUERY: &str = "\
SELECT dbid::text, content::text, role::text, preferred_role::text, mode::text, status::text, \
hostname, address, port::text, datadir \
FROM pg_catalog.gp_segment_configuration \
ORDER BY content, preferred_role DESC";

/// Loads topology snapshots from the coordinator
#[derive(Clone)]
pub struct CatalogReader {
    connector: Arc<dyn DbConnector>,
    url: DbUrl,
}

impl CatalogReader {
    pub fn new(connector: Arc<dyn DbConnector>, url: DbUrl) -> Self {
        Self { connector, url }
    }

    pub fn url(&self) -> &DbUrl {
        &self.url
    }

    /// Query the catalog and build a fresh topology snapshot
    #[instrument(skip(self), fields(coordinator = %self.url))]
    pub async fn load_topology(&self) -> Result<ClusterTopology> {
        let mut conn = self.connector.connect(&self.url).await?;
        let rows = conn.query_rows(SEGMENT_CONFIGURATION_QUERY).await;
        conn.close().await?;
        let rows = rows?;

        let segments = rows_to_segments(rows)?;
        let topology =
            ClusterTopology::new(segments).map_err(|e| DbError::Invalid(e.to_string()))?;

        info!(
            segments = topology.get_seg_db_list().len(),
            down = topology.down_segments().len(),
            "Loaded segment configuration"
        );
        Ok(topology)
    }
}

/// Move a mirror's catalog entry to the location in `target`.
///
/// The entry is removed and re-added, and the catalog assigns a fresh dbid to
/// the re-added mirror. That dbid is returned.
#[instrument(skip(connector, target), fields(content = target.content, location = %target.location()))]
pub async fn relocate_mirror(connector: &dyn DbConnector, url: &DbUrl, target: &Segment) -> Result<i32> {
    let remove = format!("SELECT gp_remove_segment_mirror({}::int2)", target.content);
    let add = format!(
        "SELECT gp_add_segment_mirror({}::int2, {}, {}, {}, {})::text",
        target.content,
        sql_literal(&target.hostname),
        sql_literal(&target.address),
        target.port,
        sql_literal(&target.datadir)
    );

    let mut conn = connector.connect(url).await?;
    let outcome: Result<Vec<Vec<Option<String>>>> = async {
        conn.execute(&remove).await?;
        conn.query_rows(&add).await
    }
    .await;
    conn.close().await?;

    let dbid = outcome?
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next().flatten())
        .ok_or_else(|| DbError::Query("gp_add_segment_mirror returned no dbid".to_string()))?;
    let dbid = dbid
        .trim()
        .parse::<i32>()
        .map_err(|_| DbError::Invalid(format!("dbid '{}'", dbid)))?;
    info!(old_dbid = target.dbid, new_dbid = dbid, "Relocated mirror in catalog");
    Ok(dbid)
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn rows_to_segments(rows: Vec<Vec<Option<String>>>) -> Result<Vec<Segment>> {
    rows.into_iter()
        .map(|row| {
            let fields: Vec<String> = row.into_iter().map(Option::unwrap_or_default).collect();
            Segment::from_fields(&fields).map_err(|e| DbError::Invalid(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DbConnection;
    use parking_lot::Mutex;
    use segrecover_core::Role;

    struct CatalogConnection {
        rows: Vec<Vec<Option<String>>>,
        closes: Arc<Mutex<usize>>,
    }

    #[async_trait::async_trait]
    impl DbConnection for CatalogConnection {
        async fn execute(&mut self, _sql: &str) -> Result<u64> {
            Ok(0)
        }

        async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
            assert!(sql.contains("gp_segment_configuration"));
            Ok(self.rows.clone())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            *self.closes.lock() += 1;
            Ok(())
        }
    }

    struct CatalogConnector {
        rows: Vec<Vec<Option<String>>>,
        closes: Arc<Mutex<usize>>,
    }

    #[async_trait::async_trait]
    impl DbConnector for CatalogConnector {
        async fn connect(&self, url: &DbUrl) -> Result<Box<dyn DbConnection>> {
            assert!(url.utility);
            Ok(Box::new(CatalogConnection {
                rows: self.rows.clone(),
                closes: self.closes.clone(),
            }))
        }
    }

    fn row(line: &str) -> Vec<Option<String>> {
        line.split('|').map(|f| Some(f.to_string())).collect()
    }

    fn reader(rows: Vec<Vec<Option<String>>>) -> (CatalogReader, Arc<Mutex<usize>>) {
        let closes = Arc::new(Mutex::new(0));
        let connector = CatalogConnector {
            rows,
            closes: closes.clone(),
        };
        let url = DbUrl::new("cdw", 5432, "template1").utility();
        (CatalogReader::new(Arc::new(connector), url), closes)
    }

    #[tokio::test]
    async fn test_load_topology() {
        let (reader, closes) = reader(vec![
            row("1|-1|p|p|n|u|cdw|cdw|5432|/data/c"),
            row("2|0|p|p|s|u|sdw1|sdw1|6000|/data/p0"),
            row("3|0|m|m|s|u|sdw2|sdw2|7000|/data/m0"),
        ]);
        let topo = reader.load_topology().await.unwrap();
        assert_eq!(topo.segment_pairs().len(), 1);
        assert_eq!(topo.peer_of(2).map(|s| s.role), Some(Role::Mirror));
        assert_eq!(*closes.lock(), 1);
    }

    struct RelocateConnection {
        statements: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl DbConnection for RelocateConnection {
        async fn execute(&mut self, sql: &str) -> Result<u64> {
            self.statements.lock().push(sql.to_string());
            Ok(1)
        }

        async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
            self.statements.lock().push(sql.to_string());
            Ok(vec![vec![Some("9".to_string())]])
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    struct RelocateConnector {
        statements: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl DbConnector for RelocateConnector {
        async fn connect(&self, _url: &DbUrl) -> Result<Box<dyn DbConnection>> {
            Ok(Box::new(RelocateConnection {
                statements: self.statements.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_relocate_mirror() {
        let statements = Arc::new(Mutex::new(Vec::new()));
        let connector = RelocateConnector {
            statements: statements.clone(),
        };
        let target: Segment = "4|0|m|m|n|d|sdw3|sdw3|7000|/data/o'brien/m0".parse().unwrap();
        let url = DbUrl::new("cdw", 5432, "template1");

        let dbid = relocate_mirror(&connector, &url, &target).await.unwrap();
        assert_eq!(dbid, 9);
        let statements = statements.lock();
        assert_eq!(statements[0], "SELECT gp_remove_segment_mirror(0::int2)");
        assert!(statements[1].contains("'sdw3', 'sdw3', 7000, '/data/o''brien/m0'"));
    }

    #[tokio::test]
    async fn test_invalid_row_is_reported() {
        let (reader, closes) = reader(vec![
            row("1|-1|p|p|n|u|cdw|cdw|5432|/data/c"),
            row("2|0|q|p|s|u|sdw1|sdw1|6000|/data/p0"),
        ]);
        let err = reader.load_topology().await.unwrap_err();
        assert!(matches!(err, DbError::Invalid(_)));
        assert_eq!(*closes.lock(), 1);
    }
}
