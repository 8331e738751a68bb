use crate::error::ReduceError;
use crate::stat_writer::{AttributeStoreLike, StatRecord};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{info, warn};

/// Domains with fewer rows than this are left out of exports.
pub const MIN_RESULTS: usize = 5;

pub const KEY_COLUMN: &str = "_key";

pub fn gzip_csv_writer(path: &Path) -> Result<csv::Writer<GzEncoder<BufWriter<File>>>, ReduceError> {
    let file = File::create(path)?;
    Ok(csv::WriterBuilder::new().from_writer(GzEncoder::new(BufWriter::new(file), Compression::default())))
}

pub fn finish_gzip_csv(writer: csv::Writer<GzEncoder<BufWriter<File>>>) -> Result<(), ReduceError> {
    let encoder = writer
        .into_inner()
        .map_err(|e| ReduceError::Other(format!("unable to flush csv: {}", e)))?;
    encoder.finish()?;
    Ok(())
}

/// Write rows with `_key` first and the sorted union of attribute names after it.
pub fn write_records(records: &[StatRecord], path: &Path) -> Result<(), ReduceError> {
    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.attributes.keys().map(String::as_str))
        .collect();

    let mut writer = gzip_csv_writer(path)?;
    let mut header = vec![KEY_COLUMN];
    header.extend(columns.iter().copied());
    writer.write_record(&header)?;

    for record in records {
        let mut row = vec![record.key.as_str()];
        row.extend(
            columns
                .iter()
                .map(|c| record.attributes.get(*c).map(String::as_str).unwrap_or("")),
        );
        writer.write_record(&row)?;
    }
    finish_gzip_csv(writer)
}

/// Export every domain whose name starts with `domain_prefix` into one gzip CSV.
/// Returns the number of rows written.
pub fn export_domains(store: &dyn AttributeStoreLike, domain_prefix: &str, path: &Path) -> Result<usize, ReduceError> {
    let mut records = Vec::new();
    for domain in store.list_domains()? {
        if !domain.starts_with(domain_prefix) {
            continue;
        }
        let rows = store.scan(&domain)?;
        if rows.len() < MIN_RESULTS {
            warn!(domain = %domain, rows = rows.len(), "skipping domain, fewer than {} entries", MIN_RESULTS);
            continue;
        }
        info!(domain = %domain, rows = rows.len(), "exporting domain");
        records.extend(rows);
    }
    write_records(&records, path)?;
    info!(path = %path.display(), rows = records.len(), "wrote stat export");
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat_writer::{Attributes, InMemoryAttributeStore};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn read_gz(path: &Path) -> String {
        let mut out = String::new();
        GzDecoder::new(File::open(path).unwrap()).read_to_string(&mut out).unwrap();
        out
    }

    fn record(key: &str, pairs: &[(&str, &str)]) -> StatRecord {
        let attributes: Attributes = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        StatRecord { key: key.to_string(), attributes }
    }

    #[test]
    fn test_columns_are_key_plus_sorted_union() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("out.csv.gz");
        let records = vec![record("a", &[("size", "1"), ("duration", "2")]), record("b", &[("rate", "3")])];
        write_records(&records, &path).unwrap();
        assert_eq!(read_gz(&path), "_key,duration,rate,size\na,2,,1\nb,,3,\n");
    }

    #[test]
    fn test_export_skips_small_and_unrelated_domains() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("data.csv.gz");
        let store = InMemoryAttributeStore::new();
        for domain in ["data", "data2", "failed"] {
            store.create_domain(domain).unwrap();
        }
        let big: Vec<StatRecord> = (0..5).map(|i| record(&format!("k{}", i), &[("size", "1")])).collect();
        store.batch_put("data", &big).unwrap();
        store.batch_put("data2", &big[..2]).unwrap();
        store.batch_put("failed", &big).unwrap();

        let rows = export_domains(&store, "data", &path).unwrap();
        assert_eq!(rows, 5);
        assert_eq!(read_gz(&path).lines().count(), 6);
    }
}
