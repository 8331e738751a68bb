use crate::error::ReduceError;
use crate::worker::{Extraction, Extractor, JobContext, PageStats, ResultRecord};
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use std::io::Read;

pub const TABLE_CATEGORY: &str = "tables";

#[derive(Debug, Clone, PartialEq, Eq)]
struct WarcRecord<'a> {
    kind: String,
    target_uri: Option<String>,
    body: &'a [u8],
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split a decompressed WARC stream into records. Stops at the first malformed header.
fn warc_records(data: &[u8]) -> Result<Vec<WarcRecord<'_>>, ReduceError> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let rest = &data[pos..];
        let skip = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
        if skip == rest.len() {
            break;
        }
        let rest = &rest[skip..];
        if !rest.starts_with(b"WARC/") {
            return Err(ReduceError::Extraction(format!("expected WARC header at byte {}", pos + skip)));
        }
        let header_end = find(rest, b"\r\n\r\n")
            .ok_or_else(|| ReduceError::Extraction("unterminated WARC header".into()))?;
        let header = String::from_utf8_lossy(&rest[..header_end]);

        let mut kind = String::new();
        let mut target_uri = None;
        let mut length = None;
        for line in header.lines().skip(1) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "warc-type" => kind = value.to_string(),
                "warc-target-uri" => target_uri = Some(value.to_string()),
                "content-length" => length = value.parse::<usize>().ok(),
                _ => {}
            }
        }
        let length = length.ok_or_else(|| ReduceError::Extraction("WARC record without Content-Length".into()))?;
        let body_start = header_end + 4;
        let body_end = body_start
            .checked_add(length)
            .filter(|end| *end <= rest.len())
            .ok_or_else(|| ReduceError::Extraction(format!("truncated WARC record, Content-Length {}", length)))?;
        records.push(WarcRecord {
            kind,
            target_uri,
            body: &rest[body_start..body_end],
        });
        pos += skip + body_end;
    }
    Ok(records)
}

#[derive(Serialize)]
struct TableHit<'a> {
    url: &'a str,
    file: &'a str,
    tables: usize,
}

/// Counts `<table` elements in every response record and keeps pages that have any.
#[derive(Debug, Default)]
pub struct TableCountExtractor;

impl Extractor for TableCountExtractor {
    fn extract(&self, job: &JobContext, input: &[u8]) -> Result<Extraction, ReduceError> {
        let mut data = Vec::new();
        MultiGzDecoder::new(input).read_to_end(&mut data)?;

        let mut extraction = Extraction::default();
        let mut stats = PageStats {
            header: vec!["url".into(), "tables".into(), "bytes".into()],
            rows: Vec::new(),
        };
        let mut tables_total = 0u64;
        let mut pages_with_tables = 0u64;

        for record in warc_records(&data)? {
            if record.kind != "response" {
                continue;
            }
            job.token.check("extraction")?;
            extraction.pages_total += 1;
            let Some(url) = record.target_uri.as_deref() else {
                extraction.pages_errors += 1;
                continue;
            };

            let lower = record.body.to_ascii_lowercase();
            let tables = lower.windows(6).filter(|w| *w == b"<table").count();
            stats.rows.push(vec![url.to_string(), tables.to_string(), record.body.len().to_string()]);
            if tables == 0 {
                continue;
            }
            tables_total += tables as u64;
            pages_with_tables += 1;
            let hit = TableHit {
                url,
                file: &job.body_key,
                tables,
            };
            let payload = serde_json::to_string(&hit).map_err(|e| ReduceError::Extraction(e.to_string()))?;
            extraction.records.push(ResultRecord::new(TABLE_CATEGORY, &payload));
        }

        extraction.counters.insert("tablesTotal".to_string(), tables_total);
        extraction.counters.insert("pagesWithTables".to_string(), pages_with_tables);
        extraction.page_stats = Some(stats);
        Ok(extraction)
    }
}

#[cfg(test)]
pub(crate) fn warc_fixture(pages: &[(&str, &str)]) -> Vec<u8> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let warcinfo = "software: test";
    write!(
        encoder,
        "WARC/1.0\r\nWARC-Type: warcinfo\r\nContent-Length: {}\r\n\r\n{}\r\n\r\n",
        warcinfo.len(),
        warcinfo
    )
    .unwrap();
    for (url, body) in pages {
        write!(
            encoder,
            "WARC/1.0\r\nWARC-Type: response\r\nWARC-Target-URI: {}\r\nContent-Length: {}\r\n\r\n{}\r\n\r\n",
            url,
            body.len(),
            body
        )
        .unwrap();
    }
    encoder.finish().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::CancelToken;

    fn context() -> JobContext {
        JobContext {
            body_key: "in/a.warc.gz".into(),
            receive_count: 1,
            token: CancelToken::new(),
        }
    }

    #[test]
    fn test_counts_tables_per_response() {
        let input = warc_fixture(&[
            ("http://a", "<html><TABLE></table><table></table></html>"),
            ("http://b", "<html>no tables</html>"),
        ]);
        let extraction = TableCountExtractor.extract(&context(), &input).unwrap();
        assert_eq!(extraction.pages_total, 2);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.records[0].category, TABLE_CATEGORY);
        assert!(extraction.records[0].payload.contains("\"tables\":2"));
        assert_eq!(extraction.counters["tablesTotal"], 2);
        assert_eq!(extraction.page_stats.unwrap().rows.len(), 2);
    }

    #[test]
    fn test_rejects_non_warc_input() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, b"hello").unwrap();
        let input = encoder.finish().unwrap();
        assert!(matches!(
            TableCountExtractor.extract(&context(), &input),
            Err(ReduceError::Extraction(_))
        ));
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_oversized_content_length_is_an_extraction_error() {
        let record = format!(
            "WARC/1.0\r\nWARC-Type: response\r\nWARC-Target-URI: http://a\r\nContent-Length: {}\r\n\r\n<table>",
            usize::MAX
        );
        assert!(matches!(
            TableCountExtractor.extract(&context(), &gzip(record.as_bytes())),
            Err(ReduceError::Extraction(_))
        ));
    }

    #[test]
    fn test_truncated_body_is_an_extraction_error() {
        let record = b"WARC/1.0\r\nWARC-Type: response\r\nContent-Length: 500\r\n\r\nshort";
        assert!(matches!(
            TableCountExtractor.extract(&context(), &gzip(record)),
            Err(ReduceError::Extraction(_))
        ));
    }

    #[test]
    fn test_stops_when_cancelled() {
        let input = warc_fixture(&[("http://a", "<table>")]);
        let ctx = context();
        ctx.token.cancel();
        assert!(matches!(
            TableCountExtractor.extract(&ctx, &input),
            Err(ReduceError::Cancelled(_))
        ));
    }
}
