use crate::error::RowError;
use crate::framework::*;
use crate::lookup::Lookup;

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use log::{error, warn};

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub const MISSING_PRODUCT_NAME: &str = "Missing Product Name";
pub const OUTPUT_HEADER: &str = "date,product_name,currency,price";

const DELIMITER: char = ',';

/// Consecutive input lines, numbered in read order starting at 0.
pub type Chunk = Sequenced<Vec<String>>;

/// Enriched text of one chunk. Rows are joined by `\n` with no trailing newline,
/// `text` is empty when every row was dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkOutput {
    pub text: String,
    pub rows_in: usize,
    pub rows_out: usize,
}

pub type ChunkResult = Sequenced<ChunkOutput>;

/// The four fields of a trade row, borrowed from the raw line.
#[derive(Debug, PartialEq)]
pub struct ParsedRow<'a> {
    pub date: &'a str,
    pub product_id: &'a str,
    pub currency: &'a str,
    pub price: &'a str,
}

impl<'a> ParsedRow<'a> {
    pub fn parse(line: &'a str) -> Result<Self, RowError> {
        // str::split keeps trailing empty fields
        let fields: Vec<&str> = line.split(DELIMITER).collect();
        let (date, product_id, currency, price) = match fields.as_slice() {
            [date, product_id, currency, price] => (*date, *product_id, *currency, *price),
            other => return Err(RowError::FieldCount(other.len())),
        };

        if !is_valid_date(date) {
            return Err(RowError::InvalidDate(date.to_string()));
        }

        Ok(Self {
            date,
            product_id,
            currency,
            price,
        })
    }
}

/// Strict `yyyyMMdd`: exactly eight ASCII digits forming a real calendar date.
pub fn is_valid_date(date: &str) -> bool {
    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let (year, month, day) = match (
        date[0..4].parse::<i32>(),
        date[4..6].parse::<u32>(),
        date[6..8].parse::<u32>(),
    ) {
        (Ok(y), Ok(m), Ok(d)) => (y, m, d),
        _ => return false,
    };

    NaiveDate::from_ymd_opt(year, month, day).is_some()
}

#[derive(Debug, PartialEq)]
pub struct EnrichedRow<'a> {
    pub date: &'a str,
    pub product_name: &'a str,
    pub currency: &'a str,
    pub price: &'a str,
}

impl fmt::Display for EnrichedRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{d}{}{d}{}{d}{}",
            self.date,
            self.product_name,
            self.currency,
            self.price,
            d = DELIMITER
        )
    }
}

/// Replaces the product id of a trade line with the product name.
///
/// Malformed lines are dropped. Unknown product ids are kept with
/// [`MISSING_PRODUCT_NAME`].
pub struct TradeEnricher<'l, L: ?Sized> {
    lookup: &'l L,
}

impl<'l, L: Lookup + ?Sized> TradeEnricher<'l, L> {
    pub fn new(lookup: &'l L) -> Self {
        Self { lookup }
    }

    pub fn enrich_line(&self, line: &str) -> Result<String, RowError> {
        let row = ParsedRow::parse(line)?;

        let product_name = match self.lookup.lookup(row.product_id) {
            Some(name) => name,
            None => {
                warn!("missing product mapping for product_id: {}", row.product_id);
                MISSING_PRODUCT_NAME
            }
        };

        let enriched = EnrichedRow {
            date: row.date,
            product_name,
            currency: row.currency,
            price: row.price,
        };
        Ok(enriched.to_string())
    }
}

impl<L: Lookup + ?Sized> Transform for TradeEnricher<'_, L> {
    type Input = String;
    type Output = String;
    type Iter = std::option::IntoIter<String>;

    fn transform(&self, input: Self::Input) -> Self::Iter {
        match self.enrich_line(&input) {
            Ok(enriched) => Some(enriched),
            Err(e) => {
                error!("dropping trade row {:?}: {}", input, e);
                None
            }
        }
        .into_iter()
    }
}

/// Applies a row transform to every line of a chunk.
pub struct ChunkProcessor<T> {
    row: T,
}

impl<T> ChunkProcessor<T>
where
    T: Transform<Input = String, Output = String>,
{
    pub fn new(row: T) -> Self {
        Self { row }
    }

    pub fn process(&self, chunk: Chunk) -> ChunkResult {
        let Sequenced { seq, data: lines } = chunk;
        let rows_in = lines.len();

        let mut text = String::new();
        let mut rows_out = 0;
        for row in lines.into_iter().flat_map(|line| self.row.transform(line)) {
            if rows_out > 0 {
                text.push('\n');
            }
            text.push_str(&row);
            rows_out += 1;
        }

        Sequenced::new(
            seq,
            ChunkOutput {
                text,
                rows_in,
                rows_out,
            },
        )
    }
}

/// Opens an input file, decompressing it on the fly when the name ends in `.gz`.
pub fn open_input(path: &Path) -> io::Result<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    let reader = if matches!(path.to_str(), Some(p) if p.ends_with(".gz")) {
        Box::new(GzDecoder::new(file)) as Box<dyn Read + Send>
    } else {
        Box::new(file) as _
    };

    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::io::Write;

    fn products() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("1".to_string(), "Treasury Bills Domestic".to_string());
        map.insert("2".to_string(), "Corporate Bonds Domestic".to_string());
        map
    }

    fn chunk(seq: u64, lines: &[&str]) -> Chunk {
        Sequenced::new(seq, lines.iter().map(|l| l.to_string()).collect())
    }

    #[test]
    fn test_date_validation() {
        assert!(is_valid_date("20160101"));
        assert!(is_valid_date("20160229"));
        assert!(!is_valid_date("20150229"));
        assert!(!is_valid_date("20161301"));
        assert!(!is_valid_date("20160132"));
        assert!(!is_valid_date("20160001"));
        assert!(!is_valid_date("2016011"));
        assert!(!is_valid_date("201601011"));
        assert!(!is_valid_date("2016-1-1"));
        assert!(!is_valid_date("+2016011"));
        assert!(!is_valid_date(""));
    }

    #[test]
    fn test_parse_keeps_trailing_empty_fields() {
        let row = ParsedRow::parse("20160101,1,EUR,").unwrap();
        assert_eq!(row.price, "");

        assert_eq!(
            ParsedRow::parse("20160101,1,EUR,,"),
            Err(RowError::FieldCount(5))
        );
        assert_eq!(
            ParsedRow::parse("20160101,1,EUR"),
            Err(RowError::FieldCount(3))
        );
        assert_eq!(
            ParsedRow::parse("20161301,1,EUR,10.0"),
            Err(RowError::InvalidDate("20161301".to_string()))
        );
    }

    #[test]
    fn test_enrich_line() {
        let products = products();
        let enricher = TradeEnricher::new(&products);

        assert_eq!(
            enricher.enrich_line("20160101,1,EUR,10.0").unwrap(),
            "20160101,Treasury Bills Domestic,EUR,10.0"
        );
        assert_eq!(
            enricher.enrich_line("20160101,99,EUR,35.34").unwrap(),
            "20160101,Missing Product Name,EUR,35.34"
        );
        // currency and price pass through untouched
        assert_eq!(
            enricher.enrich_line("20160101,2,,abc").unwrap(),
            "20160101,Corporate Bonds Domestic,,abc"
        );
    }

    #[test]
    fn test_transform_drops_invalid_rows() {
        let products = products();
        let enricher = TradeEnricher::new(&products);

        assert_eq!(enricher.transform("20160101,1,EUR".to_string()).count(), 0);
        assert_eq!(enricher.transform("20161301,1,EUR,1".to_string()).count(), 0);
        assert_eq!(enricher.transform("".to_string()).count(), 0);
        assert_eq!(
            enricher.transform("20160101,99,EUR,1".to_string()).count(),
            1
        );
    }

    #[test]
    fn test_process_chunk() {
        let products = products();
        let processor = ChunkProcessor::new(TradeEnricher::new(&products));

        let result = processor.process(chunk(
            3,
            &[
                "20160101,1,EUR,10.0",
                "20160101,1,EUR",
                "20160101,2,EUR,20.1",
                "20161301,2,EUR,20.1",
            ],
        ));

        assert_eq!(result.seq, 3);
        assert_eq!(result.data.rows_in, 4);
        assert_eq!(result.data.rows_out, 2);
        assert_eq!(
            result.data.text,
            "20160101,Treasury Bills Domestic,EUR,10.0\n20160101,Corporate Bonds Domestic,EUR,20.1"
        );
    }

    #[test]
    fn test_fully_dropped_chunk_is_empty() {
        let products = products();
        let processor = ChunkProcessor::new(TradeEnricher::new(&products));

        let result = processor.process(chunk(0, &["garbage", "20160101,1"]));
        assert_eq!(result.seq, 0);
        assert_eq!(result.data.rows_in, 2);
        assert_eq!(result.data.rows_out, 0);
        assert!(result.data.text.is_empty());
    }

    #[test]
    fn test_split_chunks_match_single_chunk() {
        let products = products();
        let processor = ChunkProcessor::new(TradeEnricher::new(&products));
        let lines = [
            "20160101,1,EUR,10.0",
            "bad",
            "20160101,2,EUR,20.1",
            "20160101,5,USD,1",
        ];

        let whole = processor.process(chunk(0, &lines)).data.text;
        let parts: Vec<String> = lines
            .chunks(2)
            .enumerate()
            .map(|(i, c)| processor.process(chunk(i as u64, c)).data.text)
            .filter(|t| !t.is_empty())
            .collect();

        assert_eq!(whole, parts.join("\n"));
    }

    #[test]
    fn test_open_gzip_input() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let path = std::env::temp_dir().join(format!("trade-enrich-{}.csv.gz", std::process::id()));
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"date,product_id,currency,price\n").unwrap();
        encoder.finish().unwrap();

        let mut contents = String::new();
        open_input(&path).unwrap().read_to_string(&mut contents).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(contents, "date,product_id,currency,price\n");
    }
}
