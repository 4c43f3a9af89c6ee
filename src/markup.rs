//! Tiered price markup applied to scraped products before they are synced.

use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Number, Value};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::error::SyncError;
use crate::models::Record;
use crate::source::JsonArrayReader;

pub const PRICE_FIELD: &str = "price";
pub const ORIGINAL_PRICE_FIELD: &str = "original_price";

/// Upper bound (inclusive) and increment for prices from 40 000 to 2 000 000.
const TIERS: [(f64, f64); 10] = [
    (80_000.0, 10_000.0),
    (99_000.0, 15_000.0),
    (150_000.0, 20_000.0),
    (200_000.0, 30_000.0),
    (450_000.0, 40_000.0),
    (700_000.0, 50_000.0),
    (900_000.0, 60_000.0),
    (999_000.0, 80_000.0),
    (1_990_000.0, 100_000.0),
    (2_000_000.0, 200_000.0),
];

/// Amount added to `price`.
pub fn increment(price: f64) -> f64 {
    if price < 40_000.0 {
        return 5_000.0;
    }
    if let Some((_, step)) = TIERS.iter().find(|(ceiling, _)| price <= *ceiling) {
        return *step;
    }
    let extra_millions = ((price - 2_000_000.0) / 1_000_000.0).floor();
    100_000.0 * (extra_millions + 2.0)
}

/// Marked-up price. Integers stay integers unless the result no longer fits
/// an `i64`, in which case it is computed as a float.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn marked_up(price: &Number) -> Option<Number> {
    if let Some(p) = price.as_i64()
        && let Some(repriced) = p.checked_add(increment(p as f64) as i64)
    {
        return Some(Number::from(repriced));
    }
    let p = price.as_f64()?;
    Number::from_f64(p + increment(p))
}

/// Reprice `record` in place, keeping the scraped price in `original_price`.
/// Returns false when the record has no numeric price.
pub fn apply_markup(record: &mut Record) -> bool {
    let Some(Value::Number(original)) = record.get(PRICE_FIELD) else {
        return false;
    };
    let Some(price) = marked_up(original) else {
        return false;
    };
    let original = original.clone();
    record.insert(ORIGINAL_PRICE_FIELD.to_string(), Value::Number(original));
    record.insert(PRICE_FIELD.to_string(), Value::Number(price));
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MarkupReport {
    pub total: u64,
    pub repriced: u64,
    pub unpriced: u64,
}

/// Stream `input` (a JSON array of products) to `output` with every price
/// marked up. The output only replaces an existing file once fully written.
pub async fn reprice_file(input: &Path, output: &Path) -> Result<MarkupReport, SyncError> {
    info!(input = %input.display(), "Reading products");
    let records = JsonArrayReader::open(input).await?.into_stream();
    let partial = partial_path(output);
    let mut writer = BufWriter::new(File::create(&partial).await?);
    let mut report = MarkupReport::default();

    let written: Result<(), SyncError> = async {
        writer.write_all(b"[").await?;
        let mut records = std::pin::pin!(records);
        while let Some(mut value) = records.try_next().await? {
            report.total += 1;
            if let Value::Object(record) = &mut value {
                let before = record.get(PRICE_FIELD).cloned();
                if apply_markup(record) {
                    report.repriced += 1;
                    debug!(
                        index = report.total,
                        from = ?before,
                        to = ?record.get(PRICE_FIELD),
                        "Repriced product"
                    );
                } else {
                    report.unpriced += 1;
                    debug!(index = report.total, "Product has no price");
                }
            } else {
                report.unpriced += 1;
            }

            let separator: &[u8] = if report.total == 1 { b"\n" } else { b",\n" };
            writer.write_all(separator).await?;
            writer.write_all(&pretty(&value)?).await?;
        }
        writer.write_all(b"\n]\n").await?;
        writer.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = written {
        tokio::fs::remove_file(&partial).await.ok();
        return Err(e);
    }
    tokio::fs::rename(&partial, output).await?;

    info!(
        output = %output.display(),
        total = report.total,
        repriced = report.repriced,
        unpriced = report.unpriced,
        "Wrote repriced products"
    );
    Ok(report)
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    output.with_file_name(name)
}

fn pretty(value: &Value) -> Result<Vec<u8>, SyncError> {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value
        .serialize(&mut serializer)
        .map_err(|e| SyncError::Parse {
            offset: None,
            message: format!("cannot encode record: {e}"),
        })?;
    Ok(buf)
}
