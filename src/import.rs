//! CSV product import.
//!
//! Two header layouts are accepted: the English template served by
//! `template_csv` and the Portuguese layout exported by older spreadsheets.
//! Each row is validated into a `ProductDraft` before anything is written.

use crate::db::{products, Pool};
use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use tracing::{info, instrument, warn};

static CAS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{2,7})-(\d{2})-(\d)$").unwrap());

const TEMPLATE_HEADERS: [&str; 7] = [
    "name",
    "compound_type",
    "cas_number",
    "description",
    "segments",
    "applications",
    "groups",
];

/// Case- and whitespace-insensitive identity used for duplicate detection.
pub fn normalize_key(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductDraft {
    pub name: String,
    pub compound_type: String,
    pub cas_number: Option<String>,
    pub description: Option<String>,
    pub segments: Vec<String>,
    pub applications: Vec<String>,
    pub groups: Vec<String>,
}

impl ProductDraft {
    pub fn identity(&self) -> (String, String) {
        (normalize_key(&self.name), normalize_key(&self.compound_type))
    }
}

#[derive(Debug, Deserialize)]
pub struct TemplateRow {
    #[serde(default)]
    name: String,
    #[serde(default)]
    compound_type: String,
    #[serde(default)]
    cas_number: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    segments: String,
    #[serde(default)]
    applications: String,
    #[serde(default)]
    groups: String,
}

#[derive(Debug, Deserialize)]
pub struct LocalizedRow {
    #[serde(default, rename = "nome")]
    name: String,
    #[serde(default, rename = "tipo_composto")]
    compound_type: String,
    #[serde(default, rename = "numero_cas")]
    cas_number: String,
    #[serde(default, rename = "descricao")]
    description: String,
    #[serde(default, rename = "segmentos")]
    segments: String,
    #[serde(default, rename = "aplicacoes")]
    applications: String,
    #[serde(default, rename = "grupos")]
    groups: String,
}

/// A raw row tagged with the header layout it was read under.
#[derive(Debug)]
pub enum ImportRow {
    Template(TemplateRow),
    Localized(LocalizedRow),
}

/// Header layout of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportSchema {
    Template,
    Localized,
}

impl ImportSchema {
    pub fn detect(headers: &[String]) -> Option<Self> {
        let has = |h: &str| headers.iter().any(|x| x == h);
        if has("name") && has("compound_type") {
            Some(ImportSchema::Template)
        } else if has("nome") && has("tipo_composto") {
            Some(ImportSchema::Localized)
        } else {
            None
        }
    }

    fn read(self, record: &csv::StringRecord, headers: &csv::StringRecord) -> Result<ImportRow, csv::Error> {
        Ok(match self {
            ImportSchema::Template => ImportRow::Template(record.deserialize(Some(headers))?),
            ImportSchema::Localized => ImportRow::Localized(record.deserialize(Some(headers))?),
        })
    }
}

impl ImportRow {
    pub fn into_draft(self) -> Result<ProductDraft, String> {
        let (name, compound_type, cas, description, segments, applications, groups) = match self {
            ImportRow::Template(r) => (
                r.name,
                r.compound_type,
                r.cas_number,
                r.description,
                r.segments,
                r.applications,
                r.groups,
            ),
            ImportRow::Localized(r) => (
                r.name,
                r.compound_type,
                r.cas_number,
                r.description,
                r.segments,
                r.applications,
                r.groups,
            ),
        };
        let name = collapse(&name);
        if name.is_empty() {
            return Err("missing product name".into());
        }
        let compound_type = collapse(&compound_type);
        if compound_type.is_empty() {
            return Err("missing compound type".into());
        }
        let cas = cas.trim();
        let cas_number = if cas.is_empty() {
            None
        } else if valid_cas(cas) {
            Some(cas.to_string())
        } else {
            return Err(format!("invalid CAS number {}", cas));
        };
        let description = description.trim();
        Ok(ProductDraft {
            name,
            compound_type,
            cas_number,
            description: (!description.is_empty()).then(|| description.to_string()),
            segments: split_list(&segments),
            applications: split_list(&applications),
            groups: split_list(&groups),
        })
    }
}

fn collapse(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `;`-separated list, trimmed, empties and repeats dropped.
pub fn split_list(value: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    value
        .split(';')
        .map(collapse)
        .filter(|v| !v.is_empty() && seen.insert(normalize_key(v)))
        .collect()
}

/// CAS registry number: format plus check digit.
pub fn valid_cas(value: &str) -> bool {
    let Some(caps) = CAS.captures(value) else {
        return false;
    };
    let body: String = format!("{}{}", &caps[1], &caps[2]);
    let check: u32 = caps[3].parse().unwrap_or(10);
    let sum: u32 = body
        .chars()
        .rev()
        .enumerate()
        .filter_map(|(i, c)| c.to_digit(10).map(|d| d * (i as u32 + 1)))
        .sum();
    sum % 10 == check
}

/// Template offered for download, with one example row.
pub fn template_csv() -> String {
    format!(
        "{}\n{}\n",
        TEMPLATE_HEADERS.join(","),
        "Acetone,Solvent,67-64-1,Ketone solvent,Paints;Coatings,Cleaning;Degreasing,Solvents"
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    pub update_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub line: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub schema: ImportSchema,
    pub total_rows: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped_existing: u64,
    pub duplicates_in_file: u64,
    pub errors: Vec<RowError>,
}

#[instrument(skip_all)]
pub async fn import_products<R: Read>(
    pool: &Pool,
    input: R,
    options: ImportOptions,
) -> Result<ImportSummary> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    let headers = csv::StringRecord::from(
        reader
            .headers()
            .context("failed to read CSV header")?
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect::<Vec<_>>(),
    );
    let header_names: Vec<String> = headers.iter().map(str::to_string).collect();
    let schema = ImportSchema::detect(&header_names)
        .ok_or_else(|| anyhow!("unrecognized CSV header: {}", header_names.join(",")))?;

    let mut summary = ImportSummary {
        schema,
        total_rows: 0,
        inserted: 0,
        updated: 0,
        skipped_existing: 0,
        duplicates_in_file: 0,
        errors: Vec::new(),
    };

    let mut drafts: Vec<(u64, ProductDraft)> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for result in reader.records() {
        summary.total_rows += 1;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                let line = err.position().map_or(0, |p| p.line());
                summary.errors.push(RowError {
                    line,
                    message: format!("malformed record: {}", err),
                });
                continue;
            }
        };
        let line = record.position().map_or(0, |p| p.line());
        if record.iter().all(|f| f.is_empty()) {
            summary.total_rows -= 1;
            continue;
        }
        let draft = schema
            .read(&record, &headers)
            .map_err(|e| format!("malformed record: {}", e))
            .and_then(ImportRow::into_draft);
        match draft {
            Ok(draft) => {
                if seen.insert(draft.identity()) {
                    drafts.push((line, draft));
                } else {
                    summary.duplicates_in_file += 1;
                }
            }
            Err(message) => summary.errors.push(RowError { line, message }),
        }
    }
    drop(reader);

    for (line, draft) in drafts {
        let outcome = match products::find_product_id(pool, &draft.name, &draft.compound_type).await {
            Ok(Some(id)) if options.update_existing => products::update_product(pool, id, &draft)
                .await
                .map(|_| summary.updated += 1),
            Ok(Some(_)) => {
                summary.skipped_existing += 1;
                Ok(())
            }
            Ok(None) => products::insert_product(pool, &draft)
                .await
                .map(|_| summary.inserted += 1),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            warn!(line, ?err, "product row failed");
            summary.errors.push(RowError {
                line,
                message: format!("{:#}", err),
            });
        }
    }

    info!(
        schema = ?summary.schema,
        total = summary.total_rows,
        inserted = summary.inserted,
        updated = summary.updated,
        skipped = summary.skipped_existing,
        duplicates = summary.duplicates_in_file,
        errors = summary.errors.len(),
        "product import finished"
    );
    Ok(summary)
}
