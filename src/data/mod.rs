//! Universe table and outcome loading.
//!
//! `summary.csv` holds one row per universe; the uid is the 1-based row
//! position. Result files are CSVs with a `uid` column and one column per
//! field; rows may be missing (failed universes) or hold non-finite values.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::config::Decision;
use crate::logging::{log, obj, v_str, Domain, Level};
use serde_json::json;

/// Splits one CSV line, honouring double quotes and `""` escapes.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => out.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    out.push(field);
    out
}

/// Quotes a field when it contains a separator, quote or newline.
pub fn escape_csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Reads every non-empty line of a CSV, discarding the first `row_start` rows.
pub fn read_csv(path: &Path, row_start: usize) -> Result<Vec<Vec<String>>> {
    let file = File::open(path).with_context(|| format!("Error: {} does not exist.", path.display()))?;
    let mut rows = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        rows.push(split_csv_line(line));
    }
    Ok(rows.into_iter().skip(row_start).collect())
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Error: {} does not exist.", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One row per universe. Immutable once built.
#[derive(Debug, Clone)]
pub struct UniverseTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    decisions: Vec<String>,
    /// Column index in `header` of each entry in `decisions`.
    decision_cols: Vec<usize>,
}

impl UniverseTable {
    /// Builds the table from a header and rows. Every decision must name a
    /// column; short rows are padded with empty values.
    pub fn from_rows(header: Vec<String>, mut rows: Vec<Vec<String>>, decisions: &[String]) -> Result<Self> {
        let mut decision_cols = Vec::with_capacity(decisions.len());
        for d in decisions {
            let col = header
                .iter()
                .position(|h| h == d)
                .ok_or_else(|| anyhow!("decision \"{}\" is not a column of the universe table", d))?;
            decision_cols.push(col);
        }
        for row in rows.iter_mut() {
            row.resize(header.len(), String::new());
        }
        Ok(Self {
            header,
            rows,
            decisions: decisions.to_vec(),
            decision_cols,
        })
    }

    /// Loads `summary.csv`.
    pub fn load(path: &Path, decisions: &[Decision]) -> Result<Self> {
        let mut rows = read_csv(path, 0)?;
        if rows.is_empty() {
            return Err(anyhow!("{} is empty", path.display()));
        }
        let header = rows.remove(0);
        let names: Vec<String> = decisions.iter().map(|d| d.var.clone()).collect();
        Self::from_rows(header, rows, &names).with_context(|| format!("in {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn decisions(&self) -> &[String] {
        &self.decisions
    }

    pub fn decision_index(&self, name: &str) -> Option<usize> {
        self.decisions.iter().position(|d| d == name)
    }

    pub fn uid(&self, pos: usize) -> u64 {
        pos as u64 + 1
    }

    pub fn position(&self, uid: u64) -> Option<usize> {
        let pos = uid.checked_sub(1)? as usize;
        (pos < self.rows.len()).then_some(pos)
    }

    /// Value of decision `dec` (index into `decisions()`) for the universe at
    /// position `pos`.
    pub fn decision_value(&self, pos: usize, dec: usize) -> &str {
        &self.rows[pos][self.decision_cols[dec]]
    }

    /// Distinct values of a decision, in order of first appearance.
    pub fn options_of(&self, dec: usize) -> Vec<String> {
        let mut seen = Vec::new();
        for pos in 0..self.rows.len() {
            let v = self.decision_value(pos, dec);
            if !seen.iter().any(|s: &String| s == v) {
                seen.push(v.to_string());
            }
        }
        seen
    }

    /// Decision-only rows, for planners.
    pub fn decision_rows(&self) -> Vec<Vec<String>> {
        (0..self.rows.len())
            .map(|pos| (0..self.decisions.len()).map(|d| self.decision_value(pos, d).to_string()).collect())
            .collect()
    }
}

/// Counts reported when results are merged with the universe table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQuality {
    pub total: usize,
    pub failed: usize,
    pub non_finite: usize,
}

impl DataQuality {
    pub fn log_warnings(&self, field: &str) {
        if self.failed == 0 && self.non_finite == 0 {
            return;
        }
        let pct = |n: usize| (n as f64 / self.total.max(1) as f64 * 1000.0).round() / 10.0;
        log(
            Level::Warn,
            Domain::System,
            "data_quality",
            obj(&[
                ("msg", v_str(&format!("Data quality warning: out of {} universes", self.total))),
                ("field", v_str(field)),
                ("failed", json!(self.failed)),
                ("failed_pct", json!(pct(self.failed))),
                ("non_finite", json!(self.non_finite)),
                ("non_finite_pct", json!(pct(self.non_finite))),
            ]),
        );
    }
}

/// Reads `field` from a result CSV and aligns it to universe positions.
/// Universes without a row, or with an unparsable or non-finite value, get
/// NaN.
pub fn read_outcomes(path: &Path, field: &str, table: &UniverseTable) -> Result<(Vec<f64>, DataQuality)> {
    let mut rows = read_csv(path, 0)?;
    if rows.is_empty() {
        return Err(anyhow!("{} is empty", path.display()));
    }
    let header = rows.remove(0);
    let uid_col = header
        .iter()
        .position(|h| h == "uid")
        .ok_or_else(|| anyhow!("{} has no \"uid\" column", path.display()))?;
    let field_col = header
        .iter()
        .position(|h| h == field)
        .ok_or_else(|| anyhow!("{} has no \"{}\" column", path.display(), field))?;

    let mut values = vec![f64::NAN; table.len()];
    let mut present = vec![false; table.len()];
    for row in &rows {
        let Some(pos) = row
            .get(uid_col)
            .and_then(|u| u.trim().parse::<u64>().ok())
            .and_then(|uid| table.position(uid))
        else {
            continue;
        };
        present[pos] = true;
        values[pos] = row
            .get(field_col)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(f64::NAN);
    }

    let failed = present.iter().filter(|p| !**p).count();
    let non_finite = values
        .iter()
        .zip(&present)
        .filter(|(v, p)| **p && !v.is_finite())
        .count();
    Ok((
        values,
        DataQuality {
            total: table.len(),
            failed,
            non_finite,
        },
    ))
}

/// A selection of universes (by position, duplicates allowed) together with
/// their outcomes: the working data of every sensitivity test.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub table: &'a UniverseTable,
    pub outcome: &'a [f64],
    pub rows: &'a [usize],
}

impl<'a> Frame<'a> {
    pub fn new(table: &'a UniverseTable, outcome: &'a [f64], rows: &'a [usize]) -> Self {
        Self { table, outcome, rows }
    }

    /// Selected rows with a finite outcome.
    pub fn finite_rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows.iter().copied().filter(|&r| self.outcome[r].is_finite())
    }

    /// Finite outcomes of the rows whose decision `dec` equals `option`.
    pub fn group(&self, dec: usize, option: &str) -> Vec<f64> {
        self.finite_rows()
            .filter(|&r| self.table.decision_value(r, dec) == option)
            .map(|r| self.outcome[r])
            .collect()
    }

    /// For every option present among the selected rows, the number of
    /// those rows with a finite outcome. Sorted by option.
    pub fn group_counts(&self, dec: usize) -> Vec<(String, usize)> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for &r in self.rows {
            let c = counts.entry(self.table.decision_value(r, dec)).or_default();
            if self.outcome[r].is_finite() {
                *c += 1;
            }
        }
        let mut out: Vec<(String, usize)> = counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        out.sort();
        out
    }
}
