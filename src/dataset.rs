use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use calamine::{open_workbook_auto, Reader};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::address::AddressRecord;
use crate::errors::{AppError, AppResult};

pub const COL_SITUACAO: &str = "Situacao Cadastral";
pub const COL_PORTE: &str = "Porte da Empresa";
pub const COL_SIMPLES: &str = "Optante Simples";

pub const COL_LOGRADOURO: &str = "Logradouro";
pub const COL_NUMERO: &str = "Numero";
pub const COL_BAIRRO: &str = "Bairro";
pub const COL_MUNICIPIO: &str = "Municipio";
pub const COL_UF: &str = "UF";
pub const COL_CEP: &str = "CEP";

pub const REQUIRED_COLUMNS: &[&str] = &[COL_SITUACAO, COL_PORTE, COL_SIMPLES];
pub const ADDRESS_COLUMNS: &[&str] = &[
    COL_LOGRADOURO,
    COL_NUMERO,
    COL_CEP,
    COL_BAIRRO,
    COL_MUNICIPIO,
    COL_UF,
];

const LABEL_COLUMNS: &[&str] = &["Nome Fantasia", "Razao Social"];

#[derive(Debug, Clone)]
pub struct Dataset {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<String>>,
    fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetProfile {
    pub columns: Vec<String>,
    pub row_count: usize,
    pub fingerprint: String,
    pub geocodable: bool,
}

const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];
const PREFERRED_SHEET: &str = "ORIGINAL";

impl Dataset {
    pub fn from_path(path: &Path) -> AppResult<Self> {
        let is_workbook = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| WORKBOOK_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_workbook {
            return Self::from_workbook(path);
        }
        let bytes = std::fs::read(path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "loaded dataset file");
        Self::from_csv_bytes(&bytes)
    }

    pub fn from_workbook(path: &Path) -> AppResult<Self> {
        let bytes = std::fs::read(path)?;
        let mut workbook = open_workbook_auto(path)?;
        let names = workbook.sheet_names();
        let sheet = names
            .iter()
            .find(|name| name.trim().eq_ignore_ascii_case(PREFERRED_SHEET))
            .or_else(|| names.first())
            .cloned()
            .ok_or_else(|| AppError::Parse("workbook has no sheets".into()))?;
        let range = workbook.worksheet_range(&sheet)?;
        debug!(path = %path.display(), sheet = %sheet, rows = range.height(), "loaded workbook sheet");

        let mut rows = range
            .rows()
            .map(|cells| cells.iter().map(|cell| cell.to_string()).collect::<Vec<_>>());
        let header = rows.next().unwrap_or_default();
        Self::from_records(header, rows, fingerprint(&bytes))
    }

    pub fn from_csv_bytes(bytes: &[u8]) -> AppResult<Self> {
        let content = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let delimiter = detect_delimiter(content);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(content);

        let header: Vec<String> = reader.byte_headers()?.iter().map(decode_cell).collect();
        let mut records = Vec::new();
        for record in reader.byte_records() {
            records.push(record?.iter().map(decode_cell).collect::<Vec<_>>());
        }
        Self::from_records(header, records, fingerprint(bytes))
    }

    fn from_records(
        header: Vec<String>,
        records: impl IntoIterator<Item = Vec<String>>,
        fingerprint: String,
    ) -> AppResult<Self> {
        let columns: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();
        if columns.iter().all(|c| c.is_empty()) {
            return Err(AppError::Parse("dataset has no header row".into()));
        }

        let mut rows = Vec::new();
        for record in records {
            let mut row: Vec<String> = record.iter().map(|v| v.trim().to_string()).collect();
            if row.iter().all(|v| v.is_empty()) {
                continue;
            }
            row.resize(columns.len(), String::new());
            rows.push(row);
        }

        Ok(Self::new(columns, rows, fingerprint))
    }

    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>, fingerprint: String) -> Self {
        let mut index = HashMap::with_capacity(columns.len());
        for (position, name) in columns.iter().enumerate() {
            index.entry(name.clone()).or_insert(position);
        }
        Self {
            columns,
            index,
            rows,
            fingerprint,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        self.require(REQUIRED_COLUMNS)
    }

    pub fn validate_address_columns(&self) -> AppResult<()> {
        self.require(ADDRESS_COLUMNS)
    }

    pub fn has_address_columns(&self) -> bool {
        self.missing(ADDRESS_COLUMNS).is_empty()
    }

    fn require(&self, names: &[&str]) -> AppResult<()> {
        let missing = self.missing(names);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::MissingColumns(missing))
        }
    }

    fn missing(&self, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .filter(|name| !self.index.contains_key(**name))
            .map(|name| name.to_string())
            .collect()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn row(&self, row: usize) -> Option<&[String]> {
        self.rows.get(row).map(Vec::as_slice)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let position = self.column_index(column)?;
        self.rows
            .get(row)
            .and_then(|cells| cells.get(position))
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn address(&self, row: usize) -> AddressRecord {
        AddressRecord {
            street: self.value(row, COL_LOGRADOURO).map(str::to_string),
            number: self.value(row, COL_NUMERO).map(str::to_string),
            neighborhood: self.value(row, COL_BAIRRO).map(str::to_string),
            municipality: self.value(row, COL_MUNICIPIO).map(str::to_string),
            state: self.value(row, COL_UF).map(str::to_string),
            postal_code: self.value(row, COL_CEP).map(str::to_string),
        }
    }

    pub fn display_name(&self, row: usize) -> String {
        LABEL_COLUMNS
            .iter()
            .find_map(|column| self.value(row, column))
            .map(str::to_string)
            .unwrap_or_else(|| format!("Linha {}", row + 1))
    }

    pub fn profile(&self) -> DatasetProfile {
        DatasetProfile {
            columns: self.columns.clone(),
            row_count: self.rows.len(),
            fingerprint: self.fingerprint.clone(),
            geocodable: self.has_address_columns(),
        }
    }
}

fn detect_delimiter(content: &[u8]) -> u8 {
    let header = content.split(|b| *b == b'\n').next().unwrap_or_default();
    let semicolons = header.iter().filter(|b| **b == b';').count();
    let commas = header.iter().filter(|b| **b == b',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

fn decode_cell(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text.to_string(),
        Err(_) => raw.iter().map(|byte| char::from(*byte)).collect(),
    }
}

fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    STANDARD_NO_PAD.encode(hasher.finalize())
}
