use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Workbook(#[from] calamine::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Parse(String),
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

impl AppError {
    pub fn missing_columns(&self) -> &[String] {
        match self {
            AppError::MissingColumns(columns) => columns,
            _ => &[],
        }
    }
}
