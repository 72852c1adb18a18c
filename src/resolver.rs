use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Matches the `/d/<id>` segment of a Drive sharing link.
static FILE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"/d/([A-Za-z0-9_-]+)").unwrap());

/// Matches the `/d/<id>` segment of a spreadsheet link, where the id runs up
/// to the next `/`.
static SHEET_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"/d/([^/]+)").unwrap());

const DEFAULT_DRIVE_HOST: &str = "https://drive.google.com";
const DEFAULT_SHEETS_HOST: &str = "https://docs.google.com";

#[derive(Debug, Clone, Deserialize)]
pub struct DriveConfig {
    #[serde(default = "default_drive_host")]
    /// The host direct-fetch URLs are built against.
    ///
    /// Defaults to `https://drive.google.com`.
    pub host: String,

    #[serde(default = "default_sheets_host")]
    /// The host spreadsheet export URLs are built against.
    ///
    /// Defaults to `https://docs.google.com`.
    pub sheets_host: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            host: default_drive_host(),
            sheets_host: default_sheets_host(),
        }
    }
}

fn default_drive_host() -> String {
    DEFAULT_DRIVE_HOST.to_string()
}

fn default_sheets_host() -> String {
    DEFAULT_SHEETS_HOST.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The reference embeds a file id; fetch from this URL.
    Direct { file_id: String, url: String },

    /// Nothing to fetch, either empty input or no embedded id.
    NotAReference,
}

/// Turns user supplied sharing links into URLs that can be fetched directly.
#[derive(Debug, Clone)]
pub struct ReferenceResolver {
    host: String,
    sheets_host: String,
}

impl ReferenceResolver {
    pub fn new(cfg: &DriveConfig) -> Self {
        Self {
            host: cfg.host.trim_end_matches('/').to_string(),
            sheets_host: cfg.sheets_host.trim_end_matches('/').to_string(),
        }
    }

    /// Extracts the embedded file id of a reference, first match wins.
    pub fn file_id(reference: &str) -> Option<&str> {
        FILE_ID
            .captures(reference)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    pub fn resolve(&self, reference: Option<&str>) -> Resolution {
        let reference = match reference.map(str::trim) {
            Some(r) if !r.is_empty() => r,
            _ => {
                warn!("No image reference given, skipping");
                return Resolution::NotAReference;
            },
        };

        match Self::file_id(reference) {
            Some(id) => Resolution::Direct {
                file_id: id.to_string(),
                url: format!("{}/uc?export=download&id={}", self.host, id),
            },
            None => {
                warn!("No valid drive file id found in: {}", reference);
                Resolution::NotAReference
            },
        }
    }

    /// Rewrites a Drive sharing link into an embeddable view link.
    ///
    /// References that are not Drive links are returned untouched, so
    /// already hosted URLs pass straight through.
    pub fn view_url(&self, reference: &str) -> String {
        if !reference.contains("drive.google.com") {
            return reference.to_string();
        }

        match Self::file_id(reference) {
            Some(id) => format!("{}/uc?export=view&id={}", self.host, id),
            None => reference.to_string(),
        }
    }

    /// Builds the CSV export URL for a spreadsheet link.
    pub fn sheet_export_url(&self, sheet_url: &str) -> Option<String> {
        let id = SHEET_ID.captures(sheet_url)?.get(1)?.as_str();
        Some(format!(
            "{}/spreadsheets/d/{}/export?format=csv",
            self.sheets_host, id
        ))
    }
}
