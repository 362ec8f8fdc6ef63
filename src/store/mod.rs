pub mod error;
pub mod google;
pub mod retry;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use tracing::{debug, info};

pub use error::StoreError;
pub use retry::RetryPolicy;

use crate::form::{Submission, SubmissionRecord, COLUMNS};
use retry::with_retry;

/// How many submissions recall returns by default
pub const RECALL_LIMIT: usize = 10;

/// Row-level access to a spreadsheet-like table
#[async_trait]
pub trait SheetBackend: Send + Sync {
    /// The first row as stored, empty if the sheet has none
    async fn read_header(&self) -> Result<Vec<String>, StoreError>;

    async fn write_header(&self, header: &[String]) -> Result<(), StoreError>;

    async fn append_row(&self, row: &[String]) -> Result<(), StoreError>;

    /// Every row including the header, top to bottom
    async fn read_all(&self) -> Result<Vec<Vec<String>>, StoreError>;

    /// Human-facing link to the table, if there is one
    fn dashboard_url(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportFilter {
    All,
    /// Inclusive on both ends, by the date part of the timestamp
    DateRange { start: NaiveDate, end: NaiveDate },
    Requester(String),
}

impl ExportFilter {
    fn matches(&self, record: &SubmissionRecord) -> bool {
        match self {
            ExportFilter::All => true,
            ExportFilter::DateRange { start, end } => record
                .submitted_on()
                .is_some_and(|day| *start <= day && day <= *end),
            ExportFilter::Requester(name) => same_requester(&record.requester, name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvExport {
    pub rows: usize,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSummary {
    pub total: usize,
    pub last_7_days: usize,
    pub last_30_days: usize,
    pub top_brands: Vec<(String, usize)>,
}

impl ManagerSummary {
    pub fn render(&self) -> String {
        let top = if self.top_brands.is_empty() {
            "- None".to_string()
        } else {
            self.top_brands
                .iter()
                .map(|(name, count)| format!("- {}: {}", name, count))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "Manager View\n\
             Total submissions: {}\n\
             Last 7 days: {}\n\
             Last 30 days: {}\n\
             Top brands:\n{}",
            self.total, self.last_7_days, self.last_30_days, top
        )
    }
}

/// Submission-level operations over a `SheetBackend`.
///
/// Every backend call goes through the retry policy. The sheet is shared
/// with humans, so reads locate columns by header name and never assume
/// rows are well formed.
#[derive(Clone)]
pub struct SubmissionStore {
    backend: Arc<dyn SheetBackend>,
    retry: RetryPolicy,
    dashboard_url: Option<String>,
}

impl SubmissionStore {
    pub fn new(backend: Arc<dyn SheetBackend>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            dashboard_url: None,
        }
    }

    /// Use `url` for /dashboard instead of the backend's own link
    pub fn with_dashboard_url(mut self, url: Option<String>) -> Self {
        self.dashboard_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    /// Append one row. Not idempotent: calling twice writes two rows.
    ///
    /// The row is laid out in the sheet's current column order. The header
    /// is only written when the sheet has none or lacks known columns.
    pub async fn append(&self, submission: &Submission) -> Result<(), StoreError> {
        let current =
            with_retry(&self.retry, "read header", || self.backend.read_header()).await?;
        let layout = HeaderLayout::reconcile(&current);
        if let Some(header) = &layout.rewrite {
            with_retry(&self.retry, "write header", || {
                self.backend.write_header(header)
            })
            .await?;
        }
        let row = layout.arrange(submission.to_row());
        with_retry(&self.retry, "append row", || self.backend.append_row(&row)).await?;
        info!(
            "Recorded request from {} for brand '{}'",
            submission.requester, submission.brand_name
        );
        Ok(())
    }

    /// The requester's `limit` most recent submissions, newest first
    pub async fn recall_last(
        &self,
        requester: &str,
        limit: usize,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        let records = self.records().await?;
        Ok(records
            .into_iter()
            .rev()
            .filter(|r| same_requester(&r.requester, requester))
            .take(limit)
            .collect())
    }

    /// Case-insensitive substring match on brand name, in sheet order
    pub async fn search_by_brand(&self, query: &str) -> Result<Vec<SubmissionRecord>, StoreError> {
        let needle = query.trim().to_lowercase();
        let records = self.records().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.brand_name.to_lowercase().contains(&needle))
            .collect())
    }

    pub async fn export_all(&self) -> Result<CsvExport, StoreError> {
        self.export(&ExportFilter::All).await
    }

    pub async fn export(&self, filter: &ExportFilter) -> Result<CsvExport, StoreError> {
        let records: Vec<_> = self
            .records()
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        Ok(CsvExport {
            rows: records.len(),
            content: to_csv(&records),
        })
    }

    pub fn dashboard_link(&self) -> Option<String> {
        self.dashboard_url
            .clone()
            .or_else(|| self.backend.dashboard_url())
    }

    pub async fn manager_summary(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Result<ManagerSummary, StoreError> {
        let records = self.records().await?;
        let now = now.naive_local();

        let mut last_7_days = 0;
        let mut last_30_days = 0;
        let mut brand_counts: Vec<(String, usize)> = Vec::new();
        let mut brand_slots: HashMap<String, usize> = HashMap::new();

        for record in &records {
            let brand = match record.brand_name.trim() {
                "" => "Unknown".to_string(),
                name => name.to_string(),
            };
            match brand_slots.get(&brand) {
                Some(&slot) => brand_counts[slot].1 += 1,
                None => {
                    brand_slots.insert(brand.clone(), brand_counts.len());
                    brand_counts.push((brand, 1));
                }
            }

            if let Some(ts) = record.submitted_at() {
                let days = (now - ts).num_days();
                if days <= 7 {
                    last_7_days += 1;
                }
                if days <= 30 {
                    last_30_days += 1;
                }
            }
        }

        // stable: ties keep first-seen order
        brand_counts.sort_by(|a, b| b.1.cmp(&a.1));
        brand_counts.truncate(5);

        Ok(ManagerSummary {
            total: records.len(),
            last_7_days,
            last_30_days,
            top_brands: brand_counts,
        })
    }

    async fn records(&self) -> Result<Vec<SubmissionRecord>, StoreError> {
        let rows = with_retry(&self.retry, "read sheet", || self.backend.read_all()).await?;
        Ok(parse_rows(rows))
    }
}

fn same_requester(stored: &str, requester: &str) -> bool {
    stored.trim().trim_start_matches('@').eq_ignore_ascii_case(requester.trim())
}

/// Position of each known column in the sheet
struct ColumnIndex {
    positions: [Option<usize>; COLUMNS.len()],
}

impl ColumnIndex {
    /// `None` if `header` doesn't look like a header row
    fn from_header(header: &[String]) -> Option<Self> {
        let mut positions = [None; COLUMNS.len()];
        for (slot, name) in COLUMNS.iter().enumerate() {
            positions[slot] = header
                .iter()
                .position(|cell| cell.trim().eq_ignore_ascii_case(name));
        }
        positions.iter().any(Option::is_some).then_some(Self { positions })
    }

    fn canonical() -> Self {
        let mut positions = [None; COLUMNS.len()];
        for (slot, position) in positions.iter_mut().enumerate() {
            *position = Some(slot);
        }
        Self { positions }
    }

    fn record(&self, row: &[String]) -> Option<SubmissionRecord> {
        if row.iter().all(|cell| cell.trim().is_empty()) {
            return None;
        }
        let cells = self.positions.map(|position| {
            position
                .and_then(|i| row.get(i))
                .cloned()
                .unwrap_or_default()
        });
        Some(SubmissionRecord::from_columns(cells))
    }
}

/// Where an appended row's cells go, given the sheet's existing header
struct HeaderLayout {
    positions: [usize; COLUMNS.len()],
    width: usize,
    /// Header to write before appending, if the current one won't do
    rewrite: Option<Vec<String>>,
}

impl HeaderLayout {
    fn reconcile(current: &[String]) -> Self {
        let canonical = || {
            let mut positions = [0; COLUMNS.len()];
            for (slot, position) in positions.iter_mut().enumerate() {
                *position = slot;
            }
            positions
        };

        if current.iter().all(|cell| cell.trim().is_empty()) {
            return Self {
                positions: canonical(),
                width: COLUMNS.len(),
                rewrite: Some(COLUMNS.iter().map(|c| c.to_string()).collect()),
            };
        }

        let Some(index) = ColumnIndex::from_header(current) else {
            // first row is data, leave it alone and keep reading order
            return Self {
                positions: canonical(),
                width: COLUMNS.len(),
                rewrite: None,
            };
        };

        let mut header = current.to_vec();
        let mut positions = [0; COLUMNS.len()];
        let mut missing = false;
        for (slot, name) in COLUMNS.iter().enumerate() {
            positions[slot] = match index.positions[slot] {
                Some(position) => position,
                None => {
                    missing = true;
                    header.push(name.to_string());
                    header.len() - 1
                }
            };
        }
        Self {
            positions,
            width: header.len(),
            rewrite: missing.then_some(header),
        }
    }

    fn arrange(&self, row: Vec<String>) -> Vec<String> {
        let mut cells = vec![String::new(); self.width];
        for (slot, value) in row.into_iter().enumerate().take(COLUMNS.len()) {
            cells[self.positions[slot]] = value;
        }
        cells
    }
}

fn parse_rows(rows: Vec<Vec<String>>) -> Vec<SubmissionRecord> {
    let mut rows = rows.into_iter();
    let Some(first) = rows.next() else {
        return Vec::new();
    };

    let (index, first_is_data) = match ColumnIndex::from_header(&first) {
        Some(index) => (index, false),
        None => {
            debug!("Sheet has no header row, assuming default column order");
            (ColumnIndex::canonical(), true)
        }
    };

    let leading = first_is_data.then_some(first);
    leading
        .into_iter()
        .chain(rows)
        .filter_map(|row| index.record(&row))
        .collect()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// RFC 4180 CSV with the fixed column header
pub fn to_csv(records: &[SubmissionRecord]) -> String {
    let mut content = COLUMNS
        .iter()
        .map(|c| csv_field(c))
        .collect::<Vec<_>>()
        .join(",");
    content.push_str("\r\n");

    for record in records {
        let line = record
            .to_row()
            .iter()
            .map(|cell| csv_field(cell))
            .collect::<Vec<_>>()
            .join(",");
        content.push_str(&line);
        content.push_str("\r\n");
    }

    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::sample_submission;
    use crate::store::sqlite::SqliteSheet;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn store() -> SubmissionStore {
        let sheet = SqliteSheet::open_in_memory().unwrap();
        SubmissionStore::new(Arc::new(sheet), RetryPolicy::immediate(2))
    }

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn at(day: u32) -> DateTime<FixedOffset> {
        tz().with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap()
    }

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_append_then_recall_round_trip() {
        let store = store();
        let submission = sample_submission("alice", "ACME Corp");
        store.append(&submission).await.unwrap();

        let recalled = store.recall_last("alice", 1).await.unwrap();
        assert_eq!(recalled, vec![SubmissionRecord::from(&submission)]);
    }

    #[tokio::test]
    async fn test_recall_is_newest_first_and_limited() {
        let store = store();
        for day in 1..=12 {
            let mut s = sample_submission("alice", &format!("Brand {}", day));
            s.submitted_at = at(day);
            store.append(&s).await.unwrap();
        }
        store
            .append(&sample_submission("bob", "Other"))
            .await
            .unwrap();

        let recalled = store.recall_last("alice", RECALL_LIMIT).await.unwrap();
        assert_eq!(recalled.len(), 10);
        assert_eq!(recalled[0].brand_name, "Brand 12");
        assert_eq!(recalled[9].brand_name, "Brand 3");
        assert!(store.recall_last("nobody", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_by_brand_is_case_insensitive_substring() {
        let store = store();
        for brand in ["ACME Corp", "Beta", "acme", "Acme123"] {
            store
                .append(&sample_submission("alice", brand))
                .await
                .unwrap();
        }

        let brands: Vec<_> = store
            .search_by_brand("acme")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.brand_name)
            .collect();
        assert_eq!(brands, vec!["ACME Corp", "acme", "Acme123"]);
    }

    #[tokio::test]
    async fn test_export_all_has_fixed_header() {
        let store = store();
        store
            .append(&sample_submission("alice", "Smith, Jones & \"Co\""))
            .await
            .unwrap();

        let export = store.export_all().await.unwrap();
        assert_eq!(export.rows, 1);
        let mut lines = export.content.split("\r\n");
        assert_eq!(lines.next().unwrap(), COLUMNS.join(","));
        let row = lines.next().unwrap();
        assert!(row.starts_with("2026-02-01 09:30:00,alice,\"Smith, Jones & \"\"Co\"\"\",Jo,"));
        assert!(row.contains(",Multi,\"Facebook, Others\",Kumu"));
    }

    #[tokio::test]
    async fn test_export_filters() {
        let store = store();
        for (who, day) in [("alice", 1), ("bob", 5), ("alice", 9)] {
            let mut s = sample_submission(who, "Brand");
            s.submitted_at = at(day);
            store.append(&s).await.unwrap();
        }

        let range = ExportFilter::DateRange {
            start: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 3, 5).unwrap(),
        };
        assert_eq!(store.export(&range).await.unwrap().rows, 2);

        let by_alice = ExportFilter::Requester("Alice".to_string());
        assert_eq!(store.export(&by_alice).await.unwrap().rows, 2);

        let empty = store
            .export(&ExportFilter::Requester("zed".to_string()))
            .await
            .unwrap();
        assert_eq!(empty.rows, 0);
        assert_eq!(empty.content, format!("{}\r\n", COLUMNS.join(",")));
    }

    #[tokio::test]
    async fn test_manager_summary_counts_and_top_brands() {
        let store = store();
        for (brand, day) in [
            ("Beta", 1),
            ("ACME", 20),
            ("Beta", 25),
            ("  ", 28),
            ("ACME", 29),
            ("Gamma", 30),
        ] {
            let mut s = sample_submission("alice", brand);
            s.submitted_at = at(day);
            store.append(&s).await.unwrap();
        }

        let now = tz().with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap();
        let summary = store.manager_summary(now).await.unwrap();
        assert_eq!(summary.total, 6);
        assert_eq!(summary.last_7_days, 4);
        assert_eq!(summary.last_30_days, 6);
        assert_eq!(
            summary.top_brands,
            vec![
                ("Beta".to_string(), 2),
                ("ACME".to_string(), 2),
                ("Unknown".to_string(), 1),
                ("Gamma".to_string(), 1),
            ]
        );
        assert!(summary.render().contains("Top brands:\n- Beta: 2\n- ACME: 2"));
    }

    #[test]
    fn test_parse_rows_follows_header_order() {
        let rows = vec![
            cells(&["Brand Name", "Extra", "Requester Username", "Timestamp"]),
            cells(&["Beta", "x", "bob", "2026-03-01 10:00:00"]),
            cells(&["", "", "", ""]),
            cells(&["Short"]),
        ];
        let records = parse_rows(rows);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].brand_name, "Beta");
        assert_eq!(records[0].requester, "bob");
        assert_eq!(records[0].timestamp, "2026-03-01 10:00:00");
        assert_eq!(records[0].room, "");
        assert_eq!(records[1].brand_name, "Short");
        assert_eq!(records[1].requester, "");
    }

    #[test]
    fn test_parse_rows_without_header_uses_default_order() {
        let row = sample_submission("alice", "ACME").to_row();
        let records = parse_rows(vec![row]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].requester, "alice");
    }

    #[tokio::test]
    async fn test_append_keeps_hand_reordered_columns() {
        let sheet = Arc::new(SqliteSheet::open_in_memory().unwrap());
        let mut header: Vec<String> = COLUMNS.iter().map(|c| c.to_string()).collect();
        header.swap(0, 2);
        sheet.write_header(&header).await.unwrap();
        let mut edited = sample_submission("alice", "ACME").to_row();
        edited.swap(0, 2);
        sheet.append_row(&edited).await.unwrap();

        let store = SubmissionStore::new(sheet.clone(), RetryPolicy::immediate(2));
        store
            .append(&sample_submission("bob", "Beta"))
            .await
            .unwrap();

        assert_eq!(sheet.read_header().await.unwrap(), header);
        let brands: Vec<_> = store
            .search_by_brand("")
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.requester, r.brand_name))
            .collect();
        assert_eq!(
            brands,
            vec![
                ("alice".to_string(), "ACME".to_string()),
                ("bob".to_string(), "Beta".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_append_adds_missing_columns_at_the_end() {
        let sheet = Arc::new(SqliteSheet::open_in_memory().unwrap());
        sheet
            .write_header(&cells(&["Notes", "Brand Name", "Requester Username"]))
            .await
            .unwrap();
        sheet
            .append_row(&cells(&["call back", "Old Brand", "carol"]))
            .await
            .unwrap();

        let store = SubmissionStore::new(sheet.clone(), RetryPolicy::immediate(2));
        store
            .append(&sample_submission("alice", "ACME"))
            .await
            .unwrap();

        let header = sheet.read_header().await.unwrap();
        assert_eq!(&header[..3], &cells(&["Notes", "Brand Name", "Requester Username"])[..]);
        assert_eq!(header.len(), 3 + COLUMNS.len() - 2);

        let records = store.search_by_brand("").await.unwrap();
        assert_eq!(records[0].brand_name, "Old Brand");
        assert_eq!(records[0].requester, "carol");
        assert_eq!(records[1], SubmissionRecord::from(&sample_submission("alice", "ACME")));
    }

    #[tokio::test]
    async fn test_append_writes_header_on_empty_sheet_once() {
        let sheet = Arc::new(SqliteSheet::open_in_memory().unwrap());
        let store = SubmissionStore::new(sheet.clone(), RetryPolicy::immediate(2));
        store.append(&sample_submission("alice", "A")).await.unwrap();
        store.append(&sample_submission("alice", "B")).await.unwrap();

        let rows = sheet.read_all().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], cells(&COLUMNS));
    }

    /// Fails `read_header` with a scripted sequence of errors
    struct FlakySheet {
        inner: SqliteSheet,
        failures: Mutex<Vec<StoreError>>,
    }

    #[async_trait]
    impl SheetBackend for FlakySheet {
        async fn read_header(&self) -> Result<Vec<String>, StoreError> {
            let failure = self.failures.lock().unwrap().pop();
            match failure {
                Some(e) => Err(e),
                None => self.inner.read_header().await,
            }
        }

        async fn write_header(&self, header: &[String]) -> Result<(), StoreError> {
            self.inner.write_header(header).await
        }

        async fn append_row(&self, row: &[String]) -> Result<(), StoreError> {
            self.inner.append_row(row).await
        }

        async fn read_all(&self) -> Result<Vec<Vec<String>>, StoreError> {
            self.inner.read_all().await
        }
    }

    fn flaky(failures: Vec<StoreError>) -> SubmissionStore {
        let sheet = FlakySheet {
            inner: SqliteSheet::open_in_memory().unwrap(),
            failures: Mutex::new(failures),
        };
        SubmissionStore::new(Arc::new(sheet), RetryPolicy::immediate(2))
    }

    #[tokio::test]
    async fn test_append_survives_transient_failures() {
        let store = flaky(vec![
            StoreError::Transient("429".to_string()),
            StoreError::Transient("503".to_string()),
        ]);
        store
            .append(&sample_submission("alice", "ACME"))
            .await
            .unwrap();
        assert_eq!(store.recall_last("alice", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_permission_error_writes_nothing() {
        let store = flaky(vec![StoreError::Permission("403".to_string())]);
        let err = store
            .append(&sample_submission("alice", "ACME"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Permission(_)));
        assert!(store.recall_last("alice", 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_dashboard_override_wins() {
        assert_eq!(store().dashboard_link(), None);

        let linked = store().with_dashboard_url(Some("https://example.com/sheet".to_string()));
        assert_eq!(
            linked.dashboard_link().as_deref(),
            Some("https://example.com/sheet")
        );
    }
}
