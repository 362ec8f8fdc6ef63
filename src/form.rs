use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};

/// Timestamp layout used in the sheet and in every export.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Sheet header, in write order. Also the CSV export header.
pub const COLUMNS: [&str; 12] = [
    "Timestamp",
    "Requester Username",
    "Brand Name",
    "Creator Name",
    "Room No / Room Letter",
    "Date to be Aired",
    "Camera Requirements",
    "Stage Design",
    "Other Technical Requirements",
    "Platform Mode",
    "Platforms",
    "Other Platforms",
];

/// Streaming platforms a request can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Facebook,
    Instagram,
    YouTube,
    BrandWebsite,
    Lazada,
    Shopee,
    TikTok,
    Others,
}

impl Platform {
    pub const ALL: [Platform; 8] = [
        Platform::Facebook,
        Platform::Instagram,
        Platform::YouTube,
        Platform::BrandWebsite,
        Platform::Lazada,
        Platform::Shopee,
        Platform::TikTok,
        Platform::Others,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Platform::Facebook => "Facebook",
            Platform::Instagram => "Instagram",
            Platform::YouTube => "YouTube",
            Platform::BrandWebsite => "Brand's Website",
            Platform::Lazada => "Lazada",
            Platform::Shopee => "Shopee",
            Platform::TikTok => "TikTok",
            Platform::Others => "Others",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.label() == label)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformMode {
    Single,
    Multi,
}

impl PlatformMode {
    pub fn label(self) -> &'static str {
        match self {
            PlatformMode::Single => "Single",
            PlatformMode::Multi => "Multi",
        }
    }
}

/// Free-text fields asked after the brand name, in prompt order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailField {
    CreatorName,
    Room,
    AirDate,
    CameraRequirements,
    StageDesign,
    OtherTechnical,
}

impl DetailField {
    pub const FIRST: DetailField = DetailField::CreatorName;

    pub fn prompt(self) -> &'static str {
        match self {
            DetailField::CreatorName => "Creator Name:",
            DetailField::Room => "Room No / Room Letter:",
            DetailField::AirDate => "Date to be Aired (e.g., 2026-02-15):",
            DetailField::CameraRequirements => "Camera Requirements:",
            DetailField::StageDesign => "Stage Design:",
            DetailField::OtherTechnical => "Other Technical Requirements:",
        }
    }

    /// The field asked after this one, `None` once all details are in.
    pub fn next(self) -> Option<DetailField> {
        match self {
            DetailField::CreatorName => Some(DetailField::Room),
            DetailField::Room => Some(DetailField::AirDate),
            DetailField::AirDate => Some(DetailField::CameraRequirements),
            DetailField::CameraRequirements => Some(DetailField::StageDesign),
            DetailField::StageDesign => Some(DetailField::OtherTechnical),
            DetailField::OtherTechnical => None,
        }
    }
}

/// A completed, validated request form. Only built from a finished draft.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub requester: String,
    pub submitted_at: DateTime<FixedOffset>,
    pub platform_mode: PlatformMode,
    pub platforms: Vec<Platform>,
    pub other_platforms: String,
    pub brand_name: String,
    pub creator_name: String,
    pub room: String,
    pub air_date: String,
    pub camera_requirements: String,
    pub stage_design: String,
    pub other_technical: String,
}

impl Submission {
    pub fn timestamp(&self) -> String {
        self.submitted_at.format(TIMESTAMP_FORMAT).to_string()
    }

    pub fn to_row(&self) -> Vec<String> {
        SubmissionRecord::from(self).to_row()
    }

    /// Announcement sent to the requester and the notify list once recorded.
    pub fn notification(&self) -> String {
        format!(
            "New request submitted:\n\n{}\n\nSubmitted by: @{}\nTimestamp: {}",
            SubmissionRecord::from(self).summary(),
            self.requester,
            self.timestamp()
        )
    }
}

/// One row as read back from the sheet.
///
/// Rows may have been edited by hand, so every column stays a plain string
/// and typed views (timestamp, date) are parsed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmissionRecord {
    pub timestamp: String,
    pub requester: String,
    pub brand_name: String,
    pub creator_name: String,
    pub room: String,
    pub air_date: String,
    pub camera_requirements: String,
    pub stage_design: String,
    pub other_technical: String,
    pub platform_mode: String,
    pub platforms: String,
    pub other_platforms: String,
}

impl SubmissionRecord {
    /// Build from cells in `COLUMNS` order.
    pub fn from_columns(cells: [String; 12]) -> Self {
        let [timestamp, requester, brand_name, creator_name, room, air_date, camera_requirements, stage_design, other_technical, platform_mode, platforms, other_platforms] =
            cells;
        Self {
            timestamp,
            requester,
            brand_name,
            creator_name,
            room,
            air_date,
            camera_requirements,
            stage_design,
            other_technical,
            platform_mode,
            platforms,
            other_platforms,
        }
    }

    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.requester.clone(),
            self.brand_name.clone(),
            self.creator_name.clone(),
            self.room.clone(),
            self.air_date.clone(),
            self.camera_requirements.clone(),
            self.stage_design.clone(),
            self.other_technical.clone(),
            self.platform_mode.clone(),
            self.platforms.clone(),
            self.other_platforms.clone(),
        ]
    }

    pub fn submitted_at(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(self.timestamp.trim(), TIMESTAMP_FORMAT).ok()
    }

    pub fn submitted_on(&self) -> Option<NaiveDate> {
        self.submitted_at().map(|ts| ts.date())
    }

    /// Multi-line field listing used for confirmation and notifications
    pub fn summary(&self) -> String {
        let other = self.other_platforms.trim();
        format!(
            "Brand Name: {}\n\
             Creator Name: {}\n\
             Room No / Room Letter: {}\n\
             Date to be Aired: {}\n\
             Camera Requirements: {}\n\
             Stage Design: {}\n\
             Other Technical Requirements: {}\n\
             Platform Mode: {}\n\
             Platforms: {}\n\
             Other Platforms: {}",
            self.brand_name,
            self.creator_name,
            self.room,
            self.air_date,
            self.camera_requirements,
            self.stage_design,
            self.other_technical,
            self.platform_mode,
            self.platforms,
            if other.is_empty() { "N/A" } else { other },
        )
    }
}

impl From<&Submission> for SubmissionRecord {
    fn from(s: &Submission) -> Self {
        Self {
            timestamp: s.timestamp(),
            requester: s.requester.clone(),
            brand_name: s.brand_name.clone(),
            creator_name: s.creator_name.clone(),
            room: s.room.clone(),
            air_date: s.air_date.clone(),
            camera_requirements: s.camera_requirements.clone(),
            stage_design: s.stage_design.clone(),
            other_technical: s.other_technical.clone(),
            platform_mode: s.platform_mode.label().to_string(),
            platforms: join_platforms(&s.platforms),
            other_platforms: s.other_platforms.clone(),
        }
    }
}

pub fn join_platforms(platforms: &[Platform]) -> String {
    platforms
        .iter()
        .map(|p| p.label())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
pub(crate) fn sample_submission(requester: &str, brand: &str) -> Submission {
    use chrono::TimeZone;

    let tz = FixedOffset::east_opt(8 * 3600).unwrap();
    Submission {
        requester: requester.to_string(),
        submitted_at: tz.with_ymd_and_hms(2026, 2, 1, 9, 30, 0).unwrap(),
        platform_mode: PlatformMode::Multi,
        platforms: vec![Platform::Facebook, Platform::Others],
        other_platforms: "Kumu".to_string(),
        brand_name: brand.to_string(),
        creator_name: "Jo".to_string(),
        room: "B".to_string(),
        air_date: "2026-02-15".to_string(),
        camera_requirements: "2 cams".to_string(),
        stage_design: "minimal".to_string(),
        other_technical: "none".to_string(),
    }
}
