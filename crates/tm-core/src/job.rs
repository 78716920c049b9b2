//! Job data model: lifecycle states, file references, and the tool catalog.
//!
//! Enums serialize in their wire form (`queued`, `pdf-to-word`, ...) and
//! implement `Display`/`FromStr` with the same strings so the database and
//! the HTTP layer share one representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::ids::{JobId, SessionId};
use crate::plan::PlanTier;

/// Opaque per-job options handed verbatim to the tool handler.
pub type ToolOptions = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Active)
                | (Self::Active, Self::Queued)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown job state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// FileRef
// ---------------------------------------------------------------------------

/// Pointer to a stored file plus the metadata admission and results need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct FileRef {
    /// Storage-specific locator, resolvable by the storage collaborator.
    pub locator: String,
    /// Original (or generated) file name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Tool catalog
// ---------------------------------------------------------------------------

/// Broad family a tool belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Document,
    Image,
    Video,
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document => write!(f, "document"),
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
        }
    }
}

macro_rules! tool_catalog {
    ($($variant:ident => $name:literal, $category:ident;)+) => {
        /// Closed catalog of conversion tools.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ToolId {
            $(
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl ToolId {
            /// Every tool, in catalog order.
            pub const ALL: &'static [ToolId] = &[$(ToolId::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            pub fn category(&self) -> ToolCategory {
                match self {
                    $(Self::$variant => ToolCategory::$category,)+
                }
            }
        }

        impl FromStr for ToolId {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    _ => Err(Error::Validation("Invalid tool specified".into())),
                }
            }
        }
    };
}

tool_catalog! {
    PdfToWord => "pdf-to-word", Document;
    PdfToExcel => "pdf-to-excel", Document;
    PdfCompress => "pdf-compress", Document;
    PdfMerge => "pdf-merge", Document;
    PdfSplit => "pdf-split", Document;
    PdfToJpg => "pdf-to-jpg", Document;
    JpgToPdf => "jpg-to-pdf", Document;
    PdfRotate => "pdf-rotate", Document;
    PdfWatermark => "pdf-watermark", Document;
    PdfUnlock => "pdf-unlock", Document;
    PdfProtect => "pdf-protect", Document;
    PdfSign => "pdf-sign", Document;
    PdfOcr => "pdf-ocr", Document;
    PdfRepair => "pdf-repair", Document;
    PdfFlatten => "pdf-flatten", Document;
    ImgCompress => "img-compress", Image;
    ImgResize => "img-resize", Image;
    ImgConvert => "img-convert", Image;
    ImgCrop => "img-crop", Image;
    ImgWatermark => "img-watermark", Image;
    ImgRemoveBg => "img-remove-bg", Image;
    VideoCompress => "video-compress", Video;
    VideoConvert => "video-convert", Video;
    VideoTrim => "video-trim", Video;
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One unit of work converting a set of input files via one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub session_id: SessionId,
    pub tool: ToolId,
    pub inputs: Vec<FileRef>,
    pub options: ToolOptions,
    pub state: JobState,
    pub progress: u8,
    /// Number of claims so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<Vec<FileRef>>,
    pub failure_reason: Option<String>,
    pub owner: String,
    pub tier: PlanTier,
    /// Queue lane; higher lanes are served first.
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last claim or progress touch by the owning worker.
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether another claim is allowed after a failed attempt.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
