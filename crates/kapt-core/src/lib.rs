//! Core domain model for the K-apt bid tracker: notices, snapshots, curated selections.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "kapt-core";

/// Bid board timestamp. Unparsable cells keep their original text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidTimestamp {
    Parsed(NaiveDateTime),
    Raw(String),
}

impl BidTimestamp {
    pub fn parsed(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Parsed(ts) => Some(*ts),
            Self::Raw(_) => None,
        }
    }
}

impl fmt::Display for BidTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parsed(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
            Self::Raw(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "서울")]
    Seoul,
    #[serde(rename = "인천")]
    Incheon,
    #[serde(rename = "경기")]
    Gyeonggi,
    #[serde(rename = "강원")]
    Gangwon,
    #[serde(rename = "충북")]
    Chungbuk,
    #[serde(rename = "충남")]
    Chungnam,
    #[serde(rename = "기타")]
    Other,
}

impl Region {
    pub fn label(self) -> &'static str {
        match self {
            Self::Seoul => "서울",
            Self::Incheon => "인천",
            Self::Gyeonggi => "경기",
            Self::Gangwon => "강원",
            Self::Chungbuk => "충북",
            Self::Chungnam => "충남",
            Self::Other => "기타",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "경비")]
    Security,
    #[serde(rename = "용역")]
    Service,
    #[serde(rename = "사업자")]
    Contractor,
    #[serde(rename = "기타")]
    Other,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Self::Security => "경비",
            Self::Service => "용역",
            Self::Contractor => "사업자",
            Self::Other => "기타",
        }
    }
}

/// One procurement notice as extracted from the bid board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidRecord {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub method: String,
    pub title: String,
    pub apt_name: String,
    pub status: String,
    pub region: Region,
    pub category: Category,
    pub post_date: Option<BidTimestamp>,
    pub deadline: Option<BidTimestamp>,
    #[serde(default)]
    pub detail_link: String,
    pub scraped_at: DateTime<Utc>,
}

impl BidRecord {
    /// Equality over the listing's canonical fields, ignoring when it was scraped.
    pub fn same_listing(&self, other: &BidRecord) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.method == other.method
            && self.title == other.title
            && self.apt_name == other.apt_name
            && self.status == other.status
            && self.region == other.region
            && self.category == other.category
            && self.post_date == other.post_date
            && self.deadline == other.deadline
            && self.detail_link == other.detail_link
    }
}

/// Newest-first ordering on post date. Records without a parsable post date sort last.
pub fn cmp_post_date_desc(a: &BidRecord, b: &BidRecord) -> Ordering {
    let ka = a.post_date.as_ref().and_then(BidTimestamp::parsed);
    let kb = b.post_date.as_ref().and_then(BidTimestamp::parsed);
    match (ka, kb) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// All live notices as of one synchronization run, newest post date first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BidSnapshot {
    pub records: Vec<BidRecord>,
}

impl BidSnapshot {
    pub fn new(records: Vec<BidRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn by_id(&self) -> HashMap<&str, &BidRecord> {
        self.records.iter().map(|r| (r.id.as_str(), r)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubmissionMethod {
    #[default]
    #[serde(rename = "전자")]
    Electronic,
    #[serde(rename = "직접")]
    InPerson,
}

/// Site visit window. Date and times are kept as the user entered them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteVisit {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub start_time: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub end_time: Option<String>,
}

/// On-site presentation slot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SitePresentation {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub time: Option<String>,
}

/// User-entered scheduling detail. Synchronization only ever carries it forward.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionAnnotation {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub bid_time: Option<String>,
    #[serde(default)]
    pub submission_method: SubmissionMethod,
    #[serde(default)]
    pub site_visit: SiteVisit,
    #[serde(rename = "sitePT", default)]
    pub site_pt: SitePresentation,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// A selected notice: latest known canonical fields plus the user's annotation.
///
/// Serialized flat, the annotation fields sitting next to the record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionEntry {
    #[serde(flatten)]
    pub record: BidRecord,
    #[serde(flatten)]
    pub annotation: SelectionAnnotation,
}

/// The curated selection. `entries` is unordered; `check_order` carries sequence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "StoredSelection")]
pub struct SelectionSet {
    #[serde(rename = "selectedBids")]
    pub entries: HashMap<String, SelectionEntry>,
    #[serde(rename = "checkOrder")]
    pub check_order: Vec<String>,
}

impl SelectionSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a selection at the end of `check_order`, replacing any previous entry.
    pub fn insert(&mut self, entry: SelectionEntry) {
        let id = entry.record.id.clone();
        if self.entries.insert(id.clone(), entry).is_none() {
            self.check_order.push(id);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<SelectionEntry> {
        let removed = self.entries.remove(id)?;
        self.check_order.retain(|x| x != id);
        Some(removed)
    }

    /// Entries in `check_order` sequence.
    pub fn ordered(&self) -> impl Iterator<Item = &SelectionEntry> {
        self.check_order.iter().filter_map(|id| self.entries.get(id))
    }

    /// True when `check_order` and the entry keys name the same ids, each once.
    pub fn is_consistent(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.check_order.len());
        self.check_order.len() == self.entries.len()
            && self
                .check_order
                .iter()
                .all(|id| self.entries.contains_key(id) && seen.insert(id.as_str()))
    }
}

/// Persisted shapes of the selection set, newest first.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredSelection {
    Ordered {
        #[serde(rename = "selectedBids")]
        selected_bids: HashMap<String, SelectionEntry>,
        #[serde(rename = "checkOrder")]
        check_order: Vec<String>,
    },
    Wrapped {
        #[serde(rename = "selectedBids")]
        selected_bids: HashMap<String, SelectionEntry>,
    },
    Plain(HashMap<String, SelectionEntry>),
}

impl From<StoredSelection> for SelectionSet {
    fn from(stored: StoredSelection) -> Self {
        match stored {
            StoredSelection::Ordered {
                selected_bids,
                check_order,
            } => Self {
                entries: selected_bids,
                check_order,
            },
            StoredSelection::Wrapped { selected_bids } | StoredSelection::Plain(selected_bids) => {
                let mut check_order: Vec<String> = selected_bids.keys().cloned().collect();
                check_order.sort();
                Self {
                    entries: selected_bids,
                    check_order,
                }
            }
        }
    }
}

/// Per-run synchronization counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub total_bids: usize,
    pub newly_added: usize,
    pub removed_from_selection: usize,
    pub updated_in_selection: usize,
    pub unchanged_in_selection: usize,
    pub invalid_selections_removed: usize,
}

/// Registration-date window sent with every page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// One calendar month back from the run date, clamped to the shorter month's end.
    pub fn month_ending(run_at: DateTime<Utc>) -> Self {
        let end = run_at.date_naive();
        let start = end
            .checked_sub_months(Months::new(1))
            .unwrap_or_else(|| end.with_day(1).unwrap_or(end));
        Self { start, end }
    }
}
